// Configuration file
//
// Optional TOML file naming the terminal kinds a server offers, the sessions
// it knows about and per-user credential environments:
//
//   [terminals.shell]
//   command = "/bin/bash"
//   args = ["-l"]
//
//   [[sessions]]
//   id = "demo"
//   working_directory = "projects/demo"
//   owner = "alice"
//   share_token = "s3cret"
//
//   [credentials.alice]
//   ANTHROPIC_API_KEY = "..."

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ptyhub_terminal::{KindRegistry, KindSpec};
use ptyhub_types::TerminalKind;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Replaces the built-in kinds when non-empty
    pub terminals: BTreeMap<TerminalKind, KindSpec>,
    pub sessions: Vec<SessionEntry>,
    /// Environment variables injected into processes started by a user
    pub credentials: BTreeMap<String, BTreeMap<String, String>>,
}

/// One known session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionEntry {
    pub id: String,
    /// Relative paths resolve against the server root
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub share_token: Option<String>,
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".")
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: FileConfig = toml::from_str(content)?;
        let mut seen = std::collections::HashSet::new();
        for session in &config.sessions {
            if !seen.insert(session.id.as_str()) {
                anyhow::bail!("session '{}' is listed more than once", session.id);
            }
        }
        Ok(config)
    }

    /// Load from `path` if given, otherwise an empty configuration
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn kind_registry(&self) -> Result<KindRegistry> {
        if self.terminals.is_empty() {
            return Ok(KindRegistry::builtin());
        }
        KindRegistry::new(self.terminals.clone()).context("Invalid [terminals] configuration")
    }
}
