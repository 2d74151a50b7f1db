use std::collections::BTreeMap;

use ptyhub_types::TerminalKind;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TerminalError};

/// How to launch one terminal kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSpec {
    pub command: String,
    /// Arguments placed before the per-request arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Arguments placed after the per-request arguments
    #[serde(default)]
    pub override_args: Vec<String>,
    /// At most one instance per session, regardless of caller
    #[serde(default)]
    pub exclusive: bool,
    /// Kind used by routes that do not name one
    #[serde(default)]
    pub primary: bool,
}

impl KindSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            override_args: Vec::new(),
            exclusive: false,
            primary: false,
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_override_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.override_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Final argument list: configured defaults, then the request's own
    /// arguments, then configured overrides
    pub fn merged_args(&self, request_args: &[String]) -> Vec<String> {
        self.args
            .iter()
            .chain(request_args)
            .chain(&self.override_args)
            .cloned()
            .collect()
    }
}

/// The set of terminal kinds a server recognises
#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: BTreeMap<TerminalKind, KindSpec>,
    primary: TerminalKind,
}

impl KindRegistry {
    /// Assistant CLI (exclusive, primary), alternate assistant CLI and the
    /// user's shell
    pub fn builtin() -> Self {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        let mut kinds = BTreeMap::new();
        kinds.insert(
            TerminalKind::assistant(),
            KindSpec::new("claude").exclusive().primary(),
        );
        kinds.insert(TerminalKind::alternate(), KindSpec::new("codex"));
        kinds.insert(TerminalKind::shell(), KindSpec::new(shell));
        Self {
            kinds,
            primary: TerminalKind::assistant(),
        }
    }

    /// Build a registry from configured kinds. Exactly one kind may be
    /// marked primary; with none marked, `assistant` is used if present.
    pub fn new(kinds: BTreeMap<TerminalKind, KindSpec>) -> Result<Self> {
        if kinds.is_empty() {
            return Err(TerminalError::validation("at least one terminal kind must be configured"));
        }

        let primaries: Vec<&TerminalKind> = kinds
            .iter()
            .filter(|(_, spec)| spec.primary)
            .map(|(kind, _)| kind)
            .collect();

        let primary = match primaries.as_slice() {
            [kind] => (*kind).clone(),
            [] if kinds.contains_key(&TerminalKind::assistant()) => TerminalKind::assistant(),
            [] => {
                return Err(TerminalError::validation(
                    "no terminal kind is marked primary and there is no 'assistant' kind",
                ))
            }
            _ => {
                return Err(TerminalError::validation(format!(
                    "only one terminal kind may be primary, found {}",
                    primaries.len()
                )))
            }
        };

        Ok(Self { kinds, primary })
    }

    /// Add or replace a kind
    pub fn with_kind(mut self, kind: TerminalKind, spec: KindSpec) -> Self {
        if spec.primary {
            if let Some(previous) = self.kinds.get_mut(&self.primary) {
                previous.primary = false;
            }
            self.primary = kind.clone();
        }
        self.kinds.insert(kind, spec);
        self
    }

    pub fn get(&self, kind: &TerminalKind) -> Option<&KindSpec> {
        self.kinds.get(kind)
    }

    pub fn contains(&self, kind: &TerminalKind) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn is_exclusive(&self, kind: &TerminalKind) -> bool {
        self.kinds.get(kind).is_some_and(|spec| spec.exclusive)
    }

    pub fn primary(&self) -> &TerminalKind {
        &self.primary
    }

    pub fn kinds(&self) -> impl Iterator<Item = &TerminalKind> {
        self.kinds.keys()
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
