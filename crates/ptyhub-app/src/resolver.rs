//! Collaborators the servers consult but do not own: who a session belongs
//! to, and which credentials a user's processes receive.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::config::SessionEntry;

/// Who may attach to a session besides its owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    pub public: bool,
    pub share_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub working_directory: PathBuf,
    pub owner_id: Option<String>,
    pub access: AccessPolicy,
}

impl SessionMetadata {
    /// Whether a caller may attach: the owner, anyone holding the share
    /// token, or anyone at all when the session is public
    pub fn allows(&self, user_id: Option<&str>, token: Option<&str>) -> bool {
        if self.access.public {
            return true;
        }
        if let (Some(owner), Some(user)) = (self.owner_id.as_deref(), user_id) {
            if owner == user {
                return true;
            }
        }
        matches!(
            (self.access.share_token.as_deref(), token),
            (Some(expected), Some(given)) if !expected.is_empty() && expected == given
        )
    }
}

/// Looks up session metadata by id
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, session_id: &str) -> Result<Option<SessionMetadata>>;
}

/// Looks up the environment variables a user's processes should receive
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Result<HashMap<String, String>>;
}

/// Sessions listed in the configuration file
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    sessions: HashMap<String, SessionMetadata>,
}

impl StaticSessions {
    pub fn new(entries: impl IntoIterator<Item = SessionEntry>) -> Self {
        let sessions = entries
            .into_iter()
            .map(|entry| {
                let metadata = SessionMetadata {
                    working_directory: entry.working_directory,
                    owner_id: entry.owner,
                    access: AccessPolicy {
                        public: entry.public,
                        share_token: entry.share_token,
                    },
                };
                (entry.id, metadata)
            })
            .collect();
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionResolver for StaticSessions {
    async fn resolve(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        Ok(self.sessions.get(session_id).cloned())
    }
}

/// Every session id is known, public and rooted at the server root.
/// For local development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSessions;

#[async_trait]
impl SessionResolver for OpenSessions {
    async fn resolve(&self, _session_id: &str) -> Result<Option<SessionMetadata>> {
        Ok(Some(SessionMetadata {
            working_directory: PathBuf::from("."),
            owner_id: None,
            access: AccessPolicy {
                public: true,
                share_token: None,
            },
        }))
    }
}

/// Credentials listed in the configuration file
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticCredentials {
    pub fn new(users: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, user_id: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .users
            .get(user_id)
            .map(|env| env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve(&self, _user_id: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}
