//! passwords used for the default bind of a connection

use std::collections::HashMap;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::instrument;

use crate::config::ConfigError;

/// reference to a secret, either given explicitly in the configuration
/// or looked up by id in a [SecretStore]
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretRef {
    /// the secret itself
    Explicit(String),
    /// the id of the secret in the password store
    Store(String),
}

impl std::fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretRef::Explicit(_) => write!(f, "Explicit(***)"),
            SecretRef::Store(id) => f.debug_tuple("Store").field(id).finish(),
        }
    }
}

/// source of the secrets referenced by [SecretRef::Store]
pub trait SecretStore: std::fmt::Debug + Send + Sync {
    /// look up a secret by id
    fn lookup(&self, id: &str) -> Option<String>;

    /// resolve a secret reference, explicit secrets are returned as they are
    fn resolve(&self, secret: &SecretRef) -> Option<String> {
        match secret {
            SecretRef::Explicit(s) => Some(s.to_owned()),
            SecretRef::Store(id) => self.lookup(id),
        }
    }
}

/// secrets held in memory
#[derive(Default, Clone)]
pub struct StaticSecrets {
    /// secrets by id
    secrets: HashMap<String, String>,
}

impl std::fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecrets")
            .field("ids", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticSecrets {
    /// add a secret
    pub fn with_secret(mut self, id: &str, secret: &str) -> Self {
        self.secrets.insert(id.to_string(), secret.to_string());
        self
    }
}

impl SecretStore for StaticSecrets {
    fn lookup(&self, id: &str) -> Option<String> {
        self.secrets.get(id).cloned()
    }
}

/// a password store file with one `id:secret` line per secret
///
/// the secret may contain colons, only the first one separates it from the id
#[derive(Clone)]
pub struct PasswordStoreFile {
    /// the parsed secrets
    secrets: StaticSecrets,
}

impl std::fmt::Debug for PasswordStoreFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordStoreFile")
            .field("secrets", &self.secrets)
            .finish()
    }
}

impl PasswordStoreFile {
    /// read the password store from a file
    #[instrument]
    pub fn load(filename: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(filename)?;
        Ok(Self::parse(&content))
    }

    /// parse the content of a password store file, lines which are empty
    /// or do not contain a colon are ignored
    pub fn parse(content: &str) -> Self {
        lazy_static! {
            static ref LINE_RE: Regex = Regex::new(r"^([^:\s][^:]*):(.*)$").unwrap();
        }
        let mut secrets = StaticSecrets::default();
        for line in content.lines() {
            if let Some(caps) = LINE_RE.captures(line.trim_end_matches('\r')) {
                if let (Some(id), Some(secret)) = (caps.get(1), caps.get(2)) {
                    secrets = secrets.with_secret(id.as_str().trim(), secret.as_str());
                }
            } else if !line.trim().is_empty() {
                tracing::debug!("Ignoring malformed line in password store");
            }
        }
        Self { secrets }
    }
}

impl SecretStore for PasswordStoreFile {
    fn lookup(&self, id: &str) -> Option<String> {
        self.secrets.lookup(id)
    }
}
