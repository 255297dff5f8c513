//! username suffixes which tie users to connections

use std::collections::BTreeMap;

use crate::config::{ConfigError, ConnectionConfig};

/// whether the username carries the suffix
pub fn username_matches_suffix(username: &str, suffix: &str) -> bool {
    username
        .strip_suffix(suffix)
        .is_some_and(|rest| rest.ends_with('@'))
}

/// the username without the suffix, unchanged if it does not carry it
pub fn strip_suffix<'a>(username: &'a str, suffix: Option<&str>) -> &'a str {
    match suffix {
        Some(suffix) if username_matches_suffix(username, suffix) => {
            &username[..username.len() - suffix.len() - 1]
        }
        _ => username,
    }
}

/// the username with the suffix, unchanged if it already carries it
pub fn add_suffix(username: &str, suffix: &str) -> String {
    if username_matches_suffix(username, suffix) {
        username.to_string()
    } else {
        format!("{}@{}", username, suffix)
    }
}

/// the suffixes of all configured connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuffixRegistry {
    /// connection ids by suffix
    suffixes: BTreeMap<String, String>,
}

impl SuffixRegistry {
    /// collect the suffixes, no two connections may share one
    pub fn new(connections: &[ConnectionConfig]) -> Result<Self, ConfigError> {
        let mut suffixes: BTreeMap<String, String> = BTreeMap::new();
        for connection in connections {
            let Some(suffix) = &connection.suffix else {
                continue;
            };
            if let Some(first) = suffixes.get(suffix) {
                if *first != connection.id {
                    return Err(ConfigError::DuplicateSuffix {
                        suffix: suffix.clone(),
                        first: first.clone(),
                        second: connection.id.clone(),
                    });
                }
            }
            suffixes.insert(suffix.clone(), connection.id.clone());
        }
        Ok(SuffixRegistry { suffixes })
    }

    /// the connection the suffix of the username points to, None if the
    /// username carries no configured suffix
    pub fn enforced_connection(&self, username: &str) -> Result<Option<&str>, ConfigError> {
        let mut matches = self
            .suffixes
            .iter()
            .filter(|(suffix, _)| username_matches_suffix(username, suffix))
            .map(|(_, id)| id.as_str());
        match (matches.next(), matches.next()) {
            (None, _) => Ok(None),
            (Some(id), None) => Ok(Some(id)),
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousSuffix(username.to_string())),
        }
    }
}
