//! in-memory doubles of the directory and the collaborators used by the tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::backend::{BackendError, ConnectSettings, LdapBackend, SearchResultEntry};
use crate::config::{ConnectionConfig, ConnectionConfigBuilder, Dialect, SearchScope, ServerSpec};
use crate::dn::{split_rdns, unescape_dn};
use crate::events::{
    HookError, SecurityEventLog, SyncFinished, SyncFinishedHook, UserManagementEvent,
    UserManagementEventKind,
};
use crate::profile::Users;
use crate::store::{StoreError, UserStore};

/// a connection to the fake directory below `dc=corp`
pub fn test_config(id: &str) -> ConnectionConfig {
    ConnectionConfigBuilder::default()
        .id(id)
        .dialect(Dialect::OpenLdap)
        .servers(ServerSpec::Fixed {
            server: "ldap1".to_string(),
            failover_servers: vec![],
        })
        .user_dn("ou=people,dc=corp")
        .group_dn("ou=groups,dc=corp")
        .retry_delay_ms(0u64)
        .build()
        .expect("test config is complete")
}

/// the mutable state shared by all clones of a [FakeDirectory]
#[derive(Debug, Default)]
struct DirectoryState {
    /// entries by DN
    entries: BTreeMap<String, HashMap<String, Vec<String>>>,
    /// passwords by lower cased DN
    passwords: HashMap<String, String>,
    /// hosts which can not be reached
    unreachable: HashSet<String>,
    /// every URI passed to open
    opened: Vec<String>,
    /// every DN passed to bind
    binds: Vec<String>,
    /// every (base, filter) searched
    searches: Vec<(String, String)>,
    /// number of upcoming searches failing with a dropped connection
    fail_next_searches: usize,
    /// result of server discovery
    located: Option<String>,
    /// number of discovery calls
    locate_calls: usize,
}

/// a directory held in memory, clones share the same entries
#[derive(Debug, Clone, Default)]
pub struct FakeDirectory {
    /// the shared state
    state: Arc<Mutex<DirectoryState>>,
    /// the URI of the open connection
    connected: Option<String>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().expect("directory state lock")
    }

    pub fn add_entry(&self, dn: &str, attrs: &[(&str, &[&str])]) {
        let attrs = attrs
            .iter()
            .map(|(k, v)| {
                (
                    k.to_lowercase(),
                    v.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                )
            })
            .collect();
        self.state().entries.insert(dn.to_string(), attrs);
    }

    /// a person below `ou=people,dc=corp`, returns the DN
    pub fn add_person(&self, uid: &str, attrs: &[(&str, &[&str])]) -> String {
        let dn = format!("uid={},ou=people,dc=corp", uid);
        let objectclass: &[&str] = &["person"];
        let uid_values: &[&str] = &[uid];
        let mut all = vec![("objectclass", objectclass), ("uid", uid_values)];
        all.extend_from_slice(attrs);
        self.add_entry(&dn, &all);
        dn
    }

    /// a group of unique names below `ou=groups,dc=corp`, returns the DN
    pub fn add_group(&self, cn: &str, members: &[&str]) -> String {
        let dn = format!("cn={},ou=groups,dc=corp", cn);
        self.add_entry(
            &dn,
            &[
                ("objectclass", &["groupOfUniqueNames"]),
                ("cn", &[cn]),
                ("uniquemember", members),
            ],
        );
        dn
    }

    pub fn set_attr(&self, dn: &str, attr: &str, values: &[&str]) {
        if let Some(entry) = self.state().entries.get_mut(dn) {
            entry.insert(
                attr.to_lowercase(),
                values.iter().map(|s| s.to_string()).collect(),
            );
        }
    }

    pub fn remove_entry(&self, dn: &str) {
        self.state().entries.remove(dn);
    }

    pub fn set_password(&self, dn: &str, password: &str) {
        self.state()
            .passwords
            .insert(dn.to_lowercase(), password.to_string());
    }

    pub fn set_unreachable(&self, host: &str) {
        self.state().unreachable.insert(host.to_string());
    }

    pub fn set_located_server(&self, server: &str) {
        self.state().located = Some(server.to_string());
    }

    pub fn fail_next_searches(&self, count: usize) {
        self.state().fail_next_searches = count;
    }

    pub fn opened(&self) -> Vec<String> {
        self.state().opened.clone()
    }

    pub fn binds(&self) -> Vec<String> {
        self.state().binds.clone()
    }

    pub fn searches(&self) -> Vec<(String, String)> {
        self.state().searches.clone()
    }

    pub fn locate_calls(&self) -> usize {
        self.state().locate_calls
    }
}

/// host part of an LDAP URI
fn uri_host(uri: &str) -> &str {
    let rest = uri.split_once("://").map(|(_, r)| r).unwrap_or(uri);
    rest.split(':').next().unwrap_or(rest)
}

/// normalized DN for comparisons
fn norm_dn(dn: &str) -> Vec<String> {
    split_rdns(&unescape_dn(dn))
        .into_iter()
        .map(|rdn| rdn.replace(' ', "").to_lowercase())
        .collect()
}

/// whether `dn` is within `scope` of `base`
fn in_scope(dn: &[String], base: &[String], scope: SearchScope) -> bool {
    if dn.len() < base.len() || dn[dn.len() - base.len()..] != *base {
        return false;
    }
    match scope {
        SearchScope::Base => dn.len() == base.len(),
        SearchScope::OneLevel => dn.len() == base.len() + 1,
        SearchScope::Subtree => true,
    }
}

/// the small subset of RFC 4515 filters the tests need
#[derive(Debug)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    Substring(String, Vec<String>),
}

/// replace `\xx` escapes by the characters they stand for
fn unescape_value(value: &str) -> Option<String> {
    let mut bytes = Vec::new();
    let mut iter = value.bytes();
    while let Some(b) = iter.next() {
        if b == b'\\' {
            let hex = [iter.next()?, iter.next()?];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}

/// parse one parenthesized filter, returns it and the rest of the input
fn parse_filter(input: &str) -> Option<(Filter, &str)> {
    let input = input.strip_prefix('(')?;
    let (filter, rest) = match input.chars().next()? {
        c @ ('&' | '|') => {
            let mut rest = &input[1..];
            let mut parts = Vec::new();
            while rest.starts_with('(') {
                let (part, r) = parse_filter(rest)?;
                parts.push(part);
                rest = r;
            }
            if c == '&' {
                (Filter::And(parts), rest)
            } else {
                (Filter::Or(parts), rest)
            }
        }
        '!' => {
            let (part, rest) = parse_filter(&input[1..])?;
            (Filter::Not(Box::new(part)), rest)
        }
        _ => {
            let end = input.find(')')?;
            let (attr, value) = input[..end].split_once('=')?;
            let attr = attr.to_lowercase();
            let filter = if value == "*" {
                Filter::Present(attr)
            } else if value.contains('*') {
                let parts = value
                    .split('*')
                    .map(|p| unescape_value(p).map(|p| p.to_lowercase()))
                    .collect::<Option<Vec<_>>>()?;
                Filter::Substring(attr, parts)
            } else {
                Filter::Equal(attr, unescape_value(value)?)
            };
            (filter, &input[end..])
        }
    };
    let rest = rest.strip_prefix(')')?;
    Some((filter, rest))
}

/// whether a value matches a substring pattern split at the wildcards
fn substring_match(value: &str, parts: &[String]) -> bool {
    let value = value.to_lowercase();
    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !value.starts_with(part.as_str()) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 {
            if !value[pos..].ends_with(part.as_str()) {
                return false;
            }
        } else {
            match value[pos..].find(part.as_str()) {
                Some(idx) => pos += idx + part.len(),
                None => return false,
            }
        }
    }
    true
}

impl Filter {
    fn matches(&self, dn: &str, attrs: &HashMap<String, Vec<String>>) -> bool {
        let values = |attr: &str| -> Vec<String> {
            if attr == "distinguishedname" {
                vec![dn.to_string()]
            } else {
                attrs.get(attr).cloned().unwrap_or_default()
            }
        };
        let equal = |a: &str, b: &str| unescape_dn(a).to_lowercase() == unescape_dn(b).to_lowercase();
        match self {
            Filter::And(parts) => parts.iter().all(|p| p.matches(dn, attrs)),
            Filter::Or(parts) => parts.iter().any(|p| p.matches(dn, attrs)),
            Filter::Not(part) => !part.matches(dn, attrs),
            Filter::Present(attr) => attr == "objectclass" || !values(attr).is_empty(),
            Filter::Equal(attr, value) => values(attr).iter().any(|v| equal(v, value)),
            Filter::Substring(attr, parts) => {
                values(attr).iter().any(|v| substring_match(v, parts))
            }
        }
    }
}

impl LdapBackend for FakeDirectory {
    async fn open(&mut self, uri: &str, _settings: &ConnectSettings) -> Result<(), BackendError> {
        self.connected = None;
        let mut state = self.state();
        state.opened.push(uri.to_string());
        if state.unreachable.contains(uri_host(uri)) {
            return Err(BackendError::ServerDown(format!("{} unreachable", uri)));
        }
        drop(state);
        self.connected = Some(uri.to_string());
        Ok(())
    }

    async fn simple_bind(&mut self, dn: &str, secret: &str) -> Result<(), BackendError> {
        if self.connected.is_none() {
            return Err(BackendError::NotConnected);
        }
        let mut state = self.state();
        state.binds.push(dn.to_string());
        if dn.is_empty() {
            return Ok(());
        }
        match state.passwords.get(&dn.to_lowercase()) {
            Some(password) if password == secret && !secret.is_empty() => Ok(()),
            _ => Err(BackendError::InvalidCredentials("rc=49".to_string())),
        }
    }

    async fn paged_search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
        _page_size: i32,
    ) -> Result<Vec<SearchResultEntry>, BackendError> {
        if self.connected.is_none() {
            return Err(BackendError::NotConnected);
        }
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock().expect("directory state lock");
        state.searches.push((base.to_string(), filter.to_string()));
        if state.fail_next_searches > 0 {
            state.fail_next_searches -= 1;
            self.connected = None;
            return Err(BackendError::ServerDown("connection dropped".to_string()));
        }
        let (parsed, rest) = parse_filter(filter)
            .ok_or_else(|| BackendError::FilterError(format!("rc=87 {}", filter)))?;
        if !rest.is_empty() {
            return Err(BackendError::FilterError(format!("rc=87 {}", filter)));
        }
        let base_rdns = norm_dn(base);
        let base_exists = state
            .entries
            .keys()
            .any(|dn| in_scope(&norm_dn(dn), &base_rdns, SearchScope::Subtree));
        if !base_exists {
            return Err(BackendError::NoSuchObject(format!("rc=32 {}", base)));
        }
        let wanted: Vec<String> = attrs.iter().map(|a| a.to_lowercase()).collect();
        Ok(state
            .entries
            .iter()
            .filter(|(dn, _)| in_scope(&norm_dn(dn), &base_rdns, scope))
            .filter(|(dn, entry)| parsed.matches(dn, entry))
            .map(|(dn, entry)| SearchResultEntry {
                dn: dn.clone(),
                attrs: entry
                    .iter()
                    .filter(|(k, _)| wanted.is_empty() || wanted.contains(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .collect())
    }

    async fn close(&mut self) {
        self.connected = None;
    }

    async fn locate_server(&mut self, domain: &str) -> Result<String, BackendError> {
        let mut state = self.state();
        state.locate_calls += 1;
        state
            .located
            .clone()
            .ok_or_else(|| BackendError::Other(format!("no SRV records for {}", domain)))
    }
}

/// a security log remembering all events
#[derive(Debug, Default)]
pub struct RecordingSecurityLog {
    events: Mutex<Vec<UserManagementEvent>>,
}

impl RecordingSecurityLog {
    pub fn events(&self) -> Vec<UserManagementEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn count(&self, kind: UserManagementEventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl SecurityEventLog for RecordingSecurityLog {
    fn log(&self, event: UserManagementEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

/// what a [RecordingHook] saw in one call
#[derive(Debug, Clone, PartialEq)]
pub struct HookCall {
    pub connection_id: String,
    pub profiles_to_synchronize: Vec<String>,
    pub changes: Vec<String>,
}

/// a sync finished hook remembering its calls
#[derive(Debug, Default)]
pub struct RecordingHook {
    calls: Mutex<Vec<HookCall>>,
    fail: bool,
}

impl RecordingHook {
    pub fn failing() -> Self {
        RecordingHook {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl SyncFinishedHook for RecordingHook {
    fn sync_finished(&self, finished: &SyncFinished<'_>) -> Result<(), HookError> {
        self.calls.lock().expect("calls lock").push(HookCall {
            connection_id: finished.connection_id.to_string(),
            profiles_to_synchronize: finished.profiles_to_synchronize.keys().cloned().collect(),
            changes: finished.changes.to_vec(),
        });
        if self.fail {
            return Err(HookError::Failed("replica unreachable".to_string()));
        }
        Ok(())
    }
}

/// a user store held in memory
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<Users>,
    saves: Mutex<Vec<DateTime<Utc>>>,
    locked: Mutex<bool>,
}

impl MemoryUserStore {
    pub fn with_users(users: Users) -> Self {
        MemoryUserStore {
            users: Mutex::new(users),
            ..Default::default()
        }
    }

    pub fn users(&self) -> Users {
        self.users.lock().expect("users lock").clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().expect("saves lock").len()
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock().expect("locked lock")
    }
}

impl UserStore for MemoryUserStore {
    fn load(&self, lock: bool) -> Result<Users, StoreError> {
        if lock {
            *self.locked.lock().expect("locked lock") = true;
        }
        Ok(self.users())
    }

    fn save(&self, users: &Users, now: DateTime<Utc>) -> Result<(), StoreError> {
        *self.users.lock().expect("users lock") = users.clone();
        self.saves.lock().expect("saves lock").push(now);
        self.release_lock();
        Ok(())
    }

    fn release_lock(&self) {
        *self.locked.lock().expect("locked lock") = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_subset() {
        let attrs = HashMap::from([
            ("uid".to_string(), vec!["Carol".to_string()]),
            ("objectclass".to_string(), vec!["person".to_string()]),
        ]);
        let dn = "uid=carol,ou=people,dc=corp";
        let matches = |f: &str| parse_filter(f).unwrap().0.matches(dn, &attrs);
        assert!(matches("(uid=carol)"));
        assert!(matches("(&(objectclass=person)(uid=car*))"));
        assert!(matches("(|(uid=dave)(distinguishedname=UID=carol,ou=people,dc=corp))"));
        assert!(matches("(!(uid=dave))"));
        assert!(matches("(uid=*ro*)"));
        assert!(!matches("(mail=*)"));
        assert!(matches("(uid=\\43arol)"));
        assert!(parse_filter("(uid=carol").is_none());
    }

    #[test]
    fn test_scopes() {
        let base = norm_dn("ou=people,dc=corp");
        let child = norm_dn("uid=carol, ou=People,dc=corp");
        let grandchild = norm_dn("cn=x,uid=carol,ou=people,dc=corp");
        assert!(in_scope(&base, &base, SearchScope::Base));
        assert!(in_scope(&child, &base, SearchScope::OneLevel));
        assert!(!in_scope(&grandchild, &base, SearchScope::OneLevel));
        assert!(in_scope(&grandchild, &base, SearchScope::Subtree));
        assert!(!in_scope(&base, &child, SearchScope::Subtree));
    }
}
