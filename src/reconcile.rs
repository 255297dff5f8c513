//! the three way merge of directory users, local profiles and plugin output

use std::collections::BTreeMap;

use tracing::instrument;

use crate::directory_user::{FetchedUser, FetchedUsers};
use crate::events::{SecurityEventLog, UserManagementEvent, UserManagementEventKind};
use crate::plugins::{PluginContext, PluginRegistry};
use crate::profile::{identify_user_modifications, new_user_template, UserProfile, Users};
use crate::suffix::{add_suffix, strip_suffix};

/// the outcome of reconciling one connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncUsersResult {
    /// human readable changes
    pub changes: Vec<String>,
    /// some user got a new password or serial
    pub has_changed_passwords: bool,
    /// profiles to push to replicas because only their password changed
    pub profiles_to_synchronize: BTreeMap<String, UserProfile>,
}

impl SyncUsersResult {
    /// whether the store has to be written
    pub fn needs_save(&self) -> bool {
        !self.changes.is_empty() || self.has_changed_passwords
    }
}

/// reconciles the users of one connection with the local profiles
#[derive(Debug)]
pub struct Reconciler<'a> {
    /// the id of the connection
    pub connection_id: &'a str,
    /// the username suffix of the connection
    pub suffix: Option<&'a str>,
    /// users are only created when they log in
    pub create_only_on_login: bool,
    /// only this local user is created or updated
    pub only_username: Option<&'a str>,
    /// whether profiles are replicated to remote sites
    pub replication: bool,
    /// the logged in user who triggered the sync
    pub acting_user: Option<&'a str>,
    /// the active plugins
    pub plugins: &'a PluginRegistry,
    /// what the plugins get to see
    pub ctx: PluginContext<'a>,
    /// receiver of the security events
    pub security_log: &'a dyn SecurityEventLog,
}

impl Reconciler<'_> {
    /// bring the local profiles in line with the fetched users
    #[instrument(skip_all, fields(connection = self.connection_id, fetched = fetched.len()))]
    pub fn reconcile(&self, users: &mut Users, fetched: &FetchedUsers) -> SyncUsersResult {
        let mut result = SyncUsersResult {
            changes: self.remove_vanished_users(users, fetched),
            ..Default::default()
        };
        for (user_id, fetched_user) in fetched {
            if let Some(local_id) = self.existing_user_id(user_id, users) {
                self.sync_existing_user(&local_id, fetched_user, users, &mut result);
            } else if let Some(local_id) = self.new_user_id(user_id, users) {
                self.sync_new_user(&local_id, fetched_user, users, &mut result);
            } else {
                let mut msg = format!(
                    "  SKIP SYNC \"{}\" name conflict with user from \"{}\" connector.",
                    user_id, self.connection_id
                );
                if self.suffix.is_none() {
                    msg.push_str(" A suffix should be added to this connector.");
                }
                tracing::info!("{}", msg);
            }
        }
        result
    }

    /// record a security event for a change made by this connection
    fn log_event(&self, kind: UserManagementEventKind, user_id: &str) {
        self.security_log.log(UserManagementEvent::new(
            kind,
            user_id,
            self.acting_user,
            self.connection_id,
        ));
    }

    /// delete the local users of this connection which are gone from the directory
    fn remove_vanished_users(&self, users: &mut Users, fetched: &FetchedUsers) -> Vec<String> {
        let vanished: Vec<String> = users
            .iter()
            .filter(|(user_id, profile)| {
                profile.connector == self.connection_id
                    && !fetched.contains_key(strip_suffix(user_id, self.suffix))
            })
            .map(|(user_id, _)| user_id.clone())
            .collect();
        let mut changes = Vec::new();
        for user_id in vanished {
            users.remove(&user_id);
            changes.push(format!(
                "LDAP [{}]: Removed user {}",
                self.connection_id, user_id
            ));
            self.log_event(UserManagementEventKind::UserDeleted, &user_id);
        }
        changes
    }

    /// the local user of this connection for the directory user, plain or suffixed
    fn existing_user_id(&self, user_id: &str, users: &Users) -> Option<String> {
        let owned = |id: &str| {
            users
                .get(id)
                .is_some_and(|profile| profile.connector == self.connection_id)
        };
        if owned(user_id) {
            return Some(user_id.to_string());
        }
        let suffixed = add_suffix(user_id, self.suffix?);
        owned(&suffixed).then_some(suffixed)
    }

    /// a free local user id for the directory user, the plain one if
    /// possible, the suffixed one otherwise
    fn new_user_id(&self, user_id: &str, users: &Users) -> Option<String> {
        if !users.contains_key(user_id) {
            return Some(user_id.to_string());
        }
        let suffixed = add_suffix(user_id, self.suffix?);
        (!users.contains_key(&suffixed)).then_some(suffixed)
    }

    /// run the plugins against a copy of an existing profile and keep the result
    fn sync_existing_user(
        &self,
        local_id: &str,
        fetched: &FetchedUser,
        users: &mut Users,
        result: &mut SyncUsersResult,
    ) {
        if self.only_username.is_some_and(|only| only != local_id) {
            return;
        }
        let Some(existing) = users.get(local_id) else {
            return;
        };
        let mut modified = existing.clone();
        if let Err(err) = self
            .plugins
            .sync_user(&self.ctx, local_id, fetched, &mut modified)
        {
            tracing::warn!("  SKIP SYNC \"{}\": {}", local_id, err);
            return;
        }
        if modified == *existing {
            return;
        }
        let modifications = identify_user_modifications(existing, &modified);
        if modifications.password_changed {
            result.has_changed_passwords = true;
            if !modifications.edited && self.replication {
                result
                    .profiles_to_synchronize
                    .insert(local_id.to_string(), modified.clone());
            }
        }
        if !modifications.changes.is_empty() {
            result.changes.push(format!(
                "LDAP [{}]: Modified user {} ({})",
                self.connection_id,
                local_id,
                modifications.changes.join(", ")
            ));
            self.log_event(UserManagementEventKind::UserModified, local_id);
        }
        users.insert(local_id.to_string(), modified);
    }

    /// create a local user for a directory user
    fn sync_new_user(
        &self,
        local_id: &str,
        fetched: &FetchedUser,
        users: &mut Users,
        result: &mut SyncUsersResult,
    ) {
        if self.create_only_on_login {
            tracing::info!(
                "  SKIP SYNC \"{}\" (Only create user of \"{}\" connector on login)",
                local_id,
                self.connection_id
            );
            return;
        }
        if self.only_username.is_some_and(|only| only != local_id) {
            return;
        }
        let mut profile = new_user_template(local_id, self.connection_id, self.ctx.default_roles);
        if let Err(err) = self
            .plugins
            .sync_user(&self.ctx, local_id, fetched, &mut profile)
        {
            tracing::warn!("  SKIP SYNC \"{}\": {}", local_id, err);
            return;
        }
        users.insert(local_id.to_string(), profile);
        result.changes.push(format!(
            "LDAP [{}]: Created user {}",
            self.connection_id, local_id
        ));
        self.log_event(UserManagementEventKind::UserCreated, local_id);
    }
}
