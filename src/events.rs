//! security events and the hook called after each sync pass

use std::collections::BTreeMap;

use thiserror::Error;

use crate::profile::UserProfile;

/// the kind of change to a local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserManagementEventKind {
    /// a user was created
    UserCreated,
    /// a user was modified
    UserModified,
    /// a user was deleted
    UserDeleted,
}

impl std::fmt::Display for UserManagementEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserManagementEventKind::UserCreated => write!(f, "user created"),
            UserManagementEventKind::UserModified => write!(f, "user modified"),
            UserManagementEventKind::UserDeleted => write!(f, "user deleted"),
        }
    }
}

/// the connector type reported in every event of this crate
pub const CONNECTOR_TYPE: &str = "ldap";

/// a change to a local user made by a directory connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserManagementEvent {
    /// what happened
    pub kind: UserManagementEventKind,
    /// the local user which was changed
    pub affected_user: String,
    /// the logged in user who triggered the change, None for background syncs
    pub acting_user: Option<String>,
    /// always [CONNECTOR_TYPE]
    pub connector_type: &'static str,
    /// the id of the connection which made the change
    pub connection_id: String,
}

impl UserManagementEvent {
    /// an event for a change made by the given connection
    pub fn new(
        kind: UserManagementEventKind,
        affected_user: &str,
        acting_user: Option<&str>,
        connection_id: &str,
    ) -> Self {
        UserManagementEvent {
            kind,
            affected_user: affected_user.to_string(),
            acting_user: acting_user.map(str::to_string),
            connector_type: CONNECTOR_TYPE,
            connection_id: connection_id.to_string(),
        }
    }
}

/// receiver of security events, logging is fire and forget
pub trait SecurityEventLog: std::fmt::Debug {
    /// record an event
    fn log(&self, event: UserManagementEvent);
}

/// writes security events as tracing events with target `security`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSecurityLog;

impl SecurityEventLog for TracingSecurityLog {
    fn log(&self, event: UserManagementEvent) {
        tracing::info!(
            target: "security",
            kind = %event.kind,
            affected_user = %event.affected_user,
            acting_user = event.acting_user.as_deref().unwrap_or(""),
            connector = event.connector_type,
            connection_id = %event.connection_id,
            "user management event"
        );
    }
}

/// errors returned by a [SyncFinishedHook]
#[derive(Debug, Error)]
pub enum HookError {
    /// the hook can not run in the current context, ignored by the caller
    #[error("hook not applicable in this context")]
    NotApplicable,
    /// the hook failed
    #[error("sync finished hook failed: {0}")]
    Failed(String),
}

/// what a [SyncFinishedHook] gets to see after a sync pass
#[derive(Debug, Clone, Copy)]
pub struct SyncFinished<'a> {
    /// the connection which was synced
    pub connection_id: &'a str,
    /// profiles whose password changed and which have to be pushed to replicas
    pub profiles_to_synchronize: &'a BTreeMap<String, UserProfile>,
    /// the human readable changes of the pass
    pub changes: &'a [String],
    /// whether the changes should be recorded in the change log
    pub add_to_changelog: bool,
    /// more verbose error reporting
    pub debug: bool,
}

/// called after each sync pass, before the store is saved
pub trait SyncFinishedHook: std::fmt::Debug {
    /// react to the finished pass
    fn sync_finished(&self, finished: &SyncFinished<'_>) -> Result<(), HookError>;
}

/// a hook which does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl SyncFinishedHook for NoopHook {
    fn sync_finished(&self, _finished: &SyncFinished<'_>) -> Result<(), HookError> {
        Ok(())
    }
}

/// call the hook, [HookError::NotApplicable] is treated as success
pub fn call_sync_finished(
    hook: &dyn SyncFinishedHook,
    finished: &SyncFinished<'_>,
) -> Result<(), HookError> {
    match hook.sync_finished(finished) {
        Err(HookError::NotApplicable) => {
            tracing::debug!(
                "Sync finished hook not applicable for connection {}",
                finished.connection_id
            );
            Ok(())
        }
        other => other,
    }
}
