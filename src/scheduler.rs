//! the periodic user synchronization job over all configured connections

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::instrument;

use crate::backend::LdapBackend;
use crate::client::clear_all_caches;
use crate::config::{ConfigError, ConnectionConfig, SyncMode, SyncSettings};
use crate::connector::{LdapUserConnector, SyncEnvironment, SyncOptions};
use crate::secrets::SecretStore;
use crate::store::{LockFile, StoreError};
use crate::suffix::SuffixRegistry;

/// how often the periodic job runs
pub const SYNC_PERIOD: Duration = Duration::from_secs(60);

/// name of the lock file guarding the job in the state directory
const JOB_LOCK_FILE: &str = "user_sync.lock";

/// errors preventing the job from running at all
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// the job lock could not be taken
    #[error("Failed to lock the user synchronization job: {0}")]
    JobLock(#[from] StoreError),
}

/// the outcome of the sync of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// a sync pass ran to completion
    Synced,
    /// the last sync is recent enough
    NotNeeded,
    /// the sync pass failed
    Failed(String),
}

/// the result of one run of the job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncJobReport {
    /// another job was running, nothing was done
    pub skipped: bool,
    /// outcomes by connection id in configuration order
    pub outcomes: Vec<(String, SyncOutcome)>,
}

impl SyncJobReport {
    /// whether the sync of some connection failed
    pub fn has_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, outcome)| matches!(outcome, SyncOutcome::Failed(_)))
    }

    /// the status message shown to users
    pub fn status_message(&self) -> &'static str {
        if self.has_failures() {
            "The user synchronization failed."
        } else {
            "The user synchronization completed successfully."
        }
    }
}

/// runs the sync passes of all connections
#[derive(Debug)]
pub struct SyncOrchestrator<B> {
    /// which connections take part in the job
    sync_mode: SyncMode,
    /// directory of the job lock
    state_dir: PathBuf,
    /// directory of the caches cleared on configuration changes
    cache_dir: PathBuf,
    /// one connector per configured connection
    connectors: Vec<LdapUserConnector<B>>,
}

impl<B: LdapBackend> SyncOrchestrator<B> {
    /// build the connectors of all configured connections
    ///
    /// `backend` is called once per connection
    pub fn from_settings<F>(
        settings: &SyncSettings,
        secrets: Arc<dyn SecretStore>,
        mut backend: F,
    ) -> Result<Self, ConfigError>
    where
        F: FnMut(&ConnectionConfig) -> B,
    {
        let suffixes = Arc::new(SuffixRegistry::new(&settings.connections)?);
        let connectors = settings
            .connections
            .iter()
            .map(|config| {
                LdapUserConnector::new(
                    Arc::new(config.clone()),
                    backend(config),
                    secrets.clone(),
                    suffixes.clone(),
                    &settings.custom_attributes,
                    &settings.state_dir,
                    settings.cache_dir.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SyncOrchestrator {
            sync_mode: settings.sync_mode.clone(),
            state_dir: settings.state_dir.clone(),
            cache_dir: settings.cache_dir.clone(),
            connectors,
        })
    }

    /// all connectors in configuration order
    pub fn connectors(&self) -> &[LdapUserConnector<B>] {
        &self.connectors
    }

    /// the connector of the given connection
    pub fn connector_mut(&mut self, id: &str) -> Option<&mut LdapUserConnector<B>> {
        self.connectors.iter_mut().find(|c| c.id() == id)
    }

    /// run the sync of every active connection which is due, or of all of
    /// them when `enforce` is set
    ///
    /// a failing connection does not keep the others from being synced
    #[instrument(skip(self, env))]
    pub async fn execute_sync_job(
        &mut self,
        env: &SyncEnvironment<'_>,
        enforce: bool,
    ) -> Result<SyncJobReport, SchedulerError> {
        let _lock = match LockFile::acquire(&self.state_dir.join(JOB_LOCK_FILE)) {
            Ok(lock) => lock,
            Err(StoreError::Locked(_)) => {
                tracing::info!("Another synchronization job is already running: Skipping this sync");
                return Ok(SyncJobReport {
                    skipped: true,
                    ..Default::default()
                });
            }
            Err(err) => return Err(err.into()),
        };

        let mut report = SyncJobReport::default();
        for connector in &mut self.connectors {
            if connector.config().disabled || !self.sync_mode.includes(connector.id()) {
                continue;
            }
            if !enforce && !connector.sync_is_needed() {
                report
                    .outcomes
                    .push((connector.id().to_string(), SyncOutcome::NotNeeded));
                continue;
            }
            let outcome = match connector.do_sync(env, SyncOptions::default()).await {
                Ok(()) => SyncOutcome::Synced,
                Err(err) => {
                    tracing::error!("Exception in sync of connection {}: {}", connector.id(), err);
                    SyncOutcome::Failed(err.to_string())
                }
            };
            report.outcomes.push((connector.id().to_string(), outcome));
        }
        Ok(report)
    }

    /// sync all active connections now, regardless of the last sync time
    pub async fn sync_now(
        &mut self,
        env: &SyncEnvironment<'_>,
    ) -> Result<SyncJobReport, SchedulerError> {
        self.execute_sync_job(env, true).await
    }

    /// run the job every `period` until `shutdown` completes
    pub async fn run_periodic(
        &mut self,
        env: &SyncEnvironment<'_>,
        period: Duration,
        shutdown: impl Future<Output = ()>,
    ) {
        tracing::info!("Starting periodic user synchronization every {:?}", period);
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Stopping periodic user synchronization");
                    break;
                }
                _ = ticks.tick() => {
                    match self.execute_sync_job(env, false).await {
                        Ok(report) if report.has_failures() => {
                            tracing::warn!("{}", report.status_message());
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!("{}", err),
                    }
                }
            }
        }
    }

    /// forget everything cached about the connections, called when the
    /// configuration changed
    pub fn config_changed(&self) {
        if let Err(err) = clear_all_caches(&self.cache_dir) {
            tracing::warn!(
                "Failed to clear the caches in {}: {}",
                self.cache_dir.display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSpec;
    use crate::events::UserManagementEventKind;
    use crate::secrets::StaticSecrets;
    use crate::testing::{
        test_config, FakeDirectory, MemoryUserStore, RecordingHook, RecordingSecurityLog,
    };

    /// the collaborators of the job
    #[derive(Debug, Default)]
    struct Collaborators {
        store: MemoryUserStore,
        log: RecordingSecurityLog,
        hook: RecordingHook,
    }

    impl Collaborators {
        fn env<'a>(&'a self, settings: &'a SyncSettings) -> SyncEnvironment<'a> {
            SyncEnvironment::from_settings(settings, &self.store, &self.log, &self.hook)
        }
    }

    fn settings(dir: &std::path::Path, connections: Vec<ConnectionConfig>) -> SyncSettings {
        SyncSettings {
            sync_mode: SyncMode::All,
            default_roles: vec!["user".to_string()],
            contact_groups: vec![],
            custom_attributes: vec![],
            state_dir: dir.join("state"),
            cache_dir: dir.join("cache"),
            replication: false,
            debug: false,
            connections,
        }
    }

    fn unreachable_config(id: &str) -> ConnectionConfig {
        let mut config = test_config(id);
        config.servers = ServerSpec::Fixed {
            server: "ldap9".to_string(),
            failover_servers: vec![],
        };
        config
    }

    fn build_orchestrator(
        settings: &SyncSettings,
        directory: &FakeDirectory,
    ) -> SyncOrchestrator<FakeDirectory> {
        SyncOrchestrator::from_settings(settings, Arc::new(StaticSecrets::default()), |_| {
            directory.clone()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_failing_connection_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let directory = FakeDirectory::new();
        directory.set_unreachable("ldap9");
        directory.add_person("carol", &[]);
        let settings = settings(dir.path(), vec![unreachable_config("broken"), test_config("corp")]);
        let mut orchestrator = build_orchestrator(&settings, &directory);
        let collaborators = Collaborators::default();

        let report = orchestrator
            .execute_sync_job(&collaborators.env(&settings), false)
            .await
            .unwrap();
        assert!(!report.skipped);
        assert!(matches!(report.outcomes[0], (ref id, SyncOutcome::Failed(_)) if id == "broken"));
        assert_eq!(report.outcomes[1], ("corp".to_string(), SyncOutcome::Synced));
        assert_eq!(report.status_message(), "The user synchronization failed.");
        assert!(collaborators.store.users().contains_key("carol"));
        assert_eq!(collaborators.log.count(UserManagementEventKind::UserCreated), 1);

        // the working connection is not due again, the broken one is
        let report = orchestrator
            .execute_sync_job(&collaborators.env(&settings), false)
            .await
            .unwrap();
        assert!(matches!(report.outcomes[0].1, SyncOutcome::Failed(_)));
        assert_eq!(report.outcomes[1].1, SyncOutcome::NotNeeded);

        let report = orchestrator.sync_now(&collaborators.env(&settings)).await.unwrap();
        assert_eq!(report.outcomes[1].1, SyncOutcome::Synced);
        assert!(!dir.path().join("state").join(JOB_LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_running_job_is_not_started_twice() {
        let dir = tempfile::tempdir().unwrap();
        let directory = FakeDirectory::new();
        directory.add_person("carol", &[]);
        let settings = settings(dir.path(), vec![test_config("corp")]);
        let mut orchestrator = build_orchestrator(&settings, &directory);
        let collaborators = Collaborators::default();

        let lock = LockFile::acquire(&settings.state_dir.join(JOB_LOCK_FILE)).unwrap();
        let report = orchestrator.sync_now(&collaborators.env(&settings)).await.unwrap();
        assert!(report.skipped);
        assert!(report.outcomes.is_empty());
        assert!(directory.opened().is_empty());
        drop(lock);

        let report = orchestrator.sync_now(&collaborators.env(&settings)).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(
            report.status_message(),
            "The user synchronization completed successfully."
        );
    }

    #[tokio::test]
    async fn test_sync_mode_and_disabled_connections() {
        let dir = tempfile::tempdir().unwrap();
        let directory = FakeDirectory::new();
        directory.add_person("carol", &[]);
        let mut disabled = test_config("disabled");
        disabled.disabled = true;
        let mut settings = settings(
            dir.path(),
            vec![test_config("corp"), test_config("other"), disabled],
        );
        settings.sync_mode = SyncMode::List {
            connections: vec!["other".to_string(), "disabled".to_string()],
        };
        let mut orchestrator = build_orchestrator(&settings, &directory);
        let collaborators = Collaborators::default();
        let report = orchestrator.sync_now(&collaborators.env(&settings)).await.unwrap();
        assert_eq!(report.outcomes, vec![("other".to_string(), SyncOutcome::Synced)]);

        settings.sync_mode = SyncMode::Disabled;
        let mut orchestrator = build_orchestrator(&settings, &directory);
        let report = orchestrator.sync_now(&collaborators.env(&settings)).await.unwrap();
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_created_users_get_default_roles_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let directory = FakeDirectory::new();
        directory.add_person("carol", &[]);
        let mut settings: SyncSettings = toml::from_str(
            r#"
            default_roles = [ "guest" ]
            replication = true
            "#,
        )
        .unwrap();
        settings.state_dir = dir.path().join("state");
        settings.cache_dir = dir.path().join("cache");
        settings.connections = vec![test_config("corp")];
        let mut orchestrator = build_orchestrator(&settings, &directory);
        let collaborators = Collaborators::default();

        let env = collaborators.env(&settings);
        assert!(env.replication);
        assert_eq!(env.acting_user, None);
        assert_eq!(env.with_acting_user("admin").acting_user, Some("admin"));

        orchestrator.sync_now(&env).await.unwrap();
        assert_eq!(
            collaborators.store.users()["carol"].roles,
            vec!["guest".to_string()]
        );
    }

    #[test]
    fn test_duplicate_suffix_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = test_config("a");
        a.suffix = Some("CORP".to_string());
        let mut b = test_config("b");
        b.suffix = Some("CORP".to_string());
        let result = SyncOrchestrator::from_settings(
            &settings(dir.path(), vec![a, b]),
            Arc::new(StaticSecrets::default()),
            |_| FakeDirectory::new(),
        );
        assert!(matches!(result, Err(ConfigError::DuplicateSuffix { .. })));
    }

    #[tokio::test]
    async fn test_run_periodic_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let directory = FakeDirectory::new();
        directory.add_person("carol", &[]);
        let settings = settings(dir.path(), vec![test_config("corp")]);
        let mut orchestrator = build_orchestrator(&settings, &directory);
        let collaborators = Collaborators::default();
        orchestrator
            .run_periodic(
                &collaborators.env(&settings),
                Duration::from_secs(3600),
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await;
        // the first tick fires right away, the next one only after an hour
        assert_eq!(collaborators.hook.calls().len(), 1);
        assert_eq!(collaborators.store.users().len(), 1);

        std::fs::create_dir_all(settings.cache_dir.join("x")).unwrap();
        orchestrator.config_changed();
        assert!(!settings.cache_dir.exists());
    }
}
