//! the directory client owning the connection of one configured LDAP connection

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::instrument;

use crate::backend::{BackendError, ConnectSettings, LdapBackend, SearchResultEntry};
use crate::config::{BindCredentials, ConfigError, ConnectionConfig, SearchScope, ServerSpec};
use crate::dn::escape_dn;
use crate::secrets::SecretStore;

/// errors of the directory client
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// none of the servers could be connected to
    #[error("LDAP connection failed:\n{0}")]
    Connection(String),
    /// the default bind credentials were rejected
    #[error("Unable to connect to LDAP server with the configured bind credentials of connection {connection}: {source}")]
    Credentials {
        /// the connection id
        connection: String,
        /// the error returned by the server
        source: BackendError,
    },
    /// the default bind failed for another reason
    #[error("Default bind of connection {connection} failed: {source}")]
    DefaultBind {
        /// the connection id
        connection: String,
        /// the error returned by the server
        source: BackendError,
    },
    /// the password of the bind user could not be resolved
    #[error("The password of the bind user of connection {0} could not be found")]
    MissingSecret(String),
    /// the search base does not exist
    #[error("The given base object \"{base}\" does not exist in LDAP ({source})")]
    NoSuchBase {
        /// the search base
        base: String,
        /// the error returned by the server
        source: BackendError,
    },
    /// the filter was rejected
    #[error("The given ldap filter \"{filter}\" is invalid ({source})")]
    InvalidFilter {
        /// the search filter
        filter: String,
        /// the error returned by the server
        source: BackendError,
    },
    /// the server reached a size limit, the incomplete result was thrown away
    #[error("The response reached a size limit. This could be due to a sizelimit configuration on the LDAP server. Throwing away the incomplete results. You should change the scope of operation within the ldap or adapt the limit settings of the LDAP server.")]
    SizeLimit,
    /// any other search error
    #[error("Unable to successfully perform the LDAP search (Base: {base}, Scope: {scope}, Filter: {filter}): {source}")]
    Search {
        /// the search base
        base: String,
        /// the search scope
        scope: &'static str,
        /// the search filter
        filter: String,
        /// the error returned by the server
        source: BackendError,
    },
    /// invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DirectoryError {
    /// whether reconnecting and repeating the operation may help
    fn is_transient(&self) -> bool {
        matches!(self, DirectoryError::Connection(_))
    }
}

/// errors binding with end user credentials
#[derive(Debug, Error)]
pub enum BindError {
    /// the server rejected the credentials
    #[error("Invalid credentials for {dn}: {source}")]
    Credentials {
        /// the DN used for the bind
        dn: String,
        /// the error returned by the server
        source: BackendError,
    },
    /// the bind failed for another reason
    #[error("Failed to bind as {dn}: {source}")]
    Other {
        /// the DN used for the bind
        dn: String,
        /// the error returned by the server
        source: BackendError,
    },
}

/// an error during one search attempt
#[derive(Debug)]
enum SearchAttemptError {
    /// could not (re)connect
    Connect(DirectoryError),
    /// the search itself failed
    Backend(BackendError),
}

impl SearchAttemptError {
    /// whether a retry with a fresh connection may help
    fn is_transient(&self) -> bool {
        match self {
            SearchAttemptError::Connect(e) => e.is_transient(),
            SearchAttemptError::Backend(e) => e.is_transient(),
        }
    }
}

impl std::fmt::Display for SearchAttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchAttemptError::Connect(e) => write!(f, "{}", e),
            SearchAttemptError::Backend(e) => write!(f, "{}", e),
        }
    }
}

/// remove all cache files of all connections, called when the configuration changed
pub fn clear_all_caches(cache_dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(cache_dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// the client of one configured LDAP connection
#[derive(Debug)]
pub struct DirectoryClient<B> {
    /// the configuration of the connection
    config: Arc<ConnectionConfig>,
    /// the protocol library
    backend: B,
    /// source of the bind password
    secrets: Arc<dyn SecretStore>,
    /// directory of the nearest server cache
    cache_dir: PathBuf,
    /// the configuration the open connection was made with
    connected_with: Option<Arc<ConnectionConfig>>,
    /// the number of searches since the last reset
    num_queries: usize,
}

impl<B: LdapBackend> DirectoryClient<B> {
    /// a client which is not yet connected
    pub fn new(
        config: Arc<ConnectionConfig>,
        backend: B,
        secrets: Arc<dyn SecretStore>,
        cache_dir: PathBuf,
    ) -> Self {
        DirectoryClient {
            config,
            backend,
            secrets,
            cache_dir,
            connected_with: None,
            num_queries: 0,
        }
    }

    /// the configuration of the connection
    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    /// the number of searches since the last reset
    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    /// reset the search counter, done at the start of each sync pass
    pub fn reset_query_count(&mut self) {
        self.num_queries = 0;
    }

    /// whether a connection is open
    pub fn is_connected(&self) -> bool {
        self.connected_with.is_some()
    }

    /// the URI for the given server name
    pub fn format_ldap_uri(&self, server: &str) -> String {
        let scheme = if self.config.use_ssl { "ldaps" } else { "ldap" };
        let server = server.strip_suffix('.').unwrap_or(server);
        match self.config.port {
            Some(port) => format!("{}://{}:{}", scheme, server, port),
            None => format!("{}://{}", scheme, server),
        }
    }

    /// connect to the first reachable server and bind with the default credentials
    ///
    /// an existing connection made with the same configuration is reused
    /// unless `enforce_new` is set
    #[instrument(skip(self), fields(connection = %self.config.id))]
    pub async fn connect(&mut self, enforce_new: bool) -> Result<(), DirectoryError> {
        if !enforce_new && self.connected_with.as_deref() == Some(self.config.as_ref()) {
            tracing::debug!("LDAP CONNECT - Using existing connection");
            return Ok(());
        }
        tracing::debug!("LDAP CONNECT - Connecting...");
        self.disconnect().await;
        self.config.validate()?;

        let settings = ConnectSettings::from(self.config.as_ref());
        let mut errors = Vec::new();
        for server in self.servers().await {
            let uri = self.format_ldap_uri(&server);
            if let Err(err) = self.backend.open(&uri, &settings).await {
                errors.push(format!("{}: {}", uri, err));
                continue;
            }
            match self.default_bind().await {
                Ok(()) => {
                    tracing::debug!("Connected to {}", uri);
                    self.connected_with = Some(self.config.clone());
                    return Ok(());
                }
                Err(err @ DirectoryError::Credentials { .. })
                | Err(err @ DirectoryError::MissingSecret(_)) => {
                    self.clear_nearest_server_cache();
                    self.backend.close().await;
                    return Err(err);
                }
                Err(err) => {
                    self.backend.close().await;
                    errors.push(format!("{}: {}", uri, err));
                }
            }
        }
        self.clear_nearest_server_cache();
        Err(DirectoryError::Connection(errors.join("\n")))
    }

    /// close the connection
    pub async fn disconnect(&mut self) {
        self.backend.close().await;
        self.connected_with = None;
    }

    /// the servers to try in order
    async fn servers(&mut self) -> Vec<String> {
        match &self.config.servers {
            ServerSpec::Fixed {
                server,
                failover_servers,
            } => std::iter::once(server)
                .chain(failover_servers.iter())
                .cloned()
                .collect(),
            ServerSpec::Discover { domain } => {
                let domain = domain.clone();
                vec![self.discover_nearest_server(&domain).await]
            }
        }
    }

    /// the nearest server of the domain, from the cache if possible,
    /// the domain name itself if discovery fails
    async fn discover_nearest_server(&mut self, domain: &str) -> String {
        if let Some(server) = self.nearest_server_from_cache() {
            tracing::debug!("Using cached server {}", server);
            return server;
        }
        match self.backend.locate_server(domain).await {
            Ok(server) => {
                tracing::info!("  DISCOVERY: Discovered server {} from {}", server, domain);
                self.cache_nearest_server(&server);
                server
            }
            Err(err) => {
                tracing::warn!(
                    "  DISCOVERY: Failed to discover a server from domain {} ({}), trying to use the domain DNS name as server",
                    domain,
                    err
                );
                domain.to_string()
            }
        }
    }

    /// path of the file caching the discovered server
    fn nearest_server_cache_path(&self) -> PathBuf {
        self.cache_dir
            .join(format!("nearest_server.{}", self.config.id))
    }

    /// the cached nearest server
    fn nearest_server_from_cache(&self) -> Option<String> {
        let server = std::fs::read_to_string(self.nearest_server_cache_path()).ok()?;
        let server = server.trim();
        (!server.is_empty()).then(|| server.to_string())
    }

    /// remember the discovered server
    fn cache_nearest_server(&self, server: &str) {
        let result = std::fs::create_dir_all(&self.cache_dir)
            .and_then(|()| std::fs::write(self.nearest_server_cache_path(), server));
        if let Err(err) = result {
            tracing::warn!("Failed to cache nearest server {}: {}", server, err);
        }
    }

    /// forget the discovered server so the next connect discovers again
    pub fn clear_nearest_server_cache(&self) {
        if !matches!(self.config.servers, ServerSpec::Discover { .. }) {
            return;
        }
        match std::fs::remove_file(self.nearest_server_cache_path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!("Failed to clear nearest server cache: {}", e);
            }
            _ => {}
        }
    }

    /// bind with the configured service account, or anonymously
    #[instrument(skip(self), fields(connection = %self.config.id))]
    pub async fn default_bind(&mut self) -> Result<(), DirectoryError> {
        let (dn, secret) = match &self.config.bind {
            BindCredentials::Anonymous => (String::new(), String::new()),
            BindCredentials::Credentials { dn, secret } => {
                let secret = self
                    .secrets
                    .resolve(secret)
                    .ok_or_else(|| DirectoryError::MissingSecret(self.config.id.clone()))?;
                (dn.clone(), secret)
            }
        };
        match self.backend.simple_bind(&dn, &secret).await {
            Ok(()) => Ok(()),
            Err(source) if source.is_credentials() => Err(DirectoryError::Credentials {
                connection: self.config.id.clone(),
                source,
            }),
            Err(source) => Err(DirectoryError::DefaultBind {
                connection: self.config.id.clone(),
                source,
            }),
        }
    }

    /// bind with end user credentials, never retried on another server
    #[instrument(skip(self, secret))]
    pub async fn bind(&mut self, dn: &str, secret: &str) -> Result<(), BindError> {
        match self.backend.simple_bind(dn, secret).await {
            Ok(()) => Ok(()),
            Err(source) if source.is_credentials() => Err(BindError::Credentials {
                dn: dn.to_string(),
                source,
            }),
            Err(source) => Err(BindError::Other {
                dn: dn.to_string(),
                source,
            }),
        }
    }

    /// a single search attempt, connecting first if needed
    async fn try_search(
        &mut self,
        base: &str,
        filter: &str,
        columns: &[String],
        scope: SearchScope,
    ) -> Result<Vec<SearchResultEntry>, SearchAttemptError> {
        self.connect(false)
            .await
            .map_err(SearchAttemptError::Connect)?;
        let entries = self
            .backend
            .paged_search(&escape_dn(base), scope, filter, columns, self.config.page_size)
            .await
            .map_err(SearchAttemptError::Backend)?;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.dn.is_empty())
            .map(|entry| SearchResultEntry {
                dn: entry.dn.to_lowercase(),
                attrs: entry.attrs,
            })
            .collect())
    }

    /// paged search returning entries with lower cased DNs
    ///
    /// transient failures are retried exactly once with a fresh connection
    #[instrument(skip(self, columns), fields(connection = %self.config.id))]
    pub async fn search(
        &mut self,
        base: &str,
        filter: &str,
        columns: &[String],
        scope: SearchScope,
    ) -> Result<Vec<SearchResultEntry>, DirectoryError> {
        tracing::debug!(
            "LDAP_SEARCH \"{}\" \"{}\" \"{}\" \"{:?}\"",
            base,
            scope.as_ldapsearch_arg(),
            filter,
            columns
        );
        self.num_queries += 1;
        let start_time = Instant::now();
        let mut retried = false;
        loop {
            match self.try_search(base, filter, columns, scope).await {
                Ok(entries) => {
                    tracing::debug!(
                        "  RESULT length: {}, duration: {:.3}",
                        entries.len(),
                        start_time.elapsed().as_secs_f64()
                    );
                    return Ok(entries);
                }
                Err(err) if !retried && err.is_transient() => {
                    self.clear_nearest_server_cache();
                    tracing::info!("  Received {}. Retrying with clean connection...", err);
                    self.disconnect().await;
                    tokio::time::sleep(self.config.retry_delay()).await;
                    retried = true;
                }
                Err(err) => {
                    self.clear_nearest_server_cache();
                    tracing::info!("  FAILED");
                    tracing::debug!(
                        "ldapsearch -LLL -E pr={}/noprompt -o ldif-wrap=no -b '{}' -s {} '{}' {}",
                        self.config.page_size,
                        base,
                        scope.as_ldapsearch_arg(),
                        filter,
                        itertools::join(columns.iter(), " ")
                    );
                    return Err(match err {
                        SearchAttemptError::Connect(e) => e,
                        SearchAttemptError::Backend(source) => {
                            search_error(base, filter, scope, source)
                        }
                    });
                }
            }
        }
    }

    /// whether the object exists, search errors count as missing
    pub async fn object_exists(&mut self, dn: &str) -> bool {
        match self
            .search(dn, "(objectclass=*)", &["dn".to_string()], SearchScope::Base)
            .await
        {
            Ok(entries) => !entries.is_empty(),
            Err(err) => {
                tracing::debug!("Object {} does not exist: {}", dn, err);
                false
            }
        }
    }

    /// whether the configured user base DN exists
    pub async fn user_base_dn_exists(&mut self) -> bool {
        let dn = self.config.user_dn.clone();
        self.object_exists(&dn).await
    }

    /// whether the configured group base DN exists
    pub async fn group_base_dn_exists(&mut self) -> bool {
        let dn = self.config.group_dn.clone();
        self.object_exists(&dn).await
    }
}

/// classify a failed search
fn search_error(base: &str, filter: &str, scope: SearchScope, source: BackendError) -> DirectoryError {
    match source {
        BackendError::NoSuchObject(_) => DirectoryError::NoSuchBase {
            base: base.to_string(),
            source,
        },
        BackendError::FilterError(_) => DirectoryError::InvalidFilter {
            filter: filter.to_string(),
            source,
        },
        BackendError::SizeLimitExceeded(_) => DirectoryError::SizeLimit,
        source => DirectoryError::Search {
            base: base.to_string(),
            scope: scope.as_ldapsearch_arg(),
            filter: filter.to_string(),
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfigBuilder, Dialect};
    use crate::secrets::{SecretRef, StaticSecrets};
    use crate::testing::{test_config, FakeDirectory};

    fn client(config: ConnectionConfig, directory: &FakeDirectory) -> DirectoryClient<FakeDirectory> {
        let secrets = StaticSecrets::default().with_secret("corp", "bindpw");
        DirectoryClient::new(
            Arc::new(config),
            directory.clone(),
            Arc::new(secrets),
            std::env::temp_dir().join("ldap-user-sync-client-tests"),
        )
    }

    fn with_bind(mut config: ConnectionConfig) -> ConnectionConfig {
        config.bind = BindCredentials::Credentials {
            dn: "cn=sync,dc=corp".to_string(),
            secret: SecretRef::Store("corp".to_string()),
        };
        config
    }

    fn failover_config() -> ConnectionConfig {
        let mut config = with_bind(test_config("corp"));
        config.servers = ServerSpec::Fixed {
            server: "ldap1".to_string(),
            failover_servers: vec!["ldap2".to_string(), "ldap3".to_string()],
        };
        config
    }

    #[test]
    fn test_format_ldap_uri() {
        let directory = FakeDirectory::new();
        let mut config = test_config("corp");
        assert_eq!(client(config.clone(), &directory).format_ldap_uri("dc1.corp."), "ldap://dc1.corp");
        config.use_ssl = true;
        config.port = Some(636);
        assert_eq!(client(config, &directory).format_ldap_uri("dc1"), "ldaps://dc1:636");
    }

    #[tokio::test]
    async fn test_connect_fails_over_and_stops_at_first_success() {
        let directory = FakeDirectory::new();
        directory.set_password("cn=sync,dc=corp", "bindpw");
        directory.set_unreachable("ldap1");
        let mut client = client(failover_config(), &directory);
        client.connect(false).await.unwrap();
        assert_eq!(directory.opened(), vec!["ldap://ldap1", "ldap://ldap2"]);
        // the existing connection is reused
        client.connect(false).await.unwrap();
        assert_eq!(directory.opened().len(), 2);
        // a forced reconnect starts over at the first server
        client.connect(true).await.unwrap();
        assert_eq!(
            directory.opened(),
            vec!["ldap://ldap1", "ldap://ldap2", "ldap://ldap1", "ldap://ldap2"]
        );
    }

    #[tokio::test]
    async fn test_connect_collects_errors_of_all_servers() {
        let directory = FakeDirectory::new();
        for server in ["ldap1", "ldap2", "ldap3"] {
            directory.set_unreachable(server);
        }
        let mut client = client(failover_config(), &directory);
        match client.connect(false).await {
            Err(DirectoryError::Connection(msg)) => {
                assert_eq!(msg.lines().count(), 3);
                assert!(msg.starts_with("ldap://ldap1: "));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_service_credentials_do_not_fail_over() {
        let directory = FakeDirectory::new();
        directory.set_password("cn=sync,dc=corp", "other");
        let mut client = client(failover_config(), &directory);
        assert!(matches!(
            client.connect(false).await,
            Err(DirectoryError::Credentials { .. })
        ));
        assert_eq!(directory.opened(), vec!["ldap://ldap1"]);
    }

    #[tokio::test]
    async fn test_missing_user_base_dn_is_a_config_error() {
        let directory = FakeDirectory::new();
        let mut config = test_config("corp");
        config.user_dn = String::new();
        let mut client = client(config, &directory);
        assert!(matches!(
            client.connect(false).await,
            Err(DirectoryError::Config(ConfigError::MissingUserBaseDn(_)))
        ));
        assert!(directory.opened().is_empty());
    }

    #[tokio::test]
    async fn test_search_lowercases_dns_and_counts_queries() {
        let directory = FakeDirectory::new();
        directory.add_entry(
            "uid=Carol,ou=People,dc=corp",
            &[("objectclass", &["person"]), ("uid", &["carol"])],
        );
        let mut client = client(test_config("corp"), &directory);
        let entries = client
            .search("ou=people,dc=corp", "(uid=carol)", &["uid".to_string()], SearchScope::Subtree)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dn, "uid=carol,ou=people,dc=corp");
        assert_eq!(client.num_queries(), 1);
        client.reset_query_count();
        assert_eq!(client.num_queries(), 0);
    }

    #[tokio::test]
    async fn test_transient_search_failure_is_retried_once() {
        let directory = FakeDirectory::new();
        directory.add_entry("uid=carol,ou=people,dc=corp", &[("uid", &["carol"])]);
        let mut config = test_config("corp");
        config.retry_delay_ms = 0;
        let mut client = client(config, &directory);
        directory.fail_next_searches(1);
        let entries = client
            .search("ou=people,dc=corp", "(uid=*)", &[], SearchScope::Subtree)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        // one connect for the first attempt, one fresh connect for the retry
        assert_eq!(directory.opened().len(), 2);

        directory.fail_next_searches(2);
        assert!(matches!(
            client
                .search("ou=people,dc=corp", "(uid=*)", &[], SearchScope::Subtree)
                .await,
            Err(DirectoryError::Search { .. })
        ));
        assert_eq!(directory.searches().len(), 4);
    }

    #[tokio::test]
    async fn test_permanent_search_failures_are_not_retried() {
        let directory = FakeDirectory::new();
        directory.add_entry("uid=carol,ou=people,dc=corp", &[("uid", &["carol"])]);
        let mut client = client(test_config("corp"), &directory);
        assert!(matches!(
            client
                .search("ou=missing,dc=corp", "(uid=*)", &[], SearchScope::Subtree)
                .await,
            Err(DirectoryError::NoSuchBase { .. })
        ));
        assert!(matches!(
            client
                .search("ou=people,dc=corp", "(uid=carol", &[], SearchScope::Subtree)
                .await,
            Err(DirectoryError::InvalidFilter { .. })
        ));
        assert_eq!(directory.searches().len(), 2);
        assert!(client.object_exists("uid=carol,ou=people,dc=corp").await);
        assert!(!client.object_exists("uid=dave,ou=people,dc=corp").await);
    }

    #[tokio::test]
    async fn test_bind_distinguishes_credential_errors() {
        let directory = FakeDirectory::new();
        directory.set_password("uid=carol,ou=people,dc=corp", "secret");
        let mut client = client(test_config("corp"), &directory);
        client.connect(false).await.unwrap();
        assert!(client.bind("uid=carol,ou=people,dc=corp", "secret").await.is_ok());
        assert!(matches!(
            client.bind("uid=carol,ou=people,dc=corp", "wrong").await,
            Err(BindError::Credentials { .. })
        ));
    }

    #[tokio::test]
    async fn test_discovered_server_is_cached_and_invalidated() {
        let cache_dir = tempfile::tempdir().unwrap();
        let directory = FakeDirectory::new();
        directory.set_located_server("dc7.corp.example.");
        let config = ConnectionConfigBuilder::default()
            .id("ad")
            .dialect(Dialect::ActiveDirectory)
            .servers(ServerSpec::Discover {
                domain: "corp.example".to_string(),
            })
            .user_dn("ou=people,dc=corp")
            .build()
            .unwrap();
        let mut client = DirectoryClient::new(
            Arc::new(config),
            directory.clone(),
            Arc::new(StaticSecrets::default()),
            cache_dir.path().to_path_buf(),
        );
        client.connect(false).await.unwrap();
        assert_eq!(directory.opened(), vec!["ldap://dc7.corp.example"]);
        assert!(cache_dir.path().join("nearest_server.ad").exists());

        client.connect(true).await.unwrap();
        assert_eq!(directory.locate_calls(), 1);

        directory.set_unreachable("dc7.corp.example");
        assert!(client.connect(true).await.is_err());
        assert!(!cache_dir.path().join("nearest_server.ad").exists());

        clear_all_caches(cache_dir.path()).unwrap();
        assert!(!cache_dir.path().exists());
        clear_all_caches(cache_dir.path()).unwrap();
    }

    #[tokio::test]
    async fn test_failed_discovery_falls_back_to_domain() {
        let cache_dir = tempfile::tempdir().unwrap();
        let directory = FakeDirectory::new();
        let mut config = test_config("ad");
        config.servers = ServerSpec::Discover {
            domain: "corp.example".to_string(),
        };
        let mut client = DirectoryClient::new(
            Arc::new(config),
            directory.clone(),
            Arc::new(StaticSecrets::default()),
            cache_dir.path().to_path_buf(),
        );
        client.connect(false).await.unwrap();
        assert_eq!(directory.opened(), vec!["ldap://corp.example"]);
        assert!(!cache_dir.path().join("nearest_server.ad").exists());
    }
}
