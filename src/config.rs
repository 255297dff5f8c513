//! configuration of LDAP connections and of the user synchronization as a whole

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use lazy_static::lazy_static;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::plugins::CustomAttributeSpec;
use crate::secrets::SecretRef;

/// errors in the configuration of a connection or of the sync as a whole
#[derive(Debug, Error)]
pub enum ConfigError {
    /// could not parse the value as a scope
    #[error("Could not parse {0} as an ldap scope")]
    InvalidScope(String),
    /// the connection has no user base DN configured
    #[error("The distinguished name of the container object which holds the user objects is not configured for connection {0}")]
    MissingUserBaseDn(String),
    /// two connections use the same username suffix
    #[error("Found duplicate LDAP connection suffix. The LDAP connections {first} and {second} both use the suffix {suffix} which is not allowed")]
    DuplicateSuffix {
        /// the suffix used by both connections
        suffix: String,
        /// the connection which registered the suffix first
        first: String,
        /// the connection which tried to register it again
        second: String,
    },
    /// a username carries more than one configured suffix
    #[error("Unable to match connection for user {0}")]
    AmbiguousSuffix(String),
    /// the parameters of an attribute sync plugin could not be used
    #[error("The configuration of the LDAP attribute plugin {plugin} is invalid: {reason}")]
    InvalidPluginParameters {
        /// the identifier of the plugin
        plugin: String,
        /// why the parameters were rejected
        reason: String,
    },
    /// an I/O error
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// an error deserializing the TOML file
    #[error("Toml deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// the scope of an LDAP search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum SearchScope {
    /// only the base object itself
    Base,
    /// the direct children of the base object
    OneLevel,
    /// the base object and everything below it
    #[default]
    Subtree,
}

impl SearchScope {
    /// the value one would pass to OpenLDAP's ldapsearch -s parameter
    pub fn as_ldapsearch_arg(&self) -> &'static str {
        match self {
            SearchScope::Base => "base",
            SearchScope::OneLevel => "one",
            SearchScope::Subtree => "sub",
        }
    }
}

impl From<SearchScope> for ldap3::Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => ldap3::Scope::Base,
            SearchScope::OneLevel => ldap3::Scope::OneLevel,
            SearchScope::Subtree => ldap3::Scope::Subtree,
        }
    }
}

impl TryFrom<String> for SearchScope {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_scope(&value)
    }
}

/// parse a [SearchScope] from the string one would specify to use the same
/// scope with OpenLDAP's ldapsearch -s parameter
///
/// `subtree` is accepted as an alias of `sub`
pub fn parse_scope(src: &str) -> Result<SearchScope, ConfigError> {
    match src {
        "base" => Ok(SearchScope::Base),
        "one" => Ok(SearchScope::OneLevel),
        "sub" | "subtree" => Ok(SearchScope::Subtree),
        s => Err(ConfigError::InvalidScope(s.to_string())),
    }
}

/// the type of directory server a connection talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Dialect {
    /// Microsoft Active Directory
    #[serde(rename = "active_directory")]
    ActiveDirectory,
    /// OpenLDAP
    #[serde(rename = "openldap")]
    OpenLdap,
    /// 389 Directory Server
    #[serde(rename = "389_directory_server")]
    DirectoryServer389,
}

lazy_static! {
    /// default attribute names per dialect, all lower case since LDAP attribute
    /// names are case insensitive
    static ref DEFAULT_ATTRIBUTES: HashMap<(Dialect, &'static str), &'static str> = {
        let mut m = HashMap::new();
        m.insert((Dialect::ActiveDirectory, "user_id"), "samaccountname");
        m.insert((Dialect::ActiveDirectory, "pw_changed"), "pwdlastset");
        m.insert((Dialect::OpenLdap, "user_id"), "uid");
        m.insert((Dialect::OpenLdap, "pw_changed"), "pwdchangedtime");
        m.insert((Dialect::OpenLdap, "member"), "uniquemember");
        m.insert((Dialect::DirectoryServer389, "user_id"), "uid");
        m.insert((Dialect::DirectoryServer389, "pw_changed"), "krbpasswordexpiration");
        m.insert((Dialect::DirectoryServer389, "member"), "member");
        m
    };

    /// default search filters per dialect
    static ref DEFAULT_FILTERS: HashMap<(Dialect, &'static str), &'static str> = {
        let mut m = HashMap::new();
        m.insert((Dialect::ActiveDirectory, "users"), "(&(objectclass=user)(objectcategory=person))");
        m.insert((Dialect::ActiveDirectory, "groups"), "(objectclass=group)");
        m.insert((Dialect::OpenLdap, "users"), "(objectclass=person)");
        m.insert((Dialect::OpenLdap, "groups"), "(objectclass=groupOfUniqueNames)");
        m.insert((Dialect::DirectoryServer389, "users"), "(objectclass=person)");
        m.insert((Dialect::DirectoryServer389, "groups"), "(objectclass=groupOfUniqueNames)");
        m
    };
}

impl Dialect {
    /// the default attribute name for the given key, the key itself if this
    /// dialect has no special name for it
    pub fn ldap_attr(&self, key: &str) -> String {
        DEFAULT_ATTRIBUTES
            .get(&(*self, key))
            .copied()
            .unwrap_or(key)
            .to_lowercase()
    }

    /// the default filter for `users` or `groups`
    pub fn ldap_filter(&self, key: &str) -> &'static str {
        DEFAULT_FILTERS
            .get(&(*self, key))
            .copied()
            .unwrap_or("(objectclass=*)")
    }

    /// whether this is Active Directory
    pub fn is_active_directory(&self) -> bool {
        *self == Dialect::ActiveDirectory
    }
}

/// which servers to connect to
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "connect_to", rename_all = "snake_case")]
pub enum ServerSpec {
    /// a fixed server with optional failover servers tried in order
    Fixed {
        /// the primary server
        server: String,
        /// servers tried when the primary one can not be reached
        #[serde(default)]
        failover_servers: Vec<String>,
    },
    /// locate the nearest domain controller of an Active Directory domain
    Discover {
        /// the DNS name of the domain
        domain: String,
    },
}

/// the credentials used for the default bind of a connection
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BindCredentials {
    /// bind anonymously
    #[default]
    Anonymous,
    /// bind as a service account
    Credentials {
        /// the DN of the service account
        dn: String,
        /// where to find the password of the service account
        secret: SecretRef,
    },
}

/// TLS settings of a connection
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TlsSettings {
    /// CA certificate used to verify the server
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// client certificate path
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// client key path
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// upgrade a plain connection with STARTTLS
    #[serde(default)]
    pub starttls: bool,
    /// skip verification of the server certificate
    #[serde(default)]
    pub no_tls_verify: bool,
}

/// how umlauts in user ids are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UmlautPolicy {
    /// keep them as they are
    #[default]
    Keep,
    /// replace them with their ASCII transcription (ü -> ue,...)
    Replace,
}

/// default connect timeout in seconds
fn default_connect_timeout() -> f64 {
    2.0
}

/// default response timeout in seconds
fn default_response_timeout() -> u64 {
    5
}

/// default page size for paged searches
fn default_page_size() -> i32 {
    1000
}

/// default delay before a failed search is retried in milliseconds
fn default_retry_delay_ms() -> u64 {
    500
}

/// default protocol version
fn default_version() -> u8 {
    3
}

/// default number of seconds between two syncs of a connection
fn default_cache_livetime() -> u64 {
    300
}

/// the configuration of a single LDAP connection
///
/// immutable for the lifetime of a connector, a new connector is built
/// whenever the configuration changes
#[derive(Debug, Clone, PartialEq, Builder, Deserialize)]
#[builder(setter(into))]
pub struct ConnectionConfig {
    /// unique identifier of the connection
    pub id: String,
    /// human readable description
    #[serde(default)]
    #[builder(default)]
    pub description: String,
    /// disabled connections are neither synced nor asked for credentials
    #[serde(default)]
    #[builder(default)]
    pub disabled: bool,
    /// the type of directory server
    pub dialect: Dialect,
    /// the servers to connect to
    pub servers: ServerSpec,
    /// non-default port
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub port: Option<u16>,
    /// use ldaps://
    #[serde(default)]
    #[builder(default)]
    pub use_ssl: bool,
    /// TLS settings
    #[serde(default)]
    #[builder(default)]
    pub tls: TlsSettings,
    /// LDAP protocol version
    #[serde(default = "default_version")]
    #[builder(default = "default_version()")]
    pub version: u8,
    /// connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    #[builder(default = "default_connect_timeout()")]
    pub connect_timeout: f64,
    /// response timeout in seconds
    #[serde(default = "default_response_timeout")]
    #[builder(default = "default_response_timeout()")]
    pub response_timeout: u64,
    /// number of entries requested per page
    #[serde(default = "default_page_size")]
    #[builder(default = "default_page_size()")]
    pub page_size: i32,
    /// delay before a failed search is retried in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    #[builder(default = "default_retry_delay_ms()")]
    pub retry_delay_ms: u64,
    /// credentials for the default bind
    #[serde(default)]
    #[builder(default)]
    pub bind: BindCredentials,
    /// base DN of the user objects
    pub user_dn: String,
    /// scope of the user search
    #[serde(default)]
    #[builder(default)]
    pub user_scope: SearchScope,
    /// user search filter replacing the dialect default
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub user_filter: Option<String>,
    /// only members of this group are synchronized
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub user_filter_group: Option<String>,
    /// attribute holding the user id, replacing the dialect default
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub user_id: Option<String>,
    /// convert user ids to lower case
    #[serde(default)]
    #[builder(default)]
    pub lower_user_ids: bool,
    /// handling of umlauts in user ids
    #[serde(default)]
    #[builder(default)]
    pub user_id_umlauts: UmlautPolicy,
    /// base DN of the group objects
    #[serde(default)]
    #[builder(default)]
    pub group_dn: String,
    /// scope of the group search
    #[serde(default)]
    #[builder(default)]
    pub group_scope: SearchScope,
    /// group search filter replacing the dialect default
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub group_filter: Option<String>,
    /// attribute holding the group members, replacing the dialect default
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub group_member: Option<String>,
    /// attribute sync plugins with their parameters
    #[serde(default)]
    #[builder(default)]
    pub active_plugins: toml::Table,
    /// seconds between two syncs of this connection
    #[serde(default = "default_cache_livetime")]
    #[builder(default = "default_cache_livetime()")]
    pub cache_livetime: u64,
    /// suffix appended to user ids to disambiguate users of several connections
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub suffix: Option<String>,
    /// do not create users during the sync, only when they log in
    #[serde(default)]
    #[builder(default)]
    pub create_only_on_login: bool,
}

impl ConnectionConfig {
    /// check the settings a sync can not do without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_dn.is_empty() {
            return Err(ConfigError::MissingUserBaseDn(self.id.clone()));
        }
        Ok(())
    }

    /// the attribute name for the given key, taking the dialect into account
    pub fn ldap_attr(&self, key: &str) -> String {
        self.dialect.ldap_attr(key)
    }

    /// the attribute holding the user id
    pub fn user_id_attr(&self) -> String {
        self.user_id
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| self.ldap_attr("user_id"))
    }

    /// the attribute holding the members of a group
    pub fn member_attr(&self) -> String {
        self.group_member
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| self.ldap_attr("member"))
    }

    /// the filter used to search for users
    pub fn users_filter(&self) -> String {
        self.user_filter
            .clone()
            .unwrap_or_else(|| self.dialect.ldap_filter("users").to_string())
    }

    /// the filter used to search for groups
    pub fn groups_filter(&self) -> String {
        self.group_filter
            .clone()
            .unwrap_or_else(|| self.dialect.ldap_filter("groups").to_string())
    }

    /// whether a username suffix is configured
    pub fn has_suffix(&self) -> bool {
        self.suffix.is_some()
    }

    /// connect timeout as [Duration]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout.max(0.0))
    }

    /// response timeout as [Duration]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout)
    }

    /// retry delay as [Duration]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// which connections take part in the periodic sync
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    /// no periodic sync at all
    Disabled,
    /// all connections which are not disabled
    #[default]
    All,
    /// only the listed connections
    List {
        /// ids of the connections to sync
        connections: Vec<String>,
    },
}

impl SyncMode {
    /// whether the connection with the given id takes part in the periodic sync
    pub fn includes(&self, connection_id: &str) -> bool {
        match self {
            SyncMode::Disabled => false,
            SyncMode::All => true,
            SyncMode::List { connections } => connections.iter().any(|c| c == connection_id),
        }
    }
}

/// default roles of users which got no role from the directory
fn default_roles() -> Vec<String> {
    vec!["user".to_string()]
}

/// base directory for files of this crate below the given system directory
fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(".")).join("ldap-user-sync")
}

/// default directory for the last sync time files and the job lock
fn default_state_dir() -> PathBuf {
    app_dir(dirs2::data_local_dir())
}

/// default directory for caches which may be thrown away at any time
fn default_cache_dir() -> PathBuf {
    app_dir(dirs2::cache_dir())
}

/// the settings of the user synchronization as a whole
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// which connections are synced periodically
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// roles of users which got no role from the directory
    #[serde(default = "default_roles")]
    pub default_roles: Vec<String>,
    /// names of the contact groups known to the monitoring system
    #[serde(default)]
    pub contact_groups: Vec<String>,
    /// custom user attributes which may be filled from the directory
    #[serde(default)]
    pub custom_attributes: Vec<CustomAttributeSpec>,
    /// directory for the last sync time files and the job lock
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// directory for throw-away caches (e.g. the discovered nearest server)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// whether profiles are replicated to remote sites
    #[serde(default)]
    pub replication: bool,
    /// more verbose error reporting
    #[serde(default)]
    pub debug: bool,
    /// the configured connections
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// load the sync settings from a toml file
#[instrument]
pub fn load_settings(filename: std::path::PathBuf) -> Result<SyncSettings, ConfigError> {
    let config = std::fs::read_to_string(filename)?;
    let result: SyncSettings = toml::from_str(&config)?;
    for connection in &result.connections {
        tracing::debug!(
            "Loaded LDAP connection {} ({:?}, {} active plugins)",
            connection.id,
            connection.dialect,
            connection.active_plugins.len()
        );
    }
    Ok(result)
}
