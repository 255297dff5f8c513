//! the user connector of one LDAP connection: the sync pass and the credential check

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::instrument;

use crate::backend::LdapBackend;
use crate::client::{BindError, DirectoryClient, DirectoryError};
use crate::config::{ConfigError, ConnectionConfig, SyncSettings};
use crate::directory_user::{is_valid_user_id, sanitize_user_id, FetchedUser, FetchedUsers};
use crate::dn::{escape_dn_filter_value, escape_filter_value};
use crate::events::{
    call_sync_finished, HookError, SecurityEventLog, SyncFinished, SyncFinishedHook,
    UserManagementEvent, UserManagementEventKind,
};
use crate::groups::{GroupError, GroupMemberships, GroupResolver};
use crate::plugins::{CustomAttributeSpec, PluginContext, PluginRegistry};
use crate::profile::{new_user_template, Users};
use crate::reconcile::Reconciler;
use crate::secrets::SecretStore;
use crate::session::{GroupLookup, SyncSession};
use crate::store::{StoreError, SyncTimeFile, UserStore};
use crate::suffix::{self, SuffixRegistry};

/// errors aborting the sync pass of a connection
#[derive(Debug, Error)]
pub enum SyncError {
    /// a directory operation failed
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    /// group memberships could not be resolved
    #[error("Group resolution error: {0}")]
    Groups(#[from] GroupError),
    /// the user store could not be loaded or saved
    #[error("User store error: {0}")]
    Store(#[from] StoreError),
    /// the sync finished hook failed
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),
    /// a user was returned without the user id attribute
    #[error("The user id attribute {attribute} could not be fetched from the LDAP server for user {dn}")]
    MissingUserId {
        /// the user id attribute
        attribute: String,
        /// the DN of the user
        dn: String,
    },
}

/// the collaborators and global settings a sync pass or a credential check works with
#[derive(Debug, Clone, Copy)]
pub struct SyncEnvironment<'a> {
    /// the local user database
    pub store: &'a dyn UserStore,
    /// receiver of user management events
    pub security_log: &'a dyn SecurityEventLog,
    /// called after each sync pass
    pub hook: &'a dyn SyncFinishedHook,
    /// names of the contact groups of the web application
    pub contact_groups: &'a [String],
    /// roles of users which got no role from the directory
    pub default_roles: &'a [String],
    /// the custom user attributes
    pub custom_attributes: &'a [CustomAttributeSpec],
    /// the logged in user who triggered the operation
    pub acting_user: Option<&'a str>,
    /// whether profiles are replicated to remote sites
    pub replication: bool,
    /// more verbose error reporting
    pub debug: bool,
}

impl<'a> SyncEnvironment<'a> {
    /// the environment described by the global sync settings, without an acting user
    pub fn from_settings(
        settings: &'a SyncSettings,
        store: &'a dyn UserStore,
        security_log: &'a dyn SecurityEventLog,
        hook: &'a dyn SyncFinishedHook,
    ) -> Self {
        SyncEnvironment {
            store,
            security_log,
            hook,
            contact_groups: &settings.contact_groups,
            default_roles: &settings.default_roles,
            custom_attributes: &settings.custom_attributes,
            acting_user: None,
            replication: settings.replication,
            debug: settings.debug,
        }
    }

    /// the same environment for an operation triggered by the given user
    pub fn with_acting_user(self, acting_user: &'a str) -> Self {
        SyncEnvironment {
            acting_user: Some(acting_user),
            ..self
        }
    }
}

/// options of a single sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// whether the changes are recorded in the change log
    pub add_to_changelog: bool,
    /// only this local user is created or updated, the removal sweep still runs
    pub only_username: Option<String>,
}

/// the outcome of a credential check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckCredentialsResult {
    /// the credentials are valid, the local user id
    Authenticated(String),
    /// the login is refused
    Denied,
    /// not a user of this connection, try the next one
    NotMine,
}

/// the user connector of one LDAP connection
#[derive(Debug)]
pub struct LdapUserConnector<B> {
    /// the configuration of the connection
    config: Arc<ConnectionConfig>,
    /// the directory client
    client: DirectoryClient<B>,
    /// the active attribute sync plugins
    plugins: PluginRegistry,
    /// the suffixes of all connections
    suffixes: Arc<SuffixRegistry>,
    /// the time of the last sync
    sync_time: SyncTimeFile,
    /// the caches of the current pass
    session: SyncSession,
}

impl<B: LdapBackend> LdapUserConnector<B> {
    /// a connector for the connection, activating its plugins
    pub fn new(
        config: Arc<ConnectionConfig>,
        backend: B,
        secrets: Arc<dyn SecretStore>,
        suffixes: Arc<SuffixRegistry>,
        custom_attributes: &[CustomAttributeSpec],
        state_dir: &Path,
        cache_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        let plugins = PluginRegistry::activate(&config, custom_attributes)?;
        let sync_time = SyncTimeFile::new(state_dir, &config.id);
        let client = DirectoryClient::new(config.clone(), backend, secrets, cache_dir);
        Ok(LdapUserConnector {
            config,
            client,
            plugins,
            suffixes,
            sync_time,
            session: SyncSession::new(),
        })
    }

    /// the id of the connection
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// the configuration of the connection
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// the directory client
    pub fn client(&mut self) -> &mut DirectoryClient<B> {
        &mut self.client
    }

    /// the username without the suffix of this connection
    pub fn strip_suffix<'u>(&self, username: &'u str) -> &'u str {
        suffix::strip_suffix(username, self.config.suffix.as_deref())
    }

    /// the username with the suffix of this connection, unchanged without suffix
    pub fn add_suffix(&self, username: &str) -> String {
        match &self.config.suffix {
            Some(suffix) => suffix::add_suffix(username, suffix),
            None => username.to_string(),
        }
    }

    /// profile fields the user can not edit while this connection manages them
    pub fn locked_attributes(&self) -> Vec<String> {
        let mut locked = vec!["password".to_string()];
        locked.extend(self.plugins.lock_attributes());
        locked
    }

    /// profile fields only used by the web application
    pub fn multisite_attributes(&self) -> Vec<String> {
        self.plugins.multisite_attributes()
    }

    /// profile fields not forwarded to contact definitions
    pub fn non_contact_attributes(&self) -> Vec<String> {
        self.plugins.non_contact_attributes()
    }

    /// whether the cache livetime passed since the last sync
    pub fn sync_is_needed(&self) -> bool {
        self.sync_time.is_due(
            Duration::from_secs(self.config.cache_livetime),
            Utc::now(),
        )
    }

    /// start a new pass with empty caches
    fn flush_caches(&mut self) {
        self.session = SyncSession::new();
        self.client.reset_query_count();
    }

    /// all users of the connection, restricted to the filter group if one is configured
    #[instrument(skip(self), fields(connection = %self.config.id))]
    pub async fn get_users(&mut self) -> Result<FetchedUsers, SyncError> {
        let config = self.config.clone();
        let user_id_attr = config.user_id_attr();
        let mut columns: BTreeSet<String> = self.plugins.needed_attributes(&config);
        columns.insert(user_id_attr.clone());
        let columns: Vec<String> = columns.into_iter().collect();

        let mut filter = config.users_filter();
        if let Some(group_dn) = &config.user_filter_group {
            let members = GroupResolver::new(&mut self.client, &mut self.session)
                .filter_group_members(group_dn)
                .await?;
            if members.is_empty() {
                tracing::info!("The filter group {} has no members", group_dn);
                return Ok(FetchedUsers::new());
            }
            let by_uid = config.member_attr() == "memberuid";
            let alternatives = itertools::join(
                members.iter().map(|m| {
                    if by_uid {
                        format!("({}={})", user_id_attr, escape_filter_value(m))
                    } else {
                        format!("(distinguishedname={})", escape_dn_filter_value(m))
                    }
                }),
                "",
            );
            filter = format!("(&{}(|{}))", filter, alternatives);
        }

        let mut users = FetchedUsers::new();
        for entry in self
            .client
            .search(&config.user_dn, &filter, &columns, config.user_scope)
            .await?
        {
            let raw_user_id = entry
                .attrs
                .get(&user_id_attr)
                .and_then(|values| values.first())
                .ok_or_else(|| SyncError::MissingUserId {
                    attribute: user_id_attr.clone(),
                    dn: entry.dn.clone(),
                })?;
            let user_id = sanitize_user_id(&config, raw_user_id);
            if !is_valid_user_id(&user_id) {
                tracing::warn!(
                    "Skipping user {}: invalid user id {:?} in attribute {}",
                    entry.dn,
                    user_id,
                    user_id_attr
                );
                continue;
            }
            users.insert(
                user_id.clone(),
                FetchedUser {
                    dn: entry.dn,
                    attrs: entry.attrs,
                    user_id,
                },
            );
        }
        Ok(users)
    }

    /// the DN and the normalized user id of the only directory user with the
    /// given username, None when there is no unique match or the user is not
    /// a member of the filter group
    #[instrument(skip(self), fields(connection = %self.config.id))]
    pub async fn get_user(
        &mut self,
        username: &str,
    ) -> Result<Option<(String, String)>, SyncError> {
        if let Some(cached) = self.session.users.get(username) {
            return Ok(cached.clone());
        }
        let config = self.config.clone();
        let user_id_attr = config.user_id_attr();
        let filter = format!(
            "(&({}={}){})",
            user_id_attr,
            escape_filter_value(username),
            config.user_filter.as_deref().unwrap_or("")
        );
        let entries = self
            .client
            .search(
                &config.user_dn,
                &filter,
                std::slice::from_ref(&user_id_attr),
                config.user_scope,
            )
            .await?;
        let mut result = match entries.as_slice() {
            [entry] => entry
                .attrs
                .get(&user_id_attr)
                .and_then(|values| values.first())
                .map(|raw| (entry.dn.clone(), raw.clone())),
            [] => None,
            _ => {
                tracing::warn!(
                    "Found {} users matching {}, ignoring them",
                    entries.len(),
                    username
                );
                None
            }
        };
        let member = result.as_ref().map(|(dn, raw_user_id)| {
            if config.member_attr() == "memberuid" {
                raw_user_id.to_lowercase()
            } else {
                dn.clone()
            }
        });
        if let (Some(member), Some(group_dn)) = (member, &config.user_filter_group) {
            let members = GroupResolver::new(&mut self.client, &mut self.session)
                .filter_group_members(group_dn)
                .await?;
            if !members.contains(&member) {
                tracing::debug!("User {} is not a member of the filter group", username);
                result = None;
            }
        }
        let result = result.map(|(dn, raw_user_id)| (dn, sanitize_user_id(&config, &raw_user_id)));
        self.session
            .users
            .insert(username.to_string(), result.clone());
        Ok(result)
    }

    /// the groups of the connection by DN with their cn, or only the given group
    #[instrument(skip(self), fields(connection = %self.config.id))]
    pub async fn get_groups(
        &mut self,
        specific_dn: Option<&str>,
    ) -> Result<BTreeMap<String, Option<String>>, DirectoryError> {
        let config = self.config.clone();
        let (base, filter) = match specific_dn {
            Some(dn) if config.dialect.is_active_directory() => (
                config.group_dn.clone(),
                format!(
                    "(&{}(distinguishedName={}))",
                    config.groups_filter(),
                    escape_dn_filter_value(dn)
                ),
            ),
            Some(dn) => (dn.to_string(), config.groups_filter()),
            None => (config.group_dn.clone(), config.groups_filter()),
        };
        Ok(self
            .client
            .search(&base, &filter, &["cn".to_string()], config.group_scope)
            .await?
            .into_iter()
            .map(|entry| {
                let cn = entry.attrs.get("cn").and_then(|v| v.first()).cloned();
                (entry.dn, cn)
            })
            .collect())
    }

    /// resolve the group lookups the active plugins need
    async fn resolve_group_lookups(
        &mut self,
        contact_groups: &[String],
    ) -> Result<HashMap<GroupLookup, GroupMemberships>, GroupError> {
        let mut groups = HashMap::new();
        for lookup in self.plugins.group_lookups(contact_groups) {
            let memberships = GroupResolver::new(&mut self.client, &mut self.session)
                .memberships(&lookup)
                .await?;
            groups.insert(lookup, memberships);
        }
        Ok(groups)
    }

    /// log which of the configured base DNs do not exist, only while the
    /// connection is up so unreachable servers are not reported as missing DNs
    async fn diagnose_base_dns(&mut self) {
        if !self.client.is_connected() {
            return;
        }
        if !self.client.user_base_dn_exists().await {
            tracing::error!(
                "Connection {}: The user base DN \"{}\" does not exist",
                self.config.id,
                self.config.user_dn
            );
        }
        if !self.config.group_dn.is_empty() && !self.client.group_base_dn_exists().await {
            tracing::error!(
                "Connection {}: The group base DN \"{}\" does not exist",
                self.config.id,
                self.config.group_dn
            );
        }
    }

    /// synchronize the users of the directory into the local user store
    #[instrument(skip(self, env), fields(connection = %self.config.id))]
    pub async fn do_sync(
        &mut self,
        env: &SyncEnvironment<'_>,
        options: SyncOptions,
    ) -> Result<(), SyncError> {
        if self.config.user_dn.is_empty() {
            tracing::info!("Not trying sync (no \"user base DN\" configured)");
            return Ok(());
        }
        tracing::info!("SYNC STARTED");
        if self.config.disabled {
            tracing::info!("  SKIP SYNC connector \"{}\" is disabled", self.config.id);
            return Ok(());
        }
        tracing::info!("  SYNC PLUGINS: {}", self.plugins.idents().join(", "));
        let start_time = Instant::now();

        self.flush_caches();
        let fetched = match self.get_users().await {
            Ok(fetched) => fetched,
            Err(err) => {
                self.diagnose_base_dns().await;
                return Err(err);
            }
        };
        let groups = match self.resolve_group_lookups(env.contact_groups).await {
            Ok(groups) => groups,
            Err(err) => {
                self.diagnose_base_dns().await;
                return Err(err.into());
            }
        };

        let mut users = env.store.load(true)?;
        let reconciler = Reconciler {
            connection_id: &self.config.id,
            suffix: self.config.suffix.as_deref(),
            create_only_on_login: self.config.create_only_on_login,
            only_username: options.only_username.as_deref(),
            replication: env.replication,
            acting_user: env.acting_user,
            plugins: &self.plugins,
            ctx: PluginContext {
                config: &self.config,
                contact_groups: env.contact_groups,
                default_roles: env.default_roles,
                custom_attributes: env.custom_attributes,
                groups: &groups,
            },
            security_log: env.security_log,
        };
        let result = reconciler.reconcile(&mut users, &fetched);

        let hook_result = call_sync_finished(
            env.hook,
            &SyncFinished {
                connection_id: &self.config.id,
                profiles_to_synchronize: &result.profiles_to_synchronize,
                changes: &result.changes,
                add_to_changelog: options.add_to_changelog,
                debug: env.debug,
            },
        );
        tracing::info!(
            "SYNC FINISHED - Duration: {:.3} sec, Queries: {}",
            start_time.elapsed().as_secs_f64(),
            self.client.num_queries()
        );

        let save_result = if result.needs_save() {
            env.store.save(&users, Utc::now())
        } else {
            env.store.release_lock();
            Ok(())
        };
        self.sync_time.touch(Utc::now())?;
        save_result?;
        hook_result?;
        Ok(())
    }

    /// create the local user for a directory user logging in for the first
    /// time, then sync that user
    ///
    /// the store has to be loaded with the lock held, saving releases it
    pub async fn create_ldap_user_on_login(
        &mut self,
        env: &SyncEnvironment<'_>,
        users: &mut Users,
        user_id: &str,
    ) -> Result<(), SyncError> {
        users.insert(
            user_id.to_string(),
            new_user_template(user_id, &self.config.id, env.default_roles),
        );
        env.store.save(users, Utc::now())?;
        env.security_log.log(UserManagementEvent::new(
            UserManagementEventKind::UserCreated,
            user_id,
            env.acting_user,
            &self.config.id,
        ));
        let options = SyncOptions {
            add_to_changelog: false,
            only_username: Some(user_id.to_string()),
        };
        if let Err(err) = self.do_sync(env, options).await {
            tracing::warn!("Failed to sync the newly created user {}: {}", user_id, err);
        }
        Ok(())
    }

    /// the local user of the directory user, created if it does not exist yet
    ///
    /// the plain user id is tried first, the suffixed one second, None when
    /// both belong to other connections
    #[instrument(skip(self, env), fields(connection = %self.config.id))]
    pub async fn get_matching_user_profile(
        &mut self,
        env: &SyncEnvironment<'_>,
        user_id: &str,
    ) -> Result<Option<String>, SyncError> {
        let mut users = env.store.load(true)?;
        let mut candidates = vec![user_id.to_string()];
        if self.config.has_suffix() {
            candidates.push(self.add_suffix(user_id));
        }
        for candidate in candidates {
            match users.get(&candidate) {
                None => {
                    self.create_ldap_user_on_login(env, &mut users, &candidate)
                        .await?;
                    return Ok(Some(candidate));
                }
                Some(profile) if profile.connector == self.config.id => {
                    env.store.release_lock();
                    return Ok(Some(candidate));
                }
                Some(_) => {}
            }
        }
        env.store.release_lock();
        Ok(None)
    }

    /// check the credentials of a user logging in
    ///
    /// never fails, infrastructure problems are logged and refuse the login
    #[instrument(skip(self, env, secret), fields(connection = %self.config.id))]
    pub async fn check_credentials(
        &mut self,
        env: &SyncEnvironment<'_>,
        username: &str,
        secret: &str,
    ) -> CheckCredentialsResult {
        // only talk to the servers of the connection the user belongs to
        let owner = env.store.connector_of(username).unwrap_or_else(|err| {
            tracing::warn!("Failed to look up the connection of user {}: {}", username, err);
            None
        });
        let mut enforced = false;
        match owner.as_deref() {
            Some(owner) if owner != self.config.id => return CheckCredentialsResult::NotMine,
            Some(_) => {}
            None => match self.suffixes.enforced_connection(username) {
                Ok(Some(id)) if id != self.config.id => return CheckCredentialsResult::NotMine,
                Ok(Some(_)) => enforced = true,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("Refusing login of {}: {}", username, err);
                    return CheckCredentialsResult::Denied;
                }
            },
        }
        if secret.is_empty() {
            return CheckCredentialsResult::Denied;
        }

        self.session = SyncSession::new();
        if let Err(err) = self.client.connect(false).await {
            tracing::error!("Failed to connect to LDAP: {}", err);
            return CheckCredentialsResult::NotMine;
        }

        let ldap_user_id = self.strip_suffix(username).to_string();
        let (user_dn, user_id) = match self.get_user(&ldap_user_id).await {
            Ok(Some(found)) => found,
            Ok(None) if enforced => return CheckCredentialsResult::Denied,
            Ok(None) => return CheckCredentialsResult::NotMine,
            Err(err) => {
                tracing::error!("Failed to look up user {}: {}", username, err);
                return if enforced {
                    CheckCredentialsResult::Denied
                } else {
                    CheckCredentialsResult::NotMine
                };
            }
        };

        let bind_result = self.client.bind(&user_dn, secret).await;
        if let Err(err) = self.client.default_bind().await {
            tracing::warn!("Failed to restore the default bind: {}", err);
        }
        match bind_result {
            Ok(()) => {}
            Err(err @ BindError::Credentials { .. }) => {
                tracing::warn!("Unable to authenticate user {}. Reason: {}", username, err);
                return CheckCredentialsResult::Denied;
            }
            Err(err) => {
                tracing::error!("  Exception during authentication (User: {}): {}", username, err);
                return CheckCredentialsResult::Denied;
            }
        }

        match self.get_matching_user_profile(env, &user_id).await {
            Ok(Some(local_id)) => CheckCredentialsResult::Authenticated(local_id),
            Ok(None) => {
                tracing::warn!(
                    "No local user could be matched or created for {}",
                    username
                );
                CheckCredentialsResult::Denied
            }
            Err(err) => {
                tracing::error!("  Exception during authentication (User: {}): {}", username, err);
                CheckCredentialsResult::Denied
            }
        }
    }
}
