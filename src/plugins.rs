//! attribute sync plugins which compute profile updates from directory users

use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;
use thiserror::Error;

use crate::config::{ConfigError, ConnectionConfig};
use crate::directory_user::FetchedUser;
use crate::groups::{member_cmp_value, GroupMemberships};
use crate::profile::{ProfileUpdate, UserProfile};
use crate::session::GroupLookup;

pub mod auth_expire;
pub mod copy;
pub mod custom;
pub mod groups;

pub use auth_expire::AuthExpirePlugin;
pub use copy::CopyAttributePlugin;
pub use custom::CustomAttributePlugin;
pub use groups::{GroupsToAttributesPlugin, GroupsToContactgroupsPlugin, GroupsToRolesPlugin};

/// a custom user attribute known to the web application
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomAttributeSpec {
    /// the name of the attribute in the user profile
    pub name: String,
    /// human readable title
    #[serde(default)]
    pub title: String,
    /// the value of the attribute when nothing else is set
    #[serde(default = "default_custom_value")]
    pub default: toml::Value,
}

/// default value of custom attributes without an explicit default
fn default_custom_value() -> toml::Value {
    toml::Value::String(String::new())
}

/// errors of a single plugin for a single user, the user is skipped
#[derive(Debug, Error)]
pub enum PluginError {
    /// a required attribute was not returned by the directory
    #[error("The attribute {attribute} could not be fetched from the LDAP server for user {dn}")]
    MissingAttribute {
        /// the attribute
        attribute: String,
        /// the DN of the user
        dn: String,
    },
    /// an attribute has a value the plugin can not interpret
    #[error("The attribute {attribute} of user {dn} has the invalid value {value}")]
    InvalidValue {
        /// the attribute
        attribute: String,
        /// the DN of the user
        dn: String,
        /// the value
        value: String,
    },
}

/// everything a plugin may look at besides the user itself
///
/// group memberships are resolved before the plugins run so plugins
/// never touch the directory
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    /// the connection being synced
    pub config: &'a ConnectionConfig,
    /// names of the contact groups of the web application
    pub contact_groups: &'a [String],
    /// roles of users which got no role from the directory
    pub default_roles: &'a [String],
    /// the custom user attributes
    pub custom_attributes: &'a [CustomAttributeSpec],
    /// the results of the group lookups requested by the active plugins
    pub groups: &'a HashMap<GroupLookup, GroupMemberships>,
}

impl PluginContext<'_> {
    /// the memberships found for a lookup, empty when the lookup was not resolved
    pub fn memberships(&self, lookup: &GroupLookup) -> Option<&GroupMemberships> {
        self.groups.get(lookup)
    }

    /// the cns of the groups of the lookup the user is a member of
    pub fn group_cns_of_user(
        &self,
        lookup: &GroupLookup,
        user_id: &str,
        fetched: &FetchedUser,
    ) -> Vec<String> {
        let member = member_cmp_value(self.config, user_id, &fetched.dn);
        self.memberships(lookup)
            .into_iter()
            .flat_map(|groups| groups.values())
            .filter(|group| group.contains(&member))
            .filter_map(|group| group.cn.clone())
            .collect()
    }
}

/// an attribute sync plugin, instances carry their parsed parameters
pub trait SyncPlugin: std::fmt::Debug + Send + Sync {
    /// the identifier used in the `active_plugins` table
    fn ident(&self) -> &str;

    /// profile fields managed by this plugin which users can not edit
    fn lock_attributes(&self) -> Vec<String>;

    /// directory attributes the plugin reads
    fn needed_attributes(&self, config: &ConnectionConfig) -> Vec<String>;

    /// group lookups which have to be resolved before the plugin runs
    fn group_lookups(&self, _contact_groups: &[String]) -> Vec<GroupLookup> {
        Vec::new()
    }

    /// profile fields which are only used by the web application
    fn multisite_attributes(&self) -> Vec<String> {
        Vec::new()
    }

    /// profile fields which are not forwarded to contact definitions
    fn non_contact_attributes(&self) -> Vec<String> {
        Vec::new()
    }

    /// the changes to the profile of a user
    ///
    /// must only depend on its arguments
    fn sync(
        &self,
        ctx: &PluginContext<'_>,
        user_id: &str,
        fetched: &FetchedUser,
        profile: &UserProfile,
    ) -> Result<ProfileUpdate, PluginError>;
}

/// the identifiers of the built-in plugins in the order they run
pub const BUILTIN_PLUGINS: &[&str] = &[
    "email",
    "alias",
    "auth_expire",
    "pager",
    "groups_to_contactgroups",
    "groups_to_attributes",
    "groups_to_roles",
];

/// parse the parameters of a plugin from its entry in the `active_plugins` table
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    ident: &str,
    params: &toml::Value,
) -> Result<T, ConfigError> {
    if !params.is_table() {
        return Err(ConfigError::InvalidPluginParameters {
            plugin: ident.to_string(),
            reason: format!("expected a table, got {}", params.type_str()),
        });
    }
    params
        .clone()
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::InvalidPluginParameters {
            plugin: ident.to_string(),
            reason: e.message().to_string(),
        })
}

/// build a built-in plugin from its parameters
fn builtin_plugin(
    ident: &str,
    params: &toml::Value,
) -> Result<Box<dyn SyncPlugin>, ConfigError> {
    Ok(match ident {
        "email" => Box::new(CopyAttributePlugin::email(parse_params(ident, params)?)),
        "alias" => Box::new(CopyAttributePlugin::alias(parse_params(ident, params)?)),
        "pager" => Box::new(CopyAttributePlugin::pager(parse_params(ident, params)?)),
        "auth_expire" => Box::new(AuthExpirePlugin::new(parse_params(ident, params)?)),
        "groups_to_contactgroups" => {
            Box::new(GroupsToContactgroupsPlugin::new(parse_params(ident, params)?))
        }
        "groups_to_attributes" => {
            Box::new(GroupsToAttributesPlugin::new(parse_params(ident, params)?))
        }
        "groups_to_roles" => Box::new(GroupsToRolesPlugin::new(parse_params(ident, params)?)),
        other => {
            return Err(ConfigError::InvalidPluginParameters {
                plugin: other.to_string(),
                reason: "not a built-in plugin".to_string(),
            })
        }
    })
}

/// the active plugins of a connection in the order they run
#[derive(Debug, Default)]
pub struct PluginRegistry {
    /// the plugins
    plugins: Vec<Box<dyn SyncPlugin>>,
}

impl PluginRegistry {
    /// the plugins configured in the `active_plugins` table of the connection
    ///
    /// built-in plugins run first in a fixed order followed by the custom
    /// attribute plugins, unknown identifiers are skipped
    pub fn activate(
        config: &ConnectionConfig,
        custom_attributes: &[CustomAttributeSpec],
    ) -> Result<Self, ConfigError> {
        let mut plugins: Vec<Box<dyn SyncPlugin>> = Vec::new();
        for ident in BUILTIN_PLUGINS {
            if let Some(params) = config.active_plugins.get(*ident) {
                plugins.push(builtin_plugin(ident, params)?);
            }
        }
        for spec in custom_attributes {
            if BUILTIN_PLUGINS.contains(&spec.name.as_str()) {
                continue;
            }
            if let Some(params) = config.active_plugins.get(&spec.name) {
                plugins.push(Box::new(CustomAttributePlugin::new(
                    spec.name.clone(),
                    parse_params(&spec.name, params)?,
                )));
            }
        }
        for ident in config.active_plugins.keys() {
            if !plugins.iter().any(|p| p.ident() == ident) {
                tracing::warn!(
                    "Connection {}: Skipping unknown LDAP attribute plugin {}",
                    config.id,
                    ident
                );
            }
        }
        Ok(PluginRegistry { plugins })
    }

    /// the active plugins in the order they run
    pub fn plugins(&self) -> &[Box<dyn SyncPlugin>] {
        &self.plugins
    }

    /// the identifiers of the active plugins
    pub fn idents(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.ident()).collect()
    }

    /// all directory attributes read by the active plugins
    pub fn needed_attributes(&self, config: &ConnectionConfig) -> BTreeSet<String> {
        self.plugins
            .iter()
            .flat_map(|p| p.needed_attributes(config))
            .collect()
    }

    /// all group lookups needed by the active plugins, without duplicates
    pub fn group_lookups(&self, contact_groups: &[String]) -> Vec<GroupLookup> {
        let mut lookups: Vec<GroupLookup> = Vec::new();
        for lookup in self
            .plugins
            .iter()
            .flat_map(|p| p.group_lookups(contact_groups))
        {
            if !lookups.contains(&lookup) {
                lookups.push(lookup);
            }
        }
        lookups
    }

    /// all profile fields locked by the active plugins
    pub fn lock_attributes(&self) -> Vec<String> {
        itertools::Itertools::unique(self.plugins.iter().flat_map(|p| p.lock_attributes()))
            .collect()
    }

    /// all profile fields only used by the web application
    pub fn multisite_attributes(&self) -> Vec<String> {
        itertools::Itertools::unique(self.plugins.iter().flat_map(|p| p.multisite_attributes()))
            .collect()
    }

    /// all profile fields not forwarded to contact definitions
    pub fn non_contact_attributes(&self) -> Vec<String> {
        itertools::Itertools::unique(
            self.plugins
                .iter()
                .flat_map(|p| p.non_contact_attributes()),
        )
        .collect()
    }

    /// run all plugins against the profile
    ///
    /// later plugins see the changes of earlier ones and may overwrite them
    pub fn sync_user(
        &self,
        ctx: &PluginContext<'_>,
        user_id: &str,
        fetched: &FetchedUser,
        profile: &mut UserProfile,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            let update = plugin.sync(ctx, user_id, fetched, profile)?;
            update.apply(profile);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    fn activate(plugins: &str, custom: &[CustomAttributeSpec]) -> Result<PluginRegistry, ConfigError> {
        let mut config = test_config("corp");
        config.active_plugins = toml::from_str(plugins).unwrap();
        PluginRegistry::activate(&config, custom)
    }

    fn department() -> CustomAttributeSpec {
        CustomAttributeSpec {
            name: "department".to_string(),
            title: "Department".to_string(),
            default: toml::Value::String(String::new()),
        }
    }

    #[test]
    fn test_plugins_run_in_registration_order() {
        let registry = activate(
            r#"
            department = {}
            groups_to_roles = { roles = {} }
            pager = {}
            email = { attr = "userPrincipalName" }
            unknown = {}
            "#,
            &[department()],
        )
        .unwrap();
        assert_eq!(
            registry.idents(),
            vec!["email", "pager", "groups_to_roles", "department"]
        );
        let config = test_config("corp");
        let needed = registry.needed_attributes(&config);
        assert!(needed.contains("userprincipalname"));
        assert!(needed.contains("mobile"));
        assert!(needed.contains("department"));
        assert_eq!(
            registry.lock_attributes(),
            vec!["email", "pager", "roles", "department"]
        );
    }

    #[test]
    fn test_non_table_parameters_are_rejected() {
        assert!(matches!(
            activate("email = true", &[]),
            Err(ConfigError::InvalidPluginParameters { plugin, .. }) if plugin == "email"
        ));
        assert!(matches!(
            activate("groups_to_attributes = { nested = true }", &[]),
            Err(ConfigError::InvalidPluginParameters { plugin, .. }) if plugin == "groups_to_attributes"
        ));
    }

    #[test]
    fn test_group_lookups_are_deduplicated() {
        let registry = activate(
            r#"
            groups_to_contactgroups = {}
            groups_to_attributes = { groups = [ { cn = "ops", attribute = "department", value = "ops" } ] }
            "#,
            &[department()],
        )
        .unwrap();
        let contact_groups = vec!["ops".to_string(), "dev".to_string()];
        let lookups = registry.group_lookups(&contact_groups);
        assert_eq!(lookups.len(), 2);
        assert_eq!(
            registry.non_contact_attributes(),
            Vec::<String>::new()
        );
    }
}
