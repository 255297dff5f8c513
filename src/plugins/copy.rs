//! plugins copying a single directory attribute into a profile field

use serde::Deserialize;

use crate::config::ConnectionConfig;
use crate::directory_user::FetchedUser;
use crate::plugins::{PluginContext, PluginError, SyncPlugin};
use crate::profile::{ProfileUpdate, UserProfile};

/// parameters of a plugin reading one attribute
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct AttributeParams {
    /// the directory attribute, replacing the dialect default
    #[serde(default)]
    pub attr: Option<String>,
}

impl AttributeParams {
    /// the lower cased attribute to read, `default_key` resolved through the dialect
    pub fn attribute(&self, config: &ConnectionConfig, default_key: &str) -> String {
        self.attr
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| config.ldap_attr(default_key))
    }
}

/// the profile field a [CopyAttributePlugin] writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    /// lower cased email address
    Email,
    /// full name
    Alias,
    /// pager address
    Pager,
}

/// copies the first value of a directory attribute into the email, alias or pager field
#[derive(Debug, Clone)]
pub struct CopyAttributePlugin {
    /// the target field
    field: Field,
    /// the parameters
    params: AttributeParams,
}

impl CopyAttributePlugin {
    /// the email plugin, reads `mail` by default
    pub fn email(params: AttributeParams) -> Self {
        CopyAttributePlugin {
            field: Field::Email,
            params,
        }
    }

    /// the alias plugin, reads `cn` by default
    pub fn alias(params: AttributeParams) -> Self {
        CopyAttributePlugin {
            field: Field::Alias,
            params,
        }
    }

    /// the pager plugin, reads `mobile` by default
    pub fn pager(params: AttributeParams) -> Self {
        CopyAttributePlugin {
            field: Field::Pager,
            params,
        }
    }

    /// the dialect key of the default attribute
    fn default_key(&self) -> &'static str {
        match self.field {
            Field::Email => "mail",
            Field::Alias => "cn",
            Field::Pager => "mobile",
        }
    }
}

impl SyncPlugin for CopyAttributePlugin {
    fn ident(&self) -> &str {
        match self.field {
            Field::Email => "email",
            Field::Alias => "alias",
            Field::Pager => "pager",
        }
    }

    fn lock_attributes(&self) -> Vec<String> {
        vec![self.ident().to_string()]
    }

    fn needed_attributes(&self, config: &ConnectionConfig) -> Vec<String> {
        vec![self.params.attribute(config, self.default_key())]
    }

    fn sync(
        &self,
        ctx: &PluginContext<'_>,
        _user_id: &str,
        fetched: &FetchedUser,
        _profile: &UserProfile,
    ) -> Result<ProfileUpdate, PluginError> {
        let attr = self.params.attribute(ctx.config, self.default_key());
        let Some(value) = fetched.first(&attr) else {
            return Ok(ProfileUpdate::default());
        };
        let mut update = ProfileUpdate::default();
        match self.field {
            Field::Email if !value.is_empty() => update.email = Some(value.to_lowercase()),
            Field::Email => {}
            Field::Alias => update.alias = Some(value.to_string()),
            Field::Pager => update.pager = Some(value.to_string()),
        }
        Ok(update)
    }
}
