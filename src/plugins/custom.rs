//! one plugin per custom user attribute

use crate::config::ConnectionConfig;
use crate::directory_user::FetchedUser;
use crate::plugins::copy::AttributeParams;
use crate::plugins::{PluginContext, PluginError, SyncPlugin};
use crate::profile::{ProfileUpdate, UserProfile};

/// the custom attribute holding the notification switch of a user
const DISABLE_NOTIFICATIONS: &str = "disable_notifications";

/// copies a directory attribute into a custom user attribute of the same name
#[derive(Debug, Clone)]
pub struct CustomAttributePlugin {
    /// the name of the custom attribute
    name: String,
    /// the directory attribute, the attribute name by default
    params: AttributeParams,
}

impl CustomAttributePlugin {
    /// the plugin of the named custom attribute
    pub fn new(name: String, params: AttributeParams) -> Self {
        CustomAttributePlugin { name, params }
    }
}

impl SyncPlugin for CustomAttributePlugin {
    fn ident(&self) -> &str {
        &self.name
    }

    fn lock_attributes(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn needed_attributes(&self, config: &ConnectionConfig) -> Vec<String> {
        vec![self.params.attribute(config, &self.name)]
    }

    fn sync(
        &self,
        ctx: &PluginContext<'_>,
        _user_id: &str,
        fetched: &FetchedUser,
        _profile: &UserProfile,
    ) -> Result<ProfileUpdate, PluginError> {
        let attr = self.params.attribute(ctx.config, &self.name);
        let mut update = ProfileUpdate::default();
        if let Some(value) = fetched.first(&attr) {
            let value = if self.name == DISABLE_NOTIFICATIONS {
                // directory booleans are the strings TRUE and FALSE
                let mut table = toml::Table::new();
                if value == "TRUE" {
                    table.insert("disable".to_string(), toml::Value::Boolean(true));
                }
                toml::Value::Table(table)
            } else {
                toml::Value::String(value.to_string())
            };
            update.custom.insert(self.name.clone(), value);
        }
        Ok(update)
    }
}
