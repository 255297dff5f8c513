//! invalidation of sessions when the password changed or the account got locked

use crate::config::ConnectionConfig;
use crate::directory_user::FetchedUser;
use crate::plugins::copy::AttributeParams;
use crate::plugins::{PluginContext, PluginError, SyncPlugin};
use crate::profile::{ProfileUpdate, UserProfile};

/// the Active Directory attribute holding the account flags
const USER_ACCOUNT_CONTROL: &str = "useraccountcontrol";

/// the account disabled flag in [USER_ACCOUNT_CONTROL]
const ACCOUNTDISABLE: u64 = 2;

/// bumps the serial of a user when the password change marker in the
/// directory changes, locks users disabled in Active Directory
#[derive(Debug, Clone)]
pub struct AuthExpirePlugin {
    /// the attribute used as password change marker
    params: AttributeParams,
}

impl AuthExpirePlugin {
    /// the plugin with its parameters
    pub fn new(params: AttributeParams) -> Self {
        AuthExpirePlugin { params }
    }
}

impl SyncPlugin for AuthExpirePlugin {
    fn ident(&self) -> &str {
        "auth_expire"
    }

    fn lock_attributes(&self) -> Vec<String> {
        Vec::new()
    }

    fn needed_attributes(&self, config: &ConnectionConfig) -> Vec<String> {
        let mut attrs = vec![self.params.attribute(config, "pw_changed")];
        if config.dialect.is_active_directory() {
            attrs.push(USER_ACCOUNT_CONTROL.to_string());
        }
        attrs
    }

    fn multisite_attributes(&self) -> Vec<String> {
        vec!["ldap_pw_last_changed".to_string()]
    }

    fn non_contact_attributes(&self) -> Vec<String> {
        vec!["ldap_pw_last_changed".to_string()]
    }

    fn sync(
        &self,
        ctx: &PluginContext<'_>,
        _user_id: &str,
        fetched: &FetchedUser,
        profile: &UserProfile,
    ) -> Result<ProfileUpdate, PluginError> {
        if ctx.config.dialect.is_active_directory() {
            if let Some(flags) = fetched.first(USER_ACCOUNT_CONTROL) {
                let flags: u64 = flags.trim().parse().map_err(|_| PluginError::InvalidValue {
                    attribute: USER_ACCOUNT_CONTROL.to_string(),
                    dn: fetched.dn.clone(),
                    value: flags.to_string(),
                })?;
                if flags & ACCOUNTDISABLE != 0 && !profile.locked {
                    return Ok(ProfileUpdate {
                        locked: Some(true),
                        serial: Some(profile.serial + 1),
                        ..Default::default()
                    });
                }
            }
        }

        let attr = self.params.attribute(ctx.config, "pw_changed");
        let changed = fetched
            .first(&attr)
            .ok_or_else(|| PluginError::MissingAttribute {
                attribute: attr.clone(),
                dn: fetched.dn.clone(),
            })?;
        match &profile.ldap_pw_last_changed {
            None => Ok(ProfileUpdate {
                ldap_pw_last_changed: Some(changed.to_string()),
                ..Default::default()
            }),
            Some(last) if last != changed => Ok(ProfileUpdate {
                ldap_pw_last_changed: Some(changed.to_string()),
                serial: Some(profile.serial + 1),
                ..Default::default()
            }),
            Some(_) => Ok(ProfileUpdate::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::Dialect;
    use crate::testing::test_config;

    fn fetched(attrs: &[(&str, &str)]) -> FetchedUser {
        FetchedUser {
            dn: "uid=carol,ou=people,dc=corp".to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                .collect(),
            user_id: "carol".to_string(),
        }
    }

    fn run(config: &ConnectionConfig, user: &FetchedUser, profile: &UserProfile) -> Result<ProfileUpdate, PluginError> {
        let groups = HashMap::new();
        let ctx = PluginContext {
            config,
            contact_groups: &[],
            default_roles: &[],
            custom_attributes: &[],
            groups: &groups,
        };
        AuthExpirePlugin::new(AttributeParams::default()).sync(&ctx, "carol", user, profile)
    }

    #[test]
    fn test_first_observation_is_stored_without_serial_change() {
        let config = test_config("corp");
        let user = fetched(&[("pwdchangedtime", "20240101000000Z")]);
        let mut profile = UserProfile {
            serial: 3,
            ..Default::default()
        };
        let update = run(&config, &user, &profile).unwrap();
        assert_eq!(update.ldap_pw_last_changed.as_deref(), Some("20240101000000Z"));
        assert_eq!(update.serial, None);

        update.apply(&mut profile);
        assert!(run(&config, &user, &profile).unwrap().is_empty());
    }

    #[test]
    fn test_changed_marker_bumps_serial_by_one() {
        let config = test_config("corp");
        let profile = UserProfile {
            serial: 3,
            ldap_pw_last_changed: Some("20240101000000Z".to_string()),
            ..Default::default()
        };
        let user = fetched(&[("pwdchangedtime", "20240601000000Z")]);
        let update = run(&config, &user, &profile).unwrap();
        assert_eq!(update.serial, Some(4));
        assert_eq!(update.ldap_pw_last_changed.as_deref(), Some("20240601000000Z"));
        // no accumulation across calls with identical input
        assert_eq!(run(&config, &user, &profile).unwrap(), update);
    }

    #[test]
    fn test_missing_marker_is_an_error() {
        let config = test_config("corp");
        assert!(matches!(
            run(&config, &fetched(&[]), &UserProfile::default()),
            Err(PluginError::MissingAttribute { attribute, .. }) if attribute == "pwdchangedtime"
        ));
    }

    #[test]
    fn test_disabled_account_is_locked_once() {
        let mut config = test_config("ad");
        config.dialect = Dialect::ActiveDirectory;
        let user = fetched(&[("pwdlastset", "1"), ("useraccountcontrol", "514")]);
        let mut profile = UserProfile {
            serial: 7,
            ldap_pw_last_changed: Some("1".to_string()),
            ..Default::default()
        };
        let update = run(&config, &user, &profile).unwrap();
        assert_eq!(update.locked, Some(true));
        assert_eq!(update.serial, Some(8));
        update.apply(&mut profile);
        assert!(run(&config, &user, &profile).unwrap().is_empty());

        let enabled = fetched(&[("pwdlastset", "1"), ("useraccountcontrol", "512")]);
        profile.locked = false;
        assert!(run(&config, &enabled, &profile).unwrap().is_empty());
        assert!(AuthExpirePlugin::new(AttributeParams::default())
            .needed_attributes(&config)
            .contains(&"useraccountcontrol".to_string()));
    }
}
