//! the local user profiles managed by the sync

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// profile fields whose change only invalidates the sessions of a user
pub const PASSWORD_FIELDS: &[&str] = &["ldap_pw_last_changed", "serial"];

/// profile fields which are never compared when looking for modifications
const IGNORED_FIELDS: &[&str] = &["notification_rules"];

/// a local user profile
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// full name
    #[serde(default)]
    pub alias: String,
    /// id of the connection owning this user, `htpasswd` for local users
    #[serde(default)]
    pub connector: String,
    /// roles of the user
    #[serde(default)]
    pub roles: Vec<String>,
    /// contact groups of the user
    #[serde(default)]
    pub contactgroups: Vec<String>,
    /// email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// pager address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pager: Option<String>,
    /// locked users can not log in
    #[serde(default)]
    pub locked: bool,
    /// incremented to invalidate all sessions of the user
    #[serde(default)]
    pub serial: u64,
    /// last observed value of the password change attribute in the directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_pw_last_changed: Option<String>,
    /// notification rules, managed elsewhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_rules: Option<toml::Value>,
    /// custom user attributes
    #[serde(flatten)]
    pub custom: BTreeMap<String, toml::Value>,
}

/// all local users by user id
pub type Users = BTreeMap<String, UserProfile>;

/// a fresh profile for a user created by the given connection
pub fn new_user_template(user_id: &str, connector: &str, default_roles: &[String]) -> UserProfile {
    UserProfile {
        alias: user_id.to_string(),
        connector: connector.to_string(),
        roles: default_roles.to_vec(),
        ..Default::default()
    }
}

/// the changes a sync plugin wants to make to a profile, only the fields
/// which are set are changed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileUpdate {
    /// new alias
    pub alias: Option<String>,
    /// new email address
    pub email: Option<String>,
    /// new pager address
    pub pager: Option<String>,
    /// new roles
    pub roles: Option<Vec<String>>,
    /// new contact groups
    pub contactgroups: Option<Vec<String>>,
    /// new locked flag
    pub locked: Option<bool>,
    /// new serial
    pub serial: Option<u64>,
    /// new value of the password change marker
    pub ldap_pw_last_changed: Option<String>,
    /// new values of custom attributes
    pub custom: BTreeMap<String, toml::Value>,
}

impl ProfileUpdate {
    /// whether this update changes nothing
    pub fn is_empty(&self) -> bool {
        *self == ProfileUpdate::default()
    }

    /// write the set fields into the profile
    pub fn apply(self, profile: &mut UserProfile) {
        if let Some(alias) = self.alias {
            profile.alias = alias;
        }
        if let Some(email) = self.email {
            profile.email = Some(email);
        }
        if let Some(pager) = self.pager {
            profile.pager = Some(pager);
        }
        if let Some(roles) = self.roles {
            profile.roles = roles;
        }
        if let Some(contactgroups) = self.contactgroups {
            profile.contactgroups = contactgroups;
        }
        if let Some(locked) = self.locked {
            profile.locked = locked;
        }
        if let Some(serial) = self.serial {
            profile.serial = serial;
        }
        if let Some(changed) = self.ldap_pw_last_changed {
            profile.ldap_pw_last_changed = Some(changed);
        }
        profile.custom.extend(self.custom);
    }
}

/// the fields of a profile as generic values, absent optional fields are missing
fn field_map(profile: &UserProfile) -> BTreeMap<String, toml::Value> {
    /// a list of strings as value
    fn strings(values: &[String]) -> toml::Value {
        toml::Value::Array(values.iter().cloned().map(toml::Value::String).collect())
    }
    let mut fields = BTreeMap::new();
    fields.insert("alias".to_string(), toml::Value::String(profile.alias.clone()));
    fields.insert(
        "connector".to_string(),
        toml::Value::String(profile.connector.clone()),
    );
    fields.insert("roles".to_string(), strings(&profile.roles));
    fields.insert("contactgroups".to_string(), strings(&profile.contactgroups));
    if let Some(email) = &profile.email {
        fields.insert("email".to_string(), toml::Value::String(email.clone()));
    }
    if let Some(pager) = &profile.pager {
        fields.insert("pager".to_string(), toml::Value::String(pager.clone()));
    }
    fields.insert("locked".to_string(), toml::Value::Boolean(profile.locked));
    fields.insert(
        "serial".to_string(),
        toml::Value::Integer(i64::try_from(profile.serial).unwrap_or(i64::MAX)),
    );
    if let Some(changed) = &profile.ldap_pw_last_changed {
        fields.insert(
            "ldap_pw_last_changed".to_string(),
            toml::Value::String(changed.clone()),
        );
    }
    if let Some(rules) = &profile.notification_rules {
        fields.insert("notification_rules".to_string(), rules.clone());
    }
    for (k, v) in &profile.custom {
        fields.entry(k.clone()).or_insert_with(|| v.clone());
    }
    fields
}

/// compare two values, lists are compared as multisets
fn values_differ(old: &toml::Value, new: &toml::Value) -> bool {
    match (old, new) {
        (toml::Value::Array(a), toml::Value::Array(b)) => {
            let mut a: Vec<String> = a.iter().map(toml::Value::to_string).collect();
            let mut b: Vec<String> = b.iter().map(toml::Value::to_string).collect();
            a.sort();
            b.sort();
            a != b
        }
        (a, b) => a != b,
    }
}

/// human readable form of a value
fn display_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(values) => {
            format!("[{}]", itertools::join(values.iter().map(display_value), ", "))
        }
        other => other.to_string(),
    }
}

/// the result of comparing a stored profile with its synced copy
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserModifications {
    /// human readable descriptions of the changes
    pub changes: Vec<String>,
    /// only the session invalidating fields changed
    pub password_changed: bool,
    /// some other field changed
    pub edited: bool,
}

/// compare the stored profile of a user with the profile after the sync plugins ran
pub fn identify_user_modifications(
    existing: &UserProfile,
    modified: &UserProfile,
) -> UserModifications {
    let old_fields = field_map(existing);
    let new_fields = field_map(modified);
    let mut result = UserModifications::default();
    for (key, old) in old_fields
        .iter()
        .filter(|(k, _)| !IGNORED_FIELDS.contains(&k.as_str()))
    {
        let Some(new) = new_fields.get(key) else {
            continue;
        };
        if !values_differ(old, new) {
            continue;
        }
        if PASSWORD_FIELDS.contains(&key.as_str()) {
            result.password_changed = true;
        } else {
            result.changes.push(format!(
                "Changed {} from {} to {}",
                key,
                display_value(old),
                display_value(new)
            ));
            result.edited = true;
        }
    }
    let added: Vec<&str> = new_fields
        .keys()
        .filter(|k| !old_fields.contains_key(*k))
        .map(String::as_str)
        .collect();
    if !added.is_empty() {
        result.changes.push(format!("Added: {}", added.join(", ")));
    }
    let removed: Vec<&str> = old_fields
        .keys()
        .filter(|k| !new_fields.contains_key(*k))
        .map(String::as_str)
        .collect();
    if !removed.is_empty() {
        result.changes.push(format!("Removed: {}", removed.join(", ")));
    }
    result
}
