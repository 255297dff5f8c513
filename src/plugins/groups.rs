//! plugins deriving contact groups, custom attributes and roles from group memberships

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::config::ConnectionConfig;
use crate::directory_user::FetchedUser;
use crate::groups::member_cmp_value;
use crate::plugins::{PluginContext, PluginError, SyncPlugin};
use crate::profile::{ProfileUpdate, UserProfile};
use crate::session::GroupLookup;

/// parameters of [GroupsToContactgroupsPlugin]
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct GroupsToContactgroupsParams {
    /// also count members of sub-groups
    #[serde(default)]
    pub nested: bool,
}

/// puts users into the contact groups whose names match the cns of their groups
#[derive(Debug, Clone)]
pub struct GroupsToContactgroupsPlugin {
    /// the parameters
    params: GroupsToContactgroupsParams,
}

impl GroupsToContactgroupsPlugin {
    /// the plugin with its parameters
    pub fn new(params: GroupsToContactgroupsParams) -> Self {
        GroupsToContactgroupsPlugin { params }
    }

    /// the lookup of all groups named like a contact group
    fn lookup(&self, contact_groups: &[String]) -> GroupLookup {
        GroupLookup::by_cn(contact_groups.iter().cloned(), self.params.nested)
    }
}

impl SyncPlugin for GroupsToContactgroupsPlugin {
    fn ident(&self) -> &str {
        "groups_to_contactgroups"
    }

    fn lock_attributes(&self) -> Vec<String> {
        vec!["contactgroups".to_string()]
    }

    fn needed_attributes(&self, _config: &ConnectionConfig) -> Vec<String> {
        Vec::new()
    }

    fn group_lookups(&self, contact_groups: &[String]) -> Vec<GroupLookup> {
        vec![self.lookup(contact_groups)]
    }

    fn sync(
        &self,
        ctx: &PluginContext<'_>,
        user_id: &str,
        fetched: &FetchedUser,
        _profile: &UserProfile,
    ) -> Result<ProfileUpdate, PluginError> {
        let lookup = self.lookup(ctx.contact_groups);
        Ok(ProfileUpdate {
            contactgroups: Some(ctx.group_cns_of_user(&lookup, user_id, fetched)),
            ..Default::default()
        })
    }
}

/// one group to custom attribute mapping
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GroupAttributeSpec {
    /// the cn of the group
    pub cn: String,
    /// the custom attribute to set
    pub attribute: String,
    /// the value members get
    pub value: toml::Value,
}

/// parameters of [GroupsToAttributesPlugin]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GroupsToAttributesParams {
    /// also count members of sub-groups
    #[serde(default)]
    pub nested: bool,
    /// the mappings, later ones win for the same attribute
    pub groups: Vec<GroupAttributeSpec>,
}

/// sets custom attributes of the members of groups
#[derive(Debug, Clone)]
pub struct GroupsToAttributesPlugin {
    /// the parameters
    params: GroupsToAttributesParams,
}

impl GroupsToAttributesPlugin {
    /// the plugin with its parameters
    pub fn new(params: GroupsToAttributesParams) -> Self {
        GroupsToAttributesPlugin { params }
    }

    /// the lookup of all configured groups
    fn lookup(&self) -> GroupLookup {
        let cns: Vec<String> = itertools::Itertools::unique(
            self.params.groups.iter().map(|g| g.cn.clone()),
        )
        .collect();
        GroupLookup::by_cn(cns, self.params.nested)
    }
}

impl SyncPlugin for GroupsToAttributesPlugin {
    fn ident(&self) -> &str {
        "groups_to_attributes"
    }

    fn lock_attributes(&self) -> Vec<String> {
        self.params
            .groups
            .iter()
            .map(|g| g.attribute.clone())
            .collect()
    }

    fn needed_attributes(&self, _config: &ConnectionConfig) -> Vec<String> {
        Vec::new()
    }

    fn group_lookups(&self, _contact_groups: &[String]) -> Vec<GroupLookup> {
        vec![self.lookup()]
    }

    fn sync(
        &self,
        ctx: &PluginContext<'_>,
        user_id: &str,
        fetched: &FetchedUser,
        profile: &UserProfile,
    ) -> Result<ProfileUpdate, PluginError> {
        let groups = ctx.group_cns_of_user(&self.lookup(), user_id, fetched);
        let mut update = ProfileUpdate::default();
        // values of non-members go back to the default first
        for spec in &self.params.groups {
            if groups.contains(&spec.cn) || !profile.custom.contains_key(&spec.attribute) {
                continue;
            }
            if let Some(custom) = ctx
                .custom_attributes
                .iter()
                .find(|c| c.name == spec.attribute)
            {
                update
                    .custom
                    .insert(spec.attribute.clone(), custom.default.clone());
            }
        }
        for spec in &self.params.groups {
            if groups.contains(&spec.cn) {
                update
                    .custom
                    .insert(spec.attribute.clone(), spec.value.clone());
            }
        }
        Ok(update)
    }
}

/// parameters of [GroupsToRolesPlugin]
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct GroupsToRolesParams {
    /// also count members of sub-groups
    #[serde(default)]
    pub nested: bool,
    /// the DNs of the groups granting each role
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
}

/// grants roles to the members of groups
#[derive(Debug, Clone)]
pub struct GroupsToRolesPlugin {
    /// the parameters
    params: GroupsToRolesParams,
}

impl GroupsToRolesPlugin {
    /// the plugin with its parameters
    pub fn new(params: GroupsToRolesParams) -> Self {
        GroupsToRolesPlugin { params }
    }

    /// the lookup of all configured group DNs
    fn lookup(&self) -> GroupLookup {
        let dns: Vec<String> = itertools::Itertools::unique(
            self.params
                .roles
                .values()
                .flatten()
                .map(|dn| dn.to_lowercase()),
        )
        .collect();
        GroupLookup::by_dn(dns, self.params.nested)
    }
}

impl SyncPlugin for GroupsToRolesPlugin {
    fn ident(&self) -> &str {
        "groups_to_roles"
    }

    fn lock_attributes(&self) -> Vec<String> {
        vec!["roles".to_string()]
    }

    fn needed_attributes(&self, _config: &ConnectionConfig) -> Vec<String> {
        Vec::new()
    }

    fn group_lookups(&self, _contact_groups: &[String]) -> Vec<GroupLookup> {
        vec![self.lookup()]
    }

    fn sync(
        &self,
        ctx: &PluginContext<'_>,
        user_id: &str,
        fetched: &FetchedUser,
        _profile: &UserProfile,
    ) -> Result<ProfileUpdate, PluginError> {
        let lookup = self.lookup();
        let member = member_cmp_value(ctx.config, user_id, &fetched.dn);
        let groups = ctx.memberships(&lookup);
        let mut roles: Vec<String> = self
            .params
            .roles
            .iter()
            .filter(|(_, dns)| {
                dns.iter().any(|dn| {
                    groups
                        .and_then(|groups| groups.get(&dn.to_lowercase()))
                        .is_some_and(|group| group.contains(&member))
                })
            })
            .map(|(role, _)| role.clone())
            .collect();
        if roles.is_empty() {
            roles = ctx.default_roles.to_vec();
        }
        Ok(ProfileUpdate {
            roles: Some(roles),
            ..Default::default()
        })
    }
}
