//! the caches of one sync pass or one credential check

use std::collections::{BTreeSet, HashMap};

use crate::groups::{GroupMembership, GroupMemberships};

/// the attribute requested groups are identified by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupFilterAttr {
    /// the common name of the group
    Cn,
    /// the distinguished name of the group
    DistinguishedName,
}

impl GroupFilterAttr {
    /// the LDAP attribute used in filters
    pub fn ldap_attr(&self) -> &'static str {
        match self {
            GroupFilterAttr::Cn => "cn",
            GroupFilterAttr::DistinguishedName => "distinguishedname",
        }
    }
}

/// a request for the memberships of some groups
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupLookup {
    /// the cns or DNs of the requested groups
    pub filters: Vec<String>,
    /// what the filters contain
    pub attr: GroupFilterAttr,
    /// whether members of sub-groups count as members
    pub nested: bool,
}

impl GroupLookup {
    /// a lookup of groups by cn
    pub fn by_cn(cns: impl IntoIterator<Item = String>, nested: bool) -> Self {
        GroupLookup {
            filters: cns.into_iter().collect(),
            attr: GroupFilterAttr::Cn,
            nested,
        }
    }

    /// a lookup of groups by DN, the DNs are lower cased
    pub fn by_dn(dns: impl IntoIterator<Item = String>, nested: bool) -> Self {
        GroupLookup {
            filters: dns.into_iter().map(|dn| dn.to_lowercase()).collect(),
            attr: GroupFilterAttr::DistinguishedName,
            nested,
        }
    }
}

/// a group discovered while resolving nested memberships
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupNode {
    /// the cn of the group, if it was looked up
    pub cn: Option<String>,
    /// DNs of the users which are direct members
    pub users: BTreeSet<String>,
    /// DNs of the groups which are direct members
    pub subgroups: BTreeSet<String>,
}

/// the caches of one sync pass, a fresh session is used for every pass
/// and every credential check
#[derive(Debug, Default)]
pub struct SyncSession {
    /// user lookups by username: DN and raw user id, None when no unique match exists
    pub users: HashMap<String, Option<(String, String)>>,
    /// groups found by direct lookups, by DN
    pub direct_groups: HashMap<String, GroupMembership>,
    /// the group graph found by nested lookups, by DN
    pub nested_groups: HashMap<String, GroupNode>,
    /// results of whole lookups
    pub group_searches: HashMap<GroupLookup, GroupMemberships>,
}

impl SyncSession {
    /// a session with empty caches
    pub fn new() -> Self {
        Self::default()
    }
}
