//! resolution of group memberships, directly or through nested groups

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::instrument;

use crate::backend::{LdapBackend, SearchResultEntry};
use crate::client::{DirectoryClient, DirectoryError};
use crate::config::{ConnectionConfig, SearchScope};
use crate::dn::{common_base_dn, escape_dn, escape_filter_value, unescape_dn};
use crate::session::{GroupFilterAttr, GroupLookup, GroupNode, SyncSession};

/// a group and its members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    /// the DN of the group
    pub dn: String,
    /// the cn of the group
    pub cn: Option<String>,
    /// sorted, lower cased members, DNs or user ids depending on the member attribute
    pub members: Vec<String>,
}

impl GroupMembership {
    /// whether the given comparison value is a member
    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}

/// groups by DN
pub type GroupMemberships = BTreeMap<String, GroupMembership>;

/// errors resolving group memberships
#[derive(Debug, Error)]
pub enum GroupError {
    /// nested lookups search below the common base of users and groups
    #[error("Unable to find a common base DN of the user base DN {user_dn} and the group base DN {group_dn}")]
    NoCommonBaseDn {
        /// the user base DN
        user_dn: String,
        /// the group base DN
        group_dn: String,
    },
    /// the configured user filter group does not exist
    #[error("The configured ldap user filter group {0} could not be found")]
    FilterGroupNotFound(String),
    /// a search failed
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// the value identifying a user in the member attribute of groups, the
/// lower cased user id for `memberuid`, the user DN otherwise
pub fn member_cmp_value(config: &ConnectionConfig, user_id: &str, user_dn: &str) -> String {
    if config.member_attr() == "memberuid" {
        user_id.to_lowercase()
    } else {
        user_dn.to_lowercase()
    }
}

/// all users reachable from the group `root` through sub-groups
///
/// every group is visited at most once, so cycles in the graph terminate
pub fn transitive_members(root: &str, graph: &HashMap<String, GroupNode>) -> BTreeSet<String> {
    let mut visited = HashSet::new();
    let mut pending = vec![root];
    let mut members = BTreeSet::new();
    while let Some(dn) = pending.pop() {
        if !visited.insert(dn) {
            continue;
        }
        if let Some(node) = graph.get(dn) {
            members.extend(node.users.iter().cloned());
            pending.extend(node.subgroups.iter().map(String::as_str));
        }
    }
    members
}

/// the first value of an attribute of a search result
fn first_value(entry: &SearchResultEntry, attr: &str) -> Option<String> {
    entry.attrs.get(attr).and_then(|v| v.first()).cloned()
}

/// whether the objectclass attribute contains the given class
fn has_objectclass(entry: &SearchResultEntry, class: &str) -> bool {
    entry
        .attrs
        .get("objectclass")
        .is_some_and(|classes| classes.iter().any(|c| c.eq_ignore_ascii_case(class)))
}

/// resolves group memberships using the caches of a [SyncSession]
#[derive(Debug)]
pub struct GroupResolver<'a, B> {
    /// the client used for searches
    client: &'a mut DirectoryClient<B>,
    /// the caches of the current pass
    session: &'a mut SyncSession,
}

impl<'a, B: LdapBackend> GroupResolver<'a, B> {
    /// a resolver for the current pass
    pub fn new(client: &'a mut DirectoryClient<B>, session: &'a mut SyncSession) -> Self {
        GroupResolver { client, session }
    }

    /// the memberships of the requested groups, cached for the pass
    #[instrument(skip(self))]
    pub async fn memberships(
        &mut self,
        lookup: &GroupLookup,
    ) -> Result<GroupMemberships, GroupError> {
        if let Some(cached) = self.session.group_searches.get(lookup) {
            return Ok(cached.clone());
        }
        let groups = if lookup.nested {
            self.nested_memberships(&lookup.filters, lookup.attr).await?
        } else {
            self.direct_memberships(&lookup.filters, lookup.attr).await?
        };
        self.session
            .group_searches
            .insert(lookup.clone(), groups.clone());
        Ok(groups)
    }

    /// a membership from a group search result
    fn membership(&self, dn: String, entry: &SearchResultEntry) -> GroupMembership {
        let member_attr = self.client.config().member_attr();
        let mut members: Vec<String> = entry
            .attrs
            .get(&member_attr)
            .map(|values| values.iter().map(|m| m.to_lowercase()).collect())
            .unwrap_or_default();
        members.sort();
        GroupMembership {
            dn,
            cn: first_value(entry, "cn"),
            members,
        }
    }

    /// the direct members of the requested groups
    ///
    /// Active Directory can filter groups by DN so a single search suffices,
    /// other directories need one base search per DN
    async fn direct_memberships(
        &mut self,
        filters: &[String],
        attr: GroupFilterAttr,
    ) -> Result<GroupMemberships, GroupError> {
        let config = self.client.config().clone();
        let columns = vec!["cn".to_string(), config.member_attr()];
        let mut groups = GroupMemberships::new();
        if config.dialect.is_active_directory() || attr == GroupFilterAttr::Cn {
            let mut filter = config.groups_filter();
            if !filters.is_empty() {
                let alternatives = itertools::join(
                    filters.iter().map(|f| {
                        let value = match attr {
                            GroupFilterAttr::DistinguishedName => escape_dn(f),
                            GroupFilterAttr::Cn => f.to_owned(),
                        };
                        format!("({}={})", attr.ldap_attr(), escape_filter_value(&value))
                    }),
                    "",
                );
                filter = format!("(&{}(|{}))", filter, alternatives);
            }
            for entry in self
                .client
                .search(&config.group_dn, &filter, &columns, config.group_scope)
                .await?
            {
                let dn = unescape_dn(&entry.dn);
                let membership = self.membership(dn.clone(), &entry);
                groups.insert(dn, membership);
            }
        } else {
            let filter = config.groups_filter();
            for group_dn in filters {
                if let Some(cached) = self.session.direct_groups.get(group_dn) {
                    groups.insert(group_dn.clone(), cached.clone());
                    continue;
                }
                let entries = match self
                    .client
                    .search(group_dn, &filter, &columns, SearchScope::Base)
                    .await
                {
                    Ok(entries) => entries,
                    Err(DirectoryError::NoSuchBase { .. }) => {
                        tracing::warn!("The group {} does not exist, skipping it", group_dn);
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                for entry in entries {
                    let membership = self.membership(group_dn.clone(), &entry);
                    groups.insert(group_dn.clone(), membership);
                }
            }
        }
        self.session.direct_groups.extend(
            groups
                .iter()
                .map(|(dn, membership)| (dn.clone(), membership.clone())),
        );
        Ok(groups)
    }

    /// the users which are members of the requested groups or of their sub-groups
    async fn nested_memberships(
        &mut self,
        filters: &[String],
        attr: GroupFilterAttr,
    ) -> Result<GroupMemberships, GroupError> {
        let config = self.client.config().clone();
        let base_dn = common_base_dn(&config.user_dn, &config.group_dn).ok_or_else(|| {
            GroupError::NoCommonBaseDn {
                user_dn: config.user_dn.clone(),
                group_dn: config.group_dn.clone(),
            }
        })?;
        let mut groups = GroupMemberships::new();
        for filter_value in filters {
            let mut matched: Vec<(String, Option<String>)> = Vec::new();
            match attr {
                GroupFilterAttr::Cn => {
                    let filter = format!(
                        "(&{}(cn={}))",
                        config.groups_filter(),
                        escape_filter_value(filter_value)
                    );
                    for entry in self
                        .client
                        .search(
                            &config.group_dn,
                            &filter,
                            &["dn".to_string(), "cn".to_string()],
                            config.group_scope,
                        )
                        .await?
                    {
                        let cn = first_value(&entry, "cn");
                        matched.push((entry.dn, cn));
                    }
                }
                GroupFilterAttr::DistinguishedName => matched.push((filter_value.clone(), None)),
            }
            for (dn, cn) in matched {
                let dn = unescape_dn(&dn);
                self.discover(&base_dn, &dn, cn).await?;
                let cn = self
                    .session
                    .nested_groups
                    .get(&dn)
                    .and_then(|node| node.cn.clone());
                let members = transitive_members(&dn, &self.session.nested_groups)
                    .into_iter()
                    .collect();
                groups.insert(dn.clone(), GroupMembership { dn, cn, members });
            }
        }
        Ok(groups)
    }

    /// the cn of a group given by DN
    async fn group_cn(&mut self, dn: &str) -> Result<Option<String>, GroupError> {
        let entries = self
            .client
            .search(dn, "(objectclass=group)", &["cn".to_string()], SearchScope::Base)
            .await?;
        Ok(entries.first().and_then(|entry| first_value(entry, "cn")))
    }

    /// add the group and everything reachable from it to the group graph of
    /// the session, every group is searched at most once per pass
    async fn discover(
        &mut self,
        base_dn: &str,
        root: &str,
        root_cn: Option<String>,
    ) -> Result<(), GroupError> {
        let mut queue = VecDeque::from([(root.to_string(), root_cn)]);
        while let Some((dn, cn)) = queue.pop_front() {
            if self.session.nested_groups.contains_key(&dn) {
                continue;
            }
            let cn = match cn {
                Some(cn) => Some(cn),
                None => self.group_cn(&dn).await?,
            };
            let filter = format!("(memberof={})", escape_filter_value(&escape_dn(&dn)));
            let mut node = GroupNode {
                cn,
                ..Default::default()
            };
            for entry in self
                .client
                .search(
                    base_dn,
                    &filter,
                    &["dn".to_string(), "objectclass".to_string()],
                    SearchScope::Subtree,
                )
                .await?
            {
                if has_objectclass(&entry, "user") {
                    node.users.insert(entry.dn);
                } else if has_objectclass(&entry, "group") {
                    node.subgroups.insert(unescape_dn(&entry.dn));
                }
            }
            for subgroup in &node.subgroups {
                if !self.session.nested_groups.contains_key(subgroup) {
                    queue.push_back((subgroup.clone(), None));
                }
            }
            self.session.nested_groups.insert(dn, node);
        }
        Ok(())
    }

    /// the lower cased members of the filter group, users have to be among
    /// them to be synchronized
    #[instrument(skip(self))]
    pub async fn filter_group_members(&mut self, dn: &str) -> Result<Vec<String>, GroupError> {
        let member_attr = self.client.config().member_attr();
        let entries = self
            .client
            .search(dn, "(objectclass=*)", &[member_attr.clone()], SearchScope::Base)
            .await
            .ok()
            .unwrap_or_default();
        let group = entries
            .first()
            .ok_or_else(|| GroupError::FilterGroupNotFound(dn.to_string()))?;
        Ok(group
            .attrs
            .get(&member_attr)
            .map(|members| members.iter().map(|m| m.to_lowercase()).collect())
            .unwrap_or_default())
    }
}
