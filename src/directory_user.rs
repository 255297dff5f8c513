//! users as fetched from the directory during one sync pass

use std::collections::{BTreeMap, HashMap};

use crate::config::{ConnectionConfig, UmlautPolicy};

/// a user fetched from the directory
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedUser {
    /// lower cased distinguished name
    pub dn: String,
    /// attributes with lower cased names
    pub attrs: HashMap<String, Vec<String>>,
    /// the normalized user id
    pub user_id: String,
}

impl FetchedUser {
    /// the first value of the attribute
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.attrs
            .get(attr)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// whether the attribute was returned at all
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.contains_key(attr)
    }
}

/// fetched users by normalized user id
pub type FetchedUsers = BTreeMap<String, FetchedUser>;

/// ASCII transcriptions of umlauts
const UMLAUTS: &[(char, &str)] = &[
    ('ü', "ue"),
    ('ö', "oe"),
    ('ä', "ae"),
    ('ß', "ss"),
    ('Ü', "UE"),
    ('Ö', "OE"),
    ('Ä', "AE"),
    ('å', "aa"),
    ('Å', "Aa"),
    ('Ø', "Oe"),
    ('ø', "oe"),
    ('Æ', "Ae"),
    ('æ', "ae"),
];

/// normalize a user id as read from the directory according to the
/// case and umlaut policy of the connection
pub fn sanitize_user_id(config: &ConnectionConfig, raw: &str) -> String {
    let user_id = if config.lower_user_ids {
        raw.to_lowercase()
    } else {
        raw.to_string()
    };
    match config.user_id_umlauts {
        UmlautPolicy::Keep => user_id,
        UmlautPolicy::Replace => user_id
            .chars()
            .fold(String::with_capacity(user_id.len()), |mut acc, c| {
                match UMLAUTS.iter().find(|(u, _)| *u == c) {
                    Some((_, replacement)) => acc.push_str(replacement),
                    None => acc.push(c),
                }
                acc
            }),
    }
}

/// whether the normalized user id can name a local user
///
/// empty ids and ids with surrounding whitespace, control characters or
/// path separators are rejected
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.trim() == user_id
        && !user_id.chars().any(|c| c.is_control() || c == '/' || c == '\\')
}
