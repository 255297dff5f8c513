//! helpers for distinguished names and filter values

/// escape the `#` character in DNs
///
/// Active Directory allows `#` inside RDN values, it has to be escaped when
/// the DN is used as search base or as value in a filter
pub fn escape_dn(dn: &str) -> String {
    dn.replace('#', r"\#")
}

/// inverse of [escape_dn]
pub fn unescape_dn(dn: &str) -> String {
    dn.replace(r"\#", "#")
}

/// escape a value for use in an LDAP filter (RFC 4515)
pub fn escape_filter_value(value: &str) -> String {
    ldap3::ldap_escape(value).into_owned()
}

/// escape a DN for use as value in an LDAP filter
pub fn escape_dn_filter_value(dn: &str) -> String {
    escape_filter_value(&escape_dn(dn))
}

/// split a DN into its RDNs, honoring backslash escaped commas
pub fn split_rdns(dn: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            ',' => {
                result.push(dn[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = dn[start..].trim();
    if !last.is_empty() || !result.is_empty() {
        result.push(last);
    }
    result
}

/// normalized form of an RDN used for comparisons
fn normalize_rdn(rdn: &str) -> String {
    match rdn.split_once('=') {
        Some((attr, value)) => format!("{}={}", attr.trim(), value.trim()).to_lowercase(),
        None => rdn.trim().to_lowercase(),
    }
}

/// the longest common suffix of RDNs of both DNs, None if they do not even
/// share the last RDN
///
/// the result is built from the RDNs of `a`
pub fn common_base_dn(a: &str, b: &str) -> Option<String> {
    let a_rdns = split_rdns(a);
    let b_rdns = split_rdns(b);
    let common = a_rdns
        .iter()
        .rev()
        .zip(b_rdns.iter().rev())
        .take_while(|(x, y)| normalize_rdn(x) == normalize_rdn(y))
        .count();
    if common == 0 {
        return None;
    }
    Some(a_rdns[a_rdns.len() - common..].join(","))
}
