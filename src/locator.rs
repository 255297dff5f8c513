//! discovery of the nearest domain controller of an Active Directory domain

use std::cmp::Reverse;

use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::instrument;

/// errors which can happen while looking for a domain controller
#[derive(Debug, Error)]
pub enum LocatorError {
    /// an error resolving the SRV records
    #[error("DNS resolve error: {0}")]
    ResolveError(#[from] hickory_resolver::error::ResolveError),
    /// the domain has no LDAP SRV records
    #[error("No LDAP service records found for domain {0}")]
    NoRecords(String),
}

/// the DNS name of the SRV records announcing LDAP servers of a domain
pub fn ldap_srv_name(domain: &str) -> String {
    format!("_ldap._tcp.{}", domain.trim_end_matches('.'))
}

/// pick the preferred target from `(priority, weight, target)` tuples,
/// lowest priority first, then highest weight
pub fn preferred_target<I>(records: I) -> Option<String>
where
    I: IntoIterator<Item = (u16, u16, String)>,
{
    records
        .into_iter()
        .min_by_key(|(priority, weight, target)| (*priority, Reverse(*weight), target.clone()))
        .map(|(_, _, target)| target)
}

/// look up the nearest LDAP server of the domain via its SRV records
#[instrument]
pub async fn nearest_server(domain: &str) -> Result<String, LocatorError> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
    let lookup = resolver.srv_lookup(ldap_srv_name(domain)).await?;
    let server = preferred_target(
        lookup
            .iter()
            .map(|srv| (srv.priority(), srv.weight(), srv.target().to_utf8())),
    )
    .ok_or_else(|| LocatorError::NoRecords(domain.to_string()))?;
    tracing::debug!("Discovered nearest LDAP server {} for domain {}", server, domain);
    Ok(server)
}
