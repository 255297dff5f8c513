//! the seam between the directory client and the LDAP protocol library

use std::collections::HashMap;
use std::time::Duration;

use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, SearchEntry};
use native_tls::{Certificate, Identity, TlsConnector};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::x509::X509;
use thiserror::Error;
use tracing::instrument;

use crate::config::{ConnectionConfig, SearchScope, TlsSettings};

/// errors which can happen while preparing the TLS connector
#[derive(Debug, Error)]
pub enum TlsSetupError {
    /// an I/O error reading certificates or keys
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// an error in the native_tls crate
    #[error("Native TLS error: {0}")]
    NativeTLSError(#[from] native_tls::Error),
    /// an error in the openssl library used to read certificates and keys
    #[error("openssl error: {0}")]
    OpenSSLError(#[from] openssl::error::ErrorStack),
}

/// the well known error conditions of the directory protocol
#[derive(Debug, Error)]
pub enum BackendError {
    /// the server rejected the credentials (result code 49)
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
    /// the server does not allow this kind of authentication (result code 48)
    #[error("Inappropriate authentication: {0}")]
    InappropriateAuth(String),
    /// the server can not be reached or the connection dropped
    #[error("Can't contact LDAP server: {0}")]
    ServerDown(String),
    /// the operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),
    /// the search base does not exist (result code 32)
    #[error("No such object: {0}")]
    NoSuchObject(String),
    /// the filter is invalid (result code 87)
    #[error("Bad search filter: {0}")]
    FilterError(String),
    /// the server reached a size limit (result code 4)
    #[error("Size limit exceeded: {0}")]
    SizeLimitExceeded(String),
    /// an error setting up TLS
    #[error("TLS setup error: {0}")]
    Tls(#[from] TlsSetupError),
    /// the backend is used without an open connection
    #[error("Not connected")]
    NotConnected,
    /// any other error
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// whether reconnecting and repeating the operation may help
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::ServerDown(_) | BackendError::Timeout(_) | BackendError::NotConnected
        )
    }

    /// whether the server rejected the credentials used for a bind
    pub fn is_credentials(&self) -> bool {
        matches!(
            self,
            BackendError::InvalidCredentials(_) | BackendError::InappropriateAuth(_)
        )
    }

    /// map an LDAP result code onto the error conditions we distinguish
    pub fn from_result_code(rc: u32, text: &str) -> Self {
        let msg = format!("rc={} {}", rc, text).trim_end().to_string();
        match rc {
            4 => BackendError::SizeLimitExceeded(msg),
            32 => BackendError::NoSuchObject(msg),
            48 => BackendError::InappropriateAuth(msg),
            49 => BackendError::InvalidCredentials(msg),
            51 | 52 | 81 => BackendError::ServerDown(msg),
            85 => BackendError::Timeout(msg),
            87 => BackendError::FilterError(msg),
            _ => BackendError::Other(msg),
        }
    }
}

impl From<ldap3::LdapError> for BackendError {
    fn from(err: ldap3::LdapError) -> Self {
        match err {
            ldap3::LdapError::LdapResult { result } => {
                BackendError::from_result_code(result.rc, &result.text)
            }
            e @ ldap3::LdapError::Timeout { .. } => BackendError::Timeout(e.to_string()),
            e @ ldap3::LdapError::Io { .. } => BackendError::ServerDown(e.to_string()),
            e @ ldap3::LdapError::EndOfStream => BackendError::ServerDown(e.to_string()),
            e @ ldap3::LdapError::FilterParsing => BackendError::FilterError(e.to_string()),
            e => BackendError::Other(e.to_string()),
        }
    }
}

/// one entry of a search result
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchResultEntry {
    /// distinguished name as returned by the server
    pub dn: String,
    /// attributes with lower cased names and values decoded as text
    pub attrs: HashMap<String, Vec<String>>,
}

impl From<SearchEntry> for SearchResultEntry {
    fn from(entry: SearchEntry) -> Self {
        let mut attrs: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in entry.attrs {
            attrs.entry(k.to_lowercase()).or_default().extend(v);
        }
        for (k, v) in entry.bin_attrs {
            attrs
                .entry(k.to_lowercase())
                .or_default()
                .extend(v.iter().map(|b| String::from_utf8_lossy(b).into_owned()));
        }
        SearchResultEntry { dn: entry.dn, attrs }
    }
}

/// the settings needed to open a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectSettings {
    /// timeout for establishing the connection
    pub connect_timeout: Duration,
    /// timeout for each operation
    pub response_timeout: Duration,
    /// TLS settings
    pub tls: TlsSettings,
}

impl From<&ConnectionConfig> for ConnectSettings {
    fn from(config: &ConnectionConfig) -> Self {
        ConnectSettings {
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            tls: config.tls.clone(),
        }
    }
}

/// the operations of the directory protocol library we rely on
#[allow(async_fn_in_trait)]
pub trait LdapBackend: std::fmt::Debug {
    /// open a connection to the given URI, closing any previous one
    async fn open(&mut self, uri: &str, settings: &ConnectSettings) -> Result<(), BackendError>;

    /// simple bind, an empty DN and secret bind anonymously
    async fn simple_bind(&mut self, dn: &str, secret: &str) -> Result<(), BackendError>;

    /// a search using the paged results control, requesting pages until the
    /// server returns no cookie
    async fn paged_search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
        page_size: i32,
    ) -> Result<Vec<SearchResultEntry>, BackendError>;

    /// close the connection if one is open
    async fn close(&mut self);

    /// find the nearest server of the given domain
    async fn locate_server(&mut self, domain: &str) -> Result<String, BackendError>;
}

/// password of the transient PKCS#12 container built from the client certificate
const P12_PASSWORD: &str = "client";

/// build a TLS connector for the given settings, None if the defaults
/// of the protocol library suffice
pub fn tls_connector(tls: &TlsSettings) -> Result<Option<TlsConnector>, TlsSetupError> {
    let client_identity = tls.client_cert_path.as_ref().zip(tls.client_key_path.as_ref());
    if tls.ca_cert_path.is_none() && client_identity.is_none() {
        return Ok(None);
    }
    let mut builder = TlsConnector::builder();
    if let Some(ca_cert_path) = &tls.ca_cert_path {
        let ca_cert_contents = std::fs::read(ca_cert_path)?;
        builder.add_root_certificate(Certificate::from_pem(&ca_cert_contents)?);
    }
    if let Some((client_cert_path, client_key_path)) = client_identity {
        let client_cert = X509::from_pem(&std::fs::read(client_cert_path)?)?;
        let client_key = PKey::private_key_from_pem(&std::fs::read(client_key_path)?)?;
        let p12 = Pkcs12::builder()
            .name("client")
            .pkey(&client_key)
            .cert(&client_cert)
            .build2(P12_PASSWORD)?;
        let p12_contents = p12.to_der()?;
        builder.identity(Identity::from_pkcs12(&p12_contents, P12_PASSWORD)?);
    }
    if tls.no_tls_verify {
        builder.danger_accept_invalid_certs(true);
    }
    Ok(Some(builder.build()?))
}

/// [LdapBackend] using the ldap3 crate
#[derive(Debug, Default)]
pub struct Ldap3Backend {
    /// the open connection
    ldap: Option<Ldap>,
    /// timeout applied to every operation
    response_timeout: Option<Duration>,
}

impl Ldap3Backend {
    /// the open connection
    fn ldap(&mut self) -> Result<&mut Ldap, BackendError> {
        let timeout = self.response_timeout;
        let ldap = self.ldap.as_mut().ok_or(BackendError::NotConnected)?;
        if let Some(timeout) = timeout {
            ldap.with_timeout(timeout);
        }
        Ok(ldap)
    }
}

impl LdapBackend for Ldap3Backend {
    #[instrument(skip(self, settings))]
    async fn open(&mut self, uri: &str, settings: &ConnectSettings) -> Result<(), BackendError> {
        self.close().await;
        let mut ldap_settings = LdapConnSettings::new()
            .set_conn_timeout(settings.connect_timeout)
            .set_starttls(settings.tls.starttls);
        match tls_connector(&settings.tls)? {
            Some(connector) => ldap_settings = ldap_settings.set_connector(connector),
            None => ldap_settings = ldap_settings.set_no_tls_verify(settings.tls.no_tls_verify),
        }
        let (ldap_conn_async, ldap) = LdapConnAsync::with_settings(ldap_settings, uri).await?;
        ldap3::drive!(ldap_conn_async);
        self.ldap = Some(ldap);
        self.response_timeout = Some(settings.response_timeout);
        Ok(())
    }

    async fn simple_bind(&mut self, dn: &str, secret: &str) -> Result<(), BackendError> {
        self.ldap()?.simple_bind(dn, secret).await?.success()?;
        Ok(())
    }

    #[instrument(skip(self, attrs))]
    async fn paged_search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
        page_size: i32,
    ) -> Result<Vec<SearchResultEntry>, BackendError> {
        let adapters: Vec<Box<dyn Adapter<String, Vec<String>>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(page_size)),
        ];
        let mut search_stream = self
            .ldap()?
            .streaming_search_with(adapters, base, scope.into(), filter, attrs.to_vec())
            .await?;
        let mut rs = Vec::new();
        loop {
            match search_stream.next().await {
                Ok(Some(entry)) => rs.push(SearchResultEntry::from(SearchEntry::construct(entry))),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(
                        "Error {} in LDAP query after {} results\n  base: {}\n  scope: {:?}\n  filter: {}",
                        err,
                        rs.len(),
                        base,
                        scope,
                        filter,
                    );
                    return Err(err.into());
                }
            }
        }
        search_stream.finish().await.success()?;
        Ok(rs)
    }

    async fn close(&mut self) {
        if let Some(mut ldap) = self.ldap.take() {
            if let Err(err) = ldap.unbind().await {
                tracing::debug!("Error while unbinding from LDAP server: {}", err);
            }
        }
    }

    async fn locate_server(&mut self, domain: &str) -> Result<String, BackendError> {
        crate::locator::nearest_server(domain)
            .await
            .map_err(|e| BackendError::Other(e.to_string()))
    }
}
