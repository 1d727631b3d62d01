//! Directory sessions
//!
//! A session is one authenticated connection used for exactly one logical
//! operation and released afterwards. There is no pooling.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use dirsync_connector::error::{DirectoryError, DirectoryResult};
use ldap3::{
    DerefAliases, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry,
    SearchOptions,
};
use native_tls::{Certificate, Identity, TlsConnector};
use tracing::{debug, instrument, warn};

use crate::config::LdapConfig;

/// LDAP result code for invalid credentials.
const RC_INVALID_CREDENTIALS: u32 = 49;
/// LDAP result code for a missing search base or target entry.
const RC_NO_SUCH_OBJECT: u32 = 32;

/// A subtree search under `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub filter: String,
    /// Attributes to return; only what the lookup needs.
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(
        base: impl Into<String>,
        filter: impl Into<String>,
        attributes: &[&str],
    ) -> Self {
        Self {
            base: base.into(),
            filter: filter.into(),
            attributes: attributes.iter().map(|a| (*a).to_string()).collect(),
        }
    }
}

/// An entry returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// All values of an attribute. Attribute names are case-insensitive.
    pub fn values(&self, name: &str) -> &[String] {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// First value of an attribute.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }
}

impl From<SearchEntry> for DirectoryEntry {
    fn from(entry: SearchEntry) -> Self {
        Self {
            dn: entry.dn,
            attrs: entry.attrs,
        }
    }
}

/// A full entry to be added, attributes in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewEntry {
    pub dn: String,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl NewEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Append an attribute. Attributes without values are skipped.
    #[must_use]
    pub fn with(mut self, name: &str, values: Vec<String>) -> Self {
        if !values.is_empty() {
            self.attributes.push((name.to_string(), values));
        }
        self
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Primitives offered by an authenticated directory connection.
#[async_trait]
pub trait DirectorySession: Send {
    /// Subtree search that never dereferences aliases.
    ///
    /// A missing base is reported as an empty result.
    async fn search(&mut self, request: &SearchRequest) -> DirectoryResult<Vec<DirectoryEntry>>;

    async fn add(&mut self, entry: &NewEntry) -> DirectoryResult<()>;

    async fn delete(&mut self, dn: &str) -> DirectoryResult<()>;

    /// Release the connection.
    async fn close(&mut self);
}

/// Opens one fresh session per logical operation.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Connect and bind.
    ///
    /// Rejected credentials yield `AuthenticationFailed`; transport and other
    /// bind failures yield `ConnectionFailed`.
    async fn open(&self) -> DirectoryResult<Box<dyn DirectorySession>>;
}

/// Session factory backed by `ldap3`.
pub struct LdapSessionFactory {
    config: LdapConfig,
}

impl LdapSessionFactory {
    /// Create a factory from a validated configuration.
    pub fn new(config: LdapConfig) -> DirectoryResult<Self> {
        config.validate()?;
        config.tls.validate_security();
        Ok(Self { config })
    }

    async fn settings(&self) -> DirectoryResult<LdapConnSettings> {
        let settings =
            LdapConnSettings::new().set_conn_timeout(self.config.connection.connection_timeout());

        if !self.config.tls.enabled {
            return Ok(settings);
        }

        Ok(settings.set_connector(self.tls_connector().await?))
    }

    async fn tls_connector(&self) -> DirectoryResult<TlsConnector> {
        let tls = &self.config.tls;
        let mut builder = TlsConnector::builder();

        if let Some(ca_path) = &tls.ca_cert_path {
            let pem = read_pem(ca_path).await?;
            let ca = Certificate::from_pem(&pem).map_err(|e| {
                DirectoryError::tls_with_source(format!("invalid CA certificate {ca_path}"), e)
            })?;
            builder.add_root_certificate(ca);
        }

        if let Some(client) = tls.client_identity() {
            let cert = read_pem(client.cert_path).await?;
            let key = read_pem(client.key_path).await?;
            let identity = Identity::from_pkcs8(&cert, &key).map_err(|e| {
                DirectoryError::tls_with_source(
                    format!("invalid client certificate/key pair {}", client.cert_path),
                    e,
                )
            })?;
            builder.identity(identity);
        }

        if !tls.verify_certificate {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }

        builder
            .build()
            .map_err(|e| DirectoryError::tls_with_source("failed to build TLS connector", e))
    }
}

async fn read_pem(path: &str) -> DirectoryResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| DirectoryError::tls_with_source(format!("cannot read {path}"), e))
}

#[async_trait]
impl SessionFactory for LdapSessionFactory {
    #[instrument(skip(self), fields(url = %self.config.url()))]
    async fn open(&self) -> DirectoryResult<Box<dyn DirectorySession>> {
        let url = self.config.url();
        let settings = self.settings().await?;

        debug!("Connecting to LDAP server");

        let timeouts = &self.config.connection;
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| match e {
                LdapError::Timeout { .. } => timed_out(timeouts.connection_timeout()),
                e => DirectoryError::connection_failed_with_source(
                    format!("failed to connect to LDAP server at {url}"),
                    e,
                ),
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let bind_dn = &self.config.bind_dn;
        let bind_password = self.config.bind_password.as_deref().unwrap_or("");

        debug!(bind_dn = %bind_dn, "Performing LDAP bind");

        let result = ldap
            .with_timeout(self.config.connection.operation_timeout())
            .simple_bind(bind_dn, bind_password)
            .await
            .map_err(|e| match e {
                LdapError::Timeout { .. } => timed_out(timeouts.operation_timeout()),
                e => DirectoryError::connection_failed_with_source(
                    format!("LDAP bind failed for {bind_dn}"),
                    e,
                ),
            })?;

        if result.rc == RC_INVALID_CREDENTIALS {
            return Err(DirectoryError::AuthenticationFailed {
                bind_dn: bind_dn.clone(),
            });
        }
        if result.rc != 0 {
            return Err(DirectoryError::connection_failed(format!(
                "LDAP bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        Ok(Box::new(LdapSession {
            ldap,
            operation_timeout: self.config.connection.operation_timeout(),
        }))
    }
}

impl std::fmt::Debug for LdapSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSessionFactory")
            .field("config", &self.config.redacted())
            .finish()
    }
}

/// A bound `ldap3` connection.
pub struct LdapSession {
    ldap: Ldap,
    operation_timeout: Duration,
}

fn timed_out(timeout: Duration) -> DirectoryError {
    DirectoryError::ConnectionTimeout {
        timeout_secs: timeout.as_secs(),
    }
}

/// Map an `ldap3` error from `operation`, run under `timeout`, into the
/// directory error kinds.
fn map_ldap_error(operation: &'static str, timeout: Duration, error: LdapError) -> DirectoryError {
    match error {
        LdapError::LdapResult { result } => {
            DirectoryError::protocol(operation, result.rc, result.text)
        }
        LdapError::Timeout { .. } => timed_out(timeout),
        other => DirectoryError::connection_failed_with_source(
            format!("LDAP {operation} failed"),
            other,
        ),
    }
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn search(&mut self, request: &SearchRequest) -> DirectoryResult<Vec<DirectoryEntry>> {
        debug!(base = %request.base, filter = %request.filter, "Searching LDAP");

        let result = self
            .ldap
            .with_search_options(SearchOptions::new().deref(DerefAliases::Never))
            .with_timeout(self.operation_timeout)
            .search(
                &request.base,
                Scope::Subtree,
                &request.filter,
                request.attributes.clone(),
            )
            .await
            .map_err(|e| map_ldap_error("search", self.operation_timeout, e))?;

        if result.1.rc == RC_NO_SUCH_OBJECT {
            return Ok(Vec::new());
        }

        let (entries, _) = result.success().map_err(|e| map_ldap_error("search", self.operation_timeout, e))?;

        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(DirectoryEntry::from)
            .collect())
    }

    async fn add(&mut self, entry: &NewEntry) -> DirectoryResult<()> {
        debug!(dn = %entry.dn, "Adding LDAP entry");

        let attrs: Vec<(&str, HashSet<&str>)> = entry
            .attributes
            .iter()
            .map(|(name, values)| (name.as_str(), values.iter().map(String::as_str).collect()))
            .collect();

        self.ldap
            .with_timeout(self.operation_timeout)
            .add(&entry.dn, attrs)
            .await
            .map_err(|e| map_ldap_error("add", self.operation_timeout, e))?
            .success()
            .map_err(|e| map_ldap_error("add", self.operation_timeout, e))?;

        Ok(())
    }

    async fn delete(&mut self, dn: &str) -> DirectoryResult<()> {
        debug!(dn = %dn, "Deleting LDAP entry");

        self.ldap
            .with_timeout(self.operation_timeout)
            .delete(dn)
            .await
            .map_err(|e| map_ldap_error("delete", self.operation_timeout, e))?
            .success()
            .map_err(|e| map_ldap_error("delete", self.operation_timeout, e))?;

        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            warn!(error = %e, "Error during LDAP unbind");
        }
    }
}
