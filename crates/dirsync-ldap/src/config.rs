//! LDAP connection configuration
//!
//! Configuration for the directory server and the namespace accounts live in.

use std::collections::HashMap;
use std::str::FromStr;

use dirsync_connector::config::{ConnectionSettings, TlsConfig};
use dirsync_connector::error::{DirectoryError, DirectoryResult};
use serde::{Deserialize, Serialize};

/// Configuration for the LDAP directory.
#[derive(Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// LDAP server hostname or IP address.
    #[serde(default = "default_host")]
    pub host: String,

    /// LDAP server port (389 for LDAP, 636 for LDAPS).
    #[serde(default = "default_ldap_port")]
    pub port: u16,

    /// Base DN suffix for user and group entries (e.g., "dc=example,dc=com").
    #[serde(default = "default_base_dn")]
    pub base_dn: String,

    /// Bind DN for authentication.
    #[serde(default = "default_bind_dn")]
    pub bind_dn: String,

    /// Bind password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_password: Option<String>,

    /// Connection settings (timeouts).
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,

    /// User container RDN, relative to `base_dn`.
    #[serde(default = "default_user_container")]
    pub user_container: String,

    /// Group container RDN, relative to `base_dn`.
    #[serde(default = "default_group_container")]
    pub group_container: String,
}

impl std::fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("base_dn", &self.base_dn)
            .field("bind_dn", &self.bind_dn)
            .field(
                "bind_password",
                &self.bind_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("connection", &self.connection)
            .field("tls", &self.tls)
            .field("user_container", &self.user_container)
            .field("group_container", &self.group_container)
            .finish()
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_ldap_port() -> u16 {
    389
}

fn default_ldaps_port() -> u16 {
    636
}

fn default_base_dn() -> String {
    "dc=digitalis,dc=io".to_string()
}

fn default_bind_dn() -> String {
    "cn=admin".to_string()
}

fn default_user_container() -> String {
    "ou=People".to_string()
}

fn default_group_container() -> String {
    "ou=Groups".to_string()
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self::new(default_host(), default_base_dn(), default_bind_dn())
    }
}

impl LdapConfig {
    /// Create a new LDAP config with required fields.
    pub fn new(
        host: impl Into<String>,
        base_dn: impl Into<String>,
        bind_dn: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_ldap_port(),
            base_dn: base_dn.into(),
            bind_dn: bind_dn.into(),
            bind_password: None,
            connection: ConnectionSettings::default(),
            tls: TlsConfig::default(),
            user_container: default_user_container(),
            group_container: default_group_container(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `LDAP_HOSTNAME` (default: localhost)
    /// - `LDAP_PORT` (default: 389, or 636 with TLS)
    /// - `LDAP_BIND` (default: cn=admin)
    /// - `LDAP_PASSWORD`
    /// - `LDAP_BASE_DN` (default: dc=digitalis,dc=io)
    /// - `LDAP_TLS`: true/false (default: false)
    /// - `LDAP_TLS_CA`, `LDAP_TLS_CERT`, `LDAP_TLS_KEY`: PEM file paths
    /// - `LDAP_TLS_INSECURE`: skip server certificate verification (default: false)
    /// - `LDAP_CONNECT_TIMEOUT_SECS` (default: 30)
    pub fn from_env() -> DirectoryResult<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Load configuration from an explicit variable map.
    pub fn from_vars(vars: HashMap<String, String>) -> DirectoryResult<Self> {
        let get = |key: &str| vars.get(key).filter(|v| !v.is_empty()).cloned();

        let tls_enabled = match get("LDAP_TLS") {
            Some(v) => parse_var::<bool>("LDAP_TLS", &v)?,
            None => false,
        };
        let insecure = match get("LDAP_TLS_INSECURE") {
            Some(v) => parse_var::<bool>("LDAP_TLS_INSECURE", &v)?,
            None => false,
        };
        let port = match get("LDAP_PORT") {
            Some(v) => parse_var::<u16>("LDAP_PORT", &v)?,
            None if tls_enabled => default_ldaps_port(),
            None => default_ldap_port(),
        };

        let mut config = Self::new(
            get("LDAP_HOSTNAME").unwrap_or_else(default_host),
            get("LDAP_BASE_DN").unwrap_or_else(default_base_dn),
            get("LDAP_BIND").unwrap_or_else(default_bind_dn),
        );
        config.port = port;
        config.bind_password = get("LDAP_PASSWORD");
        let mut tls = if tls_enabled {
            TlsConfig::enabled()
        } else {
            TlsConfig::default()
        };
        if insecure {
            tls = tls.without_verification();
        }
        if let Some(ca) = get("LDAP_TLS_CA") {
            tls = tls.with_ca_cert(ca);
        }
        tls.client_cert_path = get("LDAP_TLS_CERT");
        tls.client_key_path = get("LDAP_TLS_KEY");
        config.tls = tls;
        if let Some(v) = get("LDAP_CONNECT_TIMEOUT_SECS") {
            config.connection.connection_timeout_secs =
                parse_var::<u64>("LDAP_CONNECT_TIMEOUT_SECS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set bind password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.bind_password = Some(password.into());
        self
    }

    /// Enable SSL (LDAPS).
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        if tls.enabled && self.port == default_ldap_port() {
            self.port = default_ldaps_port();
        }
        self.tls = tls;
        self
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Get the full user container DN.
    #[must_use]
    pub fn user_base(&self) -> String {
        format!("{},{}", self.user_container, self.base_dn)
    }

    /// Get the full group container DN.
    #[must_use]
    pub fn group_base(&self) -> String {
        format!("{},{}", self.group_container, self.base_dn)
    }

    /// Get the LDAP URL.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls.enabled { "ldaps" } else { "ldap" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.host.is_empty() {
            return Err(DirectoryError::invalid_configuration("host is required"));
        }

        if self.base_dn.is_empty() {
            return Err(DirectoryError::invalid_configuration("base_dn is required"));
        }

        if self.bind_dn.is_empty() {
            return Err(DirectoryError::invalid_configuration("bind_dn is required"));
        }

        self.tls.validate()
    }

    /// Create a redacted version of this config (for logging/display).
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.bind_password.is_some() {
            config.bind_password = Some("***REDACTED***".to_string());
        }
        config
    }
}

fn parse_var<T: FromStr>(var: &str, value: &str) -> DirectoryResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        DirectoryError::invalid_configuration(format!("{var} has an invalid value: {value}"))
    })
}
