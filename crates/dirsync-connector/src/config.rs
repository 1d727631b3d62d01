//! Transport settings for directory connections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, DirectoryResult};

/// Timeouts applied to every directory session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Bound on establishing the transport connection.
    pub connection_timeout_secs: u64,
    /// Bound on each bind, search, add or delete.
    pub operation_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            operation_timeout_secs: 60,
        }
    }
}

impl ConnectionSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// PEM paths of a client certificate and its PKCS#8 key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity<'a> {
    pub cert_path: &'a str,
    pub key_path: &'a str,
}

/// LDAPS settings.
///
/// With `enabled` off every other field is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Check the server certificate chain and hostname.
    pub verify_certificate: bool,
    /// Extra trust anchor (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_path: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            verify_certificate: true,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
        }
    }
}

impl TlsConfig {
    /// LDAPS with verification on and no extra material.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn without_verification(mut self) -> Self {
        self.verify_certificate = false;
        self
    }

    #[must_use]
    pub fn with_ca_cert(mut self, path: impl Into<String>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<String>,
        key_path: impl Into<String>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn is_insecure(&self) -> bool {
        self.enabled && !self.verify_certificate
    }

    pub fn client_identity(&self) -> Option<ClientIdentity<'_>> {
        match (self.client_cert_path.as_deref(), self.client_key_path.as_deref()) {
            (Some(cert_path), Some(key_path)) => Some(ClientIdentity {
                cert_path,
                key_path,
            }),
            _ => None,
        }
    }

    /// A client certificate is usable only together with its key.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(DirectoryError::invalid_configuration(
                "TLS client certificate and key must be configured together",
            ));
        }
        Ok(())
    }

    /// Emit a warning on the `security` target when verification is off.
    pub fn validate_security(&self) {
        if self.is_insecure() {
            tracing::warn!(
                target: "security",
                "TLS certificate verification is DISABLED for the directory connection"
            );
        }
    }
}
