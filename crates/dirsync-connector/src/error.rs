//! Errors raised by directory sessions, split into transient and permanent.

use thiserror::Error;

/// Boxed underlying cause carried by transport and TLS failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error that can occur while talking to the directory server.
///
/// "Not found" is deliberately absent: lookups return `Option` and an empty
/// result is never an error.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Transport
    /// Failed to reach the server or complete the bind.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Connection attempt timed out.
    #[error("connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout { timeout_secs: u64 },

    // Bind
    /// The server rejected the bind credentials.
    #[error("authentication failed: invalid credentials for {bind_dn}")]
    AuthenticationFailed { bind_dn: String },

    // Entries
    /// A group member reference could not be translated to a uid number.
    #[error("membership resolution failed: no user found for member reference '{reference}'")]
    MembershipResolution { reference: String },

    /// The server rejected an operation.
    #[error("{operation} rejected by directory (code {code}): {message}")]
    Protocol {
        operation: &'static str,
        code: u32,
        message: String,
    },

    /// An entry returned by the server could not be interpreted.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    // Setup
    /// Connection configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// TLS material could not be loaded or the TLS connector could not be built.
    #[error("tls setup failed: {message}")]
    Tls {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl DirectoryError {
    /// Whether repeating the same operation later may succeed.
    ///
    /// An unresolved member counts: the user may simply not exist yet.
    pub fn is_transient(&self) -> bool {
        use DirectoryError::*;
        matches!(
            self,
            ConnectionFailed { .. } | ConnectionTimeout { .. } | MembershipResolution { .. }
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Stable code for logs and status messages.
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DirectoryError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            DirectoryError::AuthenticationFailed { .. } => "AUTH_FAILED",
            DirectoryError::MembershipResolution { .. } => "MEMBERSHIP_UNRESOLVED",
            DirectoryError::Protocol { .. } => "PROTOCOL_ERROR",
            DirectoryError::InvalidData { .. } => "INVALID_DATA",
            DirectoryError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            DirectoryError::Tls { .. } => "TLS_ERROR",
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_failed_with_source(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// `operation` names the LDAP request, `code` is the server result code.
    pub fn protocol(operation: &'static str, code: u32, message: impl Into<String>) -> Self {
        DirectoryError::Protocol {
            operation,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        DirectoryError::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn tls_with_source(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::Tls {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
