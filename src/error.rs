use thiserror::Error;

/// The error type for httpscomm operations.
///
/// Request-level failures (the first group) are what a [`ResponseHandle`]
/// delivers when a scheduled request does not produce a 2xx response.
/// The remaining groups cover construction-time problems: certificate
/// loading, configuration, address parsing.
///
/// [`ResponseHandle`]: crate::ResponseHandle
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Request Failures
    // ============================================================================

    /// The request handle was cancelled, or the executor is shutting down.
    #[error("request canceled")]
    Cancelled,

    /// The output connection pool reached its hard fd limit.
    #[error("output connections limit reached")]
    OutputLimit,

    /// No address of the target host accepted a connection within the deadline.
    #[error("can not connect to {addr}")]
    Connect {
        /// The address string from the request message.
        addr: String,
    },

    /// TLS handshake, read, or write failure.
    #[error("tls failure in {context}: {detail}")]
    Tls {
        /// The operation that failed (e.g. `"handshake"`, `"CheckCertHostname"`).
        context: &'static str,
        detail: String,
    },

    /// The server answered with a status outside `200..=299`.
    #[error("request failed({first_line})")]
    Protocol {
        /// Numeric HTTP status code.
        code: u16,
        /// The raw response status line.
        first_line: String,
    },

    /// The response declared a `Content-Length` that was not fully received.
    #[error("not full content: {got} bytes from {expected}")]
    Truncated { got: usize, expected: usize },

    /// Any other failure during request execution.
    #[error("{0}")]
    Unknown(String),

    // ============================================================================
    // I/O and Networking
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A location string could not be parsed.
    #[error("invalid location '{location}': {reason}")]
    InvalidLocation {
        location: String,
        reason: &'static str,
    },

    /// Host name resolution produced no addresses.
    #[error("can not resolve '{host}'")]
    Resolve { host: String },

    // ============================================================================
    // TLS Configuration
    // ============================================================================

    /// Failed to load a certificate file from disk.
    #[error("failed to load certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load a private key file from disk.
    #[error("failed to load private key from {path}: {source}")]
    KeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or contains no certificates.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Private key file format is invalid, encrypted, or missing.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    /// A listener location carries no `cert=`/`key=` user-info pair.
    #[error("no certificate or private key is specified for server")]
    MissingServerIdentity,

    /// Failed to assemble a rustls client or server configuration.
    #[error("failed to build TLS config: {0}")]
    TlsConfigBuild(String),

    // ============================================================================
    // Configuration
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// An option value could not be parsed as the option's type.
    #[error("invalid value '{value}' for option {name}")]
    InvalidOptionValue { name: String, value: String },
}
