//! Process-wide client/server options.
//!
//! Options are constructed once and handed to [`HttpsService::new`]; nothing
//! in the crate reads ambient global state. String-keyed setting via
//! [`Options::set`] mirrors the generic set-option surface of the enclosing
//! protocol registry; [`Options::from_config`] reads the same settings from
//! a [`config::Config`].
//!
//! [`HttpsService::new`]: crate::HttpsService::new

use crate::error::Error;
use crate::location::Location;
use config::Config;
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::sync::Arc;

/// Client peer-certificate verification callback.
///
/// Receives the chain-verification verdict (`preverified`) and the peer's
/// end-entity certificate; its return value decides whether the handshake
/// proceeds. When no callback is installed, peer verification is disabled.
pub type VerifyCallback = Arc<dyn Fn(bool, &CertificateDer<'_>) -> bool + Send + Sync>;

/// Context handed to [`Options::key_passwd_callback`] when a server private
/// key needs a passphrase.
#[derive(Debug, Clone)]
pub struct PasswordRequest {
    pub location: Location,
    pub cert_path: String,
    pub key_path: String,
}

/// Server private-key passphrase callback.
pub type PasswordCallback = Arc<dyn Fn(&PasswordRequest) -> String + Send + Sync>;

/// HTTPS configuration: trust anchors, client identity, debug switches,
/// verification callbacks.
#[derive(Default, Clone)]
pub struct Options {
    /// Trusted CA bundle file for the client.
    pub ca_file: Option<String>,
    /// Trusted CA directory for the client (every `.pem` file is loaded).
    pub ca_path: Option<String>,
    /// Client certificate chain, PEM.
    pub client_certificate: Option<String>,
    /// Client private key, PEM.
    pub client_private_key: Option<String>,
    /// Passphrase for the client private key.
    pub client_private_key_password: Option<String>,
    /// Log server-side handshake progress at debug level.
    pub enable_ssl_server_debug: bool,
    /// Log client-side handshake progress at debug level.
    pub enable_ssl_client_debug: bool,
    /// Enforce SAN/CN match against the requested host after the client
    /// handshake.
    pub check_certificate_hostname: bool,
    /// Custom peer-verify callback; absent means verification is disabled.
    pub client_verify_callback: Option<VerifyCallback>,
    /// Callback consulted for the server private-key passphrase.
    pub key_passwd_callback: Option<PasswordCallback>,
}

impl Options {
    /// Sets an option by its string key.
    ///
    /// Returns `Ok(true)` when the key is recognized, `Ok(false)` when it is
    /// not (so callers can chain registries), and an error when the value
    /// does not parse as the option's type.
    pub fn set(&mut self, name: &str, value: &str) -> Result<bool, Error> {
        match name {
            "CAFile" => self.ca_file = Some(value.to_string()),
            "CAPath" => self.ca_path = Some(value.to_string()),
            "ClientCertificate" => self.client_certificate = Some(value.to_string()),
            "ClientPrivateKey" => self.client_private_key = Some(value.to_string()),
            "ClientPrivateKeyPassword" => {
                self.client_private_key_password = Some(value.to_string())
            }
            "EnableSslServerDebug" => self.enable_ssl_server_debug = parse_bool(name, value)?,
            "EnableSslClientDebug" => self.enable_ssl_client_debug = parse_bool(name, value)?,
            "CheckCertificateHostname" => {
                self.check_certificate_hostname = parse_bool(name, value)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Reads the option table from a [`Config`].
    ///
    /// Recognized keys are the snake-case forms: `ca_file`, `ca_path`,
    /// `client_certificate`, `client_private_key`,
    /// `client_private_key_password`, `enable_ssl_server_debug`,
    /// `enable_ssl_client_debug`, `check_certificate_hostname`. Absent keys
    /// keep their defaults.
    pub fn from_config(config: &Config) -> Result<Options, Error> {
        let mut options = Options::default();

        for (key, slot) in [
            ("ca_file", &mut options.ca_file),
            ("ca_path", &mut options.ca_path),
            ("client_certificate", &mut options.client_certificate),
            ("client_private_key", &mut options.client_private_key),
            (
                "client_private_key_password",
                &mut options.client_private_key_password,
            ),
        ] {
            match config.get_string(key) {
                Ok(value) => *slot = Some(value),
                Err(config::ConfigError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        for (key, slot) in [
            ("enable_ssl_server_debug", &mut options.enable_ssl_server_debug),
            ("enable_ssl_client_debug", &mut options.enable_ssl_client_debug),
            (
                "check_certificate_hostname",
                &mut options.check_certificate_hostname,
            ),
        ] {
            match config.get_bool(key) {
                Ok(value) => *slot = value,
                Err(config::ConfigError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(options)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value {
        "1" | "yes" | "true" => Ok(true),
        "0" | "no" | "false" => Ok(false),
        _ => Err(Error::InvalidOptionValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("ca_file", &self.ca_file)
            .field("ca_path", &self.ca_path)
            .field("client_certificate", &self.client_certificate)
            .field("client_private_key", &self.client_private_key)
            .field(
                "client_private_key_password",
                &self.client_private_key_password.as_ref().map(|_| "<set>"),
            )
            .field("enable_ssl_server_debug", &self.enable_ssl_server_debug)
            .field("enable_ssl_client_debug", &self.enable_ssl_client_debug)
            .field("check_certificate_hostname", &self.check_certificate_hostname)
            .field(
                "client_verify_callback",
                &self.client_verify_callback.as_ref().map(|_| "<fn>"),
            )
            .field(
                "key_passwd_callback",
                &self.key_passwd_callback.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_recognizes_option_table() {
        let mut options = Options::default();
        assert!(options.set("CAFile", "/etc/ssl/ca.pem").unwrap());
        assert!(options.set("CheckCertificateHostname", "1").unwrap());
        assert!(options.set("EnableSslClientDebug", "true").unwrap());
        assert_eq!(options.ca_file.as_deref(), Some("/etc/ssl/ca.pem"));
        assert!(options.check_certificate_hostname);
        assert!(options.enable_ssl_client_debug);
    }

    #[test]
    fn set_reports_unknown_keys() {
        let mut options = Options::default();
        assert!(!options.set("NoSuchOption", "x").unwrap());
    }

    #[test]
    fn set_rejects_bad_bool() {
        let mut options = Options::default();
        assert!(options.set("CheckCertificateHostname", "maybe").is_err());
    }

    #[test]
    fn from_config_reads_snake_case_keys() {
        let config = Config::builder()
            .set_default("ca_file", "/tmp/ca.pem")
            .unwrap()
            .set_default("check_certificate_hostname", true)
            .unwrap()
            .build()
            .unwrap();
        let options = Options::from_config(&config).unwrap();
        assert_eq!(options.ca_file.as_deref(), Some("/tmp/ca.pem"));
        assert!(options.check_certificate_hostname);
        assert!(options.client_certificate.is_none());
    }
}
