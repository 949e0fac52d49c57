//! TLS context construction from [`Options`] and location user-info.
//!
//! The client context is built once per service; per-request identities
//! (`cert=…;key=…` in the location user-info) derive a fresh configuration
//! sharing the same verifier. The server context is built per listener from
//! its location.

use crate::error::Error;
use crate::location::{Location, UserIdentity};
use crate::options::{Options, PasswordRequest, VerifyCallback};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::warn;

// ============================================================================
// PEM loading
// ============================================================================

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::CertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain: Vec<CertificateDer> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidCertificate(format!("failed to parse {path}: {e}")))?;
    if chain.is_empty() {
        return Err(Error::InvalidCertificate(format!(
            "no certificates found in {path}"
        )));
    }
    Ok(chain)
}

// Passphrase-protected keys cannot be decrypted by this stack; the
// passphrase surface is consulted so misconfiguration is reported precisely.
fn load_key(path: &str, passphrase: Option<&str>) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::KeyLoad {
        path: path.to_string(),
        source: e,
    })?;
    let key = private_key(&mut BufReader::new(file))
        .map_err(|e| Error::InvalidKey(format!("failed to parse {path}: {e}")))?;
    match key {
        Some(key) => Ok(key),
        None => {
            let encrypted = std::fs::read_to_string(path)
                .map(|pem| pem.contains("ENCRYPTED"))
                .unwrap_or(false);
            if encrypted {
                if passphrase.is_some() {
                    Err(Error::InvalidKey(format!(
                        "{path} is passphrase-protected; encrypted PEM keys are not supported"
                    )))
                } else {
                    Err(Error::InvalidKey(format!(
                        "{path} is encrypted and no passphrase is configured"
                    )))
                }
            } else {
                Err(Error::InvalidKey(format!("no private key found in {path}")))
            }
        }
    }
}

fn load_root_store(options: &Options) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    if let Some(ca_file) = &options.ca_file {
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        }
    }
    if let Some(ca_path) = &options.ca_path {
        let entries = std::fs::read_dir(ca_path).map_err(|e| Error::CertificateLoad {
            path: ca_path.to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            let is_pem = path
                .extension()
                .map(|ext| ext == "pem" || ext == "crt")
                .unwrap_or(false);
            if !is_pem {
                continue;
            }
            let path = path.to_string_lossy().into_owned();
            for cert in load_certs(&path)? {
                if let Err(err) = roots.add(cert) {
                    warn!(%path, %err, "skipping untrusted-store certificate");
                }
            }
        }
    }
    Ok(roots)
}

// ============================================================================
// Peer verification
// ============================================================================

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

// Verification is off unless the application installed a verify callback;
// the TLS layer still needs valid signature checking for the handshake
// transcript.
#[derive(Debug)]
struct AcceptAllVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// Chain verification runs first (against the configured trust anchors) and
// its verdict is handed to the application callback, which has the final
// word. With no trust anchors configured the verdict is always negative.
struct CallbackVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    callback: VerifyCallback,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("chain_verifier", &self.inner.is_some())
            .finish()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let preverified = match &self.inner {
            Some(inner) => inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .is_ok(),
            None => false,
        };
        if (self.callback)(preverified, end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ============================================================================
// Client context
// ============================================================================

/// The client-side TLS context: one verifier and base configuration shared
/// by every outgoing connection.
pub(crate) struct ClientCtx {
    base: Arc<ClientConfig>,
    verifier: Arc<dyn ServerCertVerifier>,
    pub(crate) check_hostname: bool,
    pub(crate) debug: bool,
}

impl std::fmt::Debug for ClientCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCtx")
            .field("check_hostname", &self.check_hostname)
            .field("debug", &self.debug)
            .finish()
    }
}

impl ClientCtx {
    pub(crate) fn new(options: &Options) -> Result<ClientCtx, Error> {
        let verifier: Arc<dyn ServerCertVerifier> = match &options.client_verify_callback {
            Some(callback) => {
                let roots = load_root_store(options)?;
                let inner = if roots.is_empty() {
                    None
                } else {
                    Some(
                        WebPkiServerVerifier::builder(Arc::new(roots))
                            .build()
                            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?,
                    )
                };
                Arc::new(CallbackVerifier {
                    inner,
                    callback: callback.clone(),
                    provider: provider(),
                })
            }
            None => Arc::new(AcceptAllVerifier {
                provider: provider(),
            }),
        };

        let client_identity = match (&options.client_certificate, &options.client_private_key) {
            (Some(cert), Some(key)) => Some(UserIdentity {
                cert_path: Some(cert.clone()),
                key_path: Some(key.clone()),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::TlsConfigBuild(
                    "both certificate and private key must be specified for client".to_string(),
                ))
            }
        };

        let base = build_client_config(
            verifier.clone(),
            client_identity.as_ref(),
            options.client_private_key_password.as_deref(),
        )?;

        Ok(ClientCtx {
            base: Arc::new(base),
            verifier,
            check_hostname: options.check_certificate_hostname,
            debug: options.enable_ssl_client_debug,
        })
    }

    /// Configuration for one connection. A location-level identity derives
    /// a fresh configuration; otherwise the shared base is used.
    pub(crate) fn config(&self, identity: &UserIdentity) -> Result<Arc<ClientConfig>, Error> {
        if identity.cert_path.is_some() || identity.key_path.is_some() {
            if identity.cert_path.is_none() || identity.key_path.is_none() {
                return Err(Error::TlsConfigBuild(
                    "location user-info must carry both cert= and key=".to_string(),
                ));
            }
            let config = build_client_config(self.verifier.clone(), Some(identity), None)?;
            return Ok(Arc::new(config));
        }
        Ok(self.base.clone())
    }
}

fn build_client_config(
    verifier: Arc<dyn ServerCertVerifier>,
    identity: Option<&UserIdentity>,
    passphrase: Option<&str>,
) -> Result<ClientConfig, Error> {
    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let mut config = match identity {
        Some(identity) => {
            let cert_path = identity.cert_path.as_deref().unwrap_or_default();
            let key_path = identity.key_path.as_deref().unwrap_or_default();
            let chain = load_certs(cert_path)?;
            let key = load_key(key_path, passphrase)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| Error::TlsConfigBuild(e.to_string()))?
        }
        None => builder.with_no_client_auth(),
    };

    // TODO: hang a session store here when resumption is implemented; today
    // every connection handshakes from scratch, matching reuse semantics
    // (pooled connections skip the handshake entirely).
    config.resumption = Resumption::disabled();

    Ok(config)
}

// ============================================================================
// Server context
// ============================================================================

/// The per-listener TLS context, bound to the listener's certificate/key.
pub(crate) struct ServerCtx {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) debug: bool,
}

impl std::fmt::Debug for ServerCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCtx").field("debug", &self.debug).finish()
    }
}

impl ServerCtx {
    pub(crate) fn new(options: &Options, location: &Location) -> Result<ServerCtx, Error> {
        let identity = location.user_identity();
        let (cert_path, key_path) = match (&identity.cert_path, &identity.key_path) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => return Err(Error::MissingServerIdentity),
        };

        let chain = load_certs(&cert_path)?;
        let passphrase = options.key_passwd_callback.as_ref().map(|callback| {
            callback(&PasswordRequest {
                location: location.clone(),
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            })
        });
        let key = load_key(&key_path, passphrase.as_deref())?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;

        Ok(ServerCtx {
            config: Arc::new(config),
            debug: options.enable_ssl_server_debug,
        })
    }
}
