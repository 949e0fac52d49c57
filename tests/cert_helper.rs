use std::io::Write;
use tempfile::NamedTempFile;

/// Guard holding a temporary certificate/key pair; the files auto-delete
/// on drop.
pub struct TlsCertGuard {
    cert_file: NamedTempFile,
    key_file: NamedTempFile,
}

impl TlsCertGuard {
    pub fn cert_path(&self) -> &str {
        self.cert_file.path().to_str().unwrap()
    }

    pub fn key_path(&self) -> &str {
        self.key_file.path().to_str().unwrap()
    }

    /// A server location string for this identity, binding `port` (0 for a
    /// dynamic port).
    pub fn server_location(&self, port: u16) -> String {
        format!(
            "https://cert={};key={}@localhost:{}/",
            self.cert_path(),
            self.key_path(),
            port
        )
    }
}

/// Generates a self-signed certificate for the given subject-alt-names and
/// writes it to temporary PEM files.
pub fn generate_test_cert(subject_alt_names: &[&str]) -> TlsCertGuard {
    let certified_key = rcgen::generate_simple_self_signed(
        subject_alt_names
            .iter()
            .map(|name| name.to_string())
            .collect::<Vec<_>>(),
    )
    .unwrap();
    let cert_pem = certified_key.cert.pem();
    let key_pem = certified_key.key_pair.serialize_pem();

    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    cert_file.write_all(cert_pem.as_bytes()).unwrap();
    key_file.write_all(key_pem.as_bytes()).unwrap();
    cert_file.flush().unwrap();
    key_file.flush().unwrap();

    TlsCertGuard {
        cert_file,
        key_file,
    }
}
