//! Parsing of `scheme://user-info@host:port/service` location strings.
//!
//! The user-info field is not credentials: it carries semicolon-separated
//! `key=value` pairs, of which `cert` and `key` (PEM file paths) are
//! recognized. A generic URL parser would percent-decode that field, so
//! locations are split by hand.

use crate::error::Error;

/// A parsed request or listener location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub scheme: String,
    /// Raw user-info field (empty when absent).
    pub user_info: String,
    pub host: String,
    pub port: u16,
    /// Path and query after the authority, without the leading `/`.
    pub service: String,
}

/// Per-location TLS identity carried in user-info (`cert=…;key=…`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIdentity {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl Location {
    /// Parses a location string. The port may be omitted; HTTPS default 443
    /// applies.
    pub fn parse(location: &str) -> Result<Location, Error> {
        let bad = |reason| Error::InvalidLocation {
            location: location.to_string(),
            reason,
        };

        let (scheme, rest) = location
            .split_once("://")
            .ok_or_else(|| bad("missing scheme separator"))?;
        if scheme.is_empty() {
            return Err(bad("empty scheme"));
        }

        let (authority, service) = match rest.split_once('/') {
            Some((a, s)) => (a, s),
            None => (rest, ""),
        };

        let (user_info, host_port) = match authority.rsplit_once('@') {
            Some((u, hp)) => (u, hp),
            None => ("", authority),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p.parse().map_err(|_| bad("invalid port"))?;
                (h, port)
            }
            None => (host_port, 443),
        };
        if host.is_empty() {
            return Err(bad("empty host"));
        }

        Ok(Location {
            scheme: scheme.to_string(),
            user_info: user_info.to_string(),
            host: host.to_string(),
            port,
            service: service.to_string(),
        })
    }

    /// Extracts the `cert=`/`key=` pairs from user-info. Unknown keys are
    /// ignored.
    pub fn user_identity(&self) -> UserIdentity {
        let mut identity = UserIdentity::default();
        for pair in self.user_info.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                match name {
                    "cert" => identity.cert_path = Some(value.to_string()),
                    "key" => identity.key_path = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_location() {
        let loc = Location::parse("https://example.com:8443/stat/get?x=1").unwrap();
        assert_eq!(loc.scheme, "https");
        assert_eq!(loc.user_info, "");
        assert_eq!(loc.host, "example.com");
        assert_eq!(loc.port, 8443);
        assert_eq!(loc.service, "stat/get?x=1");
    }

    #[test]
    fn defaults_port_and_service() {
        let loc = Location::parse("posts://example.com").unwrap();
        assert_eq!(loc.port, 443);
        assert_eq!(loc.service, "");
    }

    #[test]
    fn extracts_user_identity() {
        let loc =
            Location::parse("fulls://cert=/tmp/c.pem;key=/tmp/k.pem;other=1@localhost:7443/svc")
                .unwrap();
        assert_eq!(loc.host, "localhost");
        let id = loc.user_identity();
        assert_eq!(id.cert_path.as_deref(), Some("/tmp/c.pem"));
        assert_eq!(id.key_path.as_deref(), Some("/tmp/k.pem"));
    }

    #[test]
    fn empty_user_info_yields_no_identity() {
        let loc = Location::parse("https://localhost:1/x").unwrap();
        assert_eq!(loc.user_identity(), UserIdentity::default());
    }

    #[test]
    fn rejects_malformed_locations() {
        assert!(Location::parse("example.com/x").is_err());
        assert!(Location::parse("https://").is_err());
        assert!(Location::parse("https://host:notaport/x").is_err());
    }
}
