//! Peer-certificate hostname verification.
//!
//! Matching follows RFC 6125: case-insensitive comparison, wildcards only
//! as the entire left-most label (`*.example.com`; partial forms like
//! `ww*.example.com` never match). Subject-Alt-Name DNS entries are
//! consulted first; the subject Common Name is a fallback only when the
//! certificate carries no SAN extension at all.

use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, PartialEq, Eq)]
enum MatchResult {
    Found,
    NoMatch,
    NoExtension,
    Error,
}

/// True when `template` (a certificate name) covers `name` (the requested
/// host).
pub(crate) fn match_domain_name(template: &str, name: &str) -> bool {
    let (first, rest) = split_label(template);
    if first == "*" {
        let (_, name_rest) = split_label(name);
        return rest.eq_ignore_ascii_case(name_rest);
    }
    template.eq_ignore_ascii_case(name)
}

fn split_label(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((first, rest)) => (first, rest),
        None => (name, ""),
    }
}

fn match_alt_names(cert: &X509Certificate<'_>, hostname: &str) -> MatchResult {
    let san = cert.extensions().iter().find_map(|ext| {
        match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => Some(san),
            _ => None,
        }
    });
    let Some(san) = san else {
        return MatchResult::NoExtension;
    };
    for general_name in &san.general_names {
        if let GeneralName::DNSName(dns_name) = general_name {
            if match_domain_name(dns_name, hostname) {
                return MatchResult::Found;
            }
        }
    }
    MatchResult::NoMatch
}

fn match_common_name(cert: &X509Certificate<'_>, hostname: &str) -> MatchResult {
    let Some(entry) = cert.subject().iter_common_name().next() else {
        return MatchResult::Error;
    };
    let Ok(common_name) = entry.as_str() else {
        return MatchResult::Error;
    };
    if match_domain_name(common_name, hostname) {
        MatchResult::Found
    } else {
        MatchResult::NoMatch
    }
}

/// Checks a DER certificate against the requested hostname.
pub(crate) fn check_cert_hostname(cert_der: &[u8], hostname: &str) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return false;
    };
    match match_alt_names(&cert, hostname) {
        MatchResult::Found => true,
        MatchResult::NoExtension => match_common_name(&cert, hostname) == MatchResult::Found,
        _ => false,
    }
}
