//! Caching host resolution with dense per-host ids.
//!
//! The connection cache indexes its per-host queues by `ResolvedHost::id`,
//! so ids are handed out densely starting at zero and an entry, once
//! resolved, is never re-resolved for the life of the service.

use crate::error::Error;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

/// A resolved target host. Shared, immutable; the pool references it by
/// `id` and never owns it.
#[derive(Debug)]
pub struct ResolvedHost {
    pub host: String,
    pub port: u16,
    pub addrs: Vec<SocketAddr>,
    /// Dense index into per-host structures.
    pub id: usize,
}

#[derive(Debug, Default)]
pub(crate) struct HostResolver {
    cache: Mutex<HashMap<(String, u16), Arc<ResolvedHost>>>,
}

impl HostResolver {
    pub(crate) fn new() -> Self {
        HostResolver::default()
    }

    pub(crate) fn resolve(&self, host: &str, port: u16) -> Result<Arc<ResolvedHost>, Error> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(found) = cache.get(&(host.to_string(), port)) {
            return Ok(found.clone());
        }

        let mut addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::Resolve {
                host: host.to_string(),
            })?
            .collect();
        // The connect path leads with the first address; prefer IPv4 so a
        // v4-bound listener is reached on the first attempt.
        addrs.sort_by_key(|addr| addr.is_ipv6());
        if addrs.is_empty() {
            return Err(Error::Resolve {
                host: host.to_string(),
            });
        }

        let resolved = Arc::new(ResolvedHost {
            host: host.to_string(),
            port,
            addrs,
            id: cache.len(),
        });
        cache.insert((host.to_string(), port), resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_dense_ids_and_caches() {
        let resolver = HostResolver::new();
        let a = resolver.resolve("localhost", 80).unwrap();
        let b = resolver.resolve("localhost", 81).unwrap();
        let a2 = resolver.resolve("localhost", 80).unwrap();
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert_eq!(a2.id, 0);
        assert!(!a.addrs.is_empty());
    }

    #[test]
    fn reports_unresolvable_hosts() {
        let resolver = HostResolver::new();
        assert!(resolver
            .resolve("no-such-host.invalid.example-tld", 80)
            .is_err());
    }
}
