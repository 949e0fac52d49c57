//! File-descriptor budgets and the input-connection keep-alive policy.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Default soft fd budget for each direction (input and output).
pub const DEFAULT_SOFT_LIMIT: usize = 4096;
/// Default hard fd budget for each direction.
pub const DEFAULT_HARD_LIMIT: usize = 8192;

/// Default keep-alive bounds for idle accepted connections, in seconds.
pub const DEFAULT_MAX_KEEPALIVE_S: u32 = 120;
pub const DEFAULT_MIN_KEEPALIVE_S: u32 = 10;

/// A soft/hard pair of file-descriptor limits, `soft < hard`.
///
/// The soft limit is where pressure relief starts (cache purging, shrinking
/// keep-alive); the hard limit is where new work is refused.
#[derive(Debug, Clone, Copy)]
pub struct FdLimits {
    pub soft: usize,
    pub hard: usize,
}

impl FdLimits {
    /// How far `value` exceeds `limit` (zero when it does not).
    pub fn exceed(value: usize, limit: usize) -> usize {
        value.saturating_sub(limit)
    }

    /// The width of the soft-to-hard band.
    pub fn delta(&self) -> usize {
        self.hard - self.soft
    }
}

impl Default for FdLimits {
    fn default() -> Self {
        FdLimits {
            soft: DEFAULT_SOFT_LIMIT,
            hard: DEFAULT_HARD_LIMIT,
        }
    }
}

// Limits are stored as two atomics so the hot paths (accept, release) never
// take a lock. Writers keep `soft < hard` by going through `set_limits`.
#[derive(Debug)]
pub(crate) struct AtomicLimits {
    soft: AtomicUsize,
    hard: AtomicUsize,
}

impl AtomicLimits {
    pub(crate) fn new(limits: FdLimits) -> Self {
        AtomicLimits {
            soft: AtomicUsize::new(limits.soft),
            hard: AtomicUsize::new(limits.hard),
        }
    }

    pub(crate) fn get(&self) -> FdLimits {
        FdLimits {
            soft: self.soft.load(Ordering::Relaxed),
            hard: self.hard.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set(&self, soft: usize, hard: usize) {
        assert!(hard > soft, "invalid fd limits");
        self.soft.store(soft, Ordering::Relaxed);
        self.hard.store(hard, Ordering::Relaxed);
    }
}

/// Tracks live accepted sockets and adapts the idle keep-alive timeout as
/// the fd budget is consumed.
///
/// Every accepted socket increments the counter for its lifetime. Below the
/// soft limit idle connections may linger for the full maximum; past it the
/// allowance collapses linearly toward the minimum so sockets are reclaimed
/// faster under pressure.
#[derive(Debug)]
pub struct InputConns {
    counter: AtomicUsize,
    limits: AtomicLimits,
    max_keepalive_s: AtomicU32,
    min_keepalive_s: AtomicU32,
}

impl InputConns {
    pub(crate) fn new(limits: FdLimits) -> Self {
        InputConns {
            counter: AtomicUsize::new(0),
            limits: AtomicLimits::new(limits),
            max_keepalive_s: AtomicU32::new(DEFAULT_MAX_KEEPALIVE_S),
            min_keepalive_s: AtomicU32::new(DEFAULT_MIN_KEEPALIVE_S),
        }
    }

    /// Number of currently live accepted sockets.
    pub fn count(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    pub(crate) fn exceed_hard_limit(&self) -> usize {
        FdLimits::exceed(self.count(), self.limits.get().hard)
    }

    /// Current idle keep-alive allowance in seconds.
    ///
    /// `max` while `count <= soft`; past the soft limit, with `e` the excess
    /// and `d` the soft-to-hard width, returns
    /// `max(min, max * (d - e) / (d + 1))`.
    pub fn keepalive_timeout_s(&self) -> u32 {
        let limits = self.limits.get();
        let max = self.max_keepalive_s.load(Ordering::Relaxed);
        let e = FdLimits::exceed(self.count(), limits.soft);
        if e == 0 {
            return max;
        }
        let d = limits.delta();
        let left = FdLimits::exceed(d, e);
        let r = (max as usize * left / (d + 1)) as u32;
        r.max(self.min_keepalive_s.load(Ordering::Relaxed))
    }

    pub(crate) fn set_fd_limits(&self, soft: usize, hard: usize) {
        self.limits.set(soft, hard);
    }

    pub(crate) fn set_keepalive_bounds(&self, min_s: u32, max_s: u32) {
        assert!(max_s > min_s, "invalid keepalive bounds");
        self.min_keepalive_s.store(min_s, Ordering::Relaxed);
        self.max_keepalive_s.store(max_s, Ordering::Relaxed);
    }

    fn inc(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    fn dec(&self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// RAII registration of one accepted socket with [`InputConns`].
#[derive(Debug)]
pub(crate) struct InputConnGuard {
    conns: std::sync::Arc<InputConns>,
}

impl InputConnGuard {
    pub(crate) fn new(conns: std::sync::Arc<InputConns>) -> Self {
        conns.inc();
        InputConnGuard { conns }
    }
}

impl Drop for InputConnGuard {
    fn drop(&mut self) {
        self.conns.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn exceed_and_delta() {
        let limits = FdLimits { soft: 10, hard: 100 };
        assert_eq!(limits.delta(), 90);
        assert_eq!(FdLimits::exceed(5, 10), 0);
        assert_eq!(FdLimits::exceed(10, 10), 0);
        assert_eq!(FdLimits::exceed(55, 10), 45);
    }

    #[test]
    fn keepalive_full_below_soft_limit() {
        let conns = InputConns::new(FdLimits { soft: 10, hard: 100 });
        conns.set_keepalive_bounds(10, 120);
        for _ in 0..10 {
            conns.inc();
        }
        assert_eq!(conns.keepalive_timeout_s(), 120);
    }

    #[test]
    fn keepalive_shrinks_past_soft_limit() {
        let conns = InputConns::new(FdLimits { soft: 10, hard: 100 });
        conns.set_keepalive_bounds(10, 120);
        for _ in 0..55 {
            conns.inc();
        }
        // e = 45, d = 90, left = 45 -> 120 * 45 / 91
        assert_eq!(conns.keepalive_timeout_s(), 59);
    }

    #[test]
    fn keepalive_clamps_to_minimum() {
        let conns = InputConns::new(FdLimits { soft: 10, hard: 100 });
        conns.set_keepalive_bounds(10, 120);
        for _ in 0..99 {
            conns.inc();
        }
        // e = 89, left = 1 -> 120 / 91 = 1, clamped up to 10
        assert_eq!(conns.keepalive_timeout_s(), 10);
    }

    #[test]
    fn guard_tracks_lifetime() {
        let conns = Arc::new(InputConns::new(FdLimits::default()));
        let g1 = InputConnGuard::new(conns.clone());
        let g2 = InputConnGuard::new(conns.clone());
        assert_eq!(conns.count(), 2);
        drop(g1);
        assert_eq!(conns.count(), 1);
        drop(g2);
        assert_eq!(conns.count(), 0);
    }

    #[test]
    #[should_panic]
    fn rejects_inverted_limits() {
        let conns = InputConns::new(FdLimits::default());
        conns.set_fd_limits(100, 100);
    }
}
