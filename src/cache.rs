//! The output connection cache: per-host queues of idle connections with
//! soft/hard fd budgets, speculative connects, and a background purger.
//!
//! Acquire prefers a live cached connection (TLS already established, so
//! the handshake is skipped); a cache miss starts a foreground connect that
//! is hedged by a speculative background connect, and checkpoints of the
//! foreground wait re-drain the queue so whichever attempt lands first
//! wins. Release returns connections to their host's queue while the total
//! stays under the hard budget, and nudges the purger once the soft budget
//! is exceeded.

use crate::error::Error;
use crate::limits::{AtomicLimits, FdLimits};
use crate::resolver::ResolvedHost;
use crate::sched::{Executor, TaskCtx};
use crate::sock::CoopSocket;
use crate::tls::TlsClientStream;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Total budget for a foreground connect, and its first checkpoint; the
/// checkpoint interval doubles until the deadline.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const CONNECT_CHECKPOINT_START: Duration = Duration::from_millis(8);

/// Per-address budget of a speculative connect.
const SPECULATIVE_TIMEOUT: Duration = Duration::from_millis(300);

/// Purge pacing: sleep this long after every 64 evictions (caps the purge
/// rate around 6400 sockets/s).
const PURGE_SLEEP: Duration = Duration::from_millis(10);

/// Minimum purge fraction, in 256ths (1/32 of the cache).
const MIN_PURGE_FRAC_256: usize = 256 / 32;

// ============================================================================
// Pure policy arithmetic
// ============================================================================

/// Share of the cache (in 256ths) one purge pass removes.
fn purge_fraction_256(exceed_soft: usize, cached: usize) -> usize {
    ((exceed_soft << 8) / (cached + 1))
        .max(MIN_PURGE_FRAC_256)
        .min(256)
}

/// Whether a purge run would help right now. Pressure grows as the active
/// count approaches the hard limit and as the cache dwarfs the working set.
fn purge_useful(active: usize, cached: usize, delta: usize, max_host_id: usize) -> bool {
    if cached <= max_host_id.min(1024) >> 4 {
        return false;
    }
    let close_to_hard_256 = ((active + 1) << 8) / (delta + 1);
    let cache_uselessness_256 = ((cached + 1) << 8) / (active + 1);
    close_to_hard_256 + cache_uselessness_256 >= 256
}

// ============================================================================
// Pooled sockets
// ============================================================================

/// An idle pooled connection: still plain TCP (from a speculative connect)
/// or a TLS stream that has handshaken once and skips it on reuse.
pub(crate) enum PooledSocket {
    Plain(CoopSocket),
    Established(TlsClientStream),
}

impl PooledSocket {
    fn peer_closed(&self) -> bool {
        match self {
            PooledSocket::Plain(sock) => sock.peer_closed(),
            PooledSocket::Established(stream) => stream.peer_closed(),
        }
    }
}

impl std::fmt::Debug for PooledSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PooledSocket::Plain(_) => f.write_str("PooledSocket::Plain"),
            PooledSocket::Established(_) => f.write_str("PooledSocket::Established"),
        }
    }
}

/// A connection handed out by [`ConnCache::acquire`]. Registered as active
/// for its whole lifetime; goes back to the cache through
/// [`ConnCache::release`] or closes on drop.
pub(crate) struct PooledConn {
    cache: Arc<ConnCache>,
    host: Arc<ResolvedHost>,
    sock: Option<PooledSocket>,
    /// True when this connection came out of the cache (handshake already
    /// done).
    pub(crate) reused: bool,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("sock", &self.sock)
            .field("reused", &self.reused)
            .finish()
    }
}

impl PooledConn {
    fn new(
        cache: Arc<ConnCache>,
        host: Arc<ResolvedHost>,
        sock: PooledSocket,
        reused: bool,
    ) -> PooledConn {
        cache.active.fetch_add(1, Ordering::Relaxed);
        PooledConn {
            cache,
            host,
            sock: Some(sock),
            reused,
        }
    }

    /// Builds the TLS engine over a plain pooled socket; a no-op when the
    /// engine is already attached.
    pub(crate) fn attach_engine(
        &mut self,
        build: impl FnOnce(CoopSocket) -> Result<TlsClientStream, Error>,
    ) -> Result<(), Error> {
        if let Some(PooledSocket::Plain(_)) = &self.sock {
            if let Some(PooledSocket::Plain(raw)) = self.sock.take() {
                self.sock = Some(PooledSocket::Established(build(raw)?));
            }
        }
        Ok(())
    }

    pub(crate) fn engine_mut(&mut self) -> Option<&mut TlsClientStream> {
        match self.sock.as_mut() {
            Some(PooledSocket::Established(stream)) => Some(stream),
            _ => None,
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.cache.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// ============================================================================
// The cache
// ============================================================================

struct HostQueue {
    tx: Sender<PooledSocket>,
    rx: Receiver<PooledSocket>,
}

impl HostQueue {
    fn new() -> HostQueue {
        let (tx, rx) = unbounded();
        HostQueue { tx, rx }
    }
}

pub(crate) struct ConnCache {
    // Backref so &self methods can mint owning handles for jobs and
    // connections.
    self_ref: Weak<ConnCache>,
    limits: AtomicLimits,
    active: AtomicUsize,
    cached: AtomicUsize,
    queues: RwLock<Vec<HostQueue>>,
    max_host_id: AtomicUsize,
    purging: AtomicBool,
    purge_pending: Mutex<bool>,
    purge_cv: Condvar,
    shutdown: AtomicBool,
    purger: Mutex<Option<JoinHandle<()>>>,
    connectors: Executor,
}

impl std::fmt::Debug for ConnCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (active, cached) = self.stats();
        f.debug_struct("ConnCache")
            .field("active", &active)
            .field("cached", &cached)
            .finish()
    }
}

impl ConnCache {
    pub(crate) fn new(limits: FdLimits) -> Arc<ConnCache> {
        let cache = Arc::new_cyclic(|self_ref| ConnCache {
            self_ref: self_ref.clone(),
            limits: AtomicLimits::new(limits),
            active: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
            queues: RwLock::new(Vec::new()),
            max_host_id: AtomicUsize::new(0),
            purging: AtomicBool::new(false),
            purge_pending: Mutex::new(false),
            purge_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            purger: Mutex::new(None),
            connectors: Executor::new("https-con-dispatch", "https-con"),
        });

        let worker = {
            let cache = cache.clone();
            std::thread::Builder::new()
                .name("https-purge".to_string())
                .spawn(move || cache.purge_loop())
                .expect("failed to spawn purge thread")
        };
        *cache.purger.lock().unwrap() = Some(worker);

        cache
    }

    fn arc(&self) -> Arc<ConnCache> {
        self.self_ref.upgrade().expect("connection cache dropped")
    }

    /// Stops the purger and the connector executor. Called by the owning
    /// service; the purge thread keeps the cache alive until it exits.
    pub(crate) fn shutdown(&self) {
        {
            let _pending = self.purge_pending.lock().unwrap();
            self.shutdown.store(true, Ordering::Relaxed);
            self.purge_cv.notify_one();
        }
        if let Some(worker) = self.purger.lock().unwrap().take() {
            let _ = worker.join();
        }
    }

    /// `(active, cached)` connection counts.
    pub(crate) fn stats(&self) -> (usize, usize) {
        (
            self.active.load(Ordering::Relaxed),
            self.cached.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_fd_limits(&self, soft: usize, hard: usize) {
        self.limits.set(soft, hard);
    }

    fn total(&self) -> usize {
        self.active.load(Ordering::Relaxed) + self.cached.load(Ordering::Relaxed)
    }

    fn exceed_soft_limit(&self) -> usize {
        FdLimits::exceed(self.total(), self.limits.get().soft)
    }

    fn exceed_hard_limit(&self) -> usize {
        FdLimits::exceed(self.total(), self.limits.get().hard)
    }

    // ============================================================================
    // Acquire / release
    // ============================================================================

    /// Hands out a connection to `host`: a live cached one when available,
    /// otherwise a fresh connect hedged by a speculative background
    /// attempt.
    pub(crate) fn acquire(
        &self,
        task: &TaskCtx,
        host: &Arc<ResolvedHost>,
        msg_addr: &str,
    ) -> Result<PooledConn, Error> {
        if self.exceed_hard_limit() > 0 {
            return Err(Error::OutputLimit);
        }

        while let Some(sock) = self.dequeue(host.id) {
            if sock.peer_closed() {
                continue;
            }
            if self.queue_len(host.id) == 0 {
                // Cache for this host just ran dry; start filling a
                // replacement before the next caller misses.
                self.schedule_fresh_connector(host.clone());
            }
            trace!(host = %host.host, "reusing cached connection");
            return Ok(PooledConn::new(self.arc(), host.clone(), sock, true));
        }

        // Hedge the foreground connect below.
        self.schedule_fresh_connector(host.clone());

        let addr = host.addrs[0];
        let connect_failed = |err: io::Error| {
            debug!(%addr, %err, "connect failed");
            Error::Connect {
                addr: msg_addr.to_string(),
            }
        };

        let started = Instant::now();
        let deadline = started + CONNECT_DEADLINE;
        let mut delay = CONNECT_CHECKPOINT_START;
        let mut checkpoint = (started + delay).min(deadline);
        let mut sock = CoopSocket::start_connect(addr).map_err(connect_failed)?;

        loop {
            if task.cancelled() {
                return Err(Error::Cancelled);
            }

            let now = Instant::now();
            let ready = now < checkpoint
                && sock
                    .wait_writable(Some(checkpoint - now))
                    .map_err(connect_failed)?;

            if ready {
                match sock.connect_finished() {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue
                    }
                    Err(err) => return Err(connect_failed(err)),
                }
            }

            // Checkpoint reached without progress.
            if checkpoint >= deadline {
                return Err(Error::Connect {
                    addr: msg_addr.to_string(),
                });
            }
            delay += delay;
            checkpoint = (started + delay).min(deadline);

            // A speculative connect may have landed meanwhile; adopt it and
            // let a background job see the half-open socket through.
            if let Some(cached) = self.dequeue(host.id) {
                if !cached.peer_closed() {
                    self.schedule_continue_connector(host.clone(), sock);
                    trace!(host = %host.host, "adopted cached connection mid-connect");
                    return Ok(PooledConn::new(self.arc(), host.clone(), cached, true));
                }
            }
        }

        if let Err(err) = sock.set_nodelay(true) {
            warn!(%addr, %err, "failed to set nodelay");
        }
        Ok(PooledConn::new(
            self.arc(),
            host.clone(),
            PooledSocket::Plain(sock),
            false,
        ))
    }

    /// Returns a connection to its host's queue, or drops it when the total
    /// is past the hard budget. Nudges the purger once the cache holds
    /// connections past the soft budget.
    pub(crate) fn release(&self, mut conn: PooledConn) {
        if self.exceed_hard_limit() == 0 {
            self.max_host_id.fetch_max(conn.host.id, Ordering::AcqRel);
            if let Some(sock) = conn.sock.take() {
                self.cached.fetch_add(1, Ordering::Relaxed);
                self.enqueue(conn.host.id, sock);
            }
        }
        drop(conn);

        if self.cached.load(Ordering::Relaxed) > 0 && self.exceed_soft_limit() > 0 {
            self.suggest_purge();
        }
    }

    // ============================================================================
    // Queues
    // ============================================================================

    fn with_queue<R>(&self, id: usize, f: impl FnOnce(&HostQueue) -> R) -> R {
        {
            let queues = self.queues.read().unwrap();
            if let Some(queue) = queues.get(id) {
                return f(queue);
            }
        }
        let mut queues = self.queues.write().unwrap();
        while queues.len() <= id {
            queues.push(HostQueue::new());
        }
        f(&queues[id])
    }

    fn queue_len(&self, id: usize) -> usize {
        self.with_queue(id, |q| q.rx.len())
    }

    // Raw queue ops do not touch counters; callers account explicitly.
    fn queue_pop(&self, id: usize) -> Option<PooledSocket> {
        self.with_queue(id, |q| q.rx.try_recv().ok())
    }

    fn queue_push(&self, id: usize, sock: PooledSocket) {
        self.with_queue(id, |q| {
            let _ = q.tx.send(sock);
        });
    }

    fn dequeue(&self, id: usize) -> Option<PooledSocket> {
        let sock = self.queue_pop(id)?;
        self.cached.fetch_sub(1, Ordering::Relaxed);
        Some(sock)
    }

    fn enqueue(&self, id: usize, sock: PooledSocket) {
        self.queue_push(id, sock);
    }

    // ============================================================================
    // Speculative connectors
    // ============================================================================

    fn schedule_fresh_connector(&self, host: Arc<ResolvedHost>) {
        let cache = self.arc();
        self.connectors.enqueue(move |task| {
            cache.run_fresh_connector(task, host);
        });
    }

    fn schedule_continue_connector(&self, host: Arc<ResolvedHost>, sock: CoopSocket) {
        let cache = self.arc();
        self.connectors.enqueue(move |task| {
            cache.run_continue_connector(task, host, sock);
        });
    }

    // Best-effort cache fill: every failure is swallowed.
    fn run_fresh_connector(&self, task: &TaskCtx, host: Arc<ResolvedHost>) {
        for &addr in &host.addrs {
            if task.cancelled() {
                return;
            }
            match connect_with_timeout(addr, SPECULATIVE_TIMEOUT) {
                Ok(Some(sock)) => {
                    let _ = sock.set_nodelay(true);
                    trace!(host = %host.host, %addr, "speculative connect ready");
                    self.release(PooledConn::new(
                        self.arc(),
                        host.clone(),
                        PooledSocket::Plain(sock),
                        false,
                    ));
                    return;
                }
                Ok(None) => continue,
                Err(err) => {
                    trace!(host = %host.host, %addr, %err, "speculative connect failed");
                    continue;
                }
            }
        }
    }

    fn run_continue_connector(
        &self,
        task: &TaskCtx,
        host: Arc<ResolvedHost>,
        mut sock: CoopSocket,
    ) {
        if task.cancelled() {
            return;
        }
        let finished = sock
            .wait_writable(Some(SPECULATIVE_TIMEOUT))
            .unwrap_or(false)
            && sock.connect_finished().unwrap_or(false);
        if finished {
            let _ = sock.set_nodelay(true);
            trace!(host = %host.host, "half-open connect completed");
            self.release(PooledConn::new(
                self.arc(),
                host,
                PooledSocket::Plain(sock),
                false,
            ));
        }
    }

    // ============================================================================
    // Purging
    // ============================================================================

    fn suggest_purge(&self) {
        if self
            .purging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let useful = purge_useful(
            self.active.load(Ordering::Relaxed),
            self.cached.load(Ordering::Relaxed),
            self.limits.get().delta(),
            self.max_host_id.load(Ordering::Relaxed),
        );
        if useful {
            let mut pending = self.purge_pending.lock().unwrap();
            *pending = true;
            self.purge_cv.notify_one();
            // The purge thread clears `purging` when the run completes.
            return;
        }
        self.purging.store(false, Ordering::Release);
    }

    fn purge_loop(&self) {
        loop {
            {
                let mut pending = self.purge_pending.lock().unwrap();
                while !*pending && !self.shutdown.load(Ordering::Relaxed) {
                    pending = self.purge_cv.wait(pending).unwrap();
                }
                if self.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                *pending = false;
            }

            self.purge_cache();
            self.purging.store(false, Ordering::Release);
        }
    }

    fn purge_cache(&self) {
        let cached = self.cached.load(Ordering::Relaxed);
        let frac256 = purge_fraction_256(self.exceed_soft_limit(), cached);
        debug!(cached, frac256, "purging connection cache");

        let mut processed: u64 = 0;
        let max_id = self.max_host_id.load(Ordering::Acquire);
        for id in 0..max_id {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let qsize = self.queue_len(id);
            if qsize == 0 {
                continue;
            }

            let mut purge_count = (qsize * frac256) >> 8;
            if purge_count == 0 {
                if qsize <= 2 {
                    // Small queue: instead of evicting, weed out a dead entry.
                    if let Some(sock) = self.queue_pop(id) {
                        if sock.peer_closed() {
                            self.cached.fetch_sub(1, Ordering::Relaxed);
                            self.purge_tick(&mut processed);
                        } else {
                            self.queue_push(id, sock);
                        }
                    }
                    continue;
                }
                purge_count = 1;
            }

            while purge_count > 0 {
                match self.queue_pop(id) {
                    Some(sock) => {
                        drop(sock);
                        self.cached.fetch_sub(1, Ordering::Relaxed);
                        self.purge_tick(&mut processed);
                    }
                    None => break,
                }
                purge_count -= 1;
            }
        }
    }

    fn purge_tick(&self, processed: &mut u64) {
        if (*processed & 0x3f) == 0 {
            std::thread::sleep(PURGE_SLEEP);
        }
        *processed += 1;
    }
}

fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<Option<CoopSocket>> {
    let mut sock = CoopSocket::start_connect(addr)?;
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        if !sock.wait_writable(Some(deadline - now))? {
            return Ok(None);
        }
        match sock.connect_finished() {
            Ok(true) => return Ok(Some(sock)),
            Ok(false) => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn purge_fraction_has_floor_and_ceiling() {
        // No soft excess: floor of 1/32.
        assert_eq!(purge_fraction_256(0, 100), MIN_PURGE_FRAC_256);
        // Excess dwarfing the cache: capped at the whole cache.
        assert_eq!(purge_fraction_256(10_000, 10), 256);
        // Half the cache over the soft limit: about half in 256ths.
        assert_eq!(purge_fraction_256(50, 99), 128);
    }

    #[test]
    fn purge_gating_tracks_pressure() {
        // Tiny cache: never worth a run.
        assert!(!purge_useful(10, 1, 100, 2048));
        // Cache dwarfs the working set.
        assert!(purge_useful(1, 200, 1000, 2048));
        // Close to the hard limit.
        assert!(purge_useful(990, 200, 1000, 2048));
        // Mid-band, cache smaller than the working set: leave it alone.
        assert!(!purge_useful(400, 150, 1000, 2048));
    }

    #[test]
    fn acquire_refuses_past_hard_limit() {
        let cache = ConnCache::new(FdLimits { soft: 0, hard: 1 });
        let host = Arc::new(ResolvedHost {
            host: "localhost".to_string(),
            port: 1,
            addrs: vec!["127.0.0.1:1".parse().unwrap()],
            id: 0,
        });
        // Two synthetic holders push the total past the hard limit.
        cache.active.fetch_add(2, Ordering::Relaxed);
        let task = TaskCtx::detached();
        let err = cache.acquire(&task, &host, "https://localhost:1/x").unwrap_err();
        assert!(matches!(err, Error::OutputLimit));
        cache.shutdown();
    }

    #[test]
    fn acquire_connects_and_release_caches() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let accepter = std::thread::spawn(move || {
            // Accept both the foreground and the speculative connect, and
            // keep them open until the test is done.
            let a = listener.accept().unwrap().0;
            let b = listener.accept().ok().map(|(s, _)| s);
            let _ = stop_rx.recv();
            drop((a, b));
        });

        let cache = ConnCache::new(FdLimits::default());
        let host = Arc::new(ResolvedHost {
            host: "localhost".to_string(),
            port: addr.port(),
            addrs: vec![addr],
            id: 0,
        });
        let task = TaskCtx::detached();

        let conn = cache
            .acquire(&task, &host, "https://localhost/x")
            .expect("loopback connect");
        assert_eq!(cache.active.load(Ordering::Relaxed), 1);

        cache.release(conn);
        // Let the speculative connector settle before reading the counters.
        std::thread::sleep(Duration::from_millis(500));
        let (active, cached) = cache.stats();
        assert_eq!(active, 0);
        assert!(cached >= 1);

        let conn = cache
            .acquire(&task, &host, "https://localhost/x")
            .expect("cached connection");
        assert!(conn.reused);
        drop(conn);
        drop(stop_tx);
        accepter.join().unwrap();
        cache.shutdown();
    }
}
