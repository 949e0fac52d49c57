//! The cooperative byte-stream bridge the TLS engine drives.
//!
//! A [`CoopSocket`] is one non-blocking socket plus its own poller. Callers
//! (the TLS streams, the connection cache) issue exactly one syscall at a
//! time and park in bounded waits on `WouldBlock`; no wait ever blocks
//! longer than a poll slice, so jobs observe cancellation and executor
//! shutdown promptly.
//!
//! Reads with an attached cancellation flag poll with a growing timeout
//! (10 ms, ×1.5 per iteration, capped at 1 s) and re-check the flag between
//! polls, surfacing a tagged `Cancelled` outcome instead of an error-code
//! sentinel.

use crate::sched::TaskCtx;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

const SOCKET_TOKEN: Token = Token(0);

/// Poll slice for waits that have no deadline of their own; bounds how long
/// shutdown can go unnoticed.
const WAIT_SLICE: Duration = Duration::from_millis(500);

/// Cancellable-read backoff: start, growth is ×1.5, cap.
const CANCEL_POLL_START: Duration = Duration::from_millis(10);
const CANCEL_POLL_CAP: Duration = Duration::from_secs(1);

/// Outcome of a wait that honours a cancellation flag.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Ready,
    Cancelled,
}

pub(crate) struct CoopSocket {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    cancel: Option<Arc<AtomicBool>>,
    // Sticky readiness observed while waiting for the other direction.
    readable_hint: bool,
    writable_hint: bool,
    // Persists across reads; grows toward the cap while a request idles.
    cancel_backoff: Duration,
}

impl std::fmt::Debug for CoopSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoopSocket")
            .field("peer", &self.stream.peer_addr().ok())
            .field("cancelable", &self.cancel.is_some())
            .finish()
    }
}

impl CoopSocket {
    /// Wraps an already established (accepted) stream.
    pub(crate) fn from_stream(stream: TcpStream) -> io::Result<CoopSocket> {
        Self::register(stream)
    }

    /// Starts a non-blocking connect. The caller drives completion through
    /// [`wait_writable`](Self::wait_writable) and
    /// [`connect_finished`](Self::connect_finished).
    pub(crate) fn start_connect(addr: SocketAddr) -> io::Result<CoopSocket> {
        Self::register(TcpStream::connect(addr)?)
    }

    fn register(mut stream: TcpStream) -> io::Result<CoopSocket> {
        let poll = Poll::new()?;
        poll.registry().register(
            &mut stream,
            SOCKET_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(CoopSocket {
            stream,
            poll,
            events: Events::with_capacity(8),
            cancel: None,
            readable_hint: false,
            writable_hint: false,
            cancel_backoff: CANCEL_POLL_START,
        })
    }

    /// Attaches (or re-points) the cancellation flag consulted by reads.
    pub(crate) fn set_cancel_flag(&mut self, cancel: Option<Arc<AtomicBool>>) {
        self.cancel = cancel;
    }

    pub(crate) fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// The raw stream, for TLS record I/O (`read_tls`/`write_tls` issue one
    /// syscall per call and report `WouldBlock` like any non-blocking read).
    pub(crate) fn io(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// True when a connect started with [`start_connect`](Self::start_connect)
    /// has completed. An error means the connect failed.
    pub(crate) fn connect_finished(&mut self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// True when the peer has closed its side (zero-length peek).
    pub(crate) fn peer_closed(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }

    // ============================================================================
    // Waiting
    // ============================================================================

    /// Waits until the socket is readable or `timeout` elapses. `None`
    /// waits without a deadline but still polls in bounded slices.
    pub(crate) fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.wait_for(true, timeout)
    }

    /// Waits until the socket is writable or `timeout` elapses.
    pub(crate) fn wait_writable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.wait_for(false, timeout)
    }

    /// Waits for readability while honouring the attached cancellation flag
    /// and the executor shutdown flag.
    ///
    /// With a flag attached, polls with the growing backoff and re-checks
    /// the flag between polls. Without one, waits in plain slices. Executor
    /// shutdown reads as cancellation either way.
    pub(crate) fn wait_readable_cancellable(
        &mut self,
        task: &TaskCtx,
    ) -> io::Result<WaitOutcome> {
        loop {
            if task.cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }
            let slice = match &self.cancel {
                Some(flag) => {
                    if flag.load(Ordering::Relaxed) {
                        trace!("read canceled by handle");
                        return Ok(WaitOutcome::Cancelled);
                    }
                    let slice = self.cancel_backoff;
                    self.cancel_backoff =
                        (self.cancel_backoff + self.cancel_backoff / 2).min(CANCEL_POLL_CAP);
                    slice
                }
                None => WAIT_SLICE,
            };
            if self.wait_for(true, Some(slice))? {
                return Ok(WaitOutcome::Ready);
            }
        }
    }

    /// Waits for writability in shutdown-aware slices.
    pub(crate) fn wait_writable_cancellable(
        &mut self,
        task: &TaskCtx,
    ) -> io::Result<WaitOutcome> {
        loop {
            if task.cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }
            if self.wait_for(false, Some(WAIT_SLICE))? {
                return Ok(WaitOutcome::Ready);
            }
        }
    }

    fn wait_for(&mut self, readable: bool, timeout: Option<Duration>) -> io::Result<bool> {
        if self.take_hint(readable) {
            return Ok(true);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match self.poll.poll(&mut self.events, slice) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            for event in self.events.iter() {
                if event.is_readable() {
                    self.readable_hint = true;
                }
                if event.is_writable() {
                    self.writable_hint = true;
                }
            }
            if self.take_hint(readable) {
                return Ok(true);
            }
            if deadline.is_none() && self.events.is_empty() {
                // Spurious wakeup without a deadline; keep waiting.
                continue;
            }
        }
    }

    fn take_hint(&mut self, readable: bool) -> bool {
        let hint = if readable {
            &mut self.readable_hint
        } else {
            &mut self.writable_hint
        };
        std::mem::replace(hint, false)
    }

    // ============================================================================
    // Send-queue draining
    // ============================================================================

    /// Blocks the calling job until the kernel send buffer is empty, so the
    /// request has left the machine before the response read starts.
    ///
    /// Gives up early when the peer already has data for us, or on
    /// cancellation. No-op on platforms without the send-queue ioctl.
    #[cfg(target_os = "linux")]
    pub(crate) fn wait_until_drained(&mut self, task: &TaskCtx) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        let fd = self.stream.as_raw_fd();
        let mut timeout = Duration::from_millis(10);
        loop {
            let mut pending: libc::c_int = 0;
            let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut pending) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            if pending == 0 {
                return Ok(());
            }
            if task.cancelled() || self.cancel_flag_set() {
                return Ok(());
            }
            if self.wait_readable(Some(timeout))? {
                // Data is already arriving; the request must have been seen.
                return Ok(());
            }
            timeout *= 2;
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn wait_until_drained(&mut self, _task: &TaskCtx) -> io::Result<()> {
        Ok(())
    }

    fn cancel_flag_set(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::TaskCtx;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::thread;

    fn connected_pair() -> (CoopSocket, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let mut sock = CoopSocket::start_connect(addr).unwrap();
        let peer = accept.join().unwrap();
        assert!(sock.wait_writable(Some(Duration::from_secs(5))).unwrap());
        assert!(sock.connect_finished().unwrap());
        (sock, peer)
    }

    #[test]
    fn read_sees_peer_data_and_close() {
        let (mut sock, mut peer) = connected_pair();
        peer.write_all(b"ping").unwrap();
        assert!(sock.wait_readable(Some(Duration::from_secs(5))).unwrap());
        let mut buf = [0u8; 16];
        let n = sock.io().read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        drop(peer);
        assert!(sock.wait_readable(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(sock.io().read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peer_closed_detects_shutdown() {
        let (sock, peer) = connected_pair();
        assert!(!sock.peer_closed());
        drop(peer);
        // Give the FIN a moment to land.
        thread::sleep(Duration::from_millis(100));
        assert!(sock.peer_closed());
    }

    #[test]
    fn cancellable_wait_honours_flag() {
        let (mut sock, _peer) = connected_pair();
        let flag = Arc::new(AtomicBool::new(false));
        sock.set_cancel_flag(Some(flag.clone()));
        let task = TaskCtx::detached();

        flag.store(true, Ordering::Relaxed);
        let started = Instant::now();
        assert_eq!(
            sock.wait_readable_cancellable(&task).unwrap(),
            WaitOutcome::Cancelled
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn wait_readable_times_out() {
        let (mut sock, _peer) = connected_pair();
        assert!(!sock.wait_readable(Some(Duration::from_millis(50))).unwrap());
    }
}
