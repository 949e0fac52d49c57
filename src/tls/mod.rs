//! TLS engines for the client and server paths.
//!
//! rustls supplies the record-layer state machine; all waiting lives in the
//! [`CoopSocket`] underneath. Every operation takes the running job's
//! [`TaskCtx`] as a scoped borrow — the engine owns its socket exclusively
//! and holds no reference back into the scheduler.

mod config;
pub(crate) mod hostname;

pub(crate) use config::{ClientCtx, ServerCtx};

use crate::error::Error;
use crate::location::Location;
use crate::sched::TaskCtx;
use crate::sock::{CoopSocket, WaitOutcome};
use rustls::pki_types::ServerName;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Outcome of one plaintext read.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PlainRead {
    Data(usize),
    /// Orderly end of stream (close-notify, or bare TCP EOF).
    Closed,
}

/// Outcome of waiting for request data on an idle connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PollVerdict {
    Readable,
    Timeout,
    PeerClosed,
}

enum Fill {
    Progress,
    Eof,
}

fn tls_error(context: &'static str, detail: impl ToString) -> Error {
    Error::Tls {
        context,
        detail: detail.to_string(),
    }
}

// ============================================================================
// Shared engine core
// ============================================================================

struct TlsStream {
    conn: rustls::Connection,
    sock: CoopSocket,
    debug: bool,
    handshaken: bool,
}

impl TlsStream {
    // Writes every pending TLS record out to the socket.
    fn flush_tls(&mut self, task: &TaskCtx) -> Result<(), Error> {
        while self.conn.wants_write() {
            match self.conn.write_tls(self.sock.io()) {
                Ok(0) => return Err(tls_error("write", "socket closed while writing")),
                Ok(n) => trace!(len = n, "wrote tls records"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    match self.sock.wait_writable_cancellable(task)? {
                        WaitOutcome::Ready => {}
                        WaitOutcome::Cancelled => return Err(Error::Cancelled),
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    // Reads at least one TLS record from the socket and decrypts it,
    // waiting cooperatively when the socket has nothing yet.
    fn fill(&mut self, task: &TaskCtx) -> Result<Fill, Error> {
        loop {
            match self.conn.read_tls(self.sock.io()) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    trace!(len = n, "read tls records");
                    self.conn
                        .process_new_packets()
                        .map_err(|e| tls_error("read", e))?;
                    return Ok(Fill::Progress);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    match self.sock.wait_readable_cancellable(task)? {
                        WaitOutcome::Ready => {}
                        WaitOutcome::Cancelled => return Err(Error::Cancelled),
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn handshake(&mut self, task: &TaskCtx, context: &'static str) -> Result<(), Error> {
        while self.conn.is_handshaking() {
            self.flush_tls(task)?;
            if !self.conn.is_handshaking() {
                break;
            }
            if self.debug {
                debug!(context, "handshake continues");
            }
            match self.fill(task)? {
                Fill::Progress => {}
                Fill::Eof => return Err(tls_error(context, "peer closed during handshake")),
            }
        }
        self.flush_tls(task)?;
        self.handshaken = true;
        if self.debug {
            debug!(
                context,
                version = ?self.conn.protocol_version(),
                cipher = ?self.conn.negotiated_cipher_suite(),
                "handshake complete"
            );
        }
        Ok(())
    }

    fn write_plain(&mut self, task: &TaskCtx, mut buf: &[u8]) -> Result<(), Error> {
        while !buf.is_empty() {
            let n = self
                .conn
                .writer()
                .write(buf)
                .map_err(|e| tls_error("write", e))?;
            buf = &buf[n..];
            self.flush_tls(task)?;
        }
        Ok(())
    }

    fn read_plain(&mut self, task: &TaskCtx, buf: &mut [u8]) -> Result<PlainRead, Error> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return Ok(PlainRead::Closed),
                Ok(n) => return Ok(PlainRead::Data(n)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => match self.fill(task)? {
                    Fill::Progress => {}
                    Fill::Eof => return Ok(PlainRead::Closed),
                },
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    debug!("peer closed without close-notify");
                    return Ok(PlainRead::Closed);
                }
                Err(err) => return Err(tls_error("read", err)),
            }
        }
    }

    // Waits for request data, the keep-alive wait of the server read path.
    // Before the handshake is done, any arriving bytes count as readable so
    // the read job can drive the handshake.
    fn poll_read(&mut self, task: &TaskCtx, timeout: Duration) -> Result<PollVerdict, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| tls_error("read", e))?;
            if state.plaintext_bytes_to_read() > 0 {
                return Ok(PollVerdict::Readable);
            }
            if state.peer_has_closed() {
                self.shutdown(task);
                return Ok(PollVerdict::PeerClosed);
            }

            match self.conn.read_tls(self.sock.io()) {
                Ok(0) => return Ok(PollVerdict::PeerClosed),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| tls_error("read", e))?;
                    if self.conn.is_handshaking() {
                        return Ok(PollVerdict::Readable);
                    }
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if task.cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(PollVerdict::Timeout);
                    }
                    let slice = (deadline - now).min(Duration::from_millis(500));
                    self.sock.wait_readable(Some(slice))?;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    // Orderly close: send our close-notify, then give the peer's one bounded
    // chance to arrive so the record layer winds down cleanly.
    fn shutdown(&mut self, task: &TaskCtx) {
        self.conn.send_close_notify();
        if self.flush_tls(task).is_err() {
            return;
        }
        for _ in 0..2 {
            if self
                .conn
                .process_new_packets()
                .map(|state| state.peer_has_closed())
                .unwrap_or(true)
            {
                return;
            }
            match self.sock.wait_readable(Some(Duration::from_millis(100))) {
                Ok(true) => match self.conn.read_tls(self.sock.io()) {
                    Ok(n) if n > 0 => {}
                    _ => return,
                },
                _ => return,
            }
        }
    }
}

// ============================================================================
// Client stream
// ============================================================================

/// One client-side TLS connection, bound to the target host for SNI and the
/// post-handshake hostname check.
pub(crate) struct TlsClientStream {
    inner: TlsStream,
    host: String,
    check_hostname: bool,
}

impl std::fmt::Debug for TlsClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientStream")
            .field("host", &self.host)
            .field("handshaken", &self.inner.handshaken)
            .finish()
    }
}

impl TlsClientStream {
    pub(crate) fn new(
        ctx: &ClientCtx,
        location: &Location,
        mut sock: CoopSocket,
        cancel: Arc<AtomicBool>,
    ) -> Result<TlsClientStream, Error> {
        let config = ctx.config(&location.user_identity())?;
        let server_name = ServerName::try_from(location.host.clone())
            .map_err(|_| Error::InvalidServerName(location.host.clone()))?;
        let conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
        sock.set_cancel_flag(Some(cancel));
        Ok(TlsClientStream {
            inner: TlsStream {
                conn: conn.into(),
                sock,
                debug: ctx.debug,
                handshaken: false,
            },
            host: location.host.clone(),
            check_hostname: ctx.check_hostname,
        })
    }

    pub(crate) fn handshaken(&self) -> bool {
        self.inner.handshaken
    }

    /// Re-points the cancellation flag when the stream is reused by a new
    /// request.
    pub(crate) fn set_cancel_flag(&mut self, cancel: Arc<AtomicBool>) {
        self.inner.sock.set_cancel_flag(Some(cancel));
    }

    pub(crate) fn handshake(&mut self, task: &TaskCtx) -> Result<(), Error> {
        self.inner.handshake(task, "handshake(client)")?;

        if self.check_hostname {
            let certs = self
                .inner
                .conn
                .peer_certificates()
                .ok_or_else(|| tls_error("CheckCertHostname", "no peer certificate"))?;
            let end_entity = certs
                .first()
                .ok_or_else(|| tls_error("CheckCertHostname", "no peer certificate"))?;
            if !hostname::check_cert_hostname(end_entity.as_ref(), &self.host) {
                return Err(tls_error(
                    "CheckCertHostname",
                    format!("certificate does not match host {}", self.host),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, task: &TaskCtx, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_plain(task, buf)
    }

    pub(crate) fn read(&mut self, task: &TaskCtx, buf: &mut [u8]) -> Result<PlainRead, Error> {
        self.inner.read_plain(task, buf)
    }

    pub(crate) fn wait_until_drained(&mut self, task: &TaskCtx) -> Result<(), Error> {
        self.inner.sock.wait_until_drained(task).map_err(Error::from)
    }

    pub(crate) fn peer_closed(&self) -> bool {
        self.inner.sock.peer_closed()
    }
}

// ============================================================================
// Server stream
// ============================================================================

/// One accepted TLS connection on the server side.
pub(crate) struct TlsServerStream {
    inner: TlsStream,
    peer: Option<SocketAddr>,
}

impl std::fmt::Debug for TlsServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerStream")
            .field("peer", &self.peer)
            .field("handshaken", &self.inner.handshaken)
            .finish()
    }
}

impl TlsServerStream {
    pub(crate) fn new(ctx: &ServerCtx, sock: CoopSocket) -> Result<TlsServerStream, Error> {
        let conn = rustls::ServerConnection::new(ctx.config.clone())
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
        let peer = sock.peer_addr().ok();
        Ok(TlsServerStream {
            inner: TlsStream {
                conn: conn.into(),
                sock,
                debug: ctx.debug,
                handshaken: false,
            },
            peer,
        })
    }

    /// Idempotent: a no-op once the connection has handshaken.
    pub(crate) fn handshake(&mut self, task: &TaskCtx) -> Result<(), Error> {
        if self.inner.handshaken {
            return Ok(());
        }
        self.inner.handshake(task, "handshake(server)")
    }

    pub(crate) fn poll_read(
        &mut self,
        task: &TaskCtx,
        timeout: Duration,
    ) -> Result<PollVerdict, Error> {
        self.inner.poll_read(task, timeout)
    }

    pub(crate) fn write(&mut self, task: &TaskCtx, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_plain(task, buf)
    }

    pub(crate) fn read(&mut self, task: &TaskCtx, buf: &mut [u8]) -> Result<PlainRead, Error> {
        self.inner.read_plain(task, buf)
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn peer_closed(&self) -> bool {
        self.inner.sock.peer_closed()
    }

    pub(crate) fn set_nodelay(&self) {
        if let Err(err) = self.inner.sock.set_nodelay(true) {
            warn!(?err, "failed to set nodelay on accepted socket");
        }
    }

    /// Orderly close with close-notify; abortive close is just dropping the
    /// stream.
    pub(crate) fn close(mut self, task: &TaskCtx, orderly: bool) {
        if orderly {
            self.inner.shutdown(task);
        }
    }
}
