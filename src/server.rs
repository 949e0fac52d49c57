//! The HTTPS server: accept loop, per-connection read jobs, response
//! writers, keep-alive.
//!
//! Every accepted request produces some response: answered requests flow
//! through the write job, and a request object dropped without a reply
//! triggers the fixed 503 fail job. Both re-enqueue a read job on the same
//! stream, which parks in the adaptive keep-alive wait.

use crate::compress::gzip_if_smaller;
use crate::error::Error;
use crate::http::{parse_request_target, Headers, HttpInput};
use crate::limits::{InputConnGuard, InputConns};
use crate::location::Location;
use crate::options::Options;
use crate::sched::{Executor, TaskCtx};
use crate::sock::CoopSocket;
use crate::tls::{PollVerdict, ServerCtx, TlsServerStream};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Poll slice of the accept loop and of keep-alive waits; bounds shutdown
/// latency.
const ACCEPT_SLICE: Duration = Duration::from_millis(250);
const KEEPALIVE_SLICE: Duration = Duration::from_secs(1);

/// Backoff after an accept failure (typically fd exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(500);

const FAIL_ANSWER: &[u8] = b"HTTP/1.1 503 Service unavailable\r\nContent-Length: 0\r\n\r\n";

/// Handler invoked for every parsed request.
pub trait OnRequest: Send + Sync + 'static {
    fn on_request(&self, request: ServerRequest);
}

impl<F> OnRequest for F
where
    F: Fn(ServerRequest) + Send + Sync + 'static,
{
    fn on_request(&self, request: ServerRequest) {
        self(request)
    }
}

/// Error responses a handler can send instead of a reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    BadRequest,
    Forbidden,
    NotExistService,
    TooManyRequests,
    InternalError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    BandwidthLimitExceeded,
}

impl ResponseError {
    fn status(self) -> (u16, &'static str) {
        match self {
            ResponseError::BadRequest => (400, "Bad request"),
            ResponseError::Forbidden => (403, "Forbidden"),
            ResponseError::NotExistService => (404, "Not found"),
            ResponseError::TooManyRequests => (429, "Too many requests"),
            ResponseError::InternalError => (500, "Internal server error"),
            ResponseError::NotImplemented => (501, "Not implemented"),
            ResponseError::BadGateway => (502, "Bad gateway"),
            ResponseError::ServiceUnavailable => (503, "Service unavailable"),
            ResponseError::BandwidthLimitExceeded => (509, "Bandwidth limit exceeded"),
        }
    }
}

// One accepted connection: the TLS stream plus its registration with the
// input-connection counter.
struct ServerConn {
    tls: TlsServerStream,
    _guard: InputConnGuard,
}

struct ServerShared {
    // Backref so jobs can be enqueued from &self contexts (the request
    // object's reply guard included).
    self_ref: Weak<ServerShared>,
    handler: Arc<dyn OnRequest>,
    ctx: ServerCtx,
    input_conns: Arc<InputConns>,
    jobs: Executor,
    shutdown: AtomicBool,
}

impl ServerShared {
    fn arc(&self) -> Arc<ServerShared> {
        self.self_ref.upgrade().expect("server state dropped")
    }

    fn enqueue_read(&self, conn: ServerConn) {
        let shared = self.arc();
        self.jobs.enqueue(move |task| read_job(shared, conn, task));
    }

    fn enqueue_write(
        &self,
        conn: ServerConn,
        status: (u16, &'static str),
        encoding: Option<&'static str>,
        headers: Headers,
        body: Vec<u8>,
    ) {
        let shared = self.arc();
        self.jobs
            .enqueue(move |task| write_job(shared, conn, status, encoding, headers, body, task));
    }

    fn enqueue_fail(&self, conn: ServerConn) {
        let shared = self.arc();
        self.jobs.enqueue(move |task| fail_job(shared, conn, task));
    }
}

/// A listening HTTPS requester. Dropping it stops the accept loop; live
/// connections wind down within their next poll slice.
pub struct Server {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    pub(crate) fn start(
        handler: Arc<dyn OnRequest>,
        location: &Location,
        options: &Options,
        input_conns: Arc<InputConns>,
    ) -> Result<Server, Error> {
        let ctx = ServerCtx::new(options, location)?;
        let bind_addr: SocketAddr = ([0, 0, 0, 0], location.port).into();
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "https server listening");

        let shared = Arc::new_cyclic(|self_ref| ServerShared {
            self_ref: self_ref.clone(),
            handler,
            ctx,
            input_conns,
            jobs: Executor::new("https-dispatch", "https-job"),
            shutdown: AtomicBool::new(false),
        });

        let acceptor = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("https-accept".to_string())
                .spawn(move || accept_loop(shared, listener))
                .map_err(Error::Io)?
        };

        Ok(Server {
            shared,
            local_addr,
            acceptor: Some(acceptor),
        })
    }

    /// The bound listener address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

// ============================================================================
// Accept loop
// ============================================================================

fn accept_loop(shared: Arc<ServerShared>, mut listener: TcpListener) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            warn!(?err, "failed to create acceptor poll");
            return;
        }
    };
    if let Err(err) = poll
        .registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
    {
        warn!(?err, "failed to register listener");
        return;
    }
    let mut events = Events::with_capacity(16);

    while !shared.shutdown.load(Ordering::Relaxed) {
        match poll.poll(&mut events, Some(ACCEPT_SLICE)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(?err, "acceptor poll failed");
                return;
            }
        }

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if shared.input_conns.exceed_hard_limit() > 0 {
                        // Past the hard budget: shed load immediately.
                        debug!(%peer, "input connection limit reached, closing");
                        drop(stream);
                        continue;
                    }
                    let guard = InputConnGuard::new(shared.input_conns.clone());
                    let conn = CoopSocket::from_stream(stream)
                        .map_err(Error::Io)
                        .and_then(|sock| TlsServerStream::new(&shared.ctx, sock));
                    match conn {
                        Ok(tls) => {
                            debug!(%peer, "accepted connection");
                            shared.enqueue_read(ServerConn { tls, _guard: guard });
                        }
                        Err(err) => warn!(%peer, %err, "failed to set up accepted connection"),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::ConnectionAborted
                            | std::io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(?err, "transient accept error");
                    continue;
                }
                Err(err) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!(?err, "accept failed");
                    std::thread::sleep(ACCEPT_ERROR_BACKOFF);
                    break;
                }
            }
        }
    }
    debug!("acceptor finished");
}

// ============================================================================
// Connection jobs
// ============================================================================

fn read_job(shared: Arc<ServerShared>, mut conn: ServerConn, task: &TaskCtx) {
    // Keep-alive wait, sliced so server shutdown is observed promptly. The
    // allowance is re-read per slice: it shrinks while the fd budget fills.
    let started = Instant::now();
    loop {
        let timeout = Duration::from_secs(u64::from(shared.input_conns.keepalive_timeout_s()));
        let remaining = match timeout.checked_sub(started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => {
                conn.tls.close(task, true);
                return;
            }
        };
        if shared.shutdown.load(Ordering::Relaxed) || task.cancelled() {
            conn.tls.close(task, true);
            return;
        }
        match conn.tls.poll_read(task, remaining.min(KEEPALIVE_SLICE)) {
            Ok(PollVerdict::Readable) => break,
            Ok(PollVerdict::Timeout) => continue,
            Ok(PollVerdict::PeerClosed) => {
                debug!("peer closed idle connection");
                return;
            }
            Err(err) => {
                debug!(%err, "idle wait failed");
                return;
            }
        }
    }

    let outcome = (|| -> Result<ServerRequest, Error> {
        conn.tls.handshake(task)?;
        let mut input = HttpInput::new(&mut conn.tls);
        let head = input.read_head(task)?;

        // POST requests carry a body to buffer; everything else is
        // query-only.
        let is_post = matches!(head.first_line.as_bytes().first(), Some(b'p') | Some(b'P'));
        let data = if is_post {
            input.read_body(task, head.headers.content_length())?
        } else {
            let (_, query) = parse_request_target(&head.first_line);
            query.into_bytes()
        };
        let (path, _) = parse_request_target(&head.first_line);
        let service = path.strip_prefix('/').unwrap_or(&path).to_string();
        let compression = head.headers.best_compression();
        let remote = conn.tls.peer_addr();

        Ok(ServerRequest {
            shared: shared.clone(),
            conn: Some(conn),
            first_line: head.first_line,
            headers: head.headers,
            data,
            service,
            compression,
            remote,
        })
    })();

    match outcome {
        Ok(request) => shared.handler.on_request(request),
        Err(err) => {
            // Abortive close: the stream state is unknown.
            debug!(%err, "request read failed");
        }
    }
}

fn write_job(
    shared: Arc<ServerShared>,
    mut conn: ServerConn,
    status: (u16, &'static str),
    encoding: Option<&'static str>,
    headers: Headers,
    body: Vec<u8>,
    task: &TaskCtx,
) {
    conn.tls.set_nodelay();

    let mut head = String::with_capacity(128);
    head.push_str("HTTP/1.1 ");
    head.push_str(&status.0.to_string());
    head.push(' ');
    head.push_str(status.1);
    head.push_str("\r\n");
    if let Some(encoding) = encoding {
        head.push_str("Content-Encoding: ");
        head.push_str(encoding);
        head.push_str("\r\n");
    }
    head.push_str("Connection: Keep-Alive\r\n");
    head.push_str("Content-Length: ");
    head.push_str(&body.len().to_string());
    head.push_str("\r\n");
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let written = conn
        .tls
        .write(task, head.as_bytes())
        .and_then(|()| conn.tls.write(task, &body));
    match written {
        Ok(()) => shared.enqueue_read(conn),
        Err(err) => debug!(%err, "response write failed"),
    }
}

fn fail_job(shared: Arc<ServerShared>, mut conn: ServerConn, task: &TaskCtx) {
    match conn.tls.write(task, FAIL_ANSWER) {
        Ok(()) => shared.enqueue_read(conn),
        Err(err) => debug!(%err, "fail answer write failed"),
    }
}

// ============================================================================
// The request object
// ============================================================================

/// One parsed incoming request.
///
/// The handler must answer with [`send_reply`](Self::send_reply) or
/// [`send_error`](Self::send_error); a request dropped unanswered sends the
/// fixed `503 Service unavailable` so the peer never hangs, and the
/// connection stays usable either way.
pub struct ServerRequest {
    shared: Arc<ServerShared>,
    conn: Option<ServerConn>,
    first_line: String,
    headers: Headers,
    data: Vec<u8>,
    service: String,
    compression: Option<&'static str>,
    remote: Option<SocketAddr>,
}

impl ServerRequest {
    pub fn scheme(&self) -> &'static str {
        "https"
    }

    /// Request path without the leading slash.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Query string for GET-style requests, the buffered body for POST.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn first_line(&self) -> &str {
        &self.first_line
    }

    pub fn remote_host(&self) -> Option<String> {
        self.remote.map(|addr| addr.ip().to_string())
    }

    /// True when the peer has already gone away.
    pub fn canceled(&self) -> bool {
        match &self.conn {
            Some(conn) => conn.tls.peer_closed(),
            None => false,
        }
    }

    /// Sends a 200 reply. The body is gzipped when the peer accepts gzip
    /// and compression actually shrinks it; `headers` are appended to the
    /// standard response fields.
    pub fn send_reply(mut self, body: Vec<u8>, headers: Headers) {
        let Some(conn) = self.conn.take() else { return };
        let (body, encoding) = match self.compression {
            Some("gzip") => match gzip_if_smaller(&body) {
                Some(compressed) => (compressed, Some("gzip")),
                None => (body, None),
            },
            _ => (body, None),
        };
        self.shared
            .enqueue_write(conn, (200, "Ok"), encoding, headers, body);
    }

    /// Sends an error status with an empty body.
    pub fn send_error(mut self, error: ResponseError) {
        let Some(conn) = self.conn.take() else { return };
        self.shared
            .enqueue_write(conn, error.status(), None, Headers::new(), Vec::new());
    }
}

impl Drop for ServerRequest {
    fn drop(&mut self) {
        // Reply guard: an unanswered request still gets a response.
        if let Some(conn) = self.conn.take() {
            self.shared.enqueue_fail(conn);
        }
    }
}

impl std::fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRequest")
            .field("first_line", &self.first_line)
            .field("service", &self.service)
            .field("remote", &self.remote)
            .field("answered", &self.conn.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_error_status_table() {
        assert_eq!(ResponseError::BadRequest.status().0, 400);
        assert_eq!(ResponseError::Forbidden.status().0, 403);
        assert_eq!(ResponseError::NotExistService.status().0, 404);
        assert_eq!(ResponseError::TooManyRequests.status().0, 429);
        assert_eq!(ResponseError::InternalError.status().0, 500);
        assert_eq!(ResponseError::NotImplemented.status().0, 501);
        assert_eq!(ResponseError::BadGateway.status().0, 502);
        assert_eq!(ResponseError::ServiceUnavailable.status().0, 503);
        assert_eq!(ResponseError::BandwidthLimitExceeded.status().0, 509);
    }
}
