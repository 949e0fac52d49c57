//! Outgoing request execution and the caller-facing response handle.

use crate::cache::ConnCache;
use crate::compress::gunzip;
use crate::error::Error;
use crate::http::{build_request, parse_status_code, Headers, HttpInput, RequestKind};
use crate::location::Location;
use crate::resolver::ResolvedHost;
use crate::sched::TaskCtx;
use crate::tls::{ClientCtx, TlsClientStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// One outgoing request: target address plus payload.
///
/// How the payload travels depends on the scheme: query string (`https`),
/// form body (`posts`), or raw body (`fulls`).
#[derive(Debug, Clone)]
pub struct Message {
    pub addr: String,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(addr: impl Into<String>) -> Message {
        Message {
            addr: addr.into(),
            data: Vec::new(),
        }
    }

    pub fn with_data(addr: impl Into<String>, data: impl Into<Vec<u8>>) -> Message {
        Message {
            addr: addr.into(),
            data: data.into(),
        }
    }
}

/// A successful response: decoded body plus response headers.
#[derive(Debug, Clone)]
pub struct Response {
    pub body: Vec<u8>,
    pub headers: Headers,
}

/// A failed request: the classified error plus whatever body bytes had
/// arrived (populated for non-2xx responses).
#[derive(Debug)]
pub struct RequestFailure {
    pub error: Error,
    pub partial_body: Vec<u8>,
}

pub(crate) type Outcome = Result<Response, RequestFailure>;

/// Caller's side of one scheduled request.
///
/// Exactly one outcome arrives per request. [`cancel`](Self::cancel) is
/// best-effort: an in-flight read notices within the poll backoff (at most
/// one second), while a request that already completed still delivers its
/// response.
pub struct ResponseHandle {
    cancel: Arc<AtomicBool>,
    send_complete: Arc<AtomicBool>,
    rx: Receiver<Outcome>,
}

impl ResponseHandle {
    /// Flags the request as cancelled.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// True once the request bytes have left the kernel send queue.
    pub fn send_complete(&self) -> bool {
        self.send_complete.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for the outcome.
    pub fn wait(&self, timeout: Duration) -> Option<Outcome> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Blocks until the outcome arrives.
    pub fn recv(&self) -> Option<Outcome> {
        self.rx.recv().ok()
    }
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("cancelled", &self.cancel.load(Ordering::Relaxed))
            .field("send_complete", &self.send_complete.load(Ordering::Relaxed))
            .finish()
    }
}

/// Request-side state behind a [`ResponseHandle`]. The sender is taken on
/// first notification, making delivery exactly-once.
pub(crate) struct HandleInner {
    cancel: Arc<AtomicBool>,
    send_complete: Arc<AtomicBool>,
    tx: Mutex<Option<Sender<Outcome>>>,
}

impl HandleInner {
    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub(crate) fn set_send_complete(&self) {
        self.send_complete.store(true, Ordering::Relaxed);
    }

    pub(crate) fn notify_response(&self, response: Response) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(Ok(response));
        }
    }

    pub(crate) fn notify_error(&self, error: Error, partial_body: Vec<u8>) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(Err(RequestFailure {
                error,
                partial_body,
            }));
        }
    }
}

pub(crate) fn handle_pair() -> (ResponseHandle, Arc<HandleInner>) {
    let (tx, rx) = channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let send_complete = Arc::new(AtomicBool::new(false));
    let handle = ResponseHandle {
        cancel: cancel.clone(),
        send_complete: send_complete.clone(),
        rx,
    };
    let inner = Arc::new(HandleInner {
        cancel,
        send_complete,
        tx: Mutex::new(Some(tx)),
    });
    (handle, inner)
}

// ============================================================================
// Request driver
// ============================================================================

/// End-to-end driver for one outgoing request: acquire a connection,
/// handshake if it is fresh, send, drain, receive, classify, and either
/// release the connection back to the cache or drop it.
pub(crate) struct RequestJob {
    pub(crate) handle: Arc<HandleInner>,
    pub(crate) msg: Message,
    pub(crate) location: Location,
    pub(crate) host: Arc<ResolvedHost>,
    pub(crate) kind: RequestKind,
    pub(crate) ctx: Arc<ClientCtx>,
    pub(crate) cache: Arc<ConnCache>,
}

impl RequestJob {
    pub(crate) fn run(self, task: &TaskCtx) {
        if self.handle.cancelled() || task.cancelled() {
            self.handle.notify_error(Error::Cancelled, Vec::new());
            return;
        }

        let mut conn = match self.cache.acquire(task, &self.host, &self.msg.addr) {
            Ok(conn) => conn,
            Err(err) => {
                self.handle.notify_error(err, Vec::new());
                return;
            }
        };
        debug!(addr = %self.msg.addr, reused = conn.reused, "connection acquired");

        let cancel = self.handle.cancel_flag();
        if let Err(err) = conn.attach_engine(|sock| {
            TlsClientStream::new(&self.ctx, &self.location, sock, cancel.clone())
        }) {
            self.handle.notify_error(err, Vec::new());
            return;
        }
        let Some(engine) = conn.engine_mut() else {
            self.handle
                .notify_error(Error::Unknown("connection lost its stream".to_string()), Vec::new());
            return;
        };
        // On reuse the engine already exists; just re-point the flag.
        engine.set_cancel_flag(cancel);

        let mut received = Vec::new();
        match self.execute(task, engine, &mut received) {
            Ok((body, headers)) => {
                self.cache.release(conn);
                self.handle.notify_response(Response { body, headers });
            }
            Err(err) => {
                // The connection is dropped, not released: its stream state
                // is unknown.
                let err = self.classify(task, err);
                debug!(addr = %self.msg.addr, %err, "request failed");
                self.handle.notify_error(err, received);
            }
        }
    }

    fn execute(
        &self,
        task: &TaskCtx,
        engine: &mut TlsClientStream,
        received: &mut Vec<u8>,
    ) -> Result<(Vec<u8>, Headers), Error> {
        if !engine.handshaken() {
            engine.handshake(task)?;
        }

        let request = build_request(self.kind, &self.location, &self.msg.data);
        engine.write(task, &request)?;
        engine.wait_until_drained(task)?;
        self.handle.set_send_complete();

        let mut input = HttpInput::new(engine);
        let head = input.read_head(task)?;
        let raw_body = input.read_body(task, head.headers.content_length())?;

        let body = match head.headers.get("content-encoding") {
            Some(coding) if coding.eq_ignore_ascii_case("gzip") => gunzip(&raw_body)
                .map_err(|err| Error::Unknown(format!("bad gzip response body: {err}")))?,
            _ => raw_body,
        };

        let code = parse_status_code(&head.first_line)
            .ok_or_else(|| Error::Unknown(format!("bad status line '{}'", head.first_line)))?;
        if !(200..=299).contains(&code) {
            *received = body;
            return Err(Error::Protocol {
                code,
                first_line: head.first_line,
            });
        }

        Ok((body, head.headers))
    }

    fn classify(&self, task: &TaskCtx, err: Error) -> Error {
        if matches!(err, Error::Cancelled) || self.handle.cancelled() || task.cancelled() {
            return Error::Cancelled;
        }
        match err {
            kept @ (Error::OutputLimit
            | Error::Connect { .. }
            | Error::Tls { .. }
            | Error::Protocol { .. }
            | Error::Truncated { .. }
            | Error::Unknown(_)) => kept,
            other => Error::Unknown(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_delivers_exactly_once() {
        let (handle, inner) = handle_pair();
        inner.notify_response(Response {
            body: b"ok".to_vec(),
            headers: Headers::new(),
        });
        inner.notify_error(Error::Cancelled, Vec::new());

        let outcome = handle.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(outcome.unwrap().body, b"ok");
        assert!(handle.wait(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn cancel_flag_is_shared() {
        let (handle, inner) = handle_pair();
        assert!(!inner.cancelled());
        handle.cancel();
        assert!(inner.cancelled());
        assert!(inner.cancel_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn send_complete_is_visible() {
        let (handle, inner) = handle_pair();
        assert!(!handle.send_complete());
        inner.set_send_complete();
        assert!(handle.send_complete());
    }
}
