//! The service object bundling everything a process shares: options, the
//! client TLS context, the output connection cache, the host resolver, the
//! input-connection state, and the request executor.
//!
//! Nothing in the crate is a process-global; construct one service at
//! start-up and hand it to whatever needs to talk HTTPS.

use crate::cache::ConnCache;
use crate::client::{handle_pair, Message, RequestJob, ResponseHandle};
use crate::error::Error;
use crate::http::RequestKind;
use crate::limits::{FdLimits, InputConns};
use crate::location::Location;
use crate::options::Options;
use crate::proto::kind_for_scheme;
use crate::resolver::HostResolver;
use crate::sched::Executor;
use crate::server::{OnRequest, Server};
use crate::tls::ClientCtx;
use std::sync::Arc;

/// Shared HTTPS machinery. See the crate docs for a usage sketch.
#[derive(Debug)]
pub struct HttpsService {
    options: Arc<Options>,
    ctx: Arc<ClientCtx>,
    cache: Arc<ConnCache>,
    resolver: Arc<HostResolver>,
    input_conns: Arc<InputConns>,
    jobs: Executor,
}

impl HttpsService {
    /// Builds the service: client TLS context from `options`, default fd
    /// budgets, empty connection cache.
    pub fn new(options: Options) -> Result<Arc<HttpsService>, Error> {
        let ctx = ClientCtx::new(&options)?;
        Ok(Arc::new(HttpsService {
            options: Arc::new(options),
            ctx: Arc::new(ctx),
            cache: ConnCache::new(FdLimits::default()),
            resolver: Arc::new(HostResolver::new()),
            input_conns: Arc::new(InputConns::new(FdLimits::default())),
            jobs: Executor::new("https-req-dispatch", "https-req"),
        }))
    }

    // ============================================================================
    // Client side
    // ============================================================================

    /// Schedules a request, choosing the request form from the location
    /// scheme (`https`/`posts`/`fulls`).
    pub fn schedule(&self, msg: Message) -> Result<ResponseHandle, Error> {
        let location = Location::parse(&msg.addr)?;
        let kind = kind_for_scheme(&location.scheme).ok_or_else(|| Error::InvalidLocation {
            location: msg.addr.clone(),
            reason: "unknown scheme",
        })?;
        self.schedule_parsed(msg, location, kind)
    }

    /// Schedules a request with an explicit form, ignoring the scheme.
    pub fn schedule_as(&self, msg: Message, kind: RequestKind) -> Result<ResponseHandle, Error> {
        let location = Location::parse(&msg.addr)?;
        self.schedule_parsed(msg, location, kind)
    }

    fn schedule_parsed(
        &self,
        msg: Message,
        location: Location,
        kind: RequestKind,
    ) -> Result<ResponseHandle, Error> {
        let host = self.resolver.resolve(&location.host, location.port)?;
        let (handle, inner) = handle_pair();
        let job = RequestJob {
            handle: inner,
            msg,
            location,
            host,
            kind,
            ctx: self.ctx.clone(),
            cache: self.cache.clone(),
        };
        self.jobs.enqueue(move |task| job.run(task));
        Ok(handle)
    }

    // ============================================================================
    // Server side
    // ============================================================================

    /// Starts a server on `location` (the user-info must carry
    /// `cert=…;key=…`), delivering parsed requests to `handler`.
    pub fn create_requester(
        &self,
        handler: Arc<dyn OnRequest>,
        location: &str,
    ) -> Result<Server, Error> {
        let location = Location::parse(location)?;
        Server::start(handler, &location, &self.options, self.input_conns.clone())
    }

    // ============================================================================
    // Limits
    // ============================================================================

    /// Output (client) fd budget; `hard` must exceed `soft`.
    pub fn set_output_connections_limits(&self, soft: usize, hard: usize) {
        self.cache.set_fd_limits(soft, hard);
    }

    /// Input (server) fd budget; `hard` must exceed `soft`.
    pub fn set_input_connections_limits(&self, soft: usize, hard: usize) {
        self.input_conns.set_fd_limits(soft, hard);
    }

    /// Idle keep-alive bounds for accepted connections, in seconds; `max`
    /// must exceed `min`.
    pub fn set_input_connections_timeouts(&self, min_s: u32, max_s: u32) {
        self.input_conns.set_keepalive_bounds(min_s, max_s);
    }

    // ============================================================================
    // Introspection
    // ============================================================================

    /// `(active, cached)` output connection counts.
    pub fn output_connections(&self) -> (usize, usize) {
        self.cache.stats()
    }

    /// Live accepted connections across this service's servers.
    pub fn input_connections(&self) -> usize {
        self.input_conns.count()
    }

    /// The keep-alive allowance servers currently grant idle connections.
    pub fn input_keepalive_timeout_s(&self) -> u32 {
        self.input_conns.keepalive_timeout_s()
    }
}

impl Drop for HttpsService {
    fn drop(&mut self) {
        self.cache.shutdown();
    }
}
