//! Client/Server Integration Tests
//!
//! # Running with tracing
//!
//! Use the TEST_LOG environment variable to control tracing verbosity
//! (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test happy_get -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test happy_get -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test happy_get -- --nocapture
//! ```

mod cert_helper;

use cert_helper::{generate_test_cert, TlsCertGuard};
use httpscomm::prelude::*;
use httpscomm::Error;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);
            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };
                let filter = format!("httpscomm={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

struct TestServer {
    service: Arc<HttpsService>,
    _server: Server,
    port: u16,
    _cert: TlsCertGuard,
}

fn start_server(handler: Arc<dyn OnRequest>) -> TestServer {
    start_server_with_options(handler, Options::default())
}

fn start_server_with_options(handler: Arc<dyn OnRequest>, options: Options) -> TestServer {
    init_tracing();
    let cert = generate_test_cert(&["localhost"]);
    start_server_with(handler, options, cert)
}

fn start_server_with(
    handler: Arc<dyn OnRequest>,
    options: Options,
    cert: TlsCertGuard,
) -> TestServer {
    init_tracing();
    let service = HttpsService::new(options).expect("service");
    let server = service
        .create_requester(handler, &cert.server_location(0))
        .expect("server");
    let port = server.local_addr().port();
    TestServer {
        service,
        _server: server,
        port,
        _cert: cert,
    }
}

fn expect_response(handle: &ResponseHandle) -> Response {
    match handle.wait(WAIT) {
        Some(Ok(response)) => response,
        Some(Err(failure)) => panic!("request failed: {}", failure.error),
        None => panic!("no outcome within {:?}", WAIT),
    }
}

fn expect_failure(handle: &ResponseHandle) -> RequestFailure {
    match handle.wait(WAIT) {
        Some(Err(failure)) => failure,
        Some(Ok(response)) => panic!("unexpected success: {} bytes", response.body.len()),
        None => panic!("no outcome within {:?}", WAIT),
    }
}

// ============================================================================
// Happy paths
// ============================================================================

#[test]
fn happy_get_returns_body_and_caches_connection() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen_in_handler = seen.clone();
    let env = start_server(Arc::new(move |request: ServerRequest| {
        seen_in_handler
            .lock()
            .unwrap()
            .push(request.service().to_string());
        request.send_reply(b"ok".to_vec(), Headers::new());
    }));

    let handle = env
        .service
        .schedule(Message::new(format!("https://localhost:{}/test", env.port)))
        .expect("schedule");
    let response = expect_response(&handle);
    assert_eq!(response.body, b"ok");

    assert_eq!(seen.lock().unwrap().clone(), vec!["test".to_string()]);

    // The connection goes back to the cache after a successful exchange.
    let deadline = Instant::now() + WAIT;
    loop {
        let (_, cached) = env.service.output_connections();
        if cached >= 1 {
            break;
        }
        assert!(Instant::now() < deadline, "connection never returned to cache");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn keep_alive_reuses_the_same_connection() {
    let hits = Arc::new(Mutex::new(0usize));
    let hits_in_handler = hits.clone();
    let env = start_server(Arc::new(move |request: ServerRequest| {
        *hits_in_handler.lock().unwrap() += 1;
        request.send_reply(b"pong".to_vec(), Headers::new());
    }));
    let addr = format!("https://localhost:{}/ping", env.port);

    let first = env.service.schedule(Message::new(addr.clone())).unwrap();
    expect_response(&first);

    // Let the speculative connect settle so the accepted-socket count is
    // stable before the second request.
    std::thread::sleep(Duration::from_millis(500));
    let accepted_after_first = env.service.input_connections();
    assert!(accepted_after_first >= 1);

    let second = env.service.schedule(Message::new(addr)).unwrap();
    expect_response(&second);
    assert_eq!(*hits.lock().unwrap(), 2);

    // A reused connection means no new accepted socket.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(env.service.input_connections(), accepted_after_first);
}

#[test]
fn post_echoes_body_through_adapter() {
    let env = start_server(Arc::new(|request: ServerRequest| {
        let echo = request.data().to_vec();
        request.send_reply(echo, Headers::new());
    }));

    let adapter = HttpsProtocol::<PostFormat>::new(env.service.clone());
    assert_eq!(adapter.scheme(), "posts");
    let handle = adapter
        .schedule_request(Message::with_data(
            format!("posts://localhost:{}/submit", env.port),
            b"a=1&b=2".to_vec(),
        ))
        .expect("schedule");
    let response = expect_response(&handle);
    assert_eq!(response.body, b"a=1&b=2");
}

#[test]
fn full_request_carries_raw_bytes() {
    let env = start_server(Arc::new(|request: ServerRequest| {
        let echo = request.data().to_vec();
        request.send_reply(echo, Headers::new());
    }));

    let payload: Vec<u8> = (0u8..=255).collect();
    let handle = env
        .service
        .schedule(Message::with_data(
            format!("fulls://localhost:{}/raw", env.port),
            payload.clone(),
        ))
        .expect("schedule");
    let response = expect_response(&handle);
    assert_eq!(response.body, payload);
}

#[test]
fn compressible_reply_arrives_gzipped_and_decoded() {
    let body: Vec<u8> = b"all work and no play makes a dull payload "
        .repeat(256)
        .to_vec();
    let expected = body.clone();
    let env = start_server(Arc::new(move |request: ServerRequest| {
        request.send_reply(body.clone(), Headers::new());
    }));

    let handle = env
        .service
        .schedule(Message::new(format!("https://localhost:{}/big", env.port)))
        .expect("schedule");
    let response = expect_response(&handle);
    assert_eq!(response.body, expected);
    assert_eq!(response.headers.get("content-encoding"), Some("gzip"));
}

#[test]
fn incompressible_reply_stays_identity() {
    // Two bytes cannot shrink under gzip.
    let env = start_server(Arc::new(|request: ServerRequest| {
        request.send_reply(b"ok".to_vec(), Headers::new());
    }));

    let handle = env
        .service
        .schedule(Message::new(format!("https://localhost:{}/tiny", env.port)))
        .expect("schedule");
    let response = expect_response(&handle);
    assert_eq!(response.body, b"ok");
    assert_eq!(response.headers.get("content-encoding"), None);
}

// ============================================================================
// Failure paths
// ============================================================================

#[test]
fn dropped_request_produces_503_and_keeps_the_connection_alive() {
    let env = start_server(Arc::new(|request: ServerRequest| {
        // Answer nothing; the reply guard must send the fixed 503.
        drop(request);
    }));
    let addr = format!("https://localhost:{}/ignored", env.port);

    for _ in 0..2 {
        let handle = env.service.schedule(Message::new(addr.clone())).unwrap();
        let failure = expect_failure(&handle);
        match failure.error {
            Error::Protocol { code, first_line } => {
                assert_eq!(code, 503);
                assert!(first_line.contains("503 Service unavailable"), "{first_line}");
            }
            other => panic!("expected protocol error, got {other}"),
        }
        assert!(failure.partial_body.is_empty());
    }
}

#[test]
fn handler_error_maps_to_status_code() {
    let env = start_server(Arc::new(|request: ServerRequest| {
        request.send_error(ResponseError::Forbidden);
    }));

    let handle = env
        .service
        .schedule(Message::new(format!("https://localhost:{}/secret", env.port)))
        .expect("schedule");
    let failure = expect_failure(&handle);
    match failure.error {
        Error::Protocol { code, .. } => assert_eq!(code, 403),
        other => panic!("expected protocol error, got {other}"),
    }
}

#[test]
fn cancellation_after_send_reports_cancelled() {
    let parked = Arc::new(Mutex::new(Vec::<ServerRequest>::new()));
    let parked_in_handler = parked.clone();
    let env = start_server(Arc::new(move |request: ServerRequest| {
        // Hold the request so no response is ever sent.
        parked_in_handler.lock().unwrap().push(request);
    }));

    let handle = env
        .service
        .schedule(Message::new(format!("https://localhost:{}/slow", env.port)))
        .expect("schedule");

    let deadline = Instant::now() + WAIT;
    while !handle.send_complete() {
        assert!(Instant::now() < deadline, "request never finished sending");
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.cancel();

    // The response wait polls with a capped backoff, so cancellation
    // surfaces within about a second.
    let failure = match handle.wait(Duration::from_secs(3)) {
        Some(Err(failure)) => failure,
        other => panic!("expected a failure, got {other:?}"),
    };
    assert!(matches!(failure.error, Error::Cancelled), "{}", failure.error);

    parked.lock().unwrap().clear();
}

#[test]
fn hard_limit_refuses_further_connections() {
    let parked = Arc::new(Mutex::new(Vec::<ServerRequest>::new()));
    let parked_in_handler = parked.clone();
    let env = start_server(Arc::new(move |request: ServerRequest| {
        parked_in_handler.lock().unwrap().push(request);
    }));
    env.service.set_output_connections_limits(0, 2);
    let addr = format!("https://localhost:{}/held", env.port);

    // Held requests push the connection total past the hard budget, one at
    // a time so a speculative connect never collides with the next acquire.
    let mut held = Vec::new();
    for n in 1..=3 {
        held.push(env.service.schedule(Message::new(addr.clone())).unwrap());
        let deadline = Instant::now() + WAIT;
        while parked.lock().unwrap().len() < n {
            assert!(Instant::now() < deadline, "held request {n} never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(400));
    }

    let probe = env.service.schedule(Message::new(addr)).unwrap();
    let failure = expect_failure(&probe);
    assert!(matches!(failure.error, Error::OutputLimit), "{}", failure.error);

    drop(held);
    parked.lock().unwrap().clear();
}

// ============================================================================
// Hostname verification
// ============================================================================

#[test]
fn hostname_mismatch_fails_the_handshake() {
    let mut options = Options::default();
    options.set("CheckCertificateHostname", "1").unwrap();
    let cert = generate_test_cert(&["b.example.com"]);
    let env = start_server_with(
        Arc::new(|request: ServerRequest| {
            request.send_reply(b"never".to_vec(), Headers::new());
        }),
        options,
        cert,
    );

    let handle = env
        .service
        .schedule(Message::new(format!("https://localhost:{}/x", env.port)))
        .expect("schedule");
    let failure = expect_failure(&handle);
    match &failure.error {
        Error::Tls { context, .. } => assert_eq!(*context, "CheckCertHostname"),
        other => panic!("expected tls error, got {other}"),
    }
}

#[test]
fn hostname_match_succeeds_with_checking_enabled() {
    let mut options = Options::default();
    options.set("CheckCertificateHostname", "1").unwrap();
    let env = start_server_with_options(
        Arc::new(|request: ServerRequest| {
            request.send_reply(b"hello".to_vec(), Headers::new());
        }),
        options,
    );

    let handle = env
        .service
        .schedule(Message::new(format!("https://localhost:{}/x", env.port)))
        .expect("schedule");
    let response = expect_response(&handle);
    assert_eq!(response.body, b"hello");
}
