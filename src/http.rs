//! Minimal HTTP/1.1 plumbing: head reading, body framing, request building.
//!
//! Full message parsing belongs to the enclosing library; this module
//! carries just enough to frame keep-alive request/response exchanges:
//! first line + header block, `Content-Length` or read-to-EOF bodies, and
//! the three client request forms.

use crate::error::Error;
use crate::location::Location;
use crate::sched::TaskCtx;
use crate::tls::{PlainRead, TlsClientStream, TlsServerStream};

/// Body chunk size for responses without `Content-Length` (common jumbo
/// frame payload).
const BODY_CHUNK: usize = 9500;

/// Largest accepted header block.
const MAX_HEAD: usize = 64 * 1024;

// ============================================================================
// Headers
// ============================================================================

/// An ordered list of HTTP header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value of `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn content_length(&self) -> Option<usize> {
        self.get("content-length")?.trim().parse().ok()
    }

    /// The best response coding the peer accepts; only `gzip` is spoken.
    pub(crate) fn best_compression(&self) -> Option<&'static str> {
        let accept = self.get("accept-encoding")?;
        for coding in accept.split(',') {
            let mut parts = coding.trim().split(';');
            let name = parts.next().unwrap_or_default().trim();
            if !name.eq_ignore_ascii_case("gzip") {
                continue;
            }
            let rejected = parts.any(|p| {
                let p = p.trim();
                p.eq_ignore_ascii_case("q=0") || p.eq_ignore_ascii_case("q=0.0")
            });
            if !rejected {
                return Some("gzip");
            }
        }
        None
    }
}

/// A parsed message head: first line plus header block.
#[derive(Debug, Clone)]
pub(crate) struct Head {
    pub(crate) first_line: String,
    pub(crate) headers: Headers,
}

/// Status code from a response first line (`HTTP/1.1 200 OK`).
pub(crate) fn parse_status_code(first_line: &str) -> Option<u16> {
    first_line.split_whitespace().nth(1)?.parse().ok()
}

/// Path and query from a request first line (`GET /svc?x=1 HTTP/1.1`).
pub(crate) fn parse_request_target(first_line: &str) -> (String, String) {
    let target = first_line.split_whitespace().nth(1).unwrap_or("/");
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Byte source the head/body reader can pull plaintext from.
pub(crate) trait PlainSource {
    fn read_plain(&mut self, task: &TaskCtx, buf: &mut [u8]) -> Result<PlainRead, Error>;
}

impl PlainSource for TlsClientStream {
    fn read_plain(&mut self, task: &TaskCtx, buf: &mut [u8]) -> Result<PlainRead, Error> {
        self.read(task, buf)
    }
}

impl PlainSource for TlsServerStream {
    fn read_plain(&mut self, task: &TaskCtx, buf: &mut [u8]) -> Result<PlainRead, Error> {
        self.read(task, buf)
    }
}

/// Buffered reader for one HTTP message on a stream.
///
/// Bytes pulled past the header block stay buffered and are consumed first
/// by the body read, so keep-alive framing never loses data.
pub(crate) struct HttpInput<'a, S: PlainSource> {
    source: &'a mut S,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<'a, S: PlainSource> HttpInput<'a, S> {
    pub(crate) fn new(source: &'a mut S) -> HttpInput<'a, S> {
        HttpInput {
            source,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Reads and parses the first line and header block.
    pub(crate) fn read_head(&mut self, task: &TaskCtx) -> Result<Head, Error> {
        loop {
            if let Some(end) = find_head_end(&self.buf) {
                let head = parse_head(&self.buf[..end])?;
                self.pos = end + 4;
                return Ok(head);
            }
            if self.buf.len() > MAX_HEAD {
                return Err(Error::Unknown("http header block too large".to_string()));
            }
            if self.eof {
                return Err(Error::Unknown(
                    "connection closed while reading http header".to_string(),
                ));
            }
            let mut chunk = [0u8; 4096];
            match self.source.read_plain(task, &mut chunk)? {
                PlainRead::Data(n) => self.buf.extend_from_slice(&chunk[..n]),
                PlainRead::Closed => self.eof = true,
            }
        }
    }

    /// Reads the message body: exactly `Content-Length` bytes when declared
    /// (a short stream is a truncation error), read-to-EOF otherwise.
    pub(crate) fn read_body(
        &mut self,
        task: &TaskCtx,
        content_length: Option<usize>,
    ) -> Result<Vec<u8>, Error> {
        let mut body = self.buf.split_off(self.pos);
        self.buf.clear();
        self.pos = 0;

        match content_length {
            Some(expected) => {
                if body.len() > expected {
                    // Surplus belongs to the next message on this connection.
                    let rest = body.split_off(expected);
                    self.buf = rest;
                }
                while body.len() < expected && !self.eof {
                    let mut chunk = vec![0u8; (expected - body.len()).min(BODY_CHUNK)];
                    match self.source.read_plain(task, &mut chunk)? {
                        PlainRead::Data(n) => body.extend_from_slice(&chunk[..n]),
                        PlainRead::Closed => self.eof = true,
                    }
                }
                if body.len() < expected {
                    return Err(Error::Truncated {
                        got: body.len(),
                        expected,
                    });
                }
                Ok(body)
            }
            None => {
                while !self.eof {
                    let mut chunk = [0u8; BODY_CHUNK];
                    match self.source.read_plain(task, &mut chunk)? {
                        PlainRead::Data(n) => body.extend_from_slice(&chunk[..n]),
                        PlainRead::Closed => self.eof = true,
                    }
                }
                Ok(body)
            }
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(raw: &[u8]) -> Result<Head, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::Unknown("http header is not valid utf-8".to_string()))?;
    let mut lines = text.split("\r\n");
    let first_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::Unknown("empty http first line".to_string()))?
        .to_string();

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Unknown(format!("malformed header line '{line}'")))?;
        headers.add(name.trim(), value.trim());
    }
    Ok(Head { first_line, headers })
}

// ============================================================================
// Request building
// ============================================================================

/// The three request forms the client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Message data travels as the query string.
    Get,
    /// Message data travels as a form-encoded body.
    Post,
    /// Message data travels as a raw body.
    Full,
}

/// Builds the request bytes for one message.
pub(crate) fn build_request(kind: RequestKind, location: &Location, data: &[u8]) -> Vec<u8> {
    let mut head = String::with_capacity(256);
    let method = match kind {
        RequestKind::Get => "GET",
        RequestKind::Post | RequestKind::Full => "POST",
    };

    head.push_str(method);
    head.push_str(" /");
    head.push_str(&location.service);
    if kind == RequestKind::Get && !data.is_empty() {
        head.push(if location.service.contains('?') { '&' } else { '?' });
        head.push_str(&String::from_utf8_lossy(data));
    }
    head.push_str(" HTTP/1.1\r\n");

    head.push_str("Host: ");
    head.push_str(&location.host);
    if location.port != 443 {
        head.push_str(&format!(":{}", location.port));
    }
    head.push_str("\r\n");
    head.push_str("Accept-Encoding: gzip\r\n");
    head.push_str("Connection: Keep-Alive\r\n");

    let body: &[u8] = match kind {
        RequestKind::Get => b"",
        RequestKind::Post | RequestKind::Full => data,
    };
    if kind != RequestKind::Get {
        if kind == RequestKind::Post {
            head.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");

    let mut request = head.into_bytes();
    request.extend_from_slice(body);
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSource {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl VecSource {
        fn new(data: &[u8], chunk: usize) -> VecSource {
            VecSource {
                data: data.to_vec(),
                pos: 0,
                chunk,
            }
        }
    }

    impl PlainSource for VecSource {
        fn read_plain(&mut self, _task: &TaskCtx, buf: &mut [u8]) -> Result<PlainRead, Error> {
            if self.pos >= self.data.len() {
                return Ok(PlainRead::Closed);
            }
            let n = (self.data.len() - self.pos).min(buf.len()).min(self.chunk);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(PlainRead::Data(n))
        }
    }

    #[test]
    fn reads_head_and_content_length_body() {
        let task = TaskCtx::detached();
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nX-Tag: a\r\n\r\nbodyNEXT";
        let mut source = VecSource::new(raw, 7);
        let mut input = HttpInput::new(&mut source);
        let head = input.read_head(&task).unwrap();
        assert_eq!(head.first_line, "HTTP/1.1 200 OK");
        assert_eq!(head.headers.get("content-length"), Some("4"));
        assert_eq!(head.headers.get("x-tag"), Some("a"));
        let body = input.read_body(&task, head.headers.content_length()).unwrap();
        assert_eq!(body, b"body");
    }

    #[test]
    fn reads_body_to_eof_without_content_length() {
        let task = TaskCtx::detached();
        let raw = b"HTTP/1.1 200 OK\r\n\r\neverything until eof";
        let mut source = VecSource::new(raw, 5);
        let mut input = HttpInput::new(&mut source);
        let head = input.read_head(&task).unwrap();
        let body = input.read_body(&task, None).unwrap();
        assert_eq!(body, b"everything until eof");
        assert_eq!(head.headers.len(), 0);
    }

    #[test]
    fn short_content_length_is_truncation() {
        let task = TaskCtx::detached();
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        let mut source = VecSource::new(raw, 64);
        let mut input = HttpInput::new(&mut source);
        let head = input.read_head(&task).unwrap();
        let err = input
            .read_body(&task, head.headers.content_length())
            .unwrap_err();
        assert!(matches!(err, Error::Truncated { got: 3, expected: 10 }));
    }

    #[test]
    fn status_line_parses() {
        assert_eq!(parse_status_code("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.1 503 Service unavailable"), Some(503));
        assert_eq!(parse_status_code("garbage"), None);
    }

    #[test]
    fn request_target_splits_query() {
        let (path, query) = parse_request_target("GET /svc?a=1&b=2 HTTP/1.1");
        assert_eq!(path, "/svc");
        assert_eq!(query, "a=1&b=2");
    }

    #[test]
    fn best_compression_honours_q_zero() {
        let mut headers = Headers::new();
        headers.add("Accept-Encoding", "gzip;q=0, identity");
        assert_eq!(headers.best_compression(), None);

        let mut headers = Headers::new();
        headers.add("Accept-Encoding", "deflate, GZIP");
        assert_eq!(headers.best_compression(), Some("gzip"));
    }

    #[test]
    fn get_request_carries_query() {
        let location = Location::parse("https://example.com:8443/stat").unwrap();
        let request = build_request(RequestKind::Get, &location, b"a=1");
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("GET /stat?a=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:8443\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn post_request_carries_form_body() {
        let location = Location::parse("posts://example.com/submit").unwrap();
        let request = build_request(RequestKind::Post, &location, b"a=1&b=2");
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\na=1&b=2"));
    }

    #[test]
    fn full_request_is_raw_body() {
        let location = Location::parse("fulls://example.com/raw").unwrap();
        let request = build_request(RequestKind::Full, &location, &[0u8, 1, 2]);
        let head_end = request
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap();
        let text = String::from_utf8_lossy(&request[..head_end]);
        assert!(!text.contains("Content-Type"));
        assert!(text.contains("Content-Length: 3"));
        assert_eq!(&request[head_end + 4..], &[0u8, 1, 2]);
    }
}
