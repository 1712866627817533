//! HTTP/1.x text framing.
//!
//! A request is a request line, a header block terminated by an empty line,
//! and an optional body framed by `Content-Length` or chunked
//! `Transfer-Encoding`:
//!
//! ```text
//! POST /shop/cart HTTP/1.1\r\n
//! Host: example.com\r\n
//! Transfer-Encoding: chunked\r\n
//! \r\n
//! 5\r\nhello\r\n0\r\n\r\n
//! ```
//!
//! The processor is resumable: it may be fed any fragmentation of the byte
//! stream and picks up where the previous call stopped.

use crate::error::ProtocolError;
use crate::headers::Headers;
use crate::message::{parse_content_length, Method, Request, Response, Version};
use crate::processor::{Consumed, Processor, ProcessorFactory};
use crate::{DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Longest accepted chunk-size line (including extensions).
const MAX_CHUNK_LINE: usize = 1024;

/// Size limits for the text protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http1Limits {
    /// Maximum request line plus header block, in bytes.
    pub max_header_size: usize,
    /// Maximum decoded body, in bytes.
    pub max_body_size: usize,
}

impl Default for Http1Limits {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Fixed { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkEnd,
    Trailers { size: usize },
}

/// Text protocol processor.
#[derive(Debug)]
pub struct Http1Processor {
    limits: Http1Limits,
    state: State,
    pending: Option<Request>,
    body: BytesMut,
    version: Version,
    keep_alive: bool,
    head_request: bool,
    expect_continue: bool,
}

impl Http1Processor {
    pub fn new(limits: Http1Limits) -> Self {
        Self {
            limits,
            state: State::Head,
            pending: None,
            body: BytesMut::new(),
            version: Version::Http11,
            keep_alive: true,
            head_request: false,
            expect_continue: false,
        }
    }

    pub fn limits(&self) -> Http1Limits {
        self.limits
    }

    fn need_more(&mut self) -> Result<Consumed, ProtocolError> {
        if self.expect_continue {
            self.expect_continue = false;
            return Ok(Consumed::Reply(Bytes::from_static(CONTINUE_RESPONSE)));
        }
        Ok(Consumed::NeedMore)
    }

    fn complete(&mut self) -> Result<Request, ProtocolError> {
        let mut request = self
            .pending
            .take()
            .ok_or_else(|| ProtocolError::bad("body without a request head"))?;
        request.body = self.body.split().freeze();
        self.state = State::Head;
        self.expect_continue = false;
        Ok(request)
    }

    fn parse_head(&mut self, head: &[u8]) -> Result<Request, ProtocolError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| ProtocolError::bad("header block is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let (method, target, version) = parse_request_line(request_line)?;

        let mut headers = Headers::with_capacity(16);
        for line in lines {
            if line.starts_with([' ', '\t']) {
                return Err(ProtocolError::bad("obsolete header line folding"));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::bad(format!("malformed header line: {:?}", line)))?;
            if name.is_empty() || !name.bytes().all(is_tchar) {
                return Err(ProtocolError::bad(format!("invalid header name: {:?}", name)));
            }
            headers.append(name, value.trim());
        }

        let mut request = Request::new(method, "/");
        request.version = version;
        apply_target(&mut request, &mut headers, target)?;
        request.headers = headers;

        if version == Version::Http11 && !request.headers.contains("host") {
            return Err(ProtocolError::bad("HTTP/1.1 request without Host header"));
        }

        self.version = version;
        self.keep_alive = match version {
            Version::Http11 => !request.headers.has_token("connection", "close"),
            Version::Http10 => request.headers.has_token("connection", "keep-alive"),
        };
        self.head_request = method == Method::Head;
        self.expect_continue =
            version == Version::Http11 && request.headers.has_token("expect", "100-continue");
        Ok(request)
    }

    fn body_framing(&self, request: &Request) -> Result<Option<State>, ProtocolError> {
        if request.headers.contains("transfer-encoding") {
            if request.headers.contains("content-length") {
                return Err(ProtocolError::bad(
                    "both Content-Length and Transfer-Encoding present",
                ));
            }
            if request.version == Version::Http10 {
                return Err(ProtocolError::bad("Transfer-Encoding on an HTTP/1.0 request"));
            }
            let last = request
                .headers
                .get_all("transfer-encoding")
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .last()
                .unwrap_or_default();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(ProtocolError::bad(format!(
                    "unsupported transfer coding: {}",
                    last
                )));
            }
            return Ok(Some(State::ChunkSize));
        }

        let mut length: Option<usize> = None;
        for value in request.headers.get_all("content-length") {
            let parsed = parse_content_length(value)
                .ok_or_else(|| ProtocolError::bad(format!("invalid Content-Length: {:?}", value)))?;
            if length.is_some_and(|l| l != parsed) {
                return Err(ProtocolError::bad("conflicting Content-Length values"));
            }
            length = Some(parsed);
        }

        match length {
            Some(len) if len > self.limits.max_body_size => Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: self.limits.max_body_size,
            }),
            Some(0) | None => Ok(None),
            Some(len) => Ok(Some(State::Fixed { remaining: len })),
        }
    }
}

impl Processor for Http1Processor {
    fn protocol(&self) -> &'static str {
        "http1"
    }

    fn consume(&mut self, input: &mut BytesMut) -> Result<Consumed, ProtocolError> {
        loop {
            match self.state {
                State::Head => {
                    // Stray CRLFs between pipelined requests are ignored.
                    while input.starts_with(b"\r\n") {
                        input.advance(2);
                    }
                    let max = self.limits.max_header_size;
                    let Some(end) = find(input, b"\r\n\r\n") else {
                        if input.len() > max {
                            return Err(ProtocolError::HeadersTooLarge {
                                size: input.len(),
                                max,
                            });
                        }
                        return Ok(Consumed::NeedMore);
                    };
                    let head_len = end + 4;
                    if head_len > max {
                        return Err(ProtocolError::HeadersTooLarge {
                            size: head_len,
                            max,
                        });
                    }
                    let head = input.split_to(head_len);
                    let request = self.parse_head(&head[..end])?;
                    match self.body_framing(&request)? {
                        None => {
                            self.expect_continue = false;
                            return Ok(Consumed::Request(request));
                        }
                        Some(state) => {
                            self.body.clear();
                            self.pending = Some(request);
                            self.state = state;
                        }
                    }
                }
                State::Fixed { remaining } => {
                    if input.is_empty() {
                        return self.need_more();
                    }
                    let n = remaining.min(input.len());
                    self.body.extend_from_slice(&input[..n]);
                    input.advance(n);
                    let remaining = remaining - n;
                    if remaining == 0 {
                        return self.complete().map(Consumed::Request);
                    }
                    self.state = State::Fixed { remaining };
                }
                State::ChunkSize => {
                    let Some(pos) = find(input, b"\r\n") else {
                        if input.len() > MAX_CHUNK_LINE {
                            return Err(ProtocolError::bad("chunk size line too long"));
                        }
                        return self.need_more();
                    };
                    let line = input.split_to(pos + 2);
                    let size = parse_chunk_size(&line[..pos])?;
                    if size == 0 {
                        self.state = State::Trailers { size: 0 };
                        continue;
                    }
                    let total = self.body.len().saturating_add(size);
                    if total > self.limits.max_body_size {
                        return Err(ProtocolError::PayloadTooLarge {
                            size: total,
                            max: self.limits.max_body_size,
                        });
                    }
                    self.state = State::ChunkData { remaining: size };
                }
                State::ChunkData { remaining } => {
                    if input.is_empty() {
                        return self.need_more();
                    }
                    let n = remaining.min(input.len());
                    self.body.extend_from_slice(&input[..n]);
                    input.advance(n);
                    let remaining = remaining - n;
                    self.state = if remaining == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                }
                State::ChunkEnd => {
                    if input.len() < 2 {
                        return self.need_more();
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ProtocolError::bad("missing CRLF after chunk data"));
                    }
                    input.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers { size } => {
                    let max = self.limits.max_header_size;
                    let Some(pos) = find(input, b"\r\n") else {
                        if size + input.len() > max {
                            return Err(ProtocolError::HeadersTooLarge {
                                size: size + input.len(),
                                max,
                            });
                        }
                        return self.need_more();
                    };
                    input.advance(pos + 2);
                    if pos == 0 {
                        return self.complete().map(Consumed::Request);
                    }
                    // Trailer fields are read and discarded.
                    let size = size + pos + 2;
                    if size > max {
                        return Err(ProtocolError::HeadersTooLarge { size, max });
                    }
                    self.state = State::Trailers { size };
                }
            }
        }
    }

    fn produce(
        &mut self,
        response: &mut Response,
        out: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let status = response.status();
        out.reserve(128 + response.body().len());
        out.put_slice(b"HTTP/1.1 ");
        out.put_slice(status.as_u16().to_string().as_bytes());
        out.put_u8(b' ');
        out.put_slice(response.reason().as_bytes());
        out.put_slice(b"\r\n");

        if status.is_informational() {
            for (name, value) in response.headers().iter() {
                if is_framing_header(name) {
                    continue;
                }
                put_header(out, name, value);
            }
            out.put_slice(b"\r\n");
            response.commit();
            return Ok(());
        }

        // A response sent before the request body was fully read leaves the
        // stream mid-message.
        if self.state != State::Head {
            self.keep_alive = false;
        }

        for (name, value) in response.headers().iter() {
            if is_framing_header(name) || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            put_header(out, name, value);
        }
        if !self.keep_alive {
            put_header(out, "Connection", "close");
        } else if self.version == Version::Http10 {
            put_header(out, "Connection", "keep-alive");
        }
        if status.allows_body() {
            put_header(out, "Content-Length", &response.body().len().to_string());
        }
        out.put_slice(b"\r\n");
        if status.allows_body() && !self.head_request {
            out.put_slice(response.body());
        }

        response.commit();
        self.head_request = false;
        Ok(())
    }

    fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn force_close(&mut self) {
        self.keep_alive = false;
    }

    fn recycle(&mut self) {
        self.state = State::Head;
        self.pending = None;
        self.body.clear();
        self.version = Version::Http11;
        self.keep_alive = true;
        self.head_request = false;
        self.expect_continue = false;
    }
}

/// Creates [`Http1Processor`]s.
#[derive(Debug, Clone, Default)]
pub struct Http1ProcessorFactory {
    limits: Http1Limits,
}

impl Http1ProcessorFactory {
    pub fn new(limits: Http1Limits) -> Self {
        Self { limits }
    }
}

impl ProcessorFactory for Http1ProcessorFactory {
    fn protocol(&self) -> &'static str {
        "http1"
    }

    fn create(&self) -> Box<dyn Processor> {
        Box::new(Http1Processor::new(self.limits))
    }
}

fn parse_request_line(line: &str) -> Result<(Method, &str, Version), ProtocolError> {
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::bad(format!("malformed request line: {:?}", line)));
    };
    if method.is_empty() || target.is_empty() || !method.bytes().all(is_tchar) {
        return Err(ProtocolError::bad(format!("malformed request line: {:?}", line)));
    }
    let method = Method::from_token(method)
        .ok_or_else(|| ProtocolError::UnsupportedMethod(method.to_string()))?;
    let version = match Version::from_token(version) {
        Some(v) => v,
        None if version.starts_with("HTTP/") => {
            return Err(ProtocolError::UnsupportedVersion(version.to_string()))
        }
        None => return Err(ProtocolError::bad(format!("invalid version: {:?}", version))),
    };
    Ok((method, target, version))
}

/// Fills path and query from the request target. Absolute-form targets
/// replace the `Host` header with their authority.
fn apply_target(
    request: &mut Request,
    headers: &mut Headers,
    target: &str,
) -> Result<(), ProtocolError> {
    let origin = if target.starts_with('/') {
        target
    } else if target == "*" && request.method == Method::Options {
        request.path = "*".to_string();
        return Ok(());
    } else if let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        let (authority, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(ProtocolError::bad("absolute target without authority"));
        }
        headers.set("Host", authority);
        path
    } else {
        return Err(ProtocolError::bad(format!("invalid request target: {:?}", target)));
    };

    match origin.split_once('?') {
        Some((path, query)) => {
            request.path = path.to_string();
            request.query = Some(query.to_string());
        }
        None => request.path = origin.to_string(),
    }
    Ok(())
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ProtocolError> {
    let text =
        std::str::from_utf8(line).map_err(|_| ProtocolError::bad("chunk size is not UTF-8"))?;
    // Chunk extensions are ignored.
    let digits = text.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() || digits.len() > 16 {
        return Err(ProtocolError::bad(format!("invalid chunk size: {:?}", text)));
    }
    usize::from_str_radix(digits, 16)
        .map_err(|_| ProtocolError::bad(format!("invalid chunk size: {:?}", text)))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    if name.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
        tracing::warn!("dropping response header {:?} containing CR/LF", name);
        return;
    }
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;

    fn processor() -> Http1Processor {
        Http1Processor::new(Http1Limits::default())
    }

    fn expect_request(result: Result<Consumed, ProtocolError>) -> Request {
        match result.unwrap() {
            Consumed::Request(r) => r,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_get() {
        let mut p = processor();
        let mut buf = BytesMut::from(&b"GET /shop/cart?id=7 HTTP/1.1\r\nHost: example.com\r\n\r\n"[..]);
        let req = expect_request(p.consume(&mut buf));

        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/shop/cart");
        assert_eq!(req.query.as_deref(), Some("id=7"));
        assert_eq!(req.host().as_deref(), Some("example.com"));
        assert!(req.body.is_empty());
        assert!(buf.is_empty());
        assert!(p.keep_alive());
    }

    #[test]
    fn test_partial_head_needs_more() {
        let mut p = processor();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: a"[..]);
        assert!(matches!(p.consume(&mut buf).unwrap(), Consumed::NeedMore));

        buf.extend_from_slice(b"\r\n\r\n");
        let req = expect_request(p.consume(&mut buf));
        assert_eq!(req.path, "/");
    }

    #[test]
    fn test_pipelined_requests_leave_leftover() {
        let mut p = processor();
        let mut buf = BytesMut::from(
            &b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n"[..],
        );
        let first = expect_request(p.consume(&mut buf));
        assert_eq!(first.path, "/a");
        assert!(!buf.is_empty());

        let second = expect_request(p.consume(&mut buf));
        assert_eq!(second.path, "/b");
        assert!(matches!(p.consume(&mut buf).unwrap(), Consumed::NeedMore));
    }

    #[test]
    fn test_fixed_length_body_across_fragments() {
        let mut p = processor();
        let mut buf =
            BytesMut::from(&b"POST /f HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nhello"[..]);
        assert!(matches!(p.consume(&mut buf).unwrap(), Consumed::NeedMore));

        buf.extend_from_slice(b"worldGET");
        let req = expect_request(p.consume(&mut buf));
        assert_eq!(&req.body[..], b"helloworld");
        assert_eq!(&buf[..], b"GET");
    }

    #[test]
    fn test_chunked_body() {
        let mut p = processor();
        let mut buf = BytesMut::from(
            &b"POST /c HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhel"[..],
        );
        assert!(matches!(p.consume(&mut buf).unwrap(), Consumed::NeedMore));

        buf.extend_from_slice(b"lo\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n");
        let req = expect_request(p.consume(&mut buf));
        assert_eq!(&req.body[..], b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_chunked_missing_crlf_is_bad_framing() {
        let mut p = processor();
        let mut buf = BytesMut::from(
            &b"POST /c HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabXX"[..],
        );
        assert!(matches!(
            p.consume(&mut buf),
            Err(ProtocolError::BadFraming(_))
        ));
    }

    #[test]
    fn test_expect_continue_reply() {
        let mut p = processor();
        let mut buf = BytesMut::from(
            &b"PUT /u HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n"[..],
        );
        match p.consume(&mut buf).unwrap() {
            Consumed::Reply(bytes) => assert_eq!(&bytes[..], CONTINUE_RESPONSE),
            other => panic!("expected 100 Continue, got {:?}", other),
        }
        assert!(matches!(p.consume(&mut buf).unwrap(), Consumed::NeedMore));

        buf.extend_from_slice(b"abc");
        let req = expect_request(p.consume(&mut buf));
        assert_eq!(&req.body[..], b"abc");
    }

    #[test]
    fn test_headers_too_large() {
        let mut p = Http1Processor::new(Http1Limits {
            max_header_size: 64,
            max_body_size: 1024,
        });
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\n"[..]);
        buf.extend_from_slice(format!("X-Big: {}\r\n", "a".repeat(80)).as_bytes());
        let err = p.consume(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::HeadersTooLarge { .. }));
        assert_eq!(err.status(), Some(Status::HEADERS_TOO_LARGE));
    }

    #[test]
    fn test_body_too_large() {
        let mut p = Http1Processor::new(Http1Limits {
            max_header_size: 1024,
            max_body_size: 4,
        });
        let mut buf =
            BytesMut::from(&b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\n"[..]);
        assert!(matches!(
            p.consume(&mut buf),
            Err(ProtocolError::PayloadTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn test_malformed_request_lines() {
        for raw in [
            &b"GET /\r\nHost: x\r\n\r\n"[..],
            &b"GET  / HTTP/1.1\r\nHost: x\r\n\r\n"[..],
            &b"GET / HTTP/1.1 extra\r\nHost: x\r\n\r\n"[..],
            &b"GET nopath HTTP/1.1\r\nHost: x\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nBad Header\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nHost: x\r\n folded\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\n\r\n"[..],
        ] {
            let mut buf = BytesMut::from(raw);
            let result = processor().consume(&mut buf);
            assert!(
                matches!(result, Err(ProtocolError::BadFraming(_))),
                "expected bad framing for {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_unsupported_method_and_version() {
        let mut buf = BytesMut::from(&b"BREW /pot HTTP/1.1\r\nHost: x\r\n\r\n"[..]);
        assert!(matches!(
            processor().consume(&mut buf),
            Err(ProtocolError::UnsupportedMethod(m)) if m == "BREW"
        ));

        let mut buf = BytesMut::from(&b"GET / HTTP/2.0\r\nHost: x\r\n\r\n"[..]);
        assert!(matches!(
            processor().consume(&mut buf),
            Err(ProtocolError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_content_length_with_transfer_encoding_rejected() {
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n"[..],
        );
        assert!(matches!(
            processor().consume(&mut buf),
            Err(ProtocolError::BadFraming(_))
        ));
    }

    #[test]
    fn test_signed_content_length_rejected() {
        for value in ["+5", "-5", "5 5"] {
            let raw = format!("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\nhello", value);
            let mut buf = BytesMut::from(raw.as_bytes());
            assert!(
                matches!(processor().consume(&mut buf), Err(ProtocolError::BadFraming(_))),
                "accepted Content-Length {:?}",
                value
            );
        }
    }

    #[test]
    fn test_keep_alive_rules() {
        let mut p = processor();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.0\r\n\r\n"[..]);
        expect_request(p.consume(&mut buf));
        assert!(!p.keep_alive());

        let mut buf = BytesMut::from(&b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"[..]);
        expect_request(p.consume(&mut buf));
        assert!(p.keep_alive());

        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n"[..]);
        expect_request(p.consume(&mut buf));
        assert!(!p.keep_alive());
    }

    #[test]
    fn test_absolute_form_target() {
        let mut buf = BytesMut::from(
            &b"GET http://proxy.example:8080/a/b?q=1 HTTP/1.1\r\nHost: ignored\r\n\r\n"[..],
        );
        let req = expect_request(processor().consume(&mut buf));
        assert_eq!(req.path, "/a/b");
        assert_eq!(req.query.as_deref(), Some("q=1"));
        assert_eq!(req.host().as_deref(), Some("proxy.example"));
    }

    #[test]
    fn test_produce_response() {
        let mut p = processor();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"[..]);
        expect_request(p.consume(&mut buf));

        let mut response = Response::new();
        response.set_header("Content-Type", "text/plain");
        response.set_header("Content-Length", "999");
        response.set_body("hi");
        let mut out = BytesMut::new();
        p.produce(&mut response, &mut out).unwrap();

        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\nhi"));
        assert!(response.is_committed());
    }

    #[test]
    fn test_produce_head_and_close() {
        let mut p = processor();
        let mut buf = BytesMut::from(&b"HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n"[..]);
        expect_request(p.consume(&mut buf));

        let mut response = Response::new();
        response.set_body("body");
        let mut out = BytesMut::new();
        p.produce(&mut response, &mut out).unwrap();

        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_produce_no_content_has_no_length() {
        let mut p = processor();
        let mut response = Response::with_status(Status::NO_CONTENT);
        let mut out = BytesMut::new();
        p.produce(&mut response, &mut out).unwrap();
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_produce_switching_protocols_keeps_connection_header() {
        let mut p = processor();
        let mut response = Response::with_status(Status::SWITCHING_PROTOCOLS);
        response.set_header("Connection", "Upgrade");
        response.set_header("Upgrade", "relay");
        let mut out = BytesMut::new();
        p.produce(&mut response, &mut out).unwrap();
        let text = std::str::from_utf8(&out).unwrap();
        assert_eq!(
            text,
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: relay\r\n\r\n"
        );
    }

    #[test]
    fn test_header_injection_dropped() {
        let mut p = processor();
        let mut response = Response::new();
        response.set_header("X-Evil", "a\r\nSet-Cookie: x=1");
        let mut out = BytesMut::new();
        p.produce(&mut response, &mut out).unwrap();
        assert!(!std::str::from_utf8(&out).unwrap().contains("Set-Cookie"));
    }

    #[test]
    fn test_recycle_clears_state() {
        let mut p = processor();
        let mut buf =
            BytesMut::from(&b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nabc"[..]);
        assert!(matches!(p.consume(&mut buf).unwrap(), Consumed::NeedMore));
        p.force_close();
        p.recycle();

        assert!(p.keep_alive());
        assert!(p.pending.is_none());
        assert!(p.body.is_empty());
        assert_eq!(p.state, State::Head);

        let mut buf = BytesMut::from(&b"GET /fresh HTTP/1.1\r\nHost: x\r\n\r\n"[..]);
        assert_eq!(expect_request(p.consume(&mut buf)).path, "/fresh");
    }
}
