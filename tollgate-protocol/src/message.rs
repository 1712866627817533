//! Normalized request and response model shared by every protocol.

use crate::headers::Headers;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

/// Request methods understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Patch,
}

impl Method {
    /// Parses a method token. Unknown tokens return `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            "PATCH" => Method::Patch,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.1" => Some(Version::Http11),
            "HTTP/1.0" => Some(Version::Http10),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(u16);

impl Status {
    pub const CONTINUE: Status = Status(100);
    pub const SWITCHING_PROTOCOLS: Status = Status(101);
    pub const OK: Status = Status(200);
    pub const NO_CONTENT: Status = Status(204);
    pub const FOUND: Status = Status(302);
    pub const NOT_MODIFIED: Status = Status(304);
    pub const BAD_REQUEST: Status = Status(400);
    pub const UNAUTHORIZED: Status = Status(401);
    pub const FORBIDDEN: Status = Status(403);
    pub const NOT_FOUND: Status = Status(404);
    pub const METHOD_NOT_ALLOWED: Status = Status(405);
    pub const PAYLOAD_TOO_LARGE: Status = Status(413);
    pub const HEADERS_TOO_LARGE: Status = Status(431);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const NOT_IMPLEMENTED: Status = Status(501);
    pub const SERVICE_UNAVAILABLE: Status = Status(503);
    pub const VERSION_NOT_SUPPORTED: Status = Status(505);

    /// Creates a status from a numeric code in `100..=999`.
    pub fn from_u16(code: u16) -> Option<Self> {
        (100..=999).contains(&code).then_some(Status(code))
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    pub fn is_server_error(&self) -> bool {
        self.0 >= 500
    }

    /// Returns whether a response with this status may carry a body.
    pub fn allows_body(&self) -> bool {
        !(self.is_informational() || self.0 == 204 || self.0 == 304)
    }

    /// Status class label, e.g. `"2xx"`.
    pub fn class(&self) -> &'static str {
        match self.0 / 100 {
            1 => "1xx",
            2 => "2xx",
            3 => "3xx",
            4 => "4xx",
            _ => "5xx",
        }
    }

    pub fn canonical_reason(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Content Too Large",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.canonical_reason())
    }
}

/// A normalized request produced by a [`Processor`](crate::Processor).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request path without the query string, still percent-encoded.
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: Headers,
    pub body: Bytes,
    /// Whether the request arrived over a confidential transport.
    pub secure: bool,
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            version: Version::Http11,
            headers: Headers::new(),
            body: Bytes::new(),
            secure: false,
            remote_addr: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Host name from the `Host` header, without port, lowercased.
    pub fn host(&self) -> Option<String> {
        let raw = self.headers.get("host")?.trim();
        if raw.is_empty() {
            return None;
        }
        let name = if raw.starts_with('[') {
            // IPv6 literal
            raw.split(']').next().map(|s| &s[1..]).unwrap_or(raw)
        } else {
            raw.split(':').next().unwrap_or(raw)
        };
        Some(name.to_ascii_lowercase())
    }

    /// Scheme implied by the transport.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        parse_content_length(self.headers.get("content-length")?)
    }

    /// Returns the protocol name requested through `Connection: upgrade` and
    /// `Upgrade: <name>`, if any.
    pub fn upgrade_name(&self) -> Option<&str> {
        if !self.headers.has_token("connection", "upgrade") {
            return None;
        }
        self.headers
            .get("upgrade")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Returns the value of a cookie sent with the request.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all("cookie")
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }
}

/// A response under construction by the pipeline.
///
/// Once [`commit`](Response::commit) has been called (the processor does so
/// when it serializes the head), the response is frozen and further
/// mutation is ignored.
#[derive(Debug, Clone)]
pub struct Response {
    status: Status,
    reason: Option<String>,
    headers: Headers,
    body: BytesMut,
    committed: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: Status::OK,
            reason: None,
            headers: Headers::new(),
            body: BytesMut::new(),
            committed: false,
        }
    }

    /// Creates a response with the given status and no body.
    pub fn with_status(status: Status) -> Self {
        let mut response = Self::new();
        response.status = status;
        response
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason())
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Freezes the response.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    pub fn set_status(&mut self, status: Status) {
        if self.guard("status") {
            self.status = status;
            self.reason = None;
        }
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        if self.guard("reason") {
            self.reason = Some(reason.into());
        }
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.guard("header") {
            self.headers.set(name, value);
        }
    }

    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.guard("header") {
            self.headers.append(name, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        if self.guard("header") {
            self.headers.remove(name);
        }
    }

    /// Replaces the body.
    pub fn set_body(&mut self, body: impl AsRef<[u8]>) {
        if self.guard("body") {
            self.body.clear();
            self.body.extend_from_slice(body.as_ref());
        }
    }

    /// Appends to the body.
    pub fn write(&mut self, data: &[u8]) {
        if self.guard("body") {
            self.body.extend_from_slice(data);
        }
    }

    /// Clears status, headers and body of an uncommitted response.
    pub fn reset(&mut self) {
        if self.guard("reset") {
            self.status = Status::OK;
            self.reason = None;
            self.headers.clear();
            self.body.clear();
        }
    }

    /// Resets the response into an error page with a short text body.
    pub fn send_error(&mut self, status: Status) {
        self.reset();
        self.set_status(status);
        self.set_header("Content-Type", "text/plain; charset=utf-8");
        let text = format!("{}\n", status);
        self.set_body(text);
    }

    fn guard(&self, what: &str) -> bool {
        if self.committed {
            tracing::debug!("ignoring {} change on committed response", what);
            return false;
        }
        true
    }
}

/// Parses a `Content-Length` value: ASCII digits only, surrounding
/// whitespace allowed.
pub fn parse_content_length(value: &str) -> Option<usize> {
    let digits = value.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
