//! Binary relay framing.
//!
//! The relay protocol carries requests forwarded by a front-end proxy over a
//! persistent connection. Every unit is a packet:
//!
//! ```text
//! +---------+-------------+---------------------+
//! |  magic  | payload_len | payload             |
//! | 2 bytes |   2 bytes   | payload_len bytes   |
//! +---------+-------------+---------------------+
//! ```
//!
//! Inbound packets (proxy to server) use magic `0x12 0x34`, outbound packets
//! use `A` `B`. The first payload byte of a message packet is its type.
//! Strings are a `u16` length, the UTF-8 bytes and a `0x00` terminator;
//! length `0xFFFF` encodes an absent string.
//!
//! A forward-request is followed by raw body packets until `Content-Length`
//! bytes have arrived. Responses are a send-headers packet, body chunks and
//! an end-response packet.

use crate::error::ProtocolError;
use crate::headers::Headers;
use crate::message::{parse_content_length, Method, Request, Response, Status, Version};
use crate::processor::{Consumed, Processor, ProcessorFactory};
use crate::{DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_PACKET_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes of packets sent to the server.
pub const INBOUND_MAGIC: [u8; 2] = [0x12, 0x34];

/// Magic bytes of packets sent by the server: "AB".
pub const OUTBOUND_MAGIC: [u8; 2] = *b"AB";

/// Size of the packet header in bytes (2 magic + 2 length).
pub const PACKET_HEADER_SIZE: usize = 4;

pub const FORWARD_REQUEST: u8 = 0x02;
pub const SEND_BODY_CHUNK: u8 = 0x03;
pub const SEND_HEADERS: u8 = 0x04;
pub const END_RESPONSE: u8 = 0x05;
pub const PONG: u8 = 0x09;
pub const PING: u8 = 0x0A;

const ABSENT_STRING: u16 = 0xFFFF;

/// Packet direction, which selects the magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn magic(&self) -> [u8; 2] {
        match self {
            Direction::Inbound => INBOUND_MAGIC,
            Direction::Outbound => OUTBOUND_MAGIC,
        }
    }
}

/// A single relay packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub direction: Direction,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(direction: Direction, payload: impl Into<Bytes>) -> Self {
        Self {
            direction,
            payload: payload.into(),
        }
    }

    /// Encodes the packet into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len();
        if len > u16::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: u16::MAX as usize,
            });
        }
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + len);
        buf.put_slice(&self.direction.magic());
        buf.put_u16(len as u16);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a packet from bytes.
    ///
    /// Returns `Ok(Some(packet))` if a complete packet was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(
        buf: &mut BytesMut,
        direction: Direction,
        max_payload: usize,
    ) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1]];
        if magic != direction.magic() {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if len > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: max_payload,
            });
        }

        if buf.len() < PACKET_HEADER_SIZE + len {
            return Ok(None);
        }

        buf.advance(PACKET_HEADER_SIZE);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self { direction, payload }))
    }
}

/// Size limits for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Maximum packet payload, in bytes (at most 65535).
    pub max_packet_size: usize,
    /// Maximum assembled request body, in bytes.
    pub max_body_size: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl RelayLimits {
    fn packet_size(&self) -> usize {
        self.max_packet_size.clamp(8, u16::MAX as usize)
    }
}

/// Binary relay processor.
#[derive(Debug)]
pub struct RelayProcessor {
    limits: RelayLimits,
    pending: Option<Request>,
    remaining: usize,
    body: BytesMut,
    keep_alive: bool,
    head_request: bool,
}

impl RelayProcessor {
    pub fn new(limits: RelayLimits) -> Self {
        Self {
            limits,
            pending: None,
            remaining: 0,
            body: BytesMut::new(),
            keep_alive: true,
            head_request: false,
        }
    }

    fn take_body_packet(&mut self, payload: Bytes) -> Result<Option<Request>, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::bad(format!(
                "body ended {} bytes short of Content-Length",
                self.remaining
            )));
        }
        if payload.len() > self.remaining {
            return Err(ProtocolError::bad("body packet exceeds Content-Length"));
        }
        self.body.extend_from_slice(&payload);
        self.remaining -= payload.len();
        if self.remaining > 0 {
            return Ok(None);
        }
        let mut request = self
            .pending
            .take()
            .ok_or_else(|| ProtocolError::bad("body without a forward-request"))?;
        request.body = self.body.split().freeze();
        Ok(Some(request))
    }

    fn parse_forward_request(&mut self, mut payload: Bytes) -> Result<Request, ProtocolError> {
        let method = required_string(&mut payload, "method")?;
        let method =
            Method::from_token(&method).ok_or(ProtocolError::UnsupportedMethod(method))?;
        let path = required_string(&mut payload, "path")?;
        if !path.starts_with('/') {
            return Err(ProtocolError::bad(format!("invalid request path: {:?}", path)));
        }
        let query = get_string(&mut payload)?;
        let protocol = required_string(&mut payload, "protocol")?;
        let version =
            Version::from_token(&protocol).ok_or(ProtocolError::UnsupportedVersion(protocol))?;
        let remote_addr = get_string(&mut payload)?;
        let server_name = get_string(&mut payload)?;
        let secure = get_u8(&mut payload)? != 0;

        let count = get_u16(&mut payload)? as usize;
        let mut headers = Headers::with_capacity(count);
        for _ in 0..count {
            let name = required_string(&mut payload, "header name")?;
            let value = required_string(&mut payload, "header value")?;
            headers.append(name, value);
        }
        if payload.has_remaining() {
            return Err(ProtocolError::bad("trailing bytes after forward-request"));
        }
        if let Some(server_name) = server_name {
            if !headers.contains("host") {
                headers.append("Host", server_name);
            }
        }

        let mut request = Request::new(method, path);
        request.query = query;
        request.version = version;
        request.headers = headers;
        request.secure = secure;
        request.remote_addr = remote_addr.and_then(|a| a.parse().ok());

        self.head_request = method == Method::Head;
        Ok(request)
    }

    fn declared_length(&self, request: &Request) -> Result<usize, ProtocolError> {
        let Some(value) = request.headers.get("content-length") else {
            return Ok(0);
        };
        let len = parse_content_length(value)
            .ok_or_else(|| ProtocolError::bad(format!("invalid Content-Length: {:?}", value)))?;
        if len > self.limits.max_body_size {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: self.limits.max_body_size,
            });
        }
        Ok(len)
    }

    fn put_packet(&self, out: &mut BytesMut, payload: &[u8]) -> Result<(), ProtocolError> {
        let max = self.limits.packet_size();
        if payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        out.put_slice(&OUTBOUND_MAGIC);
        out.put_u16(payload.len() as u16);
        out.put_slice(payload);
        Ok(())
    }
}

impl Processor for RelayProcessor {
    fn protocol(&self) -> &'static str {
        "relay"
    }

    fn consume(&mut self, input: &mut BytesMut) -> Result<Consumed, ProtocolError> {
        loop {
            let Some(packet) =
                Packet::decode(input, Direction::Inbound, self.limits.packet_size())?
            else {
                return Ok(Consumed::NeedMore);
            };

            if self.pending.is_some() {
                if let Some(request) = self.take_body_packet(packet.payload)? {
                    return Ok(Consumed::Request(request));
                }
                continue;
            }

            let mut payload = packet.payload;
            if payload.is_empty() {
                return Err(ProtocolError::bad("empty message packet"));
            }
            match payload.get_u8() {
                FORWARD_REQUEST => {
                    let request = self.parse_forward_request(payload)?;
                    let len = self.declared_length(&request)?;
                    if len == 0 {
                        return Ok(Consumed::Request(request));
                    }
                    self.body.clear();
                    self.remaining = len;
                    self.pending = Some(request);
                }
                PING => {
                    let pong = Packet::new(Direction::Outbound, Bytes::from_static(&[PONG]));
                    return Ok(Consumed::Reply(pong.encode()?.freeze()));
                }
                other => {
                    return Err(ProtocolError::bad(format!(
                        "unexpected message type {:#04x}",
                        other
                    )))
                }
            }
        }
    }

    fn produce(
        &mut self,
        response: &mut Response,
        out: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        if self.pending.is_some() {
            self.keep_alive = false;
        }
        let status = response.status();
        let send_body = status.allows_body() && !self.head_request;

        let mut head = BytesMut::with_capacity(256);
        head.put_u8(SEND_HEADERS);
        head.put_u16(status.as_u16());
        put_string(&mut head, Some(response.reason()));
        let headers: Vec<(&str, &str)> = response
            .headers()
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("content-length")
                    && !name.eq_ignore_ascii_case("transfer-encoding")
            })
            .collect();
        let length = response.body().len().to_string();
        let count = headers.len() + usize::from(status.allows_body());
        head.put_u16(count as u16);
        for (name, value) in headers {
            put_string(&mut head, Some(name));
            put_string(&mut head, Some(value));
        }
        if status.allows_body() {
            put_string(&mut head, Some("Content-Length"));
            put_string(&mut head, Some(&length));
        }
        self.put_packet(out, &head)?;

        if send_body {
            // type + u16 length + terminator
            let chunk_size = self.limits.packet_size() - 4;
            let mut chunk = BytesMut::with_capacity(chunk_size + 4);
            for data in response.body().chunks(chunk_size) {
                chunk.clear();
                chunk.put_u8(SEND_BODY_CHUNK);
                chunk.put_u16(data.len() as u16);
                chunk.put_slice(data);
                chunk.put_u8(0);
                self.put_packet(out, &chunk)?;
            }
        }

        self.put_packet(out, &[END_RESPONSE, u8::from(self.keep_alive)])?;
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
        self.pending = None;
        self.remaining = 0;
        self.body.clear();
        self.keep_alive = true;
        self.head_request = false;
    }
}

/// Creates [`RelayProcessor`]s.
#[derive(Debug, Clone, Default)]
pub struct RelayProcessorFactory {
    limits: RelayLimits,
}

impl RelayProcessorFactory {
    pub fn new(limits: RelayLimits) -> Self {
        Self { limits }
    }
}

impl ProcessorFactory for RelayProcessorFactory {
    fn protocol(&self) -> &'static str {
        "relay"
    }

    fn create(&self) -> Box<dyn Processor> {
        Box::new(RelayProcessor::new(self.limits))
    }
}

/// A decoded outbound message, as seen by the proxy side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Headers {
        status: Status,
        reason: String,
        headers: Headers,
    },
    BodyChunk(Bytes),
    End {
        reuse: bool,
    },
    Pong,
}

/// Encodes a request as the inbound packets a proxy would send: one
/// forward-request followed by body packets of at most `max_packet_size`.
pub fn encode_forward_request(
    request: &Request,
    server_name: Option<&str>,
    max_packet_size: usize,
) -> Result<BytesMut, ProtocolError> {
    let mut payload = BytesMut::with_capacity(256);
    payload.put_u8(FORWARD_REQUEST);
    put_string(&mut payload, Some(request.method.as_str()));
    put_string(&mut payload, Some(&request.path));
    put_string(&mut payload, request.query.as_deref());
    put_string(&mut payload, Some(request.version.as_str()));
    let remote = request.remote_addr.map(|a| a.to_string());
    put_string(&mut payload, remote.as_deref());
    put_string(&mut payload, server_name);
    payload.put_u8(u8::from(request.secure));

    let has_length = request.headers.contains("content-length");
    let count = request.headers.len() + usize::from(!has_length && !request.body.is_empty());
    payload.put_u16(count as u16);
    for (name, value) in request.headers.iter() {
        put_string(&mut payload, Some(name));
        put_string(&mut payload, Some(value));
    }
    if !has_length && !request.body.is_empty() {
        put_string(&mut payload, Some("Content-Length"));
        put_string(&mut payload, Some(&request.body.len().to_string()));
    }

    let mut out = Packet::new(Direction::Inbound, payload.freeze()).encode()?;
    for chunk in request.body.chunks(max_packet_size.max(1)) {
        out.extend_from_slice(&Packet::new(Direction::Inbound, Bytes::copy_from_slice(chunk)).encode()?);
    }
    Ok(out)
}

/// Encodes an inbound ping packet.
pub fn encode_ping() -> BytesMut {
    let mut out = BytesMut::with_capacity(PACKET_HEADER_SIZE + 1);
    out.put_slice(&INBOUND_MAGIC);
    out.put_u16(1);
    out.put_u8(PING);
    out
}

/// Decodes the next outbound message from `buf`.
pub fn decode_message(buf: &mut BytesMut) -> Result<Option<RelayMessage>, ProtocolError> {
    let Some(packet) = Packet::decode(buf, Direction::Outbound, u16::MAX as usize)? else {
        return Ok(None);
    };
    let mut payload = packet.payload;
    let kind = get_u8(&mut payload)?;
    let message = match kind {
        SEND_HEADERS => {
            let code = get_u16(&mut payload)?;
            let status = Status::from_u16(code)
                .ok_or_else(|| ProtocolError::bad(format!("invalid status {}", code)))?;
            let reason = get_string(&mut payload)?.unwrap_or_default();
            let count = get_u16(&mut payload)? as usize;
            let mut headers = Headers::with_capacity(count);
            for _ in 0..count {
                let name = required_string(&mut payload, "header name")?;
                let value = required_string(&mut payload, "header value")?;
                headers.append(name, value);
            }
            RelayMessage::Headers {
                status,
                reason,
                headers,
            }
        }
        SEND_BODY_CHUNK => {
            let len = get_u16(&mut payload)? as usize;
            if payload.remaining() < len + 1 {
                return Err(ProtocolError::bad("truncated body chunk"));
            }
            let data = payload.split_to(len);
            RelayMessage::BodyChunk(data)
        }
        END_RESPONSE => RelayMessage::End {
            reuse: get_u8(&mut payload)? != 0,
        },
        PONG => RelayMessage::Pong,
        other => {
            return Err(ProtocolError::bad(format!(
                "unexpected message type {:#04x}",
                other
            )))
        }
    };
    Ok(Some(message))
}

fn put_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        None => buf.put_u16(ABSENT_STRING),
        Some(s) => {
            // Longer strings cannot be represented and are truncated at a
            // char boundary.
            let mut end = s.len().min(ABSENT_STRING as usize - 1);
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            buf.put_u16(end as u16);
            buf.put_slice(&s.as_bytes()[..end]);
            buf.put_u8(0);
        }
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::bad("truncated packet"));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::bad("truncated packet"));
    }
    Ok(buf.get_u16())
}

fn get_string(buf: &mut Bytes) -> Result<Option<String>, ProtocolError> {
    let len = get_u16(buf)?;
    if len == ABSENT_STRING {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len + 1 {
        return Err(ProtocolError::bad("truncated string"));
    }
    let bytes = buf.split_to(len);
    if buf.get_u8() != 0 {
        return Err(ProtocolError::bad("string missing terminator"));
    }
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| ProtocolError::bad("string is not valid UTF-8"))
}

fn required_string(buf: &mut Bytes, field: &str) -> Result<String, ProtocolError> {
    get_string(buf)?.ok_or_else(|| ProtocolError::bad(format!("missing {}", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> RelayProcessor {
        RelayProcessor::new(RelayLimits::default())
    }

    fn forward(request: &Request) -> BytesMut {
        encode_forward_request(request, Some("backend.local"), 1024).unwrap()
    }

    #[test]
    fn test_packet_decode_incomplete() {
        let mut buf = BytesMut::from(&[0x12, 0x34, 0x00][..]);
        assert!(Packet::decode(&mut buf, Direction::Inbound, 100)
            .unwrap()
            .is_none());

        let mut buf = BytesMut::from(&[0x12, 0x34, 0x00, 0x03, 0x01][..]);
        assert!(Packet::decode(&mut buf, Direction::Inbound, 100)
            .unwrap()
            .is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_packet_invalid_magic() {
        let mut buf = BytesMut::from(&[0xde, 0xad, 0x00, 0x00][..]);
        assert!(matches!(
            Packet::decode(&mut buf, Direction::Inbound, 100),
            Err(ProtocolError::InvalidMagic([0xde, 0xad]))
        ));
    }

    #[test]
    fn test_packet_too_large() {
        let mut buf = BytesMut::from(&[0x12, 0x34, 0x01, 0x00][..]);
        assert!(matches!(
            Packet::decode(&mut buf, Direction::Inbound, 128),
            Err(ProtocolError::PayloadTooLarge { size: 256, max: 128 })
        ));
    }

    #[test]
    fn test_forward_request_without_body() {
        let request = Request::new(Method::Get, "/shop/cart")
            .with_header("Accept", "text/html")
            .with_header("accept", "*/*");
        let mut buf = forward(&request);
        let mut p = processor();

        let Consumed::Request(decoded) = p.consume(&mut buf).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(decoded.method, Method::Get);
        assert_eq!(decoded.path, "/shop/cart");
        assert_eq!(decoded.host().as_deref(), Some("backend.local"));
        assert_eq!(
            decoded.headers.get_all("ACCEPT").collect::<Vec<_>>(),
            vec!["text/html", "*/*"]
        );
        assert!(buf.is_empty());
        assert!(p.keep_alive());
    }

    #[test]
    fn test_forward_request_with_body_packets() {
        let mut request = Request::new(Method::Post, "/upload").with_body("0123456789");
        request.query = Some("x=1".into());
        request.secure = true;
        let mut encoded = encode_forward_request(&request, None, 4).unwrap();
        let mut p = processor();

        // Feed one byte at a time.
        let mut buf = BytesMut::new();
        let mut result = None;
        while !encoded.is_empty() {
            buf.extend_from_slice(&encoded.split_to(1));
            if let Consumed::Request(r) = p.consume(&mut buf).unwrap() {
                result = Some(r);
            }
        }
        let decoded = result.unwrap();
        assert_eq!(&decoded.body[..], b"0123456789");
        assert_eq!(decoded.query.as_deref(), Some("x=1"));
        assert!(decoded.secure);
    }

    #[test]
    fn test_ping_reply() {
        let mut buf = encode_ping();
        let mut p = processor();
        let Consumed::Reply(bytes) = p.consume(&mut buf).unwrap() else {
            panic!("expected pong");
        };
        let mut out = BytesMut::from(&bytes[..]);
        assert_eq!(decode_message(&mut out).unwrap(), Some(RelayMessage::Pong));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = Packet::new(Direction::Inbound, Bytes::from_static(&[0x7f]))
            .encode()
            .unwrap();
        assert!(matches!(
            processor().consume(&mut buf),
            Err(ProtocolError::BadFraming(_))
        ));
    }

    #[test]
    fn test_body_exceeding_limit() {
        let request = Request::new(Method::Post, "/").with_header("Content-Length", "100");
        let mut buf = forward(&request);
        let mut p = RelayProcessor::new(RelayLimits {
            max_packet_size: 1024,
            max_body_size: 10,
        });
        assert!(matches!(
            p.consume(&mut buf),
            Err(ProtocolError::PayloadTooLarge { size: 100, max: 10 })
        ));
    }

    #[test]
    fn test_signed_content_length_rejected() {
        let request = Request::new(Method::Post, "/").with_header("Content-Length", "+5");
        let mut buf = forward(&request);
        assert!(matches!(
            processor().consume(&mut buf),
            Err(ProtocolError::BadFraming(_))
        ));
    }

    #[test]
    fn test_early_end_of_body() {
        let request = Request::new(Method::Post, "/").with_header("Content-Length", "5");
        let mut buf = forward(&request);
        buf.extend_from_slice(&Packet::new(Direction::Inbound, Bytes::new()).encode().unwrap());
        assert!(matches!(
            processor().consume(&mut buf),
            Err(ProtocolError::BadFraming(_))
        ));
    }

    #[test]
    fn test_produce_response_messages() {
        let mut p = RelayProcessor::new(RelayLimits {
            max_packet_size: 16,
            max_body_size: 1024,
        });
        let mut response = Response::new();
        response.set_header("X-Id", "7");
        response.set_body("abcdefghijklmnopqrstuvwxyz");
        let mut out = BytesMut::new();
        // the header packet cannot fit in 16 bytes
        assert!(p.produce(&mut response, &mut out).is_err());

        let mut p = RelayProcessor::new(RelayLimits {
            max_packet_size: 64,
            max_body_size: 1024,
        });
        let mut response = Response::new();
        response.set_header("X-Id", "7");
        response.set_body("a".repeat(100));
        let mut out = BytesMut::new();
        p.produce(&mut response, &mut out).unwrap();

        let Some(RelayMessage::Headers {
            status, headers, ..
        }) = decode_message(&mut out).unwrap()
        else {
            panic!("expected headers");
        };
        assert_eq!(status, Status::OK);
        assert_eq!(headers.get("x-id"), Some("7"));
        assert_eq!(headers.get("content-length"), Some("100"));

        let mut body = Vec::new();
        loop {
            match decode_message(&mut out).unwrap() {
                Some(RelayMessage::BodyChunk(data)) => {
                    assert!(data.len() <= 60);
                    body.extend_from_slice(&data);
                }
                Some(RelayMessage::End { reuse }) => {
                    assert!(reuse);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(body.len(), 100);
        assert!(out.is_empty());
    }

    #[test]
    fn test_produce_with_unread_body_closes() {
        let request = Request::new(Method::Post, "/").with_header("Content-Length", "5");
        let mut buf = forward(&request);
        let mut p = processor();
        assert!(matches!(p.consume(&mut buf).unwrap(), Consumed::NeedMore));

        let mut response = Response::with_status(Status::FORBIDDEN);
        let mut out = BytesMut::new();
        p.produce(&mut response, &mut out).unwrap();
        assert!(!p.keep_alive());

        let mut last = None;
        while let Some(message) = decode_message(&mut out).unwrap() {
            last = Some(message);
        }
        assert_eq!(last, Some(RelayMessage::End { reuse: false }));
    }

    #[test]
    fn test_recycle_resets() {
        let request = Request::new(Method::Post, "/").with_header("Content-Length", "5");
        let mut buf = forward(&request);
        let mut p = processor();
        p.consume(&mut buf).unwrap();
        p.force_close();
        p.recycle();
        assert!(p.keep_alive());
        assert!(p.pending.is_none());
        assert_eq!(p.remaining, 0);
    }

    proptest::proptest! {
        #[test]
        fn test_arbitrary_input_never_panics(data in proptest::collection::vec(proptest::num::u8::ANY, 0..512)) {
            let mut buf = BytesMut::from(&data[..]);
            let mut p = processor();
            for _ in 0..8 {
                match p.consume(&mut buf) {
                    Ok(Consumed::NeedMore) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    }
}
