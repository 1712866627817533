//! Per-connection protocol state machine.

use crate::error::ProtocolError;
use crate::message::{Request, Response};
use bytes::{Bytes, BytesMut};

/// Outcome of feeding buffered bytes to a [`Processor`].
#[derive(Debug)]
pub enum Consumed {
    /// The buffered bytes do not yet form a complete unit.
    NeedMore,
    /// A complete request was framed. Bytes after it stay in the buffer.
    Request(Request),
    /// Bytes to write straight back to the peer without involving the
    /// pipeline (interim `100 Continue`, relay pong).
    Reply(Bytes),
}

/// A protocol framing state machine bound to one connection at a time.
///
/// Processors are pooled by the endpoint: after [`recycle`](Processor::recycle)
/// a processor must hold no state from the previous connection.
pub trait Processor: Send {
    /// Short protocol name, used in logs and metrics.
    fn protocol(&self) -> &'static str;

    /// Frames as much of `input` as possible. Consumed bytes are removed from
    /// `input`; leftover bytes belong to the next unit.
    fn consume(&mut self, input: &mut BytesMut) -> Result<Consumed, ProtocolError>;

    /// Serializes `response` (for the most recently consumed request) into
    /// `out` and commits it.
    fn produce(&mut self, response: &mut Response, out: &mut BytesMut)
        -> Result<(), ProtocolError>;

    /// Whether the connection stays open after the last produced response.
    fn keep_alive(&self) -> bool;

    /// Forces the next produced response to close the connection.
    fn force_close(&mut self);

    /// Returns the protocol the peer asked to switch to, if any.
    fn upgrade_name<'r>(&self, request: &'r Request) -> Option<&'r str> {
        request.upgrade_name()
    }

    /// Clears all per-connection state before the processor is pooled.
    fn recycle(&mut self);
}

/// Creates processors for one protocol.
pub trait ProcessorFactory: Send + Sync {
    fn protocol(&self) -> &'static str;

    fn create(&self) -> Box<dyn Processor>;
}
