//! Message Prefix Codec
//!
//! Fixed-width header prepended to every frame on both transports.

use bytes::{Buf, BufMut};
use std::io;
use thiserror::Error;

/// Wire width of an encoded [`MessagePrefix`].
/// Channel (4) | Message Type (1) | Delivery Method (1) | Sequence (4)
pub const PREFIX_SIZE: usize = 4 + 1 + 1 + 4;

/// Message type carried in the prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Unknown = 0,
    ConnectionRequest = 1,
    ConnectionApproved = 2,
    ConnectionRejected = 3,
    Data = 4,
    ErrorMessage = 5,
}

impl MessageType {
    /// Decode a wire value. `Unknown` is a placeholder and never valid on the wire.
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::ConnectionRequest),
            2 => Some(MessageType::ConnectionApproved),
            3 => Some(MessageType::ConnectionRejected),
            4 => Some(MessageType::Data),
            5 => Some(MessageType::ErrorMessage),
            _ => None,
        }
    }
}

/// Transport actually used for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

/// Reliability/ordering contract requested for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryMethod {
    Unreliable = 0,
    UnreliableSequenced = 1,
    ReliableUnordered = 2,
    ReliableSequenced = 3,
    ReliableOrdered = 4,
}

impl DeliveryMethod {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeliveryMethod::Unreliable),
            1 => Some(DeliveryMethod::UnreliableSequenced),
            2 => Some(DeliveryMethod::ReliableUnordered),
            3 => Some(DeliveryMethod::ReliableSequenced),
            4 => Some(DeliveryMethod::ReliableOrdered),
            _ => None,
        }
    }

    /// Transport this delivery method is routed over
    pub fn transport(self) -> TransportKind {
        match self {
            DeliveryMethod::Unreliable | DeliveryMethod::UnreliableSequenced => {
                TransportKind::Udp
            }
            DeliveryMethod::ReliableUnordered
            | DeliveryMethod::ReliableSequenced
            | DeliveryMethod::ReliableOrdered => TransportKind::Tcp,
        }
    }

    pub fn is_reliable(self) -> bool {
        self.transport() == TransportKind::Tcp
    }
}

/// Header describing one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePrefix {
    pub channel: i32,
    pub message_type: MessageType,
    pub delivery_method: DeliveryMethod,
    pub sequence: u32,
}

impl MessagePrefix {
    pub fn new(
        channel: i32,
        message_type: MessageType,
        delivery_method: DeliveryMethod,
        sequence: u32,
    ) -> Self {
        MessagePrefix {
            channel,
            message_type,
            delivery_method,
            sequence,
        }
    }

    /// Prefix for a handshake control message (always reliable, channel 0)
    pub fn handshake(message_type: MessageType) -> Self {
        Self::new(0, message_type, DeliveryMethod::ReliableOrdered, 0)
    }

    pub fn encode(&self) -> [u8; PREFIX_SIZE] {
        let mut out = [0u8; PREFIX_SIZE];
        let mut buf = &mut out[..];
        self.put(&mut buf);
        out
    }

    pub fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.channel);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.delivery_method as u8);
        buf.put_u32_le(self.sequence);
    }

    /// Decode a prefix from the start of `bytes`. Trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < PREFIX_SIZE {
            return Err(FrameError::Incomplete(bytes.len()));
        }

        let mut buf = &bytes[..PREFIX_SIZE];
        let channel = buf.get_i32_le();
        let type_byte = buf.get_u8();
        let message_type =
            MessageType::from_wire(type_byte).ok_or(FrameError::UnknownMessageType(type_byte))?;
        let method_byte = buf.get_u8();
        let delivery_method = DeliveryMethod::from_wire(method_byte)
            .ok_or(FrameError::UnknownDeliveryMethod(method_byte))?;
        let sequence = buf.get_u32_le();

        Ok(MessagePrefix {
            channel,
            message_type,
            delivery_method,
            sequence,
        })
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame shorter than prefix: {0} bytes")]
    Incomplete(usize),
    #[error("Unknown message type: {0:#x}")]
    UnknownMessageType(u8),
    #[error("Unknown delivery method: {0:#x}")]
    UnknownDeliveryMethod(u8),
    #[error("Truncated frame: stream ended after {0} bytes without terminator")]
    Truncated(usize),
    #[error("Frame exceeds limit of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("Handshake protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },
    #[error("Malformed handshake payload")]
    MalformedHandshake,
    #[error(transparent)]
    Io(#[from] io::Error),
}
