//! PeerLink Handshake Payloads
//!
//! Byte layout of the payloads carried by the three handshake message types.
//! Both carry the sender's listening port, since replies travel over a fresh
//! connection and the source port of the incoming stream is ephemeral.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::transport::FrameError;

/// Handshake Protocol Version (increment when changing the payload format)
pub const PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + 2;

/// Payload of a `ConnectionRequest`
/// [VERSION:u8][LISTEN_PORT:u16][DATA:bytes]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub listen_port: u16,
    pub data: Bytes,
}

impl HandshakeRequest {
    pub fn new(listen_port: u16, data: Bytes) -> Self {
        Self { listen_port, data }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16_le(self.listen_port);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, FrameError> {
        let listen_port = read_header(&mut payload)?;
        Ok(Self {
            listen_port,
            data: payload,
        })
    }
}

/// Payload of a `ConnectionApproved` or `ConnectionRejected`
/// [VERSION:u8][LISTEN_PORT:u16][REASON:utf8]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub listen_port: u16,
    pub reason: String,
}

impl HandshakeReply {
    pub fn approved(listen_port: u16) -> Self {
        Self {
            listen_port,
            reason: String::new(),
        }
    }

    pub fn rejected(listen_port: u16, reason: &str) -> Self {
        Self {
            listen_port,
            reason: reason.to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let reason = self.reason.as_bytes();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + reason.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16_le(self.listen_port);
        buf.put_slice(reason);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, FrameError> {
        let listen_port = read_header(&mut payload)?;
        let reason = String::from_utf8_lossy(&payload).to_string();
        Ok(Self {
            listen_port,
            reason,
        })
    }
}

fn read_header(payload: &mut Bytes) -> Result<u16, FrameError> {
    if payload.remaining() < HEADER_LEN {
        return Err(FrameError::MalformedHandshake);
    }

    let version = payload.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(FrameError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }
    Ok(payload.get_u16_le())
}
