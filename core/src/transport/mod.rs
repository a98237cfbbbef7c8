//! Transport Module
//!
//! Framing, sockets and background I/O for the peer service.

pub mod buffer_pool;
pub mod connection;
pub mod frame;
pub mod listener;
pub mod prefix;
pub mod sender;

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

// Re-exports for convenience
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use connection::{Connection, ConnectionStatus, PacingSignal};
pub use frame::TCP_TERMINATOR;
pub use listener::{Listener, ListenerConfig};
pub use prefix::{DeliveryMethod, FrameError, MessagePrefix, MessageType, TransportKind, PREFIX_SIZE};
pub use sender::{Dispatch, OutboundFrame, Sender, SenderConfig};

/// A fully decoded frame as it came off the wire
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub prefix: MessagePrefix,
    pub payload: Bytes,
    pub sender: SocketAddr,
    pub transport: TransportKind,
}

/// Outcome of one asynchronous send to one connection
#[derive(Debug)]
pub struct SendReport {
    pub connection: Arc<Connection>,
    pub message_type: MessageType,
    pub transport: TransportKind,
    pub result: Result<usize, TransportError>,
}

/// Items produced by the background I/O and consumed by the host tick
#[derive(Debug)]
pub enum Inbound {
    Frame(ReceivedMessage),
    Sent(SendReport),
}

/// Socket-level failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("Connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("{0:?} socket still busy after pacing timeout")]
    PacingTimeout(TransportKind),
    #[error("Connection {0} has been disposed")]
    Disposed(u64),
    #[error("Datagram of {size} bytes exceeds buffer size of {limit}")]
    DatagramTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Frame(#[from] FrameError),
}
