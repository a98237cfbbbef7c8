//! Service Configuration

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::transport::{ListenerConfig, SenderConfig};

/// Size of one pooled buffer; also the largest datagram that can be sent
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Largest TCP frame a listener will reassemble
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Configuration for a [`Service`](crate::service::Service)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Local address both listeners bind to
    pub bind_address: IpAddr,
    /// Shared TCP/UDP port; 0 picks a free one
    pub port: u16,
    pub buffer_size: usize,
    pub initial_buffers: usize,
    pub max_frame_size: usize,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for a busy socket before a send fails
    pub pacing_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Runtime worker threads running the async sends
    pub send_workers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            initial_buffers: 8,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            pacing_timeout_ms: 1_000,
            poll_interval_ms: 200,
            send_workers: 2,
        }
    }
}

impl ServiceConfig {
    pub fn new(bind_address: IpAddr, port: u16) -> Self {
        ServiceConfig {
            bind_address,
            port,
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub(crate) fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_frame_size: self.max_frame_size,
        }
    }

    pub(crate) fn sender(&self) -> SenderConfig {
        SenderConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            pacing_timeout: Duration::from_millis(self.pacing_timeout_ms),
        }
    }
}
