//! PeerLink Core Library
//! Peer-to-peer message transport over TCP and UDP

pub mod config;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod service;
pub mod transport;

pub use config::ServiceConfig;
pub use service::{ConnectionRequest, OutgoingMessage, Service, ServiceEvent};
pub use transport::{Connection, ConnectionStatus, DeliveryMethod, MessageType, TransportError};

/// Initialize the core library (logging)
pub fn init() {
    // The host may call init more than once; an already installed subscriber is kept.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("PeerLink Core Initialized (logger ready)");
}
