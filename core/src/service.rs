//! Peer Service
//!
//! Owns the registry, both listeners, the inbox and the outbox. The host calls
//! [`Service::update`] once per tick to flush the outbox and
//! [`Service::poll_events`] to collect what arrived since the last tick.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;

use crate::config::ServiceConfig;
use crate::protocol::{HandshakeReply, HandshakeRequest};
use crate::queue::MessageQueue;
use crate::registry::ConnectionRegistry;
use crate::transport::{
    BufferPool, Connection, ConnectionStatus, DeliveryMethod, Dispatch, Inbound, Listener,
    MessagePrefix, MessageType, OutboundFrame, ReceivedMessage, SendReport, Sender,
    TransportError, TransportKind,
};

/// Application message handed to [`Service::send`]
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub channel: i32,
    pub delivery_method: DeliveryMethod,
    /// `None` takes the next sequence number of the channel
    pub sequence: Option<u32>,
    pub payload: Bytes,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Bytes>, delivery_method: DeliveryMethod) -> Self {
        OutgoingMessage {
            channel: 0,
            delivery_method,
            sequence: None,
            payload: payload.into(),
        }
    }

    pub fn with_channel(mut self, channel: i32) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// A frame waiting in the outbox together with its recipients
#[derive(Debug)]
pub struct OutboxEntry {
    pub frame: OutboundFrame,
    pub targets: Vec<Arc<Connection>>,
}

/// Events delivered to the host by [`Service::poll_events`]
#[derive(Debug)]
pub enum ServiceEvent {
    /// A peer wants to connect; answer with `approve` or `reject`
    ConnectionRequest(ConnectionRequest),
    StatusChanged {
        connection: Arc<Connection>,
        status: ConnectionStatus,
        /// Rejection reason or the error that made the peer unreachable
        reason: Option<String>,
    },
    Data(ReceivedMessage),
    /// An `ErrorMessage` frame sent by a peer
    PeerError(ReceivedMessage),
    SendCompleted {
        connection: Arc<Connection>,
        message_type: MessageType,
        transport: TransportKind,
        bytes: usize,
    },
    SendFailed {
        connection: Arc<Connection>,
        message_type: MessageType,
        transport: TransportKind,
        error: TransportError,
    },
}

/// State reachable from both the service and pending connection requests
struct Shared {
    registry: ConnectionRegistry,
    outbox: Arc<MessageQueue<OutboxEntry>>,
    local_port: u16,
}

impl Shared {
    fn approve(&self, connection: &Arc<Connection>) -> bool {
        if !connection.mark_connected() {
            return false;
        }

        self.registry.add_connection(connection.clone());
        self.outbox.push(OutboxEntry {
            frame: OutboundFrame {
                prefix: MessagePrefix::handshake(MessageType::ConnectionApproved),
                payload: HandshakeReply::approved(self.local_port).encode(),
            },
            targets: vec![connection.clone()],
        });
        true
    }
}

/// Incoming connection request awaiting the host's verdict
pub struct ConnectionRequest {
    connection: Arc<Connection>,
    data: Bytes,
    shared: Arc<Shared>,
}

impl ConnectionRequest {
    /// Reciprocal connection to the requesting peer
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Initial payload supplied by the peer's `connect`
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Accept the peer. Returns false if a verdict was already given.
    pub fn approve(&self) -> bool {
        self.shared.approve(&self.connection)
    }

    /// Refuse the peer and tell it why. Returns false if a verdict was already given.
    pub fn reject(&self, reason: &str) -> bool {
        self.shared.registry.reject_connection(&self.connection, reason)
    }
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("connection", &self.connection)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Main transport controller
pub struct Service {
    shared: Arc<Shared>,
    inbox: Arc<MessageQueue<Inbound>>,
    sender: Sender,
    tcp_listener: Listener,
    udp_listener: Listener,
    sequences: Mutex<HashMap<i32, u32>>,
    runtime: Option<Runtime>,
}

impl Service {
    /// Listen on `address:port` with default settings
    pub fn listen(address: &str, port: u16) -> Result<Self, TransportError> {
        let ip: IpAddr = address.parse().map_err(|_| TransportError::Resolve {
            host: address.to_string(),
            port,
        })?;
        Self::new(ServiceConfig::new(ip, port))
    }

    /// Bind both listeners and start the send runtime
    pub fn new(config: ServiceConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.send_workers.max(1))
            .thread_name("peerlink-send")
            .enable_all()
            .build()?;

        let pool = BufferPool::new(config.buffer_size, config.initial_buffers);
        let inbox = Arc::new(MessageQueue::new());
        let outbox = Arc::new(MessageQueue::new());

        let tcp_listener = Listener::tcp(
            config.bind_addr(),
            pool.clone(),
            inbox.clone(),
            config.listener(),
        )?;
        // Port 0 resolves on the TCP bind; UDP shares whatever port TCP got.
        let local_addr = tcp_listener.local_addr();
        let udp_listener = Listener::udp(local_addr, pool.clone(), inbox.clone(), config.listener())?;

        let sender = Sender::new(
            runtime.handle().clone(),
            pool,
            inbox.clone(),
            config.sender(),
        );

        tracing::info!("Service listening on {} (tcp+udp)", local_addr);

        Ok(Service {
            shared: Arc::new(Shared {
                registry: ConnectionRegistry::new(outbox.clone(), local_addr.port()),
                outbox,
                local_port: local_addr.port(),
            }),
            inbox,
            sender,
            tcp_listener,
            udp_listener,
            sequences: Mutex::new(HashMap::new()),
            runtime: Some(runtime),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.tcp_listener.local_addr()
    }

    /// Start a handshake with `host:port`.
    ///
    /// Returns immediately with a connection in `InitiatedConnect`; the request
    /// itself goes out on the next [`update`](Self::update).
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        data: impl Into<Bytes>,
    ) -> Result<Arc<Connection>, TransportError> {
        let resolve_error = || TransportError::Resolve {
            host: host.to_string(),
            port,
        };
        let endpoint = (host, port)
            .to_socket_addrs()
            .map_err(|_| resolve_error())?
            .next()
            .ok_or_else(resolve_error)?;

        let connection = Arc::new(Connection::new(host, port, endpoint));
        connection.begin_connect();
        self.shared.registry.track_pending(connection.clone());

        self.shared.outbox.push(OutboxEntry {
            frame: OutboundFrame {
                prefix: MessagePrefix::handshake(MessageType::ConnectionRequest),
                payload: HandshakeRequest::new(self.shared.local_port, data.into()).encode(),
            },
            targets: vec![connection.clone()],
        });

        tracing::info!("Connecting to {}:{} ({})", host, port, endpoint);
        Ok(connection)
    }

    /// Queue a data message; `None` targets every registered connection
    pub fn send(&self, message: OutgoingMessage, targets: Option<&[Arc<Connection>]>) {
        let targets = match targets {
            Some(targets) => targets.to_vec(),
            None => self.shared.registry.get_connections(),
        };
        if targets.is_empty() {
            tracing::debug!("Dropping message on channel {}: no targets", message.channel);
            return;
        }

        let sequence = message
            .sequence
            .unwrap_or_else(|| self.next_sequence(message.channel));
        let prefix = MessagePrefix::new(
            message.channel,
            MessageType::Data,
            message.delivery_method,
            sequence,
        );

        self.shared.outbox.push(OutboxEntry {
            frame: OutboundFrame {
                prefix,
                payload: message.payload,
            },
            targets,
        });
    }

    /// Allocate the next sequence number of `channel`
    pub fn next_sequence(&self, channel: i32) -> u32 {
        let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
        let next = sequences.entry(channel).or_insert(0);
        let current = *next;
        *next = next.wrapping_add(1);
        current
    }

    /// Snapshot of the approved connections
    pub fn get_connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.get_connections()
    }

    /// Forget a connection and release its sockets
    pub fn disconnect(&self, connection: &Arc<Connection>) {
        self.shared.registry.remove_connection(connection);
        connection.dispose();
    }

    /// Dispatch everything queued in the outbox so far. Returns the number of entries sent.
    pub fn update(&self) -> usize {
        self.dispatch_pending(&self.sender)
    }

    fn dispatch_pending<D: Dispatch>(&self, dispatch: &D) -> usize {
        let entries = self.shared.outbox.drain();
        let count = entries.len();
        for entry in entries {
            dispatch_entry(entry, dispatch);
        }
        count
    }

    /// Drain the inbox, applying handshake frames, and return the host-facing events
    pub fn poll_events(&self) -> Vec<ServiceEvent> {
        let mut events = Vec::new();
        for item in self.inbox.drain() {
            match item {
                Inbound::Frame(message) => self.handle_frame(message, &mut events),
                Inbound::Sent(report) => self.handle_report(report, &mut events),
            }
        }
        events
    }

    fn handle_frame(&self, message: ReceivedMessage, events: &mut Vec<ServiceEvent>) {
        let registry = &self.shared.registry;

        match message.prefix.message_type {
            MessageType::ConnectionRequest => {
                let request = match HandshakeRequest::decode(message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!("Dropping connection request from {}: {}", message.sender, e);
                        return;
                    }
                };

                let endpoint = SocketAddr::new(message.sender.ip(), request.listen_port);
                let connection = Arc::new(Connection::incoming(endpoint));
                tracing::info!("Connection request from {}", endpoint);
                events.push(ServiceEvent::ConnectionRequest(ConnectionRequest {
                    connection,
                    data: request.data,
                    shared: self.shared.clone(),
                }));
            }
            MessageType::ConnectionApproved => {
                let Some(reply) = decode_reply(&message) else {
                    return;
                };
                let endpoint = SocketAddr::new(message.sender.ip(), reply.listen_port);
                let Some(connection) = registry.take_pending(endpoint) else {
                    tracing::warn!("Approval from {} matches no pending connection", endpoint);
                    return;
                };

                if connection.mark_connected() {
                    registry.add_connection(connection.clone());
                    tracing::info!("Connection to {} approved", endpoint);
                    events.push(ServiceEvent::StatusChanged {
                        connection,
                        status: ConnectionStatus::Connected,
                        reason: None,
                    });
                }
            }
            MessageType::ConnectionRejected => {
                let Some(reply) = decode_reply(&message) else {
                    return;
                };
                let endpoint = SocketAddr::new(message.sender.ip(), reply.listen_port);
                // An approved connection is final; only a pending request can be refused.
                let Some(connection) = registry.take_pending(endpoint) else {
                    tracing::warn!("Rejection from {} matches no pending connection", endpoint);
                    return;
                };

                if connection.mark_rejected() {
                    tracing::info!("Connection to {} rejected: {}", endpoint, reply.reason);
                    events.push(ServiceEvent::StatusChanged {
                        connection,
                        status: ConnectionStatus::Rejected,
                        reason: Some(reply.reason),
                    });
                }
            }
            MessageType::Data => events.push(ServiceEvent::Data(message)),
            MessageType::ErrorMessage => events.push(ServiceEvent::PeerError(message)),
            MessageType::Unknown => {
                tracing::warn!("Dropping frame of unknown type from {}", message.sender);
            }
        }
    }

    fn handle_report(&self, report: SendReport, events: &mut Vec<ServiceEvent>) {
        let SendReport {
            connection,
            message_type,
            transport,
            result,
        } = report;

        match result {
            Ok(bytes) => events.push(ServiceEvent::SendCompleted {
                connection,
                message_type,
                transport,
                bytes,
            }),
            Err(error) => {
                // A request that never reached the peer leaves nothing to wait for.
                if message_type == MessageType::ConnectionRequest && connection.mark_unreachable() {
                    self.shared.registry.remove_connection(&connection);
                    events.push(ServiceEvent::StatusChanged {
                        connection: connection.clone(),
                        status: ConnectionStatus::Disconnected,
                        reason: Some(error.to_string()),
                    });
                }
                events.push(ServiceEvent::SendFailed {
                    connection,
                    message_type,
                    transport,
                    error,
                });
            }
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.tcp_listener.stop();
        self.udp_listener.stop();

        for connection in self.shared.registry.clear() {
            connection.dispose();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        tracing::info!("Service on {} shut down", self.tcp_listener.local_addr());
    }
}

fn decode_reply(message: &ReceivedMessage) -> Option<HandshakeReply> {
    match HandshakeReply::decode(message.payload.clone()) {
        Ok(reply) => Some(reply),
        Err(e) => {
            tracing::warn!(
                "Dropping {:?} from {}: {}",
                message.prefix.message_type,
                message.sender,
                e
            );
            None
        }
    }
}

/// Route one outbox entry by its delivery method
pub fn dispatch_entry<D: Dispatch + ?Sized>(entry: OutboxEntry, dispatch: &D) {
    let OutboxEntry { frame, targets } = entry;
    match frame.prefix.delivery_method.transport() {
        TransportKind::Tcp => {
            for connection in targets {
                dispatch.send_reliable(frame.clone(), connection);
            }
        }
        TransportKind::Udp => dispatch.send_unreliable(frame, targets),
    }
}
