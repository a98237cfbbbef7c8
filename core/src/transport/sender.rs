//! Outbound path
//!
//! Turns an outbound frame into TCP or UDP writes. Every write runs as a task
//! on the service runtime and reports its outcome to the inbox.

use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;

use super::buffer_pool::BufferPool;
use super::connection::Connection;
use super::frame::{encode_frame, encoded_len};
use super::prefix::{MessagePrefix, TransportKind};
use super::{Inbound, SendReport, TransportError};
use crate::queue::MessageQueue;

/// Prefix and payload waiting to be written
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub prefix: MessagePrefix,
    pub payload: Bytes,
}

/// Seam between routing and socket I/O
pub trait Dispatch {
    /// Write one frame to one connection over TCP
    fn send_reliable(&self, frame: OutboundFrame, connection: Arc<Connection>);

    /// Write one datagram to each connection over UDP
    fn send_unreliable(&self, frame: OutboundFrame, connections: Vec<Arc<Connection>>);
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub connect_timeout: Duration,
    pub pacing_timeout: Duration,
}

/// Socket-backed [`Dispatch`]
pub struct Sender {
    runtime: Handle,
    pool: Arc<BufferPool>,
    inbox: Arc<MessageQueue<Inbound>>,
    config: SenderConfig,
}

impl Sender {
    pub fn new(
        runtime: Handle,
        pool: Arc<BufferPool>,
        inbox: Arc<MessageQueue<Inbound>>,
        config: SenderConfig,
    ) -> Self {
        Sender {
            runtime,
            pool,
            inbox,
            config,
        }
    }
}

impl Dispatch for Sender {
    fn send_reliable(&self, frame: OutboundFrame, connection: Arc<Connection>) {
        let inbox = self.inbox.clone();
        let config = self.config.clone();

        self.runtime.spawn(async move {
            let result = write_stream(&connection, &frame, &config).await;
            report(&inbox, connection, &frame, TransportKind::Tcp, result);
        });
    }

    fn send_unreliable(&self, frame: OutboundFrame, connections: Vec<Arc<Connection>>) {
        for connection in connections {
            let inbox = self.inbox.clone();
            let pool = self.pool.clone();
            let pacing_timeout = self.config.pacing_timeout;
            let frame = frame.clone();

            self.runtime.spawn(async move {
                let result = write_datagram(&connection, &frame, &pool, pacing_timeout).await;
                report(&inbox, connection, &frame, TransportKind::Udp, result);
            });
        }
    }
}

/// Connect (unless a stream is already open), write the frame, close the stream
async fn write_stream(
    connection: &Connection,
    frame: &OutboundFrame,
    config: &SenderConfig,
) -> Result<usize, TransportError> {
    // Reliable frames queue behind each other instead of timing out.
    let _pacing = connection
        .pacing(TransportKind::Tcp)
        .wait()
        .await
        .ok_or(TransportError::Disposed(connection.id()))?;
    let mut slot = connection.tcp_slot().await?;

    let stream = match slot.take() {
        Some(stream) => stream,
        None => connect(connection.endpoint(), config.connect_timeout).await?,
    };
    let stream = slot.insert(stream);

    let mut wire = BytesMut::with_capacity(encoded_len(frame.payload.len(), TransportKind::Tcp));
    encode_frame(&frame.prefix, &frame.payload, TransportKind::Tcp, &mut wire);
    let written: std::io::Result<()> = async {
        stream.write_all(&wire).await?;
        stream.flush().await
    }
    .await;

    // One frame per stream: the receiver treats end-of-stream as end-of-frame.
    if let Some(mut stream) = slot.take() {
        if let Err(e) = stream.shutdown().await {
            tracing::trace!("Shutdown of stream to {} failed: {}", connection.endpoint(), e);
        }
    }

    written?;
    Ok(wire.len())
}

async fn connect(endpoint: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| TransportError::ConnectTimeout(endpoint))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Wait for the UDP socket to go idle, then send the frame as one datagram
async fn write_datagram(
    connection: &Connection,
    frame: &OutboundFrame,
    pool: &Arc<BufferPool>,
    pacing_timeout: Duration,
) -> Result<usize, TransportError> {
    let size = encoded_len(frame.payload.len(), TransportKind::Udp);
    if size > pool.buf_size() {
        return Err(TransportError::DatagramTooLarge {
            size,
            limit: pool.buf_size(),
        });
    }

    let _pacing = connection
        .pacing(TransportKind::Udp)
        .acquire(pacing_timeout)
        .await
        .ok_or_else(|| {
            if connection.is_disposed() {
                TransportError::Disposed(connection.id())
            } else {
                TransportError::PacingTimeout(TransportKind::Udp)
            }
        })?;
    let mut slot = connection.udp_slot().await?;

    let socket = match slot.take() {
        Some(socket) => socket,
        None => UdpSocket::bind(unspecified_for(connection.endpoint())).await?,
    };
    let socket = slot.insert(socket);

    let mut buf = pool.get();
    let wire = buf.as_vec_mut();
    wire.clear();
    encode_frame(&frame.prefix, &frame.payload, TransportKind::Udp, wire);
    let sent = socket.send_to(&wire[..], connection.endpoint()).await;

    if connection.is_disposed() {
        slot.take();
    }

    Ok(sent?)
}

fn unspecified_for(endpoint: SocketAddr) -> SocketAddr {
    let ip = match endpoint {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

fn report(
    inbox: &MessageQueue<Inbound>,
    connection: Arc<Connection>,
    frame: &OutboundFrame,
    transport: TransportKind,
    result: Result<usize, TransportError>,
) {
    match &result {
        Ok(bytes) => tracing::debug!(
            "Sent {} bytes ({:?}, {:?}) to {}",
            bytes,
            frame.prefix.message_type,
            transport,
            connection.endpoint()
        ),
        Err(e) => tracing::warn!(
            "Failed to send {:?} over {:?} to {}: {}",
            frame.prefix.message_type,
            transport,
            connection.endpoint(),
            e
        ),
    }

    inbox.push(Inbound::Sent(SendReport {
        connection,
        message_type: frame.prefix.message_type,
        transport,
        result,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{decode_frame, read_stream_frame};
    use crate::transport::prefix::{DeliveryMethod, MessageType};
    use std::net::{TcpListener, UdpSocket as StdUdpSocket};
    use std::thread;
    use std::time::Instant;

    struct Fixture {
        runtime: tokio::runtime::Runtime,
        pool: Arc<BufferPool>,
        inbox: Arc<MessageQueue<Inbound>>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                runtime: tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .build()
                    .unwrap(),
                pool: BufferPool::new(256, 2),
                inbox: Arc::new(MessageQueue::new()),
            }
        }

        fn sender(&self) -> Sender {
            self.sender_with_pacing(Duration::from_millis(500))
        }

        fn sender_with_pacing(&self, pacing_timeout: Duration) -> Sender {
            Sender::new(
                self.runtime.handle().clone(),
                self.pool.clone(),
                self.inbox.clone(),
                SenderConfig {
                    connect_timeout: Duration::from_secs(2),
                    pacing_timeout,
                },
            )
        }

        fn wait_report(&self) -> SendReport {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if let Some(Inbound::Sent(report)) = self.inbox.pop() {
                    return report;
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("no send report");
        }
    }

    fn frame(method: DeliveryMethod, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame {
            prefix: MessagePrefix::new(1, MessageType::Data, method, 5),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_reliable_send_writes_one_frame_per_stream() {
        let fixture = Fixture::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Arc::new(Connection::new("127.0.0.1", addr.port(), addr));

        fixture
            .sender()
            .send_reliable(frame(DeliveryMethod::ReliableOrdered, b"abc"), conn.clone());

        let (mut stream, _) = listener.accept().unwrap();
        let (prefix, payload) = read_stream_frame(&mut stream, &fixture.pool, 1024).unwrap();
        assert_eq!(prefix.sequence, 5);
        assert_eq!(&payload[..], b"abc");

        let report = fixture.wait_report();
        assert_eq!(report.transport, TransportKind::Tcp);
        assert_eq!(report.result.unwrap(), encoded_len(3, TransportKind::Tcp));
        assert!(conn.pacing(TransportKind::Tcp).is_set());
    }

    #[test]
    fn test_reliable_burst_to_one_peer_completes() {
        const BURST: usize = 40;
        let fixture = Fixture::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Arc::new(Connection::new("127.0.0.1", addr.port(), addr));

        let reader = thread::spawn(move || {
            let pool = BufferPool::new(64, 1);
            for _ in 0..BURST {
                let (mut stream, _) = listener.accept().unwrap();
                // Slower than the pacing timeout, so queued sends must wait rather than fail.
                thread::sleep(Duration::from_millis(2));
                read_stream_frame(&mut stream, &pool, 1024).unwrap();
            }
        });

        let sender = fixture.sender_with_pacing(Duration::from_millis(1));
        for _ in 0..BURST {
            sender.send_reliable(frame(DeliveryMethod::ReliableOrdered, b"burst"), conn.clone());
        }

        for _ in 0..BURST {
            let report = fixture.wait_report();
            assert!(report.result.is_ok(), "{:?}", report.result);
        }
        reader.join().unwrap();
    }

    #[test]
    fn test_reliable_failure_is_reported() {
        let fixture = Fixture::new();
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let conn = Arc::new(Connection::new("127.0.0.1", addr.port(), addr));

        fixture
            .sender()
            .send_reliable(frame(DeliveryMethod::ReliableOrdered, b"x"), conn);

        let report = fixture.wait_report();
        assert!(report.result.is_err());
        assert_eq!(report.message_type, MessageType::Data);
    }

    #[test]
    fn test_unreliable_send_reaches_every_target() {
        let fixture = Fixture::new();
        let a = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let b = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let targets: Vec<_> = [&a, &b]
            .iter()
            .map(|s| {
                let addr = s.local_addr().unwrap();
                Arc::new(Connection::new("127.0.0.1", addr.port(), addr))
            })
            .collect();

        fixture
            .sender()
            .send_unreliable(frame(DeliveryMethod::Unreliable, b"ping"), targets);

        for socket in [&a, &b] {
            socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0u8; 64];
            let (len, _) = socket.recv_from(&mut buf).unwrap();
            let (prefix, payload) = decode_frame(&buf[..len], TransportKind::Udp).unwrap();
            assert_eq!(prefix.delivery_method, DeliveryMethod::Unreliable);
            assert_eq!(&payload[..], b"ping");
        }

        for _ in 0..2 {
            assert!(fixture.wait_report().result.is_ok());
        }
        assert_eq!(fixture.pool.available(), fixture.pool.allocated());
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let fixture = Fixture::new();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let conn = Arc::new(Connection::new("127.0.0.1", 9, addr));

        fixture.sender().send_unreliable(
            frame(DeliveryMethod::UnreliableSequenced, &[0u8; 300]),
            vec![conn],
        );

        let report = fixture.wait_report();
        assert!(matches!(
            report.result,
            Err(TransportError::DatagramTooLarge { limit: 256, .. })
        ));
    }

    #[test]
    fn test_disposed_connection_fails() {
        let fixture = Fixture::new();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let conn = Arc::new(Connection::new("127.0.0.1", 9, addr));
        conn.dispose();

        fixture
            .sender()
            .send_unreliable(frame(DeliveryMethod::Unreliable, b"x"), vec![conn]);

        let report = fixture.wait_report();
        assert!(matches!(report.result, Err(TransportError::Disposed(_))));
    }
}
