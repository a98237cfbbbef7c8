//! Listeners
//!
//! One blocking OS thread per transport. Each thread turns raw socket bytes
//! into [`ReceivedMessage`]s and pushes them to the inbox; it touches nothing
//! else. Stopping is cooperative: a flag checked every iteration plus a
//! wake-up packet to unblock the pending `accept`/`recv_from`.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use super::buffer_pool::BufferPool;
use super::frame::{decode_frame, read_stream_frame};
use super::prefix::TransportKind;
use super::{Inbound, ReceivedMessage};
use crate::queue::MessageQueue;

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Read timeout on an accepted stream
    pub read_timeout: Duration,
    /// How often a blocked UDP receive re-checks the stop flag
    pub poll_interval: Duration,
    pub max_frame_size: usize,
}

/// Handle to a running listener thread; stops it on drop
pub struct Listener {
    kind: TransportKind,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind a TCP listener and start its accept loop
    pub fn tcp(
        addr: SocketAddr,
        pool: Arc<BufferPool>,
        inbox: Arc<MessageQueue<Inbound>>,
        config: ListenerConfig,
    ) -> io::Result<Self> {
        let listener = bind_with_reuse(addr)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let thread = thread::Builder::new()
            .name(format!("peerlink-tcp-{}", local_addr.port()))
            .spawn(move || tcp_loop(listener, thread_running, pool, inbox, config))?;

        Ok(Listener {
            kind: TransportKind::Tcp,
            local_addr,
            running,
            thread: Some(thread),
        })
    }

    /// Bind a UDP socket and start its receive loop
    pub fn udp(
        addr: SocketAddr,
        pool: Arc<BufferPool>,
        inbox: Arc<MessageQueue<Inbound>>,
        config: ListenerConfig,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(config.poll_interval))?;
        let local_addr = socket.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let thread = thread::Builder::new()
            .name(format!("peerlink-udp-{}", local_addr.port()))
            .spawn(move || udp_loop(socket, thread_running, pool, inbox, config))?;

        Ok(Listener {
            kind: TransportKind::Udp,
            local_addr,
            running,
            thread: Some(thread),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the loop to stop, unblock it and wait for the thread to exit.
    ///
    /// A TCP thread that cannot be woken stays blocked in `accept`; it is
    /// detached rather than joined so the caller never hangs.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let woken = self.wake();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if !woken && self.kind == TransportKind::Tcp {
            tracing::warn!(
                "TCP listener on {} could not be woken; detaching its thread",
                self.local_addr
            );
            return;
        }
        if thread.join().is_err() {
            tracing::error!("{:?} listener thread on {} panicked", self.kind, self.local_addr);
        }
    }

    fn wake(&self) -> bool {
        let target = reachable_addr(self.local_addr);
        let woken = match self.kind {
            TransportKind::Tcp => TcpStream::connect_timeout(&target, WAKE_TIMEOUT).map(|_| ()),
            TransportKind::Udp => UdpSocket::bind(SocketAddr::new(unspecified(target), 0))
                .and_then(|socket| socket.send_to(&[], target))
                .map(|_| ()),
        };
        match woken {
            Ok(()) => true,
            Err(e) => {
                // The UDP loop still notices the flag after its receive timeout.
                tracing::debug!("Could not wake {:?} listener on {}: {}", self.kind, target, e);
                false
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_with_reuse(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// Address a local client can reach the listener on
fn reachable_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

fn unspecified(addr: SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Accepts one stream at a time; a slow peer delays the next accept.
fn tcp_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    pool: Arc<BufferPool>,
    inbox: Arc<MessageQueue<Inbound>>,
    config: ListenerConfig,
) {
    tracing::info!("TCP listener started on {:?}", listener.local_addr());

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                receive_stream(stream, peer, &pool, &inbox, &config);
            }
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!("Accept error: {}", e);
                thread::sleep(config.poll_interval);
            }
        }
    }

    tracing::info!("TCP listener stopped");
}

fn receive_stream(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: &Arc<BufferPool>,
    inbox: &MessageQueue<Inbound>,
    config: &ListenerConfig,
) {
    if let Err(e) = stream.set_read_timeout(Some(config.read_timeout)) {
        tracing::warn!("Failed to set read timeout for {}: {}", peer, e);
    }

    match read_stream_frame(&mut stream, pool, config.max_frame_size) {
        Ok((prefix, payload)) => {
            tracing::trace!(
                "TCP frame from {}: {:?}, {} payload bytes",
                peer,
                prefix.message_type,
                payload.len()
            );
            inbox.push(Inbound::Frame(ReceivedMessage {
                prefix,
                payload,
                sender: peer,
                transport: TransportKind::Tcp,
            }));
        }
        Err(e) => tracing::warn!("Dropping TCP frame from {}: {}", peer, e),
    }

    let _ = stream.shutdown(Shutdown::Both);
}

fn udp_loop(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    pool: Arc<BufferPool>,
    inbox: Arc<MessageQueue<Inbound>>,
    config: ListenerConfig,
) {
    tracing::info!("UDP listener started on {:?}", socket.local_addr());

    while running.load(Ordering::SeqCst) {
        let mut buf = pool.get();
        // One spare byte exposes datagrams the platform would otherwise truncate silently.
        let limit = pool.buf_size();
        buf.as_vec_mut().resize(limit + 1, 0);
        match socket.recv_from(&mut buf) {
            // Wake-up packet or an empty datagram
            Ok((0, _)) => continue,
            Ok((len, peer)) if len > limit => {
                tracing::warn!(
                    "Dropping datagram from {}: larger than the {} byte buffer",
                    peer,
                    limit
                );
            }
            Ok((len, peer)) => match decode_frame(&buf[..len], TransportKind::Udp) {
                Ok((prefix, payload)) => {
                    drop(buf);
                    tracing::trace!(
                        "UDP datagram from {}: {:?}, seq {}, {} payload bytes",
                        peer,
                        prefix.message_type,
                        prefix.sequence,
                        payload.len()
                    );
                    inbox.push(Inbound::Frame(ReceivedMessage {
                        prefix,
                        payload,
                        sender: peer,
                        transport: TransportKind::Udp,
                    }));
                }
                Err(e) => tracing::warn!("Dropping datagram from {}: {}", peer, e),
            },
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                // ICMP port-unreachable from an earlier send surfaces here on some platforms.
                tracing::warn!("UDP receive error: {}", e);
                thread::sleep(config.poll_interval);
            }
        }
    }

    tracing::info!("UDP listener stopped");
}
