//! Connection State Management
//!
//! A conversational peer: handshake status, the TCP and UDP sockets used to
//! reach it, and one pacing signal per transport.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Semaphore, SemaphorePermit};

use super::prefix::TransportKind;
use super::TransportError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handshake status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected; also the outcome of a handshake request that could not be delivered
    Disconnected,
    /// Request sent (or received), waiting for a verdict
    InitiatedConnect,
    /// Approved by the accepting side
    Connected,
    /// Refused by either side
    Rejected,
}

/// Idle/busy signal guarding one socket.
///
/// Holds a single permit: available while the socket is idle, taken while a
/// send is in flight. Waiters are served in arrival order and wake without
/// polling. Closing the signal fails every current and future wait.
#[derive(Debug)]
pub struct PacingSignal {
    permit: Semaphore,
}

impl PacingSignal {
    pub fn new() -> Self {
        PacingSignal {
            permit: Semaphore::new(1),
        }
    }

    pub fn is_set(&self) -> bool {
        self.permit.available_permits() > 0
    }

    /// Clear the signal if it is set. Returns a guard that sets it again on drop.
    pub fn try_acquire(&self) -> Option<PacingGuard<'_>> {
        self.permit.try_acquire().ok().map(PacingGuard::from)
    }

    /// Wait for the signal for at most `timeout`
    pub async fn acquire(&self, timeout: Duration) -> Option<PacingGuard<'_>> {
        tokio::time::timeout(timeout, self.permit.acquire())
            .await
            .ok()?
            .ok()
            .map(PacingGuard::from)
    }

    /// Wait for the signal with no deadline; `None` once the signal is closed
    pub async fn wait(&self) -> Option<PacingGuard<'_>> {
        self.permit.acquire().await.ok().map(PacingGuard::from)
    }

    fn close(&self) {
        self.permit.close();
    }
}

impl Default for PacingSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while a send owns the socket
#[derive(Debug)]
pub struct PacingGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

impl<'a> From<SemaphorePermit<'a>> for PacingGuard<'a> {
    fn from(permit: SemaphorePermit<'a>) -> Self {
        PacingGuard { _permit: permit }
    }
}

/// Represents a single peer
pub struct Connection {
    id: u64,
    host: String,
    port: u16,
    endpoint: SocketAddr,
    status: Mutex<ConnectionStatus>,

    /// Stream socket; open only while a reliable frame is being written
    tcp: AsyncMutex<Option<TcpStream>>,
    /// Datagram socket; bound lazily on the first unreliable send
    udp: AsyncMutex<Option<UdpSocket>>,

    tcp_idle: PacingSignal,
    udp_idle: PacingSignal,
    disposed: AtomicBool,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, endpoint: SocketAddr) -> Self {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            host: host.into(),
            port,
            endpoint,
            status: Mutex::new(ConnectionStatus::Disconnected),
            tcp: AsyncMutex::new(None),
            udp: AsyncMutex::new(None),
            tcp_idle: PacingSignal::new(),
            udp_idle: PacingSignal::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Connection for a peer that asked us to connect, already awaiting our verdict
    pub fn incoming(endpoint: SocketAddr) -> Self {
        let conn = Connection::new(endpoint.ip().to_string(), endpoint.port(), endpoint);
        *conn.lock_status() = ConnectionStatus::InitiatedConnect;
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.lock_status()
    }

    /// `Disconnected -> InitiatedConnect`
    pub fn begin_connect(&self) -> bool {
        self.transition(ConnectionStatus::Disconnected, ConnectionStatus::InitiatedConnect)
    }

    /// `InitiatedConnect -> Connected`; true only for the call that made the transition
    pub fn mark_connected(&self) -> bool {
        self.transition(ConnectionStatus::InitiatedConnect, ConnectionStatus::Connected)
    }

    /// `InitiatedConnect -> Disconnected`, for a handshake request that never reached the peer
    pub fn mark_unreachable(&self) -> bool {
        self.transition(ConnectionStatus::InitiatedConnect, ConnectionStatus::Disconnected)
    }

    /// `Disconnected | InitiatedConnect -> Rejected`; false once the handshake has a verdict
    pub fn mark_rejected(&self) -> bool {
        let mut status = self.lock_status();
        if matches!(*status, ConnectionStatus::Connected | ConnectionStatus::Rejected) {
            return false;
        }
        tracing::debug!("Connection {} ({}) {:?} -> Rejected", self.id, self.endpoint, *status);
        *status = ConnectionStatus::Rejected;
        true
    }

    fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        let mut status = self.lock_status();
        if *status != from {
            return false;
        }
        tracing::debug!("Connection {} ({}) {:?} -> {:?}", self.id, self.endpoint, from, to);
        *status = to;
        true
    }

    pub fn pacing(&self, kind: TransportKind) -> &PacingSignal {
        match kind {
            TransportKind::Tcp => &self.tcp_idle,
            TransportKind::Udp => &self.udp_idle,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Release both sockets. Safe to call repeatedly and from any state.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tcp_idle.close();
        self.udp_idle.close();

        // A slot locked by an in-flight send is emptied by that send once it sees the flag.
        let tcp = self.tcp.try_lock().ok().and_then(|mut slot| slot.take());
        let udp = self.udp.try_lock().ok().and_then(|mut slot| slot.take());
        tracing::debug!(
            "Disposed connection {} ({}): tcp_open={}, udp_bound={}",
            self.id,
            self.endpoint,
            tcp.is_some(),
            udp.is_some()
        );
    }

    /// Lock the stream slot; held for the whole of a reliable send
    pub(crate) async fn tcp_slot(
        &self,
    ) -> Result<AsyncMutexGuard<'_, Option<TcpStream>>, TransportError> {
        self.ensure_live()?;
        Ok(self.tcp.lock().await)
    }

    /// Lock the datagram slot; held for the whole of an unreliable send
    pub(crate) async fn udp_slot(
        &self,
    ) -> Result<AsyncMutexGuard<'_, Option<UdpSocket>>, TransportError> {
        self.ensure_live()?;
        Ok(self.udp.lock().await)
    }

    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Disposed(self.id));
        }
        Ok(())
    }

    fn lock_status(&self) -> MutexGuard<'_, ConnectionStatus> {
        lock(&self.status)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
