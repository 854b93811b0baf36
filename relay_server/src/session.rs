//! Per-client session state.
//!
//! A session owns one reliable stream and one datagram endpoint, bound
//! together during the handshake. The write half, the datagram endpoint,
//! and the vehicle table are independently locked; the read half is owned
//! by the session's serial read task and never stored here.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use relay_shared::vehicle::VehicleTable;
use relay_shared::wire::PlayerId;
use relay_shared::codec;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::debug;

/// Session lifecycle. The two terminal states stop all outbound writes;
/// they differ only in the disconnect notice sent to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Connecting = 0,
    SyncingResources = 1,
    Synced = 2,
    MarkedForDisconnect = 3,
    Kicked = 4,
}

impl SessionStatus {
    fn from_u8(v: u8) -> SessionStatus {
        match v {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::SyncingResources,
            2 => SessionStatus::Synced,
            3 => SessionStatus::MarkedForDisconnect,
            _ => SessionStatus::Kicked,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::MarkedForDisconnect | SessionStatus::Kicked
        )
    }
}

pub struct Session {
    id: PlayerId,
    name: String,
    token: String,
    role: String,
    peer_ip: IpAddr,
    status: AtomicU8,
    /// Wakes the read task when the session is closed from outside.
    closed: Notify,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    udp_endpoint: Mutex<Option<SocketAddr>>,
    udp_connected: AtomicBool,
    /// Auxiliary stream the client opens for parallel file delivery.
    download: Mutex<Option<TcpStream>>,
    vehicles: Mutex<VehicleTable>,
}

impl Session {
    /// Splits the accepted stream; the read half goes to the session task.
    pub fn new(
        id: PlayerId,
        name: String,
        token: String,
        role: String,
        stream: TcpStream,
    ) -> (Session, OwnedReadHalf) {
        let peer_ip = stream
            .peer_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let (reader, writer) = stream.into_split();
        let session = Session {
            id,
            name,
            token,
            role,
            peer_ip,
            status: AtomicU8::new(SessionStatus::Connecting as u8),
            closed: Notify::new(),
            writer: tokio::sync::Mutex::new(writer),
            udp_endpoint: Mutex::new(None),
            udp_connected: AtomicBool::new(false),
            download: Mutex::new(None),
            vehicles: Mutex::new(VehicleTable::default()),
        };
        (session, reader)
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Transitions the status. Terminal states are sticky.
    pub fn set_status(&self, status: SessionStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| advance(cur, status));
        if status.is_terminal() {
            self.closed.notify_waiters();
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn is_synced(&self) -> bool {
        self.status() == SessionStatus::Synced
    }

    pub fn was_kicked(&self) -> bool {
        self.status() == SessionStatus::Kicked
    }

    pub fn mark_disconnected(&self) {
        self.set_status(SessionStatus::MarkedForDisconnect);
    }

    /// Forcibly ends the session; the read task wakes and runs teardown.
    pub fn kick(&self) {
        self.set_status(SessionStatus::Kicked);
    }

    /// Resolved when the session enters a terminal state. The waiter is
    /// registered before the status check so a concurrent close cannot
    /// slip between them.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_alive() {
                return;
            }
            notified.await;
        }
    }

    /// Writes one frame on the reliable stream. Writes after a terminal
    /// transition are dropped; a transport failure marks the session.
    pub async fn send_frame(&self, payload: &[u8]) {
        if !self.is_alive() {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = codec::write_frame(&mut *writer, payload).await {
            debug!(id = %self.id, error = %e, "reliable write failed");
            self.mark_disconnected();
        }
    }

    /// Exclusive use of the raw write half, for bulk file delivery.
    pub async fn writer(&self) -> tokio::sync::MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    pub fn set_udp_endpoint(&self, addr: SocketAddr) {
        *self.udp_endpoint.lock().expect("endpoint lock poisoned") = Some(addr);
        self.udp_connected.store(true, Ordering::Release);
    }

    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        *self.udp_endpoint.lock().expect("endpoint lock poisoned")
    }

    pub fn udp_connected(&self) -> bool {
        self.udp_connected.load(Ordering::Acquire)
    }

    pub fn attach_download(&self, stream: TcpStream) {
        *self.download.lock().expect("download lock poisoned") = Some(stream);
    }

    pub fn take_download(&self) -> Option<TcpStream> {
        self.download.lock().expect("download lock poisoned").take()
    }

    /// Runs `f` with the vehicle table locked.
    pub fn with_vehicles<R>(&self, f: impl FnOnce(&mut VehicleTable) -> R) -> R {
        f(&mut self.vehicles.lock().expect("vehicle table poisoned"))
    }
}

fn advance(current: u8, next: SessionStatus) -> Option<u8> {
    if SessionStatus::from_u8(current).is_terminal() {
        None
    } else {
        Some(next as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_is_sticky() {
        assert_eq!(
            advance(SessionStatus::Connecting as u8, SessionStatus::Synced),
            Some(SessionStatus::Synced as u8)
        );
        assert_eq!(
            advance(SessionStatus::Synced as u8, SessionStatus::Kicked),
            Some(SessionStatus::Kicked as u8)
        );
        assert_eq!(advance(SessionStatus::Kicked as u8, SessionStatus::Synced), None);
        assert_eq!(
            advance(
                SessionStatus::MarkedForDisconnect as u8,
                SessionStatus::Kicked
            ),
            None
        );
    }
}
