//! Datagram channel: reliability, dedupe, and split reassembly.
//!
//! The datagram service binds the same port as the reliable listener.
//! Outbound reliable datagrams (`BD`/`SC`) are registered in a pending
//! table and retransmitted every 200 ms until acknowledged or a hard
//! attempt cap. Inbound reliable datagrams are acknowledged immediately,
//! deduplicated against a 50-entry ring, and split groups are reassembled
//! in sequence order. Stale split groups are swept after 10 s of silence.
//!
//! The pending, dedupe, and split tables are owned here and are not
//! reachable from other modules.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relay_shared::codec;
use relay_shared::wire::{
    self, Datagram, PlayerId, CHUNK_LEN, DEDUPE_WINDOW, ID_ROLLOVER, RETRY_CAP,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::dispatch;
use crate::registry::Registry;
use crate::server::Relay;
use crate::session::Session;

/// Pending-table walk cadence.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Split groups idle longer than this are discarded.
pub const SPLIT_TTL: Duration = Duration::from_secs(10);

struct Pending {
    session: PlayerId,
    payload: Vec<u8>,
    attempts: u32,
}

struct Split {
    total: u32,
    frags: BTreeMap<u32, Vec<u8>>,
    touched: Instant,
}

/// Ring of recently accepted packet ids; the same id seen twice within
/// the window is a duplicate.
#[derive(Clone)]
pub struct DedupeRing {
    slots: [Option<u64>; DEDUPE_WINDOW],
    pos: usize,
}

impl Default for DedupeRing {
    fn default() -> Self {
        DedupeRing {
            slots: [None; DEDUPE_WINDOW],
            pos: 0,
        }
    }
}

impl DedupeRing {
    /// Records `pid` and reports whether it was already in the window.
    pub fn observe(&mut self, pid: u64) -> bool {
        if self.slots.iter().flatten().any(|&seen| seen == pid) {
            return true;
        }
        self.slots[self.pos] = Some(pid);
        self.pos = (self.pos + 1) % DEDUPE_WINDOW;
        false
    }
}

pub struct UdpService {
    socket: UdpSocket,
    pending: Mutex<HashMap<u64, Pending>>,
    splits: Mutex<HashMap<(PlayerId, u64), Split>>,
    dedupe: Mutex<HashMap<PlayerId, DedupeRing>>,
    next_pid: AtomicU64,
    next_sid: AtomicU64,
}

impl UdpService {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(UdpService {
            socket,
            pending: Mutex::new(HashMap::new()),
            splits: Mutex::new(HashMap::new()),
            dedupe: Mutex::new(HashMap::new()),
            next_pid: AtomicU64::new(0),
            next_sid: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn next_pid(&self) -> u64 {
        self.next_pid.fetch_add(1, Ordering::Relaxed) % ID_ROLLOVER
    }

    fn next_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed) % ID_ROLLOVER
    }

    /// Sends one datagram to the session's bound endpoint, applying the
    /// size-based compression rule. Sessions without a bound endpoint or
    /// already terminal are skipped.
    pub async fn send_raw(&self, session: &Session, payload: &[u8]) {
        if !session.udp_connected() || !session.is_alive() {
            return;
        }
        let Some(endpoint) = session.udp_endpoint() else {
            return;
        };
        let wire = match codec::encode_datagram(payload) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(id = %session.id(), error = %e, "datagram encode failed");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&wire, endpoint).await {
            debug!(id = %session.id(), error = %e, "datagram send failed");
            session.mark_disconnected();
        }
    }

    /// Reliable-datagram send: one `BD` record up to the chunk size, a
    /// group of `SC` records beyond it. Every record enters the pending
    /// table before it first hits the wire.
    pub async fn send_large(&self, session: &Session, data: &[u8]) {
        if data.len() <= CHUNK_LEN {
            let pid = self.next_pid();
            let record = Datagram::Single {
                pid,
                data: data.to_vec(),
            }
            .encode();
            self.register(pid, session.id(), record.clone());
            self.send_raw(session, &record).await;
            return;
        }

        let sid = self.next_sid();
        let total = data.chunks(CHUNK_LEN).len() as u32;
        for (i, chunk) in data.chunks(CHUNK_LEN).enumerate() {
            let pid = self.next_pid();
            let record = Datagram::Chunk {
                seq: i as u32 + 1,
                total,
                pid,
                sid,
                data: chunk.to_vec(),
            }
            .encode();
            self.register(pid, session.id(), record.clone());
            self.send_raw(session, &record).await;
        }
    }

    fn register(&self, pid: u64, session: PlayerId, payload: Vec<u8>) {
        self.pending.lock().expect("pending table poisoned").insert(
            pid,
            Pending {
                session,
                payload,
                attempts: 1,
            },
        );
    }

    /// Unacknowledged reliable datagrams currently in flight.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }

    /// Removes the pending record matching an acknowledgement.
    pub fn ack(&self, pid: u64) {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .remove(&pid);
    }

    /// Records an inbound pid; true means duplicate, drop it.
    pub fn observe_pid(&self, session: PlayerId, pid: u64) -> bool {
        self.dedupe
            .lock()
            .expect("dedupe table poisoned")
            .entry(session)
            .or_default()
            .observe(pid)
    }

    /// Adds a chunk to its split group; returns the in-order
    /// concatenation once the group is complete.
    pub fn accept_chunk(
        &self,
        session: PlayerId,
        seq: u32,
        total: u32,
        sid: u64,
        data: Vec<u8>,
    ) -> Option<Vec<u8>> {
        let mut splits = self.splits.lock().expect("split table poisoned");
        let split = splits.entry((session, sid)).or_insert_with(|| Split {
            total,
            frags: BTreeMap::new(),
            touched: Instant::now(),
        });
        split.total = total;
        split.touched = Instant::now();
        split.frags.insert(seq, data);
        if split.frags.len() as u32 == split.total {
            let split = splits.remove(&(session, sid)).expect("split just touched");
            let mut whole = Vec::new();
            for (_, frag) in split.frags {
                whole.extend_from_slice(&frag);
            }
            return Some(whole);
        }
        None
    }

    /// Discards split groups that stopped receiving chunks.
    pub fn sweep_stale(&self) {
        let mut splits = self.splits.lock().expect("split table poisoned");
        let before = splits.len();
        splits.retain(|_, s| s.touched.elapsed() <= SPLIT_TTL);
        let dropped = before - splits.len();
        if dropped > 0 {
            debug!(dropped, "discarded stale split groups");
        }
    }

    /// Drops all reliability state for a departed session.
    pub fn drop_session(&self, id: PlayerId) {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .retain(|_, p| p.session != id);
        self.splits
            .lock()
            .expect("split table poisoned")
            .retain(|(session, _), _| *session != id);
        self.dedupe
            .lock()
            .expect("dedupe table poisoned")
            .remove(&id);
    }

    /// One retransmission pass: resend every live record below the
    /// attempt cap, drop the rest. No backoff; the cap is the deadline.
    pub async fn retransmit_tick(&self, registry: &Registry) {
        let sessions: HashMap<PlayerId, Arc<Session>> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|s| (s.id(), s))
            .collect();

        let mut resend = Vec::new();
        {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            pending.retain(|_, p| match sessions.get(&p.session) {
                None => false,
                Some(s) if !s.is_alive() => false,
                Some(s) => {
                    if p.attempts >= RETRY_CAP {
                        return false;
                    }
                    p.attempts += 1;
                    resend.push((s.clone(), p.payload.clone()));
                    true
                }
            });
        }
        for (session, payload) in resend {
            self.send_raw(&session, &payload).await;
        }
    }
}

/// Receive loop. Each datagram carries a `<id+1>:` prefix; the first
/// sight of a session's traffic binds its endpoint.
pub async fn run(relay: Arc<Relay>) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, from) = match relay.udp.socket.recv_from(&mut buf).await {
            Ok(got) => got,
            Err(e) => {
                warn!(error = %e, "datagram receive failed");
                continue;
            }
        };
        let Some((id, body)) = wire::strip_session_prefix(&buf[..n]) else {
            continue;
        };
        let Some(session) = relay.registry.get(id).await else {
            continue;
        };
        session.set_udp_endpoint(from);
        handle_datagram(&relay, &session, body.to_vec()).await;
    }
}

async fn handle_datagram(relay: &Arc<Relay>, session: &Arc<Session>, raw: Vec<u8>) {
    let Ok(body) = codec::decode_payload(raw) else {
        return;
    };
    match Datagram::parse(&body) {
        None => {}
        Some(Datagram::Ack { pid }) => relay.udp.ack(pid),
        Some(Datagram::Single { pid, data }) => {
            relay
                .udp
                .send_raw(session, &Datagram::Ack { pid }.encode())
                .await;
            if !relay.udp.observe_pid(session.id(), pid) {
                dispatch::dispatch(relay, session, data).await;
            }
        }
        Some(Datagram::Chunk {
            seq,
            total,
            pid,
            sid,
            data,
        }) => {
            relay
                .udp
                .send_raw(session, &Datagram::Ack { pid }.encode())
                .await;
            if relay.udp.observe_pid(session.id(), pid) {
                return;
            }
            // Chunks carry raw slices of the payload; the compression
            // envelope was stripped with the datagram above.
            if let Some(whole) = relay.udp.accept_chunk(session.id(), seq, total, sid, data) {
                dispatch::dispatch(relay, session, whole).await;
            }
        }
        Some(Datagram::Plain(data)) => dispatch::dispatch(relay, session, data).await,
    }
}

/// Retransmission and stale-split sweep driver.
pub async fn run_retransmit(relay: Arc<Relay>) {
    let mut tick = tokio::time::interval(RETRANSMIT_INTERVAL);
    loop {
        tick.tick().await;
        relay.udp.retransmit_tick(&relay.registry).await;
        relay.udp.sweep_stale();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_window_catches_repeats() {
        let mut ring = DedupeRing::default();
        assert!(!ring.observe(1));
        assert!(ring.observe(1));
        // Fill the window so 1 ages out.
        for pid in 2..(2 + DEDUPE_WINDOW as u64) {
            assert!(!ring.observe(pid));
        }
        assert!(!ring.observe(1));
    }

    async fn service() -> UdpService {
        UdpService::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reassembly_matches_any_arrival_order() {
        let svc = service().await;
        let player = PlayerId(3);
        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<(u32, Vec<u8>)> = payload
            .chunks(CHUNK_LEN)
            .enumerate()
            .map(|(i, c)| (i as u32 + 1, c.to_vec()))
            .collect();
        let total = chunks.len() as u32;
        assert_eq!(total, 3);

        // Deliver out of order; completion fires exactly once.
        assert!(svc.accept_chunk(player, 3, total, 9, chunks[2].1.clone()).is_none());
        assert!(svc.accept_chunk(player, 1, total, 9, chunks[0].1.clone()).is_none());
        let whole = svc
            .accept_chunk(player, 2, total, 9, chunks[1].1.clone())
            .expect("group complete");
        assert_eq!(whole, payload);
    }

    #[tokio::test]
    async fn split_groups_are_per_session() {
        let svc = service().await;
        assert!(svc.accept_chunk(PlayerId(0), 1, 2, 7, b"aa".to_vec()).is_none());
        // Same sid from another session must not complete the group.
        assert!(svc.accept_chunk(PlayerId(1), 2, 2, 7, b"bb".to_vec()).is_none());
        let whole = svc
            .accept_chunk(PlayerId(0), 2, 2, 7, b"cc".to_vec())
            .expect("group complete");
        assert_eq!(whole, b"aacc");
    }

    #[tokio::test]
    async fn ack_clears_pending_once() {
        let svc = service().await;
        svc.register(5, PlayerId(0), b"BD:5:x".to_vec());
        svc.ack(5);
        svc.ack(5);
        assert!(svc.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_teardown_clears_tables() {
        let svc = service().await;
        svc.register(1, PlayerId(0), b"BD:1:x".to_vec());
        svc.register(2, PlayerId(1), b"BD:2:x".to_vec());
        svc.observe_pid(PlayerId(0), 1);
        svc.accept_chunk(PlayerId(0), 1, 2, 3, b"a".to_vec());
        svc.drop_session(PlayerId(0));
        assert_eq!(svc.pending.lock().unwrap().len(), 1);
        assert!(svc.splits.lock().unwrap().is_empty());
        assert!(!svc.dedupe.lock().unwrap().contains_key(&PlayerId(0)));
    }
}
