//! Test harness: an ephemeral relay and a protocol-complete client.
//!
//! The client speaks the real wire grammar end to end: framed handshake,
//! resource sync, the datagram session prefix, acknowledgement of
//! reliable datagrams, and split reassembly. Tests drive it against a
//! relay bound to loopback on an ephemeral port.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use relay_server::identity::IdentityProvider;
use relay_server::server::{Relay, RelayOptions};
use relay_shared::codec;
use relay_shared::config::{ServerConfig, DEFAULT_TEMPLATE};
use relay_shared::wire::{self, Datagram, PlayerId};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

/// Upper bound on any single wait in a test. Generous so a hook running
/// into the 5-second invocation timeout still fits.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Scratch directory for one test's resources and block file.
pub struct TestEnv {
    pub dir: PathBuf,
}

impl TestEnv {
    pub fn new(tag: &str) -> TestEnv {
        let mut dir = std::env::temp_dir();
        dir.push(format!("relay-test-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create test dir");
        TestEnv { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Test configuration: ephemeral port, scratch resource directory.
    pub fn config(&self) -> ServerConfig {
        let mut cfg = ServerConfig::parse(DEFAULT_TEMPLATE).expect("template parses");
        cfg.port = 0;
        cfg.max_cars = 2;
        cfg.resource_dir = self.dir.join("Resources").display().to_string();
        cfg.auth_key = "test-key".to_string();
        cfg
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Binds a relay on loopback and runs it in the background.
pub async fn start_relay(
    env: &TestEnv,
    identity: Arc<dyn IdentityProvider>,
) -> anyhow::Result<(Arc<Relay>, SocketAddr)> {
    start_relay_with(env, identity, |_| {}).await
}

/// [`start_relay`] with a configuration tweak applied first.
pub async fn start_relay_with(
    env: &TestEnv,
    identity: Arc<dyn IdentityProvider>,
    tweak: impl FnOnce(&mut ServerConfig),
) -> anyhow::Result<(Arc<Relay>, SocketAddr)> {
    let mut config = env.config();
    tweak(&mut config);
    let mut options = RelayOptions::new(config, identity);
    options.bind_ip = "127.0.0.1".parse().unwrap();
    options.block_file = env.dir.join("blocked.txt");
    let relay = Relay::bind(options).await?;
    let addr = relay.local_addr()?;
    let background = relay.clone();
    tokio::spawn(async move {
        let _ = background.serve().await;
    });
    Ok((relay, addr))
}

pub struct TestClient {
    pub id: PlayerId,
    pub name: String,
    server: SocketAddr,
    tcp: TcpStream,
    udp: UdpSocket,
    splits: HashMap<u64, (u32, BTreeMap<u32, Vec<u8>>)>,
    seen: HashSet<u64>,
}

impl TestClient {
    /// Handshake through to the resource phase.
    pub async fn connect(addr: SocketAddr, name: &str, token: &str) -> anyhow::Result<TestClient> {
        let mut tcp = TcpStream::connect(addr).await?;
        let greeting = recv_frame(&mut tcp).await?;
        if !greeting.starts_with(b"SH:") {
            bail!("unexpected greeting: {greeting:?}");
        }
        let version = format!("VC{}", wire::CLIENT_VERSION);
        codec::write_frame(&mut tcp, version.as_bytes()).await?;
        let identity = format!("NR{name}:{token}");
        codec::write_frame(&mut tcp, identity.as_bytes()).await?;

        let opening = recv_frame(&mut tcp).await?;
        let id = std::str::from_utf8(&opening)
            .ok()
            .and_then(|s| s.strip_prefix('P'))
            .and_then(wire::parse_id)
            .with_context(|| format!("expected session id, got {opening:?}"))?;

        let udp = UdpSocket::bind("127.0.0.1:0").await?;
        udp.connect(addr).await?;

        Ok(TestClient {
            id: PlayerId(id),
            name: name.to_string(),
            server: addr,
            tcp,
            udp,
            splits: HashMap::new(),
            seen: HashSet::new(),
        })
    }

    /// Connect, skip resources, bind the datagram channel, enter the
    /// world.
    pub async fn full_join(
        addr: SocketAddr,
        name: &str,
        token: &str,
    ) -> anyhow::Result<TestClient> {
        let mut client = TestClient::connect(addr, name, token).await?;
        client.finish_sync().await?;
        client.announce().await?;
        client.join_world().await?;
        Ok(client)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub async fn send_packet(&mut self, data: &[u8]) -> anyhow::Result<()> {
        codec::write_frame(&mut self.tcp, data).await
    }

    pub async fn recv_tcp(&mut self) -> anyhow::Result<Vec<u8>> {
        recv_frame(&mut self.tcp).await
    }

    /// Reads exactly `len` unframed bytes; file payloads travel raw.
    pub async fn recv_raw(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; len];
        tokio::time::timeout(TEST_TIMEOUT, self.tcp.read_exact(&mut buf))
            .await
            .context("timed out reading raw bytes")??;
        Ok(buf)
    }

    /// Reads reliable frames until one starts with `prefix`.
    pub async fn expect_tcp(&mut self, prefix: &str) -> anyhow::Result<Vec<u8>> {
        let deadline = Instant::now() + TEST_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                bail!("no frame starting with {prefix:?}");
            }
            let frame = recv_frame(&mut self.tcp).await?;
            if frame.starts_with(prefix.as_bytes()) {
                return Ok(frame);
            }
        }
    }

    /// Asks for the mod listing during the resource phase.
    pub async fn request_listing(&mut self) -> anyhow::Result<String> {
        self.send_packet(b"SR").await?;
        let listing = self.recv_tcp().await?;
        Ok(String::from_utf8(listing)?)
    }

    /// Ends the resource phase; returns the map handed over.
    pub async fn finish_sync(&mut self) -> anyhow::Result<String> {
        self.send_packet(b"Done").await?;
        let map = self.expect_tcp("M").await?;
        Ok(String::from_utf8_lossy(&map[1..]).to_string())
    }

    /// First datagram leg: binds this client's endpoint on the server.
    pub async fn announce(&self) -> anyhow::Result<()> {
        // An unknown code: the server binds the endpoint and drops it.
        self.send_datagram(b"-").await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    /// Signals readiness; the server answers with the id and the sync
    /// greeting.
    pub async fn join_world(&mut self) -> anyhow::Result<()> {
        self.send_packet(b"P").await?;
        let reply = self.expect_tcp("P").await?;
        let expected = format!("P{}", self.id);
        if reply != expected.as_bytes() {
            bail!("expected {expected:?}, got {reply:?}");
        }
        self.expect_tcp("Sn").await?;
        Ok(())
    }

    /// Sends a datagram with the session prefix.
    pub async fn send_datagram(&self, body: &[u8]) -> anyhow::Result<()> {
        let mut wire_bytes = wire::session_prefix(self.id).into_bytes();
        wire_bytes.extend_from_slice(body);
        self.udp.send(&wire_bytes).await?;
        Ok(())
    }

    async fn send_ack(&self, pid: u64) -> anyhow::Result<()> {
        self.send_datagram(&Datagram::Ack { pid }.encode()).await
    }

    /// Receives one application packet from the datagram channel,
    /// acknowledging reliable records, de-duplicating retransmissions,
    /// and reassembling splits.
    pub async fn recv_udp_packet(&mut self, wait: Duration) -> anyhow::Result<Vec<u8>> {
        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .context("timed out waiting for datagram")?;
            let n = tokio::time::timeout(remaining, self.udp.recv(&mut buf))
                .await
                .context("timed out waiting for datagram")??;
            let body = codec::decode_payload(buf[..n].to_vec())?;
            match Datagram::parse(&body) {
                None | Some(Datagram::Ack { .. }) => continue,
                Some(Datagram::Single { pid, data }) => {
                    self.send_ack(pid).await?;
                    if self.seen.insert(pid) {
                        return Ok(data);
                    }
                }
                Some(Datagram::Chunk {
                    seq,
                    total,
                    pid,
                    sid,
                    data,
                }) => {
                    self.send_ack(pid).await?;
                    if !self.seen.insert(pid) {
                        continue;
                    }
                    let group = self
                        .splits
                        .entry(sid)
                        .or_insert_with(|| (total, BTreeMap::new()));
                    group.1.insert(seq, data);
                    if group.1.len() as u32 == group.0 {
                        let (_, frags) = self.splits.remove(&sid).expect("group present");
                        let mut whole = Vec::new();
                        for (_, frag) in frags {
                            whole.extend_from_slice(&frag);
                        }
                        return Ok(whole);
                    }
                }
                Some(Datagram::Plain(data)) => return Ok(data),
            }
        }
    }

    /// Receives datagram packets until one starts with `prefix`.
    pub async fn expect_udp(&mut self, prefix: &str) -> anyhow::Result<Vec<u8>> {
        let deadline = Instant::now() + TEST_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .with_context(|| format!("no datagram starting with {prefix:?}"))?;
            let packet = self.recv_udp_packet(remaining).await?;
            if packet.starts_with(prefix.as_bytes()) {
                return Ok(packet);
            }
        }
    }

    /// Opens the auxiliary download connection for this session.
    pub async fn open_download_socket(&self) -> anyhow::Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server).await?;
        let greeting = recv_frame(&mut stream).await?;
        if !greeting.starts_with(b"SH:") {
            bail!("unexpected greeting on download socket");
        }
        let attach = format!("D{}", self.id);
        codec::write_frame(&mut stream, attach.as_bytes()).await?;
        Ok(stream)
    }
}

/// Reads one decoded frame with the test timeout applied.
pub async fn recv_frame(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let frame = tokio::time::timeout(TEST_TIMEOUT, codec::read_frame(stream))
        .await
        .context("timed out waiting for frame")??;
    codec::decode_payload(frame)
}
