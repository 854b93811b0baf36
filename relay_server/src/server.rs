//! Relay composition root.
//!
//! `Relay` owns both transports (one port, TCP and UDP), the session
//! registry, the datagram reliability tables, the plugin runtime, and the
//! admission guard. `serve` runs the accept and datagram loops and spawns
//! the periodic tasks; the discovery heartbeat is started separately by
//! the binary so embedded and test servers stay offline.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use relay_shared::codec;
use relay_shared::config::ServerConfig;
use relay_shared::limiter::AdmissionGuard;
use relay_shared::resources::ModIndex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::dispatch;
use crate::handshake;
use crate::heartbeat::{self, PacketStats};
use crate::identity::IdentityProvider;
use crate::plugins::{loader, ApiCommand, HookArgs, PluginApi, PluginRuntime};
use crate::registry::Registry;
use crate::session::Session;
use crate::sync;
use crate::udp::{self, UdpService};

/// Configuration shared with the plugin API, which may mutate it at
/// runtime.
pub type SharedConfig = Arc<std::sync::RwLock<ServerConfig>>;

pub struct RelayOptions {
    pub config: ServerConfig,
    pub identity: Arc<dyn IdentityProvider>,
    /// Listen address; the configured port applies to both transports.
    pub bind_ip: IpAddr,
    /// Append-only file of blocked peer addresses.
    pub block_file: PathBuf,
}

impl RelayOptions {
    pub fn new(config: ServerConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        RelayOptions {
            config,
            identity,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            block_file: PathBuf::from("blocked_ips.txt"),
        }
    }
}

pub struct Relay {
    pub config: SharedConfig,
    pub registry: Arc<Registry>,
    pub udp: UdpService,
    pub plugins: Arc<PluginRuntime>,
    pub guard: AdmissionGuard,
    pub mods: ModIndex,
    pub identity: Arc<dyn IdentityProvider>,
    pub stats: PacketStats,
    degraded: AtomicBool,
    tcp: TcpListener,
    api_rx: std::sync::Mutex<Option<UnboundedReceiver<ApiCommand>>>,
}

impl Relay {
    /// Binds both transports and loads resources and plugins. Port 0
    /// binds ephemerally (TCP first, UDP follows onto the same port).
    pub async fn bind(opts: RelayOptions) -> anyhow::Result<Arc<Relay>> {
        let addr = SocketAddr::new(opts.bind_ip, opts.config.port);
        let tcp = TcpListener::bind(addr).await.context("reliable listener bind")?;
        let local = tcp.local_addr()?;
        let udp = UdpService::bind(SocketAddr::new(opts.bind_ip, local.port()))
            .await
            .context("datagram bind")?;

        let resource_dir = PathBuf::from(&opts.config.resource_dir);
        let mods = ModIndex::scan(&resource_dir)?;
        let registry = Arc::new(Registry::default());
        let config: SharedConfig = Arc::new(std::sync::RwLock::new(opts.config));

        let (api_tx, api_rx) = unbounded_channel();
        let api = PluginApi::new(registry.clone(), config.clone(), api_tx);
        let plugins = Arc::new(PluginRuntime::new(api));
        loader::load_all(&plugins, &resource_dir)?;

        Ok(Arc::new(Relay {
            config,
            registry,
            udp,
            plugins,
            guard: AdmissionGuard::open(opts.block_file),
            mods,
            identity: opts.identity,
            stats: PacketStats::default(),
            degraded: AtomicBool::new(false),
            tcp,
            api_rx: std::sync::Mutex::new(Some(api_rx)),
        }))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn set_degraded(&self, value: bool) {
        self.degraded.store(value, Ordering::Release);
    }

    /// Runs the relay: accept loop, datagram loop, retransmission tick,
    /// plugin watcher, API command task, packet monitor.
    pub async fn serve(self: &Arc<Self>) -> anyhow::Result<()> {
        let resource_dir =
            PathBuf::from(&self.config.read().expect("config poisoned").resource_dir);
        loader::spawn_watcher(self.plugins.clone(), resource_dir);

        if let Some(rx) = self.api_rx.lock().expect("api receiver poisoned").take() {
            tokio::spawn(run_api_commands(self.clone(), rx));
        }
        tokio::spawn(udp::run_retransmit(self.clone()));
        tokio::spawn(heartbeat::run_monitor(self.clone()));

        let datagrams = udp::run(self.clone());
        let connections = self.accept_loop();
        tokio::try_join!(datagrams, connections)?;
        Ok(())
    }

    async fn accept_loop(self: &Arc<Self>) -> anyhow::Result<()> {
        let max_players = self.config.read().expect("config poisoned").max_players;
        info!(
            addr = %self.local_addr()?,
            max_players,
            "relay online"
        );
        loop {
            let (stream, peer) = match self.tcp.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if !self.guard.allow(peer.ip()) {
                debug!(%peer, "connection rejected by admission guard");
                continue;
            }
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = handshake::identify(relay, stream, peer).await {
                    debug!(%peer, error = %e, "handshake ended");
                }
            });
        }
    }
}

/// Per-session task: connect flow, then the serial read-dispatch loop,
/// then teardown. A kick from outside wakes the loop immediately.
pub(crate) async fn run_session(
    relay: Arc<Relay>,
    session: Arc<Session>,
    mut reader: OwnedReadHalf,
) {
    tokio::select! {
        connected = sync::on_connect(&relay, &session, &mut reader) => {
            if let Err(e) = connected {
                debug!(id = %session.id(), error = %e, "connect flow failed");
                session.mark_disconnected();
            }
        }
        _ = session.wait_closed() => {}
    }

    while session.is_alive() {
        tokio::select! {
            frame = codec::read_frame(&mut reader) => match frame {
                Ok(frame) => match codec::decode_payload(frame) {
                    Ok(packet) => dispatch::dispatch(&relay, &session, packet).await,
                    Err(e) => debug!(id = %session.id(), error = %e, "dropping undecodable frame"),
                },
                Err(e) => {
                    debug!(id = %session.id(), error = %e, "reliable read ended");
                    session.mark_disconnected();
                }
            },
            _ = session.wait_closed() => {}
        }
    }

    on_disconnect(&relay, &session).await;
}

/// Teardown: destroy the session's vehicles on every peer, announce the
/// departure (kick and leave notices are mutually exclusive), fire the
/// disconnect hook, then drop all state.
async fn on_disconnect(relay: &Arc<Relay>, session: &Arc<Session>) {
    info!(id = %session.id(), name = %session.name(), "connection terminated");

    for vid in session.with_vehicles(|t| t.ids()) {
        let gone = format!("Od:{}-{}", session.id(), vid);
        relay
            .send_to_all(Some(session), gone.as_bytes(), false, true)
            .await;
    }

    let notice = if session.was_kicked() {
        format!("L{} was kicked!", session.name())
    } else {
        format!("L{} Left the server!", session.name())
    };
    relay
        .send_to_all(Some(session), notice.as_bytes(), false, true)
        .await;

    relay
        .plugins
        .trigger(
            "onPlayerDisconnect",
            HookArgs::new().int(session.id().0 as i64),
            false,
        )
        .await;

    relay.registry.remove(session.id()).await;
    relay.udp.drop_session(session.id());
    relay.guard.forget(session.peer_ip());
}

/// Drains deferred plugin commands into regular server operations.
async fn run_api_commands(relay: Arc<Relay>, mut rx: UnboundedReceiver<ApiCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            ApiCommand::Broadcast { data, reliable } => {
                relay.send_to_all(None, &data, true, reliable).await;
            }
            ApiCommand::SendTo { id, data, reliable } => {
                if let Some(session) = relay.registry.get(id).await {
                    relay.respond(&session, &data, reliable).await;
                }
            }
            ApiCommand::DropPlayer { id, reason } => {
                let Some(session) = relay.registry.get(id).await else {
                    continue;
                };
                if session.role() == handshake::DEV_ROLE {
                    continue;
                }
                let reason = reason.map(|r| format!(" Reason: {r}")).unwrap_or_default();
                let notice = format!("C:Server:You have been kicked from the server!{reason}");
                relay.respond(&session, notice.as_bytes(), true).await;
                info!(id = %session.id(), name = %session.name(), "kicked by plugin");
                session.kick();
            }
            ApiCommand::RemoveVehicle { id, vid } => {
                let Some(session) = relay.registry.get(id).await else {
                    continue;
                };
                if session.role() == handshake::DEV_ROLE {
                    continue;
                }
                if session.with_vehicles(|t| t.remove(vid)).is_some() {
                    let gone = format!("Od:{id}-{vid}");
                    relay.send_to_all(None, gone.as_bytes(), true, true).await;
                }
            }
        }
    }
}
