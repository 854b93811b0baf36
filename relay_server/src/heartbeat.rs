//! Discovery backend heartbeat and packet statistics.
//!
//! Every three seconds the server posts its public state to the
//! discovery backend, falling back to the backup URL. An unreachable
//! backend degrades the subsystem but never stops the relay; an explicit
//! refusal is fatal (the operator's key is wrong). The `pps` form field
//! comes from a one-second monitor over the world-data packet counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_shared::wire;
use serde::Serialize;
use tracing::{info, warn};

use crate::server::Relay;

pub const HEARTBEAT_URL: &str = "https://hub.relaymp.net/heartbeat";
pub const HEARTBEAT_BACKUP_URL: &str = "https://backup.relaymp.net/heartbeat";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Form posted to the backend. Field names are the backend's contract.
#[derive(Debug, Serialize)]
struct HeartbeatForm {
    uuid: String,
    players: usize,
    maxplayers: u8,
    port: u16,
    map: String,
    private: bool,
    version: &'static str,
    clientversion: &'static str,
    name: String,
    pps: String,
    modlist: String,
    modstotalsize: u64,
    modstotal: usize,
    playerslist: String,
    desc: String,
}

/// World-data packet counter and its derived per-vehicle rate report.
pub struct PacketStats {
    packets: AtomicU64,
    report: Mutex<String>,
}

impl Default for PacketStats {
    fn default() -> Self {
        PacketStats {
            packets: AtomicU64::new(0),
            report: Mutex::new("-".to_string()),
        }
    }
}

impl PacketStats {
    pub fn record(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> String {
        self.report.lock().expect("stat report poisoned").clone()
    }

    /// Folds one sampling window into the report: packets per second,
    /// normalised by clients with vehicles and their vehicle count.
    fn sample(&self, clients_with_cars: u64, total_cars: u64) {
        let packets = self.packets.swap(0, Ordering::Relaxed);
        let report = if clients_with_cars == 0 || packets == 0 {
            "-".to_string()
        } else {
            ((packets / clients_with_cars) / total_cars.max(1)).to_string()
        };
        *self.report.lock().expect("stat report poisoned") = report;
    }
}

/// One-second sampling loop for the packet-rate report.
pub async fn run_monitor(relay: Arc<Relay>) {
    let mut tick = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        tick.tick().await;
        let mut clients_with_cars = 0u64;
        let mut total_cars = 0u64;
        for session in relay.registry.snapshot().await {
            let cars = session.with_vehicles(|t| t.count()) as u64;
            if cars > 0 {
                clients_with_cars += 1;
                total_cars += cars;
            }
        }
        relay.stats.sample(clients_with_cars, total_cars);
    }
}

enum PostError {
    Unreachable(reqwest::Error),
    Refused(reqwest::StatusCode),
}

impl std::fmt::Display for PostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostError::Unreachable(e) => write!(f, "unreachable ({e})"),
            PostError::Refused(status) => write!(f, "refused with status {status}"),
        }
    }
}

async fn post(
    http: &reqwest::Client,
    url: &str,
    form: &HeartbeatForm,
) -> Result<(), PostError> {
    let response = http
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(PostError::Unreachable)?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(PostError::Refused(status))
    }
}

async fn build_form(relay: &Relay) -> HeartbeatForm {
    let cfg = relay.config.read().expect("config poisoned").clone();
    let players = relay.registry.names().await;
    HeartbeatForm {
        uuid: cfg.auth_key,
        players: players.len(),
        maxplayers: cfg.max_players,
        port: cfg.port,
        map: cfg.map,
        private: cfg.is_private,
        version: wire::SERVER_VERSION,
        clientversion: wire::CLIENT_VERSION,
        name: cfg.name,
        pps: relay.stats.report(),
        modlist: relay.mods.file_list(),
        modstotalsize: relay.mods.total_size(),
        modstotal: relay.mods.count(),
        playerslist: players.iter().map(|n| format!("{n};")).collect(),
        desc: cfg.desc,
    }
}

/// Heartbeat loop. Returns only on a fatal backend refusal, which takes
/// an explicit HTTP rejection from both URLs; any other combination of
/// failures degrades the subsystem and keeps serving.
pub async fn run(relay: Arc<Relay>) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let mut authenticated = false;
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tick.tick().await;
        let form = build_form(&relay).await;
        let outcome = match post(&http, HEARTBEAT_URL, &form).await {
            Ok(()) => Ok(()),
            Err(primary) => match post(&http, HEARTBEAT_BACKUP_URL, &form).await {
                Ok(()) => Ok(()),
                Err(backup) => Err((primary, backup)),
            },
        };
        match outcome {
            Ok(()) => {
                relay.set_degraded(false);
                if !authenticated {
                    info!("server authenticated with the backend");
                    authenticated = true;
                }
            }
            Err((PostError::Refused(primary), PostError::Refused(backup))) => {
                anyhow::bail!(
                    "backend refused the server (status {primary} and {backup}); \
                     check the AuthKey"
                );
            }
            Err((primary, backup)) => {
                if !relay.is_degraded() {
                    warn!(
                        primary = %primary,
                        backup = %backup,
                        "heartbeat failed on both backends, continuing degraded"
                    );
                }
                relay.set_degraded(true);
            }
        }
    }
}
