//! Server API exposed to plugins.
//!
//! Hooks run on plugin worker threads, off the async runtime, so queries
//! read the registry with blocking leases and anything that writes to the
//! network goes through a command channel drained by a server task. That
//! keeps lock ordering trivial: plugins never hold a server lock while
//! the server waits on a plugin.

use std::sync::Arc;

use relay_shared::wire::PlayerId;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::registry::Registry;
use crate::server::SharedConfig;

/// Deferred actions executed by the server's command task.
#[derive(Debug)]
pub enum ApiCommand {
    Broadcast { data: Vec<u8>, reliable: bool },
    SendTo {
        id: PlayerId,
        data: Vec<u8>,
        reliable: bool,
    },
    DropPlayer {
        id: PlayerId,
        reason: Option<String>,
    },
    RemoveVehicle { id: PlayerId, vid: u8 },
}

pub struct PluginApi {
    registry: Arc<Registry>,
    config: SharedConfig,
    commands: UnboundedSender<ApiCommand>,
}

impl PluginApi {
    pub(crate) fn new(
        registry: Arc<Registry>,
        config: SharedConfig,
        commands: UnboundedSender<ApiCommand>,
    ) -> Arc<PluginApi> {
        Arc::new(PluginApi {
            registry,
            config,
            commands,
        })
    }

    // ─── Queries ───

    pub fn player_name(&self, id: u8) -> Option<String> {
        self.registry
            .blocking_get(PlayerId(id))
            .map(|s| s.name().to_string())
    }

    pub fn player_identifier(&self, id: u8) -> Option<String> {
        self.registry
            .blocking_get(PlayerId(id))
            .map(|s| s.token().to_string())
    }

    pub fn player_count(&self) -> usize {
        self.registry.blocking_snapshot().len()
    }

    pub fn players(&self) -> Vec<(u8, String)> {
        self.registry
            .blocking_snapshot()
            .into_iter()
            .map(|s| (s.id().0, s.name().to_string()))
            .collect()
    }

    pub fn is_connected(&self, id: u8) -> bool {
        self.registry
            .blocking_get(PlayerId(id))
            .is_some_and(|s| s.udp_connected())
    }

    /// Vehicle ids and state blobs (sans the code prefix) of one player.
    pub fn player_vehicles(&self, id: u8) -> Vec<(u8, String)> {
        let Some(session) = self.registry.blocking_get(PlayerId(id)) else {
            return Vec::new();
        };
        session.with_vehicles(|t| {
            t.iter()
                .map(|(vid, blob)| (vid, blob.get(3..).unwrap_or_default().to_string()))
                .collect()
        })
    }

    // ─── Commands ───

    /// Sends a server chat line to one player, or to everyone.
    pub fn send_chat(&self, target: Option<u8>, text: &str) {
        let data = format!("C:Server: {text}").into_bytes();
        let cmd = match target {
            Some(id) => ApiCommand::SendTo {
                id: PlayerId(id),
                data,
                reliable: true,
            },
            None => ApiCommand::Broadcast {
                data,
                reliable: true,
            },
        };
        let _ = self.commands.send(cmd);
    }

    /// Kicks a player with a chat notice. Development-role sessions are
    /// immune.
    pub fn drop_player(&self, id: u8, reason: Option<&str>) {
        let _ = self.commands.send(ApiCommand::DropPlayer {
            id: PlayerId(id),
            reason: reason.map(str::to_string),
        });
    }

    /// Authoritatively destroys a vehicle everywhere.
    pub fn remove_vehicle(&self, id: u8, vid: u8) {
        let _ = self
            .commands
            .send(ApiCommand::RemoveVehicle { id: PlayerId(id), vid });
    }

    /// Fires a client-side event on one player, or on everyone.
    pub fn trigger_client_event(&self, target: Option<u8>, name: &str, data: &str) {
        let packet = format!("E:{name}:{data}").into_bytes();
        let cmd = match target {
            Some(id) => ApiCommand::SendTo {
                id: PlayerId(id),
                data: packet,
                reliable: true,
            },
            None => ApiCommand::Broadcast {
                data: packet,
                reliable: true,
            },
        };
        let _ = self.commands.send(cmd);
    }

    // ─── Runtime settings ───

    pub fn set_debug(&self, value: bool) {
        self.config.write().expect("config poisoned").debug = value;
        info!(value, "plugin set Debug");
    }

    pub fn set_private(&self, value: bool) {
        self.config.write().expect("config poisoned").is_private = value;
        info!(value, "plugin set Private");
    }

    pub fn set_max_cars(&self, value: u8) {
        self.config.write().expect("config poisoned").max_cars = value;
        info!(value, "plugin set MaxCars");
    }

    pub fn set_max_players(&self, value: u8) {
        self.config.write().expect("config poisoned").max_players = value;
        info!(value, "plugin set MaxPlayers");
    }

    pub fn set_map(&self, value: &str) {
        self.config.write().expect("config poisoned").map = value.to_string();
        info!(value, "plugin set Map");
    }

    pub fn set_name(&self, value: &str) {
        self.config.write().expect("config poisoned").name = value.to_string();
        info!(value, "plugin set Name");
    }

    pub fn set_desc(&self, value: &str) {
        self.config.write().expect("config poisoned").desc = value.to_string();
        info!(value, "plugin set Desc");
    }
}

#[cfg(test)]
pub(crate) fn test_api() -> Arc<PluginApi> {
    use relay_shared::config::{ServerConfig, DEFAULT_TEMPLATE};

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    std::mem::forget(rx);
    let config: SharedConfig = Arc::new(std::sync::RwLock::new(
        ServerConfig::parse(DEFAULT_TEMPLATE).expect("default template parses"),
    ));
    PluginApi::new(Arc::new(Registry::default()), config, tx)
}
