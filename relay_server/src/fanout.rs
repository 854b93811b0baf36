//! Addressed broadcast.
//!
//! Channel selection is by leading code and size: some codes always ride
//! the reliable path, vehicle/transfer codes and oversized payloads take
//! the chunked reliable-datagram path, everything else goes out as one
//! best-effort datagram. Only `Synced` sessions receive broadcasts; the
//! registry is snapshotted under a read lease before any send.

use relay_shared::wire;

use crate::server::Relay;
use crate::session::Session;

impl Relay {
    /// Sends to a single session under the standard channel policy.
    pub async fn respond(&self, session: &Session, data: &[u8], reliable: bool) {
        let Some(&code) = data.first() else {
            return;
        };
        if reliable || wire::forced_reliable(code) {
            if wire::wants_large(code, data.len()) {
                self.udp.send_large(session, data).await;
            } else {
                session.send_frame(data).await;
            }
        } else {
            self.udp.send_raw(session, data).await;
        }
    }

    /// Broadcasts to every synced session, skipping `origin` unless
    /// `include_self`.
    pub async fn send_to_all(
        &self,
        origin: Option<&Session>,
        data: &[u8],
        include_self: bool,
        reliable: bool,
    ) {
        if data.is_empty() {
            return;
        }
        let targets = self.registry.synced().await;
        for target in targets {
            if let Some(origin) = origin {
                if !include_self && target.id() == origin.id() {
                    continue;
                }
            }
            self.respond(&target, data, reliable).await;
        }
    }

    /// Broadcasts the player-list packet `Ss<count>/<max>:a,b,c`.
    pub async fn update_players(&self) {
        let names = self.registry.names().await;
        let max_players = self.config.read().expect("config poisoned").max_players;
        let packet = format!(
            "Ss{}/{}:{}",
            names.len(),
            max_players,
            names.join(",")
        );
        self.send_to_all(None, packet.as_bytes(), true, true).await;
    }
}
