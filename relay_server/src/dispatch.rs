//! Packet dispatch.
//!
//! A single leading byte selects the handler. Unknown codes are ignored;
//! malformed packets are dropped without touching the session. The one
//! exception is the oversized world-data marker, which ends the offending
//! session (never the process).

use std::sync::Arc;

use relay_shared::wire::{self, codes};
use tracing::{debug, info, warn};

use crate::plugins::HookArgs;
use crate::server::Relay;
use crate::session::{Session, SessionStatus};
use crate::vehicles;

/// World-data packets beyond this size are treated as hostile.
pub const ATTACK_MARKER_LEN: usize = 500;

pub async fn dispatch(relay: &Arc<Relay>, session: &Arc<Session>, packet: Vec<u8>) {
    if packet.is_empty() {
        return;
    }
    if packet.len() > ATTACK_MARKER_LEN && packet.windows(2).any(|w| w == b"Zp") {
        warn!(
            id = %session.id(),
            len = packet.len(),
            "oversized world packet, kicking session"
        );
        session.kick();
        return;
    }

    let code = packet[0];
    if wire::is_world_data(code) {
        relay.stats.record();
        relay.send_to_all(Some(session), &packet, false, false).await;
        return;
    }

    match code {
        codes::WORLD_READY => {
            let reply = format!("P{}", session.id());
            relay.respond(session, reply.as_bytes(), true).await;
            sync_client(relay, session).await;
        }
        codes::PING => {
            relay.respond(session, b"p", false).await;
            relay.update_players().await;
        }
        codes::VEHICLE => vehicles::handle(relay, session, packet).await,
        codes::JOIN => {
            relay.send_to_all(Some(session), &packet, false, true).await;
        }
        codes::CHAT => handle_chat(relay, session, &packet).await,
        codes::EVENT => handle_event(relay, session, &packet).await,
        other => {
            debug!(id = %session.id(), code = other, "ignoring unknown packet code");
        }
    }
}

/// Marks the session synced and replays the world to it: own id already
/// answered, `Sn` to the joiner, a join announcement to everyone else,
/// then every other session's vehicles over the reliable channel.
async fn sync_client(relay: &Arc<Relay>, session: &Arc<Session>) {
    if session.is_synced() {
        return;
    }
    session.set_status(SessionStatus::Synced);

    let hello = format!("Sn{}", session.name());
    relay.respond(session, hello.as_bytes(), true).await;
    let announce = format!("JWelcome {}!", session.name());
    relay
        .send_to_all(Some(session), announce.as_bytes(), false, true)
        .await;
    relay
        .plugins
        .trigger(
            "onPlayerJoin",
            HookArgs::new().int(session.id().0 as i64),
            false,
        )
        .await;

    for other in relay.registry.snapshot().await {
        if other.id() == session.id() {
            continue;
        }
        let blobs: Vec<String> =
            other.with_vehicles(|t| t.iter().map(|(_, blob)| blob.clone()).collect());
        for blob in blobs {
            if !session.is_alive() {
                return;
            }
            relay.respond(session, blob.as_bytes(), true).await;
        }
    }
    info!(id = %session.id(), name = %session.name(), "session is now synced");
}

/// `C:<name>:<text>`: the chat hook may veto; otherwise the line is
/// relayed verbatim, sender included.
async fn handle_chat(relay: &Arc<Relay>, session: &Arc<Session>, packet: &[u8]) {
    if packet.len() < 4 {
        return;
    }
    let Some(sep) = packet[3..].iter().position(|&b| b == b':').map(|i| i + 3) else {
        return;
    };
    let Ok(message) = std::str::from_utf8(&packet[sep + 1..]) else {
        return;
    };
    let veto = relay
        .plugins
        .trigger(
            "onChatMessage",
            HookArgs::new()
                .int(session.id().0 as i64)
                .str(session.name())
                .str(message),
            true,
        )
        .await;
    if veto != 0 {
        return;
    }
    relay.send_to_all(None, packet, true, true).await;
}

/// `E:<name>:<data>`: fires the named hook without waiting.
async fn handle_event(relay: &Arc<Relay>, session: &Arc<Session>, packet: &[u8]) {
    let Ok(text) = std::str::from_utf8(packet) else {
        return;
    };
    let mut parts = text.splitn(3, ':');
    let _code = parts.next();
    let (Some(name), Some(data)) = (parts.next(), parts.next()) else {
        return;
    };
    if name.is_empty() {
        return;
    }
    relay
        .plugins
        .trigger(
            name,
            HookArgs::new().int(session.id().0 as i64).str(data),
            false,
        )
        .await;
}
