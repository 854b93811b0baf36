//! Vehicle sub-protocol (code `O`, sub-code at index 1).
//!
//! Identity on the wire is `playerId-vehicleId`. Both fields must be all
//! digits and the player id must match the sending session; anything else
//! is dropped silently.

use std::sync::Arc;

use relay_shared::vehicle;
use relay_shared::wire::parse_id;
use tracing::debug;

use crate::plugins::HookArgs;
use crate::server::Relay;
use crate::session::Session;

pub async fn handle(relay: &Arc<Relay>, session: &Arc<Session>, packet: Vec<u8>) {
    if packet.len() < 4 || packet[2] != b':' {
        return;
    }
    let Ok(text) = String::from_utf8(packet) else {
        return;
    };
    match text.as_bytes()[1] {
        b's' => spawn(relay, session, &text).await,
        b'c' => edit(relay, session, &text).await,
        b'd' => delete(relay, session, &text).await,
        // Reset and transform relay to peers only.
        b'r' | b't' => {
            relay
                .send_to_all(Some(session), text.as_bytes(), false, true)
                .await;
        }
        other => {
            debug!(id = %session.id(), sub = %(other as char), "unhandled vehicle sub-code");
        }
    }
}

/// Spawn request. The packet arrives with a placeholder identity; the
/// server allocates the vehicle id and rewrites it to
/// `Os:<role>:<name>:<pid>-<vid>…` before anyone sees it. Over-cap and
/// hook-vetoed spawns are answered with the rewritten spawn followed by
/// an `Od:` cancel, to the sender only.
async fn spawn(relay: &Arc<Relay>, session: &Arc<Session>, text: &str) {
    if !text[3..].starts_with('0') {
        return;
    }
    let pid = session.id();
    let (vid, car_count) = session.with_vehicles(|t| (t.open_id(), t.count()));
    let rewritten = format!(
        "Os:{}:{}:{}-{}{}",
        session.role(),
        session.name(),
        pid,
        vid,
        &text[4..]
    );

    let max_cars = relay.config.read().expect("config poisoned").max_cars;
    let vetoed = car_count >= max_cars as usize
        || relay
            .plugins
            .trigger(
                "onVehicleSpawn",
                HookArgs::new()
                    .int(pid.0 as i64)
                    .int(vid as i64)
                    .str(&rewritten[3..]),
                true,
            )
            .await
            != 0;

    if vetoed {
        relay.respond(session, rewritten.as_bytes(), true).await;
        let cancel = format!("Od:{pid}-{vid}");
        relay.respond(session, cancel.as_bytes(), true).await;
        debug!(id = %pid, vid, "spawn cancelled (cap or hook)");
    } else {
        session.with_vehicles(|t| t.insert(vid, rewritten.clone()));
        relay.send_to_all(None, rewritten.as_bytes(), true, true).await;
        debug!(id = %pid, vid, name = %session.name(), "vehicle spawned");
    }
}

/// Edit. The hook may veto, which destroys the vehicle; otherwise the
/// edit is relayed to peers and folded into the cached state.
async fn edit(relay: &Arc<Relay>, session: &Arc<Session>, text: &str) {
    let data = &text[3..];
    let Some((pid, vid)) = parse_identity(data, true) else {
        return;
    };
    if pid != session.id().0 {
        return;
    }

    let vetoed = relay
        .plugins
        .trigger(
            "onVehicleEdited",
            HookArgs::new().int(pid as i64).int(vid as i64).str(data),
            true,
        )
        .await
        != 0;

    if vetoed {
        let cancel = format!("Od:{pid}-{vid}");
        relay.respond(session, cancel.as_bytes(), true).await;
        session.with_vehicles(|t| t.remove(vid));
        return;
    }

    relay
        .send_to_all(Some(session), text.as_bytes(), false, true)
        .await;
    session.with_vehicles(|t| {
        if let Some(old) = t.get(vid).cloned() {
            if let Some(merged) = vehicle::merge_state(&old, text) {
                t.set(vid, merged);
            }
        }
    });
}

/// Delete: relayed to everyone (sender included), hook notified, state
/// dropped.
async fn delete(relay: &Arc<Relay>, session: &Arc<Session>, text: &str) {
    let data = &text[3..];
    let Some((pid, vid)) = parse_identity(data, false) else {
        return;
    };
    if pid != session.id().0 {
        return;
    }

    relay.send_to_all(None, text.as_bytes(), true, true).await;
    relay
        .plugins
        .trigger(
            "onVehicleDeleted",
            HookArgs::new().int(pid as i64).int(vid as i64),
            false,
        )
        .await;
    session.with_vehicles(|t| t.remove(vid));
    debug!(id = %pid, vid, "vehicle deleted");
}

/// Parses `pid-vid` from the start of the data section. With
/// `vid_to_colon`, the vehicle id runs to the first `:`; otherwise it is
/// the whole remainder.
fn parse_identity(data: &str, vid_to_colon: bool) -> Option<(u8, u8)> {
    let dash = data.find('-')?;
    let pid = parse_id(&data[..dash])?;
    let rest = &data[dash + 1..];
    let vid_str = if vid_to_colon {
        &rest[..rest.find(':')?]
    } else {
        rest
    };
    let vid = parse_id(vid_str)?;
    Some((pid, vid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_digits() {
        assert_eq!(parse_identity("3-0:rest", true), Some((3, 0)));
        assert_eq!(parse_identity("3-0", false), Some((3, 0)));
        assert_eq!(parse_identity("3-x:rest", true), None);
        assert_eq!(parse_identity("x-0", false), None);
        assert_eq!(parse_identity("30", false), None);
        assert_eq!(parse_identity("3-0extra", false), None);
    }
}
