//! Connection handshake.
//!
//! Sequence: the server opens with `SH:<version>`, the client answers
//! with its version (`VC…`) and identity (`NR<name>:<token>`), the token
//! is resolved to a role by the entitlement service, and admission is
//! decided. A watchdog bounds the whole exchange; every rejection closes
//! the socket without a word, as the protocol demands.
//!
//! Frames travel in cleartext; confidentiality is the job of the TLS
//! terminator in front of the listener. A second connection opening with
//! `D<id>` instead of a version attaches itself as the session's
//! auxiliary download socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use relay_shared::codec;
use relay_shared::wire::{self, PlayerId};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::server::{self, Relay};
use crate::session::Session;

/// Watchdog over the handshake frames.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Role that bypasses the player cap.
pub const DEV_ROLE: &str = "MDEV";

/// Runs the handshake for one accepted connection. Any error rejects the
/// connection quietly; the caller logs it at debug level only.
pub async fn identify(
    relay: Arc<Relay>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let greeting = format!("SH:{}", wire::SERVER_VERSION);
    codec::write_frame(&mut stream, greeting.as_bytes()).await?;

    let first = timeout(HANDSHAKE_TIMEOUT, codec::read_frame(&mut stream))
        .await
        .context("handshake watchdog")??;
    let first = codec::decode_payload(first)?;

    // A download attach is not a new player.
    if let Some(rest) = first.strip_prefix(b"D") {
        return attach_download(&relay, stream, rest).await;
    }

    let Some(version) = first.strip_prefix(b"VC") else {
        bail!("expected version frame");
    };
    let version = std::str::from_utf8(version).context("version frame")?;
    if version.len() > 4 || version != wire::CLIENT_VERSION {
        bail!("client version {version:?} not accepted");
    }

    let second = timeout(HANDSHAKE_TIMEOUT, codec::read_frame(&mut stream))
        .await
        .context("handshake watchdog")??;
    let second = codec::decode_payload(second)?;
    let ident = std::str::from_utf8(&second).context("identity frame")?;
    let ident = ident.strip_prefix("NR").context("identity prefix")?;
    let Some((name, token)) = ident.split_once(':') else {
        bail!("identity frame missing separator");
    };

    let role = relay
        .identity
        .resolve_role(token)
        .await
        .context("role lookup")?;
    if role.is_empty() || role.contains("Error") {
        bail!("identity service rejected the token");
    }
    debug!(name, role = %role, %peer, "identity resolved");

    // The same identity may hold only one live session; the older one is
    // kicked and its vehicles cleaned up by its own teardown.
    if let Some(older) = relay.registry.find_by_token(token).await {
        info!(id = %older.id(), name = %older.name(), "evicting duplicate identity");
        older.kick();
    }

    let max_players = relay.config.read().expect("config poisoned").max_players;
    let (count, devs) = relay.registry.population().await;
    if role != DEV_ROLE && count >= max_players as usize + devs {
        bail!("server is full");
    }

    let registered = relay
        .registry
        .register(|id| {
            Session::new(
                id,
                name.to_string(),
                token.to_string(),
                role.clone(),
                stream,
            )
        })
        .await;
    let Some((session, reader)) = registered else {
        bail!("session id space exhausted");
    };
    info!(
        id = %session.id(),
        name = %session.name(),
        role = %session.role(),
        %peer,
        "session admitted"
    );

    tokio::spawn(server::run_session(relay.clone(), session, reader));
    Ok(())
}

async fn attach_download(
    relay: &Arc<Relay>,
    stream: TcpStream,
    rest: &[u8],
) -> anyhow::Result<()> {
    let text = std::str::from_utf8(rest).context("download attach frame")?;
    let Some(id) = wire::parse_id(text) else {
        bail!("download attach with malformed id");
    };
    let Some(session) = relay.registry.get(PlayerId(id)).await else {
        bail!("download attach for unknown session");
    };
    if !session.is_alive() {
        bail!("download attach for closed session");
    }
    debug!(id = %session.id(), "download socket attached");
    session.attach_download(stream);
    Ok(())
}
