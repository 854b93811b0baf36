//! Resource delivery and the connect flow.
//!
//! Runs once per session, before regular dispatch: the server announces
//! the session id, answers listing (`SR`) and file (`f<path>`) requests,
//! and releases the session into the dispatch loop when the client sends
//! `Done`. Files are streamed raw, split in half across the main socket
//! and the auxiliary download socket.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relay_shared::codec;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info, warn};

use crate::plugins::HookArgs;
use crate::server::Relay;
use crate::session::{Session, SessionStatus};

/// How long the client has to open its download socket after `AG`.
pub const DOWNLOAD_GRACE: Duration = Duration::from_secs(3);

/// Bulk transfer walks the file in chunks of this size.
pub const TRANSFER_CHUNK: u64 = 125 * 1024 * 1024;

/// Full connect flow: connecting hook, resource sync, map hand-off,
/// joining hook. Transport errors bubble up and end the session.
pub async fn on_connect(
    relay: &Arc<Relay>,
    session: &Arc<Session>,
    reader: &mut OwnedReadHalf,
) -> anyhow::Result<()> {
    session.set_status(SessionStatus::SyncingResources);
    relay
        .plugins
        .trigger(
            "onPlayerConnecting",
            HookArgs::new().int(session.id().0 as i64),
            false,
        )
        .await;

    sync_resources(relay, session, reader).await?;
    if !session.is_alive() {
        return Ok(());
    }

    let map = relay.config.read().expect("config poisoned").map.clone();
    let packet = format!("M{map}");
    relay.respond(session, packet.as_bytes(), true).await;
    relay
        .plugins
        .trigger(
            "onPlayerJoining",
            HookArgs::new().int(session.id().0 as i64),
            false,
        )
        .await;
    Ok(())
}

async fn sync_resources(
    relay: &Arc<Relay>,
    session: &Arc<Session>,
    reader: &mut OwnedReadHalf,
) -> anyhow::Result<()> {
    let opening = format!("P{}", session.id());
    session.send_frame(opening.as_bytes()).await;

    while session.is_alive() {
        let frame = codec::read_frame(reader).await.context("resource request")?;
        let frame = codec::decode_payload(frame)?;
        if frame == b"Done" {
            break;
        }
        match frame.first() {
            Some(b'f') => send_file(relay, session, &frame[1..]).await?,
            Some(b'S') if frame.get(1) == Some(&b'R') => {
                debug!(id = %session.id(), "sending mod listing");
                session.send_frame(relay.mods.listing().as_bytes()).await;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Serves one archive: `CO` when it is not a listed mod, `AG` then the
/// raw bytes otherwise. The first half goes over the main socket, the
/// second over the download socket, concurrently.
async fn send_file(
    relay: &Arc<Relay>,
    session: &Arc<Session>,
    raw_path: &[u8],
) -> anyhow::Result<()> {
    let requested = std::str::from_utf8(raw_path).unwrap_or_default();
    let Some(disk) = relay.mods.resolve(requested) else {
        warn!(id = %session.id(), path = %requested, "requested file is not a served mod");
        session.send_frame(b"CO").await;
        return Ok(());
    };
    info!(id = %session.id(), path = %requested, "delivering mod archive");
    session.send_frame(b"AG").await;

    let mut download = None;
    let deadline = tokio::time::Instant::now() + DOWNLOAD_GRACE;
    while tokio::time::Instant::now() < deadline {
        if let Some(sock) = session.take_download() {
            download = Some(sock);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let Some(mut download) = download else {
        warn!(id = %session.id(), "client never opened a download socket");
        session.mark_disconnected();
        return Ok(());
    };

    let size = tokio::fs::metadata(&disk)
        .await
        .with_context(|| format!("stat {}", disk.display()))?
        .len();
    let half = size / 2;

    let head = async {
        let mut writer = session.writer().await;
        copy_range(&disk, 0, half, &mut *writer).await
    };
    let tail = copy_range(&disk, half, size - half, &mut download);
    let (head, tail) = tokio::join!(head, tail);
    if let Err(e) = head.and(tail) {
        warn!(id = %session.id(), error = %e, "file delivery failed");
        session.mark_disconnected();
    }
    Ok(())
}

async fn copy_range<W: AsyncWrite + Unpin>(
    path: &Path,
    offset: u64,
    len: u64,
    writer: &mut W,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut remaining = len;
    while remaining > 0 {
        let span = remaining.min(TRANSFER_CHUNK);
        let copied = tokio::io::copy(&mut (&mut file).take(span), writer)
            .await
            .context("stream file range")?;
        anyhow::ensure!(copied == span, "short read delivering file");
        remaining -= span;
    }
    Ok(())
}
