//! Mod listing and split-socket file delivery.

use std::sync::Arc;

use relay_server::identity::StaticIdentity;
use relay_tests::{start_relay, TestClient, TestEnv};
use tokio::io::AsyncReadExt;

const MOD_SIZE: usize = 300_000;

fn mod_bytes() -> Vec<u8> {
    (0..MOD_SIZE).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn listing_and_split_file_delivery() -> anyhow::Result<()> {
    let env = TestEnv::new("transfer");
    let client_dir = env.path().join("Resources/Client");
    std::fs::create_dir_all(&client_dir)?;
    std::fs::write(client_dir.join("trackpack.zip"), mod_bytes())?;

    let (relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    let wire_path = relay.mods.entries()[0].path.clone();

    let mut client = TestClient::connect(addr, "Alice", "tok-a").await?;

    let listing = client.request_listing().await?;
    assert_eq!(listing, format!("{wire_path};{MOD_SIZE};"));

    // Requests outside the served index are refused.
    client.send_packet(b"fClient/absent.zip").await?;
    assert_eq!(client.recv_tcp().await?, b"CO");

    // A listed archive is granted and arrives in two raw halves.
    client
        .send_packet(format!("f{wire_path}").as_bytes())
        .await?;
    assert_eq!(client.recv_tcp().await?, b"AG");

    let mut download = client.open_download_socket().await?;
    let half = MOD_SIZE / 2;
    let head = client.recv_raw(half).await?;
    let mut tail = vec![0u8; MOD_SIZE - half];
    download.read_exact(&mut tail).await?;

    let mut whole = head;
    whole.extend_from_slice(&tail);
    assert_eq!(whole, mod_bytes());

    // The session is released into regular dispatch afterwards.
    let map = client.finish_sync().await?;
    assert_eq!(map, "/levels/gridmap/info.json");
    client.announce().await?;
    client.join_world().await?;
    Ok(())
}
