//! End-to-end session and vehicle scenarios.

use std::sync::Arc;
use std::time::Duration;

use relay_server::identity::StaticIdentity;
use relay_shared::wire::PlayerId;
use relay_tests::{start_relay, start_relay_with, TestClient, TestEnv};

const SPAWN: &str = "Os:0:coupe,Default,{\"parts\":\"stock\"}";
const REWRITTEN: &str = "Os:Member:Alice:0-0:coupe,Default,{\"parts\":\"stock\"}";

#[tokio::test]
async fn spawn_is_rewritten_and_broadcast() -> anyhow::Result<()> {
    let env = TestEnv::new("spawn");
    let (relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    let mut alice = TestClient::full_join(addr, "Alice", "tok-a").await?;
    let mut bob = TestClient::full_join(addr, "Bob", "tok-b").await?;

    alice.send_packet(SPAWN.as_bytes()).await?;

    // Spawn goes to every synced client, the sender included.
    assert_eq!(bob.expect_udp("Os:").await?, REWRITTEN.as_bytes());
    assert_eq!(alice.expect_udp("Os:").await?, REWRITTEN.as_bytes());

    let owner = relay.registry.get(PlayerId(0)).await.expect("alice");
    assert_eq!(owner.with_vehicles(|t| t.count()), 1);
    assert_eq!(
        owner.with_vehicles(|t| t.get(0).cloned()),
        Some(REWRITTEN.to_string())
    );
    Ok(())
}

#[tokio::test]
async fn vetoed_spawn_is_cancelled_for_sender_only() -> anyhow::Result<()> {
    let env = TestEnv::new("spawn-veto");
    let (relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    relay
        .plugins
        .load_static("no-spawns", |ctx| ctx.on("onVehicleSpawn", |_| 1));

    let mut alice = TestClient::full_join(addr, "Alice", "tok-a").await?;
    let mut bob = TestClient::full_join(addr, "Bob", "tok-b").await?;

    alice.send_packet(SPAWN.as_bytes()).await?;

    // The sender sees the rewritten spawn and its immediate cancel.
    let first = alice.expect_udp("O").await?;
    let second = alice.expect_udp("O").await?;
    let got = [first, second];
    assert!(got.iter().any(|p| p == REWRITTEN.as_bytes()));
    assert!(got.iter().any(|p| p == b"Od:0-0"));

    // No broadcast reached the peer, and the table stayed empty.
    assert!(bob.recv_udp_packet(Duration::from_millis(300)).await.is_err());
    let owner = relay.registry.get(PlayerId(0)).await.expect("alice");
    assert_eq!(owner.with_vehicles(|t| t.count()), 0);
    Ok(())
}

#[tokio::test]
async fn car_cap_cancels_excess_spawns() -> anyhow::Result<()> {
    let env = TestEnv::new("car-cap");
    let (_relay, addr) =
        start_relay_with(&env, Arc::new(StaticIdentity::permissive()), |cfg| {
            cfg.max_cars = 1;
        })
        .await?;
    let mut alice = TestClient::full_join(addr, "Alice", "tok-a").await?;

    alice.send_packet(SPAWN.as_bytes()).await?;
    assert_eq!(alice.expect_udp("Os:").await?, REWRITTEN.as_bytes());

    // Second spawn is over the cap: rewritten for vid 1, then cancelled.
    alice.send_packet(SPAWN.as_bytes()).await?;
    let first = alice.expect_udp("O").await?;
    let second = alice.expect_udp("O").await?;
    let got = [first, second];
    assert!(got.iter().any(|p| p.starts_with(b"Os:Member:Alice:0-1")));
    assert!(got.iter().any(|p| p == b"Od:0-1"));
    Ok(())
}

#[tokio::test]
async fn late_joiner_receives_existing_vehicles() -> anyhow::Result<()> {
    let env = TestEnv::new("replay");
    let (_relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    let mut alice = TestClient::full_join(addr, "Alice", "tok-a").await?;

    alice.send_packet(SPAWN.as_bytes()).await?;
    alice.expect_udp("Os:").await?;

    let mut bob = TestClient::full_join(addr, "Bob", "tok-b").await?;
    assert_eq!(bob.expect_udp("Os:").await?, REWRITTEN.as_bytes());
    Ok(())
}

#[tokio::test]
async fn duplicate_identity_evicts_older_session() -> anyhow::Result<()> {
    let env = TestEnv::new("dup-identity");
    let (relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    let mut alice = TestClient::full_join(addr, "Alice", "tok-shared").await?;
    let mut bob = TestClient::full_join(addr, "Bob", "tok-b").await?;

    alice.send_packet(SPAWN.as_bytes()).await?;
    alice.expect_udp("Os:").await?;
    bob.expect_udp("Os:").await?;

    // A second login with the same token takes over.
    let _alice2 = TestClient::full_join(addr, "Alice2", "tok-shared").await?;

    // The peer sees the old session's vehicle destroyed and the kick
    // notice (not the plain leave notice).
    assert_eq!(bob.expect_udp("Od:").await?, b"Od:0-0");
    assert_eq!(bob.expect_tcp("L").await?, b"LAlice was kicked!");

    // The evicted stream drains to a close; the replacement owns the
    // token.
    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        while alice.recv_tcp().await.is_ok() {}
    })
    .await;
    assert!(closed.is_ok(), "evicted session stream never closed");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let live = relay
        .registry
        .find_by_token("tok-shared")
        .await
        .expect("token still has a session");
    assert_eq!(live.name(), "Alice2");
    Ok(())
}

#[tokio::test]
async fn disconnect_destroys_vehicles_and_notifies() -> anyhow::Result<()> {
    let env = TestEnv::new("disconnect");
    let (relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    let mut alice = TestClient::full_join(addr, "Alice", "tok-a").await?;
    let mut bob = TestClient::full_join(addr, "Bob", "tok-b").await?;

    alice.send_packet(SPAWN.as_bytes()).await?;
    alice.expect_udp("Os:").await?;
    bob.expect_udp("Os:").await?;

    drop(alice);

    assert_eq!(bob.expect_udp("Od:").await?, b"Od:0-0");
    assert_eq!(bob.expect_tcp("L").await?, b"LAlice Left the server!");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.registry.count().await, 1);
    Ok(())
}

#[tokio::test]
async fn dev_role_bypasses_player_cap() -> anyhow::Result<()> {
    let env = TestEnv::new("dev-cap");
    let identity = Arc::new(
        StaticIdentity::permissive().with_role("tok-dev", "MDEV"),
    );
    let (_relay, addr) = start_relay_with(&env, identity, |cfg| {
        cfg.max_players = 1;
    })
    .await?;

    let _alice = TestClient::full_join(addr, "Alice", "tok-a").await?;
    // A second regular player is over capacity and rejected quietly.
    assert!(TestClient::connect(addr, "Bob", "tok-b").await.is_err());
    // The development role is exempt.
    let dev = TestClient::full_join(addr, "Dev", "tok-dev").await?;
    assert_eq!(dev.id, PlayerId(1));
    Ok(())
}

#[tokio::test]
async fn ping_echoes_and_refreshes_player_list() -> anyhow::Result<()> {
    let env = TestEnv::new("ping");
    let (_relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    let mut alice = TestClient::full_join(addr, "Alice", "tok-a").await?;

    alice.send_datagram(b"p").await?;
    assert_eq!(alice.recv_udp_packet(Duration::from_secs(2)).await?, b"p");
    assert_eq!(alice.expect_tcp("Ss").await?, b"Ss1/10:Alice");
    Ok(())
}
