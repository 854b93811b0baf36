use std::sync::Arc;

use relay_server::identity::StaticIdentity;
use relay_shared::wire::PlayerId;
use relay_tests::{start_relay, TestClient, TestEnv};

/// Smoke test: a client can connect, sync resources, and enter the world.
#[tokio::test]
async fn client_joins_empty_server() -> anyhow::Result<()> {
    let env = TestEnv::new("smoke");
    let (relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;

    let mut client = TestClient::connect(addr, "Alice", "tok-alice").await?;
    assert_eq!(client.id, PlayerId(0));

    let listing = client.request_listing().await?;
    assert_eq!(listing, "-");

    let map = client.finish_sync().await?;
    assert_eq!(map, "/levels/gridmap/info.json");

    client.announce().await?;
    client.join_world().await?;

    assert_eq!(relay.registry.count().await, 1);
    let session = relay.registry.get(PlayerId(0)).await.expect("session exists");
    assert_eq!(session.name(), "Alice");
    assert_eq!(session.role(), "Member");
    assert!(session.is_synced());
    Ok(())
}
