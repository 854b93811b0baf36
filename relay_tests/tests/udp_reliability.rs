//! Datagram reliability end to end: chunking, acknowledgements,
//! reassembly, retransmission.

use std::sync::Arc;
use std::time::Duration;

use relay_server::identity::StaticIdentity;
use relay_tests::{start_relay, TestClient, TestEnv};

/// A 2500-byte transform packet splits into three chunks that reassemble
/// byte-identical at the peer, and every chunk's pending record clears on
/// acknowledgement.
#[tokio::test]
async fn large_packet_splits_and_reassembles() -> anyhow::Result<()> {
    let env = TestEnv::new("udp-split");
    let (relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    let mut alice = TestClient::full_join(addr, "Alice", "tok-a").await?;
    let mut bob = TestClient::full_join(addr, "Bob", "tok-b").await?;

    let mut payload = b"Ot:0-0:".to_vec();
    payload.extend((0..2493u32).map(|i| b'a' + (i % 26) as u8));
    assert_eq!(payload.len(), 2500);

    alice.send_packet(&payload).await?;

    // Transform packets relay to peers only.
    let got = bob.expect_udp("Ot:").await?;
    assert_eq!(got, payload);
    assert!(
        alice
            .recv_udp_packet(Duration::from_millis(300))
            .await
            .is_err(),
        "transform must not echo to the sender"
    );

    // Bob acknowledged every chunk, so nothing stays pending.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(relay.udp.pending_len(), 0);
    Ok(())
}

/// An unacknowledged reliable datagram is retransmitted; the receiver's
/// dedupe window delivers it once.
#[tokio::test]
async fn retransmissions_are_deduplicated() -> anyhow::Result<()> {
    let env = TestEnv::new("udp-dedupe");
    let (relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;
    let mut alice = TestClient::full_join(addr, "Alice", "tok-a").await?;
    let mut bob = TestClient::full_join(addr, "Bob", "tok-b").await?;

    // A small vehicle packet rides a single reliable datagram.
    alice
        .send_packet(b"Os:0:coupe,Default,{\"parts\":\"stock\"}")
        .await?;

    // Let the 200 ms retransmission loop resend a few times before the
    // client starts reading (its first read acknowledges).
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(relay.udp.pending_len() > 0);

    let first = bob.expect_udp("Os:").await?;
    assert!(first.starts_with(b"Os:Member:Alice:0-0"));

    // Any retransmitted copies are dropped by the dedupe window.
    assert!(bob
        .recv_udp_packet(Duration::from_millis(400))
        .await
        .is_err());

    // The spawn broadcast also targeted the sender; ack it there too,
    // then the pending table drains completely.
    alice.expect_udp("Os:").await?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(relay.udp.pending_len(), 0);
    Ok(())
}
