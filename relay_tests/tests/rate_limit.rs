//! Admission guard behaviour under rapid reconnects.

use std::sync::Arc;

use anyhow::Context;
use relay_server::identity::StaticIdentity;
use relay_shared::codec;
use relay_tests::{start_relay, TestEnv};
use tokio::net::TcpStream;

/// Five connections inside the window: the early ones reach the
/// handshake, the later ones are cut before it, and the address lands in
/// the block file.
#[tokio::test]
async fn rapid_reconnects_get_blocked_and_persisted() -> anyhow::Result<()> {
    let env = TestEnv::new("rate-limit");
    let (_relay, addr) = start_relay(&env, Arc::new(StaticIdentity::permissive())).await?;

    let mut greeted = 0;
    let mut refused = 0;
    for _ in 0..5 {
        let mut stream = TcpStream::connect(addr).await?;
        let greeting =
            tokio::time::timeout(std::time::Duration::from_secs(2), codec::read_frame(&mut stream))
                .await
                .context("no verdict from server")?;
        match greeting {
            Ok(frame) => {
                assert!(frame.starts_with(b"SH:"));
                greeted += 1;
            }
            Err(_) => refused += 1,
        }
    }
    assert_eq!(greeted, 3, "window admits three attempts");
    assert_eq!(refused, 2, "threshold cuts the rest");

    // Once blocked, always blocked: monotonic until the file is cleared.
    let mut stream = TcpStream::connect(addr).await?;
    assert!(
        tokio::time::timeout(std::time::Duration::from_secs(2), codec::read_frame(&mut stream))
            .await?
            .is_err()
    );

    let blocked = std::fs::read_to_string(env.path().join("blocked.txt"))?;
    assert!(blocked.contains("127.0.0.1"));
    Ok(())
}
