//! `relay_server`
//!
//! The authoritative relay: admission, handshake, per-session dispatch,
//! datagram reliability, plugin hooks, resource delivery, and the
//! discovery heartbeat. Transport-independent pieces (wire grammar,
//! codec, configuration) live in `relay_shared`.

pub mod dispatch;
pub mod fanout;
pub mod handshake;
pub mod heartbeat;
pub mod identity;
pub mod plugins;
pub mod registry;
pub mod server;
pub mod session;
pub mod sync;
pub mod udp;
pub mod vehicles;
