//! `relay_shared`
//!
//! Libraries shared by the relay server and its test harness.
//!
//! Design goals:
//! - Keep the wire grammar in one place, separate from transport code.
//! - Clear separation of concerns (wire, codec, config, resources, admission).
//! - No `unsafe`.

pub mod codec;
pub mod config;
pub mod limiter;
pub mod resources;
pub mod vehicle;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::*;
    pub use crate::config::*;
    pub use crate::wire::*;
}
