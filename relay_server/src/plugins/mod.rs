//! Plugin runtime.
//!
//! Plugins live under `Resources/Server/<plugin>/` as native dynamic
//! libraries and register named event handlers. Hooks run serialized per
//! plugin, under a hard timeout, and their summed return value can veto
//! the event that fired them. A watcher reloads changed libraries while
//! the server runs. Static (in-process) registration uses the same
//! contract and powers embeddings and tests.

pub mod api;
pub mod loader;
pub mod runtime;

pub use api::{ApiCommand, PluginApi};
pub use runtime::{HookArgs, HookValue, PluginContext, PluginRuntime, TimerStop};
