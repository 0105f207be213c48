//! Live state-mirror admin bridge.
//!
//! Keeps an in-memory mirror of an external object/state store, pushes every
//! change to attached WebSocket viewers and forwards their writes back to the
//! store.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod handlers;
pub mod listener;
pub mod store;
pub mod sync;
