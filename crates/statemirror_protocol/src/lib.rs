//! # Statemirror wire protocol
//!
//! Shared message types for the statemirror bridge.
//!
//! This crate provides:
//! - **Viewer protocol**: JSON frames exchanged between a connected viewer and
//!   the bridge ([`ClientMessage`], [`ServerMessage`])
//! - **Store protocol**: JSON frames exchanged between the bridge and the
//!   upstream object/state store ([`StoreRequest`], [`StoreFrame`])
//! - **Value helpers**: state normalization and object merge-patching
//!
//! Used by `statemirror_server` and by test clients that speak to it.

pub mod store;
pub mod value;
pub mod viewer;

pub use store::{StoreFrame, StoreOp, StoreRequest};
pub use value::{STATE_VALUE_FIELD, merge_patch, normalize_state};
pub use viewer::{ClientMessage, ServerMessage};
