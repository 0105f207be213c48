mod connection;
mod hub;
mod mirror;

pub use connection::ViewerSession;
pub use hub::BroadcastHub;
pub use mirror::{MirrorCache, MirrorDelta};
