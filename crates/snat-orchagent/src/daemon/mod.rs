//! SNAT daemon: event model and dispatch onto the per-router job queue.

mod events;
mod natdaemon;

pub use events::NatEvent;
pub use natdaemon::{DaemonStats, NatDaemon};
