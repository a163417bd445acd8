//! NaptHaOrch - NAPT switch failover.
//!
//! When a router's NAPT switch goes down a new one is elected with the
//! failed switch excluded, the primary flow set and every live session are
//! installed on it, ordinary switches are re-pointed, routes follow the new
//! next hop, and the old switch is cleaned up on a best-effort basis. A
//! failed cleanup is remembered and retried when the switch comes back.
//!
//! Migration is convergent rather than exactly-once: running it again for
//! the same target yields the same flow state.

mod orch;

pub use orch::{
    FailoverOutcome, MigrationReport, NaptHaConfig, NaptHaError, NaptHaOrch, NaptHaStats,
    NoSwitchAction, Result,
};
