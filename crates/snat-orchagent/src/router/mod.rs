//! RouterOrch - SNAT lifecycle of logical routers.
//!
//! Turns router create/update/delete events into the matching sequence of
//! id allocation, external IP distribution, NAPT switch election, flow
//! programming and route advertisement. Also reconciles routers when a
//! switch comes back and when an external VPN is attached or detached.

mod orch;

pub use orch::{RouterOrch, RouterOrchError, Result, VpnAction, GROUP_POOL, SEGMENT_POOL};
