//! FlowOrch - flow/group programming for centralized SNAT.
//!
//! On the primary (NAPT) switch of a router the PSNAT miss flow enters the
//! translation pipeline directly. Every other candidate switch carries a
//! group that tunnels the router's traffic to the primary, referenced by
//! the same PSNAT miss flow key.
//!
//! Ordering: a group is installed before any flow referencing it, and flows
//! are removed before their group.

pub mod builder;
mod orch;
mod types;

pub use orch::{FlowOrch, FlowOrchConfig, FlowOrchError, FlowOrchStats};
pub use types::{
    flow_ref, priority, tables, Bucket, ExternalIpTarget, FlowAction, FlowEntry, FlowInstruction,
    FlowKey, FlowMatch, FlowOp, GroupEntry, GroupKey, NaptMode, ProgrammingBatch,
    RouterFlowContext, ETH_TYPE_IPV4,
};
