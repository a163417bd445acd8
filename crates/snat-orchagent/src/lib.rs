//! SNAT Orchagent - centralized SNAT/NAPT control plane
//!
//! Provides source NAT for logical routers on a fabric of OpenFlow
//! switches. One switch per router (the NAPT switch) performs translation;
//! every other candidate switch tunnels the router's outbound traffic to
//! it. The daemon elects that switch, distributes external IPs over the
//! router's subnets, advertises the external IPs into their VPNs, installs
//! per-session translation flows and fails everything over when the NAPT
//! switch goes down.
//!
//! # Architecture
//!
//! ```text
//! [events] ──> [NatDaemon] ──> KeyedJobQueue<RouterId>
//!                                  │
//!      ┌──────────────┬────────────┼─────────────┬──────────────┐
//!      ↓              ↓            ↓             ↓              ↓
//!  [RouterOrch]  [NaptHaOrch]  [NaptSession  [ExternalIp   [RouteBridge]
//!      │              │         Manager]     Allocator]         │
//!      └──────────────┴──── [FlowOrch] ──────────┘              ↓
//!                               ↓                         [RouteService]
//!                        [FlowProgrammer]
//! ```
//!
//! All mutable state lives in the [`store::NatStore`]; components are
//! stateless apart from counters, so a retried job re-derives everything
//! from the store.
//!
//! # Key Components
//!
//! - [`daemon::NatDaemon`]: event dispatch onto the per-router job queue
//! - [`router::RouterOrch`]: router enable, update, disable and removal
//! - [`ha::NaptHaOrch`]: NAPT switch failover
//! - [`allocator::ExternalIpAllocator`]: external IP assignment
//! - [`session::NaptSessionManager`]: per-connection translation
//! - [`flows::FlowOrch`]: flow and group programming
//! - [`bridge::RouteBridge`]: labels, FIB entries and advertisements

pub mod allocator;
pub mod audit;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod context;
pub mod daemon;
pub mod flows;
pub mod ha;
pub mod router;
pub mod selector;
pub mod services;
pub mod session;
pub mod store;

pub use config::SnatOrchConfig;
pub use daemon::{NatDaemon, NatEvent};
pub use services::NatServices;
