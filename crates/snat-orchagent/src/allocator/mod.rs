//! External IP allocation for SNAT routers.
//!
//! Internal addresses (whole subnets at enable time, single hosts or
//! subnets afterwards) are bound to the router's external IP with the
//! lowest usage count, ties going to configuration order. The first
//! binding onto an external IP triggers its route advertisement; the last
//! release withdraws it.

mod orch;

pub use orch::{AllocatorError, Allocation, ExternalIpAllocator, Result};
