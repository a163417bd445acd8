//! NAPT session translation.
//!
//! The translation-miss flow on the NAPT switch punts the first packet of
//! every new internal connection. The session manager binds it to an
//! external (ip, port), records it in the session map and installs the
//! forward and reverse translation flows. Sessions are replayed onto a new
//! NAPT switch after failover.

mod orch;

pub use orch::{NaptSessionManager, Result, SessionConfig, SessionError, SessionFilter};
