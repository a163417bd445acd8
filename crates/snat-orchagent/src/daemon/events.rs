//! Inbound events of the SNAT control plane.

use serde::{Deserialize, Serialize};
use snat_types::{RouterId, SessionKey, SwitchId, VpnId};
use std::fmt;

use crate::router::VpnAction;
use crate::store::RouterConfig;

/// One event, as read from the event stream (one JSON object per line,
/// tagged by `event`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NatEvent {
    /// Router created or updated.
    RouterChanged { router: RouterConfig },
    RouterRemoved { router: RouterId },
    SwitchDown { switch: SwitchId },
    SwitchUp { switch: SwitchId },
    VpnAssociationChanged {
        router: RouterId,
        vpn: VpnId,
        action: VpnAction,
    },
    /// First packet of an untranslated connection, punted by the NAPT
    /// switch.
    PacketIn { router: RouterId, session: SessionKey },
    SessionExpired { router: RouterId, session: SessionKey },
}

impl NatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NatEvent::RouterChanged { .. } => "router_changed",
            NatEvent::RouterRemoved { .. } => "router_removed",
            NatEvent::SwitchDown { .. } => "switch_down",
            NatEvent::SwitchUp { .. } => "switch_up",
            NatEvent::VpnAssociationChanged { .. } => "vpn_association_changed",
            NatEvent::PacketIn { .. } => "packet_in",
            NatEvent::SessionExpired { .. } => "session_expired",
        }
    }

    /// Router the event is about; switch events fan out to many.
    pub fn router(&self) -> Option<&RouterId> {
        match self {
            NatEvent::RouterChanged { router } => Some(&router.id),
            NatEvent::RouterRemoved { router }
            | NatEvent::VpnAssociationChanged { router, .. }
            | NatEvent::PacketIn { router, .. }
            | NatEvent::SessionExpired { router, .. } => Some(router),
            NatEvent::SwitchDown { .. } | NatEvent::SwitchUp { .. } => None,
        }
    }
}

impl fmt::Display for NatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatEvent::SwitchDown { switch } | NatEvent::SwitchUp { switch } => {
                write!(f, "{}(switch {})", self.name(), switch)
            }
            NatEvent::PacketIn { router, session } | NatEvent::SessionExpired { router, session } => {
                write!(f, "{}(router {}, {})", self.name(), router, session)
            }
            _ => match self.router() {
                Some(router) => write!(f, "{}(router {})", self.name(), router),
                None => f.write_str(self.name()),
            },
        }
    }
}
