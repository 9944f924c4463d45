use std::fmt::Display;

use identity::PeerId;

/// Events broadcast to [`Switch::subscribe`](crate::Switch::subscribe) receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    /// A connection was upgraded by a stream multiplexer.
    ///
    /// `identified` is false when the identify exchange did not run or did not succeed,
    /// `peer_id` is then the id the secure channel authenticated, if any.
    PeerMuxEstablished {
        peer_id: Option<PeerId>,
        identified: bool,
    },
    /// A registered muxed connection was closed.
    PeerMuxClosed { peer_id: PeerId },
}

impl SwitchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SwitchEvent::PeerMuxEstablished { .. } => "peer:mux:established",
            SwitchEvent::PeerMuxClosed { .. } => "peer:mux:closed",
        }
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            SwitchEvent::PeerMuxEstablished { peer_id, .. } => peer_id.as_ref(),
            SwitchEvent::PeerMuxClosed { peer_id } => Some(peer_id),
        }
    }
}

impl Display for SwitchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.peer_id() {
            Some(peer_id) => write!(f, "{}({})", self.name(), peer_id),
            None => write!(f, "{}", self.name()),
        }
    }
}
