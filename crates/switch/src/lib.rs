//! The transport-agnostic connection and protocol multiplexing layer of rp2p.
//!
//! A [`Switch`] coordinates pluggable [`Transport`]s, races dial attempts with a
//! [`LimitDialer`], upgrades raw connections with a [`Crypto`] secure channel and a
//! [`Multiplexer`], and dispatches every negotiated stream to the handler registered
//! in its [`ProtocolTable`].
mod proto {
    include!(concat!(env!("OUT_DIR"), "/proto/mod.rs"));
}

mod errors;
pub use errors::*;

mod transport;
pub use transport::*;

mod muxing;
pub use muxing::*;

mod secure;
pub use secure::*;

mod peer;
pub use peer::*;

mod book;
pub use book::*;

mod protocol;
pub use protocol::*;

mod negotiation;
pub use negotiation::*;

mod dialer;
pub use dialer::*;

pub mod identify;

mod stats;
pub use stats::*;

mod events;
pub use events::*;

mod transport_manager;
pub use transport_manager::*;

mod connection_manager;
pub use connection_manager::*;

mod switch;
pub use switch::*;

pub use identity;
pub use identity::PeerId;
pub use multiaddr;
pub use multiaddr::Multiaddr;
