//! rp2p is a libp2p style networking stack built around a [`Switch`].
//!
//! This crate re-exports the switch together with the bundled [`tcp`] transport
//! and the [`yamux`] stream multiplexer.
pub use rp2p_switch::*;

pub mod tcp {
    pub use rp2p_tcp::*;
}

pub mod yamux {
    pub use rp2p_yamux::*;
}

/// Create a [`Switch`] for `local`, with the tcp transport and the yamux multiplexer registered.
///
/// Identify is enabled, call [`Switch::start`] to listen on the local tcp addresses.
pub fn tcp_yamux_switch(local: PeerInfo) -> Result<Switch> {
    let switch = SwitchBuilder::new(local).create();

    switch.transport().add("tcp", tcp::Tcp)?;

    switch.connection().add_stream_muxer(yamux::Yamux::default())?;

    switch.connection().reuse();

    Ok(switch)
}
