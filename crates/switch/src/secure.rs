//! # Overview
//!
//! Before two peers can transmit data, the communication channel they establish needs to be secured.
//! Some transports have built-in encryption at the transport layer like QUIC,
//! while other transports (e.g. TCP, WebSocket) lack native security and require a security handshake
//! after the transport connection has been established.
//!
//! The switch negotiates the active [`Crypto`] tag on every raw connection before anything else.
use std::{io, sync::Arc};

use async_trait::async_trait;
use identity::PeerId;

use crate::Connection;

/// The tag of the [`Plaintext`] secure channel.
pub const PLAINTEXT_TAG: &str = "/plaintext/1.0.0";

/// A type alias of [`Arc<dyn Crypto>`]
pub type ArcCrypto = Arc<dyn Crypto>;

/// A secure channel plugin.
#[async_trait]
pub trait Crypto: Sync + Send {
    /// Protocol id negotiated before the handshake, e.g. `/secio/1.0.0`.
    fn tag(&self) -> &str;

    /// Run the handshake over `conn` and return the secured connection.
    ///
    /// `remote` is the expected peer id on the dialer side and `None` on the listener side.
    /// Implementations that authenticate the remote should record its id
    /// via [`Connection::set_peer_id`].
    async fn encrypt(
        &self,
        local: &PeerId,
        conn: Connection,
        remote: Option<&PeerId>,
    ) -> io::Result<Connection>;
}

/// The identity secure channel, data are transmitted unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

#[async_trait]
impl Crypto for Plaintext {
    fn tag(&self) -> &str {
        PLAINTEXT_TAG
    }

    async fn encrypt(
        &self,
        _local: &PeerId,
        conn: Connection,
        _remote: Option<&PeerId>,
    ) -> io::Result<Connection> {
        Ok(conn)
    }
}
