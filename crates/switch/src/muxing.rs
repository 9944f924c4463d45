//! Stream multiplexing lets peers run many logical streams over one connection,
//! so that a Kademlia query does not have to wait for a bitswap transfer.
//!
//! The concrete wire format is a plugin: implement [`Multiplexer`] and register it
//! via [`ConnectionManager::add_stream_muxer`](crate::ConnectionManager::add_stream_muxer).
use std::{io, sync::Arc};

use async_trait::async_trait;

use crate::Connection;

/// A type alias of [`Box<dyn MuxedConnection>`]
pub type BoxMuxedConnection = Box<dyn MuxedConnection>;

/// A type alias of [`Arc<dyn MuxedConnection>`]
pub type ArcMuxedConnection = Arc<dyn MuxedConnection>;

/// A type alias of [`Arc<dyn Multiplexer>`]
pub type ArcMultiplexer = Arc<dyn Multiplexer>;

/// A stream multiplexer plugin.
pub trait Multiplexer: Sync + Send {
    /// The protocol id negotiated for this multiplexer, e.g. `/yamux/1.0.0`.
    fn id(&self) -> &str;

    /// Wrap an outbound connection.
    fn dialer(&self, conn: Connection) -> io::Result<BoxMuxedConnection>;

    /// Wrap an inbound connection.
    fn listener(&self, conn: Connection) -> io::Result<BoxMuxedConnection>;
}

/// A connection that carries many substreams.
#[async_trait]
pub trait MuxedConnection: Sync + Send {
    /// Open a outbound substream.
    async fn new_stream(&self) -> io::Result<Connection>;

    /// Accept newly incoming substream.
    ///
    /// Returns `None` once the connection is closed, either locally or by the peer.
    async fn accept(&self) -> Option<Connection>;

    /// Attempt to close this connection.
    async fn close(&self) -> io::Result<()>;
}
