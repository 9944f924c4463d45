use std::{
    fmt::Debug,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{future::BoxFuture, AsyncRead, AsyncWrite};
use identity::PeerId;
use multiaddr::Multiaddr;

use crate::stats::Meter;

/// A type alias of [`Box<dyn Listener>`]
pub type BoxListener = Box<dyn Listener>;

/// A type alias of [`Arc<dyn Transport>`]
pub type ArcTransport = Arc<dyn Transport>;

/// A type alias of [`Box<dyn Transport>`]
pub type BoxTransport = Box<dyn Transport>;

/// A type alias of [`Box<dyn Stream>`]
pub type BoxStream = Box<dyn Stream>;

/// The callback a [`Listener`] invokes for every accepted [`Connection`].
///
/// The listener is responsible for driving the returned future to completion,
/// usually by spawning it.
pub type ConnHandler = Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transport is a facade of one transport layer protocol.
///
/// It provide a entry to create a client-side connection to peer or
/// create a server-side listener to accept incoming connections.
///
/// This type is used as a transport plugin and is usually injected into the `Switch` context
/// via [`TransportManager::add`](crate::TransportManager::add),
/// End-users should call ***Switch-related*** functions to create a listener or create an outbound connection.
#[async_trait]
pub trait Transport: Sync + Send {
    /// Returns the subset of `addrs` this transport is able to dial or listen on.
    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr>;

    /// Create a client socket and establish one [`Connection`] to `raddr`.
    async fn dial(&self, raddr: &Multiaddr) -> io::Result<Connection>;

    /// Create a listener, that passes every accepted connection to `handler`.
    fn create_listener(&self, handler: ConnHandler) -> BoxListener;
}

#[async_trait]
pub trait Listener: Sync + Send {
    /// Bind the listener on `laddr` and start accepting connections.
    async fn listen(&self, laddr: &Multiaddr) -> io::Result<()>;

    /// Returns local bound addresses.
    ///
    /// This can be useful, for example, when binding to port 0 to figure out which port was
    /// actually bound.
    fn addrs(&self) -> io::Result<Vec<Multiaddr>>;

    /// Stop accepting connections.
    async fn close(&self) -> io::Result<()>;
}

/// A stream to read/write data between local node and peer.
pub trait Stream: AsyncWrite + AsyncRead + Send + Unpin {}

impl<T> Stream for T where T: AsyncWrite + AsyncRead + Send + Unpin {}

/// A bi-directional byte stream between local node and peer.
///
/// The same type represents a raw transport connection, a connection wrapped by a
/// secure channel and a substream of a muxed connection. Wrapping keeps the
/// addresses and the authenticated peer id of the underlying connection.
pub struct Connection {
    stream: BoxStream,
    local_addr: Option<Multiaddr>,
    peer_addr: Option<Multiaddr>,
    peer_id: Option<PeerId>,
    meter: Option<Meter>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "connection, {:?} => {:?}",
            self.local_addr.as_ref().unwrap_or(&Multiaddr::empty()),
            self.peer_addr.as_ref().unwrap_or(&Multiaddr::empty())
        )
    }
}

impl Connection {
    /// Create a connection without any address metadata.
    pub fn new<S: Stream + 'static>(stream: S) -> Self {
        Self {
            stream: Box::new(stream),
            local_addr: None,
            peer_addr: None,
            peer_id: None,
            meter: None,
        }
    }

    pub fn with_local_addr(mut self, laddr: Multiaddr) -> Self {
        self.local_addr = Some(laddr);
        self
    }

    pub fn with_peer_addr(mut self, raddr: Multiaddr) -> Self {
        self.peer_addr = Some(raddr);
        self
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// Replace the byte stream with `f(stream)`, keeping addresses and peer id.
    pub fn map<F, S>(self, f: F) -> Self
    where
        F: FnOnce(BoxStream) -> S,
        S: Stream + 'static,
    {
        Self {
            stream: Box::new(f(self.stream)),
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            peer_id: self.peer_id,
            meter: self.meter,
        }
    }

    /// Create a sibling connection over `stream`, that shares this connection's metadata.
    pub fn derive<S: Stream + 'static>(&self, stream: S) -> Self {
        Self {
            stream: Box::new(stream),
            local_addr: self.local_addr.clone(),
            peer_addr: self.peer_addr.clone(),
            peer_id: self.peer_id,
            meter: self.meter.clone(),
        }
    }

    /// Returns local bind address.
    pub fn local_addr(&self) -> Option<&Multiaddr> {
        self.local_addr.as_ref()
    }

    /// Returns the remote address that this connection is connected to.
    pub fn peer_addr(&self) -> Option<&Multiaddr> {
        self.peer_addr.as_ref()
    }

    /// Return peer's id, if known.
    ///
    /// Set by the dialer or by a secure channel that authenticated the remote.
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn set_peer_id(&mut self, peer_id: PeerId) {
        self.peer_id = Some(peer_id);
    }

    pub(crate) fn meter(&self) -> Option<&Meter> {
        self.meter.as_ref()
    }

    pub(crate) fn set_meter(&mut self, meter: Meter) {
        self.meter = Some(meter);
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_close(cx)
    }
}
