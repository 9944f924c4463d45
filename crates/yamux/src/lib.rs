//! [`Multiplexer`] adapter over the [`yamux`] crate.
//!
//! Every muxed connection is driven by one spawned task, that owns the
//! [`yamux::Connection`] and serves open/close requests over a command channel.
use std::{collections::VecDeque, future::poll_fn, io, task::Poll};

use async_trait::async_trait;
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    lock::Mutex,
    AsyncRead, AsyncWrite, StreamExt,
};
use rp2p_switch::{
    BoxMuxedConnection, Connection, Multiaddr, Multiplexer, MuxedConnection, PeerId,
};
use yamux::{ConnectionError, Mode};

/// The protocol id of yamux.
pub const PROTOCOL_ID: &str = "/yamux/1.0.0";

/// The yamux [`Multiplexer`], register it via
/// [`ConnectionManager::add_stream_muxer`](rp2p_switch::ConnectionManager::add_stream_muxer).
#[derive(Debug, Clone, Default)]
pub struct Yamux {
    config: yamux::Config,
}

impl Yamux {
    /// Create new yamux multiplexer with provided [`yamux::Config`]
    pub fn with_config(config: yamux::Config) -> Self {
        Self { config }
    }

    fn create(&self, conn: Connection, mode: Mode) -> io::Result<BoxMuxedConnection> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let metadata = Metadata {
            local_addr: conn.local_addr().cloned(),
            peer_addr: conn.peer_addr().cloned(),
            peer_id: conn.peer_id().copied(),
        };

        let name = format!("yamux({:?}), {:?}", mode, conn);

        let (commands_sender, commands) = unbounded();
        let (incoming_sender, incoming) = unbounded();

        let driver = yamux::Connection::new(conn, self.config.clone(), mode);

        runtime.spawn(drive(driver, commands, incoming_sender, name));

        Ok(Box::new(YamuxConn {
            metadata,
            commands: commands_sender,
            incoming: Mutex::new(incoming),
        }))
    }
}

impl Multiplexer for Yamux {
    fn id(&self) -> &str {
        PROTOCOL_ID
    }

    fn dialer(&self, conn: Connection) -> io::Result<BoxMuxedConnection> {
        self.create(conn, Mode::Client)
    }

    fn listener(&self, conn: Connection) -> io::Result<BoxMuxedConnection> {
        self.create(conn, Mode::Server)
    }
}

enum Command {
    Open(oneshot::Sender<Result<yamux::Stream, ConnectionError>>),
    Close(oneshot::Sender<Result<(), ConnectionError>>),
}

async fn drive<T>(
    mut conn: yamux::Connection<T>,
    mut commands: UnboundedReceiver<Command>,
    incoming: UnboundedSender<yamux::Stream>,
    name: String,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut opening = VecDeque::new();
    let mut closing = None;
    let mut dropped = false;

    let result = poll_fn(|cx| {
        while closing.is_none() && !dropped {
            match commands.poll_next_unpin(cx) {
                Poll::Ready(Some(Command::Open(sender))) => opening.push_back(sender),
                Poll::Ready(Some(Command::Close(sender))) => closing = Some(sender),
                // the muxed connection handle was dropped.
                Poll::Ready(None) => dropped = true,
                Poll::Pending => break,
            }
        }

        if closing.is_some() || dropped {
            return conn.poll_close(cx);
        }

        while !opening.is_empty() {
            match conn.poll_new_outbound(cx) {
                Poll::Ready(result) => {
                    if let Some(sender) = opening.pop_front() {
                        _ = sender.send(result);
                    }
                }
                Poll::Pending => break,
            }
        }

        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if incoming.unbounded_send(stream).is_err() {
                        log::trace!("{}, drop inbound stream, nobody is accepting", name);
                    }
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    match &result {
        Ok(_) => log::trace!("{}, stopped", name),
        Err(err) => log::error!("{}, stopped with error: {}", name, err),
    }

    if let Some(sender) = closing {
        _ = sender.send(result);
    }
}

struct Metadata {
    local_addr: Option<Multiaddr>,
    peer_addr: Option<Multiaddr>,
    peer_id: Option<PeerId>,
}

struct YamuxConn {
    metadata: Metadata,
    commands: UnboundedSender<Command>,
    incoming: Mutex<UnboundedReceiver<yamux::Stream>>,
}

impl YamuxConn {
    /// Substreams carry the metadata of the muxed connection.
    fn wrap(&self, stream: yamux::Stream) -> Connection {
        let mut conn = Connection::new(stream);

        if let Some(addr) = &self.metadata.local_addr {
            conn = conn.with_local_addr(addr.clone());
        }

        if let Some(addr) = &self.metadata.peer_addr {
            conn = conn.with_peer_addr(addr.clone());
        }

        if let Some(peer_id) = self.metadata.peer_id {
            conn = conn.with_peer_id(peer_id);
        }

        conn
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "yamux connection closed")
}

fn into_io_error(err: ConnectionError) -> io::Error {
    match err {
        ConnectionError::Io(err) => err,
        err => io::Error::new(io::ErrorKind::Other, err),
    }
}

#[async_trait]
impl MuxedConnection for YamuxConn {
    async fn new_stream(&self) -> io::Result<Connection> {
        let (sender, receiver) = oneshot::channel();

        self.commands
            .unbounded_send(Command::Open(sender))
            .map_err(|_| closed())?;

        let stream = receiver
            .await
            .map_err(|_| closed())?
            .map_err(into_io_error)?;

        Ok(self.wrap(stream))
    }

    async fn accept(&self) -> Option<Connection> {
        let stream = self.incoming.lock().await.next().await?;

        Some(self.wrap(stream))
    }

    async fn close(&self) -> io::Result<()> {
        let (sender, receiver) = oneshot::channel();

        if self.commands.unbounded_send(Command::Close(sender)).is_err() {
            return Ok(());
        }

        match receiver.await {
            Ok(result) => result.map_err(into_io_error),
            // closed by someone else.
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    fn pair() -> (BoxMuxedConnection, BoxMuxedConnection) {
        let (lhs, rhs) = tokio::io::duplex(1024 * 1024);

        let peer_id = PeerId::random();

        let client = Yamux::default()
            .dialer(Connection::new(lhs.compat()).with_peer_id(peer_id))
            .unwrap();

        let server = Yamux::default()
            .listener(Connection::new(rhs.compat()))
            .unwrap();

        (client, server)
    }

    #[tokio::test]
    async fn test_open_accept() {
        _ = pretty_env_logger::try_init();

        let (client, server) = pair();

        let mut outbound = client.new_stream().await.unwrap();

        assert!(outbound.peer_id().is_some());

        outbound.write_all(b"hello world").await.unwrap();

        let mut inbound = server.accept().await.unwrap();

        let mut buf = [0; 11];

        inbound.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello world");

        inbound.write_all(b"hello").await.unwrap();

        let mut buf = [0; 5];

        outbound.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_many_streams() {
        let (client, server) = pair();

        for i in 0..10u8 {
            let mut outbound = client.new_stream().await.unwrap();

            outbound.write_all(&[i]).await.unwrap();

            let mut inbound = server.accept().await.unwrap();

            let mut buf = [0; 1];

            inbound.read_exact(&mut buf).await.unwrap();

            assert_eq!(buf[0], i);
        }
    }

    #[tokio::test]
    async fn test_close() {
        let (client, server) = pair();

        client.close().await.unwrap();

        assert!(server.accept().await.is_none());
        assert!(client.accept().await.is_none());
        assert!(client.new_stream().await.is_err());

        // closing twice is fine.
        client.close().await.unwrap();
    }

    #[test]
    fn test_without_runtime() {
        let conn = Connection::new(futures::io::Cursor::new(vec![]));

        assert!(Yamux::default().dialer(conn).is_err());
    }
}
