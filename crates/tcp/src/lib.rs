use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::poll_fn;
use if_watch::{tokio::IfWatcher, IfEvent};
use parking_lot::Mutex;
use rp2p_switch::{
    multiaddr::{Multiaddr, Protocol},
    BoxListener, ConnHandler, Connection, Listener, Transport,
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::compat::TokioAsyncReadCompatExt;

fn to_sockaddr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut iter = addr.iter();

    let ip = match iter.next()? {
        Protocol::Ip4(ip) => IpAddr::from(ip),
        Protocol::Ip6(ip) => IpAddr::from(ip),
        _ => return None,
    };

    let port = match iter.next()? {
        Protocol::Tcp(port) => port,
        _ => return None,
    };

    match iter.next() {
        None | Some(Protocol::P2p(_)) => {}
        _ => return None,
    }

    if iter.next().is_some() {
        return None;
    }

    Some(SocketAddr::new(ip, port))
}

fn to_multiaddr(addr: SocketAddr) -> Multiaddr {
    Multiaddr::from(addr.ip()).with(Protocol::Tcp(addr.port()))
}

/// How long the interface watcher may stay silent before the address scan is complete.
const INTERFACE_SCAN_TIMEOUT: Duration = Duration::from_millis(200);

fn loopback(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
        IpAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
    }
}

/// Addresses of the up interfaces, of the same family as `ip`.
async fn interface_ips(ip: IpAddr) -> io::Result<Vec<IpAddr>> {
    let mut watcher = IfWatcher::new()?;

    let mut ips = vec![];

    while let Ok(event) = tokio::time::timeout(
        INTERFACE_SCAN_TIMEOUT,
        poll_fn(|cx| watcher.poll_if_event(cx)),
    )
    .await
    {
        match event? {
            IfEvent::Up(net) => {
                let addr = net.addr();

                if addr.is_ipv4() == ip.is_ipv4() && !ips.contains(&addr) {
                    ips.push(addr);
                }
            }
            IfEvent::Down(net) => ips.retain(|addr| *addr != net.addr()),
        }
    }

    ips.sort();

    Ok(ips)
}

/// The dialable addresses of a listener bound to `addr`.
///
/// A wildcard bind is expanded to every interface address of its family,
/// falling back to loopback when none is found.
async fn dialable(addr: SocketAddr) -> Vec<SocketAddr> {
    if !addr.ip().is_unspecified() {
        return vec![addr];
    }

    let ips = match interface_ips(addr.ip()).await {
        Ok(ips) => ips,
        Err(err) => {
            log::warn!("tcp listener {}, scan interfaces: {}", addr, err);
            vec![]
        }
    };

    if ips.is_empty() {
        log::warn!("tcp listener {}, no interface address found, use loopback", addr);

        return vec![SocketAddr::new(loopback(addr.ip()), addr.port())];
    }

    ips.into_iter()
        .map(|ip| SocketAddr::new(ip, addr.port()))
        .collect()
}

fn invalid_addr(addr: &Multiaddr) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Invalid tcp multiaddr {}", addr),
    )
}

/// Plain tcp transport, accepts `/ip4|ip6/<ip>/tcp/<port>` addresses with an optional `/p2p/<id>` suffix.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tcp;

#[async_trait]
impl Transport for Tcp {
    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs
            .iter()
            .filter(|addr| to_sockaddr(addr).is_some())
            .cloned()
            .collect()
    }

    async fn dial(&self, raddr: &Multiaddr) -> io::Result<Connection> {
        let addr = to_sockaddr(raddr).ok_or_else(|| invalid_addr(raddr))?;

        let stream = TcpStream::connect(addr).await?;

        stream.set_nodelay(true)?;

        let laddr = stream.local_addr()?;

        log::trace!("tcp connect {} => {}", laddr, addr);

        Ok(Connection::new(stream.compat())
            .with_local_addr(to_multiaddr(laddr))
            .with_peer_addr(to_multiaddr(addr)))
    }

    fn create_listener(&self, handler: ConnHandler) -> BoxListener {
        Box::new(TcpTransportListener {
            handler,
            bound: Mutex::new(None),
        })
    }
}

struct Bound {
    laddr: SocketAddr,
    dialable: Vec<SocketAddr>,
    accept_loop: JoinHandle<()>,
}

struct TcpTransportListener {
    handler: ConnHandler,
    bound: Mutex<Option<Bound>>,
}

impl Drop for TcpTransportListener {
    fn drop(&mut self) {
        if let Some(bound) = self.bound.lock().take() {
            bound.accept_loop.abort();
        }
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn listen(&self, laddr: &Multiaddr) -> io::Result<()> {
        let addr = to_sockaddr(laddr).ok_or_else(|| invalid_addr(laddr))?;

        if self.bound.lock().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "tcp listener is already listening",
            ));
        }

        let listener = TcpListener::bind(addr).await?;

        let laddr = listener.local_addr()?;

        let dialable = dialable(laddr).await;

        let handler = self.handler.clone();

        let accept_loop = tokio::spawn(async move {
            loop {
                let (stream, raddr) = match listener.accept().await {
                    Ok(incoming) => incoming,
                    Err(err) => {
                        log::error!("tcp listener {}, stopped with error: {}", laddr, err);
                        return;
                    }
                };

                log::trace!("tcp listener {}, accept {}", laddr, raddr);

                if let Err(err) = stream.set_nodelay(true) {
                    log::warn!("tcp listener {}, set nodelay on {}: {}", laddr, raddr, err);
                }

                let conn = Connection::new(stream.compat())
                    .with_local_addr(to_multiaddr(laddr))
                    .with_peer_addr(to_multiaddr(raddr));

                tokio::spawn(handler(conn));
            }
        });

        *self.bound.lock() = Some(Bound {
            laddr,
            dialable,
            accept_loop,
        });

        Ok(())
    }

    fn addrs(&self) -> io::Result<Vec<Multiaddr>> {
        Ok(self
            .bound
            .lock()
            .iter()
            .flat_map(|bound| bound.dialable.iter().copied().map(to_multiaddr))
            .collect())
    }

    async fn close(&self) -> io::Result<()> {
        let bound = self.bound.lock().take();

        if let Some(bound) = bound {
            log::trace!("tcp listener {}, closed", bound.laddr);

            bound.accept_loop.abort();

            // wait for the socket to be dropped.
            _ = bound.accept_loop.await;
        }

        Ok(())
    }
}
