use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use multiaddr::Multiaddr;

use crate::{
    dialer::DialSuccess,
    errors::{Error, RegistryKind, Result},
    stats::Meter,
    switch::SwitchInner,
    ArcTransport, BoxListener, ConnHandler, Connection, PeerInfo, Transport,
};

/// The transport registry of one [`Switch`](crate::Switch).
///
/// Created by [`Switch::transport`](crate::Switch::transport).
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<SwitchInner>,
}

impl TransportManager {
    pub(crate) fn new(inner: Arc<SwitchInner>) -> Self {
        Self { inner }
    }

    /// Register `transport` under `key`.
    pub fn add<T: Transport + 'static>(&self, key: &str, transport: T) -> Result<()> {
        self.add_arc(key, Arc::new(transport))
    }

    pub fn add_arc(&self, key: &str, transport: ArcTransport) -> Result<()> {
        let mut transports = self.inner.transports.lock();

        if transports.iter().any(|(k, _)| k == key) {
            return Err(Error::AlreadyExists {
                kind: RegistryKind::Transport,
                key: key.to_owned(),
            });
        }

        log::trace!("register transport {}", key);

        transports.push((key.to_owned(), transport));

        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.transports.lock().iter().any(|(k, _)| k == key)
    }

    /// Registered transport keys, in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .transports
            .lock()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn get(&self, key: &str) -> Result<ArcTransport> {
        self.inner
            .transports
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, transport)| transport.clone())
            .ok_or_else(|| Error::TransportNotFound(key.to_owned()))
    }

    /// Dial `peer` via the transport `key`, racing every address the transport accepts.
    ///
    /// On success the peer book records `peer` as connected via the winning address.
    pub async fn connect(&self, key: &str, peer: &PeerInfo) -> Result<Connection> {
        let transport = self.get(key)?;

        let dialable = transport.filter(peer.multiaddrs());

        let DialSuccess { multiaddr, conn } = self
            .inner
            .dialer
            .dial_many(peer.id(), transport.as_ref(), &dialable)
            .await?;

        log::trace!("transport {}, connected to {} via {}", key, peer.id(), multiaddr);

        let conn = conn.metered(Meter::transport(
            self.inner.stats.clone(),
            key,
            Some(*peer.id()),
        ));

        let mut peer = peer.clone();

        peer.connect(multiaddr);

        self.inner.peer_book.put(peer).await?;

        Ok(conn)
    }

    /// Start listening on every local address the transport `key` accepts.
    ///
    /// Without a `handler`, accepted connections are negotiated against the switch's protocol table.
    /// The local peer info afterwards lists the actually bound addresses instead of the requested ones.
    /// If any address fails to bind, the listeners bound so far are closed and the local
    /// peer info is left untouched.
    pub async fn listen(&self, key: &str, handler: Option<ConnHandler>) -> Result<()> {
        let transport = self.get(key)?;

        let laddrs = transport.filter(self.inner.local.lock().multiaddrs());

        let handler = self.metered(key, handler.unwrap_or_else(|| self.default_handler()));

        let mut listeners: Vec<BoxListener> = vec![];
        let mut bound = vec![];

        for laddr in laddrs {
            let listener = transport.create_listener(handler.clone());

            let result = match listener.listen(&laddr).await {
                Ok(()) => {
                    let addrs = listener.addrs().map_err(Error::from);
                    listeners.push(listener);
                    addrs
                }
                Err(source) => Err(Error::Listen {
                    addr: laddr.clone(),
                    source,
                }),
            };

            let addrs = match result {
                Ok(addrs) => addrs,
                Err(err) => {
                    for listener in &listeners {
                        if let Err(err) = listener.close().await {
                            log::warn!("transport {}, close listener failed: {}", key, err);
                        }
                    }

                    return Err(err);
                }
            };

            log::info!("transport {}, listening on {:?}", key, addrs);

            bound.push((laddr, addrs));
        }

        {
            let mut local = self.inner.local.lock();

            for (laddr, addrs) in &bound {
                local.replace_multiaddrs(std::slice::from_ref(laddr), addrs);
            }
        }

        self.inner
            .listeners
            .lock()
            .entry(key.to_owned())
            .or_default()
            .extend(listeners);

        Ok(())
    }

    /// Close every listener of the transport `key`.
    pub async fn close(&self, key: &str) -> Result<()> {
        if !self.has(key) {
            return Err(Error::TransportNotFound(key.to_owned()));
        }

        let listeners = self
            .inner
            .listeners
            .lock()
            .remove(key)
            .unwrap_or_default();

        log::trace!("transport {}, close {} listeners", key, listeners.len());

        let results = join_all(listeners.iter().map(|listener| listener.close())).await;

        for result in results {
            result?;
        }

        Ok(())
    }

    /// Addresses bound by the listeners of `key`.
    pub fn listen_addrs(&self, key: &str) -> Result<Vec<Multiaddr>> {
        let listeners = self.inner.listeners.lock();

        let mut addrs = vec![];

        for listener in listeners.get(key).into_iter().flatten() {
            addrs.append(&mut listener.addrs()?);
        }

        Ok(addrs)
    }

    /// Count the traffic of every connection `handler` accepts under the transport `key`.
    ///
    /// The peer is credited once identified.
    fn metered(&self, key: &str, handler: ConnHandler) -> ConnHandler {
        let stats = self.inner.stats.clone();
        let key = key.to_owned();

        Arc::new(move |conn: Connection| -> BoxFuture<'static, ()> {
            let peer_id = conn.peer_id().copied();

            handler(conn.metered(Meter::transport(stats.clone(), &key, peer_id)))
        })
    }

    fn default_handler(&self) -> ConnHandler {
        let protocol_muxer = self.inner.protocol_muxer();

        Arc::new(move |conn: Connection| -> BoxFuture<'static, ()> {
            let protocol_muxer = protocol_muxer.clone();

            Box::pin(async move {
                let name = format!("{:?}", conn);

                match protocol_muxer.handle(conn).await {
                    Ok(negotiated) => log::trace!("{}, {:?}", name, negotiated),
                    Err(err) => log::error!("{}, negotiation failed: {}", name, err),
                }
            })
        })
    }
}
