use std::sync::{atomic::Ordering, Arc, Weak};

use async_trait::async_trait;
use identity::PeerId;

use crate::{
    errors::{Error, RegistryKind, Result},
    identify::{
        identity_request, identity_response, Identify, PROTOCOL_IPFS_ID, PROTOCOL_VERSION,
    },
    negotiation::select_protocol,
    switch::{RemotePeer, SharedRemotePeer, SwitchInner},
    ArcCrypto, ArcMultiplexer, ArcMuxedConnection, BoxTransport, Connection, Crypto, Multiplexer,
    Plaintext, Protocol, SwitchEvent,
};

/// The transport key the circuit relay transport is registered with.
pub const CIRCUIT_TAG: &str = "Circuit";

/// Circuit relay settings handed to the relay transport factory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitRelayConfig {
    pub enabled: bool,
    pub hop: Option<HopConfig>,
}

/// Relay hop settings, disabled by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HopConfig {
    pub enabled: bool,
    pub active: bool,
}

/// Connection upgrade settings of one [`Switch`](crate::Switch).
///
/// Created by [`Switch::connection`](crate::Switch::connection).
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<SwitchInner>,
}

impl ConnectionManager {
    pub(crate) fn new(inner: Arc<SwitchInner>) -> Self {
        Self { inner }
    }

    /// Register a stream multiplexer, for outbound upgrades and as an inbound protocol handler.
    pub fn add_stream_muxer<M: Multiplexer + 'static>(&self, muxer: M) -> Result<()> {
        let muxer: ArcMultiplexer = Arc::new(muxer);

        {
            let mut muxers = self.inner.muxers.lock();

            if muxers.iter().any(|m| m.id() == muxer.id()) {
                return Err(Error::AlreadyExists {
                    kind: RegistryKind::Multiplexer,
                    key: muxer.id().to_owned(),
                });
            }

            muxers.push(muxer.clone());
        }

        log::trace!("register stream muxer {}", muxer.id());

        self.inner.protocols.lock().insert(Arc::new(MuxerProtocol {
            muxer,
            switch: Arc::downgrade(&self.inner),
        }));

        Ok(())
    }

    /// Enable the identify exchange on inbound muxed connections and answer remote requests.
    pub fn reuse(&self) {
        self.inner.identify.store(true, Ordering::SeqCst);

        self.inner
            .protocols
            .lock()
            .insert(Arc::new(IdentifyProtocol {
                switch: Arc::downgrade(&self.inner),
            }));
    }

    /// Register the relay transport built by `factory` under [`CIRCUIT_TAG`].
    ///
    /// Does nothing unless `config.enabled`.
    pub fn enable_circuit_relay<F>(&self, mut config: CircuitRelayConfig, factory: F) -> Result<()>
    where
        F: FnOnce(&CircuitRelayConfig) -> BoxTransport,
    {
        if !config.enabled {
            return Ok(());
        }

        config.hop.get_or_insert_with(HopConfig::default);

        log::trace!("enable circuit relay, {:?}", config);

        let transport = factory(&config);

        crate::TransportManager::new(self.inner.clone()).add_arc(CIRCUIT_TAG, Arc::from(transport))
    }

    /// Replace the active secure channel.
    pub fn crypto<C: Crypto + 'static>(&self, crypto: C) {
        let crypto: ArcCrypto = Arc::new(crypto);

        let previous = std::mem::replace(&mut *self.inner.crypto.lock(), crypto.clone());

        let mut protocols = self.inner.protocols.lock();

        protocols.remove(previous.tag());

        log::trace!("replace secure channel {} with {}", previous.tag(), crypto.tag());

        protocols.insert(Arc::new(CryptoProtocol {
            crypto,
            switch: Arc::downgrade(&self.inner),
        }));
    }

    /// Restore the plaintext secure channel.
    pub fn crypto_default(&self) {
        self.crypto(Plaintext)
    }

    /// The tag of the active secure channel.
    pub fn crypto_tag(&self) -> String {
        self.inner.crypto.lock().tag().to_owned()
    }

    /// Registered stream multiplexer ids, in registration order.
    pub fn stream_muxers(&self) -> Vec<String> {
        self.inner
            .muxers
            .lock()
            .iter()
            .map(|m| m.id().to_owned())
            .collect()
    }
}

/// Inbound handler of a secure channel tag: handshake, then negotiate again over the secured connection.
pub(crate) struct CryptoProtocol {
    pub(crate) crypto: ArcCrypto,
    pub(crate) switch: Weak<SwitchInner>,
}

#[async_trait]
impl Protocol for CryptoProtocol {
    fn id(&self) -> &str {
        self.crypto.tag()
    }

    async fn handle(&self, _protocol: String, conn: Connection) -> Result<()> {
        let Some(switch) = self.switch.upgrade() else {
            return Ok(());
        };

        let local_id = switch.local_peer_id();

        let conn = self.crypto.encrypt(&local_id, conn, None).await?;

        log::trace!("{:?}, secured by {}", conn, self.crypto.tag());

        if let Some(peer_id) = conn.peer_id() {
            conn.attribute(*peer_id);
        }

        let negotiated = switch.protocol_muxer().handle(conn).await?;

        log::trace!("secured connection, {:?}", negotiated);

        Ok(())
    }
}

/// Inbound handler of a stream multiplexer id.
struct MuxerProtocol {
    muxer: ArcMultiplexer,
    switch: Weak<SwitchInner>,
}

#[async_trait]
impl Protocol for MuxerProtocol {
    fn id(&self) -> &str {
        self.muxer.id()
    }

    async fn handle(&self, _protocol: String, conn: Connection) -> Result<()> {
        let Some(switch) = self.switch.upgrade() else {
            return Ok(());
        };

        let authenticated = conn.peer_id().copied();

        let name = format!("{:?}", conn);

        let meter = conn.meter().cloned();

        let muxed: ArcMuxedConnection = Arc::from(self.muxer.listener(conn)?);

        log::trace!("{}, muxed by {}", name, self.muxer.id());

        let remote = RemotePeer::shared(None);

        // the remote may open streams before answering identify.
        SwitchInner::spawn_serve(switch.clone(), muxed.clone(), remote.clone());

        if !switch.identify.load(Ordering::SeqCst) {
            switch.emit(SwitchEvent::PeerMuxEstablished {
                peer_id: authenticated,
                identified: false,
            });

            return Ok(());
        }

        let exchange = tokio::time::timeout(switch.identify_timeout, identify(&switch, &muxed));

        let identified = match exchange.await {
            Ok(Ok(identified)) => Some(identified),
            Ok(Err(err)) => {
                log::warn!("{}, identify failed: {}", name, err);
                None
            }
            Err(_) => {
                log::warn!(
                    "{}, identify timeout after {:?}",
                    name,
                    switch.identify_timeout
                );
                None
            }
        };

        let Some((peer_id, identify)) = identified else {
            switch.emit(SwitchEvent::PeerMuxEstablished {
                peer_id: authenticated,
                identified: false,
            });

            return Ok(());
        };

        if let Some(meter) = &meter {
            meter.attribute(peer_id);
        }

        register_identified(&switch, &muxed, &remote, peer_id, identify).await;

        Ok(())
    }
}

/// Run the identify exchange as the requester over a new substream of `muxed`.
async fn identify(
    switch: &SwitchInner,
    muxed: &ArcMuxedConnection,
) -> Result<(PeerId, Identify)> {
    let mut stream = muxed.new_stream().await?;

    select_protocol(&mut stream, [PROTOCOL_IPFS_ID]).await?;

    let mut stream = switch.meter_protocol(stream, PROTOCOL_IPFS_ID);

    identity_request(&mut stream, switch.max_identity_packet_len).await
}

/// Record the identified peer, then register `muxed` under its id unless the
/// connection closed in the meantime.
async fn register_identified(
    switch: &SwitchInner,
    muxed: &ArcMuxedConnection,
    remote: &SharedRemotePeer,
    peer_id: PeerId,
    identify: Identify,
) {
    if let Some(observed) = &identify.observed_addr {
        switch.local.lock().add_multiaddr(observed.clone());
    }

    let mut peer_info = identify.peer_info(peer_id);

    let connected = peer_info
        .multiaddrs()
        .first()
        .cloned()
        .unwrap_or_else(|| peer_info.p2p_addr());

    peer_info.connect(connected);
    peer_info.set_identified(true);

    if let Err(err) = switch.peer_book.put(peer_info).await {
        log::error!("peer book, put {} failed: {}", peer_id, err);
    }

    let registered = {
        let mut remote = remote.lock();

        if remote.closed {
            false
        } else {
            remote.peer_id = Some(peer_id);

            switch.muxed_conns.lock().insert(peer_id, muxed.clone());

            switch.emit(SwitchEvent::PeerMuxEstablished {
                peer_id: Some(peer_id),
                identified: true,
            });

            true
        }
    };

    if !registered {
        log::trace!("identified peer {}, connection already closed", peer_id);

        switch.mark_disconnected(&peer_id).await;

        return;
    }

    log::trace!(
        "identified peer {}, agent={}",
        peer_id,
        identify.agent_version
    );
}

/// The responder of `/ipfs/id/1.0.0`.
struct IdentifyProtocol {
    switch: Weak<SwitchInner>,
}

#[async_trait]
impl Protocol for IdentifyProtocol {
    fn id(&self) -> &str {
        PROTOCOL_IPFS_ID
    }

    async fn handle(&self, _protocol: String, mut conn: Connection) -> Result<()> {
        let Some(switch) = self.switch.upgrade() else {
            return Ok(());
        };

        let protocols = switch.protocols.lock().ids();

        let identify = {
            let local = switch.local.lock();

            let Some(public_key) = local.public_key().cloned() else {
                return Err(Error::NoPublicKey);
            };

            Identify {
                public_key: Some(public_key),
                protocol_version: PROTOCOL_VERSION.to_owned(),
                agent_version: switch.agent_version.clone(),
                listen_addrs: local.multiaddrs().to_vec(),
                observed_addr: conn.peer_addr().cloned(),
                protocols,
            }
        };

        identity_response(&mut conn, &identify).await?;

        Ok(())
    }
}
