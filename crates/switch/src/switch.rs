use std::{
    collections::HashMap,
    future::Future,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    AsyncWriteExt,
};
use identity::PeerId;
use multiaddr::{Multiaddr, Protocol as AddrProtocol};
use multistream_select::NegotiationError;
use parking_lot::Mutex;

use crate::{
    connection_manager::{CryptoProtocol, CIRCUIT_TAG},
    dialer::{LimitDialer, DEFAULT_DIAL_TIMEOUT, DEFAULT_PER_PEER_RATE_LIMIT},
    errors::{Error, Result},
    identify::DEFAULT_MAX_IDENTITY_PACKET_LEN,
    negotiation::select_protocol,
    stats::{Meter, DEFAULT_COMPUTE_THROTTLE},
    ArcCrypto, ArcMultiplexer, ArcMuxedConnection, ArcProtocol, ArcTransport, BoxListener,
    BoxPeerBook, Connection, ConnectionManager, FnProtocol, Matcher, MemoryPeerBook, PeerBook,
    PeerInfo, Plaintext, ProtocolMuxer, ProtocolTable, Stats, SwitchEvent, TransportManager,
};

/// The default `agentVersion` sent by the identify responder.
pub const DEFAULT_AGENT_VERSION: &str = concat!("rp2p/", env!("CARGO_PKG_VERSION"));

/// The default timeout of the identify exchange on inbound muxed connections.
pub const DEFAULT_IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// The remote peer of one muxed connection, shared by its serve loop and the identify exchange.
#[derive(Debug, Default)]
pub(crate) struct RemotePeer {
    /// The id the connection is registered with.
    pub(crate) peer_id: Option<PeerId>,
    /// Set once the serve loop ends, the connection must not be registered anymore.
    pub(crate) closed: bool,
}

pub(crate) type SharedRemotePeer = Arc<Mutex<RemotePeer>>;

impl RemotePeer {
    pub(crate) fn shared(peer_id: Option<PeerId>) -> SharedRemotePeer {
        Arc::new(Mutex::new(Self {
            peer_id,
            closed: false,
        }))
    }
}

/// The shared state of one switch, owned by [`Switch`] and its managers.
pub(crate) struct SwitchInner {
    pub(crate) local: Mutex<PeerInfo>,
    pub(crate) peer_book: BoxPeerBook,
    pub(crate) protocols: Arc<Mutex<ProtocolTable>>,
    /// Registration ordered.
    pub(crate) transports: Mutex<Vec<(String, ArcTransport)>>,
    pub(crate) listeners: Mutex<HashMap<String, Vec<BoxListener>>>,
    pub(crate) muxers: Mutex<Vec<ArcMultiplexer>>,
    pub(crate) crypto: Mutex<ArcCrypto>,
    pub(crate) identify: AtomicBool,
    pub(crate) muxed_conns: Mutex<HashMap<PeerId, ArcMuxedConnection>>,
    /// Secured connections no multiplexer could upgrade.
    pub(crate) conns: Mutex<HashMap<PeerId, Connection>>,
    pub(crate) dialer: LimitDialer,
    events: Mutex<Vec<UnboundedSender<SwitchEvent>>>,
    pub(crate) agent_version: String,
    pub(crate) max_identity_packet_len: usize,
    pub(crate) identify_timeout: Duration,
    pub(crate) stats: Arc<Stats>,
}

impl SwitchInner {
    pub(crate) fn local_peer_id(&self) -> PeerId {
        *self.local.lock().id()
    }

    pub(crate) fn protocol_muxer(&self) -> ProtocolMuxer {
        ProtocolMuxer::new(self.protocols.clone()).with_stats(self.stats.clone())
    }

    /// Count the traffic of `conn`, already negotiated to `protocol`.
    pub(crate) fn meter_protocol(&self, conn: Connection, protocol: &str) -> Connection {
        conn.metered(Meter::protocol(self.stats.clone(), protocol))
    }

    pub(crate) fn emit(&self, event: SwitchEvent) {
        log::trace!("emit {}", event);

        self.events
            .lock()
            .retain(|sender| sender.unbounded_send(event.clone()).is_ok());
    }

    /// Dispatch every inbound substream of `muxed` until it is closed.
    ///
    /// Substreams carry the id of `remote`, once known. On close, the registration
    /// under that id is dropped and the peer book marks the peer disconnected.
    pub(crate) fn spawn_serve(
        this: Arc<Self>,
        muxed: ArcMuxedConnection,
        remote: SharedRemotePeer,
    ) {
        tokio::spawn(async move {
            let protocol_muxer = this.protocol_muxer();

            while let Some(mut stream) = muxed.accept().await {
                if let Some(peer_id) = remote.lock().peer_id {
                    stream.set_peer_id(peer_id);
                }

                let protocol_muxer = protocol_muxer.clone();

                tokio::spawn(async move {
                    let name = format!("{:?}", stream);

                    if let Err(err) = protocol_muxer.handle(stream).await {
                        log::error!("{}, substream negotiation failed: {}", name, err);
                    }
                });
            }

            let peer_id = {
                let mut remote = remote.lock();

                remote.closed = true;

                remote.peer_id
            };

            let Some(peer_id) = peer_id else {
                log::trace!("unregistered muxed connection closed");
                return;
            };

            log::trace!("muxed connection to {} closed", peer_id);

            let current = {
                let mut muxed_conns = this.muxed_conns.lock();

                match muxed_conns.get(&peer_id) {
                    Some(registered) if Arc::ptr_eq(registered, &muxed) => {
                        muxed_conns.remove(&peer_id);
                        true
                    }
                    Some(_) => false,
                    None => true,
                }
            };

            // replaced by a newer connection to the same peer.
            if !current {
                return;
            }

            this.mark_disconnected(&peer_id).await;

            this.emit(SwitchEvent::PeerMuxClosed { peer_id });
        });
    }

    /// `put` merges and keeps the connection state, so the disconnect is written with `replace`.
    pub(crate) async fn mark_disconnected(&self, peer_id: &PeerId) {
        match self.peer_book.get(peer_id).await {
            Ok(Some(mut peer_info)) => {
                peer_info.disconnect();

                if let Err(err) = self.peer_book.replace(peer_info).await {
                    log::error!("peer book, replace {} failed: {}", peer_id, err);
                }
            }
            Ok(None) => {}
            Err(err) => log::error!("peer book, get {} failed: {}", peer_id, err),
        }
    }
}

/// The outcome of upgrading an outbound connection.
enum Upgraded {
    Muxed(ArcMuxedConnection),
    Raw(Connection),
}

/// `Switch` is the network context of one rp2p application: it owns the transports,
/// the stream multiplexers, the secure channel, the protocol table and the peer book.
///
/// You should use [`SwitchBuilder`] to configure and build the `Switch` instance.
///
/// # Examples
///
/// ```no_run
/// # async fn run() -> rp2p_switch::Result<()> {
/// use futures::AsyncWriteExt;
/// use rp2p_switch::{PeerInfo, SwitchBuilder};
///
/// let local = PeerInfo::random().with_multiaddrs(["/ip4/127.0.0.1/tcp/0".parse()?]);
///
/// let switch = SwitchBuilder::new(local).create();
///
/// switch.handle("/echo/1.0.0", |_, mut conn| async move {
///     _ = conn.close().await;
/// });
///
/// switch.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Switch {
    inner: Arc<SwitchInner>,
}

impl Switch {
    pub fn transport(&self) -> TransportManager {
        TransportManager::new(self.inner.clone())
    }

    pub fn connection(&self) -> ConnectionManager {
        ConnectionManager::new(self.inner.clone())
    }

    /// Returns a listener-side negotiator bound to this switch's protocol table.
    pub fn protocol_muxer(&self) -> ProtocolMuxer {
        self.inner.protocol_muxer()
    }

    pub fn peer_book(&self) -> &dyn PeerBook {
        self.inner.peer_book.as_ref()
    }

    pub fn local_peer_info(&self) -> PeerInfo {
        self.inner.local.lock().clone()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id()
    }

    pub fn agent_version(&self) -> &str {
        &self.inner.agent_version
    }

    /// Traffic statistics of every connection this switch carried.
    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// Register a handler for protocol `id`, replacing any handler with the same id.
    pub fn handle<F, Fut>(&self, id: &str, handler: F)
    where
        F: Fn(String, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle_protocol(Arc::new(FnProtocol::new(id, handler)));
    }

    /// Like [`handle`](Self::handle), but the handler also serves proposals `matcher` accepts.
    pub fn handle_with<F, Fut>(&self, id: &str, handler: F, matcher: Matcher)
    where
        F: Fn(String, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle_protocol(Arc::new(FnProtocol::new(id, handler).with_matcher(matcher)));
    }

    pub fn handle_protocol(&self, protocol: ArcProtocol) {
        log::trace!("handle protocol {}", protocol.id());

        self.inner.protocols.lock().insert(protocol);
    }

    pub fn unhandle(&self, id: &str) -> bool {
        self.inner.protocols.lock().remove(id).is_some()
    }

    /// Registered protocol ids, in table order.
    pub fn protocols(&self) -> Vec<String> {
        self.inner.protocols.lock().ids()
    }

    /// Receive every [`SwitchEvent`] emitted from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<SwitchEvent> {
        let (sender, receiver) = unbounded();

        self.inner.events.lock().push(sender);

        receiver
    }

    /// Peers with a registered muxed connection.
    pub fn muxed_peers(&self) -> Vec<PeerId> {
        self.inner.muxed_conns.lock().keys().copied().collect()
    }

    /// Peers with a warm connection no multiplexer upgraded.
    pub fn unmuxed_peers(&self) -> Vec<PeerId> {
        self.inner.conns.lock().keys().copied().collect()
    }

    /// Make sure a connection to `peer` exists, without opening any stream.
    pub async fn connect(&self, peer: &PeerInfo) -> Result<()> {
        if self.inner.muxed_conns.lock().contains_key(peer.id())
            || self.inner.conns.lock().contains_key(peer.id())
        {
            log::trace!("connect {}, reuse warm connection", peer.id());
            return Ok(());
        }

        match self.establish(peer).await? {
            Upgraded::Muxed(_) => {}
            Upgraded::Raw(conn) => {
                self.inner.conns.lock().insert(*peer.id(), conn);
            }
        }

        Ok(())
    }

    /// Open a stream to `peer` negotiated to `protocol`.
    ///
    /// A registered muxed connection is reused, otherwise a warm un-muxed connection
    /// is consumed, otherwise a new connection is established.
    pub async fn dial(&self, peer: &PeerInfo, protocol: &str) -> Result<Connection> {
        let muxed = self.inner.muxed_conns.lock().get(peer.id()).cloned();

        if let Some(muxed) = muxed {
            log::trace!("dial {}, reuse muxed connection", peer.id());
            return self.open_stream(&muxed, protocol).await;
        }

        let warm = self.inner.conns.lock().remove(peer.id());

        let mut conn = match warm {
            Some(conn) => conn,
            None => match self.establish(peer).await? {
                Upgraded::Muxed(muxed) => return self.open_stream(&muxed, protocol).await,
                Upgraded::Raw(conn) => conn,
            },
        };

        select_protocol(&mut conn, [protocol]).await?;

        Ok(self.inner.meter_protocol(conn, protocol))
    }

    /// Close and forget every connection to `peer_id`.
    pub async fn hangup(&self, peer_id: &PeerId) -> Result<()> {
        let muxed = self.inner.muxed_conns.lock().remove(peer_id);

        let conn = self.inner.conns.lock().remove(peer_id);

        if let Some(mut conn) = conn {
            conn.close().await?;
        }

        if let Some(muxed) = muxed {
            log::trace!("hangup {}", peer_id);
            muxed.close().await?;
        }

        Ok(())
    }

    /// Start listening on every registered transport.
    pub async fn start(&self) -> Result<()> {
        let transport = self.transport();

        for key in transport.keys() {
            transport.listen(&key, None).await?;
        }

        Ok(())
    }

    /// Hang up every peer and close every listener.
    pub async fn stop(&self) -> Result<()> {
        let muxed = self
            .inner
            .muxed_conns
            .lock()
            .drain()
            .collect::<Vec<_>>();

        for (peer_id, muxed) in muxed {
            if let Err(err) = muxed.close().await {
                log::warn!("stop, close muxed connection to {} failed: {}", peer_id, err);
            }
        }

        let conns = self.inner.conns.lock().drain().collect::<Vec<_>>();

        for (peer_id, mut conn) in conns {
            if let Err(err) = conn.close().await {
                log::warn!("stop, close connection to {} failed: {}", peer_id, err);
            }
        }

        let transport = self.transport();

        for key in transport.keys() {
            transport.close(&key).await?;
        }

        Ok(())
    }

    /// Dial `peer` and upgrade the connection, registering it when muxed.
    async fn establish(&self, peer: &PeerInfo) -> Result<Upgraded> {
        let conn = self.dial_transports(peer).await?;

        let upgraded = self.upgrade(conn, *peer.id()).await?;

        if let Upgraded::Muxed(muxed) = &upgraded {
            self.inner
                .muxed_conns
                .lock()
                .insert(*peer.id(), muxed.clone());

            self.inner.emit(SwitchEvent::PeerMuxEstablished {
                peer_id: Some(*peer.id()),
                identified: false,
            });

            SwitchInner::spawn_serve(
                self.inner.clone(),
                muxed.clone(),
                RemotePeer::shared(Some(*peer.id())),
            );
        }

        Ok(upgraded)
    }

    /// Transports are tried in registration order, the circuit relay last and at most once.
    async fn dial_transports(&self, peer: &PeerInfo) -> Result<Connection> {
        let transport = self.transport();

        let keys = transport.keys();

        if keys.is_empty() {
            return Err(Error::NoTransports);
        }

        for key in keys.iter().filter(|key| *key != CIRCUIT_TAG) {
            let dialable = transport.get(key)?.filter(peer.multiaddrs());

            if dialable.is_empty() {
                continue;
            }

            match transport.connect(key, peer).await {
                Ok(conn) => return Ok(conn),
                Err(err) => log::debug!("dial {} via transport {}, {}", peer.id(), key, err),
            }
        }

        if !transport.has(CIRCUIT_TAG) {
            return Err(Error::CircuitNotEnabled(*peer.id()));
        }

        let mut relayed = peer.clone();

        relayed.add_multiaddr(
            Multiaddr::empty()
                .with(AddrProtocol::P2pCircuit)
                .with(AddrProtocol::P2p(*peer.id())),
        );

        transport
            .connect(CIRCUIT_TAG, &relayed)
            .await
            .map_err(|err| Error::CircuitAlreadyTried {
                peer_id: *peer.id(),
                source: Box::new(err),
            })
    }

    /// Secure `conn` with the active crypto, then try to multiplex it.
    async fn upgrade(&self, mut conn: Connection, peer_id: PeerId) -> Result<Upgraded> {
        conn.set_peer_id(peer_id);

        let crypto = self.inner.crypto.lock().clone();

        select_protocol(&mut conn, [crypto.tag()]).await?;

        let conn = self.inner.meter_protocol(conn, crypto.tag());

        let mut conn = crypto
            .encrypt(&self.local_peer_id(), conn, Some(&peer_id))
            .await?;

        let muxers = self.inner.muxers.lock().clone();

        if muxers.is_empty() {
            log::trace!("{:?}, no stream muxer registered", conn);
            return Ok(Upgraded::Raw(conn));
        }

        let ids = muxers
            .iter()
            .map(|muxer| muxer.id().to_owned())
            .collect::<Vec<_>>();

        let selected = match select_protocol(&mut conn, &ids).await {
            Ok(selected) => selected,
            Err(Error::NegotiationErr(NegotiationError::Failed)) => {
                log::warn!("{:?}, stream muxers refused by {}", conn, peer_id);
                return Ok(Upgraded::Raw(conn));
            }
            Err(err) => return Err(err),
        };

        let Some(muxer) = muxers.iter().find(|muxer| muxer.id() == selected) else {
            return Err(Error::InvalidHeader(selected.clone()));
        };

        log::trace!("{:?}, muxed by {}", conn, selected);

        let conn = self.inner.meter_protocol(conn, &selected);

        Ok(Upgraded::Muxed(Arc::from(muxer.dialer(conn)?)))
    }

    async fn open_stream(&self, muxed: &ArcMuxedConnection, protocol: &str) -> Result<Connection> {
        let mut stream = muxed.new_stream().await?;

        select_protocol(&mut stream, [protocol]).await?;

        Ok(self.inner.meter_protocol(stream, protocol))
    }
}

/// A builder pattern implementation for [`Switch`] type.
pub struct SwitchBuilder {
    local: PeerInfo,
    peer_book: Option<BoxPeerBook>,
    dial_timeout: Duration,
    per_peer_rate_limit: usize,
    agent_version: String,
    max_identity_packet_len: usize,
    identify_timeout: Duration,
    stats_compute_throttle: Duration,
}

impl SwitchBuilder {
    /// Create a [`Switch`] builder for the local peer, with default configuration.
    pub fn new(local: PeerInfo) -> Self {
        Self {
            local,
            peer_book: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            per_peer_rate_limit: DEFAULT_PER_PEER_RATE_LIMIT,
            agent_version: DEFAULT_AGENT_VERSION.to_owned(),
            max_identity_packet_len: DEFAULT_MAX_IDENTITY_PACKET_LEN,
            identify_timeout: DEFAULT_IDENTIFY_TIMEOUT,
            stats_compute_throttle: DEFAULT_COMPUTE_THROTTLE,
        }
    }

    /// Replace the default [`MemoryPeerBook`].
    pub fn peer_book<B: PeerBook + 'static>(mut self, peer_book: B) -> Self {
        self.peer_book = Some(Box::new(peer_book));
        self
    }

    /// Set the timeout of one dial attempt, the default is 30 seconds.
    pub fn dial_timeout(mut self, value: Duration) -> Self {
        self.dial_timeout = value;
        self
    }

    /// Set the max number of concurrent dial attempts to one peer, the default is `8`.
    pub fn per_peer_rate_limit(mut self, value: usize) -> Self {
        self.per_peer_rate_limit = value;
        self
    }

    /// Set the agent_version value, the default is `rp2p/x.x.x`.
    ///
    /// This configuration will be used in `Identify` protocol to identify the implementation of the peer.
    pub fn agent_version(mut self, value: &str) -> Self {
        self.agent_version = value.to_owned();
        self
    }

    /// Set the max_identity_packet_len value, the default is `4096`
    pub fn max_identity_packet_len(mut self, value: usize) -> Self {
        self.max_identity_packet_len = value;
        self
    }

    /// Set the timeout of the identify exchange on inbound connections, the default is 10 seconds.
    ///
    /// A connection whose remote does not answer in time stays served but unregistered.
    pub fn identify_timeout(mut self, value: Duration) -> Self {
        self.identify_timeout = value;
        self
    }

    /// Set the min interval between two moving average computations of the stats, the default is 2 seconds.
    pub fn stats_compute_throttle(mut self, value: Duration) -> Self {
        self.stats_compute_throttle = value;
        self
    }

    /// Consume the `builder` and generate a new [`Switch`] instance.
    ///
    /// The plaintext secure channel is active until [`ConnectionManager::crypto`] replaces it.
    pub fn create(self) -> Switch {
        let crypto: ArcCrypto = Arc::new(Plaintext);

        let inner = Arc::new(SwitchInner {
            local: Mutex::new(self.local),
            peer_book: self
                .peer_book
                .unwrap_or_else(|| Box::new(MemoryPeerBook::default())),
            protocols: Default::default(),
            transports: Default::default(),
            listeners: Default::default(),
            muxers: Default::default(),
            crypto: Mutex::new(crypto.clone()),
            identify: AtomicBool::new(false),
            muxed_conns: Default::default(),
            conns: Default::default(),
            dialer: LimitDialer::new(self.per_peer_rate_limit, self.dial_timeout),
            events: Default::default(),
            agent_version: self.agent_version,
            max_identity_packet_len: self.max_identity_packet_len,
            identify_timeout: self.identify_timeout,
            stats: Arc::new(Stats::new(self.stats_compute_throttle)),
        });

        inner.protocols.lock().insert(Arc::new(CryptoProtocol {
            crypto,
            switch: Arc::downgrade(&inner),
        }));

        Switch { inner }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use futures::{future::BoxFuture, AsyncReadExt, StreamExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use crate::{BoxTransport, CircuitRelayConfig, ConnHandler, Transport};

    use super::*;

    /// Dials fail for every address, counting the attempts.
    #[derive(Default)]
    struct Unreachable {
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for Unreachable {
        fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
            addrs.to_vec()
        }

        async fn dial(&self, _raddr: &Multiaddr) -> io::Result<Connection> {
            self.dials.fetch_add(1, Ordering::SeqCst);

            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"))
        }

        fn create_listener(&self, _handler: ConnHandler) -> BoxListener {
            unimplemented!("dial only")
        }
    }

    /// Connects every dial to `target` over an in-memory pipe.
    struct Pipe {
        target: ConnHandler,
    }

    #[async_trait]
    impl Transport for Pipe {
        fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
            addrs
                .iter()
                .filter(|addr| matches!(addr.iter().next(), Some(AddrProtocol::Memory(_))))
                .cloned()
                .collect()
        }

        async fn dial(&self, raddr: &Multiaddr) -> io::Result<Connection> {
            let (lhs, rhs) = tokio::io::duplex(4096);

            tokio::spawn((self.target)(
                Connection::new(rhs.compat()).with_local_addr(raddr.clone()),
            ));

            Ok(Connection::new(lhs.compat()).with_peer_addr(raddr.clone()))
        }

        fn create_listener(&self, _handler: ConnHandler) -> BoxListener {
            unimplemented!("dial only")
        }
    }

    fn pipe_to(switch: &Switch) -> Pipe {
        let protocol_muxer = switch.protocol_muxer();

        Pipe {
            target: Arc::new(move |conn: Connection| -> BoxFuture<'static, ()> {
                let protocol_muxer = protocol_muxer.clone();

                Box::pin(async move {
                    _ = protocol_muxer.handle(conn).await;
                })
            }),
        }
    }

    fn peer(addr: &str) -> PeerInfo {
        PeerInfo::random().with_multiaddrs([addr.parse().unwrap()])
    }

    #[tokio::test]
    async fn test_no_transports() {
        let switch = SwitchBuilder::new(PeerInfo::random()).create();

        assert!(matches!(
            switch.connect(&peer("/ip4/127.0.0.1/tcp/1")).await,
            Err(Error::NoTransports)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_transport() {
        let switch = SwitchBuilder::new(PeerInfo::random()).create();

        switch.transport().add("tcp", Unreachable::default()).unwrap();

        assert!(matches!(
            switch.transport().add("tcp", Unreachable::default()),
            Err(Error::AlreadyExists { .. })
        ));

        assert!(matches!(
            switch.transport().close("ws").await,
            Err(Error::TransportNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_circuit_not_enabled() {
        let switch = SwitchBuilder::new(PeerInfo::random()).create();

        let unreachable = Unreachable::default();

        let dials = unreachable.dials.clone();

        switch.transport().add("tcp", unreachable).unwrap();

        let err = switch
            .connect(&peer("/ip4/127.0.0.1/tcp/1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CircuitNotEnabled(_)));
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_tried_last_and_once() {
        let switch = SwitchBuilder::new(PeerInfo::random()).create();

        let direct = Unreachable::default();
        let relay = Unreachable::default();

        let direct_dials = direct.dials.clone();
        let relay_dials = relay.dials.clone();

        switch
            .connection()
            .enable_circuit_relay(
                CircuitRelayConfig {
                    enabled: true,
                    hop: None,
                },
                move |config| -> BoxTransport {
                    assert_eq!(config.hop, Some(Default::default()));
                    Box::new(relay)
                },
            )
            .unwrap();

        switch.transport().add("tcp", direct).unwrap();

        assert_eq!(switch.transport().keys(), vec![CIRCUIT_TAG, "tcp"]);

        let err = switch
            .connect(&peer("/ip4/127.0.0.1/tcp/1"))
            .await
            .unwrap_err();

        let Error::CircuitAlreadyTried { source, .. } = err else {
            panic!("expect CircuitAlreadyTried");
        };

        assert!(matches!(*source, Error::AllDialsFailed { .. }));

        assert_eq!(direct_dials.load(Ordering::SeqCst), 1);

        // the original address plus `/p2p-circuit/p2p/<id>`.
        assert_eq!(relay_dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_circuit_disabled_config() {
        let switch = SwitchBuilder::new(PeerInfo::random()).create();

        switch
            .connection()
            .enable_circuit_relay(CircuitRelayConfig::default(), |_| -> BoxTransport {
                Box::new(Unreachable::default())
            })
            .unwrap();

        assert!(!switch.transport().has(CIRCUIT_TAG));
    }

    #[tokio::test]
    async fn test_handle_unhandle() {
        let switch = SwitchBuilder::new(PeerInfo::random()).create();

        assert_eq!(switch.protocols(), vec![crate::PLAINTEXT_TAG]);

        switch.handle("/echo/1.0.0", |_, _| async {});
        switch.handle("/ping/1.0.0", |_, _| async {});

        assert!(switch.unhandle("/echo/1.0.0"));
        assert!(!switch.unhandle("/echo/1.0.0"));

        assert_eq!(switch.protocols(), vec![crate::PLAINTEXT_TAG, "/ping/1.0.0"]);
    }

    #[tokio::test]
    async fn test_crypto_replaces_tag() {
        struct Secio;

        #[async_trait]
        impl crate::Crypto for Secio {
            fn tag(&self) -> &str {
                "/secio/1.0.0"
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

        let switch = SwitchBuilder::new(PeerInfo::random()).create();

        switch.connection().crypto(Secio);

        assert_eq!(switch.protocols(), vec!["/secio/1.0.0"]);
        assert_eq!(switch.connection().crypto_tag(), "/secio/1.0.0");

        switch.connection().crypto_default();

        assert_eq!(switch.protocols(), vec![crate::PLAINTEXT_TAG]);
    }

    #[tokio::test]
    async fn test_unmuxed_dial() {
        _ = pretty_env_logger::try_init();

        let listener = SwitchBuilder::new(PeerInfo::random().with_multiaddrs([
            "/memory/1".parse().unwrap()
        ]))
        .create();

        listener.handle("/echo/1.0.0", |_, mut conn| async move {
            let mut buf = [0; 5];

            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let dialer = SwitchBuilder::new(PeerInfo::random()).create();

        dialer.transport().add("memory", pipe_to(&listener)).unwrap();

        let target = listener.local_peer_info();

        dialer.connect(&target).await.unwrap();

        assert_eq!(dialer.unmuxed_peers(), vec![*target.id()]);
        assert!(dialer.muxed_peers().is_empty());

        let known = dialer.peer_book().get(target.id()).await.unwrap().unwrap();

        assert_eq!(known.is_connected(), Some(&target.multiaddrs()[0]));

        let mut conn = dialer.dial(&target, "/echo/1.0.0").await.unwrap();

        // the warm connection is consumed.
        assert!(dialer.unmuxed_peers().is_empty());

        conn.write_all(b"hello").await.unwrap();

        let mut buf = [0; 5];

        conn.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_subscribe() {
        let switch = SwitchBuilder::new(PeerInfo::random()).create();

        let mut events = switch.subscribe();

        let peer_id = PeerId::random();

        switch.inner.emit(SwitchEvent::PeerMuxClosed { peer_id });

        let event = events.next().await.unwrap();

        assert_eq!(event.name(), "peer:mux:closed");
        assert_eq!(event, SwitchEvent::PeerMuxClosed { peer_id });

        drop(events);

        switch.inner.emit(SwitchEvent::PeerMuxClosed { peer_id });

        assert!(switch.inner.events.lock().is_empty());
    }
}
