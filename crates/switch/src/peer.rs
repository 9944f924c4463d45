use identity::{Keypair, PeerId, PublicKey};
use multiaddr::{Multiaddr, Protocol};

/// A peer's identity plus its known/believed-reachable addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    id: PeerId,
    /// Required by the local peer to answer identify requests.
    public_key: Option<PublicKey>,
    /// Insertion ordered, without duplicates.
    multiaddrs: Vec<Multiaddr>,
    connected: Option<Multiaddr>,
    identified: bool,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            public_key: None,
            multiaddrs: vec![],
            connected: None,
            identified: false,
        }
    }

    /// Create a `PeerInfo` whose id is derived from `public_key`.
    pub fn from_public_key(public_key: PublicKey) -> Self {
        let mut peer_info = Self::new(public_key.to_peer_id());
        peer_info.public_key = Some(public_key);
        peer_info
    }

    /// Create a `PeerInfo` with a fresh ed25519 identity, useful for tests and ephemeral nodes.
    pub fn random() -> Self {
        Self::from_public_key(Keypair::generate_ed25519().public())
    }

    pub fn with_multiaddrs<A>(mut self, addrs: A) -> Self
    where
        A: IntoIterator<Item = Multiaddr>,
    {
        self.add_multiaddrs(addrs);
        self
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn multiaddrs(&self) -> &[Multiaddr] {
        &self.multiaddrs
    }

    /// Returns true if `addr` was not known yet.
    pub fn add_multiaddr(&mut self, addr: Multiaddr) -> bool {
        if self.multiaddrs.contains(&addr) {
            return false;
        }

        self.multiaddrs.push(addr);

        true
    }

    pub fn add_multiaddrs<A>(&mut self, addrs: A)
    where
        A: IntoIterator<Item = Multiaddr>,
    {
        for addr in addrs {
            self.add_multiaddr(addr);
        }
    }

    pub fn remove_multiaddr(&mut self, addr: &Multiaddr) -> bool {
        let len = self.multiaddrs.len();

        self.multiaddrs.retain(|item| item != addr);

        len != self.multiaddrs.len()
    }

    /// Remove every address of `old` and add every address of `new`.
    pub fn replace_multiaddrs(&mut self, old: &[Multiaddr], new: &[Multiaddr]) {
        self.multiaddrs.retain(|addr| !old.contains(addr));
        self.add_multiaddrs(new.iter().cloned());
    }

    pub fn clear_multiaddrs(&mut self) {
        self.multiaddrs.clear();
    }

    /// The `/p2p/<id>` address, used when a peer advertises no reachable address.
    pub fn p2p_addr(&self) -> Multiaddr {
        Multiaddr::empty().with(Protocol::P2p(self.id))
    }

    /// Mark the peer as connected via `addr`.
    pub fn connect(&mut self, addr: Multiaddr) {
        self.connected = Some(addr);
    }

    pub fn disconnect(&mut self) {
        self.connected = None;
    }

    /// Returns the address of the current connection, if any.
    pub fn is_connected(&self) -> Option<&Multiaddr> {
        self.connected.as_ref()
    }

    /// Whether the peer's metadata came from a successful Identify exchange.
    pub fn identified(&self) -> bool {
        self.identified
    }

    pub fn set_identified(&mut self, identified: bool) {
        self.identified = identified;
    }

    /// Merge `other` into self.
    ///
    /// Addresses are added and a connected `other` updates the connection state.
    /// Merging never disconnects a peer, use [`disconnect`](Self::disconnect) for that.
    /// Once identified a peer stays identified.
    pub fn merge(&mut self, other: PeerInfo) {
        self.add_multiaddrs(other.multiaddrs);

        if other.connected.is_some() {
            self.connected = other.connected;
        }

        if other.public_key.is_some() {
            self.public_key = other.public_key;
        }

        self.identified = self.identified || other.identified;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addrs_de_duplicate() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();

        let mut peer = PeerInfo::random().with_multiaddrs([addr.clone(), addr.clone()]);

        assert_eq!(peer.multiaddrs().len(), 1);
        assert!(!peer.add_multiaddr(addr.clone()));

        let bound: Multiaddr = "/ip4/127.0.0.1/tcp/51234".parse().unwrap();

        peer.replace_multiaddrs(&[addr.clone()], &[bound.clone()]);

        assert_eq!(peer.multiaddrs(), &[bound]);
    }

    #[test]
    fn test_merge() {
        let a: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        let b: Multiaddr = "/ip4/10.0.0.2/tcp/4001".parse().unwrap();

        let mut known = PeerInfo::random().with_multiaddrs([a.clone()]);
        known.set_identified(true);

        let mut update = PeerInfo::new(*known.id()).with_multiaddrs([b.clone()]);
        update.connect(b.clone());

        known.merge(update);

        assert_eq!(known.multiaddrs(), &[a, b.clone()]);
        assert_eq!(known.is_connected(), Some(&b));
        assert!(known.identified());
    }

    #[test]
    fn test_merge_keeps_connection() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();

        let mut known = PeerInfo::random();
        known.connect(addr.clone());

        let public_key = known.public_key().cloned();

        known.merge(PeerInfo::new(*known.id()));

        assert_eq!(known.is_connected(), Some(&addr));
        assert_eq!(known.public_key(), public_key.as_ref());

        known.disconnect();

        assert!(known.is_connected().is_none());
    }

    #[test]
    fn test_random_derives_id_from_public_key() {
        let peer = PeerInfo::random();

        assert_eq!(peer.public_key().unwrap().to_peer_id(), *peer.id());
        assert!(PeerInfo::new(*peer.id()).public_key().is_none());
    }

    #[test]
    fn test_p2p_addr() {
        let peer = PeerInfo::random();

        let addr = peer.p2p_addr();

        assert_eq!(addr.iter().next(), Some(Protocol::P2p(*peer.id())));
    }
}
