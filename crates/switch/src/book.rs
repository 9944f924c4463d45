use std::{collections::HashMap, io};

use async_trait::async_trait;
use identity::PeerId;
use parking_lot::Mutex;

use crate::PeerInfo;

/// The alias of type [`Box<dyn PeerBook>`]
pub type BoxPeerBook = Box<dyn PeerBook>;

/// The `PeerBook` plugin provide the ability that `Switch` can get/set/update the peer information.
#[async_trait]
pub trait PeerBook: Sync + Send {
    /// Merge `peer_info` into the book.
    ///
    /// Addresses are added to the known set, never removed.
    /// On success, returns the merged `PeerInfo`.
    async fn put(&self, peer_info: PeerInfo) -> io::Result<PeerInfo>;

    /// Store `peer_info`, overwriting the known addresses.
    async fn replace(&self, peer_info: PeerInfo) -> io::Result<PeerInfo>;

    /// Get peer information by `peer_id`.
    async fn get(&self, peer_id: &PeerId) -> io::Result<Option<PeerInfo>>;

    /// Delete all information about `peer_id`.
    async fn delete(&self, peer_id: &PeerId) -> io::Result<()>;
}

/// A [`PeerBook`] implementation that stores all data in memory.
#[derive(Default)]
pub struct MemoryPeerBook(Mutex<HashMap<PeerId, PeerInfo>>);

impl MemoryPeerBook {
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

#[async_trait]
impl PeerBook for MemoryPeerBook {
    async fn put(&self, peer_info: PeerInfo) -> io::Result<PeerInfo> {
        let mut map = self.0.lock();

        if let Some(known) = map.get_mut(peer_info.id()) {
            known.merge(peer_info);
            Ok(known.clone())
        } else {
            map.insert(*peer_info.id(), peer_info.clone());
            Ok(peer_info)
        }
    }

    async fn replace(&self, peer_info: PeerInfo) -> io::Result<PeerInfo> {
        self.0.lock().insert(*peer_info.id(), peer_info.clone());

        Ok(peer_info)
    }

    async fn get(&self, peer_id: &PeerId) -> io::Result<Option<PeerInfo>> {
        Ok(self.0.lock().get(peer_id).cloned())
    }

    async fn delete(&self, peer_id: &PeerId) -> io::Result<()> {
        self.0.lock().remove(peer_id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use multiaddr::Multiaddr;

    use super::*;

    #[futures_test::test]
    async fn test_put_merges_addrs() {
        let book = MemoryPeerBook::default();

        let a: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        let b: Multiaddr = "/ip4/10.0.0.2/tcp/4001".parse().unwrap();

        let peer = PeerInfo::random().with_multiaddrs([a.clone()]);

        book.put(peer.clone()).await.unwrap();

        let merged = book
            .put(PeerInfo::new(*peer.id()).with_multiaddrs([b.clone()]))
            .await
            .unwrap();

        assert_eq!(merged.multiaddrs(), &[a, b.clone()]);
        assert_eq!(book.len(), 1);

        let replaced = book
            .replace(PeerInfo::new(*peer.id()).with_multiaddrs([b.clone()]))
            .await
            .unwrap();

        assert_eq!(replaced.multiaddrs(), &[b]);

        book.delete(peer.id()).await.unwrap();

        assert!(book.get(peer.id()).await.unwrap().is_none());
    }

    #[futures_test::test]
    async fn test_put_keeps_connection_state() {
        let book = MemoryPeerBook::default();

        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();

        let mut peer = PeerInfo::random();
        peer.connect(addr.clone());

        book.put(peer.clone()).await.unwrap();

        let merged = book
            .put(PeerInfo::new(*peer.id()).with_multiaddrs([addr.clone()]))
            .await
            .unwrap();

        assert_eq!(merged.is_connected(), Some(&addr));
    }
}
