//! The `/ipfs/id/1.0.0` exchange.
//!
//! The responder writes one varint length prefixed, protobuf encoded `Identify` message.
//! The requester derives the remote peer id from the advertised public key.
use futures::{AsyncReadExt, AsyncWriteExt};
use identity::{PeerId, PublicKey};
use multiaddr::Multiaddr;
use protobuf::Message;

use crate::{
    errors::{BufferOverflow, Error, Result},
    proto::identify as pb,
    Connection, PeerInfo,
};

/// The protocol id of the identify exchange.
pub const PROTOCOL_IPFS_ID: &str = "/ipfs/id/1.0.0";

/// The `protocolVersion` sent by the responder.
pub const PROTOCOL_VERSION: &str = "ipfs/0.1.0";

/// The default max length of one identify message.
pub const DEFAULT_MAX_IDENTITY_PACKET_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identify {
    /// Absent when the responder did not advertise a key.
    pub public_key: Option<PublicKey>,
    pub protocol_version: String,
    /// Free-form string identifying the implementation, usually `agent-name/version`.
    pub agent_version: String,
    pub listen_addrs: Vec<Multiaddr>,
    /// The address the responder sees the requester connecting from.
    pub observed_addr: Option<Multiaddr>,
    /// Protocols the responder handles.
    pub protocols: Vec<String>,
}

impl Identify {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut identify = pb::Identify::new();

        if let Some(public_key) = &self.public_key {
            identify.set_publicKey(public_key.encode_protobuf());
        }

        identify.set_protocolVersion(self.protocol_version.clone());
        identify.set_agentVersion(self.agent_version.clone());

        identify.listenAddrs = self.listen_addrs.iter().map(|addr| addr.to_vec()).collect();

        if let Some(addr) = &self.observed_addr {
            identify.set_observedAddr(addr.to_vec());
        }

        identify.protocols = self.protocols.clone();

        Ok(identify.write_to_bytes()?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let identify = pb::Identify::parse_from_bytes(buf)?;

        let public_key = if identify.has_publicKey() {
            Some(PublicKey::try_decode_protobuf(identify.publicKey())?)
        } else {
            None
        };

        let observed_addr = if identify.has_observedAddr() {
            Some(Multiaddr::try_from(identify.observedAddr().to_vec())?)
        } else {
            None
        };

        let protocol_version = identify.protocolVersion().to_owned();
        let agent_version = identify.agentVersion().to_owned();

        let listen_addrs = identify
            .listenAddrs
            .into_iter()
            .map(|buf| Multiaddr::try_from(buf).map_err(Into::into))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            public_key,
            protocol_version,
            agent_version,
            listen_addrs,
            observed_addr,
            protocols: identify.protocols,
        })
    }

    /// The peer id derived from the advertised public key.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.public_key.as_ref().map(PublicKey::to_peer_id)
    }

    /// The advertised peer `peer_id`, not yet marked as connected nor identified.
    pub fn peer_info(&self, peer_id: PeerId) -> PeerInfo {
        let peer_info = match &self.public_key {
            Some(public_key) => PeerInfo::from_public_key(public_key.clone()),
            None => PeerInfo::new(peer_id),
        };

        peer_info.with_multiaddrs(self.listen_addrs.iter().cloned())
    }
}

/// Requester side, `conn` must already be negotiated to [`PROTOCOL_IPFS_ID`].
///
/// Returns the remote peer id with the response. The id derived from the advertised
/// public key must match the authenticated id of `conn`, if any. Without a public key
/// the authenticated id is used.
pub async fn identity_request(
    conn: &mut Connection,
    max_packet_len: usize,
) -> Result<(PeerId, Identify)> {
    let len = unsigned_varint::aio::read_usize(&mut *conn).await?;

    if len > max_packet_len {
        return Err(Error::BufferOverflow(BufferOverflow::Identity(
            max_packet_len,
        )));
    }

    let mut buf = vec![0; len];

    conn.read_exact(&mut buf).await?;

    let identify = Identify::decode(&buf)?;

    let peer_id = match (identify.peer_id(), conn.peer_id()) {
        (Some(advertised), Some(authenticated)) if advertised != *authenticated => {
            return Err(Error::UnexpectPeerId);
        }
        (Some(advertised), _) => advertised,
        (None, Some(authenticated)) => *authenticated,
        (None, None) => return Err(Error::UnknownPeerId),
    };

    Ok((peer_id, identify))
}

/// The responder of identify request.
pub async fn identity_response(conn: &mut Connection, identify: &Identify) -> Result<()> {
    let payload = identify.encode()?;

    let mut len_buf = unsigned_varint::encode::usize_buffer();

    conn.write_all(unsigned_varint::encode::usize(payload.len(), &mut len_buf))
        .await?;

    conn.write_all(&payload).await?;

    conn.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use identity::Keypair;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    fn identify() -> Identify {
        Identify {
            public_key: Some(Keypair::generate_ed25519().public()),
            protocol_version: PROTOCOL_VERSION.to_owned(),
            agent_version: "rp2p/0.1.0".to_owned(),
            listen_addrs: vec![
                "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
                "/ip6/::1/tcp/4001".parse().unwrap(),
            ],
            observed_addr: Some("/ip4/10.0.0.1/tcp/51234".parse().unwrap()),
            protocols: vec!["/echo/1.0.0".to_owned(), PROTOCOL_IPFS_ID.to_owned()],
        }
    }

    fn put_field(buf: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
        buf.push(tag);
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
    }

    #[test]
    fn test_decode_standard_message() {
        let listen_addr: Multiaddr = "/ip4/10.0.0.2/tcp/4001".parse().unwrap();
        let observed_addr: Multiaddr = "/ip4/10.0.0.1/tcp/51234".parse().unwrap();

        // agentVersion = 6, listenAddrs = 2, observedAddr = 4, as written by other implementations.
        let mut buf = vec![];

        put_field(&mut buf, 0x32, b"go-ipfs/0.4.0");
        put_field(&mut buf, 0x12, &listen_addr.to_vec());
        put_field(&mut buf, 0x22, &observed_addr.to_vec());

        let identify = Identify::decode(&buf).unwrap();

        assert_eq!(identify.agent_version, "go-ipfs/0.4.0");
        assert_eq!(identify.listen_addrs, vec![listen_addr]);
        assert_eq!(identify.observed_addr, Some(observed_addr));
        assert!(identify.public_key.is_none());
    }

    #[test]
    fn test_decode_public_key_field() {
        let expected = identify();

        let public_key = expected.public_key.clone().unwrap();

        let mut buf = vec![];

        put_field(&mut buf, 0x0a, &public_key.encode_protobuf());

        let identify = Identify::decode(&buf).unwrap();

        assert_eq!(identify.peer_id(), Some(public_key.to_peer_id()));

        assert_eq!(Identify::decode(&expected.encode().unwrap()).unwrap(), expected);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Identify::decode(&[0x0a, 0x03, 0x01]).is_err());

        let mut buf = vec![];

        put_field(&mut buf, 0x0a, b"not a key");

        assert!(matches!(
            Identify::decode(&buf),
            Err(Error::IdentityDecodingErr(_))
        ));
    }

    #[tokio::test]
    async fn test_exchange() {
        let (lhs, rhs) = tokio::io::duplex(1024);

        let expected = identify();

        let peer_id = expected.peer_id().unwrap();

        let mut requester = Connection::new(lhs.compat()).with_peer_id(peer_id);
        let mut responder = Connection::new(rhs.compat());

        identity_response(&mut responder, &expected).await.unwrap();

        let (identified, identify) =
            identity_request(&mut requester, DEFAULT_MAX_IDENTITY_PACKET_LEN)
                .await
                .unwrap();

        assert_eq!(identified, peer_id);
        assert_eq!(identify, expected);

        let peer_info = identify.peer_info(identified);

        assert_eq!(peer_info.id(), &peer_id);
        assert_eq!(peer_info.multiaddrs(), &expected.listen_addrs[..]);
    }

    #[tokio::test]
    async fn test_without_public_key() {
        let (lhs, rhs) = tokio::io::duplex(1024);

        let mut anonymous = identify();
        anonymous.public_key = None;

        let authenticated = PeerId::random();

        let mut requester = Connection::new(lhs.compat()).with_peer_id(authenticated);
        let mut responder = Connection::new(rhs.compat());

        identity_response(&mut responder, &anonymous).await.unwrap();
        identity_response(&mut responder, &anonymous).await.unwrap();

        let (peer_id, _) = identity_request(&mut requester, DEFAULT_MAX_IDENTITY_PACKET_LEN)
            .await
            .unwrap();

        assert_eq!(peer_id, authenticated);

        let mut requester = Connection::new(requester);

        assert!(matches!(
            identity_request(&mut requester, DEFAULT_MAX_IDENTITY_PACKET_LEN).await,
            Err(Error::UnknownPeerId)
        ));
    }

    #[tokio::test]
    async fn test_unexpect_peer_id() {
        let (lhs, rhs) = tokio::io::duplex(1024);

        let mut requester = Connection::new(lhs.compat()).with_peer_id(PeerId::random());
        let mut responder = Connection::new(rhs.compat());

        identity_response(&mut responder, &identify()).await.unwrap();

        assert!(matches!(
            identity_request(&mut requester, DEFAULT_MAX_IDENTITY_PACKET_LEN).await,
            Err(Error::UnexpectPeerId)
        ));
    }

    #[tokio::test]
    async fn test_buffer_overflow() {
        let (lhs, rhs) = tokio::io::duplex(1024);

        let mut requester = Connection::new(lhs.compat());
        let mut responder = Connection::new(rhs.compat());

        identity_response(&mut responder, &identify()).await.unwrap();

        assert!(matches!(
            identity_request(&mut requester, 16).await,
            Err(Error::BufferOverflow(BufferOverflow::Identity(16)))
        ));
    }
}
