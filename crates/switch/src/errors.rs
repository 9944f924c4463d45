use std::{fmt::Display, io};

use identity::PeerId;
use multiaddr::Multiaddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] io::Error),

    #[error("The protocol ID is incorrectly formatted.")]
    ParseProtocolId,

    #[error("A {kind} with key `{key}` is already registered.")]
    AlreadyExists { kind: RegistryKind, key: String },

    #[error("No transport registered with key `{0}`.")]
    TransportNotFound(String),

    #[error("No transports registered, connect not possible.")]
    NoTransports,

    #[error("No dialable addresses.")]
    NoAddresses,

    #[error("All dials to peer {peer_id} failed, {}", DialErrors(.errors))]
    AllDialsFailed {
        peer_id: PeerId,
        errors: Vec<DialError>,
    },

    #[error("Circuit not enabled and all transports failed to dial peer {0}.")]
    CircuitNotEnabled(PeerId),

    #[error("Circuit already tried, no transport could dial peer {peer_id}.")]
    CircuitAlreadyTried {
        peer_id: PeerId,
        #[source]
        source: Box<Error>,
    },

    #[error("Can't listen on multiaddr {addr}, {source}")]
    Listen {
        addr: Multiaddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    ProtobufErr(#[from] protobuf::Error),

    #[error(transparent)]
    IdentityDecodingErr(#[from] identity::DecodingError),

    #[error("The peer id fetched by the Identify protocol, is mismatched with provided one or is mismatched with channel secure public key.")]
    UnexpectPeerId,

    #[error(transparent)]
    MultiaddrErr(#[from] multiaddr::Error),

    #[error(transparent)]
    NegotiationErr(#[from] multistream_select::NegotiationError),

    #[error("Invalid multistream-select header, {0:?}")]
    InvalidHeader(String),

    /// A error wrapper for [`unsigned_varint::io::ReadError`]
    #[error(transparent)]
    UnsignedVarint(#[from] unsigned_varint::io::ReadError),

    /// A error wrapper for [`unsigned_varint::decode::Error`]
    #[error(transparent)]
    UnsignedVarintDecode(#[from] unsigned_varint::decode::Error),

    #[error("Receiving buffer overflow, {0}")]
    BufferOverflow(BufferOverflow),

    #[error("The identify response carries no public key, and the connection is not authenticated.")]
    UnknownPeerId,

    #[error("The local peer info carries no public key, can't answer identify requests.")]
    NoPublicKey,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferOverflow {
    #[error("Identify response buffer overflow, expect buffer length is {0}")]
    Identity(usize),

    #[error("Negotiation message overflow, the max message length is {0}")]
    Negotiation(usize),
}

/// The registry an [`Error::AlreadyExists`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Transport,
    Multiplexer,
}

impl Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryKind::Transport => write!(f, "transport"),
            RegistryKind::Multiplexer => write!(f, "stream multiplexer"),
        }
    }
}

/// One failed dial attempt of a [`LimitDialer`](crate::LimitDialer) session.
#[derive(Debug, thiserror::Error)]
#[error("{addr}: {source}")]
pub struct DialError {
    pub addr: Multiaddr,
    #[source]
    pub source: io::Error,
}

struct DialErrors<'a>(&'a [DialError]);

impl Display for DialErrors<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;

        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }

            write!(f, "{}", error)?;
        }

        write!(f, "]")
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::IoError(io_error) => io_error,
            _ => io::Error::new(io::ErrorKind::Other, value),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
