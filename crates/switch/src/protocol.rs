use std::{borrow::Cow, fmt::Display, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{
    errors::{Error, Result},
    Connection,
};

/// The protocol id type for libp2p protocols.
///
/// Although the semantic version is optional, it is highly recommended to specify this field,
/// as described in the official [`documentation`](https://docs.libp2p.io/concepts/fundamentals/protocols/#match-using-semver)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolId {
    /// Path-like string as a protocol identity, must start with `/`
    pub path: Cow<'static, str>,
    /// Optional semantic version to easier matching by version.
    pub semver: Option<semver::Version>,
}

impl TryFrom<&'static str> for ProtocolId {
    type Error = Error;

    fn try_from(s: &'static str) -> std::result::Result<Self, Self::Error> {
        Self::try_parse(s)
    }
}

impl TryFrom<String> for ProtocolId {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::try_parse(value)
    }
}

impl Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(version) = &self.semver {
            write!(f, "{}/{}", self.path, version)
        } else {
            write!(f, "{}", self.path)
        }
    }
}

impl ProtocolId {
    /// Create `ProtocolId` from path-like string, the input string must start with '/'.
    pub fn from_path<P: AsRef<str>>(path: P) -> Result<Self> {
        if !path.as_ref().starts_with('/') {
            return Err(Error::ParseProtocolId);
        }

        Ok(Self {
            path: Cow::Owned(path.as_ref().to_owned()),
            semver: None,
        })
    }

    /// Try parse protocol id string as path-like string with semver.
    pub fn try_parse<P: AsRef<str>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.starts_with('/') {
            return Err(Error::ParseProtocolId);
        }

        match path.rfind('/') {
            // the start slash.
            Some(pos) if pos != 0 => match path[(pos + 1)..].parse() {
                Ok(version) => Ok(Self {
                    path: Cow::Owned(path[..pos].to_owned()),
                    semver: Some(version),
                }),
                Err(_) => Self::from_path(path),
            },
            _ => Self::from_path(path),
        }
    }

    /// Returns true if `other` names the same protocol with a compatible version.
    ///
    /// Versions are compatible when their major numbers agree, or for `0.x` versions
    /// when their minor numbers agree too. Unversioned ids only match unversioned ids.
    pub fn is_compatible(&self, other: &ProtocolId) -> bool {
        if self.path != other.path {
            return false;
        }

        match (&self.semver, &other.semver) {
            (Some(lhs), Some(rhs)) => {
                lhs.major == rhs.major && (lhs.major != 0 || lhs.minor == rhs.minor)
            }
            (None, None) => true,
            _ => false,
        }
    }

    /// Create a [`Matcher`] accepting every proposal [`compatible`](Self::is_compatible) with this id.
    pub fn semver_matcher(&self) -> Matcher {
        let this = self.clone();

        Arc::new(move |proposed: &str| {
            ProtocolId::try_parse(proposed)
                .map(|proposed| this.is_compatible(&proposed))
                .unwrap_or(false)
        })
    }
}

/// A custom matcher for proposed protocol ids that are not an exact match.
pub type Matcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A type alias of [`Arc<dyn Protocol>`]
pub type ArcProtocol = Arc<dyn Protocol>;

/// One entry of the switch's protocol table.
#[async_trait]
pub trait Protocol: Sync + Send {
    /// The exact protocol id this entry is registered with.
    fn id(&self) -> &str;

    /// Custom matching for proposals that are not equal to [`id`](Self::id).
    fn matches(&self, _proposed: &str) -> bool {
        false
    }

    /// Handle a connection negotiated to `protocol`.
    async fn handle(&self, protocol: String, conn: Connection) -> Result<()>;
}

type HandlerFn = Arc<dyn Fn(String, Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// A [`Protocol`] built from closures, see [`Switch::handle`](crate::Switch::handle).
pub struct FnProtocol {
    id: String,
    handler: HandlerFn,
    matcher: Option<Matcher>,
}

impl FnProtocol {
    pub fn new<F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(String, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            id: id.into(),
            handler: Arc::new(
                move |protocol: String, conn: Connection| -> BoxFuture<'static, ()> {
                    Box::pin(handler(protocol, conn))
                },
            ),
            matcher: None,
        }
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = Some(matcher);
        self
    }
}

#[async_trait]
impl Protocol for FnProtocol {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, proposed: &str) -> bool {
        self.matcher
            .as_ref()
            .map(|matcher| matcher(proposed))
            .unwrap_or(false)
    }

    async fn handle(&self, protocol: String, conn: Connection) -> Result<()> {
        (self.handler)(protocol, conn).await;

        Ok(())
    }
}

/// The ordered protocol table of one switch.
#[derive(Default, Clone)]
pub struct ProtocolTable {
    entries: Vec<ArcProtocol>,
}

impl ProtocolTable {
    /// Register `protocol`, replacing any entry with the same id in place.
    pub fn insert(&mut self, protocol: ArcProtocol) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.id() == protocol.id())
        {
            *entry = protocol;
        } else {
            self.entries.push(protocol);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ArcProtocol> {
        let index = self.entries.iter().position(|entry| entry.id() == id)?;

        Some(self.entries.remove(index))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id() == id)
    }

    /// Find the entry for a proposed protocol id.
    ///
    /// An exact id match always wins; otherwise the first entry, in table order, whose matcher accepts.
    pub fn find(&self, proposed: &str) -> Option<ArcProtocol> {
        self.entries
            .iter()
            .find(|entry| entry.id() == proposed)
            .or_else(|| self.entries.iter().find(|entry| entry.matches(proposed)))
            .cloned()
    }

    /// Registered protocol ids, in table order.
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.id().to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(id: &str) -> FnProtocol {
        FnProtocol::new(id.to_owned(), |_, _| async {})
    }

    #[test]
    fn test_parse_protocol_id() {
        let id = ProtocolId::try_parse("/ipfs/kad/1.0.0").unwrap();

        assert_eq!(id.path, "/ipfs/kad");
        assert_eq!(id.semver, Some(semver::Version::new(1, 0, 0)));
        assert_eq!(id.to_string(), "/ipfs/kad/1.0.0");

        let id = ProtocolId::try_parse("/noise").unwrap();

        assert_eq!(id.path, "/noise");
        assert_eq!(id.semver, None);

        assert!(ProtocolId::try_parse("noise").is_err());
    }

    #[test]
    fn test_semver_matcher() {
        let matcher = ProtocolId::try_parse("/echo/1.2.0").unwrap().semver_matcher();

        assert!(matcher("/echo/1.0.3"));
        assert!(matcher("/echo/1.9.0"));
        assert!(!matcher("/echo/2.0.0"));
        assert!(!matcher("/ping/1.2.0"));
        assert!(!matcher("/echo"));

        let matcher = ProtocolId::try_parse("/echo/0.1.0").unwrap().semver_matcher();

        assert!(matcher("/echo/0.1.7"));
        assert!(!matcher("/echo/0.2.0"));
    }

    #[test]
    fn test_find_prefers_exact_match() {
        let mut table = ProtocolTable::default();

        table.insert(Arc::new(
            noop("/echo/1.0.0").with_matcher(Arc::new(|_: &str| true)),
        ));

        table.insert(Arc::new(noop("/echo/1.1.0")));

        assert_eq!(table.find("/echo/1.1.0").unwrap().id(), "/echo/1.1.0");
        assert_eq!(table.find("/whatever").unwrap().id(), "/echo/1.0.0");

        table.remove("/echo/1.0.0");

        assert!(table.find("/whatever").is_none());
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut table = ProtocolTable::default();

        table.insert(Arc::new(noop("/a")));
        table.insert(Arc::new(noop("/b")));
        table.insert(Arc::new(noop("/a")));

        assert_eq!(table.ids(), vec!["/a".to_owned(), "/b".to_owned()]);
    }
}
