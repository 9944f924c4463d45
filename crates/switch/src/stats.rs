//! Traffic statistics of one [`Switch`](crate::Switch).
//!
//! Bytes are counted where they cross a [`Connection`]: raw transport connections
//! account for the global, per-transport and per-peer stats, negotiated connections
//! and substreams account for the per-protocol stats.
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{AsyncRead, AsyncWrite};
use identity::PeerId;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::Connection;

/// The default interval between two moving average computations.
pub const DEFAULT_COMPUTE_THROTTLE: Duration = Duration::from_secs(2);

/// Timespans of the moving averages every [`Stat`] keeps.
pub const MOVING_AVERAGE_INTERVALS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(900),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Total bytes transferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub data_received: u64,
    pub data_sent: u64,
}

impl Snapshot {
    fn add(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::In => self.data_received += bytes,
            Direction::Out => self.data_sent += bytes,
        }
    }
}

/// Exponentially weighted moving average of a rate, in bytes per second.
#[derive(Debug, Clone)]
struct MovingAverage {
    timespan: Duration,
    value: Option<f64>,
}

impl MovingAverage {
    fn new(timespan: Duration) -> Self {
        Self {
            timespan,
            value: None,
        }
    }

    fn push(&mut self, elapsed: Duration, rate: f64) {
        let alpha = 1.0 - (-elapsed.as_secs_f64() / self.timespan.as_secs_f64()).exp();

        self.value = Some(match self.value {
            Some(average) => alpha * rate + (1.0 - alpha) * average,
            None => rate,
        });
    }
}

/// Counters plus moving averages of one traffic scope.
#[derive(Debug, Clone)]
pub struct Stat {
    snapshot: Snapshot,
    pending: Snapshot,
    last_compute: Instant,
    received: Vec<MovingAverage>,
    sent: Vec<MovingAverage>,
}

impl Stat {
    fn new(now: Instant) -> Self {
        Self {
            snapshot: Snapshot::default(),
            pending: Snapshot::default(),
            last_compute: now,
            received: MOVING_AVERAGE_INTERVALS
                .iter()
                .copied()
                .map(MovingAverage::new)
                .collect(),
            sent: MOVING_AVERAGE_INTERVALS
                .iter()
                .copied()
                .map(MovingAverage::new)
                .collect(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// The moving average of `direction` over `interval`, one of [`MOVING_AVERAGE_INTERVALS`].
    ///
    /// Returns `None` before the first computation.
    pub fn moving_average(&self, direction: Direction, interval: Duration) -> Option<f64> {
        let averages = match direction {
            Direction::In => &self.received,
            Direction::Out => &self.sent,
        };

        averages
            .iter()
            .find(|average| average.timespan == interval)
            .and_then(|average| average.value)
    }

    fn record(&mut self, direction: Direction, bytes: u64, now: Instant, throttle: Duration) {
        self.snapshot.add(direction, bytes);
        self.pending.add(direction, bytes);

        if now.duration_since(self.last_compute) >= throttle {
            self.compute(now);
        }
    }

    fn compute(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_compute);

        if elapsed.is_zero() {
            return;
        }

        let received = self.pending.data_received as f64 / elapsed.as_secs_f64();
        let sent = self.pending.data_sent as f64 / elapsed.as_secs_f64();

        for average in &mut self.received {
            average.push(elapsed, received);
        }

        for average in &mut self.sent {
            average.push(elapsed, sent);
        }

        self.pending = Snapshot::default();
        self.last_compute = now;
    }
}

#[derive(Default)]
struct Scopes {
    global: Option<Stat>,
    transports: HashMap<String, Stat>,
    protocols: HashMap<String, Stat>,
    peers: HashMap<PeerId, Stat>,
}

/// Traffic statistics, globally and per transport, protocol and peer.
///
/// Peer stats are kept after the peer disconnects.
pub struct Stats {
    compute_throttle: Duration,
    scopes: Mutex<Scopes>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new(DEFAULT_COMPUTE_THROTTLE)
    }
}

impl Stats {
    /// Create stats that update their moving averages at most once per `compute_throttle`.
    pub fn new(compute_throttle: Duration) -> Self {
        Self {
            compute_throttle,
            scopes: Default::default(),
        }
    }

    pub fn global(&self) -> Snapshot {
        self.scopes
            .lock()
            .global
            .as_ref()
            .map(Stat::snapshot)
            .unwrap_or_default()
    }

    /// Keys of the transports that carried any traffic, sorted.
    pub fn transports(&self) -> Vec<String> {
        sorted(self.scopes.lock().transports.keys().cloned())
    }

    /// Ids of the protocols that carried any traffic, sorted.
    pub fn protocols(&self) -> Vec<String> {
        sorted(self.scopes.lock().protocols.keys().cloned())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        sorted(self.scopes.lock().peers.keys().copied())
    }

    pub fn for_transport(&self, key: &str) -> Option<Stat> {
        self.scopes.lock().transports.get(key).cloned()
    }

    pub fn for_protocol(&self, id: &str) -> Option<Stat> {
        self.scopes.lock().protocols.get(id).cloned()
    }

    pub fn for_peer(&self, peer_id: &PeerId) -> Option<Stat> {
        self.scopes.lock().peers.get(peer_id).cloned()
    }

    fn record_transport(
        &self,
        key: &str,
        peer_id: Option<&PeerId>,
        direction: Direction,
        bytes: u64,
    ) {
        let now = Instant::now();

        let mut scopes = self.scopes.lock();

        scopes
            .global
            .get_or_insert_with(|| Stat::new(now))
            .record(direction, bytes, now, self.compute_throttle);

        entry(&mut scopes.transports, key, now).record(
            direction,
            bytes,
            now,
            self.compute_throttle,
        );

        if let Some(peer_id) = peer_id {
            scopes
                .peers
                .entry(*peer_id)
                .or_insert_with(|| Stat::new(now))
                .record(direction, bytes, now, self.compute_throttle);
        }
    }

    fn record_protocol(&self, id: &str, direction: Direction, bytes: u64) {
        let now = Instant::now();

        entry(&mut self.scopes.lock().protocols, id, now).record(
            direction,
            bytes,
            now,
            self.compute_throttle,
        );
    }

    fn record_peer(&self, peer_id: &PeerId, traffic: Snapshot) {
        let now = Instant::now();

        let mut scopes = self.scopes.lock();

        let stat = scopes
            .peers
            .entry(*peer_id)
            .or_insert_with(|| Stat::new(now));

        stat.record(
            Direction::In,
            traffic.data_received,
            now,
            self.compute_throttle,
        );
        stat.record(Direction::Out, traffic.data_sent, now, self.compute_throttle);
    }
}

fn entry<'a>(map: &'a mut HashMap<String, Stat>, key: &str, now: Instant) -> &'a mut Stat {
    map.entry(key.to_owned()).or_insert_with(|| Stat::new(now))
}

fn sorted<T: Ord, I: Iterator<Item = T>>(iter: I) -> Vec<T> {
    let mut items = iter.collect::<Vec<_>>();
    items.sort();
    items
}

/// A transport connection's peer, resolved late on inbound connections.
#[derive(Default)]
struct PeerSlot {
    peer_id: Option<PeerId>,
    /// Traffic counted before the peer was known.
    unattributed: Snapshot,
}

enum Scope {
    Transport { key: String, peer: Mutex<PeerSlot> },
    Protocol(String),
}

/// Counts the traffic of one connection into [`Stats`].
#[derive(Clone)]
pub(crate) struct Meter {
    stats: Arc<Stats>,
    scope: Arc<Scope>,
}

impl Meter {
    pub(crate) fn transport(stats: Arc<Stats>, key: &str, peer_id: Option<PeerId>) -> Self {
        Self {
            stats,
            scope: Arc::new(Scope::Transport {
                key: key.to_owned(),
                peer: Mutex::new(PeerSlot {
                    peer_id,
                    unattributed: Snapshot::default(),
                }),
            }),
        }
    }

    pub(crate) fn protocol(stats: Arc<Stats>, id: &str) -> Self {
        Self {
            stats,
            scope: Arc::new(Scope::Protocol(id.to_owned())),
        }
    }

    fn record(&self, direction: Direction, bytes: usize) {
        if bytes == 0 {
            return;
        }

        let bytes = bytes as u64;

        match self.scope.as_ref() {
            Scope::Transport { key, peer } => {
                let mut peer = peer.lock();

                self.stats
                    .record_transport(key, peer.peer_id.as_ref(), direction, bytes);

                if peer.peer_id.is_none() {
                    peer.unattributed.add(direction, bytes);
                }
            }
            Scope::Protocol(id) => self.stats.record_protocol(id, direction, bytes),
        }
    }

    /// Credit the traffic of a transport connection to `peer_id`, including the traffic
    /// counted before. Does nothing once the peer is known.
    pub(crate) fn attribute(&self, peer_id: PeerId) {
        let Scope::Transport { peer, .. } = self.scope.as_ref() else {
            return;
        };

        let mut peer = peer.lock();

        if peer.peer_id.is_some() {
            return;
        }

        peer.peer_id = Some(peer_id);

        let unattributed = std::mem::take(&mut peer.unattributed);

        self.stats.record_peer(&peer_id, unattributed);
    }

    fn is_transport(&self) -> bool {
        matches!(self.scope.as_ref(), Scope::Transport { .. })
    }
}

/// A byte stream that counts its traffic with a [`Meter`].
struct Metered<S> {
    stream: S,
    meter: Meter,
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let poll = Pin::new(&mut this.stream).poll_read(cx, buf);

        if let Poll::Ready(Ok(read_size)) = &poll {
            this.meter.record(Direction::In, *read_size);
        }

        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let poll = Pin::new(&mut this.stream).poll_write(cx, buf);

        if let Poll::Ready(Ok(write_size)) = &poll {
            this.meter.record(Direction::Out, *write_size);
        }

        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_close(cx)
    }
}

impl Connection {
    /// Count the traffic of this connection with `meter`.
    ///
    /// A transport meter is kept with the connection, see [`Connection::attribute`].
    pub(crate) fn metered(self, meter: Meter) -> Self {
        let is_transport = meter.is_transport();

        let kept = meter.clone();

        let mut conn = self.map(move |stream| Metered { stream, meter });

        if is_transport {
            conn.set_meter(kept);
        }

        conn
    }

    /// Credit the traffic of the underlying transport connection to `peer_id`.
    pub(crate) fn attribute(&self, peer_id: PeerId) {
        if let Some(meter) = self.meter() {
            meter.attribute(peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_moving_average() {
        let mut stat = Stat::new(Instant::now());

        let throttle = Duration::from_millis(100);

        stat.record(Direction::In, 1000, Instant::now(), throttle);

        assert_eq!(stat.moving_average(Direction::In, MOVING_AVERAGE_INTERVALS[0]), None);

        tokio::time::advance(Duration::from_secs(1)).await;

        stat.record(Direction::In, 1000, Instant::now(), throttle);

        for interval in MOVING_AVERAGE_INTERVALS {
            assert_eq!(stat.moving_average(Direction::In, interval), Some(2000.0));
            assert_eq!(stat.moving_average(Direction::Out, interval), Some(0.0));
        }

        assert_eq!(
            stat.moving_average(Direction::In, Duration::from_secs(1)),
            None
        );

        tokio::time::advance(Duration::from_secs(1)).await;

        stat.record(Direction::In, 0, Instant::now(), throttle);

        // decays toward the new rate, slower for longer intervals.
        let short = stat
            .moving_average(Direction::In, MOVING_AVERAGE_INTERVALS[0])
            .unwrap();
        let long = stat
            .moving_average(Direction::In, MOVING_AVERAGE_INTERVALS[2])
            .unwrap();

        assert!(short < long);
        assert!(long < 2000.0);

        assert_eq!(
            stat.snapshot(),
            Snapshot {
                data_received: 2000,
                data_sent: 0
            }
        );
    }

    #[tokio::test]
    async fn test_scopes() {
        let stats = Arc::new(Stats::default());

        let peer_id = PeerId::random();

        let tcp = Meter::transport(stats.clone(), "tcp", Some(peer_id));
        let echo = Meter::protocol(stats.clone(), "/echo/1.0.0");

        tcp.record(Direction::Out, 10);
        tcp.record(Direction::In, 4);
        echo.record(Direction::Out, 2);

        let expected = Snapshot {
            data_received: 4,
            data_sent: 10,
        };

        assert_eq!(stats.global(), expected);
        assert_eq!(stats.for_transport("tcp").unwrap().snapshot(), expected);
        assert_eq!(stats.for_peer(&peer_id).unwrap().snapshot(), expected);

        assert_eq!(
            stats.for_protocol("/echo/1.0.0").unwrap().snapshot(),
            Snapshot {
                data_received: 0,
                data_sent: 2
            }
        );

        assert_eq!(stats.transports(), vec!["tcp"]);
        assert_eq!(stats.protocols(), vec!["/echo/1.0.0"]);
        assert_eq!(stats.peers(), vec![peer_id]);
        assert!(stats.for_transport("ws").is_none());
    }

    #[tokio::test]
    async fn test_late_attribution() {
        let stats = Arc::new(Stats::default());

        let meter = Meter::transport(stats.clone(), "tcp", None);

        meter.record(Direction::In, 7);

        assert!(stats.peers().is_empty());

        let peer_id = PeerId::random();

        meter.attribute(peer_id);
        meter.record(Direction::In, 3);

        // attributed once.
        meter.attribute(PeerId::random());

        assert_eq!(stats.peers(), vec![peer_id]);
        assert_eq!(stats.for_peer(&peer_id).unwrap().snapshot().data_received, 10);
        assert_eq!(stats.global().data_received, 10);
    }

    #[tokio::test]
    async fn test_metered_connection() {
        let (lhs, rhs) = tokio::io::duplex(64);

        let stats = Arc::new(Stats::default());

        let mut conn = Connection::new(lhs.compat())
            .metered(Meter::transport(stats.clone(), "memory", None))
            .metered(Meter::protocol(stats.clone(), "/echo/1.0.0"));

        let mut rhs = rhs.compat();

        conn.write_all(b"hello").await.unwrap();

        let mut buf = [0; 5];

        rhs.read_exact(&mut buf).await.unwrap();
        rhs.write_all(b"hi").await.unwrap();

        let mut buf = [0; 2];

        conn.read_exact(&mut buf).await.unwrap();

        let expected = Snapshot {
            data_received: 2,
            data_sent: 5,
        };

        assert_eq!(stats.for_transport("memory").unwrap().snapshot(), expected);
        assert_eq!(stats.for_protocol("/echo/1.0.0").unwrap().snapshot(), expected);

        let peer_id = PeerId::random();

        conn.attribute(peer_id);

        assert_eq!(stats.for_peer(&peer_id).unwrap().snapshot(), expected);
    }
}
