use std::{collections::VecDeque, io, time::Duration};

use futures::{stream::FuturesUnordered, StreamExt};
use identity::PeerId;
use multiaddr::Multiaddr;

use crate::{
    errors::{DialError, Error, Result},
    Connection, Transport,
};

/// The default max number of concurrent dial attempts of one [`dial_many`](LimitDialer::dial_many) call.
pub const DEFAULT_PER_PEER_RATE_LIMIT: usize = 8;

/// The default timeout of one dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// The winner of a [`dial_many`](LimitDialer::dial_many) race.
#[derive(Debug)]
pub struct DialSuccess {
    pub multiaddr: Multiaddr,
    pub conn: Connection,
}

/// Races bounded-concurrency, timed dial attempts across the candidate addresses of one peer.
#[derive(Debug, Clone)]
pub struct LimitDialer {
    per_peer_rate_limit: usize,
    dial_timeout: Duration,
}

impl Default for LimitDialer {
    fn default() -> Self {
        Self::new(DEFAULT_PER_PEER_RATE_LIMIT, DEFAULT_DIAL_TIMEOUT)
    }
}

impl LimitDialer {
    pub fn new(per_peer_rate_limit: usize, dial_timeout: Duration) -> Self {
        Self {
            per_peer_rate_limit: per_peer_rate_limit.max(1),
            dial_timeout,
        }
    }

    pub fn per_peer_rate_limit(&self) -> usize {
        self.per_peer_rate_limit
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// Dial `addrs` with at most `per_peer_rate_limit` attempts in flight.
    ///
    /// The first attempt to succeed wins, regardless of its position in `addrs`.
    /// Attempts still in flight at that point are dropped with this call.
    pub async fn dial_many(
        &self,
        peer_id: &PeerId,
        transport: &dyn Transport,
        addrs: &[Multiaddr],
    ) -> Result<DialSuccess> {
        let mut queue = VecDeque::with_capacity(addrs.len());

        for addr in addrs {
            if !queue.contains(addr) {
                queue.push_back(addr.clone());
            }
        }

        if queue.is_empty() {
            return Err(Error::NoAddresses);
        }

        log::trace!(
            "dial peer {}, candidates={}, concurrency={}",
            peer_id,
            queue.len(),
            self.per_peer_rate_limit
        );

        let dial_timeout = self.dial_timeout;

        let attempt = |addr: Multiaddr| async move {
            let result = match tokio::time::timeout(dial_timeout, transport.dial(&addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial timeout after {:?}", dial_timeout),
                )),
            };

            (addr, result)
        };

        let mut in_flight = FuturesUnordered::new();

        let mut errors = vec![];

        while in_flight.len() < self.per_peer_rate_limit {
            match queue.pop_front() {
                Some(addr) => in_flight.push(attempt(addr)),
                None => break,
            }
        }

        while let Some((addr, result)) = in_flight.next().await {
            match result {
                Ok(conn) => {
                    log::trace!("dial peer {}, connected via {}", peer_id, addr);

                    return Ok(DialSuccess {
                        multiaddr: addr,
                        conn,
                    });
                }
                Err(err) => {
                    log::trace!("dial peer {} via {}, failed: {}", peer_id, addr, err);

                    errors.push(DialError { addr, source: err });

                    if let Some(addr) = queue.pop_front() {
                        in_flight.push(attempt(addr));
                    }
                }
            }
        }

        Err(Error::AllDialsFailed {
            peer_id: *peer_id,
            errors,
        })
    }
}
