//! A connected tunnel peer (spec.md §2, "one persistent encrypted
//! connection per client").

use parking_lot::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::multiplexer::Multiplexer;
use crate::server::throttle::Throttle;

/// One client's live tunnel: its identity, the hostnames its token grants it,
/// and the multiplexer driving its channels.
pub struct Peer {
    identity: [u8; 32],
    hostnames: Vec<String>,
    multiplexer: Multiplexer,
    valid_until: u64,
    last_activity: Mutex<Instant>,
    throttle: Throttle,
}

impl Peer {
    pub fn new(
        identity: [u8; 32],
        hostnames: Vec<String>,
        multiplexer: Multiplexer,
        valid_until: u64,
        throttle_rate: u32,
        throttle_burst: u32,
    ) -> Self {
        Peer {
            identity,
            hostnames,
            multiplexer,
            valid_until,
            last_activity: Mutex::new(Instant::now()),
            throttle: Throttle::new(throttle_rate, throttle_burst),
        }
    }

    pub fn identity(&self) -> [u8; 32] {
        self.identity
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether this peer's handshake token has expired (invariant 5: equal
    /// to now counts as expired).
    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_secs();
        self.valid_until <= now
    }

    /// Reserves one unit of throughput against this peer's rate limit.
    pub fn try_acquire(&self, cost: u32) -> bool {
        self.throttle.try_acquire(cost)
    }
}
