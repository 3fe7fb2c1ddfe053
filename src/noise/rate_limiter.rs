use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How often per-source-IP counters reset.
const RESET_PERIOD: Duration = Duration::from_secs(1);

/// Per-source-IP handshake rate limiting.
///
/// Cookie challenges (the other half of the DoS story) live in
/// [`CookieChecker`](super::CookieChecker); this type only answers "has this
/// source sent too many handshakes this second".
pub struct RateLimiter {
    limit: u64,
    ip_counts: Mutex<IpCounts>,
}

struct IpCounts {
    counts: HashMap<IpAddr, u64>,
    last_reset: Instant,
}

impl RateLimiter {
    /// Create a rate limiter allowing `limit` handshakes per source IP per
    /// second.
    pub fn new(limit: u64) -> Self {
        RateLimiter {
            limit,
            ip_counts: Mutex::new(IpCounts {
                counts: HashMap::new(),
                last_reset: Instant::now(),
            }),
        }
    }

    /// Clear the counters if a reset period has elapsed. Called
    /// opportunistically from the handshake workers; cheap when nothing is
    /// due.
    pub fn try_reset_count(&self) {
        let now = Instant::now();
        let mut ip_counts = self.ip_counts.lock();
        if now.duration_since(ip_counts.last_reset) >= RESET_PERIOD {
            ip_counts.counts.clear();
            ip_counts.last_reset = now;
        }
    }

    /// Count a handshake from `src` and return whether it is still within
    /// the per-period budget.
    pub fn allow(&self, src: IpAddr) -> bool {
        let mut ip_counts = self.ip_counts.lock();
        let count = ip_counts.counts.entry(src).or_insert(0);
        *count += 1;
        *count <= self.limit
    }

    /// Drop all per-IP state. Called once at device close.
    pub fn close(&self) {
        self.ip_counts.lock().counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn budget_is_per_ip() {
        let limiter = RateLimiter::new(2);
        let a = IpAddr::from(Ipv4Addr::new(192, 0, 2, 1));
        let b = IpAddr::from(Ipv4Addr::new(192, 0, 2, 2));

        assert!(limiter.allow(a));
        assert!(limiter.allow(a));
        assert!(!limiter.allow(a));
        assert!(limiter.allow(b));
    }

    #[test]
    fn close_clears_counts() {
        let limiter = RateLimiter::new(1);
        let a = IpAddr::from(Ipv4Addr::new(192, 0, 2, 1));
        assert!(limiter.allow(a));
        assert!(!limiter.allow(a));
        limiter.close();
        assert!(limiter.allow(a));
    }
}
