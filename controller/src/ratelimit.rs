//! # Rate Limiting
//!
//! Two fixed-window limiters protect the gateway:
//!
//! - [`ConnRateLimiter`]: shared, per-IP, applied before the WebSocket
//!   upgrade. Exceeding it refuses the connection attempt.
//! - [`MessageWindow`]: per-connection, applied to inbound frames after
//!   the handshake. Exceeding it drops frames with a warning.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

struct Window {
    started: Instant,
    count: u32,
}

/// Shared fixed-window limiter for connection attempts, keyed by peer IP.
pub struct ConnRateLimiter {
    max: u32,
    window: Duration,
    hits: DashMap<IpAddr, Window>,
}

impl ConnRateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: DashMap::new(),
        }
    }

    /// Records an attempt from `ip` and returns whether it is within the
    /// limit. The first `max` attempts per window pass.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.hits.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= self.max
    }
}

/// Fixed-window counter for one connection's inbound messages.
pub struct MessageWindow {
    max: u32,
    window: Duration,
    started: Instant,
    count: u32,
}

impl MessageWindow {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            started: Instant::now(),
            count: 0,
        }
    }

    /// Counts one message; false means the frame should be dropped.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.started) >= self.window {
            self.started = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eleventh_attempt_in_window_is_refused() {
        let limiter = ConnRateLimiter::new(10, Duration::from_secs(60));
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        for _ in 0..10 {
            assert!(limiter.check(ip));
        }
        assert!(!limiter.check(ip));
    }

    #[test]
    fn limits_are_per_ip() {
        let limiter = ConnRateLimiter::new(1, Duration::from_secs(60));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }

    #[test]
    fn window_resets() {
        let limiter = ConnRateLimiter::new(1, Duration::from_millis(10));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check(ip));
    }

    #[test]
    fn message_window_drops_excess() {
        let mut window = MessageWindow::new(2, Duration::from_secs(60));
        assert!(window.allow());
        assert!(window.allow());
        assert!(!window.allow());
    }
}
