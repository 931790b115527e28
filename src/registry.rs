//! Client session registry with heartbeat-based liveness
//!
//! One entry per distinct remote endpoint that has ever sent a message.
//! Entries are created on first contact, their idle time is reset on every
//! subsequent message, and they are evicted once idle time passes the
//! configured threshold.
//!
//! The registry is only ever touched from the single dispatch tick, so it
//! needs no locking. It is serde-serializable (endpoints and durations only,
//! no transport handles) so it survives host reload cycles as part of the
//! durable dispatch snapshot.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// A connected remote endpoint and how long it has been silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub endpoint: SocketAddr,
    pub idle: Duration,
}

/// Registry of connected clients for exactly one local process.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    sessions: Vec<ClientSession>,
    timeout: Duration,
}

impl ClientRegistry {
    /// Create an empty registry with the given eviction threshold.
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Vec::new(),
            timeout,
        }
    }

    /// Rebuild a registry from a durable snapshot.
    pub fn restore(sessions: Vec<ClientSession>, timeout: Duration) -> Self {
        Self { sessions, timeout }
    }

    /// Durable view of the registry for snapshotting across reloads.
    pub fn sessions(&self) -> &[ClientSession] {
        &self.sessions
    }

    /// Create-or-refresh an endpoint. Resets idle time to zero and returns
    /// true when this endpoint was not previously known.
    pub fn touch(&mut self, endpoint: SocketAddr) -> bool {
        if let Some(session) = self.sessions.iter_mut().find(|s| s.endpoint == endpoint) {
            session.idle = Duration::ZERO;
            return false;
        }
        self.sessions.push(ClientSession {
            endpoint,
            idle: Duration::ZERO,
        });
        log::info!("Client connected: {endpoint}");
        true
    }

    /// Age all entries by `delta` and evict those past the threshold.
    /// Callers clamp `delta` before handing it over; the registry applies
    /// whatever it is given.
    pub fn tick(&mut self, delta: Duration) {
        let timeout = self.timeout;
        self.sessions.retain_mut(|session| {
            session.idle += delta;
            if session.idle > timeout {
                log::info!(
                    "Client evicted after {:.1}s of silence: {}",
                    session.idle.as_secs_f64(),
                    session.endpoint
                );
                false
            } else {
                true
            }
        });
    }

    /// All currently registered endpoints.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.sessions.iter().map(|s| s.endpoint).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Duration::from_secs(4))
    }

    #[test]
    fn touch_reports_new_only_once() {
        let mut reg = registry();
        assert!(reg.touch(endpoint(5000)));
        assert!(!reg.touch(endpoint(5000)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn touch_resets_idle_time() {
        let mut reg = registry();
        reg.touch(endpoint(5000));
        reg.tick(Duration::from_secs(3));
        // Refreshed before the threshold - survives another 3s of aging.
        assert!(!reg.touch(endpoint(5000)));
        reg.tick(Duration::from_secs(3));
        assert_eq!(reg.endpoints(), vec![endpoint(5000)]);
    }

    #[test]
    fn eviction_past_threshold() {
        let mut reg = registry();
        reg.touch(endpoint(5000));
        for _ in 0..5 {
            reg.tick(Duration::from_secs(1));
        }
        assert!(reg.is_empty());
        assert!(reg.endpoints().is_empty());
    }

    #[test]
    fn eviction_is_per_endpoint() {
        let mut reg = registry();
        reg.touch(endpoint(5000));
        reg.touch(endpoint(5001));
        reg.tick(Duration::from_secs(3));
        reg.touch(endpoint(5001)); // only 5001 stays fresh
        reg.tick(Duration::from_secs(2));
        assert_eq!(reg.endpoints(), vec![endpoint(5001)]);
    }

    #[test]
    fn exact_threshold_is_not_evicted() {
        let mut reg = registry();
        reg.touch(endpoint(5000));
        reg.tick(Duration::from_secs(4));
        assert_eq!(reg.len(), 1);
        reg.tick(Duration::from_millis(1));
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut reg = registry();
        reg.touch(endpoint(5000));
        reg.touch(endpoint(5001));
        reg.tick(Duration::from_secs(1));

        let json = serde_json::to_string(reg.sessions()).unwrap();
        let sessions: Vec<ClientSession> = serde_json::from_str(&json).unwrap();
        let restored = ClientRegistry::restore(sessions, Duration::from_secs(4));

        assert_eq!(restored.endpoints(), reg.endpoints());
        // Idle time survives the round-trip, so a restored client that was
        // already 1s idle still evicts 4s later.
        assert_eq!(restored.sessions()[0].idle, Duration::from_secs(1));
    }
}
