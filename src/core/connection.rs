//! Registry of live client connections
//!
//! Every served connection or datagram flow registers here and receives a
//! cancellation token; jailing a user cancels all of that user's tokens.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::hooks::UserId;
use crate::logger::log;
use crate::transport::TransportKind;

pub type ConnectionId = u64;

#[derive(Debug)]
struct Registered {
    user_id: UserId,
    peer_addr: SocketAddr,
    kind: TransportKind,
    since: Instant,
    cancel: CancellationToken,
}

/// Live connections indexed by id and by user
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    next_id: Arc<AtomicU64>,
    connections: Arc<DashMap<ConnectionId, Registered>>,
    by_user: Arc<DashMap<UserId, Vec<ConnectionId>>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(DashMap::new()),
            by_user: Arc::new(DashMap::new()),
        }
    }

    /// Register a connection; the returned token is cancelled on kick
    pub fn register(
        &self,
        user_id: UserId,
        peer_addr: SocketAddr,
        kind: TransportKind,
    ) -> (ConnectionId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.connections.insert(
            id,
            Registered {
                user_id,
                peer_addr,
                kind,
                since: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        self.by_user.entry(user_id).or_default().push(id);
        (id, cancel)
    }

    pub fn unregister(&self, id: ConnectionId) {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return;
        };
        // remove_if_mut holds the shard lock across the retain and the
        // emptiness check, so a concurrent register cannot be lost
        self.by_user.remove_if_mut(&conn.user_id, |_, ids| {
            ids.retain(|&other| other != id);
            ids.is_empty()
        });
    }

    /// Cancel every connection of `user_id`, returning how many
    pub fn kick_user(&self, user_id: UserId) -> usize {
        let Some(ids) = self.by_user.get(&user_id) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id))
            .map(|conn| {
                log::trace!(
                    peer = %conn.peer_addr,
                    kind = %conn.kind,
                    age_ms = conn.since.elapsed().as_millis() as u64,
                    "Kicking connection"
                );
                conn.cancel.cancel();
            })
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Live connections of one user
    pub fn user_connections(&self, user_id: UserId) -> usize {
        self.by_user.get(&user_id).map(|ids| ids.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_unregister() {
        let manager = ConnectionManager::new();
        let (a, _) = manager.register(1, peer(1000), TransportKind::Tcp);
        let (b, _) = manager.register(1, peer(1001), TransportKind::Udp);
        let (c, _) = manager.register(2, peer(1002), TransportKind::Tcp);
        assert!(a < b && b < c);
        assert_eq!(manager.connection_count(), 3);
        assert_eq!(manager.user_count(), 2);
        assert_eq!(manager.user_connections(1), 2);

        manager.unregister(a);
        assert_eq!(manager.user_connections(1), 1);
        manager.unregister(b);
        manager.unregister(c);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.user_count(), 0);

        // unknown ids are ignored
        manager.unregister(a);
    }

    #[test]
    fn test_kick_user_cancels_only_that_user() {
        let manager = ConnectionManager::new();
        let (_, t1) = manager.register(1, peer(1000), TransportKind::Tcp);
        let (_, t2) = manager.register(1, peer(1001), TransportKind::Tcp);
        let (_, t3) = manager.register(2, peer(1002), TransportKind::Tcp);

        assert_eq!(manager.kick_user(1), 2);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert!(!t3.is_cancelled());
        assert_eq!(manager.kick_user(99), 0);
    }

    #[test]
    fn test_concurrent_same_user_leaves_no_entries() {
        use std::thread;

        let manager = ConnectionManager::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = manager.clone();
                thread::spawn(move || {
                    for j in 0..200 {
                        let (id, _) = m.register(7, peer(i * 1000 + j), TransportKind::Tcp);
                        thread::yield_now();
                        m.unregister(id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.user_count(), 0);
    }
}
