//! Admission control: per-user connection cap and temporary jail

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::hooks::AdmissionControl;
use crate::core::{ConnectionManager, User, UserId};
use crate::logger::log;

/// Decides whether a user's traffic may be served.
///
/// A user is refused while jailed or while holding more than
/// `max_tcp_connect` outbound TCP legs. Jailing kicks every live
/// connection of the user once; the jail is lifted by
/// [`release_expired`](ServerPool::release_expired).
pub struct ServerPool {
    jail: DashMap<UserId, Instant>,
    max_tcp_connect: u64,
    release_time: Duration,
    connections: ConnectionManager,
}

impl ServerPool {
    pub fn new(max_tcp_connect: u64, release_time: Duration, connections: ConnectionManager) -> Self {
        Self {
            jail: DashMap::new(),
            max_tcp_connect,
            release_time,
            connections,
        }
    }

    pub fn is_jailed(&self, user_id: UserId) -> bool {
        self.jail.contains_key(&user_id)
    }

    pub fn jailed_count(&self) -> usize {
        self.jail.len()
    }

    /// Lift the jail of users held longer than `release_time`
    pub fn release_expired(&self) -> Vec<UserId> {
        let mut released = Vec::new();
        self.jail.retain(|user_id, since| {
            let keep = since.elapsed() <= self.release_time;
            if !keep {
                released.push(*user_id);
            }
            keep
        });
        for user_id in &released {
            log::warn!(user_id = user_id, "User released from jail");
        }
        released
    }
}

impl AdmissionControl for ServerPool {
    fn filter_user(&self, user: &User) -> bool {
        !self.is_jailed(user.id) && user.tcp_count() <= self.max_tcp_connect
    }

    fn add_user_to_jail(&self, user_id: UserId) {
        match self.jail.entry(user_id) {
            Entry::Occupied(_) => {
                log::warn!(user_id = user_id, "User already in jail");
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                let kicked = self.connections.kick_user(user_id);
                log::warn!(user_id = user_id, kicked = kicked, "User jailed, connections closed");
            }
        }
    }
}
