//! Subscriber model shared by every connection of one user

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use super::hooks::UserId;
use crate::config::UserConfig;

#[derive(Debug, Clone)]
struct Credentials {
    method: String,
    password: String,
}

/// A subscriber and its traffic counters.
///
/// Shared by all of the user's connections, so every counter is atomic.
/// Credentials and quota can change while the user is served; new
/// connections pick up the change.
#[derive(Debug)]
pub struct User {
    pub id: UserId,
    pub port: u16,
    credentials: RwLock<Credentials>,
    /// Quota in bytes, 0 means unlimited
    total_traffic: AtomicU64,
    tcp_count: AtomicU64,
    once_used_u: AtomicU64,
    once_used_d: AtomicU64,
    upload_traffic: AtomicU64,
    download_traffic: AtomicU64,
}

impl User {
    pub fn new(id: UserId, port: u16, method: &str, password: &str) -> Self {
        Self {
            id,
            port,
            credentials: RwLock::new(Credentials {
                method: method.to_string(),
                password: password.to_string(),
            }),
            total_traffic: AtomicU64::new(0),
            tcp_count: AtomicU64::new(0),
            once_used_u: AtomicU64::new(0),
            once_used_d: AtomicU64::new(0),
            upload_traffic: AtomicU64::new(0),
            download_traffic: AtomicU64::new(0),
        }
    }

    pub fn with_quota(self, total: u64, upload: u64, download: u64) -> Self {
        self.total_traffic.store(total, Ordering::Relaxed);
        self.upload_traffic.store(upload, Ordering::Relaxed);
        self.download_traffic.store(download, Ordering::Relaxed);
        self
    }

    pub fn method(&self) -> String {
        self.read_credentials().method.clone()
    }

    /// `(method, password)` read together
    pub fn credentials(&self) -> (String, String) {
        let creds = self.read_credentials();
        (creds.method.clone(), creds.password.clone())
    }

    fn read_credentials(&self) -> std::sync::RwLockReadGuard<'_, Credentials> {
        self.credentials.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total_traffic(&self) -> u64 {
        self.total_traffic.load(Ordering::Relaxed)
    }

    /// Apply an edited users-file entry in place.
    ///
    /// Credentials and quota always follow `cfg`. The cumulative counters
    /// are only overwritten when the entry's value changed since `previous`,
    /// so a reload of an unchanged file keeps the traffic counted since.
    pub fn apply_config(&self, previous: &UserConfig, cfg: &UserConfig) {
        {
            let mut creds = self
                .credentials
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            creds.method.clone_from(&cfg.method);
            creds.password.clone_from(&cfg.password);
        }
        self.total_traffic.store(cfg.total_traffic, Ordering::Relaxed);
        if cfg.upload_traffic != previous.upload_traffic {
            self.upload_traffic.store(cfg.upload_traffic, Ordering::Relaxed);
        }
        if cfg.download_traffic != previous.download_traffic {
            self.download_traffic.store(cfg.download_traffic, Ordering::Relaxed);
        }
    }

    pub fn tcp_count(&self) -> u64 {
        self.tcp_count.load(Ordering::Relaxed)
    }

    pub fn incr_tcp(&self) {
        self.tcp_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the live TCP count, never below zero
    pub fn decr_tcp(&self) {
        let _ = self
            .tcp_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn add_upload(&self, bytes: u64) {
        self.once_used_u.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.once_used_d.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Take back upload bytes that were never delivered
    pub fn sub_upload(&self, bytes: u64) {
        let _ = self
            .once_used_u
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(bytes))
            });
    }

    /// Upload bytes in the current accounting window
    pub fn once_used_u(&self) -> u64 {
        self.once_used_u.load(Ordering::Relaxed)
    }

    /// Download bytes in the current accounting window
    pub fn once_used_d(&self) -> u64 {
        self.once_used_d.load(Ordering::Relaxed)
    }

    /// Close the accounting window: fold it into the cumulative counters
    /// and return `(upload, download)` of the closed window.
    pub fn take_window(&self) -> (u64, u64) {
        let u = self.once_used_u.swap(0, Ordering::Relaxed);
        let d = self.once_used_d.swap(0, Ordering::Relaxed);
        self.upload_traffic.fetch_add(u, Ordering::Relaxed);
        self.download_traffic.fetch_add(d, Ordering::Relaxed);
        (u, d)
    }

    /// Cumulative plus current window traffic
    pub fn used_traffic(&self) -> u64 {
        self.upload_traffic.load(Ordering::Relaxed)
            + self.download_traffic.load(Ordering::Relaxed)
            + self.once_used_u()
            + self.once_used_d()
    }

    pub fn is_over_quota(&self) -> bool {
        let total = self.total_traffic();
        total != 0 && self.used_traffic() > total
    }
}

impl From<&UserConfig> for User {
    fn from(cfg: &UserConfig) -> Self {
        User::new(cfg.user_id, cfg.port, &cfg.method, &cfg.password).with_quota(
            cfg.total_traffic,
            cfg.upload_traffic,
            cfg.download_traffic,
        )
    }
}
