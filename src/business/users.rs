//! User store with quota enforcement and per-user listener cancellation

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::UserConfig;
use crate::core::{ConnectionManager, User, UserId};
use crate::logger::log;

struct Served {
    user: Arc<User>,
    /// Stops the user's listeners
    token: CancellationToken,
    /// Entry the user was last loaded from
    config: UserConfig,
}

/// Outcome of one [`UserManager::sync`]
#[derive(Default)]
pub struct SyncReport {
    /// Users that need listeners: new entries and port changes
    pub started: Vec<Arc<User>>,
    pub added: usize,
    pub updated: usize,
    pub rebound: usize,
    pub removed: usize,
}

/// Users by id.
///
/// Each user owns a child of the root shutdown token; removing a user
/// cancels it and kicks the user's live connections.
pub struct UserManager {
    users: DashMap<UserId, Served>,
    /// Entries removed for exceeding their quota, kept out of sync until edited
    over_quota: DashMap<UserId, UserConfig>,
    connections: ConnectionManager,
    shutdown: CancellationToken,
}

impl UserManager {
    pub fn new(connections: ConnectionManager, shutdown: CancellationToken) -> Self {
        Self {
            users: DashMap::new(),
            over_quota: DashMap::new(),
            connections,
            shutdown,
        }
    }

    /// Replace the store contents with `configs`
    pub fn init(&self, configs: &[UserConfig]) {
        for entry in self.users.iter() {
            entry.token.cancel();
        }
        self.users.clear();
        self.over_quota.clear();

        for cfg in configs {
            self.insert(cfg);
        }

        log::info!(count = configs.len(), "Users initialized");
    }

    fn insert(&self, cfg: &UserConfig) -> Arc<User> {
        let user = Arc::new(User::from(cfg));
        self.users.insert(
            cfg.user_id,
            Served {
                user: Arc::clone(&user),
                token: self.shutdown.child_token(),
                config: cfg.clone(),
            },
        );
        user
    }

    /// Bring the store in line with a reloaded users file.
    ///
    /// New entries are added; a changed port replaces the user, stopping
    /// its old listeners; any other change is applied in place. Users
    /// missing from `configs` are removed. Ids for which `skip` holds are
    /// left untouched either way.
    pub fn sync(&self, configs: &[UserConfig], skip: impl Fn(UserId) -> bool) -> SyncReport {
        let mut report = SyncReport::default();

        let wanted: HashSet<UserId> = configs.iter().map(|c| c.user_id).collect();
        let gone: Vec<UserId> = self
            .users
            .iter()
            .map(|s| *s.key())
            .filter(|id| !wanted.contains(id) && !skip(*id))
            .collect();
        for user_id in gone {
            if self.remove(user_id).is_some() {
                report.removed += 1;
            }
        }
        self.over_quota.retain(|id, _| wanted.contains(id));

        for cfg in configs {
            let user_id = cfg.user_id;
            if skip(user_id) {
                continue;
            }
            if let Some(retired) = self.over_quota.get(&user_id) {
                if *retired == *cfg {
                    continue;
                }
            }
            self.over_quota.remove(&user_id);

            let current = self
                .users
                .get(&user_id)
                .map(|s| (Arc::clone(&s.user), s.config.clone()));
            match current {
                None => {
                    report.started.push(self.insert(cfg));
                    report.added += 1;
                }
                Some((_, previous)) if previous == *cfg => {}
                Some((old, previous)) if previous.port != cfg.port => {
                    self.remove(user_id);
                    let user = self.insert(cfg);
                    let (u, d) = old.take_window();
                    user.add_upload(u);
                    user.add_download(d);
                    log::info!(user_id = user_id, from = previous.port, to = cfg.port, "User port changed");
                    report.started.push(user);
                    report.rebound += 1;
                }
                Some((user, previous)) => {
                    user.apply_config(&previous, cfg);
                    if let Some(mut served) = self.users.get_mut(&user_id) {
                        served.config = cfg.clone();
                    }
                    log::debug!(user_id = user_id, "User updated");
                    report.updated += 1;
                }
            }
        }
        report
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<User>> {
        self.users.get(&user_id).map(|s| Arc::clone(&s.user))
    }

    /// Token cancelled when the user stops being served
    pub fn token(&self, user_id: UserId) -> Option<CancellationToken> {
        self.users.get(&user_id).map(|s| s.token.clone())
    }

    /// All users, ordered by id
    pub fn list(&self) -> Vec<Arc<User>> {
        let mut users: Vec<Arc<User>> = self.users.iter().map(|s| Arc::clone(&s.user)).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Stop serving a user: close its listeners and live connections
    pub fn remove(&self, user_id: UserId) -> Option<Arc<User>> {
        let (_, served) = self.users.remove(&user_id)?;
        served.token.cancel();
        let kicked = self.connections.kick_user(user_id);
        log::info!(user_id = user_id, port = served.user.port, kicked = kicked, "User removed");
        Some(served.user)
    }

    /// Remove every user whose used traffic exceeds its quota
    pub fn check_user_traffic(&self) -> Vec<UserId> {
        let over: Vec<UserId> = self
            .users
            .iter()
            .filter(|s| s.user.is_over_quota())
            .map(|s| *s.key())
            .collect();

        for user_id in &over {
            let config = self.users.get(user_id).map(|s| s.config.clone());
            if let Some(config) = config {
                self.over_quota.insert(*user_id, config);
            }
            if let Some(user) = self.remove(*user_id) {
                log::warn!(
                    user_id = user_id,
                    used = user.used_traffic(),
                    total = user.total_traffic(),
                    "User over quota"
                );
            }
        }
        over
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    fn config(id: UserId, port: u16, total: u64, upload: u64) -> UserConfig {
        UserConfig {
            user_id: id,
            port,
            method: "aes-256-cfb".to_string(),
            password: format!("pw-{id}"),
            total_traffic: total,
            upload_traffic: upload,
            download_traffic: 0,
        }
    }

    fn manager() -> (UserManager, ConnectionManager, CancellationToken) {
        let connections = ConnectionManager::new();
        let shutdown = CancellationToken::new();
        (
            UserManager::new(connections.clone(), shutdown.clone()),
            connections,
            shutdown,
        )
    }

    #[test]
    fn test_init_and_list() {
        let (users, _, _) = manager();
        users.init(&[config(2, 2000, 0, 0), config(1, 1000, 0, 0)]);

        assert_eq!(users.user_count(), 2);
        let ids: Vec<UserId> = users.list().iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(users.get(2).unwrap().port, 2000);
        assert!(users.get(3).is_none());
    }

    #[test]
    fn test_reinit_cancels_previous_tokens() {
        let (users, _, _) = manager();
        users.init(&[config(1, 1000, 0, 0)]);
        let old = users.token(1).unwrap();

        users.init(&[config(1, 1000, 0, 0)]);
        assert!(old.is_cancelled());
        assert!(!users.token(1).unwrap().is_cancelled());
    }

    #[test]
    fn test_remove_cancels_and_kicks() {
        let (users, connections, _) = manager();
        users.init(&[config(1, 1000, 0, 0)]);
        let token = users.token(1).unwrap();
        let (_, conn) = connections.register(1, "127.0.0.1:9".parse().unwrap(), TransportKind::Tcp);

        assert!(users.remove(1).is_some());
        assert!(token.is_cancelled());
        assert!(conn.is_cancelled());
        assert!(users.remove(1).is_none());
    }

    #[test]
    fn test_shutdown_cancels_user_tokens() {
        let (users, _, shutdown) = manager();
        users.init(&[config(1, 1000, 0, 0)]);
        shutdown.cancel();
        assert!(users.token(1).unwrap().is_cancelled());
    }

    #[test]
    fn test_check_user_traffic() {
        let (users, _, _) = manager();
        users.init(&[
            config(1, 1000, 100, 90),
            config(2, 2000, 0, 1 << 40),
            config(3, 3000, 100, 0),
        ]);
        users.get(1).unwrap().add_download(20);
        users.get(3).unwrap().add_upload(100);

        assert_eq!(users.check_user_traffic(), vec![1]);
        assert!(users.get(1).is_none());
        assert!(users.get(2).is_some());
        assert!(users.get(3).is_some());
    }

    #[test]
    fn test_sync_adds_updates_and_removes() {
        let (users, connections, _) = manager();
        users.init(&[config(1, 1000, 0, 0), config(2, 2000, 0, 0)]);
        let first = users.get(1).unwrap();
        let token_two = users.token(2).unwrap();
        let (_, conn_two) = connections.register(2, "127.0.0.1:9".parse().unwrap(), TransportKind::Tcp);

        let mut edited = config(1, 1000, 500, 0);
        edited.password = "rotated".to_string();
        let report = users.sync(&[edited, config(3, 3000, 0, 0)], |_| false);

        assert_eq!((report.added, report.updated, report.rebound, report.removed), (1, 1, 0, 1));
        let started: Vec<UserId> = report.started.iter().map(|u| u.id).collect();
        assert_eq!(started, vec![3]);

        // updated in place: same object, new credentials
        assert!(Arc::ptr_eq(&first, &users.get(1).unwrap()));
        assert_eq!(first.credentials().1, "rotated");
        assert_eq!(first.total_traffic(), 500);

        assert!(users.get(2).is_none());
        assert!(token_two.is_cancelled());
        assert!(conn_two.is_cancelled());
    }

    #[test]
    fn test_sync_unchanged_is_noop() {
        let (users, _, _) = manager();
        users.init(&[config(1, 1000, 0, 0)]);
        let token = users.token(1).unwrap();

        let report = users.sync(&[config(1, 1000, 0, 0)], |_| false);
        assert!(report.started.is_empty());
        assert_eq!((report.added, report.updated, report.rebound, report.removed), (0, 0, 0, 0));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_sync_port_change_rebinds() {
        let (users, _, _) = manager();
        users.init(&[config(1, 1000, 0, 0)]);
        let old_token = users.token(1).unwrap();
        users.get(1).unwrap().add_upload(7);

        let report = users.sync(&[config(1, 1001, 0, 0)], |_| false);
        assert_eq!(report.rebound, 1);
        assert_eq!(report.started[0].port, 1001);
        assert!(old_token.is_cancelled());
        assert!(!users.token(1).unwrap().is_cancelled());
        // traffic of the open window moves to the new user
        assert_eq!(users.get(1).unwrap().once_used_u(), 7);
    }

    #[test]
    fn test_sync_leaves_skipped_users_alone() {
        let (users, _, _) = manager();
        users.init(&[config(1, 1000, 0, 0)]);
        let token = users.token(1).unwrap();

        let report = users.sync(&[config(2, 2000, 0, 0)], |id| id == 1 || id == 2);
        assert!(report.started.is_empty());
        assert!(users.get(1).is_some());
        assert!(users.get(2).is_none());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_sync_keeps_over_quota_users_out_until_edited() {
        let (users, _, _) = manager();
        let exhausted = config(1, 1000, 100, 200);
        users.init(&[exhausted.clone()]);
        assert_eq!(users.check_user_traffic(), vec![1]);

        let report = users.sync(&[exhausted.clone()], |_| false);
        assert_eq!(report.added, 0);
        assert!(users.get(1).is_none());

        // quota raised by the operator
        let raised = config(1, 1000, 1000, 200);
        let report = users.sync(&[raised], |_| false);
        assert_eq!(report.added, 1);
        assert!(users.get(1).is_some());
    }
}
