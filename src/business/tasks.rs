//! Periodic user maintenance

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::pool::ServerPool;
use super::users::{SyncReport, UserManager};
use crate::config::UsersFile;
use crate::core::User;
use crate::crypto::CipherRegistry;
use crate::logger::log;

/// Starts serving a user added while the server runs
#[async_trait]
pub trait UserLauncher: Send + Sync {
    /// Bind the user's port and serve it until `token` is cancelled
    async fn launch(&self, user: Arc<User>, token: CancellationToken) -> anyhow::Result<()>;
}

/// Reload source for the user store
struct UserSync {
    users_file: PathBuf,
    launcher: Arc<dyn UserLauncher>,
}

/// Format bytes into human-readable string (KB, MB, GB)
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Period of the user check
    pub user_check_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            user_check_interval: Duration::from_secs(60),
        }
    }
}

impl TaskConfig {
    pub fn new(user_check_interval: Duration) -> Self {
        Self {
            user_check_interval,
        }
    }
}

pub struct BackgroundTasks {
    config: TaskConfig,
    users: Arc<UserManager>,
    pool: Arc<ServerPool>,
    sync: Option<Arc<UserSync>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle for spawned background tasks
pub struct BackgroundTasksHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasksHandle {
    /// Stop all background tasks and wait for them to complete
    pub async fn shutdown(self) {
        log::info!("Stopping background tasks...");
        let _ = self.shutdown_tx.send(true);

        for (i, handle) in self.handles.into_iter().enumerate() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => log::debug!(task = i, "Background task stopped"),
                Ok(Err(e)) => log::warn!(task = i, error = %e, "Background task panicked"),
                Err(_) => log::warn!(task = i, "Background task shutdown timeout"),
            }
        }
        log::info!("Background tasks stopped");
    }
}

impl BackgroundTasks {
    pub fn new(config: TaskConfig, users: Arc<UserManager>, pool: Arc<ServerPool>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            users,
            pool,
            sync: None,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Re-read `users_file` on every user check and apply the changes,
    /// handing new and moved users to `launcher`
    pub fn with_user_sync(
        mut self,
        users_file: impl Into<PathBuf>,
        launcher: Arc<dyn UserLauncher>,
    ) -> Self {
        self.sync = Some(Arc::new(UserSync {
            users_file: users_file.into(),
            launcher,
        }));
        self
    }

    /// Start all background tasks and return a handle for shutdown
    pub fn start(self) -> BackgroundTasksHandle {
        let handles = vec![self.start_user_check_task()];
        log::info!("Background tasks started");

        BackgroundTasksHandle {
            shutdown_tx: self.shutdown_tx,
            handles,
        }
    }

    fn start_user_check_task(&self) -> JoinHandle<()> {
        let users = Arc::clone(&self.users);
        let pool = Arc::clone(&self.pool);
        let sync = self.sync.clone();
        let period = self.config.user_check_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        user_check_once(&users, &pool);
                        if let Some(sync) = &sync {
                            if let Err(e) = sync_users_once(sync, &users, &pool).await {
                                log::warn!(error = %e, "User sync failed, keeping current users");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        log::debug!("User check task shutting down");
                        roll_traffic(&users);
                        break;
                    }
                }
            }
        })
    }
}

/// Close every user's traffic window and log the totals
fn roll_traffic(users: &UserManager) -> (u64, u64) {
    let mut active = 0;
    let mut total_upload = 0;
    let mut total_download = 0;

    for user in users.list() {
        let (u, d) = user.take_window();
        if u == 0 && d == 0 {
            continue;
        }
        active += 1;
        total_upload += u;
        total_download += d;
        log::debug!(
            user_id = user.id,
            upload = %format_bytes(u),
            download = %format_bytes(d),
            "User traffic"
        );
    }

    if active > 0 {
        log::info!(
            users = active,
            upload = %format_bytes(total_upload),
            download = %format_bytes(total_download),
            "Traffic window closed"
        );
    }
    (total_upload, total_download)
}

/// One maintenance pass: roll traffic, release the jail, enforce quotas
fn user_check_once(users: &UserManager, pool: &ServerPool) {
    roll_traffic(users);
    pool.release_expired();
    let removed = users.check_user_traffic();
    if !removed.is_empty() {
        log::info!(removed = removed.len(), remaining = users.user_count(), "Users checked");
    }
}

/// Reload the users file and serve what it adds or moves.
///
/// Jailed users are left as they are until released.
async fn sync_users_once(
    sync: &UserSync,
    users: &UserManager,
    pool: &ServerPool,
) -> anyhow::Result<SyncReport> {
    let file = UsersFile::load(&sync.users_file)?;
    file.check(CipherRegistry::global())?;

    let report = users.sync(&file.users, |id| pool.is_jailed(id));
    for user in &report.started {
        let Some(token) = users.token(user.id) else {
            continue;
        };
        if let Err(e) = sync.launcher.launch(Arc::clone(user), token).await {
            log::error!(user_id = user.id, port = user.port, error = %e, "Failed to serve user");
            // dropped so the next pass retries it as a new entry
            users.remove(user.id);
        }
    }

    if report.added + report.updated + report.rebound + report.removed > 0 {
        log::info!(
            added = report.added,
            updated = report.updated,
            rebound = report.rebound,
            removed = report.removed,
            "Users synchronized"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::core::hooks::AdmissionControl;
    use crate::core::{ConnectionManager, UserId};
    use std::io::{Seek, Write};
    use std::sync::Mutex;

    fn setup(quota: u64) -> (Arc<UserManager>, Arc<ServerPool>) {
        let connections = ConnectionManager::new();
        let users = Arc::new(UserManager::new(connections.clone(), CancellationToken::new()));
        users.init(&[UserConfig {
            user_id: 1,
            port: 1000,
            method: "none".to_string(),
            password: "pw".to_string(),
            total_traffic: quota,
            upload_traffic: 0,
            download_traffic: 0,
        }]);
        let pool = Arc::new(ServerPool::new(300, Duration::from_secs(300), connections));
        (users, pool)
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00GB");
    }

    #[test]
    fn test_task_config_default() {
        assert_eq!(
            TaskConfig::default().user_check_interval,
            Duration::from_secs(60)
        );
        assert_eq!(
            TaskConfig::new(Duration::from_secs(5)).user_check_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_roll_traffic_resets_window() {
        let (users, _) = setup(0);
        let user = users.get(1).unwrap();
        user.add_upload(10);
        user.add_download(20);

        assert_eq!(roll_traffic(&users), (10, 20));
        assert_eq!(user.once_used_u(), 0);
        assert_eq!(user.once_used_d(), 0);
        assert_eq!(user.used_traffic(), 30);
        assert_eq!(roll_traffic(&users), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_check_once_releases_and_enforces() {
        let (users, pool) = setup(100);
        pool.add_user_to_jail(9);
        users.get(1).unwrap().add_download(101);

        tokio::time::advance(Duration::from_secs(301)).await;
        user_check_once(&users, &pool);

        assert!(!pool.is_jailed(9));
        assert!(users.get(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_on_interval_and_stops() {
        let (users, pool) = setup(100);
        let tasks = BackgroundTasks::new(
            TaskConfig::new(Duration::from_secs(10)),
            Arc::clone(&users),
            pool,
        );
        let handle = tasks.start();

        users.get(1).unwrap().add_upload(500);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(users.get(1).is_none());

        handle.shutdown().await;
    }

    /// Records launches; fails for the ports in `busy`
    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<(UserId, u16)>>,
        busy: Vec<u16>,
    }

    #[async_trait]
    impl UserLauncher for RecordingLauncher {
        async fn launch(&self, user: Arc<User>, _token: CancellationToken) -> anyhow::Result<()> {
            if self.busy.contains(&user.port) {
                anyhow::bail!("port {} in use", user.port);
            }
            self.launched.lock().unwrap().push((user.id, user.port));
            Ok(())
        }
    }

    fn write_users(file: &mut tempfile::NamedTempFile, entries: &[(UserId, u16, &str)]) {
        let mut text = String::from("local_address = \"127.0.0.1\"\n");
        for (id, port, password) in entries {
            text.push_str(&format!(
                "[[users]]\nuser_id = {id}\nport = {port}\nmethod = \"none\"\npassword = \"{password}\"\n"
            ));
        }
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        f.rewind().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    fn user_sync(file: &tempfile::NamedTempFile, launcher: Arc<RecordingLauncher>) -> UserSync {
        UserSync {
            users_file: file.path().to_path_buf(),
            launcher,
        }
    }

    #[tokio::test]
    async fn test_sync_users_once_applies_file() {
        let (users, pool) = setup(0);
        let launcher = Arc::new(RecordingLauncher::default());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_users(&mut file, &[(1, 1000, "rotated"), (2, 2000, "pw")]);
        let sync = user_sync(&file, Arc::clone(&launcher));

        let report = sync_users_once(&sync, &users, &pool).await.unwrap();
        assert_eq!((report.added, report.updated), (1, 1));
        assert_eq!(*launcher.launched.lock().unwrap(), vec![(2, 2000)]);
        assert_eq!(users.get(1).unwrap().credentials().1, "rotated");

        // port change rebinds, missing entry is removed
        write_users(&mut file, &[(2, 2001, "pw")]);
        let report = sync_users_once(&sync, &users, &pool).await.unwrap();
        assert_eq!((report.rebound, report.removed), (1, 1));
        assert_eq!(launcher.launched.lock().unwrap().last(), Some(&(2, 2001)));
        assert!(users.get(1).is_none());
    }

    #[tokio::test]
    async fn test_sync_users_once_skips_jailed() {
        let (users, pool) = setup(0);
        pool.add_user_to_jail(1);
        let launcher = Arc::new(RecordingLauncher::default());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_users(&mut file, &[(3, 3000, "pw")]);
        let sync = user_sync(&file, launcher);

        let report = sync_users_once(&sync, &users, &pool).await.unwrap();
        assert_eq!((report.added, report.removed), (1, 0));
        assert!(users.get(1).is_some());
    }

    #[tokio::test]
    async fn test_sync_users_once_retries_failed_launch() {
        let (users, pool) = setup(0);
        let launcher = Arc::new(RecordingLauncher {
            busy: vec![2000],
            ..Default::default()
        });
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_users(&mut file, &[(1, 1000, "pw"), (2, 2000, "pw")]);
        let sync = user_sync(&file, launcher);

        let report = sync_users_once(&sync, &users, &pool).await.unwrap();
        assert_eq!(report.added, 1);
        assert!(users.get(2).is_none());

        let report = sync_users_once(&sync, &users, &pool).await.unwrap();
        assert_eq!(report.added, 1);
    }

    #[tokio::test]
    async fn test_sync_users_once_rejects_bad_file() {
        let (users, pool) = setup(0);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[[users]]\nuser_id = 5\nport = 5000\nmethod = \"rc4-md5\"\npassword = \"pw\"\n")
            .unwrap();
        let sync = user_sync(&file, Arc::new(RecordingLauncher::default()));

        assert!(sync_users_once(&sync, &users, &pool).await.is_err());
        assert!(users.get(1).is_some());
        assert!(users.get(5).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_syncs_users_file() {
        let (users, pool) = setup(0);
        let launcher = Arc::new(RecordingLauncher::default());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_users(&mut file, &[(1, 1000, "pw"), (4, 4000, "pw")]);

        let handle = BackgroundTasks::new(
            TaskConfig::new(Duration::from_secs(10)),
            Arc::clone(&users),
            pool,
        )
        .with_user_sync(file.path(), launcher.clone())
        .start();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(users.get(4).is_some());
        assert_eq!(*launcher.launched.lock().unwrap(), vec![(4, 4000)]);

        handle.shutdown().await;
    }
}
