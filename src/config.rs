//! Configuration module
//!
//! CLI arguments (each with an `X_PANDA_SS_*` environment variable) plus the
//! TOML users file.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::CipherRegistry;
use crate::error::{CryptoError, ServerError};

/// Parse duration string (e.g., "20s", "200ms", "5m") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '20s', '200ms', '5m' or plain seconds",
            s
        )
    })
}

/// CLI arguments for the shadowsocks server
///
/// Supports environment variables with X_PANDA_SS_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Shadowsocks server with per-user admission control")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Users file (.toml)
    #[arg(long, env = "X_PANDA_SS_CONFIG_FILE", default_value = "users.toml")]
    pub config_file: PathBuf,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "X_PANDA_SS_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Interval of the user traffic / jail cron (default: 60s)
    #[arg(long, env = "X_PANDA_SS_USER_CHECK_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub user_check_interval: Duration,

    /// Max concurrent TCP legs per user before admission is refused
    #[arg(long, env = "X_PANDA_SS_MAX_TCP_CONNECT", default_value_t = 300)]
    pub max_tcp_connect: u64,

    /// How long a jailed user stays refused (default: 300s)
    #[arg(long, env = "X_PANDA_SS_RELEASE_TIME", default_value = "300s", value_parser = parse_duration)]
    pub release_time: Duration,

    // ==================== Performance Tuning ====================
    /// Close connections idle for longer than this (default: 20s)
    #[arg(long, env = "X_PANDA_SS_IDLE_TIMEOUT", default_value = "20s", value_parser = parse_duration, help_heading = "Performance")]
    pub idle_timeout: Duration,

    /// Ceiling on outbound connection establishment, 0 for none (default: 5s)
    #[arg(long, env = "X_PANDA_SS_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Wait granularity for data arriving while the outbound leg connects
    #[arg(long, env = "X_PANDA_SS_CONNECT_POLL_INTERVAL", default_value = "200ms", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_poll_interval: Duration,

    /// Number of waits before data arriving during connect is dropped
    #[arg(long, env = "X_PANDA_SS_CONNECT_POLL_ATTEMPTS", default_value_t = 25, help_heading = "Performance")]
    pub connect_poll_attempts: u32,

    /// Evict datagram flows idle for longer than this (default: 60s)
    #[arg(long, env = "X_PANDA_SS_UDP_SESSION_TIMEOUT", default_value = "60s", value_parser = parse_duration, help_heading = "Performance")]
    pub udp_session_timeout: Duration,

    /// Read buffer size in bytes (default: 32KB)
    #[arg(long, env = "X_PANDA_SS_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// Queued chunks per transport before writes count as exhausted
    #[arg(long, env = "X_PANDA_SS_WRITE_QUEUE_CAPACITY", default_value_t = 256, help_heading = "Performance")]
    pub write_queue_capacity: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(long, env = "X_PANDA_SS_TCP_BACKLOG", default_value_t = 1024, help_heading = "Performance")]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY on both legs (default: true)
    #[arg(long, env = "X_PANDA_SS_TCP_NODELAY", default_value_t = true, help_heading = "Performance")]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!(
                "Users file not found: {}",
                self.config_file.display()
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(anyhow!("idle_timeout must be greater than 0"));
        }
        if self.user_check_interval.is_zero() {
            return Err(anyhow!("user_check_interval must be greater than 0"));
        }
        if self.connect_poll_interval.is_zero() || self.connect_poll_attempts == 0 {
            return Err(anyhow!(
                "connect_poll_interval and connect_poll_attempts must be greater than 0"
            ));
        }
        if self.udp_session_timeout.is_zero() {
            return Err(anyhow!("udp_session_timeout must be greater than 0"));
        }
        if self.buffer_size == 0 || self.write_queue_capacity == 0 {
            return Err(anyhow!(
                "buffer_size and write_queue_capacity must be greater than 0"
            ));
        }
        Ok(())
    }
}

/// Connection tuning shared by every handler
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Idle threshold for the supervisor
    pub idle_timeout: Duration,
    /// Supervisor tick
    pub idle_tick: Duration,
    /// Outbound establishment ceiling, zero for unbounded
    pub connect_timeout: Duration,
    pub connect_poll_interval: Duration,
    pub connect_poll_attempts: u32,
    pub udp_session_timeout: Duration,
    pub buffer_size: usize,
    pub write_queue_capacity: usize,
    pub tcp_backlog: i32,
    pub tcp_nodelay: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(20),
            idle_tick: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            connect_poll_interval: Duration::from_millis(200),
            connect_poll_attempts: 25,
            udp_session_timeout: Duration::from_secs(60),
            buffer_size: 32 * 1024,
            write_queue_capacity: 256,
            tcp_backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

impl ConnConfig {
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.idle_timeout,
            connect_timeout: cli.connect_timeout,
            connect_poll_interval: cli.connect_poll_interval,
            connect_poll_attempts: cli.connect_poll_attempts,
            udp_session_timeout: cli.udp_session_timeout,
            buffer_size: cli.buffer_size,
            write_queue_capacity: cli.write_queue_capacity,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            ..Self::default()
        }
    }

    /// Establishment ceiling, `None` when unbounded
    pub fn connect_deadline(&self) -> Option<Duration> {
        (!self.connect_timeout.is_zero()).then_some(self.connect_timeout)
    }
}

fn default_local_address() -> String {
    "0.0.0.0".to_string()
}

/// One `[[users]]` entry
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    pub user_id: i64,
    pub port: u16,
    pub method: String,
    pub password: String,
    /// Quota in bytes, 0 for unlimited
    #[serde(default)]
    pub total_traffic: u64,
    #[serde(default)]
    pub upload_traffic: u64,
    #[serde(default)]
    pub download_traffic: u64,
}

/// Users file
#[derive(Debug, Clone, Deserialize)]
pub struct UsersFile {
    #[serde(default = "default_local_address")]
    pub local_address: String,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl UsersFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading users file {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: UsersFile = toml::from_str(text).context("parsing users file")?;
        let mut ports = std::collections::HashSet::new();
        for user in &file.users {
            if !ports.insert(user.port) {
                return Err(anyhow!(
                    "port {} assigned to more than one user",
                    user.port
                ));
            }
        }
        Ok(file)
    }

    /// Reject users whose cipher is not registered or whose address is unusable
    pub fn check(&self, registry: &CipherRegistry) -> crate::error::Result<()> {
        if self.local_address.parse::<std::net::IpAddr>().is_err() {
            return Err(ServerError::Config(format!(
                "invalid local_address '{}'",
                self.local_address
            )));
        }
        for user in &self.users {
            if registry.family_of(&user.method).is_none() {
                return Err(CryptoError::UnsupportedCipher(user.method.clone()).into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = r#"
local_address = "127.0.0.1"

[[users]]
user_id = 1
port = 8388
method = "aes-256-cfb"
password = "secret"
total_traffic = 1073741824

[[users]]
user_id = 2
port = 8389
method = "none"
password = "plain"
"#;

    fn cli_with_users_file() -> (CliArgs, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.toml");
        std::fs::write(&path, USERS).unwrap();
        let cli = CliArgs::try_parse_from([
            "server-shadowsocks-r",
            "--config_file",
            path.to_str().unwrap(),
        ])
        .unwrap();
        (cli, dir)
    }

    #[test]
    fn test_cli_args_defaults() {
        let (cli, _dir) = cli_with_users_file();
        assert_eq!(cli.log_mode, "info");
        assert_eq!(cli.idle_timeout, Duration::from_secs(20));
        assert_eq!(cli.connect_poll_interval, Duration::from_millis(200));
        assert_eq!(cli.connect_poll_attempts, 25);
        assert_eq!(cli.max_tcp_connect, 300);
        assert_eq!(cli.release_time, Duration::from_secs(300));
        assert!(cli.tcp_nodelay);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_args_validate_missing_users_file() {
        let cli = CliArgs::try_parse_from([
            "server-shadowsocks-r",
            "--config_file",
            "/nonexistent/users.toml",
        ])
        .unwrap();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_zero_values() {
        let (mut cli, _dir) = cli_with_users_file();
        cli.connect_poll_attempts = 0;
        assert!(cli.validate().is_err());

        let (mut cli, _dir) = cli_with_users_file();
        cli.idle_timeout = Duration::ZERO;
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("20s").unwrap(), Duration::from_secs(20));
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_conn_config_from_cli() {
        let (mut cli, _dir) = cli_with_users_file();
        cli.connect_timeout = Duration::ZERO;
        let cfg = ConnConfig::from_cli(&cli);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(20));
        assert_eq!(cfg.idle_tick, Duration::from_secs(1));
        assert_eq!(cfg.connect_deadline(), None);
        assert_eq!(
            ConnConfig::default().connect_deadline(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_users_file_parse() {
        let file = UsersFile::parse(USERS).unwrap();
        assert_eq!(file.local_address, "127.0.0.1");
        assert_eq!(file.users.len(), 2);
        assert_eq!(file.users[0].total_traffic, 1 << 30);
        assert_eq!(file.users[1].method, "none");
        assert_eq!(file.users[1].total_traffic, 0);
    }

    #[test]
    fn test_users_file_defaults_and_duplicates() {
        let file = UsersFile::parse("").unwrap();
        assert_eq!(file.local_address, "0.0.0.0");
        assert!(file.users.is_empty());

        let dup = r#"
[[users]]
user_id = 1
port = 1000
method = "none"
password = "a"

[[users]]
user_id = 2
port = 1000
method = "none"
password = "b"
"#;
        assert!(UsersFile::parse(dup).is_err());
    }

    #[test]
    fn test_users_file_load() {
        let (cli, _dir) = cli_with_users_file();
        let file = UsersFile::load(&cli.config_file).unwrap();
        assert_eq!(file.users[0].user_id, 1);
        assert!(UsersFile::load(Path::new("/nonexistent.toml")).is_err());
    }

    #[test]
    fn test_users_file_check() {
        let registry = CipherRegistry::global();
        assert!(UsersFile::parse(USERS).unwrap().check(registry).is_ok());

        let mut file = UsersFile::parse(USERS).unwrap();
        file.users[1].method = "rc4-md5".to_string();
        assert!(matches!(
            file.check(registry),
            Err(ServerError::Cipher(CryptoError::UnsupportedCipher(_)))
        ));

        let mut file = UsersFile::parse(USERS).unwrap();
        file.local_address = "localhost".to_string();
        assert!(matches!(file.check(registry), Err(ServerError::Config(_))));
    }
}
