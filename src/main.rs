// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use shadowsocks_rs::business::{BackgroundTasks, ServerPool, TaskConfig, UserManager};
use shadowsocks_rs::config::{CliArgs, ConnConfig, UsersFile};
use shadowsocks_rs::core::{ConnectionManager, Server};
use shadowsocks_rs::logger::{self, log, LogLevel};
use shadowsocks_rs::{crypto, server_runner};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();
    cli.validate()?;

    let level: LogLevel = cli.log_mode.parse().map_err(|e: String| anyhow!(e))?;
    logger::init_logger(level);

    log::info!(
        config_file = %cli.config_file.display(),
        "Starting shadowsocks server"
    );

    let registry = crypto::init();
    let users_file = UsersFile::load(&cli.config_file)?;
    users_file.check(registry)?;

    let shutdown = CancellationToken::new();

    // Shared between the core handlers and the business layer
    let conn_manager = ConnectionManager::new();

    let user_manager = Arc::new(UserManager::new(conn_manager.clone(), shutdown.clone()));
    user_manager.init(&users_file.users);

    let pool = Arc::new(ServerPool::new(
        cli.max_tcp_connect,
        cli.release_time,
        conn_manager.clone(),
    ));

    let server = Arc::new(
        Server::builder()
            .admission(pool.clone())
            .conn_manager(conn_manager)
            .conn_config(ConnConfig::from_cli(&cli))
            .build(),
    );

    let launcher = Arc::new(server_runner::ServiceLauncher::new(
        users_file.local_address.clone(),
        server,
    ));

    let tasks = BackgroundTasks::new(
        TaskConfig::new(cli.user_check_interval),
        Arc::clone(&user_manager),
        pool,
    )
    .with_user_sync(cli.config_file.clone(), launcher.clone())
    .start();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => signal_token.cancel(),
            Err(e) => log::error!(error = %e, "Failed to listen for shutdown signals"),
        }
    });

    let result = server_runner::run_server(&user_manager, &launcher, shutdown).await;
    tasks.shutdown().await;
    result
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => log::info!("SIGINT received, shutting down..."),
            _ = sigterm.recv() => log::info!("SIGTERM received, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}
