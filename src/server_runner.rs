//! Per-user listeners and accept loops
//!
//! Every user is served on its own port, TCP and UDP alike. TCP accepts
//! get one [`ConnectionHandler`] per connection; UDP keeps one handler per
//! client address until the flow goes quiet.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::business::{UserLauncher, UserManager};
use crate::config::ConnConfig;
use crate::core::{ConnectionHandler, ConnectionId, Server, User, UserId};
use crate::logger::log;
use crate::transport::{DatagramTransport, TcpTransport, TransportKind, UdpTransport};

/// TCP keepalive interval. Dead peers are detected in ~45s (3 probes x 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// TCP listener and UDP socket bound to the same port
pub struct UserListeners {
    pub tcp: TcpListener,
    pub udp: Arc<UdpSocket>,
}

impl UserListeners {
    /// Bind both protocols on `local_address:port`.
    ///
    /// Port 0 picks a free TCP port and binds UDP to the same number.
    pub async fn bind(local_address: &str, port: u16, cfg: &ConnConfig) -> Result<Self> {
        let ip: IpAddr = local_address
            .parse()
            .with_context(|| format!("invalid local address '{}'", local_address))?;
        let socket_addr = SocketAddr::new(ip, port);

        let socket = socket2::Socket::new(
            match socket_addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        // Allow immediate rebind after restart (skip TIME_WAIT)
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(cfg.tcp_backlog)?;
        let tcp = TcpListener::from_std(socket.into())?;

        let bound = tcp.local_addr()?;
        let udp = UdpSocket::bind(bound)
            .await
            .with_context(|| format!("binding UDP on {}", bound))?;

        Ok(Self {
            tcp,
            udp: Arc::new(udp),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }
}

/// Running accept loops of one user
pub struct UserService {
    pub user_id: UserId,
    pub local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl UserService {
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Wait for both loops to finish
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                log::warn!(user_id = self.user_id, error = %e, "Listener task panicked");
            }
        }
    }
}

/// Bind the user's port and start serving it until `cancel` fires
pub async fn serve_user(
    user: Arc<User>,
    local_address: &str,
    server: Arc<Server>,
    cancel: CancellationToken,
) -> Result<UserService> {
    let listeners = UserListeners::bind(local_address, user.port, &server.conn_config).await?;
    let local_addr = listeners.local_addr()?;
    let user_id = user.id;

    let tasks = vec![
        tokio::spawn(serve_tcp(
            listeners.tcp,
            Arc::clone(&user),
            Arc::clone(&server),
            cancel.clone(),
        )),
        tokio::spawn(serve_udp(listeners.udp, user, server, cancel)),
    ];

    Ok(UserService {
        user_id,
        local_addr,
        tasks,
    })
}

/// Serves users on one local address and keeps their services for shutdown
pub struct ServiceLauncher {
    local_address: String,
    server: Arc<Server>,
    services: Mutex<Vec<UserService>>,
}

impl ServiceLauncher {
    pub fn new(local_address: impl Into<String>, server: Arc<Server>) -> Self {
        Self {
            local_address: local_address.into(),
            server,
            services: Mutex::new(Vec::new()),
        }
    }

    /// Services whose loops are still running
    pub async fn running(&self) -> usize {
        self.services
            .lock()
            .await
            .iter()
            .filter(|s| !s.is_finished())
            .count()
    }

    /// Wait for every launched service to stop
    pub async fn join_all(&self) {
        let services = std::mem::take(&mut *self.services.lock().await);
        for service in services {
            service.join().await;
        }
    }
}

#[async_trait]
impl UserLauncher for ServiceLauncher {
    async fn launch(&self, user: Arc<User>, token: CancellationToken) -> Result<()> {
        let (user_id, method) = (user.id, user.method());
        let service = serve_user(user, &self.local_address, Arc::clone(&self.server), token).await?;
        log::info!(
            user_id = user_id,
            address = %service.local_addr,
            method = %method,
            "User listening"
        );

        let mut services = self.services.lock().await;
        // services of removed or moved users have already stopped
        services.retain(|s| !s.is_finished());
        services.push(service);
        Ok(())
    }
}

/// Serve every user in the store until `shutdown` is cancelled
pub async fn run_server(
    users: &UserManager,
    launcher: &ServiceLauncher,
    shutdown: CancellationToken,
) -> Result<()> {
    let initial = users.list();
    let mut serving = 0;
    for user in &initial {
        let Some(token) = users.token(user.id) else {
            continue;
        };
        match launcher.launch(Arc::clone(user), token).await {
            Ok(()) => serving += 1,
            Err(e) => {
                log::error!(user_id = user.id, port = user.port, error = %e, "Failed to serve user");
                // a users-file sync picks it up again as a new entry
                users.remove(user.id);
            }
        }
    }

    if serving == 0 && !initial.is_empty() {
        return Err(anyhow!("no user port could be bound"));
    }
    log::info!(users = serving, address = %launcher.local_address, "Server started");

    shutdown.cancelled().await;
    launcher.join_all().await;
    log::info!("Server stopped");
    Ok(())
}

async fn serve_tcp(
    listener: TcpListener,
    user: Arc<User>,
    server: Arc<Server>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_tcp(stream, peer, Arc::clone(&user), Arc::clone(&server)));
                }
                Err(e) => {
                    log::error!(user_id = user.id, error = %e, "Failed to accept connection");
                    // Continue accepting unless it's a fatal error
                    if e.kind() == io::ErrorKind::Other {
                        break;
                    }
                }
            }
        }
    }
    log::debug!(user_id = user.id, port = user.port, "TCP listener stopped");
}

async fn handle_tcp(stream: TcpStream, peer: SocketAddr, user: Arc<User>, server: Arc<Server>) {
    let peer_str = peer.to_string();
    log::connection(&peer_str, "new");

    let conn_manager = server.conn_manager.clone();
    let (conn_id, cancel) = conn_manager.register(user.id, peer, TransportKind::Tcp);
    let _unregister = scopeguard::guard(conn_id, move |id| conn_manager.unregister(id));

    let cfg = server.conn_config;
    if cfg.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

    let (mut reader, writer) = stream.into_split();
    let transport = TcpTransport::spawn(writer, Some(peer), cancel.clone(), cfg.write_queue_capacity);
    let handler = ConnectionHandler::new(user, server);
    handler.on_tcp_established(transport);

    let mut buf = vec![0u8; cfg.buffer_size.max(1)];
    let mut lost = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    handler.on_eof();
                    break;
                }
                Ok(n) => handler.on_data_received(&buf[..n]),
                Err(e) => {
                    lost = Some(e);
                    break;
                }
            }
        }
    }

    handler.close();
    handler.on_connection_lost(lost.as_ref());
    log::connection(&peer_str, "closed");
}

/// One client address on a user's UDP port
struct Flow {
    handler: Arc<ConnectionHandler>,
    conn_id: ConnectionId,
    cancel: CancellationToken,
    last_seen: Instant,
}

impl Flow {
    fn is_stale(&self, session_timeout: Duration) -> bool {
        self.cancel.is_cancelled() || self.last_seen.elapsed() > session_timeout
    }
}

fn retire(server: &Server, peer: SocketAddr, flow: Flow) {
    flow.handler.close();
    flow.handler.on_connection_lost(None);
    server.conn_manager.unregister(flow.conn_id);
    log::connection(&peer.to_string(), "udp flow closed");
}

async fn serve_udp(
    socket: Arc<UdpSocket>,
    user: Arc<User>,
    server: Arc<Server>,
    cancel: CancellationToken,
) {
    let cfg = server.conn_config;
    let transport: Arc<dyn DatagramTransport> = Arc::new(UdpTransport::new(Arc::clone(&socket)));
    let mut flows: HashMap<SocketAddr, Flow> = HashMap::new();
    let mut buf = vec![0u8; cfg.buffer_size.max(1)];

    let mut sweep = interval(cfg.udp_session_timeout);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let stale: Vec<SocketAddr> = flows
                    .iter()
                    .filter(|(_, flow)| flow.is_stale(cfg.udp_session_timeout))
                    .map(|(peer, _)| *peer)
                    .collect();
                for peer in stale {
                    if let Some(flow) = flows.remove(&peer) {
                        retire(&server, peer, flow);
                    }
                }
            }
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, peer)) => {
                    // kicked flows are replaced on the next datagram
                    let replace = flows
                        .get(&peer)
                        .is_some_and(|flow| flow.cancel.is_cancelled());
                    if replace {
                        if let Some(flow) = flows.remove(&peer) {
                            retire(&server, peer, flow);
                        }
                    }

                    let flow = flows.entry(peer).or_insert_with(|| {
                        log::connection(&peer.to_string(), "udp flow");
                        let (conn_id, flow_cancel) =
                            server.conn_manager.register(user.id, peer, TransportKind::Udp);
                        let handler = ConnectionHandler::new(Arc::clone(&user), Arc::clone(&server));
                        handler.on_udp_established(Arc::clone(&transport), peer);
                        Flow {
                            handler,
                            conn_id,
                            cancel: flow_cancel,
                            last_seen: Instant::now(),
                        }
                    });
                    flow.last_seen = Instant::now();
                    flow.handler.on_data_received(&buf[..n]);
                }
                Err(e) => {
                    log::debug!(user_id = user.id, error = %e, "UDP receive failed");
                }
            }
        }
    }

    for (peer, flow) in flows.drain() {
        retire(&server, peer, flow);
    }
    log::debug!(user_id = user.id, port = user.port, "UDP listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::AdmissionControl;

    struct OpenDoor;

    impl AdmissionControl for OpenDoor {
        fn filter_user(&self, _user: &User) -> bool {
            true
        }
        fn add_user_to_jail(&self, _user_id: UserId) {}
    }

    fn server() -> Arc<Server> {
        Arc::new(Server::builder().admission(Arc::new(OpenDoor)).build())
    }

    #[test]
    fn test_tcp_keepalive_interval() {
        let detection_time = TCP_KEEPALIVE_SECS * 3;
        assert!(detection_time <= 60, "keepalive detection should be under 60s");
    }

    #[tokio::test]
    async fn test_bind_same_port_both_protocols() {
        let listeners = UserListeners::bind("127.0.0.1", 0, &ConnConfig::default())
            .await
            .unwrap();
        let tcp = listeners.local_addr().unwrap();
        let udp = listeners.udp.local_addr().unwrap();
        assert_ne!(tcp.port(), 0);
        assert_eq!(tcp.port(), udp.port());
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let err = UserListeners::bind("not-an-ip", 0, &ConnConfig::default()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connection_registered_and_released() {
        let server = server();
        let cancel = CancellationToken::new();
        let user = Arc::new(User::new(1, 0, "none", "pw"));
        let service = serve_user(user, "127.0.0.1", Arc::clone(&server), cancel.clone())
            .await
            .unwrap();

        let client = TcpStream::connect(service.local_addr).await.unwrap();
        for _ in 0..50 {
            if server.conn_manager.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.conn_manager.user_connections(1), 1);

        drop(client);
        for _ in 0..50 {
            if server.conn_manager.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.conn_manager.connection_count(), 0);

        cancel.cancel();
        service.join().await;
    }

    #[tokio::test]
    async fn test_kick_closes_tcp_connection() {
        let server = server();
        let cancel = CancellationToken::new();
        let user = Arc::new(User::new(5, 0, "none", "pw"));
        let service = serve_user(user, "127.0.0.1", Arc::clone(&server), cancel.clone())
            .await
            .unwrap();

        let mut client = TcpStream::connect(service.local_addr).await.unwrap();
        for _ in 0..50 {
            if server.conn_manager.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.conn_manager.kick_user(5), 1);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        cancel.cancel();
        service.join().await;
    }

    #[tokio::test]
    async fn test_launcher_prunes_stopped_services() {
        let launcher = ServiceLauncher::new("127.0.0.1", server());
        let first = CancellationToken::new();
        launcher
            .launch(Arc::new(User::new(1, 0, "none", "pw")), first.clone())
            .await
            .unwrap();
        assert_eq!(launcher.running().await, 1);

        first.cancel();
        for _ in 0..50 {
            if launcher.running().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(launcher.running().await, 0);

        let second = CancellationToken::new();
        launcher
            .launch(Arc::new(User::new(2, 0, "none", "pw")), second.clone())
            .await
            .unwrap();
        assert_eq!(launcher.services.lock().await.len(), 1);

        second.cancel();
        launcher.join_all().await;
        assert_eq!(launcher.running().await, 0);
    }

    #[tokio::test]
    async fn test_run_server_fails_when_nothing_binds() {
        let users = UserManager::new(crate::core::ConnectionManager::new(), CancellationToken::new());
        users.init(&[crate::config::UserConfig {
            user_id: 1,
            port: 0,
            method: "none".to_string(),
            password: "pw".to_string(),
            total_traffic: 0,
            upload_traffic: 0,
            download_traffic: 0,
        }]);
        let launcher = ServiceLauncher::new("not-an-ip", server());

        let result = run_server(&users, &launcher, CancellationToken::new()).await;
        assert!(result.is_err());
        // left for the next users-file sync
        assert!(users.get(1).is_none());
    }
}
