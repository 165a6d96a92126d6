//! Per-connection protocol state machine
//!
//! One [`ConnectionHandler`] is bound to one client stream or one datagram
//! flow. The transport layer feeds it lifecycle events; it decrypts inbound
//! data, parses the addressing header, drives establishment of the outbound
//! leg and relays bytes once streaming.
//!
//! Every public callback delegates to a `try_*` function returning
//! [`HandlerError`]; failures are contained at the callback boundary and
//! reported to the server's [`ExceptionSentinel`](super::hooks::ExceptionSentinel).
//!
//! Only outbound establishment and the connect wait suspend. They run as
//! spawned tasks; everything else completes synchronously in the caller.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

use super::hooks::{OutboundError, OutboundPeer, OutboundRequest};
use super::protocol::{parse_header, Address};
use super::server::Server;
use super::timeout::{self, IdleClose, IdleTimer};
use super::user::User;
use crate::crypto::Cryptor;
use crate::error::HandlerError;
use crate::logger::log;
use crate::transport::{DatagramTransport, StreamTransport, TransportError, TransportKind};

/// Protocol stage of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Awaiting the addressing header
    Init,
    /// Outbound leg establishing
    Connect,
    /// Relaying
    Stream,
    /// Released
    Destroy,
    /// Failed, closes on next event
    Error,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Init => "INIT",
            Stage::Connect => "CONNECT",
            Stage::Stream => "STREAM",
            Stage::Destroy => "DESTROY",
            Stage::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
enum ClientTransport {
    Stream(Arc<dyn StreamTransport>),
    Datagram {
        socket: Arc<dyn DatagramTransport>,
        peer: SocketAddr,
    },
}

#[derive(Default)]
struct Inner {
    kind: Option<TransportKind>,
    transport: Option<ClientTransport>,
    cryptor: Option<Cryptor>,
    remote: Option<Arc<dyn OutboundPeer>>,
    peer_addr: Option<SocketAddr>,
}

pub struct ConnectionHandler {
    user: Arc<User>,
    server: Arc<Server>,
    stage: watch::Sender<Stage>,
    inner: Mutex<Inner>,
    /// Set while this connection holds one unit of `user.tcp_count`
    counted: AtomicBool,
    timer: IdleTimer,
    me: Weak<ConnectionHandler>,
}

impl ConnectionHandler {
    pub fn new(user: Arc<User>, server: Arc<Server>) -> Arc<Self> {
        let cfg = server.conn_config;
        let (stage, _) = watch::channel(Stage::Destroy);
        Arc::new_cyclic(|me| Self {
            user,
            server,
            stage,
            inner: Mutex::new(Inner::default()),
            counted: AtomicBool::new(false),
            timer: IdleTimer::new(cfg.idle_timeout, cfg.idle_tick),
            me: me.clone(),
        })
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn stage(&self) -> Stage {
        *self.stage.borrow()
    }

    pub fn kind(&self) -> Option<TransportKind> {
        self.inner().kind
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner().peer_addr
    }

    pub fn has_remote(&self) -> bool {
        self.inner().remote.is_some()
    }

    /// True once the client transport has been released
    pub fn is_closed(&self) -> bool {
        self.inner().transport.is_none()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_stage(&self, to: Stage) {
        let from = self.stage.send_replace(to);
        log::stage(self.user.id, from, to);
    }

    fn contain(&self, op: &'static str, err: HandlerError) {
        log::debug!(user_id = self.user.id, op = op, "Containing callback failure");
        self.server.sentinel.capture(op, &err);
    }

    // ==================== Lifecycle callbacks ====================

    pub fn on_tcp_established(&self, transport: Arc<dyn StreamTransport>) {
        if let Err(e) = self.try_on_tcp_established(transport) {
            self.contain("on_tcp_established", e);
        }
    }

    fn try_on_tcp_established(&self, transport: Arc<dyn StreamTransport>) -> Result<(), HandlerError> {
        if !self.server.admission.filter_user(&self.user) {
            log::debug!(user_id = self.user.id, "User not admitted, refusing connection");
            transport.close();
            return Ok(());
        }

        {
            let mut inner = self.inner();
            inner.kind = Some(TransportKind::Tcp);
            inner.peer_addr = transport.peer_addr();
            inner.transport = Some(ClientTransport::Stream(transport));
        }
        if let Some(me) = self.me.upgrade() {
            timeout::open_supervision(&me);
        }

        let (method, password) = self.user.credentials();
        match Cryptor::new(&method, &password, TransportKind::Tcp) {
            Ok(cryptor) => {
                self.inner().cryptor = Some(cryptor);
                self.set_stage(Stage::Init);
                log::debug!(user_id = self.user.id, "TCP connection made");
            }
            Err(e) => {
                log::warn!(user_id = self.user.id, error = %e, "Cipher not supported, closing");
                self.close();
            }
        }
        Ok(())
    }

    pub fn on_udp_established(&self, socket: Arc<dyn DatagramTransport>, peer: SocketAddr) {
        if let Err(e) = self.try_on_udp_established(socket, peer) {
            self.contain("on_udp_established", e);
        }
    }

    fn try_on_udp_established(
        &self,
        socket: Arc<dyn DatagramTransport>,
        peer: SocketAddr,
    ) -> Result<(), HandlerError> {
        {
            let mut inner = self.inner();
            inner.kind = Some(TransportKind::Udp);
            inner.peer_addr = Some(peer);
            inner.transport = Some(ClientTransport::Datagram { socket, peer });
        }

        let (method, password) = self.user.credentials();
        match Cryptor::new(&method, &password, TransportKind::Udp) {
            Ok(cryptor) => {
                self.inner().cryptor = Some(cryptor);
                self.set_stage(Stage::Init);
                log::debug!(user_id = self.user.id, peer = %peer, "UDP flow made");
            }
            Err(e) => {
                log::warn!(user_id = self.user.id, error = %e, "Cipher not supported, closing");
                self.close();
            }
        }
        Ok(())
    }

    pub fn on_data_received(&self, data: &[u8]) {
        if let Err(e) = self.try_on_data_received(data) {
            self.contain("on_data_received", e);
        }
    }

    fn try_on_data_received(&self, data: &[u8]) -> Result<(), HandlerError> {
        if self.stage() == Stage::Destroy {
            return Ok(());
        }

        let decrypted = {
            let mut inner = self.inner();
            let Some(cryptor) = inner.cryptor.as_mut() else {
                return Ok(());
            };
            cryptor.decrypt(data)
        };
        let plain = match decrypted {
            Ok(plain) => plain,
            Err(e) => {
                log::warn!(user_id = self.user.id, error = %e, "Decrypt failed, closing");
                self.close();
                return Ok(());
            }
        };
        self.user.add_upload(plain.len() as u64);

        match self.stage() {
            Stage::Init => self.handle_init(plain),
            Stage::Connect => {
                self.spawn_handle_connect(plain);
                Ok(())
            }
            Stage::Stream => self.handle_stream(plain),
            Stage::Error => {
                self.close();
                Ok(())
            }
            Stage::Destroy => Ok(()),
        }
    }

    pub fn on_eof(&self) {
        log::trace!(user_id = self.user.id, "EOF received");
        self.close();
    }

    pub fn on_connection_lost(&self, reason: Option<&io::Error>) {
        if let Some(reason) = reason {
            log::debug!(user_id = self.user.id, error = %reason, "Connection lost");
        }
        let remote = self.inner().remote.take();
        if let Some(remote) = remote {
            remote.close();
        }
    }

    /// Deliver response bytes to the client.
    ///
    /// `data` is plaintext; it is encrypted with this connection's binding.
    pub fn write(&self, data: Bytes) {
        if let Err(e) = self.try_write(data) {
            self.contain("write", e);
        }
    }

    fn try_write(&self, data: Bytes) -> Result<(), HandlerError> {
        if !self.server.admission.filter_user(&self.user) {
            log::debug!(user_id = self.user.id, "User no longer admitted, closing");
            self.close();
            return Ok(());
        }

        let len = data.len() as u64;
        // encrypt and enqueue under one lock so keystream order is write order
        let (kind, outcome) = {
            let mut inner = self.inner();
            let Inner {
                kind,
                transport,
                cryptor,
                ..
            } = &mut *inner;
            let (Some(kind), Some(transport), Some(cryptor)) =
                (*kind, transport.as_ref(), cryptor.as_mut())
            else {
                return Ok(());
            };
            let ciphertext = cryptor.encrypt(&data);
            let outcome = match transport {
                ClientTransport::Stream(t) => t.write(ciphertext),
                ClientTransport::Datagram { socket, peer } => {
                    socket.send_to(&ciphertext, *peer).map(|_| ())
                }
            };
            (kind, outcome)
        };

        match (kind, outcome) {
            (_, Ok(())) => {
                self.user.add_download(len);
                self.timer.mark_active();
                Ok(())
            }
            (TransportKind::Tcp, Err(TransportError::Exhausted)) => {
                log::warn!(user_id = self.user.id, "Client write queue exhausted, jailing user");
                self.server.admission.add_user_to_jail(self.user.id);
                self.close();
                Ok(())
            }
            (TransportKind::Udp, Err(TransportError::Exhausted)) => {
                log::debug!(user_id = self.user.id, "UDP send buffer full, datagram dropped");
                Ok(())
            }
            (_, Err(TransportError::Closed)) => Ok(()),
            (_, Err(e)) => Err(e.into()),
        }
    }

    /// Release the client transport. Idempotent.
    ///
    /// TCP closes the transport and gives back the user's connection slot.
    /// A UDP flow shares its socket with other flows and keeps both its
    /// transport and its stage; the flow owner retires it.
    pub fn close(&self) {
        let transport = {
            let mut inner = self.inner();
            match inner.kind {
                Some(TransportKind::Udp) => {
                    log::trace!(user_id = self.user.id, "UDP close, flow kept");
                    None
                }
                Some(TransportKind::Tcp) => {
                    let transport = inner.transport.take();
                    self.set_stage(Stage::Destroy);
                    transport
                }
                None => inner.transport.take(),
            }
        };
        if let Some(ClientTransport::Stream(t)) = transport {
            t.close();
        }
        if self.counted.swap(false, Ordering::AcqRel) {
            self.user.decr_tcp();
        }
    }

    // ==================== Stage handlers ====================

    fn handle_init(&self, data: Bytes) -> Result<(), HandlerError> {
        let (target, payload) = match parse_header(&data) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!(user_id = self.user.id, error = %e, "Bad header, closing");
                self.close();
                return Ok(());
            }
        };

        let req = OutboundRequest {
            target,
            payload,
            owner: self.me.clone(),
        };
        match self.kind() {
            Some(TransportKind::Tcp) => {
                self.set_stage(Stage::Connect);
                self.spawn_establish(req);
            }
            Some(TransportKind::Udp) => self.spawn_open_udp(req),
            None => {}
        }
        Ok(())
    }

    fn spawn_establish(&self, req: OutboundRequest) {
        let Some(me) = self.me.upgrade() else { return };
        let target = req.target.clone();
        tokio::spawn(async move {
            let connector = me.server.connector.clone();
            let attempt = connector.connect_tcp(req);
            let result = match me.server.conn_config.connect_deadline() {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(OutboundError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", limit),
                    ))),
                },
                None => attempt.await,
            };
            me.finish_establish(&target, result);
        });
    }

    fn finish_establish(
        &self,
        target: &Address,
        result: Result<Arc<dyn OutboundPeer>, OutboundError>,
    ) {
        match result {
            Ok(remote) => {
                let mut inner = self.inner();
                if self.stage() != Stage::Connect || inner.transport.is_none() {
                    drop(inner);
                    log::debug!(user_id = self.user.id, dest = %target, "Closed while connecting");
                    remote.close();
                    return;
                }
                inner.remote = Some(remote);
                self.user.incr_tcp();
                self.counted.store(true, Ordering::Release);
                self.set_stage(Stage::Stream);
                drop(inner);
                log::debug!(user_id = self.user.id, dest = %target, "Outbound established");
            }
            Err(OutboundError::Io(e)) => {
                log::debug!(user_id = self.user.id, dest = %target, error = %e, "Outbound connect failed");
                self.close();
                self.set_stage(Stage::Destroy);
            }
            Err(e) => {
                log::warn!(user_id = self.user.id, dest = %target, error = %e, "Outbound connect failed unexpectedly");
                self.close();
                self.set_stage(Stage::Error);
            }
        }
    }

    fn spawn_open_udp(&self, req: OutboundRequest) {
        let Some(me) = self.me.upgrade() else { return };
        let target = req.target.clone();
        tokio::spawn(async move {
            match me.server.connector.open_udp(req).await {
                Ok(_) => log::trace!(user_id = me.user.id, dest = %target, "UDP endpoint open"),
                Err(OutboundError::Io(e)) => {
                    log::debug!(user_id = me.user.id, dest = %target, error = %e, "UDP endpoint failed")
                }
                Err(e) => me.contain("open_udp", e.into()),
            }
        });
    }

    fn spawn_handle_connect(&self, data: Bytes) {
        let Some(me) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(e) = me.handle_connect(data).await {
                me.contain("handle_connect", e);
            }
        });
    }

    /// Hold a chunk that arrived while the outbound leg is establishing.
    ///
    /// Waits for the stage to leave CONNECT, at most `connect_poll_attempts`
    /// waits of `connect_poll_interval` each, waking early on a transition.
    async fn handle_connect(&self, data: Bytes) -> Result<(), HandlerError> {
        let cfg = self.server.conn_config;
        let mut stage_rx = self.stage.subscribe();

        for attempt in 0..=cfg.connect_poll_attempts {
            let stage = *stage_rx.borrow_and_update();
            match stage {
                Stage::Connect if attempt < cfg.connect_poll_attempts => {
                    let _ = tokio::time::timeout(cfg.connect_poll_interval, stage_rx.changed()).await;
                }
                Stage::Connect => break,
                Stage::Stream => return self.forward(data),
                other => {
                    log::debug!(user_id = self.user.id, stage = %other, "Connect abandoned, chunk dropped");
                    return Ok(());
                }
            }
        }

        log::warn!(
            user_id = self.user.id,
            waited_ms = (cfg.connect_poll_interval * cfg.connect_poll_attempts).as_millis() as u64,
            "Timed out waiting for outbound connection, chunk dropped"
        );
        Ok(())
    }

    fn handle_stream(&self, data: Bytes) -> Result<(), HandlerError> {
        self.timer.mark_active();
        self.forward(data)
    }

    fn forward(&self, data: Bytes) -> Result<(), HandlerError> {
        let remote = self.inner().remote.clone();
        match remote {
            Some(remote) => {
                remote.write(data);
                Ok(())
            }
            None => Err(HandlerError::MissingPeer(self.stage())),
        }
    }
}

impl IdleClose for ConnectionHandler {
    fn idle_timer(&self) -> &IdleTimer {
        &self.timer
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn close(&self) {
        ConnectionHandler::close(self);
    }
}
