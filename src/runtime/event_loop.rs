//! Proxy core: the single-threaded readiness loop tying every collaborator
//! together.
//!
//! Grounded in the teacher's `runtime/mio_impl/event_loop.rs` (accept loop,
//! `Slab`-keyed connections, dispatch on `event.token()`, `close_connection`
//! as the one teardown path) generalized from a multi-worker cache server to
//! a single-threaded proxy core per §4.7/§5 of the design: one `Selector`,
//! one SOCKS listener, one management listener, one DNS offload, driving
//! `Connection` and `ManagementConnection` state machines instead of a
//! request/response protocol table.

use chrono::Utc;
use mio::net::TcpListener;
use mio::{Events, Interest, Token};
use slab::Slab;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connlog::{ConnectionLog, ConnectionLogEntry};
use crate::dns::DnsResolver;
use crate::management::{self, ManagementConnection};
use crate::metrics::Metrics;
use crate::users::UserStore;

use super::connection::Connection;
use super::selector::Selector;
use super::signal;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const MGMT_LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const DNS_TOKEN: Token = Token(usize::MAX - 2);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 3);
const MGMT_TOKEN_BASE: usize = usize::MAX / 2;

/// Matches the source's `tests/test_max_connections.c` ceiling and the
/// teacher's own `MAX_CONNECTIONS` — past this the accept loop stops
/// draining the listen queue until connections close.
const MAX_CONNECTIONS: usize = 10_000;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

fn client_token(idx: usize) -> Token {
    Token(idx * 2)
}

fn origin_token(idx: usize) -> Token {
    Token(idx * 2 + 1)
}

fn conn_index(token: Token) -> usize {
    token.0 / 2
}

fn is_origin_token(token: Token) -> bool {
    token.0 % 2 == 1
}

fn mgmt_token(idx: usize) -> Token {
    Token(MGMT_TOKEN_BASE + idx)
}

fn mgmt_index(token: Token) -> usize {
    token.0 - MGMT_TOKEN_BASE
}

fn is_mgmt_token(token: Token) -> bool {
    token.0 >= MGMT_TOKEN_BASE && token.0 < SIGNAL_TOKEN.0
}

/// Encode `(generation, idx)` into the `u64` token the DNS offload carries
/// across its self-pipe, so a completion answering a slab slot that has
/// since been reused for an unrelated connection is recognised as stale
/// rather than misapplied (§4.5: "looked up by a generation-checked key,
/// not a raw pointer").
fn encode_dns_token(generation: u64, idx: usize) -> u64 {
    (generation << 32) | idx as u64
}

fn decode_dns_token(token: u64) -> (usize, u64) {
    ((token & 0xFFFF_FFFF) as usize, token >> 32)
}

/// The proxy's single-threaded event loop: owns both listeners, the DNS
/// offload, the signal self-pipe, and every live connection.
pub struct ProxyCore {
    selector: Selector,
    listener: TcpListener,
    mgmt_listener: TcpListener,
    dns: DnsResolver,
    signal_receiver: mio::unix::pipe::Receiver,

    connections: Slab<Connection>,
    conn_generations: Vec<u64>,
    mgmt_connections: Slab<ManagementConnection>,

    users: UserStore,
    metrics: Metrics,
    connlog: ConnectionLog,

    prefer_auth: bool,
    idle_timeout: Duration,
    last_sweep: Instant,
}

impl ProxyCore {
    pub fn new(config: &Config) -> io::Result<Self> {
        let listen_addr: SocketAddr = config.listen.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address {:?}: {e}", config.listen),
            )
        })?;
        let mgmt_addr: SocketAddr = config.management_listen.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid management listen address {:?}: {e}", config.management_listen),
            )
        })?;

        let mut selector = Selector::new()?;

        let mut listener = TcpListener::from_std(create_listener(listen_addr)?);
        let mut mgmt_listener = TcpListener::from_std(create_listener(mgmt_addr)?);
        selector.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        selector.register(&mut mgmt_listener, MGMT_LISTENER_TOKEN, Interest::READABLE)?;

        let mut dns = DnsResolver::spawn()?;
        selector.register(&mut dns.receiver, DNS_TOKEN, Interest::READABLE)?;

        let mut signal_receiver = signal::install()?;
        selector.register(&mut signal_receiver, SIGNAL_TOKEN, Interest::READABLE)?;

        let users = UserStore::new();
        for seed in &config.seed_users {
            users.add(&seed.username, &seed.password, seed.role);
        }

        info!(
            listen = %listen_addr,
            management_listen = %mgmt_addr,
            require_auth = config.require_auth,
            idle_timeout_secs = config.idle_timeout_secs,
            "proxy core starting"
        );

        Ok(ProxyCore {
            selector,
            listener,
            mgmt_listener,
            dns,
            signal_receiver,
            connections: Slab::new(),
            conn_generations: Vec::new(),
            mgmt_connections: Slab::new(),
            users,
            metrics: Metrics::new(),
            connlog: ConnectionLog::new(crate::connlog::DEFAULT_CAPACITY),
            prefer_auth: config.require_auth,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            last_sweep: Instant::now(),
        })
    }

    /// Run until a shutdown signal arrives or the selector itself fails.
    /// Returns the process exit code (§6): 0 clean shutdown, 2 selector
    /// failure. Consumes `self` since it only ever runs once.
    pub fn run(mut self) -> i32 {
        let mut events = Events::with_capacity(1024);

        let exit_code = loop {
            match self.selector.poll(&mut events, Some(SWEEP_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "selector poll failed");
                    break 2;
                }
            }

            let mut shutdown_requested = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_loop(),
                    MGMT_LISTENER_TOKEN => self.accept_mgmt_loop(),
                    DNS_TOKEN => self.handle_dns_readable(),
                    SIGNAL_TOKEN => {
                        self.drain_signal_pipe();
                        shutdown_requested = true;
                    }
                    t if is_mgmt_token(t) => self.handle_mgmt_event(t, event),
                    t => self.handle_connection_event(t, event),
                }
            }

            self.sweep_idle();

            if shutdown_requested {
                info!("shutdown signal received");
                break 0;
            }
        };

        self.shutdown_all();
        self.dns.shutdown();
        exit_code
    }

    fn accept_loop(&mut self) {
        loop {
            if self.connections.len() >= MAX_CONNECTIONS {
                warn!("connection limit reached, pausing accept");
                break;
            }
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let idx = self
                        .connections
                        .insert(Connection::new(stream, peer_addr, self.prefer_auth));
                    self.bump_generation(idx);

                    let conn = &mut self.connections[idx];
                    if let Err(e) =
                        self.selector
                            .register(&mut conn.client, client_token(idx), Interest::READABLE)
                    {
                        warn!(idx, error = %e, "failed to register accepted connection");
                        self.connections.remove(idx);
                        continue;
                    }
                    self.metrics.connection_opened();
                    debug!(idx, peer = %peer_addr, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn accept_mgmt_loop(&mut self) {
        loop {
            match self.mgmt_listener.accept() {
                Ok((stream, peer_addr)) => {
                    let idx = self.mgmt_connections.insert(ManagementConnection::new(stream));
                    let conn = &mut self.mgmt_connections[idx];
                    if let Err(e) =
                        self.selector
                            .register(&mut conn.stream, mgmt_token(idx), Interest::READABLE)
                    {
                        warn!(idx, error = %e, "failed to register management connection");
                        self.mgmt_connections.remove(idx);
                        continue;
                    }
                    debug!(idx, peer = %peer_addr, "accepted management connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "management accept failed");
                    break;
                }
            }
        }
    }

    fn bump_generation(&mut self, idx: usize) {
        if idx >= self.conn_generations.len() {
            self.conn_generations.resize(idx + 1, 0);
        }
        self.conn_generations[idx] = self.conn_generations[idx].wrapping_add(1);
    }

    fn handle_connection_event(&mut self, token: Token, event: &mio::event::Event) {
        let idx = conn_index(token);
        if !self.connections.contains(idx) {
            return;
        }
        let origin_side = is_origin_token(token);

        if event.is_readable() {
            if origin_side {
                self.connections[idx].on_origin_readable();
            } else {
                self.connections[idx].on_client_readable(&self.users);
            }
        }

        if self.connections.contains(idx) && event.is_writable() {
            if origin_side {
                self.connections[idx].on_origin_writable();
            } else {
                self.connections[idx].on_client_writable();
            }
        }

        if self.connections.contains(idx) {
            self.after_connection_activity(idx);
        }
    }

    fn handle_dns_readable(&mut self) {
        let completions = self.dns.drain_completions();
        for (raw_token, result) in completions {
            let (idx, generation) = decode_dns_token(raw_token);
            if !self.connections.contains(idx) {
                continue;
            }
            if self.conn_generations.get(idx).copied().unwrap_or(0) != generation {
                debug!(idx, "dropping stale dns completion for reused slot");
                continue;
            }
            self.connections[idx].attach_resolution(result);
            self.after_connection_activity(idx);
        }
    }

    /// After any phase handler runs: tear down if terminal, otherwise wire
    /// up whatever the handler asked for (a DNS submission, a fresh origin
    /// registration) and reconcile registered interest with what the phase
    /// now wants.
    fn after_connection_activity(&mut self, idx: usize) {
        if self.connections[idx].is_terminal() {
            self.teardown_connection(idx);
            return;
        }

        if let Some((host, port)) = self.connections[idx].take_resolution_request() {
            let generation = self.conn_generations.get(idx).copied().unwrap_or(0);
            let token = encode_dns_token(generation, idx);
            if self.dns.submit(token, host, port).is_err() {
                self.connections[idx].fail_resolution_submission();
            }
        }

        if self.connections[idx].take_origin_needs_registration() {
            // The previous candidate's origin socket (if any) is already
            // closed; drop its stale bookkeeping so this token can be
            // registered again under the same slab index.
            self.selector.forget(origin_token(idx));
            let conn = &mut self.connections[idx];
            if let Some(origin) = conn.origin.as_mut() {
                if let Err(e) = self.selector.register(origin, origin_token(idx), Interest::WRITABLE) {
                    warn!(idx, error = %e, "failed to register origin socket");
                    conn.mark_error();
                }
            }
        }

        if self.connections[idx].is_terminal() {
            self.teardown_connection(idx);
            return;
        }

        let conn = &mut self.connections[idx];
        reconcile_client_interest(&mut self.selector, conn, idx);
        reconcile_origin_interest(&mut self.selector, conn, idx);
    }

    fn teardown_connection(&mut self, idx: usize) {
        if !self.connections.contains(idx) {
            return;
        }
        let mut conn = self.connections.remove(idx);

        let _ = self.selector.deregister(&mut conn.client, client_token(idx));
        if let Some(mut origin) = conn.origin.take() {
            let _ = self.selector.deregister(&mut origin, origin_token(idx));
        }

        self.metrics.connection_closed();
        let bytes = conn.bytes_transferred();
        self.metrics.add_bytes(bytes);

        if let Some(username) = conn.username() {
            self.users.update_metrics(username, bytes);
        }
        if !conn.destination().is_empty() {
            self.connlog.push(ConnectionLogEntry {
                username: conn.username().unwrap_or("-").to_string(),
                destination: conn.destination().to_string(),
                port: conn.port(),
                timestamp: Utc::now(),
            });
        }

        debug!(idx, bytes, "connection torn down");
    }

    fn handle_mgmt_event(&mut self, token: Token, event: &mio::event::Event) {
        let idx = mgmt_index(token);
        if !self.mgmt_connections.contains(idx) {
            return;
        }

        if event.is_readable() {
            match self.mgmt_connections[idx].on_readable() {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(idx, error = %e, "management connection read error");
                    self.teardown_mgmt(idx);
                    return;
                }
            }
        }

        if let Some((username, password)) = self.mgmt_connections[idx].take_pending_auth() {
            let authenticated = self.users.authenticate(&username, &password);
            let is_admin = authenticated && self.users.is_admin(&username);
            self.mgmt_connections[idx].finish_auth(authenticated, is_admin);
        }

        if let Some((cmd, payload, is_admin)) = self.mgmt_connections[idx].take_pending_command() {
            let (status, response) = management::handle_command(
                cmd,
                &payload,
                is_admin,
                &self.metrics,
                &self.users,
                &self.connlog,
            );
            self.mgmt_connections[idx].push_response(status, &response);
        }

        match self.mgmt_connections[idx].on_writable() {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(idx, error = %e, "management connection write error");
                self.teardown_mgmt(idx);
                return;
            }
        }

        if self.mgmt_connections[idx].is_closed() {
            self.teardown_mgmt(idx);
            return;
        }

        let desired = mgmt_interest(&self.mgmt_connections[idx]);
        let registered = self.selector.is_registered(token);
        let conn = &mut self.mgmt_connections[idx];
        match (registered, desired) {
            (true, Some(i)) => {
                let _ = self.selector.reregister(&mut conn.stream, token, i);
            }
            (true, None) => {
                let _ = self.selector.deregister(&mut conn.stream, token);
            }
            (false, Some(i)) => {
                let _ = self.selector.register(&mut conn.stream, token, i);
            }
            (false, None) => {}
        }
    }

    fn teardown_mgmt(&mut self, idx: usize) {
        if !self.mgmt_connections.contains(idx) {
            return;
        }
        let mut conn = self.mgmt_connections.remove(idx);
        let _ = self.selector.deregister(&mut conn.stream, mgmt_token(idx));
        debug!(idx, "management connection closed");
    }

    fn drain_signal_pipe(&mut self) {
        let mut buf = [0u8; 16];
        loop {
            match self.signal_receiver.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    /// Transition any relaying connection idle past the configured timeout
    /// to `Error` and tear it down, piggybacked on the `poll` timeout.
    fn sweep_idle(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        let stale: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_relaying() && c.idle_for(now) > self.idle_timeout)
            .map(|(idx, _)| idx)
            .collect();

        for idx in stale {
            self.connections[idx].force_timeout();
            self.teardown_connection(idx);
        }
    }

    fn shutdown_all(&mut self) {
        let _ = self.selector.deregister(&mut self.listener, LISTENER_TOKEN);
        let _ = self.selector.deregister(&mut self.mgmt_listener, MGMT_LISTENER_TOKEN);

        let conn_indices: Vec<usize> = self.connections.iter().map(|(idx, _)| idx).collect();
        for idx in conn_indices {
            self.teardown_connection(idx);
        }

        let mgmt_indices: Vec<usize> = self.mgmt_connections.iter().map(|(idx, _)| idx).collect();
        for idx in mgmt_indices {
            self.teardown_mgmt(idx);
        }
    }
}

fn reconcile_client_interest(selector: &mut Selector, conn: &mut Connection, idx: usize) {
    let desired = conn.client_interest();
    let registered = selector.is_registered(client_token(idx));
    match (registered, desired) {
        (true, Some(i)) => {
            let _ = selector.reregister(&mut conn.client, client_token(idx), i);
        }
        (true, None) => {
            let _ = selector.deregister(&mut conn.client, client_token(idx));
        }
        (false, Some(i)) => {
            let _ = selector.register(&mut conn.client, client_token(idx), i);
        }
        (false, None) => {}
    }
}

fn reconcile_origin_interest(selector: &mut Selector, conn: &mut Connection, idx: usize) {
    let desired = conn.origin_interest();
    let registered = selector.is_registered(origin_token(idx));
    let Some(origin) = conn.origin.as_mut() else {
        return;
    };
    match (registered, desired) {
        (true, Some(i)) => {
            let _ = selector.reregister(origin, origin_token(idx), i);
        }
        (true, None) => {
            let _ = selector.deregister(origin, origin_token(idx));
        }
        (false, Some(i)) => {
            let _ = selector.register(origin, origin_token(idx), i);
        }
        (false, None) => {}
    }
}

fn mgmt_interest(conn: &ManagementConnection) -> Option<Interest> {
    match (conn.wants_read(), conn.wants_write()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Bind a listener with `SO_REUSEADDR` but not `SO_REUSEPORT` — this core is
/// single-threaded, so there is no kernel load balancing to opt into, unlike
/// the teacher's multi-worker `create_listener_with_reuseport`; re-binding
/// after a restart without waiting out `TIME_WAIT` is the only reason to
/// reach for `socket2` here.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}
