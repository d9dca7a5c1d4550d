//! Per-worker reactor: owns one `mio::Poll`, its accepted connections, and
//! its slice of the shared pool directory.
//!
//! Connections live in a flat `Vec<(Token, Conn)>` rather than a
//! `HashMap<Token, Conn>`, looked up by linear scan + `position()` the same
//! way the rest of this stack's connection manager avoids a hash lookup on
//! the hot path. Three tokens are reserved for the worker's own listeners;
//! every accepted connection gets the next token in sequence.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use mio::{
    Events, Interest, Poll, Registry, Token,
    net::{TcpListener, UdpSocket},
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{self, BackendConn},
    client::{self, ClientConn},
    config::Config,
    error::WorkerError,
    pool::{PoolDirectory, PoolSlice, select_least_loaded},
    socket::{reuseport_tcp_listener, reuseport_udp_socket, set_socket_buf_size},
    udp::{self, SendQueue},
    wire::{self, REPLY_LEN},
};

const CLIENT_LISTENER: Token = Token(0);
const BACKEND_LISTENER: Token = Token(1);
const UDP_SOCKET: Token = Token(2);
const FIRST_DYNAMIC_TOKEN: usize = 3;

const ACCEPT_BACKLOG: i32 = 1024;
const CLIENT_SOCKET_BUF_SIZE: usize = 8 * 1024;

enum Conn {
    Client(ClientConn),
    Backend(BackendConn),
}

struct ReadyEvent {
    token: Token,
    readable: bool,
    writable: bool,
}

/// One worker's event loop state.
pub struct Worker {
    index: usize,
    poll: Poll,
    events: Events,
    client_listener: TcpListener,
    backend_listener: TcpListener,
    udp_socket: UdpSocket,
    udp_queue: SendQueue,
    conns: Vec<(Token, Conn)>,
    next_token: usize,
    pool: Arc<PoolDirectory>,
    config: Config,
}

impl Worker {
    pub fn new(
        index: usize,
        config: Config,
        pool: Arc<PoolDirectory>,
    ) -> Result<Self, WorkerError> {
        let client_addr: SocketAddr = ([0, 0, 0, 0], config.client_port).into();
        let backend_addr: SocketAddr = ([0, 0, 0, 0], config.backend_port).into();

        let client_std = reuseport_tcp_listener(client_addr, ACCEPT_BACKLOG)?;
        let backend_std = reuseport_tcp_listener(backend_addr, ACCEPT_BACKLOG)?;
        let udp_std = reuseport_udp_socket(client_addr)?;

        let mut client_listener = TcpListener::from_std(client_std);
        let mut backend_listener = TcpListener::from_std(backend_std);
        let mut udp_socket = UdpSocket::from_std(udp_std);

        let poll = Poll::new().map_err(WorkerError::PollWait)?;
        poll.registry()
            .register(&mut client_listener, CLIENT_LISTENER, Interest::READABLE)
            .map_err(crate::error::SetupError::Register)?;
        poll.registry()
            .register(&mut backend_listener, BACKEND_LISTENER, Interest::READABLE)
            .map_err(crate::error::SetupError::Register)?;
        poll.registry()
            .register(&mut udp_socket, UDP_SOCKET, Interest::READABLE)
            .map_err(crate::error::SetupError::Register)?;

        Ok(Self {
            index,
            poll,
            events: Events::with_capacity(128),
            client_listener,
            backend_listener,
            udp_socket,
            udp_queue: SendQueue::new(),
            conns: Vec::with_capacity(64),
            next_token: FIRST_DYNAMIC_TOKEN,
            pool,
            config,
        })
    }

    /// Run the reactor loop forever (until a fatal error).
    pub fn run(mut self) -> Result<(), WorkerError> {
        loop {
            self.tick()?;
        }
    }

    /// One iteration: block in `Poll::poll`, dispatch every ready event.
    /// Split out from [`Self::run`] so tests can drive the loop manually.
    pub fn tick(&mut self) -> Result<(), WorkerError> {
        if let Err(err) = self.poll.poll(&mut self.events, Some(Duration::from_millis(100))) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(WorkerError::PollWait(err));
        }

        // `self.events` is borrowed by the iterator; collect what we need so
        // the dispatch loop below is free to mutate the rest of `self`.
        let ready: Vec<ReadyEvent> = self
            .events
            .iter()
            .map(|e| ReadyEvent { token: e.token(), readable: e.is_readable(), writable: e.is_writable() })
            .collect();

        for ev in ready {
            match ev.token {
                CLIENT_LISTENER => self.accept_clients()?,
                BACKEND_LISTENER => self.accept_backends()?,
                UDP_SOCKET => self.handle_udp(ev.readable, ev.writable),
                other => self.handle_conn_event(other, ev.readable, ev.writable),
            }
        }
        Ok(())
    }

    /// Accept up to `accept_burst` client connections. A `WouldBlock` ends
    /// the burst normally; any other accept or registration error is fatal
    /// to the worker (there is no recovery path that doesn't risk silently
    /// dropping connections the kernel has already queued).
    fn accept_clients(&mut self) -> Result<(), WorkerError> {
        for _ in 0..self.config.accept_burst {
            match self.client_listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    set_socket_buf_size(&stream, CLIENT_SOCKET_BUF_SIZE);
                    let token = self.alloc_token();
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                        .map_err(crate::error::SetupError::Register)?;
                    debug!(worker = self.index, ?peer_addr, "client connected");
                    self.conns.push((token, Conn::Client(ClientConn::new(stream, token))));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(?err, "worker: client accept failed, terminating worker");
                    return Err(WorkerError::Accept(err));
                }
            }
        }
        Ok(())
    }

    fn accept_backends(&mut self) -> Result<(), WorkerError> {
        for _ in 0..self.config.accept_burst {
            match self.backend_listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let token = self.alloc_token();
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                        .map_err(crate::error::SetupError::Register)?;
                    let ip = ipv4_octets(peer_addr);
                    info!(worker = self.index, ?peer_addr, "backend connected");
                    self.conns.push((token, Conn::Backend(BackendConn::new(stream, ip))));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(?err, "worker: backend accept failed, terminating worker");
                    return Err(WorkerError::Accept(err));
                }
            }
        }
        Ok(())
    }

    fn handle_udp(&mut self, readable: bool, writable: bool) {
        if writable {
            udp::drain_queue(&self.udp_socket, &mut self.udp_queue);
            if self.udp_queue.is_empty() {
                if let Err(err) = self.poll.registry().reregister(
                    &mut self.udp_socket,
                    UDP_SOCKET,
                    Interest::READABLE,
                ) {
                    warn!(?err, "worker: couldn't disarm udp writable");
                }
            }
        }

        if !readable {
            return;
        }

        for _ in 0..self.config.udp_burst {
            match udp::read_request(&self.udp_socket) {
                udp::ReadOutcome::RequestReady { from, req_type } => {
                    let reply = build_reply(&self.pool, req_type);
                    let enqueued =
                        udp::send_or_enqueue(&self.udp_socket, &mut self.udp_queue, from, reply);
                    if enqueued {
                        if let Err(err) = self.poll.registry().reregister(
                            &mut self.udp_socket,
                            UDP_SOCKET,
                            Interest::READABLE | Interest::WRITABLE,
                        ) {
                            warn!(?err, "worker: couldn't arm udp writable");
                        }
                    }
                }
                udp::ReadOutcome::Dropped => {}
                udp::ReadOutcome::WouldBlock => break,
            }
        }
    }

    fn handle_conn_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(index) = self.conns.iter().position(|(t, _)| *t == token) else {
            // Can legitimately race with a disconnect processed earlier in
            // the same batch of events; not a bug.
            debug!(?token, "worker: event for already-removed connection");
            return;
        };

        let registry = self.poll.registry();
        let pool = &self.pool;
        let worker_index = self.index;

        let disconnect = match &mut self.conns[index].1 {
            Conn::Client(conn) => drive_client(conn, registry, pool, readable, writable),
            Conn::Backend(conn) => {
                drive_backend(conn, pool.slice(worker_index), readable, writable)
            }
        };

        if disconnect {
            self.drop_conn(index);
        }
    }

    fn drop_conn(&mut self, index: usize) {
        let registry = self.poll.registry();
        let (_, conn) = self.conns.swap_remove(index);
        match conn {
            Conn::Client(mut c) => c.close(registry),
            Conn::Backend(mut c) => {
                if let Some(slot) = c.slot {
                    self.pool.slice(self.index).disconnect(slot);
                }
                c.close(registry);
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}

/// Build the fixed 10-byte reply for a client request, selecting the
/// least-loaded backend across the whole shared pool.
fn build_reply(pool: &PoolDirectory, req_type: u16) -> [u8; REPLY_LEN] {
    if req_type != wire::REQ_SERVER_ADDR {
        return wire::encode_reply(req_type, wire::STATUS_UNKNOWN_TYPE, 0, [0; 4]);
    }
    match select_least_loaded(pool) {
        Some(selected) => {
            wire::encode_reply(req_type, wire::STATUS_SUCCESS, selected.port, selected.ip)
        }
        None => wire::encode_reply(req_type, wire::STATUS_NO_SERVER, 0, [0; 4]),
    }
}

/// Drive one client connection. Returns whether it must be disconnected.
fn drive_client(
    conn: &mut ClientConn,
    registry: &Registry,
    pool: &PoolDirectory,
    readable: bool,
    writable: bool,
) -> bool {
    if writable && conn.has_pending_send() && conn.drain_pending(registry) == client::ConnState::Disconnected {
        return true;
    }

    if !readable || conn.has_pending_send() {
        return false;
    }

    loop {
        match conn.read_request() {
            client::ReadOutcome::RequestReady(req_type) => {
                let reply = build_reply(pool, req_type);
                if conn.send_reply(registry, reply) == client::ConnState::Disconnected {
                    return true;
                }
                if conn.has_pending_send() {
                    return false;
                }
            }
            client::ReadOutcome::WouldBlock => return false,
            client::ReadOutcome::Disconnected => return true,
        }
    }
}

/// Drive one backend connection. Returns whether it must be disconnected.
fn drive_backend(conn: &mut BackendConn, slice: &PoolSlice, readable: bool, _writable: bool) -> bool {
    if !readable {
        return false;
    }

    loop {
        match conn.read_message() {
            backend::ReadOutcome::MessageReady(backend::BackendMessage::Port(port)) => {
                conn.slot = Some(slice.register_port(conn.peer_ip, port));
            }
            backend::ReadOutcome::MessageReady(backend::BackendMessage::Status(count)) => {
                if let Some(slot) = conn.slot {
                    slice.update_status(slot, count);
                } else {
                    warn!("backend sent STATUS before PORT, ignoring");
                }
            }
            backend::ReadOutcome::WouldBlock => return false,
            backend::ReadOutcome::UnknownType(t) => {
                warn!(msg_type = t, "backend: unknown message type, closing connection");
                return true;
            }
            backend::ReadOutcome::Disconnected => return true,
        }
    }
}

fn ipv4_octets(addr: SocketAddr) -> [u8; 4] {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => v4.octets(),
        std::net::IpAddr::V6(_) => [0; 4],
    }
}
