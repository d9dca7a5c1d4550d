//! Client-side TCP framing: fixed 2-byte request, fixed 10-byte reply.
//!
//! Mirrors the non-blocking read/write discipline used elsewhere in this
//! stack for its length-prefixed frames (partial-read state machine, a
//! single outstanding send with a backlog fallback, writable interest armed
//! only while the backlog is non-empty) but specialised to these two fixed
//! sizes instead of a generic framed payload.

use std::io::{self, Read, Write};

use mio::{Interest, Registry, Token, net::TcpStream};
use tracing::debug;

use crate::wire::{REQUEST_LEN, REPLY_LEN, decode_request};

#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

pub enum ReadOutcome {
    RequestReady(u16),
    WouldBlock,
    Disconnected,
}

/// A single accepted client connection.
pub struct ClientConn {
    stream: TcpStream,
    token: Token,
    rx_buf: [u8; REQUEST_LEN],
    rx_have: usize,
    /// Unsent tail of the reply currently in flight. At most one reply is
    /// ever outstanding per connection: a new request is not read while
    /// this is `Some`.
    pending: Option<Vec<u8>>,
    writable_armed: bool,
}

impl ClientConn {
    pub fn new(stream: TcpStream, token: Token) -> Self {
        Self {
            stream,
            token,
            rx_buf: [0; REQUEST_LEN],
            rx_have: 0,
            pending: None,
            writable_armed: false,
        }
    }

    pub fn has_pending_send(&self) -> bool {
        self.pending.is_some()
    }

    /// Read one request frame off the wire, if a full one is available.
    pub fn read_request(&mut self) -> ReadOutcome {
        while self.rx_have < REQUEST_LEN {
            match self.stream.read(&mut self.rx_buf[self.rx_have..]) {
                Ok(0) => return ReadOutcome::Disconnected,
                Ok(n) => self.rx_have += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
                Err(err) => {
                    debug!(?err, "client tcp: read request");
                    return ReadOutcome::Disconnected;
                }
            }
        }
        let req_type = decode_request(&self.rx_buf);
        self.rx_have = 0;
        ReadOutcome::RequestReady(req_type)
    }

    /// Send a freshly-built reply, enqueueing any unsent tail.
    pub fn send_reply(&mut self, registry: &Registry, reply: [u8; REPLY_LEN]) -> ConnState {
        debug_assert!(self.pending.is_none(), "at most one outstanding send per connection");

        match self.stream.write(&reply) {
            Ok(0) => ConnState::Disconnected,
            Ok(n) if n == REPLY_LEN => ConnState::Alive,
            Ok(n) => self.enqueue(registry, reply[n..].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue(registry, reply.to_vec())
            }
            Err(err) => {
                debug!(?err, "client tcp: write reply");
                ConnState::Disconnected
            }
        }
    }

    /// Drain the backlogged reply on a writable event.
    pub fn drain_pending(&mut self, registry: &Registry) -> ConnState {
        let Some(buf) = &mut self.pending else { return ConnState::Alive };

        match self.stream.write(buf) {
            Ok(0) => ConnState::Disconnected,
            Ok(n) if n == buf.len() => {
                self.pending = None;
                self.disarm_writable(registry)
            }
            Ok(n) => {
                buf.drain(..n);
                ConnState::Alive
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ConnState::Alive,
            Err(err) => {
                debug!(?err, "client tcp: drain pending reply");
                ConnState::Disconnected
            }
        }
    }

    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.pending = Some(data);
        self.arm_writable(registry)
    }

    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "client tcp: arm writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    fn disarm_writable(&mut self, registry: &Registry) -> ConnState {
        if self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "client tcp: disarm writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
