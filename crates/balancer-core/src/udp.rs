//! UDP client request/response, including the per-worker send queue used
//! when a reply can't be written immediately.

use std::{collections::VecDeque, io, net::SocketAddr};

use mio::net::UdpSocket;
use tracing::debug;

use crate::wire::{REQUEST_LEN, REPLY_LEN, decode_request};

pub enum ReadOutcome {
    RequestReady { from: SocketAddr, req_type: u16 },
    /// A datagram was read and discarded (e.g. too short to be a request).
    /// Distinct from `WouldBlock` so the caller's burst loop keeps draining
    /// the socket instead of treating this as backpressure.
    Dropped,
    WouldBlock,
}

/// Best-effort outbound datagram queue. UDP delivery has no retransmission;
/// this only absorbs bursts that would otherwise need a blocking send.
pub struct SendQueue {
    pending: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one pending request datagram, if any is available.
pub fn read_request(socket: &UdpSocket) -> ReadOutcome {
    let mut buf = [0u8; REQUEST_LEN];
    match socket.recv_from(&mut buf) {
        Ok((n, from)) if n >= REQUEST_LEN => {
            ReadOutcome::RequestReady { from, req_type: decode_request(&buf) }
        }
        Ok((_, from)) => {
            debug!(?from, "udp: short request datagram, dropping");
            ReadOutcome::Dropped
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
        Err(err) => {
            debug!(?err, "udp: recv_from failed");
            ReadOutcome::WouldBlock
        }
    }
}

/// Send a reply now, or enqueue it if the socket would block. Returns
/// whether the reply was enqueued (i.e. writable interest must be armed).
pub fn send_or_enqueue(
    socket: &UdpSocket,
    queue: &mut SendQueue,
    to: SocketAddr,
    reply: [u8; REPLY_LEN],
) -> bool {
    if !queue.pending.is_empty() {
        queue.pending.push_back((to, reply.to_vec()));
        return true;
    }

    match socket.send_to(&reply, to) {
        Ok(n) if n == REPLY_LEN => false,
        // A short write never happens for UDP in practice, but treat it the
        // same as backpressure rather than silently dropping half a reply.
        Ok(_) => {
            queue.pending.push_back((to, reply.to_vec()));
            true
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            queue.pending.push_back((to, reply.to_vec()));
            true
        }
        Err(err) => {
            debug!(?err, ?to, "udp: dropping undeliverable reply");
            false
        }
    }
}

/// Drain the backlog on a writable event. Stops at the first datagram that
/// can't be fully sent, preserving FIFO order; a datagram is only dropped
/// from the queue once the kernel reports the full length sent.
pub fn drain_queue(socket: &UdpSocket, queue: &mut SendQueue) {
    while let Some((to, payload)) = queue.pending.front() {
        match socket.send_to(payload, *to) {
            Ok(n) if n == payload.len() => {
                queue.pending.pop_front();
            }
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                debug!(?err, ?to, "udp: dropping undeliverable reply");
                queue.pending.pop_front();
            }
        }
    }
}
