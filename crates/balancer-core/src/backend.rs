//! Backend-side TCP framing: a 2-byte header followed by a type-dependent
//! body (PORT: 2 bytes, STATUS: 8 bytes).
//!
//! Two-phase receive, same shape as the client-facing request/reply engine
//! in [`crate::client`]: partial header bytes are buffered until complete,
//! then partial body bytes are buffered (tagged with the header's type)
//! until the body completes, at which point the caller applies the decoded
//! message to the pool.

use std::io::{self, Read};

use tracing::debug;

use crate::wire::{BACKEND_HEADER_LEN, backend_body_len, decode_backend_header};

enum RxState {
    Header { buf: [u8; BACKEND_HEADER_LEN], have: usize },
    Body { msg_type: u16, buf: Vec<u8>, have: usize },
}

/// A fully decoded backend message, ready to be applied to the pool.
pub enum BackendMessage {
    Port(u16),
    Status(i64),
}

pub enum ReadOutcome {
    MessageReady(BackendMessage),
    WouldBlock,
    /// Header named a type this balancer doesn't understand; the
    /// connection must be closed.
    UnknownType(u16),
    Disconnected,
}

/// A single accepted backend connection.
pub struct BackendConn {
    stream: mio::net::TcpStream,
    rx_state: RxState,
    /// Slot this backend occupies in its worker's pool slice, once its
    /// first PORT message has been processed. `None` before that.
    pub slot: Option<crate::pool::Slot>,
    pub peer_ip: [u8; 4],
}

impl BackendConn {
    pub fn new(stream: mio::net::TcpStream, peer_ip: [u8; 4]) -> Self {
        Self {
            stream,
            rx_state: RxState::Header { buf: [0; BACKEND_HEADER_LEN], have: 0 },
            slot: None,
            peer_ip,
        }
    }

    /// Read and decode a single message if a complete one is available.
    pub fn read_message(&mut self) -> ReadOutcome {
        loop {
            match &mut self.rx_state {
                RxState::Header { buf, have } => {
                    while *have < BACKEND_HEADER_LEN {
                        match self.stream.read(&mut buf[*have..]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => *have += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "backend tcp: read header");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }

                    let msg_type = decode_backend_header(buf);
                    let Some(body_len) = backend_body_len(msg_type) else {
                        return ReadOutcome::UnknownType(msg_type);
                    };
                    self.rx_state = RxState::Body { msg_type, buf: vec![0; body_len], have: 0 };
                }

                RxState::Body { msg_type, buf, have } => {
                    while *have < buf.len() {
                        match self.stream.read(&mut buf[*have..]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => *have += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "backend tcp: read body");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }

                    let message = decode_body(*msg_type, buf);
                    self.rx_state = RxState::Header { buf: [0; BACKEND_HEADER_LEN], have: 0 };
                    return ReadOutcome::MessageReady(message);
                }
            }
        }
    }

    pub fn close(&mut self, registry: &mio::Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

fn decode_body(msg_type: u16, buf: &[u8]) -> BackendMessage {
    use crate::wire::{MSG_PORT, MSG_STATUS, decode_port_body, decode_status_body};
    match msg_type {
        MSG_PORT => BackendMessage::Port(decode_port_body(buf)),
        MSG_STATUS => BackendMessage::Status(decode_status_body(buf)),
        // `backend_body_len` already rejected anything else before a `Body`
        // state could be constructed.
        _ => unreachable!("unknown backend message type {msg_type} reached decode_body"),
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::TcpListener, thread, time::Duration};

    use super::*;
    use crate::wire::MSG_STATUS;

    /// A loopback pair: a plain blocking writer the test drives by hand, and
    /// the non-blocking `BackendConn` side under test.
    fn backend_pair() -> (std::net::TcpStream, BackendConn) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (writer, BackendConn::new(mio::net::TcpStream::from_std(accepted), [127, 0, 0, 1]))
    }

    /// Write a STATUS header in full, then its 8-byte body in the given
    /// split sizes, ticking `read_message` between every write. The final
    /// decoded count must match regardless of how the body was chunked.
    fn assert_status_survives_split(splits: &[usize], count: i64) {
        assert_eq!(splits.iter().sum::<usize>(), 8);
        let (mut writer, mut conn) = backend_pair();

        writer.write_all(&MSG_STATUS.to_le_bytes()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(conn.read_message(), ReadOutcome::WouldBlock));

        let body = count.to_le_bytes();
        let mut offset = 0;
        for &len in &splits[..splits.len() - 1] {
            writer.write_all(&body[offset..offset + len]).unwrap();
            offset += len;
            thread::sleep(Duration::from_millis(20));
            assert!(matches!(conn.read_message(), ReadOutcome::WouldBlock));
        }
        writer.write_all(&body[offset..]).unwrap();
        thread::sleep(Duration::from_millis(20));

        match conn.read_message() {
            ReadOutcome::MessageReady(BackendMessage::Status(n)) => assert_eq!(n, count),
            _ => panic!("expected a complete STATUS message"),
        }
    }

    #[test]
    fn status_body_split_1_7() {
        assert_status_survives_split(&[1, 7], 42);
    }

    #[test]
    fn status_body_split_7_1() {
        assert_status_survives_split(&[7, 1], 42);
    }

    #[test]
    fn status_body_split_4_4() {
        assert_status_survives_split(&[4, 4], 42);
    }
}
