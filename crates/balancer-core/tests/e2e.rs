//! End-to-end scenarios driven against a single real worker over loopback
//! TCP/UDP sockets, in the same spirit as this stack's own
//! thread-plus-real-socket integration tests.

use std::{
    net::{TcpStream, UdpSocket},
    sync::Arc,
    thread,
    time::Duration,
};

use balancer_core::{
    Config,
    pool::PoolDirectory,
    wire::{REPLY_LEN, REQUEST_LEN, REQ_SERVER_ADDR, STATUS_NO_SERVER, STATUS_SUCCESS, STATUS_UNKNOWN_TYPE},
    worker::Worker,
};
use std::io::{Read, Write};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Spawn a single worker on fresh ports and run its reactor loop on a
/// background thread for the duration of `body`.
fn with_worker<F: FnOnce(u16, u16, &Arc<PoolDirectory>)>(body: F) {
    let client_port = free_port();
    let backend_port = free_port();
    let config = Config {
        client_port,
        backend_port,
        workers: 1,
        chunk_capacity: 4,
        accept_burst: 4,
        udp_burst: 4,
    };
    let pool = Arc::new(PoolDirectory::new(1, config.chunk_capacity));
    let worker = Worker::new(0, config, Arc::clone(&pool)).expect("worker setup");

    let stop_after = 200;
    let handle = thread::spawn(move || {
        let mut worker = worker;
        for _ in 0..stop_after {
            if worker.tick().is_err() {
                break;
            }
        }
    });

    // Give the listeners a moment to come up before the test drives I/O.
    thread::sleep(Duration::from_millis(20));
    body(client_port, backend_port, &pool);
    handle.join().unwrap();
}

fn connect_backend(backend_port: u16, port: u16, status: i64) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", backend_port)).unwrap();
    let mut port_msg = Vec::with_capacity(4);
    port_msg.extend_from_slice(&1u16.to_le_bytes()); // MSG_PORT
    port_msg.extend_from_slice(&port.to_le_bytes());
    stream.write_all(&port_msg).unwrap();

    let mut status_msg = Vec::with_capacity(10);
    status_msg.extend_from_slice(&2u16.to_le_bytes()); // MSG_STATUS
    status_msg.extend_from_slice(&status.to_le_bytes());
    stream.write_all(&status_msg).unwrap();

    stream
}

fn read_reply(stream: &mut TcpStream) -> [u8; REPLY_LEN] {
    let mut buf = [0u8; REPLY_LEN];
    stream.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn happy_path_tcp() {
    with_worker(|client_port, backend_port, _pool| {
        let _backend = connect_backend(backend_port, 55555, 0);
        thread::sleep(Duration::from_millis(50));

        let mut client = TcpStream::connect(("127.0.0.1", client_port)).unwrap();
        client.write_all(&REQ_SERVER_ADDR.to_le_bytes()).unwrap();
        let reply = read_reply(&mut client);

        assert_eq!(u16::from_le_bytes(reply[0..2].try_into().unwrap()), REQ_SERVER_ADDR);
        assert_eq!(u16::from_le_bytes(reply[2..4].try_into().unwrap()), STATUS_SUCCESS);
        assert_eq!(u16::from_le_bytes(reply[4..6].try_into().unwrap()), 55555);
    });
}

#[test]
fn no_server_over_udp() {
    with_worker(|client_port, _backend_port, _pool| {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(("127.0.0.1", client_port)).unwrap();
        socket.send(&REQ_SERVER_ADDR.to_le_bytes()).unwrap();

        let mut buf = [0u8; REPLY_LEN];
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let n = socket.recv(&mut buf).unwrap();
        assert_eq!(n, REPLY_LEN);
        assert_eq!(u16::from_le_bytes(buf[2..4].try_into().unwrap()), STATUS_NO_SERVER);
        assert_eq!(&buf[4..10], &[0u8; 6]);
    });
}

#[test]
fn unknown_request_type_echoes_type() {
    with_worker(|client_port, _backend_port, _pool| {
        let mut client = TcpStream::connect(("127.0.0.1", client_port)).unwrap();
        let weird_type: u16 = 0x4444;
        client.write_all(&weird_type.to_le_bytes()).unwrap();
        let reply = read_reply(&mut client);

        assert_eq!(u16::from_le_bytes(reply[0..2].try_into().unwrap()), weird_type);
        assert_eq!(u16::from_le_bytes(reply[2..4].try_into().unwrap()), STATUS_UNKNOWN_TYPE);
    });
}

#[test]
fn not_ready_backend_is_not_selected() {
    with_worker(|client_port, backend_port, _pool| {
        let mut backend = TcpStream::connect(("127.0.0.1", backend_port)).unwrap();
        let mut port_msg = Vec::new();
        port_msg.extend_from_slice(&1u16.to_le_bytes());
        port_msg.extend_from_slice(&4242u16.to_le_bytes());
        backend.write_all(&port_msg).unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut client = TcpStream::connect(("127.0.0.1", client_port)).unwrap();
        client.write_all(&REQ_SERVER_ADDR.to_le_bytes()).unwrap();
        let reply = read_reply(&mut client);
        assert_eq!(u16::from_le_bytes(reply[2..4].try_into().unwrap()), STATUS_NO_SERVER);
    });
}

#[test]
fn disconnect_tombstones_backend() {
    with_worker(|client_port, backend_port, _pool| {
        let backend = connect_backend(backend_port, 7000, 0);
        thread::sleep(Duration::from_millis(50));

        let mut client = TcpStream::connect(("127.0.0.1", client_port)).unwrap();
        client.write_all(&REQ_SERVER_ADDR.to_le_bytes()).unwrap();
        let reply = read_reply(&mut client);
        assert_eq!(u16::from_le_bytes(reply[2..4].try_into().unwrap()), STATUS_SUCCESS);

        drop(backend);
        thread::sleep(Duration::from_millis(50));

        let mut client2 = TcpStream::connect(("127.0.0.1", client_port)).unwrap();
        client2.write_all(&REQ_SERVER_ADDR.to_le_bytes()).unwrap();
        let reply2 = read_reply(&mut client2);
        assert_eq!(u16::from_le_bytes(reply2[2..4].try_into().unwrap()), STATUS_NO_SERVER);
    });
}

#[test]
fn request_len_constant_matches_wire_contract() {
    assert_eq!(REQUEST_LEN, 2);
    assert_eq!(REPLY_LEN, 10);
}
