//! Per-worker socket setup with `SO_REUSEADDR`/`SO_REUSEPORT` so the kernel
//! spreads accepts and datagrams across worker sockets bound to the same
//! port.
//!
//! Built on raw `libc` calls rather than pulling in a socket-builder crate,
//! matching the rest of this stack's preference for `libc::setsockopt`
//! directly where the standard library doesn't expose an option.

use std::{
    io,
    mem::size_of,
    net::{SocketAddr, SocketAddrV4, TcpListener, UdpSocket},
    os::fd::{FromRawFd, RawFd},
};

use crate::error::SetupError;

fn set_reuse(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    for opt in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &one as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
        sin_zero: [0; 8],
    }
}

fn as_v4(addr: SocketAddr) -> Result<SocketAddrV4, SetupError> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(SetupError::UnsupportedFamily(addr)),
    }
}

/// Create a non-blocking, reuseaddr/reuseport TCP listener bound to `addr`.
pub fn reuseport_tcp_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, SetupError> {
    let v4 = as_v4(addr)?;
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(SetupError::Socket(io::Error::last_os_error()));
        }
        if let Err(source) = set_reuse(fd) {
            libc::close(fd);
            return Err(SetupError::SetOpt { name: "SO_REUSEADDR/SO_REUSEPORT", source });
        }

        let sockaddr = to_sockaddr_in(v4);
        let ret = libc::bind(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if ret != 0 {
            let source = io::Error::last_os_error();
            libc::close(fd);
            return Err(SetupError::Bind { addr, source });
        }

        let ret = libc::listen(fd, backlog);
        if ret != 0 {
            let source = io::Error::last_os_error();
            libc::close(fd);
            return Err(SetupError::Listen(source));
        }

        let listener = TcpListener::from_raw_fd(fd);
        listener.set_nonblocking(true).map_err(SetupError::Socket)?;
        Ok(listener)
    }
}

/// Create a non-blocking, reuseaddr/reuseport UDP socket bound to `addr`.
pub fn reuseport_udp_socket(addr: SocketAddr) -> Result<UdpSocket, SetupError> {
    let v4 = as_v4(addr)?;
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(SetupError::Socket(io::Error::last_os_error()));
        }
        if let Err(source) = set_reuse(fd) {
            libc::close(fd);
            return Err(SetupError::SetOpt { name: "SO_REUSEADDR/SO_REUSEPORT", source });
        }

        let sockaddr = to_sockaddr_in(v4);
        let ret = libc::bind(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if ret != 0 {
            let source = io::Error::last_os_error();
            libc::close(fd);
            return Err(SetupError::Bind { addr, source });
        }

        let socket = UdpSocket::from_raw_fd(fd);
        socket.set_nonblocking(true).map_err(SetupError::Socket)?;
        Ok(socket)
    }
}

/// Set kernel `SO_SNDBUF`/`SO_RCVBUF` on a connected stream.
pub fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
