//! TCP socket and address helpers.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

/// Create a non-blocking, close-on-exec listening socket bound to `addr`.
/// `SO_REUSEADDR` is always set; `SO_REUSEPORT` on request.
pub fn new_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    if reuse_port {
        let optval: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Accept one pending connection, returning it in non-blocking mode with
/// its peer address.
pub fn accept(listener: &Socket) -> io::Result<(Socket, SocketAddr)> {
    let (socket, addr) = listener.accept()?;
    socket.set_nonblocking(true)?;
    let peer = addr
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "accepted non-inet peer"))?;
    Ok((socket, peer))
}

pub fn local_addr(socket: &Socket) -> io::Result<SocketAddr> {
    socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "socket has non-inet address"))
}

pub fn set_nodelay(socket: &Socket, on: bool) -> io::Result<()> {
    socket.set_tcp_nodelay(on)
}

/// Half-close the write side once the output buffer has drained.
pub fn shutdown_write(socket: &Socket) -> io::Result<()> {
    socket.shutdown(std::net::Shutdown::Write)
}

/// Fetch and clear the pending error on a socket (`SO_ERROR`).
pub fn take_socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return io::Error::last_os_error().raw_os_error().unwrap_or(0);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = new_listener(addr, false).unwrap();
        let bound = local_addr(&listener).unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
    }

    #[test]
    fn reuse_port_listeners_share_an_address() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = new_listener(addr, true).unwrap();
        first.listen(16).unwrap();
        let bound = local_addr(&first).unwrap();

        let second = new_listener(bound, true).unwrap();
        second.listen(16).unwrap();
        assert_eq!(local_addr(&second).unwrap(), bound);
    }

    #[test]
    fn accept_returns_nonblocking_peer() {
        use std::io::Write;

        let listener = new_listener("127.0.0.1:0".parse().unwrap(), false).unwrap();
        listener.listen(16).unwrap();
        let bound = local_addr(&listener).unwrap();

        let mut client = std::net::TcpStream::connect(bound).unwrap();
        client.write_all(b"hi").unwrap();

        // The listener is non-blocking; poll briefly for the connection.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let (sock, peer) = loop {
            match accept(&listener) {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(std::time::Instant::now() < deadline, "no connection arrived");
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(take_socket_error(sock.as_raw_fd()), 0);
    }
}
