//! The raw IPv6 send socket: `AF_INET6, SOCK_RAW, IPPROTO_RAW`,
//! non-blocking, checksum offload disabled because the translator already
//! wrote a final checksum.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::DaemonError;

/// `IPPROTO_RAW` has no `socket2::Protocol` constant; its value is fixed by
/// POSIX (`255`).
const IPPROTO_RAW: i32 = 255;

pub struct Raw6Socket {
    inner: Socket,
}

impl AsRawFd for Raw6Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Raw6Socket {
    pub fn new(mark: Option<u32>) -> Result<Self, DaemonError> {
        let socket = Socket::new(
            Domain::IPV6,
            Type::RAW,
            Some(Protocol::from(IPPROTO_RAW)),
        )
        .map_err(DaemonError::RawSocket)?;

        socket.set_nonblocking(true).map_err(DaemonError::RawSocket)?;

        // The translator writes the complete IPv6 header itself; tell the
        // kernel not to construct its own (socket2 only exposes
        // `IP_HDRINCL` for v4, so this goes through `setsockopt` directly).
        set_ipv6_hdrincl(&socket).map_err(DaemonError::RawSocket)?;

        if let Some(mark) = mark {
            set_so_mark(&socket, mark).map_err(DaemonError::RawSocket)?;
        }

        Ok(Self { inner: socket })
    }

    /// Sends a complete IPv6 datagram (header + payload) to `destination`.
    pub fn send_to(&self, packet: &[u8], destination: Ipv6Addr, scope_id: u32) -> io::Result<usize> {
        let addr = SocketAddrV6::new(destination, 0, 0, scope_id);
        self.inner.send_to(packet, &SockAddr::from(SocketAddr::V6(addr)))
    }
}

fn set_ipv6_hdrincl(socket: &Socket) -> io::Result<()> {
    let on: libc::c_int = 1;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_HDRINCL,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_so_mark(socket: &Socket, mark: u32) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_so_mark(_socket: &Socket, _mark: u32) -> io::Result<()> {
    Ok(())
}
