//! The TUN device clatd owns on its IPv4 side.
//!
//! `open("/dev/net/tun")` + `ioctl(TUNSETIFF)` + `fcntl(O_NONBLOCK)`, with
//! `IFF_NO_PI` deliberately left unset: each read must be prefixed with a
//! 4-byte packet-information header whose protocol field we validate
//! against `ETH_P_IP`.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{
    c_short, c_uchar, close, fcntl, ioctl, open, read, write, F_GETFL, F_SETFL, IFF_TUN, IFNAMSIZ,
    O_NONBLOCK, O_RDWR,
};

use crate::error::DaemonError;
use crate::ifconfig;

const TUNSETIFF: u64 = 0x4004_54ca;

/// `ETH_P_IP`, the protocol value `tun_pi.proto` must carry for a packet we
/// can translate.
pub const ETH_P_IP: u16 = 0x0800;

#[repr(C)]
union IfrIfru {
    ifru_flags: c_short,
}

#[repr(C)]
struct ifreq {
    ifr_name: [c_uchar; IFNAMSIZ],
    ifr_ifru: IfrIfru,
}

/// The 4-byte `tun_pi` header Linux prefixes every TUN read/write with
/// unless `IFF_NO_PI` was set at open time.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TunPacketInfo {
    pub flags: u16,
    pub proto: u16,
}

pub const TUN_PI_LEN: usize = 4;

pub struct TunDevice {
    fd: RawFd,
    name: String,
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe { close(self.fd) };
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl TunDevice {
    /// Opens (creating if necessary) the named TUN device, non-blocking,
    /// with packet information headers enabled.
    pub fn open(name: &str) -> Result<Self, DaemonError> {
        let fd = match unsafe { open(b"/dev/net/tun\0".as_ptr() as _, O_RDWR) } {
            -1 => return Err(DaemonError::Tun(io::Error::last_os_error())),
            fd => fd,
        };

        let iface_name = name.as_bytes();
        if iface_name.len() >= IFNAMSIZ {
            unsafe { close(fd) };
            return Err(DaemonError::Tun(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("tunnel name {name:?} too long"),
            )));
        }

        let mut ifr = ifreq {
            ifr_name: [0; IFNAMSIZ],
            ifr_ifru: IfrIfru {
                ifru_flags: IFF_TUN as c_short,
            },
        };
        ifr.ifr_name[..iface_name.len()].copy_from_slice(iface_name);

        if unsafe { ioctl(fd, TUNSETIFF as _, &ifr) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(DaemonError::Tun(err));
        }

        let flags = unsafe { fcntl(fd, F_GETFL) };
        if flags == -1 {
            let err = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(DaemonError::Tun(err));
        }
        if unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(DaemonError::Tun(err));
        }

        Ok(TunDevice {
            fd,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs `addr/32` and brings the interface up at `mtu` (section
    /// 4.5's "install `ipv4_local` on the tunnel and bring it up").
    pub fn configure(&self, addr: Ipv4Addr, mtu: u16) -> io::Result<()> {
        ifconfig::set_ipv4_address(&self.name, addr)?;
        ifconfig::set_mtu(&self.name, mtu)?;
        ifconfig::bring_up(&self.name)
    }

    /// Reads exactly one packet, returning the 4-byte packet-information
    /// header and the IPv4 payload that follows it.
    pub fn read<'a>(&self, buf: &'a mut [u8]) -> io::Result<(TunPacketInfo, &'a [u8])> {
        let n = match unsafe { read(self.fd, buf.as_mut_ptr() as _, buf.len()) } {
            -1 => return Err(io::Error::last_os_error()),
            n => n as usize,
        };

        if n < TUN_PI_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "tun read shorter than the packet-information header",
            ));
        }

        let flags = u16::from_be_bytes([buf[0], buf[1]]);
        let proto = u16::from_be_bytes([buf[2], buf[3]]);

        Ok((TunPacketInfo { flags, proto }, &buf[TUN_PI_LEN..n]))
    }

    /// Writes `packet` (an IPv4 datagram) prefixed with a `tun_pi` header
    /// whose protocol is `ETH_P_IP`.
    pub fn write(&self, packet: &[u8]) -> io::Result<usize> {
        let mut framed = Vec::with_capacity(TUN_PI_LEN + packet.len());
        framed.extend_from_slice(&0u16.to_be_bytes());
        framed.extend_from_slice(&ETH_P_IP.to_be_bytes());
        framed.extend_from_slice(packet);

        match unsafe { write(self.fd, framed.as_ptr() as _, framed.len() as _) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tun_pi_header_round_trips_proto() {
        let mut framed = Vec::new();
        framed.extend_from_slice(&0u16.to_be_bytes());
        framed.extend_from_slice(&ETH_P_IP.to_be_bytes());
        framed.extend_from_slice(&[1, 2, 3, 4]);

        let flags = u16::from_be_bytes([framed[0], framed[1]]);
        let proto = u16::from_be_bytes([framed[2], framed[3]]);
        assert_eq!(flags, 0);
        assert_eq!(proto, ETH_P_IP);
        assert_eq!(&framed[TUN_PI_LEN..], &[1, 2, 3, 4]);
    }
}
