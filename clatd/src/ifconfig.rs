//! Raw `ioctl`-based interface configuration, shared by the tun device and
//! the uplink (anycast address installation, MTU, bringing interfaces up).
//!
//! No `rtnetlink` dependency; a handful of `SIOCSIF*` ioctls cover
//! everything this daemon needs to do to an interface.

use std::ffi::CString;
use std::io;
use std::net::Ipv6Addr;
use std::os::unix::io::RawFd;

use libc::{
    c_int, c_short, sockaddr, sockaddr_in, AF_INET, AF_INET6, IFF_UP, IFNAMSIZ, IPPROTO_IP,
    SIOCGIFMTU, SIOCSIFADDR, SIOCSIFFLAGS, SIOCSIFMTU, SIOCSIFNETMASK, SOCK_DGRAM,
};

#[repr(C)]
union IfrIfru {
    ifru_addr: sockaddr,
    ifru_flags: c_short,
    ifru_mtu: c_int,
}

#[repr(C)]
struct ifreq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_ifru: IfrIfru,
}

/// Linux's `in6_ifreq`, used by `SIOCSIFADDR`/`SIOCDIFADDR` on an
/// `AF_INET6` socket (distinct layout from the IPv4 `ifreq` above — see
/// `linux/ipv6.h`).
#[repr(C)]
struct in6_ifreq {
    ifr6_addr: [u8; 16],
    ifr6_prefixlen: u32,
    ifr6_ifindex: c_int,
}

fn ifreq_for(name: &str) -> io::Result<ifreq> {
    let bytes = name.as_bytes();
    if bytes.len() >= IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name {name:?} too long"),
        ));
    }

    let mut ifr = ifreq {
        ifr_name: [0; IFNAMSIZ],
        ifr_ifru: IfrIfru { ifru_mtu: 0 },
    };
    ifr.ifr_name[..bytes.len()].copy_from_slice(bytes);
    Ok(ifr)
}

fn ioctl_socket() -> io::Result<RawFd> {
    match unsafe { libc::socket(AF_INET, SOCK_DGRAM, IPPROTO_IP) } {
        -1 => Err(io::Error::last_os_error()),
        fd => Ok(fd),
    }
}

fn checked_ioctl(fd: RawFd, request: u64, ifr: *const ifreq) -> io::Result<()> {
    if unsafe { libc::ioctl(fd, request as _, ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads the interface's current MTU via `SIOCGIFMTU`.
pub fn get_mtu(name: &str) -> io::Result<u16> {
    let fd = ioctl_socket()?;
    let mut ifr = ifreq_for(name)?;

    let result = checked_ioctl(fd, SIOCGIFMTU as u64, &ifr);
    unsafe { libc::close(fd) };
    result?;

    Ok(unsafe { ifr.ifr_ifru.ifru_mtu } as u16)
}

/// Sets the interface's MTU via `SIOCSIFMTU`.
pub fn set_mtu(name: &str, mtu: u16) -> io::Result<()> {
    let fd = ioctl_socket()?;
    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru = IfrIfru {
        ifru_mtu: mtu as c_int,
    };

    let result = checked_ioctl(fd, SIOCSIFMTU as u64, &ifr);
    unsafe { libc::close(fd) };
    result
}

/// Brings the interface up (`IFF_UP`) via `SIOCSIFFLAGS`. Leaves every
/// other flag untouched would require a preceding `SIOCGIFFLAGS`, which
/// the daemon skips since it only ever interacts with interfaces it just
/// created (the tun device) or the uplink, whose other flags we never
/// need to change.
pub fn bring_up(name: &str) -> io::Result<()> {
    let fd = ioctl_socket()?;
    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru = IfrIfru {
        ifru_flags: IFF_UP as c_short,
    };

    let result = checked_ioctl(fd, SIOCSIFFLAGS as u64, &ifr);
    unsafe { libc::close(fd) };
    result
}

/// Installs an IPv4 address and `/32` netmask on `name` via
/// `SIOCSIFADDR`/`SIOCSIFNETMASK`.
pub fn set_ipv4_address(name: &str, addr: std::net::Ipv4Addr) -> io::Result<()> {
    let fd = ioctl_socket()?;

    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru = IfrIfru {
        ifru_addr: sockaddr_in_for(addr),
    };
    let result = checked_ioctl(fd, SIOCSIFADDR as u64, &ifr);
    if result.is_ok() {
        let mut netmask_ifr = ifreq_for(name)?;
        netmask_ifr.ifr_ifru = IfrIfru {
            ifru_addr: sockaddr_in_for(std::net::Ipv4Addr::new(255, 255, 255, 255)),
        };
        let netmask_result = checked_ioctl(fd, SIOCSIFNETMASK as u64, &netmask_ifr);
        unsafe { libc::close(fd) };
        return netmask_result;
    }

    unsafe { libc::close(fd) };
    result
}

fn sockaddr_in_for(addr: std::net::Ipv4Addr) -> sockaddr {
    let sin = sockaddr_in {
        sin_family: AF_INET as _,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.octets()),
        },
        sin_zero: [0; 8],
    };

    // Safety: `sockaddr_in` and `sockaddr` have the same size and
    // alignment; this is the standard BSD sockets reinterpretation.
    unsafe { std::mem::transmute(sin) }
}

pub fn if_index(name: &str) -> io::Result<c_int> {
    let cname = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name has NUL byte"))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index as c_int)
}

/// Installs an IPv6 anycast address on `name` so the kernel answers
/// neighbor solicitations for it on our behalf.
pub fn add_ipv6_address(name: &str, addr: Ipv6Addr, prefix_len: u8) -> io::Result<()> {
    let fd = match unsafe { libc::socket(AF_INET6, SOCK_DGRAM, IPPROTO_IP) } {
        -1 => return Err(io::Error::last_os_error()),
        fd => fd,
    };

    let ifindex = if_index(name);
    let result = ifindex.and_then(|ifindex| {
        let ifr6 = in6_ifreq {
            ifr6_addr: addr.octets(),
            ifr6_prefixlen: prefix_len as u32,
            ifr6_ifindex: ifindex,
        };
        if unsafe { libc::ioctl(fd, SIOCSIFADDR as _, &ifr6) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    });

    unsafe { libc::close(fd) };
    result
}
