//! Uplink IPv6 address discovery and local IPv4 address probing.
//!
//! Deliberately avoids `rtnetlink`/`tokio`: this daemon is single-threaded
//! and synchronous, and a single read of `/proc/net/if_inet6` gives us
//! everything the configurator and the prefix-change poll need.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use clat_proto::addr::AddressProbe;

const PROC_IF_INET6: &str = "/proc/net/if_inet6";

/// Global-unicast scope value used by the kernel in `/proc/net/if_inet6`'s
/// scope column (matches `include/net/ipv6.h`'s `IPV6_ADDR_SCOPE_GLOBAL`
/// shifted into the scope byte the kernel actually prints, 0x00).
const SCOPE_GLOBAL: u8 = 0x00;

/// One parsed line of `/proc/net/if_inet6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inet6Addr {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub scope: u8,
}

/// Returns every IPv6 address currently assigned to `interface`, in the
/// order the kernel lists them (first-listed wins ties per the Open
/// Questions decision recorded in `DESIGN.md`).
pub fn addresses_for(interface: &str) -> io::Result<Vec<Inet6Addr>> {
    let contents = std::fs::read_to_string(Path::new(PROC_IF_INET6))?;
    Ok(parse_if_inet6(&contents, interface))
}

/// Returns `interface`'s first currently-assigned global-unicast address,
/// if any.
pub fn global_unicast_address(interface: &str) -> io::Result<Option<Ipv6Addr>> {
    Ok(addresses_for(interface)?
        .into_iter()
        .find(|a| a.scope == SCOPE_GLOBAL)
        .map(|a| a.address))
}

fn parse_if_inet6(contents: &str, interface: &str) -> Vec<Inet6Addr> {
    let mut out = Vec::new();

    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let Some(addr_hex) = fields.next() else {
            continue;
        };
        let Some(_netlink_idx) = fields.next() else {
            continue;
        };
        let Some(prefix_len_hex) = fields.next() else {
            continue;
        };
        let Some(scope_hex) = fields.next() else {
            continue;
        };
        let Some(_flags_hex) = fields.next() else {
            continue;
        };
        let Some(name) = fields.next() else {
            continue;
        };

        if name != interface {
            continue;
        }

        let Some(address) = parse_hex_ipv6(addr_hex) else {
            continue;
        };
        let Ok(prefix_len) = u8::from_str_radix(prefix_len_hex, 16) else {
            continue;
        };
        let Ok(scope) = u8::from_str_radix(scope_hex, 16) else {
            continue;
        };

        out.push(Inet6Addr {
            address,
            prefix_len,
            scope,
        });
    }

    out
}

fn parse_hex_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }

    let mut octets = [0u8; 16];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }

    Some(Ipv6Addr::from(octets))
}

/// `AddressProbe` that asks the kernel "is this address already assigned
/// anywhere" by attempting to `connect()` a UDP socket bound to it. If the
/// bind succeeds, nothing else is using the address.
pub struct RouteProbe;

impl AddressProbe for RouteProbe {
    fn is_available(&mut self, candidate: Ipv4Addr) -> bool {
        use std::net::{SocketAddr, SocketAddrV4, UdpSocket};

        let addr = SocketAddr::V4(SocketAddrV4::new(candidate, 0));
        UdpSocket::bind(addr).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
00000000000000000000000000000001 01 80 10 80       lo
20010db8000000010000000000000001 02 40 00 80       eth0
fe80000000000000021122fffe334455 02 40 20 80       eth0
";

    #[test]
    fn parses_addresses_for_named_interface() {
        let addrs = parse_if_inet6(SAMPLE, "eth0");
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].address, "2001:db8:0:1::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(addrs[0].prefix_len, 0x40);
        assert_eq!(addrs[0].scope, 0x00);
        assert_eq!(addrs[1].scope, 0x20);
    }

    #[test]
    fn picks_first_global_unicast_address() {
        let addrs = parse_if_inet6(SAMPLE, "eth0");
        let global = addrs.into_iter().find(|a| a.scope == SCOPE_GLOBAL).unwrap();
        assert_eq!(global.address, "2001:db8:0:1::1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn ignores_other_interfaces() {
        assert!(parse_if_inet6(SAMPLE, "wlan0").is_empty());
    }
}
