//! RFC 6052 IPv4 <-> IPv6 address embedding and extraction, and derivation of
//! the CLAT's own IPv6 address from an uplink-assigned /64.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// A PLAT (provider-side translator) prefix under which IPv4-embedded IPv6
/// addresses are constructed, per RFC 6052 section 2.2.
///
/// `prefix_len` must be one of the five RFC 6052 well-known lengths; all
/// other bits of `prefix` beyond `prefix_len` are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatPrefix {
    prefix: Ipv6Addr,
    prefix_len: u8,
}

impl PlatPrefix {
    pub fn new(prefix: Ipv6Addr, prefix_len: u8) -> Result<Self> {
        if !matches!(prefix_len, 32 | 40 | 48 | 56 | 64 | 96) {
            return Err(Error::InvalidPlatPrefixLen(prefix_len));
        }

        Ok(Self { prefix, prefix_len })
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn prefix(&self) -> Ipv6Addr {
        self.prefix
    }

    /// Embeds `addr` into this prefix, per RFC 6052 figure 1.
    ///
    /// The IPv4 address always occupies the 32 bits immediately following
    /// the prefix, except that a single reserved byte (bits 64..=71, the
    /// "u" byte) is skipped over for prefix lengths shorter than /96.
    pub fn embed(&self, addr: Ipv4Addr) -> Ipv6Addr {
        let mut out = self.prefix.octets();
        let v4 = addr.octets();

        let prefix_bytes = (self.prefix_len / 8) as usize;

        if self.prefix_len == 96 {
            out[12..16].copy_from_slice(&v4);
        } else {
            // bits [prefix_len .. prefix_len+32), skipping reserved byte 8.
            let mut v4_bits = 0usize;
            for out_byte in (prefix_bytes..16).take(5) {
                if out_byte == 8 {
                    out[out_byte] = 0;
                    continue;
                }
                out[out_byte] = v4[v4_bits];
                v4_bits += 1;
            }
        }

        Ipv6Addr::from(out)
    }

    /// Extracts an IPv4 address from `addr`, if `addr` is inside this prefix.
    pub fn extract(&self, addr: Ipv6Addr) -> Result<Ipv4Addr> {
        if !self.contains(addr) {
            return Err(Error::NotInPlat);
        }

        let octets = addr.octets();
        let prefix_bytes = (self.prefix_len / 8) as usize;

        let mut v4 = [0u8; 4];
        if self.prefix_len == 96 {
            v4.copy_from_slice(&octets[12..16]);
        } else {
            let mut v4_bits = 0usize;
            for in_byte in (prefix_bytes..16).take(5) {
                if in_byte == 8 {
                    continue;
                }
                v4[v4_bits] = octets[in_byte];
                v4_bits += 1;
            }
        }

        Ok(Ipv4Addr::from(v4))
    }

    /// Whether `addr` shares this prefix's network bits (and, for prefixes
    /// shorter than /96, has a zero reserved byte).
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let octets = addr.octets();
        let prefix_octets = self.prefix.octets();
        let full_bytes = (self.prefix_len / 8) as usize;

        if octets[..full_bytes] != prefix_octets[..full_bytes] {
            return false;
        }

        self.prefix_len == 96 || octets[8] == 0
    }
}

/// Derives a stable 64-bit interface identifier for the CLAT's IPv6 address
/// from the uplink's delegated /64, so that re-running the daemon against
/// the same prefix always yields the same address.
///
/// This is not a cryptographic hash; it only needs to be stable for the
/// lifetime of a single prefix assignment and to avoid colliding with the
/// all-zero and subnet-router anycast identifiers.
pub fn derive_interface_id(uplink_prefix: Ipv6Addr) -> [u8; 8] {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325; // FNV-1a 64-bit offset basis
    for byte in &uplink_prefix.octets()[..8] {
        h ^= u64::from(*byte);
        h = h.wrapping_mul(0x0000_0100_0000_01B3); // FNV-1a prime
    }

    // Avoid generating the all-zero (subnet-router anycast) identifier.
    if h == 0 {
        h = 1;
    }

    h.to_be_bytes()
}

/// Builds the CLAT's own IPv6 address from the uplink's /64 and a derived
/// interface identifier.
pub fn clat_address(uplink_prefix_64: Ipv6Addr) -> Ipv6Addr {
    let mut octets = uplink_prefix_64.octets();
    octets[8..16].copy_from_slice(&derive_interface_id(uplink_prefix_64));
    Ipv6Addr::from(octets)
}

/// Abstraction over "is this IPv4 address already in use on the system", so
/// that local-address selection (RFC 7335) is unit-testable without a real
/// socket.
pub trait AddressProbe {
    /// Returns `true` if `candidate` is free to assign to the tunnel.
    fn is_available(&mut self, candidate: Ipv4Addr) -> bool;
}

/// Selects the first available address in `subnet/prefix_len`'s host range.
///
/// Network and broadcast addresses are skipped. Returns `None` if every
/// candidate is taken.
pub fn select_local_ipv4(
    subnet: Ipv4Addr,
    prefix_len: u8,
    probe: &mut impl AddressProbe,
) -> Option<Ipv4Addr> {
    assert!(prefix_len <= 32, "prefix length out of range");

    let base = u32::from(subnet);
    let host_bits = 32 - u32::from(prefix_len);
    if host_bits == 0 {
        return probe.is_available(subnet).then_some(subnet);
    }

    let network = base & !((1u32 << host_bits) - 1);
    let broadcast = network | ((1u32 << host_bits) - 1);

    for candidate in (network + 1)..broadcast {
        let addr = Ipv4Addr::from(candidate);
        if probe.is_available(addr) {
            return Some(addr);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc6052_worked_example_96() {
        // From RFC 6052 section 2.2, "Well-Known Prefix" style, /96 variant.
        let plat = PlatPrefix::new("2001:db8::".parse().unwrap(), 96).unwrap();
        let v4: Ipv4Addr = "192.0.2.33".parse().unwrap();

        let v6 = plat.embed(v4);
        assert_eq!(v6, "2001:db8::c000:221".parse::<Ipv6Addr>().unwrap());
        assert_eq!(plat.extract(v6).unwrap(), v4);
    }

    #[test]
    fn rfc6052_embed_with_reserved_byte_at_prefix_len_32() {
        let plat = PlatPrefix::new("64:ff9b::".parse().unwrap(), 32).unwrap();
        let v4: Ipv4Addr = "192.0.2.33".parse().unwrap();

        let v6 = plat.embed(v4);
        assert_eq!(plat.extract(v6).unwrap(), v4);
        // Byte 8 (the "u" byte) must be zero for all non-/96 prefixes.
        assert_eq!(v6.octets()[8], 0);
    }

    #[test]
    fn round_trips_at_every_valid_prefix_length() {
        let v4: Ipv4Addr = "203.0.113.7".parse().unwrap();

        for len in [32, 40, 48, 56, 64, 96] {
            let plat = PlatPrefix::new("2001:db8:1:2:3:4::".parse().unwrap(), len).unwrap();
            let v6 = plat.embed(v4);
            assert_eq!(plat.extract(v6).unwrap(), v4, "prefix len {len}");
        }
    }

    #[test]
    fn rejects_invalid_prefix_length() {
        assert!(matches!(
            PlatPrefix::new(Ipv6Addr::UNSPECIFIED, 48 + 1),
            Err(Error::InvalidPlatPrefixLen(49))
        ));
    }

    #[test]
    fn extract_rejects_address_outside_prefix() {
        let plat = PlatPrefix::new("64:ff9b::".parse().unwrap(), 96).unwrap();
        let unrelated: Ipv6Addr = "2001:db8::1".parse().unwrap();

        assert!(matches!(plat.extract(unrelated), Err(Error::NotInPlat)));
    }

    #[test]
    fn clat_address_is_stable_for_same_prefix() {
        let prefix: Ipv6Addr = "2001:db8:aaaa:bbbb::".parse().unwrap();
        assert_eq!(clat_address(prefix), clat_address(prefix));
    }

    #[test]
    fn clat_address_differs_across_prefixes() {
        let a = clat_address("2001:db8:1::".parse().unwrap());
        let b = clat_address("2001:db8:2::".parse().unwrap());
        assert_ne!(a, b);
    }

    struct FakeProbe {
        taken: Vec<Ipv4Addr>,
    }

    impl AddressProbe for FakeProbe {
        fn is_available(&mut self, candidate: Ipv4Addr) -> bool {
            !self.taken.contains(&candidate)
        }
    }

    #[test]
    fn selects_first_free_host_address() {
        let mut probe = FakeProbe {
            taken: vec!["192.0.0.1".parse().unwrap()],
        };

        let chosen = select_local_ipv4("192.0.0.0".parse().unwrap(), 29, &mut probe).unwrap();
        assert_eq!(chosen, "192.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn returns_none_when_subnet_exhausted() {
        let mut probe = FakeProbe { taken: vec![] };
        // /31 has no usable host addresses under the skip-network/broadcast rule.
        let chosen = select_local_ipv4("192.0.0.0".parse().unwrap(), 31, &mut probe);
        assert_eq!(chosen, None);
    }
}
