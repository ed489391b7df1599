//! Stateless IPv4 <-> IPv6 header translation (RFC 7915), covering the full
//! upper-layer protocol set this daemon needs: ICMP, UDP, TCP, GRE
//! passthrough, and the IPv6 Fragment header.

pub mod v4_to_v6;
pub mod v6_to_v4;

use etherparse::IpNumber;

/// Upper-layer protocol tag used to decide how (if at all) a packet's L4
/// checksum needs adjusting after translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
    /// GRE has no address-dependent checksum by default; passed through.
    Gre,
    Other(u8),
}

impl Protocol {
    pub fn from_ipv4(number: IpNumber) -> Self {
        match number {
            IpNumber::ICMP => Protocol::Icmp,
            IpNumber::UDP => Protocol::Udp,
            IpNumber::TCP => Protocol::Tcp,
            IpNumber::GRE => Protocol::Gre,
            other => Protocol::Other(other.0),
        }
    }

    pub fn from_ipv6(number: IpNumber) -> Self {
        match number {
            IpNumber::IPV6_ICMP => Protocol::Icmp,
            IpNumber::UDP => Protocol::Udp,
            IpNumber::TCP => Protocol::Tcp,
            IpNumber::GRE => Protocol::Gre,
            other => Protocol::Other(other.0),
        }
    }
}

/// Outcome of translating a single packet.
///
/// A translation failure that should drop the packet silently is reported
/// as `Err(Error)` instead of a variant here; the variants below are the
/// two ways a *call* can still produce output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The packet was translated; the scratch buffer holds `len` bytes
    /// starting at its beginning, ready to send as-is.
    Translated { len: usize },
    /// Forwarding was refused (MTU exceeded with DF set, or hop
    /// limit/TTL reached zero) but RFC 7915 calls for an ICMP error in
    /// reply. The scratch buffer holds that reply in the *original*
    /// address family (ICMPv4 for the v4->v6 direction, ICMPv6 for
    /// v6->v4) — the caller writes it back out the endpoint the packet
    /// arrived on, not the one it was headed for.
    IcmpError { len: usize },
}

/// Pre-condition the caller can assert about a packet's L4 checksum,
/// letting the translator skip straight to incremental adjustment instead
/// of validating the checksum against the old pseudo-header first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumHint {
    /// No assumption; the translator validates what it needs to.
    #[default]
    None,
    /// The caller already knows the L4 checksum is valid under the old
    /// pseudo-header (e.g. it was just computed locally).
    PartialL4Valid,
}
