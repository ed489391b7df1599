//! IPv6 -> IPv4 packet translation (RFC 7915 section 5).
//!
//! Walks the extension header chain (skipping hop-by-hop/destination
//! options, conditionally rejecting routing headers, honoring at most one
//! fragment header), rebuilds the IPv4 header, adjusts UDP/TCP checksums
//! incrementally, and emits a "packet too big" reply when the translated
//! packet would not fit.

use std::net::{Ipv4Addr, Ipv6Addr};

use etherparse::{
    Icmpv6Header, IpNumber, Ipv4Dscp, Ipv4Ecn, Ipv4Header, Ipv4Options, Ipv6HeaderSlice,
    TcpHeaderSlice, UdpHeaderSlice,
};

use super::{ChecksumHint, Outcome, Protocol};
use crate::addr::PlatPrefix;
use crate::checksum;
use crate::error::{Error, Result};
use crate::fragment::{FragmentHeader, FRAGMENT_HEADER_LEN};
use crate::icmp;
use crate::icmpv4_header_slice_mut::Icmpv4HeaderSliceMut;
use crate::tcp_header_slice_mut::TcpHeaderSliceMut;
use crate::udp_header_slice_mut::UdpHeaderSliceMut;

const IPV6_HEADER_LEN: usize = etherparse::Ipv6Header::LEN;
const IPV4_HEADER_LEN: usize = Ipv4Header::MIN_LEN;
/// Bails out of the extension-header walk rather than looping forever on
/// a pathological chain; RFC 7915 doesn't expect more than a handful.
const MAX_EXTENSION_HEADERS: usize = 8;

pub struct Request<'a> {
    /// The full IPv6 datagram as read off the packet ring.
    pub packet: &'a [u8],
    pub plat: &'a PlatPrefix,
    /// This daemon's own CLAT IPv6 address; packets not addressed here
    /// were already supposed to be filtered out by the classifier, but
    /// the translator re-checks since it has no knowledge of the kernel
    /// filter actually being in place.
    pub clat_address: Ipv6Addr,
    pub ipv4_local: Ipv4Addr,
    /// Outbound (tunnel) MTU.
    pub mtu: u16,
    pub checksum_hint: ChecksumHint,
    pub reply_on_hop_limit_expired: bool,
}

/// Translates a single IPv6 packet into `out`, per RFC 7915 section 5.
pub fn translate(req: Request, out: &mut [u8]) -> Result<Outcome> {
    let packet = req.packet;
    let ipv6 = Ipv6HeaderSlice::from_slice(packet)
        .map_err(|e| Error::malformed(format!("invalid IPv6 header: {e}")))?;

    if ipv6.destination_addr() != req.clat_address {
        return Err(Error::malformed("not addressed to our CLAT address"));
    }
    let src_v4 = req.plat.extract(ipv6.source_addr())?;

    let payload_length = ipv6.payload_length() as usize;
    if IPV6_HEADER_LEN + payload_length > packet.len() {
        return Err(Error::malformed("IPv6 payload length exceeds buffer"));
    }

    let (upper_protocol, fragment, ext_headers_len) =
        walk_extension_headers(ipv6.next_header(), &packet[IPV6_HEADER_LEN..IPV6_HEADER_LEN + payload_length])?;

    let hop_limit = ipv6.hop_limit();
    if hop_limit == 0 {
        if req.reply_on_hop_limit_expired {
            let len = icmp::build_v6_time_exceeded(packet, req.clat_address, out)?;
            return Ok(Outcome::IcmpError { len });
        }
        return Err(Error::malformed("hop limit expired"));
    }

    let l4_start = IPV6_HEADER_LEN + ext_headers_len;
    let l4_payload = &packet[l4_start..IPV6_HEADER_LEN + payload_length];

    let total_len = IPV4_HEADER_LEN + l4_payload.len();
    if total_len > u16::MAX as usize {
        let len = icmp::build_v6_packet_too_big(packet, req.clat_address, 65535, out)?;
        return Ok(Outcome::IcmpError { len });
    }
    if total_len > out.len() {
        return Err(Error::malformed("translated packet exceeds scratch buffer"));
    }
    if total_len > req.mtu as usize {
        let len = icmp::build_v6_packet_too_big(packet, req.clat_address, u32::from(req.mtu), out)?;
        return Ok(Outcome::IcmpError { len });
    }

    let protocol = match upper_protocol {
        IpNumber::IPV6_ICMP => IpNumber::ICMP,
        other => other,
    };

    let (identification, more_fragments, fragment_offset, dont_fragment) = match fragment {
        Some(f) => (f.identification as u16, f.more_fragments, f.fragment_offset, false),
        None => (0, false, 0, true),
    };

    let mut ipv4_header = Ipv4Header {
        options: Ipv4Options::default(),
        dscp: Ipv4Dscp::try_new(ipv6.traffic_class()).unwrap_or(Ipv4Dscp::ZERO),
        total_len: total_len as u16,
        identification,
        more_fragments,
        dont_fragment,
        fragment_offset: etherparse::IpFragOffset::try_new(fragment_offset)
            .map_err(|e| Error::malformed(format!("invalid fragment offset: {e}")))?,
        ecn: Ipv4Ecn::default(),
        time_to_live: hop_limit - 1,
        protocol,
        header_checksum: 0,
        source: src_v4.octets(),
        destination: req.ipv4_local.octets(),
    };
    ipv4_header.header_checksum = ipv4_header.calc_header_checksum();

    tracing::trace!(from = ?ipv6, to = ?ipv4_header, "translated IPv6 header to IPv4");

    ipv4_header
        .write(&mut std::io::Cursor::new(&mut out[..IPV4_HEADER_LEN]))
        .map_err(|e| Error::malformed(format!("failed to write IPv4 header: {e}")))?;

    out[IPV4_HEADER_LEN..IPV4_HEADER_LEN + l4_payload.len()].copy_from_slice(l4_payload);

    translate_l4(
        Protocol::from_ipv6(upper_protocol),
        ipv6.source(),
        ipv6.destination(),
        src_v4,
        req.ipv4_local,
        l4_payload.len() as u16,
        fragment.is_some(),
        &mut out[IPV4_HEADER_LEN..IPV4_HEADER_LEN + l4_payload.len()],
    )?;

    Ok(Outcome::Translated { len: total_len })
}

/// Walks the IPv6 extension header chain (everything after the fixed
/// 40-byte header), returning the upper-layer protocol, an optional
/// parsed fragment header, and the total length of extension headers
/// skipped over (i.e. the offset at which the upper-layer payload
/// begins, relative to the start of `payload`).
fn walk_extension_headers(
    mut next_header: IpNumber,
    payload: &[u8],
) -> Result<(IpNumber, Option<FragmentHeader>, usize)> {
    let mut offset = 0usize;
    let mut fragment = None;

    for _ in 0..MAX_EXTENSION_HEADERS {
        match next_header {
            IpNumber::IPV6_HEADER_HOP_BY_HOP | IpNumber::IPV6_DESTINATION_OPTIONS => {
                let rest = &payload[offset..];
                if rest.len() < 2 {
                    return Err(Error::malformed("truncated IPv6 extension header"));
                }
                let header_ext_len = rest[1] as usize;
                let header_len = (header_ext_len + 1) * 8;
                if rest.len() < header_len {
                    return Err(Error::malformed("truncated IPv6 extension header"));
                }
                next_header = IpNumber(rest[0]);
                offset += header_len;
            }
            IpNumber::IPV6_ROUTE_HEADER => {
                let rest = &payload[offset..];
                if rest.len() < 4 {
                    return Err(Error::malformed("truncated IPv6 routing header"));
                }
                let header_ext_len = rest[1] as usize;
                let routing_type = rest[2];
                let segments_left = rest[3];
                let header_len = (header_ext_len + 1) * 8;
                if rest.len() < header_len {
                    return Err(Error::malformed("truncated IPv6 routing header"));
                }
                if routing_type != 0 || segments_left != 0 {
                    // RFC 7915 section 5.1: drop and (optionally) reply with
                    // an ICMPv6 parameter-problem; this daemon's default
                    // policy is silent drop.
                    return Err(Error::malformed("non-trivial routing header"));
                }
                next_header = IpNumber(rest[0]);
                offset += header_len;
            }
            IpNumber::IPV6_FRAGMENTATION_HEADER => {
                if fragment.is_some() {
                    return Err(Error::malformed("more than one IPv6 fragment header"));
                }
                let header = FragmentHeader::parse(&payload[offset..])?;
                next_header = IpNumber(header.next_header);
                offset += FRAGMENT_HEADER_LEN;
                if !header.is_unfragmented() {
                    fragment = Some(header);
                }
            }
            other => return Ok((other, fragment, offset)),
        }
    }

    Err(Error::malformed("too many IPv6 extension headers"))
}

/// Mirror of [`super::v4_to_v6::translate_l4`] for the opposite direction.
#[allow(clippy::too_many_arguments)]
fn translate_l4(
    protocol: Protocol,
    old_src: [u8; 16],
    old_dst: [u8; 16],
    new_src: Ipv4Addr,
    new_dst: Ipv4Addr,
    l4_len: u16,
    is_fragment: bool,
    buf: &mut [u8],
) -> Result<()> {
    match protocol {
        Protocol::Icmp => {
            let (icmpv6_header, _payload) = Icmpv6Header::from_slice(buf)
                .map_err(|e| Error::malformed(format!("invalid ICMPv6 header: {e}")))?;
            let icmpv4_header = icmp::translate_icmpv6_header(icmpv6_header)?;

            icmpv4_header
                .write(&mut std::io::Cursor::new(&mut *buf))
                .map_err(|e| Error::malformed(format!("failed to write ICMPv4 header: {e}")))?;

            let checksum = icmpv4_header.icmp_type.calc_checksum(&buf[icmpv4_header.header_len()..]);
            let mut slice = Icmpv4HeaderSliceMut::from_slice(buf)
                .map_err(|e| Error::malformed(format!("{e}")))?;
            slice.set_checksum(checksum);
        }
        Protocol::Udp => {
            let udp = UdpHeaderSlice::from_slice(buf)
                .map_err(|e| Error::malformed(format!("invalid UDP header: {e}")))?;
            let old_checksum = udp.checksum();

            // Safety: `buf` was just validated as a UDP header by `UdpHeaderSlice::from_slice`.
            let mut slice = unsafe { UdpHeaderSliceMut::from_slice_unchecked(buf) };
            if old_checksum == 0 {
                if is_fragment {
                    return Err(Error::malformed(
                        "cannot compute UDP checksum for a non-first/incomplete fragment",
                    ));
                }
                let pseudo = checksum::pseudo_v4(new_src.octets(), new_dst.octets(), IpNumber::UDP.0, l4_len);
                slice.set_checksum(checksum::fold(pseudo + checksum::sum(buf)));
            } else {
                let old_pseudo = checksum::pseudo_v6(old_src, old_dst, IpNumber::UDP.0, u32::from(l4_len));
                let new_pseudo = checksum::pseudo_v4(new_src.octets(), new_dst.octets(), IpNumber::UDP.0, l4_len);
                slice.set_checksum(checksum::adjust_sums(old_checksum, old_pseudo, new_pseudo));
            }
        }
        Protocol::Tcp => {
            let tcp = TcpHeaderSlice::from_slice(buf)
                .map_err(|e| Error::malformed(format!("invalid TCP header: {e}")))?;
            let old_checksum = tcp.checksum();

            let old_pseudo = checksum::pseudo_v6(old_src, old_dst, IpNumber::TCP.0, u32::from(l4_len));
            let new_pseudo = checksum::pseudo_v4(new_src.octets(), new_dst.octets(), IpNumber::TCP.0, l4_len);

            // Safety: `buf` was just validated as a TCP header by `TcpHeaderSlice::from_slice`.
            let mut slice = unsafe { TcpHeaderSliceMut::from_slice_unchecked(buf) };
            slice.set_checksum(checksum::adjust_sums(old_checksum, old_pseudo, new_pseudo));
        }
        Protocol::Gre | Protocol::Other(_) => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn plat() -> PlatPrefix {
        PlatPrefix::new("64:ff9b::".parse().unwrap(), 96).unwrap()
    }

    #[test]
    fn echo_reply_inbound_scenario() {
        // ICMPv6 echo reply, mirroring the outbound echo request.
        let mut packet = Vec::new();
        PacketBuilder::ipv6(
            "64:ff9b::808:808".parse::<Ipv6Addr>().unwrap().octets(),
            "2001:db8::1".parse::<Ipv6Addr>().unwrap().octets(),
            64,
        )
        .icmpv6_echo_reply(0x1234, 1)
        .write(&mut packet, &[0u8; 56])
        .unwrap();

        let mut out = [0u8; 1500];
        let outcome = translate(
            Request {
                packet: &packet,
                plat: &plat(),
                clat_address: "2001:db8::1".parse().unwrap(),
                ipv4_local: "192.0.0.4".parse().unwrap(),
                mtu: 1500,
                checksum_hint: ChecksumHint::None,
                reply_on_hop_limit_expired: false,
            },
            &mut out,
        )
        .unwrap();

        let Outcome::Translated { len } = outcome else {
            panic!("expected translation");
        };

        let (headers, payload) = etherparse::IpHeaders::from_ipv4_slice(&out[..len]).unwrap();
        let (ipv4, _) = headers.ipv4().unwrap();
        assert_eq!(ipv4.source, [8, 8, 8, 8]);
        assert_eq!(ipv4.destination, [192, 0, 0, 4]);
        assert_eq!(ipv4.time_to_live, 63);

        let (icmp_header, _) = etherparse::Icmpv4Header::from_slice(payload.payload).unwrap();
        assert!(matches!(
            icmp_header.icmp_type,
            etherparse::Icmpv4Type::EchoReply(h) if h.id == 0x1234 && h.seq == 1
        ));
    }

    #[test]
    fn rejects_packet_not_addressed_to_our_clat_address() {
        // A frame addressed to a different /128 than our CLAT address.
        let mut packet = Vec::new();
        PacketBuilder::ipv6(
            "64:ff9b::808:808".parse::<Ipv6Addr>().unwrap().octets(),
            "2001:db8::2".parse::<Ipv6Addr>().unwrap().octets(),
            64,
        )
        .udp(1, 2)
        .write(&mut packet, &[0u8; 8])
        .unwrap();

        let mut out = [0u8; 1500];
        let result = translate(
            Request {
                packet: &packet,
                plat: &plat(),
                clat_address: "2001:db8::1".parse().unwrap(),
                ipv4_local: "192.0.0.4".parse().unwrap(),
                mtu: 1500,
                checksum_hint: ChecksumHint::None,
                reply_on_hop_limit_expired: false,
            },
            &mut out,
        );

        assert!(result.is_err());
    }

    #[test]
    fn unfragmented_fragment_header_is_removed_and_df_is_set() {
        // Boundary case: fragment offset 0, M=0 -> removed, DF=1.
        let mut ipv6_payload = Vec::new();
        let fragment = FragmentHeader {
            next_header: IpNumber::UDP.0,
            fragment_offset: 0,
            more_fragments: false,
            identification: 42,
        };
        let mut frag_bytes = [0u8; FRAGMENT_HEADER_LEN];
        fragment.write(&mut frag_bytes);
        ipv6_payload.extend_from_slice(&frag_bytes);

        let mut udp = Vec::new();
        etherparse::UdpHeader {
            source_port: 1,
            destination_port: 2,
            length: 16,
            checksum: 0x1111,
        }
        .write(&mut udp)
        .unwrap();
        udp.extend_from_slice(&[0u8; 8]);
        ipv6_payload.extend_from_slice(&udp);

        let ipv6 = etherparse::Ipv6Header {
            traffic_class: 0,
            flow_label: etherparse::Ipv6FlowLabel::ZERO,
            payload_length: ipv6_payload.len() as u16,
            next_header: IpNumber::IPV6_FRAGMENTATION_HEADER,
            hop_limit: 64,
            source: "64:ff9b::808:808".parse::<Ipv6Addr>().unwrap().octets(),
            destination: "2001:db8::1".parse::<Ipv6Addr>().unwrap().octets(),
        };

        let mut packet = Vec::new();
        ipv6.write(&mut packet).unwrap();
        packet.extend_from_slice(&ipv6_payload);

        let mut out = [0u8; 1500];
        let outcome = translate(
            Request {
                packet: &packet,
                plat: &plat(),
                clat_address: "2001:db8::1".parse().unwrap(),
                ipv4_local: "192.0.0.4".parse().unwrap(),
                mtu: 1500,
                checksum_hint: ChecksumHint::None,
                reply_on_hop_limit_expired: false,
            },
            &mut out,
        )
        .unwrap();

        let Outcome::Translated { len } = outcome else {
            panic!("expected translation");
        };

        let (headers, _) = etherparse::IpHeaders::from_ipv4_slice(&out[..len]).unwrap();
        let (ipv4, _) = headers.ipv4().unwrap();
        assert!(ipv4.dont_fragment);
        assert!(!ipv4.more_fragments);
        assert_eq!(ipv4.protocol, IpNumber::UDP);
    }
}
