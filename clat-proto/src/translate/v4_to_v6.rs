//! IPv4 -> IPv6 packet translation (RFC 7915 section 4).
//!
//! Covers the full dispatch this daemon needs: ICMP translation, UDP/TCP
//! checksum adjustment, GRE passthrough, the IPv6 Fragment extension
//! header, and the MTU/DF "fragmentation needed" reply.

use std::net::{Ipv4Addr, Ipv6Addr};

use etherparse::{
    Icmpv4Header, Icmpv4Type, IpNumber, Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice,
};

use super::{ChecksumHint, Outcome, Protocol};
use crate::addr::PlatPrefix;
use crate::checksum;
use crate::error::{Error, Result};
use crate::fragment::{self, FragmentHeader, FRAGMENT_HEADER_LEN};
use crate::icmp;
use crate::icmpv4_header_slice_mut::Icmpv4HeaderSliceMut;
use crate::icmpv6_header_slice_mut::Icmpv6HeaderSliceMut;
use crate::tcp_header_slice_mut::TcpHeaderSliceMut;
use crate::udp_header_slice_mut::UdpHeaderSliceMut;

const IPV6_HEADER_LEN: usize = etherparse::Ipv6Header::LEN;

/// Everything the translator needs to know about a single IPv4 packet
/// beyond its bytes.
pub struct Request<'a> {
    /// The full IPv4 datagram as read from the tunnel.
    pub packet: &'a [u8],
    pub plat: &'a PlatPrefix,
    /// This daemon's own CLAT IPv6 address, used as the translated
    /// packet's source.
    pub clat_address: Ipv6Addr,
    /// Effective IPv4 MTU (`mtu - 28`): the DF/"fragmentation needed" bound,
    /// and the next-hop MTU reported in the ICMPv4 reply when it's hit.
    pub ipv4mtu: u16,
    pub checksum_hint: ChecksumHint,
    /// Whether a hop-limit-exceeded condition should produce an ICMPv4
    /// Time Exceeded reply, or drop silently. Default posture is silent.
    pub reply_on_ttl_expired: bool,
}

/// Translates a single IPv4 packet into `out`, per RFC 7915 section 4.
///
/// `out` must be at least [`crate::MAX_PACKET_LEN`] bytes.
pub fn translate(req: Request, out: &mut [u8]) -> Result<Outcome> {
    let packet = req.packet;
    let ipv4 = Ipv4HeaderSlice::from_slice(packet)
        .map_err(|e| Error::malformed(format!("invalid IPv4 header: {e}")))?;

    let header_len = ipv4.ihl() as usize * 4;
    let total_len = ipv4.total_len() as usize;
    if total_len > packet.len() {
        return Err(Error::malformed("IPv4 total length exceeds buffer"));
    }
    if req.checksum_hint == ChecksumHint::None
        && checksum::fold(checksum::sum(&packet[..header_len])) != 0
    {
        return Err(Error::malformed("IPv4 header checksum invalid"));
    }

    let ttl = ipv4.ttl();
    if ttl == 0 {
        if req.reply_on_ttl_expired {
            let len = icmp::build_v4_time_exceeded(packet, out)?;
            return Ok(Outcome::IcmpError { len });
        }
        return Err(Error::malformed("TTL expired"));
    }

    let src = req.clat_address;
    let dst = req.plat.embed(ipv4.destination_addr());
    let frag_offset = ipv4.fragments_offset().value();
    let more_fragments = ipv4.more_fragments();
    let dont_fragment = ipv4.dont_fragment();
    let needs_fragment_header = more_fragments || frag_offset != 0;

    let payload = &packet[header_len..total_len];
    let l4_next_header = match ipv4.protocol() {
        IpNumber::ICMP => IpNumber::IPV6_ICMP,
        other => other,
    };

    let frag_header_len = if needs_fragment_header {
        FRAGMENT_HEADER_LEN
    } else {
        0
    };
    let required_len = IPV6_HEADER_LEN + frag_header_len + payload.len();

    // MTU / DF check: only datagrams that are not already a fragment are
    // eligible for the "translator MUST NOT fragment further" DF path —
    // a datagram we are already mid-fragmenting just gets its own
    // Fragment Header and is sent on regardless of size. The bound is the
    // effective IPv4-side MTU (`ipv4mtu = mtu - 28`), since that's the
    // limit the sending host is actually expected to honor.
    if !needs_fragment_header && dont_fragment && total_len > req.ipv4mtu as usize {
        let len = icmp::build_v4_fragmentation_needed(packet, req.ipv4mtu, out)?;
        return Ok(Outcome::IcmpError { len });
    }

    if required_len > out.len() {
        return Err(Error::malformed("translated packet exceeds scratch buffer"));
    }

    let next_header = if needs_fragment_header {
        IpNumber::IPV6_FRAGMENTATION_HEADER
    } else {
        l4_next_header
    };

    let ipv6_header = etherparse::Ipv6Header {
        traffic_class: ipv4.dscp().value(),
        flow_label: etherparse::Ipv6FlowLabel::ZERO,
        payload_length: (frag_header_len + payload.len()) as u16,
        next_header,
        hop_limit: ttl - 1,
        source: src.octets(),
        destination: dst.octets(),
    };

    tracing::trace!(from = ?ipv4, to = ?ipv6_header, "translated IPv4 header to IPv6");

    ipv6_header
        .write(&mut std::io::Cursor::new(&mut out[..IPV6_HEADER_LEN]))
        .map_err(|e| Error::malformed(format!("failed to write IPv6 header: {e}")))?;

    let mut offset = IPV6_HEADER_LEN;
    if needs_fragment_header {
        let fragment = fragment::from_ipv4_fields(ipv4.identification(), frag_offset, more_fragments);
        let fragment = FragmentHeader {
            next_header: l4_next_header.0,
            ..fragment
        };
        fragment.write(&mut out[offset..offset + FRAGMENT_HEADER_LEN]);
        offset += FRAGMENT_HEADER_LEN;
    }

    out[offset..offset + payload.len()].copy_from_slice(payload);

    translate_l4(
        Protocol::from_ipv4(ipv4.protocol()),
        ipv4.source(),
        ipv4.destination(),
        src,
        dst,
        total_len as u16,
        payload.len() as u16,
        needs_fragment_header,
        &mut out[offset..offset + payload.len()],
    )?;

    Ok(Outcome::Translated {
        len: offset + payload.len(),
    })
}

/// Rewrites the L4 header in place (now addressed to/from `new_src`/
/// `new_dst`) so its checksum is valid under the new pseudo-header.
///
/// `ip_total_len` is the *original* IPv4 datagram's total length (header +
/// everything); `l4_len` is just the upper-layer segment's own length
/// (what goes in a UDP/TCP/ICMPv6 pseudo-header).
#[allow(clippy::too_many_arguments)]
fn translate_l4(
    protocol: Protocol,
    old_src: [u8; 4],
    old_dst: [u8; 4],
    new_src: Ipv6Addr,
    new_dst: Ipv6Addr,
    ip_total_len: u16,
    l4_len: u16,
    is_fragment: bool,
    buf: &mut [u8],
) -> Result<()> {
    match protocol {
        Protocol::Icmp => {
            let (icmpv4_header, _icmp_payload) = Icmpv4Header::from_slice(buf)
                .map_err(|e| Error::malformed(format!("invalid ICMPv4 header: {e}")))?;
            let icmpv6_header = icmp::translate_icmpv4_header(ip_total_len, icmpv4_header)?;

            icmpv6_header
                .write(&mut std::io::Cursor::new(&mut *buf))
                .map_err(|e| Error::malformed(format!("failed to write ICMPv6 header: {e}")))?;

            let checksum = checksum::fold(
                checksum::pseudo_v6(new_src.octets(), new_dst.octets(), IpNumber::IPV6_ICMP.0, u32::from(l4_len))
                    + checksum::sum(buf),
            );
            let mut slice = Icmpv6HeaderSliceMut::from_slice(buf)
                .map_err(|e| Error::malformed(format!("{e}")))?;
            slice.set_checksum(checksum);
        }
        Protocol::Udp => {
            let udp = UdpHeaderSlice::from_slice(buf)
                .map_err(|e| Error::malformed(format!("invalid UDP header: {e}")))?;
            let old_checksum = udp.checksum();
            let udp_len = udp.length();

            // Safety: `buf` was just validated as a UDP header by `UdpHeaderSlice::from_slice`.
            let mut slice = unsafe { UdpHeaderSliceMut::from_slice_unchecked(buf) };
            if old_checksum == 0 {
                if !is_fragment {
                    // IPv6 forbids a zero UDP checksum; compute one fresh.
                    let pseudo = checksum::pseudo_v6(
                        new_src.octets(),
                        new_dst.octets(),
                        IpNumber::UDP.0,
                        u32::from(udp_len),
                    );
                    let checksum = checksum::fold(pseudo + checksum::sum(buf));
                    slice.set_checksum(checksum);
                }
                // else: leave zero; a fragmented packet cannot be checksummed
                // here because we only see one fragment's payload.
            } else {
                let old_pseudo = checksum::pseudo_v4(old_src, old_dst, IpNumber::UDP.0, udp_len);
                let new_pseudo = checksum::pseudo_v6(
                    new_src.octets(),
                    new_dst.octets(),
                    IpNumber::UDP.0,
                    u32::from(udp_len),
                );
                slice.set_checksum(checksum::adjust_sums(old_checksum, old_pseudo, new_pseudo));
            }
        }
        Protocol::Tcp => {
            let tcp = TcpHeaderSlice::from_slice(buf)
                .map_err(|e| Error::malformed(format!("invalid TCP header: {e}")))?;
            let old_checksum = tcp.checksum();

            let old_pseudo = checksum::pseudo_v4(old_src, old_dst, IpNumber::TCP.0, l4_len);
            let new_pseudo = checksum::pseudo_v6(
                new_src.octets(),
                new_dst.octets(),
                IpNumber::TCP.0,
                u32::from(l4_len),
            );

            // Safety: `buf` was just validated as a TCP header by `TcpHeaderSlice::from_slice`.
            let mut slice = unsafe { TcpHeaderSliceMut::from_slice_unchecked(buf) };
            slice.set_checksum(checksum::adjust_sums(old_checksum, old_pseudo, new_pseudo));
        }
        Protocol::Gre | Protocol::Other(_) => {
            // GRE has no address-dependent checksum by default; anything
            // else we don't recognize is passed through byte-for-byte.
        }
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
    fn echo_request_outbound_scenario() {
        // ICMP echo request, CLAT outbound.
        let mut packet = Vec::new();
        PacketBuilder::ipv4([192, 0, 0, 4], [8, 8, 8, 8], 64)
            .icmpv4_echo_request(0x1234, 1)
            .write(&mut packet, &[0u8; 56])
            .unwrap();

        let mut out = [0u8; 1500];
        let outcome = translate(
            Request {
                packet: &packet,
                plat: &plat(),
                clat_address: "2001:db8::1".parse().unwrap(),
                ipv4mtu: 1472,
                checksum_hint: ChecksumHint::None,
                reply_on_ttl_expired: false,
            },
            &mut out,
        )
        .unwrap();

        let Outcome::Translated { len } = outcome else {
            panic!("expected translation");
        };

        let (headers, payload) = etherparse::IpHeaders::from_ipv6_slice(&out[..len]).unwrap();
        let (ipv6, _) = headers.ipv6().unwrap();
        assert_eq!(ipv6.source_addr(), "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            ipv6.destination_addr(),
            "64:ff9b::808:808".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(ipv6.hop_limit(), 63);

        let (icmpv6_header, icmp_payload) =
            etherparse::Icmpv6Header::from_slice(payload.payload).unwrap();
        assert!(matches!(
            icmpv6_header.icmp_type,
            etherparse::Icmpv6Type::EchoRequest(h) if h.id == 0x1234 && h.seq == 1
        ));

        let pseudo = checksum::pseudo_v6(
            ipv6.source_addr().octets(),
            ipv6.destination_addr().octets(),
            58,
            (payload.payload.len()) as u32,
        );
        let mut full = Vec::new();
        icmpv6_header.write(&mut full).unwrap();
        full.extend_from_slice(icmp_payload);
        assert_eq!(checksum::fold(pseudo + checksum::sum(&full)), 0);
    }

    #[test]
    fn too_big_with_df_set_yields_icmpv4_reply() {
        let mut packet = Vec::new();
        PacketBuilder::ipv4([192, 0, 0, 4], [8, 8, 8, 8], 64)
            .udp(1234, 80)
            .write(&mut packet, &[0u8; 1225])
            .unwrap();
        assert_eq!(packet.len(), 1253);

        let mut out = [0u8; 1500];
        let outcome = translate(
            Request {
                packet: &packet,
                plat: &plat(),
                clat_address: "2001:db8::1".parse().unwrap(),
                ipv4mtu: 1252,
                checksum_hint: ChecksumHint::None,
                reply_on_ttl_expired: false,
            },
            &mut out,
        )
        .unwrap();

        let Outcome::IcmpError { len } = outcome else {
            panic!("expected an ICMP error reply, got {outcome:?}");
        };

        let (headers, payload) = etherparse::IpHeaders::from_ipv4_slice(&out[..len]).unwrap();
        let (ipv4, _) = headers.ipv4().unwrap();
        assert_eq!(ipv4.protocol, IpNumber::ICMP);
        let (icmp_header, _) = Icmpv4Header::from_slice(payload.payload).unwrap();
        assert!(matches!(
            icmp_header.icmp_type,
            Icmpv4Type::DestinationUnreachable(
                etherparse::icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu: 1252 }
            )
        ));
    }

    #[test]
    fn fragmented_udp_outbound_gets_fragment_header() {
        // Fragmented UDP: MF=1, offset=0, id=0xBEEF.
        let mut ipv4 = etherparse::Ipv4Header::new(
            1200,
            64,
            IpNumber::UDP,
            [192, 0, 0, 4],
            [8, 8, 8, 8],
        )
        .unwrap();
        ipv4.identification = 0xBEEF;
        ipv4.more_fragments = true;
        ipv4.dont_fragment = false;
        ipv4.header_checksum = ipv4.calc_header_checksum();

        let mut packet = Vec::new();
        ipv4.write(&mut packet).unwrap();
        packet.extend_from_slice(&vec![0u8; 1200]);

        let mut out = [0u8; 1500];
        let outcome = translate(
            Request {
                packet: &packet,
                plat: &plat(),
                clat_address: "2001:db8::1".parse().unwrap(),
                ipv4mtu: 1472,
                checksum_hint: ChecksumHint::None,
                reply_on_ttl_expired: false,
            },
            &mut out,
        )
        .unwrap();

        let Outcome::Translated { len: _ } = outcome else {
            panic!("expected translation");
        };

        let fragment = FragmentHeader::parse(&out[IPV6_HEADER_LEN..]).unwrap();
        assert_eq!(fragment.next_header, IpNumber::UDP.0);
        assert!(fragment.more_fragments);
        assert_eq!(fragment.fragment_offset, 0);
        assert_eq!(fragment.identification, 0xBEEF);
    }
}
