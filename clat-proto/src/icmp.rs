//! ICMPv4 <-> ICMPv6 type/code translation tables, per RFC 7915 sections 4.2
//! (v6->v4) and 5.2 (v4->v6).
//!
//! Only the message types whose semantics carry across address families are
//! translated; everything else (single-hop messages, MLD, neighbor
//! discovery, obsolete timestamp queries) is silently dropped, matching the
//! RFC's own disposition for those messages.

use std::io::Cursor;
use std::net::Ipv6Addr;

use etherparse::{
    Icmpv4Header, Icmpv4Type, Icmpv6Header, Icmpv6Type, IpNumber, Ipv4Header, Ipv4HeaderSlice,
    Ipv6Header, Ipv6HeaderSlice, icmpv4,
    icmpv6::{self, ParameterProblemHeader},
};

use crate::error::{Error, ImpossibleTranslation, Result};
use crate::icmpv4_header_slice_mut::Icmpv4HeaderSliceMut;
use crate::icmpv6_header_slice_mut::Icmpv6HeaderSliceMut;

/// How many bytes of the offending datagram RFC 792/4443 ask us to quote
/// back in an ICMP error: its own header plus the first 8 bytes of its
/// payload, which is enough for the sender to identify the flow.
const QUOTE_HEADER_PLUS_BYTES: usize = 8;

/// RFC 1191 plateau values, used to guess a path MTU when an IPv4 router
/// reports a zero next-hop MTU in a Fragmentation Needed message.
const PLATEAU_VALUES: [u16; 10] = [68, 296, 508, 1006, 1492, 2002, 4352, 8166, 32000, 65535];

/// Translates an ICMPv4 header into its ICMPv6 counterpart.
///
/// `total_length` is the original IPv4 packet's total length, needed to
/// pick a plateau MTU value when the original router didn't report one.
pub fn translate_icmpv4_header(
    total_length: u16,
    icmpv4_header: Icmpv4Header,
) -> Result<Icmpv6Header, ImpossibleTranslation> {
    let icmpv6_type = match icmpv4_header.icmp_type {
        // Echo and Echo Reply (Type 8 and Type 0): adjust the Type values
        // to 128 and 129, respectively.
        Icmpv4Type::EchoRequest(header) => Icmpv6Type::EchoRequest(header),
        Icmpv4Type::EchoReply(header) => Icmpv6Type::EchoReply(header),

        // Time Exceeded (Type 11): set the Type to 3; the Code is unchanged.
        Icmpv4Type::TimeExceeded(i) => Icmpv6Type::TimeExceeded(
            icmpv6::TimeExceededCode::from_u8(i.code_u8()).ok_or(ImpossibleTranslation)?,
        ),

        // Destination Unreachable (Type 3): translate the Code, set Type to 1.
        Icmpv4Type::DestinationUnreachable(i) => {
            translate_icmp_unreachable(i, total_length).ok_or(ImpossibleTranslation)?
        }
        Icmpv4Type::Redirect(_) => return Err(ImpossibleTranslation),
        Icmpv4Type::ParameterProblem(_) => return Err(ImpossibleTranslation),

        // Timestamp / Timestamp Reply: obsoleted in ICMPv6, silently dropped.
        Icmpv4Type::TimestampRequest(_) | Icmpv4Type::TimestampReply(_) => {
            return Err(ImpossibleTranslation);
        }

        // Unknown ICMPv4 types and IGMP-adjacent messages: silently dropped.
        Icmpv4Type::Unknown { .. } => return Err(ImpossibleTranslation),
    };

    Ok(Icmpv6Header::new(icmpv6_type))
}

/// Translates an ICMPv6 header into its ICMPv4 counterpart.
pub fn translate_icmpv6_header(
    icmpv6_header: Icmpv6Header,
) -> Result<Icmpv4Header, ImpossibleTranslation> {
    let icmpv4_type = match icmpv6_header.icmp_type {
        // Echo Request and Echo Reply (Type 128 and 129): adjust the Type
        // values to 8 and 0, respectively.
        Icmpv6Type::EchoRequest(header) => Icmpv4Type::EchoRequest(header),
        Icmpv6Type::EchoReply(header) => Icmpv4Type::EchoReply(header),

        // Destination Unreachable (Type 1): set the Type to 3.
        Icmpv6Type::DestinationUnreachable(i) => {
            Icmpv4Type::DestinationUnreachable(translate_dest_unreachable(i)?)
        }
        Icmpv6Type::PacketTooBig { mtu } => {
            Icmpv4Type::DestinationUnreachable(translate_packet_too_big(mtu))
        }

        // Time Exceeded (Type 3): set the Type to 11; the Code is unchanged.
        Icmpv6Type::TimeExceeded(code) => Icmpv4Type::TimeExceeded(
            icmpv4::TimeExceededCode::from_u8(code.code_u8()).ok_or(ImpossibleTranslation)?,
        ),

        Icmpv6Type::ParameterProblem(i) => {
            use icmpv6::ParameterProblemCode::*;

            match i.code {
                // Code 0: set to Type 12, Code 0, with the pointer adjusted.
                // We do not currently track the pointer translation table,
                // so this is silently dropped rather than mistranslated.
                ErroneousHeaderField => return Err(ImpossibleTranslation),

                // Code 1: translate to an ICMPv4 protocol unreachable.
                UnrecognizedNextHeader => {
                    Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Protocol)
                }

                // Code 2 and unknown error messages: silently dropped.
                UnrecognizedIpv6Option
                | Ipv6FirstFragmentIncompleteHeaderChain
                | SrUpperLayerHeaderError
                | UnrecognizedNextHeaderByIntermediateNode
                | ExtensionHeaderTooBig
                | ExtensionHeaderChainTooLong
                | TooManyExtensionHeaders
                | TooManyOptionsInExtensionHeader
                | OptionTooBig => return Err(ImpossibleTranslation),
            }
        }

        // MLD and Neighbor Discovery messages: single-hop, silently dropped.
        // Unknown informational messages: silently dropped.
        Icmpv6Type::Unknown { .. } => return Err(ImpossibleTranslation),
    };

    Ok(Icmpv4Header::new(icmpv4_type))
}

/// Minimum IPv6 MTU (RFC 8200 section 5); an inbound Packet Too Big
/// reporting anything smaller is clamped up to this before converting to
/// an IPv4 next-hop MTU.
const MIN_IPV6_MTU: u32 = 1280;

pub fn translate_packet_too_big(mtu: u32) -> icmpv4::DestUnreachableHeader {
    // Clamp to the IPv6 minimum first, then convert to an IPv4 MTU the
    // same way the Configurator derives `ipv4mtu` from `mtu` (mtu - 28),
    // so a reported MTU of 1280 yields 1252.
    let mtu = mtu.max(MIN_IPV6_MTU);
    let ipv4_mtu = u16::try_from(mtu.saturating_sub(28)).unwrap_or(u16::MAX);

    icmpv4::DestUnreachableHeader::FragmentationNeeded {
        next_hop_mtu: ipv4_mtu,
    }
}

pub fn translate_dest_unreachable(
    code: icmpv6::DestUnreachableCode,
) -> Result<icmpv4::DestUnreachableHeader, ImpossibleTranslation> {
    use icmpv4::DestUnreachableHeader::*;
    use icmpv6::DestUnreachableCode::*;

    Ok(match code {
        NoRoute => Host,
        Prohibited => HostProhibited,
        BeyondScope => Host,
        Address => Host,
        icmpv6::DestUnreachableCode::Port => icmpv4::DestUnreachableHeader::Port,
        SourceAddressFailedPolicy | RejectRoute => return Err(ImpossibleTranslation),
    })
}

pub fn translate_icmp_unreachable(
    header: icmpv4::DestUnreachableHeader,
    total_length: u16,
) -> Option<Icmpv6Type> {
    use icmpv4::DestUnreachableHeader::*;
    use icmpv6::DestUnreachableCode::*;

    Some(match header {
        // Net/Host Unreachable: set the Code to 0 (No route to destination).
        Network | Host => Icmpv6Type::DestinationUnreachable(NoRoute),

        // Protocol Unreachable: translate to Parameter Problem pointing at
        // the Next Header field, which always sits at a fixed offset.
        Protocol => Icmpv6Type::ParameterProblem(ParameterProblemHeader {
            code: icmpv6::ParameterProblemCode::UnrecognizedNextHeader,
            pointer: 6,
        }),

        // Port Unreachable: set the Code to 4.
        icmpv4::DestUnreachableHeader::Port => {
            Icmpv6Type::DestinationUnreachable(icmpv6::DestUnreachableCode::Port)
        }

        // Fragmentation Needed and DF was set: translate to Packet Too Big.
        // If the router didn't report an MTU, fall back to RFC 1191
        // plateau values based on the packet's own total length.
        FragmentationNeeded { next_hop_mtu: 0 } => {
            let mtu = PLATEAU_VALUES
                .into_iter()
                .filter(|mtu| *mtu < total_length)
                .max()?;

            Icmpv6Type::PacketTooBig { mtu: u32::from(mtu) }
        }
        FragmentationNeeded { next_hop_mtu } => Icmpv6Type::PacketTooBig {
            mtu: u32::from(next_hop_mtu) + 20,
        },

        SourceRouteFailed => Icmpv6Type::DestinationUnreachable(NoRoute),
        NetworkUnknown | HostUnknown | Isolated => Icmpv6Type::DestinationUnreachable(NoRoute),
        NetworkProhibited | HostProhibited => Icmpv6Type::DestinationUnreachable(Prohibited),
        TosNetwork | TosHost => Icmpv6Type::DestinationUnreachable(NoRoute),
        FilterProhibited => Icmpv6Type::DestinationUnreachable(Prohibited),
        HostPrecedenceViolation => return None,
        PrecedenceCutoff => Icmpv6Type::DestinationUnreachable(Prohibited),
    })
}

/// Builds an ICMPv4 "Fragmentation Needed" (type 3, code 4) reply to
/// `original`, an IPv4 datagram that could not be translated because DF
/// was set and it would not fit in `next_hop_mtu` bytes after translation.
///
/// This daemon is the only thing on the other end of the tunnel, so the
/// reply is addressed back to `original`'s own source — the same single
/// address the tunnel's local side owns.
pub fn build_v4_fragmentation_needed(original: &[u8], next_hop_mtu: u16, out: &mut [u8]) -> Result<usize> {
    build_v4_error(
        original,
        Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::FragmentationNeeded {
            next_hop_mtu,
        }),
        out,
    )
}

/// Builds an ICMPv4 "Time Exceeded in Transit" (type 11, code 0) reply.
pub fn build_v4_time_exceeded(original: &[u8], out: &mut [u8]) -> Result<usize> {
    build_v4_error(
        original,
        Icmpv4Type::TimeExceeded(icmpv4::TimeExceededCode::TtlExceededInTransit),
        out,
    )
}

fn build_v4_error(original: &[u8], icmp_type: Icmpv4Type, out: &mut [u8]) -> Result<usize> {
    let ipv4 = Ipv4HeaderSlice::from_slice(original)
        .map_err(|e| Error::malformed(format!("invalid IPv4 header in ICMP-error path: {e}")))?;
    let quoted_len = (ipv4.slice().len() + QUOTE_HEADER_PLUS_BYTES).min(original.len());
    let quoted = &original[..quoted_len];

    let icmp_header = Icmpv4Header::new(icmp_type);
    let icmp_len = icmp_header.header_len() + quoted.len();

    let mut reply = Ipv4Header::new(icmp_len as u16, 64, IpNumber::ICMP, ipv4.source(), ipv4.source())
        .map_err(|e| Error::malformed(format!("ICMP reply too large: {e}")))?;
    reply.header_checksum = reply.calc_header_checksum();

    let ip_header_len = reply.header_len();
    let total = ip_header_len + icmp_len;
    if total > out.len() {
        return Err(Error::malformed("ICMP error reply exceeds scratch buffer"));
    }

    reply
        .write(&mut Cursor::new(&mut out[..ip_header_len]))
        .map_err(|e| Error::malformed(format!("failed to write IPv4 header: {e}")))?;

    let icmp_start = ip_header_len;
    icmp_header
        .write(&mut Cursor::new(&mut out[icmp_start..]))
        .map_err(|e| Error::malformed(format!("failed to write ICMPv4 header: {e}")))?;

    let payload_start = icmp_start + icmp_header.header_len();
    out[payload_start..payload_start + quoted.len()].copy_from_slice(quoted);

    let checksum = icmp_header
        .icmp_type
        .calc_checksum(&out[payload_start..payload_start + quoted.len()]);
    Icmpv4HeaderSliceMut::from_slice(&mut out[icmp_start..payload_start + quoted.len()])
        .map_err(|e| Error::malformed(format!("{e}")))?
        .set_checksum(checksum);

    Ok(total)
}

/// Builds an ICMPv6 "Packet Too Big" reply to `original`, an IPv6
/// datagram that did not fit within `mtu` bytes once translated to IPv4.
/// Addressed from this daemon's own CLAT address back to the original
/// (PLAT-embedded) sender, since the IPv6 side does have a real routable
/// identity unlike the tunnel's single IPv4 address.
pub fn build_v6_packet_too_big(
    original: &[u8],
    clat_address: Ipv6Addr,
    mtu: u32,
    out: &mut [u8],
) -> Result<usize> {
    build_v6_error(original, clat_address, Icmpv6Type::PacketTooBig { mtu }, out)
}

/// Builds an ICMPv6 "Hop Limit Exceeded in Transit" reply.
pub fn build_v6_time_exceeded(original: &[u8], clat_address: Ipv6Addr, out: &mut [u8]) -> Result<usize> {
    build_v6_error(
        original,
        clat_address,
        Icmpv6Type::TimeExceeded(icmpv6::TimeExceededCode::HopLimitExceeded),
        out,
    )
}

fn build_v6_error(original: &[u8], clat_address: Ipv6Addr, icmp_type: Icmpv6Type, out: &mut [u8]) -> Result<usize> {
    let ipv6 = Ipv6HeaderSlice::from_slice(original)
        .map_err(|e| Error::malformed(format!("invalid IPv6 header in ICMP-error path: {e}")))?;
    let quoted_len = (Ipv6Header::LEN + QUOTE_HEADER_PLUS_BYTES).min(original.len());
    let quoted = &original[..quoted_len];

    let icmp_header = Icmpv6Header::new(icmp_type);
    let icmp_len = icmp_header.header_len() + quoted.len();

    let reply = Ipv6Header {
        traffic_class: 0,
        flow_label: etherparse::Ipv6FlowLabel::ZERO,
        payload_length: icmp_len as u16,
        next_header: IpNumber::IPV6_ICMP,
        hop_limit: 64,
        source: clat_address.octets(),
        destination: ipv6.source(),
    };

    let total = Ipv6Header::LEN + icmp_len;
    if total > out.len() {
        return Err(Error::malformed("ICMP error reply exceeds scratch buffer"));
    }

    reply
        .write(&mut Cursor::new(&mut out[..Ipv6Header::LEN]))
        .map_err(|e| Error::malformed(format!("failed to write IPv6 header: {e}")))?;

    let icmp_start = Ipv6Header::LEN;
    icmp_header
        .write(&mut Cursor::new(&mut out[icmp_start..]))
        .map_err(|e| Error::malformed(format!("failed to write ICMPv6 header: {e}")))?;

    let payload_start = icmp_start + icmp_header.header_len();
    out[payload_start..payload_start + quoted.len()].copy_from_slice(quoted);

    let checksum = icmp_header
        .icmp_type
        .calc_checksum(reply.source, reply.destination, &out[payload_start..payload_start + quoted.len()])
        .map_err(|e| Error::malformed(format!("failed to compute ICMPv6 checksum: {e}")))?;
    Icmpv6HeaderSliceMut::from_slice(&mut out[icmp_start..payload_start + quoted.len()])
        .map_err(|e| Error::malformed(format!("{e}")))?
        .set_checksum(checksum);

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::icmpv4::EchoHeader;

    #[test]
    fn echo_request_round_trips() {
        let echo = EchoHeader { id: 7, seq: 1 };
        let v6 = translate_icmpv4_header(84, Icmpv4Header::new(Icmpv4Type::EchoRequest(echo)))
            .unwrap();
        assert!(matches!(v6.icmp_type, Icmpv6Type::EchoRequest(h) if h == echo));

        let v4 = translate_icmpv6_header(v6).unwrap();
        assert!(matches!(v4.icmp_type, Icmpv4Type::EchoRequest(h) if h == echo));
    }

    #[test]
    fn packet_too_big_accounts_for_header_delta() {
        let header = translate_packet_too_big(1500);
        assert_eq!(
            header,
            icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu: 1472 }
        );
    }

    #[test]
    fn packet_too_big_clamps_sub_minimum_mtu_to_1252() {
        let header = translate_packet_too_big(1000);
        assert_eq!(
            header,
            icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu: 1252 }
        );

        let header_at_min = translate_packet_too_big(1280);
        assert_eq!(
            header_at_min,
            icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu: 1252 }
        );
    }

    #[test]
    fn fragmentation_needed_without_mtu_uses_plateau() {
        let result = translate_icmp_unreachable(
            icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu: 0 },
            600,
        );
        assert_eq!(result, Some(Icmpv6Type::PacketTooBig { mtu: 508 }));
    }

    #[test]
    fn unknown_icmpv4_type_is_dropped() {
        let result = translate_icmpv4_header(
            28,
            Icmpv4Header::new(Icmpv4Type::Unknown {
                type_u8: 253,
                code_u8: 0,
                bytes5to8: [0; 4],
            }),
        );
        assert_eq!(result, Err(ImpossibleTranslation));
    }

    #[test]
    fn v4_fragmentation_needed_reply_is_addressed_to_sender() {
        let mut original = Vec::new();
        etherparse::PacketBuilder::ipv4([192, 0, 0, 4], [8, 8, 8, 8], 64)
            .udp(1, 2)
            .write(&mut original, &[0u8; 32])
            .unwrap();

        let mut out = [0u8; 100];
        let len = build_v4_fragmentation_needed(&original, 1232, &mut out).unwrap();

        let (headers, payload) = etherparse::IpHeaders::from_ipv4_slice(&out[..len]).unwrap();
        let (ipv4, _) = headers.ipv4().unwrap();
        assert_eq!(ipv4.source, [192, 0, 0, 4]);
        assert_eq!(ipv4.destination, [192, 0, 0, 4]);
        assert_eq!(ipv4.protocol, IpNumber::ICMP);

        let (icmp_header, _) = Icmpv4Header::from_slice(payload.payload).unwrap();
        assert_eq!(
            icmp_header.icmp_type,
            Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::FragmentationNeeded {
                next_hop_mtu: 1232
            })
        );
    }

    #[test]
    fn v6_packet_too_big_reply_is_addressed_to_sender() {
        let remote_sender: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
        let clat_address: Ipv6Addr = "2001:db8::1".parse().unwrap();

        let mut original = Vec::new();
        etherparse::PacketBuilder::ipv6(remote_sender.octets(), clat_address.octets(), 64)
            .udp(1, 2)
            .write(&mut original, &[0u8; 32])
            .unwrap();

        let mut out = [0u8; 100];
        let len = build_v6_packet_too_big(&original, clat_address, 1280, &mut out).unwrap();

        let (headers, payload) = etherparse::IpHeaders::from_ipv6_slice(&out[..len]).unwrap();
        let (ipv6, _) = headers.ipv6().unwrap();
        assert_eq!(ipv6.source_addr(), clat_address);
        assert_eq!(ipv6.destination_addr(), remote_sender);

        let (icmp_header, _) = Icmpv6Header::from_slice(payload.payload).unwrap();
        assert_eq!(icmp_header.icmp_type, Icmpv6Type::PacketTooBig { mtu: 1280 });
    }
}
