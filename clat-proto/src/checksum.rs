//! One's-complement checksum arithmetic (RFC 1071) and incremental checksum
//! adjustment (RFC 1624).
//!
//! Translating a header in place changes some of the fields covered by a
//! checksum (addresses, sometimes the protocol/length fields) without
//! touching the payload. Recomputing the whole checksum from scratch is
//! correct but means re-reading the entire packet body; `adjust` instead
//! updates the existing checksum using only the bytes that changed, which is
//! what keeps the translator's steady-state cost independent of payload size.

/// Computes the 32-bit (unfolded) one's-complement sum of `bytes`.
///
/// An odd trailing byte is treated as the high byte of a final 16-bit word
/// (per RFC 1071 section 4.1).
pub fn sum(bytes: &[u8]) -> u32 {
    let mut acc: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);

    for chunk in &mut chunks {
        acc += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }

    if let [last] = chunks.remainder() {
        acc += u32::from(u16::from_be_bytes([*last, 0]));
    }

    acc
}

/// Folds a 32-bit accumulated sum into its final 16-bit one's-complement
/// checksum (carries folded in, then complemented).
pub fn fold(acc: u32) -> u16 {
    !fold_no_complement(acc)
}

/// Computes the IPv4 pseudo-header sum used by UDP/TCP/ICMP checksums.
pub fn pseudo_v4(src: [u8; 4], dst: [u8; 4], protocol: u8, len: u16) -> u32 {
    sum(&src) + sum(&dst) + u32::from(protocol) + u32::from(len)
}

/// Computes the IPv6 pseudo-header sum used by UDP/TCP/ICMPv6 checksums.
pub fn pseudo_v6(src: [u8; 16], dst: [u8; 16], next_header: u8, len: u32) -> u32 {
    sum(&src) + sum(&dst) + u32::from(next_header) + len
}

/// Incrementally adjusts a checksum per RFC 1624 equation 3:
///
/// `HC' = ~(~HC + ~m + m')`
///
/// where `m`/`m'` are the 16-bit one's-complement sums of the old/new bytes
/// that changed. `old_data`/`new_data` need not be the same length as a
/// single 16-bit word — they are first folded down to one, so a whole
/// changed field (e.g. a 4- or 16-byte address) can be passed in one call.
pub fn adjust(old_checksum: u16, old_data: &[u8], new_data: &[u8]) -> u16 {
    let m = fold_no_complement(sum(old_data));
    let m_prime = fold_no_complement(sum(new_data));

    let acc = u32::from(!old_checksum) + u32::from(!m) + u32::from(m_prime);

    fold(acc)
}

/// Incrementally adjusts a checksum using two already-computed unfolded
/// sums (e.g. the output of [`pseudo_v4`]/[`pseudo_v6`]) rather than raw
/// bytes. Used when the old and new pseudo-headers don't share a byte
/// layout (translating addresses across families also changes how the
/// length and next-header/protocol fields are encoded).
pub fn adjust_sums(old_checksum: u16, old_sum: u32, new_sum: u32) -> u16 {
    let m = fold_no_complement(old_sum);
    let m_prime = fold_no_complement(new_sum);

    let acc = u32::from(!old_checksum) + u32::from(!m) + u32::from(m_prime);

    fold(acc)
}

/// Folds carries into 16 bits without the final one's-complement negation
/// that [`fold`] applies.
fn fold_no_complement(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }

    acc as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_complement_of_carry_folded_sum() {
        // Two 16-bit words that sum with a carry out of the top.
        let s = sum(&[0xFF, 0xFF, 0x00, 0x01]);
        assert_eq!(s, 0x1_0000);
        assert_eq!(fold(s), !0x0001u16);
    }

    #[test]
    fn sum_handles_odd_length() {
        let s = sum(&[0x12, 0x34, 0x56]);
        assert_eq!(s, 0x1234 + 0x5600);
    }

    #[test]
    fn adjust_matches_full_recompute_for_address_substitution() {
        let old_src = [192u8, 0, 2, 1];
        let new_src = [198u8, 51, 100, 1];
        let dst = [203u8, 0, 113, 1];

        let old_checksum = fold(pseudo_v4(old_src, dst, 17, 8));
        let adjusted = adjust(old_checksum, &old_src, &new_src);

        let expected = fold(pseudo_v4(new_src, dst, 17, 8));
        assert_eq!(adjusted, expected);
    }

    #[test]
    fn adjust_sums_matches_full_recompute_across_address_families() {
        let v4_src = [192u8, 0, 2, 1];
        let v4_dst = [192u8, 0, 2, 2];
        let v6_src = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let v6_dst = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];

        let old_pseudo = pseudo_v4(v4_src, v4_dst, 17, 16);
        let new_pseudo = pseudo_v6(v6_src, v6_dst, 17, 16);

        let old_checksum = fold(old_pseudo);
        let adjusted = adjust_sums(old_checksum, old_pseudo, new_pseudo);

        assert_eq!(adjusted, fold(new_pseudo));
    }

    #[test]
    fn adjust_is_a_no_op_when_data_is_unchanged() {
        let data = [1u8, 2, 3, 4];
        let checksum = fold(sum(&data));
        assert_eq!(adjust(checksum, &data, &data), checksum);
    }
}
