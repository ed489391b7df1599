//! The kernel classifier gating the packet ring: a classic BPF (cBPF)
//! program comparing four 32-bit words — the frame's IPv6 destination
//! address — against our CLAT `/128`, attached via `SO_ATTACH_FILTER`.

use std::io;
use std::net::Ipv6Addr;
use std::os::unix::io::RawFd;

use libc::{sock_filter, sock_fprog, SOL_SOCKET, SO_ATTACH_FILTER};

/// Offset of the IPv6 destination address within the frame this daemon's
/// packet ring delivers (the socket is cooked/`SOCK_DGRAM`, so the frame
/// starts at the IPv6 header itself — see `ring.rs`).
const IPV6_DST_OFFSET: u32 = 24;

// Classic BPF opcodes used below (`linux/filter.h`/`linux/bpf_common.h`).
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Builds the classifier program for `destination`: accept (return the
/// full frame) only if all four 32-bit words of the IPv6 destination
/// address match; otherwise drop (return zero bytes).
fn build_program(destination: Ipv6Addr) -> [sock_filter; 10] {
    let octets = destination.octets();
    let words: [u32; 4] = [
        u32::from_be_bytes(octets[0..4].try_into().unwrap()),
        u32::from_be_bytes(octets[4..8].try_into().unwrap()),
        u32::from_be_bytes(octets[8..12].try_into().unwrap()),
        u32::from_be_bytes(octets[12..16].try_into().unwrap()),
    ];

    [
        stmt(BPF_LD | BPF_W | BPF_ABS, IPV6_DST_OFFSET),
        jump(BPF_JMP | BPF_JEQ | BPF_K, words[0], 0, 7),
        stmt(BPF_LD | BPF_W | BPF_ABS, IPV6_DST_OFFSET + 4),
        jump(BPF_JMP | BPF_JEQ | BPF_K, words[1], 0, 5),
        stmt(BPF_LD | BPF_W | BPF_ABS, IPV6_DST_OFFSET + 8),
        jump(BPF_JMP | BPF_JEQ | BPF_K, words[2], 0, 3),
        stmt(BPF_LD | BPF_W | BPF_ABS, IPV6_DST_OFFSET + 12),
        jump(BPF_JMP | BPF_JEQ | BPF_K, words[3], 0, 1),
        stmt(BPF_RET | BPF_K, u32::MAX),
        stmt(BPF_RET | BPF_K, 0),
    ]
}

/// Attaches (or replaces) the classifier on `fd` so only frames destined
/// for `destination` reach the ring.
///
/// Called again whenever `ipv6_local_subnet` changes; the kernel's
/// `SO_ATTACH_FILTER` simply replaces whatever filter was previously
/// installed on the socket.
pub fn attach(fd: RawFd, destination: Ipv6Addr) -> io::Result<()> {
    let mut program = build_program(destination);
    let fprog = sock_fprog {
        len: program.len() as u16,
        filter: program.as_mut_ptr(),
    };

    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_SOCKET,
            SO_ATTACH_FILTER,
            &fprog as *const sock_fprog as *const libc::c_void,
            std::mem::size_of::<sock_fprog>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_encodes_all_four_words_of_the_address() {
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let program = build_program(addr);

        let loads: Vec<u32> = program
            .iter()
            .filter(|insn| insn.code == (BPF_LD | BPF_W | BPF_ABS))
            .map(|insn| insn.k)
            .collect();
        assert_eq!(
            loads,
            vec![
                IPV6_DST_OFFSET,
                IPV6_DST_OFFSET + 4,
                IPV6_DST_OFFSET + 8,
                IPV6_DST_OFFSET + 12
            ]
        );

        let octets = addr.octets();
        let expected_words: Vec<u32> = octets
            .chunks(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        let compared: Vec<u32> = program
            .iter()
            .filter(|insn| insn.code == (BPF_JMP | BPF_JEQ | BPF_K))
            .map(|insn| insn.k)
            .collect();
        assert_eq!(compared, expected_words);
    }

    #[test]
    fn final_two_instructions_are_accept_then_reject() {
        let program = build_program(Ipv6Addr::UNSPECIFIED);
        assert_eq!(program[8].code, BPF_RET | BPF_K);
        assert_eq!(program[8].k, u32::MAX);
        assert_eq!(program[9].code, BPF_RET | BPF_K);
        assert_eq!(program[9].k, 0);
    }
}
