//! The IPv6 receive side: an `AF_PACKET` socket set to a `TPACKET_V3`
//! memory-mapped ring, bound to the uplink with `ETH_P_IPV6`.
//!
//! The block/frame header layout is hand-rolled against the stable Linux
//! UAPI (`linux/if_packet.h`) rather than pulled from a crate, since the
//! struct shapes are small and stable.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use libc::{
    c_int, c_void, close, mmap, munmap, setsockopt, sockaddr_ll, socket, socklen_t, AF_PACKET,
    MAP_FAILED, MAP_SHARED, PACKET_RX_RING, PACKET_VERSION, PROT_READ, PROT_WRITE, SOCK_DGRAM,
    SOL_PACKET,
};

use crate::error::DaemonError;

/// `ETH_P_IPV6` in network byte order, as required by `socket(2)`'s
/// `protocol` argument (which is always big-endian regardless of host
/// byte order).
pub const ETH_P_IPV6: u16 = 0x86DD;

/// Default ring geometry: 8 blocks of 128 KiB, 2 KiB frames (64 frames per
/// block). Large enough to absorb a burst without the kernel dropping
/// frames before the Supervisor's next readiness wait.
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;
pub const DEFAULT_BLOCK_NR: u32 = 8;
pub const DEFAULT_FRAME_SIZE: u32 = 2048;

const TPACKET_V3: c_int = 7;
/// Mask on `tpacket3_hdr.tp_status`; bit 0 set means "owned by userspace".
const TP_STATUS_USER: u32 = 1 << 0;
const TP_STATUS_KERNEL: u32 = 0;

const PACKET_ADD_MEMBERSHIP: c_int = 1;
const PACKET_MR_PROMISC: c_int = 1;

/// `struct packet_mreq` (`linux/if_packet.h`), used here only for its
/// `PACKET_MR_PROMISC` membership type.
#[repr(C)]
struct packet_mreq {
    mr_ifindex: c_int,
    mr_type: u16,
    mr_alen: u16,
    mr_address: [u8; 8],
}

/// `struct tpacket_req3` (`linux/if_packet.h`).
#[repr(C)]
struct TpacketReq3 {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
    tp_retire_blk_tov: u32,
    tp_sizeof_priv: u32,
    tp_feature_req_word: u16,
}

/// `struct tpacket_hdr_v1` (the only member of the `tpacket_bd_header_u`
/// union this daemon uses).
#[repr(C)]
struct TpacketHdrV1 {
    block_status: u32,
    num_pkts: u32,
    offset_to_first_pkt: u32,
    blk_len: u32,
    seq_num: u64,
    ts_first_pkt_sec: u32,
    ts_first_pkt_nsec: u32,
    ts_last_pkt_sec: u32,
    ts_last_pkt_nsec: u32,
}

/// `struct tpacket_block_desc`'s fixed prefix (`version` + the `hdr` union,
/// read here as its `bh1` variant).
#[repr(C)]
struct TpacketBlockDesc {
    version: u32,
    hdr: TpacketHdrV1,
}

/// `struct tpacket3_hdr`.
#[repr(C)]
struct Tpacket3Hdr {
    tp_next_offset: u32,
    tp_sec: u32,
    tp_nsec: u32,
    tp_snaplen: u32,
    tp_len: u32,
    tp_status: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
    tp_padding: [u8; 4],
}

/// A memory-mapped `TPACKET_V3` receive ring bound to a single interface
/// and protocol, filtered to frames addressed to our CLAT address (the
/// classifier program in `bpf.rs` is attached separately and narrows what
/// actually reaches here).
pub struct PacketRing {
    fd: RawFd,
    map: *mut u8,
    map_len: usize,
    block_size: usize,
    block_nr: usize,
    current_block: usize,
    /// Byte offset of the next unread frame within `current_block`, or
    /// `None` if the block hasn't been walked yet / is exhausted.
    cursor: Option<(usize, u32)>,
}

impl AsRawFd for PacketRing {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PacketRing {
    fn drop(&mut self) {
        unsafe {
            munmap(self.map as *mut c_void, self.map_len);
            close(self.fd);
        }
    }
}

impl PacketRing {
    /// `block_size` and `frame_size` must both be powers of two;
    /// `block_size` must be a multiple of `frame_size`. `block_nr * frame_nr`
    /// bounds the ring's total memory (`IPC_LOCK` covers the resulting
    /// `mlock`ed pages).
    pub fn bind(
        interface_index: i32,
        block_size: u32,
        block_nr: u32,
        frame_size: u32,
    ) -> Result<Self, DaemonError> {
        let fd = match unsafe { socket(AF_PACKET, SOCK_DGRAM, (ETH_P_IPV6 as u16).to_be() as i32) } {
            -1 => return Err(DaemonError::Ring(io::Error::last_os_error())),
            fd => fd,
        };

        let version = TPACKET_V3;
        if unsafe {
            setsockopt(
                fd,
                SOL_PACKET,
                PACKET_VERSION,
                &version as *const c_int as *const c_void,
                std::mem::size_of::<c_int>() as socklen_t,
            )
        } < 0
        {
            let err = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(DaemonError::Ring(err));
        }

        let frame_nr = (block_size / frame_size) * block_nr;
        let req = TpacketReq3 {
            tp_block_size: block_size,
            tp_block_nr: block_nr,
            tp_frame_size: frame_size,
            tp_frame_nr: frame_nr,
            tp_retire_blk_tov: 100,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        };

        if unsafe {
            setsockopt(
                fd,
                SOL_PACKET,
                PACKET_RX_RING,
                &req as *const TpacketReq3 as *const c_void,
                std::mem::size_of::<TpacketReq3>() as socklen_t,
            )
        } < 0
        {
            let err = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(DaemonError::Ring(err));
        }

        let map_len = (block_size as usize) * (block_nr as usize);
        let map = unsafe {
            mmap(
                ptr::null_mut(),
                map_len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            )
        };
        if map == MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { close(fd) };
            return Err(DaemonError::Ring(err));
        }

        let mut sll: sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = AF_PACKET as u16;
        sll.sll_protocol = (ETH_P_IPV6 as u16).to_be();
        sll.sll_ifindex = interface_index;

        if unsafe {
            libc::bind(
                fd,
                &sll as *const sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<sockaddr_ll>() as u32,
            )
        } < 0
        {
            let err = io::Error::last_os_error();
            unsafe {
                munmap(map, map_len);
                close(fd);
            }
            return Err(DaemonError::Ring(err));
        }

        // Our CLAT address is never assigned at the link layer, so frames
        // addressed to it arrive tagged `PACKET_OTHERHOST` and are dropped
        // before reaching userspace unless the interface is in promiscuous
        // mode. `PACKET_ADD_MEMBERSHIP`/`PACKET_MR_PROMISC` scopes that to
        // this socket rather than flipping `IFF_PROMISC` globally.
        let mreq = packet_mreq {
            mr_ifindex: interface_index,
            mr_type: PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        if unsafe {
            setsockopt(
                fd,
                SOL_PACKET,
                PACKET_ADD_MEMBERSHIP,
                &mreq as *const packet_mreq as *const c_void,
                std::mem::size_of::<packet_mreq>() as socklen_t,
            )
        } < 0
        {
            let err = io::Error::last_os_error();
            unsafe {
                munmap(map, map_len);
                close(fd);
            }
            return Err(DaemonError::Ring(err));
        }

        Ok(Self {
            fd,
            map: map as *mut u8,
            map_len,
            block_size: block_size as usize,
            block_nr: block_nr as usize,
            current_block: 0,
            cursor: None,
        })
    }

    fn block_ptr(&self, block: usize) -> *mut u8 {
        unsafe { self.map.add(block * self.block_size) }
    }

    /// Returns the next ready frame's link-layer payload, if any frame is
    /// currently available across the ring's blocks. The classifier
    /// attached in `bpf.rs` means every frame that reaches here is already
    /// destined for our CLAT address.
    pub fn next_frame(&mut self) -> Option<&[u8]> {
        loop {
            let block = self.current_block;
            let block_desc = self.block_ptr(block) as *const TpacketBlockDesc;
            let status = unsafe { ptr::read_volatile(&(*block_desc).hdr.block_status) };

            if status & TP_STATUS_USER == 0 {
                // This block isn't ready; nothing more to read right now.
                return None;
            }

            let (offset, remaining) = match self.cursor {
                Some((offset, remaining)) => (offset, remaining),
                None => {
                    let num_pkts = unsafe { (*block_desc).hdr.num_pkts };
                    let first = unsafe { (*block_desc).hdr.offset_to_first_pkt };
                    (first as usize, num_pkts)
                }
            };

            if remaining == 0 {
                // Done with this block: hand it back to the kernel and
                // move to the next one.
                unsafe {
                    ptr::write_volatile(
                        &(*(block_desc as *mut TpacketBlockDesc)).hdr.block_status,
                        TP_STATUS_KERNEL,
                    );
                }
                self.current_block = (self.current_block + 1) % self.block_nr;
                self.cursor = None;
                continue;
            }

            let frame_hdr = unsafe { self.block_ptr(block).add(offset) as *const Tpacket3Hdr };
            let tp_mac = unsafe { (*frame_hdr).tp_mac } as usize;
            let tp_snaplen = unsafe { (*frame_hdr).tp_snaplen } as usize;
            let tp_next_offset = unsafe { (*frame_hdr).tp_next_offset } as usize;

            let payload = unsafe {
                std::slice::from_raw_parts(self.block_ptr(block).add(offset + tp_mac), tp_snaplen)
            };

            self.cursor = Some((
                if tp_next_offset == 0 {
                    offset
                } else {
                    offset + tp_next_offset
                },
                remaining - 1,
            ));

            return Some(payload);
        }
    }
}
