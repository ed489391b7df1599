//! Stateless SIIT/464XLAT packet translation primitives: address algebra
//! (RFC 6052), checksum arithmetic (RFC 1071/1624), and header translation
//! (RFC 7915). No I/O, no allocation on the hot path — callers own the
//! buffers and the event loop.

pub mod addr;
pub mod checksum;
pub mod error;
pub mod fragment;
pub mod icmp;
mod icmpv4_header_slice_mut;
mod icmpv6_header_slice_mut;
mod slice_utils;
mod tcp_header_slice_mut;
mod udp_header_slice_mut;
pub mod translate;

pub use error::{Error, Result};

/// Largest packet this crate's translation functions will handle; matches
/// the maximum size an IPv4 or IPv6 header can declare in its length field.
pub const MAX_PACKET_LEN: usize = 65536;
