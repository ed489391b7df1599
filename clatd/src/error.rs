//! Fatal daemon-level errors: anything that makes the configurator or the
//! privilege gate abort startup.
//!
//! Per-packet failures never reach this type; those are `clat_proto::Error`
//! and are always downgraded to a log line by the supervisor.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("no free address in the local IPv4 subnet")]
    NoFreeAddress,
    #[error("tun device error: {0}")]
    Tun(#[source] io::Error),
    #[error("packet ring error: {0}")]
    Ring(#[source] io::Error),
    #[error("raw IPv6 socket error: {0}")]
    RawSocket(#[source] io::Error),
    #[error("failed to drop privileges: {0}")]
    Privilege(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}
