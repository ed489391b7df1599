use std::fmt;

/// Errors the translation engine can hit while processing a single packet.
///
/// None of these are fatal to the daemon: the caller always reacts to an
/// `Error` by dropping the packet (and, where RFC 7915 requires it, emitting
/// an ICMP error of its own).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IPv6 address is not covered by the configured PLAT prefix")]
    NotInPlat,
    #[error("{0} is not a valid PLAT prefix length (must be one of 32, 40, 48, 56, 64, 96)")]
    InvalidPlatPrefixLen(u8),
    #[error("packet could not be represented in the other address family")]
    ImpossibleTranslation,
    #[error("packet is malformed: {reason}")]
    Malformed { reason: String },
    #[error("next-header {next_header} is not supported by this translator")]
    Unsupported { next_header: u8 },
}

impl Error {
    pub(crate) fn malformed(reason: impl fmt::Display) -> Self {
        Error::Malformed {
            reason: reason.to_string(),
        }
    }
}

/// Lets call sites that only care about "this ICMP message has no IPv4/IPv6
/// counterpart" use `.ok_or(ImpossibleTranslation)?` without constructing the
/// full [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImpossibleTranslation;

impl fmt::Display for ImpossibleTranslation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packet could not be represented in the other address family")
    }
}

impl std::error::Error for ImpossibleTranslation {}

impl From<ImpossibleTranslation> for Error {
    fn from(_: ImpossibleTranslation) -> Self {
        Error::ImpossibleTranslation
    }
}

pub type Result<T> = std::result::Result<T, Error>;
