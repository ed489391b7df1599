//! Process-wide configuration: the config-file format and the derived
//! record every other component borrows read-only.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use clat_proto::addr::PlatPrefix;

use crate::error::DaemonError;

/// Smallest MTU an IPv6 link is allowed to have; also the floor this daemon
/// clamps a configured or discovered uplink MTU to.
pub const MIN_MTU: u16 = 1280;
/// Largest MTU this daemon will configure the tunnel for.
pub const MAX_MTU: u16 = 9000;
/// Bytes an IPv6 header plus the worst-case fragment header costs over the
/// IPv4 equivalent; the default `ipv4mtu` derivation subtracts this.
const MTU_OVERHEAD: u16 = 28;

/// Default local IPv4 subnet the CLAT picks its own address from, per
/// RFC 7335.
pub const DEFAULT_IPV4_LOCAL_SUBNET: Ipv4Addr = Ipv4Addr::new(192, 0, 0, 0);
pub const DEFAULT_IPV4_LOCAL_PREFIXLEN: u8 = 29;

/// RFC 6052's Well-Known Prefix, used when neither `-p` nor the config file
/// names a PLAT prefix.
pub const DEFAULT_PLAT_PREFIX: Ipv6Addr = Ipv6Addr::new(0x0064, 0xff9b, 0, 0, 0, 0, 0, 0);
pub const DEFAULT_PLAT_PREFIX_LEN: u8 = 96;

/// MTU assumed when neither `-c`'s config file nor the uplink interface
/// itself gives the Configurator one to start from.
pub const DEFAULT_MTU: u16 = 1500;

/// The parsed form of the key-value configuration file.
///
/// Every field is optional: a bare CLI invocation with no `-c` is valid, and
/// CLI flags always take precedence over a value found here.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub plat_subnet: Option<Ipv6Addr>,
    pub plat_prefixlen: Option<u8>,
    pub ipv4_local_subnet: Option<Ipv4Addr>,
    pub ipv4_local_prefixlen: Option<u8>,
    pub mtu: Option<u16>,
    pub ipv4mtu: Option<u16>,
}

impl FileConfig {
    /// Parses a simple `key = value` (or `key value`) text file. Blank
    /// lines and lines starting with `#` are ignored; unrecognized keys are
    /// ignored too, so the format stays forward-compatible.
    pub fn parse(contents: &str) -> Result<Self, DaemonError> {
        let mut config = FileConfig::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = split_key_value(line)
                .ok_or_else(|| DaemonError::Config(format!("malformed line: {line:?}")))?;

            match key {
                "plat_subnet" => {
                    config.plat_subnet = Some(value.parse().map_err(|_| {
                        DaemonError::Config(format!("invalid plat_subnet: {value:?}"))
                    })?);
                }
                "ipv4_local_subnet" => {
                    config.ipv4_local_subnet = Some(value.parse().map_err(|_| {
                        DaemonError::Config(format!("invalid ipv4_local_subnet: {value:?}"))
                    })?);
                }
                "ipv4_local_prefixlen" => {
                    config.ipv4_local_prefixlen = Some(value.parse().map_err(|_| {
                        DaemonError::Config(format!("invalid ipv4_local_prefixlen: {value:?}"))
                    })?);
                }
                "mtu" => {
                    config.mtu = Some(
                        value
                            .parse()
                            .map_err(|_| DaemonError::Config(format!("invalid mtu: {value:?}")))?,
                    );
                }
                "ipv4mtu" => {
                    config.ipv4mtu = Some(value.parse().map_err(|_| {
                        DaemonError::Config(format!("invalid ipv4mtu: {value:?}"))
                    })?);
                }
                _ => {}
            }
        }

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&contents)
    }
}

fn split_key_value(line: &str) -> Option<(&str, &str)> {
    if let Some((key, value)) = line.split_once('=') {
        return Some((key.trim(), value.trim()));
    }
    line.split_once(char::is_whitespace)
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// Clamps `mtu` to `[MIN_MTU, MAX_MTU]` and derives `ipv4mtu` unless an
/// explicit (smaller) value was supplied.
///
/// Per the invariant `ipv4mtu + 28 <= mtu`, an explicit `ipv4mtu` that would
/// violate it is clamped down rather than rejected.
pub fn derive_mtus(mtu: u16, explicit_ipv4mtu: Option<u16>) -> (u16, u16) {
    let mtu = mtu.clamp(MIN_MTU, MAX_MTU);
    let derived = mtu - MTU_OVERHEAD;
    let ipv4mtu = match explicit_ipv4mtu {
        Some(v) if v < derived => v,
        _ => derived,
    };
    (mtu, ipv4mtu)
}

/// Process-wide configuration, assembled once by the configurator and
/// borrowed read-only by every other component for the lifetime of a
/// generation.
#[derive(Debug, Clone)]
pub struct Config {
    pub mtu: u16,
    pub ipv4mtu: u16,
    pub plat: PlatPrefix,
    pub ipv4_local_subnet: Ipv4Addr,
    pub ipv4_local_prefixlen: u8,
    pub ipv4_local: Ipv4Addr,
    pub ipv6_local_subnet: Ipv6Addr,
    pub default_pdp_interface: String,
    pub native_ipv6_interface: String,
}

impl Config {
    /// The `/64` of `ipv6_local_subnet`, used by prefix-change detection.
    pub fn uplink_prefix_64(&self) -> [u8; 8] {
        self.ipv6_local_subnet.octets()[..8].try_into().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_equals_and_space_separated_lines() {
        let contents = "\
# a comment
plat_subnet = 64:ff9b::
ipv4_local_subnet 192.0.0.0
ipv4_local_prefixlen=29
mtu 1500
ipv4mtu=1472
";
        let config = FileConfig::parse(contents).unwrap();
        assert_eq!(config.plat_subnet, Some("64:ff9b::".parse().unwrap()));
        assert_eq!(config.ipv4_local_subnet, Some(Ipv4Addr::new(192, 0, 0, 0)));
        assert_eq!(config.ipv4_local_prefixlen, Some(29));
        assert_eq!(config.mtu, Some(1500));
        assert_eq!(config.ipv4mtu, Some(1472));
    }

    #[test]
    fn ignores_blank_lines_and_unknown_keys() {
        let config = FileConfig::parse("\nfoo = bar\n\nmtu = 1400\n").unwrap();
        assert_eq!(config.mtu, Some(1400));
    }

    #[test]
    fn clamps_mtu_to_minimum() {
        let (mtu, ipv4mtu) = derive_mtus(1200, None);
        assert_eq!(mtu, MIN_MTU);
        assert_eq!(ipv4mtu, MIN_MTU - MTU_OVERHEAD);
    }

    #[test]
    fn derives_ipv4mtu_by_default_overhead() {
        let (mtu, ipv4mtu) = derive_mtus(1500, None);
        assert_eq!(mtu, 1500);
        assert_eq!(ipv4mtu, 1472);
    }

    #[test]
    fn honors_explicit_smaller_ipv4mtu() {
        let (_, ipv4mtu) = derive_mtus(1500, Some(1400));
        assert_eq!(ipv4mtu, 1400);
    }

    #[test]
    fn ignores_explicit_ipv4mtu_that_would_violate_the_overhead_invariant() {
        let (mtu, ipv4mtu) = derive_mtus(1500, Some(1490));
        assert_eq!(mtu, 1500);
        assert_eq!(ipv4mtu, 1472);
    }
}
