//! The command-line surface the init system invokes this daemon with.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "clatd", about = "464XLAT CLAT: stateless IPv4/IPv6 translation over an IPv6-only uplink")]
pub struct Cli {
    /// Name of the IPv6 uplink interface.
    #[arg(short = 'i', long = "interface", env = "CLATD_INTERFACE")]
    pub uplink_interface: String,

    /// PLAT prefix, e.g. `64:ff9b::/96`. Overrides any value in the config file.
    #[arg(short = 'p', long = "plat-prefix", env = "CLATD_PLAT_PREFIX")]
    pub plat_prefix: Option<PlatPrefixArg>,

    /// Force the local IPv4 address instead of letting the Configurator pick one.
    #[arg(short = '4', long = "ipv4", env = "CLATD_IPV4_LOCAL")]
    pub ipv4_local: Option<Ipv4Addr>,

    /// Force the CLAT IPv6 address instead of deriving it from the uplink prefix.
    #[arg(short = '6', long = "ipv6", env = "CLATD_IPV6_LOCAL")]
    pub ipv6_local: Option<Ipv6Addr>,

    /// Routing domain / network identifier, passed through to address-resolution helpers.
    #[arg(short = 'n', long = "net-id", env = "CLATD_NET_ID")]
    pub net_id: Option<u32>,

    /// Override the tunnel device name (default: `clat0`).
    #[arg(short = 't', long = "tun-name", default_value = "clat0", env = "CLATD_TUN_NAME")]
    pub tun_name: String,

    /// Path to a key-value configuration file.
    #[arg(short = 'c', long = "config", env = "CLATD_CONFIG")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "CLATD_LOG_FORMAT", default_value_t = LogFormat::Human)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogFormat {
    Json,
    Human,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Human => write!(f, "human"),
        }
    }
}

/// `-p` takes `prefix/len` (e.g. `64:ff9b::/96`); this wrapper gives `clap`
/// a `FromStr` impl that keeps the two halves together on the CLI.
#[derive(Debug, Clone, Copy)]
pub struct PlatPrefixArg {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
}

impl std::str::FromStr for PlatPrefixArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, len) = s
            .split_once('/')
            .ok_or_else(|| format!("expected `prefix/len`, got {s:?}"))?;
        let prefix = prefix
            .parse()
            .map_err(|e| format!("invalid PLAT prefix address {prefix:?}: {e}"))?;
        let prefix_len = len
            .parse()
            .map_err(|e| format!("invalid PLAT prefix length {len:?}: {e}"))?;

        Ok(PlatPrefixArg { prefix, prefix_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plat_prefix_arg() {
        let parsed: PlatPrefixArg = "64:ff9b::/96".parse().unwrap();
        assert_eq!(parsed.prefix, "64:ff9b::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(parsed.prefix_len, 96);
    }

    #[test]
    fn rejects_missing_slash() {
        assert!("64:ff9b::".parse::<PlatPrefixArg>().is_err());
    }
}
