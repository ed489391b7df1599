//! Entry point: CLI parsing, the configurator, the privilege gate, and
//! handing off to the supervisor's event loop.
//!
//! `fn main() -> ExitCode` wraps an inner `try_main` returning
//! `anyhow::Result`; everything runs synchronously on the calling thread.

mod bpf;
mod cli;
mod config;
mod error;
mod ifconfig;
mod iface;
mod privilege;
mod raw6;
mod ring;
mod signals;
mod supervisor;
mod tun;

use std::os::unix::io::AsRawFd;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use clat_proto::addr::{clat_address, select_local_ipv4, PlatPrefix};

use cli::{Cli, LogFormat};
use config::{Config, FileConfig};
use error::DaemonError;
use iface::RouteProbe;
use raw6::Raw6Socket;
use ring::PacketRing;
use signals::SignalSource;
use supervisor::Supervisor;
use tun::TunDevice;

fn main() -> ExitCode {
    let cli = Cli::parse();

    #[expect(clippy::print_stderr, reason = "no logger has been set up yet")]
    if !privilege::has_necessary_permissions() {
        eprintln!(
            "clatd needs to be executed as `root` or with the `CAP_NET_ADMIN` capability."
        );
        return ExitCode::FAILURE;
    }

    init_logging(cli.log_format);

    match try_main(cli) {
        Ok(()) => {
            tracing::info!("clatd exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .flatten_event(true)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Human => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn try_main(cli: Cli) -> Result<()> {
    tracing::debug!(?cli);

    let config = configure(&cli).context("failed to assemble configuration")?;
    tracing::info!(
        uplink = %cli.uplink_interface,
        clat_address = %config.ipv6_local_subnet,
        ipv4_local = %config.ipv4_local,
        plat_prefix = %config.plat.prefix(),
        plat_prefix_len = config.plat.prefix_len(),
        mtu = config.mtu,
        ipv4mtu = config.ipv4mtu,
        "configuration complete"
    );

    let tun = TunDevice::open(&cli.tun_name).context("failed to open tun device")?;
    tun.configure(config.ipv4_local, config.ipv4mtu)
        .context("failed to configure tun device")?;

    let uplink_ifindex = ifconfig::if_index(&cli.uplink_interface)
        .context("failed to resolve uplink interface index")?;
    ifconfig::add_ipv6_address(&cli.uplink_interface, config.ipv6_local_subnet, 128)
        .context("failed to install CLAT anycast address on uplink")?;

    let raw6 = Raw6Socket::new(cli.net_id).context("failed to create raw IPv6 send socket")?;

    let ring = PacketRing::bind(
        uplink_ifindex,
        ring::DEFAULT_BLOCK_SIZE,
        ring::DEFAULT_BLOCK_NR,
        ring::DEFAULT_FRAME_SIZE,
    )
    .context("failed to bind packet ring to uplink")?;
    bpf::attach(ring.as_raw_fd(), config.ipv6_local_subnet)
        .context("failed to attach classifier to packet ring")?;

    let signals = SignalSource::new().context("failed to install signal handlers")?;

    privilege::drop_to_clat_user().context("failed to drop privileges")?;

    let mut supervisor = Supervisor::new(tun, raw6, ring, signals, config);
    let prefix_changed = supervisor.run().context("event loop failed")?;

    if prefix_changed {
        tracing::info!("uplink prefix changed; a launcher should restart clatd");
    }

    Ok(())
}

/// Assembles the process-wide [`Config`] from the CLI, an optional config
/// file, and uplink discovery.
fn configure(cli: &Cli) -> Result<Config> {
    let file_config = match &cli.config_file {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let requested_mtu = file_config.mtu.unwrap_or(config::DEFAULT_MTU);
    let (mtu, ipv4mtu) = config::derive_mtus(requested_mtu, file_config.ipv4mtu);

    let (plat_prefix, plat_prefix_len) = match cli.plat_prefix {
        Some(arg) => (arg.prefix, arg.prefix_len),
        None => match (file_config.plat_subnet, file_config.plat_prefixlen) {
            (Some(prefix), Some(len)) => (prefix, len),
            _ => (config::DEFAULT_PLAT_PREFIX, config::DEFAULT_PLAT_PREFIX_LEN),
        },
    };
    let plat = PlatPrefix::new(plat_prefix, plat_prefix_len)
        .map_err(|e| DaemonError::Config(format!("invalid PLAT prefix: {e}")))?;

    let ipv4_local_subnet = file_config
        .ipv4_local_subnet
        .unwrap_or(config::DEFAULT_IPV4_LOCAL_SUBNET);
    let ipv4_local_prefixlen = file_config
        .ipv4_local_prefixlen
        .unwrap_or(config::DEFAULT_IPV4_LOCAL_PREFIXLEN);

    let ipv4_local = match cli.ipv4_local {
        Some(addr) => addr,
        None => {
            let mut probe = RouteProbe;
            select_local_ipv4(ipv4_local_subnet, ipv4_local_prefixlen, &mut probe)
                .ok_or(DaemonError::NoFreeAddress)?
        }
    };

    let uplink_prefix = iface::global_unicast_address(&cli.uplink_interface)
        .map_err(|e| DaemonError::Config(format!("cannot read uplink addresses: {e}")))?
        .ok_or_else(|| {
            DaemonError::Config(format!(
                "uplink interface {:?} has no global IPv6 address yet",
                cli.uplink_interface
            ))
        })?;

    let ipv6_local_subnet = cli
        .ipv6_local
        .unwrap_or_else(|| clat_address(uplink_prefix));

    Ok(Config {
        mtu,
        ipv4mtu,
        plat,
        ipv4_local_subnet,
        ipv4_local_prefixlen,
        ipv4_local,
        ipv6_local_subnet,
        default_pdp_interface: cli.uplink_interface.clone(),
        native_ipv6_interface: cli.uplink_interface.clone(),
    })
}
