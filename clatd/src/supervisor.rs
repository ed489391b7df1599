//! The event loop: one readiness-multiplex step per iteration over
//! `{read_fd6, fd4}`, plus a periodic prefix-change check.
//!
//! `mio::Poll`/`mio::Events` with a bounded timeout, looping past
//! `io::ErrorKind::Interrupted`, runs on the main thread — there is exactly
//! one execution context, by design.

use std::io;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use clat_proto::translate::{v4_to_v6, v6_to_v4, ChecksumHint, Outcome};

use crate::config::Config;
use crate::iface;
use crate::raw6::Raw6Socket;
use crate::ring::PacketRing;
use crate::signals::SignalSource;
use crate::tun::TunDevice;

const TUN_TOKEN: mio::Token = mio::Token(0);
const RING_TOKEN: mio::Token = mio::Token(1);
const SIGNAL_TOKEN: mio::Token = mio::Token(2);

/// Upper bound on how often prefix-change detection runs; never faster
/// than once a second.
const INTERFACE_POLL_FREQUENCY: Duration = Duration::from_secs(5);
/// How long a readiness wait blocks when there is no other work pending —
/// the loop's one suspension point.
const NO_TRAFFIC_INTERFACE_POLL_FREQUENCY: Duration = Duration::from_secs(1);

pub struct Supervisor {
    tun: TunDevice,
    raw6: Raw6Socket,
    ring: PacketRing,
    signals: SignalSource,
    config: Config,
    /// Holds a packet read off the tun device until it's translated. Owned
    /// by the supervisor and reused in place across packets — this daemon
    /// is single-threaded, so there is no cross-task sharing to pool
    /// against.
    tun_buf: Vec<u8>,
    /// Holds the translated output of whichever direction ran most
    /// recently, likewise reused in place.
    scratch: Vec<u8>,
    running: bool,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tun: TunDevice,
        raw6: Raw6Socket,
        ring: PacketRing,
        signals: SignalSource,
        config: Config,
    ) -> Self {
        Self {
            tun,
            raw6,
            ring,
            signals,
            config,
            tun_buf: vec![0u8; clat_proto::MAX_PACKET_LEN],
            scratch: vec![0u8; clat_proto::MAX_PACKET_LEN],
            running: true,
        }
    }

    /// Runs until `SIGTERM`/`SIGINT`, tun EOF, or an uplink prefix change.
    /// Returns `true` if the caller should restart (prefix changed).
    pub fn run(&mut self) -> io::Result<bool> {
        let mut poll = mio::Poll::new()?;
        let mut events = mio::Events::with_capacity(16);

        poll.registry().register(
            &mut mio::unix::SourceFd(&self.tun.as_raw_fd()),
            TUN_TOKEN,
            mio::Interest::READABLE,
        )?;
        poll.registry().register(
            &mut mio::unix::SourceFd(&self.ring.as_raw_fd()),
            RING_TOKEN,
            mio::Interest::READABLE,
        )?;
        self.signals.register(poll.registry(), SIGNAL_TOKEN)?;

        let mut last_poll = Instant::now();
        let mut should_restart = false;

        while self.running {
            match poll.poll(&mut events, Some(NO_TRAFFIC_INTERFACE_POLL_FREQUENCY)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    RING_TOKEN => {
                        if event.is_error() {
                            self.clear_ring_error();
                        } else {
                            self.drain_ring();
                        }
                    }
                    TUN_TOKEN => {
                        self.drain_tun();
                    }
                    SIGNAL_TOKEN => {
                        if self.signals.poll_termination() {
                            self.running = false;
                        }
                    }
                    _ => {}
                }
            }

            if last_poll.elapsed() >= INTERFACE_POLL_FREQUENCY {
                last_poll = Instant::now();
                if self.prefix_changed() {
                    tracing::info!("uplink IPv6 prefix changed; exiting for restart");
                    should_restart = true;
                    self.running = false;
                }
            }
        }

        Ok(should_restart)
    }

    fn clear_ring_error(&mut self) {
        tracing::warn!("packet ring reported an error condition");
        let _ = self.ring.next_frame();
    }

    fn drain_ring(&mut self) {
        loop {
            let Some(frame) = self.ring.next_frame() else {
                return;
            };

            let request = v6_to_v4::Request {
                packet: frame,
                plat: &self.config.plat,
                clat_address: self.config.ipv6_local_subnet,
                ipv4_local: self.config.ipv4_local,
                mtu: self.config.ipv4mtu,
                checksum_hint: ChecksumHint::None,
                reply_on_hop_limit_expired: false,
            };

            // `frame` and `self.scratch` alias disjoint memory (the ring's
            // mmap vs. our own buffer), so this split-borrow is sound.
            let scratch = &mut self.scratch[..];
            match v6_to_v4::translate(request, scratch) {
                Ok(Outcome::Translated { len }) => {
                    if let Err(e) = self.tun.write(&scratch[..len]) {
                        tracing::warn!(%e, "dropping packet: tun write failed");
                    }
                }
                Ok(Outcome::IcmpError { len }) => {
                    // The reply is an ICMPv6 error (RFC 7915 ss.5's
                    // original-address-family rule), so it goes back out
                    // the endpoint the packet arrived on, not the tunnel.
                    if let Err(e) = self
                        .raw6
                        .send_to(&scratch[..len], destination_of(&scratch[..len]), 0)
                    {
                        tracing::warn!(%e, "dropping ICMPv6 reply: raw6 send failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(%e, "dropping malformed IPv6 packet");
                }
            }
        }
    }

    fn drain_tun(&mut self) {
        loop {
            let payload = match self.tun.read(&mut self.tun_buf) {
                Ok((info, _)) if info.proto != crate::tun::ETH_P_IP => {
                    tracing::trace!(proto = info.proto, "ignoring non-IPv4 tun frame");
                    continue;
                }
                Ok((_info, payload)) => payload,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::info!("tun device removed; exiting");
                    self.running = false;
                    return;
                }
                Err(e) => {
                    tracing::warn!(%e, "tun read failed");
                    return;
                }
            };

            let request = v4_to_v6::Request {
                packet: payload,
                plat: &self.config.plat,
                clat_address: self.config.ipv6_local_subnet,
                ipv4mtu: self.config.ipv4mtu,
                checksum_hint: ChecksumHint::None,
                reply_on_ttl_expired: false,
            };

            let scratch = &mut self.scratch[..];
            match v4_to_v6::translate(request, scratch) {
                Ok(Outcome::Translated { len }) => {
                    if let Err(e) = self
                        .raw6
                        .send_to(&scratch[..len], destination_of(&scratch[..len]), 0)
                    {
                        tracing::warn!(%e, "dropping packet: raw6 send failed");
                    }
                }
                Ok(Outcome::IcmpError { len }) => {
                    if let Err(e) = self.tun.write(&scratch[..len]) {
                        tracing::warn!(%e, "dropping ICMP reply: tun write failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(%e, "dropping malformed IPv4 packet");
                }
            }
        }
    }

    fn prefix_changed(&self) -> bool {
        let Ok(Some(current)) = iface::global_unicast_address(&self.config.default_pdp_interface)
        else {
            return false;
        };

        let current_prefix: [u8; 8] = current.octets()[..8].try_into().unwrap();
        current_prefix != self.config.uplink_prefix_64()
    }
}

fn destination_of(ipv6_packet: &[u8]) -> std::net::Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&ipv6_packet[24..40]);
    std::net::Ipv6Addr::from(octets)
}
