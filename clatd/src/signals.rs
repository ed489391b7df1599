//! Folds `SIGTERM`/`SIGINT` into the same `mio::Poll` the supervisor already
//! multiplexes tunnel and ring readiness on, via `signal-hook`'s standard
//! self-pipe (`signal_hook_mio::v1_0::Signals`) — the usual way to get POSIX
//! signals into a readiness loop without a second thread or an async
//! runtime.

use std::io;

use mio::{Interest, Registry, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;

pub struct SignalSource {
    signals: Signals,
}

impl SignalSource {
    pub fn new() -> io::Result<Self> {
        let signals = Signals::new([SIGTERM, SIGINT])?;
        Ok(Self { signals })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.signals, token, Interest::READABLE)
    }

    /// Drains pending signals, returning `true` if a termination signal
    /// (`SIGTERM` or `SIGINT`) was among them.
    pub fn poll_termination(&mut self) -> bool {
        self.signals.pending().any(|sig| sig == SIGTERM || sig == SIGINT)
    }
}
