//! Wrapper over OS-level readiness notification.
//!
//! Backed by `mio`, the pack's standard readiness-based reactor crate.
//! `mio` is edge-triggered on some backends (epoll in edge mode, kqueue);
//! the runtime emulates the level-triggered semantics the rest of the
//! design assumes by having [`crate::stream::InputStream::trigger_rx`] and
//! [`crate::stream::OutputStream::trigger_tx`] drain the socket until
//! `WouldBlock` on every readiness event, rather than trusting a single
//! read/write per notification.

use std::io;
use std::time::Duration;

pub use mio::Token;
pub use mio::Interest;

/// Which direction(s) became ready for a token in one poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

pub(crate) struct Selector {
    poll: mio::Poll,
    events: mio::Events,
}

impl Selector {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(capacity),
        })
    }

    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        self.poll.registry().register(source, token, interest)
    }

    pub fn set_interest<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        self.poll.registry().deregister(source)
    }

    /// Blocks up to `timeout` (no timeout blocks indefinitely) and returns
    /// the ready tokens observed in this poll.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Ready)>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    Ready {
                        readable: e.is_readable(),
                        writable: e.is_writable(),
                    },
                )
            })
            .collect())
    }
}
