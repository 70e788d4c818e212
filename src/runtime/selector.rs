//! Readiness multiplexer: a thin wrapper over `mio::Poll`.
//!
//! Grounded in the teacher's `runtime/mio_impl/event_loop.rs` (register on
//! accept, reregister on phase transition, deregister on close) and in the
//! source's `selector.c` contract (§4.2 of the design): register/deregister
//! per fd, idempotent interest updates, a blocking wait that returns a batch
//! of ready tokens. Unlike the source, there is no handler vtable here — the
//! event loop (`runtime::event_loop`) dispatches on the `Token` itself, the
//! same way the teacher's `mio_impl` matches on `event.token()`.

use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::time::Duration;

/// Wraps `mio::Poll` with a small table tracking each token's last-set
/// interest, so `reregister` is a cheap no-op when nothing actually changed.
pub struct Selector {
    poll: Poll,
    interests: HashMap<Token, Interest>,
}

impl Selector {
    pub fn new() -> io::Result<Self> {
        Ok(Selector {
            poll: Poll::new()?,
            interests: HashMap::new(),
        })
    }

    /// Register a source under `token` with the given interest. Fails if
    /// `token` is already registered.
    pub fn register<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        if self.interests.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        self.poll.registry().register(source, token, interest)?;
        self.interests.insert(token, interest);
        Ok(())
    }

    /// Update the interest for an already-registered token. A no-op if
    /// `interest` matches what's already tracked.
    pub fn reregister<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        if self.interests.get(&token) == Some(&interest) {
            return Ok(());
        }
        self.poll.registry().reregister(source, token, interest)?;
        self.interests.insert(token, interest);
        Ok(())
    }

    /// Remove a registration. Idempotent: deregistering an unknown token is
    /// treated as success, since teardown paths may race a prior
    /// deregistration of the same fd under partial failure.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        if self.interests.remove(&token).is_none() {
            return Ok(());
        }
        self.poll.registry().deregister(source)
    }

    /// Block until at least one descriptor is ready or `timeout` elapses.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.interests.contains_key(&token)
    }

    /// Drop bookkeeping for `token` without touching the OS registration.
    /// Used when the underlying descriptor was already closed (e.g. a
    /// failed outbound connect candidate) — the kernel drops the epoll
    /// registration on close, so calling `deregister` against the dead
    /// source would be both unnecessary and impossible (the source is
    /// gone). The next `register` under the same token then succeeds
    /// instead of failing with `AlreadyExists`.
    pub fn forget(&mut self, token: Token) {
        self.interests.remove(&token);
    }
}
