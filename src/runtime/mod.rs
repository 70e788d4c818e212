//! Readiness-based runtime for the proxy core.
//!
//! A single `mio`-driven event loop (`event_loop::ProxyCore`) dispatches
//! readiness on the SOCKS listener, the management listener, the DNS
//! offload's self-pipe, and every live `Connection`, keeping each socket
//! single-owner in a `Slab` the way the teacher's `mio_impl` backend does.

pub mod connection;
pub mod event_loop;
pub mod ring;
pub mod selector;
mod signal;
