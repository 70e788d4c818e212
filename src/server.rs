//! Top-level server: wires configuration into a running proxy core.
//!
//! Grounded in the teacher's `Server` (construct from `Config`, expose a
//! `run` entry point) but without the tokio connection-per-task loop — the
//! proxy core is single-threaded and owns everything itself (§4.7/§5).

use crate::config::Config;
use crate::error::SetupError;
use crate::runtime::event_loop::ProxyCore;

/// Construct the proxy core from `config` and run it to completion.
/// Returns the process exit code (§6 of the design); setup failures are
/// reported as `SetupError` rather than folded into the exit code here, so
/// the caller logs them uniformly with configuration errors.
pub fn run(config: Config) -> Result<i32, SetupError> {
    let core = ProxyCore::new(&config).map_err(SetupError::Io)?;
    Ok(core.run())
}
