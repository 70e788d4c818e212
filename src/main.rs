//! socks5-relay: a SOCKS5 proxy server with a length-prefixed management
//! protocol.
//!
//! - RFC 1928 CONNECT-only SOCKS5 with RFC 1929 username/password
//!   sub-negotiation
//! - A second listener speaking a framed admin protocol: live metrics,
//!   user administration, and a rolling connection log
//! - Configuration via CLI arguments layered over an optional TOML file

mod config;
mod connlog;
mod dns;
#[cfg(test)]
mod e2e_tests;
mod error;
mod management;
mod metrics;
mod runtime;
mod server;
mod socks;
mod users;

use config::Config;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::info!(
        listen = %config.listen,
        management_listen = %config.management_listen,
        "starting socks5-relay"
    );

    match server::run(config) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!(error = %e, "failed to start proxy core");
            ExitCode::from(1)
        }
    }
}
