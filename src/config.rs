//! Configuration: CLI flags layered over an optional TOML file.
//!
//! Grounded in the teacher's `config.rs` (`CliArgs` via `clap::Parser`,
//! a `TomlConfig` tree deserialized with `serde`, `Config::load()` merging
//! the two with CLI taking precedence). The shape carries over; the fields
//! are the proxy's own (§6 of the design).

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::users::Role;

#[derive(Parser, Debug)]
#[command(name = "socks5-relay")]
#[command(author = "socks5-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A SOCKS5 proxy server with a management protocol", long_about = None)]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// SOCKS5 listen address.
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Management protocol listen address.
    #[arg(short = 'm', long)]
    pub management_listen: Option<String>,

    /// Force username/password authentication even when no-auth would
    /// otherwise be offered.
    #[arg(long)]
    pub require_auth: bool,

    /// Seed a user into the store at startup: `user:pass` or
    /// `user:pass:role`. Repeatable.
    #[arg(long = "seed-user")]
    pub seed_users: Vec<String>,

    /// Idle timeout for relaying connections, in seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub users: Vec<TomlUser>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_management_listen")]
    pub management_listen: String,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            management_listen: default_management_listen(),
            require_auth: false,
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TomlUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_management_listen() -> String {
    "127.0.0.1:1081".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A seed user resolved from either the CLI or the TOML file.
#[derive(Debug, Clone)]
pub struct SeedUser {
    pub username: String,
    pub password: String,
    pub role: Role,
}

/// Final, fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub management_listen: String,
    pub require_auth: bool,
    pub idle_timeout_secs: u64,
    pub seed_users: Vec<SeedUser>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file. CLI
    /// arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut seed_users = Vec::new();
        for entry in &toml_config.users {
            let role = entry
                .role
                .as_deref()
                .and_then(Role::parse)
                .unwrap_or(Role::User);
            seed_users.push(SeedUser {
                username: entry.username.clone(),
                password: entry.password.clone(),
                role,
            });
        }
        for raw in &cli.seed_users {
            seed_users.push(parse_seed_user(raw)?);
        }

        let require_auth = cli.require_auth || toml_config.server.require_auth || !seed_users.is_empty();

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let management_listen = cli
            .management_listen
            .unwrap_or(toml_config.server.management_listen);
        listen
            .parse::<std::net::SocketAddr>()
            .map_err(|_| ConfigError::InvalidListenAddr(listen.clone()))?;
        management_listen
            .parse::<std::net::SocketAddr>()
            .map_err(|_| ConfigError::InvalidListenAddr(management_listen.clone()))?;

        Ok(Config {
            listen,
            management_listen,
            require_auth,
            idle_timeout_secs: cli
                .idle_timeout_secs
                .unwrap_or(toml_config.server.idle_timeout_secs),
            seed_users,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

fn parse_seed_user(raw: &str) -> Result<SeedUser, ConfigError> {
    let mut parts = raw.splitn(3, ':');
    let username = parts.next().filter(|s| !s.is_empty());
    let password = parts.next().filter(|s| !s.is_empty());
    let role = parts.next();

    match (username, password) {
        (Some(username), Some(password)) => {
            let role = role.and_then(Role::parse).unwrap_or(Role::User);
            Ok(SeedUser {
                username: username.to_string(),
                password: password.to_string(),
                role,
            })
        }
        _ => Err(ConfigError::InvalidSeedUser(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(overrides: impl FnOnce(&mut CliArgs)) -> CliArgs {
        let mut args = CliArgs {
            config: None,
            listen: None,
            management_listen: None,
            require_auth: false,
            seed_users: Vec::new(),
            idle_timeout_secs: None,
            log_level: "info".to_string(),
        };
        overrides(&mut args);
        args
    }

    #[test]
    fn test_defaults_with_no_overrides() {
        let config = Config::from_cli(cli(|_| {})).unwrap();
        assert_eq!(config.listen, "127.0.0.1:1080");
        assert_eq!(config.management_listen, "127.0.0.1:1081");
        assert!(!config.require_auth);
        assert_eq!(config.idle_timeout_secs, 60);
    }

    #[test]
    fn test_seed_user_forces_require_auth() {
        let config = Config::from_cli(cli(|c| {
            c.seed_users.push("alice:secret".to_string());
        }))
        .unwrap();
        assert!(config.require_auth);
        assert_eq!(config.seed_users.len(), 1);
        assert_eq!(config.seed_users[0].username, "alice");
        assert_eq!(config.seed_users[0].role.as_str(), "user");
    }

    #[test]
    fn test_seed_user_with_role() {
        let config = Config::from_cli(cli(|c| {
            c.seed_users.push("root:toor:admin".to_string());
        }))
        .unwrap();
        assert_eq!(config.seed_users[0].role.as_str(), "admin");
    }

    #[test]
    fn test_malformed_seed_user_errors() {
        let err = Config::from_cli(cli(|c| {
            c.seed_users.push("no-colon-here".to_string());
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSeedUser(_)));
    }

    #[test]
    fn test_malformed_listen_address_errors() {
        let err = Config::from_cli(cli(|c| {
            c.listen = Some("not-an-address".to_string());
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListenAddr(_)));
    }

    #[test]
    fn test_cli_overrides_listen() {
        let config = Config::from_cli(cli(|c| {
            c.listen = Some("0.0.0.0:9000".to_string());
        }))
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:1080"
            require_auth = true
            idle_timeout_secs = 30

            [[users]]
            username = "alice"
            password = "secret"
            role = "admin"

            [logging]
            level = "debug"
        "#;
        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.server.listen, "0.0.0.0:1080");
        assert!(parsed.server.require_auth);
        assert_eq!(parsed.users.len(), 1);
        assert_eq!(parsed.users[0].username, "alice");
        assert_eq!(parsed.logging.level, "debug");
    }
}
