//! Configuration for the `taskboard` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/taskboard/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use taskboard_proto::ids::UserId;

use crate::retry::DEFAULT_MAX_ATTEMPTS;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    client: ClientSection,
    retry: RetrySection,
}

/// `[client]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ClientSection {
    server_url: Option<String>,
    user_id: Option<UserId>,
    request_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    reply_timeout_secs: Option<u64>,
}

/// `[retry]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RetrySection {
    max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Board server base URL (`http://host:port`).
    pub server_url: String,
    /// Identity sent with every request. Required for any command.
    pub user_id: Option<UserId>,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Timeout for opening the live channel.
    pub connect_timeout: Duration,
    /// Timeout for live channel control replies.
    pub reply_timeout: Duration,
    /// Submissions per update, the first one included.
    pub max_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            user_id: None,
            request_timeout: Duration::from_secs(10),
            connect_timeout: crate::feed::CONNECT_TIMEOUT,
            reply_timeout: crate::feed::REPLY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.client.server_url.clone())
                .unwrap_or(defaults.server_url),
            user_id: cli.user.or(file.client.user_id),
            request_timeout: file
                .client
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            connect_timeout: file
                .client
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reply_timeout: file
                .client
                .reply_timeout_secs
                .map_or(defaults.reply_timeout, Duration::from_secs),
            max_attempts: cli
                .max_attempts
                .or(file.retry.max_attempts)
                .unwrap_or(defaults.max_attempts),
        }
    }
}

/// Global CLI arguments shared by every subcommand.
#[derive(clap::Args, Debug, Default)]
pub struct CliArgs {
    /// Board server base URL.
    #[arg(long, global = true, env = "TASKBOARD_URL")]
    pub server_url: Option<String>,

    /// Your user id.
    #[arg(long, global = true, env = "TASKBOARD_USER")]
    pub user: Option<UserId>,

    /// Submissions per update before a conflict is reported.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Path to config file (default: `~/.config/taskboard/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "TASKBOARD_LOG")]
    pub log_level: String,

    /// Log file path (default: temp dir `taskboard.log`).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("taskboard").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "http://127.0.0.1:8080");
        assert_eq!(config.user_id, None);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn toml_parsing_full() {
        let user = UserId::new();
        let toml_str = format!(
            r#"
[client]
server_url = "http://board.local:9000"
user_id = "{user}"
request_timeout_secs = 3
connect_timeout_secs = 4
reply_timeout_secs = 2

[retry]
max_attempts = 5
"#
        );
        let file: ConfigFile = toml::from_str(&toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file);

        assert_eq!(config.server_url, "http://board.local:9000");
        assert_eq!(config.user_id, Some(user));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_secs(4));
        assert_eq!(config.reply_timeout, Duration::from_secs(2));
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn toml_parsing_partial() {
        let file: ConfigFile = toml::from_str("[retry]\nmax_attempts = 1\n").unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.server_url, ClientConfig::default().server_url);
    }

    #[test]
    fn bad_user_id_in_file_is_an_error() {
        let result: Result<ConfigFile, _> = toml::from_str("[client]\nuser_id = \"bob\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn cli_overrides_file() {
        let file: ConfigFile = toml::from_str(
            r#"
[client]
server_url = "http://from-file:1"

[retry]
max_attempts = 7
"#,
        )
        .unwrap();
        let user = UserId::new();
        let cli = CliArgs {
            server_url: Some("http://from-cli:2".to_string()),
            user: Some(user),
            max_attempts: Some(2),
            ..Default::default()
        };
        let config = ClientConfig::resolve(&cli, &file);
        assert_eq!(config.server_url, "http://from-cli:2");
        assert_eq!(config.user_id, Some(user));
        assert_eq!(config.max_attempts, 2);
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/taskboard.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
