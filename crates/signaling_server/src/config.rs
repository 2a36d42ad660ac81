use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Pulsar Signaling Service Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP / WebSocket bind address
    pub http_bind: SocketAddr,

    /// Log level (overridden by RUST_LOG)
    pub log_level: String,

    /// `json` or `pretty`
    pub log_format: String,

    /// PostgreSQL URL; the in-memory store is used when unset
    pub database_url: Option<String>,

    /// Hard ceiling on a single connection's lifetime
    pub max_connection_time_secs: u64,

    /// Keepalive ping interval
    pub ping_interval_secs: u64,

    /// Silent ping intervals tolerated before the connection is dropped
    pub max_missed_pongs: u32,

    /// How long an abruptly disconnected peer may reclaim its identity
    pub reconnect_grace_secs: u64,

    /// How often expired pending disconnects are swept
    pub sweep_interval_secs: u64,

    /// Budget for disconnect bookkeeping once a connection is gone
    pub disconnect_timeout_secs: u64,

    /// Length of freshly allocated lobby codes
    pub lobby_code_length: usize,

    /// Upper bound for a lobby's `max_players`
    pub max_lobby_size: u32,

    /// TURN server URLs announced with shared-secret credentials
    pub turn_urls: Vec<String>,

    /// TURN REST shared secret
    pub turn_secret: Option<String>,

    /// Lifetime of issued TURN credentials
    pub turn_ttl_secs: u64,

    /// Cloudflare TURN key id
    pub cloudflare_app_id: Option<String>,

    /// Cloudflare TURN API token
    pub cloudflare_token: Option<String>,

    /// How long shutdown waits for connections to drain
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            database_url: None,
            max_connection_time_secs: 3600,
            ping_interval_secs: 30,
            max_missed_pongs: 3,
            reconnect_grace_secs: 60,
            sweep_interval_secs: 5,
            disconnect_timeout_secs: 10,
            lobby_code_length: 4,
            max_lobby_size: 64,
            turn_urls: Vec::new(),
            turn_secret: None,
            turn_ttl_secs: 86400,
            cloudflare_app_id: None,
            cloudflare_token: None,
            shutdown_timeout_secs: 30,
        }
    }
}

/// CLI arguments
#[derive(Parser, Debug, Default)]
#[command(name = "pulsar-signaling")]
#[command(about = "Pulsar Signaling - WebRTC lobby and handshake relay")]
pub struct Cli {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long, env = "SIGNALING_CONFIG")]
    pub config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long, env = "SIGNALING_HTTP_BIND")]
    pub http_bind: Option<SocketAddr>,

    /// Log level
    #[arg(long, env = "SIGNALING_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "SIGNALING_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Database URL
    #[arg(long, env = "SIGNALING_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Reconnect grace window in seconds
    #[arg(long, env = "SIGNALING_RECONNECT_GRACE")]
    pub reconnect_grace_secs: Option<u64>,

    /// TURN server URLs (comma separated)
    #[arg(long, env = "SIGNALING_TURN_URLS", value_delimiter = ',')]
    pub turn_urls: Option<Vec<String>>,

    /// TURN REST shared secret
    #[arg(long, env = "SIGNALING_TURN_SECRET")]
    pub turn_secret: Option<String>,

    /// Cloudflare TURN key id
    #[arg(long, env = "SIGNALING_CLOUDFLARE_APP_ID")]
    pub cloudflare_app_id: Option<String>,

    /// Cloudflare TURN API token
    #[arg(long, env = "SIGNALING_CLOUDFLARE_TOKEN")]
    pub cloudflare_token: Option<String>,
}

impl Config {
    /// Load configuration from environment, CLI args, and optional config file
    pub fn from_env() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        // Override with CLI args
        if let Some(http_bind) = cli.http_bind {
            config.http_bind = http_bind;
        }
        if let Some(log_level) = cli.log_level {
            config.log_level = log_level;
        }
        if let Some(log_format) = cli.log_format {
            config.log_format = log_format;
        }
        if let Some(database_url) = cli.database_url {
            config.database_url = Some(database_url);
        }
        if let Some(grace) = cli.reconnect_grace_secs {
            config.reconnect_grace_secs = grace;
        }
        if let Some(turn_urls) = cli.turn_urls {
            config.turn_urls = turn_urls;
        }
        if let Some(turn_secret) = cli.turn_secret {
            config.turn_secret = Some(turn_secret);
        }
        if let Some(app_id) = cli.cloudflare_app_id {
            config.cloudflare_app_id = Some(app_id);
        }
        if let Some(token) = cli.cloudflare_token {
            config.cloudflare_token = Some(token);
        }

        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&config_str)
            .or_else(|_| toml::from_str(&config_str))
            .context("Failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_interval_secs == 0 || self.sweep_interval_secs == 0 {
            anyhow::bail!("ping and sweep intervals must be greater than 0");
        }

        if self.max_missed_pongs == 0 {
            anyhow::bail!("max_missed_pongs must be greater than 0");
        }

        if !(3..=12).contains(&self.lobby_code_length) {
            anyhow::bail!("lobby_code_length must be between 3 and 12");
        }

        if self.max_lobby_size == 0 {
            anyhow::bail!("max_lobby_size must be greater than 0");
        }

        if self.reconnect_grace_secs < self.sweep_interval_secs {
            anyhow::bail!("reconnect_grace_secs must not be shorter than sweep_interval_secs");
        }

        if self.max_connection_time_secs < self.ping_interval_secs {
            anyhow::bail!("max_connection_time_secs must be at least one ping interval");
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("log_format must be json or pretty");
        }

        if self.turn_secret.is_some() && self.turn_urls.is_empty() {
            tracing::warn!("turn_secret set without turn_urls - clients get credentials without servers");
        }

        Ok(())
    }

    pub fn max_connection_time(&self) -> Duration {
        Duration::from_secs(self.max_connection_time_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }

    pub fn turn_ttl(&self) -> Duration {
        Duration::from_secs(self.turn_ttl_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
