use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Session Client - authenticated API access from the command line
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the API
    #[arg(
        short = 'u',
        long,
        env = "API_BASE_URL",
        default_value = "http://localhost:3000/api"
    )]
    pub base_url: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Token refresh timeout in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "15")]
    pub refresh_timeout: u64,

    /// Path to the SQLite credential store
    #[arg(short = 's', long, env = "CREDENTIAL_STORE")]
    pub store: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store the credential
    Login {
        #[arg(short, long)]
        email: String,

        /// Prompted for when not given
        #[arg(short, long, env = "API_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Forget the stored credential
    Logout,

    /// Show the cached user profile
    Whoami,

    /// Show which credentials are stored
    Status,

    /// Send an authenticated request
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,

        /// Path relative to the base URL, e.g. /orders
        path: String,

        /// JSON body
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub base_url: String,

    // Timeouts
    pub http_request_timeout: u64,
    pub http_connect_timeout: u64,
    pub token_refresh_timeout: u64,

    // HTTP client
    pub http_max_connections: usize,

    // Storage
    pub credential_store: PathBuf,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Settings consumed by [`crate::http_client::ApiClient`]
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub refresh_timeout: Duration,
    pub max_idle_connections: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            refresh_timeout: Duration::from_secs(15),
            max_idle_connections: 20,
        }
    }
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let credential_store = match args.store {
            Some(ref path) => expand_tilde(path),
            None => default_store_path().context(
                "Cannot determine a data directory (use -s or set CREDENTIAL_STORE)",
            )?,
        };

        Ok(Config {
            base_url: args.base_url.trim_end_matches('/').to_string(),

            http_request_timeout: args.http_timeout,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            token_refresh_timeout: args.refresh_timeout,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            credential_store,

            log_level: args.log_level.clone(),
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!(
                "API_BASE_URL must start with http:// or https://: {}",
                self.base_url
            );
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        if self.token_refresh_timeout == 0 {
            anyhow::bail!("TOKEN_REFRESH_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.base_url.clone(),
            request_timeout: Duration::from_secs(self.http_request_timeout),
            connect_timeout: Duration::from_secs(self.http_connect_timeout),
            refresh_timeout: Duration::from_secs(self.token_refresh_timeout),
            max_idle_connections: self.http_max_connections,
        }
    }
}

/// Default credential store location inside the user's data directory
fn default_store_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("session-client").join("credentials.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
