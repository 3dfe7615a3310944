use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Recon Session - authenticated client for the reconciliation API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the reconciliation API
    #[arg(short = 'u', long, env = "RECON_API_URL", default_value = "http://localhost:8080/api")]
    pub base_url: String,

    /// Path to the credential database
    #[arg(short = 'd', long, env = "RECON_CREDENTIALS_DB")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in and store the session
    Login {
        /// Account email (prompted when omitted)
        #[arg(short, long)]
        email: Option<String>,
    },

    /// Create an account and sign in
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        company_name: Option<String>,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Verify the stored session and print the current user
    Whoami,

    /// Print the locally stored session without contacting the server
    Status,

    /// Change the account password
    ChangePassword,

    /// GET an API path with the stored session
    Get {
        /// Path relative to the base URL, e.g. /reports
        path: String,
    },

    /// POST JSON to an API path with the stored session
    Post {
        path: String,
        /// JSON body
        #[arg(long, default_value = "{}")]
        data: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,
    pub auth_path_prefix: String,

    // Credentials
    pub credentials_db: PathBuf,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub logout_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    ///
    /// `.env` must already be loaded (see [`load_dotenv`]) before the
    /// arguments are parsed so clap's `env` fallbacks can see it.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let credentials_db = match args.db_file {
            Some(ref path) => expand_tilde(path),
            None => default_credentials_db()
                .context("Cannot determine a data directory; pass --db-file or set RECON_CREDENTIALS_DB")?,
        };

        let config = Config {
            api_base_url: args.base_url.trim_end_matches('/').to_string(),

            auth_path_prefix: std::env::var("AUTH_PATH_PREFIX")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/auth".to_string()),

            credentials_db,

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,
            logout_timeout: env_or("LOGOUT_TIMEOUT", 5),

            log_level: args.log_level.clone(),
            log_format: parse_log_format(&args.log_format),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("RECON_API_URL is not a valid URL: {}", self.api_base_url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("RECON_API_URL must use http or https: {}", self.api_base_url);
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        if self.logout_timeout == 0 {
            anyhow::bail!("LOGOUT_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

/// Load `.env` from the working directory if present
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// `<data_dir>/recon-session/credentials.sqlite3`
fn default_credentials_db() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("recon-session").join("credentials.sqlite3"))
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
