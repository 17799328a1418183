use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::AutoRefreshConfig;

/// Bearer session client - login, refresh and call an API with automatic token refresh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the backend API (auth endpoints live under {base}/auth)
    #[arg(
        short = 'u',
        long,
        env = "AUTH_BASE_URL",
        default_value = "http://localhost:8000/api/v1"
    )]
    pub base_url: String,

    /// Path to the SQLite token store
    #[arg(short = 'd', long, env = "TOKEN_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "10")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store the token pair
    Login {
        #[arg(long, env = "AUTH_USERNAME")]
        username: Option<String>,
    },
    /// Show the stored session
    Status {
        /// Also ask the backend how it sees the access token
        #[arg(long)]
        remote: bool,
    },
    /// Refresh the access token now
    Refresh,
    /// Authorized GET request against a path or URL
    Get {
        path: String,
        /// Extra request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// Revoke and forget the session
    Logout,
    /// Keep the session alive, refreshing ahead of expiry until Ctrl+C
    Watch,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub base_url: String,

    // Token store
    pub db_file: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,
    /// Send `X-Refresh-Token` so the backend can rotate tokens in-band
    pub forward_refresh_token: bool,

    // Proactive refresh
    pub token_refresh_threshold: u64,
    pub token_refresh_check_interval: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    ///
    /// `.env` must already be loaded so clap sees its values.
    pub fn load(args: &CliArgs) -> Result<Self> {
        let config = Config {
            base_url: args.base_url.trim_end_matches('/').to_string(),

            db_file: args
                .db_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_db_path),

            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10)?,
            http_request_timeout: args.http_timeout,
            http_max_retries: env_or("HTTP_MAX_RETRIES", 2)?,
            forward_refresh_token: env_or("FORWARD_REFRESH_TOKEN", true)?,

            token_refresh_threshold: env_or("TOKEN_REFRESH_THRESHOLD", 300)?,
            token_refresh_check_interval: env_or("TOKEN_REFRESH_CHECK_INTERVAL", 60)?,

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("AUTH_BASE_URL is not a valid URL: {}", self.base_url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("AUTH_BASE_URL must use http or https: {}", self.base_url);
        }
        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }
        if self.token_refresh_check_interval == 0 {
            anyhow::bail!("TOKEN_REFRESH_CHECK_INTERVAL must be greater than zero");
        }
        Ok(())
    }

    pub fn auto_refresh(&self) -> AutoRefreshConfig {
        AutoRefreshConfig {
            check_interval: Duration::from_secs(self.token_refresh_check_interval),
            threshold: Duration::from_secs(self.token_refresh_threshold),
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(s) => s
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, s)),
        Err(_) => Ok(default),
    }
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

/// `<data dir>/bearer-session/tokens.sqlite3`
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("bearer-session").join("tokens.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("tokens.sqlite3"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(base_url: &str) -> Config {
        Config {
            base_url: base_url.to_string(),
            db_file: PathBuf::from("/tmp/tokens.sqlite3"),
            http_connect_timeout: 10,
            http_request_timeout: 10,
            http_max_retries: 2,
            forward_refresh_token: true,
            token_refresh_threshold: 300,
            token_refresh_check_interval: 60,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
    }

    #[test]
    fn test_default_db_path() {
        assert!(default_db_path().ends_with("tokens.sqlite3"));
    }

    #[test]
    fn test_parse_subcommands() {
        let args = CliArgs::try_parse_from([
            "bearer-session",
            "--base-url",
            "https://api.example.com/v1/",
            "-d",
            "/tmp/t.sqlite3",
            "get",
            "/cases",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Get {
                path: "/cases".to_string(),
                headers: vec![]
            }
        );

        let config = Config::load(&args).unwrap();
        assert_eq!(config.base_url, "https://api.example.com/v1");
        assert_eq!(config.db_file, PathBuf::from("/tmp/t.sqlite3"));

        let args = CliArgs::try_parse_from([
            "bearer-session",
            "get",
            "/cases",
            "-H",
            "Accept: text/plain",
            "--header",
            "X-Trace: 1",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Get {
                path: "/cases".to_string(),
                headers: vec!["Accept: text/plain".to_string(), "X-Trace: 1".to_string()]
            }
        );

        let args = CliArgs::try_parse_from(["bearer-session", "status", "--remote"]).unwrap();
        assert_eq!(args.command, Command::Status { remote: true });

        let args =
            CliArgs::try_parse_from(["bearer-session", "login", "--username", "admin"]).unwrap();
        assert_eq!(
            args.command,
            Command::Login {
                username: Some("admin".to_string())
            }
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(CliArgs::try_parse_from(["bearer-session"]).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(config_with("http://localhost:8000/api/v1").validate().is_ok());
        assert!(config_with("https://api.example.com").validate().is_ok());
        assert!(config_with("not a url").validate().is_err());
        assert!(config_with("ftp://example.com").validate().is_err());

        let mut config = config_with("http://localhost");
        config.token_refresh_check_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_refresh_config() {
        let config = config_with("http://localhost");
        let auto = config.auto_refresh();
        assert_eq!(auto.check_interval, Duration::from_secs(60));
        assert_eq!(auto.threshold, Duration::from_secs(300));
    }
}
