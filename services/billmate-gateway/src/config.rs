//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! A seed refresh token comes from BILLMATE_REFRESH_TOKEN or
//! refresh_token_file and is never stored in the TOML itself.

use billmate_auth::{DEFAULT_API_URL, SIGN_IN_PATH};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub session: SessionConfig,
}

/// Listener and backend settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential storage and session behaviour
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub credentials_path: PathBuf,
    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,
    #[serde(default = "default_true")]
    pub rehydrate_profile: bool,
    #[serde(default)]
    pub secure_cookies: bool,
    /// File holding a refresh token to seed an empty store with
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
}

fn default_api_base_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    256
}

fn default_sign_in_path() -> String {
    SIGN_IN_PATH.to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Seed refresh token resolution order:
    /// 1. BILLMATE_REFRESH_TOKEN env var
    /// 2. refresh_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("BILLMATE_API_URL") {
            config.gateway.api_base_url = url;
        }

        if !config.gateway.api_base_url.starts_with("http://")
            && !config.gateway.api_base_url.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "api_base_url",
                format!(
                    "must start with http:// or https://, got: {}",
                    config.gateway.api_base_url
                ),
            ));
        }
        if config.gateway.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "timeout_secs",
                "must be greater than 0",
            ));
        }
        if config.gateway.max_connections == 0 {
            return Err(common::Error::invalid(
                "max_connections",
                "must be greater than 0",
            ));
        }
        if !config.session.sign_in_path.starts_with('/') {
            return Err(common::Error::invalid(
                "sign_in_path",
                format!("must start with '/', got: {}", config.session.sign_in_path),
            ));
        }

        if let Ok(token) = std::env::var("BILLMATE_REFRESH_TOKEN") {
            config.session.refresh_token = Some(Secret::new(token));
        } else if let Some(ref token_file) = config.session.refresh_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read refresh_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            config.session.refresh_token = Some(Secret::new(token.trim().to_owned()));
        }
        if config
            .session
            .refresh_token
            .as_ref()
            .is_some_and(|t| t.is_blank())
        {
            config.session.refresh_token = None;
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("billmate-gateway.toml")
    }
}
