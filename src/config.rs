//! Configuration management for Tollgate.
//!
//! Values are layered: built-in defaults, an optional YAML file, a `.env`
//! file in the working directory, environment variables, then command-line
//! flags. A missing or invalid value at any layer leaves the previous
//! layer's value in place.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;
use config::Environment;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{BlockFlagMode, IdentityResolver, Quota};

/// Command-line arguments.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "tollgate")]
#[command(about = "Request admission gate with per-identity rate limits")]
#[command(version)]
pub struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on, overriding LISTEN_ADDR
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests per window for address-keyed identities
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u64,

    /// Requests per window for token-keyed identities
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// Seconds an identity stays blocked after exceeding its limit
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,

    /// Block duration override for address-keyed identities
    #[serde(default)]
    pub ip_block_duration_secs: Option<u64>,

    /// Block duration override for token-keyed identities
    #[serde(default)]
    pub token_block_duration_secs: Option<u64>,

    /// How block flags are created
    #[serde(default)]
    pub block_flag_mode: BlockFlagMode,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            ip_limit: default_ip_limit(),
            token_limit: default_token_limit(),
            block_duration_secs: default_block_duration(),
            ip_block_duration_secs: None,
            token_block_duration_secs: None,
            block_flag_mode: BlockFlagMode::default(),
        }
    }
}

fn default_ip_limit() -> u64 {
    5
}

fn default_token_limit() -> u64 {
    10
}

fn default_block_duration() -> u64 {
    300
}

impl RateLimitingConfig {
    /// Quota for address-keyed identities.
    pub fn ip_quota(&self) -> Quota {
        Quota::new(
            self.ip_limit,
            self.ip_block_duration_secs.unwrap_or(self.block_duration_secs),
        )
    }

    /// Quota for token-keyed identities.
    pub fn token_quota(&self) -> Quota {
        Quota::new(
            self.token_limit,
            self.token_block_duration_secs
                .unwrap_or(self.block_duration_secs),
        )
    }

    /// Build an identity resolver for these quotas.
    pub fn resolver(&self) -> IdentityResolver {
        IdentityResolver::new(self.ip_quota(), self.token_quota())
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis address as `host:port`
    #[serde(default = "default_store_addr")]
    pub addr: String,

    /// Redis password
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            addr: default_store_addr(),
            password: None,
        }
    }
}

fn default_store_addr() -> String {
    "localhost:6379".to_string()
}

// Environment keys, lowercased the way the environment source reports them.
const ENV_LISTEN_ADDR: &str = "listen_addr";
const ENV_RATE_LIMIT_IP: &str = "rate_limit_ip";
const ENV_RATE_LIMIT_TOKEN: &str = "rate_limit_token";
const ENV_BLOCK_DURATION: &str = "block_duration_seconds";
const ENV_IP_BLOCK_DURATION: &str = "rate_limit_ip_block_seconds";
const ENV_TOKEN_BLOCK_DURATION: &str = "rate_limit_token_block_seconds";
const ENV_BLOCK_FLAG_MODE: &str = "block_flag_mode";
const ENV_REDIS_ADDR: &str = "redis_addr";
const ENV_REDIS_PASSWORD: &str = "redis_password";

/// Dotenv file read from the working directory.
const DOTENV_FILE: &str = ".env";

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Build the effective configuration from an optional file, a `.env`
    /// file and the process environment. Never fails; unusable input falls
    /// back to defaults with a warning.
    pub fn load(path: Option<&Path>) -> Self {
        Self::load_with_dotenv(path, Path::new(DOTENV_FILE))
    }

    fn load_with_dotenv(path: Option<&Path>, dotenv: &Path) -> Self {
        let mut config = match path {
            Some(path) => Self::from_file(path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring configuration file");
                Self::default()
            }),
            None => Self::default(),
        };
        config.apply_env_vars(read_dotenv(dotenv));
        config.apply_env();
        config
    }

    /// Override values from environment variables.
    pub fn apply_env(&mut self) {
        self.apply_environment(Environment::default());
    }

    /// Override values from an explicit set of environment variables.
    pub fn apply_env_vars(&mut self, vars: HashMap<String, String>) {
        self.apply_environment(Environment::default().source(Some(vars)));
    }

    /// Override values from command-line arguments.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            self.server.listen_addr = listen;
        }
    }

    fn apply_environment(&mut self, env: Environment) {
        let settings = match config::Config::builder().add_source(env).build() {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to read environment configuration");
                return;
            }
        };

        if let Some(addr) = env_value(&settings, ENV_LISTEN_ADDR) {
            self.server.listen_addr = addr;
        }

        let limits = &mut self.rate_limiting;
        if let Some(limit) = env_value(&settings, ENV_RATE_LIMIT_IP) {
            limits.ip_limit = limit;
        }
        if let Some(limit) = env_value(&settings, ENV_RATE_LIMIT_TOKEN) {
            limits.token_limit = limit;
        }
        if let Some(secs) = env_value(&settings, ENV_BLOCK_DURATION) {
            limits.block_duration_secs = secs;
        }
        if let Some(secs) = env_value(&settings, ENV_IP_BLOCK_DURATION) {
            limits.ip_block_duration_secs = Some(secs);
        }
        if let Some(secs) = env_value(&settings, ENV_TOKEN_BLOCK_DURATION) {
            limits.token_block_duration_secs = Some(secs);
        }
        if let Some(mode) = env_value(&settings, ENV_BLOCK_FLAG_MODE) {
            limits.block_flag_mode = mode;
        }

        if let Some(addr) = env_value::<String>(&settings, ENV_REDIS_ADDR) {
            self.store.addr = addr;
        }
        if let Some(password) = env_value::<String>(&settings, ENV_REDIS_PASSWORD) {
            self.store.password = Some(password);
        }
    }
}

/// Variables defined in a dotenv file. The process environment is left
/// untouched, so real environment variables keep precedence.
fn read_dotenv(path: &Path) -> HashMap<String, String> {
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No dotenv file loaded");
            return HashMap::new();
        }
    };

    let mut vars = HashMap::new();
    for entry in entries {
        match entry {
            Ok((key, value)) => {
                vars.insert(key, value);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed dotenv line");
            }
        }
    }
    debug!(path = %path.display(), count = vars.len(), "Loaded dotenv file");
    vars
}

/// Read and parse one environment value.
///
/// Unset and empty values yield `None` silently; unparsable values yield
/// `None` with a warning.
fn env_value<T>(settings: &config::Config, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = settings.get_string(key).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                key = %key.to_ascii_uppercase(),
                value = %raw,
                error = %e,
                "Ignoring invalid configuration value"
            );
            None
        }
    }
}
