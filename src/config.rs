use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::repository::archive::EntryErrorPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the registry listener.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Per-request deadline in seconds.  `0` disables it.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
    /// How long in-flight requests may run after a shutdown signal.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Absolute base URL used in `X-Terraform-Get`.  When unset the download
    /// endpoint answers with a path relative to the request host.
    #[serde(default)]
    pub public_url: Option<String>,
    /// How long a client may take to send a complete request head.  `0`
    /// disables it.
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,
    /// Serve the registry over TLS.  Plain HTTP when unset.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// PEM files for the registry listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            handler_timeout_secs: default_handler_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            public_url: None,
            header_read_timeout_secs: default_header_read_timeout(),
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_handler_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_header_read_timeout() -> u64 {
    2
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Socket address for the `/metrics` listener.
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9090".to_string()
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    /// Full URL to the API root (e.g. `https://ghe.corp.example.com/api/v3`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Name of the environment variable holding the service token used when
    /// a request carries no bearer token of its own.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Registry `system` segment to GitHub owner.  Unmapped systems are used as
    /// the owner verbatim.
    #[serde(default)]
    pub org_mappings: HashMap<String, String>,
    /// Owner to permitted repositories.  Empty means every repository is
    /// reachable.
    #[serde(default)]
    pub repositories: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub on_entry_error: EntryErrorPolicy,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout(),
            org_mappings: HashMap::new(),
            repositories: HashMap::new(),
            on_entry_error: EntryErrorPolicy::default(),
        }
    }
}

impl GithubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Read the service token from the configured environment variable.
    pub fn service_token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|token| !token.is_empty())
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Root directory of the archive store.
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Lifetime of a cached version list in seconds.  `0` keeps entries
    /// until restart.
    #[serde(default = "default_expiration")]
    pub expiration_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_cache_path(),
            expiration_secs: default_expiration(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl CacheConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_cache_path() -> String {
    "/var/cache/forgemod".to_string()
}

fn default_expiration() -> u64 {
    10
}

fn default_cleanup_interval() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    config
        .server
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("server.listen is not a socket address: {}", config.server.listen))?;
    if config.metrics.enabled {
        config
            .metrics
            .listen
            .parse::<SocketAddr>()
            .with_context(|| {
                format!("metrics.listen is not a socket address: {}", config.metrics.listen)
            })?;
    }
    anyhow::ensure!(
        is_http_url(&config.github.api_url),
        "github.api_url must be an http(s) URL"
    );
    if let Some(tls) = &config.server.tls {
        anyhow::ensure!(
            !tls.cert_file.is_empty() && !tls.key_file.is_empty(),
            "server.tls requires both cert_file and key_file"
        );
    }
    if let Some(public_url) = &config.server.public_url {
        anyhow::ensure!(
            is_http_url(public_url),
            "server.public_url must be an http(s) URL"
        );
    }
    if config.cache.enabled {
        anyhow::ensure!(
            config.cache.cleanup_interval_secs > 0,
            "cache.cleanup_interval_secs must be greater than 0"
        );
        anyhow::ensure!(!config.cache.path.is_empty(), "cache.path must be set");
    }
    Ok(())
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
