use anyhow::{anyhow, Context, Result};
use dirs::{cache_dir, config_dir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::ClientConfig;

/// Preference key under which the GitHub token is persisted
pub const API_KEY: &str = "API_KEY";

/// Main configuration structure for repolist
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// GitHub API endpoint settings
    #[serde(default)]
    pub api: ApiConfig,

    /// HTTP client behaviour shared by the cached and non-cached profiles
    #[serde(default)]
    pub http: HttpConfig,

    /// TLS compatibility settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub API configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    /// Base URL of the REST API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// User whose repositories are listed when none is given
    #[serde(default = "default_user")]
    pub user: String,
}

/// HTTP client configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Write timeout in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,

    /// Read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    /// Attach the on-disk response cache to the cached profile
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Upper bound of the response cache in bytes
    #[serde(default = "default_cache_size")]
    pub cache_size_bytes: u64,

    /// Response cache directory
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Log request and response bodies
    #[serde(default = "default_true")]
    pub log_body: bool,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Redirect hops followed by the non-cached profile
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Retry once when a connection cannot be established
    #[serde(default = "default_true")]
    pub retry_on_connection_failure: bool,
}

/// TLS compatibility configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Force TLS 1.2 (`true`), never force it (`false`), or detect the platform (unset)
    #[serde(default)]
    pub force_tls12: Option<bool>,

    /// Allow plain HTTP while TLS 1.2 is being forced
    #[serde(default)]
    pub allow_cleartext: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_base_url() -> String {
    "https://api.github.com".to_string()
}
fn default_user() -> String {
    "NimzyMaina".to_string()
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_write_timeout() -> u64 {
    40
}
fn default_read_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_cache_size() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_cache_dir() -> String {
    if let Some(dir) = cache_dir() {
        dir.join("repolist").join("http").to_string_lossy().into_owned()
    } else {
        "/tmp/repolist-http-cache".to_string()
    }
}

fn default_user_agent() -> String {
    format!("repolist/{}", env!("CARGO_PKG_VERSION"))
}
fn default_max_redirects() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user: default_user(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            write_timeout: default_write_timeout(),
            read_timeout: default_read_timeout(),
            cache_enabled: default_true(),
            cache_size_bytes: default_cache_size(),
            cache_dir: default_cache_dir(),
            log_body: default_true(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            retry_on_connection_failure: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Directory holding the configuration and preferences files (XDG compliant)
    pub fn config_home() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repolist"))
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::config_home()?.join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.http.cache_dir = shellexpand::full(&self.http.cache_dir)
            .context("Failed to expand cache_dir path")?
            .into_owned();

        Ok(())
    }

    /// Build the HTTP client settings described by this configuration
    pub fn client_config(&self) -> Result<ClientConfig> {
        let client_config = ClientConfig {
            base_url: self.api.base_url.clone(),
            connect_timeout: Duration::from_secs(self.http.connect_timeout),
            write_timeout: Duration::from_secs(self.http.write_timeout),
            read_timeout: Duration::from_secs(self.http.read_timeout),
            cache_enabled: self.http.cache_enabled,
            cache_size_bytes: self.http.cache_size_bytes,
            cache_dir: PathBuf::from(&self.http.cache_dir),
            log_body: self.http.log_body,
            user_agent: self.http.user_agent.clone(),
            max_redirects: self.http.max_redirects,
            retry_on_connection_failure: self.http.retry_on_connection_failure,
            tls: self.tls.clone(),
        };

        client_config.validate()?;
        Ok(client_config)
    }
}

/// Persisted key/value store for user preferences such as the API token
///
/// Values live in a flat YAML map next to the configuration file. A store
/// without a backing path keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl Preferences {
    /// An empty store that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Default preferences file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Config::config_home()?.join("preferences.yml"))
    }

    /// Load preferences from the default location
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path()?)
    }

    /// Load preferences from `path`; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read preferences file: {:?}", path))?;

            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse preferences file: {:?}", path))?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            values,
        })
    }

    /// Persist the store to its backing file
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| anyhow!("Preferences have no backing file"))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create preferences directory: {:?}", parent))?;
        }

        let content =
            serde_yaml::to_string(&self.values).context("Failed to serialize preferences")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write preferences file: {:?}", path))?;

        // Holds a credential
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
        }

        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }
}
