//! Daemon configuration handling.

use anyhow::{Context, Result};
use bookhub_core::session::{DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS};
use bookhub_core::{HubSettings, NewBook};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Directory holding the ledger and credential files.
    pub data_dir: PathBuf,

    /// Logging level used when `RUST_LOG` is unset.
    pub log_level: String,

    pub hub: HubSettings,

    pub session: SessionConfig,

    /// Identity-provider token verification. Federated login rejects every
    /// token when absent.
    pub identity: Option<IdentityConfig>,

    /// Sites registered at startup when their domain is unknown.
    pub sites: Vec<SiteSeed>,

    /// Books inserted at startup when no book has the same title.
    pub books: Vec<NewBook>,
}

/// Session token signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HS256 signing secret. A random per-process secret is used when unset,
    /// which invalidates every session on restart.
    pub secret: Option<String>,
    pub issuer: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            issuer: "bookhub".to_string(),
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
        }
    }
}

/// Identity-provider token verification. Exactly one key source is used;
/// the HS256 secret wins when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub issuer: String,
    pub audience: String,
    #[serde(default)]
    pub hs256_secret: Option<String>,
    #[serde(default)]
    pub rs256_public_key_pem: Option<PathBuf>,
}

/// A site to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSeed {
    pub name: String,
    pub domain: String,
    /// Fixed API key; one is generated and printed once when absent.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let dirs = project_dirs();
        let data_dir = dirs
            .as_ref()
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".bookhub"));

        let socket_path = dirs
            .as_ref()
            .map(|d| d.runtime_dir().unwrap_or(d.data_dir()).join("bookhub.sock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/bookhub.sock"));

        Self {
            socket_path,
            config_path: PathBuf::new(),
            data_dir,
            log_level: "info".to_string(),
            hub: HubSettings::default(),
            session: SessionConfig::default(),
            identity: None,
            sites: Vec::new(),
            books: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// JSON snapshot of the ledger store.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.json")
    }

    /// Password hashes for email/password accounts.
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }
}

/// Load configuration from the default location or create defaults.
pub fn load_config() -> Result<DaemonConfig> {
    let config_path = project_dirs()
        .map(|d| d.config_dir().join("daemon.toml"))
        .unwrap_or_else(|| PathBuf::from("bookhub-daemon.toml"));

    load_config_from(&config_path)
}

/// Load configuration from `config_path`, falling back to defaults when the
/// file does not exist.
pub fn load_config_from(config_path: &Path) -> Result<DaemonConfig> {
    let mut config = if config_path.exists() {
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", config_path))?
    } else {
        DaemonConfig::default()
    };

    config.config_path = config_path.to_path_buf();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "bookhub", "bookhub")
}
