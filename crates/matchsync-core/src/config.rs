// Configuration loading and parsing (matchsync.toml, credentials.toml).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::connection::ReconnectPolicy;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub sync: SyncConfig,
    pub watch: Option<WatchConfig>,
    pub credentials: CredentialsConfig,
}

// ---------------------------------------------------------------------------
// matchsync.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire matchsync.toml file.
#[derive(Debug, Clone, Deserialize)]
struct SettingsFile {
    server: ServerConfig,
    #[serde(default)]
    reconnect: ReconnectConfig,
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    watch: Option<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the tournament REST API, e.g. `https://api.example.gg/api`.
    pub api_base_url: String,
    /// WebSocket endpoint for push notifications, e.g. `wss://api.example.gg/ws`.
    pub socket_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How many recent matches to fetch per side.
    pub recent_matches_limit: u32,
    /// Capacity of the push-hint buffer between the connection and a watcher.
    pub push_buffer: usize,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recent_matches_limit: 5,
            push_buffer: 64,
            request_timeout_secs: 10,
        }
    }
}

/// The match the headless watcher follows.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub tournament_id: String,
    pub match_id: String,
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    /// Opaque bearer token handed to the connection and the REST client.
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/matchsync.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// This does not auto-copy defaults; prefer `load_config()`.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- matchsync.toml (required) ---
    let settings_path = config_dir.join("matchsync.toml");
    let settings_text = read_file(&settings_path)?;
    let settings: SettingsFile =
        toml::from_str(&settings_text).map_err(|e| ConfigError::ParseError {
            path: settings_path.clone(),
            source: e,
        })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        server: settings.server,
        reconnect: settings.reconnect,
        sync: settings.sync,
        watch: settings.watch,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Install every file from `defaults/` that `config/` lacks, returning the
/// paths written. `.example` templates are left for the user to copy.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");
    let copy_error = |context: String| {
        move |e: io::Error| ConfigError::DefaultsCopyError {
            message: format!("{context}: {e}"),
        }
    };

    if !defaults_dir.is_dir() {
        if config_dir.is_dir() {
            return Ok(Vec::new());
        }
        return Err(ConfigError::DefaultsCopyError {
            message: format!("no defaults/ or config/ under {}", base_dir.display()),
        });
    }
    fs::create_dir_all(&config_dir).map_err(copy_error("creating config/".into()))?;

    let mut installed = Vec::new();
    for entry in fs::read_dir(&defaults_dir).map_err(copy_error("listing defaults/".into()))? {
        let source = entry.map_err(copy_error("listing defaults/".into()))?.path();
        if !source.is_file() || source.extension().is_some_and(|ext| ext == "example") {
            continue;
        }
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = config_dir.join(name);

        // Never overwrite a file the user already has.
        let mut dest = match OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(dest) => dest,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(copy_error(format!("creating {}", target.display()))(e)),
        };
        let bytes =
            fs::read(&source).map_err(copy_error(format!("reading {}", source.display())))?;
        dest.write_all(&bytes)
            .map_err(copy_error(format!("writing {}", target.display())))?;
        info!(file = %target.display(), "installed default config");
        installed.push(target);
    }

    Ok(installed)
}

/// Directory the config is loaded from: the working directory when it holds
/// `config/` or `defaults/`, otherwise the platform config directory.
pub fn config_base_dir() -> Result<PathBuf, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    if cwd.join("config").exists() || cwd.join("defaults").exists() {
        return Ok(cwd);
    }
    match directories::ProjectDirs::from("gg", "matchsync", "matchsync") {
        Some(dirs) => Ok(dirs.config_dir().to_path_buf()),
        None => Ok(cwd),
    }
}

/// Convenience wrapper: resolves the base directory, copies defaults and
/// loads the config.
pub fn load_config() -> Result<Config, ConfigError> {
    let base = config_base_dir()?;
    ensure_config_files(&base)?;
    load_config_from(&base)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let api = config.server.api_base_url.trim();
    if !(api.starts_with("http://") || api.starts_with("https://")) {
        return Err(ConfigError::ValidationError {
            field: "server.api_base_url".into(),
            message: format!("must be an http(s) URL, got `{api}`"),
        });
    }

    let socket = config.server.socket_url.trim();
    if !(socket.starts_with("ws://") || socket.starts_with("wss://")) {
        return Err(ConfigError::ValidationError {
            field: "server.socket_url".into(),
            message: format!("must be a ws(s) URL, got `{socket}`"),
        });
    }

    let r = &config.reconnect;
    if r.max_attempts == 0 {
        return Err(ConfigError::ValidationError {
            field: "reconnect.max_attempts".into(),
            message: "must be greater than 0".into(),
        });
    }
    if r.min_delay_ms > r.max_delay_ms {
        return Err(ConfigError::ValidationError {
            field: "reconnect.min_delay_ms".into(),
            message: format!(
                "must not exceed reconnect.max_delay_ms ({} > {})",
                r.min_delay_ms, r.max_delay_ms
            ),
        });
    }

    let s = &config.sync;
    let sync_fields: &[(&str, u64)] = &[
        ("sync.recent_matches_limit", u64::from(s.recent_matches_limit)),
        ("sync.push_buffer", s.push_buffer as u64),
        ("sync.request_timeout_secs", s.request_timeout_secs),
    ];
    for (name, val) in sync_fields {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    if let Some(watch) = &config.watch {
        if watch.tournament_id.trim().is_empty() || watch.match_id.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                field: "watch".into(),
                message: "tournament_id and match_id must not be empty".into(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
