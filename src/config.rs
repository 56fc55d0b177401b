//! Configuration for the store client and the sync engine
//!
//! All settings live in explicit structs that are handed to constructors;
//! nothing is read from process-wide state after startup. Settings come from
//! the process environment and an optional `.env` file. Values already in the
//! environment win over the file, and the file is parsed into a map instead of
//! being injected into the process environment.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `COUCHDB_URI` | required | Server base URL |
//! | `COUCHDB_USER` | `admin` | Basic auth user |
//! | `COUCHDB_PASSWORD` | required | Basic auth password |
//! | `COUCHDB_DB` | `obsidian` | Database name |
//! | `VAULT_ROOT` | current directory | Local vault |
//! | `VAULTSYNC_WORKERS` | `10` | Concurrent chunk requests |
//! | `VAULTSYNC_SYNC_DIRS` | see [`DEFAULT_SYNC_DIRECTORIES`] | Comma-separated top-level dirs, `*` for the whole vault |
//! | `VAULTSYNC_TIMEOUT_SECS` | `30` | Per-request timeout |

use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level vault directories synced by default
pub const DEFAULT_SYNC_DIRECTORIES: &[&str] = &[
    "workspace",
    "workspace-vibe",
    "workspace-ext",
    "articles",
    "Notes",
    "TaskManager",
];

/// Paths never synced (glob syntax)
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    "**/.obsidian/**",
    "**/.git/**",
    "**/.DS_Store",
    "**/node_modules/**",
];

/// Default number of concurrent chunk requests
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Directory under the vault root holding the sync index
pub const DEFAULT_STATE_DIR: &str = ".vaultsync";

/// Connection parameters for the remote store
#[derive(Clone)]
pub struct StoreConfig {
    /// Server base URL, e.g. `https://couch.example.com`
    pub uri: String,
    /// Basic auth user
    pub username: String,
    /// Basic auth password
    pub password: String,
    /// Database name
    pub database: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// User agent sent with every request
    pub user_agent: String,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StoreConfig {
    /// Connection parameters with default timeout and user agent
    pub fn new(
        uri: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            username: username.into(),
            password: password.into(),
            database: database.into(),
            timeout: Duration::from_secs(30),
            user_agent: concat!("vaultsync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Settings of the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local vault directory
    pub vault_root: PathBuf,
    /// Where the sync index is kept
    pub state_dir: PathBuf,
    /// Top-level directories to sync; empty means the whole vault
    pub sync_directories: Vec<String>,
    /// Glob patterns of paths never synced
    pub exclude_patterns: Vec<String>,
    /// Concurrent chunk requests
    pub max_workers: usize,
    /// Backoff for transient store failures
    pub retry: RetryPolicy,
    /// Store connection
    pub store: StoreConfig,
}

impl SyncConfig {
    /// Defaults for a vault and a store
    pub fn new(vault_root: PathBuf, store: StoreConfig) -> Self {
        let state_dir = vault_root.join(DEFAULT_STATE_DIR);
        Self {
            vault_root,
            state_dir,
            sync_directories: DEFAULT_SYNC_DIRECTORIES.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            max_workers: DEFAULT_MAX_WORKERS,
            retry: RetryPolicy::default(),
            store,
        }
    }

    /// Build from a variable map (see module docs)
    ///
    /// `vault_root` overrides `VAULT_ROOT` when given.
    pub fn from_env_map(vault_root: Option<PathBuf>, env: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let uri = get("COUCHDB_URI")
            .ok_or_else(|| SyncError::InvalidConfiguration("COUCHDB_URI is required".to_string()))?;
        let password = get("COUCHDB_PASSWORD")
            .ok_or_else(|| SyncError::InvalidConfiguration("COUCHDB_PASSWORD is required".to_string()))?;
        let username = get("COUCHDB_USER").unwrap_or("admin");
        let database = get("COUCHDB_DB").unwrap_or("obsidian");

        let mut store = StoreConfig::new(uri, database, username, password);
        if let Some(secs) = get("VAULTSYNC_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                SyncError::InvalidConfiguration(format!("VAULTSYNC_TIMEOUT_SECS is not a number: {}", secs))
            })?;
            store.timeout = Duration::from_secs(secs);
        }

        let vault_root = match vault_root {
            Some(root) => root,
            None => match get("VAULT_ROOT") {
                Some(root) => PathBuf::from(root),
                None => std::env::current_dir()?,
            },
        };

        let mut config = SyncConfig::new(vault_root, store);
        if let Some(workers) = get("VAULTSYNC_WORKERS") {
            config.max_workers = workers.parse().map_err(|_| {
                SyncError::InvalidConfiguration(format!("VAULTSYNC_WORKERS is not a number: {}", workers))
            })?;
        }
        if let Some(dirs) = get("VAULTSYNC_SYNC_DIRS") {
            config.sync_directories = if dirs == "*" {
                Vec::new()
            } else {
                dirs.split(',')
                    .map(|d| d.trim().trim_matches('/').to_string())
                    .filter(|d| !d.is_empty())
                    .collect()
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Build from the process environment and an optional `.env` file
    pub fn load(vault_root: Option<PathBuf>, env_file: Option<&Path>) -> Result<Self> {
        let env = read_env(env_file)?;
        Self::from_env_map(vault_root, &env)
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(SyncError::InvalidConfiguration("max_workers must be at least 1".to_string()));
        }
        if self.store.password.is_empty() {
            return Err(SyncError::InvalidConfiguration("COUCHDB_PASSWORD is required".to_string()));
        }
        reqwest::Url::parse(&self.store.uri).map_err(|e| {
            SyncError::InvalidConfiguration(format!("COUCHDB_URI is not a valid URL ({}): {}", e, self.store.uri))
        })?;
        if self.store.database.is_empty() {
            return Err(SyncError::InvalidConfiguration("COUCHDB_DB must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Merge a `.env` file with the process environment
///
/// Process variables take precedence. A missing file is not an error.
pub fn read_env(env_file: Option<&Path>) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();

    let candidate = env_file.map(Path::to_path_buf).or_else(|| {
        let default = PathBuf::from(".env");
        default.exists().then_some(default)
    });

    if let Some(path) = candidate {
        if path.exists() {
            debug!("Reading environment file {:?}", path);
            let iter = dotenvy::from_path_iter(&path)
                .map_err(|e| SyncError::InvalidConfiguration(format!("cannot read {:?}: {}", path, e)))?;
            for item in iter {
                let (key, value) = item
                    .map_err(|e| SyncError::InvalidConfiguration(format!("malformed {:?}: {}", path, e)))?;
                vars.insert(key, value);
            }
        } else if env_file.is_some() {
            return Err(SyncError::InvalidConfiguration(format!("env file {:?} does not exist", path)));
        }
    }

    vars.extend(std::env::vars());
    Ok(vars)
}
