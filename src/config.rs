use anyhow::{bail, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::DbAction;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub close: CloseConfig,

    /// Named statement sets runnable through `DbBackend::exec_action`.
    #[serde(default)]
    pub actions: Vec<DbAction>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Postgresql,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::Postgresql => "postgresql",
        }
    }
}

/// The four logical databases the application keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseRole {
    Core,
    Thumbnails,
    Faces,
    Similarity,
}

impl DatabaseRole {
    /// Default SQLite file name for this role.
    pub fn file_name(&self) -> &'static str {
        match self {
            DatabaseRole::Core => "clepho.db",
            DatabaseRole::Thumbnails => "thumbnails-clepho.db",
            DatabaseRole::Faces => "recognition.db",
            DatabaseRole::Similarity => "similarity.db",
        }
    }
}

/// Parameters identifying the target database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseType,

    /// SQLite database file, or the folder holding the database files.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    #[serde(default)]
    pub wal_mode: bool,

    /// How long SQLite itself waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub postgresql_url: Option<String>,
}

fn default_sqlite_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clepho")
}

fn default_busy_timeout_ms() -> u64 {
    0
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseType::default(),
            sqlite_path: default_sqlite_path(),
            wal_mode: false,
            busy_timeout_ms: default_busy_timeout_ms(),
            postgresql_url: None,
        }
    }
}

impl DatabaseConfig {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            sqlite_path: path.into(),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.backend {
            DatabaseType::Sqlite => !self.sqlite_path.as_os_str().is_empty(),
            DatabaseType::Postgresql => self
                .postgresql_url
                .as_deref()
                .is_some_and(|url| !url.trim().is_empty()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.is_valid() {
            match self.backend {
                DatabaseType::Sqlite => bail!("SQLite database path not configured"),
                DatabaseType::Postgresql => bail!("PostgreSQL URL not configured"),
            }
        }
        Ok(())
    }

    /// Resolve the SQLite file for a logical database.
    ///
    /// A folder resolves to the role's default file inside it. A file path is
    /// taken as the core database; the other roles live next to it.
    pub fn path_for(&self, role: DatabaseRole) -> PathBuf {
        let path = &self.sqlite_path;
        if path.is_dir() || path.extension().is_none() {
            return path.join(role.file_name());
        }
        match role {
            DatabaseRole::Core => path.clone(),
            _ => path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(role.file_name()),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Stable fingerprint of the identifying fields, hex encoded.
    pub fn hash(&self) -> String {
        let mut hasher = Md5::new();
        let path = self.sqlite_path.to_string_lossy();
        let url = self.postgresql_url.as_deref();
        // Length-prefixed so adjacent fields cannot run into each other.
        for field in [
            Some(self.backend.as_str().as_bytes()),
            Some(path.as_bytes()),
            Some(&[self.wal_mode as u8][..]),
            url.map(str::as_bytes),
        ] {
            match field {
                Some(bytes) => {
                    hasher.update([1u8]);
                    hasher.update((bytes.len() as u64).to_le_bytes());
                    hasher.update(bytes);
                }
                None => hasher.update([0u8]),
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries allowed for a statement that keeps hitting a locked database.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    250
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EscalationConfig {
    /// Upper bound on how long a querying thread waits for the error handler.
    /// Unset means wait until the handler decides.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl EscalationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseConfig {
    /// How long `close()` waits for open transactions to finish.
    #[serde(default = "default_close_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_close_timeout_ms() -> u64 {
    30_000
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl CloseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.database.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clepho")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("dbengine.toml")
    }
}
