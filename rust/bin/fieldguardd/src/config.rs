//! Server configuration file.
//!
//! ```toml
//! listen = "0.0.0.0:8080"
//!
//! [storage]
//! data_dir = "/var/lib/fieldguard"
//!
//! [[models]]
//! name = "Product"
//! read_only = { status = true, type = "create-only" }
//! ```

use std::path::{Path, PathBuf};

use fieldguard::ModelConfig;
use serde::{Deserialize, Serialize};

/// Listen address used when neither the CLI nor the file sets one.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    pub storage: StorageConfig,

    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the database file.
    pub data_dir: String,

    /// Database file. Relative paths resolve against `data_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Refuse configurations the server cannot start with.
    pub fn verify(&self) -> anyhow::Result<()> {
        if self.storage.data_dir.is_empty() {
            anyhow::bail!("Storage data_dir is empty in configuration.");
        }
        if self.models.is_empty() {
            anyhow::bail!("No models declared in configuration.");
        }
        Ok(())
    }

    /// The CLI address wins over the file, the file over the default.
    pub fn listen_addr(&self, cli: Option<&str>) -> String {
        cli.or(self.listen.as_deref())
            .unwrap_or(DEFAULT_LISTEN)
            .to_string()
    }
}

impl StorageConfig {
    pub fn resolve_db_path(&self) -> PathBuf {
        let data_dir = PathBuf::from(&self.data_dir);
        match &self.db_path {
            Some(p) => data_dir.join(p),
            None => data_dir.join("records.redb"),
        }
    }
}
