//! Cache configuration
//!
//! Serde-backed configuration for the default `memory | file | http`
//! pipeline. Every field has a default so a minimal (or empty) YAML
//! document yields a working cache.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::fetcher::{FetcherConfig, HttpFetcher};
use crate::layered::{LayeredCache, Node};
use crate::store::{FileStore, MemoryStore};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub memory: MemoryStoreConfig,
    #[serde(default)]
    pub file: FileStoreConfig,
    #[serde(default)]
    pub http: FetcherConfig,
}

impl CacheConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    #[serde(default = "default_total_cost_limit_mb")]
    pub total_cost_limit_mb: u64,
    /// `None` means unlimited entry count
    #[serde(default)]
    pub count_limit: Option<usize>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            total_cost_limit_mb: default_total_cost_limit_mb(),
            count_limit: None,
        }
    }
}

fn default_total_cost_limit_mb() -> u64 {
    128
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStoreConfig {
    /// Subdirectory of the platform cache directory
    #[serde(default = "default_store_name")]
    pub name: String,
    /// Explicit root; overrides `name` when set
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            name: default_store_name(),
            root: None,
        }
    }
}

fn default_store_name() -> String {
    "WebCache".to_string()
}

impl FileStoreConfig {
    /// The directory entries live in: the explicit root when set, else the
    /// platform user-cache directory plus `name`.
    pub fn resolve_root(&self) -> PathBuf {
        match &self.root {
            Some(root) => root.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(&self.name),
        }
    }
}

impl LayeredCache {
    /// Assemble the default `memory | file | http` pipeline.
    pub fn from_config(config: &CacheConfig) -> Result<LayeredCache, CacheError> {
        let memory = MemoryStore::with_limits(
            config.memory.total_cost_limit_mb * 1024 * 1024,
            config.memory.count_limit,
        );
        let file = FileStore::new(config.file.resolve_root());
        let http = HttpFetcher::with_config(&config.http)?;

        match Node::from(memory) | Node::from(file) | Node::from(http) {
            Node::Cache(cache) => Ok((*cache).clone()),
            _ => unreachable!("composition always yields a cache"),
        }
    }
}
