//! Store configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_pool_bytes() -> usize {
    128 * 1024 * 1024
}

/// Configuration of one container pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backing file for the pool. `None` keeps the pool anonymous: fast,
    /// and gone with the process.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Pool capacity in bytes.
    #[serde(default = "default_pool_bytes")]
    pub pool_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: None,
            pool_bytes: default_pool_bytes(),
        }
    }
}

#[cfg(feature = "figment_config")]
impl StoreConfig {
    /// Read the configuration from `EPOCHSTORE_*` environment variables,
    /// falling back to the defaults.
    pub fn from_env() -> crate::Result<StoreConfig> {
        use figment::{providers::Env, Figment};
        Figment::from(figment::providers::Serialized::defaults(
            StoreConfig::default(),
        ))
        .merge(Env::prefixed("EPOCHSTORE_"))
        .extract()
        .map_err(|err| {
            log::error!("invalid configuration: {}", err);
            crate::Error::Inval
        })
    }
}
