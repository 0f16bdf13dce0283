//! Cache configuration.
//!
//! Options may be deserialized from a configuration file section; defaults
//! match a mid-size deployment.

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_avl_max() -> usize {
    65536
}

fn default_avl_chunk() -> usize {
    128
}

fn default_avl_chunk_split() -> usize {
    default_avl_chunk() * 4
}

fn default_avl_detached_max() -> usize {
    1024
}

fn default_expire_time_attr() -> u64 {
    60
}

fn default_entries_hwmark() -> usize {
    100_000
}

fn default_chunks_hwmark() -> usize {
    100_000
}

/// Directory dirent-cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DirConfig {
    /// Hard ceiling on active dirents per directory. Exceeding it triggers
    /// overflow and puts the directory into bypass mode.
    pub avl_max: usize,

    /// Target dirents per chunk. 0 disables chunking (legacy mode keeps a
    /// single by-name index per directory).
    pub avl_chunk: usize,

    /// A chunk reaching this many dirents is split in half. Must be at least
    /// twice `avl_chunk`.
    pub avl_chunk_split: usize,

    /// Cap on detached dirents kept per directory; the oldest is evicted
    /// when the list is full.
    pub avl_detached_max: usize,
}

impl Default for DirConfig {
    fn default() -> Self {
        Self {
            avl_max: default_avl_max(),
            avl_chunk: default_avl_chunk(),
            avl_chunk_split: default_avl_chunk_split(),
            avl_detached_max: default_avl_detached_max(),
        }
    }
}

/// Top-level metadata cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MdcConfig {
    /// Directory dirent-cache tuning.
    pub dir: DirConfig,

    /// Whether an incomplete readdir (no end-of-directory despite apparent
    /// completion) is retried with a delay rather than surfaced as success.
    pub retry_readdir: bool,

    /// Default attribute TTL in seconds. An export may override it.
    pub expire_time_attr: u64,

    /// High watermark on cached entries before eviction starts.
    pub entries_hwmark: usize,

    /// High watermark on resident dirent chunks across all directories.
    pub chunks_hwmark: usize,

    /// Serve negative lookups from a fully-populated trusted directory
    /// without consulting the sub-FSAL.
    pub trust_readdir_negative_cache: bool,
}

impl Default for MdcConfig {
    fn default() -> Self {
        Self {
            dir: DirConfig::default(),
            retry_readdir: false,
            expire_time_attr: default_expire_time_attr(),
            entries_hwmark: default_entries_hwmark(),
            chunks_hwmark: default_chunks_hwmark(),
            trust_readdir_negative_cache: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),
}

impl MdcConfig {
    /// Validate the correctness of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.dir.avl_chunk > 0 {
            if self.dir.avl_chunk_split < 2 * self.dir.avl_chunk {
                errors.push(format!(
                    "dir.avl-chunk-split ({}) must be at least twice dir.avl-chunk ({})",
                    self.dir.avl_chunk_split, self.dir.avl_chunk
                ));
            }
            if self.dir.avl_max < self.dir.avl_chunk {
                errors.push(format!(
                    "dir.avl-max ({}) must not be smaller than dir.avl-chunk ({})",
                    self.dir.avl_max, self.dir.avl_chunk
                ));
            }
        }

        if self.dir.avl_max == 0 {
            errors.push("dir.avl-max must be non-zero".to_owned());
        }

        if self.entries_hwmark == 0 {
            errors.push("entries-hwmark must be non-zero".to_owned());
        }

        if self.chunks_hwmark == 0 {
            errors.push("chunks-hwmark must be non-zero".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(errors))
        }
    }

    /// True when dirent chunking is enabled.
    pub fn chunking(&self) -> bool {
        self.dir.avl_chunk > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MdcConfig::default()
            .validate()
            .expect("default config should be valid");
    }

    #[test]
    fn split_below_twice_chunk_rejected() {
        let mut config = MdcConfig::default();
        config.dir.avl_chunk = 128;
        config.dir.avl_chunk_split = 200;
        assert!(
            config.validate().is_err(),
            "split threshold below 2x chunk size must be rejected"
        );
    }

    #[test]
    fn zero_chunk_disables_chunking() {
        let mut config = MdcConfig::default();
        config.dir.avl_chunk = 0;
        config.validate().expect("legacy mode should be valid");
        assert!(!config.chunking());
    }
}
