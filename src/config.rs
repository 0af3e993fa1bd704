use crate::core::fingerprint::{DEFAULT_HASH_WIDTH, grid_side};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Thresholds and sizes for the two-stage funnel.
///
/// Both thresholds are deployment choices. [`FunnelConfig::lenient`] (the
/// default) favours recall; [`FunnelConfig::strict`] favours precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunnelConfig {
    /// Fingerprint width in bits.
    pub hash_width: u32,
    /// Largest Hamming distance the sieve accepts as a duplicate.
    pub hash_threshold: u32,
    /// Smallest cosine similarity the verifier accepts as a duplicate.
    pub similarity_threshold: f32,
    /// Candidates reported per stage.
    pub top_k: usize,
    /// Extra verifier candidates fetched so self-matches can be dropped
    /// without under-filling `top_k`.
    pub overfetch_margin: usize,
    /// Pins the embedding dimension before the first vector arrives.
    pub embedding_dimension: Option<usize>,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self::lenient()
    }
}

impl FunnelConfig {
    pub fn lenient() -> Self {
        Self {
            hash_width: DEFAULT_HASH_WIDTH,
            hash_threshold: 15,
            similarity_threshold: 0.2,
            top_k: 3,
            overfetch_margin: 5,
            embedding_dimension: None,
        }
    }

    pub fn strict() -> Self {
        Self {
            hash_threshold: 5,
            similarity_threshold: 0.65,
            ..Self::lenient()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if grid_side(self.hash_width).is_none() {
            return Err(ConfigError::Invalid {
                field: "hash_width",
                message: format!(
                    "{} bits is not a byte-aligned square grid (e.g. 64, 256)",
                    self.hash_width
                ),
            });
        }
        if self.hash_threshold > self.hash_width {
            return Err(ConfigError::Invalid {
                field: "hash_threshold",
                message: format!(
                    "{} exceeds the fingerprint width {}",
                    self.hash_threshold, self.hash_width
                ),
            });
        }
        if !self.similarity_threshold.is_finite()
            || !(-1.0..=1.0).contains(&self.similarity_threshold)
        {
            return Err(ConfigError::Invalid {
                field: "similarity_threshold",
                message: format!("{} is outside [-1, 1]", self.similarity_threshold),
            });
        }
        if self.top_k == 0 {
            return Err(ConfigError::Invalid {
                field: "top_k",
                message: "must be at least 1".to_string(),
            });
        }
        if self.embedding_dimension == Some(0) {
            return Err(ConfigError::Invalid {
                field: "embedding_dimension",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Verifier candidates to request before self-match filtering.
    pub fn verifier_fetch(&self) -> usize {
        self.top_k.saturating_add(self.overfetch_margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_presets_validate() {
        assert!(FunnelConfig::lenient().validate().is_ok());
        assert!(FunnelConfig::strict().validate().is_ok());
        assert_eq!(FunnelConfig::default(), FunnelConfig::lenient());
        assert_eq!(FunnelConfig::strict().hash_threshold, 5);
        assert_eq!(FunnelConfig::default().verifier_fetch(), 8);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("funnel.json");
        fs::write(&path, r#"{ "hash_threshold": 5, "top_k": 10 }"#).unwrap();

        let config = FunnelConfig::from_file(&path).unwrap();
        assert_eq!(config.hash_threshold, 5);
        assert_eq!(config.top_k, 10);
        assert_eq!(config.hash_width, 64);
        assert_eq!(config.overfetch_margin, 5);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_width = FunnelConfig {
            hash_width: 63,
            ..FunnelConfig::default()
        };
        assert!(matches!(
            bad_width.validate(),
            Err(ConfigError::Invalid {
                field: "hash_width",
                ..
            })
        ));

        let bad_threshold = FunnelConfig {
            hash_threshold: 65,
            ..FunnelConfig::default()
        };
        assert!(bad_threshold.validate().is_err());

        let bad_similarity = FunnelConfig {
            similarity_threshold: 1.5,
            ..FunnelConfig::default()
        };
        assert!(bad_similarity.validate().is_err());

        let bad_top_k = FunnelConfig {
            top_k: 0,
            ..FunnelConfig::default()
        };
        assert!(bad_top_k.validate().is_err());
    }

    #[test]
    fn test_unparseable_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("funnel.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FunnelConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
