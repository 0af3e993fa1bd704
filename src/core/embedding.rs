use crate::core::image::{ItemId, SourceImage};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("No embedding available for {id}")]
    Missing { id: String },

    #[error("Embedding has zero norm or non-finite components")]
    Degenerate,

    #[error("Embedding dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Embedding provider failed: {message}")]
    Provider { message: String },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed embedding record at {path}:{line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Turns a decoded image into an L2-normalized embedding.
///
/// Implementations must be deterministic for identical input; vectors are
/// only comparable to vectors from the same provider and dimension.
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, source: &SourceImage<'_>) -> Result<Vec<f32>, EmbedError>;
}

/// Scale `vector` to unit length in place.
pub fn l2_normalize(vector: &mut [f32]) -> Result<(), EmbedError> {
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(EmbedError::Degenerate);
    }
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return Err(EmbedError::Degenerate);
    }
    vector.iter_mut().for_each(|x| *x /= norm);
    Ok(())
}

#[derive(Deserialize)]
struct EmbeddingRecord {
    id: String,
    vector: Vec<f32>,
}

/// Embeddings computed ahead of time by an external model, served by
/// identifier.
///
/// The on-disk form is JSON Lines, one `{"id": ..., "vector": [...]}` object
/// per line. Identifiers that look like existing file paths are resolved the
/// same way [`ItemId::from_path`] resolves them.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedEmbeddings {
    dimension: usize,
    vectors: HashMap<ItemId, Vec<f32>>,
}

impl PrecomputedEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: ItemId, mut vector: Vec<f32>) -> Result<(), EmbedError> {
        if self.vectors.is_empty() && self.dimension == 0 {
            self.dimension = vector.len();
        }
        if vector.len() != self.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                found: vector.len(),
            });
        }
        l2_normalize(&mut vector)?;
        self.vectors.insert(id, vector);
        Ok(())
    }

    pub fn from_jsonl(path: &Path) -> Result<Self, EmbedError> {
        let file = File::open(path).map_err(|source| EmbedError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut embeddings = Self::new(0);
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| EmbedError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }

            let malformed = |message: String| EmbedError::Malformed {
                path: path.to_path_buf(),
                line: i + 1,
                message,
            };
            let record: EmbeddingRecord =
                serde_json::from_str(&line).map_err(|e| malformed(e.to_string()))?;

            let id = resolve_id(base, &record.id);
            embeddings
                .insert(id, record.vector)
                .map_err(|e| malformed(e.to_string()))?;
        }

        log::info!(
            "Loaded {} precomputed embeddings (dimension {}) from {}",
            embeddings.len(),
            embeddings.dimension,
            path.display()
        );
        Ok(embeddings)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn get(&self, id: &ItemId) -> Option<&[f32]> {
        self.vectors.get(id).map(Vec::as_slice)
    }
}

impl EmbeddingProvider for PrecomputedEmbeddings {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, source: &SourceImage<'_>) -> Result<Vec<f32>, EmbedError> {
        let id = source.id.ok_or_else(|| EmbedError::Missing {
            id: "<anonymous query>".to_string(),
        })?;
        self.get(id)
            .map(<[f32]>::to_vec)
            .ok_or_else(|| EmbedError::Missing { id: id.to_string() })
    }
}

/// Relative paths are taken relative to the embeddings file; anything that
/// does not name an existing file stays an opaque identifier.
fn resolve_id(base: &Path, raw: &str) -> ItemId {
    let candidate = Path::new(raw);
    let path = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    if path.is_file() {
        ItemId::from_path(&path)
    } else {
        ItemId::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        assert!(matches!(
            l2_normalize(&mut [0.0, 0.0]),
            Err(EmbedError::Degenerate)
        ));
        assert!(matches!(
            l2_normalize(&mut [f32::INFINITY, 1.0]),
            Err(EmbedError::Degenerate)
        ));
    }

    #[test]
    fn test_jsonl_loading_normalizes_and_resolves_paths() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("cat.png");
        fs::write(&image_path, b"stand-in").unwrap();

        let jsonl = temp_dir.path().join("embeddings.jsonl");
        fs::write(
            &jsonl,
            "{\"id\": \"cat.png\", \"vector\": [2.0, 0.0]}\n\n{\"id\": \"opaque-7\", \"vector\": [0.0, 5.0]}\n",
        )
        .unwrap();

        let embeddings = PrecomputedEmbeddings::from_jsonl(&jsonl).unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings.dimension(), 2);
        assert_eq!(
            embeddings.get(&ItemId::from_path(&image_path)),
            Some(&[1.0, 0.0][..])
        );
        assert_eq!(
            embeddings.get(&ItemId::new("opaque-7")),
            Some(&[0.0, 1.0][..])
        );
    }

    #[test]
    fn test_jsonl_rejects_mixed_dimensions() {
        let temp_dir = TempDir::new().unwrap();
        let jsonl = temp_dir.path().join("embeddings.jsonl");
        fs::write(
            &jsonl,
            "{\"id\": \"a\", \"vector\": [1.0, 0.0]}\n{\"id\": \"b\", \"vector\": [1.0]}\n",
        )
        .unwrap();

        let err = PrecomputedEmbeddings::from_jsonl(&jsonl).unwrap_err();
        assert!(matches!(err, EmbedError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_embed_requires_known_identity() {
        let mut embeddings = PrecomputedEmbeddings::new(2);
        embeddings.insert(ItemId::new("known"), vec![1.0, 1.0]).unwrap();
        let image = DynamicImage::new_rgb8(2, 2);

        let known = ItemId::new("known");
        let v = embeddings
            .embed(&SourceImage::with_id(&image, &known))
            .unwrap();
        assert!((v[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);

        let unknown = ItemId::new("unknown");
        assert!(matches!(
            embeddings.embed(&SourceImage::with_id(&image, &unknown)),
            Err(EmbedError::Missing { .. })
        ));
        assert!(matches!(
            embeddings.embed(&SourceImage::new(&image)),
            Err(EmbedError::Missing { .. })
        ));
    }
}
