use crate::core::deadline::{Deadline, DeadlineExceeded, SCAN_CHUNK};
use crate::core::image::ItemId;
use crate::core::snapshot::{self, SnapshotError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("Got {vectors} vectors but {identifiers} identifiers")]
    CountMismatch { vectors: usize, identifiers: usize },

    #[error("Vector dimension mismatch: index holds {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Vector for {id} contains a non-finite component")]
    NonFinite { id: ItemId },

    #[error("Empty vector for {id}")]
    EmptyVector { id: ItemId },

    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// One verifier hit: higher score is closer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub slot: usize,
    pub id: ItemId,
    pub score: f32,
}

pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Exact inner-product index over L2-normalized embeddings.
///
/// Vectors live in one flat buffer; slot `i` owns
/// `data[i * dimension..(i + 1) * dimension]` and `ids[i]`. Slots are handed
/// out sequentially and never reused. The dimension is fixed by the first
/// insertion unless pinned up front with [`VectorIndex::with_dimension`].
/// Queries are expected to be normalized by the caller; nothing here
/// re-normalizes.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    pinned_dimension: Option<usize>,
    dimension: Option<usize>,
    data: Vec<f32>,
    ids: Vec<ItemId>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            pinned_dimension: Some(dimension),
            dimension: Some(dimension),
            ..Self::default()
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, slot: usize) -> Option<&ItemId> {
        self.ids.get(slot)
    }

    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        let dim = self.dimension?;
        self.data.get(slot * dim..(slot + 1) * dim)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.ids.clear();
        self.dimension = self.pinned_dimension;
    }

    /// Append `vectors`, slot-aligned with `ids`. Either every vector is
    /// accepted or none is. Returns the slots assigned.
    pub fn add_vectors(
        &mut self,
        vectors: Vec<Vec<f32>>,
        ids: Vec<ItemId>,
    ) -> Result<Range<usize>, VectorIndexError> {
        if vectors.len() != ids.len() {
            return Err(VectorIndexError::CountMismatch {
                vectors: vectors.len(),
                identifiers: ids.len(),
            });
        }

        let mut dimension = self.dimension;
        for (vector, id) in vectors.iter().zip(&ids) {
            if vector.is_empty() {
                return Err(VectorIndexError::EmptyVector { id: id.clone() });
            }
            let expected = *dimension.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(VectorIndexError::DimensionMismatch {
                    expected,
                    found: vector.len(),
                });
            }
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(VectorIndexError::NonFinite { id: id.clone() });
            }
        }

        let start = self.ids.len();
        self.dimension = dimension;
        for vector in &vectors {
            self.data.extend_from_slice(vector);
        }
        self.ids.extend(ids);

        log::debug!(
            "Added {} vectors, index size {}",
            vectors.len(),
            self.ids.len()
        );
        Ok(start..self.ids.len())
    }

    /// Rebuild from a verified snapshot; `data` must hold `ids.len()` vectors.
    pub(crate) fn from_parts(dimension: usize, data: Vec<f32>, ids: Vec<ItemId>) -> Self {
        Self {
            pinned_dimension: None,
            dimension: (dimension > 0).then_some(dimension),
            data,
            ids,
        }
    }

    pub(crate) fn data(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    pub fn add(&mut self, id: ItemId, vector: Vec<f32>) -> Result<usize, VectorIndexError> {
        self.add_vectors(vec![vector], vec![id])
            .map(|slots| slots.start)
    }

    /// The `k` highest inner products against `query`, best first. Equal
    /// scores are ordered by ascending slot. An empty index yields no results.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        deadline: Deadline,
    ) -> Result<Vec<VectorMatch>, VectorIndexError> {
        let dim = match self.dimension {
            Some(dim) if !self.is_empty() && k > 0 => dim,
            _ => return Ok(Vec::new()),
        };
        if query.len() != dim {
            return Err(VectorIndexError::DimensionMismatch {
                expected: dim,
                found: query.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = Vec::with_capacity(self.len());
        let mut chunk_scores = Vec::new();
        for chunk_start in (0..self.len()).step_by(SCAN_CHUNK) {
            deadline.check()?;
            let chunk_end = (chunk_start + SCAN_CHUNK).min(self.len());
            (chunk_start..chunk_end)
                .into_par_iter()
                .map(|slot| {
                    let vector = &self.data[slot * dim..(slot + 1) * dim];
                    (slot, inner_product(query, vector))
                })
                .collect_into_vec(&mut chunk_scores);
            scored.extend_from_slice(&chunk_scores);
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(slot, score)| VectorMatch {
                slot,
                id: self.ids[slot].clone(),
                score,
            })
            .collect())
    }

    /// Persist vectors and identifiers as one snapshot under `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), VectorIndexError> {
        let dimension = self.dimension.unwrap_or(0);
        snapshot::save_snapshot(dir, dimension, &self.data, &self.ids, None)?;
        log::info!("Saved {} vectors to {}", self.len(), dir.display());
        Ok(())
    }

    /// Restore a snapshot written by [`VectorIndex::save`]. Fails without
    /// adopting anything if the snapshot is missing, partial or corrupt.
    pub fn load(dir: &Path) -> Result<Self, VectorIndexError> {
        let snapshot = snapshot::load_snapshot(dir)?;
        let index = Self::from_parts(snapshot.dimension, snapshot.data, snapshot.ids);
        log::info!("Loaded {} vectors from {}", index.len(), dir.display());
        Ok(index)
    }

    /// [`VectorIndex::load`], falling back to an empty index when the snapshot
    /// is unavailable. The fallback is logged, never silent.
    pub fn load_or_empty(dir: &Path) -> Self {
        match Self::load(dir) {
            Ok(index) => index,
            Err(e) => {
                log::warn!(
                    "Vector snapshot at {} unavailable ({}); starting empty",
                    dir.display(),
                    e
                );
                Self::new()
            }
        }
    }
}
