use crate::config::{ConfigError, FunnelConfig};
use crate::core::deadline::Deadline;
use crate::core::embedding::{EmbedError, EmbeddingProvider};
use crate::core::fingerprint::{Fingerprint, FingerprintCodec, FingerprintError};
use crate::core::image::{ImageLoadError, ItemId, SourceImage};
use crate::core::sieve::{HashSieve, SieveError};
use crate::core::snapshot::{self, SnapshotError};
use crate::core::vector_index::{VectorIndex, VectorIndexError, inner_product};
use crate::core::verdict::Verdict;
use image::DynamicImage;
use serde::Serialize;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    Sieve(#[from] SieveError),

    #[error(transparent)]
    Vectors(#[from] VectorIndexError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Image(#[from] ImageLoadError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// How a caller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad image, vector shape or configuration. Not retryable.
    Input,
    /// Snapshot missing or incomplete. Fall back to an empty index or abort.
    IndexUnavailable,
    /// A scan ran past its deadline. No partial result was produced.
    DeadlineExceeded,
}

impl FunnelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FunnelError::Sieve(SieveError::Deadline(_))
            | FunnelError::Vectors(VectorIndexError::Deadline(_)) => ErrorClass::DeadlineExceeded,
            FunnelError::Snapshot(_) | FunnelError::Vectors(VectorIndexError::Snapshot(_)) => {
                ErrorClass::IndexUnavailable
            }
            _ => ErrorClass::Input,
        }
    }
}

/// Both stages judged independently for a pair of images.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairComparison {
    pub hamming: u32,
    pub sieve_duplicate: bool,
    pub similarity: Option<f32>,
    pub verifier_duplicate: Option<bool>,
}

impl PairComparison {
    pub fn is_duplicate(&self) -> bool {
        self.sieve_duplicate || self.verifier_duplicate.unwrap_or(false)
    }
}

/// Sieve-then-verify duplicate detector.
///
/// Owns both sub-indexes and is their only mutator. Queries take `&self`, so
/// a built funnel can be shared across threads; see [`FunnelHandle`] for
/// replacing it while queries are in flight.
#[derive(Debug)]
pub struct DuplicateFunnel {
    config: FunnelConfig,
    codec: FingerprintCodec,
    sieve: HashSieve,
    vectors: VectorIndex,
}

impl DuplicateFunnel {
    pub fn new(config: FunnelConfig) -> Result<Self, FunnelError> {
        let vectors = match config.embedding_dimension {
            Some(dim) => VectorIndex::with_dimension(dim),
            None => VectorIndex::new(),
        };
        Self::with_indexes(config, HashSieve::new(), vectors)
    }

    pub fn with_indexes(
        config: FunnelConfig,
        sieve: HashSieve,
        vectors: VectorIndex,
    ) -> Result<Self, FunnelError> {
        config.validate()?;
        let codec = FingerprintCodec::new(config.hash_width)?;

        if let Some((_, stray)) = sieve
            .fingerprints()
            .find(|(_, fp)| fp.width() != codec.width())
        {
            return Err(FingerprintError::DimensionMismatch {
                left: codec.width(),
                right: stray.width(),
            }
            .into());
        }
        if let (Some(expected), Some(found)) = (config.embedding_dimension, vectors.dimension()) {
            if expected != found {
                return Err(VectorIndexError::DimensionMismatch { expected, found }.into());
            }
        }

        Ok(Self {
            config,
            codec,
            sieve,
            vectors,
        })
    }

    pub fn config(&self) -> &FunnelConfig {
        &self.config
    }

    pub fn sieve(&self) -> &HashSieve {
        &self.sieve
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn fingerprint(&self, image: &DynamicImage) -> Fingerprint {
        self.codec.fingerprint(image)
    }

    /// Record a fingerprint computed elsewhere. Its width must match the codec.
    pub fn insert_fingerprint(
        &mut self,
        id: ItemId,
        fingerprint: Fingerprint,
    ) -> Result<(), FunnelError> {
        self.index_fingerprint(id, fingerprint, None)
    }

    /// Index one item from an already computed fingerprint. Nothing is
    /// changed unless both the fingerprint and the embedding are accepted.
    pub fn index_fingerprint(
        &mut self,
        id: ItemId,
        fingerprint: Fingerprint,
        embedding: Option<Vec<f32>>,
    ) -> Result<(), FunnelError> {
        if fingerprint.width() != self.codec.width() {
            return Err(FingerprintError::DimensionMismatch {
                left: self.codec.width(),
                right: fingerprint.width(),
            }
            .into());
        }
        if let Some(vector) = embedding {
            self.vectors.add(id.clone(), vector)?;
        }
        self.sieve.insert(id, fingerprint);
        Ok(())
    }

    pub fn add_vectors(
        &mut self,
        vectors: Vec<Vec<f32>>,
        ids: Vec<ItemId>,
    ) -> Result<Range<usize>, FunnelError> {
        Ok(self.vectors.add_vectors(vectors, ids)?)
    }

    /// Index one item in both stages.
    pub fn index_item(
        &mut self,
        id: ItemId,
        image: &DynamicImage,
        embedding: Option<Vec<f32>>,
    ) -> Result<(), FunnelError> {
        let fingerprint = self.codec.fingerprint(image);
        self.index_fingerprint(id, fingerprint, embedding)
    }

    pub fn clear(&mut self) {
        self.sieve.clear();
        self.vectors.clear();
    }

    /// Run the full funnel for `query`. The embedder is consulted only when
    /// the sieve finds nothing.
    pub fn detect(
        &self,
        query: &SourceImage<'_>,
        embedder: &dyn EmbeddingProvider,
        deadline: Deadline,
    ) -> Result<Verdict, FunnelError> {
        let fingerprint = self.codec.fingerprint(query.image);
        self.detect_fingerprint(&fingerprint, query.id, deadline, || embedder.embed(query))
    }

    /// [`DuplicateFunnel::detect`] with the fingerprint already computed and
    /// the embedding supplied lazily.
    pub fn detect_fingerprint<F>(
        &self,
        fingerprint: &Fingerprint,
        query_id: Option<&ItemId>,
        deadline: Deadline,
        embed: F,
    ) -> Result<Verdict, FunnelError>
    where
        F: FnOnce() -> Result<Vec<f32>, EmbedError>,
    {
        let sieve_matches = self.sieve.query(
            fingerprint,
            self.config.hash_threshold,
            query_id,
            self.config.top_k,
            deadline,
        )?;

        if let Some(verdict) = Verdict::from_sieve(sieve_matches) {
            log::debug!(
                "Sieve hit for {}: {} candidate(s)",
                query_label(query_id),
                verdict.sieve_matches().len()
            );
            return Ok(verdict);
        }

        let embedding = embed()?;
        self.verify(&embedding, query_id, deadline)
    }

    /// Verifier stage on its own: over-fetch, drop the query's own entry,
    /// keep scores at or above the similarity threshold.
    pub fn verify(
        &self,
        embedding: &[f32],
        query_id: Option<&ItemId>,
        deadline: Deadline,
    ) -> Result<Verdict, FunnelError> {
        let candidates = self
            .vectors
            .search(embedding, self.config.verifier_fetch(), deadline)?;

        let survivors: Vec<_> = candidates
            .into_iter()
            .filter(|m| Some(&m.id) != query_id)
            .filter(|m| m.score >= self.config.similarity_threshold)
            .take(self.config.top_k)
            .collect();

        log::debug!(
            "Verifier for {}: {} survivor(s) at >= {}",
            query_label(query_id),
            survivors.len(),
            self.config.similarity_threshold
        );
        Ok(Verdict::from_verifier(survivors))
    }

    /// Score two images against each other with both stages' thresholds.
    /// `embeddings` must already be normalized.
    pub fn compare(
        &self,
        a: &DynamicImage,
        b: &DynamicImage,
        embeddings: Option<(&[f32], &[f32])>,
    ) -> Result<PairComparison, FunnelError> {
        let hamming = self.codec.fingerprint(a).hamming(&self.codec.fingerprint(b))?;

        let similarity = match embeddings {
            Some((ea, eb)) if ea.len() != eb.len() => {
                return Err(EmbedError::DimensionMismatch {
                    expected: ea.len(),
                    found: eb.len(),
                }
                .into());
            }
            Some((ea, eb)) => Some(inner_product(ea, eb)),
            None => None,
        };

        Ok(PairComparison {
            hamming,
            sieve_duplicate: hamming <= self.config.hash_threshold,
            similarity,
            verifier_duplicate: similarity.map(|s| s >= self.config.similarity_threshold),
        })
    }

    /// Persist both sub-indexes under `dir` as one snapshot. The sieve is an
    /// artifact of the same manifest as the vectors, so an interrupted save
    /// leaves the previous generation of both in place.
    pub fn save(&self, dir: &Path) -> Result<(), FunnelError> {
        let sieve = self.sieve.encode()?;
        snapshot::save_snapshot(
            dir,
            self.vectors.dimension().unwrap_or(0),
            self.vectors.data(),
            self.vectors.ids(),
            Some(&sieve),
        )?;
        log::info!(
            "Saved {} fingerprints and {} vectors to {}",
            self.sieve.len(),
            self.vectors.len(),
            dir.display()
        );
        Ok(())
    }

    /// Restore both sub-indexes from `dir`; fails if either is unavailable.
    pub fn load(dir: &Path, config: FunnelConfig) -> Result<Self, FunnelError> {
        let (sieve, vectors) = Self::load_indexes(dir)?;
        Self::with_indexes(config, sieve, vectors)
    }

    /// Read a snapshot written by [`DuplicateFunnel::save`] without binding
    /// it to a configuration.
    pub fn load_indexes(dir: &Path) -> Result<(HashSieve, VectorIndex), FunnelError> {
        let contents = snapshot::load_snapshot(dir)?;
        let sieve_bytes = contents.sieve.ok_or_else(|| SnapshotError::Partial {
            message: format!("{} holds vectors but no sieve", dir.display()),
        })?;
        let sieve = HashSieve::decode(&sieve_bytes, &dir.display().to_string())?;
        let vectors = VectorIndex::from_parts(contents.dimension, contents.data, contents.ids);
        log::info!(
            "Loaded {} fingerprints and {} vectors from {}",
            sieve.len(),
            vectors.len(),
            dir.display()
        );
        Ok((sieve, vectors))
    }
}

fn query_label(query_id: Option<&ItemId>) -> &str {
    query_id.map(ItemId::as_str).unwrap_or("<anonymous query>")
}

/// Shared, swappable funnel for concurrent query serving.
///
/// Readers take a cheap `Arc` clone and query without holding the lock. A
/// rebuild constructs a fresh funnel off to the side and installs it with
/// [`FunnelHandle::swap`]; in-flight queries finish on the old one.
#[derive(Debug)]
pub struct FunnelHandle {
    current: RwLock<Arc<DuplicateFunnel>>,
}

impl FunnelHandle {
    pub fn new(funnel: DuplicateFunnel) -> Self {
        Self {
            current: RwLock::new(Arc::new(funnel)),
        }
    }

    pub fn current(&self) -> Arc<DuplicateFunnel> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Install `funnel` and return the one it replaced.
    pub fn swap(&self, funnel: DuplicateFunnel) -> Arc<DuplicateFunnel> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, Arc::new(funnel))
    }
}
