//! Two-stage near-duplicate image detection.
//!
//! A cheap perceptual-hash sieve answers the easy cases; an exact
//! inner-product search over image embeddings catches the rest.

pub mod config;
pub mod core;

pub use crate::config::{ConfigError, FunnelConfig};
pub use crate::core::deadline::{Deadline, DeadlineExceeded};
pub use crate::core::embedding::{EmbedError, EmbeddingProvider, PrecomputedEmbeddings, l2_normalize};
pub use crate::core::fingerprint::{Fingerprint, FingerprintCodec, FingerprintError, hamming};
pub use crate::core::funnel::{DuplicateFunnel, ErrorClass, FunnelError, FunnelHandle, PairComparison};
pub use crate::core::image::{ImageLoadError, ItemId, SourceImage, load_image};
pub use crate::core::scanner::{BuildReport, ScanError, ScannerService, SkippedItem};
pub use crate::core::sieve::{HashSieve, SieveError, SieveMatch};
pub use crate::core::snapshot::{Manifest, SnapshotError, read_manifest};
pub use crate::core::vector_index::{VectorIndex, VectorIndexError, VectorMatch};
pub use crate::core::verdict::{Decision, Score, Stage, Verdict, VerdictReport};
