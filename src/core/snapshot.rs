//! Crash-safe persistence for the vector index and, when saved through the
//! funnel, the hash sieve alongside it.
//!
//! A snapshot directory holds content-addressed artifacts (the vector block,
//! the slot-aligned identifier list and optionally the sieve) and a
//! `manifest.json` naming them together with their blake3 digests. Artifacts
//! are written first and the manifest is swapped in last, so a reader sees
//! either the previous snapshot or the new one, never a mix. Loading verifies
//! digests and counts before anything is handed back.

use crate::core::image::ItemId;
use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.json";
const FORMAT_VERSION: u32 = 1;
const VECTORS_PREFIX: &str = "vectors-";
const IDENTIFIERS_PREFIX: &str = "identifiers-";
const SIEVE_PREFIX: &str = "sieve-";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot not found: {path}")]
    Missing { path: PathBuf },

    #[error("Snapshot only partially present: {message}")]
    Partial { message: String },

    #[error("Snapshot artifact {artifact} is corrupt: {message}")]
    Corrupt { artifact: String, message: String },

    #[error("Snapshot artifacts disagree: {message}")]
    Inconsistent { message: String },

    #[error("Unsupported snapshot format version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary encoding error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl SnapshotError {
    pub(crate) fn from_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            SnapshotError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub file: String,
    pub blake3: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub dimension: usize,
    pub count: usize,
    pub vectors: ArtifactRef,
    pub identifiers: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sieve: Option<ArtifactRef>,
    pub saved_at: DateTime<Utc>,
}

/// Contents of a verified snapshot.
#[derive(Debug)]
pub(crate) struct Snapshot {
    pub dimension: usize,
    pub data: Vec<f32>,
    pub ids: Vec<ItemId>,
    /// Encoded sieve, present when the snapshot was written by the funnel.
    pub sieve: Option<Vec<u8>>,
}

/// Replace `path` with `bytes` via a synced temp file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let io_err = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(parent).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

pub(crate) fn save_snapshot(
    dir: &Path,
    dimension: usize,
    data: &[f32],
    ids: &[ItemId],
    sieve: Option<&[u8]>,
) -> Result<Manifest, SnapshotError> {
    let vector_bytes = bincode::options().serialize(&(dimension, data))?;
    let id_bytes = serde_json::to_vec(ids)?;

    let vectors = artifact_ref(VECTORS_PREFIX, "bin", &vector_bytes);
    let identifiers = artifact_ref(IDENTIFIERS_PREFIX, "json", &id_bytes);
    let sieve_ref = sieve.map(|bytes| artifact_ref(SIEVE_PREFIX, "json", bytes));

    write_atomic(&dir.join(&vectors.file), &vector_bytes)?;
    write_atomic(&dir.join(&identifiers.file), &id_bytes)?;
    if let (Some(artifact), Some(bytes)) = (&sieve_ref, sieve) {
        write_atomic(&dir.join(&artifact.file), bytes)?;
    }

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        dimension,
        count: ids.len(),
        vectors,
        identifiers,
        sieve: sieve_ref,
        saved_at: Utc::now(),
    };
    write_atomic(
        &dir.join(MANIFEST_FILE),
        &serde_json::to_vec_pretty(&manifest)?,
    )?;

    remove_stale_artifacts(dir, &manifest);
    Ok(manifest)
}

pub fn read_manifest(dir: &Path) -> Result<Manifest, SnapshotError> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(if has_artifacts(dir) {
                SnapshotError::Partial {
                    message: format!("{} has artifacts but no manifest", dir.display()),
                }
            } else {
                SnapshotError::Missing { path }
            });
        }
        Err(e) => return Err(SnapshotError::from_io(&path, e)),
    };

    let manifest: Manifest =
        serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Corrupt {
            artifact: MANIFEST_FILE.to_string(),
            message: e.to_string(),
        })?;

    if manifest.format_version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion {
            found: manifest.format_version,
        });
    }
    Ok(manifest)
}

pub(crate) fn load_snapshot(dir: &Path) -> Result<Snapshot, SnapshotError> {
    let manifest = read_manifest(dir)?;

    let vector_bytes = read_artifact(dir, &manifest.vectors)?;
    let id_bytes = read_artifact(dir, &manifest.identifiers)?;
    let sieve = match &manifest.sieve {
        Some(artifact) => Some(read_artifact(dir, artifact)?),
        None => None,
    };

    let (dimension, data): (usize, Vec<f32>) = bincode::options()
        .with_limit(vector_bytes.len() as u64)
        .deserialize(&vector_bytes)
        .map_err(|e| SnapshotError::Corrupt {
            artifact: manifest.vectors.file.clone(),
            message: e.to_string(),
        })?;
    let ids: Vec<ItemId> =
        serde_json::from_slice(&id_bytes).map_err(|e| SnapshotError::Corrupt {
            artifact: manifest.identifiers.file.clone(),
            message: e.to_string(),
        })?;

    if dimension != manifest.dimension {
        return Err(SnapshotError::Inconsistent {
            message: format!(
                "manifest dimension {} but vector block dimension {}",
                manifest.dimension, dimension
            ),
        });
    }
    if ids.len() != manifest.count {
        return Err(SnapshotError::Inconsistent {
            message: format!(
                "manifest count {} but {} identifiers",
                manifest.count,
                ids.len()
            ),
        });
    }
    if manifest.count > 0 && dimension == 0 {
        return Err(SnapshotError::Inconsistent {
            message: format!("{} vectors of dimension 0", manifest.count),
        });
    }
    let expected = manifest.count.checked_mul(dimension).ok_or_else(|| {
        SnapshotError::Inconsistent {
            message: format!(
                "{} vectors of dimension {} overflow the address space",
                manifest.count, dimension
            ),
        }
    })?;
    if data.len() != expected {
        return Err(SnapshotError::Inconsistent {
            message: format!(
                "{} floats cannot hold {} vectors of dimension {}",
                data.len(),
                manifest.count,
                dimension
            ),
        });
    }

    Ok(Snapshot {
        dimension,
        data,
        ids,
        sieve,
    })
}

fn artifact_ref(prefix: &str, extension: &str, bytes: &[u8]) -> ArtifactRef {
    let digest = blake3::hash(bytes).to_hex().to_string();
    ArtifactRef {
        file: format!("{}{}.{}", prefix, &digest[..16], extension),
        blake3: digest,
    }
}

fn read_artifact(dir: &Path, artifact: &ArtifactRef) -> Result<Vec<u8>, SnapshotError> {
    let path = dir.join(&artifact.file);
    let bytes = fs::read(&path).map_err(|e| match SnapshotError::from_io(&path, e) {
        SnapshotError::Missing { path } => SnapshotError::Partial {
            message: format!("manifest names {} but it is missing", path.display()),
        },
        other => other,
    })?;

    let digest = blake3::hash(&bytes).to_hex().to_string();
    if digest != artifact.blake3 {
        return Err(SnapshotError::Corrupt {
            artifact: artifact.file.clone(),
            message: format!("digest {} does not match manifest {}", digest, artifact.blake3),
        });
    }
    Ok(bytes)
}

fn is_artifact_name(name: &str) -> bool {
    [VECTORS_PREFIX, IDENTIFIERS_PREFIX, SIEVE_PREFIX]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn has_artifacts(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|e| is_artifact_name(&e.file_name().to_string_lossy()))
        })
        .unwrap_or(false)
}

fn remove_stale_artifacts(dir: &Path, manifest: &Manifest) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Could not list {} for cleanup: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_artifact_name(&name)
            || name == manifest.vectors.file
            || name == manifest.identifiers.file
            || manifest.sieve.as_ref().is_some_and(|s| name == s.file)
        {
            continue;
        }
        if let Err(e) = fs::remove_file(entry.path()) {
            log::warn!("Failed to remove stale artifact {}: {}", name, e);
        }
    }
}
