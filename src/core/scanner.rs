use crate::core::embedding::PrecomputedEmbeddings;
use crate::core::fingerprint::Fingerprint;
use crate::core::funnel::DuplicateFunnel;
use crate::core::image::{ItemId, is_supported_image, load_image};
use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of a bulk build. Per-file failures land in `skipped`; they never
/// abort the build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub discovered: usize,
    pub indexed: usize,
    /// Indexed in the sieve only because no embedding was supplied for them.
    pub without_embedding: usize,
    pub skipped: Vec<SkippedItem>,
}

struct Prepared {
    path: PathBuf,
    id: ItemId,
    fingerprint: Fingerprint,
    embedding: Option<Vec<f32>>,
}

#[derive(Default)]
pub struct ScannerService {
    progress: Option<ProgressBar>,
}

impl ScannerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Recursively list supported images under `root`, in file-name order.
    pub fn discover(&self, root: &Path) -> Result<Vec<PathBuf>, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidPath {
                path: format!("{} is not a directory", root.display()),
            });
        }

        let mut images = Vec::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            if path.is_file() && is_supported_image(path) {
                images.push(path.to_path_buf());
            }
        }
        Ok(images)
    }

    /// Fingerprint every image under `root` in parallel and add it to
    /// `funnel`. Items with an entry in `embeddings` are added to the
    /// verifier as well.
    pub fn build(
        &self,
        funnel: &mut DuplicateFunnel,
        root: &Path,
        embeddings: Option<&PrecomputedEmbeddings>,
    ) -> Result<BuildReport, ScanError> {
        let files = self.discover(root)?;
        let mut report = BuildReport {
            discovered: files.len(),
            ..BuildReport::default()
        };
        if let Some(bar) = &self.progress {
            bar.set_length(files.len() as u64);
        }

        let shared: &DuplicateFunnel = funnel;
        let results: Vec<Result<Prepared, SkippedItem>> = files
            .into_par_iter()
            .map(|path| {
                let result = prepare(shared, &path, embeddings);
                if let Some(bar) = &self.progress {
                    bar.inc(1);
                }
                result
            })
            .collect();

        for result in results {
            let item = match result {
                Ok(item) => item,
                Err(skipped) => {
                    log::warn!("Skipping {}: {}", skipped.path.display(), skipped.reason);
                    report.skipped.push(skipped);
                    continue;
                }
            };

            let has_embedding = item.embedding.is_some();
            if let Err(e) = funnel.index_fingerprint(item.id, item.fingerprint, item.embedding) {
                log::warn!("Skipping {}: {}", item.path.display(), e);
                report.skipped.push(SkippedItem {
                    path: item.path,
                    reason: e.to_string(),
                });
                continue;
            }
            if !has_embedding {
                if embeddings.is_some() {
                    log::warn!("No embedding for {}; sieve only", item.path.display());
                }
                report.without_embedding += 1;
            }
            report.indexed += 1;
        }

        log::info!(
            "Indexed {} of {} images ({} skipped)",
            report.indexed,
            report.discovered,
            report.skipped.len()
        );
        Ok(report)
    }
}

fn prepare(
    funnel: &DuplicateFunnel,
    path: &Path,
    embeddings: Option<&PrecomputedEmbeddings>,
) -> Result<Prepared, SkippedItem> {
    let image = load_image(path).map_err(|e| SkippedItem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let id = ItemId::from_path(path);
    let embedding = embeddings.and_then(|e| e.get(&id)).map(<[f32]>::to_vec);

    Ok(Prepared {
        path: path.to_path_buf(),
        fingerprint: funnel.fingerprint(&image),
        id,
        embedding,
    })
}
