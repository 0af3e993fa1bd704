use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions picked up when scanning a reference collection.
pub const SUPPORTED_EXTENSIONS: [&str; 8] =
    ["jpg", "jpeg", "png", "webp", "bmp", "gif", "tiff", "tif"];

#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("Image not found: {path}")]
    NotFound { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Opaque, stable identity of an indexed item.
///
/// For filesystem-backed collections this is the resolved path, so two
/// spellings of the same file compare equal. That equality is what self-match
/// suppression relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity for a file on disk. Resolves symlinks and relative segments
    /// when the file exists, otherwise falls back to the absolute path.
    pub fn from_path(path: &Path) -> Self {
        let resolved = path
            .canonicalize()
            .or_else(|_| std::path::absolute(path))
            .unwrap_or_else(|_| path.to_path_buf());
        Self(resolved.to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A decoded image plus the identity it is known by, if any.
///
/// Queries for fresh uploads carry no identity; queries for items that may
/// already be indexed carry one so their own entry can be excluded.
#[derive(Debug, Clone, Copy)]
pub struct SourceImage<'a> {
    pub image: &'a DynamicImage,
    pub id: Option<&'a ItemId>,
}

impl<'a> SourceImage<'a> {
    pub fn new(image: &'a DynamicImage) -> Self {
        Self { image, id: None }
    }

    pub fn with_id(image: &'a DynamicImage, id: &'a ItemId) -> Self {
        Self {
            image,
            id: Some(id),
        }
    }
}

/// Force a fixed color mode so grayscale, palette and alpha inputs hash the
/// same way as their RGB rendering.
pub fn canonicalize(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgb8(_) => image,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

/// Open, decode and canonicalize an image file.
pub fn load_image(path: &Path) -> Result<DynamicImage, ImageLoadError> {
    if !path.exists() {
        return Err(ImageLoadError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|source| ImageLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let decoded = reader.decode().map_err(|source| ImageLoadError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(canonicalize(decoded))
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_canonicalize_grayscale_to_rgb() {
        let gray = ImageBuffer::from_fn(4, 4, |x, _| Luma([(x * 60) as u8]));
        let canonical = canonicalize(DynamicImage::ImageLuma8(gray));

        let rgb = canonical.as_rgb8().expect("canonical image is RGB8");
        assert_eq!(rgb.get_pixel(2, 0), &Rgb([120, 120, 120]));
    }

    #[test]
    fn test_load_missing_image() {
        let temp_dir = TempDir::new().unwrap();
        let err = load_image(&temp_dir.path().join("nope.png")).unwrap_err();
        assert!(matches!(err, ImageLoadError::NotFound { .. }));
    }

    #[test]
    fn test_load_undecodable_image() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.png");
        fs::write(&path, b"definitely not a png").unwrap();

        let err = load_image(&path).unwrap_err();
        assert!(matches!(err, ImageLoadError::Decode { .. }));
    }

    #[test]
    fn test_item_id_resolves_relative_segments() {
        let temp_dir = TempDir::new().unwrap();
        let sub = temp_dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let file = temp_dir.path().join("a.png");
        fs::write(&file, b"x").unwrap();

        let direct = ItemId::from_path(&file);
        let roundabout = ItemId::from_path(&sub.join("..").join("a.png"));
        assert_eq!(direct, roundabout);
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_image(Path::new("photo.JPG")));
        assert!(is_supported_image(Path::new("scan.tiff")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("no_extension")));
    }
}
