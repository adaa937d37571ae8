use image::{imageops::FilterType, DynamicImage, ImageFormat};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use crate::error::ThumbnailError;
use crate::state::data::Fingerprint;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Image formats recognised as previews, checked in this order
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "ico", "webp"];

/// Where preview pixels come from for a given launchable file.
///
/// Every call is expected to touch the source filesystem; the cache only
/// calls it on a miss.
pub trait PreviewSource: Send + Sync {
    fn load_preview(&self, source: &Path) -> Result<DynamicImage, ThumbnailError>;

    /// Token that changes whenever the preview for `source` would change
    /// without `source` itself changing. Must be cheap (metadata only).
    ///
    /// A cached record made under a different stamp is re-derived.
    fn preview_stamp(&self, _source: &Path) -> Option<String> {
        None
    }
}

/// Finds `<stem>.png` (or another image format) next to the game file.
/// A source that is itself an image is decoded directly.
#[derive(Debug, Clone, Default)]
pub struct SiblingImageSource;

impl SiblingImageSource {
    /// Candidate preview files for `source`, most preferred first
    pub fn candidates(source: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if has_image_extension(source) {
            out.push(source.to_path_buf());
        }
        let Some(stem) = source.file_stem() else {
            return out;
        };
        let dir = source.parent().unwrap_or_else(|| Path::new(""));
        for ext in IMAGE_EXTENSIONS {
            let mut name = stem.to_os_string();
            name.push(".");
            name.push(ext);
            let candidate = dir.join(name);
            if candidate != source {
                out.push(candidate);
            }
        }
        out
    }
}

impl PreviewSource for SiblingImageSource {
    fn load_preview(&self, source: &Path) -> Result<DynamicImage, ThumbnailError> {
        let Some(image_path) = Self::candidates(source).into_iter().find(|p| p.is_file()) else {
            return Err(ThumbnailError::NoPreview {
                path: source.to_path_buf(),
            });
        };

        let bytes = fs::read(&image_path).map_err(|source| ThumbnailError::Read {
            path: image_path.clone(),
            source,
        })?;
        image::load_from_memory(&bytes).map_err(|source| ThumbnailError::Decode {
            path: image_path,
            source,
        })
    }

    /// Name, size and mtime of the image that would be picked, so cover art
    /// added or replaced next to an unchanged game is noticed
    fn preview_stamp(&self, source: &Path) -> Option<String> {
        Self::candidates(source).into_iter().find_map(|candidate| {
            let metadata = fs::metadata(&candidate).ok().filter(|m| m.is_file())?;
            let stamp = Fingerprint::new(metadata.len(), metadata.modified().unwrap_or(UNIX_EPOCH));
            let name = candidate.file_name()?.to_string_lossy().into_owned();
            Some(format!("{name}:{}", stamp.cache_key()))
        })
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Shrink `img` to fit inside `max_width` x `max_height`, keeping its aspect
/// ratio. Images that already fit are left alone.
pub fn fit_to_tile(img: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if img.width() <= max_width && img.height() <= max_height {
        return img;
    }
    img.resize(max_width, max_height, FilterType::Lanczos3)
}

/// Encode `img` as PNG at `target`, writing through a temp file first
pub fn save_thumbnail(img: &DynamicImage, target: &Path) -> Result<u64, ThumbnailError> {
    // unique per write so concurrent saves never share a temp file
    let mut tmp_name = target.as_os_str().to_owned();
    tmp_name.push(format!(
        ".{}-{}.tmp",
        process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let tmp_path = PathBuf::from(tmp_name);

    img.save_with_format(&tmp_path, ImageFormat::Png)
        .map_err(|source| ThumbnailError::Write {
            path: tmp_path.clone(),
            source,
        })?;
    fs::rename(&tmp_path, target).map_err(|source| ThumbnailError::Store {
        path: target.to_path_buf(),
        source,
    })?;

    let size = fs::metadata(target)
        .map(|m| m.len())
        .map_err(|source| ThumbnailError::Store {
            path: target.to_path_buf(),
            source,
        })?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::TempDir;

    #[test]
    fn sibling_png_is_used_as_preview() {
        let dir = TempDir::new().expect("tempdir");
        let game = dir.path().join("Chess.exe");
        fs::write(&game, b"MZ").expect("write game");
        RgbImage::new(64, 48)
            .save(dir.path().join("Chess.png"))
            .expect("write png");

        let img = SiblingImageSource.load_preview(&game).expect("preview");
        assert_eq!((img.width(), img.height()), (64, 48));
    }

    #[test]
    fn missing_sibling_is_no_preview() {
        let dir = TempDir::new().expect("tempdir");
        let game = dir.path().join("Lonely.exe");
        fs::write(&game, b"MZ").expect("write game");

        let err = SiblingImageSource.load_preview(&game).expect_err("no preview");
        assert!(matches!(err, ThumbnailError::NoPreview { .. }));
    }

    #[test]
    fn garbage_sibling_is_decode_error() {
        let dir = TempDir::new().expect("tempdir");
        let game = dir.path().join("Broken.sh");
        fs::write(&game, b"#!/bin/sh").expect("write game");
        fs::write(dir.path().join("Broken.png"), b"definitely not a png").expect("write");

        let err = SiblingImageSource.load_preview(&game).expect_err("decode");
        assert!(matches!(err, ThumbnailError::Decode { .. }));
    }

    #[test]
    fn stamp_follows_the_chosen_sibling() {
        let dir = TempDir::new().expect("tempdir");
        let game = dir.path().join("Chess.exe");
        fs::write(&game, b"MZ").expect("write game");
        assert_eq!(SiblingImageSource.preview_stamp(&game), None);

        RgbImage::new(8, 8)
            .save(dir.path().join("Chess.png"))
            .expect("write png");
        let first = SiblingImageSource.preview_stamp(&game).expect("stamp");
        assert!(first.starts_with("Chess.png:"));

        RgbImage::new(64, 64)
            .save(dir.path().join("Chess.png"))
            .expect("rewrite png");
        let second = SiblingImageSource.preview_stamp(&game).expect("stamp");
        assert_ne!(first, second);
    }

    #[test]
    fn concurrent_saves_to_one_target_all_succeed() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("thumb.png");
        let img = DynamicImage::new_rgb8(40, 40);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| save_thumbnail(&img, &target)))
                .collect();
            for handle in handles {
                handle.join().expect("join").expect("save");
            }
        });
        assert!(image::open(&target).is_ok());
        let leftovers = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn candidates_put_image_source_first() {
        let candidates = SiblingImageSource::candidates(Path::new("/g/cover.PNG"));
        assert_eq!(candidates[0], PathBuf::from("/g/cover.PNG"));
        assert!(candidates.contains(&PathBuf::from("/g/cover.png")));
    }

    #[test]
    fn fit_to_tile_only_shrinks() {
        let big = DynamicImage::new_rgb8(600, 300);
        let fitted = fit_to_tile(big, 120, 100);
        assert!(fitted.width() <= 120 && fitted.height() <= 100);
        assert_eq!(fitted.width(), 120);

        let small = DynamicImage::new_rgb8(32, 32);
        let kept = fit_to_tile(small, 120, 100);
        assert_eq!((kept.width(), kept.height()), (32, 32));
    }

    #[test]
    fn save_thumbnail_writes_decodable_png() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("thumb.png");
        let size = save_thumbnail(&DynamicImage::new_rgb8(10, 10), &target).expect("save");
        assert!(size > 0);
        assert!(image::open(&target).is_ok());
    }
}
