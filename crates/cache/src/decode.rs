//! Image decoding seam
//!
//! The cache never decodes files itself; it calls an injected
//! [`ImageDecoder`]. Production code uses [`FileImageDecoder`], tests inject
//! fakes that return deterministic bitmaps or controlled failures.

use crate::bitmap::Bitmap;
use image::imageops::FilterType;
use image::ImageReader;
use std::fs;
use std::path::{Path, PathBuf};

/// File extensions treated as video and never handed to the decoder
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "webm", "wmv", "flv", "m4v", "mpg", "mpeg", "3gp",
];

/// File extensions the dataset browser shows as images
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "webp", "bmp", "gif", "tif", "tiff",
];

/// Decode a file into a bitmap scaled to a target width
///
/// Implementations must not panic on bad input. Every failure (missing file,
/// corrupt data, unsupported format) is reported as `None`.
pub trait ImageDecoder: Send + Sync {
    /// Decode `path`, scaled to `target_width` with the aspect ratio preserved
    fn decode(&self, path: &Path, target_width: u32) -> Option<Bitmap>;
}

impl<F> ImageDecoder for F
where
    F: Fn(&Path, u32) -> Option<Bitmap> + Send + Sync,
{
    fn decode(&self, path: &Path, target_width: u32) -> Option<Bitmap> {
        self(path, target_width)
    }
}

/// Reasons a file could not be decoded
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("file does not exist: {0}")]
    Missing(PathBuf),
    #[error("file is empty: {0}")]
    Empty(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),
    #[error("decoded image has no pixels")]
    ZeroPixels,
}

/// Decoder backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageDecoder;

impl FileImageDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode with the failure reason preserved
    ///
    /// A `target_width` of zero keeps the native size. Images narrower than
    /// the target are never upscaled.
    pub fn decode_file(&self, path: &Path, target_width: u32) -> Result<Bitmap, DecodeError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DecodeError::Missing(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() == 0 {
            return Err(DecodeError::Empty(path.to_path_buf()));
        }

        let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        if image.width() == 0 || image.height() == 0 {
            return Err(DecodeError::ZeroPixels);
        }

        let image = match scaled_size(image.width(), image.height(), target_width) {
            Some((width, height)) => image.resize_exact(width, height, FilterType::Triangle),
            None => image,
        };

        let rgba = image.into_rgba8();
        let (width, height) = rgba.dimensions();
        Bitmap::from_rgba(width, height, rgba.into_raw()).ok_or(DecodeError::ZeroPixels)
    }
}

impl ImageDecoder for FileImageDecoder {
    fn decode(&self, path: &Path, target_width: u32) -> Option<Bitmap> {
        match self.decode_file(path, target_width) {
            Ok(bitmap) => Some(bitmap),
            Err(e) => {
                log::debug!("thumbnail decode failed for {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Target dimensions for a downscale, or `None` to keep the native size
fn scaled_size(width: u32, height: u32, target_width: u32) -> Option<(u32, u32)> {
    if target_width == 0 || width <= target_width {
        return None;
    }
    let scaled_height = (height as u64 * target_width as u64 / width as u64).max(1);
    Some((target_width, scaled_height as u32))
}

/// True if the path has a video container extension (case-insensitive)
pub fn is_video_path(path: &Path) -> bool {
    has_extension_in(path, VIDEO_EXTENSIONS)
}

/// True if the path has an extension the browser displays as an image
pub fn is_image_path(path: &Path) -> bool {
    has_extension_in(path, IMAGE_EXTENSIONS)
}

fn has_extension_in(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        RgbaImage::from_pixel(width, height, Rgba([200, 10, 10, 255]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_decode_downscales_preserving_aspect() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "wide.png", 64, 32);

        let bitmap = FileImageDecoder::new().decode(&path, 16).unwrap();
        assert_eq!(bitmap.width, 16);
        assert_eq!(bitmap.height, 8);
        assert_eq!(bitmap.pixels.len(), 16 * 8 * 4);
    }

    #[test]
    fn test_decode_never_upscales() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "small.png", 10, 20);

        let bitmap = FileImageDecoder::new().decode(&path, 256).unwrap();
        assert_eq!((bitmap.width, bitmap.height), (10, 20));
    }

    #[test]
    fn test_decode_zero_width_keeps_native_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "native.png", 40, 30);

        let bitmap = FileImageDecoder::new().decode(&path, 0).unwrap();
        assert_eq!((bitmap.width, bitmap.height), (40, 30));
    }

    #[test]
    fn test_decode_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.png");

        let decoder = FileImageDecoder::new();
        assert!(matches!(decoder.decode_file(&path, 64), Err(DecodeError::Missing(_))));
        assert!(decoder.decode(&path, 64).is_none());
    }

    #[test]
    fn test_decode_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.png");
        fs::write(&path, b"").unwrap();

        let decoder = FileImageDecoder::new();
        assert!(matches!(decoder.decode_file(&path, 64), Err(DecodeError::Empty(_))));
        assert!(decoder.decode(&path, 64).is_none());
    }

    #[test]
    fn test_decode_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.png");
        fs::write(&path, b"definitely not a png").unwrap();

        assert!(FileImageDecoder::new().decode(&path, 64).is_none());
    }

    #[test]
    fn test_scaled_size() {
        assert_eq!(scaled_size(1000, 500, 100), Some((100, 50)));
        assert_eq!(scaled_size(100, 50, 100), None);
        assert_eq!(scaled_size(1000, 1, 10), Some((10, 1)));
        assert_eq!(scaled_size(1000, 500, 0), None);
    }

    #[test]
    fn test_is_video_path() {
        assert!(is_video_path(Path::new("clip.mp4")));
        assert!(is_video_path(Path::new("C:/data/Clip.MOV")));
        assert!(!is_video_path(Path::new("image.png")));
        assert!(!is_video_path(Path::new("no_extension")));
    }

    #[test]
    fn test_is_image_path() {
        assert!(is_image_path(Path::new("a.PNG")));
        assert!(is_image_path(Path::new("b.jpeg")));
        assert!(!is_image_path(Path::new("caption.txt")));
    }

    #[test]
    fn test_closure_decoder() {
        let decoder = |_path: &Path, width: u32| Some(Bitmap::solid(width, width, [0; 4]));
        let bitmap = decoder.decode(Path::new("x.png"), 8).unwrap();
        assert_eq!(bitmap.width, 8);
    }
}
