//! LoRA Manager Thumbnail Cache Library
//!
//! Bounded in-memory cache of decoded thumbnails with LRU eviction and a
//! limit on simultaneous decodes.

pub mod bitmap;
pub mod cancel;
pub mod config;
pub mod decode;
pub mod permits;
mod recency;
pub mod thumbnail;

pub use bitmap::{Bitmap, SharedBitmap};
pub use cancel::CancellationToken;
pub use config::{ConfigError, ThumbnailConfig};
pub use decode::{is_image_path, is_video_path, DecodeError, FileImageDecoder, ImageDecoder};
pub use permits::{DecodePermit, DecodePermits};
pub use thumbnail::{cache_key, CacheEntry, CacheStats, ThumbnailCache};
