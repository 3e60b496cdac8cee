//! LoRA Manager Thumbnail Scheduler Library
//!
//! Priority request orchestration for dataset thumbnails.
//!
//! Views ask for thumbnails through a [`ThumbnailOrchestrator`]. Requests for
//! the same path share one decode, queued work is ordered by priority (with the
//! focused view's requests boosted), and each view can drop its outstanding
//! work when it loses focus.
//!
//! # Example
//!
//! ```
//! use lora_manager_cache::{Bitmap, CancellationToken, ImageDecoder, ThumbnailConfig};
//! use lora_manager_scheduler::{ThumbnailOrchestrator, ThumbnailOwner, ThumbnailPriority};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let decoder: Arc<dyn ImageDecoder> =
//!     Arc::new(|_: &Path, width: u32| Some(Bitmap::solid(width, width / 2, [9, 9, 9, 255])));
//! let orchestrator = ThumbnailOrchestrator::from_config(decoder, &ThumbnailConfig::default());
//!
//! let gallery = ThumbnailOwner::new();
//! let captions = ThumbnailOwner::new();
//! orchestrator.set_active_owner(&gallery);
//!
//! let visible = orchestrator.request_thumbnail(
//!     "dataset/0001.png",
//!     &gallery,
//!     ThumbnailPriority::Normal,
//!     128,
//!     &CancellationToken::new(),
//! );
//! assert!(visible.wait().is_some());
//!
//! // The caption editor lost focus; drop whatever it still had queued
//! orchestrator.cancel_requests(&captions);
//! ```

mod completion;
mod flight;
mod orchestrator;
mod owner;
mod priority;
mod worker;

// Re-export public API
pub use completion::{PendingThumbnail, ThumbnailState};
pub use lora_manager_cache::CancellationToken;
pub use orchestrator::{RequestStats, ThumbnailOrchestrator};
pub use owner::{OwnerId, OwnerRegistry, ThumbnailOwner};
pub use priority::ThumbnailPriority;
