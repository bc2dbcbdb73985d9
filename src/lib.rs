//! Stack generation and versioning for a digital asset backend.
//!
//! Uploaded images become *stacks*: a root image expanded into one folder per
//! viewport, each holding resized variants for that viewport's configured
//! resolutions plus a preview. Stacks are versioned per viewport and can be
//! overridden (replacement image, crop, or revert) without touching the other
//! viewports.
//!
//! ```text
//!  upload batch ──▶ UploadBatchProcessor ──▶ entities + objects
//!                         │ stack roots
//!                         ▼
//!                    StackEngine ──▶ viewport folders + variants + previews
//!                         ▲
//!                         │ single-viewport re-render
//!                  OverrideProcessor
//! ```
//!
//! External systems sit behind traits: [`store::EntityStore`] (relational
//! tree), [`object_store::ObjectStore`] (S3), [`resize::ImageResizer`]
//! (resampling), [`cache::CacheInvalidator`], and
//! [`usage::UsageConfigProvider`]. Production implementations are
//! [`pg_store::PgEntityStore`] and [`object_store::S3ObjectStore`]; in-memory
//! counterparts back the tests.

pub mod cache;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod object_store;
pub mod pg_store;
pub mod resize;
pub mod store;
pub mod upload;
pub mod usage;
pub mod viewport;

pub use config::Config;
pub use engine::{GenerateOutcome, StackDetails, StackEngine};
pub use entity::{CropRect, Entity, EntityKind, StackStatus};
pub use error::{BatchError, Result, StackError};
pub use upload::{BatchOutcome, BatchStatus, FileUsage, IncomingFile, UploadBatchProcessor};
pub use viewport::{OverrideMode, OverrideOutcome, OverrideProcessor, ReplacementUpload};
