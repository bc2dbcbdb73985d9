//! Resize worker pool.
//!
//! The actual resampling is behind [`ImageResizer`]; [`ResizePool`] bounds
//! how many resize units run at once and stores each result, which is the
//! unit of work the generation engine dispatches per resolution-version.

use crate::entity::CropRect;
use crate::error::{Result, StackError};
use crate::object_store::{ObjectStore, StoredObject};
use crate::usage::Dimensions;
use async_trait::async_trait;
use image::imageops::FilterType;
use image::ImageFormat;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

/// A resized image produced by a worker.
#[derive(Debug, Clone)]
pub struct ResizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One stored variant: the resize result plus where it landed.
#[derive(Debug, Clone)]
pub struct RenderedVariant {
    pub object: StoredObject,
    pub width: u32,
    pub height: u32,
}

/// Produces resized bytes for a target dimension, optionally restricted to a
/// crop region of the source first.
#[async_trait]
pub trait ImageResizer: Send + Sync {
    async fn resize(
        &self,
        source: &[u8],
        crop: Option<CropRect>,
        target: Dimensions,
    ) -> Result<ResizedImage>;
}

/// CPU resizer backed by the `image` crate (Lanczos3 resampling).
///
/// Decode and resample are blocking work, so they run on the tokio blocking
/// pool rather than a worker thread of the async runtime.
pub struct LanczosResizer;

#[async_trait]
impl ImageResizer for LanczosResizer {
    async fn resize(
        &self,
        source: &[u8],
        crop: Option<CropRect>,
        target: Dimensions,
    ) -> Result<ResizedImage> {
        let source = source.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut img = image::load_from_memory(&source)
                .map_err(|e| StackError::upstream("resize_decode", e.to_string()))?;

            if let Some(crop) = crop {
                img = img.crop_imm(
                    crop.offset_x.max(0) as u32,
                    crop.offset_y.max(0) as u32,
                    crop.width.max(0) as u32,
                    crop.height.max(0) as u32,
                );
            }

            let resized = img.resize_exact(target.width, target.height, FilterType::Lanczos3);

            let mut buf = Vec::new();
            resized
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                .map_err(|e| StackError::upstream("resize_encode", e.to_string()))?;

            Ok(ResizedImage {
                bytes: buf,
                width: target.width,
                height: target.height,
            })
        })
        .await
        .map_err(|e| StackError::internal("resize_join", e.to_string()))?
    }
}

/// Resizer stub for tests: returns a payload whose length encodes the target
/// area, without decoding anything.
pub struct FixedResizer;

#[async_trait]
impl ImageResizer for FixedResizer {
    async fn resize(
        &self,
        _source: &[u8],
        _crop: Option<CropRect>,
        target: Dimensions,
    ) -> Result<ResizedImage> {
        Ok(ResizedImage {
            bytes: vec![0u8; 16],
            width: target.width,
            height: target.height,
        })
    }
}

/// Resizer stub that always fails; exercises error-status paths.
pub struct FailingResizer;

#[async_trait]
impl ImageResizer for FailingResizer {
    async fn resize(
        &self,
        _source: &[u8],
        _crop: Option<CropRect>,
        _target: Dimensions,
    ) -> Result<ResizedImage> {
        Err(StackError::upstream("resize", "simulated resize failure"))
    }
}

/// Semaphore-bounded pool dispatching resize units and storing the results.
pub struct ResizePool {
    resizer: Arc<dyn ImageResizer>,
    objects: Arc<dyn ObjectStore>,
    permits: Arc<Semaphore>,
}

impl ResizePool {
    pub fn new(
        resizer: Arc<dyn ImageResizer>,
        objects: Arc<dyn ObjectStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            resizer,
            objects,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Resize `source` to `target` and store the result under `key`.
    #[instrument(skip(self, source, crop), fields(key = %key, width = target.width, height = target.height))]
    pub async fn resize_to(
        &self,
        source: &[u8],
        crop: Option<CropRect>,
        content_type: &str,
        key: &str,
        target: Dimensions,
    ) -> Result<RenderedVariant> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| StackError::internal("resize_pool", e.to_string()))?;

        let resized = self.resizer.resize(source, crop, target).await?;

        debug!(
            key = %key,
            size_bytes = resized.bytes.len(),
            "Storing resized variant"
        );

        let object = self.objects.upload(key, content_type, resized.bytes).await?;

        Ok(RenderedVariant {
            object,
            width: resized.width,
            height: resized.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryObjectStore;

    #[tokio::test]
    async fn test_pool_stores_resized_variant() {
        let objects = Arc::new(MemoryObjectStore::new());
        let pool = ResizePool::new(Arc::new(FixedResizer), objects.clone(), 2);

        let variant = pool
            .resize_to(
                b"source",
                None,
                "image/png",
                "assets/desktop/v1",
                Dimensions {
                    width: 300,
                    height: 200,
                },
            )
            .await
            .unwrap();

        assert_eq!(variant.width, 300);
        assert_eq!(variant.height, 200);
        assert!(objects.contains("assets/desktop/v1").await);
    }

    #[tokio::test]
    async fn test_failing_resizer_propagates_upstream_error() {
        let objects = Arc::new(MemoryObjectStore::new());
        let pool = ResizePool::new(Arc::new(FailingResizer), objects.clone(), 1);

        let err = pool
            .resize_to(
                b"source",
                None,
                "image/png",
                "assets/x",
                Dimensions {
                    width: 10,
                    height: 10,
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "resize");
        assert!(objects.is_empty().await);
    }
}
