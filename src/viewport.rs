//! Viewport overrides.
//!
//! A stack's viewports normally all render from the root's original image;
//! an override gives one viewport its own source; a replacement upload, a
//! crop region of its current source, or a revert back to the original.
//! Each override bumps the viewport's `image_version` under an optimistic
//! version check, so two concurrent overrides of the same viewport cannot
//! both win, and re-renders only that viewport's variants and preview.

use crate::cache::CacheInvalidator;
use crate::engine::{preview_path, StackEngine};
use crate::entity::{CropRect, Entity, EntityKind, StackStatus};
use crate::error::{BatchError, Result, StackError};
use crate::object_store::{ObjectStore, StoredObject};
use crate::store::{EntityFilter, EntityPatch, EntityStore};
use crate::usage::{Dimensions, UsageConfigProvider};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// A replacement image for one viewport, upload already in flight.
pub struct ReplacementUpload {
    pub content_type: String,
    pub dimensions: Option<(u32, u32)>,
    pub upload: BoxFuture<'static, Result<StoredObject>>,
}

/// What an override does to the viewport's source image.
pub enum OverrideMode {
    /// New source image for this viewport only.
    Replace(ReplacementUpload),
    /// Re-render from a crop region of the current source.
    Crop(CropRect),
    /// Back to the root's original image, crop cleared.
    Revert,
}

impl std::fmt::Debug for OverrideMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace(_) => f.write_str("Replace(..)"),
            Self::Crop(c) => f.debug_tuple("Crop").field(c).finish(),
            Self::Revert => f.write_str("Revert"),
        }
    }
}

impl OverrideMode {
    /// Build a mode from the request's raw parts; exactly one must be set.
    pub fn from_parts(
        replacement: Option<ReplacementUpload>,
        crop: Option<CropRect>,
        revert: bool,
    ) -> Result<Self> {
        match (replacement, crop, revert) {
            (Some(r), None, false) => Ok(Self::Replace(r)),
            (None, Some(c), false) => Ok(Self::Crop(c)),
            (None, None, true) => Ok(Self::Revert),
            _ => Err(StackError::validation(
                "override_mode",
                "exactly one of file, crop, or revert must be given",
            )),
        }
    }
}

/// Result of an override: the viewport folder at its new version, plus any
/// non-fatal cleanup errors.
#[derive(Debug)]
pub struct OverrideOutcome {
    pub instance: Entity,
    pub errors: Vec<BatchError>,
}

/// Applies per-viewport source overrides and re-renders the affected
/// variants through the generation engine.
pub struct OverrideProcessor {
    store: Arc<dyn EntityStore>,
    objects: Arc<dyn ObjectStore>,
    cache: Arc<dyn CacheInvalidator>,
    usages: Arc<dyn UsageConfigProvider>,
    engine: Arc<StackEngine>,
}

/// Row changes resolved from the override mode before the version bump.
struct ResolvedOverride {
    storage_path: Option<String>,
    crop: CropRect,
    width: Option<u32>,
    height: Option<u32>,
    content_type: Option<String>,
    /// Object uploaded by this call; deleted again if the version bump loses.
    uploaded: Option<String>,
}

impl OverrideProcessor {
    pub fn new(
        store: Arc<dyn EntityStore>,
        objects: Arc<dyn ObjectStore>,
        cache: Arc<dyn CacheInvalidator>,
        usages: Arc<dyn UsageConfigProvider>,
        engine: Arc<StackEngine>,
    ) -> Self {
        Self {
            store,
            objects,
            cache,
            usages,
            engine,
        }
    }

    /// Override one viewport of one stack.
    ///
    /// `expected_version` is the `image_version` the caller last read; None
    /// accepts whatever is current. A mismatch at update time means another
    /// override won the race and this one is rejected with a conflict.
    #[instrument(skip(self, mode), fields(root = %root_uuid, viewport = %viewport))]
    pub async fn override_viewport(
        &self,
        root_uuid: Uuid,
        viewport: &str,
        mode: OverrideMode,
        expected_version: Option<i32>,
    ) -> Result<OverrideOutcome> {
        let root = self
            .store
            .find_one(&EntityFilter::by_uuid(root_uuid))
            .await?
            .ok_or_else(|| {
                StackError::not_found("entity_missing", format!("no entity {root_uuid}"))
            })?;
        if !root.kind.is_stack_root() {
            return Err(StackError::validation(
                "not_a_stack",
                format!("entity {root_uuid} is not a stack root"),
            ));
        }

        let folder = self
            .store
            .find_one(
                &EntityFilter::descendants_of(root_uuid).with_kind(EntityKind::ViewportFolder {
                    viewport: viewport.to_string(),
                }),
            )
            .await?
            .ok_or_else(|| {
                StackError::not_found(
                    "viewport_missing",
                    format!("stack {root_uuid} has no viewport {viewport}"),
                )
            })?;

        let current_version = expected_version.unwrap_or(folder.image_version);
        if current_version != folder.image_version {
            return Err(version_conflict(viewport, current_version));
        }

        let config = self.usages.get_config(root.usage.as_deref()).await?;
        let versions = config.viewports.get(viewport).cloned().ok_or_else(|| {
            StackError::validation(
                "viewport_unknown",
                format!("usage configuration has no viewport {viewport}"),
            )
        })?;

        let resolved = self.resolve_mode(&root, &folder, &config, mode).await?;

        // Version bump with an optimistic check: zero rows means the folder
        // moved on since `current_version` was read.
        let next_version = folder.image_version + 1;
        let patch = EntityPatch {
            image_version: Some(next_version),
            storage_path: resolved.storage_path.clone(),
            preview_path: Some(preview_path(&root, viewport, next_version)),
            crop: Some(resolved.crop),
            width: resolved.width,
            height: resolved.height,
            content_type: resolved.content_type.clone(),
            ..Default::default()
        };
        let (count, mut rows) = self
            .store
            .update(
                patch,
                &EntityFilter::by_uuid(folder.uuid).with_image_version(current_version),
            )
            .await?;
        if count == 0 {
            if let Some(ref path) = resolved.uploaded {
                self.cleanup_object(path).await;
            }
            metrics::counter!("stack.override.conflict").increment(1);
            return Err(version_conflict(viewport, current_version));
        }
        let updated = rows.pop().ok_or_else(|| {
            StackError::internal("override_update", "update reported rows it did not return")
        })?;

        // Pending before the caller sees the response, like generation.
        self.store
            .update(
                EntityPatch::status(StackStatus::Pending),
                &EntityFilter::by_uuid(root.uuid),
            )
            .await?;

        let mut errors = Vec::new();

        // The previous viewport source is superseded once the row points
        // elsewhere, unless it is the root's original, which revert needs.
        if let Some(ref new_path) = resolved.storage_path {
            if let Some(old) = folder.storage_path.as_ref() {
                if old != new_path && Some(old) != root.storage_path.as_ref() {
                    if let Err(e) = self.objects.delete(old, true).await {
                        warn!(path = %old, error = %e, "Failed to delete superseded override source");
                        errors.push(BatchError::for_entity(folder.uuid, folder.name.clone(), e));
                    }
                }
            }
        }

        // The preview has no entity row of its own, so the outgoing
        // generation's preview object goes now or never.
        if let Some(ref old_preview) = folder.preview_path {
            if updated.preview_path.as_ref() != Some(old_preview) {
                if let Err(e) = self.objects.delete(old_preview, true).await {
                    warn!(path = %old_preview, error = %e, "Failed to delete superseded preview");
                    errors.push(BatchError::for_entity(folder.uuid, folder.name.clone(), e));
                }
            }
        }

        self.cache.invalidate_lists().await;
        self.cache.invalidate_item(&root.uuid.to_string()).await;
        self.cache.invalidate_item(&folder.uuid.to_string()).await;

        info!(
            viewport = %viewport,
            version = next_version,
            "Viewport override applied, re-rendering variants"
        );

        self.spawn_rerender(root, updated.clone(), versions, config.preview);

        Ok(OverrideOutcome {
            instance: updated,
            errors,
        })
    }

    /// Turn the override mode into the row changes it implies, validating
    /// the incoming source where one is supplied.
    async fn resolve_mode(
        &self,
        root: &Entity,
        folder: &Entity,
        config: &crate::usage::UsageConfig,
        mode: OverrideMode,
    ) -> Result<ResolvedOverride> {
        match mode {
            OverrideMode::Replace(replacement) => {
                let stored = replacement.upload.await?;

                if !config.is_supported_image(&replacement.content_type) {
                    self.cleanup_object(&stored.path).await;
                    return Err(StackError::validation(
                        "unsupported_format",
                        format!(
                            "content type {} cannot back a stack viewport",
                            replacement.content_type
                        ),
                    ));
                }
                let (width, height) = match replacement.dimensions {
                    Some(dims) => dims,
                    None => {
                        self.cleanup_object(&stored.path).await;
                        return Err(StackError::internal(
                            "dimensions_unmeasurable",
                            "image dimensions could not be measured",
                        ));
                    }
                };
                if let Err(e) = config.validate_dimensions(width, height) {
                    self.cleanup_object(&stored.path).await;
                    return Err(e);
                }

                Ok(ResolvedOverride {
                    storage_path: Some(stored.path.clone()),
                    crop: CropRect::default(),
                    width: Some(width),
                    height: Some(height),
                    content_type: Some(replacement.content_type),
                    uploaded: Some(stored.path),
                })
            }
            OverrideMode::Crop(rect) => {
                validate_crop(&rect, folder)?;
                Ok(ResolvedOverride {
                    storage_path: None,
                    crop: rect,
                    width: None,
                    height: None,
                    content_type: None,
                    uploaded: None,
                })
            }
            OverrideMode::Revert => {
                let original = root.storage_path.clone().ok_or_else(|| {
                    StackError::internal(
                        "root_without_object",
                        format!("stack root {} has no storage path", root.uuid),
                    )
                })?;
                Ok(ResolvedOverride {
                    storage_path: Some(original),
                    crop: CropRect::default(),
                    width: root.width,
                    height: root.height,
                    content_type: root.content_type.clone(),
                    uploaded: None,
                })
            }
        }
    }

    /// Detach the re-render of this viewport's variants; outcome surfaces
    /// through the stack status like regular generation.
    fn spawn_rerender(
        &self,
        root: Entity,
        folder: Entity,
        versions: BTreeMap<String, Dimensions>,
        preview: Dimensions,
    ) {
        let engine = Arc::clone(&self.engine);
        let objects = Arc::clone(&self.objects);
        tokio::spawn(async move {
            let result = async {
                let source_path = folder.storage_path.as_deref().ok_or_else(|| {
                    StackError::internal(
                        "viewport_without_object",
                        format!("viewport folder {} has no storage path", folder.uuid),
                    )
                })?;
                let source = objects.download(source_path).await?;
                engine
                    .regenerate_variants(&root, &folder, &versions, preview, &source)
                    .await
            }
            .await;

            match result {
                Ok(()) => {
                    engine.flip_status(root.uuid, StackStatus::Finished).await;
                    metrics::counter!("stack.override.finished").increment(1);
                }
                Err(e) => {
                    error!(
                        root = %root.uuid,
                        viewport = %folder.name,
                        error = %e,
                        "Viewport override re-render failed"
                    );
                    engine
                        .flip_status(root.uuid, StackStatus::Error("override".to_string()))
                        .await;
                    metrics::counter!("stack.override.failed").increment(1);
                }
            }
        });
    }

    async fn cleanup_object(&self, path: &str) {
        if let Err(e) = self.objects.delete(path, true).await {
            warn!(path = %path, error = %e, "Object cleanup failed");
        }
    }
}

fn version_conflict(viewport: &str, expected: i32) -> StackError {
    StackError::conflict(
        "viewport_version_conflict",
        format!("viewport {viewport} moved past version {expected}"),
    )
}

fn validate_crop(rect: &CropRect, folder: &Entity) -> Result<()> {
    if rect.width <= 0 || rect.height <= 0 || rect.offset_x < 0 || rect.offset_y < 0 {
        return Err(StackError::validation(
            "crop_bounds",
            "crop rectangle must have positive size and non-negative offsets",
        ));
    }
    if let (Some(width), Some(height)) = (folder.width, folder.height) {
        let fits_x = rect.offset_x as i64 + rect.width as i64 <= width as i64;
        let fits_y = rect.offset_y as i64 + rect.height as i64 <= height as i64;
        if !fits_x || !fits_y {
            return Err(StackError::validation(
                "crop_bounds",
                format!(
                    "crop {}x{}+{}+{} exceeds source {width}x{height}",
                    rect.width, rect.height, rect.offset_x, rect.offset_y
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RecordingCache;
    use crate::object_store::MemoryObjectStore;
    use crate::resize::{FixedResizer, ResizePool};
    use crate::store::MemoryEntityStore;
    use crate::usage::{StaticUsageProvider, UsageConfigBuilder};
    use std::time::Duration;

    struct Fixture {
        processor: OverrideProcessor,
        engine: Arc<StackEngine>,
        store: Arc<MemoryEntityStore>,
        objects: Arc<MemoryObjectStore>,
    }

    fn fixture() -> Fixture {
        let config = UsageConfigBuilder::new()
            .viewport("desktop", "v1", 300, 200)
            .min_resolution(100, 100)
            .max_resolution(4000, 4000)
            .build();
        let store = Arc::new(MemoryEntityStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let cache = Arc::new(RecordingCache::new());
        let usages = Arc::new(StaticUsageProvider::new(config));
        let pool = Arc::new(ResizePool::new(Arc::new(FixedResizer), objects.clone(), 4));
        let engine = StackEngine::new(
            store.clone(),
            objects.clone(),
            pool,
            cache.clone(),
            usages.clone(),
        );
        let processor = OverrideProcessor::new(
            store.clone(),
            objects.clone(),
            cache,
            usages,
            engine.clone(),
        );
        Fixture {
            processor,
            engine,
            store,
            objects,
        }
    }

    async fn wait_for_terminal(fx: &Fixture, uuid: Uuid) -> StackStatus {
        for _ in 0..100 {
            let status = fx.engine.stack_status(uuid).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stack {uuid} never reached a terminal status");
    }

    /// Seed a fully generated stack and return its root.
    async fn generated_stack(fx: &Fixture, name: &str) -> Entity {
        let mut root = Entity::new(EntityKind::StackEmpty, name);
        root.stack_status = Some(StackStatus::Empty);
        root.storage_path = Some(format!("assets/2024-01-01/orig_{name}"));
        root.content_type = Some("image/png".to_string());
        root.width = Some(1000);
        root.height = Some(800);
        fx.objects
            .put(root.storage_path.clone().unwrap(), vec![1u8; 64])
            .await;
        let root = fx.store.create(root).await.unwrap();

        fx.engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(fx, root.uuid).await, StackStatus::Finished);
        root
    }

    fn replacement(
        objects: &Arc<MemoryObjectStore>,
        key: &str,
        content_type: &str,
        dims: Option<(u32, u32)>,
    ) -> ReplacementUpload {
        let objects = objects.clone();
        let key = key.to_string();
        let ct = content_type.to_string();
        ReplacementUpload {
            content_type: content_type.to_string(),
            dimensions: dims,
            upload: Box::pin(async move { objects.upload(&key, &ct, vec![2u8; 64]).await }),
        }
    }

    async fn viewport_folder(fx: &Fixture, root: Uuid) -> Entity {
        fx.store
            .find_one(
                &EntityFilter::descendants_of(root).with_kind(EntityKind::ViewportFolder {
                    viewport: "desktop".to_string(),
                }),
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_replace_bumps_version_and_rerenders() {
        let fx = fixture();
        let root = generated_stack(&fx, "hero.png").await;

        let outcome = fx
            .processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Replace(replacement(
                    &fx.objects,
                    "assets/2024-01-01/override_hero.png",
                    "image/png",
                    Some((800, 600)),
                )),
                None,
            )
            .await
            .unwrap();

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.instance.image_version, 2);
        assert_eq!(
            outcome.instance.storage_path.as_deref(),
            Some("assets/2024-01-01/override_hero.png")
        );
        assert!(outcome
            .instance
            .preview_path
            .as_deref()
            .unwrap()
            .contains("/v2/"));
        assert_eq!(outcome.instance.crop(), None);

        // Synchronously pending again.
        let status = fx.engine.stack_status(root.uuid).await.unwrap();
        assert!(status == StackStatus::Pending || status == StackStatus::Finished);
        assert_eq!(wait_for_terminal(&fx, root.uuid).await, StackStatus::Finished);

        // Variant row moved to the new generation's key.
        let variant = fx
            .store
            .find_one(
                &EntityFilter::descendants_of(root.uuid).with_kind(EntityKind::VariantFile {
                    viewport: "desktop".to_string(),
                    version: "v1".to_string(),
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(variant.storage_path.as_deref().unwrap().contains("/desktop/v2/"));

        // The root's original object survives for later reverts.
        assert!(fx
            .objects
            .contains(root.storage_path.as_deref().unwrap())
            .await);
    }

    #[tokio::test]
    async fn test_crop_keeps_source_and_records_rect() {
        let fx = fixture();
        let root = generated_stack(&fx, "cropme.png").await;

        let outcome = fx
            .processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Crop(CropRect {
                    offset_x: 10,
                    offset_y: 10,
                    width: 100,
                    height: 80,
                }),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.instance.image_version, 2);
        // Source unchanged; only the rectangle moved.
        assert_eq!(
            outcome.instance.storage_path,
            root.storage_path
        );
        assert_eq!(outcome.instance.crop_width, 100);
        assert_eq!(outcome.instance.crop_height, 80);
        assert_eq!(wait_for_terminal(&fx, root.uuid).await, StackStatus::Finished);
    }

    #[tokio::test]
    async fn test_revert_restores_original_and_clears_crop() {
        let fx = fixture();
        let root = generated_stack(&fx, "revertme.png").await;

        fx.processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Replace(replacement(
                    &fx.objects,
                    "assets/2024-01-01/override_revertme.png",
                    "image/png",
                    Some((800, 600)),
                )),
                None,
            )
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        let outcome = fx
            .processor
            .override_viewport(root.uuid, "desktop", OverrideMode::Revert, None)
            .await
            .unwrap();

        assert_eq!(outcome.instance.image_version, 3);
        assert_eq!(outcome.instance.storage_path, root.storage_path);
        assert_eq!(outcome.instance.crop(), None);
        assert_eq!(wait_for_terminal(&fx, root.uuid).await, StackStatus::Finished);

        // The replacement source is superseded and gone.
        assert!(!fx.objects.contains("assets/2024-01-01/override_revertme.png").await);
    }

    #[tokio::test]
    async fn test_stale_expected_version_is_a_conflict() {
        let fx = fixture();
        let root = generated_stack(&fx, "raced.png").await;

        fx.processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Crop(CropRect {
                    offset_x: 0,
                    offset_y: 0,
                    width: 100,
                    height: 100,
                }),
                Some(1),
            )
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        // A second caller still editing version 1 loses.
        let err = fx
            .processor
            .override_viewport(root.uuid, "desktop", OverrideMode::Revert, Some(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "viewport_version_conflict");

        let folder = viewport_folder(&fx, root.uuid).await;
        assert_eq!(folder.image_version, 2);
    }

    #[tokio::test]
    async fn test_conflicting_losing_replace_cleans_its_upload() {
        let fx = fixture();
        let root = generated_stack(&fx, "loser.png").await;

        fx.processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Crop(CropRect {
                    offset_x: 0,
                    offset_y: 0,
                    width: 100,
                    height: 100,
                }),
                None,
            )
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        let err = fx
            .processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Replace(replacement(
                    &fx.objects,
                    "assets/2024-01-01/late.png",
                    "image/png",
                    Some((800, 600)),
                )),
                Some(1),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "viewport_version_conflict");
        assert!(!fx.objects.contains("assets/2024-01-01/late.png").await);
    }

    #[tokio::test]
    async fn test_unsupported_replacement_is_rejected_and_cleaned() {
        let fx = fixture();
        let root = generated_stack(&fx, "strict.png").await;

        let err = fx
            .processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Replace(replacement(
                    &fx.objects,
                    "assets/2024-01-01/scan.tiff",
                    "image/tiff",
                    Some((800, 600)),
                )),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "unsupported_format");
        assert!(!fx.objects.contains("assets/2024-01-01/scan.tiff").await);

        // Nothing moved: still version 1 and finished.
        let folder = viewport_folder(&fx, root.uuid).await;
        assert_eq!(folder.image_version, 1);
        assert_eq!(
            fx.engine.stack_status(root.uuid).await.unwrap(),
            StackStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_crop_out_of_bounds_is_rejected() {
        let fx = fixture();
        let root = generated_stack(&fx, "bounds.png").await;

        let err = fx
            .processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Crop(CropRect {
                    offset_x: 950,
                    offset_y: 0,
                    width: 100,
                    height: 100,
                }),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "crop_bounds");

        let err = fx
            .processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Crop(CropRect {
                    offset_x: 0,
                    offset_y: 0,
                    width: 0,
                    height: 100,
                }),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "crop_bounds");
    }

    #[tokio::test]
    async fn test_override_without_viewport_folder_is_not_found() {
        let fx = fixture();
        let mut root = Entity::new(EntityKind::Stack, "bare.png");
        root.stack_status = Some(StackStatus::Finished);
        root.storage_path = Some("assets/2024-01-01/bare.png".to_string());
        let root = fx.store.create(root).await.unwrap();

        let err = fx
            .processor
            .override_viewport(root.uuid, "desktop", OverrideMode::Revert, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "viewport_missing");
    }

    #[tokio::test]
    async fn test_superseded_source_delete_failure_is_recorded() {
        let fx = fixture();
        let root = generated_stack(&fx, "sticky.png").await;

        fx.processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Replace(replacement(
                    &fx.objects,
                    "assets/2024-01-01/first.png",
                    "image/png",
                    Some((800, 600)),
                )),
                None,
            )
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        fx.objects.fail_delete_for("assets/2024-01-01/first.png").await;

        let outcome = fx
            .processor
            .override_viewport(
                root.uuid,
                "desktop",
                OverrideMode::Replace(replacement(
                    &fx.objects,
                    "assets/2024-01-01/second.png",
                    "image/png",
                    Some((800, 600)),
                )),
                None,
            )
            .await
            .unwrap();

        // Override still applied; the stuck object is only reported.
        assert_eq!(outcome.instance.image_version, 3);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(wait_for_terminal(&fx, root.uuid).await, StackStatus::Finished);
    }

    #[test]
    fn test_mode_from_parts_rejects_ambiguity() {
        assert!(OverrideMode::from_parts(None, None, false).is_err());
        let err = OverrideMode::from_parts(
            None,
            Some(CropRect {
                offset_x: 0,
                offset_y: 0,
                width: 1,
                height: 1,
            }),
            true,
        )
        .unwrap_err();
        assert_eq!(err.code(), "override_mode");
        assert!(OverrideMode::from_parts(None, None, true).is_ok());
    }
}
