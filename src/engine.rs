//! Stack Generation Engine.
//!
//! Turns one uploaded image into its tree of viewport folders and resolution
//! variants, and drives the `stack_status` state machine:
//!
//! ```text
//! empty ──schedule──▶ pending ──all viewports done──▶ finished
//!                        │
//!                        └──any step fails──▶ error: <label>
//! ```
//!
//! Scheduling is synchronous (a client polling right after the triggering
//! request never observes a stale `empty`); the generation itself is
//! fire-and-forget and observed via polling. Error states are terminal and
//! partially-created descendants stay in place; `pending` and `error` are
//! themselves the signal that the tree is incomplete.

use crate::cache::CacheInvalidator;
use crate::entity::{Entity, EntityKind, StackStatus};
use crate::error::{BatchError, Result, StackError};
use crate::object_store::{sanitize_path_component, ObjectStore};
use crate::resize::ResizePool;
use crate::store::{EntityFilter, EntityPatch, EntityStore};
use crate::usage::{Dimensions, UsageConfig, UsageConfigProvider};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Business context attached to the stacks being generated.
#[derive(Debug, Clone, Default)]
pub struct StackDetails {
    pub usage: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
}

/// Result of `generate_many`.
#[derive(Debug)]
pub struct GenerateOutcome {
    /// Roots now in `pending`, returned before generation completes.
    pub instances: Vec<Entity>,
    pub metadata: GenerateMetadata,
    pub errors: Vec<BatchError>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateMetadata {
    /// Stacks scheduled for generation.
    pub scheduled: usize,
    /// Resize units the background stage will dispatch per stack.
    pub resize_units_per_stack: usize,
}

/// Drives creation of the viewport/variant tree and the status state machine.
pub struct StackEngine {
    store: Arc<dyn EntityStore>,
    objects: Arc<dyn ObjectStore>,
    pool: Arc<ResizePool>,
    cache: Arc<dyn CacheInvalidator>,
    usages: Arc<dyn UsageConfigProvider>,
}

impl StackEngine {
    pub fn new(
        store: Arc<dyn EntityStore>,
        objects: Arc<dyn ObjectStore>,
        pool: Arc<ResizePool>,
        cache: Arc<dyn CacheInvalidator>,
        usages: Arc<dyn UsageConfigProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            objects,
            pool,
            cache,
            usages,
        })
    }

    /// Expand the given roots under a usage: flip them to `stack`/`pending`
    /// synchronously, then generate viewports and variants in the background.
    #[instrument(skip(self), fields(count = uuids.len(), usage = ?usage))]
    pub async fn generate_many(
        self: &Arc<Self>,
        uuids: Vec<Uuid>,
        usage: Option<String>,
        resource_id: Option<String>,
        resource_type: Option<String>,
        resource_name: Option<String>,
    ) -> Result<GenerateOutcome> {
        let config = self.usages.get_config(usage.as_deref()).await?;

        if let Some(ref rt) = resource_type {
            if !config.resource_types.is_empty() && !config.resource_types.contains(rt) {
                return Err(StackError::validation(
                    "resource_type",
                    format!("resource type {rt} not allowed for this usage"),
                ));
            }
        }

        let found = self
            .store
            .find_all(&EntityFilter::by_uuids(uuids.clone()))
            .await?;

        let mut errors = Vec::new();
        let mut roots = Vec::new();
        for uuid in &uuids {
            match found.iter().find(|e| e.uuid == *uuid) {
                Some(entity) if entity.kind.is_stack_root() => roots.push(entity.clone()),
                Some(entity) => errors.push(BatchError::for_entity(
                    entity.uuid,
                    entity.name.clone(),
                    StackError::validation(
                        "not_a_stack",
                        format!("entity {} is not a stack root", entity.uuid),
                    ),
                )),
                None => errors.push(BatchError::for_name(
                    uuid.to_string(),
                    StackError::not_found("entity_missing", format!("no entity {uuid}")),
                )),
            }
        }

        let details = StackDetails {
            usage,
            resource_type,
            resource_id,
            resource_name,
        };

        let instances = self.schedule_generation(roots, &config, &details).await?;
        let metadata = GenerateMetadata {
            scheduled: instances.len(),
            resize_units_per_stack: config.resize_unit_count(),
        };

        Ok(GenerateOutcome {
            instances,
            metadata,
            errors,
        })
    }

    /// Synchronous half of generation: persist the `stack`/`pending` flip and
    /// the resource context, invalidate caches, and detach the heavy work.
    /// The returned entities are what the triggering request responds with.
    pub async fn schedule_generation(
        self: &Arc<Self>,
        roots: Vec<Entity>,
        config: &UsageConfig,
        details: &StackDetails,
    ) -> Result<Vec<Entity>> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }

        let uuids: Vec<Uuid> = roots.iter().map(|r| r.uuid).collect();
        let patch = EntityPatch {
            kind: Some(EntityKind::Stack),
            stack_status: Some(StackStatus::Pending),
            usage: details.usage.clone(),
            resource_type: details.resource_type.clone(),
            resource_id: details.resource_id.clone(),
            resource_name: details.resource_name.clone(),
            ..Default::default()
        };

        let (count, updated) = self
            .store
            .update(patch, &EntityFilter::by_uuids(uuids.clone()))
            .await?;

        info!(scheduled = count, "Stack generation scheduled");

        // Invalidate before detaching so a pending read is never stale.
        self.cache.invalidate_lists().await;
        for uuid in &uuids {
            self.cache.invalidate_item(&uuid.to_string()).await;
        }

        let engine = Arc::clone(self);
        let config = config.clone();
        let background_roots = updated.clone();
        tokio::spawn(async move {
            engine.run_generation(background_roots, config).await;
        });

        Ok(updated)
    }

    /// Background half of generation. Never awaited by the triggering
    /// request; outcomes surface only through `stack_status`.
    #[instrument(skip(self, roots, config), fields(count = roots.len()))]
    pub async fn run_generation(&self, roots: Vec<Entity>, config: UsageConfig) {
        let mut finished: Vec<Uuid> = Vec::new();

        for root in &roots {
            match self.generate_root(root, &config).await {
                Ok(()) => finished.push(root.uuid),
                Err(e) => {
                    error!(
                        root = %root.uuid,
                        error = %e,
                        "Stack generation failed"
                    );
                    metrics::counter!("stack.generate.failed").increment(1);
                    self.flip_status(root.uuid, StackStatus::Error("generate".to_string()))
                        .await;
                }
            }
        }

        if finished.is_empty() {
            return;
        }

        let flip = self
            .store
            .update(
                EntityPatch::status(StackStatus::Finished),
                &EntityFilter::by_uuids(finished.clone()),
            )
            .await;

        match flip {
            Ok((count, _)) => {
                info!(finished = count, "Stack generation finished");
                metrics::counter!("stack.generate.finished").increment(count);
            }
            Err(e) => {
                // The trees exist but the status flip was lost; mark each
                // root so pollers see a terminal state.
                warn!(error = %e, "Bulk status update failed after generation");
                for uuid in finished {
                    self.flip_status(uuid, StackStatus::Error("bulk update".to_string()))
                        .await;
                }
            }
        }
    }

    /// Generate every viewport of one root. Each viewport renders from its
    /// folder's current source, so an overridden viewport keeps its
    /// replacement image across whole-stack regeneration; only viewports
    /// still pointing at the original use the root's image.
    async fn generate_root(&self, root: &Entity, config: &UsageConfig) -> Result<()> {
        let root_path = root.storage_path.as_deref().ok_or_else(|| {
            StackError::internal(
                "root_without_object",
                format!("stack root {} has no storage path", root.uuid),
            )
        })?;
        let root_source = self.objects.download(root_path).await?;

        for (viewport, versions) in &config.viewports {
            let folder = self.ensure_viewport_folder(root, viewport).await?;
            let override_source;
            let source: &[u8] = match folder.storage_path.as_deref() {
                Some(path) if path != root_path => {
                    override_source = self.objects.download(path).await?;
                    &override_source
                }
                _ => &root_source,
            };
            self.regenerate_variants(root, &folder, versions, config.preview, source)
                .await?;
        }

        Ok(())
    }

    /// Find or create the `folder:<viewport>` entity, seeded from the root's
    /// current image metadata.
    async fn ensure_viewport_folder(&self, root: &Entity, viewport: &str) -> Result<Entity> {
        let filter = EntityFilter::descendants_of(root.uuid).with_kind(EntityKind::ViewportFolder {
            viewport: viewport.to_string(),
        });
        if let Some(existing) = self.store.find_one(&filter).await? {
            return Ok(existing);
        }

        let mut folder = Entity::new(
            EntityKind::ViewportFolder {
                viewport: viewport.to_string(),
            },
            viewport,
        );
        folder.parent = Some(root.uuid);
        folder.root_uuid = Some(root.uuid);
        folder.local_path = root.child_local_path();
        folder.storage_path = root.storage_path.clone();
        folder.preview_path = Some(preview_path(root, viewport, 1));
        folder.content_type = root.content_type.clone();
        folder.width = root.width;
        folder.height = root.height;

        debug!(root = %root.uuid, viewport = %viewport, "Creating viewport folder");
        self.store.create(folder).await
    }

    /// Regenerate every resolution-version variant of one viewport from the
    /// given source bytes, plus the shared preview. Superseded variant
    /// objects are deleted once their replacement row points elsewhere.
    ///
    /// Shared with the override protocol, which regenerates a single
    /// viewport without touching the rest of the stack.
    pub(crate) async fn regenerate_variants(
        &self,
        root: &Entity,
        folder: &Entity,
        versions: &BTreeMap<String, Dimensions>,
        preview: Dimensions,
        source: &[u8],
    ) -> Result<()> {
        let viewport = folder.name.as_str();
        let crop = folder.crop();
        let content_type = folder
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        for (version, dims) in versions {
            let key = variant_key(root, viewport, folder.image_version, version);
            let rendered = self
                .pool
                .resize_to(source, crop, &content_type, &key, *dims)
                .await?;

            let kind = EntityKind::VariantFile {
                viewport: viewport.to_string(),
                version: version.clone(),
            };
            let filter = EntityFilter::descendants_of(root.uuid).with_kind(kind.clone());

            match self.store.find_one(&filter).await? {
                Some(existing) => {
                    let previous = existing.storage_path.clone();
                    let patch = EntityPatch {
                        storage_path: Some(rendered.object.path.clone()),
                        width: Some(rendered.width),
                        height: Some(rendered.height),
                        bytes: Some(rendered.object.bytes),
                        ..Default::default()
                    };
                    self.store
                        .update(patch, &EntityFilter::by_uuid(existing.uuid))
                        .await?;
                    if let Some(old) = previous {
                        if old != rendered.object.path {
                            if let Err(e) = self.objects.delete(&old, true).await {
                                warn!(path = %old, error = %e, "Failed to delete superseded variant");
                            }
                        }
                    }
                }
                None => {
                    let mut variant = Entity::new(kind, version.clone());
                    variant.parent = Some(folder.uuid);
                    variant.root_uuid = Some(root.uuid);
                    variant.local_path = folder.child_local_path();
                    variant.storage_path = Some(rendered.object.path.clone());
                    variant.content_type = Some(content_type.clone());
                    variant.width = Some(rendered.width);
                    variant.height = Some(rendered.height);
                    variant.bytes = rendered.object.bytes;
                    self.store.create(variant).await?;
                }
            }

            metrics::counter!("stack.variants.rendered").increment(1);
        }

        // The preview lives at the viewport's preview_path; no entity row.
        if let Some(ref preview_key) = folder.preview_path {
            self.pool
                .resize_to(source, crop, &content_type, preview_key, preview)
                .await?;
        }

        Ok(())
    }

    /// Set one root's status, logging instead of propagating on failure:
    /// this runs in the background stage where nobody can be renotified.
    pub(crate) async fn flip_status(&self, uuid: Uuid, status: StackStatus) {
        let result = self
            .store
            .update(EntityPatch::status(status), &EntityFilter::by_uuid(uuid))
            .await;
        if let Err(e) = result {
            warn!(root = %uuid, error = %e, "Failed to update stack status");
        }
    }

    /// Read-only status poll over the generic read path.
    pub async fn stack_status(&self, uuid: Uuid) -> Result<StackStatus> {
        let entity = self
            .store
            .find_one(&EntityFilter::by_uuid(uuid))
            .await?
            .ok_or_else(|| StackError::not_found("entity_missing", format!("no entity {uuid}")))?;
        entity.stack_status.ok_or_else(|| {
            StackError::validation("not_a_stack", format!("entity {uuid} carries no stack status"))
        })
    }

    /// Destroy a stack root and every row sharing its uuid or root_uuid,
    /// with best-effort cleanup of their storage objects. Ancestor folders
    /// shrink by the root's bytes, mirroring the increment at upload time.
    #[instrument(skip(self), fields(root = %root_uuid))]
    pub async fn destroy_stack(&self, root_uuid: Uuid) -> Result<u64> {
        let descendants = self
            .store
            .find_all(&EntityFilter::descendants_of(root_uuid))
            .await?;
        let root = self.store.find_one(&EntityFilter::by_uuid(root_uuid)).await?;

        if let Some(ref root) = root {
            if root.bytes > 0 {
                let mut parent = root.parent;
                while let Some(uuid) = parent {
                    let folder = match self.store.find_one(&EntityFilter::by_uuid(uuid)).await? {
                        Some(folder) => folder,
                        None => break,
                    };
                    let patch = EntityPatch {
                        bytes_increment: Some(-root.bytes),
                        ..Default::default()
                    };
                    self.store
                        .update(patch, &EntityFilter::by_uuid(folder.uuid))
                        .await?;
                    parent = folder.parent;
                }
            }
        }

        for entity in descendants.iter().chain(root.iter()) {
            for path in [entity.storage_path.as_ref(), entity.preview_path.as_ref()]
                .into_iter()
                .flatten()
            {
                if let Err(e) = self.objects.delete(path, true).await {
                    warn!(path = %path, error = %e, "Failed to delete object during destroy");
                }
            }
        }

        let mut count = self
            .store
            .destroy(&EntityFilter::descendants_of(root_uuid))
            .await?;
        count += self.store.destroy(&EntityFilter::by_uuid(root_uuid)).await?;

        self.cache.invalidate_lists().await;
        self.cache.invalidate_item(&root_uuid.to_string()).await;

        Ok(count)
    }
}

/// Preview object path for one viewport generation.
///
/// Preserves the stack's original file name so public URLs referencing it by
/// name stay stable, while embedding the viewport and version.
pub(crate) fn preview_path(root: &Entity, viewport: &str, image_version: i32) -> String {
    format!(
        "{dir}/{viewport}/v{image_version}/{name}",
        dir = object_dir(root),
        name = sanitize_path_component(&root.name),
    )
}

/// Storage key for one resolution-version variant of one viewport generation.
pub(crate) fn variant_key(
    root: &Entity,
    viewport: &str,
    image_version: i32,
    version: &str,
) -> String {
    format!(
        "{dir}/{viewport}/v{image_version}/{version}_{name}",
        dir = object_dir(root),
        name = sanitize_path_component(&root.name),
    )
}

fn object_dir(root: &Entity) -> String {
    root.storage_path
        .as_deref()
        .and_then(|p| p.rsplit_once('/').map(|(dir, _)| dir.to_string()))
        .unwrap_or_else(|| root.uuid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RecordingCache;
    use crate::object_store::MemoryObjectStore;
    use crate::resize::{FailingResizer, FixedResizer};
    use crate::store::MemoryEntityStore;
    use crate::usage::{StaticUsageProvider, UsageConfigBuilder};
    use std::time::Duration;

    struct Fixture {
        engine: Arc<StackEngine>,
        store: Arc<MemoryEntityStore>,
        objects: Arc<MemoryObjectStore>,
        cache: Arc<RecordingCache>,
    }

    fn fixture(config: UsageConfig, failing_resizer: bool) -> Fixture {
        let store = Arc::new(MemoryEntityStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let cache = Arc::new(RecordingCache::new());
        let resizer: Arc<dyn crate::resize::ImageResizer> = if failing_resizer {
            Arc::new(FailingResizer)
        } else {
            Arc::new(FixedResizer)
        };
        let pool = Arc::new(ResizePool::new(resizer, objects.clone(), 4));
        let usages = Arc::new(StaticUsageProvider::new(config));
        let engine = StackEngine::new(
            store.clone(),
            objects.clone(),
            pool,
            cache.clone(),
            usages,
        );
        Fixture {
            engine,
            store,
            objects,
            cache,
        }
    }

    async fn seed_root(fx: &Fixture, name: &str, width: u32, height: u32) -> Entity {
        let mut root = Entity::new(EntityKind::StackEmpty, name);
        root.stack_status = Some(StackStatus::Empty);
        root.storage_path = Some(format!("assets/2024-01-01/orig_{name}"));
        root.content_type = Some("image/png".to_string());
        root.width = Some(width);
        root.height = Some(height);
        root.bytes = 1000;
        fx.objects
            .put(root.storage_path.clone().unwrap(), vec![1u8; 64])
            .await;
        fx.store.create(root.clone()).await.unwrap()
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

    fn desktop_config() -> UsageConfig {
        UsageConfigBuilder::new().viewport("desktop", "v1", 300, 200).build()
    }

    #[tokio::test]
    async fn test_round_trip_generates_viewport_and_variant() {
        let fx = fixture(desktop_config(), false);
        let root = seed_root(&fx, "hero.png", 1000, 800).await;

        let outcome = fx
            .engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.metadata.scheduled, 1);
        assert!(outcome.errors.is_empty());
        // Synchronously pending, never a stale empty.
        assert_eq!(
            outcome.instances[0].stack_status,
            Some(StackStatus::Pending)
        );
        assert_eq!(outcome.instances[0].kind, EntityKind::Stack);

        assert_eq!(wait_for_terminal(&fx, root.uuid).await, StackStatus::Finished);

        let folders = fx
            .store
            .find_all(
                &EntityFilter::descendants_of(root.uuid).with_kind(EntityKind::ViewportFolder {
                    viewport: "desktop".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].image_version, 1);

        let variants = fx
            .store
            .find_all(
                &EntityFilter::descendants_of(root.uuid).with_kind(EntityKind::VariantFile {
                    viewport: "desktop".to_string(),
                    version: "v1".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].width, Some(300));
        assert_eq!(variants[0].height, Some(200));
        assert!(fx
            .objects
            .contains(variants[0].storage_path.as_deref().unwrap())
            .await);
        // Preview object stored under the viewport folder's preview path.
        assert!(fx
            .objects
            .contains(folders[0].preview_path.as_deref().unwrap())
            .await);
    }

    #[tokio::test]
    async fn test_resize_failure_flips_error_status() {
        let fx = fixture(desktop_config(), true);
        let root = seed_root(&fx, "broken.png", 1000, 800).await;

        fx.engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();

        assert_eq!(
            wait_for_terminal(&fx, root.uuid).await,
            StackStatus::Error("generate".to_string())
        );
    }

    #[tokio::test]
    async fn test_cache_invalidated_before_background_work() {
        let fx = fixture(desktop_config(), false);
        let root = seed_root(&fx, "cached.png", 1000, 800).await;

        fx.engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();

        // schedule_generation has returned, so invalidation already happened
        // even though generation may still be running.
        assert_eq!(*fx.cache.list_invalidations.read().await, 1);
        assert_eq!(
            fx.cache.item_invalidations.read().await.as_slice(),
            &[root.uuid.to_string()]
        );
        wait_for_terminal(&fx, root.uuid).await;
    }

    #[tokio::test]
    async fn test_generate_many_isolates_missing_uuids() {
        let fx = fixture(desktop_config(), false);
        let root = seed_root(&fx, "ok.png", 1000, 800).await;
        let missing = Uuid::new_v4();

        let outcome = fx
            .engine
            .generate_many(vec![root.uuid, missing], None, None, None, None)
            .await
            .unwrap();

        assert_eq!(outcome.instances.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].error.code(), "entity_missing");
        wait_for_terminal(&fx, root.uuid).await;
    }

    #[tokio::test]
    async fn test_status_never_moves_backward() {
        let fx = fixture(desktop_config(), false);
        let root = seed_root(&fx, "forward.png", 1000, 800).await;

        fx.engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        // Re-scheduling moves finished back into pending by an explicit
        // request, but a finished stack never spontaneously reverts: polling
        // without new scheduling is stable.
        for _ in 0..3 {
            assert_eq!(
                fx.engine.stack_status(root.uuid).await.unwrap(),
                StackStatus::Finished
            );
        }
    }

    #[tokio::test]
    async fn test_destroy_stack_removes_rows_and_objects() {
        let fx = fixture(desktop_config(), false);
        let root = seed_root(&fx, "doomed.png", 1000, 800).await;

        fx.engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        let removed = fx.engine.destroy_stack(root.uuid).await.unwrap();
        // Root + viewport folder + variant.
        assert_eq!(removed, 3);
        assert!(fx.store.is_empty().await);
        assert!(fx.objects.is_empty().await);
    }

    #[tokio::test]
    async fn test_resource_type_validated_against_usage() {
        let config = UsageConfigBuilder::new()
            .viewport("desktop", "v1", 300, 200)
            .resource_types(vec!["product".to_string()])
            .build();
        let fx = fixture(config, false);
        let root = seed_root(&fx, "typed.png", 1000, 800).await;

        let err = fx
            .engine
            .generate_many(
                vec![root.uuid],
                None,
                Some("42".to_string()),
                Some("campaign".to_string()),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "resource_type");
    }

    #[tokio::test]
    async fn test_destroy_stack_shrinks_ancestor_bytes() {
        let fx = fixture(desktop_config(), false);

        let mut top = Entity::new(EntityKind::Folder, "assets");
        top.bytes = 1000;
        let top = fx.store.create(top).await.unwrap();
        let mut sub = Entity::new(EntityKind::Folder, "campaign");
        sub.parent = Some(top.uuid);
        sub.local_path = "/assets".to_string();
        sub.bytes = 1000;
        let sub = fx.store.create(sub).await.unwrap();

        let mut root = seed_root(&fx, "counted.png", 1000, 800).await;
        root.parent = Some(sub.uuid);
        let root = fx.store.create(root).await.unwrap();

        fx.engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        fx.engine.destroy_stack(root.uuid).await.unwrap();

        // Both ancestors gave back the root's bytes.
        let top = fx
            .store
            .find_one(&EntityFilter::by_uuid(top.uuid))
            .await
            .unwrap()
            .unwrap();
        let sub = fx
            .store
            .find_one(&EntityFilter::by_uuid(sub.uuid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.bytes, 0);
        assert_eq!(top.bytes, 0);
    }

    /// Resizer that remembers every source it was handed.
    struct RecordingResizer {
        sources: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait::async_trait]
    impl crate::resize::ImageResizer for RecordingResizer {
        async fn resize(
            &self,
            source: &[u8],
            _crop: Option<crate::entity::CropRect>,
            target: Dimensions,
        ) -> Result<crate::resize::ResizedImage> {
            self.sources.lock().unwrap().push(source.to_vec());
            Ok(crate::resize::ResizedImage {
                bytes: vec![0u8; 16],
                width: target.width,
                height: target.height,
            })
        }
    }

    #[tokio::test]
    async fn test_regeneration_keeps_overridden_viewport_source() {
        let sources = Arc::new(std::sync::Mutex::new(Vec::new()));
        let store = Arc::new(MemoryEntityStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let cache = Arc::new(RecordingCache::new());
        let pool = Arc::new(ResizePool::new(
            Arc::new(RecordingResizer {
                sources: sources.clone(),
            }),
            objects.clone(),
            4,
        ));
        let usages = Arc::new(StaticUsageProvider::new(desktop_config()));
        let engine = StackEngine::new(store.clone(), objects.clone(), pool, cache, usages);
        let fx = Fixture {
            engine: engine.clone(),
            store: store.clone(),
            objects: objects.clone(),
            cache: Arc::new(RecordingCache::new()),
        };

        let root = seed_root(&fx, "twice.png", 1000, 800).await;
        engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        // Leave the viewport the way an override does: its own source object
        // and a bumped version.
        objects
            .put("assets/2024-01-01/replacement.png", vec![2u8; 8])
            .await;
        let folder = store
            .find_one(
                &EntityFilter::descendants_of(root.uuid).with_kind(EntityKind::ViewportFolder {
                    viewport: "desktop".to_string(),
                }),
            )
            .await
            .unwrap()
            .unwrap();
        let patch = EntityPatch {
            storage_path: Some("assets/2024-01-01/replacement.png".to_string()),
            image_version: Some(2),
            ..Default::default()
        };
        store
            .update(patch, &EntityFilter::by_uuid(folder.uuid))
            .await
            .unwrap();

        sources.lock().unwrap().clear();
        engine
            .generate_many(vec![root.uuid], None, None, None, None)
            .await
            .unwrap();
        wait_for_terminal(&fx, root.uuid).await;

        // Every desktop render came from the replacement, not the original.
        let seen = sources.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|s| s == &vec![2u8; 8]));
    }

    #[test]
    fn test_variant_key_embeds_viewport_and_versions() {
        let mut root = Entity::new(EntityKind::Stack, "hero.png");
        root.storage_path = Some("assets/2024-01-01/abc_hero.png".to_string());

        let key = variant_key(&root, "desktop", 2, "v1");
        assert_eq!(key, "assets/2024-01-01/desktop/v2/v1_hero.png");

        let preview = preview_path(&root, "desktop", 2);
        assert_eq!(preview, "assets/2024-01-01/desktop/v2/hero.png");
    }
}
