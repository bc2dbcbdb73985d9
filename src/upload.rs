//! Upload Batch Processor.
//!
//! Validates and persists a batch of concurrently uploaded files, isolating
//! per-file failures: one bad file cannot fail an otherwise-good batch. The
//! duplicate-name existence check runs once against a consistent snapshot
//! before any insert, so two same-named files in one batch can never both
//! succeed. Passing files land in one bulk insert; `stack:empty` roots are
//! then handed to the generation engine and ancestor folders grow by the new
//! bytes.

use crate::cache::CacheInvalidator;
use crate::engine::{StackDetails, StackEngine};
use crate::entity::{Entity, EntityKind, StackStatus};
use crate::error::{BatchError, Result, StackError};
use crate::object_store::{ObjectStore, StoredObject};
use crate::store::{EntityFilter, EntityPatch, EntityStore, TagStore};
use crate::usage::{UsageConfig, UsageConfigProvider};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// One file of an upload batch. The upload itself is already in flight when
/// the processor receives it; the future resolves to the stored object.
pub struct IncomingFile {
    /// Target name, unique within the parent.
    pub name: String,
    /// Declared mimetype.
    pub content_type: String,
    /// Declared byte size.
    pub declared_bytes: i64,
    /// Pre-computed pixel dimensions, when the decoder could measure them.
    pub dimensions: Option<(u32, u32)>,
    /// In-flight upload; resolves once the object is in storage.
    pub upload: BoxFuture<'static, Result<StoredObject>>,
    /// Tags to attach to the created entity.
    pub tags: Vec<String>,
}

/// Target entity fields for the batch.
#[derive(Debug, Clone, Default)]
pub struct FileUsage {
    pub usage: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
}

/// HTTP-facing outcome class of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every file succeeded.
    Ok,
    /// Some succeeded, some failed.
    Multi,
    /// No file succeeded.
    Failed,
}

impl BatchStatus {
    pub fn http_code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Multi => 207,
            Self::Failed => 400,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadMetadata {
    pub uploaded: usize,
    pub failed: usize,
    pub bytes: i64,
}

/// Result of `upload_many`.
#[derive(Debug)]
pub struct BatchOutcome {
    pub instances: Vec<Entity>,
    pub metadata: UploadMetadata,
    pub errors: Vec<BatchError>,
    pub status: BatchStatus,
}

/// Validates, persists, and schedules a batch of uploads.
pub struct UploadBatchProcessor {
    store: Arc<dyn EntityStore>,
    objects: Arc<dyn ObjectStore>,
    tags: Arc<dyn TagStore>,
    cache: Arc<dyn CacheInvalidator>,
    usages: Arc<dyn UsageConfigProvider>,
    engine: Arc<StackEngine>,
    upload_concurrency: usize,
}

/// A file that passed validation, queued for the bulk insert.
struct QueuedFile {
    entity: Entity,
    tags: Vec<String>,
}

impl UploadBatchProcessor {
    pub fn new(
        store: Arc<dyn EntityStore>,
        objects: Arc<dyn ObjectStore>,
        tags: Arc<dyn TagStore>,
        cache: Arc<dyn CacheInvalidator>,
        usages: Arc<dyn UsageConfigProvider>,
        engine: Arc<StackEngine>,
        upload_concurrency: usize,
    ) -> Self {
        Self {
            store,
            objects,
            tags,
            cache,
            usages,
            engine,
            upload_concurrency: upload_concurrency.max(1),
        }
    }

    /// Process one upload batch under a parent folder (None for the root).
    #[instrument(skip(self, files, file_usage), fields(count = files.len(), parent = ?parent))]
    pub async fn upload_many(
        &self,
        parent: Option<Uuid>,
        files: Vec<IncomingFile>,
        file_usage: FileUsage,
    ) -> Result<BatchOutcome> {
        let total = files.len();
        let config = self.usages.get_config(file_usage.usage.as_deref()).await?;

        let (parent_entity, local_path) = self.resolve_parent(parent).await?;

        // Await every in-flight upload, bounded, preserving batch order.
        let mut names = Vec::with_capacity(files.len());
        let mut metas = Vec::with_capacity(files.len());
        let mut uploads = Vec::with_capacity(files.len());
        for file in files {
            names.push(file.name.clone());
            metas.push((file.content_type, file.declared_bytes, file.dimensions, file.tags));
            uploads.push(file.upload);
        }
        let outcomes: Vec<Result<StoredObject>> = stream::iter(uploads)
            .buffered(self.upload_concurrency)
            .collect()
            .await;

        // One snapshot of colliding sibling names, before any insert.
        let existing: HashSet<String> = self
            .store
            .find_all(&EntityFilter::children_of(parent).with_name_in(names.clone()))
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect();

        let mut errors: Vec<BatchError> = Vec::new();
        let mut queued: Vec<QueuedFile> = Vec::new();
        let mut seen_in_batch: HashSet<String> = HashSet::new();
        let mut uploaded_paths: Vec<String> = Vec::new();

        for ((name, outcome), (content_type, declared_bytes, dimensions, tags)) in
            names.into_iter().zip(outcomes).zip(metas)
        {
            if let Ok(ref stored) = outcome {
                uploaded_paths.push(stored.path.clone());
            }

            // 1. Name collision against existing siblings and the batch
            //    itself; first seen wins.
            if existing.contains(&name) || !seen_in_batch.insert(name.clone()) {
                if let Ok(stored) = outcome {
                    self.cleanup_object(&stored.path).await;
                }
                errors.push(BatchError::for_name(
                    name.clone(),
                    StackError::conflict(
                        "duplicate_name",
                        format!("name {name} already exists in this folder"),
                    ),
                ));
                continue;
            }

            // 2. Upload outcome.
            let stored = match outcome {
                Ok(stored) => stored,
                Err(e) => {
                    errors.push(BatchError::for_name(name, e));
                    continue;
                }
            };

            let is_image = UsageConfig::is_image(&content_type);

            // 3. Images must have measurable dimensions.
            let dims = match (is_image, dimensions) {
                (true, None) => {
                    errors.push(BatchError::for_name(
                        name,
                        StackError::internal(
                            "dimensions_unmeasurable",
                            "image dimensions could not be measured",
                        ),
                    ));
                    continue;
                }
                (true, Some(dims)) => Some(dims),
                (false, _) => None,
            };

            // 4. Dimension policy; violating uploads are cleaned up.
            if let Some((width, height)) = dims {
                if let Err(e) = config.validate_dimensions(width, height) {
                    self.cleanup_object(&stored.path).await;
                    errors.push(BatchError::for_name(name, e));
                    continue;
                }
            }

            // 5. Queue for the bulk insert.
            let kind = if config.is_supported_image(&content_type) {
                EntityKind::StackEmpty
            } else if is_image {
                EntityKind::PlainImage
            } else {
                EntityKind::File
            };

            let mut entity = Entity::new(kind.clone(), name);
            entity.parent = parent;
            entity.local_path = local_path.clone();
            entity.content_type = Some(content_type);
            entity.bytes = if stored.bytes > 0 {
                stored.bytes
            } else {
                declared_bytes
            };
            entity.storage_path = Some(stored.path);
            entity.usage = file_usage.usage.clone();
            if let Some((width, height)) = dims {
                entity.width = Some(width);
                entity.height = Some(height);
            }
            if kind == EntityKind::StackEmpty {
                entity.stack_status = Some(StackStatus::Empty);
            }

            queued.push(QueuedFile { entity, tags });
        }

        // Bulk insert is all-or-nothing: on failure every object uploaded for
        // this batch would be orphaned, so they all go.
        let rows: Vec<Entity> = queued.iter().map(|q| q.entity.clone()).collect();
        let mut instances = if rows.is_empty() {
            Vec::new()
        } else {
            match self.store.bulk_create(rows).await {
                Ok(created) => created,
                Err(e) => {
                    warn!(error = %e, "Bulk insert failed, deleting batch objects");
                    for path in &uploaded_paths {
                        self.cleanup_object(path).await;
                    }
                    metrics::counter!("stack.uploads.batch_failed").increment(1);
                    return Err(e);
                }
            }
        };

        // Tag attachment is fault-isolated per entity.
        for (entity, queued_file) in instances.iter().zip(queued.iter()) {
            if queued_file.tags.is_empty() {
                continue;
            }
            if let Err(e) = self.tags.attach(entity.uuid, &queued_file.tags).await {
                warn!(entity = %entity.uuid, error = %e, "Tag attachment failed");
                errors.push(BatchError::for_entity(entity.uuid, entity.name.clone(), e));
            }
        }

        self.cache.invalidate_lists().await;

        // Hand stack roots to the generation engine; they come back pending.
        let stack_roots: Vec<Entity> = instances
            .iter()
            .filter(|e| e.kind == EntityKind::StackEmpty)
            .cloned()
            .collect();
        if !stack_roots.is_empty() {
            let details = StackDetails {
                usage: file_usage.usage.clone(),
                resource_type: file_usage.resource_type.clone(),
                resource_id: file_usage.resource_id.clone(),
                resource_name: file_usage.resource_name.clone(),
            };
            let scheduled = self
                .engine
                .schedule_generation(stack_roots, &config, &details)
                .await?;
            for updated in scheduled {
                if let Some(slot) = instances.iter_mut().find(|e| e.uuid == updated.uuid) {
                    *slot = updated;
                }
            }
        }

        // Ancestor folders grow by the batch's bytes; failure here is
        // recorded, not thrown.
        let new_bytes: i64 = instances.iter().map(|e| e.bytes).sum();
        if new_bytes > 0 {
            if let Err(e) = self.bump_ancestor_bytes(parent_entity.as_ref(), new_bytes).await {
                warn!(error = %e, "Ancestor byte aggregation failed");
                errors.push(BatchError::for_name("<ancestors>", e));
            }
        }

        let uploaded = instances.len();
        let failed = total - uploaded;
        let status = match (uploaded, failed) {
            (_, 0) => BatchStatus::Ok,
            (0, _) => BatchStatus::Failed,
            _ => BatchStatus::Multi,
        };

        info!(
            uploaded = uploaded,
            failed = failed,
            status = ?status,
            "Upload batch processed"
        );
        metrics::counter!("stack.uploads.files").increment(uploaded as u64);
        metrics::counter!("stack.uploads.failed").increment(failed as u64);

        Ok(BatchOutcome {
            instances,
            metadata: UploadMetadata {
                uploaded,
                failed,
                bytes: new_bytes,
            },
            errors,
            status,
        })
    }

    /// Create a folder node under a parent, with the same name-uniqueness
    /// check uploads get.
    #[instrument(skip(self), fields(parent = ?parent, name = %name))]
    pub async fn create_folder(&self, parent: Option<Uuid>, name: &str) -> Result<Entity> {
        let (_, local_path) = self.resolve_parent(parent).await?;

        let collision = self
            .store
            .find_one(&EntityFilter::children_of(parent).with_name_in(vec![name.to_string()]))
            .await?;
        if collision.is_some() {
            return Err(StackError::conflict(
                "duplicate_name",
                format!("name {name} already exists in this folder"),
            ));
        }

        let mut folder = Entity::new(EntityKind::Folder, name);
        folder.parent = parent;
        folder.local_path = local_path;

        let created = self.store.create(folder).await?;
        self.cache.invalidate_lists().await;
        Ok(created)
    }

    /// Resolve the parent folder and the local path new children get.
    async fn resolve_parent(&self, parent: Option<Uuid>) -> Result<(Option<Entity>, String)> {
        match parent {
            None => Ok((None, String::new())),
            Some(uuid) => {
                let entity = self
                    .store
                    .find_one(&EntityFilter::by_uuid(uuid))
                    .await?
                    .ok_or_else(|| {
                        StackError::not_found("parent_missing", format!("no parent folder {uuid}"))
                    })?;
                if entity.kind != EntityKind::Folder {
                    return Err(StackError::validation(
                        "parent_not_folder",
                        format!("entity {uuid} is not a folder"),
                    ));
                }
                let local_path = entity.child_local_path();
                Ok((Some(entity), local_path))
            }
        }
    }

    /// Increment `bytes` on every ancestor folder up to the tree root.
    async fn bump_ancestor_bytes(&self, parent: Option<&Entity>, delta: i64) -> Result<()> {
        let mut current = parent.cloned();
        while let Some(folder) = current {
            let patch = EntityPatch {
                bytes_increment: Some(delta),
                ..Default::default()
            };
            self.store
                .update(patch, &EntityFilter::by_uuid(folder.uuid))
                .await?;
            debug!(folder = %folder.uuid, delta = delta, "Folder bytes incremented");

            current = match folder.parent {
                None => None,
                Some(uuid) => self.store.find_one(&EntityFilter::by_uuid(uuid)).await?,
            };
        }
        Ok(())
    }

    /// Best-effort object cleanup; its own failure is only logged.
    async fn cleanup_object(&self, path: &str) {
        if let Err(e) = self.objects.delete(path, true).await {
            warn!(path = %path, error = %e, "Object cleanup failed");
        }
    }
}
