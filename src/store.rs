//! Entity Store interface: the relational table holding the asset tree.
//!
//! The engine only ever talks to the [`EntityStore`] trait; the Postgres
//! implementation lives in `pg_store` and [`MemoryEntityStore`] backs tests
//! and embedded use. Filters cover the predicate set the engine needs:
//! equality, set-membership, and kind prefix match.

use crate::entity::{CropRect, Entity, EntityKind, StackStatus};
use crate::error::{Result, StackError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Filter predicates over entity rows.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    /// Match a single uuid.
    pub uuid: Option<Uuid>,
    /// Match any of these uuids.
    pub uuid_in: Option<Vec<Uuid>>,
    /// Match on parent; `Some(None)` selects tree roots.
    pub parent: Option<Option<Uuid>>,
    /// Match a single stack root.
    pub root_uuid: Option<Uuid>,
    /// Match any of these stack roots.
    pub root_uuid_in: Option<Vec<Uuid>>,
    /// Match an exact name.
    pub name: Option<String>,
    /// Match any of these names.
    pub name_in: Option<Vec<String>>,
    /// Match an exact kind tag.
    pub kind: Option<EntityKind>,
    /// Match kind tags by prefix (e.g. `folder:` for all viewport folders).
    pub kind_prefix: Option<String>,
    /// Match the current image version; used for optimistic updates.
    pub image_version: Option<i32>,
}

impl EntityFilter {
    pub fn by_uuid(uuid: Uuid) -> Self {
        Self {
            uuid: Some(uuid),
            ..Default::default()
        }
    }

    pub fn by_uuids(uuids: Vec<Uuid>) -> Self {
        Self {
            uuid_in: Some(uuids),
            ..Default::default()
        }
    }

    pub fn children_of(parent: Option<Uuid>) -> Self {
        Self {
            parent: Some(parent),
            ..Default::default()
        }
    }

    pub fn descendants_of(root_uuid: Uuid) -> Self {
        Self {
            root_uuid: Some(root_uuid),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_kind_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.kind_prefix = Some(prefix.into());
        self
    }

    pub fn with_name_in(mut self, names: Vec<String>) -> Self {
        self.name_in = Some(names);
        self
    }

    pub fn with_image_version(mut self, version: i32) -> Self {
        self.image_version = Some(version);
        self
    }

    /// Whether the given entity satisfies every set predicate.
    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(uuid) = self.uuid {
            if entity.uuid != uuid {
                return false;
            }
        }
        if let Some(ref uuids) = self.uuid_in {
            if !uuids.contains(&entity.uuid) {
                return false;
            }
        }
        if let Some(ref parent) = self.parent {
            if entity.parent != *parent {
                return false;
            }
        }
        if let Some(root) = self.root_uuid {
            if entity.root_uuid != Some(root) {
                return false;
            }
        }
        if let Some(ref roots) = self.root_uuid_in {
            match entity.root_uuid {
                Some(root) if roots.contains(&root) => {}
                _ => return false,
            }
        }
        if let Some(ref name) = self.name {
            if &entity.name != name {
                return false;
            }
        }
        if let Some(ref names) = self.name_in {
            if !names.contains(&entity.name) {
                return false;
            }
        }
        if let Some(ref kind) = self.kind {
            if &entity.kind != kind {
                return false;
            }
        }
        if let Some(ref prefix) = self.kind_prefix {
            if !entity.kind.tag().starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(version) = self.image_version {
            if entity.image_version != version {
                return false;
            }
        }
        true
    }
}

/// Field updates applied by [`EntityStore::update`]. Unset fields are left
/// untouched; `bytes_increment` adds rather than replaces.
#[derive(Debug, Clone, Default)]
pub struct EntityPatch {
    pub kind: Option<EntityKind>,
    pub stack_status: Option<StackStatus>,
    pub storage_path: Option<String>,
    pub preview_path: Option<String>,
    pub content_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub usage: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub image_version: Option<i32>,
    pub crop: Option<CropRect>,
    pub bytes: Option<i64>,
    pub bytes_increment: Option<i64>,
}

impl EntityPatch {
    pub fn status(status: StackStatus) -> Self {
        Self {
            stack_status: Some(status),
            ..Default::default()
        }
    }

    fn apply(&self, entity: &mut Entity) {
        if let Some(ref kind) = self.kind {
            entity.kind = kind.clone();
        }
        if let Some(ref status) = self.stack_status {
            entity.stack_status = Some(status.clone());
        }
        if let Some(ref path) = self.storage_path {
            entity.storage_path = Some(path.clone());
        }
        if let Some(ref path) = self.preview_path {
            entity.preview_path = Some(path.clone());
        }
        if let Some(ref ct) = self.content_type {
            entity.content_type = Some(ct.clone());
        }
        if let Some(width) = self.width {
            entity.width = Some(width);
        }
        if let Some(height) = self.height {
            entity.height = Some(height);
        }
        if let Some(ref usage) = self.usage {
            entity.usage = Some(usage.clone());
        }
        if let Some(ref rt) = self.resource_type {
            entity.resource_type = Some(rt.clone());
        }
        if let Some(ref rid) = self.resource_id {
            entity.resource_id = Some(rid.clone());
        }
        if let Some(ref rn) = self.resource_name {
            entity.resource_name = Some(rn.clone());
        }
        if let Some(version) = self.image_version {
            entity.image_version = version;
        }
        if let Some(crop) = self.crop {
            entity.crop_offset_x = crop.offset_x;
            entity.crop_offset_y = crop.offset_y;
            entity.crop_width = crop.width;
            entity.crop_height = crop.height;
        }
        if let Some(bytes) = self.bytes {
            entity.bytes = bytes;
        }
        if let Some(delta) = self.bytes_increment {
            entity.bytes += delta;
        }
        entity.updated_at = Utc::now();
    }
}

/// Relational store of all folders, files, stacks, and variants.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Find the first entity matching the filter.
    async fn find_one(&self, filter: &EntityFilter) -> Result<Option<Entity>>;

    /// Find all entities matching the filter.
    async fn find_all(&self, filter: &EntityFilter) -> Result<Vec<Entity>>;

    /// Insert one entity.
    async fn create(&self, entity: Entity) -> Result<Entity>;

    /// Insert many entities in one operation; all-or-nothing.
    async fn bulk_create(&self, entities: Vec<Entity>) -> Result<Vec<Entity>>;

    /// Apply a patch to every matching entity; returns the count and the
    /// updated rows.
    async fn update(&self, patch: EntityPatch, filter: &EntityFilter) -> Result<(u64, Vec<Entity>)>;

    /// Delete every matching entity; returns the count.
    async fn destroy(&self, filter: &EntityFilter) -> Result<u64>;
}

/// Tag attachment, fault-isolated per entity. Tag rows cascade with their
/// entity at the storage layer.
#[async_trait]
pub trait TagStore: Send + Sync {
    async fn attach(&self, entity_uuid: Uuid, tags: &[String]) -> Result<()>;
}

/// In-memory entity store for tests and embedded use.
#[derive(Default)]
pub struct MemoryEntityStore {
    rows: RwLock<HashMap<Uuid, Entity>>,
    /// When set, the next bulk_create fails; lets tests exercise the
    /// fatal-insert cleanup path.
    fail_next_bulk_create: RwLock<bool>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_bulk_create(&self) {
        *self.fail_next_bulk_create.write().await = true;
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_one(&self, filter: &EntityFilter) -> Result<Option<Entity>> {
        let rows = self.rows.read().await;
        let mut matches: Vec<&Entity> = rows.values().filter(|e| filter.matches(e)).collect();
        matches.sort_by_key(|e| e.created_at);
        Ok(matches.first().map(|e| (*e).clone()))
    }

    async fn find_all(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let rows = self.rows.read().await;
        let mut matches: Vec<Entity> = rows
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matches.sort_by_key(|e| e.created_at);
        Ok(matches)
    }

    async fn create(&self, entity: Entity) -> Result<Entity> {
        let mut rows = self.rows.write().await;
        rows.insert(entity.uuid, entity.clone());
        Ok(entity)
    }

    async fn bulk_create(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        {
            let mut fail = self.fail_next_bulk_create.write().await;
            if *fail {
                *fail = false;
                return Err(StackError::upstream(
                    "bulk_insert",
                    "simulated bulk insert failure",
                ));
            }
        }
        let mut rows = self.rows.write().await;
        for entity in &entities {
            rows.insert(entity.uuid, entity.clone());
        }
        Ok(entities)
    }

    async fn update(&self, patch: EntityPatch, filter: &EntityFilter) -> Result<(u64, Vec<Entity>)> {
        let mut rows = self.rows.write().await;
        let mut updated = Vec::new();
        for entity in rows.values_mut() {
            if filter.matches(entity) {
                patch.apply(entity);
                updated.push(entity.clone());
            }
        }
        updated.sort_by_key(|e| e.created_at);
        Ok((updated.len() as u64, updated))
    }

    async fn destroy(&self, filter: &EntityFilter) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let doomed: Vec<Uuid> = rows
            .values()
            .filter(|e| filter.matches(e))
            .map(|e| e.uuid)
            .collect();
        for uuid in &doomed {
            rows.remove(uuid);
        }
        Ok(doomed.len() as u64)
    }
}

/// In-memory tag store; records attachments and can be told to fail for one
/// entity to exercise fault isolation.
#[derive(Default)]
pub struct MemoryTagStore {
    attached: RwLock<HashMap<Uuid, Vec<String>>>,
    fail_for: RwLock<Option<Uuid>>,
    fail_next: RwLock<bool>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_for(&self, uuid: Uuid) {
        *self.fail_for.write().await = Some(uuid);
    }

    /// Fail the next attach regardless of entity.
    pub async fn fail_next(&self) {
        *self.fail_next.write().await = true;
    }

    pub async fn tags_of(&self, uuid: Uuid) -> Vec<String> {
        self.attached
            .read()
            .await
            .get(&uuid)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    async fn attach(&self, entity_uuid: Uuid, tags: &[String]) -> Result<()> {
        {
            let mut fail = self.fail_next.write().await;
            if *fail {
                *fail = false;
                return Err(StackError::upstream("tag_attach", "simulated tag failure"));
            }
        }
        if *self.fail_for.read().await == Some(entity_uuid) {
            return Err(StackError::upstream("tag_attach", "simulated tag failure"));
        }
        self.attached
            .write()
            .await
            .entry(entity_uuid)
            .or_default()
            .extend(tags.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(name: &str) -> Entity {
        Entity::new(EntityKind::Folder, name)
    }

    #[tokio::test]
    async fn test_filter_by_parent_includes_roots() {
        let store = MemoryEntityStore::new();
        let root = store.create(folder("root")).await.unwrap();
        let mut child = folder("child");
        child.parent = Some(root.uuid);
        store.create(child).await.unwrap();

        let roots = store
            .find_all(&EntityFilter::children_of(None))
            .await
            .unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, "root");

        let children = store
            .find_all(&EntityFilter::children_of(Some(root.uuid)))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "child");
    }

    #[tokio::test]
    async fn test_kind_prefix_filter() {
        let store = MemoryEntityStore::new();
        store
            .create(Entity::new(
                EntityKind::ViewportFolder {
                    viewport: "desktop".to_string(),
                },
                "desktop",
            ))
            .await
            .unwrap();
        store
            .create(Entity::new(
                EntityKind::VariantFile {
                    viewport: "desktop".to_string(),
                    version: "v1".to_string(),
                },
                "v1",
            ))
            .await
            .unwrap();

        let viewports = store
            .find_all(&EntityFilter::default().with_kind_prefix("folder:"))
            .await
            .unwrap();
        assert_eq!(viewports.len(), 1);

        let variants = store
            .find_all(&EntityFilter::default().with_kind_prefix("file:image:"))
            .await
            .unwrap();
        assert_eq!(variants.len(), 1);
    }

    #[tokio::test]
    async fn test_update_with_version_filter_is_a_cas() {
        let store = MemoryEntityStore::new();
        let entity = store.create(folder("v")).await.unwrap();

        let patch = EntityPatch {
            image_version: Some(2),
            ..Default::default()
        };
        let (count, _) = store
            .update(
                patch.clone(),
                &EntityFilter::by_uuid(entity.uuid).with_image_version(1),
            )
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Same expected version again: the row has moved on, no match.
        let (count, _) = store
            .update(patch, &EntityFilter::by_uuid(entity.uuid).with_image_version(1))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_bytes_increment() {
        let store = MemoryEntityStore::new();
        let entity = store.create(folder("sized")).await.unwrap();
        let patch = EntityPatch {
            bytes_increment: Some(100),
            ..Default::default()
        };
        store
            .update(patch.clone(), &EntityFilter::by_uuid(entity.uuid))
            .await
            .unwrap();
        let (_, rows) = store
            .update(patch, &EntityFilter::by_uuid(entity.uuid))
            .await
            .unwrap();
        assert_eq!(rows[0].bytes, 200);
    }
}
