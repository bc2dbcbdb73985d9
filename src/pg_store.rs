//! Postgres implementation of the entity and tag stores.
//!
//! One `entities` table holds the whole asset tree; kinds and stack statuses
//! are persisted as their tag strings so prefix filters stay plain `LIKE`
//! queries. Filters and patches translate to dynamically built WHERE/SET
//! clauses; every update runs as a single statement with `RETURNING`, which
//! is what makes the version-checked override update atomic.

use crate::config::DatabaseConfig;
use crate::entity::{Entity, EntityKind, StackStatus};
use crate::error::{Result, StackError};
use crate::store::{EntityFilter, EntityPatch, EntityStore, TagStore};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::QueryBuilder;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT uuid, kind, name, parent, root_uuid, local_path, bytes, \
     content_type, width, height, usage, resource_type, resource_id, resource_name, \
     stack_status, storage_path, preview_path, image_version, crop_offset_x, crop_offset_y, \
     crop_width, crop_height, created_at, updated_at FROM entities";

const RETURNING_COLUMNS: &str = " RETURNING uuid, kind, name, parent, root_uuid, local_path, \
     bytes, content_type, width, height, usage, resource_type, resource_id, resource_name, \
     stack_status, storage_path, preview_path, image_version, crop_offset_x, crop_offset_y, \
     crop_width, crop_height, created_at, updated_at";

/// Entity store backed by a Postgres pool.
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    /// Connect a pool and optionally run pending migrations.
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to connect to Postgres")?;

        if config.run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;
            info!("Database migrations applied");
        }

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Raw row shape; tag strings decoded into proper enums on the way out.
#[derive(sqlx::FromRow)]
struct EntityRow {
    uuid: Uuid,
    kind: String,
    name: String,
    parent: Option<Uuid>,
    root_uuid: Option<Uuid>,
    local_path: String,
    bytes: i64,
    content_type: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    usage: Option<String>,
    resource_type: Option<String>,
    resource_id: Option<String>,
    resource_name: Option<String>,
    stack_status: Option<String>,
    storage_path: Option<String>,
    preview_path: Option<String>,
    image_version: i32,
    crop_offset_x: i32,
    crop_offset_y: i32,
    crop_width: i32,
    crop_height: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntityRow> for Entity {
    type Error = StackError;

    fn try_from(row: EntityRow) -> Result<Self> {
        let kind = EntityKind::from_tag(&row.kind).ok_or_else(|| {
            StackError::internal("bad_row", format!("unknown entity kind tag: {}", row.kind))
        })?;
        let stack_status = row
            .stack_status
            .as_deref()
            .map(|s| {
                StackStatus::parse(s).ok_or_else(|| {
                    StackError::internal("bad_row", format!("unknown stack status: {s}"))
                })
            })
            .transpose()?;

        Ok(Entity {
            uuid: row.uuid,
            kind,
            name: row.name,
            parent: row.parent,
            root_uuid: row.root_uuid,
            local_path: row.local_path,
            bytes: row.bytes,
            content_type: row.content_type,
            width: row.width.map(|w| w as u32),
            height: row.height.map(|h| h as u32),
            usage: row.usage,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            resource_name: row.resource_name,
            stack_status,
            storage_path: row.storage_path,
            preview_path: row.preview_path,
            image_version: row.image_version,
            crop_offset_x: row.crop_offset_x,
            crop_offset_y: row.crop_offset_y,
            crop_width: row.crop_width,
            crop_height: row.crop_height,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Append the filter's predicates as a WHERE clause.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &EntityFilter) {
    qb.push(" WHERE TRUE");
    if let Some(uuid) = filter.uuid {
        qb.push(" AND uuid = ").push_bind(uuid);
    }
    if let Some(ref uuids) = filter.uuid_in {
        qb.push(" AND uuid = ANY(").push_bind(uuids.clone()).push(")");
    }
    if let Some(ref parent) = filter.parent {
        match parent {
            Some(parent) => {
                qb.push(" AND parent = ").push_bind(*parent);
            }
            None => {
                qb.push(" AND parent IS NULL");
            }
        }
    }
    if let Some(root) = filter.root_uuid {
        qb.push(" AND root_uuid = ").push_bind(root);
    }
    if let Some(ref roots) = filter.root_uuid_in {
        qb.push(" AND root_uuid = ANY(")
            .push_bind(roots.clone())
            .push(")");
    }
    if let Some(ref name) = filter.name {
        qb.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(ref names) = filter.name_in {
        qb.push(" AND name = ANY(").push_bind(names.clone()).push(")");
    }
    if let Some(ref kind) = filter.kind {
        qb.push(" AND kind = ").push_bind(kind.tag());
    }
    if let Some(ref prefix) = filter.kind_prefix {
        qb.push(" AND kind LIKE ")
            .push_bind(format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_")));
    }
    if let Some(version) = filter.image_version {
        qb.push(" AND image_version = ").push_bind(version);
    }
}

/// Append the patch's assignments as a SET clause.
fn push_patch(qb: &mut QueryBuilder<'_, Postgres>, patch: &EntityPatch) {
    qb.push(" SET updated_at = now()");
    if let Some(ref kind) = patch.kind {
        qb.push(", kind = ").push_bind(kind.tag());
    }
    if let Some(ref status) = patch.stack_status {
        qb.push(", stack_status = ").push_bind(status.as_str());
    }
    if let Some(ref path) = patch.storage_path {
        qb.push(", storage_path = ").push_bind(path.clone());
    }
    if let Some(ref path) = patch.preview_path {
        qb.push(", preview_path = ").push_bind(path.clone());
    }
    if let Some(ref ct) = patch.content_type {
        qb.push(", content_type = ").push_bind(ct.clone());
    }
    if let Some(width) = patch.width {
        qb.push(", width = ").push_bind(width as i32);
    }
    if let Some(height) = patch.height {
        qb.push(", height = ").push_bind(height as i32);
    }
    if let Some(ref usage) = patch.usage {
        qb.push(", usage = ").push_bind(usage.clone());
    }
    if let Some(ref rt) = patch.resource_type {
        qb.push(", resource_type = ").push_bind(rt.clone());
    }
    if let Some(ref rid) = patch.resource_id {
        qb.push(", resource_id = ").push_bind(rid.clone());
    }
    if let Some(ref rn) = patch.resource_name {
        qb.push(", resource_name = ").push_bind(rn.clone());
    }
    if let Some(version) = patch.image_version {
        qb.push(", image_version = ").push_bind(version);
    }
    if let Some(crop) = patch.crop {
        qb.push(", crop_offset_x = ").push_bind(crop.offset_x);
        qb.push(", crop_offset_y = ").push_bind(crop.offset_y);
        qb.push(", crop_width = ").push_bind(crop.width);
        qb.push(", crop_height = ").push_bind(crop.height);
    }
    if let Some(bytes) = patch.bytes {
        qb.push(", bytes = ").push_bind(bytes);
    }
    if let Some(delta) = patch.bytes_increment {
        qb.push(", bytes = bytes + ").push_bind(delta);
    }
}

fn db_error(e: sqlx::Error) -> StackError {
    StackError::upstream("database", e.to_string())
}

async fn insert_one<'e, E>(executor: E, entity: &Entity) -> Result<Entity>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row: EntityRow = sqlx::query_as(
        "INSERT INTO entities (uuid, kind, name, parent, root_uuid, local_path, bytes, \
         content_type, width, height, usage, resource_type, resource_id, resource_name, \
         stack_status, storage_path, preview_path, image_version, crop_offset_x, \
         crop_offset_y, crop_width, crop_height, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
         $17, $18, $19, $20, $21, $22, $23, $24) \
         RETURNING uuid, kind, name, parent, root_uuid, local_path, bytes, content_type, \
         width, height, usage, resource_type, resource_id, resource_name, stack_status, \
         storage_path, preview_path, image_version, crop_offset_x, crop_offset_y, \
         crop_width, crop_height, created_at, updated_at",
    )
    .bind(entity.uuid)
    .bind(entity.kind.tag())
    .bind(&entity.name)
    .bind(entity.parent)
    .bind(entity.root_uuid)
    .bind(&entity.local_path)
    .bind(entity.bytes)
    .bind(&entity.content_type)
    .bind(entity.width.map(|w| w as i32))
    .bind(entity.height.map(|h| h as i32))
    .bind(&entity.usage)
    .bind(&entity.resource_type)
    .bind(&entity.resource_id)
    .bind(&entity.resource_name)
    .bind(entity.stack_status.as_ref().map(|s| s.as_str()))
    .bind(&entity.storage_path)
    .bind(&entity.preview_path)
    .bind(entity.image_version)
    .bind(entity.crop_offset_x)
    .bind(entity.crop_offset_y)
    .bind(entity.crop_width)
    .bind(entity.crop_height)
    .bind(entity.created_at)
    .bind(entity.updated_at)
    .fetch_one(executor)
    .await
    .map_err(db_error)?;

    row.try_into()
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn find_one(&self, filter: &EntityFilter) -> Result<Option<Entity>> {
        let mut qb = QueryBuilder::new(SELECT_COLUMNS);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at LIMIT 1");

        let row: Option<EntityRow> = qb
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.map(Entity::try_from).transpose()
    }

    async fn find_all(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let mut qb = QueryBuilder::new(SELECT_COLUMNS);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at");

        let rows: Vec<EntityRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter().map(Entity::try_from).collect()
    }

    #[instrument(skip(self, entity), fields(uuid = %entity.uuid, kind = %entity.kind.tag()))]
    async fn create(&self, entity: Entity) -> Result<Entity> {
        insert_one(&self.pool, &entity).await
    }

    async fn bulk_create(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut created = Vec::with_capacity(entities.len());
        for entity in &entities {
            created.push(insert_one(&mut *tx, entity).await?);
        }
        tx.commit().await.map_err(db_error)?;
        debug!(count = created.len(), "Bulk insert committed");
        Ok(created)
    }

    async fn update(&self, patch: EntityPatch, filter: &EntityFilter) -> Result<(u64, Vec<Entity>)> {
        let mut qb = QueryBuilder::new("UPDATE entities");
        push_patch(&mut qb, &patch);
        push_filter(&mut qb, filter);
        qb.push(RETURNING_COLUMNS);

        let rows: Vec<EntityRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        let mut updated: Vec<Entity> = rows
            .into_iter()
            .map(Entity::try_from)
            .collect::<Result<_>>()?;
        updated.sort_by_key(|e| e.created_at);
        Ok((updated.len() as u64, updated))
    }

    async fn destroy(&self, filter: &EntityFilter) -> Result<u64> {
        let mut qb = QueryBuilder::new("DELETE FROM entities");
        push_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await.map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

/// Tag store backed by the same pool; tag rows cascade with their entity.
pub struct PgTagStore {
    pool: PgPool,
}

impl PgTagStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TagStore for PgTagStore {
    async fn attach(&self, entity_uuid: Uuid, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO entity_tags (entity_uuid, tag) \
             SELECT $1, unnest($2::text[]) ON CONFLICT DO NOTHING",
        )
        .bind(entity_uuid)
        .bind(tags)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}
