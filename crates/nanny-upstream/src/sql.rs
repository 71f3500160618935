//! SQL adapters for the compute, storage and share databases.
//!
//! All three run over a `sqlx` Any pool so that production (MySQL) and tests
//! (in-memory SQLite) share one code path. Statements stick to the SQL both
//! dialects accept: integer columns are read through `CAST(.. AS SIGNED)`,
//! keys and timestamps through `CAST(.. AS CHAR)`.

use crate::error::{Result, UpstreamError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use nanny_core::error::{NannyError, Result as NannyResult};
use nanny_core::model::{
    AttachStatus, BlockDeviceMapping, Instance, Volume, VolumeAttachment, VolumeId, VolumeStatus,
    GIB,
};
use nanny_core::repair::{ComputeRepair, DatabaseRepair, NewAttachment, StorageRepair};
use nanny_core::snapshot::{
    ComputeSnapshot, ComputeSource, IntegritySnapshot, IntegritySource, OrphanRow,
    StorageSnapshot, StorageSource,
};
use nanny_core::tables::{self, storage, Database, DeletedValue, IntegrityPair, RowKey, TableSpec};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Drop the `+driver` part of SQLAlchemy-style URLs
/// (`mysql+pymysql://` becomes `mysql://`).
pub fn normalize_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let scheme = scheme.split('+').next().unwrap_or(scheme);
            format!("{}://{}", scheme, rest)
        }
        None => url.to_string(),
    }
}

fn now_string() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a timestamp as MySQL and SQLite render it.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s.trim(), fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_uuid(row: &AnyRow, column: &str) -> Option<Uuid> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .and_then(|s| Uuid::parse_str(&s).ok())
}

/// One database behind an Any pool.
#[derive(Clone)]
pub struct SqlDatabase {
    pool: AnyPool,
    database: Database,
}

impl SqlDatabase {
    pub async fn connect(url: &str, database: Database) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&normalize_url(url))
            .await?;
        tracing::info!("connected to {}", database);
        Ok(Self::from_pool(pool, database))
    }

    pub fn from_pool(pool: AnyPool, database: Database) -> Self {
        Self { pool, database }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn database(&self) -> Database {
        self.database
    }

    async fn count(&self, sql: &str, key: &str) -> Result<i64> {
        let row = sqlx::query(sql).bind(key.to_string()).fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    fn no_rows(table: &TableSpec, key: &RowKey) -> UpstreamError {
        UpstreamError::NoRows {
            table: table.name.to_string(),
            key: key.to_string(),
        }
    }

    /// Flag a live row deleted. A row that is already deleted is left alone.
    pub async fn soft_delete_row(&self, table: &TableSpec, key: &RowKey) -> Result<()> {
        let sql = format!(
            "UPDATE `{t}` SET deleted = ?, deleted_at = ?, updated_at = ? WHERE {k} = ? AND {live}",
            t = table.name,
            k = table.key_column,
            live = table.deleted.live_predicate("deleted"),
        );
        let now = now_string();
        let query = match table.deleted.deleted_value(key) {
            DeletedValue::Int(v) => sqlx::query(&sql).bind(v),
            DeletedValue::Text(v) => sqlx::query(&sql).bind(v),
        };
        let done = query
            .bind(now.clone())
            .bind(now)
            .bind(key.as_str().to_string())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() > 0 {
            return Ok(());
        }
        let already = format!(
            "SELECT COUNT(*) FROM `{t}` WHERE {k} = ? AND {deleted}",
            t = table.name,
            k = table.key_column,
            deleted = table.deleted.deleted_predicate("deleted"),
        );
        if self.count(&already, key.as_str()).await? > 0 {
            Ok(())
        } else {
            Err(Self::no_rows(table, key))
        }
    }

    pub async fn fill_deleted_at_row(&self, table: &TableSpec, key: &RowKey) -> Result<()> {
        let sql = format!(
            "UPDATE `{t}` SET deleted_at = updated_at WHERE {k} = ? AND {deleted} AND deleted_at IS NULL",
            t = table.name,
            k = table.key_column,
            deleted = table.deleted.deleted_predicate("deleted"),
        );
        let done = sqlx::query(&sql)
            .bind(key.as_str().to_string())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() > 0 {
            return Ok(());
        }
        let filled = format!(
            "SELECT COUNT(*) FROM `{t}` WHERE {k} = ? AND deleted_at IS NOT NULL",
            t = table.name,
            k = table.key_column,
        );
        if self.count(&filled, key.as_str()).await? > 0 {
            Ok(())
        } else {
            Err(Self::no_rows(table, key))
        }
    }

    pub async fn undelete_row(&self, table: &TableSpec, key: &RowKey) -> Result<()> {
        let sql = format!(
            "UPDATE `{t}` SET deleted = {live}, deleted_at = NULL, updated_at = ? WHERE {k} = ?",
            t = table.name,
            live = table.deleted.live_value(),
            k = table.key_column,
        );
        let done = sqlx::query(&sql)
            .bind(now_string())
            .bind(key.as_str().to_string())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Self::no_rows(table, key));
        }
        Ok(())
    }

    /// Live child rows whose parent row is soft-deleted.
    pub async fn orphans(&self, pair: &IntegrityPair) -> Result<Vec<OrphanRow>> {
        let sql = format!(
            "SELECT CAST(c.{ck} AS CHAR) AS child_key, CAST(c.{cc} AS CHAR) AS parent_key \
             FROM `{child}` c JOIN `{parent}` p ON c.{cc} = p.{pc} \
             WHERE {child_live} AND {parent_deleted}",
            ck = pair.child.key_column,
            cc = pair.child_column,
            child = pair.child.name,
            parent = pair.parent.name,
            pc = pair.parent_column,
            child_live = pair.child.deleted.live_predicate("c.deleted"),
            parent_deleted = pair.parent.deleted.deleted_predicate("p.deleted"),
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<OrphanRow> {
                Ok(OrphanRow {
                    pair: *pair,
                    child_key: RowKey(row.try_get("child_key")?),
                    parent_key: row.try_get("parent_key")?,
                })
            })
            .collect()
    }

    pub async fn missing_deleted_at(&self, table: &TableSpec) -> Result<Vec<RowKey>> {
        let sql = format!(
            "SELECT CAST({k} AS CHAR) FROM `{t}` WHERE {deleted} AND deleted_at IS NULL",
            k = table.key_column,
            t = table.name,
            deleted = table.deleted.deleted_predicate("deleted"),
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<RowKey> { Ok(RowKey(row.try_get(0)?)) })
            .collect()
    }

    /// Deleted `services` rows whose host still carries live volumes and has
    /// no live replacement.
    pub async fn referenced_deleted_services(&self) -> Result<Vec<(RowKey, String)>> {
        let services = sqlx::query(
            "SELECT CAST(id AS CHAR) AS id, host, CAST(deleted AS SIGNED) AS deleted FROM services \
             WHERE host IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut live_hosts = HashSet::new();
        let mut deleted = Vec::new();
        for row in &services {
            let id: String = row.try_get("id")?;
            let host: String = row.try_get("host")?;
            let flag: i64 = row.try_get("deleted")?;
            if flag == 0 {
                live_hosts.insert(host);
            } else {
                deleted.push((id, host));
            }
        }

        let volume_hosts: Vec<String> = sqlx::query(
            "SELECT DISTINCT host FROM volumes WHERE deleted = 0 AND host IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>(0))
        .collect::<std::result::Result<_, _>>()?;

        let serves = |service: &str, volume_host: &str| {
            volume_host == service
                || volume_host.starts_with(&format!("{}@", service))
                || volume_host.starts_with(&format!("{}#", service))
        };
        let mut found = Vec::new();
        for (id, host) in deleted {
            if live_hosts.contains(&host) {
                continue;
            }
            if volume_hosts.iter().any(|v| serves(&host, v)) {
                found.push((RowKey(id), host));
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl DatabaseRepair for SqlDatabase {
    async fn soft_delete(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.soft_delete_row(table, key)
            .await
            .map_err(UpstreamError::repairing)
    }

    async fn fill_deleted_at(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.fill_deleted_at_row(table, key)
            .await
            .map_err(UpstreamError::repairing)
    }

    async fn undelete(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.undelete_row(table, key)
            .await
            .map_err(UpstreamError::repairing)
    }
}

#[async_trait]
impl IntegritySource for SqlDatabase {
    fn database(&self) -> Database {
        self.database
    }

    async fn integrity_snapshot(&self, pairs: &[IntegrityPair]) -> NannyResult<IntegritySnapshot> {
        let upstream = self.database.as_str();
        let mut snapshot = IntegritySnapshot {
            database: Some(self.database),
            ..Default::default()
        };
        for pair in pairs.iter().filter(|p| p.child.database == self.database) {
            let found = self.orphans(pair).await.map_err(|e| e.observing(upstream))?;
            snapshot.orphans.extend(found);
        }
        for table in tables::tables_for(self.database) {
            let keys = self
                .missing_deleted_at(&table)
                .await
                .map_err(|e| e.observing(upstream))?;
            snapshot
                .missing_deleted_at
                .extend(keys.into_iter().map(|k| (table, k)));
        }
        if self.database == Database::Storage {
            snapshot.referenced_deleted_services = self
                .referenced_deleted_services()
                .await
                .map_err(|e| e.observing(upstream))?;
        }
        tracing::debug!(
            "{}: {} orphans, {} rows without deleted_at",
            upstream,
            snapshot.orphans.len(),
            snapshot.missing_deleted_at.len()
        );
        Ok(snapshot)
    }
}

/// Network port ids listed in an `instance_info_caches.network_info` blob.
pub fn port_ids(network_info: &str) -> Vec<Uuid> {
    #[derive(serde::Deserialize)]
    struct Vif {
        id: Option<String>,
    }
    serde_json::from_str::<Vec<Vif>>(network_info)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| v.id.and_then(|id| Uuid::parse_str(&id).ok()))
        .collect()
}

/// The compute database (instances, block device mappings, aggregates).
#[derive(Clone)]
pub struct ComputeDb(pub SqlDatabase);

impl ComputeDb {
    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self(SqlDatabase::connect(url, Database::Compute).await?))
    }

    async fn read(&self) -> Result<ComputeSnapshot> {
        let pool = self.0.pool();
        let mut snapshot = ComputeSnapshot::default();

        let rows = sqlx::query(
            "SELECT uuid, project_id, display_name, availability_zone, host, vm_state \
             FROM instances WHERE deleted = 0",
        )
        .fetch_all(pool)
        .await?;
        for row in &rows {
            let Some(id) = parse_uuid(row, "uuid") else {
                tracing::warn!("skipping instance row with malformed uuid");
                continue;
            };
            snapshot.instances.insert(
                id,
                Instance {
                    id,
                    project: row.try_get::<Option<String>, _>("project_id")?.unwrap_or_default(),
                    display_name: row
                        .try_get::<Option<String>, _>("display_name")?
                        .unwrap_or_default(),
                    availability_zone: row.try_get("availability_zone")?,
                    host: row.try_get("host")?,
                    status: row
                        .try_get::<Option<String>, _>("vm_state")?
                        .unwrap_or_default()
                        .to_uppercase(),
                    block_devices: Vec::new(),
                    port_ids: Default::default(),
                },
            );
        }

        let rows = sqlx::query(
            "SELECT CAST(id AS SIGNED) AS id, instance_uuid, volume_id, attachment_id, device_name \
             FROM block_device_mapping WHERE deleted = 0 AND volume_id IS NOT NULL",
        )
        .fetch_all(pool)
        .await?;
        for row in &rows {
            let (Some(instance_id), Some(volume_id)) =
                (parse_uuid(row, "instance_uuid"), parse_uuid(row, "volume_id"))
            else {
                continue;
            };
            if let Some(instance) = snapshot.instances.get_mut(&instance_id) {
                instance.block_devices.push(BlockDeviceMapping {
                    id: row.try_get("id")?,
                    instance_id,
                    volume_id,
                    attachment_id: parse_uuid(row, "attachment_id"),
                    device_name: row.try_get("device_name")?,
                });
            }
        }

        let rows = sqlx::query(
            "SELECT instance_uuid, network_info FROM instance_info_caches WHERE deleted = 0",
        )
        .fetch_all(pool)
        .await?;
        for row in &rows {
            let Some(instance_id) = parse_uuid(row, "instance_uuid") else {
                continue;
            };
            let info: Option<String> = row.try_get("network_info")?;
            if let (Some(instance), Some(info)) = (snapshot.instances.get_mut(&instance_id), info) {
                instance.port_ids.extend(port_ids(&info));
            }
        }

        let rows = sqlx::query(
            "SELECT ah.host AS host, a.name AS name FROM aggregate_hosts ah \
             JOIN aggregates a ON a.id = ah.aggregate_id \
             WHERE ah.deleted = 0 AND a.deleted = 0",
        )
        .fetch_all(pool)
        .await?;
        for row in &rows {
            let host: String = row.try_get("host")?;
            let name: String = row.try_get("name")?;
            snapshot.host_aggregates.entry(host).or_default().insert(name);
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl ComputeSource for ComputeDb {
    async fn compute_snapshot(&self) -> NannyResult<ComputeSnapshot> {
        self.read().await.map_err(|e| e.observing("compute-db"))
    }
}

#[async_trait]
impl DatabaseRepair for ComputeDb {
    async fn soft_delete(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.0.soft_delete(table, key).await
    }

    async fn fill_deleted_at(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.0.fill_deleted_at(table, key).await
    }

    async fn undelete(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.0.undelete(table, key).await
    }
}

#[async_trait]
impl ComputeRepair for ComputeDb {
    async fn set_mapping_attachment_id(&self, mapping_id: i64, attachment_id: Uuid) -> NannyResult<()> {
        let pool = self.0.pool();
        let done = sqlx::query(
            "UPDATE block_device_mapping SET attachment_id = ?, updated_at = ? \
             WHERE id = ? AND deleted = 0",
        )
        .bind(attachment_id.to_string())
        .bind(now_string())
        .bind(mapping_id)
        .execute(pool)
        .await
        .map_err(|e| UpstreamError::from(e).repairing())?;
        if done.rows_affected() == 0 {
            return Err(NannyError::NoRowsAffected {
                table: "block_device_mapping".to_string(),
                key: mapping_id.to_string(),
            });
        }
        Ok(())
    }
}

/// The storage database (volumes, attachments, services).
#[derive(Clone)]
pub struct StorageDb(pub SqlDatabase);

impl StorageDb {
    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self(SqlDatabase::connect(url, Database::Storage).await?))
    }

    async fn read(&self) -> Result<StorageSnapshot> {
        let pool = self.0.pool();
        let mut snapshot = StorageSnapshot::default();

        let rows = sqlx::query(
            "SELECT id, project_id, status, attach_status, CAST(size AS SIGNED) AS size, host, \
             availability_zone, CAST(updated_at AS CHAR) AS updated_at \
             FROM volumes WHERE deleted = 0",
        )
        .fetch_all(pool)
        .await?;
        for row in &rows {
            let Some(id) = parse_uuid(row, "id") else {
                tracing::warn!("skipping volume row with malformed id");
                continue;
            };
            let status: String = row.try_get("status")?;
            let status = VolumeStatus::from_str(&status)
                .map_err(|e| UpstreamError::decode(format!("volume {}", id), e))?;
            let attach_status = row
                .try_get::<Option<String>, _>("attach_status")?
                .and_then(|s| AttachStatus::from_str(&s).ok())
                .unwrap_or(AttachStatus::Detached);
            let size_gb: Option<i64> = row.try_get("size")?;
            snapshot.volumes.insert(
                id,
                Volume {
                    id,
                    project: row.try_get::<Option<String>, _>("project_id")?.unwrap_or_default(),
                    status,
                    attach_status,
                    size_bytes: size_gb.unwrap_or(0).max(0) as u64 * GIB,
                    host: row.try_get("host")?,
                    availability_zone: row.try_get("availability_zone")?,
                    attachments: Vec::new(),
                    updated_at: row
                        .try_get::<Option<String>, _>("updated_at")?
                        .as_deref()
                        .and_then(parse_db_time),
                },
            );
        }

        let rows = sqlx::query(
            "SELECT id, volume_id, instance_uuid, mountpoint, attach_status \
             FROM volume_attachment WHERE deleted = 0",
        )
        .fetch_all(pool)
        .await?;
        for row in &rows {
            let (Some(id), Some(volume_id)) = (parse_uuid(row, "id"), parse_uuid(row, "volume_id"))
            else {
                continue;
            };
            if let Some(volume) = snapshot.volumes.get_mut(&volume_id) {
                volume.attachments.push(VolumeAttachment {
                    id,
                    volume_id,
                    instance_id: parse_uuid(row, "instance_uuid"),
                    device_name: row.try_get("mountpoint")?,
                    attach_status: row
                        .try_get::<Option<String>, _>("attach_status")?
                        .and_then(|s| AttachStatus::from_str(&s).ok()),
                });
            }
        }

        let rows = sqlx::query("SELECT id FROM volumes WHERE deleted <> 0")
            .fetch_all(pool)
            .await?;
        snapshot.deleted_volume_ids = rows
            .iter()
            .filter_map(|row| parse_uuid(row, "id"))
            .filter(|id| !snapshot.volumes.contains_key(id))
            .collect();

        let rows = sqlx::query("SELECT id FROM volume_attachment")
            .fetch_all(pool)
            .await?;
        snapshot.all_attachment_ids = rows.iter().filter_map(|row| parse_uuid(row, "id")).collect();
        Ok(snapshot)
    }

    async fn attachment_exists(&self, id: &Uuid) -> Result<bool> {
        let n = self
            .0
            .count("SELECT COUNT(*) FROM volume_attachment WHERE id = ?", &id.to_string())
            .await?;
        Ok(n > 0)
    }
}

#[async_trait]
impl StorageSource for StorageDb {
    async fn storage_snapshot(&self) -> NannyResult<StorageSnapshot> {
        self.read().await.map_err(|e| e.observing("storage-db"))
    }
}

#[async_trait]
impl DatabaseRepair for StorageDb {
    async fn soft_delete(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.0.soft_delete(table, key).await
    }

    async fn fill_deleted_at(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.0.fill_deleted_at(table, key).await
    }

    async fn undelete(&self, table: &TableSpec, key: &RowKey) -> NannyResult<()> {
        self.0.undelete(table, key).await
    }
}

#[async_trait]
impl StorageRepair for StorageDb {
    async fn set_volume_status(
        &self,
        volume: &VolumeId,
        status: VolumeStatus,
        attach_status: AttachStatus,
    ) -> NannyResult<()> {
        let done = sqlx::query(
            "UPDATE volumes SET status = ?, attach_status = ?, updated_at = ? \
             WHERE id = ? AND deleted = 0",
        )
        .bind(status.as_str().to_string())
        .bind(attach_status.as_str().to_string())
        .bind(now_string())
        .bind(volume.to_string())
        .execute(self.0.pool())
        .await
        .map_err(|e| UpstreamError::from(e).repairing())?;
        if done.rows_affected() == 0 {
            return Err(NannyError::NoRowsAffected {
                table: storage::VOLUMES.name.to_string(),
                key: volume.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_attachment(&self, row: &NewAttachment) -> NannyResult<()> {
        if self
            .attachment_exists(&row.id)
            .await
            .map_err(UpstreamError::repairing)?
        {
            tracing::debug!("attachment {} already present", row.id);
            return Ok(());
        }
        let now = now_string();
        sqlx::query(
            "INSERT INTO volume_attachment (id, volume_id, instance_uuid, attached_host, \
             mountpoint, attach_status, attach_mode, attach_time, created_at, updated_at, deleted) \
             VALUES (?, ?, ?, ?, ?, 'attached', 'rw', ?, ?, ?, 0)",
        )
        .bind(row.id.to_string())
        .bind(row.volume_id.to_string())
        .bind(row.instance_id.to_string())
        .bind(row.attached_host.clone())
        .bind(row.device_name.clone())
        .bind(now.clone())
        .bind(now.clone())
        .bind(now)
        .execute(self.0.pool())
        .await
        .map_err(|e| UpstreamError::from(e).repairing())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanny_core::tables::{compute, share};

    const SCHEMA: &[&str] = &[
        "CREATE TABLE instances (id INTEGER PRIMARY KEY, uuid TEXT, project_id TEXT, \
         display_name TEXT, availability_zone TEXT, host TEXT, vm_state TEXT, \
         deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE block_device_mapping (id INTEGER PRIMARY KEY, instance_uuid TEXT, \
         volume_id TEXT, attachment_id TEXT, device_name TEXT, deleted INTEGER DEFAULT 0, \
         deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE instance_info_caches (id INTEGER PRIMARY KEY, instance_uuid TEXT, \
         network_info TEXT, deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE aggregates (id INTEGER PRIMARY KEY, name TEXT, deleted INTEGER DEFAULT 0)",
        "CREATE TABLE aggregate_hosts (id INTEGER PRIMARY KEY, host TEXT, aggregate_id INTEGER, \
         deleted INTEGER DEFAULT 0)",
        "CREATE TABLE volumes (id TEXT PRIMARY KEY, project_id TEXT, status TEXT, \
         attach_status TEXT, size INTEGER, host TEXT, availability_zone TEXT, \
         deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE volume_attachment (id TEXT PRIMARY KEY, volume_id TEXT, instance_uuid TEXT, \
         attached_host TEXT, mountpoint TEXT, attach_status TEXT, attach_mode TEXT, \
         attach_time TEXT, created_at TEXT, updated_at TEXT, deleted INTEGER DEFAULT 0, \
         deleted_at TEXT)",
        "CREATE TABLE volume_metadata (id INTEGER PRIMARY KEY, volume_id TEXT, \
         deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE volume_admin_metadata (id INTEGER PRIMARY KEY, volume_id TEXT, \
         deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE volume_glance_metadata (id INTEGER PRIMARY KEY, volume_id TEXT, \
         snapshot_id TEXT, deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE snapshots (id TEXT PRIMARY KEY, volume_id TEXT, \
         deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE snapshot_metadata (id INTEGER PRIMARY KEY, snapshot_id TEXT, \
         deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE `groups` (id TEXT PRIMARY KEY, deleted INTEGER DEFAULT 0, \
         deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE group_volume_type_mapping (id INTEGER PRIMARY KEY, group_id TEXT, \
         deleted INTEGER DEFAULT 0, deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE services (id INTEGER PRIMARY KEY, host TEXT, deleted INTEGER DEFAULT 0, \
         deleted_at TEXT, updated_at TEXT)",
        "CREATE TABLE shares (id TEXT PRIMARY KEY, deleted TEXT DEFAULT 'False', \
         deleted_at TEXT, updated_at TEXT)",
    ];

    async fn memory_db(database: Database) -> SqlDatabase {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        SqlDatabase::from_pool(pool, database)
    }

    async fn exec(db: &SqlDatabase, sql: &str) {
        sqlx::query(sql).execute(db.pool()).await.unwrap();
    }

    const VOL: &str = "6a8b1f4e-3c2d-4e5f-9a0b-1c2d3e4f5a6b";
    const INST: &str = "0f1e2d3c-4b5a-4968-8776-655443322110";
    const PORT: &str = "9e8d7c6b-5a49-4837-a625-140312f0e1d2";

    #[test]
    fn test_normalize_url_strips_driver() {
        assert_eq!(
            normalize_url("mysql+pymysql://nova:pw@db:3306/nova?charset=utf8"),
            "mysql://nova:pw@db:3306/nova?charset=utf8"
        );
        assert_eq!(normalize_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(normalize_url("mysql://x@y/z"), "mysql://x@y/z");
    }

    #[test]
    fn test_parse_db_time_formats() {
        assert!(parse_db_time("2024-05-01 10:11:12").is_some());
        assert!(parse_db_time("2024-05-01 10:11:12.123456").is_some());
        assert!(parse_db_time("2024-05-01T10:11:12").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }

    #[test]
    fn test_port_ids_from_network_info() {
        let info = format!(r#"[{{"id": "{}", "address": "fa:16:3e:00:00:01"}}, {{"id": "bogus"}}]"#, PORT);
        assert_eq!(port_ids(&info), vec![Uuid::parse_str(PORT).unwrap()]);
        assert!(port_ids("not json").is_empty());
    }

    #[tokio::test]
    async fn test_compute_snapshot() {
        let db = memory_db(Database::Compute).await;
        exec(&db, &format!(
            "INSERT INTO instances (uuid, project_id, display_name, host, vm_state) \
             VALUES ('{}', 'p1', 'web', 'nova-compute-bb01', 'active')", INST)).await;
        exec(&db, &format!(
            "INSERT INTO block_device_mapping (id, instance_uuid, volume_id, device_name) \
             VALUES (7, '{}', '{}', '/dev/sdb')", INST, VOL)).await;
        exec(&db, &format!(
            "INSERT INTO instance_info_caches (instance_uuid, network_info) VALUES ('{}', '[{{\"id\": \"{}\"}}]')",
            INST, PORT)).await;
        exec(&db, "INSERT INTO aggregates (id, name) VALUES (1, 'vc-a-0')").await;
        exec(&db, "INSERT INTO aggregate_hosts (host, aggregate_id) VALUES ('nova-compute-bb01', 1)").await;

        let snapshot = ComputeDb(db).compute_snapshot().await.unwrap();
        let instance = &snapshot.instances[&Uuid::parse_str(INST).unwrap()];
        assert_eq!(instance.status, "ACTIVE");
        assert_eq!(instance.block_devices.len(), 1);
        assert_eq!(instance.block_devices[0].id, 7);
        assert_eq!(instance.block_devices[0].attachment_id, None);
        assert!(instance.port_ids.contains(&Uuid::parse_str(PORT).unwrap()));
        assert!(snapshot.host_aggregates["nova-compute-bb01"].contains("vc-a-0"));
    }

    #[tokio::test]
    async fn test_storage_snapshot_splits_live_and_deleted() {
        let db = memory_db(Database::Storage).await;
        let gone = Uuid::new_v4();
        exec(&db, &format!(
            "INSERT INTO volumes (id, project_id, status, attach_status, size, updated_at) \
             VALUES ('{}', 'p1', 'in-use', 'attached', 10, '2024-05-01 10:11:12')", VOL)).await;
        exec(&db, &format!(
            "INSERT INTO volumes (id, status, size, deleted) VALUES ('{}', 'deleted', 1, 1)", gone)).await;
        let att = Uuid::new_v4();
        let old_att = Uuid::new_v4();
        exec(&db, &format!(
            "INSERT INTO volume_attachment (id, volume_id, instance_uuid, mountpoint, attach_status) \
             VALUES ('{}', '{}', '{}', '/dev/sdb', 'attached')", att, VOL, INST)).await;
        exec(&db, &format!(
            "INSERT INTO volume_attachment (id, volume_id, deleted) VALUES ('{}', '{}', 1)",
            old_att, VOL)).await;

        let snapshot = StorageDb(db).storage_snapshot().await.unwrap();
        let volume = &snapshot.volumes[&Uuid::parse_str(VOL).unwrap()];
        assert_eq!(volume.status, VolumeStatus::InUse);
        assert_eq!(volume.size_bytes, 10 * GIB);
        assert!(volume.updated_at.is_some());
        assert_eq!(volume.attachments.len(), 1);
        assert!(snapshot.deleted_volume_ids.contains(&gone));
        assert_eq!(snapshot.all_attachment_ids.len(), 2);
        assert!(snapshot.all_attachment_ids.contains(&old_att));
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent() {
        let db = memory_db(Database::Storage).await;
        let att = Uuid::new_v4();
        exec(&db, &format!("INSERT INTO volume_attachment (id, volume_id) VALUES ('{}', '{}')", att, VOL)).await;
        let key = RowKey::new(att);

        db.soft_delete(&storage::VOLUME_ATTACHMENT, &key).await.unwrap();
        db.soft_delete(&storage::VOLUME_ATTACHMENT, &key).await.unwrap();

        let row = sqlx::query("SELECT deleted, deleted_at FROM volume_attachment")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let deleted: i64 = row.try_get(0).unwrap();
        let deleted_at: Option<String> = row.try_get(1).unwrap();
        assert_eq!(deleted, 1);
        assert!(deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_compute_soft_delete_uses_row_id() {
        let db = memory_db(Database::Compute).await;
        exec(&db, &format!(
            "INSERT INTO block_device_mapping (id, instance_uuid, volume_id) VALUES (42, '{}', '{}')",
            INST, VOL)).await;
        db.soft_delete(&compute::BLOCK_DEVICE_MAPPING, &RowKey::new(42)).await.unwrap();
        let row = sqlx::query("SELECT deleted FROM block_device_mapping WHERE id = 42")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let deleted: i64 = row.try_get(0).unwrap();
        assert_eq!(deleted, 42);
    }

    #[tokio::test]
    async fn test_share_soft_delete_uses_string_flag() {
        let db = memory_db(Database::Share).await;
        exec(&db, "INSERT INTO shares (id) VALUES ('share-1')").await;
        db.soft_delete(&share::SHARES, &RowKey::new("share-1")).await.unwrap();
        let row = sqlx::query("SELECT deleted FROM shares")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let deleted: String = row.try_get(0).unwrap();
        assert_eq!(deleted, "share-1");
    }

    #[tokio::test]
    async fn test_soft_delete_missing_row_fails() {
        let db = memory_db(Database::Storage).await;
        let err = db
            .soft_delete(&storage::VOLUMES, &RowKey::new(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, NannyError::NoRowsAffected { .. }));
    }

    #[tokio::test]
    async fn test_integrity_snapshot() {
        let db = memory_db(Database::Storage).await;
        exec(&db, &format!("INSERT INTO volumes (id, status, deleted, deleted_at) VALUES ('{}', 'deleted', 1, '2024-01-01 00:00:00')", VOL)).await;
        exec(&db, &format!("INSERT INTO volume_metadata (id, volume_id) VALUES (5, '{}')", VOL)).await;
        exec(&db, "INSERT INTO volumes (id, status, host) VALUES ('v-live', 'available', 'cinder-volume-bb01@netapp#pool1')").await;
        exec(&db, "INSERT INTO volumes (id, status, deleted) VALUES ('v-nodate', 'deleted', 1)").await;
        exec(&db, "INSERT INTO services (id, host, deleted) VALUES (4, 'cinder-volume-bb01', 1)").await;
        exec(&db, "INSERT INTO services (id, host, deleted) VALUES (5, 'cinder-volume-bb02', 1)").await;

        let pairs: Vec<IntegrityPair> = tables::pairs_for(Database::Storage).copied().collect();
        let snapshot = db.integrity_snapshot(&pairs).await.unwrap();

        assert_eq!(snapshot.orphans.len(), 1);
        assert_eq!(snapshot.orphans[0].child_key.as_str(), "5");
        assert_eq!(snapshot.orphans[0].parent_key, VOL);
        assert_eq!(
            snapshot.missing_deleted_at,
            vec![(storage::VOLUMES, RowKey::new("v-nodate"))]
        );
        assert_eq!(
            snapshot.referenced_deleted_services,
            vec![(RowKey::new(4), "cinder-volume-bb01".to_string())]
        );

        db.undelete(&storage::SERVICES, &RowKey::new(4)).await.unwrap();
        let again = db.referenced_deleted_services().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_attachment_reconstruction() {
        let compute_db = ComputeDb(memory_db(Database::Compute).await);
        exec(&compute_db.0, &format!(
            "INSERT INTO block_device_mapping (id, instance_uuid, volume_id) VALUES (7, '{}', '{}')",
            INST, VOL)).await;
        let storage_db = StorageDb(memory_db(Database::Storage).await);
        exec(&storage_db.0, &format!(
            "INSERT INTO volumes (id, project_id, status, attach_status, size) VALUES ('{}', 'p', 'available', 'detached', 1)",
            VOL)).await;

        let id = Uuid::new_v4();
        compute_db.set_mapping_attachment_id(7, id).await.unwrap();
        let row = NewAttachment {
            id,
            volume_id: Uuid::parse_str(VOL).unwrap(),
            instance_id: Uuid::parse_str(INST).unwrap(),
            device_name: Some("/dev/sdb".to_string()),
            attached_host: Some("nova-compute-bb01".to_string()),
        };
        storage_db.insert_attachment(&row).await.unwrap();
        storage_db.insert_attachment(&row).await.unwrap();
        storage_db
            .set_volume_status(&row.volume_id, VolumeStatus::InUse, AttachStatus::Attached)
            .await
            .unwrap();

        let mapped = sqlx::query("SELECT attachment_id FROM block_device_mapping WHERE id = 7")
            .fetch_one(compute_db.0.pool())
            .await
            .unwrap();
        assert_eq!(mapped.try_get::<String, _>(0).unwrap(), id.to_string());
        let storage = storage_db.storage_snapshot().await.unwrap();
        let volume = &storage.volumes[&row.volume_id];
        assert_eq!(volume.status, VolumeStatus::InUse);
        assert_eq!(volume.attachments.len(), 1);
        assert_eq!(volume.attachments[0].id, id);

        let err = compute_db.set_mapping_attachment_id(99, id).await.unwrap_err();
        assert!(matches!(err, NannyError::NoRowsAffected { .. }));
    }
}
