//! Registry of the relational tables the nannies read and soft-delete.
//!
//! Each table declares exactly one soft-delete representation. Mixing
//! `deleted == 0`, `deleted == False` and `deleted != 'False'` for the same
//! table is not supported.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Database {
    Compute,
    Storage,
    Share,
}

impl Database {
    pub fn as_str(&self) -> &'static str {
        match self {
            Database::Compute => "compute-db",
            Database::Storage => "storage-db",
            Database::Share => "share-db",
        }
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a table marks a row as soft-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletedRepr {
    /// Integer column, `0` when live, the row id when deleted.
    IntegerId,
    /// Boolean column, `0` when live, `1` when deleted.
    Boolean,
    /// String column, `'False'` when live, the row id when deleted.
    StringFlag,
}

impl DeletedRepr {
    /// SQL predicate selecting live rows.
    pub fn live_predicate(&self, column: &str) -> String {
        match self {
            DeletedRepr::IntegerId | DeletedRepr::Boolean => format!("{} = 0", column),
            DeletedRepr::StringFlag => format!("{} = 'False'", column),
        }
    }

    /// SQL predicate selecting deleted rows.
    pub fn deleted_predicate(&self, column: &str) -> String {
        match self {
            DeletedRepr::IntegerId | DeletedRepr::Boolean => format!("{} <> 0", column),
            DeletedRepr::StringFlag => format!("{} <> 'False'", column),
        }
    }

    /// SQL literal marking a row live again.
    pub fn live_value(&self) -> &'static str {
        match self {
            DeletedRepr::IntegerId | DeletedRepr::Boolean => "0",
            DeletedRepr::StringFlag => "'False'",
        }
    }

    /// Value written into `deleted` when soft-deleting the row with `key`.
    pub fn deleted_value(&self, key: &RowKey) -> DeletedValue {
        match self {
            DeletedRepr::IntegerId => match key.as_i64() {
                Some(id) => DeletedValue::Int(id),
                None => DeletedValue::Int(1),
            },
            DeletedRepr::Boolean => DeletedValue::Int(1),
            DeletedRepr::StringFlag => DeletedValue::Text(key.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletedValue {
    Int(i64),
    Text(String),
}

/// Primary-key value of a row, kept as text; integer keys round-trip
/// through [`RowKey::as_i64`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(pub String);

impl RowKey {
    pub fn new(key: impl ToString) -> Self {
        RowKey(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub name: &'static str,
    pub database: Database,
    pub key_column: &'static str,
    pub deleted: DeletedRepr,
}

impl TableSpec {
    const fn compute(name: &'static str, key_column: &'static str) -> Self {
        Self {
            name,
            database: Database::Compute,
            key_column,
            deleted: DeletedRepr::IntegerId,
        }
    }

    const fn storage(name: &'static str) -> Self {
        Self {
            name,
            database: Database::Storage,
            key_column: "id",
            deleted: DeletedRepr::Boolean,
        }
    }

    const fn share(name: &'static str) -> Self {
        Self {
            name,
            database: Database::Share,
            key_column: "id",
            deleted: DeletedRepr::StringFlag,
        }
    }
}

pub mod compute {
    use super::TableSpec;

    pub const INSTANCES: TableSpec = TableSpec::compute("instances", "uuid");
    pub const BLOCK_DEVICE_MAPPING: TableSpec = TableSpec::compute("block_device_mapping", "id");
    pub const INSTANCE_INFO_CACHES: TableSpec = TableSpec::compute("instance_info_caches", "id");
    pub const AGGREGATES: TableSpec = TableSpec::compute("aggregates", "id");
    pub const AGGREGATE_HOSTS: TableSpec = TableSpec::compute("aggregate_hosts", "id");
}

pub mod storage {
    use super::TableSpec;

    pub const VOLUMES: TableSpec = TableSpec::storage("volumes");
    pub const VOLUME_ATTACHMENT: TableSpec = TableSpec::storage("volume_attachment");
    pub const VOLUME_METADATA: TableSpec = TableSpec::storage("volume_metadata");
    pub const VOLUME_ADMIN_METADATA: TableSpec = TableSpec::storage("volume_admin_metadata");
    pub const VOLUME_GLANCE_METADATA: TableSpec = TableSpec::storage("volume_glance_metadata");
    pub const SNAPSHOTS: TableSpec = TableSpec::storage("snapshots");
    pub const SNAPSHOT_METADATA: TableSpec = TableSpec::storage("snapshot_metadata");
    pub const SERVICES: TableSpec = TableSpec::storage("services");
    pub const GROUPS: TableSpec = TableSpec::storage("groups");
    pub const GROUP_VOLUME_TYPE_MAPPING: TableSpec = TableSpec::storage("group_volume_type_mapping");
}

pub mod share {
    use super::TableSpec;

    pub const SHARES: TableSpec = TableSpec::share("shares");
    pub const SHARE_METADATA: TableSpec = TableSpec::share("share_metadata");
    pub const SHARE_INSTANCES: TableSpec = TableSpec::share("share_instances");
    pub const SHARE_INSTANCE_ACCESS_MAP: TableSpec = TableSpec::share("share_instance_access_map");
    pub const SHARE_NETWORKS: TableSpec = TableSpec::share("share_networks");
    pub const SHARE_NETWORK_SECURITY_SERVICE_ASSOCIATION: TableSpec =
        TableSpec::share("share_network_security_service_association");
    pub const SHARE_SERVERS: TableSpec = TableSpec::share("share_servers");
    pub const NETWORK_ALLOCATIONS: TableSpec = TableSpec::share("network_allocations");
    pub const SHARE_GROUP_TYPES: TableSpec = TableSpec::share("share_group_types");
    pub const SHARE_GROUP_TYPE_SHARE_TYPE_MAPPINGS: TableSpec =
        TableSpec::share("share_group_type_share_type_mappings");
    pub const SHARE_INSTANCE_EXPORT_LOCATIONS: TableSpec =
        TableSpec::share("share_instance_export_locations");
    pub const SHARE_INSTANCE_EXPORT_LOCATIONS_METADATA: TableSpec =
        TableSpec::share("share_instance_export_locations_metadata");
}

/// A (parent, child) table pair where a live child row must not reference a
/// soft-deleted parent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegrityPair {
    pub parent: TableSpec,
    /// Column of the parent the child references.
    pub parent_column: &'static str,
    pub child: TableSpec,
    pub child_column: &'static str,
}

const fn pair(
    parent: TableSpec,
    parent_column: &'static str,
    child: TableSpec,
    child_column: &'static str,
) -> IntegrityPair {
    IntegrityPair {
        parent,
        parent_column,
        child,
        child_column,
    }
}

pub const INTEGRITY_PAIRS: &[IntegrityPair] = &[
    pair(storage::VOLUMES, "id", storage::VOLUME_METADATA, "volume_id"),
    pair(storage::VOLUMES, "id", storage::VOLUME_ADMIN_METADATA, "volume_id"),
    pair(storage::VOLUMES, "id", storage::VOLUME_GLANCE_METADATA, "volume_id"),
    pair(storage::VOLUMES, "id", storage::VOLUME_ATTACHMENT, "volume_id"),
    pair(storage::SNAPSHOTS, "id", storage::SNAPSHOT_METADATA, "snapshot_id"),
    pair(storage::SNAPSHOTS, "id", storage::VOLUME_GLANCE_METADATA, "snapshot_id"),
    pair(storage::GROUPS, "id", storage::GROUP_VOLUME_TYPE_MAPPING, "group_id"),
    pair(
        share::SHARE_NETWORKS,
        "id",
        share::SHARE_NETWORK_SECURITY_SERVICE_ASSOCIATION,
        "share_network_id",
    ),
    pair(share::SHARE_SERVERS, "id", share::NETWORK_ALLOCATIONS, "share_server_id"),
    pair(share::SHARES, "id", share::SHARE_METADATA, "share_id"),
    pair(
        share::SHARE_INSTANCES,
        "id",
        share::SHARE_INSTANCE_ACCESS_MAP,
        "share_instance_id",
    ),
    pair(
        share::SHARE_GROUP_TYPES,
        "id",
        share::SHARE_GROUP_TYPE_SHARE_TYPE_MAPPINGS,
        "share_group_type_id",
    ),
    pair(
        share::SHARE_INSTANCE_EXPORT_LOCATIONS,
        "id",
        share::SHARE_INSTANCE_EXPORT_LOCATIONS_METADATA,
        "export_location_id",
    ),
    pair(compute::INSTANCES, "uuid", compute::BLOCK_DEVICE_MAPPING, "instance_uuid"),
];

/// Integrity pairs whose tables live in `db`.
pub fn pairs_for(db: Database) -> impl Iterator<Item = &'static IntegrityPair> {
    INTEGRITY_PAIRS.iter().filter(move |p| p.child.database == db)
}

/// Every registered table of `db`, checked for `deleted` without `deleted_at`.
pub fn tables_for(db: Database) -> Vec<TableSpec> {
    let mut tables: Vec<TableSpec> = Vec::new();
    for p in pairs_for(db) {
        for t in [p.parent, p.child] {
            if !tables.iter().any(|known| known.name == t.name) {
                tables.push(t);
            }
        }
    }
    tables
}

pub fn lookup(db: Database, name: &str) -> Option<TableSpec> {
    tables_for(db).into_iter().find(|t| t.name == name).or(match (db, name) {
        (Database::Storage, "services") => Some(storage::SERVICES),
        _ => None,
    })
}
