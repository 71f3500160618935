//! Soft-delete integrity classification.

use crate::fault::{EntityKey, Fault, FaultKind};
use crate::repair::RepairAction;
use crate::snapshot::IntegritySnapshot;
use crate::tables::storage;

pub fn classify(snapshot: &IntegritySnapshot) -> Vec<Fault> {
    let mut faults = Vec::new();

    for orphan in &snapshot.orphans {
        let child = orphan.pair.child;
        faults.push(
            Fault::repair(
                FaultKind::IOrphaned(child.name),
                EntityKey::row(&child, &orphan.child_key),
                format!(
                    "{}.{} {} references deleted {} {}",
                    child.database,
                    child.name,
                    orphan.child_key,
                    orphan.pair.parent.name,
                    orphan.parent_key
                ),
                vec![RepairAction::SoftDelete {
                    table: child,
                    key: orphan.child_key.clone(),
                }],
            )
            .with_related(&orphan.parent_key),
        );
    }

    for (table, key) in &snapshot.missing_deleted_at {
        faults.push(Fault::repair(
            FaultKind::IMissingDeletedAt,
            EntityKey::row(table, key),
            format!(
                "{}.{} {} is deleted without deleted_at",
                table.database, table.name, key
            ),
            vec![RepairAction::FillDeletedAt {
                table: *table,
                key: key.clone(),
            }],
        ));
    }

    for (key, host) in &snapshot.referenced_deleted_services {
        faults.push(
            Fault::repair(
                FaultKind::IServiceDeletedButReferenced,
                EntityKey::row(&storage::SERVICES, key),
                format!("deleted service {} is still used by volumes on {}", key, host),
                vec![RepairAction::Undelete {
                    table: storage::SERVICES,
                    key: key.clone(),
                }],
            )
            .with_related(host),
        );
    }

    faults
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::OrphanRow;
    use crate::tables::{Database, RowKey, INTEGRITY_PAIRS};

    #[test]
    fn test_orphan_child_soft_deleted() {
        let pair = INTEGRITY_PAIRS
            .iter()
            .find(|p| p.child.name == "volume_metadata")
            .copied()
            .unwrap();
        let snapshot = IntegritySnapshot {
            database: Some(Database::Storage),
            orphans: vec![OrphanRow {
                pair,
                child_key: RowKey::new(17),
                parent_key: "vol-1".to_string(),
            }],
            ..Default::default()
        };
        let faults = classify(&snapshot);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind.name(), "I_VOLUME_METADATA_ORPHANED");
        assert_eq!(
            faults[0].actions,
            vec![RepairAction::SoftDelete {
                table: pair.child,
                key: RowKey::new(17)
            }]
        );
    }

    #[test]
    fn test_missing_deleted_at_and_services() {
        let snapshot = IntegritySnapshot {
            database: Some(Database::Storage),
            missing_deleted_at: vec![(storage::SNAPSHOTS, RowKey::new("s1"))],
            referenced_deleted_services: vec![(RowKey::new(4), "cinder-volume-bb01".to_string())],
            ..Default::default()
        };
        let faults = classify(&snapshot);
        assert_eq!(faults[0].kind, FaultKind::IMissingDeletedAt);
        assert_eq!(faults[1].kind, FaultKind::IServiceDeletedButReferenced);
        assert!(matches!(faults[1].actions[0], RepairAction::Undelete { .. }));
    }
}
