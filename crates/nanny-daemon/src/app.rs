//! Builds one nanny and its repairers from the configuration.

use crate::cli::Command;
use crate::config::{ConfigError, DatabaseSection, NannyConfig};
use anyhow::{Context, Result};
use nanny_core::balance::storage::BalanceMode;
use nanny_core::nannies::{BigVmNanny, IntegrityNanny, StorageBalanceNanny, VcenterNanny, VolumeNanny};
use nanny_core::repair::VmgrRepair;
use nanny_core::snapshot::{ArraySource, IntegritySource, VmgrSource};
use nanny_core::tables::Database;
use nanny_core::{Nanny, NannyMetrics, Repairers, Snapshotter};
use nanny_upstream::array::{ArrayClient, ArrayFleet};
use nanny_upstream::openstack::{Credentials, OpenStackClient};
use nanny_upstream::promql::PromTelemetry;
use nanny_upstream::recommender::HttpRecommender;
use nanny_upstream::sql::{ComputeDb, SqlDatabase, StorageDb};
use nanny_upstream::vmgr::VmgrGateway;
use std::sync::Arc;

pub struct Wired {
    pub nanny: Box<dyn Nanny>,
    pub repairers: Repairers,
}

fn require<'a, T>(section: &'a Option<T>, name: &str, command: Command) -> Result<&'a T, ConfigError> {
    section.as_ref().ok_or_else(|| {
        ConfigError::Invalid(format!(
            "[{}] is required by the {} nanny",
            name,
            command.name()
        ))
    })
}

async fn compute_db(section: &DatabaseSection) -> Result<Arc<ComputeDb>> {
    Ok(Arc::new(
        ComputeDb::connect(&section.connection)
            .await
            .context("connecting to the compute database")?,
    ))
}

async fn storage_db(section: &DatabaseSection) -> Result<Arc<StorageDb>> {
    Ok(Arc::new(
        StorageDb::connect(&section.connection)
            .await
            .context("connecting to the storage database")?,
    ))
}

fn openstack(config: &NannyConfig) -> Result<Arc<OpenStackClient>> {
    let mut creds = Credentials::from_env().context("reading OpenStack credentials")?;
    if let Some(region) = &config.common.region {
        creds.region = region.clone();
    }
    Ok(Arc::new(OpenStackClient::new(creds)))
}

fn vmgr(config: &NannyConfig) -> Option<Arc<VmgrGateway>> {
    config
        .vmgr
        .as_ref()
        .map(|v| Arc::new(VmgrGateway::new(&v.url, v.datastore_retries)))
}

fn array(config: &NannyConfig) -> Option<Arc<ArrayFleet>> {
    config.array.as_ref().map(|a| {
        Arc::new(ArrayFleet::new(
            a.urls
                .iter()
                .map(|url| ArrayClient::new(url, &a.user, &a.password))
                .collect(),
        ))
    })
}

/// Connect every upstream `command` needs. Missing sections are
/// configuration errors; unreachable upstreams and missing credentials are
/// startup failures.
pub async fn wire(command: Command, config: &NannyConfig, metrics: Arc<NannyMetrics>) -> Result<Wired> {
    match command {
        Command::Volume => {
            let compute = require(&config.database, "database", command)?;
            let storage = require(&config.storage_database, "storage_database", command)?;
            let os = openstack(config)?;
            let compute = compute_db(compute).await?;
            let storage = storage_db(storage).await?;
            let vmgr = vmgr(config);
            let snapshotter = Snapshotter {
                compute: Some(compute.clone()),
                storage: Some(storage.clone()),
                vmgr: vmgr.clone().map(|v| v as Arc<dyn VmgrSource>),
                array: array(config).map(|a| a as Arc<dyn ArraySource>),
                catalog: Some(os.clone()),
            };
            let mut nanny = VolumeNanny::new(snapshotter, config.state_rules());
            if let Some(prefix) = &config.common.shard_prefix {
                nanny = nanny.with_shard_prefix(prefix.clone());
            }
            Ok(Wired {
                nanny: Box::new(nanny),
                repairers: Repairers {
                    compute: Some(compute),
                    storage: Some(storage),
                    share: None,
                    vmgr: vmgr.map(|v| v as Arc<dyn VmgrRepair>),
                    locker: Some(os),
                },
            })
        }
        Command::Integrity => {
            if config.database.is_none()
                && config.storage_database.is_none()
                && config.share_database.is_none()
            {
                return Err(ConfigError::Invalid(
                    "the integrity nanny needs at least one of [database], [storage_database], [share_database]"
                        .to_string(),
                )
                .into());
            }
            let mut sources: Vec<Arc<dyn IntegritySource>> = Vec::new();
            let mut repairers = Repairers::default();
            if let Some(section) = &config.database {
                let db = compute_db(section).await?;
                sources.push(Arc::new(db.0.clone()));
                repairers.compute = Some(db);
            }
            if let Some(section) = &config.storage_database {
                let db = storage_db(section).await?;
                sources.push(Arc::new(db.0.clone()));
                repairers.storage = Some(db);
            }
            if let Some(section) = &config.share_database {
                let db = Arc::new(
                    SqlDatabase::connect(&section.connection, Database::Share)
                        .await
                        .context("connecting to the share database")?,
                );
                sources.push(db.clone());
                repairers.share = Some(db);
            }
            Ok(Wired {
                nanny: Box::new(IntegrityNanny::new(sources)),
                repairers,
            })
        }
        Command::Vcenter => {
            let compute = require(&config.database, "database", command)?;
            let storage = require(&config.storage_database, "storage_database", command)?;
            require(&config.vmgr, "vmgr", command)?;
            let rules = config.vmgr_rules()?;
            let os = openstack(config)?;
            let compute = compute_db(compute).await?;
            let storage = storage_db(storage).await?;
            let vmgr = vmgr(config);
            let snapshotter = Snapshotter {
                compute: Some(compute.clone()),
                storage: Some(storage.clone()),
                vmgr: vmgr.clone().map(|v| v as Arc<dyn VmgrSource>),
                array: None,
                catalog: Some(os.clone()),
            };
            Ok(Wired {
                nanny: Box::new(VcenterNanny::new(snapshotter, rules)),
                repairers: Repairers {
                    compute: Some(compute),
                    storage: Some(storage),
                    share: None,
                    vmgr: vmgr.map(|v| v as Arc<dyn VmgrRepair>),
                    locker: Some(os),
                },
            })
        }
        Command::StorageBalance => {
            let storage = require(&config.storage_database, "storage_database", command)?;
            require(&config.vmgr, "vmgr", command)?;
            if config.storage_balance.mode == BalanceMode::Aggregate {
                require(&config.array, "array", command)?;
            }
            let rules = config.storage_balance_rules()?;
            let storage = storage_db(storage).await?;
            let vmgr = vmgr(config);
            let snapshotter = Snapshotter {
                compute: None,
                storage: Some(storage),
                vmgr: vmgr.clone().map(|v| v as Arc<dyn VmgrSource>),
                array: array(config).map(|a| a as Arc<dyn ArraySource>),
                catalog: None,
            };
            Ok(Wired {
                nanny: Box::new(StorageBalanceNanny::new(snapshotter, rules, metrics)),
                repairers: Repairers {
                    vmgr: vmgr.map(|v| v as Arc<dyn VmgrRepair>),
                    ..Default::default()
                },
            })
        }
        Command::Bigvm => {
            require(&config.vmgr, "vmgr", command)?;
            let vmgr = vmgr(config);
            let snapshotter = Snapshotter {
                vmgr: vmgr.clone().map(|v| v as Arc<dyn VmgrSource>),
                ..Default::default()
            };
            let mut nanny = BigVmNanny::new(snapshotter, config.bigvm.clone(), metrics);
            if let Some(prom) = &config.prometheus {
                nanny = nanny.with_telemetry(Arc::new(PromTelemetry::new(&prom.url, prom.queries.clone())));
            }
            if config.recommender.enabled {
                if let Some(url) = &config.recommender.url {
                    nanny = nanny.with_recommender(Arc::new(HttpRecommender::new(url)));
                }
            }
            Ok(Wired {
                nanny: Box::new(nanny),
                repairers: Repairers {
                    vmgr: vmgr.map(|v| v as Arc<dyn VmgrRepair>),
                    ..Default::default()
                },
            })
        }
    }
}
