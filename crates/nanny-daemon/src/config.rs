//! Nanny configuration file.
//!
//! One TOML (or JSON, chosen by extension) file per nanny process. Every
//! section is optional; upstreams a nanny needs but the file does not
//! configure are reported at startup.

use crate::cli::RunArgs;
use nanny_core::balance::memory::BigVmConfig;
use nanny_core::balance::storage::StorageBalanceConfig;
use nanny_core::classify::state::StateRules;
use nanny_core::classify::vmgr::VmgrRules;
use nanny_core::ident::{BackendMapper, DEFAULT_BACKEND_PATTERN};
use nanny_core::nannies::storage_balance::StorageBalanceRules;
use nanny_core::planner::CapPolicy;
use nanny_core::DriverConfig;
use nanny_upstream::promql::TelemetryQueries;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {msg}")]
    Parse { path: PathBuf, msg: String },

    #[error("unsupported config file extension: {0}")]
    UnsupportedExtension(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub interval_secs: u64,
    /// Consecutive sightings before a fault is repaired.
    pub iterations: u32,
    pub dry_run: bool,
    pub fix_limit: u32,
    /// Per-kind caps keyed by fault kind name, e.g. `S1_STUCK_DELETING`.
    pub fix_limits: HashMap<String, u32>,
    /// Port of the `/metrics` and `/health` endpoint; 0 disables it.
    pub metrics_port: u16,
    /// Metric namespace; defaults to `<nanny>_nanny`.
    pub name: Option<String>,
    /// Aggregate name prefix every compute host must belong to.
    pub shard_prefix: Option<String>,
    /// Overrides `OS_REGION` for endpoint selection.
    pub region: Option<String>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            iterations: 3,
            dry_run: false,
            fix_limit: 25,
            fix_limits: HashMap::new(),
            metrics_port: 9456,
            name: None,
            shard_prefix: None,
            region: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// `mysql://…`; SQLAlchemy-style `mysql+pymysql://…` is accepted.
    pub connection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmgrSection {
    pub url: String,
    #[serde(default = "default_datastore_retries")]
    pub datastore_retries: u32,
}

fn default_datastore_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySection {
    pub urls: Vec<String>,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusSection {
    pub url: String,
    #[serde(default)]
    pub queries: TelemetryQueries,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderSection {
    pub enabled: bool,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSection {
    /// Minutes a volume may sit in a transient phase.
    pub dwell_minutes: i64,
    pub snapshot_reserve_percent: f64,
}

impl Default for VolumeSection {
    fn default() -> Self {
        Self {
            dwell_minutes: 60,
            snapshot_reserve_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VcenterSection {
    pub ephemeral_datastore_pattern: Option<String>,
    /// Must contain a `(?P<backend>…)` group.
    pub backend_pattern: String,
}

impl Default for VcenterSection {
    fn default() -> Self {
        Self {
            ephemeral_datastore_pattern: None,
            backend_pattern: DEFAULT_BACKEND_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NannyConfig {
    pub common: CommonConfig,
    pub database: Option<DatabaseSection>,
    pub storage_database: Option<DatabaseSection>,
    pub share_database: Option<DatabaseSection>,
    pub vmgr: Option<VmgrSection>,
    pub array: Option<ArraySection>,
    pub prometheus: Option<PrometheusSection>,
    pub recommender: RecommenderSection,
    pub storage_balance: StorageBalanceConfig,
    pub bigvm: BigVmConfig,
    pub volume: VolumeSection,
    pub vcenter: VcenterSection,
}

fn parse_error(path: &Path, e: impl ToString) -> ConfigError {
    ConfigError::Parse {
        path: path.to_path_buf(),
        msg: e.to_string(),
    }
}

fn compile(what: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::Invalid(format!("{}: {}", what, e)))
}

impl NannyConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| parse_error(path, e)),
            "json" => serde_json::from_str(&contents).map_err(|e| parse_error(path, e)),
            _ => Err(ConfigError::UnsupportedExtension(ext.to_string())),
        }
    }

    /// Load, apply command-line overrides, validate.
    pub fn load(path: Option<&Path>, args: &RunArgs) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, args: &RunArgs) {
        if let Some(interval) = args.interval {
            self.common.interval_secs = interval;
        }
        if let Some(iterations) = args.iterations {
            self.common.iterations = iterations;
        }
        if args.dry_run {
            self.common.dry_run = true;
        }
        if let Some(limit) = args.fix_limit {
            self.common.fix_limit = limit;
        }
        if let Some(port) = args.metrics_port {
            self.common.metrics_port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.common;
        if c.fix_limit == 0 {
            return Err(ConfigError::Invalid("fix_limit must be at least 1".to_string()));
        }
        if c.iterations == 0 {
            return Err(ConfigError::Invalid("iterations must be at least 1".to_string()));
        }
        if c.interval_secs == 0 {
            return Err(ConfigError::Invalid("interval must be at least 1 second".to_string()));
        }
        if let Some(bad) = c
            .fix_limits
            .keys()
            .find(|k| k.is_empty() || !k.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'))
        {
            return Err(ConfigError::Invalid(format!("fix_limits key {:?} is not a fault kind", bad)));
        }
        if self.volume.dwell_minutes <= 0 {
            return Err(ConfigError::Invalid("volume.dwell_minutes must be positive".to_string()));
        }
        let sb = &self.storage_balance;
        if sb.min_usage_percent >= sb.max_usage_percent {
            return Err(ConfigError::Invalid(
                "storage_balance.min_usage_percent must be below max_usage_percent".to_string(),
            ));
        }
        if sb.lun_min_size_gb > sb.lun_max_size_gb {
            return Err(ConfigError::Invalid(
                "storage_balance.lun_min_size_gb exceeds lun_max_size_gb".to_string(),
            ));
        }
        self.vmgr_rules()?;
        self.storage_balance_rules()?;
        if self.recommender.enabled && self.recommender.url.is_none() {
            return Err(ConfigError::Invalid("recommender enabled without url".to_string()));
        }
        Ok(())
    }

    pub fn driver_config(&self, once: bool) -> DriverConfig {
        DriverConfig {
            interval: Duration::from_secs(self.common.interval_secs),
            iterations: self.common.iterations,
            dry_run: self.common.dry_run,
            caps: CapPolicy::new(self.common.fix_limit).with_overrides(&self.common.fix_limits),
            max_cycles: once.then_some(1),
        }
    }

    pub fn metric_prefix(&self, nanny: &str) -> String {
        self.common
            .name
            .clone()
            .unwrap_or_else(|| format!("{}_nanny", nanny))
    }

    pub fn state_rules(&self) -> StateRules {
        StateRules {
            dwell: chrono::Duration::minutes(self.volume.dwell_minutes),
            snapshot_reserve_percent: self.volume.snapshot_reserve_percent,
        }
    }

    pub fn vmgr_rules(&self) -> Result<VmgrRules, ConfigError> {
        let ephemeral_datastores = self
            .vcenter
            .ephemeral_datastore_pattern
            .as_deref()
            .map(|p| compile("vcenter.ephemeral_datastore_pattern", p))
            .transpose()?;
        Ok(VmgrRules {
            ephemeral_datastores,
        })
    }

    pub fn storage_balance_rules(&self) -> Result<StorageBalanceRules, ConfigError> {
        let exclude = self
            .storage_balance
            .exclude_pattern
            .as_deref()
            .map(|p| compile("storage_balance.exclude_pattern", p))
            .transpose()?;
        let mapper = BackendMapper::new(&self.vcenter.backend_pattern)
            .map_err(|e| ConfigError::Invalid(format!("vcenter.backend_pattern: {}", e)))?;
        Ok(StorageBalanceRules {
            config: self.storage_balance.clone(),
            exclude,
            mapper,
        })
    }
}
