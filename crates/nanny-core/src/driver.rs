//! Control loop shared by every nanny: observe, confirm over consecutive
//! cycles, plan under caps, execute, sleep.

use crate::error::{NannyError, Result};
use crate::events::{EventBus, ManualCheck};
use crate::executor::{ExecutionReport, Executor, Repairers};
use crate::fault::{Fault, FaultKind};
use crate::join::Anomaly;
use crate::metrics::NannyMetrics;
use crate::persistence::PersistenceFilter;
use crate::planner::{CapPolicy, RepairPlanner};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// State of one iteration. Created fresh every cycle, so a forced dry-run
/// never outlives the cycle that set it.
#[derive(Debug, Clone)]
pub struct IterationContext {
    pub cycle: u64,
    pub now: DateTime<Utc>,
    dry_run: bool,
    forced: Vec<String>,
}

impl IterationContext {
    pub fn new(cycle: u64, now: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            cycle,
            now,
            dry_run,
            forced: Vec::new(),
        }
    }

    pub fn force_dry_run(&mut self, reason: impl Into<String>) {
        self.forced.push(reason.into());
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run || !self.forced.is_empty()
    }

    pub fn is_forced(&self) -> bool {
        !self.forced.is_empty()
    }

    pub fn forced_reasons(&self) -> &[String] {
        &self.forced
    }
}

/// What a nanny saw in one cycle.
#[derive(Debug, Default)]
pub struct Observation {
    /// Faults that must persist over consecutive cycles before acting.
    pub faults: Vec<Fault>,
    /// Balancer decisions; they are recomputed from scratch every cycle and
    /// skip the persistence filter.
    pub proposals: Vec<Fault>,
    /// Structural anomalies; any one forces the cycle into dry-run.
    pub anomalies: Vec<Anomaly>,
    pub manual: Vec<ManualCheck>,
    /// Optional upstreams that could not be fetched this cycle.
    pub unavailable: Vec<String>,
}

#[async_trait]
pub trait Nanny: Send + Sync {
    fn name(&self) -> &str;

    async fn observe(&self, ctx: &mut IterationContext) -> Result<Observation>;
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub interval: Duration,
    /// Consecutive sightings before a fault becomes a candidate.
    pub iterations: u32,
    pub dry_run: bool,
    pub caps: CapPolicy,
    /// Stop after this many cycles; `None` runs until cancelled.
    pub max_cycles: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            iterations: 3,
            dry_run: false,
            caps: CapPolicy::default(),
            max_cycles: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Summary of the last finished cycle, served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleStatus {
    pub nanny: String,
    pub cycle: u64,
    pub outcome: CycleOutcome,
    pub forced_dry_run: bool,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcome: CycleOutcome,
    pub dry_run: bool,
    pub forced_reasons: Vec<String>,
    pub faults_seen: usize,
    pub candidates: usize,
    pub pending: usize,
    pub tripped: Vec<FaultKind>,
    /// `plan:` lines for faults below the persistence threshold.
    pub plan_lines: Vec<String>,
    pub execution: ExecutionReport,
}

impl CycleReport {
    fn new(ctx: &IterationContext) -> Self {
        Self {
            cycle: ctx.cycle,
            outcome: CycleOutcome::Completed,
            dry_run: ctx.dry_run(),
            forced_reasons: Vec::new(),
            faults_seen: 0,
            candidates: 0,
            pending: 0,
            tripped: Vec::new(),
            plan_lines: Vec::new(),
            execution: ExecutionReport::default(),
        }
    }
}

pub struct LoopDriver {
    nanny: Box<dyn Nanny>,
    filter: PersistenceFilter,
    planner: RepairPlanner,
    executor: Executor,
    metrics: Arc<NannyMetrics>,
    events: EventBus,
    cancel: CancellationToken,
    config: DriverConfig,
    cycle: u64,
    status: watch::Sender<Option<CycleStatus>>,
    /// Kinds whose cap gauge was raised and must be lowered again.
    tripped: BTreeSet<FaultKind>,
}

impl LoopDriver {
    pub fn new(
        nanny: Box<dyn Nanny>,
        repairers: Repairers,
        metrics: Arc<NannyMetrics>,
        config: DriverConfig,
    ) -> Self {
        let (status, _) = watch::channel(None);
        Self {
            nanny,
            filter: PersistenceFilter::new(config.iterations),
            planner: RepairPlanner::new(config.caps.clone()),
            executor: Executor::new(repairers, Arc::clone(&metrics)),
            metrics,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            config,
            cycle: 0,
            status,
            tripped: BTreeSet::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn status(&self) -> watch::Receiver<Option<CycleStatus>> {
        self.status.subscribe()
    }

    pub fn persistence(&self) -> &PersistenceFilter {
        &self.filter
    }

    /// Runs cycles until cancelled or `max_cycles` is reached. Returns the
    /// number of cycles started.
    pub async fn run(&mut self) -> u64 {
        tracing::info!(
            "{} starting, interval {:?}, iterations {}, dry-run {}",
            self.nanny.name(),
            self.config.interval,
            self.filter.threshold(),
            self.config.dry_run
        );
        let mut started = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            started += 1;
            let report = self.run_once().await;
            if report.outcome == CycleOutcome::Cancelled {
                break;
            }
            if self.config.max_cycles.is_some_and(|max| started >= max) {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        tracing::info!("{} stopped after {} cycles", self.nanny.name(), started);
        started
    }

    /// Runs one cycle. Never fails: errors become metrics, log lines and the
    /// cycle outcome.
    pub async fn run_once(&mut self) -> CycleReport {
        self.cycle += 1;
        let mut ctx = IterationContext::new(self.cycle, Utc::now(), self.config.dry_run);
        let mut report = self.cycle_inner(&mut ctx).await;
        report.dry_run = ctx.dry_run();
        report.forced_reasons = ctx.forced_reasons().to_vec();

        match &report.outcome {
            CycleOutcome::Completed => self.metrics.cycles.inc(),
            CycleOutcome::Failed(_) => self.metrics.cycle_failures.inc(),
            CycleOutcome::Cancelled => {}
        }
        self.status.send_replace(Some(CycleStatus {
            nanny: self.nanny.name().to_string(),
            cycle: report.cycle,
            outcome: report.outcome.clone(),
            forced_dry_run: ctx.is_forced(),
            finished_at: Utc::now(),
        }));
        report
    }

    async fn cycle_inner(&mut self, ctx: &mut IterationContext) -> CycleReport {
        let mut report = CycleReport::new(ctx);

        let observation = match self.nanny.observe(ctx).await {
            Ok(o) => o,
            Err(e) => {
                self.record_failure(&e);
                tracing::warn!("cycle {} skipped: {}", ctx.cycle, e);
                report.outcome = CycleOutcome::Failed(e.to_string());
                return report;
            }
        };

        for upstream in &observation.unavailable {
            self.metrics
                .upstream_unavailable
                .with_label_values(&[upstream])
                .inc();
        }
        for anomaly in &observation.anomalies {
            tracing::warn!("structural anomaly on {}: {}", anomaly.entity, anomaly.reason);
            ctx.force_dry_run(format!("{}: {}", anomaly.entity, anomaly.reason));
        }
        for check in observation.manual {
            self.publish(check);
        }

        if self.cancel.is_cancelled() {
            report.outcome = CycleOutcome::Cancelled;
            return report;
        }

        report.faults_seen = observation.faults.len();
        for fault in &observation.faults {
            self.metrics
                .faults_seen
                .with_label_values(&[&fault.kind.name()])
                .inc();
        }
        let sifted = self.filter.observe(observation.faults);
        self.metrics.pending_faults.set(sifted.pending.len() as i64);
        report.pending = sifted.pending.len();
        for (fault, count) in &sifted.pending {
            let line = format!(
                "plan: {} {} ({}/{}): {}",
                fault.kind,
                fault.entity,
                count,
                self.filter.threshold(),
                fault.reason
            );
            tracing::info!("{}", line);
            report.plan_lines.push(line);
        }

        report.candidates = sifted.candidates.len();
        for fault in &sifted.candidates {
            let kind = fault.kind.name();
            self.metrics.candidates_promoted.with_label_values(&[&kind]).inc();
            if !fault.is_repairable() {
                self.publish(ManualCheck::new(kind, fault.entity.as_str(), &fault.reason));
            }
        }

        let mut candidates = sifted.candidates;
        candidates.extend(observation.proposals);
        let plan = self.planner.plan(&candidates);
        for kind in self.tripped.iter().chain(&plan.within_cap) {
            self.metrics
                .category_cap_tripped
                .with_label_values(&[&kind.name()])
                .set(0);
        }
        self.tripped.clear();
        for (kind, _) in &plan.tripped {
            self.metrics
                .category_cap_tripped
                .with_label_values(&[&kind.name()])
                .set(1);
            self.tripped.insert(*kind);
            report.tripped.push(*kind);
        }

        if self.cancel.is_cancelled() {
            report.outcome = CycleOutcome::Cancelled;
            return report;
        }

        let dry_run = ctx.dry_run();
        if ctx.is_forced() {
            self.metrics.dry_run_forced_cycles.inc();
            tracing::warn!(
                "cycle {} forced into dry-run by {} anomalies",
                ctx.cycle,
                ctx.forced_reasons().len()
            );
        }
        report.execution = self.executor.execute(&plan, dry_run).await;
        for (kind, entity) in &report.execution.applied {
            self.filter.forget(entity, *kind);
        }
        report
    }

    fn record_failure(&self, e: &NannyError) {
        match e {
            NannyError::Unavailable { upstream, .. } | NannyError::EmptyInventory { upstream } => {
                self.metrics
                    .upstream_unavailable
                    .with_label_values(&[upstream])
                    .inc();
            }
            _ => {}
        }
    }

    fn publish(&self, check: ManualCheck) {
        self.metrics
            .manual_checks
            .with_label_values(&[&check.kind])
            .inc();
        if let Err(e) = self.events.publish(check) {
            tracing::debug!("manual check not delivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::EntityKey;
    use crate::model::{AttachStatus, VolumeId, VolumeStatus};
    use crate::repair::{DatabaseRepair, NewAttachment, RepairAction, StorageRepair};
    use crate::tables::{RowKey, TableSpec};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Scripted {
        cycles: Mutex<VecDeque<Result<Observation>>>,
    }

    impl Scripted {
        fn new(cycles: Vec<Result<Observation>>) -> Self {
            Self {
                cycles: Mutex::new(cycles.into()),
            }
        }
    }

    #[async_trait]
    impl Nanny for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn observe(&self, _ctx: &mut IterationContext) -> Result<Observation> {
            self.cycles
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Observation::default()))
        }
    }

    #[derive(Default)]
    struct Statuses {
        calls: Mutex<Vec<VolumeId>>,
    }

    #[async_trait]
    impl DatabaseRepair for Statuses {
        async fn soft_delete(&self, _table: &TableSpec, _key: &RowKey) -> Result<()> {
            Ok(())
        }
        async fn fill_deleted_at(&self, _table: &TableSpec, _key: &RowKey) -> Result<()> {
            Ok(())
        }
        async fn undelete(&self, _table: &TableSpec, _key: &RowKey) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl StorageRepair for Statuses {
        async fn set_volume_status(
            &self,
            volume: &VolumeId,
            _status: VolumeStatus,
            _attach_status: AttachStatus,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(*volume);
            Ok(())
        }
        async fn insert_attachment(&self, _row: &NewAttachment) -> Result<()> {
            Ok(())
        }
    }

    fn mismatch(volume: VolumeId) -> Fault {
        Fault::repair(
            FaultKind::S2StateUsageMismatch,
            EntityKey::volume(&volume),
            "in-use without attachments",
            vec![RepairAction::SetVolumeStatus {
                volume,
                status: VolumeStatus::Available,
                attach_status: AttachStatus::Detached,
            }],
        )
    }

    fn observation(faults: Vec<Fault>) -> Result<Observation> {
        Ok(Observation {
            faults,
            ..Default::default()
        })
    }

    fn driver(
        script: Vec<Result<Observation>>,
        config: DriverConfig,
    ) -> (LoopDriver, Arc<Statuses>, Arc<NannyMetrics>) {
        let storage = Arc::new(Statuses::default());
        let metrics = Arc::new(NannyMetrics::new("test").unwrap());
        let repairers = Repairers {
            storage: Some(storage.clone()),
            ..Default::default()
        };
        let driver = LoopDriver::new(
            Box::new(Scripted::new(script)),
            repairers,
            metrics.clone(),
            config,
        );
        (driver, storage, metrics)
    }

    #[tokio::test]
    async fn test_fault_repaired_on_nth_cycle() {
        let volume = Uuid::new_v4();
        let script = (0..3).map(|_| observation(vec![mismatch(volume)])).collect();
        let (mut driver, storage, _) = driver(
            script,
            DriverConfig {
                iterations: 3,
                ..Default::default()
            },
        );
        let first = driver.run_once().await;
        assert_eq!(first.pending, 1);
        assert!(first.plan_lines[0].starts_with("plan: S2_STATE_USAGE_MISMATCH"));
        driver.run_once().await;
        assert!(storage.calls.lock().unwrap().is_empty());
        let third = driver.run_once().await;
        assert_eq!(third.candidates, 1);
        assert_eq!(third.execution.executed, 1);
        assert_eq!(*storage.calls.lock().unwrap(), vec![volume]);
        assert_eq!(driver.persistence().tracked(), 0);
    }

    #[tokio::test]
    async fn test_gap_resets_counter() {
        let volume = Uuid::new_v4();
        let script = vec![
            observation(vec![mismatch(volume)]),
            observation(vec![]),
            observation(vec![mismatch(volume)]),
        ];
        let (mut driver, storage, _) = driver(
            script,
            DriverConfig {
                iterations: 2,
                ..Default::default()
            },
        );
        for _ in 0..3 {
            driver.run_once().await;
        }
        assert!(storage.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_anomaly_forces_dry_run_for_one_cycle() {
        let volume = Uuid::new_v4();
        let script = vec![
            Ok(Observation {
                faults: vec![mismatch(volume)],
                anomalies: vec![Anomaly::new("vm-1", "disk without identity")],
                ..Default::default()
            }),
            observation(vec![mismatch(volume)]),
        ];
        let (mut driver, storage, metrics) = driver(
            script,
            DriverConfig {
                iterations: 1,
                ..Default::default()
            },
        );
        let forced = driver.run_once().await;
        assert!(forced.dry_run);
        assert_eq!(forced.execution.lines_with_prefix("dry-run:"), 1);
        assert_eq!(forced.execution.lines_with_prefix("action:"), 0);
        assert_eq!(metrics.dry_run_forced_cycles.get(), 1);
        assert!(storage.calls.lock().unwrap().is_empty());

        let next = driver.run_once().await;
        assert!(!next.dry_run);
        assert_eq!(next.execution.lines_with_prefix("action:"), 1);
    }

    #[tokio::test]
    async fn test_cap_tripped_blocks_kind() {
        let faults: Vec<Fault> = (0..3).map(|_| mismatch(Uuid::new_v4())).collect();
        let (mut driver, storage, metrics) = driver(
            vec![observation(faults)],
            DriverConfig {
                iterations: 1,
                caps: CapPolicy::new(2),
                ..Default::default()
            },
        );
        let report = driver.run_once().await;
        assert_eq!(report.tripped, vec![FaultKind::S2StateUsageMismatch]);
        assert!(storage.calls.lock().unwrap().is_empty());
        assert_eq!(
            metrics
                .category_cap_tripped
                .with_label_values(&["S2_STATE_USAGE_MISMATCH"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_cap_gauge_lowered_when_kind_disappears() {
        let faults: Vec<Fault> = (0..3).map(|_| mismatch(Uuid::new_v4())).collect();
        let (mut driver, _, metrics) = driver(
            vec![observation(faults), observation(vec![])],
            DriverConfig {
                iterations: 1,
                caps: CapPolicy::new(2),
                ..Default::default()
            },
        );
        let gauge = metrics
            .category_cap_tripped
            .with_label_values(&["S2_STATE_USAGE_MISMATCH"]);
        driver.run_once().await;
        assert_eq!(gauge.get(), 1);
        let quiet = driver.run_once().await;
        assert!(quiet.tripped.is_empty());
        assert_eq!(gauge.get(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_upstream_fails_cycle() {
        let (mut driver, _, metrics) = driver(
            vec![Err(NannyError::unavailable("compute-db", "timeout"))],
            DriverConfig::default(),
        );
        let mut status = driver.status();
        let report = driver.run_once().await;
        assert!(matches!(report.outcome, CycleOutcome::Failed(_)));
        assert_eq!(metrics.cycle_failures.get(), 1);
        assert_eq!(
            metrics
                .upstream_unavailable
                .with_label_values(&["compute-db"])
                .get(),
            1
        );
        assert!(status.has_changed().unwrap());
        assert_eq!(status.borrow_and_update().as_ref().unwrap().cycle, 1);
    }

    #[tokio::test]
    async fn test_report_candidate_publishes_manual_check() {
        let fault = Fault::report(
            FaultKind::A4BothAttachedVmgrMissing,
            EntityKey::volume(&Uuid::new_v4()),
            "no disk",
        );
        let (mut driver, _, metrics) = driver(
            vec![observation(vec![fault])],
            DriverConfig {
                iterations: 1,
                ..Default::default()
            },
        );
        let mut rx = driver.events().subscribe();
        driver.run_once().await;
        let check = rx.recv().await.unwrap();
        assert_eq!(check.kind, "A4_BOTH_CPs_ATTACHED_VMGR_MISSING");
        assert_eq!(
            metrics
                .manual_checks
                .with_label_values(&["A4_BOTH_CPs_ATTACHED_VMGR_MISSING"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let (mut driver, _, _) = driver(
            vec![],
            DriverConfig {
                interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        let token = driver.cancel_token();
        let handle = tokio::spawn(async move { driver.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let cycles = handle.await.unwrap();
        assert_eq!(cycles, 1);
    }

    #[tokio::test]
    async fn test_max_cycles() {
        let (mut driver, _, metrics) = driver(
            vec![],
            DriverConfig {
                interval: Duration::from_millis(1),
                max_cycles: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(driver.run().await, 3);
        assert_eq!(metrics.cycles.get(), 3);
    }
}
