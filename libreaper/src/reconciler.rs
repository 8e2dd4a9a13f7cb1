//! The reconciliation pass.
//!
//! ```text
//! gather (iscsi, volumes, claims)  ── any failure ──▶ abort, nothing deleted
//!        │
//!        ▼
//! stale = iscsi ∖ (volumes ∪ claims)     keyed by VolumeKey
//!        │
//!        ▼
//! for record in stale (IQN, portal order):
//!     stop requested?  → remaining records reported as cancelled
//!     dry run?         → log the planned commands
//!     otherwise        → logout, delete; "not found" counts as success
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ReaperConfig;
use crate::error::{DeletionError, InventoryError};
use crate::inventory::Inventory;
use crate::inventory::iscsi::{ISCSI_ERR_NO_OBJS_FOUND, delete_node_command, logout_command};
use crate::runner::{CommandRunner, ExecContext};
use crate::types::{ClaimKey, IscsiRecord, StaleSet, VolumeKey, VolumeRecord};

/// Process exit status for a pass that completed with every deletion done.
pub const EXIT_SUCCESS: u8 = 0;
/// Some deletions failed or were not started because of cancellation.
pub const EXIT_PARTIAL: u8 = 1;
/// An inventory could not be gathered; nothing was deleted.
pub const EXIT_INVENTORY_FAILED: u8 = 2;
/// Startup configuration was rejected; nothing was gathered.
pub const EXIT_CONFIG_INVALID: u8 = 3;

/// Records whose key appears in neither the volume nor the claim inventory.
pub fn compute_stale_set(
    iscsi: impl IntoIterator<Item = IscsiRecord>,
    volumes: &[VolumeRecord],
    claims: &[ClaimKey],
) -> StaleSet {
    let backed: HashSet<&VolumeKey> = volumes
        .iter()
        .map(|v| &v.volume_key)
        .chain(claims.iter().map(|c| &c.volume_key))
        .collect();

    iscsi
        .into_iter()
        .filter(|r| !backed.contains(&r.volume_key))
        .collect()
}

/// Cooperative stop flag, set from a signal handler and checked between
/// records.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one stale record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Dry run: the delete was logged, not executed.
    Planned,
    Deleted,
    /// The record was already gone when the delete ran.
    AlreadyAbsent,
    Failed { error: DeletionError },
    /// Not started because a stop was requested.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordReport {
    pub target_iqn: String,
    pub portal: String,
    pub volume_key: VolumeKey,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

/// Sizes of the gathered inventories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventoryCounts {
    pub iscsi_records: usize,
    pub volumes: usize,
    pub live_claims: usize,
}

/// End-of-pass summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub node_name: Option<String>,
    pub dry_run: bool,
    pub inventory: InventoryCounts,
    pub stale_found: usize,
    pub planned: usize,
    pub deleted: usize,
    pub not_found: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub records: Vec<RecordReport>,
}

impl PassReport {
    fn record(&mut self, record: &IscsiRecord, outcome: RecordOutcome) {
        match &outcome {
            RecordOutcome::Planned => self.planned += 1,
            RecordOutcome::Deleted => self.deleted += 1,
            RecordOutcome::AlreadyAbsent => self.not_found += 1,
            RecordOutcome::Failed { .. } => self.failed += 1,
            RecordOutcome::Cancelled => self.cancelled += 1,
        }
        self.records.push(RecordReport {
            target_iqn: record.target_iqn.clone(),
            portal: record.portal.clone(),
            volume_key: record.volume_key.clone(),
            outcome,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeletionError> {
        self.records.iter().filter_map(|r| match &r.outcome {
            RecordOutcome::Failed { error } => Some(error),
            _ => None,
        })
    }

    /// Every stale record was deleted, already absent, or planned.
    pub fn succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        }
    }
}

/// The three inventories of one pass, gathered completely.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub iscsi: Vec<IscsiRecord>,
    pub volumes: Vec<VolumeRecord>,
    pub claims: Vec<ClaimKey>,
}

impl Snapshot {
    pub fn counts(&self) -> InventoryCounts {
        InventoryCounts {
            iscsi_records: self.iscsi.len(),
            volumes: self.volumes.len(),
            live_claims: self.claims.len(),
        }
    }

    pub fn stale_set(&self) -> StaleSet {
        compute_stale_set(self.iscsi.iter().cloned(), &self.volumes, &self.claims)
    }
}

/// Runs one bounded reconciliation pass.
pub struct Reconciler<I, V, C> {
    iscsi: I,
    volumes: V,
    claims: C,
    runner: Arc<dyn CommandRunner>,
    ctx: ExecContext,
    dry_run: bool,
    node_name: Option<String>,
    stop: StopSignal,
}

impl<I, V, C> Reconciler<I, V, C>
where
    I: Inventory<Record = IscsiRecord>,
    V: Inventory<Record = VolumeRecord>,
    C: Inventory<Record = ClaimKey>,
{
    pub fn new(
        iscsi: I,
        volumes: V,
        claims: C,
        runner: Arc<dyn CommandRunner>,
        config: &ReaperConfig,
    ) -> Self {
        Self {
            iscsi,
            volumes,
            claims,
            runner,
            ctx: config.exec_context,
            dry_run: config.dry_run,
            node_name: config.node_name.clone(),
            stop: StopSignal::new(),
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Gather all three inventories. The first failure drops the others.
    pub async fn gather(&self) -> Result<Snapshot, InventoryError> {
        let (iscsi, volumes, claims) =
            tokio::try_join!(self.iscsi.list(), self.volumes.list(), self.claims.list())?;
        Ok(Snapshot {
            iscsi,
            volumes,
            claims,
        })
    }

    /// Gather, diff, and act on the stale set.
    ///
    /// Returns `Err` only when an inventory could not be gathered, in which
    /// case no delete command was issued.
    #[instrument(skip(self), fields(dry_run = self.dry_run, ctx = %self.ctx))]
    pub async fn run(&self) -> Result<PassReport, InventoryError> {
        let snapshot = match self.gather().await {
            Ok(s) => s,
            Err(e) => {
                error!(source = %e.inventory, reason = %e.reason, "inventory failed, aborting pass");
                return Err(e);
            }
        };
        let counts = snapshot.counts();
        info!(
            iscsi_records = counts.iscsi_records,
            volumes = counts.volumes,
            live_claims = counts.live_claims,
            "inventories gathered"
        );

        let stale = snapshot.stale_set();
        let mut report = PassReport {
            node_name: self.node_name.clone(),
            dry_run: self.dry_run,
            inventory: counts,
            stale_found: stale.len(),
            ..Default::default()
        };

        if stale.is_empty() {
            info!("no stale iSCSI node records");
            return Ok(report);
        }
        warn!(count = stale.len(), "stale iSCSI node records found");

        for record in &stale {
            let outcome = if self.stop.is_stopped() {
                warn!(iqn = %record.target_iqn, portal = %record.portal, volume_key = %record.volume_key,
                    "stop requested, not deleting");
                RecordOutcome::Cancelled
            } else if self.dry_run {
                self.plan(record)
            } else {
                self.delete(record).await
            };
            report.record(record, outcome);
        }

        info!(
            stale_found = report.stale_found,
            planned = report.planned,
            deleted = report.deleted,
            not_found = report.not_found,
            failed = report.failed,
            cancelled = report.cancelled,
            "pass complete"
        );
        Ok(report)
    }

    fn plan(&self, record: &IscsiRecord) -> RecordOutcome {
        info!(
            iqn = %record.target_iqn,
            portal = %record.portal,
            volume_key = %record.volume_key,
            logout = %logout_command(record).render(),
            delete = %delete_node_command(record).render(),
            "dry run: would delete node record"
        );
        RecordOutcome::Planned
    }

    async fn delete(&self, record: &IscsiRecord) -> RecordOutcome {
        // A failed logout does not stop the delete: the record is what keeps
        // iscsid retrying the dead target.
        match self.runner.run(&self.ctx, &logout_command(record)).await {
            Ok(out) if out.code == ISCSI_ERR_NO_OBJS_FOUND => {
                debug!(iqn = %record.target_iqn, portal = %record.portal, "no active session");
            }
            Ok(_) => {
                info!(iqn = %record.target_iqn, portal = %record.portal, "logged out");
            }
            Err(e) => {
                warn!(iqn = %record.target_iqn, portal = %record.portal, error = %e,
                    "logout failed, deleting record anyway");
            }
        }

        match self.runner.run(&self.ctx, &delete_node_command(record)).await {
            Ok(out) if out.code == ISCSI_ERR_NO_OBJS_FOUND => {
                info!(iqn = %record.target_iqn, portal = %record.portal, volume_key = %record.volume_key,
                    "node record already absent");
                RecordOutcome::AlreadyAbsent
            }
            Ok(_) => {
                info!(iqn = %record.target_iqn, portal = %record.portal, volume_key = %record.volume_key,
                    "node record deleted");
                RecordOutcome::Deleted
            }
            Err(reason) => {
                let error = DeletionError {
                    target_iqn: record.target_iqn.clone(),
                    portal: record.portal.clone(),
                    volume_key: record.volume_key.to_string(),
                    reason,
                };
                error!(%error, "node record deletion failed");
                RecordOutcome::Failed { error }
            }
        }
    }
}
