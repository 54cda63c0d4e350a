//! Automatic compaction: one-shot scans and the periodic background loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compaction::{CompactionEvent, Compactor};
use crate::error::{Result, SubstrateError};
use crate::routing::PheromoneField;
use crate::substrate::{AllocationHandle, SharedSubstrate};
use crate::types::AgentId;

/// Shortest interval the background loop will accept
const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// A compaction that failed during a scan
#[derive(Debug, Clone, Serialize)]
pub struct CompactionFailure {
    pub target_id: AgentId,
    pub error: String,
}

/// Outcome of one pass over every allocation
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Allocations examined before the scan finished or was interrupted
    pub scanned: usize,
    pub events: Vec<CompactionEvent>,
    pub failures: Vec<CompactionFailure>,
    /// The scan stopped early because shutdown was requested
    pub interrupted: bool,
}

impl ScanReport {
    /// Total patterns removed across all events
    pub fn affected(&self) -> usize {
        self.events.iter().map(CompactionEvent::affected).sum()
    }
}

/// Compact every allocation that is under pressure
///
/// A failing allocation is recorded in the report and does not stop the scan.
pub async fn apply_pressure_based_strategy(
    substrate: &SharedSubstrate,
    compactor: &Compactor,
) -> ScanReport {
    scan(substrate, compactor, &CancellationToken::new()).await
}

async fn scan(
    substrate: &SharedSubstrate,
    compactor: &Compactor,
    cancel: &CancellationToken,
) -> ScanReport {
    scan_with(substrate, cancel, |handle| async move {
        compactor.compact_allocation(&handle).await
    })
    .await
}

/// Run `compact` over a snapshot of the shared allocations, collecting
/// events and failures
async fn scan_with<F, Fut>(
    substrate: &SharedSubstrate,
    cancel: &CancellationToken,
    mut compact: F,
) -> ScanReport
where
    F: FnMut(AllocationHandle) -> Fut,
    Fut: Future<Output = Result<Option<CompactionEvent>>>,
{
    let mut report = ScanReport::default();

    for (agent_id, handle) in substrate.allocation_handles().await {
        if cancel.is_cancelled() {
            report.interrupted = true;
            break;
        }
        report.scanned += 1;

        match compact(handle).await {
            Ok(Some(event)) => report.events.push(event),
            Ok(None) => {}
            // Promoted or released after the snapshot was taken
            Err(SubstrateError::AllocationRetired(_)) => {}
            Err(e) => {
                warn!(agent = %agent_id, error = %e, "Compaction failed");
                report.failures.push(CompactionFailure {
                    target_id: agent_id,
                    error: e.to_string(),
                });
            }
        }

        tokio::task::yield_now().await;
    }

    report
}

/// Periodically compacts pressured allocations, evaporates the pheromone
/// field and reaps expired allocations
pub struct AutoCompactionDaemon {
    substrate: Arc<SharedSubstrate>,
    field: Option<Arc<PheromoneField>>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoCompactionDaemon {
    pub fn new(substrate: Arc<SharedSubstrate>, interval: Duration) -> Self {
        Self {
            substrate,
            field: None,
            interval: interval.max(MIN_SCAN_INTERVAL),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Also evaporate `field` after every scan
    pub fn with_field(mut self, field: Arc<PheromoneField>) -> Self {
        self.field = Some(field);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Run a single scan now, honouring shutdown between allocations
    pub async fn check_once(&self) -> ScanReport {
        let compactor = self.substrate.compactor();
        scan(&self.substrate, &compactor, &self.cancel).await
    }

    /// Start the background loop. Returns false if it is already running
    /// or the daemon has been shut down.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return false;
        }

        let substrate = self.substrate.clone();
        let field = self.field.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;

        info!(interval_secs = interval.as_secs_f64(), "Starting compaction daemon");

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Compaction daemon: shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let compactor = substrate.compactor();
                let report = scan(&substrate, &compactor, &cancel).await;
                if report.interrupted {
                    break;
                }

                let evaporated = field.as_ref().map(|f| f.evaporate()).unwrap_or(0);
                let reaped = substrate.reap_expired().await;

                debug!(
                    scanned = report.scanned,
                    compacted = report.events.len(),
                    failed = report.failures.len(),
                    evaporated,
                    reaped = reaped.len(),
                    "Compaction daemon tick"
                );
            }
        }));

        true
    }

    /// Signal the loop to stop and wait for it to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Compaction daemon task ended abnormally");
            }
        }
        info!("Compaction daemon stopped");
    }
}

impl Drop for AutoCompactionDaemon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
