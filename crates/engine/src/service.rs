//! Periodic maintenance over every active job instance.
//!
//! A background thread sweeps the active instances every `poll_interval`.
//! Within a sweep up to `max_concurrent_instances` scoped threads pull
//! instance ids from a shared cursor, so one slow instance does not hold up
//! the others. A failing pass is logged and counted; it does not stop the
//! sweep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use batchgate_core::JobInstanceId;
use batchgate_events::{ChunkReadyEvent, NotificationBus};

use crate::config::MaintenanceConfig;
use crate::error::{EngineError, EngineResult};
use crate::maintenance::{MaintenanceReport, MaintenanceRunner};
use crate::store::ChunkStore;

/// Totals of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub instances: usize,
    pub passes_failed: usize,
    pub skipped: usize,
    pub promoted: usize,
    pub requeued: usize,
    pub enqueued: usize,
    pub completed_instances: usize,
}

impl SweepSummary {
    fn absorb(&mut self, report: &MaintenanceReport) {
        if report.skipped {
            self.skipped += 1;
            return;
        }
        self.promoted += report.promoted;
        self.requeued += report.requeued;
        self.enqueued += report.enqueued;
        if !report.instance_status.is_active() {
            self.completed_instances += 1;
        }
    }
}

/// Service runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceStats {
    pub sweeps: u64,
    pub passes: u64,
    pub passes_failed: u64,
    pub promoted: u64,
    pub requeued: u64,
    pub enqueued: u64,
    pub last_sweep_instances: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running maintenance service.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<MaintenanceStats>>,
}

impl MaintenanceHandle {
    /// Request shutdown and wait for the current sweep to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> MaintenanceStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct MaintenanceService<S, B> {
    runner: Arc<MaintenanceRunner<S, B>>,
    config: MaintenanceConfig,
}

impl<S, B> MaintenanceService<S, B>
where
    S: ChunkStore + Clone + 'static,
    B: NotificationBus<ChunkReadyEvent> + 'static,
{
    pub fn new(runner: Arc<MaintenanceRunner<S, B>>, config: MaintenanceConfig) -> Self {
        Self { runner, config }
    }

    /// One sweep over all active instances.
    pub fn run_once(&self) -> EngineResult<SweepSummary> {
        let ids = self.runner.store().list_active_instances()?;
        let workers = self.config.max_concurrent_instances.clamp(1, ids.len().max(1));
        let next = AtomicUsize::new(0);
        let summary = Mutex::new(SweepSummary {
            instances: ids.len(),
            ..SweepSummary::default()
        });

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let idx = next.fetch_add(1, Ordering::Relaxed);
                        let Some(&id) = ids.get(idx) else { break };
                        let outcome = self.run_instance(id);
                        if let Ok(mut summary) = summary.lock() {
                            match outcome {
                                Some(report) => summary.absorb(&report),
                                None => summary.passes_failed += 1,
                            }
                        }
                    }
                });
            }
        });

        summary
            .into_inner()
            .map_err(|_| EngineError::LockPoisoned("sweep summary"))
    }

    fn run_instance(&self, id: JobInstanceId) -> Option<MaintenanceReport> {
        match self.runner.run_maintenance_pass(id) {
            Ok(report) => Some(report),
            Err(err) => {
                error!(
                    service = %self.config.name,
                    job_instance_id = %id,
                    structural = err.is_structural(),
                    error = %err,
                    "maintenance pass failed"
                );
                None
            }
        }
    }

    /// Spawn the service in a background thread.
    pub fn spawn(self) -> EngineResult<MaintenanceHandle>
    where
        S: Send + Sync,
        B: Send + Sync,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(MaintenanceStats::default()));
        let stats_clone = stats.clone();

        let name = self.config.name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || service_loop(self, shutdown_rx, stats_clone))
            .map_err(|e| EngineError::Spawn(format!("{name}: {e}")))?;

        Ok(MaintenanceHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn service_loop<S, B>(
    service: MaintenanceService<S, B>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<MaintenanceStats>>,
) where
    S: ChunkStore + Clone + 'static,
    B: NotificationBus<ChunkReadyEvent> + 'static,
{
    let name = service.config.name.clone();
    info!(service = %name, "maintenance service started");
    let start_time = Instant::now();

    loop {
        match service.run_once() {
            Ok(summary) => {
                debug!(
                    service = %name,
                    instances = summary.instances,
                    promoted = summary.promoted,
                    enqueued = summary.enqueued,
                    "maintenance sweep finished"
                );
                if let Ok(mut s) = stats.lock() {
                    s.sweeps += 1;
                    s.passes += (summary.instances - summary.skipped) as u64;
                    s.passes_failed += summary.passes_failed as u64;
                    s.promoted += summary.promoted as u64;
                    s.requeued += summary.requeued as u64;
                    s.enqueued += summary.enqueued as u64;
                    s.last_sweep_instances = summary.instances;
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
            }
            Err(e) => {
                error!(service = %name, error = %e, "failed to list active instances");
            }
        }

        match shutdown_rx.recv_timeout(service.config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(service = %name, "maintenance service stopped");
}
