use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::discovery::Discoverer;
use crate::error::{Result, SyncError};
use crate::metrics::ScanMetrics;
use crate::reconcile::{Reconciler, ScanReport};
use crate::registry::RegistryStore;

/// Lifecycle of the scan loop. `Sleeping` and `Scanning` are the running sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Stopped,
    Starting,
    Sleeping,
    Scanning,
    Stopping,
}

impl WatcherState {
    pub fn is_running(&self) -> bool {
        matches!(self, WatcherState::Sleeping | WatcherState::Scanning)
    }
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatcherState::Stopped => "stopped",
            WatcherState::Starting => "starting",
            WatcherState::Sleeping => "running (sleeping)",
            WatcherState::Scanning => "running (scanning)",
            WatcherState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStatus {
    pub state: WatcherState,
    pub tracked_projects: usize,
    pub last_scan: Option<DateTime<Utc>>,
    pub metrics: ScanMetrics,
}

impl Default for WatcherStatus {
    fn default() -> Self {
        Self {
            state: WatcherState::Stopped,
            tracked_projects: 0,
            last_scan: None,
            metrics: ScanMetrics::new(),
        }
    }
}

/// One synchronous discovery + reconciliation pass over the configured roots
pub struct ProjectScanner {
    roots: Vec<PathBuf>,
    discoverer: Discoverer,
    reconciler: Reconciler,
    store: RegistryStore,
}

impl ProjectScanner {
    pub fn new(config: &Config) -> Result<Self> {
        if config.watcher.roots.is_empty() {
            return Err(SyncError::config("no scan roots configured (watcher.roots)"));
        }
        Ok(Self {
            roots: config.watcher.roots.clone(),
            discoverer: Discoverer::new(&config.watcher, Some(&config.global_dir))?,
            reconciler: Reconciler::new(
                config.watcher.duplicate_policy,
                config.watcher.removal_after,
            ),
            store: RegistryStore::new(config.registry_path()),
        })
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn readable_roots(&self) -> Vec<&PathBuf> {
        self.roots
            .iter()
            .filter(|root| std::fs::read_dir(root).is_ok())
            .collect()
    }

    /// Walk, reconcile and persist. Refuses to run when every root is unreadable,
    /// since an empty walk would age every tracked project.
    pub fn scan_once(&self) -> Result<ScanReport> {
        let started = Instant::now();
        if self.readable_roots().is_empty() {
            return Err(SyncError::config(format!(
                "no scan root is readable: {}",
                display_roots(&self.roots)
            )));
        }

        let discovery = self.discoverer.discover(&self.roots);
        let now = Utc::now();
        let mut report = self
            .store
            .update(|registry| Ok(self.reconciler.apply(registry, &discovery, now)))?;
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            discovered = report.discovered,
            added = report.added,
            stale = report.marked_stale,
            removed = report.marked_removed,
            conflicts = report.conflicts.len(),
            tracked = report.tracked,
            duration_ms = report.duration_ms,
            "scan pass complete"
        );
        Ok(report)
    }
}

fn display_roots(roots: &[PathBuf]) -> String {
    roots
        .iter()
        .map(|r| r.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Periodic scan loop with start/stop/status control
pub struct Watcher {
    scanner: Arc<ProjectScanner>,
    interval: Duration,
    status_tx: Arc<watch::Sender<WatcherStatus>>,
    status_rx: watch::Receiver<WatcherStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    pub fn new(config: &Config) -> Result<Self> {
        let (status_tx, status_rx) = watch::channel(WatcherStatus::default());
        Ok(Self {
            scanner: Arc::new(ProjectScanner::new(config)?),
            interval: config.watcher.interval(),
            status_tx: Arc::new(status_tx),
            status_rx,
            cancel: CancellationToken::new(),
            task: None,
        })
    }

    /// Begin the scan loop. The first pass starts immediately.
    pub fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(SyncError::config("watcher already started"));
        }
        if self.scanner.readable_roots().is_empty() {
            return Err(SyncError::config(format!(
                "no scan root is readable: {}",
                display_roots(&self.scanner.roots)
            )));
        }

        let tracked = match self.scanner.store().load() {
            Ok(registry) => registry.tracked_count(),
            Err(e) => {
                warn!(error = %e, "could not read registry, starting from empty count");
                0
            }
        };
        self.status_tx.send_modify(|s| {
            s.state = WatcherState::Starting;
            s.tracked_projects = tracked;
        });

        self.cancel = CancellationToken::new();
        let scanner = Arc::clone(&self.scanner);
        let status = Arc::clone(&self.status_tx);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        self.task = Some(tokio::spawn(run_loop(scanner, interval, status, cancel)));

        info!(
            roots = self.scanner.roots.len(),
            interval_secs = self.interval.as_secs(),
            "watcher started"
        );
        Ok(())
    }

    /// Request shutdown and wait for the loop to exit. A pass in progress runs
    /// to completion, so the registry is never left half-written.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.status_tx.send_modify(|s| s.state = WatcherState::Stopping);
        self.cancel.cancel();
        if let Err(e) = task.await {
            error!(error = %e, "watcher task ended abnormally");
        }
        self.status_tx.send_modify(|s| s.state = WatcherState::Stopped);
        info!("watcher stopped");
    }

    /// Latest published status; never waits on a pass in progress
    pub fn status(&self) -> WatcherStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatcherStatus> {
        self.status_rx.clone()
    }

    /// Run one pass off the async runtime
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let scanner = Arc::clone(&self.scanner);
        tokio::task::spawn_blocking(move || scanner.scan_once())
            .await
            .map_err(|e| SyncError::config(format!("scan task failed: {}", e)))?
    }
}

async fn run_loop(
    scanner: Arc<ProjectScanner>,
    interval: Duration,
    status: Arc<watch::Sender<WatcherStatus>>,
    cancel: CancellationToken,
) {
    loop {
        status.send_if_modified(|s| {
            // stop() may already have flipped us to Stopping
            if s.state == WatcherState::Stopping {
                return false;
            }
            s.state = WatcherState::Scanning;
            true
        });

        let started = Instant::now();
        let pass = Arc::clone(&scanner);
        let outcome = tokio::task::spawn_blocking(move || pass.scan_once()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(report)) => status.send_modify(|s| {
                s.tracked_projects = report.tracked;
                s.last_scan = Some(Utc::now());
                s.metrics
                    .record_success(elapsed_ms, report.tracked, report.conflicts.len());
            }),
            Ok(Err(e)) => {
                warn!(error = %e, "scan pass failed, registry left unchanged");
                status.send_modify(|s| s.metrics.record_failure(elapsed_ms));
            }
            Err(e) => {
                error!(error = %e, "scan task panicked");
                status.send_modify(|s| s.metrics.record_failure(elapsed_ms));
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        status.send_if_modified(|s| {
            if s.state == WatcherState::Stopping {
                return false;
            }
            s.state = WatcherState::Sleeping;
            true
        });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("scan loop exited");
}
