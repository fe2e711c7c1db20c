//! Pre-commit validation pipeline.
//!
//! Six stages run in fixed order and each yields exactly one [`CheckResult`].
//! No stage aborts the pipeline; the aggregate stage turns failures of the
//! blocking stages (layout, reachability, state update) into the verdict.
//! Network stages share one wall-clock deadline so a hung service cannot hang
//! `git commit`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::classify::StagedClassifier;
use crate::config::{ServiceConfig, ValidatorConfig};
use crate::error::{Result, SyncError};
use crate::link::LinkRecord;
use crate::memory::{ActivityEntry, HttpMemoryClient, MemoryService};
use crate::report::{CheckResult, CheckStatus, Stage, ValidationReport};

/// Builds a service client for the endpoint named in a link record
pub type Connector =
    Box<dyn Fn(&LinkRecord) -> Result<Arc<dyn MemoryService>> + Send + Sync>;

pub struct Validator {
    config: ValidatorConfig,
    link_file: String,
    classifier: StagedClassifier,
    connect: Connector,
    bypass: bool,
}

/// Whether an environment value switches the bypass on
pub fn is_truthy(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    !v.is_empty() && !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

fn bypass_from_env(var: &str) -> bool {
    std::env::var(var).map(|v| is_truthy(&v)).unwrap_or(false)
}

impl Validator {
    /// Validator talking HTTP to the service named in each project's link record
    pub fn new(
        config: ValidatorConfig,
        link_file: impl Into<String>,
        service: ServiceConfig,
    ) -> Result<Self> {
        let connect: Connector = Box::new(move |link: &LinkRecord| {
            let client = HttpMemoryClient::new(link.service_url.clone(), &service)?;
            Ok(Arc::new(client) as Arc<dyn MemoryService>)
        });
        Self::with_connector(config, link_file, connect)
    }

    pub fn with_connector(
        config: ValidatorConfig,
        link_file: impl Into<String>,
        connect: Connector,
    ) -> Result<Self> {
        let classifier = StagedClassifier::new(&config)?;
        let bypass = bypass_from_env(&config.bypass_env);
        Ok(Self {
            config,
            link_file: link_file.into(),
            classifier,
            connect,
            bypass,
        })
    }

    /// Override the environment-derived bypass flag
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Run every stage against `project_path` and the staged paths git reported.
    ///
    /// Read-only: neither the repository nor the service is modified.
    pub async fn validate(&self, project_path: &Path, staged: &[String]) -> ValidationReport {
        let started = Instant::now();
        let deadline = started + self.config.total_timeout();
        let mut report = ValidationReport::default();

        let link = LinkRecord::load(project_path, &self.link_file);
        if let Err(e) = &link {
            debug!(project = %project_path.display(), error = %e, "link record unusable");
        }
        let link = link.as_ref();

        report.push(self.check_layout(project_path, link));

        let service = link.ok().map(|l| (self.connect)(l));
        report.push(self.check_reachability(link, service.as_ref(), deadline).await);

        report.push(self.check_staged(staged));

        let reachable = report.status_of(Stage::ServiceReachability) == Some(CheckStatus::Pass);
        report.push(
            self.check_activity(link, service.as_ref(), reachable, staged, deadline)
                .await,
        );

        report.push(self.check_state_update(staged));
        report.push(aggregate(&report));

        report.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            blocked = report.is_blocked(),
            duration_ms = report.duration_ms,
            "validation finished"
        );
        report
    }

    fn check_layout(
        &self,
        project_path: &Path,
        link: std::result::Result<&LinkRecord, &SyncError>,
    ) -> CheckResult {
        let stage = Stage::EnforcementLayout;
        if let Err(e) = link {
            return CheckResult::fail(stage, format!("link record unusable: {}", e));
        }

        let mut missing: Vec<&str> = Vec::new();
        if !project_path.join(&self.config.support_dir).is_dir() {
            missing.push(&self.config.support_dir);
        }
        for required in &self.config.required_paths {
            if !project_path.join(required).exists() {
                missing.push(required);
            }
        }

        if missing.is_empty() {
            CheckResult::pass(stage, "support structure present")
        } else {
            CheckResult::fail(stage, format!("missing: {}", missing.join(", ")))
        }
    }

    fn remaining(&self, deadline: Instant) -> Option<Duration> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            None
        } else {
            Some(left.min(self.config.stage_timeout()))
        }
    }

    async fn check_reachability(
        &self,
        link: std::result::Result<&LinkRecord, &SyncError>,
        service: Option<&Result<Arc<dyn MemoryService>>>,
        deadline: Instant,
    ) -> CheckResult {
        let stage = Stage::ServiceReachability;
        let (link, service) = match (link, service) {
            (Ok(link), Some(Ok(service))) => (link, service),
            (Ok(_), Some(Err(e))) => return self.unreachable(format!("cannot create client: {}", e)),
            _ => return CheckResult::fail(stage, "no usable link record, service endpoint unknown"),
        };

        let Some(budget) = self.remaining(deadline) else {
            return self.unreachable("validation deadline exceeded before health check".into());
        };

        match timeout(budget, service.health()).await {
            Ok(Ok(health)) => {
                let version = health
                    .version
                    .map(|v| format!(" (v{})", v))
                    .unwrap_or_default();
                CheckResult::pass(stage, format!("{} reachable{}", link.service_url, version))
            }
            Ok(Err(e)) => self.unreachable(format!("{}: {}", link.service_url, e)),
            Err(_) => self.unreachable(format!(
                "{}: health check timed out after {}ms",
                link.service_url,
                budget.as_millis()
            )),
        }
    }

    fn unreachable(&self, detail: String) -> CheckResult {
        let stage = Stage::ServiceReachability;
        if self.bypass {
            CheckResult::warn(
                stage,
                format!("{} (bypassed via {})", detail, self.config.bypass_env),
            )
        } else {
            CheckResult::fail(
                stage,
                format!(
                    "{}; start the memory service or set {}=1 to bypass",
                    detail, self.config.bypass_env
                ),
            )
        }
    }

    fn check_staged(&self, staged: &[String]) -> CheckResult {
        let stage = Stage::StagedChanges;
        if staged.is_empty() {
            return CheckResult::pass(stage, "nothing staged");
        }
        CheckResult::pass(stage, self.classifier.summarize(staged).to_string())
    }

    async fn check_activity(
        &self,
        link: std::result::Result<&LinkRecord, &SyncError>,
        service: Option<&Result<Arc<dyn MemoryService>>>,
        reachable: bool,
        staged: &[String],
        deadline: Instant,
    ) -> CheckResult {
        let stage = Stage::RecentActivity;
        if staged.is_empty() {
            return CheckResult::pass(stage, "skipped: nothing staged");
        }
        let (link, service) = match (link, service) {
            (Ok(link), Some(Ok(service))) if reachable => (link, service),
            (Ok(_), Some(Ok(_))) => return CheckResult::warn(stage, "skipped: service unreachable"),
            _ => return CheckResult::warn(stage, "skipped: no usable link record"),
        };
        let Some(budget) = self.remaining(deadline) else {
            return CheckResult::warn(stage, "skipped: validation deadline exceeded");
        };

        let hours = self.config.lookback_hours;
        let since = Utc::now() - self.config.lookback();
        match timeout(budget, service.recent_activity(&link.project_name, since)).await {
            Ok(Ok(mut entries)) => {
                if let Some(agent) = &self.config.agent_name {
                    entries.retain(|e| e.agent_name.as_deref() == Some(agent.as_str()));
                }
                summarize_activity(stage, &link.project_name, hours, &entries)
            }
            Ok(Err(e)) => CheckResult::warn(stage, format!("could not query activity: {}", e)),
            Err(_) => CheckResult::warn(
                stage,
                format!("activity query timed out after {}ms", budget.as_millis()),
            ),
        }
    }

    fn check_state_update(&self, staged: &[String]) -> CheckResult {
        let stage = Stage::StateUpdate;
        if staged.is_empty() {
            return CheckResult::pass(stage, "nothing staged");
        }
        let triggering = self.classifier.triggering(staged);
        if triggering.is_empty() {
            return CheckResult::pass(stage, "no changes requiring a state update");
        }
        if self.classifier.includes_state_file(staged) {
            return CheckResult::pass(
                stage,
                format!("state file staged alongside {} significant change(s)", triggering.len()),
            );
        }
        CheckResult::fail(
            stage,
            format!(
                "{} changed without updating a state file (stage one of: {})",
                triggering.join(", "),
                self.config.state_files.join(", ")
            ),
        )
    }
}

fn summarize_activity(
    stage: Stage,
    project: &str,
    hours: u64,
    entries: &[ActivityEntry],
) -> CheckResult {
    if entries.is_empty() {
        return CheckResult::warn(
            stage,
            format!("no agent actions recorded for '{}' in the last {}h", project, hours),
        );
    }
    let latest = entries
        .iter()
        .max_by_key(|e| e.recorded_at)
        .and_then(|e| e.agent_name.clone())
        .map(|agent| format!(", latest by {}", agent))
        .unwrap_or_default();
    CheckResult::pass(
        stage,
        format!("{} agent action(s) in the last {}h{}", entries.len(), hours, latest),
    )
}

fn aggregate(report: &ValidationReport) -> CheckResult {
    let blocking: Vec<&str> = report
        .results
        .iter()
        .filter(|r| r.status == CheckStatus::Fail && r.stage.is_blocking())
        .map(|r| r.stage.display_name())
        .collect();
    if !blocking.is_empty() {
        return CheckResult::fail(Stage::Aggregate, format!("blocked by: {}", blocking.join(", ")));
    }
    match report.warnings().count() {
        0 => CheckResult::pass(Stage::Aggregate, "all checks passed"),
        n => CheckResult::pass(Stage::Aggregate, format!("passed with {} warning(s)", n)),
    }
}
