use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::DuplicatePolicy;
use crate::discovery::{DiscoveredProject, Discovery, ScanIssue};
use crate::registry::{EntryStatus, Registry, RegistryEntry};

/// Two directories declared the same project name in one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameConflict {
    pub name: String,
    pub kept: PathBuf,
    pub ignored: PathBuf,
}

/// Outcome of one discovery + reconciliation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub discovered: usize,
    pub added: usize,
    pub refreshed: usize,
    pub marked_stale: usize,
    pub marked_removed: usize,
    pub foreign: usize,
    pub tracked: usize,
    pub conflicts: Vec<NameConflict>,
    pub issues: Vec<ScanIssue>,
    pub duration_ms: u64,
}

/// Reconciliation rules applied to the registry after each walk
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    pub policy: DuplicatePolicy,
    pub removal_after: u32,
}

impl Reconciler {
    pub fn new(policy: DuplicatePolicy, removal_after: u32) -> Self {
        Self {
            policy,
            removal_after: removal_after.max(1),
        }
    }

    /// Pick one directory per project name; losers become conflicts.
    fn resolve_duplicates<'a>(
        &self,
        registry: &Registry,
        found: &'a [DiscoveredProject],
    ) -> (BTreeMap<String, &'a DiscoveredProject>, Vec<NameConflict>) {
        let mut by_name: BTreeMap<String, Vec<&'a DiscoveredProject>> = BTreeMap::new();
        for project in found {
            by_name
                .entry(project.record.project_name.clone())
                .or_default()
                .push(project);
        }

        let mut winners = BTreeMap::new();
        let mut conflicts = Vec::new();
        for (name, candidates) in by_name {
            let kept_idx = match self.policy {
                DuplicatePolicy::PreferRegistered => registry
                    .projects
                    .get(&name)
                    .and_then(|entry| candidates.iter().position(|c| c.dir == entry.path))
                    .unwrap_or(0),
                DuplicatePolicy::Lexicographic => 0,
            };
            let kept = candidates[kept_idx];
            for (idx, other) in candidates.iter().enumerate() {
                if idx == kept_idx {
                    continue;
                }
                warn!(
                    project = %name,
                    kept = %kept.dir.display(),
                    ignored = %other.dir.display(),
                    "duplicate project name, keeping one directory"
                );
                conflicts.push(NameConflict {
                    name: name.clone(),
                    kept: kept.dir.clone(),
                    ignored: other.dir.clone(),
                });
            }
            winners.insert(name, kept);
        }
        (winners, conflicts)
    }

    /// Apply one pass of discoveries to the registry in place.
    pub fn apply(
        &self,
        registry: &mut Registry,
        discovery: &Discovery,
        now: DateTime<Utc>,
    ) -> ScanReport {
        let (winners, conflicts) = self.resolve_duplicates(registry, &discovery.found);
        let mut report = ScanReport {
            discovered: winners.len(),
            foreign: discovery.foreign,
            issues: discovery.issues.clone(),
            ..ScanReport::default()
        };

        for (name, project) in &winners {
            match registry.projects.get_mut(name) {
                Some(entry) => {
                    if entry.path != project.dir {
                        info!(
                            project = %name,
                            from = %entry.path.display(),
                            to = %project.dir.display(),
                            "project moved"
                        );
                        entry.path = project.dir.clone();
                    }
                    if entry.status != EntryStatus::Active {
                        info!(project = %name, previous = %entry.status, "project rediscovered");
                    }
                    entry.status = EntryStatus::Active;
                    entry.missed_passes = 0;
                    entry.updated_at = now;
                    report.refreshed += 1;
                }
                None => {
                    info!(project = %name, path = %project.dir.display(), "new project linked");
                    registry
                        .projects
                        .insert(name.clone(), RegistryEntry::new(project.dir.clone(), now));
                    report.added += 1;
                }
            }
        }

        for (name, entry) in registry.projects.iter_mut() {
            if winners.contains_key(name) || entry.status == EntryStatus::Removed {
                continue;
            }
            if discovery.is_obscured(&entry.path) {
                debug!(project = %name, "path unreadable this pass, leaving entry as is");
                continue;
            }
            entry.missed_passes += 1;
            entry.updated_at = now;
            if entry.missed_passes >= self.removal_after {
                info!(project = %name, missed = entry.missed_passes, "project removed");
                entry.status = EntryStatus::Removed;
                report.marked_removed += 1;
            } else if entry.status == EntryStatus::Active {
                info!(project = %name, "project missing, marked stale");
                entry.status = EntryStatus::Stale;
                report.marked_stale += 1;
            }
        }

        report.conflicts = conflicts;
        report.tracked = registry.tracked_count();
        report
    }
}
