use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::WatcherConfig;
use crate::error::{Result, SyncError};
use crate::link::{same_dir, LinkRecord};

/// A directory holding a valid link record
#[derive(Debug, Clone)]
pub struct DiscoveredProject {
    pub dir: PathBuf,
    pub record: LinkRecord,
}

/// Something that went wrong for one directory during a walk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanIssue {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Discovery {
    /// Sorted by directory path
    pub found: Vec<DiscoveredProject>,
    pub issues: Vec<ScanIssue>,
    /// Directories that could not be read; projects beneath them are unknown this pass
    pub unreadable: Vec<PathBuf>,
    /// Valid records bound to a different installation root
    pub foreign: usize,
}

impl Discovery {
    /// Whether `path` sits under a directory that failed to read this pass
    pub fn is_obscured(&self, path: &Path) -> bool {
        self.unreadable.iter().any(|dir| path.starts_with(dir))
    }
}

/// Bounded-depth polling walk for link records
pub struct Discoverer {
    link_file: String,
    max_depth: usize,
    ignore: GlobSet,
    global_dir: Option<PathBuf>,
}

pub fn compile_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::config(format!("invalid glob set: {}", e)))
}

/// Canonical form of a scan root, even when it no longer resolves.
///
/// Registry paths are canonical, so a root that is a dangling symlink or a
/// relative path must be mapped the same way before its failures can shield
/// the projects beneath it.
pub fn resolve_root(root: &Path) -> PathBuf {
    resolve_with_depth(root, 0)
}

fn resolve_with_depth(root: &Path, depth: usize) -> PathBuf {
    if let Ok(canonical) = root.canonicalize() {
        return canonical;
    }
    let absolute = if root.is_absolute() {
        root.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(root),
            Err(_) => return root.to_path_buf(),
        }
    };

    let is_link = absolute
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_link && depth < 8 {
        if let Ok(target) = std::fs::read_link(&absolute) {
            let target = match absolute.parent() {
                Some(parent) if target.is_relative() => parent.join(target),
                _ => target,
            };
            return resolve_with_depth(&target, depth + 1);
        }
    }

    // Canonicalise the deepest existing ancestor and keep the rest as written.
    let mut missing = Vec::new();
    let mut cursor = absolute.as_path();
    while let Some(parent) = cursor.parent() {
        if let Some(name) = cursor.file_name() {
            missing.push(name.to_os_string());
        }
        if let Ok(base) = parent.canonicalize() {
            return missing.iter().rev().fold(base, |acc, part| acc.join(part));
        }
        cursor = parent;
    }
    absolute
}

impl Discoverer {
    pub fn new(config: &WatcherConfig, global_dir: Option<&Path>) -> Result<Self> {
        if config.link_file.trim().is_empty() {
            return Err(SyncError::config("watcher.link_file is empty"));
        }
        Ok(Self {
            link_file: config.link_file.clone(),
            max_depth: config.max_depth,
            ignore: compile_globset(&config.ignore)?,
            global_dir: global_dir.map(Path::to_path_buf),
        })
    }

    fn is_ignored(&self, root: &Path, path: &Path) -> bool {
        if let Some(name) = path.file_name() {
            if self.ignore.is_match(Path::new(name)) {
                return true;
            }
        }
        path.strip_prefix(root)
            .map(|rel| self.ignore.is_match(rel))
            .unwrap_or(false)
    }

    /// Walk every root and collect link records. Never fails as a whole:
    /// per-directory problems are reported in [`Discovery::issues`].
    pub fn discover(&self, roots: &[PathBuf]) -> Discovery {
        let mut discovery = Discovery::default();

        for root in roots {
            let root = &resolve_root(root);
            let walker = WalkDir::new(root)
                .max_depth(self.max_depth)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| {
                    e.depth() == 0 || !(e.file_type().is_dir() && self.is_ignored(root, e.path()))
                });

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().unwrap_or(root).to_path_buf();
                        warn!(path = %path.display(), error = %e, "directory read failed");
                        discovery.issues.push(ScanIssue {
                            path: path.clone(),
                            message: e.to_string(),
                        });
                        discovery.unreadable.push(path);
                        continue;
                    }
                };
                if !entry.file_type().is_dir() {
                    continue;
                }
                self.inspect_dir(entry.path(), &mut discovery);
            }
        }

        discovery.found.sort_by(|a, b| a.dir.cmp(&b.dir));
        // Overlapping roots can reach the same directory twice.
        discovery.found.dedup_by(|a, b| a.dir == b.dir);
        discovery
    }

    fn inspect_dir(&self, dir: &Path, discovery: &mut Discovery) {
        let link_path = dir.join(&self.link_file);
        if !link_path.is_file() {
            return;
        }

        match LinkRecord::load(dir, &self.link_file) {
            Ok(record) => {
                if let Some(global) = &self.global_dir {
                    if !same_dir(&record.global_dir, global) {
                        debug!(
                            dir = %dir.display(),
                            global_dir = %record.global_dir.display(),
                            "link record belongs to another installation"
                        );
                        discovery.foreign += 1;
                        return;
                    }
                }
                let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
                debug!(project = %record.project_name, dir = %dir.display(), "link record found");
                discovery.found.push(DiscoveredProject { dir, record });
            }
            Err(e) => {
                warn!(path = %link_path.display(), error = %e, "skipping malformed link record");
                discovery.issues.push(ScanIssue {
                    path: link_path,
                    message: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn link(dir: &Path, global: &Path, name: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join(".openmemory"),
            format!(
                "GLOBAL_DIR={}\nPROJECT_NAME={}\nOPENMEMORY_URL=http://localhost:8080\n",
                global.display(),
                name
            ),
        )
        .unwrap();
    }

    fn discoverer(global: &Path) -> Discoverer {
        Discoverer::new(&WatcherConfig::default(), Some(global)).unwrap()
    }

    #[test]
    fn test_finds_records_sorted_by_path() {
        let global = tempdir().unwrap();
        let root = tempdir().unwrap();
        link(&root.path().join("zeta"), global.path(), "zeta");
        link(&root.path().join("alpha/service"), global.path(), "alpha-service");

        let found = discoverer(global.path()).discover(&[root.path().to_path_buf()]);
        let names: Vec<_> = found.found.iter().map(|p| p.record.project_name.as_str()).collect();
        assert_eq!(names, vec!["alpha-service", "zeta"]);
        assert!(found.issues.is_empty());
    }

    #[test]
    fn test_skips_ignored_directories() {
        let global = tempdir().unwrap();
        let root = tempdir().unwrap();
        link(&root.path().join("app"), global.path(), "app");
        link(&root.path().join("app/node_modules/dep"), global.path(), "dep");

        let found = discoverer(global.path()).discover(&[root.path().to_path_buf()]);
        assert_eq!(found.found.len(), 1);
        assert_eq!(found.found[0].record.project_name, "app");
    }

    #[test]
    fn test_respects_max_depth() {
        let global = tempdir().unwrap();
        let root = tempdir().unwrap();
        link(&root.path().join("a/b/c"), global.path(), "deep");

        let config = WatcherConfig {
            max_depth: 2,
            ..WatcherConfig::default()
        };
        let shallow = Discoverer::new(&config, Some(global.path())).unwrap();
        assert!(shallow.discover(&[root.path().to_path_buf()]).found.is_empty());
        assert_eq!(
            discoverer(global.path()).discover(&[root.path().to_path_buf()]).found.len(),
            1
        );
    }

    #[test]
    fn test_malformed_record_is_reported_not_fatal() {
        let global = tempdir().unwrap();
        let root = tempdir().unwrap();
        link(&root.path().join("good"), global.path(), "good");
        let bad = root.path().join("bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(".openmemory"), "PROJECT_NAME=\n").unwrap();

        let found = discoverer(global.path()).discover(&[root.path().to_path_buf()]);
        assert_eq!(found.found.len(), 1);
        assert_eq!(found.issues.len(), 1);
        assert!(found.issues[0].path.ends_with("bad/.openmemory"));
    }

    #[test]
    fn test_foreign_installation_skipped() {
        let global = tempdir().unwrap();
        let other = tempdir().unwrap();
        let root = tempdir().unwrap();
        link(&root.path().join("mine"), global.path(), "mine");
        link(&root.path().join("theirs"), other.path(), "theirs");

        let found = discoverer(global.path()).discover(&[root.path().to_path_buf()]);
        assert_eq!(found.found.len(), 1);
        assert_eq!(found.foreign, 1);
    }

    #[test]
    fn test_missing_root_reported_as_issue() {
        let global = tempdir().unwrap();
        let missing = global.path().join("no-such-root");
        let found = discoverer(global.path()).discover(&[missing.clone()]);
        assert!(found.found.is_empty());
        assert_eq!(found.issues.len(), 1);
        let canonical = global.path().canonicalize().unwrap().join("no-such-root");
        assert!(found.is_obscured(&canonical.join("project")));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_root_obscures_canonical_paths() {
        let global = tempdir().unwrap();
        let base = tempdir().unwrap();
        let real = base.path().join("real");
        let alias = base.path().join("alias");
        link(&real.join("app"), global.path(), "app");
        std::os::unix::fs::symlink(&real, &alias).unwrap();

        let found = discoverer(global.path()).discover(&[alias.clone()]);
        assert_eq!(found.found.len(), 1);
        let registered = found.found[0].dir.clone();
        assert_eq!(registered, real.canonicalize().unwrap().join("app"));

        fs::rename(&real, base.path().join("moved")).unwrap();
        let found = discoverer(global.path()).discover(&[alias]);
        assert!(found.found.is_empty());
        assert!(found.is_obscured(&registered));
    }

    #[test]
    fn test_resolve_root_keeps_missing_tail() {
        let base = tempdir().unwrap();
        let canonical = base.path().canonicalize().unwrap();
        assert_eq!(resolve_root(base.path()), canonical);
        assert_eq!(
            resolve_root(&base.path().join("gone/deeper")),
            canonical.join("gone/deeper")
        );
    }

    #[test]
    fn test_overlapping_roots_deduplicated() {
        let global = tempdir().unwrap();
        let root = tempdir().unwrap();
        link(&root.path().join("nested/app"), global.path(), "app");

        let found = discoverer(global.path()).discover(&[
            root.path().to_path_buf(),
            root.path().join("nested"),
        ]);
        assert_eq!(found.found.len(), 1);
    }

    #[test]
    fn test_invalid_ignore_glob_is_configuration_error() {
        let config = WatcherConfig {
            ignore: vec!["[".to_string()],
            ..WatcherConfig::default()
        };
        assert!(matches!(
            Discoverer::new(&config, None),
            Err(SyncError::Configuration(_))
        ));
    }
}
