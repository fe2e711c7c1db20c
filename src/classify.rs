use globset::GlobSet;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::ValidatorConfig;
use crate::discovery::compile_globset;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Source,
    Generated,
    Documentation,
}

/// Counts of staged paths per category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub source: usize,
    pub generated: usize,
    pub documentation: usize,
}

impl ChangeSummary {
    pub fn total(&self) -> usize {
        self.source + self.generated + self.documentation
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} staged: {} source, {} generated/state, {} documentation",
            self.total(),
            self.source,
            self.generated,
            self.documentation
        )
    }
}

/// Compiled pattern sets for staged-path policy
pub struct StagedClassifier {
    docs: GlobSet,
    generated: GlobSet,
    triggers: GlobSet,
    state_files: Vec<String>,
}

/// Git reports forward slashes; normalise whatever the caller passed.
fn normalize(path: &str) -> String {
    path.trim().trim_start_matches("./").replace('\\', "/")
}

impl StagedClassifier {
    pub fn new(config: &ValidatorConfig) -> Result<Self> {
        Ok(Self {
            docs: compile_globset(&config.doc_patterns)?,
            generated: compile_globset(&config.generated_patterns)?,
            triggers: compile_globset(&config.trigger_patterns)?,
            state_files: config.state_files.iter().map(|s| normalize(s)).collect(),
        })
    }

    pub fn category(&self, path: &str) -> FileCategory {
        let path = normalize(path);
        let path = Path::new(&path);
        if self.docs.is_match(path) {
            FileCategory::Documentation
        } else if self.generated.is_match(path) {
            FileCategory::Generated
        } else {
            FileCategory::Source
        }
    }

    pub fn summarize(&self, staged: &[String]) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for path in staged {
            match self.category(path) {
                FileCategory::Source => summary.source += 1,
                FileCategory::Generated => summary.generated += 1,
                FileCategory::Documentation => summary.documentation += 1,
            }
        }
        summary
    }

    pub fn is_state_file(&self, path: &str) -> bool {
        let path = normalize(path);
        self.state_files.iter().any(|s| *s == path)
    }

    /// Staged paths that demand a state file update, state files themselves excluded
    pub fn triggering<'a>(&self, staged: &'a [String]) -> Vec<&'a str> {
        staged
            .iter()
            .filter(|p| !self.is_state_file(p))
            .filter(|p| self.triggers.is_match(Path::new(&normalize(p))))
            .map(|p| p.as_str())
            .collect()
    }

    pub fn includes_state_file(&self, staged: &[String]) -> bool {
        staged.iter().any(|p| self.is_state_file(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> StagedClassifier {
        StagedClassifier::new(&ValidatorConfig::default()).unwrap()
    }

    fn staged(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_categories() {
        let c = classifier();
        assert_eq!(c.category("src/a.py"), FileCategory::Source);
        assert_eq!(c.category("README.md"), FileCategory::Documentation);
        assert_eq!(c.category("docs/guide/setup.html"), FileCategory::Documentation);
        assert_eq!(c.category(".ai-agents/project-state.json"), FileCategory::Generated);
        assert_eq!(c.category("Cargo.lock"), FileCategory::Generated);
        // documentation wins over generated
        assert_eq!(c.category(".ai-agents/notes.md"), FileCategory::Documentation);
    }

    #[test]
    fn test_summary() {
        let c = classifier();
        let summary = c.summarize(&staged(&["src/a.py", "src/b.rs", "README.md", "yarn.lock"]));
        assert_eq!(
            summary,
            ChangeSummary {
                source: 2,
                generated: 1,
                documentation: 1
            }
        );
        assert!(summary.to_string().starts_with("4 staged"));
    }

    #[test]
    fn test_trigger_patterns() {
        let c = classifier();
        let files = staged(&["schema.py", "app/models.py", "db/migrations/0001.sql", "src/a.py"]);
        assert_eq!(
            c.triggering(&files),
            vec!["schema.py", "app/models.py", "db/migrations/0001.sql"]
        );
        assert!(c.triggering(&staged(&["src/a.py"])).is_empty());
    }

    #[test]
    fn test_state_file_detection() {
        let c = classifier();
        assert!(c.includes_state_file(&staged(&["./.ai-agents/project-state.json"])));
        assert!(!c.includes_state_file(&staged(&["src/project-state.json"])));
    }
}
