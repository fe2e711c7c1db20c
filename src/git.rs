use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{Result, SyncError};

fn run_git(dir: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| SyncError::config(format!("failed to run git: {}", e)))?;
    if !output.status.success() {
        return Err(SyncError::config(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

/// Paths staged for commit (added, copied, modified, renamed), relative to the repo root
pub fn staged_files(dir: &Path) -> Result<Vec<String>> {
    let out = run_git(
        dir,
        &["diff", "--cached", "--name-only", "-z", "--diff-filter=ACMR"],
    )?;
    let files = split_nul(&out);
    debug!(count = files.len(), "staged files");
    Ok(files)
}

/// Top level of the working tree containing `dir`
pub fn repo_root(dir: &Path) -> Result<PathBuf> {
    let out = run_git(dir, &["rev-parse", "--show-toplevel"])?;
    Ok(PathBuf::from(String::from_utf8_lossy(&out).trim()))
}

fn split_nul(out: &[u8]) -> Vec<String> {
    out.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}
