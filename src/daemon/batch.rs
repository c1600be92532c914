use super::errors::{Result, SyncError};
use super::git_ops::{PushOutcome, WorkingCopy};
use super::repo_config::RepoEntry;
use log::{error, info};
use std::fmt;

/// Tally of one batch run over the registry.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Push only: entries whose working tree was clean
    pub skipped: usize,
    pub failures: Vec<(String, SyncError)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "succeeded {}, failed {}, skipped {}",
            self.succeeded, self.failed, self.skipped
        )?;
        for (name, error) in &self.failures {
            write!(f, "\n  x {name}: {error}")?;
        }
        Ok(())
    }
}

/// Pull every entry in stored order. A failing entry is counted and the run continues.
pub fn pull_all(entries: &[RepoEntry]) -> BatchReport {
    run(entries, "pull", |wc| {
        wc.pull()?;
        Ok(true)
    })
}

/// Commit and push every entry in stored order. Clean entries are skipped.
pub fn push_all(entries: &[RepoEntry], message: &str) -> BatchReport {
    run(entries, "push", |wc| {
        Ok(wc.push(message)? != PushOutcome::NothingToCommit)
    })
}

// `exec` returns false when the entry had nothing to do
fn run(entries: &[RepoEntry], op: &str, mut exec: impl FnMut(&WorkingCopy) -> Result<bool>) -> BatchReport {
    info!("=== {op} all repositories ({} total) ===", entries.len());
    let mut report = BatchReport::default();

    for entry in entries {
        info!("{op}: {} ({})", entry.name, entry.path.display());

        // each entry gets its own handle, the active one is never touched
        let res = WorkingCopy::open(&entry.path).and_then(|wc| exec(&wc));
        match res {
            Ok(true) => {
                info!("  √ {}", entry.name);
                report.succeeded += 1;
            }
            Ok(false) => {
                info!("  o {} skipped, nothing to commit", entry.name);
                report.skipped += 1;
            }
            Err(e) => {
                error!("  x {} - {e}", entry.name);
                report.failed += 1;
                report.failures.push((entry.name.clone(), e));
            }
        }
    }

    info!("=== {op} finished: {report} ===");
    report
}
