use super::batch::{self, BatchReport};
use super::config::{Settings, SettingsStore};
use super::errors::{Result, SyncError};
use super::git_ops::{self, CommitInfo, PullOutcome, PushOutcome, StatusReport, WorkingCopy};
use super::repo_config::RepoEntry;
use super::scheduler::{JobHandler, JobKind, Schedule};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// What a Pull or Push command did: one working copy or the whole registry.
#[derive(Debug)]
pub enum SyncOutcome<T> {
    Single(T),
    Batch(BatchReport),
}

/// Owns the settings store and the handle on the active working copy.
#[derive(Debug)]
pub struct SyncManager {
    store: SettingsStore,
    working_copy: Option<WorkingCopy>,
}

impl SyncManager {
    /// Load settings from `path` and reopen the last active working copy, if any.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let mut manager = Self {
            store: SettingsStore::open(path),
            working_copy: None,
        };
        manager.reopen_active();
        manager
    }

    fn reopen_active(&mut self) {
        self.working_copy = None;

        let path = self.store.settings().repo_path.clone();
        if path.as_os_str().is_empty() {
            return;
        }

        match WorkingCopy::open(&path) {
            Ok(wc) => {
                info!("Repository: {}", path.display());
                self.working_copy = Some(wc);
            }
            Err(e) => warn!("Could not reopen last repository: {e}"),
        }
    }

    pub fn settings(&self) -> &Settings {
        self.store.settings()
    }

    pub fn settings_path(&self) -> &Path {
        self.store.path()
    }

    pub fn working_copy(&self) -> Option<&WorkingCopy> {
        self.working_copy.as_ref()
    }

    /// Re-read the settings file and follow the active path if another process moved it.
    pub fn reload(&mut self) {
        let before = self.store.settings().repo_path.clone();
        self.store.reload();

        let after = &self.store.settings().repo_path;
        let handle_matches = self
            .working_copy
            .as_ref()
            .is_some_and(|wc| wc.path() == after.as_path());
        if *after != before || (!handle_matches && !after.as_os_str().is_empty()) {
            self.reopen_active();
        }
    }

    pub fn add_repository(&mut self, path: &Path, name: Option<&str>) -> Result<RepoEntry> {
        let entry = self
            .store
            .settings_mut()
            .add_repository(path, name)?
            .clone();
        self.store.save();

        info!("Repository added: {} ({})", entry.name, entry.path.display());
        Ok(entry)
    }

    /// Remove the entry at `index` once `confirm` agrees.
    pub fn remove_repository(
        &mut self,
        index: usize,
        confirm: impl FnOnce(&RepoEntry) -> bool,
    ) -> Result<RepoEntry> {
        if !confirm(self.store.settings().repository(index)?) {
            return Err(SyncError::Cancelled);
        }

        let removed = self.store.settings_mut().remove_repository(index)?;
        if removed.was_active {
            self.working_copy = None;
        }
        self.store.save();

        info!("Repository removed: {}", removed.entry.name);
        Ok(removed.entry)
    }

    /// Make the entry at `index` active. Nothing changes if it does not open.
    pub fn select_repository(&mut self, index: usize) -> Result<RepoEntry> {
        let path = self.store.settings().repository(index)?.path.clone();
        let wc = WorkingCopy::open(&path)?;

        let entry = self.store.settings_mut().set_active(index)?.clone();
        self.working_copy = Some(wc);
        self.store.save();

        info!("Repository selected: {} ({})", entry.name, entry.path.display());
        Ok(entry)
    }

    /// Route Pull and Push to every registered entry, until another selection is made.
    pub fn select_all(&mut self) {
        self.store.settings_mut().select_all();
        self.working_copy = None;
        self.store.save();

        info!("All repositories selected ({})", self.store.settings().repositories.len());
    }

    /// Make an arbitrary working copy active, registered or not.
    /// Returns the path as stored, absolute and resolved.
    pub fn open_path(&mut self, path: &Path) -> Result<PathBuf> {
        let path = git_ops::verify_working_copy(path)?;
        let wc = WorkingCopy::open(&path)?;

        self.store.settings_mut().set_active_path(&path);
        self.working_copy = Some(wc);
        self.store.save();

        info!("Repository: {}", path.display());
        Ok(path)
    }

    pub fn is_all_selected(&self) -> bool {
        self.store.settings().all_selected
    }

    fn active(&self) -> Result<&WorkingCopy> {
        self.working_copy
            .as_ref()
            .ok_or(SyncError::NoRepositorySelected)
    }

    pub fn pull(&self) -> Result<PullOutcome> {
        let wc = self.active()?;
        info!("Pull: {}", wc.path().display());
        logged("Pull", wc.pull())
    }

    pub fn push(&self) -> Result<PushOutcome> {
        let wc = self.active()?;
        info!("Push: {}", wc.path().display());
        logged("Push", wc.push(&self.store.settings().commit_message))
    }

    /// Pull the active working copy, or every entry when ALL is selected.
    /// `confirm` is only asked for a batch.
    pub fn pull_selected(
        &self,
        confirm: impl FnOnce(&[RepoEntry]) -> bool,
    ) -> Result<SyncOutcome<PullOutcome>> {
        if self.is_all_selected() {
            return self.pull_all(confirm).map(SyncOutcome::Batch);
        }
        self.pull().map(SyncOutcome::Single)
    }

    /// Push the active working copy, or every entry when ALL is selected.
    /// `confirm` is only asked for a batch.
    pub fn push_selected(
        &self,
        confirm: impl FnOnce(&[RepoEntry]) -> bool,
    ) -> Result<SyncOutcome<PushOutcome>> {
        if self.is_all_selected() {
            return self.push_all(confirm).map(SyncOutcome::Batch);
        }
        self.push().map(SyncOutcome::Single)
    }

    pub fn pull_all(&self, confirm: impl FnOnce(&[RepoEntry]) -> bool) -> Result<BatchReport> {
        let entries = self.registered(confirm)?;
        Ok(batch::pull_all(entries))
    }

    pub fn push_all(&self, confirm: impl FnOnce(&[RepoEntry]) -> bool) -> Result<BatchReport> {
        let entries = self.registered(confirm)?;
        Ok(batch::push_all(entries, &self.store.settings().commit_message))
    }

    fn registered(&self, confirm: impl FnOnce(&[RepoEntry]) -> bool) -> Result<&[RepoEntry]> {
        let entries = &self.store.settings().repositories;
        if entries.is_empty() {
            return Err(SyncError::EmptyRegistry);
        }
        if !confirm(entries) {
            return Err(SyncError::Cancelled);
        }
        Ok(entries)
    }

    pub fn status(&self) -> Result<StatusReport> {
        self.active()?.status()
    }

    pub fn history(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        self.active()?.history(limit)
    }

    pub fn set_commit_message(&mut self, message: &str) {
        self.store.settings_mut().commit_message = message.to_string();
        self.store.save();
        info!("Commit message set to '{message}'");
    }

    /// Store new deadlines. Both must parse or nothing is stored.
    pub fn set_schedule(&mut self, pull: &str, push: &str) -> Result<Schedule> {
        let schedule = Schedule::parse(pull, push)?;

        let settings = self.store.settings_mut();
        settings.pull_time = schedule.pull.to_string();
        settings.push_time = schedule.push.to_string();
        self.store.save();

        info!("Schedule saved: pull {}, push {}", schedule.pull, schedule.push);
        Ok(schedule)
    }

    /// Turn auto sync on or off. Enabling checks the stored times first.
    pub fn set_auto_sync(&mut self, enabled: bool) -> Result<()> {
        if enabled {
            Schedule::from_settings(self.store.settings())?;
        }
        self.store.settings_mut().auto_sync_enabled = enabled;
        self.store.save();
        Ok(())
    }

    pub fn set_run_in_background(&mut self, enabled: bool) {
        self.store.settings_mut().run_in_background = enabled;
        self.store.save();
    }

    pub fn set_auto_start(&mut self, enabled: bool) {
        self.store.settings_mut().auto_start = enabled;
        self.store.save();
    }

    /// Run one fired job against whatever is active in the settings file right now.
    /// Scheduled jobs never fan out to the whole registry.
    pub fn run_job(&mut self, kind: JobKind) -> Result<String> {
        self.reload();
        match kind {
            JobKind::Pull => self.pull().map(|outcome| outcome.to_string()),
            JobKind::Push => self.push().map(|outcome| outcome.to_string()),
        }
    }
}

fn logged<T: std::fmt::Display>(op: &str, res: Result<T>) -> Result<T> {
    match &res {
        Ok(outcome) => info!("{op} finished: {outcome}"),
        Err(e) => error!("{op} failed: {e}"),
    }
    res
}

impl JobHandler for Mutex<SyncManager> {
    fn run_job(&self, kind: JobKind) {
        let mut manager = self.lock().unwrap_or_else(PoisonError::into_inner);
        match manager.run_job(kind) {
            Ok(text) => info!("Scheduled {kind} done: {text}"),
            Err(e) => error!("Scheduled {kind} failed: {e}"),
        }
    }
}
