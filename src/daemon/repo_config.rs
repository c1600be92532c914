use super::config::Settings;
use super::errors::{Result, SyncError};
use super::git_ops;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One registered working copy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RepoEntry {
    /// Display name, defaults to the folder name
    pub name: String,
    /// Local checkout path
    pub path: PathBuf,
}

impl RepoEntry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Result of removing an entry from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub entry: RepoEntry,
    pub was_active: bool,
}

fn folder_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// Registry operations. They only touch the in-memory settings; callers persist.
impl Settings {
    pub fn repository(&self, index: usize) -> Result<&RepoEntry> {
        self.repositories.get(index).ok_or(SyncError::NoSuchRepository {
            index,
            len: self.repositories.len(),
        })
    }

    pub fn active_repository(&self) -> Option<&RepoEntry> {
        self.current_repo_index
            .and_then(|index| self.repositories.get(index))
    }

    /// Register a working copy. The path must open as a git repository and not be registered yet.
    ///
    /// Entries are stored by absolute path, so `.` and `/abs/work` name the same entry.
    pub fn add_repository(&mut self, path: &Path, name: Option<&str>) -> Result<&RepoEntry> {
        let path = git_ops::verify_working_copy(path)?;

        if self.repositories.iter().any(|repo| repo.path == path) {
            return Err(SyncError::DuplicateRepository { path });
        }

        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => folder_name(&path),
        };

        self.repositories.push(RepoEntry::new(name, path));
        Ok(&self.repositories[self.repositories.len() - 1])
    }

    /// Drop an entry, keeping the active pointer aligned with the shifted list.
    pub fn remove_repository(&mut self, index: usize) -> Result<Removed> {
        self.repository(index)?;

        let was_active = self.current_repo_index == Some(index);
        match self.current_repo_index {
            Some(current) if current == index => self.clear_active(),
            Some(current) if current > index => self.current_repo_index = Some(current - 1),
            _ => {}
        }

        let entry = self.repositories.remove(index);
        Ok(Removed { entry, was_active })
    }

    /// Point the active selection at a registered entry.
    pub fn set_active(&mut self, index: usize) -> Result<&RepoEntry> {
        let path = self.repository(index)?.path.clone();
        self.current_repo_index = Some(index);
        self.repo_path = path;
        self.all_selected = false;
        Ok(&self.repositories[index])
    }

    /// Select an ad-hoc path that is not (necessarily) registered.
    pub fn set_active_path(&mut self, path: &Path) {
        self.current_repo_index = self.repositories.iter().position(|repo| repo.path == path);
        self.repo_path = path.to_path_buf();
        self.all_selected = false;
    }

    /// The "ALL" pseudo-entry: no active working copy, Pull and Push cover the whole registry.
    pub fn select_all(&mut self) {
        self.clear_active();
        self.all_selected = true;
    }

    pub fn clear_active(&mut self) {
        self.current_repo_index = None;
        self.repo_path = PathBuf::new();
    }
}
