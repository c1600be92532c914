use std::path::PathBuf;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no repository selected")]
    NoRepositorySelected,
    #[error("not a valid git working copy: {} - {source}", path.display())]
    RepoInvalid { path: PathBuf, source: git2::Error },
    #[error("repository already registered: {}", path.display())]
    DuplicateRepository { path: PathBuf },
    #[error("no repository at index {index} (registry holds {len})")]
    NoSuchRepository { index: usize, len: usize },
    #[error("no repositories registered")]
    EmptyRegistry,
    #[error("cancelled")]
    Cancelled,
    #[error("remote 'origin' not configured - {0}")]
    NoRemote(git2::Error),
    #[error("remote operation failed: {0}")]
    Network(git2::Error),
    #[error("merge produced conflicts in {} file(s), resolve them manually", files.len())]
    MergeConflict { files: Vec<String> },
    #[error("committed {commit} locally but push failed - {source}")]
    PushAfterCommit { commit: String, source: git2::Error },
    #[error("invalid schedule time '{0}', expected HH:MM")]
    InvalidScheduleTime(String),
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(#[from] JoinError),
}
