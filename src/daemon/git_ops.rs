use super::errors::{Result, SyncError};
use chrono::{DateTime, Local, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    AnnotatedCommit, Commit, Config, Cred, CredentialType, ErrorCode, FetchOptions, IndexAddOption,
    Oid, PushOptions, RemoteCallbacks, Repository, Signature, Sort, Status, StatusOptions,
};
use log::{debug, info};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const REMOTE: &str = "origin";
const SHORT_ID_LEN: usize = 7;
const MAX_AUTH_ATTEMPTS: usize = 3;
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Check that `path` opens as a non-bare git repository and return it absolute, with
/// `.`/`..` and symlinks resolved.
pub fn verify_working_copy(path: &Path) -> Result<PathBuf> {
    WorkingCopy::open(path)?;
    Ok(fs::canonicalize(path)?)
}

fn short_id(oid: Oid) -> String {
    let mut id = oid.to_string();
    id.truncate(SHORT_ID_LEN);
    id
}

fn format_time(time: git2::Time) -> String {
    match DateTime::<Utc>::from_timestamp(time.seconds(), 0) {
        Some(utc) => utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => time.seconds().to_string(),
    }
}

fn remote_callbacks(config: &Config) -> RemoteCallbacks<'_> {
    let mut attempts = 0;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        // libgit2 keeps asking while the answer is rejected
        attempts += 1;
        if attempts > MAX_AUTH_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }

        let username = username_from_url.unwrap_or("git");
        if allowed.contains(CredentialType::SSH_KEY) {
            // Use SSH agent for authentication
            Cred::ssh_key_from_agent(username)
        } else if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            Cred::credential_helper(config, url, username_from_url)
        } else if allowed.contains(CredentialType::USERNAME) {
            Cred::username(username)
        } else {
            Cred::default()
        }
    });
    callbacks
}

/// What a pull did to the local branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForward { from: Option<String>, to: String },
    Merged { commit: String },
}

impl fmt::Display for PullOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullOutcome::UpToDate => write!(f, "Already up to date."),
            PullOutcome::FastForward { from: Some(from), to } => write!(f, "Fast-forward {from}..{to}"),
            PullOutcome::FastForward { from: None, to } => write!(f, "Checked out {to}"),
            PullOutcome::Merged { commit } => write!(f, "Merge made by commit {commit}"),
        }
    }
}

/// What a push did. A clean working tree is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    NothingToCommit,
    Pushed { commit: String, branch: String },
}

impl fmt::Display for PushOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushOutcome::NothingToCommit => write!(f, "nothing to commit"),
            PushOutcome::Pushed { commit, branch } => {
                write!(f, "Committed {commit} and pushed '{branch}' to {REMOTE}")
            }
        }
    }
}

/// One commit as shown in the history view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub short_id: String,
    pub time: String,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
}

impl CommitInfo {
    fn from_commit(commit: &Commit) -> Self {
        let author = commit.author();
        Self {
            short_id: short_id(commit.id()),
            time: format_time(commit.time()),
            author_name: author.name().unwrap_or_default().to_string(),
            author_email: author.email().unwrap_or_default().to_string(),
            message: commit.message().unwrap_or_default().trim().to_string(),
        }
    }
}

impl fmt::Display for CommitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {} - {}", self.time, self.short_id, self.message)?;
        write!(f, "Author: {} <{}>", self.author_name, self.author_email)
    }
}

/// Working tree summary in the shape of `git status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub branch: Option<String>,
    pub staged: Vec<(&'static str, String)>,
    pub unstaged: Vec<(&'static str, String)>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
}

impl StatusReport {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.unstaged.is_empty()
            && self.untracked.is_empty()
            && self.conflicted.is_empty()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.branch {
            Some(branch) => writeln!(f, "On branch {branch}")?,
            None => writeln!(f, "HEAD detached")?,
        }

        if self.is_clean() {
            return write!(f, "nothing to commit, working tree clean");
        }

        if !self.conflicted.is_empty() {
            writeln!(f, "Unmerged paths:")?;
            for path in &self.conflicted {
                writeln!(f, "  both modified:   {path}")?;
            }
        }
        if !self.staged.is_empty() {
            writeln!(f, "Changes to be committed:")?;
            for (label, path) in &self.staged {
                writeln!(f, "  {:<17}{path}", format!("{label}:"))?;
            }
        }
        if !self.unstaged.is_empty() {
            writeln!(f, "Changes not staged for commit:")?;
            for (label, path) in &self.unstaged {
                writeln!(f, "  {:<17}{path}", format!("{label}:"))?;
            }
        }
        if !self.untracked.is_empty() {
            writeln!(f, "Untracked files:")?;
            for path in &self.untracked {
                writeln!(f, "  {path}")?;
            }
        }
        Ok(())
    }
}

fn staged_label(status: Status) -> Option<&'static str> {
    if status.is_index_new() {
        Some("new file")
    } else if status.is_index_modified() {
        Some("modified")
    } else if status.is_index_deleted() {
        Some("deleted")
    } else if status.is_index_renamed() {
        Some("renamed")
    } else if status.is_index_typechange() {
        Some("typechange")
    } else {
        None
    }
}

fn unstaged_label(status: Status) -> Option<&'static str> {
    if status.is_wt_modified() {
        Some("modified")
    } else if status.is_wt_deleted() {
        Some("deleted")
    } else if status.is_wt_renamed() {
        Some("renamed")
    } else if status.is_wt_typechange() {
        Some("typechange")
    } else {
        None
    }
}

/// Live handle on one working copy.
pub struct WorkingCopy {
    repo: Repository,
    path: PathBuf,
}

impl fmt::Debug for WorkingCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingCopy").field("path", &self.path).finish()
    }
}

impl WorkingCopy {
    pub fn open(path: &Path) -> Result<Self> {
        let invalid = |source| SyncError::RepoInvalid {
            path: path.to_path_buf(),
            source,
        };

        let repo = Repository::open(path).map_err(invalid)?;
        if repo.is_bare() {
            return Err(invalid(git2::Error::from_str("bare repository has no working tree")));
        }

        debug!("Opened working copy {}", path.display());
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn current_branch(&self) -> Result<String> {
        match self.repo.head() {
            Ok(head) => {
                if self.repo.head_detached()? {
                    return Err(git2::Error::from_str("HEAD is detached, check out a branch first").into());
                }
                head.shorthand()
                    .map(str::to_string)
                    .ok_or_else(|| git2::Error::from_str("branch name is not valid utf-8").into())
            }
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                let head = self.repo.find_reference("HEAD")?;
                let target = head.symbolic_target().unwrap_or("refs/heads/master");
                Ok(target.trim_start_matches("refs/heads/").to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn signature(&self) -> Result<Signature<'static>> {
        match self.repo.signature() {
            Ok(signature) => Ok(signature),
            Err(_) => Ok(Signature::now("gitsyncer", "gitsyncer@localhost")?),
        }
    }

    /// Any modified, new, deleted or untracked file.
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status()?.is_clean())
    }

    pub fn status(&self) -> Result<StatusReport> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut options))?;

        let mut report = StatusReport {
            branch: self.current_branch().ok(),
            ..StatusReport::default()
        };

        for entry in statuses.iter() {
            let status = entry.status();
            let path = entry.path().unwrap_or_default().to_string();

            if status.is_conflicted() {
                report.conflicted.push(path);
                continue;
            }
            if let Some(label) = staged_label(status) {
                report.staged.push((label, path.clone()));
            }
            if let Some(label) = unstaged_label(status) {
                report.unstaged.push((label, path.clone()));
            }
            if status.is_wt_new() {
                report.untracked.push(path);
            }
        }

        Ok(report)
    }

    /// Most recent commits reachable from HEAD, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        if self.head_commit()?.is_none() {
            return Ok(Vec::new());
        }

        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        revwalk.push_head()?;

        revwalk
            .take(limit)
            .map(|oid| -> Result<CommitInfo> {
                let commit = self.repo.find_commit(oid?)?;
                Ok(CommitInfo::from_commit(&commit))
            })
            .collect()
    }

    /// Fetch the current branch from origin and merge it.
    pub fn pull(&self) -> Result<PullOutcome> {
        let branch = self.current_branch()?;
        let mut remote = self.repo.find_remote(REMOTE).map_err(SyncError::NoRemote)?;

        let config = self.repo.config()?;
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(remote_callbacks(&config));

        info!("Fetching '{}' for {}", branch, self.path.display());
        remote
            .fetch(&[&branch], Some(&mut fetch_options), None)
            .map_err(SyncError::Network)?;

        let fetch_head = self.repo.find_reference("FETCH_HEAD")?;
        let fetch_commit = self.repo.reference_to_annotated_commit(&fetch_head)?;
        self.merge(&branch, &fetch_commit)
    }

    fn merge(&self, branch: &str, fetch_commit: &AnnotatedCommit) -> Result<PullOutcome> {
        let (analysis, _) = self.repo.merge_analysis(&[fetch_commit])?;
        let refname = format!("refs/heads/{branch}");
        let target = short_id(fetch_commit.id());

        if analysis.is_up_to_date() {
            debug!("No changes detected for {}", self.path.display());
            return Ok(PullOutcome::UpToDate);
        }

        if analysis.is_unborn() || analysis.is_fast_forward() {
            // checkout first so local edits that would be overwritten abort before any ref moves
            let object = self.repo.find_object(fetch_commit.id(), None)?;
            self.repo
                .checkout_tree(&object, Some(CheckoutBuilder::default().safe()))?;

            let from = match self.repo.find_reference(&refname) {
                Ok(mut reference) => {
                    let from = reference.target().map(short_id);
                    reference.set_target(fetch_commit.id(), "pull: fast-forward")?;
                    from
                }
                Err(e) if e.code() == ErrorCode::NotFound => {
                    self.repo
                        .reference(&refname, fetch_commit.id(), true, "pull: initial checkout")?;
                    None
                }
                Err(e) => return Err(e.into()),
            };
            self.repo.set_head(&refname)?;

            info!("Fast-forwarded {} to {}", self.path.display(), target);
            return Ok(PullOutcome::FastForward { from, to: target });
        }

        if !analysis.is_normal() {
            return Err(git2::Error::from_str("nothing to merge").into());
        }

        self.repo.merge(&[fetch_commit], None, None)?;
        let mut index = self.repo.index()?;

        if index.has_conflicts() {
            let files = index
                .conflicts()?
                .filter_map(|conflict| conflict.ok())
                .filter_map(|conflict| conflict.our.or(conflict.their))
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .collect();
            self.repo.cleanup_state()?;
            return Err(SyncError::MergeConflict { files });
        }

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let signature = self.signature()?;
        let ours = self.repo.head()?.peel_to_commit()?;
        let theirs = self.repo.find_commit(fetch_commit.id())?;
        let message = format!("Merge branch '{branch}' of {REMOTE}");

        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &message,
            &tree,
            &[&ours, &theirs],
        )?;
        self.repo.cleanup_state()?;

        info!("Merged {} into {}", target, self.path.display());
        Ok(PullOutcome::Merged {
            commit: short_id(oid),
        })
    }

    /// Stage everything, commit with `message` and push the current branch to origin.
    ///
    /// A clean tree returns `NothingToCommit` without touching the index or the remote.
    /// When the push fails after the commit, the commit stays in place.
    pub fn push(&self, message: &str) -> Result<PushOutcome> {
        if !self.is_dirty()? {
            info!("Nothing to commit in {}", self.path.display());
            return Ok(PushOutcome::NothingToCommit);
        }

        let branch = self.current_branch()?;
        let commit = self.commit_all(message)?;
        info!("Committed {} in {}: {}", commit, self.path.display(), message);

        self.push_branch(&branch)
            .map_err(|source| SyncError::PushAfterCommit {
                commit: commit.clone(),
                source,
            })?;

        info!("Pushed '{}' of {} to {}", branch, self.path.display(), REMOTE);
        Ok(PushOutcome::Pushed { commit, branch })
    }

    fn commit_all(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let signature = self.signature()?;
        let parent = self.head_commit()?;
        let parents: Vec<&Commit> = parent.iter().collect();

        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        Ok(short_id(oid))
    }

    fn push_branch(&self, branch: &str) -> std::result::Result<(), git2::Error> {
        let mut remote = self.repo.find_remote(REMOTE)?;

        let config = self.repo.config()?;
        let mut callbacks = remote_callbacks(&config);
        callbacks.push_update_reference(|refname, status| match status {
            Some(message) => Err(git2::Error::from_str(&format!("{refname} rejected: {message}"))),
            None => Ok(()),
        });

        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], Some(&mut push_options))
    }
}
