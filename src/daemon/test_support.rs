//! Scratch repositories for unit tests.

use git2::{Commit, Oid, Repository, RepositoryInitOptions};
use std::fs;
use std::path::{Path, PathBuf};

fn set_identity(repo: &Repository) {
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Test User").unwrap();
    config.set_str("user.email", "test@example.com").unwrap();
}

/// Empty working copy on branch `main` with a test identity.
pub fn init_repo(path: &Path) -> Repository {
    let mut options = RepositoryInitOptions::new();
    options.initial_head("main");
    let repo = Repository::init_opts(path, &options).unwrap();
    set_identity(&repo);
    repo
}

/// Bare repository standing in for a remote.
pub fn init_bare(path: &Path) -> PathBuf {
    let mut options = RepositoryInitOptions::new();
    options.bare(true).initial_head("main");
    Repository::init_opts(path, &options).unwrap();
    path.to_path_buf()
}

/// Write `name` and commit it on top of HEAD.
pub fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) -> Oid {
    let workdir = repo.workdir().unwrap();
    fs::write(workdir.join(name), content).unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new(name)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

    let signature = repo.signature().unwrap();
    let parent = repo.head().ok().map(|head| head.peel_to_commit().unwrap());
    let parents: Vec<&Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .unwrap()
}

pub fn clone_remote(remote: &Path, path: &Path) -> Repository {
    let repo = Repository::clone(remote.to_str().unwrap(), path).unwrap();
    set_identity(&repo);
    repo
}

/// A bare `remote` under `root` and a working copy `work` whose first commit is already
/// pushed to it. Returns `(remote, work)`.
pub fn published_repo(root: &Path) -> (PathBuf, PathBuf) {
    let remote = init_bare(&root.join("remote.git"));
    let work = root.join("work");

    let repo = init_repo(&work);
    commit_file(&repo, "README.md", "hello", "initial");
    repo.remote("origin", remote.to_str().unwrap()).unwrap();
    repo.find_remote("origin")
        .unwrap()
        .push(&["refs/heads/main:refs/heads/main"], None)
        .unwrap();

    (remote, work)
}
