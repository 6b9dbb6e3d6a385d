//! Git source backend: a shared object pool per cache.
//!
//! All git fetches land in one bare repository under the cache root, so
//! commits shared between remotes are stored once. The pool is the only
//! mutable shared piece of the cache; writers serialize through a lock
//! file. Keys are full commit shas, which makes verification implicit:
//! a commit that resolves is the content it names.

use std::fs;
use std::path::Path;

use gix::remote::Direction;
use tracing::{debug, info};

use super::SourceError;
use crate::store_lock::{LockMode, StoreLock};

const POOL_DIR: &str = "git";

/// Fetch `refspec` (branch, tag or sha) from `url` into the pool.
/// Returns the full commit sha.
pub(crate) fn fetch(cache_root: &Path, url: &str, refspec: &str) -> Result<String, SourceError> {
  let pool = cache_root.join(POOL_DIR);
  let _lock = StoreLock::acquire(&pool, LockMode::Exclusive, "fetch-git").map_err(|e| SourceError::GitPool {
    message: e.to_string(),
  })?;

  let repo = open_or_clone(&pool, url)?;
  fetch_refs(&repo, url)?;
  let sha = resolve_commit(&repo, refspec)?;
  debug!(url, refspec, sha = %sha, "resolved git source");
  Ok(sha)
}

/// Whether the pool already holds `sha`.
pub(crate) fn has_commit(cache_root: &Path, sha: &str) -> bool {
  let pool = cache_root.join(POOL_DIR).join("pool.git");
  let Ok(repo) = gix::open(&pool) else {
    return false;
  };
  resolve_commit(&repo, sha).is_ok()
}

/// Write the tree of `sha` into `dest`.
pub(crate) fn checkout(cache_root: &Path, sha: &str, dest: &Path) -> Result<(), SourceError> {
  let pool = cache_root.join(POOL_DIR).join("pool.git");
  let repo = gix::open(&pool).map_err(|e| SourceError::GitOpen {
    path: pool.clone(),
    message: e.to_string(),
  })?;

  let checkout_err = |e: &dyn std::fmt::Display| SourceError::GitCheckout {
    rev: sha.to_string(),
    message: e.to_string(),
  };

  let commit_id = repo
    .rev_parse_single(sha)
    .map_err(|_| SourceError::SourceNotFound {
      key: format!("git:{sha}"),
    })?;
  let tree = commit_id
    .object()
    .map_err(|e| checkout_err(&e))?
    .peel_to_tree()
    .map_err(|e| checkout_err(&e))?;

  fs::create_dir_all(dest).map_err(|e| SourceError::io(dest, e))?;
  write_tree(&tree, dest, sha)
}

fn open_or_clone(pool: &Path, url: &str) -> Result<gix::Repository, SourceError> {
  let repo_path = pool.join("pool.git");
  if repo_path.exists() {
    debug!(path = %repo_path.display(), "opening git pool");
    return gix::open(&repo_path).map_err(|e| SourceError::GitOpen {
      path: repo_path,
      message: e.to_string(),
    });
  }

  info!(url, path = %repo_path.display(), "initializing git pool");
  let mut prepared = gix::prepare_clone_bare(url, &repo_path).map_err(|e| SourceError::GitFetch {
    url: url.to_string(),
    message: e.to_string(),
  })?;
  let (repo, _outcome) = prepared
    .fetch_only(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| SourceError::GitFetch {
      url: url.to_string(),
      message: e.to_string(),
    })?;
  Ok(repo)
}

fn fetch_refs(repo: &gix::Repository, url: &str) -> Result<(), SourceError> {
  let fetch_err = |e: &dyn std::fmt::Display| SourceError::GitFetch {
    url: url.to_string(),
    message: e.to_string(),
  };

  let remote = repo
    .remote_at(url)
    .map_err(|e| fetch_err(&e))?
    .with_refspecs(["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"], Direction::Fetch)
    .map_err(|e| fetch_err(&e))?;

  let connection = remote.connect(Direction::Fetch).map_err(|e| fetch_err(&e))?;

  connection
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| fetch_err(&e))?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| fetch_err(&e))?;

  Ok(())
}

/// Resolve a revision spec to a full commit sha.
fn resolve_commit(repo: &gix::Repository, refspec: &str) -> Result<String, SourceError> {
  let not_found = || SourceError::GitRevisionNotFound {
    rev: refspec.to_string(),
  };

  let spec = repo.rev_parse(refspec).map_err(|_| not_found())?;
  let object_id = spec.single().ok_or_else(not_found)?;
  let commit = object_id
    .object()
    .map_err(|_| not_found())?
    .peel_to_kind(gix::object::Kind::Commit)
    .map_err(|_| not_found())?;
  Ok(commit.id.to_string())
}

fn write_tree(tree: &gix::Tree<'_>, dest: &Path, rev: &str) -> Result<(), SourceError> {
  let checkout_err = |e: &dyn std::fmt::Display| SourceError::GitCheckout {
    rev: rev.to_string(),
    message: e.to_string(),
  };

  for entry in tree.iter() {
    let entry = entry.map_err(|e| checkout_err(&e))?;
    let name = entry.filename().to_string();
    let path = dest.join(&name);
    let mode = entry.mode();

    if mode.is_tree() {
      fs::create_dir_all(&path).map_err(|e| SourceError::io(&path, e))?;
      let subtree = entry
        .object()
        .map_err(|e| checkout_err(&e))?
        .try_into_tree()
        .map_err(|e| checkout_err(&e))?;
      write_tree(&subtree, &path, rev)?;
    } else if mode.is_link() {
      let blob = entry.object().map_err(|e| checkout_err(&e))?;
      let target = String::from_utf8_lossy(&blob.data).to_string();
      std::os::unix::fs::symlink(&target, &path).map_err(|e| SourceError::io(&path, e))?;
    } else if mode.is_blob() {
      let blob = entry.object().map_err(|e| checkout_err(&e))?;
      fs::write(&path, &blob.data).map_err(|e| SourceError::io(&path, e))?;
      #[cfg(unix)]
      if mode.is_executable() {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(|e| SourceError::io(&path, e))?;
      }
    }
    // Submodule (commit) entries are skipped: the pool holds no
    // foreign objects to materialize them from.
  }

  Ok(())
}

// Clone/fetch paths need network access and are exercised by the
// integration suite; resolve/checkout logic is covered through the
// source cache tests using locally initialized pools.
