//! Garbage collection: named roots, mark, sweep.
//!
//! Roots live as symlinks in a dedicated directory; the core never
//! infers roots from filesystem scans. Collection walks from each root
//! through `runtime-dependencies`, recorded imports and virtual
//! resolutions, retains the reachable set, and removes the rest. Source
//! entries are retained per their tag's policy.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::consts::BUILD_SPEC_FILENAME;
use crate::meta::{ArtifactMeta, MetaError};
use crate::source::{SourceCache, SourceError, SourceKey};
use crate::spec::{ArtifactId, BuildSpec, ImportId};
use crate::store::{BuildStore, StoreError};
use crate::store_lock::{LockError, LockMode, StoreLock};

#[derive(Debug, Error)]
pub enum GcError {
  #[error("no gc root named '{name}'")]
  RootNotFound { name: String },

  #[error("invalid gc root name '{name}'")]
  InvalidRootName { name: String },

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Store(#[from] Box<StoreError>),

  #[error(transparent)]
  Source(#[from] SourceError),

  #[error(transparent)]
  Meta(#[from] MetaError),

  #[error(transparent)]
  Lock(#[from] LockError),
}

fn gc_io(path: &Path) -> impl FnOnce(std::io::Error) -> GcError + '_ {
  move |source| GcError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// The registry of named GC roots: a directory of symlinks, updated
/// atomically.
pub struct GcRoots {
  dir: PathBuf,
}

impl GcRoots {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    GcRoots { dir: dir.into() }
  }

  fn validate_name(name: &str) -> Result<(), GcError> {
    let ok = !name.is_empty()
      && !name.starts_with('.')
      && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'));
    if ok {
      Ok(())
    } else {
      Err(GcError::InvalidRootName { name: name.to_string() })
    }
  }

  /// Register (or replace) a named root pointing at `target`.
  pub fn register(&self, name: &str, target: &Path) -> Result<(), GcError> {
    Self::validate_name(name)?;
    fs::create_dir_all(&self.dir).map_err(gc_io(&self.dir))?;
    let staged = self.dir.join(format!(".incoming-{name}"));
    let _ = fs::remove_file(&staged);
    std::os::unix::fs::symlink(target, &staged).map_err(gc_io(&staged))?;
    // rename replaces an existing root in one step.
    fs::rename(&staged, self.dir.join(name)).map_err(gc_io(&self.dir))?;
    info!(name, target = %target.display(), "registered gc root");
    Ok(())
  }

  pub fn unregister(&self, name: &str) -> Result<(), GcError> {
    Self::validate_name(name)?;
    let path = self.dir.join(name);
    match fs::remove_file(&path) {
      Ok(()) => {
        info!(name, "removed gc root");
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GcError::RootNotFound { name: name.to_string() }),
      Err(e) => Err(gc_io(&path)(e)),
    }
  }

  /// All registered roots with their targets.
  pub fn list(&self) -> Result<Vec<(String, PathBuf)>, GcError> {
    let mut roots = Vec::new();
    let entries = match fs::read_dir(&self.dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(roots),
      Err(e) => return Err(gc_io(&self.dir)(e)),
    };
    for entry in entries {
      let entry = entry.map_err(gc_io(&self.dir))?;
      let name = entry.file_name().to_string_lossy().to_string();
      if name.starts_with('.') {
        continue;
      }
      let target = fs::read_link(entry.path()).map_err(gc_io(&entry.path()))?;
      roots.push((name, target));
    }
    roots.sort();
    Ok(roots)
  }
}

/// How long unreferenced source entries of a tag are kept.
#[derive(Debug, Clone)]
pub enum Retention {
  Forever,
  MaxAge(Duration),
}

/// Per-tag retention rules. Tags without a rule are collected when
/// unreferenced; `transient` entries always are.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
  rules: BTreeMap<String, Retention>,
}

impl RetentionPolicy {
  pub fn keep(mut self, tag: &str, retention: Retention) -> Self {
    self.rules.insert(tag.to_string(), retention);
    self
  }

  fn retains(&self, tag: &str, fetched_at: u64, now: u64) -> bool {
    if tag == "transient" {
      return false;
    }
    match self.rules.get(tag) {
      Some(Retention::Forever) => true,
      Some(Retention::MaxAge(age)) => now.saturating_sub(fetched_at) <= age.as_secs(),
      None => false,
    }
  }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct GcStats {
  pub artifacts_scanned: usize,
  pub artifacts_deleted: usize,
  pub artifacts_bytes_freed: u64,
  pub sources_scanned: usize,
  pub sources_deleted: usize,
}

#[derive(Debug, serde::Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Collect the reachable set from the registered roots.
///
/// Edges: `runtime-dependencies` and recorded virtual resolutions from
/// `artifact.json`, imports from `build.json`. Source keys named by any
/// live `build.json` are live too.
fn mark(store: &BuildStore, roots: &GcRoots) -> Result<(BTreeSet<ArtifactId>, BTreeSet<SourceKey>), GcError> {
  let mut live_artifacts = BTreeSet::new();
  let mut live_sources = BTreeSet::new();
  let mut queue: VecDeque<PathBuf> = VecDeque::new();

  for (name, target) in roots.list()? {
    if target.is_dir() {
      queue.push_back(target);
    } else {
      warn!(root = %name, target = %target.display(), "skipping dangling gc root");
    }
  }

  while let Some(dir) = queue.pop_front() {
    let spec_path = dir.join(BUILD_SPEC_FILENAME);
    let spec = match fs::read(&spec_path) {
      Ok(raw) => match BuildSpec::from_json(&raw) {
        Ok(spec) => spec,
        Err(e) => {
          warn!(path = %spec_path.display(), error = %e, "unreadable build spec under gc root");
          continue;
        }
      },
      Err(e) => {
        warn!(path = %spec_path.display(), error = %e, "missing build spec under gc root");
        continue;
      }
    };

    let id = spec.artifact_id().map_err(|e| GcError::Store(Box::new(e.into())))?;
    if !live_artifacts.insert(id.clone()) {
      continue;
    }
    debug!(id = %id, "live");

    for source in &spec.sources {
      live_sources.insert(source.key.clone());
    }

    let meta = ArtifactMeta::read(&dir)?;
    let mut follow = |dep: &ArtifactId| -> Result<(), GcError> {
      if live_artifacts.contains(dep) {
        return Ok(());
      }
      match store.resolve_id(dep).map_err(Box::new)? {
        Some(dep_dir) => queue.push_back(dep_dir),
        None => warn!(id = %dep, "live reference to missing artifact"),
      }
      Ok(())
    };

    for dep in &meta.runtime_dependencies {
      follow(dep)?;
    }
    for dep in meta.virtuals.values() {
      follow(dep)?;
    }
    for import in &spec.build.imports {
      if let ImportId::Concrete(dep) = &import.id {
        follow(dep)?;
      }
    }
  }

  Ok((live_artifacts, live_sources))
}

/// Remove everything not reachable from the roots.
///
/// Takes an exclusive lock over the store: no builds run during
/// collection. With `dry_run`, reports what would go without deleting.
pub fn collect_garbage(
  store: &BuildStore,
  roots: &GcRoots,
  policy: &RetentionPolicy,
  dry_run: bool,
) -> Result<GcResult, GcError> {
  let _lock = StoreLock::acquire(store.context().write_store(), LockMode::Exclusive, "gc")?;

  let (live_artifacts, live_sources) = mark(store, roots)?;
  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();

  for artifact in store.artifacts().map_err(Box::new)? {
    stats.artifacts_scanned += 1;
    if live_artifacts.contains(&artifact.id) {
      continue;
    }

    let size = dir_size(&artifact.short_dir);
    debug!(id = %artifact.id, "removing unreferenced artifact");
    if !dry_run {
      if let Err(e) = fs::remove_file(&artifact.link_path) {
        warn!(path = %artifact.link_path.display(), error = %e, "failed to remove full-hash symlink");
        continue;
      }
      if let Err(e) = fs::remove_dir_all(&artifact.short_dir) {
        warn!(path = %artifact.short_dir.display(), error = %e, "failed to remove artifact directory");
        continue;
      }
    }
    stats.artifacts_deleted += 1;
    stats.artifacts_bytes_freed += size;
    deleted_paths.push(artifact.short_dir);
  }

  let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
  for cache_root in &store.context().source_caches {
    let cache = SourceCache::new(cache_root);
    for (key, info) in cache.entries()? {
      stats.sources_scanned += 1;
      if live_sources.contains(&key) || policy.retains(&info.tag, info.fetched_at, now) {
        continue;
      }
      debug!(key = %key, tag = %info.tag, "removing unreferenced source");
      if !dry_run {
        cache.remove(&key)?;
      }
      stats.sources_deleted += 1;
    }
  }

  info!(
    artifacts_deleted = stats.artifacts_deleted,
    sources_deleted = stats.sources_deleted,
    bytes_freed = stats.artifacts_bytes_freed,
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult { stats, deleted_paths })
}
