//! The build store: artifact lookup, hermetic build staging, atomic
//! commit.
//!
//! # Layout
//!
//! ```text
//! <store root>/
//! ├── opt/<name>/<version>/<short-hash>/   installed artifacts
//! ├── opt/<name>/<version>/<full-hash>     symlink to <short-hash>
//! └── bld/<name>/<version>/<short>-<n>/    staging for builds in flight
//! ```
//!
//! An artifact directory appears only through a single `rename`:
//! readers either see a complete artifact or nothing. Two processes
//! building the same spec race harmlessly; content is deterministic, so
//! the loser discards its staging and adopts the winner's directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StoreContext;
use crate::consts::{BUILD_LOG_FILENAME, BUILD_LOG_GZ_FILENAME, BUILD_SPEC_FILENAME, SHORT_HASH_LEN};
use crate::job::{self, JobError, ResolvedImport};
use crate::links;
use crate::meta::{ArtifactMeta, MetaError};
use crate::profile;
use crate::source::{SourceCache, SourceError};
use crate::spec::{ArtifactId, BuildSpec, ImportId, SourceRef, SpecError};
use crate::store_lock::{LockError, LockMode, StoreLock};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error(transparent)]
  Spec(#[from] SpecError),

  #[error(transparent)]
  Source(#[from] SourceError),

  #[error(transparent)]
  Meta(#[from] MetaError),

  #[error(transparent)]
  Lock(#[from] LockError),

  /// The referenced artifact is not in the store and the core does not
  /// recurse: the caller must build the dependency first.
  #[error("unresolved import '{id}': not present in any store")]
  UnresolvedImport { id: String },

  #[error("build of {artifact_id} failed during {stage}: {source}\n  log: {log_path}")]
  BuildFailed {
    artifact_id: String,
    stage: String,
    log_path: PathBuf,
    #[source]
    source: JobError,
  },

  #[error("store io error on {path}: {source}")]
  StoreIo {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The store's own invariants are violated: a full-hash symlink that
  /// dangles or disagrees with its target. Reported loudly, never
  /// repaired silently.
  #[error("integrity error: {message}")]
  Integrity { message: String },
}

fn store_io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
  move |source| StoreError::StoreIo {
    path: path.to_path_buf(),
    source,
  }
}

/// An artifact found while scanning a store, for GC.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
  pub id: ArtifactId,
  pub short_dir: PathBuf,
  pub link_path: PathBuf,
}

/// A build store bound to a [`StoreContext`].
pub struct BuildStore {
  ctx: StoreContext,
}

impl BuildStore {
  pub fn new(ctx: StoreContext) -> Self {
    BuildStore { ctx }
  }

  pub fn context(&self) -> &StoreContext {
    &self.ctx
  }

  fn artifact_base(store_root: &Path, id: &ArtifactId) -> PathBuf {
    store_root.join("opt").join(&id.name).join(&id.version)
  }

  /// Probe the configured stores for a spec's artifact.
  pub fn resolve_spec(&self, spec: &BuildSpec) -> Result<Option<PathBuf>, StoreError> {
    let id = spec.artifact_id()?;
    self.resolve_id(&id)
  }

  /// Probe the configured stores for an artifact id, full or
  /// short-form.
  pub fn resolve_id(&self, id: &ArtifactId) -> Result<Option<PathBuf>, StoreError> {
    for store_root in &self.ctx.build_stores {
      if let Some(dir) = Self::resolve_in(store_root, id)? {
        return Ok(Some(dir));
      }
    }
    Ok(None)
  }

  fn resolve_in(store_root: &Path, id: &ArtifactId) -> Result<Option<PathBuf>, StoreError> {
    let base = Self::artifact_base(store_root, id);
    let link_path = base.join(&id.digest.0);

    // The full-hash symlink is the canonical entry point.
    if link_path.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
      return Self::follow_link(&base, &link_path, &id.digest.0).map(Some);
    }

    // Short-form input: find full-hash symlinks with this prefix.
    let entries = match fs::read_dir(&base) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(store_io(&base)(e)),
    };
    let mut candidates = Vec::new();
    for entry in entries {
      let entry = entry.map_err(store_io(&base))?;
      let name = entry.file_name().to_string_lossy().to_string();
      let is_link = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
      if is_link && name.starts_with(&id.digest.0) {
        candidates.push(name);
      }
    }
    match candidates.as_slice() {
      [] => Ok(None),
      [full] => Self::follow_link(&base, &base.join(full), full).map(Some),
      _ => Err(StoreError::Integrity {
        message: format!("short hash {}/{}/{} is ambiguous", id.name, id.version, id.digest),
      }),
    }
  }

  fn follow_link(base: &Path, link_path: &Path, full_hash: &str) -> Result<PathBuf, StoreError> {
    let target = fs::read_link(link_path).map_err(store_io(link_path))?;
    let target_name = target.to_string_lossy().to_string();
    let dir = base.join(&target);
    if !full_hash.starts_with(&target_name) || !dir.is_dir() {
      return Err(StoreError::Integrity {
        message: format!(
          "full-hash symlink {} points at '{target_name}', which is missing or not a prefix match",
          link_path.display()
        ),
      });
    }
    Ok(dir)
  }

  /// Every artifact in the write store, discovered via full-hash
  /// symlinks. Used by GC.
  pub fn artifacts(&self) -> Result<Vec<StoredArtifact>, StoreError> {
    let opt = self.ctx.write_store().join("opt");
    let mut found = Vec::new();
    let name_dirs = match fs::read_dir(&opt) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
      Err(e) => return Err(store_io(&opt)(e)),
    };
    for name_entry in name_dirs {
      let name_entry = name_entry.map_err(store_io(&opt))?;
      if !name_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
        continue;
      }
      let name = name_entry.file_name().to_string_lossy().to_string();
      for version_entry in fs::read_dir(name_entry.path()).map_err(store_io(&opt))? {
        let version_entry = version_entry.map_err(store_io(&opt))?;
        if !version_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
          continue;
        }
        let version = version_entry.file_name().to_string_lossy().to_string();
        for entry in fs::read_dir(version_entry.path()).map_err(store_io(&opt))? {
          let entry = entry.map_err(store_io(&opt))?;
          if !entry.file_type().map(|t| t.is_symlink()).unwrap_or(false) {
            continue;
          }
          let full = entry.file_name().to_string_lossy().to_string();
          let Ok(id) = format!("{name}/{version}/{full}").parse::<ArtifactId>() else {
            warn!(link = %entry.path().display(), "skipping unparsable store entry");
            continue;
          };
          let target = fs::read_link(entry.path()).map_err(store_io(&opt))?;
          found.push(StoredArtifact {
            id,
            short_dir: version_entry.path().join(target),
            link_path: entry.path(),
          });
        }
      }
    }
    Ok(found)
  }

  /// Resolve a job's imports against the store and the caller's
  /// virtuals table.
  pub fn resolve_imports(
    &self,
    imports: &[job::Import],
    virtuals: &BTreeMap<String, ArtifactId>,
  ) -> Result<(Vec<ResolvedImport>, BTreeMap<String, ArtifactId>), StoreError> {
    let mut resolved = Vec::with_capacity(imports.len());
    let mut virtuals_used = BTreeMap::new();

    for import in imports {
      let concrete = match &import.id {
        ImportId::Concrete(id) => id.clone(),
        ImportId::Virtual(alias) => {
          let Some(id) = virtuals.get(alias) else {
            return Err(StoreError::UnresolvedImport {
              id: format!("virtual:{alias}"),
            });
          };
          virtuals_used.insert(alias.clone(), id.clone());
          id.clone()
        }
      };

      let Some(path) = self.resolve_id(&concrete)? else {
        return Err(StoreError::UnresolvedImport {
          id: concrete.to_string(),
        });
      };
      let meta = ArtifactMeta::read(&path)?;
      resolved.push(ResolvedImport {
        ref_name: import.ref_name.clone(),
        id: concrete,
        path,
        meta,
        before: import.before.clone(),
      });
    }

    Ok((resolved, virtuals_used))
  }

  /// Build a spec, or return its cached artifact.
  ///
  /// Dependencies must already be present; the store never recurses.
  pub fn build(&self, spec: &BuildSpec, virtuals: &BTreeMap<String, ArtifactId>) -> Result<PathBuf, StoreError> {
    let (id, canonical) = spec.canonicalize()?;

    if let Some(dir) = self.resolve_id(&id)? {
      debug!(id = %id, path = %dir.display(), "artifact already in store (cache hit)");
      return Ok(dir);
    }

    // Shared lock: concurrent builds are fine, GC is not.
    let _lock = StoreLock::acquire(self.ctx.write_store(), LockMode::Shared, "build")?;

    let (imports, virtuals_used) = self.resolve_imports(&spec.build.imports, virtuals)?;

    let staging = self.create_staging(&id)?;
    info!(id = %id, staging = %staging.root.display(), "building");

    fs::write(staging.pkg.join(BUILD_SPEC_FILENAME), &canonical).map_err(store_io(&staging.pkg))?;
    let mut seed = ArtifactMeta::from_spec_parts(spec.profile_install.as_ref(), spec.import_modify_env.as_ref())
      .map_err(|e| SpecError::InvalidSpec {
        reason: format!("profile_install/import_modify_env: {e}"),
      })?;
    // Record how virtuals were resolved so GC can follow the edges.
    seed.virtuals = virtuals_used.clone();
    seed.write(&staging.pkg)?;

    for source in &spec.sources {
      let target = staging.work.join(&source.target);
      self.unpack_source(source, &target)?;
    }

    let mut env = job::assemble_env(&spec.build, &imports, &staging.work, &staging.pkg, &virtuals_used)
      .map_err(|e| self.build_failed(&id, &staging, "assemble-env", e))?;

    job::run_job(&spec.build, &mut env, &staging.work, &StoreBuiltins { store: self })
      .map_err(|e| self.build_failed(&id, &staging, "run-commands", e))?;

    self.commit(&id, staging)
  }

  fn build_failed(&self, id: &ArtifactId, staging: &Staging, stage: &str, source: JobError) -> StoreError {
    warn!(id = %id, stage, error = %source, "build failed; staging left for inspection");
    StoreError::BuildFailed {
      artifact_id: id.to_string(),
      stage: stage.to_string(),
      log_path: staging.work.join(BUILD_LOG_FILENAME),
      source,
    }
  }

  fn unpack_source(&self, source: &SourceRef, target: &Path) -> Result<(), StoreError> {
    for cache_root in &self.ctx.source_caches {
      let cache = SourceCache::new(cache_root);
      if cache.contains(&source.key) {
        cache.unpack(&source.key, target, source.strip)?;
        return Ok(());
      }
    }
    Err(StoreError::Source(SourceError::SourceNotFound {
      key: source.key.to_string(),
    }))
  }

  fn create_staging(&self, id: &ArtifactId) -> Result<Staging, StoreError> {
    let short = &id.digest.0[..SHORT_HASH_LEN.min(id.digest.0.len())];
    let base = self.ctx.write_store().join("bld").join(&id.name).join(&id.version);
    fs::create_dir_all(&base).map_err(store_io(&base))?;

    // The counter keeps concurrent builders of the same spec apart.
    for counter in 0.. {
      let root = base.join(format!("{short}-{counter}"));
      match fs::create_dir(&root) {
        Ok(()) => {
          let work = root.join("work");
          let pkg = root.join("pkg");
          fs::create_dir(&work).map_err(store_io(&work))?;
          fs::create_dir(&pkg).map_err(store_io(&pkg))?;
          return Ok(Staging { root, work, pkg });
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
        Err(e) => return Err(store_io(&root)(e)),
      }
    }
    unreachable!("staging counter is unbounded")
  }

  /// Promote a finished staging area: compress the log, rename the
  /// package directory into `opt/`, place the full-hash symlink.
  fn commit(&self, id: &ArtifactId, staging: Staging) -> Result<PathBuf, StoreError> {
    let log_src = staging.work.join(BUILD_LOG_FILENAME);
    if log_src.is_file() {
      compress_log(&log_src, &staging.pkg.join(BUILD_LOG_GZ_FILENAME))?;
    }

    let base = Self::artifact_base(self.ctx.write_store(), id);
    fs::create_dir_all(&base).map_err(store_io(&base))?;
    let full = &id.digest.0;

    let mut len = SHORT_HASH_LEN.min(full.len());
    loop {
      let final_path = base.join(&full[..len]);
      match fs::rename(&staging.pkg, &final_path) {
        Ok(()) => {
          self.place_link(&base, full, &full[..len])?;
          staging.discard();
          info!(id = %id, path = %final_path.display(), "artifact installed");
          return Ok(final_path);
        }
        Err(rename_err) => {
          // Someone may have beaten us to this exact artifact, possibly
          // before placing the full-hash symlink: recognize the
          // occupant by its own spec, not just by the link.
          if Self::occupant_is(&final_path, id) || Self::resolve_in(self.ctx.write_store(), id)?.is_some() {
            debug!(id = %id, "concurrent build won the rename; discarding staging");
            self.place_link(&base, full, &full[..len]).ok();
            staging.discard();
            return self
              .resolve_id(id)?
              .ok_or_else(|| StoreError::Integrity {
                message: format!("artifact {id} vanished while adopting a concurrent build"),
              });
          }
          // Occupied by an unrelated artifact: lengthen the prefix.
          if final_path.exists() && len < full.len() {
            len += 1;
            continue;
          }
          return Err(store_io(&final_path)(rename_err));
        }
      }
    }
  }

  /// Whether the directory at `path` is an installed copy of `id`: its
  /// `build.json` re-hashes to the same artifact id.
  fn occupant_is(path: &Path, id: &ArtifactId) -> bool {
    let Ok(raw) = fs::read(path.join(BUILD_SPEC_FILENAME)) else {
      return false;
    };
    BuildSpec::from_json(&raw)
      .and_then(|spec| spec.artifact_id())
      .map(|other| other == *id)
      .unwrap_or(false)
  }

  fn place_link(&self, base: &Path, full: &str, short: &str) -> Result<(), StoreError> {
    let link_path = base.join(full);
    match std::os::unix::fs::symlink(short, &link_path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
        // Tolerate a concurrent identical link, reject anything else.
        let target = fs::read_link(&link_path).map_err(store_io(&link_path))?;
        if target.to_string_lossy() == short {
          Ok(())
        } else {
          Err(StoreError::Integrity {
            message: format!(
              "full-hash symlink {} already points elsewhere ({})",
              link_path.display(),
              target.display()
            ),
          })
        }
      }
      Err(e) => Err(store_io(&link_path)(e)),
    }
  }
}

struct Staging {
  root: PathBuf,
  work: PathBuf,
  pkg: PathBuf,
}

impl Staging {
  /// Remove what is left of the staging area. Failures only warn; a
  /// stray staging dir is debris, not corruption.
  fn discard(self) {
    if let Err(e) = fs::remove_dir_all(&self.root) {
      warn!(path = %self.root.display(), error = %e, "failed to clean staging directory");
    }
  }
}

fn compress_log(src: &Path, dst: &Path) -> Result<(), StoreError> {
  let contents = fs::read(src).map_err(store_io(src))?;
  let file = fs::File::create(dst).map_err(store_io(dst))?;
  let mut encoder = GzEncoder::new(file, Compression::default());
  encoder.write_all(&contents).map_err(store_io(dst))?;
  encoder.finish().map_err(store_io(dst))?;
  Ok(())
}

/// The closed set of in-tree helpers reachable via the `hit` command
/// token inside build jobs.
struct StoreBuiltins<'a> {
  store: &'a BuildStore,
}

impl job::BuiltinDispatch for StoreBuiltins<'_> {
  fn run(&self, argv: &[String], env: &BTreeMap<String, String>, log: &mut dyn Write) -> Result<(), JobError> {
    let builtin_err = |message: String| JobError::Builtin { message };

    match argv.first().map(String::as_str) {
      Some("assemble-profile") => {
        profile::assemble_builtin(self.store, env, log).map_err(|e| builtin_err(e.to_string()))
      }
      Some("rewrite-shebangs") => {
        let artifact = env
          .get("ARTIFACT")
          .ok_or_else(|| builtin_err("ARTIFACT not set".to_string()))?;
        let changed = links::rewrite_shebangs(Path::new(artifact)).map_err(|e| builtin_err(e.to_string()))?;
        writeln!(log, "rewrote {changed} shebang(s)").ok();
        Ok(())
      }
      other => Err(builtin_err(format!("unknown builtin {:?}", other.unwrap_or("")))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::ARTIFACT_META_FILENAME;
  use crate::hash::Digest;
  use crate::source::Scheme;
  use serde_json::json;
  use tempfile::TempDir;

  fn store() -> (BuildStore, TempDir) {
    let temp = TempDir::new().unwrap();
    let ctx = StoreContext::under(temp.path());
    (BuildStore::new(ctx), temp)
  }

  fn sh_spec(name: &str, version: &str, script: &str) -> BuildSpec {
    // Tests bind a fake "unix" artifact so the sandbox rule holds.
    let raw = json!({
      "name": name,
      "version": version,
      "build": {
        "import": [{"ref": "UNIX", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${UNIX}/sh", "-c", script]}]
      }
    });
    BuildSpec::from_json(&serde_json::to_vec(&raw).unwrap()).unwrap()
  }

  /// Install an artifact standing in for `virtual:unix`, with a `sh`
  /// symlink to the host shell.
  fn install_unix_virtual(store: &BuildStore) -> (String, BTreeMap<String, ArtifactId>) {
    let raw = json!({
      "name": "unix",
      "version": "host",
      "build": {"import": [], "commands": []}
    });
    let spec = BuildSpec::from_json(&serde_json::to_vec(&raw).unwrap()).unwrap();
    let dir = store.build(&spec, &BTreeMap::new()).unwrap();
    std::os::unix::fs::symlink("/bin/sh", dir.join("sh")).unwrap();
    let id = spec.artifact_id().unwrap();
    (dir.to_string_lossy().to_string(), BTreeMap::from([("unix".to_string(), id)]))
  }

  #[test]
  fn build_installs_and_rehits_cache() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("hello", "1.0", "mkdir -p $ARTIFACT/bin && echo hi > $ARTIFACT/bin/greeting");
    let dir = store.build(&spec, &virtuals).unwrap();

    assert!(dir.join(BUILD_SPEC_FILENAME).is_file());
    assert!(dir.join(ARTIFACT_META_FILENAME).is_file());
    assert!(dir.join(BUILD_LOG_GZ_FILENAME).is_file());
    assert_eq!(fs::read_to_string(dir.join("bin/greeting")).unwrap().trim(), "hi");

    // Second build is a pure cache hit: same directory, no new staging.
    let again = store.build(&spec, &virtuals).unwrap();
    assert_eq!(again, dir);
    let bld = store.context().write_store().join("bld/hello/1.0");
    assert!(fs::read_dir(&bld).map(|mut d| d.next().is_none()).unwrap_or(true));
  }

  #[test]
  fn installed_spec_rehashes_to_its_id() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("rehash", "1.0", "true");
    let id = spec.artifact_id().unwrap();
    let dir = store.build(&spec, &virtuals).unwrap();

    let stored = BuildSpec::from_json(&fs::read(dir.join(BUILD_SPEC_FILENAME)).unwrap()).unwrap();
    assert_eq!(stored.artifact_id().unwrap(), id);
  }

  #[test]
  fn full_hash_symlink_points_at_short_dir() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("linked", "2.1", "true");
    let id = spec.artifact_id().unwrap();
    let dir = store.build(&spec, &virtuals).unwrap();

    let base = dir.parent().unwrap();
    let link = base.join(&id.digest.0);
    let target = fs::read_link(&link).unwrap();
    assert!(id.digest.0.starts_with(&*target.to_string_lossy()));
    assert_eq!(base.join(target), dir);
  }

  #[test]
  fn resolve_short_form() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("shorty", "1.0", "true");
    let id = spec.artifact_id().unwrap();
    let dir = store.build(&spec, &virtuals).unwrap();

    let short_id = ArtifactId::new("shorty", "1.0", Digest(id.digest.0[..4].to_string()));
    assert_eq!(store.resolve_id(&short_id).unwrap(), Some(dir));
  }

  #[test]
  fn corrupt_full_hash_symlink_is_integrity_error() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("corrupt", "1.0", "true");
    let id = spec.artifact_id().unwrap();
    let dir = store.build(&spec, &virtuals).unwrap();
    let base = dir.parent().unwrap();

    let link = base.join(&id.digest.0);
    fs::remove_file(&link).unwrap();
    std::os::unix::fs::symlink("nowhere", &link).unwrap();

    assert!(matches!(store.resolve_id(&id), Err(StoreError::Integrity { .. })));
  }

  #[test]
  fn failed_build_leaves_no_artifact_but_keeps_staging() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("broken", "1.0", "echo diagnostics && exit 7");
    let err = store.build(&spec, &virtuals).unwrap_err();

    let StoreError::BuildFailed {
      stage, log_path, source, ..
    } = err
    else {
      panic!("expected BuildFailed");
    };
    assert_eq!(stage, "run-commands");
    assert!(matches!(source, JobError::CommandFailed { code: Some(7), .. }));

    // No artifact appeared.
    assert_eq!(store.resolve_spec(&spec).unwrap(), None);
    // The log survives for inspection.
    assert!(log_path.is_file());
    assert!(fs::read_to_string(&log_path).unwrap().contains("diagnostics"));
  }

  #[test]
  fn unresolved_concrete_import_is_an_error() {
    let (store, _temp) = store();
    let raw = json!({
      "name": "needy",
      "build": {
        "import": [{"ref": "DEP", "id": "missing/1.0/AbCdEf0123456789_-AbCdEf012"}],
        "commands": [{"cmd": ["${DEP}/bin/tool"]}]
      }
    });
    let spec = BuildSpec::from_json(&serde_json::to_vec(&raw).unwrap()).unwrap();

    let err = store.build(&spec, &BTreeMap::new()).unwrap_err();
    assert!(matches!(err, StoreError::UnresolvedImport { .. }));
  }

  #[test]
  fn unresolved_virtual_import_is_an_error() {
    let (store, _temp) = store();
    let spec = sh_spec("novirt", "1.0", "true");
    let err = store.build(&spec, &BTreeMap::new()).unwrap_err();
    assert!(matches!(err, StoreError::UnresolvedImport { id } if id == "virtual:unix"));
  }

  #[test]
  fn import_env_is_exported() {
    let (store, _temp) = store();
    let (unix_dir, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec(
      "envcheck",
      "1.0",
      "echo $UNIX > $ARTIFACT/unix.txt && echo $UNIX_id > $ARTIFACT/unix_id.txt && echo $HDIST_VIRTUALS > $ARTIFACT/virtuals.txt",
    );
    let dir = store.build(&spec, &virtuals).unwrap();

    assert_eq!(fs::read_to_string(dir.join("unix.txt")).unwrap().trim(), unix_dir);
    assert_eq!(
      fs::read_to_string(dir.join("unix_id.txt")).unwrap().trim(),
      virtuals["unix"].to_string()
    );
    assert!(
      fs::read_to_string(dir.join("virtuals.txt"))
        .unwrap()
        .contains(&format!("virtual:unix={}", virtuals["unix"]))
    );
  }

  #[test]
  fn sources_are_unpacked_into_the_build_dir() {
    let (store, temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let payload = temp.path().join("payload");
    fs::create_dir_all(payload.join("src")).unwrap();
    fs::write(payload.join("src/input.txt"), "from source").unwrap();
    let cache = SourceCache::new(store.context().write_source_cache());
    let key = cache.put_dir(&payload).unwrap();

    let raw = json!({
      "name": "consumer",
      "version": "1.0",
      "sources": [{"key": key.to_string(), "target": "."}],
      "build": {
        "import": [{"ref": "UNIX", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${UNIX}/sh", "-c", "cp src/input.txt $ARTIFACT/copied.txt"]}]
      }
    });
    let spec = BuildSpec::from_json(&serde_json::to_vec(&raw).unwrap()).unwrap();
    let dir = store.build(&spec, &virtuals).unwrap();

    assert_eq!(fs::read_to_string(dir.join("copied.txt")).unwrap(), "from source");
  }

  #[test]
  fn missing_source_key_fails_before_running_commands() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let raw = json!({
      "name": "nosource",
      "sources": [{"key": format!("{}:{}", Scheme::TarGz, "NoSuchDigest0000000000000000")}],
      "build": {
        "import": [{"ref": "UNIX", "id": "virtual:unix"}],
        "commands": [{"cmd": ["${UNIX}/sh", "-c", "true"]}]
      }
    });
    let spec = BuildSpec::from_json(&serde_json::to_vec(&raw).unwrap()).unwrap();

    let err = store.build(&spec, &virtuals).unwrap_err();
    assert!(matches!(err, StoreError::Source(SourceError::SourceNotFound { .. })));
  }

  #[test]
  fn nohash_env_variant_is_a_cache_hit() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("tunable", "1.0", "true");
    let dir = store.build(&spec, &virtuals).unwrap();

    let mut tuned = spec.clone();
    tuned.build.env_nohash.insert("MAKEFLAGS".to_string(), "-j4".to_string());
    let dir2 = store.build(&tuned, &virtuals).unwrap();
    assert_eq!(dir, dir2);
  }

  #[test]
  fn version_bump_installs_beside_the_old_artifact() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let old = store.build(&sh_spec("zlib", "1.2.6", "true"), &virtuals).unwrap();
    let new = store.build(&sh_spec("zlib", "1.2.7", "true"), &virtuals).unwrap();

    assert_ne!(old, new);
    assert!(old.is_dir());
    assert!(new.is_dir());
  }

  #[test]
  fn short_hash_collision_lengthens_the_prefix() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("clash", "1.0", "true");
    let id = spec.artifact_id().unwrap();

    // An unrelated occupant of the 4-char prefix directory.
    let base = BuildStore::artifact_base(store.context().write_store(), &id);
    let occupied = base.join(&id.digest.0[..4]);
    fs::create_dir_all(&occupied).unwrap();
    fs::write(occupied.join("squatter"), "x").unwrap();

    let dir = store.build(&spec, &virtuals).unwrap();

    // The new artifact landed on a longer prefix, both coexist, and the
    // full-hash symlink resolves to the right one.
    assert_eq!(dir, base.join(&id.digest.0[..5]));
    assert!(occupied.join("squatter").exists());
    assert_eq!(store.resolve_id(&id).unwrap(), Some(dir));
  }

  #[test]
  fn artifacts_lists_installed_entries() {
    let (store, _temp) = store();
    let (_unix, virtuals) = install_unix_virtual(&store);

    let spec = sh_spec("listed", "1.0", "true");
    let id = spec.artifact_id().unwrap();
    store.build(&spec, &virtuals).unwrap();

    let all = store.artifacts().unwrap();
    assert!(all.iter().any(|a| a.id == id));
    // The unix helper artifact is listed too.
    assert_eq!(all.len(), 2);
  }
}
