//! Profile assembly: composing artifacts into a prefix directory.
//!
//! A profile is a Unix-style prefix (`bin`, `lib`, `include`, ...)
//! populated from a set of artifacts. Each artifact's `install` block
//! describes, through link rules, which of its files appear in the
//! profile and how. Profiles are themselves built as artifacts, so they
//! are content-addressed, cached, and visible to GC.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::consts::{BUILD_SPEC_FILENAME, PROFILE_META_FILENAME};
use crate::links::{self, LinkAction, LinkRule, LinksError};
use crate::meta::{ArtifactMeta, InstallCommand, MetaError};
use crate::spec::{ArtifactId, BuildSpec, ImportId, SpecError};
use crate::store::{BuildStore, StoreError};

#[derive(Debug, Error)]
pub enum ProfileError {
  /// Two artifacts want different content at the same profile path.
  #[error("profile conflict at {path}: {first} and {second} disagree")]
  Conflict {
    path: PathBuf,
    first: String,
    second: String,
  },

  #[error("profile env conflict on {var}: '{first}' vs '{second}'")]
  EnvConflict {
    var: String,
    first: String,
    second: String,
  },

  #[error("artifact {id} in the profile closure is not in the store")]
  MissingArtifact { id: String },

  #[error("invalid link rule: {message}")]
  InvalidRule { message: String },

  /// An artifact's install-time command exited non-zero.
  #[error("install command #{index} of {id} exited with {code:?}")]
  InstallCommand {
    id: String,
    index: usize,
    code: Option<i32>,
  },

  #[error(transparent)]
  Store(#[from] Box<StoreError>),

  #[error(transparent)]
  Spec(#[from] SpecError),

  #[error(transparent)]
  Meta(#[from] MetaError),

  #[error(transparent)]
  Links(#[from] LinksError),

  #[error(transparent)]
  Hash(#[from] crate::hash::HashError),

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

fn profile_io(path: &Path) -> impl FnOnce(std::io::Error) -> ProfileError + '_ {
  move |source| ProfileError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Compute the transitive `runtime-dependencies` closure of `roots`,
/// in deterministic discovery order (roots first).
pub fn closure(store: &BuildStore, roots: &[ArtifactId]) -> Result<Vec<(ArtifactId, PathBuf)>, ProfileError> {
  let mut ordered: Vec<(ArtifactId, PathBuf)> = Vec::new();
  let mut seen = std::collections::BTreeSet::new();
  let mut queue: std::collections::VecDeque<ArtifactId> = roots.iter().cloned().collect();

  while let Some(id) = queue.pop_front() {
    if !seen.insert(id.clone()) {
      continue;
    }
    let Some(dir) = store.resolve_id(&id).map_err(Box::new)? else {
      return Err(ProfileError::MissingArtifact { id: id.to_string() });
    };
    let meta = ArtifactMeta::read(&dir)?;
    for dep in &meta.runtime_dependencies {
      queue.push_back(dep.clone());
    }
    ordered.push((id, dir));
  }

  Ok(ordered)
}

/// What has been written at a profile path, for conflict detection.
enum Placed {
  Symlink(PathBuf),
  Contents(crate::hash::Digest),
}

/// Assemble the profile for `roots` into `profile_dir`.
///
/// Rules run per artifact in closure order; within an artifact, in
/// declaration order. Writes colliding on the same profile path are an
/// error unless they resolve to the same symlink target or identical
/// bytes.
pub fn assemble(store: &BuildStore, roots: &[ArtifactId], profile_dir: &Path) -> Result<(), ProfileError> {
  let artifacts = closure(store, roots)?;
  fs::create_dir_all(profile_dir).map_err(profile_io(profile_dir))?;

  let mut placed: BTreeMap<PathBuf, (String, Placed)> = BTreeMap::new();
  let mut env: BTreeMap<String, (String, String)> = BTreeMap::new();

  for (id, artifact_dir) in &artifacts {
    let meta = ArtifactMeta::read(artifact_dir)?;

    if let Some(install) = &meta.install {
      apply_rules(
        id,
        artifact_dir,
        profile_dir,
        &install.parameters.links,
        &mut placed,
      )?;
      // Commands run after the artifact's links so they can
      // post-process what just landed in the profile.
      run_install_commands(id, artifact_dir, profile_dir, &install.commands)?;
    }

    for (var, value) in &meta.profile_env_vars {
      match env.get(var) {
        None => {
          env.insert(var.clone(), (id.to_string(), value.clone()));
        }
        Some((_, existing)) if existing == value => {}
        Some((first, existing)) => {
          return Err(ProfileError::EnvConflict {
            var: var.clone(),
            first: format!("{existing} (from {first})"),
            second: format!("{value} (from {id})"),
          });
        }
      }
    }
  }

  write_profile_meta(profile_dir, &artifacts, &env)?;
  info!(profile = %profile_dir.display(), artifacts = artifacts.len(), "profile assembled");
  Ok(())
}

fn substitute_placeholders(value: &str, artifact_dir: &Path, profile_dir: &Path) -> String {
  value
    .replace("$ARTIFACT", &artifact_dir.to_string_lossy())
    .replace("$PROFILE", &profile_dir.to_string_lossy())
}

fn apply_rules(
  id: &ArtifactId,
  artifact_dir: &Path,
  profile_dir: &Path,
  rules: &[LinkRule],
  placed: &mut BTreeMap<PathBuf, (String, Placed)>,
) -> Result<(), ProfileError> {
  // Paths masked by earlier `exclude` rules, relative to their prefix.
  let mut excluded: std::collections::BTreeSet<PathBuf> = std::collections::BTreeSet::new();

  for rule in rules {
    let prefix = rule
      .prefix
      .as_deref()
      .map(|p| PathBuf::from(substitute_placeholders(p, artifact_dir, profile_dir)))
      .unwrap_or_else(|| artifact_dir.to_path_buf());
    let Some(pattern) = rule.select.as_deref() else {
      return Err(ProfileError::InvalidRule {
        message: format!("rule for {id} has no select pattern"),
      });
    };

    // An empty selection is a valid, empty contribution.
    if !prefix.is_dir() {
      continue;
    }
    let matches = links::select(&prefix, pattern, rule.dirs)?;

    if rule.action == LinkAction::Exclude {
      excluded.extend(matches.into_iter().map(|rel| prefix.join(rel)));
      continue;
    }

    let target_root = PathBuf::from(substitute_placeholders(&rule.target, artifact_dir, profile_dir));
    for rel in matches {
      let src = prefix.join(&rel);
      if excluded.contains(&src) {
        continue;
      }
      let dst = target_root.join(&rel);
      place(id, rule.action, &src, &dst, placed)?;
    }
  }

  Ok(())
}

/// Run an artifact's install-time commands inside a scrubbed assembly
/// environment: only `ARTIFACT`, `PROFILE` and an empty `PATH` are
/// set, plus the command's own `env`. The first token must be `hit` or
/// an `$ARTIFACT` path, mirroring the build-time sandbox rule.
fn run_install_commands(
  id: &ArtifactId,
  artifact_dir: &Path,
  profile_dir: &Path,
  commands: &[InstallCommand],
) -> Result<(), ProfileError> {
  for (index, command) in commands.iter().enumerate() {
    let Some(first) = command.cmd.first() else {
      return Err(ProfileError::InvalidRule {
        message: format!("install command #{index} of {id} is empty"),
      });
    };
    if first != "hit" && !first.starts_with("$ARTIFACT") {
      return Err(ProfileError::InvalidRule {
        message: format!("install command #{index} of {id} must start with 'hit' or an $ARTIFACT path, got '{first}'"),
      });
    }

    let argv: Vec<String> = command
      .cmd
      .iter()
      .map(|token| substitute_placeholders(token, artifact_dir, profile_dir))
      .collect();
    debug!(id = %id, command = %argv.join(" "), "running install command");

    if argv[0] == "hit" {
      run_install_builtin(&argv[1..], profile_dir)?;
      continue;
    }

    let mut env: BTreeMap<String, String> = BTreeMap::from([
      ("ARTIFACT".to_string(), artifact_dir.to_string_lossy().to_string()),
      ("PROFILE".to_string(), profile_dir.to_string_lossy().to_string()),
      ("PATH".to_string(), String::new()),
    ]);
    for (key, value) in &command.env {
      env.insert(key.clone(), substitute_placeholders(value, artifact_dir, profile_dir));
    }

    let output = std::process::Command::new(&argv[0])
      .args(&argv[1..])
      .current_dir(profile_dir)
      .env_clear()
      .envs(&env)
      .output()
      .map_err(|e| ProfileError::Io {
        path: PathBuf::from(&argv[0]),
        source: e,
      })?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "install command stderr");
      }
      return Err(ProfileError::InstallCommand {
        id: id.to_string(),
        index,
        code: output.status.code(),
      });
    }
  }

  Ok(())
}

/// The `hit` helpers available to install commands. Closed set, like
/// the build-time builtins.
fn run_install_builtin(argv: &[String], profile_dir: &Path) -> Result<(), ProfileError> {
  match argv.first().map(String::as_str) {
    Some("rewrite-shebangs") => {
      let dir = argv.get(1).map(PathBuf::from).unwrap_or_else(|| profile_dir.to_path_buf());
      let changed = links::rewrite_shebangs(&dir)?;
      debug!(changed, dir = %dir.display(), "rewrote shebangs");
      Ok(())
    }
    other => Err(ProfileError::InvalidRule {
      message: format!("unknown install builtin {:?}", other.unwrap_or("")),
    }),
  }
}

fn place(
  id: &ArtifactId,
  action: LinkAction,
  src: &Path,
  dst: &Path,
  placed: &mut BTreeMap<PathBuf, (String, Placed)>,
) -> Result<(), ProfileError> {
  let incoming = match action {
    LinkAction::Symlink => Placed::Symlink(src.to_path_buf()),
    LinkAction::Copy | LinkAction::Absorb => {
      let resolved = if action == LinkAction::Absorb {
        fs::canonicalize(src).map_err(profile_io(src))?
      } else {
        src.to_path_buf()
      };
      Placed::Contents(crate::hash::hash_file(&resolved)?)
    }
    LinkAction::Exclude => unreachable!("exclude handled by caller"),
  };

  if let Some((first, existing)) = placed.get(dst) {
    let compatible = match (existing, &incoming) {
      (Placed::Symlink(a), Placed::Symlink(b)) => a == b,
      (Placed::Contents(a), Placed::Contents(b)) => a == b,
      _ => false,
    };
    if !compatible {
      return Err(ProfileError::Conflict {
        path: dst.to_path_buf(),
        first: first.clone(),
        second: id.to_string(),
      });
    }
    debug!(path = %dst.display(), "identical contribution, skipping");
    return Ok(());
  }

  match action {
    LinkAction::Symlink => links::make_symlink(src, dst)?,
    LinkAction::Copy => links::copy_entry(src, dst)?,
    LinkAction::Absorb => links::absorb_entry(src, dst)?,
    LinkAction::Exclude => unreachable!(),
  }
  placed.insert(dst.to_path_buf(), (id.to_string(), incoming));
  Ok(())
}

#[derive(Serialize)]
struct ProfileMeta<'a> {
  artifacts: Vec<String>,
  env: BTreeMap<&'a String, &'a String>,
}

fn write_profile_meta(
  profile_dir: &Path,
  artifacts: &[(ArtifactId, PathBuf)],
  env: &BTreeMap<String, (String, String)>,
) -> Result<(), ProfileError> {
  let meta = ProfileMeta {
    artifacts: artifacts.iter().map(|(id, _)| id.to_string()).collect(),
    env: env.iter().map(|(var, (_, value))| (var, value)).collect(),
  };
  let path = profile_dir.join(PROFILE_META_FILENAME);
  let mut rendered = serde_json::to_vec_pretty(&meta).expect("profile meta serializes");
  rendered.push(b'\n');
  fs::write(&path, rendered).map_err(profile_io(&path))
}

/// Synthesize the spec of a profile artifact over `roots`.
///
/// The single command invokes the in-tree assembly builtin; the imports
/// pin every root artifact's hash, so the profile id changes exactly
/// when its membership does.
pub fn profile_spec(roots: &[ArtifactId]) -> Result<BuildSpec, SpecError> {
  let imports = roots
    .iter()
    .enumerate()
    .map(|(i, id)| crate::job::Import {
      ref_name: format!("ROOT_{i}"),
      id: ImportId::Concrete(id.clone()),
      before: Vec::new(),
    })
    .collect();

  let raw = json!({
    "name": "profile",
    "build": {
      "commands": [{"cmd": ["hit", "assemble-profile"]}]
    }
  });
  let mut spec: BuildSpec = serde_json::from_value(raw).expect("profile spec template parses");
  spec.build.imports = imports;
  spec.validate()?;
  Ok(spec)
}

/// Build (or re-resolve) the profile artifact for `roots`.
pub fn build_profile(store: &BuildStore, roots: &[ArtifactId]) -> Result<PathBuf, ProfileError> {
  let spec = profile_spec(roots)?;
  store.build(&spec, &BTreeMap::new()).map_err(Box::new).map_err(Into::into)
}

/// The `hit assemble-profile` builtin, running inside a profile build:
/// reads the spec beside `$ARTIFACT`, takes its imports as roots, and
/// assembles into `$ARTIFACT`.
pub fn assemble_builtin(
  store: &BuildStore,
  env: &BTreeMap<String, String>,
  log: &mut dyn Write,
) -> Result<(), ProfileError> {
  let artifact = env.get("ARTIFACT").ok_or_else(|| ProfileError::InvalidRule {
    message: "ARTIFACT not set".to_string(),
  })?;
  let artifact_dir = PathBuf::from(artifact);

  let spec_path = artifact_dir.join(BUILD_SPEC_FILENAME);
  let spec = BuildSpec::from_json(&fs::read(&spec_path).map_err(profile_io(&spec_path))?)?;

  let virtuals = parse_virtuals(env.get("HDIST_VIRTUALS").map(String::as_str).unwrap_or(""));
  let mut roots = Vec::with_capacity(spec.build.imports.len());
  for import in &spec.build.imports {
    let id = match &import.id {
      ImportId::Concrete(id) => id.clone(),
      ImportId::Virtual(alias) => virtuals
        .get(alias)
        .cloned()
        .ok_or_else(|| ProfileError::MissingArtifact {
          id: format!("virtual:{alias}"),
        })?,
    };
    roots.push(id);
  }

  assemble(store, &roots, &artifact_dir)?;
  writeln!(log, "assembled profile over {} artifact(s)", roots.len()).ok();
  Ok(())
}

/// Parse the `HDIST_VIRTUALS` encoding (`virtual:a=id;virtual:b=id`).
fn parse_virtuals(encoded: &str) -> BTreeMap<String, ArtifactId> {
  let mut out = BTreeMap::new();
  for part in encoded.split(';').filter(|p| !p.is_empty()) {
    if let Some((alias, id)) = part.split_once('=')
      && let Some(alias) = alias.strip_prefix("virtual:")
      && let Ok(id) = id.parse()
    {
      out.insert(alias.to_string(), id);
    }
  }
  out
}
