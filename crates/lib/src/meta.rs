//! Artifact install metadata (`artifact.json`).
//!
//! Every installed artifact carries an immutable `artifact.json` at its
//! root: how to install it into a profile, what it needs at use time,
//! and what it exports into the environment of profiles and importing
//! builds.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::consts::ARTIFACT_META_FILENAME;
use crate::links::LinkRule;
use crate::spec::ArtifactId;

#[derive(Debug, Error)]
pub enum MetaError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("malformed {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// Parameters of an artifact's `install` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstallParameters {
  /// Link rules processed in order at profile-assembly time.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub links: Vec<LinkRule>,
  /// Anything else is opaque to the core and passed through.
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

/// One install-time command: argv plus optional environment
/// overrides. `$ARTIFACT` and `$PROFILE` are substituted in both; the
/// first token must be the in-tree `hit` helper or an `$ARTIFACT`
/// path, so the process image comes from the artifact itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallCommand {
  pub cmd: Vec<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
}

/// The `install` block: what to run when the artifact is composed into
/// a profile. Link rules apply first, then the commands, in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstallSpec {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub commands: Vec<InstallCommand>,
  #[serde(default)]
  pub parameters: InstallParameters,
  /// Verbatim passthrough of unrecognized install keys.
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

/// `artifact.json`. Immutable once installed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMeta {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub install: Option<InstallSpec>,

  /// Artifacts transitively required when this one is used.
  #[serde(default, rename = "runtime-dependencies", skip_serializing_if = "Vec::is_empty")]
  pub runtime_dependencies: Vec<ArtifactId>,

  /// Exported when the artifact is part of a profile.
  #[serde(default, rename = "profile-env-vars", skip_serializing_if = "BTreeMap::is_empty")]
  pub profile_env_vars: BTreeMap<String, String>,

  /// How importing builds adjust their environment for this artifact:
  /// variable name to relative subdirectories prepended PATH-style,
  /// e.g. `{"PATH": ["bin"]}`.
  #[serde(default, rename = "import-modify-env", skip_serializing_if = "BTreeMap::is_empty")]
  pub import_modify_env: BTreeMap<String, Vec<String>>,

  /// How each `virtual:` import was resolved when this artifact was
  /// built. GC follows these edges; the hash never saw them.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub virtuals: BTreeMap<String, ArtifactId>,

  /// Verbatim passthrough of anything else the spec put in
  /// `profile_install`.
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

impl ArtifactMeta {
  /// Read `artifact.json` from an artifact directory. A missing file is
  /// an empty meta, not an error: artifacts without install metadata
  /// are legal.
  pub fn read(artifact_dir: &Path) -> Result<Self, MetaError> {
    let path = artifact_dir.join(ARTIFACT_META_FILENAME);
    let contents = match fs::read(&path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ArtifactMeta::default()),
      Err(source) => return Err(MetaError::Read { path, source }),
    };
    serde_json::from_slice(&contents).map_err(|source| MetaError::Parse { path, source })
  }

  pub fn write(&self, artifact_dir: &Path) -> Result<(), MetaError> {
    let path = artifact_dir.join(ARTIFACT_META_FILENAME);
    let mut rendered = serde_json::to_vec_pretty(self).map_err(|source| MetaError::Parse {
      path: path.clone(),
      source,
    })?;
    rendered.push(b'\n');
    fs::write(&path, rendered).map_err(|source| MetaError::Write { path, source })
  }

  /// Seed metadata from the spec's passthrough sub-documents.
  ///
  /// `profile_install` is copied verbatim as the metadata body (its
  /// `install`, `runtime-dependencies` and `profile-env-vars` keys);
  /// `import_modify_env` lands beside it. Neither was part of the hash.
  pub fn from_spec_parts(
    profile_install: Option<&Value>,
    import_modify_env: Option<&Value>,
  ) -> Result<Self, serde_json::Error> {
    let mut meta: ArtifactMeta = match profile_install {
      Some(v) => serde_json::from_value(v.clone())?,
      None => ArtifactMeta::default(),
    };
    if let Some(v) = import_modify_env {
      meta.import_modify_env = serde_json::from_value(v.clone())?;
    }
    Ok(meta)
  }
}
