//! Build specifications and artifact identity.
//!
//! A [`BuildSpec`] is the declarative document a build is derived from.
//! Its [`ArtifactId`] is a pure function of the canonicalized spec with
//! hash-exempt fields removed: no host path, timestamp or key ordering
//! accident may enter. Identical canonical specs produce bit-identical
//! ids on every machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::consts::DEFAULT_VERSION;
use crate::hash::{self, Digest, HashError};
use crate::job::Job;
use crate::source::SourceKey;

/// Prefix marking an import resolved through the caller's virtuals table.
pub const VIRTUAL_PREFIX: &str = "virtual:";

/// Suffix exempting a key (and everything under it) from hashing.
const NOHASH_SUFFIX: &str = "_nohash";

#[derive(Debug, Error)]
pub enum SpecError {
  /// Schema or regex violation; fatal, user corrective.
  #[error("invalid spec: {reason}")]
  InvalidSpec { reason: String },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("failed to serialize spec: {0}")]
  Serialize(#[from] serde_json::Error),
}

fn invalid(reason: impl Into<String>) -> SpecError {
  SpecError::InvalidSpec { reason: reason.into() }
}

/// Canonical identifier of an installed artifact: `name/version/hash`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactId {
  pub name: String,
  pub version: String,
  pub digest: Digest,
}

impl ArtifactId {
  pub fn new(name: &str, version: &str, digest: Digest) -> Self {
    ArtifactId {
      name: name.to_string(),
      version: version.to_string(),
      digest,
    }
  }
}

impl std::fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}/{}", self.name, self.version, self.digest)
  }
}

impl FromStr for ArtifactId {
  type Err = SpecError;

  /// Accepts the canonical full-hash form and the short form; hash
  /// length is not checked here, resolution decides what it means.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut parts = s.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some(name), Some(version), Some(digest), None) if !name.is_empty() && !digest.is_empty() => {
        validate_name(name)?;
        validate_version(version)?;
        Ok(ArtifactId::new(name, version, Digest(digest.to_string())))
      }
      _ => Err(invalid(format!("malformed artifact id '{s}'"))),
    }
  }
}

impl Serialize for ArtifactId {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for ArtifactId {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// What an import's `id` field names: a concrete artifact, or a
/// `virtual:<alias>` placeholder resolved per invocation. The alias is
/// what enters the hash; the concrete resolution does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportId {
  Concrete(ArtifactId),
  Virtual(String),
}

impl std::fmt::Display for ImportId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ImportId::Concrete(id) => write!(f, "{}", id),
      ImportId::Virtual(alias) => write!(f, "{VIRTUAL_PREFIX}{alias}"),
    }
  }
}

impl FromStr for ImportId {
  type Err = SpecError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some(alias) = s.strip_prefix(VIRTUAL_PREFIX) {
      if alias.is_empty() {
        return Err(invalid("empty virtual alias"));
      }
      Ok(ImportId::Virtual(alias.to_string()))
    } else {
      Ok(ImportId::Concrete(s.parse()?))
    }
  }
}

impl Serialize for ImportId {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for ImportId {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// One entry of a spec's `sources` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
  pub key: SourceKey,
  /// Unpack destination relative to the build directory.
  #[serde(default = "default_target")]
  pub target: String,
  /// Leading path components dropped from archive entries.
  #[serde(default)]
  pub strip: u32,
}

fn default_target() -> String {
  ".".to_string()
}

fn default_version() -> String {
  DEFAULT_VERSION.to_string()
}

/// A complete build specification (`build.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildSpec {
  pub name: String,
  #[serde(default = "default_version")]
  pub version: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub sources: Vec<SourceRef>,
  pub build: Job,
  /// Opaque passthrough into the produced `artifact.json`; excluded
  /// from the artifact hash.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub profile_install: Option<Value>,
  /// Opaque passthrough into the produced `artifact.json`; excluded
  /// from the artifact hash.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub import_modify_env: Option<Value>,
  /// Opaque parameters forwarded to build commands.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parameters: Option<Value>,
}

fn validate_name(name: &str) -> Result<(), SpecError> {
  if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+')) {
    return Err(invalid(format!("name '{name}' must match [A-Za-z0-9_+-]+")));
  }
  Ok(())
}

fn validate_version(version: &str) -> Result<(), SpecError> {
  if !version
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'))
  {
    return Err(invalid(format!("version '{version}' must match [A-Za-z0-9_+.-]*")));
  }
  Ok(())
}

impl BuildSpec {
  /// Parse and validate a spec document.
  pub fn from_json(data: &[u8]) -> Result<Self, SpecError> {
    let spec: BuildSpec = serde_json::from_slice(data).map_err(|e| invalid(e.to_string()))?;
    spec.validate()?;
    Ok(spec)
  }

  /// Schema checks beyond what serde enforces.
  ///
  /// Every command must launch a process image from the sandbox: its
  /// first token is either the in-tree `hit` helper or a `${ref}`
  /// substitution of a declared import.
  pub fn validate(&self) -> Result<(), SpecError> {
    validate_name(&self.name)?;
    validate_version(&self.version)?;

    let mut refs = std::collections::BTreeSet::new();
    for import in &self.build.imports {
      let r = &import.ref_name;
      let valid_ref = !r.is_empty()
        && r.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && r.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
      if !valid_ref {
        return Err(invalid(format!("import ref '{r}' is not a valid variable name")));
      }
      if !refs.insert(r.clone()) {
        return Err(invalid(format!("duplicate import ref '{r}'")));
      }
    }

    for (idx, command) in self.build.commands.iter().enumerate() {
      let Some(first) = command.cmd.first() else {
        return Err(invalid(format!("command #{idx} is empty")));
      };
      if first == crate::consts::SELF_COMMAND {
        continue;
      }
      let sandboxed = first
        .strip_prefix("${")
        .and_then(|rest| rest.split_once('}'))
        .is_some_and(|(name, _)| refs.contains(name));
      if !sandboxed {
        return Err(invalid(format!(
          "command #{idx} starts with '{first}', expected ${{ref}} of a declared import or 'hit'"
        )));
      }
    }

    Ok(())
  }

  /// Canonicalize and derive the spec's identity.
  ///
  /// The hash covers the reduced document: profile metadata dropped,
  /// every `*_nohash` key stripped recursively. Since import ids embed
  /// the full hashes of their artifacts, the id transitively pins every
  /// dependency. The returned bytes are the canonical serialization of
  /// the complete spec, suitable for `build.json`.
  pub fn canonicalize(&self) -> Result<(ArtifactId, Vec<u8>), SpecError> {
    self.validate()?;

    let full = serde_json::to_value(self)?;
    let mut reduced = full.clone();
    strip_for_hash(&mut reduced);

    let digest = hash::hash_document(&reduced)?;
    let id = ArtifactId::new(&self.name, &self.version, digest);

    // serde_json maps are key-sorted, so this is canonical.
    let mut canonical = serde_json::to_vec_pretty(&full)?;
    canonical.push(b'\n');
    Ok((id, canonical))
  }

  /// The artifact id alone.
  pub fn artifact_id(&self) -> Result<ArtifactId, SpecError> {
    Ok(self.canonicalize()?.0)
  }
}

/// Remove everything that must not influence the hash: the profile
/// metadata sub-documents and, recursively, any mapping key ending in
/// `_nohash`.
fn strip_for_hash(doc: &mut Value) {
  if let Value::Object(map) = doc {
    map.remove("profile_install");
    map.remove("import_modify_env");
  }
  strip_nohash(doc);
}

fn strip_nohash(doc: &mut Value) {
  match doc {
    Value::Object(map) => {
      map.retain(|key, _| !key.ends_with(NOHASH_SUFFIX));
      for value in map.values_mut() {
        strip_nohash(value);
      }
    }
    Value::Array(items) => {
      for item in items {
        strip_nohash(item);
      }
    }
    _ => {}
  }
}
