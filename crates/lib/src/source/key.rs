//! Source keys: `<scheme>:<digest>`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a source entry was obtained and is stored. The scheme is
/// informational for humans; lookup always uses the full key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scheme {
  TarGz,
  TarBz2,
  Zip,
  Git,
  Dir,
  File,
}

impl Scheme {
  pub fn as_str(self) -> &'static str {
    match self {
      Scheme::TarGz => "tar.gz",
      Scheme::TarBz2 => "tar.bz2",
      Scheme::Zip => "zip",
      Scheme::Git => "git",
      Scheme::Dir => "dir",
      Scheme::File => "file",
    }
  }

  /// The retention class GC applies to entries of this scheme.
  pub fn retention_tag(self) -> &'static str {
    match self {
      Scheme::TarGz | Scheme::TarBz2 | Scheme::Zip => "targz",
      Scheme::Git => "git",
      Scheme::Dir => "dir",
      Scheme::File => "file",
    }
  }

  /// Whether entries are packed archive bytes (vs. a tree or raw file).
  pub fn is_archive(self) -> bool {
    matches!(self, Scheme::TarGz | Scheme::TarBz2 | Scheme::Zip)
  }

  /// Infer the scheme from a URL or file name suffix.
  pub fn from_url(url: &str) -> Option<Scheme> {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with(".tar.gz") || trimmed.ends_with(".tgz") {
      Some(Scheme::TarGz)
    } else if trimmed.ends_with(".tar.bz2") || trimmed.ends_with(".tbz2") {
      Some(Scheme::TarBz2)
    } else if trimmed.ends_with(".zip") {
      Some(Scheme::Zip)
    } else if trimmed.ends_with(".git") {
      Some(Scheme::Git)
    } else {
      None
    }
  }
}

impl FromStr for Scheme {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tar.gz" => Ok(Scheme::TarGz),
      "tar.bz2" => Ok(Scheme::TarBz2),
      "zip" => Ok(Scheme::Zip),
      "git" => Ok(Scheme::Git),
      "dir" => Ok(Scheme::Dir),
      "file" => Ok(Scheme::File),
      other => Err(format!("unknown source scheme '{other}'")),
    }
  }
}

impl std::fmt::Display for Scheme {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Content-addressed identifier for fetched source material.
///
/// Git keys carry the full commit sha; all other schemes carry a digest
/// of the unpacked contents (or of the raw bytes, for `file:`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceKey {
  pub scheme: Scheme,
  pub digest: String,
}

impl SourceKey {
  pub fn new(scheme: Scheme, digest: impl Into<String>) -> Self {
    SourceKey {
      scheme,
      digest: digest.into(),
    }
  }
}

impl std::fmt::Display for SourceKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.scheme, self.digest)
  }
}

impl FromStr for SourceKey {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    // The scheme itself may contain '.', so split at the last ':'.
    let (scheme, digest) = s.rsplit_once(':').ok_or_else(|| format!("malformed source key '{s}'"))?;
    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
      return Err(format!("malformed source key digest in '{s}'"));
    }
    Ok(SourceKey {
      scheme: scheme.parse()?,
      digest: digest.to_string(),
    })
  }
}

impl Serialize for SourceKey {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for SourceKey {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}
