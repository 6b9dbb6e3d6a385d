//! Canonical hashing shared by every hashing site.
//!
//! This module provides:
//! - `Digest`: a truncated SHA-256 digest, URL-safe base64 without padding
//! - `hash_document()`: canonical hashing of heterogeneous JSON documents
//! - `hash_bytes()` / `hash_file()`: typed raw-byte leaves
//! - `hash_tree()`: deterministic directory hashing
//!
//! The canonical byte stream prefixes every node with a one-byte type tag;
//! mappings are emitted with keys in sorted order, lists preserve order,
//! and all variable-length payloads carry a big-endian u32 length prefix.
//! Identical documents therefore hash identically on every host.

use std::fs;
use std::io::Read;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use walkdir::WalkDir;

use crate::consts::DIGEST_NBYTES;

/// Errors from canonical hashing.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
  /// The document contains a value outside the canonical model
  /// (e.g. a float). Fatal for the caller.
  #[error("invalid hash input: {reason}")]
  InvalidHashInput { reason: String },

  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },
}

/// A content-addressed digest: the first [`DIGEST_NBYTES`] bytes of
/// SHA-256, URL-safe base64 encoded without padding.
///
/// # Format
///
/// 27 characters from `[A-Za-z0-9_-]`, e.g. `"+pychjjZ0Seug9EhgRjb7ZBpbGs"`
/// minus the scheme prefix a [`SourceKey`](crate::source::SourceKey) adds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub String);

impl Digest {
  fn from_sha(sha: Sha256) -> Self {
    let full = sha.finalize();
    Digest(URL_SAFE_NO_PAD.encode(&full[..DIGEST_NBYTES]))
  }
}

impl std::fmt::Display for Digest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

// Node type tags of the canonical stream.
const TAG_NULL: u8 = b'n';
const TAG_BOOL: u8 = b'b';
const TAG_INT: u8 = b'i';
const TAG_STRING: u8 = b's';
const TAG_LIST: u8 = b'l';
const TAG_DICT: u8 = b'd';
const TAG_RAW: u8 = b'r';

fn emit_len(out: &mut Vec<u8>, len: usize) {
  out.extend_from_slice(&(len as u32).to_be_bytes());
}

fn emit_string(out: &mut Vec<u8>, s: &str) {
  out.push(TAG_STRING);
  emit_len(out, s.len());
  out.extend_from_slice(s.as_bytes());
}

/// Serialize a document into the canonical byte stream.
pub fn canonical_bytes(doc: &Value, out: &mut Vec<u8>) -> Result<(), HashError> {
  match doc {
    Value::Null => out.push(TAG_NULL),
    Value::Bool(b) => {
      out.push(TAG_BOOL);
      out.push(*b as u8);
    }
    Value::Number(n) => {
      // Only integers have a canonical representation.
      let Some(i) = n.as_i64().map(|i| i.to_string()).or_else(|| n.as_u64().map(|u| u.to_string())) else {
        return Err(HashError::InvalidHashInput {
          reason: format!("non-integer number {}", n),
        });
      };
      out.push(TAG_INT);
      emit_len(out, i.len());
      out.extend_from_slice(i.as_bytes());
    }
    Value::String(s) => emit_string(out, s),
    Value::Array(items) => {
      out.push(TAG_LIST);
      emit_len(out, items.len());
      for item in items {
        canonical_bytes(item, out)?;
      }
    }
    Value::Object(map) => {
      out.push(TAG_DICT);
      emit_len(out, map.len());
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      for key in keys {
        emit_string(out, key);
        canonical_bytes(&map[key], out)?;
      }
    }
  }
  Ok(())
}

/// Hash a structured document.
///
/// The digest is a pure function of the document's canonical form: key
/// order in mappings does not matter, list order does.
pub fn hash_document(doc: &Value) -> Result<Digest, HashError> {
  let mut bytes = Vec::new();
  canonical_bytes(doc, &mut bytes)?;
  let mut sha = Sha256::new();
  sha.update(&bytes);
  Ok(Digest::from_sha(sha))
}

/// Hash arbitrary bytes as a `RawBytes` leaf.
pub fn hash_bytes(data: &[u8]) -> Digest {
  let mut sha = Sha256::new();
  sha.update([TAG_RAW]);
  sha.update((data.len() as u64).to_be_bytes());
  sha.update(data);
  Digest::from_sha(sha)
}

/// Hash a file's contents as a `Path` leaf, streaming.
pub fn hash_file(path: &Path) -> Result<Digest, HashError> {
  let read_err = |source| HashError::Read {
    path: path.display().to_string(),
    source,
  };

  let meta = fs::metadata(path).map_err(read_err)?;
  let mut file = fs::File::open(path).map_err(read_err)?;

  let mut sha = Sha256::new();
  sha.update([TAG_RAW]);
  sha.update(meta.len().to_be_bytes());

  let mut buffer = [0u8; 8192];
  loop {
    let n = file.read(&mut buffer).map_err(read_err)?;
    if n == 0 {
      break;
    }
    sha.update(&buffer[..n]);
  }

  Ok(Digest::from_sha(sha))
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers file contents, directory structure, and symlink
/// targets; timestamps, owners and permissions are ignored. Entries are
/// sorted by relative path for determinism. Names listed in `exclude`
/// are skipped wherever they appear.
pub fn hash_tree(root: &Path, exclude: &[&str]) -> Result<Digest, HashError> {
  let mut entries: Vec<String> = Vec::new();

  let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| HashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(root)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();
    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let line = if file_type.is_symlink() {
      // Symlinks before files: read_link, never follow.
      let target = fs::read_link(entry_path).map_err(|e| HashError::Read {
        path: entry_path.display().to_string(),
        source: e,
      })?;
      format!("L:{}:{}", rel_path, hash_bytes(target.to_string_lossy().as_bytes()))
    } else if file_type.is_file() {
      format!("F:{}:{}", rel_path, hash_file(entry_path)?)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else {
      // Sockets, devices and friends have no canonical form.
      continue;
    };

    entries.push(line);
  }

  entries.sort();

  let mut sha = Sha256::new();
  for line in entries {
    sha.update(line.as_bytes());
    sha.update(b"\n");
  }
  Ok(Digest::from_sha(sha))
}
