//! Glob-based file selection and link/copy primitives.
//!
//! This is the small DSL the profile assembler interprets: ant-style
//! globs (`**` spans path segments, `*` stays within one) select files
//! under an artifact, and each selection is symlinked, copied or
//! absorbed into the profile. A shebang rewriter makes installed
//! scripts relocatable.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum LinksError {
  #[error("invalid glob pattern '{pattern}': {message}")]
  BadPattern { pattern: String, message: String },

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LinksError + '_ {
  move |source| LinksError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// One rule of an artifact's `install.parameters.links` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkRule {
  pub action: LinkAction,
  /// Ant-style glob evaluated under `prefix`. Absent means the rule
  /// targets `prefix` itself.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub select: Option<String>,
  /// Directory the glob is evaluated under; placeholder-substituted.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub prefix: Option<String>,
  /// Destination under the profile; placeholder-substituted.
  pub target: String,
  /// Whether directories themselves may match the glob.
  #[serde(default)]
  pub dirs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkAction {
  Symlink,
  Copy,
  /// Copy through symlinks: the final target's bytes are materialized.
  Absorb,
  /// Mask matching paths from all later rules.
  Exclude,
}

/// Expand a pattern so that every interior `**` also matches zero path
/// segments (`lib/**/*.so` must match `lib/liba.so`). Glob matching
/// alone treats `a/**/b` as at least one segment, so each `/**/` is
/// additionally collapsed to `/`.
fn ant_variants(pattern: &str) -> Vec<String> {
  let mut variants = vec![pattern.to_string()];
  let mut i = 0;
  while i < variants.len() {
    let variant = variants[i].clone();
    if let Some(rest) = variant.strip_prefix("**/")
      && !rest.is_empty()
      && !variants.contains(&rest.to_string())
    {
      variants.push(rest.to_string());
    }
    let mut from = 0;
    while let Some(pos) = variant[from..].find("/**/") {
      let at = from + pos;
      let collapsed = format!("{}/{}", &variant[..at], &variant[at + 4..]);
      if !variants.contains(&collapsed) {
        variants.push(collapsed);
      }
      from = at + 1;
    }
    i += 1;
  }
  variants
}

fn compile_ant_glob(pattern: &str) -> Result<GlobSet, LinksError> {
  let bad_pattern = |message: String| LinksError::BadPattern {
    pattern: pattern.to_string(),
    message,
  };

  let mut builder = GlobSetBuilder::new();
  for variant in ant_variants(pattern) {
    let glob = GlobBuilder::new(&variant)
      .literal_separator(true)
      .build()
      .map_err(|e| bad_pattern(e.to_string()))?;
    builder.add(glob);
  }
  builder.build().map_err(|e| bad_pattern(e.to_string()))
}

/// Select paths under `root` matching an ant-style glob.
///
/// Returned paths are relative to `root`, sorted. Files and symlinks
/// always qualify; directories only when `dirs` is set.
pub fn select(root: &Path, pattern: &str, dirs: bool) -> Result<Vec<PathBuf>, LinksError> {
  let matcher = compile_ant_glob(pattern)?;

  let mut matches = Vec::new();
  for entry in WalkDir::new(root) {
    let entry = entry.map_err(|e| LinksError::Io {
      path: root.to_path_buf(),
      source: e.into(),
    })?;
    let rel = match entry.path().strip_prefix(root) {
      Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
      _ => continue,
    };
    let is_dir = entry.file_type().is_dir();
    if is_dir && !dirs {
      continue;
    }
    if matcher.is_match(&rel) {
      matches.push(rel);
    }
  }
  matches.sort();
  Ok(matches)
}

fn ensure_parent(path: &Path) -> Result<(), LinksError> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(io_err(parent))?;
  }
  Ok(())
}

/// Create a symlink at `dst` pointing to `src`.
pub fn make_symlink(src: &Path, dst: &Path) -> Result<(), LinksError> {
  ensure_parent(dst)?;
  std::os::unix::fs::symlink(src, dst).map_err(io_err(dst))
}

/// Copy `src` to `dst` as-is (a symlink stays a symlink).
pub fn copy_entry(src: &Path, dst: &Path) -> Result<(), LinksError> {
  ensure_parent(dst)?;
  let meta = fs::symlink_metadata(src).map_err(io_err(src))?;
  if meta.file_type().is_symlink() {
    let target = fs::read_link(src).map_err(io_err(src))?;
    std::os::unix::fs::symlink(target, dst).map_err(io_err(dst))
  } else {
    fs::copy(src, dst).map(|_| ()).map_err(io_err(dst))
  }
}

/// Copy the bytes `src` finally resolves to into `dst`.
pub fn absorb_entry(src: &Path, dst: &Path) -> Result<(), LinksError> {
  ensure_parent(dst)?;
  let resolved = fs::canonicalize(src).map_err(io_err(src))?;
  fs::copy(&resolved, dst).map(|_| ()).map_err(io_err(dst))
}

/// The trampoline written in place of an absolute-interpreter shebang.
///
/// The form is valid sh and still a no-op prologue for the scripting
/// language underneath (the `"true" '''` trick), so the original body
/// can follow unchanged. At runtime the interpreter is resolved through
/// the profile the script is installed into.
fn trampoline(interpreter_basename: &str) -> String {
  format!(
    "#!/bin/sh\n\
     \"true\" '''\\'\n\
     prefix=\"$(cd \"$(dirname \"$0\")/..\" && pwd)\"\n\
     exec \"$prefix/bin/{interp}\" \"$0\" \"$@\"\n\
     '''\n",
    interp = interpreter_basename
  )
}

/// Rewrite one script's shebang to the relocatable multi-line form.
///
/// Returns `None` when the file is not a candidate: no `#!`, a relative
/// interpreter, or `/bin/sh` (already portable, and the form this
/// function itself emits).
pub fn rewrite_shebang(contents: &[u8]) -> Option<Vec<u8>> {
  let text = std::str::from_utf8(contents).ok()?;
  let first_line = text.lines().next()?;
  let mut tokens = first_line.strip_prefix("#!")?.trim().split_whitespace();
  let interp = tokens.next()?;
  if !interp.starts_with('/') || interp == "/bin/sh" {
    return None;
  }
  let basename = match Path::new(interp).file_name()?.to_str()? {
    // `/usr/bin/env python` names its interpreter in the argument.
    "env" => tokens.next()?,
    direct => direct,
  };

  let body_start = text.find('\n').map(|i| i + 1).unwrap_or(text.len());
  let mut rewritten = trampoline(basename).into_bytes();
  rewritten.extend_from_slice(&contents[body_start..]);
  Some(rewritten)
}

/// Rewrite every candidate script under `root`. Returns the number of
/// files changed.
pub fn rewrite_shebangs(root: &Path) -> Result<usize, LinksError> {
  let mut changed = 0;
  for entry in WalkDir::new(root) {
    let entry = entry.map_err(|e| LinksError::Io {
      path: root.to_path_buf(),
      source: e.into(),
    })?;
    if !entry.file_type().is_file() {
      continue;
    }
    let path = entry.path();
    let contents = fs::read(path).map_err(io_err(path))?;
    if let Some(rewritten) = rewrite_shebang(&contents) {
      fs::write(path, rewritten).map_err(io_err(path))?;
      changed += 1;
    }
  }
  Ok(changed)
}
