//! Content-addressed source cache.
//!
//! Fetches, stores and unpacks the material builds consume: tarballs,
//! zip archives, git trees, plain files and directory snapshots. Every
//! entry is keyed by a [`SourceKey`]; re-fetching existing content is a
//! no-op and unpacking verifies the content still hashes to its key.
//!
//! # Layout
//!
//! ```text
//! source/
//! ├── packs/<scheme>/<digest>   archive or raw-file bytes
//! ├── dir/<digest>/             directory snapshots
//! ├── git/pool.git              shared git object pool
//! ├── quarantine/               corrupt entries set aside
//! ├── tmp/                      same-filesystem staging
//! └── index.json                url map + retention tags
//! ```

mod archive;
mod git;
mod key;

pub use key::{Scheme, SourceKey};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::hash::{self, HashError};

const INDEX_FILENAME: &str = "index.json";

#[derive(Debug, Error)]
pub enum SourceError {
  #[error("source not found: {key}")]
  SourceNotFound { key: String },

  /// Network or transport failure; the one retryable class.
  #[error("fetch failed for {url}: {message}")]
  Fetch { url: String, message: String },

  /// Stored content no longer hashes to its key. The entry has been
  /// quarantined.
  #[error("corrupt source {key}: content hashes to {actual}")]
  CorruptSource { key: String, actual: String },

  /// The URL served different content than the key on record. Re-fetch
  /// with rehashing to accept the new content.
  #[error("content at {url} changed: cached key {stored}, fetched content is {fetched}")]
  UrlContentChanged { url: String, stored: String, fetched: String },

  #[error("cannot infer a source scheme from url '{url}'")]
  UnknownScheme { url: String },

  #[error("unpack failed: {message}")]
  Unpack { message: String },

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to open git pool at {path}: {message}")]
  GitOpen { path: PathBuf, message: String },

  #[error("git fetch from {url} failed: {message}")]
  GitFetch { url: String, message: String },

  #[error("git revision '{rev}' not found")]
  GitRevisionNotFound { rev: String },

  #[error("git checkout of {rev} failed: {message}")]
  GitCheckout { rev: String, message: String },

  #[error("git pool lock: {message}")]
  GitPool { message: String },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("malformed source index {path}: {source}")]
  IndexParse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

impl SourceError {
  fn io(path: &Path, source: std::io::Error) -> Self {
    SourceError::Io {
      path: path.to_path_buf(),
      source,
    }
  }

  fn unpack(e: impl std::fmt::Display) -> Self {
    SourceError::Unpack { message: e.to_string() }
  }

  /// Transient transport failures may be retried; everything else is
  /// fatal for the caller.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SourceError::Fetch { .. } | SourceError::GitFetch { .. })
  }
}

/// Per-key bookkeeping in the index sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntryInfo {
  /// Retention class applied by GC.
  pub tag: String,
  /// Unix seconds of the last fetch or put.
  pub fetched_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SourceIndex {
  /// URL to key, for fast re-lookup without downloading.
  #[serde(default)]
  urls: BTreeMap<String, String>,
  #[serde(default)]
  entries: BTreeMap<String, SourceEntryInfo>,
}

/// A source cache bound to one cache root.
pub struct SourceCache {
  root: PathBuf,
}

impl SourceCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    SourceCache { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn pack_path(&self, key: &SourceKey) -> PathBuf {
    self.root.join("packs").join(key.scheme.as_str()).join(&key.digest)
  }

  fn dir_path(&self, digest: &str) -> PathBuf {
    self.root.join("dir").join(digest)
  }

  fn tmp_dir(&self) -> Result<tempfile::TempDir, SourceError> {
    let tmp = self.root.join("tmp");
    fs::create_dir_all(&tmp).map_err(|e| SourceError::io(&tmp, e))?;
    tempfile::tempdir_in(&tmp).map_err(|e| SourceError::io(&tmp, e))
  }

  /// Whether `key` is present in the cache.
  pub fn contains(&self, key: &SourceKey) -> bool {
    match key.scheme {
      Scheme::Git => git::has_commit(&self.root, &key.digest),
      Scheme::Dir => self.dir_path(&key.digest).is_dir(),
      _ => self.pack_path(key).is_file(),
    }
  }

  // === index sidecar ===

  fn index_path(&self) -> PathBuf {
    self.root.join(INDEX_FILENAME)
  }

  fn load_index(&self) -> Result<SourceIndex, SourceError> {
    let path = self.index_path();
    match fs::read(&path) {
      Ok(contents) => serde_json::from_slice(&contents).map_err(|source| SourceError::IndexParse { path, source }),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SourceIndex::default()),
      Err(source) => Err(SourceError::Io { path, source }),
    }
  }

  fn save_index(&self, index: &SourceIndex) -> Result<(), SourceError> {
    let path = self.index_path();
    let rendered = serde_json::to_vec_pretty(index).map_err(|source| SourceError::IndexParse {
      path: path.clone(),
      source,
    })?;
    // Atomic rewrite so concurrent readers never see a torn index.
    let tmp = self.tmp_dir()?;
    let staged = tmp.path().join(INDEX_FILENAME);
    fs::write(&staged, rendered).map_err(|e| SourceError::io(&staged, e))?;
    fs::rename(&staged, &path).map_err(|e| SourceError::io(&path, e))
  }

  fn record_entry(&self, key: &SourceKey, url: Option<&str>) -> Result<(), SourceError> {
    let mut index = self.load_index()?;
    if let Some(url) = url {
      index.urls.insert(url.to_string(), key.to_string());
    }
    index.entries.insert(
      key.to_string(),
      SourceEntryInfo {
        tag: key.scheme.retention_tag().to_string(),
        fetched_at: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
      },
    );
    self.save_index(&index)
  }

  /// All indexed entries, for GC.
  pub fn entries(&self) -> Result<Vec<(SourceKey, SourceEntryInfo)>, SourceError> {
    let index = self.load_index()?;
    let mut out = Vec::new();
    for (raw, info) in index.entries {
      match raw.parse::<SourceKey>() {
        Ok(key) => out.push((key, info)),
        Err(e) => warn!(key = %raw, error = %e, "skipping unparsable index entry"),
      }
    }
    Ok(out)
  }

  /// Remove an entry's stored content and index records. Used by GC.
  pub fn remove(&self, key: &SourceKey) -> Result<(), SourceError> {
    match key.scheme {
      Scheme::Git => {
        // Individual commits are not evicted from the pool; the pool
        // lives and dies with its retention tag as a whole.
      }
      Scheme::Dir => {
        let path = self.dir_path(&key.digest);
        if path.exists() {
          fs::remove_dir_all(&path).map_err(|e| SourceError::io(&path, e))?;
        }
      }
      _ => {
        let path = self.pack_path(key);
        if path.exists() {
          fs::remove_file(&path).map_err(|e| SourceError::io(&path, e))?;
        }
      }
    }

    let mut index = self.load_index()?;
    let key_str = key.to_string();
    index.entries.remove(&key_str);
    index.urls.retain(|_, v| *v != key_str);
    self.save_index(&index)
  }

  // === fetch / put ===

  /// Fetch a URL into the cache. The scheme is inferred from the URL
  /// suffix; unrecognized suffixes are treated as plain files.
  ///
  /// Re-fetching a known URL whose entry is still present returns its
  /// key without touching the network. If the URL serves content that
  /// no longer matches the recorded key, the fetch fails with
  /// [`SourceError::UrlContentChanged`] unless `rehash` is set.
  pub fn fetch(&self, url: &str) -> Result<SourceKey, SourceError> {
    self.fetch_impl(url, None, false)
  }

  /// Like [`fetch`](Self::fetch), with the scheme given explicitly
  /// instead of inferred from the suffix.
  pub fn fetch_as(&self, url: &str, scheme: Scheme) -> Result<SourceKey, SourceError> {
    self.fetch_impl(url, Some(scheme), false)
  }

  /// Like [`fetch`](Self::fetch), accepting changed content under a
  /// known URL.
  pub fn fetch_rehash(&self, url: &str) -> Result<SourceKey, SourceError> {
    self.fetch_impl(url, None, true)
  }

  fn fetch_impl(&self, url: &str, scheme: Option<Scheme>, rehash: bool) -> Result<SourceKey, SourceError> {
    let scheme = match scheme.or_else(|| Scheme::from_url(url)) {
      Some(Scheme::Git) => return Err(SourceError::UnknownScheme { url: url.to_string() }),
      Some(scheme) => scheme,
      None => Scheme::File,
    };

    let index = self.load_index()?;
    if let Some(stored) = index.urls.get(url)
      && let Ok(key) = stored.parse::<SourceKey>()
      && self.contains(&key)
    {
      debug!(url, key = %key, "source already cached");
      return Ok(key);
    }

    let tmp = self.tmp_dir()?;
    let download = tmp.path().join("download");
    self.download(url, &download)?;

    let key = self.ingest(&download, scheme)?;

    if !rehash
      && let Some(stored) = index.urls.get(url)
      && *stored != key.to_string()
    {
      return Err(SourceError::UrlContentChanged {
        url: url.to_string(),
        stored: stored.clone(),
        fetched: key.to_string(),
      });
    }

    self.record_entry(&key, Some(url))?;
    info!(url, key = %key, "fetched source");
    Ok(key)
  }

  fn download(&self, url: &str, dest: &Path) -> Result<(), SourceError> {
    let fetch_err = |message: String| SourceError::Fetch {
      url: url.to_string(),
      message,
    };

    if let Some(local) = url.strip_prefix("file://").or_else(|| url.starts_with('/').then_some(url)) {
      fs::copy(local, dest).map_err(|e| fetch_err(e.to_string()))?;
      return Ok(());
    }

    let response = reqwest::blocking::get(url)
      .and_then(|r| r.error_for_status())
      .map_err(|e| fetch_err(e.to_string()))?;
    let mut reader = response;
    let mut out = fs::File::create(dest).map_err(|e| SourceError::io(dest, e))?;
    std::io::copy(&mut reader, &mut out).map_err(|e| fetch_err(e.to_string()))?;
    Ok(())
  }

  /// Move downloaded bytes into the pack store under their content key.
  fn ingest(&self, download: &Path, scheme: Scheme) -> Result<SourceKey, SourceError> {
    let digest = if scheme.is_archive() {
      // Key archives by what they unpack to, not their compressed
      // bytes: recompressed tarballs of the same tree share a key.
      let staging = self.tmp_dir()?;
      archive::extract_archive(download, scheme, staging.path())?;
      hash::hash_tree(staging.path(), &[])?
    } else {
      hash::hash_file(download)?
    };

    let key = SourceKey::new(scheme, digest.to_string());
    let pack = self.pack_path(&key);
    if !pack.exists() {
      if let Some(parent) = pack.parent() {
        fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
      }
      // Same-filesystem rename; landing on an existing identical pack
      // is harmless.
      fs::rename(download, &pack).map_err(|e| SourceError::io(&pack, e))?;
    }
    Ok(key)
  }

  /// Store a local file or directory.
  pub fn put(&self, path: &Path) -> Result<SourceKey, SourceError> {
    let meta = fs::metadata(path).map_err(|e| SourceError::io(path, e))?;
    if meta.is_dir() { self.put_dir(path) } else { self.put_file(path) }
  }

  pub fn put_file(&self, path: &Path) -> Result<SourceKey, SourceError> {
    let digest = hash::hash_file(path)?;
    let key = SourceKey::new(Scheme::File, digest.to_string());
    let pack = self.pack_path(&key);
    if !pack.exists() {
      if let Some(parent) = pack.parent() {
        fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
      }
      fs::copy(path, &pack).map_err(|e| SourceError::io(&pack, e))?;
    }
    self.record_entry(&key, None)?;
    Ok(key)
  }

  pub fn put_dir(&self, path: &Path) -> Result<SourceKey, SourceError> {
    let digest = hash::hash_tree(path, &[])?;
    let key = SourceKey::new(Scheme::Dir, digest.to_string());
    let dest = self.dir_path(&digest.to_string());
    if !dest.exists() {
      let staging = self.tmp_dir()?;
      let staged = staging.path().join("snapshot");
      copy_tree(path, &staged)?;
      if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
      }
      match fs::rename(&staged, &dest) {
        Ok(()) => {}
        // A concurrent put of the same tree won the rename.
        Err(_) if dest.exists() => {}
        Err(e) => return Err(SourceError::io(&dest, e)),
      }
    }
    self.record_entry(&key, None)?;
    Ok(key)
  }

  /// Fetch a git ref into the shared pool. Returns `git:<commit-sha>`.
  pub fn fetch_git(&self, url: &str, refspec: &str) -> Result<SourceKey, SourceError> {
    let sha = git::fetch(&self.root, url, refspec)?;
    let key = SourceKey::new(Scheme::Git, sha);
    self.record_entry(&key, None)?;
    info!(url, refspec, key = %key, "fetched git source");
    Ok(key)
  }

  // === unpack ===

  /// Materialize `key` into `target`, verifying content against the
  /// key. For `file:` keys `target` is the destination file path; for
  /// everything else it is a directory, and `strip` drops leading path
  /// components.
  pub fn unpack(&self, key: &SourceKey, target: &Path, strip: u32) -> Result<(), SourceError> {
    if !self.contains(key) {
      return Err(SourceError::SourceNotFound { key: key.to_string() });
    }

    match key.scheme {
      Scheme::Git => git::checkout(&self.root, &key.digest, target),
      Scheme::File => {
        let pack = self.pack_path(key);
        let actual = hash::hash_file(&pack)?;
        if actual.to_string() != key.digest {
          return self.quarantine(key, &actual.to_string());
        }
        if let Some(parent) = target.parent() {
          fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
        }
        fs::copy(&pack, target).map(|_| ()).map_err(|e| SourceError::io(target, e))
      }
      Scheme::Dir => {
        let stored = self.dir_path(&key.digest);
        let actual = hash::hash_tree(&stored, &[])?;
        if actual.to_string() != key.digest {
          return self.quarantine(key, &actual.to_string());
        }
        copy_tree_into(&stored, target, strip)
      }
      Scheme::TarGz | Scheme::TarBz2 | Scheme::Zip => {
        let pack = self.pack_path(key);
        let staging = self.tmp_dir()?;
        archive::extract_archive(&pack, key.scheme, staging.path())?;
        let actual = hash::hash_tree(staging.path(), &[])?;
        if actual.to_string() != key.digest {
          return self.quarantine(key, &actual.to_string());
        }
        archive::materialize(staging.path(), target, strip)
      }
    }
  }

  /// Set a corrupt entry aside and report it.
  fn quarantine(&self, key: &SourceKey, actual: &str) -> Result<(), SourceError> {
    let quarantine = self.root.join("quarantine");
    fs::create_dir_all(&quarantine).map_err(|e| SourceError::io(&quarantine, e))?;
    let from = match key.scheme {
      Scheme::Dir => self.dir_path(&key.digest),
      _ => self.pack_path(key),
    };
    let to = quarantine.join(format!("{}-{}", key.scheme.as_str(), key.digest));
    if let Err(e) = fs::rename(&from, &to) {
      warn!(key = %key, error = %e, "failed to quarantine corrupt source");
    } else {
      warn!(key = %key, path = %to.display(), "quarantined corrupt source");
    }
    Err(SourceError::CorruptSource {
      key: key.to_string(),
      actual: actual.to_string(),
    })
  }
}

/// Copy a tree preserving symlinks and permissions.
fn copy_tree(src: &Path, dest: &Path) -> Result<(), SourceError> {
  fs::create_dir_all(dest).map_err(|e| SourceError::io(dest, e))?;
  for entry in WalkDir::new(src).min_depth(1) {
    let entry = entry.map_err(|e| SourceError::Unpack { message: e.to_string() })?;
    let rel = entry.path().strip_prefix(src).expect("walkdir stays under src");
    let to = dest.join(rel);
    copy_dir_entry(&entry, &to)?;
  }
  Ok(())
}

/// Copy a tree into `target`, dropping `strip` leading components.
fn copy_tree_into(src: &Path, target: &Path, strip: u32) -> Result<(), SourceError> {
  fs::create_dir_all(target).map_err(|e| SourceError::io(target, e))?;
  for entry in WalkDir::new(src).min_depth(1) {
    let entry = entry.map_err(|e| SourceError::Unpack { message: e.to_string() })?;
    let rel = entry.path().strip_prefix(src).expect("walkdir stays under src");
    let Some(stripped) = archive::strip_components(rel, strip) else {
      continue;
    };
    let to = target.join(stripped);
    copy_dir_entry(&entry, &to)?;
  }
  Ok(())
}

fn copy_dir_entry(entry: &walkdir::DirEntry, to: &Path) -> Result<(), SourceError> {
  let file_type = entry.file_type();
  if let Some(parent) = to.parent() {
    fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
  }
  if file_type.is_dir() {
    fs::create_dir_all(to).map_err(|e| SourceError::io(to, e))?;
  } else if file_type.is_symlink() {
    let link = fs::read_link(entry.path()).map_err(|e| SourceError::io(entry.path(), e))?;
    std::os::unix::fs::symlink(&link, to).map_err(|e| SourceError::io(to, e))?;
  } else {
    fs::copy(entry.path(), to).map_err(|e| SourceError::io(to, e))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs::File;
  use tempfile::TempDir;

  fn cache() -> (SourceCache, TempDir) {
    let temp = TempDir::new().unwrap();
    (SourceCache::new(temp.path().join("source")), temp)
  }

  fn make_tar_gz(dest: &Path, entries: &[(&str, &str)]) {
    let file = File::create(dest).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in entries {
      let mut header = tar::Header::new_gnu();
      header.set_size(contents.len() as u64);
      header.set_mode(0o644);
      header.set_cksum();
      builder.append_data(&mut header, path, contents.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
  }

  #[test]
  fn put_file_roundtrip() {
    let (cache, temp) = cache();
    let src = temp.path().join("input.txt");
    fs::write(&src, "payload").unwrap();

    let key = cache.put_file(&src).unwrap();
    assert_eq!(key.scheme, Scheme::File);
    assert!(cache.contains(&key));

    let dest = temp.path().join("out/copy.txt");
    cache.unpack(&key, &dest, 0).unwrap();
    assert_eq!(fs::read_to_string(&dest).unwrap(), "payload");
  }

  #[test]
  fn put_file_is_idempotent() {
    let (cache, temp) = cache();
    let src = temp.path().join("input.txt");
    fs::write(&src, "same bytes").unwrap();

    let key1 = cache.put_file(&src).unwrap();
    let key2 = cache.put_file(&src).unwrap();
    assert_eq!(key1, key2);
  }

  #[test]
  fn put_dir_roundtrip() {
    let (cache, temp) = cache();
    let src = temp.path().join("tree");
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("a.txt"), "a").unwrap();
    fs::write(src.join("sub/b.txt"), "b").unwrap();

    let key = cache.put_dir(&src).unwrap();
    assert_eq!(key.scheme, Scheme::Dir);

    let dest = temp.path().join("out");
    cache.unpack(&key, &dest, 0).unwrap();
    assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "a");
    assert_eq!(fs::read_to_string(dest.join("sub/b.txt")).unwrap(), "b");

    // The snapshot hashes back to its own key.
    assert_eq!(hash::hash_tree(&dest, &[]).unwrap().to_string(), key.digest);
  }

  #[test]
  fn fetch_local_tarball_and_unpack_with_strip() {
    let (cache, temp) = cache();
    let tarball = temp.path().join("zlib-1.2.7.tar.gz");
    make_tar_gz(&tarball, &[("zlib-1.2.7/zlib.h", "header"), ("zlib-1.2.7/src/inflate.c", "code")]);

    let key = cache.fetch(tarball.to_str().unwrap()).unwrap();
    assert_eq!(key.scheme, Scheme::TarGz);

    let build = temp.path().join("build");
    cache.unpack(&key, &build, 1).unwrap();
    assert_eq!(fs::read_to_string(build.join("zlib.h")).unwrap(), "header");
    assert_eq!(fs::read_to_string(build.join("src/inflate.c")).unwrap(), "code");
  }

  #[test]
  fn refetch_of_known_url_skips_download() {
    let (cache, temp) = cache();
    let tarball = temp.path().join("pkg.tar.gz");
    make_tar_gz(&tarball, &[("pkg/file", "v1")]);

    let key1 = cache.fetch(tarball.to_str().unwrap()).unwrap();

    // Even with the file gone, the indexed key is returned as long as
    // the cache entry exists.
    fs::remove_file(&tarball).unwrap();
    let key2 = cache.fetch(tarball.to_str().unwrap()).unwrap();
    assert_eq!(key1, key2);
  }

  #[test]
  fn recompressed_tarball_of_same_tree_shares_a_key() {
    let (cache, temp) = cache();
    let a = temp.path().join("a.tar.gz");
    let b = temp.path().join("b.tar.gz");
    make_tar_gz(&a, &[("pkg/file", "same")]);
    make_tar_gz(&b, &[("pkg/file", "same")]);

    let key_a = cache.fetch(a.to_str().unwrap()).unwrap();
    let key_b = cache.fetch(b.to_str().unwrap()).unwrap();
    assert_eq!(key_a.digest, key_b.digest);
  }

  #[test]
  fn changed_content_under_same_url_is_an_error() {
    let (cache, temp) = cache();
    let tarball = temp.path().join("pkg.tar.gz");
    make_tar_gz(&tarball, &[("pkg/file", "v1")]);
    let key1 = cache.fetch(tarball.to_str().unwrap()).unwrap();

    // New content at the same URL, and the old entry evicted so the
    // fast path cannot satisfy the fetch.
    make_tar_gz(&tarball, &[("pkg/file", "v2")]);
    fs::remove_file(cache.pack_path(&key1)).unwrap();

    let err = cache.fetch(tarball.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, SourceError::UrlContentChanged { .. }));

    // Explicit rehash accepts the new content.
    let key2 = cache.fetch_rehash(tarball.to_str().unwrap()).unwrap();
    assert_ne!(key1, key2);
  }

  #[test]
  fn tampered_archive_is_quarantined_on_unpack() {
    let (cache, temp) = cache();
    let tarball = temp.path().join("pkg.tar.gz");
    make_tar_gz(&tarball, &[("pkg/file", "original")]);
    let key = cache.fetch(tarball.to_str().unwrap()).unwrap();

    // Overwrite the stored pack with a different (valid) archive.
    let evil = temp.path().join("evil.tar.gz");
    make_tar_gz(&evil, &[("pkg/file", "tampered")]);
    fs::copy(&evil, cache.pack_path(&key)).unwrap();

    let err = cache.unpack(&key, &temp.path().join("build"), 0).unwrap_err();
    assert!(matches!(err, SourceError::CorruptSource { .. }));
    assert!(!cache.contains(&key));
    assert!(cache.root().join("quarantine").read_dir().unwrap().next().is_some());
  }

  #[test]
  fn unpack_of_missing_key_is_not_found() {
    let (cache, temp) = cache();
    let key = SourceKey::new(Scheme::TarGz, "doesnotexist".to_string());
    let err = cache.unpack(&key, &temp.path().join("x"), 0).unwrap_err();
    assert!(matches!(err, SourceError::SourceNotFound { .. }));
  }

  #[test]
  fn git_suffix_url_is_rejected_by_fetch() {
    let (cache, _temp) = cache();
    let err = cache.fetch("https://example.com/repo.git").unwrap_err();
    assert!(matches!(err, SourceError::UnknownScheme { .. }));
  }

  #[test]
  fn entries_reports_tags() {
    let (cache, temp) = cache();
    let src = temp.path().join("f");
    fs::write(&src, "x").unwrap();
    let key = cache.put_file(&src).unwrap();

    let entries = cache.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, key);
    assert_eq!(entries[0].1.tag, "file");
    assert!(entries[0].1.fetched_at > 0);
  }

  #[test]
  fn remove_deletes_content_and_index() {
    let (cache, temp) = cache();
    let src = temp.path().join("f");
    fs::write(&src, "x").unwrap();
    let key = cache.put_file(&src).unwrap();

    cache.remove(&key).unwrap();
    assert!(!cache.contains(&key));
    assert!(cache.entries().unwrap().is_empty());
  }
}
