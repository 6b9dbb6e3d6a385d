//! Archive extraction for the source cache.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tar::Archive;
use walkdir::WalkDir;

use super::SourceError;
use super::key::Scheme;

/// Extract an archive completely into `dest`. Stripping happens later,
/// after the extracted tree has been verified against its key.
pub(crate) fn extract_archive(archive_path: &Path, scheme: Scheme, dest: &Path) -> Result<(), SourceError> {
  fs::create_dir_all(dest).map_err(|e| SourceError::io(dest, e))?;
  let file = File::open(archive_path).map_err(|e| SourceError::io(archive_path, e))?;
  let reader = BufReader::new(file);

  match scheme {
    Scheme::TarGz => unpack_tar(Archive::new(GzDecoder::new(reader)), dest),
    Scheme::TarBz2 => unpack_tar(Archive::new(BzDecoder::new(reader)), dest),
    Scheme::Zip => unpack_zip(reader, dest),
    _ => Err(SourceError::Unpack {
      message: format!("scheme '{scheme}' is not an archive", scheme = scheme.as_str()),
    }),
  }
}

fn unpack_tar<R: std::io::Read>(mut archive: Archive<R>, dest: &Path) -> Result<(), SourceError> {
  archive.set_preserve_permissions(true);
  let entries = archive.entries().map_err(|e| SourceError::unpack(e))?;
  for entry in entries {
    let mut entry = entry.map_err(|e| SourceError::unpack(e))?;
    entry.unpack_in(dest).map_err(|e| SourceError::unpack(e))?;
  }
  Ok(())
}

fn unpack_zip(reader: BufReader<File>, dest: &Path) -> Result<(), SourceError> {
  let mut archive = zip::ZipArchive::new(reader).map_err(|e| SourceError::unpack(e))?;

  for i in 0..archive.len() {
    let mut file = archive.by_index(i).map_err(|e| SourceError::unpack(e))?;
    let Some(path) = file.enclosed_name() else {
      return Err(SourceError::Unpack {
        message: format!("zip entry #{i} has an unsafe name"),
      });
    };
    let dest_path = dest.join(path);

    if file.is_dir() {
      fs::create_dir_all(&dest_path).map_err(|e| SourceError::io(&dest_path, e))?;
      continue;
    }

    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
    }
    let mut out = File::create(&dest_path).map_err(|e| SourceError::io(&dest_path, e))?;
    std::io::copy(&mut file, &mut out).map_err(|e| SourceError::io(&dest_path, e))?;

    #[cfg(unix)]
    if let Some(mode) = file.unix_mode() {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode)).map_err(|e| SourceError::io(&dest_path, e))?;
    }
  }

  Ok(())
}

/// Drop `strip` leading components from a relative path. `None` when
/// nothing remains.
pub(crate) fn strip_components(path: &Path, strip: u32) -> Option<PathBuf> {
  let stripped: PathBuf = path
    .components()
    .filter(|c| matches!(c, Component::Normal(_)))
    .skip(strip as usize)
    .collect();
  if stripped.as_os_str().is_empty() { None } else { Some(stripped) }
}

/// Move a verified extraction into `target`, applying `strip`.
///
/// `src` and `target` must live on the same filesystem; entries are
/// renamed, not copied.
pub(crate) fn materialize(src: &Path, target: &Path, strip: u32) -> Result<(), SourceError> {
  fs::create_dir_all(target).map_err(|e| SourceError::io(target, e))?;

  for entry in WalkDir::new(src).min_depth(1) {
    let entry = entry.map_err(|e| SourceError::Unpack { message: e.to_string() })?;
    let rel = entry.path().strip_prefix(src).expect("walkdir stays under src");
    let Some(stripped) = strip_components(rel, strip) else {
      continue;
    };
    let dest = target.join(stripped);

    if entry.file_type().is_dir() {
      fs::create_dir_all(&dest).map_err(|e| SourceError::io(&dest, e))?;
    } else {
      if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
      }
      fs::rename(entry.path(), &dest).map_err(|e| SourceError::io(&dest, e))?;
    }
  }

  Ok(())
}
