//! In-build environment assembly.
//!
//! The sandbox is the environment: commands see only what is assembled
//! here. Imports are translated into `<ref>` path variables, `PATH` is
//! built from imports that ask for it, and compiler search flags are
//! accumulated for imports that install headers or libraries.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::{Job, JobError};
use crate::meta::ArtifactMeta;
use crate::spec::ArtifactId;

/// An import after virtual resolution: the concrete artifact and where
/// it lives on disk.
#[derive(Debug, Clone)]
pub struct ResolvedImport {
  pub ref_name: String,
  pub id: ArtifactId,
  pub path: PathBuf,
  pub meta: ArtifactMeta,
  pub before: Vec<String>,
}

/// Order imports so that everything a `before` list names comes later.
/// Declaration order breaks ties.
fn order_imports<'a>(imports: &'a [ResolvedImport]) -> Result<Vec<&'a ResolvedImport>, JobError> {
  let index_of: BTreeMap<&str, usize> = imports
    .iter()
    .enumerate()
    .map(|(i, imp)| (imp.ref_name.as_str(), i))
    .collect();

  // Kahn's algorithm over the (small) before-graph.
  let n = imports.len();
  let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
  let mut indegree = vec![0usize; n];
  for (i, imp) in imports.iter().enumerate() {
    for after in &imp.before {
      if let Some(&j) = index_of.get(after.as_str()) {
        successors[i].push(j);
        indegree[j] += 1;
      }
    }
  }

  let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
  let mut ordered = Vec::with_capacity(n);
  while let Some(&next) = ready.iter().min() {
    ready.retain(|&i| i != next);
    ordered.push(&imports[next]);
    for &j in &successors[next] {
      indegree[j] -= 1;
      if indegree[j] == 0 {
        ready.push(j);
      }
    }
  }

  if ordered.len() != n {
    let stuck = imports
      .iter()
      .enumerate()
      .find(|(i, _)| indegree[*i] > 0)
      .map(|(_, imp)| imp.ref_name.clone())
      .unwrap_or_default();
    return Err(JobError::ImportCycle { ref_name: stuck });
  }
  Ok(ordered)
}

/// Path from `from` (a directory) to `to`, both absolute.
fn relative_path(from: &Path, to: &Path) -> PathBuf {
  let from_parts: Vec<Component> = from.components().collect();
  let to_parts: Vec<Component> = to.components().collect();

  let common = from_parts
    .iter()
    .zip(to_parts.iter())
    .take_while(|(a, b)| a == b)
    .count();

  let mut rel = PathBuf::new();
  for _ in common..from_parts.len() {
    rel.push("..");
  }
  for part in &to_parts[common..] {
    rel.push(part);
  }
  if rel.as_os_str().is_empty() {
    rel.push(".");
  }
  rel
}

/// Substitute `${VAR}` occurrences against `env`. Unknown variables are
/// left for [`run`](super::run) to report with command context.
fn substitute_lenient(value: &str, env: &BTreeMap<String, String>) -> String {
  let mut out = String::with_capacity(value.len());
  let mut rest = value;
  while let Some(start) = rest.find("${") {
    out.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    match after.find('}') {
      Some(end) => {
        let name = &after[..end];
        match env.get(name) {
          Some(v) => out.push_str(v),
          None => {
            out.push_str("${");
            out.push_str(name);
            out.push('}');
          }
        }
        rest = &after[end + 1..];
      }
      None => {
        out.push_str("${");
        rest = after;
      }
    }
  }
  out.push_str(rest);
  out
}

/// Assemble the complete job environment.
///
/// Always present: `ARTIFACT`, `BUILD`, `PATH`, `HDIST_CFLAGS`,
/// `HDIST_LDFLAGS`, `HDIST_VIRTUALS`. Per import: `<ref>`, `<ref>_id`,
/// `<ref>_relpath`. Spec-level `env` and `env_nohash` are merged last
/// and may reference everything above.
pub fn assemble_env(
  job: &Job,
  imports: &[ResolvedImport],
  build_dir: &Path,
  artifact_dir: &Path,
  virtuals_used: &BTreeMap<String, ArtifactId>,
) -> Result<BTreeMap<String, String>, JobError> {
  let mut env = BTreeMap::new();
  env.insert("ARTIFACT".to_string(), artifact_dir.to_string_lossy().to_string());
  env.insert("BUILD".to_string(), build_dir.to_string_lossy().to_string());

  let ordered = order_imports(imports)?;

  let mut path_entries: Vec<String> = Vec::new();
  let mut extra_path_vars: BTreeMap<String, Vec<String>> = BTreeMap::new();
  let mut cflags: Vec<String> = Vec::new();
  let mut ldflags: Vec<String> = Vec::new();

  for import in &ordered {
    let dir = import.path.to_string_lossy().to_string();
    env.insert(import.ref_name.clone(), dir.clone());
    env.insert(format!("{}_id", import.ref_name), import.id.to_string());
    env.insert(
      format!("{}_relpath", import.ref_name),
      relative_path(build_dir, &import.path).to_string_lossy().to_string(),
    );

    // Only imports that declare it modify the importing environment.
    for (var, subdirs) in &import.meta.import_modify_env {
      for subdir in subdirs {
        let entry = import.path.join(subdir).to_string_lossy().to_string();
        if var == "PATH" {
          path_entries.push(entry);
        } else {
          extra_path_vars.entry(var.clone()).or_default().push(entry);
        }
      }
    }

    if import.path.join("include").is_dir() {
      cflags.push(format!("-I{dir}/include"));
    }
    if import.path.join("lib").is_dir() {
      ldflags.push(format!("-L{dir}/lib"));
      ldflags.push(format!("-Wl,-R,{dir}/lib"));
    }
  }

  // No host PATH: empty unless imports contribute.
  env.insert("PATH".to_string(), path_entries.join(":"));
  for (var, entries) in extra_path_vars {
    env.insert(var, entries.join(":"));
  }
  env.insert("HDIST_CFLAGS".to_string(), cflags.join(" "));
  env.insert("HDIST_LDFLAGS".to_string(), ldflags.join(" "));

  let virtuals = virtuals_used
    .iter()
    .map(|(alias, id)| format!("virtual:{alias}={id}"))
    .collect::<Vec<_>>()
    .join(";");
  env.insert("HDIST_VIRTUALS".to_string(), virtuals);

  for (key, value) in job.env.iter().chain(job.env_nohash.iter()) {
    let resolved = substitute_lenient(value, &env);
    env.insert(key.clone(), resolved);
  }

  debug!(imports = imports.len(), vars = env.len(), "assembled job environment");
  Ok(env)
}
