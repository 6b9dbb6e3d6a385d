//! Build jobs: the `build` sub-document of a spec and its execution.
//!
//! A job names the artifacts it imports and the commands it runs. The
//! runner assembles a scrubbed environment from the imports and executes
//! the commands in declaration order inside the build directory; nothing
//! from the host environment leaks in.

pub mod env;
pub mod run;

pub use env::{ResolvedImport, assemble_env};
pub use run::{BuiltinDispatch, run_job};

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::spec::ImportId;

#[derive(Debug, Error)]
pub enum JobError {
  /// A `virtual:` import with no entry in the caller's table, or an
  /// artifact the caller has not built. The core does not recurse.
  #[error("unresolved import '{id}' (ref {ref_name})")]
  UnresolvedImport { ref_name: String, id: String },

  #[error("import ordering cycle involving '{ref_name}'")]
  ImportCycle { ref_name: String },

  #[error("undefined variable '${{{name}}}' in command #{index}")]
  UndefinedVariable { name: String, index: usize },

  #[error("command #{index} ({program}) exited with {code:?}")]
  CommandFailed {
    index: usize,
    program: String,
    code: Option<i32>,
  },

  #[error("command #{index} ({program}) timed out after {seconds}s")]
  Timeout {
    index: usize,
    program: String,
    seconds: u64,
  },

  #[error("failed to spawn {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("builtin command failed: {message}")]
  Builtin { message: String },
}

/// One imported artifact: `ref` is the variable name the artifact path
/// is bound to inside the build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Import {
  #[serde(rename = "ref")]
  pub ref_name: String,
  pub id: ImportId,
  /// Refs whose environment contributions this import precedes.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub before: Vec<String>,
}

/// One command of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
  pub cmd: Vec<String>,
  /// Overrides the job environment for this command only.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
  /// JSON document piped to stdin.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub inputs: Option<Value>,
  /// Capture trimmed stdout into this variable for later commands.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub to_var: Option<String>,
  /// Working directory relative to the build dir; defaults to it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cwd: Option<String>,
  /// Seconds before the command is killed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout: Option<u64>,
}

/// The `build` document of a spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Job {
  #[serde(default, rename = "import", skip_serializing_if = "Vec::is_empty")]
  pub imports: Vec<Import>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub commands: Vec<Command>,
  /// Extra variables exported into every command.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
  /// Like `env`, but exempt from the artifact hash: controls *how* to
  /// build, not *what*.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env_nohash: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn job_deserializes_from_spec_form() {
    let raw = json!({
      "import": [
        {"ref": "ZLIB", "id": "zlib/1.2.7/AbCdEf0123456789_-AbCdEf012"},
        {"ref": "UNIX", "id": "virtual:unix", "before": ["ZLIB"]}
      ],
      "commands": [
        {"cmd": ["${UNIX}/bin/sh", "-c", "make"], "env": {"CFLAGS": "-O2"}},
        {"cmd": ["${UNIX}/bin/sh", "-c", "make install"], "to_var": "OUT", "timeout": 600}
      ],
      "env": {"PREFIX": "${ARTIFACT}"},
      "env_nohash": {"MAKEFLAGS": "-j4"}
    });

    let job: Job = serde_json::from_value(raw).unwrap();
    assert_eq!(job.imports.len(), 2);
    assert_eq!(job.imports[1].before, vec!["ZLIB"]);
    assert_eq!(job.commands[1].to_var.as_deref(), Some("OUT"));
    assert_eq!(job.commands[1].timeout, Some(600));
    assert_eq!(job.env["PREFIX"], "${ARTIFACT}");
    assert_eq!(job.env_nohash["MAKEFLAGS"], "-j4");
  }

  #[test]
  fn empty_fields_are_omitted_on_serialization() {
    let job = Job::default();
    let rendered = serde_json::to_value(&job).unwrap();
    assert_eq!(rendered, json!({}));
  }
}
