//! Command execution inside the assembled environment.
//!
//! Commands run in declaration order with a scrubbed environment; all
//! stdout and stderr is teed to `$BUILD/build.log`. A failing command
//! aborts the job and leaves the build directory in place for
//! inspection.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command as Process, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{Command, Job, JobError};
use crate::consts::{BUILD_LOG_FILENAME, SELF_COMMAND};

/// Seam for the `hit` self-reference bootstrap: commands whose first
/// token is `hit` dispatch here instead of spawning a process, so the
/// helper set stays closed and sandbox-safe.
pub trait BuiltinDispatch {
  fn run(&self, argv: &[String], env: &BTreeMap<String, String>, log: &mut dyn Write) -> Result<(), JobError>;
}

/// A dispatch that knows no builtins. Jobs using `hit` commands fail.
pub struct NoBuiltins;

impl BuiltinDispatch for NoBuiltins {
  fn run(&self, argv: &[String], _env: &BTreeMap<String, String>, _log: &mut dyn Write) -> Result<(), JobError> {
    Err(JobError::Builtin {
      message: format!("no builtin available for 'hit {}'", argv.join(" ")),
    })
  }
}

/// Substitute `${VAR}` in a command string; unknown names are an error.
fn substitute(value: &str, env: &BTreeMap<String, String>, index: usize) -> Result<String, JobError> {
  let mut out = String::with_capacity(value.len());
  let mut rest = value;
  while let Some(start) = rest.find("${") {
    out.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    let Some(end) = after.find('}') else {
      out.push_str("${");
      rest = after;
      continue;
    };
    let name = &after[..end];
    match env.get(name) {
      Some(v) => out.push_str(v),
      None => {
        return Err(JobError::UndefinedVariable {
          name: name.to_string(),
          index,
        });
      }
    }
    rest = &after[end + 1..];
  }
  out.push_str(rest);
  Ok(out)
}

fn log_io(build_dir: &Path) -> impl Fn(std::io::Error) -> JobError + '_ {
  move |source| JobError::Io {
    path: build_dir.join(BUILD_LOG_FILENAME),
    source,
  }
}

/// Run every command of `job` with `env` as the base environment.
///
/// `env` is mutated by `to_var` captures so later commands observe
/// them. The caller owns promotion: on error the build directory is
/// left exactly as the failing command left it.
pub fn run_job(
  job: &Job,
  env: &mut BTreeMap<String, String>,
  build_dir: &Path,
  builtins: &dyn BuiltinDispatch,
) -> Result<(), JobError> {
  let log_path = build_dir.join(BUILD_LOG_FILENAME);
  let log = File::create(&log_path).map_err(log_io(build_dir))?;
  let log = Arc::new(Mutex::new(log));

  for (index, command) in job.commands.iter().enumerate() {
    run_command(index, command, env, build_dir, builtins, &log)?;
  }

  Ok(())
}

fn run_command(
  index: usize,
  command: &Command,
  env: &mut BTreeMap<String, String>,
  build_dir: &Path,
  builtins: &dyn BuiltinDispatch,
  log: &Arc<Mutex<File>>,
) -> Result<(), JobError> {
  // Per-command env overlay, then substitution against the result.
  let mut effective = env.clone();
  for (key, value) in &command.env {
    let resolved = substitute(value, env, index)?;
    effective.insert(key.clone(), resolved);
  }

  let mut argv = Vec::with_capacity(command.cmd.len());
  for token in &command.cmd {
    argv.push(substitute(token, &effective, index)?);
  }
  let Some(program) = argv.first().cloned() else {
    return Err(JobError::Builtin {
      message: format!("command #{index} is empty"),
    });
  };

  {
    let mut guard = log.lock().expect("log lock");
    writeln!(guard, "$ {}", argv.join(" ")).map_err(log_io(build_dir))?;
  }
  info!(index, program = %program, "running command");

  if program == SELF_COMMAND {
    let mut guard = log.lock().expect("log lock");
    return builtins.run(&argv[1..], &effective, &mut *guard);
  }

  let cwd = match &command.cwd {
    Some(dir) => build_dir.join(dir),
    None => build_dir.to_path_buf(),
  };

  let mut process = Process::new(&program);
  process
    .args(&argv[1..])
    .current_dir(&cwd)
    .env_clear()
    .envs(&effective)
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .stdin(if command.inputs.is_some() { Stdio::piped() } else { Stdio::null() });

  let mut child = process.spawn().map_err(|source| JobError::Spawn {
    program: program.clone(),
    source,
  })?;

  if let Some(inputs) = &command.inputs {
    // Scope closes stdin so the child sees EOF.
    let mut stdin = child.stdin.take().expect("stdin was piped");
    let rendered = serde_json::to_vec(inputs).expect("inputs serialize");
    stdin.write_all(&rendered).map_err(log_io(build_dir))?;
  }

  // Readers drain on their own threads so a timeout can kill the child
  // while its pipes are still open.
  let stderr = child.stderr.take().expect("stderr was piped");
  let stderr_log = Arc::clone(log);
  let stderr_thread = std::thread::spawn(move || tee(stderr, &stderr_log, None));

  let stdout = child.stdout.take().expect("stdout was piped");
  let stdout_log = Arc::clone(log);
  let capture = command.to_var.is_some();
  let stdout_thread = std::thread::spawn(move || {
    let mut captured = Vec::new();
    tee(stdout, &stdout_log, capture.then_some(&mut captured));
    captured
  });

  let status = wait_with_timeout(&mut child, command.timeout, index, &program)?;
  let captured = stdout_thread.join().expect("stdout reader panicked");
  stderr_thread.join().expect("stderr reader panicked");

  if !status.success() {
    let code = status.code();
    let mut guard = log.lock().expect("log lock");
    let _ = writeln!(guard, "command failed with {code:?}");
    return Err(JobError::CommandFailed { index, program, code });
  }

  if let Some(var) = &command.to_var {
    let value = String::from_utf8_lossy(&captured).trim_end().to_string();
    debug!(var = %var, value = %value, "captured command output");
    env.insert(var.clone(), value);
  }

  Ok(())
}

/// Pump a stream into the shared log, optionally also into `capture`.
fn tee(mut stream: impl Read, log: &Arc<Mutex<File>>, mut capture: Option<&mut Vec<u8>>) {
  let mut buffer = [0u8; 8192];
  loop {
    match stream.read(&mut buffer) {
      Ok(0) | Err(_) => break,
      Ok(n) => {
        let chunk = &buffer[..n];
        if let Ok(mut guard) = log.lock() {
          let _ = guard.write_all(chunk);
        }
        if let Some(capture) = capture.as_deref_mut() {
          capture.extend_from_slice(chunk);
        }
      }
    }
  }
}

fn wait_with_timeout(
  child: &mut Child,
  timeout: Option<u64>,
  index: usize,
  program: &str,
) -> Result<std::process::ExitStatus, JobError> {
  let spawn_err = |source| JobError::Spawn {
    program: program.to_string(),
    source,
  };

  let Some(seconds) = timeout else {
    return child.wait().map_err(spawn_err);
  };

  let deadline = Instant::now() + Duration::from_secs(seconds);
  loop {
    if let Some(status) = child.try_wait().map_err(spawn_err)? {
      return Ok(status);
    }
    if Instant::now() >= deadline {
      let _ = child.kill();
      let _ = child.wait();
      return Err(JobError::Timeout {
        index,
        program: program.to_string(),
        seconds,
      });
    }
    std::thread::sleep(Duration::from_millis(50));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::fs;
  use tempfile::TempDir;

  fn sh(script: &str) -> Command {
    Command {
      cmd: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
      env: BTreeMap::new(),
      inputs: None,
      to_var: None,
      cwd: None,
      timeout: None,
    }
  }

  fn base_env(build_dir: &Path) -> BTreeMap<String, String> {
    BTreeMap::from([
      ("BUILD".to_string(), build_dir.to_string_lossy().to_string()),
      ("PATH".to_string(), String::new()),
    ])
  }

  fn run(job: &Job, build_dir: &Path) -> Result<BTreeMap<String, String>, JobError> {
    let mut env = base_env(build_dir);
    run_job(job, &mut env, build_dir, &NoBuiltins)?;
    Ok(env)
  }

  #[test]
  fn commands_run_in_order_and_log_is_teed() {
    let temp = TempDir::new().unwrap();
    let job = Job {
      commands: vec![sh("echo first"), sh("echo second >&2"), sh("echo third")],
      ..Job::default()
    };

    run(&job, temp.path()).unwrap();

    let log = fs::read_to_string(temp.path().join(BUILD_LOG_FILENAME)).unwrap();
    assert!(log.contains("first"));
    assert!(log.contains("second"));
    assert!(log.contains("third"));
    let first = log.find("first").unwrap();
    let third = log.find("third").unwrap();
    assert!(first < third);
  }

  #[test]
  fn to_var_captures_stdout_for_later_commands() {
    let temp = TempDir::new().unwrap();
    let mut probe = sh("echo detected-value");
    probe.to_var = Some("PROBED".to_string());
    let job = Job {
      commands: vec![probe, sh("echo got ${PROBED} > result.txt")],
      ..Job::default()
    };

    let env = run(&job, temp.path()).unwrap();

    assert_eq!(env["PROBED"], "detected-value");
    assert_eq!(
      fs::read_to_string(temp.path().join("result.txt")).unwrap().trim(),
      "got detected-value"
    );
  }

  #[test]
  fn command_env_overrides_job_env_for_one_command() {
    let temp = TempDir::new().unwrap();
    let mut first = sh("echo $MODE > first.txt");
    first.env.insert("MODE".to_string(), "override".to_string());
    let job = Job {
      commands: vec![first, sh("echo $MODE > second.txt")],
      ..Job::default()
    };

    let mut env = base_env(temp.path());
    env.insert("MODE".to_string(), "base".to_string());
    run_job(&job, &mut env, temp.path(), &NoBuiltins).unwrap();

    assert_eq!(fs::read_to_string(temp.path().join("first.txt")).unwrap().trim(), "override");
    assert_eq!(fs::read_to_string(temp.path().join("second.txt")).unwrap().trim(), "base");
  }

  #[test]
  fn inputs_are_piped_as_json() {
    let temp = TempDir::new().unwrap();
    let mut command = sh("cat > inputs.json");
    command.inputs = Some(json!({"threads": 4, "targets": ["all"]}));
    let job = Job {
      commands: vec![command],
      ..Job::default()
    };

    run(&job, temp.path()).unwrap();

    let written: serde_json::Value =
      serde_json::from_str(&fs::read_to_string(temp.path().join("inputs.json")).unwrap()).unwrap();
    assert_eq!(written, json!({"threads": 4, "targets": ["all"]}));
  }

  #[test]
  fn nonzero_exit_aborts_the_job() {
    let temp = TempDir::new().unwrap();
    let job = Job {
      commands: vec![sh("exit 3"), sh("echo never > never.txt")],
      ..Job::default()
    };

    let err = run(&job, temp.path()).unwrap_err();
    assert!(matches!(
      err,
      JobError::CommandFailed {
        index: 0,
        code: Some(3),
        ..
      }
    ));
    assert!(!temp.path().join("never.txt").exists());
  }

  #[test]
  fn undefined_variable_is_an_error() {
    let temp = TempDir::new().unwrap();
    let job = Job {
      commands: vec![sh("echo ${NO_SUCH_VAR}")],
      ..Job::default()
    };

    let err = run(&job, temp.path()).unwrap_err();
    assert!(matches!(err, JobError::UndefinedVariable { .. }));
  }

  #[test]
  fn environment_is_scrubbed() {
    let temp = TempDir::new().unwrap();
    let job = Job {
      commands: vec![sh("env > observed.txt")],
      ..Job::default()
    };

    run(&job, temp.path()).unwrap();

    let observed = fs::read_to_string(temp.path().join("observed.txt")).unwrap();
    assert!(!observed.contains("HOME="));
    assert!(observed.contains("BUILD="));
  }

  #[test]
  fn cwd_is_relative_to_build_dir() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("subdir")).unwrap();
    let mut command = sh("pwd > marker.txt");
    command.cwd = Some("subdir".to_string());
    let job = Job {
      commands: vec![command],
      ..Job::default()
    };

    run(&job, temp.path()).unwrap();
    assert!(temp.path().join("subdir/marker.txt").exists());
  }

  #[test]
  fn timeout_kills_the_command() {
    let temp = TempDir::new().unwrap();
    let mut slow = sh("sleep 30");
    slow.timeout = Some(1);
    let job = Job {
      commands: vec![slow],
      ..Job::default()
    };

    let start = Instant::now();
    let err = run(&job, temp.path()).unwrap_err();
    assert!(matches!(err, JobError::Timeout { seconds: 1, .. }));
    assert!(start.elapsed() < Duration::from_secs(10));
  }

  #[test]
  fn hit_commands_dispatch_to_builtins() {
    struct Recorder(Mutex<Vec<Vec<String>>>);
    impl BuiltinDispatch for Recorder {
      fn run(&self, argv: &[String], _env: &BTreeMap<String, String>, log: &mut dyn Write) -> Result<(), JobError> {
        writeln!(log, "builtin ran").ok();
        self.0.lock().unwrap().push(argv.to_vec());
        Ok(())
      }
    }

    let temp = TempDir::new().unwrap();
    let job = Job {
      commands: vec![Command {
        cmd: vec!["hit".to_string(), "assemble-profile".to_string()],
        env: BTreeMap::new(),
        inputs: None,
        to_var: None,
        cwd: None,
        timeout: None,
      }],
      ..Job::default()
    };

    let recorder = Recorder(Mutex::new(Vec::new()));
    let mut env = base_env(temp.path());
    run_job(&job, &mut env, temp.path(), &recorder).unwrap();

    assert_eq!(recorder.0.lock().unwrap().as_slice(), &[vec!["assemble-profile".to_string()]]);
    let log = fs::read_to_string(temp.path().join(BUILD_LOG_FILENAME)).unwrap();
    assert!(log.contains("builtin ran"));
  }
}
