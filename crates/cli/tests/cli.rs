//! End-to-end tests driving the `hit` binary.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use hashdist_lib::spec::BuildSpec;

/// Initialize a hashdist home inside a tempdir; returns the config
/// path every subsequent command points at.
fn setup() -> (TempDir, PathBuf) {
  let temp = TempDir::new().unwrap();
  let home = temp.path().join("home");
  hit_at(Path::new("/nonexistent"))
    .args(["init-home", "--home"])
    .arg(&home)
    .assert()
    .success();
  let config = home.join("config.yaml");
  (temp, config)
}

fn hit_at(config: &Path) -> Command {
  let mut cmd = Command::cargo_bin("hit").unwrap();
  cmd.env("HDIST_CONFIG", config);
  cmd
}

fn stdout_line(cmd: &mut Command) -> String {
  let output = cmd.assert().success().get_output().stdout.clone();
  String::from_utf8(output).unwrap().trim().to_string()
}

/// Build an artifact standing in for `virtual:unix`, exposing the host
/// shell, and return (artifact id, virtual flag value).
fn install_unix(temp: &Path, config: &Path) -> (String, String) {
  let spec_path = temp.join("unix.json");
  fs::write(
    &spec_path,
    r#"{"name": "unix", "version": "host", "build": {"import": [], "commands": []}}"#,
  )
  .unwrap();

  let dir = stdout_line(hit_at(config).arg("build").arg(&spec_path));
  let sh = Path::new(&dir).join("sh");
  if !sh.exists() {
    std::os::unix::fs::symlink("/bin/sh", &sh).unwrap();
  }

  let spec = BuildSpec::from_json(&fs::read(&spec_path).unwrap()).unwrap();
  let id = spec.artifact_id().unwrap().to_string();
  (id.clone(), format!("unix={id}"))
}

fn write_spec(path: &Path, name: &str, script: &str) {
  let spec = serde_json::json!({
    "name": name,
    "version": "1.0",
    "build": {
      "import": [{"ref": "UNIX", "id": "virtual:unix"}],
      "commands": [{"cmd": ["${UNIX}/sh", "-c", script]}]
    }
  });
  fs::write(path, serde_json::to_vec(&spec).unwrap()).unwrap();
}

#[test]
fn init_home_creates_the_skeleton() {
  let (temp, config) = setup();
  let home = temp.path().join("home");
  assert!(home.join("opt").is_dir());
  assert!(home.join("bld").is_dir());
  assert!(home.join("source").is_dir());
  assert!(home.join("gcroots").is_dir());
  assert!(config.is_file());
}

#[test]
fn put_and_unpack_roundtrip() {
  let (temp, config) = setup();
  let payload = temp.path().join("payload");
  fs::create_dir_all(payload.join("nested")).unwrap();
  fs::write(payload.join("nested/data.txt"), "hello").unwrap();

  let key = stdout_line(hit_at(&config).arg("put").arg(&payload));
  assert!(key.starts_with("dir:"));

  // Re-putting the same tree yields the same key.
  let key2 = stdout_line(hit_at(&config).arg("put").arg(&payload));
  assert_eq!(key, key2);

  let out = temp.path().join("out");
  hit_at(&config).arg("unpack").arg(&key).arg(&out).assert().success();
  assert_eq!(fs::read_to_string(out.join("nested/data.txt")).unwrap(), "hello");
}

#[test]
fn unpack_unknown_key_fails() {
  let (temp, config) = setup();
  hit_at(&config)
    .arg("unpack")
    .arg("dir:NoSuchDigest000000000000000")
    .arg(temp.path().join("out"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("not found"));
}

#[test]
fn build_resolve_and_cache_hit() {
  let (temp, config) = setup();
  let (_unix_id, virtual_flag) = install_unix(temp.path(), &config);

  let spec_path = temp.path().join("tool.json");
  write_spec(&spec_path, "tool", "mkdir -p $ARTIFACT/bin && echo ok > $ARTIFACT/bin/tool");

  let dir = stdout_line(hit_at(&config).arg("build").arg(&spec_path).arg("--virtual").arg(&virtual_flag));
  assert!(Path::new(&dir).join("bin/tool").is_file());
  assert!(Path::new(&dir).join("build.json").is_file());
  assert!(Path::new(&dir).join("build.log.gz").is_file());

  // Rebuilding is a cache hit on the same path.
  let again = stdout_line(hit_at(&config).arg("build").arg(&spec_path).arg("--virtual").arg(&virtual_flag));
  assert_eq!(dir, again);

  // Resolve by spec path and by full id.
  assert_eq!(stdout_line(hit_at(&config).arg("resolve").arg(&spec_path)), dir);
  let id = BuildSpec::from_json(&fs::read(&spec_path).unwrap())
    .unwrap()
    .artifact_id()
    .unwrap()
    .to_string();
  assert_eq!(stdout_line(hit_at(&config).arg("resolve").arg(&id)), dir);
}

#[test]
fn resolve_miss_fails() {
  let (_temp, config) = setup();
  hit_at(&config)
    .arg("resolve")
    .arg("ghost/1.0/AbCdEf0123456789_-AbCdEf012")
    .assert()
    .failure()
    .stderr(predicate::str::contains("not in store"));
}

#[test]
fn failing_build_exits_with_build_failure_code() {
  let (temp, config) = setup();
  let (_unix_id, virtual_flag) = install_unix(temp.path(), &config);

  let spec_path = temp.path().join("broken.json");
  write_spec(&spec_path, "broken", "exit 9");

  hit_at(&config)
    .arg("build")
    .arg(&spec_path)
    .arg("--virtual")
    .arg(&virtual_flag)
    .assert()
    .code(1)
    .stderr(predicate::str::contains("failed"));
}

#[test]
fn corrupt_store_link_is_an_integrity_failure() {
  let (temp, config) = setup();
  let (unix_id, _virtual_flag) = install_unix(temp.path(), &config);

  // Point the full-hash symlink somewhere wrong.
  let dir = stdout_line(hit_at(&config).arg("resolve").arg(&unix_id));
  let base = Path::new(&dir).parent().unwrap().to_path_buf();
  let full = unix_id.rsplit('/').next().unwrap();
  let link = base.join(full);
  fs::remove_file(&link).unwrap();
  std::os::unix::fs::symlink("nowhere", &link).unwrap();

  hit_at(&config).arg("resolve").arg(&unix_id).assert().code(4);
}

#[test]
fn missing_subcommand_is_a_usage_error() {
  let mut cmd = Command::cargo_bin("hit").unwrap();
  cmd.assert().code(2);
}

#[test]
fn profile_build_links_artifacts() {
  let (temp, config) = setup();
  let (_unix_id, virtual_flag) = install_unix(temp.path(), &config);

  let spec = serde_json::json!({
    "name": "zlib",
    "version": "1.2.7",
    "profile_install": {
      "install": {"parameters": {"links": [
        {"action": "symlink", "select": "lib/**", "prefix": "$ARTIFACT", "target": "$PROFILE"}
      ]}}
    },
    "build": {
      "import": [{"ref": "UNIX", "id": "virtual:unix"}],
      "commands": [{"cmd": ["${UNIX}/sh", "-c", "mkdir -p $ARTIFACT/lib && echo z > $ARTIFACT/lib/libz.so"]}]
    }
  });
  let spec_path = temp.path().join("zlib.json");
  fs::write(&spec_path, serde_json::to_vec(&spec).unwrap()).unwrap();

  stdout_line(hit_at(&config).arg("build").arg(&spec_path).arg("--virtual").arg(&virtual_flag));
  let id = BuildSpec::from_json(&fs::read(&spec_path).unwrap())
    .unwrap()
    .artifact_id()
    .unwrap()
    .to_string();

  let profile_dir = stdout_line(hit_at(&config).arg("build-profile").arg(&id));
  let link = Path::new(&profile_dir).join("lib/libz.so");
  assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
  assert!(Path::new(&profile_dir).join("profile.json").is_file());

  // Same membership, same profile.
  let again = stdout_line(hit_at(&config).arg("build-profile").arg(&id));
  assert_eq!(profile_dir, again);
}

#[test]
fn gc_sweeps_unrooted_artifacts_and_honors_roots() {
  let (temp, config) = setup();
  let (unix_id, _virtual_flag) = install_unix(temp.path(), &config);
  let dir = stdout_line(hit_at(&config).arg("resolve").arg(&unix_id));

  // Rooted: survives.
  hit_at(&config)
    .args(["gcroot", "add", "keeper"])
    .arg(&dir)
    .assert()
    .success();
  hit_at(&config).arg("gc").assert().success();
  hit_at(&config).arg("resolve").arg(&unix_id).assert().success();

  // Unrooted: collected.
  hit_at(&config).args(["gcroot", "rm", "keeper"]).assert().success();
  hit_at(&config)
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("artifacts removed: 1"));
  hit_at(&config).arg("resolve").arg(&unix_id).assert().failure();
}

#[test]
fn gcroot_list_shows_targets() {
  let (temp, config) = setup();
  let target = temp.path().join("somewhere");
  fs::create_dir_all(&target).unwrap();

  hit_at(&config)
    .args(["gcroot", "add", "current"])
    .arg(&target)
    .assert()
    .success();
  hit_at(&config)
    .args(["gcroot", "list"])
    .assert()
    .success()
    .stdout(predicate::str::contains("current ->"));
}

#[test]
fn rewrite_shebangs_command() {
  let (temp, _config) = setup();
  let dir = temp.path().join("scripts");
  fs::create_dir_all(&dir).unwrap();
  fs::write(dir.join("tool"), "#!/opt/python/bin/python3\nmain()\n").unwrap();

  Command::cargo_bin("hit")
    .unwrap()
    .arg("rewrite-shebangs")
    .arg(&dir)
    .assert()
    .success();

  let rewritten = fs::read_to_string(dir.join("tool")).unwrap();
  assert!(rewritten.starts_with("#!/bin/sh\n"));
  assert!(rewritten.contains("python3"));
}

#[test]
fn nohash_env_change_is_still_a_cache_hit() {
  let (temp, config) = setup();
  let (_unix_id, virtual_flag) = install_unix(temp.path(), &config);

  let spec_path = temp.path().join("tunable.json");
  write_spec(&spec_path, "tunable", "true");
  let dir = stdout_line(hit_at(&config).arg("build").arg(&spec_path).arg("--virtual").arg(&virtual_flag));

  // Same spec plus an env_nohash block: same artifact.
  let mut spec: serde_json::Value = serde_json::from_slice(&fs::read(&spec_path).unwrap()).unwrap();
  spec["build"]["env_nohash"] = serde_json::json!({"MAKEFLAGS": "-j4"});
  fs::write(&spec_path, serde_json::to_vec(&spec).unwrap()).unwrap();

  let again = stdout_line(hit_at(&config).arg("build").arg(&spec_path).arg("--virtual").arg(&virtual_flag));
  assert_eq!(dir, again);
}

// Keep the host toolchain honest: the sandbox should not leak PATH.
#[test]
fn build_env_is_scrubbed() {
  let (temp, config) = setup();
  let (_unix_id, virtual_flag) = install_unix(temp.path(), &config);

  let spec_path = temp.path().join("scrub.json");
  write_spec(&spec_path, "scrub", "env > $ARTIFACT/env.txt");
  let dir = stdout_line(hit_at(&config).arg("build").arg(&spec_path).arg("--virtual").arg(&virtual_flag));

  let observed = fs::read_to_string(Path::new(&dir).join("env.txt")).unwrap();
  assert!(!observed.contains("HDIST_CONFIG="));
  assert!(observed.contains("ARTIFACT="));
  assert!(observed.contains("HDIST_CFLAGS="));
}
