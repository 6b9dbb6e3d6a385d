use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};

use hashdist_lib::config::StoreContext;
use hashdist_lib::gc::{GcRoots, Retention, RetentionPolicy, collect_garbage};
use hashdist_lib::store::BuildStore;

use crate::output::{OutputFormat, done, emit_json, field, human_elapsed, human_size, note};

pub fn cmd_gcroot_add(ctx: StoreContext, name: &str, target: &Path) -> Result<()> {
  let target = target
    .canonicalize()
    .with_context(|| format!("resolving {}", target.display()))?;
  GcRoots::new(&ctx.gc_roots).register(name, &target)?;
  done(&format!("root '{name}' -> {}", target.display()));
  Ok(())
}

pub fn cmd_gcroot_rm(ctx: StoreContext, name: &str) -> Result<()> {
  GcRoots::new(&ctx.gc_roots).unregister(name)?;
  done(&format!("removed root '{name}'"));
  Ok(())
}

pub fn cmd_gcroot_list(ctx: StoreContext) -> Result<()> {
  let roots = GcRoots::new(&ctx.gc_roots).list()?;
  if roots.is_empty() {
    note("no gc roots registered");
  }
  for (name, target) in roots {
    println!("{name} -> {}", target.display());
  }
  Ok(())
}

/// Parse repeated `--keep tag=forever` / `--keep tag=<duration>` rules.
fn parse_keep_rules(rules: &[String]) -> Result<RetentionPolicy> {
  let mut policy = RetentionPolicy::default();
  for rule in rules {
    let Some((tag, value)) = rule.split_once('=') else {
      bail!("--keep takes tag=forever or tag=<duration>, got '{rule}'");
    };
    let retention = if value == "forever" {
      Retention::Forever
    } else {
      let age = humantime::parse_duration(value).with_context(|| format!("in --keep {rule}"))?;
      Retention::MaxAge(age)
    };
    policy = policy.keep(tag, retention);
  }
  Ok(policy)
}

pub fn cmd_gc(ctx: StoreContext, dry_run: bool, keep: &[String], output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let policy = parse_keep_rules(keep)?;
  let roots = GcRoots::new(&ctx.gc_roots);
  let store = BuildStore::new(ctx);

  let result = collect_garbage(&store, &roots, &policy, dry_run)?;

  if output.is_json() {
    emit_json(&result)?;
  } else {
    if dry_run {
      note("dry run - no changes made");
    } else {
      done("garbage collection complete");
    }
    field("artifacts removed", result.stats.artifacts_deleted);
    field("sources removed", result.stats.sources_deleted);
    field("space freed", human_size(result.stats.artifacts_bytes_freed));
    field("duration", human_elapsed(start.elapsed()));
  }

  Ok(())
}
