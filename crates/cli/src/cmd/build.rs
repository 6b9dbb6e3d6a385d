use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use hashdist_lib::config::StoreContext;
use hashdist_lib::spec::{ArtifactId, BuildSpec};
use hashdist_lib::store::BuildStore;

/// Parse repeated `--virtual alias=name/version/hash` arguments.
pub fn parse_virtual_args(args: &[String]) -> Result<BTreeMap<String, ArtifactId>> {
  let mut virtuals = BTreeMap::new();
  for arg in args {
    let Some((alias, id)) = arg.split_once('=') else {
      bail!("--virtual takes alias=artifact-id, got '{arg}'");
    };
    let alias = alias.strip_prefix("virtual:").unwrap_or(alias);
    let id: ArtifactId = id.parse().with_context(|| format!("in --virtual {arg}"))?;
    virtuals.insert(alias.to_string(), id);
  }
  Ok(virtuals)
}

pub fn cmd_build(ctx: StoreContext, spec_path: &Path, virtual_args: &[String]) -> Result<()> {
  let raw = fs::read(spec_path).with_context(|| format!("reading {}", spec_path.display()))?;
  let spec = BuildSpec::from_json(&raw)?;
  let virtuals = parse_virtual_args(virtual_args)?;

  let store = BuildStore::new(ctx);
  let dir = store.build(&spec, &virtuals)?;
  println!("{}", dir.display());
  Ok(())
}
