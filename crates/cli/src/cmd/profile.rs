use std::collections::BTreeMap;

use anyhow::{Context, Result};

use hashdist_lib::config::StoreContext;
use hashdist_lib::profile;
use hashdist_lib::spec::ArtifactId;
use hashdist_lib::store::BuildStore;

/// Build a profile artifact over the given root artifacts.
pub fn cmd_build_profile(ctx: StoreContext, ids: &[String]) -> Result<()> {
  let mut roots = Vec::with_capacity(ids.len());
  for raw in ids {
    let id: ArtifactId = raw.parse().with_context(|| format!("artifact id '{raw}'"))?;
    roots.push(id);
  }

  let store = BuildStore::new(ctx);
  let dir = profile::build_profile(&store, &roots)?;
  println!("{}", dir.display());
  Ok(())
}

/// The in-build assembly helper, for jobs that spawn `hit` as a real
/// subprocess: reads `ARTIFACT` and `HDIST_VIRTUALS` from the process
/// environment.
pub fn cmd_assemble_profile(ctx: StoreContext) -> Result<()> {
  let env: BTreeMap<String, String> = std::env::vars().collect();
  let store = BuildStore::new(ctx);
  let mut stdout = std::io::stdout();
  profile::assemble_builtin(&store, &env, &mut stdout)?;
  Ok(())
}
