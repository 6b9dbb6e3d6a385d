use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use hashdist_lib::config::StoreContext;
use hashdist_lib::spec::{ArtifactId, BuildSpec};
use hashdist_lib::store::BuildStore;

/// Probe the store. `what` is either a path to a spec document or an
/// artifact id (full or short form).
pub fn cmd_resolve(ctx: StoreContext, what: &str) -> Result<()> {
  let store = BuildStore::new(ctx);

  let resolved = if Path::new(what).is_file() {
    let raw = fs::read(what).with_context(|| format!("reading {what}"))?;
    let spec = BuildSpec::from_json(&raw)?;
    store.resolve_spec(&spec)?
  } else {
    let id: ArtifactId = what.parse()?;
    store.resolve_id(&id)?
  };

  match resolved {
    Some(dir) => {
      println!("{}", dir.display());
      Ok(())
    }
    None => bail!("not in store: {what}"),
  }
}
