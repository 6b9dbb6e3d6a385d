use std::path::Path;

use anyhow::Result;

use hashdist_lib::links;

use crate::output::done;

pub fn cmd_rewrite_shebangs(dir: &Path) -> Result<()> {
  let changed = links::rewrite_shebangs(dir)?;
  done(&format!("rewrote {changed} shebang(s) under {}", dir.display()));
  Ok(())
}
