use std::path::PathBuf;

use anyhow::Result;

use hashdist_lib::config::{StoreContext, default_home};

use crate::output::{done, field};

pub fn cmd_init_home(home: Option<PathBuf>) -> Result<()> {
  let home = match home {
    Some(home) => home,
    None => default_home()?,
  };
  let ctx = StoreContext::init_home(&home)?;

  done(&format!("initialized hashdist home at {}", home.display()));
  field("store", ctx.write_store().display());
  field("source cache", ctx.write_source_cache().display());
  field("gc roots", ctx.gc_roots.display());
  Ok(())
}
