use std::path::Path;

use anyhow::Result;

use hashdist_lib::config::StoreContext;
use hashdist_lib::source::{Scheme, SourceCache, SourceKey};

use crate::output::note;

pub fn cmd_fetch(ctx: StoreContext, url: &str, scheme: Option<&str>, rehash: bool) -> Result<()> {
  let cache = SourceCache::new(ctx.write_source_cache());
  let key = match (scheme, rehash) {
    (Some(scheme), _) => {
      let scheme: Scheme = scheme.parse().map_err(anyhow::Error::msg)?;
      cache.fetch_as(url, scheme)?
    }
    (None, true) => cache.fetch_rehash(url)?,
    (None, false) => cache.fetch(url)?,
  };
  println!("{key}");
  Ok(())
}

pub fn cmd_fetch_git(ctx: StoreContext, url: &str, refspec: &str) -> Result<()> {
  let cache = SourceCache::new(ctx.write_source_cache());
  let key = cache.fetch_git(url, refspec)?;
  println!("{key}");
  Ok(())
}

pub fn cmd_put(ctx: StoreContext, path: &Path) -> Result<()> {
  let cache = SourceCache::new(ctx.write_source_cache());
  let key = cache.put(path)?;
  println!("{key}");
  Ok(())
}

pub fn cmd_unpack(ctx: StoreContext, key: &str, target: &Path, strip: u32) -> Result<()> {
  let key: SourceKey = key.parse().map_err(anyhow::Error::msg)?;

  // Probe every configured cache; the entry may live in a read-only one.
  for cache_root in &ctx.source_caches {
    let cache = SourceCache::new(cache_root);
    if cache.contains(&key) {
      cache.unpack(&key, target, strip)?;
      note(&format!("unpacked {key} into {}", target.display()));
      return Ok(());
    }
  }
  anyhow::bail!("source not found: {key}")
}
