//! Configuration loading and the explicit store context.
//!
//! All operations take a [`StoreContext`] value instead of consulting
//! module-level conventions. The context is built from `config.yaml`
//! (path overridable via `HDIST_CONFIG`) or assembled directly in tests.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::consts::{CONFIG_ENV_VAR, CONFIG_FILENAME, HOME_DIR_NAME};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// Unknown keys are rejected so a typo never silently changes layout.
  #[error("invalid config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("config declares no build stores")]
  NoBuildStore,

  #[error("HOME is not set and no config path was given")]
  NoHome,

  #[error("failed to create {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write config file {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// The recognized keys of `config.yaml`. Anything else is an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  /// Store roots; the first one is the write store, the rest are
  /// read-only fallbacks probed during resolve.
  pub build_stores: Vec<PathBuf>,
  pub source_caches: Vec<PathBuf>,
  pub gc_roots: PathBuf,
  /// Scratch space for transient caches.
  pub cache: PathBuf,
}

/// Resolved absolute paths threaded into every core operation.
#[derive(Debug, Clone)]
pub struct StoreContext {
  pub build_stores: Vec<PathBuf>,
  pub source_caches: Vec<PathBuf>,
  pub gc_roots: PathBuf,
  pub cache: PathBuf,
}

/// Returns the user's home directory.
pub fn home_dir() -> Result<PathBuf, ConfigError> {
  std::env::var("HOME").map(PathBuf::from).map_err(|_| ConfigError::NoHome)
}

/// Default hashdist home (`~/.hashdist`).
pub fn default_home() -> Result<PathBuf, ConfigError> {
  Ok(home_dir()?.join(HOME_DIR_NAME))
}

fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
  if let Ok(rest) = path.strip_prefix("~") {
    home.join(rest)
  } else {
    path.to_path_buf()
  }
}

impl StoreContext {
  /// Resolve a parsed [`Config`], expanding `~` against `home`.
  pub fn from_config(config: &Config, home: &Path) -> Result<Self, ConfigError> {
    if config.build_stores.is_empty() {
      return Err(ConfigError::NoBuildStore);
    }
    Ok(StoreContext {
      build_stores: config.build_stores.iter().map(|p| expand_tilde(p, home)).collect(),
      source_caches: config.source_caches.iter().map(|p| expand_tilde(p, home)).collect(),
      gc_roots: expand_tilde(&config.gc_roots, home),
      cache: expand_tilde(&config.cache, home),
    })
  }

  /// Load the context from `config.yaml`.
  ///
  /// Path resolution order: explicit argument, `HDIST_CONFIG`, then
  /// `~/.hashdist/config.yaml`.
  pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
    let path = match config_path {
      Some(p) => p.to_path_buf(),
      None => match std::env::var(CONFIG_ENV_VAR) {
        Ok(p) => PathBuf::from(p),
        Err(_) => default_home()?.join(CONFIG_FILENAME),
      },
    };

    let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
      path: path.clone(),
      source,
    })?;
    let config: Config = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
      path: path.clone(),
      source,
    })?;

    Self::from_config(&config, &home_dir()?)
  }

  /// The store root new artifacts are written to.
  pub fn write_store(&self) -> &Path {
    &self.build_stores[0]
  }

  /// The source cache new entries are written to.
  pub fn write_source_cache(&self) -> &Path {
    &self.source_caches[0]
  }

  /// Create the directory skeleton for a fresh hashdist home and write
  /// a default `config.yaml` if none exists yet.
  pub fn init_home(home: &Path) -> Result<Self, ConfigError> {
    let mkdir = |path: PathBuf| -> Result<PathBuf, ConfigError> {
      fs::create_dir_all(&path).map_err(|source| ConfigError::CreateDir {
        path: path.clone(),
        source,
      })?;
      Ok(path)
    };

    let ctx = StoreContext {
      build_stores: vec![mkdir(home.to_path_buf())?],
      source_caches: vec![mkdir(home.join("source"))?],
      gc_roots: mkdir(home.join("gcroots"))?,
      cache: mkdir(home.join("cache"))?,
    };
    mkdir(home.join("opt"))?;
    mkdir(home.join("bld"))?;

    let config_path = home.join(CONFIG_FILENAME);
    if !config_path.exists() {
      let config = Config {
        build_stores: ctx.build_stores.clone(),
        source_caches: ctx.source_caches.clone(),
        gc_roots: ctx.gc_roots.clone(),
        cache: ctx.cache.clone(),
      };
      let rendered = serde_yaml::to_string(&config).expect("config serializes");
      fs::write(&config_path, rendered).map_err(|source| ConfigError::Write {
        path: config_path.clone(),
        source,
      })?;
      info!(path = %config_path.display(), "wrote default config");
    }

    Ok(ctx)
  }

  /// A context rooted entirely under one directory. Test installations
  /// and one-off scripts use this instead of a config file.
  pub fn under(root: &Path) -> Self {
    StoreContext {
      build_stores: vec![root.to_path_buf()],
      source_caches: vec![root.join("source")],
      gc_roots: root.join("gcroots"),
      cache: root.join("cache"),
    }
  }
}
