//! Constants shared across the crate.

/// Directory name under `$HOME` holding the default store layout.
pub const HOME_DIR_NAME: &str = ".hashdist";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "HDIST_CONFIG";

/// Config file name inside the hashdist home.
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Number of SHA-256 bytes kept in a digest (27 base64 chars).
pub const DIGEST_NBYTES: usize = 20;

/// Initial length of the short hash used for on-disk artifact paths.
pub const SHORT_HASH_LEN: usize = 4;

/// Version string used when a build spec omits `version`.
pub const DEFAULT_VERSION: &str = "n";

/// The canonical spec written into every artifact.
pub const BUILD_SPEC_FILENAME: &str = "build.json";

/// Install metadata at the root of every artifact.
pub const ARTIFACT_META_FILENAME: &str = "artifact.json";

/// Build log, plain while the job runs, gzipped on success.
pub const BUILD_LOG_FILENAME: &str = "build.log";
pub const BUILD_LOG_GZ_FILENAME: &str = "build.log.gz";

/// Aggregated environment exported by an assembled profile.
pub const PROFILE_META_FILENAME: &str = "profile.json";

/// First command token granted to the in-tree helper subcommands.
pub const SELF_COMMAND: &str = "hit";
