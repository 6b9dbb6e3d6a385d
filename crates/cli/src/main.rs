//! hit: the hashdist umbrella CLI.
//!
//! Thin wrapper over `hashdist-lib`: every subcommand parses its
//! arguments, loads the store context, and calls into the core. Exit
//! codes: 0 success, 1 build failure, 2 usage error, 3 store I/O error,
//! 4 integrity failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hashdist_lib::config::StoreContext;
use hashdist_lib::source::SourceError;
use hashdist_lib::store::StoreError;

mod cmd;
mod output;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "hit")]
#[command(version, about = "Content-addressed build cache and profile composer")]
struct Cli {
  /// Config file (default: $HDIST_CONFIG, then ~/.hashdist/config.yaml)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Create the hashdist home skeleton and a default config
  InitHome {
    /// Where to create the home (default ~/.hashdist)
    #[arg(long)]
    home: Option<PathBuf>,
  },

  /// Build a spec, or print the cached artifact path
  Build {
    /// Path to the build.json document
    spec: PathBuf,
    /// Resolve a virtual import, e.g. --virtual unix=coreutils/9.4/<hash>
    #[arg(long = "virtual", value_name = "ALIAS=ID")]
    virtuals: Vec<String>,
  },

  /// Probe the store for a spec file or an artifact id
  Resolve {
    /// A build.json path, or name/version/hash (short hashes accepted)
    what: String,
  },

  /// Fetch a URL into the source cache and print its key
  Fetch {
    url: String,
    /// Source type when the URL suffix is ambiguous (tar.gz, zip, ...)
    #[arg(long = "type", value_name = "SCHEME")]
    scheme: Option<String>,
    /// Accept content that changed under a known URL
    #[arg(long)]
    rehash: bool,
  },

  /// Fetch a git ref into the shared object pool and print its key
  FetchGit { url: String, refspec: String },

  /// Store a local file or directory and print its key
  Put { path: PathBuf },

  /// Unpack a source key into a directory
  Unpack {
    key: String,
    target: PathBuf,
    /// Leading path components to drop
    #[arg(long, default_value_t = 0)]
    strip: u32,
  },

  /// Build a profile artifact over the given artifacts
  BuildProfile {
    /// Root artifact ids
    #[arg(required = true)]
    ids: Vec<String>,
  },

  /// In-build helper: assemble the profile described by $ARTIFACT
  AssembleProfile,

  /// Manage named gc roots
  Gcroot {
    #[command(subcommand)]
    action: GcrootAction,
  },

  /// Remove everything not reachable from the gc roots
  Gc {
    /// Report what would be removed without deleting
    #[arg(long)]
    dry_run: bool,
    /// Retention per source tag, e.g. --keep git=forever --keep targz=30d
    #[arg(long = "keep", value_name = "TAG=POLICY")]
    keep: Vec<String>,
    #[arg(long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Rewrite shebangs under a directory to the relocatable form
  RewriteShebangs { dir: PathBuf },
}

#[derive(Subcommand)]
enum GcrootAction {
  /// Register (or replace) a named root pointing at an artifact
  Add { name: String, target: PathBuf },
  /// Remove a named root
  Rm { name: String },
  /// List registered roots
  List,
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

  match run(cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      eprintln!("error: {err:#}");
      ExitCode::from(exit_code(&err))
    }
  }
}

fn run(cli: Cli) -> Result<()> {
  match cli.command {
    // These two need no store context.
    Commands::InitHome { home } => cmd::cmd_init_home(home),
    Commands::RewriteShebangs { dir } => cmd::cmd_rewrite_shebangs(&dir),

    command => {
      let ctx = StoreContext::load(cli.config.as_deref())?;
      match command {
        Commands::InitHome { .. } | Commands::RewriteShebangs { .. } => unreachable!("handled above"),
        Commands::Build { spec, virtuals } => cmd::cmd_build(ctx, &spec, &virtuals),
        Commands::Resolve { what } => cmd::cmd_resolve(ctx, &what),
        Commands::Fetch { url, scheme, rehash } => cmd::cmd_fetch(ctx, &url, scheme.as_deref(), rehash),
        Commands::FetchGit { url, refspec } => cmd::cmd_fetch_git(ctx, &url, &refspec),
        Commands::Put { path } => cmd::cmd_put(ctx, &path),
        Commands::Unpack { key, target, strip } => cmd::cmd_unpack(ctx, &key, &target, strip),
        Commands::BuildProfile { ids } => cmd::cmd_build_profile(ctx, &ids),
        Commands::AssembleProfile => cmd::cmd_assemble_profile(ctx),
        Commands::Gcroot { action } => match action {
          GcrootAction::Add { name, target } => cmd::cmd_gcroot_add(ctx, &name, &target),
          GcrootAction::Rm { name } => cmd::cmd_gcroot_rm(ctx, &name),
          GcrootAction::List => cmd::cmd_gcroot_list(ctx),
        },
        Commands::Gc { dry_run, keep, output } => cmd::cmd_gc(ctx, dry_run, &keep, output),
      }
    }
  }
}

/// Map the error chain onto the documented exit codes.
fn exit_code(err: &anyhow::Error) -> u8 {
  for cause in err.chain() {
    if let Some(store) = cause.downcast_ref::<StoreError>() {
      let code = match store {
        StoreError::BuildFailed { .. } => Some(1),
        StoreError::StoreIo { .. } | StoreError::Lock(_) => Some(3),
        StoreError::Integrity { .. } => Some(4),
        _ => None,
      };
      if let Some(code) = code {
        return code;
      }
    }
    if let Some(source) = cause.downcast_ref::<SourceError>() {
      let code = match source {
        SourceError::CorruptSource { .. } | SourceError::UrlContentChanged { .. } => Some(4),
        SourceError::Io { .. } => Some(3),
        _ => None,
      };
      if let Some(code) = code {
        return code;
      }
    }
  }
  1
}
