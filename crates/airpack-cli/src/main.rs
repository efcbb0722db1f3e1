//! Airpack CLI - build, publish and verify airgap packages

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use airpack_core::Config;

mod commands;
mod display;
mod error;
mod exit_codes;
mod util;

use error::{CliError, Result};

#[derive(Parser)]
#[command(name = "airpack")]
#[command(author = "Airpack Contributors")]
#[command(version)]
#[command(about = "Build, publish and verify airgap packages", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Content cache directory
    #[arg(long, global = true, value_name = "PATH")]
    cache: Option<PathBuf>,

    /// Scratch directory for package builds
    #[arg(long, global = true, value_name = "PATH")]
    tmpdir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, publish, pull and check packages
    #[command(subcommand)]
    Package(PackageCommands),

    /// Generate a signing key pair
    Keygen {
        /// Output directory for keys (default: ~/.airpack)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite existing keys
        #[arg(long)]
        force: bool,

        /// Do not protect the secret key with a password
        #[arg(long)]
        no_password: bool,
    },
}

#[derive(Subcommand)]
enum PackageCommands {
    /// Build a package from an airpack.yaml
    Create(CreateArgs),

    /// Publish a package archive, or a package directory as a skeleton
    Publish {
        /// Package archive or package directory
        source: PathBuf,

        /// Repository to publish under (oci://registry/repository)
        repository: String,

        #[command(flatten)]
        signing: SigningArgs,

        /// Skip TLS for every registry
        #[arg(long)]
        insecure: bool,
    },

    /// Pull a published package into a local archive
    Pull {
        /// Package reference (oci://registry/repository/name:tag)
        reference: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Skip TLS for every registry
        #[arg(long)]
        insecure: bool,
    },

    /// Show the definition of a package archive
    Inspect {
        /// Package archive, split archive (.part000) or directory
        archive: PathBuf,

        /// Print the raw airpack.yaml
        #[arg(long)]
        raw: bool,
    },

    /// Check package integrity and signature
    Verify {
        /// Package archive, split archive (.part000) or directory
        archive: PathBuf,

        /// Public key to check the signature against
        #[arg(short, long)]
        key: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Directory holding airpack.yaml
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Output directory, or an oci:// repository to publish into
    #[arg(short, long, default_value = ".")]
    pub output: String,

    /// Split the archive into parts of this many MB (0 disables splitting)
    #[arg(short = 'm', long, default_value_t = 0)]
    pub max_package_size: u64,

    #[command(flatten)]
    pub signing: SigningArgs,

    /// Previous package archive to build a differential package against
    #[arg(long)]
    pub differential: Option<PathBuf>,

    /// Do not generate the SBOM catalog
    #[arg(long)]
    pub skip_sbom: bool,

    /// Registry override applied to image references (docker.io=mirror.local)
    #[arg(long = "registry-override", value_name = "FROM=TO")]
    pub registry_overrides: Vec<String>,

    /// Target architecture (default from configuration)
    #[arg(short, long)]
    pub architecture: Option<String>,

    /// Skip TLS for every registry
    #[arg(long)]
    pub insecure: bool,

    /// Parallel registry transfers
    #[arg(long)]
    pub oci_concurrency: Option<usize>,
}

#[derive(Args)]
pub struct SigningArgs {
    /// Secret key used to sign the package
    #[arg(long)]
    pub signing_key: Option<PathBuf>,

    /// Password of the secret key (prompted when needed)
    #[arg(long, env = "AIRPACK_SIGNING_KEY_PASSWORD", hide_env_values = true)]
    pub signing_key_password: Option<String>,
}

/// Settings shared by every command
pub struct Context {
    pub config: Config,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = Config::load().map_err(|e| CliError::configuration(e.to_string()))?;
        if let Some(cache) = &cli.cache {
            config.cache_path = cache.clone();
        }
        if let Some(tmpdir) = &cli.tmpdir {
            config.tmp_dir = Some(tmpdir.clone());
        }
        tracing::debug!(cache = %config.cache_path.display(), "loaded configuration");
        Ok(Self { config })
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("AIRPACK_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Keygen {
            ref output,
            force,
            no_password,
        } => commands::keygen::run(output.as_deref(), force, no_password),

        Commands::Package(ref command) => {
            let ctx = Context::load(&cli)?;
            match command {
                PackageCommands::Create(args) => commands::create::run(&ctx, args).await,
                PackageCommands::Publish {
                    source,
                    repository,
                    signing,
                    insecure,
                } => commands::publish::run(&ctx, source, repository, signing, *insecure).await,
                PackageCommands::Pull {
                    reference,
                    output,
                    insecure,
                } => commands::pull::run(&ctx, reference, output, *insecure).await,
                PackageCommands::Inspect { archive, raw } => commands::inspect::run(archive, *raw),
                PackageCommands::Verify { archive, key } => {
                    commands::verify::run(archive, key.as_deref())
                }
            }
        }
    }
}

fn main() {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_logging(cli.debug);

    let result = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(run(cli)),
        Err(e) => Err(CliError::internal(format!("failed to start runtime: {}", e))),
    };

    if let Err(err) = result {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
