use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use vendorkit_core::{
    DependencyAuditor, DependencyGraphWalker, PipelineOptions, ProcessRunner, VendorConfig,
    VendorPipeline,
};

#[derive(Parser)]
#[command(name = "vendorkit")]
#[command(version)]
#[command(about = "Vendor build-and-distribute pipeline and resolution auditor", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Vendor configuration file (YAML, or JSON by extension)
    #[arg(short, long, value_name = "FILE", default_value = "vendorkit.yaml", global = true)]
    config: PathBuf,

    /// Project root that vendor paths are relative to
    #[arg(long, value_name = "DIR", default_value = ".", global = true)]
    project_root: PathBuf,

    /// Only print warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Print debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install, build, pack and unpack every configured vendor
    Vendor {
        /// Scratch directory for archives and backups (default: <root>/.vendorkit/scratch)
        #[arg(long, value_name = "DIR")]
        scratch_dir: Option<PathBuf>,

        /// Remove the scratch directory after a successful run
        #[arg(long)]
        clean_scratch: bool,
    },

    /// Report where the resolver places every vendored package (JSON on stdout)
    Audit {
        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },

    /// Validate the configuration and exit
    Check,
}

fn init_logging(global: &GlobalArgs) {
    let level = if global.quiet {
        "warn"
    } else if global.verbose {
        "debug"
    } else {
        "info"
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global);

    let config = VendorConfig::from_file(&cli.global.config)
        .with_context(|| format!("Failed to load {}", cli.global.config.display()))?;
    let project_root = cli.global.project_root;

    match cli.command {
        Commands::Vendor {
            scratch_dir,
            clean_scratch,
        } => {
            let mut options = PipelineOptions::new(&project_root).with_env_debug_root();
            if let Some(dir) = scratch_dir {
                options.scratch_dir = dir;
            }
            options.clean_scratch = clean_scratch;

            if let Some(debug_root) = &options.debug_root {
                log::warn!("debug root active: unpacking under {}", debug_root.display());
            }

            let runner = ProcessRunner;
            let report = VendorPipeline::new(&config, &runner, options).run()?;

            for failure in &report.failed_targets {
                log::warn!(
                    "{} was not unpacked into {}: {}",
                    failure.package,
                    failure.target,
                    failure.error
                );
            }
            Ok(())
        }

        Commands::Audit { pretty } => {
            let runner = ProcessRunner;
            let walker = DependencyGraphWalker::new(&runner, &config);
            let report = DependencyAuditor::new(&config, &walker, &project_root).audit();

            let json = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{}", json);
            Ok(())
        }

        Commands::Check => {
            log::info!(
                "{} is valid ({} vendor(s))",
                cli.global.config.display(),
                config.vendor_packages.len()
            );
            Ok(())
        }
    }
}
