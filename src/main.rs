use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tunerforge_lib::config::Config;
use tunerforge_lib::supervisor::{self, SupervisorConfig};

/// Exit code for configuration / usage errors
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "tunerforge", version, about = "Virtual IPTV tuner for Plex")]
struct Cli {
    /// Path to the config file (instance config, or supervisor config for
    /// the supervise subcommand)
    #[arg(long, global = true, env = "TUNERFORGE_CONFIG", default_value = "tunerforge.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one tuner instance (the default)
    Serve,
    /// Fetch the catalog once and exit
    Fetch,
    /// Supervise N sibling instances from a JSON instance list
    Supervise,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = match Config::load(&cli.config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("config error: {}", e);
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            match tunerforge_lib::serve(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("fatal: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Fetch => {
            let config = match Config::load(&cli.config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("config error: {}", e);
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            match tunerforge_lib::fetch_once(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("fatal: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Supervise => {
            let config = match SupervisorConfig::load(&cli.config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("supervisor config error: {}", e);
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            match supervisor::run(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("fatal: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
