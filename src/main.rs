use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dags::config::Config;
use dags::server;
use dags::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "dags")]
#[command(version)]
#[command(about = "Grid job-distribution scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler server
    Run(RunArgs),

    /// Write the default configuration file and exit
    DumpConfig {
        /// Destination path for the TOML file
        path: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Verbosity, 0 (quiet) through 4 (trace); overrides the config file
    #[arg(short = 'v', long)]
    verbosity: Option<u8>,

    /// Path to the TOML configuration file
    #[arg(long, short = 'f', default_value = "dags.toml")]
    config: PathBuf,

    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Maximum simultaneously open connections
    #[arg(long, short = 'c')]
    max_connections: Option<usize>,

    /// Maximum concurrently running handlers
    #[arg(long, short = 't')]
    max_workers: Option<usize>,
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 | 2 => "info",
        3 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

async fn run_server(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let missing_config = !args.config.exists();
    let mut config = if missing_config {
        Config::default()
    } else {
        Config::load(&args.config)?
    };
    if let Some(v) = args.verbosity {
        config.server.verbosity = v.min(4);
    }
    init_logging(config.server.verbosity);
    if missing_config {
        tracing::warn!(path = %args.config.display(), "config file not found, using defaults");
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(n) = args.max_connections {
        config.server.max_connections = n;
    }
    if let Some(n) = args.max_workers {
        config.server.max_workers = n;
    }

    let server = server::bootstrap(Arc::new(config)).await?;
    let shutdown = install_shutdown_handler();
    server.run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    match args.command {
        Commands::Run(run_args) => run_server(run_args).await,
        Commands::DumpConfig { path } => {
            Config::dump_default(&path)?;
            println!("default configuration written to {}", path.display());
            Ok(())
        }
    }
}
