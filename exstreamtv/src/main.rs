mod server;

use clap::Parser;
use tracing::info;

use exstreamtv_core::{logging, Config};

use server::Server;

/// Virtual TV channel server: IPTV + HDHomeRun over a scheduled media library.
#[derive(Debug, Parser)]
#[command(name = "exstreamtv", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "EXSTREAMTV_CONFIG")]
    config: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    // Fatal startup misconfiguration exits 1 before anything binds.
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return 1;
        }
    };
    if let Err(errors) = config.validate() {
        eprintln!("Invalid configuration:");
        for error in errors {
            eprintln!("  - {error}");
        }
        return 1;
    }
    if cli.check {
        println!("Configuration OK");
        return 0;
    }

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        return 1;
    }
    info!(address = %config.http_address(), "EXStreamTV starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return 1;
        }
    };

    match runtime.block_on(Server::new(config).run()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Fatal: {e:#}");
            1
        }
    }
}
