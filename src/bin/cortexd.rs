use std::path::PathBuf;

use clap::Parser;

use cortex::{config, telemetry};

#[derive(Parser)]
#[command(name = "cortexd")]
#[command(about = "Cortex local storage daemon")]
#[command(version)]
struct Args {
    /// Config file path (default: /etc/cortex/config.toml, or CORTEX_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    let config = config::load_or_default(args.config.as_deref());
    let _telemetry_guard = telemetry::init(args.verbose, &config.logging);

    if let Err(e) = cortex::run_daemon(config) {
        tracing::error!("error: {e}");
        std::process::exit(1);
    }
}
