use std::env;
use std::error::Error;

use claimflow_core::SinkConfig;
use tracing::{error, info};

mod cmdline;
mod generator;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    match matches.subcommand() {
        Some(("generate", args)) => {
            let args = cmdline::generator_args(args);
            let config = SinkConfig::load(env::vars())?;
            info!(?args, ?config, "Starting generator");
            generator::run(args, config)
                .await
                .map_err(|e| format!("Error running generator: {e:?}"))?;
        }
        Some((name, _)) => return Err(format!("unknown subcommand {name}").into()),
        None => return Err("missing subcommand".into()),
    }
    Ok(())
}
