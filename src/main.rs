use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use vision_broker::cli::{Cli, Command};
use vision_broker::logger::setup_logging;
use vision_broker::{serve, BrokerClient};
use vision_broker_config::load_config;

fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = load_config(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("validating configuration")?;

    if let Err(e) = setup_logging(&config.log, cli.verbose) {
        eprintln!("Failed to set up logging: {e}");
    }

    match &cli.command {
        Command::Serve { .. } => {
            info!(
                "Starting broker (max_new_tokens {}, max_context_len {})",
                config.engine.max_new_tokens, config.engine.max_context_len
            );
            // The loop only ends on a termination signal.
            let code = serve(&config).context("broker startup failed")?;
            Ok(code)
        }
        Command::Describe {
            image,
            ready_timeout,
            timeout,
        } => {
            let client = BrokerClient::new(config.ipc.clone(), config.poll_interval());
            client
                .wait_until_ready(Duration::from_secs(*ready_timeout))
                .context("waiting for broker")?;
            let text = client
                .describe(image, Duration::from_secs(*timeout))
                .with_context(|| format!("describing {}", image.display()))?;
            println!("{text}");
            Ok(0)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}
