use clap::Parser;
use tickbot::cli::{self, Cli, Commands, SessionOverrides};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            account,
            symbol,
            stake,
            duration,
            target,
            window,
            streak,
            config_dir,
        } => {
            let config = cli::load_config(&config_dir)?;
            init_logging(&config.logging);

            let overrides = SessionOverrides {
                symbol,
                stake,
                duration,
                target,
            };
            cli::run_session(config, account, overrides, window, streak).await?;
        }
        Commands::CheckConfig { config_dir } => {
            init_logging_simple();
            cli::check_config(&config_dir)?;
        }
    }

    Ok(())
}
