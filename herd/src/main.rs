mod cli;

use anyhow::Context;
use clap::Parser;
use herd::logging;
use herd::{signals, CommandLauncher, SupervisorBuilder};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_config());

    let config = cli.supervisor_config()?;

    #[cfg(feature = "metrics")]
    herd::metrics::init_metrics()?;

    let mut supervisor = SupervisorBuilder::<CommandLauncher>::new(config).build_command()?;
    let listener = signals::spawn_listener(supervisor.handle())
        .context("failed to install signal handlers")?;

    supervisor.start().await?;
    supervisor.run().await?;

    listener.abort();
    Ok(())
}
