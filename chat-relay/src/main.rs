use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client,
    listener::Listener,
};

/// Server logs go to stdout; the client keeps stdout for chat lines and logs to stderr.
fn init_tracing(command: &Command) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match command {
        Command::Server(_) => builder
            .with_ansi(std::io::stdout().is_terminal())
            .try_init(),
        Command::Client(_) => builder
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .try_init(),
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    match cli.command {
        Command::Server(args) => {
            let listener = Listener::bind(args.listen_addr(), args.listener_config()).await?;
            let addr = listener.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = listener.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
