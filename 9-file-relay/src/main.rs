use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use file_relay::{
    cli::{Cli, Command},
    client,
    config::RelayConfig,
    server::RelayServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let server = RelayServer::bind(args.listen, RelayConfig::from(&args)).await?;
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Send(args) => {
            client::send_file(args).await?;
        }
        Command::Receive(args) => {
            let received = client::receive_files(args).await?;
            info!(files = received.len(), "receiver finished");
        }
    }

    Ok(())
}
