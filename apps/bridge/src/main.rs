use clap::Parser;
use tracing_subscriber::EnvFilter;

use durango_bridge::config::BridgeConfig;
use durango_bridge::session;

#[derive(Parser)]
#[command(name = "durango-bridge")]
#[command(about = "Bridge a local Codex app-server to the Durango relay")]
#[command(version)]
struct Args {
    /// Relay base URL (overrides DURANGO_RELAY_URL).
    #[arg(long)]
    relay_url: Option<String>,
    /// Codex app-server WebSocket URL (overrides DURANGO_CODEX_APP_SERVER_URL).
    #[arg(long)]
    agent_url: Option<String>,
    /// Codex binary to spawn when no app-server is running (overrides DURANGO_CODEX_BIN).
    #[arg(long)]
    codex_bin: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = BridgeConfig::load()?;
    if let Some(relay_url) = args.relay_url {
        config.relay_url = relay_url;
    }
    if let Some(agent_url) = args.agent_url {
        config.app_server_url = agent_url;
    }
    if let Some(codex_bin) = args.codex_bin {
        config.codex_bin = Some(codex_bin);
    }

    tracing::info!(
        machine_id = %config.machine_id,
        relay = %config.relay_url,
        agent = %config.app_server_url,
        "starting durango bridge"
    );
    session::run(config).await
}
