//! Session coordinator server.
//!
//! Serves the push channel and client API over HTTP. Configuration is read
//! from `$VOXSYNC_CONFIG`, else the default config path, else built-in
//! defaults. The speech service API key comes from the environment variable
//! named by `speech.api_key_env`.

use std::path::PathBuf;
use std::sync::Arc;
use voxsync::config::VoxConfig;
use voxsync::coordinator::Coordinator;
use voxsync::server::VoxServer;
use voxsync::speech::{RealtimeSpeechService, SpeechService};

fn load_config() -> anyhow::Result<VoxConfig> {
    let path = std::env::var_os("VOXSYNC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(VoxConfig::default_config_path);
    if path.exists() {
        tracing::info!(path = %path.display(), "loading config");
        return VoxConfig::from_file(&path)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()));
    }
    tracing::info!(path = %path.display(), "no config file; using defaults");
    Ok(VoxConfig::default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxsync=info,info")),
        )
        .init();

    tracing::info!("voxsync-server v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let speech = RealtimeSpeechService::new(config.speech.clone())
        .map_err(|e| anyhow::anyhow!("speech service unavailable: {e}"))?;
    let coordinator = Coordinator::spawn(&config, Arc::new(speech) as Arc<dyn SpeechService>)
        .map_err(|e| anyhow::anyhow!("coordinator failed to start: {e}"))?;
    let server = VoxServer::start(coordinator, &config.server)
        .await
        .map_err(|e| anyhow::anyhow!("server failed to start: {e}"))?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown();
    server.join().await;
    Ok(())
}
