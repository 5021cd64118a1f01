#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fullmesh_signal::config::{
    DEFAULT_ANSWER_ADDRESS, DEFAULT_AUDIO_INPUT, DEFAULT_OFFER_ADDRESS, DEFAULT_STUN_SERVER,
    DEFAULT_VIDEO_INPUT,
};
use fullmesh_signal::{
    server, MediaConfig, MediaSources, MeshConfig, MeshNode, WebRtcConnector,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fullmesh-offer")]
#[command(about = "Join a full mesh of WebRTC peers and stream local media to each of them")]
struct Args {
    /// Address this node's signaling server listens on
    #[arg(long, env = "FULLMESH_OFFER_ADDRESS", default_value = DEFAULT_OFFER_ADDRESS)]
    offer_address: String,

    /// Address of the answer node used to join the mesh
    #[arg(long, env = "FULLMESH_ANSWER_ADDRESS", default_value = DEFAULT_ANSWER_ADDRESS)]
    answer_address: String,

    /// STUN/TURN URLs, comma separated
    #[arg(
        long,
        env = "FULLMESH_STUN_SERVER",
        default_value = DEFAULT_STUN_SERVER,
        value_delimiter = ','
    )]
    stun_server: Vec<String>,

    #[arg(long, env = "FULLMESH_HEARTBEAT_INTERVAL_SECS", default_value_t = 5)]
    heartbeat_interval_secs: u64,

    /// Pause before joining each peer the answer node already knew
    #[arg(long, env = "FULLMESH_JOIN_DELAY_SECS", default_value_t = 3)]
    join_delay_secs: u64,

    #[arg(long, env = "FULLMESH_VIDEO_INPUT", default_value = DEFAULT_VIDEO_INPUT)]
    video_input: PathBuf,

    #[arg(long, env = "FULLMESH_AUDIO_INPUT", default_value = DEFAULT_AUDIO_INPUT)]
    audio_input: PathBuf,

    /// Where received tracks are saved as output{N}.ogg / output{N}.ivf
    #[arg(long, env = "FULLMESH_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Timeout for signaling requests in seconds (0 disables)
    #[arg(long, env = "FULLMESH_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    request_timeout_secs: u64,

    /// Keep running when a peer's ICE connection fails
    #[arg(long, env = "FULLMESH_KEEP_ON_ICE_FAILURE")]
    keep_on_ice_failure: bool,

    #[arg(long, env = "FULLMESH_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            listen_addr: self.offer_address.clone(),
            ice_servers: self.stun_server.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            join_delay: Duration::from_secs(self.join_delay_secs),
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
            exit_on_ice_failure: !self.keep_on_ice_failure,
            media: MediaConfig {
                video_input: self.video_input.clone(),
                audio_input: self.audio_input.clone(),
                require_input: true,
                output_dir: Some(self.output_dir.clone()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fullmesh_common::init_tracing_with_default(&args.log_level);

    let config = args.mesh_config();
    config.validate()?;
    let sources = MediaSources::discover(&config.media)?;
    info!(
        "streaming video={:?} audio={:?}",
        sources.video, sources.audio
    );

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let connector = Arc::new(WebRtcConnector::new(config.clone(), sources));
    let node = MeshNode::new(config, connector)?;

    let server = tokio::spawn(server::serve(listener, Arc::clone(&node)));

    if let Err(err) = node.join(&args.answer_address).await {
        node.shutdown();
        node.close_all().await;
        return Err(err).with_context(|| format!("failed to join mesh via {}", args.answer_address));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
        _ = node.closed() => warn!("node stopped"),
    }

    node.shutdown();
    node.close_all().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("signaling server error: {}", err),
        Err(err) => error!("signaling server task failed: {}", err),
    }
    Ok(())
}
