//! Runtime configuration for a mesh node.

use std::path::PathBuf;
use std::time::Duration;

use fullmesh_common::helpers::{env_bool, env_parse};
use fullmesh_common::{Error, Result};

pub const DEFAULT_OFFER_ADDRESS: &str = "127.0.0.1:50000";
pub const DEFAULT_ANSWER_ADDRESS: &str = "127.0.0.1:60000";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_VIDEO_INPUT: &str = "input.ivf";
pub const DEFAULT_AUDIO_INPUT: &str = "input.ogg";

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_JOIN_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_PLI_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Where local media comes from and where remote media goes.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub video_input: PathBuf,
    pub audio_input: PathBuf,
    /// Refuse to start when neither input file exists.
    pub require_input: bool,
    /// Directory for `output{N}.ogg` / `output{N}.ivf`. `None` only logs
    /// incoming packets.
    pub output_dir: Option<PathBuf>,
    pub pli_interval: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_input: PathBuf::from(DEFAULT_VIDEO_INPUT),
            audio_input: PathBuf::from(DEFAULT_AUDIO_INPUT),
            require_input: false,
            output_dir: None,
            pli_interval: Duration::from_secs(env_parse(
                "FULLMESH_PLI_INTERVAL_SECS",
                DEFAULT_PLI_INTERVAL.as_secs(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Address this node listens on and advertises to peers.
    pub listen_addr: String,
    pub ice_servers: Vec<String>,
    pub heartbeat_interval: Duration,
    /// Pause between joining successive peers returned by the seed.
    pub join_delay: Duration,
    /// Timeout for outbound signaling requests. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Stop the node when a peer's ICE connection fails or disconnects.
    pub exit_on_ice_failure: bool,
    pub event_capacity: usize,
    pub media: MediaConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_ANSWER_ADDRESS.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            join_delay: DEFAULT_JOIN_DELAY,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            exit_on_ice_failure: env_bool("FULLMESH_EXIT_ON_ICE_FAILURE", false),
            event_capacity: env_parse("FULLMESH_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY),
            media: MediaConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(Error::config("listen address must not be empty"));
        }
        if !self.listen_addr.contains(':') {
            return Err(Error::config(format!(
                "listen address {} must be host:port",
                self.listen_addr
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::config("heartbeat interval must be non-zero"));
        }
        if self.media.pli_interval.is_zero() {
            return Err(Error::config("PLI interval must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event channel capacity must be non-zero"));
        }
        for server in &self.ice_servers {
            if !(server.starts_with("stun:") || server.starts_with("turn:")) {
                return Err(Error::config(format!(
                    "ICE server {server} must start with stun: or turn:"
                )));
            }
        }
        Ok(())
    }
}
