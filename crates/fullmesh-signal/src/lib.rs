//! Full-mesh WebRTC signaling over plain HTTP.
//!
//! Every node runs the same small HTTP server (`/handshake`, `/candidate`,
//! `/sdp`). A joining node handshakes a seed, learns the peers the seed
//! already knows, and offers a connection to each of them in turn. Media and
//! a data-channel heartbeat flow over the resulting peer connections.

#![forbid(unsafe_code)]

pub mod candidate;
pub mod client;
pub mod config;
pub mod engine;
pub mod heartbeat;
pub mod media;
pub mod negotiation;
pub mod node;
pub mod registry;
pub mod rtc;
pub mod server;

pub use candidate::{CandidateGate, Flushed, Submitted};
pub use client::SignalClient;
pub use config::{MediaConfig, MeshConfig};
pub use engine::{IceState, PeerConnector, PeerContext, PeerEvent, RtcSession};
pub use heartbeat::MeshContext;
pub use media::MediaSources;
pub use negotiation::{NegotiationState, Role};
pub use node::MeshNode;
pub use registry::{PeerRegistry, PeerSummary};
pub use rtc::WebRtcConnector;
