//! Seam between the signaling logic and the WebRTC engine.
//!
//! The engine reports everything that used to be a callback as a
//! [`PeerEvent`] on the per-peer channel handed to [`PeerConnector::connect`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use fullmesh_common::{Result, SessionDescription};
use tokio::sync::mpsc;

use crate::heartbeat::MeshContext;
use crate::negotiation::Role;

/// What the engine needs to know about the peer it is wiring up.
#[derive(Clone)]
pub struct PeerContext {
    pub remote_addr: String,
    /// 1-based join order, used to name output files.
    pub index: usize,
    pub role: Role,
    pub mesh: Arc<MeshContext>,
}

impl fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerContext")
            .field("remote_addr", &self.remote_addr)
            .field("index", &self.index)
            .field("role", &self.role)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// States after which the media output for the peer is finalized.
    pub fn is_failure(self) -> bool {
        matches!(self, IceState::Failed | IceState::Disconnected)
    }
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceState::New => "new",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Completed => "completed",
            IceState::Disconnected => "disconnected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered.
    LocalCandidate(String),
    IceStateChanged(IceState),
    ChannelOpened { label: String },
    ChannelMessage { label: String, text: String },
    TrackStarted { kind: String, mime_type: String },
}

/// One peer connection owned by the engine.
#[async_trait]
pub trait RtcSession: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Create an answer without installing it.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a connection for `ctx`. Offerers get their data channel created
    /// here so it is part of the first offer.
    async fn connect(
        &self,
        ctx: PeerContext,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn RtcSession>>;
}
