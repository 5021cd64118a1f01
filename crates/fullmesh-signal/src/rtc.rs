//! webrtc-rs implementation of the engine seam.

use std::sync::Arc;

use async_trait::async_trait;
use fullmesh_common::{Error, Result, SdpType, SessionDescription};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::MeshConfig;
use crate::engine::{IceState, PeerConnector, PeerContext, PeerEvent, RtcSession};
use crate::heartbeat::{run_heartbeat, MeshContext, TextChannel};
use crate::media::{self, MediaSources, OutputWriters};
use crate::negotiation::Role;

const DATA_CHANNEL_LABEL: &str = "data";
const STREAM_ID: &str = "fullmesh";

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected => Some(IceState::Connected),
        RTCIceConnectionState::Completed => Some(IceState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        _ => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(Error::negotiation("rollback descriptions are not supported"))
        }
    };
    parsed.map_err(Error::negotiation)
}

struct DataChannelText(Arc<RTCDataChannel>);

#[async_trait]
impl TextChannel for DataChannelText {
    fn label(&self) -> String {
        self.0.label().to_string()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.0
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(Error::transport)
    }
}

/// Report open/message events and start the heartbeat once the channel opens.
fn wire_data_channel(
    dc: Arc<RTCDataChannel>,
    events: mpsc::Sender<PeerEvent>,
    mesh: Arc<MeshContext>,
    interval: std::time::Duration,
) {
    let label = dc.label().to_string();

    let open_dc = Arc::clone(&dc);
    let open_events = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_events
                .send(PeerEvent::ChannelOpened { label: open_label })
                .await;
            tokio::spawn(run_heartbeat(
                Arc::new(DataChannelText(open_dc)),
                mesh,
                interval,
            ));
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        let label = label.clone();
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        Box::pin(async move {
            let _ = events.send(PeerEvent::ChannelMessage { label, text }).await;
        })
    }));
}

/// Builds one webrtc-rs peer connection per remote peer.
pub struct WebRtcConnector {
    config: MeshConfig,
    sources: MediaSources,
}

impl WebRtcConnector {
    pub fn new(config: MeshConfig, sources: MediaSources) -> Self {
        Self { config, sources }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().map_err(Error::negotiation)?;
        let registry = register_default_interceptors(Registry::new(), &mut m)
            .map_err(Error::negotiation)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(Error::negotiation)?;
        Ok(Arc::new(pc))
    }

    async fn add_local_track(
        &self,
        pc: &Arc<RTCPeerConnection>,
        mime_type: &str,
        id: &str,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            id.to_string(),
            STREAM_ID.to_string(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(Error::negotiation)?;
        tokio::spawn(media::drain_rtcp(sender));
        Ok(track)
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        ctx: PeerContext,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn RtcSession>> {
        let pc = self.new_peer_connection().await?;
        let (ice_tx, ice_rx) = watch::channel(IceState::New);

        let writers = match &self.config.media.output_dir {
            Some(dir) => Some(OutputWriters::create(dir, ctx.index)?),
            None => None,
        };

        if let Some(path) = self.sources.video.clone() {
            let track = self.add_local_track(&pc, MIME_TYPE_VP8, "video").await?;
            let ice = ice_rx.clone();
            tokio::spawn(async move {
                media::log_forward_result("video", media::forward_video(track, path, ice).await);
            });
        }
        if let Some(path) = self.sources.audio.clone() {
            let track = self.add_local_track(&pc, MIME_TYPE_OPUS, "audio").await?;
            let ice = ice_rx.clone();
            tokio::spawn(async move {
                media::log_forward_result("audio", media::forward_audio(track, path, ice).await);
            });
        }

        // Receive whatever the peer sends even when we have nothing to send.
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(kind, None)
                .await
                .map_err(Error::negotiation)?;
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(init.candidate)).await;
                    }
                    Err(err) => warn!("failed to serialize local candidate: {}", err),
                }
            })
        }));

        let state_events = events.clone();
        let state_writers = writers.clone();
        let ice_tx = Arc::new(ice_tx);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            let writers = state_writers.clone();
            let ice_tx = Arc::clone(&ice_tx);
            Box::pin(async move {
                let Some(state) = map_ice_state(state) else {
                    return;
                };
                ice_tx.send_replace(state);
                if state.is_failure() {
                    if let Some(writers) = writers {
                        if let Err(err) = writers.close().await {
                            warn!("failed to finalize output files: {}", err);
                        }
                    }
                }
                let _ = events.send(PeerEvent::IceStateChanged(state)).await;
            })
        }));

        let track_events = events.clone();
        let track_writers = writers.clone();
        let weak_pc = Arc::downgrade(&pc);
        let pli_interval = self.config.media.pli_interval;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let writers = track_writers.clone();
            let weak_pc = weak_pc.clone();
            let ice = ice_rx.clone();
            Box::pin(async move {
                let mime_type = track.codec().capability.mime_type.to_lowercase();
                let _ = events
                    .send(PeerEvent::TrackStarted {
                        kind: track.kind().to_string(),
                        mime_type: mime_type.clone(),
                    })
                    .await;

                tokio::spawn(media::send_pli(weak_pc, track.ssrc(), pli_interval));

                let writer = writers.and_then(|w| {
                    if mime_type == MIME_TYPE_OPUS.to_lowercase() {
                        Some(w.audio)
                    } else if mime_type == MIME_TYPE_VP8.to_lowercase() {
                        Some(w.video)
                    } else {
                        None
                    }
                });

                match writer {
                    Some(writer) => {
                        info!("Got {} track, saving to disk", mime_type);
                        tokio::spawn(async move {
                            if let Err(err) = media::save_track(writer, track, ice).await {
                                warn!("saving track stopped: {}", err);
                            }
                        });
                    }
                    None => {
                        tokio::spawn(media::log_track(track));
                    }
                }
            })
        }));

        match ctx.role {
            Role::Offerer => {
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, None)
                    .await
                    .map_err(Error::negotiation)?;
                wire_data_channel(
                    dc,
                    events.clone(),
                    Arc::clone(&ctx.mesh),
                    self.config.heartbeat_interval,
                );
            }
            Role::Answerer => {
                let mesh = Arc::clone(&ctx.mesh);
                let interval = self.config.heartbeat_interval;
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let events = events.clone();
                    let mesh = Arc::clone(&mesh);
                    Box::pin(async move {
                        info!("New DataChannel {} {}", dc.label(), dc.id());
                        wire_data_channel(dc, events, mesh, interval);
                    })
                }));
            }
        }

        debug!("peer connection ready for {:?}", ctx);
        Ok(Arc::new(WebRtcSession { pc, writers }))
    }
}

/// A live webrtc-rs peer connection and the files its tracks are saved to.
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    writers: Option<OutputWriters>,
}

#[async_trait]
impl RtcSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(Error::negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(Error::negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(Error::negotiation)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(Error::negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(Error::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                ..Default::default()
            })
            .await
            .map_err(Error::negotiation)
    }

    async fn close(&self) -> Result<()> {
        let closed = self.pc.close().await.map_err(Error::negotiation);
        if let Some(writers) = &self.writers {
            writers.close().await?;
        }
        closed
    }
}
