//! A mesh node: joins the mesh, answers handshakes and drives per-peer
//! negotiation.

use std::sync::Arc;

use fullmesh_common::helpers::normalize_peer_addr;
use fullmesh_common::{validate_candidate, Error, Result, SdpType, SessionDescription};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::candidate::Submitted;
use crate::client::SignalClient;
use crate::config::MeshConfig;
use crate::engine::{PeerConnector, PeerContext, PeerEvent, RtcSession};
use crate::heartbeat::MeshContext;
use crate::negotiation::{NegotiationEvent, Role};
use crate::registry::{PeerRecord, PeerRegistry, PeerSummary, Registration};

pub struct MeshNode {
    config: MeshConfig,
    local_addr: String,
    registry: PeerRegistry,
    mesh: Arc<MeshContext>,
    client: SignalClient,
    connector: Arc<dyn PeerConnector>,
    shutdown: watch::Sender<bool>,
}

impl MeshNode {
    pub fn new(config: MeshConfig, connector: Arc<dyn PeerConnector>) -> Result<Arc<Self>> {
        config.validate()?;
        let local_addr = normalize_peer_addr(&config.listen_addr);
        let client = SignalClient::new(local_addr.clone(), config.request_timeout)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            local_addr,
            registry: PeerRegistry::new(),
            mesh: Arc::new(MeshContext::new()),
            client,
            connector,
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn context(&self) -> &Arc<MeshContext> {
        &self.mesh
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        self.registry.summaries().await
    }

    /// Register `addr`, build its engine connection and start pumping its
    /// events. If the connection cannot be built the record is removed again.
    async fn add_peer(self: &Arc<Self>, addr: &str, role: Role) -> Result<Registration> {
        if normalize_peer_addr(addr) == self.local_addr {
            return Err(Error::protocol(format!("refusing to peer with self ({addr})")));
        }

        let registration = self.registry.register(addr, role).await?;
        let record = Arc::clone(&registration.record);

        let events_rx = match self.connect_record(&record, role).await {
            Ok(events_rx) => events_rx,
            Err(err) => {
                self.registry.remove(&record).await;
                warn!("could not set up connection to {}: {}", record.addr(), err);
                return Err(err);
            }
        };
        let connections = self.mesh.peer_added();

        tokio::spawn(Arc::clone(self).pump_events(Arc::clone(&record), events_rx));

        info!(
            "added peer {} as {:?} (#{}, {} connections)",
            record.addr(),
            role,
            record.index(),
            connections
        );
        Ok(registration)
    }

    async fn connect_record(
        &self,
        record: &PeerRecord,
        role: Role,
    ) -> Result<mpsc::Receiver<PeerEvent>> {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity);
        let ctx = PeerContext {
            remote_addr: record.addr().to_string(),
            index: record.index(),
            role,
            mesh: Arc::clone(&self.mesh),
        };
        let session = self.connector.connect(ctx, events_tx).await?;
        record.attach_session(session)?;
        Ok(events_rx)
    }

    /// Handle `POST /handshake` from `caller`: register it as a peer we will
    /// answer and return everyone registered before it.
    pub async fn accept_handshake(self: &Arc<Self>, caller: &str) -> Result<Vec<String>> {
        let registration = self.add_peer(caller, Role::Answerer).await?;
        Ok(registration.known_before)
    }

    /// Open a connection to `remote` and deliver our offer to it.
    ///
    /// The negotiation lock is not held while the offer is in flight: the
    /// peer posts its answer back before acknowledging the offer.
    pub async fn offer_to(self: &Arc<Self>, remote: &str) -> Result<()> {
        let registration = self.add_peer(remote, Role::Offerer).await?;
        let record = registration.record;
        let session = record.session()?;

        let offer = {
            let mut negotiation = record.negotiation().lock().await;
            let mut next = negotiation.clone();
            next.apply(NegotiationEvent::LocalOfferSet)?;
            let offer = session.create_offer().await?;
            *negotiation = next;
            offer
        };

        self.client.post_sdp(record.addr(), &offer).await?;

        let state = record
            .negotiation()
            .lock()
            .await
            .apply(NegotiationEvent::OfferDelivered)?;
        debug!("offer to {} delivered, now {:?}", record.addr(), state);
        Ok(())
    }

    /// Join the mesh through `bootstrap`: handshake it, offer to it, then
    /// handshake and offer to every peer it already knew, pausing
    /// `join_delay` before each.
    pub async fn join(self: &Arc<Self>, bootstrap: &str) -> Result<()> {
        let bootstrap = normalize_peer_addr(bootstrap);
        let known = self.client.handshake(&bootstrap).await?;
        info!("{} knows {} other peer(s): {:?}", bootstrap, known.len(), known);

        self.offer_to(&bootstrap).await?;

        for (i, addr) in known.iter().enumerate() {
            let addr = normalize_peer_addr(addr);
            if addr == self.local_addr || addr == bootstrap {
                continue;
            }

            tokio::time::sleep(self.config.join_delay).await;
            info!("joining listed peer {}: {}", i, addr);

            let theirs = self.client.handshake(&addr).await?;
            debug!("{} answered handshake with {:?}", addr, theirs);
            self.offer_to(&addr).await?;
        }

        info!(
            "joined mesh via {} with {} peer(s)",
            bootstrap,
            self.registry.len().await
        );
        Ok(())
    }

    /// Handle `POST /sdp`.
    pub async fn handle_sdp(
        self: &Arc<Self>,
        sender: Option<&str>,
        desc: SessionDescription,
    ) -> Result<()> {
        let record = self.registry.resolve(sender).await?;
        match (record.role(), desc.kind) {
            (Role::Answerer, SdpType::Offer) => self.answer_offer(record, desc).await,
            (Role::Offerer, SdpType::Answer) => self.accept_answer(record, desc).await,
            (role, kind) => Err(Error::negotiation(format!(
                "unexpected {kind} from {} (we are the {role:?})",
                record.addr()
            ))),
        }
    }

    async fn answer_offer(
        self: &Arc<Self>,
        record: Arc<PeerRecord>,
        offer: SessionDescription,
    ) -> Result<()> {
        let session = record.session()?;
        let mut negotiation = record.negotiation().lock().await;

        let mut next = negotiation.clone();
        next.apply(NegotiationEvent::RemoteOfferSet)?;
        session.set_remote_description(offer).await?;
        *negotiation = next;

        self.open_inbound(&record, &session).await;
        self.open_outbound(&record);

        let answer = session.create_answer().await?;
        self.client.post_sdp(record.addr(), &answer).await?;
        negotiation.apply(NegotiationEvent::AnswerDelivered)?;

        session.set_local_description(answer).await?;
        negotiation.apply(NegotiationEvent::LocalAnswerSet)?;

        info!("answered offer from {}", record.addr());
        Ok(())
    }

    async fn accept_answer(
        self: &Arc<Self>,
        record: Arc<PeerRecord>,
        answer: SessionDescription,
    ) -> Result<()> {
        let session = record.session()?;
        {
            let mut negotiation = record.negotiation().lock().await;
            let mut next = negotiation.clone();
            next.apply(NegotiationEvent::RemoteAnswerSet)?;
            session.set_remote_description(answer).await?;
            *negotiation = next;
        }

        self.open_inbound(&record, &session).await;
        self.open_outbound(&record);

        info!("applied answer from {}", record.addr());
        Ok(())
    }

    /// Apply candidates the peer sent before our remote description was set.
    /// Ones the engine rejects are dropped.
    async fn open_inbound(&self, record: &PeerRecord, session: &Arc<dyn RtcSession>) {
        let flushed = record
            .inbound()
            .open(|candidate| {
                let session = Arc::clone(session);
                async move { session.add_ice_candidate(candidate).await }
            })
            .await;
        if flushed.delivered > 0 || flushed.dropped > 0 {
            debug!(
                "applied {} queued candidate(s) from {}, dropped {}",
                flushed.delivered,
                record.addr(),
                flushed.dropped
            );
        }
    }

    /// Post our queued candidates to the peer in the background.
    fn open_outbound(self: &Arc<Self>, record: &Arc<PeerRecord>) {
        let node = Arc::clone(self);
        let record = Arc::clone(record);
        tokio::spawn(async move {
            let addr = record.addr().to_string();
            let flushed = record
                .outbound()
                .open(|candidate| {
                    let client = &node.client;
                    let addr = addr.clone();
                    async move { client.post_candidate(&addr, &candidate).await }
                })
                .await;
            if flushed.dropped > 0 {
                warn!(
                    "sent {} queued candidate(s) to {}, {} failed",
                    flushed.delivered, addr, flushed.dropped
                );
            } else if flushed.delivered > 0 {
                debug!("sent {} queued candidate(s) to {}", flushed.delivered, addr);
            }
        });
    }

    /// Handle `POST /candidate`. Candidates that arrive before our remote
    /// description is set are queued and applied once it is.
    pub async fn handle_remote_candidate(
        &self,
        sender: Option<&str>,
        candidate: String,
    ) -> Result<Submitted> {
        validate_candidate(&candidate)?;

        let record = self.registry.resolve(sender).await?;
        let session = record.session()?;
        let outcome = record
            .inbound()
            .submit(candidate, |candidate| async move {
                session.add_ice_candidate(candidate).await
            })
            .await?;

        if outcome == Submitted::Queued {
            debug!("queued candidate from {} until its description arrives", record.addr());
        }
        Ok(outcome)
    }

    async fn pump_events(
        self: Arc<Self>,
        record: Arc<PeerRecord>,
        mut events: mpsc::Receiver<PeerEvent>,
    ) {
        let addr = record.addr().to_string();
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    let client = &self.client;
                    let target = addr.clone();
                    let result = record
                        .outbound()
                        .submit(candidate, |candidate| async move {
                            client.post_candidate(&target, &candidate).await
                        })
                        .await;
                    match result {
                        Ok(Submitted::Queued) => {
                            debug!("holding local candidate for {}", addr)
                        }
                        Ok(Submitted::Delivered) => {}
                        Err(err) => warn!("failed to send candidate to {}: {}", addr, err),
                    }
                }
                PeerEvent::IceStateChanged(state) => {
                    info!("ICE connection state with {} has changed: {}", addr, state);
                    if state.is_failure() && self.config.exit_on_ice_failure {
                        warn!("ICE connection with {} {}, shutting down", addr, state);
                        self.shutdown();
                    }
                }
                PeerEvent::ChannelOpened { label } => {
                    info!("Data channel '{}' with {} open", label, addr);
                }
                PeerEvent::ChannelMessage { label, text } => {
                    info!("Message from DataChannel '{}': '{}'", label, text);
                }
                PeerEvent::TrackStarted { kind, mime_type } => {
                    info!("Got {} track ({}) from {}", kind, mime_type, addr);
                }
            }
        }
        debug!("event stream for {} closed", addr);
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`MeshNode::shutdown`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Close every peer connection.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self
            .registry
            .records()
            .await
            .into_iter()
            .filter_map(|record| record.session().ok().map(|s| (record, s)))
            .collect();

        let results = join_all(sessions.iter().map(|(_, s)| s.close())).await;
        for ((record, _), result) in sessions.iter().zip(results) {
            if let Err(err) = result {
                warn!("failed to close connection to {}: {}", record.addr(), err);
            }
        }
    }
}
