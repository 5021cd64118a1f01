//! Ordered, address-keyed registry of peer records.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fullmesh_common::{helpers::normalize_peer_addr, Error, Result};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::warn;

use crate::candidate::CandidateGate;
use crate::engine::RtcSession;
use crate::negotiation::{Negotiation, NegotiationState, Role};

/// Everything this node tracks about one remote peer.
pub struct PeerRecord {
    addr: String,
    index: usize,
    role: Role,
    negotiation: Mutex<Negotiation>,
    session: OnceCell<Arc<dyn RtcSession>>,
    outbound: CandidateGate,
    inbound: CandidateGate,
}

impl fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("addr", &self.addr)
            .field("index", &self.index)
            .field("role", &self.role)
            .field("session_attached", &self.session.initialized())
            .finish()
    }
}

impl PeerRecord {
    fn new(addr: String, index: usize, role: Role) -> Self {
        Self {
            addr,
            index,
            role,
            negotiation: Mutex::new(Negotiation::new(role)),
            session: OnceCell::new(),
            outbound: CandidateGate::new(),
            inbound: CandidateGate::new(),
        }
    }

    /// Listen address of the remote peer.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn negotiation(&self) -> &Mutex<Negotiation> {
        &self.negotiation
    }

    /// Gate for candidates gathered locally and destined for the peer.
    pub fn outbound(&self) -> &CandidateGate {
        &self.outbound
    }

    /// Gate for candidates the peer trickled to us.
    pub fn inbound(&self) -> &CandidateGate {
        &self.inbound
    }

    pub fn attach_session(&self, session: Arc<dyn RtcSession>) -> Result<()> {
        self.session
            .set(session)
            .map_err(|_| Error::internal(format!("session for {} already attached", self.addr)))
    }

    pub fn session(&self) -> Result<Arc<dyn RtcSession>> {
        self.session
            .get()
            .cloned()
            .ok_or_else(|| Error::negotiation(format!("peer {} has no session yet", self.addr)))
    }

    pub async fn summary(&self) -> PeerSummary {
        let negotiation = self.negotiation.lock().await;
        PeerSummary {
            address: self.addr.clone(),
            index: self.index,
            role: self.role,
            state: negotiation.state(),
            remote_description: negotiation.has_remote_description(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub address: String,
    pub index: usize,
    pub role: Role,
    pub state: NegotiationState,
    pub remote_description: bool,
}

/// Result of adding a peer.
#[derive(Debug)]
pub struct Registration {
    pub record: Arc<PeerRecord>,
    /// Addresses registered before this peer, in insertion order.
    pub known_before: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<Vec<Arc<PeerRecord>>>,
    // Indices are never reused, so output files of a removed peer are not
    // overwritten by the next one.
    issued: AtomicUsize,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record for `addr`.
    ///
    /// The snapshot of previously known peers and the append happen under
    /// one write lock, so concurrent handshakes each see a consistent prefix.
    pub async fn register(&self, addr: &str, role: Role) -> Result<Registration> {
        let addr = normalize_peer_addr(addr);
        if addr.is_empty() {
            return Err(Error::protocol("peer address must not be empty"));
        }

        let mut peers = self.peers.write().await;
        if peers.iter().any(|p| p.addr == addr) {
            return Err(Error::protocol(format!("peer {addr} is already registered")));
        }

        let known_before = peers.iter().map(|p| p.addr.clone()).collect();
        let index = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        let record = Arc::new(PeerRecord::new(addr, index, role));
        peers.push(record.clone());

        Ok(Registration {
            record,
            known_before,
        })
    }

    /// Drop `record` if it is still registered. Returns whether it was.
    pub async fn remove(&self, record: &Arc<PeerRecord>) -> bool {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|p| !Arc::ptr_eq(p, record));
        peers.len() != before
    }

    pub async fn get(&self, addr: &str) -> Option<Arc<PeerRecord>> {
        let addr = normalize_peer_addr(addr);
        self.peers
            .read()
            .await
            .iter()
            .find(|p| p.addr == addr)
            .cloned()
    }

    pub async fn latest(&self) -> Option<Arc<PeerRecord>> {
        self.peers.read().await.last().cloned()
    }

    /// Find the record a signaling request belongs to.
    ///
    /// Requests carrying the sender's address are routed by it. Requests
    /// without one fall back to the most recently added peer, which is only
    /// correct while peers join one at a time.
    pub async fn resolve(&self, sender: Option<&str>) -> Result<Arc<PeerRecord>> {
        match sender {
            Some(addr) => self
                .get(addr)
                .await
                .ok_or_else(|| Error::not_found(format!("unknown peer {addr}"))),
            None => {
                let record = self
                    .latest()
                    .await
                    .ok_or_else(|| Error::not_found("no peers registered"))?;
                warn!(
                    "signaling request without sender address, routing to latest peer {}",
                    record.addr
                );
                Ok(record)
            }
        }
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.peers
            .read()
            .await
            .iter()
            .map(|p| p.addr.clone())
            .collect()
    }

    pub async fn records(&self) -> Vec<Arc<PeerRecord>> {
        self.peers.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn summaries(&self) -> Vec<PeerSummary> {
        let mut out = Vec::new();
        for record in self.records().await {
            out.push(record.summary().await);
        }
        out
    }
}
