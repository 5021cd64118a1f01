//! Candidate gating: hold ICE candidates until the remote description is set.
//!
//! Every peer has two gates. The outbound one holds locally gathered
//! candidates until the peer's answer (or offer) has been applied, then
//! posts them to the peer. The inbound one holds candidates the peer trickled
//! to us until our engine has its remote description.

use std::collections::VecDeque;
use std::future::Future;

use fullmesh_common::Result;
use tokio::sync::Mutex;
use tracing::warn;

/// Outcome of submitting a candidate to a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    Delivered,
}

/// Counts from opening a gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flushed {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    pending: VecDeque<String>,
}

/// Ordered candidate queue that releases its contents once opened.
///
/// Delivery happens while the gate's lock is held, so a candidate submitted
/// during a flush cannot overtake the queued ones.
#[derive(Debug, Default)]
pub struct CandidateGate {
    state: Mutex<GateState>,
}

impl CandidateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `candidate` if the gate is closed, otherwise deliver it now.
    pub async fn submit<F, Fut>(&self, candidate: String, deliver: F) -> Result<Submitted>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut state = self.state.lock().await;
        if !state.open {
            state.pending.push_back(candidate);
            return Ok(Submitted::Queued);
        }
        deliver(candidate).await?;
        Ok(Submitted::Delivered)
    }

    /// Open the gate, delivering queued candidates in arrival order.
    ///
    /// A candidate whose delivery fails is logged and dropped; the rest are
    /// still delivered and the gate always ends up open.
    pub async fn open<F, Fut>(&self, mut deliver: F) -> Flushed
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut state = self.state.lock().await;
        let mut flushed = Flushed::default();
        while let Some(candidate) = state.pending.pop_front() {
            match deliver(candidate.clone()).await {
                Ok(()) => flushed.delivered += 1,
                Err(err) => {
                    warn!("dropping queued candidate {:?}: {}", candidate, err);
                    flushed.dropped += 1;
                }
            }
        }
        state.open = true;
        flushed
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
