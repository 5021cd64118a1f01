//! Shared fixtures: an in-memory engine and helpers to run nodes on loopback.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use fullmesh_common::{Error, Result, SessionDescription, PEER_HEADER};
use fullmesh_signal::{
    server, MeshConfig, MeshNode, PeerConnector, PeerContext, PeerEvent, RtcSession,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Engine double. Gathers two candidates whenever a local description is
/// set and refuses remote candidates until it has a remote description, or
/// when they match `reject`.
pub struct FakeSession {
    local_addr: String,
    remote_addr: String,
    events: mpsc::Sender<PeerEvent>,
    pub local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub applied: Mutex<Vec<String>>,
    pub reject: Mutex<Option<String>>,
    pub closed: Mutex<bool>,
}

impl FakeSession {
    pub fn candidate_name(from: &str, to: &str, n: usize) -> String {
        host_candidate(n, &format!("{from}>{to}"))
    }

    async fn gather(&self) {
        for n in 1..=2 {
            let candidate = Self::candidate_name(&self.local_addr, &self.remote_addr, n);
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate)).await;
        }
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.lock().unwrap().is_some()
    }
}

#[async_trait]
impl RtcSession for FakeSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = SessionDescription::offer(format!("v=0 offer from {}", self.local_addr));
        *self.local.lock().unwrap() = Some(offer.clone());
        self.gather().await;
        Ok(offer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !self.has_remote() {
            return Err(Error::negotiation("create_answer without remote offer"));
        }
        Ok(SessionDescription::answer(format!(
            "v=0 answer from {}",
            self.local_addr
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *self.local.lock().unwrap() = Some(desc);
        self.gather().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<()> {
        if !self.has_remote() {
            return Err(Error::negotiation(format!(
                "candidate {candidate} applied before remote description"
            )));
        }
        if self.reject.lock().unwrap().as_deref() == Some(candidate.as_str()) {
            return Err(Error::negotiation(format!("engine rejected {candidate}")));
        }
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

/// A well-formed host candidate line, told apart by `n` and `tag`.
pub fn host_candidate(n: usize, tag: &str) -> String {
    format!(
        "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host generation 0 network-id {tag}",
        50000 + n
    )
}

pub struct FakeConnector {
    local_addr: String,
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new(local_addr: &str) -> Arc<Self> {
        Arc::new(Self {
            local_addr: local_addr.to_string(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn session(&self, remote: &str) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().get(remote).cloned()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        ctx: PeerContext,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn RtcSession>> {
        let session = Arc::new(FakeSession {
            local_addr: self.local_addr.clone(),
            remote_addr: ctx.remote_addr.clone(),
            events,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            reject: Mutex::new(None),
            closed: Mutex::new(false),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(ctx.remote_addr, session.clone());
        Ok(session)
    }
}

pub struct TestNode {
    pub addr: String,
    pub node: Arc<MeshNode>,
    pub connector: Arc<FakeConnector>,
}

impl TestNode {
    pub fn session(&self, remote: &TestNode) -> Arc<FakeSession> {
        self.connector
            .session(&remote.addr)
            .unwrap_or_else(|| panic!("{} has no session for {}", self.addr, remote.addr))
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.node.shutdown();
    }
}

pub fn test_config(listen_addr: &str) -> MeshConfig {
    MeshConfig {
        listen_addr: listen_addr.to_string(),
        join_delay: Duration::from_millis(10),
        request_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    }
}

/// Start a node with the fake engine on an ephemeral loopback port.
pub async fn spawn_node() -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let connector = FakeConnector::new(&addr);
    let node = MeshNode::new(
        test_config(&addr),
        Arc::clone(&connector) as Arc<dyn PeerConnector>,
    )
    .unwrap();

    tokio::spawn(server::serve(listener, Arc::clone(&node)));

    TestNode {
        addr,
        node,
        connector,
    }
}

/// A request captured by [`spawn_sink`].
#[derive(Debug, Clone)]
pub struct Captured {
    pub path: &'static str,
    pub sender: Option<String>,
    pub body: String,
}

/// A stand-in peer that accepts `/sdp` and `/candidate` and records them.
pub async fn spawn_sink() -> (String, Arc<Mutex<Vec<Captured>>>) {
    spawn_failing_sink(0).await
}

/// Like [`spawn_sink`], but answers the first `failures` `/candidate`
/// requests with 500 and does not record them.
pub async fn spawn_failing_sink(failures: usize) -> (String, Arc<Mutex<Vec<Captured>>>) {
    let captured: Arc<Mutex<Vec<Captured>>> = Arc::new(Mutex::new(Vec::new()));
    let remaining = Arc::new(AtomicUsize::new(failures));

    fn record(
        captured: Arc<Mutex<Vec<Captured>>>,
        remaining: Option<Arc<AtomicUsize>>,
        path: &'static str,
    ) -> impl Fn(HeaderMap, Bytes) -> std::future::Ready<StatusCode> + Clone {
        move |headers: HeaderMap, body: Bytes| {
            let fail = remaining.as_ref().is_some_and(|left| {
                left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            });
            if fail {
                return std::future::ready(StatusCode::INTERNAL_SERVER_ERROR);
            }
            captured.lock().unwrap().push(Captured {
                path,
                sender: headers
                    .get(PEER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
            std::future::ready(StatusCode::OK)
        }
    }

    let app = Router::new()
        .route("/sdp", post(record(captured.clone(), None, "/sdp")))
        .route(
            "/candidate",
            post(record(captured.clone(), Some(remaining), "/candidate")),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, captured)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
