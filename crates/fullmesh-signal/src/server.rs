//! HTTP surface of a mesh node.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use fullmesh_common::helpers::normalize_peer_addr;
use fullmesh_common::{
    Error, ErrorResponse, Result, SessionDescription, CANDIDATE_PATH, HANDSHAKE_PATH,
    MAX_CANDIDATE_BYTES, MAX_SDP_BYTES, PEER_HEADER, SDP_PATH,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::node::MeshNode;
use crate::registry::PeerSummary;

/// Error wrapper that renders as a JSON `{"error": ...}` response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Protocol(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Negotiation(_) => StatusCode::CONFLICT,
        Error::Transport(_) => StatusCode::BAD_GATEWAY,
        Error::Io(_) | Error::Encoding(_) | Error::Config(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!("signaling request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    peers: usize,
}

fn sender(headers: &HeaderMap) -> Option<String> {
    headers
        .get(PEER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(normalize_peer_addr)
        .filter(|addr| !addr.is_empty())
}

/// Decode a JSON body regardless of its content type, so malformed bodies
/// get the same JSON error shape as every other rejection.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

async fn handshake(
    State(node): State<Arc<MeshNode>>,
    body: Bytes,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let caller: String = decode(&body)?;
    info!("handshake from {}", caller);
    let known = node.accept_handshake(&caller).await?;
    Ok((StatusCode::CREATED, Json(known)))
}

async fn candidate(
    State(node): State<Arc<MeshNode>>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    if body.is_empty() || body.len() > MAX_CANDIDATE_BYTES {
        return Err(Error::protocol("invalid ICE candidate size").into());
    }
    let candidate = String::from_utf8(body.to_vec())
        .map_err(|_| Error::protocol("ICE candidate is not valid UTF-8"))?;

    node.handle_remote_candidate(sender(&headers).as_deref(), candidate)
        .await?;
    Ok(StatusCode::OK)
}

async fn sdp(
    State(node): State<Arc<MeshNode>>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let desc: SessionDescription = decode(&body)?;
    if desc.sdp.is_empty() || desc.sdp.len() > MAX_SDP_BYTES {
        return Err(Error::protocol("invalid SDP size").into());
    }

    node.handle_sdp(sender(&headers).as_deref(), desc).await?;
    Ok(StatusCode::OK)
}

async fn health(State(node): State<Arc<MeshNode>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        peers: node.registry().len().await,
    })
}

async fn peers(State(node): State<Arc<MeshNode>>) -> Json<Vec<PeerSummary>> {
    Json(node.peers().await)
}

pub fn router(node: Arc<MeshNode>) -> Router {
    Router::new()
        .route(HANDSHAKE_PATH, post(handshake))
        .route(CANDIDATE_PATH, post(candidate))
        .route(SDP_PATH, post(sdp))
        .route("/health", get(health))
        .route("/peers", get(peers))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

/// Serve the signaling endpoints on `listener` until the node shuts down.
pub async fn serve(listener: TcpListener, node: Arc<MeshNode>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("signaling server listening on http://{}", addr);

    let app = router(Arc::clone(&node));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { node.closed().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&Error::protocol("x")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&Error::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::negotiation("x")), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::transport("x")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&Error::internal("x")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_decode_maps_to_bad_request() {
        let err = decode::<SessionDescription>(br#"{"type":"greeting","sdp":"v=0"}"#).unwrap_err();
        assert_eq!(status_for(&err), StatusCode::BAD_REQUEST);
        let caller: String = decode(br#""127.0.0.1:1""#).unwrap();
        assert_eq!(caller, "127.0.0.1:1");
    }

    #[test]
    fn test_sender_header_normalized() {
        let mut headers = HeaderMap::new();
        assert_eq!(sender(&headers), None);

        headers.insert(PEER_HEADER, "http://127.0.0.1:50000/".parse().unwrap());
        assert_eq!(sender(&headers).as_deref(), Some("127.0.0.1:50000"));
    }
}
