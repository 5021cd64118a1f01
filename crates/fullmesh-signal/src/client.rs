//! Outbound half of the signaling exchange.

use std::time::Duration;

use fullmesh_common::{
    Error, HandshakeResponse, Result, SessionDescription, CANDIDATE_PATH, HANDSHAKE_PATH,
    PEER_HEADER, SDP_PATH,
};
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

/// HTTP client that speaks to other nodes' signaling servers on behalf of
/// the node listening at `local_addr`.
#[derive(Debug, Clone)]
pub struct SignalClient {
    http: reqwest::Client,
    local_addr: String,
}

fn endpoint(addr: &str, path: &str) -> String {
    format!("http://{addr}{path}")
}

impl SignalClient {
    pub fn new(local_addr: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(Error::transport)?;
        Ok(Self {
            http,
            local_addr: local_addr.into(),
        })
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Announce ourselves to `target` and learn which peers it already knew.
    pub async fn handshake(&self, target: &str) -> Result<HandshakeResponse> {
        let resp = self
            .http
            .post(endpoint(target, HANDSHAKE_PATH))
            .json(&self.local_addr)
            .send()
            .await
            .map_err(Error::transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::transport(format!(
                "handshake with {target} failed with status {status}"
            )));
        }

        let body = resp.bytes().await.map_err(Error::transport)?;
        parse_handshake_body(&body)
    }

    /// Trickle one local candidate to `target`. The body is the raw
    /// candidate line, not JSON.
    pub async fn post_candidate(&self, target: &str, candidate: &str) -> Result<()> {
        debug!("sending candidate to {}", target);
        let resp = self
            .http
            .post(endpoint(target, CANDIDATE_PATH))
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header(PEER_HEADER, &self.local_addr)
            .body(candidate.to_string())
            .send()
            .await
            .map_err(Error::transport)?;
        ensure_success(target, CANDIDATE_PATH, resp.status())
    }

    pub async fn post_sdp(&self, target: &str, desc: &SessionDescription) -> Result<()> {
        debug!("sending {} to {}", desc.kind, target);
        let resp = self
            .http
            .post(endpoint(target, SDP_PATH))
            .header(PEER_HEADER, &self.local_addr)
            .json(desc)
            .send()
            .await
            .map_err(Error::transport)?;
        ensure_success(target, SDP_PATH, resp.status())
    }
}

fn ensure_success(target: &str, path: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::transport(format!(
            "POST {path} to {target} failed with status {status}"
        )))
    }
}

/// An empty body or `null` means the remote knew no peers.
fn parse_handshake_body(body: &[u8]) -> Result<HandshakeResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let peers: Option<HandshakeResponse> = serde_json::from_slice(body)?;
    Ok(peers.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake_body_variants() {
        assert!(parse_handshake_body(b"").unwrap().is_empty());
        assert!(parse_handshake_body(b"\n").unwrap().is_empty());
        assert!(parse_handshake_body(b"null").unwrap().is_empty());
        assert_eq!(
            parse_handshake_body(br#"["a:1","b:2"]"#).unwrap(),
            vec!["a:1", "b:2"]
        );
        assert!(parse_handshake_body(b"{oops").is_err());
    }

    #[test]
    fn test_endpoint_format() {
        assert_eq!(
            endpoint("127.0.0.1:60000", HANDSHAKE_PATH),
            "http://127.0.0.1:60000/handshake"
        );
    }

    #[tokio::test]
    async fn test_handshake_unreachable_is_transport_error() {
        // Port 9 (discard) on loopback is closed in test environments.
        let client = SignalClient::new("127.0.0.1:1", Some(Duration::from_secs(2))).unwrap();
        let err = client.handshake("127.0.0.1:9").await.unwrap_err();
        assert!(err.is_transient());
    }
}
