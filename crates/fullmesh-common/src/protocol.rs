use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Path of the peer-discovery endpoint.
pub const HANDSHAKE_PATH: &str = "/handshake";
/// Path of the trickled ICE candidate endpoint.
pub const CANDIDATE_PATH: &str = "/candidate";
/// Path of the offer/answer endpoint.
pub const SDP_PATH: &str = "/sdp";
/// Header carrying the sender's listen address on `/candidate` and `/sdp`.
pub const PEER_HEADER: &str = "x-fullmesh-peer";

/// Largest SDP body accepted on `/sdp`.
pub const MAX_SDP_BYTES: usize = 32 * 1024;
/// Largest candidate line accepted on `/candidate`.
pub const MAX_CANDIDATE_BYTES: usize = 4096;

/// Response body of `POST /handshake`: peers known before the caller.
pub type HandshakeResponse = Vec<String>;

/// Kind of a session description, serialized the way browsers do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Offer/answer payload exchanged on `/sdp`. The SDP text is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Check that `line` looks like an ICE candidate attribute:
/// `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> ...`
pub fn validate_candidate(line: &str) -> Result<()> {
    let Some(rest) = line.trim().strip_prefix("candidate:") else {
        return Err(Error::protocol("candidate must start with `candidate:`"));
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(Error::protocol(format!(
            "candidate has {} fields, expected at least 8",
            fields.len()
        )));
    }
    if fields[1].parse::<u16>().is_err() {
        return Err(Error::protocol(format!("bad component `{}`", fields[1])));
    }
    if fields[3].parse::<u32>().is_err() {
        return Err(Error::protocol(format!("bad priority `{}`", fields[3])));
    }
    if fields[5].parse::<u16>().is_err() {
        return Err(Error::protocol(format!("bad port `{}`", fields[5])));
    }
    if fields[6] != "typ" {
        return Err(Error::protocol("candidate is missing `typ`"));
    }
    Ok(())
}

/// Body of the JSON error responses returned by the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
