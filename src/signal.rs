//! Signaling message types exchanged out-of-band between peers
//!
//! The session only produces and consumes `Signal` values; carrying them to
//! the remote peer (WebSocket, QR code, copy-paste) is the embedding
//! application's concern.

use serde::{Deserialize, Serialize};

/// A signaling message for the remote peer
///
/// Wire format is a tagged JSON object:
/// `{"type":"offer","sdp":...}`, `{"type":"answer","sdp":...}`,
/// `{"type":"candidate","candidate":{...}}`, `{"type":"renegotiate"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    /// Session description offer (only ever produced by the initiator)
    Offer {
        /// SDP payload
        sdp: String,
    },

    /// Session description answer (produced in response to a received offer)
    Answer {
        /// SDP payload
        sdp: String,
    },

    /// A locally gathered ICE candidate, one signal per candidate
    Candidate {
        /// Candidate descriptor
        candidate: IceCandidate,
    },

    /// Responder's request for the initiator to start a new negotiation round
    Renegotiate,
}

impl Signal {
    /// Check if this signal carries a session description
    pub fn is_description(&self) -> bool {
        matches!(self, Signal::Offer { .. } | Signal::Answer { .. })
    }
}

/// ICE candidate descriptor, field-compatible with the RTCIceCandidateInit
/// dictionary browsers exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IceCandidate {
    /// Candidate attribute line (without the leading "a=")
    pub candidate: String,

    /// Media description identifier the candidate belongs to
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description the candidate belongs to
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}
