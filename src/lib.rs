//! Serialized WebRTC connection negotiation with role-based glare avoidance
//!
//! This crate is a negotiation controller on top of a pluggable peer
//! transport. The transport (ICE, DTLS, media) is an injected capability; the
//! crate's job is deciding *when* to (re)negotiate, *who* may author an
//! offer, coalescing concurrent negotiation triggers into single rounds, and
//! deriving the observable lifecycle (`connect` / `data` / `signal` /
//! `stream` / `close` / `error`) with idempotent teardown.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Session (role, transport handle, data channel)      │
//! │  ├─ Negotiation controller (batch / serialize)       │
//! │  ├─ Event bus (ordered subscribers, panic-isolated)  │
//! │  └─ Transport adapter (event-stream loops)           │
//! │     ↓                        ↑                        │
//! │  PeerTransport capability (webrtc crate by default)  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one side, the initiator, ever authors an `Offer`; the responder
//! asks for new rounds with a `Renegotiate` signal. That asymmetry removes
//! the classic signaling glare race without rollback machinery.
//!
//! # Example
//!
//! ```no_run
//! use peerlink::{EventKind, Session, SessionEvent, SessionOptions};
//!
//! # async fn example() -> peerlink::Result<()> {
//! let session = Session::new(SessionOptions {
//!     initiator: true,
//!     ..Default::default()
//! })
//! .await?;
//!
//! // ship every signal to the remote peer over your own channel
//! session.on(EventKind::Signal, |event| {
//!     if let SessionEvent::Signal(signal) = event {
//!         let wire = serde_json::to_string(signal).unwrap();
//!         println!("send to peer: {wire}");
//!     }
//! });
//!
//! session.on(EventKind::Connect, |_| println!("connected"));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod event;
pub mod media;
pub mod signal;
pub mod transport;

mod session;

// Re-exports for public API
pub use config::{SessionConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use event::{EventKind, SessionEvent, SubscriptionId};
pub use media::{MediaStream, MediaTrack, TrackKind};
pub use session::{Role, Session, SessionOptions};
pub use signal::{IceCandidate, Signal};
pub use transport::ConnectionState;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
