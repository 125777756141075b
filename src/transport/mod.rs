//! Peer-transport capability
//!
//! The session core never talks to a WebRTC stack directly: it drives an
//! injected implementation of the traits in this module and reacts to the
//! event streams the implementation feeds back. This keeps the negotiation
//! machinery runtime-agnostic and testable without any network.
//!
//! Two implementations ship with the crate: [`native`] (the `webrtc` crate,
//! default) and [`mock`] (in-memory pair for tests, behind the
//! `mock-transport` feature).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::media::MediaTrack;
use crate::signal::IceCandidate;

#[cfg(feature = "native")]
pub mod native;

#[cfg(any(test, feature = "mock-transport"))]
pub mod mock;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
}

/// An SDP session description
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    /// Description kind
    pub kind: DescriptionKind,

    /// SDP payload
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Transport-reported connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, connection not yet started
    New,
    /// Connection negotiation in progress
    Connecting,
    /// Connection established
    Connected,
    /// Connectivity temporarily lost; the transport may recover
    Disconnected,
    /// Connection failed permanently
    Failed,
    /// Connection closed
    Closed,
}

/// Transport-reported phase of the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// A local offer has been applied
    HaveLocalOffer,
    /// A remote offer has been applied
    HaveRemoteOffer,
    /// Signaling is shut down
    Closed,
}

/// Notifications a transport delivers to the session
#[derive(Clone)]
pub enum TransportEvent {
    /// Connection state changed
    ConnectionStateChange(ConnectionState),

    /// Signaling state changed; `Stable` completes a negotiation round
    SignalingStateChange(SignalingState),

    /// A local ICE candidate was gathered
    IceCandidate(IceCandidate),

    /// The remote peer opened a data channel towards us (responder only)
    DataChannel(Arc<dyn DataChannel>),

    /// A remote media track arrived, tagged with its remote stream id
    Track {
        /// Track handle
        track: MediaTrack,
        /// Remote stream the track belongs to
        stream_id: String,
    },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::ConnectionStateChange(s) => {
                f.debug_tuple("ConnectionStateChange").field(s).finish()
            }
            TransportEvent::SignalingStateChange(s) => {
                f.debug_tuple("SignalingStateChange").field(s).finish()
            }
            TransportEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            TransportEvent::DataChannel(ch) => {
                f.debug_tuple("DataChannel").field(&ch.label()).finish()
            }
            TransportEvent::Track { track, stream_id } => f
                .debug_struct("Track")
                .field("track", track)
                .field("stream_id", stream_id)
                .finish(),
        }
    }
}

/// Notifications a data channel delivers to the session
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel is open for sending
    Open,

    /// The channel closed
    Closed,

    /// A payload arrived from the remote peer
    Message(Bytes),

    /// The channel reported a failure
    Error(String),
}

/// Builds a transport for a session
///
/// The factory receives the sender half of the session's transport event
/// stream; the transport must deliver its notifications there until
/// [`PeerTransport::detach`] is called.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Construct a transport bound to `events`
    async fn create(
        &self,
        config: &SessionConfig,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}

/// The primitive operations the session requires from a peer transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an SDP answer for the previously applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Create an outgoing data channel
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Attach an outgoing media track under the given stream id
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<()>;

    /// Close the transport
    async fn close(&self) -> Result<()>;

    /// Last known connection state
    fn connection_state(&self) -> ConnectionState;

    /// Stop delivering events; late callbacks from the underlying stack
    /// must become no-ops after this
    fn detach(&self);
}

/// Delivery target for a channel's notifications
///
/// Starts out buffering so nothing observed between channel creation and
/// the session's `subscribe` call is lost.
pub(crate) enum ChannelSink {
    /// Events observed before the session subscribed, replayed on subscribe
    Buffered(Vec<ChannelEvent>),
    Attached(UnboundedSender<ChannelEvent>),
    Detached,
}

impl ChannelSink {
    pub(crate) fn new() -> Self {
        ChannelSink::Buffered(Vec::new())
    }

    pub(crate) fn deliver(&mut self, event: ChannelEvent) {
        match self {
            ChannelSink::Buffered(pending) => pending.push(event),
            ChannelSink::Attached(tx) => {
                let _ = tx.send(event);
            }
            ChannelSink::Detached => {}
        }
    }

    pub(crate) fn attach(&mut self, events: UnboundedSender<ChannelEvent>) {
        if let ChannelSink::Buffered(pending) = self {
            for event in pending.drain(..) {
                let _ = events.send(event);
            }
        }
        *self = ChannelSink::Attached(events);
    }
}

/// A bidirectional application-data channel multiplexed over the transport
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> String;

    /// Whether the channel is currently open for sending
    fn is_open(&self) -> bool;

    /// Send a payload to the remote peer
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;

    /// Route channel notifications to `events`; notifications that fired
    /// before subscription are replayed in order
    fn subscribe(&self, events: UnboundedSender<ChannelEvent>);

    /// Stop delivering channel notifications
    fn detach(&self);
}
