//! Peer session: role, transport ownership, lifecycle, and the public API
//!
//! A session owns exactly one transport and at most one data channel. All
//! externally visible behavior is derived here: negotiation triggers feed the
//! controller in [`negotiation`], transport notifications arrive through the
//! loops in [`adapter`], and consumers observe everything via the event bus.

mod adapter;
mod negotiation;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind, SessionEvent, SubscriptionId};
use crate::media::MediaStream;
use crate::signal::Signal;
use crate::transport::{
    ConnectionState, DataChannel, PeerTransport, SessionDescription, SignalingState,
    TransportFactory,
};

use negotiation::{BatchOutcome, Negotiator, TriggerOutcome};

/// Which half of the offer/answer asymmetry this session plays
///
/// Fixed at construction. Only the initiator ever produces an `Offer`; the
/// responder asks for new rounds via `Renegotiate`. This asymmetry is what
/// rules out glare: the two sides can never offer simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the data channel and authors every offer
    Initiator,
    /// Receives the data channel and answers received offers
    Responder,
}

/// Options for [`Session::new`]
pub struct SessionOptions {
    /// Play the initiator role
    pub initiator: bool,

    /// Transport configuration
    pub config: SessionConfig,

    /// Transport capability; `None` selects the built-in `webrtc`-backed
    /// factory when the `native` feature is enabled
    pub transport: Option<Arc<dyn TransportFactory>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            initiator: false,
            config: SessionConfig::default(),
            transport: None,
        }
    }
}

/// A single peer connection session
///
/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Whether a built-in transport implementation is compiled in
    pub const WEBRTC_SUPPORT: bool = cfg!(feature = "native");

    /// Create a session
    ///
    /// Must be called from within a Tokio runtime; the session's internal
    /// tasks live on it. The only synchronous failures are missing
    /// capabilities ([`Error::EnvironmentUnsupported`],
    /// [`Error::TransportUnavailable`]) and an invalid configuration. A
    /// transport that fails to construct still yields a session, one that
    /// is already tearing down and will report the failure via an `error`
    /// event followed by `close`.
    pub async fn new(options: SessionOptions) -> Result<Session> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::EnvironmentUnsupported(
                "peer sessions must be created inside a tokio runtime".to_string(),
            ));
        }
        options.config.validate()?;

        let factory = match options.transport {
            Some(factory) => factory,
            None => default_factory()?,
        };

        let role = if options.initiator {
            Role::Initiator
        } else {
            Role::Responder
        };

        let inner = Arc::new(SessionInner {
            role,
            transport: Mutex::new(None),
            channel: Mutex::new(None),
            channel_open: AtomicBool::new(false),
            transport_connected: AtomicBool::new(false),
            connect_emitted: AtomicBool::new(false),
            close_emitted: AtomicBool::new(false),
            status: Mutex::new(ConnectionState::New),
            destroyed: AtomicBool::new(false),
            teardown_error: Mutex::new(None),
            negotiator: Mutex::new(Negotiator::new(role)),
            bus: EventBus::new(),
            pending_signals: Mutex::new(Vec::new()),
            pending_streams: Mutex::new(HashMap::new()),
            stream_flush_scheduled: AtomicBool::new(false),
            emitted_streams: Mutex::new(HashSet::new()),
        });

        let (events_tx, events_rx) = unbounded_channel();
        match factory.create(&options.config, events_tx).await {
            Ok(transport) => {
                *inner.status.lock().unwrap() = transport.connection_state();
                *inner.transport.lock().unwrap() = Some(Arc::clone(&transport));
                adapter::spawn_transport_loop(Arc::clone(&inner), events_rx);

                if role == Role::Initiator {
                    match transport
                        .create_data_channel(&options.config.channel_label)
                        .await
                    {
                        Ok(channel) => inner.attach_channel(channel),
                        Err(e) => inner.destroy(Some(e)),
                    }
                }

                inner.request_negotiation();
            }
            Err(e) => {
                let error = match e {
                    Error::TransportConstructionFailed(_) => e,
                    other => Error::TransportConstructionFailed(other.to_string()),
                };
                warn!("transport construction failed: {error}");
                inner.destroy(Some(error));
            }
        }

        Ok(Session { inner })
    }

    /// The session's fixed role
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Last transport-reported connection state; `Closed` after teardown
    pub fn status(&self) -> ConnectionState {
        *self.inner.status.lock().unwrap()
    }

    /// Whether `destroy` has been requested
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_closing()
    }

    /// Attach each track of `stream` to the transport, then request
    /// negotiation
    pub async fn add_stream(&self, stream: MediaStream) {
        self.inner.handle_add_stream(stream).await;
    }

    /// Feed a signaling message received from the remote peer
    pub async fn add_signal(&self, signal: Signal) {
        self.inner.handle_signal(signal).await;
    }

    /// Send a payload over the data channel, best effort
    ///
    /// Silently dropped when the channel is absent or not open.
    pub async fn send(&self, payload: impl Into<Bytes>) {
        self.inner.send_payload(payload.into()).await;
    }

    /// Tear the session down; idempotent
    pub fn destroy(&self) {
        self.inner.destroy(None);
    }

    /// Tear the session down, reporting `error` before `close`
    pub fn destroy_with(&self, error: Error) {
        self.inner.destroy(Some(error));
    }

    /// Subscribe to an event kind; delivery order is subscription order
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.subscribe(kind, false, Arc::new(callback))
    }

    /// Subscribe for a single delivery
    pub fn once<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.subscribe(kind, true, Arc::new(callback))
    }

    /// Remove a subscription; returns false if it was not registered
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }
}

#[cfg(feature = "native")]
fn default_factory() -> Result<Arc<dyn TransportFactory>> {
    Ok(Arc::new(crate::transport::native::NativeTransportFactory))
}

#[cfg(not(feature = "native"))]
fn default_factory() -> Result<Arc<dyn TransportFactory>> {
    Err(Error::TransportUnavailable(
        "no built-in transport compiled in; supply SessionOptions::transport".to_string(),
    ))
}

pub(crate) struct SessionInner {
    role: Role,
    transport: Mutex<Option<Arc<dyn PeerTransport>>>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    channel_open: AtomicBool,
    transport_connected: AtomicBool,
    connect_emitted: AtomicBool,
    close_emitted: AtomicBool,
    status: Mutex<ConnectionState>,

    /// Monotonic false→true, set synchronously by the first `destroy` call;
    /// checked before every transport call and every event emission
    destroyed: AtomicBool,
    teardown_error: Mutex<Option<Arc<Error>>>,
    negotiator: Mutex<Negotiator>,
    bus: EventBus,

    /// Signals emitted before any signal subscriber attached
    pending_signals: Mutex<Vec<Signal>>,

    /// Remote tracks aggregated per stream id for one tick
    pending_streams: Mutex<HashMap<String, MediaStream>>,
    stream_flush_scheduled: AtomicBool,
    emitted_streams: Mutex<HashSet<String>>,
}

impl SessionInner {
    pub(super) fn role(&self) -> Role {
        self.role
    }

    pub(super) fn is_closing(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.lock().unwrap().clone()
    }

    // ---- event delivery ----

    fn subscribe(
        &self,
        kind: EventKind,
        once: bool,
        callback: Arc<dyn Fn(&SessionEvent) + Send + Sync>,
    ) -> SubscriptionId {
        let id = self.bus.subscribe(kind, once, callback);
        // late subscribers are caught up on sticky lifecycle events
        match kind {
            EventKind::Signal => self.flush_pending_signals(),
            EventKind::Connect => {
                if self.connect_emitted.load(Ordering::SeqCst) && !self.is_closing() {
                    self.bus.deliver_to(id, &SessionEvent::Connect);
                }
            }
            EventKind::Close => {
                if self.close_emitted.load(Ordering::SeqCst) {
                    self.bus.deliver_to(id, &SessionEvent::Close);
                }
            }
            EventKind::Error => {
                let error = self.teardown_error.lock().unwrap().clone();
                if let Some(error) = error {
                    self.bus.deliver_to(id, &SessionEvent::Error(error));
                }
            }
            _ => {}
        }
        id
    }

    pub(super) fn emit(&self, event: SessionEvent) {
        if self.is_closing() {
            return;
        }
        self.bus.emit(&event);
    }

    pub(super) fn emit_signal(&self, signal: Signal) {
        if self.is_closing() {
            return;
        }
        let mut pending = self.pending_signals.lock().unwrap();
        if self.bus.has_subscribers(EventKind::Signal) {
            drop(pending);
            self.bus.emit(&SessionEvent::Signal(signal));
        } else {
            debug!("no signal subscriber yet; buffering");
            pending.push(signal);
        }
    }

    fn flush_pending_signals(&self) {
        loop {
            let signal = {
                let mut pending = self.pending_signals.lock().unwrap();
                if pending.is_empty() {
                    return;
                }
                pending.remove(0)
            };
            self.bus.emit(&SessionEvent::Signal(signal));
        }
    }

    // ---- negotiation ----

    pub(super) fn request_negotiation(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }
        match self.negotiator.lock().unwrap().on_trigger() {
            TriggerOutcome::Schedule => {
                debug!("negotiation batch scheduled");
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    // coalesce triggers landing within this tick into one batch
                    tokio::task::yield_now().await;
                    inner.run_batch().await;
                });
            }
            TriggerOutcome::Coalesced => debug!("trigger coalesced into pending batch"),
            TriggerOutcome::Deferred => debug!("round in flight; renegotiation deferred"),
        }
    }

    async fn run_batch(self: Arc<Self>) {
        if self.is_closing() {
            return;
        }
        let outcome = self.negotiator.lock().unwrap().on_batch();
        match outcome {
            BatchOutcome::SuppressedFirst => {
                debug!("responder's first negotiation batch suppressed")
            }
            BatchOutcome::Skip => {}
            BatchOutcome::Negotiate => self.negotiate().await,
        }
    }

    async fn negotiate(self: &Arc<Self>) {
        match self.role {
            Role::Initiator => {
                if let Err(e) = self.send_offer().await {
                    self.negotiator.lock().unwrap().on_round_failed();
                    warn!("negotiation failed: {e}");
                    self.destroy(Some(e));
                }
            }
            Role::Responder => {
                // no authority to offer; ask the initiator to restart the cycle
                debug!("requesting renegotiation from initiator");
                self.emit_signal(Signal::Renegotiate);
            }
        }
    }

    async fn send_offer(&self) -> Result<()> {
        let Some(transport) = self.transport() else {
            return Ok(());
        };
        let offer = transport.create_offer().await?;
        if self.is_closing() {
            return Ok(());
        }
        transport.set_local_description(offer.clone()).await?;
        if self.is_closing() {
            return Ok(());
        }
        debug!("local offer applied; emitting offer signal");
        self.emit_signal(Signal::Offer { sdp: offer.sdp });
        Ok(())
    }

    // ---- inbound signals ----

    pub(super) async fn handle_signal(self: &Arc<Self>, signal: Signal) {
        if self.is_closing() {
            debug!("ignoring signal on destroyed session");
            return;
        }
        match signal {
            Signal::Offer { sdp } => {
                if let Err(e) = self.answer_offer(sdp).await {
                    self.destroy(Some(e));
                }
            }
            Signal::Answer { sdp } => {
                let Some(transport) = self.transport() else {
                    return;
                };
                if let Err(e) = transport
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await
                {
                    self.destroy(Some(e));
                }
            }
            Signal::Candidate { candidate } => {
                let Some(transport) = self.transport() else {
                    return;
                };
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    // non-fatal: the rest of the candidate set may still connect
                    warn!("ignoring rejected remote candidate: {e}");
                }
            }
            Signal::Renegotiate => match self.role {
                Role::Initiator => {
                    debug!("renegotiation requested by remote peer");
                    self.request_negotiation();
                }
                Role::Responder => debug!("responder ignoring renegotiate signal"),
            },
        }
    }

    /// Apply a remote offer and send back an answer. Runs regardless of the
    /// negotiation controller's state: receiving an offer means the remote
    /// side initiated this round, and the exchange completing is what drives
    /// signaling back to stable.
    async fn answer_offer(&self, sdp: String) -> Result<()> {
        let Some(transport) = self.transport() else {
            return Ok(());
        };
        transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        if self.is_closing() {
            return Ok(());
        }
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        if self.is_closing() {
            return Ok(());
        }
        self.emit_signal(Signal::Answer { sdp: answer.sdp });
        Ok(())
    }

    // ---- streams and payloads ----

    pub(super) async fn handle_add_stream(self: &Arc<Self>, stream: MediaStream) {
        if self.is_closing() {
            return;
        }
        let Some(transport) = self.transport() else {
            return;
        };
        for track in &stream.tracks {
            if self.is_closing() {
                return;
            }
            if let Err(e) = transport.add_track(track, &stream.id).await {
                self.destroy(Some(e));
                return;
            }
        }
        self.request_negotiation();
    }

    async fn send_payload(&self, payload: Bytes) {
        if self.is_closing() {
            return;
        }
        let channel = self.channel.lock().unwrap().clone();
        match channel {
            Some(channel) if channel.is_open() => {
                if let Err(e) = channel.send(payload).await {
                    debug!("dropping payload: {e}");
                }
            }
            _ => debug!("dropping payload: data channel not open"),
        }
    }

    // ---- channel and connect tracking ----

    pub(super) fn attach_channel(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        {
            let mut slot = self.channel.lock().unwrap();
            if slot.is_some() {
                warn!(
                    label = %channel.label(),
                    "ignoring additional data channel; sessions carry exactly one"
                );
                return;
            }
            *slot = Some(Arc::clone(&channel));
        }
        debug!(label = %channel.label(), "data channel attached");

        let (events_tx, events_rx) = unbounded_channel();
        channel.subscribe(events_tx);
        adapter::spawn_channel_loop(Arc::clone(self), events_rx);

        if channel.is_open() {
            self.note_channel_open();
        }
    }

    pub(super) fn note_channel_open(&self) {
        self.channel_open.store(true, Ordering::SeqCst);
        self.maybe_emit_connect();
    }

    pub(super) fn note_transport_connected(&self) {
        self.transport_connected.store(true, Ordering::SeqCst);
        self.maybe_emit_connect();
    }

    /// Connect requires the transport connected AND the channel open; fires
    /// once, on whichever transition completes second
    fn maybe_emit_connect(&self) {
        if self.transport_connected.load(Ordering::SeqCst)
            && self.channel_open.load(Ordering::SeqCst)
            && !self.is_closing()
            && !self.connect_emitted.swap(true, Ordering::SeqCst)
        {
            info!("session connected");
            self.bus.emit(&SessionEvent::Connect);
        }
    }

    pub(super) fn set_status(&self, state: ConnectionState) {
        *self.status.lock().unwrap() = state;
    }

    pub(super) fn handle_signaling_change(self: &Arc<Self>, state: SignalingState) {
        if state != SignalingState::Stable {
            return;
        }
        if self.negotiator.lock().unwrap().on_stable() {
            debug!("round complete; running deferred renegotiation");
            self.request_negotiation();
        }
    }

    pub(super) fn handle_remote_track(
        self: &Arc<Self>,
        track: crate::media::MediaTrack,
        stream_id: String,
    ) {
        if self.is_closing() {
            return;
        }
        self.pending_streams
            .lock()
            .unwrap()
            .entry(stream_id.clone())
            .or_insert_with(|| MediaStream::with_id(stream_id))
            .tracks
            .push(track);

        // defer one tick so sibling tracks of the same stream attach first
        if !self.stream_flush_scheduled.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                inner.flush_remote_streams();
            });
        }
    }

    fn flush_remote_streams(&self) {
        self.stream_flush_scheduled.store(false, Ordering::SeqCst);
        let streams: Vec<MediaStream> = {
            let mut pending = self.pending_streams.lock().unwrap();
            pending.drain().map(|(_, stream)| stream).collect()
        };
        for stream in streams {
            if self
                .emitted_streams
                .lock()
                .unwrap()
                .insert(stream.id.clone())
            {
                self.emit(SessionEvent::Stream(stream));
            } else {
                debug!(stream = %stream.id, "additional tracks for already-announced stream");
            }
        }
    }

    // ---- teardown ----

    /// Idempotent: the first call wins, later calls are no-ops. Teardown
    /// itself runs on the next tick so synchronous callers observe
    /// consistent pre-destroy state.
    pub(super) fn destroy(self: &Arc<Self>, error: Option<Error>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(role = ?self.role, "session destroy requested");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            inner.run_teardown(error).await;
        });
    }

    async fn run_teardown(&self, error: Option<Error>) {
        let channel = self.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                self.bus.emit(&SessionEvent::Error(Arc::new(e)));
            }
            channel.detach();
        }

        let transport = self.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                self.bus.emit(&SessionEvent::Error(Arc::new(e)));
            }
            transport.detach();
        }

        *self.status.lock().unwrap() = ConnectionState::Closed;

        if let Some(error) = error {
            let error = Arc::new(error);
            *self.teardown_error.lock().unwrap() = Some(Arc::clone(&error));
            self.bus.emit(&SessionEvent::Error(error));
        }

        info!("session closed");
        self.bus.emit(&SessionEvent::Close);
        self.close_emitted.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransportFactory;

    #[test]
    fn test_environment_unsupported_outside_runtime() {
        let result = futures::executor::block_on(Session::new(SessionOptions::default()));
        assert!(matches!(result, Err(Error::EnvironmentUnsupported(_))));
    }

    fn standalone_factory() -> Option<Arc<dyn TransportFactory>> {
        let factory: Arc<dyn TransportFactory> = MockTransportFactory::standalone();
        Some(factory)
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_synchronously() {
        let options = SessionOptions {
            config: SessionConfig {
                stun_servers: Vec::new(),
                turn_servers: Vec::new(),
                ..Default::default()
            },
            transport: standalone_factory(),
            ..Default::default()
        };
        let result = Session::new(options).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_new_session_status_is_new() {
        let session = Session::new(SessionOptions {
            transport: standalone_factory(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(session.status(), ConnectionState::New);
        assert_eq!(session.role(), Role::Responder);
        assert!(!session.is_destroyed());
    }

    #[tokio::test]
    async fn test_initiator_role_from_options() {
        let session = Session::new(SessionOptions {
            initiator: true,
            transport: standalone_factory(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(session.role(), Role::Initiator);
    }
}
