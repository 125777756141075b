//! Deterministic in-memory transport for tests
//!
//! A [`MockNetwork`] links two transports back to back: descriptions applied
//! on one side drive the scripted signaling-state transitions, and once both
//! sides hold a local and a remote description the pair reports itself
//! connected and opens the data channel end to end. A standalone factory
//! never connects, which is enough for single-session negotiation tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::media::MediaTrack;
use crate::signal::IceCandidate;
use crate::transport::{
    ChannelEvent, ChannelSink, ConnectionState, DataChannel, DescriptionKind, PeerTransport,
    SessionDescription, SignalingState, TransportEvent, TransportFactory,
};

/// A pair of linked mock transports
pub struct MockNetwork;

impl MockNetwork {
    /// Build two factories whose transports are wired back to back
    pub fn pair() -> (Arc<MockTransportFactory>, Arc<MockTransportFactory>) {
        let hub = Arc::new(Hub::new(true));
        (
            Arc::new(MockTransportFactory {
                hub: Arc::clone(&hub),
                side: 0,
            }),
            Arc::new(MockTransportFactory { hub, side: 1 }),
        )
    }
}

/// Factory producing one side of a mock network
pub struct MockTransportFactory {
    hub: Arc<Hub>,
    side: usize,
}

impl MockTransportFactory {
    /// Factory for an unlinked transport: negotiation primitives work, but
    /// the connection never establishes
    pub fn standalone() -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::new(Hub::new(false)),
            side: 0,
        })
    }

    /// Factory whose `create` always fails, for construction-failure tests
    pub fn failing() -> Arc<FailingTransportFactory> {
        Arc::new(FailingTransportFactory)
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _config: &SessionConfig,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        self.hub.state.lock().unwrap().sides[self.side].events = Some(events);
        Ok(Arc::new(MockTransport {
            hub: Arc::clone(&self.hub),
            side: self.side,
        }))
    }
}

/// Factory that refuses to build a transport
pub struct FailingTransportFactory;

#[async_trait]
impl TransportFactory for FailingTransportFactory {
    async fn create(
        &self,
        _config: &SessionConfig,
        _events: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        Err(Error::TransportConstructionFailed(
            "mock factory configured to fail".to_string(),
        ))
    }
}

struct Hub {
    linked: bool,
    state: Mutex<HubState>,
}

struct HubState {
    sides: [SideState; 2],
    connected: bool,
    offer_seq: u32,
}

#[derive(Default)]
struct SideState {
    events: Option<UnboundedSender<TransportEvent>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    channel: Option<Arc<MockDataChannel>>,
    candidates_added: usize,
    tracks: Vec<(MediaTrack, String)>,
    closed: bool,
    connected: bool,
}

impl SideState {
    fn send(&self, event: TransportEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn complete(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }
}

impl Hub {
    fn new(linked: bool) -> Self {
        Self {
            linked,
            state: Mutex::new(HubState {
                sides: [SideState::default(), SideState::default()],
                connected: false,
                offer_seq: 0,
            }),
        }
    }

    /// Both sides hold both descriptions: report connected and open the
    /// data channel end to end
    fn check_connected(&self, state: &mut HubState) {
        if !self.linked
            || state.connected
            || !state.sides[0].complete()
            || !state.sides[1].complete()
        {
            return;
        }
        state.connected = true;
        debug!("mock network connected");

        for side in &mut state.sides {
            side.connected = true;
        }
        state.sides[0].send(TransportEvent::ConnectionStateChange(
            ConnectionState::Connected,
        ));
        state.sides[1].send(TransportEvent::ConnectionStateChange(
            ConnectionState::Connected,
        ));

        // pair up the data channel: the creating side keeps its handle, the
        // other side receives a twin via the incoming-channel notification
        for owner in 0..2 {
            let peer = 1 - owner;
            if state.sides[owner].channel.is_some() && state.sides[peer].channel.is_none() {
                let channel = Arc::clone(state.sides[owner].channel.as_ref().unwrap());
                let twin = MockDataChannel::new(channel.label.clone());
                *channel.peer.lock().unwrap() = Arc::downgrade(&twin);
                *twin.peer.lock().unwrap() = Arc::downgrade(&channel);
                state.sides[peer].channel = Some(Arc::clone(&twin));
                state.sides[peer].send(TransportEvent::DataChannel(twin.clone()));
            }
        }
        for side in &state.sides {
            if let Some(channel) = &side.channel {
                channel.mark_open();
            }
        }

        // tracks attached before connectivity surface on the other side now
        for owner in 0..2 {
            let peer = 1 - owner;
            let tracks = state.sides[owner].tracks.clone();
            for (track, stream_id) in tracks {
                state.sides[peer].send(TransportEvent::Track { track, stream_id });
            }
        }
    }
}

struct MockTransport {
    hub: Arc<Hub>,
    side: usize,
}

impl MockTransport {
    fn with_side<R>(&self, f: impl FnOnce(&mut SideState) -> R) -> R {
        let mut state = self.hub.state.lock().unwrap();
        f(&mut state.sides[self.side])
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.hub.state.lock().unwrap();
        state.offer_seq += 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=mock\r\n",
            state.offer_seq
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.hub.state.lock().unwrap();
        match &state.sides[self.side].remote {
            Some(desc) if desc.kind == DescriptionKind::Offer => Ok(SessionDescription::answer(
                "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=mock-answer\r\n",
            )),
            _ => Err(Error::Sdp(
                "cannot create answer without a remote offer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.hub.state.lock().unwrap();
        let signaling = match desc.kind {
            DescriptionKind::Offer => SignalingState::HaveLocalOffer,
            DescriptionKind::Answer => SignalingState::Stable,
        };
        let side = &mut state.sides[self.side];
        side.local = Some(desc);
        side.send(TransportEvent::SignalingStateChange(signaling));
        // one synthetic host candidate per applied local description
        side.send(TransportEvent::IceCandidate(IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2113937151 127.0.0.1 {} typ host",
                50000 + self.side
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        self.hub.check_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.hub.state.lock().unwrap();
        let signaling = match desc.kind {
            DescriptionKind::Offer => SignalingState::HaveRemoteOffer,
            DescriptionKind::Answer => SignalingState::Stable,
        };
        let side = &mut state.sides[self.side];
        side.remote = Some(desc);
        side.send(TransportEvent::SignalingStateChange(signaling));
        self.hub.check_connected(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::CandidateRejected(format!(
                "malformed candidate line: {:?}",
                candidate.candidate
            )));
        }
        self.with_side(|side| side.candidates_added += 1);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = MockDataChannel::new(label.to_string());
        self.with_side(|side| side.channel = Some(Arc::clone(&channel)));
        Ok(channel)
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<()> {
        let track = track.clone();
        let stream_id = stream_id.to_string();
        let mut state = self.hub.state.lock().unwrap();
        if state.connected {
            state.sides[1 - self.side].send(TransportEvent::Track {
                track: track.clone(),
                stream_id: stream_id.clone(),
            });
        }
        state.sides[self.side].tracks.push((track, stream_id));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.with_side(|side| {
            side.closed = true;
            side.connected = false;
        });
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        let state = self.hub.state.lock().unwrap();
        let side = &state.sides[self.side];
        if side.closed {
            ConnectionState::Closed
        } else if side.connected {
            ConnectionState::Connected
        } else {
            ConnectionState::New
        }
    }

    fn detach(&self) {
        self.with_side(|side| side.events = None);
    }
}

/// One end of a mock data channel pair
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    peer: Mutex<Weak<MockDataChannel>>,
    sink: Mutex<ChannelSink>,
}

impl MockDataChannel {
    fn new(label: String) -> Arc<Self> {
        Arc::new(Self {
            label,
            open: AtomicBool::new(false),
            peer: Mutex::new(Weak::new()),
            sink: Mutex::new(ChannelSink::new()),
        })
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.sink.lock().unwrap().deliver(ChannelEvent::Open);
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Channel("data channel is not open".to_string()));
        }
        let peer = self.peer.lock().unwrap().upgrade();
        match peer {
            Some(peer) => {
                peer.sink
                    .lock()
                    .unwrap()
                    .deliver(ChannelEvent::Message(payload));
                Ok(())
            }
            None => Err(Error::Channel("peer channel is gone".to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.sink.lock().unwrap().deliver(ChannelEvent::Closed);
        if let Some(peer) = self.peer.lock().unwrap().upgrade() {
            peer.open.store(false, Ordering::SeqCst);
            peer.sink.lock().unwrap().deliver(ChannelEvent::Closed);
        }
        Ok(())
    }

    fn subscribe(&self, events: UnboundedSender<ChannelEvent>) {
        self.sink.lock().unwrap().attach(events);
    }

    fn detach(&self) {
        *self.sink.lock().unwrap() = ChannelSink::Detached;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_standalone_offer_answer_primitives() {
        let factory = MockTransportFactory::standalone();
        let (tx, mut rx) = unbounded_channel();
        let transport = factory.create(&SessionConfig::default(), tx).await.unwrap();

        assert!(transport.create_answer().await.is_err());

        transport
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        let answer = transport.create_answer().await.unwrap();
        assert_eq!(answer.kind, DescriptionKind::Answer);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            TransportEvent::SignalingStateChange(SignalingState::HaveRemoteOffer)
        ));
    }

    #[tokio::test]
    async fn test_malformed_candidate_rejected() {
        let factory = MockTransportFactory::standalone();
        let (tx, _rx) = unbounded_channel();
        let transport = factory.create(&SessionConfig::default(), tx).await.unwrap();

        let err = transport
            .add_ice_candidate(IceCandidate {
                candidate: "garbage".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CandidateRejected(_)));

        // a well-formed candidate is recorded
        transport
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2113937151 192.0.2.1 54555 typ host".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            factory.hub.state.lock().unwrap().sides[0].candidates_added,
            1
        );
    }

    #[tokio::test]
    async fn test_pair_connects_after_full_exchange() {
        let (factory_a, factory_b) = MockNetwork::pair();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = factory_a.create(&SessionConfig::default(), tx_a).await.unwrap();
        let b = factory_b.create(&SessionConfig::default(), tx_b).await.unwrap();

        let channel_a = a.create_data_channel("test").await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert!(channel_a.is_open());

        // side B observed the incoming channel
        let mut saw_channel = false;
        while let Ok(event) = rx_b.try_recv() {
            if let TransportEvent::DataChannel(channel) = event {
                assert_eq!(channel.label(), "test");
                saw_channel = true;
            }
        }
        assert!(saw_channel);

        let mut saw_connected = false;
        while let Ok(event) = rx_a.try_recv() {
            if matches!(
                event,
                TransportEvent::ConnectionStateChange(ConnectionState::Connected)
            ) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
    }

    #[tokio::test]
    async fn test_channel_pair_delivers_messages() {
        let (factory_a, factory_b) = MockNetwork::pair();
        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = factory_a.create(&SessionConfig::default(), tx_a).await.unwrap();
        let b = factory_b.create(&SessionConfig::default(), tx_b).await.unwrap();

        let channel_a = a.create_data_channel("test").await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let channel_b = loop {
            match rx_b.recv().await.unwrap() {
                TransportEvent::DataChannel(channel) => break channel,
                _ => continue,
            }
        };

        let (events_tx, mut events_rx) = unbounded_channel();
        channel_b.subscribe(events_tx);
        // the buffered Open is replayed first
        assert!(matches!(events_rx.recv().await.unwrap(), ChannelEvent::Open));

        channel_a.send(Bytes::from_static(b"ping")).await.unwrap();
        match events_rx.recv().await.unwrap() {
            ChannelEvent::Message(payload) => assert_eq!(payload.as_ref(), b"ping"),
            other => panic!("expected message, got {other:?}"),
        }
    }
}
