//! Default peer transport backed by the `webrtc` crate
//!
//! Maps the capability traits onto a real `RTCPeerConnection`: ICE servers
//! come from [`SessionConfig`], transport callbacks are forwarded into the
//! session's event stream, and outbound tracks become static sample tracks.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage as RtcDataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::media::{MediaTrack, TrackKind};
use crate::signal::IceCandidate;
use crate::transport::{
    ChannelEvent, ChannelSink, ConnectionState, DataChannel, DescriptionKind, PeerTransport,
    SessionDescription, SignalingState, TransportEvent, TransportFactory,
};

/// Factory for the `webrtc`-crate-backed transport
#[derive(Debug, Default)]
pub struct NativeTransportFactory;

#[async_trait]
impl TransportFactory for NativeTransportFactory {
    async fn create(
        &self,
        config: &SessionConfig,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::TransportConstructionFailed(format!("register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| {
                Error::TransportConstructionFailed(format!("register interceptors: {e}"))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(rtc_configuration(config))
            .await
            .map_err(|e| Error::TransportConstructionFailed(e.to_string()))?;

        let transport = Arc::new(NativeTransport {
            peer_connection: Arc::new(peer_connection),
            events: Arc::new(Mutex::new(Some(events))),
            senders: Mutex::new(Vec::new()),
        });
        transport.install_callbacks();

        debug!("native transport created");
        Ok(transport)
    }
}

fn rtc_configuration(config: &SessionConfig) -> RTCConfiguration {
    let ice_servers: Vec<RTCIceServer> = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| {
            RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
            }
        }))
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

type EventSlot = Arc<Mutex<Option<UnboundedSender<TransportEvent>>>>;

struct NativeTransport {
    peer_connection: Arc<RTCPeerConnection>,

    /// Cleared by `detach`; callbacks that outlive the session become no-ops
    events: EventSlot,

    /// RTP senders retained so outbound tracks are not dropped
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl NativeTransport {
    fn install_callbacks(&self) {
        let pc = &self.peer_connection;

        let events = Arc::clone(&self.events);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if let Some(mapped) = map_connection_state(state) {
                deliver(&events, TransportEvent::ConnectionStateChange(mapped));
            }
            Box::pin(async {})
        }));

        let events = Arc::clone(&self.events);
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            if let Some(mapped) = map_signaling_state(state) {
                deliver(&events, TransportEvent::SignalingStateChange(mapped));
            }
            Box::pin(async {})
        }));

        let events = Arc::clone(&self.events);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => deliver(
                        &events,
                        TransportEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                    ),
                    Err(e) => warn!("failed to serialize local ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let events = Arc::clone(&self.events);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel: Arc<dyn DataChannel> = NativeDataChannel::wrap(dc);
            deliver(&events, TransportEvent::DataChannel(channel));
            Box::pin(async {})
        }));

        let events = Arc::clone(&self.events);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                RTPCodecType::Unspecified => return Box::pin(async {}),
            };
            deliver(
                &events,
                TransportEvent::Track {
                    track: MediaTrack {
                        id: track.id(),
                        kind,
                    },
                    stream_id: track.stream_id(),
                },
            );
            Box::pin(async {})
        }));
    }
}

fn deliver(events: &EventSlot, event: TransportEvent) {
    if let Some(tx) = events.lock().unwrap().as_ref() {
        let _ = tx.send(event);
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            Some(SignalingState::HaveLocalOffer)
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            Some(SignalingState::HaveRemoteOffer)
        }
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        RTCSignalingState::Unspecified => None,
    }
}

fn rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(desc.sdp),
        DescriptionKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| Error::Sdp(e.to_string()))
}

fn track_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl PeerTransport for NativeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("create offer: {e}")))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("create answer: {e}")))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(rtc_description(desc)?)
            .await
            .map_err(|e| Error::Sdp(format!("set local description: {e}")))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(rtc_description(desc)?)
            .await
            .map_err(|e| Error::Sdp(format!("set remote description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| Error::CandidateRejected(e.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self
            .peer_connection
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await
            .map_err(|e| Error::Channel(format!("create data channel: {e}")))?;
        Ok(NativeDataChannel::wrap(dc))
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<()> {
        let local: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            track_capability(track.kind),
            track.id.clone(),
            stream_id.to_string(),
        ));

        let sender = self
            .peer_connection
            .add_track(local)
            .await
            .map_err(|e| Error::Sdp(format!("add track: {e}")))?;
        self.senders.lock().unwrap().push(sender);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::TransportCloseFailed(e.to_string()))
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.peer_connection.connection_state())
            .unwrap_or(ConnectionState::New)
    }

    fn detach(&self) {
        self.events.lock().unwrap().take();
    }
}

struct NativeDataChannel {
    dc: Arc<RTCDataChannel>,
    sink: Arc<Mutex<ChannelSink>>,
}

impl NativeDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let channel = Arc::new(Self {
            dc,
            sink: Arc::new(Mutex::new(ChannelSink::new())),
        });
        channel.install_callbacks();
        channel
    }

    fn install_callbacks(&self) {
        let sink = Arc::clone(&self.sink);
        self.dc.on_open(Box::new(move || {
            sink.lock().unwrap().deliver(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let sink = Arc::clone(&self.sink);
        self.dc.on_close(Box::new(move || {
            sink.lock().unwrap().deliver(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        let sink = Arc::clone(&self.sink);
        self.dc.on_message(Box::new(move |msg: RtcDataChannelMessage| {
            sink.lock().unwrap().deliver(ChannelEvent::Message(msg.data));
            Box::pin(async {})
        }));

        let sink = Arc::clone(&self.sink);
        self.dc.on_error(Box::new(move |err| {
            sink.lock().unwrap().deliver(ChannelEvent::Error(err.to_string()));
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl DataChannel for NativeDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        self.dc
            .send(&payload)
            .await
            .map(|_| ())
            .map_err(|e| Error::Channel(format!("send: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| Error::ChannelCloseFailed(e.to_string()))
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

    #[test]
    fn test_ice_server_mapping() {
        let config = SessionConfig {
            turn_servers: vec![crate::config::TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "pass".to_string(),
            }],
            ..Default::default()
        };
        let rtc = rtc_configuration(&config);
        assert_eq!(
            rtc.ice_servers.len(),
            config.stun_servers.len() + config.turn_servers.len()
        );
        let turn = rtc.ice_servers.last().unwrap();
        assert_eq!(turn.username, "user");
    }

    #[test]
    fn test_signaling_state_mapping() {
        assert_eq!(
            map_signaling_state(RTCSignalingState::Stable),
            Some(SignalingState::Stable)
        );
        assert_eq!(map_signaling_state(RTCSignalingState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_factory_builds_transport() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = NativeTransportFactory
            .create(&SessionConfig::default(), tx)
            .await
            .unwrap();
        assert_eq!(transport.connection_state(), ConnectionState::New);

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, DescriptionKind::Offer);
        assert!(!offer.sdp.is_empty());
    }
}
