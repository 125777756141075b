//! Transport adapter: binds transport and channel event streams to session
//! actions
//!
//! Each session owns one loop per stream. The loops keep draining after
//! destroy so late callbacks from the underlying stack land nowhere, and
//! they end when the transport or channel drops its sender on detach.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::error::Error;
use crate::event::SessionEvent;
use crate::session::{Role, SessionInner};
use crate::signal::Signal;
use crate::transport::{ChannelEvent, ConnectionState, TransportEvent};

pub(super) fn spawn_transport_loop(
    inner: Arc<SessionInner>,
    mut events: UnboundedReceiver<TransportEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if inner.is_closing() {
                continue;
            }
            match event {
                TransportEvent::ConnectionStateChange(state) => {
                    handle_connection_change(&inner, state)
                }
                TransportEvent::SignalingStateChange(state) => {
                    inner.handle_signaling_change(state)
                }
                TransportEvent::IceCandidate(candidate) => {
                    // one signal per candidate, fire and forget
                    inner.emit_signal(Signal::Candidate { candidate });
                }
                TransportEvent::DataChannel(channel) => match inner.role() {
                    Role::Responder => inner.attach_channel(channel),
                    Role::Initiator => warn!(
                        label = %channel.label(),
                        "initiator received an incoming data channel; ignoring"
                    ),
                },
                TransportEvent::Track { track, stream_id } => {
                    inner.handle_remote_track(track, stream_id)
                }
            }
        }
        debug!("transport event stream ended");
    });
}

fn handle_connection_change(inner: &Arc<SessionInner>, state: ConnectionState) {
    debug!(?state, "transport connection state changed");
    inner.set_status(state);
    match state {
        ConnectionState::Connected => inner.note_transport_connected(),
        ConnectionState::Failed | ConnectionState::Closed => {
            debug!("transport ended; tearing session down");
            inner.destroy(None);
        }
        ConnectionState::Disconnected => {
            warn!("transport reports disconnection; waiting for recovery")
        }
        ConnectionState::New | ConnectionState::Connecting => {}
    }
}

pub(super) fn spawn_channel_loop(
    inner: Arc<SessionInner>,
    mut events: UnboundedReceiver<ChannelEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if inner.is_closing() {
                continue;
            }
            match event {
                ChannelEvent::Open => inner.note_channel_open(),
                ChannelEvent::Closed => {
                    debug!("data channel closed; tearing session down");
                    inner.destroy(None);
                }
                ChannelEvent::Message(payload) => inner.emit(SessionEvent::Data(payload)),
                ChannelEvent::Error(message) => inner.destroy(Some(Error::Channel(message))),
            }
        }
        debug!("channel event stream ended");
    });
}
