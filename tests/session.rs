//! End-to-end session behavior against the in-memory mock transport

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::{sleep, timeout, timeout_at, Instant};

use peerlink::transport::mock::{MockNetwork, MockTransportFactory};
use peerlink::transport::TransportFactory;
use peerlink::{
    ConnectionState, Error, EventKind, IceCandidate, MediaStream, MediaTrack, Session,
    SessionEvent, SessionOptions, Signal, TrackKind,
};

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn session_with(initiator: bool, factory: Arc<dyn TransportFactory>) -> Session {
    Session::new(SessionOptions {
        initiator,
        transport: Some(factory),
        ..Default::default()
    })
    .await
    .expect("session construction")
}

/// Collect a session's events of one kind into a channel
fn events(session: &Session, kind: EventKind) -> UnboundedReceiver<SessionEvent> {
    let (tx, rx) = unbounded_channel();
    session.on(kind, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

/// Collect a session's outgoing signals into a channel
fn signals(session: &Session) -> UnboundedReceiver<Signal> {
    let (tx, rx) = unbounded_channel();
    session.on(EventKind::Signal, move |event| {
        if let SessionEvent::Signal(signal) = event {
            let _ = tx.send(signal.clone());
        }
    });
    rx
}

/// Forward every signal one session emits into the other's `add_signal`
fn wire(from: &Session, to: &Session) {
    let (tx, mut rx) = unbounded_channel();
    from.on(EventKind::Signal, move |event| {
        if let SessionEvent::Signal(signal) = event {
            let _ = tx.send(signal.clone());
        }
    });
    let to = to.clone();
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            to.add_signal(signal).await;
        }
    });
}

async fn next_event(rx: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

async fn next_offer(rx: &mut UnboundedReceiver<Signal>) -> String {
    loop {
        let signal = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for offer")
            .expect("signal stream ended");
        if let Signal::Offer { sdp } = signal {
            return sdp;
        }
    }
}

/// Drain signals arriving within `window`
async fn collect_signals(rx: &mut UnboundedReceiver<Signal>, window: Duration) -> Vec<Signal> {
    let deadline = Instant::now() + window;
    let mut out = Vec::new();
    while let Ok(Some(signal)) = timeout_at(deadline, rx.recv()).await {
        out.push(signal);
    }
    out
}

fn count_offers(signals: &[Signal]) -> usize {
    signals
        .iter()
        .filter(|s| matches!(s, Signal::Offer { .. }))
        .count()
}

// ---- lifecycle ----

#[tokio::test]
async fn destroy_is_idempotent() {
    trace_init();
    let session = session_with(false, MockTransportFactory::standalone()).await;
    let mut closes = events(&session, EventKind::Close);

    session.destroy();
    session.destroy();
    session.destroy();

    assert!(matches!(next_event(&mut closes).await, SessionEvent::Close));
    assert!(session.is_destroyed());
    assert_eq!(session.status(), ConnectionState::Closed);

    // repeated destroys, including after teardown finished, emit nothing
    session.destroy();
    sleep(Duration::from_millis(100)).await;
    assert!(closes.try_recv().is_err());
}

#[tokio::test]
async fn construction_failure_reports_error_then_close() {
    trace_init();
    let session = Session::new(SessionOptions {
        initiator: true,
        transport: Some(MockTransportFactory::failing()),
        ..Default::default()
    })
    .await
    .expect("construction failure must not raise past the caller");

    let mut errors = events(&session, EventKind::Error);
    let mut closes = events(&session, EventKind::Close);

    match next_event(&mut errors).await {
        SessionEvent::Error(error) => {
            assert!(matches!(*error, Error::TransportConstructionFailed(_)))
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(matches!(next_event(&mut closes).await, SessionEvent::Close));
    assert!(session.is_destroyed());
}

#[test]
fn session_works_under_plain_block_on() {
    tokio_test::block_on(async {
        let session = session_with(false, MockTransportFactory::standalone()).await;
        assert_eq!(session.status(), ConnectionState::New);
        session.destroy();
    });
}

// ---- negotiation ----

#[tokio::test]
async fn initiator_emits_exactly_one_offer() {
    trace_init();
    let session = session_with(true, MockTransportFactory::standalone()).await;
    let mut rx = signals(&session);

    let collected = collect_signals(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(count_offers(&collected), 1);
    assert!(!collected
        .iter()
        .any(|s| matches!(s, Signal::Answer { .. } | Signal::Renegotiate)));
}

#[tokio::test]
async fn responder_never_offers_and_first_batch_is_suppressed() {
    trace_init();
    let session = session_with(false, MockTransportFactory::standalone()).await;
    let mut rx = signals(&session);

    // the construction-triggered batch is the responder's first: no signal
    let collected = collect_signals(&mut rx, Duration::from_millis(200)).await;
    assert!(collected.is_empty());

    // the next trigger negotiates normally, as a renegotiate request
    let mut stream = MediaStream::new();
    stream.add_track(MediaTrack::new(TrackKind::Audio));
    session.add_stream(stream).await;

    let collected = collect_signals(&mut rx, Duration::from_millis(300)).await;
    assert!(collected.contains(&Signal::Renegotiate));
    assert_eq!(count_offers(&collected), 0);
}

#[tokio::test]
async fn trigger_during_negotiation_defers_one_round() {
    trace_init();
    let session = session_with(true, MockTransportFactory::standalone()).await;
    let mut rx = signals(&session);

    let _first = next_offer(&mut rx).await;

    // the round is still in flight (no answer yet): this trigger must wait
    let mut stream = MediaStream::new();
    stream.add_track(MediaTrack::new(TrackKind::Audio));
    session.add_stream(stream).await;

    let collected = collect_signals(&mut rx, Duration::from_millis(200)).await;
    assert_eq!(count_offers(&collected), 0);

    // completing the round releases exactly one deferred negotiation
    session
        .add_signal(Signal::Answer {
            sdp: "v=0\r\ns=answer\r\n".to_string(),
        })
        .await;

    let _second = next_offer(&mut rx).await;
    let collected = collect_signals(&mut rx, Duration::from_millis(200)).await;
    assert_eq!(count_offers(&collected), 0);
}

#[tokio::test]
async fn offer_yields_exactly_one_answer() {
    trace_init();
    let session = session_with(false, MockTransportFactory::standalone()).await;
    let mut rx = signals(&session);

    session
        .add_signal(Signal::Offer {
            sdp: "v=0\r\ns=offer\r\n".to_string(),
        })
        .await;

    let collected = collect_signals(&mut rx, Duration::from_millis(300)).await;
    let answers = collected
        .iter()
        .filter(|s| matches!(s, Signal::Answer { .. }))
        .count();
    assert_eq!(answers, 1);
    assert_eq!(count_offers(&collected), 0);
}

#[tokio::test]
async fn renegotiate_signal_restarts_the_cycle_on_the_initiator() {
    trace_init();
    let session = session_with(true, MockTransportFactory::standalone()).await;
    let mut rx = signals(&session);

    let _first = next_offer(&mut rx).await;
    session
        .add_signal(Signal::Answer {
            sdp: "v=0\r\ns=answer\r\n".to_string(),
        })
        .await;

    session.add_signal(Signal::Renegotiate).await;
    let _second = next_offer(&mut rx).await;
}

#[tokio::test]
async fn renegotiate_signal_is_a_noop_on_the_responder() {
    trace_init();
    let session = session_with(false, MockTransportFactory::standalone()).await;
    let mut rx = signals(&session);

    session.add_signal(Signal::Renegotiate).await;

    let collected = collect_signals(&mut rx, Duration::from_millis(200)).await;
    assert!(collected.is_empty());
    assert!(!session.is_destroyed());
}

// ---- candidates ----

#[tokio::test]
async fn malformed_candidate_is_non_fatal() {
    trace_init();
    let session = session_with(false, MockTransportFactory::standalone()).await;
    let mut errors = events(&session, EventKind::Error);

    session
        .add_signal(Signal::Candidate {
            candidate: IceCandidate {
                candidate: "garbage".to_string(),
                ..Default::default()
            },
        })
        .await;

    sleep(Duration::from_millis(100)).await;
    assert!(errors.try_recv().is_err());
    assert!(!session.is_destroyed());
}

// ---- connectivity and data ----

#[tokio::test]
async fn loopback_pair_connects_and_exchanges_data() {
    trace_init();
    let (factory_a, factory_b) = MockNetwork::pair();
    let a = session_with(true, factory_a).await;
    let b = session_with(false, factory_b).await;

    let mut connect_a = events(&a, EventKind::Connect);
    let mut connect_b = events(&b, EventKind::Connect);
    let mut data_a = events(&a, EventKind::Data);
    let mut data_b = events(&b, EventKind::Data);

    wire(&a, &b);
    wire(&b, &a);

    assert!(matches!(
        next_event(&mut connect_a).await,
        SessionEvent::Connect
    ));
    assert!(matches!(
        next_event(&mut connect_b).await,
        SessionEvent::Connect
    ));
    assert_eq!(a.status(), ConnectionState::Connected);

    a.send(Bytes::from_static(b"ping")).await;
    match next_event(&mut data_b).await {
        SessionEvent::Data(payload) => assert_eq!(payload.as_ref(), b"ping"),
        other => panic!("expected data, got {other:?}"),
    }

    b.send(Bytes::from_static(b"pong")).await;
    match next_event(&mut data_a).await {
        SessionEvent::Data(payload) => assert_eq!(payload.as_ref(), b"pong"),
        other => panic!("expected data, got {other:?}"),
    }
}

#[tokio::test]
async fn connect_subscriber_attached_late_still_fires() {
    trace_init();
    let (factory_a, factory_b) = MockNetwork::pair();
    let a = session_with(true, factory_a).await;
    let b = session_with(false, factory_b).await;

    let mut connect_a = events(&a, EventKind::Connect);
    wire(&a, &b);
    wire(&b, &a);
    next_event(&mut connect_a).await;

    // already connected: a new subscriber is caught up immediately
    let mut late = events(&a, EventKind::Connect);
    assert!(matches!(next_event(&mut late).await, SessionEvent::Connect));
}

#[tokio::test]
async fn send_before_connect_is_silently_dropped() {
    trace_init();
    let session = session_with(true, MockTransportFactory::standalone()).await;
    let mut errors = events(&session, EventKind::Error);

    session.send(Bytes::from_static(b"too early")).await;

    sleep(Duration::from_millis(100)).await;
    assert!(errors.try_recv().is_err());
    assert!(!session.is_destroyed());
}

#[tokio::test]
async fn destroying_one_peer_closes_the_other() {
    trace_init();
    let (factory_a, factory_b) = MockNetwork::pair();
    let a = session_with(true, factory_a).await;
    let b = session_with(false, factory_b).await;

    let mut connect_a = events(&a, EventKind::Connect);
    let mut close_b = events(&b, EventKind::Close);
    wire(&a, &b);
    wire(&b, &a);
    next_event(&mut connect_a).await;

    a.destroy();
    assert!(matches!(next_event(&mut close_b).await, SessionEvent::Close));
}

// ---- remote streams ----

#[tokio::test]
async fn remote_tracks_aggregate_into_one_stream_event() {
    trace_init();
    let (factory_a, factory_b) = MockNetwork::pair();
    let a = session_with(true, factory_a).await;
    let b = session_with(false, factory_b).await;

    let mut stream = MediaStream::new();
    stream.add_track(MediaTrack::new(TrackKind::Audio));
    stream.add_track(MediaTrack::new(TrackKind::Video));
    let stream_id = stream.id.clone();
    a.add_stream(stream).await;

    let mut streams_b = events(&b, EventKind::Stream);
    wire(&a, &b);
    wire(&b, &a);

    match next_event(&mut streams_b).await {
        SessionEvent::Stream(remote) => {
            assert_eq!(remote.id, stream_id);
            assert_eq!(remote.tracks.len(), 2);
        }
        other => panic!("expected stream, got {other:?}"),
    }

    // sibling tracks coalesced: no second event for the same stream
    sleep(Duration::from_millis(200)).await;
    assert!(streams_b.try_recv().is_err());
}
