mod common;

use common::{eventually, next_matching, settle, test_config, FakeRtc, RtcCall, Surface};
use heliocam_signaling::error::SignalingError;
use heliocam_signaling::events::{ConnectionStatus, SessionEvent};
use heliocam_signaling::peer::{ConnectionState, MediaConstraints, MediaKind, MediaSink, SdpKind};
use heliocam_signaling::session::{create_session, SessionRef, SignalMessage};
use heliocam_signaling::signaling::candidates::CandidateEntry;
use heliocam_signaling::signaling::{JoinTarget, JoinerHandle, JoinerState};
use heliocam_signaling::store::memory::StoreOp;
use heliocam_signaling::store::{MemoryStore, SignalingStore};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

const IDENTITY: &str = "host@cam.io";
const OFFER_SDP: &str = "v=0\r\no=host 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

struct Fixture {
    store: Arc<MemoryStore>,
    rtc: Arc<FakeRtc>,
    surface: Arc<Surface>,
    joiner: JoinerHandle,
    session: SessionRef,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let (session, _) = create_session(&*store, IDENTITY, "Nursery", Some("AB12cd"))
        .await
        .unwrap();
    let (rtc, rtc_events) = FakeRtc::new("joiner");
    let surface = Arc::new(Surface::default());
    let joiner = JoinerHandle::spawn(
        store.clone(),
        rtc.clone(),
        rtc_events,
        IDENTITY,
        Some(surface.clone() as Arc<dyn MediaSink>),
        test_config(),
    );
    Fixture {
        store,
        rtc,
        surface,
        joiner,
        session,
    }
}

async fn publish_offer(f: &Fixture, sdp: &str, epoch: u64) {
    f.store
        .write(&f.session.offer(), SignalMessage::new(sdp, epoch).to_value())
        .await
        .unwrap();
}

/// Session with an offer at epoch 1, joined.
async fn joined() -> Fixture {
    let f = fixture().await;
    publish_offer(&f, OFFER_SDP, 1).await;
    assert_ok!(f.joiner.join(JoinTarget::Session(f.session.clone())).await);
    f
}

fn answer_of(f: &Fixture) -> SignalMessage {
    let value = f.store.get(&f.session.answer()).expect("answer missing");
    SignalMessage::decode("answer", &value).unwrap()
}

#[tokio::test]
async fn missing_offer_leaves_joiner_idle() {
    let f = fixture().await;
    let err = assert_err!(f.joiner.join(JoinTarget::Session(f.session.clone())).await);
    assert!(err.is_soft());
    assert_eq!(f.joiner.state().await, JoinerState::Idle);
    assert_eq!(f.store.get(&f.session.answer()), None);
    assert_eq!(f.store.listener_count(), 0);

    publish_offer(&f, OFFER_SDP, 1).await;
    assert_ok!(f.joiner.join(JoinTarget::Session(f.session.clone())).await);
    assert_eq!(f.joiner.state().await, JoinerState::AnswerPublished);
}

#[tokio::test]
async fn join_answers_the_fetched_offer_once() {
    let f = joined().await;

    assert_eq!(f.rtc.remote_descriptions(SdpKind::Offer), vec![OFFER_SDP.to_owned()]);
    assert_eq!(
        f.rtc.count(|c| *c == RtcCall::CreateAnswer(MediaConstraints::receive_all())),
        1
    );
    let answer = answer_of(&f);
    assert_eq!(answer.epoch, 1);
    assert!(answer.sdp.starts_with("v=0"));
    assert_eq!(f.store.get(&f.session.field("someoneWatching")), Some(json!(1)));

    let err = assert_err!(f.joiner.join(JoinTarget::Session(f.session.clone())).await);
    assert!(matches!(err, SignalingError::InvalidState(_)));
    assert_eq!(f.store.writes_to(&f.session.answer()), 1);
}

#[tokio::test]
async fn existing_candidates_are_replayed_once_each() {
    let f = fixture().await;
    publish_offer(&f, OFFER_SDP, 1).await;
    let collection = f.session.candidates();
    let first = json!({"sdp": "candidate:1 1 udp 2122260223 192.168.0.2 50001 typ host", "sdpMid": "0", "sdpMLineIndex": 0});
    let second = json!({"sdp": "candidate:2 1 udp 2122260223 192.168.0.2 50002 typ host", "sdpMid": "0", "sdpMLineIndex": 0});
    f.store.write(&collection.child("candidate_1"), first.clone()).await.unwrap();
    f.store.write(&collection.child("candidate_2"), second).await.unwrap();

    f.joiner.join(JoinTarget::Session(f.session.clone())).await.unwrap();
    eventually("both candidates added", || f.rtc.added_candidates().len() == 2).await;

    // redelivery of an identical entry under a new key
    f.store.write(&collection.child("candidate_3"), first).await.unwrap();
    settle().await;

    let added: Vec<String> = f
        .rtc
        .added_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(
        added,
        vec![
            "candidate:1 1 udp 2122260223 192.168.0.2 50001 typ host".to_owned(),
            "candidate:2 1 udp 2122260223 192.168.0.2 50002 typ host".to_owned(),
        ]
    );
}

#[tokio::test]
async fn candidates_of_other_epochs_are_ignored() {
    let f = joined().await;
    let collection = f.session.candidates();
    let stale = common::candidate("host", 7);
    let current = common::candidate("host", 8);
    f.store
        .write(
            &collection.child("candidate_x"),
            serde_json::to_value(CandidateEntry::new(&stale, 0, "host-aa")).unwrap(),
        )
        .await
        .unwrap();
    f.store
        .write(
            &collection.child("candidate_y"),
            serde_json::to_value(CandidateEntry::new(&current, 1, "host-aa")).unwrap(),
        )
        .await
        .unwrap();

    eventually("current candidate added", || !f.rtc.added_candidates().is_empty()).await;
    settle().await;
    assert_eq!(f.rtc.added_candidates(), vec![current]);
}

#[tokio::test]
async fn local_candidates_carry_epoch_and_origin() {
    let f = joined().await;
    f.rtc.emit_candidate(1);
    eventually("candidate written", || f.store.get(&f.session.candidates()).is_some()).await;

    let stored = f.store.get(&f.session.candidates()).unwrap();
    let (key, entry) = stored.as_object().unwrap().iter().next().unwrap();
    assert!(key.starts_with("candidate_"));
    assert_eq!(entry["epoch"], json!(1));
    assert!(entry["origin"].as_str().unwrap().starts_with("joiner-"));
    settle().await;
    assert!(f.rtc.added_candidates().is_empty());
}

#[tokio::test]
async fn new_offer_epoch_gets_exactly_one_answer() {
    let f = joined().await;
    let first = answer_of(&f);

    publish_offer(&f, "v=0\r\no=host 2 2 IN IP4 127.0.0.1\r\n", 2).await;
    eventually("second answer", || f.store.writes_to(&f.session.answer()) == 2).await;

    // an offer update within the same epoch is not answered again
    publish_offer(&f, "v=0\r\no=host 2 3 IN IP4 127.0.0.1\r\n", 2).await;
    settle().await;

    assert_eq!(f.store.writes_to(&f.session.answer()), 2);
    let second = answer_of(&f);
    assert_eq!(second.epoch, 2);
    assert_ne!(second.sdp, first.sdp);
    assert_eq!(f.rtc.count(|c| *c == RtcCall::Restart), 1);
}

#[tokio::test]
async fn camera_off_flag_shows_indicator() {
    let f = joined().await;
    let mut events = f.joiner.subscribe();
    assert_eq!(f.joiner.indicators().await.camera_label(), None);

    f.store
        .write(&f.session.field("cameraOff"), json!(1))
        .await
        .unwrap();
    next_matching(&mut events, |e| *e == SessionEvent::RemoteCamera { off: true }).await;
    assert_eq!(f.joiner.indicators().await.camera_label(), Some("Camera Off"));

    f.store.delete(&f.session.field("cameraOff")).await.unwrap();
    next_matching(&mut events, |e| *e == SessionEvent::RemoteCamera { off: false }).await;
    assert!(!f.joiner.indicators().await.camera_off);
}

#[tokio::test]
async fn mic_flag_is_observed() {
    let f = joined().await;
    f.store.write(&f.session.field("micOn"), json!(1)).await.unwrap();
    let mut on = false;
    for _ in 0..100 {
        on = f.joiner.indicators().await.mic_on;
        if on {
            break;
        }
        settle().await;
    }
    assert!(on);
}

#[tokio::test]
async fn video_track_is_bound_to_surface() {
    let f = joined().await;
    f.rtc.emit_track("cam-video", MediaKind::Video);
    f.rtc.emit_track("cam-audio", MediaKind::Audio);
    eventually("video bound", || {
        f.rtc.count(|c| matches!(c, RtcCall::AttachSink(_))) == 1
    })
    .await;
    settle().await;
    assert_eq!(
        f.rtc.count(|c| matches!(c, RtcCall::AttachSink(_))),
        1
    );
    assert!(f.rtc.calls().contains(&RtcCall::AttachSink("cam-video".into())));
}

#[tokio::test]
async fn connection_loss_requests_new_offer() {
    let f = joined().await;
    let mut events = f.joiner.subscribe();
    f.rtc.emit_state(ConnectionState::Connected);
    next_matching(&mut events, |e| *e == SessionEvent::JoinerState(JoinerState::Connected)).await;

    f.rtc.emit_state(ConnectionState::Failed);
    next_matching(&mut events, |e| *e == SessionEvent::Connection(ConnectionStatus::Error)).await;
    eventually("disconnect raised", || {
        f.store.get(&f.session.disconnect()) == Some(json!(1))
    })
    .await;
}

#[tokio::test]
async fn recovered_connection_cancels_grace_period() {
    let f = joined().await;
    f.rtc.emit_state(ConnectionState::Disconnected);
    f.rtc.emit_state(ConnectionState::Connected);
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    assert_eq!(f.store.get(&f.session.disconnect()), None);
}

#[tokio::test]
async fn dispose_clears_transient_fields_only() {
    let f = joined().await;
    f.rtc.emit_candidate(1);
    eventually("candidate written", || f.store.get(&f.session.candidates()).is_some()).await;

    f.joiner.dispose().await;
    let after_first = f.store.operations().len();
    // the new-offer request comes after the stale fields are gone
    assert_eq!(
        f.store.operations().last(),
        Some(&StoreOp::Write {
            path: f.session.disconnect(),
            value: json!(1),
        })
    );
    f.joiner.dispose().await;

    assert_eq!(f.store.get(&f.session.field("someoneWatching")), None);
    assert_eq!(f.store.get(&f.session.disconnect()), Some(json!(1)));
    assert_eq!(f.store.get(&f.session.answer()), None);
    assert_eq!(f.store.get(&f.session.candidates()), None);
    assert_eq!(f.store.get(&f.session.field("sessionName")), Some(json!("Nursery")));
    assert_eq!(f.store.get(&f.session.field("passkey")), Some(json!("AB12cd")));

    assert_eq!(f.store.operations().len(), after_first);
    assert_eq!(f.store.listener_count(), 0);
    assert_eq!(f.rtc.count(|c| *c == RtcCall::Close), 1);
    assert_eq!(f.surface.released.load(Ordering::SeqCst), 1);
    assert_eq!(f.joiner.state().await, JoinerState::Disposed);
}

#[tokio::test]
async fn answered_epoch_is_not_taken_over() {
    let f = joined().await;
    let first = answer_of(&f);

    let (rtc, rtc_events) = FakeRtc::new("second");
    let second = JoinerHandle::spawn(f.store.clone(), rtc.clone(), rtc_events, "v2@home.net", None, test_config());
    let err = assert_err!(second.join(JoinTarget::Session(f.session.clone())).await);
    assert!(matches!(err, SignalingError::InvalidState(_)));
    assert_eq!(second.state().await, JoinerState::Idle);
    assert!(rtc.calls().is_empty());
    assert_eq!(answer_of(&f), first);

    second.dispose().await;
    assert_eq!(f.store.get(&f.session.disconnect()), None);
    assert_eq!(f.store.get(&f.session.field("someoneWatching")), Some(json!(1)));
}

#[tokio::test]
async fn legacy_answer_also_marks_the_offer_taken() {
    let f = fixture().await;
    publish_offer(&f, OFFER_SDP, 3).await;
    f.store.write(&f.session.answer(), json!("v=0 legacy")).await.unwrap();
    assert_err!(f.joiner.join(JoinTarget::Session(f.session.clone())).await);

    // an answer left over from an older epoch does not block
    f.store
        .write(&f.session.answer(), SignalMessage::new("v=0 old", 2).to_value())
        .await
        .unwrap();
    assert_ok!(f.joiner.join(JoinTarget::Session(f.session.clone())).await);
    assert_eq!(answer_of(&f).epoch, 3);
}

#[tokio::test]
async fn leaving_a_removed_session_leaves_no_record() {
    let f = joined().await;
    f.store.delete(&f.session.path()).await.unwrap();
    f.joiner.dispose().await;
    assert_eq!(f.store.get(&f.session.path()), None);
}

#[tokio::test]
async fn discovery_and_passkey_targets() {
    let f = fixture().await;
    publish_offer(&f, OFFER_SDP, 1).await;
    let found = f.joiner.join(JoinTarget::Discover).await.unwrap();
    assert_eq!(found, f.session);
    f.joiner.dispose().await;

    let (rtc, rtc_events) = FakeRtc::new("viewer");
    let viewer = JoinerHandle::spawn(
        f.store.clone(),
        rtc,
        rtc_events,
        "someone.else@mail.com",
        None,
        test_config(),
    );
    // discovery only looks at the viewer's own sessions
    assert!(assert_err!(viewer.join(JoinTarget::Discover).await).is_soft());
    assert!(assert_err!(viewer.join(JoinTarget::Passkey("nope00".into())).await).is_soft());
    let found = viewer.join(JoinTarget::Passkey("AB12cd".into())).await.unwrap();
    assert_eq!(found, f.session);
}
