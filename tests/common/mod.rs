#![allow(dead_code)]

use async_trait::async_trait;
use heliocam_signaling::config::SignalingConfig;
use heliocam_signaling::error::RtcError;
use heliocam_signaling::events::SessionEvent;
use heliocam_signaling::peer::{
    CaptureOptions, ConnectionState, IceCandidate, MediaConstraints, MediaKind, MediaSink,
    RemoteTrackInfo, RtcEngine, RtcEvent, SdpKind,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, PartialEq)]
pub enum RtcCall {
    StartCapture,
    StopCapture,
    SwitchCamera,
    CreateOffer,
    CreateAnswer(MediaConstraints),
    SetLocal(SdpKind, String),
    SetRemote(SdpKind, String),
    AddCandidate(IceCandidate),
    AttachSink(String),
    VideoEnabled(bool),
    AudioEnabled(bool),
    Restart,
    Close,
}

/// Scripted peer connection: records every call and lets tests inject events.
pub struct FakeRtc {
    label: &'static str,
    calls: Mutex<Vec<RtcCall>>,
    counter: AtomicUsize,
    generation: AtomicU64,
    applied: Mutex<HashSet<IceCandidate>>,
    fail_remote: AtomicBool,
    events: mpsc::UnboundedSender<RtcEvent>,
}

impl FakeRtc {
    pub fn new(label: &'static str) -> (Arc<Self>, mpsc::UnboundedReceiver<RtcEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let rtc = Arc::new(Self {
            label,
            calls: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            applied: Mutex::new(HashSet::new()),
            fail_remote: AtomicBool::new(false),
            events,
        });
        (rtc, rx)
    }

    pub fn calls(&self) -> Vec<RtcCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&RtcCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn remote_descriptions(&self, kind: SdpKind) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RtcCall::SetRemote(k, sdp) if k == kind => Some(sdp),
                _ => None,
            })
            .collect()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RtcCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn emit(&self, event: RtcEvent) {
        self.events.send(event).unwrap();
    }

    pub fn emit_candidate(&self, n: u8) {
        self.emit(RtcEvent::LocalCandidate {
            candidate: candidate(self.label, n),
            generation: self.generation(),
        });
    }

    /// A candidate gathered by the peer connection in use before the last restart.
    pub fn emit_replaced_candidate(&self, n: u8) {
        self.emit(RtcEvent::LocalCandidate {
            candidate: candidate(self.label, n),
            generation: self.generation().wrapping_sub(1),
        });
    }

    pub fn emit_state(&self, state: ConnectionState) {
        self.emit(RtcEvent::ConnectionStateChanged(state));
    }

    pub fn emit_track(&self, id: &str, kind: MediaKind) {
        self.emit(RtcEvent::RemoteTrack(RemoteTrackInfo {
            id: id.to_owned(),
            kind,
        }));
    }

    fn record(&self, call: RtcCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_sdp(&self, kind: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!(
            "v=0\r\no={} {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na={}\r\n",
            self.label, n, n, kind
        )
    }
}

pub fn candidate(label: &str, n: u8) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{label}{n} 1 udp 2122260223 10.0.0.{n} 5{n:04} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

#[async_trait]
impl RtcEngine for FakeRtc {
    async fn start_capture(&self, _options: &CaptureOptions) -> Result<(), RtcError> {
        self.record(RtcCall::StartCapture);
        Ok(())
    }

    async fn stop_capture(&self) -> Result<(), RtcError> {
        self.record(RtcCall::StopCapture);
        Ok(())
    }

    async fn switch_camera(&self) -> Result<(), RtcError> {
        self.record(RtcCall::SwitchCamera);
        Ok(())
    }

    async fn create_offer(&self, _constraints: &MediaConstraints) -> Result<String, RtcError> {
        self.record(RtcCall::CreateOffer);
        Ok(self.next_sdp("offer"))
    }

    async fn create_answer(&self, constraints: &MediaConstraints) -> Result<String, RtcError> {
        self.record(RtcCall::CreateAnswer(*constraints));
        Ok(self.next_sdp("answer"))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError> {
        self.record(RtcCall::SetLocal(kind, sdp.to_owned()));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError> {
        self.record(RtcCall::SetRemote(kind, sdp.to_owned()));
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(RtcError::Sdp("rejected by test".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        self.record(RtcCall::AddCandidate(candidate.clone()));
        if !self.applied.lock().unwrap().insert(candidate.clone()) {
            return Err(RtcError::Other("duplicate candidate".into()));
        }
        Ok(())
    }

    async fn attach_remote_sink(
        &self,
        track_id: &str,
        _sink: Arc<dyn MediaSink>,
    ) -> Result<(), RtcError> {
        self.record(RtcCall::AttachSink(track_id.to_owned()));
        Ok(())
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.record(RtcCall::VideoEnabled(enabled));
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.record(RtcCall::AudioEnabled(enabled));
    }

    async fn restart(&self) -> Result<(), RtcError> {
        self.record(RtcCall::Restart);
        self.applied.lock().unwrap().clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.record(RtcCall::Close);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct Surface {
    pub released: AtomicUsize,
}

impl MediaSink for Surface {
    fn on_media(&self, _kind: MediaKind, _payload: &[u8]) {}

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_config() -> SignalingConfig {
    heliocam_signaling::logger::init();
    SignalingConfig {
        grace_period_ms: 100,
        ..SignalingConfig::default()
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Lets queued store and peer events drain through the engine tasks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Waits for the first event matching `pred`.
pub async fn next_matching(
    rx: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no matching event")
}
