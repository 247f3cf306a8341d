//! Host side: owns the camera, publishes offers and consumes the answer.
//!
//! All state lives in one task. [`HostHandle`] talks to it over a command
//! channel; store listener deliveries and peer-connection events are
//! multiplexed into the same loop.

use crate::config::SignalingConfig;
use crate::error::{RtcError, SignalingError};
use crate::events::{ConnectionStatus, EventEmitter, SessionEvent, StatusBadge};
use crate::peer::{
    CaptureOptions, ConnectionState, IceCandidate, MediaConstraints, RtcEngine, RtcEvent, SdpKind,
    WebRtcEngine,
};
use crate::session::{
    self, flag_is_set, flag_value, SessionRef, SignalMessage, ANSWER, CAMERA_OFF,
    DETECTION_EVENTS, MIC_ON, OFFER, SOMEONE_WATCHING,
};
use crate::signaling::candidates::{CandidateConsumer, CandidatePublisher};
use crate::signaling::{release, Reply};
use crate::store::{Change, SignalingStore, StoreEvent, StoreEventSender, SubscriptionId, WatchKind};
use crate::utils::{now_millis, random_token};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Idle,
    MediaReady,
    OfferPublished,
    AwaitingAnswer,
    Connected,
    Renegotiating,
    Disposed,
}

/// Side call made for every reported detection, e.g. to persist the
/// recent-frames buffer.
pub trait ReplayHook: Send + Sync {
    fn on_detection(&self, kind: &str, timestamp: i64);
}

enum Command {
    StartCamera(CaptureOptions, Reply<()>),
    CreateOffer(Reply<bool>),
    SetCameraOff(Option<bool>, Reply<bool>),
    SetMic(Option<bool>, Reply<bool>),
    SwitchCamera(Reply<()>),
    Rename(String, Reply<()>),
    ReportDetection {
        kind: String,
        data: Value,
        reply: Reply<i64>,
    },
    State(oneshot::Sender<HostState>),
    Dispose(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::Sender<Command>,
    events: EventEmitter,
    session: SessionRef,
}

impl HostHandle {
    pub fn spawn(
        store: Arc<dyn SignalingStore>,
        rtc: Arc<dyn RtcEngine>,
        rtc_events: mpsc::UnboundedReceiver<RtcEvent>,
        session: SessionRef,
        config: SignalingConfig,
        hook: Option<Arc<dyn ReplayHook>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let events = EventEmitter::new(config.event_buffer);
        let (store_tx, store_rx) = mpsc::unbounded_channel();

        let origin = format!("host-{}", random_token());
        let actor = HostActor {
            publisher: CandidatePublisher::new(Arc::clone(&store), session.candidates(), &origin),
            consumer: CandidateConsumer::new(origin, 0),
            store,
            rtc,
            session: session.clone(),
            config,
            events: events.clone(),
            hook,
            state: HostState::Idle,
            epoch: 0,
            offer_live: false,
            remote_applied: false,
            pending_remote: Vec::new(),
            capture: None,
            camera_off: false,
            mic_on: false,
            store_tx,
            answer_sub: None,
            candidates_sub: None,
            disconnect_sub: None,
            watching_sub: None,
            grace_deadline: None,
        };
        tokio::spawn(actor.run(command_rx, store_rx, rtc_events));

        Self {
            commands,
            events,
            session,
        }
    }

    /// Builds a `webrtc` backed engine for `session`. Failing to create the
    /// native peer connection fails construction.
    pub async fn with_webrtc(
        store: Arc<dyn SignalingStore>,
        session: SessionRef,
        config: SignalingConfig,
        hook: Option<Arc<dyn ReplayHook>>,
    ) -> Result<Self, SignalingError> {
        config.validate()?;
        let (rtc, rtc_events) = WebRtcEngine::new(&config).await?;
        Ok(Self::spawn(store, rtc, rtc_events, session, config, hook))
    }

    pub fn session(&self) -> &SessionRef {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SignalingError::Disposed)?;
        rx.await.map_err(|_| SignalingError::Disposed)?
    }

    pub async fn start_camera(&self, options: CaptureOptions) -> Result<(), SignalingError> {
        self.request(|reply| Command::StartCamera(options, reply)).await
    }

    /// Publishes an offer for a new epoch. Returns `false` when an offer of the
    /// current epoch is already live and nothing was written.
    pub async fn create_offer(&self) -> Result<bool, SignalingError> {
        self.request(Command::CreateOffer).await
    }

    /// Returns the new camera-off state.
    pub async fn toggle_camera_off(&self) -> Result<bool, SignalingError> {
        self.request(|reply| Command::SetCameraOff(None, reply)).await
    }

    pub async fn set_camera_off(&self, off: bool) -> Result<bool, SignalingError> {
        self.request(|reply| Command::SetCameraOff(Some(off), reply)).await
    }

    /// Returns the new mic-on state.
    pub async fn toggle_mic(&self) -> Result<bool, SignalingError> {
        self.request(|reply| Command::SetMic(None, reply)).await
    }

    pub async fn set_mic_on(&self, on: bool) -> Result<bool, SignalingError> {
        self.request(|reply| Command::SetMic(Some(on), reply)).await
    }

    pub async fn switch_camera(&self) -> Result<(), SignalingError> {
        self.request(Command::SwitchCamera).await
    }

    pub async fn rename_session(&self, name: &str) -> Result<(), SignalingError> {
        let name = name.to_owned();
        self.request(|reply| Command::Rename(name, reply)).await
    }

    /// Records a detection under the session and calls the replay hook.
    /// Returns the timestamp key it was stored under.
    pub async fn report_detection(&self, kind: &str, data: Value) -> Result<i64, SignalingError> {
        let kind = kind.to_owned();
        self.request(|reply| Command::ReportDetection { kind, data, reply })
            .await
    }

    pub async fn state(&self) -> HostState {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::State(tx)).await.is_err() {
            return HostState::Disposed;
        }
        rx.await.unwrap_or(HostState::Disposed)
    }

    /// Tears the session down. Safe to call any number of times.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Dispose(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct HostActor {
    store: Arc<dyn SignalingStore>,
    rtc: Arc<dyn RtcEngine>,
    session: SessionRef,
    config: SignalingConfig,
    events: EventEmitter,
    hook: Option<Arc<dyn ReplayHook>>,

    state: HostState,
    epoch: u64,
    offer_live: bool,
    remote_applied: bool,
    // remote candidates that arrived before the answer was applied
    pending_remote: Vec<IceCandidate>,
    capture: Option<CaptureOptions>,
    camera_off: bool,
    mic_on: bool,

    publisher: CandidatePublisher,
    consumer: CandidateConsumer,

    store_tx: StoreEventSender,
    answer_sub: Option<SubscriptionId>,
    candidates_sub: Option<SubscriptionId>,
    disconnect_sub: Option<SubscriptionId>,
    watching_sub: Option<SubscriptionId>,

    grace_deadline: Option<Instant>,
}

impl HostActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut store_rx: mpsc::UnboundedReceiver<StoreEvent>,
        mut rtc_rx: mpsc::UnboundedReceiver<RtcEvent>,
    ) {
        match self.watch(SOMEONE_WATCHING, WatchKind::Value) {
            Ok(id) => self.watching_sub = Some(id),
            Err(e) => self.events.emit_error("presence listener", &e),
        }

        loop {
            let deadline = self.grace_deadline;
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("All host handles dropped, disposing {}", self.session.session_id);
                        self.dispose().await;
                        break;
                    };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(event) = store_rx.recv() => self.on_store_event(event).await,
                Some(event) = rtc_rx.recv() => self.on_rtc_event(event).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_grace_expired();
                }
            }
        }
        debug!("Host task for {} finished", self.session.session_id);
    }

    /// Returns false once the engine has been disposed.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::StartCamera(options, reply) => {
                let result = self.start_camera(options).await;
                self.report("start camera", &result);
                let _ = reply.send(result);
            }
            Command::CreateOffer(reply) => {
                let result = self.create_offer().await;
                self.report("create offer", &result);
                let _ = reply.send(result);
            }
            Command::SetCameraOff(off, reply) => {
                let off = off.unwrap_or(!self.camera_off);
                let result = self.set_camera_off(off).await;
                self.report("camera toggle", &result);
                let _ = reply.send(result);
            }
            Command::SetMic(on, reply) => {
                let on = on.unwrap_or(!self.mic_on);
                let result = self.set_mic_on(on).await;
                self.report("mic toggle", &result);
                let _ = reply.send(result);
            }
            Command::SwitchCamera(reply) => {
                let result = self.switch_camera().await;
                self.report("switch camera", &result);
                let _ = reply.send(result);
            }
            Command::Rename(name, reply) => {
                let result =
                    session::rename_session(self.store.as_ref(), &self.session, &name).await;
                self.report("rename session", &result);
                let _ = reply.send(result);
            }
            Command::ReportDetection { kind, data, reply } => {
                let result = self.report_detection(&kind, data).await;
                self.report("detection", &result);
                let _ = reply.send(result);
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Dispose(reply) => {
                self.dispose().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn report<T>(&self, context: &str, result: &Result<T, SignalingError>) {
        if let Err(e) = result {
            self.events.emit_error(context, e);
        }
    }

    fn set_state(&mut self, state: HostState) {
        if self.state != state {
            debug!("Host {} state {:?} -> {:?}", self.session.session_id, self.state, state);
            self.state = state;
            self.events.emit(SessionEvent::HostState(state));
        }
    }

    fn watch(&self, key: &str, kind: WatchKind) -> Result<SubscriptionId, SignalingError> {
        let path = self.session.field(key);
        Ok(self.store.subscribe(&path, kind, self.store_tx.clone())?)
    }

    async fn start_camera(&mut self, options: CaptureOptions) -> Result<(), SignalingError> {
        match self.state {
            HostState::Disposed => return Err(SignalingError::Disposed),
            HostState::Idle => {}
            _ => {
                debug!("Camera already started");
                return Ok(());
            }
        }

        self.rtc.start_capture(&options).await?;
        self.mic_on = options.audio;
        if options.audio {
            self.store
                .write(&self.session.field(MIC_ON), flag_value())
                .await?;
        }
        self.capture = Some(options);
        self.set_state(HostState::MediaReady);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<bool, SignalingError> {
        match self.state {
            HostState::Disposed => return Err(SignalingError::Disposed),
            HostState::Idle => {
                return Err(SignalingError::InvalidState(
                    "camera must be started before creating an offer".into(),
                ))
            }
            _ => {}
        }
        if self.offer_live {
            debug!("Offer for epoch {} already live", self.epoch);
            return Ok(false);
        }
        let retrying = self.state == HostState::Renegotiating;
        if retrying {
            self.rtc.restart().await?;
        }
        self.publish_offer().await?;
        if retrying {
            self.store.delete(&self.session.disconnect()).await?;
        }
        Ok(true)
    }

    async fn publish_offer(&mut self) -> Result<(), SignalingError> {
        let previous = match self.store.read(&self.session.offer()).await? {
            Some(value) => SignalMessage::decode(OFFER, &value)
                .map(|m| m.epoch)
                .unwrap_or(0),
            None => 0,
        };
        let epoch = previous.max(self.epoch) + 1;

        // answer and candidates of earlier epochs must not leak into this one
        self.store.delete(&self.session.answer()).await?;
        self.store.delete(&self.session.candidates()).await?;
        if self.disconnect_sub.is_none() {
            self.store.delete(&self.session.disconnect()).await?;
        }

        let sdp = self.rtc.create_offer(&MediaConstraints::default()).await?;
        self.rtc.set_local_description(SdpKind::Offer, &sdp).await?;

        self.epoch = epoch;
        self.consumer.reset(epoch);
        self.remote_applied = false;
        self.pending_remote.clear();

        self.store
            .write(&self.session.offer(), SignalMessage::new(sdp, epoch).to_value())
            .await?;
        self.offer_live = true;
        self.set_state(HostState::OfferPublished);
        info!("Published offer for {} (epoch {})", self.session.session_id, epoch);

        self.answer_sub = Some(self.watch(ANSWER, WatchKind::Value)?);
        self.candidates_sub = Some(self.watch(session::ICE_CANDIDATES, WatchKind::ChildAdded)?);
        if self.disconnect_sub.is_none() {
            self.disconnect_sub = Some(self.watch(session::DISCONNECT, WatchKind::Value)?);
        }
        self.set_state(HostState::AwaitingAnswer);
        self.events.emit_status(StatusBadge::Connecting);
        Ok(())
    }

    async fn renegotiate(&mut self) -> Result<(), SignalingError> {
        info!("Disconnect requested for {}, renegotiating", self.session.session_id);
        self.set_state(HostState::Renegotiating);
        self.events.emit(SessionEvent::Connection(ConnectionStatus::Disconnected));

        release(self.store.as_ref(), &mut self.answer_sub);
        release(self.store.as_ref(), &mut self.candidates_sub);
        self.offer_live = false;
        self.grace_deadline = None;

        self.rtc.restart().await?;
        self.publish_offer().await?;
        // acknowledge
        self.store.delete(&self.session.disconnect()).await?;
        Ok(())
    }

    async fn set_camera_off(&mut self, off: bool) -> Result<bool, SignalingError> {
        if self.state == HostState::Disposed {
            return Err(SignalingError::Disposed);
        }
        self.rtc.set_video_enabled(!off);
        let path = self.session.field(CAMERA_OFF);
        if off {
            self.store.write(&path, flag_value()).await?;
        } else {
            self.store.delete(&path).await?;
        }
        self.camera_off = off;
        self.events.emit(SessionEvent::CameraToggled { off });
        Ok(off)
    }

    async fn set_mic_on(&mut self, on: bool) -> Result<bool, SignalingError> {
        if self.state == HostState::Disposed {
            return Err(SignalingError::Disposed);
        }
        self.rtc.set_audio_enabled(on);
        let path = self.session.field(MIC_ON);
        if on {
            self.store.write(&path, flag_value()).await?;
        } else {
            self.store.delete(&path).await?;
        }
        self.mic_on = on;
        self.events.emit(SessionEvent::MicToggled { on });
        Ok(on)
    }

    async fn switch_camera(&mut self) -> Result<(), SignalingError> {
        let Some(capture) = self.capture.as_mut() else {
            return Err(RtcError::NoLocalMedia.into());
        };
        self.rtc.switch_camera().await?;
        capture.front_facing = !capture.front_facing;
        debug!("Switched to {} camera", if capture.front_facing { "front" } else { "back" });
        Ok(())
    }

    async fn report_detection(&mut self, kind: &str, data: Value) -> Result<i64, SignalingError> {
        if self.state == HostState::Disposed {
            return Err(SignalingError::Disposed);
        }
        let timestamp = now_millis();
        if let Some(hook) = &self.hook {
            hook.on_detection(kind, timestamp);
        }
        let path = self
            .session
            .field(DETECTION_EVENTS)
            .child(timestamp.to_string());
        self.store
            .write(&path, json!({ "type": kind, "timestamp": timestamp, "data": data.clone() }))
            .await?;
        self.events.emit(SessionEvent::Detection {
            kind: kind.to_owned(),
            timestamp,
            data,
        });
        Ok(timestamp)
    }

    async fn on_store_event(&mut self, event: StoreEvent) {
        let id = Some(event.subscription);
        if id == self.answer_sub {
            if let Change::Value(Some(value)) = event.change {
                self.on_answer(value).await;
            }
        } else if id == self.candidates_sub {
            match event.change {
                Change::ChildAdded { key, value } => {
                    if let Some(candidate) = self.consumer.accept(&key, &value) {
                        if self.remote_applied {
                            self.apply_remote_candidate(&candidate).await;
                        } else {
                            self.pending_remote.push(candidate);
                        }
                    }
                }
                Change::ChildRemoved { key } => self.consumer.forget(&key),
                Change::Value(_) => {}
            }
        } else if id == self.disconnect_sub {
            if let Change::Value(value) = event.change {
                if flag_is_set(value.as_ref()) {
                    self.on_disconnect_requested().await;
                }
            }
        } else if id == self.watching_sub {
            if let Change::Value(value) = event.change {
                let watching = flag_is_set(value.as_ref());
                self.events.emit(SessionEvent::ViewerPresence { watching });
            }
        } else {
            // queued before its listener was released
            debug!("Dropping event of released listener {:?}", event.subscription);
        }
    }

    async fn on_answer(&mut self, value: Value) {
        let answer = match SignalMessage::decode(ANSWER, &value) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Ignoring answer: {}", e);
                return;
            }
        };
        // epoch 0 comes from clients that do not tag their answers
        if answer.epoch != self.epoch && answer.epoch != 0 {
            debug!("Ignoring answer for epoch {} (current {})", answer.epoch, self.epoch);
            return;
        }

        // one answer per epoch
        release(self.store.as_ref(), &mut self.answer_sub);

        if let Err(e) = self
            .rtc
            .set_remote_description(SdpKind::Answer, &answer.sdp)
            .await
        {
            self.events.emit_error("apply answer", &e.into());
            return;
        }
        self.remote_applied = true;
        info!("Answer applied for {} (epoch {})", self.session.session_id, self.epoch);
        self.set_state(HostState::Connected);

        for candidate in std::mem::take(&mut self.pending_remote) {
            self.apply_remote_candidate(&candidate).await;
        }
    }

    async fn apply_remote_candidate(&self, candidate: &IceCandidate) {
        if let Err(e) = self.rtc.add_ice_candidate(candidate).await {
            debug!("Remote candidate not added (non-fatal): {}", e);
        }
    }

    async fn on_disconnect_requested(&mut self) {
        if !self.offer_live && self.state != HostState::Renegotiating {
            // nothing negotiated yet; just acknowledge
            if let Err(e) = self.store.delete(&self.session.disconnect()).await {
                warn!("Failed to clear disconnect flag: {}", e);
            }
            return;
        }
        if let Err(e) = self.renegotiate().await {
            self.events.emit_error("renegotiate", &e);
        }
    }

    async fn on_rtc_event(&mut self, event: RtcEvent) {
        match event {
            RtcEvent::LocalCandidate { candidate, generation } => {
                if generation != self.rtc.generation() {
                    debug!("Candidate of a replaced peer connection dropped");
                    return;
                }
                if self.state == HostState::Disposed || !self.offer_live {
                    debug!("Local candidate before offer publication dropped");
                    return;
                }
                if let Err(e) = self.publisher.publish(&candidate, self.epoch).await {
                    warn!("Failed to publish local candidate: {}", e);
                }
            }
            RtcEvent::GatheringComplete => debug!("Host candidate gathering complete"),
            RtcEvent::ConnectionStateChanged(state) => self.on_connection_state(state),
            RtcEvent::RemoteTrack(track) => {
                debug!("Host ignores remote {:?} track {}", track.kind, track.id);
            }
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.grace_deadline = None;
                self.events.emit_connection(ConnectionStatus::Connected);
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                if self.grace_deadline.is_none() {
                    self.grace_deadline = Some(Instant::now() + self.config.grace_period());
                    self.events.emit_connection(ConnectionStatus::Disconnected);
                }
            }
            _ => {}
        }
    }

    fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        warn!(
            "Peer connection for {} not recovered within {:?}",
            self.session.session_id,
            self.config.grace_period()
        );
        // the viewer raises `disconnect`; wait for it
        self.events.emit_connection(ConnectionStatus::Error);
    }

    async fn dispose(&mut self) {
        if self.state == HostState::Disposed {
            return;
        }
        for slot in [
            &mut self.answer_sub,
            &mut self.candidates_sub,
            &mut self.disconnect_sub,
            &mut self.watching_sub,
        ] {
            release(self.store.as_ref(), slot);
        }
        self.grace_deadline = None;
        self.offer_live = false;

        if let Err(e) = self.rtc.stop_capture().await {
            warn!("Stopping capture failed: {}", e);
        }
        self.rtc.close().await;

        if let Err(e) = session::delete_session(self.store.as_ref(), &self.session).await {
            warn!("Failed to delete session {}: {}", self.session.session_id, e);
        }
        self.set_state(HostState::Disposed);
        self.events.emit(SessionEvent::Disposed);
        info!("Host for {} disposed", self.session.session_id);
    }
}
