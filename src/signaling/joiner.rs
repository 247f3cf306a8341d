//! Viewer side: finds a session, answers its offer and renders the remote
//! media. Follows the host through renegotiations by watching `offer`.

use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::events::{ConnectionStatus, EventEmitter, SessionEvent, StatusBadge};
use crate::peer::{ConnectionState, MediaKind, MediaSink, RtcEngine, RtcEvent, SdpKind, WebRtcEngine};
use crate::session::{
    self, flag_is_set, flag_value, SessionRef, SignalMessage, ANSWER, CAMERA_OFF, ICE_CANDIDATES,
    MIC_ON, OFFER, SESSION_ID, SOMEONE_WATCHING,
};
use crate::signaling::candidates::{CandidateConsumer, CandidatePublisher};
use crate::signaling::{release, Reply};
use crate::store::{Change, SignalingStore, StoreEvent, StoreEventSender, SubscriptionId, WatchKind};
use crate::utils::random_token;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinerState {
    Idle,
    FetchingOffer,
    AnswerPublished,
    Connected,
    Disposed,
}

/// Which session to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    Session(SessionRef),
    /// Resolved through `sessionCodes/{passkey}`.
    Passkey(String),
    /// First named session of the joiner's own identity.
    Discover,
}

/// Host media state as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteIndicators {
    pub camera_off: bool,
    pub mic_on: bool,
}

impl RemoteIndicators {
    pub fn camera_label(&self) -> Option<&'static str> {
        self.camera_off.then_some("Camera Off")
    }
}

enum Command {
    Join(JoinTarget, Reply<SessionRef>),
    Indicators(oneshot::Sender<RemoteIndicators>),
    State(oneshot::Sender<JoinerState>),
    Dispose(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct JoinerHandle {
    commands: mpsc::Sender<Command>,
    events: EventEmitter,
}

impl JoinerHandle {
    pub fn spawn(
        store: Arc<dyn SignalingStore>,
        rtc: Arc<dyn RtcEngine>,
        rtc_events: mpsc::UnboundedReceiver<RtcEvent>,
        identity: &str,
        surface: Option<Arc<dyn MediaSink>>,
        config: SignalingConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let events = EventEmitter::new(config.event_buffer);
        let (store_tx, store_rx) = mpsc::unbounded_channel();

        let origin = format!("joiner-{}", random_token());
        let actor = JoinerActor {
            consumer: CandidateConsumer::new(origin.clone(), 0),
            origin,
            store,
            rtc,
            identity: identity.to_owned(),
            surface,
            config,
            events: events.clone(),
            state: JoinerState::Idle,
            session: None,
            publisher: None,
            epoch: 0,
            answered: None,
            rtc_used: false,
            indicators: RemoteIndicators::default(),
            store_tx,
            candidates_sub: None,
            camera_sub: None,
            mic_sub: None,
            offer_sub: None,
            grace_deadline: None,
        };
        tokio::spawn(actor.run(command_rx, store_rx, rtc_events));

        Self { commands, events }
    }

    pub async fn with_webrtc(
        store: Arc<dyn SignalingStore>,
        identity: &str,
        surface: Option<Arc<dyn MediaSink>>,
        config: SignalingConfig,
    ) -> Result<Self, SignalingError> {
        config.validate()?;
        let (rtc, rtc_events) = WebRtcEngine::new(&config).await?;
        Ok(Self::spawn(store, rtc, rtc_events, identity, surface, config))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Answers the current offer of the target session. A missing session or
    /// offer leaves the engine idle; calling again retries.
    pub async fn join(&self, target: JoinTarget) -> Result<SessionRef, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Join(target, tx))
            .await
            .map_err(|_| SignalingError::Disposed)?;
        rx.await.map_err(|_| SignalingError::Disposed)?
    }

    pub async fn indicators(&self) -> RemoteIndicators {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Indicators(tx)).await.is_err() {
            return RemoteIndicators::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn state(&self) -> JoinerState {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::State(tx)).await.is_err() {
            return JoinerState::Disposed;
        }
        rx.await.unwrap_or(JoinerState::Disposed)
    }

    /// Leaves the session and asks the host for a fresh offer. Idempotent.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Dispose(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct JoinerActor {
    store: Arc<dyn SignalingStore>,
    rtc: Arc<dyn RtcEngine>,
    identity: String,
    origin: String,
    surface: Option<Arc<dyn MediaSink>>,
    config: SignalingConfig,
    events: EventEmitter,

    state: JoinerState,
    session: Option<SessionRef>,
    publisher: Option<CandidatePublisher>,
    epoch: u64,
    /// Offer most recently answered.
    answered: Option<SignalMessage>,
    // the peer connection has seen a negotiation and needs a restart first
    rtc_used: bool,
    indicators: RemoteIndicators,
    consumer: CandidateConsumer,

    store_tx: StoreEventSender,
    candidates_sub: Option<SubscriptionId>,
    camera_sub: Option<SubscriptionId>,
    mic_sub: Option<SubscriptionId>,
    offer_sub: Option<SubscriptionId>,

    grace_deadline: Option<Instant>,
}

impl JoinerActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut store_rx: mpsc::UnboundedReceiver<StoreEvent>,
        mut rtc_rx: mpsc::UnboundedReceiver<RtcEvent>,
    ) {
        loop {
            let deadline = self.grace_deadline;
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Join(target, reply)) => {
                            let result = self.join(target).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Indicators(reply)) => {
                            let _ = reply.send(self.indicators);
                        }
                        Some(Command::State(reply)) => {
                            let _ = reply.send(self.state);
                        }
                        Some(Command::Dispose(reply)) => {
                            self.dispose().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            self.dispose().await;
                            break;
                        }
                    }
                }
                Some(event) = store_rx.recv() => self.on_store_event(event).await,
                Some(event) = rtc_rx.recv() => self.on_rtc_event(event).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_grace_expired().await;
                }
            }
        }
        debug!("Joiner task for {} finished", self.identity);
    }

    fn set_state(&mut self, state: JoinerState) {
        if self.state != state {
            debug!("Joiner state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.emit(SessionEvent::JoinerState(state));
        }
    }

    fn watch(
        &self,
        session: &SessionRef,
        key: &str,
        kind: WatchKind,
    ) -> Result<SubscriptionId, SignalingError> {
        Ok(self
            .store
            .subscribe(&session.field(key), kind, self.store_tx.clone())?)
    }

    fn release_all(&mut self) {
        for slot in [
            &mut self.candidates_sub,
            &mut self.camera_sub,
            &mut self.mic_sub,
            &mut self.offer_sub,
        ] {
            release(self.store.as_ref(), slot);
        }
    }

    async fn join(&mut self, target: JoinTarget) -> Result<SessionRef, SignalingError> {
        match self.state {
            JoinerState::Idle => {}
            JoinerState::Disposed => return Err(SignalingError::Disposed),
            other => {
                return Err(SignalingError::InvalidState(format!(
                    "join while {:?}",
                    other
                )))
            }
        }

        self.set_state(JoinerState::FetchingOffer);
        self.events.emit_status(StatusBadge::Connecting);
        match self.try_join(target).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.release_all();
                self.session = None;
                self.publisher = None;
                self.set_state(JoinerState::Idle);
                self.events.emit_error("join", &e);
                Err(e)
            }
        }
    }

    async fn try_join(&mut self, target: JoinTarget) -> Result<SessionRef, SignalingError> {
        let session = self.resolve(target).await?;
        info!("Joining session {}", session.session_id);

        let offer = self
            .store
            .read(&session.offer())
            .await?
            .ok_or_else(|| SignalingError::missing(format!("offer of {}", session.session_id)))?;
        let offer = SignalMessage::decode(OFFER, &offer)?;
        self.ensure_unanswered(&session, &offer).await?;

        self.session = Some(session.clone());
        self.publisher = Some(CandidatePublisher::new(
            Arc::clone(&self.store),
            session.candidates(),
            &self.origin,
        ));
        self.answer(&session, offer).await?;

        self.candidates_sub = Some(self.watch(&session, ICE_CANDIDATES, WatchKind::ChildAdded)?);
        self.store
            .write(&session.field(SOMEONE_WATCHING), flag_value())
            .await?;
        self.camera_sub = Some(self.watch(&session, CAMERA_OFF, WatchKind::Value)?);
        self.mic_sub = Some(self.watch(&session, MIC_ON, WatchKind::Value)?);
        self.offer_sub = Some(self.watch(&session, OFFER, WatchKind::Value)?);
        Ok(session)
    }

    /// Only the first viewer to answer an epoch takes part in it.
    async fn ensure_unanswered(
        &self,
        session: &SessionRef,
        offer: &SignalMessage,
    ) -> Result<(), SignalingError> {
        let Some(existing) = self.store.read(&session.answer()).await? else {
            return Ok(());
        };
        match SignalMessage::decode(ANSWER, &existing) {
            Ok(answer) if answer.epoch == offer.epoch || answer.epoch == 0 => {
                Err(SignalingError::InvalidState(format!(
                    "{} already answered for epoch {}",
                    session.session_id, offer.epoch
                )))
            }
            Ok(answer) => {
                debug!("Stale answer of epoch {} will be replaced", answer.epoch);
                Ok(())
            }
            Err(e) => {
                warn!("Unreadable answer will be replaced: {}", e);
                Ok(())
            }
        }
    }

    async fn resolve(&self, target: JoinTarget) -> Result<SessionRef, SignalingError> {
        match target {
            JoinTarget::Session(session) => Ok(session),
            JoinTarget::Passkey(passkey) => {
                session::find_session_by_passkey(self.store.as_ref(), &passkey)
                    .await?
                    .ok_or_else(|| {
                        SignalingError::missing(format!("session for passkey {}", passkey))
                    })
            }
            JoinTarget::Discover => {
                if self.identity.is_empty() {
                    return Err(SignalingError::missing("identity"));
                }
                session::discover_session(self.store.as_ref(), &self.identity)
                    .await?
                    .ok_or_else(|| SignalingError::missing("named session"))
            }
        }
    }

    /// Applies `offer` and publishes exactly one answer for it.
    async fn answer(
        &mut self,
        session: &SessionRef,
        offer: SignalMessage,
    ) -> Result<(), SignalingError> {
        if self.rtc_used {
            self.rtc.restart().await?;
        }
        self.rtc_used = true;

        self.rtc
            .set_remote_description(SdpKind::Offer, &offer.sdp)
            .await?;
        let sdp = self
            .rtc
            .create_answer(&self.config.answer_constraints)
            .await?;
        self.rtc.set_local_description(SdpKind::Answer, &sdp).await?;

        self.epoch = offer.epoch;
        self.consumer.reset(offer.epoch);
        self.store
            .write(&session.answer(), SignalMessage::new(sdp, offer.epoch).to_value())
            .await?;
        info!("Answer published for {} (epoch {})", session.session_id, offer.epoch);
        self.answered = Some(offer);
        self.set_state(JoinerState::AnswerPublished);
        Ok(())
    }

    fn is_new_offer(&self, offer: &SignalMessage) -> bool {
        match &self.answered {
            None => true,
            Some(answered) if offer.epoch == 0 && answered.epoch == 0 => offer.sdp != answered.sdp,
            Some(answered) => offer.epoch > answered.epoch,
        }
    }

    async fn on_store_event(&mut self, event: StoreEvent) {
        let id = Some(event.subscription);
        if id == self.candidates_sub {
            match event.change {
                Change::ChildAdded { key, value } => {
                    if let Some(candidate) = self.consumer.accept(&key, &value) {
                        if let Err(e) = self.rtc.add_ice_candidate(&candidate).await {
                            debug!("Remote candidate not added (non-fatal): {}", e);
                        }
                    }
                }
                Change::ChildRemoved { key } => self.consumer.forget(&key),
                Change::Value(_) => {}
            }
        } else if id == self.camera_sub {
            if let Change::Value(value) = event.change {
                let off = flag_is_set(value.as_ref());
                self.indicators.camera_off = off;
                self.events.emit(SessionEvent::RemoteCamera { off });
            }
        } else if id == self.mic_sub {
            if let Change::Value(value) = event.change {
                let on = flag_is_set(value.as_ref());
                self.indicators.mic_on = on;
                self.events.emit(SessionEvent::RemoteMic { on });
            }
        } else if id == self.offer_sub {
            if let Change::Value(Some(value)) = event.change {
                self.on_offer_changed(value).await;
            }
        } else {
            debug!("Dropping event of released listener {:?}", event.subscription);
        }
    }

    async fn on_offer_changed(&mut self, value: Value) {
        let offer = match SignalMessage::decode(OFFER, &value) {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Ignoring offer update: {}", e);
                return;
            }
        };
        if !self.is_new_offer(&offer) {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        info!("Host renegotiated {} (epoch {})", session.session_id, offer.epoch);
        self.grace_deadline = None;
        if let Err(e) = self.answer(&session, offer).await {
            self.events.emit_error("answer renegotiated offer", &e);
        }
    }

    async fn on_rtc_event(&mut self, event: RtcEvent) {
        match event {
            RtcEvent::LocalCandidate { candidate, generation } => {
                if generation != self.rtc.generation() {
                    debug!("Candidate of a replaced peer connection dropped");
                    return;
                }
                let epoch = self.epoch;
                let Some(publisher) = self.publisher.as_mut() else {
                    debug!("Local candidate without a session dropped");
                    return;
                };
                if let Err(e) = publisher.publish(&candidate, epoch).await {
                    warn!("Failed to publish local candidate: {}", e);
                }
            }
            RtcEvent::GatheringComplete => debug!("Joiner candidate gathering complete"),
            RtcEvent::ConnectionStateChanged(state) => self.on_connection_state(state),
            RtcEvent::RemoteTrack(track) => {
                match track.kind {
                    MediaKind::Video => {
                        if let Some(surface) = &self.surface {
                            if let Err(e) = self
                                .rtc
                                .attach_remote_sink(&track.id, Arc::clone(surface))
                                .await
                            {
                                warn!("Failed to bind video track {}: {}", track.id, e);
                            }
                        }
                    }
                    // rendered natively
                    MediaKind::Audio => debug!("Remote audio track {} enabled", track.id),
                }
                self.events.emit(SessionEvent::RemoteTrack(track));
            }
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.grace_deadline = None;
                self.set_state(JoinerState::Connected);
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

    async fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        let Some(session) = self.session.clone() else {
            return;
        };
        warn!(
            "Connection to {} lost for {:?}, asking host for a new offer",
            session.session_id,
            self.config.grace_period()
        );
        self.events.emit_connection(ConnectionStatus::Error);
        if let Err(e) = self.store.write(&session.disconnect(), flag_value()).await {
            self.events.emit_error("request renegotiation", &e.into());
        }
    }

    async fn dispose(&mut self) {
        if self.state == JoinerState::Disposed {
            return;
        }
        self.release_all();
        self.grace_deadline = None;

        if let Some(session) = self.session.take() {
            let store = self.store.as_ref();
            let mut steps = vec![
                store.delete(&session.field(SOMEONE_WATCHING)).await,
                store.delete(&session.answer()).await,
                store.delete(&session.candidates()).await,
            ];
            // a host that already left has removed the record
            match store.read(&session.field(SESSION_ID)).await {
                Ok(Some(_)) => steps.push(store.write(&session.disconnect(), flag_value()).await),
                Ok(None) => debug!("Session {} is gone, no new offer requested", session.session_id),
                Err(e) => steps.push(Err(e)),
            }
            for result in steps {
                if let Err(e) = result {
                    warn!("Cleanup of {} incomplete: {}", session.session_id, e);
                }
            }
        }
        self.publisher = None;

        self.rtc.close().await;
        if let Some(surface) = self.surface.take() {
            surface.release();
        }
        self.set_state(JoinerState::Disposed);
        self.events.emit(SessionEvent::Disposed);
        info!("Joiner disposed");
    }
}
