use crate::config::SignalingConfig;
use crate::error::RtcError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::types::{
    CaptureOptions, ConnectionState, IceCandidate, MediaConstraints, MediaKind, RemoteTrackInfo,
    RtcEvent, SdpKind, ServerConfig,
};
use crate::peer::{MediaSink, RtcEngine};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "heliocam";

type SinkMap = Arc<Mutex<HashMap<String, Arc<dyn MediaSink>>>>;

/// Local sample tracks fed by the capture pipeline. Samples written while the
/// corresponding medium is disabled are dropped.
#[derive(Clone)]
pub struct LocalTracks {
    video: Arc<TrackLocalStaticSample>,
    audio: Option<Arc<TrackLocalStaticSample>>,
    video_enabled: Arc<AtomicBool>,
    audio_enabled: Arc<AtomicBool>,
}

impl LocalTracks {
    pub async fn write_video(&self, frame: Bytes, duration: Duration) -> Result<(), RtcError> {
        if !self.video_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let sample = Sample {
            data: frame,
            duration,
            ..Default::default()
        };
        self.video.write_sample(&sample).await?;
        Ok(())
    }

    pub async fn write_audio(&self, packet: Bytes, duration: Duration) -> Result<(), RtcError> {
        let Some(audio) = &self.audio else {
            return Err(RtcError::NoLocalMedia);
        };
        if !self.audio_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let sample = Sample {
            data: packet,
            duration,
            ..Default::default()
        };
        audio.write_sample(&sample).await?;
        Ok(())
    }

    fn all(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        let mut tracks = vec![Arc::clone(&self.video)];
        if let Some(audio) = &self.audio {
            tracks.push(Arc::clone(audio));
        }
        tracks
    }
}

/// [`RtcEngine`] backed by the `webrtc` crate.
pub struct WebRtcEngine {
    api: API,
    rtc_config: RTCConfiguration,
    pc: tokio::sync::Mutex<Option<Arc<RTCPeerConnection>>>,
    local: tokio::sync::Mutex<Option<LocalTracks>>,
    sinks: SinkMap,
    video_enabled: Arc<AtomicBool>,
    audio_enabled: Arc<AtomicBool>,
    // callbacks of a replaced peer connection check this and go quiet
    generation: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<RtcEvent>,
}

impl WebRtcEngine {
    /// Builds the engine and its first peer connection. Failure here is fatal
    /// for the caller; there is no degraded mode.
    pub async fn new(
        config: &SignalingConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RtcEvent>), RtcError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            api,
            rtc_config: rtc_config(&config.ice_servers),
            pc: tokio::sync::Mutex::new(None),
            local: tokio::sync::Mutex::new(None),
            sinks: Arc::new(Mutex::new(HashMap::new())),
            video_enabled: Arc::new(AtomicBool::new(true)),
            audio_enabled: Arc::new(AtomicBool::new(true)),
            generation: Arc::new(AtomicU64::new(0)),
            events,
        });

        let pc = engine.new_peer().await?;
        *engine.pc.lock().await = Some(pc);
        Ok((engine, rx))
    }

    /// Handle for the capture pipeline, once capture has started.
    pub async fn local_tracks(&self) -> Option<LocalTracks> {
        self.local.lock().await.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match self.pc.lock().await.as_ref() {
            Some(pc) => pc.connection_state().into(),
            None => ConnectionState::Closed,
        }
    }

    async fn current(&self) -> Result<Arc<RTCPeerConnection>, RtcError> {
        self.pc.lock().await.clone().ok_or(RtcError::Closed)
    }

    async fn new_peer(&self) -> Result<Arc<RTCPeerConnection>, RtcError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);

        let events = self.events.clone();
        let live = Arc::clone(&self.generation);
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            if live.load(Ordering::SeqCst) == generation {
                match cand {
                    Some(c) => {
                        dump_candidate("LOCAL", &c);
                        match c.to_json() {
                            Ok(init) => {
                                let _ = events.send(RtcEvent::LocalCandidate {
                                    candidate: init.into(),
                                    generation,
                                });
                            }
                            Err(e) => warn!("Failed to serialize local candidate: {}", e),
                        }
                    }
                    // None marks the end of gathering
                    None => {
                        debug!("ICE candidate gathering completed");
                        let _ = events.send(RtcEvent::GatheringComplete);
                    }
                }
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let live = Arc::clone(&self.generation);
        let weak_pc = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            if live.load(Ordering::SeqCst) == generation {
                info!("Peer connection state changed to: {:?}", st);
                if matches!(
                    st,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
                ) {
                    if let Some(pc) = weak_pc.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }
                let _ = events.send(RtcEvent::ConnectionStateChanged(st.into()));
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let live = Arc::clone(&self.generation);
        let sinks = Arc::clone(&self.sinks);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if live.load(Ordering::SeqCst) == generation {
                    if let Some(kind) = MediaKind::from_codec_type(track.kind()) {
                        let id = track.id();
                        info!("Remote {:?} track {} added", kind, id);
                        let _ = events.send(RtcEvent::RemoteTrack(RemoteTrackInfo {
                            id: id.clone(),
                            kind,
                        }));
                        // read loop runs detached so the handler returns at once
                        let sinks = Arc::clone(&sinks);
                        tokio::spawn(async move {
                            while let Ok((packet, _)) = track.read_rtp().await {
                                let sink = sinks
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .get(&id)
                                    .cloned();
                                if let Some(sink) = sink {
                                    sink.on_media(kind, &packet.payload);
                                }
                            }
                            debug!("Remote track {} ended", id);
                        });
                    }
                }
                Box::pin(async {})
            },
        ));

        Ok(pc)
    }

    async fn attach_local(pc: &RTCPeerConnection, tracks: &LocalTracks) -> Result<(), RtcError> {
        for track in tracks.all() {
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // drain RTCP so interceptors keep working
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn ensure_receivers(
        pc: &RTCPeerConnection,
        constraints: &MediaConstraints,
    ) -> Result<(), RtcError> {
        let existing: Vec<RTPCodecType> = pc
            .get_transceivers()
            .await
            .iter()
            .map(|t| t.kind())
            .collect();
        let wanted = [
            (constraints.receive_audio, RTPCodecType::Audio),
            (constraints.receive_video, RTPCodecType::Video),
        ];
        for (requested, kind) in wanted {
            if requested && !existing.contains(&kind) {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn start_capture(&self, options: &CaptureOptions) -> Result<(), RtcError> {
        let pc = self.current().await?;
        let mut local = self.local.lock().await;
        if local.is_some() {
            debug!("Capture already running");
            return Ok(());
        }

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let audio = options.audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                STREAM_ID.to_owned(),
            ))
        });
        let tracks = LocalTracks {
            video,
            audio,
            video_enabled: Arc::clone(&self.video_enabled),
            audio_enabled: Arc::clone(&self.audio_enabled),
        };
        Self::attach_local(&pc, &tracks).await?;
        self.audio_enabled.store(options.audio, Ordering::SeqCst);
        info!(
            "Local capture attached: {}x{}@{} front={} audio={}",
            options.width, options.height, options.fps, options.front_facing, options.audio
        );
        *local = Some(tracks);
        Ok(())
    }

    async fn stop_capture(&self) -> Result<(), RtcError> {
        if self.local.lock().await.take().is_some() {
            info!("Local capture stopped");
        }
        Ok(())
    }

    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<String, RtcError> {
        let pc = self.current().await?;
        Self::ensure_receivers(&pc, constraints).await?;
        let offer = pc.create_offer(None).await?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self, _constraints: &MediaConstraints) -> Result<String, RtcError> {
        // answer transceivers follow the remote offer's m-lines
        let pc = self.current().await?;
        let answer = pc.create_answer(None).await?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError> {
        let pc = self.current().await?;
        pc.set_local_description(description(kind, sdp)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError> {
        let pc = self.current().await?;
        pc.set_remote_description(description(kind, sdp)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        let pc = self.current().await?;
        pc.add_ice_candidate(candidate.clone().into()).await?;
        Ok(())
    }

    async fn attach_remote_sink(
        &self,
        track_id: &str,
        sink: Arc<dyn MediaSink>,
    ) -> Result<(), RtcError> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(track_id.to_owned(), sink);
        Ok(())
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    async fn restart(&self) -> Result<(), RtcError> {
        let old = self.pc.lock().await.take();
        if let Some(old) = old {
            // bump before closing so the old callbacks stay silent
            self.generation.fetch_add(1, Ordering::SeqCst);
            let _ = old.close().await;
        }
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let pc = self.new_peer().await?;
        if let Some(tracks) = self.local.lock().await.as_ref() {
            Self::attach_local(&pc, tracks).await?;
        }
        *self.pc.lock().await = Some(pc);
        debug!("Peer connection replaced");
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let pc = self.pc.lock().await.take();
        if let Some(pc) = pc {
            let _ = pc.close().await;
        }
        self.local.lock().await.take();
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn description(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription, RtcError> {
    let parsed = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
        SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
    };
    parsed.map_err(|e| RtcError::Sdp(e.to_string()))
}

/// Peer connection configuration built from the configured ICE servers
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}
