use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::backend::{CaptureId, CaptureResource, SessionBackend, SessionHandle};
use crate::config::{CameraFacing, MediaConfiguration, RenderTarget, TrackKind};
use crate::errors::PublisherError;
use crate::event_bus::EventBus;
use crate::events::PublisherEvent;
use crate::notice::NoticeSender;
use crate::watchdog::spawn_watchdog;

/// How a new media snapshot was taken by the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfiguration {
    /// Applied to the live stream; identity and renderer unchanged.
    InPlace,
    /// The live stream refused it and was replaced.
    Recreated,
    /// No stream yet; the snapshot is used by the next acquisition.
    Deferred,
}

/// The single live capture plus its watchdog tasks.
struct CaptureStream {
    resource: Arc<dyn CaptureResource>,
    watchdogs: HashMap<TrackKind, JoinHandle<()>>,
}

impl CaptureStream {
    fn id(&self) -> CaptureId {
        self.resource.id()
    }

    fn stop_watchdog(&mut self, track: TrackKind) {
        if let Some(handle) = self.watchdogs.remove(&track) {
            handle.abort();
        }
    }

    fn dispose(mut self) {
        for (_, handle) in self.watchdogs.drain() {
            handle.abort();
        }
        self.resource.dispose();
    }
}

/// Keeps exactly one capture stream consistent with the current
/// [`MediaConfiguration`] and attached to at most one render target.
///
/// Render target, preview and per-track enablement are remembered on the
/// controller, so they survive stream recreation and can be set before any
/// stream exists.
pub struct CaptureController {
    backend: Arc<dyn SessionBackend>,
    silence_window: Duration,
    notices: NoticeSender,
    events: EventBus<PublisherEvent>,
    errors: EventBus<PublisherError>,
    stream: Option<CaptureStream>,
    config: MediaConfiguration,
    render_target: Option<RenderTarget>,
    preview_enabled: bool,
    track_overrides: HashMap<TrackKind, bool>,
    /// A stream was dropped with its session and should come back on the next one.
    resume_pending: bool,
}

impl CaptureController {
    pub fn new(backend: Arc<dyn SessionBackend>, silence_window: Duration, notices: NoticeSender) -> Self {
        Self {
            backend,
            silence_window,
            notices,
            events: EventBus::new(),
            errors: EventBus::new(),
            stream: None,
            config: MediaConfiguration::default(),
            render_target: None,
            preview_enabled: false,
            track_overrides: HashMap::new(),
            resume_pending: false,
        }
    }

    pub fn events(&self) -> &EventBus<PublisherEvent> {
        &self.events
    }

    pub fn errors(&self) -> &EventBus<PublisherError> {
        &self.errors
    }

    /// The live capture resource, if any.
    pub fn current(&self) -> Option<Arc<dyn CaptureResource>> {
        self.stream.as_ref().map(|s| s.resource.clone())
    }

    /// The current media snapshot.
    pub fn config(&self) -> &MediaConfiguration {
        &self.config
    }

    pub fn render_target(&self) -> Option<&RenderTarget> {
        self.render_target.as_ref()
    }

    /// Acquire a new capture stream for `config`, replacing the live one.
    ///
    /// `handle` is `None` when the session is not Ready, which is reported
    /// as an acquisition failure.
    pub async fn acquire(&mut self, handle: Option<SessionHandle>, config: MediaConfiguration) -> bool {
        if handle.is_some() {
            self.resume_pending = false;
        }
        match self.open_stream(handle, config).await {
            Ok(()) => {
                self.events.publish(PublisherEvent::CaptureAcquired);
                true
            }
            Err(reason) => {
                self.errors.publish(PublisherError::DeviceAcquisitionFailed { reason });
                false
            }
        }
    }

    /// Apply `config` to the live stream, recreating it when the backend
    /// refuses the in-place change. An acquisition error is surfaced only
    /// when the recreation fails too.
    pub async fn reconfigure(
        &mut self,
        handle: Option<SessionHandle>,
        config: MediaConfiguration,
    ) -> Option<Reconfiguration> {
        match self.apply_snapshot(handle, config).await {
            Ok(outcome) => Some(outcome),
            Err(reason) => {
                self.errors.publish(PublisherError::DeviceAcquisitionFailed { reason });
                None
            }
        }
    }

    /// Switch between front and rear cameras.
    pub async fn flip_camera(&mut self, handle: Option<SessionHandle>) -> bool {
        let result = if self.stream.is_none() {
            Err("no capture stream".to_string())
        } else if self.config.camera == CameraFacing::Off {
            Err("camera is off".to_string())
        } else {
            let flipped = self.config.flipped();
            self.apply_snapshot(handle, flipped).await.map(|_| ())
        };
        match result {
            Ok(()) => {
                tracing::info!(camera = ?self.config.camera, "camera flipped");
                self.events.publish(PublisherEvent::DeviceFlipped(self.config.camera));
                true
            }
            Err(reason) => {
                tracing::error!("camera flip failed: {reason}");
                self.errors.publish(PublisherError::CameraFlipFailed { reason });
                false
            }
        }
    }

    /// Attach the stream to `target`, or remember it for the next acquisition.
    pub fn set_render_target(&mut self, target: RenderTarget) {
        if self.render_target.as_ref() == Some(&target) {
            tracing::debug!(target = %target.id, "render target unchanged");
            return;
        }
        if let Some(stream) = &self.stream {
            if self.render_target.is_some() {
                stream.resource.detach_renderer();
            }
        }
        self.render_target = Some(target);
        self.attach_renderer();
    }

    pub fn clear_render_target(&mut self) {
        if self.render_target.take().is_none() {
            return;
        }
        if let Some(stream) = &self.stream {
            stream.resource.stop_preview();
            stream.resource.detach_renderer();
        }
        tracing::debug!("render target cleared");
    }

    pub fn set_preview_enabled(&mut self, enabled: bool) {
        self.preview_enabled = enabled;
        let Some(stream) = &self.stream else {
            return;
        };
        if !enabled {
            stream.resource.stop_preview();
        } else if self.render_target.is_some() {
            if let Err(e) = stream.resource.start_preview() {
                tracing::warn!("could not start preview: {e}");
            }
        }
    }

    /// Toggle one track without reconfiguring the stream.
    pub fn set_device_enabled(&mut self, track: TrackKind, enabled: bool) {
        self.track_overrides.insert(track, enabled);
        tracing::info!(%track, enabled, "device toggled");
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        stream.resource.set_track_enabled(track, enabled);
        if enabled {
            Self::arm_watchdog(stream, track, self.silence_window, &self.notices);
        } else {
            stream.stop_watchdog(track);
        }
    }

    pub fn is_device_enabled(&self, track: TrackKind) -> bool {
        self.track_overrides.get(&track).copied().unwrap_or(true)
    }

    /// A watchdog reported silence. Returns whether it concerns the live
    /// stream; reports from a disposed stream are dropped.
    pub fn handle_silent(&mut self, capture: CaptureId, track: TrackKind) -> bool {
        match &self.stream {
            Some(stream) if stream.id() == capture => {
                tracing::error!(%capture, %track, "device failure detected");
                self.events.publish(PublisherEvent::DeviceFailure(track));
                true
            }
            _ => {
                tracing::debug!(%capture, %track, "dropping silence report from old capture");
                false
            }
        }
    }

    /// Dispose the stream because its session is going away. Render target,
    /// preview, track enablement and media configuration are kept for
    /// [`CaptureController::resume`].
    pub fn suspend(&mut self) {
        if self.stream.is_some() {
            tracing::info!("session closing, suspending capture");
            self.dispose_stream();
            self.resume_pending = true;
        }
    }

    pub fn resume_pending(&self) -> bool {
        self.resume_pending
    }

    /// Re-acquire a suspended stream on the new session with the current
    /// media configuration. Returns false when nothing was suspended or the
    /// acquisition failed.
    pub async fn resume(&mut self, handle: Option<SessionHandle>) -> bool {
        if handle.is_none() || !std::mem::take(&mut self.resume_pending) {
            return false;
        }
        let config = self.config.clone();
        self.acquire(handle, config).await
    }

    /// Dispose the stream and forget the render target. Idempotent.
    pub fn release(&mut self) {
        self.resume_pending = false;
        self.dispose_stream();
        self.render_target = None;
        self.preview_enabled = false;
        self.track_overrides.clear();
    }

    async fn apply_snapshot(
        &mut self,
        handle: Option<SessionHandle>,
        config: MediaConfiguration,
    ) -> Result<Reconfiguration, String> {
        config.validate().map_err(|e| e.to_string())?;
        let Some(stream) = self.stream.as_mut() else {
            tracing::debug!("no capture stream, keeping media configuration for next acquisition");
            self.config = config;
            return Ok(Reconfiguration::Deferred);
        };

        match stream.resource.apply_configuration(&config) {
            Ok(()) => {
                tracing::info!(capture = %stream.id(), "media configuration applied in place");
                self.config = config;
                self.rearm_watchdogs();
                self.events.publish(PublisherEvent::CaptureReconfigured);
                Ok(Reconfiguration::InPlace)
            }
            Err(e) => {
                tracing::warn!(capture = %stream.id(), "in-place apply refused ({e}), recreating capture");
                self.dispose_stream();
                self.open_stream(handle, config).await?;
                self.events.publish(PublisherEvent::CaptureRecreated);
                Ok(Reconfiguration::Recreated)
            }
        }
    }

    async fn open_stream(
        &mut self,
        handle: Option<SessionHandle>,
        config: MediaConfiguration,
    ) -> Result<(), String> {
        config.validate().map_err(|e| e.to_string())?;
        self.config = config;
        let Some(handle) = handle else {
            tracing::error!("cannot acquire capture, session is not ready");
            return Err("session is not ready".into());
        };

        self.dispose_stream();
        let resource = match self.backend.acquire_capture(handle, &self.config).await {
            Ok(resource) => resource,
            Err(e) => {
                tracing::error!("capture acquisition failed: {e}");
                return Err(e.to_string());
            }
        };
        tracing::info!(capture = %resource.id(), camera = ?self.config.camera, "capture acquired");

        for (track, enabled) in &self.track_overrides {
            resource.set_track_enabled(*track, *enabled);
        }
        self.stream = Some(CaptureStream {
            resource,
            watchdogs: HashMap::new(),
        });
        self.attach_renderer();
        self.rearm_watchdogs();
        Ok(())
    }

    fn attach_renderer(&self) {
        let (Some(stream), Some(target)) = (&self.stream, &self.render_target) else {
            return;
        };
        if let Err(e) = stream.resource.attach_renderer(target) {
            tracing::warn!(target = %target.id, "could not attach renderer: {e}");
            return;
        }
        tracing::debug!(target = %target.id, capture = %stream.id(), "renderer attached");
        if self.preview_enabled {
            if let Err(e) = stream.resource.start_preview() {
                tracing::warn!("could not start preview: {e}");
            }
        }
    }

    fn rearm_watchdogs(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        for track in [TrackKind::Audio, TrackKind::Video] {
            stream.stop_watchdog(track);
            if self.track_overrides.get(&track).copied().unwrap_or(true) {
                Self::arm_watchdog(stream, track, self.silence_window, &self.notices);
            }
        }
    }

    fn arm_watchdog(stream: &mut CaptureStream, track: TrackKind, window: Duration, notices: &NoticeSender) {
        stream.stop_watchdog(track);
        if let Some(activity) = stream.resource.activity(track) {
            let handle = spawn_watchdog(stream.id(), track, activity, window, notices.clone());
            stream.watchdogs.insert(track, handle);
        }
    }

    fn dispose_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::info!(capture = %stream.id(), "disposing capture");
            stream.dispose();
        }
    }
}
