//! Single entry point composing session, capture and publish.
//!
//! All three components live inside one tokio task. Commands travel to it
//! over a channel and are applied strictly in submission order; backend
//! completions, session signals and watchdog reports come back as
//! [`Notice`]s and are applied in the same task, so no component is ever
//! touched concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::SessionBackend;
use crate::capture::CaptureController;
use crate::config::{
    ChannelAddress, ChannelTarget, ConnectionConfiguration, MediaConfiguration,
    OrchestratorConfig, RenderTarget, TrackKind,
};
use crate::errors::{OrchestratorError, PublisherError};
use crate::event_bus::EventBus;
use crate::events::{PublishState, PublishStates, PublisherEvent, SessionState};
use crate::notice::{self, Notice, NoticeReceiver};
use crate::publish::PublishCoordinator;
use crate::session::SessionManager;

#[derive(Debug)]
enum Command {
    Initialize(ConnectionConfiguration),
    EnsureReady,
    SetMedia(MediaConfiguration),
    Acquire(MediaConfiguration),
    FlipCamera,
    SetRenderTarget(Option<RenderTarget>),
    SetPreview(bool),
    SetDeviceEnabled(TrackKind, bool),
    Join(Vec<ChannelTarget>),
    Publish(ChannelTarget),
    Stop(ChannelAddress),
    CollectLogs,
    Release,
}

struct Envelope {
    command: Command,
    done: oneshot::Sender<()>,
}

/// Streams observed from outside the orchestrator task.
#[derive(Clone)]
struct Outputs {
    events: EventBus<PublisherEvent>,
    errors: EventBus<PublisherError>,
    session_state: EventBus<SessionState>,
    publish_states: EventBus<PublishStates>,
    logs: EventBus<String>,
}

/// Cloneable handle to an orchestrator task.
///
/// Command methods resolve once the command has been processed. They never
/// report backend failures; those arrive on [`Orchestrator::errors`]. The
/// task releases everything and exits when the last handle is dropped.
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Envelope>,
    outputs: Outputs,
}

impl Orchestrator {
    /// Spawn the orchestrator task. Must be called inside a tokio runtime.
    pub fn new(backend: Arc<dyn SessionBackend>, config: OrchestratorConfig) -> Self {
        Self::spawn(backend, config).0
    }

    /// Like [`Orchestrator::new`], also returning the task handle.
    pub fn spawn(backend: Arc<dyn SessionBackend>, config: OrchestratorConfig) -> (Self, JoinHandle<()>) {
        let (notice_tx, notice_rx) = notice::channel();
        let session = SessionManager::new(backend.clone(), config.cool_down, notice_tx.clone());
        let capture = CaptureController::new(backend.clone(), config.silence_window, notice_tx.clone());
        let publish = PublishCoordinator::new(backend.clone(), config.leave_timeout, notice_tx);

        let outputs = Outputs {
            events: EventBus::new(),
            errors: EventBus::new(),
            session_state: EventBus::new(),
            publish_states: EventBus::new(),
            logs: EventBus::new(),
        };
        session.events().forward_to(&outputs.events);
        capture.events().forward_to(&outputs.events);
        publish.events().forward_to(&outputs.events);
        session.errors().forward_to(&outputs.errors);
        capture.errors().forward_to(&outputs.errors);
        publish.errors().forward_to(&outputs.errors);
        session.state_bus().forward_to(&outputs.session_state);
        publish.state_bus().forward_to(&outputs.publish_states);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            backend,
            session,
            capture,
            publish,
            logs: outputs.logs.clone(),
            commands: command_rx,
            notices: notice_rx,
        };
        let task = tokio::spawn(actor.run());
        tracing::info!("orchestrator started");
        (Self { commands, outputs }, task)
    }

    async fn submit(&self, command: Command) -> Result<(), OrchestratorError> {
        let (done, processed) = oneshot::channel();
        self.commands
            .send(Envelope { command, done })
            .map_err(|_| OrchestratorError::Closed)?;
        processed.await.map_err(|_| OrchestratorError::Closed)
    }

    // -- commands --

    /// Open (or reopen, after a cool-down) the backend session.
    pub async fn initialize(&self, config: ConnectionConfiguration) -> Result<(), OrchestratorError> {
        self.submit(Command::Initialize(config)).await
    }

    /// Wait for the session to come online, up to `timeout`.
    ///
    /// Initializes from the last configuration when Uninitialized. A Failed
    /// session is not reopened and yields false at once. On timeout a
    /// [`PublisherError::NetworkTimeout`] is published and false returned;
    /// the backend wait keeps running and a late online still makes the
    /// session Ready.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        let wait = async {
            if self.submit(Command::EnsureReady).await.is_err() {
                return false;
            }
            let mut states = self.outputs.session_state.subscribe();
            while let Some(state) = states.recv().await {
                match state {
                    SessionState::Ready => return true,
                    SessionState::Initializing => continue,
                    SessionState::Uninitialized | SessionState::Failed => return false,
                }
            }
            false
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(ready) => ready,
            Err(_) => {
                let waited_ms = timeout.as_millis() as u64;
                tracing::error!(waited_ms, "session not ready in time");
                self.outputs
                    .errors
                    .publish(PublisherError::NetworkTimeout { waited_ms });
                false
            }
        }
    }

    /// Acquire a capture stream for `config`.
    pub async fn acquire(&self, config: MediaConfiguration) -> Result<(), OrchestratorError> {
        self.submit(Command::Acquire(config)).await
    }

    /// Reconfigure the capture stream, in place when the backend allows it.
    pub async fn set_media_configuration(&self, config: MediaConfiguration) -> Result<(), OrchestratorError> {
        self.submit(Command::SetMedia(config)).await
    }

    pub async fn flip_camera(&self) -> Result<(), OrchestratorError> {
        self.submit(Command::FlipCamera).await
    }

    pub async fn set_render_target(&self, target: RenderTarget) -> Result<(), OrchestratorError> {
        self.submit(Command::SetRenderTarget(Some(target))).await
    }

    pub async fn clear_render_target(&self) -> Result<(), OrchestratorError> {
        self.submit(Command::SetRenderTarget(None)).await
    }

    pub async fn set_preview_enabled(&self, enabled: bool) -> Result<(), OrchestratorError> {
        self.submit(Command::SetPreview(enabled)).await
    }

    /// Mute or unmute one track without reconfiguring the stream.
    pub async fn set_device_enabled(&self, track: TrackKind, enabled: bool) -> Result<(), OrchestratorError> {
        self.submit(Command::SetDeviceEnabled(track, enabled)).await
    }

    pub async fn join(&self, target: ChannelTarget) -> Result<(), OrchestratorError> {
        self.submit(Command::Join(vec![target])).await
    }

    pub async fn join_all(&self, targets: Vec<ChannelTarget>) -> Result<(), OrchestratorError> {
        self.submit(Command::Join(targets)).await
    }

    pub async fn publish(&self, target: ChannelTarget) -> Result<(), OrchestratorError> {
        self.submit(Command::Publish(target)).await
    }

    pub async fn stop(&self, address: ChannelAddress) -> Result<(), OrchestratorError> {
        self.submit(Command::Stop(address)).await
    }

    /// Ask the backend for its buffered logs; the text arrives on [`Orchestrator::logs`].
    pub async fn collect_logs(&self) -> Result<(), OrchestratorError> {
        self.submit(Command::CollectLogs).await
    }

    /// Stop all publishes, dispose the capture and close the session.
    pub async fn release(&self) -> Result<(), OrchestratorError> {
        self.submit(Command::Release).await
    }

    // -- observation --

    pub fn events(&self) -> &EventBus<PublisherEvent> {
        &self.outputs.events
    }

    pub fn errors(&self) -> &EventBus<PublisherError> {
        &self.outputs.errors
    }

    pub fn session_states(&self) -> &EventBus<SessionState> {
        &self.outputs.session_state
    }

    pub fn publish_states(&self) -> &EventBus<PublishStates> {
        &self.outputs.publish_states
    }

    pub fn logs(&self) -> &EventBus<String> {
        &self.outputs.logs
    }

    pub fn session_state(&self) -> SessionState {
        self.outputs
            .session_state
            .latest()
            .unwrap_or(SessionState::Uninitialized)
    }

    pub fn is_ready(&self) -> bool {
        self.session_state() == SessionState::Ready
    }

    pub fn publish_state(&self, address: &ChannelAddress) -> Option<PublishState> {
        self.outputs
            .publish_states
            .latest()
            .and_then(|states| states.get(address).copied())
    }
}

/// Owner of all mutable orchestration state.
struct Actor {
    backend: Arc<dyn SessionBackend>,
    session: SessionManager,
    capture: CaptureController,
    publish: PublishCoordinator,
    logs: EventBus<String>,
    commands: mpsc::UnboundedReceiver<Envelope>,
    notices: NoticeReceiver,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(notice) = self.notices.recv() => self.handle_notice(notice).await,
                envelope = self.commands.recv() => match envelope {
                    Some(Envelope { command, done }) => {
                        self.handle_command(command).await;
                        let _ = done.send(());
                    }
                    None => {
                        tracing::info!("all orchestrator handles dropped, shutting down");
                        break;
                    }
                },
            }
        }
        self.release().await;
        tracing::info!("orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!(?command, "handling command");
        let handle = self.session.ready_handle();

        match command {
            Command::Initialize(config) => {
                if !self.session.accept(&config) {
                    return;
                }
                if self.session.has_session() {
                    // publishes and capture belong to the session about to be closed
                    self.publish.release();
                    self.capture.suspend();
                }
                self.session.open(config).await;
            }
            Command::EnsureReady => self.session.ensure_online().await,
            Command::SetMedia(config) => {
                self.capture.reconfigure(handle, config).await;
            }
            Command::Acquire(config) => {
                self.capture.acquire(handle, config).await;
            }
            Command::FlipCamera => {
                self.capture.flip_camera(handle).await;
            }
            Command::SetRenderTarget(Some(target)) => self.capture.set_render_target(target),
            Command::SetRenderTarget(None) => self.capture.clear_render_target(),
            Command::SetPreview(enabled) => self.capture.set_preview_enabled(enabled),
            Command::SetDeviceEnabled(track, enabled) => self.capture.set_device_enabled(track, enabled),
            Command::Join(targets) => {
                self.publish.join_all(handle, targets).await;
            }
            Command::Publish(target) => {
                self.publish.publish(handle, self.capture.current(), target);
            }
            Command::Stop(address) => {
                self.publish.stop(&address);
            }
            Command::CollectLogs => self.collect_logs().await,
            Command::Release => self.release().await,
        }
    }

    async fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Session { generation, signal } => {
                self.session.handle_signal(generation, signal);
                self.resume_capture().await;
            }
            Notice::Online { generation, result } => {
                self.session.handle_online(generation, result);
                self.resume_capture().await;
            }
            Notice::PublishSettled {
                address,
                attempt,
                result,
            } => self.publish.handle_settled(address, attempt, result),
            Notice::TrackSilent { capture, track } => {
                if self.capture.handle_silent(capture, track) {
                    self.capture.set_device_enabled(track, false);
                }
            }
        }
    }

    async fn resume_capture(&mut self) {
        if self.capture.resume_pending() && self.session.is_ready() {
            self.capture.resume(self.session.ready_handle()).await;
        }
    }

    async fn collect_logs(&mut self) {
        let Some(handle) = self.session.ready_handle() else {
            tracing::warn!("cannot collect logs, session is not ready");
            return;
        };
        match self.backend.collect_logs(handle).await {
            Ok(text) => {
                tracing::debug!(bytes = text.len(), "backend logs collected");
                self.logs.publish(text);
            }
            Err(e) => tracing::warn!("collecting backend logs failed: {e}"),
        }
    }

    async fn release(&mut self) {
        tracing::info!("releasing orchestrator resources");
        self.publish.release();
        self.capture.release();
        self.session.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, PublishMode};

    fn orchestrator(fake: &FakeBackend) -> Orchestrator {
        Orchestrator::new(Arc::new(fake.clone()), OrchestratorConfig::default())
    }

    async fn ready(orch: &Orchestrator) {
        orch.initialize(ConnectionConfiguration::with_backend("https://a"))
            .await
            .unwrap();
        assert!(orch.wait_until_ready(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn concurrent_duplicate_publish_is_rejected() {
        let fake = FakeBackend::new();
        fake.set_publish_mode(PublishMode::Gated);
        let orch = orchestrator(&fake);
        ready(&orch).await;
        orch.acquire(MediaConfiguration::default()).await.unwrap();

        let (a, b) = tokio::join!(
            orch.publish(ChannelTarget::alias("news")),
            orch.publish(ChannelTarget::alias("news"))
        );
        a.unwrap();
        b.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(fake.publish_count(), 1);
        let address = ChannelAddress::Alias("news".into());
        assert_eq!(orch.publish_state(&address), Some(PublishState::Publishing));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_track_is_disabled() {
        let fake = FakeBackend::new();
        let orch = orchestrator(&fake);
        ready(&orch).await;
        let mut events = orch.events().subscribe();
        orch.acquire(MediaConfiguration::default()).await.unwrap();
        let capture = fake.latest_capture().unwrap();

        loop {
            match events.recv().await.unwrap() {
                PublisherEvent::DeviceFailure(track) => {
                    assert!(matches!(track, TrackKind::Audio | TrackKind::Video));
                    break;
                }
                _ => continue,
            }
        }
        // runs after the notice that disabled the track
        orch.collect_logs().await.unwrap();
        assert!(
            !capture.track_enabled(TrackKind::Audio) || !capture.track_enabled(TrackKind::Video)
        );
    }

    #[tokio::test]
    async fn logs_are_published() {
        let fake = FakeBackend::new();
        fake.set_logs("line 1\nline 2");
        let orch = orchestrator(&fake);
        let mut logs = orch.logs().subscribe();
        ready(&orch).await;

        orch.collect_logs().await.unwrap();

        assert_eq!(logs.try_recv().as_deref(), Some("line 1\nline 2"));
    }

    #[tokio::test]
    async fn dropping_every_handle_releases() {
        let fake = FakeBackend::new();
        let (orch, task) = Orchestrator::spawn(Arc::new(fake.clone()), OrchestratorConfig::default());
        ready(&orch).await;
        orch.acquire(MediaConfiguration::default()).await.unwrap();

        drop(orch);
        task.await.unwrap();

        assert_eq!(fake.close_count(), 1);
        assert!(fake.latest_capture().unwrap().is_disposed());
    }

    #[tokio::test]
    async fn reconnecting_stops_publishes_of_old_session() {
        let fake = FakeBackend::new();
        let orch = Orchestrator::new(
            Arc::new(fake.clone()),
            OrchestratorConfig {
                cool_down: Duration::ZERO,
                ..Default::default()
            },
        );
        ready(&orch).await;
        orch.acquire(MediaConfiguration::default()).await.unwrap();
        orch.publish(ChannelTarget::alias("news")).await.unwrap();
        let mut states = orch.publish_states().subscribe();
        loop {
            let latest = states.recv().await.unwrap();
            if latest.values().any(|s| *s == PublishState::Published) {
                break;
            }
        }

        orch.initialize(ConnectionConfiguration::with_backend("https://b"))
            .await
            .unwrap();

        assert_eq!(fake.unpublished(), vec![ChannelAddress::Alias("news".into())]);
        assert_eq!(orch.publish_state(&ChannelAddress::Alias("news".into())), None);
    }
}
