//! Blocking host shell around chanpub-core.
//!
//! Provides a [`PublisherClient`] that owns a tokio runtime, the
//! orchestrator and the persisted settings, for UI code that is not async.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chanpub_core::{
    BitrateMode, ChannelAddress, ConfigError, ConnectionConfiguration, Listener,
    MediaConfiguration, Orchestrator, OrchestratorConfig, OrchestratorError, PublishState,
    PublisherError, PublisherEvent, RenderTarget, SessionBackend, SessionState, Settings,
    SettingsStore, TrackKind,
};
use tokio::task::JoinHandle;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing/logging. Call once from the host before using PublisherClient.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chanpub_core=debug,chanpub_client=debug")),
            )
            .with_ansi(false)
            .init();
    });
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("runtime error: {msg}")]
    Runtime { msg: String },
    #[error("no connection configuration")]
    NotConfigured,
    #[error("invalid configuration: {msg}")]
    InvalidConfiguration { msg: String },
    #[error("publisher has shut down")]
    Closed,
}

impl From<OrchestratorError> for ClientError {
    fn from(e: OrchestratorError) -> Self {
        tracing::error!("OrchestratorError: {e}");
        match e {
            OrchestratorError::Closed => Self::Closed,
        }
    }
}

impl From<ConfigError> for ClientError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidConfiguration { msg: e.to_string() }
    }
}

// ── Callback interface ────────────────────────────────────────────────

/// Everything a host can observe, on one callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SessionStateChanged(SessionState),
    Publisher(PublisherEvent),
    Error(PublisherError),
    Logs(String),
}

pub trait PublisherListener: Send + Sync {
    fn on_event(&self, event: ClientEvent);
}

struct BridgeListener {
    host: Arc<dyn PublisherListener>,
}

impl Listener<SessionState> for BridgeListener {
    fn on_event(&self, value: SessionState) {
        self.host.on_event(ClientEvent::SessionStateChanged(value));
    }
}

impl Listener<PublisherEvent> for BridgeListener {
    fn on_event(&self, value: PublisherEvent) {
        self.host.on_event(ClientEvent::Publisher(value));
    }
}

impl Listener<PublisherError> for BridgeListener {
    fn on_event(&self, value: PublisherError) {
        self.host.on_event(ClientEvent::Error(value));
    }
}

impl Listener<String> for BridgeListener {
    fn on_event(&self, value: String) {
        self.host.on_event(ClientEvent::Logs(value));
    }
}

// ── PublisherClient ───────────────────────────────────────────────────

pub struct PublisherClient {
    orchestrator: Orchestrator,
    settings: SettingsStore,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    ready_timeout: Duration,
    rt: tokio::runtime::Runtime,
}

impl PublisherClient {
    /// Build a client persisting its settings in `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>, backend: Arc<dyn SessionBackend>) -> Result<Self, ClientError> {
        Self::with_config(data_dir, backend, OrchestratorConfig::default())
    }

    pub fn with_config(
        data_dir: impl AsRef<Path>,
        backend: Arc<dyn SessionBackend>,
        config: OrchestratorConfig,
    ) -> Result<Self, ClientError> {
        let rt = tokio::runtime::Runtime::new().map_err(|e| ClientError::Runtime { msg: e.to_string() })?;
        let settings = SettingsStore::new(data_dir);
        let orchestrator = {
            let _guard = rt.enter();
            Orchestrator::new(backend, config)
        };
        tracing::info!(settings = %settings.path().display(), "publisher client created");
        Ok(Self {
            orchestrator,
            settings,
            listeners: Mutex::new(Vec::new()),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            rt,
        })
    }

    pub fn set_ready_timeout(&mut self, timeout: Duration) {
        self.ready_timeout = timeout;
    }

    /// Connect with `config`, or with the remembered configuration when
    /// `None`. Returns whether the session came online within the ready
    /// timeout.
    pub fn connect(&self, config: Option<ConnectionConfiguration>) -> Result<bool, ClientError> {
        let config = config
            .or_else(|| self.settings.get().connection)
            .ok_or(ClientError::NotConfigured)?;
        config.validate()?;
        self.settings.set_connection(Some(config.clone()));

        self.rt.block_on(async {
            self.orchestrator.initialize(config).await?;
            Ok::<_, ClientError>(self.orchestrator.wait_until_ready(self.ready_timeout).await)
        })
    }

    /// Acquire the capture with the remembered media configuration.
    pub fn start_capture(&self) -> Result<(), ClientError> {
        let media = self.settings.get().media;
        self.rt.block_on(self.orchestrator.acquire(media))?;
        Ok(())
    }

    pub fn set_media(&self, media: MediaConfiguration) -> Result<(), ClientError> {
        media.validate()?;
        self.settings.set_media(media.clone());
        self.rt.block_on(self.orchestrator.set_media_configuration(media))?;
        Ok(())
    }

    /// Flip the camera; the new facing is remembered only when the flip succeeded.
    pub fn flip_camera(&self) -> Result<(), ClientError> {
        let mut events = self.orchestrator.events().subscribe();
        events.drain();
        self.rt.block_on(self.orchestrator.flip_camera())?;
        let flipped = events.drain().into_iter().find_map(|event| match event {
            PublisherEvent::DeviceFlipped(camera) => Some(camera),
            _ => None,
        });
        if let Some(camera) = flipped {
            let mut media = self.settings.get().media;
            media.camera = camera;
            self.settings.set_media(media);
        }
        Ok(())
    }

    pub fn set_render_target(&self, target: Option<String>) -> Result<(), ClientError> {
        self.rt.block_on(async {
            match target {
                Some(id) => self.orchestrator.set_render_target(RenderTarget::new(id)).await,
                None => self.orchestrator.clear_render_target().await,
            }
        })?;
        Ok(())
    }

    pub fn set_preview_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        self.rt.block_on(self.orchestrator.set_preview_enabled(enabled))?;
        Ok(())
    }

    pub fn set_microphone_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        self.rt
            .block_on(self.orchestrator.set_device_enabled(TrackKind::Audio, enabled))?;
        Ok(())
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        self.rt
            .block_on(self.orchestrator.set_device_enabled(TrackKind::Video, enabled))?;
        Ok(())
    }

    pub fn set_bitrate_mode(&self, mode: BitrateMode) {
        self.settings.set_bitrate_mode(mode);
    }

    /// Join channels by alias for passive viewing.
    pub fn join(&self, aliases: Vec<String>) -> Result<(), ClientError> {
        let settings = self.settings.get();
        let targets = aliases
            .into_iter()
            .map(|alias| settings.channel_target(alias))
            .collect();
        self.rt.block_on(self.orchestrator.join_all(targets))?;
        Ok(())
    }

    /// Publish to `alias`. A publish token replaces the bitrate capabilities.
    pub fn publish(&self, alias: String, publish_token: Option<String>) -> Result<(), ClientError> {
        let mut target = self.settings.get().channel_target(alias.clone());
        if let Some(token) = publish_token {
            target = target.with_publish_token(token);
        }
        self.settings.set_last_channel(Some(alias));
        self.rt.block_on(self.orchestrator.publish(target))?;
        Ok(())
    }

    pub fn stop(&self, alias: String) -> Result<(), ClientError> {
        self.rt
            .block_on(self.orchestrator.stop(ChannelAddress::Alias(alias)))?;
        Ok(())
    }

    /// Backend log text, or `None` when the session is not ready.
    pub fn collect_logs(&self) -> Result<Option<String>, ClientError> {
        let mut logs = self.orchestrator.logs().subscribe();
        logs.drain();
        self.rt.block_on(self.orchestrator.collect_logs())?;
        Ok(logs.try_recv())
    }

    pub fn release(&self) -> Result<(), ClientError> {
        self.rt.block_on(self.orchestrator.release())?;
        Ok(())
    }

    pub fn session_state(&self) -> SessionState {
        self.orchestrator.session_state()
    }

    pub fn publish_state(&self, alias: &str) -> Option<PublishState> {
        self.orchestrator
            .publish_state(&ChannelAddress::Alias(alias.to_string()))
    }

    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    pub fn add_listener(&self, listener: Box<dyn PublisherListener>) {
        let bridge = Arc::new(BridgeListener {
            host: Arc::from(listener),
        });
        let _guard = self.rt.enter();
        let handles = [
            self.orchestrator.session_states().add_listener(bridge.clone()),
            self.orchestrator.events().add_listener(bridge.clone()),
            self.orchestrator.errors().add_listener(bridge.clone()),
            self.orchestrator.logs().add_listener(bridge),
        ];
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
    }
}

impl Drop for PublisherClient {
    fn drop(&mut self) {
        let listeners = self
            .listeners
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handle in listeners.drain(..) {
            handle.abort();
        }
        // dropping the runtime cancels the orchestrator task mid-release
        match self.rt.block_on(self.orchestrator.release()) {
            Ok(()) | Err(OrchestratorError::Closed) => {}
        }
        tracing::info!("publisher client dropped");
    }
}
