//! Channel publisher core.
//!
//! Orchestrates a session with a remote streaming backend, the local
//! audio/video capture and publishing to named channels. Hosts drive it
//! through [`Orchestrator`] and observe it through its event buses.

pub mod backend;
pub mod capture;
pub mod config;
pub mod errors;
pub mod event_bus;
pub mod events;
pub mod notice;
pub mod orchestrator;
pub mod publish;
pub mod session;
pub mod settings;
pub mod watchdog;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backend::{CaptureResource, SessionBackend};
pub use config::{
    BitrateMode, CameraFacing, ChannelAddress, ChannelTarget, ConnectionConfiguration,
    MediaConfiguration, OrchestratorConfig, RenderTarget, TrackKind,
};
pub use errors::{BackendError, ConfigError, OrchestratorError, PublisherError};
pub use event_bus::{EventBus, Listener, Subscription};
pub use events::{PublishState, PublishStates, PublisherEvent, SessionState};
pub use orchestrator::Orchestrator;
pub use settings::{Settings, SettingsStore};
