//! The seam to the remote streaming backend.
//!
//! The backend is an opaque asynchronous service. Every operation that the
//! native SDKs expose as "call with a completion callback" is an `async fn`
//! here with a single resolution; unsolicited notifications (ready,
//! unrecoverable error, per-track activity) arrive over channels.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{
    ChannelAddress, ChannelTarget, ConnectionConfiguration, MediaConfiguration,
    PublishAuthorization, RenderTarget, TrackKind,
};
use crate::errors::BackendError;

/// Identifies one opened backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub Uuid);

impl SessionHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Identifies one capture resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureId(pub Uuid);

impl CaptureId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture-{}", self.0)
    }
}

/// A room/channel association returned by `join` or `publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: Uuid,
    pub address: ChannelAddress,
}

impl Subscription {
    pub fn new(address: ChannelAddress) -> Self {
        Self {
            id: Uuid::new_v4(),
            address,
        }
    }
}

/// Unsolicited session notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    Ready,
    Unrecoverable(String),
}

/// Result of a successful `open_session`.
pub struct OpenedSession {
    pub handle: SessionHandle,
    pub signals: mpsc::UnboundedReceiver<SessionSignal>,
}

/// Local audio/video capture obtained from the backend.
pub trait CaptureResource: Send + Sync {
    fn id(&self) -> CaptureId;

    /// Mutate the live stream. Not every property is guaranteed mutable.
    fn apply_configuration(&self, config: &MediaConfiguration) -> Result<(), BackendError>;

    fn set_track_enabled(&self, track: TrackKind, enabled: bool);

    fn attach_renderer(&self, target: &RenderTarget) -> Result<(), BackendError>;

    fn detach_renderer(&self);

    fn start_preview(&self) -> Result<(), BackendError>;

    fn stop_preview(&self);

    /// One message per observed frame/packet on `track`, or `None` when the
    /// stream has no such track.
    fn activity(&self, track: TrackKind) -> Option<mpsc::UnboundedReceiver<()>>;

    fn dispose(&self);
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn open_session(
        &self,
        config: &ConnectionConfiguration,
    ) -> Result<OpenedSession, BackendError>;

    async fn close_session(&self, handle: SessionHandle);

    /// Resolves once the session is online. No cancellation primitive exists;
    /// callers may stop waiting but the request stays in flight.
    async fn wait_online(&self, handle: SessionHandle) -> Result<(), BackendError>;

    async fn acquire_capture(
        &self,
        handle: SessionHandle,
        config: &MediaConfiguration,
    ) -> Result<Arc<dyn CaptureResource>, BackendError>;

    async fn join(
        &self,
        handle: SessionHandle,
        target: &ChannelTarget,
    ) -> Result<Subscription, BackendError>;

    /// Resolves with the backend acknowledgment of the publish.
    async fn publish(
        &self,
        handle: SessionHandle,
        target: &ChannelTarget,
        authorization: PublishAuthorization,
        capture: Arc<dyn CaptureResource>,
    ) -> Result<Subscription, BackendError>;

    /// Stop the outbound media of a publish. The room association stays until
    /// `leave`.
    fn unpublish(&self, subscription: &Subscription);

    async fn leave(&self, subscription: Subscription) -> Result<(), BackendError>;

    /// Buffered backend log text.
    async fn collect_logs(&self, handle: SessionHandle) -> Result<String, BackendError>;
}
