//! In-memory scriptable backend.
//!
//! Every knob defaults to the happy path: sessions become ready on open,
//! online resolves immediately, acquisition succeeds, in-place apply is
//! accepted, publishes are acknowledged and leaves succeed. Tests flip the
//! knobs they care about and inspect the recorded calls afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::backend::{
    CaptureId, CaptureResource, OpenedSession, SessionBackend, SessionHandle, SessionSignal,
    Subscription,
};
use crate::config::{
    ChannelAddress, ChannelTarget, ConnectionConfiguration, MediaConfiguration,
    PublishAuthorization, RenderTarget, TrackKind,
};
use crate::errors::BackendError;

/// How `publish` resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Ack,
    Nack,
    /// Held until [`FakeBackend::resolve_publish`].
    Gated,
}

/// How `leave` resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveMode {
    Ok,
    Fail,
    /// Never resolves.
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub address: ChannelAddress,
    pub authorization: PublishAuthorization,
    pub capture: CaptureId,
}

type PendingPublish = (ChannelAddress, oneshot::Sender<Result<Subscription, BackendError>>);

struct FakeState {
    opened: Vec<Instant>,
    closed: Vec<Instant>,
    configurations: Vec<ConnectionConfiguration>,
    reject_open: bool,
    auto_ready: bool,
    signals: Option<mpsc::UnboundedSender<SessionSignal>>,
    manual_online: bool,
    pending_online: Vec<oneshot::Sender<()>>,
    acquire_failures: VecDeque<BackendError>,
    acquire_count: usize,
    accept_apply: bool,
    captures: Vec<Arc<FakeCapture>>,
    publish_mode: PublishMode,
    pending_publishes: Vec<PendingPublish>,
    publishes: Vec<PublishRecord>,
    unpublished: Vec<ChannelAddress>,
    leave_mode: LeaveMode,
    leaves: Vec<ChannelAddress>,
    join_fail: bool,
    joins: Vec<ChannelAddress>,
    logs: String,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            opened: Vec::new(),
            closed: Vec::new(),
            configurations: Vec::new(),
            reject_open: false,
            auto_ready: true,
            signals: None,
            manual_online: false,
            pending_online: Vec::new(),
            acquire_failures: VecDeque::new(),
            acquire_count: 0,
            accept_apply: true,
            captures: Vec::new(),
            publish_mode: PublishMode::Ack,
            pending_publishes: Vec::new(),
            publishes: Vec::new(),
            unpublished: Vec::new(),
            leave_mode: LeaveMode::Ok,
            leaves: Vec::new(),
            join_fail: false,
            joins: Vec::new(),
            logs: "fake backend log".to_string(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }

    // -- session --

    pub fn set_reject_open(&self, reject: bool) {
        self.state().reject_open = reject;
    }

    /// Send `Ready` as soon as a session is opened (default on).
    pub fn set_auto_ready(&self, auto_ready: bool) {
        self.state().auto_ready = auto_ready;
    }

    /// Deliver a signal to the most recently opened session.
    pub fn signal(&self, signal: SessionSignal) {
        if let Some(tx) = &self.state().signals {
            let _ = tx.send(signal);
        }
    }

    /// Hold `wait_online` until [`FakeBackend::bring_online`].
    pub fn set_manual_online(&self, manual: bool) {
        self.state().manual_online = manual;
    }

    pub fn bring_online(&self) {
        for tx in self.state().pending_online.drain(..) {
            let _ = tx.send(());
        }
    }

    pub fn open_count(&self) -> usize {
        self.state().opened.len()
    }

    pub fn close_count(&self) -> usize {
        self.state().closed.len()
    }

    pub fn opened_at(&self, index: usize) -> Option<Instant> {
        self.state().opened.get(index).copied()
    }

    pub fn closed_at(&self, index: usize) -> Option<Instant> {
        self.state().closed.get(index).copied()
    }

    pub fn opened_configurations(&self) -> Vec<ConnectionConfiguration> {
        self.state().configurations.clone()
    }

    // -- capture --

    /// Fail the next acquisition with `error`. Queued failures are consumed in order.
    pub fn push_acquire_failure(&self, error: BackendError) {
        self.state().acquire_failures.push_back(error);
    }

    pub fn acquire_count(&self) -> usize {
        self.state().acquire_count
    }

    /// Whether live streams accept `apply_configuration` (default on).
    pub fn set_accept_apply(&self, accept: bool) {
        self.state().accept_apply = accept;
    }

    pub fn captures(&self) -> Vec<Arc<FakeCapture>> {
        self.state().captures.clone()
    }

    pub fn latest_capture(&self) -> Option<Arc<FakeCapture>> {
        self.state().captures.last().cloned()
    }

    // -- channels --

    pub fn set_publish_mode(&self, mode: PublishMode) {
        self.state().publish_mode = mode;
    }

    /// Resolve the oldest gated publish to `address`. Returns false when none
    /// is pending.
    pub fn resolve_publish(&self, address: &ChannelAddress, result: Result<(), BackendError>) -> bool {
        let pending = {
            let mut state = self.state();
            let position = state.pending_publishes.iter().position(|(a, _)| a == address);
            position.map(|i| state.pending_publishes.remove(i))
        };
        match pending {
            Some((address, tx)) => {
                let _ = tx.send(result.map(|()| Subscription::new(address)));
                true
            }
            None => false,
        }
    }

    pub fn pending_publish_count(&self) -> usize {
        self.state().pending_publishes.len()
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.state().publishes.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.state().publishes.len()
    }

    pub fn unpublished(&self) -> Vec<ChannelAddress> {
        self.state().unpublished.clone()
    }

    pub fn set_leave_mode(&self, mode: LeaveMode) {
        self.state().leave_mode = mode;
    }

    pub fn leaves(&self) -> Vec<ChannelAddress> {
        self.state().leaves.clone()
    }

    pub fn leave_count(&self) -> usize {
        self.state().leaves.len()
    }

    pub fn set_join_fail(&self, fail: bool) {
        self.state().join_fail = fail;
    }

    pub fn joins(&self) -> Vec<ChannelAddress> {
        self.state().joins.clone()
    }

    pub fn set_logs(&self, logs: impl Into<String>) {
        self.state().logs = logs.into();
    }
}

#[async_trait]
impl SessionBackend for FakeBackend {
    async fn open_session(
        &self,
        config: &ConnectionConfiguration,
    ) -> Result<OpenedSession, BackendError> {
        let mut state = self.state();
        if state.reject_open {
            return Err(BackendError::Rejected("session refused".into()));
        }
        state.opened.push(Instant::now());
        state.configurations.push(config.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        if state.auto_ready {
            let _ = tx.send(SessionSignal::Ready);
        }
        state.signals = Some(tx);
        Ok(OpenedSession {
            handle: SessionHandle::generate(),
            signals: rx,
        })
    }

    async fn close_session(&self, _handle: SessionHandle) {
        let mut state = self.state();
        state.closed.push(Instant::now());
        state.signals = None;
    }

    async fn wait_online(&self, _handle: SessionHandle) -> Result<(), BackendError> {
        let rx = {
            let mut state = self.state();
            if !state.manual_online {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.pending_online.push(tx);
            rx
        };
        rx.await
            .map_err(|_| BackendError::Closed("online wait dropped".into()))
    }

    async fn acquire_capture(
        &self,
        _handle: SessionHandle,
        config: &MediaConfiguration,
    ) -> Result<Arc<dyn CaptureResource>, BackendError> {
        let mut state = self.state();
        state.acquire_count += 1;
        if let Some(error) = state.acquire_failures.pop_front() {
            return Err(error);
        }
        let capture = Arc::new(FakeCapture::new(config.clone(), Arc::downgrade(&self.state)));
        state.captures.push(capture.clone());
        Ok(capture)
    }

    async fn join(
        &self,
        _handle: SessionHandle,
        target: &ChannelTarget,
    ) -> Result<Subscription, BackendError> {
        let mut state = self.state();
        if state.join_fail {
            return Err(BackendError::Unavailable("room not found".into()));
        }
        state.joins.push(target.address.clone());
        Ok(Subscription::new(target.address.clone()))
    }

    async fn publish(
        &self,
        _handle: SessionHandle,
        target: &ChannelTarget,
        authorization: PublishAuthorization,
        capture: Arc<dyn CaptureResource>,
    ) -> Result<Subscription, BackendError> {
        let rx = {
            let mut state = self.state();
            state.publishes.push(PublishRecord {
                address: target.address.clone(),
                authorization,
                capture: capture.id(),
            });
            match state.publish_mode {
                PublishMode::Ack => return Ok(Subscription::new(target.address.clone())),
                PublishMode::Nack => return Err(BackendError::Rejected("publish refused".into())),
                PublishMode::Gated => {
                    let (tx, rx) = oneshot::channel();
                    state.pending_publishes.push((target.address.clone(), tx));
                    rx
                }
            }
        };
        rx.await
            .unwrap_or_else(|_| Err(BackendError::Closed("publish dropped".into())))
    }

    fn unpublish(&self, subscription: &Subscription) {
        self.state().unpublished.push(subscription.address.clone());
    }

    async fn leave(&self, subscription: Subscription) -> Result<(), BackendError> {
        let mode = {
            let mut state = self.state();
            state.leaves.push(subscription.address.clone());
            state.leave_mode
        };
        match mode {
            LeaveMode::Ok => Ok(()),
            LeaveMode::Fail => Err(BackendError::Unavailable("leave refused".into())),
            LeaveMode::Never => std::future::pending().await,
        }
    }

    async fn collect_logs(&self, _handle: SessionHandle) -> Result<String, BackendError> {
        Ok(self.state().logs.clone())
    }
}

#[derive(Default)]
struct CaptureInner {
    apply_calls: usize,
    disposed: usize,
    renderer: Option<RenderTarget>,
    preview: bool,
    track_enabled: HashMap<TrackKind, bool>,
    activity: HashMap<TrackKind, mpsc::UnboundedSender<()>>,
}

/// Capture handed out by [`FakeBackend`].
pub struct FakeCapture {
    id: CaptureId,
    config: Mutex<MediaConfiguration>,
    inner: Mutex<CaptureInner>,
    backend: Weak<Mutex<FakeState>>,
}

impl FakeCapture {
    fn new(config: MediaConfiguration, backend: Weak<Mutex<FakeState>>) -> Self {
        Self {
            id: CaptureId::generate(),
            config: Mutex::new(config),
            inner: Mutex::new(CaptureInner::default()),
            backend,
        }
    }

    pub fn config(&self) -> MediaConfiguration {
        lock(&self.config).clone()
    }

    pub fn apply_calls(&self) -> usize {
        lock(&self.inner).apply_calls
    }

    pub fn disposed_count(&self) -> usize {
        lock(&self.inner).disposed
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed_count() > 0
    }

    pub fn renderer(&self) -> Option<RenderTarget> {
        lock(&self.inner).renderer.clone()
    }

    pub fn preview_active(&self) -> bool {
        lock(&self.inner).preview
    }

    pub fn track_enabled(&self, track: TrackKind) -> bool {
        lock(&self.inner).track_enabled.get(&track).copied().unwrap_or(true)
    }

    /// Simulate one frame/packet on `track`. Returns false when nobody watches it.
    pub fn emit_activity(&self, track: TrackKind) -> bool {
        lock(&self.inner)
            .activity
            .get(&track)
            .is_some_and(|tx| tx.send(()).is_ok())
    }

    fn offers(&self, track: TrackKind) -> bool {
        let config = lock(&self.config);
        match track {
            TrackKind::Audio => config.microphone_enabled,
            TrackKind::Video => config.wants_video(),
        }
    }
}

impl CaptureResource for FakeCapture {
    fn id(&self) -> CaptureId {
        self.id
    }

    fn apply_configuration(&self, config: &MediaConfiguration) -> Result<(), BackendError> {
        lock(&self.inner).apply_calls += 1;
        let accept = self
            .backend
            .upgrade()
            .is_some_and(|state| lock(&state).accept_apply);
        if !accept {
            return Err(BackendError::BadRequest("option not mutable on a live stream".into()));
        }
        *lock(&self.config) = config.clone();
        Ok(())
    }

    fn set_track_enabled(&self, track: TrackKind, enabled: bool) {
        lock(&self.inner).track_enabled.insert(track, enabled);
    }

    fn attach_renderer(&self, target: &RenderTarget) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        if inner.disposed > 0 {
            return Err(BackendError::Closed("capture disposed".into()));
        }
        inner.renderer = Some(target.clone());
        Ok(())
    }

    fn detach_renderer(&self) {
        let mut inner = lock(&self.inner);
        inner.renderer = None;
        inner.preview = false;
    }

    fn start_preview(&self) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        if inner.renderer.is_none() {
            return Err(BackendError::BadRequest("no renderer attached".into()));
        }
        inner.preview = true;
        Ok(())
    }

    fn stop_preview(&self) {
        lock(&self.inner).preview = false;
    }

    fn activity(&self, track: TrackKind) -> Option<mpsc::UnboundedReceiver<()>> {
        if self.is_disposed() || !self.offers(track) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner).activity.insert(track, tx);
        Some(rx)
    }

    fn dispose(&self) {
        let mut inner = lock(&self.inner);
        inner.disposed += 1;
        inner.renderer = None;
        inner.preview = false;
        inner.activity.clear();
    }
}
