use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{SessionBackend, SessionHandle, SessionSignal};
use crate::config::ConnectionConfiguration;
use crate::errors::{BackendError, PublisherError};
use crate::event_bus::EventBus;
use crate::events::{PublisherEvent, SessionState};
use crate::notice::{Notice, NoticeSender};

/// Owns the backend session lifecycle.
///
/// Uninitialized → Initializing → Ready, with Failed as a terminal state
/// until the next `initialize`. Changing the connection configuration tears
/// the session down and reopens it after a cool-down.
pub struct SessionManager {
    backend: Arc<dyn SessionBackend>,
    cool_down: Duration,
    notices: NoticeSender,
    state_bus: EventBus<SessionState>,
    events: EventBus<PublisherEvent>,
    errors: EventBus<PublisherError>,
    state: SessionState,
    /// Configuration of the session currently open (or opening).
    active: Option<ConnectionConfiguration>,
    /// Last configuration asked for, kept even when the backend rejected it.
    requested: Option<ConnectionConfiguration>,
    handle: Option<SessionHandle>,
    /// Bumped on every open/close so late signals from an old session are dropped.
    generation: u64,
    signal_pump: Option<JoinHandle<()>>,
    online_wait: Option<JoinHandle<()>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn SessionBackend>, cool_down: Duration, notices: NoticeSender) -> Self {
        let state_bus = EventBus::new();
        state_bus.publish(SessionState::Uninitialized);
        Self {
            backend,
            cool_down,
            notices,
            state_bus,
            events: EventBus::new(),
            errors: EventBus::new(),
            state: SessionState::Uninitialized,
            active: None,
            requested: None,
            handle: None,
            generation: 0,
            signal_pump: None,
            online_wait: None,
        }
    }

    pub fn state_bus(&self) -> &EventBus<SessionState> {
        &self.state_bus
    }

    pub fn events(&self) -> &EventBus<PublisherEvent> {
        &self.events
    }

    pub fn errors(&self) -> &EventBus<PublisherError> {
        &self.errors
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Handle usable by capture and publish, only while Ready.
    pub fn ready_handle(&self) -> Option<SessionHandle> {
        self.handle.filter(|_| self.is_ready())
    }

    pub fn requested_configuration(&self) -> Option<&ConnectionConfiguration> {
        self.requested.as_ref()
    }

    /// Open a session for `config`, replacing any existing one.
    ///
    /// No-op when `config` matches the current one and the session is Ready
    /// or Initializing, or when `config` is invalid.
    pub async fn initialize(&mut self, config: ConnectionConfiguration) {
        if self.accept(&config) {
            self.open(config).await;
        }
    }

    /// Decide whether `config` should (re)open the session. Records it as
    /// the requested configuration only when it is valid.
    pub fn accept(&mut self, config: &ConnectionConfiguration) -> bool {
        let unchanged = self.active.as_ref() == Some(config);
        if unchanged && matches!(self.state, SessionState::Ready | SessionState::Initializing) {
            debug!(state = ?self.state, "connection configuration unchanged, ignoring initialize");
            return false;
        }
        if let Err(e) = config.validate() {
            error!("refusing to initialize: {e}");
            self.errors.publish(PublisherError::FailedToInitialize {
                reason: e.to_string(),
            });
            return false;
        }
        self.requested = Some(config.clone());
        true
    }

    /// Whether a backend session is open, Ready or not.
    pub fn has_session(&self) -> bool {
        self.handle.is_some()
    }

    /// Replace any existing session with one for an accepted `config`.
    /// Closing a session is followed by the cool-down.
    pub async fn open(&mut self, config: ConnectionConfiguration) {
        if self.teardown().await {
            info!(cool_down_ms = self.cool_down.as_millis() as u64, "session torn down, cooling down");
            self.set_state(SessionState::Uninitialized);
            tokio::time::sleep(self.cool_down).await;
        }

        self.generation += 1;
        self.active = Some(config.clone());
        self.set_state(SessionState::Initializing);
        info!(generation = self.generation, "opening backend session");

        match self.backend.open_session(&config).await {
            Ok(opened) => {
                self.handle = Some(opened.handle);
                let generation = self.generation;
                let notices = self.notices.clone();
                let mut signals = opened.signals;
                self.signal_pump = Some(tokio::spawn(async move {
                    while let Some(signal) = signals.recv().await {
                        if notices.send(Notice::Session { generation, signal }).is_err() {
                            break;
                        }
                    }
                }));
                debug!(handle = %opened.handle, "backend accepted session");
            }
            Err(e) => {
                error!("backend rejected session: {e}");
                self.active = None;
                self.set_state(SessionState::Uninitialized);
                self.errors.publish(PublisherError::FailedToInitialize {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Make sure a session exists and a wait for the backend's online
    /// notification is in flight. A Failed session is never reopened here. The wait is never cancelled; its result
    /// comes back as [`Notice::Online`].
    pub async fn ensure_online(&mut self) {
        if self.state == SessionState::Failed {
            warn!("session failed, it must be released before initializing again");
            self.errors.publish(PublisherError::FailedToInitialize {
                reason: "session failed".into(),
            });
            return;
        }
        if self.state == SessionState::Uninitialized {
            match self.requested.clone() {
                Some(config) => {
                    self.active = None;
                    self.initialize(config).await;
                }
                None => {
                    warn!("no connection configuration to initialize with");
                    self.errors.publish(PublisherError::FailedToInitialize {
                        reason: "no connection configuration".into(),
                    });
                    return;
                }
            }
        }

        if self.state != SessionState::Initializing || self.online_wait.is_some() {
            return;
        }
        let Some(handle) = self.handle else {
            return;
        };

        let backend = self.backend.clone();
        let notices = self.notices.clone();
        let generation = self.generation;
        debug!(generation, "waiting for backend to come online");
        self.online_wait = Some(tokio::spawn(async move {
            let result = backend.wait_online(handle).await;
            let _ = notices.send(Notice::Online { generation, result });
        }));
    }

    pub fn handle_signal(&mut self, generation: u64, signal: SessionSignal) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "dropping signal from old session");
            return;
        }
        match signal {
            SessionSignal::Ready => self.mark_ready(),
            SessionSignal::Unrecoverable(reason) => {
                error!("backend session is unrecoverable: {reason}");
                self.set_state(SessionState::Failed);
                self.errors.publish(PublisherError::SessionUnrecoverable { reason });
            }
        }
    }

    pub fn handle_online(&mut self, generation: u64, result: Result<(), BackendError>) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "dropping online result from old session");
            return;
        }
        self.online_wait = None;
        match result {
            Ok(()) => self.mark_ready(),
            Err(e) => warn!("waiting for online failed: {e}"),
        }
    }

    /// Close the session and forget the configuration.
    pub async fn release(&mut self) {
        self.teardown().await;
        self.active = None;
        self.requested = None;
        self.set_state(SessionState::Uninitialized);
    }

    fn mark_ready(&mut self) {
        if self.state != SessionState::Initializing {
            debug!(state = ?self.state, "ignoring ready notification");
            return;
        }
        info!(generation = self.generation, "backend session ready");
        self.set_state(SessionState::Ready);
        self.events.publish(PublisherEvent::SessionReady);
    }

    /// Returns whether a backend session was actually closed.
    async fn teardown(&mut self) -> bool {
        if let Some(pump) = self.signal_pump.take() {
            pump.abort();
        }
        // The in-flight online wait is left running; its result is stale
        // once the generation moves on.
        self.online_wait = None;
        let Some(handle) = self.handle.take() else {
            return false;
        };
        self.generation += 1;
        info!(%handle, "closing backend session");
        self.backend.close_session(handle).await;
        true
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.state_bus.publish(state);
    }
}
