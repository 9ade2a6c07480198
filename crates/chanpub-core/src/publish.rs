use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{CaptureResource, SessionBackend, SessionHandle, Subscription};
use crate::config::{ChannelAddress, ChannelTarget};
use crate::errors::{BackendError, PublisherError};
use crate::event_bus::EventBus;
use crate::events::{PublishState, PublishStates, PublisherEvent};
use crate::notice::{Notice, NoticeSender};

/// One registered channel target.
struct Entry {
    target: ChannelTarget,
    state: PublishState,
    /// Association from a passive `join`.
    joined: Option<Subscription>,
    /// Association from an acknowledged publish.
    published: Option<Subscription>,
    /// Identifies the publish request whose acknowledgment is awaited.
    attempt: u64,
}

impl Entry {
    fn new(target: ChannelTarget) -> Self {
        Self {
            target,
            state: PublishState::Idle,
            joined: None,
            published: None,
            attempt: 0,
        }
    }
}

/// Joins channels and publishes the capture stream to them.
///
/// Targets are keyed by alias or stream id. At most one publish per target
/// is in flight or live at a time.
pub struct PublishCoordinator {
    backend: Arc<dyn SessionBackend>,
    leave_timeout: Duration,
    notices: NoticeSender,
    events: EventBus<PublisherEvent>,
    errors: EventBus<PublisherError>,
    state_bus: EventBus<PublishStates>,
    entries: BTreeMap<ChannelAddress, Entry>,
    next_attempt: u64,
}

impl PublishCoordinator {
    pub fn new(backend: Arc<dyn SessionBackend>, leave_timeout: Duration, notices: NoticeSender) -> Self {
        let state_bus = EventBus::new();
        state_bus.publish(PublishStates::new());
        Self {
            backend,
            leave_timeout,
            notices,
            events: EventBus::new(),
            errors: EventBus::new(),
            state_bus,
            entries: BTreeMap::new(),
            next_attempt: 1,
        }
    }

    pub fn events(&self) -> &EventBus<PublisherEvent> {
        &self.events
    }

    pub fn errors(&self) -> &EventBus<PublisherError> {
        &self.errors
    }

    /// Snapshot of every target's state, republished on each change.
    pub fn state_bus(&self) -> &EventBus<PublishStates> {
        &self.state_bus
    }

    pub fn state(&self, address: &ChannelAddress) -> Option<PublishState> {
        self.entries.get(address).map(|e| e.state)
    }

    pub fn states(&self) -> PublishStates {
        self.entries
            .iter()
            .map(|(address, entry)| (address.clone(), entry.state))
            .collect()
    }

    pub fn is_registered(&self, address: &ChannelAddress) -> bool {
        self.entries.contains_key(address)
    }

    /// Register `target` for passive viewing. Re-joining a registered target
    /// is a no-op.
    pub async fn join(&mut self, handle: Option<SessionHandle>, target: ChannelTarget) -> bool {
        let address = target.address.clone();
        if self.entries.contains_key(&address) {
            tracing::debug!(%address, "already joined");
            return true;
        }
        let Some(handle) = handle else {
            self.join_failed(address, "session is not ready".into());
            return false;
        };

        match self.backend.join(handle, &target).await {
            Ok(subscription) => {
                tracing::info!(%address, "channel joined");
                let mut entry = Entry::new(target);
                entry.joined = Some(subscription);
                self.entries.insert(address.clone(), entry);
                self.events.publish(PublisherEvent::ChannelJoined(address));
                self.publish_states();
                true
            }
            Err(e) => {
                self.join_failed(address, e.to_string());
                false
            }
        }
    }

    /// Join every target in order; returns how many are registered afterwards.
    pub async fn join_all(&mut self, handle: Option<SessionHandle>, targets: Vec<ChannelTarget>) -> usize {
        let mut joined = 0;
        for target in targets {
            if self.join(handle, target).await {
                joined += 1;
            }
        }
        joined
    }

    /// Start publishing `capture` to `target`.
    ///
    /// Returns false, with no side effect, when the target already has a
    /// publish in flight or live. The backend acknowledgment arrives later as
    /// [`Notice::PublishSettled`].
    pub fn publish(
        &mut self,
        handle: Option<SessionHandle>,
        capture: Option<Arc<dyn CaptureResource>>,
        target: ChannelTarget,
    ) -> bool {
        let address = target.address.clone();
        if let Some(state) = self.state(&address).filter(|s| s.is_active()) {
            tracing::warn!(%address, ?state, "publish already active, rejecting duplicate");
            return false;
        }

        let (handle, capture) = match (handle, capture) {
            (Some(handle), Some(capture)) => (handle, capture),
            (None, _) => {
                self.fail_early(target, "session is not ready");
                return true;
            }
            (_, None) => {
                self.fail_early(target, "no capture stream");
                return true;
            }
        };

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        let authorization = target.authorization();
        let entry = self
            .entries
            .entry(address.clone())
            .or_insert_with(|| Entry::new(target.clone()));
        entry.target = target.clone();
        entry.state = PublishState::Publishing;
        entry.attempt = attempt;
        entry.published = None;

        tracing::info!(%address, attempt, capture = %capture.id(), "publishing");
        self.events.publish(PublisherEvent::Publishing(address.clone()));
        self.publish_states();

        let backend = self.backend.clone();
        let notices = self.notices.clone();
        tokio::spawn(async move {
            let result = backend.publish(handle, &target, authorization, capture).await;
            let _ = notices.send(Notice::PublishSettled {
                address,
                attempt,
                result,
            });
        });
        true
    }

    /// Apply a backend publish acknowledgment.
    pub fn handle_settled(
        &mut self,
        address: ChannelAddress,
        attempt: u64,
        result: Result<Subscription, BackendError>,
    ) {
        let entry = self
            .entries
            .get_mut(&address)
            .filter(|e| e.attempt == attempt && e.state == PublishState::Publishing);
        let Some(entry) = entry else {
            tracing::debug!(%address, attempt, "publish acknowledgment no longer awaited");
            if let Ok(subscription) = result {
                self.backend.unpublish(&subscription);
                self.spawn_leave(subscription);
            }
            return;
        };

        match result {
            Ok(subscription) => {
                tracing::info!(%address, attempt, "published");
                entry.state = PublishState::Published;
                entry.published = Some(subscription);
                self.events.publish(PublisherEvent::Published(address));
            }
            Err(e) => {
                tracing::error!(%address, attempt, "publish failed: {e}");
                entry.state = PublishState::Failed;
                self.errors.publish(PublisherError::PublishFailed {
                    target: address,
                    reason: e.to_string(),
                });
            }
        }
        self.publish_states();
    }

    /// Stop publishing to `address` and leave the channel.
    ///
    /// The target reaches Ended right away; leave acknowledgments are
    /// awaited in the background, bounded by the leave timeout, and their
    /// failures are only logged.
    pub fn stop(&mut self, address: &ChannelAddress) -> bool {
        let Some(entry) = self.entries.get_mut(address) else {
            tracing::debug!(%address, "stop for unknown target");
            return false;
        };
        if entry.state == PublishState::Ended {
            tracing::debug!(%address, "already ended");
            return true;
        }

        let previous = entry.state;
        entry.state = PublishState::Ended;
        let published = entry.published.take();
        let joined = entry.joined.take();
        tracing::info!(%address, ?previous, "stopping");

        if let Some(subscription) = published {
            self.backend.unpublish(&subscription);
            self.spawn_leave(subscription);
        }
        if let Some(subscription) = joined {
            self.spawn_leave(subscription);
        }
        self.events.publish(PublisherEvent::PublishEnded(address.clone()));
        self.publish_states();
        true
    }

    /// Stop every target and forget all registrations.
    pub fn release(&mut self) {
        let addresses: Vec<ChannelAddress> = self.entries.keys().cloned().collect();
        for address in &addresses {
            self.stop(address);
        }
        if !self.entries.is_empty() {
            self.entries.clear();
            self.publish_states();
        }
    }

    fn fail_early(&mut self, target: ChannelTarget, reason: &str) {
        let address = target.address.clone();
        tracing::error!(%address, "cannot publish: {reason}");
        let entry = self
            .entries
            .entry(address.clone())
            .or_insert_with(|| Entry::new(target));
        entry.state = PublishState::Failed;
        self.errors.publish(PublisherError::PublishFailed {
            target: address,
            reason: reason.to_string(),
        });
        self.publish_states();
    }

    fn join_failed(&self, address: ChannelAddress, reason: String) {
        tracing::error!(%address, "join failed: {reason}");
        self.errors.publish(PublisherError::JoinFailed {
            target: address,
            reason,
        });
    }

    fn spawn_leave(&self, subscription: Subscription) {
        let backend = self.backend.clone();
        let timeout = self.leave_timeout;
        let address = subscription.address.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, backend.leave(subscription)).await {
                Ok(Ok(())) => tracing::debug!(%address, "left channel"),
                Ok(Err(e)) => tracing::warn!(%address, "leave failed: {e}"),
                Err(_) => tracing::warn!(%address, timeout_ms = timeout.as_millis() as u64, "leave not acknowledged"),
            }
        });
    }

    fn publish_states(&self) {
        self.state_bus.publish(self.states());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BitrateMode, MediaConfiguration, PublishAuthorization};
    use crate::notice::{self, NoticeReceiver};
    use crate::testing::{FakeBackend, LeaveMode, PublishMode};

    struct Harness {
        fake: FakeBackend,
        coordinator: PublishCoordinator,
        notices: NoticeReceiver,
        handle: Option<SessionHandle>,
        capture: Option<Arc<dyn CaptureResource>>,
    }

    impl Harness {
        async fn new() -> Self {
            let fake = FakeBackend::new();
            let (tx, rx) = notice::channel();
            let handle = SessionHandle::generate();
            let capture = fake
                .acquire_capture(handle, &MediaConfiguration::default())
                .await
                .unwrap();
            Self {
                coordinator: PublishCoordinator::new(Arc::new(fake.clone()), Duration::from_secs(5), tx),
                fake,
                notices: rx,
                handle: Some(handle),
                capture: Some(capture),
            }
        }

        fn publish(&mut self, target: ChannelTarget) -> bool {
            self.coordinator
                .publish(self.handle, self.capture.clone(), target)
        }

        async fn settle(&mut self) {
            match self.notices.recv().await.unwrap() {
                Notice::PublishSettled {
                    address,
                    attempt,
                    result,
                } => self.coordinator.handle_settled(address, attempt, result),
                other => panic!("unexpected notice {other:?}"),
            }
        }
    }

    async fn run_spawned() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn news() -> ChannelAddress {
        ChannelAddress::Alias("news".into())
    }

    #[tokio::test]
    async fn acknowledged_publish_reaches_published() {
        let mut h = Harness::new().await;
        let mut events = h.coordinator.events().subscribe();

        assert!(h.publish(ChannelTarget::alias("news")));
        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Publishing));
        h.settle().await;

        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Published));
        assert_eq!(events.drain(), vec![
            PublisherEvent::Publishing(news()),
            PublisherEvent::Published(news())
        ]);
        assert_eq!(
            h.coordinator.state_bus().latest().unwrap().get(&news()),
            Some(&PublishState::Published)
        );
    }

    #[tokio::test]
    async fn refused_publish_fails_with_target() {
        let mut h = Harness::new().await;
        h.fake.set_publish_mode(PublishMode::Nack);
        let mut errors = h.coordinator.errors().subscribe();

        h.publish(ChannelTarget::alias("news"));
        h.settle().await;

        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Failed));
        match errors.drain().as_slice() {
            [PublisherError::PublishFailed { target, .. }] => assert_eq!(target, &news()),
            other => panic!("unexpected errors {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_publish_is_rejected_without_side_effects() {
        let mut h = Harness::new().await;
        h.fake.set_publish_mode(PublishMode::Gated);
        let mut events = h.coordinator.events().subscribe();

        assert!(h.publish(ChannelTarget::alias("news")));
        assert!(!h.publish(ChannelTarget::alias("news")));
        run_spawned().await;

        assert_eq!(h.fake.publish_count(), 1);
        assert_eq!(events.drain(), vec![PublisherEvent::Publishing(news())]);

        h.fake.resolve_publish(&news(), Ok(()));
        h.settle().await;
        assert!(!h.publish(ChannelTarget::alias("news")));
        assert_eq!(h.fake.publish_count(), 1);
        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Published));
    }

    #[tokio::test]
    async fn token_and_capabilities_are_exclusive() {
        let mut h = Harness::new().await;

        h.publish(
            ChannelTarget::alias("news")
                .with_capabilities(BitrateMode::Mbr.capabilities())
                .with_publish_token("pt"),
        );
        h.publish(ChannelTarget::alias("sports").with_capabilities(BitrateMode::Mbr.capabilities()));
        h.settle().await;
        h.settle().await;

        let records = h.fake.publishes();
        assert!(matches!(records[0].authorization, PublishAuthorization::Token { .. }));
        assert_eq!(
            records[1].authorization,
            PublishAuthorization::Capabilities(vec!["multi-bitrate".into()])
        );
    }

    #[tokio::test]
    async fn publish_without_session_or_capture_fails() {
        let mut h = Harness::new().await;
        let mut errors = h.coordinator.errors().subscribe();

        h.coordinator.publish(None, h.capture.clone(), ChannelTarget::alias("news"));
        h.coordinator.publish(h.handle, None, ChannelTarget::alias("sports"));

        assert_eq!(h.fake.publish_count(), 0);
        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Failed));
        assert_eq!(errors.drain().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_even_when_leave_never_answers() {
        let mut h = Harness::new().await;
        h.fake.set_leave_mode(LeaveMode::Never);
        h.publish(ChannelTarget::alias("news"));
        h.settle().await;
        let mut events = h.coordinator.events().subscribe();
        events.drain();

        assert!(h.coordinator.stop(&news()));

        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Ended));
        assert_eq!(events.drain(), vec![PublisherEvent::PublishEnded(news())]);
        assert_eq!(h.fake.unpublished(), vec![news()]);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.fake.leave_count(), 1);
    }

    #[tokio::test]
    async fn failed_leave_is_not_surfaced() {
        let mut h = Harness::new().await;
        h.fake.set_leave_mode(LeaveMode::Fail);
        h.publish(ChannelTarget::alias("news"));
        h.settle().await;
        let mut errors = h.coordinator.errors().subscribe();

        h.coordinator.stop(&news());
        run_spawned().await;

        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Ended));
        assert_eq!(h.fake.leave_count(), 1);
        assert!(errors.drain().is_empty());
    }

    #[tokio::test]
    async fn late_acknowledgment_after_stop_is_cleaned_up() {
        let mut h = Harness::new().await;
        h.fake.set_publish_mode(PublishMode::Gated);
        h.publish(ChannelTarget::alias("news"));
        run_spawned().await;

        h.coordinator.stop(&news());
        h.fake.resolve_publish(&news(), Ok(()));
        h.settle().await;
        run_spawned().await;

        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Ended));
        assert_eq!(h.fake.unpublished(), vec![news()]);
        assert_eq!(h.fake.leaves(), vec![news()]);
    }

    #[tokio::test]
    async fn ended_target_can_publish_again() {
        let mut h = Harness::new().await;
        h.publish(ChannelTarget::alias("news"));
        h.settle().await;
        h.coordinator.stop(&news());

        assert!(h.publish(ChannelTarget::alias("news")));
        h.settle().await;
        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Published));
        assert_eq!(h.fake.publish_count(), 2);
    }

    #[tokio::test]
    async fn rejoining_is_a_noop() {
        let mut h = Harness::new().await;
        let mut events = h.coordinator.events().subscribe();

        assert!(h.coordinator.join(h.handle, ChannelTarget::alias("news")).await);
        assert!(h.coordinator.join(h.handle, ChannelTarget::alias("news")).await);
        let joined = h
            .coordinator
            .join_all(h.handle, vec![ChannelTarget::alias("news"), ChannelTarget::stream_id("s-1")])
            .await;

        assert_eq!(joined, 2);
        assert_eq!(h.fake.joins(), vec![news(), ChannelAddress::StreamId("s-1".into())]);
        assert_eq!(events.drain(), vec![
            PublisherEvent::ChannelJoined(news()),
            PublisherEvent::ChannelJoined(ChannelAddress::StreamId("s-1".into()))
        ]);
        assert_eq!(h.coordinator.state(&news()), Some(PublishState::Idle));
    }

    #[tokio::test]
    async fn failed_join_reports_target() {
        let mut h = Harness::new().await;
        h.fake.set_join_fail(true);
        let mut errors = h.coordinator.errors().subscribe();

        assert!(!h.coordinator.join(h.handle, ChannelTarget::alias("news")).await);

        assert!(!h.coordinator.is_registered(&news()));
        assert!(matches!(
            errors.drain().as_slice(),
            [PublisherError::JoinFailed { .. }]
        ));
    }

    #[tokio::test]
    async fn release_stops_everything() {
        let mut h = Harness::new().await;
        h.coordinator.join(h.handle, ChannelTarget::alias("lobby")).await;
        h.publish(ChannelTarget::alias("news"));
        h.settle().await;

        h.coordinator.release();
        run_spawned().await;

        assert!(h.coordinator.states().is_empty());
        assert_eq!(h.fake.leave_count(), 2);
        assert_eq!(h.fake.unpublished(), vec![news()]);
    }
}
