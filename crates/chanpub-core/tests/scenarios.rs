use std::sync::Arc;
use std::time::Duration;

use chanpub_core::backend::SessionSignal;
use chanpub_core::testing::{FakeBackend, LeaveMode, PublishMode};
use chanpub_core::{
    BackendError, CaptureResource, ChannelAddress, ChannelTarget, ConnectionConfiguration, MediaConfiguration,
    Orchestrator, OrchestratorConfig, PublishState, PublisherError, PublisherEvent, RenderTarget,
    SessionState, Subscription, TrackKind,
};

fn orchestrator(fake: &FakeBackend) -> Orchestrator {
    Orchestrator::new(Arc::new(fake.clone()), OrchestratorConfig::default())
}

fn orchestrator_without_cool_down(fake: &FakeBackend) -> Orchestrator {
    Orchestrator::new(
        Arc::new(fake.clone()),
        OrchestratorConfig {
            cool_down: Duration::ZERO,
            ..Default::default()
        },
    )
}

fn cfg_a() -> ConnectionConfiguration {
    ConnectionConfiguration::with_backend("https://a.example.com/pcast")
}

fn cfg_b() -> ConnectionConfiguration {
    ConnectionConfiguration::with_edge_token("edge-b")
}

fn news() -> ChannelAddress {
    ChannelAddress::Alias("news".into())
}

async fn ready(orch: &Orchestrator) {
    orch.initialize(cfg_a()).await.unwrap();
    assert!(orch.wait_until_ready(Duration::from_secs(5)).await);
}

async fn wait_for_state(states: &mut Subscription<SessionState>, wanted: SessionState) {
    while let Some(state) = states.recv().await {
        if state == wanted {
            return;
        }
    }
    panic!("session state stream ended before {wanted:?}");
}

async fn wait_for_publish(orch: &Orchestrator, address: &ChannelAddress, wanted: PublishState) {
    let mut states = orch.publish_states().subscribe();
    while let Some(snapshot) = states.recv().await {
        if snapshot.get(address) == Some(&wanted) {
            return;
        }
    }
    panic!("publish state stream ended before {wanted:?}");
}

#[tokio::test(start_paused = true)]
async fn changing_configuration_before_ready_tears_down_once_and_cools_down_once() {
    let fake = FakeBackend::new();
    fake.set_auto_ready(false);
    let orch = orchestrator(&fake);

    orch.initialize(cfg_a()).await.unwrap();
    orch.initialize(cfg_b()).await.unwrap();

    assert_eq!(fake.open_count(), 2);
    assert_eq!(fake.close_count(), 1);
    let gap = fake.opened_at(1).unwrap() - fake.closed_at(0).unwrap();
    assert!(gap >= Duration::from_secs(1));
    assert!(gap < Duration::from_secs(2));
    assert_eq!(fake.opened_configurations(), vec![cfg_a(), cfg_b()]);
}

#[tokio::test]
async fn same_configuration_twice_does_not_reconnect() {
    let fake = FakeBackend::new();
    let orch = orchestrator(&fake);

    ready(&orch).await;
    orch.initialize(cfg_a()).await.unwrap();

    assert_eq!(fake.open_count(), 1);
    assert_eq!(fake.close_count(), 0);
    assert!(orch.is_ready());
}

#[tokio::test]
async fn in_place_reconfiguration_keeps_stream_and_renderer() {
    let fake = FakeBackend::new();
    let orch = orchestrator(&fake);
    ready(&orch).await;
    orch.set_render_target(RenderTarget::new("preview")).await.unwrap();
    orch.acquire(MediaConfiguration::default()).await.unwrap();

    orch.set_media_configuration(MediaConfiguration {
        frame_rate: 30.0,
        ..Default::default()
    })
    .await
    .unwrap();

    let captures = fake.captures();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].disposed_count(), 0);
    assert_eq!(captures[0].config().frame_rate, 30.0);
    assert_eq!(captures[0].renderer(), Some(RenderTarget::new("preview")));
}

#[tokio::test]
async fn refused_reconfiguration_recreates_exactly_once() {
    let fake = FakeBackend::new();
    let orch = orchestrator(&fake);
    ready(&orch).await;
    orch.set_render_target(RenderTarget::new("preview")).await.unwrap();
    orch.acquire(MediaConfiguration::default()).await.unwrap();
    fake.set_accept_apply(false);
    let mut events = orch.events().subscribe();
    events.drain();

    orch.set_media_configuration(MediaConfiguration {
        video_enabled: false,
        ..Default::default()
    })
    .await
    .unwrap();

    let captures = fake.captures();
    assert_eq!(captures.len(), 2);
    assert_eq!(captures[0].disposed_count(), 1);
    assert!(!captures[1].is_disposed());
    assert!(!captures[1].config().video_enabled);
    assert_eq!(captures[1].renderer(), Some(RenderTarget::new("preview")));
    assert_eq!(events.drain(), vec![PublisherEvent::CaptureRecreated]);
}

#[tokio::test]
async fn concurrent_publishes_to_one_target_yield_one_attempt() {
    let fake = FakeBackend::new();
    fake.set_publish_mode(PublishMode::Gated);
    let orch = orchestrator(&fake);
    ready(&orch).await;
    orch.acquire(MediaConfiguration::default()).await.unwrap();
    let mut events = orch.events().subscribe();
    events.drain();

    let first = orch.clone();
    let second = orch.clone();
    let (a, b) = tokio::join!(
        first.publish(ChannelTarget::alias("news")),
        second.publish(ChannelTarget::alias("news"))
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(events.drain(), vec![PublisherEvent::Publishing(news())]);
    while fake.pending_publish_count() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(fake.resolve_publish(&news(), Ok(())));
    wait_for_publish(&orch, &news(), PublishState::Published).await;
    assert_eq!(fake.publish_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_ends_when_leave_never_answers() {
    let fake = FakeBackend::new();
    fake.set_leave_mode(LeaveMode::Never);
    let orch = orchestrator(&fake);
    ready(&orch).await;
    orch.acquire(MediaConfiguration::default()).await.unwrap();
    orch.publish(ChannelTarget::alias("news")).await.unwrap();
    wait_for_publish(&orch, &news(), PublishState::Published).await;

    orch.stop(news()).await.unwrap();

    assert_eq!(orch.publish_state(&news()), Some(PublishState::Ended));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(orch.publish_state(&news()), Some(PublishState::Ended));
    assert_eq!(fake.leave_count(), 1);
}

#[tokio::test]
async fn stop_ends_when_leave_fails() {
    let fake = FakeBackend::new();
    fake.set_leave_mode(LeaveMode::Fail);
    let orch = orchestrator(&fake);
    ready(&orch).await;
    orch.acquire(MediaConfiguration::default()).await.unwrap();
    orch.publish(ChannelTarget::alias("news")).await.unwrap();
    wait_for_publish(&orch, &news(), PublishState::Published).await;
    let mut errors = orch.errors().subscribe();

    orch.stop(news()).await.unwrap();

    assert_eq!(orch.publish_state(&news()), Some(PublishState::Ended));
    assert!(errors.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn watchdog_reports_silent_track_only() {
    let fake = FakeBackend::new();
    let orch = orchestrator(&fake);
    ready(&orch).await;
    let mut events = orch.events().subscribe();
    orch.acquire(MediaConfiguration::default()).await.unwrap();
    let capture = fake.latest_capture().unwrap();

    let feeder = {
        let capture = capture.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                capture.emit_activity(TrackKind::Audio);
            }
        })
    };

    let failure = loop {
        match events.recv().await.unwrap() {
            PublisherEvent::DeviceFailure(track) => break track,
            _ => continue,
        }
    };
    assert_eq!(failure, TrackKind::Video);
    // any later command runs after the failure notice disabled the track
    orch.set_preview_enabled(false).await.unwrap();
    assert!(!capture.track_enabled(TrackKind::Video));
    assert!(capture.track_enabled(TrackKind::Audio));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(
        !events
            .drain()
            .contains(&PublisherEvent::DeviceFailure(TrackKind::Audio))
    );
    feeder.abort();
}

#[tokio::test]
async fn publish_happy_path_is_observable() {
    let fake = FakeBackend::new();
    let orch = orchestrator(&fake);
    let mut events = orch.events().subscribe();

    ready(&orch).await;
    orch.acquire(MediaConfiguration::default()).await.unwrap();
    orch.publish(ChannelTarget::alias("news")).await.unwrap();
    wait_for_publish(&orch, &news(), PublishState::Published).await;

    let seen: Vec<PublisherEvent> = events
        .drain()
        .into_iter()
        .filter(|e| *e != PublisherEvent::CaptureAcquired)
        .collect();
    assert_eq!(seen, vec![
        PublisherEvent::SessionReady,
        PublisherEvent::Publishing(news()),
        PublisherEvent::Published(news()),
    ]);
    assert_eq!(orch.publish_state(&news()), Some(PublishState::Published));
}

#[tokio::test]
async fn acquisition_failures_leave_session_ready() {
    let fake = FakeBackend::new();
    fake.push_acquire_failure(BackendError::Unavailable("camera busy".into()));
    fake.push_acquire_failure(BackendError::Unavailable("camera busy".into()));
    let orch = orchestrator(&fake);
    ready(&orch).await;
    let mut errors = orch.errors().subscribe();

    orch.acquire(MediaConfiguration::default()).await.unwrap();
    orch.acquire(MediaConfiguration::default()).await.unwrap();

    let errors = errors.drain();
    assert_eq!(errors.len(), 2);
    assert!(errors
        .iter()
        .all(|e| matches!(e, PublisherError::DeviceAcquisitionFailed { .. })));
    assert_eq!(orch.session_state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn ready_timeout_reports_and_late_online_still_counts() {
    let fake = FakeBackend::new();
    fake.set_auto_ready(false);
    fake.set_manual_online(true);
    let orch = orchestrator(&fake);
    let mut errors = orch.errors().subscribe();
    let mut states = orch.session_states().subscribe();
    orch.initialize(cfg_a()).await.unwrap();

    assert!(!orch.wait_until_ready(Duration::from_secs(2)).await);
    assert_eq!(
        errors.drain(),
        vec![PublisherError::NetworkTimeout { waited_ms: 2000 }]
    );
    assert_eq!(orch.session_state(), SessionState::Initializing);

    fake.bring_online();
    wait_for_state(&mut states, SessionState::Ready).await;
    assert!(orch.is_ready());
    assert_eq!(fake.open_count(), 1);
}

#[tokio::test]
async fn unrecoverable_session_is_not_retried() {
    let fake = FakeBackend::new();
    let orch = orchestrator(&fake);
    let mut errors = orch.errors().subscribe();
    let mut states = orch.session_states().subscribe();
    ready(&orch).await;

    fake.signal(SessionSignal::Unrecoverable("stream ended".into()));
    wait_for_state(&mut states, SessionState::Failed).await;

    assert_eq!(
        errors.drain(),
        vec![PublisherError::SessionUnrecoverable {
            reason: "stream ended".into()
        }]
    );
    assert_eq!(fake.open_count(), 1);

    orch.release().await.unwrap();
    ready(&orch).await;
    assert_eq!(fake.open_count(), 2);
}

#[tokio::test]
async fn flip_camera_reports_new_facing() {
    let fake = FakeBackend::new();
    let orch = orchestrator(&fake);
    ready(&orch).await;
    orch.acquire(MediaConfiguration::default()).await.unwrap();
    let mut events = orch.events().subscribe();
    events.drain();

    orch.flip_camera().await.unwrap();

    assert!(events
        .drain()
        .contains(&PublisherEvent::DeviceFlipped(chanpub_core::CameraFacing::Rear)));
    assert_eq!(
        fake.latest_capture().unwrap().config().camera,
        chanpub_core::CameraFacing::Rear
    );
}

#[tokio::test]
async fn join_all_skips_known_targets() {
    let fake = FakeBackend::new();
    let orch = orchestrator(&fake);
    ready(&orch).await;

    orch.join(ChannelTarget::alias("news")).await.unwrap();
    orch.join_all(vec![ChannelTarget::alias("news"), ChannelTarget::alias("sports")])
        .await
        .unwrap();

    assert_eq!(fake.joins().len(), 2);
    assert_eq!(orch.publish_state(&news()), Some(PublishState::Idle));
}

async fn publishing_on_news(orch: &Orchestrator) {
    orch.acquire(MediaConfiguration::default()).await.unwrap();
    orch.publish(ChannelTarget::alias("news")).await.unwrap();
    wait_for_publish(orch, &news(), PublishState::Published).await;
}

#[tokio::test]
async fn reconnect_moves_capture_to_new_session() {
    let fake = FakeBackend::new();
    let orch = orchestrator_without_cool_down(&fake);
    ready(&orch).await;
    orch.set_render_target(RenderTarget::new("self-view")).await.unwrap();
    orch.set_device_enabled(TrackKind::Audio, false).await.unwrap();
    publishing_on_news(&orch).await;
    let old = fake.latest_capture().unwrap();

    orch.initialize(cfg_b()).await.unwrap();
    assert!(old.is_disposed());
    assert_eq!(orch.publish_state(&news()), None);
    assert_eq!(fake.unpublished(), vec![news()]);

    assert!(orch.wait_until_ready(Duration::from_secs(5)).await);
    orch.publish(ChannelTarget::alias("news")).await.unwrap();
    wait_for_publish(&orch, &news(), PublishState::Published).await;

    assert_eq!(fake.close_count(), 1);
    assert_eq!(fake.acquire_count(), 2);
    let fresh = fake.latest_capture().unwrap();
    assert_ne!(fresh.id(), old.id());
    assert_eq!(fresh.renderer(), Some(RenderTarget::new("self-view")));
    assert!(!fresh.track_enabled(TrackKind::Audio));
    let publishes = fake.publishes();
    assert_eq!(publishes.len(), 2);
    assert_eq!(publishes[1].capture, fresh.id());
}

#[tokio::test]
async fn invalid_initialize_leaves_live_session_untouched() {
    let fake = FakeBackend::new();
    let orch = orchestrator_without_cool_down(&fake);
    ready(&orch).await;
    publishing_on_news(&orch).await;
    let mut errors = orch.errors().subscribe();

    orch.initialize(ConnectionConfiguration::default()).await.unwrap();

    assert!(matches!(
        errors.drain().as_slice(),
        [PublisherError::FailedToInitialize { .. }]
    ));
    assert!(orch.is_ready());
    assert_eq!(fake.close_count(), 0);
    assert_eq!(orch.publish_state(&news()), Some(PublishState::Published));
    assert!(fake.unpublished().is_empty());
    assert!(!fake.latest_capture().unwrap().is_disposed());
}

#[tokio::test]
async fn failed_session_needs_release_before_publishing_again() {
    let fake = FakeBackend::new();
    let orch = orchestrator_without_cool_down(&fake);
    let mut states = orch.session_states().subscribe();
    ready(&orch).await;
    publishing_on_news(&orch).await;
    let mut errors = orch.errors().subscribe();

    fake.signal(SessionSignal::Unrecoverable("stream ended".into()));
    wait_for_state(&mut states, SessionState::Failed).await;

    assert!(!orch.wait_until_ready(Duration::from_secs(1)).await);
    assert_eq!(fake.open_count(), 1);
    assert!(errors
        .drain()
        .iter()
        .any(|e| matches!(e, PublisherError::FailedToInitialize { .. })));

    orch.release().await.unwrap();
    assert_eq!(orch.publish_state(&news()), None);
    ready(&orch).await;
    publishing_on_news(&orch).await;

    assert_eq!(fake.open_count(), 2);
    assert_eq!(fake.publish_count(), 2);
}
