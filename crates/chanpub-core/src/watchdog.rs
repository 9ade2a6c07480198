use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::CaptureId;
use crate::config::TrackKind;
use crate::notice::{Notice, NoticeSender};

/// Silence timer for one capture track.
///
/// The timer restarts on every activity message. When `window` passes
/// without any, a [`Notice::TrackSilent`] is posted and the watchdog waits
/// for activity to resume before arming again. The task ends when the
/// activity channel closes or the notice channel is gone; abort the handle
/// to stop it earlier.
pub fn spawn_watchdog(
    capture: CaptureId,
    track: TrackKind,
    mut activity: mpsc::UnboundedReceiver<()>,
    window: Duration,
    notices: NoticeSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(window, activity.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    tracing::debug!(%capture, %track, "activity channel closed, watchdog stopping");
                    return;
                }
                Err(_) => {
                    tracing::warn!(%capture, %track, window_ms = window.as_millis() as u64, "no activity on track");
                    if notices.send(Notice::TrackSilent { capture, track }).is_err() {
                        return;
                    }
                    if activity.recv().await.is_none() {
                        return;
                    }
                    tracing::debug!(%capture, %track, "activity resumed, watchdog re-armed");
                }
            }
        }
    })
}
