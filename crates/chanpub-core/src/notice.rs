use tokio::sync::mpsc;

use crate::backend::{CaptureId, SessionSignal, Subscription};
use crate::config::{ChannelAddress, TrackKind};
use crate::errors::BackendError;

/// Completions re-entering the orchestrator's sequential context.
///
/// Backend callbacks, spawned waits and watchdog timers never touch shared
/// state themselves; they post one of these and the owning task applies it.
#[derive(Debug)]
pub enum Notice {
    Session {
        generation: u64,
        signal: SessionSignal,
    },
    Online {
        generation: u64,
        result: Result<(), BackendError>,
    },
    PublishSettled {
        address: ChannelAddress,
        attempt: u64,
        result: Result<Subscription, BackendError>,
    },
    TrackSilent {
        capture: CaptureId,
        track: TrackKind,
    },
}

pub type NoticeSender = mpsc::UnboundedSender<Notice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

pub fn channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}
