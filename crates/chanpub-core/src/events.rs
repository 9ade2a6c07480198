use std::collections::BTreeMap;

use crate::config::{CameraFacing, ChannelAddress, TrackKind};

/// Lifecycle of the backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    /// Terminal until `initialize` is called again.
    Failed,
}

/// Publish lifecycle of a single channel target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    Publishing,
    Published,
    Failed,
    Ended,
}

impl PublishState {
    /// A publish is in flight or live; a second one must be rejected.
    pub fn is_active(self) -> bool {
        matches!(self, PublishState::Publishing | PublishState::Published)
    }
}

/// Current publish state of every registered target.
pub type PublishStates = BTreeMap<ChannelAddress, PublishState>;

/// Informational state changes broadcast to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherEvent {
    SessionReady,
    CaptureAcquired,
    /// The live stream took the new configuration in place.
    CaptureReconfigured,
    /// The live stream was replaced; active publishes may show a gap.
    CaptureRecreated,
    DeviceFlipped(CameraFacing),
    /// No frames/packets seen on a track within the silence window.
    DeviceFailure(TrackKind),
    ChannelJoined(ChannelAddress),
    Publishing(ChannelAddress),
    Published(ChannelAddress),
    PublishEnded(ChannelAddress),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_publishing_and_published_are_active() {
        assert!(PublishState::Publishing.is_active());
        assert!(PublishState::Published.is_active());
        assert!(!PublishState::Idle.is_active());
        assert!(!PublishState::Failed.is_active());
        assert!(!PublishState::Ended.is_active());
    }
}
