//! Configuration values passed into the orchestrator.
//!
//! All of these are plain immutable snapshots. Nothing here is process-global:
//! hosts build a value, hand it to the orchestrator, and build a new one to
//! change anything.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

const DEFAULT_FRAME_RATE: f64 = 15.0;
const DEFAULT_FRAME_HEIGHT: f64 = 360.0;

/// How to reach and authenticate against the streaming backend.
///
/// Compared by value: any difference triggers a teardown and reconnect.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectionConfiguration {
    #[serde(default)]
    pub backend_uri: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub edge_token: Option<String>,
    #[serde(default)]
    pub pcast_uri: Option<String>,
}

/// The effective authentication mode of a [`ConnectionConfiguration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication<'a> {
    AuthToken(&'a str),
    EdgeToken(&'a str),
    BackendUri(&'a str),
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ConnectionConfiguration {
    pub fn with_backend(uri: impl Into<String>) -> Self {
        Self {
            backend_uri: Some(uri.into()),
            ..Default::default()
        }
    }

    pub fn with_edge_token(token: impl Into<String>) -> Self {
        Self {
            edge_token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Auth token wins over edge token, which wins over the backend URI.
    pub fn authentication(&self) -> Option<Authentication<'_>> {
        if let Some(token) = non_blank(&self.auth_token) {
            return Some(Authentication::AuthToken(token));
        }
        if let Some(token) = non_blank(&self.edge_token) {
            return Some(Authentication::EdgeToken(token));
        }
        non_blank(&self.backend_uri).map(Authentication::BackendUri)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authentication().is_none() {
            return Err(ConfigError::InvalidConnection(
                "one of auth token, edge token or backend uri is required".into(),
            ));
        }
        if let Some(uri) = &self.pcast_uri {
            if uri.trim().is_empty() {
                return Err(ConfigError::InvalidConnection("pcast uri is blank".into()));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CameraFacing {
    Front,
    Rear,
    Off,
    Automatic,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EchoCancellation {
    Automatic,
    On,
    Off,
}

/// A capture track.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Full snapshot of the local capture options.
///
/// Reconfiguration always applies a whole snapshot, never a partial diff.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MediaConfiguration {
    #[serde(default = "default_camera")]
    pub camera: CameraFacing,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default = "default_frame_height")]
    pub frame_height: f64,
    #[serde(default = "default_true")]
    pub microphone_enabled: bool,
    #[serde(default = "default_echo_cancellation")]
    pub echo_cancellation: EchoCancellation,
    #[serde(default = "default_true")]
    pub video_enabled: bool,
}

fn default_camera() -> CameraFacing {
    CameraFacing::Front
}

fn default_frame_rate() -> f64 {
    DEFAULT_FRAME_RATE
}

fn default_frame_height() -> f64 {
    DEFAULT_FRAME_HEIGHT
}

fn default_echo_cancellation() -> EchoCancellation {
    EchoCancellation::On
}

fn default_true() -> bool {
    true
}

impl Default for MediaConfiguration {
    fn default() -> Self {
        Self {
            camera: CameraFacing::Front,
            frame_rate: DEFAULT_FRAME_RATE,
            frame_height: DEFAULT_FRAME_HEIGHT,
            microphone_enabled: true,
            echo_cancellation: EchoCancellation::On,
            video_enabled: true,
        }
    }
}

impl MediaConfiguration {
    /// Whether the snapshot asks for a video track at all.
    pub fn wants_video(&self) -> bool {
        self.video_enabled && self.camera != CameraFacing::Off
    }

    /// Same snapshot with the camera switched between front and rear.
    ///
    /// `Automatic` resolves to front and `Off` stays off.
    pub fn flipped(&self) -> Self {
        let camera = match self.camera {
            CameraFacing::Front => CameraFacing::Rear,
            CameraFacing::Rear | CameraFacing::Automatic => CameraFacing::Front,
            CameraFacing::Off => CameraFacing::Off,
        };
        Self {
            camera,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(ConfigError::InvalidMedia(format!(
                "frame rate must be positive, got {}",
                self.frame_rate
            )));
        }
        if !(self.frame_height.is_finite() && self.frame_height > 0.0) {
            return Err(ConfigError::InvalidMedia(format!(
                "frame height must be positive, got {}",
                self.frame_height
            )));
        }
        Ok(())
    }
}

/// Identity of a channel: an alias or an opaque stream id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChannelAddress {
    Alias(String),
    StreamId(String),
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddress::Alias(alias) => write!(f, "alias:{alias}"),
            ChannelAddress::StreamId(id) => write!(f, "stream:{id}"),
        }
    }
}

/// A join/publish destination.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChannelTarget {
    pub address: ChannelAddress,
    #[serde(default)]
    pub stream_token: Option<String>,
    #[serde(default)]
    pub publish_token: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ChannelTarget {
    pub fn alias(alias: impl Into<String>) -> Self {
        Self::new(ChannelAddress::Alias(alias.into()))
    }

    pub fn stream_id(id: impl Into<String>) -> Self {
        Self::new(ChannelAddress::StreamId(id.into()))
    }

    fn new(address: ChannelAddress) -> Self {
        Self {
            address,
            stream_token: None,
            publish_token: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_publish_token(mut self, token: impl Into<String>) -> Self {
        self.publish_token = Some(token.into());
        self
    }

    pub fn with_stream_token(mut self, token: impl Into<String>) -> Self {
        self.stream_token = Some(token.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Token authorization and capability negotiation never mix: a publish
    /// token makes the capability list irrelevant.
    pub fn authorization(&self) -> PublishAuthorization {
        match non_blank(&self.publish_token) {
            Some(token) => PublishAuthorization::Token {
                token: token.to_string(),
                skip_retry_on_unauthorized: true,
            },
            None => PublishAuthorization::Capabilities(self.capabilities.clone()),
        }
    }
}

/// How a publish request is authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishAuthorization {
    Token {
        token: String,
        skip_retry_on_unauthorized: bool,
    },
    Capabilities(Vec<String>),
}

/// Capability presets for publishes without a publish token.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BitrateMode {
    #[default]
    Sbr,
    SbrVp8,
    SbrH264,
    Mbr,
    MbrVp8,
    MbrH264,
}

impl BitrateMode {
    pub fn capabilities(self) -> Vec<String> {
        let caps: &[&str] = match self {
            BitrateMode::Sbr => &[],
            BitrateMode::SbrVp8 => &["prefer-vp8"],
            BitrateMode::SbrH264 => &["prefer-h264"],
            BitrateMode::Mbr => &["multi-bitrate"],
            BitrateMode::MbrVp8 => &["multi-bitrate", "multi-bitrate-codec=vp8"],
            BitrateMode::MbrH264 => &["multi-bitrate", "multi-bitrate-codec=h264"],
        };
        caps.iter().map(|c| c.to_string()).collect()
    }
}

/// Opaque handle to a surface owned by the UI layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderTarget {
    pub id: String,
}

impl RenderTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Timing knobs of an orchestrator instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Pause between closing one backend session and opening the next.
    pub cool_down: Duration,
    /// Capture track silence tolerated before a device failure is reported.
    pub silence_window: Duration,
    /// Upper bound on waiting for a leave acknowledgment after stop.
    pub leave_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cool_down: Duration::from_millis(1_000),
            silence_window: Duration::from_millis(5_000),
            leave_timeout: Duration::from_millis(5_000),
        }
    }
}
