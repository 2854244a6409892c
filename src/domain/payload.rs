//! Wire payloads for the facegate topics
//!
//! Payloads are flat, versionless JSON objects. Inbound payloads reject
//! unrecognized fields instead of passing them through.

use crate::domain::types::{AccessCommand, CommandType, IdentityId};
use serde::{Deserialize, Serialize};

/// Errors from decoding an inbound payload
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not a valid message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Motion channel event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionEventKind {
    #[serde(rename = "motion_detected")]
    MotionDetected,
}

/// Motion channel payload: `{ "event": "motion_detected" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotionPayload {
    pub event: MotionEventKind,
}

impl MotionPayload {
    pub fn detected() -> Self {
        Self { event: MotionEventKind::MotionDetected }
    }
}

/// Access result as seen by the actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessResult {
    Unlocked,
    Denied,
    Cooldown,
}

impl AccessResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessResult::Unlocked => "unlocked",
            AccessResult::Denied => "denied",
            AccessResult::Cooldown => "cooldown",
        }
    }
}

impl From<CommandType> for AccessResult {
    fn from(t: CommandType) -> Self {
        match t {
            CommandType::Unlock => AccessResult::Unlocked,
            CommandType::Deny => AccessResult::Denied,
            CommandType::Cooldown => AccessResult::Cooldown,
        }
    }
}

/// Access channel payload
///
/// `result` and `banned` are always present so the actuator never guesses a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessPayload {
    pub result: AccessResult,
    pub banned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl From<&AccessCommand> for AccessPayload {
    fn from(cmd: &AccessCommand) -> Self {
        Self {
            result: cmd.command_type().into(),
            banned: cmd.banned(),
            retry_after: cmd.retry_after_secs(),
        }
    }
}

/// Actuator state as reported on the status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorStatusKind {
    Locked,
    Unlocking,
    Cooldown,
    Fault,
}

/// Status channel payload published by the actuator after each state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusPayload {
    pub state: ActuatorStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    /// Timestamp (epoch ms)
    pub ts: u64,
}

/// Precomputed distance from a detected face to one enrolled identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateDistance {
    pub identity: IdentityId,
    pub distance: f32,
}

/// One detected face as emitted by the capture pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FacePayload {
    #[serde(default, rename = "box", skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub descriptor: Vec<f32>,
    /// When present, classification uses these instead of the descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distances: Option<Vec<CandidateDistance>>,
}

/// One frame's worth of detected faces for a camera
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FramePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub faces: Vec<FacePayload>,
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, PayloadError> {
    let json = std::str::from_utf8(bytes)?;
    Ok(serde_json::from_str(json)?)
}

pub fn parse_motion(bytes: &[u8]) -> Result<MotionPayload, PayloadError> {
    decode(bytes)
}

pub fn parse_access(bytes: &[u8]) -> Result<AccessPayload, PayloadError> {
    decode(bytes)
}

pub fn parse_frame(bytes: &[u8]) -> Result<FramePayload, PayloadError> {
    decode(bytes)
}
