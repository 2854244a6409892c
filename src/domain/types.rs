//! Shared types for the access decision core

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for enrolled identity IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        IdentityId(s.to_string())
    }
}

/// Enrolled identity as supplied by the identity store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrolledIdentity {
    pub id: IdentityId,
    #[serde(default)]
    pub label: String,
    pub descriptor: Vec<f32>,
    #[serde(default)]
    pub banned: bool,
}

/// Snapshot of all enrolled identities, indexed by id
///
/// Shared read-only between stream workers; a refresh replaces the whole snapshot.
#[derive(Debug, Default)]
pub struct Roster {
    identities: Vec<EnrolledIdentity>,
    index: FxHashMap<IdentityId, usize>,
}

pub type SharedRoster = Arc<Roster>;

impl Roster {
    pub fn new(identities: Vec<EnrolledIdentity>) -> Self {
        let mut index = FxHashMap::default();
        for (i, identity) in identities.iter().enumerate() {
            // Later duplicates lose; the first enrollment wins
            index.entry(identity.id.clone()).or_insert(i);
        }
        Self { identities, index }
    }

    pub fn get(&self, id: &IdentityId) -> Option<&EnrolledIdentity> {
        self.index.get(id).map(|&i| &self.identities[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnrolledIdentity> {
        self.identities.iter()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn banned_count(&self) -> usize {
        self.identities.iter().filter(|i| i.banned).count()
    }
}

/// Best qualifying enrolled identity for one detected face
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub identity_id: IdentityId,
    pub label: String,
    /// Descriptor distance (smaller = more confident)
    pub distance: f32,
    pub banned: bool,
}

/// Classification of a detected face
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceStatus {
    Known,
    Unknown,
}

impl FaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaceStatus::Known => "known",
            FaceStatus::Unknown => "unknown",
        }
    }
}

/// One face located in a frame, after classification
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Bounding box as reported by the capture pipeline (opaque here)
    pub bbox: Option<[f32; 4]>,
    /// Embedding the face was classified from; `None` when only distances were sent
    pub descriptor: Option<Arc<[f32]>>,
    pub best: Option<MatchCandidate>,
}

impl DetectedFace {
    pub fn new(bbox: Option<[f32; 4]>, best: Option<MatchCandidate>) -> Self {
        Self { bbox, descriptor: None, best }
    }

    pub fn with_descriptor(mut self, descriptor: &[f32]) -> Self {
        self.descriptor = (!descriptor.is_empty()).then(|| Arc::from(descriptor));
        self
    }

    #[inline]
    pub fn status(&self) -> FaceStatus {
        if self.best.is_some() {
            FaceStatus::Known
        } else {
            FaceStatus::Unknown
        }
    }

    #[inline]
    pub fn is_banned(&self) -> bool {
        self.best.as_ref().is_some_and(|c| c.banned)
    }
}

/// All faces of one processed frame
///
/// Aggregates are vacuously false on an empty frame.
#[derive(Debug, Clone, Default)]
pub struct FrameClassification {
    pub faces: SmallVec<[DetectedFace; 4]>,
}

impl FrameClassification {
    pub fn new(faces: impl IntoIterator<Item = DetectedFace>) -> Self {
        Self { faces: faces.into_iter().collect() }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.faces.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn has_known(&self) -> bool {
        self.faces.iter().any(|f| f.status() == FaceStatus::Known)
    }

    pub fn has_unknown(&self) -> bool {
        self.faces.iter().any(|f| f.status() == FaceStatus::Unknown)
    }

    pub fn all_known(&self) -> bool {
        !self.is_empty() && !self.has_unknown()
    }

    pub fn all_unknown(&self) -> bool {
        !self.is_empty() && !self.has_known()
    }

    pub fn has_banned(&self) -> bool {
        self.faces.iter().any(|f| f.is_banned())
    }
}

/// Access command type carried to the actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Unlock,
    Deny,
    Cooldown,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Unlock => "unlock",
            CommandType::Deny => "deny",
            CommandType::Cooldown => "cooldown",
        }
    }
}

/// Why a decision was proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Only known faces, at least one eligible
    Recognized,
    /// Known and unknown faces co-present
    MixedGroup,
    /// Only unknown faces
    Unknown,
    /// Only known faces, all banned
    Banned,
    /// Operator-issued (manual tooling)
    Manual,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Recognized => "recognized",
            DecisionReason::MixedGroup => "mixed group",
            DecisionReason::Unknown => "unknown",
            DecisionReason::Banned => "banned",
            DecisionReason::Manual => "manual",
        }
    }
}

/// The unit crossing the protocol boundary. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessCommand {
    id: String,
    camera_id: String,
    command_type: CommandType,
    banned: bool,
    candidate: Option<MatchCandidate>,
    reason: DecisionReason,
    retry_after_secs: Option<f64>,
    issued_at: u64,
}

impl AccessCommand {
    fn build(
        camera_id: &str,
        command_type: CommandType,
        banned: bool,
        candidate: Option<MatchCandidate>,
        reason: DecisionReason,
        retry_after_secs: Option<f64>,
    ) -> Self {
        Self {
            id: new_uuid_v7(),
            camera_id: camera_id.to_string(),
            command_type,
            banned,
            candidate,
            reason,
            retry_after_secs,
            issued_at: epoch_ms(),
        }
    }

    pub fn unlock(camera_id: &str, candidate: MatchCandidate) -> Self {
        Self::build(camera_id, CommandType::Unlock, false, Some(candidate), DecisionReason::Recognized, None)
    }

    pub fn deny(
        camera_id: &str,
        reason: DecisionReason,
        banned: bool,
        candidate: Option<MatchCandidate>,
    ) -> Self {
        Self::build(camera_id, CommandType::Deny, banned, candidate, reason, None)
    }

    pub fn cooldown(camera_id: &str, retry_after_secs: f64) -> Self {
        Self::build(
            camera_id,
            CommandType::Cooldown,
            false,
            None,
            DecisionReason::Manual,
            Some(retry_after_secs.max(0.0)),
        )
    }

    /// Operator-issued unlock with no recognized identity behind it
    pub fn manual_unlock(camera_id: &str) -> Self {
        Self::build(camera_id, CommandType::Unlock, false, None, DecisionReason::Manual, None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn banned(&self) -> bool {
        self.banned
    }

    pub fn candidate(&self) -> Option<&MatchCandidate> {
        self.candidate.as_ref()
    }

    pub fn identity_id(&self) -> Option<&IdentityId> {
        self.candidate.as_ref().map(|c| &c.identity_id)
    }

    pub fn reason(&self) -> DecisionReason {
        self.reason
    }

    pub fn retry_after_secs(&self) -> Option<f64> {
        self.retry_after_secs
    }

    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }
}
