//! Per-camera access decision state machine
//!
//! Consumes one classified frame at a time and emits at most one
//! `AccessCommand` per stable episode:
//! - Security aggregation turns the frame into an unlock/deny proposal
//! - A persistence vote requires N consecutive identical proposals
//! - The action gate re-checks cooldowns at the moment of action
//! - A gap without faces longer than the disappearance window wipes the vote
//!
//! The engine is pull-based: the stream worker calls `step(frame, now)` and
//! owns all I/O. Nothing here blocks.

#[cfg(test)]
mod tests;

use crate::domain::types::{
    AccessCommand, DecisionReason, FrameClassification, MatchCandidate,
};
use crate::infra::config::Config;
use crate::services::classifier::candidate_order;
use crate::services::cooldown::SharedCooldownRegistry;
use std::time::{Duration, Instant};
use tracing::debug;

/// Timing and vote parameters for one decision engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    pub persistence_frames: u32,
    pub disappearance_reset: Duration,
    pub accepted_cooldown: Duration,
    pub unknown_cooldown: Duration,
    pub idle_pause: Duration,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            persistence_frames: 3,
            disappearance_reset: Duration::from_secs(2),
            accepted_cooldown: Duration::from_secs(15),
            unknown_cooldown: Duration::from_secs(6),
            idle_pause: Duration::from_secs(300),
        }
    }
}

impl DecisionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            persistence_frames: config.persistence_frames().max(1),
            disappearance_reset: config.disappearance_reset(),
            accepted_cooldown: config.accepted_cooldown(),
            unknown_cooldown: config.unknown_cooldown(),
            idle_pause: config.idle_pause(),
        }
    }
}

/// Decision type currently being voted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProposedType {
    #[default]
    None,
    Unlock,
    Deny,
}

impl ProposedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposedType::None => "none",
            ProposedType::Unlock => "unlock",
            ProposedType::Deny => "deny",
        }
    }
}

/// Short-term memory of the state machine
///
/// `count` only grows while `kind` is unchanged; a different proposal restarts
/// it at 1 and a successful emission drops it to 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionBuffer {
    pub kind: ProposedType,
    pub count: u32,
    /// Unlock target, or the banned match for a banned-only denial
    pub candidate: Option<MatchCandidate>,
    pub reason: Option<DecisionReason>,
    pub banned: bool,
}

impl DecisionBuffer {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Result of aggregating one frame under the security rules
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub kind: ProposedType,
    pub candidate: Option<MatchCandidate>,
    pub reason: DecisionReason,
    pub banned: bool,
}

/// Apply the security aggregation rules to a frame with at least one face.
///
/// Rules, first match wins:
/// 1. known and unknown co-present -> deny "mixed group"
/// 2. only unknown -> deny "unknown"
/// 3. only known, all banned -> deny "banned" with the closest banned match
/// 4. only known, some eligible -> unlock the closest non-banned match
pub fn aggregate(frame: &FrameClassification) -> Proposal {
    if frame.has_known() && frame.has_unknown() {
        return Proposal {
            kind: ProposedType::Deny,
            candidate: None,
            reason: DecisionReason::MixedGroup,
            banned: frame.has_banned(),
        };
    }

    if frame.all_unknown() {
        return Proposal {
            kind: ProposedType::Deny,
            candidate: None,
            reason: DecisionReason::Unknown,
            banned: false,
        };
    }

    let eligible = frame
        .faces
        .iter()
        .filter_map(|f| f.best.as_ref())
        .filter(|c| !c.banned)
        .min_by(|a, b| candidate_order(a, b));

    match eligible {
        Some(candidate) => Proposal {
            kind: ProposedType::Unlock,
            candidate: Some(candidate.clone()),
            reason: DecisionReason::Recognized,
            banned: false,
        },
        None => {
            let closest_banned = frame
                .faces
                .iter()
                .filter_map(|f| f.best.as_ref())
                .min_by(|a, b| candidate_order(a, b))
                .cloned();
            Proposal {
                kind: ProposedType::Deny,
                candidate: closest_banned,
                reason: DecisionReason::Banned,
                banned: true,
            }
        }
    }
}

/// What happened on one step, for logging and tests
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Stream is paused; the frame was ignored
    Paused,
    /// No faces in frame; `reset` is true if the vote was wiped
    NoFaces { reset: bool },
    /// Vote in progress, threshold not reached yet
    Voting { kind: ProposedType, count: u32 },
    /// Threshold reached but cooldown not cleared
    Suppressed { kind: ProposedType, remaining: Duration },
    Emitted(AccessCommand),
}

impl StepOutcome {
    pub fn into_command(self) -> Option<AccessCommand> {
        match self {
            StepOutcome::Emitted(cmd) => Some(cmd),
            _ => None,
        }
    }
}

pub struct DecisionEngine {
    camera_id: String,
    policy: DecisionPolicy,
    registry: SharedCooldownRegistry,
    buffer: DecisionBuffer,
    last_faces_seen_at: Option<Instant>,
    /// Idle reference point; starts at creation/resume so a quiet stream still pauses
    last_any_face_at: Instant,
    paused: bool,
}

impl DecisionEngine {
    pub fn new(camera_id: &str, policy: DecisionPolicy, registry: SharedCooldownRegistry) -> Self {
        Self::new_at(camera_id, policy, registry, Instant::now())
    }

    pub fn new_at(
        camera_id: &str,
        policy: DecisionPolicy,
        registry: SharedCooldownRegistry,
        now: Instant,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            policy,
            registry,
            buffer: DecisionBuffer::default(),
            last_faces_seen_at: None,
            last_any_face_at: now,
            paused: false,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn buffer(&self) -> &DecisionBuffer {
        &self.buffer
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Process one frame; returns the command to publish, if any
    pub fn step(&mut self, frame: &FrameClassification, now: Instant) -> Option<AccessCommand> {
        self.step_detailed(frame, now).into_command()
    }

    pub fn step_detailed(&mut self, frame: &FrameClassification, now: Instant) -> StepOutcome {
        if self.paused {
            return StepOutcome::Paused;
        }

        if frame.is_empty() {
            let reset = self.gap_exceeded(now) && self.buffer != DecisionBuffer::default();
            if reset {
                debug!(camera_id = %self.camera_id, kind = %self.buffer.kind.as_str(), "decision_vote_reset");
                self.buffer.clear();
            }
            return StepOutcome::NoFaces { reset };
        }

        // Faces are back after a gap the no-face frames never reported (dropped frames)
        if self.gap_exceeded(now) {
            self.buffer.clear();
        }
        self.last_faces_seen_at = Some(now);
        self.last_any_face_at = now;

        let proposal = aggregate(frame);
        self.vote(proposal);

        if self.buffer.count < self.policy.persistence_frames {
            return StepOutcome::Voting { kind: self.buffer.kind, count: self.buffer.count };
        }

        self.gate(now)
    }

    /// Mark the stream paused if it has been idle for the idle window
    pub fn check_idle(&mut self, now: Instant) -> bool {
        if self.paused {
            return false;
        }
        if now.saturating_duration_since(self.last_any_face_at) >= self.policy.idle_pause {
            self.pause();
            return true;
        }
        false
    }

    /// Pause immediately; the pending vote is discarded and nothing is emitted
    pub fn pause(&mut self) {
        self.paused = true;
        self.buffer.clear();
    }

    pub fn resume(&mut self, now: Instant) {
        self.paused = false;
        self.buffer.clear();
        self.last_faces_seen_at = None;
        self.last_any_face_at = now;
    }

    fn gap_exceeded(&self, now: Instant) -> bool {
        self.last_faces_seen_at
            .is_some_and(|at| now.saturating_duration_since(at) > self.policy.disappearance_reset)
    }

    /// Count the proposal toward the current vote, or restart the vote on it.
    ///
    /// An unlock vote is bound to the identity that started it; a different
    /// identity restarts the count. The candidate and reason are fixed for the
    /// life of a vote. A deny vote keeps its banned flag once any frame set it.
    fn vote(&mut self, proposal: Proposal) {
        if self.continues_vote(&proposal) {
            self.buffer.count = self.buffer.count.saturating_add(1);
            self.buffer.banned |= proposal.banned;
            return;
        }
        self.buffer = DecisionBuffer {
            kind: proposal.kind,
            count: 1,
            candidate: proposal.candidate,
            reason: Some(proposal.reason),
            banned: proposal.banned,
        };
    }

    fn continues_vote(&self, proposal: &Proposal) -> bool {
        if proposal.kind != self.buffer.kind || proposal.kind == ProposedType::None {
            return false;
        }
        match proposal.kind {
            ProposedType::Unlock => {
                let current = self.buffer.candidate.as_ref().map(|c| &c.identity_id);
                let proposed = proposal.candidate.as_ref().map(|c| &c.identity_id);
                current.is_some() && current == proposed
            }
            _ => true,
        }
    }

    fn gate(&mut self, now: Instant) -> StepOutcome {
        let kind = self.buffer.kind;
        let mut registry = self.registry.lock();

        let (since, window) = match kind {
            ProposedType::Unlock => match self.buffer.candidate.as_ref() {
                Some(c) => (registry.time_since_last_unlock(&c.identity_id, now), self.policy.accepted_cooldown),
                None => return StepOutcome::Voting { kind, count: self.buffer.count },
            },
            ProposedType::Deny => (registry.time_since_last_unknown_denial(now), self.policy.unknown_cooldown),
            ProposedType::None => return StepOutcome::Voting { kind, count: self.buffer.count },
        };

        if since < window {
            let remaining = window - since;
            debug!(
                camera_id = %self.camera_id,
                kind = %kind.as_str(),
                remaining_ms = %remaining.as_millis(),
                "decision_cooldown_suppressed"
            );
            return StepOutcome::Suppressed { kind, remaining };
        }

        let reason = self.buffer.reason.unwrap_or(DecisionReason::Unknown);
        let cmd = match (kind, self.buffer.candidate.clone()) {
            (ProposedType::Unlock, Some(candidate)) => {
                registry.record_unlock(&candidate.identity_id, now);
                AccessCommand::unlock(&self.camera_id, candidate)
            }
            _ => {
                registry.record_unknown_denial(now);
                AccessCommand::deny(&self.camera_id, reason, self.buffer.banned, self.buffer.candidate.clone())
            }
        };
        drop(registry);

        self.buffer.count = 0;
        StepOutcome::Emitted(cmd)
    }
}
