//! Tests for the decision engine

use super::*;
use crate::domain::types::{CommandType, DetectedFace, IdentityId};
use crate::services::cooldown::CooldownRegistry;

/// Frame spacing used by the harness (10 fps)
const FRAME_MS: u64 = 100;

struct Harness {
    engine: DecisionEngine,
    t0: Instant,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        Self::with_registry(CooldownRegistry::shared())
    }

    fn with_registry(registry: SharedCooldownRegistry) -> Self {
        let t0 = Instant::now();
        let engine = DecisionEngine::new_at("front", DecisionPolicy::default(), registry, t0);
        Self { engine, t0, now: t0 }
    }

    fn advance(&mut self, d: Duration) {
        self.now += d;
    }

    /// Feed one frame at the current time, then advance one frame period
    fn feed(&mut self, frame: &FrameClassification) -> StepOutcome {
        let outcome = self.engine.step_detailed(frame, self.now);
        self.now += Duration::from_millis(FRAME_MS);
        outcome
    }

    /// Feed the same frame n times, collecting emitted commands
    fn feed_n(&mut self, frame: &FrameClassification, n: usize) -> Vec<AccessCommand> {
        (0..n).filter_map(|_| self.feed(frame).into_command()).collect()
    }

    fn elapsed(&self) -> Duration {
        self.now - self.t0
    }
}

fn known(id: &str, distance: f32) -> DetectedFace {
    candidate_face(id, distance, false)
}

fn banned(id: &str, distance: f32) -> DetectedFace {
    candidate_face(id, distance, true)
}

fn candidate_face(id: &str, distance: f32, banned: bool) -> DetectedFace {
    DetectedFace::new(
        None,
        Some(MatchCandidate { identity_id: IdentityId::from(id), label: id.to_string(), distance, banned }),
    )
}

fn unknown() -> DetectedFace {
    DetectedFace::new(None, None)
}

fn frame(faces: Vec<DetectedFace>) -> FrameClassification {
    FrameClassification::new(faces)
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

// ============================================================================
// Security aggregation
// ============================================================================

#[test]
fn test_aggregate_mixed_group_denies() {
    let p = aggregate(&frame(vec![known("alice", 0.1), unknown()]));
    assert_eq!(p.kind, ProposedType::Deny);
    assert_eq!(p.reason, DecisionReason::MixedGroup);
    assert!(p.candidate.is_none());
    assert!(!p.banned);
}

#[test]
fn test_aggregate_mixed_group_with_banned_sets_flag() {
    let p = aggregate(&frame(vec![banned("mallory", 0.2), unknown()]));
    assert_eq!(p.reason, DecisionReason::MixedGroup);
    assert!(p.banned);
}

#[test]
fn test_aggregate_all_unknown_denies() {
    let p = aggregate(&frame(vec![unknown(), unknown(), unknown()]));
    assert_eq!(p.kind, ProposedType::Deny);
    assert_eq!(p.reason, DecisionReason::Unknown);
}

#[test]
fn test_aggregate_all_banned_attaches_closest_banned() {
    let p = aggregate(&frame(vec![banned("mallory", 0.3), banned("eve", 0.1)]));
    assert_eq!(p.kind, ProposedType::Deny);
    assert_eq!(p.reason, DecisionReason::Banned);
    assert!(p.banned);
    assert_eq!(p.candidate.map(|c| c.identity_id), Some(IdentityId::from("eve")));
}

#[test]
fn test_aggregate_highest_confidence_eligible_wins() {
    let p = aggregate(&frame(vec![known("bob", 0.35), known("alice", 0.25), known("carol", 0.4)]));
    assert_eq!(p.kind, ProposedType::Unlock);
    assert_eq!(p.candidate.map(|c| c.identity_id), Some(IdentityId::from("alice")));
}

#[test]
fn test_aggregate_tie_broken_by_identity_id() {
    let p = aggregate(&frame(vec![known("zed", 0.2), known("amy", 0.2)]));
    assert_eq!(p.candidate.map(|c| c.identity_id), Some(IdentityId::from("amy")));
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_scenario_a_stable_known_identity_unlocks() {
    let mut h = Harness::new();
    let f = frame(vec![known("x", 0.3)]);

    assert_eq!(h.feed(&f), StepOutcome::Voting { kind: ProposedType::Unlock, count: 1 });
    assert_eq!(h.feed(&f), StepOutcome::Voting { kind: ProposedType::Unlock, count: 2 });
    let cmd = h.feed(&f).into_command().expect("third frame emits");

    assert_eq!(cmd.command_type(), CommandType::Unlock);
    assert_eq!(cmd.identity_id(), Some(&IdentityId::from("x")));
    assert_eq!(cmd.camera_id(), "front");
    assert_eq!(h.engine.buffer().count, 0);
}

#[test]
fn test_scenario_b_unlock_cooldown_per_identity() {
    let mut h = Harness::new();
    let f = frame(vec![known("x", 0.3)]);
    assert_eq!(h.feed_n(&f, 3).len(), 1);

    // Same identity after 5 s: cooled down
    h.advance(secs(5));
    assert!(h.feed_n(&f, 3).is_empty());

    // After 16 s: eligible again
    let target = h.t0 + secs(16);
    h.advance(target - h.now);
    let cmds = h.feed_n(&f, 3);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].command_type(), CommandType::Unlock);
}

#[test]
fn test_scenario_c_mixed_group_never_unlocks() {
    let mut h = Harness::new();
    let f = frame(vec![known("x", 0.1), unknown()]);
    let cmds = h.feed_n(&f, 3);

    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].command_type(), CommandType::Deny);
    assert_eq!(cmds[0].reason(), DecisionReason::MixedGroup);
    assert_eq!(cmds[0].reason().as_str(), "mixed group");
}

#[test]
fn test_scenario_d_banned_excluded_from_candidacy() {
    let mut h = Harness::new();
    let f = frame(vec![banned("mallory", 0.2), known("bob", 0.3)]);
    let cmds = h.feed_n(&f, 3);

    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].command_type(), CommandType::Unlock);
    assert_eq!(cmds[0].identity_id(), Some(&IdentityId::from("bob")));
    assert!(!cmds[0].banned());
}

#[test]
fn test_scenario_e_unknown_denial_global_cooldown() {
    let mut h = Harness::new();
    let f = frame(vec![unknown(), unknown()]);
    let cmds = h.feed_n(&f, 3);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].command_type(), CommandType::Deny);
    assert_eq!(cmds[0].reason(), DecisionReason::Unknown);
    assert!(!cmds[0].banned());

    // Immediate repeat within 6 s: nothing
    assert!(h.feed_n(&f, 20).is_empty());
}

// ============================================================================
// Persistence vote
// ============================================================================

#[test]
fn test_single_frame_mismatch_restarts_vote() {
    let mut h = Harness::new();
    let alice = frame(vec![known("alice", 0.2)]);
    let stranger = frame(vec![unknown()]);

    h.feed(&alice);
    h.feed(&alice);
    assert_eq!(h.feed(&stranger), StepOutcome::Voting { kind: ProposedType::Deny, count: 1 });
    assert_eq!(h.feed(&alice), StepOutcome::Voting { kind: ProposedType::Unlock, count: 1 });
    assert!(h.feed_n(&alice, 1).is_empty());
    assert_eq!(h.feed_n(&alice, 1).len(), 1);
}

#[test]
fn test_identity_change_restarts_unlock_vote() {
    let mut h = Harness::new();
    let alice = frame(vec![known("alice", 0.2)]);
    let bob = frame(vec![known("bob", 0.1)]);

    h.feed(&alice);
    h.feed(&alice);
    assert_eq!(h.feed(&bob), StepOutcome::Voting { kind: ProposedType::Unlock, count: 1 });
    assert_eq!(h.engine.buffer().candidate.as_ref().map(|c| c.identity_id.clone()), Some(IdentityId::from("bob")));

    assert!(h.feed_n(&bob, 1).is_empty());
    let cmds = h.feed_n(&bob, 1);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].identity_id(), Some(&IdentityId::from("bob")));
}

#[test]
fn test_single_misclassified_frame_cannot_unlock_during_cooldown() {
    let mut h = Harness::new();
    let alice = frame(vec![known("alice", 0.2)]);
    assert_eq!(h.feed_n(&alice, 3).len(), 1);

    // Alice is still at the door, held back by her cooldown
    h.advance(secs(5));
    assert!(h.feed_n(&alice, 3).is_empty());
    assert!(matches!(h.feed(&alice), StepOutcome::Suppressed { .. }));

    // One frame that matches bob must not turn alice's held vote into an unlock
    assert_eq!(
        h.feed(&frame(vec![known("bob", 0.3)])),
        StepOutcome::Voting { kind: ProposedType::Unlock, count: 1 }
    );
    assert!(matches!(h.feed(&alice), StepOutcome::Voting { count: 1, .. }));
    assert!(h.feed_n(&alice, 5).is_empty());
}

#[test]
fn test_unlock_candidate_fixed_for_life_of_vote() {
    let mut h = Harness::new();
    h.feed(&frame(vec![known("alice", 0.3)]));
    h.feed(&frame(vec![known("alice", 0.1)]));
    let cmd = h.feed(&frame(vec![known("alice", 0.25)])).into_command().expect("emits");

    // Distance reported is the one that opened the vote
    assert_eq!(cmd.candidate().map(|c| c.distance), Some(0.3));
}

#[test]
fn test_deny_vote_keeps_banned_flag_once_seen() {
    let mut h = Harness::new();
    h.feed(&frame(vec![banned("mallory", 0.2), unknown()]));
    h.feed(&frame(vec![unknown()]));
    let cmd = h.feed(&frame(vec![unknown()])).into_command().expect("emits");

    assert_eq!(cmd.command_type(), CommandType::Deny);
    assert_eq!(cmd.reason(), DecisionReason::MixedGroup);
    assert!(cmd.banned());
}

#[test]
fn test_no_face_frames_do_not_advance_vote() {
    let mut h = Harness::new();
    let f = frame(vec![known("alice", 0.2)]);
    h.feed(&f);
    h.feed(&f);
    for _ in 0..5 {
        assert_eq!(h.feed(&FrameClassification::empty()), StepOutcome::NoFaces { reset: false });
    }
    assert_eq!(h.engine.buffer().count, 2);
    assert_eq!(h.feed_n(&f, 1).len(), 1);
}

#[test]
fn test_disappearance_resets_vote() {
    let mut h = Harness::new();
    let f = frame(vec![known("alice", 0.2)]);
    h.feed(&f);
    h.feed(&f);

    h.advance(secs(2));
    assert_eq!(h.feed(&FrameClassification::empty()), StepOutcome::NoFaces { reset: true });
    assert_eq!(h.engine.buffer().kind, ProposedType::None);

    // Full fresh vote required
    assert!(h.feed_n(&f, 2).is_empty());
    assert_eq!(h.feed_n(&f, 1).len(), 1);
}

#[test]
fn test_gap_without_empty_frames_still_resets_vote() {
    let mut h = Harness::new();
    let f = frame(vec![known("alice", 0.2)]);
    h.feed(&f);
    h.feed(&f);

    // Every frame in the gap was dropped upstream
    h.advance(Duration::from_millis(2500));
    assert_eq!(h.feed(&f), StepOutcome::Voting { kind: ProposedType::Unlock, count: 1 });
}

#[test]
fn test_gap_at_threshold_keeps_vote() {
    let mut h = Harness::new();
    let f = frame(vec![known("alice", 0.2)]);
    h.feed(&f);
    h.feed(&f);

    // feed() already advanced one frame; land exactly 2 s after the last face
    h.advance(secs(2) - Duration::from_millis(FRAME_MS));
    assert_eq!(h.feed(&FrameClassification::empty()), StepOutcome::NoFaces { reset: false });
}

// ============================================================================
// Action gate
// ============================================================================

#[test]
fn test_suppressed_gate_keeps_count() {
    let registry = CooldownRegistry::shared();
    let mut h = Harness::with_registry(registry.clone());
    registry.lock().record_unlock(&IdentityId::from("alice"), h.now);

    let f = frame(vec![known("alice", 0.2)]);
    h.feed(&f);
    h.feed(&f);
    match h.feed(&f) {
        StepOutcome::Suppressed { kind, remaining } => {
            assert_eq!(kind, ProposedType::Unlock);
            assert!(remaining <= secs(15));
        }
        other => panic!("expected suppression, got {:?}", other),
    }
    assert_eq!(h.engine.buffer().count, 3);

    // Act on the first frame after the cooldown clears, no re-vote
    let mut emitted_at = None;
    for _ in 0..200 {
        let at = h.elapsed();
        if h.feed(&f).into_command().is_some() {
            emitted_at = Some(at);
            break;
        }
    }
    assert_eq!(emitted_at, Some(secs(15)));
}

#[test]
fn test_different_identity_not_blocked_by_unlock_cooldown() {
    let mut h = Harness::new();
    assert_eq!(h.feed_n(&frame(vec![known("alice", 0.2)]), 3).len(), 1);
    let cmds = h.feed_n(&frame(vec![known("bob", 0.2)]), 3);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].identity_id(), Some(&IdentityId::from("bob")));
}

#[test]
fn test_deny_cooldown_is_global_across_reasons() {
    let mut h = Harness::new();
    assert_eq!(h.feed_n(&frame(vec![unknown()]), 3).len(), 1);
    assert!(h.feed_n(&frame(vec![banned("mallory", 0.1)]), 3).is_empty());
    assert!(h.feed_n(&frame(vec![known("a", 0.2), unknown()]), 3).is_empty());
}

#[test]
fn test_banned_only_deny_carries_flag_and_candidate() {
    let mut h = Harness::new();
    let cmds = h.feed_n(&frame(vec![banned("mallory", 0.2)]), 3);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].command_type(), CommandType::Deny);
    assert_eq!(cmds[0].reason(), DecisionReason::Banned);
    assert!(cmds[0].banned());
    assert_eq!(cmds[0].identity_id(), Some(&IdentityId::from("mallory")));
}

#[test]
fn test_shared_registry_spans_cameras() {
    let registry = CooldownRegistry::shared();
    let t0 = Instant::now();
    let mut front = DecisionEngine::new_at("front", DecisionPolicy::default(), registry.clone(), t0);
    let mut side = DecisionEngine::new_at("side", DecisionPolicy::default(), registry, t0);
    let f = frame(vec![known("alice", 0.2)]);

    let emitted: Vec<_> = (0..3).filter_map(|i| front.step(&f, t0 + Duration::from_millis(i * 100))).collect();
    assert_eq!(emitted.len(), 1);

    let emitted: Vec<_> = (3..6).filter_map(|i| side.step(&f, t0 + Duration::from_millis(i * 100))).collect();
    assert!(emitted.is_empty());
}

#[test]
fn test_isolated_registries_do_not_interfere() {
    let t0 = Instant::now();
    let mut front = DecisionEngine::new_at("front", DecisionPolicy::default(), CooldownRegistry::shared(), t0);
    let mut side = DecisionEngine::new_at("side", DecisionPolicy::default(), CooldownRegistry::shared(), t0);
    let f = frame(vec![known("alice", 0.2)]);

    assert_eq!((0..3).filter_map(|i| front.step(&f, t0 + Duration::from_millis(i * 100))).count(), 1);
    assert_eq!((3..6).filter_map(|i| side.step(&f, t0 + Duration::from_millis(i * 100))).count(), 1);
}

// ============================================================================
// Pause / idle
// ============================================================================

#[test]
fn test_idle_window_pauses_stream() {
    let mut h = Harness::new();
    h.advance(Duration::from_secs(299));
    assert!(!h.engine.check_idle(h.now));
    h.advance(secs(1));
    assert!(h.engine.check_idle(h.now));
    assert!(h.engine.is_paused());
    // Already paused: no second transition
    assert!(!h.engine.check_idle(h.now));
}

#[test]
fn test_faces_defer_idle_pause() {
    let mut h = Harness::new();
    h.advance(secs(200));
    h.feed(&frame(vec![unknown()]));
    h.advance(secs(200));
    assert!(!h.engine.check_idle(h.now));
}

#[test]
fn test_pause_is_immediate_and_silent() {
    let mut h = Harness::new();
    let f = frame(vec![known("alice", 0.2)]);
    h.feed(&f);
    h.feed(&f);
    h.engine.pause();

    assert_eq!(h.feed(&f), StepOutcome::Paused);
    assert!(h.feed_n(&f, 10).is_empty());
    assert_eq!(h.engine.buffer().count, 0);
}

#[test]
fn test_resume_requires_fresh_vote() {
    let mut h = Harness::new();
    let f = frame(vec![known("alice", 0.2)]);
    h.feed(&f);
    h.feed(&f);
    h.engine.pause();
    h.engine.resume(h.now);

    assert!(!h.engine.is_paused());
    assert!(h.feed_n(&f, 2).is_empty());
    assert_eq!(h.feed_n(&f, 1).len(), 1);
}

// ============================================================================
// Properties over long frame sequences
// ============================================================================

/// Small deterministic generator so sequences are reproducible
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn random_frame(rng: &mut Lcg) -> FrameClassification {
    let n = (rng.next() % 4) as usize;
    let faces = (0..n)
        .map(|_| match rng.next() % 5 {
            0 => unknown(),
            1 => banned("mallory", 0.1 + (rng.next() % 30) as f32 / 100.0),
            2 => known("alice", 0.1 + (rng.next() % 30) as f32 / 100.0),
            3 => known("bob", 0.1 + (rng.next() % 30) as f32 / 100.0),
            _ => known("carol", 0.1 + (rng.next() % 30) as f32 / 100.0),
        })
        .collect();
    frame(faces)
}

#[test]
fn test_unlock_spacing_and_vote_properties_hold_for_random_sequences() {
    for seed in 1..=20u64 {
        let mut rng = Lcg(seed);
        let mut h = Harness::new();
        let mut last_unlock: std::collections::HashMap<IdentityId, Duration> = Default::default();
        let mut unlock_streak = 0u32;
        let mut streak_identity: Option<IdentityId> = None;

        for _ in 0..2000 {
            // Occasional long gaps
            if rng.next() % 50 == 0 {
                h.advance(Duration::from_millis(rng.next() % 4000));
            }
            let f = random_frame(&mut rng);
            let at = h.elapsed();
            let proposal = (!f.is_empty()).then(|| aggregate(&f));

            match proposal.as_ref() {
                Some(p) if p.kind == ProposedType::Unlock => {
                    let id = p.candidate.as_ref().map(|c| c.identity_id.clone());
                    if id == streak_identity {
                        unlock_streak += 1;
                    } else {
                        streak_identity = id;
                        unlock_streak = 1;
                    }
                }
                Some(_) => {
                    streak_identity = None;
                    unlock_streak = 0;
                }
                None => {}
            }

            if let Some(cmd) = h.feed(&f).into_command() {
                if f.has_known() && f.has_unknown() {
                    assert_ne!(cmd.command_type(), CommandType::Unlock, "mixed group unlocked");
                }
                if cmd.command_type() == CommandType::Unlock {
                    assert!(unlock_streak >= 3, "unlock without a 3-frame vote");
                    let id = cmd.identity_id().cloned().expect("unlock carries identity");
                    assert_eq!(Some(&id), streak_identity.as_ref(), "unlocked an identity outside the vote");
                    if let Some(prev) = last_unlock.insert(id, at) {
                        assert!(at - prev >= secs(15), "unlock spacing {:?}", at - prev);
                    }
                }
            }
        }
    }
}

#[test]
fn test_stable_presence_emits_once_per_window() {
    let mut h = Harness::new();
    let f = frame(vec![known("alice", 0.2)]);
    // 40 s at 10 fps
    let cmds = h.feed_n(&f, 400);
    // t = 0.2 s, 15.2 s, 30.2 s
    assert_eq!(cmds.len(), 3);
}
