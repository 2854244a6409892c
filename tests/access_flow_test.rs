//! End-to-end access flow through the public API
//!
//! roster file -> frame payloads -> classifier -> decision engine -> access
//! payload on the wire -> actuator controller.

use facegate::domain::payload::{parse_access, parse_frame, AccessPayload, AccessResult, ActuatorStatusKind};
use facegate::domain::types::{AccessCommand, CommandType, DecisionReason, IdentityId, Roster};
use facegate::io::hardware::{FeedbackPattern, LockPosition};
use facegate::io::roster::load_roster;
use facegate::services::actuator::{ActuatorController, ActuatorEffect, ActuatorPolicy, ActuatorState};
use facegate::services::{CooldownRegistry, DecisionEngine, DecisionPolicy, MatchClassifier};
use std::fs;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const ROSTER: &str = r#"[
    {"id": "alice", "label": "Alice", "descriptor": [0.10, 0.20, 0.30]},
    {"id": "bob", "label": "Bob", "descriptor": [0.60, 0.10, 0.00]},
    {"id": "mallory", "label": "Mallory", "descriptor": [0.90, 0.90, 0.90], "banned": true}
]"#;

const ALICE: &str = "[0.11, 0.21, 0.30]";
const MALLORY: &str = "[0.90, 0.88, 0.91]";
const STRANGER: &str = "[-2.0, 3.0, 5.0]";

fn roster() -> Roster {
    let dir = tempdir().unwrap();
    let path = dir.path().join("roster.json");
    fs::write(&path, ROSTER).unwrap();
    load_roster(&path).unwrap()
}

fn frame(descriptors: &[&str]) -> Vec<u8> {
    let faces: Vec<String> = descriptors.iter().map(|d| format!(r#"{{"descriptor": {d}}}"#)).collect();
    format!(r#"{{"faces": [{}]}}"#, faces.join(",")).into_bytes()
}

struct Door {
    roster: Roster,
    classifier: MatchClassifier,
    engine: DecisionEngine,
    t0: Instant,
}

impl Door {
    fn new() -> Self {
        let t0 = Instant::now();
        Self {
            roster: roster(),
            classifier: MatchClassifier::default(),
            engine: DecisionEngine::new_at("front", DecisionPolicy::default(), CooldownRegistry::shared(), t0),
            t0,
        }
    }

    /// Feed `n` identical frames 100ms apart starting at `start_ms`
    fn feed(&mut self, bytes: &[u8], start_ms: u64, n: u64) -> Vec<AccessCommand> {
        let payload = parse_frame(bytes).unwrap();
        let classification = self.classifier.classify(&payload, &self.roster);
        (0..n)
            .filter_map(|i| {
                let now = self.t0 + Duration::from_millis(start_ms + i * 100);
                self.engine.step(&classification, now)
            })
            .collect()
    }
}

fn wire(cmd: &AccessCommand) -> AccessPayload {
    let bytes = serde_json::to_vec(&AccessPayload::from(cmd)).unwrap();
    parse_access(&bytes).unwrap()
}

#[test]
fn test_recognized_face_unlocks_the_door() {
    let mut door = Door::new();
    let commands = door.feed(&frame(&[ALICE]), 0, 3);
    assert_eq!(commands.len(), 1);
    let cmd = &commands[0];
    assert_eq!(cmd.command_type(), CommandType::Unlock);
    assert_eq!(cmd.identity_id(), Some(&IdentityId::from("alice")));

    let payload = wire(cmd);
    assert_eq!(payload.result, AccessResult::Unlocked);
    assert!(!payload.banned);

    let now = Instant::now();
    let mut actuator = ActuatorController::new(ActuatorPolicy::default());
    let effects = actuator.handle(&payload, now);
    assert!(effects.contains(&ActuatorEffect::MoveLock(LockPosition::Unlocked)));
    assert!(effects.contains(&ActuatorEffect::Sound(FeedbackPattern::Unlock)));

    let effects = actuator.tick(now + Duration::from_secs(3));
    assert!(effects.contains(&ActuatorEffect::MoveLock(LockPosition::Locked)));
    assert_eq!(actuator.state(), ActuatorState::Locked);
}

#[test]
fn test_tailgating_stranger_denies() {
    let mut door = Door::new();
    let commands = door.feed(&frame(&[ALICE, STRANGER]), 0, 3);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command_type(), CommandType::Deny);
    assert_eq!(commands[0].reason(), DecisionReason::MixedGroup);
    assert!(commands[0].identity_id().is_none());

    let payload = wire(&commands[0]);
    assert_eq!(payload.result, AccessResult::Denied);
    let effects = ActuatorController::new(ActuatorPolicy::default()).handle(&payload, Instant::now());
    assert!(effects.contains(&ActuatorEffect::Sound(FeedbackPattern::UnknownDenial)));
    assert!(!effects.iter().any(|e| matches!(e, ActuatorEffect::MoveLock(_))));
}

#[test]
fn test_banned_face_denies_with_banned_flag() {
    let mut door = Door::new();
    let commands = door.feed(&frame(&[MALLORY]), 0, 3);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].reason(), DecisionReason::Banned);
    assert!(commands[0].banned());

    let payload = wire(&commands[0]);
    assert!(payload.banned);
    let effects = ActuatorController::new(ActuatorPolicy::default()).handle(&payload, Instant::now());
    assert!(effects.contains(&ActuatorEffect::Sound(FeedbackPattern::BannedDenial)));
}

#[test]
fn test_banned_alongside_eligible_still_unlocks_eligible() {
    let mut door = Door::new();
    let commands = door.feed(&frame(&[MALLORY, ALICE]), 0, 3);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command_type(), CommandType::Unlock);
    assert_eq!(commands[0].identity_id(), Some(&IdentityId::from("alice")));
}

#[test]
fn test_stranger_loitering_is_denied_once_per_cooldown() {
    let mut door = Door::new();
    // 5 seconds of continuous presence: one deny, the rest suppressed
    let commands = door.feed(&frame(&[STRANGER]), 0, 50);
    assert_eq!(commands.len(), 1);

    // Past the 6s deny cooldown the held vote fires again
    let commands = door.feed(&frame(&[STRANGER]), 5000, 20);
    assert_eq!(commands.len(), 1);
}

#[test]
fn test_unlock_cooldown_survives_walking_away() {
    let mut door = Door::new();
    assert_eq!(door.feed(&frame(&[ALICE]), 0, 3).len(), 1);

    // Alice leaves for 5 seconds and comes back: still inside her 15s window
    assert!(door.feed(&frame(&[]), 300, 50).is_empty());
    assert!(door.feed(&frame(&[ALICE]), 5300, 10).is_empty());

    // Bob is a different identity and is not held back
    let commands = door.feed(&frame(&[r#"[0.60, 0.12, 0.01]"#]), 6300, 3);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].identity_id(), Some(&IdentityId::from("bob")));
}

#[test]
fn test_actuator_rejects_rapid_second_unlock() {
    let mut actuator = ActuatorController::new(ActuatorPolicy::default());
    let unlock = AccessPayload { result: AccessResult::Unlocked, banned: false, retry_after: None };
    let t0 = Instant::now();

    actuator.handle(&unlock, t0);
    actuator.tick(t0 + Duration::from_secs(3));
    let effects = actuator.handle(&unlock, t0 + Duration::from_secs(4));

    assert!(!effects.contains(&ActuatorEffect::MoveLock(LockPosition::Unlocked)));
    assert!(effects.iter().any(|e| matches!(
        e,
        ActuatorEffect::Status { kind: ActuatorStatusKind::Cooldown, retry_after: Some(_) }
    )));
    assert!(matches!(actuator.state(), ActuatorState::Cooldown { .. }));
}
