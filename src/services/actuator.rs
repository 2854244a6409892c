//! Actuator controller - the remote endpoint behind the access channel
//!
//! `ActuatorController` is a pure state machine over Locked / Unlocking /
//! Cooldown driven by received commands and its own timers. It returns
//! effects; `ActuatorRunner` executes them against the hardware drivers.
//!
//! The controller keeps its own minimum re-trigger interval regardless of
//! what the sender's cooldowns allowed. Losing the transport or the lock
//! driver always lands in Locked.

use crate::domain::payload::{AccessPayload, AccessResult, ActuatorStatusKind, StatusPayload};
use crate::domain::types::epoch_ms;
use crate::infra::config::Config;
use crate::io::hardware::{FeedbackPattern, LockDriver, LockPosition, MotionSensor, Sounder};
use crate::io::mqtt::{AccessClient, ConnectionState, PublishError};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorState {
    Locked,
    Unlocking { until: Instant },
    Cooldown { until: Instant },
}

impl ActuatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActuatorState::Locked => "locked",
            ActuatorState::Unlocking { .. } => "unlocking",
            ActuatorState::Cooldown { .. } => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActuatorEffect {
    MoveLock(LockPosition),
    Sound(FeedbackPattern),
    Status { kind: ActuatorStatusKind, retry_after: Option<f64> },
}

pub type Effects = SmallVec<[ActuatorEffect; 4]>;

/// Upper bound on any hold or cooldown, whether configured or received
pub const MAX_HOLD: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorPolicy {
    /// How long the lock stays open; not extendable mid-hold
    pub unlock_duration: Duration,
    /// Minimum spacing between physical unlocks, and between audible alarms
    pub retrigger_interval: Duration,
}

impl Default for ActuatorPolicy {
    fn default() -> Self {
        Self { unlock_duration: Duration::from_secs(3), retrigger_interval: Duration::from_secs(5) }
    }
}

impl ActuatorPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            unlock_duration: config.unlock_duration().min(MAX_HOLD),
            retrigger_interval: config.retrigger_interval().min(MAX_HOLD),
        }
    }
}

/// `at + d`, saturating at `at` if the clock cannot represent the sum
fn later(at: Instant, d: Duration) -> Instant {
    at.checked_add(d.min(MAX_HOLD)).unwrap_or(at)
}

/// Cooldown hold requested on the wire, bounded to `MAX_HOLD`
fn requested_hold(retry_after: Option<f64>) -> Option<Duration> {
    retry_after
        .filter(|s| *s > 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .map(|d| d.min(MAX_HOLD))
}

fn remaining_secs(until: Instant, now: Instant) -> f64 {
    until.saturating_duration_since(now).as_secs_f64()
}

pub struct ActuatorController {
    policy: ActuatorPolicy,
    state: ActuatorState,
    last_unlock_at: Option<Instant>,
    last_alarm_at: Option<Instant>,
}

impl ActuatorController {
    pub fn new(policy: ActuatorPolicy) -> Self {
        Self { policy, state: ActuatorState::Locked, last_unlock_at: None, last_alarm_at: None }
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    /// Next instant at which `tick` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ActuatorState::Locked => None,
            ActuatorState::Unlocking { until } | ActuatorState::Cooldown { until } => Some(until),
        }
    }

    pub fn handle(&mut self, payload: &AccessPayload, now: Instant) -> Effects {
        let mut effects = self.tick(now);
        match payload.result {
            AccessResult::Unlocked => self.on_unlock(now, &mut effects),
            AccessResult::Denied => {
                let pattern =
                    if payload.banned { FeedbackPattern::BannedDenial } else { FeedbackPattern::UnknownDenial };
                self.on_alarm(pattern, None, now, &mut effects);
            }
            AccessResult::Cooldown => {
                let hold = requested_hold(payload.retry_after).unwrap_or(self.policy.retrigger_interval);
                self.on_alarm(FeedbackPattern::Cooldown, Some(hold), now, &mut effects);
            }
        }
        effects
    }

    fn on_unlock(&mut self, now: Instant, effects: &mut Effects) {
        if let ActuatorState::Unlocking { until } = self.state {
            debug!(remaining_ms = %until.saturating_duration_since(now).as_millis(), "actuator_unlock_ignored_while_open");
            return;
        }

        if let Some(last) = self.last_unlock_at {
            let retrigger_at = later(last, self.policy.retrigger_interval);
            if now < retrigger_at {
                let retry_after = remaining_secs(retrigger_at, now);
                info!(retry_after = %format!("{:.1}", retry_after), "actuator_unlock_in_cooldown");
                self.state = ActuatorState::Cooldown { until: retrigger_at };
                effects.push(ActuatorEffect::Sound(FeedbackPattern::Cooldown));
                effects.push(ActuatorEffect::Status {
                    kind: ActuatorStatusKind::Cooldown,
                    retry_after: Some(retry_after),
                });
                return;
            }
        }

        self.last_unlock_at = Some(now);
        self.state = ActuatorState::Unlocking { until: later(now, self.policy.unlock_duration) };
        info!(hold_ms = %self.policy.unlock_duration.as_millis(), "actuator_unlocking");
        effects.push(ActuatorEffect::MoveLock(LockPosition::Unlocked));
        effects.push(ActuatorEffect::Sound(FeedbackPattern::Unlock));
        effects.push(ActuatorEffect::Status { kind: ActuatorStatusKind::Unlocking, retry_after: None });
    }

    /// Denials and cooldown notices share one alarm re-trigger interval
    fn on_alarm(&mut self, pattern: FeedbackPattern, hold: Option<Duration>, now: Instant, effects: &mut Effects) {
        let within_retrigger =
            self.last_alarm_at.is_some_and(|last| now < later(last, self.policy.retrigger_interval));

        if !within_retrigger {
            self.last_alarm_at = Some(now);
            info!(pattern = %pattern.as_str(), "actuator_alarm");
            effects.push(ActuatorEffect::Sound(pattern));
        } else {
            debug!(pattern = %pattern.as_str(), "actuator_alarm_suppressed");
        }

        // Never interrupt an open hold; the unlock timer relocks
        if matches!(self.state, ActuatorState::Unlocking { .. }) {
            return;
        }

        let until = match (hold, self.last_alarm_at) {
            (Some(hold), _) => Some(later(now, hold)),
            (None, Some(last)) if within_retrigger => Some(later(last, self.policy.retrigger_interval)),
            _ => None,
        };
        if let Some(until) = until {
            let until = match self.state {
                ActuatorState::Cooldown { until: current } => current.max(until),
                _ => until,
            };
            self.state = ActuatorState::Cooldown { until };
            effects.push(ActuatorEffect::Status {
                kind: ActuatorStatusKind::Cooldown,
                retry_after: Some(remaining_secs(until, now)),
            });
        }
    }

    /// Expire timers
    pub fn tick(&mut self, now: Instant) -> Effects {
        let mut effects = Effects::new();
        match self.state {
            ActuatorState::Unlocking { until } if now >= until => {
                self.state = ActuatorState::Locked;
                info!("actuator_relocked");
                effects.push(ActuatorEffect::MoveLock(LockPosition::Locked));
                effects.push(ActuatorEffect::Status { kind: ActuatorStatusKind::Locked, retry_after: None });
            }
            ActuatorState::Cooldown { until } if now >= until => {
                self.state = ActuatorState::Locked;
                effects.push(ActuatorEffect::Status { kind: ActuatorStatusKind::Locked, retry_after: None });
            }
            _ => {}
        }
        effects
    }

    /// Transport gone: default to Locked
    pub fn connection_lost(&mut self) -> Effects {
        let mut effects = Effects::new();
        match self.state {
            ActuatorState::Locked => {}
            ActuatorState::Unlocking { .. } => {
                warn!("actuator_connection_lost_relocking");
                effects.push(ActuatorEffect::MoveLock(LockPosition::Locked));
            }
            ActuatorState::Cooldown { .. } => {}
        }
        self.state = ActuatorState::Locked;
        effects
    }

    /// Lock driver failed: treat the door as Locked and report a fault
    pub fn hardware_fault(&mut self) -> Effects {
        self.state = ActuatorState::Locked;
        let mut effects = Effects::new();
        effects.push(ActuatorEffect::Status { kind: ActuatorStatusKind::Fault, retry_after: None });
        effects
    }
}

/// Outbound seam from the actuator back to the decision side
pub trait ActuatorUplink: Send + Sync {
    fn publish_status(&self, status: &StatusPayload) -> Result<(), PublishError>;
    fn publish_motion(&self) -> Result<(), PublishError>;
}

impl ActuatorUplink for AccessClient {
    fn publish_status(&self, status: &StatusPayload) -> Result<(), PublishError> {
        AccessClient::publish_status(self, status)
    }

    fn publish_motion(&self) -> Result<(), PublishError> {
        AccessClient::publish_motion(self)
    }
}

/// Executes controller effects against the hardware
pub struct ActuatorRunner {
    controller: ActuatorController,
    lock: Arc<dyn LockDriver>,
    sounder: Arc<dyn Sounder>,
    uplink: Arc<dyn ActuatorUplink>,
}

impl ActuatorRunner {
    pub fn new(
        controller: ActuatorController,
        lock: Arc<dyn LockDriver>,
        sounder: Arc<dyn Sounder>,
        uplink: Arc<dyn ActuatorUplink>,
    ) -> Self {
        Self { controller, lock, sounder, uplink }
    }

    pub fn controller(&self) -> &ActuatorController {
        &self.controller
    }

    /// Drive the lock to Locked; done before any command can arrive
    pub async fn initialize(&mut self) {
        let mut effects = Effects::new();
        effects.push(ActuatorEffect::MoveLock(LockPosition::Locked));
        self.apply(effects).await;
        info!(state = %self.controller.state().as_str(), "actuator_initialized");
    }

    pub async fn handle(&mut self, payload: &AccessPayload) {
        let effects = self.controller.handle(payload, Instant::now());
        self.apply(effects).await;
    }

    pub async fn tick(&mut self) {
        let effects = self.controller.tick(Instant::now());
        self.apply(effects).await;
    }

    pub async fn connection_lost(&mut self) {
        let effects = self.controller.connection_lost();
        self.apply(effects).await;
    }

    /// Consume access commands until shutdown.
    ///
    /// Commands are only acted on while the transport is Connected. Anything
    /// buffered when the link drops is discarded, never replayed.
    pub async fn run(
        mut self,
        mut access_rx: mpsc::Receiver<AccessPayload>,
        mut connection: watch::Receiver<ConnectionState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("actuator_runner_started");

        loop {
            let deadline = self.controller.next_deadline();
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connection.borrow();
                    if !state.is_connected() {
                        warn!(state = %state.as_str(), "actuator_transport_down");
                        self.connection_lost().await;
                        discard_buffered(&mut access_rx);
                    }
                }
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.tick().await;
                }
                msg = access_rx.recv() => {
                    match msg {
                        Some(payload) => {
                            let state = *connection.borrow();
                            if !state.is_connected() {
                                warn!(
                                    result = %payload.result.as_str(),
                                    state = %state.as_str(),
                                    "access_command_discarded_while_disconnected"
                                );
                                continue;
                            }
                            info!(result = %payload.result.as_str(), banned = %payload.banned, "access_command_received");
                            self.handle(&payload).await;
                        }
                        None => break,
                    }
                }
            }
        }

        self.connection_lost().await;
        info!("actuator_runner_stopped");
    }

    async fn apply(&mut self, effects: Effects) {
        let mut pending = effects;
        while !pending.is_empty() {
            let mut follow_up = Effects::new();
            for effect in pending {
                match effect {
                    ActuatorEffect::MoveLock(position) => {
                        if let Err(e) = self.lock.move_to(position).await {
                            log_lock_fault(position, &e);
                            if position == LockPosition::Unlocked {
                                // Best effort back to the safe position
                                if let Err(e) = self.lock.move_to(LockPosition::Locked).await {
                                    log_lock_fault(LockPosition::Locked, &e);
                                }
                            }
                            follow_up.extend(self.controller.hardware_fault());
                            break;
                        }
                    }
                    ActuatorEffect::Sound(pattern) => {
                        // Playback runs alongside so relock timers are never delayed
                        let sounder = self.sounder.clone();
                        tokio::spawn(async move {
                            if let Err(e) = sounder.play(pattern).await {
                                warn!(pattern = %pattern.as_str(), error = %e, "actuator_sound_failed");
                            }
                        });
                    }
                    ActuatorEffect::Status { kind, retry_after } => {
                        let status = StatusPayload { state: kind, retry_after, ts: epoch_ms() };
                        if let Err(e) = self.uplink.publish_status(&status) {
                            debug!(error = %e, "actuator_status_not_published");
                        }
                    }
                }
            }
            pending = follow_up;
        }
    }
}

/// Drop everything queued before the transport went down
fn discard_buffered(access_rx: &mut mpsc::Receiver<AccessPayload>) -> usize {
    let mut dropped = 0;
    while access_rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(dropped = %dropped, "access_commands_discarded_on_disconnect");
    }
    dropped
}

#[cold]
#[inline(never)]
fn log_lock_fault(position: LockPosition, e: &crate::io::hardware::HardwareError) {
    error!(position = %position.as_str(), error = %e, "actuator_lock_fault");
}

/// Spaces out motion publications
#[derive(Debug)]
pub struct MotionDebouncer {
    cooldown: Duration,
    last_published: Option<Instant>,
}

impl MotionDebouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, last_published: None }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.last_published.map_or(true, |at| now.saturating_duration_since(at) >= self.cooldown)
    }

    pub fn record(&mut self, now: Instant) {
        self.last_published = Some(now);
    }
}

/// Poll the PIR sensor and publish debounced motion events
pub async fn run_motion_loop(
    sensor: Arc<dyn MotionSensor>,
    uplink: Arc<dyn ActuatorUplink>,
    mut debouncer: MotionDebouncer,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_fault_warn: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sensor.is_triggered().await {
                    Ok(true) => {
                        let now = Instant::now();
                        if !debouncer.ready(now) {
                            continue;
                        }
                        match uplink.publish_motion() {
                            Ok(()) => {
                                debouncer.record(now);
                                info!("motion_published");
                            }
                            // Not recorded: the next trigger retries
                            Err(e) => warn!(error = %e, "motion_publish_failed"),
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        if last_fault_warn.map_or(true, |at| at.elapsed() > Duration::from_secs(60)) {
                            warn!(error = %e, "motion_sensor_read_failed");
                            last_fault_warn = Some(Instant::now());
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("motion_loop_shutdown");
                    return;
                }
            }
        }
    }
}
