//! Per-camera stream worker
//!
//! Drives one `DecisionEngine`: classifies each delivered frame against the
//! current roster, steps the engine and hands emitted commands to the command
//! worker. Frames arrive through a capacity-1 channel, so at most one frame is
//! in flight and late frames are dropped upstream rather than queued.

use crate::domain::payload::{FramePayload, MotionPayload};
use crate::domain::types::SharedRoster;
use crate::infra::metrics::Metrics;
use crate::services::classifier::MatchClassifier;
use crate::services::command_worker::CommandSender;
use crate::services::decision::{DecisionEngine, StepOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info};

/// Idle check period
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    /// Motion seen near the door; resumes a paused stream
    Wake,
    /// Operator pause
    Pause,
    /// Operator resume
    Resume,
}

/// Control handle for one stream worker
#[derive(Clone)]
pub struct StreamHandle {
    camera_id: Arc<str>,
    control_tx: mpsc::Sender<StreamControl>,
    paused: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Queue a control message; returns false if the worker is gone or backed up
    pub fn send(&self, control: StreamControl) -> bool {
        self.control_tx.try_send(control).is_ok()
    }
}

pub struct StreamWorker {
    engine: DecisionEngine,
    classifier: MatchClassifier,
    roster: watch::Receiver<SharedRoster>,
    frames_rx: mpsc::Receiver<FramePayload>,
    control_rx: mpsc::Receiver<StreamControl>,
    commands: CommandSender,
    paused: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

pub fn create_stream_worker(
    engine: DecisionEngine,
    classifier: MatchClassifier,
    roster: watch::Receiver<SharedRoster>,
    frames_rx: mpsc::Receiver<FramePayload>,
    commands: CommandSender,
    metrics: Arc<Metrics>,
) -> (StreamHandle, StreamWorker) {
    let (control_tx, control_rx) = mpsc::channel(8);
    let paused = Arc::new(AtomicBool::new(engine.is_paused()));
    let handle = StreamHandle { camera_id: Arc::from(engine.camera_id()), control_tx, paused: paused.clone() };
    let worker = StreamWorker { engine, classifier, roster, frames_rx, control_rx, commands, paused, metrics };
    (handle, worker)
}

impl StreamWorker {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(camera_id = %self.engine.camera_id(), "stream_worker_started");
        let mut idle_check = interval(IDLE_CHECK_INTERVAL);

        loop {
            tokio::select! {
                frame = self.frames_rx.recv() => {
                    match frame {
                        Some(frame) => self.process_frame(&frame, Instant::now()),
                        None => break,
                    }
                }
                Some(control) = self.control_rx.recv() => {
                    self.handle_control(control, Instant::now());
                }
                _ = idle_check.tick() => {
                    self.check_idle(Instant::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(camera_id = %self.engine.camera_id(), "stream_worker_stopped");
    }

    pub fn process_frame(&mut self, frame: &FramePayload, now: Instant) {
        // Paused: drain without classifying
        if self.engine.is_paused() {
            return;
        }

        let started = Instant::now();
        let roster = self.roster.borrow().clone();
        let classification = self.classifier.classify(frame, &roster);
        let outcome = self.engine.step_detailed(&classification, now);
        self.metrics.record_step(started.elapsed().as_micros() as u64);

        match outcome {
            StepOutcome::Emitted(cmd) => {
                self.metrics.record_command(cmd.command_type());
                info!(
                    camera_id = %cmd.camera_id(),
                    command_id = %cmd.id(),
                    command_type = %cmd.command_type().as_str(),
                    reason = %cmd.reason().as_str(),
                    identity_id = %cmd.identity_id().map(|i| i.0.as_str()).unwrap_or("-"),
                    distance = %cmd.candidate().map(|c| c.distance).unwrap_or(f32::NAN),
                    banned = %cmd.banned(),
                    faces = %classification.count(),
                    "access_command_emitted"
                );
                // The buffer was already reset; a dropped enqueue is not retried
                self.commands.send(cmd);
            }
            StepOutcome::Suppressed { .. } => self.metrics.record_cooldown_suppressed(),
            StepOutcome::Voting { kind, count } => {
                debug!(camera_id = %self.engine.camera_id(), kind = %kind.as_str(), count = %count, seq = ?frame.seq, "decision_voting");
            }
            StepOutcome::NoFaces { .. } | StepOutcome::Paused => {}
        }
    }

    pub fn handle_control(&mut self, control: StreamControl, now: Instant) {
        let camera_id = self.engine.camera_id().to_string();
        match control {
            StreamControl::Wake => {
                if self.engine.is_paused() {
                    self.engine.resume(now);
                    self.metrics.record_stream_wake();
                    info!(camera_id = %camera_id, "stream_woken_by_motion");
                }
            }
            StreamControl::Resume => {
                if self.engine.is_paused() {
                    self.engine.resume(now);
                    info!(camera_id = %camera_id, "stream_resumed");
                }
            }
            StreamControl::Pause => {
                if !self.engine.is_paused() {
                    self.engine.pause();
                    info!(camera_id = %camera_id, "stream_paused");
                }
            }
        }
        self.paused.store(self.engine.is_paused(), Ordering::Relaxed);
    }

    /// Apply any queued control messages; returns how many were applied
    pub fn poll_control(&mut self, now: Instant) -> usize {
        let mut applied = 0;
        while let Ok(control) = self.control_rx.try_recv() {
            self.handle_control(control, now);
            applied += 1;
        }
        applied
    }

    pub fn check_idle(&mut self, now: Instant) {
        if self.engine.check_idle(now) {
            self.metrics.record_auto_pause();
            self.paused.store(true, Ordering::Relaxed);
            info!(camera_id = %self.engine.camera_id(), idle_secs = %self.engine.policy().idle_pause.as_secs(), "stream_auto_paused");
        }
    }
}

/// Forward each motion event as a wake to every stream
pub async fn run_motion_fanout(
    mut motion_rx: mpsc::Receiver<MotionPayload>,
    streams: Vec<StreamHandle>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            motion = motion_rx.recv() => {
                if motion.is_none() {
                    return;
                }
                let woken = streams.iter().filter(|s| s.is_paused()).count();
                for stream in &streams {
                    stream.send(StreamControl::Wake);
                }
                debug!(paused_streams = %woken, "motion_received");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
