//! Access command worker - publishes decisions off the frame path
//!
//! Stream workers enqueue with `try_send` and never wait on the transport.
//! The worker publishes each command once: a failed publish is logged and
//! audited as undelivered, never retried.

use crate::domain::types::AccessCommand;
use crate::infra::metrics::Metrics;
use crate::io::audit::AuditSink;
use crate::io::mqtt::{AccessClient, PublishError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

/// Commands older than this are discarded instead of published
pub const MAX_COMMAND_AGE: Duration = Duration::from_secs(2);

/// Outbound seam to the actuator
#[async_trait]
pub trait AccessPublisher: Send + Sync {
    async fn publish_access(&self, cmd: &AccessCommand) -> Result<(), PublishError>;
}

#[async_trait]
impl AccessPublisher for AccessClient {
    async fn publish_access(&self, cmd: &AccessCommand) -> Result<(), PublishError> {
        AccessClient::publish_access(self, cmd)
    }
}

/// A command waiting to be published
#[derive(Debug)]
pub struct QueuedCommand {
    pub command: AccessCommand,
    /// When the command was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// Cloneable enqueue handle given to stream workers
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<QueuedCommand>,
    metrics: Arc<Metrics>,
}

impl CommandSender {
    /// Enqueue without waiting; returns false if the command was dropped
    pub fn send(&self, command: AccessCommand) -> bool {
        let queued = QueuedCommand { command, enqueued_at: Instant::now() };
        match self.tx.try_send(queued) {
            Ok(()) => true,
            Err(TrySendError::Full(q)) => {
                self.metrics.record_command_dropped();
                error!(command_id = %q.command.id(), camera_id = %q.command.camera_id(), "access_command_dropped: queue full");
                false
            }
            Err(TrySendError::Closed(q)) => {
                self.metrics.record_command_dropped();
                warn!(command_id = %q.command.id(), "access_command_dropped: worker stopped");
                false
            }
        }
    }
}

pub struct CommandWorker {
    publisher: Arc<dyn AccessPublisher>,
    audit: Arc<dyn AuditSink>,
    cmd_rx: mpsc::Receiver<QueuedCommand>,
    metrics: Arc<Metrics>,
}

/// Bounded command queue
pub fn command_channel(capacity: usize, metrics: Arc<Metrics>) -> (CommandSender, mpsc::Receiver<QueuedCommand>) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandSender { tx, metrics }, rx)
}

/// Create the sender/worker pair
pub fn create_command_worker(
    publisher: Arc<dyn AccessPublisher>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<Metrics>,
    capacity: usize,
) -> (CommandSender, CommandWorker) {
    let (sender, cmd_rx) = command_channel(capacity, metrics.clone());
    (sender, CommandWorker::new(publisher, audit, cmd_rx, metrics))
}

impl CommandWorker {
    pub fn new(
        publisher: Arc<dyn AccessPublisher>,
        audit: Arc<dyn AuditSink>,
        cmd_rx: mpsc::Receiver<QueuedCommand>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { publisher, audit, cmd_rx, metrics }
    }

    /// Run until every sender is dropped
    pub async fn run(mut self) {
        info!("command_worker_started");

        while let Some(queued) = self.cmd_rx.recv().await {
            self.process(queued).await;
        }

        info!("command_worker_stopped");
    }

    async fn process(&self, queued: QueuedCommand) {
        let cmd = queued.command;
        let queue_delay = queued.enqueued_at.elapsed();

        if queue_delay > MAX_COMMAND_AGE {
            self.metrics.record_publish(false);
            warn!(
                command_id = %cmd.id(),
                command_type = %cmd.command_type().as_str(),
                queue_delay_ms = %queue_delay.as_millis(),
                "access_command_expired"
            );
            self.audit.record(&cmd, false);
            return;
        }

        let result = self.publisher.publish_access(&cmd).await;
        let delivered = result.is_ok();
        self.metrics.record_publish(delivered);

        match result {
            Ok(()) => info!(
                command_id = %cmd.id(),
                camera_id = %cmd.camera_id(),
                command_type = %cmd.command_type().as_str(),
                reason = %cmd.reason().as_str(),
                banned = %cmd.banned(),
                identity_id = %cmd.identity_id().map(|i| i.0.as_str()).unwrap_or("-"),
                queue_delay_us = %queue_delay.as_micros(),
                "access_command_published"
            ),
            Err(e) => log_publish_failed(&cmd, &e),
        }

        self.audit.record(&cmd, delivered);
    }
}

#[cold]
#[inline(never)]
fn log_publish_failed(cmd: &AccessCommand, e: &PublishError) {
    error!(
        command_id = %cmd.id(),
        camera_id = %cmd.camera_id(),
        command_type = %cmd.command_type().as_str(),
        error = %e,
        "access_command_publish_failed"
    );
}
