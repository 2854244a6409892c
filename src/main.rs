//! facegate - face-match access control decision service
//!
//! Consumes per-camera face match frames, votes on a stable decision and
//! publishes unlock/deny commands to the door actuator over MQTT.
//!
//! Module structure:
//! - `domain/` - Core types (roster, classifications, access commands, payloads)
//! - `io/` - External interfaces (MQTT, roster file, audit log, HTTP, hardware)
//! - `services/` - Decision logic and workers
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use facegate::infra::{Config, Metrics};
use facegate::io::audit::create_audit_log;
use facegate::io::mqtt::AccessClientBuilder;
use facegate::io::roster::{load_initial_roster, RosterRefresher};
use facegate::services::command_worker::AccessPublisher;
use facegate::services::stream::run_motion_fanout;
use facegate::services::{
    create_command_worker, create_stream_worker, CooldownRegistry, DecisionEngine, DecisionPolicy, MatchClassifier,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Commands buffered between stream workers and the publisher
const COMMAND_QUEUE_CAPACITY: usize = 32;

/// facegate - face-match access control decision service
#[derive(Parser, Debug)]
#[command(name = "facegate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides; default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "facegate starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    facegate::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        cameras = %config.cameras().len(),
        match_threshold = %config.match_threshold(),
        persistence_frames = %config.persistence_frames(),
        accepted_cooldown_secs = %config.accepted_cooldown().as_secs(),
        unknown_cooldown_secs = %config.unknown_cooldown().as_secs(),
        shared_registry = %config.shared_registry(),
        roster_file = %config.roster_file(),
        "config_loaded"
    );

    if config.cameras().is_empty() {
        warn!("no cameras configured; nothing will be decided");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Roster: initial load, then periodic refresh through a watch channel
    let roster = load_initial_roster(config.roster_file(), &metrics);
    let (roster_tx, roster_rx) = watch::channel(roster);
    let refresher = RosterRefresher::new(config.roster_file(), config.roster_refresh(), roster_tx, metrics.clone());
    tokio::spawn(refresher.run(shutdown_rx.clone()));

    // Routes must be registered before connecting
    let mut builder = AccessClientBuilder::new(&config, config.mqtt_client_id(), metrics.clone());
    let motion_rx = builder.on_motion();
    let frame_routes: Vec<_> = config
        .cameras()
        .iter()
        .map(|camera| (camera.id.clone(), builder.on_frames(&camera.id, &camera.frames_topic)))
        .collect();
    let (client, _mqtt_task) = builder.connect(shutdown_rx.clone());

    // Command worker: publish + audit off the frame path
    let (audit, audit_writer) = create_audit_log(config.audit_file(), metrics.clone());
    let audit_task = tokio::spawn(audit_writer.run());
    let audit = Arc::new(audit);
    let publisher: Arc<dyn AccessPublisher> = Arc::new(client.clone());
    let (commands, command_worker) =
        create_command_worker(publisher, audit, metrics.clone(), COMMAND_QUEUE_CAPACITY);
    let command_task = tokio::spawn(command_worker.run());

    // One stream worker per camera
    let policy = DecisionPolicy::from_config(&config);
    let classifier = MatchClassifier::new(config.match_threshold());
    let shared_registry = CooldownRegistry::shared();
    let mut streams = Vec::with_capacity(frame_routes.len());
    for (camera_id, frames_rx) in frame_routes {
        let registry =
            if config.shared_registry() { shared_registry.clone() } else { CooldownRegistry::shared() };
        let engine = DecisionEngine::new(&camera_id, policy, registry);
        let (handle, worker) = create_stream_worker(
            engine,
            classifier,
            roster_rx.clone(),
            frames_rx,
            commands.clone(),
            metrics.clone(),
        );
        tokio::spawn(worker.run(shutdown_rx.clone()));
        streams.push(handle);
    }
    // Workers hold the remaining senders
    drop(commands);

    tokio::spawn(run_motion_fanout(motion_rx, streams.clone(), shutdown_rx.clone()));

    let http_port = config.http_port();
    if http_port > 0 {
        let http_metrics = metrics.clone();
        let site_id = config.site_id().to_string();
        let connection = client.watch_state();
        let http_streams = streams.clone();
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = facegate::io::prometheus::start_metrics_server(
                http_port,
                http_metrics,
                site_id,
                connection,
                http_streams,
                http_shutdown,
            )
            .await
            {
                error!(error = %e, "metrics_server_error");
            }
        });
    }

    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    info!(streams = %streams.len(), "facegate_started");

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Stream workers exit on shutdown and drop their senders, which drains the command worker
    if tokio::time::timeout(Duration::from_secs(5), command_task).await.is_err() {
        warn!("command_worker_drain_timeout");
    }
    // The command worker held the last audit handle
    if tokio::time::timeout(Duration::from_secs(2), audit_task).await.is_err() {
        warn!("audit_writer_drain_timeout");
    }

    info!("facegate shutdown complete");
    Ok(())
}
