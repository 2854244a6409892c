//! facegate-actuator - door lock controller
//!
//! Subscribes to access commands, drives the lock servo and buzzer, reports
//! its state and publishes PIR motion so the decision side can wake paused
//! streams.

use clap::Parser;
use facegate::infra::{Config, Metrics};
use facegate::io::hardware::{
    GpioBuzzer, GpioPir, LockDriver, MotionSensor, SimulatedLock, SimulatedPir, SimulatedSounder, Sounder,
    SysfsServoLock,
};
use facegate::io::mqtt::AccessClientBuilder;
use facegate::services::actuator::{
    run_motion_loop, ActuatorController, ActuatorPolicy, ActuatorRunner, ActuatorUplink, MotionDebouncer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// facegate-actuator - door lock controller
#[derive(Parser, Debug)]
#[command(name = "facegate-actuator", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Use log-only drivers regardless of config
    #[arg(long)]
    simulate: bool,
}

struct Hardware {
    lock: Arc<dyn LockDriver>,
    sounder: Arc<dyn Sounder>,
    pir: Arc<dyn MotionSensor>,
}

async fn open_hardware(config: &Config, simulate: bool) -> Result<Hardware, Box<dyn std::error::Error>> {
    let hw = config.actuator();
    if simulate || hw.simulate {
        info!("actuator_hardware_simulated");
        return Ok(Hardware {
            lock: Arc::new(SimulatedLock::default()),
            sounder: Arc::new(SimulatedSounder::default()),
            pir: Arc::new(SimulatedPir::default()),
        });
    }

    let lock = Arc::new(SysfsServoLock::new(hw.pwm_chip, hw.pwm_channel, hw.locked_duty_pct, hw.unlocked_duty_pct));
    let sounder: Arc<dyn Sounder> = match hw.buzzer_gpio {
        Some(pin) => Arc::new(GpioBuzzer::open(pin).await?),
        None => {
            warn!("no buzzer configured; feedback is log-only");
            Arc::new(SimulatedSounder::default())
        }
    };
    let pir = Arc::new(GpioPir::open(hw.pir_gpio).await?);

    info!(
        pwm_chip = %hw.pwm_chip,
        pwm_channel = %hw.pwm_channel,
        buzzer_gpio = ?hw.buzzer_gpio,
        pir_gpio = %hw.pir_gpio,
        "actuator_hardware_opened"
    );
    Ok(Hardware { lock, sounder, pir })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "facegate-actuator starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        access_topic = %config.access_topic(),
        unlock_duration_ms = %config.unlock_duration().as_millis(),
        retrigger_interval_ms = %config.retrigger_interval().as_millis(),
        "config_loaded"
    );

    let hardware = open_hardware(&config, args.simulate).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let client_id = format!("{}-actuator", config.mqtt_client_id());
    let mut builder = AccessClientBuilder::new(&config, &client_id, metrics);
    let access_rx = builder.on_access();
    let (client, _mqtt_task) = builder.connect(shutdown_rx.clone());
    let connection = client.watch_state();
    let uplink: Arc<dyn ActuatorUplink> = Arc::new(client);

    // Lock is driven to Locked before the first command is consumed
    let controller = ActuatorController::new(ActuatorPolicy::from_config(&config));
    let mut runner = ActuatorRunner::new(controller, hardware.lock, hardware.sounder, uplink.clone());
    runner.initialize().await;

    let runner_task = tokio::spawn(runner.run(access_rx, connection, shutdown_rx.clone()));

    let poll = Duration::from_millis(config.actuator().pir_poll_ms.max(10));
    tokio::spawn(run_motion_loop(
        hardware.pir,
        uplink,
        MotionDebouncer::new(config.motion_cooldown()),
        poll,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // The runner relocks on its way out
    if tokio::time::timeout(Duration::from_secs(5), runner_task).await.is_err() {
        warn!("actuator_relock_timeout");
    }

    info!("facegate-actuator shutdown complete");
    Ok(())
}
