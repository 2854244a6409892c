//! Access channel test tool
//!
//! Publishes hand-made commands and motion events, or watches every facegate
//! topic. Useful for exercising the actuator without cameras.

use chrono::Local;
use clap::{Parser, Subcommand};
use facegate::domain::payload::AccessPayload;
use facegate::domain::types::{AccessCommand, DecisionReason};
use facegate::infra::{Config, Metrics};
use facegate::io::mqtt::{AccessClient, AccessClientBuilder};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "facegate-test", about = "Access channel test tool")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Seconds to wait for the broker
    #[arg(long, default_value = "5")]
    timeout: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Send an unlock command
    Unlock,
    /// Send a deny command
    Deny {
        /// Mark the denial as a banned identity
        #[arg(long)]
        banned: bool,
    },
    /// Send a cooldown notice
    Cooldown {
        #[arg(long, default_value = "5")]
        retry_after: f64,
    },
    /// Send a motion event
    Motion,
    /// Print everything on the facegate topics
    Monitor,
}

fn ts() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

async fn wait_connected(client: &AccessClient, timeout: Duration) -> bool {
    let mut state = client.watch_state();
    tokio::time::timeout(timeout, async {
        while !state.borrow().is_connected() {
            if state.changed().await.is_err() {
                return false;
            }
        }
        true
    })
    .await
    .unwrap_or(false)
}

async fn publish(config: &Config, command: Cmd, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client_id = format!("facegate-test-{}", std::process::id());
    let builder = AccessClientBuilder::new(config, &client_id, Arc::new(Metrics::new()));
    let (client, task) = builder.connect(shutdown_rx);

    if !wait_connected(&client, timeout).await {
        return Err(format!("broker {}:{} not reachable", config.mqtt_host(), config.mqtt_port()).into());
    }

    let camera = "manual";
    let result = match command {
        Cmd::Unlock => client.publish_access(&AccessCommand::manual_unlock(camera)),
        Cmd::Deny { banned } => {
            let reason = if banned { DecisionReason::Banned } else { DecisionReason::Manual };
            client.publish_access(&AccessCommand::deny(camera, reason, banned, None))
        }
        Cmd::Cooldown { retry_after } => client.publish_access(&AccessCommand::cooldown(camera, retry_after)),
        Cmd::Motion => client.publish_motion(),
        Cmd::Monitor => Ok(()),
    };
    result?;
    println!("[{}] sent", ts());

    // QoS 0: give the eventloop a moment to flush before disconnecting
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _ = shutdown_tx.send(true);
    let _ = task.await;
    Ok(())
}

async fn monitor(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client_id = format!("facegate-monitor-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    options.set_keep_alive(Duration::from_secs(5));
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        options.set_credentials(username, password);
    }
    let (client, mut eventloop) = AsyncClient::new(options, 16);

    let mut topics: Vec<String> = vec![
        config.motion_topic().to_string(),
        config.access_topic().to_string(),
        config.status_topic().to_string(),
    ];
    topics.extend(config.cameras().iter().map(|c| c.frames_topic.clone()));

    println!("[{}] monitoring {} topics on {}:{}", ts(), topics.len(), config.mqtt_host(), config.mqtt_port());

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                for topic in &topics {
                    client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;
                }
                println!("[{}] connected", ts());
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let body = String::from_utf8_lossy(&p.payload);
                if p.topic == config.access_topic() {
                    match serde_json::from_str::<AccessPayload>(&body) {
                        Ok(access) => println!(
                            "[{}] ACCESS {} banned={} retry_after={:?}",
                            ts(),
                            access.result.as_str(),
                            access.banned,
                            access.retry_after
                        ),
                        Err(e) => println!("[{}] ACCESS (malformed: {}) {}", ts(), e, body),
                    }
                } else {
                    println!("[{}] {} {}", ts(), p.topic, body);
                }
            }
            Ok(_) => {}
            Err(e) => {
                println!("[{}] connection error: {}", ts(), e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    match args.command {
        Cmd::Monitor => monitor(&config).await,
        command => publish(&config, command, Duration::from_secs(args.timeout)).await,
    }
}
