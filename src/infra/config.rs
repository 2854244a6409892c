//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Upper bound on a single connect attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_client_id() -> String {
    "facegate".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_motion_topic")]
    pub motion: String,
    #[serde(default = "default_access_topic")]
    pub access: String,
    #[serde(default = "default_status_topic")]
    pub status: String,
}

fn default_motion_topic() -> String {
    "facebase/motion".to_string()
}

fn default_access_topic() -> String {
    "facebase/access".to_string()
}

fn default_status_topic() -> String {
    "facebase/status".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            motion: default_motion_topic(),
            access: default_access_topic(),
            status: default_status_topic(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_broker_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionConfig {
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
    #[serde(default = "default_persistence_frames")]
    pub persistence_frames: u32,
    #[serde(default = "default_disappearance_reset_ms")]
    pub disappearance_reset_ms: u64,
    #[serde(default = "default_accepted_cooldown_secs")]
    pub accepted_cooldown_secs: u64,
    #[serde(default = "default_unknown_cooldown_secs")]
    pub unknown_cooldown_secs: u64,
    #[serde(default = "default_idle_pause_secs")]
    pub idle_pause_secs: u64,
    /// Share one cooldown registry across all cameras (cameras guarding one door)
    #[serde(default = "default_shared_registry")]
    pub shared_registry: bool,
}

fn default_match_threshold() -> f32 {
    0.45
}

fn default_persistence_frames() -> u32 {
    3
}

fn default_disappearance_reset_ms() -> u64 {
    2000
}

fn default_accepted_cooldown_secs() -> u64 {
    15
}

fn default_unknown_cooldown_secs() -> u64 {
    6
}

fn default_idle_pause_secs() -> u64 {
    300
}

fn default_shared_registry() -> bool {
    true
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            persistence_frames: default_persistence_frames(),
            disappearance_reset_ms: default_disappearance_reset_ms(),
            accepted_cooldown_secs: default_accepted_cooldown_secs(),
            unknown_cooldown_secs: default_unknown_cooldown_secs(),
            idle_pause_secs: default_idle_pause_secs(),
            shared_registry: default_shared_registry(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub frames_topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentitiesConfig {
    #[serde(default = "default_roster_file")]
    pub roster_file: String,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

fn default_roster_file() -> String {
    "roster.json".to_string()
}

fn default_refresh_secs() -> u64 {
    60
}

impl Default for IdentitiesConfig {
    fn default() -> Self {
        Self { roster_file: default_roster_file(), refresh_secs: default_refresh_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// File path for the access audit log (JSONL format)
    #[serde(default = "default_audit_file")]
    pub file: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { file: default_audit_file() }
    }
}

fn default_audit_file() -> String {
    "access.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Operator HTTP port (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_http_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), http_port: default_http_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    #[serde(default = "default_unlock_duration_ms")]
    pub unlock_duration_ms: u64,
    /// Minimum interval between two physical actuations, independent of the sender
    #[serde(default = "default_retrigger_interval_ms")]
    pub retrigger_interval_ms: u64,
    #[serde(default = "default_motion_cooldown_ms")]
    pub motion_cooldown_ms: u64,
    /// Log-only drivers instead of sysfs hardware
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub pwm_chip: u32,
    #[serde(default)]
    pub pwm_channel: u32,
    #[serde(default = "default_locked_duty_pct")]
    pub locked_duty_pct: f64,
    #[serde(default = "default_unlocked_duty_pct")]
    pub unlocked_duty_pct: f64,
    #[serde(default)]
    pub buzzer_gpio: Option<u32>,
    #[serde(default = "default_pir_gpio")]
    pub pir_gpio: u32,
    #[serde(default = "default_pir_poll_ms")]
    pub pir_poll_ms: u64,
}

fn default_unlock_duration_ms() -> u64 {
    3000
}

fn default_retrigger_interval_ms() -> u64 {
    5000
}

fn default_motion_cooldown_ms() -> u64 {
    5000
}

fn default_locked_duty_pct() -> f64 {
    9.7 // ~130 degrees on an SG90 at 50Hz
}

fn default_unlocked_duty_pct() -> f64 {
    3.0 // ~10 degrees
}

fn default_pir_gpio() -> u32 {
    4
}

fn default_pir_poll_ms() -> u64 {
    100
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            unlock_duration_ms: default_unlock_duration_ms(),
            retrigger_interval_ms: default_retrigger_interval_ms(),
            motion_cooldown_ms: default_motion_cooldown_ms(),
            simulate: true,
            pwm_chip: 0,
            pwm_channel: 0,
            locked_duty_pct: default_locked_duty_pct(),
            unlocked_duty_pct: default_unlocked_duty_pct(),
            buzzer_gpio: Some(27),
            pir_gpio: default_pir_gpio(),
            pir_poll_ms: default_pir_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "front-door")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "facegate".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub identities: IdentitiesConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt: MqttConfig,
    topics: TopicsConfig,
    broker: BrokerConfig,
    decision: DecisionConfig,
    cameras: Vec<CameraConfig>,
    identities: IdentitiesConfig,
    audit: AuditConfig,
    metrics: MetricsConfig,
    actuator: ActuatorConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            mqtt: MqttConfig {
                host: "localhost".to_string(),
                port: 1883,
                username: None,
                password: None,
                client_id: default_client_id(),
                connect_timeout_ms: default_connect_timeout_ms(),
                backoff_initial_ms: default_backoff_initial_ms(),
                backoff_max_ms: default_backoff_max_ms(),
            },
            topics: TopicsConfig::default(),
            broker: BrokerConfig::default(),
            decision: DecisionConfig::default(),
            cameras: vec![CameraConfig {
                id: "front".to_string(),
                frames_topic: "facebase/frames/front".to_string(),
            }],
            identities: IdentitiesConfig::default(),
            audit: AuditConfig::default(),
            metrics: MetricsConfig::default(),
            actuator: ActuatorConfig::default(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self {
            site_id: toml_config.site.id,
            mqtt: toml_config.mqtt,
            topics: toml_config.topics,
            broker: toml_config.broker,
            decision: toml_config.decision,
            cameras: toml_config.cameras,
            identities: toml_config.identities,
            audit: toml_config.audit,
            metrics: toml_config.metrics,
            actuator: toml_config.actuator,
            config_file: path.display().to_string(),
        };
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(self.decision.match_threshold > 0.0) {
            anyhow::bail!("decision.match_threshold must be positive");
        }
        if self.decision.persistence_frames == 0 {
            anyhow::bail!("decision.persistence_frames must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id.as_str()) {
                anyhow::bail!("duplicate camera id {}", camera.id);
            }
        }
        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // MQTT getters
    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt.client_id
    }

    pub fn mqtt_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt.connect_timeout_ms)
    }

    pub fn mqtt_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.mqtt.backoff_initial_ms)
    }

    pub fn mqtt_backoff_max(&self) -> Duration {
        Duration::from_millis(self.mqtt.backoff_max_ms)
    }

    // Topic getters
    pub fn motion_topic(&self) -> &str {
        &self.topics.motion
    }

    pub fn access_topic(&self) -> &str {
        &self.topics.access
    }

    pub fn status_topic(&self) -> &str {
        &self.topics.status
    }

    // Broker getters
    pub fn broker_enabled(&self) -> bool {
        self.broker.enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker.bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker.port
    }

    // Decision getters
    pub fn match_threshold(&self) -> f32 {
        self.decision.match_threshold
    }

    pub fn persistence_frames(&self) -> u32 {
        self.decision.persistence_frames
    }

    pub fn disappearance_reset(&self) -> Duration {
        Duration::from_millis(self.decision.disappearance_reset_ms)
    }

    pub fn accepted_cooldown(&self) -> Duration {
        Duration::from_secs(self.decision.accepted_cooldown_secs)
    }

    pub fn unknown_cooldown(&self) -> Duration {
        Duration::from_secs(self.decision.unknown_cooldown_secs)
    }

    pub fn idle_pause(&self) -> Duration {
        Duration::from_secs(self.decision.idle_pause_secs)
    }

    pub fn shared_registry(&self) -> bool {
        self.decision.shared_registry
    }

    pub fn cameras(&self) -> &[CameraConfig] {
        &self.cameras
    }

    // Identity store getters
    pub fn roster_file(&self) -> &str {
        &self.identities.roster_file
    }

    pub fn roster_refresh(&self) -> Duration {
        Duration::from_secs(self.identities.refresh_secs.max(1))
    }

    pub fn audit_file(&self) -> &str {
        &self.audit.file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    pub fn http_port(&self) -> u16 {
        self.metrics.http_port
    }

    // Actuator getters
    pub fn unlock_duration(&self) -> Duration {
        Duration::from_millis(self.actuator.unlock_duration_ms)
    }

    pub fn retrigger_interval(&self) -> Duration {
        Duration::from_millis(self.actuator.retrigger_interval_ms)
    }

    pub fn motion_cooldown(&self) -> Duration {
        Duration::from_millis(self.actuator.motion_cooldown_ms)
    }

    pub fn actuator(&self) -> &ActuatorConfig {
        &self.actuator
    }

    /// Builder method for tests to replace the camera list
    #[cfg(test)]
    pub fn with_cameras(mut self, cameras: Vec<CameraConfig>) -> Self {
        self.cameras = cameras;
        self
    }
}
