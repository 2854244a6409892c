//! Actuator hardware: lock servo, buzzer, PIR sensor
//!
//! Linux sysfs drivers for a Raspberry Pi class board, plus simulated drivers
//! that only log (development and tests).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Servo PWM period for 50 Hz
const SERVO_PERIOD_NS: u64 = 20_000_000;

/// Signal hold after a move; the servo is released afterwards to stop jitter
const SERVO_SETTLE: Duration = Duration::from_millis(500);

const GPIO_ROOT: &str = "/sys/class/gpio";
const PWM_ROOT: &str = "/sys/class/pwm";

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected value {value:?} from {path}")]
    BadValue { path: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPosition {
    Locked,
    Unlocked,
}

impl LockPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockPosition::Locked => "locked",
            LockPosition::Unlocked => "unlocked",
        }
    }
}

/// One buzzer beep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tone {
    pub on: Duration,
    pub off: Duration,
}

const fn tone(on_ms: u64, off_ms: u64) -> Tone {
    Tone { on: Duration::from_millis(on_ms), off: Duration::from_millis(off_ms) }
}

const UNLOCK_TONES: [Tone; 3] = [tone(100, 100); 3];
const UNKNOWN_TONES: [Tone; 1] = [tone(1000, 0)];
const BANNED_TONES: [Tone; 5] = [tone(250, 250); 5];
const COOLDOWN_TONES: [Tone; 2] = [tone(300, 200); 2];

/// Audible feedback patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackPattern {
    /// 3 short tones
    Unlock,
    /// 1 long tone
    UnknownDenial,
    /// 5 fast tones
    BannedDenial,
    /// 2 medium tones
    Cooldown,
}

impl FeedbackPattern {
    pub fn tones(&self) -> &'static [Tone] {
        match self {
            FeedbackPattern::Unlock => &UNLOCK_TONES,
            FeedbackPattern::UnknownDenial => &UNKNOWN_TONES,
            FeedbackPattern::BannedDenial => &BANNED_TONES,
            FeedbackPattern::Cooldown => &COOLDOWN_TONES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackPattern::Unlock => "unlock",
            FeedbackPattern::UnknownDenial => "unknown_denial",
            FeedbackPattern::BannedDenial => "banned_denial",
            FeedbackPattern::Cooldown => "cooldown",
        }
    }

    pub fn duration(&self) -> Duration {
        self.tones().iter().map(|t| t.on + t.off).sum()
    }
}

#[async_trait]
pub trait LockDriver: Send + Sync {
    async fn move_to(&self, position: LockPosition) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait Sounder: Send + Sync {
    async fn play(&self, pattern: FeedbackPattern) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait MotionSensor: Send + Sync {
    async fn is_triggered(&self) -> Result<bool, HardwareError>;
}

async fn write_sysfs(path: &Path, value: &str) -> Result<(), HardwareError> {
    tokio::fs::write(path, value).await.map_err(|source| HardwareError::Io {
        op: "write",
        path: path.display().to_string(),
        source,
    })
}

async fn read_sysfs(path: &Path) -> Result<String, HardwareError> {
    tokio::fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|source| HardwareError::Io { op: "read", path: path.display().to_string(), source })
}

/// Export a sysfs line if its directory does not exist yet
async fn ensure_exported(export: &Path, line_dir: &Path, index: u32) -> Result<(), HardwareError> {
    if tokio::fs::metadata(line_dir).await.is_ok() {
        return Ok(());
    }
    write_sysfs(export, &index.to_string()).await?;
    // udev needs a moment to apply permissions
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

/// Duty cycle in nanoseconds for a percent of the servo period
pub fn duty_ns(duty_pct: f64) -> u64 {
    (SERVO_PERIOD_NS as f64 * duty_pct.clamp(0.0, 100.0) / 100.0).round() as u64
}

/// Hobby servo on a sysfs PWM channel
pub struct SysfsServoLock {
    chip_dir: PathBuf,
    channel: u32,
    locked_duty_pct: f64,
    unlocked_duty_pct: f64,
}

impl SysfsServoLock {
    pub fn new(chip: u32, channel: u32, locked_duty_pct: f64, unlocked_duty_pct: f64) -> Self {
        Self {
            chip_dir: Path::new(PWM_ROOT).join(format!("pwmchip{}", chip)),
            channel,
            locked_duty_pct,
            unlocked_duty_pct,
        }
    }

    fn channel_dir(&self) -> PathBuf {
        self.chip_dir.join(format!("pwm{}", self.channel))
    }
}

#[async_trait]
impl LockDriver for SysfsServoLock {
    async fn move_to(&self, position: LockPosition) -> Result<(), HardwareError> {
        let dir = self.channel_dir();
        ensure_exported(&self.chip_dir.join("export"), &dir, self.channel).await?;

        let pct = match position {
            LockPosition::Locked => self.locked_duty_pct,
            LockPosition::Unlocked => self.unlocked_duty_pct,
        };
        write_sysfs(&dir.join("period"), &SERVO_PERIOD_NS.to_string()).await?;
        write_sysfs(&dir.join("duty_cycle"), &duty_ns(pct).to_string()).await?;
        write_sysfs(&dir.join("enable"), "1").await?;
        tokio::time::sleep(SERVO_SETTLE).await;
        write_sysfs(&dir.join("enable"), "0").await?;

        debug!(position = %position.as_str(), duty_pct = %pct, "servo_moved");
        Ok(())
    }
}

/// A sysfs GPIO line
pub struct SysfsGpio {
    pin: u32,
    dir: PathBuf,
}

impl SysfsGpio {
    pub fn new(pin: u32) -> Self {
        Self { pin, dir: Path::new(GPIO_ROOT).join(format!("gpio{}", pin)) }
    }

    async fn setup(&self, direction: &str) -> Result<(), HardwareError> {
        ensure_exported(&Path::new(GPIO_ROOT).join("export"), &self.dir, self.pin).await?;
        write_sysfs(&self.dir.join("direction"), direction).await
    }

    async fn set(&self, high: bool) -> Result<(), HardwareError> {
        write_sysfs(&self.dir.join("value"), if high { "1" } else { "0" }).await
    }

    async fn get(&self) -> Result<bool, HardwareError> {
        let path = self.dir.join("value");
        match read_sysfs(&path).await?.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(HardwareError::BadValue { path: path.display().to_string(), value: other.to_string() }),
        }
    }
}

/// Active buzzer on a GPIO output
pub struct GpioBuzzer {
    gpio: SysfsGpio,
}

impl GpioBuzzer {
    pub async fn open(pin: u32) -> Result<Self, HardwareError> {
        let gpio = SysfsGpio::new(pin);
        gpio.setup("out").await?;
        gpio.set(false).await?;
        Ok(Self { gpio })
    }
}

#[async_trait]
impl Sounder for GpioBuzzer {
    async fn play(&self, pattern: FeedbackPattern) -> Result<(), HardwareError> {
        for t in pattern.tones() {
            self.gpio.set(true).await?;
            tokio::time::sleep(t.on).await;
            self.gpio.set(false).await?;
            if !t.off.is_zero() {
                tokio::time::sleep(t.off).await;
            }
        }
        Ok(())
    }
}

/// PIR motion sensor on a GPIO input
pub struct GpioPir {
    gpio: SysfsGpio,
}

impl GpioPir {
    pub async fn open(pin: u32) -> Result<Self, HardwareError> {
        let gpio = SysfsGpio::new(pin);
        gpio.setup("in").await?;
        Ok(Self { gpio })
    }
}

#[async_trait]
impl MotionSensor for GpioPir {
    async fn is_triggered(&self) -> Result<bool, HardwareError> {
        self.gpio.get().await
    }
}

/// Logs moves instead of driving a servo
#[derive(Debug)]
pub struct SimulatedLock {
    position: Mutex<Option<LockPosition>>,
}

impl Default for SimulatedLock {
    fn default() -> Self {
        Self { position: Mutex::new(None) }
    }
}

impl SimulatedLock {
    pub fn position(&self) -> Option<LockPosition> {
        *self.position.lock()
    }
}

#[async_trait]
impl LockDriver for SimulatedLock {
    async fn move_to(&self, position: LockPosition) -> Result<(), HardwareError> {
        *self.position.lock() = Some(position);
        info!(position = %position.as_str(), "sim_lock_moved");
        Ok(())
    }
}

/// Logs patterns instead of beeping
#[derive(Debug, Default)]
pub struct SimulatedSounder {
    played: Mutex<Vec<FeedbackPattern>>,
}

impl SimulatedSounder {
    pub fn played(&self) -> Vec<FeedbackPattern> {
        self.played.lock().clone()
    }
}

#[async_trait]
impl Sounder for SimulatedSounder {
    async fn play(&self, pattern: FeedbackPattern) -> Result<(), HardwareError> {
        self.played.lock().push(pattern);
        info!(pattern = %pattern.as_str(), tones = %pattern.tones().len(), "sim_feedback_played");
        Ok(())
    }
}

/// Motion sensor driven by `trigger()`; each trigger is read once
#[derive(Debug, Default)]
pub struct SimulatedPir {
    pending: AtomicBool,
}

impl SimulatedPir {
    pub fn trigger(&self) {
        self.pending.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl MotionSensor for SimulatedPir {
    async fn is_triggered(&self) -> Result<bool, HardwareError> {
        Ok(self.pending.swap(false, Ordering::Relaxed))
    }
}
