//! Servo-driven lock with scoped relock.
//!
//! The lock moves LOCKED → UNLOCKED → LOCKED only. Once an unlock has been
//! commanded, a drop guard owns the relock so that an early return, a stop
//! request during the dwell, or a panic all end with the servo driven back
//! to the locked angle.

use crate::signal::StopSignal;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SYSFS_PWM_ROOT: &str = "/sys/class/pwm";

#[derive(Error, Debug)]
pub enum ActuatorError {
    #[error("PWM {action} failed: {source}")]
    Pwm {
        action: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("unlock requested while already unlocked")]
    AlreadyUnlocked,
    #[error("relock could not be confirmed: {0}")]
    RelockFailed(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorPosition {
    Locked,
    Unlocked,
}

/// Servo wiring and geometry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    /// sysfs PWM chip index (`/sys/class/pwm/pwmchipN`).
    pub chip: u32,
    /// Channel on the chip.
    pub channel: u32,
    pub frequency_hz: u32,
    pub locked_angle: f32,
    pub unlocked_angle: f32,
    /// Time allowed for the horn to reach the commanded angle before the
    /// pulse train is stopped.
    pub settle_ms: u64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            chip: 0,
            channel: 0,
            frequency_hz: 50,
            locked_angle: 0.0,
            unlocked_angle: 90.0,
            settle_ms: 1000,
        }
    }
}

/// Hobby-servo duty cycle in percent for `angle` degrees at 50 Hz
/// (2% at 0°, 12% at 180°).
pub fn angle_to_duty(angle: f32) -> f32 {
    angle.clamp(0.0, 180.0) / 18.0 + 2.0
}

/// A PWM output able to hold a duty cycle.
pub trait PwmChannel {
    /// Set the duty cycle in percent; `0.0` stops the pulse train.
    fn set_duty_cycle(&mut self, percent: f32) -> io::Result<()>;
}

/// Linux sysfs PWM channel. Exported and enabled on open, disabled and
/// unexported on drop.
pub struct SysfsPwm {
    chip_dir: PathBuf,
    channel: u32,
    period_ns: u64,
    exported_here: bool,
}

impl SysfsPwm {
    pub fn open(chip: u32, channel: u32, frequency_hz: u32) -> io::Result<Self> {
        Self::open_at(Path::new(SYSFS_PWM_ROOT), chip, channel, frequency_hz)
    }

    /// Open a channel under an alternate sysfs root.
    pub fn open_at(root: &Path, chip: u32, channel: u32, frequency_hz: u32) -> io::Result<Self> {
        if frequency_hz == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "PWM frequency must be non-zero"));
        }
        let chip_dir = root.join(format!("pwmchip{chip}"));
        let mut pwm = Self {
            chip_dir,
            channel,
            period_ns: 1_000_000_000 / u64::from(frequency_hz),
            exported_here: false,
        };

        if !pwm.channel_dir().exists() {
            fs::write(pwm.chip_dir.join("export"), channel.to_string())?;
            pwm.exported_here = true;
        }
        pwm.write_attr("period", pwm.period_ns)?;
        pwm.write_attr("duty_cycle", 0)?;
        pwm.write_attr("enable", 1)?;

        tracing::info!(
            chip = %pwm.chip_dir.display(),
            channel,
            period_ns = pwm.period_ns,
            "PWM channel enabled"
        );
        Ok(pwm)
    }

    fn channel_dir(&self) -> PathBuf {
        self.chip_dir.join(format!("pwm{}", self.channel))
    }

    fn write_attr(&self, name: &str, value: u64) -> io::Result<()> {
        fs::write(self.channel_dir().join(name), value.to_string())
    }
}

impl PwmChannel for SysfsPwm {
    fn set_duty_cycle(&mut self, percent: f32) -> io::Result<()> {
        let duty_ns = (self.period_ns as f64 * f64::from(percent.clamp(0.0, 100.0)) / 100.0) as u64;
        self.write_attr("duty_cycle", duty_ns)
    }
}

impl Drop for SysfsPwm {
    fn drop(&mut self) {
        if let Err(e) = self.write_attr("enable", 0) {
            tracing::warn!(error = %e, "PWM disable failed");
        }
        if self.exported_here {
            if let Err(e) = fs::write(self.chip_dir.join("unexport"), self.channel.to_string()) {
                tracing::warn!(error = %e, "PWM unexport failed");
            }
        }
    }
}

/// Lock mechanism as seen by the control loop.
pub trait Actuator {
    fn position(&self) -> ActuatorPosition;

    /// Unlock, hold for `dwell` (cut short if `stop` trips), then relock.
    fn unlock_and_hold(&mut self, dwell: Duration, stop: &StopSignal) -> Result<(), ActuatorError>;
}

/// Servo lock driven through a [`PwmChannel`].
pub struct LockActuator<P: PwmChannel> {
    pwm: P,
    config: ServoConfig,
    position: ActuatorPosition,
}

impl<P: PwmChannel> LockActuator<P> {
    /// Take ownership of the channel and drive the servo to the locked angle,
    /// so the tracked position matches the mechanism from the start.
    pub fn new(pwm: P, config: ServoConfig) -> Result<Self, ActuatorError> {
        let mut actuator = Self {
            pwm,
            config,
            position: ActuatorPosition::Locked,
        };
        actuator.drive(ActuatorPosition::Locked)?;
        Ok(actuator)
    }

    fn drive(&mut self, target: ActuatorPosition) -> Result<(), ActuatorError> {
        let angle = match target {
            ActuatorPosition::Locked => self.config.locked_angle,
            ActuatorPosition::Unlocked => self.config.unlocked_angle,
        };

        self.pwm
            .set_duty_cycle(angle_to_duty(angle))
            .map_err(|source| ActuatorError::Pwm { action: "move", source })?;
        std::thread::sleep(Duration::from_millis(self.config.settle_ms));
        // Stop pulsing once in place to avoid servo jitter.
        self.pwm
            .set_duty_cycle(0.0)
            .map_err(|source| ActuatorError::Pwm { action: "idle", source })?;

        self.position = target;
        tracing::debug!(?target, angle, "servo moved");
        Ok(())
    }
}

impl<P: PwmChannel> Actuator for LockActuator<P> {
    fn position(&self) -> ActuatorPosition {
        self.position
    }

    fn unlock_and_hold(&mut self, dwell: Duration, stop: &StopSignal) -> Result<(), ActuatorError> {
        if self.position == ActuatorPosition::Unlocked {
            return Err(ActuatorError::AlreadyUnlocked);
        }

        let mut guard = RelockGuard::arm(self);
        if let Err(e) = guard.actuator.drive(ActuatorPosition::Unlocked) {
            guard.relock()?;
            return Err(e);
        }

        tracing::info!(dwell_ms = dwell.as_millis() as u64, "lock released");
        if stop.wait(dwell) {
            tracing::info!("stop requested during dwell; relocking early");
        }
        guard.relock()?;
        tracing::info!("lock engaged");
        Ok(())
    }
}

/// Relocks on drop unless [`relock`](Self::relock) already ran.
struct RelockGuard<'a, P: PwmChannel> {
    actuator: &'a mut LockActuator<P>,
    armed: bool,
}

impl<'a, P: PwmChannel> RelockGuard<'a, P> {
    fn arm(actuator: &'a mut LockActuator<P>) -> Self {
        Self {
            actuator,
            armed: true,
        }
    }

    fn relock(mut self) -> Result<(), ActuatorError> {
        self.armed = false;
        self.actuator
            .drive(ActuatorPosition::Locked)
            .map_err(|e| match e {
                ActuatorError::Pwm { source, .. } => ActuatorError::RelockFailed(source),
                other => other,
            })
    }
}

impl<P: PwmChannel> Drop for RelockGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.actuator.drive(ActuatorPosition::Locked) {
                tracing::error!(error = %e, "relock during unwind failed");
            }
        }
    }
}
