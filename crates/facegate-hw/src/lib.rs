//! facegate-hw — Hardware adapters for the gate.
//!
//! V4L2 still capture, the presence sensor over I2C or UART, the PWM
//! servo that drives the lock, and the cooperative stop signal shared by
//! the control loop and the actuator.

pub mod actuator;
pub mod camera;
pub mod frame;
pub mod sensor;
pub mod signal;

pub use actuator::{Actuator, ActuatorError, ActuatorPosition, LockActuator, PwmChannel, ServoConfig, SysfsPwm};
pub use camera::{Camera, CameraError};
pub use frame::Frame;
pub use sensor::{PresenceEvent, PresenceSensor, ProtocolSensor, SensorError, SensorLink, SensorTransport};
pub use signal::StopSignal;
