use facegate_core::GalleryError;
use facegate_hw::{ActuatorError, SensorError};
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

/// Conditions that end the daemon. Everything else is cycle-local.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("failed to read configuration file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    GalleryUnavailable(#[from] GalleryError),
    #[error("gallery has no enrolled faces; run enrollment first")]
    EmptyGallery,
    #[error("sensor link unavailable: {0}")]
    SensorLink(#[from] SensorError),
    #[error("sensor did not answer the startup handshake")]
    SensorHandshakeFailed,
    #[error("failed to initialise actuator PWM: {0}")]
    ActuatorInit(#[source] std::io::Error),
    #[error("actuator fault: {0}")]
    ActuatorFault(#[from] ActuatorError),
    #[error("authentication loop is in FAULT; restart required")]
    Faulted,
    #[error("authentication loop thread: {0}")]
    LoopThread(String),
}

impl GateError {
    /// Process exit status for this error; never zero.
    pub fn exit_status(&self) -> u8 {
        match self {
            GateError::ConfigRead { .. } | GateError::Config(_) => 2,
            GateError::GalleryUnavailable(_) | GateError::EmptyGallery => 3,
            GateError::SensorLink(_) | GateError::SensorHandshakeFailed => 4,
            GateError::ActuatorInit(_) | GateError::ActuatorFault(_) | GateError::Faulted => 5,
            GateError::LoopThread(_) => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}
