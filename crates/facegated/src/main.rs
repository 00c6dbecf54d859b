use facegate_core::{CommandProvider, Gallery, VoteMatcher};
use facegate_hw::{LockActuator, StopSignal, SysfsPwm};
use std::process::ExitCode;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

mod acquirer;
mod config;
mod engine;
mod error;

use acquirer::{DirectCapture, ImageAcquirer, ProxiedCapture, ProxiedSettings, Retrying};
use config::{CaptureConfig, Config};
use engine::{AuthLoop, Gate, LoopSettings};
use error::GateError;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    match run().await {
        Ok(()) => {
            tracing::info!("facegated stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "facegated exiting on fatal error");
            e.exit_code()
        }
    }
}

async fn run() -> Result<(), GateError> {
    let config = Config::load()?;

    // Fail fast on anything the loop cannot run without.
    let gallery = Gallery::load(&config.gallery_path)?;
    let mut provider = CommandProvider::new(config.provider.command.clone(), config.provider.args.clone());
    if let Some(dim) = config.provider.resolve_embedding_dim(gallery.dim())? {
        tracing::info!(dim, "expecting embeddings of this length from the provider");
        provider = provider.with_expected_dim(dim);
    }
    let sensor = config.sensor.open()?;
    let pwm = SysfsPwm::open(
        config.actuator.chip,
        config.actuator.channel,
        config.actuator.frequency_hz,
    )
    .map_err(GateError::ActuatorInit)?;
    let actuator = LockActuator::new(pwm, config.actuator.clone())?;

    let gate = Gate {
        sensor,
        acquirer: build_acquirer(&config),
        provider,
        actuator,
    };
    let settings = LoopSettings {
        threshold: config.threshold,
        dwell: config.dwell(),
        poll_interval: config.poll_interval(),
    };
    let mut auth = AuthLoop::start(gate, gallery, VoteMatcher, settings)?;

    // The loop is blocking and strictly sequential; it gets its own thread
    // and the async side only watches for shutdown signals.
    let stop = StopSignal::new();
    let loop_stop = stop.clone();
    let (done_tx, mut done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("facegate-loop".into())
        .spawn(move || {
            let _ = done_tx.send(auth.run(&loop_stop));
        })
        .map_err(|e| GateError::LoopThread(e.to_string()))?;

    tokio::select! {
        result = &mut done_rx => {
            return result.map_err(|_| GateError::LoopThread("exited without a result".into()))?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested; finishing current cycle");
            stop.trip();
        }
    }

    done_rx
        .await
        .map_err(|_| GateError::LoopThread("exited without a result".into()))?
}

fn build_acquirer(config: &Config) -> Box<dyn ImageAcquirer + Send> {
    match &config.capture {
        CaptureConfig::Direct {
            device,
            warmup_frames,
            ..
        } => {
            tracing::info!(device = %device, "direct camera capture");
            Box::new(Retrying::new(
                DirectCapture::new(device.clone(), config.capture_dir.clone(), *warmup_frames),
                config.capture.retry_policy(),
            ))
        }
        CaptureConfig::Proxied {
            mount,
            file_wait_ms,
            delete_original,
            ..
        } => {
            tracing::info!(mount = %mount.display(), "capture proxied through sensor storage");
            Box::new(ProxiedCapture::new(ProxiedSettings {
                mount: mount.clone(),
                capture_dir: config.capture_dir.clone(),
                file_wait: std::time::Duration::from_millis(*file_wait_ms),
                delete_original: *delete_original,
                retry: config.capture.retry_policy(),
            }))
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable; Ctrl-C only"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
}
