//! Authentication loop.
//!
//! ```text
//! IDLE → SENSING → CAPTURING → VERIFYING → ACTUATING → IDLE
//!                                                   ↘ FAULT
//! ```
//!
//! The sensor's trained-face flag is a cheap pre-filter that gates the
//! expensive capture and embedding steps; identity is decided only by the
//! gallery match. Every failure short of the actuator is cycle-local and
//! returns the machine to IDLE.

use crate::acquirer::ImageAcquirer;
use crate::error::GateError;
use facegate_core::{DetectedFace, EmbeddingProvider, Gallery, MatchResult, Matcher};
use facegate_hw::{Actuator, PresenceSensor, StopSignal};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sensing,
    Capturing,
    Verifying,
    Actuating,
    Fault,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    NoPresence,
    /// Poll failed; treated as no presence.
    SensorUnavailable,
    /// Presence reported, but not of a face the sensor was trained on.
    Untrained,
    CaptureFailed,
    EmbeddingFailed,
    NoFace,
    Rejected,
    Granted { label: String, votes: usize },
}

/// Working state of the current cycle, reset at the start of each one.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    pub capture_attempts: u32,
    pub last_error: Option<String>,
    /// Phases visited this cycle, starting with `Idle`.
    pub trail: Vec<Phase>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            capture_attempts: 0,
            last_error: None,
            trail: vec![Phase::Idle],
        }
    }
}

impl SessionState {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn enter(&mut self, phase: Phase) {
        tracing::info!(from = ?self.phase, phase = ?phase, "phase transition");
        self.phase = phase;
        self.trail.push(phase);
    }

    fn record(&mut self, error: &dyn fmt::Display) {
        self.last_error = Some(error.to_string());
    }
}

/// Hardware and vision collaborators owned by the loop.
pub struct Gate<S, Q, E, A> {
    pub sensor: S,
    pub acquirer: Q,
    pub provider: E,
    pub actuator: A,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub threshold: f32,
    pub dwell: Duration,
    pub poll_interval: Duration,
}

pub struct AuthLoop<S, Q, E, A, M> {
    gate: Gate<S, Q, E, A>,
    gallery: Gallery,
    matcher: M,
    settings: LoopSettings,
    session: SessionState,
    cycle: u64,
}

impl<S, Q, E, A, M> AuthLoop<S, Q, E, A, M>
where
    S: PresenceSensor,
    Q: ImageAcquirer,
    E: EmbeddingProvider,
    A: Actuator,
    M: Matcher,
{
    /// Take ownership of the collaborators and verify the loop can run:
    /// the gallery must be non-empty and the sensor must answer.
    pub fn start(
        mut gate: Gate<S, Q, E, A>,
        gallery: Gallery,
        matcher: M,
        settings: LoopSettings,
    ) -> Result<Self, GateError> {
        if gallery.is_empty() {
            return Err(GateError::EmptyGallery);
        }
        if !gate.sensor.handshake() {
            return Err(GateError::SensorHandshakeFailed);
        }
        tracing::info!(
            entries = gallery.len(),
            threshold = settings.threshold,
            "authentication loop ready"
        );
        Ok(Self {
            gate,
            gallery,
            matcher,
            settings,
            session: SessionState::default(),
            cycle: 0,
        })
    }

    /// Cycle until `stop` trips. Returns `Err` only on FAULT.
    pub fn run(&mut self, stop: &StopSignal) -> Result<(), GateError> {
        tracing::info!(
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "authentication loop running"
        );
        while !stop.is_tripped() {
            self.run_cycle(stop)?;
            if stop.wait(self.settings.poll_interval) {
                break;
            }
        }
        tracing::info!(cycles = self.cycle, "authentication loop stopped");
        Ok(())
    }

    /// Run one cycle from IDLE back to IDLE, or into FAULT.
    pub fn run_cycle(&mut self, stop: &StopSignal) -> Result<CycleOutcome, GateError> {
        if self.session.phase == Phase::Fault {
            return Err(GateError::Faulted);
        }
        self.cycle += 1;
        let span = tracing::info_span!("cycle", n = self.cycle);
        let _entered = span.enter();

        self.session.reset();
        let outcome = self.step(stop);

        match &outcome {
            Ok(CycleOutcome::NoPresence) => {}
            Ok(CycleOutcome::Granted { label, votes }) => {
                tracing::info!(%label, votes, path = ?self.session.trail, "access granted");
            }
            Ok(other) => tracing::info!(
                outcome = ?other,
                path = ?self.session.trail,
                attempts = self.session.capture_attempts,
                error = ?self.session.last_error,
                "cycle complete"
            ),
            Err(e) => tracing::error!(error = %e, path = ?self.session.trail, "cycle faulted"),
        }
        outcome
    }

    fn step(&mut self, stop: &StopSignal) -> Result<CycleOutcome, GateError> {
        let events = match self.gate.sensor.poll() {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "sensor poll failed; treating as no presence");
                self.session.record(&e);
                return Ok(CycleOutcome::SensorUnavailable);
            }
        };
        if events.is_empty() {
            tracing::trace!("no presence");
            return Ok(CycleOutcome::NoPresence);
        }

        self.session.enter(Phase::Sensing);
        let Some(trigger) = events.iter().find(|e| e.trained) else {
            tracing::debug!(events = events.len(), "presence without a trained face");
            self.session.enter(Phase::Idle);
            return Ok(CycleOutcome::Untrained);
        };
        tracing::info!(object_id = trigger.object_id, "trained presence detected");

        self.session.enter(Phase::Capturing);
        let captured = self.gate.acquirer.capture(&mut self.gate.sensor);
        self.session.capture_attempts = self.gate.acquirer.last_attempts();
        let image = match captured {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "capture failed; abandoning cycle");
                self.session.record(&e);
                self.session.enter(Phase::Idle);
                return Ok(CycleOutcome::CaptureFailed);
            }
        };

        self.session.enter(Phase::Verifying);
        let faces = match self.gate.provider.embed(&image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, image = %image.display(), "embedding failed; abandoning cycle");
                self.session.record(&e);
                self.session.enter(Phase::Idle);
                return Ok(CycleOutcome::EmbeddingFailed);
            }
        };
        if faces.is_empty() {
            tracing::info!(image = %image.display(), "no face in capture");
            self.session.enter(Phase::Idle);
            return Ok(CycleOutcome::NoFace);
        }

        let best = self.best_match(&faces);
        let Some(label) = best.label else {
            tracing::info!(faces = faces.len(), "no enrolled identity within threshold");
            self.session.enter(Phase::Idle);
            return Ok(CycleOutcome::Rejected);
        };

        self.session.enter(Phase::Actuating);
        if let Err(e) = self.gate.actuator.unlock_and_hold(self.settings.dwell, stop) {
            self.session.record(&e);
            self.session.enter(Phase::Fault);
            return Err(GateError::ActuatorFault(e));
        }
        self.session.enter(Phase::Idle);
        Ok(CycleOutcome::Granted {
            label,
            votes: best.confidence_votes,
        })
    }

    /// Strongest match over every face in the capture; the earliest face
    /// wins a tie.
    fn best_match(&self, faces: &[DetectedFace]) -> MatchResult {
        let mut best = MatchResult::unknown();
        for face in faces {
            let result = self
                .matcher
                .compare(&face.embedding, &self.gallery, self.settings.threshold);
            if result.is_match() && result.confidence_votes > best.confidence_votes {
                best = result;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquirer::CaptureError;
    use facegate_core::{BoundingBox, Embedding, GalleryEntry, ProviderError, VoteMatcher};
    use facegate_hw::{
        ActuatorError, ActuatorPosition, LockActuator, PresenceEvent, PwmChannel, SensorError,
        ServoConfig,
    };
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedSensor {
        handshake_ok: bool,
        polls: VecDeque<Result<Vec<PresenceEvent>, SensorError>>,
        /// Tripped once the script runs out.
        stop_when_done: Option<StopSignal>,
    }

    impl ScriptedSensor {
        fn with_polls(polls: Vec<Result<Vec<PresenceEvent>, SensorError>>) -> Self {
            Self {
                handshake_ok: true,
                polls: polls.into(),
                stop_when_done: None,
            }
        }
    }

    impl PresenceSensor for ScriptedSensor {
        fn handshake(&mut self) -> bool {
            self.handshake_ok
        }

        fn poll(&mut self) -> Result<Vec<PresenceEvent>, SensorError> {
            let next = self.polls.pop_front().unwrap_or_else(|| Ok(Vec::new()));
            if self.polls.is_empty() {
                if let Some(stop) = &self.stop_when_done {
                    stop.trip();
                }
            }
            next
        }

        fn save_picture(&mut self) -> Result<(), SensorError> {
            Ok(())
        }
    }

    struct StubAcquirer {
        fail: bool,
        calls: u32,
    }

    impl ImageAcquirer for StubAcquirer {
        fn capture(&mut self, _sensor: &mut dyn PresenceSensor) -> Result<PathBuf, CaptureError> {
            self.calls += 1;
            if self.fail {
                return Err(CaptureError::StorageUnavailable("/media/sensor".into()));
            }
            Ok(PathBuf::from(format!("/tmp/capture-{}.png", self.calls)))
        }
    }

    struct StubProvider {
        faces: Vec<Vec<f32>>,
        calls: u32,
    }

    impl EmbeddingProvider for StubProvider {
        fn embed(&mut self, _image: &Path) -> Result<Vec<DetectedFace>, ProviderError> {
            self.calls += 1;
            Ok(self
                .faces
                .iter()
                .map(|v| DetectedFace {
                    bounding_box: BoundingBox { top: 0, right: 1, bottom: 1, left: 0 },
                    embedding: Embedding::new(v.clone()),
                })
                .collect())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPwm {
        duties: Arc<Mutex<Vec<f32>>>,
    }

    impl PwmChannel for RecordingPwm {
        fn set_duty_cycle(&mut self, percent: f32) -> io::Result<()> {
            if percent > 0.0 {
                self.duties.lock().unwrap().push(percent);
            }
            Ok(())
        }
    }

    struct BrokenActuator;

    impl Actuator for BrokenActuator {
        fn position(&self) -> ActuatorPosition {
            ActuatorPosition::Locked
        }

        fn unlock_and_hold(&mut self, _dwell: Duration, _stop: &StopSignal) -> Result<(), ActuatorError> {
            Err(ActuatorError::RelockFailed(io::Error::new(io::ErrorKind::Other, "stalled")))
        }
    }

    /// Vote matcher that counts how often it is consulted.
    #[derive(Default)]
    struct CountingMatcher {
        calls: Cell<u32>,
    }

    impl Matcher for CountingMatcher {
        fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
            self.calls.set(self.calls.get() + 1);
            VoteMatcher.compare(probe, gallery, threshold)
        }
    }

    const LOCKED_DUTY: f32 = 2.0;
    const UNLOCKED_DUTY: f32 = 7.0;

    fn gallery() -> Gallery {
        Gallery::from_entries(vec![
            GalleryEntry { label: "alice".into(), embedding: Embedding::new(vec![0.0, 0.0]) },
            GalleryEntry { label: "alice".into(), embedding: Embedding::new(vec![0.1, 0.0]) },
            GalleryEntry { label: "bob".into(), embedding: Embedding::new(vec![3.0, 3.0]) },
        ])
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            threshold: 0.6,
            dwell: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
        }
    }

    type TestLoop =
        AuthLoop<ScriptedSensor, StubAcquirer, StubProvider, LockActuator<RecordingPwm>, CountingMatcher>;

    fn gate_loop(sensor: ScriptedSensor, faces: Vec<Vec<f32>>) -> (TestLoop, Arc<Mutex<Vec<f32>>>) {
        let pwm = RecordingPwm::default();
        let duties = pwm.duties.clone();
        let actuator =
            LockActuator::new(pwm, ServoConfig { settle_ms: 0, ..ServoConfig::default() }).unwrap();
        let gate = Gate {
            sensor,
            acquirer: StubAcquirer { fail: false, calls: 0 },
            provider: StubProvider { faces, calls: 0 },
            actuator,
        };
        let auth = AuthLoop::start(gate, gallery(), CountingMatcher::default(), settings()).unwrap();
        (auth, duties)
    }

    fn presence(object_id: i64) -> Result<Vec<PresenceEvent>, SensorError> {
        Ok(vec![PresenceEvent::from_id(object_id)])
    }

    #[test]
    fn test_trained_presence_with_match_unlocks_then_relocks() {
        let sensor = ScriptedSensor::with_polls(vec![presence(1)]);
        let (mut auth, duties) = gate_loop(sensor, vec![vec![0.05, 0.0]]);

        let outcome = auth.run_cycle(&StopSignal::new()).unwrap();

        assert_eq!(outcome, CycleOutcome::Granted { label: "alice".into(), votes: 2 });
        assert_eq!(
            auth.session.trail,
            vec![
                Phase::Idle,
                Phase::Sensing,
                Phase::Capturing,
                Phase::Verifying,
                Phase::Actuating,
                Phase::Idle
            ]
        );
        assert_eq!(*duties.lock().unwrap(), vec![LOCKED_DUTY, UNLOCKED_DUTY, LOCKED_DUTY]);
        assert_eq!(auth.gate.actuator.position(), ActuatorPosition::Locked);
        assert_eq!(auth.session.capture_attempts, 1);
    }

    #[test]
    fn test_untrained_presence_skips_capture() {
        let sensor = ScriptedSensor::with_polls(vec![presence(0)]);
        let (mut auth, duties) = gate_loop(sensor, vec![vec![0.0, 0.0]]);

        let outcome = auth.run_cycle(&StopSignal::new()).unwrap();

        assert_eq!(outcome, CycleOutcome::Untrained);
        assert_eq!(auth.session.phase, Phase::Idle);
        assert!(!auth.session.trail.contains(&Phase::Capturing));
        assert_eq!(auth.gate.acquirer.calls, 0);
        assert_eq!(*duties.lock().unwrap(), vec![LOCKED_DUTY]);
    }

    #[test]
    fn test_no_presence_stays_idle() {
        let sensor = ScriptedSensor::with_polls(vec![Ok(Vec::new())]);
        let (mut auth, _) = gate_loop(sensor, Vec::new());
        assert_eq!(auth.run_cycle(&StopSignal::new()).unwrap(), CycleOutcome::NoPresence);
        assert_eq!(auth.session.trail, vec![Phase::Idle]);
    }

    #[test]
    fn test_capture_without_faces_skips_matcher() {
        let sensor = ScriptedSensor::with_polls(vec![presence(2)]);
        let (mut auth, duties) = gate_loop(sensor, Vec::new());

        let outcome = auth.run_cycle(&StopSignal::new()).unwrap();

        assert_eq!(outcome, CycleOutcome::NoFace);
        assert_eq!(auth.session.phase, Phase::Idle);
        assert_eq!(auth.matcher.calls.get(), 0);
        assert_eq!(*duties.lock().unwrap(), vec![LOCKED_DUTY]);
    }

    #[test]
    fn test_unknown_face_is_rejected() {
        let sensor = ScriptedSensor::with_polls(vec![presence(1)]);
        let (mut auth, duties) = gate_loop(sensor, vec![vec![9.0, -9.0]]);

        assert_eq!(auth.run_cycle(&StopSignal::new()).unwrap(), CycleOutcome::Rejected);
        assert_eq!(auth.matcher.calls.get(), 1);
        assert_eq!(*duties.lock().unwrap(), vec![LOCKED_DUTY]);
    }

    #[test]
    fn test_strongest_face_in_capture_wins() {
        let sensor = ScriptedSensor::with_polls(vec![presence(1)]);
        let (mut auth, _) = gate_loop(sensor, vec![vec![3.0, 3.1], vec![0.05, 0.0]]);

        let outcome = auth.run_cycle(&StopSignal::new()).unwrap();
        assert_eq!(outcome, CycleOutcome::Granted { label: "alice".into(), votes: 2 });
    }

    #[test]
    fn test_capture_failure_returns_to_idle_and_recovers() {
        let sensor = ScriptedSensor::with_polls(vec![presence(1), presence(1)]);
        let (mut auth, _) = gate_loop(sensor, vec![vec![0.0, 0.0]]);
        auth.gate.acquirer.fail = true;

        let stop = StopSignal::new();
        assert_eq!(auth.run_cycle(&stop).unwrap(), CycleOutcome::CaptureFailed);
        assert_eq!(auth.session.phase, Phase::Idle);
        assert!(auth.session.last_error.is_some());

        auth.gate.acquirer.fail = false;
        assert!(matches!(auth.run_cycle(&stop).unwrap(), CycleOutcome::Granted { .. }));
        assert!(auth.session.last_error.is_none());
    }

    #[test]
    fn test_transient_poll_failure_is_not_fatal() {
        let sensor = ScriptedSensor::with_polls(vec![
            Err(SensorError::Malformed("garbled")),
            presence(1),
        ]);
        let (mut auth, _) = gate_loop(sensor, vec![vec![0.0, 0.0]]);
        let stop = StopSignal::new();

        assert_eq!(auth.run_cycle(&stop).unwrap(), CycleOutcome::SensorUnavailable);
        assert!(matches!(auth.run_cycle(&stop).unwrap(), CycleOutcome::Granted { .. }));
    }

    #[test]
    fn test_actuator_fault_is_terminal() {
        let gate = Gate {
            sensor: ScriptedSensor::with_polls(vec![presence(1), presence(1)]),
            acquirer: StubAcquirer { fail: false, calls: 0 },
            provider: StubProvider { faces: vec![vec![0.0, 0.0]], calls: 0 },
            actuator: BrokenActuator,
        };
        let mut auth = AuthLoop::start(gate, gallery(), VoteMatcher, settings()).unwrap();
        let stop = StopSignal::new();

        let err = auth.run_cycle(&stop).unwrap_err();
        assert!(matches!(err, GateError::ActuatorFault(_)));
        assert_ne!(err.exit_status(), 0);
        assert_eq!(auth.session.phase, Phase::Fault);

        assert!(matches!(auth.run_cycle(&stop), Err(GateError::Faulted)));
        assert_eq!(auth.gate.acquirer.calls, 1);
    }

    #[test]
    fn test_handshake_failure_is_fatal_before_idle() {
        let sensor = ScriptedSensor { handshake_ok: false, ..ScriptedSensor::default() };
        let gate = Gate {
            sensor,
            acquirer: StubAcquirer { fail: false, calls: 0 },
            provider: StubProvider { faces: Vec::new(), calls: 0 },
            actuator: BrokenActuator,
        };
        let err = AuthLoop::start(gate, gallery(), VoteMatcher, settings())
            .err()
            .expect("handshake failure must abort start");
        assert!(matches!(err, GateError::SensorHandshakeFailed));
        assert_ne!(err.exit_status(), 0);
    }

    #[test]
    fn test_empty_gallery_fails_fast() {
        let gate = Gate {
            sensor: ScriptedSensor::with_polls(Vec::new()),
            acquirer: StubAcquirer { fail: false, calls: 0 },
            provider: StubProvider { faces: Vec::new(), calls: 0 },
            actuator: BrokenActuator,
        };
        let err = AuthLoop::start(gate, Gallery::default(), VoteMatcher, settings())
            .err()
            .expect("empty gallery must abort start");
        assert!(matches!(err, GateError::EmptyGallery));
    }

    #[test]
    fn test_run_returns_cleanly_when_stopped() {
        let stop = StopSignal::new();
        let mut sensor = ScriptedSensor::with_polls(vec![Ok(Vec::new()), presence(1), Ok(Vec::new())]);
        sensor.stop_when_done = Some(stop.clone());
        let (mut auth, duties) = gate_loop(sensor, vec![vec![0.0, 0.0]]);

        auth.run(&stop).unwrap();

        assert_eq!(auth.cycle, 3);
        assert_eq!(auth.session.phase, Phase::Idle);
        assert_eq!(*duties.lock().unwrap(), vec![LOCKED_DUTY, UNLOCKED_DUTY, LOCKED_DUTY]);
    }

    #[test]
    fn test_run_does_not_start_a_cycle_after_stop() {
        let stop = StopSignal::new();
        stop.trip();
        let (mut auth, _) = gate_loop(ScriptedSensor::with_polls(vec![presence(1)]), Vec::new());
        auth.run(&stop).unwrap();
        assert_eq!(auth.cycle, 0);
        assert_eq!(auth.gate.acquirer.calls, 0);
    }
}
