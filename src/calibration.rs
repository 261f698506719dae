// Zero electrical angle search
//
// Spins the motor forward and backward at the same commanded speed and
// compares the measured magnitudes. A misaligned zero angle makes one
// direction faster than the other; the offset is nudged against the faster
// direction until the two agree within tolerance.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{CalibrationConfig, SampleWindow, step_for_difference};
use crate::messages::{
    CalibrationEvent, CalibrationOutcome, CalibrationState, SampleTally, Verification,
};
use crate::motor::{MotorController, MotorError, Transport, ZeroOffset};
use crate::sampler::{SampleError, SampleStats, sample_average_speed};

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Motor(#[from] MotorError),

    #[error(transparent)]
    Sample(#[from] SampleError),
}

pub type Result<T> = std::result::Result<T, CalibrationError>;

/// What the search needs from the hardware
pub trait SpinRig {
    fn stop(&mut self) -> std::result::Result<(), MotorError>;
    fn set_speed(&mut self, speed: i16) -> std::result::Result<(), MotorError>;
    fn set_zero_offset(&mut self, offset: ZeroOffset) -> std::result::Result<(), MotorError>;
    fn clear_status(&mut self) -> std::result::Result<(), MotorError>;
    fn average_speed(
        &mut self,
        window: &SampleWindow,
    ) -> std::result::Result<SampleStats, SampleError>;
    fn settle(&mut self, duration: Duration);
}

impl<T: Transport, C: Clock + Clone> SpinRig for MotorController<T, C> {
    fn stop(&mut self) -> std::result::Result<(), MotorError> {
        MotorController::stop(self)
    }

    fn set_speed(&mut self, speed: i16) -> std::result::Result<(), MotorError> {
        MotorController::set_speed(self, speed)
    }

    fn set_zero_offset(&mut self, offset: ZeroOffset) -> std::result::Result<(), MotorError> {
        MotorController::set_zero_offset(self, offset)
    }

    fn clear_status(&mut self) -> std::result::Result<(), MotorError> {
        MotorController::clear_status(self)
    }

    fn average_speed(
        &mut self,
        window: &SampleWindow,
    ) -> std::result::Result<SampleStats, SampleError> {
        let clock = self.clock().clone();
        sample_average_speed(self, &clock, window)
    }

    fn settle(&mut self, duration: Duration) {
        self.sleep(duration);
    }
}

/// `|forward| - |reverse|`; positive when forward runs faster
pub fn speed_difference(forward: f64, reverse: f64) -> f64 {
    forward.abs() - reverse.abs()
}

/// Signed offset change for a measured difference: move against the
/// faster direction.
pub fn correction(difference: f64) -> i16 {
    let step = step_for_difference(difference);
    if difference > 0.0 { -step } else { step }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Converged,
    Adjust { step: i16 },
}

/// Search state. Each evaluation returns the next session instead of
/// mutating in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationSession {
    /// Completed iterations
    pub iteration: u32,
    pub zero_offset: ZeroOffset,
    pub last_difference: Option<f64>,
    pub converged: bool,
}

impl CalibrationSession {
    pub fn new(initial: ZeroOffset) -> Self {
        Self {
            iteration: 0,
            zero_offset: initial,
            last_difference: None,
            converged: false,
        }
    }

    pub fn evaluate(&self, forward: f64, reverse: f64, tolerance: f64) -> (Self, Decision) {
        let difference = speed_difference(forward, reverse);
        let mut next = Self {
            iteration: self.iteration + 1,
            last_difference: Some(difference),
            ..*self
        };

        if difference.abs() <= tolerance {
            next.converged = true;
            return (next, Decision::Converged);
        }

        let delta = correction(difference);
        next.zero_offset = self.zero_offset.shifted(delta);
        (next, Decision::Adjust { step: delta.abs() })
    }
}

type Observer<'a> = Box<dyn FnMut(&CalibrationEvent) + 'a>;

pub struct Calibrator<'a> {
    config: &'a CalibrationConfig,
    observer: Option<Observer<'a>>,
}

impl<'a> Calibrator<'a> {
    pub fn new(config: &'a CalibrationConfig) -> Self {
        Self {
            config,
            observer: None,
        }
    }

    pub fn on_event(mut self, observer: impl FnMut(&CalibrationEvent) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Run the search from `initial`. The motor is stopped when this
    /// returns, including on error.
    pub fn run<R: SpinRig + ?Sized>(
        &mut self,
        rig: &mut R,
        initial: ZeroOffset,
    ) -> Result<CalibrationOutcome> {
        match self.search(rig, initial) {
            Ok(outcome) => {
                self.emit(CalibrationEvent::Finished { outcome });
                Ok(outcome)
            }
            Err(e) => {
                warn!("Calibration aborted: {}", e);
                if let Err(stop_err) = rig.stop() {
                    warn!("Failed to stop motor after abort: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    fn search<R: SpinRig + ?Sized>(
        &mut self,
        rig: &mut R,
        initial: ZeroOffset,
    ) -> Result<CalibrationOutcome> {
        let config = self.config;
        info!(
            "Searching zero angle from {} (max {} iterations)",
            initial, config.max_iterations
        );
        rig.set_zero_offset(initial)?;
        let mut session = CalibrationSession::new(initial);
        let mut telemetry = SampleTally::default();

        while session.iteration < config.max_iterations {
            let iteration = session.iteration + 1;
            info!("Iteration {}: zero offset {}", iteration, session.zero_offset);

            self.transition(iteration, CalibrationState::Idle);
            rig.stop()?;
            rig.settle(ms(config.pre_test_settle_ms));

            self.transition(iteration, CalibrationState::ForwardTest);
            let forward = self.spin_test(rig, config.test_speed)?;

            self.transition(iteration, CalibrationState::ReverseTest);
            let reverse = self.spin_test(rig, config.test_speed.saturating_neg())?;
            telemetry.record(&forward);
            telemetry.record(&reverse);

            self.transition(iteration, CalibrationState::Evaluate);
            let (next, decision) =
                session.evaluate(forward.average, reverse.average, config.tolerance);
            let difference = next.last_difference.unwrap_or_default();
            info!(
                "Forward {:.2}, reverse {:.2}, difference {:.2}",
                forward.average, reverse.average, difference
            );
            self.emit(CalibrationEvent::Measured {
                iteration,
                forward_speed: forward.average,
                reverse_speed: reverse.average,
                difference,
                decode_failures: forward.decode_failures + reverse.decode_failures,
            });

            match decision {
                Decision::Converged => {
                    self.transition(iteration, CalibrationState::Converged);
                    info!(
                        "Zero angle found at {} after {} iterations",
                        next.zero_offset, iteration
                    );
                    warn_unreadable("Calibration", &telemetry);
                    return Ok(CalibrationOutcome::Converged {
                        offset: next.zero_offset,
                        iterations: next.iteration,
                        difference,
                        telemetry,
                    });
                }
                Decision::Adjust { step } => {
                    self.transition(iteration, CalibrationState::AdjustOffset);
                    debug!("Step {}: {} -> {}", step, session.zero_offset, next.zero_offset);
                    self.emit(CalibrationEvent::OffsetAdjusted {
                        iteration,
                        step,
                        from: session.zero_offset,
                        to: next.zero_offset,
                    });
                    rig.set_zero_offset(next.zero_offset)?;
                    rig.settle(ms(config.offset_settle_ms));
                }
            }

            session = next;
        }

        self.transition(session.iteration, CalibrationState::MaxIterationsExceeded);
        warn!(
            "No zero angle within tolerance after {} iterations, keeping {}",
            session.iteration, session.zero_offset
        );
        warn_unreadable("Calibration", &telemetry);
        Ok(CalibrationOutcome::MaxIterationsExceeded {
            offset: session.zero_offset,
            iterations: session.iteration,
            last_difference: session.last_difference,
            telemetry,
        })
    }

    fn spin_test<R: SpinRig + ?Sized>(
        &mut self,
        rig: &mut R,
        speed: i16,
    ) -> Result<SampleStats> {
        let config = self.config;
        rig.set_speed(speed)?;
        rig.settle(ms(config.spin_up_settle_ms));
        let stats = rig.average_speed(&config.sample)?;
        rig.stop()?;
        rig.settle(ms(config.spin_down_settle_ms));
        Ok(stats)
    }

    fn transition(&mut self, iteration: u32, state: CalibrationState) {
        debug!("Iteration {} -> {:?}", iteration, state);
        self.emit(CalibrationEvent::StateChanged { iteration, state });
    }

    fn emit(&mut self, event: CalibrationEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }
}

/// Check spin after calibration, with longer settle times and a looser
/// tolerance than the search. A failed check is reported, not an error.
pub fn verify<R: SpinRig + ?Sized>(
    rig: &mut R,
    config: &CalibrationConfig,
) -> Result<Verification> {
    let result = verify_inner(rig, config);
    if result.is_err() {
        if let Err(e) = rig.stop() {
            warn!("Failed to stop motor after aborted verification: {}", e);
        }
    }
    result
}

fn verify_inner<R: SpinRig + ?Sized>(
    rig: &mut R,
    config: &CalibrationConfig,
) -> Result<Verification> {
    let settle = ms(config.verify_settle_ms);
    rig.clear_status()?;

    rig.set_speed(config.test_speed)?;
    rig.settle(settle);
    let forward = rig.average_speed(&config.verify_sample)?;
    rig.stop()?;
    rig.settle(settle);

    rig.set_speed(config.test_speed.saturating_neg())?;
    rig.settle(settle);
    let reverse = rig.average_speed(&config.verify_sample)?;
    rig.stop()?;

    let mut telemetry = SampleTally::default();
    telemetry.record(&forward);
    telemetry.record(&reverse);
    warn_unreadable("Verification", &telemetry);

    let difference = speed_difference(forward.average, reverse.average);
    let passed = difference.abs() <= config.verify_tolerance;
    if passed {
        info!("Verification passed: difference {:.2}", difference);
    } else {
        warn!(
            "Verification failed: difference {:.2} exceeds {:.2}",
            difference, config.verify_tolerance
        );
    }

    Ok(Verification {
        forward_speed: forward.average,
        reverse_speed: reverse.average,
        difference,
        passed,
        telemetry,
    })
}

/// Unreadable samples were averaged in as 0, so the result says less than
/// it appears to
fn warn_unreadable(stage: &str, telemetry: &SampleTally) {
    if telemetry.all_failed() {
        warn!(
            "{}: none of {} telemetry samples could be decoded, result is not trustworthy",
            stage, telemetry.samples
        );
    } else if telemetry.decode_failures > 0 {
        warn!(
            "{}: {} of {} telemetry samples unreadable and counted as 0",
            stage, telemetry.decode_failures, telemetry.samples
        );
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
