// Fixed-rate telemetry sampling
//
// Samples are scheduled against absolute deadlines (start + (i+1) * interval)
// so the time spent in each round trip does not accumulate as drift. When a
// round trip overruns its slot the next sample is taken immediately.

use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::SampleWindow;
use crate::motor::protocol::Telemetry;
use crate::motor::{MotorController, MotorError, Transport};

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Sample window of {duration:?} at {frequency} Hz yields no samples")]
    Empty { duration: Duration, frequency: f64 },

    #[error("Sampling frequency must be positive and finite, got {0}")]
    InvalidFrequency(f64),

    #[error(transparent)]
    Motor(#[from] MotorError),
}

/// Anything that can answer a telemetry request
pub trait TelemetrySource {
    fn read_telemetry(&mut self) -> Result<Telemetry, MotorError>;
}

impl<T: Transport, C: Clock> TelemetrySource for MotorController<T, C> {
    fn read_telemetry(&mut self) -> Result<Telemetry, MotorError> {
        MotorController::read_telemetry(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    pub average: f64,
    pub samples: usize,
    /// Samples recorded as 0 because the response could not be decoded
    pub decode_failures: usize,
}

/// Number of samples a window produces: floor(duration * frequency)
pub fn sample_count(window: &SampleWindow) -> Result<usize, SampleError> {
    let frequency = window.frequency_hz;
    if !frequency.is_finite() || frequency <= 0.0 {
        return Err(SampleError::InvalidFrequency(frequency));
    }

    let count = (window.duration().as_secs_f64() * frequency).floor();
    if count < 1.0 {
        return Err(SampleError::Empty {
            duration: window.duration(),
            frequency,
        });
    }
    Ok(count as usize)
}

/// Poll `source` at the window's rate and average the speed readings.
///
/// Undecodable responses count as a speed of 0. Transport failures abort.
pub fn sample_average_speed<S, C>(
    source: &mut S,
    clock: &C,
    window: &SampleWindow,
) -> Result<SampleStats, SampleError>
where
    S: TelemetrySource + ?Sized,
    C: Clock + ?Sized,
{
    let count = sample_count(window)?;
    let frequency = window.frequency_hz;

    let mut total = 0.0;
    let mut decode_failures = 0;
    let start = clock.now();

    for i in 0..count {
        let speed = match source.read_telemetry() {
            Ok(telemetry) => telemetry.speed,
            Err(MotorError::Frame(e)) => {
                warn!("Sample {} unreadable ({}), counting as 0", i, e);
                decode_failures += 1;
                0
            }
            Err(e) => return Err(e.into()),
        };
        total += speed as f64;

        let deadline = start + Duration::from_secs_f64((i + 1) as f64 / frequency);
        if let Some(remaining) = deadline.checked_sub(clock.now()) {
            if !remaining.is_zero() {
                clock.sleep(remaining);
            }
        }
    }

    let average = total / count as f64;
    debug!(
        "Average speed {:.2} over {} samples ({} unreadable)",
        average, count, decode_failures
    );

    Ok(SampleStats {
        average,
        samples: count,
        decode_failures,
    })
}
