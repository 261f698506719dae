// End-to-end calibration of one motor
//
// 1. Coarse zero: reset, drive into the reference, adopt the reached position
// 2. Warm-up spin
// 3. Fine zero angle search
// 4. Verification spin
// 5. Optional new address and travel limits, then save to flash

use std::time::Duration;
use tracing::{info, warn};

use crate::calibration::{CalibrationError, Calibrator, SpinRig, verify};
use crate::clock::Clock;
use crate::config::CalibrationConfig;
use crate::messages::{CalibrationEvent, ProcedureReport, SampleTally};
use crate::motor::commands;
use crate::motor::{MotorAddress, MotorController, MotorError, Transport, ZeroOffset};
use crate::sampler::SampleStats;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureOptions {
    pub skip_coarse_zero: bool,
    /// Starting offset when coarse zero is skipped
    pub initial_offset: ZeroOffset,
    pub new_address: Option<MotorAddress>,
    pub negative_limit: Option<i64>,
    pub positive_limit: Option<i64>,
    pub save: bool,
}

impl Default for ProcedureOptions {
    fn default() -> Self {
        Self {
            skip_coarse_zero: false,
            initial_offset: ZeroOffset::default(),
            new_address: None,
            negative_limit: None,
            positive_limit: None,
            save: true,
        }
    }
}

impl ProcedureOptions {
    /// Reject out-of-range limits before anything is sent
    fn validated_limits(&self) -> Result<(Option<i16>, Option<i16>), MotorError> {
        let negative = self
            .negative_limit
            .map(|v| commands::set_negative_limit(v).map(|c| c.param_signed()))
            .transpose()?;
        let positive = self
            .positive_limit
            .map(|v| commands::set_positive_limit(v).map(|c| c.param_signed()))
            .transpose()?;
        Ok((negative, positive))
    }
}

pub fn run<T, C>(
    motor: &mut MotorController<T, C>,
    config: &CalibrationConfig,
    options: &ProcedureOptions,
    observer: impl FnMut(&CalibrationEvent),
) -> Result<ProcedureReport, CalibrationError>
where
    T: Transport,
    C: Clock + Clone,
{
    let (negative_limit, positive_limit) = options.validated_limits()?;

    let result = run_steps(motor, config, options, negative_limit, positive_limit, observer);
    if result.is_err() {
        if let Err(e) = MotorController::stop(motor) {
            warn!("Failed to stop motor after aborted procedure: {}", e);
        }
    }
    result
}

fn run_steps<T, C>(
    motor: &mut MotorController<T, C>,
    config: &CalibrationConfig,
    options: &ProcedureOptions,
    negative_limit: Option<i16>,
    positive_limit: Option<i16>,
    observer: impl FnMut(&CalibrationEvent),
) -> Result<ProcedureReport, CalibrationError>
where
    T: Transport,
    C: Clock + Clone,
{
    info!("Calibrating motor {}", motor.address());

    let mut telemetry = SampleTally::default();
    let coarse_zero = if options.skip_coarse_zero {
        None
    } else {
        let offset = motor.coarse_zero(ms(config.coarse_zero_wait_ms))?;
        telemetry.record(&warm_up(motor, config)?);
        Some(offset)
    };

    let initial = coarse_zero.unwrap_or(options.initial_offset);
    let outcome = Calibrator::new(config).on_event(observer).run(motor, initial)?;
    info!("Zero angle offset: {}", outcome.offset());

    let verification = verify(motor, config)?;
    let telemetry = telemetry
        .merge(outcome.telemetry())
        .merge(verification.telemetry);
    if telemetry.decode_failures > 0 {
        warn!(
            "{} of {} telemetry samples were unreadable during the procedure",
            telemetry.decode_failures, telemetry.samples
        );
    }

    if let Some(new_address) = options.new_address {
        motor.assign_address(new_address)?;
    }
    if let Some(limit) = negative_limit {
        motor.set_negative_limit(limit as i64)?;
    }
    if let Some(limit) = positive_limit {
        motor.set_positive_limit(limit as i64)?;
    }
    if options.save {
        motor.save_config()?;
    } else {
        warn!("Configuration not saved; it will be lost on power cycle");
    }

    Ok(ProcedureReport {
        address: motor.address().get(),
        coarse_zero,
        outcome,
        verification,
        negative_limit,
        positive_limit,
        saved: options.save,
        telemetry,
    })
}

/// Short spin after coarse zero so the rotor leaves the reference
fn warm_up<T, C>(
    motor: &mut MotorController<T, C>,
    config: &CalibrationConfig,
) -> Result<SampleStats, CalibrationError>
where
    T: Transport,
    C: Clock + Clone,
{
    motor.set_speed(config.warmup_speed)?;
    motor.sleep(ms(config.warmup_settle_ms));
    let stats = motor.average_speed(&config.warmup_sample)?;
    MotorController::stop(motor)?;
    info!("Warm-up average speed {:.2}", stats.average);

    match motor.read_telemetry() {
        Ok(t) => info!(
            "Position {}, speed {}, current {}",
            t.position, t.speed, t.current
        ),
        Err(e) if e.is_recoverable() => warn!("Telemetry after warm-up unreadable: {}", e),
        Err(e) => return Err(e.into()),
    }

    motor.sleep(ms(config.warmup_rest_ms));
    Ok(stats)
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
