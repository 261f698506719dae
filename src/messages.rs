// Status types reported by calibration and the full procedure
use serde::Serialize;

use crate::motor::ZeroOffset;
use crate::sampler::SampleStats;

/// Calibration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    Idle,
    ForwardTest,
    ReverseTest,
    Evaluate,
    AdjustOffset,
    Converged,
    MaxIterationsExceeded,
}

/// Structured progress events, one stream per session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CalibrationEvent {
    StateChanged {
        iteration: u32,
        state: CalibrationState,
    },
    Measured {
        iteration: u32,
        forward_speed: f64,
        reverse_speed: f64,
        difference: f64,
        decode_failures: usize,
    },
    OffsetAdjusted {
        iteration: u32,
        step: i16,
        from: ZeroOffset,
        to: ZeroOffset,
    },
    Finished {
        outcome: CalibrationOutcome,
    },
}

/// Terminal result of a calibration run. Running out of iterations is
/// reported, not treated as an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CalibrationOutcome {
    Converged {
        offset: ZeroOffset,
        iterations: u32,
        difference: f64,
        telemetry: SampleTally,
    },
    MaxIterationsExceeded {
        offset: ZeroOffset,
        iterations: u32,
        last_difference: Option<f64>,
        telemetry: SampleTally,
    },
}

impl CalibrationOutcome {
    pub fn offset(&self) -> ZeroOffset {
        match *self {
            CalibrationOutcome::Converged { offset, .. } => offset,
            CalibrationOutcome::MaxIterationsExceeded { offset, .. } => offset,
        }
    }

    pub fn iterations(&self) -> u32 {
        match *self {
            CalibrationOutcome::Converged { iterations, .. } => iterations,
            CalibrationOutcome::MaxIterationsExceeded { iterations, .. } => iterations,
        }
    }

    pub fn converged(&self) -> bool {
        matches!(self, CalibrationOutcome::Converged { .. })
    }

    pub fn telemetry(&self) -> SampleTally {
        match *self {
            CalibrationOutcome::Converged { telemetry, .. } => telemetry,
            CalibrationOutcome::MaxIterationsExceeded { telemetry, .. } => telemetry,
        }
    }
}

/// Telemetry reads behind a result. Unreadable samples were averaged in
/// as a speed of 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SampleTally {
    pub samples: usize,
    pub decode_failures: usize,
}

impl SampleTally {
    pub fn record(&mut self, stats: &SampleStats) {
        self.samples += stats.samples;
        self.decode_failures += stats.decode_failures;
    }

    pub fn merge(self, other: SampleTally) -> SampleTally {
        SampleTally {
            samples: self.samples + other.samples,
            decode_failures: self.decode_failures + other.decode_failures,
        }
    }

    /// Samples were taken and not one of them decoded
    pub fn all_failed(&self) -> bool {
        self.samples > 0 && self.decode_failures == self.samples
    }
}

/// Result of the post-calibration check spin
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub forward_speed: f64,
    pub reverse_speed: f64,
    pub difference: f64,
    pub passed: bool,
    pub telemetry: SampleTally,
}

/// Summary of a full procedure run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcedureReport {
    pub address: u8,
    pub coarse_zero: Option<ZeroOffset>,
    pub outcome: CalibrationOutcome,
    pub verification: Verification,
    pub negative_limit: Option<i16>,
    pub positive_limit: Option<i16>,
    pub saved: bool,
    /// Every averaged sample of the run: warm-up, search and verification
    pub telemetry: SampleTally,
}
