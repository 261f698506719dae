// Timing, thresholds and tunables for calibration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Response window after every command
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(10);

// Spin test magnitude (raw speed units)
pub const TEST_SPEED: i16 = 25_000;

// Forward/reverse speeds must match this closely to count as converged
pub const CONVERGENCE_TOLERANCE: f64 = 2.0;
pub const MAX_ITERATIONS: u32 = 100;

// (threshold, step): first row with |difference| > threshold wins
pub const STEP_TABLE: [(f64, i16); 4] = [(50.0, 20), (30.0, 15), (25.0, 10), (15.0, 5)];
pub const MIN_STEP: i16 = 2;

// Verification accepts a looser match than the search
pub const VERIFY_TOLERANCE: f64 = 10.0;

// Warm-up spin after coarse zero
pub const WARMUP_SPEED: i16 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Sampling window: how long and how often to poll telemetry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleWindow {
    pub duration_ms: u64,
    pub frequency_hz: f64,
}

impl SampleWindow {
    pub const fn new(duration_ms: u64, frequency_hz: f64) -> Self {
        Self {
            duration_ms,
            frequency_hz,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// All calibration tunables. Delays are in milliseconds.
///
/// Every field has a default, so a JSON file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Wait after every command before draining the reply
    pub response_timeout_ms: u64,
    pub test_speed: i16,
    pub tolerance: f64,
    pub max_iterations: u32,

    /// After the stop that opens each iteration
    pub pre_test_settle_ms: u64,
    /// After setting a test speed, before sampling
    pub spin_up_settle_ms: u64,
    /// After stopping a test spin
    pub spin_down_settle_ms: u64,
    /// After writing a new zero offset
    pub offset_settle_ms: u64,
    pub sample: SampleWindow,

    pub coarse_zero_wait_ms: u64,
    pub warmup_speed: i16,
    pub warmup_settle_ms: u64,
    pub warmup_sample: SampleWindow,
    pub warmup_rest_ms: u64,

    pub verify_settle_ms: u64,
    pub verify_sample: SampleWindow,
    pub verify_tolerance: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: RESPONSE_TIMEOUT.as_millis() as u64,
            test_speed: TEST_SPEED,
            tolerance: CONVERGENCE_TOLERANCE,
            max_iterations: MAX_ITERATIONS,
            pre_test_settle_ms: 100,
            spin_up_settle_ms: 1000,
            spin_down_settle_ms: 1000,
            offset_settle_ms: 100,
            sample: SampleWindow::new(1000, 100.0),
            coarse_zero_wait_ms: 1000,
            warmup_speed: WARMUP_SPEED,
            warmup_settle_ms: 1000,
            warmup_sample: SampleWindow::new(2000, 35.0),
            warmup_rest_ms: 2000,
            verify_settle_ms: 2000,
            verify_sample: SampleWindow::new(2000, 30.0),
            verify_tolerance: VERIFY_TOLERANCE,
        }
    }
}

impl CalibrationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Step applied to the zero offset for a given speed asymmetry
pub fn step_for_difference(difference: f64) -> i16 {
    let magnitude = difference.abs();
    STEP_TABLE
        .iter()
        .find(|(threshold, _)| magnitude > *threshold)
        .map(|&(_, step)| step)
        .unwrap_or(MIN_STEP)
}
