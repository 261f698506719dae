// Deterministic doubles for unit tests
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::calibration::SpinRig;
use crate::clock::Clock;
use crate::config::SampleWindow;
use crate::motor::protocol::{self, Telemetry, encode_telemetry};
use crate::motor::{FrameError, MotorError, Opcode, Transport, TransportError, ZeroOffset};
use crate::sampler::{SampleError, SampleStats, TelemetrySource};

/// Simulated clock: `sleep` advances time instantly.
///
/// Clones share the same time, so a simulated transport can advance the
/// clock to model I/O latency.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
    sleeps: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Number of sleeps requested so far
    pub fn sleep_count(&self) -> u64 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.advance(duration);
    }
}

/// Transport that records writes and replays queued responses.
/// An empty queue answers with no bytes.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<ScriptedInner>>,
}

#[derive(Default)]
struct ScriptedInner {
    written: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    timeouts: Vec<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, bytes: Vec<u8>) {
        self.inner.lock().unwrap().responses.push_back(bytes);
    }

    pub fn push_telemetry(&self, position: u16, speed: i16, current: u16) {
        let frame = encode_telemetry(Telemetry {
            position,
            speed,
            current,
        });
        self.push_response(frame.to_vec());
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Response windows requested, one per command
    pub fn timeouts(&self) -> Vec<Duration> {
        self.inner.lock().unwrap().timeouts.clone()
    }
}

impl Transport for ScriptedTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner.lock().unwrap().written.push(bytes.to_vec());
        Ok(())
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.timeouts.push(timeout);
        Ok(inner.responses.pop_front().unwrap_or_default())
    }
}

/// Telemetry source yielding a fixed sequence of speeds or decode errors
pub struct ScriptedSource {
    readings: VecDeque<Result<i16, FrameError>>,
    reads: usize,
    latency: Option<(ManualClock, Duration)>,
}

impl ScriptedSource {
    pub fn new(readings: Vec<Result<i16, FrameError>>) -> Self {
        Self {
            readings: readings.into(),
            reads: 0,
            latency: None,
        }
    }

    pub fn speeds(speeds: &[i16]) -> Self {
        Self::new(speeds.iter().map(|&s| Ok(s)).collect())
    }

    /// Advance `clock` by `latency` on every read
    pub fn with_latency(mut self, clock: ManualClock, latency: Duration) -> Self {
        self.latency = Some((clock, latency));
        self
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl TelemetrySource for ScriptedSource {
    fn read_telemetry(&mut self) -> Result<Telemetry, MotorError> {
        self.reads += 1;
        if let Some((clock, latency)) = &self.latency {
            clock.advance(*latency);
        }
        match self.readings.pop_front() {
            Some(Ok(speed)) => Ok(Telemetry {
                speed,
                ..Telemetry::default()
            }),
            Some(Err(e)) => Err(e.into()),
            None => Err(FrameError::Truncated { len: 0, needed: 7 }.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RigCall {
    Stop,
    Speed(i16),
    SetZero(i16),
    ClearStatus,
    Sample,
    Settle(u64),
}

type SpeedModel = Box<dyn Fn(i16) -> f64>;

/// Rig whose measured speed is a pure function of the current offset
pub struct OracleRig {
    forward: SpeedModel,
    reverse: SpeedModel,
    offset: i16,
    speed: i16,
    calls: Vec<RigCall>,
    samples: usize,
    fail_on_sample: Option<usize>,
    /// Readings per window, and how many of them were unreadable per direction
    window: (usize, usize, usize),
}

impl OracleRig {
    pub fn new(
        forward: impl Fn(i16) -> f64 + 'static,
        reverse: impl Fn(i16) -> f64 + 'static,
    ) -> Self {
        Self {
            forward: Box::new(forward),
            reverse: Box::new(reverse),
            offset: 0,
            speed: 0,
            calls: Vec::new(),
            samples: 0,
            fail_on_sample: None,
            window: (1, 0, 0),
        }
    }

    /// Report ten readings per window with the given number unreadable.
    /// The averages still come from the speed models.
    pub fn with_decode_failures(mut self, forward: usize, reverse: usize) -> Self {
        self.window = (10, forward, reverse);
        self
    }

    /// Make the n-th sample (1-based) fail with a transport error
    pub fn fail_on_sample(mut self, n: usize) -> Self {
        self.fail_on_sample = Some(n);
        self
    }

    pub fn calls(&self) -> Vec<RigCall> {
        self.calls.clone()
    }

    pub fn offsets_written(&self) -> Vec<ZeroOffset> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                RigCall::SetZero(v) => Some(ZeroOffset(*v)),
                _ => None,
            })
            .collect()
    }

    pub fn forward_tests(&self) -> usize {
        self.calls.iter().filter(|c| matches!(c, RigCall::Speed(s) if *s > 0)).count()
    }

    pub fn is_spinning(&self) -> bool {
        self.speed != 0
    }
}

impl SpinRig for OracleRig {
    fn stop(&mut self) -> Result<(), MotorError> {
        self.calls.push(RigCall::Stop);
        self.speed = 0;
        Ok(())
    }

    fn set_speed(&mut self, speed: i16) -> Result<(), MotorError> {
        self.calls.push(RigCall::Speed(speed));
        self.speed = speed;
        Ok(())
    }

    fn set_zero_offset(&mut self, offset: ZeroOffset) -> Result<(), MotorError> {
        self.calls.push(RigCall::SetZero(offset.value()));
        self.offset = offset.value();
        Ok(())
    }

    fn clear_status(&mut self) -> Result<(), MotorError> {
        self.calls.push(RigCall::ClearStatus);
        self.speed = 0;
        Ok(())
    }

    fn average_speed(&mut self, _window: &SampleWindow) -> Result<SampleStats, SampleError> {
        self.calls.push(RigCall::Sample);
        self.samples += 1;
        if self.fail_on_sample == Some(self.samples) {
            let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged");
            return Err(MotorError::Transport(TransportError::Io(io)).into());
        }

        let (samples, forward_failures, reverse_failures) = self.window;
        let (average, decode_failures) = match self.speed {
            s if s > 0 => ((self.forward)(self.offset), forward_failures),
            s if s < 0 => ((self.reverse)(self.offset), reverse_failures),
            _ => (0.0, 0),
        };
        Ok(SampleStats {
            average,
            samples,
            decode_failures,
        })
    }

    fn settle(&mut self, duration: Duration) {
        self.calls.push(RigCall::Settle(duration.as_millis() as u64));
    }
}

/// Motor model speaking the wire protocol.
///
/// Forward speed is `100 - |offset|`, reverse is `-(100 - |offset + bias|)`,
/// so the balanced offset sits at `-bias / 2`. A coarse-zero command moves
/// the rotor to `reference`.
#[derive(Clone)]
pub struct SimulatedMotor {
    state: Arc<Mutex<SimState>>,
}

struct SimState {
    bias: i16,
    reference: u16,
    position: u16,
    zero_offset: i16,
    speed: i16,
    frames: Vec<Vec<u8>>,
    pending: Vec<u8>,
    telemetry_reads: usize,
    truncate: Box<dyn Fn(usize) -> bool + Send>,
}

impl SimulatedMotor {
    pub fn new(bias: i16) -> Self {
        Self::with_reference(bias, 0)
    }

    pub fn with_reference(bias: i16, reference: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                bias,
                reference,
                position: 0x2000,
                zero_offset: 0,
                speed: 0,
                frames: Vec::new(),
                pending: Vec::new(),
                telemetry_reads: 0,
                truncate: Box::new(|_| false),
            })),
        }
    }

    /// Cut every n-th telemetry reply (1-based) down to four bytes
    pub fn truncate_every(self, n: usize) -> Self {
        self.truncate_when(move |read| read % n == 0)
    }

    /// Cut only the n-th telemetry reply (1-based) down to four bytes
    pub fn truncate_read(self, n: usize) -> Self {
        self.truncate_when(move |read| read == n)
    }

    fn truncate_when(self, rule: impl Fn(usize) -> bool + Send + 'static) -> Self {
        self.state.lock().unwrap().truncate = Box::new(rule);
        self
    }

    pub fn telemetry_reads(&self) -> usize {
        self.state.lock().unwrap().telemetry_reads
    }

    pub fn zero_offset(&self) -> i16 {
        self.state.lock().unwrap().zero_offset
    }

    pub fn speed(&self) -> i16 {
        self.state.lock().unwrap().speed
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().frames.clone()
    }
}

impl SimState {
    fn measured_speed(&self) -> i16 {
        let offset = self.zero_offset as i32;
        let magnitude = |o: i32| 100 - o.abs();
        match self.speed {
            s if s > 0 => magnitude(offset) as i16,
            s if s < 0 => -(magnitude(offset + self.bias as i32)) as i16,
            _ => 0,
        }
    }
}

impl Transport for SimulatedMotor {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.frames.push(bytes.to_vec());

        let Ok(header) = protocol::decode_header(bytes) else {
            return Ok(());
        };
        match header.opcode {
            Opcode::SetSpeed | Opcode::ClearStatus => state.speed = header.param as i16,
            Opcode::SetZeroOffset => state.zero_offset = header.param as i16,
            Opcode::CoarseZero => state.position = state.reference,
            Opcode::ReadTelemetry => {
                let telemetry = Telemetry {
                    position: state.position,
                    speed: state.measured_speed(),
                    current: 0,
                };
                let mut frame = encode_telemetry(telemetry).to_vec();
                state.telemetry_reads += 1;
                if (state.truncate)(state.telemetry_reads) {
                    frame.truncate(4);
                }
                state.pending = frame;
            }
            _ => {}
        }
        Ok(())
    }

    fn read_available(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        Ok(std::mem::take(&mut self.state.lock().unwrap().pending))
    }
}

mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.sleep(Duration::from_millis(250));
        other.advance(Duration::from_millis(50));
        assert_eq!(clock.now(), Duration::from_millis(300));
        assert_eq!(other.sleep_count(), 1);
    }
}
