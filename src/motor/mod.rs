// Motor control module for the BLDC controller
//
// Provides:
// - Wire protocol (6-byte commands, 7-byte telemetry)
// - Validated command builders
// - Byte transport (serial port)
// - High-level controller for a single motor

pub mod commands;
mod controller;
pub mod protocol;
pub mod transport;

pub use commands::{MotorAddress, ValidationError, ZeroOffset};
pub use controller::{MotorController, MotorError};
pub use protocol::{Command, FrameError, Opcode, Telemetry, decode_header, decode_telemetry, encode};
pub use transport::{SerialTransport, Transport, TransportError};
