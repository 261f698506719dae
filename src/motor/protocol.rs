// Binary protocol for the BLDC controller
//
// Command frame (6 bytes):   [0xAA, ADDR, OPCODE, SUBCODE, PARAM_LO, PARAM_HI]
// Telemetry frame (7 bytes): [0xAB, POS_LO, POS_HI, SPD_LO, SPD_HI, CUR_LO, CUR_HI]
//
// All multi-byte fields are little-endian. Position is reported inverted
// (0x3FFF - raw) because of how the sensor is mounted.

use serde::Serialize;

/// First byte of every command frame
pub const COMMAND_MARKER: u8 = 0xAA;

/// First byte of every telemetry response
pub const TELEMETRY_MARKER: u8 = 0xAB;

pub const COMMAND_LEN: usize = 6;
pub const TELEMETRY_LEN: usize = 7;

/// Full-scale value of the 14-bit position sensor
pub const POSITION_MAX: u16 = 0x3FFF;

/// Sub-code carried in byte 3 of the telemetry request
pub const TELEMETRY_SUBCODE: u8 = 0x07;

/// Opcode set (fixed for the supported firmware)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Opcode {
    ReadTelemetry = 0x08,
    CoarseZero = 0x0B,
    SaveConfig = 0xB0,
    SetSpeed = 0xC0,
    ClearStatus = 0xC1,
    MoveTo = 0xC2,
    SoftRezero = 0xC7,
    SetNegativeLimit = 0xC8,
    SetPositiveLimit = 0xC9,
    AssignAddress = 0xF0,
    SetZeroOffset = 0xF1,
    PrepareCoarseZero = 0xF2,
}

impl Opcode {
    /// Byte actually placed on the wire.
    ///
    /// The controller has no working 0xC1 handler; clearing status is done
    /// with a zero-speed 0xC0 frame instead.
    pub fn wire_byte(self) -> u8 {
        match self {
            Opcode::ClearStatus => Opcode::SetSpeed as u8,
            other => other as u8,
        }
    }

    /// Byte 3 of the frame
    pub fn subcode(self) -> u8 {
        match self {
            Opcode::ReadTelemetry => TELEMETRY_SUBCODE,
            _ => 0x00,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x08 => Opcode::ReadTelemetry,
            0x0B => Opcode::CoarseZero,
            0xB0 => Opcode::SaveConfig,
            0xC0 => Opcode::SetSpeed,
            0xC1 => Opcode::ClearStatus,
            0xC2 => Opcode::MoveTo,
            0xC7 => Opcode::SoftRezero,
            0xC8 => Opcode::SetNegativeLimit,
            0xC9 => Opcode::SetPositiveLimit,
            0xF0 => Opcode::AssignAddress,
            0xF1 => Opcode::SetZeroOffset,
            0xF2 => Opcode::PrepareCoarseZero,
            other => return Err(FrameError::UnknownOpcode { opcode: other }),
        })
    }
}

/// Decode errors. None of these are fatal to a calibration session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Truncated frame: got {len} bytes, need {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("Bad frame marker: expected 0x{expected:02X}, got 0x{found:02X}")]
    BadMarker { expected: u8, found: u8 },

    #[error("Unknown opcode 0x{opcode:02X}")]
    UnknownOpcode { opcode: u8 },
}

/// A logical command: opcode plus a 16-bit parameter.
///
/// The parameter is stored in its unsigned wire form; signed values are
/// wrapped with two's complement on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub param: u16,
}

impl Command {
    pub fn new(opcode: Opcode, param: u16) -> Self {
        Self { opcode, param }
    }

    pub fn signed(opcode: Opcode, value: i16) -> Self {
        Self::new(opcode, value as u16)
    }

    /// Command without a parameter
    pub fn bare(opcode: Opcode) -> Self {
        Self::new(opcode, 0)
    }

    /// Parameter viewed as a signed value
    pub fn param_signed(&self) -> i16 {
        self.param as i16
    }
}

/// Serialize a command for the motor at `address`
pub fn encode(address: u8, command: Command) -> [u8; COMMAND_LEN] {
    let [lo, hi] = command.param.to_le_bytes();
    [
        COMMAND_MARKER,
        address,
        command.opcode.wire_byte(),
        command.opcode.subcode(),
        lo,
        hi,
    ]
}

/// Parsed command frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub address: u8,
    pub opcode: Opcode,
    pub subcode: u8,
    pub param: u16,
}

/// Parse a command frame back into its fields. A `ClearStatus` frame
/// reads back as `SetSpeed` 0, since both share the 0xC0 byte.
pub fn decode_header(frame: &[u8]) -> Result<CommandHeader, FrameError> {
    if frame.len() < COMMAND_LEN {
        return Err(FrameError::Truncated {
            len: frame.len(),
            needed: COMMAND_LEN,
        });
    }
    if frame[0] != COMMAND_MARKER {
        return Err(FrameError::BadMarker {
            expected: COMMAND_MARKER,
            found: frame[0],
        });
    }

    Ok(CommandHeader {
        address: frame[1],
        opcode: Opcode::try_from(frame[2])?,
        subcode: frame[3],
        param: u16::from_le_bytes([frame[4], frame[5]]),
    })
}

/// Decoded telemetry response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Telemetry {
    pub position: u16,
    pub speed: i16,
    pub current: u16,
}

/// Undo the sensor inversion. Values above 0x3FFF wrap instead of panicking.
pub fn decode_position(raw: u16) -> u16 {
    POSITION_MAX.wrapping_sub(raw)
}

/// Decode a telemetry response. Extra trailing bytes are ignored.
pub fn decode_telemetry(bytes: &[u8]) -> Result<Telemetry, FrameError> {
    if bytes.len() < TELEMETRY_LEN {
        return Err(FrameError::Truncated {
            len: bytes.len(),
            needed: TELEMETRY_LEN,
        });
    }
    if bytes[0] != TELEMETRY_MARKER {
        return Err(FrameError::BadMarker {
            expected: TELEMETRY_MARKER,
            found: bytes[0],
        });
    }

    let raw_position = u16::from_le_bytes([bytes[1], bytes[2]]);
    Ok(Telemetry {
        position: decode_position(raw_position),
        speed: i16::from_le_bytes([bytes[3], bytes[4]]),
        current: u16::from_le_bytes([bytes[5], bytes[6]]),
    })
}

/// Build a telemetry frame for simulated controllers
#[cfg(test)]
pub fn encode_telemetry(telemetry: Telemetry) -> [u8; TELEMETRY_LEN] {
    let raw_position = decode_position(telemetry.position);
    let [p_lo, p_hi] = raw_position.to_le_bytes();
    let [s_lo, s_hi] = telemetry.speed.to_le_bytes();
    let [c_lo, c_hi] = telemetry.current.to_le_bytes();
    [TELEMETRY_MARKER, p_lo, p_hi, s_lo, s_hi, c_lo, c_hi]
}
