// Command builders
//
// Pure constructors for every supported command. Range checks happen here so
// that nothing out of range ever reaches the transport.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::protocol::{Command, Opcode};

/// Address used by a factory-fresh controller
pub const DEFAULT_ADDRESS: u8 = 0x01;

/// Jog positions accepted by the controller
pub const JOG_POSITION_MIN: i16 = -8191;
pub const JOG_POSITION_MAX: i16 = 8191;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Motor address {value} out of range (0-255)")]
    AddressOutOfRange { value: i64 },

    #[error("Invalid motor address {input:?}: expected decimal or 0x-prefixed hex")]
    AddressSyntax { input: String },

    #[error("{what} value {value} does not fit in 16 bits ({min} to {max})")]
    OutOfRange {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

/// 8-bit motor address, second byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MotorAddress(u8);

impl MotorAddress {
    pub const fn from_u8(value: u8) -> Self {
        Self(value)
    }

    pub fn new(value: i64) -> Result<Self, ValidationError> {
        u8::try_from(value)
            .map(Self)
            .map_err(|_| ValidationError::AddressOutOfRange { value })
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for MotorAddress {
    fn default() -> Self {
        Self(DEFAULT_ADDRESS)
    }
}

impl fmt::Display for MotorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Accepts "17", "0x11" or "0X11"
impl FromStr for MotorAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let parsed = match input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
        {
            Some(hex) => i64::from_str_radix(hex, 16),
            None => input.parse::<i64>(),
        };

        let value = parsed.map_err(|_| ValidationError::AddressSyntax {
            input: s.to_string(),
        })?;
        Self::new(value)
    }
}

/// Calibrated zero electrical angle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ZeroOffset(pub i16);

impl ZeroOffset {
    pub fn value(self) -> i16 {
        self.0
    }

    /// Shift by `delta`, saturating at the i16 range
    pub fn shifted(self, delta: i16) -> Self {
        Self(self.0.saturating_add(delta))
    }
}

impl fmt::Display for ZeroOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.0, self.0 as u16)
    }
}

fn checked_i16(what: &'static str, value: i64) -> Result<i16, ValidationError> {
    i16::try_from(value).map_err(|_| ValidationError::OutOfRange {
        what,
        value,
        min: i16::MIN as i64,
        max: i16::MAX as i64,
    })
}

pub fn read_telemetry() -> Command {
    Command::bare(Opcode::ReadTelemetry)
}

pub fn set_speed(speed: i64) -> Result<Command, ValidationError> {
    Ok(Command::signed(Opcode::SetSpeed, checked_i16("Speed", speed)?))
}

pub fn stop() -> Command {
    Command::signed(Opcode::SetSpeed, 0)
}

pub fn clear_status() -> Command {
    Command::bare(Opcode::ClearStatus)
}

pub fn set_zero_offset(offset: ZeroOffset) -> Command {
    Command::signed(Opcode::SetZeroOffset, offset.value())
}

pub fn set_negative_limit(limit: i64) -> Result<Command, ValidationError> {
    Ok(Command::signed(
        Opcode::SetNegativeLimit,
        checked_i16("Negative limit", limit)?,
    ))
}

pub fn set_positive_limit(limit: i64) -> Result<Command, ValidationError> {
    Ok(Command::signed(
        Opcode::SetPositiveLimit,
        checked_i16("Positive limit", limit)?,
    ))
}

pub fn save_config() -> Command {
    Command::bare(Opcode::SaveConfig)
}

/// New address goes in the low byte, high byte stays zero
pub fn assign_address(new_address: MotorAddress) -> Command {
    Command::new(Opcode::AssignAddress, new_address.get() as u16)
}

pub fn prepare_coarse_zero() -> Command {
    Command::bare(Opcode::PrepareCoarseZero)
}

pub fn trigger_coarse_zero() -> Command {
    Command::bare(Opcode::CoarseZero)
}

/// Clamp a jog target into the accepted window
pub fn clamp_jog_position(position: i64) -> i16 {
    position.clamp(JOG_POSITION_MIN as i64, JOG_POSITION_MAX as i64) as i16
}

pub fn move_to(position: i64) -> Command {
    Command::signed(Opcode::MoveTo, clamp_jog_position(position))
}

pub fn soft_rezero() -> Command {
    Command::bare(Opcode::SoftRezero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::protocol::encode;

    #[test]
    fn test_parse_address() {
        assert_eq!("17".parse::<MotorAddress>().unwrap().get(), 17);
        assert_eq!("0x11".parse::<MotorAddress>().unwrap().get(), 0x11);
        assert_eq!("0X1f".parse::<MotorAddress>().unwrap().get(), 0x1F);
        assert_eq!(" 255 ".parse::<MotorAddress>().unwrap().get(), 255);
        assert_eq!("0".parse::<MotorAddress>().unwrap().get(), 0);
    }

    #[test]
    fn test_parse_address_rejects() {
        assert_eq!(
            "256".parse::<MotorAddress>(),
            Err(ValidationError::AddressOutOfRange { value: 256 })
        );
        assert_eq!(
            "-1".parse::<MotorAddress>(),
            Err(ValidationError::AddressOutOfRange { value: -1 })
        );
        assert!(matches!(
            "abc".parse::<MotorAddress>(),
            Err(ValidationError::AddressSyntax { .. })
        ));
        assert!(matches!(
            "0x".parse::<MotorAddress>(),
            Err(ValidationError::AddressSyntax { .. })
        ));
    }

    #[test]
    fn test_limit_validation() {
        assert!(set_negative_limit(-32768).is_ok());
        assert!(set_positive_limit(32767).is_ok());
        assert!(matches!(
            set_positive_limit(32768),
            Err(ValidationError::OutOfRange { value: 32768, .. })
        ));
        assert!(matches!(
            set_negative_limit(-40000),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(set_speed(70000).is_err());
    }

    #[test]
    fn test_limit_frames() {
        let frame = encode(0x01, set_negative_limit(-100).unwrap());
        assert_eq!(frame, [0xAA, 0x01, 0xC8, 0x00, 0x9C, 0xFF]);
        let frame = encode(0x01, set_positive_limit(4000).unwrap());
        assert_eq!(frame, [0xAA, 0x01, 0xC9, 0x00, 0xA0, 0x0F]);
    }

    #[test]
    fn test_jog_clamp() {
        assert_eq!(clamp_jog_position(9000), 8191);
        assert_eq!(clamp_jog_position(-9000), -8191);
        assert_eq!(clamp_jog_position(1234), 1234);
        assert_eq!(move_to(100_000).param_signed(), 8191);
    }

    #[test]
    fn test_jog_frames() {
        // 0x1555 is a sixth of a turn
        assert_eq!(encode(0x01, move_to(0x1555)), [0xAA, 0x01, 0xC2, 0x00, 0x55, 0x15]);
        assert_eq!(encode(0x02, move_to(0)), [0xAA, 0x02, 0xC2, 0x00, 0x00, 0x00]);
        assert_eq!(encode(0x01, soft_rezero()), [0xAA, 0x01, 0xC7, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_assign_address_frame() {
        let frame = encode(0x01, assign_address(MotorAddress::from_u8(0x22)));
        assert_eq!(frame, [0xAA, 0x01, 0xF0, 0x00, 0x22, 0x00]);
    }

    #[test]
    fn test_zero_offset_frame() {
        let frame = encode(0x01, set_zero_offset(ZeroOffset(-2)));
        assert_eq!(frame, [0xAA, 0x01, 0xF1, 0x00, 0xFE, 0xFF]);
    }

    #[test]
    fn test_zero_offset_saturates() {
        assert_eq!(ZeroOffset(i16::MAX - 1).shifted(20), ZeroOffset(i16::MAX));
        assert_eq!(ZeroOffset(i16::MIN + 1).shifted(-20), ZeroOffset(i16::MIN));
        assert_eq!(ZeroOffset(10).shifted(-15), ZeroOffset(-5));
    }
}
