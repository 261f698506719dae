// High-level controller for one motor
//
// Owns the transport and the target address. Every method builds a command,
// sends it, and waits for the (optional) response window.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::commands::{self, MotorAddress, ValidationError, ZeroOffset};
use super::protocol::{self, Command, FrameError, Telemetry};
use super::transport::{Transport, TransportError};
use crate::clock::Clock;
use crate::config::RESPONSE_TIMEOUT;

#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Telemetry decode failed: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl MotorError {
    /// Decode failures can be absorbed; everything else ends the session
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MotorError::Frame(_))
    }
}

pub type Result<T> = std::result::Result<T, MotorError>;

pub struct MotorController<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    address: MotorAddress,
    response_timeout: Duration,
}

impl<T: Transport, C: Clock> MotorController<T, C> {
    pub fn new(transport: T, clock: C, address: MotorAddress) -> Self {
        Self {
            transport,
            clock,
            address,
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    /// How long each command waits before draining the reply
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn address(&self) -> MotorAddress {
        self.address
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Send a command and return whatever came back
    pub fn send(&mut self, command: Command) -> Result<Vec<u8>> {
        let frame = protocol::encode(self.address.get(), command);
        debug!("Send {:?} -> {:02X?}", command.opcode, frame);
        self.transport.write(&frame)?;
        Ok(self.transport.read_available(self.response_timeout)?)
    }

    pub fn read_telemetry(&mut self) -> Result<Telemetry> {
        let response = self.send(commands::read_telemetry())?;
        Ok(protocol::decode_telemetry(&response)?)
    }

    pub fn set_speed(&mut self, speed: i16) -> Result<()> {
        debug!("Set speed {}", speed);
        self.send(commands::set_speed(speed as i64)?)?;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        debug!("Stop motor {}", self.address);
        self.send(commands::stop())?;
        Ok(())
    }

    pub fn clear_status(&mut self) -> Result<()> {
        self.send(commands::clear_status())?;
        Ok(())
    }

    pub fn set_zero_offset(&mut self, offset: ZeroOffset) -> Result<()> {
        info!("Set zero angle offset {}", offset);
        self.send(commands::set_zero_offset(offset))?;
        Ok(())
    }

    pub fn set_negative_limit(&mut self, limit: i64) -> Result<()> {
        let command = commands::set_negative_limit(limit)?;
        info!("Set negative limit {}", limit);
        self.send(command)?;
        Ok(())
    }

    pub fn set_positive_limit(&mut self, limit: i64) -> Result<()> {
        let command = commands::set_positive_limit(limit)?;
        info!("Set positive limit {}", limit);
        self.send(command)?;
        Ok(())
    }

    /// Write RAM settings (offset, limits, address) to non-volatile storage
    pub fn save_config(&mut self) -> Result<()> {
        info!("Saving configuration on motor {}", self.address);
        self.send(commands::save_config())?;
        Ok(())
    }

    /// Give the motor a new address and retarget subsequent commands to it
    pub fn assign_address(&mut self, new_address: MotorAddress) -> Result<()> {
        info!("Assigning address {} to motor {}", new_address, self.address);
        self.send(commands::assign_address(new_address))?;
        self.address = new_address;
        Ok(())
    }

    pub fn move_to(&mut self, position: i64) -> Result<()> {
        let command = commands::move_to(position);
        debug!("Move to {}", command.param_signed());
        self.send(command)?;
        Ok(())
    }

    pub fn soft_rezero(&mut self) -> Result<()> {
        info!("Soft re-zero");
        self.send(commands::soft_rezero())?;
        Ok(())
    }

    /// Reset, drive into the reference and adopt the reached position as
    /// the zero offset. Leaves the motor stopped.
    pub fn coarse_zero(&mut self, reference_wait: Duration) -> Result<ZeroOffset> {
        info!("Seeking coarse zero");
        self.send(commands::prepare_coarse_zero())?;
        self.send(commands::trigger_coarse_zero())?;
        self.clock.sleep(reference_wait);

        // an unreadable reply aborts rather than zeroing at position 0
        let telemetry = self.read_telemetry()?;
        // raw readings above 0x3FFF wrap in decode_position and land negative here
        let offset = ZeroOffset(telemetry.position as i16);
        self.set_zero_offset(offset)?;
        self.stop()?;

        info!("Coarse zero at {}", offset);
        Ok(offset)
    }

    pub fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration);
    }
}

impl<T: Transport, C: Clock> Drop for MotorController<T, C> {
    fn drop(&mut self) {
        // Never leave the rotor spinning
        if let Err(e) = self.stop() {
            warn!("Failed to stop motor on drop: {}", e);
        }
    }
}
