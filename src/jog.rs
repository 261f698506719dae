// Jog mode: absolute position commands from an interactive front end
//
// The front end pushes commands into a bounded queue without blocking; a
// single sender thread owns the controller and drains the queue in order.
// No speed command is sent while jogging. The single stop comes from the
// controller drop when the session ends.

use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::motor::commands::clamp_jog_position;
use crate::motor::{MotorController, MotorError, Transport};

/// Default queue depth
pub const JOG_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogCommand {
    MoveTo(i64),
    SoftRezero,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JogError {
    #[error("Jog queue full, command dropped")]
    QueueFull,

    #[error("Jog sender has shut down")]
    Closed,
}

/// Producer side of the jog queue
#[derive(Clone)]
pub struct JogHandle {
    tx: mpsc::Sender<JogCommand>,
}

impl JogHandle {
    /// Queue a command. Never blocks.
    pub fn submit(&self, command: JogCommand) -> Result<(), JogError> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => JogError::QueueFull,
            TrySendError::Closed(_) => JogError::Closed,
        })
    }
}

/// Summary returned when the sender stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JogStats {
    pub sent: usize,
    pub failed: usize,
}

/// Move `controller` into a sender thread. The thread exits once every
/// `JogHandle` is dropped and the queue is drained; the controller is
/// dropped with it, which stops the motor.
pub fn spawn_sender<T, C>(
    controller: MotorController<T, C>,
    capacity: usize,
) -> (JogHandle, JoinHandle<JogStats>)
where
    T: Transport + Send + 'static,
    C: Clock + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let worker = std::thread::spawn(move || sender_loop(controller, rx));
    (JogHandle { tx }, worker)
}

fn sender_loop<T: Transport, C: Clock>(
    mut controller: MotorController<T, C>,
    mut rx: mpsc::Receiver<JogCommand>,
) -> JogStats {
    let mut stats = JogStats::default();

    while let Some(command) = rx.blocking_recv() {
        debug!("Jog {:?}", command);
        match dispatch(&mut controller, command) {
            Ok(()) => stats.sent += 1,
            Err(e) => {
                // a failed send does not end the session; the next position supersedes it
                warn!("Jog command {:?} failed: {}", command, e);
                stats.failed += 1;
            }
        }
    }

    info!("Jog sender done: {} sent, {} failed", stats.sent, stats.failed);
    stats
}

fn dispatch<T: Transport, C: Clock>(
    controller: &mut MotorController<T, C>,
    command: JogCommand,
) -> Result<(), MotorError> {
    match command {
        JogCommand::MoveTo(position) => controller.move_to(position),
        JogCommand::SoftRezero => controller.soft_rezero(),
    }
}

/// Tracks the commanded jog position on the front-end side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JogPosition(i16);

impl JogPosition {
    pub fn get(self) -> i16 {
        self.0
    }

    /// Nudge by `delta`, clamped to the jog window
    pub fn nudge(&mut self, delta: i64) -> JogCommand {
        self.set(self.0 as i64 + delta)
    }

    pub fn set(&mut self, position: i64) -> JogCommand {
        self.0 = clamp_jog_position(position);
        JogCommand::MoveTo(self.0 as i64)
    }

    /// The controller's soft re-zero makes the current position 0
    pub fn rezero(&mut self) -> JogCommand {
        self.0 = 0;
        JogCommand::SoftRezero
    }
}
