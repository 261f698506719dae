use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bldc_zero_calib::clock::SystemClock;
use bldc_zero_calib::config::CalibrationConfig;
use bldc_zero_calib::jog::{self, JogCommand, JogError, JogHandle, JogPosition};
use bldc_zero_calib::messages::ProcedureReport;
use bldc_zero_calib::motor::{MotorAddress, MotorController, SerialTransport, ZeroOffset};
use bldc_zero_calib::procedure::{self, ProcedureOptions};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(version, about = "Zero electrical angle calibration for serial BLDC controllers")]
struct Cli {
    /// Serial port, e.g. /dev/ttyUSB0 or COM10
    #[arg(short, long)]
    port: String,

    #[arg(short, long, default_value_t = bldc_zero_calib::motor::transport::DEFAULT_BAUDRATE)]
    baud: u32,

    /// Motor address, decimal or 0x-prefixed hex
    #[arg(long, default_value = "1")]
    id: MotorAddress,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Coarse zero, fine zero angle search, verification and save
    Calibrate {
        /// JSON file overriding calibration tunables
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        skip_coarse_zero: bool,

        /// Starting offset when coarse zero is skipped
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        initial_offset: i16,

        /// Assign this address after calibration
        #[arg(long)]
        new_id: Option<MotorAddress>,

        #[arg(long, allow_negative_numbers = true)]
        negative_limit: Option<i64>,

        #[arg(long, allow_negative_numbers = true)]
        positive_limit: Option<i64>,

        /// Leave settings in RAM only
        #[arg(long)]
        no_save: bool,

        /// Print events and the final report as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Drive absolute positions from the keyboard
    Jog {
        #[arg(long, default_value_t = 50)]
        step: i64,

        #[arg(long, default_value_t = 500)]
        big_step: i64,
    },
    /// Read one telemetry frame
    Read,
}

#[tokio::main]
async fn main() {
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let transport = SerialTransport::open_with_baudrate(&cli.port, cli.baud)?;
    let motor = MotorController::new(transport, SystemClock::new(), cli.id);
    info!("Connected to motor {} on {}", cli.id, cli.port);

    match cli.command {
        Cmd::Calibrate {
            config,
            skip_coarse_zero,
            initial_offset,
            new_id,
            negative_limit,
            positive_limit,
            no_save,
            json,
        } => {
            let config = match config {
                Some(path) => CalibrationConfig::from_file(path)?,
                None => CalibrationConfig::default(),
            };
            let motor = motor.with_response_timeout(config.response_timeout());
            let options = ProcedureOptions {
                skip_coarse_zero,
                initial_offset: ZeroOffset(initial_offset),
                new_address: new_id,
                negative_limit,
                positive_limit,
                save: !no_save,
            };

            // calibration is blocking serial I/O with long sleeps
            let report = tokio::task::spawn_blocking(move || {
                let mut motor = motor;
                procedure::run(&mut motor, &config, &options, |event| {
                    if json {
                        match serde_json::to_string(event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!("Failed to serialize event: {}", e),
                        }
                    }
                })
            })
            .await??;

            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                print_report(&report);
            }
        }
        Cmd::Jog { step, big_step } => {
            let (handle, worker) = jog::spawn_sender(motor, jog::JOG_QUEUE_CAPACITY);

            info!("Controls: ←/→ step, ↑/↓ big step, 0 center, Z re-zero, Q quit");
            enable_raw_mode()?;
            let result = run_jog(&handle, step, big_step);
            disable_raw_mode()?;

            // shut the sender down; it stops the motor when the controller drops
            drop(handle);
            let stats = tokio::task::spawn_blocking(move || worker.join())
                .await?
                .map_err(|_| "jog sender panicked")?;
            info!("Jog finished: {} commands sent, {} failed", stats.sent, stats.failed);
            result?;
        }
        Cmd::Read => {
            let mut motor = motor;
            let t = motor.read_telemetry()?;
            println!("position {} speed {} current {}", t.position, t.speed, t.current);
        }
    }

    Ok(())
}

fn run_jog(handle: &JogHandle, step: i64, big_step: i64) -> Result<(), BoxError> {
    let mut position = JogPosition::default();

    loop {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press && kind != KeyEventKind::Repeat {
            continue;
        }

        let command = match code {
            KeyCode::Left => position.nudge(-step),
            KeyCode::Right => position.nudge(step),
            KeyCode::Down => position.nudge(-big_step),
            KeyCode::Up => position.nudge(big_step),
            KeyCode::Char('0') => position.set(0),
            KeyCode::Char('z') => position.rezero(),
            // the controller drop sends the stop
            KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
            _ => continue,
        };

        submit(handle, command)?;
        info!("Position {}", position.get());
    }
}

fn submit(handle: &JogHandle, command: JogCommand) -> Result<(), BoxError> {
    match handle.submit(command) {
        Ok(()) => Ok(()),
        // the next key press supersedes a dropped position
        Err(JogError::QueueFull) => {
            warn!("Jog queue full, dropped {:?}", command);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &ProcedureReport) {
    let outcome = &report.outcome;
    let verification = &report.verification;
    if outcome.telemetry().all_failed() {
        println!("⚠ No telemetry could be decoded, the zero angle is not trustworthy");
    } else if outcome.converged() {
        println!("✓ Zero angle found after {} iterations", outcome.iterations());
    } else {
        println!(
            "⚠ Iteration budget exhausted after {} iterations, using best effort",
            outcome.iterations()
        );
    }
    if verification.telemetry.all_failed() {
        println!("⚠ Verification read no telemetry");
    } else if verification.passed {
        println!("✓ Verification passed (difference {:.2})", verification.difference);
    } else {
        println!(
            "⚠ Verification difference {:.2} is large, zero angle may be imprecise",
            verification.difference
        );
    }
    if report.telemetry.decode_failures > 0 {
        println!(
            "⚠ {} of {} telemetry samples unreadable (counted as speed 0)",
            report.telemetry.decode_failures, report.telemetry.samples
        );
    }

    println!("Motor address:    0x{:02X}", report.address);
    println!("Zero angle:       {}", outcome.offset());
    if let Some(limit) = report.negative_limit {
        println!("Negative limit:   {}", limit);
    }
    if let Some(limit) = report.positive_limit {
        println!("Positive limit:   {}", limit);
    }
    println!("Saved:            {}", if report.saved { "yes" } else { "no" });
}
