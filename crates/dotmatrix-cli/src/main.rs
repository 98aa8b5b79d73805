//! Headless command-line frontend.
//!
//! Runs a ROM in the emulator core on a worker thread and drains rendered
//! frames on the main thread. Window management and audio are not part of
//! this frontend; it exists to exercise ROMs, watch serial output (the
//! common test-ROM reporting channel) and capture machine snapshots.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use dotmatrix_core::serial::LinkPort;
use dotmatrix_core::snapshot::Snapshot;
use dotmatrix_core::GameBoy;

#[derive(Parser)]
#[command(name = "dotmatrix", about = "Game Boy (DMG-01) emulator")]
struct Args {
    /// Path to ROM file
    rom: PathBuf,

    /// Path to a 256-byte boot ROM file
    #[arg(long)]
    bootrom: Option<PathBuf>,

    /// Run as fast as possible instead of capping at 60 Hz
    #[arg(long)]
    uncapped: bool,

    /// Enable debug logging of CPU state
    #[arg(long)]
    debug: bool,

    /// Echo serial output to stdout
    #[arg(long)]
    serial: bool,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Write a machine snapshot to this path on exit
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

/// A link port that prints every transferred byte, the reporting channel
/// used by most test ROMs.
struct StdoutLinkPort;

impl LinkPort for StdoutLinkPort {
    fn transfer(&mut self, byte: u8) -> u8 {
        print!("{}", byte as char);
        let _ = std::io::stdout().flush();
        0xFF
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.debug {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("starting emulator");

    let mut gb = GameBoy::new();
    gb.throttle = !args.uncapped;
    if args.serial {
        gb.mmu.serial.connect(Box::new(StdoutLinkPort));
    }

    if let Err(err) = gb.load_rom_file(&args.rom) {
        error!("failed to load ROM: {err}");
        return ExitCode::FAILURE;
    }

    let setup = match &args.bootrom {
        Some(path) => gb.load_boot_rom_file(path),
        None => gb.skip_boot_rom(),
    };
    if let Err(err) = setup {
        error!("failed to set up machine: {err}");
        return ExitCode::FAILURE;
    }

    let (frame_tx, frame_rx) = crossbeam_channel::bounded(0);
    let stop = Arc::new(AtomicBool::new(false));

    let worker_stop = stop.clone();
    let worker = std::thread::spawn(move || {
        let result = gb.run(&frame_tx, &worker_stop);
        (gb, result)
    });

    let mut frame_count: u64 = 0;
    for _frame in frame_rx.iter() {
        frame_count += 1;
        if let Some(limit) = args.frames {
            if frame_count >= limit {
                info!("frame limit reached after {frame_count} frames");
                stop.store(true, Ordering::Relaxed);
                break;
            }
        }
    }
    drop(frame_rx);

    let (gb, result) = match worker.join() {
        Ok(done) => done,
        Err(_) => {
            error!("emulator thread panicked");
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = &args.snapshot {
        if let Err(err) = Snapshot::capture(&gb).write_to(path) {
            error!("failed to write snapshot: {err}");
            return ExitCode::FAILURE;
        }
    }

    match result {
        Ok(()) => {
            info!("clean exit after {frame_count} frames");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("emulator stopped: {err}");
            ExitCode::FAILURE
        }
    }
}
