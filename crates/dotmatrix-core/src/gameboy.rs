//! Machine assembly and the run scheduler.
//!
//! [`GameBoy`] wires the CPU and the bus together and owns the tick loop:
//! step the CPU, grant the peripherals the same number of machine cycles
//! (one at a time, spreading multi-cycle instructions over an idle budget),
//! drain interrupt requests, and hand completed frames to the consumer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{SendTimeoutError, Sender};

use crate::cpu::Cpu;
use crate::mmu::Mmu;
use crate::ppu::Frame;
use crate::registers::Register16;
use crate::Error;

/// Wall-clock budget of one frame when throttling to 60 Hz.
const FRAME_TIME: Duration = Duration::from_nanos(1_000_000_000 / 60);

/// How long a blocking wait may run before the stop signal is re-checked.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Post-boot IO register state, applied when no boot ROM is used.
const POST_BOOT_IO: [(u16, u8); 30] = [
    (0xFF05, 0x00),
    (0xFF06, 0x00),
    (0xFF07, 0x00),
    (0xFF10, 0x80),
    (0xFF11, 0xBF),
    (0xFF12, 0xF3),
    (0xFF14, 0xBF),
    (0xFF16, 0x3F),
    (0xFF17, 0x00),
    (0xFF19, 0xBF),
    (0xFF1A, 0x7F),
    (0xFF1B, 0xFF),
    (0xFF1C, 0x9F),
    (0xFF1E, 0xBF),
    (0xFF20, 0xFF),
    (0xFF21, 0x00),
    (0xFF22, 0x00),
    (0xFF23, 0xBF),
    (0xFF24, 0x77),
    (0xFF25, 0xF3),
    (0xFF26, 0xF1),
    (0xFF40, 0x91),
    (0xFF42, 0x00),
    (0xFF45, 0x00),
    (0xFF47, 0xFC),
    (0xFF48, 0xFF),
    (0xFF49, 0xFF),
    (0xFF4A, 0x00),
    (0xFF4B, 0x00),
    (0xFFFF, 0x00),
];

pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
    /// Cap frame delivery to 60 Hz wall-clock. Tests run with this off.
    pub throttle: bool,
    /// Machine cycles left before the CPU runs its next instruction.
    idle_cycles: u8,
}

impl GameBoy {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            mmu: Mmu::new(),
            throttle: true,
            idle_cycles: 0,
        }
    }

    /// Reset to the initial power-on state while keeping the loaded
    /// cartridge and boot ROM.
    pub fn reset(&mut self) {
        let cart = std::mem::take(&mut self.mmu.cart);
        let boot = self.mmu.take_boot_rom();
        self.cpu = Cpu::new();
        self.mmu = Mmu::new();
        self.mmu.cart = cart;
        self.idle_cycles = 0;
        if let Some(data) = boot {
            // A 256-byte image was validated on the way in.
            let _ = self.mmu.load_boot_rom(data);
        }
    }

    pub fn load_rom(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.mmu.cart = crate::cartridge::Cartridge::load(data)?;
        Ok(())
    }

    pub fn load_rom_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        self.mmu.cart = crate::cartridge::Cartridge::from_file(path)?;
        Ok(())
    }

    /// Map a boot ROM and arrange for execution to start in it.
    pub fn load_boot_rom(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.mmu.load_boot_rom(data)?;
        self.cpu.pc = 0x0000;
        Ok(())
    }

    pub fn load_boot_rom_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        log::info!("loading boot ROM at {}", path.as_ref().display());
        let data = std::fs::read(path)?;
        self.load_boot_rom(data)
    }

    /// Start from the documented post-boot state instead of running a boot
    /// ROM: registers seeded, IO pre-programmed, PC at the cartridge entry.
    pub fn skip_boot_rom(&mut self) -> Result<(), Error> {
        self.cpu.pc = 0x0100;
        self.cpu.regs.write16(Register16::Af, 0x01B0);
        self.cpu.regs.write16(Register16::Bc, 0x0013);
        self.cpu.regs.write16(Register16::De, 0x00D8);
        self.cpu.regs.write16(Register16::Hl, 0x014D);
        self.cpu.regs.write16(Register16::Sp, 0xFFFE);

        for (addr, value) in POST_BOOT_IO {
            self.mmu.write8(addr, value)?;
        }
        Ok(())
    }

    /// Advance the whole machine by one machine cycle.
    ///
    /// The CPU's effects become visible to the peripherals on this tick;
    /// interrupt requests the peripherals raise here reach IF before the
    /// next tick's fetch.
    pub fn tick(&mut self) -> Result<(), Error> {
        if self.idle_cycles > 0 {
            self.idle_cycles -= 1;
        } else {
            let cycles = self.cpu.cycle(&mut self.mmu)?;
            self.idle_cycles = cycles.saturating_sub(1);
        }

        self.mmu.ppu.cycle();
        self.mmu.timer.cycle();
        self.mmu.serial.cycle();
        self.mmu.drain_interrupts();
        Ok(())
    }

    /// Run until power-off, a fatal fault, or the stop signal.
    ///
    /// Completed frames go to `frames`; the send blocks until the consumer
    /// accepts the previous frame, re-checking `stop` while waiting, so the
    /// loop always winds down promptly.
    pub fn run(&mut self, frames: &Sender<Frame>, stop: &AtomicBool) -> Result<(), Error> {
        let mut next_frame = Instant::now() + FRAME_TIME;

        while self.cpu.power_on {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }

            if let Err(err) = self.tick() {
                log::error!("emulation fault: {err} | {}", self.cpu.debug_state());
                return Err(err);
            }

            if let Some(frame) = self.mmu.ppu.take_frame() {
                if self.throttle {
                    if !Self::wait_until(next_frame, stop) {
                        return Ok(());
                    }
                    next_frame += FRAME_TIME;
                }
                if !Self::deliver(frames, frame, stop) {
                    return Ok(());
                }
            }
        }

        log::info!("power off");
        Ok(())
    }

    /// Sleep until `deadline`, returning false if stopped meanwhile.
    fn wait_until(deadline: Instant, stop: &AtomicBool) -> bool {
        while Instant::now() < deadline {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Blocking frame send that honors the stop signal. Returns false when
    /// the loop should exit.
    fn deliver(frames: &Sender<Frame>, frame: Frame, stop: &AtomicBool) -> bool {
        let mut frame = frame;
        loop {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            match frames.send_timeout(frame, STOP_POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => frame = returned,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}
