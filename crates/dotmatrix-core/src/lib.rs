//! Cycle-driven Game Boy (DMG-01) emulation core.
//!
//! This crate contains the platform-agnostic emulator logic: the LR35902
//! interpreter, the memory bus, and the memory-mapped peripheral controllers
//! (PPU, timer, serial, interrupts, joypad, cartridge). Frontends live in
//! separate crates and drive the core via the [`gameboy`] facade, consuming
//! rendered frames from a channel.

use thiserror::Error;

/// Pure arithmetic and bit-manipulation primitives shared by the CPU.
pub mod alu;

/// Cartridge ROM image and MBC1 bank switching.
pub mod cartridge;

/// LR35902 fetch/decode/execute interpreter.
pub mod cpu;

/// High-level facade that wires the CPU and bus into a single machine.
pub mod gameboy;

/// Decoded instruction descriptor tables (unprefixed and 0xCB-prefixed).
pub mod isa;

/// Interrupt enable/pending registers and the five interrupt sources.
pub mod interrupts;

/// Joypad input register (stub; no input is ever pressed).
pub mod joypad;

/// Memory map and hardware plumbing.
pub mod mmu;

/// Pixel Processing Unit (PPU) scanline state machine.
pub mod ppu;

/// The CPU register file.
pub mod registers;

/// Serial port unit and link cable seam.
pub mod serial;

/// Whole-machine structural snapshots.
pub mod snapshot;

/// Sound unit stub (power bit only).
pub mod sound;

/// Divider/timer unit.
pub mod timer;

pub use gameboy::GameBoy;
pub use ppu::Frame;

/// Logical screen width in pixels.
pub const SCREEN_WIDTH: usize = 160;
/// Logical screen height in pixels.
pub const SCREEN_HEIGHT: usize = 144;

/// Errors surfaced by the emulator.
///
/// `Io`, `InvalidRom` and `UnsupportedMbc` can only occur while loading
/// images. The remaining kinds are raised from inside the tick loop and are
/// fatal: execution against an inconsistent machine state is never resumed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid ROM size: expected at least {expected} bytes but got {actual} bytes")]
    InvalidRom { expected: usize, actual: usize },

    #[error("unsupported MBC {0}")]
    UnsupportedMbc(u8),

    #[error("illegal instruction {opcode:#04x} at {pc:#06x}")]
    IllegalInstruction { opcode: u8, pc: u16 },

    #[error("access to unimplemented memory region at {addr:#06x}")]
    UnimplementedMemoryRegion { addr: u16 },

    #[error("instruction not implemented: {mnemonic} at {pc:#06x}")]
    InstructionNotImplemented { mnemonic: String, pc: u16 },
}
