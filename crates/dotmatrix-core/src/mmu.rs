//! Memory map and hardware plumbing.
//!
//! The bus owns every peripheral and dispatches 8-bit accesses by address
//! range. 16-bit accesses are two independent 8-bit accesses, low byte
//! first. Regions without an owner (echo RAM, the OAM DMA register, the
//! unpopulated IO holes) raise [`Error::UnimplementedMemoryRegion`]; inside
//! the tick loop that error is fatal by design.

use crate::cartridge::Cartridge;
use crate::interrupts::{InterruptKind, Interrupts};
use crate::joypad::Joypad;
use crate::ppu::Ppu;
use crate::serial::Serial;
use crate::sound::Sound;
use crate::timer::Timer;
use crate::Error;

const WRAM_SIZE: usize = 0x2000;
const HRAM_SIZE: usize = 0x7F;
const BOOT_ROM_SIZE: usize = 0x100;

/// Writing 1 here un-maps the boot ROM overlay.
pub const BOOT_ROM_LATCH_ADDR: u16 = 0xFF50;

/// OAM DMA source register; DMA is not modeled.
const OAM_DMA_ADDR: u16 = 0xFF46;

pub struct Mmu {
    /// Work RAM (two contiguous 4 KiB banks).
    pub wram: [u8; WRAM_SIZE],
    /// High RAM.
    pub hram: [u8; HRAM_SIZE],

    pub cart: Cartridge,
    pub ppu: Ppu,
    pub timer: Timer,
    pub serial: Serial,
    pub joypad: Joypad,
    pub sound: Sound,
    pub interrupts: Interrupts,

    boot_rom: Option<Vec<u8>>,
    pub boot_mapped: bool,
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            wram: [0; WRAM_SIZE],
            hram: [0; HRAM_SIZE],
            cart: Cartridge::new(),
            ppu: Ppu::new(),
            timer: Timer::new(),
            serial: Serial::new(),
            joypad: Joypad::new(),
            sound: Sound::new(),
            interrupts: Interrupts::new(),
            boot_rom: None,
            boot_mapped: false,
        }
    }

    /// Overlay a 256-byte boot ROM on 0x0000-0x00FF until the program
    /// releases it through the 0xFF50 latch.
    pub fn load_boot_rom(&mut self, data: Vec<u8>) -> Result<(), Error> {
        if data.len() != BOOT_ROM_SIZE {
            return Err(Error::InvalidRom {
                expected: BOOT_ROM_SIZE,
                actual: data.len(),
            });
        }
        log::info!("boot ROM mapped over 0x0000-0x00FF");
        self.boot_rom = Some(data);
        self.boot_mapped = true;
        Ok(())
    }

    /// Detach the boot ROM image (used by machine reset).
    pub(crate) fn take_boot_rom(&mut self) -> Option<Vec<u8>> {
        self.boot_mapped = false;
        self.boot_rom.take()
    }

    pub fn read8(&self, addr: u16) -> Result<u8, Error> {
        match addr {
            0x0000..=0x00FF if self.boot_mapped => Ok(self
                .boot_rom
                .as_ref()
                .and_then(|rom| rom.get(addr as usize).copied())
                .unwrap_or(0xFF)),
            0x0000..=0x7FFF | 0xA000..=0xBFFF => Ok(self.cart.read(addr)),
            // VRAM/OAM reads are served even while the PPU has the region
            // locked; only writes are gated.
            0x8000..=0x9FFF => Ok(self.ppu.vram[(addr - 0x8000) as usize]),
            0xC000..=0xDFFF => Ok(self.wram[(addr - 0xC000) as usize]),
            0xE000..=0xFDFF => Err(Error::UnimplementedMemoryRegion { addr }),
            0xFE00..=0xFE9F => Ok(self.ppu.oam[(addr - 0xFE00) as usize]),
            0xFEA0..=0xFEFF => Err(Error::UnimplementedMemoryRegion { addr }),
            0xFF00 => Ok(self.joypad.read()),
            0xFF01..=0xFF02 => Ok(self.serial.read(addr)),
            0xFF04..=0xFF07 => Ok(self.timer.read(addr)),
            0xFF0F | 0xFFFF => Ok(self.interrupts.read(addr)),
            0xFF10..=0xFF3F => Ok(self.sound.read(addr)),
            OAM_DMA_ADDR => Err(Error::UnimplementedMemoryRegion { addr }),
            0xFF40..=0xFF4B => Ok(self.ppu.read_reg(addr)),
            BOOT_ROM_LATCH_ADDR => Ok(0),
            0xFF80..=0xFFFE => Ok(self.hram[(addr - 0xFF80) as usize]),
            _ => Err(Error::UnimplementedMemoryRegion { addr }),
        }
    }

    pub fn write8(&mut self, addr: u16, value: u8) -> Result<(), Error> {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => self.cart.write(addr, value),
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[(addr - 0x8000) as usize] = value;
                }
            }
            0xC000..=0xDFFF => self.wram[(addr - 0xC000) as usize] = value,
            0xE000..=0xFDFF => return Err(Error::UnimplementedMemoryRegion { addr }),
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize] = value;
                }
            }
            0xFEA0..=0xFEFF => return Err(Error::UnimplementedMemoryRegion { addr }),
            0xFF00 => self.joypad.write(value),
            0xFF01..=0xFF02 => self.serial.write(addr, value),
            0xFF04..=0xFF07 => self.timer.write(addr, value),
            0xFF0F | 0xFFFF => self.interrupts.write(addr, value),
            0xFF10..=0xFF3F => self.sound.write(addr, value),
            OAM_DMA_ADDR => return Err(Error::UnimplementedMemoryRegion { addr }),
            0xFF40..=0xFF4B => self.ppu.write_reg(addr, value),
            BOOT_ROM_LATCH_ADDR => {
                if value & 0x01 != 0 && self.boot_mapped {
                    log::info!("boot ROM un-mapped");
                    self.boot_mapped = false;
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = value,
            _ => return Err(Error::UnimplementedMemoryRegion { addr }),
        }
        Ok(())
    }

    pub fn read16(&self, addr: u16) -> Result<u16, Error> {
        let low = self.read8(addr)?;
        let high = self.read8(addr.wrapping_add(1))?;
        Ok(u16::from_le_bytes([low, high]))
    }

    pub fn write16(&mut self, addr: u16, value: u16) -> Result<(), Error> {
        self.write8(addr, value as u8)?;
        self.write8(addr.wrapping_add(1), (value >> 8) as u8)
    }

    /// Collect the peripherals' latched interrupt requests into IF. Called
    /// once per machine tick, after the peripherals have cycled.
    pub fn drain_interrupts(&mut self) {
        if self.ppu.take_vblank_interrupt() {
            self.interrupts.request(InterruptKind::VBlank);
        }
        if self.ppu.take_stat_interrupt() {
            self.interrupts.request(InterruptKind::LcdStat);
        }
        if self.timer.take_interrupt() {
            self.interrupts.request(InterruptKind::Timer);
        }
        if self.serial.take_interrupt() {
            self.interrupts.request(InterruptKind::Serial);
        }
        if self.joypad.take_interrupt() {
            self.interrupts.request(InterruptKind::Joypad);
        }
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}
