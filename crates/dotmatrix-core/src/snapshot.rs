//! Whole-machine structural snapshots.
//!
//! A [`Snapshot`] copies every peripheral's public state into owned, plain
//! data and serializes it as JSON. It exists for debugging and post-mortems;
//! re-hydration is deliberately out of scope.

use std::path::Path;

use serde::Serialize;

use crate::cpu::Ime;
use crate::gameboy::GameBoy;
use crate::Error;

#[derive(Serialize)]
pub struct CpuSnapshot {
    pub registers: [u8; 10],
    pub pc: u16,
    pub ime: Ime,
    pub halted: bool,
    pub power_on: bool,
}

#[derive(Serialize)]
pub struct PpuSnapshot {
    pub lcdc: u8,
    pub stat: u8,
    pub scy: u8,
    pub scx: u8,
    pub ly: u8,
    pub lyc: u8,
    pub bgp: u8,
    pub obp0: u8,
    pub obp1: u8,
    pub wy: u8,
    pub wx: u8,
    pub dot: u16,
    pub vram: Vec<u8>,
    pub oam: Vec<u8>,
}

#[derive(Serialize)]
pub struct TimerSnapshot {
    pub div: u8,
    pub tima: u8,
    pub tma: u8,
    pub tac: u8,
}

#[derive(Serialize)]
pub struct SerialSnapshot {
    pub sb: u8,
    pub sc: u8,
}

#[derive(Serialize)]
pub struct InterruptSnapshot {
    pub flag: u8,
    pub enabled: u8,
}

#[derive(Serialize)]
pub struct CartridgeSnapshot {
    pub bank_rom_low: u8,
    pub bank_rom_high_or_ram: u8,
    pub banking_mode: bool,
    pub ram_enabled: bool,
    pub ram: Vec<u8>,
}

#[derive(Serialize)]
pub struct Snapshot {
    pub cpu: CpuSnapshot,
    pub ppu: PpuSnapshot,
    pub timer: TimerSnapshot,
    pub serial: SerialSnapshot,
    pub interrupts: InterruptSnapshot,
    pub cartridge: CartridgeSnapshot,
    pub joypad_select: u8,
    pub sound_power_on: bool,
    pub boot_rom_mapped: bool,
    pub wram: Vec<u8>,
    pub hram: Vec<u8>,
}

impl Snapshot {
    pub fn capture(gb: &GameBoy) -> Self {
        Self {
            cpu: CpuSnapshot {
                registers: gb.cpu.regs.raw(),
                pc: gb.cpu.pc,
                ime: gb.cpu.ime,
                halted: gb.cpu.halted,
                power_on: gb.cpu.power_on,
            },
            ppu: PpuSnapshot {
                lcdc: gb.mmu.ppu.lcdc,
                stat: gb.mmu.ppu.stat,
                scy: gb.mmu.ppu.scy,
                scx: gb.mmu.ppu.scx,
                ly: gb.mmu.ppu.line,
                lyc: gb.mmu.ppu.lyc,
                bgp: gb.mmu.ppu.bgp,
                obp0: gb.mmu.ppu.obp0,
                obp1: gb.mmu.ppu.obp1,
                wy: gb.mmu.ppu.wy,
                wx: gb.mmu.ppu.wx,
                dot: gb.mmu.ppu.dot,
                vram: gb.mmu.ppu.vram.to_vec(),
                oam: gb.mmu.ppu.oam.to_vec(),
            },
            timer: TimerSnapshot {
                div: gb.mmu.timer.div,
                tima: gb.mmu.timer.tima,
                tma: gb.mmu.timer.tma,
                tac: gb.mmu.timer.tac,
            },
            serial: SerialSnapshot {
                sb: gb.mmu.serial.sb,
                sc: gb.mmu.serial.sc,
            },
            interrupts: InterruptSnapshot {
                flag: gb.mmu.interrupts.flag,
                enabled: gb.mmu.interrupts.enabled,
            },
            cartridge: CartridgeSnapshot {
                bank_rom_low: gb.mmu.cart.bank_rom_low,
                bank_rom_high_or_ram: gb.mmu.cart.bank_rom_high_or_ram,
                banking_mode: gb.mmu.cart.banking_mode,
                ram_enabled: gb.mmu.cart.ram_enabled,
                ram: gb.mmu.cart.ram.clone(),
            },
            joypad_select: gb.mmu.joypad.select,
            sound_power_on: gb.mmu.sound.power_on,
            boot_rom_mapped: gb.mmu.boot_mapped,
            wram: gb.mmu.wram.to_vec(),
            hram: gb.mmu.hram.to_vec(),
        }
    }

    /// Serialize to pretty JSON at `path`.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(&path, json)?;
        log::info!("snapshot written to {}", path.as_ref().display());
        Ok(())
    }
}
