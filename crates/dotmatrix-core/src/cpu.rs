//! LR35902 fetch/decode/execute interpreter.
//!
//! The CPU is table-driven: the opcode selects a descriptor from [`crate::isa`]
//! and execution dispatches on its mnemonic. The program counter is advanced
//! past the whole instruction *before* the handler runs, so operand readers
//! address immediates relative to the already-advanced PC (`PC - 1` for the
//! 8-bit kinds, `PC - 2` for the 16-bit kinds).

use crate::alu;
use crate::interrupts::InterruptKind;
use crate::isa::{Instruction, Mnemonic, Operand, PostModify, CB_INSTRUCTIONS, INSTRUCTIONS};
use crate::mmu::Mmu;
use crate::registers::{Flag, Register16, Registers};
use crate::Error;

/// Machine cycles consumed by an interrupt vector transfer.
const INTERRUPT_TRANSFER_CYCLES: u8 = 5;

/// Machine cycles consumed per tick while halted.
const HALT_IDLE_CYCLES: u8 = 1;

/// The interrupt-master-enable latch.
///
/// `EI` requests `EnableAfterNext`; the latch then steps one state per
/// executed instruction, so interrupts are deliverable only after the
/// instruction *following* `EI`. `RETI` requests `EnableAfterCurrent`, which
/// reaches `Enabled` as `RETI` itself completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum Ime {
    #[default]
    Disabled,
    EnableAfterNext,
    EnableAfterCurrent,
    Enabled,
}

pub struct Cpu {
    pub regs: Registers,
    /// Address of the next instruction to fetch. Transiently points past the
    /// current instruction's immediates during execution.
    pub pc: u16,
    pub ime: Ime,
    pub halted: bool,
    /// Cleared by `STOP`; the scheduler exits when this drops.
    pub power_on: bool,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            pc: 0,
            ime: Ime::Disabled,
            halted: false,
            power_on: true,
        }
    }

    /// Run one fetch/decode/execute step (or service an interrupt) and
    /// return the number of machine cycles consumed.
    pub fn cycle(&mut self, mmu: &mut Mmu) -> Result<u8, Error> {
        if self.ime == Ime::Enabled {
            if let Some(kind) = mmu.interrupts.first_pending() {
                return self.service_interrupt(mmu, kind);
            }
        }

        if self.halted {
            // HALT wakes on any pending-and-enabled interrupt even while IME
            // is off; the pending request is left in IF in that case.
            if mmu.interrupts.any_pending() {
                self.halted = false;
            } else {
                return Ok(HALT_IDLE_CYCLES);
            }
        }

        let at = self.pc;
        let opcode = mmu.read8(at)?;
        let instruction: &Instruction = if opcode == 0xCB {
            let cb_opcode = mmu.read8(at.wrapping_add(1))?;
            &CB_INSTRUCTIONS[cb_opcode as usize]
        } else {
            &INSTRUCTIONS[opcode as usize]
        };

        log::trace!(
            "{:04X}: {:02X} {:?} | {}",
            at,
            opcode,
            instruction.mnemonic,
            self.debug_state()
        );

        self.pc = at.wrapping_add(instruction.size);
        let taken = self.execute(mmu, instruction, opcode, at)?;
        self.apply_post_modifiers(instruction);
        self.advance_ime();

        Ok(if taken {
            instruction.cycles_taken
        } else {
            instruction.cycles_skipped
        })
    }

    /// Formatted register dump for diagnostics.
    pub fn debug_state(&self) -> String {
        format!(
            "AF:{:04X} BC:{:04X} DE:{:04X} HL:{:04X} SP:{:04X} PC:{:04X} IME:{:?} HALT:{}",
            self.regs.read16(Register16::Af),
            self.regs.read16(Register16::Bc),
            self.regs.read16(Register16::De),
            self.regs.read16(Register16::Hl),
            self.regs.read16(Register16::Sp),
            self.pc,
            self.ime,
            self.halted,
        )
    }

    fn service_interrupt(&mut self, mmu: &mut Mmu, kind: InterruptKind) -> Result<u8, Error> {
        log::trace!("servicing {kind:?} interrupt at PC {:04X}", self.pc);
        mmu.interrupts.acknowledge(kind);
        self.ime = Ime::Disabled;
        self.halted = false;
        self.push(mmu, self.pc)?;
        self.pc = kind.vector();
        Ok(INTERRUPT_TRANSFER_CYCLES)
    }

    fn advance_ime(&mut self) {
        self.ime = match self.ime {
            Ime::EnableAfterNext => Ime::EnableAfterCurrent,
            Ime::EnableAfterCurrent => Ime::Enabled,
            other => other,
        };
    }

    fn apply_post_modifiers(&mut self, instruction: &Instruction) {
        for operand in &instruction.operands {
            if let Operand::Reg16Ptr(register, post) = *operand {
                let value = self.regs.read16(register);
                match post {
                    PostModify::Increment => self.regs.write16(register, value.wrapping_add(1)),
                    PostModify::Decrement => self.regs.write16(register, value.wrapping_sub(1)),
                    PostModify::None => {}
                }
            }
        }
    }

    /// Evaluate the optional branch condition at `index` in the operand
    /// list. Unconditional forms simply have no condition operand there.
    fn condition_met(&self, operands: &[Operand], index: usize) -> bool {
        match operands.get(index) {
            Some(&Operand::Condition(flag, negate)) => self.regs.read_flag(flag) != negate,
            _ => true,
        }
    }

    fn operand_read8(&self, mmu: &Mmu, operand: Operand) -> Result<u8, Error> {
        match operand {
            Operand::D8 | Operand::R8 => mmu.read8(self.pc.wrapping_sub(1)),
            Operand::Reg8(register) => Ok(self.regs.read8(register)),
            Operand::Reg8Ptr(register) => {
                mmu.read8(0xFF00 | self.regs.read8(register) as u16)
            }
            Operand::Reg16Ptr(register, _) => mmu.read8(self.regs.read16(register)),
            Operand::A8Ptr => {
                let offset = mmu.read8(self.pc.wrapping_sub(1))?;
                mmu.read8(0xFF00 | offset as u16)
            }
            Operand::A16Ptr => {
                let addr = mmu.read16(self.pc.wrapping_sub(2))?;
                mmu.read8(addr)
            }
            _ => Err(self.bad_operand(operand)),
        }
    }

    fn operand_read16(&self, mmu: &Mmu, operand: Operand) -> Result<u16, Error> {
        match operand {
            Operand::D16 | Operand::A16 => mmu.read16(self.pc.wrapping_sub(2)),
            Operand::Reg16(register) => Ok(self.regs.read16(register)),
            Operand::A8 => {
                let offset = mmu.read8(self.pc.wrapping_sub(1))?;
                Ok(0xFF00 | offset as u16)
            }
            _ => Err(self.bad_operand(operand)),
        }
    }

    fn operand_store8(&mut self, mmu: &mut Mmu, operand: Operand, value: u8) -> Result<(), Error> {
        match operand {
            Operand::Reg8(register) => {
                self.regs.write8(register, value);
                Ok(())
            }
            Operand::Reg8Ptr(register) => {
                mmu.write8(0xFF00 | self.regs.read8(register) as u16, value)
            }
            Operand::Reg16Ptr(register, _) => mmu.write8(self.regs.read16(register), value),
            Operand::A8Ptr => {
                let offset = mmu.read8(self.pc.wrapping_sub(1))?;
                mmu.write8(0xFF00 | offset as u16, value)
            }
            Operand::A16Ptr => {
                let addr = mmu.read16(self.pc.wrapping_sub(2))?;
                mmu.write8(addr, value)
            }
            _ => Err(self.bad_operand(operand)),
        }
    }

    fn operand_store16(&mut self, mmu: &mut Mmu, operand: Operand, value: u16) -> Result<(), Error> {
        match operand {
            Operand::Reg16(register) => {
                self.regs.write16(register, value);
                Ok(())
            }
            Operand::A16Ptr => {
                let addr = mmu.read16(self.pc.wrapping_sub(2))?;
                mmu.write16(addr, value)
            }
            _ => Err(self.bad_operand(operand)),
        }
    }

    fn bad_operand(&self, operand: Operand) -> Error {
        Error::InstructionNotImplemented {
            mnemonic: format!("operand {operand:?}"),
            pc: self.pc,
        }
    }

    fn push(&mut self, mmu: &mut Mmu, value: u16) -> Result<(), Error> {
        let sp = self.regs.read16(Register16::Sp).wrapping_sub(2);
        self.regs.write16(Register16::Sp, sp);
        mmu.write16(sp, value)
    }

    fn pop(&mut self, mmu: &mut Mmu) -> Result<u16, Error> {
        let sp = self.regs.read16(Register16::Sp);
        let value = mmu.read16(sp)?;
        self.regs.write16(Register16::Sp, sp.wrapping_add(2));
        Ok(value)
    }

    fn set_znhc(&mut self, z: bool, n: bool, h: bool, c: bool) {
        self.regs.write_flag(Flag::Z, z);
        self.regs.write_flag(Flag::N, n);
        self.regs.write_flag(Flag::H, h);
        self.regs.write_flag(Flag::C, c);
    }

    /// Dispatch on the mnemonic. Returns whether the conditional action was
    /// taken (always true for unconditional instructions).
    fn execute(
        &mut self,
        mmu: &mut Mmu,
        instruction: &Instruction,
        opcode: u8,
        at: u16,
    ) -> Result<bool, Error> {
        let ops = &instruction.operands;
        match instruction.mnemonic {
            Mnemonic::Nop => {}

            Mnemonic::Ld8 => {
                let value = self.operand_read8(mmu, ops[1])?;
                self.operand_store8(mmu, ops[0], value)?;
            }
            Mnemonic::Ld16 => {
                let value = self.operand_read16(mmu, ops[1])?;
                self.operand_store16(mmu, ops[0], value)?;
            }
            Mnemonic::LdSp => {
                // LD HL, SP+r8. Carries are computed as if the low byte of SP
                // and the raw offset byte were added as unsigned 8-bit values.
                let offset = self.operand_read8(mmu, ops[2])?;
                let sp = self.regs.read16(Register16::Sp);
                let result = alu::offset_address(sp, offset as i8 as i16);
                let (_, carry, half) = alu::add8(sp as u8, offset);
                self.regs.write16(Register16::Hl, result);
                self.set_znhc(false, false, half, carry);
            }

            Mnemonic::Inc8 => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, _, half) = alu::add8(value, 1);
                self.operand_store8(mmu, ops[0], result)?;
                self.regs.write_flag(Flag::Z, result == 0);
                self.regs.write_flag(Flag::N, false);
                self.regs.write_flag(Flag::H, half);
            }
            Mnemonic::Dec8 => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, _, half) = alu::sub8(value, 1);
                self.operand_store8(mmu, ops[0], result)?;
                self.regs.write_flag(Flag::Z, result == 0);
                self.regs.write_flag(Flag::N, true);
                self.regs.write_flag(Flag::H, half);
            }
            Mnemonic::Inc16 => {
                let value = self.operand_read16(mmu, ops[0])?;
                self.operand_store16(mmu, ops[0], value.wrapping_add(1))?;
            }
            Mnemonic::Dec16 => {
                let value = self.operand_read16(mmu, ops[0])?;
                self.operand_store16(mmu, ops[0], value.wrapping_sub(1))?;
            }

            Mnemonic::Add8 => {
                let a = self.operand_read8(mmu, ops[0])?;
                let value = self.operand_read8(mmu, ops[1])?;
                let (result, carry, half) = alu::add8(a, value);
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, half, carry);
            }
            Mnemonic::Adc => {
                let a = self.operand_read8(mmu, ops[0])?;
                let value = self.operand_read8(mmu, ops[1])?;
                let carry_in = self.regs.read_flag(Flag::C) as u8;
                let (partial, carry1, half1) = alu::add8(a, value);
                let (result, carry2, half2) = alu::add8(partial, carry_in);
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, half1 || half2, carry1 || carry2);
            }
            Mnemonic::Sub => {
                let a = self.operand_read8(mmu, ops[0])?;
                let value = self.operand_read8(mmu, ops[1])?;
                let (result, carry, half) = alu::sub8(a, value);
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, true, half, carry);
            }
            Mnemonic::Sbc => {
                let a = self.operand_read8(mmu, ops[0])?;
                let value = self.operand_read8(mmu, ops[1])?;
                let carry_in = self.regs.read_flag(Flag::C) as u8;
                let (partial, carry1, half1) = alu::sub8(a, value);
                let (result, carry2, half2) = alu::sub8(partial, carry_in);
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, true, half1 || half2, carry1 || carry2);
            }
            Mnemonic::Cp => {
                let a = self.operand_read8(mmu, ops[0])?;
                let value = self.operand_read8(mmu, ops[1])?;
                let (result, carry, half) = alu::sub8(a, value);
                self.set_znhc(result == 0, true, half, carry);
            }

            Mnemonic::Add16 => {
                let a = self.operand_read16(mmu, ops[0])?;
                let b = self.operand_read16(mmu, ops[1])?;
                let (result, carry, half) = alu::add16(a, b);
                self.operand_store16(mmu, ops[0], result)?;
                self.regs.write_flag(Flag::N, false);
                self.regs.write_flag(Flag::H, half);
                self.regs.write_flag(Flag::C, carry);
            }
            Mnemonic::AddSp => {
                let offset = self.operand_read8(mmu, ops[1])?;
                let sp = self.regs.read16(Register16::Sp);
                let result = alu::offset_address(sp, offset as i8 as i16);
                let (_, carry, half) = alu::add8(sp as u8, offset);
                self.regs.write16(Register16::Sp, result);
                self.set_znhc(false, false, half, carry);
            }

            Mnemonic::Daa => {
                let a = self.operand_read8(mmu, ops[0])?;
                let (result, carry) = alu::bcd_adjust(
                    a,
                    self.regs.read_flag(Flag::N),
                    self.regs.read_flag(Flag::H),
                    self.regs.read_flag(Flag::C),
                );
                self.operand_store8(mmu, ops[0], result)?;
                self.regs.write_flag(Flag::Z, result == 0);
                self.regs.write_flag(Flag::H, false);
                self.regs.write_flag(Flag::C, carry);
            }
            Mnemonic::Cpl => {
                let a = self.operand_read8(mmu, ops[0])?;
                self.operand_store8(mmu, ops[0], a ^ 0xFF)?;
                self.regs.write_flag(Flag::N, true);
                self.regs.write_flag(Flag::H, true);
            }

            Mnemonic::And => {
                let result = self.operand_read8(mmu, ops[0])? & self.operand_read8(mmu, ops[1])?;
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, true, false);
            }
            Mnemonic::Or => {
                let result = self.operand_read8(mmu, ops[0])? | self.operand_read8(mmu, ops[1])?;
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, false, false);
            }
            Mnemonic::Xor => {
                let result = self.operand_read8(mmu, ops[0])? ^ self.operand_read8(mmu, ops[1])?;
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, false, false);
            }

            Mnemonic::Jp => {
                let target = self.operand_read16(mmu, ops[0])?;
                let taken = self.condition_met(ops, 1);
                if taken {
                    self.pc = target;
                }
                return Ok(taken);
            }
            Mnemonic::Jr => {
                let offset = self.operand_read8(mmu, ops[0])? as i8;
                let taken = self.condition_met(ops, 1);
                if taken {
                    self.pc = alu::offset_address(self.pc, offset as i16);
                }
                return Ok(taken);
            }
            Mnemonic::Call => {
                let target = self.operand_read16(mmu, ops[0])?;
                let taken = self.condition_met(ops, 1);
                if taken {
                    self.push(mmu, self.pc)?;
                    self.pc = target;
                }
                return Ok(taken);
            }
            Mnemonic::Ret => {
                let taken = self.condition_met(ops, 0);
                if taken {
                    self.pc = self.pop(mmu)?;
                }
                return Ok(taken);
            }
            Mnemonic::Reti => {
                self.pc = self.pop(mmu)?;
                self.ime = Ime::EnableAfterCurrent;
            }
            Mnemonic::Rst => {
                let Operand::Const8(target) = ops[0] else {
                    return Err(self.bad_operand(ops[0]));
                };
                self.push(mmu, self.pc)?;
                self.pc = target as u16;
            }

            Mnemonic::Push => {
                let value = self.operand_read16(mmu, ops[0])?;
                self.push(mmu, value)?;
            }
            Mnemonic::Pop => {
                let value = self.pop(mmu)?;
                self.operand_store16(mmu, ops[0], value)?;
            }

            Mnemonic::Rlc | Mnemonic::Rlca => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, out) = alu::shift_left(value, alu::read_bit(value, 7));
                self.operand_store8(mmu, ops[0], result)?;
                let zero = instruction.mnemonic == Mnemonic::Rlc && result == 0;
                self.set_znhc(zero, false, false, out);
            }
            Mnemonic::Rl | Mnemonic::Rla => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, out) = alu::shift_left(value, self.regs.read_flag(Flag::C));
                self.operand_store8(mmu, ops[0], result)?;
                let zero = instruction.mnemonic == Mnemonic::Rl && result == 0;
                self.set_znhc(zero, false, false, out);
            }
            Mnemonic::Rrc | Mnemonic::Rrca => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, out) = alu::shift_right(value, alu::read_bit(value, 0));
                self.operand_store8(mmu, ops[0], result)?;
                let zero = instruction.mnemonic == Mnemonic::Rrc && result == 0;
                self.set_znhc(zero, false, false, out);
            }
            Mnemonic::Rr | Mnemonic::Rra => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, out) = alu::shift_right(value, self.regs.read_flag(Flag::C));
                self.operand_store8(mmu, ops[0], result)?;
                let zero = instruction.mnemonic == Mnemonic::Rr && result == 0;
                self.set_znhc(zero, false, false, out);
            }
            Mnemonic::Sla => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, out) = alu::shift_left(value, false);
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, false, out);
            }
            Mnemonic::Sra => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, out) = alu::shift_right(value, alu::read_bit(value, 7));
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, false, out);
            }
            Mnemonic::Srl => {
                let value = self.operand_read8(mmu, ops[0])?;
                let (result, out) = alu::shift_right(value, false);
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, false, out);
            }
            Mnemonic::Swap => {
                let result = alu::swap(self.operand_read8(mmu, ops[0])?);
                self.operand_store8(mmu, ops[0], result)?;
                self.set_znhc(result == 0, false, false, false);
            }

            Mnemonic::Bit => {
                let Operand::Const8(bit) = ops[0] else {
                    return Err(self.bad_operand(ops[0]));
                };
                let value = self.operand_read8(mmu, ops[1])?;
                self.regs.write_flag(Flag::Z, !alu::read_bit(value, bit));
                self.regs.write_flag(Flag::N, false);
                self.regs.write_flag(Flag::H, true);
            }
            Mnemonic::Res | Mnemonic::Set => {
                let Operand::Const8(bit) = ops[0] else {
                    return Err(self.bad_operand(ops[0]));
                };
                let value = self.operand_read8(mmu, ops[1])?;
                let result = alu::write_bit(value, bit, instruction.mnemonic == Mnemonic::Set);
                self.operand_store8(mmu, ops[1], result)?;
            }

            Mnemonic::Scf => {
                self.regs.write_flag(Flag::N, false);
                self.regs.write_flag(Flag::H, false);
                self.regs.write_flag(Flag::C, true);
            }
            Mnemonic::Ccf => {
                let carry = self.regs.read_flag(Flag::C);
                self.regs.write_flag(Flag::N, false);
                self.regs.write_flag(Flag::H, false);
                self.regs.write_flag(Flag::C, !carry);
            }

            Mnemonic::Di => self.ime = Ime::Disabled,
            Mnemonic::Ei => self.ime = Ime::EnableAfterNext,
            Mnemonic::Halt => self.halted = true,
            Mnemonic::Stop => {
                log::info!("STOP executed at {at:#06x}; powering off");
                self.power_on = false;
            }

            Mnemonic::Illegal => {
                return Err(Error::IllegalInstruction { opcode, pc: at });
            }
            Mnemonic::Prefix => {
                return Err(Error::InstructionNotImplemented {
                    mnemonic: format!("{:?}", instruction.mnemonic),
                    pc: at,
                });
            }
        }

        Ok(true)
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use crate::interrupts::InterruptKind;
    use crate::registers::Register8;

    /// A CPU and bus with `code` placed at 0x0100 of an MBC1 cartridge, the
    /// program counter on the first instruction and the stack in HRAM.
    fn machine_with(code: &[u8]) -> (Cpu, Mmu) {
        let mut rom = vec![0u8; 0x8000];
        rom[0x0147] = 0x01;
        rom[0x0100..0x0100 + code.len()].copy_from_slice(code);

        let mut mmu = Mmu::new();
        mmu.cart = Cartridge::load(rom).unwrap();
        let mut cpu = Cpu::new();
        cpu.pc = 0x0100;
        cpu.regs.write16(Register16::Sp, 0xFFFE);
        (cpu, mmu)
    }

    #[test]
    fn nop_then_jp() {
        let (mut cpu, mut mmu) = machine_with(&[0x00, 0xC3, 0x50, 0x01]);

        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 1);
        assert_eq!(cpu.pc, 0x0101);

        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 4);
        assert_eq!(cpu.pc, 0x0150);
    }

    #[test]
    fn bit_7_h_sets_zero_and_keeps_carry() {
        let (mut cpu, mut mmu) = machine_with(&[0xCB, 0x7C]);
        cpu.regs.write8(Register8::H, 0x00);
        cpu.regs.write_flag(Flag::C, true);

        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 2);
        assert_eq!(cpu.pc, 0x0102);
        assert!(cpu.regs.read_flag(Flag::Z));
        assert!(!cpu.regs.read_flag(Flag::N));
        assert!(cpu.regs.read_flag(Flag::H));
        assert!(cpu.regs.read_flag(Flag::C));

        let (mut cpu, mut mmu) = machine_with(&[0xCB, 0x7C]);
        cpu.regs.write8(Register8::H, 0x80);
        cpu.cycle(&mut mmu).unwrap();
        assert!(!cpu.regs.read_flag(Flag::Z));
    }

    #[test]
    fn push_pop_round_trips_through_the_stack() {
        // LD BC,0x1234; PUSH BC; POP HL.
        let (mut cpu, mut mmu) = machine_with(&[0x01, 0x34, 0x12, 0xC5, 0xE1]);

        for _ in 0..3 {
            cpu.cycle(&mut mmu).unwrap();
        }
        assert_eq!(cpu.regs.read16(Register16::Hl), 0x1234);
        assert_eq!(cpu.regs.read16(Register16::Sp), 0xFFFE);
    }

    #[test]
    fn push_pop_invariant_via_helpers() {
        let (mut cpu, mut mmu) = machine_with(&[]);
        for value in [0x0000u16, 0x1234, 0xFFFF, 0x8001] {
            cpu.push(&mut mmu, value).unwrap();
            assert_eq!(cpu.pop(&mut mmu).unwrap(), value);
            assert_eq!(cpu.regs.read16(Register16::Sp), 0xFFFE);
        }
    }

    #[test]
    fn inc8_overflow_flags() {
        // INC A with A = 0xFF.
        let (mut cpu, mut mmu) = machine_with(&[0x3C]);
        cpu.regs.write8(Register8::A, 0xFF);
        cpu.regs.write_flag(Flag::C, true);
        cpu.cycle(&mut mmu).unwrap();

        assert_eq!(cpu.regs.read8(Register8::A), 0x00);
        assert!(cpu.regs.read_flag(Flag::Z));
        assert!(!cpu.regs.read_flag(Flag::N));
        assert!(cpu.regs.read_flag(Flag::H));
        assert!(cpu.regs.read_flag(Flag::C), "C must be untouched");
    }

    #[test]
    fn dec8_borrow_flags() {
        // DEC A with A = 0x10.
        let (mut cpu, mut mmu) = machine_with(&[0x3D]);
        cpu.regs.write8(Register8::A, 0x10);
        cpu.cycle(&mut mmu).unwrap();

        assert_eq!(cpu.regs.read8(Register8::A), 0x0F);
        assert!(!cpu.regs.read_flag(Flag::Z));
        assert!(cpu.regs.read_flag(Flag::N));
        assert!(cpu.regs.read_flag(Flag::H));
        assert!(!cpu.regs.read_flag(Flag::C));
    }

    #[test]
    fn daa_adjusts_bcd_sums() {
        // ADD A,B; DAA with 0x99 + 0x01.
        let (mut cpu, mut mmu) = machine_with(&[0x80, 0x27]);
        cpu.regs.write8(Register8::A, 0x99);
        cpu.regs.write8(Register8::B, 0x01);
        cpu.cycle(&mut mmu).unwrap();
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x00);
        assert!(cpu.regs.read_flag(Flag::C));
        assert!(cpu.regs.read_flag(Flag::Z));

        let (mut cpu, mut mmu) = machine_with(&[0x80, 0x27]);
        cpu.regs.write8(Register8::A, 0x45);
        cpu.regs.write8(Register8::B, 0x38);
        cpu.cycle(&mut mmu).unwrap();
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x83);
        assert!(!cpu.regs.read_flag(Flag::C));
    }

    #[test]
    fn ld_hl_sp_offset_flags() {
        // LD HL, SP+0x08 with SP = 0xFFF8.
        let (mut cpu, mut mmu) = machine_with(&[0xF8, 0x08]);
        cpu.regs.write16(Register16::Sp, 0xFFF8);
        cpu.cycle(&mut mmu).unwrap();

        assert_eq!(cpu.regs.read16(Register16::Hl), 0x0000);
        assert!(!cpu.regs.read_flag(Flag::Z));
        assert!(!cpu.regs.read_flag(Flag::N));
        assert!(cpu.regs.read_flag(Flag::H));
        assert!(cpu.regs.read_flag(Flag::C));

        // A negative offset still uses the unsigned 8-bit carry rule.
        let (mut cpu, mut mmu) = machine_with(&[0xF8, 0xFF]);
        cpu.regs.write16(Register16::Sp, 0x0001);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read16(Register16::Hl), 0x0000);
        assert!(cpu.regs.read_flag(Flag::H));
        assert!(cpu.regs.read_flag(Flag::C));
    }

    #[test]
    fn add_sp_signed_offset() {
        // ADD SP,-2 with SP = 0xFFFE.
        let (mut cpu, mut mmu) = machine_with(&[0xE8, 0xFE]);
        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 4);
        assert_eq!(cpu.regs.read16(Register16::Sp), 0xFFFC);
        assert!(!cpu.regs.read_flag(Flag::Z));
    }

    #[test]
    fn relative_jumps_are_signed() {
        // JR -2 loops back onto itself.
        let (mut cpu, mut mmu) = machine_with(&[0x18, 0xFE]);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.pc, 0x0100);
    }

    #[test]
    fn conditional_jumps_price_both_paths() {
        // JR NZ,+2 with Z set: skipped.
        let (mut cpu, mut mmu) = machine_with(&[0x20, 0x02]);
        cpu.regs.write_flag(Flag::Z, true);
        assert_eq!(cpu.cycle(&mut mmu).unwrap(), 2);
        assert_eq!(cpu.pc, 0x0102);

        // With Z clear: taken.
        let (mut cpu, mut mmu) = machine_with(&[0x20, 0x02]);
        assert_eq!(cpu.cycle(&mut mmu).unwrap(), 3);
        assert_eq!(cpu.pc, 0x0104);
    }

    #[test]
    fn call_and_ret() {
        // CALL 0x0110 ... RET at 0x0110.
        let mut code = vec![0xCD, 0x10, 0x01];
        code.resize(0x10, 0x00);
        code.push(0xC9);
        let (mut cpu, mut mmu) = machine_with(&code);

        assert_eq!(cpu.cycle(&mut mmu).unwrap(), 6);
        assert_eq!(cpu.pc, 0x0110);
        assert_eq!(cpu.regs.read16(Register16::Sp), 0xFFFC);

        assert_eq!(cpu.cycle(&mut mmu).unwrap(), 4);
        assert_eq!(cpu.pc, 0x0103);
        assert_eq!(cpu.regs.read16(Register16::Sp), 0xFFFE);
    }

    #[test]
    fn rst_jumps_to_its_constant() {
        let (mut cpu, mut mmu) = machine_with(&[0xEF]);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.pc, 0x0028);
        assert_eq!(mmu.read16(0xFFFC).unwrap(), 0x0101);
    }

    #[test]
    fn post_increment_and_decrement_operands() {
        // LD A,(HL+); LD A,(HL-).
        let (mut cpu, mut mmu) = machine_with(&[0x2A, 0x3A]);
        cpu.regs.write16(Register16::Hl, 0xC000);
        mmu.write8(0xC000, 0x42).unwrap();

        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x42);
        assert_eq!(cpu.regs.read16(Register16::Hl), 0xC001);

        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read16(Register16::Hl), 0xC000);
    }

    #[test]
    fn high_page_loads() {
        // LDH (0x80),A; LDH A,(0x80).
        let (mut cpu, mut mmu) = machine_with(&[0xE0, 0x80, 0x3E, 0x00, 0xF0, 0x80]);
        cpu.regs.write8(Register8::A, 0x5A);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(mmu.read8(0xFF80).unwrap(), 0x5A);

        cpu.cycle(&mut mmu).unwrap();
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x5A);
    }

    #[test]
    fn ei_takes_effect_after_the_following_instruction() {
        // EI; NOP; DI.
        let (mut cpu, mut mmu) = machine_with(&[0xFB, 0x00, 0xF3]);

        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.ime, Ime::EnableAfterCurrent);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.ime, Ime::Enabled);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.ime, Ime::Disabled);
    }

    #[test]
    fn interrupt_service_transfers_to_the_vector() {
        let (mut cpu, mut mmu) = machine_with(&[0x00]);
        cpu.ime = Ime::Enabled;
        mmu.interrupts.enabled = 0x1F;
        mmu.interrupts.request(InterruptKind::Timer);

        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 5);
        assert_eq!(cpu.pc, 0x0050);
        assert_eq!(cpu.ime, Ime::Disabled);
        // The return address was pushed and the request bit cleared.
        assert_eq!(mmu.read16(0xFFFC).unwrap(), 0x0100);
        assert_eq!(mmu.interrupts.flag & 0x04, 0);
    }

    #[test]
    fn interrupt_priority_prefers_lower_bits() {
        let (mut cpu, mut mmu) = machine_with(&[0x00]);
        cpu.ime = Ime::Enabled;
        mmu.interrupts.enabled = 0x1F;
        mmu.interrupts.request(InterruptKind::Serial);
        mmu.interrupts.request(InterruptKind::VBlank);

        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.pc, 0x0040);
        // The serial request is still pending for the next service.
        assert_eq!(mmu.interrupts.flag & 0x08, 0x08);
    }

    #[test]
    fn halt_idles_until_an_interrupt_pends() {
        let (mut cpu, mut mmu) = machine_with(&[0x76, 0x00]);
        cpu.cycle(&mut mmu).unwrap();
        assert!(cpu.halted);

        for _ in 0..3 {
            assert_eq!(cpu.cycle(&mut mmu).unwrap(), 1);
            assert_eq!(cpu.pc, 0x0101);
        }

        // A pending-and-enabled interrupt wakes the CPU even with IME off;
        // the request stays latched and the next instruction runs.
        mmu.interrupts.enabled = 0x04;
        mmu.interrupts.request(InterruptKind::Timer);
        cpu.cycle(&mut mmu).unwrap();
        assert!(!cpu.halted);
        assert_eq!(cpu.pc, 0x0102);
        assert_eq!(mmu.interrupts.flag & 0x04, 0x04);
    }

    #[test]
    fn halted_cpu_services_interrupts_when_ime_is_enabled() {
        let (mut cpu, mut mmu) = machine_with(&[0x76]);
        cpu.cycle(&mut mmu).unwrap();
        cpu.ime = Ime::Enabled;
        mmu.interrupts.enabled = 0x01;
        mmu.interrupts.request(InterruptKind::VBlank);

        cpu.cycle(&mut mmu).unwrap();
        assert!(!cpu.halted);
        assert_eq!(cpu.pc, 0x0040);
    }

    #[test]
    fn reti_enables_interrupts_immediately_after() {
        // RETI with a return address prepared on the stack.
        let (mut cpu, mut mmu) = machine_with(&[0xD9]);
        cpu.push(&mut mmu, 0x0200).unwrap();

        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.pc, 0x0200);
        assert_eq!(cpu.ime, Ime::Enabled);
    }

    #[test]
    fn stop_powers_off() {
        let (mut cpu, mut mmu) = machine_with(&[0x10, 0x00]);
        cpu.cycle(&mut mmu).unwrap();
        assert!(!cpu.power_on);
        assert_eq!(cpu.pc, 0x0102);
    }

    #[test]
    fn illegal_opcode_is_fatal() {
        let (mut cpu, mut mmu) = machine_with(&[0xD3]);
        match cpu.cycle(&mut mmu) {
            Err(Error::IllegalInstruction { opcode, pc }) => {
                assert_eq!(opcode, 0xD3);
                assert_eq!(pc, 0x0100);
            }
            other => panic!("expected IllegalInstruction, got {other:?}"),
        }
    }

    #[test]
    fn af_round_trips_masked_through_the_stack() {
        // PUSH AF; POP AF with a dirty F nibble is impossible to construct
        // through the register file, so PUSH/POP BC into AF instead.
        let (mut cpu, mut mmu) = machine_with(&[0xC5, 0xF1]);
        cpu.regs.write16(Register16::Bc, 0x12FF);
        cpu.cycle(&mut mmu).unwrap();
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read16(Register16::Af), 0x12F0);
    }

    #[test]
    fn accumulator_rotates_clear_zero() {
        // RLCA with A = 0x00 leaves Z clear even though the result is zero.
        let (mut cpu, mut mmu) = machine_with(&[0x07]);
        cpu.regs.write_flag(Flag::Z, true);
        cpu.cycle(&mut mmu).unwrap();
        assert!(!cpu.regs.read_flag(Flag::Z));

        // CB RLC with a zero result sets Z.
        let (mut cpu, mut mmu) = machine_with(&[0xCB, 0x00]);
        cpu.cycle(&mut mmu).unwrap();
        assert!(cpu.regs.read_flag(Flag::Z));
    }

    #[test]
    fn sbc_chains_the_borrow() {
        // SBC A,B with A=0x00, B=0xFF, C=1 -> 0x00 with carry and half set.
        let (mut cpu, mut mmu) = machine_with(&[0x98]);
        cpu.regs.write8(Register8::A, 0x00);
        cpu.regs.write8(Register8::B, 0xFF);
        cpu.regs.write_flag(Flag::C, true);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x00);
        assert!(cpu.regs.read_flag(Flag::Z));
        assert!(cpu.regs.read_flag(Flag::C));
        assert!(cpu.regs.read_flag(Flag::H));
    }

    #[test]
    fn adc_chains_the_carry() {
        // ADC A,B with A=0xFF, B=0x00, C=1 -> 0x00 with carry and half.
        let (mut cpu, mut mmu) = machine_with(&[0x88]);
        cpu.regs.write8(Register8::A, 0xFF);
        cpu.regs.write8(Register8::B, 0x00);
        cpu.regs.write_flag(Flag::C, true);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x00);
        assert!(cpu.regs.read_flag(Flag::Z));
        assert!(cpu.regs.read_flag(Flag::C));
        assert!(cpu.regs.read_flag(Flag::H));
    }

    #[test]
    fn inc_hl_ptr_touches_memory() {
        // INC (HL) with HL -> work RAM.
        let (mut cpu, mut mmu) = machine_with(&[0x34]);
        cpu.regs.write16(Register16::Hl, 0xC123);
        mmu.write8(0xC123, 0x0F).unwrap();
        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 3);
        assert_eq!(mmu.read8(0xC123).unwrap(), 0x10);
        assert!(cpu.regs.read_flag(Flag::H));
    }

    #[test]
    fn add16_keeps_zero_but_sets_carries() {
        // ADD HL,BC with HL=0x0FFF, BC=0x0001: half-carry out of bit 11.
        let (mut cpu, mut mmu) = machine_with(&[0x09]);
        cpu.regs.write16(Register16::Hl, 0x0FFF);
        cpu.regs.write16(Register16::Bc, 0x0001);
        cpu.regs.write_flag(Flag::Z, true);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read16(Register16::Hl), 0x1000);
        assert!(cpu.regs.read_flag(Flag::Z), "Z must be untouched");
        assert!(!cpu.regs.read_flag(Flag::N));
        assert!(cpu.regs.read_flag(Flag::H));
        assert!(!cpu.regs.read_flag(Flag::C));

        // 0x8000 + 0x8000 wraps with a full carry.
        let (mut cpu, mut mmu) = machine_with(&[0x09]);
        cpu.regs.write16(Register16::Hl, 0x8000);
        cpu.regs.write16(Register16::Bc, 0x8000);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read16(Register16::Hl), 0x0000);
        assert!(cpu.regs.read_flag(Flag::C));
        assert!(!cpu.regs.read_flag(Flag::H));
    }

    #[test]
    fn logic_ops_fix_their_flags() {
        // AND A,B: H always set, C cleared.
        let (mut cpu, mut mmu) = machine_with(&[0xA0]);
        cpu.regs.write8(Register8::A, 0xF0);
        cpu.regs.write8(Register8::B, 0x0F);
        cpu.regs.write_flag(Flag::C, true);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x00);
        assert!(cpu.regs.read_flag(Flag::Z));
        assert!(cpu.regs.read_flag(Flag::H));
        assert!(!cpu.regs.read_flag(Flag::C));

        // OR A,B clears N, H and C.
        let (mut cpu, mut mmu) = machine_with(&[0xB0]);
        cpu.regs.write8(Register8::A, 0x55);
        cpu.regs.write8(Register8::B, 0xAA);
        cpu.regs.write_flag(Flag::C, true);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0xFF);
        assert!(!cpu.regs.read_flag(Flag::Z));
        assert!(!cpu.regs.read_flag(Flag::H));
        assert!(!cpu.regs.read_flag(Flag::C));

        // XOR A,A always zeroes the accumulator.
        let (mut cpu, mut mmu) = machine_with(&[0xAF]);
        cpu.regs.write8(Register8::A, 0x42);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x00);
        assert!(cpu.regs.read_flag(Flag::Z));
    }

    #[test]
    fn cp_discards_the_result() {
        // CP A,0x90 with A = 0x90.
        let (mut cpu, mut mmu) = machine_with(&[0xFE, 0x90]);
        cpu.regs.write8(Register8::A, 0x90);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0x90);
        assert!(cpu.regs.read_flag(Flag::Z));
        assert!(cpu.regs.read_flag(Flag::N));
    }

    #[test]
    fn cb_shifts_and_swaps() {
        // SWAP B.
        let (mut cpu, mut mmu) = machine_with(&[0xCB, 0x30]);
        cpu.regs.write8(Register8::B, 0xAB);
        cpu.regs.write_flag(Flag::C, true);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::B), 0xBA);
        assert!(!cpu.regs.read_flag(Flag::C));

        // SRL B: logical shift right, bit 0 into carry.
        let (mut cpu, mut mmu) = machine_with(&[0xCB, 0x38]);
        cpu.regs.write8(Register8::B, 0x01);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::B), 0x00);
        assert!(cpu.regs.read_flag(Flag::Z));
        assert!(cpu.regs.read_flag(Flag::C));

        // SRA B: arithmetic shift keeps the sign bit.
        let (mut cpu, mut mmu) = machine_with(&[0xCB, 0x28]);
        cpu.regs.write8(Register8::B, 0x81);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::B), 0xC0);
        assert!(cpu.regs.read_flag(Flag::C));

        // SLA B shifts zero into bit 0.
        let (mut cpu, mut mmu) = machine_with(&[0xCB, 0x20]);
        cpu.regs.write8(Register8::B, 0xC0);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::B), 0x80);
        assert!(cpu.regs.read_flag(Flag::C));
    }

    #[test]
    fn res_and_set_through_hl() {
        // SET 3,(HL); RES 0,(HL).
        let (mut cpu, mut mmu) = machine_with(&[0xCB, 0xDE, 0xCB, 0x86]);
        cpu.regs.write16(Register16::Hl, 0xC050);
        mmu.write8(0xC050, 0x01).unwrap();

        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 4);
        assert_eq!(mmu.read8(0xC050).unwrap(), 0x09);

        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(mmu.read8(0xC050).unwrap(), 0x08);
    }

    #[test]
    fn jp_hl_is_a_single_cycle() {
        let (mut cpu, mut mmu) = machine_with(&[0xE9]);
        cpu.regs.write16(Register16::Hl, 0x0123);
        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 1);
        assert_eq!(cpu.pc, 0x0123);
    }

    #[test]
    fn conditional_ret_prices_both_paths() {
        // RET NZ with Z set is the short path.
        let (mut cpu, mut mmu) = machine_with(&[0xC0]);
        cpu.regs.write_flag(Flag::Z, true);
        assert_eq!(cpu.cycle(&mut mmu).unwrap(), 2);
        assert_eq!(cpu.pc, 0x0101);

        let (mut cpu, mut mmu) = machine_with(&[0xC0]);
        cpu.push(&mut mmu, 0x0200).unwrap();
        assert_eq!(cpu.cycle(&mut mmu).unwrap(), 5);
        assert_eq!(cpu.pc, 0x0200);
    }

    #[test]
    fn scf_and_ccf() {
        let (mut cpu, mut mmu) = machine_with(&[0x37, 0x3F, 0x3F]);
        cpu.regs.write_flag(Flag::N, true);
        cpu.regs.write_flag(Flag::H, true);

        cpu.cycle(&mut mmu).unwrap();
        assert!(cpu.regs.read_flag(Flag::C));
        assert!(!cpu.regs.read_flag(Flag::N));
        assert!(!cpu.regs.read_flag(Flag::H));

        cpu.cycle(&mut mmu).unwrap();
        assert!(!cpu.regs.read_flag(Flag::C));
        cpu.cycle(&mut mmu).unwrap();
        assert!(cpu.regs.read_flag(Flag::C));
    }

    #[test]
    fn cpl_inverts_and_marks() {
        let (mut cpu, mut mmu) = machine_with(&[0x2F]);
        cpu.regs.write8(Register8::A, 0x35);
        cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cpu.regs.read8(Register8::A), 0xCA);
        assert!(cpu.regs.read_flag(Flag::N));
        assert!(cpu.regs.read_flag(Flag::H));
    }

    #[test]
    fn store_sp_writes_little_endian() {
        // LD (0xC000),SP.
        let (mut cpu, mut mmu) = machine_with(&[0x08, 0x00, 0xC0]);
        cpu.regs.write16(Register16::Sp, 0xBEEF);
        let cycles = cpu.cycle(&mut mmu).unwrap();
        assert_eq!(cycles, 5);
        assert_eq!(mmu.read8(0xC000).unwrap(), 0xEF);
        assert_eq!(mmu.read8(0xC001).unwrap(), 0xBE);
    }
}
