//! Decoded instruction descriptor tables.
//!
//! The interpreter is table-driven: one descriptor per opcode in the
//! unprefixed table plus one per opcode in the parallel 0xCB-prefixed table.
//! A descriptor names the operation, the instruction length (opcode plus
//! immediates), the machine-cycle costs for the taken and not-taken paths of
//! conditional instructions, and an ordered operand list.
//!
//! The descriptors are normalized relative to the public opcode references:
//! implicit accumulator operands are spelled out, jump/call operands are
//! ordered destination-then-condition, `LD`/`INC`/`DEC`/`ADD` are split into
//! 8- and 16-bit variants by the width of their final operand, `LDH` folds
//! into `LD8`, `LD HL,SP+r8` and `ADD SP,r8` get their own mnemonics, and
//! cycle counts are machine cycles rather than T-states.

use once_cell::sync::Lazy;

use crate::registers::{Flag, Register16, Register8};

/// The operation performed by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Nop,
    Ld8,
    Ld16,
    LdSp,
    Inc8,
    Inc16,
    Dec8,
    Dec16,
    Add8,
    Add16,
    AddSp,
    Adc,
    Sub,
    Sbc,
    Cp,
    And,
    Or,
    Xor,
    Daa,
    Cpl,
    Scf,
    Ccf,
    Jp,
    Jr,
    Call,
    Ret,
    Reti,
    Rst,
    Push,
    Pop,
    Rlca,
    Rla,
    Rrca,
    Rra,
    Rlc,
    Rl,
    Rrc,
    Rr,
    Sla,
    Sra,
    Srl,
    Swap,
    Bit,
    Res,
    Set,
    Di,
    Ei,
    Halt,
    Stop,
    Prefix,
    Illegal,
}

impl Mnemonic {
    /// The documented flag effect, one character per flag in ZNHC order:
    /// `-` untouched, `0`/`1` forced, the flag's own letter computed. The
    /// actual effects live in the mnemonic handlers; this is a decoding aid.
    pub fn flag_policy(self) -> &'static str {
        use Mnemonic::*;
        match self {
            Inc8 => "Z0H-",
            Dec8 => "Z1H-",
            Add8 | Adc => "Z0HC",
            Sub | Sbc | Cp => "Z1HC",
            Add16 => "-0HC",
            AddSp | LdSp => "00HC",
            Daa => "Z-0C",
            Cpl => "-11-",
            And => "Z010",
            Or | Xor | Swap => "Z000",
            Pop => "ZNHC",
            Rlca | Rla | Rrca | Rra => "000C",
            Rlc | Rl | Rrc | Rr | Sla | Sra | Srl => "Z00C",
            Bit => "Z01-",
            Scf => "-001",
            Ccf => "-00C",
            _ => "----",
        }
    }
}

/// Whether a 16-bit register operand is adjusted after the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostModify {
    None,
    Increment,
    Decrement,
}

/// An operand descriptor.
///
/// Pointer kinds dereference through memory; `R8` is a signed immediate;
/// `A8`-family operands address the high page at 0xFF00.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// 8-bit immediate.
    D8,
    /// 16-bit immediate.
    D16,
    /// 8-bit immediate used as a high-page address value.
    A8,
    /// Memory at `0xFF00 + d8`.
    A8Ptr,
    /// 16-bit immediate address value.
    A16,
    /// Memory at the 16-bit immediate address.
    A16Ptr,
    /// Signed 8-bit immediate.
    R8,
    /// An 8-bit register.
    Reg8(Register8),
    /// Memory at `0xFF00 + register`.
    Reg8Ptr(Register8),
    /// A 16-bit register pair.
    Reg16(Register16),
    /// Memory at the address in a register pair, optionally adjusting the
    /// pair after the instruction.
    Reg16Ptr(Register16, PostModify),
    /// A branch condition: a CPU flag, optionally negated.
    Condition(Flag, bool),
    /// A small embedded constant (RST targets and CB bit numbers).
    Const8(u8),
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    /// Total length in bytes, immediates included.
    pub size: u16,
    /// Machine cycles when the action is taken.
    pub cycles_taken: u8,
    /// Machine cycles when a conditional action is skipped; equal to
    /// `cycles_taken` for unconditional instructions.
    pub cycles_skipped: u8,
    pub operands: Vec<Operand>,
}

/// The unprefixed opcode table.
pub static INSTRUCTIONS: Lazy<Vec<Instruction>> =
    Lazy::new(|| (0..=255u16).map(|op| decode_unprefixed(op as u8)).collect());

/// The 0xCB-prefixed opcode table.
pub static CB_INSTRUCTIONS: Lazy<Vec<Instruction>> =
    Lazy::new(|| (0..=255u16).map(|op| decode_cb(op as u8)).collect());

fn op(mnemonic: Mnemonic, size: u16, cycles: u8, operands: Vec<Operand>) -> Instruction {
    Instruction {
        mnemonic,
        size,
        cycles_taken: cycles,
        cycles_skipped: cycles,
        operands,
    }
}

fn cond_op(
    mnemonic: Mnemonic,
    size: u16,
    cycles_taken: u8,
    cycles_skipped: u8,
    operands: Vec<Operand>,
) -> Instruction {
    Instruction {
        mnemonic,
        size,
        cycles_taken,
        cycles_skipped,
        operands,
    }
}

/// A branch condition on `flag`.
fn cc(flag: Flag) -> Operand {
    Operand::Condition(flag, false)
}

/// A branch condition on the negation of `flag`.
fn ncc(flag: Flag) -> Operand {
    Operand::Condition(flag, true)
}

/// The register operand encoded in the low three bits of most ALU and CB
/// opcodes; slot 6 is the memory cell addressed by HL.
fn r8_operand(bits: u8) -> Operand {
    use Register8::*;
    match bits & 0x07 {
        0 => Operand::Reg8(B),
        1 => Operand::Reg8(C),
        2 => Operand::Reg8(D),
        3 => Operand::Reg8(E),
        4 => Operand::Reg8(H),
        5 => Operand::Reg8(L),
        6 => Operand::Reg16Ptr(Register16::Hl, PostModify::None),
        _ => Operand::Reg8(A),
    }
}

/// Extra machine cycle charged for going through (HL).
fn ptr_cost(operand: Operand) -> u8 {
    matches!(operand, Operand::Reg16Ptr(..)) as u8
}

fn decode_unprefixed(opcode: u8) -> Instruction {
    use Mnemonic::*;
    use Operand::{A16, A16Ptr, A8Ptr, Const8, Reg16, Reg16Ptr, Reg8, Reg8Ptr, D16, D8, R8};
    use PostModify::{Decrement, Increment};
    use Register16::{Af, Bc, De, Hl, Sp};
    use Register8::{A, B, C, D, E, H, L};

    match opcode {
        0x00 => op(Nop, 1, 1, vec![]),
        0x01 => op(Ld16, 3, 3, vec![Reg16(Bc), D16]),
        0x02 => op(Ld8, 1, 2, vec![Reg16Ptr(Bc, PostModify::None), Reg8(A)]),
        0x03 => op(Inc16, 1, 2, vec![Reg16(Bc)]),
        0x04 => op(Inc8, 1, 1, vec![Reg8(B)]),
        0x05 => op(Dec8, 1, 1, vec![Reg8(B)]),
        0x06 => op(Ld8, 2, 2, vec![Reg8(B), D8]),
        0x07 => op(Rlca, 1, 1, vec![Reg8(A)]),
        0x08 => op(Ld16, 3, 5, vec![A16Ptr, Reg16(Sp)]),
        0x09 => op(Add16, 1, 2, vec![Reg16(Hl), Reg16(Bc)]),
        0x0A => op(Ld8, 1, 2, vec![Reg8(A), Reg16Ptr(Bc, PostModify::None)]),
        0x0B => op(Dec16, 1, 2, vec![Reg16(Bc)]),
        0x0C => op(Inc8, 1, 1, vec![Reg8(C)]),
        0x0D => op(Dec8, 1, 1, vec![Reg8(C)]),
        0x0E => op(Ld8, 2, 2, vec![Reg8(C), D8]),
        0x0F => op(Rrca, 1, 1, vec![Reg8(A)]),

        0x10 => op(Stop, 2, 1, vec![]),
        0x11 => op(Ld16, 3, 3, vec![Reg16(De), D16]),
        0x12 => op(Ld8, 1, 2, vec![Reg16Ptr(De, PostModify::None), Reg8(A)]),
        0x13 => op(Inc16, 1, 2, vec![Reg16(De)]),
        0x14 => op(Inc8, 1, 1, vec![Reg8(D)]),
        0x15 => op(Dec8, 1, 1, vec![Reg8(D)]),
        0x16 => op(Ld8, 2, 2, vec![Reg8(D), D8]),
        0x17 => op(Rla, 1, 1, vec![Reg8(A)]),
        0x18 => op(Jr, 2, 3, vec![R8]),
        0x19 => op(Add16, 1, 2, vec![Reg16(Hl), Reg16(De)]),
        0x1A => op(Ld8, 1, 2, vec![Reg8(A), Reg16Ptr(De, PostModify::None)]),
        0x1B => op(Dec16, 1, 2, vec![Reg16(De)]),
        0x1C => op(Inc8, 1, 1, vec![Reg8(E)]),
        0x1D => op(Dec8, 1, 1, vec![Reg8(E)]),
        0x1E => op(Ld8, 2, 2, vec![Reg8(E), D8]),
        0x1F => op(Rra, 1, 1, vec![Reg8(A)]),

        0x20 => cond_op(Jr, 2, 3, 2, vec![R8, ncc(Flag::Z)]),
        0x21 => op(Ld16, 3, 3, vec![Reg16(Hl), D16]),
        0x22 => op(Ld8, 1, 2, vec![Reg16Ptr(Hl, Increment), Reg8(A)]),
        0x23 => op(Inc16, 1, 2, vec![Reg16(Hl)]),
        0x24 => op(Inc8, 1, 1, vec![Reg8(H)]),
        0x25 => op(Dec8, 1, 1, vec![Reg8(H)]),
        0x26 => op(Ld8, 2, 2, vec![Reg8(H), D8]),
        0x27 => op(Daa, 1, 1, vec![Reg8(A)]),
        0x28 => cond_op(Jr, 2, 3, 2, vec![R8, cc(Flag::Z)]),
        0x29 => op(Add16, 1, 2, vec![Reg16(Hl), Reg16(Hl)]),
        0x2A => op(Ld8, 1, 2, vec![Reg8(A), Reg16Ptr(Hl, Increment)]),
        0x2B => op(Dec16, 1, 2, vec![Reg16(Hl)]),
        0x2C => op(Inc8, 1, 1, vec![Reg8(L)]),
        0x2D => op(Dec8, 1, 1, vec![Reg8(L)]),
        0x2E => op(Ld8, 2, 2, vec![Reg8(L), D8]),
        0x2F => op(Cpl, 1, 1, vec![Reg8(A)]),

        0x30 => cond_op(Jr, 2, 3, 2, vec![R8, ncc(Flag::C)]),
        0x31 => op(Ld16, 3, 3, vec![Reg16(Sp), D16]),
        0x32 => op(Ld8, 1, 2, vec![Reg16Ptr(Hl, Decrement), Reg8(A)]),
        0x33 => op(Inc16, 1, 2, vec![Reg16(Sp)]),
        0x34 => op(Inc8, 1, 3, vec![Reg16Ptr(Hl, PostModify::None)]),
        0x35 => op(Dec8, 1, 3, vec![Reg16Ptr(Hl, PostModify::None)]),
        0x36 => op(Ld8, 2, 3, vec![Reg16Ptr(Hl, PostModify::None), D8]),
        0x37 => op(Scf, 1, 1, vec![]),
        0x38 => cond_op(Jr, 2, 3, 2, vec![R8, cc(Flag::C)]),
        0x39 => op(Add16, 1, 2, vec![Reg16(Hl), Reg16(Sp)]),
        0x3A => op(Ld8, 1, 2, vec![Reg8(A), Reg16Ptr(Hl, Decrement)]),
        0x3B => op(Dec16, 1, 2, vec![Reg16(Sp)]),
        0x3C => op(Inc8, 1, 1, vec![Reg8(A)]),
        0x3D => op(Dec8, 1, 1, vec![Reg8(A)]),
        0x3E => op(Ld8, 2, 2, vec![Reg8(A), D8]),
        0x3F => op(Ccf, 1, 1, vec![]),

        0x76 => op(Halt, 1, 1, vec![]),
        0x40..=0x7F => {
            let dst = r8_operand(opcode >> 3);
            let src = r8_operand(opcode);
            let cycles = 1 + ptr_cost(dst) + ptr_cost(src);
            op(Ld8, 1, cycles, vec![dst, src])
        }

        0x80..=0xBF => {
            let mnemonic = match (opcode >> 3) & 0x07 {
                0 => Add8,
                1 => Adc,
                2 => Sub,
                3 => Sbc,
                4 => And,
                5 => Xor,
                6 => Or,
                _ => Cp,
            };
            let src = r8_operand(opcode);
            op(mnemonic, 1, 1 + ptr_cost(src), vec![Reg8(A), src])
        }

        0xC0 => cond_op(Ret, 1, 5, 2, vec![ncc(Flag::Z)]),
        0xC1 => op(Pop, 1, 3, vec![Reg16(Bc)]),
        0xC2 => cond_op(Jp, 3, 4, 3, vec![A16, ncc(Flag::Z)]),
        0xC3 => op(Jp, 3, 4, vec![A16]),
        0xC4 => cond_op(Call, 3, 6, 3, vec![A16, ncc(Flag::Z)]),
        0xC5 => op(Push, 1, 4, vec![Reg16(Bc)]),
        0xC6 => op(Add8, 2, 2, vec![Reg8(A), D8]),
        0xC7 => op(Rst, 1, 4, vec![Const8(0x00)]),
        0xC8 => cond_op(Ret, 1, 5, 2, vec![cc(Flag::Z)]),
        0xC9 => op(Ret, 1, 4, vec![]),
        0xCA => cond_op(Jp, 3, 4, 3, vec![A16, cc(Flag::Z)]),
        0xCB => op(Prefix, 1, 1, vec![]),
        0xCC => cond_op(Call, 3, 6, 3, vec![A16, cc(Flag::Z)]),
        0xCD => op(Call, 3, 6, vec![A16]),
        0xCE => op(Adc, 2, 2, vec![Reg8(A), D8]),
        0xCF => op(Rst, 1, 4, vec![Const8(0x08)]),

        0xD0 => cond_op(Ret, 1, 5, 2, vec![ncc(Flag::C)]),
        0xD1 => op(Pop, 1, 3, vec![Reg16(De)]),
        0xD2 => cond_op(Jp, 3, 4, 3, vec![A16, ncc(Flag::C)]),
        0xD4 => cond_op(Call, 3, 6, 3, vec![A16, ncc(Flag::C)]),
        0xD5 => op(Push, 1, 4, vec![Reg16(De)]),
        0xD6 => op(Sub, 2, 2, vec![Reg8(A), D8]),
        0xD7 => op(Rst, 1, 4, vec![Const8(0x10)]),
        0xD8 => cond_op(Ret, 1, 5, 2, vec![cc(Flag::C)]),
        0xD9 => op(Reti, 1, 4, vec![]),
        0xDA => cond_op(Jp, 3, 4, 3, vec![A16, cc(Flag::C)]),
        0xDC => cond_op(Call, 3, 6, 3, vec![A16, cc(Flag::C)]),
        0xDE => op(Sbc, 2, 2, vec![Reg8(A), D8]),
        0xDF => op(Rst, 1, 4, vec![Const8(0x18)]),

        0xE0 => op(Ld8, 2, 3, vec![A8Ptr, Reg8(A)]),
        0xE1 => op(Pop, 1, 3, vec![Reg16(Hl)]),
        0xE2 => op(Ld8, 1, 2, vec![Reg8Ptr(C), Reg8(A)]),
        0xE5 => op(Push, 1, 4, vec![Reg16(Hl)]),
        0xE6 => op(And, 2, 2, vec![Reg8(A), D8]),
        0xE7 => op(Rst, 1, 4, vec![Const8(0x20)]),
        0xE8 => op(AddSp, 2, 4, vec![Reg16(Sp), R8]),
        0xE9 => op(Jp, 1, 1, vec![Reg16(Hl)]),
        0xEA => op(Ld8, 3, 4, vec![A16Ptr, Reg8(A)]),
        0xEE => op(Xor, 2, 2, vec![Reg8(A), D8]),
        0xEF => op(Rst, 1, 4, vec![Const8(0x28)]),

        0xF0 => op(Ld8, 2, 3, vec![Reg8(A), A8Ptr]),
        0xF1 => op(Pop, 1, 3, vec![Reg16(Af)]),
        0xF2 => op(Ld8, 1, 2, vec![Reg8(A), Reg8Ptr(C)]),
        0xF3 => op(Di, 1, 1, vec![]),
        0xF5 => op(Push, 1, 4, vec![Reg16(Af)]),
        0xF6 => op(Or, 2, 2, vec![Reg8(A), D8]),
        0xF7 => op(Rst, 1, 4, vec![Const8(0x30)]),
        0xF8 => op(LdSp, 2, 3, vec![Reg16(Hl), Reg16(Sp), R8]),
        0xF9 => op(Ld16, 1, 2, vec![Reg16(Sp), Reg16(Hl)]),
        0xFA => op(Ld8, 3, 4, vec![Reg8(A), A16Ptr]),
        0xFB => op(Ei, 1, 1, vec![]),
        0xFE => op(Cp, 2, 2, vec![Reg8(A), D8]),
        0xFF => op(Rst, 1, 4, vec![Const8(0x38)]),

        0xD3 | 0xDB | 0xDD | 0xE3 | 0xE4 | 0xEB | 0xEC | 0xED | 0xF4 | 0xFC | 0xFD => {
            op(Illegal, 1, 1, vec![])
        }
    }
}

fn decode_cb(opcode: u8) -> Instruction {
    use Mnemonic::*;

    let target = r8_operand(opcode);
    let through_hl = ptr_cost(target) != 0;
    let cycles = if through_hl { 4 } else { 2 };
    let bit = Operand::Const8((opcode >> 3) & 0x07);

    match opcode {
        0x00..=0x3F => {
            let mnemonic = match opcode >> 3 {
                0 => Rlc,
                1 => Rrc,
                2 => Rl,
                3 => Rr,
                4 => Sla,
                5 => Sra,
                6 => Swap,
                _ => Srl,
            };
            op(mnemonic, 2, cycles, vec![target])
        }
        // BIT only reads its target, so (HL) costs one cycle less.
        0x40..=0x7F => op(Bit, 2, if through_hl { 3 } else { 2 }, vec![bit, target]),
        0x80..=0xBF => op(Res, 2, cycles, vec![bit, target]),
        0xC0..=0xFF => op(Set, 2, cycles, vec![bit, target]),
    }
}
