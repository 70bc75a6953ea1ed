//! Instruction decoder
//!
//! Classifies ARM-state instruction words into the handler classes the
//! executor dispatches on. The class is computed once at translation time and
//! stored next to the raw word in the instruction buffer.

use super::HYPERCALL_ARM;

/// Handler class of an ARM instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    DataProc = 0,
    Multiply = 1,
    MultiplyLong = 2,
    Swap = 3,
    Mrs = 4,
    Msr = 5,
    Bx = 6,
    BlxReg = 7,
    Clz = 8,
    HalfwordTransfer = 9,
    SingleTransfer = 10,
    BlockTransfer = 11,
    Branch = 12,
    CoprocReg = 13,
    Swi = 14,
    Hypercall = 15,
    /// BLX <imm>, always switches to Thumb
    BlxImm = 16,
    /// PLD and other hints
    Nop = 17,
    Undefined = 18,
    /// LDRD/STRD
    DoubleTransfer = 19,
}

impl OpKind {
    /// Recover a class from its stored byte
    pub fn from_u8(value: u8) -> OpKind {
        match value {
            0 => OpKind::DataProc,
            1 => OpKind::Multiply,
            2 => OpKind::MultiplyLong,
            3 => OpKind::Swap,
            4 => OpKind::Mrs,
            5 => OpKind::Msr,
            6 => OpKind::Bx,
            7 => OpKind::BlxReg,
            8 => OpKind::Clz,
            9 => OpKind::HalfwordTransfer,
            10 => OpKind::SingleTransfer,
            11 => OpKind::BlockTransfer,
            12 => OpKind::Branch,
            13 => OpKind::CoprocReg,
            14 => OpKind::Swi,
            15 => OpKind::Hypercall,
            16 => OpKind::BlxImm,
            17 => OpKind::Nop,
            19 => OpKind::DoubleTransfer,
            _ => OpKind::Undefined,
        }
    }
}

/// Classify a 32-bit ARM instruction
pub fn classify(inst: u32) -> OpKind {
    if inst >> 28 == 0xF {
        return classify_unconditional(inst);
    }

    match (inst >> 25) & 0x7 {
        0b000 => {
            if inst & 0x0FFF_FFF0 == 0x012F_FF10 {
                OpKind::Bx
            } else if inst & 0x0FFF_FFF0 == 0x012F_FF30 {
                OpKind::BlxReg
            } else if inst & 0x0FFF_0FF0 == 0x016F_0F10 {
                OpKind::Clz
            } else if inst & 0x0FC0_00F0 == 0x0000_0090 {
                OpKind::Multiply
            } else if inst & 0x0F80_00F0 == 0x0080_0090 {
                OpKind::MultiplyLong
            } else if inst & 0x0FB0_0FF0 == 0x0100_0090 {
                OpKind::Swap
            } else if inst & 0x0E00_0090 == 0x0000_0090 {
                let load = inst & (1 << 20) != 0;
                let rd = (inst >> 12) & 0xF;
                match (load, (inst >> 5) & 0x3) {
                    (_, 0) => OpKind::Undefined,
                    // LDRD/STRD with L=0; Rd must be even and not R14
                    (false, 0b10 | 0b11) if rd & 1 == 0 && rd != 14 => OpKind::DoubleTransfer,
                    (false, 0b10 | 0b11) => OpKind::Undefined,
                    _ => OpKind::HalfwordTransfer,
                }
            } else if inst & 0x0FBF_0FFF == 0x010F_0000 {
                OpKind::Mrs
            } else if inst & 0x0FB0_FFF0 == 0x0120_F000 {
                OpKind::Msr
            } else if inst & 0x0190_0000 == 0x0100_0000 {
                // Compare opcodes without S: DSP extensions and friends
                OpKind::Undefined
            } else {
                OpKind::DataProc
            }
        }
        0b001 => {
            if inst & 0x0FB0_F000 == 0x0320_F000 {
                OpKind::Msr
            } else if inst & 0x0190_0000 == 0x0100_0000 {
                OpKind::Undefined
            } else {
                OpKind::DataProc
            }
        }
        0b010 => OpKind::SingleTransfer,
        0b011 => {
            if inst & (1 << 4) != 0 {
                OpKind::Undefined
            } else {
                OpKind::SingleTransfer
            }
        }
        0b100 => OpKind::BlockTransfer,
        0b101 => OpKind::Branch,
        0b110 => OpKind::Undefined,
        _ => {
            if inst & (1 << 24) != 0 {
                OpKind::Swi
            } else if inst & (1 << 4) != 0 {
                OpKind::CoprocReg
            } else {
                OpKind::Undefined
            }
        }
    }
}

fn classify_unconditional(inst: u32) -> OpKind {
    if inst == HYPERCALL_ARM {
        OpKind::Hypercall
    } else if inst & 0x0E00_0000 == 0x0A00_0000 {
        OpKind::BlxImm
    } else if inst & 0x0D70_F000 == 0x0550_F000 {
        OpKind::Nop
    } else {
        OpKind::Undefined
    }
}

/// Check if an instruction ends a translated block
///
/// Anything that may write the PC or hand control to the host does.
pub fn is_block_terminator(kind: OpKind, inst: u32) -> bool {
    let rd = (inst >> 12) & 0xF;
    let load = inst & (1 << 20) != 0;
    match kind {
        OpKind::Branch
        | OpKind::Bx
        | OpKind::BlxReg
        | OpKind::BlxImm
        | OpKind::Swi
        | OpKind::Hypercall
        | OpKind::Undefined
        | OpKind::Msr
        | OpKind::CoprocReg => true,
        OpKind::DataProc => rd == 15,
        OpKind::SingleTransfer | OpKind::HalfwordTransfer => load && rd == 15,
        OpKind::BlockTransfer => load && inst & (1 << 15) != 0,
        _ => false,
    }
}
