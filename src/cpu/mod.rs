//! ARMv5TE CPU module
//!
//! Architectural state of the ARM core: the live register file, CPSR/SPSR,
//! the per-mode register banks and the CP15 state this guest relies on.

mod decode;
mod execute;
pub mod trap;
pub mod translate;

pub use decode::{classify, is_block_terminator, OpKind};
pub use execute::Flow;

use serde::{Serialize, Deserialize};

/// Hypercall instruction (ARM state, unconditional space)
pub const HYPERCALL_ARM: u32 = 0xF7BB_BBBB;

// CPSR bits
pub const CPSR_N: u32 = 1 << 31;
pub const CPSR_Z: u32 = 1 << 30;
pub const CPSR_C: u32 = 1 << 29;
pub const CPSR_V: u32 = 1 << 28;
pub const CPSR_I: u32 = 1 << 7;
pub const CPSR_F: u32 = 1 << 6;
pub const CPSR_T: u32 = 1 << 5;
pub const CPSR_MODE_MASK: u32 = 0x1F;

// Bank order, also the save-state order
pub const BANK_USR: usize = 0;
pub const BANK_SVC: usize = 1;
pub const BANK_ABT: usize = 2;
pub const BANK_UND: usize = 3;
pub const BANK_IRQ: usize = 4;
pub const BANK_FIQ: usize = 5;
pub const NUM_BANKS: usize = 6;

// extra_regs layout (CP15 registers)
pub const CP15_CONTROL: usize = 0;
pub const CP15_TTB: usize = 1;
pub const CP15_DACR: usize = 2;
pub const CP15_FSR: usize = 3;
pub const CP15_FAR: usize = 4;
pub const NUM_EXTRA_REGS: usize = 5;

/// Control register V bit: exception vectors at 0xFFFF0000
pub const CP15_CONTROL_V: u32 = 1 << 13;
pub const HIGH_VECTORS: u32 = 0xFFFF_0000;

/// Processor modes
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1B,
    System = 0x1F,
}

impl Mode {
    /// Decode the mode field of a status register
    pub fn from_bits(bits: u32) -> Option<Mode> {
        match bits & CPSR_MODE_MASK {
            0x10 => Some(Mode::User),
            0x11 => Some(Mode::Fiq),
            0x12 => Some(Mode::Irq),
            0x13 => Some(Mode::Supervisor),
            0x17 => Some(Mode::Abort),
            0x1B => Some(Mode::Undefined),
            0x1F => Some(Mode::System),
            _ => None,
        }
    }

    /// Register bank holding R13/R14/SPSR for this mode
    pub fn bank(self) -> usize {
        match self {
            Mode::User | Mode::System => BANK_USR,
            Mode::Fiq => BANK_FIQ,
            Mode::Irq => BANK_IRQ,
            Mode::Supervisor => BANK_SVC,
            Mode::Abort => BANK_ABT,
            Mode::Undefined => BANK_UND,
        }
    }

    pub fn is_privileged(self) -> bool {
        self != Mode::User
    }
}

/// Registers private to one mode
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankedRegs {
    pub r13: u32,
    pub r14: u32,
    pub spsr: u32,
}

/// ARM CPU state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    /// Live register file (R13/R14 belong to the current mode's bank)
    pub regs: [u32; 16],
    /// Current program status register
    pub cpsr: u32,
    /// Live saved program status register
    pub spsr: u32,
    /// Stored banks, indexed by `BANK_*`
    pub banks: [BankedRegs; NUM_BANKS],
    /// CP15 registers, indexed by `CP15_*`
    pub extra_regs: [u32; NUM_EXTRA_REGS],
    /// Pending IRQ lines
    pub waiting_irqs: u16,
    /// Pending FIQ lines
    pub waiting_fiqs: u16,
    /// Coprocessor access register
    pub cpar: u16,
    /// Exception vector base
    pub vector_base: u32,
}

/// Power-on CPSR: supervisor mode, IRQ and FIQ masked
const RESET_CPSR: u32 = CPSR_I | CPSR_F | Mode::Supervisor as u32;

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            regs: [0u32; 16],
            cpsr: RESET_CPSR,
            spsr: 0,
            banks: [BankedRegs::default(); NUM_BANKS],
            extra_regs: [0u32; NUM_EXTRA_REGS],
            waiting_irqs: 0,
            waiting_fiqs: 0,
            cpar: 0,
            vector_base: 0,
        }
    }

    /// Reset CPU state (PC is set by the host afterwards)
    pub fn reset(&mut self) {
        *self = Cpu::new();
    }

    /// Current processor mode (unknown mode bits behave like user mode)
    #[inline(always)]
    pub fn mode(&self) -> Mode {
        Mode::from_bits(self.cpsr).unwrap_or(Mode::User)
    }

    #[inline(always)]
    pub fn is_privileged(&self) -> bool {
        self.mode().is_privileged()
    }

    /// Read register from the current bank view
    #[inline(always)]
    pub fn get_reg(&self, reg: u8) -> u32 {
        self.regs[(reg & 0xF) as usize]
    }

    /// Write register in the current bank view
    #[inline(always)]
    pub fn set_reg(&mut self, reg: u8, value: u32) {
        self.regs[(reg & 0xF) as usize] = value;
    }

    /// Program counter
    #[inline(always)]
    pub fn pc(&self) -> u32 {
        self.regs[15]
    }

    /// Write CPSR, swapping register banks when the mode changes
    pub fn set_cpsr(&mut self, value: u32) {
        let old_bank = self.mode().bank();
        let new_bank = Mode::from_bits(value).unwrap_or(Mode::User).bank();

        if old_bank != new_bank {
            self.banks[old_bank] = BankedRegs {
                r13: self.regs[13],
                r14: self.regs[14],
                spsr: self.spsr,
            };
            let incoming = self.banks[new_bank];
            self.regs[13] = incoming.r13;
            self.regs[14] = incoming.r14;
            self.spsr = incoming.spsr;
        }

        self.cpsr = value;
    }

    /// Switch processor mode, keeping the other CPSR bits
    pub fn switch_mode(&mut self, mode: Mode) {
        self.set_cpsr((self.cpsr & !CPSR_MODE_MASK) | mode as u32);
    }

    /// Read a user-mode register regardless of the current mode
    pub fn user_reg(&self, reg: usize) -> u32 {
        if (13..=14).contains(&reg) && self.mode().bank() != BANK_USR {
            let bank = &self.banks[BANK_USR];
            if reg == 13 { bank.r13 } else { bank.r14 }
        } else {
            self.regs[reg & 0xF]
        }
    }

    /// Write a user-mode register regardless of the current mode
    pub fn set_user_reg(&mut self, reg: usize, value: u32) {
        if (13..=14).contains(&reg) && self.mode().bank() != BANK_USR {
            let bank = &mut self.banks[BANK_USR];
            if reg == 13 {
                bank.r13 = value;
            } else {
                bank.r14 = value;
            }
        } else {
            self.regs[reg & 0xF] = value;
        }
    }

    /// Record a failed memory access in the CP15 fault registers
    pub fn latch_fault(&mut self, addr: u32, status: u8) {
        self.extra_regs[CP15_FSR] = status as u32;
        self.extra_regs[CP15_FAR] = addr;
    }

    /// Write the CP15 control register (moves the vector base)
    pub fn set_control(&mut self, value: u32) {
        self.extra_regs[CP15_CONTROL] = value;
        self.vector_base = if value & CP15_CONTROL_V != 0 { HIGH_VECTORS } else { 0 };
    }

    #[inline(always)]
    pub fn flag(&self, bit: u32) -> bool {
        self.cpsr & bit != 0
    }

    #[inline(always)]
    pub fn set_nz(&mut self, value: u32) {
        let mut cpsr = self.cpsr & !(CPSR_N | CPSR_Z);
        if value & 0x8000_0000 != 0 {
            cpsr |= CPSR_N;
        }
        if value == 0 {
            cpsr |= CPSR_Z;
        }
        self.cpsr = cpsr;
    }

    #[inline(always)]
    pub fn set_cv(&mut self, carry: bool, overflow: bool) {
        let mut cpsr = self.cpsr & !(CPSR_C | CPSR_V);
        if carry {
            cpsr |= CPSR_C;
        }
        if overflow {
            cpsr |= CPSR_V;
        }
        self.cpsr = cpsr;
    }

    /// Evaluate an instruction condition field against the flags
    pub fn condition_passed(&self, cond: u32) -> bool {
        let n = self.flag(CPSR_N);
        let z = self.flag(CPSR_Z);
        let c = self.flag(CPSR_C);
        let v = self.flag(CPSR_V);
        match cond & 0xF {
            0x0 => z,
            0x1 => !z,
            0x2 => c,
            0x3 => !c,
            0x4 => n,
            0x5 => !n,
            0x6 => v,
            0x7 => !v,
            0x8 => c && !z,
            0x9 => !c || z,
            0xA => n == v,
            0xB => n != v,
            0xC => !z && n == v,
            0xD => z || n != v,
            0xE => true,
            // 0xF is the unconditional space, decoded separately
            _ => true,
        }
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

    #[test]
    fn test_cpu_creation() {
        let cpu = Cpu::new();
        assert_eq!(cpu.pc(), 0);
        assert_eq!(cpu.mode(), Mode::Supervisor);
        assert!(cpu.flag(CPSR_I) && cpu.flag(CPSR_F));
    }

    #[test]
    fn test_bank_isolation() {
        let mut cpu = Cpu::new();
        cpu.set_reg(13, 0x1000);
        cpu.set_reg(14, 0x2000);
        cpu.spsr = 0x6000_0010;

        cpu.switch_mode(Mode::User);
        cpu.set_reg(13, 0x3000);
        cpu.set_reg(14, 0x4000);

        cpu.switch_mode(Mode::Supervisor);
        assert_eq!(cpu.get_reg(13), 0x1000);
        assert_eq!(cpu.get_reg(14), 0x2000);
        assert_eq!(cpu.spsr, 0x6000_0010);

        cpu.switch_mode(Mode::System);
        assert_eq!(cpu.get_reg(13), 0x3000);
        assert_eq!(cpu.get_reg(14), 0x4000);
    }

    #[test]
    fn test_unbanked_registers_shared() {
        let mut cpu = Cpu::new();
        cpu.set_reg(0, 7);
        cpu.set_reg(12, 9);
        cpu.switch_mode(Mode::Irq);
        assert_eq!(cpu.get_reg(0), 7);
        assert_eq!(cpu.get_reg(12), 9);
    }

    #[test]
    fn test_user_reg_access_from_privileged_mode() {
        let mut cpu = Cpu::new();
        cpu.set_user_reg(13, 0xAAAA);
        assert_eq!(cpu.user_reg(13), 0xAAAA);
        assert_ne!(cpu.get_reg(13), 0xAAAA);
        cpu.switch_mode(Mode::User);
        assert_eq!(cpu.get_reg(13), 0xAAAA);
    }

    #[test]
    fn test_condition_codes() {
        let mut cpu = Cpu::new();
        cpu.set_nz(0);
        assert!(cpu.condition_passed(0x0));
        assert!(!cpu.condition_passed(0x1));
        cpu.set_nz(0x8000_0000);
        cpu.set_cv(false, false);
        assert!(cpu.condition_passed(0xB)); // LT
        assert!(!cpu.condition_passed(0xA)); // GE
        assert!(cpu.condition_passed(0xE));
    }

    #[test]
    fn test_latch_fault() {
        let mut cpu = Cpu::new();
        cpu.latch_fault(0x2000_0003, 1);
        assert_eq!(cpu.extra_regs[CP15_FSR], 1);
        assert_eq!(cpu.extra_regs[CP15_FAR], 0x2000_0003);
    }

    #[test]
    fn test_high_vectors() {
        let mut cpu = Cpu::new();
        cpu.set_control(CP15_CONTROL_V);
        assert_eq!(cpu.vector_base, HIGH_VECTORS);
        cpu.set_control(0);
        assert_eq!(cpu.vector_base, 0);
    }
}
