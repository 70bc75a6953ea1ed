//! Exception entry
//!
//! Only synchronous exceptions raised by instructions are taken here.
//! Pending interrupt lines are recorded in the CPU state but never delivered
//! by this core.

use super::{Cpu, Mode, CPSR_I, CPSR_T};

/// Synchronous exceptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    UndefinedInstruction,
    SoftwareInterrupt,
}

impl Exception {
    /// Offset of the exception vector from the vector base
    pub fn vector_offset(&self) -> u32 {
        match self {
            Exception::UndefinedInstruction => 0x04,
            Exception::SoftwareInterrupt => 0x08,
        }
    }

    /// Mode the exception is taken in
    pub fn mode(&self) -> Mode {
        match self {
            Exception::UndefinedInstruction => Mode::Undefined,
            Exception::SoftwareInterrupt => Mode::Supervisor,
        }
    }
}

impl Cpu {
    /// Enter an exception handler
    ///
    /// `return_addr` goes to the new mode's LR, the old CPSR to its SPSR.
    pub fn take_exception(&mut self, exception: Exception, return_addr: u32) {
        let old_cpsr = self.cpsr;
        let mode = exception.mode();
        let new_cpsr = (old_cpsr & !(0x1F | CPSR_T)) | CPSR_I | mode as u32;

        self.set_cpsr(new_cpsr);
        self.spsr = old_cpsr;
        self.regs[14] = return_addr;
        self.regs[15] = self.vector_base.wrapping_add(exception.vector_offset());
    }
}
