//! Instruction execution
//!
//! Implements ARM-state ARMv5TE instruction semantics. The executor never
//! touches R15 for sequential flow: the caller owns PC advancement, which lets
//! translated blocks defer the architectural PC until a block boundary.
//! Reads of R15 as an operand use the instruction's own address + 8.

use super::decode::OpKind;
use super::trap::Exception;
use super::*;
use crate::console_log;
use crate::memory::Bus;
use crate::memory::bridge::GuestBus;

/// Control flow after one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the next sequential instruction
    Next,
    /// R15 was written (branch, PC load, exception entry)
    Jump,
    /// Hypercall issued; continue sequentially once the host is done
    Hypercall,
}

/// ARM9 processor ID
const CP15_ID: u32 = 0x4106_9265;
/// Cache type register
const CP15_CACHE_TYPE: u32 = 0x1D15_2152;

const SHIFT_LSL: u32 = 0;
const SHIFT_LSR: u32 = 1;
const SHIFT_ASR: u32 = 2;

/// Barrel shifter, returns (value, carry out)
///
/// `by_reg` selects register-specified amounts, where 0 means "no shift"
/// instead of the immediate encodings of LSR/ASR #32 and RRX.
fn shift(value: u32, kind: u32, amount: u32, by_reg: bool, carry_in: bool) -> (u32, bool) {
    match kind {
        SHIFT_LSL => match amount {
            0 => (value, carry_in),
            1..=31 => (value << amount, (value >> (32 - amount)) & 1 != 0),
            32 => (0, value & 1 != 0),
            _ => (0, false),
        },
        SHIFT_LSR => {
            let amount = if amount == 0 && !by_reg { 32 } else { amount };
            match amount {
                0 => (value, carry_in),
                1..=31 => (value >> amount, (value >> (amount - 1)) & 1 != 0),
                32 => (0, value >> 31 != 0),
                _ => (0, false),
            }
        }
        SHIFT_ASR => {
            let amount = if amount == 0 && !by_reg { 32 } else { amount };
            match amount {
                0 => (value, carry_in),
                1..=31 => (((value as i32) >> amount) as u32, (value >> (amount - 1)) & 1 != 0),
                _ => {
                    let sign = value >> 31 != 0;
                    (if sign { 0xFFFF_FFFF } else { 0 }, sign)
                }
            }
        }
        // ROR
        _ => {
            if amount == 0 {
                if by_reg {
                    (value, carry_in)
                } else {
                    // RRX
                    (((carry_in as u32) << 31) | (value >> 1), value & 1 != 0)
                }
            } else {
                let rot = amount & 31;
                if rot == 0 {
                    (value, value >> 31 != 0)
                } else {
                    (value.rotate_right(rot), (value >> (rot - 1)) & 1 != 0)
                }
            }
        }
    }
}

/// a + b + carry, returns (result, carry out, overflow)
#[inline(always)]
fn add_with_carry(a: u32, b: u32, carry: bool) -> (u32, bool, bool) {
    let sum = a as u64 + b as u64 + carry as u64;
    let result = sum as u32;
    let overflow = ((a ^ result) & (b ^ result)) >> 31 != 0;
    (result, sum >> 32 != 0, overflow)
}

impl Cpu {
    /// Execute a single classified instruction located at `addr`
    pub fn execute<B: Bus>(
        &mut self,
        kind: OpKind,
        inst: u32,
        addr: u32,
        mem: &mut GuestBus<'_, B>,
    ) -> Flow {
        let cond = inst >> 28;
        if cond != 0xF && !self.condition_passed(cond) {
            return Flow::Next;
        }

        match kind {
            OpKind::DataProc => self.exec_data_proc(inst, addr),
            OpKind::Multiply => self.exec_multiply(inst),
            OpKind::MultiplyLong => self.exec_multiply_long(inst),
            OpKind::Swap => self.exec_swap(inst, mem),
            OpKind::Mrs => self.exec_mrs(inst),
            OpKind::Msr => self.exec_msr(inst),
            OpKind::Bx => {
                let target = self.operand(inst & 0xF, addr);
                self.branch_exchange(target, addr)
            }
            OpKind::BlxReg => {
                let target = self.operand(inst & 0xF, addr);
                self.regs[14] = addr.wrapping_add(4);
                self.branch_exchange(target, addr)
            }
            OpKind::Clz => {
                let value = self.operand(inst & 0xF, addr);
                self.write_result((inst >> 12) & 0xF, value.leading_zeros())
            }
            OpKind::HalfwordTransfer => self.exec_halfword(inst, addr, mem),
            OpKind::DoubleTransfer => self.exec_double(inst, addr, mem),
            OpKind::SingleTransfer => self.exec_single(inst, addr, mem),
            OpKind::BlockTransfer => self.exec_block(inst, addr, mem),
            OpKind::Branch => {
                let offset = (((inst & 0x00FF_FFFF) << 8) as i32 >> 6) as u32;
                if inst & (1 << 24) != 0 {
                    self.regs[14] = addr.wrapping_add(4);
                }
                self.regs[15] = addr.wrapping_add(8).wrapping_add(offset);
                Flow::Jump
            }
            OpKind::CoprocReg => self.exec_coproc(inst, addr),
            OpKind::Swi => {
                self.take_exception(Exception::SoftwareInterrupt, addr.wrapping_add(4));
                Flow::Jump
            }
            OpKind::Hypercall => Flow::Hypercall,
            OpKind::BlxImm => self.thumb_unsupported(inst, addr),
            OpKind::Nop => Flow::Next,
            OpKind::Undefined => self.undefined(addr),
        }
    }

    /// Register operand as seen by the instruction at `addr`
    #[inline(always)]
    fn operand(&self, reg: u32, addr: u32) -> u32 {
        if reg == 15 {
            addr.wrapping_add(8)
        } else {
            self.regs[reg as usize]
        }
    }

    /// Write a destination register, turning R15 writes into jumps
    #[inline(always)]
    fn write_result(&mut self, rd: u32, value: u32) -> Flow {
        if rd == 15 {
            self.regs[15] = value & !3;
            Flow::Jump
        } else {
            self.regs[rd as usize] = value;
            Flow::Next
        }
    }

    fn undefined(&mut self, addr: u32) -> Flow {
        self.take_exception(Exception::UndefinedInstruction, addr.wrapping_add(4));
        Flow::Jump
    }

    fn thumb_unsupported(&mut self, inst: u32, addr: u32) -> Flow {
        console_log!("Thumb state is not supported: 0x{:08X} at 0x{:08X}", inst, addr);
        self.undefined(addr)
    }

    /// Interworking branch (BX, BLX, loads into PC)
    fn branch_exchange(&mut self, target: u32, addr: u32) -> Flow {
        if target & 1 != 0 {
            return self.thumb_unsupported(target, addr);
        }
        self.regs[15] = target & !3;
        Flow::Jump
    }

    /// Shifter operand of data processing instructions, returns (value, carry)
    fn shifter_operand(&self, inst: u32, addr: u32) -> (u32, bool) {
        let carry = self.flag(CPSR_C);
        if inst & (1 << 25) != 0 {
            let imm = inst & 0xFF;
            let rot = ((inst >> 8) & 0xF) * 2;
            if rot == 0 {
                (imm, carry)
            } else {
                let value = imm.rotate_right(rot);
                (value, value >> 31 != 0)
            }
        } else {
            let rm = inst & 0xF;
            let kind = (inst >> 5) & 0x3;
            if inst & (1 << 4) != 0 {
                // Shift by register: PC reads one word further ahead
                let rs = (inst >> 8) & 0xF;
                let amount = self.operand(rs, addr) & 0xFF;
                let value = if rm == 15 { addr.wrapping_add(12) } else { self.regs[rm as usize] };
                shift(value, kind, amount, true, carry)
            } else {
                let amount = (inst >> 7) & 0x1F;
                shift(self.operand(rm, addr), kind, amount, false, carry)
            }
        }
    }

    fn exec_data_proc(&mut self, inst: u32, addr: u32) -> Flow {
        let opcode = (inst >> 21) & 0xF;
        let set_flags = inst & (1 << 20) != 0;
        let rn = (inst >> 16) & 0xF;
        let rd = (inst >> 12) & 0xF;

        let (op2, shifter_carry) = self.shifter_operand(inst, addr);
        let a = if rn == 15 && inst & (1 << 25) == 0 && inst & (1 << 4) != 0 {
            addr.wrapping_add(12)
        } else {
            self.operand(rn, addr)
        };
        let c = self.flag(CPSR_C);
        let v = self.flag(CPSR_V);

        // (result, carry, overflow, writes rd)
        let (result, carry, overflow, write) = match opcode {
            0x0 => (a & op2, shifter_carry, v, true),       // AND
            0x1 => (a ^ op2, shifter_carry, v, true),       // EOR
            0x2 => {
                let (r, c, o) = add_with_carry(a, !op2, true); // SUB
                (r, c, o, true)
            }
            0x3 => {
                let (r, c, o) = add_with_carry(op2, !a, true); // RSB
                (r, c, o, true)
            }
            0x4 => {
                let (r, c, o) = add_with_carry(a, op2, false); // ADD
                (r, c, o, true)
            }
            0x5 => {
                let (r, c, o) = add_with_carry(a, op2, c); // ADC
                (r, c, o, true)
            }
            0x6 => {
                let (r, c, o) = add_with_carry(a, !op2, c); // SBC
                (r, c, o, true)
            }
            0x7 => {
                let (r, c, o) = add_with_carry(op2, !a, c); // RSC
                (r, c, o, true)
            }
            0x8 => (a & op2, shifter_carry, v, false),      // TST
            0x9 => (a ^ op2, shifter_carry, v, false),      // TEQ
            0xA => {
                let (r, c, o) = add_with_carry(a, !op2, true); // CMP
                (r, c, o, false)
            }
            0xB => {
                let (r, c, o) = add_with_carry(a, op2, false); // CMN
                (r, c, o, false)
            }
            0xC => (a | op2, shifter_carry, v, true),       // ORR
            0xD => (op2, shifter_carry, v, true),           // MOV
            0xE => (a & !op2, shifter_carry, v, true),      // BIC
            _ => (!op2, shifter_carry, v, true),            // MVN
        };

        if set_flags && rd == 15 {
            // Exception return: restore CPSR from SPSR
            if write {
                let spsr = self.spsr;
                self.set_cpsr(spsr);
                self.regs[15] = result & !3;
                return Flow::Jump;
            }
            return Flow::Next;
        }

        if set_flags {
            self.set_nz(result);
            self.set_cv(carry, overflow);
        }

        if write {
            self.write_result(rd, result)
        } else {
            Flow::Next
        }
    }

    fn exec_multiply(&mut self, inst: u32) -> Flow {
        let rd = (inst >> 16) & 0xF;
        let rn = (inst >> 12) & 0xF;
        let rs = (inst >> 8) & 0xF;
        let rm = inst & 0xF;

        let mut result = self.regs[rm as usize].wrapping_mul(self.regs[rs as usize]);
        if inst & (1 << 21) != 0 {
            result = result.wrapping_add(self.regs[rn as usize]);
        }
        if inst & (1 << 20) != 0 {
            self.set_nz(result);
        }
        self.write_result(rd, result)
    }

    fn exec_multiply_long(&mut self, inst: u32) -> Flow {
        let rd_hi = ((inst >> 16) & 0xF) as usize;
        let rd_lo = ((inst >> 12) & 0xF) as usize;
        let rs = self.regs[((inst >> 8) & 0xF) as usize];
        let rm = self.regs[(inst & 0xF) as usize];
        let signed = inst & (1 << 22) != 0;

        let mut result = if signed {
            ((rm as i32 as i64) * (rs as i32 as i64)) as u64
        } else {
            (rm as u64) * (rs as u64)
        };
        if inst & (1 << 21) != 0 {
            let acc = ((self.regs[rd_hi] as u64) << 32) | self.regs[rd_lo] as u64;
            result = result.wrapping_add(acc);
        }

        self.regs[rd_lo] = result as u32;
        self.regs[rd_hi] = (result >> 32) as u32;
        if inst & (1 << 20) != 0 {
            let mut cpsr = self.cpsr & !(CPSR_N | CPSR_Z);
            if result >> 63 != 0 {
                cpsr |= CPSR_N;
            }
            if result == 0 {
                cpsr |= CPSR_Z;
            }
            self.cpsr = cpsr;
        }
        Flow::Next
    }

    fn exec_swap<B: Bus>(&mut self, inst: u32, mem: &mut GuestBus<'_, B>) -> Flow {
        let rn = self.regs[((inst >> 16) & 0xF) as usize];
        let rd = (inst >> 12) & 0xF;
        let rm = self.regs[(inst & 0xF) as usize];
        let privileged = self.is_privileged();

        if inst & (1 << 22) != 0 {
            let Some(old) = mem.read8(rn, privileged) else { return Flow::Next };
            mem.write8(rn, rm as u8, privileged);
            self.write_result(rd, old as u32)
        } else {
            let Some(old) = mem.read32(rn & !3, privileged) else { return Flow::Next };
            mem.write32(rn & !3, rm, privileged);
            self.write_result(rd, old.rotate_right((rn & 3) * 8))
        }
    }

    fn exec_mrs(&mut self, inst: u32) -> Flow {
        let value = if inst & (1 << 22) != 0 { self.spsr } else { self.cpsr };
        self.write_result((inst >> 12) & 0xF, value)
    }

    fn exec_msr(&mut self, inst: u32) -> Flow {
        let value = if inst & (1 << 25) != 0 {
            let rot = ((inst >> 8) & 0xF) * 2;
            (inst & 0xFF).rotate_right(rot)
        } else {
            self.regs[(inst & 0xF) as usize]
        };

        let mut mask = 0u32;
        for field in 0..4 {
            if inst & (1 << (16 + field)) != 0 {
                mask |= 0xFF << (field * 8);
            }
        }

        if inst & (1 << 22) != 0 {
            self.spsr = (self.spsr & !mask) | (value & mask);
        } else {
            if !self.is_privileged() {
                // User mode may only write the flags
                mask &= 0xFF00_0000;
            }
            // The T bit is not writable through MSR
            mask &= !CPSR_T;
            let new_cpsr = (self.cpsr & !mask) | (value & mask);
            self.set_cpsr(new_cpsr);
        }
        Flow::Next
    }

    fn exec_single<B: Bus>(&mut self, inst: u32, addr: u32, mem: &mut GuestBus<'_, B>) -> Flow {
        let pre = inst & (1 << 24) != 0;
        let up = inst & (1 << 23) != 0;
        let byte = inst & (1 << 22) != 0;
        let writeback = inst & (1 << 21) != 0;
        let load = inst & (1 << 20) != 0;
        let rn = (inst >> 16) & 0xF;
        let rd = (inst >> 12) & 0xF;

        let offset = if inst & (1 << 25) != 0 {
            let rm = self.operand(inst & 0xF, addr);
            let kind = (inst >> 5) & 0x3;
            let amount = (inst >> 7) & 0x1F;
            shift(rm, kind, amount, false, self.flag(CPSR_C)).0
        } else {
            inst & 0xFFF
        };

        let base = self.operand(rn, addr);
        let offset_base = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        let address = if pre { offset_base } else { base };
        // Post-indexed with W set: LDRT/STRT, user-mode access
        let privileged = self.is_privileged() && (pre || !writeback);

        if load {
            let value = if byte {
                mem.read8(address, privileged).map(|v| v as u32)
            } else {
                mem.read32(address & !3, privileged)
                    .map(|v| v.rotate_right((address & 3) * 8))
            };
            if !pre || writeback {
                self.regs[rn as usize] = offset_base;
            }
            match value {
                Some(value) if rd == 15 => self.branch_exchange(value, addr),
                Some(value) => {
                    self.regs[rd as usize] = value;
                    Flow::Next
                }
                None => Flow::Next,
            }
        } else {
            let value = if rd == 15 { addr.wrapping_add(12) } else { self.regs[rd as usize] };
            if byte {
                mem.write8(address, value as u8, privileged);
            } else {
                mem.write32(address & !3, value, privileged);
            }
            if !pre || writeback {
                self.regs[rn as usize] = offset_base;
            }
            Flow::Next
        }
    }

    fn exec_halfword<B: Bus>(&mut self, inst: u32, addr: u32, mem: &mut GuestBus<'_, B>) -> Flow {
        let pre = inst & (1 << 24) != 0;
        let up = inst & (1 << 23) != 0;
        let writeback = inst & (1 << 21) != 0;
        let load = inst & (1 << 20) != 0;
        let rn = (inst >> 16) & 0xF;
        let rd = (inst >> 12) & 0xF;
        let sh = (inst >> 5) & 0x3;

        let offset = if inst & (1 << 22) != 0 {
            ((inst >> 4) & 0xF0) | (inst & 0xF)
        } else {
            self.operand(inst & 0xF, addr)
        };

        let base = self.operand(rn, addr);
        let offset_base = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        let address = if pre { offset_base } else { base };
        let privileged = self.is_privileged();

        if load {
            let value = match sh {
                0b01 => mem.read16(address & !1, privileged).map(|v| v as u32),
                0b10 => mem.read8(address, privileged).map(|v| v as i8 as i32 as u32),
                _ => mem.read16(address & !1, privileged).map(|v| v as i16 as i32 as u32),
            };
            if !pre || writeback {
                self.regs[rn as usize] = offset_base;
            }
            match value {
                Some(value) => self.write_result(rd, value),
                None => Flow::Next,
            }
        } else {
            let value = if rd == 15 { addr.wrapping_add(12) } else { self.regs[rd as usize] };
            mem.write16(address & !1, value as u16, privileged);
            if !pre || writeback {
                self.regs[rn as usize] = offset_base;
            }
            Flow::Next
        }
    }

    /// LDRD/STRD on the even/odd pair Rd, Rd+1
    fn exec_double<B: Bus>(&mut self, inst: u32, addr: u32, mem: &mut GuestBus<'_, B>) -> Flow {
        let pre = inst & (1 << 24) != 0;
        let up = inst & (1 << 23) != 0;
        let writeback = inst & (1 << 21) != 0;
        let store = inst & (1 << 5) != 0;
        let rn = (inst >> 16) & 0xF;
        let rd = ((inst >> 12) & 0xE) as usize;

        let offset = if inst & (1 << 22) != 0 {
            ((inst >> 4) & 0xF0) | (inst & 0xF)
        } else {
            self.operand(inst & 0xF, addr)
        };

        let base = self.operand(rn, addr);
        let offset_base = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        let address = (if pre { offset_base } else { base }) & !3;
        let privileged = self.is_privileged();

        if store {
            let (low, high) = (self.regs[rd], self.regs[rd + 1]);
            mem.write32(address, low, privileged);
            mem.write32(address.wrapping_add(4), high, privileged);
            if !pre || writeback {
                self.regs[rn as usize] = offset_base;
            }
        } else {
            let low = mem.read32(address, privileged);
            let high = mem.read32(address.wrapping_add(4), privileged);
            if !pre || writeback {
                self.regs[rn as usize] = offset_base;
            }
            if let (Some(low), Some(high)) = (low, high) {
                self.regs[rd] = low;
                self.regs[rd + 1] = high;
            }
        }
        Flow::Next
    }

    fn exec_block<B: Bus>(&mut self, inst: u32, addr: u32, mem: &mut GuestBus<'_, B>) -> Flow {
        let pre = inst & (1 << 24) != 0;
        let up = inst & (1 << 23) != 0;
        let user_bank = inst & (1 << 22) != 0;
        let writeback = inst & (1 << 21) != 0;
        let load = inst & (1 << 20) != 0;
        let rn = ((inst >> 16) & 0xF) as usize;
        let list = inst & 0xFFFF;

        if list == 0 {
            return Flow::Next;
        }

        let count = list.count_ones();
        let base = self.regs[rn];
        let new_base = if up {
            base.wrapping_add(count * 4)
        } else {
            base.wrapping_sub(count * 4)
        };
        let mut address = match (up, pre) {
            (true, false) => base,
            (true, true) => base.wrapping_add(4),
            (false, false) => base.wrapping_sub(count * 4).wrapping_add(4),
            (false, true) => base.wrapping_sub(count * 4),
        } & !3;
        let privileged = self.is_privileged();
        let has_pc = list & (1 << 15) != 0;

        if load {
            if writeback {
                self.regs[rn] = new_base;
            }
            let mut flow = Flow::Next;
            for reg in 0..16usize {
                if list & (1 << reg) == 0 {
                    continue;
                }
                if let Some(value) = mem.read32(address, privileged) {
                    if reg == 15 {
                        if user_bank {
                            // LDM with S and PC: return from exception
                            let spsr = self.spsr;
                            self.set_cpsr(spsr);
                            self.regs[15] = value & !3;
                            flow = Flow::Jump;
                        } else {
                            flow = self.branch_exchange(value, addr);
                        }
                    } else if user_bank && !has_pc {
                        self.set_user_reg(reg, value);
                    } else {
                        self.regs[reg] = value;
                    }
                }
                address = address.wrapping_add(4);
            }
            flow
        } else {
            for reg in 0..16usize {
                if list & (1 << reg) == 0 {
                    continue;
                }
                let value = if reg == 15 {
                    addr.wrapping_add(12)
                } else if user_bank {
                    self.user_reg(reg)
                } else {
                    self.regs[reg]
                };
                mem.write32(address, value, privileged);
                address = address.wrapping_add(4);
            }
            if writeback {
                self.regs[rn] = new_base;
            }
            Flow::Next
        }
    }

    fn exec_coproc(&mut self, inst: u32, addr: u32) -> Flow {
        let cp_num = (inst >> 8) & 0xF;
        if cp_num != 15 || !self.is_privileged() {
            return self.undefined(addr);
        }

        let read = inst & (1 << 20) != 0;
        let crn = (inst >> 16) & 0xF;
        let rd = (inst >> 12) & 0xF;
        let opc2 = (inst >> 5) & 0x7;

        if read {
            let value = match crn {
                0 if opc2 == 1 => CP15_CACHE_TYPE,
                0 => CP15_ID,
                1 => self.extra_regs[CP15_CONTROL],
                2 => self.extra_regs[CP15_TTB],
                3 => self.extra_regs[CP15_DACR],
                5 => self.extra_regs[CP15_FSR],
                6 => self.extra_regs[CP15_FAR],
                15 => self.cpar as u32,
                _ => 0,
            };
            if rd == 15 {
                // MRC to PC sets the flags
                self.cpsr = (self.cpsr & 0x0FFF_FFFF) | (value & 0xF000_0000);
            } else {
                self.regs[rd as usize] = value;
            }
        } else {
            let value = self.operand(rd, addr);
            match crn {
                1 => self.set_control(value),
                2 => self.extra_regs[CP15_TTB] = value,
                3 => self.extra_regs[CP15_DACR] = value,
                5 => self.extra_regs[CP15_FSR] = value,
                6 => self.extra_regs[CP15_FAR] = value,
                15 => self.cpar = value as u16,
                // Cache and TLB maintenance has nothing to do here
                _ => {}
            }
        }
        Flow::Next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::classify;
    use crate::memory::SharedMemory;

    fn run(cpu: &mut Cpu, mem: &mut SharedMemory, inst: u32, addr: u32) -> Flow {
        let mut guest = GuestBus::new(mem);
        cpu.execute(classify(inst), inst, addr, &mut guest)
    }

    #[test]
    fn test_shift_edge_cases() {
        assert_eq!(shift(0x8000_0001, SHIFT_LSL, 1, false, false), (0x2, true));
        assert_eq!(shift(0x8000_0000, SHIFT_LSR, 0, false, false), (0, true));
        assert_eq!(shift(0x8000_0000, SHIFT_ASR, 0, false, false), (0xFFFF_FFFF, true));
        assert_eq!(shift(0x3, 3, 0, false, true), (0x8000_0001, true));
        assert_eq!(shift(0x1234, SHIFT_LSL, 0, true, true), (0x1234, true));
        assert_eq!(shift(0x1, SHIFT_LSL, 33, true, true), (0, false));
    }

    #[test]
    fn test_add_sets_flags() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[1] = 0xFFFF_FFFF;
        cpu.regs[2] = 1;
        // adds r0, r1, r2
        assert_eq!(run(&mut cpu, &mut mem, 0xE091_0002, 0), Flow::Next);
        assert_eq!(cpu.regs[0], 0);
        assert!(cpu.flag(CPSR_Z) && cpu.flag(CPSR_C));
        assert!(!cpu.flag(CPSR_N) && !cpu.flag(CPSR_V));
    }

    #[test]
    fn test_cmp_and_conditional_mov() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[0] = 5;
        // cmp r0, #5
        run(&mut cpu, &mut mem, 0xE350_0005, 0);
        assert!(cpu.flag(CPSR_Z));
        // movne r1, #1 (skipped)
        run(&mut cpu, &mut mem, 0x13A0_1001, 4);
        assert_eq!(cpu.regs[1], 0);
        // moveq r1, #2
        run(&mut cpu, &mut mem, 0x03A0_1002, 8);
        assert_eq!(cpu.regs[1], 2);
    }

    #[test]
    fn test_pc_operand_reads_ahead() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        // mov r0, pc
        run(&mut cpu, &mut mem, 0xE1A0_000F, 0x40);
        assert_eq!(cpu.regs[0], 0x48);
    }

    #[test]
    fn test_branch_and_link() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        // bl +0x10 (offset field 2 -> 8 + 8)
        assert_eq!(run(&mut cpu, &mut mem, 0xEB00_0002, 0x100), Flow::Jump);
        assert_eq!(cpu.regs[15], 0x110);
        assert_eq!(cpu.regs[14], 0x104);
        // b . (offset -2)
        run(&mut cpu, &mut mem, 0xEAFF_FFFE, 0x200);
        assert_eq!(cpu.regs[15], 0x200);
    }

    #[test]
    fn test_load_store_word_and_byte() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[1] = 0x40;
        cpu.regs[0] = 0xCAFE_BABE;
        // str r0, [r1, #4]!
        run(&mut cpu, &mut mem, 0xE5A1_0004, 0);
        assert_eq!(cpu.regs[1], 0x44);
        assert_eq!(mem.read_bytes(0x44, 4), vec![0xBE, 0xBA, 0xFE, 0xCA]);
        // ldrb r2, [r1], #1
        run(&mut cpu, &mut mem, 0xE4D1_2001, 4);
        assert_eq!(cpu.regs[2], 0xBE);
        assert_eq!(cpu.regs[1], 0x45);
        // ldr r3, [r1, #-1]
        run(&mut cpu, &mut mem, 0xE511_3001, 8);
        assert_eq!(cpu.regs[3], 0xCAFE_BABE);
    }

    #[test]
    fn test_halfword_signed_loads() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        mem.load_binary(&[0xF0, 0xFF], 0x20).unwrap();
        cpu.regs[1] = 0x20;
        // ldrsh r0, [r1]
        run(&mut cpu, &mut mem, 0xE1D1_00F0, 0);
        assert_eq!(cpu.regs[0], 0xFFFF_FFF0);
        // ldrh r0, [r1]
        run(&mut cpu, &mut mem, 0xE1D1_00B0, 4);
        assert_eq!(cpu.regs[0], 0xFFF0);
        // ldrsb r0, [r1]
        run(&mut cpu, &mut mem, 0xE1D1_00D0, 8);
        assert_eq!(cpu.regs[0], 0xFFFF_FFF0);
    }

    #[test]
    fn test_doubleword_transfer() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[1] = 0x40;
        cpu.regs[2] = 0x1111_2222;
        cpu.regs[3] = 0x3333_4444;
        // strd r2, [r1, #8]
        assert_eq!(run(&mut cpu, &mut mem, 0xE1C1_20F8, 0), Flow::Next);
        assert_eq!(mem.read_bytes(0x48, 8), vec![0x22, 0x22, 0x11, 0x11, 0x44, 0x44, 0x33, 0x33]);
        assert_eq!(cpu.regs[1], 0x40);

        // ldrd r4, [r1], #8
        mem.load_binary(&[1, 0, 0, 0, 2, 0, 0, 0], 0x40).unwrap();
        run(&mut cpu, &mut mem, 0xE0C1_40D8, 4);
        assert_eq!((cpu.regs[4], cpu.regs[5]), (1, 2));
        assert_eq!(cpu.regs[1], 0x48);

        // ldrd r6, [r1]
        run(&mut cpu, &mut mem, 0xE1C1_60D0, 8);
        assert_eq!((cpu.regs[6], cpu.regs[7]), (0x1111_2222, 0x3333_4444));
    }

    #[test]
    fn test_push_pop() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[13] = 0x80;
        cpu.regs[4] = 0x44;
        cpu.regs[14] = 0x1000;
        // push {r4, lr}
        run(&mut cpu, &mut mem, 0xE92D_4010, 0);
        assert_eq!(cpu.regs[13], 0x78);
        cpu.regs[4] = 0;
        // pop {r4, pc}
        assert_eq!(run(&mut cpu, &mut mem, 0xE8BD_8010, 4), Flow::Jump);
        assert_eq!(cpu.regs[4], 0x44);
        assert_eq!(cpu.regs[15], 0x1000);
        assert_eq!(cpu.regs[13], 0x80);
    }

    #[test]
    fn test_msr_switches_mode() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[13] = 0x500;
        // msr cpsr_c, #0xd2 (IRQ mode)
        run(&mut cpu, &mut mem, 0xE321_F0D2, 0);
        assert_eq!(cpu.mode(), Mode::Irq);
        assert_eq!(cpu.regs[13], 0);
        // msr cpsr_c, #0xd3 (back to SVC)
        run(&mut cpu, &mut mem, 0xE321_F0D3, 4);
        assert_eq!(cpu.regs[13], 0x500);
    }

    #[test]
    fn test_user_mode_msr_only_writes_flags() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.switch_mode(Mode::User);
        cpu.regs[0] = 0xF000_00D3;
        // msr cpsr_fc, r0
        run(&mut cpu, &mut mem, 0xE129_F000, 0);
        assert_eq!(cpu.mode(), Mode::User);
        assert!(cpu.flag(CPSR_N) && cpu.flag(CPSR_V));
    }

    #[test]
    fn test_exception_return_restores_mode() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.switch_mode(Mode::User);
        // swi 0
        assert_eq!(run(&mut cpu, &mut mem, 0xEF00_0000, 0x300), Flow::Jump);
        assert_eq!(cpu.mode(), Mode::Supervisor);
        assert_eq!(cpu.regs[15], 0x08);
        // movs pc, lr
        assert_eq!(run(&mut cpu, &mut mem, 0xE1B0_F00E, 0x08), Flow::Jump);
        assert_eq!(cpu.mode(), Mode::User);
        assert_eq!(cpu.regs[15], 0x304);
    }

    #[test]
    fn test_multiply_long() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[2] = 0xFFFF_FFFF;
        cpu.regs[3] = 2;
        // umull r0, r1, r2, r3
        run(&mut cpu, &mut mem, 0xE081_0392, 0);
        assert_eq!(cpu.regs[0], 0xFFFF_FFFE);
        assert_eq!(cpu.regs[1], 1);
        // smull r0, r1, r2, r3
        run(&mut cpu, &mut mem, 0xE0C1_0392, 4);
        assert_eq!(cpu.regs[0], 0xFFFF_FFFE);
        assert_eq!(cpu.regs[1], 0xFFFF_FFFF);
    }

    #[test]
    fn test_clz_and_swap() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[1] = 0x0000_8000;
        // clz r0, r1
        run(&mut cpu, &mut mem, 0xE16F_0F11, 0);
        assert_eq!(cpu.regs[0], 16);

        mem.load_binary(&[1, 0, 0, 0], 0x10).unwrap();
        cpu.regs[1] = 0x10;
        cpu.regs[2] = 7;
        // swp r0, r2, [r1]
        run(&mut cpu, &mut mem, 0xE101_0092, 4);
        assert_eq!(cpu.regs[0], 1);
        assert_eq!(mem.read_bytes(0x10, 4), vec![7, 0, 0, 0]);
    }

    #[test]
    fn test_cp15_access() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        // mrc p15, 0, r0, c0, c0, 0
        run(&mut cpu, &mut mem, 0xEE10_0F10, 0);
        assert_eq!(cpu.regs[0], CP15_ID);
        cpu.regs[1] = CP15_CONTROL_V;
        // mcr p15, 0, r1, c1, c0, 0
        run(&mut cpu, &mut mem, 0xEE01_1F10, 4);
        assert_eq!(cpu.vector_base, HIGH_VECTORS);

        cpu.switch_mode(Mode::User);
        // Coprocessor access from user mode is undefined
        assert_eq!(run(&mut cpu, &mut mem, 0xEE10_0F10, 8), Flow::Jump);
        assert_eq!(cpu.mode(), Mode::Undefined);
    }

    #[test]
    fn test_thumb_switch_is_undefined() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        cpu.regs[3] = 0x101;
        // bx r3
        assert_eq!(run(&mut cpu, &mut mem, 0xE12F_FF13, 0x20), Flow::Jump);
        assert_eq!(cpu.mode(), Mode::Undefined);
        assert_eq!(cpu.regs[14], 0x24);
        assert_eq!(cpu.regs[15], 0x04);
    }

    #[test]
    fn test_hypercall_flow() {
        let mut cpu = Cpu::new();
        let mut mem = SharedMemory::with_size(0x100);
        assert_eq!(run(&mut cpu, &mut mem, HYPERCALL_ARM, 0), Flow::Hypercall);
    }
}
