//! ARM core orchestrator
//!
//! Brings together the CPU state, the translation cache and the shared bus,
//! and runs the cycle-budgeted execution loop.

use serde::{Serialize, Deserialize};

use crate::config::CoreConfig;
use crate::cpu::translate::{CacheStats, EntryPoint, TranslationCache, TranslationEntry, OP_RECORD_SIZE};
use crate::cpu::{classify, Cpu, Flow};
use crate::error::CoreError;
use crate::memory::Bus;
use crate::memory::bridge::GuestBus;
use crate::{console_error, console_log};

/// Budget charged per retired instruction
pub const CYCLES_PER_OPCODE: i32 = 2;

/// Why an execution call returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    BudgetExhausted,
    ServiceRequested,
}

/// Outcome of [`ArmCore::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Remaining budget, negative on overrun
    pub remaining: i32,
    pub reason: ExitReason,
}

/// One ARM core attached to a shared bus
pub struct ArmCore<B: Bus> {
    pub cpu: Cpu,
    pub(crate) bus: B,
    pub(crate) cache: Option<TranslationCache>,
    /// Set by a hypercall, cleared when execution starts
    pub(crate) service_request: bool,
    config: CoreConfig,
}

impl<B: Bus> ArmCore<B> {
    /// Core with the environment-derived configuration
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, CoreConfig::from_env())
    }

    pub fn with_config(bus: B, config: CoreConfig) -> Self {
        ArmCore {
            cpu: Cpu::new(),
            bus,
            cache: None,
            service_request: false,
            config,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Allocate the translation cache
    pub fn init(&mut self) -> Result<(), CoreError> {
        if self.cache.is_none() {
            self.cache = Some(TranslationCache::new(&self.config)?);
        }
        Ok(())
    }

    /// Release the translation cache; calling it twice is harmless
    pub fn deinit(&mut self) {
        if let Some(mut cache) = self.cache.take() {
            cache.fix_pc(&mut self.cpu);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cache.is_some()
    }

    /// Power-on state; the host sets the PC afterwards
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.service_request = false;
        if let Some(cache) = self.cache.as_mut() {
            cache.flush();
        }
    }

    /// Run for `cycles` budget units, returning what is left
    pub fn execute(&mut self, cycles: i32) -> i32 {
        self.run(cycles).remaining
    }

    /// Run for `cycles` budget units
    ///
    /// Stops once the budget is used up or right after a hypercall retires.
    pub fn run(&mut self, cycles: i32) -> ExecResult {
        self.service_request = false;
        let mut remaining = cycles;
        let mut retired = 0u64;

        while remaining > 0 && !self.service_request {
            // Instructions that fit in the budget, rounding up
            let budget = ((remaining - 1) / CYCLES_PER_OPCODE + 1) as u32;
            let count = if self.config.translate && self.cache.is_some() {
                self.run_translated(budget)
            } else {
                self.step_interpreted();
                1
            };
            retired += count as u64;
            remaining = (remaining as i64 - count as i64 * CYCLES_PER_OPCODE as i64) as i32;
        }

        if self.config.debug {
            console_log!("{} ARM opcodes have been ran", retired);
        }

        let reason = if self.service_request {
            ExitReason::ServiceRequested
        } else {
            ExitReason::BudgetExhausted
        };
        ExecResult { remaining, reason }
    }

    /// Execute one instruction without going through the cache
    fn step_interpreted(&mut self) {
        let detect = self.config.detect_self_modifying;
        interpret(
            &mut self.cpu,
            &mut self.bus,
            self.cache.as_mut(),
            &mut self.service_request,
            detect,
        );
    }

    /// Run at most `budget` instructions from the block at the current PC
    fn run_translated(&mut self, budget: u32) -> u32 {
        let ArmCore { cpu, bus, cache, service_request, config } = self;
        let detect = config.detect_self_modifying;

        let Some(cache) = cache.as_mut() else {
            interpret(cpu, bus, None, service_request, detect);
            return 1;
        };

        let Some(ep) = dispatch(cache, cpu.regs[15], bus, config.debug) else {
            interpret(cpu, bus, Some(cache), service_request, detect);
            return 1;
        };
        let Some(&entry) = cache.entry(ep.slot) else {
            interpret(cpu, bus, Some(cache), service_request, detect);
            return 1;
        };

        let mut offset = ep.offset;
        let mut retired = 0u32;

        while retired < budget && offset < entry.end {
            let Some((kind, raw)) = cache.read_op(offset) else { break };
            let addr = entry.guest_addr(offset);

            let mut guest = GuestBus::new(&mut *bus);
            let flow = cpu.execute(kind, raw, addr, &mut guest);
            let (written, fault) = (guest.written, guest.fault);

            retired += 1;
            offset += OP_RECORD_SIZE;

            if let Some((fault_addr, status)) = fault {
                cpu.latch_fault(fault_addr, status);
            }

            match flow {
                // R15 already holds the target
                Flow::Jump => return retired,
                Flow::Hypercall => {
                    *service_request = true;
                    break;
                }
                Flow::Next => {}
            }

            if detect {
                if let Some((first, last)) = written {
                    if cache.invalidate_range(first, last).contains(&ep.slot) {
                        // The rest of this block is stale
                        break;
                    }
                }
            }
        }

        cache.suspend(entry.guest_addr(offset));
        cache.fix_pc(cpu);
        retired
    }

    pub fn get_register(&self, index: u8) -> u32 {
        self.cpu.get_reg(index)
    }

    pub fn set_register(&mut self, index: u8, value: u32) {
        self.cpu.set_reg(index, value);
    }

    pub fn get_pc(&self) -> u32 {
        self.cpu.get_reg(15)
    }

    /// Whether the last execution call ended on a hypercall
    pub fn service_requested(&self) -> bool {
        self.service_request
    }

    pub fn pending_irqs(&self) -> u16 {
        self.cpu.waiting_irqs
    }

    /// Record pending IRQ lines (never delivered by this core)
    pub fn set_pending_irqs(&mut self, mask: u16) {
        self.cpu.waiting_irqs = mask;
    }

    pub fn pending_fiqs(&self) -> u16 {
        self.cpu.waiting_fiqs
    }

    /// Record pending FIQ lines (never delivered by this core)
    pub fn set_pending_fiqs(&mut self, mask: u16) {
        self.cpu.waiting_fiqs = mask;
    }

    /// Look up or compile the block at `pc`
    ///
    /// Capacity errors are returned as is; only the execution loop flushes
    /// and retries.
    pub fn translate(&mut self, pc: u32) -> Result<EntryPoint, CoreError> {
        let cache = self.cache.as_mut().ok_or(CoreError::NotInitialized)?;
        cache.translate(pc, &mut self.bus)
    }

    pub fn flush_translations(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.flush();
        }
    }

    /// Invalidate one translation slot; out-of-range indices are ignored
    pub fn invalidate_translation(&mut self, index: i32) {
        let Some(cache) = self.cache.as_mut() else { return };
        match usize::try_from(index) {
            Ok(index) => cache.invalidate(index),
            Err(_) => console_error!("[ARMv5] Ignoring invalidation of slot {}", index),
        }
    }

    /// Slot of the valid block covering `pc`
    pub fn translation_slot(&self, pc: u32) -> Option<usize> {
        self.cache.as_ref()?.slot_for(pc)
    }

    pub fn translation_entry(&self, slot: usize) -> Option<TranslationEntry> {
        self.cache.as_ref()?.entry(slot).copied()
    }

    /// Write back a PC deferred by translated code
    pub fn fix_pc(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.fix_pc(&mut self.cpu);
        }
    }

    pub fn buffer_cursor(&self) -> Option<usize> {
        self.cache.as_ref().map(|cache| cache.buffer_cursor())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.as_ref().map(|cache| cache.stats()).unwrap_or_default()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

/// Entry point for `pc`, flushing once when the cache is out of room
fn dispatch<B: Bus>(
    cache: &mut TranslationCache,
    pc: u32,
    bus: &mut B,
    debug: bool,
) -> Option<EntryPoint> {
    match cache.translate(pc, bus) {
        Ok(ep) => Some(ep),
        Err(err) => {
            if debug {
                console_log!("[ARMv5] {} at 0x{:08X}, flushing translations", err, pc);
            }
            cache.flush();
            match cache.translate(pc, bus) {
                Ok(ep) => Some(ep),
                Err(err) => {
                    if debug {
                        console_error!("[ARMv5] Cannot translate 0x{:08X}: {}, interpreting", pc, err);
                    }
                    None
                }
            }
        }
    }
}

/// Fetch, decode and execute the instruction at the current PC
fn interpret<B: Bus>(
    cpu: &mut Cpu,
    bus: &mut B,
    cache: Option<&mut TranslationCache>,
    service_request: &mut bool,
    detect_self_modifying: bool,
) {
    let pc = cpu.regs[15] & !3;
    let mut guest = GuestBus::new(bus);
    let raw = guest.read32(pc, true).unwrap_or(0);
    let flow = cpu.execute(classify(raw), raw, pc, &mut guest);
    let (written, fault) = (guest.written, guest.fault);

    if let Some((fault_addr, status)) = fault {
        cpu.latch_fault(fault_addr, status);
    }

    match flow {
        Flow::Next => cpu.regs[15] = pc.wrapping_add(4),
        Flow::Hypercall => {
            cpu.regs[15] = pc.wrapping_add(4);
            *service_request = true;
        }
        Flow::Jump => {}
    }

    if detect_self_modifying {
        if let (Some(cache), Some((first, last))) = (cache, written) {
            cache.invalidate_range(first, last);
        }
    }
}
