//! Translation cache
//!
//! Guest code is translated lazily into threaded-code blocks stored in the
//! instruction buffer. A block is a header followed by one op record per
//! guest instruction:
//!
//! ```text
//! header:  guest_start: u32 LE | insn_count: u32 LE
//! op:      raw: u32 LE | kind: u8 | reserved: [u8; 3]
//! ```
//!
//! The jump target of a block is the offset of its first op record. The
//! executor walks records from there, so entering at a PC inside a block is
//! just an offset into the same records.
//!
//! Valid entries always cover disjoint guest ranges: a new block never starts
//! inside a valid one and stops scanning before the next valid block.

mod buffer;

pub use buffer::InsnBuffer;

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use super::decode::{classify, is_block_terminator, OpKind};
use super::Cpu;
use crate::config::CoreConfig;
use crate::console_log;
use crate::error::CoreError;
use crate::memory::Bus;
use crate::memory::bridge::GuestBus;

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 8;
/// Op record size in bytes
pub const OP_RECORD_SIZE: usize = 8;

/// One translated block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TranslationEntry {
    /// Buffer offset of the block header
    pub start: usize,
    /// Buffer offset one past the last op record
    pub end: usize,
    /// Buffer offset of the first op record
    pub jump_target: usize,
    /// First guest address covered
    pub guest_start: u32,
    /// Guest address of the last instruction covered
    pub guest_last: u32,
    /// Translation counter value when the block was compiled
    pub generation: u32,
    pub valid: bool,
}

impl TranslationEntry {
    /// Number of guest instructions in the block
    pub fn insn_count(&self) -> usize {
        (self.end - self.jump_target) / OP_RECORD_SIZE
    }

    #[inline(always)]
    pub fn covers(&self, pc: u32) -> bool {
        self.valid && pc >= self.guest_start && pc <= self.guest_last
    }

    /// Guest address of the op record at `offset`
    #[inline(always)]
    pub fn guest_addr(&self, offset: usize) -> u32 {
        let index = (offset - self.jump_target) / OP_RECORD_SIZE;
        self.guest_start.wrapping_add((index * 4) as u32)
    }
}

/// Where to start executing translated code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    /// Translation table slot of the block
    pub slot: usize,
    /// Buffer offset of the op record for the requested PC
    pub offset: usize,
}

/// Translation cache counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Blocks written to the instruction buffer
    pub compiles: u64,
    pub flushes: u64,
    pub invalidations: u64,
    /// Bytes of the instruction buffer in use
    pub buffer_used: u64,
    /// Valid translation entries
    pub blocks: u64,
}

pub struct TranslationCache {
    table: Vec<TranslationEntry>,
    buffer: InsnBuffer,
    /// Guest start address -> slot, valid entries only
    by_guest: BTreeMap<u32, usize>,
    /// Invalidated slots ready for reuse
    free_slots: Vec<usize>,
    /// Next never-used slot
    next_slot: usize,
    generation: u32,
    /// PC to restore when leaving translated code mid-block
    resume_pc: Option<u32>,
    max_block_insns: usize,
    debug: bool,
    stats: CacheStats,
}

impl TranslationCache {
    /// Allocate the instruction buffer and translation table
    pub fn new(config: &CoreConfig) -> Result<Self, CoreError> {
        let buffer = InsnBuffer::new(config.insn_buffer_size)?;

        let mut table = Vec::new();
        table.try_reserve_exact(config.table_size).map_err(|e| {
            CoreError::Initialization(format!(
                "cannot allocate {} entry translation table: {}",
                config.table_size, e
            ))
        })?;
        table.resize(config.table_size, TranslationEntry::default());

        Ok(TranslationCache {
            table,
            buffer,
            by_guest: BTreeMap::new(),
            free_slots: Vec::new(),
            next_slot: 0,
            generation: 0,
            resume_pc: None,
            max_block_insns: config.max_block_insns.max(1),
            debug: config.debug,
            stats: CacheStats::default(),
        })
    }

    /// Slot of the valid block covering `pc`
    pub fn slot_for(&self, pc: u32) -> Option<usize> {
        let (_, &slot) = self.by_guest.range(..=pc).next_back()?;
        if self.table[slot].covers(pc) {
            Some(slot)
        } else {
            None
        }
    }

    pub fn entry(&self, slot: usize) -> Option<&TranslationEntry> {
        self.table.get(slot)
    }

    /// Entry point for `pc`, compiling a new block on a miss
    ///
    /// Fails with `TableFull` or `BufferExhausted` without changing the cache;
    /// the caller decides whether to flush and retry.
    pub fn translate<B: Bus>(&mut self, pc: u32, bus: &mut B) -> Result<EntryPoint, CoreError> {
        let pc = pc & !3;

        if let Some(slot) = self.slot_for(pc) {
            self.stats.hits += 1;
            let entry = &self.table[slot];
            let index = ((pc - entry.guest_start) / 4) as usize;
            return Ok(EntryPoint {
                slot,
                offset: entry.jump_target + index * OP_RECORD_SIZE,
            });
        }
        self.stats.misses += 1;

        let slot = match self.free_slots.last() {
            Some(&slot) => slot,
            None if self.next_slot < self.table.len() => self.next_slot,
            None => return Err(CoreError::TableFull),
        };

        let block = self.scan(pc, bus);
        let size = BLOCK_HEADER_SIZE + block.len() * OP_RECORD_SIZE;
        if size > self.buffer.available() {
            return Err(CoreError::BufferExhausted {
                requested: size,
                available: self.buffer.available(),
            });
        }

        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&pc.to_le_bytes());
        bytes.extend_from_slice(&(block.len() as u32).to_le_bytes());
        for &(raw, kind) in &block {
            bytes.extend_from_slice(&raw.to_le_bytes());
            bytes.extend_from_slice(&[kind as u8, 0, 0, 0]);
        }
        let start = self.buffer.emit(&bytes)?;

        if self.free_slots.last() == Some(&slot) {
            self.free_slots.pop();
        } else {
            self.next_slot += 1;
        }

        self.generation = self.generation.wrapping_add(1);
        self.table[slot] = TranslationEntry {
            start,
            end: start + size,
            jump_target: start + BLOCK_HEADER_SIZE,
            guest_start: pc,
            guest_last: pc + ((block.len() - 1) * 4) as u32,
            generation: self.generation,
            valid: true,
        };
        self.by_guest.insert(pc, slot);
        self.stats.compiles += 1;

        if self.debug {
            console_log!(
                "[ARMv5] Translated 0x{:08X}..=0x{:08X} into slot {} ({} insns)",
                pc,
                self.table[slot].guest_last,
                slot,
                block.len()
            );
        }

        Ok(EntryPoint {
            slot,
            offset: start + BLOCK_HEADER_SIZE,
        })
    }

    /// Fetch and classify guest instructions from `pc` up to a block end
    fn scan<B: Bus>(&self, pc: u32, bus: &mut B) -> Vec<(u32, OpKind)> {
        let mut guest = GuestBus::new(bus);
        let mut block = Vec::with_capacity(16);
        let mut addr = pc;

        loop {
            let raw = guest.read32(addr, true).unwrap_or(0);
            let kind = classify(raw);
            block.push((raw, kind));

            if is_block_terminator(kind, raw) || block.len() >= self.max_block_insns {
                break;
            }
            addr = match addr.checked_add(4) {
                Some(next) => next,
                None => break,
            };
            // Never run into another valid block
            if self.by_guest.contains_key(&addr) {
                break;
            }
        }
        block
    }

    /// Decode the op record at `offset`
    #[inline(always)]
    pub fn read_op(&self, offset: usize) -> Option<(OpKind, u32)> {
        let record = self.buffer.read(offset, OP_RECORD_SIZE)?;
        let raw = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        Some((OpKind::from_u8(record[4]), raw))
    }

    /// Invalidate every entry and empty the instruction buffer
    pub fn flush(&mut self) {
        for entry in self.table.iter_mut() {
            entry.valid = false;
        }
        self.by_guest.clear();
        self.free_slots.clear();
        self.next_slot = 0;
        self.buffer.reset();
        self.resume_pc = None;
        self.stats.flushes += 1;

        if self.debug {
            console_log!("[ARMv5] Translation cache flushed");
        }
    }

    /// Invalidate one slot; the buffer space stays allocated until a flush
    pub fn invalidate(&mut self, index: usize) {
        let table_size = self.table.len();
        let Some(entry) = self.table.get_mut(index) else {
            console_log!("[ARMv5] Ignoring invalidation of slot {} (table has {})", index, table_size);
            return;
        };
        if !entry.valid {
            return;
        }
        entry.valid = false;
        let guest_start = entry.guest_start;
        self.by_guest.remove(&guest_start);
        self.free_slots.push(index);
        self.stats.invalidations += 1;
    }

    /// Invalidate every block overlapping guest bytes `first..=last`
    pub fn invalidate_range(&mut self, first: u32, last: u32) -> Vec<usize> {
        if first > last {
            return Vec::new();
        }
        let span = (self.max_block_insns * 4) as u32;
        let from = first.saturating_sub(span);
        let hits: Vec<usize> = self
            .by_guest
            .range(from..=last)
            .map(|(_, &slot)| slot)
            .filter(|&slot| self.table[slot].guest_last.saturating_add(3) >= first)
            .collect();

        for &slot in &hits {
            self.invalidate(slot);
        }
        hits
    }

    /// Remember where to resume once translated code is left
    pub fn suspend(&mut self, pc: u32) {
        self.resume_pc = Some(pc);
    }

    /// Write the deferred PC back into R15
    pub fn fix_pc(&mut self, cpu: &mut Cpu) {
        if let Some(pc) = self.resume_pc.take() {
            cpu.regs[15] = pc;
        }
    }

    pub fn buffer_cursor(&self) -> usize {
        self.buffer.cursor()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            buffer_used: self.buffer.cursor() as u64,
            blocks: self.by_guest.len() as u64,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemory;

    fn config(buffer: usize, table: usize) -> CoreConfig {
        CoreConfig {
            insn_buffer_size: buffer,
            table_size: table,
            ..CoreConfig::default()
        }
    }

    /// Store ARM words the way the guest sees them (little-endian)
    fn load_program(mem: &mut SharedMemory, addr: u32, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        mem.load_binary(&bytes, addr).unwrap();
    }

    fn straight_line(mem: &mut SharedMemory) {
        // mov r0, #1; add r0, r0, #1; add r0, r0, #1; b .
        load_program(mem, 0x100, &[0xE3A0_0001, 0xE280_0001, 0xE280_0001, 0xEAFF_FFFE]);
    }

    #[test]
    fn test_translate_hit_returns_same_entry() {
        let mut mem = SharedMemory::with_size(0x1000);
        straight_line(&mut mem);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        let first = cache.translate(0x100, &mut mem).unwrap();
        let second = cache.translate(0x100, &mut mem).unwrap();
        assert_eq!(first, second);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.compiles, 1);
        assert_eq!(stats.blocks, 1);
    }

    #[test]
    fn test_block_at_top_of_address_space() {
        // Unmapped words fetch as 0 (andeq r0, r0, r0), the scan stops at the wrap
        let mut mem = SharedMemory::with_size(0x1000);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        let first = cache.translate(0xFFFF_FFF8, &mut mem).unwrap();
        let second = cache.translate(0xFFFF_FFF8, &mut mem).unwrap();
        assert_eq!(first, second);
        let inner = cache.translate(0xFFFF_FFFC, &mut mem).unwrap();
        assert_eq!(inner.slot, first.slot);
        assert_eq!(inner.offset, first.offset + OP_RECORD_SIZE);

        let entry = *cache.entry(first.slot).unwrap();
        assert_eq!(entry.insn_count(), 2);
        assert_eq!(entry.guest_last, 0xFFFF_FFFC);
        let stats = cache.stats();
        assert_eq!((stats.misses, stats.compiles, stats.blocks), (1, 1, 1));

        assert_eq!(cache.invalidate_range(0xFFFF_FFFF, 0xFFFF_FFFF), vec![first.slot]);
        assert_eq!(cache.slot_for(0xFFFF_FFFC), None);
    }

    #[test]
    fn test_invalidate_empty_range() {
        let mut mem = SharedMemory::with_size(0x1000);
        straight_line(&mut mem);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        cache.translate(0x100, &mut mem).unwrap();
        assert!(cache.invalidate_range(0x104, 0x100).is_empty());
        assert!(cache.invalidate_range(0x110, 0x200).is_empty());
        assert_eq!(cache.stats().blocks, 1);
    }

    #[test]
    fn test_block_layout() {
        let mut mem = SharedMemory::with_size(0x1000);
        straight_line(&mut mem);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        let ep = cache.translate(0x100, &mut mem).unwrap();
        let entry = *cache.entry(ep.slot).unwrap();
        assert_eq!(entry.start, 0);
        assert_eq!(entry.jump_target, BLOCK_HEADER_SIZE);
        assert_eq!(entry.insn_count(), 4);
        assert_eq!((entry.guest_start, entry.guest_last), (0x100, 0x10C));
        assert_eq!(cache.buffer_cursor(), BLOCK_HEADER_SIZE + 4 * OP_RECORD_SIZE);

        assert_eq!(cache.read_op(ep.offset), Some((OpKind::DataProc, 0xE3A0_0001)));
        let last = ep.offset + 3 * OP_RECORD_SIZE;
        assert_eq!(cache.read_op(last), Some((OpKind::Branch, 0xEAFF_FFFE)));
        assert_eq!(entry.guest_addr(last), 0x10C);
        assert_eq!(cache.read_op(entry.end), None);
    }

    #[test]
    fn test_entry_inside_block_reuses_records() {
        let mut mem = SharedMemory::with_size(0x1000);
        straight_line(&mut mem);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        let head = cache.translate(0x100, &mut mem).unwrap();
        let inner = cache.translate(0x108, &mut mem).unwrap();
        assert_eq!(inner.slot, head.slot);
        assert_eq!(inner.offset, head.offset + 2 * OP_RECORD_SIZE);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_scan_stops_before_valid_block() {
        let mut mem = SharedMemory::with_size(0x1000);
        straight_line(&mut mem);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        let tail = cache.translate(0x108, &mut mem).unwrap();
        let head = cache.translate(0x100, &mut mem).unwrap();
        assert_ne!(tail.slot, head.slot);
        let entry = cache.entry(head.slot).unwrap();
        assert_eq!(entry.guest_last, 0x104);
    }

    #[test]
    fn test_block_size_limit() {
        let mut mem = SharedMemory::with_size(0x1000);
        // A long run of nops (mov r0, r0)
        load_program(&mut mem, 0, &[0xE1A0_0000; 100]);
        let mut cfg = config(0x10000, 16);
        cfg.max_block_insns = 10;
        let mut cache = TranslationCache::new(&cfg).unwrap();

        let ep = cache.translate(0, &mut mem).unwrap();
        assert_eq!(cache.entry(ep.slot).unwrap().insn_count(), 10);
    }

    #[test]
    fn test_invalidate_forces_retranslation() {
        let mut mem = SharedMemory::with_size(0x1000);
        straight_line(&mut mem);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        let first = cache.translate(0x100, &mut mem).unwrap();
        let generation = cache.entry(first.slot).unwrap().generation;
        cache.invalidate(first.slot);
        assert_eq!(cache.slot_for(0x100), None);

        let second = cache.translate(0x100, &mut mem).unwrap();
        // Slot storage is reused, the block is new
        assert_eq!(second.slot, first.slot);
        assert_ne!(second.offset, first.offset);
        assert!(cache.entry(second.slot).unwrap().generation > generation);
    }

    #[test]
    fn test_invalidate_out_of_range_is_ignored() {
        let mut cache = TranslationCache::new(&config(0x100, 4)).unwrap();
        cache.invalidate(4);
        cache.invalidate(usize::MAX);
        assert_eq!(cache.stats().invalidations, 0);
    }

    #[test]
    fn test_flush_resets_cursor() {
        let mut mem = SharedMemory::with_size(0x1000);
        straight_line(&mut mem);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        cache.translate(0x100, &mut mem).unwrap();
        cache.flush();
        assert_eq!(cache.buffer_cursor(), 0);
        assert_eq!(cache.slot_for(0x100), None);

        cache.translate(0x100, &mut mem).unwrap();
        assert_eq!(cache.stats().misses, 2);
        assert_eq!(cache.stats().flushes, 1);
    }

    #[test]
    fn test_exhaustion_leaves_cache_untouched() {
        let mut mem = SharedMemory::with_size(0x1000);
        straight_line(&mut mem);
        // Room for the header and two records only
        let mut cache = TranslationCache::new(&config(24, 16)).unwrap();

        let err = cache.translate(0x100, &mut mem).unwrap_err();
        assert_eq!(err, CoreError::BufferExhausted { requested: 40, available: 24 });
        assert_eq!(cache.buffer_cursor(), 0);
        assert_eq!(cache.stats().compiles, 0);
        assert_eq!(cache.slot_for(0x100), None);
    }

    #[test]
    fn test_table_full() {
        let mut mem = SharedMemory::with_size(0x1000);
        // Two separate branch-terminated blocks
        load_program(&mut mem, 0x100, &[0xEAFF_FFFE, 0xEAFF_FFFE]);
        let mut cache = TranslationCache::new(&config(0x1000, 1)).unwrap();

        cache.translate(0x100, &mut mem).unwrap();
        assert_eq!(cache.translate(0x104, &mut mem), Err(CoreError::TableFull));
    }

    #[test]
    fn test_invalidate_range() {
        let mut mem = SharedMemory::with_size(0x1000);
        load_program(&mut mem, 0x100, &[0xEAFF_FFFE, 0xEAFF_FFFE, 0xEAFF_FFFE]);
        let mut cache = TranslationCache::new(&config(0x1000, 16)).unwrap();

        let a = cache.translate(0x100, &mut mem).unwrap();
        let b = cache.translate(0x104, &mut mem).unwrap();
        let c = cache.translate(0x108, &mut mem).unwrap();

        let hit = cache.invalidate_range(0x106, 0x10A);
        assert_eq!(hit, vec![b.slot, c.slot]);
        assert!(cache.slot_for(0x100) == Some(a.slot));
        assert_eq!(cache.slot_for(0x104), None);
    }

    #[test]
    fn test_fix_pc_applies_once() {
        let mut cache = TranslationCache::new(&config(0x100, 4)).unwrap();
        let mut cpu = Cpu::new();
        cache.suspend(0x2000);
        cache.fix_pc(&mut cpu);
        assert_eq!(cpu.pc(), 0x2000);
        cpu.regs[15] = 0x3000;
        cache.fix_pc(&mut cpu);
        assert_eq!(cpu.pc(), 0x3000);
    }
}
