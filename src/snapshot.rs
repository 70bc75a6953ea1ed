//! CPU state snapshots
//!
//! Two formats:
//! - A fixed little-endian layout, byte-compatible with existing save files.
//!   Field order and widths never change.
//! - A versioned, zstd-compressed bincode snapshot for host-side tooling.
//!
//! Fixed layout (175 bytes):
//! ```text
//! regs[16]              u32 x16
//! cpsr, spsr            u32 x2
//! banks usr,svc,abt,und,irq,fiq: r13, r14, spsr   u32 x18
//! extra_regs[5]         u32 x5
//! waiting_irqs, waiting_fiqs, cpar                u16 x3
//! vector_base           u32
//! service_request       u8
//! ```

use serde::{Serialize, Deserialize};

use crate::system::ArmCore;
use crate::cpu::{Cpu, NUM_BANKS, NUM_EXTRA_REGS};
use crate::error::CoreError;
use crate::memory::Bus;

/// Size of the fixed-layout state in bytes
pub const STATE_SIZE: usize = 16 * 4 + 2 * 4 + NUM_BANKS * 3 * 4 + NUM_EXTRA_REGS * 4 + 3 * 2 + 4 + 1;

/// Size of the fixed-layout state in bytes
pub fn state_size() -> usize {
    STATE_SIZE
}

struct StateWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl StateWriter<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn u16(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }
}

struct StateReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl StateReader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }
}

impl<B: Bus> ArmCore<B> {
    /// Write the fixed-layout state into the start of `buf`
    pub fn save_state(&self, buf: &mut [u8]) -> Result<(), CoreError> {
        if buf.len() < STATE_SIZE {
            return Err(CoreError::StateBufferTooSmall { needed: STATE_SIZE, got: buf.len() });
        }

        let cpu = &self.cpu;
        let mut w = StateWriter { buf, pos: 0 };
        for &reg in &cpu.regs {
            w.u32(reg);
        }
        w.u32(cpu.cpsr);
        w.u32(cpu.spsr);
        for bank in &cpu.banks {
            w.u32(bank.r13);
            w.u32(bank.r14);
            w.u32(bank.spsr);
        }
        for &reg in &cpu.extra_regs {
            w.u32(reg);
        }
        w.u16(cpu.waiting_irqs);
        w.u16(cpu.waiting_fiqs);
        w.u16(cpu.cpar);
        w.u32(cpu.vector_base);
        w.put(&[self.service_request as u8]);
        Ok(())
    }

    /// Restore state written by [`ArmCore::save_state`]
    ///
    /// Translated code is left alone; the host flushes when guest memory
    /// changed along with the state.
    pub fn load_state(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        if buf.len() < STATE_SIZE {
            return Err(CoreError::StateBufferTooSmall { needed: STATE_SIZE, got: buf.len() });
        }

        let mut r = StateReader { buf, pos: 0 };
        let mut cpu = Cpu::new();
        for reg in cpu.regs.iter_mut() {
            *reg = r.u32();
        }
        cpu.cpsr = r.u32();
        cpu.spsr = r.u32();
        for bank in cpu.banks.iter_mut() {
            bank.r13 = r.u32();
            bank.r14 = r.u32();
            bank.spsr = r.u32();
        }
        for reg in cpu.extra_regs.iter_mut() {
            *reg = r.u32();
        }
        cpu.waiting_irqs = r.u16();
        cpu.waiting_fiqs = r.u16();
        cpu.cpar = r.u16();
        cpu.vector_base = r.u32();
        let service_request = r.take::<1>()[0] != 0;

        self.cpu = cpu;
        self.service_request = service_request;
        Ok(())
    }

    /// Capture the CPU state as a compressed snapshot
    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            version: CpuSnapshot::VERSION,
            cpu: self.cpu.clone(),
            service_request: self.service_request,
        }
    }

    pub fn restore_snapshot(&mut self, snapshot: &CpuSnapshot) {
        self.cpu = snapshot.cpu.clone();
        self.service_request = snapshot.service_request;
    }
}

/// Versioned CPU snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    /// Version for compatibility checking
    pub version: u32,
    pub cpu: Cpu,
    pub service_request: bool,
}

impl CpuSnapshot {
    /// Current snapshot version
    pub const VERSION: u32 = 1;

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| CoreError::Snapshot(format!("Serialization error: {}", e)))?;

        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|e| CoreError::Snapshot(format!("Compression error: {}", e)))
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, CoreError> {
        let decompressed = zstd::stream::decode_all(data)
            .map_err(|e| CoreError::Snapshot(format!("Decompression error: {}", e)))?;

        let snapshot: CpuSnapshot = bincode::deserialize(&decompressed)
            .map_err(|e| CoreError::Snapshot(format!("Deserialization error: {}", e)))?;

        if snapshot.version != Self::VERSION {
            return Err(CoreError::Snapshot(format!(
                "Snapshot version mismatch: expected {}, got {}",
                Self::VERSION,
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}
