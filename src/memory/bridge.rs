//! ARM <-> primary bus bridge
//!
//! Address map seen by the ARM core:
//! 0x00000000 - 0x1FFFFFFF: Normal access, passed through unchanged
//! 0x20000000 - 0x3FFFFFFF: Mirrored range, real address = address ^ 0x20000002
//!
//! The mirror lets 16-bit aligned buffers handed over by the primary CPU be
//! addressed by the ARM side with a 2-byte shift.
//!
//! Guest values are little-endian, the bus is big-endian: 16 and 32-bit values
//! are byte-swapped on the way through, so bytes land in memory in guest order.

use super::Bus;
use crate::console_log;

/// First address of the mirrored window
pub const MIRROR_BASE: u32 = 0x2000_0000;
/// End (exclusive) of the mirrored window
pub const MIRROR_END: u32 = 0x4000_0000;
/// Folding constant (clears the window bit, adds the 2-byte shift)
pub const MIRROR_FOLD: u32 = 0x2000_0002;

/// Fault status reported for an access of unsupported width
pub const FSR_ALIGNMENT: u8 = 0b0001;

/// Map a mirrored address onto the canonical range
#[inline(always)]
pub fn fold_address(addr: u32) -> u32 {
    if (MIRROR_BASE..MIRROR_END).contains(&addr) {
        addr ^ MIRROR_FOLD
    } else {
        addr
    }
}

/// Perform one guest access of `size` bytes
///
/// `buf` holds the value in guest (little-endian) byte order. Sizes other
/// than 1, 2 and 4 are logged and rejected without touching the bus.
/// `privileged` is accepted for interface parity; the shared bus has no
/// protection.
pub fn access(
    bus: &mut impl Bus,
    vaddr: u32,
    buf: &mut [u8],
    size: u8,
    write: bool,
    _privileged: bool,
    fsr: &mut u8,
) -> bool {
    let addr = fold_address(vaddr);
    let valid = matches!(size, 1 | 2 | 4) && buf.len() >= size as usize;

    if !valid {
        if write {
            console_log!("Invalid ARMv5 write: address:0x{:08X}, size:{}", addr, size as u32 * 8);
        } else {
            console_log!("Invalid ARMv5 read: address:0x{:08X}, size:{}", addr, size as u32 * 8);
        }
        *fsr = FSR_ALIGNMENT;
        return false;
    }

    if write {
        match size {
            1 => bus.write8(addr, buf[0]),
            2 => bus.write16(addr, u16::from_le_bytes([buf[0], buf[1]]).swap_bytes()),
            _ => bus.write32(
                addr,
                u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]).swap_bytes(),
            ),
        }
    } else {
        match size {
            1 => buf[0] = bus.read8(addr),
            2 => buf[..2].copy_from_slice(&bus.read16(addr).swap_bytes().to_le_bytes()),
            _ => buf[..4].copy_from_slice(&bus.read32(addr).swap_bytes().to_le_bytes()),
        }
    }
    true
}

/// Typed view over [`access`] used by the instruction executor
///
/// Records the guest address range written during the current instruction
/// (for self-modifying code detection) and the last access fault.
pub struct GuestBus<'a, B: Bus> {
    bus: &'a mut B,
    /// First and last (inclusive) guest byte written
    pub written: Option<(u32, u32)>,
    /// Guest address and fault status of the last failed access
    pub fault: Option<(u32, u8)>,
}

impl<'a, B: Bus> GuestBus<'a, B> {
    pub fn new(bus: &'a mut B) -> Self {
        GuestBus {
            bus,
            written: None,
            fault: None,
        }
    }

    fn read(&mut self, addr: u32, size: u8, privileged: bool) -> Option<u32> {
        let mut buf = [0u8; 4];
        let mut fsr = 0u8;
        if access(&mut *self.bus, addr, &mut buf, size, false, privileged, &mut fsr) {
            Some(u32::from_le_bytes(buf))
        } else {
            self.fault = Some((addr, fsr));
            None
        }
    }

    fn write(&mut self, addr: u32, value: u32, size: u8, privileged: bool) -> bool {
        let mut buf = value.to_le_bytes();
        let mut fsr = 0u8;
        if !access(&mut *self.bus, addr, &mut buf, size, true, privileged, &mut fsr) {
            self.fault = Some((addr, fsr));
            return false;
        }
        let last = addr.saturating_add(size as u32 - 1);
        self.written = Some(match self.written {
            Some((first, prev)) => (first.min(addr), prev.max(last)),
            None => (addr, last),
        });
        true
    }

    pub fn read8(&mut self, addr: u32, privileged: bool) -> Option<u8> {
        self.read(addr, 1, privileged).map(|v| v as u8)
    }

    pub fn read16(&mut self, addr: u32, privileged: bool) -> Option<u16> {
        self.read(addr, 2, privileged).map(|v| v as u16)
    }

    pub fn read32(&mut self, addr: u32, privileged: bool) -> Option<u32> {
        self.read(addr, 4, privileged)
    }

    pub fn write8(&mut self, addr: u32, value: u8, privileged: bool) -> bool {
        self.write(addr, value as u32, 1, privileged)
    }

    pub fn write16(&mut self, addr: u32, value: u16, privileged: bool) -> bool {
        self.write(addr, value as u32, 2, privileged)
    }

    pub fn write32(&mut self, addr: u32, value: u32, privileged: bool) -> bool {
        self.write(addr, value, 4, privileged)
    }
}
