//! Shared memory bus
//!
//! The ARM core does not own memory. Every access goes through the bus of the
//! primary (big-endian) CPU, reached via the bridge in [`bridge`].
//!
//! Bus values are in the primary CPU's numeric convention: a 16/32-bit value
//! read at `addr` is assembled from bytes stored most-significant first.

pub mod bridge;

/// Bus interface of the primary CPU
pub trait Bus {
    fn read8(&mut self, addr: u32) -> u8;
    fn write8(&mut self, addr: u32, value: u8);
    fn read16(&mut self, addr: u32) -> u16;
    fn write16(&mut self, addr: u32, value: u16);
    fn read32(&mut self, addr: u32) -> u32;
    fn write32(&mut self, addr: u32, value: u32);
}

/// Big-endian RAM mapped at address 0, shared by both CPUs
pub struct SharedMemory {
    ram: Vec<u8>,
}

impl SharedMemory {
    pub fn new(ram_size_mb: u32) -> Self {
        Self::with_size((ram_size_mb as usize) * 1024 * 1024)
    }

    /// RAM of an exact byte size
    pub fn with_size(bytes: usize) -> Self {
        SharedMemory { ram: vec![0u8; bytes] }
    }

    /// Copy raw bytes into RAM
    pub fn load_binary(&mut self, data: &[u8], addr: u32) -> Result<(), String> {
        let Some(offset) = self.in_range(addr, data.len()) else {
            return Err(format!(
                "Binary too large for RAM: 0x{:08x}+{} exceeds {} bytes",
                addr,
                data.len(),
                self.ram.len()
            ));
        };
        self.ram[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy raw bytes out of RAM (unmapped bytes read as zero)
    pub fn read_bytes(&self, addr: u32, len: u32) -> Vec<u8> {
        (0..len)
            .map(|i| {
                self.ram
                    .get(addr.wrapping_add(i) as usize)
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    #[inline(always)]
    fn in_range(&self, addr: u32, len: usize) -> Option<usize> {
        let offset = addr as usize;
        offset
            .checked_add(len)
            .filter(|&end| end <= self.ram.len())
            .map(|_| offset)
    }
}

impl Bus for SharedMemory {
    fn read8(&mut self, addr: u32) -> u8 {
        match self.in_range(addr, 1) {
            Some(offset) => self.ram[offset],
            // Unmapped - return 0
            None => 0,
        }
    }

    fn write8(&mut self, addr: u32, value: u8) {
        if let Some(offset) = self.in_range(addr, 1) {
            self.ram[offset] = value;
        }
    }

    fn read16(&mut self, addr: u32) -> u16 {
        match self.in_range(addr, 2) {
            Some(offset) => u16::from_be_bytes([self.ram[offset], self.ram[offset + 1]]),
            None => 0,
        }
    }

    fn write16(&mut self, addr: u32, value: u16) {
        if let Some(offset) = self.in_range(addr, 2) {
            self.ram[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        }
    }

    fn read32(&mut self, addr: u32) -> u32 {
        match self.in_range(addr, 4) {
            Some(offset) => u32::from_be_bytes([
                self.ram[offset],
                self.ram[offset + 1],
                self.ram[offset + 2],
                self.ram[offset + 3],
            ]),
            None => 0,
        }
    }

    fn write32(&mut self, addr: u32, value: u32) {
        if let Some(offset) = self.in_range(addr, 4) {
            self.ram[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        }
    }
}
