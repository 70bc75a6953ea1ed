//! Instruction buffer
//!
//! One fixed-capacity arena holding every translated block. Space is handed
//! out by bumping a cursor and only reclaimed all at once by `reset`.

use crate::error::CoreError;

pub struct InsnBuffer {
    data: Box<[u8]>,
    cursor: usize,
}

impl InsnBuffer {
    /// Allocate an arena of `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, CoreError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|e| {
            CoreError::Initialization(format!(
                "cannot allocate {} byte instruction buffer: {}",
                capacity, e
            ))
        })?;
        data.resize(capacity, 0);
        Ok(InsnBuffer {
            data: data.into_boxed_slice(),
            cursor: 0,
        })
    }

    /// Append `bytes` at the cursor, returning their offset
    pub fn emit(&mut self, bytes: &[u8]) -> Result<usize, CoreError> {
        if bytes.len() > self.available() {
            return Err(CoreError::BufferExhausted {
                requested: bytes.len(),
                available: self.available(),
            });
        }
        let offset = self.cursor;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
        Ok(offset)
    }

    /// Bytes previously emitted at `offset`
    #[inline(always)]
    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.cursor {
            return None;
        }
        Some(&self.data[offset..end])
    }

    #[inline(always)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn available(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Drop everything emitted so far
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_allocation() {
        let mut buffer = InsnBuffer::new(32).unwrap();
        assert_eq!(buffer.emit(&[1, 2, 3, 4]).unwrap(), 0);
        assert_eq!(buffer.emit(&[5; 8]).unwrap(), 4);
        assert_eq!(buffer.cursor(), 12);
        assert_eq!(buffer.available(), 20);
        assert_eq!(buffer.read(0, 4), Some(&[1u8, 2, 3, 4][..]));
        // Past the cursor is not readable
        assert_eq!(buffer.read(8, 8), None);
    }

    #[test]
    fn test_exhaustion() {
        let mut buffer = InsnBuffer::new(16).unwrap();
        buffer.emit(&[0; 12]).unwrap();
        assert_eq!(
            buffer.emit(&[0; 8]),
            Err(CoreError::BufferExhausted { requested: 8, available: 4 })
        );
        // A failed emit leaves the cursor alone
        assert_eq!(buffer.cursor(), 12);
    }

    #[test]
    fn test_reset_reclaims_everything() {
        let mut buffer = InsnBuffer::new(16).unwrap();
        buffer.emit(&[0; 16]).unwrap();
        assert_eq!(buffer.available(), 0);
        buffer.reset();
        assert_eq!(buffer.cursor(), 0);
        assert_eq!(buffer.available(), buffer.capacity());
    }

    #[test]
    fn test_oversized_allocation_fails() {
        assert!(matches!(
            InsnBuffer::new(usize::MAX),
            Err(CoreError::Initialization(_))
        ));
    }
}
