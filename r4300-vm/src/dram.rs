use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

/// Device-local memory access errors.
///
/// The system bus maps these into `BusError` for the CPU.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at {0:#x}")]
    OutOfBounds(u64),

    #[error("Invalid or misaligned access at {0:#x}")]
    InvalidAlignment(u64),
}

/// Big-endian RAM backing store.
///
/// Offsets passed to the accessors are relative to `base`.
/// The bus is shared by reference with the debugger, so storage sits
/// behind a lock even though the CPU itself is single-threaded.
pub struct Dram {
    pub base: u64,
    size: usize,
    data: RwLock<Vec<u8>>,
}

impl Dram {
    /// Create a zero-initialised region of `size` bytes.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            size,
            data: RwLock::new(vec![0; size]),
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of `addr` within this region, if it falls inside.
    #[inline(always)]
    pub fn offset(&self, addr: u64) -> Option<u64> {
        let off = addr.wrapping_sub(self.base);
        if off < self.size as u64 {
            Some(off)
        } else {
            None
        }
    }

    fn mem(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn mem_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, offset: u64, width: u64) -> Result<usize, MemoryError> {
        if offset % width != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        let off = offset as usize;
        if offset >= self.size as u64 || off + width as usize > self.size {
            return Err(MemoryError::OutOfBounds(offset));
        }
        Ok(off)
    }

    /// Read `N` naturally aligned bytes at `offset`, in memory order.
    pub fn read_be<const N: usize>(&self, offset: u64) -> Result<[u8; N], MemoryError> {
        let off = self.check(offset, N as u64)?;
        let mem = self.mem();
        let mut buf = [0u8; N];
        buf.copy_from_slice(&mem[off..off + N]);
        Ok(buf)
    }

    pub fn write_be<const N: usize>(&self, offset: u64, bytes: [u8; N]) -> Result<(), MemoryError> {
        let off = self.check(offset, N as u64)?;
        self.mem_mut()[off..off + N].copy_from_slice(&bytes);
        Ok(())
    }

    // ========== BULK OPERATIONS ==========

    /// Write an arbitrary slice starting at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        let off = offset as usize;
        if off.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds(offset));
        }
        self.mem_mut()[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn zero_range(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds(offset as u64));
        }
        self.mem_mut()[offset..offset + len].fill(0);
        Ok(())
    }

    // ========== SNAPSHOT HELPERS ==========

    /// Copy of the whole region.
    pub fn get_data(&self) -> Vec<u8> {
        self.mem().clone()
    }

    /// Replace the whole region. `data` must match the region size.
    pub fn set_data(&self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() != self.size {
            return Err(MemoryError::OutOfBounds(data.len() as u64));
        }
        self.mem_mut().copy_from_slice(data);
        Ok(())
    }
}
