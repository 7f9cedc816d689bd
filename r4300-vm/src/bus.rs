use std::sync::RwLock;

use thiserror::Error;

use crate::dram::{Dram, MemoryError};

/// Size of RDRAM with the expansion pak fitted.
pub const RDRAM_SIZE: usize = 8 * 1024 * 1024;

/// SP DMEM followed by IMEM.
pub const SP_MEM_BASE: u64 = 0x0400_0000;
pub const SP_MEM_SIZE: usize = 0x2000;

/// MIPS interface registers.
pub const MI_BASE: u64 = 0x0430_0000;
pub const MI_SIZE: u64 = 0x10;
const MI_MODE: u64 = 0x00;
const MI_VERSION: u64 = 0x04;
const MI_INTR: u64 = 0x08;
const MI_MASK: u64 = 0x0C;
pub const MI_VERSION_VALUE: u32 = 0x0202_0102;

/// Start of the register window for the RCP and peripheral interfaces.
pub const MMIO_BASE: u64 = 0x0400_0000;
pub const MMIO_END: u64 = 0x0500_0000;

/// Cartridge domain 1, address 2.
pub const ROM_BASE: u64 = 0x1000_0000;

/// Physical-bus failures. These are host-level errors, never guest exceptions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("unmapped physical access at {addr:#010x} ({size} bytes)")]
    Unmapped { addr: u64, size: u8 },

    #[error("misaligned physical access at {0:#010x}")]
    Misaligned(u64),
}

/// MI interrupt lines, in MI_INTR bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Sp,
    Si,
    Ai,
    Vi,
    Pi,
    Dp,
}

impl Interrupt {
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Physical memory and interrupt lines seen by the CPU.
///
/// All methods take `&self` so the bus can be shared with a debugger;
/// implementations use interior mutability for device state.
pub trait Bus: Send + Sync {
    fn read8(&self, addr: u64) -> Result<u8, BusError>;
    fn read16(&self, addr: u64) -> Result<u16, BusError>;
    fn read32(&self, addr: u64) -> Result<u32, BusError>;
    fn read64(&self, addr: u64) -> Result<u64, BusError>;

    fn write8(&self, addr: u64, val: u8) -> Result<(), BusError>;
    fn write16(&self, addr: u64, val: u16) -> Result<(), BusError>;
    fn write32(&self, addr: u64, val: u32) -> Result<(), BusError>;
    fn write64(&self, addr: u64, val: u64) -> Result<(), BusError>;

    fn interrupt_raise(&self, _kind: Interrupt) {}

    fn interrupt_lower(&self, _kind: Interrupt) {}

    /// External Cause.IP bits, using IP numbering (bit 2 is IP2).
    fn pending_interrupts(&self) -> u8 {
        0
    }
}

#[derive(Debug, Default)]
struct MipsInterface {
    mode: u32,
    intr: u32,
    mask: u32,
}

impl MipsInterface {
    fn read(&self, offset: u64) -> u32 {
        match offset {
            MI_MODE => self.mode,
            MI_VERSION => MI_VERSION_VALUE,
            MI_INTR => self.intr,
            MI_MASK => self.mask,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u64, value: u32) {
        match offset {
            MI_MODE => {
                self.mode = (self.mode & !0x7F) | (value & 0x7F);
                // (clear, set) pairs for init, ebus and rdram-reg modes.
                for (clear, set, bit) in [(7, 8, 7), (9, 10, 8), (12, 13, 9)] {
                    if value & (1 << clear) != 0 {
                        self.mode &= !(1 << bit);
                    }
                    if value & (1 << set) != 0 {
                        self.mode |= 1 << bit;
                    }
                }
                if value & (1 << 11) != 0 {
                    self.intr &= !Interrupt::Dp.bit();
                }
            }
            MI_MASK => {
                for line in 0..6 {
                    if value & (1 << (2 * line)) != 0 {
                        self.mask &= !(1 << line);
                    }
                    if value & (1 << (2 * line + 1)) != 0 {
                        self.mask |= 1 << line;
                    }
                }
            }
            // VERSION and INTR are read-only from the CPU side.
            _ => {}
        }
    }
}

/// Reference physical map: RDRAM, SP memory, MI and cartridge ROM.
pub struct SystemBus {
    pub rdram: Dram,
    pub sp_mem: Dram,
    rom: Vec<u8>,
    mi: RwLock<MipsInterface>,
}

impl SystemBus {
    pub fn new(rdram_size: usize) -> Self {
        Self {
            rdram: Dram::new(0, rdram_size),
            sp_mem: Dram::new(SP_MEM_BASE, SP_MEM_SIZE),
            rom: Vec::new(),
            mi: RwLock::new(MipsInterface::default()),
        }
    }

    /// Bus with a cartridge image mapped at `ROM_BASE`.
    pub fn with_rom(rdram_size: usize, rom: Vec<u8>) -> Self {
        let mut bus = Self::new(rdram_size);
        bus.rom = rom;
        bus
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    fn rom_read<const N: usize>(&self, addr: u64) -> Option<[u8; N]> {
        let off = addr.checked_sub(ROM_BASE)? as usize;
        let bytes = self.rom.get(off..off.checked_add(N)?)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Some(buf)
    }

    fn mmio_read32(&self, addr: u64) -> u32 {
        if (MI_BASE..MI_BASE + MI_SIZE).contains(&addr) {
            let mi = self.mi.read().unwrap_or_else(|e| e.into_inner());
            return mi.read(addr - MI_BASE);
        }
        log::warn!("unmodelled MMIO read at {:#010x}", addr);
        0
    }

    fn mmio_write32(&self, addr: u64, value: u32) {
        if (MI_BASE..MI_BASE + MI_SIZE).contains(&addr) {
            let mut mi = self.mi.write().unwrap_or_else(|e| e.into_inner());
            mi.write(addr - MI_BASE, value);
            return;
        }
        log::warn!("unmodelled MMIO write {:#010x} at {:#010x}", value, addr);
    }

    fn is_mmio(addr: u64) -> bool {
        (MMIO_BASE..MMIO_END).contains(&addr)
    }

    fn map_memory_error(addr: u64, size: u8, err: MemoryError) -> BusError {
        match err {
            MemoryError::InvalidAlignment(_) => BusError::Misaligned(addr),
            MemoryError::OutOfBounds(_) => BusError::Unmapped { addr, size },
        }
    }

    /// Read `N` bytes big-endian from wherever `addr` lands.
    fn read_bytes<const N: usize>(&self, addr: u64) -> Result<[u8; N], BusError> {
        let size = N as u8;
        if addr % N as u64 != 0 {
            return Err(BusError::Misaligned(addr));
        }
        for ram in [&self.rdram, &self.sp_mem] {
            if let Some(off) = ram.offset(addr) {
                return ram
                    .read_be::<N>(off)
                    .map_err(|e| Self::map_memory_error(addr, size, e));
            }
        }
        if Self::is_mmio(addr) {
            // Registers are word wide; narrower reads pick bytes out of the word.
            let word = self.mmio_read32(addr & !3).to_be_bytes();
            let mut buf = [0u8; N];
            match N {
                8 => {
                    buf[..4].copy_from_slice(&word);
                    buf[4..].copy_from_slice(&self.mmio_read32(addr + 4).to_be_bytes());
                }
                _ => {
                    let start = (addr & 3) as usize;
                    buf.copy_from_slice(&word[start..start + N]);
                }
            }
            return Ok(buf);
        }
        if let Some(buf) = self.rom_read::<N>(addr) {
            return Ok(buf);
        }
        Err(BusError::Unmapped { addr, size })
    }

    fn write_bytes<const N: usize>(&self, addr: u64, bytes: [u8; N]) -> Result<(), BusError> {
        let size = N as u8;
        if addr % N as u64 != 0 {
            return Err(BusError::Misaligned(addr));
        }
        for ram in [&self.rdram, &self.sp_mem] {
            if let Some(off) = ram.offset(addr) {
                return ram
                    .write_be(off, bytes)
                    .map_err(|e| Self::map_memory_error(addr, size, e));
            }
        }
        if Self::is_mmio(addr) {
            match N {
                4 => self.mmio_write32(addr, u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                8 => {
                    self.mmio_write32(addr, u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
                    self.mmio_write32(addr + 4, u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]));
                }
                _ => log::warn!("ignored {}-byte MMIO write at {:#010x}", N, addr),
            }
            return Ok(());
        }
        if addr >= ROM_BASE && ((addr - ROM_BASE) as usize) < self.rom.len() {
            log::warn!("ignored write to cartridge ROM at {:#010x}", addr);
            return Ok(());
        }
        Err(BusError::Unmapped { addr, size })
    }
}

impl Bus for SystemBus {
    fn read8(&self, addr: u64) -> Result<u8, BusError> {
        self.read_bytes::<1>(addr).map(|b| b[0])
    }

    fn read16(&self, addr: u64) -> Result<u16, BusError> {
        self.read_bytes(addr).map(u16::from_be_bytes)
    }

    fn read32(&self, addr: u64) -> Result<u32, BusError> {
        self.read_bytes(addr).map(u32::from_be_bytes)
    }

    fn read64(&self, addr: u64) -> Result<u64, BusError> {
        self.read_bytes(addr).map(u64::from_be_bytes)
    }

    fn write8(&self, addr: u64, val: u8) -> Result<(), BusError> {
        self.write_bytes(addr, [val])
    }

    fn write16(&self, addr: u64, val: u16) -> Result<(), BusError> {
        self.write_bytes(addr, val.to_be_bytes())
    }

    fn write32(&self, addr: u64, val: u32) -> Result<(), BusError> {
        self.write_bytes(addr, val.to_be_bytes())
    }

    fn write64(&self, addr: u64, val: u64) -> Result<(), BusError> {
        self.write_bytes(addr, val.to_be_bytes())
    }

    fn interrupt_raise(&self, kind: Interrupt) {
        let mut mi = self.mi.write().unwrap_or_else(|e| e.into_inner());
        mi.intr |= kind.bit();
    }

    fn interrupt_lower(&self, kind: Interrupt) {
        let mut mi = self.mi.write().unwrap_or_else(|e| e.into_inner());
        mi.intr &= !kind.bit();
    }

    fn pending_interrupts(&self) -> u8 {
        let mi = self.mi.read().unwrap_or_else(|e| e.into_inner());
        if mi.intr & mi.mask != 0 { 1 << 2 } else { 0 }
    }
}
