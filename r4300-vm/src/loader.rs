//! Cartridge ROM and ELF loading, plus the simulated PIF boot.

use std::path::Path;

use goblin::elf::{Elf, program_header::PT_LOAD};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bus::SystemBus;
use crate::cpu::Cpu;
use crate::cpu::core::sext32;
use crate::cpu::cp0::{
    CP0_CONFIG, CP0_PRID, CP0_RANDOM, CP0_STATUS, CONFIG_RESET, PRID_R4300I, STATUS_CU0,
    STATUS_CU1,
};
use crate::dram::MemoryError;

/// Header plus boot code (IPL3), copied to SP DMEM by the PIF.
const BOOT_SEGMENT_SIZE: usize = 0x1000;
const HEADER_SIZE: usize = 0x40;
const PIF_ENTRY: u64 = 0xFFFF_FFFF_A400_0040;
const PIF_STATUS: u64 = 0x7040_0004;
const PIF_STACK: u64 = 0xFFFF_FFFF_A400_1FF0;

/// Physical address bits kept when placing ELF segments.
const PHYS_MASK: u64 = 0x1FFF_FFFF;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),

    #[error("image is {0} bytes, too small for a cartridge header")]
    TooSmall(usize),

    #[error("unrecognised cartridge byte order (first word {0:#010x})")]
    UnknownByteOrder(u32),

    #[error("ELF parse error: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("ELF segment {addr:#x}+{size:#x} does not fit in RDRAM")]
    SegmentOutOfRange { addr: u64, size: u64 },

    #[error("ELF segment exceeds file bounds (offset {0:#x})")]
    Truncated(u64),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// On-disk layout of a cartridge dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Native big-endian (`.z64`).
    Z64,
    /// Byte-swapped in 16-bit units (`.v64`).
    V64,
    /// Little-endian words (`.n64`).
    N64,
}

impl ByteOrder {
    pub fn detect(image: &[u8]) -> Result<Self, LoadError> {
        let head: [u8; 4] = image
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(LoadError::TooSmall(image.len()))?;
        match u32::from_be_bytes(head) {
            0x8037_1240 => Ok(ByteOrder::Z64),
            0x3780_4012 => Ok(ByteOrder::V64),
            0x4012_3780 => Ok(ByteOrder::N64),
            other => Err(LoadError::UnknownByteOrder(other)),
        }
    }

    /// Rewrite `image` in place into big-endian order.
    pub fn normalize(self, image: &mut [u8]) {
        match self {
            ByteOrder::Z64 => {}
            ByteOrder::V64 => image.chunks_exact_mut(2).for_each(|c| c.swap(0, 1)),
            ByteOrder::N64 => image.chunks_exact_mut(4).for_each(|c| c.reverse()),
        }
    }
}

/// A cartridge image in big-endian order.
#[derive(Debug, Clone)]
pub struct RomImage {
    pub data: Vec<u8>,
    /// Byte order the image was stored in.
    pub order: ByteOrder,
    /// SHA-256 of the normalised image, hex encoded.
    pub sha256: String,
    pub title: String,
    /// Entry point from the header.
    pub entry: u32,
}

impl RomImage {
    pub fn parse(mut data: Vec<u8>) -> Result<Self, LoadError> {
        if data.len() < HEADER_SIZE {
            return Err(LoadError::TooSmall(data.len()));
        }
        let order = ByteOrder::detect(&data)?;
        order.normalize(&mut data);

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let sha256 = hex::encode(hasher.finalize());

        let title = String::from_utf8_lossy(&data[0x20..0x34])
            .trim_end_matches(['\0', ' '])
            .to_string();
        let entry = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        Ok(Self {
            data,
            order,
            sha256,
            title,
            entry,
        })
    }
}

pub fn load_rom<P: AsRef<Path>>(path: P) -> Result<RomImage, LoadError> {
    let data = std::fs::read(path.as_ref())?;
    let rom = RomImage::parse(data)?;
    log::debug!(
        "ROM {}: \"{}\" {:?}, {} bytes, entry {:#010x}, sha256 {}",
        path.as_ref().display(),
        rom.title,
        rom.order,
        rom.data.len(),
        rom.entry,
        rom.sha256
    );
    Ok(rom)
}

/// Reproduce the state the PIF leaves behind before jumping to IPL3.
///
/// The cartridge must already be mapped on `bus`.
pub fn simulate_pif_boot(cpu: &mut Cpu, bus: &SystemBus) -> Result<(), LoadError> {
    let rom = bus.rom();
    let len = rom.len().min(BOOT_SEGMENT_SIZE);
    bus.sp_mem.write_bytes(0, &rom[..len])?;

    cpu.write_reg(20, 1);
    cpu.write_reg(22, 0x3F);
    cpu.write_reg(29, PIF_STACK);

    cpu.cp0[CP0_RANDOM] = 31;
    cpu.cp0[CP0_PRID] = PRID_R4300I;
    cpu.cp0[CP0_CONFIG] = CONFIG_RESET;
    cpu.cp0.write(CP0_STATUS, PIF_STATUS);

    cpu.set_pc(PIF_ENTRY);
    log::debug!("PIF boot: {} bytes to SP DMEM, pc {:#018x}", len, PIF_ENTRY);
    Ok(())
}

/// Load a bare-metal MIPS ELF into RDRAM and return its entry point.
pub fn load_elf(buffer: &[u8], bus: &SystemBus) -> Result<u64, LoadError> {
    let elf = Elf::parse(buffer)?;
    let rdram_size = bus.rdram.size() as u64;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz;
        let file_offset = ph.p_offset as usize;
        if file_offset.checked_add(file_size).is_none_or(|end| end > buffer.len()) {
            return Err(LoadError::Truncated(ph.p_offset));
        }

        let source = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };
        let target = source & PHYS_MASK;
        if target.checked_add(mem_size).is_none_or(|end| end > rdram_size) {
            return Err(LoadError::SegmentOutOfRange {
                addr: target,
                size: mem_size,
            });
        }

        bus.rdram
            .write_bytes(target, &buffer[file_offset..file_offset + file_size])?;
        if mem_size > file_size as u64 {
            bus.rdram
                .zero_range(target as usize + file_size, (mem_size - file_size as u64) as usize)?;
        }
    }

    let entry = if elf.is_64 { elf.entry } else { sext32(elf.entry as u32) };
    log::debug!(
        "ELF loaded: entry={:#018x}, segments={}",
        entry,
        elf.program_headers.len()
    );
    Ok(entry)
}

/// Kernel mode with COP0 and the FPU usable, fetching from `entry`.
pub fn prepare_elf_boot(cpu: &mut Cpu, entry: u64) {
    cpu.cp0.write(CP0_STATUS, STATUS_CU0 | STATUS_CU1);
    cpu.set_pc(entry);
}
