//! Virtual-to-physical address translation for the R4300i.
//!
//! Translation is a pure function of the virtual address, the access kind,
//! the Status-derived [`Segments`] and the TLB contents. Faults are returned
//! as [`TlbError`]; the CPU core is responsible for latching BadVAddr,
//! Context, XContext and EntryHi before vectoring.

use serde::{Deserialize, Serialize};

use crate::cpu::Mode;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TlbError {
    /// No entry matched the VPN2/ASID.
    Miss,
    /// An entry matched but the selected EntryLo has V clear.
    Invalid,
    /// Store to a page whose D bit is clear.
    Modification,
    /// Address is outside every segment reachable from the current mode.
    DisallowedAddress,
}

pub const TLB_ENTRIES: usize = 32;

/// Writable bits of EntryHi: R, VPN2 and ASID.
pub const ENTRY_HI_MASK: u64 = 0xC000_00FF_FFFF_E0FF;
/// Writable bits of EntryLo: PFN, C, D, V and G.
pub const ENTRY_LO_MASK: u64 = 0x3FFF_FFFF;
/// Writable bits of PageMask.
pub const PAGE_MASK_MASK: u64 = 0x01FF_E000;

const ENTRY_LO_G: u64 = 1 << 0;
const ENTRY_LO_V: u64 = 1 << 1;
const ENTRY_LO_D: u64 = 1 << 2;

/// One of the 32 joint-TLB entries. Each maps an even/odd pair of pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlbEntry {
    pub entry_hi: u64,
    pub entry_lo0: u64,
    pub entry_lo1: u64,
    pub page_mask: u64,
    /// AND of both EntryLo G bits, latched at write time.
    pub global: bool,
    /// Entries that were never written never match.
    pub initialized: bool,
}

impl TlbEntry {
    pub const EMPTY: Self = Self {
        entry_hi: 0,
        entry_lo0: 0,
        entry_lo1: 0,
        page_mask: 0,
        global: false,
        initialized: false,
    };

    /// Build an entry from the CP0 staging registers, applying the write masks.
    pub fn from_cp0(entry_hi: u64, entry_lo0: u64, entry_lo1: u64, page_mask: u64) -> Self {
        let entry_lo0 = entry_lo0 & ENTRY_LO_MASK;
        let entry_lo1 = entry_lo1 & ENTRY_LO_MASK;
        let page_mask = page_mask & PAGE_MASK_MASK;
        Self {
            entry_hi: entry_hi & ENTRY_HI_MASK & !page_mask,
            entry_lo0,
            entry_lo1,
            page_mask,
            global: entry_lo0 & ENTRY_LO_G != 0 && entry_lo1 & ENTRY_LO_G != 0,
            initialized: true,
        }
    }

    #[inline(always)]
    pub const fn asid(&self) -> u8 {
        self.entry_hi as u8
    }

    /// Bits of a virtual address compared against EntryHi (R and VPN2).
    #[inline(always)]
    pub const fn vpn_mask(&self) -> u64 {
        0xC000_00FF_FFFF_E000 & !self.page_mask
    }

    /// Offset bits within one page of the pair.
    #[inline(always)]
    pub const fn offset_mask(&self) -> u64 {
        (self.page_mask | 0x1FFF) >> 1
    }

    #[inline(always)]
    pub fn matches(&self, vaddr: u64, asid: u8) -> bool {
        let mask = self.vpn_mask();
        self.initialized
            && (self.entry_hi & mask) == (vaddr & mask)
            && (self.global || self.asid() == asid)
    }
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// The R4300i joint TLB: 32 fully associative entries.
#[derive(Clone, Debug)]
pub struct Tlb {
    entries: [TlbEntry; TLB_ENTRIES],
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: [TlbEntry::EMPTY; TLB_ENTRIES],
        }
    }

    pub fn entries(&self) -> &[TlbEntry; TLB_ENTRIES] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> TlbEntry {
        self.entries[index % TLB_ENTRIES]
    }

    pub fn write(&mut self, index: usize, entry: TlbEntry) {
        self.entries[index % TLB_ENTRIES] = entry;
    }

    /// Find the first entry matching `vaddr` under `asid`.
    ///
    /// Overlapping entries are resolved in index order.
    pub fn probe(&self, vaddr: u64, asid: u8) -> Option<usize> {
        self.entries.iter().position(|e| e.matches(vaddr, asid))
    }

    /// Translate a mapped address through the TLB.
    pub fn lookup(&self, vaddr: u64, asid: u8, access: AccessType) -> Result<u64, TlbError> {
        let index = self.probe(vaddr, asid).ok_or(TlbError::Miss)?;
        let entry = &self.entries[index];
        let offset_mask = entry.offset_mask();
        let odd = vaddr & (offset_mask + 1) != 0;
        let lo = if odd { entry.entry_lo1 } else { entry.entry_lo0 };

        if lo & ENTRY_LO_V == 0 {
            return Err(TlbError::Invalid);
        }
        if access == AccessType::Store && lo & ENTRY_LO_D == 0 {
            return Err(TlbError::Modification);
        }

        let pfn = (lo >> 6) & 0xF_FFFF;
        Ok((pfn << 12).wrapping_add(vaddr & offset_mask))
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

/// Addressing state derived from CP0.Status on every Status change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segments {
    pub mode: Mode,
    pub kx: bool,
    pub sx: bool,
    pub ux: bool,
}

impl Segments {
    pub fn from_status(status: u64) -> Self {
        Self {
            mode: Mode::from_status(status),
            kx: status & (1 << 7) != 0,
            sx: status & (1 << 6) != 0,
            ux: status & (1 << 5) != 0,
        }
    }

    /// Whether the current mode uses 64-bit addressing.
    pub fn is_64bit(&self) -> bool {
        match self.mode {
            Mode::Kernel => self.kx,
            Mode::Supervisor => self.sx,
            Mode::User => self.ux,
        }
    }

    /// Whether a refill for `vaddr` takes the XTLB vector.
    pub fn is_xtlb(&self, vaddr: u64) -> bool {
        match vaddr >> 62 {
            0b00 => self.ux,
            0b01 => self.sx,
            0b11 => self.kx,
            _ => false,
        }
    }
}

impl Default for Segments {
    fn default() -> Self {
        Self::from_status(0)
    }
}

/// Classification of an address before any TLB lookup.
enum Region {
    Mapped,
    Direct(u64),
    Disallowed,
}

fn region_32(vaddr: u64, mode: Mode) -> Region {
    let low = vaddr as u32;
    match (mode, low) {
        (_, 0x0000_0000..=0x7FFF_FFFF) => Region::Mapped,
        (Mode::Kernel, 0x8000_0000..=0x9FFF_FFFF) => Region::Direct((low - 0x8000_0000) as u64),
        (Mode::Kernel, 0xA000_0000..=0xBFFF_FFFF) => Region::Direct((low - 0xA000_0000) as u64),
        (Mode::Kernel | Mode::Supervisor, 0xC000_0000..=0xDFFF_FFFF) => Region::Mapped,
        (Mode::Kernel, 0xE000_0000..=0xFFFF_FFFF) => Region::Mapped,
        _ => Region::Disallowed,
    }
}

fn region_64(vaddr: u64, mode: Mode) -> Region {
    let kernel = mode == Mode::Kernel;
    let supervisor = mode == Mode::Supervisor;
    match vaddr {
        // xkuseg / xsuseg / xuseg
        0x0000_0000_0000_0000..=0x0000_00FF_FFFF_FFFF => Region::Mapped,
        // xksseg / xsseg
        0x4000_0000_0000_0000..=0x4000_00FF_FFFF_FFFF if kernel || supervisor => Region::Mapped,
        // xkphys: unmapped, cacheability in bits 61:59, bits 58:32 must be zero
        0x8000_0000_0000_0000..=0xBFFF_FFFF_FFFF_FFFF if kernel => {
            if (vaddr >> 32) & 0x07FF_FFFF != 0 {
                Region::Disallowed
            } else {
                Region::Direct(vaddr & 0xFFFF_FFFF)
            }
        }
        // xkseg
        0xC000_0000_0000_0000..=0xC000_00FF_7FFF_FFFF if kernel => Region::Mapped,
        // ckseg0 / ckseg1
        0xFFFF_FFFF_8000_0000..=0xFFFF_FFFF_9FFF_FFFF if kernel => {
            Region::Direct(vaddr - 0xFFFF_FFFF_8000_0000)
        }
        0xFFFF_FFFF_A000_0000..=0xFFFF_FFFF_BFFF_FFFF if kernel => {
            Region::Direct(vaddr - 0xFFFF_FFFF_A000_0000)
        }
        // cksseg / csseg
        0xFFFF_FFFF_C000_0000..=0xFFFF_FFFF_DFFF_FFFF if kernel || supervisor => Region::Mapped,
        // ckseg3
        0xFFFF_FFFF_E000_0000..=0xFFFF_FFFF_FFFF_FFFF if kernel => Region::Mapped,
        _ => Region::Disallowed,
    }
}

/// Resolve `vaddr` to a physical address.
pub fn resolve(
    tlb: &Tlb,
    segments: &Segments,
    asid: u8,
    vaddr: u64,
    access: AccessType,
) -> Result<u64, TlbError> {
    let region = if segments.is_64bit() {
        region_64(vaddr, segments.mode)
    } else {
        // In 32-bit mode every address must be a sign-extended word.
        if vaddr != vaddr as u32 as i32 as i64 as u64 {
            return Err(TlbError::DisallowedAddress);
        }
        region_32(vaddr, segments.mode)
    };

    match region {
        Region::Direct(paddr) => Ok(paddr),
        Region::Mapped => tlb.lookup(vaddr, asid, access),
        Region::Disallowed => Err(TlbError::DisallowedAddress),
    }
}
