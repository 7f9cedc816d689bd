use std::ops::{Index, IndexMut};

use crate::mmu::{
    ENTRY_HI_MASK, ENTRY_LO_MASK, PAGE_MASK_MASK, Segments, TLB_ENTRIES, Tlb, TlbError,
};

// CP0 register numbers.
pub const CP0_INDEX: usize = 0;
pub const CP0_RANDOM: usize = 1;
pub const CP0_ENTRY_LO0: usize = 2;
pub const CP0_ENTRY_LO1: usize = 3;
pub const CP0_CONTEXT: usize = 4;
pub const CP0_PAGE_MASK: usize = 5;
pub const CP0_WIRED: usize = 6;
pub const CP0_BAD_VADDR: usize = 8;
pub const CP0_COUNT: usize = 9;
pub const CP0_ENTRY_HI: usize = 10;
pub const CP0_COMPARE: usize = 11;
pub const CP0_STATUS: usize = 12;
pub const CP0_CAUSE: usize = 13;
pub const CP0_EPC: usize = 14;
pub const CP0_PRID: usize = 15;
pub const CP0_CONFIG: usize = 16;
pub const CP0_LLADDR: usize = 17;
pub const CP0_WATCH_LO: usize = 18;
pub const CP0_WATCH_HI: usize = 19;
pub const CP0_XCONTEXT: usize = 20;
pub const CP0_PARITY_ERROR: usize = 26;
pub const CP0_CACHE_ERROR: usize = 27;
pub const CP0_TAG_LO: usize = 28;
pub const CP0_TAG_HI: usize = 29;
pub const CP0_ERROR_EPC: usize = 30;

// Status bits.
pub const STATUS_IE: u64 = 1 << 0;
pub const STATUS_EXL: u64 = 1 << 1;
pub const STATUS_ERL: u64 = 1 << 2;
pub const STATUS_BEV: u64 = 1 << 22;
pub const STATUS_FR: u64 = 1 << 26;
pub const STATUS_CU0: u64 = 1 << 28;
pub const STATUS_CU1: u64 = 1 << 29;
pub const STATUS_CU2: u64 = 1 << 30;

// Cause bits.
pub const CAUSE_BD: u64 = 1 << 31;
pub const CAUSE_IP7: u64 = 1 << 15;
const CAUSE_SOFTWARE_IP: u64 = 0x300;
const CAUSE_EXTERNAL_IP: u64 = 0x7C00;
const CAUSE_EXC_CODE: u64 = 0x7C;
const CAUSE_CE: u64 = 0x3000_0000;

const STATUS_WRITE_MASK: u64 = 0xFF57_FFFF;
const CONFIG_WRITE_MASK: u64 = 0x0F00_800F;
const INDEX_WRITE_MASK: u64 = 0x8000_003F;
const CONTEXT_PTE_BASE: u64 = !0x7F_FFFF;
const XCONTEXT_PTE_BASE: u64 = !0x1_FFFF_FFFF;

/// Raw Count advances at twice the rate the guest observes.
const COUNT_MASK: u64 = 0x1_FFFF_FFFF;

pub const PRID_R4300I: u64 = 0x0B00;
pub const CONFIG_RESET: u64 = 0x0006_E463;

/// Registers that hold full 64-bit values.
pub fn is_doubleword(reg: usize) -> bool {
    matches!(
        reg,
        CP0_ENTRY_LO0
            | CP0_ENTRY_LO1
            | CP0_CONTEXT
            | CP0_BAD_VADDR
            | CP0_ENTRY_HI
            | CP0_EPC
            | CP0_XCONTEXT
            | CP0_ERROR_EPC
    )
}

/// Register numbers with no storage on the R4300i.
pub fn is_reserved(reg: usize) -> bool {
    matches!(reg, 7 | 21..=25 | 31)
}

/// System control coprocessor: register storage, TLB and the state derived
/// from Status.
pub struct Cp0 {
    regs: [u64; 32],
    /// Half-rate counter; Count reads return `count >> 1`.
    count: u64,
    /// Last value moved into any CP0 register. Reserved registers read it back.
    latch: u64,
    pub tlb: Tlb,
    /// Fault kind of the most recent translation failure, consumed by the
    /// dispatcher to choose between refill and general vectors.
    pub tlb_error: Option<TlbError>,
    segments: Segments,
    /// `Cause.IP & Status.IM`, recomputed whenever either side changes.
    interrupts: u8,
}

impl Cp0 {
    pub fn new() -> Self {
        let mut cp0 = Self {
            regs: [0; 32],
            count: 0,
            latch: 0,
            tlb: Tlb::new(),
            tlb_error: None,
            segments: Segments::default(),
            interrupts: 0,
        };
        cp0.regs[CP0_RANDOM] = (TLB_ENTRIES - 1) as u64;
        cp0.regs[CP0_CAUSE] = 0xB000_007C;
        cp0.regs[CP0_PRID] = PRID_R4300I;
        cp0.regs[CP0_CONFIG] = CONFIG_RESET;
        cp0.status_updated();
        cp0
    }

    /// Architectural read of a CP0 register (full width).
    pub fn read(&self, reg: usize) -> u64 {
        match reg {
            CP0_COUNT => (self.count >> 1) & 0xFFFF_FFFF,
            CP0_INDEX => self.regs[CP0_INDEX] & INDEX_WRITE_MASK,
            CP0_ENTRY_HI => self.regs[CP0_ENTRY_HI] & ENTRY_HI_MASK,
            r if is_reserved(r) => self.latch,
            r => self.regs[r & 31],
        }
    }

    /// Architectural write of a CP0 register, applying write masks and side
    /// effects.
    pub fn write(&mut self, reg: usize, value: u64) {
        self.latch = value;
        match reg {
            CP0_INDEX => self.regs[CP0_INDEX] = value & INDEX_WRITE_MASK,
            CP0_RANDOM | CP0_BAD_VADDR | CP0_PRID | CP0_CACHE_ERROR => {}
            CP0_ENTRY_LO0 | CP0_ENTRY_LO1 => self.regs[reg] = value & ENTRY_LO_MASK,
            CP0_CONTEXT => {
                let old = self.regs[CP0_CONTEXT];
                self.regs[CP0_CONTEXT] = (old & !CONTEXT_PTE_BASE) | (value & CONTEXT_PTE_BASE);
            }
            CP0_PAGE_MASK => self.regs[CP0_PAGE_MASK] = value & PAGE_MASK_MASK,
            CP0_WIRED => {
                self.regs[CP0_WIRED] = value & 0x3F;
                self.regs[CP0_RANDOM] = (TLB_ENTRIES - 1) as u64;
            }
            CP0_COUNT => self.count = ((value & 0xFFFF_FFFF) << 1) & COUNT_MASK,
            CP0_ENTRY_HI => self.regs[CP0_ENTRY_HI] = value & ENTRY_HI_MASK,
            CP0_COMPARE => {
                self.regs[CP0_COMPARE] = value & 0xFFFF_FFFF;
                self.regs[CP0_CAUSE] &= !CAUSE_IP7;
                self.update_interrupts();
            }
            CP0_STATUS => {
                self.regs[CP0_STATUS] = value & STATUS_WRITE_MASK;
                self.status_updated();
            }
            CP0_CAUSE => {
                let old = self.regs[CP0_CAUSE];
                self.regs[CP0_CAUSE] = (old & !CAUSE_SOFTWARE_IP) | (value & CAUSE_SOFTWARE_IP);
                self.update_interrupts();
            }
            CP0_EPC | CP0_ERROR_EPC => self.regs[reg] = value,
            CP0_CONFIG => {
                let old = self.regs[CP0_CONFIG];
                self.regs[CP0_CONFIG] = (old & !CONFIG_WRITE_MASK) | (value & CONFIG_WRITE_MASK);
            }
            CP0_XCONTEXT => {
                let old = self.regs[CP0_XCONTEXT];
                self.regs[CP0_XCONTEXT] =
                    (old & !XCONTEXT_PTE_BASE) | (value & XCONTEXT_PTE_BASE);
            }
            CP0_PARITY_ERROR => self.regs[CP0_PARITY_ERROR] = value & 0xFF,
            CP0_LLADDR | CP0_WATCH_LO | CP0_WATCH_HI | CP0_TAG_LO | CP0_TAG_HI => {
                self.regs[reg] = value & 0xFFFF_FFFF
            }
            _ => {}
        }
    }

    /// Recompute the mode and addressing flags after a Status change.
    pub fn status_updated(&mut self) {
        self.segments = Segments::from_status(self.regs[CP0_STATUS]);
        self.update_interrupts();
    }

    fn update_interrupts(&mut self) {
        let ip = (self.regs[CP0_CAUSE] >> 8) & 0xFF;
        let im = (self.regs[CP0_STATUS] >> 8) & 0xFF;
        self.interrupts = (ip & im) as u8;
    }

    pub fn segments(&self) -> &Segments {
        &self.segments
    }

    pub fn interrupts(&self) -> u8 {
        self.interrupts
    }

    /// True when a pending, unmasked interrupt should be taken now.
    pub fn interrupt_ready(&self) -> bool {
        let status = self.regs[CP0_STATUS];
        self.interrupts != 0
            && status & STATUS_IE != 0
            && status & (STATUS_EXL | STATUS_ERL) == 0
    }

    /// Drive Cause.IP6:IP2 from the external interrupt lines. `pending` uses
    /// the IP bit numbering (bit 2 is IP2).
    pub fn set_external_interrupts(&mut self, pending: u8) {
        let ip = ((pending as u64) << 8) & CAUSE_EXTERNAL_IP;
        let cause = self.regs[CP0_CAUSE];
        if cause & CAUSE_EXTERNAL_IP != ip {
            self.regs[CP0_CAUSE] = (cause & !CAUSE_EXTERNAL_IP) | ip;
            self.update_interrupts();
        }
    }

    /// Advance Count and Random by one retired instruction's worth of cycles.
    pub fn tick(&mut self, cycles: u64) {
        let old = self.count >> 1;
        self.count = (self.count + cycles) & COUNT_MASK;
        let new = self.count >> 1;

        let compare = self.regs[CP0_COMPARE];
        let fired = if new >= old {
            old < compare && compare <= new
        } else {
            compare > old || compare <= new
        };
        if fired {
            self.regs[CP0_CAUSE] |= CAUSE_IP7;
            self.update_interrupts();
        }

        let wired = self.regs[CP0_WIRED];
        let random = self.regs[CP0_RANDOM];
        self.regs[CP0_RANDOM] = if random <= wired || random == 0 {
            (TLB_ENTRIES - 1) as u64
        } else {
            random - 1
        };
    }

    /// Raw half-rate counter, for snapshots.
    pub fn raw_count(&self) -> u64 {
        self.count
    }

    /// Latch value returned by reserved registers.
    pub fn latch(&self) -> u64 {
        self.latch
    }

    /// Overwrite storage without masks or side effects, then recompute
    /// derived state. Used by snapshot restore and the boot sequence.
    pub fn load_raw(&mut self, regs: &[u64; 32], count: u64, latch: u64) {
        self.regs = *regs;
        self.count = count & COUNT_MASK;
        self.latch = latch;
        self.status_updated();
    }

    pub fn raw_regs(&self) -> &[u64; 32] {
        &self.regs
    }

    /// Record ExcCode and CE in Cause.
    pub fn set_exception_cause(&mut self, code: u64, coprocessor: u8) {
        let cause = self.regs[CP0_CAUSE] & !(CAUSE_EXC_CODE | CAUSE_CE);
        self.regs[CP0_CAUSE] = cause | ((code << 2) & CAUSE_EXC_CODE) | (((coprocessor as u64) & 3) << 28);
    }

    /// Latch BadVAddr, Context, XContext and EntryHi for an address fault.
    pub fn latch_bad_vaddr(&mut self, vaddr: u64) {
        let vpn2 = (vaddr >> 13) & 0x7_FFFF;
        let xvpn2 = (vaddr >> 13) & 0x7FF_FFFF;
        let region = (vaddr >> 62) & 0b11;

        self.regs[CP0_BAD_VADDR] = vaddr;

        let context = self.regs[CP0_CONTEXT] & CONTEXT_PTE_BASE;
        self.regs[CP0_CONTEXT] = context | (vpn2 << 4);

        let xcontext = self.regs[CP0_XCONTEXT] & XCONTEXT_PTE_BASE;
        self.regs[CP0_XCONTEXT] = xcontext | (region << 31) | (xvpn2 << 4);

        let asid = self.regs[CP0_ENTRY_HI] & 0xFF;
        self.regs[CP0_ENTRY_HI] = (region << 62) | (xvpn2 << 13) | asid;
    }
}

impl Default for Cp0 {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for Cp0 {
    type Output = u64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.regs[index]
    }
}

impl IndexMut<usize> for Cp0 {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.regs[index]
    }
}
