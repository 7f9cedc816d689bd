use crate::bus::Bus;
use crate::decoder::Op;
use crate::mmu::{self, AccessType, TlbError};

use super::cp0::{
    CAUSE_BD, CP0_BAD_VADDR, CP0_CAUSE, CP0_ENTRY_HI, CP0_EPC, CP0_STATUS, Cp0, STATUS_BEV,
    STATUS_CU0, STATUS_CU1, STATUS_CU2, STATUS_EXL, STATUS_FR,
};
use super::fpu::Fpu;
use super::types::{Exception, ExceptionCode, ExecResult, Fault, Mode};

/// Cached decode result.
/// Stores (pc, raw_instruction, decoded_op) for cache hit checking.
type DecodeCacheEntry = (u64, u32, Op);

/// Cache size (power of 2 for fast modulo)
const DECODE_CACHE_SIZE: usize = 256;
const DECODE_CACHE_MASK: usize = DECODE_CACHE_SIZE - 1;

const VECTOR_BASE: u64 = 0xFFFF_FFFF_8000_0000;
const VECTOR_BASE_BEV: u64 = 0xFFFF_FFFF_BFC0_0200;
const VECTOR_TLB_REFILL: u64 = 0x000;
const VECTOR_XTLB_REFILL: u64 = 0x080;
const VECTOR_GENERAL: u64 = 0x180;

#[inline]
pub(crate) fn sext32(value: u32) -> u64 {
    value as i32 as i64 as u64
}

/// R4300i CPU core.
///
/// `pc` is the instruction about to be fetched and `next_pc` the one after
/// it; a branch redirects `next_pc`, so the delay slot at `pc` still runs.
pub struct Cpu {
    pub gpr: [u64; 32],
    pub pc: u64,
    pub next_pc: u64,
    /// Address of the instruction currently executing.
    pub prev_pc: u64,
    pub hi: u64,
    pub lo: u64,
    /// Load-linked reservation.
    pub llbit: bool,
    /// Set by any branch or jump; the next instruction is its delay slot.
    pub(crate) branch: bool,
    /// `branch` as it was when the current instruction started.
    pub(crate) prev_branch: bool,
    pub cp0: Cp0,
    pub fpu: Fpu,
    /// Single 64-bit transfer latch behind the COP2 moves.
    pub cp2_latch: u64,
    last_exception: Option<Exception>,
    decode_cache: [Option<DecodeCacheEntry>; DECODE_CACHE_SIZE],
}

impl Cpu {
    /// Create a CPU in its reset state with fetch starting at `pc`.
    pub fn new(pc: u64) -> Self {
        Self {
            gpr: [0; 32],
            pc,
            next_pc: pc.wrapping_add(4),
            prev_pc: pc,
            hi: 0,
            lo: 0,
            llbit: false,
            branch: false,
            prev_branch: false,
            cp0: Cp0::new(),
            fpu: Fpu::new(),
            cp2_latch: 0,
            last_exception: None,
            decode_cache: [None; DECODE_CACHE_SIZE],
        }
    }

    /// Jump straight to `pc`, discarding any pending branch.
    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
        self.next_pc = pc.wrapping_add(4);
        self.branch = false;
    }

    #[inline]
    pub fn read_reg(&self, reg: u8) -> u64 {
        if reg == 0 { 0 } else { self.gpr[(reg & 31) as usize] }
    }

    #[inline]
    pub fn write_reg(&mut self, reg: u8, val: u64) {
        if reg != 0 {
            self.gpr[(reg & 31) as usize] = val;
        }
    }

    /// Exception vectored by the most recent `step`, if any.
    pub fn last_exception(&self) -> Option<Exception> {
        self.last_exception
    }

    pub(crate) fn clear_last_exception(&mut self) {
        self.last_exception = None;
    }

    pub fn mode(&self) -> Mode {
        self.cp0.segments().mode
    }

    pub(crate) fn fr(&self) -> bool {
        self.cp0[CP0_STATUS] & STATUS_FR != 0
    }

    /// Look up instruction in decode cache
    #[inline]
    pub(super) fn decode_cache_lookup(&self, pc: u64, raw: u32) -> Option<Op> {
        let idx = ((pc >> 2) as usize) & DECODE_CACHE_MASK;
        match self.decode_cache[idx] {
            Some((cached_pc, cached_raw, op)) if cached_pc == pc && cached_raw == raw => Some(op),
            _ => None,
        }
    }

    /// Insert decoded instruction into cache
    #[inline]
    pub(super) fn decode_cache_insert(&mut self, pc: u64, raw: u32, op: Op) {
        let idx = ((pc >> 2) as usize) & DECODE_CACHE_MASK;
        self.decode_cache[idx] = Some((pc, raw, op));
    }

    pub fn invalidate_decode_cache(&mut self) {
        self.decode_cache = [None; DECODE_CACHE_SIZE];
    }

    /// Enter the exception handler for an exception raised by the
    /// instruction at `pc`.
    ///
    /// In a delay slot the EPC points at the branch so it re-executes on
    /// return. EPC and BD are left alone while EXL is already set.
    pub fn handle_exception(&mut self, pc: u64, code: ExceptionCode, coprocessor: u8) {
        let old_exl = self.cp0[CP0_STATUS] & STATUS_EXL != 0;

        if !old_exl {
            let epc = if self.prev_branch {
                self.cp0[CP0_CAUSE] |= CAUSE_BD;
                pc.wrapping_sub(4)
            } else {
                self.cp0[CP0_CAUSE] &= !CAUSE_BD;
                pc
            };
            self.cp0[CP0_EPC] = epc;
            self.cp0[CP0_STATUS] |= STATUS_EXL;
        }

        self.cp0.set_exception_cause(code.bits(), coprocessor);

        let base = if self.cp0[CP0_STATUS] & STATUS_BEV != 0 {
            VECTOR_BASE_BEV
        } else {
            VECTOR_BASE
        };
        let offset = if code.is_tlb_miss() && !old_exl && self.cp0.tlb_error == Some(TlbError::Miss)
        {
            if self.cp0.segments().is_xtlb(self.cp0[CP0_BAD_VADDR]) {
                VECTOR_XTLB_REFILL
            } else {
                VECTOR_TLB_REFILL
            }
        } else {
            VECTOR_GENERAL
        };
        let vector = base.wrapping_add(offset);

        log::debug!(
            "exception {:?} (ce {}) at {:#018x} -> {:#018x}, epc {:#018x}",
            code,
            coprocessor,
            pc,
            vector,
            self.cp0[CP0_EPC]
        );

        self.set_pc(vector);
        self.prev_branch = false;
        self.cp0.status_updated();
        self.last_exception = Some(Exception {
            code,
            coprocessor,
            pc,
            vector,
        });
    }

    /// Raise `code` for the executing instruction and unwind the handler.
    pub(super) fn raise<T>(&mut self, code: ExceptionCode, coprocessor: u8) -> ExecResult<T> {
        self.handle_exception(self.prev_pc, code, coprocessor);
        Err(Fault::Vectored)
    }

    /// Latch the faulting address and raise an address error.
    pub(super) fn address_error<T>(&mut self, vaddr: u64, access: AccessType) -> ExecResult<T> {
        self.cp0.latch_bad_vaddr(vaddr);
        self.cp0.tlb_error = Some(TlbError::DisallowedAddress);
        let code = match access {
            AccessType::Store => ExceptionCode::AddressErrorStore,
            _ => ExceptionCode::AddressErrorLoad,
        };
        self.raise(code, 0)
    }

    /// Translate a virtual address, vectoring on failure.
    pub(super) fn translate(&mut self, vaddr: u64, access: AccessType) -> ExecResult<u64> {
        let asid = (self.cp0[CP0_ENTRY_HI] & 0xFF) as u8;
        match mmu::resolve(&self.cp0.tlb, self.cp0.segments(), asid, vaddr, access) {
            Ok(paddr) => Ok(paddr),
            Err(err) => {
                self.cp0.latch_bad_vaddr(vaddr);
                self.cp0.tlb_error = Some(err);
                let code = match (err, access) {
                    (TlbError::Miss | TlbError::Invalid, AccessType::Store) => {
                        ExceptionCode::TlbMissStore
                    }
                    (TlbError::Miss | TlbError::Invalid, _) => ExceptionCode::TlbMissLoad,
                    (TlbError::Modification, _) => ExceptionCode::TlbModification,
                    (TlbError::DisallowedAddress, AccessType::Store) => {
                        ExceptionCode::AddressErrorStore
                    }
                    (TlbError::DisallowedAddress, _) => ExceptionCode::AddressErrorLoad,
                };
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!("translate {:#018x} {:?} failed: {:?}", vaddr, access, err);
                }
                self.raise(code, 0)
            }
        }
    }

    /// Side-effect free translation for debuggers.
    pub fn translate_pure(&self, vaddr: u64, access: AccessType) -> Option<u64> {
        let asid = (self.cp0[CP0_ENTRY_HI] & 0xFF) as u8;
        mmu::resolve(&self.cp0.tlb, self.cp0.segments(), asid, vaddr, access).ok()
    }

    /// Check natural alignment, then translate.
    pub(super) fn translate_aligned(
        &mut self,
        vaddr: u64,
        width: u64,
        access: AccessType,
    ) -> ExecResult<u64> {
        if vaddr & (width - 1) != 0 {
            return self.address_error(vaddr, access);
        }
        self.translate(vaddr, access)
    }

    pub(super) fn fetch(&mut self, bus: &dyn Bus, pc: u64) -> ExecResult<u32> {
        let paddr = self.translate_aligned(pc, 4, AccessType::Instruction)?;
        Ok(bus.read32(paddr)?)
    }

    pub(super) fn load8(&mut self, bus: &dyn Bus, vaddr: u64) -> ExecResult<u8> {
        let paddr = self.translate(vaddr, AccessType::Load)?;
        Ok(bus.read8(paddr)?)
    }

    pub(super) fn load16(&mut self, bus: &dyn Bus, vaddr: u64) -> ExecResult<u16> {
        let paddr = self.translate_aligned(vaddr, 2, AccessType::Load)?;
        Ok(bus.read16(paddr)?)
    }

    pub(super) fn load32(&mut self, bus: &dyn Bus, vaddr: u64) -> ExecResult<u32> {
        let paddr = self.translate_aligned(vaddr, 4, AccessType::Load)?;
        Ok(bus.read32(paddr)?)
    }

    pub(super) fn load64(&mut self, bus: &dyn Bus, vaddr: u64) -> ExecResult<u64> {
        let paddr = self.translate_aligned(vaddr, 8, AccessType::Load)?;
        Ok(bus.read64(paddr)?)
    }

    pub(super) fn store8(&mut self, bus: &dyn Bus, vaddr: u64, value: u8) -> ExecResult {
        let paddr = self.translate(vaddr, AccessType::Store)?;
        Ok(bus.write8(paddr, value)?)
    }

    pub(super) fn store16(&mut self, bus: &dyn Bus, vaddr: u64, value: u16) -> ExecResult {
        let paddr = self.translate_aligned(vaddr, 2, AccessType::Store)?;
        Ok(bus.write16(paddr, value)?)
    }

    pub(super) fn store32(&mut self, bus: &dyn Bus, vaddr: u64, value: u32) -> ExecResult {
        let paddr = self.translate_aligned(vaddr, 4, AccessType::Store)?;
        Ok(bus.write32(paddr, value)?)
    }

    pub(super) fn store64(&mut self, bus: &dyn Bus, vaddr: u64, value: u64) -> ExecResult {
        let paddr = self.translate_aligned(vaddr, 8, AccessType::Store)?;
        Ok(bus.write64(paddr, value)?)
    }

    /// COP0 is usable in kernel mode or with CU0 set.
    pub(super) fn require_cop0(&mut self) -> ExecResult {
        if self.mode() == Mode::Kernel || self.cp0[CP0_STATUS] & STATUS_CU0 != 0 {
            return Ok(());
        }
        self.raise(ExceptionCode::CoprocessorUnusable, 0)
    }

    pub(super) fn require_cop1(&mut self) -> ExecResult {
        if self.cp0[CP0_STATUS] & STATUS_CU1 != 0 {
            return Ok(());
        }
        self.raise(ExceptionCode::CoprocessorUnusable, 1)
    }

    pub(super) fn require_cop2(&mut self) -> ExecResult {
        if self.cp0[CP0_STATUS] & STATUS_CU2 != 0 {
            return Ok(());
        }
        self.raise(ExceptionCode::CoprocessorUnusable, 2)
    }

    /// Conditional branch. `offset` is relative to the delay slot.
    pub(super) fn branch_if(&mut self, cond: bool, offset: u16) {
        self.branch = true;
        if cond {
            self.next_pc = self.branch_target(offset);
        }
    }

    /// Branch-likely: a false condition nullifies the delay slot.
    pub(super) fn branch_likely(&mut self, cond: bool, offset: u16) {
        if cond {
            self.branch = true;
            self.next_pc = self.branch_target(offset);
        } else {
            self.set_pc(self.pc.wrapping_add(4));
        }
    }

    /// Unconditional jump taking effect after the delay slot.
    pub(super) fn jump(&mut self, target: u64) {
        self.branch = true;
        self.next_pc = target;
    }

    fn branch_target(&self, offset: u16) -> u64 {
        let disp = (offset as i16 as i64) << 2;
        self.pc.wrapping_add(disp as u64)
    }

    /// Return address for linking branches: the instruction after the delay slot.
    pub(super) fn link_address(&self) -> u64 {
        self.pc.wrapping_add(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::cp0::{CP0_CONTEXT, STATUS_ERL};

    #[test]
    fn r0_is_hard_wired() {
        let mut cpu = Cpu::new(0);
        cpu.write_reg(0, 0x1234);
        assert_eq!(cpu.read_reg(0), 0);
        cpu.write_reg(5, 0x1234);
        assert_eq!(cpu.read_reg(5), 0x1234);
    }

    #[test]
    fn exception_outside_delay_slot() {
        let mut cpu = Cpu::new(0xFFFF_FFFF_8000_1000);
        cpu.handle_exception(0xFFFF_FFFF_8000_1000, ExceptionCode::Syscall, 0);

        assert_eq!(cpu.cp0[CP0_EPC], 0xFFFF_FFFF_8000_1000);
        assert_eq!(cpu.cp0[CP0_CAUSE] & CAUSE_BD, 0);
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, 8);
        assert_ne!(cpu.cp0[CP0_STATUS] & STATUS_EXL, 0);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0180);
        assert_eq!(cpu.next_pc, 0xFFFF_FFFF_8000_0184);
        assert_eq!(cpu.mode(), Mode::Kernel);
        let exc = cpu.last_exception().unwrap();
        assert_eq!(exc.code, ExceptionCode::Syscall);
        assert_eq!(exc.vector, 0xFFFF_FFFF_8000_0180);
    }

    #[test]
    fn exception_in_delay_slot_points_epc_at_branch() {
        let mut cpu = Cpu::new(0);
        cpu.prev_branch = true;
        cpu.handle_exception(0xFFFF_FFFF_8000_0104, ExceptionCode::Breakpoint, 0);
        assert_eq!(cpu.cp0[CP0_EPC], 0xFFFF_FFFF_8000_0100);
        assert_ne!(cpu.cp0[CP0_CAUSE] & CAUSE_BD, 0);
        assert!(!cpu.branch);
    }

    #[test]
    fn nested_exception_keeps_epc() {
        let mut cpu = Cpu::new(0);
        cpu.handle_exception(0xFFFF_FFFF_8000_0200, ExceptionCode::Syscall, 0);
        cpu.handle_exception(0xFFFF_FFFF_8000_0180, ExceptionCode::ReservedInstruction, 0);
        assert_eq!(cpu.cp0[CP0_EPC], 0xFFFF_FFFF_8000_0200);
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, 10);
    }

    #[test]
    fn bev_selects_boot_vectors() {
        let mut cpu = Cpu::new(0);
        cpu.cp0[CP0_STATUS] |= STATUS_BEV;
        cpu.handle_exception(0, ExceptionCode::Interrupt, 0);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_BFC0_0380);
    }

    #[test]
    fn tlb_miss_uses_refill_vector() {
        let mut cpu = Cpu::new(0);
        // User-segment load with an empty TLB.
        assert!(matches!(
            cpu.translate(0x0000_0000_0040_0000, AccessType::Load),
            Err(Fault::Vectored)
        ));
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0000);
        assert_eq!(cpu.cp0[CP0_BAD_VADDR], 0x40_0000);
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, 2);
        assert_eq!((cpu.cp0[CP0_CONTEXT] >> 4) & 0x7_FFFF, 0x40_0000 >> 13);

        // A second miss with EXL set goes to the general vector.
        assert!(cpu.translate(0x0000_0000_0040_0000, AccessType::Store).is_err());
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0180);
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, 3);
    }

    #[test]
    fn xtlb_refill_in_64bit_user_segment() {
        let mut cpu = Cpu::new(0);
        // KX | UX
        cpu.cp0.write(CP0_STATUS, (1 << 7) | (1 << 5));
        assert!(cpu.translate(0x0000_0001_0000_0000, AccessType::Load).is_err());
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0080);
    }

    #[test]
    fn misaligned_access_is_an_address_error() {
        let mut cpu = Cpu::new(0);
        assert!(cpu.translate_aligned(0xFFFF_FFFF_8000_0002, 4, AccessType::Store).is_err());
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, 5);
        assert_eq!(cpu.cp0[CP0_BAD_VADDR], 0xFFFF_FFFF_8000_0002);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0180);
    }

    #[test]
    fn coprocessor_unusable_reports_unit() {
        let mut cpu = Cpu::new(0);
        assert!(cpu.require_cop0().is_ok());
        assert!(cpu.require_cop1().is_err());
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 28) & 3, 1);
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, 11);

        // User mode without CU0.
        let mut cpu = Cpu::new(0);
        cpu.cp0.write(CP0_STATUS, 0b10 << 3);
        assert!(cpu.require_cop0().is_err());
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 28) & 3, 0);
    }

    #[test]
    fn erl_forces_kernel_mode() {
        let mut cpu = Cpu::new(0);
        cpu.cp0.write(CP0_STATUS, (0b10 << 3) | STATUS_ERL);
        assert_eq!(cpu.mode(), Mode::Kernel);
    }
}
