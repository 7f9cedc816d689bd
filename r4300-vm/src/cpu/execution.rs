use super::core::{Cpu, sext32};
use super::cp0::{
    self, CP0_ENTRY_HI, CP0_ENTRY_LO0, CP0_ENTRY_LO1, CP0_EPC, CP0_ERROR_EPC, CP0_INDEX,
    CP0_LLADDR, CP0_PAGE_MASK, CP0_RANDOM, CP0_STATUS, STATUS_ERL, STATUS_EXL,
};
use super::types::{CpuError, ExceptionCode, ExecResult, Fault};
use crate::bus::Bus;
use crate::decoder::{self, IType, Op, RType};
use crate::mmu::{AccessType, TLB_ENTRIES, TlbEntry};

impl Cpu {
    /// Execute one instruction, or take one pending interrupt.
    ///
    /// Guest-visible exceptions are vectored and reported through
    /// `last_exception`; only host-level failures return `Err`.
    pub fn step(&mut self, bus: &dyn Bus) -> Result<(), CpuError> {
        match self.step_inner(bus) {
            Ok(()) | Err(Fault::Vectored) => Ok(()),
            Err(Fault::Fatal(err)) => {
                log::error!("fatal stop at pc {:#018x}: {}", self.prev_pc, err);
                Err(err)
            }
        }
    }

    fn step_inner(&mut self, bus: &dyn Bus) -> ExecResult {
        self.clear_last_exception();
        self.cp0.set_external_interrupts(bus.pending_interrupts());
        self.cp0.tick(1);

        self.prev_branch = self.branch;
        self.branch = false;

        if self.cp0.interrupt_ready() {
            self.handle_exception(self.pc, ExceptionCode::Interrupt, 0);
            return Ok(());
        }

        let pc = self.pc;
        self.prev_pc = pc;
        let raw = self.fetch(bus, pc)?;

        let op = match self.decode_cache_lookup(pc, raw) {
            Some(op) => op,
            None => {
                let op = decoder::decode(pc, raw);
                self.decode_cache_insert(pc, raw, op);
                op
            }
        };

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("{:#018x}: {:08x} {:?}", pc, raw, op);
        }

        self.pc = self.next_pc;
        self.next_pc = self.pc.wrapping_add(4);

        self.execute(bus, op)
    }

    pub(super) fn unimplemented<T>(&self, what: impl Into<String>) -> ExecResult<T> {
        Err(Fault::Fatal(CpuError::Unimplemented {
            pc: self.prev_pc,
            what: what.into(),
        }))
    }

    #[inline]
    fn rs(&self, r: u8) -> u64 {
        self.read_reg(r)
    }

    #[inline]
    pub(super) fn ea(&self, i: IType) -> u64 {
        self.read_reg(i.rs).wrapping_add(i.simm())
    }

    fn execute(&mut self, bus: &dyn Bus, op: Op) -> ExecResult {
        match op {
            Op::Nop | Op::Sync | Op::Wait => {}

            // ── Jumps and branches ──────────────────────────────────────
            Op::J(j) => {
                let target = (self.pc & 0xFFFF_FFFF_F000_0000) | ((j.target as u64) << 2);
                self.jump(target);
            }
            Op::Jal(j) => {
                let target = (self.pc & 0xFFFF_FFFF_F000_0000) | ((j.target as u64) << 2);
                self.write_reg(31, self.link_address());
                self.jump(target);
            }
            Op::Jr(r) => {
                let target = self.rs(r.rs);
                self.jump(target);
            }
            Op::Jalr(r) => {
                let target = self.rs(r.rs);
                self.write_reg(r.rd, self.link_address());
                self.jump(target);
            }
            Op::Beq(i) => self.branch_if(self.rs(i.rs) == self.rs(i.rt), i.imm),
            Op::Bne(i) => self.branch_if(self.rs(i.rs) != self.rs(i.rt), i.imm),
            Op::Blez(i) => self.branch_if(self.rs(i.rs) as i64 <= 0, i.imm),
            Op::Bgtz(i) => self.branch_if(self.rs(i.rs) as i64 > 0, i.imm),
            Op::Beql(i) => self.branch_likely(self.rs(i.rs) == self.rs(i.rt), i.imm),
            Op::Bnel(i) => self.branch_likely(self.rs(i.rs) != self.rs(i.rt), i.imm),
            Op::Blezl(i) => self.branch_likely(self.rs(i.rs) as i64 <= 0, i.imm),
            Op::Bgtzl(i) => self.branch_likely(self.rs(i.rs) as i64 > 0, i.imm),
            Op::Bltz(i) => self.branch_if((self.rs(i.rs) as i64) < 0, i.imm),
            Op::Bgez(i) => self.branch_if(self.rs(i.rs) as i64 >= 0, i.imm),
            Op::Bltzl(i) => self.branch_likely((self.rs(i.rs) as i64) < 0, i.imm),
            Op::Bgezl(i) => self.branch_likely(self.rs(i.rs) as i64 >= 0, i.imm),
            Op::Bltzal(i) => {
                let cond = (self.rs(i.rs) as i64) < 0;
                self.write_reg(31, self.link_address());
                self.branch_if(cond, i.imm);
            }
            Op::Bgezal(i) => {
                let cond = self.rs(i.rs) as i64 >= 0;
                self.write_reg(31, self.link_address());
                self.branch_if(cond, i.imm);
            }
            Op::Bltzall(i) => {
                let cond = (self.rs(i.rs) as i64) < 0;
                self.write_reg(31, self.link_address());
                self.branch_likely(cond, i.imm);
            }
            Op::Bgezall(i) => {
                let cond = self.rs(i.rs) as i64 >= 0;
                self.write_reg(31, self.link_address());
                self.branch_likely(cond, i.imm);
            }

            // ── Immediate arithmetic ────────────────────────────────────
            Op::Addi(i) => match (self.rs(i.rs) as i32).checked_add(i.imm as i16 as i32) {
                Some(v) => self.write_reg(i.rt, v as i64 as u64),
                None => return self.raise(ExceptionCode::ArithmeticOverflow, 0),
            },
            Op::Addiu(i) => {
                let v = (self.rs(i.rs) as u32).wrapping_add(i.imm as i16 as i32 as u32);
                self.write_reg(i.rt, sext32(v));
            }
            Op::Daddi(i) => match (self.rs(i.rs) as i64).checked_add(i.imm as i16 as i64) {
                Some(v) => self.write_reg(i.rt, v as u64),
                None => return self.raise(ExceptionCode::ArithmeticOverflow, 0),
            },
            Op::Daddiu(i) => self.write_reg(i.rt, self.rs(i.rs).wrapping_add(i.simm())),
            Op::Slti(i) => {
                let v = ((self.rs(i.rs) as i64) < i.simm() as i64) as u64;
                self.write_reg(i.rt, v);
            }
            Op::Sltiu(i) => self.write_reg(i.rt, (self.rs(i.rs) < i.simm()) as u64),
            Op::Andi(i) => self.write_reg(i.rt, self.rs(i.rs) & i.imm as u64),
            Op::Ori(i) => self.write_reg(i.rt, self.rs(i.rs) | i.imm as u64),
            Op::Xori(i) => self.write_reg(i.rt, self.rs(i.rs) ^ i.imm as u64),
            Op::Lui(i) => self.write_reg(i.rt, sext32((i.imm as u32) << 16)),

            // ── Register arithmetic ─────────────────────────────────────
            Op::Add(r) => match (self.rs(r.rs) as i32).checked_add(self.rs(r.rt) as i32) {
                Some(v) => self.write_reg(r.rd, v as i64 as u64),
                None => return self.raise(ExceptionCode::ArithmeticOverflow, 0),
            },
            Op::Addu(r) => {
                let v = (self.rs(r.rs) as u32).wrapping_add(self.rs(r.rt) as u32);
                self.write_reg(r.rd, sext32(v));
            }
            Op::Sub(r) => match (self.rs(r.rs) as i32).checked_sub(self.rs(r.rt) as i32) {
                Some(v) => self.write_reg(r.rd, v as i64 as u64),
                None => return self.raise(ExceptionCode::ArithmeticOverflow, 0),
            },
            Op::Subu(r) => {
                let v = (self.rs(r.rs) as u32).wrapping_sub(self.rs(r.rt) as u32);
                self.write_reg(r.rd, sext32(v));
            }
            Op::Dadd(r) => match (self.rs(r.rs) as i64).checked_add(self.rs(r.rt) as i64) {
                Some(v) => self.write_reg(r.rd, v as u64),
                None => return self.raise(ExceptionCode::ArithmeticOverflow, 0),
            },
            Op::Daddu(r) => self.write_reg(r.rd, self.rs(r.rs).wrapping_add(self.rs(r.rt))),
            Op::Dsub(r) => match (self.rs(r.rs) as i64).checked_sub(self.rs(r.rt) as i64) {
                Some(v) => self.write_reg(r.rd, v as u64),
                None => return self.raise(ExceptionCode::ArithmeticOverflow, 0),
            },
            Op::Dsubu(r) => self.write_reg(r.rd, self.rs(r.rs).wrapping_sub(self.rs(r.rt))),
            Op::And(r) => self.write_reg(r.rd, self.rs(r.rs) & self.rs(r.rt)),
            Op::Or(r) => self.write_reg(r.rd, self.rs(r.rs) | self.rs(r.rt)),
            Op::Xor(r) => self.write_reg(r.rd, self.rs(r.rs) ^ self.rs(r.rt)),
            Op::Nor(r) => self.write_reg(r.rd, !(self.rs(r.rs) | self.rs(r.rt))),
            Op::Slt(r) => {
                let v = ((self.rs(r.rs) as i64) < self.rs(r.rt) as i64) as u64;
                self.write_reg(r.rd, v);
            }
            Op::Sltu(r) => self.write_reg(r.rd, (self.rs(r.rs) < self.rs(r.rt)) as u64),

            // ── Shifts ──────────────────────────────────────────────────
            Op::Sll(r) => self.write_reg(r.rd, sext32((self.rs(r.rt) as u32) << r.sa)),
            Op::Srl(r) => self.write_reg(r.rd, sext32((self.rs(r.rt) as u32) >> r.sa)),
            Op::Sra(r) => {
                let v = ((self.rs(r.rt) as i64) >> r.sa) as u32;
                self.write_reg(r.rd, sext32(v));
            }
            Op::Sllv(r) => {
                let sa = self.rs(r.rs) & 31;
                self.write_reg(r.rd, sext32((self.rs(r.rt) as u32) << sa));
            }
            Op::Srlv(r) => {
                let sa = self.rs(r.rs) & 31;
                self.write_reg(r.rd, sext32((self.rs(r.rt) as u32) >> sa));
            }
            Op::Srav(r) => {
                let sa = self.rs(r.rs) & 31;
                let v = ((self.rs(r.rt) as i64) >> sa) as u32;
                self.write_reg(r.rd, sext32(v));
            }
            Op::Dsll(r) => self.write_reg(r.rd, self.rs(r.rt) << r.sa),
            Op::Dsrl(r) => self.write_reg(r.rd, self.rs(r.rt) >> r.sa),
            Op::Dsra(r) => self.write_reg(r.rd, ((self.rs(r.rt) as i64) >> r.sa) as u64),
            Op::Dsll32(r) => self.write_reg(r.rd, self.rs(r.rt) << (r.sa + 32)),
            Op::Dsrl32(r) => self.write_reg(r.rd, self.rs(r.rt) >> (r.sa + 32)),
            Op::Dsra32(r) => {
                self.write_reg(r.rd, ((self.rs(r.rt) as i64) >> (r.sa + 32)) as u64)
            }
            Op::Dsllv(r) => self.write_reg(r.rd, self.rs(r.rt) << (self.rs(r.rs) & 63)),
            Op::Dsrlv(r) => self.write_reg(r.rd, self.rs(r.rt) >> (self.rs(r.rs) & 63)),
            Op::Dsrav(r) => {
                let v = (self.rs(r.rt) as i64) >> (self.rs(r.rs) & 63);
                self.write_reg(r.rd, v as u64);
            }

            // ── Multiply / divide ───────────────────────────────────────
            Op::Mfhi(r) => self.write_reg(r.rd, self.hi),
            Op::Mflo(r) => self.write_reg(r.rd, self.lo),
            Op::Mthi(r) => self.hi = self.rs(r.rs),
            Op::Mtlo(r) => self.lo = self.rs(r.rs),
            Op::Mult(r) => {
                let p = (self.rs(r.rs) as i32 as i64) * (self.rs(r.rt) as i32 as i64);
                self.lo = sext32(p as u32);
                self.hi = sext32((p >> 32) as u32);
            }
            Op::Multu(r) => {
                let p = (self.rs(r.rs) as u32 as u64) * (self.rs(r.rt) as u32 as u64);
                self.lo = sext32(p as u32);
                self.hi = sext32((p >> 32) as u32);
            }
            Op::Dmult(r) => {
                let p = (self.rs(r.rs) as i64 as i128) * (self.rs(r.rt) as i64 as i128);
                self.lo = p as u64;
                self.hi = (p >> 64) as u64;
            }
            Op::Dmultu(r) => {
                let p = (self.rs(r.rs) as u128) * (self.rs(r.rt) as u128);
                self.lo = p as u64;
                self.hi = (p >> 64) as u64;
            }
            Op::Div(r) => self.div32(r),
            Op::Divu(r) => self.divu32(r),
            Op::Ddiv(r) => self.div64(r),
            Op::Ddivu(r) => self.divu64(r),

            // ── Traps ───────────────────────────────────────────────────
            Op::Syscall => return self.raise(ExceptionCode::Syscall, 0),
            Op::Break => return self.raise(ExceptionCode::Breakpoint, 0),
            Op::Tge(r) => self.trap_if(self.rs(r.rs) as i64 >= self.rs(r.rt) as i64)?,
            Op::Tgeu(r) => self.trap_if(self.rs(r.rs) >= self.rs(r.rt))?,
            Op::Tlt(r) => self.trap_if((self.rs(r.rs) as i64) < self.rs(r.rt) as i64)?,
            Op::Tltu(r) => self.trap_if(self.rs(r.rs) < self.rs(r.rt))?,
            Op::Teq(r) => self.trap_if(self.rs(r.rs) == self.rs(r.rt))?,
            Op::Tne(r) => self.trap_if(self.rs(r.rs) != self.rs(r.rt))?,
            Op::Tgei(i) => self.trap_if(self.rs(i.rs) as i64 >= i.simm() as i64)?,
            Op::Tgeiu(i) => self.trap_if(self.rs(i.rs) >= i.simm())?,
            Op::Tlti(i) => self.trap_if((self.rs(i.rs) as i64) < i.simm() as i64)?,
            Op::Tltiu(i) => self.trap_if(self.rs(i.rs) < i.simm())?,
            Op::Teqi(i) => self.trap_if(self.rs(i.rs) == i.simm())?,
            Op::Tnei(i) => self.trap_if(self.rs(i.rs) != i.simm())?,

            // ── Loads ───────────────────────────────────────────────────
            Op::Lb(i) => {
                let v = self.load8(bus, self.ea(i))?;
                self.write_reg(i.rt, v as i8 as i64 as u64);
            }
            Op::Lbu(i) => {
                let v = self.load8(bus, self.ea(i))?;
                self.write_reg(i.rt, v as u64);
            }
            Op::Lh(i) => {
                let v = self.load16(bus, self.ea(i))?;
                self.write_reg(i.rt, v as i16 as i64 as u64);
            }
            Op::Lhu(i) => {
                let v = self.load16(bus, self.ea(i))?;
                self.write_reg(i.rt, v as u64);
            }
            Op::Lw(i) => {
                let v = self.load32(bus, self.ea(i))?;
                self.write_reg(i.rt, sext32(v));
            }
            Op::Lwu(i) => {
                let v = self.load32(bus, self.ea(i))?;
                self.write_reg(i.rt, v as u64);
            }
            Op::Ld(i) => {
                let v = self.load64(bus, self.ea(i))?;
                self.write_reg(i.rt, v);
            }
            Op::Lwl(i) => self.lwl(bus, i)?,
            Op::Lwr(i) => self.lwr(bus, i)?,
            Op::Ldl(i) => self.ldl(bus, i)?,
            Op::Ldr(i) => self.ldr(bus, i)?,
            Op::Ll(i) => {
                let vaddr = self.ea(i);
                let paddr = self.translate_aligned(vaddr, 4, AccessType::Load)?;
                let v = bus.read32(paddr)?;
                self.write_reg(i.rt, sext32(v));
                self.cp0[CP0_LLADDR] = paddr >> 4;
                self.llbit = true;
            }
            Op::Lld(i) => {
                let vaddr = self.ea(i);
                let paddr = self.translate_aligned(vaddr, 8, AccessType::Load)?;
                let v = bus.read64(paddr)?;
                self.write_reg(i.rt, v);
                self.cp0[CP0_LLADDR] = paddr >> 4;
                self.llbit = true;
            }

            // ── Stores ──────────────────────────────────────────────────
            Op::Sb(i) => self.store8(bus, self.ea(i), self.rs(i.rt) as u8)?,
            Op::Sh(i) => self.store16(bus, self.ea(i), self.rs(i.rt) as u16)?,
            Op::Sw(i) => self.store32(bus, self.ea(i), self.rs(i.rt) as u32)?,
            Op::Sd(i) => self.store64(bus, self.ea(i), self.rs(i.rt))?,
            Op::Swl(i) => self.swl(bus, i)?,
            Op::Swr(i) => self.swr(bus, i)?,
            Op::Sdl(i) => self.sdl(bus, i)?,
            Op::Sdr(i) => self.sdr(bus, i)?,
            Op::Sc(i) => {
                let paddr = self.translate_aligned(self.ea(i), 4, AccessType::Store)?;
                let stored = self.llbit;
                if stored {
                    bus.write32(paddr, self.rs(i.rt) as u32)?;
                    self.llbit = false;
                }
                self.write_reg(i.rt, stored as u64);
            }
            Op::Scd(i) => {
                let paddr = self.translate_aligned(self.ea(i), 8, AccessType::Store)?;
                let stored = self.llbit;
                if stored {
                    bus.write64(paddr, self.rs(i.rt))?;
                    self.llbit = false;
                }
                self.write_reg(i.rt, stored as u64);
            }
            Op::Cache(i) => {
                self.require_cop0()?;
                self.translate(self.ea(i), AccessType::Load)?;
            }

            // ── COP0 ────────────────────────────────────────────────────
            Op::Mfc0(r) => {
                self.require_cop0()?;
                let v = self.cp0.read(r.rd as usize);
                self.write_reg(r.rt, sext32(v as u32));
            }
            Op::Dmfc0(r) => {
                self.require_cop0()?;
                let reg = r.rd as usize;
                if cp0::is_reserved(reg) {
                    return self.unimplemented(format!("DMFC0 from reserved register {}", reg));
                }
                let v = self.cp0.read(reg);
                let v = if cp0::is_doubleword(reg) { v } else { sext32(v as u32) };
                self.write_reg(r.rt, v);
            }
            Op::Mtc0(r) => {
                self.require_cop0()?;
                let v = sext32(self.rs(r.rt) as u32);
                self.cp0.write(r.rd as usize, v);
            }
            Op::Dmtc0(r) => {
                self.require_cop0()?;
                let reg = r.rd as usize;
                if cp0::is_reserved(reg) {
                    return self.unimplemented(format!("DMTC0 to reserved register {}", reg));
                }
                let v = self.rs(r.rt);
                let v = if cp0::is_doubleword(reg) { v } else { sext32(v as u32) };
                self.cp0.write(reg, v);
            }
            Op::Tlbr => {
                self.require_cop0()?;
                self.tlbr();
            }
            Op::Tlbwi => {
                self.require_cop0()?;
                let index = (self.cp0[CP0_INDEX] as usize) % TLB_ENTRIES;
                self.tlb_write(index);
            }
            Op::Tlbwr => {
                self.require_cop0()?;
                let index = (self.cp0[CP0_RANDOM] as usize) % TLB_ENTRIES;
                self.tlb_write(index);
            }
            Op::Tlbp => {
                self.require_cop0()?;
                let entry_hi = self.cp0[CP0_ENTRY_HI];
                self.cp0[CP0_INDEX] = match self.cp0.tlb.probe(entry_hi, entry_hi as u8) {
                    Some(index) => index as u64,
                    None => 0x8000_0000,
                };
            }
            Op::Eret => {
                self.require_cop0()?;
                self.eret();
            }

            // ── COP1 ────────────────────────────────────────────────────
            Op::Mfc1(_)
            | Op::Dmfc1(_)
            | Op::Cfc1(_)
            | Op::Mtc1(_)
            | Op::Dmtc1(_)
            | Op::Ctc1(_)
            | Op::Bc1f(_)
            | Op::Bc1t(_)
            | Op::Bc1fl(_)
            | Op::Bc1tl(_)
            | Op::Lwc1(_)
            | Op::Ldc1(_)
            | Op::Swc1(_)
            | Op::Sdc1(_)
            | Op::Cop1 { .. }
            | Op::Cop1Unimplemented => self.execute_cop1(bus, op)?,

            // ── COP2 ────────────────────────────────────────────────────
            Op::Mfc2(r) => {
                self.require_cop2()?;
                self.write_reg(r.rt, sext32(self.cp2_latch as u32));
            }
            Op::Dmfc2(r) => {
                self.require_cop2()?;
                self.write_reg(r.rt, self.cp2_latch);
            }
            Op::Mtc2(r) | Op::Dmtc2(r) => {
                self.require_cop2()?;
                self.cp2_latch = self.rs(r.rt);
            }
            // No COP2 control registers exist.
            Op::Cfc2(r) | Op::Ctc2(r) => {
                self.require_cop2()?;
                log::warn!("COP2 control move ignored at {:#018x} (rd {})", self.prev_pc, r.rd);
            }
            Op::Cop2Invalid => {
                self.require_cop2()?;
                return self.raise(ExceptionCode::ReservedInstruction, 2);
            }

            Op::ReservedInstruction => {
                return self.raise(ExceptionCode::ReservedInstruction, 0);
            }
        }
        Ok(())
    }

    fn trap_if(&mut self, cond: bool) -> ExecResult {
        if cond {
            return self.raise(ExceptionCode::Trap, 0);
        }
        Ok(())
    }

    fn div32(&mut self, r: RType) {
        let n = self.rs(r.rs) as i32;
        let d = self.rs(r.rt) as i32;
        if d == 0 {
            self.lo = if n >= 0 { u64::MAX } else { 1 };
            self.hi = sext32(n as u32);
        } else {
            self.lo = sext32(n.wrapping_div(d) as u32);
            self.hi = sext32(n.wrapping_rem(d) as u32);
        }
    }

    fn divu32(&mut self, r: RType) {
        let n = self.rs(r.rs) as u32;
        let d = self.rs(r.rt) as u32;
        if d == 0 {
            self.lo = u64::MAX;
            self.hi = sext32(n);
        } else {
            self.lo = sext32(n / d);
            self.hi = sext32(n % d);
        }
    }

    fn div64(&mut self, r: RType) {
        let n = self.rs(r.rs) as i64;
        let d = self.rs(r.rt) as i64;
        if d == 0 {
            self.lo = if n >= 0 { u64::MAX } else { 1 };
            self.hi = n as u64;
        } else if n == i64::MIN && d == -1 {
            self.lo = n as u64;
            self.hi = 0;
        } else {
            self.lo = (n / d) as u64;
            self.hi = (n % d) as u64;
        }
    }

    fn divu64(&mut self, r: RType) {
        let n = self.rs(r.rs);
        let d = self.rs(r.rt);
        if d == 0 {
            self.lo = u64::MAX;
            self.hi = n;
        } else {
            self.lo = n / d;
            self.hi = n % d;
        }
    }

    // Unaligned accesses translate the byte address and operate on the
    // enclosing aligned word or doubleword.

    fn lwl(&mut self, bus: &dyn Bus, i: IType) -> ExecResult {
        let vaddr = self.ea(i);
        let paddr = self.translate(vaddr, AccessType::Load)?;
        let data = bus.read32(paddr & !3)?;
        let shift = 8 * (vaddr & 3);
        let mask = 0xFFFF_FFFFu32 << shift;
        let v = (self.rs(i.rt) as u32 & !mask) | (data << shift);
        self.write_reg(i.rt, sext32(v));
        Ok(())
    }

    fn lwr(&mut self, bus: &dyn Bus, i: IType) -> ExecResult {
        let vaddr = self.ea(i);
        let paddr = self.translate(vaddr, AccessType::Load)?;
        let data = bus.read32(paddr & !3)?;
        let shift = 8 * ((vaddr ^ 3) & 3);
        let mask = 0xFFFF_FFFFu32 >> shift;
        let v = (self.rs(i.rt) as u32 & !mask) | (data >> shift);
        self.write_reg(i.rt, sext32(v));
        Ok(())
    }

    fn ldl(&mut self, bus: &dyn Bus, i: IType) -> ExecResult {
        let vaddr = self.ea(i);
        let paddr = self.translate(vaddr, AccessType::Load)?;
        let data = bus.read64(paddr & !7)?;
        let shift = 8 * (vaddr & 7);
        let mask = u64::MAX << shift;
        let v = (self.rs(i.rt) & !mask) | (data << shift);
        self.write_reg(i.rt, v);
        Ok(())
    }

    fn ldr(&mut self, bus: &dyn Bus, i: IType) -> ExecResult {
        let vaddr = self.ea(i);
        let paddr = self.translate(vaddr, AccessType::Load)?;
        let data = bus.read64(paddr & !7)?;
        let shift = 8 * ((vaddr ^ 7) & 7);
        let mask = u64::MAX >> shift;
        let v = (self.rs(i.rt) & !mask) | (data >> shift);
        self.write_reg(i.rt, v);
        Ok(())
    }

    fn swl(&mut self, bus: &dyn Bus, i: IType) -> ExecResult {
        let vaddr = self.ea(i);
        let paddr = self.translate(vaddr, AccessType::Store)?;
        let data = bus.read32(paddr & !3)?;
        let shift = 8 * (vaddr & 3);
        let mask = 0xFFFF_FFFFu32 >> shift;
        let v = (data & !mask) | ((self.rs(i.rt) as u32) >> shift);
        bus.write32(paddr & !3, v)?;
        Ok(())
    }

    fn swr(&mut self, bus: &dyn Bus, i: IType) -> ExecResult {
        let vaddr = self.ea(i);
        let paddr = self.translate(vaddr, AccessType::Store)?;
        let data = bus.read32(paddr & !3)?;
        let shift = 8 * ((vaddr ^ 3) & 3);
        let mask = 0xFFFF_FFFFu32 << shift;
        let v = (data & !mask) | ((self.rs(i.rt) as u32) << shift);
        bus.write32(paddr & !3, v)?;
        Ok(())
    }

    fn sdl(&mut self, bus: &dyn Bus, i: IType) -> ExecResult {
        let vaddr = self.ea(i);
        let paddr = self.translate(vaddr, AccessType::Store)?;
        let data = bus.read64(paddr & !7)?;
        let shift = 8 * (vaddr & 7);
        let mask = u64::MAX >> shift;
        let v = (data & !mask) | (self.rs(i.rt) >> shift);
        bus.write64(paddr & !7, v)?;
        Ok(())
    }

    fn sdr(&mut self, bus: &dyn Bus, i: IType) -> ExecResult {
        let vaddr = self.ea(i);
        let paddr = self.translate(vaddr, AccessType::Store)?;
        let data = bus.read64(paddr & !7)?;
        let shift = 8 * ((vaddr ^ 7) & 7);
        let mask = u64::MAX << shift;
        let v = (data & !mask) | (self.rs(i.rt) << shift);
        bus.write64(paddr & !7, v)?;
        Ok(())
    }

    fn tlb_write(&mut self, index: usize) {
        let entry = TlbEntry::from_cp0(
            self.cp0[CP0_ENTRY_HI],
            self.cp0[CP0_ENTRY_LO0],
            self.cp0[CP0_ENTRY_LO1],
            self.cp0[CP0_PAGE_MASK],
        );
        log::debug!(
            "tlb[{}] <- hi {:#018x} lo0 {:#010x} lo1 {:#010x} mask {:#010x}",
            index,
            entry.entry_hi,
            entry.entry_lo0,
            entry.entry_lo1,
            entry.page_mask
        );
        self.cp0.tlb.write(index, entry);
    }

    fn tlbr(&mut self) {
        let index = (self.cp0[CP0_INDEX] as usize) % TLB_ENTRIES;
        let entry = self.cp0.tlb.entry(index);
        let global = entry.global as u64;
        self.cp0[CP0_ENTRY_HI] = entry.entry_hi & !entry.page_mask;
        self.cp0[CP0_ENTRY_LO0] = (entry.entry_lo0 & !1) | global;
        self.cp0[CP0_ENTRY_LO1] = (entry.entry_lo1 & !1) | global;
        self.cp0[CP0_PAGE_MASK] = entry.page_mask;
    }

    fn eret(&mut self) {
        let status = self.cp0[CP0_STATUS];
        let target = if status & STATUS_ERL != 0 {
            self.cp0[CP0_STATUS] = status & !STATUS_ERL;
            self.cp0[CP0_ERROR_EPC]
        } else {
            self.cp0[CP0_STATUS] = status & !STATUS_EXL;
            self.cp0[CP0_EPC]
        };
        log::debug!("eret to {:#018x}", target);
        self.set_pc(target);
        self.llbit = false;
        self.cp0.status_updated();
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::{Bus, SystemBus};
    use crate::cpu::cp0::*;
    use crate::cpu::{Cpu, ExceptionCode};

    const BASE: u64 = 0xFFFF_FFFF_8000_1000;

    fn make_bus() -> SystemBus {
        SystemBus::new(0x10_0000)
    }

    fn enc_i(op: u32, rs: u32, rt: u32, imm: i32) -> u32 {
        (op << 26) | (rs << 21) | (rt << 16) | (imm as u32 & 0xFFFF)
    }

    fn enc_r(rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> u32 {
        (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct
    }

    fn enc_cop0(rs: u32, rt: u32, rd: u32) -> u32 {
        (0x10 << 26) | (rs << 21) | (rt << 16) | (rd << 11)
    }

    const TLBWI: u32 = 0x4200_0002;
    const TLBP: u32 = 0x4200_0008;
    const TLBR: u32 = 0x4200_0001;
    const ERET: u32 = 0x4200_0018;

    /// Write `program` at `BASE` (kseg0 maps it to physical 0x1000).
    fn load(bus: &SystemBus, program: &[u32]) -> Cpu {
        for (n, insn) in program.iter().enumerate() {
            bus.write32(0x1000 + 4 * n as u64, *insn).unwrap();
        }
        Cpu::new(BASE)
    }

    fn run(cpu: &mut Cpu, bus: &SystemBus, steps: usize) {
        for _ in 0..steps {
            cpu.step(bus).unwrap();
        }
    }

    fn exc_code(cpu: &Cpu) -> u64 {
        (cpu.cp0[CP0_CAUSE] >> 2) & 0x1F
    }

    #[test]
    fn nop_only_advances_pc() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[0]);
        let gpr = cpu.gpr;
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.pc, BASE + 4);
        assert_eq!(cpu.gpr, gpr);
        assert!(cpu.last_exception().is_none());
    }

    #[test]
    fn writes_to_r0_are_discarded() {
        let bus = make_bus();
        // ADDIU r0, r0, 5 ; LUI r0, 0x1234
        let mut cpu = load(&bus, &[enc_i(0x09, 0, 0, 5), enc_i(0x0F, 0, 0, 0x1234)]);
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.read_reg(0), 0);
        assert_eq!(cpu.gpr[0], 0);
    }

    #[test]
    fn addi_overflow_leaves_destination() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x0F, 0, 1, 0x7FFF),  // LUI r1, 0x7FFF
                enc_i(0x0D, 1, 1, 0xFFFF),  // ORI r1, r1, 0xFFFF
                enc_i(0x08, 1, 1, 1),       // ADDI r1, r1, 1
            ],
        );
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.read_reg(1), 0x7FFF_FFFF);

        cpu.step(&bus).unwrap();
        let exc = cpu.last_exception().unwrap();
        assert_eq!(exc.code, ExceptionCode::ArithmeticOverflow);
        assert_eq!(exc.pc, BASE + 8);
        assert_eq!(cpu.read_reg(1), 0x7FFF_FFFF);
        assert_eq!(cpu.cp0[CP0_EPC], BASE + 8);
        assert_eq!(exc_code(&cpu), 12);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0180);
    }

    #[test]
    fn addiu_wraps_silently() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x0F, 0, 1, 0x7FFF),
                enc_i(0x0D, 1, 1, 0xFFFF),
                enc_i(0x09, 1, 1, 1), // ADDIU r1, r1, 1
                enc_r(1, 1, 2, 0, 0x21), // ADDU r2, r1, r1
            ],
        );
        run(&mut cpu, &bus, 4);
        assert!(cpu.last_exception().is_none());
        assert_eq!(cpu.read_reg(1), 0xFFFF_FFFF_8000_0000);
        assert_eq!(cpu.read_reg(2), 0);
    }

    #[test]
    fn dadd_overflow_and_sub() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_r(1, 2, 3, 0, 0x2C), // DADD r3, r1, r2
                enc_r(4, 5, 6, 0, 0x22), // SUB r6, r4, r5
            ],
        );
        cpu.write_reg(1, i64::MAX as u64);
        cpu.write_reg(2, 1);
        cpu.write_reg(3, 0xAA);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.read_reg(3), 0xAA);
        assert_eq!(cpu.last_exception().unwrap().code, ExceptionCode::ArithmeticOverflow);

        let mut cpu = load(&bus, &[enc_r(4, 5, 6, 0, 0x22)]);
        cpu.write_reg(4, 5);
        cpu.write_reg(5, 7);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.read_reg(6), (-2i64) as u64);
    }

    #[test]
    fn shifts_sign_extend_word_results() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_r(0, 1, 2, 31, 0x00), // SLL r2, r1, 31
                enc_r(0, 3, 4, 4, 0x03),  // SRA r4, r3, 4
                enc_r(0, 1, 5, 4, 0x3C),  // DSLL32 r5, r1, 4
                enc_r(0, 3, 6, 1, 0x02),  // SRL r6, r3, 1
            ],
        );
        cpu.write_reg(1, 1);
        cpu.write_reg(3, 0xFFFF_FFFF_8000_0000);
        run(&mut cpu, &bus, 4);
        assert_eq!(cpu.read_reg(2), 0xFFFF_FFFF_8000_0000);
        assert_eq!(cpu.read_reg(4), 0xFFFF_FFFF_F800_0000);
        assert_eq!(cpu.read_reg(5), 1 << 36);
        assert_eq!(cpu.read_reg(6), 0x4000_0000);
    }

    #[test]
    fn slt_family() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x0A, 1, 2, -1), // SLTI r2, r1, -1
                enc_i(0x0B, 1, 3, -1), // SLTIU r3, r1, -1
                enc_r(1, 4, 5, 0, 0x2B), // SLTU r5, r1, r4
            ],
        );
        cpu.write_reg(1, (-5i64) as u64);
        cpu.write_reg(4, 3);
        run(&mut cpu, &bus, 3);
        assert_eq!(cpu.read_reg(2), 1);
        assert_eq!(cpu.read_reg(3), 1);
        assert_eq!(cpu.read_reg(5), 0);
    }

    #[test]
    fn logical_immediates_zero_extend() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[enc_i(0x0D, 0, 1, 0x8000), enc_i(0x0C, 2, 3, 0xFFFF)],
        );
        cpu.write_reg(2, u64::MAX);
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.read_reg(1), 0x8000);
        assert_eq!(cpu.read_reg(3), 0xFFFF);
    }

    #[test]
    fn multiply_splits_hi_lo() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_r(1, 2, 0, 0, 0x18), // MULT r1, r2
                enc_r(0, 0, 3, 0, 0x10), // MFHI r3
                enc_r(0, 0, 4, 0, 0x12), // MFLO r4
                enc_r(1, 2, 0, 0, 0x1D), // DMULTU r1, r2
            ],
        );
        cpu.write_reg(1, (-2i64) as u64);
        cpu.write_reg(2, 0x4000_0000);
        run(&mut cpu, &bus, 3);
        // -2 * 2^30 = -2^31
        assert_eq!(cpu.read_reg(3), u64::MAX);
        assert_eq!(cpu.read_reg(4), 0xFFFF_FFFF_8000_0000);

        cpu.step(&bus).unwrap();
        let p = (u64::MAX - 1) as u128 * 0x4000_0000u128;
        assert_eq!(cpu.lo, p as u64);
        assert_eq!(cpu.hi, (p >> 64) as u64);
    }

    #[test]
    fn divu_by_zero_is_defined() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[enc_r(1, 2, 0, 0, 0x1B)]); // DIVU r1, r2
        cpu.write_reg(1, 0x1234_5678);
        cpu.step(&bus).unwrap();
        assert!(cpu.last_exception().is_none());
        assert_eq!(cpu.lo as u32, 0xFFFF_FFFF);
        assert_eq!(cpu.lo, u64::MAX);
        assert_eq!(cpu.hi, 0x1234_5678);
    }

    #[test]
    fn signed_divide_edge_cases() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_r(1, 0, 0, 0, 0x1A), // DIV r1, r0
                enc_r(3, 4, 0, 0, 0x1E), // DDIV r3, r4
                enc_r(5, 6, 0, 0, 0x1A), // DIV r5, r6
            ],
        );
        cpu.write_reg(1, (-7i64) as u64);
        cpu.write_reg(3, i64::MIN as u64);
        cpu.write_reg(4, u64::MAX);
        cpu.write_reg(5, 7);
        cpu.write_reg(6, (-2i64) as u64);

        cpu.step(&bus).unwrap();
        assert_eq!(cpu.lo, 1);
        assert_eq!(cpu.hi, (-7i64) as u64);

        cpu.step(&bus).unwrap();
        assert_eq!(cpu.lo, i64::MIN as u64);
        assert_eq!(cpu.hi, 0);

        cpu.step(&bus).unwrap();
        assert_eq!(cpu.lo, (-3i64) as u64);
        assert_eq!(cpu.hi, 1);
    }

    #[test]
    fn branch_redirects_after_delay_slot() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x04, 0, 0, 3),      // BEQ r0, r0, +3
                enc_i(0x09, 0, 1, 1),      // ADDIU r1, r0, 1   (delay slot)
                enc_i(0x09, 0, 2, 2),      // skipped
                enc_i(0x09, 0, 3, 3),      // skipped
                enc_i(0x09, 0, 4, 4),      // target
            ],
        );
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.pc, BASE + 4);
        assert_eq!(cpu.next_pc, BASE + 16);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.read_reg(1), 1);
        assert_eq!(cpu.pc, BASE + 16);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.read_reg(4), 4);
        assert_eq!(cpu.read_reg(2), 0);
    }

    #[test]
    fn likely_branch_not_taken_skips_delay_slot() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x15, 0, 0, 8),  // BNEL r0, r0, +8 (never taken)
                enc_i(0x09, 0, 1, 1),  // nullified
                enc_i(0x09, 0, 2, 2),
            ],
        );
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.pc, BASE + 8);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.read_reg(1), 0);
        assert_eq!(cpu.read_reg(2), 2);
    }

    #[test]
    fn link_is_written_when_not_taken() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[enc_i(0x01, 0, 0x10, 4), 0]); // BLTZAL r0, +4
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.read_reg(31), BASE + 8);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.pc, BASE + 8);
    }

    #[test]
    fn jal_and_jr() {
        let bus = make_bus();
        let target = (0x8000_2000u32 >> 2) & 0x03FF_FFFF;
        let mut cpu = load(&bus, &[(0x03 << 26) | target, 0]);
        bus.write32(0x2000, enc_r(31, 0, 0, 0, 0x08)).unwrap(); // JR r31
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_2000);
        assert_eq!(cpu.read_reg(31), BASE + 8);
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.pc, BASE + 8);
    }

    #[test]
    fn jalr_reads_target_before_link() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[enc_r(5, 0, 5, 0, 0x09), 0]); // JALR r5, r5
        cpu.write_reg(5, 0xFFFF_FFFF_8000_3000);
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_3000);
        assert_eq!(cpu.read_reg(5), BASE + 8);
    }

    #[test]
    fn fault_in_delay_slot_sets_bd_and_branch_epc() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x04, 0, 0, 4),       // BEQ r0, r0, +4
                enc_i(0x23, 0, 1, 0x0002),  // LW r1, 2(r0): misaligned kuseg
            ],
        );
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.cp0[CP0_EPC], BASE);
        assert_ne!(cpu.cp0[CP0_CAUSE] & CAUSE_BD, 0);
        assert_eq!(exc_code(&cpu), 4);
        assert_eq!(cpu.cp0[CP0_BAD_VADDR], 2);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0180);
    }

    #[test]
    fn loads_and_stores() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x2B, 1, 2, 0),  // SW r2, 0(r1)
                enc_i(0x20, 1, 3, 0),  // LB r3, 0(r1)
                enc_i(0x25, 1, 4, 2),  // LHU r4, 2(r1)
                enc_i(0x3F, 1, 2, 8),  // SD r2, 8(r1)
                enc_i(0x27, 1, 5, 12), // LWU r5, 12(r1)
                enc_i(0x28, 1, 2, 16), // SB r2, 16(r1)
                enc_i(0x37, 1, 6, 16), // LD r6, 16(r1)
            ],
        );
        cpu.write_reg(1, 0xFFFF_FFFF_A000_0400);
        cpu.write_reg(2, 0xFFFF_FFFF_8765_4321);
        run(&mut cpu, &bus, 7);
        assert_eq!(bus.read32(0x400).unwrap(), 0x8765_4321);
        assert_eq!(cpu.read_reg(3), 0xFFFF_FFFF_FFFF_FF87);
        assert_eq!(cpu.read_reg(4), 0x4321);
        assert_eq!(cpu.read_reg(5), 0x8765_4321);
        assert_eq!(cpu.read_reg(6), 0x2100_0000_0000_0000);
    }

    #[test]
    fn unaligned_word_merges() {
        let bus = make_bus();
        bus.write32(0x400, 0x1122_3344).unwrap();
        bus.write32(0x404, 0x5566_7788).unwrap();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x22, 1, 2, 1), // LWL r2, 1(r1)
                enc_i(0x26, 1, 2, 4), // LWR r2, 4(r1)
                enc_i(0x2A, 1, 3, 1), // SWL r3, 1(r1)
                enc_i(0x2E, 1, 3, 4), // SWR r3, 4(r1)
            ],
        );
        cpu.write_reg(1, 0xFFFF_FFFF_8000_0400);
        cpu.write_reg(3, 0xAABB_CCDD);
        run(&mut cpu, &bus, 2);
        // Unaligned word at 0x401: 22 33 44 55
        assert_eq!(cpu.read_reg(2), 0x2233_4455);
        run(&mut cpu, &bus, 2);
        assert_eq!(bus.read32(0x400).unwrap(), 0x11AA_BBCC);
        assert_eq!(bus.read32(0x404).unwrap(), 0xDD66_7788);
    }

    #[test]
    fn unaligned_doubleword_merges() {
        let bus = make_bus();
        bus.write64(0x400, 0x0011_2233_4455_6677).unwrap();
        bus.write64(0x408, 0x8899_AABB_CCDD_EEFF).unwrap();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x1A, 1, 2, 3),  // LDL r2, 3(r1)
                enc_i(0x1B, 1, 2, 10), // LDR r2, 10(r1)
            ],
        );
        cpu.write_reg(1, 0xFFFF_FFFF_8000_0400);
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.read_reg(2), 0x3344_5566_7788_99AA);
    }

    #[test]
    fn ll_sc_pairing() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x30, 1, 2, 0), // LL r2, 0(r1)
                enc_i(0x38, 1, 3, 0), // SC r3, 0(r1)
                enc_i(0x38, 1, 4, 0), // SC r4, 0(r1)
            ],
        );
        bus.write32(0x400, 7).unwrap();
        cpu.write_reg(1, 0xFFFF_FFFF_8000_0400);
        cpu.write_reg(3, 9);
        cpu.write_reg(4, 11);
        run(&mut cpu, &bus, 3);
        assert_eq!(cpu.read_reg(2), 7);
        assert_eq!(cpu.read_reg(3), 1);
        assert_eq!(cpu.read_reg(4), 0);
        assert_eq!(bus.read32(0x400).unwrap(), 9);
        assert_eq!(cpu.cp0[CP0_LLADDR], 0x40);
    }

    #[test]
    fn tlbwi_maps_even_page() {
        let bus = make_bus();
        let vpn2 = 0x0040_0000u64;
        let pfn = 0x80u64;
        let mut cpu = load(
            &bus,
            &[
                TLBWI,
                enc_i(0x23, 1, 2, 0x10), // LW r2, 0x10(r1)
            ],
        );
        cpu.cp0.write(CP0_INDEX, 0);
        cpu.cp0.write(CP0_ENTRY_HI, vpn2);
        cpu.cp0.write(CP0_ENTRY_LO0, (pfn << 6) | 0b10); // valid
        cpu.cp0.write(CP0_ENTRY_LO1, 0);
        cpu.cp0.write(CP0_PAGE_MASK, 0);
        bus.write32(pfn * 0x1000 + 0x10, 0xCAFE_F00D).unwrap();
        cpu.write_reg(1, vpn2);

        run(&mut cpu, &bus, 2);
        assert!(cpu.last_exception().is_none());
        assert_eq!(cpu.read_reg(2), 0xFFFF_FFFF_CAFE_F00D);
        assert!(!cpu.cp0.tlb.entry(0).global);
    }

    #[test]
    fn tlbwi_global_requires_both_halves() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[TLBWI, TLBWI]);
        cpu.cp0.write(CP0_ENTRY_LO0, 1);
        cpu.cp0.write(CP0_ENTRY_LO1, 0);
        cpu.step(&bus).unwrap();
        assert!(!cpu.cp0.tlb.entry(0).global);
        cpu.cp0.write(CP0_ENTRY_LO1, 1);
        cpu.step(&bus).unwrap();
        assert!(cpu.cp0.tlb.entry(0).global);
    }

    #[test]
    fn tlbp_and_tlbr() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[TLBWI, TLBP, TLBR, TLBP]);
        cpu.cp0.write(CP0_INDEX, 5);
        cpu.cp0.write(CP0_ENTRY_HI, 0x0001_2000 | 0x07);
        cpu.cp0.write(CP0_ENTRY_LO0, (0x10 << 6) | 0b110);
        cpu.cp0.write(CP0_ENTRY_LO1, (0x11 << 6) | 0b010);
        run(&mut cpu, &bus, 1);

        cpu.cp0.write(CP0_INDEX, 0);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.cp0.read(CP0_INDEX), 5);

        cpu.cp0.write(CP0_ENTRY_HI, 0);
        cpu.cp0.write(CP0_INDEX, 5);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.cp0.read(CP0_ENTRY_HI), 0x0001_2000 | 0x07);
        assert_eq!(cpu.cp0[CP0_ENTRY_LO0], (0x10 << 6) | 0b110);

        cpu.cp0.write(CP0_ENTRY_HI, 0x0009_0000);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.cp0[CP0_INDEX], 0x8000_0000);
    }

    #[test]
    fn tlb_miss_vectors_to_refill_and_latches_context() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[enc_i(0x2B, 1, 0, 0)]); // SW r0, 0(r1)
        cpu.write_reg(1, 0x0000_0000_0123_4000);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.last_exception().unwrap().code, ExceptionCode::TlbMissStore);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0000);
        assert_eq!(cpu.cp0[CP0_BAD_VADDR], 0x0123_4000);
        assert_eq!(cpu.cp0.read(CP0_ENTRY_HI) & !0xFF, 0x0123_4000 & !0x1FFF);
    }

    #[test]
    fn mtc0_mfc0_round_trip_and_eret() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_cop0(4, 1, CP0_EPC as u32),    // MTC0 r1, EPC
                enc_cop0(0, 2, CP0_STATUS as u32), // MFC0 r2, Status
                ERET,
            ],
        );
        cpu.write_reg(1, 0x8000_0400);
        cpu.cp0.write(CP0_STATUS, STATUS_EXL);
        cpu.llbit = true;
        run(&mut cpu, &bus, 3);
        assert_eq!(cpu.read_reg(2), STATUS_EXL);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0400);
        assert_eq!(cpu.cp0[CP0_STATUS] & STATUS_EXL, 0);
        assert!(!cpu.llbit);
    }

    #[test]
    fn eret_prefers_error_epc() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[ERET]);
        cpu.cp0.write(CP0_STATUS, STATUS_ERL | STATUS_EXL);
        cpu.cp0.write(CP0_ERROR_EPC, 0xFFFF_FFFF_8000_0800);
        cpu.cp0.write(CP0_EPC, 0xFFFF_FFFF_8000_0900);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0800);
        assert_eq!(cpu.cp0[CP0_STATUS] & STATUS_ERL, 0);
        assert_ne!(cpu.cp0[CP0_STATUS] & STATUS_EXL, 0);
    }

    #[test]
    fn dmfc0_on_reserved_register_is_fatal() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[enc_cop0(1, 2, 7)]);
        assert!(matches!(
            cpu.step(&bus),
            Err(crate::cpu::CpuError::Unimplemented { pc: BASE, .. })
        ));
    }

    #[test]
    fn dmtc0_is_full_width_on_epc() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[enc_cop0(5, 1, CP0_EPC as u32), enc_cop0(5, 1, CP0_COMPARE as u32)]);
        cpu.write_reg(1, 0x1234_5678_9ABC_DEF0);
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.cp0[CP0_EPC], 0x1234_5678_9ABC_DEF0);
        assert_eq!(cpu.cp0[CP0_COMPARE], 0x9ABC_DEF0);
    }

    #[test]
    fn reserved_instruction_and_syscall() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[enc_r(0, 0, 0, 0, 0x01)]);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.last_exception().unwrap().code, ExceptionCode::ReservedInstruction);

        let mut cpu = load(&bus, &[0x0000_000C]);
        cpu.step(&bus).unwrap();
        assert_eq!(exc_code(&cpu), 8);
    }

    #[test]
    fn trap_instructions() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[enc_i(0x01, 1, 0x0C, 5), enc_i(0x01, 1, 0x0C, 6)]); // TEQI
        cpu.write_reg(1, 6);
        cpu.step(&bus).unwrap();
        assert!(cpu.last_exception().is_none());
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.last_exception().unwrap().code, ExceptionCode::Trap);
    }

    #[test]
    fn compare_interrupt_is_taken_between_instructions() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[0, 0, 0, 0, 0, 0]);
        // IE | IM7
        cpu.cp0.write(CP0_STATUS, STATUS_IE | (1 << 15));
        cpu.cp0.write(CP0_COMPARE, 2);
        // Count advances at half the step rate; the match lands on step 4.
        run(&mut cpu, &bus, 3);
        assert!(cpu.last_exception().is_none());
        cpu.step(&bus).unwrap();
        let exc = cpu.last_exception().unwrap();
        assert_eq!(exc.code, ExceptionCode::Interrupt);
        assert_eq!(cpu.cp0[CP0_EPC], BASE + 12);
        assert_ne!(cpu.cp0[CP0_CAUSE] & CAUSE_IP7, 0);
    }

    #[test]
    fn mi_interrupt_drives_ip2() {
        let bus = make_bus();
        let mut cpu = load(&bus, &[0, 0]);
        cpu.cp0.write(CP0_STATUS, STATUS_IE | (1 << 10));
        bus.write32(0x0430_000C, 1 << 7).unwrap(); // unmask VI
        bus.interrupt_raise(crate::bus::Interrupt::Vi);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.last_exception().unwrap().code, ExceptionCode::Interrupt);
        assert_eq!(cpu.cp0[CP0_EPC], BASE);
    }

    #[test]
    fn cop2_latch_moves() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                (0x12 << 26) | (5 << 21) | (1 << 16), // DMTC2 r1
                (0x12 << 26) | (0 << 21) | (2 << 16), // MFC2 r2
            ],
        );
        cpu.cp0.write(CP0_STATUS, STATUS_CU2);
        cpu.write_reg(1, 0x0000_0001_8000_0000);
        run(&mut cpu, &bus, 2);
        assert_eq!(cpu.cp2_latch, 0x0000_0001_8000_0000);
        assert_eq!(cpu.read_reg(2), 0xFFFF_FFFF_8000_0000);

        let mut cpu = load(&bus, &[(0x12 << 26) | (2 << 16)]);
        cpu.step(&bus).unwrap();
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 28) & 3, 2);
    }

    #[test]
    fn cop2_control_moves_have_no_effect() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                (0x12 << 26) | (4 << 21) | (1 << 16), // MTC2 r1
                (0x12 << 26) | (2 << 21) | (2 << 16), // CFC2 r2
                (0x12 << 26) | (6 << 21) | (3 << 16), // CTC2 r3
            ],
        );
        cpu.cp0.write(CP0_STATUS, STATUS_CU2);
        cpu.write_reg(1, 0x1234);
        cpu.write_reg(2, 0x7777);
        cpu.write_reg(3, 0x5555);
        run(&mut cpu, &bus, 3);
        assert!(cpu.last_exception().is_none());
        assert_eq!(cpu.read_reg(2), 0x7777);
        assert_eq!(cpu.cp2_latch, 0x1234);
    }

    #[test]
    fn unallocated_cop2_checks_cu2_first() {
        let bus = make_bus();
        let invalid = (0x12 << 26) | (0x10 << 21);

        let mut cpu = load(&bus, &[invalid]);
        cpu.cp0.write(CP0_STATUS, STATUS_CU0);
        cpu.step(&bus).unwrap();
        assert_eq!(exc_code(&cpu), ExceptionCode::CoprocessorUnusable.bits());
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 28) & 3, 2);

        let mut cpu = load(&bus, &[invalid]);
        cpu.cp0.write(CP0_STATUS, STATUS_CU0 | STATUS_CU2);
        cpu.step(&bus).unwrap();
        assert_eq!(exc_code(&cpu), ExceptionCode::ReservedInstruction.bits());
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 28) & 3, 2);
        assert_eq!(cpu.cp0[CP0_EPC], BASE);
    }

    #[test]
    fn interrupt_on_delay_slot_points_epc_at_branch() {
        let bus = make_bus();
        let mut cpu = load(
            &bus,
            &[
                enc_i(0x04, 0, 0, 2), // BEQ r0, r0, +2
                0,                    // delay slot
                0,
                0,
            ],
        );
        cpu.cp0.write(CP0_STATUS, STATUS_IE | (1 << 10));
        bus.write32(0x0430_000C, 1 << 7).unwrap(); // unmask VI
        cpu.step(&bus).unwrap();
        assert!(cpu.last_exception().is_none());

        bus.interrupt_raise(crate::bus::Interrupt::Vi);
        cpu.step(&bus).unwrap();
        assert_eq!(cpu.last_exception().unwrap().code, ExceptionCode::Interrupt);
        assert_eq!(cpu.cp0[CP0_EPC], BASE);
        assert_ne!(cpu.cp0[CP0_CAUSE] & CAUSE_BD, 0);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0180);
    }

    #[test]
    fn fetch_from_unmapped_physical_is_fatal() {
        let bus = make_bus();
        let mut cpu = Cpu::new(0xFFFF_FFFF_8200_0000);
        assert!(matches!(cpu.step(&bus), Err(crate::cpu::CpuError::Bus(_))));
    }
}
