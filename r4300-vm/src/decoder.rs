//! Instruction decoder.
//!
//! Resolution order is primary opcode, then the SPECIAL function code, the
//! REGIMM rt field, or the COPz rs field (falling through to the function
//! field for FPU arithmetic and TLB sub-ops).

/// Immediate-format fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IType {
    pub rs: u8,
    pub rt: u8,
    pub imm: u16,
}

impl IType {
    /// Immediate sign-extended to 64 bits.
    #[inline]
    pub fn simm(&self) -> u64 {
        self.imm as i16 as i64 as u64
    }
}

/// Register-format fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RType {
    pub rs: u8,
    pub rt: u8,
    pub rd: u8,
    pub sa: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JType {
    pub target: u32,
}

/// FPU register operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FType {
    pub ft: u8,
    pub fs: u8,
    pub fd: u8,
}

/// Operand format of a COP1 arithmetic instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fmt {
    S,
    D,
    W,
    L,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuOp {
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
    Abs,
    Mov,
    Neg,
    RoundL,
    TruncL,
    CeilL,
    FloorL,
    RoundW,
    TruncW,
    CeilW,
    FloorW,
    CvtS,
    CvtD,
    CvtW,
    CvtL,
    /// `C.cond.fmt`, with the low four bits of the function code.
    Compare(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// The all-zero word.
    Nop,

    J(JType),
    Jal(JType),
    Beq(IType),
    Bne(IType),
    Blez(IType),
    Bgtz(IType),
    Addi(IType),
    Addiu(IType),
    Slti(IType),
    Sltiu(IType),
    Andi(IType),
    Ori(IType),
    Xori(IType),
    Lui(IType),
    Beql(IType),
    Bnel(IType),
    Blezl(IType),
    Bgtzl(IType),
    Daddi(IType),
    Daddiu(IType),
    Ldl(IType),
    Ldr(IType),
    Lb(IType),
    Lh(IType),
    Lwl(IType),
    Lw(IType),
    Lbu(IType),
    Lhu(IType),
    Lwr(IType),
    Lwu(IType),
    Sb(IType),
    Sh(IType),
    Swl(IType),
    Sw(IType),
    Sdl(IType),
    Sdr(IType),
    Swr(IType),
    Cache(IType),
    Ll(IType),
    Lwc1(IType),
    Lld(IType),
    Ldc1(IType),
    Ld(IType),
    Sc(IType),
    Swc1(IType),
    Scd(IType),
    Sdc1(IType),
    Sd(IType),

    Sll(RType),
    Srl(RType),
    Sra(RType),
    Sllv(RType),
    Srlv(RType),
    Srav(RType),
    Jr(RType),
    Jalr(RType),
    Syscall,
    Break,
    Sync,
    Mfhi(RType),
    Mthi(RType),
    Mflo(RType),
    Mtlo(RType),
    Dsllv(RType),
    Dsrlv(RType),
    Dsrav(RType),
    Mult(RType),
    Multu(RType),
    Div(RType),
    Divu(RType),
    Dmult(RType),
    Dmultu(RType),
    Ddiv(RType),
    Ddivu(RType),
    Add(RType),
    Addu(RType),
    Sub(RType),
    Subu(RType),
    And(RType),
    Or(RType),
    Xor(RType),
    Nor(RType),
    Slt(RType),
    Sltu(RType),
    Dadd(RType),
    Daddu(RType),
    Dsub(RType),
    Dsubu(RType),
    Tge(RType),
    Tgeu(RType),
    Tlt(RType),
    Tltu(RType),
    Teq(RType),
    Tne(RType),
    Dsll(RType),
    Dsrl(RType),
    Dsra(RType),
    Dsll32(RType),
    Dsrl32(RType),
    Dsra32(RType),

    Bltz(IType),
    Bgez(IType),
    Bltzl(IType),
    Bgezl(IType),
    Bltzal(IType),
    Bgezal(IType),
    Bltzall(IType),
    Bgezall(IType),
    Tgei(IType),
    Tgeiu(IType),
    Tlti(IType),
    Tltiu(IType),
    Teqi(IType),
    Tnei(IType),

    Mfc0(RType),
    Dmfc0(RType),
    Mtc0(RType),
    Dmtc0(RType),
    Tlbr,
    Tlbwi,
    Tlbwr,
    Tlbp,
    Eret,
    Wait,

    Mfc1(RType),
    Dmfc1(RType),
    Cfc1(RType),
    Mtc1(RType),
    Dmtc1(RType),
    Ctc1(RType),
    Bc1f(IType),
    Bc1t(IType),
    Bc1fl(IType),
    Bc1tl(IType),
    Cop1 { op: FpuOp, fmt: Fmt, regs: FType },
    /// COP1 encoding the FPU does not implement; raises the unimplemented cause.
    Cop1Unimplemented,

    Mfc2(RType),
    Dmfc2(RType),
    Cfc2(RType),
    Mtc2(RType),
    Dmtc2(RType),
    Ctc2(RType),
    /// Unallocated COP2 `rs` field; still subject to the CU2 check.
    Cop2Invalid,

    ReservedInstruction,
}

#[inline]
fn opcode(raw: u32) -> u32 {
    raw >> 26
}

#[inline]
fn rs(raw: u32) -> u8 {
    ((raw >> 21) & 0x1F) as u8
}

#[inline]
fn rt(raw: u32) -> u8 {
    ((raw >> 16) & 0x1F) as u8
}

#[inline]
fn rd(raw: u32) -> u8 {
    ((raw >> 11) & 0x1F) as u8
}

#[inline]
fn sa(raw: u32) -> u8 {
    ((raw >> 6) & 0x1F) as u8
}

#[inline]
fn funct(raw: u32) -> u32 {
    raw & 0x3F
}

fn i_type(raw: u32) -> IType {
    IType {
        rs: rs(raw),
        rt: rt(raw),
        imm: raw as u16,
    }
}

fn r_type(raw: u32) -> RType {
    RType {
        rs: rs(raw),
        rt: rt(raw),
        rd: rd(raw),
        sa: sa(raw),
    }
}

/// Decode one instruction word. `pc` is only used for tracing.
pub fn decode(pc: u64, raw: u32) -> Op {
    if raw == 0 {
        return Op::Nop;
    }

    let i = i_type(raw);
    let op = match opcode(raw) {
        0x00 => decode_special(raw),
        0x01 => decode_regimm(raw),
        0x02 => Op::J(JType { target: raw & 0x03FF_FFFF }),
        0x03 => Op::Jal(JType { target: raw & 0x03FF_FFFF }),
        0x04 => Op::Beq(i),
        0x05 => Op::Bne(i),
        0x06 => Op::Blez(i),
        0x07 => Op::Bgtz(i),
        0x08 => Op::Addi(i),
        0x09 => Op::Addiu(i),
        0x0A => Op::Slti(i),
        0x0B => Op::Sltiu(i),
        0x0C => Op::Andi(i),
        0x0D => Op::Ori(i),
        0x0E => Op::Xori(i),
        0x0F => Op::Lui(i),
        0x10 => decode_cop0(raw),
        0x11 => decode_cop1(raw),
        0x12 => decode_cop2(raw),
        0x14 => Op::Beql(i),
        0x15 => Op::Bnel(i),
        0x16 => Op::Blezl(i),
        0x17 => Op::Bgtzl(i),
        0x18 => Op::Daddi(i),
        0x19 => Op::Daddiu(i),
        0x1A => Op::Ldl(i),
        0x1B => Op::Ldr(i),
        0x20 => Op::Lb(i),
        0x21 => Op::Lh(i),
        0x22 => Op::Lwl(i),
        0x23 => Op::Lw(i),
        0x24 => Op::Lbu(i),
        0x25 => Op::Lhu(i),
        0x26 => Op::Lwr(i),
        0x27 => Op::Lwu(i),
        0x28 => Op::Sb(i),
        0x29 => Op::Sh(i),
        0x2A => Op::Swl(i),
        0x2B => Op::Sw(i),
        0x2C => Op::Sdl(i),
        0x2D => Op::Sdr(i),
        0x2E => Op::Swr(i),
        0x2F => Op::Cache(i),
        0x30 => Op::Ll(i),
        0x31 => Op::Lwc1(i),
        0x34 => Op::Lld(i),
        0x35 => Op::Ldc1(i),
        0x37 => Op::Ld(i),
        0x38 => Op::Sc(i),
        0x39 => Op::Swc1(i),
        0x3C => Op::Scd(i),
        0x3D => Op::Sdc1(i),
        0x3F => Op::Sd(i),
        // COP3, LWC2/LDC2/SWC2/SDC2 and the unallocated slots.
        _ => Op::ReservedInstruction,
    };

    if log::log_enabled!(log::Level::Trace) && op == Op::ReservedInstruction {
        log::trace!("reserved encoding {:#010x} at pc {:#018x}", raw, pc);
    }
    op
}

fn decode_special(raw: u32) -> Op {
    let r = r_type(raw);
    match funct(raw) {
        0x00 => Op::Sll(r),
        0x02 => Op::Srl(r),
        0x03 => Op::Sra(r),
        0x04 => Op::Sllv(r),
        0x06 => Op::Srlv(r),
        0x07 => Op::Srav(r),
        0x08 => Op::Jr(r),
        0x09 => Op::Jalr(r),
        0x0C => Op::Syscall,
        0x0D => Op::Break,
        0x0F => Op::Sync,
        0x10 => Op::Mfhi(r),
        0x11 => Op::Mthi(r),
        0x12 => Op::Mflo(r),
        0x13 => Op::Mtlo(r),
        0x14 => Op::Dsllv(r),
        0x16 => Op::Dsrlv(r),
        0x17 => Op::Dsrav(r),
        0x18 => Op::Mult(r),
        0x19 => Op::Multu(r),
        0x1A => Op::Div(r),
        0x1B => Op::Divu(r),
        0x1C => Op::Dmult(r),
        0x1D => Op::Dmultu(r),
        0x1E => Op::Ddiv(r),
        0x1F => Op::Ddivu(r),
        0x20 => Op::Add(r),
        0x21 => Op::Addu(r),
        0x22 => Op::Sub(r),
        0x23 => Op::Subu(r),
        0x24 => Op::And(r),
        0x25 => Op::Or(r),
        0x26 => Op::Xor(r),
        0x27 => Op::Nor(r),
        0x2A => Op::Slt(r),
        0x2B => Op::Sltu(r),
        0x2C => Op::Dadd(r),
        0x2D => Op::Daddu(r),
        0x2E => Op::Dsub(r),
        0x2F => Op::Dsubu(r),
        0x30 => Op::Tge(r),
        0x31 => Op::Tgeu(r),
        0x32 => Op::Tlt(r),
        0x33 => Op::Tltu(r),
        0x34 => Op::Teq(r),
        0x36 => Op::Tne(r),
        0x38 => Op::Dsll(r),
        0x3A => Op::Dsrl(r),
        0x3B => Op::Dsra(r),
        0x3C => Op::Dsll32(r),
        0x3E => Op::Dsrl32(r),
        0x3F => Op::Dsra32(r),
        _ => Op::ReservedInstruction,
    }
}

fn decode_regimm(raw: u32) -> Op {
    let i = i_type(raw);
    match rt(raw) {
        0x00 => Op::Bltz(i),
        0x01 => Op::Bgez(i),
        0x02 => Op::Bltzl(i),
        0x03 => Op::Bgezl(i),
        0x08 => Op::Tgei(i),
        0x09 => Op::Tgeiu(i),
        0x0A => Op::Tlti(i),
        0x0B => Op::Tltiu(i),
        0x0C => Op::Teqi(i),
        0x0E => Op::Tnei(i),
        0x10 => Op::Bltzal(i),
        0x11 => Op::Bgezal(i),
        0x12 => Op::Bltzall(i),
        0x13 => Op::Bgezall(i),
        _ => Op::ReservedInstruction,
    }
}

fn decode_cop0(raw: u32) -> Op {
    let r = r_type(raw);
    match rs(raw) {
        0x00 => Op::Mfc0(r),
        0x01 => Op::Dmfc0(r),
        0x04 => Op::Mtc0(r),
        0x05 => Op::Dmtc0(r),
        0x10..=0x1F => match funct(raw) {
            0x01 => Op::Tlbr,
            0x02 => Op::Tlbwi,
            0x06 => Op::Tlbwr,
            0x08 => Op::Tlbp,
            0x18 => Op::Eret,
            0x20 => Op::Wait,
            _ => Op::ReservedInstruction,
        },
        _ => Op::ReservedInstruction,
    }
}

fn decode_cop1(raw: u32) -> Op {
    let r = r_type(raw);
    let fmt = match rs(raw) {
        0x00 => return Op::Mfc1(r),
        0x01 => return Op::Dmfc1(r),
        0x02 => return Op::Cfc1(r),
        0x04 => return Op::Mtc1(r),
        0x05 => return Op::Dmtc1(r),
        0x06 => return Op::Ctc1(r),
        // DCFC1 / DCTC1
        0x03 | 0x07 => return Op::Cop1Unimplemented,
        0x08 => {
            let i = i_type(raw);
            return match rt(raw) {
                0x00 => Op::Bc1f(i),
                0x01 => Op::Bc1t(i),
                0x02 => Op::Bc1fl(i),
                0x03 => Op::Bc1tl(i),
                _ => Op::ReservedInstruction,
            };
        }
        0x09..=0x0F => return Op::ReservedInstruction,
        0x10 => Fmt::S,
        0x11 => Fmt::D,
        0x14 => Fmt::W,
        0x15 => Fmt::L,
        _ => return Op::Cop1Unimplemented,
    };

    let op = match funct(raw) {
        0x00 => FpuOp::Add,
        0x01 => FpuOp::Sub,
        0x02 => FpuOp::Mul,
        0x03 => FpuOp::Div,
        0x04 => FpuOp::Sqrt,
        0x05 => FpuOp::Abs,
        0x06 => FpuOp::Mov,
        0x07 => FpuOp::Neg,
        0x08 => FpuOp::RoundL,
        0x09 => FpuOp::TruncL,
        0x0A => FpuOp::CeilL,
        0x0B => FpuOp::FloorL,
        0x0C => FpuOp::RoundW,
        0x0D => FpuOp::TruncW,
        0x0E => FpuOp::CeilW,
        0x0F => FpuOp::FloorW,
        0x20 => FpuOp::CvtS,
        0x21 => FpuOp::CvtD,
        0x24 => FpuOp::CvtW,
        0x25 => FpuOp::CvtL,
        f @ 0x30..=0x3F => FpuOp::Compare((f & 0xF) as u8),
        _ => return Op::Cop1Unimplemented,
    };

    let valid = match op {
        FpuOp::CvtS => matches!(fmt, Fmt::D | Fmt::W | Fmt::L),
        FpuOp::CvtD => matches!(fmt, Fmt::S | Fmt::W | Fmt::L),
        _ => matches!(fmt, Fmt::S | Fmt::D),
    };
    if !valid {
        return Op::Cop1Unimplemented;
    }

    Op::Cop1 {
        op,
        fmt,
        regs: FType {
            ft: rt(raw),
            fs: rd(raw),
            fd: sa(raw),
        },
    }
}

fn decode_cop2(raw: u32) -> Op {
    let r = r_type(raw);
    match rs(raw) {
        0x00 => Op::Mfc2(r),
        0x01 => Op::Dmfc2(r),
        0x02 => Op::Cfc2(r),
        0x04 => Op::Mtc2(r),
        0x05 => Op::Dmtc2(r),
        0x06 => Op::Ctc2(r),
        _ => Op::Cop2Invalid,
    }
}
