//! COP1 (FPU) instruction handlers.
//!
//! Arithmetic goes through the rounding helpers in `fpu`, which report an
//! IEEE cause mask; the result is committed only when that cause does not
//! trap.

use super::core::{Cpu, sext32};
use super::fpu::{self, CAUSE_UNIMPLEMENTED, FCR31_WRITE_MASK, Rounded, RoundingMode};
use super::types::{ExceptionCode, ExecResult};
use crate::bus::Bus;
use crate::decoder::{FType, Fmt, FpuOp, Op};

impl Cpu {
    pub(super) fn execute_cop1(&mut self, bus: &dyn Bus, op: Op) -> ExecResult {
        self.require_cop1()?;
        let fr = self.fr();

        match op {
            Op::Mfc1(r) => {
                let v = self.fpu.read_word(r.rd as usize, fr);
                self.write_reg(r.rt, sext32(v));
            }
            Op::Dmfc1(r) => {
                let v = self.fpu.read_dword(r.rd as usize, fr);
                self.write_reg(r.rt, v);
            }
            Op::Mtc1(r) => {
                let v = self.read_reg(r.rt) as u32;
                self.fpu.write_word(r.rd as usize, fr, v);
            }
            Op::Dmtc1(r) => {
                let v = self.read_reg(r.rt);
                self.fpu.write_dword(r.rd as usize, fr, v);
            }
            Op::Cfc1(r) => {
                let v = match r.rd {
                    0 => self.fpu.fcr0,
                    31 => self.fpu.fcr31,
                    n => return self.unimplemented(format!("CFC1 from control register {}", n)),
                };
                self.write_reg(r.rt, sext32(v));
            }
            Op::Ctc1(r) => match r.rd {
                // FCR0 is read-only.
                0 => {}
                31 => {
                    self.fpu.fcr31 = self.read_reg(r.rt) as u32 & FCR31_WRITE_MASK;
                    if self.fpu.cause() & self.fpu.enables() != 0 {
                        return self.raise(ExceptionCode::FloatingPoint, 0);
                    }
                }
                n => return self.unimplemented(format!("CTC1 to control register {}", n)),
            },

            Op::Bc1f(i) => self.branch_if(!self.fpu.condition(), i.imm),
            Op::Bc1t(i) => self.branch_if(self.fpu.condition(), i.imm),
            Op::Bc1fl(i) => self.branch_likely(!self.fpu.condition(), i.imm),
            Op::Bc1tl(i) => self.branch_likely(self.fpu.condition(), i.imm),

            Op::Lwc1(i) => {
                let v = self.load32(bus, self.ea(i))?;
                self.fpu.write_word(i.rt as usize, fr, v);
            }
            Op::Ldc1(i) => {
                let v = self.load64(bus, self.ea(i))?;
                self.fpu.write_dword(i.rt as usize, fr, v);
            }
            Op::Swc1(i) => {
                let v = self.fpu.read_word(i.rt as usize, fr);
                self.store32(bus, self.ea(i), v)?;
            }
            Op::Sdc1(i) => {
                let v = self.fpu.read_dword(i.rt as usize, fr);
                self.store64(bus, self.ea(i), v)?;
            }

            Op::Cop1 { op, fmt, regs } => self.cop1_arith(op, fmt, regs)?,
            Op::Cop1Unimplemented => self.fp_trap(CAUSE_UNIMPLEMENTED)?,

            other => return self.unimplemented(format!("{:?} is not a COP1 instruction", other)),
        }
        Ok(())
    }

    /// Record `cause` in FCR31 and take the FPE if it is enabled.
    fn fp_trap(&mut self, cause: u32) -> ExecResult {
        if self.fpu.raise(cause) {
            return self.raise(ExceptionCode::FloatingPoint, 0);
        }
        Ok(())
    }

    fn read_s(&self, r: usize) -> f32 {
        f32::from_bits(self.fpu.read_word(r, self.fr()))
    }

    fn read_d(&self, r: usize) -> f64 {
        f64::from_bits(self.fpu.read_dword(r, self.fr()))
    }

    fn commit_s(&mut self, fd: usize, result: Rounded<f32>) -> ExecResult {
        self.fp_trap(result.cause)?;
        let fr = self.fr();
        self.fpu.write_word(fd, fr, result.value.to_bits());
        Ok(())
    }

    fn commit_d(&mut self, fd: usize, result: Rounded<f64>) -> ExecResult {
        self.fp_trap(result.cause)?;
        let fr = self.fr();
        self.fpu.write_dword(fd, fr, result.value.to_bits());
        Ok(())
    }

    /// Float operand `fs` converted to a `bits`-wide integer.
    fn float_operand_to_int(&self, fmt: Fmt, fs: usize, mode: RoundingMode, bits: i32) -> Rounded<i64> {
        match fmt {
            Fmt::S => {
                let v = self.read_s(fs);
                if v.is_subnormal() {
                    return Rounded {
                        value: 0,
                        cause: CAUSE_UNIMPLEMENTED,
                    };
                }
                fpu::float_to_int(v as f64, mode, bits)
            }
            Fmt::D => fpu::float_to_int(self.read_d(fs), mode, bits),
            Fmt::W | Fmt::L => Rounded {
                value: 0,
                cause: CAUSE_UNIMPLEMENTED,
            },
        }
    }

    fn cop1_arith(&mut self, op: FpuOp, fmt: Fmt, regs: FType) -> ExecResult {
        let fr = self.fr();
        let mode = self.fpu.rounding_mode();
        let (fs, ft, fd) = (regs.fs as usize, regs.ft as usize, regs.fd as usize);

        match (op, fmt) {
            (FpuOp::Mov, Fmt::S) => {
                let v = self.fpu.read_word(fs, fr);
                self.fpu.write_word(fd, fr, v);
            }
            (FpuOp::Mov, _) => {
                let v = self.fpu.read_dword(fs, fr);
                self.fpu.write_dword(fd, fr, v);
            }

            (FpuOp::Compare(cond), Fmt::S) => {
                let (result, cause) = fpu::compare(self.read_s(fs), self.read_s(ft), cond);
                self.fp_trap(cause)?;
                self.fpu.set_condition(result);
            }
            (FpuOp::Compare(cond), _) => {
                let (result, cause) = fpu::compare(self.read_d(fs), self.read_d(ft), cond);
                self.fp_trap(cause)?;
                self.fpu.set_condition(result);
            }

            (FpuOp::RoundL | FpuOp::TruncL | FpuOp::CeilL | FpuOp::FloorL | FpuOp::CvtL, _) => {
                let mode = fixed_rounding(op).unwrap_or(mode);
                let r = self.float_operand_to_int(fmt, fs, mode, 64);
                self.fp_trap(r.cause)?;
                self.fpu.write_dword(fd, fr, r.value as u64);
            }
            (FpuOp::RoundW | FpuOp::TruncW | FpuOp::CeilW | FpuOp::FloorW | FpuOp::CvtW, _) => {
                let mode = fixed_rounding(op).unwrap_or(mode);
                let r = self.float_operand_to_int(fmt, fs, mode, 32);
                self.fp_trap(r.cause)?;
                self.fpu.write_word(fd, fr, r.value as i32 as u32);
            }

            (FpuOp::CvtS, Fmt::D) => self.commit_s(fd, fpu::f64_to_f32(self.read_d(fs), mode))?,
            (FpuOp::CvtS, Fmt::W) => {
                let v = self.fpu.read_word(fs, fr) as i32 as i64;
                self.commit_s(fd, fpu::i64_to_f32(v, mode))?;
            }
            (FpuOp::CvtS, Fmt::L) => {
                let v = self.fpu.read_dword(fs, fr) as i64;
                self.commit_s(fd, fpu::i64_to_f32(v, mode))?;
            }
            (FpuOp::CvtD, Fmt::S) => self.commit_d(fd, fpu::f32_to_f64(self.read_s(fs)))?,
            (FpuOp::CvtD, Fmt::W) => {
                let v = self.fpu.read_word(fs, fr) as i32 as i64;
                self.commit_d(fd, fpu::i64_to_f64(v, mode))?;
            }
            (FpuOp::CvtD, Fmt::L) => {
                let v = self.fpu.read_dword(fs, fr) as i64;
                self.commit_d(fd, fpu::i64_to_f64(v, mode))?;
            }

            (_, Fmt::S) => {
                let (a, b) = (self.read_s(fs), self.read_s(ft));
                let r = match op {
                    FpuOp::Add => fpu::add(a, b, mode),
                    FpuOp::Sub => fpu::sub(a, b, mode),
                    FpuOp::Mul => fpu::mul(a, b, mode),
                    FpuOp::Div => fpu::div(a, b, mode),
                    FpuOp::Sqrt => fpu::sqrt(a, mode),
                    FpuOp::Abs => fpu::sign_op(a, false),
                    FpuOp::Neg => fpu::sign_op(a, true),
                    _ => return self.fp_trap(CAUSE_UNIMPLEMENTED),
                };
                self.commit_s(fd, r)?;
            }
            (_, Fmt::D) => {
                let (a, b) = (self.read_d(fs), self.read_d(ft));
                let r = match op {
                    FpuOp::Add => fpu::add(a, b, mode),
                    FpuOp::Sub => fpu::sub(a, b, mode),
                    FpuOp::Mul => fpu::mul(a, b, mode),
                    FpuOp::Div => fpu::div(a, b, mode),
                    FpuOp::Sqrt => fpu::sqrt(a, mode),
                    FpuOp::Abs => fpu::sign_op(a, false),
                    FpuOp::Neg => fpu::sign_op(a, true),
                    _ => return self.fp_trap(CAUSE_UNIMPLEMENTED),
                };
                self.commit_d(fd, r)?;
            }

            _ => self.fp_trap(CAUSE_UNIMPLEMENTED)?,
        }
        Ok(())
    }
}

/// Rounding mode encoded in the opcode, if any.
fn fixed_rounding(op: FpuOp) -> Option<RoundingMode> {
    match op {
        FpuOp::RoundL | FpuOp::RoundW => Some(RoundingMode::Nearest),
        FpuOp::TruncL | FpuOp::TruncW => Some(RoundingMode::Zero),
        FpuOp::CeilL | FpuOp::CeilW => Some(RoundingMode::PlusInfinity),
        FpuOp::FloorL | FpuOp::FloorW => Some(RoundingMode::MinusInfinity),
        _ => None,
    }
}
