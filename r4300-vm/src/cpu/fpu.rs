//! CP1 register file, FCR31 and IEEE-754 directed rounding.
//!
//! The host only provides round-to-nearest-even. The other three modes are
//! derived from the nearest result and the sign of the exact residual.

use serde::{Deserialize, Serialize};

/// Implementation/revision word returned by `CFC1 $0`.
pub const FCR0_R4300I: u32 = 0x0000_0A00;
/// Writable bits of FCR31.
pub const FCR31_WRITE_MASK: u32 = 0x0183_FFFF;
/// Compare condition bit.
pub const FCR31_C: u32 = 1 << 23;

// Cause bits, in the 6-bit cause field layout. Flags and enables use the
// same order without `E`.
pub const CAUSE_INEXACT: u32 = 1 << 0;
pub const CAUSE_UNDERFLOW: u32 = 1 << 1;
pub const CAUSE_OVERFLOW: u32 = 1 << 2;
pub const CAUSE_DIV_ZERO: u32 = 1 << 3;
pub const CAUSE_INVALID: u32 = 1 << 4;
pub const CAUSE_UNIMPLEMENTED: u32 = 1 << 5;

pub const DEFAULT_NAN_S: u32 = 0x7FBF_FFFF;
pub const DEFAULT_NAN_D: u64 = 0x7FF7_FFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundingMode {
    Nearest,
    Zero,
    PlusInfinity,
    MinusInfinity,
}

impl RoundingMode {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => RoundingMode::Nearest,
            1 => RoundingMode::Zero,
            2 => RoundingMode::PlusInfinity,
            _ => RoundingMode::MinusInfinity,
        }
    }
}

/// Floating-point register file and control registers.
#[derive(Debug, Clone)]
pub struct Fpu {
    pub fgr: [u64; 32],
    pub fcr0: u32,
    pub fcr31: u32,
}

impl Fpu {
    pub fn new() -> Self {
        Self {
            fgr: [0; 32],
            fcr0: FCR0_R4300I,
            fcr31: 0,
        }
    }

    pub fn rounding_mode(&self) -> RoundingMode {
        RoundingMode::from_bits(self.fcr31)
    }

    pub fn condition(&self) -> bool {
        self.fcr31 & FCR31_C != 0
    }

    pub fn set_condition(&mut self, value: bool) {
        if value {
            self.fcr31 |= FCR31_C;
        } else {
            self.fcr31 &= !FCR31_C;
        }
    }

    /// Enabled exception mask in cause-field layout. Unimplemented is always enabled.
    pub fn enables(&self) -> u32 {
        ((self.fcr31 >> 7) & 0x1F) | CAUSE_UNIMPLEMENTED
    }

    pub fn cause(&self) -> u32 {
        (self.fcr31 >> 12) & 0x3F
    }

    pub fn clear_cause(&mut self) {
        self.fcr31 &= !(0x3F << 12);
    }

    /// Record `cause` in FCR31. Returns `true` when it must trap.
    ///
    /// A trapping cause leaves the flag bits untouched.
    pub fn raise(&mut self, cause: u32) -> bool {
        self.fcr31 = (self.fcr31 & !(0x3F << 12)) | ((cause & 0x3F) << 12);
        if cause & self.enables() != 0 {
            return true;
        }
        self.fcr31 |= (cause & 0x1F) << 2;
        false
    }

    /// Doubleword view of register `r`. With FR clear only even registers
    /// hold doubles.
    pub fn read_dword(&self, r: usize, fr: bool) -> u64 {
        let idx = if fr { r } else { r & !1 };
        self.fgr[idx & 31]
    }

    pub fn write_dword(&mut self, r: usize, fr: bool, value: u64) {
        let idx = if fr { r } else { r & !1 };
        self.fgr[idx & 31] = value;
    }

    /// Word view of register `r`. With FR clear, odd registers alias the
    /// upper half of the preceding even register.
    pub fn read_word(&self, r: usize, fr: bool) -> u32 {
        let r = r & 31;
        if !fr && r & 1 == 1 {
            (self.fgr[r & !1] >> 32) as u32
        } else {
            self.fgr[r] as u32
        }
    }

    pub fn write_word(&mut self, r: usize, fr: bool, value: u32) {
        let r = r & 31;
        if !fr && r & 1 == 1 {
            let reg = &mut self.fgr[r & !1];
            *reg = (*reg & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
        } else {
            let reg = &mut self.fgr[r];
            *reg = (*reg & 0xFFFF_FFFF_0000_0000) | value as u64;
        }
    }
}

impl Default for Fpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Operations the soft-rounding helpers need from `f32`/`f64`.
pub trait SoftFloat: Copy + PartialOrd + std::fmt::Debug {
    const ZERO: Self;
    const MAX: Self;
    const INFINITY: Self;

    fn add(self, other: Self) -> Self;
    fn sub(self, other: Self) -> Self;
    fn mul(self, other: Self) -> Self;
    fn div(self, other: Self) -> Self;
    fn sqrt(self) -> Self;
    fn fma(self, a: Self, b: Self) -> Self;
    fn neg(self) -> Self;

    fn is_nan(self) -> bool;
    fn is_infinite(self) -> bool;
    fn is_finite(self) -> bool;
    fn is_subnormal(self) -> bool;
    fn is_zero(self) -> bool;
    fn is_sign_negative(self) -> bool;
    /// Signalling NaN, using the MIPS legacy encoding (quiet bit set = signalling).
    fn is_snan(self) -> bool;

    fn next_up(self) -> Self;
    fn next_down(self) -> Self;
    fn default_nan() -> Self;
}

macro_rules! impl_soft_float {
    ($ty:ty, $quiet:expr, $default_nan:expr) => {
        impl SoftFloat for $ty {
            const ZERO: Self = 0.0;
            const MAX: Self = <$ty>::MAX;
            const INFINITY: Self = <$ty>::INFINITY;

            #[inline]
            fn add(self, other: Self) -> Self {
                self + other
            }
            #[inline]
            fn sub(self, other: Self) -> Self {
                self - other
            }
            #[inline]
            fn mul(self, other: Self) -> Self {
                self * other
            }
            #[inline]
            fn div(self, other: Self) -> Self {
                self / other
            }
            #[inline]
            fn sqrt(self) -> Self {
                <$ty>::sqrt(self)
            }
            #[inline]
            fn fma(self, a: Self, b: Self) -> Self {
                self.mul_add(a, b)
            }
            #[inline]
            fn neg(self) -> Self {
                -self
            }
            fn is_nan(self) -> bool {
                <$ty>::is_nan(self)
            }
            fn is_infinite(self) -> bool {
                <$ty>::is_infinite(self)
            }
            fn is_finite(self) -> bool {
                <$ty>::is_finite(self)
            }
            fn is_subnormal(self) -> bool {
                <$ty>::is_subnormal(self)
            }
            fn is_zero(self) -> bool {
                self == 0.0
            }
            fn is_sign_negative(self) -> bool {
                <$ty>::is_sign_negative(self)
            }
            fn is_snan(self) -> bool {
                <$ty>::is_nan(self) && self.to_bits() & $quiet != 0
            }
            fn next_up(self) -> Self {
                if <$ty>::is_nan(self) || self == <$ty>::INFINITY {
                    return self;
                }
                if self == 0.0 {
                    return <$ty>::from_bits(1);
                }
                let bits = self.to_bits();
                if self > 0.0 {
                    <$ty>::from_bits(bits + 1)
                } else {
                    <$ty>::from_bits(bits - 1)
                }
            }
            fn next_down(self) -> Self {
                -(-self).next_up()
            }
            fn default_nan() -> Self {
                <$ty>::from_bits($default_nan)
            }
        }
    };
}

impl_soft_float!(f32, 1u32 << 22, DEFAULT_NAN_S);
impl_soft_float!(f64, 1u64 << 51, DEFAULT_NAN_D);

/// Result of an arithmetic operation before it is committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rounded<T> {
    pub value: T,
    pub cause: u32,
}

/// Adjust a round-to-nearest result `nearest` to `mode` given the sign of
/// `exact - nearest`.
pub fn round_with_residual<T: SoftFloat>(nearest: T, residual: T, mode: RoundingMode) -> T {
    if residual.is_zero() || residual.is_nan() {
        return nearest;
    }
    let above = !residual.is_sign_negative();
    match mode {
        RoundingMode::Nearest => nearest,
        RoundingMode::PlusInfinity if above => nearest.next_up(),
        RoundingMode::MinusInfinity if !above => nearest.next_down(),
        RoundingMode::Zero => {
            // Exact magnitude below the nearest magnitude: step toward zero.
            let positive = nearest > T::ZERO || (nearest.is_zero() && above);
            if positive && !above {
                nearest.next_down()
            } else if !positive && above {
                nearest.next_up()
            } else {
                nearest
            }
        }
        _ => nearest,
    }
}

/// Overflowed result per rounding mode for an exact value of sign `negative`.
fn overflow_result<T: SoftFloat>(negative: bool, mode: RoundingMode) -> T {
    let to_infinity = match mode {
        RoundingMode::Nearest => true,
        RoundingMode::Zero => false,
        RoundingMode::PlusInfinity => !negative,
        RoundingMode::MinusInfinity => negative,
    };
    let magnitude = if to_infinity { T::INFINITY } else { T::MAX };
    if negative { magnitude.neg() } else { magnitude }
}

/// Exceptions produced by the operands alone.
fn classify_inputs<T: SoftFloat>(operands: &[T]) -> Option<u32> {
    if operands.iter().any(|v| v.is_nan()) {
        return Some(CAUSE_INVALID);
    }
    if operands.iter().any(|v| v.is_subnormal()) {
        return Some(CAUSE_UNIMPLEMENTED);
    }
    None
}

/// Classify and round a finished result. `nearest` is the host result,
/// `residual` the sign-carrying error term.
fn finish<T: SoftFloat>(nearest: T, residual: T, mode: RoundingMode) -> Rounded<T> {
    if nearest.is_nan() {
        return Rounded {
            value: T::default_nan(),
            cause: CAUSE_INVALID,
        };
    }
    if nearest.is_infinite() {
        return Rounded {
            value: overflow_result(nearest.is_sign_negative(), mode),
            cause: CAUSE_OVERFLOW | CAUSE_INEXACT,
        };
    }

    let value = round_with_residual(nearest, residual, mode);
    let mut cause = 0;
    if !residual.is_zero() {
        cause |= CAUSE_INEXACT;
    }
    if value.is_subnormal() || (value.is_zero() && cause & CAUSE_INEXACT != 0) {
        // Tiny results trap as unimplemented on the R4300i.
        cause |= CAUSE_UNIMPLEMENTED;
    }
    Rounded { value, cause }
}

fn input_fault<T: SoftFloat>(cause: u32) -> Rounded<T> {
    Rounded {
        value: T::default_nan(),
        cause,
    }
}

pub fn add<T: SoftFloat>(a: T, b: T, mode: RoundingMode) -> Rounded<T> {
    if let Some(cause) = classify_inputs(&[a, b]) {
        return input_fault(cause);
    }
    let sum = a.add(b);
    if sum.is_infinite() && a.is_finite() && b.is_finite() {
        return finish(sum, T::ZERO, mode);
    }
    if sum.is_nan() || sum.is_infinite() {
        // inf - inf, or an infinite operand
        return if sum.is_nan() {
            finish(sum, T::ZERO, mode)
        } else {
            Rounded { value: sum, cause: 0 }
        };
    }
    // TwoSum error term.
    let bb = sum.sub(a);
    let err = a.sub(sum.sub(bb)).add(b.sub(bb));
    let mut out = finish(sum, err, mode);
    if out.value.is_zero() && err.is_zero() && mode == RoundingMode::MinusInfinity {
        // x + (-x) is -0 when rounding toward minus infinity.
        if !(a.is_zero() && b.is_zero() && !a.is_sign_negative() && !b.is_sign_negative()) {
            out.value = T::ZERO.neg();
        }
    }
    out
}

pub fn sub<T: SoftFloat>(a: T, b: T, mode: RoundingMode) -> Rounded<T> {
    add(a, b.neg(), mode)
}

pub fn mul<T: SoftFloat>(a: T, b: T, mode: RoundingMode) -> Rounded<T> {
    if let Some(cause) = classify_inputs(&[a, b]) {
        return input_fault(cause);
    }
    let product = a.mul(b);
    if product.is_nan() {
        return finish(product, T::ZERO, mode);
    }
    if product.is_infinite() {
        if a.is_finite() && b.is_finite() {
            return finish(product, T::ZERO, mode);
        }
        return Rounded { value: product, cause: 0 };
    }
    let err = a.fma(b, product.neg());
    finish(product, err, mode)
}

pub fn div<T: SoftFloat>(a: T, b: T, mode: RoundingMode) -> Rounded<T> {
    if let Some(cause) = classify_inputs(&[a, b]) {
        return input_fault(cause);
    }
    if b.is_zero() && !a.is_zero() && a.is_finite() {
        let negative = a.is_sign_negative() != b.is_sign_negative();
        let inf = if negative { T::INFINITY.neg() } else { T::INFINITY };
        return Rounded {
            value: inf,
            cause: CAUSE_DIV_ZERO,
        };
    }
    let quotient = a.div(b);
    if quotient.is_nan() {
        return finish(quotient, T::ZERO, mode);
    }
    if quotient.is_infinite() {
        if a.is_finite() {
            return finish(quotient, T::ZERO, mode);
        }
        return Rounded { value: quotient, cause: 0 };
    }
    if a.is_infinite() || b.is_infinite() {
        return Rounded { value: quotient, cause: 0 };
    }
    // a - q*b carries the sign of (exact - q) * sign(b).
    let rem = quotient.neg().fma(b, a);
    let residual = if b.is_sign_negative() { rem.neg() } else { rem };
    finish(quotient, residual, mode)
}

pub fn sqrt<T: SoftFloat>(a: T, mode: RoundingMode) -> Rounded<T> {
    if let Some(cause) = classify_inputs(&[a]) {
        return input_fault(cause);
    }
    if a.is_sign_negative() && !a.is_zero() {
        return input_fault(CAUSE_INVALID);
    }
    let root = a.sqrt();
    if root.is_infinite() || root.is_zero() {
        return Rounded { value: root, cause: 0 };
    }
    let residual = root.neg().fma(root, a);
    finish(root, residual, mode)
}

/// `ABS`/`NEG`: exact, but NaN and subnormal inputs still fault.
pub fn sign_op<T: SoftFloat>(a: T, negate: bool) -> Rounded<T> {
    if let Some(cause) = classify_inputs(&[a]) {
        return input_fault(cause);
    }
    let value = if negate {
        a.neg()
    } else if a.is_sign_negative() {
        a.neg()
    } else {
        a
    };
    Rounded { value, cause: 0 }
}

/// Widen a single to double precision. Exact apart from operand checks.
pub fn f32_to_f64(a: f32) -> Rounded<f64> {
    if let Some(cause) = classify_inputs(&[a]) {
        return input_fault(cause);
    }
    Rounded {
        value: a as f64,
        cause: 0,
    }
}

/// Narrow a double to single precision under `mode`.
pub fn f64_to_f32(a: f64, mode: RoundingMode) -> Rounded<f32> {
    if let Some(cause) = classify_inputs(&[a]) {
        return input_fault(cause);
    }
    if a.is_infinite() {
        return Rounded {
            value: a as f32,
            cause: 0,
        };
    }
    let nearest = a as f32;
    if nearest.is_infinite() {
        return Rounded {
            value: overflow_result(a.is_sign_negative(), mode),
            cause: CAUSE_OVERFLOW | CAUSE_INEXACT,
        };
    }
    let diff = a - nearest as f64;
    let residual = if diff == 0.0 {
        0.0f32
    } else if diff > 0.0 {
        1.0f32
    } else {
        -1.0f32
    };
    finish(nearest, residual, mode)
}

/// Convert an integer to a float under `mode`.
pub fn int_to_float<T: SoftFloat>(value: i64, nearest: T, back: i128, mode: RoundingMode) -> Rounded<T> {
    let exact = value as i128;
    let residual = match exact.cmp(&back) {
        std::cmp::Ordering::Equal => T::ZERO,
        std::cmp::Ordering::Greater => T::MAX,
        std::cmp::Ordering::Less => T::MAX.neg(),
    };
    let value = round_with_residual(nearest, residual, mode);
    let cause = if residual.is_zero() { 0 } else { CAUSE_INEXACT };
    Rounded { value, cause }
}

pub fn i64_to_f32(value: i64, mode: RoundingMode) -> Rounded<f32> {
    let nearest = value as f32;
    int_to_float(value, nearest, nearest as i128, mode)
}

pub fn i64_to_f64(value: i64, mode: RoundingMode) -> Rounded<f64> {
    let nearest = value as f64;
    int_to_float(value, nearest, nearest as i128, mode)
}

/// Round a float to an integral value in the given direction.
pub fn round_integral(value: f64, mode: RoundingMode) -> f64 {
    match mode {
        RoundingMode::Nearest => value.round_ties_even(),
        RoundingMode::Zero => value.trunc(),
        RoundingMode::PlusInfinity => value.ceil(),
        RoundingMode::MinusInfinity => value.floor(),
    }
}

/// Float-to-integer conversion into a `bits`-wide signed integer.
/// Out-of-range, infinite and NaN inputs raise unimplemented.
pub fn float_to_int(value: f64, mode: RoundingMode, bits: i32) -> Rounded<i64> {
    if value.is_nan() || value.is_infinite() || value.is_subnormal() {
        return Rounded {
            value: 0,
            cause: CAUSE_UNIMPLEMENTED,
        };
    }
    let rounded = round_integral(value, mode);
    let limit = 2f64.powi(bits - 1);
    if rounded < -limit || rounded >= limit {
        return Rounded {
            value: 0,
            cause: CAUSE_UNIMPLEMENTED,
        };
    }
    let cause = if rounded != value { CAUSE_INEXACT } else { 0 };
    Rounded {
        value: rounded as i64,
        cause,
    }
}

/// Evaluate a `C.cond.fmt` predicate. Returns the condition and the cause.
pub fn compare<T: SoftFloat>(a: T, b: T, cond: u8) -> (bool, u32) {
    let unordered = a.is_nan() || b.is_nan();
    let less = !unordered && a < b;
    let equal = !unordered && a == b;
    let signalling = cond & 0b1000 != 0;
    let cause = if unordered && (signalling || a.is_snan() || b.is_snan()) {
        CAUSE_INVALID
    } else {
        0
    };
    let result = (cond & 0b100 != 0 && less)
        || (cond & 0b010 != 0 && equal)
        || (cond & 0b001 != 0 && unordered);
    (result, cause)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_aliasing_with_fr_clear() {
        let mut fpu = Fpu::new();
        fpu.write_word(0, false, 0x1111_1111);
        fpu.write_word(1, false, 0x2222_2222);
        assert_eq!(fpu.read_dword(0, false), 0x2222_2222_1111_1111);
        assert_eq!(fpu.read_dword(1, false), 0x2222_2222_1111_1111);
        assert_eq!(fpu.read_word(1, false), 0x2222_2222);
    }

    #[test]
    fn register_aliasing_with_fr_set() {
        let mut fpu = Fpu::new();
        fpu.write_word(1, true, 0x3333_3333);
        assert_eq!(fpu.fgr[1], 0x3333_3333);
        assert_eq!(fpu.fgr[0], 0);
        fpu.write_dword(3, true, 0xAAAA_BBBB_CCCC_DDDD);
        assert_eq!(fpu.read_word(3, true), 0xCCCC_DDDD);
    }

    #[test]
    fn directed_rounding_of_inexact_sum() {
        let a = 1.0f32;
        let b = f32::EPSILON / 4.0;
        assert_eq!(add(a, b, RoundingMode::Nearest).value, 1.0);
        assert_eq!(add(a, b, RoundingMode::Zero).value, 1.0);
        assert_eq!(add(a, b, RoundingMode::PlusInfinity).value, 1.0f32.next_up());
        assert_eq!(add(a, b, RoundingMode::MinusInfinity).value, 1.0);
        assert_eq!(add(-a, -b, RoundingMode::MinusInfinity).value, (-1.0f32).next_down());
        assert_eq!(add(a, b, RoundingMode::Nearest).cause, CAUSE_INEXACT);
    }

    #[test]
    fn exact_operations_raise_nothing() {
        let r = mul(3.0f64, 4.0, RoundingMode::Zero);
        assert_eq!(r.value, 12.0);
        assert_eq!(r.cause, 0);
        let r = sqrt(16.0f64, RoundingMode::Nearest);
        assert_eq!(r.value, 4.0);
        assert_eq!(r.cause, 0);
    }

    #[test]
    fn division_rounding_and_div_by_zero() {
        let third_down = div(1.0f64, 3.0, RoundingMode::Zero).value;
        let third_up = div(1.0f64, 3.0, RoundingMode::PlusInfinity).value;
        assert!(third_down < third_up);
        assert_eq!(third_down.next_up(), third_up);

        let r = div(1.0f32, 0.0, RoundingMode::Nearest);
        assert_eq!(r.value, f32::INFINITY);
        assert_eq!(r.cause, CAUSE_DIV_ZERO);

        let r = div(0.0f32, 0.0, RoundingMode::Nearest);
        assert_eq!(r.value.to_bits(), DEFAULT_NAN_S);
        assert_eq!(r.cause, CAUSE_INVALID);
    }

    #[test]
    fn overflow_honours_mode() {
        let r = mul(f64::MAX, 2.0, RoundingMode::Zero);
        assert_eq!(r.value, f64::MAX);
        assert_eq!(r.cause, CAUSE_OVERFLOW | CAUSE_INEXACT);
        let r = mul(f64::MAX, 2.0, RoundingMode::Nearest);
        assert_eq!(r.value, f64::INFINITY);
        let r = mul(-f64::MAX, 2.0, RoundingMode::PlusInfinity);
        assert_eq!(r.value, -f64::MAX);
    }

    #[test]
    fn subnormal_operand_is_unimplemented() {
        let tiny = f32::from_bits(1);
        assert_eq!(add(tiny, 1.0, RoundingMode::Nearest).cause, CAUSE_UNIMPLEMENTED);
    }

    #[test]
    fn float_to_int_directions() {
        assert_eq!(float_to_int(2.9, RoundingMode::Zero, 32).value, 2);
        assert_eq!(float_to_int(2.9, RoundingMode::Zero, 32).cause, CAUSE_INEXACT);
        assert_eq!(float_to_int(2.5, RoundingMode::Nearest, 32).value, 2);
        assert_eq!(float_to_int(-2.1, RoundingMode::MinusInfinity, 32).value, -3);
        assert_eq!(float_to_int(2.1, RoundingMode::PlusInfinity, 32).value, 3);
        assert_eq!(float_to_int(2147483647.0, RoundingMode::Zero, 32).value, i32::MAX as i64);
        assert_eq!(float_to_int(3e10, RoundingMode::Zero, 32).cause, CAUSE_UNIMPLEMENTED);
        assert_eq!(float_to_int(3e10, RoundingMode::Zero, 64).value, 30_000_000_000);
        assert_eq!(float_to_int(9.3e18, RoundingMode::Zero, 64).cause, CAUSE_UNIMPLEMENTED);
        assert_eq!(float_to_int(f64::NAN, RoundingMode::Zero, 32).cause, CAUSE_UNIMPLEMENTED);
    }

    #[test]
    fn narrowing_rounds_per_mode() {
        let x = 1.0f64 + f64::EPSILON;
        assert_eq!(f64_to_f32(x, RoundingMode::Nearest).value, 1.0);
        assert_eq!(f64_to_f32(x, RoundingMode::PlusInfinity).value, 1.0f32.next_up());
        assert_eq!(f64_to_f32(x, RoundingMode::Nearest).cause, CAUSE_INEXACT);
    }

    #[test]
    fn integer_conversion_is_inexact_above_mantissa() {
        let big = (1i64 << 24) + 1;
        let r = i64_to_f32(big, RoundingMode::PlusInfinity);
        assert_eq!(r.value, 16_777_218.0);
        assert_eq!(r.cause, CAUSE_INEXACT);
        let r = i64_to_f32(big, RoundingMode::Zero);
        assert_eq!(r.value, 16_777_216.0);
    }

    #[test]
    fn compare_predicates() {
        // C.LT
        assert_eq!(compare(1.0f32, 2.0, 0xC), (true, 0));
        // C.EQ
        assert_eq!(compare(2.0f64, 2.0, 0x2), (true, 0));
        // C.UN with a quiet NaN (MIPS quiet NaN has bit 22 clear)
        let qnan = f32::from_bits(0x7FBF_FFFF);
        assert_eq!(compare(qnan, 1.0, 0x1), (true, 0));
        // Signalling predicate on NaN raises invalid.
        assert_eq!(compare(qnan, 1.0, 0x9), (true, CAUSE_INVALID));
    }

    #[test]
    fn raise_sets_flags_only_when_not_trapping() {
        let mut fpu = Fpu::new();
        assert!(!fpu.raise(CAUSE_INEXACT));
        assert_eq!(fpu.fcr31 & (1 << 2), 1 << 2);
        assert_eq!(fpu.cause(), CAUSE_INEXACT);

        fpu.fcr31 |= CAUSE_OVERFLOW << 7;
        assert!(fpu.raise(CAUSE_OVERFLOW));
        assert_eq!(fpu.fcr31 & (CAUSE_OVERFLOW << 2), 0);
        assert!(fpu.raise(CAUSE_UNIMPLEMENTED));
    }
}
