//! R5900 single-precision FPU.
//!
//! The unit is not IEEE 754 compliant: it has no infinities, NaNs or
//! denormals, rounds every result toward zero and clamps overflow to
//! the largest finite value. Results are computed exactly in `f64`
//! and then truncated, so the outcome never depends on the host's
//! floating-point environment.

use crate::cpu::{fcr31, CpuState, FCR0_VALUE};
use crate::op::{FpuCond, FpuOp};

const SIGN: u32 = 0x8000_0000;
const EXP_MASK: u32 = 0x7F80_0000;
const MANT_MASK: u32 = 0x007F_FFFF;
/// Largest finite single, positive.
pub const POS_FMAX: u32 = 0x7F7F_FFFF;

/// Read a register operand the way the hardware sees it: exponent
/// 255 is an ordinary (clamped) value and denormals are zero.
pub fn operand(bits: u32) -> f64 {
    match bits & EXP_MASK {
        EXP_MASK => f32::from_bits((bits & SIGN) | POS_FMAX) as f64,
        0 => f32::from_bits(bits & SIGN) as f64,
        _ => f32::from_bits(bits) as f64,
    }
}

enum Rounded {
    Value(u32),
    Overflow(u32),
    Underflow(u32),
}

fn toward_zero(f: f32) -> f32 {
    if f == 0.0 {
        f
    } else {
        f32::from_bits(f.to_bits() - 1)
    }
}

/// Truncate the exact value `hi + lo` to single precision. `lo` is
/// the rounding error of `hi` and is zero unless `hi` came from an
/// inexact addition.
fn truncate(hi: f64, lo: f64) -> Rounded {
    let sign = if hi.is_sign_negative() { SIGN } else { 0 };
    if hi.abs() > f32::MAX as f64 {
        return Rounded::Overflow(sign);
    }
    if hi != 0.0 && hi.abs() < f32::MIN_POSITIVE as f64 {
        return Rounded::Underflow(sign);
    }
    let mut f = hi as f32;
    if (f as f64).abs() > hi.abs() {
        f = toward_zero(f);
    } else if f as f64 == hi && lo != 0.0 && (lo < 0.0) != (hi < 0.0) {
        f = toward_zero(f);
        if f.to_bits() & EXP_MASK == 0 && f.to_bits() & MANT_MASK != 0 {
            return Rounded::Underflow(sign);
        }
    }
    Rounded::Value(f.to_bits())
}

/// Error-free transformation of `a + b` into `(sum, error)`.
fn two_sum(a: f64, b: f64) -> (f64, f64) {
    let s = a + b;
    let bb = s - a;
    let err = (a - (s - bb)) + (b - bb);
    (s, err)
}

/// Store a rounded result, clamping and raising O/U as needed.
fn commit(cpu: &mut CpuState, fd: u8, r: Rounded) {
    cpu.fcr31 &= !(fcr31::O | fcr31::U);
    let bits = match r {
        Rounded::Value(b) => b,
        Rounded::Overflow(sign) => {
            cpu.fcr31 |= fcr31::O | fcr31::SO;
            sign | POS_FMAX
        }
        Rounded::Underflow(sign) => {
            cpu.fcr31 |= fcr31::U | fcr31::SU;
            sign
        }
    };
    cpu.fpr[fd as usize] = bits;
}

fn divide(cpu: &mut CpuState, fd: u8, fs: u8, ft: u8) {
    let n = cpu.fpr[fs as usize];
    let d = cpu.fpr[ft as usize];
    cpu.fcr31 &= !(fcr31::D | fcr31::I);
    if d & EXP_MASK == 0 {
        if n & EXP_MASK == 0 {
            cpu.fcr31 |= fcr31::I | fcr31::SI;
        } else {
            cpu.fcr31 |= fcr31::D | fcr31::SD;
        }
        cpu.fpr[fd as usize] = ((n ^ d) & SIGN) | POS_FMAX;
        return;
    }
    let q = operand(n) / operand(d);
    commit(cpu, fd, truncate(q, 0.0));
}

fn sqrt(cpu: &mut CpuState, fd: u8, ft: u8) {
    let t = cpu.fpr[ft as usize];
    cpu.fcr31 &= !(fcr31::D | fcr31::I);
    if t & EXP_MASK == 0 {
        cpu.fpr[fd as usize] = t & SIGN;
        return;
    }
    if t & SIGN != 0 {
        cpu.fcr31 |= fcr31::I | fcr31::SI;
    }
    let r = operand(t).abs().sqrt();
    cpu.fpr[fd as usize] = match truncate(r, 0.0) {
        Rounded::Value(b) => b,
        Rounded::Overflow(_) | Rounded::Underflow(_) => 0,
    };
}

fn cvt_w_s(bits: u32) -> u32 {
    // Exponent at most 157: |value| < 2^31 fits an i32.
    if bits & EXP_MASK <= 0x4E80_0000 {
        operand(bits).trunc() as i32 as u32
    } else if bits & SIGN == 0 {
        0x7FFF_FFFF
    } else {
        0x8000_0000
    }
}

/// Execute `fd = op(fs, ft)`. Unary operations read `fs`, except
/// SQRT which reads `ft`.
pub fn arith(cpu: &mut CpuState, op: FpuOp, fd: u8, fs: u8, ft: u8) {
    let s = cpu.fpr[fs as usize];
    let t = cpu.fpr[ft as usize];
    match op {
        FpuOp::Add => {
            let (hi, lo) = two_sum(operand(s), operand(t));
            commit(cpu, fd, truncate(hi, lo));
        }
        FpuOp::Sub => {
            let (hi, lo) = two_sum(operand(s), -operand(t));
            commit(cpu, fd, truncate(hi, lo));
        }
        FpuOp::Mul => commit(cpu, fd, truncate(operand(s) * operand(t), 0.0)),
        FpuOp::Div => divide(cpu, fd, fs, ft),
        FpuOp::Sqrt => sqrt(cpu, fd, ft),
        FpuOp::Abs => {
            cpu.fcr31 &= !(fcr31::O | fcr31::U);
            cpu.fpr[fd as usize] = s & !SIGN;
        }
        FpuOp::Neg => {
            cpu.fcr31 &= !(fcr31::O | fcr31::U);
            cpu.fpr[fd as usize] = s ^ SIGN;
        }
        FpuOp::Mov => cpu.fpr[fd as usize] = s,
        FpuOp::CvtWS => cpu.fpr[fd as usize] = cvt_w_s(s),
        FpuOp::CvtSW => {
            let bits = match truncate(s as i32 as f64, 0.0) {
                Rounded::Value(b) => b,
                Rounded::Overflow(_) | Rounded::Underflow(_) => 0,
            };
            cpu.fpr[fd as usize] = bits;
        }
    }
}

/// C.cond.S: set or clear the condition bit.
pub fn compare(cpu: &mut CpuState, cond: FpuCond, fs: u8, ft: u8) {
    let a = operand(cpu.fpr[fs as usize]);
    let b = operand(cpu.fpr[ft as usize]);
    let c = match cond {
        FpuCond::F => false,
        FpuCond::Eq => a == b,
        FpuCond::Lt => a < b,
        FpuCond::Le => a <= b,
    };
    if c {
        cpu.fcr31 |= fcr31::C;
    } else {
        cpu.fcr31 &= !fcr31::C;
    }
}

/// CFC1: only FCR0 and FCR31 exist.
pub fn read_control(cpu: &CpuState, fs: u8) -> u32 {
    match fs {
        0 => FCR0_VALUE,
        31 => cpu.fcr31,
        _ => 0,
    }
}

/// CTC1: writes to anything but FCR31 are ignored.
pub fn write_control(cpu: &mut CpuState, fs: u8, value: u32) {
    if fs == 31 {
        cpu.fcr31 = value & fcr31::WRITABLE;
    }
}

/// Whether the condition bit is set.
pub fn condition(cpu: &CpuState) -> bool {
    cpu.fcr31 & fcr31::C != 0
}
