//! Guest instruction semantics that are too irregular to express as
//! a short host instruction sequence. Both execution tiers call into
//! these, so they are the single definition of the quirky parts of
//! the Emotion Engine.

pub mod cop0;
pub mod fpu;
pub mod mmi;
pub mod muldiv;

/// Sign-extend the low 32 bits of `v` to 64 bits.
#[inline]
pub const fn sext32(v: u64) -> u64 {
    v as u32 as i32 as i64 as u64
}

/// Sign-extend a 16-bit immediate.
#[inline]
pub const fn simm(imm: u16) -> u64 {
    imm as i16 as i64 as u64
}
