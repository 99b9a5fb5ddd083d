//! R5900 instruction encoders.

#![allow(dead_code)]

// ── Formats ───────────────────────────────────────────────────

pub fn r_type(rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct
}

pub fn i_type(op: u32, rs: u32, rt: u32, imm: i32) -> u32 {
    (op << 26) | (rs << 21) | (rt << 16) | (imm as u32 & 0xFFFF)
}

pub fn j_type(op: u32, target: u32) -> u32 {
    (op << 26) | ((target >> 2) & 0x03FF_FFFF)
}

/// Little-endian image of an instruction sequence.
pub fn assemble(code: &[u32]) -> Vec<u8> {
    code.iter().flat_map(|w| w.to_le_bytes()).collect()
}

pub const NOP: u32 = 0;

// ── SPECIAL ───────────────────────────────────────────────────

pub fn sll(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x00)
}
pub fn srl(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x02)
}
pub fn sra(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x03)
}
pub fn sllv(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x04)
}
pub fn srlv(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x06)
}
pub fn srav(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x07)
}
pub fn jr(rs: u32) -> u32 {
    r_type(rs, 0, 0, 0, 0x08)
}
pub fn jalr(rd: u32, rs: u32) -> u32 {
    r_type(rs, 0, rd, 0, 0x09)
}
pub fn movz(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x0A)
}
pub fn movn(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x0B)
}
pub fn syscall(code: u32) -> u32 {
    (code << 6) | 0x0C
}
pub fn brk(code: u32) -> u32 {
    (code << 6) | 0x0D
}
pub fn mfhi(rd: u32) -> u32 {
    r_type(0, 0, rd, 0, 0x10)
}
pub fn mthi(rs: u32) -> u32 {
    r_type(rs, 0, 0, 0, 0x11)
}
pub fn mflo(rd: u32) -> u32 {
    r_type(0, 0, rd, 0, 0x12)
}
pub fn mtlo(rs: u32) -> u32 {
    r_type(rs, 0, 0, 0, 0x13)
}
pub fn dsllv(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x14)
}
pub fn dsrlv(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x16)
}
pub fn dsrav(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x17)
}
/// Three-operand form: `rd` also receives LO.
pub fn mult(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x18)
}
pub fn multu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x19)
}
pub fn div(rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, 0, 0, 0x1A)
}
pub fn divu(rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, 0, 0, 0x1B)
}
pub fn add(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x20)
}
pub fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x21)
}
pub fn sub(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x22)
}
pub fn subu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x23)
}
pub fn and(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x24)
}
pub fn or(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x25)
}
pub fn xor(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x26)
}
pub fn nor(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x27)
}
pub fn slt(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x2A)
}
pub fn sltu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x2B)
}
pub fn dadd(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x2C)
}
pub fn daddu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x2D)
}
pub fn dsubu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x2F)
}
pub fn dsll(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x38)
}
pub fn dsrl(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x3A)
}
pub fn dsra(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x3B)
}
pub fn dsll32(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x3C)
}
pub fn dsra32(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x3F)
}

// ── Immediate ─────────────────────────────────────────────────

pub fn addi(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x08, rs, rt, imm)
}
pub fn addiu(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x09, rs, rt, imm)
}
pub fn slti(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x0A, rs, rt, imm)
}
pub fn sltiu(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x0B, rs, rt, imm)
}
pub fn andi(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x0C, rs, rt, imm)
}
pub fn ori(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x0D, rs, rt, imm)
}
pub fn xori(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x0E, rs, rt, imm)
}
pub fn lui(rt: u32, imm: i32) -> u32 {
    i_type(0x0F, 0, rt, imm)
}
pub fn daddi(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x18, rs, rt, imm)
}
pub fn daddiu(rt: u32, rs: u32, imm: i32) -> u32 {
    i_type(0x19, rs, rt, imm)
}

// ── Branches and jumps ────────────────────────────────────────
// Branch offsets are in instructions, relative to the delay slot.

pub fn beq(rs: u32, rt: u32, off: i32) -> u32 {
    i_type(0x04, rs, rt, off)
}
pub fn bne(rs: u32, rt: u32, off: i32) -> u32 {
    i_type(0x05, rs, rt, off)
}
pub fn blez(rs: u32, off: i32) -> u32 {
    i_type(0x06, rs, 0, off)
}
pub fn bgtz(rs: u32, off: i32) -> u32 {
    i_type(0x07, rs, 0, off)
}
pub fn beql(rs: u32, rt: u32, off: i32) -> u32 {
    i_type(0x14, rs, rt, off)
}
pub fn bnel(rs: u32, rt: u32, off: i32) -> u32 {
    i_type(0x15, rs, rt, off)
}
pub fn bltz(rs: u32, off: i32) -> u32 {
    i_type(0x01, rs, 0x00, off)
}
pub fn bgez(rs: u32, off: i32) -> u32 {
    i_type(0x01, rs, 0x01, off)
}
pub fn bgezal(rs: u32, off: i32) -> u32 {
    i_type(0x01, rs, 0x11, off)
}
pub fn j(target: u32) -> u32 {
    j_type(0x02, target)
}
pub fn jal(target: u32) -> u32 {
    j_type(0x03, target)
}

// ── Loads and stores ──────────────────────────────────────────

pub fn lb(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x20, base, rt, off)
}
pub fn lh(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x21, base, rt, off)
}
pub fn lw(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x23, base, rt, off)
}
pub fn lbu(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x24, base, rt, off)
}
pub fn lhu(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x25, base, rt, off)
}
pub fn lwu(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x27, base, rt, off)
}
pub fn ld(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x37, base, rt, off)
}
pub fn lq(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x1E, base, rt, off)
}
pub fn sb(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x28, base, rt, off)
}
pub fn sh(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x29, base, rt, off)
}
pub fn sw(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x2B, base, rt, off)
}
pub fn sd(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x3F, base, rt, off)
}
pub fn sq(rt: u32, base: u32, off: i32) -> u32 {
    i_type(0x1F, base, rt, off)
}

// ── COP0 ──────────────────────────────────────────────────────

pub fn mfc0(rt: u32, rd: u32) -> u32 {
    (0x10 << 26) | r_type(0x00, rt, rd, 0, 0)
}
pub fn mtc0(rt: u32, rd: u32) -> u32 {
    (0x10 << 26) | r_type(0x04, rt, rd, 0, 0)
}
pub const ERET: u32 = 0x4200_0018;
pub const EI: u32 = 0x4200_0038;
pub const DI: u32 = 0x4200_0039;

// ── COP1 ──────────────────────────────────────────────────────

pub fn mfc1(rt: u32, fs: u32) -> u32 {
    (0x11 << 26) | r_type(0x00, rt, fs, 0, 0)
}
pub fn cfc1(rt: u32, fs: u32) -> u32 {
    (0x11 << 26) | r_type(0x02, rt, fs, 0, 0)
}
pub fn mtc1(rt: u32, fs: u32) -> u32 {
    (0x11 << 26) | r_type(0x04, rt, fs, 0, 0)
}
pub fn ctc1(rt: u32, fs: u32) -> u32 {
    (0x11 << 26) | r_type(0x06, rt, fs, 0, 0)
}
fn fmt_s(fd: u32, fs: u32, ft: u32, funct: u32) -> u32 {
    (0x11 << 26) | r_type(0x10, ft, fs, fd, funct)
}
pub fn add_s(fd: u32, fs: u32, ft: u32) -> u32 {
    fmt_s(fd, fs, ft, 0x00)
}
pub fn mul_s(fd: u32, fs: u32, ft: u32) -> u32 {
    fmt_s(fd, fs, ft, 0x02)
}
pub fn c_lt_s(fs: u32, ft: u32) -> u32 {
    fmt_s(0, fs, ft, 0x34)
}
pub fn bc1t(off: i32) -> u32 {
    i_type(0x11, 0x08, 1, off)
}
pub fn bc1f(off: i32) -> u32 {
    i_type(0x11, 0x08, 0, off)
}
pub fn lwc1(ft: u32, base: u32, off: i32) -> u32 {
    i_type(0x31, base, ft, off)
}
pub fn swc1(ft: u32, base: u32, off: i32) -> u32 {
    i_type(0x39, base, ft, off)
}

// ── MMI ───────────────────────────────────────────────────────

fn mmi(rd: u32, rs: u32, rt: u32, sub: u32, funct: u32) -> u32 {
    (0x1C << 26) | r_type(rs, rt, rd, sub, funct)
}
pub fn paddw(rd: u32, rs: u32, rt: u32) -> u32 {
    mmi(rd, rs, rt, 0x00, 0x08)
}
pub fn psubw(rd: u32, rs: u32, rt: u32) -> u32 {
    mmi(rd, rs, rt, 0x01, 0x08)
}
pub fn pand(rd: u32, rs: u32, rt: u32) -> u32 {
    mmi(rd, rs, rt, 0x12, 0x09)
}
pub fn por(rd: u32, rs: u32, rt: u32) -> u32 {
    mmi(rd, rs, rt, 0x12, 0x29)
}
