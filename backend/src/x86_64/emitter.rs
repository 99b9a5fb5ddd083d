#![allow(non_upper_case_globals)]

use crate::code_buffer::CodeBuffer;
use crate::x86_64::regs::Reg;

// -- Prefix flags --

pub const P_EXT: u32 = 0x100; // 0x0F prefix
pub const P_DATA16: u32 = 0x400; // 0x66 prefix
pub const P_REXW: u32 = 0x1000; // REX.W = 1
pub const P_REXB_R: u32 = 0x2000; // REG field as byte register
pub const P_REXB_RM: u32 = 0x4000; // R/M field as byte register

// -- Opcode constants (OPC_*) --

// Arithmetic
pub const OPC_ARITH_EvIb: u32 = 0x83;
pub const OPC_ARITH_EvIz: u32 = 0x81;
pub const OPC_ARITH_GvEv: u32 = 0x03;

// Shift
pub const OPC_SHIFT_1: u32 = 0xD1;
pub const OPC_SHIFT_Ib: u32 = 0xC1;
pub const OPC_SHIFT_cl: u32 = 0xD3;

// Data movement
pub const OPC_MOVL_EvGv: u32 = 0x89;
pub const OPC_MOVL_GvEv: u32 = 0x8B;
pub const OPC_MOVL_EvIz: u32 = 0xC7;
pub const OPC_MOVL_Iv: u32 = 0xB8;

// Extensions
pub const OPC_MOVZBL: u32 = 0xB6 | P_EXT;
pub const OPC_MOVSBQ: u32 = 0xBE | P_EXT | P_REXW;
pub const OPC_MOVSWQ: u32 = 0xBF | P_EXT | P_REXW;
pub const OPC_MOVSLQ: u32 = 0x63 | P_REXW;

// Branch
pub const OPC_JCC_long: u32 = 0x80 | P_EXT;
pub const OPC_JMP_long: u32 = 0xE9;

// Compare / conditional
pub const OPC_CMOVCC: u32 = 0x40 | P_EXT;
pub const OPC_SETCC: u32 = 0x90 | P_EXT | P_REXB_RM;
pub const OPC_TESTL: u32 = 0x85;

// Group opcodes
pub const OPC_GRP3_Ev: u32 = 0xF7;
pub const OPC_GRP5: u32 = 0xFF;

// Multiply
pub const OPC_IMUL_GvEv: u32 = 0xAF | P_EXT;

// Misc
pub const OPC_PUSH_r32: u32 = 0x50;
pub const OPC_POP_r32: u32 = 0x58;
pub const OPC_RET: u32 = 0xC3;

// -- Sub-operation enums --

/// Arithmetic sub-opcodes (used in /r field of 0x81/0x83 and shifted into GvEv).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArithOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Shift sub-opcodes (used in /r field of 0xC1/0xD1/0xD3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Group 3 extension codes (used in /r field of 0xF7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ext3Op {
    Test = 0,
    Not = 2,
}

/// Group 5 extension codes (used in /r field of 0xFF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ext5Op {
    CallN = 2,
}

/// x86 condition codes for Jcc/SETcc/CMOVcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum X86Cond {
    Jo = 0x0,
    Jno = 0x1,
    Jb = 0x2,
    Jae = 0x3,
    Je = 0x4,
    Jne = 0x5,
    Jbe = 0x6,
    Ja = 0x7,
    Js = 0x8,
    Jns = 0x9,
    Jp = 0xA,
    Jnp = 0xB,
    Jl = 0xC,
    Jge = 0xD,
    Jle = 0xE,
    Jg = 0xF,
}

impl X86Cond {
    const ALL: [X86Cond; 16] = [
        X86Cond::Jo,
        X86Cond::Jno,
        X86Cond::Jb,
        X86Cond::Jae,
        X86Cond::Je,
        X86Cond::Jne,
        X86Cond::Jbe,
        X86Cond::Ja,
        X86Cond::Js,
        X86Cond::Jns,
        X86Cond::Jp,
        X86Cond::Jnp,
        X86Cond::Jl,
        X86Cond::Jge,
        X86Cond::Jle,
        X86Cond::Jg,
    ];

    /// Return the inverted condition.
    pub fn invert(self) -> Self {
        // Conditions come in pairs differing in the low bit.
        Self::ALL[(self as usize) ^ 1]
    }
}

// -- Core encoding functions --

/// Helper: return P_REXW if `rexw` is true.
#[inline]
fn rexw_flag(rexw: bool) -> u32 {
    if rexw {
        P_REXW
    } else {
        0
    }
}

/// Emit opcode with REX prefix. `r` is the reg field, `rm` is the r/m field.
/// Both are raw register numbers (0-15). Pass 0 for unused fields.
pub fn emit_opc(buf: &mut CodeBuffer, opc: u32, r: u8, rm: u8) {
    let mut rex: u8 = 0;
    if opc & P_REXW != 0 {
        rex |= 0x08; // REX.W
    }
    if r >= 8 {
        rex |= 0x04; // REX.R
    }
    if rm >= 8 {
        rex |= 0x01; // REX.B
    }
    // Byte access to SPL/BPL/SIL/DIL needs a REX prefix, even an empty one.
    if (opc & P_REXB_R != 0 && r >= 4) || (opc & P_REXB_RM != 0 && rm >= 4) {
        rex |= 0x40;
    }

    if opc & P_DATA16 != 0 {
        buf.emit_u8(0x66);
    }
    if rex != 0 {
        buf.emit_u8(0x40 | rex);
    }
    if opc & P_EXT != 0 {
        buf.emit_u8(0x0F);
    }
    buf.emit_u8(opc as u8);
}

/// Emit opcode + ModR/M for register-register operation.
pub fn emit_modrm(buf: &mut CodeBuffer, opc: u32, r: Reg, rm: Reg) {
    emit_opc(buf, opc, r as u8, rm as u8);
    buf.emit_u8(0xC0 | (r.low3() << 3) | rm.low3());
}

/// Emit opcode + ModR/M with /r extension (for group opcodes).
pub fn emit_modrm_ext(buf: &mut CodeBuffer, opc: u32, ext: u8, rm: Reg) {
    emit_opc(buf, opc, ext, rm as u8);
    buf.emit_u8(0xC0 | (ext << 3) | rm.low3());
}

/// ModR/M (and SIB) + displacement for [base + offset] with `r3` in
/// the reg field. RBP/R13 need an explicit displacement, RSP/R12 a SIB.
fn emit_mem_operand(buf: &mut CodeBuffer, r3: u8, base: Reg, offset: i32) {
    let b3 = base.low3();
    let mode = if offset == 0 && b3 != 5 {
        0x00
    } else if (-128..=127).contains(&offset) {
        0x40
    } else {
        0x80
    };
    if b3 == 4 {
        buf.emit_u8(mode | (r3 << 3) | 0x04);
        buf.emit_u8(0x24);
    } else {
        buf.emit_u8(mode | (r3 << 3) | b3);
    }
    if mode == 0x40 {
        buf.emit_u8(offset as u8);
    } else if mode == 0x80 {
        buf.emit_u32(offset as u32);
    }
}

/// Emit opcode + ModR/M + displacement for memory [base + offset].
pub fn emit_modrm_offset(buf: &mut CodeBuffer, opc: u32, r: Reg, base: Reg, offset: i32) {
    emit_opc(buf, opc, r as u8, base as u8);
    emit_mem_operand(buf, r.low3(), base, offset);
}

/// Emit opcode + ModR/M with /r extension for memory [base + offset].
pub fn emit_modrm_ext_offset(buf: &mut CodeBuffer, opc: u32, ext: u8, base: Reg, offset: i32) {
    emit_opc(buf, opc, ext, base as u8);
    emit_mem_operand(buf, ext, base, offset);
}

// -- Arithmetic instructions --

/// Emit arithmetic reg, reg (ADD/SUB/AND/OR/XOR/CMP/ADC/SBB).
pub fn emit_arith_rr(buf: &mut CodeBuffer, op: ArithOp, rexw: bool, dst: Reg, src: Reg) {
    let opc = (OPC_ARITH_GvEv + ((op as u32) << 3)) | rexw_flag(rexw);
    emit_modrm(buf, opc, dst, src);
}

/// Emit arithmetic reg, imm (auto-selects imm8 vs imm32).
pub fn emit_arith_ri(buf: &mut CodeBuffer, op: ArithOp, rexw: bool, dst: Reg, imm: i32) {
    let w = rexw_flag(rexw);
    if (-128..=127).contains(&imm) {
        emit_modrm_ext(buf, OPC_ARITH_EvIb | w, op as u8, dst);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext(buf, OPC_ARITH_EvIz | w, op as u8, dst);
        buf.emit_u32(imm as u32);
    }
}

/// Emit 32-bit arithmetic [base+offset], imm (e.g. `cmp dword [rbp+x], 0`).
pub fn emit_arith_mi(buf: &mut CodeBuffer, op: ArithOp, base: Reg, offset: i32, imm: i32) {
    if (-128..=127).contains(&imm) {
        emit_modrm_ext_offset(buf, OPC_ARITH_EvIb, op as u8, base, offset);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext_offset(buf, OPC_ARITH_EvIz, op as u8, base, offset);
        buf.emit_u32(imm as u32);
    }
}

/// Emit NOT reg.
pub fn emit_not(buf: &mut CodeBuffer, rexw: bool, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP3_Ev | rexw_flag(rexw), Ext3Op::Not as u8, reg);
}

// -- Shift instructions --

/// Emit shift reg, imm8.
pub fn emit_shift_ri(buf: &mut CodeBuffer, op: ShiftOp, rexw: bool, dst: Reg, imm: u8) {
    let w = rexw_flag(rexw);
    if imm == 1 {
        emit_modrm_ext(buf, OPC_SHIFT_1 | w, op as u8, dst);
    } else {
        emit_modrm_ext(buf, OPC_SHIFT_Ib | w, op as u8, dst);
        buf.emit_u8(imm);
    }
}

/// Emit shift reg, CL.
pub fn emit_shift_cl(buf: &mut CodeBuffer, op: ShiftOp, rexw: bool, dst: Reg) {
    emit_modrm_ext(buf, OPC_SHIFT_cl | rexw_flag(rexw), op as u8, dst);
}

// -- Data movement --

/// Emit MOV reg, reg (32-bit or 64-bit).
pub fn emit_mov_rr(buf: &mut CodeBuffer, rexw: bool, dst: Reg, src: Reg) {
    emit_modrm(buf, OPC_MOVL_EvGv | rexw_flag(rexw), src, dst);
}

/// Emit MOV reg, imm (32-bit or 64-bit). Zero is materialized with
/// XOR, which clobbers the flags.
pub fn emit_mov_ri(buf: &mut CodeBuffer, rexw: bool, reg: Reg, val: u64) {
    if val == 0 {
        emit_modrm(buf, 0x31, reg, reg);
    } else if !rexw || val <= u32::MAX as u64 {
        emit_mov_ri32(buf, reg, val as u32);
    } else if val as i64 >= i32::MIN as i64 && val as i64 <= i32::MAX as i64 {
        emit_modrm_ext(buf, OPC_MOVL_EvIz | P_REXW, 0, reg);
        buf.emit_u32(val as u32);
    } else {
        emit_opc(
            buf,
            (OPC_MOVL_Iv + (reg.low3() as u32)) | P_REXW,
            0,
            reg as u8,
        );
        buf.emit_u64(val);
    }
}

/// Emit MOV r32, imm32. Never touches the flags.
pub fn emit_mov_ri32(buf: &mut CodeBuffer, reg: Reg, val: u32) {
    emit_opc(buf, OPC_MOVL_Iv + (reg.low3() as u32), 0, reg as u8);
    buf.emit_u32(val);
}

/// Emit a zero- or sign-extension (MOVZBL, MOVZWL, MOVSBQ, MOVSWQ, MOVSLQ).
pub fn emit_movx(buf: &mut CodeBuffer, opc: u32, dst: Reg, src: Reg) {
    emit_modrm(buf, opc, dst, src);
}

// -- Memory operations --

/// Emit MOV reg, [base+offset] (load).
pub fn emit_load(buf: &mut CodeBuffer, rexw: bool, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVL_GvEv | rexw_flag(rexw), dst, base, offset);
}

/// Emit sign-extend load: MOVSLQ [base+offset].
pub fn emit_load_sx(buf: &mut CodeBuffer, opc: u32, dst: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, opc, dst, base, offset);
}

/// Emit MOV [base+offset], reg (store).
pub fn emit_store(buf: &mut CodeBuffer, rexw: bool, src: Reg, base: Reg, offset: i32) {
    emit_modrm_offset(buf, OPC_MOVL_EvGv | rexw_flag(rexw), src, base, offset);
}

/// Emit MOV dword [base+offset], imm32.
pub fn emit_store_imm(buf: &mut CodeBuffer, base: Reg, offset: i32, imm: u32) {
    emit_modrm_ext_offset(buf, OPC_MOVL_EvIz, 0, base, offset);
    buf.emit_u32(imm);
}

// -- Multiply --

/// Emit two-operand IMUL: dst = dst * src.
pub fn emit_imul_rr(buf: &mut CodeBuffer, rexw: bool, dst: Reg, src: Reg) {
    emit_modrm(buf, OPC_IMUL_GvEv | rexw_flag(rexw), dst, src);
}

// -- Branches and comparisons --

/// Emit Jcc rel32 with a zero displacement. Returns the offset of the
/// displacement field for later patching.
pub fn emit_jcc_rel32(buf: &mut CodeBuffer, cond: X86Cond) -> usize {
    emit_opc(buf, OPC_JCC_long + (cond as u32), 0, 0);
    let at = buf.offset();
    buf.emit_u32(0);
    at
}

/// Emit JMP rel32 with a zero displacement. Returns the offset of the
/// displacement field.
pub fn emit_jmp_rel32(buf: &mut CodeBuffer) -> usize {
    buf.emit_u8(OPC_JMP_long as u8);
    let at = buf.offset();
    buf.emit_u32(0);
    at
}

/// Emit indirect CALL through register.
pub fn emit_call_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::CallN as u8, reg);
}

/// Emit SETcc dst (set byte on condition).
pub fn emit_setcc(buf: &mut CodeBuffer, cond: X86Cond, dst: Reg) {
    emit_modrm_ext(buf, OPC_SETCC + (cond as u32), 0, dst);
}

/// Emit CMOVcc dst, src (conditional move).
pub fn emit_cmovcc(buf: &mut CodeBuffer, cond: X86Cond, rexw: bool, dst: Reg, src: Reg) {
    emit_modrm(
        buf,
        (OPC_CMOVCC + (cond as u32)) | rexw_flag(rexw),
        dst,
        src,
    );
}

/// Emit TEST reg, reg.
pub fn emit_test_rr(buf: &mut CodeBuffer, rexw: bool, r1: Reg, r2: Reg) {
    emit_modrm(buf, OPC_TESTL | rexw_flag(rexw), r1, r2);
}

/// Emit TEST dword [base+offset], imm32.
pub fn emit_test_mi(buf: &mut CodeBuffer, base: Reg, offset: i32, imm: u32) {
    emit_modrm_ext_offset(buf, OPC_GRP3_Ev, Ext3Op::Test as u8, base, offset);
    buf.emit_u32(imm);
}

// -- Miscellaneous --

/// Emit PUSH reg.
pub fn emit_push(buf: &mut CodeBuffer, reg: Reg) {
    emit_opc(buf, OPC_PUSH_r32 + (reg.low3() as u32), 0, reg as u8);
}

/// Emit POP reg.
pub fn emit_pop(buf: &mut CodeBuffer, reg: Reg) {
    emit_opc(buf, OPC_POP_r32 + (reg.low3() as u32), 0, reg as u8);
}

/// Emit RET.
pub fn emit_ret(buf: &mut CodeBuffer) {
    buf.emit_u8(OPC_RET as u8);
}
