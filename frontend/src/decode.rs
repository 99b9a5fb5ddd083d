//! R5900 instruction decoder.
//!
//! Pure and stateless: the same word always yields the same
//! `Operation`, and unknown encodings become `Operation::Reserved`.

use ee_core::op::*;

#[inline]
const fn rs(w: u32) -> u8 {
    ((w >> 21) & 31) as u8
}
#[inline]
const fn rt(w: u32) -> u8 {
    ((w >> 16) & 31) as u8
}
#[inline]
const fn rd(w: u32) -> u8 {
    ((w >> 11) & 31) as u8
}
#[inline]
const fn sa(w: u32) -> u8 {
    ((w >> 6) & 31) as u8
}
#[inline]
const fn funct(w: u32) -> u32 {
    w & 63
}
#[inline]
const fn imm(w: u32) -> u16 {
    w as u16
}

/// Decode one instruction word.
pub fn decode(w: u32) -> Operation {
    if w == 0 {
        return Operation::Nop;
    }
    let reserved = Operation::Reserved { word: w };
    match w >> 26 {
        0x00 => decode_special(w),
        0x01 => decode_regimm(w),
        0x02 => Operation::Jump { index: w & 0x03FF_FFFF, link: false },
        0x03 => Operation::Jump { index: w & 0x03FF_FFFF, link: true },
        0x04 => branch(w, BranchCond::Eq, false),
        0x05 => branch(w, BranchCond::Ne, false),
        0x06 => branch(w, BranchCond::Lez, false),
        0x07 => branch(w, BranchCond::Gtz, false),
        0x08 => alu_imm(w, AluImmOp::Addi),
        0x09 => alu_imm(w, AluImmOp::Addiu),
        0x0A => alu_imm(w, AluImmOp::Slti),
        0x0B => alu_imm(w, AluImmOp::Sltiu),
        0x0C => alu_imm(w, AluImmOp::Andi),
        0x0D => alu_imm(w, AluImmOp::Ori),
        0x0E => alu_imm(w, AluImmOp::Xori),
        0x0F => Operation::Lui { rt: rt(w), imm: imm(w) },
        0x10 => decode_cop0(w),
        0x11 => decode_cop1(w),
        0x14 => branch(w, BranchCond::Eq, true),
        0x15 => branch(w, BranchCond::Ne, true),
        0x16 => branch(w, BranchCond::Lez, true),
        0x17 => branch(w, BranchCond::Gtz, true),
        0x18 => alu_imm(w, AluImmOp::Daddi),
        0x19 => alu_imm(w, AluImmOp::Daddiu),
        0x1C => decode_mmi(w),
        0x1E => load(w, LoadOp::Lq),
        0x1F => store(w, StoreOp::Sq),
        0x20 => load(w, LoadOp::Lb),
        0x21 => load(w, LoadOp::Lh),
        0x23 => load(w, LoadOp::Lw),
        0x24 => load(w, LoadOp::Lbu),
        0x25 => load(w, LoadOp::Lhu),
        0x27 => load(w, LoadOp::Lwu),
        0x28 => store(w, StoreOp::Sb),
        0x29 => store(w, StoreOp::Sh),
        0x2B => store(w, StoreOp::Sw),
        // CACHE, PREF: no architectural effect here.
        0x2F | 0x33 => Operation::Nop,
        0x31 => Operation::FpuLoad {
            ft: rt(w),
            base: rs(w),
            offset: imm(w) as i16,
        },
        0x37 => load(w, LoadOp::Ld),
        0x39 => Operation::FpuStore {
            ft: rt(w),
            base: rs(w),
            offset: imm(w) as i16,
        },
        0x3F => store(w, StoreOp::Sd),
        _ => reserved,
    }
}

fn branch(w: u32, cond: BranchCond, likely: bool) -> Operation {
    Operation::Branch {
        cond,
        rs: rs(w),
        rt: if cond.uses_rt() { rt(w) } else { 0 },
        offset: imm(w) as i16,
        likely,
        link: false,
    }
}

fn alu_imm(w: u32, op: AluImmOp) -> Operation {
    Operation::AluImm {
        op,
        rt: rt(w),
        rs: rs(w),
        imm: imm(w),
    }
}

fn load(w: u32, op: LoadOp) -> Operation {
    Operation::Load {
        op,
        rt: rt(w),
        base: rs(w),
        offset: imm(w) as i16,
    }
}

fn store(w: u32, op: StoreOp) -> Operation {
    Operation::Store {
        op,
        rt: rt(w),
        base: rs(w),
        offset: imm(w) as i16,
    }
}

fn decode_special(w: u32) -> Operation {
    let (rd, rs, rt, sa) = (rd(w), rs(w), rt(w), sa(w));
    let alu = |op| Operation::Alu { op, rd, rs, rt };
    let shift = |op| Operation::Shift { op, rd, rt, sa };
    let shiftv = |op| Operation::ShiftVar { op, rd, rt, rs };
    match funct(w) {
        0x00 => shift(ShiftOp::Sll),
        0x02 => shift(ShiftOp::Srl),
        0x03 => shift(ShiftOp::Sra),
        0x04 => shiftv(ShiftVarOp::Sllv),
        0x06 => shiftv(ShiftVarOp::Srlv),
        0x07 => shiftv(ShiftVarOp::Srav),
        0x08 => Operation::JumpReg { rs, link: None },
        0x09 => Operation::JumpReg { rs, link: Some(rd) },
        0x0A => Operation::CondMove { op: CondMoveOp::Movz, rd, rs, rt },
        0x0B => Operation::CondMove { op: CondMoveOp::Movn, rd, rs, rt },
        0x0C => Operation::Syscall { code: (w >> 6) & 0xF_FFFF },
        0x0D => Operation::Break { code: (w >> 6) & 0xF_FFFF },
        0x0F => Operation::Sync,
        0x10 => Operation::HiLo { op: HiLoOp::Mfhi, reg: rd },
        0x11 => Operation::HiLo { op: HiLoOp::Mthi, reg: rs },
        0x12 => Operation::HiLo { op: HiLoOp::Mflo, reg: rd },
        0x13 => Operation::HiLo { op: HiLoOp::Mtlo, reg: rs },
        0x14 => shiftv(ShiftVarOp::Dsllv),
        0x16 => shiftv(ShiftVarOp::Dsrlv),
        0x17 => shiftv(ShiftVarOp::Dsrav),
        0x18 => Operation::MulDiv { op: MulDivOp::Mult, rd, rs, rt },
        0x19 => Operation::MulDiv { op: MulDivOp::Multu, rd, rs, rt },
        0x1A => Operation::MulDiv { op: MulDivOp::Div, rd: 0, rs, rt },
        0x1B => Operation::MulDiv { op: MulDivOp::Divu, rd: 0, rs, rt },
        0x20 => alu(AluOp::Add),
        0x21 => alu(AluOp::Addu),
        0x22 => alu(AluOp::Sub),
        0x23 => alu(AluOp::Subu),
        0x24 => alu(AluOp::And),
        0x25 => alu(AluOp::Or),
        0x26 => alu(AluOp::Xor),
        0x27 => alu(AluOp::Nor),
        0x2A => alu(AluOp::Slt),
        0x2B => alu(AluOp::Sltu),
        0x2C => alu(AluOp::Dadd),
        0x2D => alu(AluOp::Daddu),
        0x2E => alu(AluOp::Dsub),
        0x2F => alu(AluOp::Dsubu),
        0x38 => shift(ShiftOp::Dsll),
        0x3A => shift(ShiftOp::Dsrl),
        0x3B => shift(ShiftOp::Dsra),
        0x3C => shift(ShiftOp::Dsll32),
        0x3E => shift(ShiftOp::Dsrl32),
        0x3F => shift(ShiftOp::Dsra32),
        _ => Operation::Reserved { word: w },
    }
}

fn decode_regimm(w: u32) -> Operation {
    let (cond, likely, link) = match rt(w) {
        0x00 => (BranchCond::Ltz, false, false),
        0x01 => (BranchCond::Gez, false, false),
        0x02 => (BranchCond::Ltz, true, false),
        0x03 => (BranchCond::Gez, true, false),
        0x10 => (BranchCond::Ltz, false, true),
        0x11 => (BranchCond::Gez, false, true),
        0x12 => (BranchCond::Ltz, true, true),
        0x13 => (BranchCond::Gez, true, true),
        _ => return Operation::Reserved { word: w },
    };
    Operation::Branch {
        cond,
        rs: rs(w),
        rt: 0,
        offset: imm(w) as i16,
        likely,
        link,
    }
}

fn decode_cop0(w: u32) -> Operation {
    match rs(w) {
        0x00 => Operation::Cop0Move { op: Cop0Op::Mfc0, rt: rt(w), rd: rd(w) },
        0x04 => Operation::Cop0Move { op: Cop0Op::Mtc0, rt: rt(w), rd: rd(w) },
        0x10 => match funct(w) {
            0x18 => Operation::Eret,
            0x38 => Operation::Ei,
            0x39 => Operation::Di,
            _ => Operation::Reserved { word: w },
        },
        _ => Operation::Reserved { word: w },
    }
}

fn decode_cop1(w: u32) -> Operation {
    let ft = rt(w);
    let fs = rd(w);
    let fd = sa(w);
    match rs(w) {
        0x00 => Operation::FpuMove { op: FpuMoveOp::Mfc1, rt: rt(w), fs },
        0x02 => Operation::FpuMove { op: FpuMoveOp::Cfc1, rt: rt(w), fs },
        0x04 => Operation::FpuMove { op: FpuMoveOp::Mtc1, rt: rt(w), fs },
        0x06 => Operation::FpuMove { op: FpuMoveOp::Ctc1, rt: rt(w), fs },
        0x08 => {
            let offset = imm(w) as i16;
            match rt(w) {
                0 => Operation::FpuBranch { on_true: false, likely: false, offset },
                1 => Operation::FpuBranch { on_true: true, likely: false, offset },
                2 => Operation::FpuBranch { on_true: false, likely: true, offset },
                3 => Operation::FpuBranch { on_true: true, likely: true, offset },
                _ => Operation::Reserved { word: w },
            }
        }
        0x10 => {
            let arith = |op| Operation::FpuArith { op, fd, fs, ft };
            let cmp = |cond| Operation::FpuCompare { cond, fs, ft };
            match funct(w) {
                0x00 => arith(FpuOp::Add),
                0x01 => arith(FpuOp::Sub),
                0x02 => arith(FpuOp::Mul),
                0x03 => arith(FpuOp::Div),
                0x04 => arith(FpuOp::Sqrt),
                0x05 => arith(FpuOp::Abs),
                0x06 => arith(FpuOp::Mov),
                0x07 => arith(FpuOp::Neg),
                0x24 => arith(FpuOp::CvtWS),
                0x30 => cmp(FpuCond::F),
                0x32 => cmp(FpuCond::Eq),
                0x34 => cmp(FpuCond::Lt),
                0x36 => cmp(FpuCond::Le),
                _ => Operation::Reserved { word: w },
            }
        }
        0x14 if funct(w) == 0x20 => Operation::FpuArith { op: FpuOp::CvtSW, fd, fs, ft },
        _ => Operation::Reserved { word: w },
    }
}

fn decode_mmi(w: u32) -> Operation {
    let sub = sa(w);
    let op = match (funct(w), sub) {
        (0x08, 0x00) => MmiOp::Paddw,
        (0x08, 0x01) => MmiOp::Psubw,
        (0x08, 0x04) => MmiOp::Paddh,
        (0x08, 0x05) => MmiOp::Psubh,
        (0x08, 0x10) => MmiOp::Paddsw,
        (0x08, 0x11) => MmiOp::Psubsw,
        (0x08, 0x14) => MmiOp::Paddsh,
        (0x08, 0x15) => MmiOp::Psubsh,
        (0x28, 0x10) => MmiOp::Padduw,
        (0x28, 0x11) => MmiOp::Psubuw,
        (0x09, 0x12) => MmiOp::Pand,
        (0x09, 0x13) => MmiOp::Pxor,
        (0x29, 0x12) => MmiOp::Por,
        (0x29, 0x13) => MmiOp::Pnor,
        _ => return Operation::Reserved { word: w },
    };
    Operation::Mmi {
        op,
        rd: rd(w),
        rs: rs(w),
        rt: rt(w),
    }
}
