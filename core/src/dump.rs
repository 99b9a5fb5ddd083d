//! Disassembly: human-readable text for decoded operations
//! and basic blocks.

use std::fmt;
use std::io::Write;

use crate::block::{BasicBlock, Terminator};
use crate::cpu::GPR_NAMES;
use crate::op::*;

fn r(n: u8) -> &'static str {
    GPR_NAMES[n as usize]
}

fn alu_name(op: AluOp) -> &'static str {
    match op {
        AluOp::Add => "add",
        AluOp::Addu => "addu",
        AluOp::Sub => "sub",
        AluOp::Subu => "subu",
        AluOp::And => "and",
        AluOp::Or => "or",
        AluOp::Xor => "xor",
        AluOp::Nor => "nor",
        AluOp::Slt => "slt",
        AluOp::Sltu => "sltu",
        AluOp::Dadd => "dadd",
        AluOp::Daddu => "daddu",
        AluOp::Dsub => "dsub",
        AluOp::Dsubu => "dsubu",
    }
}

fn alu_imm_name(op: AluImmOp) -> &'static str {
    match op {
        AluImmOp::Addi => "addi",
        AluImmOp::Addiu => "addiu",
        AluImmOp::Slti => "slti",
        AluImmOp::Sltiu => "sltiu",
        AluImmOp::Andi => "andi",
        AluImmOp::Ori => "ori",
        AluImmOp::Xori => "xori",
        AluImmOp::Daddi => "daddi",
        AluImmOp::Daddiu => "daddiu",
    }
}

fn shift_name(op: ShiftOp) -> &'static str {
    match op {
        ShiftOp::Sll => "sll",
        ShiftOp::Srl => "srl",
        ShiftOp::Sra => "sra",
        ShiftOp::Dsll => "dsll",
        ShiftOp::Dsrl => "dsrl",
        ShiftOp::Dsra => "dsra",
        ShiftOp::Dsll32 => "dsll32",
        ShiftOp::Dsrl32 => "dsrl32",
        ShiftOp::Dsra32 => "dsra32",
    }
}

fn shiftv_name(op: ShiftVarOp) -> &'static str {
    match op {
        ShiftVarOp::Sllv => "sllv",
        ShiftVarOp::Srlv => "srlv",
        ShiftVarOp::Srav => "srav",
        ShiftVarOp::Dsllv => "dsllv",
        ShiftVarOp::Dsrlv => "dsrlv",
        ShiftVarOp::Dsrav => "dsrav",
    }
}

fn load_name(op: LoadOp) -> &'static str {
    match op {
        LoadOp::Lb => "lb",
        LoadOp::Lh => "lh",
        LoadOp::Lw => "lw",
        LoadOp::Lbu => "lbu",
        LoadOp::Lhu => "lhu",
        LoadOp::Lwu => "lwu",
        LoadOp::Ld => "ld",
        LoadOp::Lq => "lq",
    }
}

fn store_name(op: StoreOp) -> &'static str {
    match op {
        StoreOp::Sb => "sb",
        StoreOp::Sh => "sh",
        StoreOp::Sw => "sw",
        StoreOp::Sd => "sd",
        StoreOp::Sq => "sq",
    }
}

fn branch_name(cond: BranchCond, likely: bool, link: bool) -> String {
    let base = match cond {
        BranchCond::Eq => "beq",
        BranchCond::Ne => "bne",
        BranchCond::Lez => "blez",
        BranchCond::Gtz => "bgtz",
        BranchCond::Ltz => "bltz",
        BranchCond::Gez => "bgez",
    };
    let mut s = String::from(base);
    if link {
        s.push_str("al");
    }
    if likely {
        s.push('l');
    }
    s
}

fn fpu_name(op: FpuOp) -> &'static str {
    match op {
        FpuOp::Add => "add.s",
        FpuOp::Sub => "sub.s",
        FpuOp::Mul => "mul.s",
        FpuOp::Div => "div.s",
        FpuOp::Sqrt => "sqrt.s",
        FpuOp::Abs => "abs.s",
        FpuOp::Mov => "mov.s",
        FpuOp::Neg => "neg.s",
        FpuOp::CvtWS => "cvt.w.s",
        FpuOp::CvtSW => "cvt.s.w",
    }
}

fn mmi_name(op: MmiOp) -> &'static str {
    match op {
        MmiOp::Paddw => "paddw",
        MmiOp::Psubw => "psubw",
        MmiOp::Paddh => "paddh",
        MmiOp::Psubh => "psubh",
        MmiOp::Paddsw => "paddsw",
        MmiOp::Psubsw => "psubsw",
        MmiOp::Paddsh => "paddsh",
        MmiOp::Psubsh => "psubsh",
        MmiOp::Padduw => "padduw",
        MmiOp::Psubuw => "psubuw",
        MmiOp::Pand => "pand",
        MmiOp::Pxor => "pxor",
        MmiOp::Por => "por",
        MmiOp::Pnor => "pnor",
    }
}

/// Disassembly of an operation located at `pc`, with branch targets
/// resolved to absolute addresses.
pub struct Disasm<'a> {
    pub op: &'a Operation,
    pub pc: u32,
}

impl fmt::Display for Disasm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pc = self.pc;
        match *self.op {
            Operation::Nop => write!(f, "nop"),
            Operation::Alu { op, rd, rs, rt } => {
                write!(f, "{:<8}{}, {}, {}", alu_name(op), r(rd), r(rs), r(rt))
            }
            Operation::AluImm { op, rt, rs, imm } => {
                if op.zero_extends() {
                    write!(f, "{:<8}{}, {}, 0x{:x}", alu_imm_name(op), r(rt), r(rs), imm)
                } else {
                    write!(f, "{:<8}{}, {}, {}", alu_imm_name(op), r(rt), r(rs), imm as i16)
                }
            }
            Operation::Lui { rt, imm } => write!(f, "{:<8}{}, 0x{:x}", "lui", r(rt), imm),
            Operation::Shift { op, rd, rt, sa } => {
                write!(f, "{:<8}{}, {}, {}", shift_name(op), r(rd), r(rt), sa)
            }
            Operation::ShiftVar { op, rd, rt, rs } => {
                write!(f, "{:<8}{}, {}, {}", shiftv_name(op), r(rd), r(rt), r(rs))
            }
            Operation::MulDiv { op, rd, rs, rt } => match op {
                MulDivOp::Mult | MulDivOp::Multu => {
                    let n = if op == MulDivOp::Mult { "mult" } else { "multu" };
                    write!(f, "{:<8}{}, {}, {}", n, r(rd), r(rs), r(rt))
                }
                MulDivOp::Div | MulDivOp::Divu => {
                    let n = if op == MulDivOp::Div { "div" } else { "divu" };
                    write!(f, "{:<8}{}, {}", n, r(rs), r(rt))
                }
            },
            Operation::HiLo { op, reg } => {
                let n = match op {
                    HiLoOp::Mfhi => "mfhi",
                    HiLoOp::Mthi => "mthi",
                    HiLoOp::Mflo => "mflo",
                    HiLoOp::Mtlo => "mtlo",
                };
                write!(f, "{:<8}{}", n, r(reg))
            }
            Operation::CondMove { op, rd, rs, rt } => {
                let n = if op == CondMoveOp::Movz { "movz" } else { "movn" };
                write!(f, "{:<8}{}, {}, {}", n, r(rd), r(rs), r(rt))
            }
            Operation::Load { op, rt, base, offset } => {
                write!(f, "{:<8}{}, {}({})", load_name(op), r(rt), offset, r(base))
            }
            Operation::Store { op, rt, base, offset } => {
                write!(f, "{:<8}{}, {}({})", store_name(op), r(rt), offset, r(base))
            }
            Operation::Branch { cond, rs, rt, offset, likely, link } => {
                let target = branch_target(pc, offset);
                let n = branch_name(cond, likely, link);
                if cond.uses_rt() {
                    write!(f, "{:<8}{}, {}, 0x{:08x}", n, r(rs), r(rt), target)
                } else {
                    write!(f, "{:<8}{}, 0x{:08x}", n, r(rs), target)
                }
            }
            Operation::Jump { index, link } => {
                let n = if link { "jal" } else { "j" };
                write!(f, "{:<8}0x{:08x}", n, jump_target(pc, index))
            }
            Operation::JumpReg { rs, link } => match link {
                Some(rd) => write!(f, "{:<8}{}, {}", "jalr", r(rd), r(rs)),
                None => write!(f, "{:<8}{}", "jr", r(rs)),
            },
            Operation::Syscall { code } => write!(f, "{:<8}0x{:x}", "syscall", code),
            Operation::Break { code } => write!(f, "{:<8}0x{:x}", "break", code),
            Operation::Sync => write!(f, "sync"),
            Operation::Cop0Move { op, rt, rd } => {
                let n = if op == Cop0Op::Mfc0 { "mfc0" } else { "mtc0" };
                write!(f, "{:<8}{}, ${}", n, r(rt), rd)
            }
            Operation::Eret => write!(f, "eret"),
            Operation::Ei => write!(f, "ei"),
            Operation::Di => write!(f, "di"),
            Operation::FpuMove { op, rt, fs } => match op {
                FpuMoveOp::Mfc1 => write!(f, "{:<8}{}, $f{}", "mfc1", r(rt), fs),
                FpuMoveOp::Mtc1 => write!(f, "{:<8}{}, $f{}", "mtc1", r(rt), fs),
                FpuMoveOp::Cfc1 => write!(f, "{:<8}{}, ${}", "cfc1", r(rt), fs),
                FpuMoveOp::Ctc1 => write!(f, "{:<8}{}, ${}", "ctc1", r(rt), fs),
            },
            Operation::FpuLoad { ft, base, offset } => {
                write!(f, "{:<8}$f{}, {}({})", "lwc1", ft, offset, r(base))
            }
            Operation::FpuStore { ft, base, offset } => {
                write!(f, "{:<8}$f{}, {}({})", "swc1", ft, offset, r(base))
            }
            Operation::FpuArith { op, fd, fs, ft } => match op {
                FpuOp::Add | FpuOp::Sub | FpuOp::Mul | FpuOp::Div => {
                    write!(f, "{:<8}$f{}, $f{}, $f{}", fpu_name(op), fd, fs, ft)
                }
                FpuOp::Sqrt => write!(f, "{:<8}$f{}, $f{}", fpu_name(op), fd, ft),
                _ => write!(f, "{:<8}$f{}, $f{}", fpu_name(op), fd, fs),
            },
            Operation::FpuCompare { cond, fs, ft } => {
                let n = match cond {
                    FpuCond::F => "c.f.s",
                    FpuCond::Eq => "c.eq.s",
                    FpuCond::Lt => "c.lt.s",
                    FpuCond::Le => "c.le.s",
                };
                write!(f, "{:<8}$f{}, $f{}", n, fs, ft)
            }
            Operation::FpuBranch { on_true, likely, offset } => {
                let n = match (on_true, likely) {
                    (false, false) => "bc1f",
                    (true, false) => "bc1t",
                    (false, true) => "bc1fl",
                    (true, true) => "bc1tl",
                };
                write!(f, "{:<8}0x{:08x}", n, branch_target(pc, offset))
            }
            Operation::Mmi { op, rd, rs, rt } => {
                write!(f, "{:<8}{}, {}, {}", mmi_name(op), r(rd), r(rs), r(rt))
            }
            Operation::Reserved { word } => write!(f, "{:<8}0x{:08x}", ".word", word),
        }
    }
}

impl fmt::Display for Operation {
    /// Disassembly with branch targets relative to address 0.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Disasm { op: self, pc: 0 }, f)
    }
}

fn terminator_name(t: &Terminator) -> String {
    match t {
        Terminator::Jump => "jump".into(),
        Terminator::Branch => "branch".into(),
        Terminator::Call => "call".into(),
        Terminator::Return => "return".into(),
        Terminator::Trap => "trap".into(),
        Terminator::System => "system".into(),
        Terminator::PageEnd => "page-end".into(),
        Terminator::Limit => "limit".into(),
        Terminator::FetchFault { addr, branch_pc } => match branch_pc {
            Some(b) => format!("fetch-fault @0x{addr:08x} (delay slot of 0x{b:08x})"),
            None => format!("fetch-fault @0x{addr:08x}"),
        },
    }
}

/// Dump a block as one line per instruction.
pub fn dump_block(block: &BasicBlock, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(
        out,
        "---- block 0x{:08x}..0x{:08x} ({} insns, {})",
        block.start,
        block.end,
        block.icount(),
        terminator_name(&block.terminator)
    )?;
    for insn in &block.insns {
        let slot = if insn.in_delay_slot { " " } else { "" };
        writeln!(
            out,
            "  {:08x}: {:08x}  {}{}",
            insn.addr,
            insn.word,
            slot,
            Disasm { op: &insn.op, pc: insn.addr }
        )?;
    }
    Ok(())
}
