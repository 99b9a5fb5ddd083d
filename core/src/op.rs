/// Three-register integer ALU operations (SPECIAL funct field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Addu,
    Sub,
    Subu,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,
    Dadd,
    Daddu,
    Dsub,
    Dsubu,
}

impl AluOp {
    /// Whether signed overflow raises an Ov exception.
    pub const fn traps_on_overflow(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Dadd | Self::Dsub)
    }
}

/// Register-immediate ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluImmOp {
    Addi,
    Addiu,
    Slti,
    Sltiu,
    Andi,
    Ori,
    Xori,
    Daddi,
    Daddiu,
}

impl AluImmOp {
    pub const fn traps_on_overflow(self) -> bool {
        matches!(self, Self::Addi | Self::Daddi)
    }

    /// ANDI/ORI/XORI zero-extend their immediate; the rest sign-extend.
    pub const fn zero_extends(self) -> bool {
        matches!(self, Self::Andi | Self::Ori | Self::Xori)
    }
}

/// Shifts by the constant `sa` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Sll,
    Srl,
    Sra,
    Dsll,
    Dsrl,
    Dsra,
    Dsll32,
    Dsrl32,
    Dsra32,
}

/// Shifts by the low bits of `rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftVarOp {
    Sllv,
    Srlv,
    Srav,
    Dsllv,
    Dsrlv,
    Dsrav,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulDivOp {
    Mult,
    Multu,
    Div,
    Divu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HiLoOp {
    Mfhi,
    Mthi,
    Mflo,
    Mtlo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondMoveOp {
    Movz,
    Movn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
    Lwu,
    Ld,
    Lq,
}

impl LoadOp {
    pub const fn size(self) -> u32 {
        match self {
            Self::Lb | Self::Lbu => 1,
            Self::Lh | Self::Lhu => 2,
            Self::Lw | Self::Lwu => 4,
            Self::Ld => 8,
            Self::Lq => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Sb,
    Sh,
    Sw,
    Sd,
    Sq,
}

impl StoreOp {
    pub const fn size(self) -> u32 {
        match self {
            Self::Sb => 1,
            Self::Sh => 2,
            Self::Sw => 4,
            Self::Sd => 8,
            Self::Sq => 16,
        }
    }
}

/// Branch conditions. `Eq`/`Ne` compare `rs` with `rt`, the rest
/// compare `rs` with zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchCond {
    Eq,
    Ne,
    Lez,
    Gtz,
    Ltz,
    Gez,
}

impl BranchCond {
    pub const fn uses_rt(self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }

    pub fn holds(self, rs: u64, rt: u64) -> bool {
        let s = rs as i64;
        match self {
            Self::Eq => rs == rt,
            Self::Ne => rs != rt,
            Self::Lez => s <= 0,
            Self::Gtz => s > 0,
            Self::Ltz => s < 0,
            Self::Gez => s >= 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cop0Op {
    Mfc0,
    Mtc0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuMoveOp {
    Mfc1,
    Mtc1,
    Cfc1,
    Ctc1,
}

/// Single-precision FPU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FpuOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Sqrt = 4,
    Abs = 5,
    Mov = 6,
    Neg = 7,
    CvtWS = 8,
    CvtSW = 9,
}

impl FpuOp {
    pub const ALL: [FpuOp; 10] = [
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Sqrt,
        Self::Abs,
        Self::Mov,
        Self::Neg,
        Self::CvtWS,
        Self::CvtSW,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FpuCond {
    F = 0,
    Eq = 1,
    Lt = 2,
    Le = 3,
}

impl FpuCond {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::F,
            1 => Self::Eq,
            2 => Self::Lt,
            3 => Self::Le,
            _ => return None,
        })
    }
}

/// Multimedia (128-bit SIMD) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MmiOp {
    Paddw = 0,
    Psubw = 1,
    Paddh = 2,
    Psubh = 3,
    Paddsw = 4,
    Psubsw = 5,
    Paddsh = 6,
    Psubsh = 7,
    Padduw = 8,
    Psubuw = 9,
    Pand = 10,
    Pxor = 11,
    Por = 12,
    Pnor = 13,
}

impl MmiOp {
    pub const ALL: [MmiOp; 14] = [
        Self::Paddw,
        Self::Psubw,
        Self::Paddh,
        Self::Psubh,
        Self::Paddsw,
        Self::Psubsw,
        Self::Paddsh,
        Self::Psubsh,
        Self::Padduw,
        Self::Psubuw,
        Self::Pand,
        Self::Pxor,
        Self::Por,
        Self::Pnor,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// A decoded guest instruction.
///
/// Closed set: every consumer matches it exhaustively. Register
/// fields are raw 5-bit register numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Nop,
    Alu { op: AluOp, rd: u8, rs: u8, rt: u8 },
    AluImm { op: AluImmOp, rt: u8, rs: u8, imm: u16 },
    Lui { rt: u8, imm: u16 },
    Shift { op: ShiftOp, rd: u8, rt: u8, sa: u8 },
    ShiftVar { op: ShiftVarOp, rd: u8, rt: u8, rs: u8 },
    MulDiv { op: MulDivOp, rd: u8, rs: u8, rt: u8 },
    /// MFHI/MFLO write `reg`; MTHI/MTLO read it.
    HiLo { op: HiLoOp, reg: u8 },
    CondMove { op: CondMoveOp, rd: u8, rs: u8, rt: u8 },
    Load { op: LoadOp, rt: u8, base: u8, offset: i16 },
    Store { op: StoreOp, rt: u8, base: u8, offset: i16 },
    Branch { cond: BranchCond, rs: u8, rt: u8, offset: i16, likely: bool, link: bool },
    /// J/JAL; `index` is the 26-bit instruction index.
    Jump { index: u32, link: bool },
    /// JR, or JALR when `link` names the link register.
    JumpReg { rs: u8, link: Option<u8> },
    Syscall { code: u32 },
    Break { code: u32 },
    Sync,
    Cop0Move { op: Cop0Op, rt: u8, rd: u8 },
    Eret,
    Ei,
    Di,
    FpuMove { op: FpuMoveOp, rt: u8, fs: u8 },
    FpuLoad { ft: u8, base: u8, offset: i16 },
    FpuStore { ft: u8, base: u8, offset: i16 },
    FpuArith { op: FpuOp, fd: u8, fs: u8, ft: u8 },
    FpuCompare { cond: FpuCond, fs: u8, ft: u8 },
    FpuBranch { on_true: bool, likely: bool, offset: i16 },
    Mmi { op: MmiOp, rd: u8, rs: u8, rt: u8 },
    Reserved { word: u32 },
}

impl Operation {
    /// Branches and jumps. All of them own one delay slot.
    pub const fn is_control_transfer(&self) -> bool {
        matches!(
            self,
            Self::Branch { .. } | Self::Jump { .. } | Self::JumpReg { .. } | Self::FpuBranch { .. }
        )
    }

    pub const fn has_delay_slot(&self) -> bool {
        self.is_control_transfer()
    }

    /// Instructions after which translation must stop.
    pub const fn ends_block(&self) -> bool {
        self.is_control_transfer()
            || matches!(
                self,
                Self::Syscall { .. }
                    | Self::Break { .. }
                    | Self::Eret
                    | Self::Ei
                    | Self::Di
                    | Self::Cop0Move { op: Cop0Op::Mtc0, .. }
                    | Self::Reserved { .. }
            )
    }

    /// Whether the instruction may legally occupy a delay slot.
    pub const fn allowed_in_delay_slot(&self) -> bool {
        !self.is_control_transfer()
            && !matches!(
                self,
                Self::Eret | Self::Ei | Self::Di | Self::Cop0Move { op: Cop0Op::Mtc0, .. }
            )
    }

    /// Statically known branch target for an instruction at `pc`.
    pub fn static_target(&self, pc: u32) -> Option<u32> {
        match *self {
            Self::Branch { offset, .. } | Self::FpuBranch { offset, .. } => {
                Some(branch_target(pc, offset))
            }
            Self::Jump { index, .. } => Some(jump_target(pc, index)),
            _ => None,
        }
    }

    /// Registers read and written by this operation.
    pub fn reg_uses(&self) -> RegUses {
        use GuestReg::{Gpr, Hi, Lo};
        let mut u = RegUses::default();
        match *self {
            Self::Nop
            | Self::Syscall { .. }
            | Self::Break { .. }
            | Self::Sync
            | Self::Eret
            | Self::Ei
            | Self::Di
            | Self::FpuArith { .. }
            | Self::FpuCompare { .. }
            | Self::FpuBranch { .. }
            | Self::Reserved { .. } => {}
            Self::Alu { rd, rs, rt, .. } => {
                u.reads.push(Gpr(rs));
                u.reads.push(Gpr(rt));
                u.writes.push(Gpr(rd));
            }
            Self::AluImm { rt, rs, .. } => {
                u.reads.push(Gpr(rs));
                u.writes.push(Gpr(rt));
            }
            Self::Lui { rt, .. } => u.writes.push(Gpr(rt)),
            Self::Shift { rd, rt, .. } => {
                u.reads.push(Gpr(rt));
                u.writes.push(Gpr(rd));
            }
            Self::ShiftVar { rd, rt, rs, .. } => {
                u.reads.push(Gpr(rt));
                u.reads.push(Gpr(rs));
                u.writes.push(Gpr(rd));
            }
            Self::MulDiv { op, rd, rs, rt } => {
                u.reads.push(Gpr(rs));
                u.reads.push(Gpr(rt));
                if matches!(op, MulDivOp::Mult | MulDivOp::Multu) {
                    u.writes.push(Gpr(rd));
                }
                u.writes.push(Hi);
                u.writes.push(Lo);
            }
            Self::HiLo { op, reg } => match op {
                HiLoOp::Mfhi => {
                    u.reads.push(Hi);
                    u.writes.push(Gpr(reg));
                }
                HiLoOp::Mflo => {
                    u.reads.push(Lo);
                    u.writes.push(Gpr(reg));
                }
                HiLoOp::Mthi => {
                    u.reads.push(Gpr(reg));
                    u.writes.push(Hi);
                }
                HiLoOp::Mtlo => {
                    u.reads.push(Gpr(reg));
                    u.writes.push(Lo);
                }
            },
            Self::CondMove { rd, rs, rt, .. } => {
                u.reads.push(Gpr(rs));
                u.reads.push(Gpr(rt));
                u.reads.push(Gpr(rd));
                u.writes.push(Gpr(rd));
            }
            Self::Load { op, rt, base, .. } => {
                u.reads.push(Gpr(base));
                if op == LoadOp::Lq {
                    u.env_writes.push(Gpr(rt));
                } else {
                    u.writes.push(Gpr(rt));
                }
            }
            Self::Store { op, rt, base, .. } => {
                u.reads.push(Gpr(base));
                if op == StoreOp::Sq {
                    u.env_reads.push(Gpr(rt));
                } else {
                    u.reads.push(Gpr(rt));
                }
            }
            Self::Branch { cond, rs, rt, link, .. } => {
                u.reads.push(Gpr(rs));
                if cond.uses_rt() {
                    u.reads.push(Gpr(rt));
                }
                if link {
                    u.writes.push(Gpr(31));
                }
            }
            Self::Jump { link, .. } => {
                if link {
                    u.writes.push(Gpr(31));
                }
            }
            Self::JumpReg { rs, link } => {
                u.reads.push(Gpr(rs));
                if let Some(rd) = link {
                    u.writes.push(Gpr(rd));
                }
            }
            Self::Cop0Move { op, rt, .. } => match op {
                Cop0Op::Mfc0 => u.writes.push(Gpr(rt)),
                Cop0Op::Mtc0 => u.reads.push(Gpr(rt)),
            },
            Self::FpuMove { op, rt, .. } => match op {
                FpuMoveOp::Mfc1 | FpuMoveOp::Cfc1 => u.writes.push(Gpr(rt)),
                FpuMoveOp::Mtc1 | FpuMoveOp::Ctc1 => u.reads.push(Gpr(rt)),
            },
            Self::FpuLoad { base, .. } | Self::FpuStore { base, .. } => u.reads.push(Gpr(base)),
            Self::Mmi { rd, rs, rt, .. } => {
                u.env_reads.push(Gpr(rs));
                u.env_reads.push(Gpr(rt));
                u.env_writes.push(Gpr(rd));
            }
        }
        u
    }
}

/// Target of a PC-relative branch at `pc`.
#[inline]
pub fn branch_target(pc: u32, offset: i16) -> u32 {
    pc.wrapping_add(4).wrapping_add(((offset as i32) << 2) as u32)
}

/// Target of a J/JAL at `pc`: the delay slot's 256 MiB region.
#[inline]
pub fn jump_target(pc: u32, index: u32) -> u32 {
    (pc.wrapping_add(4) & 0xF000_0000) | (index << 2)
}

/// A guest value the register allocator can keep in a host register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GuestReg {
    /// Low 64 bits of a GPR (1-31).
    Gpr(u8),
    Hi,
    Lo,
}

impl GuestReg {
    pub const COUNT: usize = 34;

    /// Dense index: GPRs map to their number, HI to 32, LO to 33.
    pub const fn index(self) -> usize {
        match self {
            Self::Gpr(n) => n as usize,
            Self::Hi => 32,
            Self::Lo => 33,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            1..=31 => Some(Self::Gpr(i as u8)),
            32 => Some(Self::Hi),
            33 => Some(Self::Lo),
            _ => None,
        }
    }

    /// Offset of the value's home in `CpuState`.
    pub const fn home_offset(self) -> usize {
        match self {
            Self::Gpr(n) => crate::cpu::gpr_offset(n as usize),
            Self::Hi => crate::cpu::HI_OFFSET,
            Self::Lo => crate::cpu::LO_OFFSET,
        }
    }

    /// Each guest value owns one fixed spill slot.
    pub const fn spill_slot(self) -> usize {
        self.index()
    }
}

impl std::fmt::Display for GuestReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpr(n) => f.write_str(crate::cpu::GPR_NAMES[*n as usize]),
            Self::Hi => f.write_str("hi"),
            Self::Lo => f.write_str("lo"),
        }
    }
}

/// Up to four guest registers, deduplicated, with r0 dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegList {
    regs: [Option<GuestReg>; 4],
    len: u8,
}

impl RegList {
    pub fn push(&mut self, r: GuestReg) {
        if r == GuestReg::Gpr(0) || self.contains(r) {
            return;
        }
        self.regs[self.len as usize] = Some(r);
        self.len += 1;
    }

    pub fn contains(&self, r: GuestReg) -> bool {
        self.iter().any(|x| x == r)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = GuestReg> + '_ {
        self.regs[..self.len as usize].iter().flatten().copied()
    }
}

/// Register traffic of one operation.
///
/// `reads`/`writes` must be held in host registers while the
/// operation runs. `env_reads`/`env_writes` are accessed through the
/// register file in memory by a runtime helper: their home copy must
/// be current before the operation, and any cached copy is stale
/// after it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegUses {
    pub reads: RegList,
    pub writes: RegList,
    pub env_reads: RegList,
    pub env_writes: RegList,
}

impl RegUses {
    /// Every guest value referenced in any way.
    pub fn all(&self) -> impl Iterator<Item = GuestReg> + '_ {
        self.reads
            .iter()
            .chain(self.writes.iter())
            .chain(self.env_reads.iter())
            .chain(self.env_writes.iter())
    }
}

/// Bitmap of guest values (indexed by `GuestReg::index`).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GuestRegSet(u64);

impl GuestRegSet {
    pub const EMPTY: GuestRegSet = GuestRegSet(0);

    pub const fn insert(self, r: GuestReg) -> Self {
        Self(self.0 | (1u64 << r.index()))
    }

    pub const fn contains(self, r: GuestReg) -> bool {
        self.0 & (1u64 << r.index()) != 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = GuestReg> {
        (0..GuestReg::COUNT)
            .filter(move |i| self.0 & (1u64 << i) != 0)
            .filter_map(GuestReg::from_index)
    }
}

impl std::fmt::Debug for GuestRegSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
