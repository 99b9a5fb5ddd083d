use crate::op::Operation;
use crate::PAGE_SHIFT;

/// One decoded guest instruction inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInsn {
    pub addr: u32,
    pub word: u32,
    pub op: Operation,
    /// Set for the instruction following a branch.
    pub in_delay_slot: bool,
}

/// How a basic block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminator {
    /// Unconditional jump (J, JR other than `jr ra`).
    Jump,
    /// Conditional branch.
    Branch,
    /// Linking branch or jump (JAL, JALR, BxxAL).
    Call,
    /// `jr ra` or ERET.
    Return,
    /// SYSCALL, BREAK or a reserved encoding.
    Trap,
    /// MTC0, EI or DI: the interrupt state may have changed.
    System,
    /// The next instruction starts a new page.
    PageEnd,
    /// Instruction limit or a stop point.
    Limit,
    /// Fetching `addr` failed. When the failing fetch was a delay
    /// slot, the block was cut before the branch at `branch_pc`.
    FetchFault { addr: u32, branch_pc: Option<u32> },
}

/// Version snapshot of one physical page a block was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSnapshot {
    pub page: u32,
    pub version: u32,
}

/// A straight-line run of guest instructions compiled as a unit.
///
/// Control only enters at `start`. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub start: u32,
    pub end: u32,
    pub insns: Vec<DecodedInsn>,
    pub terminator: Terminator,
    /// Physical pages covered, in address order.
    pub pages: Vec<PageSnapshot>,
}

impl BasicBlock {
    pub fn icount(&self) -> u32 {
        self.insns.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Index of the branch owning the trailing delay slot, if any.
    pub fn branch_index(&self) -> Option<usize> {
        match self.insns.last() {
            Some(last) if last.in_delay_slot => self.insns.len().checked_sub(2),
            _ => None,
        }
    }

    pub fn first_page(&self) -> u32 {
        self.pages.first().map_or(0, |p| p.page)
    }

    pub fn last_page(&self) -> u32 {
        self.pages.last().map_or(0, |p| p.page)
    }

    /// Guest address execution continues at when the block falls
    /// through its last instruction.
    pub fn fallthrough_pc(&self) -> u32 {
        self.end
    }
}

/// Physical page index of a physical address.
#[inline]
pub const fn page_of(paddr: u32) -> u32 {
    paddr >> PAGE_SHIFT
}

/// Exit reason returned by a compiled block (or the interpreter).
///
/// The next guest PC is always left in `CpuState::pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BlockExit {
    Fallthrough = 0,
    Branch = 1,
    /// A synchronous exception; `exc_code`/`exc_delay_slot` describe it
    /// and `pc` holds the faulting (or branch) address.
    Exception = 2,
    /// The block changed the interrupt state.
    Interrupt = 3,
    /// A store invalidated the running block.
    CodeModified = 4,
}

impl BlockExit {
    pub fn from_raw(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Fallthrough,
            1 => Self::Branch,
            2 => Self::Exception,
            3 => Self::Interrupt,
            4 => Self::CodeModified,
            _ => return None,
        })
    }
}
