//! Block-local linear-scan register allocation.
//!
//! Guest values (GPR low halves, HI, LO) are assigned to the
//! callee-saved host registers in `ALLOCATABLE` in operation order.
//! Nothing survives a block boundary: every value is loaded from the
//! register file on first use and written back at its last use, so
//! the register file in `CpuState` is current whenever control leaves
//! compiled code.
//!
//! The allocator only plans. It records, per operation, the moves to
//! emit around it and the state a side exit has to flush; the code
//! generator turns the plan into host instructions.

use std::fmt;

use ee_core::block::BasicBlock;
use ee_core::op::{GuestReg, RegList};
use ee_core::CompileError;

use crate::x86_64::regs::{Reg, ALLOCATABLE};

/// A data movement between a host register, the guest register file
/// ("home") and the per-core spill area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    /// host <- home
    LoadHome { guest: GuestReg, reg: Reg },
    /// host <- spill slot
    Reload { guest: GuestReg, reg: Reg },
    /// spill slot <- host
    Spill { guest: GuestReg, reg: Reg },
    /// home <- host
    WriteBack { guest: GuestReg, reg: Reg },
    /// home <- spill slot
    SpillToHome { guest: GuestReg },
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Move::LoadHome { guest, reg } => write!(f, "load {reg} <- {guest}"),
            Move::Reload { guest, reg } => write!(f, "reload {reg} <- spill[{guest}]"),
            Move::Spill { guest, reg } => write!(f, "spill spill[{guest}] <- {reg}"),
            Move::WriteBack { guest, reg } => write!(f, "writeback {guest} <- {reg}"),
            Move::SpillToHome { guest } => write!(f, "writeback {guest} <- spill[{guest}]"),
        }
    }
}

/// Allocation decisions for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpPlan {
    /// Moves emitted before the operation.
    pub before: Vec<Move>,
    /// Host register of every guest value the operation reads or
    /// writes natively.
    pub operands: Vec<(GuestReg, Reg)>,
    /// Moves that make the register file hold the state from before
    /// the operation's writes. Emitted on fault paths.
    pub flush_pre_write: Vec<Move>,
    /// Moves that make the register file hold the state after the
    /// operation's writes. Emitted on side exits taken after it
    /// completes (branch-likely not taken, code modified).
    pub flush_post_write: Vec<Move>,
    /// Moves emitted after the operation: write-backs and releases of
    /// values whose last use this was.
    pub after: Vec<Move>,
}

impl OpPlan {
    /// Host register holding `guest` during this operation.
    pub fn host(&self, guest: GuestReg) -> Option<Reg> {
        self.operands
            .iter()
            .find(|(g, _)| *g == guest)
            .map(|&(_, r)| r)
    }
}

/// Span of operations (inclusive) referencing a guest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    pub guest: GuestReg,
    pub start: usize,
    pub end: usize,
}

/// Register assignment for one block; valid only for that block's
/// compiled code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterAllocation {
    /// One plan per instruction, in block order.
    pub steps: Vec<OpPlan>,
    pub intervals: Vec<LiveInterval>,
    /// Moves emitted after the last instruction on the normal exit.
    pub exit_flush: Vec<Move>,
}

impl RegisterAllocation {
    /// Number of values sent to the spill area.
    pub fn spill_count(&self) -> usize {
        self.steps
            .iter()
            .flat_map(|s| s.before.iter())
            .filter(|m| matches!(m, Move::Spill { .. }))
            .count()
    }

    /// Human-readable plan, one instruction per paragraph.
    pub fn dump(&self, block: &BasicBlock, w: &mut impl std::io::Write) -> std::io::Result<()> {
        for (insn, step) in block.insns.iter().zip(&self.steps) {
            writeln!(w, "  {:08x}: {}", insn.addr, ee_core::dump::Disasm { op: &insn.op, pc: insn.addr })?;
            for m in &step.before {
                writeln!(w, "      {m}")?;
            }
            if !step.operands.is_empty() {
                let map: Vec<String> = step
                    .operands
                    .iter()
                    .map(|(g, r)| format!("{g}={r}"))
                    .collect();
                writeln!(w, "      [{}]", map.join(" "))?;
            }
            for m in &step.after {
                writeln!(w, "      {m}")?;
            }
        }
        for m in &self.exit_flush {
            writeln!(w, "  exit: {m}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Home,
    Reg(Reg),
    Spill,
}

/// `dirty` means the home copy is stale.
#[derive(Debug, Clone, Copy)]
struct Value {
    loc: Loc,
    dirty: bool,
}

struct RegAllocState {
    values: [Value; GuestReg::COUNT],
    /// Occupant of each `ALLOCATABLE` register.
    holder: [Option<GuestReg>; ALLOCATABLE.len()],
    /// Tick of the last operation that used each register.
    last_use: [u64; ALLOCATABLE.len()],
    tick: u64,
}

fn slot_of(reg: Reg) -> usize {
    ALLOCATABLE.iter().position(|&r| r == reg).unwrap_or(0)
}

impl RegAllocState {
    fn new() -> Self {
        Self {
            values: [Value {
                loc: Loc::Home,
                dirty: false,
            }; GuestReg::COUNT],
            holder: [None; ALLOCATABLE.len()],
            last_use: [0; ALLOCATABLE.len()],
            tick: 0,
        }
    }

    fn value(&mut self, g: GuestReg) -> &mut Value {
        &mut self.values[g.index()]
    }

    fn touch(&mut self, reg: Reg) {
        self.last_use[slot_of(reg)] = self.tick;
    }

    /// Moves that bring every stale home copy up to date.
    fn flush_list(&self) -> Vec<Move> {
        let mut out = Vec::new();
        for (i, v) in self.values.iter().enumerate() {
            let Some(guest) = GuestReg::from_index(i) else {
                continue;
            };
            if !v.dirty {
                continue;
            }
            match v.loc {
                Loc::Reg(reg) => out.push(Move::WriteBack { guest, reg }),
                Loc::Spill => out.push(Move::SpillToHome { guest }),
                Loc::Home => {}
            }
        }
        out
    }

    /// Pick a host register for a new value, evicting the least
    /// recently used occupant that the current operation does not need.
    fn alloc_reg(&mut self, pinned: &[GuestReg], moves: &mut Vec<Move>) -> Option<Reg> {
        if let Some(slot) = self.holder.iter().position(Option::is_none) {
            return Some(ALLOCATABLE[slot]);
        }
        let slot = (0..ALLOCATABLE.len())
            .filter(|&s| self.holder[s].is_some_and(|g| !pinned.contains(&g)))
            .min_by_key(|&s| self.last_use[s])?;
        let reg = ALLOCATABLE[slot];
        let victim = self.holder[slot].take()?;
        let v = self.value(victim);
        if v.dirty {
            v.loc = Loc::Spill;
            moves.push(Move::Spill { guest: victim, reg });
        } else {
            v.loc = Loc::Home;
        }
        Some(reg)
    }

    /// Drop `g` from its register or spill slot, writing it back
    /// first if the home copy is stale.
    fn release(&mut self, g: GuestReg, moves: &mut Vec<Move>) {
        let v = self.values[g.index()];
        match v.loc {
            Loc::Reg(reg) => {
                if v.dirty {
                    moves.push(Move::WriteBack { guest: g, reg });
                }
                self.holder[slot_of(reg)] = None;
            }
            Loc::Spill if v.dirty => moves.push(Move::SpillToHome { guest: g }),
            _ => {}
        }
        *self.value(g) = Value {
            loc: Loc::Home,
            dirty: false,
        };
    }

    /// Forget any cached copy of `g`; the home copy is authoritative.
    fn discard(&mut self, g: GuestReg) {
        if let Loc::Reg(reg) = self.values[g.index()].loc {
            self.holder[slot_of(reg)] = None;
        }
        *self.value(g) = Value {
            loc: Loc::Home,
            dirty: false,
        };
    }
}

fn native_operands(reads: &RegList, writes: &RegList) -> Vec<GuestReg> {
    let mut out: Vec<GuestReg> = reads.iter().collect();
    for g in writes.iter() {
        if !out.contains(&g) {
            out.push(g);
        }
    }
    out
}

/// Plan register usage for `block`.
pub fn allocate(block: &BasicBlock) -> Result<RegisterAllocation, CompileError> {
    let uses: Vec<_> = block.insns.iter().map(|i| i.op.reg_uses()).collect();

    let mut first_ref = [usize::MAX; GuestReg::COUNT];
    let mut last_ref = [0usize; GuestReg::COUNT];
    for (i, u) in uses.iter().enumerate() {
        for g in u.all() {
            let k = g.index();
            first_ref[k] = first_ref[k].min(i);
            last_ref[k] = i;
        }
    }
    let mut intervals: Vec<LiveInterval> = (0..GuestReg::COUNT)
        .filter(|&k| first_ref[k] != usize::MAX)
        .filter_map(|k| {
            GuestReg::from_index(k).map(|guest| LiveInterval {
                guest,
                start: first_ref[k],
                end: last_ref[k],
            })
        })
        .collect();
    intervals.sort_by_key(|iv| (iv.start, iv.guest));

    let mut state = RegAllocState::new();
    let mut steps = Vec::with_capacity(uses.len());

    for (i, u) in uses.iter().enumerate() {
        state.tick += 1;
        let mut plan = OpPlan::default();

        // A helper reads these from the register file.
        for g in u.env_reads.iter() {
            let v = state.values[g.index()];
            if !v.dirty {
                continue;
            }
            match v.loc {
                Loc::Reg(reg) => {
                    plan.before.push(Move::WriteBack { guest: g, reg });
                    state.value(g).dirty = false;
                }
                Loc::Spill => {
                    plan.before.push(Move::SpillToHome { guest: g });
                    *state.value(g) = Value {
                        loc: Loc::Home,
                        dirty: false,
                    };
                }
                Loc::Home => {}
            }
        }

        let native = native_operands(&u.reads, &u.writes);
        for &g in &native {
            let v = state.values[g.index()];
            if let Loc::Reg(reg) = v.loc {
                state.touch(reg);
                plan.operands.push((g, reg));
                continue;
            }
            let reg = state.alloc_reg(&native, &mut plan.before).ok_or_else(|| {
                CompileError::new(
                    block.insns[i].addr,
                    format!("no host register left for {g}"),
                )
            })?;
            let read = u.reads.contains(g);
            match (v.loc, read) {
                (Loc::Home, true) => plan.before.push(Move::LoadHome { guest: g, reg }),
                (Loc::Spill, true) => plan.before.push(Move::Reload { guest: g, reg }),
                (Loc::Spill, false) if v.dirty => {
                    // Overwritten without being read; the spilled
                    // value must still reach home for fault paths.
                    plan.before.push(Move::SpillToHome { guest: g });
                    state.value(g).dirty = false;
                }
                _ => {}
            }
            state.value(g).loc = Loc::Reg(reg);
            state.holder[slot_of(reg)] = Some(g);
            state.touch(reg);
            plan.operands.push((g, reg));
        }

        plan.flush_pre_write = state.flush_list();

        for g in u.writes.iter() {
            state.value(g).dirty = true;
        }
        for g in u.env_writes.iter() {
            state.discard(g);
        }

        plan.flush_post_write = state.flush_list();

        for g in u.all() {
            if last_ref[g.index()] == i {
                state.release(g, &mut plan.after);
            }
        }

        steps.push(plan);
    }

    let exit_flush = state.flush_list();
    Ok(RegisterAllocation {
        steps,
        intervals,
        exit_flush,
    })
}
