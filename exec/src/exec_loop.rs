//! The per-core dispatcher: lookup, compile on miss, execute, and
//! classify the block's exit.

use std::collections::BTreeSet;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ee_backend::{translate, Trampoline, X86_64CodeGen};
use ee_core::cpu::cause;
use ee_core::semantics::cop0;
use ee_core::{BasicBlock, BlockExit, CoreConfig, CpuState, ExcCode, ExceptionPolicy, ExecMode, MemError};
use ee_frontend::{BlockBuilder, Interpreter};
use ee_mem::GuestMemory;
use tracing::{debug, error, trace, warn};

use crate::cache::{CachedBlock, TranslationCache};
use crate::error::{CacheError, CoreError};

/// Requests a running core to stop at its next block boundary.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// External interrupt inputs of a core, latched into Cause.IP at
/// block boundaries.
#[derive(Debug, Clone)]
pub struct InterruptLine(Arc<AtomicU32>);

impl InterruptLine {
    /// Assert interrupt pin `ip` (2-7, as numbered in Cause.IP).
    pub fn raise(&self, ip: u8) {
        self.0.fetch_or(Self::bit(ip), Ordering::AcqRel);
    }

    pub fn clear(&self, ip: u8) {
        self.0.fetch_and(!Self::bit(ip), Ordering::AcqRel);
    }

    fn bit(ip: u8) -> u32 {
        (1u32 << (8 + ip as u32)) & cause::IP_MASK
    }

    fn pending(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of `Core::step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A block ran; execution continues at `CpuState::pc`.
    Continue,
    /// `pc` is a breakpoint; nothing ran. The next step executes it.
    Breakpoint { pc: u32 },
    /// An external interrupt was taken before any block ran.
    Interrupt,
    /// A synchronous guest exception at `pc` (the branch when the
    /// faulting instruction sat in a delay slot). `vectored` is false
    /// when the exception policy halts the core instead.
    Exception {
        code: ExcCode,
        pc: u32,
        delay_slot: bool,
        vectored: bool,
    },
}

/// Why `Core::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Stopped,
    Breakpoint { pc: u32 },
    /// Halting exception policy only.
    GuestException { code: ExcCode, pc: u32, delay_slot: bool },
    /// The block budget given to `run_blocks` ran out.
    BlockLimit,
}

/// A block ready to execute.
enum Runnable {
    Compiled(CachedBlock),
    /// Could not be cached; run once by the interpreter.
    Interpreted(BasicBlock),
}

/// One emulated core: its register file and its dispatcher loop.
///
/// Cores never share a `CpuState`. Guest memory and the translation
/// cache may be shared between cores.
pub struct Core {
    cpu: Box<CpuState>,
    memory: Arc<GuestMemory>,
    cache: Arc<TranslationCache>,
    backend: X86_64CodeGen,
    trampoline: Trampoline,
    config: CoreConfig,
    breakpoints: BTreeSet<u32>,
    /// Breakpoint already reported; the next step runs through it.
    bp_reported: Option<u32>,
    stop: Arc<AtomicBool>,
    irq: InterruptLine,
    blocks_executed: u64,
}

impl Core {
    pub fn new(
        memory: Arc<GuestMemory>,
        cache: Arc<TranslationCache>,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        let backend = X86_64CodeGen::new();
        let trampoline = Trampoline::new(&backend).map_err(CacheError::Arena)?;
        Ok(Self {
            cpu: Box::new(CpuState::new()),
            memory,
            cache,
            backend,
            trampoline,
            config,
            breakpoints: BTreeSet::new(),
            bp_reported: None,
            stop: Arc::new(AtomicBool::new(false)),
            irq: InterruptLine(Arc::new(AtomicU32::new(0))),
            blocks_executed: 0,
        })
    }

    /// A core with its own translation cache attached to `memory`.
    pub fn standalone(memory: Arc<GuestMemory>, config: CoreConfig) -> Result<Self, CoreError> {
        let cache = TranslationCache::new(&config.cache)?;
        cache.attach(&memory);
        Self::new(memory, cache, config)
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    /// Architectural state may only be changed between blocks, which
    /// is the only time a `&mut Core` exists.
    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn pc(&self) -> u32 {
        self.cpu.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.cpu.pc = pc;
        self.bp_reported = None;
    }

    pub fn blocks_executed(&self) -> u64 {
        self.blocks_executed
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn interrupt_line(&self) -> InterruptLine {
        self.irq.clone()
    }

    /// Blocks are cut before breakpoints, so cached blocks built
    /// earlier are dropped.
    pub fn add_breakpoint(&mut self, pc: u32) {
        if self.breakpoints.insert(pc) {
            self.cache.flush_all();
        }
    }

    pub fn remove_breakpoint(&mut self, pc: u32) {
        self.breakpoints.remove(&pc);
    }

    /// Power-on reset of this core. Drops every cached block.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.bp_reported = None;
        self.stop.store(false, Ordering::Release);
        self.cache.flush_all();
    }

    /// Run until a stop request, a breakpoint or a halting exception.
    pub fn run(&mut self) -> Result<RunExit, CoreError> {
        self.run_until(None)
    }

    /// `run`, executing at most `limit` steps.
    pub fn run_blocks(&mut self, limit: u64) -> Result<RunExit, CoreError> {
        self.run_until(Some(limit))
    }

    fn run_until(&mut self, limit: Option<u64>) -> Result<RunExit, CoreError> {
        let mut steps = 0u64;
        loop {
            if self.stop.swap(false, Ordering::AcqRel) {
                debug!(pc = format_args!("{:#010x}", self.cpu.pc), "stop requested");
                return Ok(RunExit::Stopped);
            }
            if limit.is_some_and(|l| steps >= l) {
                return Ok(RunExit::BlockLimit);
            }
            steps += 1;
            match self.step()? {
                StepOutcome::Breakpoint { pc } => return Ok(RunExit::Breakpoint { pc }),
                StepOutcome::Exception {
                    code,
                    pc,
                    delay_slot,
                    vectored: false,
                } => return Ok(RunExit::GuestException { code, pc, delay_slot }),
                _ => {}
            }
        }
    }

    /// Execute exactly one block (or take one pending interrupt).
    pub fn step(&mut self) -> Result<StepOutcome, CoreError> {
        let pc = self.cpu.pc;
        if self.breakpoints.contains(&pc) && self.bp_reported != Some(pc) {
            self.bp_reported = Some(pc);
            return Ok(StepOutcome::Breakpoint { pc });
        }
        self.bp_reported = None;

        cop0::latch_interrupts(&mut self.cpu, self.irq.pending());
        if cop0::interrupt_deliverable(&self.cpu) {
            debug!(pc = format_args!("{pc:#010x}"), "taking interrupt");
            cop0::enter_exception(&mut self.cpu, ExcCode::Interrupt, pc, false);
            return Ok(StepOutcome::Interrupt);
        }

        let runnable = match self.block_find(pc)? {
            Some(r) => r,
            None => return self.take_exception(),
        };
        let (exit, icount) = match runnable {
            Runnable::Compiled(block) => {
                let exit = self.cpu_block_exec(&block);
                self.cache.unpin(block.id);
                (exit?, block.icount)
            }
            Runnable::Interpreted(block) => (
                Interpreter::exec_block(&mut self.cpu, &self.memory, &block),
                block.icount(),
            ),
        };
        self.blocks_executed += 1;
        cop0::advance_count(&mut self.cpu, icount);
        trace!(pc = format_args!("{pc:#010x}"), ?exit, next = format_args!("{:#010x}", self.cpu.pc), "block exit");

        match exit {
            BlockExit::Fallthrough | BlockExit::Branch | BlockExit::Interrupt => Ok(StepOutcome::Continue),
            BlockExit::CodeModified => {
                debug!(pc = format_args!("{pc:#010x}"), "block modified its own code");
                Ok(StepOutcome::Continue)
            }
            BlockExit::Exception => self.take_exception(),
        }
    }

    /// Find or build the block at `pc`. `None` means fetching the
    /// entry raised a guest exception, already recorded in the CPU.
    fn block_find(&mut self, pc: u32) -> Result<Option<Runnable>, CoreError> {
        if self.config.exec_mode == ExecMode::Jit {
            if let Some(block) = self.cache.pin(pc) {
                return Ok(Some(Runnable::Compiled(block)));
            }
        }
        self.block_gen_code(pc)
    }

    fn build(&self, pc: u32) -> Result<Option<BasicBlock>, CoreError> {
        let builder = BlockBuilder::new(&self.memory, self.config.max_block_insns)
            .with_stop_points(&self.breakpoints);
        match builder.build(pc) {
            Ok(block) => Ok(Some(block)),
            Err(MemError::InvalidAddress { addr }) => {
                warn!(pc = format_args!("{addr:#010x}"), "instruction fetch fault");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Translate the block at `pc` and insert it into the cache.
    fn block_gen_code(&mut self, pc: u32) -> Result<Option<Runnable>, CoreError> {
        let mut attempts = 0;
        loop {
            let Some(block) = self.build(pc)? else {
                self.cpu.raise_fault(ExcCode::InstructionBus, Some(pc));
                self.cpu.exc_delay_slot = 0;
                return Ok(None);
            };
            if self.config.exec_mode == ExecMode::Interpreter {
                return Ok(Some(Runnable::Interpreted(block)));
            }
            let code = translate(&self.backend, &block).inspect_err(|e| {
                error!(%e, "translation failed; stopping core");
            })?;
            match self.cache.insert(&block, &code, &self.memory) {
                Ok(_) => {
                    if let Some(handle) = self.cache.pin(pc) {
                        return Ok(Some(Runnable::Compiled(handle)));
                    }
                    // Invalidated between insertion and pinning.
                }
                Err(CacheError::StaleBlock { page, .. }) => {
                    debug!(pc = format_args!("{pc:#010x}"), page = format_args!("{page:#x}"), "stale block, rebuilding");
                }
                Err(e @ CacheError::CapacityExceeded { .. }) => {
                    warn!(%e, pc = format_args!("{pc:#010x}"), "interpreting uncacheable block");
                    return Ok(Some(Runnable::Interpreted(block)));
                }
                Err(e) => return Err(e.into()),
            }
            attempts += 1;
            if attempts > self.config.stale_retry_limit {
                warn!(pc = format_args!("{pc:#010x}"), attempts, "code keeps changing; interpreting block");
                return Ok(Some(Runnable::Interpreted(block)));
            }
        }
    }

    /// Run compiled code.
    fn cpu_block_exec(&mut self, block: &CachedBlock) -> Result<BlockExit, CoreError> {
        let cpu = &mut *self.cpu;
        cpu.clear_exit();
        cpu.block_first_page = block.first_page;
        cpu.block_last_page = block.last_page;
        cpu.memory = Arc::as_ptr(&self.memory) as *const c_void;
        // SAFETY: the block is pinned, so its code stays mapped; `cpu`
        // is exclusively borrowed and `memory` outlives the call.
        let raw = unsafe { self.trampoline.enter(cpu, block.entry) };
        cpu.memory = std::ptr::null();
        BlockExit::from_raw(raw).ok_or_else(|| {
            error!(pc = format_args!("{:#010x}", block.start), raw, "unknown block exit");
            CoreError::BadExit { pc: block.start, raw }
        })
    }

    /// Handle the synchronous exception recorded in the CPU state.
    fn take_exception(&mut self) -> Result<StepOutcome, CoreError> {
        let pc = self.cpu.pc;
        let code = ExcCode::from_raw(self.cpu.exc_code).ok_or_else(|| {
            error!(pc = format_args!("{pc:#010x}"), code = self.cpu.exc_code, "unknown exception code");
            CoreError::BadExceptionCode {
                pc,
                code: self.cpu.exc_code,
            }
        })?;
        let delay_slot = self.cpu.exc_delay_slot != 0;
        self.cpu.fault_pending = 0;
        let vectored = self.config.exception_policy == ExceptionPolicy::Vector;
        if vectored {
            cop0::enter_exception(&mut self.cpu, code, pc, delay_slot);
        }
        debug!(%code, pc = format_args!("{pc:#010x}"), delay_slot, vectored, "guest exception");
        Ok(StepOutcome::Exception {
            code,
            pc,
            delay_slot,
            vectored,
        })
    }
}
