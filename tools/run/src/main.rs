//! ee-run: load a raw guest image and run it on one core.
//!
//! RAM is mapped per the memory configuration, with an SIO console
//! at 0x1000_F180 that echoes guest bytes to stdout. The core runs
//! until BREAK, an unhandled exception, a stop (Ctrl-C ends the
//! process) or the block budget, then the register file is printed.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use ee_core::cpu::{GPR_NAMES, RESET_PC};
use ee_core::{ExcCode, ExceptionPolicy, ExecMode, MachineConfig};
use ee_exec::{Core, RunExit};
use ee_mem::{GuestMemory, MmioDevice};
use tracing::info;

const SIO_BASE: u32 = 0x1000_F180;
const SIO_SIZE: u32 = 0x10;
const ROM_BASE: u32 = 0x1FC0_0000;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Jit,
    Interp,
}

#[derive(Debug, Parser)]
#[command(name = "ee-run", about = "Run a raw guest image")]
struct Args {
    /// Raw little-endian image.
    image: PathBuf,
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Load address in RAM.
    #[arg(long, value_parser = parse_hex, default_value = "0x00100000")]
    load: u32,
    /// Entry point (defaults to the load address).
    #[arg(long, value_parser = parse_hex)]
    entry: Option<u32>,
    /// Map the image as boot ROM and start at the reset vector.
    #[arg(long, conflicts_with_all = ["load", "entry"])]
    rom: bool,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Enter the guest exception vector instead of stopping.
    #[arg(long)]
    vector: bool,
    /// Stop after this many blocks.
    #[arg(long)]
    max_blocks: Option<u64>,
    /// Stop when execution reaches this address.
    #[arg(long, value_parser = parse_hex)]
    breakpoint: Vec<u32>,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let t = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(t, 16).map_err(|e| format!("bad address {s:?}: {e}"))
}

/// Serial console: writes to the TX register go to stdout; the
/// status register always reports ready.
struct SioConsole;

impl MmioDevice for SioConsole {
    fn read(&mut self, offset: u32, _size: u32) -> u128 {
        match offset {
            // ISR: transmitter empty.
            0x4 => 0x2000,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u32, _size: u32, value: u128) {
        if offset == 0 {
            let mut out = io::stdout().lock();
            let _ = out.write_all(&[value as u8]);
            let _ = out.flush();
        }
    }
}

fn load_config(args: &Args) -> Result<MachineConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            MachineConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => MachineConfig::default(),
    };
    // Bare images stop at their first exception unless told otherwise.
    if args.vector {
        cfg.core.exception_policy = ExceptionPolicy::Vector;
    } else if args.config.is_none() {
        cfg.core.exception_policy = ExceptionPolicy::Halt;
    }
    match args.mode {
        Some(ModeArg::Jit) => cfg.core.exec_mode = ExecMode::Jit,
        Some(ModeArg::Interp) => cfg.core.exec_mode = ExecMode::Interpreter,
        None => {}
    }
    Ok(cfg)
}

fn print_registers(core: &Core) {
    let cpu = core.cpu();
    println!("pc  = {:#010x}", cpu.pc);
    for (i, name) in GPR_NAMES.iter().enumerate() {
        let g = cpu.gpr[i];
        print!("{name:>4} = {:016x}_{:016x}", g.hi, g.lo);
        if i % 2 == 1 {
            println!();
        } else {
            print!("   ");
        }
    }
    println!("  hi = {:016x}     lo = {:016x}", cpu.hi, cpu.lo);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;
    let image = fs::read(&args.image).with_context(|| format!("reading {}", args.image.display()))?;

    let memory = Arc::new(GuestMemory::with_config(&cfg.memory)?);
    memory.map_device(SIO_BASE, SIO_SIZE, Box::new(SioConsole))?;
    let entry = if args.rom {
        memory.map_rom(ROM_BASE, &image)?;
        RESET_PC
    } else {
        memory
            .write_bytes(args.load, &image)
            .with_context(|| format!("image does not fit at {:#010x}", args.load))?;
        args.entry.unwrap_or(args.load)
    };

    let mut core = Core::standalone(memory, cfg.core)?;
    core.set_pc(entry);
    for &bp in &args.breakpoint {
        core.add_breakpoint(bp);
    }
    info!(entry = format_args!("{entry:#010x}"), bytes = image.len(), "starting");

    let exit = match args.max_blocks {
        Some(n) => core.run_blocks(n)?,
        None => core.run()?,
    };
    let stats = core.cache().stats();
    info!(
        blocks = core.blocks_executed(),
        hits = stats.hits,
        misses = stats.misses,
        invalidations = stats.invalidations,
        evictions = stats.evictions,
        "finished"
    );

    print_registers(&core);
    match exit {
        RunExit::GuestException {
            code: ExcCode::Breakpoint,
            pc,
            ..
        } => println!("break at {pc:#010x}"),
        RunExit::GuestException { code, pc, delay_slot } => {
            bail!("unhandled {code} exception at {pc:#010x} (delay slot: {delay_slot})")
        }
        RunExit::Breakpoint { pc } => println!("breakpoint at {pc:#010x}"),
        RunExit::BlockLimit => println!("block limit reached"),
        RunExit::Stopped => println!("stopped"),
    }
    Ok(())
}
