//! ee-blockdump: static block discovery over a raw guest image.
//!
//! Starting from the entry point, forms blocks the way the dispatcher
//! would, prints their disassembly and register allocation plan, and
//! reports the size of the compiled host code. Static branch targets
//! and fallthrough addresses are followed breadth-first.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ee_backend::{allocate, translate, X86_64CodeGen};
use ee_core::dump::dump_block;
use ee_core::{BasicBlock, MemoryConfig, Terminator};
use ee_frontend::BlockBuilder;
use ee_mem::GuestMemory;

#[derive(Debug, Parser)]
#[command(name = "ee-blockdump", about = "Dump translated blocks of a raw guest image")]
struct Args {
    image: PathBuf,
    #[arg(long, value_parser = parse_hex, default_value = "0x00100000")]
    load: u32,
    /// First block (defaults to the load address).
    #[arg(long, value_parser = parse_hex)]
    start: Option<u32>,
    /// Maximum number of blocks to dump.
    #[arg(long, default_value_t = 64)]
    count: usize,
    #[arg(long, default_value_t = 512)]
    max_insns: u32,
    /// Print the allocation plan of each block.
    #[arg(long)]
    regalloc: bool,
    /// Print the host code bytes.
    #[arg(long)]
    hex: bool,
    /// Output file (defaults to stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let t = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(t, 16).map_err(|e| format!("bad address {s:?}: {e}"))
}

/// Addresses control can reach when `block` exits.
fn successors(block: &BasicBlock) -> Vec<u32> {
    let mut out = Vec::new();
    if let Some(i) = block.branch_index() {
        let insn = &block.insns[i];
        if let Some(t) = insn.op.static_target(insn.addr) {
            out.push(t);
        }
    }
    match block.terminator {
        Terminator::Jump | Terminator::Return | Terminator::FetchFault { .. } => {}
        _ => out.push(block.end),
    }
    out
}

fn hex_dump(out: &mut impl Write, code: &[u8]) -> io::Result<()> {
    for (i, chunk) in code.chunks(16).enumerate() {
        write!(out, "    {:04x}:", i * 16)?;
        for b in chunk {
            write!(out, " {b:02x}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let image = fs::read(&args.image).with_context(|| format!("reading {}", args.image.display()))?;
    let memory = GuestMemory::with_config(&MemoryConfig::default())?;
    memory
        .write_bytes(args.load, &image)
        .with_context(|| format!("image does not fit at {:#010x}", args.load))?;
    let image_end = args.load.wrapping_add(image.len() as u32);

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            fs::File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let builder = BlockBuilder::new(&memory, args.max_insns);
    let backend = X86_64CodeGen::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([args.start.unwrap_or(args.load)]);
    let (mut blocks, mut guest_bytes, mut host_bytes) = (0usize, 0usize, 0usize);

    while let Some(pc) = queue.pop_front() {
        if blocks >= args.count {
            break;
        }
        if !seen.insert(pc) || pc < args.load || pc >= image_end {
            continue;
        }
        let block = match builder.build(pc) {
            Ok(b) => b,
            Err(e) => {
                writeln!(out, "---- 0x{pc:08x}: {e}")?;
                continue;
            }
        };
        dump_block(&block, &mut out)?;
        if args.regalloc {
            allocate(&block)?.dump(&block, &mut out)?;
        }
        let code = translate(&backend, &block)?;
        writeln!(out, "  host: {} bytes, {} spills", code.code.len(), code.spills)?;
        writeln!(out, "  clobbers: {:?}", code.clobbers)?;
        if args.hex {
            hex_dump(&mut out, &code.code)?;
        }
        writeln!(out)?;

        blocks += 1;
        guest_bytes += (block.end - block.start) as usize;
        host_bytes += code.code.len();
        queue.extend(successors(&block));
    }

    writeln!(
        out,
        "{blocks} blocks, {guest_bytes} guest bytes, {host_bytes} host bytes"
    )?;
    out.flush()?;
    Ok(())
}
