pub mod codegen;
pub mod emitter;
pub mod regs;

pub use codegen::X86_64CodeGen;
