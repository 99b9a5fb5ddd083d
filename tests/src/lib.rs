//! Cross-crate tests: real R5900 instruction sequences run through
//! the decoder, block builder, code generator and dispatcher.

#![cfg(test)]

mod asm;
mod backend;
mod frontend;
mod integration;
mod memory;
