//! Emotion Engine frontend: instruction decoding, basic block
//! formation and the reference interpreter.

pub mod builder;
pub mod decode;
pub mod interp;

pub use builder::BlockBuilder;
pub use decode::decode;
pub use interp::Interpreter;
