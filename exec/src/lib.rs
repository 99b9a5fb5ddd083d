//! Execution engine: the translation cache and the per-core
//! dispatcher that drives the lookup, translate and execute cycle.

pub mod cache;
pub mod error;
pub mod exec_loop;

pub use cache::{BlockId, BlockInfo, CacheStats, CachedBlock, TranslationCache};
pub use error::{CacheError, CoreError};
pub use exec_loop::{Core, InterruptLine, RunExit, StepOutcome, StopHandle};
