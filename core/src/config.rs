//! Runtime configuration, loadable from TOML.

use serde::{Deserialize, Serialize};

/// What the dispatcher does with a synchronous guest exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionPolicy {
    /// Enter the guest exception vector.
    #[default]
    Vector,
    /// Stop the core and report the exception to the caller.
    Halt,
}

/// Which tier executes guest blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecMode {
    #[default]
    Jit,
    Interpreter,
}

/// Translation cache bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub max_blocks: usize,
    pub max_code_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_blocks: 16 * 1024,
            max_code_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Maximum guest instructions per block (delay slot excluded).
    pub max_block_insns: u32,
    pub cache: CacheConfig,
    pub exception_policy: ExceptionPolicy,
    pub exec_mode: ExecMode,
    /// How often a block whose pages changed during compilation is
    /// rebuilt before falling back to the interpreter.
    pub stale_retry_limit: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_block_insns: 512,
            cache: CacheConfig::default(),
            exception_policy: ExceptionPolicy::default(),
            exec_mode: ExecMode::default(),
            stale_retry_limit: 4,
        }
    }
}

/// Guest physical memory layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub ram_base: u32,
    pub ram_size: u32,
    /// Extra backing reserved for ROM images.
    pub rom_reserve: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ram_base: 0,
            ram_size: 32 * 1024 * 1024,
            rom_reserve: 4 * 1024 * 1024,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    pub core: CoreConfig,
    pub memory: MemoryConfig,
}

impl MachineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
