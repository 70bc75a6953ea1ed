//! Core configuration
//!
//! Defaults match the guest platform (16 MiB instruction buffer). Some knobs
//! can be overridden from the environment for debugging.

/// Size of the instruction buffer arena
pub const INSN_BUFFER_SIZE: usize = 0x100_0000;

/// Number of translation table slots
pub const TRANSLATION_TABLE_SIZE: usize = 0x1_0000;

/// Limit block size to avoid huge blocks
pub const MAX_BLOCK_INSNS: usize = 64;

/// Tunables for one ARM core instance
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Instruction buffer capacity in bytes
    pub insn_buffer_size: usize,
    /// Translation table capacity in entries
    pub table_size: usize,
    /// Maximum guest instructions per translated block
    pub max_block_insns: usize,
    /// Dispatch through the translation cache (false = pure interpretation)
    pub translate: bool,
    /// Invalidate translated blocks the guest writes into
    pub detect_self_modifying: bool,
    /// Verbose execution logging
    pub debug: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            insn_buffer_size: INSN_BUFFER_SIZE,
            table_size: TRANSLATION_TABLE_SIZE,
            max_block_insns: MAX_BLOCK_INSNS,
            translate: true,
            detect_self_modifying: true,
            debug: false,
        }
    }
}

impl CoreConfig {
    /// Default configuration with `ARMV5_*` environment overrides applied
    ///
    /// - `ARMV5_DEBUG`: enable debug logging
    /// - `ARMV5_INTERPRET`: disable the translation cache
    /// - `ARMV5_INSN_BUFFER`: instruction buffer size in bytes
    pub fn from_env() -> Self {
        let mut config = CoreConfig::default();
        if std::env::var("ARMV5_DEBUG").is_ok() {
            config.debug = true;
        }
        if std::env::var("ARMV5_INTERPRET").is_ok() {
            config.translate = false;
        }
        if let Some(size) = std::env::var("ARMV5_INSN_BUFFER")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            config.insn_buffer_size = size;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sizes() {
        let config = CoreConfig::default();
        assert_eq!(config.insn_buffer_size, 16 * 1024 * 1024);
        assert!(config.translate);
        assert_eq!(config.max_block_insns, 64);
    }
}
