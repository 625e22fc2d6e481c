//! Compiler configuration
//!
//! Every limit here is bounded by the bytecode encoding; values above the
//! encoding cap are clamped rather than rejected.

use serde::{Deserialize, Serialize};

/// Largest index representable in a tagged register operand
pub const MAX_OPERAND_INDEX: u32 = (1 << 14) - 1;
/// Largest constant-pool size addressable by a 16-bit index
pub const MAX_POOL_ENTRIES: usize = 1 << 16;
/// Longest string carried inline by `LoadStr`
pub const MAX_INLINE_STRING_LEN: usize = 15;
/// Exclusive upper bound of variadic-tail indices
pub const MAX_ETC_INDEX: u32 = 256;

/// Bytecode compiler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Encode small integers and short strings directly in the instruction
    pub inline_literals: bool,
    /// Longest string (in bytes) eligible for inline encoding
    pub max_inline_string_len: usize,
    /// Record the offset -> line table
    pub record_line_info: bool,
    /// Maximum number of constant-pool entries
    pub max_constants: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            inline_literals: true,
            max_inline_string_len: MAX_INLINE_STRING_LEN,
            record_line_info: true,
            max_constants: MAX_POOL_ENTRIES,
        }
    }
}

impl CompilerConfig {
    /// Parse a configuration from TOML
    ///
    /// ```toml
    /// inline_literals = false
    /// max_constants = 1024
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Self>(source).map(Self::clamped)
    }

    /// Clamp every limit to what the encoding can represent
    pub fn clamped(mut self) -> Self {
        self.max_inline_string_len = self.max_inline_string_len.min(MAX_INLINE_STRING_LEN);
        self.max_constants = self.max_constants.min(MAX_POOL_ENTRIES);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = CompilerConfig::default();
        assert!(config.inline_literals);
        assert_eq!(config.max_inline_string_len, 15);
        assert_eq!(config.max_constants, 65536);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CompilerConfig::from_toml_str("inline_literals = false\n").unwrap();
        assert!(!config.inline_literals);
        assert!(config.record_line_info);
        assert_eq!(config.max_constants, MAX_POOL_ENTRIES);
    }

    #[test]
    fn test_from_toml_clamps() {
        let config = CompilerConfig::from_toml_str(
            "max_inline_string_len = 200\nmax_constants = 1000000\n",
        )
        .unwrap();
        assert_eq!(config.max_inline_string_len, MAX_INLINE_STRING_LEN);
        assert_eq!(config.max_constants, MAX_POOL_ENTRIES);
    }

    #[test]
    fn test_from_toml_rejects_bad_type() {
        assert!(CompilerConfig::from_toml_str("inline_literals = 3\n").is_err());
    }
}
