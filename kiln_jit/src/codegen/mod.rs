//! Instruction selection bridge.
//!
//! Walks phi-free HIR and drives a backend through the callback contracts in
//! [`callback`]:
//!
//! - `cfg_selector`: node and edge replay in reverse postorder
//! - `selector`: per-block lowering with the operand handle cache
//!
//! Any backend implementing [`CodeGenCallback`] can be driven; the IPF
//! backend in `crate::backend::ipf` is the one this crate ships.

pub mod callback;
pub mod cfg_selector;
pub mod selector;

pub use callback::{
    ArithOp, AutoCompress, CallTarget, CfgCallback, CmpOp, CmpType, CodeGenCallback, DivOp, EdgeTag,
    InstructionCallback, IntOp, MethodCallback, NodeKind, OpType, RefArithOp, VarHandle, VecOp,
};
pub use cfg_selector::{select_method, NO_PROFILE};
pub use selector::InstSelector;

// =============================================================================
// Configuration
// =============================================================================

/// Instruction selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Generate constant-like instructions at each use instead of once.
    /// Lowers register pressure at the cost of repeated materialization.
    pub sink_constants: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            sink_constants: false,
        }
    }
}

impl SelectorConfig {
    /// Sink constants to their uses.
    pub fn sinking() -> Self {
        Self {
            sink_constants: true,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from instruction selection.
#[derive(Debug, Clone, Default)]
pub struct SelectStats {
    pub nodes: usize,
    pub edges: usize,
    pub vars: usize,
    /// Instructions handed to the backend, rematerializations included.
    pub insts_lowered: usize,
    /// Constant-like instructions skipped by the scan.
    pub constants_sunk: usize,
    /// Constants generated at a use rather than in scan order.
    pub rematerialized: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_presets() {
        assert!(!SelectorConfig::default().sink_constants);
        assert!(SelectorConfig::sinking().sink_constants);
    }
}
