//! Machine-level code generation.
//!
//! - `machine`: the machine CFG the backend lowers into
//! - `layout`: block linearization and branch fix-up
//! - `ipf`: the IPF-style target

pub mod ipf;
pub mod layout;
pub mod machine;

pub use layout::{linearize, LayoutConfig, LayoutStats, LayoutStrategy};
pub use machine::{CgNode, MEdge, MInst, MachineCfg, Mnemonic, Operand};
