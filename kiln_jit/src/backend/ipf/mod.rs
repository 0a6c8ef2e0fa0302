//! IPF-style target.
//!
//! - `registers`: register files, calling convention and used-register masks
//! - `frame`: memory stack frame shared by the prolog steps
//! - `codegen`: lowering behind the selector callbacks
//! - `prolog_epilog`: frame setup and teardown after register allocation

pub mod codegen;
pub mod frame;
pub mod prolog_epilog;
pub mod registers;

pub use codegen::{IpfCodeGen, IpfOpnd, IpfStats};
pub use frame::{FrameLayout, SaveSlot};
pub use prolog_epilog::{generate as generate_prolog_epilog, PrologEpilog, PrologEpilogStats, SaveHome, Saved};
pub use registers::{AppReg, Reg, RegClass, UsedRegs};
