//! High-level intermediate representation.
//!
//! The HIR is an instruction-list IR over an explicit control-flow graph:
//!
//! # Core Components
//!
//! - **Arena** (`arena.rs`): typed IDs, dense side tables, bit sets
//! - **Types** (`types.rs`): interned type descriptors and the class hierarchy
//! - **Opcodes** (`opcode.rs`): operations and modifiers
//! - **Instructions** (`inst.rs`): instructions, operands, payloads
//! - **Method** (`method.rs`): blocks, edges and all IR mutation
//! - **CFG** (`cfg.rs`): dominators and natural loops
//! - **Builder** (`builder.rs`): typed instruction construction
//! - **Interpreter** (`interp.rs`): reference execution for testing passes
//!
//! Values are either temporaries in SSA form or variables accessed with
//! `LdVar`/`StVar`. Exception-check results are *taus*: zero-width proof
//! tokens consumed by the instructions they justify.

pub mod arena;
pub mod builder;
pub mod cfg;
pub mod inst;
pub mod interp;
pub mod method;
pub mod opcode;
pub mod types;

// Re-export commonly used types
pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use builder::IrBuilder;
pub use cfg::{DominatorTree, Loop, LoopId, LoopTree};
pub use inst::{ConstValue, Inst, InstId, Opnd, OpndId, OpndKind, Payload, VmHelper};
pub use interp::{Interpreter, InterpError, Value};
pub use method::{Block, BlockId, BlockKind, Edge, EdgeId, EdgeKind, MethodIr};
pub use opcode::{CmpMod, InstFlags, Modifier, Opcode, OverflowMod};
pub use types::{ClassId, FieldId, MethodId, TypeId, TypeKind, TypeManager};
