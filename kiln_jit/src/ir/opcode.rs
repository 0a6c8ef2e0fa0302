//! HIR opcodes and instruction modifiers.

use bitflags::bitflags;

/// Operation performed by a HIR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ---- arithmetic ----
    Add,
    Sub,
    Mul,
    /// Division guarded by a divide-by-zero proof.
    TauDiv,
    TauRem,
    Neg,
    MulHi,
    Min,
    Max,
    Abs,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    /// `(src0 << src1) + src2`, with a constant shift.
    ShlAdd,
    Select,
    Conv,
    Cmp,

    // ---- control ----
    Branch,
    Switch,
    Return,
    Throw,

    // ---- calls ----
    DirectCall,
    IndirectCall,
    VmHelperCall,

    // ---- values and variables ----
    LdConstant,
    LdNull,
    /// Load of an interned string reference.
    LdRef,
    LdFieldOffset,
    Copy,
    DefArg,
    LdVar,
    StVar,
    Phi,

    // ---- objects and memory ----
    NewObj,
    NewArray,
    LdArrayLen,
    LdFieldAddr,
    LdStaticAddr,
    LdElemAddr,
    LdArrayBaseAddr,
    AddScaledIndex,
    TauLdInd,
    TauStInd,
    TauLdVTableAddr,
    CompressRef,
    UncompressRef,
    TauMonitorEnter,
    TauMonitorExit,

    // ---- taus ----
    TauSafe,
    TauUnsafe,
    TauPoint,
    TauEdge,
    TauAnd,
    TauCheckNull,
    TauCheckBounds,
    TauCheckZero,
    TauCheckCast,
    TauStaticCast,
    TauAsType,
    TauInstanceOf,
    TauHasType,
    TauHasExactType,
    TauIsNonNull,

    // ---- vectors ----
    /// Build a vector from one scalar per lane.
    VecPack,
    /// Read one lane of a vector.
    VecExtract,
}

impl Opcode {
    /// Instructions the selector may sink to their use.
    pub fn is_constant_like(self) -> bool {
        matches!(
            self,
            Opcode::LdConstant | Opcode::LdNull | Opcode::LdFieldOffset | Opcode::TauLdVTableAddr
        )
    }

    /// Instructions that end a block.
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::Switch | Opcode::Return | Opcode::Throw)
    }

    pub fn is_call(self) -> bool {
        matches!(self, Opcode::DirectCall | Opcode::IndirectCall | Opcode::VmHelperCall)
    }

    /// Type guards reduced by tau simplification.
    pub fn is_type_guard(self) -> bool {
        matches!(self, Opcode::TauHasType | Opcode::TauHasExactType | Opcode::TauIsNonNull)
    }

    /// Runtime checks that may raise an exception.
    pub fn is_check(self) -> bool {
        matches!(
            self,
            Opcode::TauCheckNull | Opcode::TauCheckBounds | Opcode::TauCheckZero | Opcode::TauCheckCast
        )
    }

    /// Free of side effects and exceptions.
    pub fn is_pure(self) -> bool {
        !self.is_terminator()
            && !self.is_call()
            && !self.is_check()
            && !matches!(
                self,
                Opcode::StVar
                    | Opcode::TauStInd
                    | Opcode::NewObj
                    | Opcode::NewArray
                    | Opcode::TauMonitorEnter
                    | Opcode::TauMonitorExit
                    | Opcode::TauLdInd
            )
    }

    /// Commutative binary operations.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Mul | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Min | Opcode::Max
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::TauDiv => "div",
            Opcode::TauRem => "rem",
            Opcode::Neg => "neg",
            Opcode::MulHi => "mulhi",
            Opcode::Min => "min",
            Opcode::Max => "max",
            Opcode::Abs => "abs",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Not => "not",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::ShlAdd => "shladd",
            Opcode::Select => "select",
            Opcode::Conv => "conv",
            Opcode::Cmp => "cmp",
            Opcode::Branch => "br",
            Opcode::Switch => "switch",
            Opcode::Return => "return",
            Opcode::Throw => "throw",
            Opcode::DirectCall => "call",
            Opcode::IndirectCall => "calli",
            Opcode::VmHelperCall => "callhelper",
            Opcode::LdConstant => "ldc",
            Opcode::LdNull => "ldnull",
            Opcode::LdRef => "ldref",
            Opcode::LdFieldOffset => "ldfieldoffset",
            Opcode::Copy => "copy",
            Opcode::DefArg => "defarg",
            Opcode::LdVar => "ldvar",
            Opcode::StVar => "stvar",
            Opcode::Phi => "phi",
            Opcode::NewObj => "newobj",
            Opcode::NewArray => "newarray",
            Opcode::LdArrayLen => "arraylen",
            Opcode::LdFieldAddr => "ldfieldaddr",
            Opcode::LdStaticAddr => "ldstaticaddr",
            Opcode::LdElemAddr => "ldelemaddr",
            Opcode::LdArrayBaseAddr => "ldbase",
            Opcode::AddScaledIndex => "addindex",
            Opcode::TauLdInd => "ldind",
            Opcode::TauStInd => "stind",
            Opcode::TauLdVTableAddr => "ldvtable",
            Opcode::CompressRef => "compressref",
            Opcode::UncompressRef => "uncompressref",
            Opcode::TauMonitorEnter => "monenter",
            Opcode::TauMonitorExit => "monexit",
            Opcode::TauSafe => "tausafe",
            Opcode::TauUnsafe => "tauunsafe",
            Opcode::TauPoint => "taupoint",
            Opcode::TauEdge => "tauedge",
            Opcode::TauAnd => "tauand",
            Opcode::TauCheckNull => "chknull",
            Opcode::TauCheckBounds => "chkbounds",
            Opcode::TauCheckZero => "chkzero",
            Opcode::TauCheckCast => "chkcast",
            Opcode::TauStaticCast => "staticcast",
            Opcode::TauAsType => "astype",
            Opcode::TauInstanceOf => "instanceof",
            Opcode::TauHasType => "hastype",
            Opcode::TauHasExactType => "hasexacttype",
            Opcode::TauIsNonNull => "isnonnull",
            Opcode::VecPack => "vpack",
            Opcode::VecExtract => "vextract",
        }
    }
}

// =============================================================================
// Modifiers
// =============================================================================

/// Overflow checking mode of integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverflowMod {
    #[default]
    None,
    Signed,
    Unsigned,
}

/// Comparison relation of `Cmp`, `Branch` and `Select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpMod {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LtUn,
    LeUn,
    GtUn,
    GeUn,
    /// Unary: operand is zero or null.
    Zero,
    /// Unary: operand is non-zero or non-null.
    NonZero,
}

impl CmpMod {
    pub fn is_unary(self) -> bool {
        matches!(self, CmpMod::Zero | CmpMod::NonZero)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, CmpMod::LtUn | CmpMod::LeUn | CmpMod::GtUn | CmpMod::GeUn)
    }

    /// Relation that holds exactly when `self` does not.
    pub fn negate(self) -> CmpMod {
        match self {
            CmpMod::Eq => CmpMod::Ne,
            CmpMod::Ne => CmpMod::Eq,
            CmpMod::Lt => CmpMod::Ge,
            CmpMod::Le => CmpMod::Gt,
            CmpMod::Gt => CmpMod::Le,
            CmpMod::Ge => CmpMod::Lt,
            CmpMod::LtUn => CmpMod::GeUn,
            CmpMod::LeUn => CmpMod::GtUn,
            CmpMod::GtUn => CmpMod::LeUn,
            CmpMod::GeUn => CmpMod::LtUn,
            CmpMod::Zero => CmpMod::NonZero,
            CmpMod::NonZero => CmpMod::Zero,
        }
    }

    /// Relation after exchanging the two operands.
    pub fn swap(self) -> CmpMod {
        match self {
            CmpMod::Lt => CmpMod::Gt,
            CmpMod::Le => CmpMod::Ge,
            CmpMod::Gt => CmpMod::Lt,
            CmpMod::Ge => CmpMod::Le,
            CmpMod::LtUn => CmpMod::GtUn,
            CmpMod::LeUn => CmpMod::GeUn,
            CmpMod::GtUn => CmpMod::LtUn,
            CmpMod::GeUn => CmpMod::LeUn,
            other => other,
        }
    }
}

bitflags! {
    /// Boolean instruction modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstFlags: u16 {
        /// The operation is known never to raise, so overflow checks are dropped.
        const EXCEPTION_NEVER = 1 << 0;
        /// Operands are interpreted as signed (division, right shift, conversion).
        const SIGNED          = 1 << 1;
        /// Shift amounts are masked to the operand width.
        const SHIFT_MASK      = 1 << 2;
        /// Memory access auto-compresses / decompresses references.
        const AUTO_COMPRESS   = 1 << 3;
        /// Floating-point semantics are strict.
        const STRICT          = 1 << 4;
        /// The helper call never triggers a collection or has visible effects.
        const ALLOC_SAFE      = 1 << 5;
    }
}

/// All modifiers attached to an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Modifier {
    pub overflow: OverflowMod,
    pub cmp: Option<CmpMod>,
    pub flags: InstFlags,
}

impl Modifier {
    pub const NONE: Modifier = Modifier {
        overflow: OverflowMod::None,
        cmp: None,
        flags: InstFlags::empty(),
    };

    pub fn cmp(cmp: CmpMod) -> Self {
        Modifier {
            cmp: Some(cmp),
            ..Modifier::NONE
        }
    }

    pub fn overflow(overflow: OverflowMod) -> Self {
        Modifier {
            overflow,
            ..Modifier::NONE
        }
    }

    pub fn with_flags(mut self, flags: InstFlags) -> Self {
        self.flags |= flags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negate_is_involution() {
        for m in [CmpMod::Eq, CmpMod::Lt, CmpMod::GeUn, CmpMod::Zero] {
            assert_eq!(m.negate().negate(), m);
        }
        assert_eq!(CmpMod::Lt.swap(), CmpMod::Gt);
        assert_eq!(CmpMod::Eq.swap(), CmpMod::Eq);
    }

    #[test]
    fn test_constant_like() {
        assert!(Opcode::LdConstant.is_constant_like());
        assert!(Opcode::TauLdVTableAddr.is_constant_like());
        assert!(!Opcode::Add.is_constant_like());
        assert!(Opcode::TauHasType.is_type_guard());
        assert!(!Opcode::TauLdInd.is_pure());
    }
}
