//! IPF register definitions and the software calling convention.
//!
//! Register files:
//! - 128 general registers: r0..r31 static, r32..r127 stacked
//! - 128 floating-point registers
//! - 64 predicates, p0 hard-wired true
//! - 8 branch registers
//! - the application registers the prolog cares about (ar.pfs, ar.unat, ar.lc)
//!
//! Register sets use bitfields for O(1) membership tests.

use bitflags::bitflags;
use std::fmt;

// =============================================================================
// Registers
// =============================================================================

/// Application registers touched by the prolog and epilog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppReg {
    /// Previous function state, written by `alloc`.
    Pfs,
    /// NaT collection for spilled general registers.
    Unat,
    /// Loop count.
    Lc,
}

impl AppReg {
    fn bit(self) -> ArSet {
        match self {
            AppReg::Pfs => ArSet::PFS,
            AppReg::Unat => ArSet::UNAT,
            AppReg::Lc => ArSet::LC,
        }
    }
}

/// Register file of a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    General,
    Float,
    Predicate,
    Branch,
}

/// A machine register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Gr(u8),
    Fr(u8),
    Pr(u8),
    Br(u8),
    Ar(AppReg),
    /// Outgoing argument slot `k`, renamed to a stacked register by `alloc`.
    Out(u8),
    /// Not yet assigned to a physical register.
    Virtual { class: RegClass, index: u32 },
}

impl Reg {
    pub const ZERO: Reg = Reg::Gr(0);
    pub const GP: Reg = Reg::Gr(1);
    /// Prolog/epilog address scratch.
    pub const SCRATCH: Reg = Reg::Gr(2);
    /// Prolog/epilog value scratch.
    pub const SCRATCH2: Reg = Reg::Gr(3);
    /// Integer return value.
    pub const RET: Reg = Reg::Gr(8);
    pub const SP: Reg = Reg::Gr(12);
    /// Floating-point return value.
    pub const FRET: Reg = Reg::Fr(8);
    /// Constant +0.0.
    pub const F0: Reg = Reg::Fr(0);
    /// Constant +1.0.
    pub const F1: Reg = Reg::Fr(1);
    /// Always true.
    pub const P0: Reg = Reg::Pr(0);
    /// Return link.
    pub const B0: Reg = Reg::Br(0);
    /// Indirect branch scratch.
    pub const B6: Reg = Reg::Br(6);

    /// First stacked general register.
    pub const FIRST_STACKED: u8 = 32;
    /// Integer arguments arrive in r32.. and float arguments in f8..
    pub const MAX_REG_ARGS: u8 = 8;

    pub fn is_virtual(self) -> bool {
        matches!(self, Reg::Virtual { .. })
    }

    pub fn is_stacked(self) -> bool {
        matches!(self, Reg::Gr(n) if n >= Self::FIRST_STACKED)
    }

    /// Preserved across calls by the callee.
    pub fn is_preserved(self) -> bool {
        match self {
            Reg::Gr(n) => (4..=7).contains(&n),
            Reg::Fr(n) => (2..=5).contains(&n) || (16..=31).contains(&n),
            Reg::Pr(n) => (1..=5).contains(&n) || n >= 16,
            Reg::Br(n) => (1..=5).contains(&n),
            Reg::Ar(AppReg::Unat | AppReg::Lc) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Reg::Gr(12) => write!(f, "sp"),
            Reg::Gr(n) => write!(f, "r{n}"),
            Reg::Fr(n) => write!(f, "f{n}"),
            Reg::Pr(n) => write!(f, "p{n}"),
            Reg::Br(n) => write!(f, "b{n}"),
            Reg::Ar(AppReg::Pfs) => write!(f, "ar.pfs"),
            Reg::Ar(AppReg::Unat) => write!(f, "ar.unat"),
            Reg::Ar(AppReg::Lc) => write!(f, "ar.lc"),
            Reg::Out(n) => write!(f, "out{n}"),
            Reg::Virtual { class, index } => {
                let c = match class {
                    RegClass::General => 'g',
                    RegClass::Float => 'f',
                    RegClass::Predicate => 'p',
                    RegClass::Branch => 'b',
                };
                write!(f, "%{c}{index}")
            }
        }
    }
}

// =============================================================================
// Register Sets
// =============================================================================

bitflags! {
    /// Set of application registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ArSet: u8 {
        const PFS = 1 << 0;
        const UNAT = 1 << 1;
        const LC = 1 << 2;
    }
}

/// Preserved general registers r4..r7.
pub const PRESERVED_GR: u128 = 0xF0;
/// Preserved floating-point registers f2..f5 and f16..f31.
pub const PRESERVED_FR: u128 = 0x3C | (0xFFFF << 16);
/// Preserved predicates p1..p5 and p16..p63.
pub const PRESERVED_PR: u64 = 0x3E | (!0u64 << 16);
/// Preserved branch registers b1..b5.
pub const PRESERVED_BR: u8 = 0x3E;

/// Physical registers referenced by a method, one bit per register.
///
/// A set bit means "used". The prolog generator also sets bits for the
/// stacked registers it takes as save homes, so later steps see them as
/// unavailable.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct UsedRegs {
    pub gr: u128,
    pub fr: u128,
    pub pr: u64,
    pub br: u8,
    pub ar: ArSet,
}

impl UsedRegs {
    pub const EMPTY: UsedRegs = UsedRegs {
        gr: 0,
        fr: 0,
        pr: 0,
        br: 0,
        ar: ArSet::empty(),
    };

    /// Collect every physical register in `regs`.
    pub fn scan(regs: impl IntoIterator<Item = Reg>) -> Self {
        let mut used = Self::EMPTY;
        for r in regs {
            used.insert(r);
        }
        used
    }

    /// Mark `reg` used. Virtual and outgoing registers are ignored.
    #[inline]
    pub fn insert(&mut self, reg: Reg) {
        match reg {
            Reg::Gr(n) => self.gr |= 1 << n,
            Reg::Fr(n) => self.fr |= 1 << n,
            Reg::Pr(n) => self.pr |= 1 << n,
            Reg::Br(n) => self.br |= 1 << n,
            Reg::Ar(a) => self.ar |= a.bit(),
            Reg::Out(_) | Reg::Virtual { .. } => {}
        }
    }

    #[inline]
    pub fn contains(&self, reg: Reg) -> bool {
        match reg {
            Reg::Gr(n) => self.gr & (1 << n) != 0,
            Reg::Fr(n) => self.fr & (1 << n) != 0,
            Reg::Pr(n) => self.pr & (1 << n) != 0,
            Reg::Br(n) => self.br & (1 << n) != 0,
            Reg::Ar(a) => self.ar.contains(a.bit()),
            Reg::Out(_) | Reg::Virtual { .. } => false,
        }
    }

    /// Used preserved general registers, ascending.
    pub fn preserved_gr(&self) -> impl Iterator<Item = Reg> + '_ {
        bits(self.gr & PRESERVED_GR).map(Reg::Gr)
    }

    pub fn preserved_fr(&self) -> impl Iterator<Item = Reg> + '_ {
        bits(self.fr & PRESERVED_FR).map(Reg::Fr)
    }

    pub fn preserved_br(&self) -> impl Iterator<Item = Reg> + '_ {
        bits(self.br as u128 & PRESERVED_BR as u128).map(Reg::Br)
    }

    pub fn uses_preserved_pr(&self) -> bool {
        self.pr & PRESERVED_PR != 0
    }

    /// Whether any stacked general register is used.
    pub fn uses_stacked(&self) -> bool {
        self.gr >> Reg::FIRST_STACKED != 0
    }

    /// Highest used stacked register, if any.
    pub fn highest_stacked(&self) -> Option<u8> {
        if !self.uses_stacked() {
            return None;
        }
        Some(127 - self.gr.leading_zeros() as u8)
    }

    /// Take the lowest free stacked register in `lo..=hi` and mark it used.
    pub fn take_stacked(&mut self, lo: u8, hi: u8) -> Option<Reg> {
        let lo = lo.max(Reg::FIRST_STACKED);
        let n = (lo..=hi.min(127)).find(|&n| self.gr & (1 << n) == 0)?;
        self.gr |= 1 << n;
        Some(Reg::Gr(n))
    }
}

fn bits(mask: u128) -> impl Iterator<Item = u8> {
    (0..128u8).filter(move |&n| mask & (1 << n) != 0)
}

impl fmt::Debug for UsedRegs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UsedRegs{{")?;
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, r: Reg| -> fmt::Result {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{r}")
        };
        for n in bits(self.gr) {
            put(f, Reg::Gr(n))?;
        }
        for n in bits(self.fr) {
            put(f, Reg::Fr(n))?;
        }
        for n in bits(self.pr as u128) {
            put(f, Reg::Pr(n))?;
        }
        for n in bits(self.br as u128) {
            put(f, Reg::Br(n))?;
        }
        for a in [AppReg::Pfs, AppReg::Unat, AppReg::Lc] {
            if self.ar.contains(a.bit()) {
                put(f, Reg::Ar(a))?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preserved_classification() {
        assert!(Reg::Gr(4).is_preserved());
        assert!(!Reg::Gr(8).is_preserved());
        assert!(!Reg::Gr(40).is_preserved());
        assert!(Reg::Fr(17).is_preserved());
        assert!(!Reg::Fr(6).is_preserved());
        assert!(Reg::Pr(63).is_preserved());
        assert!(!Reg::Pr(6).is_preserved());
        assert!(Reg::Br(5).is_preserved());
        assert!(!Reg::B0.is_preserved());
    }

    #[test]
    fn test_scan_marks_used() {
        let used = UsedRegs::scan([Reg::Gr(5), Reg::Gr(35), Reg::Fr(16), Reg::Pr(20), Reg::B0, Reg::Out(1)]);
        assert!(used.contains(Reg::Gr(5)));
        assert!(!used.contains(Reg::Gr(4)));
        assert_eq!(used.preserved_gr().collect::<Vec<_>>(), vec![Reg::Gr(5)]);
        assert_eq!(used.preserved_fr().count(), 1);
        assert!(used.uses_preserved_pr());
        assert_eq!(used.preserved_br().count(), 0);
        assert_eq!(used.highest_stacked(), Some(35));
    }

    #[test]
    fn test_take_stacked_skips_used() {
        let mut used = UsedRegs::scan([Reg::Gr(32), Reg::Gr(33)]);
        assert_eq!(used.take_stacked(32, 127), Some(Reg::Gr(34)));
        assert!(used.contains(Reg::Gr(34)));
        assert_eq!(used.take_stacked(32, 34), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Reg::SP.to_string(), "sp");
        assert_eq!(Reg::Ar(AppReg::Pfs).to_string(), "ar.pfs");
        let v = Reg::Virtual {
            class: RegClass::Predicate,
            index: 3,
        };
        assert_eq!(v.to_string(), "%p3");
    }
}
