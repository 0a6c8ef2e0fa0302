//! Symbolic expressions and chains of recurrences.
//!
//! Expressions are hash-consed in an [`ExprPool`], so structural equality is
//! id equality. Chrec-free expressions are kept in a polynomial normal form:
//!
//! ```text
//!   c0 + k1*a*b + k2*c + ...     (Add chain, constant first)
//! ```
//!
//! where each atom is a `Variable` or an irreducible division, atoms inside a
//! monomial are sorted by id and monomials are sorted lexicographically. Two
//! polynomials that are algebraically equal therefore get the same id, and
//! term-level GCD and divisibility questions become simple coefficient scans.

use crate::ir::arena::{Arena, Id};
use crate::ir::cfg::LoopId;
use crate::ir::inst::OpndId;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;

pub type ExprId = Id<Expr>;

/// Binary operator of an [`Expr::Op`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Truncating integer division.
    Div,
}

/// A symbolic expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expr {
    Integer(i64),
    /// A loop parameter: an operand whose value is fixed during the loop.
    Variable(OpndId),
    Op { op: BinOp, lhs: ExprId, rhs: ExprId },
    /// `{left, +, right}_lp`: `left` on the first iteration of `lp`,
    /// incremented by `right` on every further iteration.
    PolyChrec { left: ExprId, right: ExprId, lp: LoopId },
}

/// Monomial: sorted multiset of atoms. Empty for the constant term.
type Monomial = SmallVec<[ExprId; 2]>;

/// A chrec-free expression as a map from monomial to coefficient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Poly {
    terms: BTreeMap<Monomial, i64>,
}

impl Poly {
    pub fn constant(c: i64) -> Self {
        let mut p = Poly::default();
        p.add_term(Monomial::new(), c);
        p
    }

    fn atom(a: ExprId) -> Self {
        let mut p = Poly::default();
        let mut m = Monomial::new();
        m.push(a);
        p.add_term(m, 1);
        p
    }

    fn add_term(&mut self, m: Monomial, c: i64) {
        if c == 0 {
            return;
        }
        let slot = self.terms.entry(m).or_insert(0);
        *slot = slot.wrapping_add(c);
        if *slot == 0 {
            self.terms.retain(|_, v| *v != 0);
        }
    }

    fn add(&self, other: &Poly, sign: i64) -> Poly {
        let mut out = self.clone();
        for (m, &c) in &other.terms {
            out.add_term(m.clone(), c.wrapping_mul(sign));
        }
        out
    }

    fn mul(&self, other: &Poly) -> Poly {
        let mut out = Poly::default();
        for (ma, &ca) in &self.terms {
            for (mb, &cb) in &other.terms {
                let mut m: Monomial = ma.iter().chain(mb.iter()).copied().collect();
                m.sort_unstable();
                out.add_term(m, ca.wrapping_mul(cb));
            }
        }
        out
    }

    /// The constant term.
    pub fn constant_term(&self) -> i64 {
        self.terms.get(&Monomial::new()).copied().unwrap_or(0)
    }

    /// The value if the polynomial has no symbolic terms.
    pub fn as_constant(&self) -> Option<i64> {
        match self.terms.len() {
            0 => Some(0),
            1 => self.terms.get(&Monomial::new()).copied(),
            _ => None,
        }
    }

    /// GCD of all coefficients; 0 for the zero polynomial.
    pub fn content(&self) -> i64 {
        self.terms.values().fold(0, |g, &c| gcd(g, c))
    }

    /// GCD of the coefficients of the symbolic terms only.
    pub fn symbolic_content(&self) -> i64 {
        self.terms
            .iter()
            .filter(|(m, _)| !m.is_empty())
            .fold(0, |g, (_, &c)| gcd(g, c))
    }
}

/// Non-negative greatest common divisor; `gcd(0, 0) == 0`.
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a as i64
}

// =============================================================================
// Expression Pool
// =============================================================================

/// Arena of hash-consed expressions with the folding constructors.
#[derive(Debug, Clone)]
pub struct ExprPool {
    exprs: Arena<Expr>,
    interned: FxHashMap<Expr, ExprId>,
    /// Parent of every loop, used to order chrecs of nested loops.
    loop_parents: Vec<Option<LoopId>>,
}

impl ExprPool {
    pub fn new(loop_parents: Vec<Option<LoopId>>) -> Self {
        ExprPool {
            exprs: Arena::new(),
            interned: FxHashMap::default(),
            loop_parents,
        }
    }

    fn intern(&mut self, e: Expr) -> ExprId {
        if let Some(&id) = self.interned.get(&e) {
            return id;
        }
        let id = self.exprs.alloc(e);
        self.interned.insert(e, id);
        id
    }

    #[inline]
    pub fn get(&self, id: ExprId) -> Expr {
        self.exprs[id]
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Whether `outer` strictly encloses `inner`.
    pub fn encloses(&self, outer: LoopId, inner: LoopId) -> bool {
        let mut cur = self.loop_parents.get(inner.as_usize()).copied().flatten();
        while let Some(l) = cur {
            if l == outer {
                return true;
            }
            cur = self.loop_parents.get(l.as_usize()).copied().flatten();
        }
        false
    }

    // -------------------------------------------------------------------------
    // Leaves
    // -------------------------------------------------------------------------

    pub fn integer(&mut self, v: i64) -> ExprId {
        self.intern(Expr::Integer(v))
    }

    pub fn variable(&mut self, v: OpndId) -> ExprId {
        self.intern(Expr::Variable(v))
    }

    pub fn as_integer(&self, e: ExprId) -> Option<i64> {
        match self.get(e) {
            Expr::Integer(v) => Some(v),
            _ => None,
        }
    }

    /// `{left, +, right}_lp`, collapsing a zero step.
    pub fn chrec(&mut self, left: ExprId, right: ExprId, lp: LoopId) -> ExprId {
        if self.as_integer(right) == Some(0) {
            return left;
        }
        self.intern(Expr::PolyChrec { left, right, lp })
    }

    fn raw_op(&mut self, op: BinOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.intern(Expr::Op { op, lhs, rhs })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Whether `e` contains a chrec over any loop.
    pub fn has_chrec(&self, e: ExprId) -> bool {
        match self.get(e) {
            Expr::Integer(_) | Expr::Variable(_) => false,
            Expr::Op { lhs, rhs, .. } => self.has_chrec(lhs) || self.has_chrec(rhs),
            Expr::PolyChrec { .. } => true,
        }
    }

    /// Whether every chrec in `e` steps by a chrec-free amount.
    pub fn is_first_degree(&self, e: ExprId) -> bool {
        match self.get(e) {
            Expr::Integer(_) | Expr::Variable(_) => true,
            Expr::Op { lhs, rhs, .. } => self.is_first_degree(lhs) && self.is_first_degree(rhs),
            Expr::PolyChrec { left, right, .. } => !self.has_chrec(right) && self.is_first_degree(left),
        }
    }

    /// Whether `e` varies in `lp`: it has a chrec over `lp` or over a loop
    /// nested inside `lp`.
    pub fn varies_in(&self, e: ExprId, lp: LoopId) -> bool {
        match self.get(e) {
            Expr::Integer(_) | Expr::Variable(_) => false,
            Expr::Op { lhs, rhs, .. } => self.varies_in(lhs, lp) || self.varies_in(rhs, lp),
            Expr::PolyChrec { left, right, lp: l } => {
                l == lp || self.encloses(lp, l) || self.varies_in(left, lp) || self.varies_in(right, lp)
            }
        }
    }

    /// Whether `e` mentions the variable `v`.
    pub fn mentions(&self, e: ExprId, v: OpndId) -> bool {
        match self.get(e) {
            Expr::Integer(_) => false,
            Expr::Variable(x) => x == v,
            Expr::Op { lhs, rhs, .. } => self.mentions(lhs, v) || self.mentions(rhs, v),
            Expr::PolyChrec { left, right, .. } => self.mentions(left, v) || self.mentions(right, v),
        }
    }

    /// Affine chrec `{l, +, r}_lp` with a chrec-free step.
    pub fn as_affine(&self, e: ExprId) -> Option<(ExprId, ExprId, LoopId)> {
        match self.get(e) {
            Expr::PolyChrec { left, right, lp } if !self.has_chrec(right) => Some((left, right, lp)),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Polynomial normal form
    // -------------------------------------------------------------------------

    /// Read a chrec-free expression as a polynomial.
    pub fn to_poly(&self, e: ExprId) -> Option<Poly> {
        match self.get(e) {
            Expr::Integer(v) => Some(Poly::constant(v)),
            Expr::Variable(_) => Some(Poly::atom(e)),
            Expr::Op { op, lhs, rhs } => match op {
                BinOp::Add => Some(self.to_poly(lhs)?.add(&self.to_poly(rhs)?, 1)),
                BinOp::Sub => Some(self.to_poly(lhs)?.add(&self.to_poly(rhs)?, -1)),
                BinOp::Mul => Some(self.to_poly(lhs)?.mul(&self.to_poly(rhs)?)),
                BinOp::Div if self.has_chrec(e) => None,
                BinOp::Div => Some(Poly::atom(e)),
            },
            Expr::PolyChrec { .. } => None,
        }
    }

    /// Build the canonical expression of a polynomial.
    pub fn from_poly(&mut self, p: &Poly) -> ExprId {
        let mut sum: Option<ExprId> = None;
        for (m, &c) in &p.terms {
            let term = if m.is_empty() {
                self.integer(c)
            } else {
                let mut prod = m[0];
                for &a in &m[1..] {
                    prod = self.raw_op(BinOp::Mul, prod, a);
                }
                if c == 1 {
                    prod
                } else {
                    let k = self.integer(c);
                    self.raw_op(BinOp::Mul, k, prod)
                }
            };
            sum = Some(match sum {
                None => term,
                Some(s) => self.raw_op(BinOp::Add, s, term),
            });
        }
        match sum {
            Some(s) => s,
            None => self.integer(0),
        }
    }

    // -------------------------------------------------------------------------
    // Folding constructors
    // -------------------------------------------------------------------------

    pub fn add(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.get(a), self.get(b)) {
            (Expr::PolyChrec { left: la, right: ra, lp: pa }, Expr::PolyChrec { left: lb, right: rb, lp: pb }) => {
                if pa == pb {
                    let l = self.add(la, lb);
                    let r = self.add(ra, rb);
                    self.chrec(l, r, pa)
                } else if self.encloses(pa, pb) {
                    // `a` is invariant in the inner loop of `b`.
                    let l = self.add(a, lb);
                    self.chrec(l, rb, pb)
                } else if self.encloses(pb, pa) {
                    let l = self.add(la, b);
                    self.chrec(l, ra, pa)
                } else {
                    self.raw_op(BinOp::Add, a, b)
                }
            }
            (Expr::PolyChrec { left, right, lp }, _) => {
                let l = self.add(left, b);
                self.chrec(l, right, lp)
            }
            (_, Expr::PolyChrec { left, right, lp }) => {
                let l = self.add(a, left);
                self.chrec(l, right, lp)
            }
            _ => self.fold_poly(a, b, |x, y| Some(x.add(y, 1)), BinOp::Add),
        }
    }

    pub fn neg(&mut self, a: ExprId) -> ExprId {
        let m1 = self.integer(-1);
        self.mul(m1, a)
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> ExprId {
        let nb = self.neg(b);
        self.add(a, nb)
    }

    pub fn mul(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.get(a), self.get(b)) {
            (Expr::PolyChrec { left: la, right: ra, lp: pa }, Expr::PolyChrec { left: lb, right: rb, lp: pb }) => {
                if pa == pb {
                    // {x0,+,dx} * {y0,+,dy} = {x0*y0, +, X*dy + Y*dx + dx*dy}
                    let l = self.mul(la, lb);
                    let t1 = self.mul(a, rb);
                    let t2 = self.mul(b, ra);
                    let t3 = self.mul(ra, rb);
                    let s = self.add(t1, t2);
                    let r = self.add(s, t3);
                    self.chrec(l, r, pa)
                } else if self.encloses(pa, pb) {
                    self.scale_chrec(b, a)
                } else if self.encloses(pb, pa) {
                    self.scale_chrec(a, b)
                } else {
                    self.raw_op(BinOp::Mul, a, b)
                }
            }
            (Expr::PolyChrec { .. }, _) => self.scale_chrec(a, b),
            (_, Expr::PolyChrec { .. }) => self.scale_chrec(b, a),
            _ => self.fold_poly(a, b, |x, y| Some(x.mul(y)), BinOp::Mul),
        }
    }

    /// `{l, +, r} * k` for `k` invariant in the chrec's loop.
    fn scale_chrec(&mut self, chrec: ExprId, k: ExprId) -> ExprId {
        match self.get(chrec) {
            Expr::PolyChrec { left, right, lp } => {
                let l = self.mul(left, k);
                let r = self.mul(right, k);
                self.chrec(l, r, lp)
            }
            _ => self.mul(chrec, k),
        }
    }

    /// Truncating division. Folds only when it is exact.
    pub fn div(&mut self, a: ExprId, b: ExprId) -> ExprId {
        let Some(d) = self.as_integer(b) else {
            return self.raw_op(BinOp::Div, a, b);
        };
        if d == 1 {
            return a;
        }
        if d == 0 {
            return self.raw_op(BinOp::Div, a, b);
        }
        match self.get(a) {
            Expr::Integer(v) => self.integer(v.wrapping_div(d)),
            Expr::PolyChrec { left, right, lp } => {
                if self.divisible(left, d) && self.divisible(right, d) {
                    let l = self.div(left, b);
                    let r = self.div(right, b);
                    self.chrec(l, r, lp)
                } else {
                    self.raw_op(BinOp::Div, a, b)
                }
            }
            _ => match self.to_poly(a) {
                Some(p) if p.content() % d == 0 => {
                    let mut q = Poly::default();
                    for (m, &c) in &p.terms {
                        q.add_term(m.clone(), c / d);
                    }
                    self.from_poly(&q)
                }
                _ => self.raw_op(BinOp::Div, a, b),
            },
        }
    }

    /// Whether every term of `e` is a multiple of `d`.
    pub fn divisible(&self, e: ExprId, d: i64) -> bool {
        if d == 0 {
            return false;
        }
        match self.get(e) {
            Expr::PolyChrec { left, right, .. } => self.divisible(left, d) && self.divisible(right, d),
            _ => self.to_poly(e).is_some_and(|p| p.content() % d == 0),
        }
    }

    fn fold_poly(
        &mut self,
        a: ExprId,
        b: ExprId,
        f: impl Fn(&Poly, &Poly) -> Option<Poly>,
        op: BinOp,
    ) -> ExprId {
        let folded = match (self.to_poly(a), self.to_poly(b)) {
            (Some(x), Some(y)) => f(&x, &y),
            _ => None,
        };
        match folded {
            Some(p) => self.from_poly(&p),
            None => self.raw_op(op, a, b),
        }
    }

    /// Fold an operator by dispatching to the constructors.
    pub fn op(&mut self, op: BinOp, a: ExprId, b: ExprId) -> ExprId {
        match op {
            BinOp::Add => self.add(a, b),
            BinOp::Sub => self.sub(a, b),
            BinOp::Mul => self.mul(a, b),
            BinOp::Div => self.div(a, b),
        }
    }

    // -------------------------------------------------------------------------
    // Affine decomposition and the GCD test
    // -------------------------------------------------------------------------

    /// Split `e` into a chrec-free base and one step per loop, innermost
    /// loop first. `None` if some step is itself a chrec.
    pub fn affine_terms(&self, e: ExprId) -> Option<(ExprId, SmallVec<[(LoopId, ExprId); 2]>)> {
        let mut steps = SmallVec::new();
        let mut cur = e;
        loop {
            match self.get(cur) {
                Expr::PolyChrec { left, right, lp } => {
                    if self.has_chrec(right) {
                        return None;
                    }
                    steps.push((lp, right));
                    cur = left;
                }
                _ if self.has_chrec(cur) => return None,
                _ => return Some((cur, steps)),
            }
        }
    }

    /// GCD test on two affine access functions.
    ///
    /// Returns `false` only when `f(i) == g(j)` provably has no integer
    /// solution; `true` means a dependence may exist.
    pub fn gcd_may_depend(&self, f: ExprId, g: ExprId) -> bool {
        let (Some((fb, fs)), Some((gb, gs))) = (self.affine_terms(f), self.affine_terms(g)) else {
            return true;
        };
        let mut g_all = 0;
        for &(_, step) in fs.iter().chain(gs.iter()) {
            match self.to_poly(step) {
                Some(p) => g_all = gcd(g_all, p.content()),
                None => return true,
            }
        }
        let (Some(pf), Some(pg)) = (self.to_poly(fb), self.to_poly(gb)) else {
            return true;
        };
        let diff = pg.add(&pf, -1);
        if g_all == 0 {
            // No induction variable: dependence iff the bases can be equal.
            return diff.as_constant().map_or(true, |c| c == 0);
        }
        // diff = c + (symbolic terms); if the symbolic terms are multiples
        // of g_all, diff is congruent to c.
        if diff.symbolic_content() % g_all != 0 {
            return true;
        }
        diff.constant_term() % g_all == 0
    }
}

// =============================================================================
// Display
// =============================================================================

/// Borrowed view for printing an expression.
pub struct ExprDisplay<'a> {
    pool: &'a ExprPool,
    id: ExprId,
}

impl ExprPool {
    pub fn display(&self, id: ExprId) -> ExprDisplay<'_> {
        ExprDisplay { pool: self, id }
    }
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sub = |id| ExprDisplay { pool: self.pool, id };
        match self.pool.get(self.id) {
            Expr::Integer(v) => write!(f, "{v}"),
            Expr::Variable(v) => write!(f, "t{}", v.index()),
            Expr::Op { op, lhs, rhs } => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                };
                write!(f, "({} {} {})", sub(lhs), sym, sub(rhs))
            }
            Expr::PolyChrec { left, right, lp } => {
                write!(f, "{{{}, +, {}}}_L{}", sub(left), sub(right), lp.index())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ExprPool {
        // Loop 1 nested in loop 0.
        ExprPool::new(vec![None, Some(LoopId::new(0))])
    }

    #[test]
    fn test_identities() {
        let mut p = pool();
        let x = p.variable(OpndId::new(7));
        let zero = p.integer(0);
        let one = p.integer(1);
        assert_eq!(p.add(x, zero), x);
        assert_eq!(p.mul(x, one), x);
        assert_eq!(p.mul(x, zero), zero);
        assert_eq!(p.div(x, one), x);
    }

    #[test]
    fn test_normal_form_is_canonical() {
        let mut p = pool();
        let x = p.variable(OpndId::new(1));
        let y = p.variable(OpndId::new(2));
        let three = p.integer(3);
        // (x + 3) + y == y + (3 + x)
        let a0 = p.add(x, three);
        let a = p.add(a0, y);
        let b0 = p.add(three, x);
        let b = p.add(y, b0);
        assert_eq!(a, b);
        // 2*(x+y) - x == x + 2*y
        let two = p.integer(2);
        let s = p.add(x, y);
        let d0 = p.mul(two, s);
        let d = p.sub(d0, x);
        let y2 = p.mul(two, y);
        let e = p.add(x, y2);
        assert_eq!(d, e);
    }

    #[test]
    fn test_chrec_arithmetic_same_loop() {
        let mut p = pool();
        let l = LoopId::new(0);
        let (c0, c1, c2, c3, c5) = (p.integer(0), p.integer(1), p.integer(2), p.integer(3), p.integer(5));
        let a = p.chrec(c0, c1, l);
        let b = p.chrec(c2, c3, l);
        let sum = p.add(a, b);
        let expect = {
            let c4 = p.integer(4);
            p.chrec(c2, c4, l)
        };
        assert_eq!(sum, expect);
        let scaled = p.mul(b, c5);
        let c10 = p.integer(10);
        let c15 = p.integer(15);
        assert_eq!(scaled, p.chrec(c10, c15, l));
    }

    #[test]
    fn test_chrec_nested_loops() {
        let mut p = pool();
        let (outer, inner) = (LoopId::new(0), LoopId::new(1));
        let (c0, c1, c100) = (p.integer(0), p.integer(1), p.integer(100));
        let i = p.chrec(c0, c1, outer);
        let j = p.chrec(c0, c1, inner);
        // 100*i + j = {{0, +, 100}_outer, +, 1}_inner
        let i100 = p.mul(i, c100);
        let sum = p.add(i100, j);
        let (base, steps) = p.affine_terms(sum).unwrap();
        assert_eq!(base, c0);
        assert_eq!(steps.as_slice(), &[(inner, c1), (outer, c100)]);
        assert!(p.varies_in(sum, outer));
        assert!(p.varies_in(sum, inner));
        assert!(!p.varies_in(i, inner));
    }

    #[test]
    fn test_gcd_test() {
        let mut p = pool();
        let l = LoopId::new(0);
        let (c2, c3, c4, c6) = (p.integer(2), p.integer(3), p.integer(4), p.integer(6));
        let f = p.chrec(c2, c4, l);
        let g = p.chrec(c3, c4, l);
        let h = p.chrec(c6, c4, l);
        assert!(!p.gcd_may_depend(f, g));
        assert!(p.gcd_may_depend(f, h));
    }

    #[test]
    fn test_gcd_symbolic_base() {
        let mut p = pool();
        let l = LoopId::new(0);
        let n = p.variable(OpndId::new(3));
        let (c1, c4) = (p.integer(1), p.integer(4));
        // 4n + {0,+,4} vs 4n + {1,+,4}: never equal.
        let n4 = p.mul(c4, n);
        let base1 = p.add(n4, c1);
        let z = p.integer(0);
        let f0 = p.chrec(z, c4, l);
        let f = p.add(n4, f0);
        let g0 = p.chrec(z, c4, l);
        let g = p.add(base1, g0);
        assert!(!p.gcd_may_depend(f, g));
        // n + {0,+,4} vs {1,+,4}: n may be 1.
        let h = p.add(n, f0);
        let k = p.chrec(c1, c4, l);
        assert!(p.gcd_may_depend(h, k));
    }

    #[test]
    fn test_inexact_division_stays_symbolic() {
        let mut p = pool();
        let x = p.variable(OpndId::new(1));
        let (c2, c4, c3) = (p.integer(2), p.integer(4), p.integer(3));
        let x4 = p.mul(c4, x);
        assert_eq!(p.div(x4, c2), p.mul(c2, x));
        let d = p.div(x, c3);
        assert!(matches!(p.get(d), Expr::Op { op: BinOp::Div, .. }));
    }
}
