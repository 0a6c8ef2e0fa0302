//! Tau Simplification.
//!
//! Replaces `hastype`, `hasexacttype` and `isnonnull` guards with a proof
//! that already exists. The proof comes from the guarded value's definition:
//!
//! | Source                          | Proof                                      |
//! |---------------------------------|--------------------------------------------|
//! | `newobj`, `newarray`, `ldref`   | tau-safe                                   |
//! | `ldconst`, calls                | tau-safe                                   |
//! | `ldnull`                        | tau-safe for type guards                   |
//! | `defarg`, `ldind`, phi, select  | tau-safe if the declared type is a subtype |
//! | `staticcast`                    | the cast's own proof operand               |
//! | `astype`                        | tau-safe if the cast type is a subtype     |
//! | `copy`                          | proof of the copied value                  |
//! | `compress` / `uncompress`       | proof for the other form of the type       |
//! | `ldvar`                         | a shadow variable carrying the proof       |
//!
//! A shadow variable is a tau-typed variable stored and merged exactly where
//! the original is: every `stvar v = x` gains `stvar v' = proof(x)` and every
//! `v = phi(v1, v2)` gains `v' = phi(v1', v2')`. Creating shadows for phi
//! inputs may create more shadows, so finding proofs and threading shadows
//! alternate until no new shadow appears. Guards with a proof are then
//! removed and their uses rewritten.
//!
//! The tau-safe sentinel is created at most once per method, after the
//! entry's argument definitions, so it dominates every use.

use crate::ir::inst::{InstId, OpndId, OpndKind, Payload};
use crate::ir::method::{BlockId, MethodIr};
use crate::ir::opcode::{Modifier, Opcode};
use crate::ir::types::TypeId;
use crate::opt::OptimizationPass;
use kiln_core::{ice, CompileResult, Location};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, trace};

const PASS: &str = "simplify-taus";

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from tau simplification.
#[derive(Debug, Clone, Default)]
pub struct TauStats {
    /// Guards examined.
    pub guards_seen: usize,
    /// Guards replaced by the tau-safe sentinel.
    pub reduced_to_safe: usize,
    /// Guards replaced by another proof operand.
    pub reduced_to_proof: usize,
    /// Shadow variable versions created.
    pub shadows_created: usize,
    /// Guard instructions removed.
    pub guards_removed: usize,
    /// Rounds of the find/thread fixpoint.
    pub rounds: usize,
}

impl TauStats {
    pub fn merge(&mut self, other: &TauStats) {
        self.guards_seen += other.guards_seen;
        self.reduced_to_safe += other.reduced_to_safe;
        self.reduced_to_proof += other.reduced_to_proof;
        self.shadows_created += other.shadows_created;
        self.guards_removed += other.guards_removed;
        self.rounds += other.rounds;
    }

    /// Fraction of guards removed.
    pub fn removal_rate(&self) -> f64 {
        if self.guards_seen == 0 {
            0.0
        } else {
            self.guards_removed as f64 / self.guards_seen as f64
        }
    }
}

// =============================================================================
// Guards
// =============================================================================

/// The fact a guard asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Guard {
    HasType(TypeId),
    HasExactType(TypeId),
    NonNull,
}

impl Guard {
    fn of(ir: &MethodIr, inst: InstId) -> Option<Guard> {
        let i = ir.inst(inst);
        match (i.opcode, &i.payload) {
            (Opcode::TauHasType, Payload::Type(t)) => Some(Guard::HasType(*t)),
            (Opcode::TauHasExactType, Payload::Type(t)) => Some(Guard::HasExactType(*t)),
            (Opcode::TauIsNonNull, _) => Some(Guard::NonNull),
            _ => None,
        }
    }

    fn opcode(self) -> Opcode {
        match self {
            Guard::HasType(_) => Opcode::TauHasType,
            Guard::HasExactType(_) => Opcode::TauHasExactType,
            Guard::NonNull => Opcode::TauIsNonNull,
        }
    }

    fn payload(self) -> Payload {
        match self {
            Guard::HasType(t) | Guard::HasExactType(t) => Payload::Type(t),
            Guard::NonNull => Payload::None,
        }
    }

    /// The same question about the other representation of the reference.
    fn retyped(self, f: impl FnOnce(TypeId) -> TypeId) -> Guard {
        match self {
            Guard::HasType(t) => Guard::HasType(f(t)),
            Guard::HasExactType(t) => Guard::HasExactType(f(t)),
            Guard::NonNull => Guard::NonNull,
        }
    }
}

// =============================================================================
// Pass state
// =============================================================================

/// Caches of one run. Nothing survives between runs.
struct Simplifier<'a> {
    ir: &'a mut MethodIr,
    stats: TauStats,
    tau_safe: Option<OpndId>,
    /// Proof known for a value and a guard; `None` when there is none.
    proofs: FxHashMap<(OpndId, Guard), Option<OpndId>>,
    /// Guard destination to the operand replacing it.
    copies: FxHashMap<OpndId, OpndId>,
    /// Shadow base variable per original base variable.
    shadow_vars: FxHashMap<(OpndId, Guard), OpndId>,
    /// Shadow version per original SSA version.
    shadow_versions: FxHashMap<(OpndId, Guard), OpndId>,
    /// Versions whose definition already has its shadow.
    threaded: FxHashSet<(OpndId, Guard)>,
    /// Guards already examined.
    visited: FxHashSet<InstId>,
}

impl<'a> Simplifier<'a> {
    fn new(ir: &'a mut MethodIr) -> Self {
        Simplifier {
            ir,
            stats: TauStats::default(),
            tau_safe: None,
            proofs: FxHashMap::default(),
            copies: FxHashMap::default(),
            shadow_vars: FxHashMap::default(),
            shadow_versions: FxHashMap::default(),
            threaded: FxHashSet::default(),
            visited: FxHashSet::default(),
        }
    }

    fn tau_safe(&mut self) -> OpndId {
        match self.tau_safe {
            Some(t) => t,
            None => {
                let t = self.ir.find_or_create_tau_safe();
                self.tau_safe = Some(t);
                t
            }
        }
    }

    /// Linked instructions in reverse postorder of their blocks.
    fn insts_in_rpo(&self) -> Vec<InstId> {
        let rpo: Vec<BlockId> = self.ir.rpo();
        rpo.iter().flat_map(|&b| self.ir.block(b).insts.iter().copied()).collect()
    }

    // -------------------------------------------------------------------------
    // Walker 1: find reducible guards
    // -------------------------------------------------------------------------

    fn find_reducible(&mut self) -> CompileResult<()> {
        for inst in self.insts_in_rpo() {
            let Some(guard) = Guard::of(self.ir, inst) else { continue };
            let Some(dst) = self.ir.inst(inst).dst else { continue };
            if !self.visited.insert(inst) {
                continue;
            }
            self.stats.guards_seen += 1;
            let src = self.ir.inst(inst).src(0);
            if let Some(proof) = self.proof(src, guard)? {
                if Some(proof) == self.tau_safe {
                    self.stats.reduced_to_safe += 1;
                } else {
                    self.stats.reduced_to_proof += 1;
                }
                self.copies.insert(dst, proof);
            }
        }
        Ok(())
    }

    /// Proof of `guard` for `v`, memoized.
    fn proof(&mut self, v: OpndId, guard: Guard) -> CompileResult<Option<OpndId>> {
        if let Some(&p) = self.proofs.get(&(v, guard)) {
            return Ok(p);
        }
        let p = self.compute_proof(v, guard)?;
        self.proofs.insert((v, guard), p);
        Ok(p)
    }

    fn compute_proof(&mut self, v: OpndId, guard: Guard) -> CompileResult<Option<OpndId>> {
        let Some(def) = self.ir.opnd(v).def else {
            return Ok(None);
        };
        let (opcode, ty, payload) = {
            let i = self.ir.inst(def);
            (i.opcode, i.ty, i.payload.clone())
        };
        let declared_subtype = |ir: &MethodIr| match guard {
            Guard::HasType(t) => ir.types.is_subtype(ty, t),
            _ => false,
        };

        Ok(match opcode {
            Opcode::NewObj
            | Opcode::NewArray
            | Opcode::LdRef
            | Opcode::LdConstant
            | Opcode::DirectCall
            | Opcode::IndirectCall
            | Opcode::VmHelperCall => Some(self.tau_safe()),
            Opcode::LdNull => match guard {
                Guard::NonNull => None,
                _ => Some(self.tau_safe()),
            },
            Opcode::DefArg | Opcode::TauLdInd | Opcode::Phi | Opcode::Select => {
                if declared_subtype(self.ir) {
                    Some(self.tau_safe())
                } else {
                    None
                }
            }
            Opcode::Copy => {
                let src = self.ir.inst(def).src(0);
                self.proof(src, guard)?
            }
            Opcode::TauStaticCast => {
                let Payload::Type(cast) = payload else {
                    ice!(PASS, Location::Inst(def.index()), "static cast without target type");
                };
                let (src, cast_proof) = {
                    let i = self.ir.inst(def);
                    (i.src(0), i.src(1))
                };
                match guard {
                    Guard::HasType(t) if self.ir.types.is_subtype(cast, t) => Some(cast_proof),
                    Guard::HasExactType(t) if cast == t => Some(cast_proof),
                    Guard::NonNull => self.proof(src, guard)?,
                    Guard::HasType(t) | Guard::HasExactType(t) => ice!(
                        PASS,
                        Location::Inst(def.index()),
                        "static cast to {} guarded as {}",
                        self.ir.types.name(cast),
                        self.ir.types.name(t)
                    ),
                }
            }
            Opcode::TauAsType => match (guard, payload) {
                (Guard::HasType(t), Payload::Type(cast)) if self.ir.types.is_subtype(cast, t) => Some(self.tau_safe()),
                _ => None,
            },
            Opcode::CompressRef => {
                let src = self.ir.inst(def).src(0);
                let types = &mut self.ir.types;
                let g = guard.retyped(|t| types.uncompressed(t));
                self.proof(src, g)?
            }
            Opcode::UncompressRef => {
                let src = self.ir.inst(def).src(0);
                let types = &mut self.ir.types;
                let g = guard.retyped(|t| types.compressed(t));
                self.proof(src, g)?
            }
            Opcode::LdVar => self.shadow_load(def, guard)?,
            other => ice!(
                PASS,
                Location::Inst(def.index()),
                "{} cannot produce a guarded reference",
                other.name()
            ),
        })
    }

    // -------------------------------------------------------------------------
    // Shadow variables
    // -------------------------------------------------------------------------

    /// Proof for the result of `ldvar v`: a load of `v`'s shadow placed
    /// right after the original load.
    fn shadow_load(&mut self, load: InstId, guard: Guard) -> CompileResult<Option<OpndId>> {
        let version = self.ir.inst(load).src(0);
        if !matches!(self.ir.opnd(version).kind, OpndKind::SsaVar { .. }) {
            // Unversioned variables have no single definition to shadow.
            return Ok(None);
        }
        let shadow = self.shadow_version(version, guard);
        let tau = self.ir.types.tau();
        let dst = self.ir.new_temp(tau);
        let ld = self
            .ir
            .create_inst(Opcode::LdVar, Modifier::NONE, tau, Some(dst), &[shadow], Payload::None);
        self.ir.insert_after(load, ld);
        Ok(Some(dst))
    }

    fn shadow_version(&mut self, version: OpndId, guard: Guard) -> OpndId {
        if let Some(&s) = self.shadow_versions.get(&(version, guard)) {
            return s;
        }
        let base = self.ir.opnd(version).base_var(version);
        let tau = self.ir.types.tau();
        let var = match self.shadow_vars.get(&(base, guard)) {
            Some(&v) => v,
            None => {
                let v = self.ir.new_var(tau);
                self.shadow_vars.insert((base, guard), v);
                v
            }
        };
        let s = self.ir.new_ssa_var(var);
        self.shadow_versions.insert((version, guard), s);
        self.stats.shadows_created += 1;
        s
    }

    // -------------------------------------------------------------------------
    // Walker 2: thread shadows through stores and phis
    // -------------------------------------------------------------------------

    /// Returns whether any definition gained a shadow.
    fn reduce_var_taus(&mut self) -> CompileResult<bool> {
        let mut changed = false;
        for inst in self.insts_in_rpo() {
            let (opcode, dst) = {
                let i = self.ir.inst(inst);
                (i.opcode, i.dst)
            };
            if !matches!(opcode, Opcode::StVar | Opcode::Phi) {
                continue;
            }
            let Some(dst) = dst else { continue };
            let pending: SmallVec<[(Guard, OpndId); 2]> = self
                .shadow_versions
                .iter()
                .filter(|((v, g), _)| *v == dst && !self.threaded.contains(&(*v, *g)))
                .map(|((_, g), s)| (*g, *s))
                .collect();
            for (guard, shadow) in pending {
                self.threaded.insert((dst, guard));
                match opcode {
                    Opcode::StVar => self.shadow_store(inst, guard, shadow)?,
                    _ => self.shadow_phi(inst, guard, shadow),
                }
                changed = true;
            }
        }
        Ok(changed)
    }

    /// `stvar v = x` gains `stvar v' = proof(x)`. Without a known proof, a
    /// fresh guard on `x` stands in; the next round reduces it.
    fn shadow_store(&mut self, store: InstId, guard: Guard, shadow: OpndId) -> CompileResult<()> {
        let value = self.ir.inst(store).src(0);
        let tau = self.ir.types.tau();
        let proof = match self.proofs.get(&(value, guard)).copied().flatten() {
            Some(p) => p,
            None => {
                let g = self.ir.new_temp(tau);
                let check = self
                    .ir
                    .create_inst(guard.opcode(), Modifier::NONE, tau, Some(g), &[value], guard.payload());
                self.ir.insert_before(store, check);
                g
            }
        };
        let st = self
            .ir
            .create_inst(Opcode::StVar, Modifier::NONE, tau, Some(shadow), &[proof], Payload::None);
        self.ir.insert_after(store, st);
        Ok(())
    }

    /// `v = phi(v1, .., vn)` gains `v' = phi(v1', .., vn')`.
    fn shadow_phi(&mut self, phi: InstId, guard: Guard, shadow: OpndId) {
        let srcs = self.ir.inst(phi).srcs.clone();
        let shadow_srcs: SmallVec<[OpndId; 4]> = srcs.iter().map(|&s| self.shadow_version(s, guard)).collect();
        let tau = self.ir.types.tau();
        let p = self
            .ir
            .create_inst(Opcode::Phi, Modifier::NONE, tau, Some(shadow), &shadow_srcs, Payload::None);
        self.ir.insert_after(phi, p);
    }

    // -------------------------------------------------------------------------
    // Walker 3: replace
    // -------------------------------------------------------------------------

    /// Final replacement of `v`, following chains of replaced guards.
    fn resolve(&self, mut v: OpndId) -> OpndId {
        let mut steps = 0;
        while let Some(&next) = self.copies.get(&v) {
            if next == v || steps > self.copies.len() {
                break;
            }
            v = next;
            steps += 1;
        }
        v
    }

    fn replace(&mut self) {
        for inst in self.insts_in_rpo() {
            if let Some(d) = self.ir.inst(inst).dst {
                if self.copies.contains_key(&d) {
                    self.ir.unlink(inst);
                    self.stats.guards_removed += 1;
                    continue;
                }
            }
            let srcs = self.ir.inst(inst).srcs.clone();
            for (k, s) in srcs.into_iter().enumerate() {
                if self.copies.contains_key(&s) {
                    let r = self.resolve(s);
                    self.ir.inst_mut(inst).srcs[k] = r;
                }
            }
        }
    }

    fn run(&mut self) -> CompileResult<()> {
        loop {
            self.stats.rounds += 1;
            self.find_reducible()?;
            if !self.reduce_var_taus()? {
                break;
            }
        }
        self.replace();
        Ok(())
    }
}

// =============================================================================
// Main Pass
// =============================================================================

/// Tau simplification pass.
#[derive(Debug, Default)]
pub struct SimplifyTaus {
    stats: TauStats,
}

impl SimplifyTaus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &TauStats {
        &self.stats
    }
}

impl OptimizationPass for SimplifyTaus {
    fn name(&self) -> &'static str {
        PASS
    }

    fn run(&mut self, ir: &mut MethodIr) -> CompileResult<bool> {
        let name = ir.name.clone();
        let mut s = Simplifier::new(ir);
        s.run()?;
        let stats = s.stats;
        debug!(
            method = %name,
            seen = stats.guards_seen,
            removed = stats.guards_removed,
            shadows = stats.shadows_created,
            "taus simplified"
        );
        trace!(rounds = stats.rounds, "tau fixpoint");
        let changed = stats.guards_removed > 0 || stats.shadows_created > 0;
        self.stats.merge(&stats);
        Ok(changed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::interp::{Interpreter, Value};
    use crate::ir::opcode::CmpMod;
    use crate::ir::types::TypeManager;

    struct Classes {
        animal: TypeId,
        dog: TypeId,
        legs: crate::ir::types::FieldId,
    }

    fn classes(tm: &mut TypeManager) -> Classes {
        let root = tm.root_class();
        let animal_c = tm.define_class("Animal", Some(root), false);
        let dog_c = tm.define_class("Dog", Some(animal_c), false);
        let i32_ = tm.int32();
        let legs = tm.define_field(animal_c, "legs", i32_, 8, false);
        Classes {
            animal: tm.object_type(animal_c),
            dog: tm.object_type(dog_c),
            legs,
        }
    }

    fn guards(ir: &MethodIr) -> usize {
        ir.linked_insts().filter(|&i| ir.inst(i).opcode.is_type_guard()).count()
    }

    #[test]
    fn test_allocation_guard_becomes_tau_safe() {
        let mut tm = TypeManager::new();
        let c = classes(&mut tm);
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("alloc", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let obj = b.new_obj(c.dog);
        let t = b.tau_has_type(obj, c.animal);
        let nn = b.tau_is_non_null(obj);
        let addr = b.ld_field_addr(obj, c.legs);
        let v = b.ld_ind(i32_, addr, nn, t);
        b.ret(Some(v));

        let mut pass = SimplifyTaus::new();
        assert!(pass.run(&mut ir).unwrap());
        assert_eq!(guards(&ir), 0);
        assert_eq!(pass.stats().reduced_to_safe, 2);
        let safe = ir.find_or_create_tau_safe();
        let load = ir.linked_insts().find(|&i| ir.inst(i).opcode == Opcode::TauLdInd).unwrap();
        assert_eq!(&ir.inst(load).srcs[1..], &[safe, safe]);
        ir.verify().unwrap();
    }

    #[test]
    fn test_static_cast_guard_uses_cast_proof() {
        let mut tm = TypeManager::new();
        let c = classes(&mut tm);
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("cast", tm, i32_);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(c.animal, 0);
        let nn = b.tau_check_null(a);
        let proof = b.tau_check_cast(a, nn, c.dog);
        let d = b.tau_static_cast(a, proof, c.dog);
        let t = b.tau_has_type(d, c.animal);
        let addr = b.ld_field_addr(d, c.legs);
        let v = b.ld_ind(i32_, addr, nn, t);
        b.ret(Some(v));

        let mut pass = SimplifyTaus::new();
        pass.run(&mut ir).unwrap();
        assert_eq!(pass.stats().reduced_to_proof, 1);
        let load = ir.linked_insts().find(|&i| ir.inst(i).opcode == Opcode::TauLdInd).unwrap();
        assert_eq!(ir.inst(load).src(2), proof);
    }

    #[test]
    fn test_incompatible_static_cast_is_internal_error() {
        let mut tm = TypeManager::new();
        let c = classes(&mut tm);
        let void = tm.void();
        let mut ir = MethodIr::new("bad", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(c.animal, 0);
        let nn = b.tau_check_null(a);
        let d = b.tau_static_cast(a, nn, c.animal);
        b.tau_has_exact_type(d, c.dog);
        b.ret(None);

        let err = SimplifyTaus::new().run(&mut ir).unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.pass(), PASS);
    }

    #[test]
    fn test_guard_on_integer_is_internal_error() {
        let mut tm = TypeManager::new();
        let c = classes(&mut tm);
        let void = tm.void();
        let mut ir = MethodIr::new("bad", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let x = b.i32(1);
        let y = b.add(x, x);
        b.tau_has_type(y, c.dog);
        b.ret(None);
        assert!(SimplifyTaus::new().run(&mut ir).unwrap_err().is_internal());
    }

    #[test]
    fn test_compressed_reference_recurses() {
        let mut tm = TypeManager::new();
        let c = classes(&mut tm);
        let cdog = tm.compressed(c.dog);
        let void = tm.void();
        let mut ir = MethodIr::new("compressed", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(c.animal, 0);
        let nn = b.tau_check_null(a);
        let proof = b.tau_check_cast(a, nn, c.dog);
        let d = b.tau_static_cast(a, proof, c.dog);
        let cd = b.compress(d);
        let t = b.tau_has_type(cd, cdog);
        let u = b.uncompress(cd);
        let t2 = b.tau_has_type(u, c.dog);
        b.tau_and(&[t, t2]);
        b.ret(None);

        let mut pass = SimplifyTaus::new();
        pass.run(&mut ir).unwrap();
        assert_eq!(guards(&ir), 0);
        let and = ir.linked_insts().find(|&i| ir.inst(i).opcode == Opcode::TauAnd).unwrap();
        assert_eq!(ir.inst(and).srcs.as_slice(), &[proof, proof]);
    }

    #[test]
    fn test_as_type_reduces_type_guard_only() {
        let mut tm = TypeManager::new();
        let c = classes(&mut tm);
        let void = tm.void();
        let mut ir = MethodIr::new("astype", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        let a = b.def_arg(c.animal, 0);
        let nn = b.tau_check_null(a);
        let d = b.tau_as_type(a, nn, c.dog);
        let t = b.tau_has_type(d, c.animal);
        let n = b.tau_is_non_null(d);
        b.tau_and(&[t, n]);
        b.ret(None);

        let mut pass = SimplifyTaus::new();
        pass.run(&mut ir).unwrap();
        // The cast may yield null.
        assert_eq!(guards(&ir), 1);
        assert_eq!(pass.stats().reduced_to_safe, 1);
    }

    /// `v = cond ? new Dog : new Dog; return v.legs` through an SSA variable.
    fn merged_variable() -> MethodIr {
        let mut tm = TypeManager::new();
        let c = classes(&mut tm);
        let i32_ = tm.int32();
        let mut ir = MethodIr::new("merge", tm, i32_);
        let var = ir.new_var(c.animal);
        let (v1, v2, v3) = (ir.new_ssa_var(var), ir.new_ssa_var(var), ir.new_ssa_var(var));
        let mut b = IrBuilder::new(&mut ir);
        let k = b.def_arg(i32_, 0);
        let zero = b.i32(0);
        let (l, r, join) = (b.new_block(), b.new_block(), b.new_block());
        b.branch(CmpMod::Lt, k, Some(zero), l, r, 0.5);
        b.switch_to(l);
        let o1 = b.new_obj(c.dog);
        b.st_var(v1, o1);
        b.jump(join);
        b.switch_to(r);
        let o2 = b.new_obj(c.dog);
        b.st_var(v2, o2);
        b.jump(join);
        b.switch_to(join);
        b.phi_into(v3, &[v1, v2]);
        let x = b.ld_var(v3);
        let t = b.tau_has_type(x, c.animal);
        let nn = b.tau_is_non_null(x);
        let addr = b.ld_field_addr(x, c.legs);
        let v = b.ld_ind(i32_, addr, nn, t);
        b.ret(Some(v));
        ir
    }

    #[test]
    fn test_shadow_variable_threads_proof_through_phi() {
        let reference = merged_variable();
        let mut ir = merged_variable();
        let mut pass = SimplifyTaus::new();
        assert!(pass.run(&mut ir).unwrap());
        ir.verify().unwrap();

        // One shadow per version and guard kind.
        assert_eq!(pass.stats().shadows_created, 6);
        assert!(pass.stats().rounds >= 2);
        // The load's proofs come from shadow loads.
        let load = ir.linked_insts().find(|&i| ir.inst(i).opcode == Opcode::TauLdInd).unwrap();
        for &t in &ir.inst(load).srcs[1..] {
            assert_eq!(ir.def_of(t).unwrap().opcode, Opcode::LdVar);
        }
        // Guards on the stored allocations were reduced and removed.
        assert_eq!(guards(&ir), 0);
        let tau = ir.types.tau();
        let shadow_phis = ir.linked_insts().filter(|&i| ir.inst(i).opcode == Opcode::Phi && ir.inst(i).ty == tau).count();
        assert_eq!(shadow_phis, 2);

        for k in [-1, 1] {
            let expected = Interpreter::new(&reference).run(&[Value::Int(k)]).unwrap();
            let got = Interpreter::new(&ir).run(&[Value::Int(k)]).unwrap();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_second_run_removes_nothing() {
        let mut ir = merged_variable();
        SimplifyTaus::new().run(&mut ir).unwrap();
        let insts = ir.linked_insts().count();

        let mut again = SimplifyTaus::new();
        assert!(!again.run(&mut ir).unwrap());
        assert_eq!(again.stats().guards_removed, 0);
        assert_eq!(ir.linked_insts().count(), insts);
    }

    #[test]
    fn test_tau_safe_follows_arguments() {
        let mut tm = TypeManager::new();
        let c = classes(&mut tm);
        let void = tm.void();
        let mut ir = MethodIr::new("args", tm, void);
        let mut b = IrBuilder::new(&mut ir);
        b.def_arg(c.animal, 0);
        b.def_arg(c.animal, 1);
        let o = b.new_obj(c.dog);
        b.tau_is_non_null(o);
        b.ret(None);

        SimplifyTaus::new().run(&mut ir).unwrap();
        let entry = &ir.block(ir.entry).insts;
        assert_eq!(ir.inst(entry[0]).opcode, Opcode::DefArg);
        assert_eq!(ir.inst(entry[1]).opcode, Opcode::DefArg);
        assert_eq!(ir.inst(entry[2]).opcode, Opcode::TauSafe);
    }

    #[test]
    fn test_stats_merge_and_rate() {
        let mut a = TauStats {
            guards_seen: 4,
            guards_removed: 3,
            ..Default::default()
        };
        a.merge(&TauStats {
            guards_seen: 4,
            guards_removed: 1,
            ..Default::default()
        });
        assert_eq!(a.guards_seen, 8);
        assert!((a.removal_rate() - 0.5).abs() < 1e-9);
        assert_eq!(TauStats::default().removal_rate(), 0.0);
    }
}
