//! Prolog and epilog generation for register-allocated IPF code.
//!
//! Generation runs as a fixed sequence of steps, each deciding where one
//! group of values lives while the method body runs:
//!
//! 1. return pointer `b0`, when the method calls
//! 2. the predicate file, when a preserved predicate is used
//! 3. `alloc` of the register stack frame, saving `ar.pfs`
//! 4. special application registers (`ar.unat`, `ar.lc`)
//! 5. preserved general registers r4..r7
//! 6. preserved floating-point registers
//! 7. preserved branch registers b1..b5
//! 8. the memory stack pointer adjustment
//!
//! A value is relocated into a free stacked register when one is available,
//! otherwise it gets a slot in the shared [`FrameLayout`]. Every register a
//! step takes is marked used before the next step searches, and the frame
//! size is read only in the last step, after every slot is reserved.

use super::frame::FrameLayout;
use super::registers::{AppReg, Reg, UsedRegs};
use crate::backend::machine::{MFlags, MInst, MachineCfg, Mnemonic, NodeId, Operand};
use kiln_core::{ice, CompileResult, Location};
use tracing::debug;

const PASS: &str = "prolog-epilog";

// =============================================================================
// Results
// =============================================================================

/// Where a saved value lives while the body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveHome {
    Reg(Reg),
    /// Offset from the adjusted sp.
    Mem(u32),
}

/// What was saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Saved {
    Reg(Reg),
    /// The predicate file.
    Preds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedValue {
    pub value: Saved,
    pub home: SaveHome,
}

/// Register stack frame allocated by `alloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFrame {
    /// Home of the caller's `ar.pfs`.
    pub pfs: Reg,
    pub inputs: u8,
    pub locals: u8,
    pub outputs: u8,
}

#[derive(Debug, Clone, Default)]
pub struct PrologEpilogStats {
    pub saved_gr: usize,
    pub saved_fr: usize,
    pub saved_br: usize,
    pub saved_special: usize,
    /// Values kept in stacked registers instead of memory.
    pub relocated: usize,
    pub epilogs: usize,
    pub frame_size: u32,
}

/// Outcome of prolog and epilog generation.
#[derive(Debug, Clone)]
pub struct PrologEpilog {
    pub saves: Vec<SavedValue>,
    pub register_frame: Option<RegisterFrame>,
    pub frame: FrameLayout,
    pub stats: PrologEpilogStats,
}

// =============================================================================
// Generator
// =============================================================================

struct Generator {
    used: UsedRegs,
    frame: FrameLayout,
    /// Whether the method gets a register stack frame.
    stacked: bool,
    /// Stacked registers available as save homes.
    lo: u8,
    hi: u8,
    saves: Vec<SavedValue>,
    pfs: Option<Reg>,
    stats: PrologEpilogStats,
}

impl Generator {
    fn new(cfg: &MachineCfg, used: UsedRegs) -> Self {
        let inputs = cfg.num_args.min(Reg::MAX_REG_ARGS);
        let outputs = cfg.max_out_args.min(Reg::MAX_REG_ARGS);
        Generator {
            used,
            frame: FrameLayout::new(cfg.max_out_args as u32, cfg.spill_slots),
            stacked: cfg.has_call() || used.uses_stacked(),
            lo: Reg::FIRST_STACKED + inputs,
            hi: 127 - outputs,
            saves: Vec::new(),
            pfs: None,
            stats: PrologEpilogStats::default(),
        }
    }

    fn take_stacked(&mut self) -> Option<Reg> {
        if !self.stacked {
            return None;
        }
        self.used.take_stacked(self.lo, self.hi)
    }

    fn free_stacked(&self) -> usize {
        if !self.stacked {
            return 0;
        }
        (self.lo.max(Reg::FIRST_STACKED)..=self.hi)
            .filter(|&n| !self.used.contains(Reg::Gr(n)))
            .count()
    }

    /// Relocate `value` into a stacked register, or reserve a memory slot.
    fn save(&mut self, value: Saved, slot_reg: Reg, memory_only: bool) {
        let reg_home = if memory_only { None } else { self.take_stacked() };
        let home = match reg_home {
            Some(r) => {
                self.stats.relocated += 1;
                SaveHome::Reg(r)
            }
            None => SaveHome::Mem(self.frame.reserve_save(slot_reg)),
        };
        self.saves.push(SavedValue { value, home });
    }

    fn return_pointer(&mut self, has_call: bool) {
        if has_call {
            self.save(Saved::Reg(Reg::B0), Reg::B0, false);
        }
    }

    fn predicates(&mut self) {
        if self.used.uses_preserved_pr() {
            self.save(Saved::Preds, Reg::P0, false);
        }
    }

    fn register_frame(&mut self) -> CompileResult<()> {
        if !self.stacked {
            return Ok(());
        }
        let Some(pfs) = self.take_stacked() else {
            ice!(PASS, Location::Method, "no stacked register left for ar.pfs");
        };
        self.pfs = Some(pfs);
        Ok(())
    }

    fn special_registers(&mut self) {
        // Spilled general registers put their NaT bits in ar.unat.
        let preserved_gr = self.used.preserved_gr().count();
        let spills_gr = preserved_gr > self.free_stacked();
        if spills_gr || self.used.contains(Reg::Ar(AppReg::Unat)) {
            let r = Reg::Ar(AppReg::Unat);
            self.save(Saved::Reg(r), r, false);
            self.stats.saved_special += 1;
        }
        if self.used.contains(Reg::Ar(AppReg::Lc)) {
            let r = Reg::Ar(AppReg::Lc);
            self.save(Saved::Reg(r), r, false);
            self.stats.saved_special += 1;
        }
    }

    fn general_registers(&mut self) {
        let regs: Vec<Reg> = self.used.preserved_gr().collect();
        for r in regs {
            self.save(Saved::Reg(r), r, false);
            self.stats.saved_gr += 1;
        }
    }

    fn float_registers(&mut self) {
        let regs: Vec<Reg> = self.used.preserved_fr().collect();
        for r in regs {
            self.save(Saved::Reg(r), r, true);
            self.stats.saved_fr += 1;
        }
    }

    fn branch_registers(&mut self) {
        let regs: Vec<Reg> = self.used.preserved_br().collect();
        for r in regs {
            self.save(Saved::Reg(r), r, false);
            self.stats.saved_br += 1;
        }
    }

    fn register_frame_shape(&self, cfg: &MachineCfg) -> Option<RegisterFrame> {
        let pfs = self.pfs?;
        let inputs = cfg.num_args.min(Reg::MAX_REG_ARGS);
        let top = self.used.highest_stacked().unwrap_or(Reg::FIRST_STACKED);
        let locals = (top + 1).saturating_sub(Reg::FIRST_STACKED + inputs);
        Some(RegisterFrame {
            pfs,
            inputs,
            locals,
            outputs: cfg.max_out_args.min(Reg::MAX_REG_ARGS),
        })
    }
}

// =============================================================================
// Emission
// =============================================================================

fn prolog(inst: MInst) -> MInst {
    inst.with_flags(MFlags::PROLOG)
}

fn epilog(inst: MInst) -> MInst {
    inst.with_flags(MFlags::EPILOG)
}

fn mov(dst: impl Into<Operand>, src: impl Into<Operand>) -> MInst {
    MInst::new(Mnemonic::Mov, &[dst.into()], &[src.into()])
}

fn sp_relative(offset: i64) -> MInst {
    MInst::new(
        Mnemonic::Adds,
        &[Reg::SCRATCH.into()],
        &[Operand::Imm(offset), Reg::SP.into()],
    )
}

fn value_operand(v: Saved) -> Operand {
    match v {
        Saved::Reg(r) => Operand::Reg(r),
        Saved::Preds => Operand::Preds,
    }
}

fn save_to_memory(out: &mut Vec<MInst>, v: Saved, offset: u32) {
    out.push(prolog(sp_relative(offset as i64)));
    let mem = Operand::Mem(Reg::SCRATCH);
    match v {
        Saved::Reg(r @ Reg::Gr(_)) => {
            out.push(prolog(MInst::new(Mnemonic::St(8), &[mem], &[r.into()]).with_flags(MFlags::SPILL)))
        }
        Saved::Reg(r @ Reg::Fr(_)) => {
            out.push(prolog(MInst::new(Mnemonic::Stf(16), &[mem], &[r.into()]).with_flags(MFlags::SPILL)))
        }
        other => {
            out.push(prolog(mov(Reg::SCRATCH2, value_operand(other))));
            out.push(prolog(MInst::new(Mnemonic::St(8), &[mem], &[Reg::SCRATCH2.into()])));
        }
    }
}

fn restore_from_memory(out: &mut Vec<MInst>, v: Saved, offset: u32) {
    out.push(epilog(sp_relative(offset as i64)));
    let mem = Operand::Mem(Reg::SCRATCH);
    match v {
        Saved::Reg(r @ Reg::Gr(_)) => {
            out.push(epilog(MInst::new(Mnemonic::Ld(8), &[r.into()], &[mem]).with_flags(MFlags::SPILL)))
        }
        Saved::Reg(r @ Reg::Fr(_)) => {
            out.push(epilog(MInst::new(Mnemonic::Ldf(16), &[r.into()], &[mem]).with_flags(MFlags::SPILL)))
        }
        other => {
            out.push(epilog(MInst::new(Mnemonic::Ld(8), &[Reg::SCRATCH2.into()], &[mem])));
            out.push(epilog(mov(value_operand(other), Reg::SCRATCH2)));
        }
    }
}

fn build_prolog(gen: &Generator, rf: Option<RegisterFrame>, size: u32) -> Vec<MInst> {
    let mut out = Vec::new();
    if let Some(rf) = rf {
        out.push(prolog(MInst::new(
            Mnemonic::Alloc,
            &[rf.pfs.into()],
            &[
                Reg::Ar(AppReg::Pfs).into(),
                Operand::Imm(rf.inputs as i64),
                Operand::Imm(rf.locals as i64),
                Operand::Imm(rf.outputs as i64),
                Operand::Imm(0),
            ],
        )));
    }
    for s in &gen.saves {
        if let SaveHome::Reg(home) = s.home {
            out.push(prolog(mov(home, value_operand(s.value))));
        }
    }
    if size > 0 {
        out.push(prolog(MInst::new(
            Mnemonic::Adds,
            &[Reg::SP.into()],
            &[Operand::Imm(-(size as i64)), Reg::SP.into()],
        )));
    }
    for s in &gen.saves {
        if let SaveHome::Mem(offset) = s.home {
            save_to_memory(&mut out, s.value, offset);
        }
    }
    out
}

fn build_epilog(gen: &Generator, rf: Option<RegisterFrame>, size: u32) -> Vec<MInst> {
    let mut out = Vec::new();
    for s in gen.saves.iter().rev() {
        if let SaveHome::Mem(offset) = s.home {
            restore_from_memory(&mut out, s.value, offset);
        }
    }
    if size > 0 {
        out.push(epilog(MInst::new(
            Mnemonic::Adds,
            &[Reg::SP.into()],
            &[Operand::Imm(size as i64), Reg::SP.into()],
        )));
    }
    for s in gen.saves.iter().rev() {
        if let SaveHome::Reg(home) = s.home {
            out.push(epilog(mov(value_operand(s.value), home)));
        }
    }
    if let Some(rf) = rf {
        out.push(epilog(mov(Reg::Ar(AppReg::Pfs), rf.pfs)));
    }
    out
}

fn return_sites(cfg: &MachineCfg) -> Vec<(NodeId, usize)> {
    cfg.node_ids()
        .flat_map(|n| {
            cfg.node(n)
                .insts
                .iter()
                .enumerate()
                .filter(|(_, i)| i.op == Mnemonic::BrRet)
                .map(move |(k, _)| (n, k))
                .collect::<Vec<_>>()
        })
        .collect()
}

// =============================================================================
// Driver
// =============================================================================

/// Generate the prolog into the entry node and an epilog before every
/// return.
///
/// The CFG must be register-allocated: a virtual register anywhere in it is
/// an internal error.
pub fn generate(cfg: &mut MachineCfg) -> CompileResult<PrologEpilog> {
    for n in cfg.node_ids() {
        if let Some(r) = cfg.node(n).insts.iter().flat_map(MInst::regs).find(|r| r.is_virtual()) {
            ice!(PASS, Location::Block(n.index()), "virtual register {r} reached prolog generation");
        }
    }

    // One scan over every operand before any step runs.
    let used = UsedRegs::scan(cfg.regs());
    let has_call = cfg.has_call();
    let mut gen = Generator::new(cfg, used);

    gen.return_pointer(has_call);
    gen.predicates();
    gen.register_frame()?;
    gen.special_registers();
    gen.general_registers();
    gen.float_registers();
    gen.branch_registers();
    let size = gen.frame.size();
    gen.stats.frame_size = size;

    let rf = gen.register_frame_shape(cfg);
    let entry_code = build_prolog(&gen, rf, size);
    let exit_code = build_epilog(&gen, rf, size);

    let entry = cfg.entry;
    cfg.node_mut(entry).insts.splice(0..0, entry_code);
    // Later sites first so earlier indices stay valid.
    let sites = return_sites(cfg);
    for &(n, k) in sites.iter().rev() {
        cfg.node_mut(n).insts.splice(k..k, exit_code.iter().cloned());
    }
    gen.stats.epilogs = sites.len();
    if cfg.node_ids().any(|n| cfg.node(n).code_offset.is_some()) {
        cfg.assign_code_offsets();
    }

    debug!(
        method = %cfg.name,
        gr = gen.stats.saved_gr,
        fr = gen.stats.saved_fr,
        br = gen.stats.saved_br,
        relocated = gen.stats.relocated,
        frame = size,
        "prolog and epilog generated"
    );
    Ok(PrologEpilog {
        saves: gen.saves,
        register_frame: rf,
        frame: gen.frame,
        stats: gen.stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::machine::Symbol;
    use crate::codegen::callback::{EdgeTag, NodeKind};
    use crate::ir::inst::VmHelper;

    /// entry: body, optional call, return.
    fn method(body: &[MInst], call: bool) -> MachineCfg {
        let mut cfg = MachineCfg::new("m");
        let e = cfg.add_node(NodeKind::Entry, 0, 1.0);
        let x = cfg.add_node(NodeKind::Exit, 1, 1.0);
        cfg.add_edge(e, x, EdgeTag::Unconditional, 1.0);
        for i in body {
            cfg.append(e, i.clone());
        }
        if call {
            cfg.append(
                e,
                MInst::new(
                    Mnemonic::BrCall,
                    &[Reg::B0.into()],
                    &[Operand::Sym(Symbol::Helper(VmHelper::IdentityHash))],
                ),
            );
            cfg.max_out_args = 1;
        }
        cfg.append(e, MInst::new(Mnemonic::BrRet, &[], &[Reg::B0.into()]));
        cfg
    }

    fn add(d: Reg, a: Reg, b: Reg) -> MInst {
        MInst::new(Mnemonic::Add, &[d.into()], &[a.into(), b.into()])
    }

    fn sp_delta(insts: &[MInst]) -> i64 {
        insts
            .iter()
            .filter(|i| i.op == Mnemonic::Adds && i.dsts[0] == Operand::Reg(Reg::SP))
            .map(|i| match i.srcs[0] {
                Operand::Imm(d) => d,
                _ => 0,
            })
            .sum()
    }

    fn saved_regs(pe: &PrologEpilog) -> Vec<Reg> {
        pe.saves
            .iter()
            .filter_map(|s| match s.value {
                Saved::Reg(r) => Some(r),
                Saved::Preds => None,
            })
            .collect()
    }

    #[test]
    fn test_saves_exactly_used_preserved_registers() {
        let mut cfg = method(&[add(Reg::Gr(4), Reg::Gr(32), Reg::Gr(8)), add(Reg::Gr(6), Reg::Gr(4), Reg::Gr(9))], true);
        let pe = generate(&mut cfg).unwrap();
        let regs = saved_regs(&pe);
        assert!(regs.contains(&Reg::Gr(4)));
        assert!(regs.contains(&Reg::Gr(6)));
        assert!(!regs.contains(&Reg::Gr(5)));
        assert!(!regs.contains(&Reg::Gr(7)));
        assert_eq!(pe.stats.saved_gr, 2);
        assert!(regs.contains(&Reg::B0));
        let insts = &cfg.node(cfg.entry).insts;
        assert_eq!(sp_delta(insts), 0);
    }

    #[test]
    fn test_leaf_without_preserved_registers_is_empty() {
        let mut cfg = method(&[add(Reg::Gr(8), Reg::Gr(9), Reg::Gr(10))], false);
        let before = cfg.node(cfg.entry).insts.len();
        let pe = generate(&mut cfg).unwrap();
        assert!(pe.saves.is_empty());
        assert!(pe.register_frame.is_none());
        assert_eq!(pe.stats.frame_size, 0);
        assert_eq!(cfg.node(cfg.entry).insts.len(), before);
    }

    #[test]
    fn test_call_allocates_register_frame_and_restores_pfs() {
        let mut cfg = method(&[add(Reg::Gr(8), Reg::Gr(32), Reg::Gr(33))], true);
        cfg.num_args = 2;
        let pe = generate(&mut cfg).unwrap();
        let rf = pe.register_frame.unwrap();
        assert_eq!(rf.inputs, 2);
        assert_eq!(rf.outputs, 1);
        // b0 and ar.pfs homes sit above the inputs.
        assert!(matches!(rf.pfs, Reg::Gr(n) if n >= 34));
        let insts = &cfg.node(cfg.entry).insts;
        assert_eq!(insts[0].op, Mnemonic::Alloc);
        let ret = insts.iter().position(|i| i.op == Mnemonic::BrRet).unwrap();
        assert_eq!(insts[ret - 1].dsts[0], Operand::Reg(Reg::Ar(AppReg::Pfs)));
        assert_eq!(insts[ret - 1].srcs[0], Operand::Reg(rf.pfs));
        assert_eq!(rf.locals as usize, pe.stats.relocated + 1);
    }

    #[test]
    fn test_leaf_spills_to_memory_and_saves_unat() {
        // No call and no stacked register use: no register stack frame.
        let mut cfg = method(&[add(Reg::Gr(5), Reg::Gr(8), Reg::Gr(9))], false);
        let pe = generate(&mut cfg).unwrap();
        assert!(pe.register_frame.is_none());
        assert_eq!(pe.stats.relocated, 0);
        assert_eq!(pe.stats.saved_special, 1);
        let slot = pe.frame.slot_of(Reg::Gr(5)).unwrap();
        assert!(slot.offset >= FrameLayout::SCRATCH_SIZE);
        assert_eq!(pe.stats.frame_size % FrameLayout::ALIGN, 0);
        let insts = &cfg.node(cfg.entry).insts;
        assert_eq!(sp_delta(insts), 0);
        let spill = insts.iter().find(|i| i.op == Mnemonic::St(8) && i.flags.contains(MFlags::SPILL)).unwrap();
        assert_eq!(spill.srcs[0], Operand::Reg(Reg::Gr(5)));
        assert_eq!(spill.to_string(), "st8.spill [r2] = r5");
        let fill = insts.iter().find(|i| i.op == Mnemonic::Ld(8) && i.flags.contains(MFlags::SPILL)).unwrap();
        assert_eq!(fill.to_string(), "ld8.fill r5 = [r2]");
    }

    #[test]
    fn test_float_registers_always_go_to_memory() {
        let fadd = MInst::new(Mnemonic::Fadd, &[Reg::Fr(16).into()], &[Reg::Fr(8).into(), Reg::Fr(9).into()]);
        let mut cfg = method(&[fadd], true);
        let pe = generate(&mut cfg).unwrap();
        assert_eq!(pe.stats.saved_fr, 1);
        let slot = pe.frame.slot_of(Reg::Fr(16)).unwrap();
        assert_eq!(slot.size, 16);
        assert_eq!(slot.offset % 16, 0);
    }

    #[test]
    fn test_every_return_gets_an_epilog() {
        let mut cfg = MachineCfg::new("two_returns");
        let e = cfg.add_node(NodeKind::Entry, 0, 1.0);
        let a = cfg.add_node(NodeKind::Block, 1, 1.0);
        let b = cfg.add_node(NodeKind::Block, 2, 1.0);
        let x = cfg.add_node(NodeKind::Exit, 3, 1.0);
        cfg.add_edge(e, a, EdgeTag::True, 0.5);
        cfg.add_edge(e, b, EdgeTag::False, 0.5);
        cfg.add_edge(a, x, EdgeTag::Unconditional, 1.0);
        cfg.add_edge(b, x, EdgeTag::Unconditional, 1.0);
        cfg.append(e, add(Reg::Gr(7), Reg::Gr(8), Reg::Gr(9)));
        for n in [a, b] {
            cfg.append(n, MInst::new(Mnemonic::BrRet, &[], &[Reg::B0.into()]));
        }
        let pe = generate(&mut cfg).unwrap();
        assert_eq!(pe.stats.epilogs, 2);
        for n in [a, b] {
            let insts = &cfg.node(n).insts;
            assert!(insts.iter().any(|i| i.flags.contains(MFlags::EPILOG)));
            assert_eq!(insts.last().unwrap().op, Mnemonic::BrRet);
        }
        let total: i64 = sp_delta(&cfg.node(e).insts) + sp_delta(&cfg.node(a).insts);
        assert_eq!(total, 0);
    }

    #[test]
    fn test_virtual_register_is_internal_error() {
        let v = Reg::Virtual {
            class: crate::backend::ipf::registers::RegClass::General,
            index: 0,
        };
        let mut cfg = method(&[add(v, Reg::Gr(8), Reg::Gr(9))], false);
        let err = generate(&mut cfg).unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.pass(), PASS);
    }
}
