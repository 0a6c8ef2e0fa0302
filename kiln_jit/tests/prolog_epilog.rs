//! Prolog and epilog generation on allocated, laid-out methods.

use kiln_jit::backend::ipf::{generate_prolog_epilog, AppReg, Reg, Saved};
use kiln_jit::backend::layout::{linearize, verify, LayoutConfig, LayoutStrategy};
use kiln_jit::backend::machine::{CmpRel, MInst, MachineCfg, Mnemonic, NodeId, Operand, RuntimeFn, Symbol};
use kiln_jit::codegen::{EdgeTag, NodeKind};

fn add(d: Reg, a: Reg, b: Reg) -> MInst {
    MInst::new(Mnemonic::Add, &[d.into()], &[a.into(), b.into()])
}

fn ret() -> MInst {
    MInst::new(Mnemonic::BrRet, &[], &[Reg::B0.into()])
}

/// entry computes into `r4`..`r7`, calls out, then splits into two
/// returning arms.
fn two_returns(preserved: &[u8]) -> MachineCfg {
    let mut cfg = MachineCfg::new("two_returns");
    cfg.num_args = 2;
    cfg.max_out_args = 1;
    let e = cfg.add_node(NodeKind::Entry, 0, 10.0);
    let l = cfg.add_node(NodeKind::Block, 1, 6.0);
    let r = cfg.add_node(NodeKind::Block, 2, 4.0);
    let x = cfg.add_node(NodeKind::Exit, 3, 10.0);

    for &n in preserved {
        cfg.append(e, add(Reg::Gr(n), Reg::Gr(32), Reg::Gr(33)));
    }
    cfg.append(
        e,
        MInst::new(
            Mnemonic::BrCall,
            &[Reg::B0.into()],
            &[Operand::Sym(Symbol::Runtime(RuntimeFn::ThrowNull))],
        ),
    );
    cfg.append(
        e,
        MInst::new(
            Mnemonic::Cmp { rel: CmpRel::Eq, width: 8 },
            &[Reg::Pr(6).into(), Reg::Pr(7).into()],
            &[Reg::RET.into(), Reg::ZERO.into()],
        ),
    );
    cfg.append(e, MInst::new(Mnemonic::BrCond, &[], &[]).with_qp(Reg::Pr(6)));
    cfg.add_edge(e, l, EdgeTag::True, 0.6);
    cfg.add_edge(e, r, EdgeTag::False, 0.4);

    for (arm, src) in [(l, 4u8), (r, 5u8)] {
        let src = if preserved.contains(&src) { Reg::Gr(src) } else { Reg::Gr(32) };
        cfg.append(arm, MInst::new(Mnemonic::Mov, &[Reg::RET.into()], &[src.into()]));
        cfg.append(arm, ret());
        cfg.add_edge(arm, x, EdgeTag::Unconditional, 1.0);
    }
    cfg
}

fn laid_out(preserved: &[u8]) -> MachineCfg {
    let mut cfg = two_returns(preserved);
    linearize(&mut cfg, &LayoutConfig::for_testing(LayoutStrategy::TopDown)).unwrap();
    cfg
}

fn returning_nodes(cfg: &MachineCfg) -> Vec<NodeId> {
    cfg.node_ids()
        .filter(|&n| cfg.node(n).insts.iter().any(|i| i.op == Mnemonic::BrRet))
        .collect()
}

/// Net stack pointer adjustment along entry then `n`.
fn sp_delta(cfg: &MachineCfg, n: NodeId) -> i64 {
    [cfg.entry, n]
        .iter()
        .flat_map(|&b| cfg.node(b).insts.iter())
        .filter(|i| i.op == Mnemonic::Adds && i.dsts.first() == Some(&Operand::Reg(Reg::SP)))
        .map(|i| match i.srcs[0] {
            Operand::Imm(d) => d,
            _ => 0,
        })
        .sum()
}

#[test]
fn test_saves_only_used_preserved_general_registers() {
    let cases: [&[u8]; 4] = [&[4], &[4, 6], &[4, 5, 6, 7], &[]];
    for used in cases {
        let mut cfg = laid_out(used);
        let pe = generate_prolog_epilog(&mut cfg).unwrap();
        let saved: Vec<Reg> = pe
            .saves
            .iter()
            .filter_map(|s| match s.value {
                Saved::Reg(r @ Reg::Gr(_)) => Some(r),
                _ => None,
            })
            .collect();
        let expected: Vec<Reg> = used.iter().map(|&n| Reg::Gr(n)).collect();
        for r in &expected {
            assert!(saved.contains(r), "{used:?}: {r} not saved");
        }
        assert_eq!(pe.stats.saved_gr as usize, expected.len(), "{used:?}");
        for r in saved.iter().filter(|r| !expected.contains(r)) {
            panic!("{used:?}: unused {r} saved");
        }
    }
}

#[test]
fn test_stack_pointer_balances_on_every_return() {
    let mut cfg = laid_out(&[4, 5, 6, 7]);
    let pe = generate_prolog_epilog(&mut cfg).unwrap();
    let rets = returning_nodes(&cfg);
    assert_eq!(rets.len(), 2);
    assert_eq!(pe.stats.epilogs, 2);
    for n in rets {
        assert_eq!(sp_delta(&cfg, n), 0, "return in L{}", n.index());
    }
}

#[test]
fn test_call_allocates_register_frame_and_restores_pfs() {
    let mut cfg = laid_out(&[4]);
    let pe = generate_prolog_epilog(&mut cfg).unwrap();
    let frame = pe.register_frame.expect("calls need a register frame");
    assert_eq!(frame.inputs, 2);
    assert_eq!(frame.outputs, 1);

    let entry = &cfg.node(cfg.entry).insts;
    assert_eq!(entry[0].op, Mnemonic::Alloc);
    assert_eq!(entry[0].dsts[0], Operand::Reg(frame.pfs));

    for n in returning_nodes(&cfg) {
        let insts = &cfg.node(n).insts;
        let ret_at = insts.iter().position(|i| i.op == Mnemonic::BrRet).unwrap();
        let restores_pfs = insts[..ret_at].iter().any(|i| {
            i.op == Mnemonic::Mov
                && i.dsts[0] == Operand::Reg(Reg::Ar(AppReg::Pfs))
                && i.srcs[0] == Operand::Reg(frame.pfs)
        });
        assert!(restores_pfs, "L{}", n.index());
    }
}

#[test]
fn test_return_pointer_saved_once_and_restored_before_each_return() {
    let mut cfg = laid_out(&[]);
    let pe = generate_prolog_epilog(&mut cfg).unwrap();
    let b0_saves = pe.saves.iter().filter(|s| s.value == Saved::Reg(Reg::B0)).count();
    assert_eq!(b0_saves, 1);
    for n in returning_nodes(&cfg) {
        let insts = &cfg.node(n).insts;
        let ret_at = insts.iter().position(|i| i.op == Mnemonic::BrRet).unwrap();
        assert!(
            insts[..ret_at].iter().any(|i| i.dsts.first() == Some(&Operand::Reg(Reg::B0))),
            "L{}",
            n.index()
        );
    }
}

#[test]
fn test_layout_still_verifies_after_prolog_epilog() {
    let mut cfg = laid_out(&[4, 7]);
    generate_prolog_epilog(&mut cfg).unwrap();
    verify(&cfg).unwrap();
    let mut last = 0;
    for n in cfg.layout_order() {
        if let Some(off) = cfg.node(n).code_offset {
            assert!(off >= last);
            last = off;
        }
    }
}
