//! Block layout postconditions over every strategy.

use kiln_jit::backend::ipf::{Reg, RegClass};
use kiln_jit::backend::layout::{linearize, verify, LayoutConfig, LayoutStrategy};
use kiln_jit::backend::machine::{CmpRel, MInst, MachineCfg, Mnemonic, NodeId};
use kiln_jit::codegen::{EdgeTag, NodeKind};

const STRATEGIES: [LayoutStrategy; 4] = [
    LayoutStrategy::Auto,
    LayoutStrategy::Topological,
    LayoutStrategy::TopDown,
    LayoutStrategy::BottomUp,
];

struct Builder {
    cfg: MachineCfg,
    preds: u32,
}

impl Builder {
    fn new(profile: bool) -> Self {
        let mut cfg = MachineCfg::new("shape");
        cfg.has_profile = profile;
        cfg.add_node(NodeKind::Entry, 0, 100.0);
        Builder { cfg, preds: 0 }
    }

    fn block(&mut self, count: f64) -> NodeId {
        let id = self.cfg.node_count() as u32;
        let n = self.cfg.add_node(NodeKind::Block, id, count);
        self.cfg.append(n, MInst::new(Mnemonic::Nop, &[], &[]));
        n
    }

    fn exit(&mut self) -> NodeId {
        let id = self.cfg.node_count() as u32;
        self.cfg.add_node(NodeKind::Exit, id, 0.0)
    }

    fn cond(&mut self, n: NodeId, t: NodeId, f: NodeId, p_true: f64) {
        self.preds += 2;
        let pt = Reg::Virtual { class: RegClass::Predicate, index: self.preds };
        let pf = Reg::Virtual { class: RegClass::Predicate, index: self.preds + 1 };
        self.cfg.append(
            n,
            MInst::new(
                Mnemonic::Cmp { rel: CmpRel::Ne, width: 8 },
                &[pt.into(), pf.into()],
                &[Reg::Gr(32).into(), Reg::ZERO.into()],
            ),
        );
        self.cfg.append(n, MInst::new(Mnemonic::BrCond, &[], &[]).with_qp(pt));
        self.cfg.add_edge(n, t, EdgeTag::True, p_true);
        self.cfg.add_edge(n, f, EdgeTag::False, 1.0 - p_true);
    }

    fn goto(&mut self, n: NodeId, t: NodeId) {
        self.cfg.add_edge(n, t, EdgeTag::Unconditional, 1.0);
    }

    fn ret(&mut self, n: NodeId, exit: NodeId) {
        self.cfg.append(n, MInst::new(Mnemonic::BrRet, &[], &[Reg::B0.into()]));
        self.cfg.add_edge(n, exit, EdgeTag::Unconditional, 1.0);
    }
}

/// entry -> (a | b), a <-> b, each may leave to its own return.
fn irreducible(profile: bool) -> MachineCfg {
    let mut b = Builder::new(profile);
    let e = b.cfg.entry;
    let a = b.block(60.0);
    let c = b.block(55.0);
    let ra = b.block(20.0);
    let rc = b.block(15.0);
    let x = b.exit();
    b.cond(e, a, c, 0.4);
    b.cond(a, c, ra, 0.7);
    b.cond(c, a, rc, 0.75);
    b.ret(ra, x);
    b.ret(rc, x);
    b.cfg
}

/// A nested loop with an early exit from the inner loop and a shared tail.
fn nested_multi_exit(profile: bool) -> MachineCfg {
    let mut b = Builder::new(profile);
    let e = b.cfg.entry;
    let outer = b.block(10.0);
    let inner = b.block(1000.0);
    let body = b.block(990.0);
    let latch = b.block(9.0);
    let early = b.block(1.0);
    let done = b.block(1.0);
    let x = b.exit();
    b.goto(e, outer);
    b.goto(outer, inner);
    b.cond(inner, body, latch, 0.99);
    b.cond(body, early, inner, 0.001);
    b.cond(latch, outer, done, 0.9);
    b.ret(early, x);
    b.ret(done, x);
    b.cfg
}

/// A straight chain interrupted by a switch-like fan-out through jumps.
fn diamond_chain(profile: bool) -> MachineCfg {
    let mut b = Builder::new(profile);
    let e = b.cfg.entry;
    let mut prev = e;
    let x = b.exit();
    for _ in 0..4 {
        let l = b.block(30.0);
        let r = b.block(70.0);
        let j = b.block(100.0);
        b.cond(prev, l, r, 0.3);
        b.goto(l, j);
        b.goto(r, j);
        prev = j;
    }
    b.ret(prev, x);
    b.cfg
}

fn shapes() -> Vec<(&'static str, fn(bool) -> MachineCfg)> {
    vec![
        ("irreducible", irreducible as fn(bool) -> MachineCfg),
        ("nested_multi_exit", nested_multi_exit),
        ("diamond_chain", diamond_chain),
    ]
}

fn check(name: &str, strategy: LayoutStrategy, profile: bool, mut cfg: MachineCfg) {
    let reachable = cfg.rpo();
    let stats = linearize(&mut cfg, &LayoutConfig::for_testing(strategy))
        .unwrap_or_else(|e| panic!("{name} {strategy:?} profile={profile}: {e}"));
    let order = cfg.layout_order();

    assert_eq!(order[0], cfg.entry, "{name} {strategy:?}");
    assert_eq!(order.len(), reachable.len() + stats.jump_blocks, "{name} {strategy:?}");
    for n in &reachable {
        assert_eq!(order.iter().filter(|&m| m == n).count(), 1, "{name} {strategy:?}: {n:?}");
    }
    let terminals = order.iter().filter(|&&n| cfg.node(n).layout_succ.is_none()).count();
    assert_eq!(terminals, 1, "{name} {strategy:?}");
    verify(&cfg).unwrap();

    // Code offsets grow along the chain.
    let offsets: Vec<u32> = order.iter().filter_map(|&n| cfg.node(n).code_offset).collect();
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]), "{name} {strategy:?}");
    assert_eq!(stats.code_size % MachineCfg::BUNDLE_SIZE, 0);
}

#[test]
fn test_every_strategy_forms_one_chain_with_profile() {
    for (name, shape) in shapes() {
        for strategy in STRATEGIES {
            check(name, strategy, true, shape(true));
        }
    }
}

#[test]
fn test_every_strategy_forms_one_chain_without_profile() {
    for (name, shape) in shapes() {
        for strategy in STRATEGIES {
            check(name, strategy, false, shape(false));
        }
    }
}

#[test]
fn test_auto_uses_bottom_up_only_with_profile() {
    let mut cfg = nested_multi_exit(true);
    let stats = linearize(&mut cfg, &LayoutConfig::for_testing(LayoutStrategy::Auto)).unwrap();
    assert_eq!(stats.strategy, LayoutStrategy::BottomUp);

    let mut cfg = nested_multi_exit(false);
    let stats = linearize(&mut cfg, &LayoutConfig::for_testing(LayoutStrategy::Auto)).unwrap();
    assert_eq!(stats.strategy, LayoutStrategy::Topological);
}

#[test]
fn test_hot_inner_loop_body_falls_through() {
    for strategy in [LayoutStrategy::TopDown, LayoutStrategy::BottomUp] {
        let mut cfg = nested_multi_exit(true);
        linearize(&mut cfg, &LayoutConfig::for_testing(strategy)).unwrap();
        let order = cfg.layout_order();
        let inner = order.iter().position(|&n| cfg.node(n).exec_count == 1000.0).unwrap();
        assert_eq!(cfg.node(order[inner + 1]).exec_count, 990.0, "{strategy:?}");
    }
}

#[test]
fn test_relayout_still_verifies() {
    let mut cfg = diamond_chain(true);
    let config = LayoutConfig::for_testing(LayoutStrategy::BottomUp);
    linearize(&mut cfg, &config).unwrap();
    let first = cfg.layout_order().len();
    let second = linearize(&mut cfg, &config).unwrap();
    assert_eq!(cfg.layout_order().len(), first + second.jump_blocks);
    verify(&cfg).unwrap();
}
