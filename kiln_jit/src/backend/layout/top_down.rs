//! Top-down greedy layout.
//!
//! From the entry, repeatedly place the unplaced successor most likely to be
//! taken among those that can fall through. Successors within `tie_ratio` of
//! the best are tied, and a tied successor with a single predecessor wins, so
//! join points are more often reached by a taken branch than by falling in.
//! When the current node has no eligible successor, the unplaced node with
//! the highest connectivity (execution weight received from placed nodes)
//! comes next, and failing that the first unplaced node in reverse
//! postorder.

use super::{can_fall_through, prob, weight};
use crate::backend::machine::{MachineCfg, NodeId};

pub(super) fn order(cfg: &MachineCfg, tie_ratio: f64) -> Vec<NodeId> {
    let rpo = cfg.rpo();
    let mut placed = vec![false; cfg.node_count()];
    let mut connectivity = vec![0.0f64; cfg.node_count()];
    let mut order = Vec::with_capacity(rpo.len());

    let mut cur = rpo.first().copied();
    while let Some(n) = cur {
        placed[n.as_usize()] = true;
        order.push(n);
        for &e in &cfg.node(n).out_edges {
            connectivity[cfg.edge(e).target.as_usize()] += weight(cfg, e);
        }
        cur = best_successor(cfg, n, tie_ratio, &placed).or_else(|| {
            rpo.iter()
                .copied()
                .filter(|m| !placed[m.as_usize()])
                .fold(None, |best: Option<NodeId>, m| match best {
                    Some(b) if connectivity[b.as_usize()] >= connectivity[m.as_usize()] => Some(b),
                    _ => Some(m),
                })
        });
    }
    order
}

fn best_successor(cfg: &MachineCfg, n: NodeId, tie_ratio: f64, placed: &[bool]) -> Option<NodeId> {
    let candidates: Vec<(NodeId, f64)> = cfg
        .node(n)
        .out_edges
        .iter()
        .copied()
        .filter(|&e| !placed[cfg.edge(e).target.as_usize()] && can_fall_through(cfg, e))
        .map(|e| (cfg.edge(e).target, prob(cfg, e)))
        .collect();
    let best = candidates.iter().map(|&(_, p)| p).fold(f64::NEG_INFINITY, f64::max);
    let single_pred = |m: NodeId| cfg.node(m).in_edges.len() == 1;
    candidates
        .iter()
        .filter(|&&(_, p)| p >= best * tie_ratio)
        .find(|&&(m, _)| single_pred(m))
        .or_else(|| candidates.iter().find(|&&(_, p)| p == best))
        .map(|&(m, _)| m)
}

#[cfg(test)]
mod tests {
    use super::super::tests::CfgBuilder;
    use super::*;

    #[test]
    fn test_follows_likely_successor() {
        let mut b = CfgBuilder::new(true);
        let e = b.entry();
        let unlikely = b.block(20.0);
        let likely = b.block(80.0);
        let x = b.exit();
        b.cond(e, unlikely, likely, 0.2);
        b.ret(unlikely, x);
        b.ret(likely, x);
        let order = order(&b.cfg, 0.9);
        assert_eq!(order[0], e);
        assert_eq!(order[1], likely);
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_near_tie_prefers_single_predecessor() {
        // entry -> (join 0.52 | side 0.48), side -> join.
        let mut b = CfgBuilder::new(true);
        let e = b.entry();
        let join = b.block(100.0);
        let side = b.block(48.0);
        let x = b.exit();
        b.cond(e, join, side, 0.52);
        b.goto(side, join);
        b.ret(join, x);
        let order = order(&b.cfg, 0.9);
        assert_eq!(order[1], side);
        assert_eq!(order[2], join);
    }

    #[test]
    fn test_clear_winner_ignores_predecessor_count() {
        let mut b = CfgBuilder::new(true);
        let e = b.entry();
        let join = b.block(100.0);
        let side = b.block(10.0);
        let x = b.exit();
        b.cond(e, join, side, 0.9);
        b.goto(side, join);
        b.ret(join, x);
        let order = order(&b.cfg, 0.9);
        assert_eq!(order[1], join);
    }
}
