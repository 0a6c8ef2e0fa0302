//! Bottom-up chain merging (Pettis-Hansen).
//!
//! Every reachable node starts as its own chain. Edges that may fall through
//! are visited by decreasing weight (source count times probability, ties in
//! edge order), and an edge joins the chain ending at its source to the chain
//! starting at its target unless both are the same chain. No chain may be
//! appended in front of the entry. The chains are then ordered by
//! closeness: a chain goes before another when more weight flows from it to
//! the other than back. The entry's chain always leads.

use super::{can_fall_through, weight};
use crate::backend::machine::{MachineCfg, MEdgeId, NodeId};
use rustc_hash::FxHashMap;

pub(super) fn order(cfg: &MachineCfg) -> Vec<NodeId> {
    let rpo = cfg.rpo();
    if rpo.is_empty() {
        return rpo;
    }
    let mut chain_of = vec![usize::MAX; cfg.node_count()];
    let mut chains: Vec<Vec<NodeId>> = Vec::with_capacity(rpo.len());
    for &n in &rpo {
        chain_of[n.as_usize()] = chains.len();
        chains.push(vec![n]);
    }

    let mut edges: Vec<(MEdgeId, f64)> = rpo
        .iter()
        .flat_map(|&n| cfg.node(n).out_edges.iter().copied())
        .filter(|&e| cfg.edge(e).target != cfg.entry && can_fall_through(cfg, e))
        .map(|e| (e, weight(cfg, e)))
        .collect();
    edges.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (e, _) in edges {
        let (s, t) = (cfg.edge(e).source, cfg.edge(e).target);
        let (cs, ct) = (chain_of[s.as_usize()], chain_of[t.as_usize()]);
        if cs == ct || chains[cs].last() != Some(&s) || chains[ct].first() != Some(&t) {
            continue;
        }
        let moved = std::mem::take(&mut chains[ct]);
        for &m in &moved {
            chain_of[m.as_usize()] = cs;
        }
        chains[cs].extend(moved);
    }

    let entry_chain = chain_of[cfg.entry.as_usize()];
    let mut ids: Vec<usize> = std::iter::once(entry_chain)
        .chain((0..chains.len()).filter(|&c| c != entry_chain && !chains[c].is_empty()))
        .collect();

    // Weight flowing between chains.
    let mut flow: FxHashMap<(usize, usize), f64> = FxHashMap::default();
    for &n in &rpo {
        for &e in &cfg.node(n).out_edges {
            let t = cfg.edge(e).target;
            let (a, b) = (chain_of[n.as_usize()], chain_of[t.as_usize()]);
            if a != b {
                *flow.entry((a, b)).or_insert(0.0) += weight(cfg, e);
            }
        }
    }
    let w = |a: usize, b: usize| flow.get(&(a, b)).copied().unwrap_or(0.0);

    // Insertion sort keeps the order stable when the relation does not.
    for i in 2..ids.len() {
        let mut j = i;
        while j > 1 && w(ids[j], ids[j - 1]) > w(ids[j - 1], ids[j]) {
            ids.swap(j, j - 1);
            j -= 1;
        }
    }

    ids.into_iter().flat_map(|c| std::mem::take(&mut chains[c])).collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::CfgBuilder;
    use super::*;

    #[test]
    fn test_hot_path_forms_one_chain() {
        // entry -> (a 0.1 | b 0.9) -> c
        let mut b = CfgBuilder::new(true);
        let e = b.entry();
        let a = b.block(10.0);
        let hot = b.block(90.0);
        let c = b.block(100.0);
        let x = b.exit();
        b.cond(e, a, hot, 0.1);
        b.goto(a, c);
        b.goto(hot, c);
        b.ret(c, x);
        let order = order(&b.cfg);
        assert_eq!(&order[..3], &[e, hot, c]);
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn test_loop_back_edge_does_not_close_chain() {
        // entry -> h; h -> (body 0.9 | out 0.1); body -> h
        let mut b = CfgBuilder::new(true);
        let e = b.entry();
        let h = b.block(1000.0);
        let body = b.block(900.0);
        let out = b.block(100.0);
        let x = b.exit();
        b.goto(e, h);
        b.cond(h, body, out, 0.9);
        b.goto(body, h);
        b.ret(out, x);
        let order = order(&b.cfg);
        assert_eq!(order[0], e);
        let mut sorted = order.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 5);
        // h -> body is the heaviest edge and stays adjacent.
        let hp = order.iter().position(|&n| n == h).unwrap();
        assert_eq!(order[hp + 1], body);
    }
}
