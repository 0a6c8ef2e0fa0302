//! Strongly connected components of the dependence graph.
//!
//! Tarjan's algorithm with an explicit stack, so the depth of the graph is
//! not bounded by the native stack.

use super::dependence::{Ddg, DdgEdgeId, DdgNodeId};
use rustc_hash::FxHashSet;

/// Partition of the dependence graph into strongly connected components.
#[derive(Debug, Clone)]
pub struct Sccs {
    /// Components in reverse topological order, as Tarjan emits them. Nodes
    /// inside a component are sorted by program order.
    pub components: Vec<Vec<DdgNodeId>>,
    /// Component index of each node.
    pub comp_of: Vec<usize>,
}

impl Sccs {
    /// Whether `n` lies on a dependence cycle: a component of several nodes,
    /// or a node depending on itself.
    pub fn in_cycle(&self, ddg: &Ddg, n: DdgNodeId, ignored: &FxHashSet<DdgEdgeId>) -> bool {
        let c = self.comp_of[n.as_usize()];
        self.components[c].len() > 1
            || ddg
                .node(n)
                .succs
                .iter()
                .any(|e| !ignored.contains(e) && ddg.edge(*e).to == n)
    }

    pub fn same(&self, a: DdgNodeId, b: DdgNodeId) -> bool {
        self.comp_of[a.as_usize()] == self.comp_of[b.as_usize()]
    }
}

/// Tarjan over `ddg`, skipping the edges in `ignored`.
pub fn find_sccs(ddg: &Ddg, ignored: &FxHashSet<DdgEdgeId>) -> Sccs {
    const UNVISITED: u32 = u32::MAX;
    let n = ddg.len();
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0u32; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<DdgNodeId> = Vec::new();
    let mut comp_of = vec![usize::MAX; n];
    let mut components: Vec<Vec<DdgNodeId>> = Vec::new();
    let mut counter = 0u32;

    // (node, next successor position)
    let mut work: Vec<(DdgNodeId, usize)> = Vec::new();
    for root in ddg.node_ids() {
        if index[root.as_usize()] != UNVISITED {
            continue;
        }
        work.push((root, 0));
        while let Some(&(v, pos)) = work.last() {
            let vi = v.as_usize();
            if pos == 0 && index[vi] == UNVISITED {
                index[vi] = counter;
                low[vi] = counter;
                counter += 1;
                stack.push(v);
                on_stack[vi] = true;
            }
            let succs = &ddg.node(v).succs;
            let mut next = pos;
            let mut child = None;
            while next < succs.len() {
                let e = succs[next];
                next += 1;
                if ignored.contains(&e) {
                    continue;
                }
                let w = ddg.edge(e).to;
                let wi = w.as_usize();
                if index[wi] == UNVISITED {
                    child = Some(w);
                    break;
                } else if on_stack[wi] {
                    low[vi] = low[vi].min(index[wi]);
                }
            }
            if let Some(top) = work.last_mut() {
                top.1 = next;
            }
            if let Some(w) = child {
                work.push((w, 0));
                continue;
            }

            work.pop();
            if let Some(&(parent, _)) = work.last() {
                let pi = parent.as_usize();
                low[pi] = low[pi].min(low[vi]);
            }
            if low[vi] == index[vi] {
                let mut comp = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w.as_usize()] = false;
                    comp_of[w.as_usize()] = components.len();
                    comp.push(w);
                    if w == v {
                        break;
                    }
                }
                comp.sort();
                components.push(comp);
            }
        }
    }
    Sccs { components, comp_of }
}
