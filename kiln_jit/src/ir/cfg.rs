//! Control-flow analyses over [`MethodIr`]: dominators and natural loops.
//!
//! Both are snapshots. A pass that changes the CFG recomputes them.

use super::arena::{BitSet, Id, SecondaryMap};
use super::method::{BlockId, EdgeId, MethodIr};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

// =============================================================================
// Dominator Tree
// =============================================================================

/// Dominator tree of the blocks reachable from the entry.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    idom: SecondaryMap<crate::ir::method::Block, BlockId>,
    rpo_index: SecondaryMap<crate::ir::method::Block, u32>,
    depth: SecondaryMap<crate::ir::method::Block, u32>,
    entry: BlockId,
}

impl DominatorTree {
    /// Cooper-Harvey-Kennedy iterative algorithm over reverse postorder.
    pub fn compute(ir: &MethodIr) -> Self {
        let rpo = ir.rpo();
        let n = ir.num_blocks();
        let mut dom = DominatorTree {
            idom: SecondaryMap::with_capacity(n),
            rpo_index: SecondaryMap::with_capacity(n),
            depth: SecondaryMap::with_capacity(n),
            entry: ir.entry,
        };
        for b in ir.block_ids() {
            dom.idom.set(b, BlockId::INVALID);
            dom.rpo_index.set(b, u32::MAX);
        }
        for (i, &b) in rpo.iter().enumerate() {
            dom.rpo_index.set(b, i as u32);
        }
        dom.idom.set(ir.entry, ir.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom = BlockId::INVALID;
                for p in ir.preds(b) {
                    if !dom.idom[p].is_valid() {
                        continue;
                    }
                    new_idom = if new_idom.is_valid() {
                        dom.intersect(p, new_idom)
                    } else {
                        p
                    };
                }
                if new_idom.is_valid() && dom.idom[b] != new_idom {
                    dom.idom.set(b, new_idom);
                    changed = true;
                }
            }
        }

        for &b in &rpo {
            let d = match dom.idom(b) {
                Some(p) => dom.depth[p] + 1,
                None => 0,
            };
            dom.depth.set(b, d);
        }
        dom
    }

    fn intersect(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            while self.rpo_index[a] > self.rpo_index[b] {
                a = self.idom[a];
            }
            while self.rpo_index[b] > self.rpo_index[a] {
                b = self.idom[b];
            }
        }
        a
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        let d = self.idom[b];
        (d.is_valid() && b != self.entry).then_some(d)
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.idom[b].is_valid()
    }

    pub fn depth(&self, b: BlockId) -> u32 {
        self.depth[b]
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(p) if self.depth[p] >= self.depth[a] => cur = p,
                _ => return false,
            }
        }
    }
}

// =============================================================================
// Loop Tree
// =============================================================================

/// A natural loop.
#[derive(Debug, Clone)]
pub struct Loop {
    pub header: BlockId,
    /// Edges from inside the loop to the header.
    pub back_edges: SmallVec<[EdgeId; 2]>,
    pub body: BitSet,
    /// Body blocks in reverse postorder of the method.
    pub blocks: Vec<BlockId>,
    pub parent: Option<LoopId>,
    pub children: SmallVec<[LoopId; 2]>,
    /// 1 for outermost loops.
    pub depth: u32,
}

pub type LoopId = Id<Loop>;

impl Loop {
    #[inline]
    pub fn contains(&self, b: BlockId) -> bool {
        self.body.contains(b.as_usize())
    }

    pub fn is_innermost(&self) -> bool {
        self.children.is_empty()
    }
}

/// All natural loops of a method, with nesting.
#[derive(Debug, Clone, Default)]
pub struct LoopTree {
    loops: Vec<Loop>,
    innermost: FxHashMap<BlockId, LoopId>,
}

impl LoopTree {
    /// Find back edges (target dominates source) and grow each loop body
    /// backwards from its latches. Back edges sharing a header form one loop.
    pub fn compute(ir: &MethodIr, dom: &DominatorTree) -> Self {
        let rpo = ir.rpo();
        let mut rpo_pos: FxHashMap<BlockId, usize> = FxHashMap::default();
        for (i, &b) in rpo.iter().enumerate() {
            rpo_pos.insert(b, i);
        }

        let mut by_header: FxHashMap<BlockId, usize> = FxHashMap::default();
        let mut loops: Vec<Loop> = Vec::new();
        for &b in &rpo {
            for &e in &ir.block(b).out_edges {
                let h = ir.edge(e).target;
                if !dom.dominates(h, b) {
                    continue;
                }
                let idx = *by_header.entry(h).or_insert_with(|| {
                    loops.push(Loop {
                        header: h,
                        back_edges: SmallVec::new(),
                        body: BitSet::with_capacity(ir.num_blocks()),
                        blocks: Vec::new(),
                        parent: None,
                        children: SmallVec::new(),
                        depth: 1,
                    });
                    loops.len() - 1
                });
                let lp = &mut loops[idx];
                lp.back_edges.push(e);
                lp.body.insert(h.as_usize());
                let mut work = vec![b];
                while let Some(x) = work.pop() {
                    if lp.body.insert(x.as_usize()) {
                        work.extend(ir.preds(x).filter(|p| dom.is_reachable(*p)));
                    }
                }
            }
        }

        for lp in &mut loops {
            lp.blocks = lp.body.iter().map(BlockId::from_usize).collect();
            lp.blocks.sort_by_key(|b| rpo_pos.get(b).copied().unwrap_or(usize::MAX));
        }

        // Parent is the smallest other loop whose body holds our header.
        let n = loops.len();
        for i in 0..n {
            let header = loops[i].header;
            let parent = (0..n)
                .filter(|&j| j != i && loops[j].contains(header) && loops[j].blocks.len() > loops[i].blocks.len())
                .min_by_key(|&j| loops[j].blocks.len());
            if let Some(p) = parent {
                loops[i].parent = Some(LoopId::from_usize(p));
                loops[p].children.push(LoopId::from_usize(i));
            }
        }
        for i in 0..n {
            let mut depth = 1;
            let mut cur = loops[i].parent;
            while let Some(p) = cur {
                depth += 1;
                cur = loops[p.as_usize()].parent;
            }
            loops[i].depth = depth;
        }

        let mut innermost: FxHashMap<BlockId, LoopId> = FxHashMap::default();
        for (i, lp) in loops.iter().enumerate() {
            for &b in &lp.blocks {
                let replace = match innermost.get(&b) {
                    Some(cur) => loops[cur.as_usize()].depth < lp.depth,
                    None => true,
                };
                if replace {
                    innermost.insert(b, LoopId::from_usize(i));
                }
            }
        }

        LoopTree { loops, innermost }
    }

    #[inline]
    pub fn get(&self, id: LoopId) -> &Loop {
        &self.loops[id.as_usize()]
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = LoopId> {
        (0..self.loops.len()).map(LoopId::from_usize)
    }

    /// Innermost loop containing `b`.
    pub fn loop_of(&self, b: BlockId) -> Option<LoopId> {
        self.innermost.get(&b).copied()
    }

    pub fn loop_with_header(&self, header: BlockId) -> Option<LoopId> {
        self.ids().find(|&l| self.get(l).header == header)
    }

    /// `outer` strictly encloses `inner`.
    pub fn encloses(&self, outer: LoopId, inner: LoopId) -> bool {
        let mut cur = self.get(inner).parent;
        while let Some(p) = cur {
            if p == outer {
                return true;
            }
            cur = self.get(p).parent;
        }
        false
    }

    /// Parent links of every loop, indexed by loop.
    pub fn parents(&self) -> Vec<Option<LoopId>> {
        self.loops.iter().map(|l| l.parent).collect()
    }

    pub fn innermost_loops(&self) -> impl Iterator<Item = LoopId> + '_ {
        self.ids().filter(|&l| self.get(l).is_innermost())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::method::EdgeKind;
    use crate::ir::types::TypeManager;

    /// entry -> h1 -> h2 <-> b2 ; h2 -> l1 -> h1 ; h1 -> exit
    fn nested() -> (MethodIr, [BlockId; 5]) {
        let tm = TypeManager::new();
        let v = tm.void();
        let mut ir = MethodIr::new("nested", tm, v);
        let e = ir.entry;
        let h1 = ir.new_block();
        let h2 = ir.new_block();
        let b2 = ir.new_block();
        let l1 = ir.new_block();
        ir.add_edge(e, h1, EdgeKind::Unconditional, 1.0);
        ir.add_edge(h1, h2, EdgeKind::True, 0.9);
        ir.add_edge(h1, ir.exit, EdgeKind::False, 0.1);
        ir.add_edge(h2, b2, EdgeKind::True, 0.9);
        ir.add_edge(h2, l1, EdgeKind::False, 0.1);
        ir.add_edge(b2, h2, EdgeKind::Unconditional, 1.0);
        ir.add_edge(l1, h1, EdgeKind::Unconditional, 1.0);
        (ir, [e, h1, h2, b2, l1])
    }

    #[test]
    fn test_dominators() {
        let (ir, [e, h1, h2, b2, l1]) = nested();
        let dom = DominatorTree::compute(&ir);
        assert_eq!(dom.idom(h1), Some(e));
        assert_eq!(dom.idom(h2), Some(h1));
        assert_eq!(dom.idom(b2), Some(h2));
        assert_eq!(dom.idom(l1), Some(h2));
        assert!(dom.dominates(h1, l1));
        assert!(!dom.dominates(b2, l1));
        assert_eq!(dom.idom(e), None);
    }

    #[test]
    fn test_loop_nesting() {
        let (ir, [_, h1, h2, b2, l1]) = nested();
        let dom = DominatorTree::compute(&ir);
        let loops = LoopTree::compute(&ir, &dom);
        assert_eq!(loops.len(), 2);
        let outer = loops.loop_with_header(h1).unwrap();
        let inner = loops.loop_with_header(h2).unwrap();
        assert!(loops.encloses(outer, inner));
        assert!(!loops.encloses(inner, outer));
        assert_eq!(loops.get(inner).depth, 2);
        assert_eq!(loops.loop_of(b2), Some(inner));
        assert_eq!(loops.loop_of(l1), Some(outer));
        assert!(loops.get(outer).contains(b2));
        assert_eq!(loops.innermost_loops().collect::<Vec<_>>(), vec![inner]);
    }
}
