//! Basic-block code layout.
//!
//! Every strategy returns an order of the reachable nodes starting at the
//! entry. [`linearize`] threads that order through `layout_succ`, then a
//! fix-up pass makes the code agree with it:
//!
//! - a conditional branch whose true target follows it is inverted, so the
//!   false edge falls through
//! - a conditional branch with neither target next gets a jump block on its
//!   false edge
//! - an unconditional edge whose target does not follow gets a `br`
//!
//! Afterwards every node has one layout successor except the last, and no
//! true edge falls through.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────┐    ┌──────────┐
//! │   strategy   │───▶│  link chain  │───▶│  fix-up  │───▶│  verify  │
//! │ (node order) │    │ (layout_succ)│    │ (jumps)  │    │ (debug)  │
//! └──────────────┘    └──────────────┘    └──────────┘    └──────────┘
//! ```

mod bottom_up;
mod top_down;
mod topological;

use super::machine::{MachineCfg, MEdgeId, MInst, NodeId};
use crate::codegen::callback::EdgeTag;
use kiln_core::{ice, CompileResult, Location};
use tracing::debug;

const PASS: &str = "layout";

// =============================================================================
// Configuration
// =============================================================================

/// Layout strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutStrategy {
    /// Bottom-up with a profile, topological without.
    Auto,
    /// Reverse postorder.
    Topological,
    /// Greedy fallthrough choice from the entry.
    TopDown,
    /// Global chain merging over edges by weight.
    BottomUp,
}

/// Configuration for block layout.
#[derive(Debug, Clone)]
pub struct LayoutConfig {
    pub strategy: LayoutStrategy,
    /// Top-down treats successors whose probability is at least
    /// `tie_ratio * best` as tied.
    pub tie_ratio: f64,
    /// Check the layout postcondition.
    pub verify: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            strategy: LayoutStrategy::Auto,
            tie_ratio: 0.9,
            verify: cfg!(debug_assertions),
        }
    }
}

impl LayoutConfig {
    pub fn with_strategy(strategy: LayoutStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Test configuration: postcondition always checked.
    pub fn for_testing(strategy: LayoutStrategy) -> Self {
        Self {
            strategy,
            verify: true,
            ..Self::default()
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from block layout.
#[derive(Debug, Clone)]
pub struct LayoutStats {
    /// Strategy actually run, never `Auto`.
    pub strategy: LayoutStrategy,
    pub blocks: usize,
    /// Edges that fall through after fix-up.
    pub fallthroughs: usize,
    pub branches_inverted: usize,
    /// `br` instructions added, in jump blocks or at node ends.
    pub jumps_inserted: usize,
    pub jump_blocks: usize,
    /// Method size in bytes.
    pub code_size: u32,
}

impl LayoutStats {
    fn new(strategy: LayoutStrategy) -> Self {
        Self {
            strategy,
            blocks: 0,
            fallthroughs: 0,
            branches_inverted: 0,
            jumps_inserted: 0,
            jump_blocks: 0,
            code_size: 0,
        }
    }
}

// =============================================================================
// Edge queries shared by the strategies
// =============================================================================

/// Probability with the "no profile" sentinel read as zero.
#[inline]
pub(crate) fn prob(cfg: &MachineCfg, e: MEdgeId) -> f64 {
    cfg.edge(e).prob.max(0.0)
}

/// Execution weight: source count times probability.
#[inline]
pub(crate) fn weight(cfg: &MachineCfg, e: MEdgeId) -> f64 {
    cfg.node(cfg.edge(e).source).exec_count.max(0.0) * prob(cfg, e)
}

/// Whether `e` may become its source's fallthrough edge, inverting the
/// source's branch when `e` is its true edge.
pub(crate) fn can_fall_through(cfg: &MachineCfg, e: MEdgeId) -> bool {
    let edge = cfg.edge(e);
    let source = cfg.node(edge.source);
    if source.is_codeless() || edge.source == edge.target {
        return false;
    }
    if cfg.last_inst(edge.source).is_some_and(MInst::ends_flow) {
        return false;
    }
    match edge.kind {
        EdgeTag::Unconditional | EdgeTag::False => true,
        EdgeTag::True => cfg.can_invert(edge.source),
        _ => false,
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Lay out `cfg` and make its branches agree with the chosen order.
pub fn linearize(cfg: &mut MachineCfg, config: &LayoutConfig) -> CompileResult<LayoutStats> {
    let strategy = match config.strategy {
        LayoutStrategy::Auto if cfg.has_profile => LayoutStrategy::BottomUp,
        LayoutStrategy::Auto => LayoutStrategy::Topological,
        s => s,
    };
    let order = match strategy {
        LayoutStrategy::TopDown => top_down::order(cfg, config.tie_ratio),
        LayoutStrategy::BottomUp => bottom_up::order(cfg),
        _ => topological::order(cfg),
    };
    let mut stats = LayoutStats::new(strategy);
    stats.blocks = order.len();
    link(cfg, &order);
    fix_up(cfg, &mut stats);
    if config.verify {
        verify(cfg)?;
    }
    stats.code_size = cfg.assign_code_offsets();
    debug!(
        method = %cfg.name,
        strategy = ?strategy,
        blocks = stats.blocks,
        fallthroughs = stats.fallthroughs,
        inverted = stats.branches_inverted,
        jumps = stats.jumps_inserted,
        "laid out"
    );
    Ok(stats)
}

fn link(cfg: &mut MachineCfg, order: &[NodeId]) {
    for n in cfg.node_ids().collect::<Vec<_>>() {
        cfg.node_mut(n).layout_succ = None;
    }
    for pair in order.windows(2) {
        cfg.node_mut(pair[0]).layout_succ = Some(pair[1]);
    }
}

fn fix_up(cfg: &mut MachineCfg, stats: &mut LayoutStats) {
    for n in cfg.layout_order() {
        if cfg.node(n).is_codeless() {
            continue;
        }
        let succ = cfg.node(n).layout_succ;
        let t = cfg.out_edge_of_kind(n, EdgeTag::True);
        let f = cfg.out_edge_of_kind(n, EdgeTag::False);
        if let (Some(t), Some(f)) = (t, f) {
            if Some(cfg.edge(f).target) == succ {
                stats.fallthroughs += 1;
            } else if Some(cfg.edge(t).target) == succ && cfg.invert_branch(n) {
                stats.branches_inverted += 1;
                stats.fallthroughs += 1;
            } else {
                let jump = cfg.split_edge(f);
                cfg.append(jump, MInst::jump());
                cfg.node_mut(jump).layout_succ = succ;
                cfg.node_mut(n).layout_succ = Some(jump);
                stats.jump_blocks += 1;
                stats.jumps_inserted += 1;
                stats.fallthroughs += 1;
                stats.blocks += 1;
            }
            continue;
        }
        let Some(u) = cfg.out_edge_of_kind(n, EdgeTag::Unconditional) else {
            continue;
        };
        if cfg.last_inst(n).is_some_and(MInst::ends_flow) {
            continue;
        }
        if Some(cfg.edge(u).target) == succ {
            stats.fallthroughs += 1;
        } else {
            cfg.append(n, MInst::jump());
            stats.jumps_inserted += 1;
        }
    }
}

/// Check the layout postcondition: one chain from the entry covering every
/// reachable node, and every fallthrough is an unconditional or false edge
/// into the layout successor.
pub fn verify(cfg: &MachineCfg) -> CompileResult<()> {
    let reachable = cfg.rpo();
    let chain = cfg.layout_order();
    if let Some(&last) = chain.last() {
        if cfg.node(last).layout_succ.is_some() {
            ice!(PASS, Location::Block(last.index()), "layout chain loops back");
        }
    }
    let mut in_chain = vec![false; cfg.node_count()];
    for &n in &chain {
        in_chain[n.as_usize()] = true;
    }
    if let Some(&n) = reachable.iter().find(|n| !in_chain[n.as_usize()]) {
        ice!(PASS, Location::Block(n.index()), "reachable node missing from layout chain");
    }

    for &n in &chain {
        if cfg.node(n).is_codeless() {
            continue;
        }
        let succ = cfg.node(n).layout_succ;
        let t = cfg.out_edge_of_kind(n, EdgeTag::True);
        let f = cfg.out_edge_of_kind(n, EdgeTag::False);
        if let (Some(t), Some(f)) = (t, f) {
            let (tt, ft) = (cfg.edge(t).target, cfg.edge(f).target);
            if Some(ft) != succ {
                if Some(tt) == succ {
                    ice!(PASS, Location::Block(n.index()), "true edge left as fallthrough");
                }
                ice!(PASS, Location::Block(n.index()), "false edge does not fall through");
            }
            continue;
        }
        if let Some(u) = cfg.out_edge_of_kind(n, EdgeTag::Unconditional) {
            let jumps = cfg.last_inst(n).is_some_and(MInst::ends_flow);
            if !jumps && Some(cfg.edge(u).target) != succ {
                ice!(PASS, Location::Block(n.index()), "unconditional edge falls into the wrong node");
            }
        }
    }
    Ok(())
}
