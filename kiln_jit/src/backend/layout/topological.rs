//! Topological layout: reverse postorder. Needs no profile.

use crate::backend::machine::{MachineCfg, NodeId};

pub(super) fn order(cfg: &MachineCfg) -> Vec<NodeId> {
    cfg.rpo()
}
