//! Static analysis of IR functions.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::ir::*;

pub mod liveness;

#[cfg(test)]
mod tests;

/// Instruction IDs: this is just a combination of the basic block ID and the
/// index of the instruction in the block.
pub type InstId = (BbId, usize);

/// The control-flow graph *for a function*, abstracted so that we can easily
/// get successors and predecessors for both forward and backward walks.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub entry: BbId,
    succ_edges: Map<BbId, Set<BbId>>,
    pred_edges: Map<BbId, Set<BbId>>,
}

impl Cfg {
    // construct a Cfg from the given function's basic blocks.
    pub fn new(function: &Function) -> Self {
        let entry = function.entry_id();
        let mut succ_edges: Map<BbId, Set<BbId>> = Map::new();
        let mut pred_edges: Map<BbId, Set<BbId>> = Map::new();

        for bbid in function.body.keys() {
            succ_edges.insert(bbid.clone(), Set::new());
            pred_edges.insert(bbid.clone(), Set::new());
        }

        for (bbid, bb) in &function.body {
            for succ in bb.term.succs() {
                succ_edges.get_mut(bbid).unwrap().insert(succ.clone());
                pred_edges.get_mut(succ).unwrap().insert(bbid.clone());
            }
        }

        Cfg {
            entry,
            succ_edges,
            pred_edges,
        }
    }

    // an iterator over the successor edges of bb.
    pub fn succ(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.succ_edges[bb].iter()
    }

    // an iterator over the predecessor edges of bb.
    pub fn pred(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.pred_edges[bb].iter()
    }

    /// Blocks reachable from the entry.
    pub fn reachable(&self) -> Set<BbId> {
        let mut visited = Set::new();
        let mut worklist = vec![self.entry.clone()];
        while let Some(bb) = worklist.pop() {
            if !visited.insert(bb.clone()) {
                continue;
            }
            for succ in self.succ(&bb) {
                worklist.push(succ.clone());
            }
        }
        visited
    }
}

/// Remove blocks that cannot be reached from the entry, pruning phi
/// operands that flowed in from removed blocks.  Returns the number of
/// blocks removed.
pub fn remove_unreachable_blocks(f: &mut Function) -> usize {
    let cfg = Cfg::new(f);
    let reachable = cfg.reachable();

    let before = f.body.len();
    f.body.retain(|bbid, _| reachable.contains(bbid));

    for bb in f.body.values_mut() {
        for inst in &mut bb.insts {
            if let Instruction::Phi { args, .. } = inst {
                args.retain(|(pred, _)| reachable.contains(pred));
            }
        }
    }

    before - f.body.len()
}
