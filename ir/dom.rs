//! Dominator trees over a function's control-flow graph.
//!
//! Uses the iterative algorithm of Cooper, Harvey, and Kennedy over a
//! reverse-postorder numbering.  Unreachable blocks are not part of the
//! tree; queries involving them return false.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::*;

#[derive(Clone, Debug)]
pub struct DomTree {
    // reverse postorder over reachable blocks; entry is first
    rpo: Vec<BbId>,
    rpo_index: Map<BbId, usize>,
    // immediate dominators, indexed like rpo; idom[0] == 0
    idom: Vec<usize>,
    preds: Map<BbId, Vec<BbId>>,
}

impl DomTree {
    pub fn new(f: &Function) -> Self {
        let entry = f.entry_id();

        // predecessor edges, reachable blocks only
        let mut preds: Map<BbId, Vec<BbId>> = Map::new();
        let mut rpo = vec![];
        let mut state: Map<BbId, u8> = Map::new(); // 1 = open, 2 = done

        // iterative postorder DFS
        let mut stack = vec![(entry.clone(), 0usize)];
        state.insert(entry.clone(), 1);
        while let Some((bb, child)) = stack.pop() {
            let succs: Vec<BbId> = f.body[&bb].term.succs().into_iter().cloned().collect();
            if child == 0 {
                for s in &succs {
                    preds.entry(s.clone()).or_default().push(bb.clone());
                }
            }
            if child < succs.len() {
                stack.push((bb.clone(), child + 1));
                let next = succs[child].clone();
                if !state.contains_key(&next) {
                    state.insert(next.clone(), 1);
                    stack.push((next, 0));
                }
            } else {
                state.insert(bb.clone(), 2);
                rpo.push(bb);
            }
        }
        rpo.reverse();

        let rpo_index: Map<BbId, usize> = rpo
            .iter()
            .enumerate()
            .map(|(i, bb)| (bb.clone(), i))
            .collect();

        // iterate idoms to a fixed point
        let undef = usize::MAX;
        let mut idom = vec![undef; rpo.len()];
        idom[0] = 0;
        let mut changed = true;
        while changed {
            changed = false;
            for i in 1..rpo.len() {
                let mut new_idom = undef;
                for p in preds.get(&rpo[i]).into_iter().flatten() {
                    let Some(&pi) = rpo_index.get(p) else {
                        continue; // unreachable predecessor
                    };
                    if idom[pi] == undef {
                        continue;
                    }
                    new_idom = if new_idom == undef {
                        pi
                    } else {
                        intersect(&idom, new_idom, pi)
                    };
                }
                if new_idom != undef && idom[i] != new_idom {
                    idom[i] = new_idom;
                    changed = true;
                }
            }
        }

        DomTree {
            rpo,
            rpo_index,
            idom,
            preds,
        }
    }

    /// Reverse postorder over reachable blocks.
    pub fn rpo(&self) -> &[BbId] {
        &self.rpo
    }

    pub fn is_reachable(&self, bb: &BbId) -> bool {
        self.rpo_index.contains_key(bb)
    }

    pub fn idom(&self, bb: &BbId) -> Option<&BbId> {
        let &i = self.rpo_index.get(bb)?;
        if i == 0 {
            None
        } else {
            Some(&self.rpo[self.idom[i]])
        }
    }

    /// Whether `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: &BbId, b: &BbId) -> bool {
        let (Some(&ai), Some(&bi)) = (self.rpo_index.get(a), self.rpo_index.get(b)) else {
            return false;
        };
        let mut i = bi;
        loop {
            if i == ai {
                return true;
            }
            if i == 0 {
                return false;
            }
            i = self.idom[i];
        }
    }

    pub fn strictly_dominates(&self, a: &BbId, b: &BbId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Whether the program point `a` dominates the program point `b`.
    /// Points are (block, instruction index); an index past the end of the
    /// block denotes the terminator.
    pub fn dominates_inst(&self, a: (&BbId, usize), b: (&BbId, usize)) -> bool {
        if a.0 == b.0 {
            a.1 < b.1
        } else {
            self.dominates(a.0, b.0)
        }
    }

    /// Whether a definition site dominates the given use point.
    pub fn def_dominates(&self, def: &DefSite, bb: &BbId, idx: usize) -> bool {
        match def {
            DefSite::Param => self.is_reachable(bb),
            DefSite::Inst(db, di) => self.dominates_inst((db, *di), (bb, idx)),
        }
    }

    /// Dominance frontiers of every reachable block.
    pub fn dominance_frontiers(&self) -> Map<BbId, Set<BbId>> {
        let mut df: Map<BbId, Set<BbId>> = Map::new();
        for bb in &self.rpo {
            let preds = self.preds.get(bb).cloned().unwrap_or_default();
            let reachable: Vec<&BbId> = preds.iter().filter(|p| self.is_reachable(p)).collect();
            if reachable.len() < 2 {
                continue;
            }
            let bi = self.rpo_index[bb];
            for p in reachable {
                let mut runner = self.rpo_index[p];
                while runner != self.idom[bi] {
                    df.entry(self.rpo[runner].clone()).or_default().insert(bb.clone());
                    if runner == 0 {
                        break;
                    }
                    runner = self.idom[runner];
                }
            }
        }
        df
    }

    /// Children in the dominator tree, for tree walks.
    pub fn children(&self) -> Map<BbId, Vec<BbId>> {
        let mut ch: Map<BbId, Vec<BbId>> = Map::new();
        for (i, bb) in self.rpo.iter().enumerate().skip(1) {
            ch.entry(self.rpo[self.idom[i]].clone())
                .or_default()
                .push(bb.clone());
        }
        ch
    }

    pub fn preds(&self, bb: &BbId) -> &[BbId] {
        self.preds.get(bb).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

fn intersect(idom: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while a > b {
            a = idom[a];
        }
        while b > a {
            b = idom[b];
        }
    }
    a
}
