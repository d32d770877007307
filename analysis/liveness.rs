//! Liveness of GC-pointer values.
//!
//! A value `v` of GC-pointer type is *live* at instruction `I` iff there is
//! a use `u` of `v` and a control-flow path from `I` to `u` that does not
//! pass through the definition of `v`.  The null and undef constants are
//! excluded by policy: they are never relocated, so tracking them is
//! pointless.
//!
//! Two modes are supported.  [Mode::Dataflow] runs a classic backward
//! fixpoint over the whole function once and answers per-site queries by
//! walking back from the block's live-out set.  [Mode::OnDemand] answers
//! each query by per-value reachability from the value's uses, without
//! whole-function state.  Both agree on validated input; the dataflow mode
//! is the default and the on-demand mode exists to cross-check it and to
//! serve callers that query only a few sites.
//!
//! Phi operands are uses *at the end of the corresponding incoming block*,
//! not at the phi itself: treating them as ordinary uses would leak a value
//! onto sibling edges where it may not even dominate.

use super::*;

/// Liveness mode selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Dataflow,
    OnDemand,
}

/// Per-block live-in/live-out sets.  Built once per liveness phase and
/// discarded with the engine.
#[derive(Clone, Debug, Default)]
pub struct LivenessMap {
    pub live_in: Map<BbId, Set<ValueId>>,
    pub live_out: Map<BbId, Set<ValueId>>,
}

pub struct LivenessEngine<'a> {
    f: &'a Function,
    cfg: &'a Cfg,
    mode: Mode,
    map: Option<LivenessMap>,
}

impl<'a> LivenessEngine<'a> {
    pub fn new(f: &'a Function, cfg: &'a Cfg, mode: Mode) -> Self {
        let map = match mode {
            Mode::Dataflow => Some(compute_live_map(f, cfg)),
            Mode::OnDemand => None,
        };
        LivenessEngine { f, cfg, mode, map }
    }

    /// The set of GC-pointer values live immediately after the instruction
    /// at `site`.  The instruction's own result is not part of the set, and
    /// neither are its operands unless something past the site reads them.
    pub fn live_after(&self, site: &InstId) -> Set<ValueId> {
        match self.mode {
            Mode::Dataflow => {
                let map = self.map.as_ref().unwrap();
                let block = &self.f.body[&site.0];
                let out = map.live_out.get(&site.0).cloned().unwrap_or_default();
                walk_back_to(block, out, site.1)
            }
            Mode::OnDemand => gc_candidates(self.f)
                .into_iter()
                .filter(|v| value_live_after(self.f, self.cfg, v, site))
                .collect(),
        }
    }
}

/// Every GC-pointer value the function defines (including parameters).
pub fn gc_candidates(f: &Function) -> Set<ValueId> {
    let mut vals: Set<ValueId> = f
        .params
        .iter()
        .filter(|p| p.ty().is_gc_ptr())
        .cloned()
        .collect();
    for bb in f.body.values() {
        for inst in &bb.insts {
            if let Some(lhs) = inst.lhs() {
                if lhs.ty().is_gc_ptr() {
                    vals.insert(lhs.clone());
                }
            }
        }
    }
    vals
}

// SECTION: dataflow mode

/// Backward dataflow to a fixed point over a worklist seeded with all
/// blocks.
pub fn compute_live_map(f: &Function, cfg: &Cfg) -> LivenessMap {
    let mut map = LivenessMap::default();
    for bbid in f.body.keys() {
        map.live_in.insert(bbid.clone(), Set::new());
        map.live_out.insert(bbid.clone(), Set::new());
    }

    let mut worklist: Vec<BbId> = f.body.keys().cloned().collect();
    while let Some(bbid) = worklist.pop() {
        let mut out = Set::new();
        for succ in cfg.succ(&bbid) {
            out.extend(map.live_in[succ].iter().cloned());
            out.extend(phi_uses_from(&f.body[succ], &bbid));
        }

        let block = &f.body[&bbid];
        let live_in = walk_back_to(block, out.clone(), usize::MAX);

        map.live_out.insert(bbid.clone(), out);
        if map.live_in[&bbid] != live_in {
            map.live_in.insert(bbid.clone(), live_in);
            for pred in cfg.pred(&bbid) {
                worklist.push(pred.clone());
            }
        }
    }

    map
}

/// GC values `block`'s phis read on the edge from `pred`.
fn phi_uses_from(block: &BasicBlock, pred: &BbId) -> Set<ValueId> {
    let mut uses = Set::new();
    for inst in &block.insts {
        let Instruction::Phi { args, .. } = inst else {
            break;
        };
        for (incoming, op) in args {
            if incoming == pred {
                if let Some(v) = op.as_gc_var() {
                    uses.insert(v.clone());
                }
            }
        }
    }
    uses
}

/// Walk a block backwards from its live-out set, stopping just after the
/// instruction at `stop`: for each instruction subtract its defined value,
/// then add its GC-pointer operands.  Phi operands are skipped (they are
/// edge uses), and the stop instruction contributes only its kill.  With
/// `stop == usize::MAX` this computes the block's live-in set.
fn walk_back_to(block: &BasicBlock, mut live: Set<ValueId>, stop: usize) -> Set<ValueId> {
    for op in block.term.operands() {
        if let Some(v) = op.as_gc_var() {
            live.insert(v.clone());
        }
    }

    for (i, inst) in block.insts.iter().enumerate().rev() {
        if i < stop {
            break;
        }
        if let Some(lhs) = inst.lhs() {
            live.remove(lhs);
        }
        if i == stop || inst.is_phi() {
            continue;
        }
        for op in inst.operands() {
            if let Some(v) = op.as_gc_var() {
                live.insert(v.clone());
            }
        }
    }

    live
}

// SECTION: on-demand mode

/// Whether `v` is live immediately after `site`, by reachability from the
/// value's uses.
fn value_live_after(f: &Function, cfg: &Cfg, v: &ValueId, site: &InstId) -> bool {
    value_live_after_with(f, cfg, v, site, &[])
}

/// Like [value_live_after], with additional use points the IR does not
/// carry yet.  The safepoint pass uses this for merges it has synthesized
/// but not wired into statepoints.
pub fn value_live_after_with(
    f: &Function,
    cfg: &Cfg,
    v: &ValueId,
    site: &InstId,
    extra_uses: &[InstId],
) -> bool {
    let defs = f.def_sites();
    let def = match defs.get(v) {
        Some(d) => d.clone(),
        None => return false,
    };

    let (site_bb, site_idx) = site;

    // the definition is at or past the site in the same block: the site's
    // own result is not live at the site, and later values do not exist
    // yet
    if let DefSite::Inst(db, di) = &def {
        if db == site_bb && *di >= *site_idx {
            return false;
        }
    }

    // positions of all uses; phi operands count at the end of the incoming
    // block, terminator operands at the end of their own block
    let mut uses = use_points(f, v);
    uses.extend(extra_uses.iter().cloned());

    // a use later in the site's own block keeps the value live directly
    let site_block_len = f.body[site_bb].insts.len();
    for (ub, up) in &uses {
        if ub == site_bb && *up > *site_idx && *up <= site_block_len {
            // in-block uses are only direct if the def does not sit between
            // the site and the use, which single assignment already rules
            // out here
            return true;
        }
    }

    // otherwise v must be live-out of the site's block: some use block is
    // backward-reachable from a successor without crossing the definition
    let live_in_blocks = blocks_live_in(f, cfg, &def, &uses);
    cfg.succ(site_bb).any(|s| live_in_blocks.contains(s))
}

/// All use points of `v` as (block, position) pairs.
fn use_points(f: &Function, v: &ValueId) -> Vec<(BbId, usize)> {
    let mut uses = vec![];
    for (bbid, bb) in &f.body {
        for (i, inst) in bb.insts.iter().enumerate() {
            if let Instruction::Phi { args, .. } = inst {
                for (pred, op) in args {
                    if op.as_var() == Some(v) {
                        uses.push((pred.clone(), f.body[pred].insts.len()));
                    }
                }
            } else if inst.operands().iter().any(|op| op.as_var() == Some(v)) {
                uses.push((bbid.clone(), i));
            }
        }
        if bb.term.operands().iter().any(|op| op.as_var() == Some(v)) {
            uses.push((bbid.clone(), bb.insts.len()));
        }
    }
    uses
}

/// The blocks into which `v` is live on entry.
fn blocks_live_in(
    f: &Function,
    cfg: &Cfg,
    def: &DefSite,
    uses: &[(BbId, usize)],
) -> Set<BbId> {
    let def_block = match def {
        DefSite::Param => None,
        DefSite::Inst(bb, _) => Some(bb.clone()),
    };

    let mut live_in = Set::new();
    let mut worklist = vec![];
    for (ub, _) in uses {
        // a use in the defining block is reached from the definition
        // without leaving the block
        if Some(ub) != def_block.as_ref() {
            worklist.push(ub.clone());
        }
    }

    while let Some(bb) = worklist.pop() {
        if !f.body.contains_key(&bb) || !live_in.insert(bb.clone()) {
            continue;
        }
        for pred in cfg.pred(&bb) {
            if Some(pred) != def_block.as_ref() {
                worklist.push(pred.clone());
            }
        }
    }

    live_in
}
