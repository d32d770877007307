//! Selection of poll locations and parse points.
//!
//! Three kinds of sites are nominated: one entry poll, one poll per
//! backedge of every loop the trip-count analysis cannot bound, and every
//! non-leaf call site.  The unsupported constructs (exception-edged calls,
//! computed branches, integer round-trips of GC pointers) cannot be
//! expressed in this IR, so there is nothing to fail fast on here; the one
//! representable precondition violation, `$inttoptr`, is rejected during
//! base resolution.

use std::collections::BTreeMap as Map;

use log::trace;

use crate::analysis::InstId;
use crate::ir::{loops, *};

use super::*;

/// The block whose terminator receives the entry poll: walk from the entry
/// through the chain of unique-successor / unique-predecessor blocks and
/// stop at the first split or merge.  Pushing the poll down the chain
/// shrinks the live set and keeps the placement stable however the entry
/// is later perturbed.
pub fn entry_poll_block(f: &Function) -> BbId {
    let mut pred_count: Map<BbId, usize> = Map::new();
    for bb in f.body.values() {
        for succ in bb.term.succs() {
            *pred_count.entry(succ.clone()).or_default() += 1;
        }
    }

    let mut visited = std::collections::BTreeSet::new();
    let mut cursor = f.entry_id();
    loop {
        let Terminal::Jump(next) = &f.body[&cursor].term else {
            return cursor;
        };
        // a cycle of straight-line blocks ends the chain too
        if pred_count[next] != 1 || !visited.insert(next.clone()) {
            return cursor;
        }
        cursor = next.clone();
    }
}

/// The latch blocks whose terminators receive backedge polls.  Loops with
/// a provable positive finite trip count cannot starve the collector and
/// are skipped unless `AllBackedges` is set.
pub fn backedge_poll_blocks(f: &Function, all_loops: &[loops::Loop], config: &Config) -> Vec<BbId> {
    let mut blocks = vec![];
    for l in all_loops {
        if !config.all_backedges {
            if let Some(n) = loops::trip_count(f, l) {
                trace!("loop at {} runs {n} times, no backedge poll", l.header);
                continue;
            }
        }
        blocks.extend(l.latches.iter().cloned());
    }
    blocks
}

/// Call sites that must become parse points.
pub fn call_parse_points(f: &Function, info: &ModuleInfo) -> Vec<InstId> {
    let mut sites = vec![];
    for (bbid, bb) in &f.body {
        for (i, inst) in bb.insts.iter().enumerate() {
            if let Instruction::Call { callee, .. } = inst {
                if needs_statepoint(callee, info) {
                    sites.push((bbid.clone(), i));
                } else {
                    trace!("skipping call to {callee} in {bbid}");
                }
            }
        }
    }
    sites
}

/// Whether a call to `callee` must be materialized as a statepoint.
/// Already-inserted statepoint machinery, the poll function itself,
/// GC-leaf callees, and intrinsics that never transition to the runtime
/// are skipped; `memset`/`memcpy`/`memmove` lower to libcalls and do need
/// the treatment.
pub(crate) fn needs_statepoint(callee: &FuncId, info: &ModuleInfo) -> bool {
    if is_statepoint_machinery(callee) || callee.name() == SAFEPOINT_POLL {
        return false;
    }
    if is_intrinsic(callee) {
        return intrinsic_needs_safepoint(callee);
    }
    !info.leaf.contains(callee)
}
