//! Natural-loop detection and trip-count bounds.
//!
//! A back edge is an edge `latch -> header` where the header dominates the
//! latch.  The loop body is everything that reaches the latch without
//! passing through the header.  Trip counts are recognized only for the
//! counted-loop shape produced by ordinary lowering: an induction phi with
//! a constant start, a constant positive step, and an exit branch
//! controlled by a comparison of the induction value against a constant
//! bound.  Anything else reports no bound, which the safepoint pass treats
//! as potentially unbounded.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::dom::DomTree;
use super::*;

#[derive(Clone, Debug)]
pub struct Loop {
    pub header: BbId,
    /// In-loop predecessors of the header.
    pub latches: Vec<BbId>,
    pub body: Set<BbId>,
}

impl Loop {
    pub fn contains(&self, bb: &BbId) -> bool {
        self.body.contains(bb)
    }
}

/// All natural loops of the function, keyed by header.
pub fn find_loops(f: &Function, dom: &DomTree) -> Vec<Loop> {
    // back edges
    let mut latches_of: Map<BbId, Vec<BbId>> = Map::new();
    for bbid in dom.rpo() {
        for succ in f.body[bbid].term.succs() {
            if dom.dominates(succ, bbid) {
                let latches = latches_of.entry(succ.clone()).or_default();
                if !latches.contains(bbid) {
                    latches.push(bbid.clone());
                }
            }
        }
    }

    // body by backward reachability from the latches, stopping at the header
    let mut loops = vec![];
    for (header, latches) in latches_of {
        let mut body: Set<BbId> = [header.clone()].into();
        let mut worklist = latches.clone();
        while let Some(bb) = worklist.pop() {
            if !body.insert(bb.clone()) {
                continue;
            }
            for pred in dom.preds(&bb) {
                if dom.is_reachable(pred) {
                    worklist.push(pred.clone());
                }
            }
        }
        loops.push(Loop {
            header,
            latches,
            body,
        });
    }
    loops
}

/// A compile-time bound on the number of iterations, when one is provable.
/// Only positive finite bounds are reported.
pub fn trip_count(f: &Function, l: &Loop) -> Option<u64> {
    let header = &f.body[&l.header];

    // induction phi: constant from outside the loop, in-loop increment
    for inst in &header.insts {
        let Instruction::Phi { lhs, args } = inst else {
            break;
        };
        if !lhs.ty().is_int() || args.len() != 2 {
            continue;
        }

        let mut start = None;
        let mut next = None;
        for (pred, op) in args {
            match (l.contains(pred), op) {
                (false, Operand::CInt(n)) => start = Some(*n),
                (true, Operand::Var(v)) => next = Some(v.clone()),
                _ => {}
            }
        }
        let (Some(start), Some(next)) = (start, next) else {
            continue;
        };

        // the increment feeding the phi around the back edge
        let Some(step) = find_step(f, l, lhs, &next) else {
            continue;
        };

        // an exit branch comparing the induction value against a constant
        if let Some(n) = find_exit_bound(f, l, lhs, &next, start, step) {
            return Some(n);
        }
    }

    None
}

// `next = $arith add lhs, c` inside the loop, with positive step
fn find_step(f: &Function, l: &Loop, ind: &ValueId, next: &ValueId) -> Option<i64> {
    for bbid in &l.body {
        for inst in &f.body[bbid].insts {
            if let Instruction::Arith {
                lhs,
                aop: ArithOp::Add,
                op1,
                op2,
            } = inst
            {
                if lhs != next {
                    continue;
                }
                let step = match (op1, op2) {
                    (Operand::Var(v), Operand::CInt(c)) if v == ind => *c,
                    (Operand::CInt(c), Operand::Var(v)) if v == ind => *c,
                    _ => continue,
                };
                if step > 0 {
                    return Some(step);
                }
            }
        }
    }
    None
}

// a conditional branch in the loop that leaves the loop once the induction
// value passes a constant bound
fn find_exit_bound(
    f: &Function,
    l: &Loop,
    ind: &ValueId,
    next: &ValueId,
    start: i64,
    step: i64,
) -> Option<u64> {
    for bbid in &l.body {
        let block = &f.body[bbid];
        let Terminal::Branch { cond, tt, ff } = &block.term else {
            continue;
        };
        // exactly one side must exit the loop
        if l.contains(tt) == l.contains(ff) {
            continue;
        }
        let stays_on_true = l.contains(tt);

        let Operand::Var(cond_var) = cond else {
            continue;
        };
        for inst in &block.insts {
            let Instruction::Cmp {
                lhs,
                rop,
                op1,
                op2,
            } = inst
            else {
                continue;
            };
            if lhs != cond_var {
                continue;
            }

            // normalize to `v <op> bound`
            let (v, rop, bound) = match (op1, op2) {
                (Operand::Var(v), Operand::CInt(c)) => (v, *rop, *c),
                (Operand::CInt(c), Operand::Var(v)) => (v, flip(*rop), *c),
                _ => continue,
            };
            // the comparison must continue the loop while it holds
            let rop = if stays_on_true { rop } else { negate(rop) };

            let from_next = if v == next {
                true
            } else if v == ind {
                false
            } else {
                continue;
            };

            let iters = count_iterations(rop, start, step, bound, from_next)?;
            if iters > 0 {
                return Some(iters);
            }
            return None;
        }
    }
    None
}

fn flip(rop: CmpOp) -> CmpOp {
    match rop {
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::Le => CmpOp::Ge,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::Ge => CmpOp::Le,
        other => other,
    }
}

fn negate(rop: CmpOp) -> CmpOp {
    match rop {
        CmpOp::Eq => CmpOp::Ne,
        CmpOp::Ne => CmpOp::Eq,
        CmpOp::Lt => CmpOp::Ge,
        CmpOp::Le => CmpOp::Gt,
        CmpOp::Gt => CmpOp::Le,
        CmpOp::Ge => CmpOp::Lt,
    }
}

/// Iterations of `for (i = start; i ROP bound; i += step)`, where the
/// comparison may read the pre- or post-increment value.
fn count_iterations(rop: CmpOp, start: i64, step: i64, bound: i64, from_next: bool) -> Option<u64> {
    debug_assert!(step > 0);

    // with the post-increment value the loop continues while `i + step`
    // satisfies the bound, which shifts the effective start
    let start = if from_next { start + step } else { start };

    let remaining = match rop {
        CmpOp::Lt => (bound - 1).checked_sub(start)?,
        CmpOp::Le => bound.checked_sub(start)?,
        CmpOp::Ne if (bound - start) % step == 0 => bound.checked_sub(start)? - 1,
        _ => return None,
    };
    if remaining < 0 {
        return None;
    }

    Some((remaining as u64) / (step as u64) + 1)
}
