//! Promotion of stack slots to SSA registers.
//!
//! The classic two-step algorithm: place phis for each slot at the
//! iterated dominance frontier of its store blocks, then walk the
//! dominator tree renaming loads to the reaching stored value.  Only slots
//! whose every use is a direct load or store are promoted; anything else
//! (an escaping slot) is left alone.
//!
//! The function must not contain unreachable blocks: phi operands are
//! filled along visited CFG edges, and an unvisited predecessor would leave
//! a hole.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::dom::DomTree;
use super::inline::NameGenerator;
use super::*;

/// Promote the given alloca slots out of memory.  Returns how many slots
/// were eliminated.
pub fn promote_slots(f: &mut Function, slots: &[ValueId], namer: &mut NameGenerator) -> usize {
    let promotable: Vec<ValueId> = slots
        .iter()
        .filter(|s| is_promotable(f, s))
        .cloned()
        .collect();
    if promotable.is_empty() {
        return 0;
    }

    let dom = DomTree::new(f);

    // phi placement at the iterated dominance frontier of the store blocks
    let frontiers = dom.dominance_frontiers();
    // lhs of every inserted phi, mapped to its slot
    let mut phi_slots: Map<ValueId, ValueId> = Map::new();
    for slot in &promotable {
        let pointee = slot.ty().pointee().unwrap();
        let mut worklist: Vec<BbId> = store_blocks(f, slot);
        let mut placed: Set<BbId> = Set::new();
        while let Some(bb) = worklist.pop() {
            for d in frontiers.get(&bb).into_iter().flatten() {
                if !placed.insert(d.clone()) {
                    continue;
                }
                let lhs = namer.fresh_var(&format!("{}.phi", slot.name()), pointee.clone());
                phi_slots.insert(lhs.clone(), slot.clone());
                f.body.get_mut(d).unwrap().insts.insert(
                    0,
                    Instruction::Phi {
                        lhs,
                        args: vec![],
                    },
                );
                worklist.push(d.clone());
            }
        }
    }

    // renaming walk over the dominator tree
    let children = dom.children();
    let mut renames: Map<ValueId, Operand> = Map::new();
    let mut stack: Vec<(BbId, Map<ValueId, Operand>)> = vec![(
        f.entry_id(),
        promotable
            .iter()
            .map(|s| (s.clone(), Operand::Undef(s.ty().pointee().unwrap())))
            .collect(),
    )];

    while let Some((bbid, mut current)) = stack.pop() {
        let block = &f.body[&bbid];
        for inst in &block.insts {
            match inst {
                Instruction::Phi { lhs, .. } if phi_slots.contains_key(lhs) => {
                    current.insert(phi_slots[lhs].clone(), Operand::Var(lhs.clone()));
                }
                Instruction::Load { lhs, src: Operand::Var(s) }
                    if current.contains_key(s) =>
                {
                    renames.insert(lhs.clone(), current[s].clone());
                }
                Instruction::Store { dst: Operand::Var(s), op }
                    if current.contains_key(s) =>
                {
                    current.insert(s.clone(), op.clone());
                }
                _ => {}
            }
        }

        // fill phi operands along the outgoing edges, once per successor
        // even when a branch names the same target twice
        let succs: Set<BbId> = block.term.succs().into_iter().cloned().collect();
        for succ in succs {
            let succ_block = f.body.get_mut(&succ).unwrap();
            for inst in &mut succ_block.insts {
                let Instruction::Phi { lhs, args } = inst else {
                    break;
                };
                if let Some(slot) = phi_slots.get(lhs) {
                    args.push((bbid.clone(), current[slot].clone()));
                }
            }
        }

        for child in children.get(&bbid).into_iter().flatten() {
            stack.push((child.clone(), current.clone()));
        }
    }

    // rewrite every use through the rename map and drop the memory traffic
    let resolve = |mut op: Operand| -> Operand {
        while let Operand::Var(v) = &op {
            match renames.get(v) {
                Some(next) => op = next.clone(),
                None => break,
            }
        }
        op
    };

    let slot_set: Set<&ValueId> = promotable.iter().collect();
    let mut eliminated = 0;
    for bb in f.body.values_mut() {
        bb.insts.retain(|inst| match inst {
            Instruction::Alloca { lhs } if slot_set.contains(lhs) => {
                eliminated += 1;
                false
            }
            Instruction::Load { src: Operand::Var(s), .. }
            | Instruction::Store { dst: Operand::Var(s), .. }
                if slot_set.contains(s) =>
            {
                false
            }
            _ => true,
        });
        for inst in &mut bb.insts {
            for op in inst.operands_mut() {
                *op = resolve(op.clone());
            }
        }
        for op in bb.term.operands_mut() {
            *op = resolve(op.clone());
        }
    }

    prune_dead_phis(f, phi_slots.keys().cloned().collect());

    eliminated
}

// The placement step is not pruned, so phis can come out with no readers;
// drop them until none are left.  Mutually dependent cycles are kept.
fn prune_dead_phis(f: &mut Function, mut candidates: Set<ValueId>) {
    loop {
        let mut used: Set<ValueId> = Set::new();
        for bb in f.body.values() {
            for inst in &bb.insts {
                for op in inst.operands() {
                    if let Some(v) = op.as_var() {
                        if candidates.contains(v) && inst.lhs() != Some(v) {
                            used.insert(v.clone());
                        }
                    }
                }
            }
            for op in bb.term.operands() {
                if let Some(v) = op.as_var() {
                    used.insert(v.clone());
                }
            }
        }

        let dead: Set<ValueId> = candidates.difference(&used).cloned().collect();
        if dead.is_empty() {
            return;
        }
        for bb in f.body.values_mut() {
            bb.insts
                .retain(|inst| !matches!(inst.lhs(), Some(lhs) if dead.contains(lhs)));
        }
        candidates = candidates.intersection(&used).cloned().collect();
    }
}

// every use of the slot value is a direct load or store address
fn is_promotable(f: &Function, slot: &ValueId) -> bool {
    let mut seen_alloca = false;
    for bb in f.body.values() {
        for inst in &bb.insts {
            match inst {
                Instruction::Alloca { lhs } if lhs == slot => seen_alloca = true,
                Instruction::Load { src: Operand::Var(s), .. } if s == slot => {}
                Instruction::Store { dst: Operand::Var(s), op } if s == slot => {
                    // storing the slot's own address through itself escapes
                    if op.as_var() == Some(slot) {
                        return false;
                    }
                }
                _ => {
                    if inst
                        .operands()
                        .iter()
                        .any(|op| op.as_var() == Some(slot))
                    {
                        return false;
                    }
                }
            }
        }
        if bb.term.operands().iter().any(|op| op.as_var() == Some(slot)) {
            return false;
        }
    }
    seen_alloca
}

fn store_blocks(f: &Function, slot: &ValueId) -> Vec<BbId> {
    let mut blocks = vec![];
    for (bbid, bb) in &f.body {
        for inst in &bb.insts {
            if let Instruction::Store { dst: Operand::Var(s), .. } = inst {
                if s == slot {
                    blocks.push(bbid.clone());
                    break;
                }
            }
        }
    }
    blocks
}
