//! Relocation rewriting.
//!
//! After materialization, uses of the original live values still read the
//! pre-statepoint definitions.  Updating SSA directly would mean placing
//! phis by hand at every join the relocated values flow through; instead
//! the pass lifts each live value to a stack slot, lets the statepoints
//! store their relocated values into the slots, rewrites every use into a
//! load, and promotes the slots straight back to SSA registers:
//!
//! 1. one entry-block slot per distinct live value;
//! 2. a store of each definition into its slot, right after the def
//!    (parameters store at the top of the entry block);
//! 3. after each statepoint, a store of every relocated value into its
//!    slot, and a null store into every slot the site did not relocate:
//!    those values are dead past here, and a poisoned slot turns a stale
//!    read into an immediate crash instead of a silent wrong pointer;
//! 4. a load in front of every use, with phi operands loading at the end
//!    of the incoming block;
//! 5. SSA promotion of the slots.
//!
//! Every use is visited by a full scan of every block, with no dominance
//! shortcuts: a phi can sit outside the region the new definitions
//! dominate and still deserve rewriting.  The slot count is checked to
//! return to zero.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use log::trace;

use crate::ir::inline::NameGenerator;
use crate::ir::mem2reg;
use crate::ir::*;

use super::*;

pub fn rewrite_relocations(
    f: &mut Function,
    records: &mut [SafepointRecord],
    namer: &mut NameGenerator,
) {
    // 1. a slot per distinct live value across the whole function
    let all_live: Set<ValueId> = records
        .iter()
        .flat_map(|r| r.live_order.iter().cloned())
        .collect();
    let slot_of: Map<ValueId, ValueId> = all_live
        .iter()
        .map(|v| {
            let slot = namer.fresh_var(&format!("{}.slot", v.name()), ptr_ty(v.ty()));
            (v.clone(), slot)
        })
        .collect();

    // the end of each statepoint sequence, for placing relocation stores
    let last_of: Map<ValueId, usize> = records
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.last.clone().map(|l| (l, i)))
        .collect();

    // phi operands are uses at the end of the incoming block; collect them
    // up front since they rewrite across block boundaries
    // pred -> [(succ, phi lhs, live value)]
    let mut phi_uses: Map<BbId, Vec<(BbId, ValueId, ValueId)>> = Map::new();
    for (bbid, bb) in &f.body {
        for inst in &bb.insts {
            let Instruction::Phi { lhs, args } = inst else {
                break;
            };
            for (pred, op) in args {
                if let Some(v) = op.as_var() {
                    if all_live.contains(v) {
                        phi_uses.entry(pred.clone()).or_default().push((
                            bbid.clone(),
                            lhs.clone(),
                            v.clone(),
                        ));
                    }
                }
            }
        }
    }

    // 2-4. rebuild every block
    let mut phi_arg_rewrites: Vec<(BbId, ValueId, BbId, ValueId, ValueId)> = vec![];
    let block_ids: Vec<BbId> = f.body.keys().cloned().collect();
    for bbid in &block_ids {
        let block = f.body.get_mut(bbid).unwrap();
        let old = std::mem::take(&mut block.insts);
        let mut new: Vec<Instruction> = vec![];
        let mut phi_def_stores: Vec<Instruction> = vec![];
        let mut in_phi_prefix = true;

        for mut inst in old {
            if !inst.is_phi() {
                if in_phi_prefix {
                    new.append(&mut phi_def_stores);
                    in_phi_prefix = false;
                }
                // a load in front of each use of a live value
                let mut reloads: Map<ValueId, ValueId> = Map::new();
                for op in inst.operands_mut() {
                    let Operand::Var(v) = op else { continue };
                    if !all_live.contains(v) {
                        continue;
                    }
                    let reload = reloads.entry(v.clone()).or_insert_with(|| {
                        namer.fresh_var(&format!("{}.reload", v.name()), v.ty())
                    });
                    *op = Operand::Var(reload.clone());
                }
                for (v, reload) in reloads {
                    new.push(Instruction::Load {
                        lhs: reload,
                        src: Operand::Var(slot_of[&v].clone()),
                    });
                }
            }

            let lhs = inst.lhs().cloned();
            let is_phi = inst.is_phi();
            new.push(inst);

            // a store right after each def of a live value; phi defs wait
            // for the end of the phi prefix
            if let Some(lhs) = &lhs {
                if all_live.contains(lhs) {
                    let store = Instruction::Store {
                        dst: Operand::Var(slot_of[lhs].clone()),
                        op: Operand::Var(lhs.clone()),
                    };
                    if is_phi {
                        phi_def_stores.push(store);
                    } else {
                        new.push(store);
                    }
                }
            }

            // after the last instruction of a statepoint sequence: store
            // the relocated values, poison everything else
            if let Some(rec_idx) = lhs.as_ref().and_then(|l| last_of.get(l)) {
                let rec = &records[*rec_idx];
                for (derived, relocated) in &rec.relocations {
                    new.push(Instruction::Store {
                        dst: Operand::Var(slot_of[derived].clone()),
                        op: Operand::Var(relocated.clone()),
                    });
                }
                for v in &all_live {
                    if rec.relocations.contains_key(v) || rec.result.as_ref() == Some(v) {
                        continue;
                    }
                    new.push(Instruction::Store {
                        dst: Operand::Var(slot_of[v].clone()),
                        op: Operand::Null(v.ty()),
                    });
                }
            }
        }
        if in_phi_prefix {
            new.append(&mut phi_def_stores);
        }

        // loads feeding the terminator and the successors' phis
        let block = f.body.get_mut(bbid).unwrap();
        let mut reloads: Map<ValueId, ValueId> = Map::new();
        for op in block.term.operands_mut() {
            let Operand::Var(v) = op else { continue };
            if !all_live.contains(v) {
                continue;
            }
            let reload = reloads
                .entry(v.clone())
                .or_insert_with(|| namer.fresh_var(&format!("{}.reload", v.name()), v.ty()));
            *op = Operand::Var(reload.clone());
        }
        for (succ, phi, v) in phi_uses.remove(bbid).unwrap_or_default() {
            let reload = reloads
                .entry(v.clone())
                .or_insert_with(|| namer.fresh_var(&format!("{}.reload", v.name()), v.ty()))
                .clone();
            phi_arg_rewrites.push((succ, phi, bbid.clone(), v, reload));
        }
        for (v, reload) in reloads {
            new.push(Instruction::Load {
                lhs: reload,
                src: Operand::Var(slot_of[&v].clone()),
            });
        }

        f.body.get_mut(bbid).unwrap().insts = new;
    }

    for (succ, phi, pred, v, reload) in phi_arg_rewrites {
        let block = f.body.get_mut(&succ).unwrap();
        for inst in &mut block.insts {
            let Instruction::Phi { lhs, args } = inst else {
                continue;
            };
            if *lhs != phi {
                continue;
            }
            for (p, op) in args {
                if *p == pred && op.as_var() == Some(&v) {
                    *op = Operand::Var(reload.clone());
                }
            }
        }
    }

    // the slots themselves sit at the top of the entry block, after any
    // phis, followed by the stores of the parameters
    {
        let defs: Set<ValueId> = f.local_values();
        let entry = f.entry_id();
        let block = f.body.get_mut(&entry).unwrap();
        let at = block.insts.iter().position(|i| !i.is_phi()).unwrap_or(block.insts.len());
        let mut prefix: Vec<Instruction> = slot_of
            .values()
            .map(|slot| Instruction::Alloca { lhs: slot.clone() })
            .collect();
        for v in &all_live {
            if !defs.contains(v) {
                // parameters (and, in test mode, other defless sources)
                prefix.push(Instruction::Store {
                    dst: Operand::Var(slot_of[v].clone()),
                    op: Operand::Var(v.clone()),
                });
            }
        }
        block.insts.splice(at..at, prefix);
    }

    // 5. promote the slots back out of memory
    let slots: Vec<ValueId> = slot_of.values().cloned().collect();
    let eliminated = mem2reg::promote_slots(f, &slots, namer);
    assert_eq!(
        eliminated,
        slots.len(),
        "relocation slots survived promotion"
    );
    trace!("{}: promoted {eliminated} relocation slots", f.id);

    for rec in records.iter_mut() {
        rec.advance(SiteState::Rewritten);
    }
}
