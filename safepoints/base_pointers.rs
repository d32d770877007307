//! Base-pointer resolution.
//!
//! Derived pointers arise from indexing, casting, and merges of these.
//! For the collector to relocate a derived pointer it must know which
//! object owns the backing storage: the *base*.  A base must be live
//! wherever the derived is live, and when several potential bases meet at
//! a phi or select, a merge of the bases has to be synthesized in the same
//! shape.
//!
//! Resolution works in two layers.  The *base-defining value* (BDV) of a
//! pointer classifies it by source: casts and index computations are
//! looked through, instructions that conjure a pointer out of nothing
//! (arguments, loads, call results, atomics) are their own BDV, and
//! merges are their own BDV until the lattice below decides for them.
//!
//! For merges, a three-valued lattice `Unknown ⊑ Base(b) ⊑ Conflict` is
//! propagated to a fixed point over the set of merges transitively
//! reachable through incoming BDVs.  `Base(b)` means every input agrees on
//! the single base `b`; `Conflict` means a new merge of bases must be
//! inserted.  Self-referential phis terminate through the lattice
//! naturally.  The table lives in an arena for the duration of one
//! resolution and is discarded afterwards.
//!
//! The cache spans the whole function and carries two relations over its
//! lifetime: the BDV relation while values are in flight, upgraded to the
//! base relation once a value is resolved.  Upgraded entries are stable,
//! which is what keeps repeated queries from synthesizing duplicate
//! merges.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use log::trace;

use crate::analysis::{liveness, Cfg, InstId};
use crate::ir::dom::DomTree;
use crate::ir::inline::NameGenerator;

use super::*;

// SECTION: the function-scoped cache

/// The base-defining-value cache.  `map` holds BDV entries for values
/// still in flight and base entries for values in `finalized`;
/// `inserted` marks the merges and casts this pass synthesized, which are
/// base values by construction.
#[derive(Default)]
pub struct BdvCache {
    map: Map<ValueId, Operand>,
    finalized: Set<ValueId>,
    inserted: Set<ValueId>,
}

// SECTION: the merge lattice

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LatticeVal {
    Unknown,
    Base(Operand),
    Conflict,
}

pub(crate) fn meet(a: &LatticeVal, b: &LatticeVal) -> LatticeVal {
    use LatticeVal::*;
    match (a, b) {
        (Unknown, x) | (x, Unknown) => x.clone(),
        (Conflict, _) | (_, Conflict) => Conflict,
        (Base(x), Base(y)) => {
            if x == y {
                Base(x.clone())
            } else {
                Conflict
            }
        }
    }
}

// the meet must be commutative; this is checked on every application
fn checked_meet(a: &LatticeVal, b: &LatticeVal) -> LatticeVal {
    let r = meet(a, b);
    debug_assert_eq!(r, meet(b, a), "base lattice meet is not commutative");
    r
}

// SECTION: entry points

/// Resolve a base for every live value of every record, synthesizing
/// merges where needed.  Returns the set of newly inserted values.
pub fn resolve_all(
    f: &mut Function,
    dom: &DomTree,
    namer: &mut NameGenerator,
    records: &mut [SafepointRecord],
    config: &Config,
) -> Result<Set<ValueId>, PassError> {
    let mut cache = BdvCache::default();

    for i in 0..records.len() {
        let live: Vec<ValueId> = records[i].live.iter().cloned().collect();
        for v in live {
            let base = find_base(f, namer, records, &mut cache, &v, config)?;
            trace!("base of {v} at {:?} is {base}", records[i].site);
            records[i].base_pairs.insert(v.clone(), base.clone());
            // bases are self-mapped wherever they appear
            records[i].base_pairs.insert(base.clone(), base);
        }
        records[i].new_defs = cache.inserted.clone();
    }

    // internal invariants: every pair well-typed and dominating
    let defs = f.def_sites();
    for rec in records.iter() {
        for (derived, base) in &rec.base_pairs {
            assert!(derived.ty().is_gc_ptr() && base.ty().is_gc_ptr());
            assert_eq!(rec.base_pairs.get(base), Some(base), "base is not self-mapped");
            if let (Some(bd), Some(dd)) = (defs.get(base), defs.get(derived)) {
                if let (DefSite::Inst(bb, _), DefSite::Inst(db, _)) = (bd, dd) {
                    assert!(
                        dom.dominates(bb, db),
                        "base {base} does not dominate derived {derived}"
                    );
                }
            }
        }
    }

    Ok(cache.inserted)
}

/// Fold the synthesized defs into the live sets of the sites they cross.
/// A new def is live at a site when its definition dominates the site and
/// one of its uses, present or pending (the statepoints that will consume
/// it as a base), is reachable from the site.  Each one is its own base.
pub fn integrate_new_defs(
    f: &Function,
    cfg: &Cfg,
    dom: &DomTree,
    records: &mut [SafepointRecord],
    new_defs: &Set<ValueId>,
) {
    // the recompute may have already picked up values with no pair yet
    // (bases whose live range the synthesized merges extended): self-map
    // them before the new defs are considered
    for rec in records.iter_mut() {
        let missing: Vec<ValueId> = rec
            .live
            .iter()
            .filter(|v| !rec.base_pairs.contains_key(*v))
            .cloned()
            .collect();
        for v in missing {
            debug_assert!(
                new_defs.contains(&v) || rec.base_pairs.values().any(|b| *b == v),
                "liveness recompute surfaced a value with no base: {v}"
            );
            rec.base_pairs.insert(v.clone(), v);
        }
    }

    // where each new def will be used as a base once statepoints exist
    let mut pending_uses: Map<ValueId, Vec<InstId>> = Map::new();
    for rec in records.iter() {
        for base in rec.base_pairs.values() {
            if new_defs.contains(base) {
                pending_uses
                    .entry(base.clone())
                    .or_default()
                    .push(rec.site.clone());
            }
        }
    }

    let defs = f.def_sites();
    for d in new_defs {
        let Some(DefSite::Inst(db, di)) = defs.get(d) else {
            unreachable!("synthesized value {d} has no definition");
        };
        let extra = pending_uses.get(d).cloned().unwrap_or_default();
        for rec in records.iter_mut() {
            if rec.live.contains(d) {
                rec.base_pairs.insert(d.clone(), d.clone());
                continue;
            }
            if !dom.dominates_inst((db, *di), (&rec.site.0, rec.site.1)) {
                continue;
            }
            if liveness::value_live_after_with(f, cfg, d, &rec.site, &extra) {
                trace!("synthesized base {d} is live across {:?}", rec.site);
                rec.live.insert(d.clone());
                rec.base_pairs.insert(d.clone(), d.clone());
            }
        }
    }
}

// SECTION: base search

// The base of one live value.  Non-merge BDVs are the base directly;
// merges go through the lattice.
fn find_base(
    f: &mut Function,
    namer: &mut NameGenerator,
    records: &mut [SafepointRecord],
    cache: &mut BdvCache,
    v: &ValueId,
    config: &Config,
) -> Result<ValueId, PassError> {
    if cache.finalized.contains(v) {
        let Some(Operand::Var(base)) = cache.map.get(v) else {
            unreachable!("finalized entry for {v} is not a value");
        };
        return Ok(base.clone());
    }

    let bdv = find_bdv(f, cache, Operand::Var(v.clone()), config)?;
    let base = match &bdv {
        Operand::Var(x) if is_unresolved_merge(f, cache, x) => {
            resolve_merge(f, namer, records, cache, x.clone(), config)?
        }
        Operand::Var(x) => x.clone(),
        // a pointer derived only from null (or a test-mode global or
        // slot) is outside the heap: the collector will never move it, so
        // the value stands for itself
        _ => v.clone(),
    };

    cache.map.insert(v.clone(), Operand::Var(base.clone()));
    cache.finalized.insert(v.clone());
    Ok(base)
}

// One BDV lookup: walk through casts and index computations until a
// value-producing source or a merge.
fn find_bdv(
    f: &Function,
    cache: &mut BdvCache,
    op: Operand,
    config: &Config,
) -> Result<Operand, PassError> {
    let mut cur = op;
    loop {
        let x = match &cur {
            Operand::Var(x) => x.clone(),
            Operand::Null(_) | Operand::Undef(_) => return Ok(cur),
            Operand::Global(g) => {
                if config.all_functions {
                    return Ok(cur);
                }
                return Err(PassError::UnsupportedBaseSource(
                    f.id.clone(),
                    format!("global {g}"),
                ));
            }
            Operand::CInt(_) | Operand::Func(_) => {
                unreachable!("non-pointer operand {cur} in a base chain")
            }
        };

        if cache.inserted.contains(&x) {
            // synthesized merges and casts are base values by construction
            return Ok(Operand::Var(x));
        }
        if cache.finalized.contains(&x) {
            // upgraded entries already name their base
            return Ok(cache.map[&x].clone());
        }
        if let Some(memo) = cache.map.get(&x) {
            return Ok(memo.clone());
        }

        let memo = |cache: &mut BdvCache, r: Operand| {
            cache.map.insert(x.clone(), r.clone());
            r
        };

        let def = lookup_def(f, &x);
        let next = match def {
            None => return Ok(memo(cache, Operand::Var(x.clone()))), // argument
            Some(inst) => match inst {
                Instruction::Cast {
                    kind: CastKind::Bitcast,
                    op,
                    ..
                } => op.clone(),
                Instruction::Cast {
                    kind: CastKind::IntToPtr,
                    ..
                } => {
                    if config.all_functions {
                        return Ok(memo(cache, Operand::Var(x.clone())));
                    }
                    return Err(PassError::IntToPtrCast(f.id.clone(), x.clone()));
                }
                Instruction::Gep { base, .. } => base.clone(),
                Instruction::Alloca { .. } => {
                    if config.all_functions {
                        return Ok(memo(cache, Operand::Var(x.clone())));
                    }
                    return Err(PassError::UnsupportedBaseSource(
                        f.id.clone(),
                        format!("stack slot {x}"),
                    ));
                }
                Instruction::Load { .. }
                | Instruction::Call { .. }
                | Instruction::CmpXchg { .. }
                | Instruction::AtomicRmw { .. } => {
                    return Ok(memo(cache, Operand::Var(x.clone())))
                }
                Instruction::Phi { .. } | Instruction::Select { .. } => {
                    return Ok(Operand::Var(x.clone()))
                }
                other => unreachable!("instruction kind cannot define a GC pointer: {other}"),
            },
        };
        cur = next;
    }
}

fn lookup_def<'f>(f: &'f Function, v: &ValueId) -> Option<&'f Instruction> {
    for bb in f.body.values() {
        for inst in &bb.insts {
            if inst.lhs() == Some(v) {
                return Some(inst);
            }
        }
    }
    None
}

// a phi or select the lattice has not yet decided for
fn is_unresolved_merge(f: &Function, cache: &BdvCache, v: &ValueId) -> bool {
    if cache.finalized.contains(v) || cache.inserted.contains(v) {
        return false;
    }
    matches!(
        lookup_def(f, v),
        Some(Instruction::Phi { .. }) | Some(Instruction::Select { .. })
    )
}

// SECTION: merge resolution

// per-run lattice table: created, filled, and discarded per top-level
// resolution
struct LatticeTable {
    index: Map<ValueId, usize>,
    nodes: Vec<Node>,
}

struct Node {
    merge: ValueId,
    // the incoming operands of the merge, paired with their BDVs
    incoming: Vec<(Operand, Operand)>,
    state: LatticeVal,
}

fn resolve_merge(
    f: &mut Function,
    namer: &mut NameGenerator,
    records: &mut [SafepointRecord],
    cache: &mut BdvCache,
    root: ValueId,
    config: &Config,
) -> Result<ValueId, PassError> {
    // the workset: this merge plus every merge transitively reachable
    // through incoming BDVs
    let mut table = LatticeTable {
        index: Map::new(),
        nodes: vec![],
    };
    let mut worklist = vec![root.clone()];
    while let Some(m) = worklist.pop() {
        if table.index.contains_key(&m) {
            continue;
        }
        let ops = merge_operands(f, &m);
        let mut incoming = vec![];
        for op in ops {
            let bdv = find_bdv(f, cache, op.clone(), config)?;
            if let Operand::Var(x) = &bdv {
                if is_unresolved_merge(f, cache, x) {
                    worklist.push(x.clone());
                }
            }
            incoming.push((op, bdv));
        }
        table.index.insert(m.clone(), table.nodes.len());
        table.nodes.push(Node {
            merge: m,
            incoming,
            state: LatticeVal::Unknown,
        });
    }

    // meet propagation to a fixpoint
    loop {
        let mut changed = false;
        for i in 0..table.nodes.len() {
            let mut state = LatticeVal::Unknown;
            for k in 0..table.nodes[i].incoming.len() {
                let contribution = contribution(cache, &table, &table.nodes[i].incoming[k].1);
                state = checked_meet(&state, &contribution);
            }
            if state != table.nodes[i].state {
                table.nodes[i].state = state;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // synthesize a skeleton for every conflict, in table order so mutually
    // referencing merges can name each other
    let mut skeletons: Map<ValueId, ValueId> = Map::new();
    for node in &table.nodes {
        match &node.state {
            LatticeVal::Unknown => {
                unreachable!("unresolved merge {} reached from a live value", node.merge)
            }
            LatticeVal::Conflict => {
                let lhs = namer.fresh_var(&format!("{}.base", node.merge.name()), node.merge.ty());
                cache.inserted.insert(lhs.clone());
                skeletons.insert(node.merge.clone(), lhs);
            }
            LatticeVal::Base(_) => {}
        }
    }

    // fill the skeletons, inserting bitcasts where an incoming base has a
    // different pointer subtype
    for i in 0..table.nodes.len() {
        if !matches!(table.nodes[i].state, LatticeVal::Conflict) {
            continue;
        }
        fill_skeleton(f, namer, records, cache, &table, &skeletons, i)?;
    }

    // upgrade the cache to the base relation for everything processed
    for node in &table.nodes {
        let base = merge_base(&table, &skeletons, &node.merge);
        cache.map.insert(node.merge.clone(), Operand::Var(base));
        cache.finalized.insert(node.merge.clone());
    }

    Ok(merge_base(&table, &skeletons, &root))
}

// what a single incoming BDV contributes to the meet
fn contribution(cache: &BdvCache, table: &LatticeTable, bdv: &Operand) -> LatticeVal {
    if let Operand::Var(x) = bdv {
        if let Some(&i) = table.index.get(x) {
            return table.nodes[i].state.clone();
        }
        if cache.finalized.contains(x) {
            // already upgraded: its entry names its base
            return LatticeVal::Base(cache.map[x].clone());
        }
    }
    LatticeVal::Base(bdv.clone())
}

// the base value a resolved table node stands for
fn merge_base(table: &LatticeTable, skeletons: &Map<ValueId, ValueId>, m: &ValueId) -> ValueId {
    let node = &table.nodes[table.index[m]];
    match &node.state {
        LatticeVal::Base(Operand::Var(b)) => b.clone(),
        // merges of constants only: the merge is its own base
        LatticeVal::Base(_) => m.clone(),
        LatticeVal::Conflict => skeletons[m].clone(),
        LatticeVal::Unknown => unreachable!(),
    }
}

fn merge_operands(f: &Function, m: &ValueId) -> Vec<Operand> {
    match lookup_def(f, m) {
        Some(Instruction::Phi { args, .. }) => args.iter().map(|(_, op)| op.clone()).collect(),
        Some(Instruction::Select { tt, ff, .. }) => vec![tt.clone(), ff.clone()],
        _ => unreachable!("{m} is not a merge"),
    }
}

// Create and wire the actual skeleton instruction for conflict node `i`.
// Phi skeletons sit right after their original with casts at the end of
// the incoming blocks; select skeletons sit right after their original
// with casts just before it.
fn fill_skeleton(
    f: &mut Function,
    namer: &mut NameGenerator,
    records: &mut [SafepointRecord],
    cache: &mut BdvCache,
    table: &LatticeTable,
    skeletons: &Map<ValueId, ValueId>,
    i: usize,
) -> Result<(), PassError> {
    let merge = table.nodes[i].merge.clone();
    let lhs = skeletons[&merge].clone();
    let target_ty = merge.ty();

    let (bb, idx) = find_def_pos(f, &merge);
    let orig = f.body[&bb].insts[idx].clone();

    match orig {
        Instruction::Phi { args, .. } => {
            let mut new_args = vec![];
            for (k, (pred, _)) in args.iter().enumerate() {
                let bdv = &table.nodes[i].incoming[k].1;
                let base_op = incoming_base(cache, table, skeletons, bdv, &target_ty);
                let base_op = cast_incoming(
                    f,
                    namer,
                    records,
                    cache,
                    base_op,
                    &target_ty,
                    CastAt::BlockEnd(pred.clone()),
                );
                new_args.push((pred.clone(), base_op));
            }
            insert_tracked(
                f,
                records,
                &bb,
                idx + 1,
                Instruction::Phi {
                    lhs,
                    args: new_args,
                },
            );
        }
        Instruction::Select { cond, .. } => {
            let mut arms = vec![];
            for k in 0..2 {
                let bdv = &table.nodes[i].incoming[k].1;
                let base_op = incoming_base(cache, table, skeletons, bdv, &target_ty);
                let base_op = cast_incoming(
                    f,
                    namer,
                    records,
                    cache,
                    base_op,
                    &target_ty,
                    CastAt::Before(bb.clone(), idx),
                );
                arms.push(base_op);
            }
            // the casts may have shifted the select
            let (bb, idx) = find_def_pos(f, &merge);
            let ff = arms.pop().unwrap();
            let tt = arms.pop().unwrap();
            insert_tracked(
                f,
                records,
                &bb,
                idx + 1,
                Instruction::Select { lhs, cond, tt, ff },
            );
        }
        other => unreachable!("conflict node is not a merge: {other}"),
    }

    Ok(())
}

// the base each incoming BDV stands for, before any cast
fn incoming_base(
    cache: &BdvCache,
    table: &LatticeTable,
    skeletons: &Map<ValueId, ValueId>,
    bdv: &Operand,
    target_ty: &Type,
) -> Operand {
    if let Operand::Var(x) = bdv {
        if let Some(&j) = table.index.get(x) {
            return match &table.nodes[j].state {
                LatticeVal::Base(op) => op.clone(),
                LatticeVal::Conflict => Operand::Var(skeletons[x].clone()),
                LatticeVal::Unknown => unreachable!(),
            };
        }
        if cache.finalized.contains(x) {
            return cache.map[x].clone();
        }
        return bdv.clone();
    }
    // constants keep their role but take the skeleton's type
    match bdv {
        Operand::Null(_) => Operand::Null(target_ty.clone()),
        Operand::Undef(_) => Operand::Undef(target_ty.clone()),
        other => other.clone(),
    }
}

enum CastAt {
    BlockEnd(BbId),
    Before(BbId, usize),
}

// bitcast `op` to the skeleton's type if its pointer subtype differs
fn cast_incoming(
    f: &mut Function,
    namer: &mut NameGenerator,
    records: &mut [SafepointRecord],
    cache: &mut BdvCache,
    op: Operand,
    target_ty: &Type,
    at: CastAt,
) -> Operand {
    let Operand::Var(v) = &op else {
        return op;
    };
    if v.ty() == *target_ty {
        return op;
    }

    let lhs = namer.fresh_var(&format!("{}.base.cast", v.name()), target_ty.clone());
    cache.inserted.insert(lhs.clone());
    let cast = Instruction::Cast {
        lhs: lhs.clone(),
        kind: CastKind::Bitcast,
        op,
    };
    match at {
        CastAt::BlockEnd(bb) => {
            let pos = f.body[&bb].insts.len();
            insert_tracked(f, records, &bb, pos, cast);
        }
        CastAt::Before(bb, idx) => {
            insert_tracked(f, records, &bb, idx, cast);
        }
    }
    Operand::Var(lhs)
}

// insert an instruction, keeping every record's site index current
fn insert_tracked(
    f: &mut Function,
    records: &mut [SafepointRecord],
    bb: &BbId,
    idx: usize,
    inst: Instruction,
) {
    f.body.get_mut(bb).unwrap().insts.insert(idx, inst);
    for rec in records.iter_mut() {
        if rec.site.0 == *bb && rec.site.1 >= idx {
            rec.site.1 += 1;
        }
    }
}

fn find_def_pos(f: &Function, v: &ValueId) -> (BbId, usize) {
    for (bbid, bb) in &f.body {
        for (i, inst) in bb.insts.iter().enumerate() {
            if inst.lhs() == Some(v) {
                return (bbid.clone(), i);
            }
        }
    }
    unreachable!("{v} has no definition")
}
