//! Statepoint materialization.
//!
//! Each parse point is replaced in place by the statepoint sequence: the
//! token call carrying the wire-format operand list, one relocate per
//! value of the live region, and a result projection when the original
//! call produced a value somebody reads.  The sequence is contiguous and
//! must stay contiguous; the relocation rewriter inserts its stores after
//! the last element, never inside.
//!
//! Operand layout of the token call:
//!
//! ```text
//! [callee][argCount][flags][depth][bci][#stack][#locals][#monitors]
//! [origArgs...][(tag,stack)...][(tag,local)...][monitors...][live...]
//! ```
//!
//! Relocate operands are `(token, baseIndex, derivedIndex)`, both indices
//! counting from the first live value.
//!
//! Once a site's original result is projected, every use of the old value
//! is renamed to the projection, including the live lists of other
//! records: the projection is the value's definition from here on.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use log::trace;

use crate::ir::inline::NameGenerator;
use crate::ir::*;

use super::*;

/// Type tags for the abstract-state encoding.
pub const TAG_INT: i64 = 0;
pub const TAG_FLOAT: i64 = 1;
pub const TAG_PTR: i64 = 2;
pub const TAG_GC_PTR: i64 = 3;

/// A flags word is reserved in the layout; nothing is defined for it yet.
pub const STATEPOINT_FLAGS: i64 = 0;

fn type_tag(ty: &Type) -> i64 {
    if ty.is_gc_ptr() {
        TAG_GC_PTR
    } else if ty.is_ptr() {
        TAG_PTR
    } else if ty.is_float() {
        TAG_FLOAT
    } else {
        TAG_INT
    }
}

/// Materialize every record.  Sites that share a block are processed from
/// the bottom up so the earlier sites' indices stay valid while the block
/// grows.
pub fn materialize_all(
    f: &mut Function,
    records: &mut [SafepointRecord],
    namer: &mut NameGenerator,
    config: &Config,
    info: &ModuleInfo,
) -> Result<(), PassError> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        let (ab, ai) = &records[a].site;
        let (bb, bi) = &records[b].site;
        ab.cmp(bb).then(bi.cmp(ai))
    });

    for i in order {
        let rename = materialize_site(f, &mut records[i], namer, config);
        records[i].advance(SiteState::Materialized);
        if let Some((old, new)) = rename {
            rename_value(f, records, &old, &new);
        }
        if config.verify_level >= 3 {
            crate::ir::validate::check_function(&info.callees, f)?;
        }
    }
    Ok(())
}

// returns the (original result, projection) pair when a projection was
// emitted
fn materialize_site(
    f: &mut Function,
    rec: &mut SafepointRecord,
    namer: &mut NameGenerator,
    config: &Config,
) -> Option<(ValueId, ValueId)> {
    let (bb, idx) = rec.site.clone();
    let call = f.body[&bb].insts[idx].clone();
    let Instruction::Call {
        lhs,
        callee,
        args,
        state,
        ..
    } = call
    else {
        unreachable!("parse point at {bb}:{idx} is not a call");
    };

    // 1-2. stabilize the live region: pairs sorted by value name, bases
    // that are not themselves live appended at the tail so the leading
    // indices are unaffected
    let mut region: Vec<ValueId> = rec.live.iter().cloned().collect();
    region.sort();
    let mut tail: Vec<ValueId> = rec
        .base_pairs
        .values()
        .filter(|b| !rec.live.contains(*b))
        .cloned()
        .collect::<Set<_>>()
        .into_iter()
        .collect();
    region.append(&mut tail);

    let index_of: Map<&ValueId, usize> = region.iter().enumerate().map(|(i, v)| (v, i)).collect();

    // 3. the token call, with the fixed operand layout
    let mut ops: Vec<Operand> = vec![
        Operand::Func(callee.clone()),
        Operand::CInt(args.len() as i64),
        Operand::CInt(STATEPOINT_FLAGS),
    ];
    let encoded_state = state.filter(|_| config.use_abstract_state);
    match &encoded_state {
        Some(st) => {
            ops.push(Operand::CInt(st.depth));
            ops.push(Operand::CInt(st.bci));
            ops.push(Operand::CInt(st.stack.len() as i64));
            ops.push(Operand::CInt(st.locals.len() as i64));
            ops.push(Operand::CInt(st.monitors.len() as i64));
        }
        None => {
            ops.push(Operand::CInt(0));
            ops.push(Operand::CInt(-1));
            ops.push(Operand::CInt(0));
            ops.push(Operand::CInt(0));
            ops.push(Operand::CInt(0));
        }
    }
    ops.extend(args.iter().cloned());
    if let Some(st) = &encoded_state {
        for v in st.stack.iter().chain(&st.locals) {
            ops.push(Operand::CInt(type_tag(&v.ty().unwrap_or_else(int_ty))));
            ops.push(v.clone());
        }
        ops.extend(st.monitors.iter().cloned());
    }
    ops.extend(region.iter().map(|v| Operand::Var(v.clone())));

    let token = namer.fresh_var("statepoint", token_ty());
    let mut seq = vec![Instruction::Call {
        lhs: Some(token.clone()),
        cconv: None,
        callee: func_id(GC_STATEPOINT),
        args: ops,
        state: None,
    }];

    // 5. one relocate per live value; the cold convention keeps the
    // backend from burning a register on what is really a projection
    for v in &region {
        let base = &rec.base_pairs[v];
        let relocated = namer.fresh_var(&format!("{}.relocated", v.name()), v.ty());
        seq.push(Instruction::Call {
            lhs: Some(relocated.clone()),
            cconv: Some(CallConv::Cold),
            callee: func_id(GC_RELOCATE),
            args: vec![
                Operand::Var(token.clone()),
                Operand::CInt(index_of[base] as i64),
                Operand::CInt(index_of[v] as i64),
            ],
            state: None,
        });
        rec.relocations.insert(v.clone(), relocated);
    }

    // 4. result projection, typed to the original result, only when the
    // result has readers
    let mut rename = None;
    if let Some(old) = lhs {
        if value_is_used(f, &old) {
            let result_callee = match old.ty() {
                t if t.is_ptr() => GC_RESULT_PTR,
                t if t.is_float() => GC_RESULT_FLOAT,
                _ => GC_RESULT_INT,
            };
            let result = namer.fresh_var(&format!("{}.result", old.name()), old.ty());
            seq.push(Instruction::Call {
                lhs: Some(result.clone()),
                cconv: None,
                callee: func_id(result_callee),
                args: vec![Operand::Var(token.clone())],
                state: None,
            });
            rec.result = Some(result.clone());
            rename = Some((old, result));
        }
    }

    trace!(
        "statepoint at {bb}:{idx} for {callee}: {} live values",
        region.len()
    );

    // 6. splice the contiguous sequence over the original call
    rec.token = Some(token);
    rec.last = seq.last().unwrap().lhs().cloned();
    rec.live_order = region;
    let block = f.body.get_mut(&bb).unwrap();
    block.insts.splice(idx..=idx, seq);

    rename
}

fn value_is_used(f: &Function, v: &ValueId) -> bool {
    for bb in f.body.values() {
        for inst in &bb.insts {
            if inst.operands().iter().any(|op| op.as_var() == Some(v)) {
                return true;
            }
        }
        if bb.term.operands().iter().any(|op| op.as_var() == Some(v)) {
            return true;
        }
    }
    false
}

// Rename every occurrence of a value, in the IR and in the records.  Used
// when a result projection replaces an original call result: the old name
// has no definition anymore.
fn rename_value(f: &mut Function, records: &mut [SafepointRecord], old: &ValueId, new: &ValueId) {
    for bb in f.body.values_mut() {
        for inst in &mut bb.insts {
            for op in inst.operands_mut() {
                if let Operand::Var(v) = op {
                    if v == old {
                        *op = Operand::Var(new.clone());
                    }
                }
            }
        }
        for op in bb.term.operands_mut() {
            if let Operand::Var(v) = op {
                if v == old {
                    *op = Operand::Var(new.clone());
                }
            }
        }
    }

    let swap_set = |set: &mut Set<ValueId>| {
        if set.remove(old) {
            set.insert(new.clone());
        }
    };
    for rec in records.iter_mut() {
        swap_set(&mut rec.live);
        swap_set(&mut rec.new_defs);
        rec.base_pairs = rec
            .base_pairs
            .iter()
            .map(|(d, b)| {
                let d = if d == old { new.clone() } else { d.clone() };
                let b = if b == old { new.clone() } else { b.clone() };
                (d, b)
            })
            .collect();
        for v in &mut rec.live_order {
            if v == old {
                *v = new.clone();
            }
        }
        rec.relocations = rec
            .relocations
            .iter()
            .map(|(d, r)| {
                let d = if d == old { new.clone() } else { d.clone() };
                (d, r.clone())
            })
            .collect();
    }
}
