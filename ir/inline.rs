//! Inlining of direct call sites.
//!
//! Inlining a call splits the block at the call site and splices in a copy
//! of the callee's control flow graph.  Creating the copy requires mangled
//! value and basic block names.  The components are:
//!
//! - [NameGenerator] maintains the set of names used in the caller's body
//!   and generates fresh mangled names when needed.
//!
//! - [inline_call] clones the callee's blocks with mangled names, rewires
//!   parameters to the call arguments, turns returns into jumps to the
//!   continuation block (merging return values through a phi when the
//!   callee returns a value), and repairs phi edges in the successors of
//!   the split block.
//!
//! The safepoint pass uses this to splice the poll function's body in
//! front of chosen poll locations; the calls discovered inside the spliced
//! blocks are reported back so the caller can turn them into parse points.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::*;

// A type that generates names that do not collide with names declared in
// the current function.
pub struct NameGenerator {
    // Value names that are already declared.  This contains strings rather
    // than ValueId because values with the same name but different type are
    // not equal.
    declared_vars: Set<String>,
    declared_bbs: Set<String>,
}

impl NameGenerator {
    pub fn new(defining_fn: &Function) -> NameGenerator {
        let mut declared_vars = defining_fn
            .params
            .iter()
            .map(|x| x.name().to_string())
            .collect::<Set<String>>();
        declared_vars.extend(
            defining_fn
                .local_values()
                .iter()
                .map(|x| x.name().to_string()),
        );

        NameGenerator {
            declared_vars,
            declared_bbs: defining_fn
                .body
                .keys()
                .map(|b| b.name().to_string())
                .collect(),
        }
    }

    // Create a new value whose name is `call_site.callee.name.N`, where `N`
    // makes the name unique in the caller.
    pub fn mangle_var(&mut self, call_site: &BbId, callee: &FuncId, orig: &ValueId) -> ValueId {
        let name = Self::mangle_name(
            &format!("{}.{}.{}", call_site.name(), callee.name(), orig.name()),
            &mut self.declared_vars,
        );
        val_id(&name, orig.ty())
    }

    // Create a fresh basic block ID named `call_site.callee.bb.N`.
    pub fn mangle_bb(&mut self, call_site: &BbId, callee: &FuncId, bb: &BbId) -> BbId {
        let name = Self::mangle_name(
            &format!("{}.{}.{}", call_site.name(), callee.name(), bb.name()),
            &mut self.declared_bbs,
        );
        bb_id(&name)
    }

    /// A fresh value named `base` or `base.N`.
    pub fn fresh_var(&mut self, base: &str, ty: Type) -> ValueId {
        val_id(&Self::fresh_name(base, &mut self.declared_vars), ty)
    }

    /// A fresh block named `base` or `base.N`.
    pub fn fresh_bb(&mut self, base: &str) -> BbId {
        bb_id(&Self::fresh_name(base, &mut self.declared_bbs))
    }

    // Generates fresh names based on a counter suffix.  The prefix itself is
    // used unsuffixed when it is still free.
    fn fresh_name(prefix: &str, existing: &mut Set<String>) -> String {
        if existing.insert(prefix.to_string()) {
            return prefix.to_string();
        }
        Self::mangle_name(prefix, existing)
    }

    fn mangle_name(prefix: &str, existing: &mut Set<String>) -> String {
        let mut n = 0u32;
        loop {
            let candidate = format!("{prefix}.{n}");
            if existing.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// What [inline_call] produced.
pub struct InlineResult {
    /// The cloned blocks, in the callee's block order.
    pub inlined_blocks: Vec<BbId>,
    /// Positions of the call instructions inside the cloned blocks.
    pub cloned_calls: Vec<(BbId, usize)>,
    /// The block that now holds the split-off tail of the call site's
    /// block, including its original terminator.
    pub continuation: BbId,
}

/// Inline the direct call at `site` (a block and instruction index into
/// `f`) using the given callee body.  The call instruction must be a call
/// whose argument count matches the callee.  If the callee returns a value
/// and the call defines one, the returned value is merged through a phi in
/// the continuation block that defines the call's original value, so uses
/// need no rewriting.
pub fn inline_call(
    f: &mut Function,
    site: (BbId, usize),
    callee: &Function,
    namer: &mut NameGenerator,
) -> InlineResult {
    let (site_bb, site_idx) = site;
    let block = f.body.get_mut(&site_bb).expect("unknown call-site block");
    let call = block.insts.remove(site_idx);
    let Instruction::Call { lhs, args, .. } = call else {
        panic!("inline_call target is not a call: {call}");
    };
    assert_eq!(args.len(), callee.params.len(), "arity mismatch inlining {}", callee.id);

    // detach the tail of the block
    let tail: Vec<Instruction> = block.insts.split_off(site_idx);
    let continuation = namer.mangle_bb(&site_bb, &callee.id, &bb_id("cont"));
    let cont_term = std::mem::replace(&mut block.term, Terminal::Unreachable);

    // names for the cloned blocks and values
    let mut bb_map: Map<BbId, BbId> = Map::new();
    for bb in callee.body.keys() {
        bb_map.insert(bb.clone(), namer.mangle_bb(&site_bb, &callee.id, bb));
    }
    let mut val_map: Map<ValueId, Operand> = Map::new();
    for (param, arg) in callee.params.iter().zip(&args) {
        val_map.insert(param.clone(), arg.clone());
    }
    for v in callee.local_values() {
        let fresh = namer.mangle_var(&site_bb, &callee.id, &v);
        val_map.insert(v, Operand::Var(fresh));
    }

    let subst = |op: &mut Operand| {
        if let Operand::Var(v) = op {
            if let Some(mapped) = val_map.get(v) {
                *op = mapped.clone();
            }
        }
    };

    // clone the callee body
    let mut inlined_blocks = vec![];
    let mut cloned_calls = vec![];
    let mut returns: Vec<(BbId, Option<Operand>)> = vec![];
    for (bbid, bb) in &callee.body {
        let new_id = bb_map[bbid].clone();
        let mut insts = vec![];
        for inst in &bb.insts {
            let mut inst = inst.clone();
            if let Some(lhs) = inst.lhs_mut() {
                let Some(Operand::Var(fresh)) = val_map.get(lhs) else {
                    unreachable!("unmapped local {lhs}");
                };
                *lhs = fresh.clone();
            }
            for op in inst.operands_mut() {
                subst(op);
            }
            if let Instruction::Phi { args, .. } = &mut inst {
                for (pred, _) in args {
                    *pred = bb_map[pred].clone();
                }
            }
            if matches!(inst, Instruction::Call { .. }) {
                cloned_calls.push((new_id.clone(), insts.len()));
            }
            insts.push(inst);
        }

        let term = match bb.term.clone() {
            Terminal::Ret(mut op) => {
                if let Some(op) = &mut op {
                    subst(op);
                }
                returns.push((new_id.clone(), op));
                Terminal::Jump(continuation.clone())
            }
            mut term => {
                for op in term.operands_mut() {
                    subst(op);
                }
                for succ in term.succs_mut() {
                    *succ = bb_map[succ].clone();
                }
                term
            }
        };

        f.body.insert(
            new_id.clone(),
            BasicBlock {
                id: new_id.clone(),
                insts,
                term,
            },
        );
        inlined_blocks.push(new_id);
    }

    // enter the inlined entry from the split block
    let entry_clone = bb_map[&callee.entry_id()].clone();
    f.body.get_mut(&site_bb).unwrap().term = Terminal::Jump(entry_clone);

    // the continuation holds the tail; a phi merges returned values into
    // the call's original result so its uses stay untouched
    let mut cont_insts = vec![];
    if let Some(lhs) = lhs {
        assert!(
            !returns.is_empty(),
            "inlining a non-returning callee into a call that defines {lhs}"
        );
        let args = returns
            .iter()
            .map(|(bb, op)| (bb.clone(), op.clone().expect("missing return value")))
            .collect();
        cont_insts.push(Instruction::Phi { lhs, args });
    }
    cont_insts.extend(tail);
    f.body.insert(
        continuation.clone(),
        BasicBlock {
            id: continuation.clone(),
            insts: cont_insts,
            term: cont_term,
        },
    );

    // the split moved the original terminator: phi edges in its successors
    // now come in from the continuation
    let succs: Vec<BbId> = f.body[&continuation]
        .term
        .succs()
        .into_iter()
        .cloned()
        .collect();
    for succ in succs {
        for inst in &mut f.body.get_mut(&succ).unwrap().insts {
            if let Instruction::Phi { args, .. } = inst {
                for (pred, _) in args {
                    if *pred == site_bb {
                        *pred = continuation.clone();
                    }
                }
            }
        }
    }

    InlineResult {
        inlined_blocks,
        cloned_calls,
        continuation,
    }
}
