//! Structural and type validation of programs.
//!
//! A program that passes validation is in SSA form: every value has one
//! definition, every use is dominated by its definition (phi uses are
//! checked at the end of the corresponding incoming block), phis lead
//! their block and cover exactly the predecessor set.

use derive_more::Display;

use crate::commons::Valid;

use super::dom::DomTree;
use super::*;

/// A validation error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ValidationError(pub String);
impl std::error::Error for ValidationError {}

impl Program {
    pub fn validate(self) -> Result<Valid<Program>, ValidationError> {
        self.check_valid()?;
        Ok(Valid(self))
    }

    pub fn check_valid(&self) -> Result<(), ValidationError> {
        let callees = self.callee_types();
        for f in self.functions.values() {
            check_function(&callees, f)
                .map_err(|e| ValidationError(format!("{}: {}", f.id, e.0)))?;
        }
        Ok(())
    }

    /// The types of every callable name in the program, for call checking.
    pub fn callee_types(&self) -> Map<FuncId, Type> {
        let mut callees: Map<FuncId, Type> = self
            .functions
            .values()
            .map(|f| (f.id.clone(), f.ty()))
            .collect();
        for (id, e) in &self.externs {
            callees.insert(id.clone(), e.ty.clone());
        }
        callees
    }
}

fn err<T>(msg: String) -> Result<T, ValidationError> {
    Err(ValidationError(msg))
}

/// Check one function against the given callable environment.  Exposed so
/// transformation passes can verify their work between phases.
pub fn check_function(callees: &Map<FuncId, Type>, f: &Function) -> Result<(), ValidationError> {
    let entry = f.entry_id();
    if !f.body.contains_key(&entry) {
        return err("missing entry block".to_string());
    }

    // single assignment, including params
    let mut defined: Set<&ValueId> = Set::new();
    for p in &f.params {
        if !defined.insert(p) {
            return err(format!("parameter {p} defined twice"));
        }
    }
    for bb in f.body.values() {
        for inst in &bb.insts {
            if let Some(lhs) = inst.lhs() {
                if !defined.insert(lhs) {
                    return err(format!("value {lhs} defined twice"));
                }
            }
        }
    }

    // terminator targets
    for (bbid, bb) in &f.body {
        for succ in bb.term.succs() {
            if !f.body.contains_key(succ) {
                return err(format!("block {bbid} jumps to unknown block {succ}"));
            }
        }
    }

    // exact predecessor sets, for phi checking
    let mut preds: Map<&BbId, Set<&BbId>> = f.body.keys().map(|b| (b, Set::new())).collect();
    for (bbid, bb) in &f.body {
        for succ in bb.term.succs() {
            preds.get_mut(succ).unwrap().insert(bbid);
        }
    }

    let dom = DomTree::new(f);
    let defs = f.def_sites();

    for (bbid, bb) in &f.body {
        let mut past_phis = false;
        for (i, inst) in bb.insts.iter().enumerate() {
            if inst.is_phi() {
                if past_phis {
                    return err(format!("phi {inst} does not lead block {bbid}"));
                }
            } else {
                past_phis = true;
            }
            check_inst(callees, inst).map_err(|e| {
                ValidationError(format!("in {bbid} at `{inst}`: {}", e.0))
            })?;

            // phis cover exactly the predecessor set
            if let Instruction::Phi { args, .. } = inst {
                let incoming: Set<&BbId> = args.iter().map(|(b, _)| b).collect();
                if incoming.len() != args.len() {
                    return err(format!("phi {inst} has a duplicate incoming block"));
                }
                if incoming != preds[bbid] {
                    return err(format!(
                        "phi {inst} does not cover the predecessors of {bbid}"
                    ));
                }
            }

            if dom.is_reachable(bbid) {
                check_uses(&dom, &defs, inst, bbid, i)?;
            }
        }
        check_term(f, &bb.term)
            .map_err(|e| ValidationError(format!("in {bbid} at `{}`: {}", bb.term, e.0)))?;
        if dom.is_reachable(bbid) {
            for op in bb.term.operands() {
                check_use(&dom, &defs, op, bbid, bb.insts.len())?;
            }
        }
    }

    Ok(())
}

// defs dominate uses; phi uses are checked at the end of the incoming block
fn check_uses(
    dom: &DomTree,
    defs: &Map<ValueId, DefSite>,
    inst: &Instruction,
    bbid: &BbId,
    idx: usize,
) -> Result<(), ValidationError> {
    if let Instruction::Phi { args, .. } = inst {
        for (pred, op) in args {
            check_use(dom, defs, op, pred, usize::MAX)?;
        }
        return Ok(());
    }
    for op in inst.operands() {
        check_use(dom, defs, op, bbid, idx)?;
    }
    Ok(())
}

fn check_use(
    dom: &DomTree,
    defs: &Map<ValueId, DefSite>,
    op: &Operand,
    bbid: &BbId,
    idx: usize,
) -> Result<(), ValidationError> {
    let Operand::Var(v) = op else {
        return Ok(());
    };
    let Some(def) = defs.get(v) else {
        return err(format!("use of undefined value {v}"));
    };
    if !dom.def_dominates(def, bbid, idx) {
        return err(format!("use of {v} in {bbid} is not dominated by its definition"));
    }
    Ok(())
}

fn op_ty(op: &Operand) -> Result<Type, ValidationError> {
    match op.ty() {
        Some(t) => Ok(t),
        None => err(format!("operand {op} has no type")),
    }
}

fn check_inst(callees: &Map<FuncId, Type>, inst: &Instruction) -> Result<(), ValidationError> {
    use Instruction::*;
    match inst {
        Arith { lhs, op1, op2, .. } => {
            expect_ty(op1, int_ty())?;
            expect_ty(op2, int_ty())?;
            expect_lhs(lhs, int_ty())
        }
        Cmp { lhs, op1, op2, .. } => {
            let t1 = op_ty(op1)?;
            let t2 = op_ty(op2)?;
            if t1 != t2 || !(t1.is_int() || t1.is_ptr()) {
                return err(format!("comparison of {t1} and {t2}"));
            }
            expect_lhs(lhs, int_ty())
        }
        Cast { lhs, kind, op } => {
            let src = op_ty(op)?;
            let dst = lhs.ty();
            match kind {
                CastKind::Bitcast => {
                    if !(src.is_ptr() && dst.is_ptr() && src.addr_space() == dst.addr_space()) {
                        return err(format!("bitcast from {src} to {dst}"));
                    }
                }
                CastKind::IntToPtr => {
                    if !(src.is_int() && dst.is_ptr()) {
                        return err(format!("inttoptr from {src} to {dst}"));
                    }
                }
                CastKind::PtrToInt => {
                    if !(src.is_ptr() && dst.is_int()) {
                        return err(format!("ptrtoint from {src} to {dst}"));
                    }
                }
            }
            Ok(())
        }
        Gep { lhs, base, offset } => {
            let bt = op_ty(base)?;
            expect_ty(offset, int_ty())?;
            if !bt.is_ptr() || !lhs.ty().is_ptr() || bt.addr_space() != lhs.ty().addr_space() {
                return err(format!("gep of {bt} to {}", lhs.ty()));
            }
            Ok(())
        }
        Load { lhs, src } => {
            let st = op_ty(src)?;
            match st.pointee() {
                Some(p) if p == lhs.ty() => Ok(()),
                _ => err(format!("load of {} from {st}", lhs.ty())),
            }
        }
        Store { dst, op } => {
            let dt = op_ty(dst)?;
            let vt = op_ty(op)?;
            match dt.pointee() {
                Some(p) if p == vt => Ok(()),
                _ => err(format!("store of {vt} to {dt}")),
            }
        }
        // a GC-pointer-typed slot is structurally fine; whether the pass
        // accepts it as a base source is its own precondition
        Alloca { lhs } => {
            if lhs.ty().pointee().is_none() {
                return err(format!("alloca defining {}", lhs.ty()));
            }
            Ok(())
        }
        Phi { lhs, args } => {
            for (_, op) in args {
                expect_ty(op, lhs.ty())?;
            }
            Ok(())
        }
        Select { lhs, cond, tt, ff } => {
            expect_ty(cond, int_ty())?;
            expect_ty(tt, lhs.ty())?;
            expect_ty(ff, lhs.ty())
        }
        Call {
            lhs, callee, args, ..
        } => {
            if is_statepoint_machinery(callee) || is_intrinsic(callee) {
                return Ok(());
            }
            let Some(ty) = callees.get(callee) else {
                return err(format!("call to undeclared function {callee}"));
            };
            let TypeKind::Func { ret, params } = ty.kind() else {
                return err(format!("call to non-function {callee}:{ty}"));
            };
            if args.len() != params.len() {
                return err(format!("call to {callee} with {} arguments", args.len()));
            }
            for (a, p) in args.iter().zip(params) {
                expect_ty(a, p.clone())?;
            }
            match (lhs, ret) {
                (None, _) => Ok(()),
                (Some(l), Some(r)) if l.ty() == *r => Ok(()),
                (Some(l), _) => err(format!("call result {l} does not match {callee}")),
            }
        }
        CmpXchg { lhs, dst, cmp, new } => {
            let dt = op_ty(dst)?;
            match dt.pointee() {
                Some(p) if p == lhs.ty() => {
                    expect_ty(cmp, p.clone())?;
                    expect_ty(new, p)
                }
                _ => err(format!("cmpxchg of {} on {dt}", lhs.ty())),
            }
        }
        AtomicRmw { lhs, dst, op, .. } => {
            let dt = op_ty(dst)?;
            match dt.pointee() {
                Some(p) if p == lhs.ty() => expect_ty(op, p),
                _ => err(format!("atomicrmw of {} on {dt}", lhs.ty())),
            }
        }
    }?;

    // null and undef constants must be pointer-typed where a pointer is due;
    // a null integer is meaningless
    for op in inst.operands() {
        if let Operand::Null(t) = op {
            if !t.is_ptr() {
                return err(format!("null of non-pointer type {t}"));
            }
        }
    }

    Ok(())
}

fn check_term(f: &Function, term: &Terminal) -> Result<(), ValidationError> {
    match term {
        Terminal::Branch { cond, .. } => expect_ty(cond, int_ty()),
        Terminal::Ret(op) => match (op, &f.ret_ty) {
            (None, None) => Ok(()),
            (Some(op), Some(t)) => expect_ty(op, t.clone()),
            _ => err("return does not match function type".to_string()),
        },
        _ => Ok(()),
    }
}

fn expect_ty(op: &Operand, want: Type) -> Result<(), ValidationError> {
    let got = op_ty(op)?;
    if got != want {
        return err(format!("expected {want}, got {op}:{got}"));
    }
    Ok(())
}

fn expect_lhs(lhs: &ValueId, want: Type) -> Result<(), ValidationError> {
    if lhs.ty() != want {
        return err(format!("expected {lhs} to have type {want}"));
    }
    Ok(())
}
