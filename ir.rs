//! The typed, SSA-form intermediate representation.
//!
//! A [Program] owns global variables, external declarations, and functions.
//! Each [Function] owns an ordered collection of basic blocks; each
//! [BasicBlock] owns a sequence of instructions ended by a [Terminal].
//! Every instruction defines at most one value; values are identified by
//! name and carry their type.
//!
//! Pointer types are tagged with an address space.  A *GC pointer* is a
//! pointer in address space 1; those are the values the safepoint pass
//! tracks and relocates.
//!
//! The textual format round-trips through [std::fmt::Display] and
//! [std::str::FromStr]; see the parser module for the grammar.

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt;

use derive_more::Display;
use hashconsing::{consign, HConsed, HashConsign};

pub mod dom;
pub mod dump_cfg;
pub mod inline;
pub mod loops;
pub mod mem2reg;
pub mod parser;
pub mod validate;

#[cfg(test)]
mod tests;

pub use validate::ValidationError;

// SECTION: types

/// The address space of GC-managed pointers.
pub const GC_ADDR_SPACE: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeKind {
    Int,
    Float,
    /// The opaque result of a statepoint call.
    Token,
    Ptr {
        pointee: Type,
        addr_space: u32,
    },
    Func {
        ret: Option<Type>,
        params: Vec<Type>,
    },
}

/// An interned type.  Equality and ordering are by interned identity, so
/// types are cheap to copy into value identifiers and compare.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Type(HConsed<TypeKind>);

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

consign! {
    let TYPES = consign(37) for TypeKind;
}

pub fn int_ty() -> Type {
    Type(TYPES.mk(TypeKind::Int))
}

pub fn float_ty() -> Type {
    Type(TYPES.mk(TypeKind::Float))
}

pub fn token_ty() -> Type {
    Type(TYPES.mk(TypeKind::Token))
}

pub fn ptr_ty(pointee: Type) -> Type {
    Type(TYPES.mk(TypeKind::Ptr {
        pointee,
        addr_space: 0,
    }))
}

pub fn gc_ptr_ty(pointee: Type) -> Type {
    Type(TYPES.mk(TypeKind::Ptr {
        pointee,
        addr_space: GC_ADDR_SPACE,
    }))
}

pub fn func_ty(ret: Option<Type>, params: Vec<Type>) -> Type {
    Type(TYPES.mk(TypeKind::Func { ret, params }))
}

impl Type {
    pub fn kind(&self) -> &TypeKind {
        self.0.get()
    }

    pub fn is_int(&self) -> bool {
        matches!(self.kind(), TypeKind::Int)
    }

    pub fn is_float(&self) -> bool {
        matches!(self.kind(), TypeKind::Float)
    }

    pub fn is_token(&self) -> bool {
        matches!(self.kind(), TypeKind::Token)
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self.kind(), TypeKind::Ptr { .. })
    }

    /// Whether this is a pointer into the GC-managed address space.
    pub fn is_gc_ptr(&self) -> bool {
        matches!(
            self.kind(),
            TypeKind::Ptr { addr_space, .. } if *addr_space == GC_ADDR_SPACE
        )
    }

    pub fn pointee(&self) -> Option<Type> {
        match self.kind() {
            TypeKind::Ptr { pointee, .. } => Some(pointee.clone()),
            _ => None,
        }
    }

    pub fn addr_space(&self) -> Option<u32> {
        match self.kind() {
            TypeKind::Ptr { addr_space, .. } => Some(*addr_space),
            _ => None,
        }
    }
}

impl PartialOrd for Type {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Type {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.uid().cmp(&other.0.uid())
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind() {
            TypeKind::Int => write!(f, "int"),
            TypeKind::Float => write!(f, "float"),
            TypeKind::Token => write!(f, "token"),
            TypeKind::Ptr {
                pointee,
                addr_space,
            } => {
                if *addr_space == GC_ADDR_SPACE {
                    write!(f, "&gc {pointee}")
                } else {
                    write!(f, "&{pointee}")
                }
            }
            TypeKind::Func { ret, params } => {
                write!(f, "(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") -> ")?;
                match ret {
                    Some(t) => write!(f, "{t}"),
                    None => write!(f, "_"),
                }
            }
        }
    }
}

// SECTION: identifiers

/// An SSA value: a name paired with its type.  Ordering is name-major so
/// that sorted collections of values come out in textual order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId {
    name: String,
    ty: Type,
}

pub fn val_id(name: &str, ty: Type) -> ValueId {
    ValueId {
        name: name.to_string(),
        ty,
    }
}

impl ValueId {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> Type {
        self.ty.clone()
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.name)
    }
}

/// A basic block label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub struct BbId(String);

pub fn bb_id(name: &str) -> BbId {
    BbId(name.to_string())
}

impl BbId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A function name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(String);

pub fn func_id(name: &str) -> FuncId {
    FuncId(name.to_string())
}

impl FuncId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A global variable: a name paired with its type.  The safepoint pass only
/// admits GC-pointer globals as base sources in test mode.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalId {
    name: String,
    ty: Type,
}

pub fn global_id(name: &str, ty: Type) -> GlobalId {
    GlobalId {
        name: name.to_string(),
        ty,
    }
}

impl GlobalId {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> Type {
        self.ty.clone()
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.name)
    }
}

// SECTION: well-known names

/// The poll implementation the frontend must supply.  The pass inlines its
/// body at every chosen poll location and never instruments the function
/// itself.
pub const SAFEPOINT_POLL: &str = "safepoint_poll";

/// Statepoint machinery intrinsics.
pub const GC_STATEPOINT: &str = "gc.statepoint";
pub const GC_RELOCATE: &str = "gc.relocate";
pub const GC_RESULT_INT: &str = "gc.result.int";
pub const GC_RESULT_FLOAT: &str = "gc.result.float";
pub const GC_RESULT_PTR: &str = "gc.result.ptr";

/// Function attributes that opt into each class of safepoint.
pub const ATTR_ENTRY: &str = "gc-add-entry-safepoints";
pub const ATTR_BACKEDGE: &str = "gc-add-backedge-safepoints";
pub const ATTR_CALL: &str = "gc-add-call-safepoints";

/// Callees that can never reach a safepoint themselves.
pub const ATTR_GC_LEAF: &str = "gc-leaf-function";

/// Whether the named callee is part of already-inserted statepoint
/// machinery.  Such calls are never selected as parse points.
pub fn is_statepoint_machinery(f: &FuncId) -> bool {
    matches!(
        f.name(),
        GC_STATEPOINT | GC_RELOCATE | GC_RESULT_INT | GC_RESULT_FLOAT | GC_RESULT_PTR
    )
}

/// Whether the named callee is a compiler intrinsic (as opposed to a real
/// call that may transition to the runtime).
pub fn is_intrinsic(f: &FuncId) -> bool {
    f.name().starts_with("intr.")
}

/// Intrinsics that may transition to the runtime regardless: these are
/// lowered to libcalls and do need safepoints.
pub fn intrinsic_needs_safepoint(f: &FuncId) -> bool {
    matches!(f.name(), "intr.memset" | "intr.memcpy" | "intr.memmove")
}

// SECTION: operands

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operand {
    Var(ValueId),
    CInt(i64),
    /// The null pointer of the given pointer type.  The only constant
    /// address a GC pointer may hold.
    Null(Type),
    Undef(Type),
    Global(GlobalId),
    /// A reference to a function, e.g. the target recorded in a statepoint.
    Func(FuncId),
}

impl Operand {
    /// The type of the operand, when it has one.  Function references are
    /// untyped at the operand level.
    pub fn ty(&self) -> Option<Type> {
        match self {
            Operand::Var(v) => Some(v.ty()),
            Operand::CInt(_) => Some(int_ty()),
            Operand::Null(t) | Operand::Undef(t) => Some(t.clone()),
            Operand::Global(g) => Some(g.ty()),
            Operand::Func(_) => None,
        }
    }

    /// The value named by this operand, if it is a GC pointer.  Null and
    /// undef are excluded by policy: they never enter live sets.
    pub fn as_gc_var(&self) -> Option<&ValueId> {
        match self {
            Operand::Var(v) if v.ty().is_gc_ptr() => Some(v),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&ValueId> {
        match self {
            Operand::Var(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Var(v) => write!(f, "{v}"),
            Operand::CInt(n) => write!(f, "{n}"),
            Operand::Null(t) => write!(f, "null:{t}"),
            Operand::Undef(t) => write!(f, "undef:{t}"),
            Operand::Global(g) => write!(f, "{g}"),
            Operand::Func(g) => write!(f, "{g}"),
        }
    }
}

// SECTION: instructions

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum ArithOp {
    #[display(fmt = "add")]
    Add,
    #[display(fmt = "sub")]
    Sub,
    #[display(fmt = "mul")]
    Mul,
    #[display(fmt = "div")]
    Div,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum CmpOp {
    #[display(fmt = "eq")]
    Eq,
    #[display(fmt = "ne")]
    Ne,
    #[display(fmt = "lt")]
    Lt,
    #[display(fmt = "le")]
    Le,
    #[display(fmt = "gt")]
    Gt,
    #[display(fmt = "ge")]
    Ge,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum CastKind {
    #[display(fmt = "$bitcast")]
    Bitcast,
    /// Reconstituting a pointer from an integer.  Rejected by the safepoint
    /// pass as a base source unless running in permissive test mode.
    #[display(fmt = "$inttoptr")]
    IntToPtr,
    #[display(fmt = "$ptrtoint")]
    PtrToInt,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum RmwOp {
    #[display(fmt = "xchg")]
    Xchg,
    #[display(fmt = "add")]
    Add,
}

/// Calling-convention hints.  `Cold` marks synthetic calls (relocates) the
/// backend should keep out of the register allocator's way.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum CallConv {
    #[display(fmt = "cold")]
    Cold,
}

/// The language-level abstract state a frontend may attach to a call.  When
/// statepoints carry abstract state, these fields are encoded into the
/// statepoint's operand list so the runtime can reconstruct the abstract
/// frame.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CallState {
    pub depth: i64,
    pub bci: i64,
    pub stack: Vec<Operand>,
    pub locals: Vec<Operand>,
    pub monitors: Vec<Operand>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Arith {
        lhs: ValueId,
        aop: ArithOp,
        op1: Operand,
        op2: Operand,
    },
    Cmp {
        lhs: ValueId,
        rop: CmpOp,
        op1: Operand,
        op2: Operand,
    },
    /// The target type is the type of `lhs`.
    Cast {
        lhs: ValueId,
        kind: CastKind,
        op: Operand,
    },
    /// Pointer indexing by a byte offset.  The result is a pointer derived
    /// from the same object as `base`.
    Gep {
        lhs: ValueId,
        base: Operand,
        offset: Operand,
    },
    Load {
        lhs: ValueId,
        src: Operand,
    },
    Store {
        dst: Operand,
        op: Operand,
    },
    /// A stack slot; `lhs` has type `&T` for a slot holding `T`.
    Alloca {
        lhs: ValueId,
    },
    Phi {
        lhs: ValueId,
        args: Vec<(BbId, Operand)>,
    },
    Select {
        lhs: ValueId,
        cond: Operand,
        tt: Operand,
        ff: Operand,
    },
    Call {
        lhs: Option<ValueId>,
        cconv: Option<CallConv>,
        callee: FuncId,
        args: Vec<Operand>,
        state: Option<CallState>,
    },
    CmpXchg {
        lhs: ValueId,
        dst: Operand,
        cmp: Operand,
        new: Operand,
    },
    AtomicRmw {
        lhs: ValueId,
        rop: RmwOp,
        dst: Operand,
        op: Operand,
    },
}

impl Instruction {
    pub fn lhs(&self) -> Option<&ValueId> {
        use Instruction::*;
        match self {
            Arith { lhs, .. }
            | Cmp { lhs, .. }
            | Cast { lhs, .. }
            | Gep { lhs, .. }
            | Load { lhs, .. }
            | Alloca { lhs }
            | Phi { lhs, .. }
            | Select { lhs, .. }
            | CmpXchg { lhs, .. }
            | AtomicRmw { lhs, .. } => Some(lhs),
            Store { .. } => None,
            Call { lhs, .. } => lhs.as_ref(),
        }
    }

    pub fn lhs_mut(&mut self) -> Option<&mut ValueId> {
        use Instruction::*;
        match self {
            Arith { lhs, .. }
            | Cmp { lhs, .. }
            | Cast { lhs, .. }
            | Gep { lhs, .. }
            | Load { lhs, .. }
            | Alloca { lhs }
            | Phi { lhs, .. }
            | Select { lhs, .. }
            | CmpXchg { lhs, .. }
            | AtomicRmw { lhs, .. } => Some(lhs),
            Store { .. } => None,
            Call { lhs, .. } => lhs.as_mut(),
        }
    }

    /// All value-level operands, in a fixed order.  For phis this includes
    /// every incoming operand; callers that need edge information match on
    /// the instruction directly.
    pub fn operands(&self) -> Vec<&Operand> {
        use Instruction::*;
        match self {
            Arith { op1, op2, .. } | Cmp { op1, op2, .. } => vec![op1, op2],
            Cast { op, .. } => vec![op],
            Gep { base, offset, .. } => vec![base, offset],
            Load { src, .. } => vec![src],
            Store { dst, op } => vec![dst, op],
            Alloca { .. } => vec![],
            Phi { args, .. } => args.iter().map(|(_, op)| op).collect(),
            Select { cond, tt, ff, .. } => vec![cond, tt, ff],
            Call { args, state, .. } => {
                let mut ops: Vec<&Operand> = args.iter().collect();
                if let Some(st) = state {
                    ops.extend(st.stack.iter());
                    ops.extend(st.locals.iter());
                    ops.extend(st.monitors.iter());
                }
                ops
            }
            CmpXchg { dst, cmp, new, .. } => vec![dst, cmp, new],
            AtomicRmw { dst, op, .. } => vec![dst, op],
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        use Instruction::*;
        match self {
            Arith { op1, op2, .. } | Cmp { op1, op2, .. } => vec![op1, op2],
            Cast { op, .. } => vec![op],
            Gep { base, offset, .. } => vec![base, offset],
            Load { src, .. } => vec![src],
            Store { dst, op } => vec![dst, op],
            Alloca { .. } => vec![],
            Phi { args, .. } => args.iter_mut().map(|(_, op)| op).collect(),
            Select { cond, tt, ff, .. } => vec![cond, tt, ff],
            Call { args, state, .. } => {
                let mut ops: Vec<&mut Operand> = args.iter_mut().collect();
                if let Some(st) = state {
                    ops.extend(st.stack.iter_mut());
                    ops.extend(st.locals.iter_mut());
                    ops.extend(st.monitors.iter_mut());
                }
                ops
            }
            CmpXchg { dst, cmp, new, .. } => vec![dst, cmp, new],
            AtomicRmw { dst, op, .. } => vec![dst, op],
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Instruction::Phi { .. })
    }

    pub fn as_call(&self) -> Option<(&Option<ValueId>, &FuncId, &Vec<Operand>)> {
        match self {
            Instruction::Call {
                lhs, callee, args, ..
            } => Some((lhs, callee, args)),
            _ => None,
        }
    }

    pub fn is_call_to(&self, name: &str) -> bool {
        matches!(self, Instruction::Call { callee, .. } if callee.name() == name)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Instruction::*;
        match self {
            Arith { lhs, aop, op1, op2 } => write!(f, "{lhs} = $arith {aop} {op1}, {op2}"),
            Cmp { lhs, rop, op1, op2 } => write!(f, "{lhs} = $cmp {rop} {op1}, {op2}"),
            Cast { lhs, kind, op } => write!(f, "{lhs} = {kind} {op} to {}", lhs.ty()),
            Gep { lhs, base, offset } => write!(f, "{lhs} = $gep {base}, {offset}"),
            Load { lhs, src } => write!(f, "{lhs} = $load {src}"),
            Store { dst, op } => write!(f, "$store {dst}, {op}"),
            Alloca { lhs } => {
                let pointee = lhs.ty().pointee().expect("alloca with non-pointer type");
                write!(f, "{lhs} = $alloca {pointee}")
            }
            Phi { lhs, args } => {
                write!(f, "{lhs} = $phi ")?;
                for (i, (bb, op)) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[{bb}: {op}]")?;
                }
                Ok(())
            }
            Select { lhs, cond, tt, ff } => write!(f, "{lhs} = $select {cond}, {tt}, {ff}"),
            Call {
                lhs,
                cconv,
                callee,
                args,
                state,
            } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call ")?;
                if let Some(cc) = cconv {
                    write!(f, "{cc} ")?;
                }
                write!(f, "{callee}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")?;
                if let Some(st) = state {
                    let list = |ops: &[Operand]| {
                        ops.iter()
                            .map(|o| o.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    };
                    write!(
                        f,
                        " {{depth={}, bci={}, stack=[{}], locals=[{}], monitors=[{}]}}",
                        st.depth,
                        st.bci,
                        list(&st.stack),
                        list(&st.locals),
                        list(&st.monitors)
                    )?;
                }
                Ok(())
            }
            CmpXchg { lhs, dst, cmp, new } => write!(f, "{lhs} = $cmpxchg {dst}, {cmp}, {new}"),
            AtomicRmw { lhs, rop, dst, op } => {
                write!(f, "{lhs} = $atomicrmw {rop} {dst}, {op}")
            }
        }
    }
}

// SECTION: terminators

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminal {
    Jump(BbId),
    Branch {
        cond: Operand,
        tt: BbId,
        ff: BbId,
    },
    Ret(Option<Operand>),
    Unreachable,
}

impl Terminal {
    pub fn succs(&self) -> Vec<&BbId> {
        match self {
            Terminal::Jump(bb) => vec![bb],
            Terminal::Branch { tt, ff, .. } => vec![tt, ff],
            Terminal::Ret(_) | Terminal::Unreachable => vec![],
        }
    }

    pub fn succs_mut(&mut self) -> Vec<&mut BbId> {
        match self {
            Terminal::Jump(bb) => vec![bb],
            Terminal::Branch { tt, ff, .. } => vec![tt, ff],
            Terminal::Ret(_) | Terminal::Unreachable => vec![],
        }
    }

    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Terminal::Branch { cond, .. } => vec![cond],
            Terminal::Ret(Some(op)) => vec![op],
            _ => vec![],
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            Terminal::Branch { cond, .. } => vec![cond],
            Terminal::Ret(Some(op)) => vec![op],
            _ => vec![],
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Terminal::Jump(bb) => write!(f, "$jump {bb}"),
            Terminal::Branch { cond, tt, ff } => write!(f, "$branch {cond}, {tt}, {ff}"),
            Terminal::Ret(Some(op)) => write!(f, "$ret {op}"),
            Terminal::Ret(None) => write!(f, "$ret"),
            Terminal::Unreachable => write!(f, "$unreachable"),
        }
    }
}

// SECTION: blocks, functions, programs

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BbId,
    pub insts: Vec<Instruction>,
    pub term: Terminal,
}

/// Where a value is defined inside a function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DefSite {
    Param,
    Inst(BbId, usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub id: FuncId,
    pub params: Vec<ValueId>,
    pub ret_ty: Option<Type>,
    pub attrs: Set<String>,
    pub body: Map<BbId, BasicBlock>,
}

impl Function {
    pub fn entry_id(&self) -> BbId {
        bb_id("entry")
    }

    pub fn ty(&self) -> Type {
        func_ty(
            self.ret_ty.clone(),
            self.params.iter().map(|p| p.ty()).collect(),
        )
    }

    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.contains(attr)
    }

    /// Every value defined in the function mapped to its definition site.
    pub fn def_sites(&self) -> Map<ValueId, DefSite> {
        let mut defs = Map::new();
        for p in &self.params {
            defs.insert(p.clone(), DefSite::Param);
        }
        for (bbid, bb) in &self.body {
            for (i, inst) in bb.insts.iter().enumerate() {
                if let Some(lhs) = inst.lhs() {
                    defs.insert(lhs.clone(), DefSite::Inst(bbid.clone(), i));
                }
            }
        }
        defs
    }

    /// All values defined by instructions, in name order.
    pub fn local_values(&self) -> Set<ValueId> {
        self.body
            .values()
            .flat_map(|bb| bb.insts.iter())
            .filter_map(|i| i.lhs().cloned())
            .collect()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fn {}(", self.id.name())?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}:{}", p.ty())?;
        }
        write!(f, ") -> ")?;
        match &self.ret_ty {
            Some(t) => write!(f, "{t}")?,
            None => write!(f, "_")?,
        }
        if !self.attrs.is_empty() {
            let attrs = self.attrs.iter().cloned().collect::<Vec<_>>().join(", ");
            write!(f, " [{attrs}]")?;
        }
        writeln!(f, " {{")?;

        let locals = self.local_values();
        if !locals.is_empty() {
            let decls = locals
                .iter()
                .map(|v| format!("{v}:{}", v.ty()))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "  let {decls}")?;
        }

        for (bbid, bb) in &self.body {
            writeln!(f, "  {bbid}:")?;
            for inst in &bb.insts {
                writeln!(f, "    {inst}")?;
            }
            writeln!(f, "    {}", bb.term)?;
        }
        write!(f, "}}")
    }
}

/// An external declaration: a typed name with optional attributes (most
/// importantly `gc-leaf-function`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extern {
    pub ty: Type,
    pub attrs: Set<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Program {
    pub globals: Set<GlobalId>,
    pub externs: Map<FuncId, Extern>,
    pub functions: Map<FuncId, Function>,
}

impl Program {
    /// Whether calls to `callee` can never reach a safepoint.
    pub fn is_gc_leaf(&self, callee: &FuncId) -> bool {
        if let Some(f) = self.functions.get(callee) {
            return f.has_attr(ATTR_GC_LEAF);
        }
        if let Some(e) = self.externs.get(callee) {
            return e.attrs.contains(ATTR_GC_LEAF);
        }
        false
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for g in &self.globals {
            writeln!(f, "{g}:{}", g.ty())?;
            first = false;
        }
        for (id, e) in &self.externs {
            write!(f, "extern {id}:{}", e.ty)?;
            if !e.attrs.is_empty() {
                let attrs = e.attrs.iter().cloned().collect::<Vec<_>>().join(", ");
                write!(f, " [{attrs}]")?;
            }
            writeln!(f)?;
            first = false;
        }
        for func in self.functions.values() {
            if !first {
                writeln!(f)?;
            }
            writeln!(f, "{func}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::str::FromStr for Program {
    type Err = parser::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parser::parse(s)
    }
}
