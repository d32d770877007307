// Base-pointer resolution: the lattice, merge synthesis, and the cache.

use pretty_assertions::assert_eq;

use super::super::base_pointers::{meet, LatticeVal};
use super::*;

// The meet is commutative and idempotent over the whole value universe.
#[test]
fn meet_is_commutative_and_idempotent() {
    use LatticeVal::*;

    let gc_int = gc_ptr_ty(int_ty());
    let gc_float = gc_ptr_ty(float_ty());
    let universe = [
        Unknown,
        Conflict,
        Base(Operand::Var(val_id("a", gc_int.clone()))),
        Base(Operand::Var(val_id("b", gc_int.clone()))),
        Base(Operand::Var(val_id("a", gc_float.clone()))),
        Base(Operand::Null(gc_int.clone())),
        Base(Operand::Null(gc_float)),
        Base(Operand::Undef(gc_int)),
    ];

    for a in &universe {
        assert_eq!(meet(a, a), a.clone(), "meet is not idempotent at {a:?}");
        for b in &universe {
            assert_eq!(meet(a, b), meet(b, a), "meet is not commutative");
        }
    }
}

#[test]
fn meet_ordering() {
    use LatticeVal::*;

    let a = Base(Operand::Var(val_id("a", gc_ptr_ty(int_ty()))));
    let b = Base(Operand::Var(val_id("b", gc_ptr_ty(int_ty()))));
    assert_eq!(meet(&Unknown, &a), a.clone());
    assert_eq!(meet(&a, &b), Conflict);
    assert_eq!(meet(&Conflict, &a), Conflict);
    assert_eq!(meet(&Unknown, &Conflict), Conflict);
}

// A conflicted select gets a skeleton select of the bases right after it.
#[test]
fn conflicted_select_synthesizes_a_base_select() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int, %q:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %d:&gc int, %m:&gc int
      entry:
        %d = $gep %p, 16
        %m = $select %c, %d, %q
        $call @g()
        $ret %m
    }
    "#;

    let expected = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int, %q:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %d:&gc int, %m:&gc int, %m.base:&gc int, %m.base.relocated:&gc int,
          %m.relocated:&gc int, %statepoint:token
      entry:
        %d = $gep %p, 16
        %m = $select %c, %d, %q
        %m.base = $select %c, %p, %q
        %statepoint = $call @gc.statepoint(@g, 0, 0, 0, -1, 0, 0, 0, %m, %m.base)
        %m.relocated = $call cold @gc.relocate(%statepoint, 1, 0)
        %m.base.relocated = $call cold @gc.relocate(%statepoint, 1, 1)
        $ret %m.relocated
    }
    "#;

    assert_eq!(run(code).to_string(), normalize(expected));
}

// A self-referential phi terminates through the lattice and resolves to
// the single outside base without synthesizing anything.
#[test]
fn self_referential_phi_needs_no_skeleton() {
    let code = r#"
    extern @g: () -> _

    fn f(%p:&gc int, %n:int) -> &gc int [gc-add-call-safepoints] {
      let %m:&gc int, %c:int
      entry:
        $jump header
      header:
        %m = $phi [entry: %p], [latch: %m]
        $call @g()
        %c = $cmp lt 0, %n
        $branch %c, latch, exit
      latch:
        $jump header
      exit:
        $ret %m
    }
    "#;

    let out = run(code);
    let f = &out.functions[&func_id("f")];

    assert!(
        !f.local_values().iter().any(|v| v.name().contains(".base")),
        "no base merge should be synthesized"
    );
    let sites = statepoints_in(f);
    assert_eq!(sites.len(), 1);
    // the derived phi and its base are both relocated
    assert_eq!(relocates_of(f, &sites[0]).len(), 2);
}

// Null is a legitimate merge input: the skeleton keeps it, retyped to the
// skeleton's type.
#[test]
fn phi_with_null_input() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %d:&gc int, %m:&gc int
      entry:
        $branch %c, a, b
      a:
        %d = $gep %p, 8
        $jump join
      b:
        $jump join
      join:
        %m = $phi [a: %d], [b: null:&gc int]
        $call @g()
        $ret %m
    }
    "#;

    let out = run(code);
    let f = &out.functions[&func_id("f")];

    let gc_int = gc_ptr_ty(int_ty());
    let skeleton = f.body[&bb_id("join")]
        .insts
        .iter()
        .find(|i| i.lhs() == Some(&val_id("m.base", gc_int.clone())))
        .expect("no base phi was synthesized");
    let Instruction::Phi { args, .. } = skeleton else {
        panic!("the skeleton is not a phi");
    };
    let by_pred: std::collections::BTreeMap<_, _> =
        args.iter().map(|(bb, op)| (bb.name(), op.clone())).collect();
    assert_eq!(by_pred["a"], Operand::Var(val_id("p", gc_int.clone())));
    assert_eq!(by_pred["b"], Operand::Null(gc_int));
}

// Incoming bases with a different pointer subtype are bitcast at the end
// of their incoming block.
#[test]
fn differing_base_types_get_casts() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int, %q:&gc float) -> &gc int [gc-add-call-safepoints] {
      let %qi:&gc int, %m:&gc int
      entry:
        %qi = $bitcast %q to &gc int
        $branch %c, a, b
      a:
        $jump join
      b:
        $jump join
      join:
        %m = $phi [a: %p], [b: %qi]
        $call @g()
        $ret %m
    }
    "#;

    let out = run(code);
    let f = &out.functions[&func_id("f")];

    // the cast lands in b, the incoming block for the float-typed base
    let gc_int = gc_ptr_ty(int_ty());
    let cast = f.body[&bb_id("b")]
        .insts
        .iter()
        .find(|i| matches!(i, Instruction::Cast { .. }))
        .expect("no cast in the incoming block");
    assert_eq!(cast.lhs(), Some(&val_id("q.base.cast", gc_int.clone())));

    let skeleton = f.body[&bb_id("join")]
        .insts
        .iter()
        .find(|i| i.lhs() == Some(&val_id("m.base", gc_int.clone())))
        .expect("no base phi was synthesized");
    let Instruction::Phi { args, .. } = skeleton else {
        panic!("the skeleton is not a phi");
    };
    let by_pred: std::collections::BTreeMap<_, _> =
        args.iter().map(|(bb, op)| (bb.name(), op.clone())).collect();
    assert_eq!(by_pred["b"], Operand::Var(val_id("q.base.cast", gc_int)));
}

// Reconstituting a GC pointer from an integer is a precondition violation
// outside test mode, and a self-based source inside it.
#[test]
fn int_to_ptr_is_rejected() {
    let code = r#"
    extern @g: () -> _

    fn f(%x:int) -> &gc int [gc-add-call-safepoints] {
      let %p:&gc int
      entry:
        %p = $inttoptr %x to &gc int
        $call @g()
        $ret %p
    }
    "#;

    let got = try_run(code, &Config::default());
    assert_eq!(
        got.unwrap_err(),
        PassError::IntToPtrCast(func_id("f"), val_id("p", gc_ptr_ty(int_ty())))
    );

    let out = run_with(
        code,
        &Config {
            all_functions: true,
            // no poll function in this module: keep to call safepoints
            no_entry: true,
            no_backedge: true,
            verify_level: 3,
            ..Config::default()
        },
    );
    let f = &out.functions[&func_id("f")];
    assert_eq!(statepoints_in(f).len(), 1);
}

// A GC pointer rooted in a global is outside the value-only heap model: a
// precondition violation outside test mode, a self-based source inside it.
#[test]
fn global_base_source_is_rejected() {
    let code = r#"
    @g:&gc int

    extern @h: () -> _

    fn f() -> &gc int [gc-add-call-safepoints] {
      let %d:&gc int
      entry:
        %d = $gep @g, 8
        $call @h()
        $ret %d
    }
    "#;

    let got = try_run(code, &Config::default());
    assert_eq!(
        got.unwrap_err(),
        PassError::UnsupportedBaseSource(func_id("f"), "global @g".to_string())
    );

    let out = run_with(
        code,
        &Config {
            all_functions: true,
            no_entry: true,
            no_backedge: true,
            verify_level: 3,
            ..Config::default()
        },
    );
    let f = &out.functions[&func_id("f")];
    assert_eq!(statepoints_in(f).len(), 1);
}

// Same for a GC pointer whose chain bottoms out at a stack slot.
#[test]
fn stack_slot_base_source_is_rejected() {
    let code = r#"
    extern @h: () -> _

    fn f() -> &gc int [gc-add-call-safepoints] {
      let %s:&gc int
      entry:
        %s = $alloca int
        $call @h()
        $ret %s
    }
    "#;

    let got = try_run(code, &Config::default());
    assert_eq!(
        got.unwrap_err(),
        PassError::UnsupportedBaseSource(func_id("f"), "stack slot %s".to_string())
    );

    let out = run_with(
        code,
        &Config {
            all_functions: true,
            no_entry: true,
            no_backedge: true,
            verify_level: 3,
            ..Config::default()
        },
    );
    let f = &out.functions[&func_id("f")];
    assert_eq!(statepoints_in(f).len(), 1);
}

// BaseRewriteOnly stops after resolution: the skeleton is in place, no
// statepoint is.
#[test]
fn base_rewrite_only_stops_after_resolution() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int, %q:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %d1:&gc int, %d2:&gc int, %m:&gc int
      entry:
        $branch %c, left, right
      left:
        %d1 = $gep %p, 8
        $jump merge
      right:
        %d2 = $gep %q, 8
        $jump merge
      merge:
        %m = $phi [left: %d1], [right: %d2]
        $call @g()
        $ret %m
    }
    "#;

    let out = run_with(
        code,
        &Config {
            base_rewrite_only: true,
            verify_level: 1,
            ..Config::default()
        },
    );
    let f = &out.functions[&func_id("f")];

    assert_eq!(statepoints_in(f).len(), 0);
    assert!(f
        .local_values()
        .iter()
        .any(|v| v.name() == "m.base"));
}

// Both liveness modes drive the pass to the same output.
#[test]
fn liveness_modes_agree_end_to_end() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int, %q:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %d1:&gc int, %d2:&gc int, %m:&gc int
      entry:
        $branch %c, left, right
      left:
        %d1 = $gep %p, 8
        $jump merge
      right:
        %d2 = $gep %q, 8
        $jump merge
      merge:
        %m = $phi [left: %d1], [right: %d2]
        $call @g()
        $ret %m
    }
    "#;

    let dataflow = run_with(
        code,
        &Config {
            dataflow_liveness: true,
            verify_level: 3,
            ..Config::default()
        },
    );
    let on_demand = run_with(
        code,
        &Config {
            dataflow_liveness: false,
            verify_level: 3,
            ..Config::default()
        },
    );
    assert_eq!(dataflow.to_string(), on_demand.to_string());
}
