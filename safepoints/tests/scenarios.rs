// End-to-end scenarios over the full pipeline.

use pretty_assertions::assert_eq;

use super::*;

// A call safepoint with a reused argument: one statepoint, one relocate,
// and the return reads the relocated value.
#[test]
fn call_safepoint_with_reused_argument() {
    let code = r#"
    extern @g: () -> _

    fn f(%p:&gc int) -> &gc int [gc-add-call-safepoints] {
      entry:
        $call @g()
        $ret %p
    }
    "#;

    let expected = r#"
    extern @g: () -> _

    fn f(%p:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %p.relocated:&gc int, %statepoint:token
      entry:
        %statepoint = $call @gc.statepoint(@g, 0, 0, 0, -1, 0, 0, 0, %p)
        %p.relocated = $call cold @gc.relocate(%statepoint, 0, 0)
        $ret %p.relocated
    }
    "#;

    assert_eq!(run(code).to_string(), normalize(expected));
}

// A phi of two derived pointers: base resolution emits a new phi merging
// the two bases, both phis are live across the statepoint and relocated,
// and the return reads the relocated derived value.
#[test]
fn phi_of_two_derived_pointers() {
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

    let expected = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int, %q:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %d1:&gc int, %d2:&gc int, %m:&gc int, %m.base:&gc int,
          %m.base.relocated:&gc int, %m.relocated:&gc int, %statepoint:token
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
        %m.base = $phi [left: %p], [right: %q]
        %statepoint = $call @gc.statepoint(@g, 0, 0, 0, -1, 0, 0, 0, %m, %m.base)
        %m.relocated = $call cold @gc.relocate(%statepoint, 1, 0)
        %m.base.relocated = $call cold @gc.relocate(%statepoint, 1, 1)
        $ret %m.relocated
    }
    "#;

    assert_eq!(run(code).to_string(), normalize(expected));
}

// A phi outside the region the relocations dominate still gets its
// operand rewritten: the edge through the statepoint reads the relocated
// value, the other edge keeps the original.
#[test]
fn phi_outside_dominated_region_is_rewritten() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %obj:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %m:&gc int
      entry:
        $branch %c, callside, skip
      callside:
        $call @g()
        $jump join
      skip:
        $jump join
      join:
        %m = $phi [callside: %obj], [skip: %obj]
        $ret %m
    }
    "#;

    let out = run(code);
    let f = &out.functions[&func_id("f")];

    let Instruction::Phi { args, .. } = &f.body[&bb_id("join")].insts[0] else {
        panic!("join does not start with the phi");
    };
    let by_pred: std::collections::BTreeMap<_, _> =
        args.iter().map(|(bb, op)| (bb.name(), op.clone())).collect();
    let gc_int = gc_ptr_ty(int_ty());
    assert_eq!(
        by_pred["callside"],
        Operand::Var(val_id("obj.relocated", gc_int.clone()))
    );
    assert_eq!(by_pred["skip"], Operand::Var(val_id("obj", gc_int)));
}

// A gc-leaf callee between two real calls: statepoints at the neighbors,
// none at the leaf, and the second statepoint sees the value the first
// one relocated.
#[test]
fn leaf_between_two_safepoints() {
    let code = r#"
    extern @g1: () -> _
    extern @g2: () -> _
    extern @leafy: () -> _ [gc-leaf-function]

    fn f(%p:&gc int) -> &gc int [gc-add-call-safepoints] {
      entry:
        $call @g1()
        $call @leafy()
        $call @g2()
        $ret %p
    }
    "#;

    let out = run(code);
    let f = &out.functions[&func_id("f")];
    let sites = statepoints_in(f);
    assert_eq!(sites.len(), 2);

    // the leaf call survives untouched
    assert!(f.body[&bb_id("entry")]
        .insts
        .iter()
        .any(|i| i.is_call_to("leafy")));

    // sites in block order: g1 first
    let gc_int = gc_ptr_ty(int_ty());
    let first = &sites[0];
    let second = &sites[1];
    assert_eq!(
        live_region_of(f, first),
        vec![Operand::Var(val_id("p", gc_int.clone()))]
    );
    // the second statepoint's live value is the first one's relocation
    assert_eq!(
        live_region_of(f, second),
        vec![Operand::Var(val_id("p.relocated.0", gc_int.clone()))]
    );
    assert_eq!(ret_of(f, "entry"), Operand::Var(val_id("p.relocated", gc_int)));
}

// Every live value gets exactly one relocate, every base is in the live
// region with a relocate of its own.
#[test]
fn one_relocate_per_live_value() {
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

    let out = run(code);
    let f = &out.functions[&func_id("f")];
    let sites = statepoints_in(f);
    assert_eq!(sites.len(), 1);

    let live = live_region_of(f, &sites[0]);
    let relocs = relocates_of(f, &sites[0]);
    assert_eq!(relocs.len(), live.len());

    let mut seen = std::collections::BTreeSet::new();
    for (base_idx, derived_idx, _) in &relocs {
        assert!(seen.insert(*derived_idx), "value relocated twice");
        // the base is in the region and has a relocate of its own
        assert!((*base_idx as usize) < live.len());
        assert!(relocs.iter().any(|(_, d, _)| d == base_idx));
    }
}

// Without the attribute and outside test mode the function is untouched.
#[test]
fn opted_out_function_is_unchanged() {
    let code = r#"
    extern @g: () -> _

    fn f(%p:&gc int, %n:int) -> &gc int {
      let %i:int, %i.next:int, %c:int
      entry:
        $call @g()
        $jump header
      header:
        %i = $phi [entry: 0], [latch: %i.next]
        %c = $cmp lt %i, %n
        $branch %c, body, exit
      body:
        %i.next = $arith add %i, 1
        $jump latch
      latch:
        $jump header
      exit:
        $ret %p
    }
    "#;

    assert_eq!(run(code).to_string(), normalize(code));
}

// The abstract-state sections of the wire format: five header fields,
// then (tag, value) pairs for stack and locals.
#[test]
fn abstract_state_operands() {
    let code = r#"
    extern @g: () -> _

    fn f(%p:&gc int, %x:int) -> _ [gc-add-call-safepoints] {
      entry:
        $call @g() {depth=2, bci=14, stack=[%p], locals=[%x], monitors=[]}
        $ret
    }
    "#;

    let out = run_with(
        code,
        &Config {
            use_abstract_state: true,
            verify_level: 3,
            ..Config::default()
        },
    );
    let f = &out.functions[&func_id("f")];
    let sites = statepoints_in(f);
    assert_eq!(sites.len(), 1);

    let Instruction::Call { args, .. } = &f.body[&sites[0].0].insts[sites[0].1] else {
        unreachable!();
    };
    use Operand::*;
    assert_eq!(
        args.clone(),
        vec![
            Func(func_id("g")),
            CInt(0),  // argument count
            CInt(0),  // flags
            CInt(2),  // depth
            CInt(14), // bytecode index
            CInt(1),  // stack entries
            CInt(1),  // locals
            CInt(0),  // monitors
            CInt(3),  // tag: gc pointer
            Var(val_id("p", gc_ptr_ty(int_ty()))),
            CInt(0), // tag: int
            Var(val_id("x", int_ty())),
        ]
    );
}

// Without the option the same call gets placeholder state fields.
#[test]
fn abstract_state_disabled_uses_placeholders() {
    let code = r#"
    extern @g: () -> _

    fn f(%x:int) -> _ [gc-add-call-safepoints] {
      entry:
        $call @g() {depth=2, bci=14, stack=[], locals=[%x], monitors=[]}
        $ret
    }
    "#;

    let out = run(code);
    let f = &out.functions[&func_id("f")];
    let sites = statepoints_in(f);
    let Instruction::Call { args, .. } = &f.body[&sites[0].0].insts[sites[0].1] else {
        unreachable!();
    };
    use Operand::*;
    assert_eq!(
        args.clone(),
        vec![
            Func(func_id("g")),
            CInt(0),
            CInt(0),
            CInt(0),
            CInt(-1),
            CInt(0),
            CInt(0),
            CInt(0),
        ]
    );
}

// A call whose integer result is read: the projection replaces the value.
#[test]
fn result_projection_replaces_call_result() {
    let code = r#"
    extern @g: (&gc int) -> int

    fn f(%p:&gc int) -> int [gc-add-call-safepoints] {
      let %r:int, %s:int
      entry:
        %r = $call @g(%p)
        %s = $arith add %r, 1
        $ret %s
    }
    "#;

    let out = run(code);
    let f = &out.functions[&func_id("f")];
    let entry = &f.body[&bb_id("entry")];

    // the projection is typed to the original result
    assert!(entry.insts.iter().any(|i| i.is_call_to(GC_RESULT_INT)));
    // the add consumes the projection now
    let add = entry
        .insts
        .iter()
        .find(|i| matches!(i, Instruction::Arith { .. }))
        .unwrap();
    assert_eq!(
        add.operands()[0],
        &Operand::Var(val_id("r.result", int_ty()))
    );
    // the original argument is in the statepoint's argument section
    let sites = statepoints_in(f);
    let Instruction::Call { args, .. } = &entry.insts[sites[0].1] else {
        unreachable!();
    };
    assert_eq!(args[1], Operand::CInt(1));
    assert_eq!(args[8], Operand::Var(val_id("p", gc_ptr_ty(int_ty()))));
}
