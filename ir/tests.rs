// IR structure tests: the textual round trip, validation, dominators,
// loops, inlining, and slot promotion.

use pretty_assertions::assert_eq;

use super::dom::DomTree;
use super::inline::{inline_call, NameGenerator};
use super::{loops, mem2reg};

use super::*;

fn parse(code: &str) -> Program {
    code.parse().unwrap_or_else(|e| panic!("{e}"))
}

// SECTION: parsing and printing

#[test]
fn round_trip() {
    let code = r#"
    @counter:&int

    extern @alloc: (int) -> &gc int
    extern @leafy: () -> _ [gc-leaf-function]

    fn f(%c:int, %p:&gc int) -> &gc int [gc-add-call-safepoints] {
      let %d:&gc int, %fp:&gc float, %m:&gc int, %n:int, %old:&gc int, %s:&int, %x:int
      entry:
        %x = $load @counter
        %d = $gep %p, 8
        %fp = $bitcast %d to &gc float
        %s = $alloca int
        $store %s, %x
        %n = $arith add %x, 1
        $branch %c, a, b
      a:
        %old = $cmpxchg %d, %p, %d
        $call @leafy()
        $jump join
      b:
        $call @alloc(4) {depth=1, bci=3, stack=[%p], locals=[], monitors=[]}
        $jump join
      join:
        %m = $phi [a: %old], [b: null:&gc int]
        $ret %m
    }
    "#;

    let program = parse(code);
    let printed = program.to_string();
    assert_eq!(parse(&printed), program);
    assert_eq!(parse(&printed).to_string(), printed);
}

#[test]
fn prints_canonical_layout() {
    use collapse::*;

    let code = r#"
    fn f(%x:int) -> int {
      entry:
        $ret %x
    }
    "#;
    collapsed_eq!(
        &parse(code).to_string(),
        "fn f(%x:int) -> int { entry: $ret %x }"
    );
}

#[test]
fn parse_errors_carry_positions() {
    let err = "fn f() -> int {\n  entry:\n    $retx 0\n}"
        .parse::<Program>()
        .unwrap_err();
    assert!(err.0.contains("unknown instruction"), "{err}");
}

// SECTION: validation

#[test]
fn rejects_undeclared_values() {
    let code = r#"
    fn f() -> int {
      entry:
        $ret %x
    }
    "#;
    assert!(code.parse::<Program>().is_err());
}

#[test]
fn rejects_uncovered_phis() {
    let code = r#"
    fn f(%c:int, %x:int) -> int {
      let %m:int
      entry:
        $branch %c, a, b
      a:
        $jump join
      b:
        $jump join
      join:
        %m = $phi [a: %x]
        $ret %m
    }
    "#;
    let err = parse(code).check_valid().unwrap_err();
    assert!(err.0.contains("predecessors"), "{err}");
}

#[test]
fn rejects_undominated_uses() {
    let code = r#"
    fn f(%c:int) -> int {
      let %x:int
      entry:
        $branch %c, a, b
      a:
        %x = $arith add 1, 2
        $jump b
      b:
        $ret %x
    }
    "#;
    let err = parse(code).check_valid().unwrap_err();
    assert!(err.0.contains("dominated"), "{err}");
}

#[test]
fn rejects_type_mismatches() {
    let code = r#"
    fn f(%p:&gc int) -> int {
      let %x:int
      entry:
        %x = $arith add %p, 1
        $ret %x
    }
    "#;
    assert!(parse(code).check_valid().is_err());
}

// SECTION: dominators

#[test]
fn dominator_tree_of_a_diamond() {
    let code = r#"
    fn f(%c:int) -> int {
      entry:
        $branch %c, a, b
      a:
        $jump join
      b:
        $jump join
      join:
        $ret 0
    }
    "#;
    let program = parse(code);
    let dom = DomTree::new(&program.functions[&func_id("f")]);

    assert_eq!(dom.idom(&bb_id("a")), Some(&bb_id("entry")));
    assert_eq!(dom.idom(&bb_id("b")), Some(&bb_id("entry")));
    assert_eq!(dom.idom(&bb_id("join")), Some(&bb_id("entry")));
    assert!(dom.dominates(&bb_id("entry"), &bb_id("join")));
    assert!(!dom.dominates(&bb_id("a"), &bb_id("join")));

    let df = dom.dominance_frontiers();
    assert_eq!(df[&bb_id("a")], [bb_id("join")].into());
    assert_eq!(df[&bb_id("b")], [bb_id("join")].into());
    assert!(!df.contains_key(&bb_id("entry")));
}

// SECTION: loops

fn loop_program(bound: &str) -> String {
    format!(
        r#"
    fn f(%n:int) -> int {{
      let %i:int, %i.next:int, %c:int
      entry:
        $jump header
      header:
        %i = $phi [entry: 0], [latch: %i.next]
        %c = $cmp lt %i, {bound}
        $branch %c, body, exit
      body:
        %i.next = $arith add %i, 1
        $jump latch
      latch:
        $jump header
      exit:
        $ret %i
    }}
    "#
    )
}

#[test]
fn finds_natural_loops() {
    let program = parse(&loop_program("10"));
    let f = &program.functions[&func_id("f")];
    let dom = DomTree::new(f);
    let found = loops::find_loops(f, &dom);

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].header, bb_id("header"));
    assert_eq!(found[0].latches, vec![bb_id("latch")]);
    assert_eq!(
        found[0].body,
        ["header", "body", "latch"].map(bb_id).into()
    );
}

#[test]
fn counts_trips_of_counted_loops() {
    let program = parse(&loop_program("10"));
    let f = &program.functions[&func_id("f")];
    let found = loops::find_loops(f, &DomTree::new(f));
    assert_eq!(loops::trip_count(f, &found[0]), Some(10));
}

#[test]
fn no_trip_count_for_symbolic_bounds() {
    let program = parse(&loop_program("%n"));
    let f = &program.functions[&func_id("f")];
    let found = loops::find_loops(f, &DomTree::new(f));
    assert_eq!(loops::trip_count(f, &found[0]), None);
}

// SECTION: inlining

#[test]
fn inlines_a_returning_callee() {
    let code = r#"
    fn callee(%a:int) -> int {
      let %r:int
      entry:
        %r = $arith add %a, 1
        $ret %r
    }

    fn caller(%x:int) -> int {
      let %y:int
      entry:
        %y = $call @callee(%x)
        $ret %y
    }
    "#;

    let mut program = parse(code);
    let callee = program.functions[&func_id("callee")].clone();
    let caller = program.functions.get_mut(&func_id("caller")).unwrap();
    let mut namer = NameGenerator::new(caller);

    let result = inline_call(caller, (bb_id("entry"), 0), &callee, &mut namer);
    assert_eq!(result.cloned_calls, vec![]);

    let expected = r#"
    fn callee(%a:int) -> int {
      let %r:int
      entry:
        %r = $arith add %a, 1
        $ret %r
    }

    fn caller(%x:int) -> int {
      let %entry.callee.r.0:int, %y:int
      entry:
        $jump entry.callee.entry.0
      entry.callee.cont.0:
        %y = $phi [entry.callee.entry.0: %entry.callee.r.0]
        $ret %y
      entry.callee.entry.0:
        %entry.callee.r.0 = $arith add %x, 1
        $jump entry.callee.cont.0
    }
    "#;
    program.check_valid().unwrap();
    assert_eq!(program.to_string(), parse(expected).to_string());
}

#[test]
fn inlining_repairs_phi_edges_of_the_split_block() {
    let code = r#"
    fn callee() -> _ {
      entry:
        $ret
    }

    fn caller(%c:int, %x:int) -> int {
      let %m:int
      entry:
        $call @callee()
        $branch %c, a, join
      a:
        $jump join
      join:
        %m = $phi [entry: %x], [a: 0]
        $ret %m
    }
    "#;

    let mut program = parse(code);
    let callee = program.functions[&func_id("callee")].clone();
    let caller = program.functions.get_mut(&func_id("caller")).unwrap();
    let mut namer = NameGenerator::new(caller);

    let result = inline_call(caller, (bb_id("entry"), 0), &callee, &mut namer);

    // the phi edge that came from the split block now comes from the
    // continuation
    let Instruction::Phi { args, .. } = &program.functions[&func_id("caller")].body
        [&bb_id("join")]
        .insts[0]
    else {
        panic!("join lost its phi");
    };
    assert!(args.iter().any(|(bb, _)| bb == &result.continuation));
    assert!(!args.iter().any(|(bb, _)| bb == &bb_id("entry")));
    program.check_valid().unwrap();
}

// SECTION: slot promotion

#[test]
fn promotes_a_diamond_slot() {
    let code = r#"
    fn f(%c:int) -> int {
      let %s:&int, %x:int
      entry:
        %s = $alloca int
        $store %s, 1
        $branch %c, then, join
      then:
        $store %s, 2
        $jump join
      join:
        %x = $load %s
        $ret %x
    }
    "#;

    let mut program = parse(code);
    let f = program.functions.get_mut(&func_id("f")).unwrap();
    let mut namer = NameGenerator::new(f);
    let slot = val_id("s", ptr_ty(int_ty()));
    assert_eq!(mem2reg::promote_slots(f, &[slot], &mut namer), 1);

    let expected = r#"
    fn f(%c:int) -> int {
      let %s.phi:int
      entry:
        $branch %c, then, join
      then:
        $jump join
      join:
        %s.phi = $phi [entry: 1], [then: 2]
        $ret %s.phi
    }
    "#;
    program.check_valid().unwrap();
    assert_eq!(program.to_string(), parse(expected).to_string());
}

#[test]
fn escaping_slots_are_left_alone() {
    let code = r#"
    extern @observe: (&int) -> _

    fn f() -> int {
      let %s:&int, %x:int
      entry:
        %s = $alloca int
        $store %s, 1
        $call @observe(%s)
        %x = $load %s
        $ret %x
    }
    "#;

    let mut program = parse(code);
    let f = program.functions.get_mut(&func_id("f")).unwrap();
    let mut namer = NameGenerator::new(f);
    let slot = val_id("s", ptr_ty(int_ty()));
    assert_eq!(mem2reg::promote_slots(f, &[slot], &mut namer), 0);
    assert_eq!(program.to_string(), parse(code).to_string());
}
