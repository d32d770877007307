// Liveness tests, including agreement between the two engine modes.

use pretty_assertions::assert_eq;

use super::liveness::{compute_live_map, LivenessEngine, Mode};
use super::*;

fn parse(code: &str) -> Program {
    code.parse().unwrap_or_else(|e| panic!("{e}"))
}

// live set names at a site, under both modes; panics if they disagree
fn live_after(f: &Function, site: (&str, usize)) -> Set<String> {
    let cfg = Cfg::new(f);
    let site = (bb_id(site.0), site.1);
    let dataflow = LivenessEngine::new(f, &cfg, Mode::Dataflow).live_after(&site);
    let on_demand = LivenessEngine::new(f, &cfg, Mode::OnDemand).live_after(&site);
    assert_eq!(dataflow, on_demand, "the liveness modes disagree at {site:?}");
    dataflow.iter().map(|v| v.name().to_string()).collect()
}

fn names(names: &[&str]) -> Set<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn defs_kill_and_later_uses_generate() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int, %q:&gc int) -> &gc int {
      let %d:&gc int
      entry:
        %d = $gep %p, 8
        $call @g()
        $branch %c, a, b
      a:
        $ret %d
      b:
        $ret %q
    }
    "#;
    let program = parse(code);
    let f = &program.functions[&func_id("f")];

    // after the call: the derived pointer and the pointer returned on the
    // other arm; %p is dead once %d exists
    assert_eq!(live_after(f, ("entry", 1)), names(&["d", "q"]));
    // a site's own result is excluded by definition
    assert_eq!(live_after(f, ("entry", 0)), names(&["q"]));
}

#[test]
fn own_result_is_not_live_at_the_site() {
    let code = r#"
    extern @alloc: () -> &gc int

    fn f() -> &gc int {
      let %r:&gc int
      entry:
        %r = $call @alloc()
        $ret %r
    }
    "#;
    let program = parse(code);
    let f = &program.functions[&func_id("f")];
    assert_eq!(live_after(f, ("entry", 0)), names(&[]));
}

#[test]
fn call_arguments_alone_do_not_survive_the_call() {
    let code = r#"
    extern @g: (&gc int) -> _

    fn f(%p:&gc int) -> _ {
      entry:
        $call @g(%p)
        $ret
    }
    "#;
    let program = parse(code);
    let f = &program.functions[&func_id("f")];
    assert_eq!(live_after(f, ("entry", 0)), names(&[]));
}

#[test]
fn phi_operands_are_live_on_their_edge_only() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %x:&gc int, %y:&gc int) -> &gc int {
      let %m:&gc int
      entry:
        $branch %c, l, r
      l:
        $call @g()
        $jump join
      r:
        $jump join
      join:
        %m = $phi [l: %x], [r: %y]
        $ret %m
    }
    "#;
    let program = parse(code);
    let f = &program.functions[&func_id("f")];

    // on the left edge only %x feeds the phi
    assert_eq!(live_after(f, ("l", 0)), names(&["x"]));
}

#[test]
fn loop_carried_values_stay_live() {
    let code = r#"
    extern @g: () -> _

    fn f(%p:&gc int, %n:int) -> &gc int {
      let %i:int, %i.next:int, %c:int
      entry:
        $jump header
      header:
        %i = $phi [entry: 0], [latch: %i.next]
        $call @g()
        %c = $cmp lt %i, %n
        $branch %c, latch, exit
      latch:
        $jump header
      exit:
        $ret %p
    }
    "#;
    let program = parse(code);
    let f = &program.functions[&func_id("f")];

    // %p crosses the in-loop call on its way to the exit
    assert_eq!(live_after(f, ("header", 1)), names(&["p"]));
}

#[test]
fn null_and_undef_are_never_tracked() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int) -> &gc int {
      let %m:&gc int
      entry:
        $call @g()
        %m = $select %c, null:&gc int, undef:&gc int
        $ret %m
    }
    "#;
    let program = parse(code);
    let f = &program.functions[&func_id("f")];
    assert_eq!(live_after(f, ("entry", 0)), names(&[]));
}

#[test]
fn block_level_sets_cover_the_whole_function() {
    let code = r#"
    extern @g: () -> _

    fn f(%c:int, %p:&gc int, %q:&gc int) -> &gc int {
      let %m:&gc int
      entry:
        $branch %c, a, b
      a:
        $jump join
      b:
        $jump join
      join:
        %m = $phi [a: %p], [b: %q]
        $call @g()
        $ret %m
    }
    "#;
    let program = parse(code);
    let f = &program.functions[&func_id("f")];
    let cfg = Cfg::new(f);
    let map = compute_live_map(f, &cfg);

    let gc_int = gc_ptr_ty(int_ty());
    // the phi operands are live out of their edges, the phi itself is
    // confined to join
    assert_eq!(
        map.live_out[&bb_id("a")],
        [val_id("p", gc_int.clone())].into()
    );
    assert_eq!(
        map.live_out[&bb_id("b")],
        [val_id("q", gc_int.clone())].into()
    );
    assert_eq!(map.live_in[&bb_id("join")], Set::new());
    assert_eq!(map.live_out[&bb_id("join")], Set::new());
}

#[test]
fn unreachable_blocks_are_removed() {
    let code = r#"
    fn f() -> int {
      entry:
        $ret 0
      island:
        $jump island
    }
    "#;
    let mut program = parse(code);
    let f = program.functions.get_mut(&func_id("f")).unwrap();
    assert_eq!(remove_unreachable_blocks(f), 1);
    assert!(!f.body.contains_key(&bb_id("island")));
}
