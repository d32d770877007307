// End-to-end tests for the safepoint pass.

use crate::ir::*;

use super::*;

mod bases;
mod scenarios;

// SECTION: helpers shared by the test modules

fn run_with(code: &str, config: &Config) -> Program {
    let program: Program = code.parse().unwrap();
    let program = program.validate().unwrap();
    place_safepoints(program, config).unwrap().0
}

fn run(code: &str) -> Program {
    run_with(
        code,
        &Config {
            verify_level: 3,
            ..Config::default()
        },
    )
}

fn try_run(code: &str, config: &Config) -> Result<Program, PassError> {
    let program: Program = code.parse().unwrap();
    let program = program.validate().unwrap();
    place_safepoints(program, config).map(|p| p.0)
}

// parse and reprint, to compare programs independent of layout
fn normalize(code: &str) -> String {
    code.parse::<Program>().unwrap().to_string()
}

// every statepoint token call in the function, as (block, index)
fn statepoints_in(f: &Function) -> Vec<(BbId, usize)> {
    let mut sites = vec![];
    for (bbid, bb) in &f.body {
        for (i, inst) in bb.insts.iter().enumerate() {
            if inst.is_call_to(GC_STATEPOINT) {
                sites.push((bbid.clone(), i));
            }
        }
    }
    sites
}

// the relocates attached to the statepoint at `site`: the contiguous run
// of gc.relocate calls following it, as (base index, derived index, value)
fn relocates_of(f: &Function, site: &(BbId, usize)) -> Vec<(i64, i64, ValueId)> {
    let bb = &f.body[&site.0];
    let token = bb.insts[site.1].lhs().unwrap();
    let mut relocs = vec![];
    for inst in &bb.insts[site.1 + 1..] {
        let Instruction::Call {
            lhs: Some(lhs),
            callee,
            args,
            ..
        } = inst
        else {
            break;
        };
        if callee.name() != GC_RELOCATE {
            break;
        }
        assert_eq!(args[0], Operand::Var(token.clone()), "relocate off its token");
        let (Operand::CInt(b), Operand::CInt(d)) = (&args[1], &args[2]) else {
            panic!("relocate with non-constant indices");
        };
        relocs.push((*b, *d, lhs.clone()));
    }
    relocs
}

// the live region of the statepoint at `site`, decoded from the wire
// layout
fn live_region_of(f: &Function, site: &(BbId, usize)) -> Vec<Operand> {
    let Instruction::Call { args, .. } = &f.body[&site.0].insts[site.1] else {
        panic!("not a statepoint");
    };
    let int_at = |i: usize| -> i64 {
        let Operand::CInt(n) = args[i] else {
            panic!("expected an integer at operand {i}");
        };
        n
    };
    let argc = int_at(1) as usize;
    let nstack = int_at(5) as usize;
    let nlocals = int_at(6) as usize;
    let nmons = int_at(7) as usize;
    let live_start = 8 + argc + 2 * nstack + 2 * nlocals + nmons;
    args[live_start..].to_vec()
}

fn ret_of(f: &Function, bb: &str) -> Operand {
    match &f.body[&bb_id(bb)].term {
        Terminal::Ret(Some(op)) => op.clone(),
        other => panic!("expected a value return, got {other}"),
    }
}
