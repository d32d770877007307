//! Splicing the poll implementation into poll locations.
//!
//! A symbolic call to `safepoint_poll` is appended in front of the chosen
//! terminator and immediately inlined.  The calls the inlined body brought
//! along are filtered with the same needs-statepoint predicate and
//! reported as parse points.  The poll function is frontend configuration;
//! a missing or degenerate poll body aborts the pass before any IR is
//! touched.

use log::trace;

use crate::analysis::InstId;
use crate::ir::inline::{self, NameGenerator};
use crate::ir::*;

use super::poll_sites::needs_statepoint;
use super::*;

/// Reject degenerate poll implementations.  This is a configuration
/// fault, not a miscompile.
pub fn check_poll_function(poll: &Function) -> Result<(), PassError> {
    if poll.body.values().all(|bb| bb.insts.is_empty())
        && poll.body.len() <= 1
    {
        return Err(PassError::EmptyPollFunction);
    }
    if !poll.body.contains_key(&poll.entry_id()) {
        return Err(PassError::MalformedPollFunction(
            "missing entry block".to_string(),
        ));
    }
    if !poll.params.is_empty() || poll.ret_ty.is_some() {
        return Err(PassError::MalformedPollFunction(
            "the poll takes no arguments and returns nothing".to_string(),
        ));
    }
    if poll
        .body
        .values()
        .any(|bb| matches!(bb.term, Terminal::Unreachable))
    {
        return Err(PassError::MalformedPollFunction(
            "the poll body ends in unreachable".to_string(),
        ));
    }
    Ok(())
}

/// Splice the poll body in front of the terminator of `bb`.  Returns the
/// positions of the spliced calls that need the statepoint treatment.
pub fn insert_poll_before_terminator(
    f: &mut Function,
    bb: &BbId,
    poll: &Function,
    namer: &mut NameGenerator,
    info: &ModuleInfo,
) -> Vec<InstId> {
    let idx = f.body[bb].insts.len();
    f.body.get_mut(bb).unwrap().insts.push(Instruction::Call {
        lhs: None,
        cconv: None,
        callee: func_id(SAFEPOINT_POLL),
        args: vec![],
        state: None,
    });

    let inlined = inline::inline_call(f, (bb.clone(), idx), poll, namer);
    trace!(
        "inlined poll at {bb}, {} blocks, continues at {}",
        inlined.inlined_blocks.len(),
        inlined.continuation
    );

    inlined
        .cloned_calls
        .into_iter()
        .filter(|(cb, ci)| {
            let Instruction::Call { callee, .. } = &f.body[cb].insts[*ci] else {
                unreachable!("cloned call position does not hold a call");
            };
            needs_statepoint(callee, info)
        })
        .collect()
}
