//! The safepoint-insertion pass.
//!
//! After the pass runs, every selected parse point is a statepoint: the
//! original call is replaced by a `gc.statepoint` token call, a result
//! projection when the call produced a used value, and one `gc.relocate`
//! per GC-pointer value live across the site.  Every use reachable past a
//! statepoint reads the relocated value.
//!
//! The components run in a fixed order per function:
//!
//! 1. [poll_sites] nominates poll locations (function entry, backedges of
//!    loops without a provable trip count) and parse points (non-leaf call
//!    sites).
//! 2. [poll_inline] splices the frontend's `safepoint_poll` body in front
//!    of each poll location; the non-leaf calls inside the spliced code
//!    become parse points too.
//! 3. The liveness engine computes each site's live set.
//! 4. [base_pointers] finds or synthesizes a base for every live derived
//!    pointer.
//! 5. [statepoints] replaces each parse point with the statepoint sequence.
//! 6. [relocation] rewrites uses to see relocated values, via a
//!    spill-to-slot round trip promoted back to SSA.
//!
//! Base resolution must finish at every site before any statepoint is
//! materialized, and materialization must finish everywhere before use
//! rewriting starts; interleaving would invalidate the liveness queries of
//! later sites.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use derive_more::Display;
use log::debug;
use serde::Deserialize;

use crate::analysis::{self, liveness, Cfg, InstId};
use crate::commons::Valid;
use crate::ir::dom::DomTree;
use crate::ir::inline::NameGenerator;
use crate::ir::{self, loops, *};

pub mod base_pointers;
pub mod poll_inline;
pub mod poll_sites;
pub mod relocation;
pub mod statepoints;

#[cfg(test)]
mod tests;

// SECTION: configuration

/// Pass configuration.  Carried explicitly; there is no process-wide
/// state.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 0 = no IR verification, 1 = before and after the pass, 2 = after
    /// each major phase, 3 = fine-grained (additionally after each site).
    pub verify_level: u8,
    /// Poll every backedge, even of loops with a provable finite trip
    /// count.
    pub all_backedges: bool,
    /// Stop after base-pointer resolution, for isolating base bugs.
    pub base_rewrite_only: bool,
    /// Treat every function as opted in, and admit globals and stack slots
    /// as base sources.  Test mode.
    pub all_functions: bool,
    /// Encode the language-level abstract state attached to calls into the
    /// statepoint operands.
    pub use_abstract_state: bool,
    pub no_entry: bool,
    pub no_backedge: bool,
    pub no_call: bool,
    /// Whole-function dataflow liveness; the alternative answers each site
    /// query on demand.
    pub dataflow_liveness: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verify_level: 1,
            all_backedges: false,
            base_rewrite_only: false,
            all_functions: false,
            use_abstract_state: false,
            no_entry: false,
            no_backedge: false,
            no_call: false,
            dataflow_liveness: true,
        }
    }
}

impl Config {
    fn liveness_mode(&self) -> liveness::Mode {
        if self.dataflow_liveness {
            liveness::Mode::Dataflow
        } else {
            liveness::Mode::OnDemand
        }
    }
}

// SECTION: errors

/// Failures that abort the pass.  Configuration faults concern the poll
/// function the frontend must supply; precondition violations are inputs
/// the pass refuses to transform.  Internal invariant failures are
/// assertions, not errors: they are compiler bugs.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum PassError {
    #[display(fmt = "safepoint_poll is not defined in the module")]
    MissingPollFunction,
    #[display(fmt = "safepoint_poll has an empty body")]
    EmptyPollFunction,
    #[display(fmt = "safepoint_poll is malformed: {}", _0)]
    MalformedPollFunction(String),
    #[display(fmt = "{}: GC pointer {} is reconstituted from an integer", _0, _1)]
    IntToPtrCast(FuncId, ValueId),
    #[display(fmt = "{}: unsupported GC pointer source: {}", _0, _1)]
    UnsupportedBaseSource(FuncId, String),
    #[display(fmt = "invalid IR: {}", _0)]
    Validation(ValidationError),
}

impl std::error::Error for PassError {}

impl From<ValidationError> for PassError {
    fn from(e: ValidationError) -> Self {
        PassError::Validation(e)
    }
}

// SECTION: per-site records

/// The phases a parse point moves through.  Transitions are one-way.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SiteState {
    Nominated,
    LivenessComputed,
    BasesResolved,
    Materialized,
    Rewritten,
}

/// Everything the pass knows about one parse point.
#[derive(Clone, Debug)]
pub struct SafepointRecord {
    /// The call instruction to be replaced.  Kept current as surrounding
    /// instructions are inserted.
    pub site: InstId,
    pub state: SiteState,
    /// GC-pointer values live across the site.
    pub live: Set<ValueId>,
    /// derived -> base for every live value; bases are self-mapped.
    pub base_pairs: Map<ValueId, ValueId>,
    /// Values inserted while resolving this site's bases.
    pub new_defs: Set<ValueId>,
    /// The ordered live region of the materialized statepoint; relocate
    /// indices point into this.
    pub live_order: Vec<ValueId>,
    /// live value -> the relocate projection reading its post-safepoint
    /// value.
    pub relocations: Map<ValueId, ValueId>,
    pub token: Option<ValueId>,
    /// Last value of the inserted sequence (a relocate or the result).
    pub last: Option<ValueId>,
    /// The result projection replacing the original call result.
    pub result: Option<ValueId>,
}

impl SafepointRecord {
    fn new(site: InstId) -> Self {
        SafepointRecord {
            site,
            state: SiteState::Nominated,
            live: Set::new(),
            base_pairs: Map::new(),
            new_defs: Set::new(),
            live_order: vec![],
            relocations: Map::new(),
            token: None,
            last: None,
            result: None,
        }
    }

    pub(crate) fn advance(&mut self, to: SiteState) {
        assert!(self.state < to, "site state moved backwards: {:?} -> {to:?}", self.state);
        self.state = to;
    }
}

/// Read-only module context shared by all per-function work.
pub struct ModuleInfo {
    pub leaf: Set<FuncId>,
    pub poll: Option<Function>,
    pub callees: Map<FuncId, Type>,
}

// SECTION: pass driver

/// Run the pass over every participating function of the program.
pub fn place_safepoints(p: Valid<Program>, config: &Config) -> Result<Valid<Program>, PassError> {
    let mut program = p.0;
    if config.verify_level >= 1 {
        program.check_valid()?;
    }

    let info = ModuleInfo {
        leaf: leaf_callees(&program),
        poll: program.functions.get(&func_id(SAFEPOINT_POLL)).cloned(),
        callees: program.callee_types(),
    };

    for f in program.functions.values_mut() {
        if f.id.name() == SAFEPOINT_POLL {
            continue;
        }
        let wants = Wants {
            entry: !config.no_entry && (config.all_functions || f.has_attr(ATTR_ENTRY)),
            backedge: !config.no_backedge && (config.all_functions || f.has_attr(ATTR_BACKEDGE)),
            call: !config.no_call && (config.all_functions || f.has_attr(ATTR_CALL)),
        };
        if !wants.any() {
            continue;
        }
        rewrite_function(f, &info, config, wants)?;
    }

    if config.verify_level >= 1 {
        program.check_valid()?;
    }
    Ok(Valid(program))
}

fn leaf_callees(program: &Program) -> Set<FuncId> {
    program
        .functions
        .keys()
        .chain(program.externs.keys())
        .filter(|id| program.is_gc_leaf(id))
        .cloned()
        .collect()
}

#[derive(Copy, Clone)]
pub(crate) struct Wants {
    entry: bool,
    backedge: bool,
    call: bool,
}

impl Wants {
    fn any(&self) -> bool {
        self.entry || self.backedge || self.call
    }
}

fn rewrite_function(
    f: &mut Function,
    info: &ModuleInfo,
    config: &Config,
    wants: Wants,
) -> Result<(), PassError> {
    debug!("placing safepoints in {}", f.id);
    analysis::remove_unreachable_blocks(f);

    let mut namer = NameGenerator::new(f);

    // A: nominate poll locations while the CFG is still the frontend's
    let dom = DomTree::new(f);
    let all_loops = loops::find_loops(f, &dom);
    let mut poll_blocks: Set<BbId> = Set::new();
    if wants.entry {
        poll_blocks.insert(poll_sites::entry_poll_block(f));
    }
    if wants.backedge {
        poll_blocks.extend(poll_sites::backedge_poll_blocks(f, &all_loops, config));
    }

    // B: splice the poll body in front of each location; its non-leaf
    // calls become parse points
    let mut parse_points: Set<InstId> = Set::new();
    if !poll_blocks.is_empty() {
        let poll = info.poll.as_ref().ok_or(PassError::MissingPollFunction)?;
        poll_inline::check_poll_function(poll)?;
        for bb in &poll_blocks {
            parse_points.extend(poll_inline::insert_poll_before_terminator(
                f, bb, poll, &mut namer, info,
            ));
        }
        if config.verify_level >= 2 {
            ir::validate::check_function(&info.callees, f)?;
        }
    }

    // A continued: nominate the original non-leaf call sites.  Scanning
    // after poll inlining keeps instruction indices stable; the scan also
    // re-finds the poll-introduced calls, which the set unifies.
    if wants.call {
        parse_points.extend(poll_sites::call_parse_points(f, info));
    }

    let mut records: Vec<SafepointRecord> =
        parse_points.into_iter().map(SafepointRecord::new).collect();
    debug!("{}: {} parse points", f.id, records.len());
    if records.is_empty() {
        return Ok(());
    }

    // C: liveness at every parse point
    {
        let cfg = Cfg::new(f);
        let engine = liveness::LivenessEngine::new(f, &cfg, config.liveness_mode());
        for rec in &mut records {
            rec.live = engine.live_after(&rec.site);
            rec.advance(SiteState::LivenessComputed);
        }
    }

    // D: base pointers for every live value, with merge synthesis
    let dom = DomTree::new(f);
    let new_defs = base_pointers::resolve_all(f, &dom, &mut namer, &mut records, config)?;
    for rec in &mut records {
        rec.advance(SiteState::BasesResolved);
    }
    if config.verify_level >= 2 {
        ir::validate::check_function(&info.callees, f)?;
    }

    // the inserted merges can themselves be live at other sites: recompute
    // liveness against the mutated IR and fold them in as their own bases
    {
        let cfg = Cfg::new(f);
        let engine = liveness::LivenessEngine::new(f, &cfg, config.liveness_mode());
        for rec in &mut records {
            let recomputed = engine.live_after(&rec.site);
            debug_assert!(
                rec.live.iter().all(|v| recomputed.contains(v)),
                "liveness shrank after base insertion"
            );
            rec.live = recomputed;
        }
        base_pointers::integrate_new_defs(f, &cfg, &dom, &mut records, &new_defs);
    }

    if config.base_rewrite_only {
        return Ok(());
    }

    // E: materialize every site as statepoint + result + relocates
    statepoints::materialize_all(f, &mut records, &mut namer, config, info)?;
    if config.verify_level >= 2 {
        ir::validate::check_function(&info.callees, f)?;
    }

    // F: route every surviving use through the relocated values
    relocation::rewrite_relocations(f, &mut records, &mut namer);
    if config.verify_level >= 2 {
        ir::validate::check_function(&info.callees, f)?;
    }

    Ok(())
}
