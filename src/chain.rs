//! Register chain solver.
//!
//! Walks the classified candidates in priority order and asks the
//! constraint engine how each one can produce the requested register
//! values. Inputs the gadget needs in other registers become nested
//! requests, solved recursively into setup chains that run first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::classify::classify;
use crate::config::SolverConfig;
use crate::gadget::{EndKind, Gadget, MemAccess};
use crate::symbolic::{filter_byte, Binding, Constraint, ConstraintEngine, Effects, Expr, VarAlias};
use crate::types::{significant_len, BadBytes, Reg, Value};

/// Requested register contents, in priority order.
pub type RegRequest = IndexMap<Reg, Value>;

/// What a [`Solution`] was found for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    Reg(Reg),
    /// Landing address of an indirect `jmp` / `call`.
    Rip,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Reg(r) => write!(f, "{}", r),
            Target::Rip => write!(f, "rip"),
        }
    }
}

/// How one target is satisfied by a step.
#[derive(Debug, Clone, Default)]
pub struct Solution {
    /// Stack slot offset (from the gadget's entry `rsp`) to value.
    pub stack: BTreeMap<u64, u64>,
    /// Chain that loads the gadget's register inputs; runs first.
    pub setup: Option<Chain>,
}

impl Solution {
    pub fn is_trivial(&self) -> bool {
        self.stack.is_empty() && self.setup.is_none()
    }
}

/// One gadget of a chain and what it was chosen for.
#[derive(Debug, Clone)]
pub struct Step {
    pub gadget: Rc<Gadget>,
    pub solutions: Vec<(Target, Solution)>,
    /// Registers clobbered by this step, setup chains included.
    pub written: BTreeSet<Reg>,
}

impl Step {
    pub fn stack_value(&self, offset: u64) -> Option<u64> {
        self.solutions.iter().find_map(|(_, s)| s.stack.get(&offset).copied())
    }

    pub fn setups(&self) -> impl Iterator<Item = &Chain> {
        self.solutions.iter().filter_map(|(_, s)| s.setup.as_ref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chain {
    pub steps: Vec<Step>,
    pub written: BTreeSet<Reg>,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every gadget in execution order, setup chains expanded.
    pub fn gadgets(&self) -> Vec<Rc<Gadget>> {
        let mut out = Vec::new();
        self.collect_gadgets(&mut out);
        out
    }

    fn collect_gadgets(&self, out: &mut Vec<Rc<Gadget>>) {
        for step in &self.steps {
            for setup in step.setups() {
                setup.collect_gadgets(out);
            }
            out.push(Rc::clone(&step.gadget));
        }
    }

    pub fn addresses(&self) -> Vec<u64> {
        self.gadgets().iter().map(|g| g.address).collect()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            let targets: Vec<String> = step.solutions.iter().map(|(t, _)| t.to_string()).collect();
            writeln!(f, "[{}] {}  ({})", i, step.gadget, targets.join(", "))?;
        }
        Ok(())
    }
}

/// Register and stack-slot requirements read off a model.
#[derive(Debug, Default)]
pub(crate) struct Requirements {
    pub regs: RegRequest,
    pub stack: BTreeMap<u64, u64>,
}

/// Split a model into stack-slot values and register prerequisites.
///
/// `None` if a binding names a register outside the general-purpose set
/// or something that is neither register nor stack, if a variable is bound
/// twice, or if a stack slot would carry `desired` while it contains a
/// forbidden byte.
pub(crate) fn sort_bindings(bindings: &[Binding], desired: u64, bad: &BadBytes) -> Option<Requirements> {
    let mut req = Requirements::default();
    for b in bindings {
        match &b.alias {
            VarAlias::Stack(off) => {
                if bad.hits(desired) {
                    trace!("stack slot {:#x} for {:#x} hits a forbidden byte", off, desired);
                    return None;
                }
                if req.stack.insert(*off, b.value).is_some_and(|v| v != b.value) {
                    return None;
                }
            }
            VarAlias::Register(r) if r.is_general_purpose() && !req.regs.contains_key(r) => {
                req.regs.insert(*r, Value::Literal(b.value));
            }
            other => {
                trace!("unusable binding {}", other);
                return None;
            }
        }
    }
    Some(req)
}

/// Add `more` to the slots claimed by a step; false on a conflicting value.
pub(crate) fn merge_stack(into: &mut BTreeMap<u64, u64>, more: &BTreeMap<u64, u64>) -> bool {
    if more.iter().any(|(off, v)| into.get(off).is_some_and(|old| old != v)) {
        return false;
    }
    into.extend(more.iter().map(|(k, v)| (*k, *v)));
    true
}

/// Recursion context shared by the resolutions of one candidate.
struct Frame<'a> {
    candidates: &'a [Rc<Gadget>],
    /// What the chain built so far clobbers.
    written: &'a BTreeSet<Reg>,
    nested: bool,
    depth: usize,
    top: &'a BTreeSet<Reg>,
}

pub struct ChainSolver<E> {
    engine: E,
    config: SolverConfig,
}

impl<E: ConstraintEngine> ChainSolver<E> {
    pub fn new(engine: E, config: SolverConfig) -> Self {
        ChainSolver { engine, config }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Find a chain that leaves every register of `request` holding its
    /// requested value. `None` when no chain exists under the current
    /// forbidden bytes, forbidden registers and depth budget.
    pub fn solve(&mut self, pool: Vec<Gadget>, request: &RegRequest) -> Option<Chain> {
        let pool = pool.into_iter().map(Rc::new).collect();
        self.solve_candidates(pool, request, &BTreeSet::new(), false)
    }

    /// Search over an already shared gadget list.
    ///
    /// `seed` is merged into the returned chain's written set. `nested`
    /// controls how the call seeds its own nested requests: a first-level
    /// call starts them from an empty written set, a nested call from the
    /// written set of the chain it has built so far.
    pub fn solve_candidates(
        &mut self,
        candidates: Vec<Rc<Gadget>>,
        request: &RegRequest,
        seed: &BTreeSet<Reg>,
        nested: bool,
    ) -> Option<Chain> {
        let top: BTreeSet<Reg> = request.keys().copied().collect();
        debug!("solve: {} gadgets for {}", candidates.len(), fmt_request(request));
        let chain = self.search(candidates, request, seed, nested, 0, &top);
        match &chain {
            Some(c) => debug!("solve: {} steps, writes {:?}", c.len(), c.written),
            None => debug!("solve: no chain"),
        }
        chain
    }

    fn search(
        &mut self,
        pool: Vec<Rc<Gadget>>,
        request: &RegRequest,
        seed: &BTreeSet<Reg>,
        nested: bool,
        depth: usize,
        top: &BTreeSet<Reg>,
    ) -> Option<Chain> {
        if depth > self.config.max_depth {
            trace!("depth {} exceeds budget for {}", depth, fmt_request(request));
            return None;
        }
        if request.is_empty() || pool.is_empty() {
            return None;
        }

        let targets: Vec<Reg> = request.keys().copied().collect();
        let candidates = classify(pool, &targets, &self.config).candidates;
        let protected: BTreeSet<Reg> = top.iter().chain(targets.iter()).copied().collect();

        let mut outstanding = request.clone();
        let mut solved: BTreeSet<Reg> = BTreeSet::new();
        let mut chain = Chain::default();

        for cand in &candidates {
            if !cand.writes_any(outstanding.keys()) {
                continue;
            }
            let Some(gadget) = self.land(cand, &candidates, &outstanding, &protected) else {
                continue;
            };
            let fx = gadget.effects(&mut self.engine);

            let frame = Frame {
                candidates: &candidates,
                written: &chain.written,
                nested,
                depth,
                top,
            };

            let mut solutions = Vec::new();
            let mut resolved = Vec::new();
            let mut slots = BTreeMap::new();
            for (&reg, &want) in &outstanding {
                if !gadget.writes(reg) {
                    continue;
                }
                let Some(sol) = self.resolve_register(&gadget, fx, reg, want, &frame) else {
                    trace!("{}: cannot set {} = {}", gadget, reg, want);
                    continue;
                };
                if !merge_stack(&mut slots, &sol.stack) {
                    trace!("{}: stack slots for {} conflict", gadget, reg);
                    continue;
                }
                resolved.push(reg);
                solutions.push((Target::Reg(reg), sol));
            }
            if resolved.is_empty() {
                continue;
            }

            if let Some(term) = gadget.terminal() {
                let Some(transfer) = fx.and_then(|f| f.transfer.clone()) else {
                    continue;
                };
                let Some(sol) = self.resolve_value(&transfer, term.address, false, &frame) else {
                    trace!("{}: cannot land on {:#x}", gadget, term.address);
                    continue;
                };
                if !merge_stack(&mut slots, &sol.stack) {
                    continue;
                }
                solutions.push((Target::Rip, sol));
            }

            let mut written = gadget.written.clone();
            if let Some(term) = gadget.terminal() {
                written.extend(term.written.iter().copied());
            }
            for (_, sol) in &solutions {
                if let Some(setup) = &sol.setup {
                    written.extend(setup.written.iter().copied());
                }
            }

            let clobbers = !written.is_disjoint(&solved);
            for r in &resolved {
                outstanding.shift_remove(r);
                solved.insert(*r);
            }
            chain.written.extend(written.iter().copied());
            debug!("accept {} for {:?}", gadget, resolved);

            let step = Step { gadget, solutions, written };
            if clobbers && !chain.steps.is_empty() {
                let at = chain
                    .steps
                    .iter()
                    .rposition(|s| resolved.iter().any(|r| s.written.contains(r)))
                    .map_or(0, |i| i + 1);
                chain.steps.insert(at, step);
            } else {
                chain.steps.push(step);
            }

            if outstanding.is_empty() {
                chain.written.extend(seed.iter().copied());
                return Some(chain);
            }
        }

        trace!("exhausted candidates, outstanding {}", fmt_request(&outstanding));
        None
    }

    /// Pair an indirect candidate with a `ret` gadget to land on.
    fn land(
        &self,
        cand: &Rc<Gadget>,
        candidates: &[Rc<Gadget>],
        outstanding: &RegRequest,
        protected: &BTreeSet<Reg>,
    ) -> Option<Rc<Gadget>> {
        let (Some(reg), Some(offset)) = (cand.end.transfer_reg(), cand.end.terminal_offset()) else {
            return Some(Rc::clone(cand));
        };
        if cand.terminal().is_some() {
            return Some(Rc::clone(cand));
        }
        if outstanding.contains_key(&reg) {
            trace!("{}: transfer register {} is requested", cand, reg);
            return None;
        }
        let term = candidates.iter().find(|t| {
            t.mem == MemAccess::None
                && t.end == EndKind::Return
                && t.sp_delta == offset
                && !self.config.bad_bytes.hits(t.address)
                && !t.writes_any(protected)
        });
        match term {
            Some(t) => Some(Rc::new(cand.paired_with(Rc::clone(t)))),
            None => {
                trace!("{}: nothing to land on", cand);
                None
            }
        }
    }

    fn resolve_register(
        &mut self,
        gadget: &Gadget,
        fx: Option<&Effects>,
        reg: Reg,
        want: Value,
        frame: &Frame<'_>,
    ) -> Option<Solution> {
        let defined = gadget.defined.get(&reg).copied();
        if defined == Some(want) {
            return Some(Solution::default());
        }
        match want {
            Value::Alias(target) => {
                let Some(Value::Alias(src)) = defined else {
                    return None;
                };
                let mut regs = RegRequest::new();
                regs.insert(src, Value::Alias(target));
                let setup = self.prerequisites(&regs, frame)?;
                Some(Solution { stack: BTreeMap::new(), setup: Some(setup) })
            }
            Value::Literal(v) => {
                let expr = fx?.reg(reg);
                self.resolve_value(&expr, v, true, frame)
            }
        }
    }

    /// Make `expr` evaluate to `value`, solving register inputs nested.
    fn resolve_value(&mut self, expr: &Expr, value: u64, filter: bool, frame: &Frame<'_>) -> Option<Solution> {
        let model = self.query(expr, value, filter)?;
        let req = sort_bindings(&model, value, &self.config.bad_bytes)?;
        let setup = if req.regs.is_empty() {
            None
        } else {
            Some(self.prerequisites(&req.regs, frame)?)
        };
        Some(Solution { stack: req.stack, setup })
    }

    fn prerequisites(&mut self, regs: &RegRequest, frame: &Frame<'_>) -> Option<Chain> {
        let (seed, nested) = if frame.nested {
            (frame.written.clone(), false)
        } else {
            (BTreeSet::new(), true)
        };
        trace!("nested request {} at depth {}", fmt_request(regs), frame.depth + 1);
        self.search(frame.candidates.to_vec(), regs, &seed, nested, frame.depth + 1, frame.top)
    }

    /// Ask the engine for `expr == value`.
    ///
    /// With `filter` set and forbidden bytes configured, the first query
    /// also keeps forbidden bytes out of the significant bytes of every
    /// sub-term of the simplified expression; if that has no model the
    /// plain equality is tried.
    pub(crate) fn query(&mut self, expr: &Expr, value: u64, filter: bool) -> Option<Vec<Binding>> {
        let goal = Constraint::eq(expr.clone(), Expr::constant(value, expr.bits()));

        if filter && !self.config.bad_bytes.is_empty() {
            let simplified = self.engine.simplify(expr);
            let children = simplified.children();
            let terms = if children.is_empty() { vec![&simplified] } else { children };
            let len = significant_len(value);

            let mut parts: Vec<Constraint> = Vec::new();
            for term in terms {
                for bad in self.config.bad_bytes.iter() {
                    parts.extend(filter_byte(term, bad, len));
                }
            }
            if !parts.is_empty() {
                parts.push(goal.clone());
                trace!("query {} == {:#x} avoiding bad bytes", expr, value);
                if let Some(model) = self.engine.solve(&Constraint::and(parts)) {
                    if !model.is_empty() {
                        return Some(model);
                    }
                }
            }
        }

        trace!("query {} == {:#x}", expr, value);
        self.engine.solve(&goal)
    }
}

fn fmt_request(request: &RegRequest) -> String {
    let parts: Vec<String> = request.iter().map(|(r, v)| format!("{}={}", r, v)).collect();
    format!("{{{}}}", parts.join(", "))
}
