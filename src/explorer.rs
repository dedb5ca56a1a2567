use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, trace};

use crate::executor::{Error as ExecutorError, Executor, Successor};
use crate::expr::SymVar;
use crate::ir::Program;
use crate::solution::{Error as SolutionError, Solution};
use crate::state::MachineState;

pub mod defaults {
    use std::time::Duration;

    pub const FIND_COUNT: usize = 1;
    pub const MAX_STEPS: Option<usize> = None;
    pub const MAX_DURATION: Option<Duration> = None;
}

/// Order in which active states are taken from the worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    BreadthFirst,
    DepthFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorerOptions {
    pub strategy: Strategy,
    /// Stop once this many states are found.
    pub find_count: usize,
    pub max_steps: Option<usize>,
    pub max_duration: Option<Duration>,
}

impl Default for ExplorerOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            find_count: defaults::FIND_COUNT,
            max_steps: defaults::MAX_STEPS,
            max_duration: defaults::MAX_DURATION,
        }
    }
}

impl ExplorerOptions {
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_find_count(mut self, find_count: usize) -> Self {
        self.find_count = find_count.max(1);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(usize);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stash {
    Active,
    Found,
    Avoided,
    Errored,
    /// Exited without matching either predicate.
    Deadended,
    /// Forked; its successors live in slots of their own.
    Stepped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Found,
    /// No active state is left and none was found.
    Exhausted,
    /// The step or time budget ran out with states still active.
    BudgetExceeded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub active: usize,
    pub found: usize,
    pub avoided: usize,
    pub errored: usize,
    pub deadended: usize,
}

impl fmt::Display for Counts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} active, {} found, {} avoided, {} errored, {} deadended",
            self.active, self.found, self.avoided, self.errored, self.deadended
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub outcome: Outcome,
    pub steps: usize,
    pub counts: Counts,
    pub elapsed: Duration,
}

struct Entry {
    state: Option<MachineState>,
    parent: Option<StateId>,
    stash: Stash,
}

/// Worklist explorer over an arena of states.
///
/// States are never shared: stepping takes a state out of its arena slot.
/// A lone successor goes back into the same slot, so an id names one
/// straight-line run of a path and the arena grows with forks rather than
/// with steps. On a fork the slot is emptied and marked `Stepped`, and
/// each successor gets a fresh slot whose parent is the forking id.
pub struct PathExplorer<P: Program> {
    executor: Executor<P>,
    options: ExplorerOptions,
    arena: Vec<Entry>,
    active: VecDeque<StateId>,
    found: Vec<StateId>,
    avoided: Vec<StateId>,
    errored: Vec<(StateId, ExecutorError)>,
    deadended: Vec<StateId>,
    steps: usize,
}

impl<P: Program> PathExplorer<P> {
    pub fn new(executor: Executor<P>, root: MachineState) -> Self {
        Self::new_with(executor, root, ExplorerOptions::default())
    }

    pub fn new_with(executor: Executor<P>, root: MachineState, options: ExplorerOptions) -> Self {
        let mut explorer = Self {
            executor,
            options,
            arena: Vec::new(),
            active: VecDeque::new(),
            found: Vec::new(),
            avoided: Vec::new(),
            errored: Vec::new(),
            deadended: Vec::new(),
            steps: 0,
        };

        let root = explorer.insert(Some(root), None);
        explorer.active.push_back(root);
        explorer
    }

    fn insert(&mut self, state: Option<MachineState>, parent: Option<StateId>) -> StateId {
        let id = StateId(self.arena.len());
        self.arena.push(Entry {
            state,
            parent,
            stash: Stash::Active,
        });
        id
    }

    fn next_active(&mut self) -> Option<StateId> {
        match self.options.strategy {
            Strategy::BreadthFirst => self.active.pop_front(),
            Strategy::DepthFirst => self.active.pop_back(),
        }
    }

    fn budget_exhausted(&self, started: Instant) -> bool {
        self.options.max_steps.map_or(false, |max| self.steps >= max)
            || self
                .options
                .max_duration
                .map_or(false, |max| started.elapsed() >= max)
    }

    /// Run until `find_count` states are found, the frontier empties or the
    /// budget runs out. The predicates see a state's output only.
    pub fn explore<S, F>(&mut self, is_success: S, is_failure: F) -> Report
    where
        S: Fn(&[u8]) -> bool,
        F: Fn(&[u8]) -> bool,
    {
        let started = Instant::now();
        let mut budget_hit = false;

        while self.found.len() < self.options.find_count && !self.active.is_empty() {
            if self.budget_exhausted(started) {
                budget_hit = true;
                break;
            }

            let id = match self.next_active() {
                Some(id) => id,
                None => break,
            };

            let state = match self.arena[id.0].state.take() {
                Some(state) => state,
                None => continue,
            };

            self.steps += 1;
            trace!("step {}: {} {}", self.steps, id, state);

            let successors = self.executor.step(state);
            let forked = successors.len() != 1;
            if forked {
                debug!("{} forked into {} states", id, successors.len());
                self.arena[id.0].stash = Stash::Stepped;
            }

            for successor in successors {
                let slot = if forked { self.insert(None, Some(id)) } else { id };
                self.classify(slot, successor, &is_success, &is_failure);
            }
        }

        let outcome = if !self.found.is_empty() {
            Outcome::Found
        } else if budget_hit {
            Outcome::BudgetExceeded
        } else {
            Outcome::Exhausted
        };

        let report = Report {
            outcome,
            steps: self.steps,
            counts: self.counts(),
            elapsed: started.elapsed(),
        };

        info!(
            "exploration finished: {:?} after {} step(s) in {:?} ({})",
            report.outcome, report.steps, report.elapsed, report.counts
        );

        report
    }

    /// Store `successor` in slot `id` and file it under its stash.
    fn classify<S, F>(&mut self, id: StateId, successor: Successor, is_success: &S, is_failure: &F)
    where
        S: Fn(&[u8]) -> bool,
        F: Fn(&[u8]) -> bool,
    {
        let (state, fault) = match successor {
            Successor::Active(state) => (state, None),
            Successor::Faulted(state, e) => (state, Some(e)),
        };

        let stash = if is_failure(state.output()) {
            self.avoided.push(id);
            Stash::Avoided
        } else if is_success(state.output()) {
            self.found.push(id);
            Stash::Found
        } else if let Some(e) = fault {
            self.errored.push((id, e));
            Stash::Errored
        } else if state.is_exited() {
            self.deadended.push(id);
            Stash::Deadended
        } else {
            self.active.push_back(id);
            Stash::Active
        };

        if stash != Stash::Active {
            debug!("{} -> {:?}", id, stash);
        }

        let entry = &mut self.arena[id.0];
        entry.state = Some(state);
        entry.stash = stash;
    }

    pub fn executor(&self) -> &Executor<P> {
        &self.executor
    }

    pub fn options(&self) -> &ExplorerOptions {
        &self.options
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn counts(&self) -> Counts {
        Counts {
            active: self.active.len(),
            found: self.found.len(),
            avoided: self.avoided.len(),
            errored: self.errored.len(),
            deadended: self.deadended.len(),
        }
    }

    /// Ids handed out so far.
    pub fn tracked(&self) -> usize {
        self.arena.len()
    }

    pub fn state(&self, id: StateId) -> Option<&MachineState> {
        self.arena.get(id.0).and_then(|entry| entry.state.as_ref())
    }

    pub fn stash(&self, id: StateId) -> Option<Stash> {
        self.arena.get(id.0).map(|entry| entry.stash)
    }

    pub fn parent(&self, id: StateId) -> Option<StateId> {
        self.arena.get(id.0).and_then(|entry| entry.parent)
    }

    fn states<'a>(&'a self, ids: impl Iterator<Item = StateId> + 'a) -> impl Iterator<Item = &'a MachineState> + 'a {
        ids.filter_map(move |id| self.state(id))
    }

    pub fn active(&self) -> impl Iterator<Item = &MachineState> + '_ {
        self.states(self.active.iter().copied())
    }

    pub fn found(&self) -> impl Iterator<Item = &MachineState> + '_ {
        self.states(self.found.iter().copied())
    }

    pub fn avoided(&self) -> impl Iterator<Item = &MachineState> + '_ {
        self.states(self.avoided.iter().copied())
    }

    pub fn deadended(&self) -> impl Iterator<Item = &MachineState> + '_ {
        self.states(self.deadended.iter().copied())
    }

    pub fn errored(&self) -> impl Iterator<Item = (&MachineState, &ExecutorError)> + '_ {
        self.errored
            .iter()
            .filter_map(move |(id, e)| self.state(*id).map(|state| (state, e)))
    }

    pub fn found_ids(&self) -> &[StateId] {
        &self.found
    }

    /// Concrete values for `symbols` from the first found state.
    pub fn solution(&self, symbols: &[SymVar]) -> Result<Solution, SolutionError> {
        Solution::extract(self.executor.solver(), self.found().next(), symbols)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use either::Either;

    use super::*;
    use crate::arch::{x86, Convention};
    use crate::bv::BitVec;
    use crate::expr::{BinRel, SymExpr};
    use crate::ir::{Opcode, Operand, ProgramImage};
    use crate::solver::tests::Undecided;
    use crate::solver::SolverContext;

    const BASE: u64 = 0x400000;

    // if eax == 7 { "yes" } else { "no" }
    fn branchy() -> ProgramImage {
        ProgramImage::assemble(
            BASE,
            1,
            vec![
                Opcode::IntCompare {
                    op: BinRel::EQ,
                    destination: Operand::variable(0, 1),
                    lhs: Operand::register(x86::EAX, 4),
                    rhs: Operand::constant(7, 4),
                },
                Opcode::CBranch {
                    target: BASE + 4,
                    condition: Operand::variable(0, 1),
                },
                Opcode::output("no"),
                Opcode::Exit,
                Opcode::output("yes"),
                Opcode::Exit,
            ],
        )
    }

    fn root() -> MachineState {
        let mut state = MachineState::new(BASE);
        state.write_register(x86::EAX, Either::Right(SymExpr::var(SymVar::new("x", 32))));
        state
    }

    fn explorer(solver: SolverContext, options: ExplorerOptions) -> PathExplorer<ProgramImage> {
        let executor = Executor::new(Arc::new(branchy()), solver, Convention::x86());
        PathExplorer::new_with(executor, root(), options)
    }

    #[test]
    fn partitions_states() {
        let mut explorer = explorer(SolverContext::new(Undecided), ExplorerOptions::default());
        let report = explorer.explore(|out| out == b"yes", |out| out == b"no");

        assert_eq!(report.outcome, Outcome::Found);
        assert_eq!(explorer.found().count(), 1);
        assert_eq!(explorer.found().next().unwrap().output(), b"yes");

        let id = explorer.found_ids()[0];
        assert_eq!(explorer.stash(id), Some(Stash::Found));
        let parent = explorer.parent(id).unwrap();
        assert_eq!(explorer.stash(parent), Some(Stash::Stepped));
        assert!(explorer.state(parent).is_none());
        assert_eq!(explorer.parent(parent), None);
        assert_eq!(explorer.tracked(), 3);
    }

    #[test]
    fn unmatched_exits_are_deadended() {
        let mut explorer = explorer(SolverContext::new(Undecided), ExplorerOptions::default());
        let report = explorer.explore(|_| false, |_| false);

        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.counts.deadended, 2);
        assert_eq!(report.counts.active, 0);
        assert_eq!(explorer.deadended().count(), 2);
    }

    #[test]
    fn depth_first_reaches_the_same_states() {
        let options = ExplorerOptions::default()
            .with_strategy(Strategy::DepthFirst)
            .with_find_count(2);
        let mut explorer = explorer(SolverContext::new(Undecided), options);
        let report = explorer.explore(|out| !out.is_empty(), |_| false);

        assert_eq!(report.outcome, Outcome::Found);
        let mut outputs = explorer.found().map(|s| s.output().to_vec()).collect::<Vec<_>>();
        outputs.sort();
        assert_eq!(outputs, vec![b"no".to_vec(), b"yes".to_vec()]);
    }

    #[test]
    fn step_budget_is_inconclusive() {
        let options = ExplorerOptions::default().with_max_steps(2);
        let mut explorer = explorer(SolverContext::new(Undecided), options);
        let report = explorer.explore(|out| out == b"yes", |_| false);

        assert_eq!(report.outcome, Outcome::BudgetExceeded);
        assert_eq!(report.steps, 2);
        assert_eq!(report.counts.active, 2);
    }

    #[test]
    fn concrete_root_follows_one_path() {
        let executor = Executor::new(Arc::new(branchy()), SolverContext::new(Undecided), Convention::x86());
        let mut state = MachineState::new(BASE);
        state.write_register(x86::EAX, Either::Left(BitVec::new(7, 32)));

        let mut explorer = PathExplorer::new(executor, state);
        let report = explorer.explore(|out| out == b"yes", |out| out == b"no");

        assert_eq!(report.outcome, Outcome::Found);
        assert_eq!(report.counts.avoided, 0);
        assert!(explorer.found().next().unwrap().constraints().is_empty());
        assert_eq!(explorer.found_ids(), &[StateId(0)]);
        assert_eq!(explorer.tracked(), 1);
    }

    #[test]
    fn straight_line_runs_keep_their_slot() {
        let program = ProgramImage::assemble(BASE, 1, vec![Opcode::Nop, Opcode::Branch { target: BASE }]);
        let executor = Executor::new(Arc::new(program), SolverContext::new(Undecided), Convention::x86());

        let mut explorer = PathExplorer::new_with(executor, root(), ExplorerOptions::default().with_max_steps(40));
        let report = explorer.explore(|_| false, |_| false);

        assert_eq!(report.outcome, Outcome::BudgetExceeded);
        assert_eq!(report.steps, 40);
        assert_eq!(explorer.tracked(), 1);
        assert_eq!(explorer.stash(StateId(0)), Some(Stash::Active));
        assert_eq!(explorer.state(StateId(0)).map(MachineState::depth), Some(40));
    }

    #[test]
    fn zero_time_budget_is_inconclusive() {
        let options = ExplorerOptions::default().with_max_duration(Duration::ZERO);
        let mut explorer = explorer(SolverContext::new(Undecided), options);
        let report = explorer.explore(|out| out == b"yes", |_| false);

        assert_eq!(report.outcome, Outcome::BudgetExceeded);
        assert_eq!(report.steps, 0);
        assert_eq!(report.counts.active, 1);
        assert_eq!(explorer.stash(StateId(0)), Some(Stash::Active));
    }
}
