use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use parking_lot::Mutex;

use crate::backend::{Error, SatResult, ValueSolver};
use crate::bv::BitVec;
use crate::constraint::ConstraintStore;
use crate::expr::{SymExpr, SymVar};

pub mod z3;

pub const SOLVER_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverStats {
    pub queries: usize,
    pub sat: usize,
    pub unsat: usize,
    pub unknown: usize,
}

/// Shared handle to the oracle; clones talk to the same backend and
/// accumulate into the same statistics.
#[derive(Clone)]
pub struct SolverContext {
    backend: Arc<dyn ValueSolver>,
    stats: Arc<Mutex<SolverStats>>,
    limit: usize,
}

impl fmt::Debug for SolverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverContext")
            .field("limit", &self.limit)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

enum Trivial {
    True,
    False,
    Open(Vec<SymExpr>),
}

fn triage(constraints: &ConstraintStore) -> Trivial {
    let mut open = Vec::with_capacity(constraints.len());
    for constraint in constraints.iter() {
        if constraint.is_false() {
            return Trivial::False;
        } else if !constraint.is_true() {
            open.push(constraint.clone());
        }
    }

    if open.is_empty() {
        Trivial::True
    } else {
        Trivial::Open(open)
    }
}

impl SolverContext {
    pub fn new<S>(solver: S) -> Self
    where
        S: ValueSolver + 'static,
    {
        Self::new_with(solver, SOLVER_LIMIT)
    }

    pub fn new_with<S>(solver: S, limit: usize) -> Self
    where
        S: ValueSolver + 'static,
    {
        Self {
            backend: Arc::new(solver),
            stats: Arc::new(Mutex::new(SolverStats::default())),
            limit,
        }
    }

    /// Context over a Z3 backend without a query timeout.
    pub fn z3() -> Self {
        Self::new(self::z3::Z3Solver::new())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn stats(&self) -> SolverStats {
        *self.stats.lock()
    }

    fn record(&self, result: SatResult) {
        let mut stats = self.stats.lock();
        stats.queries += 1;
        match result {
            SatResult::Sat => stats.sat += 1,
            SatResult::Unsat => stats.unsat += 1,
            SatResult::Unknown => stats.unknown += 1,
        }
    }

    pub fn is_sat(&self, constraints: &ConstraintStore) -> SatResult {
        match triage(constraints) {
            Trivial::True => SatResult::Sat,
            Trivial::False => SatResult::Unsat,
            Trivial::Open(open) => {
                let result = self.backend.is_sat(&open);
                self.record(result);
                if result == SatResult::Unknown {
                    warn!("solver returned unknown for {} constraint(s); keeping path", open.len());
                }
                result
            }
        }
    }

    pub fn model(&self, constraints: &ConstraintStore, vars: &[SymVar]) -> Result<Option<Vec<BitVec>>, Error> {
        let open = match triage(constraints) {
            Trivial::False => return Ok(None),
            Trivial::True => Vec::new(),
            Trivial::Open(open) => open,
        };

        let result = self.backend.model(&open, vars);
        self.record(match result {
            Ok(Some(_)) => SatResult::Sat,
            Ok(None) => SatResult::Unsat,
            Err(_) => SatResult::Unknown,
        });

        if result.is_err() {
            warn!("solver gave no model for {} variable(s)", vars.len());
        }
        result
    }

    /// Up to `limit` values `expr` can take under `constraints`.
    pub fn solve_many(&self, expr: &SymExpr, constraints: &ConstraintStore) -> Result<Vec<BitVec>, Error> {
        if let Some(bv) = expr.as_val() {
            return Ok(vec![*bv]);
        }

        let open = match triage(constraints) {
            Trivial::False => return Ok(Vec::new()),
            Trivial::True => Vec::new(),
            Trivial::Open(open) => open,
        };

        let result = self.backend.solve_many(expr, &open, self.limit);
        self.record(match result {
            Ok(ref values) if values.is_empty() => SatResult::Unsat,
            Ok(_) => SatResult::Sat,
            Err(_) => SatResult::Unknown,
        });

        match result {
            Ok(ref values) => debug!("{} resolves to {} value(s) (limit {})", expr, values.len(), self.limit),
            Err(ref e) => warn!("enumerating values of {} stopped early: {}", expr, e),
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Oracle that never decides anything.
    pub(crate) struct Undecided;

    impl ValueSolver for Undecided {
        fn is_sat(&self, _constraints: &[SymExpr]) -> SatResult {
            SatResult::Unknown
        }

        fn model(&self, _constraints: &[SymExpr], _vars: &[SymVar]) -> Result<Option<Vec<BitVec>>, Error> {
            Err(Error::Timeout)
        }

        fn solve_many(&self, _expr: &SymExpr, _constraints: &[SymExpr], _limit: usize) -> Result<Vec<BitVec>, Error> {
            Err(Error::Timeout)
        }
    }

    #[test]
    fn constant_constraints_short_circuit() {
        let solver = SolverContext::new(Undecided);

        let mut store = ConstraintStore::new();
        store.push(SymExpr::bool(true));
        assert_eq!(solver.is_sat(&store), SatResult::Sat);

        store.push(SymExpr::bool(false));
        assert_eq!(solver.is_sat(&store), SatResult::Unsat);
        assert!(matches!(solver.model(&store, &[]), Ok(None)));

        assert_eq!(solver.stats().queries, 0);
    }

    #[test]
    fn unknown_is_counted_and_possible() {
        let solver = SolverContext::new(Undecided);

        let mut store = ConstraintStore::new();
        store.push(SymExpr::var(SymVar::new("c", 1)));

        let result = solver.is_sat(&store);
        assert!(result.is_possible());
        assert_eq!(solver.clone().stats().unknown, 1);
    }

    #[test]
    fn undecided_enumeration_is_an_error() {
        let solver = SolverContext::new(Undecided);
        let x = SymExpr::var(SymVar::new("x", 32));

        let mut store = ConstraintStore::new();
        store.push(x.clone().lt(SymExpr::constant(4, 32)));

        assert!(matches!(solver.solve_many(&x, &store), Err(Error::Timeout)));
        assert_eq!(solver.stats().unknown, 1);

        let constant = SymExpr::constant(7, 32);
        assert_eq!(solver.solve_many(&constant, &store).unwrap(), vec![BitVec::new(7, 32)]);
        assert_eq!(solver.stats().queries, 1);
    }
}
