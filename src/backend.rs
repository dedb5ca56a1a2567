use thiserror::Error;

use crate::bv::BitVec;
use crate::expr::{SymExpr, SymVar};

#[derive(Debug, Error)]
pub enum Error {
    #[error("solver query timed out or returned unknown")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SatResult {
    Sat,
    Unsat,
    Unknown,
}

impl SatResult {
    /// Unknown counts as possible: a branch is only dropped on a proof.
    pub fn is_possible(&self) -> bool {
        !matches!(self, SatResult::Unsat)
    }
}

/// Satisfiability oracle over conjunctions of one-bit constraints.
///
/// Implementations must answer independent queries concurrently; nothing
/// about one query may leak into the next.
pub trait ValueSolver: Send + Sync {
    fn is_sat(&self, constraints: &[SymExpr]) -> SatResult;

    /// Values for `vars` under one model of `constraints`; `Ok(None)` if
    /// there is none.
    fn model(&self, constraints: &[SymExpr], vars: &[SymVar]) -> Result<Option<Vec<BitVec>>, Error>;

    /// Up to `limit` distinct values `expr` can take. Fails with
    /// `Error::Timeout` if the oracle gives up before the values are
    /// exhausted or the limit is reached.
    fn solve_many(&self, expr: &SymExpr, constraints: &[SymExpr], limit: usize) -> Result<Vec<BitVec>, Error>;
}
