use std::collections::BTreeSet;

use thiserror::Error;

use crate::backend::Error as BackendError;
use crate::bv::BitVec;
use crate::expr::{Assignment, SymVar};
use crate::solver::SolverContext;
use crate::state::MachineState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no found state to extract a solution from")]
    Unsatisfiable,
    #[error("path constraints of the found state have no model")]
    Infeasible,
    #[error(transparent)]
    SolverTimeout(#[from] BackendError),
}

/// Concrete inputs that drive execution down a found path.
#[derive(Debug, Clone)]
pub struct Solution {
    symbols: Vec<SymVar>,
    values: Vec<BitVec>,
    model: Assignment,
}

impl Solution {
    /// One value per requested symbol, all from a single model of the
    /// state's path constraints.
    pub fn extract(
        solver: &SolverContext,
        found: Option<&MachineState>,
        symbols: &[SymVar],
    ) -> Result<Self, Error> {
        let state = found.ok_or(Error::Unsatisfiable)?;

        let requested = symbols.iter().cloned().collect::<BTreeSet<_>>();
        let mut vars = symbols.to_vec();
        for constraint in state.constraints().iter() {
            vars.extend(
                constraint
                    .variables()
                    .into_iter()
                    .filter(|var| !requested.contains(var)),
            );
        }
        let vars = {
            let mut seen = BTreeSet::new();
            vars.into_iter()
                .filter(|var| seen.insert(var.clone()))
                .collect::<Vec<_>>()
        };

        let values = solver
            .model(state.constraints(), &vars)?
            .ok_or(Error::Infeasible)?;

        let model = vars
            .iter()
            .cloned()
            .zip(values.iter().copied())
            .collect::<Assignment>();

        let values = symbols
            .iter()
            .map(|var| model.get(var).copied().unwrap_or_else(|| BitVec::zero(var.bits())))
            .collect();

        Ok(Self {
            symbols: symbols.to_vec(),
            values,
            model,
        })
    }

    pub fn symbols(&self) -> &[SymVar] {
        &self.symbols
    }

    /// Values in the order the symbols were requested.
    pub fn values(&self) -> &[BitVec] {
        &self.values
    }

    pub fn get(&self, var: &SymVar) -> Option<BitVec> {
        self.model.get(var).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SymVar, &BitVec)> {
        self.symbols.iter().zip(self.values.iter())
    }

    pub fn model(&self) -> &Assignment {
        &self.model
    }

    /// Requested values laid out as little-endian bytes, one after another.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(BitVec::to_le_bytes).collect()
    }

    /// Every path constraint of `state` holds under this solution.
    pub fn satisfies(&self, state: &MachineState) -> bool {
        state
            .constraints()
            .iter()
            .all(|constraint| matches!(constraint.evaluate(&self.model), Some(v) if v.is_one()))
    }
}
