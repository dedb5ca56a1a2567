use std::sync::Arc;

use either::Either;

use log::{debug, trace};

use smallvec::{smallvec, SmallVec};

use thiserror::Error;

use crate::arch::Convention;
use crate::backend::Error as BackendError;
use crate::bv::BitVec;
use crate::expr::{BinOp, BinRel, SymExpr, UnOp};
use crate::ir::{Instruction, Opcode, Operand, Program};
use crate::solver::SolverContext;
use crate::state::{from_expr, Error as StateError, MachineState, Value, ValueExt, OPERAND_SIZE};

#[derive(Debug, Error)]
pub enum Error {
    #[error("division by zero at {0:#x}")]
    DivisionByZero(u64),
    #[error("state exited before {0:#x}")]
    Exited(u64),
    #[error("no instruction at {0:#x}")]
    NoInstruction(u64),
    #[error("solver gave up resolving the target at {0:#x}")]
    SolverTimeout(u64, #[source] BackendError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("program counter value is unsatisfiable at {0:#x}")]
    UnsatisfiablePC(u64),
    #[error("unmodeled operation {0} at {1:#x}")]
    UnmodeledOperation(String, u64),
}

pub type States = SmallVec<[MachineState; 2]>;

#[derive(Debug)]
pub enum Successor {
    Active(MachineState),
    /// The state as it was before the faulting instruction.
    Faulted(MachineState, Error),
}

impl Successor {
    pub fn state(&self) -> &MachineState {
        match self {
            Self::Active(state) | Self::Faulted(state, _) => state,
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_, _))
    }
}

pub type Successors = SmallVec<[Successor; 2]>;

pub struct Executor<P: Program> {
    program: Arc<P>,
    solver: SolverContext,
    convention: Convention,
}

impl<P: Program> Executor<P> {
    pub fn new(program: Arc<P>, solver: SolverContext, convention: Convention) -> Self {
        Self {
            program,
            solver,
            convention,
        }
    }

    pub fn program(&self) -> &P {
        &self.program
    }

    pub fn solver(&self) -> &SolverContext {
        &self.solver
    }

    pub fn convention(&self) -> &Convention {
        &self.convention
    }

    /// Execute the instruction at the state's program counter.
    pub fn step(&self, state: MachineState) -> Successors {
        let pc = state.pc();
        let insn = match self.program.instruction(pc) {
            Some(insn) => insn,
            None => return smallvec![Successor::Faulted(state, Error::NoInstruction(pc))],
        };

        trace!("{} {}", state, insn);

        match self.apply(&state, insn) {
            Ok(states) => states.into_iter().map(Successor::Active).collect(),
            Err(e) => {
                debug!("{} faulted: {}", state, e);
                smallvec![Successor::Faulted(state, e)]
            }
        }
    }

    /// Successors of `state` after `insn`. Nothing is written to `state`
    /// itself, so on error it is still the pre-instruction state.
    pub fn apply(&self, state: &MachineState, insn: &Instruction) -> Result<States, Error> {
        let address = insn.address;
        let fallthrough = insn.next();

        if state.is_exited() {
            return Err(Error::Exited(address));
        }

        let mut next = state.fork();

        match insn.kind {
            Opcode::Nop => (),
            Opcode::Copy { ref destination, ref source } => {
                let value = next.read_operand(source)?;
                next.write_operand(destination, value)?;
            }
            Opcode::Load { ref destination, ref address } => {
                let address = next.read_operand(address)?;
                let value = next.read_memory(&address, destination.size())?;
                next.write_operand(destination, value)?;
            }
            Opcode::Store { ref address, ref source } => {
                let address = next.read_operand(address)?;
                let value = next.read_operand(source)?;
                next.write_memory(&address, &value)?;
            }
            Opcode::IntUnary { op, ref destination, ref operand } => {
                self.lift_int1(&mut next, op, destination, operand)?;
            }
            Opcode::IntBinary { op, ref destination, ref lhs, ref rhs } => {
                self.lift_int2(&mut next, address, op, destination, lhs, rhs)?;
            }
            Opcode::IntCompare { op, ref destination, ref lhs, ref rhs } => {
                self.lift_rel(&mut next, op, destination, lhs, rhs)?;
            }
            Opcode::ZeroExtend { ref destination, ref source } => {
                check_operand(destination)?;
                let value = next.read_operand(source)?;
                next.write_operand(destination, value)?;
            }
            Opcode::SignExtend { ref destination, ref source } => {
                check_operand(destination)?;
                let value = next.read_operand(source)?;
                let bits = destination.bits();
                let value = if bits > value.bits() {
                    value.sign_extend(bits)
                } else {
                    value
                };
                next.write_operand(destination, value)?;
            }
            Opcode::Branch { target } => {
                next.advance(target);
                return Ok(smallvec![next]);
            }
            Opcode::CBranch { target, ref condition } => {
                return self.cbranch(next, address, target, fallthrough, condition);
            }
            Opcode::IBranch { ref target } => {
                let target = next.read_operand(target)?;
                return self.branch_on(next, address, target);
            }
            Opcode::Call { target } => {
                self.push_return(&mut next, fallthrough)?;
                next.advance(target);
                return Ok(smallvec![next]);
            }
            Opcode::Return => {
                let target = self.pop_return(&mut next)?;
                return self.branch_on(next, address, target);
            }
            Opcode::Output { ref text } => {
                next.write_output(text);
            }
            Opcode::Exit => {
                next.exit();
                return Ok(smallvec![next]);
            }
            Opcode::Float { .. } | Opcode::Unsupported { .. } => {
                return Err(Error::UnmodeledOperation(insn.kind.mnemonic().to_owned(), address));
            }
        }

        next.advance(fallthrough);
        Ok(smallvec![next])
    }

    fn lift_int1(
        &self,
        state: &mut MachineState,
        op: UnOp,
        destination: &Operand,
        operand: &Operand,
    ) -> Result<(), Error> {
        let value = state
            .read_operand(operand)?
            .either(|bv| Either::Left(op.apply(&bv)), |expr| from_expr(SymExpr::unop(op, expr)));

        state.write_operand(destination, value)?;
        Ok(())
    }

    fn lift_int2(
        &self,
        state: &mut MachineState,
        address: u64,
        op: BinOp,
        destination: &Operand,
        lhs: &Operand,
        rhs: &Operand,
    ) -> Result<(), Error> {
        let lhs = state.read_operand(lhs)?;
        let bits = lhs.bits();
        let rhs = state.read_operand(rhs)?.resize(bits);

        let value = match (lhs, rhs) {
            (Either::Left(l), Either::Left(r)) => {
                if op.is_division() && r.is_zero() {
                    return Err(Error::DivisionByZero(address));
                }
                Either::Left(op.apply(&l, &r))
            }
            (l, r) => from_expr(SymExpr::binop(op, l.into_expr(), r.into_expr())),
        };

        state.write_operand(destination, value)?;
        Ok(())
    }

    fn lift_rel(
        &self,
        state: &mut MachineState,
        op: BinRel,
        destination: &Operand,
        lhs: &Operand,
        rhs: &Operand,
    ) -> Result<(), Error> {
        let lhs = state.read_operand(lhs)?;
        let bits = lhs.bits();
        let rhs = state.read_operand(rhs)?.resize(bits);

        let value = match (lhs, rhs) {
            (Either::Left(l), Either::Left(r)) => Either::Left(BitVec::from_bool(op.apply(&l, &r))),
            (l, r) => from_expr(SymExpr::binrel(op, l.into_expr(), r.into_expr())),
        };

        state.write_operand(destination, value)?;
        Ok(())
    }

    fn cbranch(
        &self,
        state: MachineState,
        address: u64,
        target: u64,
        fallthrough: u64,
        condition: &Operand,
    ) -> Result<States, Error> {
        let expr = match state.read_operand(condition)? {
            Either::Left(bv) => {
                let mut next = state;
                next.advance(if bv.is_zero() { fallthrough } else { target });
                return Ok(smallvec![next]);
            }
            Either::Right(expr) => expr.cast_bool(),
        };

        let mut tstate = state.fork();
        tstate.push_constraint(expr.clone());
        let tsat = self.solver.is_sat(tstate.constraints());

        let mut fstate = state;
        fstate.push_constraint(SymExpr::bool_not(expr.clone()));
        let fsat = self.solver.is_sat(fstate.constraints());

        let mut states = States::new();

        if tsat.is_possible() {
            tstate.advance(target);
            states.push(tstate);
        } else {
            debug!("{:#x}: pruned {} -> {:#x}", address, expr, target);
        }

        if fsat.is_possible() {
            fstate.advance(fallthrough);
            states.push(fstate);
        } else {
            debug!("{:#x}: pruned !({}) -> {:#x}", address, expr, fallthrough);
        }

        if states.is_empty() {
            return Err(Error::UnsatisfiablePC(address));
        }

        if states.len() > 1 {
            debug!("{:#x}: forked on {}", address, expr);
        }

        Ok(states)
    }

    /// One successor per feasible value of `target`, up to the solver limit.
    fn branch_on(&self, state: MachineState, address: u64, target: Value) -> Result<States, Error> {
        let expr = match target {
            Either::Left(bv) => {
                let mut next = state;
                next.advance(bv.to_u64());
                return Ok(smallvec![next]);
            }
            Either::Right(expr) => expr,
        };

        let values = self
            .solver
            .solve_many(&expr, state.constraints())
            .map_err(|e| Error::SolverTimeout(address, e))?;

        let mut states = States::new();

        for value in values {
            let mut fork = state.fork();
            fork.push_constraint(expr.clone().eq(SymExpr::val(value)));

            if self.solver.is_sat(fork.constraints()).is_possible() {
                fork.advance(value.to_u64());
                states.push(fork);
            }
        }

        if states.is_empty() {
            Err(Error::UnsatisfiablePC(address))
        } else {
            debug!("{:#x}: {} resolved to {} target(s)", address, expr, states.len());
            Ok(states)
        }
    }

    fn stack_pointer(&self) -> Operand {
        Operand::register(self.convention.stack_pointer, self.convention.address_size)
    }

    fn push_return(&self, state: &mut MachineState, return_address: u64) -> Result<(), Error> {
        let size = self.convention.address_size;
        let bits = self.convention.address_bits();
        let sp = self.stack_pointer();

        let top = match state.read_operand(&sp)? {
            Either::Left(bv) => Either::Left(bv.sub(&BitVec::new(size as u64, bits))),
            Either::Right(expr) => return Err(StateError::SymbolicAddress(expr).into()),
        };

        state.write_memory(&top, &Either::Left(BitVec::new(return_address, bits)))?;
        state.write_operand(&sp, top)?;
        Ok(())
    }

    fn pop_return(&self, state: &mut MachineState) -> Result<Value, Error> {
        let size = self.convention.address_size;
        let bits = self.convention.address_bits();
        let sp = self.stack_pointer();

        let top = match state.read_operand(&sp)? {
            Either::Left(bv) => bv,
            Either::Right(expr) => return Err(StateError::SymbolicAddress(expr).into()),
        };

        let target = state.read_memory(&Either::Left(top), size)?;
        state.write_operand(&sp, Either::Left(top.add(&BitVec::new(size as u64, bits))))?;
        Ok(target)
    }
}

fn check_operand(operand: &Operand) -> Result<(), StateError> {
    if operand.size() == 0 || operand.size() > OPERAND_SIZE {
        Err(StateError::UnsupportedOperandSize(operand.size(), OPERAND_SIZE))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86;
    use crate::backend::SatResult;
    use crate::expr::SymVar;
    use crate::ir::{FloatOp, ProgramImage};
    use crate::solver::tests::Undecided;

    const BASE: u64 = 0x1000;

    fn eax() -> Operand {
        Operand::register(x86::EAX, 4)
    }

    fn executor(ops: Vec<Opcode>, solver: SolverContext) -> Executor<ProgramImage> {
        Executor::new(Arc::new(ProgramImage::assemble(BASE, 4, ops)), solver, Convention::x86())
    }

    fn symbolic_eax(name: &str) -> (SymVar, MachineState) {
        let x = SymVar::new(name, 32);
        let mut state = MachineState::new(BASE);
        state.write_register(x86::EAX, Either::Right(SymExpr::var(x.clone())));
        state.write_register(x86::ESP, Either::Left(BitVec::new(0x8000, 32)));
        (x, state)
    }

    fn active(successors: Successors) -> Vec<MachineState> {
        successors
            .into_iter()
            .map(|s| match s {
                Successor::Active(state) => state,
                Successor::Faulted(_, e) => panic!("unexpected fault: {}", e),
            })
            .collect()
    }

    fn compare_and_branch() -> Vec<Opcode> {
        vec![
            Opcode::IntCompare {
                op: BinRel::EQ,
                destination: Operand::variable(0, 1),
                lhs: eax(),
                rhs: Operand::constant(5, 4),
            },
            Opcode::CBranch {
                target: BASE + 0x100,
                condition: Operand::variable(0, 1),
            },
        ]
    }

    #[test]
    fn concrete_arithmetic() {
        let executor = executor(
            vec![
                Opcode::Copy {
                    destination: eax(),
                    source: Operand::constant(40, 4),
                },
                Opcode::IntBinary {
                    op: BinOp::ADD,
                    destination: eax(),
                    lhs: eax(),
                    rhs: Operand::constant(2, 4),
                },
            ],
            SolverContext::new(Undecided),
        );

        let state = MachineState::new(BASE);
        let state = active(executor.step(state)).remove(0);
        let state = active(executor.step(state)).remove(0);

        assert_eq!(state.pc(), BASE + 8);
        assert_eq!(state.depth(), 2);
        assert_eq!(state.read_register(x86::EAX, 4).unwrap(), Either::Left(BitVec::new(42, 32)));
    }

    #[test]
    fn concrete_division_by_zero_faults_before_writing() {
        let executor = executor(
            vec![Opcode::IntBinary {
                op: BinOp::DIV,
                destination: eax(),
                lhs: Operand::constant(1, 4),
                rhs: Operand::constant(0, 4),
            }],
            SolverContext::new(Undecided),
        );

        let successors = executor.step(MachineState::new(BASE));
        assert_eq!(successors.len(), 1);
        match &successors[0] {
            Successor::Faulted(state, Error::DivisionByZero(at)) => {
                assert_eq!(*at, BASE);
                assert_eq!(state.pc(), BASE);
                assert_eq!(state.depth(), 0);
            }
            other => panic!("unexpected successor {:?}", other),
        }
    }

    #[test]
    fn symbolic_branch_forks_both_ways() {
        let executor = executor(compare_and_branch(), SolverContext::z3());
        let (x, state) = symbolic_eax("x");

        let state = active(executor.step(state)).remove(0);
        let parent = state.constraints().clone();
        let forks = active(executor.step(state));

        assert_eq!(forks.len(), 2);
        assert_eq!(forks[0].pc(), BASE + 0x100);
        assert_eq!(forks[1].pc(), BASE + 8);

        let taken = SymExpr::var(x).eq(SymExpr::constant(5, 32));
        assert_eq!(forks[0].constraints().last(), Some(&taken));
        assert_eq!(forks[1].constraints().last(), Some(&SymExpr::bool_not(taken)));

        for fork in forks.iter() {
            assert!(parent.is_prefix_of(fork.constraints()));
            assert_eq!(fork.constraints().len(), parent.len() + 1);
            assert_eq!(fork.output(), b"");
        }
    }

    #[test]
    fn infeasible_branch_is_pruned() {
        let executor = executor(compare_and_branch(), SolverContext::z3());
        let (x, mut state) = symbolic_eax("x");
        state.push_constraint(SymExpr::var(x).lt(SymExpr::constant(3, 32)));

        let state = active(executor.step(state)).remove(0);
        let forks = active(executor.step(state));

        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].pc(), BASE + 8);
    }

    #[test]
    fn undecided_solver_keeps_both_branches() {
        let executor = executor(compare_and_branch(), SolverContext::new(Undecided));
        let (_, state) = symbolic_eax("x");

        let state = active(executor.step(state)).remove(0);
        let forks = active(executor.step(state));

        assert_eq!(forks.len(), 2);
        assert_eq!(SatResult::Unknown, executor.solver().is_sat(forks[0].constraints()));
    }

    #[test]
    fn call_and_return() {
        let executor = executor(
            vec![
                Opcode::Call { target: BASE + 8 },
                Opcode::Exit,
                Opcode::output("in callee"),
                Opcode::Return,
            ],
            SolverContext::new(Undecided),
        );

        let (_, mut state) = symbolic_eax("x");
        for _ in 0..3 {
            state = active(executor.step(state)).remove(0);
        }

        assert_eq!(state.pc(), BASE + 4);
        assert_eq!(state.output(), b"in callee");
        assert_eq!(state.read_register(x86::ESP, 4).unwrap(), Either::Left(BitVec::new(0x8000, 32)));
    }

    #[test]
    fn indirect_branch_enumerates_targets() {
        let executor = executor(vec![Opcode::IBranch { target: eax() }], SolverContext::z3());
        let (x, mut state) = symbolic_eax("x");
        let x = SymExpr::var(x);
        state.push_constraint(SymExpr::constant(0x1ff, 32).lt(x.clone()));
        state.push_constraint(x.lt(SymExpr::constant(0x202, 32)));

        let mut pcs = active(executor.step(state))
            .iter()
            .map(MachineState::pc)
            .collect::<Vec<_>>();
        pcs.sort_unstable();

        assert_eq!(pcs, vec![0x200, 0x201]);
    }

    #[test]
    fn undecided_indirect_branch_faults_with_timeout() {
        let executor = executor(vec![Opcode::IBranch { target: eax() }], SolverContext::new(Undecided));
        let (_, state) = symbolic_eax("x");

        let successors = executor.step(state);
        assert_eq!(successors.len(), 1);
        match &successors[0] {
            Successor::Faulted(state, e) => {
                assert!(matches!(e, Error::SolverTimeout(BASE, _)));
                assert_eq!(state.pc(), BASE);
                assert_eq!(e.to_string(), "solver gave up resolving the target at 0x1000");
            }
            other => panic!("unexpected successor {:?}", other),
        }
        assert_eq!(executor.solver().stats().unknown, 1);
    }

    #[test]
    fn unmodeled_operations_fault() {
        let executor = executor(
            vec![
                Opcode::Float {
                    op: FloatOp::ADD,
                    destination: Operand::variable(0, 8),
                    source: Operand::variable(1, 8),
                },
                Opcode::Exit,
            ],
            SolverContext::new(Undecided),
        );

        let successors = executor.step(MachineState::new(BASE));
        assert!(matches!(
            &successors[0],
            Successor::Faulted(_, Error::UnmodeledOperation(m, BASE)) if m == "FLOAT_ADD"
        ));

        let mut exited = MachineState::new(BASE + 4);
        exited = active(executor.step(exited)).remove(0);
        assert!(exited.is_exited());
        assert!(executor.step(exited)[0].is_faulted());

        let missing = executor.step(MachineState::new(0));
        assert!(matches!(&missing[0], Successor::Faulted(_, Error::NoInstruction(0))));
    }
}
