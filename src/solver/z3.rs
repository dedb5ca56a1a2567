use std::time::Duration;

use z3::ast::{Ast, Bool, BV};
use z3::{Config, Context, Model, SatResult as Z3SatResult, Solver};

use fxhash::FxHashMap as HashMap;

use crate::backend::{Error, SatResult, ValueSolver};
use crate::bv::BitVec;
use crate::expr::{BinOp, BinRel, Cast, Expr, SymExpr, SymVar, UnOp};

/// Z3 oracle. Each query builds its own context, so independent queries
/// may run on different threads.
#[derive(Debug, Clone, Default)]
pub struct Z3Solver {
    timeout: Option<Duration>,
}

impl Z3Solver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.set_model_generation(true);
        if let Some(timeout) = self.timeout {
            config.set_timeout_msec(timeout.as_millis() as u64);
        }
        config
    }
}

fn var_name(var: &SymVar) -> String {
    format!("{}!{}", var.name(), var.bits())
}

struct Lowering<'ctx> {
    context: &'ctx Context,
    cache: HashMap<SymExpr, BV<'ctx>>,
}

impl<'ctx> Lowering<'ctx> {
    fn new(context: &'ctx Context) -> Self {
        Self {
            context,
            cache: HashMap::default(),
        }
    }

    fn var(&self, var: &SymVar) -> BV<'ctx> {
        BV::new_const(self.context, var_name(var), var.bits())
    }

    fn bool_to_bv(&self, b: Bool<'ctx>) -> BV<'ctx> {
        b.ite(&BV::from_u64(self.context, 1, 1), &BV::from_u64(self.context, 0, 1))
    }

    fn truth(&mut self, expr: &SymExpr) -> Bool<'ctx> {
        self.ast(expr).extract(0, 0)._eq(&BV::from_u64(self.context, 1, 1))
    }

    fn ast(&mut self, expr: &SymExpr) -> BV<'ctx> {
        if let Some(ast) = self.cache.get(expr) {
            return ast.clone();
        }

        let ast = match &**expr {
            Expr::Val(bv) => BV::from_u64(self.context, bv.to_u64(), bv.bits()),
            Expr::Var(var) => self.var(var),
            Expr::UnOp(op, e) => {
                let e = self.ast(e);
                match op {
                    UnOp::NOT => e.bvnot(),
                    UnOp::NEG => e.bvneg(),
                }
            }
            Expr::BinOp(op, l, r) => {
                let l = self.ast(l);
                let r = self.ast(r);
                match op {
                    BinOp::ADD => l.bvadd(&r),
                    BinOp::SUB => l.bvsub(&r),
                    BinOp::MUL => l.bvmul(&r),
                    BinOp::DIV => l.bvudiv(&r),
                    BinOp::SDIV => l.bvsdiv(&r),
                    BinOp::REM => l.bvurem(&r),
                    BinOp::SREM => l.bvsrem(&r),
                    BinOp::AND => l.bvand(&r),
                    BinOp::OR => l.bvor(&r),
                    BinOp::XOR => l.bvxor(&r),
                    BinOp::SHL => l.bvshl(&r),
                    BinOp::SHR => l.bvlshr(&r),
                    BinOp::SAR => l.bvashr(&r),
                }
            }
            Expr::BinRel(op, l, r) => {
                let l = self.ast(l);
                let r = self.ast(r);
                let b = match op {
                    BinRel::EQ => l._eq(&r),
                    BinRel::NEQ => l._eq(&r).not(),
                    BinRel::LT => l.bvult(&r),
                    BinRel::LE => l.bvule(&r),
                    BinRel::SLT => l.bvslt(&r),
                    BinRel::SLE => l.bvsle(&r),
                };
                self.bool_to_bv(b)
            }
            Expr::Cast(e, cast) => {
                let bits = e.bits();
                let e = self.ast(e);
                match cast {
                    Cast::Unsigned(to) => e.zero_ext(to - bits),
                    Cast::Signed(to) => e.sign_ext(to - bits),
                }
            }
            Expr::Extract(e, lsb, msb) => self.ast(e).extract(msb - 1, *lsb),
            Expr::Concat(hi, lo) => {
                let hi = self.ast(hi);
                hi.concat(&self.ast(lo))
            }
            Expr::IfElse(c, t, f) => {
                let c = self.truth(c);
                let t = self.ast(t);
                let f = self.ast(f);
                c.ite(&t, &f)
            }
        };

        self.cache.insert(expr.clone(), ast.clone());
        ast
    }

    fn assert_all(&mut self, solver: &Solver<'ctx>, constraints: &[SymExpr]) {
        for constraint in constraints {
            let truth = self.truth(constraint);
            solver.assert(&truth);
        }
    }
}

fn eval(model: &Model<'_>, ast: &BV<'_>) -> Option<u64> {
    model.eval(ast, true).and_then(|v| v.as_u64())
}

impl ValueSolver for Z3Solver {
    fn is_sat(&self, constraints: &[SymExpr]) -> SatResult {
        let config = self.config();
        let context = Context::new(&config);
        let solver = Solver::new(&context);

        Lowering::new(&context).assert_all(&solver, constraints);

        match solver.check() {
            Z3SatResult::Sat => SatResult::Sat,
            Z3SatResult::Unsat => SatResult::Unsat,
            Z3SatResult::Unknown => SatResult::Unknown,
        }
    }

    fn model(&self, constraints: &[SymExpr], vars: &[SymVar]) -> Result<Option<Vec<BitVec>>, Error> {
        let config = self.config();
        let context = Context::new(&config);
        let solver = Solver::new(&context);

        let mut lowering = Lowering::new(&context);
        lowering.assert_all(&solver, constraints);

        match solver.check() {
            Z3SatResult::Unsat => return Ok(None),
            Z3SatResult::Unknown => return Err(Error::Timeout),
            Z3SatResult::Sat => (),
        }

        let model = solver.get_model().ok_or(Error::Timeout)?;

        vars.iter()
            .map(|var| {
                eval(&model, &lowering.var(var))
                    .map(|v| BitVec::new(v, var.bits()))
                    .ok_or(Error::Timeout)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    fn solve_many(&self, expr: &SymExpr, constraints: &[SymExpr], limit: usize) -> Result<Vec<BitVec>, Error> {
        let config = self.config();
        let context = Context::new(&config);
        let solver = Solver::new(&context);

        let mut lowering = Lowering::new(&context);
        lowering.assert_all(&solver, constraints);

        let target = lowering.ast(expr);
        let bits = expr.bits();

        let mut values = Vec::new();

        while values.len() < limit {
            match solver.check() {
                Z3SatResult::Unsat => break,
                Z3SatResult::Unknown => return Err(Error::Timeout),
                Z3SatResult::Sat => (),
            }

            let value = solver
                .get_model()
                .and_then(|model| eval(&model, &target))
                .ok_or(Error::Timeout)?;

            values.push(BitVec::new(value, bits));
            solver.assert(&target._eq(&BV::from_u64(&context, value, bits)).not());
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte(name: &str) -> SymExpr {
        SymExpr::var(SymVar::new(name, 8))
    }

    #[test]
    fn sat_and_unsat() {
        let solver = Z3Solver::new();
        let x = byte("x");

        let gt = SymExpr::constant(10, 8).lt(x.clone());
        let lt = x.clone().lt(SymExpr::constant(5, 8));

        assert_eq!(solver.is_sat(&[gt.clone()]), SatResult::Sat);
        assert_eq!(solver.is_sat(&[gt, lt]), SatResult::Unsat);
    }

    #[test]
    fn model_satisfies_constraints() {
        let solver = Z3Solver::new();
        let a = SymVar::new("a", 32);
        let key = SymExpr::constant(0x1234_5678, 32);
        let c = (SymExpr::var(a.clone()) ^ key).eq(SymExpr::constant(0xdead_beef, 32));

        let values = solver.model(&[c], &[a]).unwrap().unwrap();
        assert_eq!(values, vec![BitVec::new(0xdead_beef ^ 0x1234_5678, 32)]);
    }

    #[test]
    fn enumerates_up_to_limit() {
        let solver = Z3Solver::new_with(Some(Duration::from_secs(10)));
        let x = byte("x");
        let c = x.clone().lt(SymExpr::constant(3, 8));

        let mut values = solver.solve_many(&x, &[c.clone()], 10).unwrap();
        values.sort();
        assert_eq!(values, vec![BitVec::new(0, 8), BitVec::new(1, 8), BitVec::new(2, 8)]);

        assert_eq!(solver.solve_many(&x, &[c], 2).unwrap().len(), 2);
    }
}
