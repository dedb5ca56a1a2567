use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::ops::{Add, BitAnd, BitOr, BitXor, Mul, Neg, Not, Sub};
use std::sync::Arc;

use hashconsing::{consign, HConsed, HashConsign};

use fnv::FnvHashMap as HashMap;
use fxhash::{FxHashMap, FxHashSet};

use crate::bv::{BitVec, MAX_BITS};

consign! {
    let EXPR = consign(100 * 1024 /* = capacity */) for Expr;
}

/// Concrete values assigned to symbolic variables.
pub type Assignment = HashMap<SymVar, BitVec>;

/// A named, unconstrained bit-vector standing for an unknown input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymVar {
    name: Arc<str>,
    bits: u32,
}

impl fmt::Display for SymVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.bits)
    }
}

impl SymVar {
    pub fn new<S: AsRef<str>>(name: S, bits: u32) -> Self {
        assert!(bits > 0 && bits <= MAX_BITS, "unsupported symbolic width {}", bits);
        Self {
            name: Arc::from(name.as_ref()),
            bits,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnOp {
    NOT,
    NEG,
}

impl UnOp {
    pub fn apply(&self, v: &BitVec) -> BitVec {
        match self {
            UnOp::NOT => v.not(),
            UnOp::NEG => v.neg(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinOp {
    ADD,
    SUB,
    MUL,
    DIV,
    SDIV,
    REM,
    SREM,
    AND,
    OR,
    XOR,
    SHL,
    SHR,
    SAR,
}

impl BinOp {
    pub fn apply(&self, l: &BitVec, r: &BitVec) -> BitVec {
        match self {
            BinOp::ADD => l.add(r),
            BinOp::SUB => l.sub(r),
            BinOp::MUL => l.mul(r),
            BinOp::DIV => l.udiv(r),
            BinOp::SDIV => l.sdiv(r),
            BinOp::REM => l.urem(r),
            BinOp::SREM => l.srem(r),
            BinOp::AND => l.and(r),
            BinOp::OR => l.or(r),
            BinOp::XOR => l.xor(r),
            BinOp::SHL => l.shl(r),
            BinOp::SHR => l.lshr(r),
            BinOp::SAR => l.ashr(r),
        }
    }

    pub fn is_division(&self) -> bool {
        matches!(self, BinOp::DIV | BinOp::SDIV | BinOp::REM | BinOp::SREM)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinRel {
    EQ,
    NEQ,
    LT,
    LE,
    SLT,
    SLE,
}

impl BinRel {
    pub fn apply(&self, l: &BitVec, r: &BitVec) -> bool {
        use std::cmp::Ordering::*;
        match self {
            BinRel::EQ => l == r,
            BinRel::NEQ => l != r,
            BinRel::LT => l.ucmp(r) == Less,
            BinRel::LE => l.ucmp(r) != Greater,
            BinRel::SLT => l.scmp(r) == Less,
            BinRel::SLE => l.scmp(r) != Greater,
        }
    }
}

/// Extension *to* the given width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Cast {
    Unsigned(u32),
    Signed(u32),
}

impl Cast {
    pub fn bits(&self) -> u32 {
        match self {
            Cast::Unsigned(bits) | Cast::Signed(bits) => *bits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SymExpr(HConsed<Expr>);

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl Deref for SymExpr {
    type Target = Expr;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl From<BitVec> for SymExpr {
    fn from(bv: BitVec) -> Self {
        SymExpr::val(bv)
    }
}

impl From<SymVar> for SymExpr {
    fn from(v: SymVar) -> Self {
        SymExpr::var(v)
    }
}

impl From<Expr> for SymExpr {
    fn from(e: Expr) -> Self {
        Self(EXPR.mk(e))
    }
}

impl From<HConsed<Expr>> for SymExpr {
    fn from(e: HConsed<Expr>) -> Self {
        Self(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expr {
    UnOp(UnOp, SymExpr),              // T -> T
    BinOp(BinOp, SymExpr, SymExpr),   // T * T -> T
    BinRel(BinRel, SymExpr, SymExpr), // T * T -> bool

    Cast(SymExpr, Cast),        // T -> Cast::T
    Extract(SymExpr, u32, u32), // T[LSB..MSB) -> T
    Concat(SymExpr, SymExpr),   // HI * LO -> T

    IfElse(SymExpr, SymExpr, SymExpr),

    Val(BitVec),
    Var(SymVar),
}

impl Expr {
    fn fmt_l1(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Val(v) => write!(f, "{:#x}", v),
            Expr::Var(v) => write!(f, "{}", v.name()),

            Expr::Cast(expr, Cast::Signed(bits)) => { expr.fmt_l1(f)?; write!(f, " as i{}", bits) },
            Expr::Cast(expr, Cast::Unsigned(bits)) => { expr.fmt_l1(f)?; write!(f, " as u{}", bits) },

            Expr::Extract(expr, lsb, msb) => { expr.fmt_l1(f)?; write!(f, "[{}..{}]", lsb, msb) },

            expr => write!(f, "({})", expr),
        }
    }

    fn fmt_l2(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::UnOp(UnOp::NEG, expr) => { write!(f, "-")?; expr.fmt_l1(f) },
            Expr::UnOp(UnOp::NOT, expr) => { write!(f, "!")?; expr.fmt_l1(f) },
            expr => expr.fmt_l1(f)
        }
    }

    fn fmt_l3(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinOp(BinOp::MUL, e1, e2) => { e1.fmt_l3(f)?; write!(f, " * ")?; e2.fmt_l2(f) }
            Expr::BinOp(BinOp::DIV, e1, e2) => { e1.fmt_l3(f)?; write!(f, " / ")?; e2.fmt_l2(f) }
            Expr::BinOp(BinOp::SDIV, e1, e2) => { e1.fmt_l3(f)?; write!(f, " s/ ")?; e2.fmt_l2(f) }
            Expr::BinOp(BinOp::REM, e1, e2) => { e1.fmt_l3(f)?; write!(f, " % ")?; e2.fmt_l2(f) }
            Expr::BinOp(BinOp::SREM, e1, e2) => { e1.fmt_l3(f)?; write!(f, " s% ")?; e2.fmt_l2(f) }
            expr => expr.fmt_l2(f)
        }
    }

    fn fmt_l4(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinOp(BinOp::ADD, e1, e2) => { e1.fmt_l4(f)?; write!(f, " + ")?; e2.fmt_l3(f) },
            Expr::BinOp(BinOp::SUB, e1, e2) => { e1.fmt_l4(f)?; write!(f, " - ")?; e2.fmt_l3(f) },
            expr => expr.fmt_l3(f)
        }
    }

    fn fmt_l5(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinOp(BinOp::SHL, e1, e2) => { e1.fmt_l5(f)?; write!(f, " << ")?; e2.fmt_l4(f) },
            Expr::BinOp(BinOp::SHR, e1, e2) => { e1.fmt_l5(f)?; write!(f, " >> ")?; e2.fmt_l4(f) },
            Expr::BinOp(BinOp::SAR, e1, e2) => { e1.fmt_l5(f)?; write!(f, " s>> ")?; e2.fmt_l4(f) },
            expr => expr.fmt_l4(f)
        }
    }

    fn fmt_l6(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinRel(BinRel::LT, e1, e2) => { e1.fmt_l6(f)?; write!(f, " < ")?; e2.fmt_l5(f) },
            Expr::BinRel(BinRel::LE, e1, e2) => { e1.fmt_l6(f)?; write!(f, " <= ")?; e2.fmt_l5(f) },
            Expr::BinRel(BinRel::SLT, e1, e2) => { e1.fmt_l6(f)?; write!(f, " s< ")?; e2.fmt_l5(f) },
            Expr::BinRel(BinRel::SLE, e1, e2) => { e1.fmt_l6(f)?; write!(f, " s<= ")?; e2.fmt_l5(f) },
            expr => expr.fmt_l5(f)
        }
    }

    fn fmt_l7(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::BinRel(BinRel::EQ, e1, e2) => { e1.fmt_l7(f)?; write!(f, " == ")?; e2.fmt_l6(f) },
            Expr::BinRel(BinRel::NEQ, e1, e2) => { e1.fmt_l7(f)?; write!(f, " != ")?; e2.fmt_l6(f) },
            expr => expr.fmt_l6(f)
        }
    }

    fn fmt_l8(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::BinOp(BinOp::AND, e1, e2) = self {
            e1.fmt_l8(f)?;
            write!(f, " & ")?;
            e2.fmt_l7(f)
        } else {
            self.fmt_l7(f)
        }
    }

    fn fmt_l9(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::BinOp(BinOp::XOR, e1, e2) = self {
            e1.fmt_l9(f)?;
            write!(f, " ^ ")?;
            e2.fmt_l8(f)
        } else {
            self.fmt_l8(f)
        }
    }

    fn fmt_l10(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::BinOp(BinOp::OR, e1, e2) = self {
            e1.fmt_l10(f)?;
            write!(f, " | ")?;
            e2.fmt_l9(f)
        } else {
            self.fmt_l9(f)
        }
    }

    fn fmt_l11(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::Concat(e1, e2) = self {
            e1.fmt_l11(f)?;
            write!(f, " ++ ")?;
            e2.fmt_l10(f)
        } else {
            self.fmt_l10(f)
        }
    }

    fn fmt_l12(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Expr::IfElse(c, e1, e2) = self {
            write!(f, "if ")?;
            c.fmt_l12(f)?;
            write!(f, " then ")?;
            e1.fmt_l12(f)?;
            write!(f, " else ")?;
            e2.fmt_l12(f)
        } else {
            self.fmt_l11(f)
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_l12(f)
    }
}

impl SymExpr {
    pub fn val(bv: BitVec) -> SymExpr {
        EXPR.mk(Expr::Val(bv)).into()
    }

    pub fn constant(value: u64, bits: u32) -> SymExpr {
        Self::val(BitVec::new(value, bits))
    }

    pub fn bool(value: bool) -> SymExpr {
        Self::val(BitVec::from_bool(value))
    }

    pub fn var(var: SymVar) -> SymExpr {
        EXPR.mk(Expr::Var(var)).into()
    }

    pub fn as_val(&self) -> Option<&BitVec> {
        if let Expr::Val(ref bv) = **self {
            Some(bv)
        } else {
            None
        }
    }

    pub fn lift_unop(op: UnOp, v: SymExpr) -> SymExpr {
        EXPR.mk(Expr::UnOp(op, v)).into()
    }

    pub fn lift_binop(op: BinOp, l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());

        EXPR.mk(Expr::BinOp(op, l, r)).into()
    }

    pub fn lift_binrel(op: BinRel, l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());

        EXPR.mk(Expr::BinRel(op, l, r)).into()
    }

    pub fn unop(op: UnOp, v: SymExpr) -> SymExpr {
        match op {
            UnOp::NOT => Self::not(v),
            UnOp::NEG => Self::neg(v),
        }
    }

    pub fn binop(op: BinOp, l: SymExpr, r: SymExpr) -> SymExpr {
        match op {
            BinOp::ADD => Self::add(l, r),
            BinOp::SUB => Self::sub(l, r),
            BinOp::MUL => Self::mul(l, r),
            BinOp::DIV => Self::div(l, r),
            BinOp::SDIV => Self::signed_div(l, r),
            BinOp::REM => Self::rem(l, r),
            BinOp::SREM => Self::signed_rem(l, r),
            BinOp::AND => Self::and(l, r),
            BinOp::OR => Self::or(l, r),
            BinOp::XOR => Self::xor(l, r),
            BinOp::SHL => Self::shl(l, r),
            BinOp::SHR => Self::shr(l, r),
            BinOp::SAR => Self::signed_shr(l, r),
        }
    }

    pub fn binrel(op: BinRel, l: SymExpr, r: SymExpr) -> SymExpr {
        match op {
            BinRel::EQ => l.eq(r),
            BinRel::NEQ => l.ne(r),
            BinRel::LT => l.lt(r),
            BinRel::LE => l.le(r),
            BinRel::SLT => l.slt(r),
            BinRel::SLE => l.sle(r),
        }
    }

    fn fold_binop(op: BinOp, l: SymExpr, r: SymExpr) -> SymExpr {
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            Self::val(op.apply(lv, rv))
        } else {
            Self::lift_binop(op, l, r)
        }
    }

    pub fn neg(v: SymExpr) -> SymExpr {
        if let Expr::Val(ref bv) = &*v {
            Self::val(bv.neg())
        } else if let Expr::UnOp(UnOp::NEG, vv) = &*v {
            vv.clone()
        } else {
            Self::lift_unop(UnOp::NEG, v)
        }
    }

    pub fn not(v: SymExpr) -> SymExpr {
        match &*v {
            Expr::Val(ref bv) => Self::val(bv.not()),
            Expr::UnOp(UnOp::NOT, vv) => vv.clone(),
            Expr::BinRel(BinRel::EQ, l, r) => Self::lift_binrel(BinRel::NEQ, l.clone(), r.clone()),
            Expr::BinRel(BinRel::NEQ, l, r) => Self::lift_binrel(BinRel::EQ, l.clone(), r.clone()),
            _ => Self::lift_unop(UnOp::NOT, v),
        }
    }

    /// Logical negation of the truth value of `v`.
    pub fn bool_not(v: SymExpr) -> SymExpr {
        Self::not(v.cast_bool())
    }

    pub fn and(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());

        if l.is_zero() || r.is_ones() || l == r {
            l
        } else if r.is_zero() || l.is_ones() {
            r
        } else {
            Self::fold_binop(BinOp::AND, l, r)
        }
    }

    pub fn or(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());

        if l.is_zero() || r.is_ones() {
            r
        } else if r.is_zero() || l.is_ones() || l == r {
            l
        } else {
            Self::fold_binop(BinOp::OR, l, r)
        }
    }

    pub fn xor(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());

        if l == r {
            Self::val(BitVec::zero(l.bits()))
        } else if r.is_ones() {
            Self::not(l)
        } else if l.is_ones() {
            Self::not(r)
        } else if r.is_zero() {
            l
        } else if l.is_zero() {
            r
        } else {
            Self::fold_binop(BinOp::XOR, l, r)
        }
    }

    pub fn add(l: SymExpr, r: SymExpr) -> SymExpr {
        if l.is_zero() {
            r
        } else if r.is_zero() {
            l
        } else {
            Self::fold_binop(BinOp::ADD, l, r)
        }
    }

    pub fn sub(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() {
            l
        } else if l == r {
            Self::val(BitVec::zero(l.bits()))
        } else if l.is_zero() {
            Self::neg(r)
        } else {
            Self::fold_binop(BinOp::SUB, l, r)
        }
    }

    pub fn mul(l: SymExpr, r: SymExpr) -> SymExpr {
        assert_eq!(l.bits(), r.bits());

        if l.is_zero() || r.is_zero() {
            Self::val(BitVec::zero(l.bits()))
        } else if r.is_one() {
            l
        } else if l.is_one() {
            r
        } else {
            Self::fold_binop(BinOp::MUL, l, r)
        }
    }

    pub fn div(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_one() {
            l
        } else {
            Self::fold_binop(BinOp::DIV, l, r)
        }
    }

    pub fn signed_div(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_one() {
            l
        } else {
            Self::fold_binop(BinOp::SDIV, l, r)
        }
    }

    pub fn rem(l: SymExpr, r: SymExpr) -> SymExpr {
        Self::fold_binop(BinOp::REM, l, r)
    }

    pub fn signed_rem(l: SymExpr, r: SymExpr) -> SymExpr {
        Self::fold_binop(BinOp::SREM, l, r)
    }

    pub fn shl(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() || l.is_zero() {
            l
        } else {
            Self::fold_binop(BinOp::SHL, l, r)
        }
    }

    pub fn shr(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() || l.is_zero() {
            l
        } else {
            Self::fold_binop(BinOp::SHR, l, r)
        }
    }

    pub fn signed_shr(l: SymExpr, r: SymExpr) -> SymExpr {
        if r.is_zero() || l.is_zero() {
            l
        } else {
            Self::fold_binop(BinOp::SAR, l, r)
        }
    }

    /// `self` becomes the high part.
    pub fn concat(self, low: SymExpr) -> SymExpr {
        assert!(self.bits() + low.bits() <= MAX_BITS);

        let folded = match (&*self, &*low) {
            (Expr::Val(ref hv), Expr::Val(ref lv)) => Some(Self::val(hv.concat(lv))),
            (Expr::Extract(ref he, hlsb, hmsb), Expr::Extract(ref le, llsb, lmsb))
                if he == le && hlsb == lmsb =>
            {
                Some(he.clone().extract(*llsb, *hmsb))
            }
            _ => None,
        };

        folded.unwrap_or_else(|| EXPR.mk(Expr::Concat(self, low)).into())
    }

    /// Bits `[lsb, msb)`.
    pub fn extract(self, lsb: u32, msb: u32) -> SymExpr {
        assert!(msb > lsb && msb <= self.bits());

        if lsb == 0 && msb == self.bits() {
            return self;
        }

        let folded = match &*self {
            Expr::Val(ref bv) => Some(Self::val(bv.extract(lsb, msb))),
            Expr::Extract(ref inner, ilsb, _) => Some(inner.clone().extract(ilsb + lsb, ilsb + msb)),
            Expr::Concat(ref hi, ref lo) => {
                let lbits = lo.bits();
                if msb <= lbits {
                    Some(lo.clone().extract(lsb, msb))
                } else if lsb >= lbits {
                    Some(hi.clone().extract(lsb - lbits, msb - lbits))
                } else {
                    None
                }
            }
            Expr::Cast(ref inner, _) if msb <= inner.bits() => Some(inner.clone().extract(lsb, msb)),
            _ => None,
        };

        folded.unwrap_or_else(|| EXPR.mk(Expr::Extract(self, lsb, msb)).into())
    }

    pub fn extract_low(self, bits: u32) -> SymExpr {
        self.extract(0, bits)
    }

    pub fn cast(e: SymExpr, c: Cast) -> SymExpr {
        EXPR.mk(Expr::Cast(e, c)).into()
    }

    // zero extend *to* bits
    pub fn zero_extend(self, bits: u32) -> SymExpr {
        assert!(bits >= self.bits() && bits <= MAX_BITS);

        if bits == self.bits() {
            self
        } else if let Expr::Val(ref bv) = &*self {
            Self::val(bv.zero_extend(bits))
        } else if let Expr::Cast(ref inner, Cast::Unsigned(_)) = &*self {
            inner.clone().zero_extend(bits)
        } else {
            Self::cast(self, Cast::Unsigned(bits))
        }
    }

    // sign extend *to* bits
    pub fn sign_extend(self, bits: u32) -> SymExpr {
        assert!(bits >= self.bits() && bits <= MAX_BITS);

        if bits == self.bits() {
            self
        } else if let Expr::Val(ref bv) = &*self {
            Self::val(bv.sign_extend(bits))
        } else if let Expr::Cast(ref inner, Cast::Signed(_)) = &*self {
            inner.clone().sign_extend(bits)
        } else {
            Self::cast(self, Cast::Signed(bits))
        }
    }

    /// Truncate or zero-extend to `bits`.
    pub fn resize(self, bits: u32) -> SymExpr {
        if bits < self.bits() {
            self.extract_low(bits)
        } else {
            self.zero_extend(bits)
        }
    }

    /// One-bit truth value: `self != 0`.
    pub fn cast_bool(self) -> SymExpr {
        if self.is_bool() {
            self
        } else if let Expr::Cast(ref inner, _) = &*self {
            if inner.is_bool() {
                return inner.clone();
            }
            let bits = self.bits();
            self.ne(Self::val(BitVec::zero(bits)))
        } else {
            let bits = self.bits();
            self.ne(Self::val(BitVec::zero(bits)))
        }
    }

    pub fn ite(self, texpr: SymExpr, fexpr: SymExpr) -> SymExpr {
        assert!(self.is_bool());
        assert_eq!(texpr.bits(), fexpr.bits());

        if self.is_true() || texpr == fexpr {
            texpr
        } else if self.is_false() {
            fexpr
        } else {
            EXPR.mk(Expr::IfElse(self, texpr, fexpr)).into()
        }
    }

    pub fn eq(self, r: SymExpr) -> SymExpr {
        let l = self;
        if l == r {
            // trivial
            Self::bool(true)
        } else if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            Self::bool(lv == rv)
        } else if l.is_bool() && r.is_true() {
            l
        } else if l.is_bool() && r.is_false() {
            Self::not(l)
        } else {
            Self::lift_binrel(BinRel::EQ, l, r)
        }
    }

    pub fn ne(self, r: SymExpr) -> SymExpr {
        let l = self;
        if l == r {
            // trivial
            Self::bool(false)
        } else if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            Self::bool(lv != rv)
        } else if l.is_bool() && r.is_false() {
            l
        } else if l.is_bool() && r.is_true() {
            Self::not(l)
        } else {
            Self::lift_binrel(BinRel::NEQ, l, r)
        }
    }

    fn fold_binrel(op: BinRel, l: SymExpr, r: SymExpr) -> SymExpr {
        if let (Expr::Val(ref lv), Expr::Val(ref rv)) = (&*l, &*r) {
            Self::bool(op.apply(lv, rv))
        } else if l == r {
            Self::bool(matches!(op, BinRel::LE | BinRel::SLE))
        } else {
            Self::lift_binrel(op, l, r)
        }
    }

    pub fn lt(self, r: SymExpr) -> SymExpr {
        Self::fold_binrel(BinRel::LT, self, r)
    }

    pub fn le(self, r: SymExpr) -> SymExpr {
        Self::fold_binrel(BinRel::LE, self, r)
    }

    pub fn slt(self, r: SymExpr) -> SymExpr {
        Self::fold_binrel(BinRel::SLT, self, r)
    }

    pub fn sle(self, r: SymExpr) -> SymExpr {
        Self::fold_binrel(BinRel::SLE, self, r)
    }

    pub fn bits(&self) -> u32 {
        match &**self {
            Expr::Val(ref v) => v.bits(),
            Expr::Var(ref v) => v.bits(),
            Expr::UnOp(_, ref v) | Expr::BinOp(_, ref v, _) => v.bits(),
            Expr::BinRel(_, _, _) => 1, // bool
            Expr::Cast(_, c) => c.bits(),
            Expr::IfElse(_, ref l, _) => l.bits(),
            Expr::Concat(ref l, ref r) => l.bits() + r.bits(),
            Expr::Extract(_, lsb, msb) => msb - lsb,
        }
    }

    pub fn is_bool(&self) -> bool {
        self.bits() == 1
    }

    pub fn is_symbolic(&self) -> bool {
        self.as_val().is_none()
    }

    pub fn is_one(&self) -> bool {
        matches!(&**self, Expr::Val(ref v) if v.is_one())
    }

    pub fn is_ones(&self) -> bool {
        matches!(&**self, Expr::Val(ref v) if v.is_ones())
    }

    pub fn is_zero(&self) -> bool {
        matches!(&**self, Expr::Val(ref v) if v.is_zero())
    }

    pub fn is_true(&self) -> bool {
        self.is_bool() && self.is_one()
    }

    pub fn is_false(&self) -> bool {
        self.is_bool() && self.is_zero()
    }

    /// Every symbolic variable the expression mentions.
    pub fn variables(&self) -> BTreeSet<SymVar> {
        let mut collector = Variables::default();
        collector.visit_expr_ref(self);
        collector.vars
    }

    /// Rebuild the expression with the assigned variables replaced by
    /// their values; constructors fold what becomes concrete.
    pub fn substitute(&self, assignment: &Assignment) -> SymExpr {
        Substitute {
            assignment,
            cache: FxHashMap::default(),
        }
        .visit_expr(self)
    }

    /// Concrete value under `assignment`, or `None` if some variable is
    /// left unassigned.
    pub fn evaluate(&self, assignment: &Assignment) -> Option<BitVec> {
        self.substitute(assignment).as_val().copied()
    }
}

macro_rules! impl_binop_for {
    ($tr:ident, $m:ident, $ctor:ident) => {
        impl $tr for &'_ SymExpr {
            type Output = SymExpr;

            fn $m(self, rhs: Self) -> Self::Output {
                SymExpr::$ctor(self.clone(), rhs.clone())
            }
        }

        impl $tr for SymExpr {
            type Output = SymExpr;

            fn $m(self, rhs: Self) -> Self::Output {
                SymExpr::$ctor(self, rhs)
            }
        }
    };
}

impl_binop_for!(Add, add, add);
impl_binop_for!(Sub, sub, sub);
impl_binop_for!(Mul, mul, mul);
impl_binop_for!(BitAnd, bitand, and);
impl_binop_for!(BitOr, bitor, or);
impl_binop_for!(BitXor, bitxor, xor);

impl Neg for &'_ SymExpr {
    type Output = SymExpr;

    fn neg(self) -> Self::Output {
        SymExpr::neg(self.clone())
    }
}

impl Neg for SymExpr {
    type Output = SymExpr;

    fn neg(self) -> Self::Output {
        SymExpr::neg(self)
    }
}

impl Not for &'_ SymExpr {
    type Output = SymExpr;

    fn not(self) -> Self::Output {
        SymExpr::not(self.clone())
    }
}

impl Not for SymExpr {
    type Output = SymExpr;

    fn not(self) -> Self::Output {
        SymExpr::not(self)
    }
}

pub trait VisitRef<'expr> {
    fn visit_val_ref(&mut self, bv: &'expr BitVec);
    fn visit_var_ref(&mut self, var: &'expr SymVar);

    #[allow(unused_variables)]
    fn visit_unop_ref(&mut self, op: UnOp, expr: &'expr SymExpr) {
        self.visit_expr_ref(expr);
    }

    #[allow(unused_variables)]
    fn visit_binop_ref(&mut self, op: BinOp, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) {
        self.visit_expr_ref(lexpr);
        self.visit_expr_ref(rexpr);
    }

    #[allow(unused_variables)]
    fn visit_binrel_ref(&mut self, op: BinRel, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) {
        self.visit_expr_ref(lexpr);
        self.visit_expr_ref(rexpr);
    }

    #[allow(unused_variables)]
    fn visit_cast_ref(&mut self, expr: &'expr SymExpr, cast: Cast) {
        self.visit_expr_ref(expr);
    }

    #[allow(unused_variables)]
    fn visit_extract_ref(&mut self, expr: &'expr SymExpr, lsb: u32, msb: u32) {
        self.visit_expr_ref(expr);
    }

    fn visit_concat_ref(&mut self, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) {
        self.visit_expr_ref(lexpr);
        self.visit_expr_ref(rexpr);
    }

    fn visit_ite_ref(&mut self, cond: &'expr SymExpr, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) {
        self.visit_expr_ref(cond);
        self.visit_expr_ref(lexpr);
        self.visit_expr_ref(rexpr);
    }

    fn visit_expr_ref(&mut self, expr: &'expr SymExpr) {
        self.walk_expr_ref(expr)
    }

    fn walk_expr_ref(&mut self, expr: &'expr SymExpr) {
        match **expr {
            Expr::Val(ref v) => self.visit_val_ref(v),
            Expr::Var(ref v) => self.visit_var_ref(v),
            Expr::UnOp(op, ref e) => self.visit_unop_ref(op, e),
            Expr::BinOp(op, ref l, ref r) => self.visit_binop_ref(op, l, r),
            Expr::BinRel(op, ref l, ref r) => self.visit_binrel_ref(op, l, r),
            Expr::Extract(ref e, lsb, msb) => self.visit_extract_ref(e, lsb, msb),
            Expr::Concat(ref l, ref r) => self.visit_concat_ref(l, r),
            Expr::IfElse(ref c, ref l, ref r) => self.visit_ite_ref(c, l, r),
            Expr::Cast(ref e, c) => self.visit_cast_ref(e, c),
        }
    }
}

pub trait VisitMap<'expr> {
    fn visit_val(&mut self, bv: &'expr BitVec) -> SymExpr {
        SymExpr::val(*bv)
    }

    fn visit_var(&mut self, var: &'expr SymVar) -> SymExpr {
        SymExpr::var(var.clone())
    }

    fn visit_unop(&mut self, op: UnOp, expr: &'expr SymExpr) -> SymExpr {
        SymExpr::unop(op, self.visit_expr(expr))
    }

    fn visit_binop(&mut self, op: BinOp, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) -> SymExpr {
        SymExpr::binop(op, self.visit_expr(lexpr), self.visit_expr(rexpr))
    }

    fn visit_binrel(&mut self, op: BinRel, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) -> SymExpr {
        SymExpr::binrel(op, self.visit_expr(lexpr), self.visit_expr(rexpr))
    }

    fn visit_cast(&mut self, expr: &'expr SymExpr, cast: Cast) -> SymExpr {
        let expr = self.visit_expr(expr);
        match cast {
            Cast::Unsigned(bits) => expr.zero_extend(bits),
            Cast::Signed(bits) => expr.sign_extend(bits),
        }
    }

    fn visit_extract(&mut self, expr: &'expr SymExpr, lsb: u32, msb: u32) -> SymExpr {
        self.visit_expr(expr).extract(lsb, msb)
    }

    fn visit_concat(&mut self, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) -> SymExpr {
        let l = self.visit_expr(lexpr);
        l.concat(self.visit_expr(rexpr))
    }

    fn visit_ite(&mut self, cond: &'expr SymExpr, lexpr: &'expr SymExpr, rexpr: &'expr SymExpr) -> SymExpr {
        let c = self.visit_expr(cond);
        if c.is_true() {
            self.visit_expr(lexpr)
        } else if c.is_false() {
            self.visit_expr(rexpr)
        } else {
            let l = self.visit_expr(lexpr);
            c.ite(l, self.visit_expr(rexpr))
        }
    }

    fn visit_expr(&mut self, expr: &'expr SymExpr) -> SymExpr {
        self.walk_expr(expr)
    }

    fn walk_expr(&mut self, expr: &'expr SymExpr) -> SymExpr {
        match &**expr {
            Expr::Val(v) => self.visit_val(v),
            Expr::Var(v) => self.visit_var(v),
            Expr::UnOp(op, e) => self.visit_unop(*op, e),
            Expr::BinOp(op, l, r) => self.visit_binop(*op, l, r),
            Expr::BinRel(op, l, r) => self.visit_binrel(*op, l, r),
            Expr::IfElse(c, l, r) => self.visit_ite(c, l, r),
            Expr::Extract(e, lsb, msb) => self.visit_extract(e, *lsb, *msb),
            Expr::Concat(l, r) => self.visit_concat(l, r),
            Expr::Cast(e, c) => self.visit_cast(e, *c),
        }
    }
}

#[derive(Default)]
struct Variables {
    seen: FxHashSet<SymExpr>,
    vars: BTreeSet<SymVar>,
}

impl<'expr> VisitRef<'expr> for Variables {
    fn visit_val_ref(&mut self, _bv: &'expr BitVec) {}

    fn visit_var_ref(&mut self, var: &'expr SymVar) {
        self.vars.insert(var.clone());
    }

    fn visit_expr_ref(&mut self, expr: &'expr SymExpr) {
        // expressions are DAGs; shared subterms are walked once
        if self.seen.insert(expr.clone()) {
            self.walk_expr_ref(expr)
        }
    }
}

struct Substitute<'a> {
    assignment: &'a Assignment,
    cache: FxHashMap<SymExpr, SymExpr>,
}

impl<'a, 'expr> VisitMap<'expr> for Substitute<'a> {
    fn visit_var(&mut self, var: &'expr SymVar) -> SymExpr {
        match self.assignment.get(var) {
            Some(bv) => SymExpr::val(bv.resize(var.bits())),
            None => SymExpr::var(var.clone()),
        }
    }

    fn visit_expr(&mut self, expr: &'expr SymExpr) -> SymExpr {
        if let Some(e) = self.cache.get(expr) {
            return e.clone();
        }
        let e = self.walk_expr(expr);
        self.cache.insert(expr.clone(), e.clone());
        e
    }
}
