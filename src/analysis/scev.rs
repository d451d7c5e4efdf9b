//! Symbolic affine-expression engine.
//!
//! Values are described relative to a loop scope either as loop-invariant
//! polynomials over symbolic unknowns or as first-order recurrences
//! `{start,+,step}<loop>`. Anything else could not be computed and makes the
//! caller fail closed.

use super::loops::{LoopId, LoopInfo};
use crate::ir::{BinaryOp, CmpPred, Function, InstKind, Type, Value};
use crate::utils::intern::{intern, Symbol};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Nesting limit when folding loop-invariant arithmetic.
const MAX_FOLD_DEPTH: usize = 64;

/// A product of symbols, kept sorted so equal products compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Monomial(Vec<Symbol>);

impl Monomial {
    pub fn unit() -> Self {
        Monomial(Vec::new())
    }

    pub fn symbol(sym: Symbol) -> Self {
        Monomial(vec![sym])
    }

    pub fn is_unit(&self) -> bool {
        self.0.is_empty()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.0
    }

    fn times(&self, other: &Monomial) -> Monomial {
        let mut syms: Vec<Symbol> = self.0.iter().chain(other.0.iter()).copied().collect();
        syms.sort();
        Monomial(syms)
    }
}

/// Integer polynomial over interned symbols in canonical form: no zero
/// coefficients, terms keyed by sorted monomials. Structural equality is
/// therefore equality after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SymbolicExpr {
    terms: BTreeMap<Monomial, i64>,
}

impl SymbolicExpr {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn constant(c: i64) -> Self {
        let mut e = Self::zero();
        if c != 0 {
            e.terms.insert(Monomial::unit(), c);
        }
        e
    }

    pub fn symbol(sym: Symbol) -> Self {
        let mut e = Self::zero();
        e.terms.insert(Monomial::symbol(sym), 1);
        e
    }

    pub fn is_zero(&self) -> bool {
        self.terms.is_empty()
    }

    /// The value if the expression has no symbolic terms.
    pub fn as_constant(&self) -> Option<i64> {
        match self.terms.len() {
            0 => Some(0),
            1 => self.terms.get(&Monomial::unit()).copied(),
            _ => None,
        }
    }

    /// Coefficient of the linear term in `sym`.
    pub fn coefficient(&self, sym: Symbol) -> i64 {
        self.terms.get(&Monomial::symbol(sym)).copied().unwrap_or(0)
    }

    pub fn symbols(&self) -> BTreeSet<Symbol> {
        self.terms.keys().flat_map(|m| m.symbols().iter().copied()).collect()
    }

    pub fn terms(&self) -> impl Iterator<Item = (&Monomial, i64)> {
        self.terms.iter().map(|(m, c)| (m, *c))
    }

    fn accumulate(&mut self, mono: Monomial, coeff: i64) -> Option<()> {
        let slot = self.terms.entry(mono.clone()).or_insert(0);
        *slot = slot.checked_add(coeff)?;
        if *slot == 0 {
            self.terms.remove(&mono);
        }
        Some(())
    }

    pub fn checked_add(&self, other: &SymbolicExpr) -> Option<SymbolicExpr> {
        let mut out = self.clone();
        for (m, c) in &other.terms {
            out.accumulate(m.clone(), *c)?;
        }
        Some(out)
    }

    pub fn checked_neg(&self) -> Option<SymbolicExpr> {
        self.checked_scale(-1)
    }

    pub fn checked_sub(&self, other: &SymbolicExpr) -> Option<SymbolicExpr> {
        self.checked_add(&other.checked_neg()?)
    }

    pub fn checked_scale(&self, k: i64) -> Option<SymbolicExpr> {
        let mut out = SymbolicExpr::zero();
        if k == 0 {
            return Some(out);
        }
        for (m, c) in &self.terms {
            out.terms.insert(m.clone(), c.checked_mul(k)?);
        }
        Some(out)
    }

    pub fn checked_mul(&self, other: &SymbolicExpr) -> Option<SymbolicExpr> {
        let mut out = SymbolicExpr::zero();
        for (ma, ca) in &self.terms {
            for (mb, cb) in &other.terms {
                out.accumulate(ma.times(mb), ca.checked_mul(*cb)?)?;
            }
        }
        Some(out)
    }
}

impl From<i64> for SymbolicExpr {
    fn from(c: i64) -> Self {
        SymbolicExpr::constant(c)
    }
}

impl fmt::Display for SymbolicExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "0");
        }
        // Symbolic terms first, constant last.
        let ordered = self
            .terms
            .iter()
            .filter(|(m, _)| !m.is_unit())
            .chain(self.terms.iter().filter(|(m, _)| m.is_unit()));
        for (i, (mono, coeff)) in ordered.enumerate() {
            let magnitude = coeff.unsigned_abs();
            if i == 0 {
                if *coeff < 0 {
                    write!(f, "-")?;
                }
            } else if *coeff < 0 {
                write!(f, " - ")?;
            } else {
                write!(f, " + ")?;
            }
            let product: Vec<String> = mono.symbols().iter().map(|s| s.name()).collect();
            match (mono.is_unit(), magnitude) {
                (true, _) => write!(f, "{}", magnitude)?,
                (false, 1) => write!(f, "{}", product.join("*"))?,
                (false, _) => write!(f, "{}*{}", magnitude, product.join("*"))?,
            }
        }
        Ok(())
    }
}

/// Symbolic description of a value relative to a loop scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scev {
    /// Does not vary within the scope
    Invariant(SymbolicExpr),
    /// `start + step * k` on iteration `k` of `loop_id`
    AddRec { start: SymbolicExpr, step: SymbolicExpr, loop_id: LoopId },
    CouldNotCompute,
}

impl Scev {
    pub fn is_computable(&self) -> bool {
        !matches!(self, Scev::CouldNotCompute)
    }

    pub fn as_invariant(&self) -> Option<&SymbolicExpr> {
        match self {
            Scev::Invariant(e) => Some(e),
            _ => None,
        }
    }

    fn add_rec(start: SymbolicExpr, step: SymbolicExpr, loop_id: LoopId) -> Scev {
        if step.is_zero() {
            Scev::Invariant(start)
        } else {
            Scev::AddRec { start, step, loop_id }
        }
    }

    fn add(&self, other: &Scev) -> Scev {
        let combined = match (self, other) {
            (Scev::Invariant(a), Scev::Invariant(b)) => a.checked_add(b).map(Scev::Invariant),
            (Scev::AddRec { start, step, loop_id }, Scev::Invariant(inv))
            | (Scev::Invariant(inv), Scev::AddRec { start, step, loop_id }) => {
                start.checked_add(inv).map(|s| Scev::add_rec(s, step.clone(), *loop_id))
            }
            (
                Scev::AddRec { start: s1, step: t1, loop_id: l1 },
                Scev::AddRec { start: s2, step: t2, loop_id: l2 },
            ) if l1 == l2 => s1
                .checked_add(s2)
                .zip(t1.checked_add(t2))
                .map(|(s, t)| Scev::add_rec(s, t, *l1)),
            _ => None,
        };
        combined.unwrap_or(Scev::CouldNotCompute)
    }

    fn negate(&self) -> Scev {
        let negated = match self {
            Scev::Invariant(e) => e.checked_neg().map(Scev::Invariant),
            Scev::AddRec { start, step, loop_id } => start
                .checked_neg()
                .zip(step.checked_neg())
                .map(|(s, t)| Scev::add_rec(s, t, *loop_id)),
            Scev::CouldNotCompute => None,
        };
        negated.unwrap_or(Scev::CouldNotCompute)
    }

    fn mul(&self, other: &Scev) -> Scev {
        let product = match (self, other) {
            (Scev::Invariant(a), Scev::Invariant(b)) => a.checked_mul(b).map(Scev::Invariant),
            (Scev::AddRec { start, step, loop_id }, Scev::Invariant(inv))
            | (Scev::Invariant(inv), Scev::AddRec { start, step, loop_id }) => start
                .checked_mul(inv)
                .zip(step.checked_mul(inv))
                .map(|(s, t)| Scev::add_rec(s, t, *loop_id)),
            _ => None,
        };
        product.unwrap_or(Scev::CouldNotCompute)
    }
}

impl fmt::Display for Scev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scev::Invariant(e) => write!(f, "{}", e),
            Scev::AddRec { start, step, loop_id } => write!(f, "{{{},+,{}}}<{}>", start, step, loop_id),
            Scev::CouldNotCompute => write!(f, "***COULDNOTCOMPUTE***"),
        }
    }
}

/// Queries the fusion legality checks make of a symbolic engine.
pub trait SymbolicEngine {
    /// Describe `value` as seen from inside `scope` (`None` is function level).
    fn expr_at_scope(&self, value: Value, scope: Option<LoopId>) -> Scev;

    /// How many times the loop's back edge executes, when it can be computed.
    fn backedge_taken_count(&self, loop_id: LoopId) -> Option<SymbolicExpr>;

    fn is_known_non_zero(&self, expr: &SymbolicExpr) -> bool {
        matches!(expr.as_constant(), Some(c) if c != 0)
    }

    /// Proves `lhs pred rhs`; `false` means not proven, not disproven.
    fn is_known_predicate(&self, pred: CmpPred, lhs: &SymbolicExpr, rhs: &SymbolicExpr) -> bool {
        lhs.checked_sub(rhs)
            .and_then(|d| d.as_constant())
            .map_or(false, |d| pred.evaluate(d, 0))
    }

    fn minus(&self, lhs: &SymbolicExpr, rhs: &SymbolicExpr) -> Option<SymbolicExpr> {
        lhs.checked_sub(rhs)
    }

    fn mul(&self, lhs: &SymbolicExpr, rhs: &SymbolicExpr) -> Option<SymbolicExpr> {
        lhs.checked_mul(rhs)
    }
}

/// Scalar evolution over one function and its loop forest.
pub struct ScalarEvolution<'a> {
    func: &'a Function,
    loops: &'a LoopInfo,
    cache: RefCell<HashMap<(Value, Option<LoopId>), Scev>>,
}

impl<'a> ScalarEvolution<'a> {
    pub fn new(func: &'a Function, loops: &'a LoopInfo) -> Self {
        Self { func, loops, cache: RefCell::new(HashMap::new()) }
    }

    /// Symbol standing for an opaque value.
    fn unknown(&self, value: Value) -> Symbol {
        match value {
            Value::Inst(id) => intern(&format!("{}#{}", self.func.value_name(value), id.0)),
            _ => intern(&self.func.value_name(value)),
        }
    }

    /// Whether `scope` lies inside (or is) loop `l`.
    fn within(&self, scope: Option<LoopId>, l: LoopId) -> bool {
        scope.map_or(false, |s| self.loops.encloses(l, s))
    }

    fn compute(&self, value: Value, scope: Option<LoopId>, depth: usize) -> Scev {
        let id = match value {
            Value::Const(c) => return Scev::Invariant(SymbolicExpr::constant(c)),
            Value::Param(_) => return Scev::Invariant(SymbolicExpr::symbol(self.unknown(value))),
            Value::Inst(id) => id,
        };
        if depth > MAX_FOLD_DEPTH {
            return Scev::CouldNotCompute;
        }
        if let Some(hit) = self.cache.borrow().get(&(value, scope)) {
            return hit.clone();
        }

        let inst = self.func.inst(id);
        let def_loop = self.loops.loop_for(inst.block);

        let result = match def_loop {
            // Defined in a loop strictly enclosing the scope: fixed for the
            // whole scope, so fold what can be folded and name the rest.
            Some(dl) if self.within(scope, dl) && Some(dl) != scope => {
                self.fold_invariant(value, &inst.kind, scope, depth)
            }
            None => self.fold_invariant(value, &inst.kind, scope, depth),
            Some(dl) if Some(dl) == scope => self.compute_in_scope(value, &inst.kind, dl, depth),
            // Inside a sub-loop of the scope or in an unrelated loop.
            Some(_) => Scev::CouldNotCompute,
        };

        self.cache.borrow_mut().insert((value, scope), result.clone());
        result
    }

    fn fold_invariant(&self, value: Value, kind: &InstKind, scope: Option<LoopId>, depth: usize) -> Scev {
        let folded = match kind {
            InstKind::Binary { .. } | InstKind::Gep { .. } => self.combine(kind, scope, depth),
            _ => Scev::CouldNotCompute,
        };
        match folded {
            Scev::Invariant(_) => folded,
            _ => Scev::Invariant(SymbolicExpr::symbol(self.unknown(value))),
        }
    }

    fn compute_in_scope(&self, value: Value, kind: &InstKind, scope: LoopId, depth: usize) -> Scev {
        match kind {
            InstKind::Phi { .. } => {
                let l = self.loops.get(scope);
                match l.induction_variable() {
                    Some(iv) if iv.value() == value => {
                        match self.compute(iv.start, Some(scope), depth + 1) {
                            Scev::Invariant(start) => {
                                Scev::add_rec(start, SymbolicExpr::constant(iv.step), scope)
                            }
                            _ => Scev::CouldNotCompute,
                        }
                    }
                    _ => Scev::CouldNotCompute,
                }
            }
            InstKind::Binary { .. } | InstKind::Gep { .. } => self.combine(kind, Some(scope), depth),
            _ => Scev::CouldNotCompute,
        }
    }

    fn combine(&self, kind: &InstKind, scope: Option<LoopId>, depth: usize) -> Scev {
        match *kind {
            InstKind::Binary { op, lhs, rhs } => {
                let a = self.compute(lhs, scope, depth + 1);
                let b = self.compute(rhs, scope, depth + 1);
                match op {
                    BinaryOp::Add => a.add(&b),
                    BinaryOp::Sub => a.add(&b.negate()),
                    BinaryOp::Mul => a.mul(&b),
                }
            }
            InstKind::Gep { base, offset } => {
                let a = self.compute(base, scope, depth + 1);
                let b = self.compute(offset, scope, depth + 1);
                a.add(&b)
            }
            _ => Scev::CouldNotCompute,
        }
    }

    /// Root pointer parameter of an address, following `gep` bases.
    pub fn base_pointer(&self, addr: Value) -> Option<u32> {
        let mut cur = addr;
        for _ in 0..MAX_FOLD_DEPTH {
            match cur {
                Value::Param(idx) if self.func.param_type(idx) == Some(Type::Ptr) => return Some(idx),
                Value::Inst(id) => match self.func.inst(id).kind {
                    InstKind::Gep { base, .. } => cur = base,
                    _ => return None,
                },
                _ => return None,
            }
        }
        None
    }

    /// Symbol used for a parameter inside expressions.
    pub fn param_symbol(&self, idx: u32) -> Symbol {
        self.unknown(Value::Param(idx))
    }

    fn trip_count(&self, pred: CmpPred, start: &SymbolicExpr, bound: &SymbolicExpr, step: i64) -> Option<SymbolicExpr> {
        if let (Some(s), Some(b)) = (start.as_constant(), bound.as_constant()) {
            return constant_trip_count(pred, s, b, step).map(SymbolicExpr::constant);
        }
        // Symbolic counts are exact whenever they are non-negative.
        let up = bound.checked_sub(start)?;
        let down = start.checked_sub(bound)?;
        let one = SymbolicExpr::constant(1);
        match (pred, step) {
            (CmpPred::Slt, 1) | (CmpPred::Ne, 1) => Some(up),
            (CmpPred::Sle, 1) => up.checked_add(&one),
            (CmpPred::Sgt, -1) | (CmpPred::Ne, -1) => Some(down),
            (CmpPred::Sge, -1) => down.checked_add(&one),
            _ => None,
        }
    }
}

/// Body executions of `for (iv = s; iv pred b; iv += step)`, or `None` when
/// the loop may not terminate.
fn constant_trip_count(pred: CmpPred, s: i64, b: i64, step: i64) -> Option<i64> {
    if !pred.evaluate(s, b) {
        return Some(0);
    }
    let (s, b, step) = (s as i128, b as i128, step as i128);
    let count = match pred {
        CmpPred::Slt if step > 0 => (b - s + step - 1) / step,
        CmpPred::Sle if step > 0 => (b - s) / step + 1,
        CmpPred::Sgt if step < 0 => (s - b + (-step) - 1) / (-step),
        CmpPred::Sge if step < 0 => (s - b) / (-step) + 1,
        CmpPred::Ne if (b - s) % step == 0 && (b - s) / step > 0 => (b - s) / step,
        CmpPred::Eq => 1,
        _ => return None,
    };
    i64::try_from(count).ok()
}

impl SymbolicEngine for ScalarEvolution<'_> {
    fn expr_at_scope(&self, value: Value, scope: Option<LoopId>) -> Scev {
        self.compute(value, scope, 0)
    }

    fn backedge_taken_count(&self, loop_id: LoopId) -> Option<SymbolicExpr> {
        let l = self.loops.get(loop_id);
        let iv = l.induction_variable()?;
        if l.exiting_blocks() != [l.header()] {
            return None;
        }
        let term = self.func.terminator(l.header())?;
        let InstKind::CondBr { cond, then_dest, else_dest } = self.func.inst(term).kind else {
            return None;
        };
        let stay_on_true = match (l.contains(then_dest), l.contains(else_dest)) {
            (true, false) => true,
            (false, true) => false,
            _ => return None,
        };
        let InstKind::Cmp { pred, lhs, rhs } = self.func.inst(cond.as_inst()?).kind else {
            return None;
        };

        let (pred, bound) = if lhs == iv.value() {
            (pred, rhs)
        } else if rhs == iv.value() {
            (pred.swapped(), lhs)
        } else {
            return None;
        };
        let pred = if stay_on_true { pred } else { pred.inverse() };

        let bound = self.expr_at_scope(bound, Some(loop_id));
        let start = self.expr_at_scope(iv.start, Some(loop_id));
        match (bound, start) {
            (Scev::Invariant(b), Scev::Invariant(s)) => self.trip_count(pred, &s, &b, iv.step),
            _ => None,
        }
    }
}
