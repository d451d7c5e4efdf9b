//! Memory dependence oracle.
//!
//! This module answers whether two memory accesses may touch the same
//! element, using:
//! - A distinct-array aliasing model rooted at pointer parameters
//! - GCD test for quick independence checks
//! - Banerjee bounds test using constant trip counts
//! - Distance and direction computation for equal strides
//! - RAW/WAR/WAW/RAR classification
//!
//! Accesses in different loops are compared as if both loops were driven by
//! one shared iteration index, which is exactly the question loop fusion asks.

use super::loops::LoopInfo;
use super::scev::{Scev, ScalarEvolution, SymbolicEngine, SymbolicExpr};
use crate::ir::{Function, InstId, InstKind};
use num_integer::Integer;
use num_rational::Ratio;
use serde::{Serialize, Deserialize};

/// Kind of data dependence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependenceKind {
    /// Read-after-write (true/flow dependence)
    Flow,
    /// Write-after-read (anti dependence)
    Anti,
    /// Write-after-write (output dependence)
    Output,
    /// Read-after-read (input dependence, not a true dependence)
    Input,
}

impl DependenceKind {
    /// Classify by the access pair, source first.
    pub fn of_pair(src_writes: bool, dst_writes: bool) -> Self {
        match (src_writes, dst_writes) {
            (true, false) => DependenceKind::Flow,
            (false, true) => DependenceKind::Anti,
            (true, true) => DependenceKind::Output,
            (false, false) => DependenceKind::Input,
        }
    }

    /// Check if this is a "true" dependence that must be respected.
    pub fn is_true_dependence(&self) -> bool {
        !matches!(self, DependenceKind::Input)
    }

    /// Get short name for the dependence kind.
    pub fn short_name(&self) -> &'static str {
        match self {
            DependenceKind::Flow => "RAW",
            DependenceKind::Anti => "WAR",
            DependenceKind::Output => "WAW",
            DependenceKind::Input => "RAR",
        }
    }
}

/// Direction of a dependence along the shared iteration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// < (forward dependence, positive distance)
    Lt,
    /// = (same iteration, zero distance)
    Eq,
    /// > (backward dependence, negative distance)
    Gt,
    /// * (unknown/any direction)
    Star,
}

impl Direction {
    pub fn to_char(&self) -> char {
        match self {
            Direction::Lt => '<',
            Direction::Eq => '=',
            Direction::Gt => '>',
            Direction::Star => '*',
        }
    }

    /// Compute direction from a distance value.
    pub fn from_distance(dist: i64) -> Direction {
        match dist.cmp(&0) {
            std::cmp::Ordering::Less => Direction::Gt,
            std::cmp::Ordering::Equal => Direction::Eq,
            std::cmp::Ordering::Greater => Direction::Lt,
        }
    }
}

/// A possible conflict between two memory accesses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependenceInfo {
    pub src: InstId,
    pub dst: InstId,
    pub kind: DependenceKind,
    pub direction: Direction,
    /// `dst` iteration minus `src` iteration, when uniform
    pub distance: Option<i64>,
    /// The accesses could not be related at all (unknown base address)
    pub confused: bool,
}

impl DependenceInfo {
    pub fn is_input(&self) -> bool { self.kind == DependenceKind::Input }
    pub fn is_output(&self) -> bool { self.kind == DependenceKind::Output }
    pub fn is_flow(&self) -> bool { self.kind == DependenceKind::Flow }
    pub fn is_anti(&self) -> bool { self.kind == DependenceKind::Anti }
    pub fn is_confused(&self) -> bool { self.confused }

    /// Get a human-readable description.
    pub fn description(&self, func: &Function) -> String {
        let dist = match self.distance {
            Some(d) => d.to_string(),
            None => "?".to_string(),
        };
        format!(
            "{} -> {} [{}] dir=<{}> dist={}{}",
            func.value_name(self.src.into()),
            func.value_name(self.dst.into()),
            self.kind.short_name(),
            self.direction.to_char(),
            dist,
            if self.confused { " confused" } else { "" }
        )
    }
}

/// Source of memory dependence answers.
pub trait DependenceOracle {
    /// Report a possible dependence from `src` to `dst`. With
    /// `possibly_loop_independent` unset, conflicts within the same iteration
    /// are not reported.
    fn depends(&self, src: InstId, dst: InstId, possibly_loop_independent: bool) -> Option<DependenceInfo>;
}

/// Access address as `base + start + stride * k` on iteration `k`.
struct Subscript {
    start: SymbolicExpr,
    stride: SymbolicExpr,
    /// Upper bound on `k`, when the trip count is a known constant
    max_iter: Option<i64>,
}

/// Dependence tests over one function.
pub struct DependenceAnalysis<'a> {
    func: &'a Function,
    loops: &'a LoopInfo,
    se: &'a ScalarEvolution<'a>,
}

impl<'a> DependenceAnalysis<'a> {
    pub fn new(func: &'a Function, loops: &'a LoopInfo, se: &'a ScalarEvolution<'a>) -> Self {
        Self { func, loops, se }
    }

    /// `None` when the address cannot be tied to a pointer parameter by an
    /// affine expression.
    fn subscript(&self, access: InstId) -> Option<Subscript> {
        let inst = self.func.inst(access);
        let addr = inst.kind.pointer_operand()?;
        let base = self.se.base_pointer(addr)?;
        let scope = self.loops.loop_for(inst.block);
        let base_sym = SymbolicExpr::symbol(self.se.param_symbol(base));

        let (start, stride) = match self.se.expr_at_scope(addr, scope) {
            Scev::Invariant(e) => (e, SymbolicExpr::zero()),
            Scev::AddRec { start, step, .. } => (start, step),
            Scev::CouldNotCompute => return None,
        };
        let start = start.checked_sub(&base_sym)?;
        let max_iter = scope
            .and_then(|l| self.se.backedge_taken_count(l))
            .and_then(|c| c.as_constant())
            .map(|c| c - 1);
        Some(Subscript { start, stride, max_iter })
    }

    fn unknown(&self, src: InstId, dst: InstId, kind: DependenceKind, confused: bool) -> DependenceInfo {
        DependenceInfo { src, dst, kind, direction: Direction::Star, distance: None, confused }
    }
}

impl DependenceOracle for DependenceAnalysis<'_> {
    fn depends(&self, src: InstId, dst: InstId, possibly_loop_independent: bool) -> Option<DependenceInfo> {
        let src_kind = &self.func.inst(src).kind;
        let dst_kind = &self.func.inst(dst).kind;
        if !src_kind.is_memory_access() || !dst_kind.is_memory_access() {
            return None;
        }
        let kind = DependenceKind::of_pair(src_kind.writes_memory(), dst_kind.writes_memory());

        let base_of = |k: &InstKind| k.pointer_operand().and_then(|a| self.se.base_pointer(a));
        match (base_of(src_kind), base_of(dst_kind)) {
            (Some(x), Some(y)) if x != y => return None,
            (Some(_), Some(_)) => {}
            _ => return Some(self.unknown(src, dst, kind, true)),
        }
        let (Some(s), Some(d)) = (self.subscript(src), self.subscript(dst)) else {
            return Some(self.unknown(src, dst, kind, false));
        };

        // Solve start_s + a*ks == start_d + b*kd, i.e. a*ks - b*kd - c == 0.
        let c = d.start.checked_sub(&s.start).and_then(|e| e.as_constant());
        let (Some(c), Some(a), Some(b)) = (c, s.stride.as_constant(), d.stride.as_constant()) else {
            return Some(self.unknown(src, dst, kind, false));
        };

        let (Some(neg_b), Some(neg_c)) = (b.checked_neg(), c.checked_neg()) else {
            return Some(self.unknown(src, dst, kind, false));
        };

        if !gcd_test(&[a, neg_b], c) {
            return None;
        }
        if let (Some(ns), Some(nd)) = (s.max_iter, d.max_iter) {
            if ns < 0 || nd < 0 {
                return None;
            }
            if !banerjee_test(&[a, neg_b], neg_c, &[0, 0], &[ns, nd]) {
                return None;
            }
        }

        if a != b || a == 0 {
            return Some(self.unknown(src, dst, kind, false));
        }
        let ratio = Ratio::new(i128::from(neg_c), i128::from(a));
        if !ratio.is_integer() {
            return None;
        }
        let Ok(distance) = i64::try_from(ratio.to_integer()) else {
            return Some(self.unknown(src, dst, kind, false));
        };
        if distance == 0 && !possibly_loop_independent {
            return None;
        }
        Some(DependenceInfo {
            src,
            dst,
            kind,
            direction: Direction::from_distance(distance),
            distance: Some(distance),
            confused: false,
        })
    }
}

/// GCD test: `sum(coeffs[i] * x[i]) == constant` has an integer solution
/// only if the gcd of the coefficients divides the constant.
pub fn gcd_test(coeffs: &[i64], constant: i64) -> bool {
    let g = coeffs.iter().fold(0i128, |acc, &c| acc.gcd(&(c as i128)));
    if g == 0 {
        constant == 0
    } else {
        constant as i128 % g == 0
    }
}

/// Banerjee bounds test: can `constant + sum(coeffs[i] * x[i])` reach zero
/// with every `x[i]` in `[lower_bounds[i], upper_bounds[i]]`?
pub fn banerjee_test(
    coeffs: &[i64],
    constant: i64,
    lower_bounds: &[i64],
    upper_bounds: &[i64],
) -> bool {
    let mut min_val = constant as i128;
    let mut max_val = constant as i128;

    for (i, &c) in coeffs.iter().enumerate() {
        let (Some(&lb), Some(&ub)) = (lower_bounds.get(i), upper_bounds.get(i)) else {
            return true;
        };
        let (c, lb, ub) = (c as i128, lb as i128, ub as i128);
        if c > 0 {
            min_val += c * lb;
            max_val += c * ub;
        } else {
            min_val += c * ub;
            max_val += c * lb;
        }
    }

    min_val <= 0 && max_val >= 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::ControlFlowGraph;
    use crate::analysis::dominators::DominatorTree;
    use crate::ir::{FunctionBuilder, Type, Value};

    /// Store `dst[i + store_off]` in one loop, load `src[i + load_off]` in
    /// the next; both loops run `0..trip`.
    fn two_loops(store_off: i64, load_off: i64, same_array: bool, trip: i64) -> (Function, InstId, InstId) {
        let mut b = FunctionBuilder::new("f");
        let a = b.param("A", Type::Ptr);
        let other = b.param("B", Type::Ptr);
        let load_base = if same_array { a } else { other };
        let mut store = None;
        let mut load = None;
        b.counted_loop("i", Value::Const(0), Value::Const(trip), 1, |b, i| {
            let idx = b.add(i, Value::Const(store_off));
            let p = b.gep(a, idx);
            store = Some(b.store(p, Value::Const(1)));
        });
        b.counted_loop("j", Value::Const(0), Value::Const(trip), 1, |b, j| {
            let idx = b.add(j, Value::Const(load_off));
            let p = b.gep(load_base, idx);
            load = b.load(p).as_inst();
        });
        b.ret(None);
        (b.finish(), store.unwrap(), load.unwrap())
    }

    fn query(f: &Function, src: InstId, dst: InstId, independent: bool) -> Option<DependenceInfo> {
        let cfg = ControlFlowGraph::compute(f);
        let dom = DominatorTree::from_cfg(&cfg);
        let li = LoopInfo::compute(f, &cfg, &dom);
        let se = ScalarEvolution::new(f, &li);
        let da = DependenceAnalysis::new(f, &li, &se);
        da.depends(src, dst, independent)
    }

    #[test]
    fn test_gcd() {
        assert!(gcd_test(&[2, -2], 0));
        assert!(gcd_test(&[3, -6], 9));
        assert!(!gcd_test(&[3, -6], 10));
        assert!(!gcd_test(&[0, 0], 1));
        assert!(gcd_test(&[i64::MIN, 2], 4));
        assert!(!gcd_test(&[i64::MIN, i64::MIN], 1));
    }

    #[test]
    fn test_banerjee() {
        assert!(banerjee_test(&[1, -1], 0, &[0, 0], &[9, 9]));
        assert!(!banerjee_test(&[1, -1], 20, &[0, 0], &[9, 9]));
    }

    #[test]
    fn test_direction_from_distance() {
        assert_eq!(Direction::from_distance(1), Direction::Lt);
        assert_eq!(Direction::from_distance(0), Direction::Eq);
        assert_eq!(Direction::from_distance(-1), Direction::Gt);
    }

    #[test]
    fn test_dependence_kind() {
        assert_eq!(DependenceKind::of_pair(true, false), DependenceKind::Flow);
        assert_eq!(DependenceKind::of_pair(false, true), DependenceKind::Anti);
        assert_eq!(DependenceKind::of_pair(true, true), DependenceKind::Output);
        assert!(!DependenceKind::of_pair(false, false).is_true_dependence());
    }

    #[test]
    fn test_same_index_flow_dependence() {
        let (f, store, load) = two_loops(0, 0, true, 10);
        let dep = query(&f, store, load, true).unwrap();
        assert!(dep.is_flow());
        assert_eq!(dep.distance, Some(0));
        assert_eq!(dep.direction, Direction::Eq);
        assert!(query(&f, store, load, false).is_none());
    }

    #[test]
    fn test_distance_sign() {
        // Store A[i+1], load A[i]: the load of iteration k+1 reads the store of k.
        let (f, store, load) = two_loops(1, 0, true, 10);
        let dep = query(&f, store, load, true).unwrap();
        assert_eq!(dep.distance, Some(1));
        assert_eq!(dep.direction, Direction::Lt);

        let (f, store, load) = two_loops(0, 1, true, 10);
        let dep = query(&f, store, load, true).unwrap();
        assert_eq!(dep.distance, Some(-1));
        assert_eq!(dep.direction, Direction::Gt);
    }

    #[test]
    fn test_extreme_offset_has_unknown_direction() {
        let (f, store, load) = two_loops(0, i64::MIN, true, 10);
        let dep = query(&f, store, load, true).unwrap();
        assert_eq!(dep.direction, Direction::Star);
        assert_eq!(dep.distance, None);
    }

    #[test]
    fn test_distinct_arrays_do_not_alias() {
        let (f, store, load) = two_loops(0, 0, false, 10);
        assert!(query(&f, store, load, true).is_none());
    }

    #[test]
    fn test_banerjee_proves_out_of_range_independence() {
        let (f, store, load) = two_loops(0, 20, true, 10);
        assert!(query(&f, store, load, true).is_none());
    }

    #[test]
    fn test_gcd_proves_strided_independence() {
        let mut b = FunctionBuilder::new("f");
        let a = b.param("A", Type::Ptr);
        let mut store = None;
        let mut load = None;
        b.counted_loop("i", Value::Const(0), Value::Const(10), 1, |b, i| {
            let even = b.mul(i, Value::Const(2));
            let p = b.gep(a, even);
            store = Some(b.store(p, Value::Const(0)));
            let odd = b.add(even, Value::Const(1));
            let q = b.gep(a, odd);
            load = b.load(q).as_inst();
        });
        b.ret(None);
        let f = b.finish();
        assert!(query(&f, store.unwrap(), load.unwrap(), true).is_none());
    }

    #[test]
    fn test_unknown_base_is_confused() {
        let mut b = FunctionBuilder::new("f");
        let table = b.param("T", Type::Ptr);
        let a = b.param("A", Type::Ptr);
        let inner = b.load(table);
        let mut store = None;
        let mut load = None;
        b.counted_loop("i", Value::Const(0), Value::Const(10), 1, |b, i| {
            let p = b.gep(inner, i);
            store = Some(b.store(p, Value::Const(0)));
            let q = b.gep(a, i);
            load = b.load(q).as_inst();
        });
        b.ret(None);
        let f = b.finish();
        let dep = query(&f, store.unwrap(), load.unwrap(), true).unwrap();
        assert!(dep.is_confused());
        assert_eq!(dep.direction, Direction::Star);
        assert!(dep.description(&f).contains("confused"));
    }
}
