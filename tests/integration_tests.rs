//! Integration tests for the loop fusion pipeline.

use loopfuse::analysis::dependence::{banerjee_test, gcd_test};
use loopfuse::ir::{BinaryOp, CmpPred};
use loopfuse::prelude::*;
use loopfuse::transform::RejectedPair;

/// Run `check` with a legality checker over the loops headed by the two
/// given counted loops.
fn with_checker<R>(
    func: &Function,
    first: &CountedLoop,
    second: &CountedLoop,
    check: impl FnOnce(&LegalityChecker<'_>, &Loop, &Loop) -> R,
) -> R {
    let ctx = AnalysisContext::new(func);
    let se = ctx.scalar_evolution();
    let deps = DependenceAnalysis::new(func, &ctx.loops, &se);
    let checker = LegalityChecker::new(&ctx, &se, &deps);
    let a = ctx.loops.get(ctx.loops.loop_with_header(first.header).expect("first loop"));
    let b = ctx.loops.get(ctx.loops.loop_with_header(second.header).expect("second loop"));
    check(&checker, a, b)
}

/// Loop `i` stores `A[i + store_off]`, loop `j` then loads `A[j + load_off]`.
fn store_then_load(store_off: i64, load_off: i64) -> (Function, CountedLoop, CountedLoop) {
    let mut b = FunctionBuilder::new("shift");
    let arr = b.param("A", Type::Ptr);
    let out = b.param("B", Type::Ptr);
    let l1 = b.counted_loop("i", Value::Const(0), Value::Const(100), 1, |b, i| {
        let idx = b.add(i, Value::Const(store_off));
        let p = b.gep(arr, idx);
        b.store(p, i);
    });
    let l2 = b.counted_loop("j", Value::Const(0), Value::Const(100), 1, |b, j| {
        let idx = b.add(j, Value::Const(load_off));
        let p = b.gep(arr, idx);
        let v = b.load(p);
        let q = b.gep(out, j);
        b.store(q, v);
    });
    b.ret(None);
    (b.finish(), l1, l2)
}

fn first_rejection(func: &mut Function) -> Option<RejectedPair> {
    let result = FusionPass::default().run(func).expect("driver runs");
    result.rejected.into_iter().next()
}

fn loop_count(func: &Function) -> usize {
    AnalysisContext::new(func).loops.len()
}

#[test]
fn test_adjacency() {
    let (f, l1, l2) = store_then_load(0, 0);
    assert!(with_checker(&f, &l1, &l2, |c, a, b| c.is_adjacent(a, b)));

    // Any instruction in the hand-off block breaks adjacency.
    let mut g = f.clone();
    g.insert_before_terminator(
        l2.preheader,
        InstKind::Binary { op: BinaryOp::Add, lhs: Value::Const(1), rhs: Value::Const(2) },
        None,
    );
    assert!(!with_checker(&g, &l1, &l2, |c, a, b| c.is_adjacent(a, b)));
    let rejected = first_rejection(&mut g).expect("pair rejected");
    assert_eq!(rejected.reason.kind, LegalityErrorKind::NotAdjacent);
}

#[test]
fn test_trip_count_constant() {
    let build = |first: i64, second: i64| {
        let mut b = FunctionBuilder::new("f");
        let l1 = b.counted_loop("i", Value::Const(0), Value::Const(first), 1, |_, _| {});
        let l2 = b.counted_loop("j", Value::Const(0), Value::Const(second), 1, |_, _| {});
        b.ret(None);
        (b.finish(), l1, l2)
    };

    let (f, l1, l2) = build(10, 10);
    assert!(with_checker(&f, &l1, &l2, |c, a, b| c.same_trip_count(a, b)));

    let (f, l1, l2) = build(10, 11);
    assert!(!with_checker(&f, &l1, &l2, |c, a, b| c.same_trip_count(a, b)));
}

#[test]
fn test_trip_count_symbolic() {
    let mut b = FunctionBuilder::new("f");
    let n = b.param("n", Type::Int);
    let m = b.param("m", Type::Int);
    let l1 = b.counted_loop("i", Value::Const(0), n, 1, |_, _| {});
    let l2 = b.counted_loop("j", Value::Const(0), n, 1, |_, _| {});
    let l3 = b.counted_loop("k", Value::Const(0), m, 1, |_, _| {});
    b.ret(None);
    let f = b.finish();

    assert!(with_checker(&f, &l1, &l2, |c, a, b| c.same_trip_count(a, b)));
    let err = with_checker(&f, &l2, &l3, |c, a, b| c.check_same_trip_count(a, b)).unwrap_err();
    assert_eq!(err.kind, LegalityErrorKind::TripCountMismatch);
}

#[test]
fn test_flow_equivalence() {
    let (f, l1, l2) = store_then_load(0, 0);
    assert!(with_checker(&f, &l1, &l2, |c, a, b| c.flow_equivalent(a, b)));

    // The first loop only runs when n < 5; the second always runs.
    let mut b = FunctionBuilder::new("guarded");
    let n = b.param("n", Type::Int);
    let then_block = b.create_block("then");
    let join = b.create_block("join");
    let cond = b.cmp(CmpPred::Slt, n, Value::Const(5));
    b.cond_br(cond, then_block, join);
    b.switch_to(then_block);
    let l1 = b.counted_loop("i", Value::Const(0), Value::Const(10), 1, |_, _| {});
    b.br(join);
    b.switch_to(join);
    let l2 = b.counted_loop("j", Value::Const(0), Value::Const(10), 1, |_, _| {});
    b.ret(None);
    let mut f = b.finish();
    assert_eq!(verify_function(&f), Ok(()));

    assert!(!with_checker(&f, &l1, &l2, |c, a, b| c.flow_equivalent(a, b)));
    let result = FusionPass::default().run(&mut f).unwrap();
    assert!(!result.changed);
    assert_eq!(result.candidates, 1);
}

#[test]
fn test_same_index_is_legal() {
    let (mut f, l1, l2) = store_then_load(0, 0);
    assert!(with_checker(&f, &l1, &l2, |c, a, b| c.distance_independent(a, b)));
    let result = FusionPass::default().run(&mut f).unwrap();
    assert!(result.changed);
}

#[test]
fn test_value_produced_earlier_is_legal() {
    // B reads A[j], written by the first loop one iteration earlier.
    let (mut f, l1, l2) = store_then_load(1, 0);
    assert!(with_checker(&f, &l1, &l2, |c, a, b| c.distance_independent(a, b)));
    assert!(FusionPass::default().run(&mut f).unwrap().changed);
}

#[test]
fn test_value_produced_later_is_illegal() {
    // B reads A[j + 1], which the first loop writes only in the next iteration.
    let (mut f, l1, l2) = store_then_load(0, 1);
    let err = with_checker(&f, &l1, &l2, |c, a, b| c.check_distance_independent(a, b)).unwrap_err();
    assert_eq!(err.kind, LegalityErrorKind::NegativeDistance);

    let before = f.clone();
    let rejected = first_rejection(&mut f).expect("pair rejected");
    assert_eq!(rejected.reason.kind, LegalityErrorKind::NegativeDistance);
    assert_eq!(f, before);
}

#[test]
fn test_unresolvable_access_fails_closed() {
    // The second loop reads A[j * j], which is not an affine recurrence.
    let mut b = FunctionBuilder::new("f");
    let arr = b.param("A", Type::Ptr);
    let l1 = b.counted_loop("i", Value::Const(0), Value::Const(16), 1, |b, i| {
        let p = b.gep(arr, i);
        b.store(p, i);
    });
    let l2 = b.counted_loop("j", Value::Const(0), Value::Const(16), 1, |b, j| {
        let sq = b.mul(j, j);
        let p = b.gep(arr, sq);
        b.load(p);
    });
    b.ret(None);
    let f = b.finish();
    assert!(!with_checker(&f, &l1, &l2, |c, a, b| c.distance_independent(a, b)));
}

#[test]
fn test_store_in_first_latch_blocks_fusion() {
    // The first loop writes A[i] from its latch, which after fusion would
    // run behind the second loop's read of A[j].
    let mut b = FunctionBuilder::new("latch_store");
    let arr = b.param("A", Type::Ptr);
    let out = b.param("B", Type::Ptr);
    let l1 = b.counted_loop("i", Value::Const(0), Value::Const(100), 1, |_, _| {});
    b.counted_loop("j", Value::Const(0), Value::Const(100), 1, |b, j| {
        let p = b.gep(arr, j);
        let v = b.load(p);
        let q = b.gep(out, j);
        b.store(q, v);
    });
    b.ret(None);
    let mut f = b.finish();
    let p = f.insert_before_terminator(l1.latch, InstKind::Gep { base: arr, offset: l1.iv }, None);
    f.insert_before_terminator(l1.latch, InstKind::Store { addr: Value::Inst(p), value: Value::Const(42) }, None);
    assert_eq!(verify_function(&f), Ok(()));

    let before = f.clone();
    let result = FusionPass::default().run(&mut f).unwrap();
    assert!(!result.changed);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].reason.kind, LegalityErrorKind::MalformedLoopShape);
    assert_eq!(f, before);
}

#[test]
fn test_malformed_module_is_an_error() {
    let json = r#"{"name":"m","functions":[{"name":"f","params":[],"blocks":[],"insts":[],"layout":[3]}]}"#;
    let module = loopfuse::parse_module(json).unwrap();
    assert!(loopfuse::verify_module(&module).is_err());
}

#[test]
fn test_idempotence() {
    let (mut f, _, _) = store_then_load(0, 0);
    let pass = FusionPass::default();
    assert!(pass.run(&mut f).unwrap().changed);
    let fused = f.clone();

    let again = pass.run(&mut f).unwrap();
    assert!(!again.changed);
    assert_eq!(again.candidates, 0);
    assert_eq!(f, fused);
}

#[test]
fn test_end_to_end_fusion() {
    let mut b = FunctionBuilder::new("kernels");
    let x = b.param("X", Type::Ptr);
    let y = b.param("Y", Type::Ptr);
    let mut first_gep = None;
    let mut second_gep = None;
    let l1 = b.counted_loop("i", Value::Const(0), Value::Const(100), 1, |b, i| {
        let p = b.gep(x, i);
        first_gep = p.as_inst();
        b.store(p, Value::Const(0));
    });
    let l2 = b.counted_loop("j", Value::Const(0), Value::Const(100), 1, |b, j| {
        let p = b.gep(y, j);
        second_gep = p.as_inst();
        b.store(p, Value::Const(1));
    });
    b.ret(None);
    let mut f = b.finish();

    let result = loopfuse::fuse_function(&mut f, FusionConfig::default()).unwrap();
    assert_eq!(result.fused.len(), 1);
    assert_eq!(verify_function(&f), Ok(()));

    let ctx = AnalysisContext::new(&f);
    assert_eq!(ctx.loops.len(), 1);
    let fused = &ctx.loops.loops()[0];
    assert_eq!(fused.header(), l1.header);
    assert_eq!(fused.latch(), Some(l1.latch));
    assert_eq!(f.phis(l1.header).len(), 1);
    assert!(fused.contains(l1.body));
    assert!(fused.contains(l2.body));

    // One induction variable feeds both original bodies.
    let iv = fused.induction_variable().unwrap().value();
    assert_eq!(iv, l1.iv);
    for gep in [first_gep.unwrap(), second_gep.unwrap()] {
        assert!(f.inst(gep).kind.operands().contains(&iv));
    }

    let se = ctx.scalar_evolution();
    let count = se.backedge_taken_count(fused.id()).and_then(|c| c.as_constant());
    assert_eq!(count, Some(100));
}

#[test]
fn test_independent_arrays_chain() {
    let mut b = FunctionBuilder::new("f");
    let arrays: Vec<Value> = ["P", "Q", "R"].iter().map(|n| b.param(n, Type::Ptr)).collect();
    for (k, &array) in arrays.iter().enumerate() {
        b.counted_loop(&format!("l{}", k), Value::Const(0), Value::Const(32), 1, |b, i| {
            let p = b.gep(array, i);
            let v = b.load(p);
            let w = b.add(v, Value::Const(1));
            b.store(p, w);
        });
    }
    b.ret(None);
    let mut single = b.finish();
    let mut rescan = single.clone();

    let one = loopfuse::fuse_function(&mut single, FusionConfig::single_fusion()).unwrap();
    assert_eq!(one.fused.len(), 1);
    assert_eq!(loop_count(&single), 2);

    let all = loopfuse::fuse_function(&mut rescan, FusionConfig::default()).unwrap();
    assert_eq!(all.fused.len(), 2);
    assert_eq!(loop_count(&rescan), 1);
    assert_eq!(verify_function(&rescan), Ok(()));
}

#[test]
fn test_nested_loops_are_not_paired_across_parents() {
    let mut b = FunctionBuilder::new("nest");
    let a = b.param("A", Type::Ptr);
    b.counted_loop("i", Value::Const(0), Value::Const(4), 1, |b, _| {
        b.counted_loop("k", Value::Const(0), Value::Const(4), 1, |b, k| {
            let p = b.gep(a, k);
            b.store(p, k);
        });
    });
    b.counted_loop("j", Value::Const(0), Value::Const(8), 1, |b, _| {
        b.counted_loop("m", Value::Const(0), Value::Const(4), 1, |b, m| {
            let p = b.gep(a, m);
            b.load(p);
        });
    });
    b.ret(None);
    let mut f = b.finish();

    let result = FusionPass::default().run(&mut f).unwrap();
    // Only the two outer loops share a parent; their trip counts differ.
    assert_eq!(result.candidates, 1);
    assert_eq!(result.rejected[0].first, "i.header");
    assert_eq!(result.rejected[0].reason.kind, LegalityErrorKind::TripCountMismatch);
}

#[test]
fn test_json_round_trip_and_fuse() {
    let (f, _, _) = store_then_load(0, 0);
    let module = Module { name: "m".into(), functions: vec![f] };
    let json = serde_json::to_string(&module).unwrap();

    let mut parsed = loopfuse::parse_module(&json).unwrap();
    assert_eq!(parsed, module);
    let results = loopfuse::fuse_module(&mut parsed, FusionConfig::default()).unwrap();
    assert!(results[0].changed);
    assert!(parsed.pretty().contains("func @shift(%A: ptr, %B: ptr)"));
}

#[test]
fn test_gcd_and_banerjee() {
    // 2i - 2j = 1 has no integer solution.
    assert!(!gcd_test(&[2, -2], 1));
    assert!(gcd_test(&[2, -2], 4));
    // i - j + 200 = 0 is out of reach for i, j in [0, 99].
    assert!(!banerjee_test(&[1, -1], 200, &[0, 0], &[99, 99]));
    assert!(banerjee_test(&[1, -1], 5, &[0, 0], &[99, 99]));
}
