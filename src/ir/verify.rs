//! Structural verifier for functions.
//!
//! Checks that every live block ends in exactly one terminator whose targets
//! are live, that phis sit at block starts and cover exactly the block's
//! predecessors, that operands refer to live value-producing instructions,
//! and that every definition dominates its uses.

use super::function::{BlockId, Function, InstId, InstKind, Value};
use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::dominators::DominatorTree;
use crate::utils::errors::VerifyError;
use std::collections::{HashMap, HashSet};

/// Verify `func`, reporting the first violation found.
pub fn verify_function(func: &Function) -> Result<(), VerifyError> {
    let Some(entry) = func.entry() else {
        return Err(VerifyError::new(format!("function {} has no blocks", func.name)));
    };
    check_handles(func)?;

    // Position of every live instruction: (block, index in block).
    let mut position: HashMap<InstId, (BlockId, usize)> = HashMap::new();
    for &block in func.layout() {
        check_block_shape(func, block)?;
        for (idx, &inst) in func.block(block).insts.iter().enumerate() {
            if func.inst(inst).block != block {
                return Err(VerifyError::in_block(block, format!("{} records the wrong parent block", inst)));
            }
            if position.insert(inst, (block, idx)).is_some() {
                return Err(VerifyError::in_block(block, format!("{} appears twice", inst)));
            }
        }
    }

    let cfg = ControlFlowGraph::compute(func);
    if !cfg.preds(entry).is_empty() {
        return Err(VerifyError::in_block(entry, "entry block has predecessors"));
    }
    let dom = DominatorTree::from_cfg(&cfg);

    for &block in func.layout() {
        for (idx, &inst) in func.block(block).insts.iter().enumerate() {
            let kind = &func.inst(inst).kind;
            if let InstKind::Phi { incoming } = kind {
                check_phi(func, &cfg, &dom, &position, block, inst, incoming)?;
                continue;
            }
            for operand in kind.operands() {
                check_operand(func, &position, block, inst, operand)?;
                if let Value::Inst(def) = operand {
                    let (def_block, def_idx) = position[&def];
                    let dominated = if def_block == block {
                        def_idx < idx
                    } else {
                        !cfg.is_reachable(block) || dom.dominates(def_block, block)
                    };
                    if !dominated {
                        return Err(VerifyError::in_block(
                            block,
                            format!("{} does not dominate its use in {}", func.value_name(operand), inst),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Every handle reachable from the layout must name a live arena slot.
/// Functions decoded from JSON are not trusted to uphold this.
fn check_handles(func: &Function) -> Result<(), VerifyError> {
    let mut seen: HashSet<BlockId> = HashSet::new();
    for &block in func.layout() {
        if block.index() >= func.block_capacity() {
            return Err(VerifyError::new(format!("layout names unknown block {}", block)));
        }
        if !func.contains_block(block) {
            return Err(VerifyError::in_block(block, "detached block is still in the layout"));
        }
        if !seen.insert(block) {
            return Err(VerifyError::in_block(block, "block appears twice in the layout"));
        }
    }
    for &block in func.layout() {
        for &inst in &func.block(block).insts {
            if inst.index() >= func.inst_capacity() {
                return Err(VerifyError::in_block(block, format!("unknown instruction {}", inst)));
            }
            let owner = func.inst(inst).block;
            if owner.index() >= func.block_capacity() {
                return Err(VerifyError::in_block(block, format!("{} names unknown block {}", inst, owner)));
            }
            let targets: Vec<BlockId> = match &func.inst(inst).kind {
                InstKind::Phi { incoming } => incoming.iter().map(|(b, _)| *b).collect(),
                kind => kind.successors(),
            };
            if let Some(bad) = targets.iter().find(|b| b.index() >= func.block_capacity()) {
                return Err(VerifyError::in_block(block, format!("{} refers to unknown block {}", inst, bad)));
            }
        }
    }
    Ok(())
}

fn check_block_shape(func: &Function, block: BlockId) -> Result<(), VerifyError> {
    let insts = &func.block(block).insts;
    let Some((&last, body)) = insts.split_last() else {
        return Err(VerifyError::in_block(block, "empty block"));
    };
    if !func.inst(last).kind.is_terminator() {
        return Err(VerifyError::in_block(block, "block does not end in a terminator"));
    }
    let mut seen_non_phi = false;
    for &inst in body {
        let kind = &func.inst(inst).kind;
        if kind.is_terminator() {
            return Err(VerifyError::in_block(block, format!("terminator {} in the middle of the block", inst)));
        }
        if kind.is_phi() && seen_non_phi {
            return Err(VerifyError::in_block(block, format!("phi {} after a non-phi instruction", inst)));
        }
        seen_non_phi |= !kind.is_phi();
    }
    for succ in func.inst(last).kind.successors() {
        if !func.contains_block(succ) {
            return Err(VerifyError::in_block(block, format!("branch to removed block {}", succ)));
        }
    }
    Ok(())
}

fn check_operand(
    func: &Function,
    position: &HashMap<InstId, (BlockId, usize)>,
    block: BlockId,
    user: InstId,
    operand: Value,
) -> Result<(), VerifyError> {
    match operand {
        Value::Const(_) => Ok(()),
        Value::Param(idx) if (idx as usize) < func.params.len() => Ok(()),
        Value::Param(idx) => Err(VerifyError::in_block(block, format!("{} uses missing parameter {}", user, idx))),
        Value::Inst(def) if !position.contains_key(&def) => {
            Err(VerifyError::in_block(block, format!("{} uses dead instruction {}", user, def)))
        }
        Value::Inst(def) if !func.inst(def).kind.has_result() => {
            Err(VerifyError::in_block(block, format!("{} uses {} which produces no value", user, def)))
        }
        Value::Inst(_) => Ok(()),
    }
}

fn check_phi(
    func: &Function,
    cfg: &ControlFlowGraph,
    dom: &DominatorTree,
    position: &HashMap<InstId, (BlockId, usize)>,
    block: BlockId,
    phi: InstId,
    incoming: &[(BlockId, Value)],
) -> Result<(), VerifyError> {
    if !cfg.is_reachable(block) {
        return Ok(());
    }
    let preds = cfg.preds(block);
    let mut incoming_blocks: Vec<BlockId> = incoming.iter().map(|(b, _)| *b).collect();
    incoming_blocks.sort();
    let mut expected = preds.to_vec();
    expected.sort();
    if incoming_blocks != expected {
        return Err(VerifyError::in_block(
            block,
            format!("phi {} incoming blocks do not match the predecessors", phi),
        ));
    }
    for &(pred, value) in incoming {
        check_operand(func, position, block, phi, value)?;
        if let Value::Inst(def) = value {
            let def_block = position[&def].0;
            if cfg.is_reachable(pred) && !dom.dominates(def_block, pred) {
                return Err(VerifyError::in_block(
                    block,
                    format!("{} does not dominate the edge from {} in phi {}", func.value_name(value), pred, phi),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Type};

    fn sample() -> (Function, crate::ir::CountedLoop) {
        let mut b = FunctionBuilder::new("f");
        let a = b.param("A", Type::Ptr);
        let lp = b.counted_loop("i", Value::Const(0), Value::Const(4), 1, |b, i| {
            let p = b.gep(a, i);
            b.store(p, i);
        });
        b.ret(None);
        (b.finish(), lp)
    }

    #[test]
    fn test_well_formed_loop() {
        let (f, _) = sample();
        assert_eq!(verify_function(&f), Ok(()));
    }

    #[test]
    fn test_missing_terminator() {
        let mut b = FunctionBuilder::new("f");
        b.add(Value::Const(1), Value::Const(2));
        let f = b.finish();
        let err = verify_function(&f).unwrap_err();
        assert!(err.message.contains("terminator"));
    }

    #[test]
    fn test_branch_to_removed_block() {
        let (mut f, lp) = sample();
        f.remove_block(lp.exit);
        assert!(verify_function(&f).is_err());
    }

    #[test]
    fn test_phi_predecessor_mismatch() {
        let (mut f, lp) = sample();
        f.remove_phi_incoming(lp.header, lp.latch);
        let err = verify_function(&f).unwrap_err();
        assert_eq!(err.block, Some(lp.header));
    }

    #[test]
    fn test_out_of_range_handles() {
        let decode = |json: &str| serde_json::from_str::<Function>(json).unwrap();

        let f = decode(r#"{"name":"f","params":[],"blocks":[],"insts":[],"layout":[3]}"#);
        assert!(verify_function(&f).unwrap_err().message.contains("unknown block"));

        let f = decode(
            r#"{"name":"f","params":[],"blocks":[{"name":"entry","insts":[7]}],"insts":[],"layout":[0]}"#,
        );
        assert!(verify_function(&f).unwrap_err().message.contains("unknown instruction"));

        let f = decode(
            r#"{"name":"f","params":[],"blocks":[{"name":"entry","insts":[0]}],
                "insts":[{"kind":{"Br":{"target":9}},"block":0}],"layout":[0]}"#,
        );
        assert!(verify_function(&f).unwrap_err().message.contains("unknown block"));

        let f = decode(
            r#"{"name":"f","params":[],"blocks":[{"name":"entry","insts":[0],"detached":true}],
                "insts":[{"kind":{"Ret":{"value":null}},"block":0}],"layout":[0]}"#,
        );
        assert!(verify_function(&f).unwrap_err().message.contains("detached"));
    }

    #[test]
    fn test_use_not_dominated() {
        let (mut f, lp) = sample();
        // Make the exit return the latch's increment, which is not available
        // when the loop exits from the header.
        f.set_terminator(lp.exit, InstKind::Ret { value: Some(lp.iv_next) });
        let err = verify_function(&f).unwrap_err();
        assert!(err.message.contains("dominate"));
    }
}
