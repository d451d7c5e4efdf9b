//! Arena-based SSA control-flow IR.
//!
//! Blocks and instructions live in arenas owned by the [`Function`] and are
//! addressed by stable [`BlockId`]/[`InstId`] handles. Block order is a
//! separate layout list, so retiring a block never invalidates any other
//! handle. Every live block ends in exactly one terminator, and the CFG edges
//! are exactly the terminator targets.

use serde::{Serialize, Deserialize};
use std::fmt;

/// Handle to a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize { self.0 as usize }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Handle to an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstId(pub u32);

impl InstId {
    pub fn index(self) -> usize { self.0 as usize }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Scalar type of a function parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Integer scalar
    Int,
    /// Base address of an array; distinct pointer parameters never alias
    Ptr,
}

/// A function parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// An SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// Integer constant
    Const(i64),
    /// Function parameter by index
    Param(u32),
    /// Result of an instruction
    Inst(InstId),
}

impl Value {
    pub fn as_inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            Value::Const(c) => Some(*c),
            _ => None,
        }
    }
}

impl From<InstId> for Value {
    fn from(id: InstId) -> Self { Value::Inst(id) }
}

/// Integer arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
        }
    }
}

/// Signed integer comparison predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl CmpPred {
    /// The predicate with operands exchanged: `a op b` == `b op' a`.
    pub fn swapped(self) -> CmpPred {
        match self {
            CmpPred::Eq => CmpPred::Eq,
            CmpPred::Ne => CmpPred::Ne,
            CmpPred::Slt => CmpPred::Sgt,
            CmpPred::Sle => CmpPred::Sge,
            CmpPred::Sgt => CmpPred::Slt,
            CmpPred::Sge => CmpPred::Sle,
        }
    }

    /// The logical negation: `!(a op b)` == `a op' b`.
    pub fn inverse(self) -> CmpPred {
        match self {
            CmpPred::Eq => CmpPred::Ne,
            CmpPred::Ne => CmpPred::Eq,
            CmpPred::Slt => CmpPred::Sge,
            CmpPred::Sle => CmpPred::Sgt,
            CmpPred::Sgt => CmpPred::Sle,
            CmpPred::Sge => CmpPred::Slt,
        }
    }

    pub fn evaluate(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpPred::Eq => lhs == rhs,
            CmpPred::Ne => lhs != rhs,
            CmpPred::Slt => lhs < rhs,
            CmpPred::Sle => lhs <= rhs,
            CmpPred::Sgt => lhs > rhs,
            CmpPred::Sge => lhs >= rhs,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Slt => "slt",
            CmpPred::Sle => "sle",
            CmpPred::Sgt => "sgt",
            CmpPred::Sge => "sge",
        }
    }
}

/// Instruction opcode and operands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstKind {
    /// Control-flow merge: one incoming value per predecessor
    Phi { incoming: Vec<(BlockId, Value)> },
    Binary { op: BinaryOp, lhs: Value, rhs: Value },
    Cmp { pred: CmpPred, lhs: Value, rhs: Value },
    /// Address arithmetic: `base + offset`, offset in elements
    Gep { base: Value, offset: Value },
    Load { addr: Value },
    Store { addr: Value, value: Value },
    Br { target: BlockId },
    CondBr { cond: Value, then_dest: BlockId, else_dest: BlockId },
    Ret { value: Option<Value> },
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(self, InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Ret { .. })
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    /// Whether the instruction produces an SSA value.
    pub fn has_result(&self) -> bool {
        !matches!(self, InstKind::Store { .. }) && !self.is_terminator()
    }

    pub fn is_memory_access(&self) -> bool {
        matches!(self, InstKind::Load { .. } | InstKind::Store { .. })
    }

    pub fn writes_memory(&self) -> bool {
        matches!(self, InstKind::Store { .. })
    }

    /// Address operand of a load or store.
    pub fn pointer_operand(&self) -> Option<Value> {
        match self {
            InstKind::Load { addr } | InstKind::Store { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    /// Successor blocks of a terminator, in operand order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr { then_dest, else_dest, .. } => vec![*then_dest, *else_dest],
            _ => Vec::new(),
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstKind::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Gep { base, offset } => vec![*base, *offset],
            InstKind::Load { addr } => vec![*addr],
            InstKind::Store { addr, value } => vec![*addr, *value],
            InstKind::Br { .. } => Vec::new(),
            InstKind::CondBr { cond, .. } => vec![*cond],
            InstKind::Ret { value } => value.iter().copied().collect(),
        }
    }

    /// Apply `f` to every value operand in place.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            InstKind::Phi { incoming } => incoming.iter_mut().for_each(|(_, v)| f(v)),
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Gep { base, offset } => {
                f(base);
                f(offset);
            }
            InstKind::Load { addr } => f(addr),
            InstKind::Store { addr, value } => {
                f(addr);
                f(value);
            }
            InstKind::Br { .. } => {}
            InstKind::CondBr { cond, .. } => f(cond),
            InstKind::Ret { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
        }
    }

    /// Retarget every successor edge equal to `old` to `new`.
    fn replace_successor(&mut self, old: BlockId, new: BlockId) -> usize {
        let mut replaced = 0;
        let mut swap = |b: &mut BlockId| {
            if *b == old {
                *b = new;
                replaced += 1;
            }
        };
        match self {
            InstKind::Br { target } => swap(target),
            InstKind::CondBr { then_dest, else_dest, .. } => {
                swap(then_dest);
                swap(else_dest);
            }
            _ => {}
        }
        replaced
    }
}

/// An instruction together with the block that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inst {
    pub kind: InstKind,
    pub block: BlockId,
    #[serde(default)]
    pub name: Option<String>,
}

/// A basic block: an ordered instruction list ending in a terminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
    #[serde(default)]
    detached: bool,
}

impl Block {
    pub fn len(&self) -> usize { self.insts.len() }
    pub fn is_empty(&self) -> bool { self.insts.is_empty() }
}

/// A function body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    blocks: Vec<Block>,
    insts: Vec<Inst>,
    layout: Vec<BlockId>,
}

impl Function {
    pub fn new(name: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            name: name.into(),
            params,
            blocks: Vec::new(),
            insts: Vec::new(),
            layout: Vec::new(),
        }
    }

    /// Append a new empty block at the end of the layout.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block { name: name.into(), insts: Vec::new(), detached: false });
        self.layout.push(id);
        id
    }

    /// Append an instruction to the end of `block`.
    pub fn append_inst(&mut self, block: BlockId, kind: InstKind, name: Option<String>) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Inst { kind, block, name });
        self.blocks[block.index()].insts.push(id);
        id
    }

    /// Insert an instruction right before the terminator of `block`, or at
    /// the end if the block has none yet.
    pub fn insert_before_terminator(&mut self, block: BlockId, kind: InstKind, name: Option<String>) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Inst { kind, block, name });
        let pos = match self.terminator(block) {
            Some(_) => self.blocks[block.index()].insts.len() - 1,
            None => self.blocks[block.index()].insts.len(),
        };
        self.blocks[block.index()].insts.insert(pos, id);
        id
    }

    /// The entry block (first block in the layout).
    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    /// Live blocks in layout order.
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn num_blocks(&self) -> usize {
        self.layout.len()
    }

    /// Size of the block arena, including retired blocks. Analyses index
    /// per-block tables by `BlockId::index()` up to this bound.
    pub fn block_capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn inst_capacity(&self) -> usize {
        self.insts.len()
    }

    pub fn contains_block(&self, block: BlockId) -> bool {
        self.blocks.get(block.index()).map_or(false, |b| !b.detached)
    }

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block.index()]
    }

    pub fn block_name(&self, block: BlockId) -> &str {
        &self.blocks[block.index()].name
    }

    /// Find a live block by name.
    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.layout.iter().copied().find(|b| self.block_name(*b) == name)
    }

    pub fn inst(&self, inst: InstId) -> &Inst {
        &self.insts[inst.index()]
    }

    pub fn inst_mut(&mut self, inst: InstId) -> &mut Inst {
        &mut self.insts[inst.index()]
    }

    /// Instructions of all live blocks, in layout order.
    pub fn live_insts(&self) -> impl Iterator<Item = InstId> + '_ {
        self.layout.iter().flat_map(move |b| self.blocks[b.index()].insts.iter().copied())
    }

    /// The block's terminator, if its last instruction is one.
    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        let last = *self.blocks[block.index()].insts.last()?;
        self.insts[last.index()].kind.is_terminator().then_some(last)
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .map(|t| self.insts[t.index()].kind.successors())
            .unwrap_or_default()
    }

    /// Live blocks with an edge into `block`, in layout order, without duplicates.
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.layout
            .iter()
            .copied()
            .filter(|b| self.successors(*b).contains(&block))
            .collect()
    }

    /// Leading phi instructions of a block.
    pub fn phis(&self, block: BlockId) -> Vec<InstId> {
        self.blocks[block.index()]
            .insts
            .iter()
            .copied()
            .take_while(|i| self.insts[i.index()].kind.is_phi())
            .collect()
    }

    /// Live instructions that use `value` as an operand.
    pub fn users(&self, value: Value) -> Vec<InstId> {
        self.live_insts()
            .filter(|i| self.insts[i.index()].kind.operands().contains(&value))
            .collect()
    }

    /// Replace the kind of `block`'s terminator, keeping its handle.
    pub fn set_terminator(&mut self, block: BlockId, kind: InstKind) -> Option<InstId> {
        debug_assert!(kind.is_terminator());
        let term = self.terminator(block)?;
        self.insts[term.index()].kind = kind;
        Some(term)
    }

    /// Retarget `block`'s edges to `old` so they go to `new`. Returns the
    /// number of edges rewritten.
    pub fn replace_successor(&mut self, block: BlockId, old: BlockId, new: BlockId) -> usize {
        match self.terminator(block) {
            Some(term) => self.insts[term.index()].kind.replace_successor(old, new),
            None => 0,
        }
    }

    /// Rewrite every operand use of `old` in live blocks to `new`.
    pub fn replace_all_uses(&mut self, old: Value, new: Value) -> usize {
        let mut replaced = 0;
        for block in self.layout.clone() {
            for inst in self.blocks[block.index()].insts.clone() {
                self.insts[inst.index()].kind.for_each_operand_mut(|v| {
                    if *v == old {
                        *v = new;
                        replaced += 1;
                    }
                });
            }
        }
        replaced
    }

    /// Rename the incoming block `old_pred` to `new_pred` in every phi of `block`.
    pub fn replace_phi_incoming_block(&mut self, block: BlockId, old_pred: BlockId, new_pred: BlockId) {
        for phi in self.phis(block) {
            if let InstKind::Phi { incoming } = &mut self.insts[phi.index()].kind {
                for (pred, _) in incoming.iter_mut() {
                    if *pred == old_pred {
                        *pred = new_pred;
                    }
                }
            }
        }
    }

    /// Drop phi entries of `block` whose incoming block is `pred`.
    pub fn remove_phi_incoming(&mut self, block: BlockId, pred: BlockId) {
        for phi in self.phis(block) {
            if let InstKind::Phi { incoming } = &mut self.insts[phi.index()].kind {
                incoming.retain(|(b, _)| *b != pred);
            }
        }
    }

    /// Retire a block: it leaves the layout and its instructions stop being
    /// live. The handle is never reused.
    pub fn remove_block(&mut self, block: BlockId) {
        self.layout.retain(|b| *b != block);
        self.blocks[block.index()].detached = true;
    }

    /// Move `blocks` (in the given order) so that they sit immediately
    /// before `anchor` in the layout.
    pub fn move_blocks_before(&mut self, blocks: &[BlockId], anchor: BlockId) {
        self.layout.retain(|b| !blocks.contains(b));
        let pos = self.layout.iter().position(|b| *b == anchor).unwrap_or(self.layout.len());
        for (offset, b) in blocks.iter().enumerate() {
            self.layout.insert(pos + offset, *b);
        }
    }

    /// Human-readable name of a value, as used by the printer.
    pub fn value_name(&self, value: Value) -> String {
        match value {
            Value::Const(c) => c.to_string(),
            Value::Param(idx) => match self.params.get(idx as usize) {
                Some(p) => format!("%{}", p.name),
                None => format!("%arg{}", idx),
            },
            Value::Inst(id) => match &self.insts[id.index()].name {
                Some(name) => format!("%{}", name),
                None => format!("%v{}", id.0),
            },
        }
    }

    pub fn param_type(&self, idx: u32) -> Option<Type> {
        self.params.get(idx as usize).map(|p| p.ty)
    }
}

/// A collection of functions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
}
