//! Convenience builder for constructing functions.
//!
//! ```text
//! let mut b = FunctionBuilder::new("scale");
//! let a = b.param("A", Type::Ptr);
//! let lp = b.counted_loop("i", Value::Const(0), Value::Const(100), 1, |b, i| {
//!     let p = b.gep(a, i);
//!     b.store(p, Value::Const(0));
//! });
//! b.ret(None);
//! let func = b.finish();
//! ```

use super::function::{BinaryOp, BlockId, CmpPred, Function, InstId, InstKind, Param, Type, Value};

/// Blocks and values of a loop produced by [`FunctionBuilder::counted_loop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountedLoop {
    /// Block that was current when the loop was started
    pub preheader: BlockId,
    pub header: BlockId,
    /// First body block
    pub body: BlockId,
    /// Last body block, the latch's only predecessor
    pub body_tail: BlockId,
    pub latch: BlockId,
    /// Empty block the loop exits to; current when the call returns
    pub exit: BlockId,
    /// The induction variable phi
    pub iv: Value,
    /// The increment feeding the phi from the latch
    pub iv_next: Value,
}

/// Incrementally builds a [`Function`], appending to a current block.
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
}

impl FunctionBuilder {
    /// Start a function with an empty `entry` block.
    pub fn new(name: &str) -> Self {
        let mut func = Function::new(name, Vec::new());
        let entry = func.add_block("entry");
        Self { func, current: entry }
    }

    pub fn param(&mut self, name: &str, ty: Type) -> Value {
        self.func.params.push(Param { name: name.to_string(), ty });
        Value::Param(self.func.params.len() as u32 - 1)
    }

    pub fn create_block(&mut self, name: &str) -> BlockId {
        self.func.add_block(name)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Read access to the function under construction.
    pub fn func(&self) -> &Function {
        &self.func
    }

    fn emit(&mut self, kind: InstKind) -> InstId {
        self.func.append_inst(self.current, kind, None)
    }

    /// Give the instruction behind `value` a printable name.
    pub fn name(&mut self, value: Value, name: &str) -> Value {
        if let Value::Inst(id) = value {
            self.func.inst_mut(id).name = Some(name.to_string());
        }
        value
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        self.emit(InstKind::Binary { op, lhs, rhs }).into()
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn cmp(&mut self, pred: CmpPred, lhs: Value, rhs: Value) -> Value {
        self.emit(InstKind::Cmp { pred, lhs, rhs }).into()
    }

    pub fn gep(&mut self, base: Value, offset: Value) -> Value {
        self.emit(InstKind::Gep { base, offset }).into()
    }

    pub fn load(&mut self, addr: Value) -> Value {
        self.emit(InstKind::Load { addr }).into()
    }

    pub fn store(&mut self, addr: Value, value: Value) -> InstId {
        self.emit(InstKind::Store { addr, value })
    }

    pub fn phi(&mut self, incoming: Vec<(BlockId, Value)>) -> Value {
        self.emit(InstKind::Phi { incoming }).into()
    }

    pub fn add_phi_incoming(&mut self, phi: Value, block: BlockId, value: Value) {
        if let Value::Inst(id) = phi {
            if let InstKind::Phi { incoming } = &mut self.func.inst_mut(id).kind {
                incoming.push((block, value));
            }
        }
    }

    pub fn br(&mut self, target: BlockId) -> InstId {
        self.emit(InstKind::Br { target })
    }

    pub fn cond_br(&mut self, cond: Value, then_dest: BlockId, else_dest: BlockId) -> InstId {
        self.emit(InstKind::CondBr { cond, then_dest, else_dest })
    }

    pub fn ret(&mut self, value: Option<Value>) -> InstId {
        self.emit(InstKind::Ret { value })
    }

    /// Emit a header-tested loop `for iv = start; iv < bound; iv += step`
    /// (`>` for negative steps) in simplified form.
    ///
    /// The current block becomes the preheader and is terminated with a
    /// branch to the header; an empty current block therefore turns the exit
    /// of a previous loop into this loop's preheader. `body` is called with
    /// the builder positioned in the first body block and the induction
    /// variable; it may create further blocks, and whatever block is current
    /// when it returns becomes the body tail. On return the builder is
    /// positioned in the (empty) exit block.
    pub fn counted_loop<F>(&mut self, name: &str, start: Value, bound: Value, step: i64, body: F) -> CountedLoop
    where
        F: FnOnce(&mut Self, Value),
    {
        let preheader = self.current;
        let header = self.create_block(&format!("{}.header", name));
        let body_head = self.create_block(&format!("{}.body", name));
        self.br(header);

        self.switch_to(header);
        let iv = self.phi(vec![(preheader, start)]);
        self.name(iv, name);
        let pred = if step < 0 { CmpPred::Sgt } else { CmpPred::Slt };
        let cond = self.cmp(pred, iv, bound);

        self.switch_to(body_head);
        body(self, iv);
        let body_tail = self.current;

        let latch = self.create_block(&format!("{}.latch", name));
        let exit = self.create_block(&format!("{}.exit", name));
        self.br(latch);

        self.switch_to(latch);
        let iv_next = self.add(iv, Value::Const(step));
        self.name(iv_next, &format!("{}.next", name));
        self.br(header);
        self.add_phi_incoming(iv, latch, iv_next);

        self.switch_to(header);
        self.cond_br(cond, body_head, exit);

        self.switch_to(exit);
        CountedLoop { preheader, header, body: body_head, body_tail, latch, exit, iv, iv_next }
    }

    pub fn finish(self) -> Function {
        self.func
    }
}
