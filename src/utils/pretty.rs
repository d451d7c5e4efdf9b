//! Pretty printing for the IR.
//!
//! Functions print in an LLVM-like text form:
//! ```text
//! func @f(%A: ptr, %n: int) {
//! entry:
//!   br %i.header
//! i.header:
//!   %i = phi [0, %entry], [%i.next, %i.latch]
//!   ...
//! }
//! ```

use crate::ir::{Function, InstId, InstKind, Module, Type};
use pretty::{Arena, DocAllocator, DocBuilder};

/// Default line width for pretty printing.
pub const DEFAULT_WIDTH: usize = 100;

const INDENT: isize = 2;

/// A pretty-printable value.
pub trait PrettyPrint {
    /// Convert to a pretty document.
    fn to_doc<'a>(&self, arena: &'a Arena<'a>) -> DocBuilder<'a, Arena<'a>>;

    /// Pretty print to a string with the given width.
    fn pretty_print(&self, width: usize) -> String {
        let arena = Arena::new();
        let mut output = String::new();
        let _ = self.to_doc(&arena).render_fmt(width, &mut output);
        output
    }

    /// Pretty print with default width.
    fn pretty(&self) -> String {
        self.pretty_print(DEFAULT_WIDTH)
    }
}

impl PrettyPrint for Function {
    fn to_doc<'a>(&self, arena: &'a Arena<'a>) -> DocBuilder<'a, Arena<'a>> {
        let params = arena.intersperse(
            self.params.iter().map(|p| {
                let ty = match p.ty {
                    Type::Int => "int",
                    Type::Ptr => "ptr",
                };
                arena.text(format!("%{}: {}", p.name, ty))
            }),
            arena.text(",").append(arena.line()),
        );
        let signature = arena
            .text(format!("func @{}(", self.name))
            .append(params.nest(INDENT).group())
            .append(arena.text(") {"));

        let blocks = self.layout().iter().map(|&block| {
            let insts = self.block(block).insts.iter().map(|&inst| arena.hardline().append(inst_doc(arena, self, inst)));
            arena
                .text(format!("{}:", self.block_name(block)))
                .append(arena.concat(insts).nest(INDENT))
        });

        signature
            .append(arena.hardline())
            .append(arena.intersperse(blocks, arena.hardline()))
            .append(arena.hardline())
            .append(arena.text("}"))
    }
}

impl PrettyPrint for Module {
    fn to_doc<'a>(&self, arena: &'a Arena<'a>) -> DocBuilder<'a, Arena<'a>> {
        let header = arena.text(format!("; module {}", self.name));
        let funcs = self.functions.iter().map(|f| f.to_doc(arena));
        header
            .append(arena.hardline())
            .append(arena.intersperse(funcs, arena.hardline().append(arena.hardline())))
            .append(arena.hardline())
    }
}

fn inst_doc<'a>(arena: &'a Arena<'a>, func: &Function, inst: InstId) -> DocBuilder<'a, Arena<'a>> {
    let v = |value| func.value_name(value);
    let b = |block| format!("%{}", func.block_name(block));
    let text = match &func.inst(inst).kind {
        InstKind::Phi { incoming } => {
            let arms: Vec<String> = incoming.iter().map(|(block, value)| format!("[{}, {}]", v(*value), b(*block))).collect();
            format!("phi {}", arms.join(", "))
        }
        InstKind::Binary { op, lhs, rhs } => format!("{} {}, {}", op.mnemonic(), v(*lhs), v(*rhs)),
        InstKind::Cmp { pred, lhs, rhs } => format!("cmp {} {}, {}", pred.mnemonic(), v(*lhs), v(*rhs)),
        InstKind::Gep { base, offset } => format!("gep {}, {}", v(*base), v(*offset)),
        InstKind::Load { addr } => format!("load {}", v(*addr)),
        InstKind::Store { addr, value } => format!("store {}, {}", v(*value), v(*addr)),
        InstKind::Br { target } => format!("br {}", b(*target)),
        InstKind::CondBr { cond, then_dest, else_dest } => {
            format!("condbr {}, {}, {}", v(*cond), b(*then_dest), b(*else_dest))
        }
        InstKind::Ret { value: Some(value) } => format!("ret {}", v(*value)),
        InstKind::Ret { value: None } => "ret".to_string(),
    };
    if func.inst(inst).kind.has_result() {
        arena.text(format!("{} = {}", v(inst.into()), text))
    } else {
        arena.text(text)
    }
}
