use std::borrow::Cow;

/// Reduction applied by an atomic scatter.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum ReduceOp {
    #[default]
    None,
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
}

/// Operation recorded by a symbolic variable.
///
/// A materialized leaf carries `Data`; everything else is lowered by the
/// backend emitters through a match over this tag. `Custom` carries a raw
/// instruction template in the backend's language and is expanded through
/// the `$`-escape formatter (see `codegen::template`).
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub enum Op {
    /// Materialized buffer or direct pointer, no computation.
    #[default]
    Data,
    /// Broadcast constant; the value lives in the variable's literal payload.
    Literal,
    /// Lane index `0..size`.
    Counter,
    /// Lane-in-range mask (`Counter < size`), the implicit mask of the
    /// vectorized CPU loop tail.
    DefaultMask,

    Neg,
    Not,
    Sqrt,
    Abs,
    Ceil,
    Floor,
    Round,
    Trunc,
    Popc,
    Clz,
    Ctz,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Mulhi,
    Min,
    Max,
    Fma,

    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,

    And,
    Or,
    Xor,
    Shl,
    Shr,

    Cast,
    Bitcast,
    Select,

    /// deps: `[source pointer, index, mask]`
    Gather,
    /// deps: `[target pointer, value, index, mask]`
    Scatter(ReduceOp),
    /// Atomic fetch-and-increment; deps: `[target pointer, index, mask]`.
    ScatterInc,

    /// Symbolic loop markers (CPU backend). The loop-start variable owns the
    /// shared loop record; phis carry their state-slot index in the literal
    /// payload.
    LoopStart,
    LoopCond,
    LoopPhi,
    LoopEnd,
    LoopOutput,

    /// Indirect call dispatch (CPU backend); deps: `[self, mask]`, the call
    /// record lives beside the variable. Outputs are `CallOutput` nodes.
    Call,
    CallOutput,

    /// Raw single-statement template in the backend's instruction language.
    Custom(Cow<'static, str>),
}

impl Op {
    /// Operations whose result is written by a memory side effect rather
    /// than a register.
    pub fn is_side_effect(&self) -> bool {
        matches!(self, Op::Scatter(_) | Op::ScatterInc)
    }

    /// `true` for kinds the 16-bit float path can lower natively on the CPU
    /// backend; everything else is upcast to `float` around the operation.
    pub fn fp16_supported_llvm(&self) -> bool {
        matches!(
            self,
            Op::Data
                | Op::Literal
                | Op::Neg
                | Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Cast
                | Op::Bitcast
                | Op::Select
                | Op::Eq
                | Op::Neq
                | Op::Lt
                | Op::Le
                | Op::Gt
                | Op::Ge
                | Op::Gather
                | Op::Scatter(_)
        )
    }
}
