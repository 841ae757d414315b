use crate::context::{Node, VarNode};
use ordered_float::OrderedFloat;

/// A one-argument math operation
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum UnaryOpcode {
    Neg,
    Abs,
    Sqrt,
    Square,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
}

/// A two-argument math operation
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Div,
    Atan2,
    Pow,
    NthRoot,
    Min,
    Max,
    Mod,
}

impl BinaryOpcode {
    /// Checks whether this operation selects between its operands
    ///
    /// Selecting operations participate in specialization: when one operand
    /// provably wins, the other can be disabled from the tape.
    pub fn is_choice(&self) -> bool {
        matches!(self, BinaryOpcode::Min | BinaryOpcode::Max)
    }
}

/// Represents an operation in a math expression.
///
/// `Op`s should be constructed by calling functions on
/// [`Context`](crate::context::Context), e.g.
/// [`Context::add`](crate::context::Context::add) will generate an
/// `Op::Binary(BinaryOpcode::Add, .., ..)` node and return an opaque handle.
///
/// Each `Op` is tightly coupled to the [`Context`](crate::context::Context)
/// which generated it, and will not be valid for a different `Context`.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Op {
    /// A spatial coordinate (X, Y, or Z)
    Input(VarNode),
    /// A free variable, bound at evaluation time
    Var(VarNode),
    Const(OrderedFloat<f64>),
    Binary(BinaryOpcode, Node, Node),
    Unary(UnaryOpcode, Node),
}

impl Op {
    /// Iterates over children, producing 0, 1, or 2 values
    pub fn iter_children(&self) -> impl Iterator<Item = Node> {
        let out = match self {
            Op::Binary(_, a, b) => [Some(*a), Some(*b)],
            Op::Unary(_, a) => [Some(*a), None],
            Op::Var(..) | Op::Input(..) | Op::Const(..) => [None, None],
        };
        out.into_iter().flatten()
    }
}
