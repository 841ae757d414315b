//! Compilation from a [`Context`] graph into a flat clause tape
use crate::{
    context::{BinaryOpcode, Context, Node, Op, UnaryOpcode, Var},
    Error,
};

use std::collections::{BTreeMap, HashMap};

/// Index of a clause in the tape, assigned densely in topological order
///
/// For any clause, its operand ids are strictly smaller than its own id; the
/// final clause is the program root.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClauseId(pub(crate) u32);

impl ClauseId {
    /// Converts from an id to a plain index
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ClauseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Operation performed by a single clause
///
/// This is the flattened vocabulary of [`Op`](crate::context::Op): leaf
/// clauses carry their payload in the tape's constant array, and the spatial
/// coordinates get dedicated opcodes so that evaluation can read them straight
/// out of the batch buffers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ClauseOp {
    /// Constant; payload lives in the tape's constant array
    Const,
    /// Free variable; payload slot is rewritten by `set_var`
    Var,
    X,
    Y,
    Z,

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

impl ClauseOp {
    /// Number of operands used by this operation
    pub fn arity(&self) -> usize {
        match self {
            ClauseOp::Const
            | ClauseOp::Var
            | ClauseOp::X
            | ClauseOp::Y
            | ClauseOp::Z => 0,
            ClauseOp::Neg
            | ClauseOp::Abs
            | ClauseOp::Sqrt
            | ClauseOp::Square
            | ClauseOp::Sin
            | ClauseOp::Cos
            | ClauseOp::Tan
            | ClauseOp::Asin
            | ClauseOp::Acos
            | ClauseOp::Atan
            | ClauseOp::Exp => 1,
            ClauseOp::Add
            | ClauseOp::Sub
            | ClauseOp::Mul
            | ClauseOp::Div
            | ClauseOp::Atan2
            | ClauseOp::Pow
            | ClauseOp::NthRoot
            | ClauseOp::Min
            | ClauseOp::Max
            | ClauseOp::Mod => 2,
        }
    }

    /// Checks whether this operation selects between its operands
    pub fn is_choice(&self) -> bool {
        matches!(self, ClauseOp::Min | ClauseOp::Max)
    }
}

impl From<UnaryOpcode> for ClauseOp {
    fn from(op: UnaryOpcode) -> Self {
        match op {
            UnaryOpcode::Neg => ClauseOp::Neg,
            UnaryOpcode::Abs => ClauseOp::Abs,
            UnaryOpcode::Sqrt => ClauseOp::Sqrt,
            UnaryOpcode::Square => ClauseOp::Square,
            UnaryOpcode::Sin => ClauseOp::Sin,
            UnaryOpcode::Cos => ClauseOp::Cos,
            UnaryOpcode::Tan => ClauseOp::Tan,
            UnaryOpcode::Asin => ClauseOp::Asin,
            UnaryOpcode::Acos => ClauseOp::Acos,
            UnaryOpcode::Atan => ClauseOp::Atan,
            UnaryOpcode::Exp => ClauseOp::Exp,
        }
    }
}

impl From<BinaryOpcode> for ClauseOp {
    fn from(op: BinaryOpcode) -> Self {
        match op {
            BinaryOpcode::Add => ClauseOp::Add,
            BinaryOpcode::Sub => ClauseOp::Sub,
            BinaryOpcode::Mul => ClauseOp::Mul,
            BinaryOpcode::Div => ClauseOp::Div,
            BinaryOpcode::Atan2 => ClauseOp::Atan2,
            BinaryOpcode::Pow => ClauseOp::Pow,
            BinaryOpcode::NthRoot => ClauseOp::NthRoot,
            BinaryOpcode::Min => ClauseOp::Min,
            BinaryOpcode::Max => ClauseOp::Max,
            BinaryOpcode::Mod => ClauseOp::Mod,
        }
    }
}

/// A single immutable operation record in the compiled tape
///
/// Operand ids are only meaningful up to the opcode's arity; unused operands
/// are left at the default id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Clause {
    pub op: ClauseOp,
    pub a: ClauseId,
    pub b: ClauseId,
}

/// A compiled program: clauses in topological order plus leaf payloads
///
/// The tape itself is immutable after construction and can be shared between
/// evaluators; mutable state (variable bindings, specialization masks, batch
/// buffers) lives in the [`Evaluator`](crate::eval::Evaluator).
#[derive(Debug)]
pub struct Tape {
    pub(crate) clauses: Vec<Clause>,
    /// Per-clause payload: constant values, and initial variable bindings
    pub(crate) constants: Vec<f64>,
    pub(crate) root: ClauseId,
    /// Free-variable id to the clause mirroring its binding
    pub(crate) var_clauses: BTreeMap<usize, ClauseId>,
    /// Clauses holding the spatial coordinates, if used by the program
    pub(crate) xyz: [Option<ClauseId>; 3],
}

impl Tape {
    /// Lowers the given root node into a clause tape
    ///
    /// Reachable nodes are assigned dense ids in topological order; pure
    /// subexpressions are deduplicated and clauses with all-constant operands
    /// are folded at compile time.  Variable bindings come from `vars`;
    /// unbound variables are left as NaN until
    /// [`set_var`](crate::eval::Evaluator::set_var) is called.
    pub fn new(
        ctx: &Context,
        node: Node,
        vars: &BTreeMap<usize, f64>,
    ) -> Result<Self, Error> {
        let mut builder = TapeBuilder {
            ctx,
            vars,
            out: Tape {
                clauses: vec![],
                constants: vec![],
                root: ClauseId(0),
                var_clauses: BTreeMap::new(),
                xyz: [None; 3],
            },
            seen: HashMap::new(),
            dedup: HashMap::new(),
        };
        let root = builder.lower(node)?;
        let mut out = builder.out;
        out.root = root;
        log::debug!(
            "compiled tape with {} clauses ({} vars)",
            out.clauses.len(),
            out.var_clauses.len(),
        );
        Ok(out)
    }

    /// Returns the number of clauses in the tape
    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    /// Checks whether the tape is empty
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Returns the id of the root (final) clause
    pub fn root(&self) -> ClauseId {
        self.root
    }
}

struct TapeBuilder<'a> {
    ctx: &'a Context,
    vars: &'a BTreeMap<usize, f64>,
    out: Tape,
    /// Node-level memoization, so shared subgraphs lower once
    seen: HashMap<Node, ClauseId>,
    /// Structural deduplication of emitted clauses
    dedup: HashMap<(ClauseOp, u32, u32, u64), ClauseId>,
}

impl TapeBuilder<'_> {
    fn lower(&mut self, node: Node) -> Result<ClauseId, Error> {
        if let Some(&id) = self.seen.get(&node) {
            return Ok(id);
        }

        // The graph can be deep, so recursion is replaced with an explicit
        // stack: `Down` visits a node's children, `Up` emits its clause.
        enum Action {
            Down(Node),
            Up(Node),
        }
        let mut todo = vec![Action::Down(node)];
        while let Some(action) = todo.pop() {
            match action {
                Action::Down(n) => {
                    if self.seen.contains_key(&n) {
                        continue;
                    }
                    let op = *self.ctx.get_op(n).ok_or(Error::BadNode)?;
                    todo.push(Action::Up(n));
                    for c in op.iter_children() {
                        todo.push(Action::Down(c));
                    }
                }
                Action::Up(n) => {
                    if self.seen.contains_key(&n) {
                        continue;
                    }
                    let id = self.emit(n)?;
                    self.seen.insert(n, id);
                }
            }
        }
        Ok(self.seen[&node])
    }

    fn emit(&mut self, n: Node) -> Result<ClauseId, Error> {
        let op = *self.ctx.get_op(n).ok_or(Error::BadNode)?;
        match op {
            Op::Const(c) => Ok(self.constant(c.0)),
            Op::Input(v) => {
                let axis = match self.ctx.get_var_by_index(v)? {
                    Var::X => 0,
                    Var::Y => 1,
                    Var::Z => 2,
                    Var::Free(..) => return Err(Error::BadVar),
                };
                if let Some(id) = self.out.xyz[axis] {
                    return Ok(id);
                }
                let op = [ClauseOp::X, ClauseOp::Y, ClauseOp::Z][axis];
                let id = self.push_clause(op, ClauseId(0), ClauseId(0), 0.0);
                self.out.xyz[axis] = Some(id);
                Ok(id)
            }
            Op::Var(v) => {
                let Var::Free(i) = self.ctx.get_var_by_index(v)? else {
                    return Err(Error::BadVar);
                };
                let i = *i;
                if let Some(&id) = self.out.var_clauses.get(&i) {
                    return Ok(id);
                }
                let binding = self.vars.get(&i).copied().unwrap_or(f64::NAN);
                let id =
                    self.push_clause(ClauseOp::Var, ClauseId(0), ClauseId(0), binding);
                self.out.var_clauses.insert(i, id);
                Ok(id)
            }
            Op::Unary(op, a) => {
                let a = self.seen[&a];
                let op = ClauseOp::from(op);
                // Constant folding: a constant operand folds the clause away
                if self.out.clauses[a.index()].op == ClauseOp::Const {
                    let v = fold_unary(op, self.out.constants[a.index()]);
                    return Ok(self.constant(v));
                }
                Ok(self.dedup_clause(op, a, ClauseId(0)))
            }
            Op::Binary(op, a, b) => {
                let a = self.seen[&a];
                let b = self.seen[&b];
                let op = ClauseOp::from(op);
                let const_of = |id: ClauseId| {
                    (self.out.clauses[id.index()].op == ClauseOp::Const)
                        .then(|| self.out.constants[id.index()])
                };
                if let (Some(va), Some(vb)) = (const_of(a), const_of(b)) {
                    let v = fold_binary(op, va, vb);
                    return Ok(self.constant(v));
                }
                Ok(self.dedup_clause(op, a, b))
            }
        }
    }

    fn constant(&mut self, v: f64) -> ClauseId {
        let key = (ClauseOp::Const, 0, 0, v.to_bits());
        if let Some(&id) = self.dedup.get(&key) {
            return id;
        }
        let id = self.push_clause(ClauseOp::Const, ClauseId(0), ClauseId(0), v);
        self.dedup.insert(key, id);
        id
    }

    fn dedup_clause(
        &mut self,
        op: ClauseOp,
        a: ClauseId,
        b: ClauseId,
    ) -> ClauseId {
        let key = (op, a.0, b.0, 0);
        if let Some(&id) = self.dedup.get(&key) {
            return id;
        }
        let id = self.push_clause(op, a, b, 0.0);
        self.dedup.insert(key, id);
        id
    }

    fn push_clause(
        &mut self,
        op: ClauseOp,
        a: ClauseId,
        b: ClauseId,
        constant: f64,
    ) -> ClauseId {
        let id = ClauseId(self.out.clauses.len() as u32);
        self.out.clauses.push(Clause { op, a, b });
        self.out.constants.push(constant);
        id
    }
}

fn fold_unary(op: ClauseOp, a: f64) -> f64 {
    match op {
        ClauseOp::Neg => -a,
        ClauseOp::Abs => a.abs(),
        ClauseOp::Sqrt => a.sqrt(),
        ClauseOp::Square => a * a,
        ClauseOp::Sin => a.sin(),
        ClauseOp::Cos => a.cos(),
        ClauseOp::Tan => a.tan(),
        ClauseOp::Asin => a.asin(),
        ClauseOp::Acos => a.acos(),
        ClauseOp::Atan => a.atan(),
        ClauseOp::Exp => a.exp(),
        _ => unreachable!("not a unary opcode: {op:?}"),
    }
}

fn fold_binary(op: ClauseOp, a: f64, b: f64) -> f64 {
    match op {
        ClauseOp::Add => a + b,
        ClauseOp::Sub => a - b,
        ClauseOp::Mul => a * b,
        ClauseOp::Div => a / b,
        ClauseOp::Atan2 => a.atan2(b),
        ClauseOp::Pow => a.powf(b),
        ClauseOp::NthRoot => crate::context::nth_root(a, b),
        ClauseOp::Min => a.min(b),
        ClauseOp::Max => a.max(b),
        ClauseOp::Mod => a.rem_euclid(b),
        _ => unreachable!("not a binary opcode: {op:?}"),
    }
}
