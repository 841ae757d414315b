//! Multi-mode evaluation of compiled clause tapes
//!
//! The [`Evaluator`] owns a compiled [`Tape`] and executes it in four modes
//! over the same program:
//!
//! - single scalar values ([`Evaluator::eval`])
//! - packed batches of values and spatial derivatives ([`Evaluator::values`],
//!   [`Evaluator::derivs`])
//! - interval bounds over an axis-aligned box ([`Evaluator::eval_interval`])
//! - gradients with respect to free variables ([`Evaluator::gradient`])
//!
//! In addition, it supports *push/pop specialization*: after an interval
//! evaluation (or given a point or a [`Feature`]), branches of `min` / `max`
//! clauses which are provably inactive can be disabled with
//! [`Evaluator::push`], then restored with [`Evaluator::pop`].  The octree
//! renderer leans on this to shrink the program as it recurses.
mod feature;
pub mod tape;

pub use feature::{Feature, FeatureChoice};
pub use tape::{Clause, ClauseId, ClauseOp, Tape};

use crate::{
    context::{Context, Node},
    types::{Grad, Interval},
    Error,
};

use nalgebra::Vector3;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// Number of slots in the packed evaluation buffers
pub const BATCH_SIZE: usize = 256;

/// A single choice made at a `min` or `max` clause
///
/// During interval evaluation, `Left` / `Right` record that one operand
/// strictly dominates over the evaluated region; under specialization, they
/// mean that the clause forwards that operand directly.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum Choice {
    /// This choice has not yet been assigned
    Unknown = 0,

    /// The operation always picks the left-hand input
    Left = 1,

    /// The operation always picks the right-hand input
    Right = 2,

    /// The operation may pick either input
    Both = 3,
}

/// One specialization level: which clauses are live, and how `min` / `max`
/// clauses forward their operands
#[derive(Clone, Debug)]
struct Frame {
    enabled: Vec<bool>,
    choices: Vec<Choice>,
}

/// Value and derivative rows for a contiguous range of clauses
type GradRows<'a> =
    (&'a mut [f64], &'a mut [f64], &'a mut [f64], &'a mut [f64]);

fn load_grad(bufs: &GradRows, r: usize) -> Grad {
    Grad::new(bufs.0[r], bufs.1[r], bufs.2[r], bufs.3[r])
}

fn store_grad(bufs: &mut GradRows, s: usize, g: Grad) {
    bufs.0[s] = g.value();
    let [dx, dy, dz] = g.d();
    bufs.1[s] = dx;
    bufs.2[s] = dy;
    bufs.3[s] = dz;
}

/// Batch evaluation results, borrowed from the evaluator's buffers
///
/// Each slice has one entry per staged slot; `dx`, `dy`, `dz` are only
/// populated by [`Evaluator::derivs`].
pub struct Derivs<'a> {
    pub v: &'a [f64],
    pub dx: &'a [f64],
    pub dy: &'a [f64],
    pub dz: &'a [f64],
}

/// Evaluation engine for a compiled clause tape
///
/// An `Evaluator` holds mutable per-clause scratch buffers and a stack of
/// specialization frames; it is not meant to be shared across threads.
/// Cloning an evaluator shares the immutable tape (behind an [`Arc`]) while
/// giving the clone independent buffers, variable bindings, and stack, which
/// is the supported way to parallelize rendering.
#[derive(Clone)]
pub struct Evaluator {
    tape: Arc<Tape>,

    /// Per-clause payload; slots for free variables are updated by `set_var`
    constants: Vec<f64>,

    /// Specialization stack; the first frame is the full program
    frames: Vec<Frame>,

    /// Batch buffers, clause-major (`clause * BATCH_SIZE + slot`)
    values: Vec<f64>,
    dx: Vec<f64>,
    dy: Vec<f64>,
    dz: Vec<f64>,

    /// Per-slot ambiguity flags from the latest `values` / `derivs` call
    ambig: Vec<bool>,

    /// Per-clause results of the latest interval evaluation
    intervals: Vec<Interval>,

    /// Per-clause dominance decisions from the latest interval evaluation
    i_choices: Vec<Choice>,

    /// Per-clause gradient rows over free variables, clause-major
    var_grads: Vec<f64>,
}

impl Evaluator {
    /// Builds an evaluator for the given root node, with no variable bindings
    pub fn new(ctx: &Context, root: Node) -> Result<Self, Error> {
        Self::new_with_vars(ctx, root, &BTreeMap::new())
    }

    /// Builds an evaluator with initial free-variable bindings
    ///
    /// Unbound variables evaluate as NaN until
    /// [`set_var`](Evaluator::set_var) is called.
    pub fn new_with_vars(
        ctx: &Context,
        root: Node,
        vars: &BTreeMap<usize, f64>,
    ) -> Result<Self, Error> {
        let tape = Arc::new(Tape::new(ctx, root, vars)?);
        let n = tape.len();
        let nv = tape.var_clauses.len();
        Ok(Self {
            constants: tape.constants.clone(),
            frames: vec![Frame {
                enabled: vec![true; n],
                choices: vec![Choice::Both; n],
            }],
            values: vec![0.0; n * BATCH_SIZE],
            dx: vec![0.0; n * BATCH_SIZE],
            dy: vec![0.0; n * BATCH_SIZE],
            dz: vec![0.0; n * BATCH_SIZE],
            ambig: vec![false; BATCH_SIZE],
            intervals: vec![Interval::EVERYTHING; n],
            i_choices: vec![Choice::Unknown; n],
            var_grads: vec![0.0; n * nv],
            tape,
        })
    }

    /// Returns the compiled tape
    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    /// Returns the fraction of clauses enabled in the current specialization
    pub fn utilization(&self) -> f64 {
        let frame = self.frames.last().unwrap();
        frame.enabled.iter().filter(|b| **b).count() as f64
            / self.tape.len() as f64
    }

    /// Returns the current specialization depth (0 is the full program)
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    ////////////////////////////////////////////////////////////////////////////
    // Variables

    /// Updates the binding of a free variable
    ///
    /// Subsequent evaluations see the new value; the tape is not recompiled.
    pub fn set_var(&mut self, id: usize, v: f64) -> Result<(), Error> {
        let c = self
            .tape
            .var_clauses
            .get(&id)
            .copied()
            .ok_or(Error::UnknownVar(id))?;
        self.constants[c.index()] = v;
        Ok(())
    }

    /// Returns a snapshot of the current free-variable bindings
    pub fn var_values(&self) -> BTreeMap<usize, f64> {
        self.tape
            .var_clauses
            .iter()
            .map(|(id, c)| (*id, self.constants[c.index()]))
            .collect()
    }

    ////////////////////////////////////////////////////////////////////////////
    // Scalar and batch evaluation

    /// Evaluates the root at the given point
    pub fn eval(&mut self, p: Vector3<f64>) -> f64 {
        self.set(p, 0);
        self.values(1)[0]
    }

    /// Stages a point into the given batch slot
    ///
    /// Slots are evaluated together by [`values`](Evaluator::values) and
    /// [`derivs`](Evaluator::derivs).
    pub fn set(&mut self, p: Vector3<f64>, slot: usize) {
        debug_assert!(slot < BATCH_SIZE, "slot {slot} exceeds batch width");
        for (axis, v) in [p.x, p.y, p.z].into_iter().enumerate() {
            if let Some(c) = self.tape.xyz[axis] {
                self.values[c.index() * BATCH_SIZE + slot] = v;
            }
        }
    }

    /// Computes the root's value at slots `0..count`
    ///
    /// Returns the root's row of the value buffer.  Per-slot ambiguity flags
    /// are also refreshed (see [`get_ambiguous`](Evaluator::get_ambiguous)).
    pub fn values(&mut self, count: usize) -> &[f64] {
        debug_assert!(count <= BATCH_SIZE);
        self.ambig[..count].fill(false);
        let frame = self.frames.last().unwrap();
        for i in 0..self.tape.len() {
            if !frame.enabled[i] {
                continue;
            }
            let Clause { op, a, b } = self.tape.clauses[i];
            let row = i * BATCH_SIZE;
            let (prev, cur) = self.values.split_at_mut(row);
            let out = &mut cur[..count];
            let ar = a.index() * BATCH_SIZE;
            let br = b.index() * BATCH_SIZE;
            match op {
                ClauseOp::Const | ClauseOp::Var => {
                    out.fill(self.constants[i]);
                }
                // Spatial coordinates are staged directly by `set`
                ClauseOp::X | ClauseOp::Y | ClauseOp::Z => (),

                ClauseOp::Min | ClauseOp::Max => match frame.choices[i] {
                    Choice::Left => out.copy_from_slice(&prev[ar..ar + count]),
                    Choice::Right => out.copy_from_slice(&prev[br..br + count]),
                    _ => {
                        for (s, o) in out.iter_mut().enumerate() {
                            let va = prev[ar + s];
                            let vb = prev[br + s];
                            *o = if va.is_nan() || vb.is_nan() {
                                self.ambig[s] = true;
                                f64::NAN
                            } else {
                                if va == vb {
                                    self.ambig[s] = true;
                                }
                                if op == ClauseOp::Min {
                                    va.min(vb)
                                } else {
                                    va.max(vb)
                                }
                            };
                        }
                    }
                },

                _ => match op.arity() {
                    1 => {
                        for (s, o) in out.iter_mut().enumerate() {
                            let va = prev[ar + s];
                            *o = match op {
                                ClauseOp::Neg => -va,
                                ClauseOp::Abs => va.abs(),
                                ClauseOp::Sqrt => va.sqrt(),
                                ClauseOp::Square => va * va,
                                ClauseOp::Sin => va.sin(),
                                ClauseOp::Cos => va.cos(),
                                ClauseOp::Tan => va.tan(),
                                ClauseOp::Asin => va.asin(),
                                ClauseOp::Acos => va.acos(),
                                ClauseOp::Atan => va.atan(),
                                ClauseOp::Exp => va.exp(),
                                _ => unreachable!(),
                            };
                        }
                    }
                    2 => {
                        for (s, o) in out.iter_mut().enumerate() {
                            let va = prev[ar + s];
                            let vb = prev[br + s];
                            *o = match op {
                                ClauseOp::Add => va + vb,
                                ClauseOp::Sub => va - vb,
                                ClauseOp::Mul => va * vb,
                                ClauseOp::Div => va / vb,
                                ClauseOp::Atan2 => va.atan2(vb),
                                ClauseOp::Pow => va.powf(vb),
                                ClauseOp::NthRoot => {
                                    crate::context::nth_root(va, vb)
                                }
                                ClauseOp::Mod => va.rem_euclid(vb),
                                _ => unreachable!(),
                            };
                        }
                    }
                    _ => unreachable!(),
                },
            }
        }
        let root = self.tape.root.index() * BATCH_SIZE;
        &self.values[root..root + count]
    }

    /// Computes values and spatial partial derivatives at slots `0..count`
    pub fn derivs(&mut self, count: usize) -> Derivs<'_> {
        debug_assert!(count <= BATCH_SIZE);
        self.ambig[..count].fill(false);
        let frame = self.frames.last().unwrap();
        for i in 0..self.tape.len() {
            if !frame.enabled[i] {
                continue;
            }
            let Clause { op, a, b } = self.tape.clauses[i];
            let row = i * BATCH_SIZE;
            let (v_prev, v_cur) = self.values.split_at_mut(row);
            let (dx_prev, dx_cur) = self.dx.split_at_mut(row);
            let (dy_prev, dy_cur) = self.dy.split_at_mut(row);
            let (dz_prev, dz_cur) = self.dz.split_at_mut(row);
            let ar = a.index() * BATCH_SIZE;
            let br = b.index() * BATCH_SIZE;
            let prev = (v_prev, dx_prev, dy_prev, dz_prev);
            let mut cur = (v_cur, dx_cur, dy_cur, dz_cur);

            match op {
                ClauseOp::Const | ClauseOp::Var => {
                    for s in 0..count {
                        store_grad(&mut cur, s, self.constants[i].into());
                    }
                }
                ClauseOp::X | ClauseOp::Y | ClauseOp::Z => {
                    // value rows are staged by `set`; seed the derivatives
                    let [dx, dy, dz] = match op {
                        ClauseOp::X => [1.0, 0.0, 0.0],
                        ClauseOp::Y => [0.0, 1.0, 0.0],
                        _ => [0.0, 0.0, 1.0],
                    };
                    for s in 0..count {
                        let v = cur.0[s];
                        store_grad(&mut cur, s, Grad::new(v, dx, dy, dz));
                    }
                }

                ClauseOp::Min | ClauseOp::Max => match frame.choices[i] {
                    Choice::Left => {
                        for s in 0..count {
                            let g = load_grad(&prev, ar + s);
                            store_grad(&mut cur, s, g);
                        }
                    }
                    Choice::Right => {
                        for s in 0..count {
                            let g = load_grad(&prev, br + s);
                            store_grad(&mut cur, s, g);
                        }
                    }
                    _ => {
                        for s in 0..count {
                            let a = load_grad(&prev, ar + s);
                            let b = load_grad(&prev, br + s);
                            if a.value() == b.value()
                                || a.value().is_nan()
                                || b.value().is_nan()
                            {
                                self.ambig[s] = true;
                            }
                            let g = if op == ClauseOp::Min {
                                a.min(b)
                            } else {
                                a.max(b)
                            };
                            store_grad(&mut cur, s, g);
                        }
                    }
                },

                _ => match op.arity() {
                    1 => {
                        for s in 0..count {
                            let a = load_grad(&prev, ar + s);
                            let g = match op {
                                ClauseOp::Neg => -a,
                                ClauseOp::Abs => a.abs(),
                                ClauseOp::Sqrt => a.sqrt(),
                                ClauseOp::Square => a.square(),
                                ClauseOp::Sin => a.sin(),
                                ClauseOp::Cos => a.cos(),
                                ClauseOp::Tan => a.tan(),
                                ClauseOp::Asin => a.asin(),
                                ClauseOp::Acos => a.acos(),
                                ClauseOp::Atan => a.atan(),
                                ClauseOp::Exp => a.exp(),
                                _ => unreachable!(),
                            };
                            store_grad(&mut cur, s, g);
                        }
                    }
                    2 => {
                        for s in 0..count {
                            let a = load_grad(&prev, ar + s);
                            let b = load_grad(&prev, br + s);
                            let g = match op {
                                ClauseOp::Add => a + b,
                                ClauseOp::Sub => a - b,
                                ClauseOp::Mul => a * b,
                                ClauseOp::Div => a / b,
                                ClauseOp::Atan2 => a.atan2(b),
                                ClauseOp::Pow => a.pow(b),
                                ClauseOp::NthRoot => a.nth_root(b),
                                ClauseOp::Mod => a.rem_euclid(b),
                                _ => unreachable!(),
                            };
                            store_grad(&mut cur, s, g);
                        }
                    }
                    _ => unreachable!(),
                },
            }
        }
        let root = self.tape.root.index() * BATCH_SIZE;
        Derivs {
            v: &self.values[root..root + count],
            dx: &self.dx[root..root + count],
            dy: &self.dy[root..root + count],
            dz: &self.dz[root..root + count],
        }
    }

    /// Returns per-slot ambiguity flags from the latest batch evaluation
    ///
    /// A slot is flagged when some active `min` / `max` clause saw equal (or
    /// NaN) operands there.
    pub fn get_ambiguous(&self, count: usize) -> &[bool] {
        &self.ambig[..count]
    }

    /// Checks whether evaluation at the given point is ambiguous
    pub fn is_ambiguous(&mut self, p: Vector3<f64>) -> bool {
        self.set(p, 0);
        self.values(1);
        self.ambig[0]
    }

    ////////////////////////////////////////////////////////////////////////////
    // Interval evaluation

    /// Computes a sound interval bound of the root over the given box
    ///
    /// Dominance decisions at `min` / `max` clauses are recorded and drive
    /// the next [`push`](Evaluator::push).
    pub fn eval_interval(
        &mut self,
        lo: Vector3<f64>,
        hi: Vector3<f64>,
    ) -> Interval {
        let frame = self.frames.last().unwrap();
        for i in 0..self.tape.len() {
            if !frame.enabled[i] {
                continue;
            }
            let Clause { op, a, b } = self.tape.clauses[i];
            let ia = self.intervals[a.index()];
            let ib = self.intervals[b.index()];
            let out = match op {
                ClauseOp::Const | ClauseOp::Var => self.constants[i].into(),
                ClauseOp::X => Interval::new(lo.x, hi.x),
                ClauseOp::Y => Interval::new(lo.y, hi.y),
                ClauseOp::Z => Interval::new(lo.z, hi.z),

                ClauseOp::Neg => -ia,
                ClauseOp::Abs => ia.abs(),
                ClauseOp::Sqrt => ia.sqrt(),
                ClauseOp::Square => ia.square(),
                ClauseOp::Sin => ia.sin(),
                ClauseOp::Cos => ia.cos(),
                ClauseOp::Tan => ia.tan(),
                ClauseOp::Asin => ia.asin(),
                ClauseOp::Acos => ia.acos(),
                ClauseOp::Atan => ia.atan(),
                ClauseOp::Exp => ia.exp(),

                ClauseOp::Add => ia + ib,
                ClauseOp::Sub => ia - ib,
                ClauseOp::Mul => ia * ib,
                ClauseOp::Div => ia / ib,
                ClauseOp::Atan2 => ia.atan2(ib),
                ClauseOp::Pow => ia.pow(ib),
                ClauseOp::NthRoot => ia.nth_root(ib),
                ClauseOp::Mod => ia.rem_euclid(ib),

                ClauseOp::Min | ClauseOp::Max => match frame.choices[i] {
                    Choice::Left => ia,
                    Choice::Right => ib,
                    _ => {
                        let (v, c) = if op == ClauseOp::Min {
                            ia.min_choice(ib)
                        } else {
                            ia.max_choice(ib)
                        };
                        self.i_choices[i] = c;
                        v
                    }
                },
            };
            self.intervals[i] = out;
        }
        self.intervals[self.tape.root.index()]
    }

    ////////////////////////////////////////////////////////////////////////////
    // Specialization

    /// Computes the set of clauses reachable from the root under the given
    /// forwarding decisions
    fn reachable(&self, choices: &[Choice]) -> Vec<bool> {
        let n = self.tape.len();
        let mut used = vec![false; n];
        used[self.tape.root.index()] = true;
        for i in (0..n).rev() {
            if !used[i] {
                continue;
            }
            let Clause { op, a, b } = self.tape.clauses[i];
            match op.arity() {
                0 => (),
                1 => used[a.index()] = true,
                _ => {
                    if op.is_choice() {
                        match choices[i] {
                            Choice::Left => used[a.index()] = true,
                            Choice::Right => used[b.index()] = true,
                            _ => {
                                used[a.index()] = true;
                                used[b.index()] = true;
                            }
                        }
                    } else {
                        used[a.index()] = true;
                        used[b.index()] = true;
                    }
                }
            }
        }
        used
    }

    fn push_frame(&mut self, choices: Vec<Choice>) {
        let enabled = self.reachable(&choices);
        self.frames.push(Frame { enabled, choices });
        log::trace!(
            "push to depth {} (utilization {:.2})",
            self.depth(),
            self.utilization()
        );
    }

    /// Specializes the tape using the latest interval evaluation
    ///
    /// Each `min` / `max` clause whose interval result identified a dominant
    /// side forwards that side; clauses no longer reachable from the root are
    /// disabled until the matching [`pop`](Evaluator::pop).
    pub fn push(&mut self) {
        let frame = self.frames.last().unwrap();
        let mut choices = frame.choices.clone();
        for i in 0..self.tape.len() {
            if frame.enabled[i]
                && self.tape.clauses[i].op.is_choice()
                && choices[i] == Choice::Both
            {
                match self.i_choices[i] {
                    c @ (Choice::Left | Choice::Right) => choices[i] = c,
                    _ => (),
                }
            }
        }
        self.push_frame(choices);
    }

    /// Specializes the tape using a feature's branch decisions
    ///
    /// Decisions need not cover every ambiguous clause; unrecorded clauses
    /// are left alone.
    pub fn push_feature(&mut self, f: &Feature) {
        let frame = self.frames.last().unwrap();
        let mut choices = frame.choices.clone();
        for fc in f.choices() {
            choices[fc.id.index()] = fc.side;
        }
        self.push_frame(choices);
    }

    /// Evaluates at the given point, then specializes each `min` / `max`
    /// clause to the side which won there
    ///
    /// Clauses whose operands tie at `p` are left unspecialized.  Returns the
    /// value at `p`.
    pub fn specialize(&mut self, p: Vector3<f64>) -> f64 {
        self.set(p, 0);
        let out = self.values(1)[0];
        let frame = self.frames.last().unwrap();
        let mut choices = frame.choices.clone();
        for i in 0..self.tape.len() {
            let Clause { op, a, b } = self.tape.clauses[i];
            if !frame.enabled[i]
                || !op.is_choice()
                || choices[i] != Choice::Both
            {
                continue;
            }
            let va = self.values[a.index() * BATCH_SIZE];
            let vb = self.values[b.index() * BATCH_SIZE];
            let left_wins = if op == ClauseOp::Min { va < vb } else { va > vb };
            let right_wins =
                if op == ClauseOp::Min { vb < va } else { vb > va };
            if left_wins {
                choices[i] = Choice::Left;
            } else if right_wins {
                choices[i] = Choice::Right;
            }
        }
        self.push_frame(choices);
        out
    }

    /// Reverts the most recent specialization
    ///
    /// # Panics
    /// Calling `pop` with an empty specialization stack is a programmer
    /// error and panics.
    pub fn pop(&mut self) {
        assert!(
            self.frames.len() > 1,
            "unbalanced pop: specialization stack is empty"
        );
        self.frames.pop();
    }

    ////////////////////////////////////////////////////////////////////////////
    // Features

    /// Enumerates the distinct surface features at the given point
    ///
    /// Each feature is a consistent assignment of winning sides at the
    /// ambiguous `min` / `max` clauses, with its limiting surface gradient in
    /// [`Feature::deriv`].  An unambiguous point yields exactly one feature.
    pub fn features_at(&mut self, p: Vector3<f64>) -> Vec<Feature> {
        // Prune branches which lose unambiguously at p; only genuinely
        // ambiguous clauses remain eligible for branching below.
        self.specialize(p);

        let mut todo = VecDeque::new();
        todo.push_back(Feature::new());
        let mut done: Vec<Feature> = vec![];
        let mut seen: BTreeSet<Vec<FeatureChoice>> = BTreeSet::new();

        while let Some(mut f) = todo.pop_front() {
            self.push_feature(&f);
            let d = self.derivs(1);
            let deriv = Vector3::new(d.dx[0], d.dy[0], d.dz[0]);

            // Walk from the root downwards, looking for the first ambiguous
            // clause still active under this feature's decisions.  Anything
            // hidden behind a resolved branch is unreachable here, which
            // keeps the choice sets minimal.
            let frame = self.frames.last().unwrap();
            let mut branched = false;
            for i in (0..self.tape.len()).rev() {
                let Clause { op, a, b } = self.tape.clauses[i];
                if !frame.enabled[i]
                    || !op.is_choice()
                    || frame.choices[i] != Choice::Both
                    || f.has_choice(ClauseId(i as u32))
                {
                    continue;
                }
                let va = self.values[a.index() * BATCH_SIZE];
                let vb = self.values[b.index() * BATCH_SIZE];
                if va != vb {
                    continue;
                }
                let id = ClauseId(i as u32);
                let ga = Vector3::new(
                    self.dx[a.index() * BATCH_SIZE],
                    self.dy[a.index() * BATCH_SIZE],
                    self.dz[a.index() * BATCH_SIZE],
                );
                let gb = Vector3::new(
                    self.dx[b.index() * BATCH_SIZE],
                    self.dy[b.index() * BATCH_SIZE],
                    self.dz[b.index() * BATCH_SIZE],
                );
                // The left branch of a `min` wins along directions where it
                // falls below the right branch, and vice versa for `max`
                let e = if op == ClauseOp::Min { gb - ga } else { ga - gb };
                if e.norm() < 1e-12 {
                    // Identical derivatives: the branches are the same
                    // surface, so collapse to the left without forking
                    f.push_choice(FeatureChoice {
                        id,
                        side: Choice::Left,
                    });
                    continue;
                }
                let mut fa = f.clone();
                if fa.push(
                    e,
                    FeatureChoice {
                        id,
                        side: Choice::Left,
                    },
                ) {
                    todo.push_back(fa);
                }
                let mut fb = f.clone();
                if fb.push(
                    -e,
                    FeatureChoice {
                        id,
                        side: Choice::Right,
                    },
                ) {
                    todo.push_back(fb);
                }
                branched = true;
                break;
            }

            if !branched && seen.insert(f.choice_key()) {
                f.deriv = deriv;
                done.push(f);
            }
            self.pop();
        }

        self.pop(); // undo the specialization at p
        done
    }

    /// Checks whether the given point is inside the surface
    ///
    /// Strictly negative values are inside and strictly positive values are
    /// outside.  On the boundary (or at a NaN), the features at the point
    /// decide: with several features, the point is outside only if some
    /// feature admits travel along its own gradient while none admits the
    /// reverse — i.e. every consistent perturbation increases the value.
    pub fn is_inside(&mut self, p: Vector3<f64>) -> bool {
        let v = self.eval(p);
        if v < 0.0 {
            return true;
        } else if v > 0.0 {
            return false;
        }

        let fs = self.features_at(p);

        // A lone feature can produce both signs iff its gradient is nonzero
        if fs.len() == 1 {
            return fs[0].deriv.norm() > 0.0;
        }

        let mut pos = false;
        let mut neg = false;
        for f in &fs {
            pos |= f.is_compatible(f.deriv);
            neg |= f.is_compatible(-f.deriv);
        }
        !(pos && !neg)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Gradients over free variables

    /// Computes the gradient of the root with respect to every free variable
    /// at the given point
    pub fn gradient(&mut self, p: Vector3<f64>) -> BTreeMap<usize, f64> {
        self.set(p, 0);
        self.values(1);

        let nv = self.tape.var_clauses.len();
        if nv == 0 {
            return BTreeMap::new();
        }
        let var_slot: BTreeMap<usize, usize> = self
            .tape
            .var_clauses
            .values()
            .enumerate()
            .map(|(k, c)| (c.index(), k))
            .collect();

        let frame = self.frames.last().unwrap();
        for i in 0..self.tape.len() {
            if !frame.enabled[i] {
                continue;
            }
            let Clause { op, a, b } = self.tape.clauses[i];
            let v = self.values[i * BATCH_SIZE];
            let va = self.values[a.index() * BATCH_SIZE];
            let vb = self.values[b.index() * BATCH_SIZE];

            // Derivative coefficients with respect to each operand
            let (ca, cb) = match op {
                ClauseOp::Const | ClauseOp::X | ClauseOp::Y | ClauseOp::Z => {
                    (0.0, 0.0)
                }
                ClauseOp::Var => (0.0, 0.0),

                ClauseOp::Neg => (-1.0, 0.0),
                ClauseOp::Abs => (if va < 0.0 { -1.0 } else { 1.0 }, 0.0),
                ClauseOp::Sqrt => (0.5 / va.sqrt(), 0.0),
                ClauseOp::Square => (2.0 * va, 0.0),
                ClauseOp::Sin => (va.cos(), 0.0),
                ClauseOp::Cos => (-va.sin(), 0.0),
                ClauseOp::Tan => (1.0 / (va.cos() * va.cos()), 0.0),
                ClauseOp::Asin => (1.0 / (1.0 - va * va).sqrt(), 0.0),
                ClauseOp::Acos => (-1.0 / (1.0 - va * va).sqrt(), 0.0),
                ClauseOp::Atan => (1.0 / (1.0 + va * va), 0.0),
                ClauseOp::Exp => (va.exp(), 0.0),

                ClauseOp::Add => (1.0, 1.0),
                ClauseOp::Sub => (1.0, -1.0),
                ClauseOp::Mul => (vb, va),
                ClauseOp::Div => (1.0 / vb, -va / (vb * vb)),
                ClauseOp::Atan2 => {
                    let d = va * va + vb * vb;
                    (vb / d, -va / d)
                }
                // Exponent and degree are treated as locally constant
                ClauseOp::Pow => (vb * va.powf(vb - 1.0), 0.0),
                ClauseOp::NthRoot => (v / (vb * va), 0.0),
                ClauseOp::Mod => (1.0, 0.0),

                ClauseOp::Min | ClauseOp::Max => {
                    let left = match frame.choices[i] {
                        Choice::Left => true,
                        Choice::Right => false,
                        _ if op == ClauseOp::Min => va <= vb,
                        _ => va >= vb,
                    };
                    if left {
                        (1.0, 0.0)
                    } else {
                        (0.0, 1.0)
                    }
                }
            };

            let row = i * nv;
            let (prev, cur) = self.var_grads.split_at_mut(row);
            let out = &mut cur[..nv];
            if let Some(&k) = var_slot.get(&i) {
                out.fill(0.0);
                out[k] = 1.0;
            } else if op.arity() == 0 {
                out.fill(0.0);
            } else {
                let ar = a.index() * nv;
                let br = b.index() * nv;
                for k in 0..nv {
                    // Zero coefficients skip their operand entirely; a
                    // disabled operand's row may hold stale values
                    let mut g = 0.0;
                    if ca != 0.0 {
                        g += ca * prev[ar + k];
                    }
                    if op.arity() == 2 && cb != 0.0 {
                        g += cb * prev[br + k];
                    }
                    out[k] = g;
                }
            }
        }

        let root = self.tape.root.index() * nv;
        self.tape
            .var_clauses
            .keys()
            .enumerate()
            .map(|(k, id)| (*id, self.var_grads[root + k]))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    fn v3(x: f64, y: f64, z: f64) -> Vector3<f64> {
        Vector3::new(x, y, z)
    }

    /// `max(max(xmin - x, x - xmax), max(ymin - y, y - ymax))`
    fn rectangle(
        ctx: &mut Context,
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
    ) -> Node {
        let x = ctx.x();
        let y = ctx.y();
        let lx = ctx.sub(xmin, x).unwrap();
        let ux = ctx.sub(x, xmax).unwrap();
        let ly = ctx.sub(ymin, y).unwrap();
        let uy = ctx.sub(y, ymax).unwrap();
        let mx = ctx.max(lx, ux).unwrap();
        let my = ctx.max(ly, uy).unwrap();
        ctx.max(mx, my).unwrap()
    }

    #[test]
    fn test_principal_variables() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut e = Evaluator::new(&ctx, x).unwrap();
        assert_eq!(e.eval(v3(1.0, 2.0, 3.0)), 1.0);

        let y = ctx.y();
        let mut e = Evaluator::new(&ctx, y).unwrap();
        assert_eq!(e.eval(v3(1.0, 2.0, 3.0)), 2.0);
    }

    #[test]
    fn test_constant() {
        let mut ctx = Context::new();
        let c = ctx.constant(3.14);
        let mut e = Evaluator::new(&ctx, c).unwrap();
        assert_eq!(e.eval(v3(1.0, 2.0, 3.0)), 3.14);
    }

    #[test]
    fn test_secondary_variable() {
        let mut ctx = Context::new();
        let v = ctx.var();
        let id = ctx.var_id(v).unwrap().unwrap();
        let mut e = Evaluator::new_with_vars(
            &ctx,
            v,
            &[(id, 3.14)].into_iter().collect(),
        )
        .unwrap();
        assert_eq!(e.eval(v3(1.0, 2.0, 3.0)), 3.14);
    }

    #[test]
    fn test_gradient() {
        // constant + variable
        let mut ctx = Context::new();
        let v = ctx.var();
        let id = ctx.var_id(v).unwrap().unwrap();
        let root = ctx.add(v, 1.0).unwrap();
        let mut e = Evaluator::new_with_vars(
            &ctx,
            root,
            &[(id, 3.14)].into_iter().collect(),
        )
        .unwrap();
        assert_eq!(e.eval(v3(1.0, 2.0, 3.0)), 4.14);
        let g = e.gradient(v3(1.0, 2.0, 3.0));
        assert_eq!(g.len(), 1);
        assert_eq!(g[&id], 1.0);

        // x * variable
        let mut ctx = Context::new();
        let v = ctx.var();
        let id = ctx.var_id(v).unwrap().unwrap();
        let x = ctx.x();
        let root = ctx.mul(x, v).unwrap();
        let mut e = Evaluator::new_with_vars(
            &ctx,
            root,
            &[(id, 1.0)].into_iter().collect(),
        )
        .unwrap();
        let g = e.gradient(v3(2.0, 0.0, 0.0));
        assert_eq!(g.len(), 1);
        assert_eq!(g[&id], 2.0);
        let g = e.gradient(v3(3.0, 0.0, 0.0));
        assert_eq!(g[&id], 3.0);

        // multiple variables, deliberately constructed out of order
        let mut ctx = Context::new();
        let a = ctx.var();
        let c = ctx.var();
        let b = ctx.var();
        let (a_id, b_id, c_id) = (
            ctx.var_id(a).unwrap().unwrap(),
            ctx.var_id(b).unwrap().unwrap(),
            ctx.var_id(c).unwrap().unwrap(),
        );
        let b2 = ctx.mul(b, 2.0).unwrap();
        let c3 = ctx.mul(c, 3.0).unwrap();
        let sum = ctx.add(a, b2).unwrap();
        let root = ctx.add(sum, c3).unwrap();
        let mut e = Evaluator::new_with_vars(
            &ctx,
            root,
            &[(a_id, 3.0), (c_id, 7.0), (b_id, 5.0)].into_iter().collect(),
        )
        .unwrap();
        assert_eq!(e.eval(v3(0.0, 0.0, 0.0)), 34.0);
        let g = e.gradient(v3(0.0, 0.0, 0.0));
        assert_eq!(g[&a_id], 1.0);
        assert_eq!(g[&b_id], 2.0);
        assert_eq!(g[&c_id], 3.0);
    }

    #[test]
    fn test_set_var() {
        let mut ctx = Context::new();
        let a = ctx.var();
        let c = ctx.var();
        let b = ctx.var();
        let (a_id, b_id, c_id) = (
            ctx.var_id(a).unwrap().unwrap(),
            ctx.var_id(b).unwrap().unwrap(),
            ctx.var_id(c).unwrap().unwrap(),
        );
        let b2 = ctx.mul(b, 2.0).unwrap();
        let c3 = ctx.mul(c, 3.0).unwrap();
        let sum = ctx.add(a, b2).unwrap();
        let root = ctx.add(sum, c3).unwrap();
        let mut e = Evaluator::new_with_vars(
            &ctx,
            root,
            &[(a_id, 3.0), (c_id, 7.0), (b_id, 5.0)].into_iter().collect(),
        )
        .unwrap();
        assert_eq!(e.eval(v3(0.0, 0.0, 0.0)), 34.0);

        e.set_var(a_id, 5.0).unwrap();
        assert_eq!(e.eval(v3(0.0, 0.0, 0.0)), 36.0);
        e.set_var(b_id, 0.0).unwrap();
        assert_eq!(e.eval(v3(0.0, 0.0, 0.0)), 26.0);
        e.set_var(c_id, 10.0).unwrap();
        assert_eq!(e.eval(v3(0.0, 0.0, 0.0)), 35.0);

        assert!(matches!(e.set_var(99, 1.0), Err(Error::UnknownVar(99))));
    }

    #[test]
    fn test_var_values() {
        let mut ctx = Context::new();
        let a = ctx.var();
        let id = ctx.var_id(a).unwrap().unwrap();
        let mut e = Evaluator::new_with_vars(
            &ctx,
            a,
            &[(id, 3.0)].into_iter().collect(),
        )
        .unwrap();

        let vs = e.var_values();
        assert_eq!(vs.len(), 1);
        assert_eq!(vs[&id], 3.0);

        e.set_var(id, 5.0).unwrap();
        let vs = e.var_values();
        assert_eq!(vs[&id], 5.0);
    }

    #[test]
    fn test_float_eval() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let root = ctx.add(x, 1.0).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert_eq!(e.eval(v3(1.0, 2.0, 3.0)), 2.0);

        let z = ctx.z();
        let root = ctx.add(x, z).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert_eq!(e.eval(v3(1.0, 2.0, 3.0)), 4.0);
    }

    #[test]
    fn test_interval_eval() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let root = ctx.add(x, 1.0).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();

        let out = e.eval_interval(v3(1.0, 1.0, 1.0), v3(2.0, 2.0, 2.0));
        assert_eq!(out.lower(), 2.0);
        assert_eq!(out.upper(), 3.0);
    }

    #[test]
    fn test_push_pop() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let xp = ctx.add(x, 1.0).unwrap();
        let yp = ctx.add(y, 1.0).unwrap();
        let root = ctx.min(xp, yp).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();

        assert_eq!(e.eval(v3(1.0, -3.0, 0.0)), -2.0);

        // An interval evaluation that will lead to disabling the rhs
        let i = e.eval_interval(v3(-5.0, 8.0, 0.0), v3(-4.0, 9.0, 0.0));
        assert_eq!(i.lower(), -4.0);
        assert_eq!(i.upper(), -3.0);

        e.push();
        assert!(e.utilization() < 1.0);

        // The rhs of the min is gone, so we get the lhs value
        assert_eq!(e.eval(v3(1.0, 2.0, 0.0)), 2.0);

        e.pop();
        assert_eq!(e.utilization(), 1.0);
        assert_eq!(e.eval(v3(1.0, 2.0, 0.0)), 2.0);
    }

    #[test]
    #[should_panic(expected = "unbalanced pop")]
    fn test_unbalanced_pop() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut e = Evaluator::new(&ctx, x).unwrap();
        e.pop();
    }

    #[test]
    fn test_derivs() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut e = Evaluator::new(&ctx, x).unwrap();
        e.set(v3(0.0, 0.0, 0.0), 0);
        e.set(v3(1.0, 2.0, 3.0), 1);
        let d = e.derivs(2);
        assert_eq!(d.v, [0.0, 1.0]);
        assert_eq!(d.dx, [1.0, 1.0]);
        assert_eq!(d.dy, [0.0, 0.0]);
        assert_eq!(d.dz, [0.0, 0.0]);

        let z = ctx.z();
        let root = ctx.add(x, z).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        e.set(v3(1.0, 1.0, 1.0), 0);
        e.set(v3(1.0, 2.0, 3.0), 1);
        let d = e.derivs(2);
        assert_eq!(d.v, [2.0, 4.0]);
        assert_eq!(d.dx, [1.0, 1.0]);
        assert_eq!(d.dy, [0.0, 0.0]);
        assert_eq!(d.dz, [1.0, 1.0]);
    }

    #[test]
    fn test_specialize() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let root = ctx.min(x, y).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();

        e.specialize(v3(-1.0, 0.0, 0.0)); // specialize to just "X"
        assert_eq!(e.eval(v3(-2.0, 0.0, 0.0)), -2.0);
        assert_eq!(e.eval(v3(4.0, 0.0, 0.0)), 4.0);
        assert_eq!(e.eval(v3(4.0, 5.0, 0.0)), 4.0);
        assert_eq!(e.eval(v3(10.0, 5.0, 0.0)), 10.0);

        e.pop();
        e.specialize(v3(0.0, -1.0, 0.0)); // specialize to just "Y"
        assert_eq!(e.eval(v3(-2.0, 0.0, 0.0)), 0.0);
        assert_eq!(e.eval(v3(4.0, 0.0, 0.0)), 0.0);
        assert_eq!(e.eval(v3(4.0, 5.0, 0.0)), 5.0);
        assert_eq!(e.eval(v3(10.0, 5.0, 0.0)), 5.0);
        e.pop();
    }

    #[test]
    fn test_is_inside() {
        // Single plane edge
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut e = Evaluator::new(&ctx, x).unwrap();
        assert!(e.is_inside(v3(0.0, 0.0, 0.0)));
        assert!(e.is_inside(v3(-1.0, 0.0, 0.0)));
        assert!(!e.is_inside(v3(1.0, 0.0, 0.0)));

        // 2D plane-to-plane (full)
        let nx = ctx.neg(x).unwrap();
        let root = ctx.min(x, nx).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert!(e.is_inside(v3(0.0, 0.0, 0.0)));
        assert!(e.is_inside(v3(1.0, 0.0, 0.0)));
        assert!(e.is_inside(v3(-1.0, 0.0, 0.0)));

        // 2D plane-to-plane (empty)
        let root = ctx.max(x, nx).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert!(!e.is_inside(v3(0.0, 0.0, 0.0)));
        assert!(!e.is_inside(v3(1.0, 0.0, 0.0)));
        assert!(!e.is_inside(v3(-1.0, 0.0, 0.0)));

        // 2D corner
        let y = ctx.y();
        let ny = ctx.neg(y).unwrap();
        let mx = ctx.min(x, nx).unwrap();
        let my = ctx.min(y, ny).unwrap();
        let root = ctx.min(mx, my).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert!(e.is_inside(v3(0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_is_ambiguous() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut e = Evaluator::new(&ctx, x).unwrap();
        assert!(!e.is_ambiguous(v3(0.0, 0.0, 0.0)));
        assert!(!e.is_ambiguous(v3(1.0, 0.0, 0.0)));

        let nx = ctx.neg(x).unwrap();
        let root = ctx.min(x, nx).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert!(e.is_ambiguous(v3(0.0, 0.0, 0.0)));
        assert!(!e.is_ambiguous(v3(1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_features_at() {
        // Single feature
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut e = Evaluator::new(&ctx, x).unwrap();
        let fs = e.features_at(v3(0.0, 0.0, 0.0));
        assert_eq!(fs.len(), 1);
        assert_eq!(fs[0].deriv, v3(1.0, 0.0, 0.0));

        // Two features (min)
        let nx = ctx.neg(x).unwrap();
        let root = ctx.min(x, nx).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        let fs = e.features_at(v3(0.0, 0.0, 0.0));
        assert_eq!(fs.len(), 2);
        assert_eq!(fs[0].deriv, v3(1.0, 0.0, 0.0));
        assert_eq!(fs[1].deriv, v3(-1.0, 0.0, 0.0));

        // ... and only one away from the ambiguous point
        assert_eq!(e.features_at(v3(1.0, 0.0, 0.0)).len(), 1);

        // Two features (max)
        let root = ctx.max(x, nx).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        let fs = e.features_at(v3(0.0, 0.0, 0.0));
        assert_eq!(fs.len(), 2);
        assert_eq!(fs[0].deriv, v3(1.0, 0.0, 0.0));
        assert_eq!(fs[1].deriv, v3(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_three_features() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let inner = ctx.min(y, z).unwrap();
        let root = ctx.min(x, inner).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        let fs = e.features_at(v3(0.0, 0.0, 0.0));

        // The branches choosing (X, Y) and (X, Z) both collapse to X, so
        // there are three distinct features rather than four
        assert_eq!(fs.len(), 3);
        assert_eq!(fs[0].deriv, v3(1.0, 0.0, 0.0));
        assert_eq!(fs[1].deriv, v3(0.0, 1.0, 0.0));
        assert_eq!(fs[2].deriv, v3(0.0, 0.0, 1.0));
    }

    #[test]
    fn test_buried_ambiguity() {
        // The ambiguity in max(-1 - x, x) is irrelevant, because it ends up
        // being masked by the y clause
        let mut ctx = Context::new();
        let root = rectangle(&mut ctx, -1.0, 0.0, -1.0, 1.0);
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert_eq!(e.features_at(v3(-0.5, -1.0, 0.0)).len(), 1);
    }

    #[test]
    fn test_one_feature_nested() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let nx = ctx.neg(x).unwrap();
        let xm = ctx.sub(x, 1.0).unwrap();
        let ny = ctx.neg(y).unwrap();
        let ym = ctx.sub(y, 1.0).unwrap();
        let ax = ctx.max(nx, xm).unwrap();
        let ay = ctx.max(ny, ym).unwrap();
        let inner = ctx.max(ax, ay).unwrap();
        let root = ctx.max(inner, nx).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert_eq!(e.features_at(v3(0.0, 0.2, 0.0)).len(), 1);
    }

    #[test]
    fn test_duplicate_features() {
        // max(x, x) and friends collapse in the context arena, so a single
        // feature comes out regardless of nesting
        let mut ctx = Context::new();
        let x = ctx.x();
        let root = ctx.max(x, x).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert_eq!(e.features_at(v3(0.0, 0.2, 0.0)).len(), 1);

        let inner = ctx.max(x, x).unwrap();
        let root = ctx.max(x, inner).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert_eq!(e.features_at(v3(0.0, 0.2, 0.0)).len(), 1);
    }

    #[test]
    fn test_coincident_planes() {
        // Two coincident planes with the same normal are one feature
        let mut ctx = Context::new();
        let z = ctx.z();
        let a = ctx.sub(z, 6.0).unwrap();
        let m6 = ctx.constant(-6.0);
        let b = ctx.add(z, m6).unwrap();
        let root = ctx.max(a, b).unwrap();
        assert_ne!(a, b); // distinct nodes, same surface
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert_eq!(e.features_at(v3(0.0, 0.0, 6.0)).len(), 1);
    }

    #[test]
    fn test_get_ambiguous() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let nx = ctx.neg(x).unwrap();
        let root = ctx.min(x, nx).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        e.set(v3(0.0, 0.0, 0.0), 0);
        e.set(v3(1.0, 0.0, 0.0), 1);
        e.set(v3(2.0, 0.0, 0.0), 2);
        e.set(v3(0.0, 0.0, 0.0), 3);

        e.values(4);

        let a = e.get_ambiguous(3);
        assert_eq!(a.iter().filter(|b| **b).count(), 1);
        assert!(a[0]);

        let b = e.get_ambiguous(4);
        assert_eq!(b.iter().filter(|b| **b).count(), 2);
        assert!(b[0]);
        assert!(b[3]);
    }

    #[test]
    fn test_push_feature() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let nx = ctx.neg(x).unwrap();
        let root = ctx.min(x, nx).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();
        assert_eq!(e.eval(v3(0.0, 0.0, 0.0)), 0.0);
        let id = e.tape().root();

        // Select the first branch
        let mut f = Feature::new();
        assert!(f.push(
            v3(1.0, 0.0, 0.0),
            FeatureChoice {
                id,
                side: Choice::Left
            }
        ));
        e.push_feature(&f);
        assert_eq!(e.eval(v3(1.0, 0.0, 0.0)), 1.0);
        assert!(e.utilization() < 1.0);
        e.pop();

        // Select the second branch
        let mut f = Feature::new();
        assert!(f.push(
            v3(-1.0, 0.0, 0.0),
            FeatureChoice {
                id,
                side: Choice::Right
            }
        ));
        e.push_feature(&f);
        assert_eq!(e.eval(v3(-2.0, 0.0, 0.0)), 2.0);
        assert!(e.utilization() < 1.0);
        e.pop();
    }

    #[test]
    fn test_every_operation() {
        use crate::context::{BinaryOpcode, UnaryOpcode};

        for op in UnaryOpcode::iter() {
            let mut ctx = Context::new();
            let x = ctx.x();
            let n = match op {
                UnaryOpcode::Neg => ctx.neg(x),
                UnaryOpcode::Abs => ctx.abs(x),
                UnaryOpcode::Sqrt => ctx.sqrt(x),
                UnaryOpcode::Square => ctx.square(x),
                UnaryOpcode::Sin => ctx.sin(x),
                UnaryOpcode::Cos => ctx.cos(x),
                UnaryOpcode::Tan => ctx.tan(x),
                UnaryOpcode::Asin => ctx.asin(x),
                UnaryOpcode::Acos => ctx.acos(x),
                UnaryOpcode::Atan => ctx.atan(x),
                UnaryOpcode::Exp => ctx.exp(x),
            }
            .unwrap();
            let mut e = Evaluator::new(&ctx, n).unwrap();
            e.eval(v3(0.0, 0.0, 0.0));
            e.set(v3(0.0, 0.0, 0.0), 0);
            e.derivs(1);
            e.eval_interval(v3(0.0, 0.0, 0.0), v3(1.0, 1.0, 1.0));
        }
        for op in BinaryOpcode::iter() {
            let mut ctx = Context::new();
            let x = ctx.x();
            let n = match op {
                BinaryOpcode::Add => ctx.add(x, 5.0),
                BinaryOpcode::Sub => ctx.sub(x, 5.0),
                BinaryOpcode::Mul => ctx.mul(x, 5.0),
                BinaryOpcode::Div => ctx.div(x, 5.0),
                BinaryOpcode::Atan2 => ctx.atan2(x, 5.0),
                BinaryOpcode::Pow => ctx.pow(x, 5.0),
                BinaryOpcode::NthRoot => ctx.nth_root(x, 5.0),
                BinaryOpcode::Min => ctx.min(x, 5.0),
                BinaryOpcode::Max => ctx.max(x, 5.0),
                BinaryOpcode::Mod => ctx.modulo(x, 5.0),
            }
            .unwrap();
            let mut e = Evaluator::new(&ctx, n).unwrap();
            e.eval(v3(0.0, 0.0, 0.0));
            e.set(v3(0.0, 0.0, 0.0), 0);
            e.derivs(1);
            e.eval_interval(v3(0.0, 0.0, 0.0), v3(1.0, 1.0, 1.0));
        }
    }

    #[test]
    fn test_balanced_push_pop_restores_mask() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let root = ctx.min(x, y).unwrap();
        let mut e = Evaluator::new(&ctx, root).unwrap();

        e.eval_interval(v3(-2.0, 5.0, 0.0), v3(-1.0, 6.0, 0.0));
        e.push();
        assert!(e.utilization() < 1.0);
        e.specialize(v3(-1.0, 5.0, 0.0));
        e.pop();
        e.pop();
        assert_eq!(e.utilization(), 1.0);
        assert_eq!(e.depth(), 0);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let v = ctx.var();
        let id = ctx.var_id(v).unwrap().unwrap();
        let root = ctx.add(x, v).unwrap();
        let e = Evaluator::new_with_vars(
            &ctx,
            root,
            &[(id, 1.0)].into_iter().collect(),
        )
        .unwrap();

        let mut e1 = e.clone();
        let mut e2 = e.clone();
        e2.set_var(id, 10.0).unwrap();
        assert_eq!(e1.eval(v3(1.0, 0.0, 0.0)), 2.0);
        assert_eq!(e2.eval(v3(1.0, 0.0, 0.0)), 11.0);
    }
}
