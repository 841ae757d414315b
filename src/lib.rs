//! Evaluation and meshing kernel for implicit surfaces
//!
//! A shape is a scalar field built as an expression graph over the spatial
//! coordinates (and optional free variables); points with a negative value
//! are inside.  The crate compiles such graphs into flat clause tapes and
//! evaluates them in several modes over the same program — scalar points,
//! packed batches with derivatives, interval bounds over boxes, and
//! gradients with respect to free variables — with *push/pop
//! specialization* to temporarily prune `min` / `max` branches that are
//! provably inactive.  On top of the evaluator sit a feature system for
//! ambiguous points and an octree renderer.
//!
//! ```
//! use levelset::{context::Context, eval::Evaluator};
//! use nalgebra::Vector3;
//!
//! let mut ctx = Context::new();
//! let x = ctx.x();
//! let y = ctx.y();
//! let x2 = ctx.square(x)?;
//! let y2 = ctx.square(y)?;
//! let r = ctx.add(x2, y2)?;
//! let circle = ctx.sub(r, 1.0)?;
//!
//! let mut eval = Evaluator::new(&ctx, circle)?;
//! assert_eq!(eval.eval(Vector3::new(0.0, 0.0, 0.0)), -1.0);
//! assert_eq!(eval.eval(Vector3::new(1.0, 0.0, 0.0)), 0.0);
//!
//! // Interval evaluation gives a sound bound over a box...
//! let i = eval.eval_interval(
//!     Vector3::new(2.0, 2.0, 0.0),
//!     Vector3::new(3.0, 3.0, 0.0),
//! );
//! assert!(i.lower() > 0.0); // ...so this box is entirely outside
//! # Ok::<(), levelset::Error>(())
//! ```
pub mod context;
pub mod eval;
pub mod mesh;
pub mod region;
pub mod types;

mod error;
pub use error::Error;
