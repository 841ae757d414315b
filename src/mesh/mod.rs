//! Spatial subdivision and surface extraction
//!
//! [`Octree::render`] adaptively subdivides a [`Region`](crate::region::Region),
//! using interval evaluation to cull empty and full cells (with push/pop
//! specialization shrinking the tape on the way down), and emits leaf cells
//! carrying vertices and marching patches.
//!
//! ```
//! use levelset::{context::Context, mesh::{CellType, Octree}, region::Region};
//!
//! let mut ctx = Context::new();
//! let x = ctx.x();
//! let y = ctx.y();
//! let z = ctx.z();
//! let x2 = ctx.square(x)?;
//! let y2 = ctx.square(y)?;
//! let z2 = ctx.square(z)?;
//! let xy = ctx.add(x2, y2)?;
//! let r = ctx.add(xy, z2)?;
//! let sphere = ctx.sub(r, 0.5)?;
//!
//! let region = Region::new([-1.0, 1.0], [-1.0, 1.0], [-1.0, 1.0], 2.0);
//! let o = Octree::render(&ctx, sphere, &region)?;
//! assert_eq!(o.cell_type(), CellType::Branch);
//! # Ok::<(), levelset::Error>(())
//! ```
pub mod marching;
mod octree;
mod qef;

pub use octree::{CellType, Octree};
pub use qef::QuadraticErrorSolver;
