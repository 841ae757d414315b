//! Adaptive subdivision driving the evaluator and emitting leaf cells
use crate::{
    context::{Context, Node},
    eval::Evaluator,
    mesh::{marching, marching::Crossing, qef::QuadraticErrorSolver},
    region::Region,
    Error,
};

use nalgebra::Vector3;

/// Iteration count for the zero-crossing search along cell edges
const SEARCH_ITERATIONS: usize = 16;

/// The role of a cell in the subdivision
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CellType {
    /// Subdivided further; owns `2^N` children
    Branch,
    /// Minimum-size cell crossed by the surface
    Leaf,
    /// Interval evaluation proved the cell entirely outside
    Empty,
    /// Interval evaluation proved the cell entirely inside
    Full,
}

/// A sub-box of the render region, tracking the sample count per axis
#[derive(Copy, Clone, Debug)]
struct Subregion {
    lo: Vector3<f64>,
    hi: Vector3<f64>,
    counts: [usize; 3],
}

impl Subregion {
    fn can_split(&self) -> bool {
        self.counts.iter().any(|c| *c > 1)
    }

    /// Position of the given corner (low side where bit is 0)
    fn pos(&self, corner: usize) -> Vector3<f64> {
        Vector3::new(
            if corner & 1 == 0 { self.lo.x } else { self.hi.x },
            if corner & 2 == 0 { self.lo.y } else { self.hi.y },
            if corner & 4 == 0 { self.lo.z } else { self.hi.z },
        )
    }

    /// The `i`-th child sub-box, halving every splittable axis
    ///
    /// Child and corner indexing agree: bit 0 is X, bit 1 is Y, bit 2 is Z,
    /// with a set bit selecting the upper half.
    fn child(&self, i: usize) -> Subregion {
        let mut out = *self;
        for axis in 0..3 {
            if out.counts[axis] > 1 {
                let mid = (out.lo[axis] + out.hi[axis]) / 2.0;
                out.counts[axis] /= 2;
                if (i >> axis) & 1 == 0 {
                    out.hi[axis] = mid;
                } else {
                    out.lo[axis] = mid;
                }
            }
        }
        out
    }
}

/// A cell of the rendered octree (or quadtree, when the region is flat)
///
/// Branch cells own their children; leaf cells carry one vertex per surface
/// feature and the marching patches for their corner mask.
#[derive(Debug)]
pub struct Octree {
    cell_type: CellType,
    lo: Vector3<f64>,
    hi: Vector3<f64>,
    corners: u8,
    children: Vec<Octree>,
    verts: Vec<Vector3<f64>>,
    patches: Vec<Vec<Crossing>>,
}

impl Octree {
    /// Renders the given expression over a region
    ///
    /// The region is inflated to power-of-two sample counts so that cells
    /// halve evenly; a region with a single Z sample renders as a quadtree.
    pub fn render(
        ctx: &Context,
        root: Node,
        region: &Region,
    ) -> Result<Self, Error> {
        let mut e = Evaluator::new(ctx, root)?;
        Ok(Self::render_with(&mut e, region))
    }

    /// Renders using an existing evaluator (e.g. a per-worker clone)
    pub fn render_with(e: &mut Evaluator, region: &Region) -> Self {
        let n = if region.z.values.len() == 1 { 2 } else { 3 };
        let region = region.power_of_two(n);
        let cell = Subregion {
            lo: Vector3::new(
                region.x.bounds.lower(),
                region.y.bounds.lower(),
                region.z.bounds.lower(),
            ),
            hi: Vector3::new(
                region.x.bounds.upper(),
                region.y.bounds.upper(),
                region.z.bounds.upper(),
            ),
            counts: [
                region.x.values.len(),
                region.y.values.len(),
                region.z.values.len(),
            ],
        };
        log::debug!(
            "rendering {}d region with {:?} samples",
            n,
            cell.counts
        );
        Self::subdivide(e, cell, n)
    }

    fn terminal(cell_type: CellType, cell: &Subregion, corners: u8) -> Self {
        Octree {
            cell_type,
            lo: cell.lo,
            hi: cell.hi,
            corners,
            children: vec![],
            verts: vec![],
            patches: vec![],
        }
    }

    fn subdivide(e: &mut Evaluator, cell: Subregion, n: usize) -> Self {
        let nv = marching::verts(n);
        let i = e.eval_interval(cell.lo, cell.hi);
        if i.upper() <= 0.0 {
            let full = ((1u32 << nv) - 1) as u8;
            return Self::terminal(CellType::Full, &cell, full);
        } else if i.lower() >= 0.0 {
            return Self::terminal(CellType::Empty, &cell, 0);
        }

        if !cell.can_split() {
            return Self::leaf(e, &cell, n);
        }

        // Disable any branches proven inactive over this sub-box, then
        // octsect and recurse
        e.push();
        let children: Vec<Octree> = (0..(1 << n))
            .map(|i| Self::subdivide(e, cell.child(i), n))
            .collect();
        e.pop();

        let mut corners = 0;
        for (j, c) in children.iter().enumerate() {
            if c.corner(j) {
                corners |= 1 << j;
            }
        }
        Octree {
            cell_type: CellType::Branch,
            lo: cell.lo,
            hi: cell.hi,
            corners,
            children,
            verts: vec![],
            patches: vec![],
        }
    }

    fn leaf(e: &mut Evaluator, cell: &Subregion, n: usize) -> Self {
        let nv = marching::verts(n);
        let mut corners = 0u8;
        for j in 0..nv {
            if e.is_inside(cell.pos(j)) {
                corners |= 1 << j;
            }
        }
        let table = marching::table(n);
        let patches = table.verts_to_patches[corners as usize].clone();
        let crossings: Vec<Crossing> =
            patches.iter().flatten().copied().collect();

        // At an ambiguous corner, the surface splits into features; each one
        // gets its own vertex, with the edge searches re-run on the tape
        // specialized to that feature's branch decisions.
        let mut verts = vec![];
        if let Some(p) = (0..nv)
            .map(|j| cell.pos(j))
            .find(|p| e.is_ambiguous(*p))
        {
            let fs = e.features_at(p);
            if fs.len() > 1 {
                for f in &fs {
                    e.push_feature(f);
                    verts.push(Self::solve_vertex(e, cell, &crossings));
                    e.pop();
                }
            }
        }
        if verts.is_empty() {
            verts.push(Self::solve_vertex(e, cell, &crossings));
        }

        Octree {
            cell_type: CellType::Leaf,
            lo: cell.lo,
            hi: cell.hi,
            corners,
            children: vec![],
            verts,
            patches,
        }
    }

    /// Places a vertex from the cell's edge crossings and surface normals
    fn solve_vertex(
        e: &mut Evaluator,
        cell: &Subregion,
        crossings: &[Crossing],
    ) -> Vector3<f64> {
        let center = (cell.lo + cell.hi) / 2.0;
        if crossings.is_empty() {
            // Sign-uniform corners in a cell the interval check could not
            // cull; rare, and the center is as good a guess as any
            return center;
        }

        let mut pts = Vec::with_capacity(crossings.len());
        for &(ci, co) in crossings {
            let mut inside = cell.pos(ci as usize);
            let mut outside = cell.pos(co as usize);
            for _ in 0..SEARCH_ITERATIONS {
                let mid = (inside + outside) / 2.0;
                if e.eval(mid) < 0.0 {
                    inside = mid;
                } else {
                    outside = mid;
                }
            }
            pts.push((inside + outside) / 2.0);
        }

        for (s, p) in pts.iter().enumerate() {
            e.set(*p, s);
        }
        let d = e.derivs(pts.len());
        let mut qef = QuadraticErrorSolver::new();
        for (s, p) in pts.iter().enumerate() {
            qef.add_intersection(
                *p,
                Vector3::new(d.dx[s], d.dy[s], d.dz[s]),
            );
        }

        let (v, _err) = qef.solve();
        // Clamp into the cell; a wildly escaping solution means the QEF was
        // nearly singular
        Vector3::new(
            v.x.clamp(cell.lo.x, cell.hi.x),
            v.y.clamp(cell.lo.y, cell.hi.y),
            v.z.clamp(cell.lo.z, cell.hi.z),
        )
    }

    ////////////////////////////////////////////////////////////////////////////
    // Queries

    /// Returns the cell's role in the subdivision
    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    /// Returns the given child of a branch cell
    pub fn child(&self, i: usize) -> Option<&Octree> {
        self.children.get(i)
    }

    /// Checks whether the given corner is inside the surface
    pub fn corner(&self, i: usize) -> bool {
        self.corners & (1 << i) != 0
    }

    /// Position of the given corner (bit 0 selects the upper X side, etc)
    pub fn pos(&self, i: usize) -> Vector3<f64> {
        Vector3::new(
            if i & 1 == 0 { self.lo.x } else { self.hi.x },
            if i & 2 == 0 { self.lo.y } else { self.hi.y },
            if i & 4 == 0 { self.lo.z } else { self.hi.z },
        )
    }

    /// Returns the primary vertex of a leaf cell
    pub fn vertex(&self) -> Option<Vector3<f64>> {
        self.verts.first().copied()
    }

    /// Returns every vertex of a leaf cell (one per surface feature)
    pub fn vertices(&self) -> &[Vector3<f64>] {
        &self.verts
    }

    /// Returns the cell's marching patches, as loops of directed crossings
    pub fn patches(&self) -> &[Vec<Crossing>] {
        &self.patches
    }

    /// Returns the cell's bounding box
    pub fn bounds(&self) -> (Vector3<f64>, Vector3<f64>) {
        (self.lo, self.hi)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;

    fn sphere(ctx: &mut Context, r2: f64) -> Node {
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let z2 = ctx.square(z).unwrap();
        let xy = ctx.add(x2, y2).unwrap();
        let r = ctx.add(xy, z2).unwrap();
        ctx.sub(r, r2).unwrap()
    }

    #[test]
    fn test_culling() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.25);
        let region = Region::new([2.0, 3.0], [2.0, 3.0], [2.0, 3.0], 2.0);
        let o = Octree::render(&ctx, root, &region).unwrap();
        assert_eq!(o.cell_type(), CellType::Empty);

        let region =
            Region::new([-0.1, 0.1], [-0.1, 0.1], [-0.1, 0.1], 2.0);
        let o = Octree::render(&ctx, root, &region).unwrap();
        assert_eq!(o.cell_type(), CellType::Full);
    }

    #[test]
    fn test_quadtree() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let r = ctx.add(x2, y2).unwrap();
        let root = ctx.sub(r, 0.5).unwrap();

        let region = Region::new([-1.0, 1.0], [-1.0, 1.0], [0.0, 0.0], 4.0);
        let o = Octree::render(&ctx, root, &region).unwrap();
        assert_eq!(o.cell_type(), CellType::Branch);

        // A quadtree branch has 4 children and no Z split
        assert!(o.child(3).is_some());
        assert!(o.child(4).is_none());
        let (lo, hi) = o.child(0).unwrap().bounds();
        assert_eq!(lo.z, 0.0);
        assert_eq!(hi.z, 0.0);
    }
}
