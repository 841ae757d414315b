use nalgebra::{Matrix3, Vector3, Vector4};

/// Solver for a quadratic error function to position a vertex within a cell
///
/// Accumulates surface crossings with their normals, then minimizes
/// `sum((n_i . (x - p_i))^2)` in the least-squares sense, biased toward the
/// mass point of the crossings.
#[derive(Copy, Clone, Debug, Default)]
pub struct QuadraticErrorSolver {
    /// A^T A term
    ata: Matrix3<f64>,

    /// A^T B term
    atb: Vector3<f64>,

    /// B^T B term
    btb: f64,

    /// Mass point of intersections is stored as XYZ / W, so that summing works
    mass_point: Vector4<f64>,
}

impl QuadraticErrorSolver {
    pub fn new() -> Self {
        Self {
            ata: Matrix3::zeros(),
            atb: Vector3::zeros(),
            btb: 0.0,
            mass_point: Vector4::zeros(),
        }
    }

    /// Checks whether any intersections have been accumulated
    pub fn is_empty(&self) -> bool {
        self.mass_point.w == 0.0
    }

    /// Adds a new intersection to the QEF
    ///
    /// `pos` is the position of the intersection and is accumulated in the
    /// mass point.  `grad` is the gradient at the surface, and is normalized
    /// in this function; a vanishing gradient only contributes to the mass
    /// point.
    pub fn add_intersection(&mut self, pos: Vector3<f64>, grad: Vector3<f64>) {
        self.mass_point += Vector4::new(pos.x, pos.y, pos.z, 1.0);
        let norm = grad.norm();
        if norm == 0.0 || !norm.is_finite() {
            return;
        }
        let n = grad / norm;
        self.ata += n * n.transpose();
        self.atb += n * n.dot(&pos);
        self.btb += n.dot(&pos).powi(2);
    }

    /// Solves the QEF, minimizing towards the mass point
    ///
    /// Near-singular systems drop their smallest singular values, which
    /// degrades gracefully from a corner to an edge to a plane to the mass
    /// point itself.  Returns the vertex and the residual error.
    pub fn solve(&self) -> (Vector3<f64>, f64) {
        let center = self.mass_point.xyz() / self.mass_point.w;
        let atb = self.atb - self.ata * center;

        let svd = nalgebra::linalg::SVD::new(self.ata, true, true);
        let max_sv = svd
            .singular_values
            .iter()
            .cloned()
            .fold(0.0, f64::max);

        // Singular values below this fraction of the maximum are treated as
        // zero, which keeps near-planar cells from shooting the vertex far
        // outside the cell
        const EIGENVALUE_CUTOFF_RELATIVE: f64 = 1e-3;
        let epsilon = max_sv * EIGENVALUE_CUTOFF_RELATIVE;

        let pos = match svd.solve(&atb, epsilon) {
            Ok(sol) => sol + center,
            Err(_) => center,
        };
        let err = ((pos.transpose() * self.ata * pos
            - 2.0 * pos.transpose() * self.atb)[0]
            + self.btb)
            .max(0.0);
        (pos, err)
    }
}

impl std::ops::AddAssign for QuadraticErrorSolver {
    fn add_assign(&mut self, rhs: Self) {
        self.ata += rhs.ata;
        self.atb += rhs.atb;
        self.btb += rhs.btb;
        self.mass_point += rhs.mass_point;
    }
}
