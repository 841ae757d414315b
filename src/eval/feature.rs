//! Branch-consistent surface elements at ambiguous points
use crate::eval::{tape::ClauseId, Choice};

use arrayvec::ArrayVec;
use nalgebra::Vector3;
use std::collections::BTreeMap;

/// Tolerance for treating two unit directions as identical / antiparallel
const EPSILON_TOL: f64 = 1e-8;

/// Most features carry one or two epsilons; this bound is generous
const MAX_EPSILONS: usize = 16;

/// A single decision at a `min` / `max` clause
///
/// The side is [`Choice::Left`] or [`Choice::Right`]; other values are not
/// meaningful here.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FeatureChoice {
    pub id: ClauseId,
    pub side: Choice,
}

/// A surface element at an ambiguous evaluation point
///
/// A feature is identified by a consistent assignment of winning sides at
/// ambiguous `min` / `max` clauses, together with a bundle of *epsilons*:
/// unit directions along which the limiting derivative of each decision is
/// defined.  All epsilons in a feature must be mutually compatible, i.e.
/// there must be a direction of travel which respects every decision at once.
#[derive(Clone, Debug, Default)]
pub struct Feature {
    /// Per-clause decisions, in the order they were accepted
    choices: Vec<FeatureChoice>,

    /// Deduplicated epsilon directions
    epsilons: ArrayVec<Vector3<f64>, MAX_EPSILONS>,

    /// Per-clause epsilon lookup
    by_id: BTreeMap<ClauseId, Vector3<f64>>,

    /// The feature's effective surface gradient, set by the caller once the
    /// feature is complete
    pub deriv: Vector3<f64>,
}

impl Feature {
    /// Builds an empty feature with no decisions
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether a particular direction is compatible with all of the
    /// epsilons in the system.
    ///
    /// Compatibility means that the open cone `{d : d · e > 0}` over every
    /// accepted epsilon (and the candidate) is nonempty.  By Gordan's
    /// theorem, the cone is empty exactly when the origin lies in the convex
    /// hull of the direction set, which we check by enumerating small
    /// subsets.  This is a slow (worst-case O(n^4)) operation, but n is
    /// seldom more than 4 and it is called rarely.
    pub fn is_compatible(&self, e: Vector3<f64>) -> bool {
        let norm = e.norm();
        if norm < EPSILON_TOL {
            return false;
        }
        self.is_compatible_norm(e / norm)
    }

    fn is_compatible_norm(&self, e: Vector3<f64>) -> bool {
        // A repeated direction changes nothing
        if self.epsilons.iter().any(|f| f.dot(&e) > 1.0 - EPSILON_TOL) {
            return true;
        }
        let mut vs: ArrayVec<Vector3<f64>, { MAX_EPSILONS + 1 }> =
            self.epsilons.iter().cloned().collect();
        vs.push(e);
        cone_is_nonempty(&vs)
    }

    /// Attempts to add a decision and its epsilon direction
    ///
    /// If the direction is incompatible with the previously accepted
    /// epsilons, does nothing and returns `false`; otherwise records the
    /// decision and returns `true`.
    pub fn push(&mut self, e: Vector3<f64>, choice: FeatureChoice) -> bool {
        let norm = e.norm();
        if norm < EPSILON_TOL {
            return false;
        }
        let e = e / norm;
        if !self.is_compatible_norm(e) {
            return false;
        }
        self.push_raw(choice, e);
        true
    }

    /// Records a decision and direction without any compatibility checking
    pub fn push_raw(&mut self, choice: FeatureChoice, e: Vector3<f64>) {
        self.push_choice_raw(choice);
        self.by_id.insert(choice.id, e);
        if !self.epsilons.iter().any(|f| f.dot(&e) > 1.0 - EPSILON_TOL) {
            self.epsilons.push(e);
        }
    }

    /// Records a decision without an associated direction
    ///
    /// This is useful to collapse cases like `min(a, a)`, where a decision
    /// must be recorded but no perturbation distinguishes the branches.
    pub fn push_choice(&mut self, choice: FeatureChoice) {
        self.push_choice_raw(choice);
    }

    /// Appends a decision to the end of the list
    pub fn push_choice_raw(&mut self, choice: FeatureChoice) {
        debug_assert!(
            !self.has_choice(choice.id),
            "duplicate decision for {}",
            choice.id
        );
        self.choices.push(choice);
    }

    /// Accessor for the decision list
    pub fn choices(&self) -> &[FeatureChoice] {
        &self.choices
    }

    /// Checks whether the given clause already has a recorded decision
    pub fn has_choice(&self, id: ClauseId) -> bool {
        self.choices.iter().any(|c| c.id == id)
    }

    /// Returns the epsilon associated with a particular clause, if present
    pub fn epsilon(&self, id: ClauseId) -> Option<Vector3<f64>> {
        self.by_id.get(&id).copied()
    }

    /// Checks whether the given clause has an epsilon
    pub fn has_epsilon(&self, id: ClauseId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Returns the decision list sorted by clause id, for deduplication
    pub(crate) fn choice_key(&self) -> Vec<FeatureChoice> {
        let mut out = self.choices.clone();
        out.sort();
        out
    }
}

/// Checks whether the open cone `{d : d · v > 0 for every v}` is nonempty
///
/// The cone is empty iff the origin lies in the convex hull of `vs`
/// (Gordan's theorem); by Carathéodory, it then lies in the hull of at most
/// four of them, so pairs, triples, and quadruples are checked directly.
fn cone_is_nonempty(vs: &[Vector3<f64>]) -> bool {
    let n = vs.len();
    if n <= 1 {
        return true;
    }

    // Antiparallel pair
    for i in 0..n {
        for j in (i + 1)..n {
            if vs[i].dot(&vs[j]) < -1.0 + EPSILON_TOL {
                return false;
            }
        }
    }
    if n == 2 {
        return true;
    }

    // Origin strictly inside a triangle of directions.  The triangle must be
    // coplanar with the origin; this is the half-circle test for planar
    // epsilon sets.
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                if triangle_contains_origin(vs[i], vs[j], vs[k]) {
                    return false;
                }
            }
        }
    }

    // Origin inside a tetrahedron of directions (the full 3D cone test)
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                for l in (k + 1)..n {
                    if tetrahedron_contains_origin(
                        vs[i], vs[j], vs[k], vs[l],
                    ) {
                        return false;
                    }
                }
            }
        }
    }
    true
}

fn triangle_contains_origin(
    a: Vector3<f64>,
    b: Vector3<f64>,
    c: Vector3<f64>,
) -> bool {
    let n = (b - a).cross(&(c - a));
    if n.norm() < EPSILON_TOL {
        return false;
    }
    // The origin must lie in the triangle's plane
    if a.dot(&n).abs() > EPSILON_TOL {
        return false;
    }
    // ... and on the same side of every edge (either winding)
    let s0 = (b - a).cross(&(-a)).dot(&n);
    let s1 = (c - b).cross(&(-b)).dot(&n);
    let s2 = (a - c).cross(&(-c)).dot(&n);
    let all_pos =
        s0 >= -EPSILON_TOL && s1 >= -EPSILON_TOL && s2 >= -EPSILON_TOL;
    let all_neg = s0 <= EPSILON_TOL && s1 <= EPSILON_TOL && s2 <= EPSILON_TOL;
    all_pos || all_neg
}

fn tetrahedron_contains_origin(
    a: Vector3<f64>,
    b: Vector3<f64>,
    c: Vector3<f64>,
    d: Vector3<f64>,
) -> bool {
    // Solve 0 == l0*a + l1*b + l2*c + l3*d with the l summing to 1
    let m = nalgebra::Matrix3::from_columns(&[a - d, b - d, c - d]);
    let Some(inv) = m.try_inverse() else {
        // Degenerate tetrahedron; covered by the triangle checks
        return false;
    };
    let l = inv * (-d);
    let l3 = 1.0 - l.x - l.y - l.z;
    l.x >= -EPSILON_TOL
        && l.y >= -EPSILON_TOL
        && l.z >= -EPSILON_TOL
        && l3 >= -EPSILON_TOL
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(x: f64, y: f64, z: f64) -> Vector3<f64> {
        Vector3::new(x, y, z)
    }

    #[test]
    fn test_empty_feature() {
        let f = Feature::new();
        assert!(f.is_compatible(v(1.0, 0.0, 0.0)));
        assert!(f.is_compatible(v(-1.0, 0.0, 0.0)));
        assert!(!f.is_compatible(v(0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_antiparallel() {
        let mut f = Feature::new();
        assert!(f.push(
            v(1.0, 0.0, 0.0),
            FeatureChoice {
                id: ClauseId(0),
                side: Choice::Left
            }
        ));
        assert!(!f.is_compatible(v(-1.0, 0.0, 0.0)));
        assert!(f.is_compatible(v(0.0, 1.0, 0.0)));
        assert!(f.is_compatible(v(1.0, 1.0, 0.0)));
    }

    #[test]
    fn test_planar_half_circle() {
        // Three in-plane directions at 120 degrees close the cone
        let mut f = Feature::new();
        let c = FeatureChoice {
            id: ClauseId(0),
            side: Choice::Left,
        };
        assert!(f.push(v(1.0, 0.0, 0.0), c));
        let c = FeatureChoice {
            id: ClauseId(1),
            side: Choice::Left,
        };
        assert!(f.push(v(-0.5, 3f64.sqrt() / 2.0, 0.0), c));
        assert!(!f.is_compatible(v(-0.5, -(3f64.sqrt()) / 2.0, 0.0)));

        // ... but a direction in the remaining open half-plane is fine
        assert!(f.is_compatible(v(0.5, 0.5, 0.0)));
    }

    #[test]
    fn test_three_axes() {
        // The positive octant is a perfectly good cone
        let mut f = Feature::new();
        for (i, e) in [v(1.0, 0.0, 0.0), v(0.0, 1.0, 0.0), v(0.0, 0.0, 1.0)]
            .into_iter()
            .enumerate()
        {
            let c = FeatureChoice {
                id: ClauseId(i as u32),
                side: Choice::Left,
            };
            assert!(f.push(e, c));
        }
        // ... and the opposing direction closes it
        assert!(!f.is_compatible(v(-1.0, -1.0, -1.0)));
        assert!(f.is_compatible(v(1.0, 1.0, 1.0)));
    }

    #[test]
    fn test_duplicate_direction() {
        let mut f = Feature::new();
        let c = FeatureChoice {
            id: ClauseId(0),
            side: Choice::Left,
        };
        assert!(f.push(v(0.0, 1.0, 0.0), c));
        let c = FeatureChoice {
            id: ClauseId(1),
            side: Choice::Right,
        };
        assert!(f.push(v(0.0, 1.0, 0.0), c));
        // The epsilon list stays deduplicated
        assert!(f.has_epsilon(ClauseId(0)));
        assert!(f.has_epsilon(ClauseId(1)));
        assert_eq!(f.choices().len(), 2);
    }

    #[test]
    fn test_tetrahedron() {
        // Four directions surrounding the origin have no common cone
        let mut f = Feature::new();
        let dirs = [
            v(1.0, 1.0, 1.0),
            v(-1.0, -1.0, 1.0),
            v(-1.0, 1.0, -1.0),
        ];
        for (i, e) in dirs.into_iter().enumerate() {
            let c = FeatureChoice {
                id: ClauseId(i as u32),
                side: Choice::Left,
            };
            assert!(f.push(e, c), "failed to push direction {i}");
        }
        assert!(!f.is_compatible(v(1.0, -1.0, -1.0)));
        assert!(f.is_compatible(v(-1.0, 1.0, 1.0)));
    }
}
