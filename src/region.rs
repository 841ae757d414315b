//! Discretization of axis-aligned regions into sample grids
use crate::types::Interval;

/// A single discretized axis: bounds plus sorted sample centers
///
/// Sample spacing is `1 / res`; the bounds are expanded outward as needed so
/// that their length is an integer multiple of the spacing.
#[derive(Clone, Debug)]
pub struct Axis {
    pub bounds: Interval,
    pub values: Vec<f64>,
}

impl Axis {
    /// Discretizes `bounds` at the given resolution (samples per unit)
    ///
    /// A degenerate interval or a zero resolution produce a single sample.
    pub fn new(bounds: Interval, res: f64) -> Self {
        if bounds.lower() == bounds.upper() {
            Axis {
                bounds,
                values: vec![bounds.lower()],
            }
        } else if res == 0.0 {
            Axis {
                bounds,
                values: vec![bounds.midpoint()],
            }
        } else {
            let count = ((bounds.width() * res).ceil() as usize).max(1);
            let pad = (count as f64 / res - bounds.width()) / 2.0;
            let lower = bounds.lower() - pad;
            Axis {
                bounds: Interval::new(lower, bounds.upper() + pad),
                values: (0..count)
                    .map(|i| lower + (i as f64 + 0.5) / res)
                    .collect(),
            }
        }
    }

    /// Expands the axis outward to exactly `count` samples
    ///
    /// Padding is split evenly between the two sides (favoring the upper side
    /// when odd), so the original bounds stay contained.
    fn expand_to(&self, count: usize, res: f64) -> Self {
        let size = self.values.len();
        if size >= count || size == 1 {
            return self.clone();
        }
        let extra = count - size;
        let lo = extra / 2;
        let lower = self.bounds.lower() - lo as f64 / res;
        let upper = self.bounds.upper() + (extra - lo) as f64 / res;
        Axis {
            bounds: Interval::new(lower, upper),
            values: (0..count)
                .map(|i| lower + (i as f64 + 0.5) / res)
                .collect(),
        }
    }
}

/// An axis-aligned sample region: three discretized axes at a shared
/// resolution
#[derive(Clone, Debug)]
pub struct Region {
    pub x: Axis,
    pub y: Axis,
    pub z: Axis,
    pub res: f64,
}

impl Region {
    /// Builds a region over the given bounds at `res` samples per unit
    pub fn new(
        x: impl Into<Interval>,
        y: impl Into<Interval>,
        z: impl Into<Interval>,
        res: f64,
    ) -> Self {
        Region {
            x: Axis::new(x.into(), res),
            y: Axis::new(y.into(), res),
            z: Axis::new(z.into(), res),
            res,
        }
    }

    /// Returns a region whose first `dims` axes share a power-of-two sample
    /// count, expanded outward to preserve containment
    ///
    /// The target count is the next power of two at or above the largest of
    /// the affected axes; axes with a single sample (and axes beyond `dims`)
    /// are left untouched.  Octree subdivision relies on this to halve cells
    /// evenly all the way down.
    pub fn power_of_two(&self, dims: usize) -> Self {
        let axes = [&self.x, &self.y, &self.z];
        let count = axes
            .iter()
            .take(dims)
            .map(|a| a.values.len())
            .max()
            .unwrap_or(1)
            .next_power_of_two();

        let expand = |i: usize, a: &Axis| {
            if i < dims {
                a.expand_to(count, self.res)
            } else {
                a.clone()
            }
        };
        Region {
            x: expand(0, &self.x),
            y: expand(1, &self.y),
            z: expand(2, &self.z),
            res: self.res,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_axis_construction() {
        let da = Axis::new(Interval::new(0.0, 1.0), 1.0);
        assert_eq!(da.values.len(), 1);

        let db = Axis::new(Interval::new(0.0, 1.0), 10.0);
        assert_eq!(db.values.len(), 10);

        let dc = Axis::new(Interval::new(0.0, 0.0), 1.0);
        assert_eq!(dc.values.len(), 1);

        let dd = Axis::new(Interval::new(-1.0, 1.0), 0.0);
        assert_eq!(dd.values.len(), 1);

        // Expanding interval
        let de = Axis::new(Interval::new(0.0, 1.1), 1.0);
        assert_eq!(de.values.len(), 2);
    }

    #[test]
    fn test_axis_values() {
        let da = Axis::new(Interval::new(0.0, 1.0), 1.0);
        assert_eq!(da.values[0], 0.5);

        let db = Axis::new(Interval::new(-0.5, 0.5), 3.0);
        assert_eq!(db.values[1], 0.0);

        let dc = Axis::new(Interval::new(-1.0, 1.0), 0.0);
        assert_eq!(dc.values[0], 0.0);
    }

    #[test]
    fn test_axis_expansion() {
        let da = Axis::new(Interval::new(0.0, 1.2), 1.0);
        assert!((da.bounds.lower() - -0.4).abs() < 1e-9);
        assert!((da.bounds.upper() - 1.6).abs() < 1e-9);
        assert!((da.values[0] - 0.1).abs() < 1e-9);
        assert!((da.values[1] - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_region_resolution() {
        let r = Region::new([0.0, 10.0], [0.0, 5.0], [0.0, 2.5], 10.0);
        assert_eq!(r.x.values.len(), 100);
        assert_eq!(r.y.values.len(), 50);
        assert_eq!(r.z.values.len(), 25);
    }

    #[test]
    fn test_power_of_two_cube() {
        let r = Region::new([0.0, 10.0], [0.0, 5.0], [0.0, 2.5], 10.0);
        let p = r.power_of_two(3);

        assert_eq!(p.x.values.len(), 128);
        assert_eq!(p.y.values.len(), 128);
        assert_eq!(p.z.values.len(), 128);

        assert!(p.x.bounds.lower() <= r.x.bounds.lower());
        assert!(p.x.bounds.upper() >= r.x.bounds.upper());
        assert!(p.y.bounds.lower() <= r.y.bounds.lower());
        assert!(p.y.bounds.upper() >= r.y.bounds.upper());
        assert!(p.z.bounds.lower() <= r.z.bounds.lower());
        assert!(p.z.bounds.upper() >= r.z.bounds.upper());
    }

    #[test]
    fn test_power_of_two_square() {
        let r = Region::new([0.0, 10.0], [0.0, 5.0], [0.0, 0.0], 10.0);
        let p = r.power_of_two(2);

        assert_eq!(p.x.values.len(), 128);
        assert_eq!(p.y.values.len(), 128);
        assert_eq!(p.z.values.len(), 1);

        assert!(p.x.bounds.lower() <= r.x.bounds.lower());
        assert!(p.x.bounds.upper() >= r.x.bounds.upper());
        assert!(p.y.bounds.lower() <= r.y.bounds.lower());
        assert!(p.y.bounds.upper() >= r.y.bounds.upper());
        assert_eq!(p.z.bounds.lower(), r.z.bounds.lower());
        assert_eq!(p.z.bounds.upper(), r.z.bounds.upper());
    }
}
