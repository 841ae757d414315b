use crate::eval::Choice;
use std::f64::consts::{PI, TAU};

/// Stores a range, with conservative calculations to guarantee that it always
/// contains the actual value.
///
/// Bounds may be infinite, but are never NaN: any operation that leaves its
/// domain (square root of a negative range, division by a range containing
/// zero, etc) widens to [`Interval::EVERYTHING`] instead.
///
/// # Warning
/// This implementation does not set rounding modes, so it may not be _perfect_.
#[derive(Copy, Clone, PartialEq)]
pub struct Interval {
    lower: f64,
    upper: f64,
}

impl std::fmt::Debug for Interval {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> Result<(), std::fmt::Error> {
        f.debug_tuple("")
            .field(&self.lower)
            .field(&self.upper)
            .finish()
    }
}

impl Interval {
    /// The interval `[-inf, +inf]`, which contains every real value
    ///
    /// This is also the result of any operation evaluated outside of its
    /// domain, standing in for a NaN in scalar arithmetic.
    pub const EVERYTHING: Interval = Interval {
        lower: f64::NEG_INFINITY,
        upper: f64::INFINITY,
    };

    /// Builds a new interval
    ///
    /// Invalid bound pairs (NaN, or `lower > upper`) are mapped to
    /// [`Interval::EVERYTHING`], keeping every interval sound.
    #[inline]
    pub fn new(lower: f64, upper: f64) -> Self {
        if lower <= upper {
            Self { lower, upper }
        } else {
            Self::EVERYTHING
        }
    }
    /// Returns the lower bound of the interval
    #[inline]
    pub fn lower(&self) -> f64 {
        self.lower
    }
    /// Returns the upper bound of the interval
    #[inline]
    pub fn upper(&self) -> f64 {
        self.upper
    }
    /// Checks whether the given value is contained in the interval
    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        v >= self.lower && v <= self.upper
    }
    /// Checks whether either bound is infinite
    #[inline]
    pub fn has_inf(&self) -> bool {
        self.lower.is_infinite() || self.upper.is_infinite()
    }
    /// Calculates the absolute value of the interval
    #[inline]
    pub fn abs(self) -> Self {
        if self.lower < 0.0 {
            if self.upper > 0.0 {
                Interval::new(0.0, self.upper.max(-self.lower))
            } else {
                Interval::new(-self.upper, -self.lower)
            }
        } else {
            self
        }
    }
    /// Squares the interval
    ///
    /// Note that this has tighter bounds than multiplication, because we know
    /// that both sides of the multiplication are the same value.
    #[inline]
    pub fn square(self) -> Self {
        if self.upper < 0.0 {
            Interval::new(self.upper * self.upper, self.lower * self.lower)
        } else if self.lower > 0.0 {
            Interval::new(self.lower * self.lower, self.upper * self.upper)
        } else {
            let m = self.lower.abs().max(self.upper.abs());
            Interval::new(0.0, m * m)
        }
    }
    /// Calculates the square root of the interval
    ///
    /// A range extending below zero widens to [`Interval::EVERYTHING`].
    #[inline]
    pub fn sqrt(self) -> Self {
        if self.lower < 0.0 {
            Self::EVERYTHING
        } else {
            Interval::new(self.lower.sqrt(), self.upper.sqrt())
        }
    }
    /// Checks whether `offset + TAU * k` lands in the interval for some
    /// integer `k`, i.e. whether a periodic extremum is contained
    #[inline]
    fn contains_extremum(self, offset: f64) -> bool {
        ((self.lower - offset) / TAU).ceil() * TAU + offset <= self.upper
    }
    /// Computes the cosine of the interval
    #[inline]
    pub fn cos(self) -> Self {
        if self.width() >= TAU || self.has_inf() {
            Interval::new(-1.0, 1.0)
        } else {
            let a = self.lower.cos();
            let b = self.upper.cos();
            let mut lower = a.min(b);
            let mut upper = a.max(b);
            // cos peaks at 2*pi*k and bottoms out at pi + 2*pi*k
            if self.contains_extremum(0.0) {
                upper = 1.0;
            }
            if self.contains_extremum(PI) {
                lower = -1.0;
            }
            Interval::new(lower, upper)
        }
    }
    /// Computes the sine of the interval
    #[inline]
    pub fn sin(self) -> Self {
        if self.width() >= TAU || self.has_inf() {
            Interval::new(-1.0, 1.0)
        } else {
            let a = self.lower.sin();
            let b = self.upper.sin();
            let mut lower = a.min(b);
            let mut upper = a.max(b);
            if self.contains_extremum(PI / 2.0) {
                upper = 1.0;
            }
            if self.contains_extremum(-PI / 2.0) {
                lower = -1.0;
            }
            Interval::new(lower, upper)
        }
    }
    /// Computes the tangent of the interval
    ///
    /// Widens to [`Interval::EVERYTHING`] if the range crosses a pole
    #[inline]
    pub fn tan(self) -> Self {
        if self.width() >= PI || self.has_inf() {
            Self::EVERYTHING
        } else {
            let lower = self.lower.tan();
            let upper = self.upper.tan();
            if upper >= lower {
                Interval::new(lower, upper)
            } else {
                Self::EVERYTHING
            }
        }
    }
    /// Computes the arcsine of the interval
    ///
    /// Widens to [`Interval::EVERYTHING`] if the input leaves `[-1, 1]`
    #[inline]
    pub fn asin(self) -> Self {
        if self.lower < -1.0 || self.upper > 1.0 {
            Self::EVERYTHING
        } else {
            Interval::new(self.lower.asin(), self.upper.asin())
        }
    }
    /// Computes the arccosine of the interval
    ///
    /// Widens to [`Interval::EVERYTHING`] if the input leaves `[-1, 1]`
    #[inline]
    pub fn acos(self) -> Self {
        if self.lower < -1.0 || self.upper > 1.0 {
            Self::EVERYTHING
        } else {
            Interval::new(self.upper.acos(), self.lower.acos())
        }
    }
    /// Computes the arctangent of the interval
    #[inline]
    pub fn atan(self) -> Self {
        Interval::new(self.lower.atan(), self.upper.atan())
    }
    /// Computes the exponent function applied to the interval
    #[inline]
    pub fn exp(self) -> Self {
        Interval::new(self.lower.exp(), self.upper.exp())
    }

    /// Raises the interval to the given power
    ///
    /// Integral exponents are handled for any base; non-integral or ranged
    /// exponents require a strictly positive base, and otherwise widen to
    /// [`Interval::EVERYTHING`].
    pub fn pow(self, rhs: Self) -> Self {
        if rhs.lower == rhs.upper && rhs.lower.fract() == 0.0 {
            let k = rhs.lower;
            if k == 0.0 {
                return 1.0.into();
            }
            let a = self.lower.powf(k);
            let b = self.upper.powf(k);
            let even = (k as i64) % 2 == 0;
            let out = if even {
                // even powers behave like square: non-monotonic across 0
                if self.contains(0.0) {
                    if k > 0.0 {
                        Interval::new(0.0, a.max(b))
                    } else {
                        return Self::EVERYTHING;
                    }
                } else {
                    Interval::new(a.min(b), a.max(b))
                }
            } else if k > 0.0 {
                Interval::new(a, b)
            } else if self.contains(0.0) {
                return Self::EVERYTHING;
            } else {
                Interval::new(b, a)
            };
            out
        } else if self.lower > 0.0 {
            // monotonic in both arguments over a positive base; check the
            // four corners
            let mut lower = f64::INFINITY;
            let mut upper = f64::NEG_INFINITY;
            for a in [self.lower, self.upper] {
                for b in [rhs.lower, rhs.upper] {
                    let v = a.powf(b);
                    lower = lower.min(v);
                    upper = upper.max(v);
                }
            }
            Interval::new(lower, upper)
        } else {
            Self::EVERYTHING
        }
    }

    /// Takes the `rhs`-th root of the interval
    ///
    /// Odd roots are defined over all reals; even roots of a range extending
    /// below zero widen to [`Interval::EVERYTHING`].
    pub fn nth_root(self, rhs: Self) -> Self {
        if rhs.lower != rhs.upper || rhs.lower.fract() != 0.0 {
            return Self::EVERYTHING;
        }
        let n = rhs.lower;
        let odd = (n as i64) % 2 != 0;
        if !odd && self.lower < 0.0 {
            Self::EVERYTHING
        } else {
            Interval::new(
                crate::context::nth_root(self.lower, n),
                crate::context::nth_root(self.upper, n),
            )
        }
    }

    /// Calculates the minimum of two intervals
    ///
    /// Returns both the result and a [`Choice`] indicating whether one side is
    /// always less than the other.
    #[inline]
    pub fn min_choice(self, rhs: Self) -> (Self, Choice) {
        let choice = if self.upper < rhs.lower {
            Choice::Left
        } else if rhs.upper < self.lower {
            Choice::Right
        } else {
            Choice::Both
        };
        (
            Interval::new(self.lower.min(rhs.lower), self.upper.min(rhs.upper)),
            choice,
        )
    }
    /// Calculates the maximum of two intervals
    ///
    /// Returns both the result and a [`Choice`] indicating whether one side is
    /// always greater than the other.
    #[inline]
    pub fn max_choice(self, rhs: Self) -> (Self, Choice) {
        let choice = if self.lower > rhs.upper {
            Choice::Left
        } else if rhs.lower > self.upper {
            Choice::Right
        } else {
            Choice::Both
        };
        (
            Interval::new(self.lower.max(rhs.lower), self.upper.max(rhs.upper)),
            choice,
        )
    }

    /// Least non-negative remainder
    ///
    /// A divisor range containing zero widens to [`Interval::EVERYTHING`].
    #[inline]
    pub fn rem_euclid(self, rhs: Interval) -> Self {
        if rhs.contains(0.0) || rhs.has_inf() {
            Self::EVERYTHING
        } else if rhs.lower == rhs.upper && rhs.lower > 0.0 {
            let a = self.lower / rhs.lower;
            let b = self.upper / rhs.lower;
            if a != a.floor() && a.floor() == b.floor() {
                // no wraparound within the range
                Interval::new(
                    self.lower.rem_euclid(rhs.lower),
                    self.upper.rem_euclid(rhs.lower),
                )
            } else {
                Interval::new(0.0, rhs.abs().upper())
            }
        } else {
            Interval::new(0.0, rhs.abs().upper())
        }
    }

    /// Four-quadrant arctangent
    pub fn atan2(self, x: Self) -> Self {
        let y = self;
        // Check whether we span the branch cut
        if y.lower <= 0.0 && y.upper >= 0.0 && x.lower < 0.0 {
            Interval::new(-PI, PI)
        } else {
            // Otherwise, do quadrant-by-quadrant evaluation
            let mut lower = f64::INFINITY;
            let mut upper = f64::NEG_INFINITY;
            let mut update = |y: f64, x: f64| {
                let v = y.atan2(x);
                lower = lower.min(v);
                upper = upper.max(v);
            };

            // Quadrant-by-quadrant cases, which lets us only pay for two
            // atan2 evaluations
            if y.lower >= 0.0 {
                if x.lower >= 0.0 {
                    // Upper right
                    update(y.upper, x.lower);
                    update(y.lower, x.upper);
                } else if x.upper <= 0.0 {
                    // Upper left
                    update(y.lower, x.lower);
                    update(y.upper, x.upper);
                } else {
                    // Upper both
                    update(y.lower, x.lower);
                    update(y.lower, x.upper);
                }
            } else if y.upper <= 0.0 {
                if x.lower >= 0.0 {
                    // Lower right
                    update(y.lower, x.lower);
                    update(y.upper, x.upper);
                } else if x.upper <= 0.0 {
                    // Lower left
                    update(y.upper, x.lower);
                    update(y.lower, x.upper);
                } else {
                    // Lower both
                    update(y.upper, x.lower);
                    update(y.upper, x.upper);
                }
            } else {
                // Right both
                update(y.lower, x.lower);
                update(y.upper, x.lower);
            }
            Interval::new(lower, upper)
        }
    }

    /// Returns the midpoint of the interval
    #[inline]
    pub fn midpoint(self) -> f64 {
        (self.lower + self.upper) / 2.0
    }

    /// Splits the interval at the midpoint
    ///
    /// ```
    /// # use levelset::types::Interval;
    /// let a = Interval::new(0.0, 1.0);
    /// let (lo, hi) = a.split();
    /// assert_eq!(lo, Interval::new(0.0, 0.5));
    /// assert_eq!(hi, Interval::new(0.5, 1.0));
    /// ```
    #[inline]
    pub fn split(self) -> (Self, Self) {
        let mid = self.midpoint();
        (
            Interval::new(self.lower, mid),
            Interval::new(mid, self.upper),
        )
    }

    /// Linear interpolation from `lower` to `upper`
    #[inline]
    pub fn lerp(self, frac: f64) -> f64 {
        self.lower * (1.0 - frac) + self.upper * frac
    }

    /// Calculates the width of the interval
    #[inline]
    pub fn width(self) -> f64 {
        self.upper - self.lower
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.lower, self.upper)
    }
}

impl From<[f64; 2]> for Interval {
    #[inline]
    fn from(i: [f64; 2]) -> Interval {
        Interval::new(i[0], i[1])
    }
}

impl From<f64> for Interval {
    #[inline]
    fn from(f: f64) -> Self {
        Interval::new(f, f)
    }
}

impl std::ops::Add<Interval> for Interval {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Interval::new(self.lower + rhs.lower, self.upper + rhs.upper)
    }
}

impl std::ops::Mul<Interval> for Interval {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        let mut lower = f64::INFINITY;
        let mut upper = f64::NEG_INFINITY;
        for i in [self.lower, self.upper] {
            for j in [rhs.lower, rhs.upper] {
                let v = i * j;
                // 0 * inf is NaN; f64::min/max ignore those corners
                lower = lower.min(v);
                upper = upper.max(v);
            }
        }
        Interval::new(lower, upper)
    }
}

impl std::ops::Div<Interval> for Interval {
    type Output = Self;

    #[inline]
    fn div(self, rhs: Self) -> Self {
        if rhs.lower > 0.0 || rhs.upper < 0.0 {
            let mut lower = f64::INFINITY;
            let mut upper = f64::NEG_INFINITY;
            for i in [self.lower, self.upper] {
                for j in [rhs.lower, rhs.upper] {
                    let v = i / j;
                    lower = lower.min(v);
                    upper = upper.max(v);
                }
            }
            Interval::new(lower, upper)
        } else {
            Self::EVERYTHING
        }
    }
}

impl std::ops::Sub<Interval> for Interval {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Interval::new(self.lower - rhs.upper, self.upper - rhs.lower)
    }
}

impl std::ops::Neg for Interval {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Interval::new(-self.upper, -self.lower)
    }
}
