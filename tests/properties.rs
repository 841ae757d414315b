use levelset::{
    context::{Context, Node},
    eval::Evaluator,
};

use nalgebra::Vector3;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// A moderately nasty expression mixing every specialization-relevant op:
/// `min(max(sqrt(x^2 + y^2) - 1, -z), sin(x) * cos(y) + z / 2)`
fn build(ctx: &mut Context) -> Node {
    let x = ctx.x();
    let y = ctx.y();
    let z = ctx.z();
    let x2 = ctx.square(x).unwrap();
    let y2 = ctx.square(y).unwrap();
    let r2 = ctx.add(x2, y2).unwrap();
    let r = ctx.sqrt(r2).unwrap();
    let ring = ctx.sub(r, 1.0).unwrap();
    let nz = ctx.neg(z).unwrap();
    let upper = ctx.max(ring, nz).unwrap();

    let sx = ctx.sin(x).unwrap();
    let cy = ctx.cos(y).unwrap();
    let wave = ctx.mul(sx, cy).unwrap();
    let z2 = ctx.div(z, 2.0).unwrap();
    let lower = ctx.add(wave, z2).unwrap();

    ctx.min(upper, lower).unwrap()
}

#[test]
fn interval_bounds_contain_sampled_values() {
    let mut ctx = Context::new();
    let root = build(&mut ctx);
    let mut e = Evaluator::new(&ctx, root).unwrap();
    let mut rng = StdRng::seed_from_u64(0x1234);

    for _ in 0..100 {
        let lo = Vector3::new(
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
        );
        let size = rng.gen_range(0.01..2.0);
        let hi = lo.add_scalar(size);

        let i = e.eval_interval(lo, hi);
        for _ in 0..20 {
            let p = Vector3::new(
                rng.gen_range(lo.x..hi.x),
                rng.gen_range(lo.y..hi.y),
                rng.gen_range(lo.z..hi.z),
            );
            let v = e.eval(p);
            assert!(
                v >= i.lower() && v <= i.upper(),
                "value {v} at {p:?} escapes {i:?} over [{lo:?}, {hi:?}]"
            );
        }
    }
}

#[test]
fn push_is_consistent_with_full_evaluation() {
    let mut ctx = Context::new();
    let root = build(&mut ctx);
    let mut e = Evaluator::new(&ctx, root).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5678);

    for _ in 0..50 {
        let lo = Vector3::new(
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
        );
        let hi = lo.add_scalar(rng.gen_range(0.01..1.0));

        e.eval_interval(lo, hi);
        e.push();
        for _ in 0..10 {
            let p = Vector3::new(
                rng.gen_range(lo.x..hi.x),
                rng.gen_range(lo.y..hi.y),
                rng.gen_range(lo.z..hi.z),
            );
            let narrowed = e.eval(p);
            e.pop();
            let full = e.eval(p);
            e.push();
            assert_eq!(
                narrowed, full,
                "specialized tape disagrees at {p:?} over [{lo:?}, {hi:?}]"
            );
        }
        e.pop();
        assert_eq!(e.utilization(), 1.0);
    }
}

#[test]
fn derivs_match_central_differences() {
    let mut ctx = Context::new();
    let root = build(&mut ctx);
    let mut e = Evaluator::new(&ctx, root).unwrap();
    let mut rng = StdRng::seed_from_u64(0x9abc);
    const H: f64 = 1e-5;

    let mut checked = 0;
    while checked < 50 {
        let p = Vector3::new(
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
        );
        // Skip points near a min/max crossover, where the one-sided
        // derivative and the central difference legitimately differ
        if e.is_ambiguous(p) {
            continue;
        }
        e.set(p, 0);
        let d = e.derivs(1);
        let (v, dx, dy, dz) = (d.v[0], d.dx[0], d.dy[0], d.dz[0]);

        let mut ok = true;
        for (axis, expected) in [dx, dy, dz].into_iter().enumerate() {
            let mut dp = Vector3::zeros();
            dp[axis] = H;
            let plus = e.eval(p + dp);
            let minus = e.eval(p - dp);
            // A kink between p - h and p + h invalidates the estimate
            if (plus - v).abs() > 1e-2 || (minus - v).abs() > 1e-2 {
                ok = false;
                break;
            }
            let est = (plus - minus) / (2.0 * H);
            if (est - expected).abs() > 1e-4 * (1.0 + expected.abs()) {
                panic!(
                    "derivative mismatch on axis {axis} at {p:?}: \
                     {expected} vs {est}"
                );
            }
        }
        if ok {
            checked += 1;
        }
    }
}

#[test]
fn values_match_reference_evaluator() {
    let mut ctx = Context::new();
    let root = build(&mut ctx);
    let mut e = Evaluator::new(&ctx, root).unwrap();
    let mut rng = StdRng::seed_from_u64(0xdef0);

    for _ in 0..200 {
        let (x, y, z) = (
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
            rng.gen_range(-2.0..2.0),
        );
        let expected = ctx.eval_xyz(root, x, y, z).unwrap();
        let got = e.eval(Vector3::new(x, y, z));
        assert_eq!(got, expected, "mismatch at ({x}, {y}, {z})");
    }
}
