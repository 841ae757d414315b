//! Corner-mask to patch tables for surface extraction
//!
//! For a cell with `2^N` corners, a *corner mask* records which corners are
//! inside the surface.  Each mask maps to a set of *patches*: oriented loops
//! of sign-changing cell edges, one per connected boundary component.  The
//! tables are precomputed for N = 2 (marching squares) and N = 3 (marching
//! cubes) on first use and shared read-only for the lifetime of the process.
use nalgebra::Vector3;
use once_cell::sync::Lazy;

/// Number of vertices in an N-dimensional cube
pub fn verts(n: usize) -> usize {
    1 << n
}

/// Number of edges in an N-dimensional cube
pub fn edges(n: usize) -> usize {
    n * (1 << (n - 1))
}

/// A directed sign-changing edge, as an (inside, outside) corner pair
pub type Crossing = (u8, u8);

/// Precomputed marching tables for a single dimension
pub struct MarchingTable {
    /// Dimension (2 or 3)
    pub n: usize,

    /// `[mask] -> patches`, where each patch is an oriented loop of directed
    /// crossings (normal pointing toward the outside corners)
    pub verts_to_patches: Vec<Vec<Vec<Crossing>>>,

    /// `[a][b] -> directed edge index` in `0..2 * edges(n)`, or `None` if the
    /// corner pair is not an edge of the cube
    pub verts_to_edge: Vec<Vec<Option<usize>>>,

    /// `[mask][directed edge index] -> patch index` owning that crossing
    pub edge_to_patch: Vec<Vec<Option<usize>>>,
}

/// Returns the shared table for the given dimension
///
/// # Panics
/// If `n` is not 2 or 3
pub fn table(n: usize) -> &'static MarchingTable {
    static TABLE_2: Lazy<MarchingTable> = Lazy::new(|| MarchingTable::build(2));
    static TABLE_3: Lazy<MarchingTable> = Lazy::new(|| MarchingTable::build(3));
    match n {
        2 => &TABLE_2,
        3 => &TABLE_3,
        _ => panic!("no marching table for dimension {n}"),
    }
}

impl MarchingTable {
    fn build(n: usize) -> Self {
        let nv = verts(n);
        let nm = 1 << nv;

        // Undirected edge k gets directed indexes 2k (low -> high corner)
        // and 2k + 1
        let mut verts_to_edge = vec![vec![None; nv]; nv];
        let mut k = 0;
        for a in 0..nv {
            for axis in 0..n {
                let b = a ^ (1 << axis);
                if a < b {
                    verts_to_edge[a][b] = Some(2 * k);
                    verts_to_edge[b][a] = Some(2 * k + 1);
                    k += 1;
                }
            }
        }
        assert_eq!(k, edges(n), "inconsistent edge enumeration");

        let mut verts_to_patches = Vec::with_capacity(nm);
        let mut edge_to_patch = vec![vec![None; 2 * edges(n)]; nm];
        for mask in 0..nm {
            let patches = trace_patches(n, mask);
            for (pi, patch) in patches.iter().enumerate() {
                for &(i, o) in patch {
                    let e = verts_to_edge[i as usize][o as usize]
                        .expect("patch crossing is not a cube edge");
                    assert!(
                        edge_to_patch[mask][e].is_none(),
                        "crossing owned by two patches"
                    );
                    edge_to_patch[mask][e] = Some(pi);
                }
            }
            assert!(patches.len() <= 1 << (n - 1));
            verts_to_patches.push(patches);
        }

        MarchingTable {
            n,
            verts_to_patches,
            verts_to_edge,
            edge_to_patch,
        }
    }
}

/// A cube face holding four corners; `None` fixes nothing (the 2D square)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Face {
    fixed: Option<(usize, usize)>,
}

/// The four corners of a face, in cyclic order
fn face_cycle(n: usize, f: Face) -> [usize; 4] {
    let ((u, v), base) = match f.fixed {
        None => ((0, 1), 0),
        Some((w, bit)) => {
            let mut it = (0..n).filter(|a| *a != w);
            let u = it.next().unwrap();
            let v = it.next().unwrap();
            ((u, v), bit << w)
        }
    };
    let ub = 1 << u;
    let vb = 1 << v;
    [base, base | ub, base | ub | vb, base | vb]
}

/// Faces containing the given edge (one in 2D, two in 3D)
fn edge_faces(n: usize, i: usize, o: usize) -> Vec<Face> {
    let t = (i ^ o).trailing_zeros() as usize;
    if n == 2 {
        vec![Face { fixed: None }]
    } else {
        (0..n)
            .filter(|w| *w != t)
            .map(|w| Face {
                fixed: Some((w, (i >> w) & 1)),
            })
            .collect()
    }
}

/// Given a crossing on a face, returns the next crossing along the contour
///
/// Walks the face's corner cycle from the inside corner away from the outside
/// corner, through inside corners, until the boundary is hit again.
fn next_on_face(n: usize, mask: usize, f: Face, c: Crossing) -> Crossing {
    let cycle = face_cycle(n, f);
    let pos = |x: u8| cycle.iter().position(|c| *c == x as usize).unwrap();
    let pi = pos(c.0);
    let po = pos(c.1);
    let dir = if pi == (po + 1) % 4 { 1 } else { 3 };

    let mut p = pi;
    loop {
        let q = (p + dir) % 4;
        if mask & (1 << cycle[q]) != 0 {
            p = q;
        } else {
            return (cycle[p] as u8, cycle[q] as u8);
        }
    }
}

fn corner_pos(c: u8) -> Vector3<f64> {
    Vector3::new(
        (c & 1) as f64,
        ((c >> 1) & 1) as f64,
        ((c >> 2) & 1) as f64,
    )
}

/// Flips the loop if its winding does not put the normal on the outside
fn orient_loop(n: usize, patch: &mut [Crossing]) {
    let mids: Vec<Vector3<f64>> = patch
        .iter()
        .map(|&(i, o)| (corner_pos(i) + corner_pos(o)) / 2.0)
        .collect();
    let normal = if n == 2 {
        let t = mids[1] - mids[0];
        Vector3::new(t.y, -t.x, 0.0)
    } else {
        // Newell's method over the loop of crossing midpoints
        let mut out = Vector3::zeros();
        for (i, p) in mids.iter().enumerate() {
            out += p.cross(&mids[(i + 1) % mids.len()]);
        }
        out
    };
    let outward: Vector3<f64> = patch
        .iter()
        .map(|&(i, o)| corner_pos(o) - corner_pos(i))
        .sum();
    if normal.dot(&outward) < 0.0 {
        patch.reverse();
    }
}

/// Traces the oriented boundary loops of the given corner mask
fn trace_patches(n: usize, mask: usize) -> Vec<Vec<Crossing>> {
    let nv = verts(n);

    // Every directed (inside, outside) crossing, lowest corners first
    let mut remaining: Vec<Crossing> = vec![];
    for a in 0..nv {
        if mask & (1 << a) == 0 {
            continue;
        }
        for axis in 0..n {
            let b = a ^ (1 << axis);
            if mask & (1 << b) == 0 {
                remaining.push((a as u8, b as u8));
            }
        }
    }

    let mut patches = vec![];
    while let Some(&start) = remaining.first() {
        let mut patch = vec![];
        // Initial face choice is arbitrary; orientation is fixed afterwards
        let mut face = edge_faces(n, start.0 as usize, start.1 as usize)[0];
        let mut cur = start;
        loop {
            patch.push(cur);
            remaining.retain(|c| *c != cur);
            let next = next_on_face(n, mask, face, cur);
            face = edge_faces(n, next.0 as usize, next.1 as usize)
                .into_iter()
                .find(|f| *f != face)
                .unwrap_or(face);
            cur = next;
            if cur == start {
                break;
            }
        }
        orient_loop(n, &mut patch);
        patches.push(patch);
    }
    patches
}
