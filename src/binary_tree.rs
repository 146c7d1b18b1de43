//! Hierarchical binary-tree construction for a bound group (used by C4's orbital-probe
//! placement and C7's AR integrator).
//!
//! Members are paired bottom-up by most-negative two-body specific binding energy, mirroring the
//! greedy nearest-neighbor agglomeration the source performs when building its `ARC::chain`
//! binary tree. Each internal node carries the reduced two-body Kepler elements of its two
//! children's relative orbit.

use crate::error::{Error, Result};
use nalgebra::Vector3;

/// Multiplier applied to the apocentre distance to obtain [`BinaryTreeNode::break_radius`].
const BREAK_RADIUS_FACTOR: f64 = 2.0;

/// A leaf (single original member) or an internal two-body node of the tree.
#[derive(Clone, Debug)]
pub enum Child {
    /// Index into the group's member slice.
    Leaf(usize),
    /// A nested pairing.
    Node(Box<BinaryTreeNode>),
}

/// An internal node of a group's binary tree: the reduced two-body orbit of its two children.
#[derive(Clone, Debug)]
pub struct BinaryTreeNode {
    /// Total mass of the subtree.
    pub mass: f64,
    /// Mass-weighted centre-of-mass position of the subtree.
    pub pos: Vector3<f64>,
    /// Mass-weighted centre-of-mass velocity of the subtree.
    pub vel: Vector3<f64>,
    /// Semi-major axis of the relative orbit between the two children.
    pub semi: f64,
    /// Eccentricity of the relative orbit.
    pub ecc: f64,
    /// Orbital period (only meaningful for bound, `semi > 0` orbits).
    pub period: f64,
    /// Outer radius beyond which this pair is considered to have unbound.
    pub break_radius: f64,
    /// `g * mass`, the two-body gravitational parameter of the relative orbit.
    pub mu: f64,
    /// Relative position of the first child minus the second, at construction time.
    pub rel_pos: Vector3<f64>,
    /// Relative velocity of the first child minus the second, at construction time.
    pub rel_vel: Vector3<f64>,
    /// First child.
    pub left: Child,
    /// Second child.
    pub right: Child,
}

impl BinaryTreeNode {
    /// Whether the relative orbit between the two children is gravitationally bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.semi > 0.0 && self.ecc < 1.0
    }

    /// The orbital-plane basis `(e_hat, p_hat)`: `e_hat` points toward periapsis, `p_hat` is
    /// perpendicular to it in the orbital plane, 90 degrees ahead. Falls back to an arbitrary
    /// in-plane direction for a near-circular orbit, where the eccentricity vector is ill-defined.
    #[must_use]
    pub fn orbital_frame(&self) -> (Vector3<f64>, Vector3<f64>) {
        let h = self.rel_pos.cross(&self.rel_vel);
        let h_hat = if h.norm() > 1e-300 {
            h.normalize()
        } else {
            Vector3::z()
        };

        let r = self.rel_pos.norm();
        let e_vec = if r > 0.0 {
            self.rel_vel.cross(&h) / self.mu - self.rel_pos / r
        } else {
            Vector3::zeros()
        };
        let e_hat = if e_vec.norm() > 1e-12 {
            e_vec.normalize()
        } else {
            // circular orbit: any in-plane direction works, pick one orthogonal to h_hat
            let arbitrary = if h_hat.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
            (arbitrary - h_hat * h_hat.dot(&arbitrary)).normalize()
        };
        let p_hat = h_hat.cross(&e_hat).normalize();
        (e_hat, p_hat)
    }

    /// The relative position and velocity of the two children at true anomaly `f`, computed
    /// from this node's Kepler elements and orbital frame (not its current phase).
    #[must_use]
    pub fn relative_state_at_true_anomaly(&self, f: f64) -> (Vector3<f64>, Vector3<f64>) {
        let (e_hat, p_hat) = self.orbital_frame();
        let mu = self.mu;
        let p = self.semi * (1.0 - self.ecc * self.ecc);
        let r = p / (1.0 + self.ecc * f.cos());

        let pos = (e_hat * f.cos() + p_hat * f.sin()) * r;

        let h = (mu * p).sqrt();
        let v_r = (mu / p).sqrt() * self.ecc * f.sin();
        let v_t = h / r;
        let vel = (e_hat * f.cos() + p_hat * f.sin()) * v_r + (-e_hat * f.sin() + p_hat * f.cos()) * v_t;

        (pos, vel)
    }
}

/// The binary tree of a single bound group.
#[derive(Clone, Debug)]
pub struct BinaryTree {
    /// The root node, whose relative orbit is the "dominant binary" of the group.
    pub root: BinaryTreeNode,
}

impl BinaryTree {
    /// Builds the tree from `n >= 2` members' physical mass, position and velocity.
    pub fn build(masses: &[f64], positions: &[Vector3<f64>], velocities: &[Vector3<f64>], g: f64) -> Result<Self> {
        let n = masses.len();
        if n < 2 || positions.len() != n || velocities.len() != n {
            return Err(Error::InvariantViolation(
                "binary tree construction requires at least 2 members with matching data".to_string(),
            ));
        }

        // Working set of (mass, pos, vel, child) tuples, one per current top-level node.
        let mut pool: Vec<(f64, Vector3<f64>, Vector3<f64>, Child)> = (0..n)
            .map(|i| (masses[i], positions[i], velocities[i], Child::Leaf(i)))
            .collect();

        while pool.len() > 1 {
            let mut best = (0usize, 1usize, f64::INFINITY);
            for a in 0..pool.len() {
                for b in (a + 1)..pool.len() {
                    let energy = specific_binding_energy(&pool[a], &pool[b], g);
                    if energy < best.2 {
                        best = (a, b, energy);
                    }
                }
            }

            let (ia, ib, _) = best;
            // remove the higher index first so the lower index stays valid
            let (mb, pb, vb, cb) = pool.remove(ib);
            let (ma, pa, va, ca) = pool.remove(ia);

            let node = pair_to_node(ma, pa, va, ca, mb, pb, vb, cb, g);
            let mass = node.mass;
            let pos = node.pos;
            let vel = node.vel;
            pool.push((mass, pos, vel, Child::Node(Box::new(node))));
        }

        let (_, _, _, root_child) = pool.into_iter().next().expect("pool has exactly one element");
        match root_child {
            Child::Node(node) => Ok(Self { root: *node }),
            Child::Leaf(_) => unreachable!("n >= 2 guarantees at least one merge"),
        }
    }
}

fn specific_binding_energy(
    a: &(f64, Vector3<f64>, Vector3<f64>, Child),
    b: &(f64, Vector3<f64>, Vector3<f64>, Child),
    g: f64,
) -> f64 {
    let (ma, pa, va, _) = a;
    let (mb, pb, vb, _) = b;
    let dr = pa - pb;
    let dv = va - vb;
    let r = dr.norm();
    0.5 * dv.norm_squared() - g * (ma + mb) / r
}

#[allow(clippy::too_many_arguments)]
fn pair_to_node(
    ma: f64,
    pa: Vector3<f64>,
    va: Vector3<f64>,
    ca: Child,
    mb: f64,
    pb: Vector3<f64>,
    vb: Vector3<f64>,
    cb: Child,
    g: f64,
) -> BinaryTreeNode {
    let mass = ma + mb;
    let pos = (ma * pa + mb * pb) / mass;
    let vel = (ma * va + mb * vb) / mass;

    let dr = pa - pb;
    let dv = va - vb;
    let r = dr.norm();
    let v2 = dv.norm_squared();
    let mu = g * mass;

    let energy = 0.5 * v2 - mu / r;
    let semi = -mu / (2.0 * energy);

    let h = dr.cross(&dv);
    let ecc_vec = dv.cross(&h) / mu - dr / r;
    let ecc = ecc_vec.norm();

    let period = if semi > 0.0 {
        2.0 * std::f64::consts::PI * (semi.powi(3) / mu).sqrt()
    } else {
        f64::INFINITY
    };

    let apocentre = if semi > 0.0 { semi * (1.0 + ecc) } else { r };
    let break_radius = apocentre * BREAK_RADIUS_FACTOR;

    BinaryTreeNode {
        mass,
        pos,
        vel,
        semi,
        ecc,
        period,
        break_radius,
        mu,
        rel_pos: dr,
        rel_vel: dv,
        left: ca,
        right: cb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_binary_has_zero_eccentricity() {
        let g = 1.0;
        let m = 0.5;
        let r = 1.0;
        let v = (g * 2.0 * m / r).sqrt() / 2.0;
        let masses = vec![m, m];
        let positions = vec![Vector3::new(0.5, 0.0, 0.0), Vector3::new(-0.5, 0.0, 0.0)];
        let velocities = vec![Vector3::new(0.0, v, 0.0), Vector3::new(0.0, -v, 0.0)];

        let tree = BinaryTree::build(&masses, &positions, &velocities, g).unwrap();
        assert!(tree.root.ecc < 1e-8);
        assert!(tree.root.is_bound());
        assert!((tree.root.semi - r).abs() < 1e-8);
    }

    #[test]
    fn three_body_builds_nested_tree() {
        let g = 1.0;
        let masses = vec![1.0, 1.0, 0.01];
        let positions = vec![
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(-0.5, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
        ];
        let velocities = vec![Vector3::zeros(); 3];

        let tree = BinaryTree::build(&masses, &positions, &velocities, g).unwrap();
        // the two close, heavy members should be paired first
        let close_pair_is_root_child = matches!(tree.root.left, Child::Node(_))
            || matches!(tree.root.right, Child::Node(_));
        assert!(close_pair_is_root_child);
    }
}
