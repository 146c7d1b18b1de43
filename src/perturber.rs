//! Perturber (C7 support): the external influences felt by a group's AR integration.
//!
//! Dispatched over a closed enum with `enum_dispatch`, mirroring the `SubgridEnum` pattern used
//! throughout the teacher crate for trait-over-enum dispatch without a vtable.

use crate::binary_tree::BinaryTreeNode;
use crate::force_correction::SoftNeighbor;
use crate::tidal::TidalTensor;
use enum_dispatch::enum_dispatch;
use nalgebra::Vector3;

/// Contract every perturber variant implements.
#[enum_dispatch]
pub trait SoftPert {
    /// The minimum ratio of perturbing to internal acceleration sampled over the group's
    /// Keplerian orbit (`calcSoftPertMin`). Drives the permissible slow-down factor: a smaller
    /// ratio (weaker perturbation) allows a larger `kappa`.
    fn calc_soft_pert_min(&self, binary: &BinaryTreeNode, cm_mass: f64, g: f64) -> f64;

    /// The perturbing acceleration at the group's current CM-relative configuration, evaluated at
    /// member offset `dr` from the CM.
    fn perturbing_acc(&self, dr: Vector3<f64>) -> Vector3<f64>;
}

/// No external perturbation; `calc_soft_pert_min` returns `+inf` (unboundedly large permissible
/// slow-down).
#[derive(Clone, Copy, Debug, Default)]
pub struct NonePert;

impl SoftPert for NonePert {
    fn calc_soft_pert_min(&self, _binary: &BinaryTreeNode, _cm_mass: f64, _g: f64) -> f64 {
        f64::INFINITY
    }

    fn perturbing_acc(&self, _dr: Vector3<f64>) -> Vector3<f64> {
        Vector3::zeros()
    }
}

/// Only the fitted external tidal tensor perturbs the group.
#[derive(Clone, Copy, Debug)]
pub struct TidalPert {
    /// The group's fitted tidal tensor.
    pub tensor: TidalTensor,
}

impl SoftPert for TidalPert {
    fn calc_soft_pert_min(&self, binary: &BinaryTreeNode, cm_mass: f64, g: f64) -> f64 {
        min_perturbation_ratio_over_orbit(binary, cm_mass, g, |dr| self.tensor.eval(dr))
    }

    fn perturbing_acc(&self, dr: Vector3<f64>) -> Vector3<f64> {
        self.tensor.eval(dr)
    }
}

/// The tidal tensor plus a fixed snapshot of nearby Hermite-level neighbors, sampled once per
/// Hermite substep and held constant across the AR sub-steps within it.
#[derive(Clone, Debug)]
pub struct TidalAndNeighborsPert {
    /// The group's fitted tidal tensor.
    pub tensor: TidalTensor,
    /// Position of the group's CM, used to turn neighbor absolute positions into CM-relative
    /// ones for the tidal-plus-neighbor acceleration evaluation.
    pub cm_pos: Vector3<f64>,
    /// Nearby particles from the outer Hermite integrator's neighbor list.
    pub neighbors: Vec<SoftNeighbor>,
    /// Softening length squared.
    pub eps_sq: f64,
    /// Gravitational constant.
    pub g: f64,
}

impl TidalAndNeighborsPert {
    fn neighbor_acc(&self, dr: Vector3<f64>) -> Vector3<f64> {
        let pos = self.cm_pos + dr;
        self.neighbors
            .iter()
            .map(|n| {
                let sep = pos - n.pos;
                let r2 = sep.norm_squared() + self.eps_sq;
                if r2 <= 0.0 {
                    return Vector3::zeros();
                }
                let r = r2.sqrt();
                -self.g * n.mass * sep / (r2 * r)
            })
            .sum()
    }
}

impl SoftPert for TidalAndNeighborsPert {
    fn calc_soft_pert_min(&self, binary: &BinaryTreeNode, cm_mass: f64, g: f64) -> f64 {
        min_perturbation_ratio_over_orbit(binary, cm_mass, g, |dr| {
            self.tensor.eval(dr) + self.neighbor_acc(dr)
        })
    }

    fn perturbing_acc(&self, dr: Vector3<f64>) -> Vector3<f64> {
        self.tensor.eval(dr) + self.neighbor_acc(dr)
    }
}

/// The perturbation felt by one group's AR integration.
#[enum_dispatch(SoftPert)]
#[derive(Clone, Debug)]
pub enum Perturber {
    /// No external perturbation.
    NonePert,
    /// Tidal tensor only.
    TidalPert,
    /// Tidal tensor plus a Hermite-level neighbor snapshot.
    TidalAndNeighborsPert,
}

/// Samples the ratio of perturbing to internal (two-body) acceleration at `n_sample` evenly
/// spaced true anomalies around the binary's orbit and returns the minimum, the conservative
/// bound `calcSoftPertMin` uses to size the permissible slow-down factor.
fn min_perturbation_ratio_over_orbit(
    binary: &BinaryTreeNode,
    cm_mass: f64,
    g: f64,
    perturbing_acc: impl Fn(Vector3<f64>) -> Vector3<f64>,
) -> f64 {
    const N_SAMPLE: usize = 16;
    let mu_internal = g * cm_mass;

    let mut min_ratio = f64::INFINITY;
    for k in 0..N_SAMPLE {
        let f = 2.0 * std::f64::consts::PI * (k as f64) / (N_SAMPLE as f64);
        let (rel_pos, _) = binary.relative_state_at_true_anomaly(f);
        let r = rel_pos.norm();
        if r <= 0.0 {
            continue;
        }
        let internal_acc = mu_internal / (r * r);
        let external_acc = perturbing_acc(0.5 * rel_pos).norm();
        let ratio = external_acc / internal_acc;
        if ratio < min_ratio {
            min_ratio = ratio;
        }
    }
    min_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn circular_binary() -> BinaryTreeNode {
        use crate::binary_tree::BinaryTree;
        let g = 1.0;
        let m = 0.5;
        let r = 1.0;
        let v = (g * 2.0 * m / r).sqrt() / 2.0;
        let masses = vec![m, m];
        let positions = vec![Vector3::new(0.5, 0.0, 0.0), Vector3::new(-0.5, 0.0, 0.0)];
        let velocities = vec![Vector3::new(0.0, v, 0.0), Vector3::new(0.0, -v, 0.0)];
        BinaryTree::build(&masses, &positions, &velocities, g).unwrap().root
    }

    #[test]
    fn none_pert_has_infinite_soft_pert_min() {
        let pert: Perturber = NonePert.into();
        let binary = circular_binary();
        assert_eq!(pert.calc_soft_pert_min(&binary, 1.0, 1.0), f64::INFINITY);
        assert_eq!(pert.perturbing_acc(Vector3::zeros()), Vector3::zeros());
    }

    #[test]
    fn tidal_pert_gives_finite_ratio_for_nonzero_tensor() {
        use nalgebra::Matrix3;
        let pert: Perturber = TidalPert {
            tensor: TidalTensor {
                tensor: Matrix3::from_diagonal_element(0.01),
            },
        }
        .into();
        let binary = circular_binary();
        let ratio = pert.calc_soft_pert_min(&binary, 1.0, 1.0);
        assert!(ratio.is_finite());
        assert!(ratio > 0.0);
    }
}
