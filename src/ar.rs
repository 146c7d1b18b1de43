//! AR slow-down integrator (C7): time-transformed symplectic integration of a bound group's
//! members in the CM frame.
//!
//! Grounded on `hard.hpp`'s `SystemHard::driveForOneClusterSingle`/`driveForMultiClusterOneGroup`
//! use of `sym_int.calcDsAndStepOption` / `integrateToTime` / `slowdown.getSlowDownFactor`. The
//! time transformation is Mikkola's logarithmic-Hamiltonian method (`ds = dt * Omega(x)`,
//! `Omega = -U(x)`); the composition scheme uses the standard Yoshida/Suzuki recursive
//! triple-jump construction (`composition_weights`) rather than a hardcoded literature table, so
//! it covers any even order rather than just 6 and 8.

use crate::binary_tree::BinaryTree;
use crate::error::{Error, Result};
use crate::manager::ArManagerConfig;
use crate::perturber::{Perturber, SoftPert};
use nalgebra::Vector3;

/// Whether the most recent `ds` was chosen to land exactly on the target time or picked from the
/// characteristic step size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepMode {
    /// `ds` was shrunk to land exactly on `t_end`.
    Fixed,
    /// `ds` is the unconstrained characteristic step.
    Adaptive,
}

/// Outcome of [`ArIntegrator::integrate_to_time`].
#[derive(Clone, Copy, Debug)]
pub enum StepOutcome {
    /// The group was advanced to the requested time without any member unbinding.
    Reached,
    /// A member crossed the binary tree's break radius; the caller must re-partition the group
    /// (`spec.md` C8 `adjustGroups`).
    Unbound {
        /// Index (into this integrator's member arrays) of the member that crossed.
        crossing_member: usize,
    },
}

/// Builds the recursive Suzuki/Yoshida "triple jump" composition weights for a symmetric
/// splitting scheme of the given even `order >= 2`. Returns substep fractions `c_k` (summing to
/// `1`) such that applying a second-order symmetric base step of size `c_k * ds` for each `k` in
/// turn composes to a scheme accurate to `order`.
#[must_use]
pub fn composition_weights(order: u32) -> Vec<f64> {
    assert!(order >= 2 && order % 2 == 0, "composition order must be even and >= 2");
    fn build(order: u32) -> Vec<f64> {
        if order == 2 {
            return vec![1.0];
        }
        let prev_order = order - 2;
        let prev = build(prev_order);
        let exponent = 1.0 / (prev_order as f64 + 1.0);
        let x1 = 1.0 / (2.0 - 2.0_f64.powf(exponent));
        let x0 = 1.0 - 2.0 * x1;
        let mut weights = Vec::with_capacity(prev.len() * 3);
        weights.extend(prev.iter().map(|c| c * x1));
        weights.extend(prev.iter().map(|c| c * x0));
        weights.extend(prev.iter().map(|c| c * x1));
        weights
    }
    build(order)
}

/// Per-group AR integrator state: member positions/velocities relative to the group's CM, the
/// Kepler slow-down factor, and cumulative slow-down energy bookkeeping.
#[derive(Clone, Debug)]
pub struct ArIntegrator {
    config: ArManagerConfig,
    masses: Vec<f64>,
    /// Positions relative to the group CM.
    pos: Vec<Vector3<f64>>,
    /// Velocities relative to the group CM.
    vel: Vec<Vector3<f64>>,
    cm_mass: f64,
    g: f64,
    /// Integration time (physical, not pseudo-time `s`).
    pub time: f64,
    /// Current Kepler slow-down factor, `kappa >= 1`.
    pub kappa: f64,
    /// The largest slow-down factor the perturbation ratio has permitted so far.
    pub kappa_max_last: f64,
    /// Cumulative slow-down energy bookkeeping jump from `kappa` changes.
    pub de_sd_change_cum: f64,
    step_count: u64,
}

impl ArIntegrator {
    /// Builds an integrator for a group, given each member's absolute mass/position/velocity, the
    /// group's CM position and velocity, and the shared gravitational constant.
    pub fn new(
        masses: &[f64],
        positions_abs: &[Vector3<f64>],
        velocities_abs: &[Vector3<f64>],
        cm_pos: Vector3<f64>,
        cm_vel: Vector3<f64>,
        g: f64,
        config: ArManagerConfig,
    ) -> Result<Self> {
        let n = masses.len();
        if n < 2 || positions_abs.len() != n || velocities_abs.len() != n {
            return Err(Error::InvariantViolation(
                "AR integrator requires at least 2 members with matching data".to_string(),
            ));
        }
        let cm_mass = masses.iter().sum();
        Ok(Self {
            config,
            masses: masses.to_vec(),
            pos: positions_abs.iter().map(|p| p - cm_pos).collect(),
            vel: velocities_abs.iter().map(|v| v - cm_vel).collect(),
            cm_mass,
            g,
            time: 0.0,
            kappa: 1.0,
            kappa_max_last: 1.0,
            de_sd_change_cum: 0.0,
            step_count: 0,
        })
    }

    /// Current member positions, relative to the group CM.
    #[must_use]
    pub fn positions(&self) -> &[Vector3<f64>] {
        &self.pos
    }

    /// Current member velocities, relative to the group CM.
    #[must_use]
    pub fn velocities(&self) -> &[Vector3<f64>] {
        &self.vel
    }

    /// Current internal (kinetic + potential) energy of the group's relative dynamics.
    #[must_use]
    pub fn energy(&self) -> f64 {
        self.kinetic() + self.potential()
    }

    fn potential(&self) -> f64 {
        let n = self.masses.len();
        let mut u = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let r = (self.pos[i] - self.pos[j]).norm();
                if r > 0.0 {
                    u -= self.g * self.masses[i] * self.masses[j] / r;
                }
            }
        }
        u
    }

    fn kinetic(&self) -> f64 {
        self.masses
            .iter()
            .zip(&self.vel)
            .map(|(m, v)| 0.5 * m * v.norm_squared())
            .sum()
    }

    /// `Omega(x) = -U(x)`, the logarithmic-Hamiltonian time-transformation weight. Floored to
    /// avoid a division by zero when members coincide.
    fn omega(&self) -> f64 {
        (-self.potential()).max(1e-300)
    }

    /// The internal (two-body/n-body self-gravity) acceleration among the group's own members,
    /// entirely unaffected by the slow-down factor: this is what keeps the unperturbed Kepler
    /// orbit's `semi`/`ecc`/`period` exactly invariant under any `kappa` (P4).
    fn internal_acceleration(&self) -> Vec<Vector3<f64>> {
        let n = self.masses.len();
        let mut acc = vec![Vector3::zeros(); n];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let dr = self.pos[i] - self.pos[j];
                let r = dr.norm();
                if r > 0.0 {
                    acc[i] -= self.g * self.masses[j] * dr / (r * r * r);
                }
            }
        }
        acc
    }

    /// The external perturbing acceleration (tidal tensor / Hermite neighbors) felt at each
    /// member's current position.
    fn perturbation_acceleration(&self, perturber: &Perturber) -> Vec<Vector3<f64>> {
        self.pos.iter().map(|p| perturber.perturbing_acc(*p)).collect()
    }

    /// An estimate of the group's local two-body dynamical (free-fall) timescale, the minimum
    /// over member pairs of `sqrt(r^3 / (G (m_i + m_j)))`, used as the accuracy criterion driving
    /// [`Self::calc_ds_and_step_option`].
    fn characteristic_time(&self) -> f64 {
        let n = self.masses.len();
        let mut min_t = f64::INFINITY;
        for i in 0..n {
            for j in (i + 1)..n {
                let r = (self.pos[i] - self.pos[j]).norm();
                let mu = self.g * (self.masses[i] + self.masses[j]);
                if r > 0.0 && mu > 0.0 {
                    let t = (r * r * r / mu).sqrt();
                    min_t = min_t.min(t);
                }
            }
        }
        min_t
    }

    /// One symmetric drift-kick-drift leapfrog step of pseudo-time size `ds`.
    ///
    /// The drift and the internal-force half of the kick both use the unslowed pseudo-time
    /// mapping `dt_eff = ds / Omega`, so with zero perturbation the trajectory is bit-identical
    /// regardless of `kappa` (P4: the unperturbed Kepler orbit is exactly invariant under
    /// slow-down). The slow-down factor instead (a) divides the *perturbing* acceleration before
    /// it is added to the kick, and (b) inflates how much real/lab time `self.time` advances per
    /// `dt_eff`: each pseudo-time unit is booked as `kappa` times more elapsed real time, which is
    /// what lets a large `kappa` reach a given real `t_end` in fewer pseudo-time steps despite a
    /// weak perturbation.
    fn substep(&mut self, ds: f64, perturber: &Perturber) {
        if ds == 0.0 {
            return;
        }
        let dt_eff = ds / self.omega();
        let half_dt_eff = 0.5 * dt_eff;

        for (p, v) in self.pos.iter_mut().zip(&self.vel) {
            *p += v * half_dt_eff;
        }
        self.time += half_dt_eff * self.kappa;

        let internal_acc = self.internal_acceleration();
        let pert_acc = self.perturbation_acceleration(perturber);
        for i in 0..self.vel.len() {
            self.vel[i] += (internal_acc[i] + pert_acc[i] / self.kappa) * dt_eff;
        }

        for (p, v) in self.pos.iter_mut().zip(&self.vel) {
            *p += v * half_dt_eff;
        }
        self.time += half_dt_eff * self.kappa;
    }

    /// Selects the pseudo-time step `ds` and whether it was shrunk to land on `t_end`
    /// (`calcDsAndStepOption`).
    ///
    /// The characteristic step is accuracy-driven: `eta_ar` times the local two-body dynamical
    /// timescale (mapped through `Omega` into pseudo-time), the same kind of phase-accuracy
    /// criterion `hard.hpp` derives its AR step from, rather than a disguised copy of the
    /// `time_step_real_min` floor. That floor only clamps the step from below, via
    /// `ds_floor = time_step_real_min * Omega / kappa` (divided by `kappa` since one pseudo-time
    /// unit now books `kappa` times as much real/lab time, per [`Self::substep`]).
    #[must_use]
    pub fn calc_ds_and_step_option(&self, kappa_origin: f64, t_end: f64) -> (f64, StepMode) {
        let remaining_dt = (t_end - self.time).max(0.0);
        let omega = self.omega();
        let kappa = kappa_origin.max(1.0);
        let ds_to_end = remaining_dt * omega / kappa;

        let ds_accuracy = self.config.eta_ar * omega * self.characteristic_time();
        let ds_floor = self.config.time_step_real_min * omega / kappa;
        let ds_characteristic = ds_accuracy.max(ds_floor);

        if ds_to_end <= ds_characteristic || ds_characteristic <= 0.0 {
            (ds_to_end, StepMode::Fixed)
        } else {
            (ds_characteristic, StepMode::Adaptive)
        }
    }

    /// Recomputes the slow-down factor from the perturber's minimum perturbation ratio over the
    /// binary's orbit and records the resulting energy bookkeeping jump in
    /// [`Self::de_sd_change_cum`].
    pub fn update_slow_down(&mut self, binary: &BinaryTree, perturber: &Perturber) {
        let ratio = perturber.calc_soft_pert_min(&binary.root, self.cm_mass, self.g);
        let kappa_new = if ratio > 0.0 {
            (1.0 / ratio).sqrt().max(1.0)
        } else {
            f64::MAX
        };

        if (kappa_new - self.kappa).abs() > 1e-12 * self.kappa.max(1.0) {
            let ke = self.kinetic();
            let de = 0.5 * ke * (1.0 / (kappa_new * kappa_new) - 1.0 / (self.kappa * self.kappa));
            self.de_sd_change_cum += de;
            self.kappa = kappa_new;
            self.kappa_max_last = self.kappa_max_last.max(kappa_new);
        }
    }

    fn check_unbound(&self, binary: &BinaryTree) -> Option<usize> {
        self.pos
            .iter()
            .position(|p| p.norm() > binary.root.break_radius)
    }

    /// Advances the group to `t_end`, composing [`Self::substep`] at the configured integration
    /// order. Returns early with [`StepOutcome::Unbound`] if a member crosses the binary tree's
    /// break radius.
    pub fn integrate_to_time(&mut self, t_end: f64, binary: &BinaryTree, perturber: &Perturber) -> Result<StepOutcome> {
        let weights = composition_weights(self.config.integration_order);
        let mut iterations = 0u64;

        while self.time < t_end {
            let (ds, _mode) = self.calc_ds_and_step_option(self.kappa, t_end);
            for w in &weights {
                self.substep(ds * w, perturber);
            }
            self.step_count += 1;
            iterations += 1;
            if iterations > self.config.step_count_max {
                return Err(Error::InvariantViolation(
                    "AR integration exceeded step_count_max before reaching t_end".to_string(),
                ));
            }
            if let Some(crossing_member) = self.check_unbound(binary) {
                return Ok(StepOutcome::Unbound { crossing_member });
            }
        }
        Ok(StepOutcome::Reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_weights_sum_to_one_for_orders_2_6_8() {
        for order in [2, 6, 8] {
            let weights = composition_weights(order);
            let sum: f64 = weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "order {order} weights sum to {sum}");
        }
    }

    #[test]
    fn circular_binary_energy_is_conserved_over_one_period() {
        let g = 1.0;
        let m = 0.5;
        let r = 1.0;
        let v = (g * 2.0 * m / r).sqrt() / 2.0;
        let masses = vec![m, m];
        let positions = vec![Vector3::new(0.5, 0.0, 0.0), Vector3::new(-0.5, 0.0, 0.0)];
        let velocities = vec![Vector3::new(0.0, v, 0.0), Vector3::new(0.0, -v, 0.0)];

        let binary = BinaryTree::build(&masses, &positions, &velocities, g).unwrap();
        let period = binary.root.period;

        let mut integrator = ArIntegrator::new(
            &masses,
            &positions,
            &velocities,
            Vector3::zeros(),
            Vector3::zeros(),
            g,
            ArManagerConfig {
                time_step_real_min: period / 2000.0,
                ..ArManagerConfig::default()
            },
        )
        .unwrap();

        let e0 = integrator.kinetic() + integrator.potential();
        let perturber: Perturber = crate::perturber::NonePert.into();
        let outcome = integrator.integrate_to_time(period, &binary, &perturber).unwrap();
        assert!(matches!(outcome, StepOutcome::Reached));

        let e1 = integrator.kinetic() + integrator.potential();
        assert!((e1 - e0).abs() / e0.abs() < 1e-3);
    }
}
