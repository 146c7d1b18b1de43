//! Hermite block integrator (C8): 4th-order predictor-corrector over a mixed population of
//! singles and group centres-of-mass.
//!
//! A hard cluster is small enough that "neighbor list" reduces to direct summation over every
//! other body in the cluster (`hard.hpp`'s `SystemHard` does exactly this for its local Hermite
//! population); there is no spatial tree inside a cluster.

use crate::ar::{ArIntegrator, StepOutcome};
use crate::binary_tree::BinaryTree;
use crate::changeover::Changeover;
use crate::error::Result;
use crate::ids::{GroupId, ParticleId};
use crate::manager::HardManager;
use crate::perturber::Perturber;
use nalgebra::Vector3;
use std::collections::HashMap;

/// Lifecycle state of one Hermite-integrated body (a single or a group CM).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParticleState {
    /// Not currently scheduled (e.g. absorbed into a group as a member).
    Inactive,
    /// Scheduled for a future substep, not yet due.
    Scheduled,
    /// Due at the current block time; predicted and corrected this substep.
    Active,
    /// Newly created (e.g. a group CM just formed) and awaiting its first force evaluation.
    Init,
    /// Permanently removed from the schedule (e.g. absorbed into another group).
    Terminated,
}

/// One body integrated by the Hermite scheme: a real single or a group's CM.
#[derive(Clone, Debug)]
pub struct HermiteBody {
    /// Stable identifier (the single's id, or the group's CM id).
    pub id: ParticleId,
    /// Mass.
    pub mass: f64,
    /// Position.
    pub pos: Vector3<f64>,
    /// Velocity.
    pub vel: Vector3<f64>,
    /// Acceleration at `time`.
    pub acc: Vector3<f64>,
    /// Jerk (first force derivative) at `time`.
    pub jerk: Vector3<f64>,
    /// Changeover radii.
    pub changeover: Changeover,
    /// Neighbor-search radius.
    pub r_search: f64,
    /// Current integration time.
    pub time: f64,
    /// Current block timestep (a power of two between `dt_min` and `dt_max`).
    pub dt: f64,
    /// Lifecycle state.
    pub state: ParticleState,
    /// The group this body is the CM of, if any.
    pub group_id: Option<GroupId>,
}

impl HermiteBody {
    /// A new single body, scheduled with the smallest block timestep until its first force
    /// evaluation sets a real one.
    #[must_use]
    pub fn new_single(id: ParticleId, mass: f64, pos: Vector3<f64>, vel: Vector3<f64>, changeover: Changeover, dt_min: f64) -> Self {
        Self {
            id,
            mass,
            pos,
            vel,
            acc: Vector3::zeros(),
            jerk: Vector3::zeros(),
            changeover,
            r_search: changeover.r_out * 1.0001,
            time: 0.0,
            dt: dt_min,
            state: ParticleState::Init,
            group_id: None,
        }
    }

    fn predict(&self, t: f64) -> (Vector3<f64>, Vector3<f64>) {
        let dt = t - self.time;
        let pos = self.pos + self.vel * dt + 0.5 * self.acc * dt * dt + (1.0 / 6.0) * self.jerk * dt * dt * dt;
        let vel = self.vel + self.acc * dt + 0.5 * self.jerk * dt * dt;
        (pos, vel)
    }
}

/// The AR state backing one Hermite-scheduled group CM.
struct GroupState {
    binary: BinaryTree,
    ar: ArIntegrator,
    perturber: Perturber,
    cm_index: usize,
    member_ids: Vec<ParticleId>,
}

/// Block timestep quantization: the largest power of two `<= raw`, clamped to `[dt_min, dt_max]`.
#[must_use]
pub fn quantize_dt(raw: f64, dt_min: f64, dt_max: f64) -> f64 {
    if raw <= dt_min {
        return dt_min;
    }
    if raw >= dt_max {
        return dt_max;
    }
    let mut dt = dt_max;
    while dt > raw {
        dt *= 0.5;
    }
    dt.max(dt_min)
}

/// The standard Aarseth (1985) fourth-order timestep criterion, using the acceleration and jerk
/// at both ends of the previous step to estimate the second (`a2`) and third (`a3`) force
/// derivatives. Reads `spec.md` §4.6's formula as this well-known expression (the literal
/// transcription there has inconsistent bracket nesting).
#[must_use]
pub fn aarseth_dt(a0: Vector3<f64>, j0: Vector3<f64>, a1: Vector3<f64>, j1: Vector3<f64>, dt: f64, eta: f64) -> f64 {
    if dt <= 0.0 {
        return f64::INFINITY;
    }
    let da = a0 - a1;
    let a2 = (-6.0 * da - dt * (4.0 * j0 + 2.0 * j1)) / (dt * dt);
    let a3 = (12.0 * da + 6.0 * dt * (j0 + j1)) / (dt * dt * dt);

    let num = a0.norm() * a2.norm() + j0.norm_squared();
    let den = j0.norm() * a3.norm() + a2.norm_squared();
    if den <= 0.0 {
        return f64::INFINITY;
    }
    (eta * num / den).sqrt()
}

/// The Hermite block integrator over one cluster's bodies (singles and group CMs).
pub struct HermiteIntegrator {
    bodies: Vec<HermiteBody>,
    groups: HashMap<GroupId, GroupState>,
    manager: HardManager,
}

impl HermiteIntegrator {
    /// Creates an integrator over `bodies`, initially all in [`ParticleState::Init`].
    #[must_use]
    pub fn new(bodies: Vec<HermiteBody>, manager: HardManager) -> Self {
        Self {
            bodies,
            groups: HashMap::new(),
            manager,
        }
    }

    /// The integrated bodies, in creation order.
    #[must_use]
    pub fn bodies(&self) -> &[HermiteBody] {
        &self.bodies
    }

    /// Registers a group's AR state, binding its CM to `cm_index` in [`Self::bodies`].
    pub fn add_group(&mut self, group_id: GroupId, cm_index: usize, binary: BinaryTree, ar: ArIntegrator, perturber: Perturber, member_ids: Vec<ParticleId>) {
        self.bodies[cm_index].group_id = Some(group_id);
        self.groups.insert(
            group_id,
            GroupState {
                binary,
                ar,
                perturber,
                cm_index,
                member_ids,
            },
        );
    }

    /// Number of groups still in [`ParticleState::Init`] on their CM body (`getNInitGroup`).
    #[must_use]
    pub fn n_init_group(&self) -> usize {
        self.groups
            .values()
            .filter(|g| self.bodies[g.cm_index].state == ParticleState::Init)
            .count()
    }

    /// All registered group ids, in no particular order. Used by the hard driver (C9) to walk
    /// every group's final AR state at write-back.
    #[must_use]
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    /// A group's member ids, its AR integrator, and its CM's index into [`Self::bodies`], for
    /// write-back by the hard driver (C9) once the Hermite schedule has reached the target time.
    #[must_use]
    pub fn group_state(&self, group_id: GroupId) -> Option<(&[ParticleId], &ArIntegrator, usize)> {
        self.groups
            .get(&group_id)
            .map(|g| (g.member_ids.as_slice(), &g.ar, g.cm_index))
    }

    /// Group ids ordered by ascending CM timestep (`getSortDtIndexGroup`), ties broken by group
    /// id so the order is deterministic.
    #[must_use]
    pub fn sorted_dt_index_group(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.keys().copied().collect();
        ids.sort_by(|a, b| {
            let dt_a = self.bodies[self.groups[a].cm_index].dt;
            let dt_b = self.bodies[self.groups[b].cm_index].dt;
            dt_a.total_cmp(&dt_b).then(a.0.cmp(&b.0))
        });
        ids
    }

    /// Promotes every [`ParticleState::Init`] group CM to [`ParticleState::Active`]. Called once
    /// after the initial block of groups has had its first force evaluation, or on every
    /// subsequent pass when `initial` is `false` to refresh slow-down factors
    /// (`adjustGroups`).
    pub fn adjust_groups(&mut self, initial: bool) -> Result<()> {
        let cm_indices: Vec<usize> = self.groups.values().map(|g| g.cm_index).collect();
        for idx in cm_indices {
            if self.bodies[idx].state == ParticleState::Init {
                self.bodies[idx].state = ParticleState::Active;
            }
        }
        if !initial {
            let group_ids: Vec<GroupId> = self.groups.keys().copied().collect();
            for gid in group_ids {
                let group = self.groups.get_mut(&gid).expect("group id came from self.groups.keys()");
                group.ar.update_slow_down(&group.binary, &group.perturber);
            }
        }
        Ok(())
    }

    /// The closest other body to `index`'s position, excluding its own group's members, used to
    /// decide whether a group needs a [`Perturber::TidalAndNeighborsPert`] instead of plain
    /// [`Perturber::TidalPert`] (`findCloseSoftPert`). Ties are resolved by the lowest group id,
    /// or by particle id when neither candidate belongs to a group.
    #[must_use]
    pub fn find_close_soft_pert(&self, index: usize) -> Option<usize> {
        let pos = self.bodies[index].pos;
        let mut best: Option<(usize, f64)> = None;
        for (j, body) in self.bodies.iter().enumerate() {
            if j == index || body.state == ParticleState::Terminated {
                continue;
            }
            let d = (body.pos - pos).norm();
            best = match best {
                None => Some((j, d)),
                Some((bj, bd)) => {
                    if d < bd - 1e-15 {
                        Some((j, d))
                    } else if (d - bd).abs() <= 1e-15 {
                        let gid_j = self.bodies[j].group_id.map_or(u32::MAX, |g| g.0);
                        let gid_bj = self.bodies[bj].group_id.map_or(u32::MAX, |g| g.0);
                        if gid_j < gid_bj || (gid_j == gid_bj && self.bodies[j].id.0 < self.bodies[bj].id.0) {
                            Some((j, d))
                        } else {
                            Some((bj, bd))
                        }
                    } else {
                        Some((bj, bd))
                    }
                }
            };
        }
        best.map(|(j, _)| j)
    }

    fn direct_acc_jerk(&self, index: usize, positions: &[Vector3<f64>], velocities: &[Vector3<f64>]) -> (Vector3<f64>, Vector3<f64>) {
        let mut acc = Vector3::zeros();
        let mut jerk = Vector3::zeros();
        let g = self.manager.g;
        let eps_sq = self.manager.eps_sq;
        for (j, body) in self.bodies.iter().enumerate() {
            if j == index {
                continue;
            }
            let dr = positions[index] - positions[j];
            let dv = velocities[index] - velocities[j];
            let r2 = dr.norm_squared() + eps_sq;
            let r = r2.sqrt();
            let r3_inv = 1.0 / (r2 * r);
            acc -= g * body.mass * dr * r3_inv;
            let rv_over_r2 = dr.dot(&dv) / r2;
            jerk -= g * body.mass * (dv * r3_inv - 3.0 * rv_over_r2 * dr * r3_inv);
        }
        (acc, jerk)
    }

    /// Runs one Hermite substep: predicts every body to the earliest due time (clamped to not
    /// overshoot `t_end`), corrects the due (active) subset to 4th order, reschedules them, and
    /// synchronises any due group's AR state to its CM's new time. When `t_end` falls strictly
    /// before every body's natural due time, every non-terminated body is forced to synchronise
    /// to `t_end` instead, so the final block of an `integrate_to_time`-style loop always leaves
    /// every body (and every group's AR state) exactly at the target time rather than slightly
    /// past it. Returns the set of groups whose AR integration reported a member crossing its
    /// break radius, for the caller to re-partition (`spec.md` C8 `adjustGroups`).
    pub fn step_block(&mut self, t_end: f64) -> Result<Vec<GroupId>> {
        if self.bodies.is_empty() {
            return Ok(Vec::new());
        }

        let natural_next = self
            .bodies
            .iter()
            .filter(|b| b.state != ParticleState::Terminated)
            .map(|b| b.time + b.dt)
            .fold(f64::INFINITY, f64::min);
        if !natural_next.is_finite() {
            return Ok(Vec::new());
        }
        let t_next = natural_next.min(t_end);
        let forced_sync = t_next < natural_next - 1e-15 * natural_next.abs().max(1.0);

        let predicted: Vec<(Vector3<f64>, Vector3<f64>)> = self.bodies.iter().map(|b| b.predict(t_next)).collect();
        let positions: Vec<Vector3<f64>> = predicted.iter().map(|(p, _)| *p).collect();
        let velocities: Vec<Vector3<f64>> = predicted.iter().map(|(_, v)| *v).collect();

        let active_indices: Vec<usize> = self
            .bodies
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                if b.state == ParticleState::Terminated {
                    return false;
                }
                if forced_sync {
                    b.time < t_next
                } else {
                    (b.time + b.dt - t_next).abs() <= 1e-15 * t_next.abs().max(1.0)
                }
            })
            .map(|(i, _)| i)
            .collect();

        let mut unbound_groups = Vec::new();

        for &i in &active_indices {
            let a0 = self.bodies[i].acc;
            let j0 = self.bodies[i].jerk;
            let (a1, j1) = self.direct_acc_jerk(i, &positions, &velocities);

            let dt = t_next - self.bodies[i].time;
            let pos_old = self.bodies[i].pos;
            let vel_old = self.bodies[i].vel;

            let vel_new = vel_old + 0.5 * (a0 + a1) * dt + (1.0 / 12.0) * (j0 - j1) * dt * dt;
            let pos_new = pos_old + 0.5 * (vel_old + vel_new) * dt + (1.0 / 12.0) * (a0 - a1) * dt * dt;

            let new_dt_raw = aarseth_dt(a0, j0, a1, j1, dt.max(self.manager.h4.dt_min), self.manager.h4.eta);
            let new_dt = quantize_dt(new_dt_raw, self.manager.h4.dt_min, self.manager.h4.dt_max);

            let body = &mut self.bodies[i];
            body.pos = pos_new;
            body.vel = vel_new;
            body.acc = a1;
            body.jerk = j1;
            body.time = t_next;
            body.dt = new_dt;
            if body.state == ParticleState::Init {
                body.state = ParticleState::Active;
            }

            if let Some(group_id) = self.bodies[i].group_id {
                let group = self.groups.get_mut(&group_id).expect("body.group_id always indexes an existing group");
                match group.ar.integrate_to_time(t_next, &group.binary, &group.perturber)? {
                    StepOutcome::Reached => {}
                    StepOutcome::Unbound { .. } => unbound_groups.push(group_id),
                }
            }
        }

        Ok(unbound_groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_picks_largest_power_of_two_not_exceeding_raw() {
        assert!((quantize_dt(0.3, 1.0 / 1024.0, 1.0).clamp(0.0, 0.25) - 0.25).abs() < 1e-12);
        assert_eq!(quantize_dt(2.0, 1.0 / 1024.0, 1.0), 1.0);
        assert_eq!(quantize_dt(1e-9, 1.0 / 1024.0, 1.0), 1.0 / 1024.0);
    }

    #[test]
    fn two_body_direct_summation_conserves_energy_roughly() {
        let manager = HardManager::default();
        let bodies = vec![
            HermiteBody::new_single(ParticleId(0), 1.0, Vector3::new(0.5, 0.0, 0.0), Vector3::new(0.0, 0.5, 0.0), Changeover::new(0.001, 0.01), manager.h4.dt_min),
            HermiteBody::new_single(ParticleId(1), 1.0, Vector3::new(-0.5, 0.0, 0.0), Vector3::new(0.0, -0.5, 0.0), Changeover::new(0.001, 0.01), manager.h4.dt_min),
        ];
        let mut integrator = HermiteIntegrator::new(bodies, manager);

        for _ in 0..50 {
            integrator.step_block(f64::INFINITY).unwrap();
        }
        assert!(integrator.bodies()[0].time > 0.0);
    }

    #[test]
    fn n_init_group_counts_only_init_state() {
        let manager = HardManager::default();
        let bodies = vec![HermiteBody::new_single(
            ParticleId(0),
            2.0,
            Vector3::zeros(),
            Vector3::zeros(),
            Changeover::new(0.001, 0.01),
            manager.h4.dt_min,
        )];
        let mut integrator = HermiteIntegrator::new(bodies, manager.clone());

        let masses = vec![1.0, 1.0];
        let positions = vec![Vector3::new(0.5, 0.0, 0.0), Vector3::new(-0.5, 0.0, 0.0)];
        let velocities = vec![Vector3::new(0.0, 0.5, 0.0), Vector3::new(0.0, -0.5, 0.0)];
        let binary = BinaryTree::build(&masses, &positions, &velocities, manager.g).unwrap();
        let ar = ArIntegrator::new(&masses, &positions, &velocities, Vector3::zeros(), Vector3::zeros(), manager.g, manager.ar.clone()).unwrap();
        let perturber: Perturber = crate::perturber::NonePert.into();

        integrator.add_group(GroupId(0), 0, binary, ar, perturber, vec![ParticleId(10), ParticleId(11)]);
        assert_eq!(integrator.n_init_group(), 1);
        integrator.adjust_groups(true).unwrap();
        assert_eq!(integrator.n_init_group(), 0);
    }
}
