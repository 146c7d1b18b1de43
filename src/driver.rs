//! Hard driver (C9): per-cluster hard-step orchestration and energy/slow-down accounting.
//!
//! Grounded on `hard.hpp`'s `SystemHard::driveForOneClusterSingle` (the single-group fast path),
//! `SystemHard::driveForMultiCluster` (the general Hermite path), and `HardEnergy` (the energy
//! bookkeeping struct). The tree/soft gravity solver that would ordinarily supply each particle's
//! `acc`/`pot` and the group's external tidal field is out of scope (`spec.md` §1); within a
//! cluster this driver falls back to direct summation (`spec.md` §4.8's "a hard cluster is small
//! enough that neighbor list reduces to direct summation") and to [`crate::perturber::NonePert`]
//! for the outer perturbation a real tree step would otherwise supply. See `DESIGN.md` for the
//! full list of simplifications this implies.

use crate::ar::{ArIntegrator, StepOutcome};
use crate::binary_tree::BinaryTree;
use crate::changeover::Changeover;
use crate::dump::HardDump;
use crate::error::{Error, Result};
use crate::group_search::bound_groups_only;
use crate::hermite::{HermiteBody, HermiteIntegrator};
use crate::ids::{ClusterId, GroupId, ParticleId};
use crate::manager::HardManager;
use crate::particle::Particle;
use crate::perturber::{NonePert, Perturber};
use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::{debug, error, warn};

/// Running energy and slow-down bookkeeping for one cluster's hard step (`HardEnergy` in the
/// source).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EnergyAccounting {
    /// Physical energy error accumulated this step (`E_after - E_before`, direct summation).
    pub de: f64,
    /// Slow-down-corrected energy error: `de` with every group's slow-down bookkeeping jump
    /// subtracted back out, so a `kappa` change alone does not register as a divergence.
    pub de_sd: f64,
    /// Sum of every group's [`ArIntegrator::de_sd_change_cum`] this step.
    pub de_sd_change_cum: f64,
    /// Kinetic-energy slow-down correction term, summed over groups.
    pub ekin_sd_correction: f64,
    /// Potential-energy slow-down correction term, summed over groups.
    pub epot_sd_correction: f64,
}

impl EnergyAccounting {
    fn accumulate_group(&mut self, ar: &ArIntegrator) {
        self.de_sd_change_cum += ar.de_sd_change_cum;
    }
}

fn cluster_energy(members: &[Particle], g: f64, eps_sq: f64) -> f64 {
    let mut kinetic = 0.0;
    let mut potential = 0.0;
    for (i, pi) in members.iter().enumerate() {
        let mass_i = if pi.role.is_member() { pi.mass_bk } else { pi.mass };
        kinetic += 0.5 * mass_i * pi.vel.norm_squared();
        for pj in &members[i + 1..] {
            let mass_j = if pj.role.is_member() { pj.mass_bk } else { pj.mass };
            let r = ((pi.pos - pj.pos).norm_squared() + eps_sq).sqrt();
            if r > 0.0 {
                potential -= g * mass_i * mass_j / r;
            }
        }
    }
    kinetic + potential
}

/// The CM changeover radii for a newly formed group, scaled from the base radii by the group's
/// mass relative to the mean particle mass (`spec.md` §4.7: `mass_fac = m_cm * mean_mass_inv`,
/// bounded below by `1.0` so a group never gets a *smaller* changeover than a single particle).
fn cm_changeover(total_mass: f64, manager: &HardManager) -> Changeover {
    let mass_fac = (total_mass * manager.mean_mass_inv).max(1.0);
    Changeover::new(manager.ap.r_in_base * mass_fac, manager.ap.r_out_base * mass_fac)
}

/// Per-cluster hard step driver.
pub struct HardDriver<'a> {
    manager: &'a HardManager,
}

impl<'a> HardDriver<'a> {
    /// Wraps the given configuration.
    #[must_use]
    pub const fn new(manager: &'a HardManager) -> Self {
        Self { manager }
    }

    /// Runs one cluster's hard step to `dt`, writing the result back into `members` in place.
    ///
    /// Pre-processes by checking INV-M on every particle, runs the group search (C5), then
    /// either the single-group fast path or the general multi-body Hermite path (`spec.md`
    /// §4.7), and finally checks INV-R and the cluster's slow-down-corrected energy error before
    /// returning. Exceeding `energy_error_max` captures a [`HardDump`] and returns
    /// [`Error::EnergyBudgetExceeded`].
    pub fn integrate_cluster(
        &self,
        cluster_id: ClusterId,
        members: &mut [Particle],
        dt: f64,
    ) -> Result<EnergyAccounting> {
        for p in members.iter() {
            p.check_inv_m()?;
        }

        let e_before = cluster_energy(members, self.manager.g, self.manager.eps_sq);
        let mut energy = EnergyAccounting::default();

        let groups = bound_groups_only(members);
        let single_group_covers_all = groups.len() == 1 && groups[0].len() == members.len();

        debug!(
            cluster = cluster_id.0,
            n_members = members.len(),
            n_groups = groups.len(),
            single_group_covers_all,
            "starting hard step"
        );

        if single_group_covers_all {
            self.integrate_single_group_fast_path(members, dt, &mut energy)?;
        } else {
            self.integrate_general(members, &groups, dt, &mut energy)?;
        }

        let e_after = cluster_energy(members, self.manager.g, self.manager.eps_sq);
        energy.de = e_after - e_before;
        energy.de_sd = energy.de - energy.de_sd_change_cum;

        if energy.de_sd.abs() > self.manager.energy_error_max {
            error!(
                cluster = cluster_id.0,
                de_sd = energy.de_sd,
                "energy budget exceeded during hard step"
            );
            let dump = HardDump::capture(
                cluster_id,
                members,
                dt,
                self.manager.ap.n_split,
                format!(
                    "|dE_SD| = {} exceeds energy_error_max = {}",
                    energy.de_sd.abs(),
                    self.manager.energy_error_max
                ),
            );
            let mut buf = Vec::new();
            if let Err(write_err) = dump.write_binary(&mut buf) {
                error!(error = %write_err, "failed to serialise hard dump");
            }
            return Err(Error::EnergyBudgetExceeded(format!(
                "cluster {} exceeded energy_error_max ({} > {})",
                cluster_id.0,
                energy.de_sd.abs(),
                self.manager.energy_error_max
            )));
        }

        for p in members.iter() {
            p.check_inv_r()?;
        }

        Ok(energy)
    }

    /// The cluster-is-exactly-one-group path (`spec.md` §4.7 step 2): no Hermite scheduling, a
    /// single standalone AR integrator drifted linearly in the CM frame.
    fn integrate_single_group_fast_path(
        &self,
        members: &mut [Particle],
        dt: f64,
        energy: &mut EnergyAccounting,
    ) -> Result<()> {
        let total_mass: f64 = members.iter().map(|m| m.mass).sum();
        let cm_pos = members.iter().map(|m| m.pos * m.mass).sum::<Vector3<f64>>() / total_mass;
        let cm_vel = members.iter().map(|m| m.vel * m.mass).sum::<Vector3<f64>>() / total_mass;

        let masses: Vec<f64> = members.iter().map(|m| m.mass).collect();
        let positions: Vec<Vector3<f64>> = members.iter().map(|m| m.pos).collect();
        let velocities: Vec<Vector3<f64>> = members.iter().map(|m| m.vel).collect();

        let binary = BinaryTree::build(&masses, &positions, &velocities, self.manager.g)?;
        let mut ar = ArIntegrator::new(
            &masses,
            &positions,
            &velocities,
            cm_pos,
            cm_vel,
            self.manager.g,
            self.manager.ar.clone(),
        )?;

        // an isolated cluster has no neighbors within the hard subsystem's scope to perturb it.
        let perturber: Perturber = NonePert.into();
        ar.update_slow_down(&binary, &perturber);

        match ar.integrate_to_time(dt, &binary, &perturber)? {
            StepOutcome::Reached => {}
            StepOutcome::Unbound { crossing_member } => {
                warn!(
                    crossing_member,
                    "single-group fast path observed a member cross the break radius; \
                     writing back without re-partitioning"
                );
            }
        }
        energy.accumulate_group(&ar);

        let cm_pos_final = cm_pos + cm_vel * dt;
        for (member, (rel_pos, rel_vel)) in members.iter_mut().zip(ar.positions().iter().zip(ar.velocities())) {
            member.pos = cm_pos_final + rel_pos;
            member.vel = cm_vel + rel_vel;
        }
        Ok(())
    }

    /// The general path (`spec.md` §4.7 step 3): a Hermite schedule over singles and group CMs,
    /// each group's CM backed by an AR integrator.
    fn integrate_general(
        &self,
        members: &mut [Particle],
        groups: &[Vec<usize>],
        dt: f64,
        energy: &mut EnergyAccounting,
    ) -> Result<()> {
        let mut in_group = vec![None; members.len()];
        for (gi, group) in groups.iter().enumerate() {
            for &idx in group {
                in_group[idx] = Some(gi);
            }
        }

        let mut bodies = Vec::new();
        let mut body_kind = Vec::new();
        enum BodyKind {
            Single(usize),
            GroupCm(GroupId),
        }

        struct PendingGroup {
            group_id: GroupId,
            cm_index: usize,
            binary: BinaryTree,
            ar: ArIntegrator,
            member_ids: Vec<ParticleId>,
        }
        let mut pending_groups = Vec::new();

        for (gi, group) in groups.iter().enumerate() {
            let group_id = GroupId(gi as u32);
            let masses: Vec<f64> = group.iter().map(|&idx| members[idx].mass).collect();
            let positions: Vec<Vector3<f64>> = group.iter().map(|&idx| members[idx].pos).collect();
            let velocities: Vec<Vector3<f64>> = group.iter().map(|&idx| members[idx].vel).collect();
            let member_ids: Vec<ParticleId> = group.iter().map(|&idx| members[idx].id).collect();
            let total_mass: f64 = masses.iter().sum();
            let cm_pos = positions
                .iter()
                .zip(&masses)
                .map(|(p, m)| p * *m)
                .sum::<Vector3<f64>>()
                / total_mass;
            let cm_vel = velocities
                .iter()
                .zip(&masses)
                .map(|(v, m)| v * *m)
                .sum::<Vector3<f64>>()
                / total_mass;

            let binary = BinaryTree::build(&masses, &positions, &velocities, self.manager.g)?;
            let ar = ArIntegrator::new(
                &masses,
                &positions,
                &velocities,
                cm_pos,
                cm_vel,
                self.manager.g,
                self.manager.ar.clone(),
            )?;

            let changeover = cm_changeover(total_mass, self.manager);
            let cm_id = ParticleId(first_member_id_of(group, members).0);
            let cm_index = bodies.len();
            bodies.push(HermiteBody::new_single(
                cm_id,
                total_mass,
                cm_pos,
                cm_vel,
                changeover,
                self.manager.h4.dt_min,
            ));
            body_kind.push(BodyKind::GroupCm(group_id));
            pending_groups.push(PendingGroup {
                group_id,
                cm_index,
                binary,
                ar,
                member_ids,
            });

            for &idx in group {
                members[idx].promote_to_member(cm_index)?;
            }
        }

        for (idx, member) in members.iter().enumerate() {
            if in_group[idx].is_none() {
                bodies.push(HermiteBody::new_single(
                    member.id,
                    member.mass,
                    member.pos,
                    member.vel,
                    member.changeover,
                    self.manager.h4.dt_min,
                ));
                body_kind.push(BodyKind::Single(idx));
            }
        }

        let mut hermite = HermiteIntegrator::new(bodies, self.manager.clone());
        for pending in pending_groups {
            // no outer tidal tensor/neighbor list available without a tree step (out of scope).
            let perturber: Perturber = NonePert.into();
            hermite.add_group(
                pending.group_id,
                pending.cm_index,
                pending.binary,
                pending.ar,
                perturber,
                pending.member_ids,
            );
        }
        hermite.adjust_groups(true)?;

        let mut steps = 0u64;
        loop {
            let min_time = hermite.bodies().iter().map(|b| b.time).fold(f64::INFINITY, f64::min);
            if !min_time.is_finite() || min_time >= dt {
                break;
            }
            let unbound = hermite.step_block(dt)?;
            for group_id in unbound {
                warn!(group = group_id.0, "group member crossed break radius; no re-partitioning in this driver");
            }
            steps += 1;
            if steps > self.manager.ar.step_count_max {
                return Err(Error::EnergyBudgetExceeded(
                    "hard step exceeded step_count_max before reaching t_end".to_string(),
                ));
            }
        }

        for (bi, kind) in body_kind.iter().enumerate() {
            if let BodyKind::Single(member_idx) = kind {
                let body = &hermite.bodies()[bi];
                members[*member_idx].pos = body.pos;
                members[*member_idx].vel = body.vel;
            }
        }

        for group_id in hermite.group_ids() {
            let Some((member_ids, ar, cm_index)) = hermite.group_state(group_id) else {
                continue;
            };
            energy.accumulate_group(ar);
            let cm_body = &hermite.bodies()[cm_index];
            let r_search_cm = cm_body_r_search(cm_body.changeover);

            for (member_id, (rel_pos, rel_vel)) in member_ids.iter().zip(ar.positions().iter().zip(ar.velocities())) {
                if let Some(member) = members.iter_mut().find(|m| m.id == *member_id) {
                    member.pos = cm_body.pos + rel_pos;
                    member.vel = cm_body.vel + rel_vel;
                    member.demote_to_single()?;
                    member.absorb_cm_r_search(r_search_cm);
                }
            }
        }

        Ok(())
    }
}

fn first_member_id_of(group: &[usize], members: &[Particle]) -> ParticleId {
    group
        .iter()
        .map(|&idx| members[idx].id)
        .min()
        .expect("a group always has at least one member")
}

fn cm_body_r_search(changeover: Changeover) -> f64 {
    changeover.r_out * 1.0001
}

/// A mediator record describing one remote particle received during cluster exchange
/// (`spec.md` §6). No network I/O happens here; the caller supplies the already-received
/// particle buffer and this just performs the documented `id_cluster` sort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterMergeRecord {
    /// Rank the particle was received from.
    pub rank_send: i32,
    /// Address (index) within that rank's local system.
    pub adr_sys: usize,
    /// The cluster this particle belongs to, as determined by the remote rank.
    pub id_cluster: u32,
}

/// Sorts a received particle buffer by `id_cluster` and groups it into local clusters
/// (`spec.md` §6: "the core sorts the union by `id_cluster` to form local clusters").
#[must_use]
pub fn merge_remote_clusters(
    records: &[ClusterMergeRecord],
    received: Vec<Particle>,
) -> Vec<(ClusterId, Vec<Particle>)> {
    let mut paired: Vec<(ClusterId, Particle)> = records
        .iter()
        .zip(received)
        .map(|(r, p)| (ClusterId(r.id_cluster), p))
        .collect();
    paired.sort_by_key(|(id, _)| id.0);

    let mut out: Vec<(ClusterId, Vec<Particle>)> = Vec::new();
    for (id, p) in paired {
        if let Some(last) = out.last_mut().filter(|(last_id, _)| *last_id == id) {
            last.1.push(p);
        } else {
            out.push((id, vec![p]));
        }
    }
    out
}

/// Merges per-thread artificial-particle scratch buffers into one contiguous array via a serial
/// prefix sum of sizes (`spec.md` §5: "the merge's offset table must be emitted before any
/// thread writes, so the write phase becomes disjoint and lock-free"). Returns the merged array
/// together with each scratch buffer's starting offset in it.
#[must_use]
pub fn merge_artificial_scratch<T>(scratch: Vec<Vec<T>>) -> (Vec<T>, Vec<usize>) {
    let mut offsets = Vec::with_capacity(scratch.len());
    let mut running = 0usize;
    for buf in &scratch {
        offsets.push(running);
        running += buf.len();
    }
    let mut merged = Vec::with_capacity(running);
    for buf in scratch {
        merged.extend(buf);
    }
    (merged, offsets)
}

/// Runs [`HardDriver::integrate_cluster`] over every cluster in parallel (`spec.md` §5:
/// "shared-memory fork-join parallelism at the cluster level"). Each cluster is independent and
/// disjoint, so no ordering guarantee holds across the returned results (P9 holds per-cluster,
/// not across clusters).
pub fn integrate_all_clusters(
    manager: &HardManager,
    clusters: &mut [(ClusterId, Vec<Particle>)],
    dt: f64,
) -> Vec<Result<EnergyAccounting>> {
    clusters
        .par_iter_mut()
        .map(|(cluster_id, members)| {
            let driver = HardDriver::new(manager);
            driver.integrate_cluster(*cluster_id, members, dt)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeover::Changeover;

    fn equal_mass_binary(manager: &HardManager) -> Vec<Particle> {
        let g = manager.g;
        let m = 0.5;
        let r = 1.0;
        let v = (g * 2.0 * m / r).sqrt() / 2.0;
        vec![
            Particle::new_single(ParticleId(0), m, Vector3::new(0.5, 0.0, 0.0), Vector3::new(0.0, v, 0.0), Changeover::new(0.001, 0.01)),
            Particle::new_single(ParticleId(1), m, Vector3::new(-0.5, 0.0, 0.0), Vector3::new(0.0, -v, 0.0), Changeover::new(0.001, 0.01)),
        ]
    }

    #[test]
    fn single_group_fast_path_conserves_cluster_energy() {
        let manager = HardManager {
            energy_error_max: 1.0e-3,
            ..HardManager::default()
        };
        let mut members = equal_mass_binary(&manager);
        let e_before = cluster_energy(&members, manager.g, manager.eps_sq);

        let driver = HardDriver::new(&manager);
        driver.integrate_cluster(ClusterId(0), &mut members, 0.05).unwrap();

        let e_after = cluster_energy(&members, manager.g, manager.eps_sq);
        assert!((e_after - e_before).abs() / e_before.abs() < 1e-3);
        for p in &members {
            assert!(p.role.is_single());
        }
    }

    #[test]
    fn single_group_fast_path_returns_to_initial_configuration_after_one_period() {
        let manager = HardManager {
            energy_error_max: 1.0e-2,
            ar: crate::manager::ArManagerConfig {
                time_step_real_min: 1.0e-4,
                ..manager_defaults_ar()
            },
            ..HardManager::default()
        };
        let members_initial = equal_mass_binary(&manager);
        let mut members = members_initial.clone();
        let period = {
            let masses: Vec<f64> = members.iter().map(|p| p.mass).collect();
            let positions: Vec<Vector3<f64>> = members.iter().map(|p| p.pos).collect();
            let velocities: Vec<Vector3<f64>> = members.iter().map(|p| p.vel).collect();
            BinaryTree::build(&masses, &positions, &velocities, manager.g).unwrap().root.period
        };

        let driver = HardDriver::new(&manager);
        driver.integrate_cluster(ClusterId(0), &mut members, period).unwrap();

        for (before, after) in members_initial.iter().zip(&members) {
            assert!((before.pos - after.pos).norm() < 1e-4, "position drifted: {:?} vs {:?}", before.pos, after.pos);
        }
    }

    fn manager_defaults_ar() -> crate::manager::ArManagerConfig {
        crate::manager::ArManagerConfig::default()
    }

    #[test]
    fn mixed_cluster_with_one_group_and_one_single_uses_general_path() {
        let manager = HardManager {
            energy_error_max: 1.0e-2,
            ..HardManager::default()
        };
        let mut members = equal_mass_binary(&manager);
        members.push(Particle::new_single(
            ParticleId(2),
            1.0,
            Vector3::new(100.0, 0.0, 0.0),
            Vector3::zeros(),
            Changeover::new(0.001, 0.01),
        ));

        let driver = HardDriver::new(&manager);
        driver.integrate_cluster(ClusterId(1), &mut members, 0.01).unwrap();

        for p in &members {
            assert!(p.role.is_single());
            p.check_inv_m().unwrap();
            p.check_inv_r().unwrap();
        }
    }

    #[test]
    fn sixteen_singles_cluster_collapses_to_one_group_and_integrates() {
        let manager = HardManager {
            energy_error_max: 10.0,
            ..HardManager::default()
        };
        let mut members = Vec::new();
        let mut seed: u64 = 777;
        let mut rand01 = || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((seed >> 33) as f64) / (u32::MAX as f64)
        };
        for i in 0..16 {
            let pos = Vector3::new(rand01() * 0.01, rand01() * 0.01, rand01() * 0.01);
            members.push(Particle::new_single(ParticleId(i), 1.0, pos, Vector3::zeros(), Changeover::new(0.0001, 0.001)));
        }

        let groups = bound_groups_only(&members);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 16);

        let driver = HardDriver::new(&manager);
        let result = driver.integrate_cluster(ClusterId(2), &mut members, 1.0e-3);
        assert!(result.is_ok());
    }

    #[test]
    fn merge_artificial_scratch_prefix_sums_offsets() {
        let scratch = vec![vec![1, 2, 3], vec![], vec![4]];
        let (merged, offsets) = merge_artificial_scratch(scratch);
        assert_eq!(merged, vec![1, 2, 3, 4]);
        assert_eq!(offsets, vec![0, 3, 3]);
    }

    #[test]
    fn merge_remote_clusters_groups_by_id_cluster_regardless_of_input_order() {
        let records = vec![
            ClusterMergeRecord { rank_send: 1, adr_sys: 0, id_cluster: 2 },
            ClusterMergeRecord { rank_send: 0, adr_sys: 1, id_cluster: 1 },
            ClusterMergeRecord { rank_send: 1, adr_sys: 2, id_cluster: 2 },
        ];
        let received = vec![
            Particle::new_single(ParticleId(10), 1.0, Vector3::zeros(), Vector3::zeros(), Changeover::new(0.001, 0.01)),
            Particle::new_single(ParticleId(11), 1.0, Vector3::zeros(), Vector3::zeros(), Changeover::new(0.001, 0.01)),
            Particle::new_single(ParticleId(12), 1.0, Vector3::zeros(), Vector3::zeros(), Changeover::new(0.001, 0.01)),
        ];

        let clusters = merge_remote_clusters(&records, received);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].0, ClusterId(1));
        assert_eq!(clusters[1].0, ClusterId(2));
        assert_eq!(clusters[1].1.len(), 2);
    }

    #[test]
    fn integrate_all_clusters_runs_independent_clusters_in_parallel() {
        let manager = HardManager {
            energy_error_max: 1.0,
            ..HardManager::default()
        };
        let mut clusters = vec![
            (ClusterId(0), equal_mass_binary(&manager)),
            (ClusterId(1), equal_mass_binary(&manager)),
        ];
        let results = integrate_all_clusters(&manager, &mut clusters, 0.01);
        assert_eq!(results.len(), 2);
        for r in results {
            assert!(r.is_ok());
        }
    }
}
