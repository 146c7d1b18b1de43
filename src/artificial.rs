//! Artificial particle manager (C4): per-group probe particles and the bookkeeping that ties
//! their forces back into a CM acceleration and an external tidal tensor.
//!
//! A block has `N_art = n_tidal_tensor + 2 * n_split + 1` entries in the fixed order: the
//! tidal-tensor stencil, then `2 * n_split` orbital-sample probes, then the CM (always last).

use crate::binary_tree::BinaryTree;
use crate::changeover::Changeover;
use crate::error::{Error, Result};
use crate::ids::{ClusterId, GroupId, ParticleId};
use crate::manager::ApManagerConfig;
use crate::particle::{ArtificialKind, ArtificialParticle, Particle};
use crate::tidal::{cube_stencil_offsets, TidalTensor};
use nalgebra::Vector3;

/// Creates and interprets artificial-particle blocks per [`ApManagerConfig`].
pub struct ArtificialParticleManager<'a> {
    config: &'a ApManagerConfig,
}

impl<'a> ArtificialParticleManager<'a> {
    /// Wraps the given configuration.
    #[must_use]
    pub const fn new(config: &'a ApManagerConfig) -> Self {
        Self { config }
    }

    /// Total number of artificial particles in one group's block.
    #[must_use]
    pub const fn block_len(&self) -> usize {
        self.config.n_tidal_tensor + 2 * self.config.n_split + 1
    }

    fn tidal_tensor_end(&self) -> usize {
        self.config.n_tidal_tensor
    }

    fn orbital_end(&self) -> usize {
        self.config.n_tidal_tensor + 2 * self.config.n_split
    }

    /// Materialises a group's artificial-particle block. `members` must already be in the
    /// canonical ascending-id order produced by [`crate::group_search::find_groups`] and must
    /// not yet have been promoted to [`crate::particle::ParticleRole::Member`] (i.e. `mass`
    /// still holds the physical mass).
    ///
    /// `id_base` seeds the ids assigned to the block's entries (`id_base, id_base + 1, ...`);
    /// the caller is responsible for keeping these disjoint from every other id in play during
    /// the step.
    pub fn create_artificial_particles(
        &self,
        cluster_id: ClusterId,
        group_id: GroupId,
        members: &[Particle],
        id_base: i64,
        g: f64,
    ) -> Result<Vec<ArtificialParticle>> {
        if members.len() < 2 {
            return Err(Error::InvariantViolation(
                "a group must have at least 2 members to materialise artificial particles"
                    .to_string(),
            ));
        }

        let total_mass: f64 = members.iter().map(|m| m.mass).sum();
        if total_mass <= 0.0 {
            return Err(Error::InvariantViolation(
                "group total mass must be positive".to_string(),
            ));
        }
        let cm_pos = members.iter().map(|m| m.pos * m.mass).sum::<Vector3<f64>>() / total_mass;
        let cm_vel = members.iter().map(|m| m.vel * m.mass).sum::<Vector3<f64>>() / total_mass;

        let masses: Vec<f64> = members.iter().map(|m| m.mass).collect();
        let positions: Vec<Vector3<f64>> = members.iter().map(|m| m.pos).collect();
        let velocities: Vec<Vector3<f64>> = members.iter().map(|m| m.vel).collect();
        let tree = BinaryTree::build(&masses, &positions, &velocities, g)?;

        let member_count = members.len();
        let first_member_id = members[0].id;
        let mut block = Vec::with_capacity(self.block_len());

        for (k, offset) in cube_stencil_offsets(self.config.r_tidal_tensor)
            .into_iter()
            .take(self.config.n_tidal_tensor)
            .enumerate()
        {
            block.push(ArtificialParticle {
                id: ParticleId(id_base + k as i64),
                mass: 0.0,
                pos: cm_pos + offset,
                vel: cm_vel,
                acc: Vector3::zeros(),
                pot: 0.0,
                changeover: Changeover::inactive(),
                kind: ArtificialKind::TidalTensorProbe,
                cluster_id,
                group_id,
                member_count,
                first_member_id,
            });
        }

        for k in 0..self.config.n_split {
            let f = 2.0 * std::f64::consts::PI * (k as f64) / (self.config.n_split as f64);
            let (rel_pos, rel_vel) = tree.root.relative_state_at_true_anomaly(f);
            let idx = self.config.n_tidal_tensor + 2 * k;

            block.push(ArtificialParticle {
                id: ParticleId(id_base + idx as i64),
                mass: 0.0,
                pos: cm_pos + 0.5 * rel_pos,
                vel: cm_vel + 0.5 * rel_vel,
                acc: Vector3::zeros(),
                pot: 0.0,
                changeover: Changeover::inactive(),
                kind: ArtificialKind::OrbitalProbe,
                cluster_id,
                group_id,
                member_count,
                first_member_id,
            });
            block.push(ArtificialParticle {
                id: ParticleId(id_base + idx as i64 + 1),
                mass: 0.0,
                pos: cm_pos - 0.5 * rel_pos,
                vel: cm_vel - 0.5 * rel_vel,
                acc: Vector3::zeros(),
                pot: 0.0,
                changeover: Changeover::inactive(),
                kind: ArtificialKind::OrbitalProbe,
                cluster_id,
                group_id,
                member_count,
                first_member_id,
            });
        }

        block.push(ArtificialParticle {
            id: ParticleId(id_base + self.orbital_end() as i64),
            mass: total_mass,
            pos: cm_pos,
            vel: cm_vel,
            acc: Vector3::zeros(),
            pot: 0.0,
            changeover: Changeover::new(self.config.r_in_base, self.config.r_out_base),
            kind: ArtificialKind::CenterOfMass,
            cluster_id,
            group_id,
            member_count,
            first_member_id,
        });

        Ok(block)
    }

    /// The tidal-tensor probes of `block`.
    #[must_use]
    pub fn tidal_tensor_particles<'b>(&self, block: &'b [ArtificialParticle]) -> &'b [ArtificialParticle] {
        &block[0..self.tidal_tensor_end()]
    }

    /// The orbital-sample probes of `block`.
    #[must_use]
    pub fn orbital_particles<'b>(&self, block: &'b [ArtificialParticle]) -> &'b [ArtificialParticle] {
        &block[self.tidal_tensor_end()..self.orbital_end()]
    }

    /// The CM particle of `block` (always the last entry).
    #[must_use]
    pub fn cm_particle<'b>(&self, block: &'b [ArtificialParticle]) -> &'b ArtificialParticle {
        &block[block.len() - 1]
    }

    /// Fits the group's [`TidalTensor`] and folds the orbital-probe average back into the CM
    /// acceleration, after the external soft-force solver has filled in every `acc`/`pot` field
    /// in `block`.
    ///
    /// (i) subtracts the CM's own soft acceleration from each tidal-tensor probe, isolating the
    /// external field's local gradient; (ii) replaces the CM's acceleration with the mean over
    /// orbital probes, whose internal orbital harmonic cancels in the average.
    pub fn correct_artificial_particle_force(&self, block: &mut [ArtificialParticle]) -> Result<TidalTensor> {
        let n_tt = self.tidal_tensor_end();
        let n_orbital_end = self.orbital_end();
        let cm_acc = block[block.len() - 1].acc;
        let cm_pos = block[block.len() - 1].pos;

        let mut offsets = Vec::with_capacity(n_tt);
        let mut accelerations = Vec::with_capacity(n_tt);
        for probe in &mut block[0..n_tt] {
            probe.acc -= cm_acc;
            offsets.push(probe.pos - cm_pos);
            accelerations.push(probe.acc);
        }
        let tidal_tensor = TidalTensor::fit(&offsets, &accelerations)?;

        let orbital = &block[n_tt..n_orbital_end];
        let mean_acc = orbital.iter().map(|p| p.acc).sum::<Vector3<f64>>() / orbital.len() as f64;
        block[block.len() - 1].acc = mean_acc;

        Ok(tidal_tensor)
    }

    /// Verifies a block is consistent with its originating members: matching member count,
    /// matching first-member id, and CM mass equal to the sum of member masses (`mass_bk` for
    /// already-promoted members).
    pub fn check_consistence(&self, members: &[Particle], block: &[ArtificialParticle]) -> Result<()> {
        if block.len() != self.block_len() {
            return Err(Error::InvariantViolation(format!(
                "artificial block has {} entries, expected {}",
                block.len(),
                self.block_len()
            )));
        }
        let cm = self.cm_particle(block);
        if cm.member_count != members.len() {
            return Err(Error::InvariantViolation(format!(
                "block.member_count {} does not match {} actual members",
                cm.member_count,
                members.len()
            )));
        }
        if members.first().is_some_and(|m| m.id != cm.first_member_id) {
            return Err(Error::InvariantViolation(format!(
                "block.first_member_id {:?} does not match actual first member {:?}",
                cm.first_member_id,
                members.first().map(|m| m.id)
            )));
        }

        let member_mass_sum: f64 = members
            .iter()
            .map(|m| if m.role.is_member() { m.mass_bk } else { m.mass })
            .sum();
        if (cm.mass - member_mass_sum).abs() > 1e-9 * member_mass_sum.max(1.0) {
            return Err(Error::InvariantViolation(format!(
                "CM mass {} does not equal summed member mass {}",
                cm.mass, member_mass_sum
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ApManagerConfig;

    fn members_of_equal_mass_binary() -> Vec<Particle> {
        let g = 1.0;
        let m = 0.5;
        let r = 1.0;
        let v = (g * 2.0 * m / r).sqrt() / 2.0;
        vec![
            Particle::new_single(
                ParticleId(0),
                m,
                Vector3::new(0.5, 0.0, 0.0),
                Vector3::new(0.0, v, 0.0),
                Changeover::new(0.001, 0.01),
            ),
            Particle::new_single(
                ParticleId(1),
                m,
                Vector3::new(-0.5, 0.0, 0.0),
                Vector3::new(0.0, -v, 0.0),
                Changeover::new(0.001, 0.01),
            ),
        ]
    }

    #[test]
    fn block_layout_and_consistence() {
        let config = ApManagerConfig {
            n_split: 8,
            ..ApManagerConfig::default()
        };
        let manager = ArtificialParticleManager::new(&config);
        let members = members_of_equal_mass_binary();

        let block = manager
            .create_artificial_particles(ClusterId(0), GroupId(0), &members, 1000, 1.0)
            .unwrap();

        assert_eq!(block.len(), manager.block_len());
        assert!(manager.cm_particle(&block).is_cm());
        assert_eq!(manager.tidal_tensor_particles(&block).len(), config.n_tidal_tensor);
        assert_eq!(manager.orbital_particles(&block).len(), 2 * config.n_split);

        manager.check_consistence(&members, &block).unwrap();

        let cm = manager.cm_particle(&block);
        assert!((cm.mass - 1.0).abs() < 1e-12);
        assert!(cm.pos.norm() < 1e-12, "equal-mass binary CM should sit at the origin");
    }

    #[test]
    fn force_correction_cancels_probe_harmonic() {
        let config = ApManagerConfig::default();
        let manager = ArtificialParticleManager::new(&config);
        let members = members_of_equal_mass_binary();
        let mut block = manager
            .create_artificial_particles(ClusterId(0), GroupId(0), &members, 2000, 1.0)
            .unwrap();

        // simulate a uniform external field plus each probe's own (irrelevant) internal wobble
        let external = Vector3::new(0.01, -0.02, 0.0);
        let n_tt = manager.tidal_tensor_end();
        for (k, probe) in block[0..n_tt].iter_mut().enumerate() {
            probe.acc = external + Vector3::new(0.0, 0.0, 1e-3 * (k as f64));
        }
        let last = block.len() - 1;
        block[last].acc = external;
        let n_orbital_end = manager.orbital_end();
        for probe in &mut block[n_tt..n_orbital_end] {
            probe.acc = external;
        }

        manager.correct_artificial_particle_force(&mut block).unwrap();

        let cm_acc_after = block[last].acc;
        assert!((cm_acc_after - external).norm() < 1e-9);
    }
}
