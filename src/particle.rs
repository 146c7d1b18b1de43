//! Particle records (C2): real particles and the artificial particles materialised per group.
//!
//! `status` in the source is a signed double that multiplexes four roles. Per the REDESIGN FLAG
//! in `spec.md` §9 this crate uses an explicit tagged [`ParticleRole`] instead, and keeps
//! CM velocity/mass bookkeeping for the next cluster search in a parallel [`CmCache`] rather than
//! shadowing it in unused float lanes of the particle record.

use crate::changeover::Changeover;
use crate::error::{Error, Result};
use crate::ids::{ClusterId, GroupId, ParticleId};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// The role a particle (real or artificial) plays at a given instant.
///
/// Exactly one of these applies to any particle at any time; the tag replaces the sign/magnitude
/// encoding of the source's `status` field.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum ParticleRole {
    /// An isolated particle, not part of any group.
    Single,
    /// A member of a bound group; `cm_index` is the index of the group's CM particle in the
    /// caller's global array.
    Member {
        /// Index of the owning group's centre-of-mass particle.
        cm_index: usize,
    },
    /// An artificial particle (probe or CM); see [`ArtificialKind`] for the sub-role.
    Artificial(ArtificialKind),
}

impl ParticleRole {
    /// Whether this role marks a bound-group member.
    #[must_use]
    pub const fn is_member(&self) -> bool {
        matches!(self, Self::Member { .. })
    }

    /// Whether this role marks an isolated single.
    #[must_use]
    pub const fn is_single(&self) -> bool {
        matches!(self, Self::Single)
    }
}

/// The sub-role of an artificial particle within its group's block.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ArtificialKind {
    /// A probe on the tidal-tensor sampling stencil.
    TidalTensorProbe,
    /// A probe sampling the Keplerian orbit of the dominant binary.
    OrbitalProbe,
    /// The group's centre-of-mass particle. Always the last entry of a block.
    CenterOfMass,
}

/// A real particle owned by the caller's global array.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Particle {
    /// Stable identifier.
    pub id: ParticleId,
    /// Gravitational mass. Zero while the particle is a group member (INV-M).
    pub mass: f64,
    /// Position.
    pub pos: Vector3<f64>,
    /// Velocity.
    pub vel: Vector3<f64>,
    /// Soft-force acceleration, filled by the external tree solver and corrected by C6.
    pub acc: Vector3<f64>,
    /// Soft-force potential, filled by the external tree solver and corrected by C6.
    pub pot: f64,
    /// Neighbor-search radius; always strictly greater than `changeover.r_out` (INV-R).
    pub r_search: f64,
    /// Changeover radii for this particle.
    pub changeover: Changeover,
    /// Current role.
    pub role: ParticleRole,
    /// Mass backup: holds the pre-group mass while `role` is [`ParticleRole::Member`], cleared
    /// (`0.0`) otherwise (INV-M).
    pub mass_bk: f64,
    /// Back-index into the external global array; negative marks a remote/not-locally-owned
    /// particle.
    pub adr_org: i64,
}

impl Particle {
    /// Creates an isolated single particle with the given physical properties and changeover.
    #[must_use]
    pub fn new_single(
        id: ParticleId,
        mass: f64,
        pos: Vector3<f64>,
        vel: Vector3<f64>,
        changeover: Changeover,
    ) -> Self {
        Self {
            id,
            mass,
            pos,
            vel,
            acc: Vector3::zeros(),
            pot: 0.0,
            r_search: changeover.r_out * 1.0001,
            changeover,
            role: ParticleRole::Single,
            mass_bk: 0.0,
            adr_org: -1,
        }
    }

    /// Promotes a single to a group member, zeroing `mass` and backing it up in `mass_bk`
    /// (INV-M). Fails if the particle is already grouped or artificial.
    pub fn promote_to_member(&mut self, cm_index: usize) -> Result<()> {
        if !self.role.is_single() {
            return Err(Error::InvariantViolation(format!(
                "particle {:?} is not a single, cannot promote to member",
                self.id
            )));
        }
        self.mass_bk = self.mass;
        self.mass = 0.0;
        self.role = ParticleRole::Member { cm_index };
        Ok(())
    }

    /// Demotes a group member back to a single, restoring `mass` from `mass_bk` and clearing the
    /// backup (INV-M). Fails if the particle is not currently a member.
    pub fn demote_to_single(&mut self) -> Result<()> {
        if !self.role.is_member() {
            return Err(Error::InvariantViolation(format!(
                "particle {:?} is not a group member, cannot demote",
                self.id
            )));
        }
        if self.mass_bk <= 0.0 {
            return Err(Error::InvariantViolation(format!(
                "particle {:?} has non-positive mass_bk {} while grouped",
                self.id, self.mass_bk
            )));
        }
        self.mass = self.mass_bk;
        self.mass_bk = 0.0;
        self.role = ParticleRole::Single;
        Ok(())
    }

    /// Checks INV-M: while grouped, `mass == 0` and `mass_bk > 0`; otherwise `mass_bk == 0`.
    pub fn check_inv_m(&self) -> Result<()> {
        match self.role {
            ParticleRole::Member { .. } => {
                if self.mass != 0.0 || self.mass_bk <= 0.0 {
                    return Err(Error::InvariantViolation(format!(
                        "INV-M violated for particle {:?}: mass={}, mass_bk={}",
                        self.id, self.mass, self.mass_bk
                    )));
                }
            }
            _ => {
                if self.mass_bk != 0.0 {
                    return Err(Error::InvariantViolation(format!(
                        "INV-M violated for particle {:?}: ungrouped but mass_bk={}",
                        self.id, self.mass_bk
                    )));
                }
            }
        }
        Ok(())
    }

    /// Checks INV-R: `r_search >= r_out`.
    pub fn check_inv_r(&self) -> Result<()> {
        if self.r_search < self.changeover.r_out {
            return Err(Error::InvariantViolation(format!(
                "INV-R violated for particle {:?}: r_search={} < r_out={}",
                self.id, self.r_search, self.changeover.r_out
            )));
        }
        Ok(())
    }

    /// Raises `r_search` to at least `r_search_cm`, as required on write-back for group members.
    pub fn absorb_cm_r_search(&mut self, r_search_cm: f64) {
        self.r_search = self.r_search.max(r_search_cm);
    }
}

/// An artificial particle: a transient probe or CM materialised for the duration of a hard step.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ArtificialParticle {
    /// Stable identifier, unique among artificial particles for the duration of the step.
    pub id: ParticleId,
    /// Mass. Zero for probes; the sum of member masses for the CM.
    pub mass: f64,
    /// Position.
    pub pos: Vector3<f64>,
    /// Velocity.
    pub vel: Vector3<f64>,
    /// Soft-force acceleration, filled by the external tree solver and corrected by
    /// [`crate::artificial::correct_artificial_particle_force`].
    pub acc: Vector3<f64>,
    /// Soft-force potential.
    pub pot: f64,
    /// Changeover radii (only meaningful for the CM).
    pub changeover: Changeover,
    /// Sub-role within the block.
    pub kind: ArtificialKind,
    /// Cluster this block belongs to.
    pub cluster_id: ClusterId,
    /// Group this block belongs to.
    pub group_id: GroupId,
    /// Number of real members in the owning group.
    pub member_count: usize,
    /// Id of the group's first member (by the canonical ascending order of C5).
    pub first_member_id: ParticleId,
}

impl ArtificialParticle {
    /// Whether this particle is a group's CM.
    #[must_use]
    pub const fn is_cm(&self) -> bool {
        matches!(self.kind, ArtificialKind::CenterOfMass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Particle {
        Particle::new_single(
            ParticleId(1),
            1.0,
            Vector3::zeros(),
            Vector3::zeros(),
            Changeover::new(0.01, 0.02),
        )
    }

    #[test]
    fn promote_then_demote_round_trips_mass() {
        let mut p = sample();
        let original_mass = p.mass;
        p.promote_to_member(7).unwrap();
        assert_eq!(p.mass, 0.0);
        assert_eq!(p.mass_bk, original_mass);
        p.check_inv_m().unwrap();
        p.demote_to_single().unwrap();
        assert_eq!(p.mass, original_mass);
        assert_eq!(p.mass_bk, 0.0);
        p.check_inv_m().unwrap();
    }

    #[test]
    fn double_promote_is_rejected() {
        let mut p = sample();
        p.promote_to_member(7).unwrap();
        assert!(p.promote_to_member(8).is_err());
    }

    #[test]
    fn inv_r_detects_search_radius_too_small() {
        let mut p = sample();
        p.r_search = p.changeover.r_out / 2.0;
        assert!(p.check_inv_r().is_err());
    }
}
