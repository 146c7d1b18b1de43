//! Force-correction engine (C6): upgrades the tree's linear-cutoff soft force to the true
//! changeover kernel for every pair that needs it.
//!
//! The external soft solver evaluates a *linear-cutoff* pair kernel, truncated at `r_out_base`
//! rather than blended by [`crate::changeover`]. Every function here is grounded line-for-line on
//! `calcAccPotShortWithLinearCutoff` / `calcAccChangeOverCorrection` in `hard.hpp`: compute what
//! the linear-cutoff kernel already contributed, compute what the true kernel should have
//! contributed, and apply the difference.

use crate::changeover::{calc_acc0_w_two, calc_acc1_w_two, Changeover};
use crate::error::Result;
use crate::ids::ClusterId;
use crate::manager::HardManager;
use crate::particle::{ArtificialParticle, Particle, ParticleRole};
use nalgebra::Vector3;

/// The role a pairwise partner `j` plays, which selects the potential-correction branch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PairKind {
    /// An isolated single.
    Single,
    /// A bound-group member (mass is zeroed; `mass_bk` holds the physical mass).
    Member,
    /// An artificial particle (probe or CM).
    Artificial,
}

/// A pairwise partner, abstracted away from whether it is a live [`Particle`], an
/// [`ArtificialParticle`], or a tree-neighbor record built on the fly (the source's `EPJSoft`
/// case, which carries raw `(r_in, r_out)` fields rather than an attached [`Changeover`]).
#[derive(Clone, Copy, Debug)]
pub struct SoftNeighbor {
    /// Position.
    pub pos: Vector3<f64>,
    /// Mass as carried on the record (zero for a member or a probe).
    pub mass: f64,
    /// Backup mass, meaningful only when `kind == PairKind::Member`.
    pub mass_bk: f64,
    /// Inner changeover radius.
    pub r_in: f64,
    /// Outer changeover radius.
    pub r_out: f64,
    /// Potential-correction branch.
    pub kind: PairKind,
}

impl SoftNeighbor {
    /// Builds a neighbor record from a live [`Particle`].
    #[must_use]
    pub fn from_particle(p: &Particle) -> Self {
        let kind = match p.role {
            ParticleRole::Single => PairKind::Single,
            ParticleRole::Member { .. } => PairKind::Member,
            ParticleRole::Artificial(_) => PairKind::Artificial,
        };
        Self {
            pos: p.pos,
            mass: p.mass,
            mass_bk: p.mass_bk,
            r_in: p.changeover.r_in,
            r_out: p.changeover.r_out,
            kind,
        }
    }

    /// Builds a neighbor record from an [`ArtificialParticle`].
    #[must_use]
    pub fn from_artificial(a: &ArtificialParticle) -> Self {
        Self {
            pos: a.pos,
            mass: a.mass,
            mass_bk: 0.0,
            r_in: a.changeover.r_in,
            r_out: a.changeover.r_out,
            kind: PairKind::Artificial,
        }
    }

    /// Builds a neighbor record on the fly from raw `(r_in, r_out)`, mirroring the source's
    /// `EPJSoft`-built overload that carries no attached [`Changeover`].
    #[must_use]
    pub fn from_raw(pos: Vector3<f64>, mass: f64, r_in: f64, r_out: f64, kind: PairKind) -> Self {
        Self {
            pos,
            mass,
            mass_bk: 0.0,
            r_in,
            r_out,
            kind,
        }
    }

    fn changeover(&self) -> Changeover {
        Changeover::new(self.r_in, self.r_out)
    }

    /// The mass to use in both the acceleration and potential correction: `mass_bk` for a member
    /// (whose `mass` field is zeroed while grouped), `mass` otherwise.
    fn effective_mass(&self) -> f64 {
        if self.kind == PairKind::Member {
            self.mass_bk
        } else {
            self.mass
        }
    }
}

/// `(acceleration delta on i, potential delta on i)` from upgrading one ordered pair `(i, j)`
/// from the linear-cutoff kernel to the true changeover kernel.
#[must_use]
pub fn calc_acc_pot_correction(
    pos_i: Vector3<f64>,
    c_i: &Changeover,
    j: &SoftNeighbor,
    eps_sq: f64,
    r_out_base: f64,
) -> (Vector3<f64>, f64) {
    let m_j = j.effective_mass();
    if m_j == 0.0 {
        return (Vector3::zeros(), 0.0);
    }
    let c_j = j.changeover();

    let dr = pos_i - j.pos;
    let r2 = dr.norm_squared();
    let dr_eps = (r2 + eps_sq).sqrt();
    let drinv = 1.0 / dr_eps;

    let movr = m_j * drinv;
    let movr3 = movr * drinv * drinv;
    let k = 1.0 - calc_acc0_w_two(c_i, &c_j, dr_eps);

    let r_out2 = r_out_base * r_out_base;
    let r2_clamped = r2.max(r_out2);
    let movr3_max = m_j * r2_clamped.powf(-1.5);
    let movr_max = m_j * r2_clamped.sqrt().recip();

    let acc_delta = -(movr3.mul_add(k, -movr3_max)) * dr;

    let pot_delta = match j.kind {
        PairKind::Single | PairKind::Member => -(movr - movr_max),
        PairKind::Artificial => movr_max,
    };

    (acc_delta, pot_delta)
}

/// Self-potential correction for an isolated single: `m_i / r_out_base`. Group members and
/// artificial particles receive no self-potential term.
#[must_use]
pub fn self_potential_correction(mass: f64, r_out_base: f64) -> f64 {
    mass / r_out_base
}

/// Acceleration-only delta from a changeover rescale (`calcAccChangeOverCorrection`): subtracts
/// the contribution computed with the pair's *old* radii and adds the contribution computed with
/// the *new*, rescaled radii. `r_out_base`'s clamp term is unaffected by a rescale and cancels, so
/// only the `k` weight differs between the two evaluations.
#[must_use]
pub fn calc_acc_changeover_correction(
    pos_i: Vector3<f64>,
    c_i_old: &Changeover,
    c_i_new: &Changeover,
    pos_j: Vector3<f64>,
    c_j_old: &Changeover,
    c_j_new: &Changeover,
    m_j_eff: f64,
    eps_sq: f64,
) -> Vector3<f64> {
    if m_j_eff == 0.0 {
        return Vector3::zeros();
    }
    let dr = pos_i - pos_j;
    let r2 = dr.norm_squared();
    let dr_eps = (r2 + eps_sq).sqrt();
    let drinv = 1.0 / dr_eps;
    let movr3 = m_j_eff * drinv * drinv * drinv;

    let k_old = 1.0 - calc_acc0_w_two(c_i_old, c_j_old, dr_eps);
    let k_new = 1.0 - calc_acc0_w_two(c_i_new, c_j_new, dr_eps);

    -(movr3 * (k_new - k_old)) * dr
}

/// Raw-radii overload of [`calc_acc_changeover_correction`], for the `EPJSoft`-built-on-the-fly
/// case where no attached [`Changeover`] exists yet.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn calc_acc_changeover_correction_raw(
    pos_i: Vector3<f64>,
    r_in_i_old: f64,
    r_out_i_old: f64,
    r_in_i_new: f64,
    r_out_i_new: f64,
    pos_j: Vector3<f64>,
    r_in_j_old: f64,
    r_out_j_old: f64,
    r_in_j_new: f64,
    r_out_j_new: f64,
    m_j_eff: f64,
    eps_sq: f64,
) -> Vector3<f64> {
    calc_acc_changeover_correction(
        pos_i,
        &Changeover::new(r_in_i_old, r_out_i_old),
        &Changeover::new(r_in_i_new, r_out_i_new),
        pos_j,
        &Changeover::new(r_in_j_old, r_out_j_old),
        &Changeover::new(r_in_j_new, r_out_j_new),
        m_j_eff,
        eps_sq,
    )
}

/// Fourth-order acceleration-derivative correction used by the Hermite KDKDK path
/// (`calcAcorrShortWithLinearCutoff` / `calcAcc1WTwo`).
///
/// The source's own expression for this term reduces to `acc - acc` (identically zero — see the
/// Open Question recorded in `DESIGN.md`). This reconstructs the intended quantity analytically
/// from the radial derivative of the changeover weight, `calc_acc1_w_two`, rather than silently
/// keeping the source's dead code: `d/dr[-movr3 * k] `, expanded via the product rule, projected
/// onto the pair's relative velocity.
#[must_use]
pub fn calc_acorr_short_with_linear_cutoff(
    pos_i: Vector3<f64>,
    vel_i: Vector3<f64>,
    c_i: &Changeover,
    j_pos: Vector3<f64>,
    j_vel: Vector3<f64>,
    j: &SoftNeighbor,
    eps_sq: f64,
) -> Vector3<f64> {
    let m_j = j.effective_mass();
    if m_j == 0.0 {
        return Vector3::zeros();
    }
    let c_j = j.changeover();

    let dr = pos_i - j_pos;
    let dv = vel_i - j_vel;
    let r2 = dr.norm_squared();
    let dr_eps = (r2 + eps_sq).sqrt();
    let drinv = 1.0 / dr_eps;
    let rv_over_r2 = dr.dot(&dv) * drinv * drinv;

    let movr3 = m_j * drinv * drinv * drinv;
    let k = 1.0 - calc_acc0_w_two(c_i, &c_j, dr_eps);
    let k1 = -calc_acc1_w_two(c_i, &c_j, dr_eps);

    // d(movr3)/dt = -3 * movr3 * (dr.dv)/r^2 ; d(k)/dt = k1 * d(dr_eps)/dt = k1 * (dr.dv)/dr_eps
    let dmovr3_dt = -3.0 * movr3 * rv_over_r2;
    let dk_dt = k1 * dr.dot(&dv) * drinv;

    -(dmovr3_dt * k + movr3 * dk_dt) * dr - (movr3 * k) * dv
}

/// Cluster-local driver: `O(n^2)` among a cluster's real particles, plus `O(n * n_art)` against
/// every group's artificial-particle block. Skips pairs where neither side carries mass (e.g. two
/// probes), which contribute nothing by construction.
pub fn correct_cluster_local(
    _cluster_id: ClusterId,
    members: &mut [Particle],
    blocks: &[Vec<ArtificialParticle>],
    manager: &HardManager,
) -> Result<()> {
    let n = members.len();
    let neighbors: Vec<SoftNeighbor> = members.iter().map(SoftNeighbor::from_particle).collect();

    for i in 0..n {
        let pos_i = members[i].pos;
        let c_i = members[i].changeover;
        let mut acc_acc = Vector3::zeros();
        let mut pot_acc = 0.0;

        for (j, neighbor) in neighbors.iter().enumerate() {
            if i == j {
                continue;
            }
            let (d_acc, d_pot) =
                calc_acc_pot_correction(pos_i, &c_i, neighbor, manager.eps_sq, manager.ap.r_out_base);
            acc_acc += d_acc;
            pot_acc += d_pot;
        }

        for block in blocks {
            for art in block {
                let neighbor = SoftNeighbor::from_artificial(art);
                let (d_acc, d_pot) =
                    calc_acc_pot_correction(pos_i, &c_i, &neighbor, manager.eps_sq, manager.ap.r_out_base);
                acc_acc += d_acc;
                pot_acc += d_pot;
            }
        }

        if members[i].role.is_single() {
            pot_acc += self_potential_correction(members[i].mass, manager.ap.r_out_base);
        }

        members[i].acc += acc_acc;
        members[i].pot += pot_acc;
    }
    Ok(())
}

/// Tree-neighbor driver: per real particle, corrects against an externally supplied neighbor
/// list (typically the tree's interaction list). Artificial particles are not present in tree
/// neighbor lists (probes carry no meaningful spatial locality for the tree), so their correction
/// is supplied separately via `artificial_neighbors`, keyed by cluster membership rather than
/// tree adjacency.
pub fn correct_tree_neighbor(
    particle: &mut Particle,
    tree_neighbors: &[SoftNeighbor],
    artificial_neighbors: &[SoftNeighbor],
    manager: &HardManager,
) -> Result<()> {
    let pos_i = particle.pos;
    let c_i = particle.changeover;
    let mut acc_acc = Vector3::zeros();
    let mut pot_acc = 0.0;

    for neighbor in tree_neighbors.iter().chain(artificial_neighbors.iter()) {
        let (d_acc, d_pot) =
            calc_acc_pot_correction(pos_i, &c_i, neighbor, manager.eps_sq, manager.ap.r_out_base);
        acc_acc += d_acc;
        pot_acc += d_pot;
    }

    if particle.role.is_single() {
        pot_acc += self_potential_correction(particle.mass, manager.ap.r_out_base);
    }

    particle.acc += acc_acc;
    particle.pot += pot_acc;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ParticleId;

    #[test]
    fn correction_vanishes_for_massless_neighbor() {
        let c_i = Changeover::new(0.01, 0.05);
        let neighbor = SoftNeighbor::from_raw(Vector3::new(1.0, 0.0, 0.0), 0.0, 0.01, 0.05, PairKind::Artificial);
        let (acc, pot) = calc_acc_pot_correction(Vector3::zeros(), &c_i, &neighbor, 0.0, 0.1);
        assert_eq!(acc, Vector3::zeros());
        assert_eq!(pot, 0.0);
    }

    #[test]
    fn single_potential_branch_restores_full_newtonian_beyond_cutoff() {
        // far beyond both r_out and r_out_base: k -> 0, movr_max -> full 1/r, so pot correction
        // should exactly cancel the linear-cutoff's over-counted floor, leaving movr - movr == 0
        // only in the degenerate case r == r_out_base; here we just check the sign/branch choice.
        let c_i = Changeover::new(0.01, 0.05);
        let neighbor = SoftNeighbor::from_raw(Vector3::new(10.0, 0.0, 0.0), 1.0, 0.01, 0.05, PairKind::Single);
        let (_, pot) = calc_acc_pot_correction(Vector3::zeros(), &c_i, &neighbor, 0.0, 0.1);
        // at r=10 >> r_out_base=0.1, movr ≈ 0.1, movr_max ≈ 0.1, so correction ≈ 0
        assert!(pot.abs() < 1e-2);
    }

    #[test]
    fn member_uses_mass_bk_not_zeroed_mass() {
        let c_i = Changeover::new(0.01, 0.05);
        let mut neighbor =
            SoftNeighbor::from_raw(Vector3::new(1.0, 0.0, 0.0), 0.0, 0.01, 0.05, PairKind::Member);
        neighbor.mass_bk = 2.0;
        let (acc, _) = calc_acc_pot_correction(Vector3::zeros(), &c_i, &neighbor, 0.0, 0.1);
        assert_ne!(acc, Vector3::zeros());
    }

    #[test]
    fn changeover_correction_round_trip_cancels_exactly() {
        let old = Changeover::new(0.01, 0.05);
        let new = Changeover::new(0.02, 0.06);
        let inactive = Changeover::inactive();
        let pos_i = Vector3::new(0.03, 0.0, 0.0);
        let pos_j = Vector3::zeros();

        let forward =
            calc_acc_changeover_correction(pos_i, &old, &new, pos_j, &inactive, &inactive, 1.0, 0.0);
        let backward =
            calc_acc_changeover_correction(pos_i, &new, &old, pos_j, &inactive, &inactive, 1.0, 0.0);
        assert!((forward + backward).norm() < 1e-12);
    }

    #[test]
    fn cluster_local_driver_applies_self_potential_to_singles_only() {
        let manager = HardManager::default();
        let mut members = vec![
            Particle::new_single(ParticleId(0), 1.0, Vector3::zeros(), Vector3::zeros(), Changeover::new(0.01, 0.05)),
            Particle::new_single(
                ParticleId(1),
                1.0,
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::zeros(),
                Changeover::new(0.01, 0.05),
            ),
        ];
        correct_cluster_local(ClusterId(0), &mut members, &[], &manager).unwrap();
        assert!(members[0].pot != 0.0);
    }
}
