//! Changeover kernel (C1): a smooth radial switch between the soft and hard pairwise force.
//!
//! The one-sided switch `w(r; r_in, r_out)` is a quintic smoothstep: zero at `r <= r_in`, one at
//! `r >= r_out`, and `C^2` on `[r_in, r_out]` with both the first and second derivative vanishing
//! at each endpoint. The pairwise weight blends the two one-sided switches of the interacting
//! particles by a plain product, which is symmetric in `i`/`j` and collapses to the one-sided
//! switch whenever one side has no changeover of its own (`r_out == 0`, used by artificial
//! particles and `EPJSoft`-style records that carry no changeover).

use serde::{Deserialize, Serialize};

/// Round-off tolerance below which two `r_in` values are treated as exactly equal (see `spec.md`
/// §7: recoverable round-off promotes to a full changeover copy).
pub const R_IN_ROUND_OFF_TOL: f64 = 1e-10;

/// Per-particle changeover radii and the pending rescale for the next tree step.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Changeover {
    /// Inner radius: force is fully soft at or below this separation.
    pub r_in: f64,
    /// Outer radius: force is fully Newtonian at or above this separation.
    pub r_out: f64,
    /// Proposed rescale factor for `r_in`/`r_out` to be applied at the next tree step. `1.0`
    /// means no rescale is pending.
    pub r_scale_next: f64,
}

impl Changeover {
    /// Creates a changeover with no pending rescale.
    #[must_use]
    pub const fn new(r_in: f64, r_out: f64) -> Self {
        Self {
            r_in,
            r_out,
            r_scale_next: 1.0,
        }
    }

    /// A changeover with `r_out == 0`, used to mark "no changeover attached" (e.g. artificial
    /// particles outside the tidal-tensor/orbital role, or a soft-only record). Acts as the
    /// identity element in the pairwise blend.
    #[must_use]
    pub const fn inactive() -> Self {
        Self {
            r_in: 0.0,
            r_out: 0.0,
            r_scale_next: 1.0,
        }
    }

    /// Whether this changeover participates in the pairwise blend at all.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.r_out > 0.0
    }

    /// Returns the changeover rescaled by `r_scale_next`, with the pending rescale cleared.
    #[must_use]
    pub fn rescaled(&self) -> Self {
        Self {
            r_in: self.r_in * self.r_scale_next,
            r_out: self.r_out * self.r_scale_next,
            r_scale_next: 1.0,
        }
    }

    /// Whether a rescale is armed for the next tree step.
    #[must_use]
    pub fn needs_rescale(&self) -> bool {
        (self.r_scale_next - 1.0).abs() > f64::EPSILON
    }

    /// Reconciles two changeovers that are supposed to share `r_out` (INV-C, e.g. a CM and its
    /// members). Round-off differences in `r_in` smaller than [`R_IN_ROUND_OFF_TOL`] are snapped
    /// to the first value; otherwise the mismatch is reported so the caller can arm a rescale.
    #[must_use]
    pub fn reconcile_round_off(&self, other: &Self) -> ReconcileOutcome {
        let dr_in = (self.r_in - other.r_in).abs();
        let r_out_matches = (self.r_out - other.r_out).abs() <= R_IN_ROUND_OFF_TOL;

        if r_out_matches && dr_in < R_IN_ROUND_OFF_TOL {
            ReconcileOutcome::Snapped(Self::new(self.r_in, self.r_out))
        } else {
            ReconcileOutcome::Mismatched
        }
    }
}

/// Result of [`Changeover::reconcile_round_off`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// The two changeovers agreed to within round-off; the caller may use the snapped value.
    Snapped(Changeover),
    /// The two changeovers genuinely disagree; INV-C is violated and a rescale must be armed.
    Mismatched,
}

/// Quintic smoothstep `s(t) = t^3 (6t^2 - 15t + 10)`, `C^2` on `[0, 1]`.
fn smoothstep(t: f64) -> f64 {
    t * t * t * 10.0_f64.mul_add(1.0, t * (6.0 * t - 15.0))
}

/// Derivative `ds/dt = 30 t^2 (1 - t)^2`.
fn smoothstep_deriv(t: f64) -> f64 {
    let u = t * (1.0 - t);
    30.0 * u * u
}

/// One-sided switch `w(r; r_in, r_out)` and its radial derivative.
fn one_sided(r: f64, r_in: f64, r_out: f64) -> (f64, f64) {
    if r_out <= r_in {
        // degenerate changeover: treat as a step at r_in
        return (if r <= r_in { 0.0 } else { 1.0 }, 0.0);
    }
    if r <= r_in {
        (0.0, 0.0)
    } else if r >= r_out {
        (1.0, 0.0)
    } else {
        let t = (r - r_in) / (r_out - r_in);
        (smoothstep(t), smoothstep_deriv(t) / (r_out - r_in))
    }
}

/// Pairwise acceleration weight `K(c_i, c_j; r)`: the fraction of the true 1/r^2 force that
/// should be *removed* from the already-present hard-kernel contribution (i.e. `calcAcc0WTwo`
/// in the source). `r` must already be softened (`sqrt(dr^2 + eps_sq)`).
#[must_use]
pub fn calc_acc0_w_two(c_i: &Changeover, c_j: &Changeover, r: f64) -> f64 {
    let wi = if c_i.is_active() {
        one_sided(r, c_i.r_in, c_i.r_out).0
    } else {
        1.0
    };
    let wj = if c_j.is_active() {
        one_sided(r, c_j.r_in, c_j.r_out).0
    } else {
        1.0
    };
    wi * wj
}

/// Radial derivative of [`calc_acc0_w_two`], used by the KDKDK fourth-order correction.
#[must_use]
pub fn calc_acc1_w_two(c_i: &Changeover, c_j: &Changeover, r: f64) -> f64 {
    let (wi, wi_p) = if c_i.is_active() {
        one_sided(r, c_i.r_in, c_i.r_out)
    } else {
        (1.0, 0.0)
    };
    let (wj, wj_p) = if c_j.is_active() {
        one_sided(r, c_j.r_in, c_j.r_out)
    } else {
        (1.0, 0.0)
    };
    wi_p.mul_add(wj, wi * wj_p)
}

/// Pairwise potential weight. The quintic shape used for the acceleration switch is reused for
/// the potential switch (`K_pot ≡ K_acc`); see the open-question resolution in `DESIGN.md`.
#[must_use]
pub fn calc_pot_w_two(c_i: &Changeover, c_j: &Changeover, r: f64) -> f64 {
    calc_acc0_w_two(c_i, c_j, r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_exact() {
        let c = Changeover::new(0.1, 0.2);
        let inactive = Changeover::inactive();
        assert_eq!(calc_acc0_w_two(&c, &inactive, 0.1), 0.0);
        assert_eq!(calc_acc0_w_two(&c, &inactive, 0.2), 1.0);
        assert_eq!(calc_pot_w_two(&c, &inactive, 0.1), 0.0);
        assert_eq!(calc_pot_w_two(&c, &inactive, 0.2), 1.0);
    }

    #[test]
    fn derivative_vanishes_at_endpoints() {
        let c = Changeover::new(0.1, 0.2);
        let inactive = Changeover::inactive();
        assert_eq!(calc_acc1_w_two(&c, &inactive, 0.1), 0.0);
        assert_eq!(calc_acc1_w_two(&c, &inactive, 0.2), 0.0);
    }

    #[test]
    fn monotone_and_bounded() {
        let c = Changeover::new(0.1, 0.2);
        let inactive = Changeover::inactive();
        let mut prev = 0.0;
        let mut r = 0.1;
        while r <= 0.2 {
            let w = calc_acc0_w_two(&c, &inactive, r);
            assert!((0.0..=1.0).contains(&w));
            assert!(w >= prev - 1e-12);
            prev = w;
            r += 0.001;
        }
    }

    #[test]
    fn symmetric_in_pair() {
        let a = Changeover::new(0.1, 0.2);
        let b = Changeover::new(0.05, 0.3);
        assert_eq!(calc_acc0_w_two(&a, &b, 0.15), calc_acc0_w_two(&b, &a, 0.15));
    }

    #[test]
    fn round_off_snaps() {
        let a = Changeover::new(0.1, 0.2);
        let b = Changeover::new(0.1 + 1e-12, 0.2);
        match a.reconcile_round_off(&b) {
            ReconcileOutcome::Snapped(c) => assert_eq!(c.r_in, 0.1),
            ReconcileOutcome::Mismatched => panic!("expected round-off to snap"),
        }
    }

    #[test]
    fn genuine_mismatch_detected() {
        let a = Changeover::new(0.1, 0.2);
        let b = Changeover::new(0.2, 0.2);
        assert_eq!(a.reconcile_round_off(&b), ReconcileOutcome::Mismatched);
    }
}
