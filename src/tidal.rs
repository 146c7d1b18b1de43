//! Tidal tensor probe (C3): an 8-point cubic fit of the external tidal field around a group's CM.
//!
//! The fit is a per-axis linear least squares of the sampled accelerations against the probe
//! offsets from the CM (`a_k ≈ T · dr_k`), solved once via the normal equations shared across all
//! three output components. A rank-deficient stencil (fewer than 3 independent offset directions)
//! is an invariant violation rather than a silent zero tensor.

use crate::error::{Error, Result};
use nalgebra::{DMatrix, Matrix3, Vector3};

/// A linearised external tidal field sampled at a group's CM.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TidalTensor {
    /// The fitted tensor `T` such that the perturbing acceleration at offset `dr` from the CM is
    /// `T * dr`.
    pub tensor: Matrix3<f64>,
}

impl TidalTensor {
    /// Fits a tidal tensor from `n >= 3` independent `(offset, acceleration)` sample pairs. The
    /// accelerations must already have the probe's own internal (CM) acceleration subtracted, so
    /// only the external field remains (`correctArtficialParticleForce`'s first responsibility).
    pub fn fit(offsets: &[Vector3<f64>], accelerations: &[Vector3<f64>]) -> Result<Self> {
        if offsets.len() != accelerations.len() {
            return Err(Error::InvariantViolation(
                "tidal tensor fit requires matching offset/acceleration counts".to_string(),
            ));
        }
        if offsets.len() < 3 {
            return Err(Error::InvariantViolation(format!(
                "tidal tensor fit requires at least 3 probes, got {}",
                offsets.len()
            )));
        }

        let n = offsets.len();
        let design = DMatrix::from_fn(n, 3, |row, col| offsets[row][col]);
        let rhs = DMatrix::from_fn(n, 3, |row, col| accelerations[row][col]);

        let normal = design.transpose() * &design;
        let cholesky = normal.cholesky().ok_or_else(|| {
            Error::InvariantViolation(
                "tidal tensor stencil is rank-deficient (probes are coplanar or coincident)"
                    .to_string(),
            )
        })?;
        let solved = cholesky.solve(&(design.transpose() * &rhs));

        Ok(Self {
            tensor: Matrix3::from_fn(|row, col| solved[(col, row)]),
        })
    }

    /// Evaluates the perturbing acceleration at offset `dr` from the CM.
    #[must_use]
    pub fn eval(&self, dr: Vector3<f64>) -> Vector3<f64> {
        self.tensor * dr
    }
}

/// Generates the 8 cube-vertex offsets of the tidal-tensor sampling stencil, scaled by
/// `r_tidal_tensor`, in the fixed order the artificial-particle manager relies on.
#[must_use]
pub fn cube_stencil_offsets(r_tidal_tensor: f64) -> [Vector3<f64>; 8] {
    let s = r_tidal_tensor / 3.0_f64.sqrt();
    let mut offsets = [Vector3::zeros(); 8];
    for (k, offset) in offsets.iter_mut().enumerate() {
        let sx = if k & 1 == 0 { s } else { -s };
        let sy = if k & 2 == 0 { s } else { -s };
        let sz = if k & 4 == 0 { s } else { -s };
        *offset = Vector3::new(sx, sy, sz);
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn recovers_a_known_linear_field() {
        let tensor = Matrix3::new(1.0, 0.2, 0.0, 0.2, -0.5, 0.1, 0.0, 0.1, -0.5);
        let offsets = cube_stencil_offsets(0.01);
        let accelerations: Vec<_> = offsets.iter().map(|dr| tensor * dr).collect();

        let fitted = TidalTensor::fit(&offsets, &accelerations).unwrap();

        for dr in &offsets {
            let expected = tensor * dr;
            let got = fitted.eval(*dr);
            for k in 0..3 {
                assert!(approx_eq!(f64, expected[k], got[k], epsilon = 1e-9));
            }
        }
    }

    #[test]
    fn coplanar_stencil_is_rejected() {
        let offsets = vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(-1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, -1.0, 0.0),
        ];
        let accelerations = vec![Vector3::zeros(); 4];
        assert!(TidalTensor::fit(&offsets, &accelerations).is_err());
    }
}
