//! `HardManager`: the single configuration object threaded through every callee.
//!
//! The source exposes several process-wide static fields (`EPISoft::eps`, `FPSoft::r_out`, ...).
//! Per the REDESIGN FLAG in `spec.md` §9, this crate collects all global mutable parameters into
//! one struct and passes it explicitly, rather than relying on statics.

use crate::error::Result;
use crate::persist::{read_binary, write_binary};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Configuration for the artificial-particle manager (C4).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApManagerConfig {
    /// Number of orbital-sample points per group (block carries `2 * n_split` orbital probes).
    pub n_split: usize,
    /// Size of the tidal-tensor sampling stencil. PeTar fixes this at 8 (a cube's vertices).
    pub n_tidal_tensor: usize,
    /// Base inner changeover radius for newly-created CMs.
    pub r_in_base: f64,
    /// Base outer changeover radius for newly-created CMs.
    pub r_out_base: f64,
    /// Radius of the tidal-tensor sampling stencil around a group's CM.
    pub r_tidal_tensor: f64,
}

impl Default for ApManagerConfig {
    fn default() -> Self {
        Self {
            n_split: 8,
            n_tidal_tensor: 8,
            r_in_base: 1.0e-4,
            r_out_base: 1.0e-3,
            r_tidal_tensor: 1.0e-2,
        }
    }
}

/// Configuration for the Hermite block integrator (C8).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct H4ManagerConfig {
    /// Smallest permitted block timestep.
    pub dt_min: f64,
    /// Largest permitted block timestep.
    pub dt_max: f64,
    /// Aarseth step-size accuracy parameter `eta`.
    pub eta: f64,
    /// Maximum neighbor-search radius criterion.
    pub r_neighbor_crit: f64,
}

impl Default for H4ManagerConfig {
    fn default() -> Self {
        Self {
            dt_min: 1.0 / 1_048_576.0,
            dt_max: 1.0 / 64.0,
            eta: 0.1,
            r_neighbor_crit: 1.0e-3,
        }
    }
}

/// Configuration for the AR slow-down integrator (C7).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ArManagerConfig {
    /// Integration order of the symplectic composition scheme (6 or 8).
    pub integration_order: u32,
    /// Accuracy parameter scaling the characteristic pseudo-time step against the group's local
    /// two-body dynamical timescale (the AR analogue of `H4ManagerConfig::eta`).
    pub eta_ar: f64,
    /// Floor on the real (not slowed-down) integration step.
    pub time_step_real_min: f64,
    /// Maximum permitted inner-step count before the step is considered divergent.
    pub step_count_max: u64,
}

impl ArManagerConfig {
    /// `time_error_max_real = 0.25 * time_step_real_min`, as fixed by `spec.md` §4.5.
    #[must_use]
    pub fn time_error_max_real(&self) -> f64 {
        0.25 * self.time_step_real_min
    }
}

impl Default for ArManagerConfig {
    fn default() -> Self {
        Self {
            integration_order: 6,
            eta_ar: 0.1,
            time_step_real_min: 1.0e-6,
            step_count_max: 1_000_000,
        }
    }
}

/// All global, otherwise-static configuration for a hard step, threaded explicitly through every
/// public entry point (`spec.md` §6, §9).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HardManager {
    /// Gravitational constant.
    pub g: f64,
    /// Softening length squared, applied to all pairwise separations.
    pub eps_sq: f64,
    /// Maximum tolerated `|dE_SD|` before a step is a fatal divergence.
    pub energy_error_max: f64,
    /// Reciprocal of the mean particle mass, used to bound CM changeover radii.
    pub mean_mass_inv: f64,
    /// Upper bound on any dynamically-sized scratch array (`ARRAY_ALLOW_LIMIT`).
    pub array_allow_limit: usize,
    /// Artificial-particle manager configuration.
    pub ap: ApManagerConfig,
    /// Hermite block integrator configuration.
    pub h4: H4ManagerConfig,
    /// AR slow-down integrator configuration.
    pub ar: ArManagerConfig,
}

impl Default for HardManager {
    fn default() -> Self {
        Self {
            g: 1.0,
            eps_sq: 0.0,
            energy_error_max: 1.0e-6,
            mean_mass_inv: 1.0,
            array_allow_limit: 1_000_000,
            ap: ApManagerConfig::default(),
            h4: H4ManagerConfig::default(),
            ar: ArManagerConfig::default(),
        }
    }
}

impl HardManager {
    /// Validates cross-field consistency (`r_in_base < r_out_base`, `dt_min <= dt_max`, ...).
    pub fn check_params(&self) -> Result<()> {
        use crate::error::Error;

        if self.ap.r_in_base >= self.ap.r_out_base {
            return Err(Error::InvariantViolation(format!(
                "r_in_base ({}) must be < r_out_base ({})",
                self.ap.r_in_base, self.ap.r_out_base
            )));
        }
        if self.h4.dt_min > self.h4.dt_max {
            return Err(Error::InvariantViolation(format!(
                "dt_min ({}) must be <= dt_max ({})",
                self.h4.dt_min, self.h4.dt_max
            )));
        }
        if self.ar.integration_order != 6 && self.ar.integration_order != 8 {
            return Err(Error::InvariantViolation(format!(
                "unsupported AR integration order {}",
                self.ar.integration_order
            )));
        }
        Ok(())
    }

    /// Writes this manager to `writer`, serialising the nested blocks in the documented order
    /// `{ap, h4, ar}` followed by the remaining scalar fields.
    pub fn write_binary<W: Write>(&self, mut writer: W) -> Result<()> {
        write_binary(&self.ap, &mut writer)?;
        write_binary(&self.h4, &mut writer)?;
        write_binary(&self.ar, &mut writer)?;
        write_binary(&self.g, &mut writer)?;
        write_binary(&self.eps_sq, &mut writer)?;
        write_binary(&self.energy_error_max, &mut writer)?;
        write_binary(&self.mean_mass_inv, &mut writer)?;
        write_binary(&self.array_allow_limit, &mut writer)
    }

    /// Reads a manager back from `reader`. An incomplete record surfaces as
    /// [`crate::error::Error::PersistenceTruncated`].
    pub fn read_binary<R: Read>(mut reader: R) -> Result<Self> {
        let ap = read_binary(&mut reader)?;
        let h4 = read_binary(&mut reader)?;
        let ar = read_binary(&mut reader)?;
        let g = read_binary(&mut reader)?;
        let eps_sq = read_binary(&mut reader)?;
        let energy_error_max = read_binary(&mut reader)?;
        let mean_mass_inv = read_binary(&mut reader)?;
        let array_allow_limit = read_binary(&mut reader)?;
        Ok(Self {
            g,
            eps_sq,
            energy_error_max,
            mean_mass_inv,
            array_allow_limit,
            ap,
            h4,
            ar,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_passes_checks() {
        HardManager::default().check_params().unwrap();
    }

    #[test]
    fn binary_round_trip() {
        let manager = HardManager::default();
        let mut buf = Vec::new();
        manager.write_binary(&mut buf).unwrap();
        let back = HardManager::read_binary(&buf[..]).unwrap();
        assert_eq!(manager, back);
    }

    #[test]
    fn truncated_read_is_fatal() {
        let manager = HardManager::default();
        let mut buf = Vec::new();
        manager.write_binary(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(HardManager::read_binary(&buf[..]).is_err());
    }

    #[test]
    fn rejects_inverted_changeover_radii() {
        let mut manager = HardManager::default();
        manager.ap.r_in_base = manager.ap.r_out_base;
        assert!(manager.check_params().is_err());
    }
}
