//! Hard-cluster diagnostic dump (`spec.md` §6): a snapshot sufficient to reproduce a hang or a
//! divergent step offline, written whenever the driver (C9) hits a fatal error.

use crate::ids::ClusterId;
use crate::particle::Particle;
use crate::persist::{read_binary, write_binary};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// A raw snapshot of one cluster's members at the start of its hard step, plus the parameters
/// that produced a fatal error, so the step can be replayed offline.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HardDump {
    /// The cluster this dump belongs to.
    pub cluster_id: ClusterId,
    /// The cluster's real particles at the start of the step.
    pub particles: Vec<Particle>,
    /// The step's target duration.
    pub dt: f64,
    /// The artificial-particle manager's `n_split` at the time of the dump.
    pub n_split: usize,
    /// Human-readable description of what triggered the dump (e.g. the offending error).
    pub reason: String,
}

impl HardDump {
    /// Captures a dump for `cluster_id`.
    #[must_use]
    pub fn capture(cluster_id: ClusterId, particles: &[Particle], dt: f64, n_split: usize, reason: impl Into<String>) -> Self {
        Self {
            cluster_id,
            particles: particles.to_vec(),
            dt,
            n_split,
            reason: reason.into(),
        }
    }

    /// Writes this dump using the crate's canonical binary layout.
    pub fn write_binary<W: Write>(&self, writer: W) -> Result<()> {
        write_binary(self, writer)
    }

    /// Reads a dump back. An incomplete record is [`crate::error::Error::PersistenceTruncated`].
    pub fn read_binary<R: Read>(reader: R) -> Result<Self> {
        read_binary(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeover::Changeover;
    use crate::ids::ParticleId;
    use nalgebra::Vector3;

    #[test]
    fn round_trips() {
        let particles = vec![Particle::new_single(
            ParticleId(0),
            1.0,
            Vector3::zeros(),
            Vector3::zeros(),
            Changeover::new(0.01, 0.05),
        )];
        let dump = HardDump::capture(ClusterId(3), &particles, 0.0625, 8, "energy error exceeded tolerance");

        let mut buf = Vec::new();
        dump.write_binary(&mut buf).unwrap();
        let back = HardDump::read_binary(&buf[..]).unwrap();
        assert_eq!(dump, back);
    }

    #[test]
    fn truncated_dump_is_fatal() {
        let particles = vec![Particle::new_single(
            ParticleId(0),
            1.0,
            Vector3::zeros(),
            Vector3::zeros(),
            Changeover::new(0.01, 0.05),
        )];
        let dump = HardDump::capture(ClusterId(3), &particles, 0.0625, 8, "test");
        let mut buf = Vec::new();
        dump.write_binary(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(HardDump::read_binary(&buf[..]).is_err());
    }
}
