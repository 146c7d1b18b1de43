//! Newtype identifiers used throughout the hard subsystem.

use serde::{Deserialize, Serialize};

/// Identifier of a real particle, stable across the hard step. Negative values never occur for
/// locally-owned particles; they are reserved by [`Particle::adr_org`](crate::particle::Particle::adr_org)
/// to flag remote ownership, not carried here.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ParticleId(pub i64);

/// Identifier of a cluster, unique for the duration of one tree step.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ClusterId(pub u32);

/// Identifier of a group within a cluster, assigned deterministically by first-member id.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct GroupId(pub u32);

impl From<i64> for ParticleId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<u32> for ClusterId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<u32> for GroupId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
