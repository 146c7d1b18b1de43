#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! Hard-subsystem core of a parallel collisional N-body gravitational integrator.
//!
//! This crate implements the close-encounter sub-stepping core described in `spec.md`: group
//! discovery (C5), artificial-particle bookkeeping (C4), the changeover-kernel force correction
//! (C1, C6), the two-level hard integrator (C7 algorithmic regularisation, C8 Hermite), and the
//! per-cluster driver tying them together (C9). The surrounding tree-gravity step, domain
//! decomposition, particle file formats, and command-line driver are out of scope; see `spec.md`
//! §1.

pub mod ar;
pub mod artificial;
pub mod binary_tree;
pub mod changeover;
pub mod driver;
pub mod dump;
pub mod error;
pub mod force_correction;
pub mod group_search;
pub mod hermite;
pub mod ids;
pub mod manager;
pub mod particle;
pub mod persist;
pub mod perturber;
pub mod tidal;
