//! # Physics Collaborators
//!
//! The force evaluation the orchestration layer drives but does not own. Ranks build
//! their collaborators through a [`PhysicsFactory`] when they start running.
//!
//! ## Architecture
//!
//! - **Pair Potentials** ([`potentials`]) - Lennard-Jones and Coulomb kernels
//! - **Short-Range Providers** ([`provider`]) - The [`ForceProvider`] seam and the
//!   reference Lennard-Jones fluid evaluated over pair lists
//! - **Mesh Solvers** ([`mesh`]) - The [`MeshSolver`] seam for the long-range part that
//!   dedicated ranks may take over

pub mod mesh;
pub mod potentials;
pub mod provider;

pub use mesh::{DispersionCorrection, MeshSolver, NullMesh};
pub use provider::{ForceOutput, ForceProvider, LennardJonesFluid, PhysicsFactory, ReferencePhysics};
