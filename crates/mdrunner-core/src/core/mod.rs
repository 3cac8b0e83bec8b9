//! # Core Module
//!
//! Foundation types shared by every rank of a run.
//!
//! ## Architecture
//!
//! - **Run Models** ([`models`]) - Input parameters, particle topology, run state and the
//!   observables history carried across restarts
//! - **File I/O** ([`io`]) - The record-oriented file layer with its text, raw and portable
//!   backends, and the run input, checkpoint and trajectory formats built on it
//! - **Hardware Discovery** ([`hardware`]) - CPU SIMD tier, hardware thread count and
//!   accelerator inventory
//! - **Box Geometry** ([`geometry`]) - Periodic boundary helpers and cutoff limits
//! - **Neighbor Lists** ([`neighbor`]) - The Verlet buffer model and pair-list construction
//! - **Physics** ([`physics`]) - The force-provider and mesh-solver seams with their
//!   reference implementations

pub mod geometry;
pub mod hardware;
pub mod io;
pub mod models;
pub mod neighbor;
pub mod physics;
