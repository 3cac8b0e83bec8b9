//! # mdrunner Core Library
//!
//! The bootstrap and coordination layer of a parallel molecular dynamics engine. Given a
//! single run request it discovers the hardware, decides how many cooperating ranks to run
//! and what role each plays, tunes the neighbor-list refresh interval for the hardware at
//! hand, restores checkpointed state consistently on every rank, and then hands control to
//! exactly one long-running algorithm.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Stateless data models (`InputParameters`, `RunState`,
//!   `ObservablesHistory`), the record I/O layer and its file formats, hardware discovery,
//!   periodic-box geometry and the Verlet buffer model.
//!
//! - **[`engine`]: The Logic Core.** The stateful orchestration layer: the resource planner,
//!   the in-process rank fabric and bootstrap, the duty assigner, the list-interval tuner,
//!   the restart reconciler, the lifecycle state machine and the algorithms dispatched at
//!   the end of it.
//!
//! - **[`workflows`]: The Public API.** Complete procedures built from the two layers below:
//!   running a simulation, preparing a run input from a system description, and inspecting
//!   run files.

pub mod core;
pub mod engine;
pub mod workflows;
