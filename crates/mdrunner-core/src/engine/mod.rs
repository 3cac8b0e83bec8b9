//! # Engine Module
//!
//! The orchestration layer that turns one run request into a configured set of
//! cooperating ranks and drives each of them through its lifecycle.
//!
//! ## Overview
//!
//! A run is planned once by the coordinating rank, which reads the run input, probes the
//! hardware and decides how many ranks run with how many threads. Missing ranks are
//! spawned in-process as named threads connected by a message fabric. Every rank then
//! walks the same sequence of phases; each decision taken on the coordinator is
//! broadcast, so that all ranks observe identical values in the same order and fail
//! together when a decision fails.
//!
//! ## Architecture
//!
//! - **Run Requests** ([`config`]) - The user request, its builder and the tuning constants
//! - **Resource Planning** ([`planner`]) - Accelerator decision, rank and thread counts
//! - **Rank Fabric** ([`comm`]) - Point-to-point messages and collectives between ranks
//! - **Bootstrap** ([`bootstrap`]) - Topology planning, rank spawning and the per-rank
//!   phase sequence
//! - **Duty Assignment** ([`duty`], [`domain`]) - Spatial and long-range duties, the
//!   decomposition grid and accelerator hand-out
//! - **List Tuning** ([`tuner`]) - The search for the pair-list refresh interval
//! - **Restart** ([`restart`]) - Checkpoint loading and reconciliation with the request
//! - **Run Configuration** ([`run_config`]) - The finalized parameters and their
//!   cross-rank consistency check
//! - **Lifecycle** ([`lifecycle`]) - The rank state machine
//! - **Algorithms** ([`integrators`]) - Dynamics, minimization, normal modes, particle
//!   insertion and the long-range service
//! - **Shared State** ([`context`]) - Stop signal, deform reference and device registry
//! - **Compute Resources** ([`resources`]) - Per-rank thread pools and accelerator leases
//! - **Accounting** ([`accounting`]) - Per-stage wall time and performance summary
//! - **Progress Monitoring** ([`progress`]) - Events for user interfaces
//! - **Error Handling** ([`error`]) - The engine error taxonomy

pub mod accounting;
pub mod bootstrap;
pub mod comm;
pub mod config;
pub mod context;
pub mod domain;
pub mod duty;
pub mod error;
pub mod integrators;
pub mod lifecycle;
pub mod planner;
pub mod progress;
pub mod resources;
pub mod restart;
pub mod run_config;
pub mod tuner;
