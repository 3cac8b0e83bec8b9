//! # Workflows Module
//!
//! High-level entry points built from the engine and the core layer.
//!
//! ## Overview
//!
//! Workflows are what front ends call. Each one takes a request and its collaborators,
//! reports progress through a [`ProgressReporter`](crate::engine::progress::ProgressReporter)
//! and returns a summary of what happened, leaving presentation to the caller.
//!
//! ## Architecture
//!
//! - **Simulation Runs** ([`mdrun`]) - Plans the ranks, spawns them in-process or joins an
//!   externally provided rank set, and runs every rank to completion
//! - **Run Input Preparation** ([`prepare`]) - Builds a run input from a TOML system
//!   description
//! - **File Inspection** ([`inspect`]) - Summaries of run inputs, checkpoints,
//!   trajectories and matrices

pub mod inspect;
pub mod mdrun;
pub mod prepare;
