//! # Run Models
//!
//! Plain data describing a simulation: what to run ([`parameters`]), what is simulated
//! ([`topology`]), where the simulation currently is ([`state`]) and the accumulators that
//! must survive a restart ([`history`]).

pub mod history;
pub mod parameters;
pub mod state;
pub mod topology;
