//! # Neighbor Lists
//!
//! ## Architecture
//!
//! - **Buffer Model** ([`buffer`]) - Estimates how large the pair-list buffer must be for a
//!   given refresh interval to keep the energy drift within the tolerance
//! - **Pair Lists** ([`list`]) - Buffered pair lists of the home particles of a rank

pub mod buffer;
pub mod list;

pub use buffer::{ListBufferModel, ListSetup, VerletBufferModel};
pub use list::PairList;
