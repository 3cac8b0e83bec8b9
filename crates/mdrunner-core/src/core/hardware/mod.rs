//! # Hardware Discovery
//!
//! Discovers what a run can use on this machine, once per process group.
//!
//! ## Architecture
//!
//! - **CPU** ([`cpu`]) - SIMD capability tier parsed from the processor flags
//! - **Accelerators** ([`gpu`]) - PCI scan for accelerator devices and their compatibility
//! - **Probe** ([`probe`]) - The [`HardwareProbe`] seam combining both with the usable
//!   hardware thread count into a [`HardwareInventory`]

pub mod cpu;
pub mod gpu;
pub mod probe;

pub use cpu::SimdTier;
pub use gpu::GpuDevice;
pub use probe::{HardwareError, HardwareInventory, HardwareProbe, StaticProbe, SystemProbe};
