use super::cpu::{self, SimdTier};
use super::gpu::{self, GpuDevice};
use std::path::PathBuf;
use sysinfo::{CpuRefreshKind, System};
use thiserror::Error;
use tracing::{debug, info};

/// Overrides the PCI scan with a comma-separated list of device names.
pub const GPU_DEVICES_ENV: &str = "MDRUNNER_GPU_DEVICES";
/// Lets the planner use the accelerator code path without a device.
pub const EMULATE_GPU_ENV: &str = "MDRUNNER_EMULATE_GPU";

const PCI_DEVICES_ROOT: &str = "/sys/bus/pci/devices";

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Could not determine the number of hardware threads")]
    NoHardwareThreads,
}

/// What this machine offers a run. Discovered once and shared by every rank.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HardwareInventory {
    pub cpu_model: Option<String>,
    pub simd: SimdTier,
    pub hardware_threads: usize,
    pub gpus: Vec<GpuDevice>,
    pub gpu_emulation: bool,
}

impl HardwareInventory {
    pub fn compatible_gpus(&self) -> impl Iterator<Item = &GpuDevice> {
        self.gpus.iter().filter(|g| g.compatible)
    }

    pub fn compatible_gpu_count(&self) -> usize {
        self.compatible_gpus().count()
    }

    pub fn log_summary(&self) {
        info!(
            cpu = self.cpu_model.as_deref().unwrap_or("unknown"),
            simd = %self.simd,
            hardware_threads = self.hardware_threads,
            gpus = self.gpus.len(),
            compatible_gpus = self.compatible_gpu_count(),
            "Detected hardware."
        );
        for gpu in &self.gpus {
            debug!(id = gpu.id, name = %gpu.name, compatible = gpu.compatible, "Accelerator.");
        }
    }
}

/// Source of the hardware inventory.
pub trait HardwareProbe: Send + Sync {
    fn probe(&self) -> Result<HardwareInventory, HardwareError>;
}

/// Probes the machine the process runs on.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    pub pci_root: PathBuf,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            pci_root: PathBuf::from(PCI_DEVICES_ROOT),
        }
    }
}

impl HardwareProbe for SystemProbe {
    fn probe(&self) -> Result<HardwareInventory, HardwareError> {
        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        let hardware_threads = match system.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .map_err(|_| HardwareError::NoHardwareThreads)?,
            n => n,
        };

        let (cpu_model, simd) = cpu::probe_cpu();
        let gpus = match std::env::var(GPU_DEVICES_ENV) {
            Ok(list) => gpu::parse_device_list(&list),
            Err(_) => gpu::scan_pci(&self.pci_root),
        };
        let gpu_emulation = std::env::var_os(EMULATE_GPU_ENV).is_some();

        Ok(HardwareInventory {
            cpu_model,
            simd,
            hardware_threads,
            gpus,
            gpu_emulation,
        })
    }
}

/// Returns a fixed inventory; used when the hardware is known in advance.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(pub HardwareInventory);

impl HardwareProbe for StaticProbe {
    fn probe(&self) -> Result<HardwareInventory, HardwareError> {
        if self.0.hardware_threads == 0 {
            return Err(HardwareError::NoHardwareThreads);
        }
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_probe_reports_at_least_one_thread() {
        let probe = SystemProbe {
            pci_root: PathBuf::from("/nonexistent/pci"),
        };
        let inventory = probe.probe().unwrap();
        assert!(inventory.hardware_threads >= 1);
    }

    #[test]
    fn static_probe_requires_threads() {
        assert!(StaticProbe::default().probe().is_err());
        let inventory = HardwareInventory {
            hardware_threads: 8,
            gpus: gpu::parse_device_list("a,b"),
            ..Default::default()
        };
        let probed = StaticProbe(inventory.clone()).probe().unwrap();
        assert_eq!(probed, inventory);
        assert_eq!(probed.compatible_gpu_count(), 2);
    }
}
