use phf::{Map, phf_map};
use std::fs;
use std::path::Path;

/// PCI class prefix shared by VGA (`0x0300xx`) and 3D (`0x0302xx`) controllers.
const DISPLAY_CLASS_PREFIX: &str = "0x03";

/// Vendors that ship display controllers, and whether the kernels support them.
static GPU_VENDORS: Map<&'static str, (&'static str, bool)> = phf_map! {
    "0x10de" => ("NVIDIA", true),
    "0x1002" => ("AMD", false),
    "0x8086" => ("Intel", false),
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    /// Index in discovery order; this is the id used for explicit assignment.
    pub id: usize,
    pub name: String,
    /// Whether the non-bonded kernels can run on this device.
    pub compatible: bool,
}

/// Scans a sysfs PCI device directory for display controllers.
///
/// Devices are reported in directory-name order so ids are stable between runs.
pub fn scan_pci(root: &Path) -> Vec<GpuDevice> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    dirs.sort();

    let mut devices = Vec::new();
    for dir in dirs {
        let read = |name: &str| {
            fs::read_to_string(dir.join(name))
                .map(|s| s.trim().to_ascii_lowercase())
                .unwrap_or_default()
        };
        if !read("class").starts_with(DISPLAY_CLASS_PREFIX) {
            continue;
        }
        let vendor = read("vendor");
        let Some((vendor_name, compatible)) = GPU_VENDORS.get(vendor.as_str()) else {
            continue;
        };
        let slot = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        devices.push(GpuDevice {
            id: devices.len(),
            name: format!("{} {} ({})", vendor_name, read("device"), slot),
            compatible: *compatible,
        });
    }
    devices
}

/// Parses a comma-separated list of device names, all treated as compatible.
pub fn parse_device_list(list: &str) -> Vec<GpuDevice> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .enumerate()
        .map(|(id, name)| GpuDevice {
            id,
            name: name.to_string(),
            compatible: true,
        })
        .collect()
}
