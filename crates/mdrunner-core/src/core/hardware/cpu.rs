use std::fmt;
use std::fs;

/// The widest SIMD instruction set the non-bonded kernels can use.
///
/// Ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SimdTier {
    #[default]
    Scalar,
    Sse4,
    Avx2,
    Avx512,
    /// AVX-512 with the exponential and reciprocal extensions, found on many-core
    /// processors where pair-list work is relatively expensive.
    Avx512Er,
}

impl SimdTier {
    pub fn name(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Sse4 => "SSE4.1",
            Self::Avx2 => "AVX2",
            Self::Avx512 => "AVX-512",
            Self::Avx512Er => "AVX-512 ER",
        }
    }

    /// Wide SIMD tiers get a more generous list-buffer cost envelope.
    pub fn is_wide(self) -> bool {
        self == Self::Avx512Er
    }

    /// Classifies a whitespace-separated flag list as found in `/proc/cpuinfo`.
    pub fn from_flags(flags: &str) -> Self {
        let mut tier = Self::Scalar;
        for flag in flags.split_whitespace() {
            let found = match flag {
                "avx512er" => Self::Avx512Er,
                "avx512f" => Self::Avx512,
                "avx2" => Self::Avx2,
                "sse4_1" => Self::Sse4,
                _ => continue,
            };
            tier = tier.max(found);
        }
        tier
    }
}

impl fmt::Display for SimdTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Model name and SIMD tier of the first processor listed in `content`.
pub fn parse_cpuinfo(content: &str) -> (Option<String>, SimdTier) {
    let mut model = None;
    let mut tier = None;
    for line in content.lines() {
        if let Some((key, val)) = line.split_once(':') {
            match key.trim() {
                "model name" if model.is_none() => model = Some(val.trim().to_string()),
                "flags" if tier.is_none() => tier = Some(SimdTier::from_flags(val)),
                _ => {}
            }
        }
    }
    (model, tier.unwrap_or_default())
}

/// Reads `/proc/cpuinfo`; machines without it are treated as scalar.
pub fn probe_cpu() -> (Option<String>, SimdTier) {
    match fs::read_to_string("/proc/cpuinfo") {
        Ok(content) => parse_cpuinfo(&content),
        Err(_) => (None, SimdTier::Scalar),
    }
}
