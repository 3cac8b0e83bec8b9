use phf::{Map, phf_map};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Generates the integer codes used when an enum is stored in a run file.
///
/// Codes follow declaration order, so variants must only ever be appended.
macro_rules! impl_file_codes {
    ($ty:ty, [$($variant:path),+ $(,)?]) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($variant),+];

            pub fn code(self) -> i32 {
                Self::ALL
                    .iter()
                    .position(|v| *v == self)
                    .map(|i| i as i32)
                    .unwrap_or(-1)
            }

            pub fn from_code(code: i32) -> Option<Self> {
                usize::try_from(code)
                    .ok()
                    .and_then(|i| Self::ALL.get(i))
                    .copied()
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegratorKind {
    Md,
    MdVv,
    MdVvAvek,
    Sd,
    Bd,
    Steep,
    Cg,
    LBfgs,
    Nm,
    Tpi,
    Tpic,
}

impl_file_codes!(
    IntegratorKind,
    [
        IntegratorKind::Md,
        IntegratorKind::MdVv,
        IntegratorKind::MdVvAvek,
        IntegratorKind::Sd,
        IntegratorKind::Bd,
        IntegratorKind::Steep,
        IntegratorKind::Cg,
        IntegratorKind::LBfgs,
        IntegratorKind::Nm,
        IntegratorKind::Tpi,
        IntegratorKind::Tpic,
    ]
);

static INTEGRATOR_NAMES: Map<&'static str, IntegratorKind> = phf_map! {
    "md" => IntegratorKind::Md,
    "md-vv" => IntegratorKind::MdVv,
    "md-vv-avek" => IntegratorKind::MdVvAvek,
    "sd" => IntegratorKind::Sd,
    "bd" => IntegratorKind::Bd,
    "steep" => IntegratorKind::Steep,
    "cg" => IntegratorKind::Cg,
    "l-bfgs" => IntegratorKind::LBfgs,
    "nm" => IntegratorKind::Nm,
    "tpi" => IntegratorKind::Tpi,
    "tpic" => IntegratorKind::Tpic,
};

/// Coarse grouping of integrators. A checkpoint can only be resumed by an
/// integrator of the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegratorClass {
    Dynamics,
    Minimization,
    NormalModes,
    Insertion,
}

impl IntegratorClass {
    pub fn code(self) -> i32 {
        match self {
            Self::Dynamics => 0,
            Self::Minimization => 1,
            Self::NormalModes => 2,
            Self::Insertion => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Dynamics),
            1 => Some(Self::Minimization),
            2 => Some(Self::NormalModes),
            3 => Some(Self::Insertion),
            _ => None,
        }
    }
}

impl IntegratorKind {
    pub fn name(self) -> &'static str {
        INTEGRATOR_NAMES
            .entries()
            .find(|(_, kind)| **kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    pub fn class(self) -> IntegratorClass {
        match self {
            Self::Md | Self::MdVv | Self::MdVvAvek | Self::Sd | Self::Bd => {
                IntegratorClass::Dynamics
            }
            Self::Steep | Self::Cg | Self::LBfgs => IntegratorClass::Minimization,
            Self::Nm => IntegratorClass::NormalModes,
            Self::Tpi | Self::Tpic => IntegratorClass::Insertion,
        }
    }

    /// Any integrator that propagates the system in time.
    pub fn is_dynamics(self) -> bool {
        self.class() == IntegratorClass::Dynamics
    }

    /// The Newtonian integrators; these conserve energy when no thermostat is coupled.
    pub fn is_newtonian(self) -> bool {
        matches!(self, Self::Md | Self::MdVv | Self::MdVvAvek)
    }

    pub fn is_minimization(self) -> bool {
        self.class() == IntegratorClass::Minimization
    }

    pub fn is_insertion(self) -> bool {
        self.class() == IntegratorClass::Insertion
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown integrator '{0}'")]
pub struct ParseIntegratorError(pub String);

impl FromStr for IntegratorKind {
    type Err = ParseIntegratorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        INTEGRATOR_NAMES
            .get(s.to_lowercase().as_str())
            .copied()
            .ok_or_else(|| ParseIntegratorError(s.to_string()))
    }
}

impl fmt::Display for IntegratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CutoffScheme {
    #[default]
    Verlet,
    Group,
}

impl_file_codes!(CutoffScheme, [CutoffScheme::Verlet, CutoffScheme::Group]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CoulombType {
    #[default]
    Cutoff,
    ReactionField,
    Ewald,
    Pme,
}

impl_file_codes!(
    CoulombType,
    [
        CoulombType::Cutoff,
        CoulombType::ReactionField,
        CoulombType::Ewald,
        CoulombType::Pme,
    ]
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VdwType {
    #[default]
    Cutoff,
    Pme,
}

impl_file_codes!(VdwType, [VdwType::Cutoff, VdwType::Pme]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LjPmeCombination {
    #[default]
    Geometric,
    LorentzBerthelot,
}

impl_file_codes!(
    LjPmeCombination,
    [LjPmeCombination::Geometric, LjPmeCombination::LorentzBerthelot]
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Thermostat {
    #[default]
    None,
    Berendsen,
    VRescale,
    NoseHoover,
}

impl_file_codes!(
    Thermostat,
    [
        Thermostat::None,
        Thermostat::Berendsen,
        Thermostat::VRescale,
        Thermostat::NoseHoover,
    ]
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PbcType {
    #[default]
    Xyz,
    Xy,
    Screw,
    None,
}

impl_file_codes!(
    PbcType,
    [PbcType::Xyz, PbcType::Xy, PbcType::Screw, PbcType::None]
);

impl PbcType {
    /// Number of dimensions in which the box is periodic.
    pub fn bounded_dims(self) -> usize {
        match self {
            Self::Xyz | Self::Screw => 3,
            Self::Xy => 2,
            Self::None => 0,
        }
    }
}

/// The simulation parameters stored in a run input file.
///
/// Lengths are in nm, times in ps, temperatures in K and energies in kJ/mol.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct InputParameters {
    pub integrator: IntegratorKind,
    pub nsteps: i64,
    pub init_step: i64,
    pub dt: f64,
    pub nstlist: i32,
    pub nstcalcenergy: i32,
    pub nstxout: i32,
    pub cutoff_scheme: CutoffScheme,
    pub pbc: PbcType,
    pub rlist: f64,
    pub rcoulomb: f64,
    pub rvdw: f64,
    pub coulomb_type: CoulombType,
    pub vdw_type: VdwType,
    pub ljpme_combination: LjPmeCombination,
    /// Largest mesh spacing of the long-range mesh in nm.
    pub fourier_spacing: f64,
    /// Interpolation order of the long-range mesh.
    pub pme_order: usize,
    /// Maximum allowed pair-list energy drift in kJ/mol/ps per atom; negative disables buffering.
    pub verlet_buffer_tolerance: f64,
    pub thermostat: Thermostat,
    pub ref_t: f64,
    pub tau_t: f64,
    /// Box deformation velocities in nm/ps, one row per box vector.
    pub deform: [[f64; 3]; 3],
    pub energy_groups: usize,
    pub seed: u64,
    pub emtol: f64,
    pub emstep: f64,
    /// Insertion sphere radius for particle insertion; zero samples the whole box.
    pub rtpi: f64,
    pub insertions_per_frame: usize,
}

impl Default for InputParameters {
    fn default() -> Self {
        Self {
            integrator: IntegratorKind::Md,
            nsteps: 0,
            init_step: 0,
            dt: 0.002,
            nstlist: 10,
            nstcalcenergy: 100,
            nstxout: 0,
            cutoff_scheme: CutoffScheme::Verlet,
            pbc: PbcType::Xyz,
            rlist: 1.0,
            rcoulomb: 1.0,
            rvdw: 1.0,
            coulomb_type: CoulombType::Cutoff,
            vdw_type: VdwType::Cutoff,
            ljpme_combination: LjPmeCombination::Geometric,
            fourier_spacing: 0.12,
            pme_order: 4,
            verlet_buffer_tolerance: 0.005,
            thermostat: Thermostat::None,
            ref_t: 0.0,
            tau_t: 0.1,
            deform: [[0.0; 3]; 3],
            energy_groups: 1,
            seed: 1993,
            emtol: 10.0,
            emstep: 0.01,
            rtpi: 0.05,
            insertions_per_frame: 1000,
        }
    }
}

impl InputParameters {
    /// True when long-range interactions are handled by a mesh method and can be split
    /// off onto dedicated ranks.
    pub fn uses_mesh_long_range(&self) -> bool {
        self.coulomb_type == CoulombType::Pme || self.vdw_type == VdwType::Pme
    }

    /// Newtonian dynamics without temperature coupling.
    pub fn is_nve(&self) -> bool {
        self.integrator.is_newtonian() && self.thermostat == Thermostat::None
    }

    pub fn has_deform(&self) -> bool {
        self.deform.iter().flatten().any(|v| *v != 0.0)
    }

    pub fn max_cutoff(&self) -> f64 {
        self.rcoulomb.max(self.rvdw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrator_names_round_trip_through_lookup() {
        for kind in IntegratorKind::ALL {
            assert_eq!(kind.name().parse::<IntegratorKind>(), Ok(*kind));
        }
        assert!("leapfrog".parse::<IntegratorKind>().is_err());
    }

    #[test]
    fn file_codes_follow_declaration_order() {
        assert_eq!(IntegratorKind::Md.code(), 0);
        assert_eq!(IntegratorKind::Tpic.code(), 10);
        assert_eq!(IntegratorKind::from_code(7), Some(IntegratorKind::LBfgs));
        assert_eq!(IntegratorKind::from_code(-1), None);
        assert_eq!(PbcType::from_code(4), None);
    }

    #[test]
    fn integrator_classes_are_assigned_correctly() {
        assert!(IntegratorKind::Sd.is_dynamics());
        assert!(!IntegratorKind::Sd.is_newtonian());
        assert!(IntegratorKind::LBfgs.is_minimization());
        assert!(IntegratorKind::Tpic.is_insertion());
        assert_eq!(IntegratorKind::Nm.class(), IntegratorClass::NormalModes);
    }

    #[test]
    fn nve_requires_newtonian_integrator_without_thermostat() {
        let mut params = InputParameters::default();
        assert!(params.is_nve());
        params.thermostat = Thermostat::VRescale;
        assert!(!params.is_nve());
        params.thermostat = Thermostat::None;
        params.integrator = IntegratorKind::Sd;
        assert!(!params.is_nve());
    }

    #[test]
    fn mesh_long_range_detected_for_either_interaction() {
        let mut params = InputParameters::default();
        assert!(!params.uses_mesh_long_range());
        params.vdw_type = VdwType::Pme;
        assert!(params.uses_mesh_long_range());
    }

    #[test]
    fn parameters_deserialize_from_kebab_case_toml() {
        let params: InputParameters = toml::from_str(
            r#"
            integrator = "l-bfgs"
            nsteps = 500
            coulomb-type = "pme"
            verlet-buffer-tolerance = -1.0
            "#,
        )
        .unwrap();
        assert_eq!(params.integrator, IntegratorKind::LBfgs);
        assert_eq!(params.nsteps, 500);
        assert_eq!(params.coulomb_type, CoulombType::Pme);
        assert_eq!(params.verlet_buffer_tolerance, -1.0);
        assert_eq!(params.nstlist, 10);
    }
}
