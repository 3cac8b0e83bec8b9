use super::fio::{FioError, OpenMode, Precision, RecordFile};
use super::{read_step, write_step};
use crate::core::models::parameters::{
    CoulombType, CutoffScheme, InputParameters, IntegratorKind, LjPmeCombination, PbcType,
    Thermostat, VdwType,
};
use crate::core::models::state::RunState;
use crate::core::models::topology::{ParticleType, Topology};
use nalgebra::{Matrix3, Vector3};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

const RUN_INPUT_MAGIC: &str = "mdrunner run input";
const RUN_INPUT_VERSION: i32 = 2;

#[derive(Debug, Error)]
pub enum RunInputError {
    #[error(transparent)]
    Fio(#[from] FioError),
    #[error("Not a run input file (found header '{0}')")]
    BadMagic(String),
    #[error("Unsupported run input version {0}")]
    UnsupportedVersion(i32),
    #[error("Invalid code {code} for {field}")]
    InvalidCode { field: &'static str, code: i32 },
    #[error("Inconsistent run input: {0}")]
    Inconsistent(String),
}

/// A fully prepared simulation as stored in a run input file.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInput {
    pub params: InputParameters,
    pub topology: Topology,
    pub state: RunState,
    /// Precision the reals were stored with.
    pub precision: Precision,
}

fn code<T>(field: &'static str, value: i32, decode: fn(i32) -> Option<T>) -> Result<T, RunInputError> {
    decode(value).ok_or(RunInputError::InvalidCode { field, code: value })
}

fn count(field: &'static str, value: i32) -> Result<usize, RunInputError> {
    usize::try_from(value).map_err(|_| RunInputError::InvalidCode { field, code: value })
}

pub(crate) fn box_rows(box_matrix: &Matrix3<f64>) -> Vec<Vector3<f64>> {
    (0..3).map(|i| box_matrix.row(i).transpose()).collect()
}

pub(crate) fn box_from_rows(rows: &[Vector3<f64>]) -> Matrix3<f64> {
    Matrix3::from_rows(&[rows[0].transpose(), rows[1].transpose(), rows[2].transpose()])
}

impl RunInput {
    pub fn particle_count(&self) -> usize {
        self.topology.particle_count()
    }

    pub fn read(path: &Path) -> Result<Self, RunInputError> {
        let mut file = RecordFile::open(path, OpenMode::Read)?;
        file.select_format();

        let magic = file.read_string()?;
        if magic != RUN_INPUT_MAGIC {
            return Err(RunInputError::BadMagic(magic));
        }
        let version = file.read_int()?;
        if version != RUN_INPUT_VERSION {
            return Err(RunInputError::UnsupportedVersion(version));
        }
        let real_size = file.read_int()?;
        let precision = Precision::from_real_size(real_size).ok_or(RunInputError::InvalidCode {
            field: "real size",
            code: real_size,
        })?;
        file.set_precision(precision);
        let natoms = count("natoms", file.read_int()?)?;

        let params = read_parameters(&mut file)?;
        let box_matrix = box_from_rows(&file.read_rvecs(3)?);
        let topology = read_topology(&mut file)?;
        if topology.particle_count() != natoms {
            return Err(RunInputError::Inconsistent(format!(
                "header declares {} particles but the topology has {}",
                natoms,
                topology.particle_count()
            )));
        }

        let positions = file.read_rvecs(natoms)?;
        let velocities = if file.read_int()? != 0 {
            file.read_rvecs(natoms)?
        } else {
            vec![Vector3::zeros(); natoms]
        };

        let state = RunState {
            step: params.init_step,
            time: params.init_step as f64 * params.dt,
            box_matrix,
            positions,
            velocities,
            thermostat_xi: 0.0,
        };
        debug!(path = %path.display(), natoms, "Read run input.");
        Ok(Self {
            params,
            topology,
            state,
            precision,
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), RunInputError> {
        let natoms = self.particle_count();
        if self.state.positions.len() != natoms || self.state.velocities.len() != natoms {
            return Err(RunInputError::Inconsistent(format!(
                "topology has {} particles but the state has {} positions and {} velocities",
                natoms,
                self.state.positions.len(),
                self.state.velocities.len()
            )));
        }

        let mut file = RecordFile::open(path, OpenMode::Write)?;
        file.select_format();
        file.set_precision(self.precision);

        file.set_comment(Some("[header]"));
        file.write_string(RUN_INPUT_MAGIC)?;
        file.write_int(RUN_INPUT_VERSION)?;
        file.write_int(self.precision.real_size() as i32)?;
        file.write_int(natoms as i32)?;

        file.set_comment(Some("[parameters]"));
        write_parameters(&mut file, &self.params)?;

        file.set_comment(Some("[box]"));
        file.write_rvecs(&box_rows(&self.state.box_matrix))?;

        file.set_comment(Some("[topology]"));
        write_topology(&mut file, &self.topology)?;

        file.set_comment(Some("[coordinates]"));
        file.write_rvecs(&self.state.positions)?;

        file.set_comment(Some("[velocities]"));
        let has_velocities = self.state.velocities.iter().any(|v| v.norm_squared() > 0.0);
        file.write_int(i32::from(has_velocities))?;
        if has_velocities {
            file.write_rvecs(&self.state.velocities)?;
        }

        file.close()?;
        Ok(())
    }
}

fn write_parameters(file: &mut RecordFile, p: &InputParameters) -> Result<(), FioError> {
    file.write_int(p.integrator.code())?;
    write_step(file, p.nsteps)?;
    write_step(file, p.init_step)?;
    file.write_real(p.dt)?;
    file.write_int(p.nstlist)?;
    file.write_int(p.nstcalcenergy)?;
    file.write_int(p.nstxout)?;
    file.write_int(p.cutoff_scheme.code())?;
    file.write_int(p.pbc.code())?;
    file.write_real(p.rlist)?;
    file.write_real(p.rcoulomb)?;
    file.write_real(p.rvdw)?;
    file.write_int(p.coulomb_type.code())?;
    file.write_int(p.vdw_type.code())?;
    file.write_int(p.ljpme_combination.code())?;
    file.write_real(p.fourier_spacing)?;
    file.write_int(p.pme_order as i32)?;
    file.write_real(p.verlet_buffer_tolerance)?;
    file.write_int(p.thermostat.code())?;
    file.write_real(p.ref_t)?;
    file.write_real(p.tau_t)?;
    let deform: Vec<Vector3<f64>> = p.deform.iter().map(|r| Vector3::from(*r)).collect();
    file.write_rvecs(&deform)?;
    file.write_int(p.energy_groups as i32)?;
    write_step(file, p.seed as i64)?;
    file.write_real(p.emtol)?;
    file.write_real(p.emstep)?;
    file.write_real(p.rtpi)?;
    file.write_int(p.insertions_per_frame as i32)
}

fn read_parameters(file: &mut RecordFile) -> Result<InputParameters, RunInputError> {
    let integrator = code("integrator", file.read_int()?, IntegratorKind::from_code)?;
    let nsteps = read_step(file)?;
    let init_step = read_step(file)?;
    let dt = file.read_real()?;
    let nstlist = file.read_int()?;
    let nstcalcenergy = file.read_int()?;
    let nstxout = file.read_int()?;
    let cutoff_scheme = code("cutoff-scheme", file.read_int()?, CutoffScheme::from_code)?;
    let pbc = code("pbc", file.read_int()?, PbcType::from_code)?;
    let rlist = file.read_real()?;
    let rcoulomb = file.read_real()?;
    let rvdw = file.read_real()?;
    let coulomb_type = code("coulomb-type", file.read_int()?, CoulombType::from_code)?;
    let vdw_type = code("vdw-type", file.read_int()?, VdwType::from_code)?;
    let ljpme_combination = code(
        "ljpme-combination",
        file.read_int()?,
        LjPmeCombination::from_code,
    )?;
    let fourier_spacing = file.read_real()?;
    let pme_order = count("pme-order", file.read_int()?)?;
    let verlet_buffer_tolerance = file.read_real()?;
    let thermostat = code("thermostat", file.read_int()?, Thermostat::from_code)?;
    let ref_t = file.read_real()?;
    let tau_t = file.read_real()?;
    let rows = file.read_rvecs(3)?;
    let deform = [
        [rows[0].x, rows[0].y, rows[0].z],
        [rows[1].x, rows[1].y, rows[1].z],
        [rows[2].x, rows[2].y, rows[2].z],
    ];
    let energy_groups = count("energy-groups", file.read_int()?)?;
    let seed = read_step(file)? as u64;
    let emtol = file.read_real()?;
    let emstep = file.read_real()?;
    let rtpi = file.read_real()?;
    let insertions_per_frame = count("insertions-per-frame", file.read_int()?)?;

    Ok(InputParameters {
        integrator,
        nsteps,
        init_step,
        dt,
        nstlist,
        nstcalcenergy,
        nstxout,
        cutoff_scheme,
        pbc,
        rlist,
        rcoulomb,
        rvdw,
        coulomb_type,
        vdw_type,
        ljpme_combination,
        fourier_spacing,
        pme_order,
        verlet_buffer_tolerance,
        thermostat,
        ref_t,
        tau_t,
        deform,
        energy_groups,
        seed,
        emtol,
        emstep,
        rtpi,
        insertions_per_frame,
    })
}

fn write_topology(file: &mut RecordFile, topology: &Topology) -> Result<(), FioError> {
    file.write_string(&topology.name)?;
    file.write_int(topology.types.len() as i32)?;
    for t in &topology.types {
        file.write_real(t.mass)?;
        file.write_real(t.charge)?;
        file.write_real(t.c6)?;
        file.write_real(t.c12)?;
    }
    file.write_int(topology.particle_types.len() as i32)?;
    for &t in &topology.particle_types {
        file.write_int(t as i32)?;
    }
    Ok(())
}

fn read_topology(file: &mut RecordFile) -> Result<Topology, RunInputError> {
    let name = file.read_string()?;
    let ntypes = count("type count", file.read_int()?)?;
    let mut types = Vec::with_capacity(ntypes);
    for _ in 0..ntypes {
        types.push(ParticleType {
            mass: file.read_real()?,
            charge: file.read_real()?,
            c6: file.read_real()?,
            c12: file.read_real()?,
        });
    }
    let nparticles = count("particle count", file.read_int()?)?;
    let mut particle_types = Vec::with_capacity(nparticles);
    for _ in 0..nparticles {
        let t = count("particle type", file.read_int()?)?;
        if t >= ntypes {
            return Err(RunInputError::InvalidCode {
                field: "particle type",
                code: t as i32,
            });
        }
        particle_types.push(t);
    }
    Ok(Topology {
        name,
        types,
        particle_types,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_input() -> RunInput {
        let mut topology = Topology::new("two species");
        let a = topology.add_type(ParticleType {
            mass: 39.948,
            charge: 0.0,
            c6: 6.2e-3,
            c12: 9.7e-6,
        });
        let b = topology.add_type(ParticleType {
            mass: 20.18,
            charge: 0.5,
            c6: 1.5e-3,
            c12: 1.25e-6,
        });
        topology.add_particles(a, 2);
        topology.add_particles(b, 1);

        let params = InputParameters {
            integrator: IntegratorKind::Sd,
            nsteps: 5_000_000_000,
            init_step: 12,
            thermostat: Thermostat::VRescale,
            ref_t: 120.0,
            deform: [[0.0, 0.0, 0.0], [0.01, 0.0, 0.0], [0.0, 0.0, 0.0]],
            seed: 77,
            ..Default::default()
        };

        let mut state = RunState::new(
            Matrix3::new(3.0, 0.0, 0.0, 0.1, 3.0, 0.0, 0.0, 0.2, 3.0),
            vec![
                Vector3::new(0.1, 0.2, 0.3),
                Vector3::new(1.0, 1.5, 2.0),
                Vector3::new(2.5, 0.5, 1.25),
            ],
        );
        state.velocities[1] = Vector3::new(0.5, -0.25, 0.125);
        state.step = params.init_step;
        state.time = params.init_step as f64 * params.dt;

        RunInput {
            params,
            topology,
            state,
            precision: Precision::Double,
        }
    }

    #[test]
    fn run_input_survives_every_encoding() {
        let dir = tempdir().unwrap();
        let input = sample_input();
        for name in ["run.tpr", "run.tpa", "run.tpb"] {
            let path = dir.path().join(name);
            input.write(&path).unwrap();
            let read = RunInput::read(&path).unwrap();
            assert_eq!(read.params, input.params);
            assert_eq!(read.topology, input.topology);
            assert_eq!(read.state.positions, input.state.positions);
            assert_eq!(read.state.velocities, input.state.velocities);
            assert_eq!(read.state.box_matrix, input.state.box_matrix);
            assert_eq!(read.state.step, 12);
        }
    }

    #[test]
    fn single_precision_input_reports_its_precision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("single.tpr");
        let mut input = sample_input();
        input.precision = Precision::Single;
        input.write(&path).unwrap();
        let read = RunInput::read(&path).unwrap();
        assert_eq!(read.precision, Precision::Single);
        assert_eq!(read.params.nsteps, input.params.nsteps);
        assert!((read.params.dt - input.params.dt).abs() < 1e-9);
    }

    #[test]
    fn foreign_file_is_rejected_by_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.tpa");
        std::fs::write(&path, "something_else\n1\n").unwrap();
        assert!(matches!(
            RunInput::read(&path),
            Err(RunInputError::BadMagic(ref m)) if m == "something else"
        ));
    }

    #[test]
    fn state_size_mismatch_is_refused_on_write() {
        let dir = tempdir().unwrap();
        let mut input = sample_input();
        input.state.positions.pop();
        assert!(matches!(
            input.write(&dir.path().join("bad.tpr")),
            Err(RunInputError::Inconsistent(_))
        ));
    }
}
