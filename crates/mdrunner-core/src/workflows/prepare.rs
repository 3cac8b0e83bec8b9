use crate::core::io::description::SystemDescription;
use crate::core::io::fio::{FileType, Precision};
use crate::core::models::parameters::IntegratorKind;
use crate::engine::error::EngineError;
use crate::engine::progress::{Progress, ProgressReporter};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInput {
    pub path: PathBuf,
    pub name: String,
    pub particles: usize,
    pub integrator: IntegratorKind,
    pub volume: f64,
    pub precision: Precision,
}

/// Builds a run input from the system description at `description` and writes it to
/// `output`, whose extension selects the encoding.
#[instrument(skip_all, name = "prepare_workflow")]
pub fn run(
    description: &Path,
    output: &Path,
    reporter: &ProgressReporter,
) -> Result<PreparedInput, EngineError> {
    if !FileType::from_path(output).is_some_and(|t| t.is_run_input()) {
        return Err(EngineError::Configuration(format!(
            "'{}' is not a run input file name (expected .tpr, .tpa or .tpb)",
            output.display()
        )));
    }

    reporter.report(Progress::PhaseStart {
        name: "Building System",
    });
    let description = SystemDescription::load(description)?;
    let input = description.build()?;
    reporter.report(Progress::PhaseFinish);

    reporter.report(Progress::PhaseStart {
        name: "Writing Run Input",
    });
    input.write(output)?;
    reporter.report(Progress::PhaseFinish);

    let prepared = PreparedInput {
        path: output.to_path_buf(),
        name: description.name,
        particles: input.particle_count(),
        integrator: input.params.integrator,
        volume: input.state.volume(),
        precision: input.precision,
    };
    info!(
        path = %output.display(),
        particles = prepared.particles,
        integrator = %prepared.integrator,
        "Wrote the run input."
    );
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::run_input::RunInput;
    use tempfile::tempdir;

    const DESCRIPTION: &str = r#"
name = "argon"
temperature = 90.0

[parameters]
integrator = "md"
nsteps = 20

[lattice]
cells = [3, 3, 3]
spacing = 0.5

[[species]]
mass = 39.948
sigma = 0.34
epsilon = 0.996
"#;

    #[test]
    fn prepared_input_reads_back() {
        let dir = tempdir().unwrap();
        let description = dir.path().join("argon.toml");
        std::fs::write(&description, DESCRIPTION).unwrap();
        let output = dir.path().join("argon.tpr");

        let prepared = run(&description, &output, &ProgressReporter::new()).unwrap();
        assert_eq!(prepared.particles, 27);
        assert_eq!(prepared.name, "argon");

        let input = RunInput::read(&output).unwrap();
        assert_eq!(input.particle_count(), 27);
        assert_eq!(input.params.nsteps, 20);
    }

    #[test]
    fn output_must_be_a_run_input() {
        let dir = tempdir().unwrap();
        let description = dir.path().join("argon.toml");
        std::fs::write(&description, DESCRIPTION).unwrap();
        let result = run(
            &description,
            &dir.path().join("argon.cpt"),
            &ProgressReporter::new(),
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
