use super::RunContext;
use crate::core::io::trajectory::{Frame, TrajectoryReader};
use crate::engine::accounting::Stage;
use crate::engine::error::{EngineError, SharedFailure};
use std::path::Path;
use std::time::Instant;

/// Frames of an existing trajectory, read on the spatial root and broadcast so that
/// every spatial rank sees the same frame.
pub(crate) struct FrameSource {
    reader: Option<TrajectoryReader>,
    particles: usize,
}

impl FrameSource {
    /// Collective on the spatial group only through [`FrameSource::next`]; opening
    /// happens on the root alone.
    pub fn open(ctx: &RunContext<'_>, path: &Path) -> Result<Self, EngineError> {
        let group = ctx.spatial_group()?;
        let reader = if ctx.comm.rank() == group.root() {
            Some(TrajectoryReader::open(path)?)
        } else {
            None
        };
        Ok(Self {
            reader,
            particles: ctx.input.particle_count(),
        })
    }

    /// The next frame, or `None` on every rank once the trajectory is exhausted. A read
    /// failure on the root fails every rank.
    pub fn next(&mut self, ctx: &RunContext<'_>) -> Result<Option<Frame>, EngineError> {
        let group = ctx.spatial_group()?;
        let start = Instant::now();
        let particles = self.particles;
        let local = self.reader.as_mut().map(|reader| read_checked(reader, particles));
        let frame = ctx.comm.broadcast(group, local)?;
        ctx.accounting
            .borrow_mut()
            .add(Stage::Communication, start.elapsed());
        Ok(frame?)
    }
}

fn read_checked(
    reader: &mut TrajectoryReader,
    particles: usize,
) -> Result<Option<Frame>, SharedFailure> {
    match reader.next_frame() {
        Ok(Some(frame)) if frame.positions.len() != particles => Err(EngineError::Configuration(
            format!(
                "the frame at step {} has {} particles, the run input has {}",
                frame.step,
                frame.positions.len(),
                particles
            ),
        )
        .to_shared()),
        Ok(frame) => Ok(frame),
        Err(e) => Err(EngineError::from(e).to_shared()),
    }
}
