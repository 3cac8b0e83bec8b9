use super::RunContext;
use super::forces::{MESH_REPLY_TAG, MESH_REQUEST_TAG, MeshMessage};
use crate::core::physics::ForceOutput;
use crate::engine::accounting::Stage;
use crate::engine::context::StopCondition;
use crate::engine::error::EngineError;
use nalgebra::Matrix3;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Serves long-range requests of the spatial ranks assigned to this rank until every
/// one of them has finished.
///
/// Requests are taken from the served ranks in cell order. The system-wide energy and
/// virial are reported once: by the first long-range rank, to its first served rank.
#[instrument(skip_all, name = "long_range_service", fields(rank = ctx.comm.rank()))]
pub(crate) fn serve(ctx: &RunContext<'_>) -> Result<StopCondition, EngineError> {
    let rank = ctx.comm.rank();
    let served = ctx.config.ranks.served_by(rank);
    if served.is_empty() {
        return Err(EngineError::Internal(format!(
            "long-range rank {} serves no spatial ranks",
            rank
        )));
    }
    let solver = ctx
        .physics
        .mesh_solver(&ctx.input.params, &ctx.input.topology);
    let reports_energy = ctx.assignment.long_range_index == Some(0);
    info!(
        served = ?served,
        solver = solver.name(),
        threads = ctx.pool.threads(),
        "Long-range rank serving spatial ranks."
    );

    let mut active = vec![true; served.len()];
    let mut requests: u64 = 0;
    while active.iter().any(|&a| a) {
        for (slot, &spatial_rank) in served.iter().enumerate() {
            if !active[slot] {
                continue;
            }
            let start = Instant::now();
            let message: MeshMessage = ctx.comm.recv(spatial_rank, MESH_REQUEST_TAG)?;
            ctx.accounting
                .borrow_mut()
                .add(Stage::Communication, start.elapsed());
            match message {
                MeshMessage::Compute {
                    step,
                    box_matrix,
                    positions,
                    home,
                } => {
                    let start = Instant::now();
                    let solver = solver.as_ref();
                    let mut output: ForceOutput = ctx
                        .pool
                        .install(|| solver.compute(&box_matrix, &positions, &home));
                    if !(reports_energy && slot == 0) {
                        output.potential = 0.0;
                        output.virial = Matrix3::zeros();
                    }
                    ctx.accounting.borrow_mut().add(Stage::Mesh, start.elapsed());
                    ctx.comm.send(spatial_rank, MESH_REPLY_TAG, output)?;
                    requests += 1;
                    debug!(step, from = spatial_rank, "Served long-range request.");
                }
                MeshMessage::Finish => {
                    active[slot] = false;
                }
            }
        }
    }
    info!(requests, "Long-range service finished.");
    Ok(StopCondition::None)
}
