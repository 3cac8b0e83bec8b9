use crate::cli::DumpArgs;
use crate::error::Result;
use mdrunner::workflows;
use tracing::info;

pub async fn run(args: DumpArgs) -> Result<()> {
    info!("Inspecting {:?}", &args.path);
    let summary = tokio::task::block_in_place(|| workflows::inspect::inspect(&args.path))?;
    println!("{}", summary);
    Ok(())
}
