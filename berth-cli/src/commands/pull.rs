use clap::Args;

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image reference with a fixed tag or digest (e.g. "python:3.12-slim")
    pub reference: String,
}

pub async fn execute(args: PullArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let resolved = runtime.images().pull(&args.reference).await?;
    println!("{}", resolved.image_id());
    Ok(())
}
