use clap::Args;
use serde_json::json;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Image tag
    pub image: String,
}

pub async fn execute(args: InspectArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let resolved = runtime.images().resolve(&args.image).await?;

    let document = json!({
        "tag": resolved.reference,
        "id": resolved.record.image_id,
        "created": resolved.record.created_at,
        "config": resolved.config,
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}
