use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Root filesystem tarball (.tar or .tar.gz)
    pub tarball: PathBuf,

    /// Tag to register the image under (e.g. "base:1.0")
    pub tag: String,
}

pub async fn execute(args: ImportArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let resolved = runtime.images().import(&args.tarball, &args.tag).await?;
    println!("{}", resolved.image_id());
    Ok(())
}
