use std::path::PathBuf;

use berth::BuildOptions;
use clap::Args;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Tag of the resulting image (e.g. "myservice:1.0")
    #[arg(short, long)]
    pub tag: String,

    /// Recipe file (default: <context>/Berthfile)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Do not reuse cached layers
    #[arg(long)]
    pub no_cache: bool,

    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,
}

pub async fn execute(args: BuildArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let options = BuildOptions {
        recipe_file: args.file,
        no_cache: args.no_cache,
    };

    let report = runtime.build(&args.context, &args.tag, &options).await?;

    for (i, step) in report.steps.iter().enumerate() {
        let marker = if step.cached { " (cached)" } else { "" };
        eprintln!("Step {}/{}: {}{}", i + 1, report.steps.len(), step.instruction, marker);
    }
    if !report.packages().is_empty() {
        eprintln!(
            "Installed: {}",
            report
                .packages()
                .iter()
                .map(|p| format!("{}=={}", p.name, p.version))
                .collect::<Vec<_>>()
                .join(" ")
        );
    }

    println!("{}", report.image_id);
    Ok(())
}
