use clap::Args;

#[derive(Args, Debug)]
pub struct RmiArgs {
    /// Tag(s) to remove
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<String>,
}

pub async fn execute(args: RmiArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;

    let mut errors = Vec::new();
    for target in &args.targets {
        match runtime.images().remove(target).await {
            Ok(_) => println!("Untagged: {}", target),
            Err(e) => {
                eprintln!("Error removing image '{}': {}", target, e);
                errors.push(format!("{}: {}", target, e));
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!(
            "Failed to remove {} of {} image(s)\nErrors:\n  {}",
            errors.len(),
            args.targets.len(),
            errors.join("\n  ")
        );
    }
    Ok(())
}
