use std::time::Duration;

use berth::launcher::install_signal_handlers;
use berth::runtime::options::{PortSpec, parse_env_pair};
use berth::{LaunchOptions, ShutdownHandle, ShutdownKind};
use clap::Args;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Publish the service port (host:container)
    #[arg(short = 'p', long = "publish")]
    pub publish: Option<PortSpec>,

    /// Set environment variables (KEY=VALUE)
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Seconds in-flight requests get to finish after a stop signal
    #[arg(long, default_value_t = 10)]
    pub grace_period: u64,

    /// Image to run
    pub image: String,
}

pub async fn execute(args: RunArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let options = LaunchOptions {
        ports: args.publish.into_iter().collect(),
        env: args.env,
        grace_period: Duration::from_secs(args.grace_period),
    };

    let shutdown = ShutdownHandle::new();
    let signals = install_signal_handlers(shutdown.clone())?;

    let container = runtime.start(&args.image, &options, shutdown).await?;
    println!("{}", container.id());
    tracing::info!(addr = %container.local_addr(), "Listening");

    let outcome = container.wait().await?;
    signals.abort();

    if outcome.shutdown == ShutdownKind::Forced {
        eprintln!("Stopped without draining all connections");
    }
    Ok(())
}
