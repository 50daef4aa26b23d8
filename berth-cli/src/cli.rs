use std::path::PathBuf;

use berth::runtime::constants::envs;
use berth::runtime::layout::FilesystemLayout;
use berth::{BerthRuntime, RuntimeOptions};
use clap::{Args, Parser, Subcommand};

use crate::commands;

#[derive(Parser, Debug)]
#[command(name = "berth", version, about = "Build and run reproducible service images")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image from a Berthfile
    Build(commands::build::BuildArgs),
    /// Run a container from an image
    Run(commands::run::RunArgs),
    /// List local images
    #[command(visible_alias = "ls")]
    Images(commands::images::ImagesArgs),
    /// Show the configuration of an image
    Inspect(commands::inspect::InspectArgs),
    /// Pull a base image from a registry
    Pull(commands::pull::PullArgs),
    /// Register a root filesystem tarball as a base image
    Import(commands::import::ImportArgs),
    /// Remove image tags
    Rmi(commands::rmi::RmiArgs),
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Home directory for images, cache and logs
    #[arg(long, global = true, env = envs::BERTH_HOME)]
    pub home: Option<PathBuf>,

    /// Trusted package index directory (repeatable)
    #[arg(
        long = "index",
        global = true,
        env = envs::BERTH_INDEXES,
        value_delimiter = ':'
    )]
    pub indexes: Vec<PathBuf>,

    /// Registry searched for unqualified base images (repeatable)
    #[arg(long = "registry", global = true)]
    pub registries: Vec<String>,

    /// Log filter, e.g. "debug" or "berth=trace" (defaults to RUST_LOG, then info)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

impl GlobalFlags {
    pub fn options(&self) -> RuntimeOptions {
        let mut options = RuntimeOptions::default();
        if let Some(home) = &self.home {
            options.home_dir = home.clone();
        }
        if !self.indexes.is_empty() {
            options.package_indexes = self.indexes.clone();
        }
        options.image_registries = self.registries.clone();
        options
    }

    pub fn create_runtime(&self) -> anyhow::Result<BerthRuntime> {
        let mut options = self.options();
        if options.home_dir.is_relative() {
            options.home_dir = std::env::current_dir()?.join(&options.home_dir);
        }
        Ok(BerthRuntime::new(options)?)
    }

    /// Install logging to stderr and `{home}/logs`. The guard flushes the
    /// file log and must live until exit.
    pub fn init_logging(&self) -> anyhow::Result<berth::util::LogGuard> {
        let layout = FilesystemLayout::new(self.options().home_dir);
        Ok(berth::init_logging(
            &layout.logs_dir(),
            self.log_level.as_deref(),
        )?)
    }
}
