//! berth: reproducible layered images for Python-style web services, and a
//! launcher that serves them.
//!
//! ```text
//! Berthfile + context ──ImageBuilder──→ tagged image ──Launcher──→ :8080
//! ```

pub mod app;
pub mod builder;
pub mod deps;
pub mod images;
pub mod launcher;
pub mod pipeline;
pub mod recipe;
pub mod runtime;
pub mod util;

#[doc(hidden)]
pub use inventory;

pub use app::{Application, AppContext, EntryPointRegistry, EntryTarget, Response, Scope};
pub use berth_shared::errors::{BerthError, BerthResult, DependencyError, EntryPointError};
pub use builder::{BuildReport, ImageBuilder, StepReport};
pub use launcher::{LaunchOutcome, RunningContainer, ShutdownHandle, ShutdownKind};
pub use recipe::{Instruction, Recipe};
pub use runtime::BerthRuntime;
pub use runtime::options::{BuildOptions, LaunchOptions, PortSpec, RuntimeOptions};
pub use util::init_logging;
