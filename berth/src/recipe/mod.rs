//! Build recipes (`Berthfile`).
//!
//! A recipe is a small Containerfile subset: it selects a pinned base, sets a
//! working directory, copies files from the build context, installs a
//! dependency manifest and records image metadata. There is no `RUN`; every
//! filesystem change is one of the typed instructions below.

mod parser;

use std::fmt;
use std::path::{Path, PathBuf};

use berth_shared::errors::{BerthError, BerthResult};
use thiserror::Error;

use crate::runtime::constants::{recipe, service};

pub use parser::parse;

/// Parse and validation failures, reported with the logical line number.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecipeError {
    #[error("recipe is empty")]
    Empty,

    #[error("line {line}: first instruction must be FROM, found {found}")]
    MissingFrom { line: usize, found: String },

    #[error("line {line}: only one FROM is supported")]
    MultipleFrom { line: usize },

    #[error("line {line}: base image '{reference}' must be pinned to a version other than 'latest'")]
    UnpinnedBase { line: usize, reference: String },

    #[error("line {line}: {instruction} is not supported")]
    Unsupported { line: usize, instruction: String },

    #[error("line {line}: {instruction}: {message}")]
    Invalid {
        line: usize,
        instruction: &'static str,
        message: String,
    },
}

impl From<RecipeError> for BerthError {
    fn from(err: RecipeError) -> Self {
        match err {
            RecipeError::Unsupported { .. } => BerthError::Unsupported(err.to_string()),
            _ => BerthError::Recipe(err.to_string()),
        }
    }
}

/// One typed recipe instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From { image: String },
    Workdir { path: String },
    Copy { sources: Vec<String>, dest: String },
    Install {
        manifest: String,
        index: Option<PathBuf>,
    },
    Env { key: String, value: String },
    Expose { port: u16 },
    Cmd { args: Vec<String> },
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Copy { .. } => "COPY",
            Instruction::Install { .. } => "INSTALL",
            Instruction::Env { .. } => "ENV",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Cmd { .. } => "CMD",
        }
    }
}

/// Renders the instruction in recipe syntax. The output is also the text
/// hashed into build cache keys, so it must be stable.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From { image } => write!(f, "FROM {image}"),
            Instruction::Workdir { path } => write!(f, "WORKDIR {path}"),
            Instruction::Copy { sources, dest } => {
                write!(f, "COPY {} {}", sources.join(" "), dest)
            }
            Instruction::Install { manifest, index } => match index {
                Some(index) => write!(f, "INSTALL --index {} {}", index.display(), manifest),
                None => write!(f, "INSTALL {manifest}"),
            },
            Instruction::Env { key, value } => write!(f, "ENV {key}={}", parser::quote(value)),
            Instruction::Expose { port } => write!(f, "EXPOSE {port}/tcp"),
            Instruction::Cmd { args } => {
                let json = serde_json::to_string(args).map_err(|_| fmt::Error)?;
                write!(f, "CMD {json}")
            }
        }
    }
}

/// A parsed and validated recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    instructions: Vec<Instruction>,
}

impl Recipe {
    /// Read and parse a recipe file.
    pub fn read(path: &Path) -> BerthResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BerthError::Recipe(format!("failed to read {}: {}", path.display(), e))
        })?;
        let recipe = parse(&text)?;
        for warning in recipe.warnings() {
            tracing::warn!(recipe = %path.display(), "{}", warning);
        }
        Ok(recipe)
    }

    /// The canonical recipe of a single web service on `base`.
    ///
    /// The manifest is copied and installed before the rest of the sources
    /// so a source-only change keeps the dependency layer cached.
    pub fn service(base: &str, port: u16) -> BerthResult<Self> {
        let text = format!(
            "FROM {base}\n\
             WORKDIR {workdir}\n\
             COPY {manifest} .\n\
             INSTALL {manifest}\n\
             COPY . .\n\
             EXPOSE {port}\n\
             CMD [\"{serve}\", \"{entry}\", \"--host\", \"{host}\", \"--port\", \"{port}\"]\n",
            workdir = service::WORKDIR,
            manifest = service::MANIFEST,
            serve = service::SERVE_COMMAND,
            entry = service::ENTRY_POINT,
            host = service::BIND_HOST,
        );
        Ok(parse(&text)?)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Base image reference of the `FROM` instruction.
    pub fn base(&self) -> &str {
        match self.instructions.first() {
            Some(Instruction::From { image }) => image,
            _ => recipe::SCRATCH,
        }
    }

    /// Non-fatal findings about cache efficiency.
    pub fn warnings(&self) -> Vec<String> {
        let first_install = self
            .instructions
            .iter()
            .position(|i| matches!(i, Instruction::Install { .. }));
        let Some(first_install) = first_install else {
            return Vec::new();
        };

        self.instructions[..first_install]
            .iter()
            .filter(|i| match i {
                Instruction::Copy { sources, .. } => sources
                    .iter()
                    .any(|s| s.trim_end_matches('/') == "." || s == "./"),
                _ => false,
            })
            .map(|i| {
                format!(
                    "'{i}' precedes INSTALL: any source change will reinstall dependencies"
                )
            })
            .collect()
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instruction in &self.instructions {
            writeln!(f, "{instruction}")?;
        }
        Ok(())
    }
}
