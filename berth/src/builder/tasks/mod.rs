//! Build tasks, one per recipe instruction.

mod base;
mod copy;
mod install;
mod metadata;
mod workdir;

use crate::pipeline::{BoxedTask, Pipeline, Stage};
use crate::recipe::{Instruction, Recipe};

use super::context::BuildCtx;

/// Translate a recipe into the build pipeline.
///
/// The base stage resolves `FROM`; every other instruction becomes one
/// sequential step, since each step reads the filesystem of the previous one.
pub fn build_pipeline(recipe: &Recipe) -> Pipeline<BuildCtx> {
    let mut base: Vec<BoxedTask<BuildCtx>> = Vec::new();
    let mut steps: Vec<BoxedTask<BuildCtx>> = Vec::new();

    for instruction in recipe.instructions() {
        let text = instruction.to_string();
        match instruction {
            Instruction::From { image } => base.push(Box::new(base::BaseTask {
                image: image.clone(),
                text,
            })),
            Instruction::Workdir { path } => steps.push(Box::new(workdir::WorkdirTask {
                path: path.clone(),
                text,
            })),
            Instruction::Copy { sources, dest } => steps.push(Box::new(copy::CopyTask {
                sources: sources.clone(),
                dest: dest.clone(),
                text,
            })),
            Instruction::Install { manifest, index } => {
                steps.push(Box::new(install::InstallTask {
                    manifest: manifest.clone(),
                    index: index.clone(),
                    text,
                }))
            }
            Instruction::Env { .. } | Instruction::Expose { .. } | Instruction::Cmd { .. } => {
                steps.push(Box::new(metadata::MetadataTask {
                    instruction: instruction.clone(),
                    text,
                }))
            }
        }
    }

    Pipeline::new("build")
        .stage(Stage::sequential("base", base))
        .stage(Stage::sequential("steps", steps))
}
