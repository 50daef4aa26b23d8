//! Dependency manifest (`requirements.txt`) parsing.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use berth_shared::errors::{BerthError, BerthResult};

use super::version::VersionReq;

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Normalized package name.
    pub name: String,
    pub extras: Vec<String>,
    pub constraint: VersionReq,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if !self.constraint.is_any() {
            write!(f, "{}", self.constraint)?;
        }
        Ok(())
    }
}

impl Requirement {
    /// Parse a single requirement string such as `requests[socks]>=2.31,<3`.
    pub fn parse(input: &str) -> BerthResult<Self> {
        let input = input.trim();

        if input.contains(';') {
            return Err(BerthError::Manifest(format!(
                "environment markers are not supported: '{input}'"
            )));
        }
        if input.contains(" @ ") || input.contains("://") {
            return Err(BerthError::Manifest(format!(
                "direct URL requirements are not supported: '{input}'"
            )));
        }

        let name_end = input
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(input.len());
        let raw_name = &input[..name_end];
        validate_name(raw_name, input)?;

        let mut rest = input[name_end..].trim_start();
        let mut extras = Vec::new();
        if let Some(after_bracket) = rest.strip_prefix('[') {
            let close = after_bracket.find(']').ok_or_else(|| {
                BerthError::Manifest(format!("unterminated extras in '{input}'"))
            })?;
            for extra in after_bracket[..close].split(',') {
                let extra = extra.trim();
                if !extra.is_empty() {
                    validate_name(extra, input)?;
                    extras.push(normalize_name(extra));
                }
            }
            rest = after_bracket[close + 1..].trim_start();
        }

        let constraint: VersionReq = rest.parse()?;

        Ok(Self {
            name: normalize_name(raw_name),
            extras,
            constraint,
        })
    }
}

/// Normalize a package name: lowercase with runs of `-`, `_` and `.`
/// collapsed to a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            pending_separator = true;
        } else {
            if pending_separator && !normalized.is_empty() {
                normalized.push('-');
            }
            pending_separator = false;
            normalized.push(c.to_ascii_lowercase());
        }
    }
    normalized
}

fn validate_name(name: &str, context: &str) -> BerthResult<()> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(BerthError::Manifest(format!(
            "invalid package name '{name}' in '{context}'"
        )))
    }
}

/// Ordered list of declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyManifest {
    pub requirements: Vec<Requirement>,
}

impl DependencyManifest {
    /// Read and parse a manifest file.
    pub fn read(path: &Path) -> BerthResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BerthError::Manifest(format!(
                    "dependency manifest not found: {}",
                    path.display()
                ))
            } else {
                BerthError::Manifest(format!("failed to read {}: {}", path.display(), e))
            }
        })?;
        Self::parse(&text)
    }

    /// Parse manifest text. Errors name the offending line.
    pub fn parse(text: &str) -> BerthResult<Self> {
        let mut requirements = Vec::new();
        let mut seen = HashSet::new();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let content = strip_comment(line).trim();
            if content.is_empty() {
                continue;
            }

            if content.starts_with('-') {
                return Err(BerthError::Manifest(format!(
                    "line {line_no}: options and includes are not supported: '{content}'"
                )));
            }

            let requirement = Requirement::parse(content)
                .map_err(|e| BerthError::Manifest(format!("line {line_no}: {}", strip_prefix(&e))))?;

            if !seen.insert(requirement.name.clone()) {
                return Err(BerthError::Manifest(format!(
                    "line {line_no}: duplicate requirement for '{}'",
                    requirement.name
                )));
            }
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// `#` starts a comment at line start or after whitespace.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn strip_prefix(err: &BerthError) -> String {
    match err {
        BerthError::Manifest(msg) => msg.clone(),
        other => other.to_string(),
    }
}
