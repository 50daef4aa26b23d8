//! Line-oriented recipe parser.

use std::path::PathBuf;

use super::{Instruction, Recipe, RecipeError};
use crate::images::is_pinned;

/// A logical line: continuations joined, with the line number it started on.
struct LogicalLine {
    number: usize,
    text: String,
}

/// Parse recipe text into a validated [`Recipe`].
pub fn parse(text: &str) -> Result<Recipe, RecipeError> {
    let mut instructions = Vec::new();

    for line in logical_lines(text) {
        let (keyword, args) = match line.text.split_once(char::is_whitespace) {
            Some((keyword, args)) => (keyword, args.trim()),
            None => (line.text.as_str(), ""),
        };
        let keyword = keyword.to_ascii_uppercase();

        if instructions.is_empty() && keyword != "FROM" {
            return Err(RecipeError::MissingFrom {
                line: line.number,
                found: keyword,
            });
        }

        let n = line.number;
        match keyword.as_str() {
            "FROM" => {
                if !instructions.is_empty() {
                    return Err(RecipeError::MultipleFrom { line: n });
                }
                instructions.push(parse_from(n, args)?);
            }
            "WORKDIR" => instructions.push(parse_workdir(n, args)?),
            "COPY" => instructions.push(parse_copy(n, args)?),
            "INSTALL" => instructions.push(parse_install(n, args)?),
            "ENV" => instructions.extend(parse_env(n, args)?),
            "EXPOSE" => instructions.extend(parse_expose(n, args)?),
            "CMD" => instructions.push(parse_cmd(n, args)?),
            _ => {
                return Err(RecipeError::Unsupported {
                    line: n,
                    instruction: keyword,
                });
            }
        }
    }

    if instructions.is_empty() {
        return Err(RecipeError::Empty);
    }

    Ok(Recipe { instructions })
}

/// Quote a word so [`split_words`] reads it back unchanged.
pub(super) fn quote(word: &str) -> String {
    if !word.is_empty() && !word.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        return word.to_string();
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('"');
    for c in word.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn logical_lines(text: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut pending: Option<LogicalLine> = None;

    for (index, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.starts_with('#') || (trimmed.is_empty() && pending.is_none()) {
            continue;
        }

        let (content, continues) = match trimmed.strip_suffix('\\') {
            Some(head) => (head.trim_end(), true),
            None => (trimmed, false),
        };

        let line = pending.get_or_insert_with(|| LogicalLine {
            number: index + 1,
            text: String::new(),
        });
        if !line.text.is_empty() && !content.is_empty() {
            line.text.push(' ');
        }
        line.text.push_str(content);

        if !continues && let Some(done) = pending.take() {
            if !done.text.is_empty() {
                lines.push(done);
            }
        }
    }

    if let Some(done) = pending
        && !done.text.is_empty()
    {
        lines.push(done);
    }
    lines
}

/// Split arguments on whitespace, honoring double quotes and `\` escapes.
fn split_words(line: usize, instruction: &'static str, args: &str) -> Result<Vec<String>, RecipeError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = args.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if quoted => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => break,
            },
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quoted {
        return Err(RecipeError::Invalid {
            line,
            instruction,
            message: "unterminated quote".into(),
        });
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn invalid(line: usize, instruction: &'static str, message: impl Into<String>) -> RecipeError {
    RecipeError::Invalid {
        line,
        instruction,
        message: message.into(),
    }
}

fn parse_from(line: usize, args: &str) -> Result<Instruction, RecipeError> {
    let words = split_words(line, "FROM", args)?;
    let [image] = words.as_slice() else {
        return Err(invalid(line, "FROM", "expected exactly one image reference"));
    };
    if !is_pinned(image) {
        return Err(RecipeError::UnpinnedBase {
            line,
            reference: image.clone(),
        });
    }
    Ok(Instruction::From {
        image: image.clone(),
    })
}

fn parse_workdir(line: usize, args: &str) -> Result<Instruction, RecipeError> {
    let words = split_words(line, "WORKDIR", args)?;
    let [path] = words.as_slice() else {
        return Err(invalid(line, "WORKDIR", "expected exactly one path"));
    };
    if !path.starts_with('/') {
        return Err(invalid(line, "WORKDIR", format!("'{path}' is not absolute")));
    }
    if path.split('/').any(|c| c == "..") {
        return Err(invalid(line, "WORKDIR", format!("'{path}' must not contain '..'")));
    }
    let trimmed = path.trim_end_matches('/');
    Ok(Instruction::Workdir {
        path: if trimmed.is_empty() { "/".into() } else { trimmed.into() },
    })
}

fn parse_copy(line: usize, args: &str) -> Result<Instruction, RecipeError> {
    let mut words = if args.starts_with('[') {
        serde_json::from_str::<Vec<String>>(args)
            .map_err(|e| invalid(line, "COPY", format!("invalid JSON form: {e}")))?
    } else {
        split_words(line, "COPY", args)?
    };

    if let Some(flag) = words.iter().find(|w| w.starts_with("--")) {
        return Err(RecipeError::Unsupported {
            line,
            instruction: format!("COPY {flag}"),
        });
    }
    if words.len() < 2 {
        return Err(invalid(line, "COPY", "expected at least one source and a destination"));
    }

    let dest = words.pop().unwrap_or_default();
    for source in &words {
        if source.starts_with('/') || source.split('/').any(|c| c == "..") {
            return Err(invalid(
                line,
                "COPY",
                format!("source '{source}' must stay inside the build context"),
            ));
        }
    }
    Ok(Instruction::Copy {
        sources: words,
        dest,
    })
}

fn parse_install(line: usize, args: &str) -> Result<Instruction, RecipeError> {
    let words = split_words(line, "INSTALL", args)?;
    let mut index = None;
    let mut manifest = None;
    let mut iter = words.into_iter();

    while let Some(word) = iter.next() {
        if let Some(value) = word.strip_prefix("--index=") {
            index = Some(PathBuf::from(value));
        } else if word == "--index" {
            let value = iter
                .next()
                .ok_or_else(|| invalid(line, "INSTALL", "--index needs a path"))?;
            index = Some(PathBuf::from(value));
        } else if word.starts_with("--") {
            return Err(RecipeError::Unsupported {
                line,
                instruction: format!("INSTALL {word}"),
            });
        } else if manifest.replace(word).is_some() {
            return Err(invalid(line, "INSTALL", "expected exactly one manifest"));
        }
    }

    let manifest = manifest.ok_or_else(|| invalid(line, "INSTALL", "missing manifest path"))?;
    Ok(Instruction::Install { manifest, index })
}

fn parse_env(line: usize, args: &str) -> Result<Vec<Instruction>, RecipeError> {
    let words = split_words(line, "ENV", args)?;
    if words.is_empty() {
        return Err(invalid(line, "ENV", "expected KEY=VALUE"));
    }

    // Legacy form: `ENV KEY value with spaces`.
    if !words[0].contains('=') {
        let (key, value) = args
            .split_once(char::is_whitespace)
            .ok_or_else(|| invalid(line, "ENV", "expected KEY=VALUE"))?;
        validate_env_key(line, key)?;
        return Ok(vec![Instruction::Env {
            key: key.to_string(),
            value: value.trim().to_string(),
        }]);
    }

    words
        .into_iter()
        .map(|word| {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| invalid(line, "ENV", format!("'{word}' is not KEY=VALUE")))?;
            validate_env_key(line, key)?;
            Ok(Instruction::Env {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

fn validate_env_key(line: usize, key: &str) -> Result<(), RecipeError> {
    let valid = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(invalid(line, "ENV", format!("invalid variable name '{key}'")))
    }
}

fn parse_expose(line: usize, args: &str) -> Result<Vec<Instruction>, RecipeError> {
    let words = split_words(line, "EXPOSE", args)?;
    if words.is_empty() {
        return Err(invalid(line, "EXPOSE", "expected a port"));
    }

    words
        .iter()
        .map(|word| {
            let (port, protocol) = word.split_once('/').unwrap_or((word, "tcp"));
            if !protocol.eq_ignore_ascii_case("tcp") {
                return Err(RecipeError::Unsupported {
                    line,
                    instruction: format!("EXPOSE {word}"),
                });
            }
            match port.parse::<u16>() {
                Ok(port) if port > 0 => Ok(Instruction::Expose { port }),
                _ => Err(invalid(line, "EXPOSE", format!("invalid port '{port}'"))),
            }
        })
        .collect()
}

fn parse_cmd(line: usize, args: &str) -> Result<Instruction, RecipeError> {
    if !args.starts_with('[') {
        return Err(invalid(line, "CMD", "only the JSON exec form is supported"));
    }
    let args: Vec<String> = serde_json::from_str(args)
        .map_err(|e| invalid(line, "CMD", format!("invalid JSON exec form: {e}")))?;
    if args.is_empty() {
        return Err(invalid(line, "CMD", "command must not be empty"));
    }
    Ok(Instruction::Cmd { args })
}
