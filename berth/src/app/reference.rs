//! `module:attribute` references.

use std::fmt;
use std::str::FromStr;

use berth_shared::errors::{BerthError, EntryPointError};

/// Parsed entry point reference such as `server:app` or `pkg.web:application`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryPointRef {
    pub module: String,
    pub attribute: String,
}

impl FromStr for EntryPointRef {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || BerthError::from(EntryPointError::MalformedReference(s.to_string()));

        let (module, attribute) = s.split_once(':').ok_or_else(malformed)?;
        let valid_path = |path: &str| !path.is_empty() && path.split('.').all(is_identifier);
        if !valid_path(module) || !valid_path(attribute) {
            return Err(malformed());
        }

        Ok(Self {
            module: module.to_string(),
            attribute: attribute.to_string(),
        })
    }
}

impl fmt::Display for EntryPointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.attribute)
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let r: EntryPointRef = "server:app".parse().unwrap();
        assert_eq!(r.module, "server");
        assert_eq!(r.attribute, "app");
        assert_eq!(r.to_string(), "server:app");

        let r: EntryPointRef = "pkg.web:factory.app".parse().unwrap();
        assert_eq!(r.module, "pkg.web");
        assert_eq!(r.attribute, "factory.app");
    }

    #[test]
    fn test_malformed_references() {
        for bad in ["server", ":app", "server:", "server:app:x", "9lives:app", "ser ver:app", "a..b:c"] {
            let err = bad.parse::<EntryPointRef>().unwrap_err();
            assert!(
                matches!(err, BerthError::EntryPoint(EntryPointError::MalformedReference(_))),
                "{bad} should be malformed"
            );
        }
    }
}
