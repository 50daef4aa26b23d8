//! Package versions and version specifiers.
//!
//! Versions are dotted numeric release segments (`1`, `2.31.0`) with optional
//! pre-release (`a`, `b`, `rc`), post-release and dev-release suffixes:
//! `1.0.dev1 < 1.0a1 < 1.0rc1 < 1.0 < 1.0.post1`. Trailing zero release
//! segments are insignificant, so `1.0` and `1.0.0` compare equal. Epochs and
//! local versions are not supported.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use berth_shared::errors::BerthError;

// ============================================================================
// VERSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
}

const SEPARATORS: [char; 3] = ['.', '-', '_'];

const PRE_LABELS: &[(&str, PreRelease)] = &[
    ("alpha", PreRelease::Alpha),
    ("a", PreRelease::Alpha),
    ("beta", PreRelease::Beta),
    ("b", PreRelease::Beta),
    ("preview", PreRelease::Rc),
    ("pre", PreRelease::Rc),
    ("rc", PreRelease::Rc),
    ("c", PreRelease::Rc),
];

const POST_LABELS: &[(&str, ())] = &[("post", ()), ("rev", ()), ("r", ())];

const DEV_LABELS: &[(&str, ())] = &[("dev", ())];

#[derive(Debug, Clone)]
pub struct Version {
    release: Vec<u64>,
    pre: Option<(PreRelease, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
    raw: String,
}

impl Version {
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    /// Pre-releases and dev-releases are only chosen when asked for.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    pub fn is_postrelease(&self) -> bool {
        self.post.is_some()
    }

    /// Release padded with zeros to `len` segments.
    fn padded(&self, len: usize) -> impl Iterator<Item = u64> + '_ {
        self.release
            .iter()
            .copied()
            .chain(std::iter::repeat(0))
            .take(len.max(self.release.len()))
    }

    fn release_cmp(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        self.padded(len).cmp(other.padded(len))
    }

    // A bare dev-release sorts before every pre-release of the same release.
    fn pre_key(&self) -> (u8, u64) {
        match (self.pre, self.post, self.dev) {
            (Some((kind, n)), _, _) => (1 + kind as u8, n),
            (None, None, Some(_)) => (0, 0),
            (None, _, _) => (u8::MAX, 0),
        }
    }

    fn post_key(&self) -> (u8, u64) {
        self.post.map_or((0, 0), |n| (1, n))
    }

    fn dev_key(&self) -> (u8, u64) {
        self.dev.map_or((1, 0), |n| (0, n))
    }
}

/// Consume `[sep]label[sep][N]` from the front of `rest`. A missing number
/// means zero.
fn take_suffix<'s, T: Copy>(rest: &mut &'s str, labels: &[(&str, T)]) -> Option<(T, u64)> {
    let current: &'s str = rest;
    let body = current.strip_prefix(SEPARATORS).unwrap_or(current);
    for (label, value) in labels {
        let Some(after) = body.strip_prefix(label) else {
            continue;
        };
        let number = after.strip_prefix(SEPARATORS).unwrap_or(after);
        let digits = number.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            *rest = after;
            return Some((*value, 0));
        }
        let n = number[..digits].parse().ok()?;
        *rest = &number[digits..];
        return Some((*value, n));
    }
    None
}

impl FromStr for Version {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(BerthError::Manifest("empty version".into()));
        }
        if raw.contains('!') || raw.contains('+') {
            return Err(BerthError::Manifest(format!(
                "invalid version '{raw}': epochs and local versions are not supported"
            )));
        }

        let lowered = raw.to_ascii_lowercase();
        let mut rest = lowered.strip_prefix('v').unwrap_or(&lowered);

        let mut release = Vec::new();
        loop {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                return Err(BerthError::Manifest(format!(
                    "invalid version '{raw}': release segments must be numeric"
                )));
            }
            release.push(rest[..digits].parse::<u64>().map_err(|_| {
                BerthError::Manifest(format!("version segment too large in '{raw}'"))
            })?);
            rest = &rest[digits..];
            match rest.strip_prefix('.') {
                Some(after) if after.starts_with(|c: char| c.is_ascii_digit()) => rest = after,
                _ => break,
            }
        }

        let pre = take_suffix(&mut rest, PRE_LABELS);
        let mut post = take_suffix(&mut rest, POST_LABELS).map(|(_, n)| n);
        if post.is_none() {
            // Implicit post-release: `1.0-1`.
            if let Some(number) = rest.strip_prefix('-') {
                let digits = number.bytes().take_while(u8::is_ascii_digit).count();
                if digits > 0 {
                    post = number[..digits].parse().ok();
                    rest = &number[digits..];
                }
            }
        }
        let dev = take_suffix(&mut rest, DEV_LABELS).map(|(_, n)| n);

        if !rest.is_empty() {
            return Err(BerthError::Manifest(format!(
                "invalid version '{raw}': unexpected '{rest}'"
            )));
        }

        Ok(Self {
            release,
            pre,
            post,
            dev,
            raw: raw.to_string(),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release_cmp(other)
            .then_with(|| self.pre_key().cmp(&other.pre_key()))
            .then_with(|| self.post_key().cmp(&other.post_key()))
            .then_with(|| self.dev_key().cmp(&other.dev_key()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

// ============================================================================
// SPECIFIERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
    Compatible,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterEqual => ">=",
            Operator::LessEqual => "<=",
            Operator::Greater => ">",
            Operator::Less => "<",
            Operator::Compatible => "~=",
        }
    }
}

/// One clause of a constraint, e.g. `>=2.0` or `==1.4.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specifier {
    pub op: Operator,
    pub version: Version,
    /// `==X.Y.*` / `!=X.Y.*` prefix match
    pub wildcard: bool,
}

impl Specifier {
    pub fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            Operator::Equal if self.wildcard => self.prefix_matches(candidate),
            Operator::NotEqual if self.wildcard => !self.prefix_matches(candidate),
            Operator::Equal => candidate == &self.version,
            Operator::NotEqual => candidate != &self.version,
            Operator::GreaterEqual => candidate >= &self.version,
            Operator::LessEqual => candidate <= &self.version,
            // `>V` does not admit post-releases of V, `<V` does not admit
            // pre-releases of V, unless V is one itself.
            Operator::Greater => {
                candidate > &self.version
                    && !(candidate.is_postrelease()
                        && !self.version.is_postrelease()
                        && candidate.release_cmp(&self.version) == Ordering::Equal)
            }
            Operator::Less => {
                candidate < &self.version
                    && !(candidate.is_prerelease()
                        && !self.version.is_prerelease()
                        && candidate.release_cmp(&self.version) == Ordering::Equal)
            }
            Operator::Compatible => {
                // ~=X.Y.Z means >=X.Y.Z and ==X.Y.*
                let prefix = &self.version.release[..self.version.release.len() - 1];
                candidate >= &self.version && starts_with(candidate, prefix)
            }
        }
    }

    fn prefix_matches(&self, candidate: &Version) -> bool {
        starts_with(candidate, &self.version.release)
    }
}

fn starts_with(candidate: &Version, prefix: &[u64]) -> bool {
    candidate
        .padded(prefix.len())
        .zip(prefix.iter())
        .all(|(a, b)| a == *b)
}

impl FromStr for Specifier {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Two-character operators first so ">=" is not read as ">".
        let (op, rest) = [
            Operator::Equal,
            Operator::NotEqual,
            Operator::GreaterEqual,
            Operator::LessEqual,
            Operator::Compatible,
            Operator::Greater,
            Operator::Less,
        ]
        .into_iter()
        .find_map(|op| s.strip_prefix(op.as_str()).map(|rest| (op, rest.trim())))
        .ok_or_else(|| {
            BerthError::Manifest(format!(
                "invalid version specifier '{s}': expected one of ==, !=, >=, <=, >, <, ~="
            ))
        })?;

        if rest.starts_with('=') {
            return Err(BerthError::Manifest(format!(
                "unsupported operator in '{s}' (arbitrary equality is not supported)"
            )));
        }

        let (version_str, wildcard) = match rest.strip_suffix(".*") {
            Some(prefix) => (prefix, true),
            None => (rest, false),
        };

        if wildcard && !matches!(op, Operator::Equal | Operator::NotEqual) {
            return Err(BerthError::Manifest(format!(
                "wildcard is only allowed with == and != (in '{s}')"
            )));
        }

        let version: Version = version_str.parse()?;

        if wildcard && (version.is_prerelease() || version.is_postrelease()) {
            return Err(BerthError::Manifest(format!(
                "wildcard needs a plain release prefix (in '{s}')"
            )));
        }

        if op == Operator::Compatible && version.release.len() < 2 {
            return Err(BerthError::Manifest(format!(
                "'~=' needs at least two version segments (in '{s}')"
            )));
        }

        Ok(Self {
            op,
            version,
            wildcard,
        })
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)?;
        if self.wildcard {
            f.write_str(".*")?;
        }
        Ok(())
    }
}

/// Comma-separated set of specifiers; all must hold. Empty matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionReq {
    specifiers: Vec<Specifier>,
}

impl VersionReq {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_any(&self) -> bool {
        self.specifiers.is_empty()
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        self.specifiers.iter().all(|s| s.matches(candidate))
    }

    /// Whether any clause names a pre-release, which opts the requirement
    /// into pre-release candidates.
    pub fn allows_prereleases(&self) -> bool {
        self.specifiers.iter().any(|s| s.version.is_prerelease())
    }

    pub fn specifiers(&self) -> &[Specifier] {
        &self.specifiers
    }
}

impl FromStr for VersionReq {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::any());
        }
        let specifiers = s
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<Specifier>, _>>()?;
        Ok(Self { specifiers })
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.specifiers.is_empty() {
            return f.write_str("*");
        }
        let parts: Vec<String> = self.specifiers.iter().map(|s| s.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn req(s: &str) -> VersionReq {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_ordering_ignores_trailing_zeros() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert!(v("1.10") > v("1.9"));
        assert!(v("2") > v("1.99.99"));
        assert_eq!(v("1.0").to_string(), "1.0");
    }

    #[test]
    fn test_version_rejects_malformed() {
        assert!("1..0".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
        assert!("1.0x".parse::<Version>().is_err());
        assert!("1!2.0".parse::<Version>().is_err());
        assert!("1.0+local".parse::<Version>().is_err());
    }

    #[test]
    fn test_release_suffix_ordering() {
        let ordered = [
            "1.0.dev1", "1.0a1", "1.0a2.dev1", "1.0a2", "1.0b1", "1.0rc1", "1.0", "1.0.post1.dev1",
            "1.0.post1", "1.1.dev0",
        ];
        for pair in ordered.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        }
        assert!(v("1.0rc1").is_prerelease());
        assert!(v("1.0.dev3").is_prerelease());
        assert!(!v("1.0.post1").is_prerelease());
    }

    #[test]
    fn test_suffix_spellings_normalize() {
        assert_eq!(v("1.0-RC1"), v("1.0rc1"));
        assert_eq!(v("1.0alpha"), v("1.0a0"));
        assert_eq!(v("1.0c2"), v("1.0rc2"));
        assert_eq!(v("1.0-1"), v("1.0.post1"));
        assert_eq!(v("1.0_dev"), v("1.0.dev0"));
        assert_eq!(v("v2.1"), v("2.1"));
        assert_eq!(v("1.0rc1").to_string(), "1.0rc1");
    }

    #[test]
    fn test_exclusive_bounds_and_suffixes() {
        assert!(!req("<2.0").matches(&v("2.0rc1")));
        assert!(req("<2.0rc2").matches(&v("2.0rc1")));
        assert!(!req(">1.0").matches(&v("1.0.post1")));
        assert!(req(">1.0.post1").matches(&v("1.0.post2")));
        assert!(req("==1.0rc1").matches(&v("1.0rc1")));
        assert!(req("==1.0rc1").allows_prereleases());
        assert!(!req(">=1.0").allows_prereleases());
        assert!("==1.0rc1.*".parse::<VersionReq>().is_err());
    }

    #[test]
    fn test_comparison_operators() {
        assert!(req(">=1.2,<2").matches(&v("1.9.3")));
        assert!(!req(">=1.2,<2").matches(&v("2.0")));
        assert!(req("!=1.5").matches(&v("1.4")));
        assert!(!req("!=1.5").matches(&v("1.5.0")));
        assert!(req("==1.5").matches(&v("1.5.0")));
        assert!(req("> 1.0").matches(&v("1.0.1")));
        assert!(req("<=1.0").matches(&v("1")));
    }

    #[test]
    fn test_wildcards() {
        assert!(req("==1.4.*").matches(&v("1.4.9")));
        assert!(req("==1.4.*").matches(&v("1.4")));
        assert!(!req("==1.4.*").matches(&v("1.5.0")));
        assert!(req("!=1.4.*").matches(&v("1.5")));
        assert!(">=1.4.*".parse::<VersionReq>().is_err());
    }

    #[test]
    fn test_compatible_release() {
        assert!(req("~=2.2").matches(&v("2.9")));
        assert!(!req("~=2.2").matches(&v("3.0")));
        assert!(req("~=1.4.5").matches(&v("1.4.9")));
        assert!(!req("~=1.4.5").matches(&v("1.5.0")));
        assert!(!req("~=1.4.5").matches(&v("1.4.4")));
        assert!("~=1".parse::<VersionReq>().is_err());
    }

    #[test]
    fn test_display_round_trip_form() {
        assert_eq!(req(">= 1.0 , <2").to_string(), ">=1.0,<2");
        assert_eq!(req("").to_string(), "*");
        assert!(req("").matches(&v("0.0.1")));
        assert!("===1.0".parse::<VersionReq>().is_err());
        assert!("^1.0".parse::<VersionReq>().is_err());
    }
}
