//! Framework version comparison and specifier sets

use crate::{DlcError, DlcResult};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Dotted numeric version such as `2.13.0`
///
/// Missing trailing components compare as zero, so `2.7 == 2.7.0`.
#[derive(Debug, Clone)]
pub struct FrameworkVersion {
    parts: Vec<u64>,
}

impl FrameworkVersion {
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    fn component(&self, idx: usize) -> u64 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl FromStr for FrameworkVersion {
    type Err = DlcError;

    fn from_str(s: &str) -> DlcResult<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DlcError::InvalidImage("empty version".to_string()));
        }
        let parts = trimmed
            .split('.')
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| DlcError::InvalidImage(format!("invalid version '{}'", s)))
            })
            .collect::<DlcResult<Vec<_>>>()?;
        Ok(Self { parts })
    }
}

impl PartialEq for FrameworkVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrameworkVersion {}

impl PartialOrd for FrameworkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameworkVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for FrameworkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", joined.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone)]
struct Specifier {
    op: Op,
    version: FrameworkVersion,
}

impl Specifier {
    fn matches(&self, v: &FrameworkVersion) -> bool {
        match self.op {
            Op::Lt => v < &self.version,
            Op::Le => v <= &self.version,
            Op::Gt => v > &self.version,
            Op::Ge => v >= &self.version,
            Op::Eq => v == &self.version,
            Op::Ne => v != &self.version,
        }
    }
}

/// Comma-separated version constraints, e.g. `>=1.6,<1.9`
#[derive(Debug, Clone)]
pub struct SpecifierSet {
    raw: String,
    specifiers: Vec<Specifier>,
}

impl SpecifierSet {
    /// Whether every constraint holds for `version`
    pub fn contains(&self, version: &FrameworkVersion) -> bool {
        self.specifiers.iter().all(|s| s.matches(version))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for SpecifierSet {
    type Err = DlcError;

    fn from_str(s: &str) -> DlcResult<Self> {
        let mut specifiers = Vec::new();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (op, rest) = if let Some(r) = item.strip_prefix(">=") {
                (Op::Ge, r)
            } else if let Some(r) = item.strip_prefix("<=") {
                (Op::Le, r)
            } else if let Some(r) = item.strip_prefix("==") {
                (Op::Eq, r)
            } else if let Some(r) = item.strip_prefix("!=") {
                (Op::Ne, r)
            } else if let Some(r) = item.strip_prefix('>') {
                (Op::Gt, r)
            } else if let Some(r) = item.strip_prefix('<') {
                (Op::Lt, r)
            } else {
                return Err(DlcError::Config(format!("invalid version specifier '{}'", item)));
            };
            specifiers.push(Specifier {
                op,
                version: rest.parse()?,
            });
        }
        Ok(Self {
            raw: s.to_string(),
            specifiers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> FrameworkVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_ordering() {
        assert!(v("2.6.3") < v("2.7"));
        assert!(v("2.13.0") > v("2.7"));
        assert_eq!(v("2.7"), v("2.7.0"));
        assert!(v("1.10") > v("1.9.1"));
    }

    #[test]
    fn test_version_parse_error() {
        assert!("2.x".parse::<FrameworkVersion>().is_err());
        assert!("".parse::<FrameworkVersion>().is_err());
    }

    #[test]
    fn test_specifier_set() {
        let set: SpecifierSet = ">=1.6,<1.9".parse().unwrap();
        assert!(set.contains(&v("1.6.0")));
        assert!(set.contains(&v("1.8.0")));
        assert!(!set.contains(&v("1.9.0")));
        assert!(!set.contains(&v("1.4.1")));
        assert_eq!(set.as_str(), ">=1.6,<1.9");
    }

    #[test]
    fn test_specifier_set_invalid() {
        assert!("~=1.6".parse::<SpecifierSet>().is_err());
    }
}
