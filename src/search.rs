//! The search module
//! Merge nearest neighbour results from several label patterns

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{Fragment, FragmentStore};

/// Result count used when no limit is configured.
pub const DEFAULT_LIMIT: usize = 5;

/// Label pattern matching every fragment.
pub const ALL_LABELS: &str = "%";

/// A label pattern and how many fragments it may contribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub pattern: String,
    pub limit: usize,
}

impl Limit {
    pub fn new(pattern: impl Into<String>, limit: usize) -> Self {
        Self {
            pattern: pattern.into(),
            limit,
        }
    }
}

impl Default for Limit {
    fn default() -> Self {
        Self::new(ALL_LABELS, DEFAULT_LIMIT)
    }
}

/// Parses `"LABEL:N"`, or a bare `"N"` which applies to every label.
///
/// The count is taken after the last `:`, so labels may contain colons.
///
/// # Examples
///
/// ```
/// use fragdb::Limit;
///
/// let limit: Limit = "QA:3".parse().unwrap();
/// assert_eq!(limit, Limit::new("QA", 3));
///
/// let limit: Limit = "5".parse().unwrap();
/// assert_eq!(limit, Limit::new("%", 5));
///
/// assert!("QA:many".parse::<Limit>().is_err());
/// ```
impl FromStr for Limit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidLimit(s.to_string());
        let (pattern, count) = match s.rsplit_once(':') {
            Some((pattern, count)) => (pattern, count),
            None => (ALL_LABELS, s),
        };
        if pattern.is_empty() {
            return Err(invalid());
        }

        let limit = count.trim().parse::<usize>().map_err(|_| invalid())?;
        Ok(Self::new(pattern, limit))
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pattern, self.limit)
    }
}

/// Parses every entry, failing on the first malformed one.
pub fn parse_limits<S: AsRef<str>>(values: &[S]) -> Result<Vec<Limit>> {
    values.iter().map(|value| value.as_ref().parse()).collect()
}

/// Runs one `nearest` query per limit and merges the results.
///
/// Fragments are kept in the order they were first seen, so a fragment found
/// by an earlier pattern keeps its place when a later pattern finds it again.
/// Ranking is only exact within one pattern's own results.
///
/// # Arguments
///
/// * `store` - The store to query
/// * `vector` - The query embedding
/// * `limits` - Label patterns in priority order
///
/// # Returns
///
/// * `Ok(Vec<Fragment>)` - Merged fragments, no id repeated
/// * `Err(Error)` - The first failing `nearest` call
pub fn search(store: &FragmentStore, vector: &[f64], limits: &[Limit]) -> Result<Vec<Fragment>> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();

    for limit in limits {
        for fragment in store.nearest(vector, &limit.pattern, limit.limit)? {
            if seen.insert(fragment.id) {
                merged.push(fragment);
            }
        }
    }

    Ok(merged)
}
