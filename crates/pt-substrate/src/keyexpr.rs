//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Validated hierarchical topic keys and wildcard intersection."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Topic keys are `/`-separated chunks such as `sensors/room-1/temp`.
//!
//! Two wildcards are understood, each only as a whole chunk: `*` matches
//! exactly one chunk and `**` matches zero or more chunks. Characters the
//! substrate reserves (`#`, `?`, `$`) are rejected outright.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::SubstrateError;

const SINGLE_WILD: &str = "*";
const MULTI_WILD: &str = "**";
const RESERVED: [char; 3] = ['#', '?', '$'];

/// A validated topic key. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyExpr {
    inner: Arc<str>,
}

impl KeyExpr {
    /// Validate `key` and wrap it. Runs of `**` chunks collapse into one.
    pub fn new(key: impl AsRef<str>) -> Result<Self, SubstrateError> {
        let key = key.as_ref();
        validate(key)?;
        Ok(Self {
            inner: Arc::from(canonical(key).as_str()),
        })
    }

    /// Validate `key` and additionally refuse wildcards, as required for
    /// publishing and replying.
    pub fn concrete(key: impl AsRef<str>) -> Result<Self, SubstrateError> {
        let expr = Self::new(key)?;
        if expr.is_wild() {
            return Err(SubstrateError::InvalidKey {
                key: expr.to_string(),
                reason: "wildcards are not allowed here".into(),
            });
        }
        Ok(expr)
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// True when any chunk is `*` or `**`.
    pub fn is_wild(&self) -> bool {
        self.chunks().any(|chunk| chunk == SINGLE_WILD || chunk == MULTI_WILD)
    }

    /// Iterate over the `/`-separated chunks.
    pub fn chunks(&self) -> impl Iterator<Item = &str> {
        self.inner.split('/')
    }

    /// True when at least one concrete key is matched by both expressions.
    pub fn intersects(&self, other: &KeyExpr) -> bool {
        if self.inner == other.inner {
            return true;
        }
        let left: Vec<&str> = self.chunks().collect();
        let right: Vec<&str> = other.chunks().collect();
        intersect(&left, &right)
    }
}

fn validate(key: &str) -> Result<(), SubstrateError> {
    let invalid = |reason: &str| SubstrateError::InvalidKey {
        key: key.to_owned(),
        reason: reason.to_owned(),
    };

    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if let Some(c) = key.chars().find(|c| RESERVED.contains(c)) {
        return Err(invalid(&format!("reserved character '{c}'")));
    }
    for chunk in key.split('/') {
        if chunk.is_empty() {
            return Err(invalid("empty chunk"));
        }
        if chunk.contains('*') && chunk != SINGLE_WILD && chunk != MULTI_WILD {
            return Err(invalid("wildcards must span a whole chunk"));
        }
    }
    Ok(())
}

fn canonical(key: &str) -> String {
    let mut chunks: Vec<&str> = Vec::new();
    for chunk in key.split('/') {
        if chunk == MULTI_WILD && chunks.last() == Some(&MULTI_WILD) {
            continue;
        }
        chunks.push(chunk);
    }
    chunks.join("/")
}

/// `reach[i][j]` holds whether `left[i..]` and `right[j..]` intersect; filled
/// from the tails so every cell is computed once.
fn intersect(left: &[&str], right: &[&str]) -> bool {
    let (n, m) = (left.len(), right.len());
    let mut reach = vec![vec![false; m + 1]; n + 1];
    for i in (0..=n).rev() {
        for j in (0..=m).rev() {
            reach[i][j] = match (left.get(i), right.get(j)) {
                (None, None) => true,
                (Some(&MULTI_WILD), _) => reach[i + 1][j] || (j < m && reach[i][j + 1]),
                (_, Some(&MULTI_WILD)) => reach[i][j + 1] || (i < n && reach[i + 1][j]),
                (Some(l), Some(r)) => {
                    (*l == SINGLE_WILD || *r == SINGLE_WILD || l == r) && reach[i + 1][j + 1]
                }
                _ => false,
            };
        }
    }
    reach[0][0]
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl AsRef<str> for KeyExpr {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl FromStr for KeyExpr {
    type Err = SubstrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for KeyExpr {
    type Error = SubstrateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
