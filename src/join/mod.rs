//! Merge requests and the per-bucket join
//!
//! A [`MergeRequest`] mirrors the external `merge(left, right, by_x, by_y, all_x, all_y,
//! method)` contract. [`local`] matches the rows of one co-located bucket and [`reassembly`]
//! stitches the per-bucket matches into the output table.

pub mod local;
pub mod reassembly;

pub use local::*;
pub use reassembly::*;

use crate::radix::Partitioning;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default suffix appended to right column names that collide with a left column
pub const DEFAULT_SUFFIX: &str = "_y";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinMode {
    Inner,
    LeftOuter,
    RightOuter,
}

impl JoinMode {
    pub fn from_flags(all_x: bool, all_y: bool) -> Result<Self> {
        match (all_x, all_y) {
            (false, false) => Ok(JoinMode::Inner),
            (true, false) => Ok(JoinMode::LeftOuter),
            (false, true) => Ok(JoinMode::RightOuter),
            (true, true) => Err(Error::InvalidRequest(
                "all_x and all_y cannot both be set".into(),
            )),
        }
    }

    /// Whether unmatched left rows are kept
    pub fn keeps_left(self) -> bool {
        self == JoinMode::LeftOuter
    }

    /// Whether unmatched right rows are kept
    pub fn keeps_right(self) -> bool {
        self == JoinMode::RightOuter
    }
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinMode::Inner => write!(f, "inner"),
            JoinMode::LeftOuter => write!(f, "left_outer"),
            JoinMode::RightOuter => write!(f, "right_outer"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeMethod {
    #[default]
    Auto,
    Radix,
    Hash,
}

impl MergeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeMethod::Auto => "auto",
            MergeMethod::Radix => "radix",
            MergeMethod::Hash => "hash",
        }
    }

    /// How rows are bucketized and how each bucket is matched
    pub fn strategy(self) -> (Partitioning, LocalStrategy) {
        match self {
            MergeMethod::Auto => (Partitioning::Radix, LocalStrategy::HashProbe),
            MergeMethod::Radix => (Partitioning::Radix, LocalStrategy::SortMerge),
            MergeMethod::Hash => (Partitioning::Hash, LocalStrategy::HashProbe),
        }
    }
}

impl FromStr for MergeMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(MergeMethod::Auto),
            "radix" => Ok(MergeMethod::Radix),
            "hash" => Ok(MergeMethod::Hash),
            other => Err(Error::InvalidRequest(format!(
                "unknown merge method '{}', expected auto, radix or hash",
                other
            ))),
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sides whose join keys must not repeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUniqueness {
    #[default]
    None,
    Left,
    Right,
    Both,
}

impl KeyUniqueness {
    pub fn left(self) -> bool {
        matches!(self, KeyUniqueness::Left | KeyUniqueness::Both)
    }

    pub fn right(self) -> bool {
        matches!(self, KeyUniqueness::Right | KeyUniqueness::Both)
    }
}

/// Parameters of one merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub by_x: Vec<String>,
    pub by_y: Vec<String>,
    pub all_x: bool,
    pub all_y: bool,
    pub method: MergeMethod,
    pub unique: KeyUniqueness,
    pub suffix: String,
}

impl MergeRequest {
    pub fn new<S: Into<String>>(
        by_x: impl IntoIterator<Item = S>,
        by_y: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            by_x: by_x.into_iter().map(Into::into).collect(),
            by_y: by_y.into_iter().map(Into::into).collect(),
            all_x: false,
            all_y: false,
            method: MergeMethod::Auto,
            unique: KeyUniqueness::None,
            suffix: DEFAULT_SUFFIX.to_string(),
        }
    }

    /// Join on identically named columns
    pub fn on<S: Into<String> + Clone>(keys: impl IntoIterator<Item = S>) -> Self {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        Self::new(keys.clone(), keys)
    }

    pub fn all_x(mut self, all_x: bool) -> Self {
        self.all_x = all_x;
        self
    }

    pub fn all_y(mut self, all_y: bool) -> Self {
        self.all_y = all_y;
        self
    }

    pub fn method(mut self, method: MergeMethod) -> Self {
        self.method = method;
        self
    }

    pub fn unique(mut self, unique: KeyUniqueness) -> Self {
        self.unique = unique;
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn mode(&self) -> Result<JoinMode> {
        JoinMode::from_flags(self.all_x, self.all_y)
    }

    /// Checks that need no table data
    pub fn validate(&self) -> Result<JoinMode> {
        let mode = self.mode()?;
        if self.by_x.is_empty() || self.by_y.is_empty() {
            return Err(Error::InvalidRequest("at least one join key is required".into()));
        }
        if self.by_x.len() != self.by_y.len() {
            return Err(Error::InvalidRequest(format!(
                "by_x has {} columns but by_y has {}",
                self.by_x.len(),
                self.by_y.len()
            )));
        }
        if self.suffix.is_empty() {
            return Err(Error::InvalidRequest("column suffix cannot be empty".into()));
        }
        Ok(mode)
    }
}
