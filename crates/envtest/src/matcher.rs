//! Selection of features and assessments.
//!
//! `Filters` is compiled once from `Flags` and then used as a pure
//! predicate: identical input always yields the identical answer.
//!
//! # Rules
//!
//! 1. Any matching skip filter rejects the unit, even if an accept filter
//!    also matches.
//! 2. A configured accept filter the unit does not satisfy rejects it.
//! 3. Otherwise the unit runs (no filters means run everything).
//!
//! Name filters are unanchored regex searches. Label filters match when the
//! unit carries any one of the filter's `key=value` pairs.

use crate::config::Flags;
use crate::errors::SelectionError;
use crate::features::Labels;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Whether a unit is a feature or an assessment; selects which name filters apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitLevel {
    Feature,
    Assessment,
}

/// A named, labeled unit presented to the matcher.
#[derive(Debug, Clone, Copy)]
pub struct Unit<'a> {
    pub level: UnitLevel,
    pub name: &'a str,
    pub labels: &'a Labels,
}

impl<'a> Unit<'a> {
    #[must_use]
    pub fn feature(name: &'a str, labels: &'a Labels) -> Self {
        Self {
            level: UnitLevel::Feature,
            name,
            labels,
        }
    }

    #[must_use]
    pub fn assessment(name: &'a str, labels: &'a Labels) -> Self {
        Self {
            level: UnitLevel::Assessment,
            name,
            labels,
        }
    }
}

/// A set of `key=value` pairs; one key may carry several values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pairs: BTreeMap<String, BTreeSet<String>>,
}

impl LabelSelector {
    /// Parse `k=v,k2=v2`. Whitespace around entries is ignored.
    pub fn parse(filter: &'static str, expr: &str) -> Result<Self, SelectionError> {
        let mut selector = Self::default();
        for entry in expr.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(SelectionError::InvalidLabel {
                    filter,
                    expr: entry.to_string(),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(SelectionError::InvalidLabel {
                    filter,
                    expr: entry.to_string(),
                });
            }
            selector.insert(key, value.trim());
        }
        Ok(selector)
    }

    /// Add a pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs
            .entry(key.into())
            .or_default()
            .insert(value.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// True if `labels` contains any of the selector's pairs.
    #[must_use]
    pub fn matches_any(&self, labels: &Labels) -> bool {
        labels.iter().any(|(key, value)| {
            self.pairs
                .get(key)
                .is_some_and(|values| values.contains(value))
        })
    }
}

/// Compiled selection filters.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    feature: Option<Regex>,
    assessment: Option<Regex>,
    labels: LabelSelector,
    skip_features: Option<Regex>,
    skip_assessments: Option<Regex>,
    skip_labels: LabelSelector,
}

impl Filters {
    /// Compile the selection strings of `flags`.
    pub fn compile(flags: &Flags) -> Result<Self, SelectionError> {
        Ok(Self {
            feature: compile_regex("feature", flags.feature.as_deref())?,
            assessment: compile_regex("assessment", flags.assessment.as_deref())?,
            labels: compile_labels("labels", flags.labels.as_deref())?,
            skip_features: compile_regex("skip-features", flags.skip_features.as_deref())?,
            skip_assessments: compile_regex(
                "skip-assessment",
                flags.skip_assessments.as_deref(),
            )?,
            skip_labels: compile_labels("skip-labels", flags.skip_labels.as_deref())?,
        })
    }

    /// True when no filter of any kind is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.feature.is_none()
            && self.assessment.is_none()
            && self.labels.is_empty()
            && self.skip_features.is_none()
            && self.skip_assessments.is_none()
            && self.skip_labels.is_empty()
    }

    /// Decide whether `unit` should run.
    #[must_use]
    pub fn should_run(&self, unit: &Unit<'_>) -> bool {
        let (accept_name, skip_name) = match unit.level {
            UnitLevel::Feature => (&self.feature, &self.skip_features),
            UnitLevel::Assessment => (&self.assessment, &self.skip_assessments),
        };

        if skip_name.as_ref().is_some_and(|re| re.is_match(unit.name)) {
            return false;
        }
        if self.skip_labels.matches_any(unit.labels) {
            return false;
        }
        if accept_name.as_ref().is_some_and(|re| !re.is_match(unit.name)) {
            return false;
        }
        if !self.labels.is_empty() && !self.labels.matches_any(unit.labels) {
            return false;
        }
        true
    }
}

fn compile_regex(filter: &'static str, expr: Option<&str>) -> Result<Option<Regex>, SelectionError> {
    expr.map(|e| Regex::new(e).map_err(|source| SelectionError::InvalidRegex { filter, source }))
        .transpose()
}

fn compile_labels(filter: &'static str, expr: Option<&str>) -> Result<LabelSelector, SelectionError> {
    match expr {
        Some(e) => LabelSelector::parse(filter, e),
        None => Ok(LabelSelector::default()),
    }
}
