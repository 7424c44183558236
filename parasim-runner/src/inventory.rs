// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test inventory: loading and representing the full set of test
//! identifiers produced by the one-shot list pass.

use crate::errors::InventoryError;
use camino::Utf8Path;
use serde::Deserialize;
use smol_str::SmolStr;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::Duration,
};
use tracing::debug;

/// Delay between reload attempts while the inventory artifact is being
/// written by a concurrently-running list pass.
const RELOAD_BACKOFF: Duration = Duration::from_secs(2);

/// A fully-qualified test identifier: `Class/method`, optionally prefixed
/// with a suite name (`Suite/Class/method`).
///
/// Treated as an atomic unit; equality is exact string match.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TestId(SmolStr);

impl TestId {
    /// Creates a new test ID from a string.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id.as_ref()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the trailing `Class/method` portion, dropping any suite
    /// prefix.
    pub fn class_method(&self) -> &str {
        let s = self.0.as_str();
        match s.match_indices('/').rev().nth(1) {
            Some((idx, _)) => &s[idx + 1..],
            None => s,
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The serialized forms of the inventory artifact.
///
/// The current list pass writes a flat array of identifiers; older tool
/// generations wrote a map from test target to identifiers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInventory {
    Flat(Vec<String>),
    ByTarget(BTreeMap<String, Vec<String>>),
}

/// The full deduplicated, sorted set of test identifiers known at build
/// time.
///
/// Produced once by the list pass and read-only afterward.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestInventory {
    tests: Vec<TestId>,
}

impl TestInventory {
    /// Builds an inventory from an iterator of identifiers, deduplicating
    /// and sorting lexicographically (the canonical, reproducible order).
    pub fn from_ids(ids: impl IntoIterator<Item = TestId>) -> Self {
        let set: BTreeSet<TestId> = ids.into_iter().collect();
        Self {
            tests: set.into_iter().collect(),
        }
    }

    /// Loads the inventory artifact at `path`.
    ///
    /// The artifact may be written asynchronously by a concurrently-running
    /// list pass; a missing, unparseable, or empty artifact is retried up to
    /// `attempts` times with a fixed backoff before
    /// [`InventoryError::Unavailable`] is returned.
    pub async fn load(
        path: &Utf8Path,
        target: Option<&str>,
        attempts: usize,
    ) -> Result<Self, InventoryError> {
        for attempt in 1..=attempts {
            match Self::load_once(path, target).await {
                Ok(inventory) if !inventory.is_empty() => return Ok(inventory),
                Ok(_) => debug!(attempt, %path, "inventory empty, retrying"),
                Err(error) => debug!(attempt, %path, %error, "inventory unavailable, retrying"),
            }
            if attempt < attempts {
                tokio::time::sleep(RELOAD_BACKOFF).await;
            }
        }
        Err(InventoryError::Unavailable {
            path: path.to_owned(),
            attempts,
        })
    }

    async fn load_once(path: &Utf8Path, target: Option<&str>) -> Result<Self, InventoryError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|error| InventoryError::Read {
                    path: path.to_owned(),
                    error,
                })?;
        Self::parse(&contents, target).map_err(|error| InventoryError::Parse {
            path: path.to_owned(),
            error,
        })
    }

    fn parse(contents: &str, target: Option<&str>) -> Result<Self, serde_json::Error> {
        let raw: RawInventory = serde_json::from_str(contents)?;
        let ids: Vec<String> = match raw {
            RawInventory::Flat(ids) => ids,
            RawInventory::ByTarget(mut by_target) => match target {
                Some(target) => by_target.remove(target).unwrap_or_default(),
                None => by_target.into_values().flatten().collect(),
            },
        };
        let ids = ids.into_iter().map(|id| {
            // Identifiers may carry a `Target/` prefix from the list pass.
            let id = match target {
                Some(target) => id
                    .strip_prefix(target)
                    .and_then(|rest| rest.strip_prefix('/'))
                    .map(str::to_owned)
                    .unwrap_or(id),
                None => id,
            };
            TestId::new(id)
        });
        Ok(Self::from_ids(ids))
    }

    /// Returns the number of tests in the inventory.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if the inventory is empty.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Returns the sorted test identifiers.
    pub fn tests(&self) -> &[TestId] {
        &self.tests
    }
}
