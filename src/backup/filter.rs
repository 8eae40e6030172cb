// dbbackup/src/backup/filter.rs
use std::collections::HashSet;

use crate::config::LIST_SEPARATOR;

/// Database names excluded from backup. Matching is exact and case-sensitive.
#[derive(Debug, Clone, Default)]
pub struct DiscardSet(HashSet<String>);

impl DiscardSet {
    /// Parses a `;`-separated list. Blank entries are ignored, so an unset value yields an empty set.
    pub fn parse(raw: &str) -> Self {
        DiscardSet(
            raw.split(LIST_SEPARATOR)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<S: Into<String>> FromIterator<S> for DiscardSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        DiscardSet(iter.into_iter().map(Into::into).collect())
    }
}

/// Splits `databases` into the names to back up and the names discarded, both in input order.
pub fn filter_databases(databases: &[String], discard: &DiscardSet) -> (Vec<String>, Vec<String>) {
    databases
        .iter()
        .cloned()
        .partition(|name| !discard.contains(name))
}
