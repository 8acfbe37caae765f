//! Dropdown option resolution: turning a discovery payload into an ordered,
//! de-duplicated list of `(label, id)` pairs.

use std::collections::{HashMap, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OptionPair {
    pub label: String,
    pub id: String,
}

impl OptionPair {
    pub fn new(label: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            id: id.into(),
        }
    }
}

/// Where an option set came from. Only used for logging and for the strict
/// mode decision in callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OptionSource {
    Remote,
    Defaults,
}

/// An ordered set of options with unique labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OptionSet {
    pairs: Vec<OptionPair>,
    source: OptionSource,
}

impl OptionSet {
    /// Sorts case-insensitively by label. A repeated label keeps the slot
    /// of its first occurrence and takes the id of its last.
    pub fn from_pairs(pairs: Vec<OptionPair>, source: OptionSource) -> Self {
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<OptionPair> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match slots.get(&pair.label) {
                Some(&at) => unique[at].id = pair.id,
                None => {
                    slots.insert(pair.label.clone(), unique.len());
                    unique.push(pair);
                }
            }
        }
        unique.sort_by_key(|p| p.label.to_lowercase());
        Self {
            pairs: unique,
            source,
        }
    }

    /// Keeps the given order; used for the hardcoded defaults.
    pub fn defaults(pairs: Vec<OptionPair>) -> Self {
        Self {
            pairs,
            source: OptionSource::Defaults,
        }
    }

    pub fn source(&self) -> OptionSource {
        self.source
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs(&self) -> &[OptionPair] {
        &self.pairs
    }

    pub fn labels(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.label.clone()).collect()
    }

    pub fn id_for(&self, label: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|p| p.label == label)
            .map(|p| p.id.as_str())
    }

    pub fn first(&self) -> Option<&OptionPair> {
        self.pairs.first()
    }
}

/// Predicate applied to each raw discovery item before it becomes an option.
pub trait OptionFilter: Send + Sync {
    fn accepts(&self, item: &Value) -> bool;
}

/// Lets every object through; for listings that are only normalised.
pub struct AcceptAll;

impl OptionFilter for AcceptAll {
    fn accepts(&self, _item: &Value) -> bool {
        true
    }
}

/// Accepts items whose `field` (trimmed, lower-cased) is in the allow-list.
pub struct FieldAllowList {
    field: String,
    allowed: HashSet<String>,
}

impl FieldAllowList {
    pub fn new<I, S>(field: &str, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            field: field.to_string(),
            allowed: allowed
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .collect(),
        }
    }
}

impl OptionFilter for FieldAllowList {
    fn accepts(&self, item: &Value) -> bool {
        item.get(&self.field)
            .and_then(Value::as_str)
            .map(|v| self.allowed.contains(&v.trim().to_lowercase()))
            .unwrap_or(false)
    }
}

/// Filters raw items, maps the survivors to pairs and builds the set.
/// `to_pair` returning `None` drops the item.
pub fn resolve_options<F>(items: &[Value], filter: &dyn OptionFilter, to_pair: F) -> OptionSet
where
    F: Fn(&Value) -> Option<OptionPair>,
{
    let pairs = items
        .iter()
        .filter(|item| item.is_object() && filter.accepts(item))
        .filter_map(to_pair)
        .collect();
    OptionSet::from_pairs(pairs, OptionSource::Remote)
}
