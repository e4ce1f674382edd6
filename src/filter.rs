//! Nostr subscription filters: parsing and event matching.

use serde_json::Value;

use crate::event::Event;

/// Declarative query over event fields.
///
/// Every present constraint must hold for a filter to match (AND); an absent
/// constraint is a wildcard. A subscription carries a list of filters
/// combined with OR.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Exact event identifiers.
    pub ids: Option<Vec<String>>,
    /// Author public keys.
    pub authors: Option<Vec<String>>,
    /// Kind numbers.
    pub kinds: Option<Vec<u32>>,
    /// Tag constraints: `#<name>` keys, each with accepted values.
    pub tags: Vec<(String, Vec<String>)>,
    /// Minimum `created_at` (inclusive).
    pub since: Option<u64>,
    /// Maximum `created_at` (inclusive).
    pub until: Option<u64>,
    /// Maximum number of backlog events to return.
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a `Filter` from a Nostr filter JSON object.
    ///
    /// Returns `None` when `val` is not an object. Unknown keys are ignored
    /// so clients speaking newer filter extensions still get served.
    pub fn from_value(val: &Value) -> Option<Self> {
        let obj = val.as_object()?;
        let mut filter = Filter::default();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_vec(v)),
                "authors" => filter.authors = Some(string_vec(v)),
                "kinds" => {
                    filter.kinds = Some(
                        v.as_array()
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(|v| v.as_u64().map(|u| u as u32))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    )
                }
                "since" => filter.since = v.as_u64(),
                "until" => filter.until = v.as_u64(),
                "limit" => filter.limit = v.as_u64().map(|v| v as usize),
                tag if tag.starts_with('#') && tag.len() > 1 => {
                    filter.tags.push((tag[1..].to_string(), string_vec(v)));
                }
                _ => {}
            }
        }
        Some(filter)
    }

    /// Whether this filter accepts `ev`.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let hit = ev
                .tag_values(name)
                .any(|v| values.iter().any(|w| w == v));
            if !hit {
                return false;
            }
        }
        true
    }
}

fn string_vec(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}
