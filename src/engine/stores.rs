//! Variable / counter / dictionary stores.
//!
//! Pure data with narrow mutation APIs. Conditions read these, actions
//! write them, and the render pipeline substitutes out of them. None of
//! this is shared across threads; the engine owns its stores exclusively.
//!
//! Only the variable store is serialized for the host's per-character
//! cache. Counters hold compiled reset patterns and are rebuilt from live
//! traffic; the dictionary persists through the host like variables do.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

// --- Stored variables ----------------------------------------------------------

/// Name -> ordered set of distinct string values.
///
/// A normal write appends if the value is not already present; a scalar
/// write replaces the whole set with a single value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableStore {
    values: BTreeMap<String, Vec<String>>,
}

impl VariableStore {
    pub fn store_value(&mut self, name: &str, value: &str) {
        let entry = self.values.entry(name.to_string()).or_default();
        if !entry.iter().any(|v| v == value) {
            entry.push(value.to_string());
        }
    }

    pub fn store_scalar(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), vec![value.to_string()]);
    }

    /// Remove one value from a set; drops the set when it empties.
    pub fn clear_value(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.values.get_mut(name) {
            entry.retain(|v| v != value);
            if entry.is_empty() {
                self.values.remove(name);
            }
        }
    }

    pub fn clear_name(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Values stored under `name`, empty when unset.
    pub fn get(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_set(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }
}

// --- Counters -------------------------------------------------------------------

#[derive(Debug)]
struct Counter {
    value: i64,
    last_update: NaiveDateTime,
    reset_delay_seconds: i64,
    reset_phrases: Vec<Regex>,
    /// Source text the compiled phrases came from, so a configuration
    /// change reaches counters that already exist.
    reset_sources: Vec<String>,
}

impl Counter {
    fn expired(&self, now: NaiveDateTime) -> bool {
        self.reset_delay_seconds > 0
            && (now - self.last_update).num_seconds() >= self.reset_delay_seconds
    }
}

/// Named counters with time-based decay and phrase-based resets.
#[derive(Debug, Default)]
pub struct CounterStore {
    counters: HashMap<String, Counter>,
}

impl CounterStore {
    /// Bump a counter, creating it on first use. Decay is applied before
    /// the increment so a stale counter restarts at 1.
    pub fn increment(
        &mut self,
        name: &str,
        reset_delay_seconds: i64,
        reset_phrases: &[String],
        now: NaiveDateTime,
    ) -> i64 {
        let counter = self.counters.entry(name.to_string()).or_insert_with(|| Counter {
            value: 0,
            last_update: now,
            reset_delay_seconds,
            reset_phrases: compile_reset_phrases(name, reset_phrases),
            reset_sources: reset_phrases.to_vec(),
        });
        if counter.expired(now) {
            counter.value = 0;
        }
        counter.value += 1;
        counter.last_update = now;
        counter.reset_delay_seconds = reset_delay_seconds;
        if counter.reset_sources != reset_phrases {
            counter.reset_phrases = compile_reset_phrases(name, reset_phrases);
            counter.reset_sources = reset_phrases.to_vec();
        }
        counter.value
    }

    /// Decayed view of a counter without mutating it. Used by rendering.
    pub fn peek(&self, name: &str, now: NaiveDateTime) -> i64 {
        match self.counters.get(name) {
            Some(c) if c.expired(now) => 0,
            Some(c) => c.value,
            None => 0,
        }
    }

    /// Zero every counter whose reset delay has elapsed. Called from the
    /// engine's tick between lines.
    pub fn decay(&mut self, now: NaiveDateTime) {
        for counter in self.counters.values_mut() {
            if counter.value > 0 && counter.expired(now) {
                counter.value = 0;
            }
        }
    }

    /// Zero any positive counter whose reset phrases match this line.
    pub fn apply_line(&mut self, line: &str, now: NaiveDateTime) {
        for counter in self.counters.values_mut() {
            if counter.value > 0 && counter.reset_phrases.iter().any(|re| re.is_match(line)) {
                counter.value = 0;
                counter.last_update = now;
            }
        }
    }

    pub fn clear(&mut self) {
        self.counters.clear();
    }
}

fn compile_reset_phrases(counter: &str, phrases: &[String]) -> Vec<Regex> {
    phrases
        .iter()
        .filter(|p| !p.is_empty())
        .filter_map(|p| match Regex::new(&format!("(?i){p}")) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!("counter {counter}: skipping bad reset phrase {p:?}: {err}");
                None
            }
        })
        .collect()
}

// --- Persistent dictionary ---------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DictNode {
    Leaf(String),
    Branch(BTreeMap<String, DictNode>),
}

/// Nested string-keyed tree addressed by a bracketed key path
/// (`Name[key1][key2]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dictionary {
    root: BTreeMap<String, DictNode>,
}

impl Dictionary {
    /// Write a leaf, creating intermediate branches. An existing leaf in
    /// the middle of the path is replaced by a branch.
    pub fn set(&mut self, path: &[String], value: &str) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut node = &mut self.root;
        for key in parents {
            let entry = node
                .entry(key.clone())
                .or_insert_with(|| DictNode::Branch(BTreeMap::new()));
            if !matches!(entry, DictNode::Branch(_)) {
                *entry = DictNode::Branch(BTreeMap::new());
            }
            match entry {
                DictNode::Branch(children) => node = children,
                DictNode::Leaf(_) => unreachable!("leaf replaced above"),
            }
        }
        node.insert(last.clone(), DictNode::Leaf(value.to_string()));
    }

    pub fn get(&self, path: &[String]) -> Option<&str> {
        let (last, parents) = path.split_last()?;
        let mut node = &self.root;
        for key in parents {
            match node.get(key)? {
                DictNode::Branch(children) => node = children,
                DictNode::Leaf(_) => return None,
            }
        }
        match node.get(last)? {
            DictNode::Leaf(value) => Some(value),
            DictNode::Branch(_) => None,
        }
    }

    pub fn clear(&mut self) {
        self.root.clear();
    }
}

/// Split a rendered `Name[key1][key2]` reference into path segments.
/// Returns `None` when the text has no bracketed keys (it is a plain
/// variable name, not a dictionary path).
pub fn parse_key_path(rendered: &str) -> Option<Vec<String>> {
    let open = rendered.find('[')?;
    let name = rendered[..open].trim();
    if name.is_empty() {
        return None;
    }
    let mut path = vec![name.to_string()];
    let mut rest = &rendered[open..];
    while let Some(start) = rest.find('[') {
        let end = rest[start..].find(']')? + start;
        path.push(rest[start + 1..end].to_string());
        rest = &rest[end + 1..];
    }
    Some(path)
}

// --- Bundle --------------------------------------------------------------------

/// All mutable engine state the matchers read and the actions write.
#[derive(Debug, Default)]
pub struct Stores {
    pub variables: VariableStore,
    pub counters: CounterStore,
    pub dictionary: Dictionary,
}

impl Stores {
    /// Engine-level ClearAll: every store is wiped.
    pub fn clear_all(&mut self) {
        self.variables.clear();
        self.counters.clear();
        self.dictionary.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn store_value_keeps_distinct_ordered_set() {
        let mut vars = VariableStore::default();
        vars.store_value("Zone", "Plane of Sky");
        vars.store_value("Zone", "Plane of Fire");
        vars.store_value("Zone", "Plane of Sky");
        assert_eq!(vars.get("Zone"), ["Plane of Sky", "Plane of Fire"]);
    }

    #[test]
    fn scalar_write_replaces_the_set() {
        let mut vars = VariableStore::default();
        vars.store_value("Target", "a");
        vars.store_value("Target", "b");
        vars.store_scalar("Target", "c");
        assert_eq!(vars.get("Target"), ["c"]);
    }

    #[test]
    fn clearing_last_value_unsets_the_variable() {
        let mut vars = VariableStore::default();
        vars.store_value("Zone", "x");
        vars.clear_value("Zone", "x");
        assert!(!vars.is_set("Zone"));
    }

    #[test]
    fn counter_decays_after_reset_delay() {
        let clock = ManualClock::epoch();
        let mut counters = CounterStore::default();
        assert_eq!(counters.increment("Hits", 30, &[], clock.now()), 1);

        clock.advance(TimeDelta::seconds(29));
        assert_eq!(counters.peek("Hits", clock.now()), 1);

        clock.advance(TimeDelta::seconds(2));
        assert_eq!(counters.peek("Hits", clock.now()), 0);
        counters.decay(clock.now());
        assert_eq!(counters.increment("Hits", 30, &[], clock.now()), 1);
    }

    #[test]
    fn counter_zeroes_on_reset_phrase() {
        let clock = ManualClock::epoch();
        let mut counters = CounterStore::default();
        counters.increment("Hits", 300, &["You have been knocked unconscious".to_string()], clock.now());
        counters.apply_line("Some unrelated line", clock.now());
        assert_eq!(counters.peek("Hits", clock.now()), 1);
        counters.apply_line("You have been knocked unconscious!", clock.now());
        assert_eq!(counters.peek("Hits", clock.now()), 0);
    }

    #[test]
    fn changed_reset_phrases_reach_an_existing_counter() {
        let clock = ManualClock::epoch();
        let mut counters = CounterStore::default();
        counters.increment("Hits", 300, &["You have died".to_string()], clock.now());

        // Reconfigured action increments the same counter with new phrases.
        counters.increment("Hits", 300, &["You have been slain".to_string()], clock.now());
        counters.apply_line("You have died.", clock.now());
        assert_eq!(counters.peek("Hits", clock.now()), 2);
        counters.apply_line("You have been slain by a gnoll!", clock.now());
        assert_eq!(counters.peek("Hits", clock.now()), 0);
    }

    #[test]
    fn dictionary_round_trip_and_overwrite() {
        let mut dict = Dictionary::default();
        let path = vec!["Raid".to_string(), "loot".to_string(), "tonight".to_string()];
        dict.set(&path, "belt");
        assert_eq!(dict.get(&path), Some("belt"));
        dict.set(&path, "cloak");
        assert_eq!(dict.get(&path), Some("cloak"));
        assert_eq!(dict.get(&["Raid".to_string()]), None);
    }

    #[test]
    fn key_path_parsing() {
        assert_eq!(
            parse_key_path("Raid[loot][tonight]"),
            Some(vec!["Raid".to_string(), "loot".to_string(), "tonight".to_string()])
        );
        assert_eq!(parse_key_path("JustAName"), None);
        assert_eq!(parse_key_path("[orphan]"), None);
    }
}
