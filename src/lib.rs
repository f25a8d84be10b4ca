extern crate self as watchline;

use std::collections::HashMap;

#[macro_use]
mod macros;
mod api;
pub mod clock;
pub mod config;
mod engine;
pub mod error;
pub mod events;
pub mod tail;

pub use api::Engine;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{ParseHistoryEntry, ParseStatus};
pub use error::EngineError;
pub use events::{CollectingSink, EventSink, InstanceId, OutboundEvent, SecondaryEffect};

// --- Shared match vocabulary -------------------------------------------------

/// Capture groups produced by one successful phrase test.
///
/// Literal (non-regex) phrases produce an empty set. Positional group 0 is
/// the whole match, mirroring the regex crate's numbering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineCaptures {
    pub named: HashMap<String, String>,
    pub positional: Vec<String>,
}

impl LineCaptures {
    /// Named group lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    /// Fold another capture set into this one. Later captures win on name
    /// collisions (a sequential step overriding an earlier step's group).
    pub fn merge(&mut self, other: &LineCaptures) {
        for (k, v) in &other.named {
            self.named.insert(k.clone(), v.clone());
        }
        if other.positional.len() > self.positional.len() {
            self.positional = other.positional.clone();
        }
    }
}

/// Owned copy of everything needed to re-render a component's templates
/// after the match is long gone (deferred sub-actions, ending text).
///
/// Components outlive the line that created them, so this is a deep copy,
/// not a borrow into engine state.
#[derive(Debug, Clone, Default)]
pub struct MatchSnapshot {
    pub character: String,
    pub line: String,
    pub captures: LineCaptures,
    pub sequence_captures: HashMap<String, String>,
    pub condition_results: HashMap<String, String>,
    pub delta_ms: Option<i64>,
}
