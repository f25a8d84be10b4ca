//! Parse history diagnostics.
//!
//! Every evaluation attempt can be recorded as a [`ParseHistoryEntry`]
//! (success, failure, or exception). Entries are purely observational:
//! they never affect control flow. They accumulate in a capped buffer and
//! are flushed in batches through the event sink.
//!
//! Failures are only recorded when the host enables diagnostics; a busy
//! log multiplied by a large trigger set would otherwise drown the buffer
//! in negative results. Successes and exceptions are always kept.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::config::{ActionId, TriggerId};

/// Hard cap on buffered entries; oldest are dropped past this.
const BUFFER_CAP: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Success,
    Failure,
    Exception,
}

/// Diagnostic record of one evaluation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ParseHistoryEntry {
    pub timestamp: NaiveDateTime,
    pub status: ParseStatus,
    pub trigger_id: TriggerId,
    pub action_id: Option<ActionId>,
    /// Phrase/template text before rendering.
    pub phrase: String,
    /// Rendered text, when rendering happened.
    pub rendered: Option<String>,
    /// Which condition or gate failed, when one did.
    pub condition: Option<String>,
    /// The raw line under evaluation.
    pub line: String,
    pub error: Option<String>,
}

/// Capped buffer of parse history entries awaiting a batch flush.
#[derive(Debug, Default)]
pub struct ParseHistory {
    entries: Vec<ParseHistoryEntry>,
}

impl ParseHistory {
    pub fn push(&mut self, entry: ParseHistoryEntry) {
        if self.entries.len() >= BUFFER_CAP {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    /// Take everything buffered so far.
    pub fn drain(&mut self) -> Vec<ParseHistoryEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn entry(status: ParseStatus) -> ParseHistoryEntry {
        ParseHistoryEntry {
            timestamp: ManualClock::epoch().now(),
            status,
            trigger_id: "t1".to_string(),
            action_id: None,
            phrase: "a phrase".to_string(),
            rendered: None,
            condition: None,
            line: "a line".to_string(),
            error: None,
        }
    }

    #[test]
    fn drain_empties_the_buffer() {
        let mut history = ParseHistory::default();
        history.push(entry(ParseStatus::Success));
        history.push(entry(ParseStatus::Exception));
        assert_eq!(history.drain().len(), 2);
        assert!(history.is_empty());
    }

    #[test]
    fn buffer_is_capped() {
        let mut history = ParseHistory::default();
        for _ in 0..(BUFFER_CAP + 10) {
            history.push(entry(ParseStatus::Failure));
        }
        assert_eq!(history.drain().len(), BUFFER_CAP);
    }
}
