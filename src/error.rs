//! Engine error types.
//!
//! Errors fall into two groups:
//!
//! - **Compile-time**: a phrase template cannot be turned into a matcher
//!   (bad regex syntax, invalid numeric-comparison operator). These carry
//!   the offending template text so the user can find the broken trigger.
//! - **Runtime**: I/O failures from the tailed file or a malformed value
//!   encountered while dispatching an action.
//!
//! A single trigger's error never halts line processing: the engine
//! records it as an exception history entry and moves on to the next
//! trigger.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A phrase template failed to compile into a pattern.
    #[error("failed to compile phrase \"{phrase}\": {source}")]
    PhraseCompile {
        phrase: String,
        #[source]
        source: regex::Error,
    },

    /// A numeric-comparison shortcode used an operator outside
    /// `>`, `>=`, `<`, `<=`, `=`, `!=`.
    #[error("invalid numeric comparison operator \"{op}\" in phrase \"{phrase}\"")]
    InvalidComparison { op: String, phrase: String },

    /// An action referenced data that could not be produced at dispatch
    /// time (for example an unparseable duration).
    #[error("action {action_id} failed: {message}")]
    ActionFailed { action_id: u64, message: String },

    #[error("log file error: {0}")]
    Io(#[from] std::io::Error),
}
