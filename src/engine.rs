//! Trigger parsing and action-dispatch engine.
//!
//! This module is the internal core behind [`crate::Engine`]. It is split
//! into focused submodules under `src/engine/` while keeping paths stable
//! (for example `crate::engine::CompiledTrigger`).
//!
//! ## How the parts work together
//!
//! Processing one log line is a pipeline:
//!
//! ```text
//! config tick  ──┐
//!               │  compile_trigger            (phrase.rs, trigger.rs)
//!               └───────────────┬──────────────
//!                               │
//! line ── counter reset scan ───┤              (stores.rs)
//!                               │
//!         token pass ───────────┤              (actions.rs)
//!           cancellation / secondary / worn-off
//!                               │
//!                               v
//!              per-trigger evaluation          (trigger.rs)
//!                - condition + cooldown gate
//!                - capture method state machine
//!                               │
//!                               v
//!              action dispatch                 (actions.rs)
//!                - store mutation              (stores.rs)
//!                - component + token registration
//!                - outbound events
//!                               │
//!                               v
//!              parse history record            (history.rs)
//! ```
//!
//! ## Responsibilities by module
//!
//! - `phrase.rs`: template rendering and pattern compilation, including the
//!   digit-wise numeric-comparison construction.
//! - `trigger.rs`: per-trigger capture state (AnyMatch / Sequential),
//!   condition evaluation, cooldown gating, reset semantics.
//! - `stores.rs`: variable / counter / dictionary stores.
//! - `actions.rs`: maps a fire to action executions; owns live components
//!   and the cancellation / secondary / worn-off token set.
//! - `history.rs`: observational parse history records, batch-flushed.
//!
//! All state here is owned by a single logical thread. Line N is fully
//! processed (tokens, triggers, actions) before line N+1 is looked at.

#[path = "engine/actions.rs"]
mod actions;
#[path = "engine/history.rs"]
mod history;
#[path = "engine/phrase.rs"]
mod phrase;
#[path = "engine/stores.rs"]
mod stores;
#[path = "engine/trigger.rs"]
mod trigger;

pub(crate) use actions::{Dispatcher, FireContext};
pub(crate) use history::ParseHistory;
pub use history::{ParseHistoryEntry, ParseStatus};
pub(crate) use phrase::RenderContext;
pub(crate) use stores::Stores;
pub(crate) use trigger::CompiledTrigger;
