//! Outbound event contract.
//!
//! The engine owns no rendering, audio, speech, or clipboard machinery.
//! Everything it wants the outside world to do is expressed as an
//! [`OutboundEvent`] pushed through an [`EventSink`]. The events are
//! serde-serializable so a host can ship them over any channel it likes.

use serde::Serialize;

use crate::config::{ActionId, TimerKind, TriggerId};
use crate::engine::ParseHistoryEntry;

/// Identifier for a live component instance (timer, countdown, ...).
pub type InstanceId = u64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Render a timed/interactive element.
    CreateComponent {
        instance_id: InstanceId,
        trigger_id: TriggerId,
        action_id: ActionId,
        kind: TimerKind,
        label: String,
        text: String,
        duration_ms: i64,
    },
    /// Remove a live element (end-early token fired, or ClearAll).
    DestroyComponent { instance_id: InstanceId },
    /// Adjust an existing component's timing state.
    SecondaryAction { instance_id: InstanceId, effect: SecondaryEffect },
    /// Overlay combat text.
    DisplayText { text: String },
    Speak { text: String, interrupt: bool, speak_next: bool, voice: String, volume: f32 },
    WriteClipboard { text: String },
    PlayAudio { file_id: String },
    ScreenGlow { color: String, duration_ms: u64 },
    DeathRecap,
    /// Batched parse history records.
    Diagnostics { entries: Vec<ParseHistoryEntry> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryEffect {
    /// Re-anchor the component's start time to now (a DOT re-applied).
    AdjustStart,
    /// The effect the component tracks has worn off.
    WornOff,
}

/// Receiver for engine output. Implementations must not call back into the
/// engine; events are delivered while a line is being processed.
pub trait EventSink {
    fn emit(&mut self, event: OutboundEvent);
}

/// Sink that remembers everything it was given. Used by tests and by hosts
/// that drain events after each poll.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<OutboundEvent>,
}

impl EventSink for CollectingSink {
    fn emit(&mut self, event: OutboundEvent) {
        self.events.push(event);
    }
}
