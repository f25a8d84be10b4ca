//! Action dispatch, live components, and follow-up tokens.
//!
//! A successful phrase fire maps to zero or more action executions. Most
//! actions are thin render-and-emit or store mutations; the timer family
//! additionally registers a live component (keyed by a generated instance
//! id, with a deep-copied match snapshot) and arms follow-up **tokens**:
//!
//! - *Cancellation*: end-early phrases that destroy the component.
//! - *Secondary*: phrases that re-anchor a DOT/beneficial timer's start.
//! - *Worn-off*: a synthesized "spell has worn off" matcher.
//!
//! Tokens are tested against every subsequent line until they fire once or
//! their owning component is destroyed externally. A destroyed component
//! never leaves orphaned matchers behind.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use log::debug;
use regex::Regex;

use crate::MatchSnapshot;
use crate::config::{ActionDef, ActionKind, DurationSource, EngineConfig, TimerKind, TriggerId};
use crate::error::EngineError;
use crate::events::{EventSink, InstanceId, OutboundEvent, SecondaryEffect};

use super::phrase::{RenderContext, parse_duration, render};
use super::stores::{Stores, parse_key_path};
use super::trigger::PhraseFire;

#[derive(Debug, Clone, Copy)]
enum TokenEffect {
    Cancel,
    Secondary,
    WornOff,
}

#[derive(Debug)]
struct PendingToken {
    owner: InstanceId,
    patterns: Vec<Regex>,
    effect: TokenEffect,
}

#[derive(Debug)]
struct LiveComponent {
    trigger_id: TriggerId,
    snapshot: MatchSnapshot,
    /// Ending templates, rendered against the snapshot on expiry.
    ended_display_text: String,
    ended_speak_text: String,
}

/// Everything one fire carries into action execution.
#[derive(Debug)]
pub struct FireContext<'a> {
    pub trigger_id: &'a TriggerId,
    pub line: &'a str,
    pub fire: &'a PhraseFire,
    pub condition_results: &'a HashMap<String, String>,
}

/// Owns token and live-component state across lines.
#[derive(Debug, Default)]
pub struct Dispatcher {
    next_instance: InstanceId,
    tokens: Vec<PendingToken>,
    components: HashMap<InstanceId, LiveComponent>,
}

impl Dispatcher {
    /// Execute one action for a fire. Returns `true` when the action asks
    /// for the originating trigger/sequence to be reset (the timer
    /// family).
    pub fn run_action(
        &mut self,
        action: &ActionDef,
        fctx: &FireContext,
        config: &EngineConfig,
        stores: &mut Stores,
        sink: &mut dyn EventSink,
        now: NaiveDateTime,
    ) -> Result<bool, EngineError> {
        match &action.kind {
            ActionKind::DisplayText { text } => {
                if config.combat_text {
                    let rendered = render_fire(text, fctx, config, stores, now, None);
                    sink.emit(OutboundEvent::DisplayText { text: rendered });
                }
            }
            ActionKind::Speak { text, interrupt, speak_next } => {
                let rendered = render_fire(text, fctx, config, stores, now, None);
                emit_speech(rendered, *interrupt, *speak_next, config, sink);
            }
            ActionKind::PlayAudio { file_id } => {
                sink.emit(OutboundEvent::PlayAudio { file_id: file_id.clone() });
            }
            ActionKind::Clipboard { text } => {
                let rendered = render_fire(text, fctx, config, stores, now, None);
                sink.emit(OutboundEvent::WriteClipboard { text: rendered });
            }
            ActionKind::ScreenGlow { color, duration_ms } => {
                sink.emit(OutboundEvent::ScreenGlow {
                    color: color.clone(),
                    duration_ms: *duration_ms,
                });
            }
            ActionKind::DeathRecap => sink.emit(OutboundEvent::DeathRecap),
            ActionKind::StoreVariable {
                name,
                value,
                scalar,
                restrict_to_condition_values,
                ..
            } => {
                let rendered_name = render_fire(name, fctx, config, stores, now, None);
                if rendered_name.is_empty() {
                    return Err(EngineError::ActionFailed {
                        action_id: action.id,
                        message: "variable name rendered empty".to_string(),
                    });
                }
                let rendered_value = render_fire(value, fctx, config, stores, now, None);
                if *restrict_to_condition_values
                    && !fctx.condition_results.values().any(|v| *v == rendered_value)
                {
                    debug!(
                        "trigger {}: value {rendered_value:?} not among condition results; not stored",
                        fctx.trigger_id
                    );
                    return Ok(false);
                }
                if let Some(path) = parse_key_path(&rendered_name) {
                    stores.dictionary.set(&path, &rendered_value);
                } else if *scalar {
                    stores.variables.store_scalar(&rendered_name, &rendered_value);
                } else {
                    stores.variables.store_value(&rendered_name, &rendered_value);
                }
            }
            ActionKind::ClearVariable { name, value } => {
                let rendered_name = render_fire(name, fctx, config, stores, now, None);
                match value {
                    Some(value) => {
                        let rendered_value = render_fire(value, fctx, config, stores, now, None);
                        stores.variables.clear_value(&rendered_name, &rendered_value);
                    }
                    None => stores.variables.clear_name(&rendered_name),
                }
            }
            ActionKind::IncrementCounter { name, reset_delay_seconds, reset_phrases } => {
                stores.counters.increment(name, *reset_delay_seconds, reset_phrases, now);
            }
            ActionKind::Timer {
                kind,
                label,
                display_text,
                speak_text,
                ended_display_text,
                ended_speak_text,
                duration_seconds,
                duration_from,
                end_early_phrases,
                secondary_phrases,
            } => {
                let duration =
                    effective_duration(duration_from, *duration_seconds, fctx, config, stores, now);
                let rendered_label =
                    render_fire(label, fctx, config, stores, now, Some(duration));
                let rendered_text =
                    render_fire(display_text, fctx, config, stores, now, Some(duration));

                let instance_id = self.allocate_instance();
                self.components.insert(
                    instance_id,
                    LiveComponent {
                        trigger_id: fctx.trigger_id.clone(),
                        ended_display_text: ended_display_text.clone(),
                        ended_speak_text: ended_speak_text.clone(),
                        snapshot: MatchSnapshot {
                            character: config.character.name.clone(),
                            line: fctx.line.to_string(),
                            captures: fctx.fire.captures.clone(),
                            sequence_captures: fctx.fire.sequence_captures.clone(),
                            condition_results: fctx.condition_results.clone(),
                            delta_ms: fctx.fire.delta_ms,
                        },
                    },
                );

                let cancel =
                    compile_token_patterns(end_early_phrases, fctx, config, stores, now);
                if !cancel.is_empty() {
                    self.tokens.push(PendingToken {
                        owner: instance_id,
                        patterns: cancel,
                        effect: TokenEffect::Cancel,
                    });
                }
                if matches!(kind, TimerKind::Dot | TimerKind::Beneficial) {
                    let secondary =
                        compile_token_patterns(secondary_phrases, fctx, config, stores, now);
                    if !secondary.is_empty() {
                        self.tokens.push(PendingToken {
                            owner: instance_id,
                            patterns: secondary,
                            effect: TokenEffect::Secondary,
                        });
                    }
                    let worn_off = format!("Your {rendered_label} spell has worn off");
                    if let Ok(re) = Regex::new(&format!("(?i){}", regex::escape(&worn_off))) {
                        self.tokens.push(PendingToken {
                            owner: instance_id,
                            patterns: vec![re],
                            effect: TokenEffect::WornOff,
                        });
                    }
                }

                if !speak_text.is_empty() {
                    let rendered =
                        render_fire(speak_text, fctx, config, stores, now, Some(duration));
                    emit_speech(rendered, false, false, config, sink);
                }
                sink.emit(OutboundEvent::CreateComponent {
                    instance_id,
                    trigger_id: fctx.trigger_id.clone(),
                    action_id: action.id,
                    kind: *kind,
                    label: rendered_label,
                    text: rendered_text,
                    duration_ms: (duration * 1000.0).round() as i64,
                });
                return Ok(true);
            }
            ActionKind::ClearAll => {
                stores.clear_all();
                self.clear(sink);
            }
        }
        Ok(false)
    }

    /// Second evaluation pass: every pending token is tested against the
    /// line. A token fires once and is discarded.
    pub fn check_tokens(&mut self, line: &str, sink: &mut dyn EventSink) {
        let mut fired: Vec<(InstanceId, TokenEffect)> = Vec::new();
        self.tokens.retain(|token| {
            if token.patterns.iter().any(|re| re.is_match(line)) {
                fired.push((token.owner, token.effect));
                false
            } else {
                true
            }
        });
        for (owner, effect) in fired {
            match effect {
                TokenEffect::Cancel => {
                    if self.components.remove(&owner).is_some() {
                        self.tokens.retain(|t| t.owner != owner);
                        sink.emit(OutboundEvent::DestroyComponent { instance_id: owner });
                    }
                }
                // A cancel earlier in this pass may have destroyed the
                // owner; its remaining effects on the same line are moot.
                TokenEffect::Secondary if self.components.contains_key(&owner) => {
                    sink.emit(OutboundEvent::SecondaryAction {
                        instance_id: owner,
                        effect: SecondaryEffect::AdjustStart,
                    })
                }
                TokenEffect::WornOff if self.components.contains_key(&owner) => {
                    sink.emit(OutboundEvent::SecondaryAction {
                        instance_id: owner,
                        effect: SecondaryEffect::WornOff,
                    })
                }
                TokenEffect::Secondary | TokenEffect::WornOff => {}
            }
        }
    }

    /// The renderer told us a component is gone; drop its bookkeeping and
    /// any still-pending tokens. No event is echoed back.
    pub fn component_destroyed(&mut self, instance_id: InstanceId) {
        self.components.remove(&instance_id);
        self.tokens.retain(|t| t.owner != instance_id);
    }

    /// The component's timer ran out on the host side. The deferred ending
    /// texts are rendered against the snapshot taken at creation, then the
    /// component and its tokens are dropped.
    pub fn component_expired(
        &mut self,
        instance_id: InstanceId,
        config: &EngineConfig,
        stores: &Stores,
        sink: &mut dyn EventSink,
        now: NaiveDateTime,
    ) {
        let Some(component) = self.components.remove(&instance_id) else {
            return;
        };
        self.tokens.retain(|t| t.owner != instance_id);

        let snapshot = &component.snapshot;
        let mut rctx = RenderContext::new(&snapshot.character, now);
        rctx.variables = Some(&stores.variables);
        rctx.counters = Some(&stores.counters);
        rctx.condition_results = Some(&snapshot.condition_results);
        rctx.sequence_captures = Some(&snapshot.sequence_captures);
        rctx.captures = Some(&snapshot.captures);
        rctx.delta_ms = snapshot.delta_ms;

        if !component.ended_display_text.is_empty() && config.combat_text {
            sink.emit(OutboundEvent::DisplayText {
                text: render(&component.ended_display_text, &rctx),
            });
        }
        if !component.ended_speak_text.is_empty() {
            let rendered = render(&component.ended_speak_text, &rctx);
            emit_speech(rendered, false, false, config, sink);
        }
    }

    /// Match snapshot for a live component, for deferred sub-action
    /// rendering on behalf of the host.
    pub fn snapshot_of(&self, instance_id: InstanceId) -> Option<&MatchSnapshot> {
        self.components.get(&instance_id).map(|c| &c.snapshot)
    }

    /// Trigger ids with at least one live component (diagnostics).
    pub fn live_trigger_ids(&self) -> Vec<&TriggerId> {
        self.components.values().map(|c| &c.trigger_id).collect()
    }

    /// Destroy every live component and drop all tokens.
    pub fn clear(&mut self, sink: &mut dyn EventSink) {
        for instance_id in self.components.keys().copied().collect::<Vec<_>>() {
            sink.emit(OutboundEvent::DestroyComponent { instance_id });
        }
        self.components.clear();
        self.tokens.clear();
    }

    fn allocate_instance(&mut self) -> InstanceId {
        self.next_instance += 1;
        self.next_instance
    }
}

/// Render a template against the current fire's full context.
fn render_fire(
    template: &str,
    fctx: &FireContext,
    config: &EngineConfig,
    stores: &Stores,
    now: NaiveDateTime,
    timer_duration: Option<f64>,
) -> String {
    let mut rctx = RenderContext::new(&config.character.name, now);
    rctx.variables = Some(&stores.variables);
    rctx.counters = Some(&stores.counters);
    rctx.condition_results = Some(fctx.condition_results);
    rctx.sequence_captures = Some(&fctx.fire.sequence_captures);
    rctx.captures = Some(&fctx.fire.captures);
    rctx.delta_ms = fctx.fire.delta_ms;
    rctx.timer_duration = timer_duration;
    render(template, &rctx)
}

/// Token phrases are rendered through the match context first (so
/// `${target}` binds to this fire), then compiled as case-insensitive
/// patterns. A phrase that fails as a pattern falls back to a literal
/// matcher.
fn compile_token_patterns(
    phrases: &[String],
    fctx: &FireContext,
    config: &EngineConfig,
    stores: &Stores,
    now: NaiveDateTime,
) -> Vec<Regex> {
    phrases
        .iter()
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            let rendered = render_fire(p, fctx, config, stores, now, None);
            match Regex::new(&format!("(?i){rendered}")) {
                Ok(re) => Some(re),
                Err(err) => {
                    debug!("token phrase {rendered:?} is not a pattern ({err}); matching literally");
                    Regex::new(&format!("(?i){}", regex::escape(&rendered))).ok()
                }
            }
        })
        .collect()
}

fn emit_speech(
    text: String,
    interrupt: bool,
    speak_next: bool,
    config: &EngineConfig,
    sink: &mut dyn EventSink,
) {
    sink.emit(OutboundEvent::Speak {
        text: apply_phonetics(&text, config),
        interrupt,
        speak_next,
        voice: config.voice.voice.clone(),
        volume: config.voice.volume,
    });
}

/// Whole-word phonetic replacement for speech text.
fn apply_phonetics(text: &str, config: &EngineConfig) -> String {
    if config.phonetics.is_empty() {
        return text.to_string();
    }
    text.split(' ')
        .map(|word| config.phonetics.get(word).map(String::as_str).unwrap_or(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve a timer's effective duration, falling back to the declared one.
fn effective_duration(
    source: &DurationSource,
    declared: f64,
    fctx: &FireContext,
    config: &EngineConfig,
    stores: &Stores,
    now: NaiveDateTime,
) -> f64 {
    let resolved = match source {
        DurationSource::Declared => None,
        DurationSource::MatchGroup { group } => fctx
            .fire
            .captures
            .get(group)
            .or_else(|| fctx.fire.sequence_captures.get(group).map(String::as_str))
            .and_then(parse_duration),
        DurationSource::Variable { name } => {
            stores.variables.get(name).first().and_then(|v| parse_duration(v))
        }
        DurationSource::Dictionary { path } => {
            let rendered = render_fire(path, fctx, config, stores, now, None);
            parse_key_path(&rendered)
                .and_then(|p| stores.dictionary.get(&p).map(str::to_string))
                .and_then(|v| parse_duration(&v))
        }
    };
    resolved.unwrap_or(declared)
}
