//! Public engine facade.
//!
//! One [`Engine`] instance owns the whole runtime: compiled triggers,
//! stores, live components, tokens, and the parse history buffer. The host
//! drives it with three calls:
//!
//! - [`Engine::configure`] replaces the configuration and recompiles every
//!   trigger from scratch.
//! - [`Engine::process_line`] evaluates one log line. Output goes through
//!   the caller's [`EventSink`].
//! - [`Engine::tick`] does time-based housekeeping (counter decay, history
//!   flush) between lines.
//!
//! All calls are expected from a single logical thread; line N is fully
//! processed before line N+1. Errors inside one trigger are recorded as
//! exception entries and never abort the line for the others.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};

use crate::MatchSnapshot;
use crate::clock::{Clock, SystemClock};
use crate::config::{ActionDef, ActionKind, EngineConfig, TriggerId};
use crate::engine::{
    CompiledTrigger, Dispatcher, FireContext, ParseHistory, ParseHistoryEntry, ParseStatus,
    RenderContext, Stores,
};
use crate::events::{CollectingSink, EventSink, InstanceId, OutboundEvent};

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    triggers: Vec<CompiledTrigger>,
    stores: Stores,
    dispatcher: Dispatcher,
    history: ParseHistory,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::with_clock(Arc::new(SystemClock))
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    /// Build against an explicit clock. Tests drive a
    /// [`crate::ManualClock`] through here.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Engine {
            config: EngineConfig::default(),
            clock,
            triggers: Vec::new(),
            stores: Stores::default(),
            dispatcher: Dispatcher::default(),
            history: ParseHistory::default(),
        }
    }

    /// Replace the configuration and recompile every trigger. A trigger
    /// that fails to compile is recorded as an exception entry and skipped;
    /// the rest of the set stays live. Stores and live components survive a
    /// reconfigure.
    pub fn configure(&mut self, config: EngineConfig) {
        let now = self.clock.now();
        self.triggers.clear();
        for def in &config.triggers {
            match CompiledTrigger::compile(def, &config) {
                Ok(trigger) => self.triggers.push(trigger),
                Err(err) => {
                    warn!("trigger {} failed to compile: {err}", def.id);
                    self.history.push(ParseHistoryEntry {
                        timestamp: now,
                        status: ParseStatus::Exception,
                        trigger_id: def.id.clone(),
                        action_id: None,
                        phrase: String::new(),
                        rendered: None,
                        condition: None,
                        line: String::new(),
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        info!(
            "configured {} of {} triggers for {:?}",
            self.triggers.len(),
            config.triggers.len(),
            config.character.name
        );
        self.config = config;
    }

    /// Evaluate one log line: counter reset scan, token pass, then every
    /// enabled trigger.
    pub fn process_line(&mut self, line: &str, sink: &mut dyn EventSink) {
        let now = self.clock.now();
        self.stores.counters.apply_line(line, now);
        self.dispatcher.check_tokens(line, sink);

        for i in 0..self.triggers.len() {
            if !self.config.trigger_enabled(&self.triggers[i].def) {
                continue;
            }
            let outcome = self.triggers[i].check_conditions(&self.stores.variables, now);
            if !outcome.pass {
                if self.config.diagnostics {
                    self.history.push(ParseHistoryEntry {
                        timestamp: now,
                        status: ParseStatus::Failure,
                        trigger_id: self.triggers[i].def.id.clone(),
                        action_id: None,
                        phrase: String::new(),
                        rendered: None,
                        condition: outcome.failed.clone(),
                        line: line.to_string(),
                        error: None,
                    });
                }
                continue;
            }

            let fires = {
                let mut ctx = RenderContext::new(&self.config.character.name, now);
                ctx.variables = Some(&self.stores.variables);
                ctx.counters = Some(&self.stores.counters);
                ctx.condition_results = Some(&outcome.results);
                self.triggers[i].process_line(line, &ctx, now)
            };
            if fires.is_empty() {
                continue;
            }

            // The cooldown arms on fire, before any action runs, so actions
            // of this very fire cannot re-arm the trigger.
            self.triggers[i].start_cooldown(now);

            let trigger_id = self.triggers[i].def.id.clone();
            let actions = self.triggers[i].def.actions.clone();
            let mut reset = false;
            for fire in &fires {
                let phrase_text = self.triggers[i]
                    .def
                    .phrases
                    .iter()
                    .find(|p| p.id == fire.phrase_id)
                    .map(|p| p.text.clone())
                    .unwrap_or_default();
                self.history.push(ParseHistoryEntry {
                    timestamp: now,
                    status: ParseStatus::Success,
                    trigger_id: trigger_id.clone(),
                    action_id: None,
                    phrase: phrase_text,
                    rendered: None,
                    condition: None,
                    line: line.to_string(),
                    error: None,
                });

                for action in &actions {
                    if let Some(bound) = action.phrase_id {
                        if bound != fire.phrase_id {
                            continue;
                        }
                    }
                    if action.dev_only && !self.config.dev_mode {
                        continue;
                    }
                    let fctx = FireContext {
                        trigger_id: &trigger_id,
                        line,
                        fire,
                        condition_results: &outcome.results,
                    };
                    match self.dispatcher.run_action(
                        action,
                        &fctx,
                        &self.config,
                        &mut self.stores,
                        sink,
                        now,
                    ) {
                        Ok(wants_reset) => reset |= wants_reset,
                        Err(err) => {
                            error!("trigger {trigger_id} action {}: {err}", action.id);
                            self.history.push(ParseHistoryEntry {
                                timestamp: now,
                                status: ParseStatus::Exception,
                                trigger_id: trigger_id.clone(),
                                action_id: Some(action.id),
                                phrase: String::new(),
                                rendered: None,
                                condition: None,
                                line: line.to_string(),
                                error: Some(err.to_string()),
                            });
                        }
                    }
                }
            }
            if reset {
                self.triggers[i].force_reset();
            }
        }
    }

    /// Time-based housekeeping between lines: decay expired counters and
    /// flush buffered parse history as one diagnostics batch.
    pub fn tick(&mut self, sink: &mut dyn EventSink) {
        self.stores.counters.decay(self.clock.now());
        self.flush_history(sink);
    }

    /// Final flush. The engine stays usable afterwards; shutdown is a
    /// statement of intent, not a poisoned state.
    pub fn shutdown(&mut self, sink: &mut dyn EventSink) {
        self.flush_history(sink);
    }

    /// Wipe every store, discard all sequences, and destroy every live
    /// component.
    pub fn clear_all(&mut self, sink: &mut dyn EventSink) {
        self.stores.clear_all();
        self.dispatcher.clear(sink);
        for trigger in &mut self.triggers {
            trigger.force_reset();
        }
    }

    /// The host's renderer removed a component before its time was up
    /// (user dismissal). Nothing deferred runs.
    pub fn component_destroyed(&mut self, instance_id: InstanceId) {
        self.dispatcher.component_destroyed(instance_id);
    }

    /// The component's timer ran out on the host side: run its deferred
    /// ending texts against the snapshot taken at creation, then drop it.
    pub fn component_expired(&mut self, instance_id: InstanceId, sink: &mut dyn EventSink) {
        self.dispatcher.component_expired(
            instance_id,
            &self.config,
            &self.stores,
            sink,
            self.clock.now(),
        );
    }

    /// Match context snapshot of a live component, for host-driven
    /// deferred rendering (ending text and the like).
    pub fn component_snapshot(&self, instance_id: InstanceId) -> Option<MatchSnapshot> {
        self.dispatcher.snapshot_of(instance_id).cloned()
    }

    /// Serialized variable store, for host-side persistence across runs.
    pub fn variables_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.stores.variables)
    }

    /// Restore a previously serialized variable store.
    pub fn restore_variables(&mut self, json: &str) -> serde_json::Result<()> {
        self.stores.variables = serde_json::from_str(json)?;
        Ok(())
    }

    /// Whether any enabled trigger still has an unresolved loopback
    /// variable, i.e. a StoreVariable action marked for backward
    /// resolution whose target is empty. Drives the startup backfill scan.
    pub fn loopback_pending(&self) -> bool {
        self.triggers.iter().any(|t| {
            self.config.trigger_enabled(&t.def)
                && t.def.actions.iter().any(|a| self.loopback_unresolved(a))
        })
    }

    /// Evaluate one line from the backward startup scan. Only unresolved
    /// loopback StoreVariable actions execute; nothing else fires and no
    /// events are emitted. Returns `true` once every loopback variable is
    /// resolved, so the caller can stop scanning.
    pub fn backfill_line(&mut self, line: &str) -> bool {
        let now = self.clock.now();
        for i in 0..self.triggers.len() {
            if !self.config.trigger_enabled(&self.triggers[i].def) {
                continue;
            }
            let pending: Vec<ActionDef> = self.triggers[i]
                .def
                .actions
                .iter()
                .filter(|a| self.loopback_unresolved(a))
                .cloned()
                .collect();
            if pending.is_empty() {
                continue;
            }
            let fire = {
                let mut ctx = RenderContext::new(&self.config.character.name, now);
                ctx.variables = Some(&self.stores.variables);
                self.triggers[i].probe(line, &ctx)
            };
            let Some(fire) = fire else {
                continue;
            };
            let trigger_id = self.triggers[i].def.id.clone();
            let results = HashMap::new();
            let mut discard = CollectingSink::default();
            for action in &pending {
                let fctx = FireContext {
                    trigger_id: &trigger_id,
                    line,
                    fire: &fire,
                    condition_results: &results,
                };
                if let Err(err) = self.dispatcher.run_action(
                    action,
                    &fctx,
                    &self.config,
                    &mut self.stores,
                    &mut discard,
                    now,
                ) {
                    error!("backfill, trigger {trigger_id}: {err}");
                }
            }
        }
        !self.loopback_pending()
    }

    /// Loopback targets with templated names cannot be checked for
    /// emptiness up front; they never participate in backfill.
    fn loopback_unresolved(&self, action: &ActionDef) -> bool {
        match &action.kind {
            ActionKind::StoreVariable { loopback: true, name, .. } => {
                !name.contains('{') && !self.stores.variables.is_set(name)
            }
            _ => false,
        }
    }

    /// Trigger ids with at least one live component.
    pub fn live_triggers(&self) -> Vec<TriggerId> {
        self.dispatcher.live_trigger_ids().into_iter().cloned().collect()
    }

    fn flush_history(&mut self, sink: &mut dyn EventSink) {
        if !self.history.is_empty() {
            sink.emit(OutboundEvent::Diagnostics { entries: self.history.drain() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{
        CaptureMethod, CharacterInfo, ConditionDef, ConditionOp, DurationSource, PhraseDef,
        TimerKind, TriggerDef,
    };
    use chrono::TimeDelta;

    fn phrase(id: u64, text: &str, use_regex: bool) -> PhraseDef {
        PhraseDef { id, text: text.to_string(), use_regex }
    }

    fn action(id: u64, kind: ActionKind) -> ActionDef {
        ActionDef { id, phrase_id: None, dev_only: false, kind }
    }

    fn engine(config: EngineConfig) -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::epoch());
        let mut engine = Engine::with_clock(clock.clone());
        engine.configure(config);
        (engine, clock)
    }

    fn slain_config() -> EngineConfig {
        EngineConfig {
            character: CharacterInfo { name: "Tarvos".to_string(), ..Default::default() },
            combat_text: true,
            triggers: vec![TriggerDef {
                id: "slain".to_string(),
                phrases: vec![phrase(1, r"(?<target>.+) has been slain by {C}", true)],
                actions: vec![action(
                    10,
                    ActionKind::DisplayText { text: "${target} down".to_string() },
                )],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn line_to_rendered_display_text() {
        let (mut engine, _clock) = engine(slain_config());
        let mut sink = CollectingSink::default();

        engine.process_line("a gnoll has been slain by Tarvos!", &mut sink);
        match &sink.events[0] {
            OutboundEvent::DisplayText { text } => assert_eq!(text, "a gnoll down"),
            other => panic!("expected DisplayText, got {other:?}"),
        }
    }

    #[test]
    fn disabled_trigger_is_silent() {
        let mut config = slain_config();
        config.disabled_triggers.push("slain".to_string());
        let (mut engine, _clock) = engine(config);
        let mut sink = CollectingSink::default();

        engine.process_line("a gnoll has been slain by Tarvos!", &mut sink);
        assert!(sink.events.is_empty());
    }

    #[test]
    fn stored_variable_gates_a_second_trigger() {
        let config = EngineConfig {
            combat_text: true,
            triggers: vec![
                TriggerDef {
                    id: "zone".to_string(),
                    phrases: vec![phrase(1, r"You have entered (?<zone>.+)\.", true)],
                    actions: vec![action(
                        1,
                        ActionKind::StoreVariable {
                            name: "Zone".to_string(),
                            value: "${zone}".to_string(),
                            scalar: true,
                            restrict_to_condition_values: false,
                            loopback: false,
                        },
                    )],
                    ..Default::default()
                },
                TriggerDef {
                    id: "sky-only".to_string(),
                    conditions: vec![ConditionDef {
                        variable: "Zone".to_string(),
                        op: ConditionOp::Equals,
                        values: "Plane of Sky".to_string(),
                    }],
                    phrases: vec![phrase(2, "an azure sprite", false)],
                    actions: vec![action(
                        2,
                        ActionKind::DisplayText { text: "sprite in ${Zone}".to_string() },
                    )],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let (mut engine, _clock) = engine(config);
        let mut sink = CollectingSink::default();

        engine.process_line("An azure sprite scowls at you.", &mut sink);
        assert!(sink.events.is_empty(), "condition must gate before any store exists");

        engine.process_line("You have entered Plane of Sky.", &mut sink);
        engine.process_line("An azure sprite scowls at you.", &mut sink);
        match &sink.events[0] {
            OutboundEvent::DisplayText { text } => assert_eq!(text, "sprite in Plane of Sky"),
            other => panic!("expected DisplayText, got {other:?}"),
        }
    }

    #[test]
    fn dev_only_actions_require_dev_mode() {
        let mut config = slain_config();
        config.triggers[0].actions[0].dev_only = true;
        let (mut gated, _clock) = engine(config.clone());
        let mut sink = CollectingSink::default();
        gated.process_line("a gnoll has been slain by Tarvos!", &mut sink);
        assert!(sink.events.is_empty());

        config.dev_mode = true;
        let (mut dev, _clock) = engine(config);
        let mut sink = CollectingSink::default();
        dev.process_line("a gnoll has been slain by Tarvos!", &mut sink);
        assert_eq!(sink.events.len(), 1);
    }

    #[test]
    fn timer_fire_resets_its_sequential_trigger() {
        let config = EngineConfig {
            triggers: vec![TriggerDef {
                id: "cast".to_string(),
                capture_method: CaptureMethod::Sequential,
                phrases: vec![
                    phrase(1, "You begin casting Root", false),
                    phrase(2, "has been rooted", false),
                ],
                actions: vec![action(
                    1,
                    ActionKind::Timer {
                        kind: TimerKind::Countdown,
                        label: "Root".to_string(),
                        display_text: String::new(),
                        speak_text: String::new(),
                        ended_display_text: String::new(),
                        ended_speak_text: String::new(),
                        duration_seconds: 48.0,
                        duration_from: DurationSource::Declared,
                        end_early_phrases: vec![],
                        secondary_phrases: vec![],
                    },
                )],
                ..Default::default()
            }],
            ..Default::default()
        };
        let (mut engine, _clock) = engine(config);
        let mut sink = CollectingSink::default();

        engine.process_line("You begin casting Root.", &mut sink);
        engine.process_line("a gnoll has been rooted.", &mut sink);
        assert_eq!(sink.events.len(), 1);

        // The timer reset discarded the sequence; step 1 alone is inert.
        engine.process_line("a gnoll has been rooted.", &mut sink);
        assert_eq!(sink.events.len(), 1);
    }

    #[test]
    fn compile_failure_isolates_the_bad_trigger() {
        let mut config = slain_config();
        config.triggers.push(TriggerDef {
            id: "broken".to_string(),
            phrases: vec![phrase(9, r"unclosed (group", true)],
            ..Default::default()
        });
        let (mut engine, _clock) = engine(config);
        let mut sink = CollectingSink::default();

        engine.process_line("a gnoll has been slain by Tarvos!", &mut sink);
        assert!(matches!(sink.events[0], OutboundEvent::DisplayText { .. }));

        engine.tick(&mut sink);
        let entries = match sink.events.last() {
            Some(OutboundEvent::Diagnostics { entries }) => entries,
            other => panic!("expected Diagnostics, got {other:?}"),
        };
        assert!(
            entries
                .iter()
                .any(|e| e.status == ParseStatus::Exception && e.trigger_id == "broken")
        );
        assert!(
            entries
                .iter()
                .any(|e| e.status == ParseStatus::Success && e.trigger_id == "slain")
        );
    }

    #[test]
    fn cooldown_blocks_refire_until_it_expires() {
        let mut config = slain_config();
        config.triggers[0].use_cooldown = true;
        config.triggers[0].cooldown_seconds = 30.0;
        let (mut engine, clock) = engine(config);
        let mut sink = CollectingSink::default();

        engine.process_line("a gnoll has been slain by Tarvos!", &mut sink);
        engine.process_line("a rat has been slain by Tarvos!", &mut sink);
        assert_eq!(sink.events.len(), 1);

        clock.advance(TimeDelta::seconds(31));
        engine.process_line("a rat has been slain by Tarvos!", &mut sink);
        assert_eq!(sink.events.len(), 2);
    }

    #[test]
    fn clear_all_destroys_components_and_stores() {
        let config = EngineConfig {
            triggers: vec![TriggerDef {
                id: "t".to_string(),
                phrases: vec![phrase(1, "begin", false)],
                actions: vec![
                    action(
                        1,
                        ActionKind::StoreVariable {
                            name: "V".to_string(),
                            value: "x".to_string(),
                            scalar: true,
                            restrict_to_condition_values: false,
                            loopback: false,
                        },
                    ),
                    action(
                        2,
                        ActionKind::Timer {
                            kind: TimerKind::Timer,
                            label: "T".to_string(),
                            display_text: String::new(),
                            speak_text: String::new(),
                            ended_display_text: String::new(),
                            ended_speak_text: String::new(),
                            duration_seconds: 10.0,
                            duration_from: DurationSource::Declared,
                            end_early_phrases: vec![],
                            secondary_phrases: vec![],
                        },
                    ),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let (mut engine, _clock) = engine(config);
        let mut sink = CollectingSink::default();
        engine.process_line("begin", &mut sink);
        assert_eq!(engine.live_triggers(), vec!["t".to_string()]);

        engine.clear_all(&mut sink);
        assert!(engine.live_triggers().is_empty());
        assert!(sink.events.iter().any(|e| matches!(e, OutboundEvent::DestroyComponent { .. })));
        assert_eq!(engine.variables_json().unwrap(), "{}");
    }

    #[test]
    fn backfill_resolves_loopback_variables_and_stops() {
        let config = EngineConfig {
            triggers: vec![TriggerDef {
                id: "zone".to_string(),
                phrases: vec![phrase(1, r"You have entered (?<zone>.+)\.", true)],
                actions: vec![action(
                    1,
                    ActionKind::StoreVariable {
                        name: "Zone".to_string(),
                        value: "${zone}".to_string(),
                        scalar: true,
                        restrict_to_condition_values: false,
                        loopback: true,
                    },
                )],
                ..Default::default()
            }],
            ..Default::default()
        };
        let (mut engine, _clock) = engine(config);
        assert!(engine.loopback_pending());

        assert!(!engine.backfill_line("a gnoll scowls at you"));
        assert!(engine.backfill_line("You have entered Befallen."));
        assert!(!engine.loopback_pending());

        let json = engine.variables_json().unwrap();
        assert!(json.contains("Befallen"));
    }

    #[test]
    fn variables_survive_a_serialize_restore_round() {
        let (mut engine, _clock) = engine(EngineConfig::default());
        engine.restore_variables(r#"{"Zone":["Befallen"]}"#).unwrap();
        assert_eq!(engine.variables_json().unwrap(), r#"{"Zone":["Befallen"]}"#);
    }
}
