//! Per-trigger capture state and gating.
//!
//! A [`CompiledTrigger`] is the runtime form of a configured trigger:
//! compiled phrases, flattened conditions (its own plus every ancestor
//! folder's), a cached class/level gate, cooldown state, and, for the
//! Sequential capture method, the set of in-progress sequences.
//!
//! Evaluation of one line against one trigger:
//!
//! ```text
//! class gate (cached)  ─┐
//! cooldown expiry/gate ─┼─ check_conditions ── fail ─► force-reset sequences
//! stored-var conditions ┘        │
//!                                ▼ pass
//!                     capture method state machine
//!        AnyMatch: every phrase tested independently
//!        Sequential: phrase 0 spawns, in-progress sequences advance
//!        Concurrent: declared but unsupported; no-op
//! ```
//!
//! Triggers are rebuilt wholesale on every configuration tick; nothing in
//! here survives a reconfigure except through the stores.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use log::warn;

use crate::LineCaptures;
use crate::config::{
    CaptureMethod, CharacterInfo, ClassRestriction, ConditionDef, ConditionOp, EngineConfig,
    PhraseId, RestartBehavior, TriggerDef,
};
use crate::error::EngineError;

use super::phrase::{CompiledPhrase, RenderContext, compile_phrase};
use super::stores::VariableStore;

/// One in-progress multi-step match.
#[derive(Debug)]
pub struct SequenceState {
    /// Position into the phrase list; 1 once phrase 0 has matched.
    capture_index: usize,
    /// Named captures accumulated across steps.
    accumulated: HashMap<String, String>,
    /// Source of deltaTime: reset on every advance.
    last_advance: NaiveDateTime,
    /// Literal text that started the sequence, for exact-duplicate
    /// suppression under `ExactFirstMatch`.
    start_line: String,
}

/// One successful phrase test, ready for action dispatch.
#[derive(Debug)]
pub struct PhraseFire {
    pub phrase_id: PhraseId,
    /// Captures of the step that just matched.
    pub captures: LineCaptures,
    /// Accumulated sequence captures including this step (empty for
    /// AnyMatch).
    pub sequence_captures: HashMap<String, String>,
    /// Milliseconds since the previous sequence advance.
    pub delta_ms: Option<i64>,
}

/// Result of the per-line condition gate.
#[derive(Debug, Default)]
pub struct ConditionOutcome {
    pub pass: bool,
    /// Variable -> the value that satisfied its condition.
    pub results: HashMap<String, String>,
    /// Which gate failed, for diagnostics.
    pub failed: Option<String>,
}

#[derive(Debug)]
pub struct CompiledTrigger {
    pub def: TriggerDef,
    /// Trigger conditions concatenated with all inherited folder
    /// conditions.
    conditions: Vec<ConditionDef>,
    phrases: Vec<CompiledPhrase>,
    /// Class/level restriction cannot change mid-run; evaluated once.
    class_pass: bool,
    cooldown_started: Option<NaiveDateTime>,
    sequences: Vec<SequenceState>,
}

impl CompiledTrigger {
    /// Compile a trigger definition against the current configuration.
    /// Only non-empty phrases are compiled; a bad phrase fails the whole
    /// trigger (it is reported and skipped by the engine).
    pub fn compile(def: &TriggerDef, config: &EngineConfig) -> Result<Self, EngineError> {
        let phrases = def
            .phrases
            .iter()
            .filter(|p| !p.text.is_empty())
            .map(|p| compile_phrase(p, &config.character.name))
            .collect::<Result<Vec<_>, _>>()?;

        if def.capture_method == CaptureMethod::Concurrent {
            warn!("trigger {}: Concurrent capture is not supported; it will never match", def.id);
        }

        Ok(CompiledTrigger {
            conditions: config.inherited_conditions(def),
            class_pass: class_gate(def.class_restriction.as_ref(), &config.character),
            cooldown_started: None,
            sequences: Vec::new(),
            phrases,
            def: def.clone(),
        })
    }

    /// Gate that runs before any phrase test. A failure force-discards all
    /// in-progress sequences.
    pub fn check_conditions(
        &mut self,
        variables: &VariableStore,
        now: NaiveDateTime,
    ) -> ConditionOutcome {
        if !self.class_pass {
            self.force_reset();
            return fail("class/level restriction");
        }

        if let Some(started) = self.cooldown_started {
            let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
            if elapsed >= self.def.cooldown_seconds {
                self.cooldown_started = None;
            } else {
                self.force_reset();
                return fail("cooldown active");
            }
        }

        let mut results = HashMap::new();
        let mut failed_on: Option<String> = None;
        for cond in &self.conditions {
            match evaluate_condition(cond, variables) {
                Some(Some(value)) => {
                    results.insert(cond.variable.clone(), value);
                }
                Some(None) => {}
                None => {
                    failed_on = Some(cond.variable.clone());
                    break;
                }
            }
        }
        if let Some(variable) = failed_on {
            self.force_reset();
            return fail(&format!("condition on {variable:?}"));
        }

        ConditionOutcome { pass: true, results, failed: None }
    }

    /// Test the line under the trigger's capture method. Callers must have
    /// passed [`check_conditions`] first.
    pub fn process_line(
        &mut self,
        line: &str,
        ctx: &RenderContext,
        now: NaiveDateTime,
    ) -> Vec<PhraseFire> {
        match self.def.capture_method {
            CaptureMethod::AnyMatch => self
                .phrases
                .iter()
                .filter_map(|p| {
                    p.test(line, ctx).map(|captures| PhraseFire {
                        phrase_id: p.id,
                        captures,
                        sequence_captures: HashMap::new(),
                        delta_ms: None,
                    })
                })
                .collect(),
            CaptureMethod::Sequential => self.process_sequential(line, ctx, now),
            CaptureMethod::Concurrent => Vec::new(),
        }
    }

    fn process_sequential(
        &mut self,
        line: &str,
        ctx: &RenderContext,
        now: NaiveDateTime,
    ) -> Vec<PhraseFire> {
        // Phrase 0 is always tested; a match arms a new sequence. It does
        // not fire by itself: actions run on advances.
        if let Some(first) = self.phrases.first() {
            if let Some(caps) = first.test(line, ctx) {
                if self.def.restart_behavior == RestartBehavior::ExactFirstMatch {
                    self.sequences.retain(|s| s.start_line != line);
                }
                let accumulated = caps.named.clone();
                self.sequences.push(SequenceState {
                    capture_index: 1,
                    accumulated,
                    last_advance: now,
                    start_line: line.to_string(),
                });
            }
        }

        let mut fires = Vec::new();
        let mut i = 0;
        while i < self.sequences.len() {
            if self.sequences[i].capture_index >= self.phrases.len() {
                self.sequences.remove(i);
                continue;
            }
            let matched = {
                let state = &self.sequences[i];
                let phrase = &self.phrases[state.capture_index];
                let mut seq_ctx = *ctx;
                seq_ctx.sequence_captures = Some(&state.accumulated);
                phrase.test(line, &seq_ctx).map(|caps| (phrase.id, caps))
            };
            let Some((phrase_id, captures)) = matched else {
                i += 1;
                continue;
            };

            let state = &mut self.sequences[i];
            let delta_ms = (now - state.last_advance).num_milliseconds();
            for (k, v) in &captures.named {
                state.accumulated.insert(k.clone(), v.clone());
            }
            state.capture_index += 1;
            state.last_advance = now;
            fires.push(PhraseFire {
                phrase_id,
                captures,
                sequence_captures: state.accumulated.clone(),
                delta_ms: Some(delta_ms),
            });

            let exhausted = state.capture_index >= self.phrases.len();
            if exhausted || self.def.restart_behavior == RestartBehavior::AfterFirstMatch {
                self.sequences.remove(i);
            } else {
                i += 1;
            }
        }
        fires
    }

    /// Test every phrase independently without touching capture state.
    /// Backward loopback scanning uses this: sequence order is meaningless
    /// when the log is read newest first.
    pub fn probe(&self, line: &str, ctx: &RenderContext) -> Option<PhraseFire> {
        self.phrases.iter().find_map(|p| {
            p.test(line, ctx).map(|captures| PhraseFire {
                phrase_id: p.id,
                captures,
                sequence_captures: HashMap::new(),
                delta_ms: None,
            })
        })
    }

    /// Arm the cooldown. Called on fire, before actions run.
    pub fn start_cooldown(&mut self, now: NaiveDateTime) {
        if self.def.use_cooldown {
            self.cooldown_started = Some(now);
        }
    }

    /// Discard all in-progress sequences (timer actions reset their
    /// originating trigger; failing conditions do the same).
    pub fn force_reset(&mut self) {
        self.sequences.clear();
    }

    #[cfg(test)]
    fn pending_sequences(&self) -> usize {
        self.sequences.len()
    }
}

fn fail(reason: &str) -> ConditionOutcome {
    ConditionOutcome { pass: false, results: HashMap::new(), failed: Some(reason.to_string()) }
}

fn class_gate(restriction: Option<&ClassRestriction>, character: &CharacterInfo) -> bool {
    let Some(r) = restriction else {
        return true;
    };
    let class_ok = r.classes.is_empty()
        || r.classes.iter().any(|c| c.eq_ignore_ascii_case(&character.class));
    let above_min = r.min_level == 0 || character.level >= r.min_level;
    let below_max = r.max_level == 0 || character.level <= r.max_level;
    class_ok && above_min && below_max
}

/// `None` = condition fails. `Some(Some(v))` = passes, satisfied by `v`.
/// `Some(None)` = passes with no satisfying value to record (IsNull,
/// DoesNotEqual against an empty stored set).
fn evaluate_condition(cond: &ConditionDef, variables: &VariableStore) -> Option<Option<String>> {
    let stored = variables.get(&cond.variable);
    let acceptable = cond.acceptable_values();

    match cond.op {
        ConditionOp::Equals => stored
            .iter()
            .find(|s| acceptable.iter().any(|a| *a == s.as_str()))
            .map(|s| Some(s.clone())),
        ConditionOp::Contains => stored
            .iter()
            .find(|s| {
                let lower = s.to_lowercase();
                acceptable.iter().any(|a| lower.contains(&a.to_lowercase()))
            })
            .map(|s| Some(s.clone())),
        ConditionOp::DoesNotEqual => {
            if acceptable.is_empty() {
                // No acceptable values: "is set to anything" check.
                if stored.is_empty() {
                    None
                } else {
                    Some(stored.first().cloned())
                }
            } else if stored.iter().any(|s| acceptable.iter().any(|a| *a == s.as_str())) {
                None
            } else {
                Some(stored.first().cloned())
            }
        }
        ConditionOp::IsNull => stored.is_empty().then_some(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use crate::clock::{Clock, ManualClock};
    use crate::config::PhraseDef;

    fn phrase(id: PhraseId, text: &str, use_regex: bool) -> PhraseDef {
        PhraseDef { id, text: text.to_string(), use_regex }
    }

    fn compile(def: TriggerDef) -> CompiledTrigger {
        CompiledTrigger::compile(&def, &EngineConfig::default()).unwrap()
    }

    fn bare_ctx(now: NaiveDateTime) -> RenderContext<'static> {
        RenderContext::new("", now)
    }

    #[test]
    fn any_match_fires_once_per_matching_phrase() {
        let clock = ManualClock::epoch();
        let mut trigger = compile(TriggerDef {
            phrases: vec![phrase(1, "snake", false), phrase(2, "bites", false)],
            ..Default::default()
        });
        let now = clock.now();
        let fires = trigger.process_line("A snake bites YOU!", &bare_ctx(now), now);
        let ids: Vec<PhraseId> = fires.iter().map(|f| f.phrase_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn sequential_two_step_with_delta_time() {
        let clock = ManualClock::epoch();
        let mut trigger = compile(TriggerDef {
            capture_method: CaptureMethod::Sequential,
            phrases: vec![
                phrase(1, "You begin casting Fire Spell.", false),
                phrase(2, r"(?<target>.+) has taken (?<amt>\d+) damage from your Fire Spell\.", true),
            ],
            ..Default::default()
        });

        let now = clock.now();
        let fires = trigger.process_line("You begin casting Fire Spell.", &bare_ctx(now), now);
        assert!(fires.is_empty());
        assert_eq!(trigger.pending_sequences(), 1);

        clock.advance(TimeDelta::seconds(2));
        let now = clock.now();
        let fires = trigger.process_line(
            "A snake has taken 40 damage from your Fire Spell.",
            &bare_ctx(now),
            now,
        );
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].captures.get("amt"), Some("40"));
        assert_eq!(fires[0].captures.get("target"), Some("A snake"));
        assert_eq!(fires[0].delta_ms, Some(2000));
        // Sequence exhausted; same step-1 line does not fire again.
        let now = clock.now();
        let fires = trigger.process_line(
            "A snake has taken 40 damage from your Fire Spell.",
            &bare_ctx(now),
            now,
        );
        assert!(fires.is_empty());
    }

    #[test]
    fn exact_first_match_supersedes_duplicate_chains() {
        let clock = ManualClock::epoch();
        let mut trigger = compile(TriggerDef {
            capture_method: CaptureMethod::Sequential,
            restart_behavior: RestartBehavior::ExactFirstMatch,
            phrases: vec![
                phrase(1, "You begin casting", false),
                phrase(2, "lands", false),
                phrase(3, "fades", false),
            ],
            ..Default::default()
        });
        let now = clock.now();
        trigger.process_line("You begin casting Gate.", &bare_ctx(now), now);
        trigger.process_line("You begin casting Gate.", &bare_ctx(now), now);
        assert_eq!(trigger.pending_sequences(), 1);
        // A different starting literal coexists.
        trigger.process_line("You begin casting Root.", &bare_ctx(now), now);
        assert_eq!(trigger.pending_sequences(), 2);
    }

    #[test]
    fn after_first_match_drops_sequence_after_one_advance() {
        let clock = ManualClock::epoch();
        let mut trigger = compile(TriggerDef {
            capture_method: CaptureMethod::Sequential,
            restart_behavior: RestartBehavior::AfterFirstMatch,
            phrases: vec![
                phrase(1, "step zero", false),
                phrase(2, "step one", false),
                phrase(3, "step two", false),
            ],
            ..Default::default()
        });
        let now = clock.now();
        trigger.process_line("step zero", &bare_ctx(now), now);
        let fires = trigger.process_line("step one", &bare_ctx(now), now);
        assert_eq!(fires.len(), 1);
        assert_eq!(trigger.pending_sequences(), 0);
        assert!(trigger.process_line("step two", &bare_ctx(now), now).is_empty());
    }

    #[test]
    fn cooldown_gates_and_expires() {
        let clock = ManualClock::epoch();
        let vars = VariableStore::default();
        let mut trigger = compile(TriggerDef {
            use_cooldown: true,
            cooldown_seconds: 10.0,
            phrases: vec![phrase(1, "hits you", false)],
            ..Default::default()
        });

        assert!(trigger.check_conditions(&vars, clock.now()).pass);
        trigger.start_cooldown(clock.now());

        clock.advance(TimeDelta::seconds(5));
        let outcome = trigger.check_conditions(&vars, clock.now());
        assert!(!outcome.pass);
        assert_eq!(outcome.failed.as_deref(), Some("cooldown active"));

        clock.advance(TimeDelta::seconds(6));
        assert!(trigger.check_conditions(&vars, clock.now()).pass);
    }

    #[test]
    fn condition_failure_discards_sequences() {
        let clock = ManualClock::epoch();
        let mut vars = VariableStore::default();
        vars.store_scalar("Zone", "Plane of Sky");
        let mut trigger = compile(TriggerDef {
            capture_method: CaptureMethod::Sequential,
            conditions: vec![ConditionDef {
                variable: "Zone".to_string(),
                op: ConditionOp::Equals,
                values: "Plane of Sky".to_string(),
            }],
            phrases: vec![phrase(1, "begin", false), phrase(2, "finish", false)],
            ..Default::default()
        });

        let now = clock.now();
        assert!(trigger.check_conditions(&vars, now).pass);
        trigger.process_line("begin", &bare_ctx(now), now);
        assert_eq!(trigger.pending_sequences(), 1);

        vars.clear_name("Zone");
        let outcome = trigger.check_conditions(&vars, now);
        assert!(!outcome.pass);
        assert_eq!(outcome.failed.as_deref(), Some("condition on \"Zone\""));
        assert_eq!(trigger.pending_sequences(), 0);
    }

    #[test]
    fn condition_operators() {
        let mut vars = VariableStore::default();
        vars.store_value("Zone", "Plane of Sky");

        let equals = ConditionDef {
            variable: "Zone".to_string(),
            op: ConditionOp::Equals,
            values: "Plane of Sky|Plane of Fire".to_string(),
        };
        assert_eq!(evaluate_condition(&equals, &vars), Some(Some("Plane of Sky".to_string())));

        let contains = ConditionDef {
            variable: "Zone".to_string(),
            op: ConditionOp::Contains,
            values: "sky".to_string(),
        };
        assert_eq!(evaluate_condition(&contains, &vars), Some(Some("Plane of Sky".to_string())));

        let not_equal = ConditionDef {
            variable: "Zone".to_string(),
            op: ConditionOp::DoesNotEqual,
            values: "Plane of Sky".to_string(),
        };
        assert_eq!(evaluate_condition(&not_equal, &vars), None);

        // Empty acceptable set: "is set to anything".
        let is_set = ConditionDef {
            variable: "Zone".to_string(),
            op: ConditionOp::DoesNotEqual,
            values: String::new(),
        };
        assert_eq!(evaluate_condition(&is_set, &vars), Some(Some("Plane of Sky".to_string())));

        let is_null = ConditionDef {
            variable: "Other".to_string(),
            op: ConditionOp::IsNull,
            values: String::new(),
        };
        assert_eq!(evaluate_condition(&is_null, &vars), Some(None));
        let not_null = ConditionDef {
            variable: "Zone".to_string(),
            op: ConditionOp::IsNull,
            values: String::new(),
        };
        assert_eq!(evaluate_condition(&not_null, &vars), None);
    }

    #[test]
    fn class_and_level_restriction_cached_gate() {
        let config = EngineConfig {
            character: CharacterInfo { name: "Tarvos".to_string(), class: "Wizard".to_string(), level: 54 },
            ..Default::default()
        };
        let def = TriggerDef {
            class_restriction: Some(ClassRestriction {
                classes: vec!["wizard".to_string()],
                min_level: 50,
                max_level: 0,
            }),
            ..Default::default()
        };
        let mut trigger = CompiledTrigger::compile(&def, &config).unwrap();
        assert!(trigger.check_conditions(&VariableStore::default(), ManualClock::epoch().now()).pass);

        let low = EngineConfig {
            character: CharacterInfo { name: "Alt".to_string(), class: "Wizard".to_string(), level: 10 },
            ..Default::default()
        };
        let mut trigger = CompiledTrigger::compile(&def, &low).unwrap();
        assert!(!trigger.check_conditions(&VariableStore::default(), ManualClock::epoch().now()).pass);
    }
}
