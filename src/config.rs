//! Inbound configuration contract.
//!
//! The host process owns rule authoring and persistence; on every
//! configuration tick it hands the engine a whole [`EngineConfig`] and the
//! engine recompiles from scratch. Nothing in here is runtime state.
//!
//! Triggers live inside a folder hierarchy. Folder-level conditions are
//! inherited by every trigger underneath them; inheritance is resolved at
//! compile time by concatenating ancestor conditions onto the trigger's
//! own (order does not matter, all must pass).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type TriggerId = String;
pub type FolderId = String;
pub type PhraseId = u64;
pub type ActionId = u64;

/// Everything the host pushes on a configuration tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub character: CharacterInfo,
    /// Dev-only actions execute only when this is set.
    pub dev_mode: bool,
    /// When set, failed evaluation attempts are recorded in the parse
    /// history (successes and exceptions are always recorded).
    pub diagnostics: bool,
    /// Gates DisplayText actions.
    pub combat_text: bool,
    /// Gates quick-share imports on the host side; carried here so the
    /// engine can annotate diagnostics.
    pub quick_share_import: bool,
    pub voice: VoiceSettings,
    /// Word -> replacement applied to speech text before it is emitted.
    pub phonetics: HashMap<String, String>,
    pub folders: Vec<FolderDef>,
    pub triggers: Vec<TriggerDef>,
    /// Per-character disabled triggers (profile overrides).
    pub disabled_triggers: Vec<TriggerId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterInfo {
    pub name: String,
    pub class: String,
    pub level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub voice: String,
    pub volume: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        VoiceSettings { voice: String::new(), volume: 1.0 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderDef {
    pub id: FolderId,
    pub parent_id: Option<FolderId>,
    pub conditions: Vec<ConditionDef>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerDef {
    pub id: TriggerId,
    pub name: String,
    pub folder_id: Option<FolderId>,
    pub phrases: Vec<PhraseDef>,
    pub capture_method: CaptureMethod,
    pub restart_behavior: RestartBehavior,
    pub conditions: Vec<ConditionDef>,
    pub class_restriction: Option<ClassRestriction>,
    pub use_cooldown: bool,
    pub cooldown_seconds: f64,
    pub actions: Vec<ActionDef>,
    pub enabled: bool,
}

impl Default for TriggerDef {
    fn default() -> Self {
        TriggerDef {
            id: TriggerId::new(),
            name: String::new(),
            folder_id: None,
            phrases: Vec::new(),
            capture_method: CaptureMethod::AnyMatch,
            restart_behavior: RestartBehavior::Default,
            conditions: Vec::new(),
            class_restriction: None,
            use_cooldown: false,
            cooldown_seconds: 0.0,
            actions: Vec::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhraseDef {
    pub id: PhraseId,
    pub text: String,
    pub use_regex: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    #[default]
    AnyMatch,
    Sequential,
    /// Declared by the original system but never implemented there.
    /// Parse and reset are no-ops; not guessed at.
    Concurrent,
}

/// How a Sequential trigger handles a phrase-0 match arriving while
/// sequences are already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartBehavior {
    /// Sequences stay alive until they exhaust the phrase list or conditions
    /// force a reset.
    #[default]
    Default,
    /// A new sequence supersedes any existing one started by the exact same
    /// literal line text.
    ExactFirstMatch,
    /// A sequence only bridges step 0 to step 1; it is dropped after its
    /// first post-start advance.
    AfterFirstMatch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionDef {
    pub variable: String,
    pub op: ConditionOp,
    /// Pipe-delimited acceptable literal values. Empty means "is not set"
    /// semantics for DoesNotEqual / IsNull.
    pub values: String,
}

impl ConditionDef {
    /// Split the pipe-delimited value list, dropping empty segments.
    pub fn acceptable_values(&self) -> Vec<&str> {
        self.values.split('|').map(str::trim).filter(|v| !v.is_empty()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    #[default]
    Equals,
    DoesNotEqual,
    IsNull,
    Contains,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassRestriction {
    /// Allowed class names; empty allows any class.
    pub classes: Vec<String>,
    pub min_level: u32,
    pub max_level: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionDef {
    pub id: ActionId,
    /// Phrase this action is bound to; `None` fires for any phrase of the
    /// trigger.
    pub phrase_id: Option<PhraseId>,
    pub dev_only: bool,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    /// Overlay text (combat text channel).
    DisplayText { text: String },
    Speak { text: String, interrupt: bool, speak_next: bool },
    PlayAudio { file_id: String },
    Clipboard { text: String },
    ScreenGlow { color: String, duration_ms: u64 },
    DeathRecap,
    StoreVariable {
        name: String,
        value: String,
        /// Replace the whole value set instead of appending.
        scalar: bool,
        /// Only store the value if it matches one recorded by a passing
        /// condition of the same trigger.
        restrict_to_condition_values: bool,
        /// Resolve by scanning the log backward at startup when the target
        /// variable is empty.
        loopback: bool,
    },
    ClearVariable {
        name: String,
        /// Remove one value; `None` clears the whole set.
        value: Option<String>,
    },
    IncrementCounter {
        name: String,
        reset_delay_seconds: i64,
        /// Patterns that zero the counter when they match a line while the
        /// counter is positive.
        reset_phrases: Vec<String>,
    },
    Timer {
        kind: TimerKind,
        /// Rendered label for the component (also the spell name used to
        /// synthesize the worn-off matcher for Dot/Beneficial timers).
        label: String,
        display_text: String,
        speak_text: String,
        /// Deferred ending texts, rendered against the snapshot taken at
        /// creation when the host reports expiry.
        #[serde(default)]
        ended_display_text: String,
        #[serde(default)]
        ended_speak_text: String,
        duration_seconds: f64,
        duration_from: DurationSource,
        /// Phrases that destroy the component early.
        end_early_phrases: Vec<String>,
        /// Phrases that adjust the component's timing state (Dot and
        /// Beneficial timers only).
        secondary_phrases: Vec<String>,
    },
    ClearAll,
}

impl Default for ActionKind {
    fn default() -> Self {
        ActionKind::DisplayText { text: String::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    #[default]
    Timer,
    Countdown,
    Stopwatch,
    Dot,
    Beneficial,
}

/// Where a timer's effective duration comes from. The declared
/// `duration_seconds` is the fallback when the source yields nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DurationSource {
    #[default]
    Declared,
    /// A named capture group of the matched phrase (usually
    /// `timerDuration`, produced by the `{TS}` shortcode).
    MatchGroup { group: String },
    /// First value of a stored variable.
    Variable { name: String },
    /// A dictionary path template, rendered through the match context.
    Dictionary { path: String },
}

impl EngineConfig {
    /// Conditions a trigger must pass: its own plus every ancestor
    /// folder's, concatenated. Cycles in the folder graph are cut off by a
    /// visited set rather than reported; the host is responsible for
    /// shipping a tree.
    pub fn inherited_conditions(&self, trigger: &TriggerDef) -> Vec<ConditionDef> {
        let mut out = trigger.conditions.clone();
        let by_id: HashMap<&str, &FolderDef> =
            self.folders.iter().map(|f| (f.id.as_str(), f)).collect();

        let mut seen: Vec<&str> = Vec::new();
        let mut cursor = trigger.folder_id.as_deref();
        while let Some(id) = cursor {
            if seen.contains(&id) {
                break;
            }
            seen.push(id);
            match by_id.get(id) {
                Some(folder) => {
                    out.extend(folder.conditions.iter().cloned());
                    cursor = folder.parent_id.as_deref();
                }
                None => break,
            }
        }
        out
    }

    /// Whether a trigger is live for the current profile.
    pub fn trigger_enabled(&self, trigger: &TriggerDef) -> bool {
        if !trigger.enabled || self.disabled_triggers.contains(&trigger.id) {
            return false;
        }
        // A disabled ancestor folder disables the whole subtree.
        let by_id: HashMap<&str, &FolderDef> =
            self.folders.iter().map(|f| (f.id.as_str(), f)).collect();
        let mut seen: Vec<&str> = Vec::new();
        let mut cursor = trigger.folder_id.as_deref();
        while let Some(id) = cursor {
            if seen.contains(&id) {
                break;
            }
            seen.push(id);
            match by_id.get(id) {
                Some(folder) if !folder.enabled => return false,
                Some(folder) => cursor = folder.parent_id.as_deref(),
                None => break,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(id: &str, parent: Option<&str>, var: &str) -> FolderDef {
        FolderDef {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            conditions: vec![ConditionDef {
                variable: var.to_string(),
                op: ConditionOp::Equals,
                values: "x".to_string(),
            }],
            enabled: true,
        }
    }

    #[test]
    fn conditions_inherit_from_all_ancestors() {
        let config = EngineConfig {
            folders: vec![folder("root", None, "A"), folder("leaf", Some("root"), "B")],
            ..Default::default()
        };
        let trigger = TriggerDef {
            folder_id: Some("leaf".to_string()),
            conditions: vec![ConditionDef {
                variable: "C".to_string(),
                op: ConditionOp::IsNull,
                values: String::new(),
            }],
            ..Default::default()
        };

        let conds = config.inherited_conditions(&trigger);
        let vars: Vec<&str> = conds.iter().map(|c| c.variable.as_str()).collect();
        assert_eq!(vars, vec!["C", "B", "A"]);
    }

    #[test]
    fn disabled_folder_disables_subtree() {
        let mut root = folder("root", None, "A");
        root.enabled = false;
        let config = EngineConfig {
            folders: vec![root, folder("leaf", Some("root"), "B")],
            ..Default::default()
        };
        let trigger =
            TriggerDef { folder_id: Some("leaf".to_string()), ..Default::default() };
        assert!(!config.trigger_enabled(&trigger));
    }

    #[test]
    fn pipe_delimited_values_split() {
        let cond = ConditionDef {
            variable: "Zone".to_string(),
            op: ConditionOp::Equals,
            values: "Plane of Sky|Plane of Fire".to_string(),
        };
        assert_eq!(cond.acceptable_values(), vec!["Plane of Sky", "Plane of Fire"]);

        let empty = ConditionDef::default();
        assert!(empty.acceptable_values().is_empty());
    }
}
