//! Phrase compiler: template rendering and pattern compilation.
//!
//! A user-authored template serves two masters:
//!
//! - **Render**: produce display/speech text by substituting live data
//!   into the template. Stage order is fixed; every stage is a no-op when
//!   its data is absent, and an unresolved placeholder is left intact
//!   rather than erroring.
//! - **Compile**: produce a matcher the engine tests log lines against.
//!
//! ```text
//! render stages (in order)
//!   1. shortcodes        {C} {TS} {N#} {S#}
//!   2. stored variables  ${Name}        -> values joined by comma
//!   3. condition results ${Name}        -> value that satisfied a condition
//!   4. sequence captures ?{name}        -> literal captured in an earlier step
//!   5. match groups      ${name} #{n} ${deltaTime}
//!   6. counters          +{Name}
//! ```
//!
//! Compilation is done once per configuration tick and cached for the
//! trigger's lifetime. Templates that reference runtime data inside the
//! pattern itself (`${Var}` alternations, `?{name}` sequential
//! back-references) cannot be frozen; those keep their expanded template
//! and are substituted and compiled per test.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use log::debug;
use regex::Regex;

use crate::LineCaptures;
use crate::config::{PhraseDef, PhraseId};
use crate::error::EngineError;

use super::stores::{CounterStore, VariableStore};

// --- Render ------------------------------------------------------------------

/// Everything the render pipeline may substitute from. All fields are
/// optional borrows; a missing field simply turns its stage into a no-op.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub character: &'a str,
    pub now: NaiveDateTime,
    pub variables: Option<&'a VariableStore>,
    pub counters: Option<&'a CounterStore>,
    pub condition_results: Option<&'a HashMap<String, String>>,
    pub sequence_captures: Option<&'a HashMap<String, String>>,
    pub captures: Option<&'a LineCaptures>,
    pub delta_ms: Option<i64>,
    /// Effective duration in seconds, drives `{TS}`.
    pub timer_duration: Option<f64>,
}

impl<'a> RenderContext<'a> {
    pub fn new(character: &'a str, now: NaiveDateTime) -> Self {
        RenderContext {
            character,
            now,
            variables: None,
            counters: None,
            condition_results: None,
            sequence_captures: None,
            captures: None,
            delta_ms: None,
            timer_duration: None,
        }
    }
}

/// Run `re` over `text`, replacing each hit with `lookup`'s result and
/// leaving the original text in place when the lookup comes up empty.
fn substitute(
    re: &Regex,
    text: &str,
    mut lookup: impl FnMut(&regex::Captures) -> Option<String>,
) -> String {
    re.replace_all(text, |caps: &regex::Captures| {
        lookup(caps).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// Render a template through the fixed substitution pipeline.
pub fn render(template: &str, ctx: &RenderContext) -> String {
    // 1. Shortcodes.
    let mut out = substitute(regex!(r"(?i)\{(c|ts|[ns]\d*)\}"), template, |caps| {
        let code = caps[1].to_ascii_uppercase();
        match code.as_str() {
            "C" if !ctx.character.is_empty() => Some(ctx.character.to_string()),
            "TS" => ctx.timer_duration.map(format_duration),
            _ => ctx.captures.and_then(|c| c.get(&code)).map(str::to_string),
        }
    });

    // 2. Stored variables: all values joined by comma.
    out = substitute(regex!(r"\$\{([^}{]+)\}"), &out, |caps| {
        ctx.variables.and_then(|vars| {
            let values = vars.get(&caps[1]);
            if values.is_empty() { None } else { Some(values.join(",")) }
        })
    });

    // 3. Condition results: the value that satisfied a condition.
    out = substitute(regex!(r"\$\{([^}{]+)\}"), &out, |caps| {
        ctx.condition_results.and_then(|res| res.get(&caps[1]).cloned())
    });

    // 4. Sequential captures, inlined as plain text.
    out = substitute(regex!(r"\?\{([^}{]+)\}"), &out, |caps| {
        ctx.sequence_captures.and_then(|seq| seq.get(&caps[1]).cloned())
    });

    // 5. Match groups.
    out = substitute(regex!(r"\$\{([^}{]+)\}"), &out, |caps| {
        let name = &caps[1];
        if name == "deltaTime" {
            return ctx.delta_ms.map(|ms| ms.to_string());
        }
        ctx.captures.and_then(|c| c.get(name)).map(str::to_string)
    });
    out = substitute(regex!(r"#\{(\d+)\}"), &out, |caps| {
        let idx: usize = caps[1].parse().ok()?;
        ctx.captures.and_then(|c| c.positional.get(idx).cloned())
    });

    // 6. Counters.
    substitute(regex!(r"\+\{([^}{]+)\}"), &out, |caps| {
        ctx.counters.map(|counters| counters.peek(&caps[1], ctx.now).to_string())
    })
}

/// Format seconds as `m:ss` (or `h:mm:ss` past an hour) for `{TS}`.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.round().max(0.0) as i64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 { format!("{h}:{m:02}:{s:02}") } else { format!("{m}:{s:02}") }
}

/// Parse a duration-shaped string: plain seconds, `m:ss`, or `h:mm:ss`.
pub fn parse_duration(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if !text.contains(':') {
        return text.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0);
    }
    let mut total = 0.0;
    for part in text.split(':') {
        total = total * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(total)
}

// --- Compile -----------------------------------------------------------------

#[derive(Debug)]
enum Matcher {
    /// Fully static pattern, compiled once.
    Ready(Regex),
    /// Pattern still referencing stored variables (`${Var}`) or sequential
    /// captures (`?{name}`); substituted and compiled per test.
    Dynamic { template: String },
    /// Literal template referencing runtime data; rendered, escaped, and
    /// compiled per test.
    DynamicLiteral { template: String },
}

/// One compiled capture phrase, cached for the trigger's lifetime.
#[derive(Debug)]
pub struct CompiledPhrase {
    pub id: PhraseId,
    /// Author's template, kept verbatim for diagnostics.
    pub source: String,
    matcher: Matcher,
}

fn has_dynamic_refs(text: &str) -> bool {
    text.contains("${") || text.contains("?{") || text.contains("+{")
}

/// Compile a non-empty phrase definition into a matcher. Empty templates
/// are the caller's problem; triggers never compile them.
pub fn compile_phrase(def: &PhraseDef, character: &str) -> Result<CompiledPhrase, EngineError> {
    let matcher = if def.use_regex {
        let expanded = expand_shortcodes(&def.text, character)?;
        if has_dynamic_refs(&expanded) {
            // Probe-compile with throwaway groups so syntax errors surface
            // on the configuration tick, not mid-stream.
            let probe = substitute(regex!(r"[$?]\{[^}{]+\}"), &expanded, |_| {
                Some("(?:.+?)".to_string())
            });
            compile_ci(&probe, &def.text)?;
            Matcher::Dynamic { template: expanded }
        } else {
            Matcher::Ready(compile_ci(&expanded, &def.text)?)
        }
    } else if has_dynamic_refs(&def.text) {
        Matcher::DynamicLiteral { template: def.text.clone() }
    } else {
        // Static literal: resolve {C}, escape everything, match substrings
        // case-insensitively.
        let rendered = substitute(regex!(r"(?i)\{c\}"), &def.text, |_| {
            (!character.is_empty()).then(|| character.to_string())
        });
        Matcher::Ready(compile_ci(&regex::escape(&rendered), &def.text)?)
    };

    Ok(CompiledPhrase { id: def.id, source: def.text.clone(), matcher })
}

fn compile_ci(pattern: &str, phrase: &str) -> Result<Regex, EngineError> {
    Regex::new(&format!("(?i){pattern}")).map_err(|source| EngineError::PhraseCompile {
        phrase: phrase.to_string(),
        source,
    })
}

impl CompiledPhrase {
    /// Test the phrase against a line, producing captures on a hit.
    ///
    /// `ctx` supplies the stored variables and sequential captures a
    /// dynamic pattern needs; static patterns ignore it.
    pub fn test(&self, line: &str, ctx: &RenderContext) -> Option<LineCaptures> {
        match &self.matcher {
            Matcher::Ready(re) => captures_of(re, line),
            Matcher::Dynamic { template } => {
                let pattern = substitute_pattern_refs(template, ctx);
                match Regex::new(&format!("(?i){pattern}")) {
                    Ok(re) => captures_of(&re, line),
                    Err(err) => {
                        debug!("phrase {:?}: dynamic compile failed: {err}", self.source);
                        None
                    }
                }
            }
            Matcher::DynamicLiteral { template } => {
                let rendered = render(template, ctx);
                match Regex::new(&format!("(?i){}", regex::escape(&rendered))) {
                    Ok(re) => captures_of(&re, line),
                    Err(err) => {
                        debug!("phrase {:?}: literal compile failed: {err}", self.source);
                        None
                    }
                }
            }
        }
    }
}

fn captures_of(re: &Regex, line: &str) -> Option<LineCaptures> {
    let caps = re.captures(line)?;
    let mut named = HashMap::new();
    for name in re.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            named.insert(name.to_string(), m.as_str().to_string());
        }
    }
    let positional = (0..caps.len())
        .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect();
    Some(LineCaptures { named, positional })
}

/// Substitute runtime-dependent references into a pattern at test time:
/// `${Var}` becomes an alternation capture group over the variable's
/// values, `?{name}` re-matches an earlier step's captured text verbatim.
/// Unresolvable references are left intact.
fn substitute_pattern_refs(template: &str, ctx: &RenderContext) -> String {
    let out = substitute(regex!(r"\$\{([^}{]+)\}"), template, |caps| {
        let name = &caps[1];
        let vars = ctx.variables?;
        let values = vars.get(name);
        if values.is_empty() {
            return None;
        }
        let alt: Vec<String> = values.iter().map(|v| regex::escape(v)).collect();
        Some(named_group(name, &alt.join("|")))
    });
    substitute(regex!(r"\?\{([^}{]+)\}"), &out, |caps| {
        let name = &caps[1];
        let value = ctx.sequence_captures?.get(name)?;
        Some(named_group(name, &regex::escape(value)))
    })
}

fn valid_group_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn named_group(name: &str, body: &str) -> String {
    if valid_group_name(name) {
        format!("(?<{name}>{body})")
    } else {
        format!("(?:{body})")
    }
}

// --- Shortcode expansion (pattern side) ----------------------------------------

/// Duration-shaped alternation for `{TS}`: `h:mm:ss`, `m:ss`, or bare
/// seconds, captured as `timerDuration`.
const TS_PATTERN: &str = r"(?<timerDuration>\d+:\d{2}(?::\d{2})?|\d+)";

/// Expand `{C}`, `{TS}`, `{S#}`, `{N#}`, and `{N#<op>value}` into
/// sub-patterns. Comparison shortcodes with an unknown operator are a
/// compile-time error naming the phrase.
fn expand_shortcodes(template: &str, character: &str) -> Result<String, EngineError> {
    let mut out = substitute(regex!(r"(?i)\{c\}"), template, |_| {
        (!character.is_empty()).then(|| regex::escape(character))
    });
    out = substitute(regex!(r"(?i)\{ts\}"), &out, |_| Some(TS_PATTERN.to_string()));

    // Numeric comparisons before bare {N#}, or the bare form would eat the
    // prefix of `{N1>=20}`.
    let cmp = regex!(r"(?i)\{n(\d*)\s*([^}\s]*?)\s*(\d+)\}");
    let mut rebuilt = String::with_capacity(out.len());
    let mut cursor = 0;
    for caps in cmp.captures_iter(&out) {
        let whole = caps.get(0).unwrap();
        let name = format!("N{}", &caps[1]);
        let op = caps[2].to_string();
        if op.is_empty() {
            // `{N1}` without an operator; handled below.
            continue;
        }
        let body = compile_comparison(&op, &caps[3], template)?;
        rebuilt.push_str(&out[cursor..whole.start()]);
        rebuilt.push_str(&named_group(&name, &body));
        cursor = whole.end();
    }
    rebuilt.push_str(&out[cursor..]);
    out = rebuilt;

    out = substitute(regex!(r"(?i)\{s(\d*)\}"), &out, |caps| {
        Some(named_group(&format!("S{}", &caps[1]), ".+?"))
    });
    out = substitute(regex!(r"(?i)\{n(\d*)\}"), &out, |caps| {
        Some(named_group(&format!("N{}", &caps[1]), "[0-9]+?"))
    });
    Ok(out)
}

// --- Numeric comparison construction --------------------------------------------

/// Never-matching pattern (the regex crate has no lookaround; an empty
/// character class is the conventional stand-in).
const NEVER: &str = r"[^\s\S]";

fn digits_of(value: &str) -> Vec<u8> {
    value.bytes().map(|b| b - b'0').collect()
}

fn digits_to_string(digits: &[u8]) -> String {
    digits.iter().map(|d| (b'0' + d) as char).collect()
}

/// Repetition suffix for `rest` trailing free digits.
fn digit_tail(rest: usize) -> String {
    match rest {
        0 => String::new(),
        1 => r"\d".to_string(),
        n => format!(r"\d{{{n}}}"),
    }
}

/// Branches matching any digit string numerically greater than `digits`:
/// more digits always wins, otherwise a digit-wise "carry" construction
/// (shared prefix, one strictly larger digit, free tail).
fn gt_branches(digits: &[u8]) -> Vec<String> {
    let n = digits.len();
    let mut branches = vec![format!(r"\d{{{},}}", n + 1)];
    for (i, &d) in digits.iter().enumerate() {
        if d < 9 {
            branches.push(format!(
                "{}[{}-9]{}",
                digits_to_string(&digits[..i]),
                d + 1,
                digit_tail(n - i - 1),
            ));
        }
    }
    branches
}

/// Structural complement of [`gt_branches`]: fewer digits, or a shared
/// prefix with one strictly smaller digit. Empty for zero.
fn lt_branches(digits: &[u8]) -> Vec<String> {
    let n = digits.len();
    let mut branches = Vec::new();
    if n > 1 {
        branches.push(format!(r"\d{{1,{}}}", n - 1));
    }
    for (i, &d) in digits.iter().enumerate() {
        if d > 0 {
            branches.push(format!(
                "{}[0-{}]{}",
                digits_to_string(&digits[..i]),
                d - 1,
                digit_tail(n - i - 1),
            ));
        }
    }
    branches
}

fn decrement(digits: &[u8]) -> Option<Vec<u8>> {
    let mut out = digits.to_vec();
    for i in (0..out.len()).rev() {
        if out[i] > 0 {
            out[i] -= 1;
            // Strip a leading zero produced by the borrow ("100" -> "099").
            while out.len() > 1 && out[0] == 0 {
                out.remove(0);
            }
            return Some(out);
        }
        out[i] = 9;
    }
    None // all zeros
}

fn increment(digits: &[u8]) -> Vec<u8> {
    let mut out = digits.to_vec();
    for i in (0..out.len()).rev() {
        if out[i] < 9 {
            out[i] += 1;
            return out;
        }
        out[i] = 0;
    }
    out.insert(0, 1);
    out
}

/// Compile a numeric comparison against `value` into an alternation body.
///
/// `>=`/`<=` reduce to `>`/`<` against the value minus/plus one; `!=` is
/// the union of `<` and `>`. `>= 0` matches any digit string and `< 0`
/// matches nothing.
pub fn compile_comparison(op: &str, value: &str, phrase: &str) -> Result<String, EngineError> {
    let digits = digits_of(value);
    let branches = match op {
        ">" => gt_branches(&digits),
        "<" => lt_branches(&digits),
        ">=" => match decrement(&digits) {
            Some(lower) => gt_branches(&lower),
            None => vec![r"\d+".to_string()],
        },
        "<=" => lt_branches(&increment(&digits)),
        "=" => vec![digits_to_string(&digits)],
        "!=" => {
            let mut all = lt_branches(&digits);
            all.extend(gt_branches(&digits));
            all
        }
        other => {
            return Err(EngineError::InvalidComparison {
                op: other.to_string(),
                phrase: phrase.to_string(),
            });
        }
    };
    if branches.is_empty() {
        return Ok(NEVER.to_string());
    }
    Ok(format!("(?:{})", branches.join("|")))
}
