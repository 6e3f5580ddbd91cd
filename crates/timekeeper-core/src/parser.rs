//! Text → ordered action plan.
//!
//! Stages are tried in priority order and the first match wins:
//!
//! 1. bare alarm        "set a pizza timer for 10 minutes", "5 minute timer"
//! 2. device duration   "turn on the porch light for 10 minutes"
//! 3. multi-step        "wait 5 minutes, notify me, then 3 minutes later turn off the light"
//! 4. delayed action    "in 5 minutes turn off the fan", "turn off the fan in 5 minutes"
//!
//! Anything else is `None`; the caller falls back to generic intent handling.

use crate::duration::{format_duration, normalize, parse_duration, QUANTITY_PATTERN};
use crate::phrase::{PhraseParser, Topology};
use crate::types::{
    Action, ActionSequence, Provenance, SequenceShape, ServiceTarget, TimedAction,
};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// How a segment's delay was expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayForm {
    /// "wait 5 minutes": a checkpoint on its own.
    Wait,
    /// "in 5 minutes ..." / "after 5 minutes ..."
    Prefix,
    /// "5 minutes later ..."
    Later,
    /// "... in 5 minutes" / "... 5 minutes later"
    Suffix,
}

#[derive(Debug)]
struct Segment {
    delay: Option<(Duration, DelayForm)>,
    action: Option<Action>,
}

struct Patterns {
    alarm_for: Regex,
    alarm_leading: Regex,
    device_for: Regex,
    device_for_suffix: Regex,
    connective: Regex,
    wait: Regex,
    prefix: Regex,
    later_prefix: Regex,
    suffix: Regex,
    later_suffix: Regex,
    timer_word: Regex,
}

fn duration_expr() -> String {
    format!(r"(?:{q})(?:\s*(?:,|and)?\s*(?:{q}))*", q = QUANTITY_PATTERN)
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| {
        let dur = duration_expr();
        Patterns {
            alarm_for: Regex::new(&format!(
                r"^(?:(?:set|start|create|make)\s+(?:me\s+)?)?(?:a\s+|an\s+|the\s+)?(?:(.+?)\s+)?(?:timer|alarm)\s+(?:for|of)\s+({dur})$"
            ))
            .unwrap(),
            alarm_leading: Regex::new(&format!(
                r"^(?:(?:set|start|create|make)\s+(?:me\s+)?)?(?:a\s+|an\s+)?({dur})\s+(?:(.+?)\s+)?(?:timer|alarm)(?:\s+for\s+(?:the\s+|my\s+)?(.+))?$"
            ))
            .unwrap(),
            device_for: Regex::new(&format!(
                r"^(?:turn|switch)\s+on\s+(.+?)\s+for\s+({dur})$"
            ))
            .unwrap(),
            device_for_suffix: Regex::new(&format!(
                r"^(?:turn|switch)\s+(.+?)\s+on\s+for\s+({dur})$"
            ))
            .unwrap(),
            connective: Regex::new(
                r"\s*(?:[;,]\s*(?:and\s+)?(?:then\b|after\s+that\b|next\b)?|\band\s+then\b|\bthen\b|\bafter\s+that\b|\bnext\b)\s*",
            )
            .unwrap(),
            wait: Regex::new(&format!(
                r"^wait\s+(?:for\s+)?(?:another\s+)?({dur})(?:\s*,?\s*(?:and\s+)?(.*))?$"
            ))
            .unwrap(),
            prefix: Regex::new(&format!(
                r"^(?:in|after)\s+(?:another\s+)?({dur})\s*,?\s*(.*)$"
            ))
            .unwrap(),
            later_prefix: Regex::new(&format!(r"^({dur})\s+later\s*,?\s*(.*)$")).unwrap(),
            suffix: Regex::new(&format!(
                r"^(.+?)\s+(?:in|after)\s+(?:another\s+)?({dur})(?:\s+later)?$"
            ))
            .unwrap(),
            later_suffix: Regex::new(&format!(r"^(.+?)\s+({dur})\s+later$")).unwrap(),
            timer_word: Regex::new(r"\b(?:timer|alarm|wait|later|remind)\b").unwrap(),
        }
    })
}

// ---------------------------------------------------------------------------
// CommandParser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandParser {
    phrases: PhraseParser,
}

impl CommandParser {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        Self {
            phrases: PhraseParser::new(topology),
        }
    }

    pub fn with_domains(mut self, domains: HashMap<String, String>) -> Self {
        self.phrases = self.phrases.with_domains(domains);
        self
    }

    pub fn phrases(&self) -> &PhraseParser {
        &self.phrases
    }

    /// Parse `text` into an action sequence, or `None` if it is not a timed
    /// command this subsystem understands.
    pub fn parse(
        &self,
        text: &str,
        speaker: Option<&str>,
        room: Option<&str>,
    ) -> Option<ActionSequence> {
        let text = clean(&normalize(text));
        if text.is_empty() {
            return None;
        }
        let provenance = Provenance::new(speaker, room);

        if let Some(seq) = self.parse_alarm(&text, &provenance) {
            return Some(seq);
        }
        if let Some(seq) = self.parse_device_duration(&text, &provenance) {
            return Some(seq);
        }
        if let Some(seq) = self.parse_multi_step(&text, &provenance) {
            return Some(seq);
        }
        self.parse_delayed_action(&text, &provenance)
    }

    /// Cheap syntactic check: does this look like something we should try?
    pub fn looks_timed(&self, text: &str) -> bool {
        let text = normalize(text);
        patterns().timer_word.is_match(&text) || parse_duration(&text).is_some()
    }

    fn parse_alarm(&self, text: &str, provenance: &Provenance) -> Option<ActionSequence> {
        let p = patterns();
        let (dur_text, label) = if let Some(caps) = p.alarm_for.captures(text) {
            (caps.get(2)?.as_str(), caps.get(1).map(|m| m.as_str()))
        } else if let Some(caps) = p.alarm_leading.captures(text) {
            let label = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str());
            (caps.get(1)?.as_str(), label)
        } else {
            return None;
        };

        let delay = parse_duration(dur_text)?;
        if delay.is_zero() {
            return None;
        }
        let label = label.map(clean_label).filter(|l| !l.is_empty());

        let message = match &label {
            Some(l) => format!("Your {l} timer is done"),
            None => format!("Your {} timer is done", format_duration(delay)),
        };
        let mut seq = ActionSequence::new(
            vec![TimedAction::new(
                delay,
                Action::Announce {
                    message,
                    room: None,
                },
            )],
            SequenceShape::Alarm,
            provenance.clone(),
        );
        if let Some(l) = label {
            seq = seq.with_label(l);
        }
        Some(seq)
    }

    fn parse_device_duration(
        &self,
        text: &str,
        provenance: &Provenance,
    ) -> Option<ActionSequence> {
        let p = patterns();
        let caps = p
            .device_for
            .captures(text)
            .or_else(|| p.device_for_suffix.captures(text))?;
        let target = caps.get(1)?.as_str();
        let delay = parse_duration(caps.get(2)?.as_str())?;
        if delay.is_zero() {
            return None;
        }
        let on = self.phrases.service_call("turn_on", target);
        let off = self.phrases.service_call("turn_off", target);
        Some(ActionSequence::new(
            vec![TimedAction::immediate(on), TimedAction::new(delay, off)],
            SequenceShape::DeviceDuration,
            provenance.clone(),
        ))
    }

    fn parse_multi_step(&self, text: &str, provenance: &Provenance) -> Option<ActionSequence> {
        let raw: Vec<&str> = patterns()
            .connective
            .split(text)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if raw.len() < 2 {
            return None;
        }

        let mut segments = Vec::with_capacity(raw.len());
        for part in raw {
            let seg = self.parse_segment(part);
            // A segment with neither a delay nor a recognised action makes
            // the whole plan unparseable rather than silently dropped.
            if seg.delay.is_none() && seg.action.is_none() {
                return None;
            }
            segments.push(seg);
        }

        let steps = merge_leading_delays(segments);
        if steps.len() < 2 {
            return None;
        }

        let mut last_call: Option<(String, ServiceTarget)> = None;
        let actions = steps
            .into_iter()
            .map(|seg| {
                let delay = seg.delay.map(|(d, _)| d).unwrap_or(Duration::ZERO);
                let mut action = seg.action.unwrap_or_else(|| checkpoint(delay));
                resolve_pronoun(&mut action, &mut last_call);
                TimedAction::new(delay, action)
            })
            .collect();

        Some(ActionSequence::new(
            actions,
            SequenceShape::MultiStep,
            provenance.clone(),
        ))
    }

    fn parse_delayed_action(
        &self,
        text: &str,
        provenance: &Provenance,
    ) -> Option<ActionSequence> {
        let seg = self.parse_segment(text);
        let (delay, _) = seg.delay?;
        let action = seg.action?;
        if delay.is_zero() {
            return None;
        }
        Some(ActionSequence::new(
            vec![TimedAction::new(delay, action)],
            SequenceShape::DelayedAction,
            provenance.clone(),
        ))
    }

    /// Strip a leading or trailing delay expression and classify the rest.
    fn parse_segment(&self, segment: &str) -> Segment {
        let p = patterns();
        let segment = strip_leading_and(segment);

        let split = if let Some(caps) = p.wait.captures(segment) {
            Some((
                caps.get(1).map(|m| m.as_str()),
                caps.get(2).map(|m| m.as_str()),
                DelayForm::Wait,
            ))
        } else if let Some(caps) = p.prefix.captures(segment) {
            Some((
                caps.get(1).map(|m| m.as_str()),
                caps.get(2).map(|m| m.as_str()),
                DelayForm::Prefix,
            ))
        } else if let Some(caps) = p.later_prefix.captures(segment) {
            Some((
                caps.get(1).map(|m| m.as_str()),
                caps.get(2).map(|m| m.as_str()),
                DelayForm::Later,
            ))
        } else if let Some(caps) = p.suffix.captures(segment) {
            Some((
                caps.get(2).map(|m| m.as_str()),
                caps.get(1).map(|m| m.as_str()),
                DelayForm::Suffix,
            ))
        } else if let Some(caps) = p.later_suffix.captures(segment) {
            Some((
                caps.get(2).map(|m| m.as_str()),
                caps.get(1).map(|m| m.as_str()),
                DelayForm::Suffix,
            ))
        } else {
            None
        };

        match split {
            Some((Some(dur), rest, form)) => match parse_duration(dur) {
                Some(d) => Segment {
                    delay: Some((d, form)),
                    action: rest.and_then(|r| self.phrases.parse(r)),
                },
                None => Segment {
                    delay: None,
                    action: self.phrases.parse(segment),
                },
            },
            _ => Segment {
                delay: None,
                action: self.phrases.parse(segment),
            },
        }
    }
}

/// "in 5 minutes, turn off the fan" splits on the comma into a bare delay and
/// an undelayed action; fold such a delay into the step that follows it.
/// "wait" delays stay as checkpoints of their own.
fn merge_leading_delays(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    let mut carried: Option<(Duration, DelayForm)> = None;
    for mut seg in segments {
        if let Some(delay) = carried.take() {
            if seg.delay.is_none() && seg.action.is_some() {
                seg.delay = Some(delay);
                out.push(seg);
                continue;
            }
            out.push(Segment {
                delay: Some(delay),
                action: None,
            });
        }
        match seg.delay {
            Some((_, form)) if seg.action.is_none() && form != DelayForm::Wait => {
                carried = seg.delay;
            }
            _ => out.push(seg),
        }
    }
    if let Some(delay) = carried {
        out.push(Segment {
            delay: Some(delay),
            action: None,
        });
    }
    out
}

/// "turn on the fan, then in 10 minutes turn it off": "it" refers to the
/// previous service call's target.
fn resolve_pronoun(action: &mut Action, last_call: &mut Option<(String, ServiceTarget)>) {
    let Action::CallService { domain, target, .. } = action else {
        return;
    };
    let is_pronoun = matches!(
        target,
        ServiceTarget::Entity(e) if e.rsplit('.').next().is_some_and(|s| s == "it" || s == "them")
    );
    match (is_pronoun, last_call.as_ref()) {
        (true, Some((prev_domain, prev_target))) => {
            *domain = prev_domain.clone();
            *target = prev_target.clone();
        }
        _ => *last_call = Some((domain.clone(), target.clone())),
    }
}

fn checkpoint(delay: Duration) -> Action {
    Action::Announce {
        message: format!("Checkpoint: {} elapsed", format_duration(delay)),
        room: None,
    }
}

fn clean(text: &str) -> String {
    let mut t = text.trim().trim_end_matches(['.', '!', '?']).trim();
    for filler in [
        "hey ",
        "please ",
        "can you ",
        "could you ",
        "would you ",
        "i want you to ",
    ] {
        if let Some(rest) = t.strip_prefix(filler) {
            t = rest.trim_start();
        }
    }
    t.trim_end_matches(" please").to_string()
}

fn strip_leading_and(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("and ").map(str::trim_start).unwrap_or(s)
}

fn clean_label(label: &str) -> String {
    let words: Vec<&str> = label
        .split_whitespace()
        .filter(|w| !matches!(*w, "a" | "an" | "the" | "my" | "new"))
        .collect();
    words.join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
