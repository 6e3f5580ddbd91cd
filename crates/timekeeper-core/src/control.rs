//! Follow-up utterances that act on timers that already exist:
//! cancel, pause, resume, extend, status and acknowledgment.

use crate::duration::{normalize, parse_duration, QUANTITY_PATTERN};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// `target` is a label ("pizza") or `None` for "the timer".
    Cancel { target: Option<String> },
    CancelAll,
    Pause { target: Option<String> },
    Resume { target: Option<String> },
    Extend {
        target: Option<String>,
        #[serde(with = "crate::types::duration_secs")]
        by: Duration,
    },
    Status { target: Option<String> },
    /// `stops_timer` is set when the phrase also reads as a cancel
    /// ("stop the timer"), which is what it means when nothing is ringing.
    Acknowledge { stops_timer: bool },
}

struct Patterns {
    acknowledge: Regex,
    cancel_all: Regex,
    cancel: Regex,
    pause: Regex,
    resume: Regex,
    extend_add: Regex,
    extend_by: Regex,
    status: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| {
        let dur = format!(r"(?:{q})(?:\s*(?:,|and)?\s*(?:{q}))*", q = QUANTITY_PATTERN);
        let timer_noun = r"(?:timer|alarm|sequence)";
        Patterns {
            acknowledge: Regex::new(
                r"^(?:stop|ok|okay|dismiss|acknowledge|silence|snooze|enough|got it|i'?m up|i am up|i'?m awake)(?:\s+(?:the\s+|that\s+)?(?:timer|alarm|it))?$",
            )
            .unwrap(),
            cancel_all: Regex::new(
                r"^(?:cancel|stop|delete|remove|clear)\s+(?:all|every|everything)(?:\s+(?:of\s+)?(?:the\s+|my\s+)?(?:timers|alarms|sequences|timer))?$",
            )
            .unwrap(),
            cancel: Regex::new(&format!(
                r"^(?:cancel|stop|delete|remove|clear)\s+(?:the\s+|my\s+)?(?:(.+?)\s+)?{timer_noun}$"
            ))
            .unwrap(),
            pause: Regex::new(&format!(
                r"^(?:pause|hold)\s+(?:the\s+|my\s+)?(?:(.+?)\s+)?{timer_noun}$"
            ))
            .unwrap(),
            resume: Regex::new(&format!(
                r"^(?:resume|unpause|continue|restart)\s+(?:the\s+|my\s+)?(?:(.+?)\s+)?{timer_noun}$"
            ))
            .unwrap(),
            extend_add: Regex::new(&format!(
                r"^(?:add|put)\s+(?:another\s+)?({dur})(?:\s+(?:to|on)\s+(?:the\s+|my\s+)?(?:(.+?)\s+)?{timer_noun})?$"
            ))
            .unwrap(),
            extend_by: Regex::new(&format!(
                r"^extend\s+(?:the\s+|my\s+)?(?:(.+?)\s+)?{timer_noun}\s+by\s+({dur})$"
            ))
            .unwrap(),
            status: Regex::new(&format!(
                r"^(?:how\s+(?:much\s+time|long)\s+(?:is\s+)?(?:left|remaining)|how\s+much\s+time\s+do\s+i\s+have(?:\s+left)?|what'?s\s+left|time\s+left|(?:list|show)\s+(?:my\s+|all\s+)?timers|(?:what|which)\s+timers\s+(?:are\s+)?(?:running|active|set)|status)(?:\s+on\s+(?:the\s+|my\s+)?(?:(.+?)\s+)?{timer_noun})?$"
            ))
            .unwrap(),
        }
    })
}

fn label(m: Option<regex::Match<'_>>) -> Option<String> {
    m.map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty() && s != "the" && s != "my")
}

/// Recognise a control utterance. `None` means "not a control phrase".
pub fn recognize_control(text: &str) -> Option<ControlCommand> {
    let text = normalize(text);
    let text = text
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .trim_start_matches("please ")
        .trim();
    let p = patterns();

    if p.acknowledge.is_match(text) {
        return Some(ControlCommand::Acknowledge {
            stops_timer: p.cancel.is_match(text),
        });
    }
    if p.cancel_all.is_match(text) {
        return Some(ControlCommand::CancelAll);
    }
    if let Some(caps) = p.cancel.captures(text) {
        return Some(ControlCommand::Cancel {
            target: label(caps.get(1)),
        });
    }
    if let Some(caps) = p.pause.captures(text) {
        return Some(ControlCommand::Pause {
            target: label(caps.get(1)),
        });
    }
    if let Some(caps) = p.resume.captures(text) {
        return Some(ControlCommand::Resume {
            target: label(caps.get(1)),
        });
    }
    if let Some(caps) = p.extend_add.captures(text) {
        let by = parse_duration(caps.get(1)?.as_str())?;
        return Some(ControlCommand::Extend {
            target: label(caps.get(2)),
            by,
        });
    }
    if let Some(caps) = p.extend_by.captures(text) {
        let by = parse_duration(caps.get(2)?.as_str())?;
        return Some(ControlCommand::Extend {
            target: label(caps.get(1)),
            by,
        });
    }
    if let Some(caps) = p.status.captures(text) {
        return Some(ControlCommand::Status {
            target: label(caps.get(1)),
        });
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
