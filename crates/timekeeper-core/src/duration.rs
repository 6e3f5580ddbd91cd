//! Spoken duration parsing and formatting.
//!
//! `parse_duration("an hour and a half")` goes through three passes:
//! word numbers become digits, casual phrases become canonical numeric text,
//! then each unit (hours, minutes, seconds) is matched on its own and the
//! magnitudes are summed. No recognised unit means no match, never zero.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

const ONES: &[(&str, u32)] = &[
    ("zero", 0),
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
];

const TEENS: &[(&str, u32)] = &[
    ("ten", 10),
    ("eleven", 11),
    ("twelve", 12),
    ("thirteen", 13),
    ("fourteen", 14),
    ("fifteen", 15),
    ("sixteen", 16),
    ("seventeen", 17),
    ("eighteen", 18),
    ("nineteen", 19),
];

const TENS: &[(&str, u32)] = &[
    ("twenty", 20),
    ("thirty", 30),
    ("forty", 40),
    ("fifty", 50),
    ("sixty", 60),
    ("seventy", 70),
    ("eighty", 80),
    ("ninety", 90),
];

/// Casual phrases rewritten to numeric text before unit matching.
/// Longer phrases come first so "an hour and a half" wins over "an hour".
const CASUAL_PHRASES: &[(&str, &str)] = &[
    ("an hour and a half", "90 minutes"),
    ("a minute and a half", "90 seconds"),
    ("half an hour", "30 minutes"),
    ("a half hour", "30 minutes"),
    ("half hour", "30 minutes"),
    ("quarter of an hour", "15 minutes"),
    ("a quarter hour", "15 minutes"),
    ("a couple of hours", "2 hours"),
    ("a couple hours", "2 hours"),
    ("a couple of minutes", "2 minutes"),
    ("a couple minutes", "2 minutes"),
    ("a few minutes", "3 minutes"),
    ("a few seconds", "5 seconds"),
    ("an hour", "1 hour"),
    ("a minute", "1 minute"),
    ("a second", "1 second"),
    ("a sec", "1 second"),
];

/// One quantity: number, optional "and a half", unit, optional "and a half".
pub(crate) const QUANTITY_PATTERN: &str = r"\d+(?:\.\d+)?(?:\s+and\s+a\s+half)?\s*(?:hours?|hrs?|minutes?|mins?|seconds?|secs?|h\b|m\b|s\b)(?:\s+and\s+a\s+half)?";

fn word_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let tens: Vec<&str> = TENS.iter().map(|(w, _)| *w).collect();
        let ones: Vec<&str> = ONES.iter().skip(1).map(|(w, _)| *w).collect();
        let singles: Vec<&str> = TEENS
            .iter()
            .chain(ONES.iter())
            .map(|(w, _)| *w)
            .collect();
        let pattern = format!(
            r"\b(?:({tens})(?:[-\s]({ones}))?|({singles}))\b",
            tens = tens.join("|"),
            ones = ones.join("|"),
            singles = singles.join("|"),
        );
        Regex::new(&pattern).unwrap()
    })
}

fn casual_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alts: Vec<String> = CASUAL_PHRASES
            .iter()
            .map(|(p, _)| regex::escape(p).replace(' ', r"\s+"))
            .collect();
        Regex::new(&format!(r"\b(?:{})\b", alts.join("|"))).unwrap()
    })
}

fn unit_re(unit: &str) -> Regex {
    Regex::new(&format!(
        r"(\d+(?:\.\d+)?)(\s+and\s+a\s+half)?\s*(?:{unit})(\s+and\s+a\s+half)?"
    ))
    .unwrap()
}

fn hours_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| unit_re(r"hours?\b|hrs?\b|h\b"))
}

fn minutes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| unit_re(r"minutes?\b|mins?\b|m\b"))
}

fn seconds_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| unit_re(r"seconds?\b|secs?\b|s\b"))
}

fn lookup(table: &[(&str, u32)], word: &str) -> Option<u32> {
    table.iter().find(|(w, _)| *w == word).map(|(_, n)| *n)
}

/// Replace spelled-out numbers below one hundred with digits.
///
/// Handles ones, teens, tens, and compound tens-ones ("twenty-five",
/// "twenty five").
pub fn normalize_numbers(text: &str) -> String {
    let lower = text.to_lowercase();
    word_number_re()
        .replace_all(&lower, |caps: &regex::Captures| {
            if let Some(tens) = caps.get(1) {
                let mut n = lookup(TENS, tens.as_str()).unwrap_or(0);
                if let Some(ones) = caps.get(2) {
                    n += lookup(ONES, ones.as_str()).unwrap_or(0);
                }
                n.to_string()
            } else if let Some(single) = caps.get(3) {
                let w = single.as_str();
                lookup(TEENS, w)
                    .or_else(|| lookup(ONES, w))
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| w.to_string())
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Lowercase, digitise word numbers, and rewrite casual duration phrases.
pub fn normalize(text: &str) -> String {
    let numeric = normalize_numbers(text);
    casual_re()
        .replace_all(&numeric, |caps: &regex::Captures| {
            let found = caps[0].split_whitespace().collect::<Vec<_>>().join(" ");
            CASUAL_PHRASES
                .iter()
                .find(|(p, _)| *p == found)
                .map(|(_, canonical)| canonical.to_string())
                .unwrap_or(found)
        })
        .into_owned()
}

/// Longest duration `parse_duration` will produce. Anything bigger is
/// treated as no match rather than clamped.
pub const MAX_DURATION: Duration = Duration::from_secs(366 * 24 * 3600);

/// Seconds contributed by the first match of `re`, plus 30 of the next
/// smaller unit when an "and a half" is attached.
fn unit_seconds(re: &Regex, text: &str, unit_secs: f64) -> Option<f64> {
    let caps = re.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let mut secs = value * unit_secs;
    if caps.get(2).is_some() || caps.get(3).is_some() {
        secs += unit_secs / 2.0;
    }
    // Fractional hours land on whole minutes, everything else on whole seconds.
    let rounded = if unit_secs >= 3600.0 {
        (secs / 60.0).round() * 60.0
    } else {
        secs.round()
    };
    Some(rounded)
}

/// Parse a spoken duration. Returns `None` when no unit is recognised or
/// the total is longer than [`MAX_DURATION`].
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = normalize(text);
    let parts = [
        unit_seconds(hours_re(), &text, 3600.0),
        unit_seconds(minutes_re(), &text, 60.0),
        unit_seconds(seconds_re(), &text, 1.0),
    ];
    if parts.iter().all(Option::is_none) {
        return None;
    }
    let total: f64 = parts.iter().flatten().sum();
    if !total.is_finite() || total > MAX_DURATION.as_secs() as f64 {
        return None;
    }
    Some(Duration::from_secs(total as u64))
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// Render a duration as spoken English: "1 hour and 30 minutes".
///
/// Output always parses back to the same duration (whole seconds).
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(plural(hours, "hour"));
    }
    if minutes > 0 {
        parts.push(plural(minutes, "minute"));
    }
    if seconds > 0 {
        parts.push(plural(seconds, "second"));
    }

    match parts.len() {
        0 => "0 seconds".to_string(),
        1 => parts.remove(0),
        _ => {
            let last = parts.pop().unwrap_or_default();
            format!("{} and {}", parts.join(", "), last)
        }
    }
}

/// Compact clock form for status lines: `4:05` or `1:02:03`.
pub fn format_clock(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
