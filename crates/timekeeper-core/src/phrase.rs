//! Action-phrase classification: "turn off the porch light" → a service call.
//!
//! Patterns are tried in order: notification, announcement, chime, then the
//! turn-on / turn-off / toggle service calls. The target of a service call is
//! mapped to a domain through a keyword table and handed to the [`Topology`]
//! collaborator for area resolution.

use crate::types::{Action, Priority, ServiceTarget};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Topology collaborator
// ---------------------------------------------------------------------------

/// Resolves a spoken target ("porch light", "kitchen") to an area id.
pub trait Topology: Send + Sync {
    fn resolve_area(&self, target_phrase: &str) -> Option<String>;
}

/// Topology with no knowledge of the house; every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTopology;

impl Topology for NoTopology {
    fn resolve_area(&self, _target_phrase: &str) -> Option<String> {
        None
    }
}

/// Keyword-based topology: the first configured area name appearing in the
/// target phrase wins.
#[derive(Debug, Default, Clone)]
pub struct StaticTopology {
    areas: Vec<(String, String)>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_area(mut self, keyword: impl Into<String>, area_id: impl Into<String>) -> Self {
        self.areas.push((keyword.into().to_lowercase(), area_id.into()));
        self
    }
}

impl Topology for StaticTopology {
    fn resolve_area(&self, target_phrase: &str) -> Option<String> {
        let phrase = target_phrase.to_lowercase();
        self.areas
            .iter()
            .find(|(keyword, _)| contains_word(&phrase, keyword))
            .map(|(_, area)| area.clone())
    }
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .collect::<Vec<_>>()
        .windows(needle.split_whitespace().count().max(1))
        .any(|w| w.join(" ") == needle)
}

// ---------------------------------------------------------------------------
// Domain keyword table
// ---------------------------------------------------------------------------

const DEFAULT_DOMAIN: &str = "light";

const DOMAIN_KEYWORDS: &[(&str, &str)] = &[
    ("lamp", "light"),
    ("lamps", "light"),
    ("light", "light"),
    ("lights", "light"),
    ("bulb", "light"),
    ("fan", "fan"),
    ("fans", "fan"),
    ("switch", "switch"),
    ("outlet", "switch"),
    ("plug", "switch"),
    ("kettle", "switch"),
    ("heater", "climate"),
    ("thermostat", "climate"),
    ("ac", "climate"),
    ("tv", "media_player"),
    ("television", "media_player"),
    ("speaker", "media_player"),
    ("music", "media_player"),
    ("blinds", "cover"),
    ("shades", "cover"),
    ("curtains", "cover"),
    ("lock", "lock"),
];

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

struct Patterns {
    notify: Regex,
    announce: Regex,
    chime: Regex,
    turn_prefix: Regex,
    turn_suffix: Regex,
    toggle: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        notify: Regex::new(
            r"^(?:send\s+(?:me\s+)?(?:a\s+)?)?(?:notify|notification|remind|ping|alert|text|message)(?:\s+me)?(?:\s+(?:to|that|about|saying))?(?:\s+(.+))?$",
        )
        .unwrap(),
        announce: Regex::new(
            r"^(?:announce|say|tell\s+(?:me|us|everyone))(?:\s+that)?\s+(.+)$",
        )
        .unwrap(),
        chime: Regex::new(
            r"^(?:play|ring|sound)\s+(?:a\s+|the\s+)?(?:(\w+)\s+)?(?:chime|bell|sound|alarm)(?:\s+in\s+(?:the\s+)?(.+))?$",
        )
        .unwrap(),
        turn_prefix: Regex::new(r"^(?:turn|switch|shut)\s+(on|off)\s+(.+)$").unwrap(),
        turn_suffix: Regex::new(r"^(?:turn|switch|shut)\s+(.+?)\s+(on|off)$").unwrap(),
        toggle: Regex::new(r"^toggle\s+(.+)$").unwrap(),
    })
}

// ---------------------------------------------------------------------------
// PhraseParser
// ---------------------------------------------------------------------------

/// Classifies action phrases. Cheap to clone; holds the topology behind an `Arc`.
#[derive(Clone)]
pub struct PhraseParser {
    topology: std::sync::Arc<dyn Topology>,
    extra_domains: HashMap<String, String>,
}

impl std::fmt::Debug for PhraseParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhraseParser")
            .field("extra_domains", &self.extra_domains)
            .finish_non_exhaustive()
    }
}

impl PhraseParser {
    pub fn new(topology: std::sync::Arc<dyn Topology>) -> Self {
        Self {
            topology,
            extra_domains: HashMap::new(),
        }
    }

    /// Merge keyword → domain entries over the built-in table.
    pub fn with_domains(mut self, domains: HashMap<String, String>) -> Self {
        self.extra_domains = domains
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        self
    }

    /// Classify an already-normalised phrase. `None` if nothing matches.
    pub fn parse(&self, phrase: &str) -> Option<Action> {
        let phrase = clean_phrase(phrase);
        if phrase.is_empty() {
            return None;
        }
        let p = patterns();

        if let Some(caps) = p.notify.captures(&phrase) {
            let message = caps
                .get(1)
                .map(|m| capitalize(m.as_str().trim()))
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Time's up".to_string());
            return Some(Action::Notify {
                title: "Reminder".to_string(),
                message,
                target: None,
                priority: Priority::Normal,
            });
        }

        if let Some(caps) = p.announce.captures(&phrase) {
            let message = capitalize(caps.get(1)?.as_str().trim());
            return Some(Action::Announce {
                message,
                room: None,
            });
        }

        if let Some(caps) = p.chime.captures(&phrase) {
            let sound = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "chime".to_string());
            let room = caps.get(2).map(|m| m.as_str().to_string());
            return Some(Action::Chime { sound, room });
        }

        let (service, target) = if let Some(caps) = p.turn_prefix.captures(&phrase) {
            (format!("turn_{}", &caps[1]), caps[2].to_string())
        } else if let Some(caps) = p.turn_suffix.captures(&phrase) {
            (format!("turn_{}", &caps[2]), caps[1].to_string())
        } else if let Some(caps) = p.toggle.captures(&phrase) {
            ("toggle".to_string(), caps[1].to_string())
        } else {
            return None;
        };

        Some(self.service_call(&service, &target))
    }

    /// Build a service call for `target`, resolving its area when possible.
    pub fn service_call(&self, service: &str, target: &str) -> Action {
        let target = strip_determiners(target);
        let domain = self.domain_for(&target);
        let resolved = match self.topology.resolve_area(&target) {
            Some(area) => ServiceTarget::Area(area),
            None => ServiceTarget::Entity(format!("{domain}.{}", slugify(&target))),
        };
        Action::CallService {
            domain,
            service: service.to_string(),
            target: resolved,
        }
    }

    /// Domain for a target phrase; the last matching keyword wins, so
    /// "kitchen fan light" is a light.
    pub fn domain_for(&self, target: &str) -> String {
        let mut found = None;
        for word in target.split_whitespace() {
            if let Some(d) = self.extra_domains.get(word) {
                found = Some(d.clone());
            } else if let Some((_, d)) = DOMAIN_KEYWORDS.iter().find(|(k, _)| *k == word) {
                found = Some(d.to_string());
            }
        }
        found.unwrap_or_else(|| DEFAULT_DOMAIN.to_string())
    }
}

fn clean_phrase(phrase: &str) -> String {
    let mut p = phrase.trim().trim_end_matches(['.', '!', '?', ',']).trim();
    for filler in ["please ", "and ", "also ", "then "] {
        if let Some(rest) = p.strip_prefix(filler) {
            p = rest.trim_start();
        }
    }
    p.to_string()
}

fn strip_determiners(target: &str) -> String {
    let mut t = target.trim();
    loop {
        let before = t;
        for det in ["the ", "my ", "all ", "all the ", "a ", "an "] {
            if let Some(rest) = t.strip_prefix(det) {
                t = rest.trim_start();
            }
        }
        if t == before {
            break;
        }
    }
    t.to_string()
}

fn slugify(s: &str) -> String {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn parser() -> PhraseParser {
        PhraseParser::new(Arc::new(NoTopology))
    }

    #[test]
    fn turn_off_builds_entity_from_target() {
        let action = parser().parse("turn off the porch light").unwrap();
        assert_eq!(
            action,
            Action::CallService {
                domain: "light".into(),
                service: "turn_off".into(),
                target: ServiceTarget::Entity("light.porch_light".into()),
            }
        );
    }

    #[test]
    fn suffix_form_and_toggle() {
        let p = parser();
        let Action::CallService {
            service, domain, ..
        } = p.parse("turn the fan on").unwrap()
        else {
            panic!("expected service call")
        };
        assert_eq!(service, "turn_on");
        assert_eq!(domain, "fan");

        let Action::CallService { service, .. } = p.parse("toggle the lamp").unwrap() else {
            panic!("expected service call")
        };
        assert_eq!(service, "toggle");
    }

    #[test]
    fn unknown_target_defaults_to_light() {
        assert_eq!(parser().domain_for("reading nook"), "light");
        assert_eq!(parser().domain_for("bedroom fan"), "fan");
    }

    #[test]
    fn configured_domains_override_table() {
        let mut extra = HashMap::new();
        extra.insert("Kettle".to_string(), "water_heater".to_string());
        let p = parser().with_domains(extra);
        assert_eq!(p.domain_for("the kettle"), "water_heater");
    }

    #[test]
    fn topology_resolves_area() {
        let topo = StaticTopology::new().with_area("porch", "area.porch");
        let p = PhraseParser::new(Arc::new(topo));
        let Action::CallService { target, .. } = p.parse("turn on the porch light").unwrap()
        else {
            panic!("expected service call")
        };
        assert_eq!(target, ServiceTarget::Area("area.porch".into()));
    }

    #[test]
    fn notification_and_announcement() {
        let p = parser();
        match p.parse("notify me").unwrap() {
            Action::Notify { message, priority, .. } => {
                assert_eq!(message, "Time's up");
                assert_eq!(priority, Priority::Normal);
            }
            other => panic!("expected notify, got {other:?}"),
        }
        match p.parse("remind me to check the oven").unwrap() {
            Action::Notify { message, .. } => assert_eq!(message, "Check the oven"),
            other => panic!("expected notify, got {other:?}"),
        }
        match p.parse("announce dinner is ready").unwrap() {
            Action::Announce { message, room } => {
                assert_eq!(message, "Dinner is ready");
                assert!(room.is_none());
            }
            other => panic!("expected announce, got {other:?}"),
        }
    }

    #[test]
    fn chime_with_room() {
        match parser().parse("play a doorbell chime in the kitchen").unwrap() {
            Action::Chime { sound, room } => {
                assert_eq!(sound, "doorbell");
                assert_eq!(room.as_deref(), Some("kitchen"));
            }
            other => panic!("expected chime, got {other:?}"),
        }
    }

    #[test]
    fn unrecognised_phrase_is_none() {
        assert!(parser().parse("dance a little").is_none());
        assert!(parser().parse("").is_none());
    }
}
