//! Line-oriented response protocol
//!
//! ```text
//! ACTIONS: nod, look_up          optional, first non-blank line only
//! Free text spoken aloud.        one or more lines
//! MEMORY[Leon]: gillar matte     optional, last MEMORY-like line wins
//! ```
//!
//! Format violations never fail the parse. An `ACTIONS:` line anywhere but
//! first is dropped. When several MEMORY lines appear, the last well-formed
//! one is used and the rest are dropped. Neither kind of marker line is ever spoken.

use std::sync::LazyLock;

use regex::Regex;

use crate::memory::{detect_entity, normalize_entity};

static ACTIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*ACTIONS:(.*)$").expect("valid regex"));

static TAGGED_MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*MEMORY\s*\[([^\]]+)\]\s*:\s*(.+?)\s*$").expect("valid regex")
});

static PLAIN_MEMORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*MEMORY\s*:\s*(.+?)\s*$").expect("valid regex"));

/// A memory write requested by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryWrite {
    pub entity: String,
    pub observation: String,
}

/// Parsed model response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Action names in execution order, lower-cased
    pub actions: Vec<String>,
    /// Text meant to be spoken
    pub speech: String,
    /// At most one memory write
    pub memory: Option<MemoryWrite>,
}

/// Whether a line is an `ACTIONS:` or `MEMORY` marker line
#[must_use]
pub fn is_protocol_line(line: &str) -> bool {
    let upper = line.trim_start().to_uppercase();
    upper.starts_with("ACTIONS:") || upper.starts_with("MEMORY")
}

/// Whether a partial line could still turn into a marker line
#[must_use]
pub fn may_become_protocol_line(partial: &str) -> bool {
    let upper = partial.trim_start().to_uppercase();
    if upper.is_empty() {
        return false;
    }
    is_protocol_line(&upper) || "ACTIONS:".starts_with(&upper) || "MEMORY".starts_with(&upper)
}

/// Parse a complete model response
#[must_use]
pub fn parse_response(text: &str) -> ParsedResponse {
    let lines: Vec<&str> = text.lines().collect();

    let first = lines.iter().position(|l| !l.trim().is_empty());
    let actions = first
        .and_then(|i| ACTIONS_RE.captures(lines[i]))
        .map(|caps| parse_action_list(&caps[1]))
        .unwrap_or_default();

    let memory = lines.iter().rev().find_map(|l| parse_memory_line(l));

    let speech = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !is_protocol_line(l))
        .collect::<Vec<_>>()
        .join("\n");

    ParsedResponse {
        actions,
        speech,
        memory,
    }
}

/// Parse a single `MEMORY` line, tagged or untagged
#[must_use]
pub fn parse_memory_line(line: &str) -> Option<MemoryWrite> {
    if let Some(caps) = TAGGED_MEMORY_RE.captures(line) {
        let entity = caps[1].trim();
        if !entity.is_empty() {
            return Some(MemoryWrite {
                entity: normalize_entity(entity),
                observation: caps[2].to_string(),
            });
        }
    }

    PLAIN_MEMORY_RE.captures(line).map(|caps| {
        let (entity, observation) = detect_entity(&caps[1]);
        MemoryWrite {
            entity,
            observation,
        }
    })
}

fn parse_action_list(payload: &str) -> Vec<String> {
    payload
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|a| a.trim().trim_matches(|c| c == '[' || c == ']').to_lowercase())
        .filter(|a| !a.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_response() {
        let parsed = parse_response("ACTIONS: nod\nHej!\nMEMORY[Leon]: hälsade");
        assert_eq!(parsed.actions, vec!["nod"]);
        assert_eq!(parsed.speech, "Hej!");
        assert_eq!(
            parsed.memory,
            Some(MemoryWrite {
                entity: "Leon".to_string(),
                observation: "hälsade".to_string(),
            })
        );
    }

    #[test]
    fn test_actions_are_ordered_trimmed_lowercased() {
        let parsed = parse_response("actions: [Nod ,  LOOK_UP,, dance]\nOkej.");
        assert_eq!(parsed.actions, vec!["nod", "look_up", "dance"]);
        assert_eq!(parsed.speech, "Okej.");
    }

    #[test]
    fn test_pure_speech() {
        let parsed = parse_response("Vägg. Fortfarande vägg.");
        assert!(parsed.actions.is_empty());
        assert!(parsed.memory.is_none());
        assert_eq!(parsed.speech, "Vägg. Fortfarande vägg.");
    }

    #[test]
    fn test_actions_after_first_line_ignored_and_not_spoken() {
        let parsed = parse_response("Hmm.\nACTIONS: dance\nJag tänker.");
        assert!(parsed.actions.is_empty());
        assert_eq!(parsed.speech, "Hmm.\nJag tänker.");
    }

    #[test]
    fn test_leading_blank_lines_before_actions() {
        let parsed = parse_response("\n\n  ACTIONS: nod\nJa.");
        assert_eq!(parsed.actions, vec!["nod"]);
    }

    #[test]
    fn test_last_memory_line_wins() {
        let parsed = parse_response(
            "Intressant.\nMEMORY[Leon]: gillar katter\nMer text.\nMEMORY[self]: blev glad",
        );
        let memory = parsed.memory.unwrap();
        assert_eq!(memory.entity, "self");
        assert_eq!(memory.observation, "blev glad");
        assert_eq!(parsed.speech, "Intressant.\nMer text.");
    }

    #[test]
    fn test_malformed_trailing_memory_line_falls_back_to_earlier() {
        let parsed = parse_response("Okej.\nMEMORY[Leon]: gillar katter\nMEMORY[]:\nMEMORY");
        let memory = parsed.memory.unwrap();
        assert_eq!(memory.entity, "Leon");
        assert_eq!(memory.observation, "gillar katter");
        assert_eq!(parsed.speech, "Okej.");
    }

    #[test]
    fn test_untagged_memory_detects_entity() {
        let parsed = parse_response("Coolt.\nMEMORY: Leon gillar dinosaurier");
        let memory = parsed.memory.unwrap();
        assert_eq!(memory.entity, "Leon");
        assert_eq!(memory.observation, "gillar dinosaurier");
    }

    #[test]
    fn test_tagged_memory_normalizes_entity() {
        let m = parse_memory_line("memory[rummet]: soffan är blå").unwrap();
        assert_eq!(m.entity, "environment");
        let m = parse_memory_line("MEMORY [oscar] : spelar fotboll").unwrap();
        assert_eq!(m.entity, "Oscar");
    }

    #[test]
    fn test_empty_memory_payload_is_none() {
        assert!(parse_memory_line("MEMORY:").is_none());
        assert!(parse_response("Hej.\nMEMORY:   ").memory.is_none());
    }

    #[test]
    fn test_generated_round_trip() {
        let cases = [
            (vec!["nod"], vec!["Hej!"], ("Leon", "hälsade")),
            (
                vec!["look_around", "move_forward"],
                vec!["Vad är det där?", "Jag kollar."],
                ("environment", "hittade en strumpa"),
            ),
            (vec!["shake_head"], vec!["Nej."], ("self", "var trött")),
        ];

        for (actions, text, (entity, obs)) in cases {
            let raw = format!(
                "ACTIONS: {}\n{}\nMEMORY[{entity}]: {obs}",
                actions.join(", "),
                text.join("\n")
            );
            let parsed = parse_response(&raw);
            assert_eq!(parsed.actions, actions);
            assert_eq!(parsed.speech, text.join("\n"));
            let memory = parsed.memory.unwrap();
            assert_eq!(memory.entity, entity);
            assert_eq!(memory.observation, obs);
        }
    }

    #[test]
    fn test_protocol_line_prefixes() {
        assert!(is_protocol_line("ACTIONS: nod"));
        assert!(is_protocol_line("  memory[leon]: x"));
        assert!(!is_protocol_line("Hej Leon!"));
        assert!(may_become_protocol_line("ACT"));
        assert!(may_become_protocol_line("MEMORY[Le"));
        assert!(!may_become_protocol_line("Hej"));
        assert!(!may_become_protocol_line(""));
    }
}
