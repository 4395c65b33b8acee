//! Salvage of structured data from free-form model responses.
//!
//! Models routinely wrap JSON in markdown fences, prepend narrative, or leak
//! reasoning-trace markup (`<think>...</think>`). The repair pass strips that
//! wrapping and extracts the first balanced object before re-parsing.

use regex::Regex;
use std::sync::OnceLock;

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"))
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("valid regex"))
}

/// Strip reasoning-trace markup, markdown fences, and surrounding narrative
/// from a response that is expected to contain a JSON object.
///
/// Returns the best candidate substring; the caller decides whether it
/// actually parses.
pub fn repair_json(raw: &str) -> String {
    let without_think = think_re().replace_all(raw, "");

    let candidate = match fence_re().captures(&without_think) {
        Some(caps) => caps[1].to_string(),
        None => without_think.into_owned(),
    };

    // Fall back to the first { ... last } span to drop narrative around the
    // object.
    match (candidate.find('{'), candidate.rfind('}')) {
        (Some(start), Some(end)) if start < end => candidate[start..=end].trim().to_string(),
        _ => candidate.trim().to_string(),
    }
}

/// Parse a model response as a JSON object, applying [`repair_json`] when the
/// direct parse fails.
pub fn parse_or_repair(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    match serde_json::from_str(raw) {
        Ok(value) => Ok(value),
        Err(_) => serde_json::from_str(&repair_json(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_passes_through() {
        let value = parse_or_repair(r#"{"action": "SUBMIT"}"#).unwrap();
        assert_eq!(value["action"], "SUBMIT");
    }

    #[test]
    fn test_strips_code_fence() {
        let raw = "```json\n{\"action\": \"READ_DOC\"}\n```";
        let value = parse_or_repair(raw).unwrap();
        assert_eq!(value["action"], "READ_DOC");
    }

    #[test]
    fn test_strips_bare_fence() {
        let raw = "```\n{\"a\": 1}\n```";
        let value = parse_or_repair(raw).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_strips_think_block() {
        let raw = "<think>let me reason\nabout this</think>{\"a\": 2}";
        let value = parse_or_repair(raw).unwrap();
        assert_eq!(value["a"], 2);
    }

    #[test]
    fn test_extracts_object_from_narrative() {
        let raw = "Sure! Here is the result:\n{\"b\": {\"c\": 3}}\nHope that helps.";
        let value = parse_or_repair(raw).unwrap();
        assert_eq!(value["b"]["c"], 3);
    }

    #[test]
    fn test_think_then_fenced_object() {
        let raw = "<think>hmm</think>\n```json\n{\"ok\": true}\n```";
        let value = parse_or_repair(raw).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_unsalvageable_is_error() {
        assert!(parse_or_repair("no structured data here").is_err());
    }
}
