//! Requirement extraction and gap finding for deterministic evaluation.
//!
//! A requirement is one enumerated line of the task (numbered `1.`/`1)` or
//! bulleted `-`/`*`). A task without enumerated lines is split into
//! sentences instead. Each requirement is either met or not; an unmet one
//! produces exactly one gap. There is no partial credit.
//!
//! This is a deliberately literal checker: it suits tasks that spell out
//! their acceptance criteria. Nuanced judgement belongs to an LLM-backed
//! evaluator.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Gap reported for an empty or missing result.
pub const NO_RESULT_GAP: &str = "No result provided";

/// Gap reported when the task states nothing that can be checked.
pub const NO_REQUIREMENTS_GAP: &str = "No verifiable requirements in task";

// Includes the imperative verbs tasks use to introduce a requirement.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "as", "at", "be", "by", "contain", "discuss", "for", "from",
    "give", "in", "include", "into", "is", "it", "its", "list", "mention", "must", "of", "on",
    "or", "output", "provide", "respond", "return", "should", "state", "that", "the", "this",
    "to", "use", "with", "write",
];

static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\d+[.)]|[-*])\s+(\S.*?)\s*$").expect("list item regex should be valid")
});

static QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]+)"|`([^`]+)`"#).expect("quoted phrase regex should be valid")
});

static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.!?]+(?:\s+|$)|\n+").expect("sentence end regex should be valid")
});

/// Enumerated requirement lines of `task`, in order, or its sentences when
/// nothing is enumerated.
pub fn extract_requirements(task: &str) -> Vec<String> {
    let listed: Vec<String> = task
        .lines()
        .filter_map(|line| LIST_ITEM_RE.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    if !listed.is_empty() {
        return listed;
    }
    SENTENCE_END_RE
        .split(task)
        .map(str::trim)
        .filter(|sentence| sentence.chars().any(char::is_alphanumeric))
        .map(str::to_string)
        .collect()
}

/// One gap per unmet requirement, in requirement order.
///
/// An empty result short-circuits to a single [`NO_RESULT_GAP`].
pub fn find_gaps(requirements: &[String], result: &Value) -> Vec<String> {
    if is_empty_result(result) {
        return vec![NO_RESULT_GAP.to_string()];
    }
    let text = result_text(result).to_lowercase();
    requirements
        .iter()
        .filter_map(|requirement| {
            unmet_detail(requirement, result, &text)
                .map(|detail| format!("Missing requirement: {requirement} ({detail})"))
        })
        .collect()
}

pub fn is_empty_result(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// `None` when the requirement is met, otherwise why it is not.
fn unmet_detail(requirement: &str, result: &Value, text: &str) -> Option<String> {
    let lower = requirement.to_lowercase();
    if lower.contains("integer") && !is_integer(result) {
        return Some("expected an integer result".to_string());
    }
    if lower.contains("json") && !is_structured(result) {
        return Some("expected a structured JSON result".to_string());
    }

    let phrases = quoted_phrases(requirement);
    if !phrases.is_empty() {
        let missing: Vec<String> = phrases
            .into_iter()
            .filter(|phrase| !text.contains(&phrase.to_lowercase()))
            .map(|phrase| format!("\"{phrase}\""))
            .collect();
        return (!missing.is_empty()).then(|| format!("missing {}", missing.join(", ")));
    }

    // Type requirements are fully decided by the type check above.
    if lower.contains("integer") || lower.contains("json") {
        return None;
    }

    let missing: Vec<String> = key_terms(&lower)
        .into_iter()
        .filter(|term| !text.contains(term.as_str()))
        .collect();
    (!missing.is_empty()).then(|| format!("missing terms: {}", missing.join(", ")))
}

fn quoted_phrases(requirement: &str) -> Vec<String> {
    QUOTED_RE
        .captures_iter(requirement)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn key_terms(lower: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in lower.split_whitespace() {
        let term = word.trim_matches(|c: char| !c.is_alphanumeric());
        if term.is_empty() || STOP_WORDS.contains(&term) {
            continue;
        }
        if !terms.iter().any(|existing| existing == term) {
            terms.push(term.to_string());
        }
    }
    terms
}

fn result_text(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_integer(result: &Value) -> bool {
    match result {
        Value::Number(n) => n.is_i64() || n.is_u64(),
        Value::String(s) => s.trim().parse::<i128>().is_ok(),
        _ => false,
    }
}

fn is_structured(result: &Value) -> bool {
    match result {
        Value::Object(_) | Value::Array(_) => true,
        Value::String(s) => matches!(
            serde_json::from_str::<Value>(s.trim()),
            Ok(Value::Object(_) | Value::Array(_))
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reqs(task: &str) -> Vec<String> {
        extract_requirements(task)
    }

    #[test]
    fn extracts_numbered_and_bulleted_lines() {
        let task = "Write a report.\n1. Mention revenue\n2) Mention costs\n- Keep it short\n* Sign it\nNot a requirement";
        assert_eq!(
            reqs(task),
            [
                "Mention revenue",
                "Mention costs",
                "Keep it short",
                "Sign it"
            ]
        );
    }

    #[test]
    fn prose_tasks_fall_back_to_sentences() {
        assert_eq!(
            reqs("Summarize the report. Mention revenue!\nKeep the total at 2.5 or less"),
            [
                "Summarize the report",
                "Mention revenue",
                "Keep the total at 2.5 or less"
            ]
        );
        assert!(reqs("  ...\n").is_empty());
    }

    #[test]
    fn prose_integer_task_rejects_words() {
        let requirements = reqs("Return the answer to 2+2 as an integer.");
        assert_eq!(requirements, ["Return the answer to 2+2 as an integer"]);
        let gaps = find_gaps(&requirements, &json!("banana"));
        assert_eq!(gaps.len(), 1);
        assert!(gaps[0].contains("expected an integer result"));
        assert!(find_gaps(&requirements, &json!(4)).is_empty());
    }

    #[test]
    fn passes_when_every_requirement_is_met() {
        let requirements = reqs("1. Mention revenue\n2. Include the word \"profit\"");
        let gaps = find_gaps(
            &requirements,
            &json!("Revenue grew while profit stayed flat"),
        );
        assert!(gaps.is_empty(), "unexpected gaps: {gaps:?}");
    }

    #[test]
    fn fails_with_one_gap_per_unmet_requirement() {
        let requirements = reqs("1. Mention revenue\n2. Mention costs\n3. Mention headcount");
        let gaps = find_gaps(&requirements, &json!("revenue only"));
        assert_eq!(gaps.len(), 2);
        assert!(gaps[0].starts_with("Missing requirement: Mention costs"));
        assert!(gaps[1].contains("headcount"));
    }

    #[test]
    fn integer_requirement_checks_result_type() {
        let requirements = reqs("- Return the answer as an integer");
        assert!(find_gaps(&requirements, &json!(4)).is_empty());
        assert!(find_gaps(&requirements, &json!("42")).is_empty());

        let gaps = find_gaps(&requirements, &json!("four"));
        assert_eq!(gaps.len(), 1);
        assert!(gaps[0].contains("expected an integer result"));
    }

    #[test]
    fn json_requirement_accepts_objects_and_json_strings() {
        let requirements = reqs("- Respond in JSON");
        assert!(find_gaps(&requirements, &json!({"a": 1})).is_empty());
        assert!(find_gaps(&requirements, &json!("[1, 2]")).is_empty());
        assert_eq!(find_gaps(&requirements, &json!("plain text")).len(), 1);
    }

    #[test]
    fn quoted_phrases_must_match_verbatim() {
        let requirements = reqs("1. Start with `Dear team`");
        assert!(find_gaps(&requirements, &json!("Dear team, hello")).is_empty());
        let gaps = find_gaps(&requirements, &json!("Team, dear"));
        assert_eq!(gaps, ["Missing requirement: Start with `Dear team` (missing \"Dear team\")"]);
    }

    #[test]
    fn empty_result_yields_single_gap() {
        let requirements = reqs("1. Mention revenue\n2. Mention costs");
        assert_eq!(find_gaps(&requirements, &json!("   ")), [NO_RESULT_GAP]);
        assert_eq!(find_gaps(&[], &Value::Null), [NO_RESULT_GAP]);
    }
}
