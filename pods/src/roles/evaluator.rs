//! Deterministic requirement evaluator.

use async_trait::async_trait;
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::requirements::{
    NO_REQUIREMENTS_GAP, NO_RESULT_GAP, extract_requirements, find_gaps, is_empty_result,
};
use crate::core::types::{Instruction, ResultDoc, Verdict};
use crate::roles::Evaluator;

/// Checks a result against the requirements of the task and, when present,
/// the instruction's JSON Schema. A task with neither fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequirementEvaluator;

impl RequirementEvaluator {
    pub fn judge(instruction: &Instruction, result: &ResultDoc) -> Verdict {
        if is_empty_result(&result.result) {
            return Verdict::Fail(vec![NO_RESULT_GAP.to_string()]);
        }

        let mut gaps = Vec::new();
        if let Some(schema) = &instruction.schema {
            gaps.extend(schema_gaps(schema, &result.result));
        }
        let requirements = extract_requirements(instruction.requirements_text());
        if requirements.is_empty() && instruction.schema.is_none() {
            return Verdict::Fail(vec![NO_REQUIREMENTS_GAP.to_string()]);
        }
        gaps.extend(find_gaps(&requirements, &result.result));

        debug!(
            attempt = instruction.attempt,
            requirements = requirements.len(),
            gaps = gaps.len(),
            "requirements evaluated"
        );
        Verdict::from_gaps(gaps)
    }
}

#[async_trait]
impl Evaluator for RequirementEvaluator {
    async fn evaluate(&self, instruction: &Instruction, result: &ResultDoc) -> Verdict {
        Self::judge(instruction, result)
    }
}

fn schema_gaps(schema: &Value, result: &Value) -> Vec<String> {
    let validator = match validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            warn!(err = %err, "invalid result schema");
            return vec![format!("Result schema is invalid: {err}")];
        }
    };
    let gaps: Vec<String> = validator
        .iter_errors(result)
        .map(|err| format!("Result does not match schema: {err}"))
        .collect();
    if gaps.is_empty() {
        return gaps;
    }
    // Workers that print JSON hand it over as a string.
    if let Value::String(s) = result
        && let Ok(parsed) = serde_json::from_str::<Value>(s.trim())
        && validator.is_valid(&parsed)
    {
        return Vec::new();
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instruction(task: &str, schema: Option<Value>) -> Instruction {
        Instruction {
            task: task.to_string(),
            output_path: "result.json".to_string(),
            attempt: 1,
            schema,
        }
    }

    fn doc(result: Value) -> ResultDoc {
        ResultDoc { result }
    }

    #[test]
    fn passes_when_requirements_and_schema_hold() {
        let verdict = RequirementEvaluator::judge(
            &instruction(
                "1. Mention revenue",
                Some(json!({"type": "object", "required": ["summary"]})),
            ),
            &doc(json!({"summary": "revenue is up"})),
        );
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn schema_violations_are_gaps() {
        let verdict = RequirementEvaluator::judge(
            &instruction(
                "Return a summary.",
                Some(json!({"type": "object", "required": ["summary"]})),
            ),
            &doc(json!({"notes": "summary pending"})),
        );
        let gaps = verdict.gaps();
        assert_eq!(gaps.len(), 1);
        assert!(gaps[0].starts_with("Result does not match schema"));
    }

    #[test]
    fn json_strings_are_validated_as_json() {
        let verdict = RequirementEvaluator::judge(
            &instruction("Return the list as JSON.", Some(json!({"type": "array"}))),
            &doc(json!("[1, 2, 3]")),
        );
        assert!(verdict.is_pass());
    }

    #[test]
    fn empty_result_fails_with_single_gap() {
        let verdict =
            RequirementEvaluator::judge(&instruction("1. Mention revenue", None), &doc(json!("")));
        assert_eq!(verdict, Verdict::Fail(vec![NO_RESULT_GAP.to_string()]));
    }

    #[test]
    fn prose_task_is_checked_not_waved_through() {
        let verdict = RequirementEvaluator::judge(
            &instruction("Return the answer to 2+2 as an integer.", None),
            &doc(json!("banana")),
        );
        assert!(!verdict.is_pass());
        assert!(verdict.gaps()[0].contains("expected an integer result"));
    }

    #[test]
    fn task_without_requirements_or_schema_fails() {
        let verdict = RequirementEvaluator::judge(&instruction("...", None), &doc(json!("anything")));
        assert_eq!(verdict, Verdict::Fail(vec![NO_REQUIREMENTS_GAP.to_string()]));

        let verdict = RequirementEvaluator::judge(
            &instruction("", Some(json!({"type": "integer"}))),
            &doc(json!(4)),
        );
        assert!(verdict.is_pass());
    }

    /// Gaps quoted back in retry feedback never become requirements.
    #[test]
    fn feedback_sections_are_not_requirements() {
        let task = format!(
            "1. Mention revenue\n\n{}\nAttempt 1:\n- Missing requirement: something else",
            crate::core::types::FEEDBACK_HEADING
        );
        let verdict =
            RequirementEvaluator::judge(&instruction(&task, None), &doc(json!("revenue up")));
        assert!(verdict.is_pass());
    }
}
