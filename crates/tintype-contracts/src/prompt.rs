use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{GenerationModel, PromptMode};

pub const NEGATIVE_PROMPT_PREFIX: &str = "Negative prompt: ";

const NOTE_LABEL: &str = "Refinement";
const CROSS_MODEL_NOTE_LABEL: &str = "Refinement (from high-quality output)";

/// One element of a structured prompt: either literal text (negative prompts
/// are text parts carrying the `Negative prompt: ` prefix) or a control block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPart {
    Text { text: String },
    Control { control: ControlPart },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creative_strength: Option<f64>,
}

impl PromptPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn negative(text: &str) -> Self {
        Self::Text {
            text: format!("{NEGATIVE_PROMPT_PREFIX}{text}"),
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, Self::Text { text } if text.starts_with(NEGATIVE_PROMPT_PREFIX))
    }
}

pub fn parse_parts(canonical: &str) -> Option<Vec<PromptPart>> {
    serde_json::from_str(canonical).ok()
}

pub fn serialize_parts(parts: &[PromptPart]) -> anyhow::Result<String> {
    Ok(serde_json::to_string(parts)?)
}

/// First control part wins; freshly produced prompts never carry more than
/// one.
pub fn control_settings(canonical: &str) -> Option<ControlPart> {
    parse_parts(canonical)?.into_iter().find_map(|part| match part {
        PromptPart::Control { control } => Some(control),
        PromptPart::Text { .. } => None,
    })
}

/// The editing surface shows a structured prompt without its enclosing
/// brackets. Strips exactly one layer; anything else passes through.
pub fn display_form(canonical: &str) -> String {
    let trimmed = canonical.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('[') && trimmed.ends_with(']') {
        return trimmed[1..trimmed.len() - 1].to_string();
    }
    trimmed.to_string()
}

/// Re-wrap an edited display form. The stored form is always a syntactically
/// complete array; whether its contents parse is checked by `validate`.
pub fn canonical_from_display(display: &str) -> String {
    format!("[{}]", display.trim())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub message: String,
}

/// Gates "use this metadata" and "apply edit". Structured prompts on the
/// fast-edit backend must parse as JSON; everything else just needs text.
pub fn validate(model: GenerationModel, mode: PromptMode, prompt: &str) -> Validation {
    if mode == PromptMode::Structured && model == GenerationModel::FastEdit {
        return if serde_json::from_str::<Value>(prompt).is_ok() {
            Validation {
                valid: true,
                message: "valid JSON prompt".to_string(),
            }
        } else {
            Validation {
                valid: false,
                message: "prompt is not valid JSON".to_string(),
            }
        };
    }
    if prompt.trim().is_empty() {
        Validation {
            valid: false,
            message: "prompt is empty".to_string(),
        }
    } else {
        Validation {
            valid: true,
            message: "ok".to_string(),
        }
    }
}

/// Refinement appends; it never rewrites. Each step adds one delimited block
/// so the full lineage of instructions stays readable in the stored prompt.
pub fn append_refinement_note(prompt: &str, instruction: &str, cross_model: bool) -> String {
    let label = if cross_model {
        CROSS_MODEL_NOTE_LABEL
    } else {
        NOTE_LABEL
    };
    format!("{prompt}\n\n--- {label} ---\n{instruction}")
}
