use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{AspectRatio, GenerationModel, PromptMode};

/// The metadata unit embedded into a generated image and recovered from a
/// re-uploaded one. Field names are the historical camelCase wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    pub model: GenerationModel,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<AspectRatio>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_mode: Option<PromptMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_slug: Option<String>,
}

impl GenerationRecord {
    pub fn new(model: GenerationModel, prompt: impl Into<String>) -> Self {
        Self {
            model,
            prompt: prompt.into(),
            original_prompt: None,
            aspect_ratio: None,
            prompt_mode: None,
            filename_slug: None,
        }
    }

    pub fn to_tag_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an embedded tag as a record. Anything short of an object with a
    /// non-empty `model` and `prompt` is rejected; callers fall back to the
    /// legacy-string path with the raw text intact.
    pub fn from_tag_json(raw: &str) -> Option<Self> {
        let parsed: Value = serde_json::from_str(raw).ok()?;
        let obj = parsed.as_object()?;
        let model = obj.get("model").and_then(Value::as_str)?;
        let prompt = obj.get("prompt").and_then(Value::as_str)?;
        if model.trim().is_empty() || prompt.trim().is_empty() {
            return None;
        }
        serde_json::from_value(parsed).ok()
    }

    pub fn mode(&self) -> PromptMode {
        self.prompt_mode.unwrap_or(PromptMode::Text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_json_round_trips_all_fields() -> anyhow::Result<()> {
        let record = GenerationRecord {
            model: GenerationModel::HighQuality,
            prompt: "a lighthouse at dusk".to_string(),
            original_prompt: Some("lighthouse".to_string()),
            aspect_ratio: Some(AspectRatio::Widescreen),
            prompt_mode: Some(PromptMode::Text),
            filename_slug: Some("lighthouse-at-dusk".to_string()),
        };
        let raw = record.to_tag_json()?;
        assert!(raw.contains("\"originalPrompt\""));
        assert!(raw.contains("\"aspectRatio\":\"16:9\""));
        let parsed = GenerationRecord::from_tag_json(&raw).expect("round trip");
        assert_eq!(parsed, record);
        Ok(())
    }

    #[test]
    fn optional_fields_are_omitted_not_null() -> anyhow::Result<()> {
        let raw = GenerationRecord::new(GenerationModel::FastEdit, "a fox").to_tag_json()?;
        assert!(!raw.contains("originalPrompt"));
        assert!(!raw.contains("aspectRatio"));
        assert!(!raw.contains("filenameSlug"));
        Ok(())
    }

    #[test]
    fn rejects_missing_or_empty_required_fields() {
        assert!(GenerationRecord::from_tag_json("not json at all").is_none());
        assert!(GenerationRecord::from_tag_json("[{\"text\":\"bare parts\"}]").is_none());
        assert!(GenerationRecord::from_tag_json("{\"prompt\":\"no model\"}").is_none());
        assert!(
            GenerationRecord::from_tag_json("{\"model\":\"\",\"prompt\":\"empty model\"}")
                .is_none()
        );
        assert!(
            GenerationRecord::from_tag_json("{\"model\":\"fast-edit\",\"prompt\":\"  \"}")
                .is_none()
        );
    }

    #[test]
    fn rejects_unknown_model_names() {
        let raw = "{\"model\":\"imagen-99\",\"prompt\":\"a fox\"}";
        assert!(GenerationRecord::from_tag_json(raw).is_none());
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let raw = "{\"model\":\"fast-edit\",\"prompt\":\"a fox\"}";
        let parsed = GenerationRecord::from_tag_json(raw).expect("minimal record");
        assert_eq!(parsed.model, GenerationModel::FastEdit);
        assert_eq!(parsed.mode(), PromptMode::Text);
        assert!(parsed.aspect_ratio.is_none());
    }
}
