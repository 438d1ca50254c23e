use serde::{Deserialize, Serialize};

/// The two generation backends a record can point at. The wire names are the
/// historical embedded values; old images must keep deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationModel {
    #[serde(rename = "fast-edit")]
    FastEdit,
    #[serde(rename = "high-quality")]
    HighQuality,
}

impl GenerationModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastEdit => "fast-edit",
            Self::HighQuality => "high-quality",
        }
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        match self {
            Self::FastEdit => ModelCapabilities {
                structured_prompts: true,
                reference_images: true,
                refine: true,
                aspect_ratio: false,
            },
            Self::HighQuality => ModelCapabilities {
                structured_prompts: false,
                reference_images: false,
                refine: false,
                aspect_ratio: true,
            },
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        let caps = self.capabilities();
        match capability {
            Capability::StructuredPrompts => caps.structured_prompts,
            Capability::ReferenceImages => caps.reference_images,
            Capability::Refine => caps.refine,
            Capability::AspectRatio => caps.aspect_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    StructuredPrompts,
    ReferenceImages,
    Refine,
    AspectRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub structured_prompts: bool,
    pub reference_images: bool,
    pub refine: bool,
    pub aspect_ratio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefineRouting {
    pub model: GenerationModel,
    pub requested: GenerationModel,
    pub reroute_reason: Option<String>,
}

/// Refinement always runs on a backend that supports it. Asking to refine
/// high-quality output routes to the fast-edit backend, and the routing
/// carries an explanation so the reattribution is visible in the journal.
pub fn resolve_refine_model(source: GenerationModel) -> RefineRouting {
    if source.supports(Capability::Refine) {
        return RefineRouting {
            model: source,
            requested: source,
            reroute_reason: None,
        };
    }
    RefineRouting {
        model: GenerationModel::FastEdit,
        requested: source,
        reroute_reason: Some(format!(
            "Model '{}' cannot refine; rerouting to '{}'.",
            source.as_str(),
            GenerationModel::FastEdit.as_str()
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Widescreen,
    #[serde(rename = "9:16")]
    Vertical,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "3:4")]
    Portrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Widescreen => "16:9",
            Self::Vertical => "9:16",
            Self::Landscape => "4:3",
            Self::Portrait => "3:4",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1:1" => Some(Self::Square),
            "16:9" => Some(Self::Widescreen),
            "9:16" => Some(Self::Vertical),
            "4:3" => Some(Self::Landscape),
            "3:4" => Some(Self::Portrait),
            _ => None,
        }
    }

    /// Pixel dimensions used by local backends when synthesizing output.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Square => (1024, 1024),
            Self::Widescreen => (1344, 768),
            Self::Vertical => (768, 1344),
            Self::Landscape => (1184, 864),
            Self::Portrait => (864, 1184),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    Text,
    Structured,
}

impl PromptMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Structured => "structured",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refine_routing_keeps_fast_edit() {
        let routing = resolve_refine_model(GenerationModel::FastEdit);
        assert_eq!(routing.model, GenerationModel::FastEdit);
        assert!(routing.reroute_reason.is_none());
    }

    #[test]
    fn refine_routing_reroutes_high_quality() {
        let routing = resolve_refine_model(GenerationModel::HighQuality);
        assert_eq!(routing.model, GenerationModel::FastEdit);
        assert_eq!(routing.requested, GenerationModel::HighQuality);
        assert_eq!(
            routing.reroute_reason.as_deref(),
            Some("Model 'high-quality' cannot refine; rerouting to 'fast-edit'.")
        );
    }

    #[test]
    fn model_wire_names_are_stable() {
        let encoded = serde_json::to_string(&GenerationModel::FastEdit).unwrap();
        assert_eq!(encoded, "\"fast-edit\"");
        let decoded: GenerationModel = serde_json::from_str("\"high-quality\"").unwrap();
        assert_eq!(decoded, GenerationModel::HighQuality);
    }

    #[test]
    fn aspect_ratio_parse_round_trips() {
        for ratio in [
            AspectRatio::Square,
            AspectRatio::Widescreen,
            AspectRatio::Vertical,
            AspectRatio::Landscape,
            AspectRatio::Portrait,
        ] {
            assert_eq!(AspectRatio::parse(ratio.as_str()), Some(ratio));
        }
        assert_eq!(AspectRatio::parse("2:1"), None);
    }
}
