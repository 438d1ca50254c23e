use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use tintype_contracts::models::{AspectRatio, GenerationModel};

/// Classified failure from the generation backend. The engine renders these
/// into the user-facing error slot; the classification is the contract, the
/// message is free text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("blocked by content policy: {0}")]
    PolicyBlocked(String),
    #[error("malformed request: {0}")]
    MalformedInput(String),
    #[error("no output produced: {0}")]
    NoOutput(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct ImageGenRequest<'a> {
    pub prompt: &'a str,
    pub model: GenerationModel,
    pub aspect_ratio: Option<AspectRatio>,
    pub reference_images: &'a [Vec<u8>],
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct RefineRequest<'a> {
    pub prompt: &'a str,
    pub reference_image: &'a [u8],
    pub creative_strength: Option<f64>,
    pub style: Option<String>,
    pub mask: Option<&'a [u8]>,
}

#[derive(Debug, Clone)]
pub struct VideoRequest<'a> {
    pub prompt: &'a str,
    pub resolution: &'a str,
    pub aspect_ratio: Option<AspectRatio>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoProgress {
    pub status: String,
    pub video_url: Option<String>,
}

impl VideoProgress {
    pub fn progress(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            video_url: None,
        }
    }

    pub fn completed(video_url: impl Into<String>) -> Self {
        Self {
            status: "Completed".to_string(),
            video_url: Some(video_url.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.video_url.is_some()
    }
}

/// Incremental text, consumed by concatenation in arrival order.
pub type TextStream = Box<dyn Iterator<Item = Result<String, BackendError>>>;
/// Zero-or-more progress events, then a terminal completion or an error.
pub type VideoStream = Box<dyn Iterator<Item = Result<VideoProgress, BackendError>>>;

/// The external generative service, reduced to the calls the studio makes.
/// Implementations are blocking; the engine owns all fan-out.
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn generate_images(&self, request: &ImageGenRequest<'_>) -> Result<Vec<Vec<u8>>, BackendError>;

    fn refine_image(&self, request: &RefineRequest<'_>) -> Result<Vec<u8>, BackendError>;

    fn describe_image(&self, image: &[u8]) -> TextStream;

    fn ground_prompt(&self, user_text: &str) -> TextStream;

    fn generate_video(&self, request: &VideoRequest<'_>) -> VideoStream;

    /// Best effort; callers fall back to local slugification on failure.
    fn summarize_for_filename(&self, prompt: &str) -> Result<String, BackendError>;
}

#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<&'static str, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: GenerationModel, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(model.as_str(), backend);
    }

    pub fn get(&self, model: GenerationModel) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(model.as_str()).cloned()
    }

    pub fn models(&self) -> Vec<&'static str> {
        self.backends.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend;

    impl GenerationBackend for NullBackend {
        fn name(&self) -> &str {
            "null"
        }

        fn generate_images(
            &self,
            _request: &ImageGenRequest<'_>,
        ) -> Result<Vec<Vec<u8>>, BackendError> {
            Err(BackendError::NoOutput("null backend".to_string()))
        }

        fn refine_image(&self, _request: &RefineRequest<'_>) -> Result<Vec<u8>, BackendError> {
            Err(BackendError::NoOutput("null backend".to_string()))
        }

        fn describe_image(&self, _image: &[u8]) -> TextStream {
            Box::new(std::iter::empty())
        }

        fn ground_prompt(&self, _user_text: &str) -> TextStream {
            Box::new(std::iter::empty())
        }

        fn generate_video(&self, _request: &VideoRequest<'_>) -> VideoStream {
            Box::new(std::iter::empty())
        }

        fn summarize_for_filename(&self, _prompt: &str) -> Result<String, BackendError> {
            Err(BackendError::Unavailable("null backend".to_string()))
        }
    }

    #[test]
    fn registry_resolves_by_model() {
        let mut registry = BackendRegistry::new();
        registry.register(GenerationModel::FastEdit, Arc::new(NullBackend));
        assert!(registry.get(GenerationModel::FastEdit).is_some());
        assert!(registry.get(GenerationModel::HighQuality).is_none());
        assert_eq!(registry.models(), vec!["fast-edit"]);
    }

    #[test]
    fn error_messages_carry_the_classification() {
        let err = BackendError::PolicyBlocked("safety filter".to_string());
        assert_eq!(err.to_string(), "blocked by content policy: safety filter");
    }

    #[test]
    fn video_progress_terminality() {
        assert!(!VideoProgress::progress("Rendering").is_terminal());
        let done = VideoProgress::completed("https://example.test/video.mp4");
        assert!(done.is_terminal());
        assert_eq!(done.status, "Completed");
    }
}
