pub mod backend;
pub mod dryrun;

use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use tintype_contracts::events::{payload, SessionLog};
use tintype_contracts::exif::{self, ExtractionResult};
use tintype_contracts::history::{HistoryItem, HistoryStore, ImagePayload};
use tintype_contracts::models::{
    resolve_refine_model, AspectRatio, Capability, GenerationModel, PromptMode,
};
use tintype_contracts::prompt;
use tintype_contracts::record::GenerationRecord;
use tintype_contracts::settings::PersistedSettings;

use crate::backend::{
    BackendError, BackendRegistry, GenerationBackend, ImageGenRequest, RefineRequest, TextStream,
    VideoRequest,
};

const MAX_SLUG_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    Generate,
    Refine,
    Extract,
    Describe,
    Ground,
    Video,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Refine => "refine",
            Self::Extract => "extract",
            Self::Describe => "describe",
            Self::Ground => "ground",
            Self::Video => "video",
        }
    }
}

/// One shared slot for busy-ness and one for errors, as a single tagged
/// union: at most one workflow is ever in flight or displaying a failure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkflowStatus {
    #[default]
    Idle,
    Busy(WorkflowKind),
    Error(WorkflowKind, String),
}

impl WorkflowStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(_, message) => Some(message),
            _ => None,
        }
    }
}

/// The editable input side. Transitions that carry side effects (model
/// switches, reference-image attachment) are pure functions so they can be
/// checked as (previous state, input) -> new state.
#[derive(Debug, Clone, PartialEq)]
pub struct FormState {
    pub model: GenerationModel,
    pub prompt: String,
    pub prompt_mode: PromptMode,
    pub aspect_ratio: Option<AspectRatio>,
    pub reference_images: Vec<Vec<u8>>,
    pub refinement_text: String,
}

impl Default for FormState {
    fn default() -> Self {
        Self {
            model: GenerationModel::FastEdit,
            prompt: String::new(),
            prompt_mode: PromptMode::Text,
            aspect_ratio: None,
            reference_images: Vec::new(),
            refinement_text: String::new(),
        }
    }
}

impl FormState {
    /// Switching model drops whatever the new backend cannot accept:
    /// structured prompts and reference images on high-quality, the aspect
    /// ratio everywhere else.
    pub fn with_model(mut self, model: GenerationModel) -> Self {
        self.model = model;
        if !model.supports(Capability::StructuredPrompts) {
            self.prompt_mode = PromptMode::Text;
        }
        if !model.supports(Capability::ReferenceImages) {
            self.reference_images.clear();
        }
        self.aspect_ratio = if model.supports(Capability::AspectRatio) {
            Some(self.aspect_ratio.unwrap_or(AspectRatio::Square))
        } else {
            None
        };
        self
    }

    /// Reference-image workflows speak short natural-language instructions,
    /// not structured parts: attaching one in structured mode forces freeform
    /// and starts the prompt over.
    pub fn with_reference_image(mut self, bytes: Vec<u8>) -> Self {
        if self.prompt_mode == PromptMode::Structured {
            self.prompt_mode = PromptMode::Text;
            self.prompt.clear();
        }
        self.reference_images.push(bytes);
        self
    }
}

/// Which history item(s) back the on-screen results. Single and batch are
/// mutually exclusive; ids are weak references into the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActiveSelection {
    #[default]
    None,
    Single(String),
    Batch(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultImage {
    pub item_id: String,
    pub image_index: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMetadata {
    pub record: GenerationRecord,
    pub valid: bool,
    pub message: String,
    pub editing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Found { valid: bool },
    NotFound,
}

pub struct StudioEngine {
    backends: BackendRegistry,
    log: SessionLog,
    history: HistoryStore,
    form: FormState,
    status: WorkflowStatus,
    selection: ActiveSelection,
    results: Vec<ResultImage>,
    extracted: Option<ExtractedMetadata>,
    original_prompt: Option<String>,
}

impl StudioEngine {
    pub fn new(backends: BackendRegistry, log: SessionLog) -> Self {
        Self {
            backends,
            log,
            history: HistoryStore::new(),
            form: FormState::default(),
            status: WorkflowStatus::Idle,
            selection: ActiveSelection::None,
            results: Vec::new(),
            extracted: None,
            original_prompt: None,
        }
    }

    pub fn with_history(mut self, history: HistoryStore) -> Self {
        self.history = history;
        self
    }

    pub fn status(&self) -> &WorkflowStatus {
        &self.status
    }

    pub fn form(&self) -> &FormState {
        &self.form
    }

    pub fn selection(&self) -> &ActiveSelection {
        &self.selection
    }

    pub fn results(&self) -> &[ResultImage] {
        &self.results
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn extracted(&self) -> Option<&ExtractedMetadata> {
        self.extracted.as_ref()
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    // Form fields change through this closed set of setters only.

    pub fn set_model(&mut self, model: GenerationModel) {
        let form = std::mem::take(&mut self.form);
        self.form = form.with_model(model);
    }

    pub fn set_prompt(&mut self, canonical: impl Into<String>) {
        self.form.prompt = canonical.into();
    }

    /// Structured-mode edits arrive as the bracket-stripped display form and
    /// are re-wrapped before storage.
    pub fn set_prompt_from_display(&mut self, display: &str) {
        self.form.prompt = if self.form.prompt_mode == PromptMode::Structured {
            prompt::canonical_from_display(display)
        } else {
            display.to_string()
        };
    }

    pub fn set_prompt_mode(&mut self, mode: PromptMode) {
        if mode == PromptMode::Structured
            && !self.form.model.supports(Capability::StructuredPrompts)
        {
            return;
        }
        self.form.prompt_mode = mode;
    }

    pub fn set_aspect_ratio(&mut self, ratio: Option<AspectRatio>) {
        if self.form.model.supports(Capability::AspectRatio) {
            self.form.aspect_ratio = ratio;
        }
    }

    pub fn add_reference_image(&mut self, bytes: Vec<u8>) {
        if !self.form.model.supports(Capability::ReferenceImages) {
            return;
        }
        let form = std::mem::take(&mut self.form);
        self.form = form.with_reference_image(bytes);
    }

    pub fn set_refinement_text(&mut self, text: impl Into<String>) {
        self.form.refinement_text = text.into();
    }

    /// One logical generation: K concurrent calls for K variations of one
    /// prompt, joined all-or-nothing. Returns the new history item id.
    pub fn generate(&mut self, count: u32) -> Result<String> {
        self.begin(WorkflowKind::Generate)?;
        self.reset_for_generation();

        let validation = prompt::validate(self.form.model, self.form.prompt_mode, &self.form.prompt);
        if !validation.valid {
            return Err(self.fail(WorkflowKind::Generate, validation.message));
        }

        let model = self.form.model;
        let aspect = self
            .form
            .aspect_ratio
            .filter(|_| model.supports(Capability::AspectRatio));
        let canonical = self.form.prompt.clone();
        let references = self.form.reference_images.clone();
        let Some(backend) = self.backends.get(model) else {
            return Err(self.fail(
                WorkflowKind::Generate,
                format!("no backend registered for model '{}'", model.as_str()),
            ));
        };
        let count = count.max(1) as usize;
        self.journal(
            "generation_started",
            json!({
                "model": model.as_str(),
                "mode": self.form.prompt_mode.as_str(),
                "count": count,
            }),
        );

        let outcomes = fan_out(count, |_| {
            let request = ImageGenRequest {
                prompt: &canonical,
                model,
                aspect_ratio: aspect,
                reference_images: &references,
                count: 1,
            };
            backend.generate_images(&request).and_then(first_image)
        });

        let mut images = Vec::with_capacity(count);
        for outcome in outcomes {
            match outcome {
                Ok(bytes) => images.push(bytes),
                Err(err) => return Err(self.fail(WorkflowKind::Generate, err.to_string())),
            }
        }

        let record = GenerationRecord {
            model,
            prompt: canonical.clone(),
            original_prompt: self.original_prompt.take(),
            aspect_ratio: aspect,
            prompt_mode: Some(self.form.prompt_mode),
            filename_slug: filename_slug(backend.as_ref(), &canonical),
        };
        let payloads = match self.embed_all(images, &record) {
            Ok(payloads) => payloads,
            Err(message) => return Err(self.fail(WorkflowKind::Generate, message)),
        };

        let item = HistoryItem::new(payloads, record);
        let id = item.id.clone();
        self.journal(
            "item_created",
            json!({"item_id": id, "images": item.images.len()}),
        );
        self.results = result_images(&item);
        self.history.insert(item);
        self.selection = ActiveSelection::Single(id.clone());
        self.finish();
        Ok(id)
    }

    /// N independent suggestion prompts, joined best-effort: the batch
    /// succeeds when at least one item does, and only then. History gains the
    /// successful subset in completion-dispatch order.
    pub fn generate_batch(&mut self, prompts: Vec<String>) -> Result<Vec<String>> {
        self.begin(WorkflowKind::Generate)?;
        self.reset_for_generation();

        if prompts.is_empty() {
            return Err(self.fail(WorkflowKind::Generate, "batch has no prompts"));
        }
        let model = self.form.model;
        let Some(backend) = self.backends.get(model) else {
            return Err(self.fail(
                WorkflowKind::Generate,
                format!("no backend registered for model '{}'", model.as_str()),
            ));
        };
        self.journal(
            "batch_started",
            json!({"model": model.as_str(), "count": prompts.len()}),
        );

        let settled: Vec<(usize, String, Result<Vec<u8>, BackendError>)> = {
            let (tx, rx) = mpsc::channel();
            thread::scope(|scope| {
                for (index, prompt_text) in prompts.iter().enumerate() {
                    let tx = tx.clone();
                    let backend = Arc::clone(&backend);
                    scope.spawn(move || {
                        let outcome = run_batch_item(backend.as_ref(), model, prompt_text);
                        let _ = tx.send((index, prompt_text.clone(), outcome));
                    });
                }
                drop(tx);
                rx.iter().collect()
            })
        };

        let mut ids = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for (index, prompt_text, outcome) in settled {
            let bytes = match outcome {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.journal(
                        "batch_item_failed",
                        json!({"index": index, "error": err.to_string()}),
                    );
                    failures.push(err.to_string());
                    continue;
                }
            };
            let slug = filename_slug(backend.as_ref(), &prompt_text);
            let record = GenerationRecord {
                model,
                prompt: prompt_text,
                original_prompt: None,
                aspect_ratio: None,
                prompt_mode: Some(PromptMode::Text),
                filename_slug: slug,
            };
            match self.embed_all(vec![bytes], &record) {
                Ok(payloads) => {
                    let item = HistoryItem::new(payloads, record);
                    let id = item.id.clone();
                    self.journal(
                        "item_created",
                        json!({"item_id": id, "images": item.images.len()}),
                    );
                    self.results.extend(result_images(&item));
                    self.history.insert(item);
                    ids.push(id);
                }
                Err(message) => {
                    self.journal("batch_item_failed", json!({"index": index, "error": message}));
                    failures.push(message);
                }
            }
        }

        self.journal(
            "batch_settled",
            json!({"succeeded": ids.len(), "failed": failures.len()}),
        );
        if ids.is_empty() {
            let first = failures.first().cloned().unwrap_or_default();
            return Err(self.fail(
                WorkflowKind::Generate,
                format!("all {} batch generations failed: {first}", prompts.len()),
            ));
        }
        self.selection = ActiveSelection::Batch(ids.clone());
        self.finish();
        Ok(ids)
    }

    /// Refine one image of one selected item. The item keeps its id; its
    /// image at `image_index` and its metadata are replaced. Refining
    /// high-quality output reroutes to the fast-edit backend and the new
    /// record says so in its `model` field.
    pub fn refine(
        &mut self,
        item_id: Option<&str>,
        image_index: usize,
        instruction: &str,
    ) -> Result<String> {
        self.begin(WorkflowKind::Refine)?;
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(self.fail(WorkflowKind::Refine, "refinement instruction is empty"));
        }
        let target = match (item_id, &self.selection) {
            (Some(id), _) => id.to_string(),
            (None, ActiveSelection::Single(id)) => id.clone(),
            (None, ActiveSelection::Batch(_)) => {
                return Err(self.fail(
                    WorkflowKind::Refine,
                    "a batch is active; name the item to refine",
                ))
            }
            (None, ActiveSelection::None) => {
                return Err(self.fail(WorkflowKind::Refine, "nothing selected to refine"))
            }
        };
        let in_selection = match &self.selection {
            ActiveSelection::Single(id) => *id == target,
            ActiveSelection::Batch(ids) => ids.iter().any(|id| *id == target),
            ActiveSelection::None => false,
        };
        if !in_selection {
            return Err(self.fail(
                WorkflowKind::Refine,
                "item is not part of the active selection",
            ));
        }
        let Some(item) = self.history.get(&target) else {
            return Err(self.fail(WorkflowKind::Refine, "selected item no longer exists"));
        };
        let Some(source_image) = item.images.get(image_index) else {
            return Err(self.fail(
                WorkflowKind::Refine,
                format!("selected item has no image at index {image_index}"),
            ));
        };
        let source_record = item.metadata.clone();
        let source_bytes = source_image.bytes.clone();

        let routing = resolve_refine_model(source_record.model);
        if let Some(reason) = &routing.reroute_reason {
            self.journal("refine_rerouted", json!({"reason": reason}));
        }
        let cross_model = routing.model != routing.requested;
        let new_prompt =
            prompt::append_refinement_note(&source_record.prompt, instruction, cross_model);
        let control = prompt::control_settings(&source_record.prompt);
        let Some(backend) = self.backends.get(routing.model) else {
            return Err(self.fail(
                WorkflowKind::Refine,
                format!("no backend registered for model '{}'", routing.model.as_str()),
            ));
        };
        self.journal(
            "refinement_started",
            json!({"item_id": target, "model": routing.model.as_str()}),
        );

        let request = RefineRequest {
            prompt: &new_prompt,
            reference_image: &source_bytes,
            creative_strength: control.as_ref().and_then(|c| c.creative_strength),
            style: control.as_ref().and_then(|c| c.style.clone()),
            mask: None,
        };
        let refined_bytes = match backend.refine_image(&request) {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.fail(WorkflowKind::Refine, err.to_string())),
        };

        let record = GenerationRecord {
            model: routing.model,
            prompt: new_prompt,
            original_prompt: source_record.original_prompt.clone(),
            aspect_ratio: None,
            prompt_mode: source_record.prompt_mode,
            filename_slug: source_record.filename_slug.clone(),
        };
        let embedded = match exif::embed(&refined_bytes, &record) {
            Ok(embedded) => embedded,
            Err(err) => {
                return Err(self.fail(
                    WorkflowKind::Refine,
                    format!("backend returned undecodable image data: {err}"),
                ))
            }
        };
        if let Some(warning) = &embedded.warning {
            self.journal("metadata_embed_degraded", json!({"warning": warning}));
        }
        self.history
            .replace_image_and_metadata(&target, image_index, embedded.bytes.clone(), record);
        if let Some(result) = self
            .results
            .iter_mut()
            .find(|result| result.item_id == target && result.image_index == image_index)
        {
            result.bytes = embedded.bytes;
        }
        self.form.refinement_text.clear();
        self.journal("refinement_applied", json!({"item_id": target}));
        self.finish();
        Ok(target)
    }

    pub fn extract_from_data_url(&mut self, image_data_url: &str) -> Result<ExtractionOutcome> {
        let result = exif::extract(image_data_url);
        self.settle_extraction(result)
    }

    pub fn extract_from_bytes(&mut self, bytes: &[u8]) -> Result<ExtractionOutcome> {
        let result = exif::extract_bytes(bytes);
        self.settle_extraction(result)
    }

    fn settle_extraction(&mut self, result: ExtractionResult) -> Result<ExtractionOutcome> {
        self.begin(WorkflowKind::Extract)?;
        // Fresh extraction: previous record, validity, and edit mode all go.
        self.extracted = None;

        let outcome = match result {
            ExtractionResult::Structured(record) => {
                let validation = prompt::validate(record.model, record.mode(), &record.prompt);
                let valid = validation.valid;
                self.extracted = Some(ExtractedMetadata {
                    record,
                    valid,
                    message: validation.message,
                    editing: false,
                });
                ExtractionOutcome::Found { valid }
            }
            ExtractionResult::LegacyString(text) => {
                // Pre-wrapper embeds were structured prompts from the
                // fast-edit backend, saved bare. Text that is not JSON is
                // kept, flagged, and offered for manual correction.
                let valid = serde_json::from_str::<Value>(&text).is_ok();
                let message = if valid {
                    "recovered legacy prompt".to_string()
                } else {
                    "prompt is not valid JSON".to_string()
                };
                self.extracted = Some(ExtractedMetadata {
                    record: GenerationRecord {
                        model: GenerationModel::FastEdit,
                        prompt: text,
                        original_prompt: None,
                        aspect_ratio: None,
                        prompt_mode: Some(PromptMode::Structured),
                        filename_slug: None,
                    },
                    valid,
                    message,
                    editing: false,
                });
                ExtractionOutcome::Found { valid }
            }
            ExtractionResult::NotFound => ExtractionOutcome::NotFound,
        };
        self.journal(
            "extraction_completed",
            json!({
                "found": matches!(outcome, ExtractionOutcome::Found { .. }),
                "valid": matches!(outcome, ExtractionOutcome::Found { valid: true }),
            }),
        );
        self.finish();
        Ok(outcome)
    }

    /// Leaving edit mode always re-validates before the non-editing view
    /// comes back.
    pub fn set_extracted_editing(&mut self, editing: bool) {
        if let Some(state) = self.extracted.as_mut() {
            if state.editing && !editing {
                let validation =
                    prompt::validate(state.record.model, state.record.mode(), &state.record.prompt);
                state.valid = validation.valid;
                state.message = validation.message;
            }
            state.editing = editing;
        }
    }

    /// Hand edits land through the display form while editing is on.
    pub fn set_extracted_prompt(&mut self, display: &str) -> bool {
        match self.extracted.as_mut() {
            Some(state) if state.editing => {
                state.record.prompt = if state.record.mode() == PromptMode::Structured {
                    prompt::canonical_from_display(display)
                } else {
                    display.to_string()
                };
                true
            }
            _ => false,
        }
    }

    /// Seed the form from the extracted record. Gated on validity, like the
    /// action button it backs.
    pub fn use_extracted(&mut self) -> Result<()> {
        self.set_extracted_editing(false);
        let Some(state) = self.extracted.clone() else {
            bail!("nothing extracted to use");
        };
        if !state.valid {
            bail!("extracted metadata is not usable: {}", state.message);
        }
        self.seed_form_from_record(&state.record);
        self.results.clear();
        self.selection = ActiveSelection::None;
        self.status = WorkflowStatus::Idle;
        self.journal("extracted_metadata_used", json!({}));
        Ok(())
    }

    /// Reusing a history item is a fresh start with pre-seeded fields, not a
    /// continuation: results swap to the item's images, reference images and
    /// pending refinement text clear, and so does the error slot. A stale id
    /// is a quiet `false`.
    pub fn select_history(&mut self, id: &str) -> bool {
        let Some(item) = self.history.get(id) else {
            return false;
        };
        let record = item.metadata.clone();
        let results = result_images(item);
        self.seed_form_from_record(&record);
        self.results = results;
        self.selection = ActiveSelection::Single(id.to_string());
        self.status = WorkflowStatus::Idle;
        self.journal("history_selected", json!({"item_id": id}));
        true
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.selection = ActiveSelection::None;
        self.results.clear();
        self.journal("history_cleared", json!({}));
    }

    /// Rewrite the prompt with external grounding. The rewrite becomes the
    /// canonical prompt (reuse must reproduce the same image); the user's
    /// input is kept aside for provenance display.
    pub fn ground_prompt(&mut self) -> Result<String> {
        self.begin(WorkflowKind::Ground)?;
        let user_text = self.form.prompt.trim().to_string();
        if user_text.is_empty() {
            return Err(self.fail(WorkflowKind::Ground, "prompt is empty"));
        }
        let Some(backend) = self.backends.get(self.form.model) else {
            return Err(self.fail(WorkflowKind::Ground, "no backend registered"));
        };
        let rewritten = match accumulate(backend.ground_prompt(&user_text)) {
            Ok(text) => text,
            Err(err) => return Err(self.fail(WorkflowKind::Ground, err.to_string())),
        };
        if rewritten.trim().is_empty() {
            return Err(self.fail(WorkflowKind::Ground, "grounding produced no text"));
        }
        self.original_prompt = Some(user_text);
        self.form.prompt = rewritten.clone();
        self.form.prompt_mode = PromptMode::Text;
        self.journal("prompt_grounded", json!({"chars": rewritten.len()}));
        self.finish();
        Ok(rewritten)
    }

    pub fn describe_image(&mut self, image: &[u8]) -> Result<String> {
        self.begin(WorkflowKind::Describe)?;
        let Some(backend) = self.backends.get(GenerationModel::FastEdit) else {
            return Err(self.fail(WorkflowKind::Describe, "no backend registered"));
        };
        let text = match accumulate(backend.describe_image(image)) {
            Ok(text) => text,
            Err(err) => return Err(self.fail(WorkflowKind::Describe, err.to_string())),
        };
        self.journal("image_described", json!({"chars": text.len()}));
        self.finish();
        Ok(text)
    }

    /// Drive the video status stream to its terminal event. Progress events
    /// are journaled as they arrive; a stream that ends without completing is
    /// a failure.
    pub fn generate_video(&mut self, resolution: &str) -> Result<String> {
        self.begin(WorkflowKind::Video)?;
        let prompt_text = self.form.prompt.trim().to_string();
        if prompt_text.is_empty() {
            return Err(self.fail(WorkflowKind::Video, "prompt is empty"));
        }
        let Some(backend) = self.backends.get(self.form.model) else {
            return Err(self.fail(WorkflowKind::Video, "no backend registered"));
        };
        let request = VideoRequest {
            prompt: &prompt_text,
            resolution,
            aspect_ratio: self.form.aspect_ratio,
        };
        let mut last_status = String::new();
        for event in backend.generate_video(&request) {
            match event {
                Ok(progress) => {
                    self.journal("video_progress", json!({"status": progress.status}));
                    if let Some(url) = progress.video_url {
                        self.finish();
                        return Ok(url);
                    }
                    last_status = progress.status;
                }
                Err(err) => return Err(self.fail(WorkflowKind::Video, err.to_string())),
            }
        }
        Err(self.fail(
            WorkflowKind::Video,
            format!("video stream ended without completing (last status: '{last_status}')"),
        ))
    }

    pub fn persisted_settings(&self) -> PersistedSettings {
        PersistedSettings {
            model: Some(self.form.model),
            prompt: Some(self.form.prompt.clone()),
            prompt_mode: Some(self.form.prompt_mode),
            aspect_ratio: self.form.aspect_ratio,
        }
    }

    pub fn apply_settings(&mut self, settings: &PersistedSettings) {
        if let Some(model) = settings.model {
            self.set_model(model);
        }
        if let Some(mode) = settings.prompt_mode {
            self.set_prompt_mode(mode);
        }
        if let Some(prompt_text) = &settings.prompt {
            self.form.prompt = prompt_text.clone();
        }
        if let Some(ratio) = settings.aspect_ratio {
            self.set_aspect_ratio(Some(ratio));
        }
    }

    fn seed_form_from_record(&mut self, record: &GenerationRecord) {
        self.form.model = record.model;
        self.form.prompt_mode = match record.mode() {
            PromptMode::Structured if record.model.supports(Capability::StructuredPrompts) => {
                PromptMode::Structured
            }
            _ => PromptMode::Text,
        };
        self.form.prompt = record.prompt.clone();
        self.form.aspect_ratio = record
            .aspect_ratio
            .filter(|_| record.model.supports(Capability::AspectRatio));
        self.form.reference_images.clear();
        self.form.refinement_text.clear();
        self.original_prompt = None;
    }

    /// Entering a generation is a fresh start, not an accumulation.
    fn reset_for_generation(&mut self) {
        self.results.clear();
        self.selection = ActiveSelection::None;
        self.form.refinement_text.clear();
    }

    fn embed_all(
        &self,
        images: Vec<Vec<u8>>,
        record: &GenerationRecord,
    ) -> std::result::Result<Vec<ImagePayload>, String> {
        let mut payloads = Vec::with_capacity(images.len());
        for bytes in images {
            match exif::embed(&bytes, record) {
                Ok(embedded) => {
                    if let Some(warning) = &embedded.warning {
                        self.journal("metadata_embed_degraded", json!({"warning": warning}));
                    }
                    payloads.push(ImagePayload::new(embedded.bytes));
                }
                Err(err) => {
                    return Err(format!("backend returned undecodable image data: {err}"))
                }
            }
        }
        Ok(payloads)
    }

    /// Reject any second invocation while something is in flight; the union
    /// enforces one active workflow. Starting fresh also clears the previous
    /// error message.
    fn begin(&mut self, kind: WorkflowKind) -> Result<()> {
        if let WorkflowStatus::Busy(active) = &self.status {
            bail!(
                "{} rejected: {} already in progress",
                kind.as_str(),
                active.as_str()
            );
        }
        self.status = WorkflowStatus::Busy(kind);
        Ok(())
    }

    fn fail(&mut self, kind: WorkflowKind, message: impl Into<String>) -> anyhow::Error {
        let message = message.into();
        self.journal(
            "workflow_failed",
            json!({"workflow": kind.as_str(), "error": message}),
        );
        self.status = WorkflowStatus::Error(kind, message.clone());
        anyhow!(message)
    }

    fn finish(&mut self) {
        self.status = WorkflowStatus::Idle;
    }

    /// The journal never blocks a workflow; a failed write is dropped.
    fn journal(&self, event: &str, body: Value) {
        let _ = self.log.emit(event, payload(body));
    }

    #[cfg(test)]
    fn force_status(&mut self, status: WorkflowStatus) {
        self.status = status;
    }
}

fn result_images(item: &HistoryItem) -> Vec<ResultImage> {
    item.images
        .iter()
        .enumerate()
        .map(|(image_index, image)| ResultImage {
            item_id: item.id.clone(),
            image_index,
            bytes: image.bytes.clone(),
        })
        .collect()
}

fn run_batch_item(
    backend: &dyn GenerationBackend,
    model: GenerationModel,
    prompt_text: &str,
) -> std::result::Result<Vec<u8>, BackendError> {
    if prompt_text.trim().is_empty() {
        return Err(BackendError::MalformedInput(
            "suggestion prompt is empty".to_string(),
        ));
    }
    let request = ImageGenRequest {
        prompt: prompt_text,
        model,
        aspect_ratio: None,
        reference_images: &[],
        count: 1,
    };
    backend.generate_images(&request).and_then(first_image)
}

fn first_image(images: Vec<Vec<u8>>) -> std::result::Result<Vec<u8>, BackendError> {
    images
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::NoOutput("backend returned an empty image set".to_string()))
}

fn fan_out<T, F>(count: usize, job: F) -> Vec<std::result::Result<T, BackendError>>
where
    T: Send,
    F: Fn(usize) -> std::result::Result<T, BackendError> + Sync,
{
    thread::scope(|scope| {
        let job = &job;
        let handles: Vec<_> = (0..count)
            .map(|index| scope.spawn(move || job(index)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(BackendError::Unavailable(
                        "generation worker panicked".to_string(),
                    ))
                })
            })
            .collect()
    })
}

fn accumulate(stream: TextStream) -> std::result::Result<String, BackendError> {
    let mut text = String::new();
    for chunk in stream {
        text.push_str(&chunk?);
    }
    Ok(text)
}

fn filename_slug(backend: &dyn GenerationBackend, prompt_text: &str) -> Option<String> {
    let candidate = match backend.summarize_for_filename(prompt_text) {
        Ok(summary) => slugify(&summary),
        Err(_) => slugify(prompt_text),
    };
    if candidate.is_empty() {
        None
    } else {
        Some(candidate)
    }
}

/// Deterministic local slug: lowercase, non-word characters stripped,
/// hyphenated, truncated at a word boundary.
pub fn slugify(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            cleaned.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() || ch == '-' || ch == '_' {
            cleaned.push(' ');
        }
    }
    let mut slug = cleaned.split_whitespace().collect::<Vec<&str>>().join("-");
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        if let Some(cut) = slug.rfind('-') {
            slug.truncate(cut);
        }
    }
    slug
}

/// Download name for one image of an item: the record's slug when present,
/// otherwise an id-derived base so absence never breaks naming.
pub fn download_basename(item: &HistoryItem, image_index: usize) -> String {
    let base = item
        .metadata
        .filename_slug
        .clone()
        .unwrap_or_else(|| format!("generation-{}", short_hash(&item.id)));
    format!("{}-{}.jpg", base, image_index + 1)
}

fn short_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..4])
}
