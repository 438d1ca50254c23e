use std::path::Path;

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use similar::TextDiff;
use uuid::Uuid;

use crate::exif;
use crate::record::GenerationRecord;

/// One generated image. Held as raw JPEG bytes in memory; persisted as the
/// data-URL string the browser-era history format used, so old files load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn data_url(&self) -> String {
        exif::to_data_url(&self.bytes)
    }
}

impl Serialize for ImagePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.data_url())
    }
}

impl<'de> Deserialize<'de> for ImagePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = exif::decode_data_url(&raw)
            .ok_or_else(|| D::Error::custom("image payload is not a base64 data URL"))?;
        Ok(Self { bytes })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    pub images: Vec<ImagePayload>,
    pub timestamp: String,
    pub metadata: GenerationRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_diff: Option<Vec<String>>,
}

impl HistoryItem {
    pub fn new(images: Vec<ImagePayload>, metadata: GenerationRecord) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            images,
            timestamp: now_utc_iso(),
            metadata,
            prompt_diff: None,
        }
    }
}

/// Append-ordered, lookup-by-id collection of past generations. Newest first;
/// items live until an explicit clear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryStore {
    items: IndexMap<String, HistoryItem>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: HistoryItem) -> String {
        let id = item.id.clone();
        self.items.shift_insert(0, id.clone(), item);
        id
    }

    /// A stale id is an expected outcome, not an error.
    pub fn get(&self, id: &str) -> Option<&HistoryItem> {
        self.items.get(id)
    }

    /// Refinement swaps one image and the item-level metadata in place,
    /// recording a unified diff of the prompt lineage.
    pub fn replace_image_and_metadata(
        &mut self,
        id: &str,
        image_index: usize,
        bytes: Vec<u8>,
        metadata: GenerationRecord,
    ) -> bool {
        let Some(item) = self.items.get_mut(id) else {
            return false;
        };
        let Some(slot) = item.images.get_mut(image_index) else {
            return false;
        };
        *slot = ImagePayload::new(bytes);
        item.prompt_diff = prompt_diff(&item.metadata.prompt, &metadata.prompt);
        item.metadata = metadata;
        true
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Recency order: newest first.
    pub fn items(&self) -> impl Iterator<Item = &HistoryItem> {
        self.items.values()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rows: Vec<&HistoryItem> = self.items.values().collect();
        std::fs::write(path, serde_json::to_string_pretty(&rows)?)?;
        Ok(())
    }

    /// Tolerant: a missing or malformed file is an empty history, and any
    /// individually malformed row is skipped rather than poisoning the rest.
    pub fn load(path: &Path) -> Self {
        let mut store = Self::new();
        let Ok(raw) = std::fs::read_to_string(path) else {
            return store;
        };
        let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
            return store;
        };
        let Some(rows) = parsed.as_array() else {
            return store;
        };
        for row in rows {
            if let Ok(item) = serde_json::from_value::<HistoryItem>(row.clone()) {
                store.items.insert(item.id.clone(), item);
            }
        }
        store
    }
}

fn prompt_diff(prev: &str, curr: &str) -> Option<Vec<String>> {
    if prev == curr {
        return None;
    }
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    Some(rendered.lines().map(str::to_string).collect())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
