use std::io::Cursor;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;

use crate::record::GenerationRecord;

/// What came back out of an uploaded image. Extraction classifies; it never
/// fails on untrusted bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResult {
    Structured(GenerationRecord),
    LegacyString(String),
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedded {
    pub bytes: Vec<u8>,
    /// Present when the EXIF write was skipped; the image is still usable and
    /// the caller journals the degradation instead of surfacing it.
    pub warning: Option<String>,
}

/// Normalize any decodable raster to JPEG and write the record into the
/// 0th-IFD image-description tag. That tag round-trips arbitrary-length UTF-8,
/// unlike the comment tags with their stricter encodings.
///
/// Decode failure is a hard error: there is no image to hand back. A failed
/// tag write is not: the caller gets the bare JPEG plus a warning.
pub fn embed(image_bytes: &[u8], record: &GenerationRecord) -> anyhow::Result<Embedded> {
    let decoded = image::load_from_memory(image_bytes).context("decoding source image")?;
    // JPEG has no alpha channel; flatten before encoding.
    let flattened = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut jpeg = Vec::new();
    flattened
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .context("encoding JPEG output")?;

    let tag_json = record.to_tag_json()?;
    let warning = match write_description_tag(&mut jpeg, &tag_json) {
        Ok(()) => None,
        Err(reason) => Some(reason),
    };
    Ok(Embedded { bytes: jpeg, warning })
}

/// Write `text` as the image-description tag of a JPEG byte stream, in place.
/// Low-level: `embed` is the normal entry point; this exists for tooling that
/// needs to write a foreign description. The writer runs against a scratch
/// copy so a mid-write failure cannot leave the stream half-tagged, and
/// little_exif is known to panic on some inputs, so the call is fenced.
pub fn write_description_tag(jpeg: &mut Vec<u8>, text: &str) -> Result<(), String> {
    let mut metadata = Metadata::new();
    metadata.set_tag(ExifTag::ImageDescription(text.to_string()));

    let mut tagged = jpeg.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        metadata.write_to_vec(&mut tagged, FileExtension::JPEG)
    }));
    match outcome {
        Ok(Ok(_)) => {
            *jpeg = tagged;
            Ok(())
        }
        Ok(Err(err)) => Err(format!("exif write failed: {err}")),
        Err(_) => Err("exif writer panicked".to_string()),
    }
}

/// Read the image-description tag back out and classify it. Absent tag,
/// absent EXIF segment, non-image bytes: all `NotFound`. An unrecognized
/// upload is an expected case, not an exceptional one.
pub fn extract_bytes(bytes: &[u8]) -> ExtractionResult {
    let mut cursor = Cursor::new(bytes);
    let parsed = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(parsed) => parsed,
        Err(_) => return ExtractionResult::NotFound,
    };
    let Some(field) = parsed.get_field(exif::Tag::ImageDescription, exif::In::PRIMARY) else {
        return ExtractionResult::NotFound;
    };
    let raw = match &field.value {
        exif::Value::Ascii(rows) => rows
            .iter()
            .map(|row| String::from_utf8_lossy(row).to_string())
            .collect::<Vec<String>>()
            .join(""),
        _ => field.display_value().to_string(),
    };
    let raw = raw.trim_matches(char::from(0)).trim().to_string();
    if raw.is_empty() {
        return ExtractionResult::NotFound;
    }
    match GenerationRecord::from_tag_json(&raw) {
        Some(record) => ExtractionResult::Structured(record),
        None => ExtractionResult::LegacyString(raw),
    }
}

/// Data-URL front end for `extract_bytes`, matching what the upload layer
/// hands over. Anything that is not a base64 data URL is `NotFound`.
pub fn extract(image_data_url: &str) -> ExtractionResult {
    match decode_data_url(image_data_url) {
        Some(bytes) => extract_bytes(&bytes),
        None => ExtractionResult::NotFound,
    }
}

pub fn decode_data_url(input: &str) -> Option<Vec<u8>> {
    let rest = input.strip_prefix("data:")?;
    let (_, payload) = rest.split_once(";base64,")?;
    BASE64.decode(payload.trim()).ok()
}

pub fn to_data_url(jpeg_bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg_bytes))
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use crate::models::{AspectRatio, GenerationModel, PromptMode};
    use crate::prompt;

    use super::*;

    fn solid_jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb(color);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .expect("encode fixture");
        bytes
    }

    fn solid_png(width: u32, height: u32) -> Vec<u8> {
        let canvas = RgbImage::new(width, height);
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode fixture");
        bytes
    }

    #[test]
    fn embed_extract_round_trips_every_field_combination() -> anyhow::Result<()> {
        let source = solid_jpeg(64, 64, [12, 200, 90]);
        let combos = [
            GenerationRecord {
                model: GenerationModel::FastEdit,
                prompt: "[{\"text\":\"a red fox\"}]".to_string(),
                original_prompt: None,
                aspect_ratio: None,
                prompt_mode: Some(PromptMode::Structured),
                filename_slug: Some("a-red-fox".to_string()),
            },
            GenerationRecord {
                model: GenerationModel::FastEdit,
                prompt: "a plain fox".to_string(),
                original_prompt: Some("fox pls".to_string()),
                aspect_ratio: None,
                prompt_mode: Some(PromptMode::Text),
                filename_slug: None,
            },
            GenerationRecord {
                model: GenerationModel::HighQuality,
                prompt: "a lighthouse at dusk".to_string(),
                original_prompt: None,
                aspect_ratio: Some(AspectRatio::Widescreen),
                prompt_mode: Some(PromptMode::Text),
                filename_slug: Some("lighthouse".to_string()),
            },
        ];
        for record in combos {
            let embedded = embed(&source, &record)?;
            assert!(embedded.warning.is_none(), "unexpected degrade: {embedded:?}");
            match extract_bytes(&embedded.bytes) {
                ExtractionResult::Structured(found) => assert_eq!(found, record),
                other => panic!("expected structured result, got {other:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn concrete_fox_scenario() -> anyhow::Result<()> {
        let source = solid_jpeg(100, 100, [200, 30, 30]);
        let record = GenerationRecord {
            model: GenerationModel::FastEdit,
            prompt: "[{\"text\":\"a red fox\"}]".to_string(),
            original_prompt: None,
            aspect_ratio: None,
            prompt_mode: Some(PromptMode::Structured),
            filename_slug: None,
        };
        let embedded = embed(&source, &record)?;
        let ExtractionResult::Structured(found) = extract_bytes(&embedded.bytes) else {
            panic!("expected structured result");
        };
        let parts = prompt::parse_parts(&found.prompt).expect("parts array");
        assert_eq!(parts, vec![prompt::PromptPart::text("a red fox")]);
        Ok(())
    }

    #[test]
    fn png_input_is_normalized_to_jpeg() -> anyhow::Result<()> {
        let record = GenerationRecord::new(GenerationModel::FastEdit, "a fox");
        let embedded = embed(&solid_png(32, 32), &record)?;
        assert_eq!(&embedded.bytes[..2], &[0xFF, 0xD8], "JPEG SOI marker");
        assert!(matches!(
            extract_bytes(&embedded.bytes),
            ExtractionResult::Structured(_)
        ));
        Ok(())
    }

    #[test]
    fn undecodable_input_is_a_hard_error() {
        let record = GenerationRecord::new(GenerationModel::FastEdit, "a fox");
        assert!(embed(b"definitely not an image", &record).is_err());
    }

    #[test]
    fn extraction_never_fails_on_garbage() {
        assert_eq!(extract_bytes(b""), ExtractionResult::NotFound);
        assert_eq!(extract_bytes(b"plain text"), ExtractionResult::NotFound);
        // Valid JPEG, no EXIF segment.
        assert_eq!(
            extract_bytes(&solid_jpeg(16, 16, [0, 0, 0])),
            ExtractionResult::NotFound
        );
        // Valid PNG, no eXIf chunk.
        assert_eq!(extract_bytes(&solid_png(16, 16)), ExtractionResult::NotFound);
        // Truncated JPEG with an EXIF-ish prefix.
        let mut truncated = solid_jpeg(16, 16, [0, 0, 0]);
        truncated.truncate(8);
        assert_eq!(extract_bytes(&truncated), ExtractionResult::NotFound);
    }

    #[test]
    fn legacy_tags_come_back_as_strings() {
        let mut jpeg = solid_jpeg(32, 32, [1, 2, 3]);
        write_description_tag(&mut jpeg, "[{\"text\":\"pre-wrapper prompt\"}]")
            .expect("tag write");
        assert_eq!(
            extract_bytes(&jpeg),
            ExtractionResult::LegacyString("[{\"text\":\"pre-wrapper prompt\"}]".to_string())
        );

        let mut jpeg = solid_jpeg(32, 32, [1, 2, 3]);
        write_description_tag(&mut jpeg, "just words someone typed").expect("tag write");
        assert_eq!(
            extract_bytes(&jpeg),
            ExtractionResult::LegacyString("just words someone typed".to_string())
        );
    }

    #[test]
    fn data_url_front_end() -> anyhow::Result<()> {
        let record = GenerationRecord::new(GenerationModel::FastEdit, "a fox");
        let embedded = embed(&solid_jpeg(24, 24, [9, 9, 9]), &record)?;
        let url = to_data_url(&embedded.bytes);
        assert!(url.starts_with("data:image/jpeg;base64,"));
        assert!(matches!(extract(&url), ExtractionResult::Structured(_)));
        assert_eq!(extract("not a data url"), ExtractionResult::NotFound);
        assert_eq!(
            extract("data:image/jpeg;base64,@@@@"),
            ExtractionResult::NotFound
        );
        Ok(())
    }

    #[test]
    fn unicode_prompts_survive_the_tag() -> anyhow::Result<()> {
        let record = GenerationRecord::new(GenerationModel::FastEdit, "狐 über tout — émoji 🦊");
        let embedded = embed(&solid_jpeg(24, 24, [9, 9, 9]), &record)?;
        match extract_bytes(&embedded.bytes) {
            ExtractionResult::Structured(found) => {
                assert_eq!(found.prompt, "狐 über tout — émoji 🦊")
            }
            other => panic!("expected structured result, got {other:?}"),
        }
        Ok(())
    }
}
