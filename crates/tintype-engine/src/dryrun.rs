use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::backend::{
    BackendError, GenerationBackend, ImageGenRequest, RefineRequest, TextStream, VideoProgress,
    VideoRequest, VideoStream,
};

/// Fully local backend: solid-color JPEGs keyed on the prompt hash, echoing
/// text streams, and an immediately completing video. Keeps the studio usable
/// offline and gives tests real image bytes to round-trip metadata through.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunBackend;

impl DryRunBackend {
    fn color_for(prompt: &str) -> Rgb<u8> {
        let digest = Sha256::digest(prompt.as_bytes());
        Rgb([digest[0], digest[1], digest[2]])
    }

    fn solid_jpeg(width: u32, height: u32, color: Rgb<u8>) -> Result<Vec<u8>, BackendError> {
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = color;
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .map_err(|err| BackendError::NoOutput(err.to_string()))?;
        Ok(bytes)
    }
}

impl GenerationBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_images(&self, request: &ImageGenRequest<'_>) -> Result<Vec<Vec<u8>>, BackendError> {
        if request.prompt.trim().is_empty() {
            return Err(BackendError::MalformedInput("prompt is empty".to_string()));
        }
        // Quarter-size render keeps dry-run output cheap.
        let (width, height) = request
            .aspect_ratio
            .map(|ratio| ratio.dimensions())
            .unwrap_or((400, 400));
        let (width, height) = ((width / 4).max(1), (height / 4).max(1));
        let color = Self::color_for(request.prompt);
        (0..request.count.max(1))
            .map(|_| Self::solid_jpeg(width, height, color))
            .collect()
    }

    fn refine_image(&self, request: &RefineRequest<'_>) -> Result<Vec<u8>, BackendError> {
        if request.reference_image.is_empty() {
            return Err(BackendError::MalformedInput(
                "reference image is empty".to_string(),
            ));
        }
        Self::solid_jpeg(100, 100, Self::color_for(request.prompt))
    }

    fn describe_image(&self, image: &[u8]) -> TextStream {
        let note = format!("A solid color study ({} bytes).", image.len());
        Box::new(
            ["An abstract field of color. ".to_string(), note]
                .into_iter()
                .map(Ok),
        )
    }

    fn ground_prompt(&self, user_text: &str) -> TextStream {
        let chunks = vec![
            Ok(user_text.to_string()),
            Ok(", rendered with documentary-grade detail".to_string()),
        ];
        Box::new(chunks.into_iter())
    }

    fn generate_video(&self, request: &VideoRequest<'_>) -> VideoStream {
        let digest = Sha256::digest(request.prompt.as_bytes());
        let url = format!("dryrun://video/{}", hex::encode(&digest[..4]));
        Box::new(
            vec![
                Ok(VideoProgress::progress("Queued")),
                Ok(VideoProgress::progress("Rendering")),
                Ok(VideoProgress::completed(url)),
            ]
            .into_iter(),
        )
    }

    fn summarize_for_filename(&self, prompt: &str) -> Result<String, BackendError> {
        Ok(prompt
            .split_whitespace()
            .take(5)
            .collect::<Vec<&str>>()
            .join(" "))
    }
}

#[cfg(test)]
mod tests {
    use tintype_contracts::models::{AspectRatio, GenerationModel};

    use super::*;

    #[test]
    fn images_are_deterministic_per_prompt() -> Result<(), BackendError> {
        let backend = DryRunBackend;
        let request = ImageGenRequest {
            prompt: "a red fox",
            model: GenerationModel::FastEdit,
            aspect_ratio: None,
            reference_images: &[],
            count: 2,
        };
        let first = backend.generate_images(&request)?;
        let second = backend.generate_images(&request)?;
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(&first[0][..2], &[0xFF, 0xD8], "JPEG SOI marker");
        Ok(())
    }

    #[test]
    fn aspect_ratio_changes_dimensions() -> Result<(), BackendError> {
        let backend = DryRunBackend;
        let request = ImageGenRequest {
            prompt: "a lighthouse",
            model: GenerationModel::HighQuality,
            aspect_ratio: Some(AspectRatio::Widescreen),
            reference_images: &[],
            count: 1,
        };
        let images = backend.generate_images(&request)?;
        let decoded = image::load_from_memory(&images[0]).expect("decodable");
        assert!(decoded.width() > decoded.height());
        Ok(())
    }

    #[test]
    fn empty_prompt_is_malformed_input() {
        let backend = DryRunBackend;
        let request = ImageGenRequest {
            prompt: "   ",
            model: GenerationModel::FastEdit,
            aspect_ratio: None,
            reference_images: &[],
            count: 1,
        };
        assert!(matches!(
            backend.generate_images(&request),
            Err(BackendError::MalformedInput(_))
        ));
    }

    #[test]
    fn video_stream_ends_with_completion() {
        let backend = DryRunBackend;
        let request = VideoRequest {
            prompt: "a fox",
            resolution: "720p",
            aspect_ratio: None,
        };
        let events: Vec<VideoProgress> = backend
            .generate_video(&request)
            .collect::<Result<Vec<VideoProgress>, BackendError>>()
            .expect("no errors");
        assert!(events.len() >= 2);
        assert!(events.last().expect("terminal").is_terminal());
        assert!(events[..events.len() - 1].iter().all(|e| !e.is_terminal()));
    }
}
