//! OpenAI image generation/edit requests to Gemini content parts, and back.

use aigate_protocol::gemini::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, ImageConfig, Part,
};
use aigate_protocol::openai::{ImageData, ImageGenerationRequest, ImagesResponse, InputImage};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::ConvertError;

/// Aspect ratios the image models accept, as `(label, width, height)`.
pub const SUPPORTED_ASPECT_RATIOS: [(&str, u32, u32); 10] = [
    ("1:1", 1, 1),
    ("2:3", 2, 3),
    ("3:2", 3, 2),
    ("3:4", 3, 4),
    ("4:3", 4, 3),
    ("4:5", 4, 5),
    ("5:4", 5, 4),
    ("9:16", 9, 16),
    ("16:9", 16, 9),
    ("21:9", 21, 9),
];

pub fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.trim().to_ascii_lowercase().split_once('x').map(|(w, h)| {
        (w.trim().parse::<u32>(), h.trim().parse::<u32>())
    })?;
    match (w, h) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => Some((w, h)),
        _ => None,
    }
}

/// Closest supported ratio, compared in log space so 2:1 and 1:2 are
/// equally far from 1:1.
pub fn closest_aspect_ratio(width: u32, height: u32) -> &'static str {
    let target = (width as f64 / height as f64).ln();
    SUPPORTED_ASPECT_RATIOS
        .iter()
        .map(|(label, w, h)| (*label, ((*w as f64 / *h as f64).ln() - target).abs()))
        .fold(("1:1", f64::INFINITY), |best, candidate| {
            if candidate.1 < best.1 { candidate } else { best }
        })
        .0
}

/// Output resolution tier from the requested size, or from quality when the
/// size is absent or `auto`.
pub fn image_size_tier(size: Option<&str>, quality: Option<&str>) -> &'static str {
    if let Some((w, h)) = size.and_then(parse_size) {
        return match w.max(h) {
            0..=1536 => "1K",
            1537..=3072 => "2K",
            _ => "4K",
        };
    }
    match quality.map(str::to_ascii_lowercase).as_deref() {
        Some("hd" | "high") => "2K",
        _ => "1K",
    }
}

pub fn image_request_to_gemini(
    req: &ImageGenerationRequest,
    images: &[InputImage],
) -> Result<GenerateContentRequest, ConvertError> {
    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return Err(ConvertError::EmptyPrompt);
    }

    let mut parts: Vec<Part> = images
        .iter()
        .map(|image| Part::inline(image.mime_type.clone(), STANDARD.encode(&image.data)))
        .collect();
    parts.push(Part::text(prompt));

    let aspect_ratio = req
        .size
        .as_deref()
        .and_then(parse_size)
        .map(|(w, h)| closest_aspect_ratio(w, h).to_string());

    Ok(GenerateContentRequest {
        contents: vec![Content {
            role: Some("user".to_string()),
            parts,
        }],
        generation_config: Some(GenerationConfig {
            response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
            candidate_count: req.n.filter(|n| *n > 1),
            image_config: Some(ImageConfig {
                aspect_ratio,
                image_size: Some(
                    image_size_tier(req.size.as_deref(), req.quality.as_deref()).to_string(),
                ),
            }),
        }),
    })
}

pub fn gemini_to_images(resp: GenerateContentResponse, created: i64) -> ImagesResponse {
    let mut data = Vec::new();
    for candidate in resp.candidates {
        let Some(content) = candidate.content else {
            continue;
        };
        let revised_prompt = content
            .parts
            .iter()
            .filter(|part| part.thought != Some(true))
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        for part in content.parts {
            if let Some(inline) = part.inline_data {
                data.push(ImageData {
                    b64_json: Some(inline.data),
                    url: None,
                    revised_prompt: (!revised_prompt.is_empty()).then(|| revised_prompt.clone()),
                });
            }
        }
    }
    ImagesResponse { created, data }
}
