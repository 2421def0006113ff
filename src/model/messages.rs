//! Chat messages exchanged with the model
//!
//! A message is a role plus one or more segments; segments are either text or
//! an embedded image. Oversized images are downscaled before embedding so a
//! single screenshot cannot blow the prompt budget.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// One part of a chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSegment {
    Text { text: String },
    /// Base64-encoded image payload
    Image { mime: String, data: String },
}

impl MessageSegment {
    pub fn text(text: impl Into<String>) -> Self {
        MessageSegment::Text { text: text.into() }
    }

    pub fn image(mime: impl Into<String>, bytes: &[u8]) -> Self {
        MessageSegment::Image {
            mime: mime.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            MessageSegment::Text { text } => text.chars().count(),
            MessageSegment::Image { data, .. } => data.len(),
        }
    }
}

/// A message in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub segments: Vec<MessageSegment>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            segments: vec![MessageSegment::text(content)],
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            segments: vec![MessageSegment::text(content)],
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            segments: vec![MessageSegment::text(content)],
        }
    }

    pub fn user_parts(segments: Vec<MessageSegment>) -> Self {
        Self {
            role: "user".to_string(),
            segments,
        }
    }

    /// Concatenated text of all text segments.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            if let MessageSegment::Text { text } = segment {
                out.push_str(text);
            }
        }
        out
    }

    pub fn has_images(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, MessageSegment::Image { .. }))
    }
}

/// Largest raw image embedded without re-encoding, in bytes.
pub const IMAGE_EMBED_LIMIT: usize = 512 * 1024;
/// Longest edge after downscaling an oversized image.
const DOWNSCALE_MAX_DIM: u32 = 1024;

/// Fit an image for prompt embedding.
///
/// Images under the byte limit pass through untouched. Oversized ones are
/// decoded, downscaled to `DOWNSCALE_MAX_DIM` on the longest edge and
/// re-encoded as JPEG. Undecodable payloads pass through unchanged - the
/// model endpoint is the final arbiter of what it accepts.
pub fn fit_image(bytes: &[u8]) -> (Vec<u8>, &'static str) {
    if bytes.len() <= IMAGE_EMBED_LIMIT {
        return (bytes.to_vec(), "image/png");
    }
    let decoded = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(_) => return (bytes.to_vec(), "image/png"),
    };
    let scaled = decoded.thumbnail(DOWNSCALE_MAX_DIM, DOWNSCALE_MAX_DIM);
    let mut out = std::io::Cursor::new(Vec::new());
    if scaled
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .is_err()
    {
        return (bytes.to_vec(), "image/png");
    }
    (out.into_inner(), "image/jpeg")
}
