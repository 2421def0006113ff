//! Model reply and sandbox output parsing
//!
//! Model replies carry an optional chain-of-thought wrapper and usually a
//! fenced code block; sandbox multimodal output carries inline images between
//! a fixed delimiter pair.

use base64::Engine as _;

use crate::model::MessageSegment;

/// Delimiters wrapping inline base64 images in multimodal sandbox output.
pub const MEDIA_OPEN: &str = "<|media|>";
pub const MEDIA_CLOSE: &str = "<|/media|>";

/// A model reply split into its reasoning and code segments.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub reasoning: Option<String>,
    pub code: String,
}

/// Split a raw model reply into reasoning and code.
///
/// A leading `<think>...</think>` wrapper becomes the reasoning segment. The
/// code is the first fenced block in the remainder; without a fence the whole
/// remainder is taken as code.
pub fn parse_model_reply(raw: &str) -> ParsedReply {
    let (reasoning, rest) = split_reasoning(raw);
    let code = extract_code_block(rest).unwrap_or_else(|| rest.trim().to_string());
    ParsedReply { reasoning, code }
}

fn split_reasoning(raw: &str) -> (Option<String>, &str) {
    let trimmed = raw.trim_start();
    if let Some(body) = trimmed.strip_prefix("<think>") {
        if let Some(end) = body.find("</think>") {
            let reasoning = body[..end].trim();
            let rest = &body[end + "</think>".len()..];
            let reasoning = if reasoning.is_empty() {
                None
            } else {
                Some(reasoning.to_string())
            };
            return (reasoning, rest);
        }
    }
    (None, raw)
}

/// First fenced code block in the text, with any language tag discarded.
fn extract_code_block(text: &str) -> Option<String> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // skip the language tag up to the end of the fence line
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim_end().to_string())
}

/// Split multimodal sandbox output into text and image segments.
///
/// Malformed image blocks (unterminated delimiter, undecodable base64) fall
/// back to plain text so a misbehaving script never loses its output.
pub fn parse_multimodal_output(raw: &str) -> Vec<MessageSegment> {
    let mut segments = Vec::new();
    let mut rest = raw;
    loop {
        match rest.find(MEDIA_OPEN) {
            None => break,
            Some(open) => {
                let after = &rest[open + MEDIA_OPEN.len()..];
                let Some(close) = after.find(MEDIA_CLOSE) else {
                    break;
                };
                let encoded = after[..close].trim();
                match base64::engine::general_purpose::STANDARD.decode(encoded) {
                    Ok(bytes) => {
                        let before = &rest[..open];
                        if !before.trim().is_empty() {
                            segments.push(MessageSegment::text(before.trim()));
                        }
                        segments.push(MessageSegment::image("image/png", &bytes));
                        rest = &after[close + MEDIA_CLOSE.len()..];
                    }
                    Err(_) => {
                        let before = &rest[..open + MEDIA_OPEN.len() + close + MEDIA_CLOSE.len()];
                        if !before.trim().is_empty() {
                            segments.push(MessageSegment::text(before.trim()));
                        }
                        rest = &after[close + MEDIA_CLOSE.len()..];
                    }
                }
            }
        }
    }
    if !rest.trim().is_empty() {
        segments.push(MessageSegment::text(rest.trim()));
    }
    if segments.is_empty() {
        segments.push(MessageSegment::text(""));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_with_language_tag() {
        let raw = "Here you go:\n```python\nprint('hi')\n```\nDone.";
        let parsed = parse_model_reply(raw);
        assert_eq!(parsed.code, "print('hi')");
        assert!(parsed.reasoning.is_none());
    }

    #[test]
    fn think_wrapper_becomes_reasoning() {
        let raw = "<think>need to greet</think>\n```python\nprint('hi')\n```";
        let parsed = parse_model_reply(raw);
        assert_eq!(parsed.reasoning.as_deref(), Some("need to greet"));
        assert_eq!(parsed.code, "print('hi')");
    }

    #[test]
    fn no_fence_falls_back_to_whole_text() {
        let parsed = parse_model_reply("print('bare')");
        assert_eq!(parsed.code, "print('bare')");
    }

    #[test]
    fn unterminated_think_is_kept_as_code() {
        let parsed = parse_model_reply("<think>never closed\nprint('x')");
        assert!(parsed.reasoning.is_none());
        assert!(parsed.code.contains("<think>"));
    }

    #[test]
    fn only_first_fence_is_taken() {
        let raw = "```python\nfirst\n```\ntext\n```python\nsecond\n```";
        assert_eq!(parse_model_reply(raw).code, "first");
    }

    #[test]
    fn multimodal_splits_text_and_images() {
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"img-bytes");
        let raw = format!("caption {}{}{} tail", MEDIA_OPEN, b64, MEDIA_CLOSE);
        let segments = parse_multimodal_output(&raw);
        assert_eq!(segments.len(), 3);
        assert!(matches!(&segments[0], MessageSegment::Text { text } if text == "caption"));
        assert!(matches!(&segments[1], MessageSegment::Image { .. }));
        assert!(matches!(&segments[2], MessageSegment::Text { text } if text == "tail"));
    }

    #[test]
    fn unterminated_media_block_stays_text() {
        let raw = format!("some text {}abcdef", MEDIA_OPEN);
        let segments = parse_multimodal_output(&raw);
        assert_eq!(segments.len(), 1);
        assert!(matches!(&segments[0], MessageSegment::Text { text } if text.contains(MEDIA_OPEN)));
    }

    #[test]
    fn undecodable_media_block_stays_text() {
        let raw = format!("{}not base64!!{}", MEDIA_OPEN, MEDIA_CLOSE);
        let segments = parse_multimodal_output(&raw);
        assert!(matches!(&segments[0], MessageSegment::Text { .. }));
    }
}
