//! Per-session chat history
//!
//! Holds recent inbound messages per session and renders a bounded slice of
//! them for prompt construction. Bounds are count, age, total characters and
//! image count; whichever bites first wins.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::model::{fit_image, ChatMessage, MessageSegment};

/// A chat message received from the outside world.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub sender: String,
    pub text: String,
    /// Raw image payloads attached to the message
    pub images: Vec<Vec<u8>>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text_only(id: impl Into<String>, sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            text: text.into(),
            images: Vec::new(),
            received_at: Utc::now(),
        }
    }
}

/// Rendering bounds for one history slice.
#[derive(Debug, Clone)]
pub struct HistoryBounds {
    pub max_messages: usize,
    pub max_age: Duration,
    pub char_budget: usize,
    pub max_images: usize,
}

/// In-memory message history, keyed by session.
pub struct SessionHistory {
    sessions: Mutex<HashMap<String, Vec<InboundMessage>>>,
    retain: usize,
}

impl SessionHistory {
    /// `retain` caps how many messages are kept per session regardless of
    /// rendering bounds.
    pub fn new(retain: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            retain,
        }
    }

    pub fn record(&self, session_key: &str, message: InboundMessage) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let entries = sessions.entry(session_key.to_string()).or_default();
        entries.push(message);
        if entries.len() > self.retain {
            let excess = entries.len() - self.retain;
            entries.drain(..excess);
        }
    }

    /// Render the newest messages within the bounds as a user chat message.
    ///
    /// Messages are walked newest-first until a bound is hit, then emitted
    /// oldest-first. Images only survive when `allow_images` is set and the
    /// image cap has room; otherwise a textual placeholder stands in.
    pub fn render(
        &self,
        session_key: &str,
        bounds: &HistoryBounds,
        allow_images: bool,
    ) -> ChatMessage {
        self.render_since(session_key, bounds, allow_images, DateTime::<Utc>::MIN_UTC)
    }

    /// Like [`render`](Self::render) but only messages received after `since`,
    /// for appending history that arrived mid-turn.
    pub fn render_since(
        &self,
        session_key: &str,
        bounds: &HistoryBounds,
        allow_images: bool,
        since: DateTime<Utc>,
    ) -> ChatMessage {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let entries = match sessions.get(session_key) {
            Some(e) => e,
            None => return ChatMessage::user(String::new()),
        };

        let cutoff = std::cmp::max(Utc::now() - bounds.max_age, since);
        let mut chars_used = 0usize;
        let mut picked: Vec<&InboundMessage> = Vec::new();
        for msg in entries.iter().rev() {
            if picked.len() >= bounds.max_messages || msg.received_at < cutoff {
                break;
            }
            let line_len = msg.sender.chars().count() + msg.text.chars().count() + 4;
            if chars_used + line_len > bounds.char_budget && !picked.is_empty() {
                break;
            }
            chars_used += line_len;
            picked.push(msg);
        }
        picked.reverse();

        let mut images_used = 0usize;
        let mut segments: Vec<MessageSegment> = Vec::new();
        let mut text = String::new();
        for msg in &picked {
            text.push_str(&format!("[{}]: {}\n", msg.sender, msg.text));
            for raw in &msg.images {
                if allow_images && images_used < bounds.max_images {
                    images_used += 1;
                    if !text.is_empty() {
                        segments.push(MessageSegment::text(std::mem::take(&mut text)));
                    }
                    let (bytes, mime) = fit_image(raw);
                    segments.push(MessageSegment::image(mime, &bytes));
                } else {
                    text.push_str("[image attached]\n");
                }
            }
        }
        if !text.is_empty() {
            segments.push(MessageSegment::text(text));
        }
        if segments.is_empty() {
            return ChatMessage::user(String::new());
        }
        ChatMessage::user_parts(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> HistoryBounds {
        HistoryBounds {
            max_messages: 3,
            max_age: Duration::hours(6),
            char_budget: 10_000,
            max_images: 2,
        }
    }

    #[test]
    fn renders_newest_messages_oldest_first() {
        let history = SessionHistory::new(32);
        for i in 0..5 {
            history.record("s", InboundMessage::text_only(i.to_string(), "alice", format!("m{}", i)));
        }
        let rendered = history.render("s", &bounds(), false).text();
        assert!(!rendered.contains("m0"));
        assert!(!rendered.contains("m1"));
        let pos2 = rendered.find("m2").unwrap();
        let pos4 = rendered.find("m4").unwrap();
        assert!(pos2 < pos4);
    }

    #[test]
    fn char_budget_trims_older_messages() {
        let history = SessionHistory::new(32);
        history.record("s", InboundMessage::text_only("1", "a", "x".repeat(100)));
        history.record("s", InboundMessage::text_only("2", "a", "newest"));
        let tight = HistoryBounds {
            char_budget: 20,
            ..bounds()
        };
        let rendered = history.render("s", &tight, false).text();
        assert!(rendered.contains("newest"));
        assert!(!rendered.contains("xxxxx"));
    }

    #[test]
    fn stale_messages_age_out() {
        let history = SessionHistory::new(32);
        let mut old = InboundMessage::text_only("1", "a", "ancient");
        old.received_at = Utc::now() - Duration::days(2);
        history.record("s", old);
        history.record("s", InboundMessage::text_only("2", "a", "fresh"));
        let rendered = history.render("s", &bounds(), false).text();
        assert!(rendered.contains("fresh"));
        assert!(!rendered.contains("ancient"));
    }

    #[test]
    fn images_become_placeholders_without_vision() {
        let history = SessionHistory::new(32);
        let mut msg = InboundMessage::text_only("1", "a", "look");
        msg.images.push(vec![1, 2, 3]);
        history.record("s", msg);
        let rendered = history.render("s", &bounds(), false);
        assert!(!rendered.has_images());
        assert!(rendered.text().contains("[image attached]"));
    }

    #[test]
    fn image_cap_enforced_with_vision() {
        let history = SessionHistory::new(32);
        let mut msg = InboundMessage::text_only("1", "a", "look");
        msg.images = vec![vec![1], vec![2], vec![3]];
        history.record("s", msg);
        let rendered = history.render("s", &bounds(), true);
        let images = rendered
            .segments
            .iter()
            .filter(|s| matches!(s, MessageSegment::Image { .. }))
            .count();
        assert_eq!(images, 2);
        assert!(rendered.text().contains("[image attached]"));
    }

    #[test]
    fn retention_cap_drops_oldest() {
        let history = SessionHistory::new(2);
        for i in 0..4 {
            history.record("s", InboundMessage::text_only(i.to_string(), "a", format!("m{}", i)));
        }
        let rendered = history.render("s", &bounds(), false).text();
        assert!(!rendered.contains("m1"));
        assert!(rendered.contains("m3"));
    }
}
