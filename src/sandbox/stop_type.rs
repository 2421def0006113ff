//! Terminal stop types and the sentinel protocol
//!
//! A sandbox run ends in exactly one [`ExecStopType`]. The container-side
//! pipeline reports its outcome by echoing one sentinel string to stdout
//! immediately before exiting; the host learns the outcome only by scraping
//! that sentinel back out of the combined output. The scraping is fragile by
//! nature (the string must not appear earlier in the output), so everything
//! about it lives here behind [`strip_sentinel`].

use serde::{Deserialize, Serialize};

/// The classified terminal reason a sandbox run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStopType {
    /// Code ran to completion (exit 0)
    Normal,
    /// Non-zero exit, missing sentinel, or infrastructure-visible failure of the code
    Error,
    /// Wall-clock limit hit; container was killed
    Timeout,
    /// Code stopped early after a capability direct-response (exit 8)
    Agent,
    /// Like `Agent`, but the response carries text+image parts (exit 11)
    MultimodalAgent,
    /// Code requested manual stop (exit 9)
    Manual,
    /// Generated code leaked the trust token; never ran
    Security,
}

/// Sentinel echoed for exit 0
pub const SENTINEL_NORMAL: &str = "<|sandbox.stop:normal|>";
/// Sentinel echoed for any unmapped exit code
pub const SENTINEL_ERROR: &str = "<|sandbox.stop:error|>";
/// Never echoed by the pipeline; timeouts are detected host-side
pub const SENTINEL_TIMEOUT: &str = "<|sandbox.stop:timeout|>";
/// Sentinel echoed for exit 8
pub const SENTINEL_AGENT: &str = "<|sandbox.stop:agent|>";
/// Sentinel echoed for exit 11
pub const SENTINEL_MULTIMODAL: &str = "<|sandbox.stop:multimodal|>";
/// Sentinel echoed for exit 9
pub const SENTINEL_MANUAL: &str = "<|sandbox.stop:manual|>";
/// Produced host-side by the trust-token pre-check, never echoed
pub const SENTINEL_SECURITY: &str = "<|sandbox.stop:security|>";

impl ExecStopType {
    /// `Normal`, `Agent` and `MultimodalAgent` count as success for records.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ExecStopType::Normal | ExecStopType::Agent | ExecStopType::MultimodalAgent
        )
    }

    /// Stable lowercase name, used as a metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStopType::Normal => "normal",
            ExecStopType::Error => "error",
            ExecStopType::Timeout => "timeout",
            ExecStopType::Agent => "agent",
            ExecStopType::MultimodalAgent => "multimodal_agent",
            ExecStopType::Manual => "manual",
            ExecStopType::Security => "security",
        }
    }

    /// The sentinel string that reports this stop type.
    pub fn sentinel(&self) -> &'static str {
        match self {
            ExecStopType::Normal => SENTINEL_NORMAL,
            ExecStopType::Error => SENTINEL_ERROR,
            ExecStopType::Timeout => SENTINEL_TIMEOUT,
            ExecStopType::Agent => SENTINEL_AGENT,
            ExecStopType::MultimodalAgent => SENTINEL_MULTIMODAL,
            ExecStopType::Manual => SENTINEL_MANUAL,
            ExecStopType::Security => SENTINEL_SECURITY,
        }
    }

    /// The in-container exit-code mapping. Total: every code maps somewhere.
    pub fn from_exit_code(code: i64) -> Self {
        match code {
            0 => ExecStopType::Normal,
            8 => ExecStopType::Agent,
            9 => ExecStopType::Manual,
            11 => ExecStopType::MultimodalAgent,
            _ => ExecStopType::Error,
        }
    }
}

/// Sentinels that can actually appear in container output, in no particular
/// priority; the earliest occurrence in the stream wins.
const SCRAPEABLE: [(ExecStopType, &str); 5] = [
    (ExecStopType::Normal, SENTINEL_NORMAL),
    (ExecStopType::Error, SENTINEL_ERROR),
    (ExecStopType::Agent, SENTINEL_AGENT),
    (ExecStopType::MultimodalAgent, SENTINEL_MULTIMODAL),
    (ExecStopType::Manual, SENTINEL_MANUAL),
];

/// Locate and strip exactly one sentinel from the combined output.
///
/// Returns the output with that single occurrence removed and the stop type
/// it encodes; `None` when no sentinel is present (the caller defaults to
/// `Error`). When several sentinels appear, the one at the earliest byte
/// offset decides - user output that quotes a sentinel therefore shadows the
/// real one, a compatibility quirk the tests pin down.
pub fn strip_sentinel(raw: &str) -> (String, Option<ExecStopType>) {
    let mut earliest: Option<(usize, ExecStopType, &str)> = None;
    for (stop, sentinel) in SCRAPEABLE {
        if let Some(idx) = raw.find(sentinel) {
            if earliest.map_or(true, |(best, _, _)| idx < best) {
                earliest = Some((idx, stop, sentinel));
            }
        }
    }
    match earliest {
        Some((idx, stop, sentinel)) => {
            let mut out = String::with_capacity(raw.len() - sentinel.len());
            out.push_str(&raw[..idx]);
            out.push_str(&raw[idx + sentinel.len()..]);
            (out, Some(stop))
        }
        None => (raw.to_string(), None),
    }
}

/// Cap `text` to `cap` characters, eliding the tail with a placeholder that
/// states how many characters were dropped. The result never exceeds `cap`
/// characters and re-truncating an already-truncated string is a no-op.
pub fn truncate_output(text: &str, cap: usize) -> String {
    let total = text.chars().count();
    if total <= cap {
        return text.to_string();
    }

    // Two passes because the placeholder length depends on the elided count.
    let mut kept = cap.saturating_sub(elision_note(total).chars().count());
    let mut note = elision_note(total - kept);
    // The digit count can shrink once `kept` is fixed; recompute to be exact.
    kept = cap.saturating_sub(note.chars().count());
    note = elision_note(total - kept);

    let mut out: String = text.chars().take(kept).collect();
    out.push_str(&note);
    if out.chars().count() > cap {
        // cap smaller than the placeholder itself; hard cut
        out = text.chars().take(cap).collect();
    }
    out
}

fn elision_note(elided: usize) -> String {
    format!("\n...[{} characters elided]", elided)
}
